//! External SQL session runner
//!
//! Scripts are piped to `psql -X -q -v ON_ERROR_STOP=1 --single-transaction -f -`.
//! The exit status is the only success signal: PostgreSQL writes notices
//! and warnings to stderr, so stderr is kept for messages and never
//! inspected to decide failure. The child is killed if the future running
//! it is dropped, which rolls back its single transaction.

use crate::target::{ExecError, SessionOutput};
use sqlpack_core::ConnectionConfig;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Stop on the first error and run the whole script as one transaction
const PSQL_ARGS: &[&str] = &["-X", "-q", "-v", "ON_ERROR_STOP=1", "--single-transaction", "-f", "-"];

/// Runs scripts through an external `psql` process
#[derive(Debug, Clone)]
pub struct PsqlRunner {
    program: String,
    env: Vec<(&'static str, String)>,
}

impl PsqlRunner {
    /// Runner connecting with the given settings through libpq environment variables
    pub fn new(program: impl Into<String>, connection: &ConnectionConfig) -> Self {
        Self {
            program: program.into(),
            env: connection.libpq_env(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Run one script as a single transaction
    pub async fn run(&self, script: &str) -> Result<SessionOutput, ExecError> {
        let mut child = Command::new(&self.program)
            .args(PSQL_ARGS)
            .envs(self.env.iter().map(|(k, v)| (*k, v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecError::Spawn {
                program: self.program.clone(),
                message: e.to_string(),
            })?;

        // Feed stdin concurrently so a chatty child cannot block on a full pipe
        let stdin = child.stdin.take();
        let body = script.as_bytes().to_vec();
        let writer = tokio::spawn(async move {
            match stdin {
                Some(mut stdin) => {
                    stdin.write_all(&body).await?;
                    stdin.shutdown().await
                }
                None => Ok(()),
            }
        });

        let output = child.wait_with_output().await.map_err(|e| ExecError::Spawn {
            program: self.program.clone(),
            message: e.to_string(),
        })?;
        let written = writer.await;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if !output.status.success() {
            return Err(ExecError::Process {
                program: self.program.clone(),
                status: output.status.to_string(),
                stderr,
            });
        }

        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(ExecError::Spawn {
                    program: self.program.clone(),
                    message: format!("writing script to stdin: {}", e),
                })
            }
            Err(e) => {
                return Err(ExecError::Spawn {
                    program: self.program.clone(),
                    message: format!("stdin writer task failed: {}", e),
                })
            }
        }

        for line in stderr.lines().filter(|l| !l.trim().is_empty()) {
            tracing::warn!(target: "sqlpack::psql", "{}", line);
        }

        Ok(SessionOutput { stdout, stderr })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    fn fake_psql(dir: &Path, body: &str) -> String {
        let path = dir.join("fake-psql");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    #[tokio::test]
    async fn exit_status_decides_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let conn = ConnectionConfig::default();

        // Notices on stderr with a zero exit are a success
        let ok = fake_psql(
            dir.path(),
            "cat > /dev/null\necho 'NOTICE:  schema \"x\" already exists, skipping' >&2\nexit 0",
        );
        let output = PsqlRunner::new(ok, &conn).run("CREATE SCHEMA IF NOT EXISTS x;").await.unwrap();
        assert!(output.stderr.contains("NOTICE"));

        let failing_dir = tempfile::tempdir().unwrap();
        let failing = fake_psql(
            failing_dir.path(),
            "cat > /dev/null\necho 'ERROR:  relation \"otp\" does not exist' >&2\nexit 3",
        );
        let err = PsqlRunner::new(failing, &conn).run("SELECT * FROM otp;").await.unwrap_err();
        match err {
            ExecError::Process { stderr, .. } => assert!(stderr.contains("relation \"otp\" does not exist")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let runner = PsqlRunner::new("/nonexistent/psql", &ConnectionConfig::default());
        assert!(matches!(runner.run("SELECT 1;").await, Err(ExecError::Spawn { .. })));
    }

    #[tokio::test]
    async fn script_is_piped_to_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("received.sql");
        let program = fake_psql(dir.path(), &format!("cat > '{}'", out.display()));

        PsqlRunner::new(program, &ConnectionConfig::default())
            .run("CREATE TABLE t (id int);")
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(out).unwrap(), "CREATE TABLE t (id int);");
    }
}
