//! Registry schema and statements (PostgreSQL dialect)
//!
//! ```text
//! <schema>.changes  one row per deployed (module, change)
//! <schema>.events   append-only deploy/revert/fail audit trail
//! ```
//!
//! The schema name comes from validated configuration and is interpolated
//! as an identifier; every value goes through bind parameters.

use sqlpack_core::advisory_key;

/// Advisory lock key serializing registry creation
pub fn lock_key(schema: &str) -> i64 {
    advisory_key("registry", schema)
}

/// Idempotent DDL for the registry schema
pub fn ensure_sql(schema: &str) -> String {
    format!(
        "CREATE SCHEMA IF NOT EXISTS {schema};

CREATE TABLE IF NOT EXISTS {schema}.changes (
    module       TEXT        NOT NULL,
    change_name  TEXT        NOT NULL,
    script_hash  TEXT        NOT NULL,
    deployed_at  TIMESTAMPTZ NOT NULL DEFAULT clock_timestamp(),
    deployed_by  TEXT        NOT NULL DEFAULT current_user,
    PRIMARY KEY (module, change_name)
);

CREATE TABLE IF NOT EXISTS {schema}.events (
    id           BIGSERIAL   PRIMARY KEY,
    event        TEXT        NOT NULL CHECK (event IN ('deploy', 'revert', 'fail')),
    module       TEXT        NOT NULL,
    change_name  TEXT        NOT NULL,
    script_hash  TEXT,
    occurred_at  TIMESTAMPTZ NOT NULL DEFAULT clock_timestamp(),
    occurred_by  TEXT        NOT NULL DEFAULT current_user
);",
        schema = schema
    )
}

pub fn select_entries_sql(schema: &str) -> String {
    format!(
        "SELECT module, change_name, script_hash, deployed_at, deployed_by \
         FROM {}.changes ORDER BY deployed_at, module, change_name",
        schema
    )
}

pub fn insert_entry_sql(schema: &str) -> String {
    format!(
        "INSERT INTO {}.changes (module, change_name, script_hash) VALUES ($1, $2, $3)",
        schema
    )
}

pub fn delete_entry_sql(schema: &str) -> String {
    format!(
        "DELETE FROM {}.changes WHERE module = $1 AND change_name = $2 RETURNING script_hash",
        schema
    )
}

pub fn insert_event_sql(schema: &str) -> String {
    format!(
        "INSERT INTO {}.events (event, module, change_name, script_hash) VALUES ($1, $2, $3, $4)",
        schema
    )
}

pub fn select_events_sql(schema: &str) -> String {
    format!(
        "SELECT id, event, module, change_name, script_hash, occurred_at, occurred_by \
         FROM {}.events ORDER BY id",
        schema
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ddl_is_idempotent_and_uses_schema() {
        let sql = ensure_sql("deploy_meta");
        assert!(sql.contains("CREATE SCHEMA IF NOT EXISTS deploy_meta;"));
        assert!(sql.contains("CREATE TABLE IF NOT EXISTS deploy_meta.changes"));
        assert!(sql.contains("PRIMARY KEY (module, change_name)"));
        assert!(sql.contains("CREATE TABLE IF NOT EXISTS deploy_meta.events"));
    }

    #[test]
    fn statements_bind_values() {
        assert_eq!(
            delete_entry_sql("sqlpack_registry"),
            "DELETE FROM sqlpack_registry.changes WHERE module = $1 AND change_name = $2 RETURNING script_hash"
        );
        assert!(insert_entry_sql("r").contains("VALUES ($1, $2, $3)"));
        assert!(select_events_sql("r").ends_with("ORDER BY id"));
    }

    #[test]
    fn lock_key_depends_on_schema() {
        assert_ne!(lock_key("a"), lock_key("b"));
        assert_eq!(lock_key("a"), lock_key("a"));
    }
}
