//! Idempotent role and role membership provisioning
//!
//! Each operation renders a single `DO` block that
//! 1. takes a transaction-scoped advisory lock keyed by the resource name,
//! 2. checks the catalog and skips the work if the resource exists,
//! 3. runs the statement inside an exception handler that treats
//!    `duplicate_object` / `unique_violation` as success.
//!
//! The lock narrows the race window between concurrent deployments; the
//! exception handler is what makes a lost race harmless.

use sqlpack_core::advisory_key;
use std::fmt;

/// Dollar-quote tag used for bootstrap blocks; inputs may not contain it
const BLOCK_TAG: &str = "$sqlpack_bootstrap$";

/// SQLSTATE raised for a role that does not exist
pub const UNDEFINED_OBJECT: &str = "42704";

/// What to do when a referenced role does not exist
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MissingRolePolicy {
    /// Fail the operation
    #[default]
    Error,

    /// Emit a notice and continue
    Notice,

    /// Continue silently
    Ignore,
}

impl fmt::Display for MissingRolePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Notice => write!(f, "notice"),
            Self::Ignore => write!(f, "ignore"),
        }
    }
}

impl std::str::FromStr for MissingRolePolicy {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "error" => Ok(Self::Error),
            "notice" | "warn" | "warning" => Ok(Self::Notice),
            "ignore" => Ok(Self::Ignore),
            other => Err(ProvisionError::InvalidInput(format!(
                "unknown missing-role policy '{}' (expected error, notice or ignore)",
                other
            ))),
        }
    }
}

/// Caller options shared by role and grant provisioning
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionOptions {
    pub on_missing_role: MissingRolePolicy,
}

impl ProvisionOptions {
    pub fn new(on_missing_role: MissingRolePolicy) -> Self {
        Self { on_missing_role }
    }
}

/// Role to create
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleSpec {
    pub name: String,
    pub password: Option<String>,
    pub login: bool,

    /// Existing roles the new role becomes a member of
    pub in_roles: Vec<String>,
}

impl RoleSpec {
    /// A login role with an optional password
    pub fn login(name: impl Into<String>, password: Option<String>) -> Self {
        Self {
            name: name.into(),
            password,
            login: true,
            in_roles: Vec::new(),
        }
    }

    /// A group role (NOLOGIN)
    pub fn group(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            password: None,
            login: false,
            in_roles: Vec::new(),
        }
    }

    pub fn with_in_roles(mut self, roles: Vec<String>) -> Self {
        self.in_roles = roles;
        self
    }
}

/// Membership of `member` in `role`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantSpec {
    pub role: String,
    pub member: String,
}

impl GrantSpec {
    pub fn new(role: impl Into<String>, member: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            member: member.into(),
        }
    }
}

/// Role/grant provisioning errors, classified by SQLSTATE where available
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProvisionError {
    #[error("failed to create role '{role}': {message}{}", .code.as_ref().map(|c| format!(" (SQLSTATE {})", c)).unwrap_or_default())]
    RoleCreateFailed {
        role: String,
        code: Option<String>,
        message: String,
    },

    #[error("failed to grant '{role}' to '{member}': {message}{}", .code.as_ref().map(|c| format!(" (SQLSTATE {})", c)).unwrap_or_default())]
    GrantFailed {
        role: String,
        member: String,
        code: Option<String>,
        message: String,
    },

    #[error("role does not exist: {0}")]
    MissingRole(String),

    #[error("invalid provisioning input: {0}")]
    InvalidInput(String),

    #[error("Connection failed: {0}")]
    Connection(String),
}

impl ProvisionError {
    /// Classify a failed role creation by SQLSTATE
    pub fn role_failed(role: &RoleSpec, code: Option<String>, message: String) -> Self {
        if code.as_deref() == Some(UNDEFINED_OBJECT) {
            return Self::MissingRole(message);
        }
        Self::RoleCreateFailed {
            role: role.name.clone(),
            code,
            message,
        }
    }

    /// Classify a failed grant by SQLSTATE
    pub fn grant_failed(grant: &GrantSpec, code: Option<String>, message: String) -> Self {
        if code.as_deref() == Some(UNDEFINED_OBJECT) {
            return Self::MissingRole(message);
        }
        Self::GrantFailed {
            role: grant.role.clone(),
            member: grant.member.clone(),
            code,
            message,
        }
    }
}

fn check_input(what: &str, value: &str) -> Result<(), ProvisionError> {
    if value.is_empty() {
        return Err(ProvisionError::InvalidInput(format!("{} must not be empty", what)));
    }
    if value.contains('\0') || value.contains(BLOCK_TAG) {
        return Err(ProvisionError::InvalidInput(format!("{} contains forbidden characters", what)));
    }
    Ok(())
}

fn check_role_name(name: &str) -> Result<(), ProvisionError> {
    check_input("role name", name)?;
    // NAMEDATALEN - 1
    if name.len() > 63 {
        return Err(ProvisionError::InvalidInput(format!(
            "role name '{}' is longer than 63 bytes",
            name
        )));
    }
    Ok(())
}

/// SQL string literal
fn literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Statement run for a missing role under the given policy
fn missing_role_action(policy: MissingRolePolicy, subject: &str) -> String {
    match policy {
        MissingRolePolicy::Error => "RAISE;".to_string(),
        MissingRolePolicy::Notice => format!(
            "RAISE NOTICE 'skipping {}: %', SQLERRM;",
            subject.replace('\'', "''").replace('%', "%%")
        ),
        MissingRolePolicy::Ignore => "NULL;".to_string(),
    }
}

/// Membership step shared by role and grant blocks
///
/// Runs in its own sub-transaction so a missing role only skips this grant.
fn membership_step(role: &str, member: &str, missing: &str) -> String {
    format!(
        "  IF NOT EXISTS (
    SELECT 1
    FROM pg_catalog.pg_auth_members am
    JOIN pg_catalog.pg_roles r ON r.oid = am.roleid
    JOIN pg_catalog.pg_roles m ON m.oid = am.member
    WHERE r.rolname = {role} AND m.rolname = {member}
  ) THEN
    BEGIN
      EXECUTE format('GRANT %I TO %I', {role}, {member});
    EXCEPTION
      WHEN duplicate_object OR unique_violation THEN
        NULL;
      WHEN undefined_object THEN
        {missing}
    END;
  END IF;
",
        role = literal(role),
        member = literal(member),
        missing = missing,
    )
}

/// Render the `DO` block creating a role and its memberships
///
/// Creation and each membership have separate exception scopes: a missing
/// parent role never undoes the `CREATE ROLE`, and memberships are checked
/// on every run, so parents added later are granted to an existing role.
pub fn role_sql(role: &RoleSpec, options: &ProvisionOptions) -> Result<String, ProvisionError> {
    check_role_name(&role.name)?;
    if let Some(password) = &role.password {
        check_input("password", password)?;
    }
    for parent in &role.in_roles {
        check_role_name(parent)?;
    }

    let login = if role.login { "LOGIN" } else { "NOLOGIN" };
    let create = match &role.password {
        Some(password) => format!(
            "EXECUTE format('CREATE ROLE %I WITH {} PASSWORD %L', {}, {})",
            login,
            literal(&role.name),
            literal(password)
        ),
        None => format!("EXECUTE format('CREATE ROLE %I WITH {}', {})", login, literal(&role.name)),
    };

    let mut grants = String::new();
    for parent in &role.in_roles {
        let missing = missing_role_action(
            options.on_missing_role,
            &format!("grant {} to {}", parent, role.name),
        );
        grants.push_str(&membership_step(parent, &role.name, &missing));
    }

    Ok(format!(
        "DO {tag}
BEGIN
  PERFORM pg_advisory_xact_lock({key});
  IF NOT EXISTS (SELECT 1 FROM pg_catalog.pg_roles WHERE rolname = {name}) THEN
    BEGIN
      {create};
    EXCEPTION
      WHEN duplicate_object OR unique_violation THEN
        NULL;
    END;
  END IF;
{grants}END
{tag};",
        tag = BLOCK_TAG,
        key = advisory_key("role", &role.name),
        name = literal(&role.name),
        create = create,
        grants = grants,
    ))
}

/// Render the `DO` block granting role membership
pub fn grant_sql(grant: &GrantSpec, options: &ProvisionOptions) -> Result<String, ProvisionError> {
    check_role_name(&grant.role)?;
    check_role_name(&grant.member)?;

    let subject = format!("grant {} to {}", grant.role, grant.member);
    let missing = missing_role_action(options.on_missing_role, &subject);
    Ok(format!(
        "DO {tag}
BEGIN
  PERFORM pg_advisory_xact_lock({key});
{step}END
{tag};",
        tag = BLOCK_TAG,
        key = advisory_key("grant", &format!("{}:{}", grant.role, grant.member)),
        step = membership_step(&grant.role, &grant.member, &missing),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_block_is_locked_and_idempotent() {
        let sql = role_sql(&RoleSpec::login("app_user", Some("s3cr'et".into())), &ProvisionOptions::default()).unwrap();

        assert!(sql.starts_with("DO $sqlpack_bootstrap$"));
        assert!(sql.contains(&format!("pg_advisory_xact_lock({})", advisory_key("role", "app_user"))));
        assert!(sql.contains("WHERE rolname = 'app_user'"));
        assert!(sql.contains("CREATE ROLE %I WITH LOGIN PASSWORD %L', 'app_user', 's3cr''et'"));
        assert!(sql.contains("WHEN duplicate_object OR unique_violation THEN"));
        assert!(!sql.contains("undefined_object"));
    }

    #[test]
    fn group_role_with_memberships() {
        let role = RoleSpec::group("readers").with_in_roles(vec!["base".into()]);
        let sql = role_sql(&role, &ProvisionOptions::new(MissingRolePolicy::Ignore)).unwrap();

        assert!(sql.contains("CREATE ROLE %I WITH NOLOGIN', 'readers'"));
        assert!(sql.contains("GRANT %I TO %I', 'base', 'readers'"));
        assert!(sql.contains("WHEN undefined_object THEN\n        NULL;"));
    }

    #[test]
    fn missing_parent_never_undoes_role_creation() {
        let role = RoleSpec::login("app_user", None).with_in_roles(vec!["readers".into(), "writers".into()]);
        let sql = role_sql(&role, &ProvisionOptions::default()).unwrap();

        let create = sql.find("CREATE ROLE").unwrap();
        let create_end = create + sql[create..].find("END IF;").unwrap();
        assert!(!sql[create..create_end].contains("undefined_object"));
        assert!(!sql[create..create_end].contains("GRANT"));

        // each membership is checked outside the role-exists guard
        let grants: Vec<_> = sql.match_indices("EXECUTE format('GRANT").map(|(i, _)| i).collect();
        assert_eq!(grants.len(), 2);
        assert!(grants.iter().all(|&i| i > create_end));
        assert_eq!(sql.matches("pg_catalog.pg_auth_members").count(), 2);
        assert_eq!(sql.matches("WHEN undefined_object THEN\n        RAISE;").count(), 2);
    }

    #[test]
    fn grant_block_checks_membership() {
        let sql = grant_sql(
            &GrantSpec::new("readers", "app_user"),
            &ProvisionOptions::new(MissingRolePolicy::Notice),
        )
        .unwrap();

        assert!(sql.contains("pg_catalog.pg_auth_members"));
        assert!(sql.contains("WHERE r.rolname = 'readers' AND m.rolname = 'app_user'"));
        assert!(sql.contains("RAISE NOTICE 'skipping grant readers to app_user: %', SQLERRM;"));
        assert!(sql.contains(&advisory_key("grant", "readers:app_user").to_string()));
    }

    #[test]
    fn rejects_unsafe_input() {
        let opts = ProvisionOptions::default();
        assert!(matches!(
            role_sql(&RoleSpec::group(""), &opts),
            Err(ProvisionError::InvalidInput(_))
        ));
        assert!(matches!(
            role_sql(&RoleSpec::login("x", Some("a$sqlpack_bootstrap$b".into())), &opts),
            Err(ProvisionError::InvalidInput(_))
        ));
        assert!(matches!(
            grant_sql(&GrantSpec::new("r".repeat(64), "m"), &opts),
            Err(ProvisionError::InvalidInput(_))
        ));
    }

    #[test]
    fn classify_by_sqlstate() {
        let grant = GrantSpec::new("readers", "ghost");
        assert!(matches!(
            ProvisionError::grant_failed(&grant, Some("42704".into()), "role \"ghost\" does not exist".into()),
            ProvisionError::MissingRole(_)
        ));
        assert!(matches!(
            ProvisionError::grant_failed(&grant, Some("42501".into()), "permission denied".into()),
            ProvisionError::GrantFailed { .. }
        ));
        assert!(matches!(
            ProvisionError::role_failed(&RoleSpec::group("x"), None, "boom".into()),
            ProvisionError::RoleCreateFailed { .. }
        ));
    }

    #[test]
    fn policy_from_str() {
        assert_eq!("notice".parse::<MissingRolePolicy>().unwrap(), MissingRolePolicy::Notice);
        assert_eq!("IGNORE".parse::<MissingRolePolicy>().unwrap(), MissingRolePolicy::Ignore);
        assert!("maybe".parse::<MissingRolePolicy>().is_err());
    }
}
