// Coordinator configuration

use tracing::warn;

/// Env var enabling read-only validation when joining an existing transaction
pub const ENV_VALIDATE_EXISTING: &str = "TXNEST_VALIDATE_EXISTING_TRANSACTION";

/// Env var making participant commits fail as soon as the transaction is rollback-only
pub const ENV_FAIL_EARLY: &str = "TXNEST_FAIL_EARLY_ON_GLOBAL_ROLLBACK_ONLY";

/// Propagation coordinator configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Reject a read-write definition joining a read-only transaction
    pub validate_existing_transaction: bool,

    /// Raise UnexpectedRollback from a participant's commit on a rollback-only
    /// transaction, instead of only from the owner's commit
    pub fail_early_on_global_rollback_only: bool,
}

impl CoordinatorConfig {
    /// Defaults overridden by `TXNEST_*` environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            validate_existing_transaction: env_flag(ENV_VALIDATE_EXISTING)
                .unwrap_or(defaults.validate_existing_transaction),
            fail_early_on_global_rollback_only: env_flag(ENV_FAIL_EARLY)
                .unwrap_or(defaults.fail_early_on_global_rollback_only),
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    let raw = std::env::var(name).ok()?;
    parse_flag(&raw).or_else(|| {
        warn!(var = name, value = %raw, "Ignoring unparseable boolean setting");
        None
    })
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
