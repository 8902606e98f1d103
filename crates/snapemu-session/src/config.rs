use snapemu_mem::BindingPolicy;
use thiserror::Error;

pub const ENV_BINDING_POLICY: &str = "SNAPEMU_BINDING_POLICY";
pub const ENV_PAGE_TABLE_BASE: &str = "SNAPEMU_PAGE_TABLE_BASE";
pub const ENV_MAX_STEPS: &str = "SNAPEMU_MAX_STEPS";
pub const ENV_STOP_ADDRESS: &str = "SNAPEMU_STOP_ADDRESS";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionConfig {
    pub binding_policy: BindingPolicy,
    /// Commit base for layouts installed without an explicit one. `None` places the table
    /// directly above the highest mapped frame.
    pub page_table_base: Option<u64>,
    /// Upper bound on steps per [`Session::run`](crate::Session::run).
    pub max_steps: Option<u64>,
    /// RIP at which a run stops after the instruction that reached it.
    pub stop_address: Option<u64>,
}

impl SessionConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a caller-supplied variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let binding_policy = match lookup(ENV_BINDING_POLICY) {
            Some(raw) => raw.parse().map_err(|reason| ConfigError::InvalidEnv {
                var: ENV_BINDING_POLICY,
                reason,
            })?,
            None => BindingPolicy::default(),
        };
        let page_table_base = optional_u64(&lookup, ENV_PAGE_TABLE_BASE)?;
        if let Some(base) = page_table_base {
            if base & 0xFFF != 0 {
                return Err(ConfigError::InvalidEnv {
                    var: ENV_PAGE_TABLE_BASE,
                    reason: format!("{base:#x} is not page aligned"),
                });
            }
        }

        Ok(Self {
            binding_policy,
            page_table_base,
            max_steps: optional_u64(&lookup, ENV_MAX_STEPS)?,
            stop_address: optional_u64(&lookup, ENV_STOP_ADDRESS)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for env var {var}: {reason}")]
    InvalidEnv { var: &'static str, reason: String },
}

fn optional_u64(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<u64>, ConfigError> {
    lookup(var)
        .map(|raw| {
            parse_u64(&raw).ok_or_else(|| ConfigError::InvalidEnv {
                var,
                reason: format!("`{raw}` is not a decimal or 0x-prefixed hex integer"),
            })
        })
        .transpose()
}

/// Decimal or `0x`-prefixed hex, `_` separators allowed.
fn parse_u64(raw: &str) -> Option<u64> {
    let cleaned: String = raw.trim().chars().filter(|&c| c != '_').collect();
    match cleaned
        .strip_prefix("0x")
        .or_else(|| cleaned.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => cleaned.parse().ok(),
    }
}
