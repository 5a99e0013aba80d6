//! Configuration loading and representation.
//!
//! Everything comes from environment variables. `Config::from_lookup` takes
//! any key lookup so tests never touch the process environment.

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;

use recordchain_core::OrgId;
use recordchain_ledger::{ConnectionProfile, GatewayOptions, OrgProfile, WalletIdentity};

use crate::jobs::{BackoffStrategy, Retention, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(String),

    #[error("invalid {key}={value:?}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

/// Submit job tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobsConfig {
    pub retry: RetryPolicy,
    pub concurrency: usize,
    pub retention: Retention,
    /// Run the delayed-job scheduler in this process.
    pub scheduler: bool,
    pub lease: Duration,
    pub poll_interval: Duration,
    /// How long a `queued` job may sit untouched before the scheduler pushes
    /// it onto the ready queue again.
    pub requeue_after: Duration,
}

/// Channel, contract and gateway timeouts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    pub channel: String,
    pub chaincode: String,
    pub gateway: GatewayOptions,
}

/// One member organization.
#[derive(Debug, Clone, PartialEq)]
pub struct OrgConfig {
    pub org: OrgId,
    pub msp_id: String,
    pub connection_profile: serde_json::Value,
    pub certificate: String,
    pub private_key: String,
    pub api_key: Option<String>,
}

impl OrgConfig {
    pub fn profile(&self) -> OrgProfile {
        OrgProfile {
            profile: ConnectionProfile::new(self.org.clone(), self.connection_profile.clone()),
            msp_id: self.msp_id.clone(),
        }
    }

    /// The organization's own wallet identity, labelled by MSP id.
    pub fn identity(&self) -> WalletIdentity {
        WalletIdentity::x509(&self.msp_id, &self.msp_id, &self.certificate, &self.private_key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisConfig {
    pub url: String,
    /// Key namespace, also the queue name.
    pub prefix: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// `tracing` filter directive derived from `LOG_LEVEL`.
    pub log_level: String,
    pub port: u16,
    pub jobs: JobsConfig,
    pub ledger: LedgerConfig,
    pub orgs: Vec<OrgConfig>,
    pub redis: Option<RedisConfig>,
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.raw(key).unwrap_or_else(|| default.to_string())
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        self.raw(key).ok_or_else(|| ConfigError::Missing(key.to_string()))
    }

    fn positive(&self, key: &str, default: u64) -> Result<u64, ConfigError> {
        let Some(value) = self.raw(key) else {
            return Ok(default);
        };
        match value.trim().parse::<u64>() {
            Ok(n) if n > 0 => Ok(n),
            _ => Err(invalid(key, &value, "expected a positive integer")),
        }
    }

    /// Only `true` and `false` are accepted.
    fn strict_bool(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.raw(key).as_deref().map(str::trim) {
            None => Ok(default),
            Some("true") => Ok(true),
            Some("false") => Ok(false),
            Some(other) => Err(invalid(key, other, "expected true or false")),
        }
    }
}

fn invalid(key: &str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn log_filter(level: &str) -> Option<&'static str> {
    Some(match level {
        "fatal" | "error" => "error",
        "warn" => "warn",
        "info" => "info",
        "debug" => "debug",
        "trace" => "trace",
        "silent" => "off",
        _ => return None,
    })
}

fn usize_of(key: &str, n: u64) -> Result<usize, ConfigError> {
    usize::try_from(n).map_err(|_| invalid(key, &n.to_string(), "too large"))
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_map(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::from_lookup(|key| vars.get(key).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env { lookup };

        let level = env.string("LOG_LEVEL", "info");
        let log_level = log_filter(level.trim())
            .ok_or_else(|| {
                invalid(
                    "LOG_LEVEL",
                    &level,
                    "expected fatal, error, warn, info, debug, trace or silent",
                )
            })?
            .to_string();

        let port_raw = env.positive("PORT", 5000)?;
        let port = u16::try_from(port_raw)
            .map_err(|_| invalid("PORT", &port_raw.to_string(), "not a port number"))?;

        let gateway = GatewayOptions {
            as_localhost: env.strict_bool("AS_LOCAL_HOST", true)?,
            endorse_timeout: Duration::from_secs(env.positive("HLF_ENDORSE_TIMEOUT", 30)?),
            commit_timeout: Duration::from_secs(env.positive("HLF_COMMIT_TIMEOUT", 300)?),
            query_timeout: Duration::from_secs(env.positive("HLF_QUERY_TIMEOUT", 3)?),
        };
        let ledger = LedgerConfig {
            channel: env.string("HLF_CHANNEL_NAME", "property-channel"),
            chaincode: env.string("HLF_CHAINCODE_NAME", "property-cc"),
            gateway,
        };

        let backoff_raw = env.string("SUBMIT_JOB_BACKOFF_TYPE", "fixed");
        let strategy: BackoffStrategy = backoff_raw.trim().parse().map_err(|_| {
            invalid("SUBMIT_JOB_BACKOFF_TYPE", &backoff_raw, "expected fixed or exponential")
        })?;
        let attempts_raw = env.positive("SUBMIT_JOB_ATTEMPTS", 5)?;
        let max_attempts = u32::try_from(attempts_raw).map_err(|_| {
            invalid("SUBMIT_JOB_ATTEMPTS", &attempts_raw.to_string(), "too large")
        })?;
        let retry = RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(env.positive("SUBMIT_JOB_BACKOFF_DELAY", 3000)?),
            strategy,
        };

        // Long enough for one full endorse + commit + confirm round.
        let default_lease = gateway.endorse_timeout + gateway.commit_timeout + gateway.query_timeout + Duration::from_secs(30);
        let default_lease_ms = u64::try_from(default_lease.as_millis()).unwrap_or(u64::MAX);

        let jobs = JobsConfig {
            retry,
            concurrency: usize_of("SUBMIT_JOB_CONCURRENCY", env.positive("SUBMIT_JOB_CONCURRENCY", 5)?)?,
            retention: Retention {
                completed: usize_of("MAX_COMPLETED_SUBMIT_JOBS", env.positive("MAX_COMPLETED_SUBMIT_JOBS", 1000)?)?,
                failed: usize_of("MAX_FAILED_SUBMIT_JOBS", env.positive("MAX_FAILED_SUBMIT_JOBS", 1000)?)?,
            },
            scheduler: env.strict_bool("SUBMIT_JOB_QUEUE_SCHEDULER", true)?,
            lease: Duration::from_millis(env.positive("SUBMIT_JOB_LEASE_MS", default_lease_ms)?),
            poll_interval: Duration::from_millis(env.positive("SCHEDULER_POLL_INTERVAL_MS", 250)?),
            requeue_after: Duration::from_millis(env.positive("SCHEDULER_REQUEUE_AFTER_MS", 30_000)?),
        };

        let mut orgs = Vec::new();
        for name in env.string("LEDGER_ORGS", "Org1").split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let org = OrgId::new(name)
                .map_err(|e| invalid("LEDGER_ORGS", name, e.to_string()))?;
            orgs.push(org_config(&env, org)?);
        }
        if orgs.is_empty() {
            return Err(ConfigError::Missing("LEDGER_ORGS".to_string()));
        }

        let redis = env.raw("REDIS_URL").map(|url| RedisConfig {
            url,
            prefix: env.string("REDIS_KEY_PREFIX", "submit"),
        });

        Ok(Self {
            log_level,
            port,
            jobs,
            ledger,
            orgs,
            redis,
        })
    }

    pub fn org(&self, org: &OrgId) -> Option<&OrgConfig> {
        self.orgs.iter().find(|o| &o.org == org)
    }

    /// Organization authenticated by an API key.
    pub fn org_for_api_key(&self, key: &str) -> Option<&OrgId> {
        self.orgs
            .iter()
            .find(|o| o.api_key.as_deref() == Some(key))
            .map(|o| &o.org)
    }
}

fn org_config<F>(env: &Env<F>, org: OrgId) -> Result<OrgConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let upper = org.as_str().to_ascii_uppercase();
    let profile_key = format!("HLF_CONNECTION_PROFILE_{upper}");
    let raw_profile = env.required(&profile_key)?;
    let connection_profile: serde_json::Value = serde_json::from_str(&raw_profile)
        .map_err(|e| invalid(&profile_key, &raw_profile, e.to_string()))?;
    if !connection_profile.is_object() {
        return Err(invalid(&profile_key, &raw_profile, "expected a JSON object"));
    }

    Ok(OrgConfig {
        msp_id: env.string(&format!("HLF_MSP_ID_{upper}"), &format!("{org}MSP")),
        connection_profile,
        certificate: env.required(&format!("HLF_CERTIFICATE_{upper}"))?,
        private_key: env.required(&format!("HLF_PRIVATE_KEY_{upper}"))?,
        api_key: env.raw(&format!("{upper}_APIKEY")),
        org,
    })
}
