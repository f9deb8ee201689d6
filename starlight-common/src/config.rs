//! Agent configuration (§3 `Agent.config`, §4.9 `ConfigInit`/`ConfigEdit`).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default horizon-style testnet ledger endpoint.
pub const DEFAULT_HORIZON_URL: &str = "https://horizon-testnet.stellar.org";
const DEFAULT_MAX_ROUND_DURATION_SECS: u64 = 30;
const DEFAULT_FINALITY_DELAY_SECS: u64 = 60;
const DEFAULT_CHANNEL_FEERATE: u64 = 1000;
const DEFAULT_HOST_FEERATE: u64 = 100;
const MAX_BCRYPT_PASSWORD_BYTES: usize = 72;

/// Persisted agent configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub username: String,
    /// bcrypt hash of the account password. Never the plaintext password.
    pub password_hash: String,
    pub horizon_url: String,
    pub max_round_duration: Duration,
    pub finality_delay: Duration,
    pub channel_feerate: u64,
    pub host_feerate: u64,
    pub keep_alive: bool,
    pub public: bool,
}

/// The local command used to initialize a fresh agent (§4.9 `ConfigInit`).
#[derive(Clone, Debug)]
pub struct ConfigInit {
    pub username: String,
    pub password: String,
    pub horizon_url: Option<String>,
    pub max_round_duration: Option<Duration>,
    pub finality_delay: Option<Duration>,
    pub channel_feerate: Option<u64>,
    pub host_feerate: Option<u64>,
    pub keep_alive: Option<bool>,
    pub public: Option<bool>,
}

/// The local command used to edit an existing agent's config (§4.9
/// `ConfigEdit`). Only `password`, `horizon_url`, and the numeric tuning
/// fields may change; `username` and `keep_alive` are immutable after init.
#[derive(Clone, Debug, Default)]
pub struct ConfigEdit {
    pub old_password: Option<String>,
    pub password: Option<String>,
    pub horizon_url: Option<String>,
    pub max_round_duration: Option<Duration>,
    pub finality_delay: Option<Duration>,
    pub channel_feerate: Option<u64>,
    pub host_feerate: Option<u64>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("password must be non-empty and at most 72 bytes")]
    InvalidPassword,
    #[error("username must be printable ASCII and must not contain '*'")]
    InvalidUsername,
    #[error("numeric config fields must be non-negative")]
    InvalidNumericField,
    #[error("old password did not match")]
    OldPasswordMismatch,
    #[error("config edit must change at least one field")]
    EmptyEdit,
    #[error("only test/faucet network URLs are permitted")]
    InvalidHorizonUrl,
}

fn validate_password(password: &str) -> Result<(), ConfigError> {
    if password.is_empty() || password.len() > MAX_BCRYPT_PASSWORD_BYTES {
        return Err(ConfigError::InvalidPassword);
    }
    Ok(())
}

fn validate_username(username: &str) -> Result<(), ConfigError> {
    if username.is_empty()
        || username.contains('*')
        || !username.chars().all(|c| !c.is_control())
    {
        return Err(ConfigError::InvalidUsername);
    }
    Ok(())
}

impl Config {
    /// Validates and builds the initial [`Config`] from a [`ConfigInit`]
    /// command, filling in defaults for any unspecified field, and hashing
    /// the password with bcrypt. Does not persist anything; the caller is
    /// responsible for writing the result inside the enclosing
    /// write-transaction.
    pub fn from_init(init: &ConfigInit) -> Result<Self, ConfigError> {
        validate_password(&init.password)?;
        validate_username(&init.username)?;

        let horizon_url = init
            .horizon_url
            .clone()
            .unwrap_or_else(|| DEFAULT_HORIZON_URL.to_string());
        if !Self::is_test_network_url(&horizon_url) {
            return Err(ConfigError::InvalidHorizonUrl);
        }

        let password_hash = bcrypt::hash(&init.password, bcrypt::DEFAULT_COST)
            .map_err(|_| ConfigError::InvalidPassword)?;

        Ok(Config {
            username: init.username.clone(),
            password_hash,
            horizon_url,
            max_round_duration: init
                .max_round_duration
                .unwrap_or(Duration::from_secs(DEFAULT_MAX_ROUND_DURATION_SECS)),
            finality_delay: init
                .finality_delay
                .unwrap_or(Duration::from_secs(DEFAULT_FINALITY_DELAY_SECS)),
            channel_feerate: init.channel_feerate.unwrap_or(DEFAULT_CHANNEL_FEERATE),
            host_feerate: init.host_feerate.unwrap_or(DEFAULT_HOST_FEERATE),
            keep_alive: init.keep_alive.unwrap_or(true),
            public: init.public.unwrap_or(false),
        })
    }

    /// Applies a [`ConfigEdit`], returning the new config. Rejects empty
    /// edits and attempts to touch immutable fields.
    pub fn apply_edit(&self, edit: &ConfigEdit) -> Result<Self, ConfigError> {
        let touches_any = edit.password.is_some()
            || edit.horizon_url.is_some()
            || edit.max_round_duration.is_some()
            || edit.finality_delay.is_some()
            || edit.channel_feerate.is_some()
            || edit.host_feerate.is_some();
        if !touches_any {
            return Err(ConfigError::EmptyEdit);
        }

        let mut next = self.clone();

        if let Some(new_password) = &edit.password {
            let old_password = edit
                .old_password
                .as_deref()
                .ok_or(ConfigError::OldPasswordMismatch)?;
            let matches = bcrypt::verify(old_password, &self.password_hash)
                .unwrap_or(false);
            if !matches {
                return Err(ConfigError::OldPasswordMismatch);
            }
            validate_password(new_password)?;
            next.password_hash = bcrypt::hash(new_password, bcrypt::DEFAULT_COST)
                .map_err(|_| ConfigError::InvalidPassword)?;
        }
        if let Some(url) = &edit.horizon_url {
            if !Self::is_test_network_url(url) {
                return Err(ConfigError::InvalidHorizonUrl);
            }
            next.horizon_url = url.clone();
        }
        if let Some(d) = edit.max_round_duration {
            next.max_round_duration = d;
        }
        if let Some(d) = edit.finality_delay {
            next.finality_delay = d;
        }
        if let Some(f) = edit.channel_feerate {
            next.channel_feerate = f;
        }
        if let Some(f) = edit.host_feerate {
            next.host_feerate = f;
        }

        Ok(next)
    }

    /// Verifies a login attempt against this config (§4.9 `Authenticate`).
    pub fn authenticate(&self, username: &str, password: &str) -> bool {
        username == self.username && bcrypt::verify(password, &self.password_hash).unwrap_or(false)
    }

    /// Rejects any horizon URL that doesn't look like a test/faucet
    /// endpoint, per §4.3: "attempts to target a production network URL
    /// must be rejected before any mutation."
    pub fn is_test_network_url(url: &str) -> bool {
        url.contains("testnet") || url.contains("localhost") || url.contains("127.0.0.1")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn init(username: &str, password: &str) -> ConfigInit {
        ConfigInit {
            username: username.to_string(),
            password: password.to_string(),
            horizon_url: None,
            max_round_duration: None,
            finality_delay: None,
            channel_feerate: None,
            host_feerate: None,
            keep_alive: None,
            public: None,
        }
    }

    #[test]
    fn s1_config_init_happy_path() {
        let cfg = Config::from_init(&init("alice", "hunter2")).unwrap();
        assert_eq!(cfg.username, "alice");
        assert!(cfg.authenticate("alice", "hunter2"));
        assert!(!cfg.authenticate("alice", "wrong"));
        assert!(cfg.keep_alive);
        assert_eq!(cfg.horizon_url, DEFAULT_HORIZON_URL);
    }

    #[test]
    fn s2_weak_password_rejected() {
        let err = Config::from_init(&init("alice", "")).unwrap_err();
        assert_eq!(err, ConfigError::InvalidPassword);
    }

    #[test]
    fn password_over_72_bytes_rejected() {
        let long = "a".repeat(73);
        let err = Config::from_init(&init("alice", &long)).unwrap_err();
        assert_eq!(err, ConfigError::InvalidPassword);
    }

    #[test]
    fn username_with_star_rejected() {
        let err = Config::from_init(&init("ali*ce", "hunter2")).unwrap_err();
        assert_eq!(err, ConfigError::InvalidUsername);
    }

    #[test]
    fn empty_edit_rejected() {
        let cfg = Config::from_init(&init("alice", "hunter2")).unwrap();
        let err = cfg.apply_edit(&ConfigEdit::default()).unwrap_err();
        assert_eq!(err, ConfigError::EmptyEdit);
    }

    #[test]
    fn edit_requires_correct_old_password() {
        let cfg = Config::from_init(&init("alice", "hunter2")).unwrap();
        let edit = ConfigEdit {
            old_password: Some("wrong".to_string()),
            password: Some("newpass".to_string()),
            ..Default::default()
        };
        let err = cfg.apply_edit(&edit).unwrap_err();
        assert_eq!(err, ConfigError::OldPasswordMismatch);
    }

    #[test]
    fn edit_changes_password() {
        let cfg = Config::from_init(&init("alice", "hunter2")).unwrap();
        let edit = ConfigEdit {
            old_password: Some("hunter2".to_string()),
            password: Some("newpass123".to_string()),
            ..Default::default()
        };
        let next = cfg.apply_edit(&edit).unwrap();
        assert!(next.authenticate("alice", "newpass123"));
        assert!(!next.authenticate("alice", "hunter2"));
    }

    #[test]
    fn rejects_production_url() {
        assert!(!Config::is_test_network_url("https://horizon.stellar.org"));
        assert!(Config::is_test_network_url(DEFAULT_HORIZON_URL));
    }
}
