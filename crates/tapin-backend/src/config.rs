//! Backend configuration from environment variables.
//!
//! - `TAPIN_BACKEND_SECRET`: Required. Provisioning secret readers present at registration
//! - `TAPIN_BACKEND_ADDR`: Optional. Listen address (default: 0.0.0.0:8080)
//! - `TAPIN_BACKEND_TOKEN_TTL_SECS`: Optional. Credential lifetime (default: 86400)
//! - `TAPIN_BACKEND_ROSTER`: Optional. TOML file mapping tag ids to names
//! - `TAPIN_PRODUCTION`: Optional. `1`/`true` selects production logging
//! - `TAPIN_BACKEND_LOG_DIR`: Optional. Directory for production log files

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use serde::Deserialize;

/// Environment variable names
mod env_vars {
    pub const SECRET: &str = "TAPIN_BACKEND_SECRET";
    pub const ADDR: &str = "TAPIN_BACKEND_ADDR";
    pub const TOKEN_TTL_SECS: &str = "TAPIN_BACKEND_TOKEN_TTL_SECS";
    pub const ROSTER: &str = "TAPIN_BACKEND_ROSTER";
    pub const PRODUCTION: &str = "TAPIN_PRODUCTION";
}

/// Default configuration values
mod defaults {
    pub const ADDR: &str = "0.0.0.0:8080";
    pub const TOKEN_TTL_SECS: i64 = 86_400;
}

/// Errors loading the backend configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("TAPIN_BACKEND_SECRET environment variable is not set")]
    SecretNotSet,

    #[error("invalid listen address {0}")]
    InvalidAddr(String),

    #[error("cannot read roster {}: {source}", .path.display())]
    RosterUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid roster {}: {source}", .path.display())]
    RosterInvalid {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Roster file layout.
///
/// ```toml
/// [roster]
/// "04A1B2C3" = "Ada Lovelace"
/// ```
#[derive(Debug, Default, Deserialize)]
struct RosterFile {
    #[serde(default)]
    roster: HashMap<String, String>,
}

/// Configuration for the backend
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address
    pub addr: SocketAddr,

    /// Secret readers must present to register
    pub provisioning_secret: String,

    /// How long an issued credential stays valid
    pub token_ttl: chrono::Duration,

    /// Tag id to display name
    pub roster: HashMap<String, String>,

    /// Production logging
    pub production: bool,
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// # Errors
    ///
    /// Returns an error if the secret is missing, the address is invalid or
    /// the roster file cannot be read.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`.
    ///
    /// # Errors
    ///
    /// See [`Config::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let provisioning_secret = lookup(env_vars::SECRET)
            .filter(|s| !s.trim().is_empty())
            .ok_or(ConfigError::SecretNotSet)?;

        let addr = lookup(env_vars::ADDR).unwrap_or_else(|| defaults::ADDR.to_string());
        let addr = addr
            .parse()
            .map_err(|_| ConfigError::InvalidAddr(addr.clone()))?;

        let token_ttl = lookup(env_vars::TOKEN_TTL_SECS)
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults::TOKEN_TTL_SECS);

        let roster = match lookup(env_vars::ROSTER) {
            Some(path) => load_roster(PathBuf::from(path))?,
            None => HashMap::new(),
        };

        let production = lookup(env_vars::PRODUCTION)
            .is_some_and(|s| matches!(s.to_lowercase().as_str(), "1" | "true" | "yes"));

        Ok(Self {
            addr,
            provisioning_secret,
            token_ttl: chrono::Duration::seconds(token_ttl),
            roster,
            production,
        })
    }
}

fn load_roster(path: PathBuf) -> Result<HashMap<String, String>, ConfigError> {
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(source) => return Err(ConfigError::RosterUnreadable { path, source }),
    };
    match toml::from_str::<RosterFile>(&contents) {
        Ok(file) => Ok(file.roster),
        Err(source) => Err(ConfigError::RosterInvalid { path, source }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |key| {
            vars.iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| (*v).to_string())
        }
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[("TAPIN_BACKEND_SECRET", "s3cret")])).unwrap();
        assert_eq!(config.addr.port(), 8080);
        assert_eq!(config.token_ttl, chrono::Duration::days(1));
        assert!(config.roster.is_empty());
        assert!(!config.production);
    }

    #[test]
    fn test_missing_secret() {
        let err = Config::from_lookup(lookup(&[("TAPIN_BACKEND_SECRET", "  ")])).unwrap_err();
        assert!(matches!(err, ConfigError::SecretNotSet));
    }

    #[test]
    fn test_invalid_addr() {
        let err = Config::from_lookup(lookup(&[
            ("TAPIN_BACKEND_SECRET", "s3cret"),
            ("TAPIN_BACKEND_ADDR", "nowhere"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidAddr(_)));
    }

    #[test]
    fn test_roster_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roster.toml");
        std::fs::write(&path, "[roster]\n\"04AA\" = \"Ada Lovelace\"\n").unwrap();
        let path = path.to_string_lossy().into_owned();

        let config = Config::from_lookup(lookup(&[
            ("TAPIN_BACKEND_SECRET", "s3cret"),
            ("TAPIN_BACKEND_ROSTER", path.as_str()),
            ("TAPIN_PRODUCTION", "true"),
        ]))
        .unwrap();
        assert_eq!(config.roster["04AA"], "Ada Lovelace");
        assert!(config.production);
    }
}
