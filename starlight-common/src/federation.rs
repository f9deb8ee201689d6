//! Federation addresses (`name*host`) and the small wire types returned by
//! the `/federation` and `/.well-known/stellar.toml` endpoints (§4.8, §6).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::address::LedgerAddress;

/// A human-readable `name*host` identifier, e.g. `bob*starlight.example.com`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FederationAddress {
    name: String,
    host: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FederationAddressError {
    #[error("federation address must contain exactly one '*'")]
    MissingSeparator,
    #[error("federation address name must not be empty")]
    EmptyName,
    #[error("federation address host must not be empty")]
    EmptyHost,
}

impl FederationAddress {
    pub fn new(name: impl Into<String>, host: impl Into<String>) -> Result<Self, FederationAddressError> {
        let name = name.into();
        let host = host.into();
        if name.is_empty() {
            return Err(FederationAddressError::EmptyName);
        }
        if host.is_empty() {
            return Err(FederationAddressError::EmptyHost);
        }
        Ok(Self { name, host })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &str {
        &self.host
    }
}

impl fmt::Display for FederationAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}*{}", self.name, self.host)
    }
}

impl FromStr for FederationAddress {
    type Err = FederationAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(2, '*');
        let name = parts.next().unwrap_or("");
        let host = parts.next().ok_or(FederationAddressError::MissingSeparator)?;
        Self::new(name, host)
    }
}

impl TryFrom<String> for FederationAddress {
    type Error = FederationAddressError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<FederationAddress> for String {
    fn from(addr: FederationAddress) -> Self {
        addr.to_string()
    }
}

/// Response body for `GET /federation?type=name&q=NAME*HOST` (§4.8).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FederationResponse {
    pub stellar_address: String,
    pub account_id: LedgerAddress,
}

/// Response body for `GET /.well-known/stellar.toml` (§4.8). Serialized as
/// TOML by the caller; this struct just holds the two required keys.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StellarToml {
    pub federation_server: String,
    pub starlight_server: String,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_valid_address() {
        let addr: FederationAddress = "bob*example.com".parse().unwrap();
        assert_eq!(addr.name(), "bob");
        assert_eq!(addr.host(), "example.com");
        assert_eq!(addr.to_string(), "bob*example.com");
    }

    #[test]
    fn rejects_missing_separator() {
        assert_eq!(
            "bob".parse::<FederationAddress>(),
            Err(FederationAddressError::MissingSeparator)
        );
    }

    #[test]
    fn rejects_empty_name() {
        assert_eq!(
            "*example.com".parse::<FederationAddress>(),
            Err(FederationAddressError::EmptyName)
        );
    }
}
