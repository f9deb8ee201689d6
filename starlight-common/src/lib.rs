//! The `starlight-common` crate contains types and functionality shared
//! between the channel engine (`starlight-ln`) and the agent process
//! (`starlight-agent`): wire types, config, the error taxonomy, and small
//! standalone utilities.

/// Ledger account / channel addresses (Stellar-style StrKey).
pub mod address;
/// Exponential backoff iterator for the task basket and faucet retries.
pub mod backoff;
/// Agent configuration: validation, defaults, and edit rules.
pub mod config;
/// Serializable API error types shared by both HTTP surfaces.
pub mod error;
/// Federation addresses (`name*host`) and federation/`stellar.toml` types.
pub mod federation;
/// Monotonic round numbers and per-channel message sequence numbers.
pub mod round;
/// A synchronization utility for broadcasting shutdown signals.
pub mod shutdown;
/// A thin wrapper around [`tokio::task::JoinHandle`] enforcing `#[must_use]`.
pub mod task;

pub use address::LedgerAddress;
pub use config::Config;
pub use round::{MsgSeq, Round};
