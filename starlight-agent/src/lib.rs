//! The `starlight-agent` crate is the runnable process: the `sled`-backed
//! persistent store (§4.1), the task basket (§4.2), the update loop (§4.5)
//! that drives `starlight_ln::fsm::step`, the wallet/channel watchers
//! (§4.6/§4.7), the agent facade (§4.9), and the two HTTP surfaces (§4.8,
//! §6). `starlight-ln` has no I/O; this crate supplies all of it.

/// The agent facade: `Start`/`ConfigInit`/`ConfigEdit`/`Authenticate`/
/// `Deauthenticate`/`Close`/`CloseWait` (§4.9).
pub mod agent;
/// A `reqwest`-backed `LedgerClient` for the public Horizon-compatible
/// testnet API (§4.3).
pub mod horizon;
/// An in-memory `LedgerClient` for tests, mirroring the teacher's
/// `api::mock` module.
pub mod fake_ledger;
/// The two HTTP surfaces: peer RPC (§4.8) and the local command surface
/// (§6).
pub mod server;
/// The persistent, transactional key-value store (§4.1).
pub mod store;
/// The durable, at-most-once, retriable task basket (§4.2).
pub mod task_basket;
/// Drives `starlight_ln::fsm::step` inside a store write-transaction and
/// publishes the resulting `Update` (§4.5).
pub mod update_loop;
/// The wallet watcher and per-channel watchers (§4.6/§4.7).
pub mod watchers;
