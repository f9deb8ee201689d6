//! The `starlight-ln` crate is the channel engine: the per-channel finite
//! state machine and its pure transition function, the wire types for
//! commands/messages/ledger transactions, the task-basket entry types, and
//! the ledger client trait. It contains no persistence and no HTTP: those
//! live in `starlight-agent`, which drives this crate's `fsm::step` inside
//! a store write-transaction (§4.5).

/// The channel data model: accounts, economic state, and the FSM's state
/// graph (§3, §4.4).
pub mod channel;
/// Local commands accepted by the agent facade (§4.4 `Cmd`, §6).
pub mod command;
/// The pure channel FSM transition function (§4.4).
pub mod fsm;
/// Keypath derivation and the signing capability / watchtower mode (§4.9,
/// §9 "session capability").
pub mod keys;
/// The ledger client trait and a testnet-shaped transaction/envelope model
/// (§4.3).
pub mod ledger;
/// Peer-to-peer channel messages (§4.4 `Msg`, §4.8).
pub mod message;
/// Task basket entry types: `TxTask` and `MsgTask` (§3, §4.2).
pub mod task;
/// The append-only audit `Update` record (§3, §4.5).
pub mod update;
/// Wallet state and the pure ledger-operation-to-wallet-event mapping used
/// by the wallet watcher (§3, §4.6).
pub mod wallet;
