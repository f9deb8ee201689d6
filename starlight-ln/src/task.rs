//! Task basket entry types (§3, §4.2). Both variants are idempotent by
//! `(channel ID, round, kind)`; the basket itself lives in `starlight-agent`
//! (it needs the store and the HTTP client), this module just defines what
//! gets queued.

use serde::{Deserialize, Serialize};
use starlight_common::LedgerAddress;

use crate::ledger::SignedEnvelope;
use crate::message::PeerMessage;

/// The `(channel ID, round, kind)` idempotency key (§3 "Task").
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskKey {
    pub channel_id: LedgerAddress,
    pub round: u64,
    pub kind: TaskKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    SubmitTx,
    DeliverMsg,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Task {
    /// Submit a signed ledger envelope, owned by a channel (or the wallet,
    /// identified by the primary account address).
    TxTask {
        key: TaskKey,
        owner: LedgerAddress,
        envelope: SignedEnvelope,
    },
    /// Deliver an outbound message to a peer's URL.
    MsgTask {
        key: TaskKey,
        destination_url: String,
        message: PeerMessage,
    },
}

impl Task {
    pub fn key(&self) -> &TaskKey {
        match self {
            Task::TxTask { key, .. } => key,
            Task::MsgTask { key, .. } => key,
        }
    }
}
