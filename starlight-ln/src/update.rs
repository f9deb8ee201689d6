//! The append-only audit `Update` record (§3, §4.5): every committed FSM
//! step appends exactly one of these, with enough of the triggering input
//! attached for full auditability.

use serde::{Deserialize, Serialize};
use starlight_common::LedgerAddress;

use crate::channel::Channel;
use crate::command::Command;
use crate::ledger::LedgerTx;
use crate::message::PeerMessage;
use crate::wallet::Wallet;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum UpdateInput {
    ChannelCmd {
        channel_id: LedgerAddress,
        command: Command,
    },
    ChannelMsg {
        channel_id: LedgerAddress,
        message: PeerMessage,
    },
    Tx {
        channel_id: Option<LedgerAddress>,
        tx: LedgerTx,
        operation_index: u32,
    },
    Timer {
        channel_id: LedgerAddress,
        ledger_time: u64,
    },
    Config,
    Init,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum UpdateSnapshot {
    Channel(Box<Channel>),
    Account(Box<Wallet>),
    None,
}

/// One audit record (§3 "Update").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Update {
    pub seq: u64,
    pub input: UpdateInput,
    pub snapshot: UpdateSnapshot,
}

/// The warning/failure variants folded into `Update.input`/`snapshot` by
/// convention (`Warning`, `TxFailure`, `TxSuccess` from §3's `Update.type`
/// enum map onto `UpdateInput::Tx` with `snapshot` carrying the outcome, or
/// onto this standalone type for failures with no channel snapshot yet).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum TxOutcome {
    Success,
    Failure { reason: String },
}
