//! Peer-to-peer channel messages (§4.4 `Msg`, §6 wire body).

use serde::{Deserialize, Serialize};
use starlight_common::{LedgerAddress, MsgSeq};

use crate::ledger::SignedEnvelope;

/// The `{channelID, msgNum, ...kindSpecific}` body accepted by
/// `POST /starlight/message` (§6).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerMessage {
    pub channel_id: LedgerAddress,
    pub msg_num: MsgSeq,
    pub kind: PeerMessageKind,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PeerMessageKind {
    ChannelPropose(ChannelPropose),
    ChannelAccept(ChannelAccept),
    PaymentPropose(PaymentPropose),
    PaymentAccept(PaymentAccept),
    SettlementPropose(SettlementPropose),
    SettlementAccept(SettlementAccept),
    CloseMsg(CloseMsg),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelPropose {
    pub host_amount: u64,
    pub guest_amount: u64,
    pub channel_feerate: u64,
    pub host_feerate: u64,
    pub host_account: LedgerAddress,
    pub guest_account: LedgerAddress,
    pub host_ratchet_account: LedgerAddress,
    pub guest_ratchet_account: LedgerAddress,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelAccept {
    pub funding_tx: SignedEnvelope,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PaymentPropose {
    pub round_number: u64,
    pub host_amount: u64,
    pub guest_amount: u64,
    pub ratchet_tx: SignedEnvelope,
    pub settlement_tx: SignedEnvelope,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PaymentAccept {
    pub round_number: u64,
    pub ratchet_tx: SignedEnvelope,
    pub settlement_tx: SignedEnvelope,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SettlementPropose {
    pub round_number: u64,
    pub settlement_tx: SignedEnvelope,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SettlementAccept {
    pub round_number: u64,
    pub settlement_tx: SignedEnvelope,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CloseMsg {
    pub final_settlement_tx: SignedEnvelope,
}
