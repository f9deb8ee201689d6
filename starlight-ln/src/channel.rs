//! The channel data model (§3) and the FSM's state graph (§4.4):
//!
//! ```text
//! Start -> SettingUp -> ChannelProposed -> PaymentChannel
//!                     \-> AwaitingFunding -/
//! PaymentChannel <-> AwaitingPaymentMerge          (payment rounds)
//! PaymentChannel -> AwaitingClose -> Closed
//! Any             -> AwaitingCleanup -> Start       (proposal conflict)
//! Any -> AwaitingRatchet/AwaitingSettlement/AwaitingSettlementMintime
//!     -> Closed                                      (force-close)
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use starlight_common::{LedgerAddress, MsgSeq, Round};

/// Which side of the channel this agent plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Host,
    Guest,
}

impl Role {
    pub fn counterparty(self) -> Role {
        match self {
            Role::Host => Role::Guest,
            Role::Guest => Role::Host,
        }
    }
}

/// The FSM state graph from the module doc comment above.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelState {
    Start,
    SettingUp,
    AwaitingFunding,
    ChannelProposed,
    PaymentChannel,
    AwaitingPaymentMerge,
    AwaitingClose,
    AwaitingCleanup,
    AwaitingRatchet,
    AwaitingSettlement,
    AwaitingSettlementMintime,
    Closed,
}

impl ChannelState {
    /// Whether the channel still counts toward the "no two live channels
    /// between the same ordered pair" invariant (§3).
    pub fn is_live(self) -> bool {
        !matches!(self, ChannelState::Closed | ChannelState::Start)
    }
}

/// The five ledger accounts a channel touches (§3).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelAccounts {
    /// The escrow account's address is the channel id.
    pub escrow: LedgerAddress,
    pub host_ratchet: LedgerAddress,
    pub guest_ratchet: LedgerAddress,
    pub host: LedgerAddress,
    pub guest: LedgerAddress,
}

/// The sequence numbers ratchet transactions are built against, discovered
/// once during funding (§4.4 "Ratchet accounts").
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetSeqnums {
    pub host_ratchet_seqnum: u64,
    pub guest_ratchet_seqnum: u64,
}

/// The central channel entity (§3), keyed by `accounts.escrow`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub role: Role,
    pub counterparty_address: starlight_common::federation::FederationAddress,
    pub counterparty_url: String,

    pub accounts: ChannelAccounts,

    pub host_amount: u64,
    pub guest_amount: u64,
    pub channel_feerate: u64,
    pub host_feerate: u64,

    pub max_round_duration: Duration,
    pub finality_delay: Duration,
    pub funding_time: Option<u64>,
    pub payment_time: Option<u64>,

    pub round_number: Round,
    pub state: ChannelState,
    pub key_index: u64,
    pub base_sequence_number: u64,
    pub ratchet_seqnums: RatchetSeqnums,
    /// The network passphrase pinned at channel creation, so an agent
    /// config change can never retroactively alter a live channel's signing
    /// domain.
    pub passphrase: String,
    pub last_msg_index: MsgSeq,

    /// Outbound message sequence numbers, one counter per direction, so
    /// either party's emitted sequence is independently monotone (§8,
    /// property 3).
    pub host_msg_seq: MsgSeq,
    pub guest_msg_seq: MsgSeq,
}

impl Channel {
    /// The ordered pair this channel occupies, for the at-most-one-channel
    /// invariant (§3, §8 property 4).
    pub fn ordered_pair(&self) -> (LedgerAddress, LedgerAddress) {
        match self.role {
            Role::Host => (self.accounts.host, self.accounts.guest),
            Role::Guest => (self.accounts.guest, self.accounts.host),
        }
    }

    pub fn channel_id(&self) -> LedgerAddress {
        self.accounts.escrow
    }

    /// Total channel funds; must be conserved across payment rounds (§3,
    /// §8 property 1).
    pub fn total_funds(&self) -> u64 {
        self.host_amount + self.guest_amount
    }

    /// The sequence counter this agent's own outbound messages advance.
    pub fn own_msg_seq_mut(&mut self) -> &mut MsgSeq {
        match self.role {
            Role::Host => &mut self.host_msg_seq,
            Role::Guest => &mut self.guest_msg_seq,
        }
    }
}
