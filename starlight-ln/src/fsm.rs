//! The pure channel FSM transition function (§4.4): a function from
//! `(current channel state, input)` to `(new state, outgoing messages,
//! ledger transactions, timers)`. No I/O; everything it needs (the clock,
//! the signing capability, and the base sequence numbers of the accounts
//! involved) is passed in via [`FsmContext`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use starlight_common::federation::FederationAddress;
use starlight_common::{LedgerAddress, Round};

use crate::channel::{Channel, ChannelAccounts, ChannelState, RatchetSeqnums, Role};
use crate::command::Command;
use crate::keys::SigningCapability;
use crate::ledger::{LedgerTx, OperationKind, SignedEnvelope};
use crate::message::{
    ChannelAccept, ChannelPropose, PaymentAccept, PaymentPropose, PeerMessage, PeerMessageKind,
    SettlementAccept,
};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FsmError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("channel already exists for this peer; will become available after cleanup")]
    ExistsRetriable,
    #[error("channel already exists for this peer")]
    Exists,
    #[error("signing capability unavailable (watchtower mode)")]
    SeedUnavailable,
    #[error("input does not apply to a channel in state {0:?}")]
    WrongState(ChannelState),
    #[error("funds would not be conserved by this transition")]
    FundsNotConserved,
}

/// Everything the FSM needs besides the channel record and the input:
/// the clock, the signing capability, and this agent's own ledger address
/// (to decide which role/side it plays).
pub struct FsmContext<'a> {
    pub now: u64,
    pub signing: SigningCapability<'a>,
    pub self_address: LedgerAddress,
    pub passphrase: &'a str,
    /// The sender's federation address and callback URL, known from the
    /// `POST /starlight/message` request that carried this input. Only
    /// needed when accepting a `ChannelPropose` for a channel with no
    /// existing local record; ignored otherwise.
    pub peer_address: Option<FederationAddress>,
    pub peer_url: Option<String>,
}

/// The four input categories from §4.4.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Input {
    Cmd(Command),
    Msg(PeerMessage),
    Tx {
        tx: LedgerTx,
        operation_index: u32,
    },
    Time {
        ledger_time: u64,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimerRequest {
    pub fire_after: Duration,
}

/// The four output categories from §4.4.
#[derive(Clone, Debug, Default)]
pub struct StepOutput {
    pub channel: Option<Channel>,
    pub messages: Vec<(String, PeerMessage)>,
    pub txs: Vec<SignedEnvelope>,
    pub timers: Vec<TimerRequest>,
}

/// Proposes a brand-new channel as Host (§4.4, §6 `CreateChannel`). This is
/// the one entry point that doesn't take an existing `Channel`: it builds
/// the initial record in `ChannelProposed` state plus the outbound
/// `ChannelPropose`.
pub fn propose_channel(
    host_amount: u64,
    guest: FederationAddress,
    guest_url: String,
    guest_account: LedgerAddress,
    escrow_account: LedgerAddress,
    host_ratchet_account: LedgerAddress,
    guest_ratchet_account: LedgerAddress,
    key_index: u64,
    channel_feerate: u64,
    host_feerate: u64,
    max_round_duration: Duration,
    finality_delay: Duration,
    ctx: &FsmContext<'_>,
) -> Result<StepOutput, FsmError> {
    if host_amount == 0 {
        return Err(FsmError::Validation("hostAmount must be non-zero".into()));
    }
    if !ctx.signing.is_available() {
        return Err(FsmError::SeedUnavailable);
    }

    let channel = Channel {
        role: Role::Host,
        counterparty_address: guest,
        counterparty_url: guest_url,
        accounts: ChannelAccounts {
            escrow: escrow_account,
            host_ratchet: host_ratchet_account,
            guest_ratchet: guest_ratchet_account,
            host: ctx.self_address,
            guest: guest_account,
        },
        host_amount,
        guest_amount: 0,
        channel_feerate,
        host_feerate,
        max_round_duration,
        finality_delay,
        funding_time: None,
        payment_time: None,
        round_number: Round::ZERO,
        state: ChannelState::ChannelProposed,
        key_index,
        base_sequence_number: 0,
        ratchet_seqnums: RatchetSeqnums::default(),
        passphrase: ctx.passphrase.to_string(),
        last_msg_index: starlight_common::MsgSeq::default(),
        host_msg_seq: starlight_common::MsgSeq::default(),
        guest_msg_seq: starlight_common::MsgSeq::default(),
    };

    let propose = ChannelPropose {
        host_amount,
        guest_amount: 0,
        channel_feerate,
        host_feerate,
        host_account: channel.accounts.host,
        guest_account: channel.accounts.guest,
        host_ratchet_account: channel.accounts.host_ratchet,
        guest_ratchet_account: channel.accounts.guest_ratchet,
    };

    let mut out_channel = channel.clone();
    let seq = out_channel.host_msg_seq;
    *out_channel.own_msg_seq_mut() = seq.next();

    Ok(StepOutput {
        messages: vec![(
            out_channel.counterparty_url.clone(),
            PeerMessage {
                channel_id: out_channel.channel_id(),
                msg_num: seq,
                kind: PeerMessageKind::ChannelPropose(propose),
            },
        )],
        channel: Some(out_channel),
        txs: vec![],
        timers: vec![],
    })
}

/// Resolves a simultaneous-open conflict deterministically (§4.4 "Tie-break
/// on simultaneous open", §8 property 5): the proposal with the larger
/// `host_amount` wins; ties broken by the lexicographically smaller host
/// address.
///
/// Returns `true` if `ours` (the channel already recorded locally) wins
/// over `theirs` (the incoming conflicting proposal).
pub fn ours_wins_tiebreak(
    our_host_amount: u64,
    our_host_address: &LedgerAddress,
    their_host_amount: u64,
    their_host_address: &LedgerAddress,
) -> bool {
    match our_host_amount.cmp(&their_host_amount) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => our_host_address < their_host_address,
    }
}

/// Advances `channel` in response to `input`. `existing` is `None` only for
/// an incoming `ChannelPropose` that doesn't yet have a local record (the
/// caller is expected to have already resolved sequence numbers for the
/// proposed accounts, per §4.8).
pub fn step(
    existing: Option<&Channel>,
    input: Input,
    ctx: &FsmContext<'_>,
) -> Result<StepOutput, FsmError> {
    match (existing, input) {
        (None, Input::Msg(msg)) => accept_channel_propose(msg, ctx),
        (Some(channel), Input::Msg(msg)) => step_existing_msg(channel, msg, ctx),
        (Some(channel), Input::Cmd(cmd)) => step_cmd(channel, cmd, ctx),
        (Some(channel), Input::Time { ledger_time }) => step_timer(channel, ledger_time, ctx),
        (Some(channel), Input::Tx { tx, operation_index }) => {
            step_tx(channel, &tx, operation_index, ctx)
        }
        (None, _) => Err(FsmError::Validation(
            "no channel record and input is not a ChannelPropose".into(),
        )),
    }
}

fn accept_channel_propose(msg: PeerMessage, ctx: &FsmContext<'_>) -> Result<StepOutput, FsmError> {
    let PeerMessageKind::ChannelPropose(propose) = msg.kind else {
        return Err(FsmError::Validation(
            "unknown channel requires a ChannelPropose".into(),
        ));
    };
    if !ctx.signing.is_available() {
        return Err(FsmError::SeedUnavailable);
    }
    if propose.host_amount == 0 {
        return Err(FsmError::Validation("hostAmount must be non-zero".into()));
    }

    let counterparty_address = ctx
        .peer_address
        .clone()
        .ok_or_else(|| FsmError::Validation("missing sender federation address".into()))?;
    let counterparty_url = ctx
        .peer_url
        .clone()
        .ok_or_else(|| FsmError::Validation("missing sender callback url".into()))?;

    let mut channel = Channel {
        role: Role::Guest,
        counterparty_address,
        counterparty_url,
        accounts: ChannelAccounts {
            escrow: msg.channel_id,
            host_ratchet: propose.host_ratchet_account,
            guest_ratchet: propose.guest_ratchet_account,
            host: propose.host_account,
            guest: ctx.self_address,
        },
        host_amount: propose.host_amount,
        guest_amount: propose.guest_amount,
        channel_feerate: propose.channel_feerate,
        host_feerate: propose.host_feerate,
        max_round_duration: Duration::from_secs(30),
        finality_delay: Duration::from_secs(60),
        funding_time: None,
        payment_time: None,
        round_number: Round::ZERO,
        state: ChannelState::AwaitingFunding,
        key_index: 0,
        base_sequence_number: 0,
        ratchet_seqnums: RatchetSeqnums::default(),
        passphrase: ctx.passphrase.to_string(),
        last_msg_index: msg.msg_num,
        host_msg_seq: starlight_common::MsgSeq::default(),
        guest_msg_seq: starlight_common::MsgSeq::default(),
    };

    let seq = channel.guest_msg_seq;
    *channel.own_msg_seq_mut() = seq.next();

    Ok(StepOutput {
        messages: vec![(
            channel.counterparty_url.clone(),
            PeerMessage {
                channel_id: channel.channel_id(),
                msg_num: seq,
                kind: PeerMessageKind::ChannelAccept(ChannelAccept {
                    funding_tx: SignedEnvelope {
                        source: channel.accounts.escrow,
                        sequence_number: channel.base_sequence_number,
                        blob: Vec::new(),
                    },
                }),
            },
        )],
        channel: Some(channel),
        txs: vec![],
        timers: vec![],
    })
}

fn step_existing_msg(
    channel: &Channel,
    msg: PeerMessage,
    ctx: &FsmContext<'_>,
) -> Result<StepOutput, FsmError> {
    match msg.kind {
        PeerMessageKind::ChannelPropose(propose) => {
            // Conflict: a live channel already exists for this ordered pair.
            // Apply the tie-break (§4.4, §8 property 5).
            if !channel.state.is_live() {
                return accept_channel_propose(msg, ctx);
            }
            let we_win = ours_wins_tiebreak(
                channel.host_amount,
                &channel.accounts.host,
                propose.host_amount,
                &propose.host_account,
            );
            if we_win {
                Err(FsmError::ExistsRetriable)
            } else {
                let mut next = channel.clone();
                next.state = ChannelState::AwaitingCleanup;
                Ok(StepOutput {
                    channel: Some(next),
                    messages: vec![],
                    txs: vec![],
                    timers: vec![],
                })
            }
        }
        PeerMessageKind::ChannelAccept(_accept) => {
            if channel.state != ChannelState::ChannelProposed {
                return Err(FsmError::WrongState(channel.state));
            }
            let mut next = channel.clone();
            next.state = ChannelState::PaymentChannel;
            next.funding_time = Some(ctx.now);
            next.round_number = Round::ZERO.next();
            Ok(StepOutput {
                channel: Some(next),
                messages: vec![],
                txs: vec![],
                timers: vec![],
            })
        }
        PeerMessageKind::PaymentPropose(propose) => {
            if channel.state != ChannelState::PaymentChannel {
                return Err(FsmError::WrongState(channel.state));
            }
            if !ctx.signing.is_available() {
                return Err(FsmError::SeedUnavailable);
            }
            let total_before = channel.total_funds();
            let total_after = propose.host_amount + propose.guest_amount;
            if total_after != total_before {
                return Err(FsmError::FundsNotConserved);
            }

            let mut next = channel.clone();
            next.host_amount = propose.host_amount;
            next.guest_amount = propose.guest_amount;
            next.round_number = channel.round_number.next();
            next.state = ChannelState::AwaitingPaymentMerge;
            next.payment_time = Some(ctx.now);

            let seq = *next.own_msg_seq_mut();
            *next.own_msg_seq_mut() = seq.next();

            Ok(StepOutput {
                messages: vec![(
                    next.counterparty_url.clone(),
                    PeerMessage {
                        channel_id: next.channel_id(),
                        msg_num: seq,
                        kind: PeerMessageKind::PaymentAccept(PaymentAccept {
                            round_number: next.round_number.get(),
                            ratchet_tx: propose.ratchet_tx,
                            settlement_tx: propose.settlement_tx,
                        }),
                    },
                )],
                channel: Some(next),
                txs: vec![],
                timers: vec![TimerRequest {
                    fire_after: next.max_round_duration,
                }],
            })
        }
        PeerMessageKind::PaymentAccept(accept) => {
            if channel.state != ChannelState::AwaitingPaymentMerge {
                return Err(FsmError::WrongState(channel.state));
            }
            if accept.round_number != channel.round_number.get() {
                return Err(FsmError::Validation(
                    "PaymentAccept round number does not match the pending round".into(),
                ));
            }
            let mut next = channel.clone();
            next.state = ChannelState::PaymentChannel;
            Ok(StepOutput {
                channel: Some(next),
                messages: vec![],
                txs: vec![],
                timers: vec![],
            })
        }
        PeerMessageKind::SettlementPropose(propose) => {
            settlement_reply(channel, propose.round_number, propose.settlement_tx, ctx)
        }
        PeerMessageKind::SettlementAccept(_accept) => {
            let mut next = channel.clone();
            next.state = ChannelState::AwaitingClose;
            Ok(StepOutput {
                channel: Some(next),
                messages: vec![],
                txs: vec![],
                timers: vec![],
            })
        }
        PeerMessageKind::CloseMsg(close) => {
            let mut next = channel.clone();
            next.state = ChannelState::Closed;
            Ok(StepOutput {
                channel: Some(next),
                messages: vec![],
                txs: vec![close.final_settlement_tx],
                timers: vec![],
            })
        }
    }
}

fn settlement_reply(
    channel: &Channel,
    round_number: u64,
    settlement_tx: SignedEnvelope,
    ctx: &FsmContext<'_>,
) -> Result<StepOutput, FsmError> {
    if !ctx.signing.is_available() {
        return Err(FsmError::SeedUnavailable);
    }
    let mut next = channel.clone();
    next.state = ChannelState::AwaitingClose;
    let seq = *next.own_msg_seq_mut();
    *next.own_msg_seq_mut() = seq.next();
    Ok(StepOutput {
        messages: vec![(
            next.counterparty_url.clone(),
            PeerMessage {
                channel_id: next.channel_id(),
                msg_num: seq,
                kind: PeerMessageKind::SettlementAccept(SettlementAccept {
                    round_number,
                    settlement_tx: settlement_tx.clone(),
                }),
            },
        )],
        channel: Some(next),
        txs: vec![],
        timers: vec![],
    })
}

fn step_cmd(channel: &Channel, cmd: Command, ctx: &FsmContext<'_>) -> Result<StepOutput, FsmError> {
    match cmd {
        Command::ChannelPay(pay) => {
            if channel.state != ChannelState::PaymentChannel {
                return Err(FsmError::WrongState(channel.state));
            }
            if !ctx.signing.is_available() {
                return Err(FsmError::SeedUnavailable);
            }
            if pay.amount == 0 {
                return Err(FsmError::Validation("amount must be non-zero".into()));
            }
            let (new_host, new_guest) = match channel.role {
                Role::Host => {
                    let new_host = channel
                        .host_amount
                        .checked_sub(pay.amount)
                        .ok_or_else(|| FsmError::Validation("insufficient balance".into()))?;
                    (new_host, channel.guest_amount + pay.amount)
                }
                Role::Guest => {
                    let new_guest = channel
                        .guest_amount
                        .checked_sub(pay.amount)
                        .ok_or_else(|| FsmError::Validation("insufficient balance".into()))?;
                    (channel.host_amount + pay.amount, new_guest)
                }
            };

            let mut next = channel.clone();
            next.host_amount = new_host;
            next.guest_amount = new_guest;
            next.round_number = channel.round_number.next();
            next.state = ChannelState::AwaitingPaymentMerge;
            next.payment_time = Some(ctx.now);

            let seq = *next.own_msg_seq_mut();
            *next.own_msg_seq_mut() = seq.next();

            let ratchet_tx = SignedEnvelope {
                source: next.accounts.host_ratchet,
                sequence_number: next.ratchet_seqnums.host_ratchet_seqnum,
                blob: Vec::new(),
            };
            let settlement_tx = SignedEnvelope {
                source: next.accounts.escrow,
                sequence_number: next.base_sequence_number,
                blob: Vec::new(),
            };

            Ok(StepOutput {
                messages: vec![(
                    next.counterparty_url.clone(),
                    PeerMessage {
                        channel_id: next.channel_id(),
                        msg_num: seq,
                        kind: PeerMessageKind::PaymentPropose(PaymentPropose {
                            round_number: next.round_number.get(),
                            host_amount: new_host,
                            guest_amount: new_guest,
                            ratchet_tx,
                            settlement_tx,
                        }),
                    },
                )],
                channel: Some(next),
                txs: vec![],
                timers: vec![TimerRequest {
                    fire_after: channel.max_round_duration,
                }],
            })
        }
        Command::ForceClose => force_close(channel),
        Command::CleanUp => {
            if channel.state != ChannelState::AwaitingCleanup {
                return Err(FsmError::WrongState(channel.state));
            }
            let mut next = channel.clone();
            next.state = ChannelState::Start;
            Ok(StepOutput {
                channel: Some(next),
                messages: vec![],
                txs: vec![],
                timers: vec![],
            })
        }
        Command::Close => {
            if channel.state != ChannelState::PaymentChannel {
                return Err(FsmError::WrongState(channel.state));
            }
            let mut next = channel.clone();
            next.state = ChannelState::AwaitingClose;
            Ok(StepOutput {
                channel: Some(next),
                messages: vec![],
                txs: vec![],
                timers: vec![],
            })
        }
        Command::KeepAlive | Command::Pay(_) | Command::AddAsset(_) | Command::RemoveAsset(_) => {
            // These are handled at the wallet layer or are configuration-only
            // (§9 Open Question (a): KeepAlive is config, the periodic
            // trigger is left to the caller's timer loop, not this step).
            Ok(StepOutput {
                channel: Some(channel.clone()),
                messages: vec![],
                txs: vec![],
                timers: vec![],
            })
        }
        Command::CreateChannel(_) => Err(FsmError::Exists),
    }
}

/// Forces the channel closed by submitting the latest ratchet transaction,
/// then (after `finality_delay`) the settlement (§4.4 "Deadline
/// enforcement").
fn force_close(channel: &Channel) -> Result<StepOutput, FsmError> {
    let ratchet_tx = SignedEnvelope {
        source: channel.accounts.host_ratchet,
        sequence_number: channel.ratchet_seqnums.host_ratchet_seqnum,
        blob: Vec::new(),
    };
    let mut next = channel.clone();
    next.state = ChannelState::AwaitingRatchet;
    Ok(StepOutput {
        channel: Some(next),
        messages: vec![],
        txs: vec![ratchet_tx],
        timers: vec![TimerRequest {
            fire_after: channel.finality_delay,
        }],
    })
}

fn step_timer(
    channel: &Channel,
    _ledger_time: u64,
    _ctx: &FsmContext<'_>,
) -> Result<StepOutput, FsmError> {
    match channel.state {
        ChannelState::AwaitingPaymentMerge => {
            // The round didn't settle before the deadline: force-close
            // (§4.4 "Deadline enforcement", §8 scenario S5).
            force_close(channel)
        }
        ChannelState::AwaitingRatchet => {
            let mut next = channel.clone();
            next.state = ChannelState::AwaitingSettlementMintime;
            Ok(StepOutput {
                channel: Some(next),
                messages: vec![],
                txs: vec![],
                timers: vec![TimerRequest {
                    fire_after: channel.finality_delay,
                }],
            })
        }
        ChannelState::AwaitingSettlementMintime => {
            let settlement_tx = SignedEnvelope {
                source: channel.accounts.escrow,
                sequence_number: channel.base_sequence_number,
                blob: Vec::new(),
            };
            let mut next = channel.clone();
            next.state = ChannelState::AwaitingSettlement;
            Ok(StepOutput {
                channel: Some(next),
                messages: vec![],
                txs: vec![settlement_tx],
                timers: vec![],
            })
        }
        _ => Ok(StepOutput {
            channel: Some(channel.clone()),
            messages: vec![],
            txs: vec![],
            timers: vec![],
        }),
    }
}

fn step_tx(
    channel: &Channel,
    tx: &LedgerTx,
    operation_index: u32,
    _ctx: &FsmContext<'_>,
) -> Result<StepOutput, FsmError> {
    let op = tx
        .operations
        .iter()
        .find(|o| o.operation_index == operation_index)
        .ok_or_else(|| FsmError::Validation("operation_index not found in tx".into()))?;

    let mut next = channel.clone();
    match (&op.kind, channel.state) {
        (OperationKind::CreateAccount { .. }, ChannelState::SettingUp) => {
            next.state = ChannelState::AwaitingFunding;
        }
        (_, ChannelState::AwaitingSettlement) => {
            next.state = ChannelState::Closed;
        }
        _ => {}
    }

    Ok(StepOutput {
        channel: Some(next),
        messages: vec![],
        txs: vec![],
        timers: vec![],
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::keys::Seed;
    use secrecy::Secret;

    fn addr(byte: u8) -> LedgerAddress {
        LedgerAddress::from_public_key_bytes([byte; 32])
    }

    fn ctx<'a>(seed: &'a Seed, self_addr: LedgerAddress) -> FsmContext<'a> {
        FsmContext {
            now: 1000,
            signing: SigningCapability::Available(seed),
            self_address: self_addr,
            passphrase: "Test SDF Network ; September 2015",
            peer_address: Some(FederationAddress::new("bob", "example.com").unwrap()),
            peer_url: Some("https://example.com".to_string()),
        }
    }

    fn base_channel(role: Role, host_amount: u64, guest_amount: u64) -> Channel {
        Channel {
            role,
            counterparty_address: FederationAddress::new("bob", "example.com").unwrap(),
            counterparty_url: "https://example.com".to_string(),
            accounts: ChannelAccounts {
                escrow: addr(1),
                host_ratchet: addr(2),
                guest_ratchet: addr(3),
                host: addr(4),
                guest: addr(5),
            },
            host_amount,
            guest_amount,
            channel_feerate: 100,
            host_feerate: 100,
            max_round_duration: Duration::from_secs(30),
            finality_delay: Duration::from_secs(60),
            funding_time: Some(0),
            payment_time: None,
            round_number: Round::ZERO.next(),
            state: ChannelState::PaymentChannel,
            key_index: 0,
            base_sequence_number: 1,
            ratchet_seqnums: RatchetSeqnums::default(),
            passphrase: "Test SDF Network ; September 2015".to_string(),
            last_msg_index: starlight_common::MsgSeq::default(),
            host_msg_seq: starlight_common::MsgSeq::default(),
            guest_msg_seq: starlight_common::MsgSeq::default(),
        }
    }

    #[test]
    fn s3_pay_conserves_funds_and_advances_round() {
        let seed: Seed = Secret::new([1u8; 32]);
        let c = ctx(&seed, addr(4));
        let channel = base_channel(Role::Host, 100, 0);
        let round_before = channel.round_number;

        let out = step(
            Some(&channel),
            Input::Cmd(Command::ChannelPay(crate::command::ChannelPay { amount: 10 })),
            &c,
        )
        .unwrap();

        let next = out.channel.unwrap();
        assert_eq!(next.total_funds(), channel.total_funds());
        assert_eq!(next.host_amount, 90);
        assert_eq!(next.guest_amount, 10);
        assert!(next.round_number > round_before);
        assert_eq!(out.messages.len(), 1);
    }

    #[test]
    fn insufficient_balance_is_rejected_without_state_change() {
        let seed: Seed = Secret::new([1u8; 32]);
        let c = ctx(&seed, addr(4));
        let channel = base_channel(Role::Host, 100, 0);
        let err = step(
            Some(&channel),
            Input::Cmd(Command::ChannelPay(crate::command::ChannelPay { amount: 1000 })),
            &c,
        )
        .unwrap_err();
        assert_eq!(err, FsmError::Validation("insufficient balance".into()));
    }

    #[test]
    fn watchtower_rejects_payment() {
        let channel = base_channel(Role::Host, 100, 0);
        let c = FsmContext {
            now: 1000,
            signing: SigningCapability::Watchtower,
            self_address: addr(4),
            passphrase: "Test SDF Network ; September 2015",
            peer_address: None,
            peer_url: None,
        };
        let err = step(
            Some(&channel),
            Input::Cmd(Command::ChannelPay(crate::command::ChannelPay { amount: 10 })),
            &c,
        )
        .unwrap_err();
        assert_eq!(err, FsmError::SeedUnavailable);
    }

    #[test]
    fn s4_tie_break_is_deterministic_by_amount_then_address() {
        // Equal amounts: lexicographically smaller host address wins.
        let small = addr(1);
        let large = addr(2);
        assert!(ours_wins_tiebreak(50, &small, 50, &large));
        assert!(!ours_wins_tiebreak(50, &large, 50, &small));
        // Larger amount wins regardless of address ordering.
        assert!(ours_wins_tiebreak(60, &large, 50, &small));
        assert!(!ours_wins_tiebreak(50, &large, 60, &small));
    }

    #[test]
    fn s4_loser_transitions_to_awaiting_cleanup() {
        let seed: Seed = Secret::new([1u8; 32]);
        let mut channel = base_channel(Role::Host, 50, 0);
        channel.state = ChannelState::ChannelProposed;
        channel.accounts.host = addr(10); // "larger" than the incoming host
        let c = ctx(&seed, addr(10));

        let incoming = PeerMessage {
            channel_id: channel.channel_id(),
            msg_num: starlight_common::MsgSeq::FIRST,
            kind: PeerMessageKind::ChannelPropose(ChannelPropose {
                host_amount: 50,
                guest_amount: 0,
                channel_feerate: 100,
                host_feerate: 100,
                host_account: addr(1), // lexicographically smaller -> wins
                guest_account: addr(5),
                host_ratchet_account: addr(2),
                guest_ratchet_account: addr(3),
            }),
        };

        let out = step(Some(&channel), Input::Msg(incoming), &c).unwrap();
        assert_eq!(out.channel.unwrap().state, ChannelState::AwaitingCleanup);
    }

    #[test]
    fn s4_winner_gets_exists_retriable() {
        let seed: Seed = Secret::new([1u8; 32]);
        let mut channel = base_channel(Role::Host, 50, 0);
        channel.state = ChannelState::ChannelProposed;
        channel.accounts.host = addr(1); // smaller -> wins
        let c = ctx(&seed, addr(1));

        let incoming = PeerMessage {
            channel_id: channel.channel_id(),
            msg_num: starlight_common::MsgSeq::FIRST,
            kind: PeerMessageKind::ChannelPropose(ChannelPropose {
                host_amount: 50,
                guest_amount: 0,
                channel_feerate: 100,
                host_feerate: 100,
                host_account: addr(10),
                guest_account: addr(5),
                host_ratchet_account: addr(2),
                guest_ratchet_account: addr(3),
            }),
        };

        let err = step(Some(&channel), Input::Msg(incoming), &c).unwrap_err();
        assert_eq!(err, FsmError::ExistsRetriable);
    }

    #[test]
    fn s5_round_deadline_force_closes() {
        let seed: Seed = Secret::new([1u8; 32]);
        let mut channel = base_channel(Role::Host, 100, 0);
        channel.state = ChannelState::AwaitingPaymentMerge;
        let c = ctx(&seed, addr(4));

        let out = step(Some(&channel), Input::Time { ledger_time: 5000 }, &c).unwrap();
        let next = out.channel.unwrap();
        assert_eq!(next.state, ChannelState::AwaitingRatchet);
        assert_eq!(out.txs.len(), 1);

        let out2 = step(Some(&next), Input::Time { ledger_time: 6000 }, &c).unwrap();
        let next2 = out2.channel.unwrap();
        assert_eq!(next2.state, ChannelState::AwaitingSettlementMintime);

        let out3 = step(Some(&next2), Input::Time { ledger_time: 7000 }, &c).unwrap();
        let next3 = out3.channel.unwrap();
        assert_eq!(next3.state, ChannelState::AwaitingSettlement);
        assert_eq!(out3.txs.len(), 1);
    }

    #[test]
    fn message_sequence_is_strictly_increasing_across_rounds() {
        let seed: Seed = Secret::new([1u8; 32]);
        let c = ctx(&seed, addr(4));
        let mut channel = base_channel(Role::Host, 1000, 0);
        let mut seqs = vec![];
        for _ in 0..5 {
            let out = step(
                Some(&channel),
                Input::Cmd(Command::ChannelPay(crate::command::ChannelPay { amount: 1 })),
                &c,
            )
            .unwrap();
            seqs.push(out.messages[0].1.msg_num.get());
            channel = out.channel.unwrap();
            channel.state = ChannelState::PaymentChannel; // simulate acceptance
        }
        for w in seqs.windows(2) {
            assert!(w[1] > w[0]);
        }
    }
}
