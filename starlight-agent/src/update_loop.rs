//! Drives `starlight_ln::fsm::step` inside one store write-transaction per
//! committed input, and publishes the resulting `Update` (§4.5): fetch the
//! channel, step it, commit the new state plus its outgoing messages/txs as
//! task-basket entries plus exactly one audit `Update`, then (only after
//! the transaction has landed) report which timers the caller must arm.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use starlight_common::federation::FederationAddress;
use starlight_common::LedgerAddress;
use starlight_ln::fsm::{self, FsmContext, FsmError};
use starlight_ln::fsm::Input;
use starlight_ln::task::{Task, TaskKey, TaskKind};
use starlight_ln::update::{UpdateInput, UpdateSnapshot};
use thiserror::Error;
use tokio::sync::Notify;

use crate::store::{Commit, CommitChannel, OutboundMessage, Store, StoreError};

#[derive(Debug, Error)]
pub enum UpdateLoopError {
    #[error("fsm rejected the input: {0}")]
    Fsm(#[from] FsmError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// A timer the caller must arm after a successful commit (§4.5: arming a
/// timer is a side effect, deferred until the write-transaction has
/// actually landed, same as task-basket wakeups).
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ArmedTimer {
    pub channel_id: LedgerAddress,
    pub fire_after: Duration,
}

pub struct UpdateLoop {
    store: Arc<Store>,
    task_notify: Arc<Notify>,
}

impl UpdateLoop {
    pub fn new(store: Arc<Store>, task_notify: Arc<Notify>) -> Self {
        Self {
            store,
            task_notify,
        }
    }

    /// Proposes a brand-new channel as Host (§4.4, §6 `CreateChannel`);
    /// the one entry point with no existing channel record to fetch.
    #[allow(clippy::too_many_arguments)]
    pub fn propose_channel(
        &self,
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
    ) -> Result<Vec<ArmedTimer>, UpdateLoopError> {
        let output = fsm::propose_channel(
            host_amount,
            guest.clone(),
            guest_url,
            guest_account,
            escrow_account,
            host_ratchet_account,
            guest_ratchet_account,
            key_index,
            channel_feerate,
            host_feerate,
            max_round_duration,
            finality_delay,
            ctx,
        )?;
        let update_input = UpdateInput::ChannelCmd {
            channel_id: escrow_account,
            command: starlight_ln::command::Command::CreateChannel(
                starlight_ln::command::CreateChannel {
                    guest,
                    host_amount,
                },
            ),
        };
        self.commit_output(escrow_account, update_input, output)
    }

    /// Applies an incoming peer message or local command against the
    /// channel keyed by `channel_id`, or (for an unseen `ChannelPropose`)
    /// creates its guest-side record (§4.5).
    pub fn apply(
        &self,
        channel_id: LedgerAddress,
        input: Input,
        ctx: &FsmContext<'_>,
    ) -> Result<Vec<ArmedTimer>, UpdateLoopError> {
        let existing = self.store.get_channel(&channel_id)?;
        let update_input = input_to_update_input(channel_id, &input);
        let output = fsm::step(existing.as_ref(), input, ctx)?;
        self.commit_output(channel_id, update_input, output)
    }

    fn commit_output(
        &self,
        channel_id: LedgerAddress,
        update_input: UpdateInput,
        output: fsm::StepOutput,
    ) -> Result<Vec<ArmedTimer>, UpdateLoopError> {
        let round = output
            .channel
            .as_ref()
            .map(|c| c.round_number.get())
            .unwrap_or(0);

        let mut tasks = Vec::with_capacity(output.messages.len() + output.txs.len());
        for (destination_url, message) in &output.messages {
            tasks.push(Task::MsgTask {
                key: TaskKey {
                    channel_id,
                    round,
                    kind: TaskKind::DeliverMsg,
                },
                destination_url: destination_url.clone(),
                message: message.clone(),
            });
        }
        for envelope in &output.txs {
            tasks.push(Task::TxTask {
                key: TaskKey {
                    channel_id,
                    round,
                    kind: TaskKind::SubmitTx,
                },
                owner: channel_id,
                envelope: envelope.clone(),
            });
        }

        let messages = output
            .messages
            .iter()
            .map(|(url, message)| OutboundMessage {
                destination_url: url.clone(),
                message: message.clone(),
            })
            .collect();

        let update_snapshot = match &output.channel {
            Some(channel) => UpdateSnapshot::Channel(Box::new(channel.clone())),
            None => UpdateSnapshot::None,
        };

        let timers = output
            .timers
            .iter()
            .map(|t| ArmedTimer {
                channel_id,
                fire_after: t.fire_after,
            })
            .collect();

        let commit = Commit {
            channel: output.channel.map(|channel| CommitChannel {
                channel_id,
                ordered_pair: channel.ordered_pair(),
                channel,
            }),
            wallet: None,
            messages,
            tasks,
            update_input: Some(update_input),
            update_snapshot,
        };

        self.store.commit(commit)?;
        if !output.messages.is_empty() || !output.txs.is_empty() {
            self.task_notify.notify_one();
        }

        Ok(timers)
    }
}

fn input_to_update_input(channel_id: LedgerAddress, input: &Input) -> UpdateInput {
    match input {
        Input::Cmd(command) => UpdateInput::ChannelCmd {
            channel_id,
            command: command.clone(),
        },
        Input::Msg(message) => UpdateInput::ChannelMsg {
            channel_id,
            message: message.clone(),
        },
        Input::Tx { tx, operation_index } => UpdateInput::Tx {
            channel_id: Some(channel_id),
            tx: tx.clone(),
            operation_index: *operation_index,
        },
        Input::Time { ledger_time } => UpdateInput::Timer {
            channel_id,
            ledger_time: *ledger_time,
        },
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use secrecy::Secret;
    use starlight_ln::command::{ChannelPay, Command};
    use starlight_ln::keys::{Seed, SigningCapability};

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

    #[test]
    fn proposing_a_channel_enqueues_the_propose_message_and_arms_no_timer() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let loop_ = UpdateLoop::new(store.clone(), Arc::new(Notify::new()));
        let seed: Seed = Secret::new([7u8; 32]);
        let c = ctx(&seed, addr(1));

        let timers = loop_
            .propose_channel(
                1_000,
                FederationAddress::new("bob", "example.com").unwrap(),
                "https://example.com".to_string(),
                addr(2),
                addr(3),
                addr(4),
                addr(5),
                0,
                100,
                100,
                Duration::from_secs(30),
                Duration::from_secs(60),
                &c,
            )
            .unwrap();
        assert!(timers.is_empty());

        let channel = store.get_channel(&addr(3)).unwrap().unwrap();
        assert_eq!(channel.host_amount, 1_000);
        let pending = store.list_pending_tasks().unwrap();
        assert_eq!(pending.len(), 1);
        assert!(matches!(pending[0].1, Task::MsgTask { .. }));
    }

    #[test]
    fn paying_in_channel_arms_a_round_timer_and_enqueues_message() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let loop_ = UpdateLoop::new(store.clone(), Arc::new(Notify::new()));
        let seed: Seed = Secret::new([7u8; 32]);
        let c = ctx(&seed, addr(1));

        loop_
            .propose_channel(
                1_000,
                FederationAddress::new("bob", "example.com").unwrap(),
                "https://example.com".to_string(),
                addr(2),
                addr(3),
                addr(4),
                addr(5),
                0,
                100,
                100,
                Duration::from_secs(30),
                Duration::from_secs(60),
                &c,
            )
            .unwrap();

        let mut channel = store.get_channel(&addr(3)).unwrap().unwrap();
        channel.state = starlight_ln::channel::ChannelState::PaymentChannel;
        channel.round_number = starlight_common::Round::ZERO.next();
        store
            .commit(Commit {
                channel: Some(CommitChannel {
                    channel_id: addr(3),
                    ordered_pair: channel.ordered_pair(),
                    channel,
                }),
                update_input: Some(UpdateInput::Init),
                ..Default::default()
            })
            .unwrap();

        let timers = loop_
            .apply(
                addr(3),
                Input::Cmd(Command::ChannelPay(ChannelPay { amount: 10 })),
                &c,
            )
            .unwrap();
        assert_eq!(timers.len(), 1);
        assert_eq!(timers[0].channel_id, addr(3));
    }
}
