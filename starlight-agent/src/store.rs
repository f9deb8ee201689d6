//! The persistent, transactional key-value store (§4.1). `sled::Tree`
//! stands in for a "bucket"; `sled::Transaction` stands in for the spec's
//! write-transaction. Bucket layout:
//!
//! ```text
//! agent/config
//! agent/wallet
//! agent/primary_acct
//! agent/encrypted_seed
//! agent/next_keypath_index
//! agent/ready
//! channels/<channel_id>            -> Channel
//! pairs/<host><guest>              -> channel_id          (secondary index)
//! messages/<channel_id>/<seq>      -> OutboundMessage
//! updates/<seq>                    -> Update
//! tasks/<task_id>                  -> Task
//! ```
//!
//! Every mutating operation opens exactly one `sled` transaction spanning
//! whichever of these trees it touches. `sled` may retry a transaction
//! closure on conflict, so the closures below must stay free of side
//! effects; anything that should run exactly once per commit (arming
//! timers, waking subscribers) is returned from [`Store::commit`] for the
//! caller to run after the transaction closes.

use std::path::Path;

use serde::{de::DeserializeOwned, Serialize};
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, Transactional, TransactionError,
    TransactionalTree,
};
use starlight_common::{Config, LedgerAddress};
use starlight_ln::channel::{Channel, ChannelState};
use starlight_ln::message::PeerMessage;
use starlight_ln::task::{Task, TaskKey};
use starlight_ln::update::{Update, UpdateInput, UpdateSnapshot};
use starlight_ln::wallet::Wallet;

const TREE_AGENT: &str = "agent";
const TREE_CHANNELS: &str = "channels";
const TREE_PAIRS: &str = "pairs";
const TREE_MESSAGES: &str = "messages";
const TREE_UPDATES: &str = "updates";
const TREE_TASKS: &str = "tasks";
const TREE_TASK_INDEX: &str = "task_index";

const KEY_CONFIG: &[u8] = b"config";
const KEY_WALLET: &[u8] = b"wallet";
const KEY_PRIMARY_ACCT: &[u8] = b"primary_acct";
const KEY_ENCRYPTED_SEED: &[u8] = b"encrypted_seed";
const KEY_NEXT_KEYPATH_INDEX: &[u8] = b"next_keypath_index";
const KEY_READY: &[u8] = b"ready";
const KEY_UPDATE_SEQ: &[u8] = b"update_seq";
const KEY_TASK_SEQ: &[u8] = b"task_seq";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage engine error: {0}")]
    Sled(#[from] sled::Error),
    #[error("(de)serialization error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("a live channel already exists between this ordered pair")]
    PairConflict,
    #[error("not found")]
    NotFound,
}

impl From<TransactionError<StoreError>> for StoreError {
    fn from(e: TransactionError<StoreError>) -> Self {
        match e {
            TransactionError::Abort(e) => e,
            TransactionError::Storage(e) => StoreError::Sled(e),
        }
    }
}

fn get<T: DeserializeOwned>(tree: &sled::Tree, key: &[u8]) -> Result<Option<T>, StoreError> {
    match tree.get(key)? {
        Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
        None => Ok(None),
    }
}

fn put<T: Serialize>(tree: &sled::Tree, key: &[u8], value: &T) -> Result<(), StoreError> {
    let bytes = bincode::serialize(value)?;
    tree.insert(key, bytes)?;
    Ok(())
}

fn tx_get<T: DeserializeOwned>(
    tree: &TransactionalTree,
    key: &[u8],
) -> ConflictableTransactionResult<Option<T>, StoreError> {
    match tree.get(key)? {
        Some(bytes) => bincode::deserialize(&bytes)
            .map(Some)
            .map_err(|e| ConflictableTransactionError::Abort(StoreError::Encode(e))),
        None => Ok(None),
    }
}

fn tx_put<T: Serialize>(
    tree: &TransactionalTree,
    key: &[u8],
    value: &T,
) -> ConflictableTransactionResult<(), StoreError> {
    let bytes = bincode::serialize(value)
        .map_err(|e| ConflictableTransactionError::Abort(StoreError::Encode(e)))?;
    tree.insert(key, bytes)?;
    Ok(())
}

fn pair_key(pair: &(LedgerAddress, LedgerAddress)) -> Vec<u8> {
    let mut key = Vec::with_capacity(64);
    key.extend_from_slice(pair.0.as_bytes());
    key.extend_from_slice(pair.1.as_bytes());
    key
}

fn message_key(channel_id: &LedgerAddress, seq: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(40);
    key.extend_from_slice(channel_id.as_bytes());
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

/// An outbound message persisted for delivery, paired with the URL it is
/// destined for (`PeerMessage` itself carries no addressing information).
#[derive(Clone, Debug, Serialize, serde::Deserialize)]
pub struct OutboundMessage {
    pub destination_url: String,
    pub message: PeerMessage,
}

/// The channel-side half of a commit: the new channel record plus the
/// ordered pair it occupies, so the store can maintain the at-most-one-live-
/// channel-per-pair index (§3, §8 property 4).
pub struct CommitChannel {
    pub channel_id: LedgerAddress,
    pub channel: Channel,
    pub ordered_pair: (LedgerAddress, LedgerAddress),
}

/// Everything one FSM step (or wallet-operation application) produces that
/// must land in the store atomically (§4.5 "exactly one update-loop write
/// transaction per committed step").
pub struct Commit {
    pub channel: Option<CommitChannel>,
    pub wallet: Option<Wallet>,
    pub messages: Vec<OutboundMessage>,
    pub tasks: Vec<Task>,
    pub update_input: Option<UpdateInput>,
    pub update_snapshot: UpdateSnapshot,
}

impl Default for Commit {
    fn default() -> Self {
        Commit {
            channel: None,
            wallet: None,
            messages: Vec::new(),
            tasks: Vec::new(),
            update_input: None,
            update_snapshot: UpdateSnapshot::None,
        }
    }
}

pub struct Store {
    db: sled::Db,
    agent: sled::Tree,
    channels: sled::Tree,
    pairs: sled::Tree,
    messages: sled::Tree,
    updates: sled::Tree,
    tasks: sled::Tree,
    task_index: sled::Tree,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Opens a temporary, in-memory store. Used by tests and by
    /// `FakeLedgerClient`-backed integration tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, StoreError> {
        Ok(Self {
            agent: db.open_tree(TREE_AGENT)?,
            channels: db.open_tree(TREE_CHANNELS)?,
            pairs: db.open_tree(TREE_PAIRS)?,
            messages: db.open_tree(TREE_MESSAGES)?,
            updates: db.open_tree(TREE_UPDATES)?,
            tasks: db.open_tree(TREE_TASKS)?,
            task_index: db.open_tree(TREE_TASK_INDEX)?,
            db,
        })
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    // --- agent bucket --- //

    pub fn get_config(&self) -> Result<Option<Config>, StoreError> {
        get(&self.agent, KEY_CONFIG)
    }

    pub fn put_config(&self, config: &Config) -> Result<(), StoreError> {
        put(&self.agent, KEY_CONFIG, config)
    }

    pub fn get_wallet(&self) -> Result<Option<Wallet>, StoreError> {
        get(&self.agent, KEY_WALLET)
    }

    pub fn get_primary_account(&self) -> Result<Option<LedgerAddress>, StoreError> {
        get(&self.agent, KEY_PRIMARY_ACCT)
    }

    pub fn put_primary_account(&self, addr: &LedgerAddress) -> Result<(), StoreError> {
        put(&self.agent, KEY_PRIMARY_ACCT, addr)
    }

    pub fn get_encrypted_seed(&self) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.agent.get(KEY_ENCRYPTED_SEED)?.map(|v| v.to_vec()))
    }

    pub fn put_encrypted_seed(&self, blob: &[u8]) -> Result<(), StoreError> {
        self.agent.insert(KEY_ENCRYPTED_SEED, blob)?;
        Ok(())
    }

    pub fn next_keypath_index(&self) -> Result<u64, StoreError> {
        let current: u64 = get(&self.agent, KEY_NEXT_KEYPATH_INDEX)?.unwrap_or(0);
        let next = current
            .checked_add(starlight_ln::keys::KEYPATH_SLOTS_PER_CHANNEL)
            .expect("keypath index overflowed u64");
        put(&self.agent, KEY_NEXT_KEYPATH_INDEX, &next)?;
        Ok(current)
    }

    /// Next `round` value for a wallet-level task (`Pay`/`AddAsset`/
    /// `RemoveAsset`/`KeepAlive`): these commands never touch a channel, so
    /// they have no FSM-assigned round number of their own, but the task
    /// basket's idempotency key still needs one (§4.2 `(channel_id, round,
    /// kind)` where `channel_id` is the primary account here).
    pub fn next_wallet_op_seq(&self) -> Result<u64, StoreError> {
        const KEY_WALLET_OP_SEQ: &[u8] = b"wallet_op_seq";
        let current: u64 = get(&self.agent, KEY_WALLET_OP_SEQ)?.unwrap_or(0);
        let next = current.checked_add(1).expect("wallet op sequence overflowed u64");
        put(&self.agent, KEY_WALLET_OP_SEQ, &next)?;
        Ok(current)
    }

    pub fn is_ready(&self) -> Result<bool, StoreError> {
        Ok(get::<bool>(&self.agent, KEY_READY)?.unwrap_or(false))
    }

    pub fn mark_ready(&self) -> Result<(), StoreError> {
        put(&self.agent, KEY_READY, &true)
    }

    // --- channels bucket --- //

    pub fn get_channel(&self, id: &LedgerAddress) -> Result<Option<Channel>, StoreError> {
        get(&self.channels, id.as_bytes())
    }

    pub fn list_channels(&self) -> Result<Vec<Channel>, StoreError> {
        self.channels
            .iter()
            .values()
            .map(|r| {
                let bytes = r?;
                bincode::deserialize(&bytes).map_err(StoreError::from)
            })
            .collect()
    }

    /// Looks up a live channel already occupying `pair`, for the tie-break
    /// and at-most-one-channel checks (§3, §8 property 4).
    pub fn find_live_channel_for_pair(
        &self,
        pair: &(LedgerAddress, LedgerAddress),
    ) -> Result<Option<Channel>, StoreError> {
        let key = pair_key(pair);
        match self.pairs.get(&key)? {
            Some(id_bytes) => {
                let id_bytes: [u8; 32] = id_bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| StoreError::NotFound)?;
                let id = LedgerAddress::from_public_key_bytes(id_bytes);
                let channel = self.get_channel(&id)?;
                Ok(channel.filter(|c| c.state.is_live()))
            }
            None => Ok(None),
        }
    }

    // --- messages bucket --- //

    pub fn list_outbound_messages(
        &self,
        channel_id: &LedgerAddress,
    ) -> Result<Vec<OutboundMessage>, StoreError> {
        let prefix = channel_id.as_bytes().to_vec();
        self.messages
            .scan_prefix(prefix)
            .values()
            .map(|r| {
                let bytes = r?;
                bincode::deserialize(&bytes).map_err(StoreError::from)
            })
            .collect()
    }

    // --- updates bucket --- //

    pub fn list_updates_since(&self, seq: u64) -> Result<Vec<Update>, StoreError> {
        self.updates
            .range(seq.to_be_bytes().to_vec()..)
            .values()
            .map(|r| {
                let bytes = r?;
                bincode::deserialize(&bytes).map_err(StoreError::from)
            })
            .collect()
    }

    // --- tasks bucket --- //

    pub fn list_pending_tasks(&self) -> Result<Vec<(u64, Task)>, StoreError> {
        self.tasks
            .iter()
            .map(|r| {
                let (key, bytes) = r?;
                let id_bytes: [u8; 8] = key
                    .as_ref()
                    .try_into()
                    .map_err(|_| StoreError::NotFound)?;
                let task = bincode::deserialize(&bytes)?;
                Ok((u64::from_be_bytes(id_bytes), task))
            })
            .collect()
    }

    pub fn remove_task(&self, task_id: u64) -> Result<(), StoreError> {
        let key = task_id.to_be_bytes();
        if let Some(bytes) = self.tasks.remove(key)? {
            let task: Task = bincode::deserialize(&bytes)?;
            self.task_index.remove(bincode::serialize(task.key())?)?;
        }
        Ok(())
    }

    /// Atomically applies one FSM step's worth of output: the channel's new
    /// state (and its ordered-pair index entry), the wallet's new state,
    /// outbound messages, idempotent task-basket entries, and exactly one
    /// audit `Update` (§4.5). Returns the committed update's sequence
    /// number.
    pub fn commit(&self, commit: Commit) -> Result<u64, StoreError> {
        let result = (
            &self.agent,
            &self.channels,
            &self.pairs,
            &self.messages,
            &self.updates,
            &self.tasks,
            &self.task_index,
        )
            .transaction(
                |(agent, channels, pairs, messages, updates, tasks, task_index)| {
                    if let Some(cc) = &commit.channel {
                        if cc.channel.state.is_live() {
                            if let Some(existing) = pairs.get(pair_key(&cc.ordered_pair))? {
                                if existing.as_ref() != cc.channel_id.as_bytes().as_slice() {
                                    return Err(ConflictableTransactionError::Abort(
                                        StoreError::PairConflict,
                                    ));
                                }
                            }
                        }
                        tx_put(channels, cc.channel_id.as_bytes(), &cc.channel)?;
                        if cc.channel.state.is_live() {
                            pairs.insert(
                                pair_key(&cc.ordered_pair),
                                cc.channel_id.as_bytes().as_slice(),
                            )?;
                        } else {
                            pairs.remove(pair_key(&cc.ordered_pair))?;
                        }
                    }

                    if let Some(wallet) = &commit.wallet {
                        tx_put(agent, KEY_WALLET, wallet)?;
                    }

                    for msg in &commit.messages {
                        tx_put(
                            messages,
                            &message_key(&msg.message.channel_id, msg.message.msg_num.get()),
                            msg,
                        )?;
                    }

                    for task in &commit.tasks {
                        let already_queued =
                            task_index.get(bincode::serialize(task.key()).map_err(|e| {
                                ConflictableTransactionError::Abort(StoreError::Encode(e))
                            })?)?;
                        if already_queued.is_some() {
                            continue;
                        }
                        let task_seq: u64 = tx_get(agent, KEY_TASK_SEQ)?.unwrap_or(0);
                        let next_seq = task_seq
                            .checked_add(1)
                            .expect("task sequence overflowed u64");
                        tx_put(agent, KEY_TASK_SEQ, &next_seq)?;
                        tx_put(tasks, &task_seq.to_be_bytes(), task)?;
                        let key_bytes = bincode::serialize(task.key()).map_err(|e| {
                            ConflictableTransactionError::Abort(StoreError::Encode(e))
                        })?;
                        task_index.insert(key_bytes, &task_seq.to_be_bytes())?;
                    }

                    let update_seq: u64 = tx_get(agent, KEY_UPDATE_SEQ)?.unwrap_or(0);
                    let next_update_seq = update_seq
                        .checked_add(1)
                        .expect("update sequence overflowed u64");
                    tx_put(agent, KEY_UPDATE_SEQ, &next_update_seq)?;

                    if let Some(input) = commit.update_input.clone() {
                        let update = Update {
                            seq: update_seq,
                            input,
                            snapshot: commit.update_snapshot.clone(),
                        };
                        tx_put(updates, &update_seq.to_be_bytes(), &update)?;
                    }

                    Ok(update_seq)
                },
            );

        result.map_err(StoreError::from)
    }

    /// Checks whether `task.key()` is already enqueued, for callers that
    /// want to skip building a `Commit` entirely (§4.2 "idempotent by
    /// construction").
    pub fn is_task_queued(&self, key: &TaskKey) -> Result<bool, StoreError> {
        Ok(self
            .task_index
            .get(bincode::serialize(key)?)?
            .is_some())
    }

    /// Wipes the agent's identity keys and republishes a single `Account`
    /// Update carrying the freshly reset `wallet` (§4.6 scenario S6:
    /// "account merge wipes agent"). `update_seq`/`task_seq` are counters
    /// private to this store, not part of the spec's named agent buckets,
    /// and are deliberately left untouched so `updates` stays append-only
    /// across the erase.
    pub fn erase_agent_and_reset_wallet(&self, wallet: &Wallet) -> Result<u64, StoreError> {
        let result = (&self.agent, &self.updates).transaction(|(agent, updates)| {
            agent.remove(KEY_CONFIG)?;
            agent.remove(KEY_PRIMARY_ACCT)?;
            agent.remove(KEY_ENCRYPTED_SEED)?;
            agent.remove(KEY_NEXT_KEYPATH_INDEX)?;
            tx_put(agent, KEY_WALLET, wallet)?;
            tx_put(agent, KEY_READY, &true)?;

            let update_seq: u64 = tx_get(agent, KEY_UPDATE_SEQ)?.unwrap_or(0);
            let next_update_seq = update_seq
                .checked_add(1)
                .expect("update sequence overflowed u64");
            tx_put(agent, KEY_UPDATE_SEQ, &next_update_seq)?;
            let update = Update {
                seq: update_seq,
                input: UpdateInput::Init,
                snapshot: UpdateSnapshot::Account(Box::new(wallet.clone())),
            };
            tx_put(updates, &update_seq.to_be_bytes(), &update)?;

            Ok(update_seq)
        });
        result.map_err(StoreError::from)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use starlight_ln::channel::{ChannelAccounts, RatchetSeqnums, Role};
    use std::time::Duration;

    fn addr(byte: u8) -> LedgerAddress {
        LedgerAddress::from_public_key_bytes([byte; 32])
    }

    fn sample_channel(state: ChannelState) -> Channel {
        Channel {
            role: Role::Host,
            counterparty_address: starlight_common::federation::FederationAddress::new(
                "bob",
                "example.com",
            )
            .unwrap(),
            counterparty_url: "https://example.com".to_string(),
            accounts: ChannelAccounts {
                escrow: addr(1),
                host_ratchet: addr(2),
                guest_ratchet: addr(3),
                host: addr(4),
                guest: addr(5),
            },
            host_amount: 100,
            guest_amount: 0,
            channel_feerate: 100,
            host_feerate: 100,
            max_round_duration: Duration::from_secs(30),
            finality_delay: Duration::from_secs(60),
            funding_time: None,
            payment_time: None,
            round_number: starlight_common::Round::ZERO,
            state,
            key_index: 0,
            base_sequence_number: 0,
            ratchet_seqnums: RatchetSeqnums::default(),
            passphrase: "Test SDF Network ; September 2015".to_string(),
            last_msg_index: starlight_common::MsgSeq::default(),
            host_msg_seq: starlight_common::MsgSeq::default(),
            guest_msg_seq: starlight_common::MsgSeq::default(),
        }
    }

    #[test]
    fn commits_channel_and_advances_update_seq() {
        let store = Store::open_in_memory().unwrap();
        let channel = sample_channel(ChannelState::PaymentChannel);
        let pair = channel.ordered_pair();
        let commit = Commit {
            channel: Some(CommitChannel {
                channel_id: channel.channel_id(),
                channel: channel.clone(),
                ordered_pair: pair,
            }),
            update_input: Some(UpdateInput::Init),
            ..Default::default()
        };
        let seq = store.commit(commit).unwrap();
        assert_eq!(seq, 0);
        let fetched = store.get_channel(&channel.channel_id()).unwrap().unwrap();
        assert_eq!(fetched.host_amount, 100);
        assert!(store.find_live_channel_for_pair(&pair).unwrap().is_some());
    }

    #[test]
    fn second_live_channel_for_same_pair_is_rejected() {
        let store = Store::open_in_memory().unwrap();
        let channel = sample_channel(ChannelState::PaymentChannel);
        let pair = channel.ordered_pair();
        store
            .commit(Commit {
                channel: Some(CommitChannel {
                    channel_id: channel.channel_id(),
                    channel: channel.clone(),
                    ordered_pair: pair,
                }),
                update_input: Some(UpdateInput::Init),
                ..Default::default()
            })
            .unwrap();

        let mut other = channel.clone();
        other.accounts.escrow = addr(9);
        let err = store
            .commit(Commit {
                channel: Some(CommitChannel {
                    channel_id: other.channel_id(),
                    channel: other,
                    ordered_pair: pair,
                }),
                update_input: Some(UpdateInput::Init),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::PairConflict));
    }

    #[test]
    fn closing_a_channel_frees_the_pair_index() {
        let store = Store::open_in_memory().unwrap();
        let channel = sample_channel(ChannelState::PaymentChannel);
        let pair = channel.ordered_pair();
        store
            .commit(Commit {
                channel: Some(CommitChannel {
                    channel_id: channel.channel_id(),
                    channel: channel.clone(),
                    ordered_pair: pair,
                }),
                update_input: Some(UpdateInput::Init),
                ..Default::default()
            })
            .unwrap();

        let mut closed = channel.clone();
        closed.state = ChannelState::Closed;
        store
            .commit(Commit {
                channel: Some(CommitChannel {
                    channel_id: closed.channel_id(),
                    channel: closed,
                    ordered_pair: pair,
                }),
                update_input: Some(UpdateInput::Init),
                ..Default::default()
            })
            .unwrap();

        assert!(store.find_live_channel_for_pair(&pair).unwrap().is_none());
    }

    #[test]
    fn duplicate_task_key_is_enqueued_only_once() {
        let store = Store::open_in_memory().unwrap();
        let key = TaskKey {
            channel_id: addr(1),
            round: 1,
            kind: starlight_ln::task::TaskKind::SubmitTx,
        };
        let task = Task::TxTask {
            key: key.clone(),
            owner: addr(1),
            envelope: starlight_ln::ledger::SignedEnvelope {
                source: addr(1),
                sequence_number: 1,
                blob: vec![],
            },
        };
        store
            .commit(Commit {
                tasks: vec![task.clone(), task.clone()],
                update_input: Some(UpdateInput::Init),
                ..Default::default()
            })
            .unwrap();
        let pending = store.list_pending_tasks().unwrap();
        assert_eq!(pending.len(), 1);
        assert!(store.is_task_queued(&key).unwrap());
    }
}
