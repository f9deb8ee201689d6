//! The agent facade (§4.9): process lifecycle, authentication, and the
//! entry points for every local command. Mirrors the teacher's `UserNode`
//! (`node::run::UserNode`): a struct of actors plus a
//! `Vec<(&'static str, LxTask<()>)>` of spawned workers, built by
//! `ConfigInit`/`Start` and torn down by `Close`/`CloseWait`.

use std::sync::{Arc, Mutex};

use ed25519_dalek::Signer;
use rand::RngCore;
use secrecy::Secret;
use starlight_common::config::{Config, ConfigEdit, ConfigError, ConfigInit};
use starlight_common::federation::FederationAddress;
use starlight_common::shutdown::ShutdownChannel;
use starlight_common::task::LxTask;
use starlight_common::LedgerAddress;
use starlight_ln::channel::Role;
use starlight_ln::command::Command;
use starlight_ln::fsm::{FsmContext, FsmError, Input};
use starlight_ln::keys::{self, Seed, SigningCapability};
use starlight_ln::ledger::{DynLedgerClient, OperationKind, SignedEnvelope};
use starlight_ln::task::{Task, TaskKey, TaskKind};
use starlight_ln::update::{UpdateInput, UpdateSnapshot};
use starlight_ln::wallet::Wallet;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::crypto;
use crate::store::{Commit, Store, StoreError};
use crate::task_basket::{MessageSender, TaskBasket};
use crate::update_loop::{ArmedTimer, UpdateLoop, UpdateLoopError};
use crate::watchers::{now_unix, ChannelWatcher, WalletWatcher, TEST_NETWORK_PASSPHRASE};

/// The primary account's signing key always occupies keypath index 0: it is
/// the very first allocation `ConfigInit` makes, before any channel exists
/// (§3 `keyIndex` invariant).
const PRIMARY_KEY_INDEX: u64 = 0;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent is already initialized")]
    AlreadyInitialized,
    #[error("agent has not been initialized yet")]
    NotInitialized,
    #[error("channel not found")]
    ChannelNotFound,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("wrong username or password")]
    WrongCredentials,
    #[error("seed unavailable; agent is in watchtower mode")]
    SeedUnavailable,
    #[error(transparent)]
    Fsm(#[from] FsmError),
    #[error(transparent)]
    UpdateLoop(#[from] UpdateLoopError),
    #[error("failed to seal or unseal the signing seed")]
    Seal,
}

impl From<crypto::SealError> for AgentError {
    fn from(_: crypto::SealError) -> Self {
        AgentError::Seal
    }
}

impl AgentError {
    /// Maps to the error-kind taxonomy the two HTTP surfaces report over
    /// the wire (§7): validation vs. retriable conflict vs. fatal.
    pub fn kind(&self) -> starlight_common::error::ErrorKind {
        use starlight_common::error::ErrorKind;
        match self {
            AgentError::Fsm(FsmError::ExistsRetriable) => ErrorKind::ExistsRetriable,
            AgentError::Fsm(FsmError::Exists) => ErrorKind::Exists,
            AgentError::Fsm(FsmError::SeedUnavailable) | AgentError::SeedUnavailable => {
                ErrorKind::SeedUnavailable
            }
            AgentError::Fsm(FsmError::Validation(_))
            | AgentError::Config(_)
            | AgentError::ChannelNotFound
            | AgentError::WrongCredentials
            | AgentError::AlreadyInitialized
            | AgentError::NotInitialized => ErrorKind::Validation,
            AgentError::Fsm(FsmError::WrongState(_))
            | AgentError::Fsm(FsmError::FundsNotConserved)
            | AgentError::Store(_)
            | AgentError::UpdateLoop(_)
            | AgentError::Seal => ErrorKind::Internal,
        }
    }
}

/// Process-wide agent state (§4.9). Constructed once per running process;
/// `Start`/`ConfigInit` populate `tasks` with the spawned background
/// workers, `CloseWait` drains and joins them.
pub struct Agent {
    store: Arc<Store>,
    ledger: DynLedgerClient,
    sender: Arc<dyn MessageSender>,
    update_loop: Arc<UpdateLoop>,
    task_notify: Arc<Notify>,
    shutdown: ShutdownChannel,
    /// `Some` iff authenticated this process lifetime (§4.9 `Authenticate`/
    /// `mustDeauthenticate`); `None` is watchtower mode.
    seed: Mutex<Option<Seed>>,
    tasks: Mutex<Vec<(&'static str, LxTask<()>)>>,
}

impl Agent {
    pub fn new(store: Arc<Store>, ledger: DynLedgerClient, sender: Arc<dyn MessageSender>) -> Arc<Self> {
        let task_notify = Arc::new(Notify::new());
        let update_loop = Arc::new(UpdateLoop::new(store.clone(), task_notify.clone()));
        Arc::new(Self {
            store,
            ledger,
            sender,
            update_loop,
            task_notify,
            shutdown: ShutdownChannel::new(),
            seed: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn is_ready(&self) -> Result<bool, AgentError> {
        Ok(self.store.is_ready()?)
    }

    pub fn is_authenticated(&self) -> bool {
        self.seed.lock().unwrap().is_some()
    }

    /// The persisted config, if the agent has been through `ConfigInit`.
    /// Read by the HTTP command surface and by the peer RPC's
    /// `/.well-known/stellar.toml` handler.
    pub fn config(&self) -> Result<Option<Config>, AgentError> {
        Ok(self.store.get_config()?)
    }

    /// The local user's primary ledger account, if initialized. Read by the
    /// peer RPC's `GET /federation` handler (§4.8).
    pub fn primary_account(&self) -> Result<Option<LedgerAddress>, AgentError> {
        Ok(self.store.get_primary_account()?)
    }

    pub fn shutdown_handle(&self) -> ShutdownChannel {
        self.shutdown.clone()
    }

    /// Internal accessor for the HTTP server layer's use of free-standing
    /// store helpers (e.g. [`reject_if_local_role_is_host`]).
    pub(crate) fn store(&self) -> &Store {
        &self.store
    }

    /// Spawns the task basket runner, the wallet watcher, and one channel
    /// watcher per still-live channel (§4.9 `Start`). Safe to call whether
    /// or not the agent has already been through `ConfigInit`; does
    /// nothing until it has.
    pub fn start(self: &Arc<Self>) -> Result<(), AgentError> {
        if !self.store.is_ready()? {
            info!("agent not yet initialized, nothing to start");
            return Ok(());
        }

        let basket = TaskBasket::new(
            self.store.clone(),
            self.ledger.clone(),
            self.sender.clone(),
            self.task_notify.clone(),
        );
        let shutdown = self.shutdown.clone();
        let basket_task = LxTask::spawn(async move { basket.run(shutdown).await });
        self.tasks.lock().unwrap().push(("task basket", basket_task));

        if let Some(primary_account) = self.store.get_primary_account()? {
            let watcher = WalletWatcher::new(self.store.clone(), self.ledger.clone());
            let shutdown = self.shutdown.clone();
            let task = LxTask::spawn(async move { watcher.run(primary_account, shutdown).await });
            self.tasks.lock().unwrap().push(("wallet watcher", task));
        }

        for channel in self.store.list_channels()? {
            if !channel.state.is_live() {
                continue;
            }
            let channel_id = channel.channel_id();
            let watcher = ChannelWatcher::new(self.store.clone(), self.ledger.clone(), self.update_loop.clone());
            let shutdown = self.shutdown.clone();
            let task = LxTask::spawn(async move { watcher.run(channel_id, shutdown).await });
            self.tasks.lock().unwrap().push(("channel watcher", task));
        }

        Ok(())
    }

    /// §4.9 `ConfigInit`: validates and persists the first `Config`,
    /// derives the primary account from a fresh seed, seals the seed under
    /// the account password, publishes the initial `Init` Update, starts
    /// the background workers, and (if `demo_server`) kicks off
    /// indefinite-backoff testnet funding.
    pub fn config_init(self: &Arc<Self>, init: ConfigInit, demo_server: bool) -> Result<(), AgentError> {
        if self.store.is_ready()? {
            return Err(AgentError::AlreadyInitialized);
        }

        let config = Config::from_init(&init)?;

        let mut seed_bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed_bytes);
        let seed: Seed = Secret::new(seed_bytes);
        let sealed = crypto::seal_seed(&seed, &init.password)?;

        let key_index = self.store.next_keypath_index()?;
        debug_assert_eq!(key_index, PRIMARY_KEY_INDEX);
        let keypair = keys::derive_keypair(&seed, key_index);
        let primary_account = keys::address_for_keypair(&keypair.verifying_key());

        self.store.put_config(&config)?;
        self.store.put_primary_account(&primary_account)?;
        self.store.put_encrypted_seed(&sealed)?;
        let wallet = Wallet::new(primary_account);
        self.store.commit(Commit {
            wallet: Some(wallet.clone()),
            update_input: Some(UpdateInput::Init),
            update_snapshot: UpdateSnapshot::Account(Box::new(wallet)),
            ..Default::default()
        })?;
        self.store.mark_ready()?;

        *self.seed.lock().unwrap() = Some(seed);

        if demo_server {
            self.spawn_faucet_funding(primary_account);
        }

        self.start()
    }

    fn spawn_faucet_funding(self: &Arc<Self>, primary_account: LedgerAddress) {
        let ledger = self.ledger.clone();
        let shutdown = self.shutdown.clone();
        let task = LxTask::spawn(async move {
            let mut backoff = starlight_common::backoff::get_backoff_iter();
            loop {
                match ledger.fund_via_faucet(&primary_account).await {
                    Ok(()) => return,
                    Err(e) => warn!(error = %e, "faucet funding attempt failed, retrying"),
                }
                let wait = backoff.next().expect("backoff iterator is infinite");
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = shutdown.recv() => return,
                }
            }
        });
        self.tasks.lock().unwrap().push(("faucet funding", task));
    }

    /// §4.9 `ConfigEdit`.
    pub fn config_edit(&self, edit: ConfigEdit) -> Result<(), AgentError> {
        let config = self.store.get_config()?.ok_or(AgentError::NotInitialized)?;
        let next = config.apply_edit(&edit)?;
        self.store.put_config(&next)?;
        Ok(())
    }

    /// §4.9 `Authenticate`: verifies the password and, on success, decrypts
    /// and caches the seed for the remainder of the process lifetime.
    pub fn authenticate(&self, username: &str, password: &str) -> Result<(), AgentError> {
        let config = self.store.get_config()?.ok_or(AgentError::NotInitialized)?;
        if !config.authenticate(username, password) {
            return Err(AgentError::WrongCredentials);
        }
        let sealed = self.store.get_encrypted_seed()?.ok_or(AgentError::NotInitialized)?;
        let seed = crypto::open_seed(&sealed, password)?;
        *self.seed.lock().unwrap() = Some(seed);
        Ok(())
    }

    /// §4.9 `mustDeauthenticate`: clears the in-memory seed, entering
    /// watchtower mode.
    pub fn deauthenticate(&self) {
        *self.seed.lock().unwrap() = None;
    }

    /// §4.9 `Close`: signals every spawned worker to stop, without waiting.
    pub fn close(&self) {
        self.shutdown.send();
    }

    /// §4.9 `CloseWait`: `Close`, then joins every spawned worker.
    pub async fn close_wait(&self) {
        self.close();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        for (name, task) in tasks {
            if let Err(e) = task.await {
                error!(name, error = %e, "worker task panicked");
            }
        }
    }

    /// §6 `DoCreateChannel`: proposes a brand-new channel as Host. The
    /// guest's ledger account and callback URL are assumed already resolved
    /// (federation lookup is the caller's job, at the HTTP command surface,
    /// §4.8 `GET /federation` being the serving side of that protocol, not
    /// the consuming side).
    #[allow(clippy::too_many_arguments)]
    pub fn do_create_channel(
        &self,
        guest: FederationAddress,
        guest_account: LedgerAddress,
        guest_url: String,
        host_amount: u64,
    ) -> Result<Vec<ArmedTimer>, AgentError> {
        let config = self.store.get_config()?.ok_or(AgentError::NotInitialized)?;
        let primary_account = self
            .store
            .get_primary_account()?
            .ok_or(AgentError::NotInitialized)?;

        let seed_guard = self.seed.lock().unwrap();
        let seed = seed_guard.as_ref().ok_or(AgentError::SeedUnavailable)?;

        let key_index = self.store.next_keypath_index()?;
        let escrow_account =
            keys::address_for_keypair(&keys::derive_keypair(seed, key_index).verifying_key());
        let host_ratchet_account =
            keys::address_for_keypair(&keys::derive_keypair(seed, key_index + 1).verifying_key());
        let guest_ratchet_account =
            keys::address_for_keypair(&keys::derive_keypair(seed, key_index + 2).verifying_key());

        let ctx = FsmContext {
            now: now_unix(),
            signing: SigningCapability::Available(seed),
            self_address: primary_account,
            passphrase: TEST_NETWORK_PASSPHRASE,
            peer_address: Some(guest.clone()),
            peer_url: Some(guest_url.clone()),
        };

        let timers = self.update_loop.propose_channel(
            host_amount,
            guest,
            guest_url,
            guest_account,
            escrow_account,
            host_ratchet_account,
            guest_ratchet_account,
            key_index,
            config.channel_feerate,
            config.host_feerate,
            config.max_round_duration,
            config.finality_delay,
            &ctx,
        )?;
        Ok(timers)
    }

    /// Any command scoped to an existing channel (`ChannelPay`, `Close`,
    /// `CleanUp`, `ForceClose`; §6 `DoCommand`). `Pay`/`AddAsset`/
    /// `RemoveAsset`/`KeepAlive` are wallet-level and go through
    /// [`Self::do_wallet_command`] instead, since `fsm::step_cmd` treats
    /// them as channel no-ops by design.
    pub fn do_channel_command(
        &self,
        channel_id: LedgerAddress,
        command: Command,
    ) -> Result<Vec<ArmedTimer>, AgentError> {
        let channel = self
            .store
            .get_channel(&channel_id)?
            .ok_or(AgentError::ChannelNotFound)?;
        let self_address = match channel.role {
            Role::Host => channel.accounts.host,
            Role::Guest => channel.accounts.guest,
        };

        let seed_guard = self.seed.lock().unwrap();
        let signing = match seed_guard.as_ref() {
            Some(seed) => SigningCapability::Available(seed),
            None => SigningCapability::Watchtower,
        };

        let ctx = FsmContext {
            now: now_unix(),
            signing,
            self_address,
            passphrase: &channel.passphrase,
            peer_address: Some(channel.counterparty_address.clone()),
            peer_url: Some(channel.counterparty_url.clone()),
        };

        Ok(self.update_loop.apply(channel_id, Input::Cmd(command), &ctx)?)
    }

    /// §6 `DoCommand`/`DoWalletPay` for the commands that operate on the
    /// wallet directly rather than any one channel.
    pub fn do_wallet_command(&self, command: Command) -> Result<(), AgentError> {
        match command {
            Command::Pay(pay) => self.submit_wallet_operation(OperationKind::Payment {
                destination: pay.destination,
                asset: None,
                amount: pay.amount,
            }),
            Command::AddAsset(add) => self.submit_wallet_operation(OperationKind::ChangeTrust {
                asset_code: add.asset_code,
                asset_issuer: add.asset_issuer,
                limit: u64::MAX,
            }),
            Command::RemoveAsset(remove) => self.submit_wallet_operation(OperationKind::ChangeTrust {
                asset_code: remove.asset_code,
                asset_issuer: remove.asset_issuer,
                limit: 0,
            }),
            // §9 Open Question (a): KeepAlive is configuration only; the
            // periodic trigger is left to the FSM's own round timers, not
            // to this entry point.
            Command::KeepAlive => Ok(()),
            other => Err(AgentError::Fsm(FsmError::Validation(format!(
                "{other:?} is a channel-scoped command; use do_channel_command"
            )))),
        }
    }

    fn submit_wallet_operation(&self, kind: OperationKind) -> Result<(), AgentError> {
        let primary_account = self
            .store
            .get_primary_account()?
            .ok_or(AgentError::NotInitialized)?;
        let wallet = self.store.get_wallet()?.ok_or(AgentError::NotInitialized)?;

        let seed_guard = self.seed.lock().unwrap();
        let seed = seed_guard.as_ref().ok_or(AgentError::SeedUnavailable)?;
        let keypair = keys::derive_keypair(seed, PRIMARY_KEY_INDEX);

        let blob = bincode::serialize(&kind).map_err(StoreError::Encode)?;
        let signature = keypair.sign(&blob);
        let mut signed_blob = Vec::with_capacity(signature.to_bytes().len() + blob.len());
        signed_blob.extend_from_slice(&signature.to_bytes());
        signed_blob.extend_from_slice(&blob);

        let sequence_number = wallet.seqnum + 1;
        let envelope = SignedEnvelope {
            source: primary_account,
            sequence_number,
            blob: signed_blob,
        };

        let op_seq = self.store.next_wallet_op_seq()?;
        let task = Task::TxTask {
            key: TaskKey {
                channel_id: primary_account,
                round: op_seq,
                kind: TaskKind::SubmitTx,
            },
            owner: primary_account,
            envelope,
        };
        self.store.commit(Commit {
            tasks: vec![task],
            update_input: Some(UpdateInput::Init),
            ..Default::default()
        })?;
        self.task_notify.notify_one();
        Ok(())
    }

    /// Accepts a peer's `POST /starlight/message` body (§4.8), running it
    /// through the same update loop that local commands use.
    pub fn handle_peer_message(
        &self,
        channel_id: LedgerAddress,
        message: starlight_ln::message::PeerMessage,
        peer_address: Option<FederationAddress>,
        peer_url: Option<String>,
    ) -> Result<Vec<ArmedTimer>, AgentError> {
        let existing = self.store.get_channel(&channel_id)?;
        let self_address = existing
            .as_ref()
            .map(|c| match c.role {
                Role::Host => c.accounts.host,
                Role::Guest => c.accounts.guest,
            })
            .or_else(|| self.store.get_primary_account().ok().flatten())
            .ok_or(AgentError::NotInitialized)?;

        let seed_guard = self.seed.lock().unwrap();
        let signing = match seed_guard.as_ref() {
            Some(seed) => SigningCapability::Available(seed),
            None => SigningCapability::Watchtower,
        };

        let ctx = FsmContext {
            now: now_unix(),
            signing,
            self_address,
            passphrase: existing
                .as_ref()
                .map(|c| c.passphrase.as_str())
                .unwrap_or(TEST_NETWORK_PASSPHRASE),
            peer_address,
            peer_url,
        };

        Ok(self.update_loop.apply(channel_id, Input::Msg(message), &ctx)?)
    }
}

/// Validates an incoming `ChannelPropose` isn't from a Host-role local
/// agent (§4.8: "if the local role for that channel ID is Host, rejects").
pub fn reject_if_local_role_is_host(
    store: &Store,
    channel_id: &LedgerAddress,
) -> Result<(), AgentError> {
    if let Some(channel) = store.get_channel(channel_id)? {
        if channel.role == Role::Host {
            return Err(AgentError::Fsm(FsmError::Validation(
                "local role for this channel is Host; hosts poll the outbound queue instead".into(),
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fake_ledger::FakeLedgerClient;
    use crate::task_basket::MessageSendError;
    use async_trait::async_trait;

    struct NullSender;

    #[async_trait]
    impl MessageSender for NullSender {
        async fn send(
            &self,
            _destination_url: &str,
            _message: &starlight_ln::message::PeerMessage,
        ) -> Result<(), MessageSendError> {
            Ok(())
        }
    }

    fn new_agent() -> Arc<Agent> {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let ledger: DynLedgerClient = Arc::new(FakeLedgerClient::new());
        let sender: Arc<dyn MessageSender> = Arc::new(NullSender);
        Agent::new(store, ledger, sender)
    }

    fn sample_init(username: &str, password: &str) -> ConfigInit {
        ConfigInit {
            username: username.to_string(),
            password: password.to_string(),
            horizon_url: None,
            max_round_duration: None,
            finality_delay: None,
            channel_feerate: None,
            host_feerate: None,
            keep_alive: None,
            public: None,
        }
    }

    #[test]
    fn s1_config_init_happy_path_marks_ready_and_authenticates() {
        let agent = new_agent();
        agent
            .config_init(sample_init("alice", "hunter2"), false)
            .unwrap();
        assert!(agent.is_ready().unwrap());
        assert!(agent.is_authenticated());
        let primary = agent.store.get_primary_account().unwrap();
        assert!(primary.is_some());
    }

    #[test]
    fn s2_weak_password_rejected_leaves_agent_uninitialized() {
        let agent = new_agent();
        let err = agent
            .config_init(sample_init("alice", ""), false)
            .unwrap_err();
        assert!(matches!(err, AgentError::Config(ConfigError::InvalidPassword)));
        assert!(!agent.is_ready().unwrap());
    }

    #[test]
    fn double_init_is_rejected() {
        let agent = new_agent();
        agent
            .config_init(sample_init("alice", "hunter2"), false)
            .unwrap();
        let err = agent
            .config_init(sample_init("alice", "hunter2"), false)
            .unwrap_err();
        assert!(matches!(err, AgentError::AlreadyInitialized));
    }

    #[test]
    fn deauthenticate_enters_watchtower_mode() {
        let agent = new_agent();
        agent
            .config_init(sample_init("alice", "hunter2"), false)
            .unwrap();
        assert!(agent.is_authenticated());
        agent.deauthenticate();
        assert!(!agent.is_authenticated());

        let err = agent
            .do_wallet_command(Command::Pay(starlight_ln::command::Pay {
                destination: LedgerAddress::from_public_key_bytes([9u8; 32]),
                amount: 10,
            }))
            .unwrap_err();
        assert!(matches!(err, AgentError::SeedUnavailable));
    }

    #[test]
    fn s3_create_channel_then_pay_arms_a_round_timer() {
        let agent = new_agent();
        agent
            .config_init(sample_init("alice", "hunter2"), false)
            .unwrap();

        let guest = FederationAddress::new("bob", "example.com").unwrap();
        let guest_account = LedgerAddress::from_public_key_bytes([8u8; 32]);
        let timers = agent
            .do_create_channel(guest, guest_account, "https://example.com".to_string(), 100)
            .unwrap();
        assert!(timers.is_empty());

        let channels = agent.store.list_channels().unwrap();
        assert_eq!(channels.len(), 1);
        let channel_id = channels[0].channel_id();

        // Force the channel into PaymentChannel state the way a real
        // funding confirmation would, so ChannelPay has something to act
        // on without driving the whole funding handshake through here.
        let mut channel = agent.store.get_channel(&channel_id).unwrap().unwrap();
        channel.state = starlight_ln::channel::ChannelState::PaymentChannel;
        channel.round_number = starlight_common::Round::ZERO.next();
        agent
            .store
            .commit(Commit {
                channel: Some(crate::store::CommitChannel {
                    channel_id,
                    ordered_pair: channel.ordered_pair(),
                    channel,
                }),
                update_input: Some(UpdateInput::Init),
                ..Default::default()
            })
            .unwrap();

        let timers = agent
            .do_channel_command(
                channel_id,
                Command::ChannelPay(starlight_ln::command::ChannelPay { amount: 10 }),
            )
            .unwrap();
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn unknown_channel_command_is_rejected() {
        let agent = new_agent();
        agent
            .config_init(sample_init("alice", "hunter2"), false)
            .unwrap();
        let err = agent
            .do_channel_command(
                LedgerAddress::from_public_key_bytes([1u8; 32]),
                Command::Close,
            )
            .unwrap_err();
        assert!(matches!(err, AgentError::ChannelNotFound));
    }

    #[test]
    fn keep_alive_is_a_pure_no_op() {
        let agent = new_agent();
        agent
            .config_init(sample_init("alice", "hunter2"), false)
            .unwrap();
        agent.do_wallet_command(Command::KeepAlive).unwrap();
    }
}
