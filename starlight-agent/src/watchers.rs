//! Long-lived ledger-stream consumers (§4.6). The wallet watcher applies
//! confirmed operations on the primary account to the wallet's pure model
//! (`starlight_ln::wallet::apply_operation`) and advances its cursor; a
//! channel watcher does the same for one channel's escrow account, feeding
//! confirmations into the update loop as `Input::Tx`. Both watchers start
//! from the last persisted cursor so a restart simply resumes the stream;
//! `sled`'s durability plus the FSM's idempotent handling of a replayed
//! transaction (§8 property 6) make redelivery harmless.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use starlight_common::shutdown::ShutdownChannel;
use starlight_common::LedgerAddress;
use starlight_ln::fsm::{FsmContext, Input};
use starlight_ln::keys::SigningCapability;
use starlight_ln::ledger::{Cursor, DynLedgerClient, LedgerTx, OperationKind};
use starlight_ln::update::{UpdateInput, UpdateSnapshot};
use starlight_ln::wallet::{apply_operation, Wallet, WalletEffect};
use tokio_stream::StreamExt;
use tracing::{error, info, warn};

use crate::store::{Commit, Store};
use crate::update_loop::UpdateLoop;

/// Stellar test network passphrase (§1: mainnet is explicitly unsupported,
/// so this is the only passphrase an agent ever signs with).
pub const TEST_NETWORK_PASSPHRASE: &str = "Test SDF Network ; September 2015";

pub(crate) fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Watches the primary account's transaction history and keeps the wallet
/// model (§3 `Account`) current.
pub struct WalletWatcher {
    store: Arc<Store>,
    ledger: DynLedgerClient,
}

impl WalletWatcher {
    pub fn new(store: Arc<Store>, ledger: DynLedgerClient) -> Self {
        Self { store, ledger }
    }

    /// Consults the issuer's account for its `authRequired` flag (§4.6
    /// `ChangeTrust` with nonzero limit). Defaults to `true` (leave the new
    /// trustline unauthorized) if the issuer's account can't be loaded, the
    /// safer of the two wrong answers.
    async fn issuer_requires_auth(&self, issuer: &LedgerAddress) -> bool {
        match self.ledger.load_account(issuer).await {
            Ok(info) => info.auth_required,
            Err(e) => {
                warn!(error = %e, %issuer, "failed to load issuer account for authRequired check");
                true
            }
        }
    }

    pub async fn run(self, primary_account: LedgerAddress, shutdown: ShutdownChannel) {
        let cursor = self
            .store
            .get_wallet()
            .ok()
            .flatten()
            .map(|w| w.cursor)
            .unwrap_or_default();
        let mut stream = self.ledger.stream_txs(primary_account, cursor).await;

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("wallet watcher shutting down");
                    return;
                }
                next = stream.next() => match next {
                    Some(Ok((tx, cursor))) => self.apply_tx(primary_account, tx, cursor).await,
                    Some(Err(e)) => warn!(error = %e, "wallet watcher stream error"),
                    None => {
                        info!("wallet watcher stream ended");
                        return;
                    }
                },
            }
        }
    }

    async fn apply_tx(&self, primary_account: LedgerAddress, tx: LedgerTx, cursor: Cursor) {
        let mut wallet = self
            .store
            .get_wallet()
            .ok()
            .flatten()
            .unwrap_or_else(|| Wallet::new(primary_account));

        let mut erased = false;
        let mut needs_reload = false;
        for op in &tx.operations {
            let issuer_requires_auth = match &op.kind {
                OperationKind::ChangeTrust { asset_issuer, limit, .. } if *limit > 0 => {
                    self.issuer_requires_auth(asset_issuer).await
                }
                _ => false,
            };
            match apply_operation(&mut wallet, op, issuer_requires_auth) {
                WalletEffect::Erase => {
                    erased = true;
                    break;
                }
                WalletEffect::AppliedNeedsReload => needs_reload = true,
                WalletEffect::Applied | WalletEffect::Ignored => {}
            }
        }

        if erased {
            // S6: account-merge-as-source wipes the whole agent bucket and
            // republishes a single Account Update with balance 0 (§9 Open
            // Question (c): cursor resets to empty on the rebuilt agent).
            let fresh = Wallet::new(primary_account);
            if let Err(e) = self.store.erase_agent_and_reset_wallet(&fresh) {
                error!(error = %e, "failed to erase agent state on account merge");
            }
            return;
        }

        if needs_reload {
            match self.ledger.load_account(&primary_account).await {
                Ok(info) => {
                    wallet.native_balance = info.native_balance;
                    wallet.reserve = info.reserve;
                }
                Err(e) => warn!(error = %e, %primary_account, "failed to reload account after confirmed tx"),
            }
        }

        wallet.cursor = cursor;
        let commit = Commit {
            wallet: Some(wallet.clone()),
            update_input: Some(UpdateInput::Tx {
                channel_id: None,
                tx,
                operation_index: 0,
            }),
            update_snapshot: UpdateSnapshot::Account(Box::new(wallet)),
            ..Default::default()
        };
        if let Err(e) = self.store.commit(commit) {
            error!(error = %e, "failed to commit wallet update");
        }
    }
}

/// Watches one channel's escrow account and feeds confirmed transactions
/// into the update loop as `Input::Tx` (§4.6).
pub struct ChannelWatcher {
    store: Arc<Store>,
    ledger: DynLedgerClient,
    update_loop: Arc<UpdateLoop>,
}

impl ChannelWatcher {
    pub fn new(store: Arc<Store>, ledger: DynLedgerClient, update_loop: Arc<UpdateLoop>) -> Self {
        Self {
            store,
            ledger,
            update_loop,
        }
    }

    /// Runs until the channel is no longer live or shutdown is requested.
    /// There's no persisted per-channel cursor: `step_tx` is a pure
    /// function of the channel's current state, so replaying the same
    /// confirmation after a restart is harmless.
    pub async fn run(self, channel_id: LedgerAddress, shutdown: ShutdownChannel) {
        let mut stream = self.ledger.stream_txs(channel_id, Cursor::default()).await;

        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                next = stream.next() => match next {
                    Some(Ok((tx, _cursor))) => self.apply_tx(channel_id, tx),
                    Some(Err(e)) => {
                        warn!(error = %e, %channel_id, "channel watcher stream error");
                    }
                    None => return,
                },
            }

            match self.store.get_channel(&channel_id) {
                Ok(Some(channel)) if !channel.state.is_live() => return,
                Ok(None) => return,
                Ok(Some(_)) => {}
                Err(e) => {
                    error!(error = %e, %channel_id, "failed to reload channel state");
                    return;
                }
            }
        }
    }

    fn apply_tx(&self, channel_id: LedgerAddress, tx: LedgerTx) {
        let channel = match self.store.get_channel(&channel_id) {
            Ok(Some(channel)) => channel,
            Ok(None) => return,
            Err(e) => {
                error!(error = %e, %channel_id, "failed to load channel for confirmed tx");
                return;
            }
        };
        let self_address = match channel.role {
            starlight_ln::channel::Role::Host => channel.accounts.host,
            starlight_ln::channel::Role::Guest => channel.accounts.guest,
        };
        let ctx = FsmContext {
            now: now_unix(),
            // Confirmed-tx and timer inputs never require signing; only
            // local commands and accepting a fresh ChannelPropose do.
            signing: SigningCapability::Watchtower,
            self_address,
            passphrase: TEST_NETWORK_PASSPHRASE,
            peer_address: None,
            peer_url: None,
        };

        for op in &tx.operations {
            let input = Input::Tx {
                tx: tx.clone(),
                operation_index: op.operation_index,
            };
            if let Err(e) = self.update_loop.apply(channel_id, input, &ctx) {
                warn!(error = %e, %channel_id, "failed to apply confirmed tx to channel");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fake_ledger::FakeLedgerClient;
    use starlight_ln::ledger::{LedgerOperation, OperationKind};
    use tokio::sync::Notify;

    fn addr(byte: u8) -> LedgerAddress {
        LedgerAddress::from_public_key_bytes([byte; 32])
    }

    #[tokio::test]
    async fn wallet_watcher_credits_incoming_payment() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let ledger = Arc::new(FakeLedgerClient::new());
        let watcher = WalletWatcher::new(store.clone(), ledger.clone());
        let shutdown = ShutdownChannel::new();

        let primary = addr(1);
        let handle = {
            let shutdown = shutdown.clone();
            tokio::spawn(watcher.run(primary, shutdown))
        };

        ledger.confirm(LedgerTx {
            hash: [0u8; 32],
            ledger_time: 1,
            operations: vec![LedgerOperation {
                source: addr(2),
                operation_index: 0,
                kind: OperationKind::Payment {
                    destination: primary,
                    asset: None,
                    amount: 250,
                },
            }],
        });

        // Let the spawned watcher observe and apply the confirmation.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        shutdown.send();
        handle.await.unwrap();

        let wallet = store.get_wallet().unwrap().unwrap();
        assert_eq!(wallet.native_balance, 250);
    }

    #[tokio::test]
    async fn wallet_watcher_sets_reserve_on_create_account() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let ledger = Arc::new(FakeLedgerClient::new());
        let primary = addr(1);
        ledger.create_account(primary, 10_000);
        ledger.set_reserve(primary, 5_000_000);

        let watcher = WalletWatcher::new(store.clone(), ledger.clone());
        let shutdown = ShutdownChannel::new();
        let handle = {
            let shutdown = shutdown.clone();
            tokio::spawn(watcher.run(primary, shutdown))
        };

        ledger.confirm(LedgerTx {
            hash: [0u8; 32],
            ledger_time: 1,
            operations: vec![LedgerOperation {
                source: addr(2),
                operation_index: 0,
                kind: OperationKind::CreateAccount {
                    destination: primary,
                    starting_balance: 10_000,
                },
            }],
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        shutdown.send();
        handle.await.unwrap();

        let wallet = store.get_wallet().unwrap().unwrap();
        assert_eq!(wallet.native_balance, 10_000);
        assert_eq!(wallet.reserve, 5_000_000);
    }

    #[tokio::test]
    async fn wallet_watcher_credits_merged_amount() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let ledger = Arc::new(FakeLedgerClient::new());
        let primary = addr(1);
        ledger.create_account(primary, 1_000);
        store
            .commit(Commit {
                wallet: Some(Wallet {
                    native_balance: 1_000,
                    ..Wallet::new(primary)
                }),
                update_input: Some(UpdateInput::Init),
                ..Default::default()
            })
            .unwrap();

        let watcher = WalletWatcher::new(store.clone(), ledger.clone());
        let shutdown = ShutdownChannel::new();
        let handle = {
            let shutdown = shutdown.clone();
            tokio::spawn(watcher.run(primary, shutdown))
        };

        // Simulate the merge having landed on the ledger before the watcher
        // observes the confirmation: the next `load_account` already
        // reflects the credited amount.
        ledger.set_native_balance(primary, 1_500);
        ledger.confirm(LedgerTx {
            hash: [0u8; 32],
            ledger_time: 1,
            operations: vec![LedgerOperation {
                source: addr(2),
                operation_index: 0,
                kind: OperationKind::AccountMerge { destination: primary },
            }],
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        shutdown.send();
        handle.await.unwrap();

        let wallet = store.get_wallet().unwrap().unwrap();
        assert_eq!(wallet.native_balance, 1_500);
    }

    #[tokio::test]
    async fn wallet_watcher_consults_issuer_auth_required() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let ledger = Arc::new(FakeLedgerClient::new());
        let primary = addr(1);
        let issuer = addr(3);
        ledger.create_account(primary, 1_000);
        ledger.create_account(issuer, 1_000);
        ledger.set_auth_required(issuer, true);

        let watcher = WalletWatcher::new(store.clone(), ledger.clone());
        let shutdown = ShutdownChannel::new();
        let handle = {
            let shutdown = shutdown.clone();
            tokio::spawn(watcher.run(primary, shutdown))
        };

        ledger.confirm(LedgerTx {
            hash: [0u8; 32],
            ledger_time: 1,
            operations: vec![LedgerOperation {
                source: primary,
                operation_index: 0,
                kind: OperationKind::ChangeTrust {
                    asset_code: "USD".to_string(),
                    asset_issuer: issuer,
                    limit: 1_000,
                },
            }],
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        shutdown.send();
        handle.await.unwrap();

        let wallet = store.get_wallet().unwrap().unwrap();
        assert!(!wallet.balances["USD"].authorized);
    }

    #[tokio::test]
    async fn wallet_watcher_erases_agent_on_self_merge() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let ledger = Arc::new(FakeLedgerClient::new());
        let primary = addr(1);
        store
            .commit(Commit {
                wallet: Some(Wallet {
                    native_balance: 500,
                    ..Wallet::new(primary)
                }),
                update_input: Some(UpdateInput::Init),
                ..Default::default()
            })
            .unwrap();

        let watcher = WalletWatcher::new(store.clone(), ledger.clone());
        let shutdown = ShutdownChannel::new();
        let handle = {
            let shutdown = shutdown.clone();
            tokio::spawn(watcher.run(primary, shutdown))
        };

        ledger.confirm(LedgerTx {
            hash: [1u8; 32],
            ledger_time: 2,
            operations: vec![LedgerOperation {
                source: primary,
                operation_index: 0,
                kind: OperationKind::AccountMerge {
                    destination: addr(9),
                },
            }],
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        shutdown.send();
        handle.await.unwrap();

        let wallet = store.get_wallet().unwrap().unwrap();
        assert_eq!(wallet.native_balance, 0);
        assert!(store.is_ready().unwrap());
    }

    #[tokio::test]
    async fn channel_watcher_advances_channel_on_confirmed_funding() {
        use starlight_ln::channel::{ChannelAccounts, ChannelState, RatchetSeqnums, Role};
        use std::time::Duration;

        let store = Arc::new(Store::open_in_memory().unwrap());
        let fake = Arc::new(FakeLedgerClient::new());
        let ledger: DynLedgerClient = fake.clone();
        let update_loop = Arc::new(UpdateLoop::new(store.clone(), Arc::new(Notify::new())));

        let channel_id = addr(3);
        let channel = starlight_ln::channel::Channel {
            role: Role::Host,
            counterparty_address: starlight_common::federation::FederationAddress::new(
                "bob",
                "example.com",
            )
            .unwrap(),
            counterparty_url: "https://example.com".to_string(),
            accounts: ChannelAccounts {
                escrow: channel_id,
                host_ratchet: addr(4),
                guest_ratchet: addr(5),
                host: addr(1),
                guest: addr(2),
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
            state: ChannelState::SettingUp,
            key_index: 0,
            base_sequence_number: 0,
            ratchet_seqnums: RatchetSeqnums::default(),
            passphrase: TEST_NETWORK_PASSPHRASE.to_string(),
            last_msg_index: starlight_common::MsgSeq::default(),
            host_msg_seq: starlight_common::MsgSeq::default(),
            guest_msg_seq: starlight_common::MsgSeq::default(),
        };
        store
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

        let watcher = ChannelWatcher::new(store.clone(), ledger.clone(), update_loop);
        let shutdown = ShutdownChannel::new();
        let handle = {
            let shutdown = shutdown.clone();
            tokio::spawn(watcher.run(channel_id, shutdown))
        };

        fake.confirm(LedgerTx {
                hash: [2u8; 32],
                ledger_time: 3,
                operations: vec![LedgerOperation {
                    source: addr(1),
                    operation_index: 0,
                    kind: OperationKind::CreateAccount {
                        destination: channel_id,
                        starting_balance: 100,
                    },
                }],
            });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        shutdown.send();
        handle.await.unwrap();

        let updated = store.get_channel(&channel_id).unwrap().unwrap();
        assert_eq!(updated.state, ChannelState::AwaitingFunding);
    }
}
