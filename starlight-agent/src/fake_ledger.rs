//! An in-memory [`LedgerClient`] for tests (§4.3), mirroring the teacher's
//! `MockApiClient` alongside its real `reqwest`-backed counterpart. Kept as
//! an unconditional `pub mod` (not `#[cfg(test)]`-gated) so integration
//! tests in other crates and the update-loop tests in this one can depend
//! on it directly.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use starlight_common::LedgerAddress;
use starlight_ln::ledger::{
    AccountInfo, Cursor, LedgerClient, LedgerError, LedgerOperation, LedgerTx, OperationKind,
    SignedEnvelope, TxStream,
};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

fn operation_touches(op: &LedgerOperation, addr: &LedgerAddress) -> bool {
    if op.source == *addr {
        return true;
    }
    match &op.kind {
        OperationKind::CreateAccount { destination, .. } => destination == addr,
        OperationKind::Payment { destination, .. } => destination == addr,
        OperationKind::AccountMerge { destination } => destination == addr,
        OperationKind::AllowTrust { trustor, .. } => trustor == addr,
        OperationKind::ChangeTrust { .. } | OperationKind::SetOptions { .. } => false,
    }
}

struct AccountState {
    info: AccountInfo,
}

/// A single-process, in-memory ledger. `submit` applies sequence-number
/// bookkeeping directly; confirming a transaction (simulating ledger close)
/// is a separate, explicit step via [`FakeLedgerClient::confirm`] so tests
/// control exactly when watchers observe it.
pub struct FakeLedgerClient {
    accounts: Mutex<BTreeMap<LedgerAddress, AccountState>>,
    submitted: Mutex<Vec<SignedEnvelope>>,
    confirmations: broadcast::Sender<(LedgerTx, Cursor)>,
    next_cursor: Mutex<u64>,
    reject_next: Mutex<VecDeque<String>>,
}

impl FakeLedgerClient {
    pub fn new() -> Self {
        let (confirmations, _rx) = broadcast::channel(1024);
        Self {
            accounts: Mutex::new(BTreeMap::new()),
            submitted: Mutex::new(Vec::new()),
            confirmations,
            next_cursor: Mutex::new(0),
            reject_next: Mutex::new(VecDeque::new()),
        }
    }

    pub fn create_account(&self, address: LedgerAddress, starting_balance: u64) {
        self.accounts.lock().unwrap().insert(
            address,
            AccountState {
                info: AccountInfo {
                    address,
                    sequence_number: 0,
                    native_balance: starting_balance,
                    reserve: 0,
                    auth_required: false,
                },
            },
        );
    }

    /// Sets the reserve a subsequent `load_account` reports for `address`,
    /// for tests of the wallet watcher's post-`CreateAccount`/`ChangeTrust`
    /// reload.
    pub fn set_reserve(&self, address: LedgerAddress, reserve: u64) {
        if let Some(state) = self.accounts.lock().unwrap().get_mut(&address) {
            state.info.reserve = reserve;
        }
    }

    /// Marks `issuer` as requiring explicit trustline authorization, for
    /// tests of the wallet watcher's `ChangeTrust` issuer consultation.
    pub fn set_auth_required(&self, issuer: LedgerAddress, auth_required: bool) {
        if let Some(state) = self.accounts.lock().unwrap().get_mut(&issuer) {
            state.info.auth_required = auth_required;
        }
    }

    /// Directly sets the native balance a subsequent `load_account` reports,
    /// for tests of the wallet watcher's post-`AccountMerge` reload.
    pub fn set_native_balance(&self, address: LedgerAddress, native_balance: u64) {
        if let Some(state) = self.accounts.lock().unwrap().get_mut(&address) {
            state.info.native_balance = native_balance;
        }
    }

    /// Arms the next `submit` call to fail with `reason`, for testing the
    /// task basket's give-up path.
    pub fn reject_next_submission(&self, reason: impl Into<String>) {
        self.reject_next.lock().unwrap().push_back(reason.into());
    }

    pub fn submitted_envelopes(&self) -> Vec<SignedEnvelope> {
        self.submitted.lock().unwrap().clone()
    }

    /// Confirms `tx`, advancing the shared cursor and notifying every
    /// active `stream_txs` subscriber whose account the transaction
    /// touches.
    pub fn confirm(&self, tx: LedgerTx) {
        let mut next_cursor = self.next_cursor.lock().unwrap();
        *next_cursor += 1;
        let cursor = Cursor(next_cursor.to_string());
        let _ = self.confirmations.send((tx, cursor));
    }
}

impl Default for FakeLedgerClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerClient for FakeLedgerClient {
    async fn load_account(&self, addr: &LedgerAddress) -> Result<AccountInfo, LedgerError> {
        self.accounts
            .lock()
            .unwrap()
            .get(addr)
            .map(|s| s.info.clone())
            .ok_or(LedgerError::AccountNotFound(*addr))
    }

    async fn submit(&self, envelope: &SignedEnvelope) -> Result<(), LedgerError> {
        if let Some(reason) = self.reject_next.lock().unwrap().pop_front() {
            return Err(LedgerError::TxFailed(reason));
        }
        let mut accounts = self.accounts.lock().unwrap();
        let account = accounts
            .get_mut(&envelope.source)
            .ok_or(LedgerError::AccountNotFound(envelope.source))?;
        if envelope.sequence_number <= account.info.sequence_number {
            return Err(LedgerError::TxFailed(
                "sequence number too low".to_string(),
            ));
        }
        account.info.sequence_number = envelope.sequence_number;
        self.submitted.lock().unwrap().push(envelope.clone());
        Ok(())
    }

    async fn stream_txs(&self, addr: LedgerAddress, _cursor: Cursor) -> TxStream {
        let rx = self.confirmations.subscribe();
        let stream = BroadcastStream::new(rx).filter_map(move |item| match item {
            Ok((tx, cursor)) => {
                if tx.operations.iter().any(|op| operation_touches(op, &addr)) {
                    Some(Ok((tx, cursor)))
                } else {
                    None
                }
            }
            Err(_lagged) => None,
        });
        Box::pin(stream)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn addr(byte: u8) -> LedgerAddress {
        LedgerAddress::from_public_key_bytes([byte; 32])
    }

    #[tokio::test]
    async fn submit_advances_sequence_number() {
        let ledger = FakeLedgerClient::new();
        ledger.create_account(addr(1), 10_000);
        let envelope = SignedEnvelope {
            source: addr(1),
            sequence_number: 1,
            blob: vec![],
        };
        ledger.submit(&envelope).await.unwrap();
        let account = ledger.load_account(&addr(1)).await.unwrap();
        assert_eq!(account.sequence_number, 1);
    }

    #[tokio::test]
    async fn stale_sequence_number_is_rejected() {
        let ledger = FakeLedgerClient::new();
        ledger.create_account(addr(1), 10_000);
        let envelope = SignedEnvelope {
            source: addr(1),
            sequence_number: 1,
            blob: vec![],
        };
        ledger.submit(&envelope).await.unwrap();
        let stale = SignedEnvelope {
            sequence_number: 1,
            ..envelope
        };
        assert!(matches!(
            ledger.submit(&stale).await,
            Err(LedgerError::TxFailed(_))
        ));
    }

    #[tokio::test]
    async fn stream_only_delivers_touching_transactions() {
        let ledger = FakeLedgerClient::new();
        let mut stream = ledger.stream_txs(addr(1), Cursor::default()).await;

        let tx = LedgerTx {
            hash: [0u8; 32],
            ledger_time: 1,
            operations: vec![LedgerOperation {
                source: addr(2),
                operation_index: 0,
                kind: OperationKind::Payment {
                    destination: addr(1),
                    asset: None,
                    amount: 100,
                },
            }],
        };
        ledger.confirm(tx.clone());

        let unrelated = LedgerTx {
            hash: [1u8; 32],
            ledger_time: 2,
            operations: vec![LedgerOperation {
                source: addr(3),
                operation_index: 0,
                kind: OperationKind::Payment {
                    destination: addr(4),
                    asset: None,
                    amount: 5,
                },
            }],
        };
        ledger.confirm(unrelated);

        let (received, _cursor) = stream.next().await.unwrap().unwrap();
        assert_eq!(received.hash, tx.hash);
    }
}
