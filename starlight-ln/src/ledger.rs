//! The ledger client trait (§4.3) and a testnet-shaped transaction model.
//! Low-level XDR construction/serialization is an external collaborator
//! (§1); here a [`SignedEnvelope`] is an opaque, already-built, already-
//! signed transaction blob plus the metadata the FSM needs to reason about
//! it (source account, sequence number).

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use starlight_common::LedgerAddress;
use tokio_stream::Stream;

/// An opaque, already-signed transaction envelope. Equality/idempotency is
/// keyed by `(source, sequence_number)`, matching how the ledger itself
/// prevents duplicate submission (§4.2 "the ledger itself enforces this via
/// sequence numbers").
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedEnvelope {
    pub source: LedgerAddress,
    pub sequence_number: u64,
    /// Opaque signed transaction bytes (XDR in a real deployment).
    pub blob: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccountInfo {
    pub address: LedgerAddress,
    pub sequence_number: u64,
    pub native_balance: u64,
    pub reserve: u64,
    /// Whether this account requires explicit `AllowTrust` authorization
    /// before a new trustline can be used (§4.6 `ChangeTrust` "consult
    /// issuer for `authRequired`"). Only meaningful when this account is
    /// consulted as an asset issuer.
    pub auth_required: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    CreateAccount {
        destination: LedgerAddress,
        starting_balance: u64,
    },
    Payment {
        destination: LedgerAddress,
        asset: Option<String>,
        amount: u64,
    },
    AccountMerge {
        destination: LedgerAddress,
    },
    ChangeTrust {
        asset_code: String,
        asset_issuer: LedgerAddress,
        limit: u64,
    },
    AllowTrust {
        trustor: LedgerAddress,
        asset_code: String,
        authorized: bool,
    },
    SetOptions {
        home_domain: Option<String>,
    },
}

/// One confirmed, successful operation within a confirmed ledger
/// transaction. Failed transactions are filtered out before delivery
/// (§4.3): "Failed transactions on the network are ignored."
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerOperation {
    pub source: LedgerAddress,
    pub operation_index: u32,
    pub kind: OperationKind,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTx {
    pub hash: [u8; 32],
    pub ledger_time: u64,
    pub operations: Vec<LedgerOperation>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default, PartialOrd, Ord, Hash)]
pub struct Cursor(pub String);

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger rejected the transaction: {0}")]
    TxFailed(String),
    #[error("account not found: {0}")]
    AccountNotFound(LedgerAddress),
    #[error("transport error: {0}")]
    Transport(#[from] anyhow::Error),
    #[error("refusing to target a non-test-network URL")]
    ProductionNetworkRejected,
}

pub type TxStream = std::pin::Pin<Box<dyn Stream<Item = Result<(LedgerTx, Cursor), LedgerError>> + Send>>;

/// Wraps a ledger node HTTP API (§4.3). Implementations: [`HorizonClient`]
/// (testnet, `reqwest`-backed) and `FakeLedgerClient` (tests).
#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn load_account(&self, addr: &LedgerAddress) -> Result<AccountInfo, LedgerError>;

    async fn sequence_for(&self, addr: &LedgerAddress) -> Result<u64, LedgerError> {
        Ok(self.load_account(addr).await?.sequence_number)
    }

    async fn submit(&self, envelope: &SignedEnvelope) -> Result<(), LedgerError>;

    /// Requests testnet funds for a freshly created account (§4.9
    /// `ConfigInit`: "asynchronously obtains testnet funds"). No-op by
    /// default; `HorizonClient` overrides this to hit the network's
    /// friendbot endpoint.
    async fn fund_via_faucet(&self, _addr: &LedgerAddress) -> Result<(), LedgerError> {
        Ok(())
    }

    /// Streams confirmed transactions for `addr` starting after `cursor`,
    /// in ledger order, advancing the cursor after each item (§4.3).
    async fn stream_txs(&self, addr: LedgerAddress, cursor: Cursor) -> TxStream;

    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// One-shot timers the FSM arms for round deadlines and finality delays
/// (§4.3 `afterFunc`). Re-arming after restart is the caller's
/// responsibility (§4.3).
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
    fn after(&self, duration: Duration) -> futures::future::BoxFuture<'static, ()>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn after(&self, duration: Duration) -> futures::future::BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}

pub type DynLedgerClient = Arc<dyn LedgerClient>;
