//! A `reqwest`-backed [`LedgerClient`] for the public testnet
//! Horizon-compatible API (§4.3). Low-level XDR construction and the full
//! Horizon response schema are out of this crate's scope (§1); this client
//! assumes transaction and operation records have already been shaped into
//! our own `LedgerTx`/`LedgerOperation` wire format by whatever fronts the
//! real ledger node, and concerns itself with polling, cursor advancement,
//! and testnet-only enforcement.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use starlight_common::config::Config;
use starlight_common::LedgerAddress;
use starlight_ln::ledger::{
    AccountInfo, Cursor, LedgerClient, LedgerError, LedgerOperation, LedgerTx, SignedEnvelope,
    TxStream,
};
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

/// How often to poll a channel/wallet's transaction history when no
/// server-sent-events stream is available.
const POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Deserialize)]
struct AccountResponse {
    sequence: String,
    balances: Vec<BalanceEntry>,
    #[serde(default)]
    flags: AccountFlags,
}

#[derive(Deserialize, Default)]
struct AccountFlags {
    #[serde(default)]
    auth_required: bool,
}

#[derive(Deserialize)]
struct BalanceEntry {
    asset_type: String,
    balance: String,
}

/// A page of confirmed transactions, already projected onto our wire
/// format by the ledger node's adapter layer.
#[derive(Deserialize)]
struct TransactionPage {
    records: Vec<TransactionRecord>,
}

#[derive(Deserialize)]
struct TransactionRecord {
    hash: String,
    ledger_close_time: u64,
    successful: bool,
    cursor: String,
    operations: Vec<LedgerOperation>,
}

#[derive(serde::Serialize)]
struct SubmitRequest<'a> {
    blob: &'a [u8],
}

#[derive(Deserialize)]
struct SubmitResponse {
    successful: bool,
    #[serde(default)]
    result: Option<String>,
}

pub struct HorizonClient {
    client: reqwest::Client,
    base_url: String,
}

impl HorizonClient {
    /// Builds a client targeting `base_url`, refusing anything that doesn't
    /// look like a test network endpoint (§4.3: "attempts to target a
    /// production network URL must be rejected before any mutation").
    pub fn new(base_url: impl Into<String>) -> Result<Self, LedgerError> {
        let base_url = base_url.into();
        if !Config::is_test_network_url(&base_url) {
            return Err(LedgerError::ProductionNetworkRejected);
        }
        Ok(Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn reserve_for(_account: &AccountResponse) -> u64 {
        // Base reserve only; this client doesn't track subentry count
        // (trustlines, offers, signers), which a real Horizon-backed
        // deployment's minimum-balance formula also factors in.
        5_000_000
    }
}

fn stroops(balance: &str) -> u64 {
    let xlm: f64 = balance.parse().unwrap_or(0.0);
    (xlm * 10_000_000.0).round() as u64
}

#[async_trait]
impl LedgerClient for HorizonClient {
    async fn load_account(&self, addr: &LedgerAddress) -> Result<AccountInfo, LedgerError> {
        let resp = self
            .client
            .get(self.url(&format!("/accounts/{addr}")))
            .send()
            .await
            .map_err(|e| LedgerError::Transport(e.into()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(LedgerError::AccountNotFound(*addr));
        }
        let account: AccountResponse = resp
            .error_for_status()
            .map_err(|e| LedgerError::Transport(e.into()))?
            .json()
            .await
            .map_err(|e| LedgerError::Transport(e.into()))?;
        let native_balance = account
            .balances
            .iter()
            .find(|b| b.asset_type == "native")
            .map(|b| stroops(&b.balance))
            .unwrap_or(0);
        let sequence_number: u64 = account
            .sequence
            .parse()
            .map_err(|_| LedgerError::TxFailed("malformed sequence number in response".into()))?;
        Ok(AccountInfo {
            address: *addr,
            sequence_number,
            native_balance,
            reserve: Self::reserve_for(&account),
            auth_required: account.flags.auth_required,
        })
    }

    async fn submit(&self, envelope: &SignedEnvelope) -> Result<(), LedgerError> {
        let resp = self
            .client
            .post(self.url("/transactions"))
            .json(&SubmitRequest {
                blob: &envelope.blob,
            })
            .send()
            .await
            .map_err(|e| LedgerError::Transport(e.into()))?;
        let body: SubmitResponse = resp
            .json()
            .await
            .map_err(|e| LedgerError::Transport(e.into()))?;
        if body.successful {
            Ok(())
        } else {
            Err(LedgerError::TxFailed(
                body.result.unwrap_or_else(|| "rejected".to_string()),
            ))
        }
    }

    async fn fund_via_faucet(&self, addr: &LedgerAddress) -> Result<(), LedgerError> {
        let resp = self
            .client
            .get(self.url(&format!("/friendbot?addr={addr}")))
            .send()
            .await
            .map_err(|e| LedgerError::Transport(e.into()))?;
        resp.error_for_status()
            .map(|_| ())
            .map_err(|e| LedgerError::Transport(e.into()))
    }

    async fn stream_txs(&self, addr: LedgerAddress, cursor: Cursor) -> TxStream {
        let (tx, rx) = tokio::sync::mpsc::channel(64);
        let client = self.client.clone();
        let base_url = self.base_url.clone();

        tokio::spawn(async move {
            let mut cursor = cursor;
            loop {
                let url = format!(
                    "{base_url}/accounts/{addr}/transactions?cursor={}&order=asc&limit=20",
                    cursor.0
                );
                match client.get(&url).send().await {
                    Ok(resp) => match resp.json::<TransactionPage>().await {
                        Ok(page) => {
                            for record in page.records {
                                if !record.successful {
                                    continue;
                                }
                                cursor = Cursor(record.cursor.clone());
                                let mut hash = [0u8; 32];
                                if let Ok(decoded) = hex::decode(&record.hash) {
                                    if decoded.len() == 32 {
                                        hash.copy_from_slice(&decoded);
                                    }
                                }
                                let item = LedgerTx {
                                    hash,
                                    ledger_time: record.ledger_close_time,
                                    operations: record.operations,
                                };
                                if tx.send(Ok((item, cursor.clone()))).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to parse transaction page");
                        }
                    },
                    Err(e) => {
                        warn!(error = %e, "failed to poll transaction history");
                    }
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        });

        Box::pin(ReceiverStream::new(rx))
    }
}
