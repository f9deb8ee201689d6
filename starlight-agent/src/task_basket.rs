//! The durable, at-most-once, retriable task basket (§4.2). `Store::commit`
//! already deduplicates enqueues by `(channel_id, round, kind)`; this module
//! is the runner loop that dequeues pending tasks in FIFO order and drives
//! each to completion with exponential backoff
//! ([`starlight_common::backoff::get_backoff_iter`]), the same base-100ms
//! capped backoff the spec also uses for indefinite faucet-funding retries.
//!
//! Transient failures (peer 5xx, timeout, transport errors) retry
//! indefinitely, matching "Peer transport errors... retried indefinitely by
//! the task basket with backoff." A ledger rejection (bad sequence number,
//! underfunded account) is not retried here — resubmitting the same signed
//! envelope would just fail again — it is logged and the task is dropped;
//! recovery is the FSM's job (a round that never lands its settlement tx
//! times out and force-closes, per `fsm::step_timer`).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use starlight_common::backoff::get_backoff_iter;
use starlight_common::shutdown::ShutdownChannel;
use starlight_ln::ledger::{DynLedgerClient, LedgerError};
use starlight_ln::message::PeerMessage;
use starlight_ln::task::Task;
use tokio::sync::Notify;
use tokio::time::interval;
use tracing::{debug, error, warn};

use crate::store::Store;

/// How often the runner polls the store even without a `Notify` wakeup,
/// so a missed notify is harmless (§4.2 additional implementation detail).
const POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum MessageSendError {
    #[error("peer rejected the message: {0}")]
    Rejected(String),
    #[error("peer endpoint returned a server error: {0}")]
    ServerError(String),
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Delivers an outbound [`PeerMessage`] to a peer's `POST /starlight/message`
/// endpoint (§6). `HttpMessageSender` is the real, `reqwest`-backed
/// implementation; tests substitute an in-memory recorder.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(
        &self,
        destination_url: &str,
        message: &PeerMessage,
    ) -> Result<(), MessageSendError>;
}

pub struct HttpMessageSender {
    client: reqwest::Client,
    store: Arc<Store>,
    /// This process's own externally reachable host (no scheme), so a peer
    /// receiving a fresh `ChannelPropose` knows where to send its
    /// `ChannelAccept` back to (§4.8's receiving side reads this off the
    /// `X-Starlight-Url` request header; see `server::peer::receive_message`).
    public_host: Arc<str>,
}

impl HttpMessageSender {
    pub fn new(store: Arc<Store>, public_host: Arc<str>) -> Self {
        Self {
            client: reqwest::Client::new(),
            store,
            public_host,
        }
    }
}

#[async_trait]
impl MessageSender for HttpMessageSender {
    async fn send(
        &self,
        destination_url: &str,
        message: &PeerMessage,
    ) -> Result<(), MessageSendError> {
        let url = format!("{}/starlight/message", destination_url.trim_end_matches('/'));
        let mut req = self.client.post(&url).json(message);
        if let Ok(Some(config)) = self.store.get_config() {
            req = req.header("X-Starlight-From", format!("{}*{}", config.username, self.public_host));
        }
        req = req.header("X-Starlight-Url", format!("https://{}", self.public_host));
        let resp = req.send().await?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = resp.text().await.unwrap_or_default();
            if status.is_server_error() {
                Err(MessageSendError::ServerError(format!("{status}: {body}")))
            } else {
                Err(MessageSendError::Rejected(format!("{status}: {body}")))
            }
        }
    }
}

enum Outcome {
    Done,
    Retry(String),
    GiveUp(String),
}

/// Runs the task basket's dequeue loop until shutdown (§4.2).
pub struct TaskBasket {
    store: Arc<Store>,
    ledger: DynLedgerClient,
    sender: Arc<dyn MessageSender>,
    notify: Arc<Notify>,
}

impl TaskBasket {
    pub fn new(
        store: Arc<Store>,
        ledger: DynLedgerClient,
        sender: Arc<dyn MessageSender>,
        notify: Arc<Notify>,
    ) -> Self {
        Self {
            store,
            ledger,
            sender,
            notify,
        }
    }

    /// Wakes the runner promptly after a fresh enqueue, per the `Notify`
    /// contract in §4.2 ("purely a latency optimization").
    pub fn notify_handle(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    pub async fn run(&self, shutdown: ShutdownChannel) {
        let mut poll = interval(POLL_INTERVAL);
        loop {
            if shutdown.is_shutdown() {
                return;
            }

            let pending = match self.store.list_pending_tasks() {
                Ok(pending) => pending,
                Err(e) => {
                    error!(error = %e, "task basket failed to list pending tasks");
                    Vec::new()
                }
            };

            if pending.is_empty() {
                tokio::select! {
                    _ = self.notify.notified() => {}
                    _ = poll.tick() => {}
                    _ = shutdown.recv() => return,
                }
                continue;
            }

            for (task_id, task) in pending {
                if shutdown.is_shutdown() {
                    return;
                }
                if !self.execute_with_retry(task_id, &task, &shutdown).await {
                    return;
                }
            }
        }
    }

    /// Returns `false` if shutdown fired mid-retry, so the caller stops
    /// iterating the rest of the batch.
    async fn execute_with_retry(&self, task_id: u64, task: &Task, shutdown: &ShutdownChannel) -> bool {
        let mut backoff = get_backoff_iter();
        loop {
            match self.execute_once(task).await {
                Outcome::Done => {
                    if let Err(e) = self.store.remove_task(task_id) {
                        error!(error = %e, task_id, "failed to remove completed task");
                    }
                    return true;
                }
                Outcome::GiveUp(reason) => {
                    error!(task_id, %reason, "task basket giving up on task, recovery is the FSM's job");
                    if let Err(e) = self.store.remove_task(task_id) {
                        error!(error = %e, task_id, "failed to remove abandoned task");
                    }
                    return true;
                }
                Outcome::Retry(reason) => {
                    let wait = backoff.next().expect("backoff iterator is infinite");
                    debug!(task_id, %reason, wait_ms = wait.as_millis() as u64, "task failed, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = shutdown.recv() => return false,
                    }
                }
            }
        }
    }

    async fn execute_once(&self, task: &Task) -> Outcome {
        match task {
            Task::TxTask { envelope, .. } => match self.ledger.submit(envelope).await {
                Ok(()) => Outcome::Done,
                Err(LedgerError::Transport(e)) => Outcome::Retry(e.to_string()),
                Err(e @ LedgerError::TxFailed(_))
                | Err(e @ LedgerError::AccountNotFound(_))
                | Err(e @ LedgerError::ProductionNetworkRejected) => {
                    warn!(error = %e, "ledger rejected a queued transaction");
                    Outcome::GiveUp(e.to_string())
                }
            },
            Task::MsgTask {
                destination_url,
                message,
                ..
            } => match self.sender.send(destination_url, message).await {
                Ok(()) => Outcome::Done,
                Err(e @ MessageSendError::Transport(_)) | Err(e @ MessageSendError::ServerError(_)) => {
                    Outcome::Retry(e.to_string())
                }
                Err(e @ MessageSendError::Rejected(_)) => Outcome::GiveUp(e.to_string()),
            },
        }
    }
}
