//! Handlers for the local `/api/*` command surface (§6). The front-end that
//! calls these endpoints is out of this crate's scope, but the contract
//! itself — request/response shapes, status codes — is fixed, so it is
//! implemented here rather than left as a stub.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use starlight_common::config::{ConfigEdit, ConfigInit};
use starlight_common::federation::{FederationAddress, FederationResponse};
use starlight_common::LedgerAddress;
use starlight_ln::command::{Command, Pay};
use starlight_ln::fsm::FsmError;
use starlight_ln::update::Update;

use super::{CommandError, HttpError};
use crate::agent::{Agent, AgentError};
use crate::store::OutboundMessage;
use crate::update_loop::ArmedTimer;

#[derive(Deserialize)]
pub(super) struct ConfigInitRequest {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub demo_server: bool,
    #[serde(default)]
    pub horizon_url: Option<String>,
    #[serde(default)]
    pub max_round_duration_secs: Option<u64>,
    #[serde(default)]
    pub finality_delay_secs: Option<u64>,
    #[serde(default)]
    pub channel_feerate: Option<u64>,
    #[serde(default)]
    pub host_feerate: Option<u64>,
    #[serde(default)]
    pub keep_alive: Option<bool>,
    #[serde(default)]
    pub public: Option<bool>,
}

pub(super) async fn config_init(
    State(agent): State<Arc<Agent>>,
    Json(req): Json<ConfigInitRequest>,
) -> Result<(), HttpError> {
    let init = ConfigInit {
        username: req.username,
        password: req.password,
        horizon_url: req.horizon_url,
        max_round_duration: req.max_round_duration_secs.map(Duration::from_secs),
        finality_delay: req.finality_delay_secs.map(Duration::from_secs),
        channel_feerate: req.channel_feerate,
        host_feerate: req.host_feerate,
        keep_alive: req.keep_alive,
        public: req.public,
    };
    agent.config_init(init, req.demo_server)?;
    Ok(())
}

#[derive(Deserialize)]
pub(super) struct ConfigEditRequest {
    #[serde(default)]
    pub old_password: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub horizon_url: Option<String>,
    #[serde(default)]
    pub max_round_duration_secs: Option<u64>,
    #[serde(default)]
    pub finality_delay_secs: Option<u64>,
    #[serde(default)]
    pub channel_feerate: Option<u64>,
    #[serde(default)]
    pub host_feerate: Option<u64>,
}

pub(super) async fn config_edit(
    State(agent): State<Arc<Agent>>,
    Json(req): Json<ConfigEditRequest>,
) -> Result<(), HttpError> {
    let edit = ConfigEdit {
        old_password: req.old_password,
        password: req.password,
        horizon_url: req.horizon_url,
        max_round_duration: req.max_round_duration_secs.map(Duration::from_secs),
        finality_delay: req.finality_delay_secs.map(Duration::from_secs),
        channel_feerate: req.channel_feerate,
        host_feerate: req.host_feerate,
    };
    agent.config_edit(edit)?;
    Ok(())
}

#[derive(Deserialize)]
pub(super) struct DoCreateChannelRequest {
    /// `name*host` federation address; resolved to a ledger account and a
    /// callback URL via `GET stellar.toml` + `GET /federation` on `host`,
    /// since that lookup is this surface's job, not the agent facade's
    /// (§4.8 is the serving side of federation, not the consuming side).
    pub guest: String,
    pub host_amount: u64,
}

pub(super) async fn do_create_channel(
    State(agent): State<Arc<Agent>>,
    Json(req): Json<DoCreateChannelRequest>,
) -> Result<Json<Vec<ArmedTimer>>, HttpError> {
    let guest: FederationAddress = req
        .guest
        .parse()
        .map_err(|_| AgentError::Fsm(FsmError::Validation("malformed federation address".into())))?;
    let (guest_account, guest_url) = resolve_federation(&guest).await?;
    let timers = agent.do_create_channel(guest, guest_account, guest_url, req.host_amount)?;
    Ok(Json(timers))
}

/// Resolves a federation address to `(account_id, callback_url)` by
/// fetching the counterparty's `stellar.toml` (for `STARLIGHT_SERVER`) and
/// then its `/federation` endpoint (for `account_id`), mirroring the two
/// peer-side handlers in `super::peer`.
async fn resolve_federation(
    guest: &FederationAddress,
) -> Result<(LedgerAddress, String), HttpError> {
    let client = reqwest::Client::new();
    let toml_url = format!("https://{}/.well-known/stellar.toml", guest.host());
    let toml_body = client
        .get(&toml_url)
        .send()
        .await
        .map_err(|e| resolve_err(e.to_string()))?
        .text()
        .await
        .map_err(|e| resolve_err(e.to_string()))?;

    let federation_server = toml_value(&toml_body, "FEDERATION_SERVER")
        .ok_or_else(|| resolve_err("stellar.toml missing FEDERATION_SERVER".into()))?;
    let starlight_server = toml_value(&toml_body, "STARLIGHT_SERVER")
        .ok_or_else(|| resolve_err("stellar.toml missing STARLIGHT_SERVER".into()))?;

    let resp: FederationResponse = client
        .get(&federation_server)
        .query(&[("type", "name"), ("q", guest.to_string().as_str())])
        .send()
        .await
        .map_err(|e| resolve_err(e.to_string()))?
        .json()
        .await
        .map_err(|e| resolve_err(e.to_string()))?;

    Ok((resp.account_id, starlight_server))
}

fn toml_value(body: &str, key: &str) -> Option<String> {
    body.lines().find_map(|line| {
        let (k, v) = line.split_once('=')?;
        if k.trim() != key {
            return None;
        }
        Some(v.trim().trim_matches('"').to_string())
    })
}

fn resolve_err(msg: String) -> HttpError {
    HttpError(CommandError::Resolve(msg))
}

#[derive(Deserialize)]
pub(super) struct DoWalletPayRequest {
    pub destination: LedgerAddress,
    pub amount: u64,
}

pub(super) async fn do_wallet_pay(
    State(agent): State<Arc<Agent>>,
    Json(req): Json<DoWalletPayRequest>,
) -> Result<(), HttpError> {
    agent.do_wallet_command(Command::Pay(Pay {
        destination: req.destination,
        amount: req.amount,
    }))?;
    Ok(())
}

#[derive(Deserialize)]
pub(super) struct DoCommandRequest {
    #[serde(default)]
    pub channel_id: Option<LedgerAddress>,
    pub command: Command,
}

/// Dispatches to whichever of `do_channel_command`/`do_wallet_command`
/// fits the command's scope, the same split the agent facade draws
/// internally (`Pay`/`AddAsset`/`RemoveAsset`/`KeepAlive` are wallet-level;
/// everything else needs a `channel_id`).
pub(super) async fn do_command(
    State(agent): State<Arc<Agent>>,
    Json(req): Json<DoCommandRequest>,
) -> Result<Json<Vec<ArmedTimer>>, HttpError> {
    let is_wallet_scoped = matches!(
        req.command,
        Command::Pay(_) | Command::AddAsset(_) | Command::RemoveAsset(_) | Command::KeepAlive
    );
    let timers = if is_wallet_scoped {
        agent.do_wallet_command(req.command)?;
        Vec::new()
    } else {
        let channel_id = req.channel_id.ok_or_else(|| {
            AgentError::Fsm(FsmError::Validation("this command requires a channel_id".into()))
        })?;
        agent.do_channel_command(channel_id, req.command)?
    };
    Ok(Json(timers))
}

#[derive(Deserialize)]
pub(super) struct MessagesQuery {
    pub channel_id: LedgerAddress,
}

/// `GET /api/messages` (§6, "long-poll"): returns immediately with whatever
/// is currently queued. A true long-poll (block until a new message lands)
/// needs a notification channel threaded from the store's commit path
/// through to this handler; out of scope here since this surface's callers
/// are themselves out of scope (§1).
pub(super) async fn messages(
    State(agent): State<Arc<Agent>>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<Vec<OutboundMessage>>, HttpError> {
    let messages = agent
        .store()
        .list_outbound_messages(&query.channel_id)
        .map_err(AgentError::from)?;
    Ok(Json(messages))
}

#[derive(Deserialize)]
pub(super) struct UpdatesQuery {
    #[serde(default)]
    pub since: u64,
}

/// `GET /api/updates` (§6, "subscribe"): returns every `Update` committed at
/// sequence number `since` or later. Same non-blocking simplification as
/// [`messages`].
pub(super) async fn updates(
    State(agent): State<Arc<Agent>>,
    Query(query): Query<UpdatesQuery>,
) -> Result<Json<Vec<Update>>, HttpError> {
    let updates = agent
        .store()
        .list_updates_since(query.since)
        .map_err(AgentError::from)?;
    Ok(Json(updates))
}
