//! Handlers for `/starlight/*` and the federation discovery endpoints
//! (§4.8). Callable by any peer on the network; none of these require
//! authentication, since a watchtower-mode agent must still be able to
//! receive and react to peer messages (§9 "Watchtower mode").

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use starlight_common::federation::{FederationAddress, FederationResponse, StellarToml};
use starlight_ln::fsm::FsmError;
use starlight_ln::message::PeerMessage;

use super::HttpError;
use crate::agent::{reject_if_local_role_is_host, Agent, AgentError};

/// Shared state for the peer router: the agent facade plus the externally
/// reachable base URL this process is served under (needed to fill in
/// `stellar.toml`'s `FEDERATION_SERVER`/`STARLIGHT_SERVER`, neither of which
/// the agent's own config tracks — §6 "Environment / CLI: out of scope").
#[derive(Clone)]
pub struct PeerRouterState {
    pub agent: Arc<Agent>,
    pub public_base_url: Arc<str>,
}

/// `POST /starlight/message` (§4.8). The sender identifies itself via two
/// headers, since the wire body itself carries no return address: `X-
/// Starlight-From` (its own `name*host` federation address) and `X-
/// Starlight-Url` (the base URL this agent should call back to). Both are
/// required only when the message would create a brand-new channel
/// (`ChannelPropose` on an unknown channel ID); for messages on a channel we
/// already track, the counterparty's address/URL come from the stored
/// channel record instead.
pub(super) async fn receive_message(
    State(state): State<PeerRouterState>,
    headers: HeaderMap,
    Json(message): Json<PeerMessage>,
) -> Result<(), HttpError> {
    let channel_id = message.channel_id;
    reject_if_local_role_is_host(state.agent.store(), &channel_id)?;

    let peer_address = headers
        .get("x-starlight-from")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<FederationAddress>().ok());
    let peer_url = headers
        .get("x-starlight-url")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    state
        .agent
        .handle_peer_message(channel_id, message, peer_address, peer_url)?;
    Ok(())
}

#[derive(Deserialize)]
pub(super) struct FederationQuery {
    #[serde(rename = "type")]
    kind: String,
    q: String,
}

/// `GET /federation?type=name&q=NAME*HOST` (§4.8): "returns JSON
/// `{stellar_address, account_id}` for the local user only." Any lookup
/// whose name doesn't match the locally configured username is rejected;
/// this agent only ever answers for itself.
pub(super) async fn federation(
    State(state): State<PeerRouterState>,
    Query(query): Query<FederationQuery>,
) -> Result<Json<FederationResponse>, HttpError> {
    if query.kind != "name" {
        return Err(validation("only `type=name` federation lookups are supported").into());
    }
    let addr: FederationAddress = query
        .q
        .parse()
        .map_err(|_| validation("malformed federation address"))?;

    let config = state
        .agent
        .config()?
        .ok_or(AgentError::NotInitialized)?;
    if addr.name() != config.username {
        return Err(validation("federation lookups are only served for the local user").into());
    }
    let account_id = state
        .agent
        .primary_account()?
        .ok_or(AgentError::NotInitialized)?;

    Ok(Json(FederationResponse {
        stellar_address: addr.to_string(),
        account_id,
    }))
}

/// `GET /.well-known/stellar.toml` (§4.8): "returns `FEDERATION_SERVER` and
/// `STARLIGHT_SERVER` URLs." No `toml` crate is pulled in for two fixed
/// keys; this just writes the same lines a real stellar.toml would carry.
pub(super) async fn stellar_toml(State(state): State<PeerRouterState>) -> impl IntoResponse {
    let toml = StellarToml {
        federation_server: format!("{}/federation", state.public_base_url),
        starlight_server: format!("{}/starlight/message", state.public_base_url),
    };
    let body = format!(
        "FEDERATION_SERVER=\"{}\"\nSTARLIGHT_SERVER=\"{}\"\n",
        toml.federation_server, toml.starlight_server
    );
    ([(header::CONTENT_TYPE, "application/toml")], body)
}

fn validation(msg: &str) -> AgentError {
    AgentError::Fsm(FsmError::Validation(msg.to_string()))
}
