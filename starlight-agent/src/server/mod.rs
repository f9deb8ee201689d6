//! The two HTTP surfaces the agent exposes: the peer RPC surface (§4.8,
//! anyone on the network may call it) and the local command surface (§6,
//! consumed by the front-end that runs alongside this process). Grounded in
//! the teacher's `node::server` module, which builds two independent
//! `axum::Router`s (`app_router`/`lexe_router`) from a `with_state` call
//! plus a flat list of `.route(...)`s; we do the same with `peer_router`/
//! `command_router`.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

mod command;
mod peer;

pub use peer::PeerRouterState;

use crate::agent::Agent;

/// `POST /starlight/message`, `GET /federation`,
/// `GET /.well-known/stellar.toml` (§4.8).
pub fn peer_router(state: PeerRouterState) -> Router<()> {
    Router::new()
        .route("/starlight/message", post(peer::receive_message))
        .route("/federation", get(peer::federation))
        .route("/.well-known/stellar.toml", get(peer::stellar_toml))
        .with_state(state)
}

/// `/api/*` (§6), the fixed contract consumed by the local front-end.
pub fn command_router(agent: Arc<Agent>) -> Router<()> {
    Router::new()
        .route("/api/config-init", post(command::config_init))
        .route("/api/config-edit", post(command::config_edit))
        .route("/api/do-create-channel", post(command::do_create_channel))
        .route("/api/do-wallet-pay", post(command::do_wallet_pay))
        .route("/api/do-command", post(command::do_command))
        .route("/api/messages", get(command::messages))
        .route("/api/updates", get(command::updates))
        .with_state(agent)
}

/// Wraps an [`AgentError`](crate::agent::AgentError) (or a command-surface-
/// only failure) as an axum response, mapping §7's error-kind taxonomy to an
/// HTTP status plus the wire-level `ErrorResponse` body.
pub(super) struct HttpError(pub CommandError);

#[derive(Debug, thiserror::Error)]
pub(super) enum CommandError {
    #[error(transparent)]
    Agent(#[from] crate::agent::AgentError),
    #[error("federation lookup failed: {0}")]
    Resolve(String),
}

impl CommandError {
    fn kind(&self) -> starlight_common::error::ErrorKind {
        match self {
            CommandError::Agent(e) => e.kind(),
            CommandError::Resolve(_) => starlight_common::error::ErrorKind::Validation,
        }
    }
}

impl From<crate::agent::AgentError> for HttpError {
    fn from(e: crate::agent::AgentError) -> Self {
        HttpError(CommandError::Agent(e))
    }
}

impl axum::response::IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        let kind = self.0.kind();
        let status = axum::http::StatusCode::from_u16(kind.to_http_status().0)
            .unwrap_or(axum::http::StatusCode::INTERNAL_SERVER_ERROR);
        let body: starlight_common::error::ErrorResponse =
            starlight_common::error::ApiError::new(kind, self.0.to_string()).into();
        (status, axum::Json(body)).into_response()
    }
}
