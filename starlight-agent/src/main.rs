//! Process entry point (§4.9, §6). CLI parsing is out of scope here (§6
//! "Environment / CLI"), so everything this binary needs is read from the
//! environment instead of the teacher's `argh`-based [`Args`].
//!
//! [`Args`]: https://docs.rs/argh

use std::env;
use std::sync::Arc;

use starlight_agent::agent::Agent;
use starlight_agent::horizon::HorizonClient;
use starlight_agent::server::{self, PeerRouterState};
use starlight_agent::store::Store;
use starlight_agent::task_basket::HttpMessageSender;
use starlight_common::config::DEFAULT_HORIZON_URL;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let db_path = env::var("STARLIGHT_DB_PATH").unwrap_or_else(|_| "starlight-agent.sled".to_string());
    let bind_addr = env::var("STARLIGHT_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let public_host: Arc<str> = env::var("STARLIGHT_PUBLIC_HOST")
        .unwrap_or_else(|_| bind_addr.clone())
        .into();
    let horizon_url = env::var("STARLIGHT_HORIZON_URL").unwrap_or_else(|_| DEFAULT_HORIZON_URL.to_string());

    let store = Arc::new(Store::open(&db_path)?);
    let ledger = Arc::new(HorizonClient::new(horizon_url)?);
    let sender = Arc::new(HttpMessageSender::new(store.clone(), public_host.clone()));
    let agent = Agent::new(store, ledger, sender);
    agent.start()?;

    let public_base_url: Arc<str> = format!("https://{public_host}").into();
    let peer_state = PeerRouterState {
        agent: agent.clone(),
        public_base_url,
    };
    let app = server::peer_router(peer_state).merge(server::command_router(agent.clone()));

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(%bind_addr, %public_host, "starlight-agent listening");

    let shutdown = agent.shutdown_handle();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = shutdown.recv() => {}
            }
        })
        .await?;

    agent.close_wait().await;
    Ok(())
}
