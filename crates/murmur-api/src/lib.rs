//! HTTP surface of a murmur peer.
//!
//! Only `/healthcheck` lives here: it answers with the peer's public
//! identity, which is both the catalog's liveness probe and how catalog
//! discovery learns who sits behind a registered service.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use murmur_core::wire::PeerPayload;
use murmur_core::PeerRecord;

pub fn router(me: Arc<PeerRecord>) -> Router {
    Router::new()
        .route("/healthcheck", get(handle_healthcheck))
        .with_state(me)
}

async fn handle_healthcheck(State(me): State<Arc<PeerRecord>>) -> Json<PeerPayload> {
    Json(PeerPayload::from(me.as_ref()))
}

/// Serve the health endpoint on `listener` until `cancel` fires.
pub async fn serve(me: Arc<PeerRecord>, listener: TcpListener, cancel: CancellationToken) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(addr = %addr, "health endpoint listening");

    axum::serve(listener, router(me))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;

    tracing::info!("health endpoint stopped");
    Ok(())
}
