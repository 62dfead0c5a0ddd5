//! murmur integration test harness.
//!
//! Every test runs whole peers in-process on 127.0.0.1 with OS-assigned
//! ports, so tests can run in parallel without any network setup. The
//! catalog is an in-process fake of the Consul agent endpoints murmur uses.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use axum::extract::{Path, State};
use axum::routing::{get, put};
use axum::{Json, Router};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use murmur_core::{LocalPeer, Message, PeerRegistry, Ports};
use murmur_transport::{Handler, MessageStreams};
use murmurd::Instance;

mod discovery;
mod messaging;

pub const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
pub const WAIT: Duration = Duration::from_secs(10);

// ── Peers ─────────────────────────────────────────────────────────────────────

/// One running peer.
pub struct TestPeer {
    pub me: Arc<LocalPeer>,
    pub registry: Arc<PeerRegistry>,
    pub handler: Arc<Handler>,
    pub streams: MessageStreams,
    pub cancel: CancellationToken,
    pub task: JoinHandle<Result<()>>,
}

impl TestPeer {
    pub fn id(&self) -> &str {
        self.me.id()
    }

    /// Stop the peer and wait for it to drain.
    pub async fn stop(self) -> Result<()> {
        self.cancel.cancel();
        match tokio::time::timeout(WAIT, self.task).await {
            Ok(joined) => joined?,
            Err(_) => bail!("peer {} did not shut down", self.me.id()),
        }
    }
}

/// Start a peer on loopback. `configure` may add discovery sources.
pub async fn start_peer(seed: u64, configure: impl FnOnce(&mut Instance)) -> TestPeer {
    let mut rng = StdRng::seed_from_u64(seed);
    let cancel = CancellationToken::new();
    let (mut instance, streams) = Instance::bind(LOOPBACK, Ports::default(), &mut rng, cancel.clone())
        .await
        .expect("bind peer");
    configure(&mut instance);

    let me = instance.me().clone();
    let registry = instance.registry().clone();
    let handler = instance.handler().clone();
    let task = tokio::spawn(instance.run());

    TestPeer {
        me,
        registry,
        handler,
        streams,
        cancel,
        task,
    }
}

/// Tell `at` about `about` directly: identity, certificate and loopback.
pub fn introduce(at: &TestPeer, about: &TestPeer) {
    let record = murmur_core::wire::PeerPayload::from(about.me.record().as_ref()).into_record();
    record.addresses.add(LOOPBACK);
    at.registry.add(Arc::new(record));
}

/// Wait until `registry` holds `id`.
pub async fn wait_for_peer(registry: &PeerRegistry, id: &str) -> Result<()> {
    let waited = tokio::time::timeout(WAIT, async {
        loop {
            let signal = registry.changed();
            if registry.contains(id) {
                return;
            }
            signal.fired().await;
        }
    })
    .await;
    if waited.is_err() {
        bail!("peer {id} never appeared");
    }
    Ok(())
}

/// Next message on `rx`, or an error after `WAIT`.
pub async fn next_message(rx: &mut tokio::sync::mpsc::UnboundedReceiver<Message>) -> Result<Message> {
    match tokio::time::timeout(WAIT, rx.recv()).await {
        Ok(Some(m)) => Ok(m),
        Ok(None) => bail!("message stream closed"),
        Err(_) => bail!("no message within {WAIT:?}"),
    }
}

// ── Fake catalog ──────────────────────────────────────────────────────────────

/// The subset of the Consul agent API murmur talks to.
#[derive(Clone, Default)]
pub struct FakeCatalog {
    pub services: Arc<Mutex<HashMap<String, Value>>>,
    pub deregistered: Arc<Mutex<Vec<String>>>,
}

impl FakeCatalog {
    /// Serve on an ephemeral loopback port; returns `host:port`.
    pub async fn spawn(&self, cancel: CancellationToken) -> String {
        let app = Router::new()
            .route("/v1/agent/service/register", put(register))
            .route("/v1/agent/service/deregister/{id}", put(deregister))
            .route("/v1/agent/services", get(services))
            .with_state(self.clone());

        let listener = TcpListener::bind((LOOPBACK, 0)).await.expect("bind fake catalog");
        let addr: SocketAddr = listener.local_addr().expect("fake catalog addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(cancel.cancelled_owned())
                .await;
        });
        addr.to_string()
    }
}

async fn register(State(catalog): State<FakeCatalog>, Json(body): Json<Value>) -> Json<Value> {
    let id = body["ID"].as_str().unwrap_or_default().to_string();
    let entry = json!({
        "ID": id,
        "Service": body["Name"],
        "Meta": body["Meta"],
        "Tags": body["Tags"],
        "Address": body["Address"],
        "Port": body["Port"],
    });
    catalog.services.lock().insert(id, entry);
    Json(Value::Null)
}

async fn deregister(State(catalog): State<FakeCatalog>, Path(id): Path<String>) -> Json<Value> {
    catalog.services.lock().remove(&id);
    catalog.deregistered.lock().push(id);
    Json(Value::Null)
}

async fn services(State(catalog): State<FakeCatalog>) -> Json<Value> {
    let services = catalog.services.lock().clone();
    Json(json!(services))
}
