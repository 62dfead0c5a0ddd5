//! Catalog discovery against a Consul agent's HTTP API.
//!
//! The local peer registers itself as a service whose id and name are the
//! peer id, pointing at its health port and tagged with the `peer` meta
//! marker. Registration is retried every interval until the agent takes it. Every interval the agent's services are listed and each
//! peer not yet seen is fetched from its `/healthcheck` endpoint. On
//! cancellation the service is deregistered before the stream closes.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::time;
use tokio_util::sync::CancellationToken;

use murmur_core::wire;
use murmur_core::PeerRecord;

use crate::{Discovery, DiscoveryError, SightingSender, Sightings};

/// Service meta key marking a murmur peer.
pub const PEER_META: &str = "peer";

/// Per-request timeout for catalog and health calls.
const HTTP_TIMEOUT: Duration = Duration::from_secs(2);

// ── Consul agent API bodies ───────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceRegistration {
    #[serde(rename = "ID")]
    id: String,
    name: String,
    address: String,
    port: u16,
    meta: HashMap<String, String>,
    tags: Vec<String>,
    check: ServiceCheck,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceCheck {
    #[serde(rename = "HTTP")]
    http: String,
    method: String,
    interval: String,
    timeout: String,
}

/// One entry of `GET /v1/agent/services`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AgentService {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub meta: Option<HashMap<String, String>>,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub port: u16,
}

impl AgentService {
    pub fn is_peer(&self) -> bool {
        self.meta
            .as_ref()
            .map_or(false, |m| m.contains_key(PEER_META))
    }
}

// ── Discovery ─────────────────────────────────────────────────────────────────

pub struct CatalogDiscovery {
    http: reqwest::Client,
    /// `http://host:port` of the Consul agent.
    agent: String,
    service_id: String,
    advertise: IpAddr,
    health_port: u16,
    interval: Duration,
}

impl CatalogDiscovery {
    /// `agent` is the Consul agent as `host:port`. `advertise` is the
    /// address other peers will use to reach this one.
    pub fn new(
        me: &PeerRecord,
        agent: &str,
        advertise: IpAddr,
        interval: Duration,
    ) -> Result<Self, DiscoveryError> {
        let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        let agent = if agent.starts_with("http://") || agent.starts_with("https://") {
            agent.trim_end_matches('/').to_string()
        } else {
            format!("http://{agent}")
        };

        Ok(Self {
            http,
            agent,
            service_id: me.id.clone(),
            advertise,
            health_port: me.ports.health,
            interval,
        })
    }

    fn registration(&self) -> ServiceRegistration {
        let health = SocketAddr::new(self.advertise, self.health_port);
        ServiceRegistration {
            id: self.service_id.clone(),
            name: self.service_id.clone(),
            address: self.advertise.to_string(),
            port: self.health_port,
            meta: HashMap::from([(PEER_META.to_string(), "true".to_string())]),
            tags: vec![PEER_META.to_string()],
            check: ServiceCheck {
                http: format!("http://{health}/healthcheck"),
                method: "GET".into(),
                interval: "10s".into(),
                timeout: "1s".into(),
            },
        }
    }

    async fn register(&self) -> Result<()> {
        let url = format!("{}/v1/agent/service/register", self.agent);
        self.http
            .put(&url)
            .json(&self.registration())
            .send()
            .await
            .with_context(|| format!("failed to reach catalog at {url}"))?
            .error_for_status()
            .context("catalog rejected registration")?;
        Ok(())
    }

    async fn deregister(&self) -> Result<()> {
        let url = format!("{}/v1/agent/service/deregister/{}", self.agent, self.service_id);
        self.http
            .put(&url)
            .send()
            .await
            .with_context(|| format!("failed to reach catalog at {url}"))?
            .error_for_status()
            .context("catalog rejected deregistration")?;
        Ok(())
    }

    async fn services(&self) -> Result<Vec<AgentService>> {
        let url = format!("{}/v1/agent/services", self.agent);
        let services: HashMap<String, AgentService> = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("failed to reach catalog at {url}"))?
            .error_for_status()?
            .json()
            .await
            .context("failed to parse service list")?;
        Ok(services.into_values().collect())
    }

    /// Fetch a peer's identity from its health endpoint and attach the
    /// catalog address.
    async fn fetch_peer(&self, service: &AgentService) -> Result<PeerRecord> {
        let ip: IpAddr = service
            .address
            .parse()
            .with_context(|| format!("service address {:?} is not an IP", service.address))?;
        let url = format!("http://{}/healthcheck", SocketAddr::new(ip, service.port));

        let body = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("failed to reach {url}"))?
            .error_for_status()?
            .bytes()
            .await
            .context("failed to read health body")?;

        let peer = wire::decode_peer(&body)?;
        peer.addresses.add(ip);
        Ok(peer)
    }

    async fn run(self, tx: SightingSender, cancel: CancellationToken) {
        // The agent may come up after us; registration is retried on
        // every tick until it sticks.
        let mut registered = false;
        let mut fetched: HashSet<String> = HashSet::new();
        let mut ticker = time::interval(self.interval);

        'poll: loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if !registered {
                match self.register().await {
                    Ok(()) => {
                        tracing::info!(service = %self.service_id, agent = %self.agent, "registered in catalog");
                        registered = true;
                    }
                    Err(e) => tracing::warn!(error = %format!("{e:#}"), "catalog registration failed"),
                }
            }

            let services = match self.services().await {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(error = %e, "cannot list catalog services");
                    continue;
                }
            };

            for service in services.iter().filter(|s| s.is_peer()) {
                if fetched.contains(&service.id) {
                    continue;
                }
                let peer = match self.fetch_peer(service).await {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!(service = %service.id, error = %e, "cannot fetch peer");
                        continue;
                    }
                };
                tracing::debug!(peer = %peer.id, addr = %service.address, "catalog sighting");
                fetched.insert(service.id.clone());
                if !tx.emit(peer, &cancel).await {
                    break 'poll;
                }
            }
        }

        match self.deregister().await {
            Ok(()) => tracing::info!(service = %self.service_id, "deregistered from catalog"),
            Err(e) => tracing::warn!(error = %e, "catalog deregistration failed"),
        }
    }
}

impl Discovery for CatalogDiscovery {
    fn discover(&self, cancel: CancellationToken) -> Sightings {
        let (tx, rx) = Sightings::channel();
        let worker = Self {
            http: self.http.clone(),
            agent: self.agent.clone(),
            service_id: self.service_id.clone(),
            advertise: self.advertise,
            health_port: self.health_port,
            interval: self.interval,
        };
        tokio::spawn(worker.run(tx, cancel));
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_core::Ports;

    fn discovery() -> CatalogDiscovery {
        let me = PeerRecord::new(
            "abc".into(),
            "n".into(),
            Ports { secure: 1, greet: 2, health: 30003 },
            String::new(),
        );
        CatalogDiscovery::new(&me, "consul:8500", "10.1.2.3".parse().unwrap(), Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn registration_matches_agent_api() {
        let body = serde_json::to_value(discovery().registration()).unwrap();
        assert_eq!(body["ID"], "abc");
        assert_eq!(body["Name"], "abc");
        assert_eq!(body["Address"], "10.1.2.3");
        assert_eq!(body["Port"], 30003);
        assert_eq!(body["Meta"]["peer"], "true");
        assert_eq!(body["Check"]["HTTP"], "http://10.1.2.3:30003/healthcheck");
        assert_eq!(body["Check"]["Interval"], "10s");
        assert_eq!(body["Check"]["Timeout"], "1s");
    }

    #[test]
    fn agent_url_gets_scheme() {
        assert_eq!(discovery().agent, "http://consul:8500");
    }

    #[test]
    fn service_list_parses_and_filters_on_meta() {
        let json = r#"{
            "a": {"ID":"a","Service":"a","Meta":{"peer":"true"},"Address":"10.0.0.1","Port":1},
            "b": {"ID":"b","Service":"b","Meta":null,"Address":"10.0.0.2","Port":2},
            "c": {"ID":"c","Service":"c","Address":"10.0.0.3","Port":3,"Tags":["x"]}
        }"#;
        let services: HashMap<String, AgentService> = serde_json::from_str(json).unwrap();
        let mut peers: Vec<&str> = services.values().filter(|s| s.is_peer()).map(|s| s.id.as_str()).collect();
        peers.sort();
        assert_eq!(peers, vec!["a"]);
    }

    #[tokio::test]
    async fn registration_is_retried_until_agent_accepts() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        use axum::extract::State;
        use axum::http::StatusCode;
        use axum::routing::{get, put};
        use axum::{Json, Router};

        // Rejects the first two registrations, as an agent still starting up.
        async fn register(State(attempts): State<Arc<AtomicUsize>>) -> StatusCode {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                StatusCode::SERVICE_UNAVAILABLE
            } else {
                StatusCode::OK
            }
        }
        async fn services() -> Json<serde_json::Value> {
            Json(serde_json::json!({}))
        }

        let attempts = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route("/v1/agent/service/register", put(register))
            .route("/v1/agent/services", get(services))
            .with_state(attempts.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let agent = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move { axum::serve(listener, app).await });

        let me = PeerRecord::new("late".into(), "n".into(), Ports::default(), String::new());
        let source =
            CatalogDiscovery::new(&me, &agent, "127.0.0.1".parse().unwrap(), Duration::from_millis(20)).unwrap();
        let cancel = CancellationToken::new();
        let _sightings = source.discover(cancel.clone());

        let settled = tokio::time::timeout(Duration::from_secs(5), async {
            while attempts.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(settled.is_ok(), "registration was not retried");

        // Once accepted, it is not sent again.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        cancel.cancel();
    }
}
