//! A running murmur peer: listeners, identity, registry, transport and
//! discovery wired together.

use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use murmur_core::config::MurmurConfig;
use murmur_core::{LocalPeer, PeerRecord, PeerRegistry, Ports};
use murmur_discovery::{netif, CatalogDiscovery, Discovery, Family, MergeDiscovery, MulticastDiscovery, Sightings};
use murmur_transport::{Handler, MessageStreams};

/// The three TCP listeners, bound before the identity is created so the
/// announced ports are the real ones even when 0 was requested.
pub struct Listeners {
    pub secure: TcpListener,
    pub greet: TcpListener,
    pub health: TcpListener,
}

impl Listeners {
    pub async fn bind(ip: IpAddr, ports: Ports) -> Result<Self> {
        let bind = |port: u16, what: &'static str| async move {
            TcpListener::bind((ip, port))
                .await
                .with_context(|| format!("failed to bind {what} listener on {ip}:{port}"))
        };
        Ok(Self {
            secure: bind(ports.secure, "secure").await?,
            greet: bind(ports.greet, "greet").await?,
            health: bind(ports.health, "health").await?,
        })
    }

    pub fn ports(&self) -> Result<Ports> {
        Ok(Ports {
            secure: self.secure.local_addr()?.port(),
            greet: self.greet.local_addr()?.port(),
            health: self.health.local_addr()?.port(),
        })
    }
}

pub struct Instance {
    me: Arc<LocalPeer>,
    registry: Arc<PeerRegistry>,
    handler: Arc<Handler>,
    discovery: MergeDiscovery,
    listeners: Listeners,
    cancel: CancellationToken,
}

impl Instance {
    /// Bind listeners on `ip`, then create the local identity and transport.
    /// Nothing runs until [`Instance::run`].
    pub async fn bind(
        ip: IpAddr,
        ports: Ports,
        rng: &mut StdRng,
        cancel: CancellationToken,
    ) -> Result<(Self, MessageStreams)> {
        let listeners = Listeners::bind(ip, ports).await?;
        let me = Arc::new(
            LocalPeer::generate(rng, listeners.ports()?).context("cannot generate peer identity")?,
        );
        let registry = Arc::new(PeerRegistry::new());

        let handler_rng = StdRng::from_rng(&mut *rng).context("cannot seed message rng")?;
        let (handler, streams) = Handler::new(me.clone(), registry.clone(), handler_rng, cancel.clone())
            .context("cannot build TLS configuration")?;

        let instance = Self {
            me,
            registry,
            handler,
            discovery: MergeDiscovery::new(),
            listeners,
            cancel,
        };
        Ok((instance, streams))
    }

    pub fn me(&self) -> &Arc<LocalPeer> {
        &self.me
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn handler(&self) -> &Arc<Handler> {
        &self.handler
    }

    pub fn add_discovery(&mut self, source: impl Discovery + 'static) {
        self.discovery.push(source);
    }

    /// Add every discovery source `config` enables.
    pub fn configure_discovery(&mut self, config: &MurmurConfig) -> Result<()> {
        let me = self.me.record().clone();
        let d = &config.discovery;

        if !d.udp6_group.is_empty() {
            let source = MulticastDiscovery::new(Family::V6, &d.udp6_group, d.port, &me, d.interval())
                .context("invalid IPv6 discovery settings")?;
            self.add_discovery(source);
        }
        if !d.udp4_group.is_empty() {
            let source = MulticastDiscovery::new(Family::V4, &d.udp4_group, d.port, &me, d.interval())
                .context("invalid IPv4 discovery settings")?;
            self.add_discovery(source);
        }

        if config.catalog.enabled {
            let advertise: IpAddr = if config.catalog.advertise_addr.is_empty() {
                netif::first_external_v4()
                    .map(IpAddr::V4)
                    .context("no non-loopback IPv4 address to advertise")?
            } else {
                config
                    .catalog
                    .advertise_addr
                    .parse()
                    .context("invalid catalog.advertise_addr")?
            };
            let source = CatalogDiscovery::new(&me, &config.catalog.address, advertise, config.catalog.interval())
                .context("cannot build catalog client")?;
            self.add_discovery(source);
        }

        if self.discovery.is_empty() {
            tracing::warn!("no discovery source enabled; peers must greet us first");
        }
        Ok(())
    }

    /// Run until the cancellation token fires and every task has drained.
    pub async fn run(self) -> Result<()> {
        tracing::info!(
            peer = %self.me.id(),
            name = %self.me.record().name,
            sources = self.discovery.len(),
            "instance starting"
        );

        let sightings = self.discovery.discover(self.cancel.clone());
        let watcher = tokio::spawn(watch_peers(self.me.record().clone(), self.registry.clone(), sightings));

        let health = murmur_api::serve(self.me.record().clone(), self.listeners.health, self.cancel.clone());
        let transport = self.handler.clone().run(self.listeners.secure, self.listeners.greet);
        let (health, ()) = tokio::join!(health, transport);
        health.context("health endpoint failed")?;

        if let Err(e) = watcher.await {
            tracing::error!(error = %e, "peer watcher panicked");
        }
        tracing::info!("instance stopped");
        Ok(())
    }
}

/// Feed sightings into the registry until the stream ends. Sightings of
/// ourselves only extend our own address set.
pub async fn watch_peers(me: Arc<PeerRecord>, registry: Arc<PeerRegistry>, mut sightings: Sightings) {
    while let Some(peer) = sightings.next().await {
        if peer.id == me.id {
            if me.addresses.merge_from(&peer.addresses) {
                tracing::debug!(addrs = ?me.addresses.list(), "own address set grew");
            }
            continue;
        }
        registry.add(Arc::new(peer));
    }
}
