use crate::*;

use murmur_core::PeerRecord;
use murmur_discovery::{CatalogDiscovery, Discovery, MergeDiscovery, StaticDiscovery};

fn record(id: &str) -> PeerRecord {
    PeerRecord::new(id.into(), format!("peer-{id}"), Ports::default(), String::new())
}

// ── Merge ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn merge_forwards_every_sighting_then_ends() {
    let mut merged = MergeDiscovery::new();
    for source in 0..4 {
        let mut s = StaticDiscovery::new();
        for n in 0..3 {
            s = s.with_peer(&record(&format!("{source}-{n}")));
        }
        merged.push(s);
    }

    let mut sightings = merged.discover(CancellationToken::new());
    let mut seen = Vec::new();
    let drained = tokio::time::timeout(WAIT, async {
        while let Some(peer) = sightings.next().await {
            seen.push(peer.id);
        }
    })
    .await;

    assert!(drained.is_ok(), "merged stream never closed");
    seen.sort();
    assert_eq!(seen.len(), 12);
    seen.dedup();
    assert_eq!(seen.len(), 12);
}

#[tokio::test]
async fn merge_of_nothing_closes_immediately() {
    let mut sightings = MergeDiscovery::new().discover(CancellationToken::new());
    let next = tokio::time::timeout(WAIT, sightings.next()).await;
    assert!(matches!(next, Ok(None)));
}

// ── Catalog ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn catalog_registers_and_deregisters() {
    let stop = CancellationToken::new();
    let catalog = FakeCatalog::default();
    let agent = catalog.spawn(stop.clone()).await;

    let me = record("catalog-self");
    let source = CatalogDiscovery::new(&me, &agent, LOOPBACK, Duration::from_millis(100)).unwrap();

    let cancel = CancellationToken::new();
    let mut sightings = source.discover(cancel.clone());

    let registered = tokio::time::timeout(WAIT, async {
        while !catalog.services.lock().contains_key("catalog-self") {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(registered.is_ok(), "service never registered");
    {
        let services = catalog.services.lock();
        let entry = &services["catalog-self"];
        assert_eq!(entry["Meta"]["peer"], "true");
        assert_eq!(entry["Address"], "127.0.0.1");
    }

    cancel.cancel();
    let closed = tokio::time::timeout(WAIT, async { while sightings.next().await.is_some() {} }).await;
    assert!(closed.is_ok(), "sightings never closed after cancel");

    assert!(!catalog.services.lock().contains_key("catalog-self"));
    assert_eq!(catalog.deregistered.lock().as_slice(), ["catalog-self".to_string()]);
    stop.cancel();
}

#[tokio::test]
async fn catalog_peers_find_each_other_and_talk() {
    let stop = CancellationToken::new();
    let catalog = FakeCatalog::default();
    let agent = catalog.spawn(stop.clone()).await;

    let with_catalog = |instance: &mut murmurd::Instance| {
        let source =
            CatalogDiscovery::new(instance.me().record(), &agent, LOOPBACK, Duration::from_millis(100)).unwrap();
        instance.add_discovery(source);
    };
    let mut a = start_peer(1, with_catalog).await;
    let mut b = start_peer(2, with_catalog).await;

    wait_for_peer(&a.registry, b.id()).await.unwrap();
    wait_for_peer(&b.registry, a.id()).await.unwrap();

    let seen = a.registry.get(b.id()).unwrap();
    assert_eq!(seen.public_cert, b.me.record().public_cert);
    assert!(seen.addresses.contains(&LOOPBACK));
    assert!(!a.registry.contains(a.id()), "a peer never registers itself");

    // Everything a needs to reach b came from the catalog.
    let sent = a.handler.send_text(b.id(), "hello").await.unwrap();
    let published = next_message(&mut a.streams.sent).await.unwrap();
    assert_eq!(published.id, sent.id);

    let got = next_message(&mut b.streams.received).await.unwrap();
    assert_eq!(got.text, "hello");
    assert_eq!(got.from.id, a.id());
    assert_eq!(got.id, sent.id);

    a.stop().await.unwrap();
    b.stop().await.unwrap();
    stop.cancel();
}
