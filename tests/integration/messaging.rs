use crate::*;

use murmur_transport::SendError;

// ── Delivery ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn message_reaches_introduced_peer() {
    let mut a = start_peer(10, |_| {}).await;
    let mut b = start_peer(11, |_| {}).await;
    introduce(&a, &b);

    let sent = a.handler.send_text(b.id(), "hello").await.unwrap();
    assert_eq!(sent.to.id, b.id());
    assert_eq!(sent.from.id, a.id());

    let published = next_message(&mut a.streams.sent).await.unwrap();
    assert_eq!(published.id, sent.id);

    let got = next_message(&mut b.streams.received).await.unwrap();
    assert_eq!(got.id, sent.id);
    assert_eq!(got.text, "hello");
    assert_eq!(got.from.id, a.id());
    assert_eq!(got.from.name, a.me.record().name);
    assert_eq!(got.to.id, b.id());

    // The greet taught b about a.
    assert!(b.registry.contains(a.id()));
    assert!(a.handler.is_connected(b.id()).await);

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

#[tokio::test]
async fn reply_reuses_inbound_stream() {
    let mut a = start_peer(12, |_| {}).await;
    let mut b = start_peer(13, |_| {}).await;
    introduce(&a, &b);

    a.handler.send_text(b.id(), "ping").await.unwrap();
    next_message(&mut b.streams.received).await.unwrap();

    let reply = b.handler.send_text(a.id(), "pong").await.unwrap();
    let got = next_message(&mut a.streams.received).await.unwrap();
    assert_eq!(got.id, reply.id);
    assert_eq!(got.text, "pong");
    assert_eq!(b.handler.stats().dialed, 0, "b answers on the stream a opened");

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

#[tokio::test]
async fn messages_to_self_loop_back() {
    let mut a = start_peer(14, |_| {}).await;
    a.me.record().addresses.add(LOOPBACK);

    let sent = a.handler.send_text(a.id(), "note to self").await.unwrap();
    let published = next_message(&mut a.streams.sent).await.unwrap();
    assert_eq!(published.id, sent.id);
    let got = next_message(&mut a.streams.received).await.unwrap();
    assert_eq!(got.id, sent.id);
    assert_eq!(got.text, "note to self");
    assert_eq!(got.from.id, a.id());
    assert_eq!(got.to.id, a.id());
    assert!(!a.registry.contains(a.id()));

    a.stop().await.unwrap();
}

#[tokio::test]
async fn concurrent_sends_share_one_dial() {
    let a = start_peer(15, |_| {}).await;
    let mut b = start_peer(16, |_| {}).await;
    introduce(&a, &b);

    let (first, second) = tokio::join!(
        a.handler.send_text(b.id(), "one"),
        a.handler.send_text(b.id(), "two"),
    );
    let (first, second) = (first.unwrap(), second.unwrap());

    let mut ids = vec![
        next_message(&mut b.streams.received).await.unwrap().id,
        next_message(&mut b.streams.received).await.unwrap().id,
    ];
    ids.sort();
    let mut expected = vec![first.id, second.id];
    expected.sort();
    assert_eq!(ids, expected);

    assert_eq!(a.handler.stats().dialed, 1);
    assert_eq!(a.handler.stats().greeted, 1);
    assert_eq!(b.handler.stats().accepted, 1);

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

// ── Failures ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn unknown_peer_is_rejected() {
    let mut a = start_peer(17, |_| {}).await;

    let err = a.handler.send_text("nobody", "hi").await.unwrap_err();
    assert!(matches!(err, SendError::UnknownPeer(ref id) if id == "nobody"));
    assert!(a.streams.sent.try_recv().is_err(), "failed sends are not published");

    a.stop().await.unwrap();
}

#[tokio::test]
async fn stopped_peer_fails_delivery() {
    let mut a = start_peer(18, |_| {}).await;
    let b = start_peer(19, |_| {}).await;
    introduce(&a, &b);
    let b_id = b.id().to_string();
    b.stop().await.unwrap();

    let err = a.handler.send_text(&b_id, "anyone there?").await.unwrap_err();
    assert!(matches!(err, SendError::Delivery { ref peer, .. } if *peer == b_id));
    assert!(a.streams.sent.try_recv().is_err());

    a.stop().await.unwrap();
}

#[tokio::test]
async fn pinned_certificate_mismatch_fails_delivery() {
    let mut a = start_peer(20, |_| {}).await;
    let mut b = start_peer(21, |_| {}).await;
    let c = start_peer(22, |_| {}).await;

    // a believes b's id carries c's certificate.
    let forged = murmur_core::PeerRecord::new(
        b.id().to_string(),
        b.me.record().name.clone(),
        b.me.record().ports,
        c.me.record().public_cert.clone(),
    );
    forged.addresses.add(LOOPBACK);
    a.registry.add(Arc::new(forged));

    let err = a.handler.send_text(b.id(), "hi").await.unwrap_err();
    assert!(matches!(err, SendError::Delivery { .. }));
    assert!(!a.handler.is_connected(b.id()).await);
    assert!(a.streams.sent.try_recv().is_err());
    assert!(b.streams.received.try_recv().is_err());

    a.stop().await.unwrap();
    b.stop().await.unwrap();
    c.stop().await.unwrap();
}

#[tokio::test]
async fn unparseable_certificate_is_a_certificate_error() {
    let mut a = start_peer(23, |_| {}).await;
    let mut b = start_peer(24, |_| {}).await;

    // The stored record wins over what the greet reports, so the garbage
    // certificate is what a tries to pin.
    let broken = murmur_core::PeerRecord::new(
        b.id().to_string(),
        b.me.record().name.clone(),
        b.me.record().ports,
        "-----BEGIN GARBAGE-----\nnot a certificate\n-----END GARBAGE-----\n".to_string(),
    );
    broken.addresses.add(LOOPBACK);
    a.registry.add(Arc::new(broken));

    let err = a.handler.send_text(b.id(), "hi").await.unwrap_err();
    assert!(
        matches!(err, SendError::Certificate { ref peer, .. } if peer == b.id()),
        "expected a certificate error, got {err:?}"
    );
    assert_eq!(a.handler.stats().dialed, 0);
    assert!(a.streams.sent.try_recv().is_err());
    assert!(b.streams.received.try_recv().is_err());

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}
