//! End-to-end: two or more nodes on an in-process discovery hub, linked over loopback TCP.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use nearby_node::{
    Config, ConnectionState, DeclineReason, DiscoveryInfo, Error, Event, EventStream,
    InvitationContext, InvitationId, InviteError, InviteOptions, MemoryHub, Medium, Node, PeerId,
    ResolveError, SendError, ValidationError,
};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn fast_config() -> Config {
    Config {
        transport_bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
        announce_interval_ms: 200,
        peer_timeout_ms: 1_000,
        tick_interval_ms: 20,
        ack_timeout_ms: 200,
        heartbeat_interval_ms: 200,
        link_timeout_ms: 2_000,
        connect_timeout_ms: 1_000,
        ..Config::default()
    }
}

async fn node(hub: &MemoryHub, name: &str) -> (Node, EventStream) {
    let node = Node::start_with_medium(fast_config(), name, Medium::Memory(hub.clone()))
        .await
        .unwrap();
    let events = node.subscribe().await.unwrap();
    (node, events)
}

/// Next event matching `pick`, skipping others.
async fn wait_for<T>(events: &mut EventStream, mut pick: impl FnMut(Event) -> Option<T>) -> T {
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event stream closed");
            if let Some(found) = pick(event) {
                return found;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn wait_found(events: &mut EventStream, peer: PeerId) -> DiscoveryInfo {
    wait_for(events, |e| match e {
        Event::PeerFound {
            peer: p,
            discovery_info,
        } if p.id == peer => Some(discovery_info),
        _ => None,
    })
    .await
}

async fn wait_invitation(events: &mut EventStream) -> (InvitationId, Option<InvitationContext>) {
    wait_for(events, |e| match e {
        Event::InvitationReceived {
            invitation_id,
            context,
            ..
        } => Some((invitation_id, context)),
        _ => None,
    })
    .await
}

async fn wait_state(events: &mut EventStream, peer: PeerId) -> ConnectionState {
    wait_for(events, |e| match e {
        Event::PeerStateChanged { peer: p, state } if p.id == peer => Some(state),
        _ => None,
    })
    .await
}

/// Alice advertises `chat` with `room=1`, Bob browses and finds her.
async fn advertise_and_browse(
    alice: &Node,
    bob: &Node,
    bob_events: &mut EventStream,
) -> DiscoveryInfo {
    alice
        .start_advertising(
            "chat",
            "Alice",
            DiscoveryInfo::from_pairs([("room", "1")]).unwrap(),
        )
        .await
        .unwrap();
    bob.start_browsing("chat").await.unwrap();
    wait_found(bob_events, alice.peer_id()).await
}

async fn connected_pair(hub: &MemoryHub) -> ((Node, EventStream), (Node, EventStream)) {
    let (alice, mut alice_events) = node(hub, "Alice").await;
    let (bob, mut bob_events) = node(hub, "Bob").await;
    advertise_and_browse(&alice, &bob, &mut bob_events).await;
    let pending = bob
        .invite(alice.peer_id(), InviteOptions::default())
        .await
        .unwrap();
    let (id, _) = wait_invitation(&mut alice_events).await;
    alice.resolve_invitation(id, true).await.unwrap();
    timeout(WAIT, pending.outcome()).await.unwrap().unwrap();
    ((alice, alice_events), (bob, bob_events))
}

#[tokio::test]
async fn chat_scenario() {
    let hub = MemoryHub::new();
    let (alice, mut alice_events) = node(&hub, "Alice").await;
    let (bob, mut bob_events) = node(&hub, "Bob").await;

    let info = advertise_and_browse(&alice, &bob, &mut bob_events).await;
    assert_eq!(info.get("room"), Some("1"));
    assert_eq!(info.len(), 1);

    let context = InvitationContext::new(br#"{"msg":"hi"}"#.to_vec()).unwrap();
    let pending = bob
        .invite(
            alice.peer_id(),
            InviteOptions {
                context: Some(context),
                ..InviteOptions::default()
            },
        )
        .await
        .unwrap();
    let (id, received) = wait_invitation(&mut alice_events).await;
    assert_eq!(received.unwrap().as_bytes(), br#"{"msg":"hi"}"#);
    alice.resolve_invitation(id, true).await.unwrap();
    timeout(WAIT, pending.outcome()).await.unwrap().unwrap();

    for (events, peer) in [
        (&mut alice_events, bob.peer_id()),
        (&mut bob_events, alice.peer_id()),
    ] {
        assert_eq!(wait_state(events, peer).await, ConnectionState::Connecting);
        assert_eq!(wait_state(events, peer).await, ConnectionState::Connected);
    }

    bob.send_text(alice.peer_id(), "ping").await.unwrap();
    let (from, text) = wait_for(&mut alice_events, |e| match e {
        Event::ReceivedText { peer, text } => Some((peer, text)),
        _ => None,
    })
    .await;
    assert_eq!(text, "ping");
    assert_eq!(from.display_name.as_str(), "Bob");

    let alice_view = alice.connected_peers().await.unwrap();
    assert_eq!(alice_view.len(), 1);
    assert_eq!(alice_view[0].id, bob.peer_id());
    let bob_view = bob.connected_peers().await.unwrap();
    assert_eq!(bob_view[0].discovery_info.get("room"), Some("1"));
}

#[tokio::test]
async fn invite_unknown_peer_fails_at_once() {
    let hub = MemoryHub::new();
    let (bob, _events) = node(&hub, "Bob").await;
    let stranger = PeerId::random();
    let err = bob
        .invite(stranger, InviteOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Invite(InviteError::PeerNotFound(p)) if p == stranger));
    assert!(bob.connected_peers().await.unwrap().is_empty());
}

#[tokio::test]
async fn unanswered_invite_times_out_and_late_resolve_expires() {
    let hub = MemoryHub::new();
    let (alice, mut alice_events) = node(&hub, "Alice").await;
    let (bob, mut bob_events) = node(&hub, "Bob").await;
    advertise_and_browse(&alice, &bob, &mut bob_events).await;

    let pending = bob
        .invite(
            alice.peer_id(),
            InviteOptions {
                timeout: Duration::from_millis(300),
                context: None,
            },
        )
        .await
        .unwrap();
    let (id, _) = wait_invitation(&mut alice_events).await;
    let err = timeout(WAIT, pending.outcome()).await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Invite(InviteError::InviteTimeout(p)) if p == alice.peer_id()));
    assert_eq!(wait_state(&mut bob_events, alice.peer_id()).await, ConnectionState::Connecting);
    assert_eq!(
        wait_state(&mut bob_events, alice.peer_id()).await,
        ConnectionState::NotConnected
    );

    // Past Alice's own deadline too.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let err = alice.resolve_invitation(id, true).await.unwrap_err();
    assert!(matches!(err, Error::Resolve(ResolveError::InvitationExpired(i)) if i == id));
    assert!(alice.connected_peers().await.unwrap().is_empty());
    let err = alice.resolve_invitation(id, false).await.unwrap_err();
    assert!(matches!(err, Error::Resolve(ResolveError::InvitationExpired(_))));
}

#[tokio::test]
async fn declined_invite() {
    let hub = MemoryHub::new();
    let (alice, mut alice_events) = node(&hub, "Alice").await;
    let (bob, mut bob_events) = node(&hub, "Bob").await;
    advertise_and_browse(&alice, &bob, &mut bob_events).await;

    let pending = bob
        .invite(alice.peer_id(), InviteOptions::default())
        .await
        .unwrap();
    let (id, _) = wait_invitation(&mut alice_events).await;
    alice.resolve_invitation(id, false).await.unwrap();
    let err = timeout(WAIT, pending.outcome()).await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        Error::Invite(InviteError::Declined(DeclineReason::Rejected))
    ));
    assert_eq!(wait_state(&mut bob_events, alice.peer_id()).await, ConnectionState::Connecting);
    assert_eq!(
        wait_state(&mut bob_events, alice.peer_id()).await,
        ConnectionState::NotConnected
    );
    let err = alice.resolve_invitation(id, true).await.unwrap_err();
    assert!(matches!(err, Error::Resolve(ResolveError::AlreadyResolved(_))));
}

#[tokio::test]
async fn second_invite_while_pending_is_refused() {
    let hub = MemoryHub::new();
    let (alice, mut alice_events) = node(&hub, "Alice").await;
    let (bob, mut bob_events) = node(&hub, "Bob").await;
    advertise_and_browse(&alice, &bob, &mut bob_events).await;

    let _pending = bob
        .invite(alice.peer_id(), InviteOptions::default())
        .await
        .unwrap();
    wait_invitation(&mut alice_events).await;
    let err = bob
        .invite(alice.peer_id(), InviteOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Invite(InviteError::AlreadyPending(_))));
}

#[tokio::test]
async fn huge_invite_timeout_keeps_node_running() {
    let hub = MemoryHub::new();
    let (alice, mut alice_events) = node(&hub, "Alice").await;
    let (bob, mut bob_events) = node(&hub, "Bob").await;
    advertise_and_browse(&alice, &bob, &mut bob_events).await;

    let pending = bob
        .invite(
            alice.peer_id(),
            InviteOptions {
                timeout: Duration::MAX,
                ..InviteOptions::default()
            },
        )
        .await
        .unwrap();
    let (id, _) = wait_invitation(&mut alice_events).await;
    alice.resolve_invitation(id, true).await.unwrap();
    timeout(WAIT, pending.outcome()).await.unwrap().unwrap();
    let connected = bob.connected_peers().await.unwrap();
    assert_eq!(connected.len(), 1);
    assert_eq!(connected[0].id, alice.peer_id());
}

#[tokio::test]
async fn largest_advertisement_is_found() {
    let hub = MemoryHub::new();
    let (alice, mut alice_events) = node(&hub, "Alice").await;
    let (bob, mut bob_events) = node(&hub, "Bob").await;

    // 133 three-byte pairs: the most pairs that fit the info limit.
    let pairs = (0..133u8).map(|i| {
        let key = format!("{}{}", (b'a' + i / 26) as char, (b'a' + i % 26) as char);
        (key, String::new())
    });
    let info = DiscoveryInfo::from_pairs(pairs).unwrap();
    let name = "x".repeat(63);
    alice
        .start_advertising("abcdefghijklmno", &name, info.clone())
        .await
        .unwrap();
    bob.start_browsing("abcdefghijklmno").await.unwrap();
    assert_eq!(wait_found(&mut bob_events, alice.peer_id()).await, info);
    assert!(alice_events.try_recv().is_none());
}

#[tokio::test]
async fn readvertising_reports_peer_again() {
    let hub = MemoryHub::new();
    let (alice, _alice_events) = node(&hub, "Alice").await;
    let (bob, mut bob_events) = node(&hub, "Bob").await;
    advertise_and_browse(&alice, &bob, &mut bob_events).await;

    alice
        .start_advertising(
            "chat",
            "Alice",
            DiscoveryInfo::from_pairs([("room", "2")]).unwrap(),
        )
        .await
        .unwrap();
    let info = wait_found(&mut bob_events, alice.peer_id()).await;
    assert_eq!(info.get("room"), Some("2"));
}

#[tokio::test]
async fn stop_advertising_reports_lost() {
    let hub = MemoryHub::new();
    let (alice, _alice_events) = node(&hub, "Alice").await;
    let (bob, mut bob_events) = node(&hub, "Bob").await;
    advertise_and_browse(&alice, &bob, &mut bob_events).await;

    alice.stop_advertising().await.unwrap();
    alice.stop_advertising().await.unwrap();
    let lost = wait_for(&mut bob_events, |e| match e {
        Event::PeerLost { peer } => Some(peer.id),
        _ => None,
    })
    .await;
    assert_eq!(lost, alice.peer_id());
    assert!(bob.discovered_peers().await.unwrap().is_empty());
}

#[tokio::test]
async fn sends_arrive_once_and_in_order() {
    let hub = MemoryHub::new();
    let ((alice, mut alice_events), (bob, _bob_events)) = connected_pair(&hub).await;
    let a = alice.peer_id();

    let (r1, r2, r3, r4) = tokio::join!(
        bob.send(a, b"one".to_vec()),
        bob.send(a, b"two".to_vec()),
        bob.send(a, b"three".to_vec()),
        bob.send_text(a, "hello"),
    );
    for r in [r1, r2, r3, r4] {
        r.unwrap();
    }

    let mut got: Vec<Vec<u8>> = Vec::new();
    while got.len() < 4 {
        let data = wait_for(&mut alice_events, |e| match e {
            Event::ReceivedData { data, .. } => Some(data),
            Event::ReceivedText { text, .. } => Some(text.into_bytes()),
            _ => None,
        })
        .await;
        got.push(data);
    }
    assert_eq!(
        got,
        vec![
            b"one".to_vec(),
            b"two".to_vec(),
            b"three".to_vec(),
            b"hello".to_vec()
        ]
    );
    tokio::time::sleep(Duration::from_millis(300)).await;
    while let Some(e) = alice_events.try_recv() {
        assert!(!matches!(e, Event::ReceivedData { .. } | Event::ReceivedText { .. }));
    }
}

#[tokio::test]
async fn send_to_unconnected_peer_fails() {
    let hub = MemoryHub::new();
    let (alice, _alice_events) = node(&hub, "Alice").await;
    let (bob, mut bob_events) = node(&hub, "Bob").await;
    advertise_and_browse(&alice, &bob, &mut bob_events).await;
    let err = bob.send_text(alice.peer_id(), "hello").await.unwrap_err();
    assert!(matches!(err, Error::Send(SendError::NotConnected(_))));
}

#[tokio::test]
async fn disconnect_reports_each_peer_once() {
    let hub = MemoryHub::new();
    let ((alice, mut alice_events), (bob, mut bob_events)) = connected_pair(&hub).await;

    bob.disconnect().await.unwrap();
    assert!(bob.connected_peers().await.unwrap().is_empty());
    assert_eq!(
        wait_for(&mut alice_events, |e| match e {
            Event::PeerStateChanged { state: ConnectionState::NotConnected, peer } => Some(peer.id),
            _ => None,
        })
        .await,
        bob.peer_id()
    );
    assert!(alice.connected_peers().await.unwrap().is_empty());

    bob.disconnect().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let mut not_connected = 0;
    while let Some(e) = bob_events.try_recv() {
        if matches!(
            e,
            Event::PeerStateChanged {
                state: ConnectionState::NotConnected,
                ..
            }
        ) {
            not_connected += 1;
        }
    }
    assert_eq!(not_connected, 1);
}

#[tokio::test]
async fn reconnect_after_disconnect() {
    let hub = MemoryHub::new();
    let ((alice, mut alice_events), (bob, _bob_events)) = connected_pair(&hub).await;
    bob.disconnect().await.unwrap();
    wait_for(&mut alice_events, |e| match e {
        Event::PeerStateChanged {
            state: ConnectionState::NotConnected,
            ..
        } => Some(()),
        _ => None,
    })
    .await;

    let pending = bob
        .invite(alice.peer_id(), InviteOptions::default())
        .await
        .unwrap();
    let (id, _) = wait_invitation(&mut alice_events).await;
    alice.resolve_invitation(id, true).await.unwrap();
    timeout(WAIT, pending.outcome()).await.unwrap().unwrap();
    bob.send_text(alice.peer_id(), "again").await.unwrap();
}

#[tokio::test]
async fn bad_multicast_group_reports_errors() {
    let config = Config {
        multicast_group: Ipv4Addr::new(10, 0, 0, 1),
        transport_bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
        ..Config::default()
    };
    let node = Node::start(config, "Alice").await.unwrap();
    let mut events = node.subscribe().await.unwrap();

    node.start_advertising("chat", "Alice", DiscoveryInfo::new())
        .await
        .unwrap();
    wait_for(&mut events, |e| match e {
        Event::AdvertiseError { reason } => Some(reason),
        _ => None,
    })
    .await;
    node.start_browsing("chat").await.unwrap();
    wait_for(&mut events, |e| match e {
        Event::BrowseError { reason } => Some(reason),
        _ => None,
    })
    .await;
}

#[tokio::test]
async fn invalid_arguments_rejected_at_the_boundary() {
    let hub = MemoryHub::new();
    assert!(matches!(
        Node::start_with_medium(fast_config(), "", Medium::Memory(hub.clone())).await,
        Err(Error::Validation(ValidationError::DisplayNameEmpty))
    ));
    let (node, _events) = node(&hub, "Alice").await;
    assert!(matches!(
        node.start_advertising("Bad_Type", "Alice", DiscoveryInfo::new())
            .await,
        Err(Error::Validation(_))
    ));
    assert!(matches!(
        node.start_browsing("").await,
        Err(Error::Validation(_))
    ));
}

#[tokio::test]
async fn shutdown_stops_the_node() {
    let hub = MemoryHub::new();
    let ((alice, mut alice_events), (bob, _bob_events)) = connected_pair(&hub).await;
    bob.shutdown().await.unwrap();
    let left = wait_for(&mut alice_events, |e| match e {
        Event::PeerStateChanged {
            state: ConnectionState::NotConnected,
            peer,
        } => Some(peer.id),
        _ => None,
    })
    .await;
    assert_eq!(left, bob.peer_id());
    assert!(matches!(bob.connected_peers().await, Err(Error::Shutdown)));
    assert!(alice.connected_peers().await.unwrap().is_empty());
}
