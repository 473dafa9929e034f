//! Cross-node propagation: broadcasts, room lifecycle and state transitions
//! reach connections on every node.

use std::time::Duration;

use bytes::Bytes;
use concord_core::{Proposal, StateRecord};
use concord_harness::{SimAuthenticator, SimCluster, TestClient};
use concord_proto::{
    IdentityId, NodeId, Payload, RoomId, RoomKind, SessionId, payloads::room::Event,
};
use concord_server::{BusBody, BusMessage, Storage};

async fn joined(client: &mut TestClient, room: &RoomId, kind: RoomKind) {
    client.join(room, kind).await.unwrap();
    client.expect(|p| matches!(p, Payload::Joined(j) if &j.room == room)).await.unwrap();
}

fn proposal(session: &SessionId, base_version: u64) -> Proposal {
    Proposal {
        session_id: session.clone(),
        room: RoomId::game(session),
        identity: IdentityId(1),
        base_version,
        payload: Bytes::from(vec![base_version as u8 + 1]),
    }
}

#[tokio::test(start_paused = true)]
async fn batched_events_are_coalesced_on_the_remote_node() {
    let cluster = SimCluster::new(10, 2).await.unwrap();
    let lobby = RoomId::lobby("casual");

    let mut alice = cluster.connect(0, &SimAuthenticator::player(1)).await.unwrap();
    let mut bob = cluster.connect(1, &SimAuthenticator::player(2)).await.unwrap();
    joined(&mut alice, &lobby, RoomKind::Lobby).await;
    joined(&mut bob, &lobby, RoomKind::Lobby).await;

    for text in ["hi", "gg", "brb"] {
        alice.publish(&lobby, Event::batched("chat", text.as_bytes().to_vec()), true).await.unwrap();
    }
    alice.publish(&lobby, Event::batched("typing", Bytes::new()), true).await.unwrap();

    let batch = bob.expect(|p| matches!(p, Payload::Batch(_))).await.unwrap();
    let Payload::Batch(batch) = batch else { unreachable!() };
    assert_eq!(batch.room, Some(lobby.clone()));
    assert_eq!(batch.event_count(), 4);
    assert_eq!(
        batch.groups["chat"],
        vec![Bytes::from_static(b"hi"), Bytes::from_static(b"gg"), Bytes::from_static(b"brb")]
    );
    assert_eq!(batch.groups["typing"].len(), 1);

    // The sender excluded itself
    let own = alice.drain_for(Duration::from_millis(200)).await;
    assert!(own.iter().all(|p| !matches!(p, Payload::Batch(_))), "{own:?}");
}

#[tokio::test(start_paused = true)]
async fn critical_events_skip_the_batch_window() {
    let cluster = SimCluster::new(11, 3).await.unwrap();
    let room = RoomId::tournament("spring");

    let mut host = cluster.connect(0, &SimAuthenticator::player(1)).await.unwrap();
    let mut far = cluster.connect(2, &SimAuthenticator::player(3)).await.unwrap();
    joined(&mut host, &room, RoomKind::Tournament).await;
    joined(&mut far, &room, RoomKind::Tournament).await;

    host.publish(&room, Event::critical("game_over", b"p1".to_vec()), false).await.unwrap();

    let window = cluster.node(0).config().batch_window;
    let delivered = far
        .expect_within(window / 2, |p| matches!(p, Payload::Deliver(_)))
        .await
        .expect("critical event must not wait for the batch window");
    let Payload::Deliver(deliver) = delivered else { unreachable!() };
    assert_eq!(deliver.room, Some(room));
    assert_eq!(deliver.event.event_type, "game_over");
}

#[tokio::test(start_paused = true)]
async fn room_closure_fires_once_and_propagates() {
    let cluster = SimCluster::new(12, 2).await.unwrap();
    let session = SessionId::new("g1");
    let room = RoomId::game(&session);

    let mut admin = cluster.connect(1, &SimAuthenticator::admin(99)).await.unwrap();
    joined(&mut admin, &RoomId::admin(), RoomKind::Admin).await;

    let mut alice = cluster.connect(0, &SimAuthenticator::player(1)).await.unwrap();
    let mut bob = cluster.connect(0, &SimAuthenticator::player(2)).await.unwrap();
    joined(&mut alice, &room, RoomKind::Game).await;
    joined(&mut bob, &room, RoomKind::Game).await;
    cluster.settle().await;
    assert!(cluster.node(1).rooms().room_exists(&room), "creation must propagate");
    assert!(!cluster.node(1).rooms().is_local(&room));

    alice.leave(&room).await.unwrap();
    cluster.settle().await;
    assert!(cluster.node(0).rooms().is_local(&room), "one member left");

    bob.leave(&room).await.unwrap();
    cluster.settle().await;

    assert!(!cluster.node(0).rooms().room_exists(&room));
    assert!(!cluster.node(1).rooms().room_exists(&room));

    admin.drain_for(Duration::from_millis(100)).await;
    let closures: Vec<_> = admin
        .received()
        .iter()
        .filter(|p| matches!(p, Payload::RoomClosed(c) if c.room == room))
        .collect();
    assert_eq!(closures.len(), 1, "{closures:?}");
}

fn stored(session: &SessionId, version: u64) -> StateRecord {
    StateRecord {
        session_id: session.clone(),
        room: RoomId::game(session),
        version,
        payload: Bytes::from(vec![version as u8]),
        modified_by: IdentityId(9),
        modified_at_ms: 0,
    }
}

/// Versions of every `StateChanged` for `session` received within a settle.
async fn versions_seen(client: &mut TestClient, session: &SessionId) -> Vec<u64> {
    client.drain_for(Duration::from_millis(200)).await;
    client
        .received()
        .iter()
        .filter_map(|p| match p {
            Payload::StateChanged(s) if &s.session == session => Some(s.version),
            _ => None,
        })
        .collect()
}

fn closures_of(client: &TestClient, room: &RoomId) -> usize {
    client
        .received()
        .iter()
        .filter(|p| matches!(p, Payload::RoomClosed(c) if &c.room == room))
        .count()
}

#[tokio::test(start_paused = true)]
async fn room_spanning_two_nodes_closes_once_on_the_last_leave() {
    let cluster = SimCluster::new(17, 2).await.unwrap();
    let room = RoomId::game(&SessionId::new("g1"));

    let mut admin = cluster.connect(1, &SimAuthenticator::admin(99)).await.unwrap();
    joined(&mut admin, &RoomId::admin(), RoomKind::Admin).await;

    let mut alice = cluster.connect(0, &SimAuthenticator::player(1)).await.unwrap();
    let mut bob = cluster.connect(1, &SimAuthenticator::player(2)).await.unwrap();
    joined(&mut alice, &room, RoomKind::Game).await;
    cluster.settle().await;
    joined(&mut bob, &room, RoomKind::Game).await;
    cluster.settle().await;

    alice.leave(&room).await.unwrap();
    cluster.settle().await;

    admin.drain_for(Duration::from_millis(100)).await;
    assert_eq!(closures_of(&admin, &room), 0, "bob is still in the room");
    assert!(!cluster.node(0).rooms().is_local(&room));
    assert!(cluster.node(0).rooms().room_exists(&room), "still hosted on node 1");
    assert!(cluster.node(1).rooms().is_member(bob.id(), &room));

    bob.leave(&room).await.unwrap();
    cluster.settle().await;

    admin.drain_for(Duration::from_millis(100)).await;
    assert_eq!(closures_of(&admin, &room), 1);
    assert!(!cluster.node(0).rooms().room_exists(&room));
    assert!(!cluster.node(1).rooms().room_exists(&room));
}

#[tokio::test(start_paused = true)]
async fn simultaneous_last_leaves_still_report_one_close_per_node() {
    let cluster = SimCluster::new(20, 2).await.unwrap();
    let room = RoomId::game(&SessionId::new("g9"));

    let mut admins = Vec::new();
    for node in 0..2 {
        let mut admin = cluster.connect(node, &SimAuthenticator::admin(90 + node as u64)).await.unwrap();
        joined(&mut admin, &RoomId::admin(), RoomKind::Admin).await;
        admins.push(admin);
    }

    let mut alice = cluster.connect(0, &SimAuthenticator::player(1)).await.unwrap();
    let mut bob = cluster.connect(1, &SimAuthenticator::player(2)).await.unwrap();
    joined(&mut alice, &room, RoomKind::Game).await;
    joined(&mut bob, &room, RoomKind::Game).await;
    cluster.settle().await;

    // Neither node has heard of the other's leave when it processes its own
    alice.leave(&room).await.unwrap();
    bob.leave(&room).await.unwrap();
    cluster.settle().await;

    for admin in &mut admins {
        admin.drain_for(Duration::from_millis(100)).await;
        assert_eq!(closures_of(admin, &room), 1);
    }
    assert!(!cluster.node(0).rooms().room_exists(&room));
    assert!(!cluster.node(1).rooms().room_exists(&room));
}

#[tokio::test(start_paused = true)]
async fn local_commit_is_delivered_after_its_remote_predecessor() {
    let cluster = SimCluster::new(18, 2).await.unwrap();
    let session = SessionId::new("g2");
    let room = RoomId::game(&session);

    let mut near = cluster.connect(0, &SimAuthenticator::spectator(5)).await.unwrap();
    let mut far = cluster.connect(1, &SimAuthenticator::spectator(6)).await.unwrap();
    joined(&mut near, &room, RoomKind::Game).await;
    joined(&mut far, &room, RoomKind::Game).await;

    // Node 1 commits on top of version 1 before the bus delivers it there
    cluster.node(0).propose(proposal(&session, 0)).await.unwrap();
    cluster.node(1).propose(proposal(&session, 1)).await.unwrap();
    cluster.settle().await;

    assert_eq!(versions_seen(&mut near, &session).await, vec![1, 2]);
    assert_eq!(versions_seen(&mut far, &session).await, vec![1, 2]);
}

#[tokio::test(start_paused = true)]
async fn out_of_order_first_versions_are_filled_from_storage() {
    let cluster = SimCluster::new(19, 2).await.unwrap();
    let session = SessionId::new("g3");
    let room = RoomId::game(&session);

    let mut watcher = cluster.connect(1, &SimAuthenticator::spectator(5)).await.unwrap();
    joined(&mut watcher, &room, RoomKind::Game).await;
    cluster.settle().await;
    for version in 1..=3 {
        cluster.storage().save(&stored(&session, version)).await.unwrap();
    }

    // Two publishers; the bus does not order them against each other
    let propagator = cluster.node(1).propagator().unwrap();
    let discarded = propagator.stats().discarded;
    for (origin, version) in [(9, 3), (8, 2)] {
        let body = BusBody::State { record: stored(&session, version) };
        propagator.apply(BusMessage { origin: NodeId(origin), body }).await;
    }

    assert_eq!(versions_seen(&mut watcher, &session).await, vec![1, 2, 3]);
    assert_eq!(propagator.stats().gaps, 1);
    assert_eq!(propagator.stats().discarded, discarded + 1, "version 2 was already delivered");
}

#[tokio::test(start_paused = true)]
async fn resubscribe_delivers_versions_lost_with_the_bus() {
    let cluster = SimCluster::new(25, 2).await.unwrap();
    let session = SessionId::new("g5");
    let room = RoomId::game(&session);

    let mut watcher = cluster.connect(1, &SimAuthenticator::spectator(5)).await.unwrap();
    joined(&mut watcher, &room, RoomKind::Game).await;
    cluster.node(0).propose(proposal(&session, 0)).await.unwrap();
    cluster.settle().await;

    // Committed while the subscription was down: no bus message survives
    for version in 2..=3 {
        cluster.storage().save(&stored(&session, version)).await.unwrap();
    }
    cluster.bus().interrupt_subscriptions();
    cluster.settle().await;

    assert_eq!(versions_seen(&mut watcher, &session).await, vec![1, 2, 3]);
    assert_eq!(cluster.node(1).propagator().unwrap().stats().resubscribes, 1);
}

#[tokio::test(start_paused = true)]
async fn remote_node_observes_versions_in_order() {
    let cluster = SimCluster::new(13, 2).await.unwrap();
    let session = SessionId::new("g7");
    let room = RoomId::game(&session);

    let mut watcher = cluster.connect(1, &SimAuthenticator::spectator(5)).await.unwrap();
    joined(&mut watcher, &room, RoomKind::Game).await;

    for base in 0..6 {
        cluster.node(0).propose(proposal(&session, base)).await.unwrap();
    }

    let mut seen = Vec::new();
    while seen.len() < 6 {
        let Some(Payload::StateChanged(snapshot)) =
            watcher.expect(|p| matches!(p, Payload::StateChanged(_))).await
        else {
            break;
        };
        seen.push(snapshot.version);
    }
    assert_eq!(seen, vec![1, 2, 3, 4, 5, 6]);

    // The remote cache was refreshed from the bus, not from storage
    let cached = cluster.node(1).store().current(&session).await.unwrap().unwrap();
    assert_eq!(cached.version, 6);
    assert_eq!(cluster.node(1).propagator().unwrap().stats().gaps, 0);
}

#[tokio::test(start_paused = true)]
async fn version_gap_is_filled_from_storage() {
    let cluster = SimCluster::new(14, 2).await.unwrap();
    let session = SessionId::new("g8");
    let room = RoomId::game(&session);

    let mut watcher = cluster.connect(1, &SimAuthenticator::player(5)).await.unwrap();
    joined(&mut watcher, &room, RoomKind::Game).await;

    cluster.node(0).propose(proposal(&session, 0)).await.unwrap();
    cluster.settle().await;

    // Versions 2 and 3 land in storage without a bus message
    for version in 2..=3 {
        let record = StateRecord {
            session_id: session.clone(),
            room: room.clone(),
            version,
            payload: Bytes::from(vec![version as u8]),
            modified_by: IdentityId(9),
            modified_at_ms: 0,
        };
        cluster.storage().save(&record).await.unwrap();
    }
    cluster.node(0).propose(proposal(&session, 3)).await.unwrap();

    let mut seen = Vec::new();
    while seen.len() < 4 {
        let Some(Payload::StateChanged(snapshot)) =
            watcher.expect(|p| matches!(p, Payload::StateChanged(_))).await
        else {
            break;
        };
        seen.push(snapshot.version);
    }
    assert_eq!(seen, vec![1, 2, 3, 4]);
    assert_eq!(cluster.node(1).propagator().unwrap().stats().gaps, 1);
}

#[tokio::test(start_paused = true)]
async fn presence_reaches_every_node() {
    let cluster = SimCluster::new(15, 3).await.unwrap();
    let mut observer = cluster.connect(2, &SimAuthenticator::player(7)).await.unwrap();

    let alice = cluster.connect(0, &SimAuthenticator::player(1)).await.unwrap();
    let online = observer
        .expect(|p| matches!(p, Payload::Presence(pr) if pr.identity == IdentityId(1)))
        .await
        .unwrap();
    assert!(matches!(online, Payload::Presence(pr) if pr.online));

    alice.goodbye().await;
    let offline = observer
        .expect(|p| matches!(p, Payload::Presence(pr) if pr.identity == IdentityId(1)))
        .await
        .unwrap();
    assert!(matches!(offline, Payload::Presence(pr) if !pr.online));
}

#[tokio::test(start_paused = true)]
async fn cluster_counters_after_first_connection() {
    let cluster = SimCluster::new(16, 2).await.unwrap();
    let _alice = cluster.connect(0, &SimAuthenticator::player(1)).await.unwrap();
    cluster.settle().await;

    insta::assert_json_snapshot!(cluster.snapshot(), @r#"
    [
      {
        "node_id": 1,
        "connections": 1,
        "online": 1,
        "rooms": 1,
        "published": 1,
        "applied": 0,
        "gaps": 0
      },
      {
        "node_id": 2,
        "connections": 0,
        "online": 0,
        "rooms": 0,
        "published": 0,
        "applied": 1,
        "gaps": 0
      }
    ]
    "#);
}
