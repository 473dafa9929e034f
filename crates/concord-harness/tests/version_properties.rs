//! Property-based tests for version uniqueness and ordering.
//!
//! Rounds of proposals race across three nodes sharing one store. Whatever
//! the interleaving, accepted versions are unique and gap-free, and every
//! node observes them in increasing order.

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use bytes::Bytes;
use concord_core::{Proposal, SessionRules, StrictRules};
use concord_harness::{CellClaimRules, SimAuthenticator, SimCluster};
use concord_proto::{IdentityId, Payload, RoomId, RoomKind, SessionId};
use concord_server::{MemoryStorage, ServerConfig, Storage};
use proptest::prelude::*;

const NODES: usize = 3;

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .unwrap()
        .block_on(future)
}

struct Outcome {
    accepted: Vec<u64>,
    head: u64,
    stored: Vec<u64>,
    observed: Vec<Vec<u64>>,
}

/// Each round's proposals are issued concurrently with a base `lag` versions
/// behind the durable head.
async fn race(seed: u64, rounds: Vec<Vec<(usize, u64)>>, claim_cells: bool) -> Outcome {
    let rules: Arc<dyn SessionRules> =
        if claim_cells { Arc::new(CellClaimRules) } else { Arc::new(StrictRules) };
    let cluster = SimCluster::build(seed, NODES, MemoryStorage::new(), ServerConfig::default(), rules)
        .await
        .unwrap();
    let session = SessionId::new("g1");
    let room = RoomId::game(&session);

    let mut watchers = Vec::new();
    for node in 0..NODES {
        let mut watcher =
            cluster.connect(node, &SimAuthenticator::spectator(100 + node as u64)).await.unwrap();
        watcher.join(&room, RoomKind::Game).await.unwrap();
        watcher.expect(|p| matches!(p, Payload::Joined(_))).await.unwrap();
        watchers.push(watcher);
    }

    let mut accepted = Vec::new();
    let mut seat = 0u8;
    for round in rounds {
        let head = cluster.storage().load(&session).await.unwrap().map_or(0, |r| r.version);
        let mut tasks = Vec::new();
        for (node, lag) in round {
            seat = seat.wrapping_add(1).max(1);
            let payload = if claim_cells {
                CellClaimRules::claim(&CellClaimRules::board(64), seat as usize % 64, seat)
            } else {
                Bytes::from(vec![seat])
            };
            let proposal = Proposal {
                session_id: session.clone(),
                room: room.clone(),
                identity: IdentityId(node as u64 + 1),
                base_version: head.saturating_sub(lag),
                payload,
            };
            let driver = Arc::clone(cluster.node(node));
            tasks.push(tokio::spawn(async move { driver.propose(proposal).await }));
        }
        for task in tasks {
            if let Ok(Ok(done)) = task.await {
                accepted.push(done.record.version);
            }
        }
    }
    cluster.settle().await;

    let history = cluster.storage().load_since(&session, 0, usize::MAX).await.unwrap();
    let head = history.last().map_or(0, |r| r.version);

    let mut observed = Vec::new();
    for watcher in &mut watchers {
        watcher.drain_for(Duration::from_millis(100)).await;
        observed.push(
            watcher
                .received()
                .iter()
                .filter_map(|p| match p {
                    Payload::StateChanged(snapshot) => Some(snapshot.version),
                    _ => None,
                })
                .collect(),
        );
    }

    Outcome { accepted, head, stored: history.iter().map(|r| r.version).collect(), observed }
}

fn rounds_strategy() -> impl Strategy<Value = Vec<Vec<(usize, u64)>>> {
    prop::collection::vec(prop::collection::vec((0..NODES, 0u64..3), 1..5), 1..6)
}

fn check(outcome: &Outcome) -> Result<(), TestCaseError> {
    let unique: BTreeSet<u64> = outcome.accepted.iter().copied().collect();
    prop_assert_eq!(unique.len(), outcome.accepted.len(), "duplicate version accepted");
    prop_assert_eq!(unique.len() as u64, outcome.head);

    let expected: Vec<u64> = (1..=outcome.head).collect();
    prop_assert_eq!(&outcome.stored, &expected);

    for versions in &outcome.observed {
        prop_assert!(versions.windows(2).all(|w| w[0] < w[1]), "out of order: {versions:?}");
        prop_assert!(versions.last().is_none_or(|v| *v == outcome.head));
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Property: no two accepted proposals share a version
    #[test]
    fn prop_versions_unique_under_strict_rules(seed in any::<u64>(), rounds in rounds_strategy()) {
        let outcome = block_on(race(seed, rounds, false));
        check(&outcome)?;
    }

    /// Property: re-derived proposals still commit unique, gap-free versions
    #[test]
    fn prop_versions_unique_with_rederivation(seed in any::<u64>(), rounds in rounds_strategy()) {
        let outcome = block_on(race(seed, rounds, true));
        check(&outcome)?;
    }

    /// Property: the first proposal on a fresh session always lands as version 1
    #[test]
    fn prop_first_write_is_version_one(seed in any::<u64>(), node in 0..NODES) {
        let outcome = block_on(race(seed, vec![vec![(node, 0)]], false));
        prop_assert_eq!(outcome.accepted, vec![1]);
        prop_assert_eq!(outcome.head, 1);
    }
}
