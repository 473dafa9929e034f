//! Multi-node simulation.
//!
//! Every node of a [`SimCluster`] runs its own [`ServerDriver`] in the same
//! process. The nodes share one [`LocalBus`] and one durable storage, as a
//! deployment shares Redis and its database.

use std::{sync::Arc, time::Duration};

use concord_core::SessionRules;
use concord_proto::NodeId;
use concord_server::{
    DriverError, LocalBus, MemoryStorage, PropagatorStats, ServerConfig, ServerDriver, Storage,
};
use serde::Serialize;

use crate::{SimAuthenticator, SimEnv, TestClient, rules::CellClaimRules};

/// Node driver as run by the simulation.
pub type SimNode<S> = Arc<ServerDriver<SimEnv, S>>;

/// Observable per-node counters, for snapshot assertions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeSnapshot {
    /// Node id.
    pub node_id: u64,
    /// Live connections.
    pub connections: usize,
    /// Identities with at least one live connection.
    pub online: usize,
    /// Rooms hosted locally.
    pub rooms: usize,
    /// Bus messages published.
    pub published: u64,
    /// Remote messages applied.
    pub applied: u64,
    /// Version gaps recovered from storage.
    pub gaps: u64,
}

/// Several nodes on one bus.
pub struct SimCluster<S: Storage = MemoryStorage> {
    nodes: Vec<SimNode<S>>,
    bus: LocalBus,
    storage: S,
    auth: SimAuthenticator,
}

impl SimCluster<MemoryStorage> {
    /// `size` nodes over fresh in-memory storage, using [`CellClaimRules`].
    ///
    /// # Errors
    ///
    /// - `DriverError::Bus` if a node could not subscribe
    pub async fn new(seed: u64, size: usize) -> Result<Self, DriverError> {
        Self::build(seed, size, MemoryStorage::new(), ServerConfig::default(), Arc::new(CellClaimRules))
            .await
    }
}

impl<S: Storage> SimCluster<S> {
    /// `size` nodes over `storage`. Node `i` gets id `i + 1` and an
    /// environment seeded with `seed + i`.
    ///
    /// # Errors
    ///
    /// - `DriverError::Bus` if a node could not subscribe
    pub async fn build(
        seed: u64,
        size: usize,
        storage: S,
        config: ServerConfig,
        rules: Arc<dyn SessionRules>,
    ) -> Result<Self, DriverError> {
        let bus = LocalBus::default();
        let auth = SimAuthenticator::new();

        let mut nodes = Vec::with_capacity(size);
        for i in 0..size {
            let node_config = ServerConfig { node_id: Some(NodeId(i as u64 + 1)), ..config.clone() };
            let node = ServerDriver::clustered(
                SimEnv::with_seed(seed.wrapping_add(i as u64)),
                storage.clone(),
                node_config,
                Arc::new(auth.clone()),
                Arc::clone(&rules),
                Arc::new(bus.clone()),
            )
            .await?;
            nodes.push(node);
        }

        tracing::debug!(size, seed, "simulated cluster started");
        Ok(Self { nodes, bus, storage, auth })
    }

    /// Node `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn node(&self, index: usize) -> &SimNode<S> {
        &self.nodes[index]
    }

    /// All nodes.
    pub fn nodes(&self) -> &[SimNode<S>] {
        &self.nodes
    }

    /// Shared bus.
    pub fn bus(&self) -> &LocalBus {
        &self.bus
    }

    /// Shared durable storage.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Shared authenticator.
    pub fn auth(&self) -> &SimAuthenticator {
        &self.auth
    }

    /// Connect `credential` to node `index`.
    ///
    /// # Errors
    ///
    /// Whatever the node refuses the connection with.
    pub async fn connect(&self, index: usize, credential: &str) -> Result<TestClient, DriverError> {
        TestClient::connect(self.node(index), credential).await
    }

    /// Let bus traffic and batch windows drain.
    pub async fn settle(&self) {
        let window = self.nodes.first().map_or(Duration::ZERO, |node| node.config().batch_window);
        tokio::time::sleep(window * 2 + Duration::from_millis(10)).await;
    }

    /// Per-node counters.
    pub fn snapshot(&self) -> Vec<NodeSnapshot> {
        self.nodes
            .iter()
            .map(|node| {
                let stats = node.propagator().map(|p| p.stats()).unwrap_or_default();
                node_snapshot(node, stats)
            })
            .collect()
    }

    /// Shut every node down.
    pub fn shutdown(&self) {
        for node in &self.nodes {
            node.shutdown();
        }
    }
}

fn node_snapshot<S: Storage>(node: &SimNode<S>, stats: PropagatorStats) -> NodeSnapshot {
    NodeSnapshot {
        node_id: node.node_id().0,
        connections: node.registry().connection_count(),
        online: node.registry().online_count(),
        rooms: node.rooms().room_count(),
        published: stats.published,
        applied: stats.applied,
        gaps: stats.gaps,
    }
}
