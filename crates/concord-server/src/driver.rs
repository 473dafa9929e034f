//! Server driver.
//!
//! Owns and wires every synchronization component: the connection registry,
//! room manager, state store and conflict resolver, broadcast router,
//! continuity manager and, on clustered nodes, the cross-node propagator.
//! Transports talk to the driver only:
//!
//! - [`ServerDriver::accept`] turns a credential into a [`ConnectionHandle`]
//! - every client payload goes through [`ServerDriver::handle_payload`],
//!   called by the connection's worker
//! - [`ServerDriver::disconnect`] tears a connection down, closing emptied
//!   ephemeral rooms and capturing continuity on the identity's last
//!   connection
//! - [`ServerDriver::tick`] runs periodic maintenance

use std::{collections::HashMap, sync::Arc};

use concord_core::{Environment, Proposal, SessionRules, StateRecord, SyncError};
use concord_proto::{
    ConnectionId, IdentityId, NodeId, Payload, Persistence, Role, RoomId, RoomKind, SessionId,
    payloads::{
        room::{CreateRoom, JoinRoom, Joined, Publish},
        session::HelloReply,
        state::{
            CatchUp, ContinuityRestored, FetchState, ProposalOutcome, ProposalResult, Propose,
            RejectReason,
        },
    },
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    auth::{AuthError, Authenticator, VerifiedIdentity},
    bus::Bus,
    config::ServerConfig,
    continuity::{CatchUpPlan, ContinuityManager},
    guard::ResilienceGuard,
    propagator::{BusBody, Propagator, TOPIC_PREFIX},
    registry::ConnectionRegistry,
    resolver::{Accepted, ConflictResolver},
    room_manager::{JoinOutcome, LeaveOutcome, RoomManager},
    router::BroadcastRouter,
    server_error::DriverError,
    state_feed::{Classified, StateFeed},
    state_store::StateStore,
    storage::Storage,
    worker::{self, ConnectionHandle},
};

/// What the worker does after a payload was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep reading commands.
    Continue,
    /// The client said goodbye.
    Goodbye,
    /// The connection was already torn down (evicted or disconnected).
    Gone,
}

/// Counts from one maintenance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Idle connections evicted.
    pub evicted: usize,
    /// Expired continuity snapshots dropped.
    pub snapshots_expired: usize,
    /// Expired cache entries purged.
    pub cache_purged: usize,
}

/// Synchronization node.
pub struct ServerDriver<E: Environment, S: Storage> {
    env: E,
    config: ServerConfig,
    node_id: NodeId,
    auth: Arc<dyn Authenticator>,
    auth_guard: ResilienceGuard<E>,
    registry: Arc<ConnectionRegistry<E>>,
    rooms: Arc<RoomManager<E>>,
    store: Arc<StateStore<E, S>>,
    resolver: ConflictResolver<E, S>,
    router: Arc<BroadcastRouter<E>>,
    continuity: ContinuityManager<E>,
    feed: Arc<StateFeed<E, S>>,
    propagator: Option<Arc<Propagator<E, S>>>,
    shutdown: CancellationToken,
}

impl<E: Environment, S: Storage> ServerDriver<E, S> {
    /// Create a standalone node.
    pub fn new(
        env: E,
        storage: S,
        config: ServerConfig,
        auth: Arc<dyn Authenticator>,
        rules: Arc<dyn SessionRules>,
    ) -> Arc<Self> {
        Arc::new(Self::assemble(env, storage, config, auth, rules, None))
    }

    /// Create a node that propagates through `bus`.
    ///
    /// Subscribes before returning, so nothing published by other nodes after
    /// this call is missed, then starts the publisher and subscriber tasks.
    ///
    /// # Errors
    ///
    /// - `DriverError::Bus` if the subscription could not be opened
    pub async fn clustered(
        env: E,
        storage: S,
        config: ServerConfig,
        auth: Arc<dyn Authenticator>,
        rules: Arc<dyn SessionRules>,
        bus: Arc<dyn Bus>,
    ) -> Result<Arc<Self>, DriverError> {
        let subscription = bus.subscribe(TOPIC_PREFIX).await?;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let driver = Arc::new(Self::assemble(
            env,
            storage,
            config,
            auth,
            rules,
            Some((bus, outbound_tx)),
        ));

        if let Some(propagator) = &driver.propagator {
            tokio::spawn(
                Arc::clone(propagator).run_publisher(outbound_rx, driver.shutdown.child_token()),
            );
            tokio::spawn(
                Arc::clone(propagator).run_subscriber(subscription, driver.shutdown.child_token()),
            );
        }

        tracing::info!(node_id = %driver.node_id, "clustered node started");
        Ok(driver)
    }

    fn assemble(
        env: E,
        storage: S,
        config: ServerConfig,
        auth: Arc<dyn Authenticator>,
        rules: Arc<dyn SessionRules>,
        bus: Option<(Arc<dyn Bus>, mpsc::UnboundedSender<BusBody>)>,
    ) -> Self {
        let node_id = config.node_id.unwrap_or_else(|| NodeId(env.random_u64()));
        let shutdown = CancellationToken::new();

        let registry = Arc::new(ConnectionRegistry::new(env.clone(), config.connection.clone()));
        let rooms = Arc::new(RoomManager::new(env.clone()));
        let store = Arc::new(StateStore::new(
            env.clone(),
            storage,
            config.cache_ttl,
            config.breaker.clone(),
        ));
        let resolver =
            ConflictResolver::new(env.clone(), Arc::clone(&store), rules, config.lock_timeout);

        let (bus, outbound) = match bus {
            Some((bus, outbound)) => (Some(bus), Some(outbound)),
            None => (None, None),
        };
        let router = Arc::new(BroadcastRouter::new(
            env.clone(),
            Arc::clone(&registry),
            Arc::clone(&rooms),
            config.batch_window,
            shutdown.child_token(),
            outbound,
        ));
        let feed = Arc::new(StateFeed::new(
            Arc::clone(&store),
            Arc::clone(&router),
            config.catch_up_threshold,
        ));

        let propagator = bus.map(|bus| {
            Arc::new(Propagator::new(
                env.clone(),
                node_id,
                bus,
                config.breaker.clone(),
                Arc::clone(&router),
                Arc::clone(&rooms),
                Arc::clone(&feed),
            ))
        });

        Self {
            auth_guard: ResilienceGuard::new("auth", env.clone(), config.breaker.clone()),
            continuity: ContinuityManager::new(
                env.clone(),
                config.grace_window,
                config.catch_up_threshold,
            ),
            env,
            config,
            node_id,
            auth,
            registry,
            rooms,
            store,
            resolver,
            router,
            feed,
            propagator,
            shutdown,
        }
    }

    /// This node's id.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Active configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry<E>> {
        &self.registry
    }

    /// Room manager.
    pub fn rooms(&self) -> &Arc<RoomManager<E>> {
        &self.rooms
    }

    /// State store.
    pub fn store(&self) -> &Arc<StateStore<E, S>> {
        &self.store
    }

    /// Broadcast router.
    pub fn router(&self) -> &Arc<BroadcastRouter<E>> {
        &self.router
    }

    /// Continuity manager.
    pub fn continuity(&self) -> &ContinuityManager<E> {
        &self.continuity
    }

    /// Ordered state delivery.
    pub fn feed(&self) -> &Arc<StateFeed<E, S>> {
        &self.feed
    }

    /// Propagator, on clustered nodes.
    pub fn propagator(&self) -> Option<&Arc<Propagator<E, S>>> {
        self.propagator.as_ref()
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Authenticate `credential` and open a connection for it.
    ///
    /// On success the client has been sent `HelloReply`, joined its identity
    /// room and, if a continuity snapshot was live, rejoined its previous
    /// rooms and received one `CatchUp` per session followed by
    /// `ContinuityRestored`.
    ///
    /// # Errors
    ///
    /// - `DriverError::ShuttingDown` after [`Self::shutdown`]
    /// - `DriverError::Sync(IdentityUnauthenticated)` if the credential is
    ///   rejected
    /// - `DriverError::Sync(DependencyUnavailable)` if the authenticator is
    ///   failing
    /// - `DriverError::ConnectionLimit` if the node is full
    pub async fn accept(self: &Arc<Self>, credential: &str) -> Result<ConnectionHandle, DriverError> {
        if self.shutdown.is_cancelled() {
            return Err(DriverError::ShuttingDown);
        }

        let VerifiedIdentity { identity, role } = self.authenticate(credential).await?;

        if self.registry.connection_count() >= self.config.max_connections {
            tracing::warn!(
                identity = %identity,
                max = self.config.max_connections,
                "connection limit reached"
            );
            return Err(DriverError::ConnectionLimit(self.config.max_connections));
        }

        let registration = self.registry.register(Some(identity), role)?;
        let connection = registration.connection_id;

        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.outbound_queue);
        self.router.attach(connection, outbound_tx);

        let snapshot = self.continuity.take(identity);
        self.router.send_direct(
            connection,
            Payload::HelloReply(HelloReply {
                connection_id: connection,
                identity,
                resuming: snapshot.is_some(),
            }),
        );

        if registration.first_for_identity {
            self.router.send_presence(identity, true);
        }
        self.join_room(connection, &RoomId::identity(identity), RoomKind::Identity);

        let resuming = snapshot.is_some();
        if let Some(snapshot) = snapshot {
            self.restore(connection, identity, snapshot.rooms, snapshot.pointers).await;
        }

        let (commands_tx, commands_rx) = mpsc::channel(self.config.command_queue);
        let worker = worker::spawn(Arc::clone(self), connection, commands_rx);

        tracing::debug!(connection_id = %connection, identity = %identity, ?role, resuming, "accepted");
        Ok(ConnectionHandle::new(connection, identity, resuming, commands_tx, outbound_rx, worker))
    }

    async fn authenticate(&self, credential: &str) -> Result<VerifiedIdentity, DriverError> {
        let recovery = self.config.breaker.recovery_timeout;
        self.auth_guard.call(|| self.auth.authenticate(credential)).await.map_err(|e| {
            let err = e.into_sync_error(|inner| match inner {
                AuthError::Unauthenticated => SyncError::IdentityUnauthenticated,
                AuthError::Unavailable(reason) => {
                    tracing::error!(reason = %reason, "authenticator failed");
                    SyncError::DependencyUnavailable {
                        dependency: "auth".to_owned(),
                        retry_after: recovery,
                    }
                },
            });
            DriverError::Sync(err)
        })
    }

    async fn restore(
        &self,
        connection: ConnectionId,
        identity: IdentityId,
        rooms: Vec<(RoomId, RoomKind)>,
        mut pointers: HashMap<SessionId, u64>,
    ) {
        let mut rejoined = Vec::with_capacity(rooms.len());
        for (room, kind) in rooms {
            self.join_room(connection, &room, kind);
            // Sessions the room carried that this identity never saw
            for session in self.feed.sessions_in(&room) {
                pointers.entry(session).or_insert(0);
            }
            rejoined.push(room);
        }

        let mut pointers: Vec<(SessionId, u64)> = pointers.into_iter().collect();
        pointers.sort_unstable();

        let mut sessions = Vec::with_capacity(pointers.len());
        for (session, last_seen) in pointers {
            self.registry.record_seen(connection, &session, last_seen);

            let plan = match self.continuity.catch_up(&self.store, &session, last_seen).await {
                Ok(plan) => plan,
                Err(e) => {
                    tracing::warn!(session_id = %session, error = %e, "catch-up failed");
                    continue;
                },
            };

            let (full, records) = match plan {
                CatchUpPlan::UpToDate => (false, Vec::new()),
                CatchUpPlan::Diffs(records) => (false, records),
                CatchUpPlan::Full(record) => (true, vec![record]),
            };
            if let Some(last) = records.last() {
                self.registry.record_seen(connection, &session, last.version);
                self.router.send_direct(
                    connection,
                    Payload::CatchUp(CatchUp {
                        session: session.clone(),
                        full,
                        records: records.iter().map(StateRecord::to_snapshot).collect(),
                    }),
                );
            }
            sessions.push(session);
        }

        tracing::info!(
            identity = %identity,
            rooms = rejoined.len(),
            sessions = sessions.len(),
            "continuity restored"
        );
        self.router.send_direct(
            connection,
            Payload::ContinuityRestored(ContinuityRestored { rooms: rejoined, sessions }),
        );
    }

    /// Handle one client payload.
    ///
    /// Failures are answered with an `Error` envelope on the connection's
    /// outbound queue; only the connection's fate is returned.
    pub async fn handle_payload(&self, connection: ConnectionId, payload: Payload) -> Flow {
        if !self.registry.touch(connection) {
            return Flow::Gone;
        }

        let result = match payload {
            Payload::Ping => {
                self.router.send_direct(connection, Payload::Pong);
                Ok(())
            },
            Payload::Pong => Ok(()),
            Payload::Goodbye(goodbye) => {
                tracing::debug!(connection_id = %connection, reason = %goodbye.reason, "goodbye");
                return Flow::Goodbye;
            },
            Payload::JoinRoom(join) => self.handle_join(connection, join),
            Payload::LeaveRoom(leave) => {
                self.leave_room(connection, &leave.room);
                Ok(())
            },
            Payload::CreateRoom(create) => self.handle_create(connection, create),
            Payload::Propose(propose) => self.handle_propose(connection, propose).await,
            Payload::FetchState(fetch) => self.handle_fetch(connection, fetch).await,
            Payload::Publish(publish) => self.handle_publish(connection, publish),
            Payload::Hello(_) => Err(DriverError::Protocol("already authenticated".to_owned())),
            other => Err(DriverError::Protocol(format!(
                "{:?} is not a client payload",
                other.opcode()
            ))),
        };

        if let Err(e) = result {
            tracing::warn!(connection_id = %connection, error = %e, "request rejected");
            self.router.send_direct(connection, Payload::Error(e.to_payload()));
        }
        Flow::Continue
    }

    fn role_of(&self, connection: ConnectionId) -> Result<Role, DriverError> {
        self.registry
            .role_of(connection)
            .ok_or(DriverError::Sync(SyncError::ConnectionNotFound(connection)))
    }

    fn check_room_access(
        &self,
        connection: ConnectionId,
        room: &RoomId,
        kind: RoomKind,
    ) -> Result<(), DriverError> {
        match kind {
            RoomKind::Admin => {
                if self.role_of(connection)? == Role::Admin {
                    Ok(())
                } else {
                    Err(DriverError::Protocol(
                        "administrative rooms require the admin role".to_owned(),
                    ))
                }
            },
            RoomKind::Identity => {
                let own = self.registry.identity_of(connection).map(RoomId::identity);
                if own.as_ref() == Some(room) {
                    Ok(())
                } else {
                    Err(DriverError::Protocol("identity rooms are private".to_owned()))
                }
            },
            _ => Ok(()),
        }
    }

    fn handle_join(&self, connection: ConnectionId, join: JoinRoom) -> Result<(), DriverError> {
        let kind = self.rooms.room_kind(&join.room).unwrap_or(join.kind);
        self.check_room_access(connection, &join.room, kind)?;

        let outcome = self.join_room(connection, &join.room, kind);
        self.router.send_direct(
            connection,
            Payload::Joined(Joined {
                room: join.room,
                already_member: outcome == JoinOutcome::AlreadyMember,
            }),
        );
        Ok(())
    }

    fn handle_create(&self, connection: ConnectionId, create: CreateRoom) -> Result<(), DriverError> {
        self.check_room_access(connection, &create.room, create.kind)?;
        let owner = self.registry.identity_of(connection);
        let persistence = create.persistence.unwrap_or_else(|| create.kind.default_persistence());

        let created = self.rooms.create_room(
            &create.room,
            create.kind,
            Some(persistence),
            owner,
            create.metadata,
        );
        if created && persistence == Persistence::Ephemeral {
            self.router.announce_room_created(&create.room, create.kind);
        }

        let outcome = self.join_room(connection, &create.room, create.kind);
        self.router.send_direct(
            connection,
            Payload::Joined(Joined {
                room: create.room,
                already_member: outcome == JoinOutcome::AlreadyMember,
            }),
        );
        Ok(())
    }

    fn join_room(&self, connection: ConnectionId, room: &RoomId, kind: RoomKind) -> JoinOutcome {
        let outcome = self.rooms.join(connection, room, kind);
        self.registry.attach_room(connection, room.clone(), kind);

        if outcome == (JoinOutcome::Joined { created: true })
            && kind.default_persistence() == Persistence::Ephemeral
        {
            self.router.announce_room_created(room, kind);
        }
        outcome
    }

    fn leave_room(&self, connection: ConnectionId, room: &RoomId) {
        self.registry.detach_room(connection, room);
        self.release_membership(connection, room);
    }

    fn release_membership(&self, connection: ConnectionId, room: &RoomId) {
        match self.rooms.leave(connection, room) {
            Ok(LeaveOutcome::Left { kind, closed: true }) => self.router.room_closed(room, kind),
            Ok(LeaveOutcome::Vacated { kind }) => self.router.room_vacated(room, kind),
            Ok(LeaveOutcome::Left { .. } | LeaveOutcome::NotMember) => {},
            Err(SyncError::RoomNotFound(_)) => {
                tracing::debug!(connection_id = %connection, room_id = %room, "room already gone");
            },
            Err(e) => {
                tracing::warn!(connection_id = %connection, room_id = %room, error = %e, "leave failed");
            },
        }
    }

    async fn handle_propose(&self, connection: ConnectionId, propose: Propose) -> Result<(), DriverError> {
        let identity = self
            .registry
            .identity_of(connection)
            .ok_or(DriverError::Sync(SyncError::ConnectionNotFound(connection)))?;
        if self.role_of(connection)? == Role::Spectator {
            return Err(DriverError::Protocol("spectators cannot propose".to_owned()));
        }

        let request_id = propose.request_id;
        let session = propose.session.clone();
        let proposal = Proposal {
            session_id: propose.session,
            room: propose.room,
            identity,
            base_version: propose.base_version,
            payload: propose.payload,
        };

        let outcome = match self.propose(proposal).await {
            Ok(accepted) => ProposalOutcome::Accepted {
                version: accepted.record.version,
                replayed: accepted.replayed,
            },
            Err(err) => rejection(err)?,
        };

        self.router.send_direct(
            connection,
            Payload::ProposalResult(ProposalResult { request_id, session, outcome }),
        );
        Ok(())
    }

    /// Resolve `proposal`, retrying once after a short backoff if the session
    /// is busy.
    ///
    /// On acceptance the transition is durable and has been handed to the
    /// router before this returns.
    ///
    /// # Errors
    ///
    /// See [`ConflictResolver::propose`].
    pub async fn propose(&self, proposal: Proposal) -> Result<Accepted, SyncError> {
        match self.try_propose(proposal.clone()).await {
            Err(SyncError::Busy { .. }) => {
                self.env.sleep(self.config.busy_backoff).await;
                self.try_propose(proposal).await
            },
            other => other,
        }
    }

    async fn try_propose(&self, proposal: Proposal) -> Result<Accepted, SyncError> {
        let feed = &self.feed;
        let router = &self.router;
        let mut gap = None;
        let accepted = self
            .resolver
            .propose(proposal, |record| {
                router.announce_state(record);
                if let Classified::Gap { current } = feed.offer(record) {
                    gap = Some(current);
                }
            })
            .await?;

        // A predecessor committed elsewhere has not reached this node yet
        if let Some(current) = gap {
            let record = &accepted.record;
            feed.recover_gap(&record.session_id, current, record.version).await;
        }
        Ok(accepted)
    }

    async fn handle_fetch(&self, connection: ConnectionId, fetch: FetchState) -> Result<(), DriverError> {
        let record = self.store.get(&fetch.session).await?;
        if self.router.send_direct(connection, Payload::StateChanged(record.to_snapshot())) {
            self.registry.record_seen(connection, &record.session_id, record.version);
        }
        Ok(())
    }

    fn handle_publish(&self, connection: ConnectionId, publish: Publish) -> Result<(), DriverError> {
        if !self.rooms.is_member(connection, &publish.room) {
            if !self.rooms.room_exists(&publish.room) {
                return Err(DriverError::Sync(SyncError::RoomNotFound(publish.room)));
            }
            return Err(DriverError::Protocol(format!("not a member of {}", publish.room)));
        }

        let exclude = publish.exclude_self.then_some(connection);
        self.router.send_to_room(&publish.room, publish.event, exclude);
        Ok(())
    }

    /// Tear down `connection`. Idempotent.
    ///
    /// Detaches the outbound queue (dropping its pending batch), unregisters
    /// the connection and leaves its rooms. Ephemeral rooms left empty are
    /// closed. On the identity's last connection, presence goes offline and
    /// a continuity snapshot is captured.
    pub fn disconnect(&self, connection: ConnectionId, reason: &str) {
        self.router.detach(connection);
        let Some(removed) = self.registry.unregister(connection) else {
            return;
        };

        let identity = removed.connection.identity();
        let held: Vec<(RoomId, RoomKind)> =
            removed.connection.rooms().iter().map(|(room, kind)| (room.clone(), *kind)).collect();
        for (room, _) in &held {
            self.release_membership(connection, room);
        }

        if removed.last_for_identity {
            self.router.send_presence(identity, false);
            let rooms = held.into_iter().filter(|(_, kind)| *kind != RoomKind::Identity).collect();
            self.continuity.capture(identity, rooms, removed.connection.seen_versions().clone());
        }

        tracing::debug!(connection_id = %connection, identity = %identity, reason, "disconnected");
    }

    /// Periodic maintenance: evict idle connections, drop expired continuity
    /// snapshots and purge expired cache entries.
    pub fn tick(&self) -> TickReport {
        let idle = self.registry.idle_connections();
        for connection in &idle {
            self.registry.evict(*connection);
            self.disconnect(*connection, "idle timeout");
        }

        let report = TickReport {
            evicted: idle.len(),
            snapshots_expired: self.continuity.sweep(),
            cache_purged: self.store.purge_expired(),
        };
        if report.evicted > 0 {
            tracing::info!(evicted = report.evicted, "evicted idle connections");
        }
        report
    }

    /// Stop background tasks and refuse new connections. Workers disconnect
    /// their connections as they observe the cancellation.
    pub fn shutdown(&self) {
        tracing::info!(node_id = %self.node_id, "shutting down");
        self.shutdown.cancel();
    }

    /// Whether [`Self::shutdown`] was called.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

fn rejection(err: SyncError) -> Result<ProposalOutcome, DriverError> {
    let retry_after_ms = err.retry_after().map(|after| after.as_millis() as u64);
    let (reason, current) = match err {
        SyncError::StaleProposal { current, .. } => (RejectReason::Stale, Some(current.to_snapshot())),
        SyncError::Busy { .. } => (RejectReason::Busy, None),
        SyncError::DependencyUnavailable { .. } | SyncError::Storage(_) => {
            (RejectReason::Unavailable, None)
        },
        SyncError::SessionNotFound(_) => (RejectReason::NotFound, None),
        other => return Err(DriverError::Sync(other)),
    };
    Ok(ProposalOutcome::Rejected { reason, current, retry_after_ms })
}
