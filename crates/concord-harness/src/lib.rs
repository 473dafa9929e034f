//! Deterministic simulation harness for Concord.
//!
//! Runs one or more [`ServerDriver`](concord_server::ServerDriver) nodes in a
//! single process, without a transport, under Tokio's paused clock. Node and
//! connection ids come from seeded RNGs, so a failing run replays exactly.
//!
//! - [`SimEnv`]: virtual time and seeded randomness
//! - [`SimAuthenticator`]: `role:identity` credentials with an outage switch
//! - [`CellClaimRules`]: board-claiming domain rules for conflict tests
//! - [`SimCluster`]: nodes sharing a bus and durable storage
//! - [`TestClient`]: scripted connection with `expect`-style assertions

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod cluster;
pub mod rules;
pub mod sim_auth;
pub mod sim_env;

pub use client::{DEFAULT_EXPECT_TIMEOUT, TestClient};
pub use cluster::{NodeSnapshot, SimCluster, SimNode};
pub use rules::CellClaimRules;
pub use sim_auth::SimAuthenticator;
pub use sim_env::SimEnv;
