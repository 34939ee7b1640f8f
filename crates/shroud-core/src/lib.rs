//! shroud-core - Proxied-Network Session Orchestration
//!
//! Privileged helper core that routes all host traffic through an
//! anonymizing proxy. It coordinates two external subprocesses, captures
//! and restores host network state, and installs kernel routes in a
//! failure-safe order.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                   Session Controller                      │
//! │   lock ── snapshot ── bootstrap gate ── routes ── wait    │
//! └───────┬───────────────────┬───────────────────┬──────────┘
//!         │                   │                   │
//!         ▼                   ▼                   ▼
//!  ┌─────────────┐   ┌─────────────────┐   ┌─────────────┐
//!  │  Network    │   │    Process      │   │   Route     │
//!  │  State Mgr  │   │   Supervisor    │   │ Configurator│
//!  │ (snapshot/  │   │ (client+bridge, │   │ (bypass →   │
//!  │  restore)   │   │  log scanner)   │   │  default)   │
//!  └─────────────┘   └─────────────────┘   └─────────────┘
//! ```
//!
//! # Guarantees
//!
//! - **Single session**: a PID lock file is the system-wide source of
//!   truth; `connect` fails fast while a live helper owns it.
//! - **Snapshot first**: nothing is launched and no route is touched
//!   before the original network state is captured and persisted.
//! - **Ordered routes**: the bypass route is confirmed before the
//!   default route is replaced, and rolled back if the replacement
//!   fails.
//! - **Teardown always**: normal exit, startup failure and termination
//!   signals all drain into one idempotent teardown path.

mod config;
mod lock;
mod netstate;
mod routes;
mod session;
mod supervisor;

pub use config::{ConfigError, HelperConfig};
pub use lock::{LockError, LockProbe, SessionLock};
pub use netstate::{restore_network, NetworkSnapshot};
pub use routes::{
    parse_route_get, DefaultRoute, IpRoute, NetworkConfigError, Route, RouteConfigurator,
    RouteDst, RouteOps, LOCAL_RESOLVER,
};
pub use session::{connect, disconnect, Session, SessionError, SessionState};
pub use supervisor::{Supervisor, SupervisorError};
