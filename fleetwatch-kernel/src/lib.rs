//! FleetWatch kernel - supervision of a fleet of display nodes.
//!
//! - [`health`]: per-node liveness records ([`health::HealthTracker`])
//! - [`liveness`]: online / degraded / offline derivation
//! - [`playback`]: per-node play / pause / stop / resume with stale-frame suppression
//! - [`recovery`]: policy driven remediation
//! - [`watchdog`]: one periodic check timeline per node
//! - [`status`]: reporting surface
//!
//! Transport, probing and reset adapters live in [`mqtt`], [`probe`] and [`wol`].

pub mod capabilities;
pub mod config;
pub mod health;
pub mod http;
pub mod liveness;
pub mod models;
pub mod mqtt;
pub mod playback;
pub mod probe;
pub mod recovery;
pub mod scenes;
pub mod state;
pub mod status;
pub mod watchdog;
pub mod wol;

pub use health::{HealthRecord, HealthTracker};
pub use liveness::{compute_status, NodeLivenessStatus};
pub use playback::PlaybackStateMachine;
pub use recovery::RecoveryActionExecutor;
pub use watchdog::{HealthCheckOutcome, TickOutcome, WatchdogScheduler};
