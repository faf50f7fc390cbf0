//! # wgpilot-core
//!
//! The control core of wgpilot: reconciliation, staged mutation, live
//! monitoring, and first-run setup gating for a host running multiple
//! WireGuard tunnels.
//!
//! - [`Reconciler`] — startup alignment of kernel state with the Store
//! - [`Orchestrator`] — staged, compensating mutation of networks, peers,
//!   and bridges
//! - [`Monitor`] — polling, snapshot retention, SSE fan-out, Prometheus
//!   exposition
//! - [`SetupMachine`] — the five-state first-run bootstrap gate
//! - [`WgpilotError`] — the closed error taxonomy shared by every
//!   operation above
//!
//! This crate owns no HTTP surface, TLS, or auth middleware — it exposes
//! plain async methods and broadcast channels for an external listener
//! to embed.

pub mod error;
pub mod monitor;
pub mod orchestrator;
pub mod reconciler;
pub mod setup;
pub mod types;
pub mod validation;

pub use error::{ConflictContext, Result, WgpilotError};
pub use monitor::{Monitor, MonitorConfig};
pub use orchestrator::{NewBridgeRequest, NewNetworkRequest, NewPeerRequest, Orchestrator};
pub use reconciler::{ReconcileReport, Reconciler};
pub use setup::{OtpHasher, ServerIdentity, SetupMachine, SetupStep};
pub use types::{NetworkLiveStatus, PeerLiveStatus};
