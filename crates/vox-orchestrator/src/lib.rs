//! vox-orchestrator library target: the control-plane HTTP service (spec
//! §4.5) that spawns and supervises per-binding workers and exposes the
//! start/pause/resume/stop/status/monitor operations plus OTP ingress.
//!
//! Exposes the router and state so integration tests can compose the
//! router directly, mirroring how this lineage's daemon crate is tested.

pub mod api_types;
pub mod routes;
pub mod state;
