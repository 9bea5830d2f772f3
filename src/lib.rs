//! Open Charge Controller.
//!
//! Site-level controller that charges one or more electric vehicles from
//! available on-site power. Each cycle reads the field devices, plans
//! deadline-constrained charging, allocates the shared power budget across
//! all charge points and issues the resulting commands, degrading safely
//! when device I/O fails.

pub mod api;
pub mod auth;
pub mod config;
pub mod core;
pub mod domain;
pub mod hardware;
pub mod remote;
pub mod telemetry;
