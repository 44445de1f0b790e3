//! Domain models shared between the control loop and the proxy.

pub mod config;
pub mod metrics;
pub mod route;
pub mod store;
