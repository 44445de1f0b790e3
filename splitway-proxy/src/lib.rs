//! Splitway Proxy Engine
//!
//! The request side of Splitway: an HTTP/1.1 listener whose dispatcher reads each
//! route's routing decision and forwards the request to the heavy or the elastic
//! backend pool over pooled upstream connections.

pub mod connection_pool;
pub mod dispatcher;
pub mod error;
pub mod server;

pub use dispatcher::{DispatchStats, Dispatcher, ProxyBody, ROUTING_DECISION_HEADER};
pub use error::DispatchError;
pub use server::serve;
