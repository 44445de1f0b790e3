//! Backend selection for the request hot path.

pub mod selector;
