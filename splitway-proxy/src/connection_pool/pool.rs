//! Lock-free hot pool of upstream HTTP/1.1 connections using DashMap and SegQueue.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_queue::SegQueue;
use dashmap::DashMap;
use hyper::body::Incoming;
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::DispatchError;

/// Caches idle upstream senders per backend authority.
#[derive(Debug, Clone, Default)]
pub struct ConnectionPool {
    /// Maps a backend `host:port` to a lock-free queue of idle senders.
    idle_connections: Arc<DashMap<String, Arc<SegQueue<SendRequest<Incoming>>>>>,
}

impl ConnectionPool {
    /// Creates a new empty connection pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pops a sender to `authority` that can take a request right now.
    ///
    /// Closed senders are discarded. Senders still busy with a response body are put
    /// back, so this never waits.
    pub fn try_pop(&self, authority: &str) -> Option<SendRequest<Incoming>> {
        let queue = self.idle_connections.get(authority)?.value().clone();

        for _ in 0..queue.len() {
            let sender = queue.pop()?;
            if sender.is_closed() {
                continue;
            }
            if sender.is_ready() {
                return Some(sender);
            }
            queue.push(sender);
        }
        None
    }

    /// Pushes a sender back into the pool for reuse.
    pub fn push(&self, authority: &str, sender: SendRequest<Incoming>) {
        if sender.is_closed() {
            return;
        }

        let queue = self
            .idle_connections
            .entry(authority.to_string())
            .or_insert_with(|| Arc::new(SegQueue::new()))
            .value()
            .clone();

        queue.push(sender);
    }

    /// A pooled sender to `authority`, or a fresh connection when none is free.
    pub async fn checkout(
        &self,
        authority: &str,
        connect_timeout: Duration,
    ) -> Result<SendRequest<Incoming>, DispatchError> {
        if let Some(sender) = self.try_pop(authority) {
            return Ok(sender);
        }

        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(authority))
            .await
            .map_err(|_| DispatchError::Timeout(connect_timeout))?
            .map_err(|source| DispatchError::Connect {
                authority: authority.to_string(),
                source,
            })?;
        let _ = stream.set_nodelay(true);

        let (sender, conn) = http1::handshake(TokioIo::new(stream)).await?;

        let peer = authority.to_string();
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(upstream = %peer, error = %e, "upstream connection closed");
            }
        });

        debug!(upstream = authority, "opened upstream connection");
        Ok(sender)
    }
}
