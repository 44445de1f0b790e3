//! Server module for accepting connections and handing requests to the dispatcher.

use std::convert::Infallible;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::dispatcher::Dispatcher;

/// Serves HTTP/1.1 on `listener` until shutdown is signalled.
///
/// One task per connection. Connections already accepted finish on their own.
pub async fn serve(
    listener: TcpListener,
    dispatcher: Dispatcher,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "proxy listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let _ = stream.set_nodelay(true);
                let dispatcher = dispatcher.clone();

                tokio::task::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req: Request<Incoming>| {
                        let dispatcher = dispatcher.clone();
                        async move { Ok::<_, Infallible>(dispatcher.dispatch(req).await) }
                    });

                    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                        debug!(%peer, error = %err, "connection closed with error");
                    }
                });
            }
            _ = shutdown.changed() => {
                info!("proxy shutting down");
                break;
            }
        }
    }

    Ok(())
}
