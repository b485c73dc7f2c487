// src/web.rs
use crate::error::ServeError;
use crate::hub::BroadcastHub;
use crate::proxy::{self, ProxyState};
use crate::rewrite::{REFRESH_MESSAGE, WS_PATH};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures_util::stream::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch::Receiver as WatchReceiver;
use tracing::{debug, info};

/// Body returned by the trigger endpoint.
pub const TRIGGER_RESPONSE: &str = "Broadcasted refresh message\n";

/// Handles incoming WebSocket upgrade requests on the reserved push path.
async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<Arc<ProxyState>>) -> Response {
    debug!("New live-reload WebSocket connection request.");
    let hub = Arc::clone(&state.hub);
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

/// Registers the write half with the hub and watches the read half until the peer goes away.
///
/// Browsers never send anything meaningful, so every inbound frame other than a
/// close is ignored. A close frame, a read error or the end of the stream all end
/// the connection.
async fn handle_socket(socket: WebSocket, hub: Arc<BroadcastHub>) {
    let (sender, mut receiver) = socket.split();
    let id = hub.register(sender).await;
    info!("Live-reload client connected.");

    while let Some(result) = receiver.next().await {
        match result {
            Ok(Message::Close(_)) => {
                debug!("Live-reload client sent Close frame.");
                break;
            }
            Ok(_) => {
                debug!("Ignoring message from live-reload client.");
            }
            Err(e) => {
                debug!("Live-reload client read error: {}", e);
                break;
            }
        }
    }

    hub.unregister(id).await;
    info!("Live-reload client disconnected.");
}

/// Broadcasts a refresh to every connected page, whatever the method or path.
async fn trigger_handler(State(hub): State<Arc<BroadcastHub>>) -> impl IntoResponse {
    let delivered = hub.broadcast(REFRESH_MESSAGE).await;
    info!("Refresh triggered, delivered to {} client(s).", delivered);
    TRIGGER_RESPONSE
}

/// Router for browser traffic: the push path plus a catch-all forwarder.
pub fn proxy_router(state: Arc<ProxyState>) -> Router {
    Router::new()
        .route(WS_PATH, get(websocket_handler))
        .fallback(proxy::forward)
        .with_state(state)
}

/// Router for the trigger listener. Every request broadcasts a refresh.
pub fn trigger_router(hub: Arc<BroadcastHub>) -> Router {
    Router::new().fallback(trigger_handler).with_state(hub)
}

/// Binds a TCP listener, mapping failures to [`ServeError::Bind`].
pub async fn bind(addr: SocketAddr) -> Result<TcpListener, ServeError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServeError::Bind { addr, source })
}

/// Serves the proxy router until the shutdown signal fires.
pub async fn serve_proxy(
    listener: TcpListener,
    state: Arc<ProxyState>,
    shutdown_signal: WatchReceiver<bool>,
) -> Result<()> {
    info!("Proxy server starting on http://{}", listener.local_addr()?);
    serve(listener, proxy_router(state), shutdown_signal).await?;
    info!("Proxy server stopped.");
    Ok(())
}

/// Serves the trigger router until the shutdown signal fires.
pub async fn serve_trigger(
    listener: TcpListener,
    hub: Arc<BroadcastHub>,
    shutdown_signal: WatchReceiver<bool>,
) -> Result<()> {
    info!("Trigger server starting on http://{}", listener.local_addr()?);
    serve(listener, trigger_router(hub), shutdown_signal).await?;
    info!("Trigger server stopped.");
    Ok(())
}

async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown_signal: WatchReceiver<bool>,
) -> std::io::Result<()> {
    let mut shutdown = shutdown_signal.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        // A dropped sender also counts as shutdown.
        while shutdown.changed().await.is_ok() {
            if *shutdown.borrow() {
                break;
            }
        }
        info!("Server shutting down gracefully.");
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_reports_an_occupied_address() {
        let first = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = first.local_addr().unwrap();

        match bind(addr).await {
            Err(ServeError::Bind { addr: failed, source }) => {
                assert_eq!(failed, addr);
                assert_eq!(source.kind(), std::io::ErrorKind::AddrInUse);
            }
            Ok(_) => panic!("second bind on {} succeeded", addr),
        }
    }
}
