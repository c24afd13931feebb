//! Accept loops for drone and client connections

use crate::dispatch::AppDispatch;
use crate::overseer::Overseer;
use crate::session::Session;
use std::sync::Arc;
use tokio::net::{TcpListener, UnixListener};
use tracing::{debug, info, warn};

/// Accept drone connections; each starts on the handshake handler
pub async fn serve_drones(listener: UnixListener, overseer: Arc<Overseer>) -> anyhow::Result<()> {
    let mut accepted = 0u64;
    loop {
        let (stream, _addr) = listener.accept().await?;
        accepted += 1;
        let peer = format!("drone-conn-{}", accepted);
        debug!("[LISTENER] drone connection {}", peer);

        let (handle, session) = Session::new(stream, peer);
        if let Err(e) = overseer.attach(&handle).await {
            warn!("[LISTENER] could not attach drone connection: {}", e);
            continue;
        }
        tokio::spawn(session.run());
    }
}

/// Accept client connections; each channel a client opens starts with an
/// `enqueue` handled by [`AppDispatch`]
pub async fn serve_clients(listener: TcpListener, overseer: Arc<Overseer>) -> anyhow::Result<()> {
    let dispatch = Arc::new(AppDispatch::new(overseer));
    loop {
        let (stream, addr) = listener.accept().await?;
        info!("[LISTENER] client connected from {}", addr);
        if let Err(e) = stream.set_nodelay(true) {
            debug!("[LISTENER] set_nodelay failed for {}: {}", addr, e);
        }

        let (handle, session) = Session::new(stream, addr.to_string());
        if let Err(e) = handle.inject(dispatch.clone()).await {
            warn!("[LISTENER] could not set up client {}: {}", addr, e);
            continue;
        }
        tokio::spawn(session.run());
    }
}
