//! In-process connection handshake.
//!
//! Co-resident clients use this stream to obtain a direct table handle and
//! skip serialization. The wire contract is a three-message exchange: the
//! client sends its pid and table name; the server answers with a capability
//! token (or 0 when the peer is in another process); the client confirms it
//! adopted the handle. Remote peers get no response at all, which tells them
//! to stay on the regular RPC path.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tonic::{Status, Streaming};
use tracing::debug;

use replay_core::handoff;
use replay_proto::{InitializeConnectionRequest, InitializeConnectionResponse};

use super::table_not_found;
use crate::grpc::ServiceState;

/// Only loopback and in-process peers are candidates for the fast path.
/// Transports without a socket address (in-process, uds) count as local.
pub(crate) fn peer_is_local(peer: Option<SocketAddr>) -> bool {
    peer.is_none_or(|addr| addr.ip().is_loopback())
}

pub(crate) async fn run(
    service: Arc<ServiceState>,
    peer: Option<SocketAddr>,
    mut requests: Streaming<InitializeConnectionRequest>,
    tx: mpsc::Sender<Result<InitializeConnectionResponse, Status>>,
) {
    if !peer_is_local(peer) {
        return;
    }

    let mut token = None;
    let outcome = handshake(&service, &mut requests, &tx, &mut token).await;
    // The client has cloned the handle (or never will); either way the
    // registration goes away with the stream.
    if let Some(token) = token {
        handoff::release(token);
    }
    if let Err(status) = outcome {
        let _ = tx.send(Err(status)).await;
    }
}

async fn handshake(
    service: &ServiceState,
    requests: &mut Streaming<InitializeConnectionRequest>,
    tx: &mpsc::Sender<Result<InitializeConnectionResponse, Status>>,
    token_slot: &mut Option<u64>,
) -> Result<(), Status> {
    let first = match requests.message().await {
        Ok(Some(request)) => request,
        Ok(None) => return Ok(()),
        Err(_) => return Err(Status::internal("failed to read from stream")),
    };

    if first.pid != i64::from(std::process::id()) {
        // A zero address signals that client and server do not share a
        // process.
        let _ = tx
            .send(Ok(InitializeConnectionResponse { address: 0 }))
            .await;
        return Ok(());
    }

    let table = service
        .table_by_name(&first.table_name)
        .ok_or_else(|| table_not_found(&first.table_name))?;
    let token = handoff::register(table);
    *token_slot = Some(token);
    debug!(table = %first.table_name, "issued in-process table handle");

    if tx
        .send(Ok(InitializeConnectionResponse {
            address: token as i64,
        }))
        .await
        .is_err()
    {
        return Ok(());
    }

    let confirmation = match requests.message().await {
        Ok(Some(request)) => request,
        Ok(None) => return Ok(()),
        Err(_) => return Err(Status::internal("failed to read from stream")),
    };
    if !confirmation.ownership_transferred {
        return Err(Status::internal("received unexpected request"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_and_addressless_peers_are_local() {
        assert!(peer_is_local(None));
        assert!(peer_is_local(Some("127.0.0.1:9000".parse().unwrap())));
        assert!(peer_is_local(Some("[::1]:9000".parse().unwrap())));
        assert!(!peer_is_local(Some("10.1.2.3:9000".parse().unwrap())));
    }
}
