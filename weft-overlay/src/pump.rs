//! Socket pumps.
//!
//! One pump per TCP connection. A pump owns the socket and nothing else: it
//! moves bytes between the kernel and the hub's channels and emits lifecycle
//! events. All protocol and routing logic stays in the hub.
//!
//! Reads run with a short poll timeout so queued writes keep flushing even on
//! a quiet socket; per-connection FIFO holds in both directions.

use crate::connection::EphemeralIds;
use crate::events::{ConnCmd, HubEvent};
use bytes::Bytes;
use compio::buf::BufResult;
use compio::io::{AsyncRead, AsyncWriteExt};
use compio::net::{TcpListener, TcpStream};
use flume::{Receiver, Sender};
use std::time::Duration;
use tracing::{debug, warn};
use weft_core::hosts::HostAddress;

const READ_BUF_SIZE: usize = 8192;
const READ_POLL: Duration = Duration::from_millis(20);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Drive one established socket until EOF, an IO error or a `Close` command.
pub async fn serve_connection(
    mut stream: TcpStream,
    id: u64,
    events: Sender<HubEvent>,
    cmd_rx: Receiver<ConnCmd>,
) {
    loop {
        // === WRITE PUMP ===
        // Drain queued commands without blocking.
        loop {
            match cmd_rx.try_recv() {
                Ok(ConnCmd::Send(data)) => {
                    let BufResult(result, _) = stream.write_all(data.to_vec()).await;
                    if result.is_err() {
                        let _ = events.send(HubEvent::Closed { id });
                        return;
                    }
                }
                Ok(ConnCmd::Close) => {
                    // The hub already forgot about this connection.
                    return;
                }
                Err(flume::TryRecvError::Empty) => break,
                Err(flume::TryRecvError::Disconnected) => return,
            }
        }

        // === READ PUMP ===
        // Poll with a timeout so the write pump gets another turn.
        match compio::time::timeout(READ_POLL, AsyncRead::read(&mut stream, vec![0u8; READ_BUF_SIZE]))
            .await
        {
            Err(_) => continue, // poll tick
            Ok(BufResult(Ok(0), _)) => {
                debug!(id, "connection closed by peer");
                let _ = events.send(HubEvent::Closed { id });
                return;
            }
            Ok(BufResult(Ok(n), buf)) => {
                let data = Bytes::copy_from_slice(&buf[..n]);
                if events.send(HubEvent::Received { id, data }).is_err() {
                    return;
                }
            }
            Ok(BufResult(Err(e), _)) => {
                debug!(id, error = %e, "read failed");
                let _ = events.send(HubEvent::Closed { id });
                return;
            }
        }
    }
}

/// Accept loop: assign an ephemeral identifier to every socket and hand it to
/// a freshly spawned pump.
pub async fn run_listener(listener: TcpListener, events: Sender<HubEvent>, ids: EphemeralIds) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let id = ids.next();
                debug!(id, peer = ?peer, "accepted connection");
                let (tx, cmd_rx) = flume::unbounded();
                if events.send(HubEvent::Accepted { id, tx }).is_err() {
                    return;
                }
                let events = events.clone();
                compio::runtime::spawn(serve_connection(stream, id, events, cmd_rx)).detach();
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                compio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

/// Establish an outgoing proxy connection to a peer and pump it.
///
/// The hub inserted a pending connection for `id` before spawning this; the
/// `ProxyUp` event attaches the command channel and flushes the handshake
/// frames queued meanwhile.
pub async fn connect_proxy(id: u64, address: HostAddress, events: Sender<HubEvent>) {
    let target = format!("{}:{}", address.host, address.port);
    match TcpStream::connect(target.as_str()).await {
        Ok(stream) => {
            debug!(id, %target, "proxy connection established");
            let (tx, cmd_rx) = flume::unbounded();
            if events.send(HubEvent::ProxyUp { id, tx }).is_err() {
                return;
            }
            serve_connection(stream, id, events, cmd_rx).await;
        }
        Err(e) => {
            debug!(id, %target, error = %e, "proxy connection failed");
            let _ = events.send(HubEvent::ProxyFailed { id });
        }
    }
}
