//! Background stabilization worker.
//!
//! Runs on its own OS thread and talks to the hub exclusively through one
//! channel pair; on the hub side it appears as just another (priority)
//! connection. At most one request is ever outstanding: the hub snapshots
//! each request header and drops responses that do not match it, so the
//! worker never acts on stale information.
//!
//! One round:
//! 1. ask the hub for the current successor;
//! 2. lone node: try to join through a bootstrap peer;
//! 3. else ask the successor for its predecessor and adopt it when it falls
//!    in `(self, successor)`;
//! 4. notify the successor;
//! 5. fix one finger;
//! 6. ping the controller.
//!
//! Errors pause the worker and ask the hub to destabilize, which re-runs the
//! connection repair on the next tick. Channel EOF means the hub is gone and
//! the thread exits cleanly.

use crate::error::{HubError, Result};
use crate::events::ConnCmd;
use crate::protocol;
use bytes::Bytes;
use flume::{Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};
use tracing::{debug, trace};
use weft_core::node::{in_open_range, CONTROLLER, MAX_ID, TABLE_SIZE};
use weft_core::serializer;
use weft_core::wire::{qualifier, Command, Header, ACCEPTED, REJECTED, REQUEST};

#[derive(Debug, Clone)]
pub struct StabilizerConfig {
    pub uid: u64,
    pub bootstrap: Vec<u64>,
    pub period: Duration,
    pub timeout: Duration,
    pub pause: Duration,
}

/// Spawn the worker thread. It exits when the hub closes its channel end.
pub fn spawn(
    config: StabilizerConfig,
    rx: Receiver<ConnCmd>,
    tx: Sender<Bytes>,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("weft-stabilizer".into())
        .spawn(move || Stabilizer::new(config, rx, tx).run())
        .expect("thread spawn cannot fail with a valid name")
}

pub struct Stabilizer {
    config: StabilizerConfig,
    rx: Receiver<ConnCmd>,
    tx: Sender<Bytes>,
    sequence: u16,
    finger: usize,
}

impl Stabilizer {
    #[must_use]
    pub fn new(config: StabilizerConfig, rx: Receiver<ConnCmd>, tx: Sender<Bytes>) -> Self {
        Self {
            config,
            rx,
            tx,
            sequence: 0,
            finger: 0,
        }
    }

    pub fn run(mut self) {
        debug!(uid = self.config.uid, "stabilizer running");
        loop {
            match self.round() {
                Ok(()) => {
                    if !self.idle(self.config.period) {
                        break;
                    }
                }
                Err(HubError::WorkerClosed) => break,
                Err(e) => {
                    trace!(error = %e, "stabilization round failed");
                    if self.destabilize().is_err() {
                        break;
                    }
                    if !self.idle(self.config.pause) {
                        break;
                    }
                }
            }
        }
        debug!(uid = self.config.uid, "stabilizer exiting");
    }

    /// One stabilization round.
    pub fn round(&mut self) -> Result<()> {
        let uid = self.config.uid;

        let successor = self.query_successor()?;
        if successor == uid {
            return self.join_ring();
        }

        // Ask the successor for its predecessor; adopt a closer one.
        let sequence = self.next_sequence();
        let (header, payload) = self.exchange(
            protocol::get_predecessor_request(uid, successor, sequence),
            Command::Node,
            qualifier::GET_PREDECESSOR,
            sequence,
        )?;
        if header.status == ACCEPTED {
            if let Some(candidate) = serializer::get_u64(&payload, 0) {
                if candidate <= MAX_ID && in_open_range(candidate, uid, successor) {
                    self.set_successor_local(candidate)?;
                }
            }
        }

        // Tell the (possibly new) successor about us.
        let successor = self.query_successor()?;
        if successor != uid {
            let sequence = self.next_sequence();
            self.exchange(
                protocol::notify_request(uid, successor, sequence, uid),
                Command::Node,
                qualifier::NOTIFY,
                sequence,
            )?;
        }

        // Repair one finger per round.
        self.finger = (self.finger + 1) % TABLE_SIZE;
        let start = (uid + (1u64 << self.finger)) & MAX_ID;
        let sequence = self.next_sequence();
        let (header, payload) = self.exchange(
            protocol::find_successor_request(uid, uid, sequence, self.finger as u8, start),
            Command::Overlay,
            qualifier::FIND_SUCCESSOR,
            sequence,
        )?;
        if header.status == ACCEPTED {
            if let Some(id) = serializer::get_u64(&payload, 8) {
                self.set_finger_local(self.finger as u32, id)?;
            }
        }

        // Liveness probe toward the controller.
        let sequence = self.next_sequence();
        self.exchange(
            protocol::ping_request(uid, CONTROLLER, sequence),
            Command::Overlay,
            qualifier::PING,
            sequence,
        )?;
        Ok(())
    }

    /// Lone node: adopt a successor through one of the bootstrap peers.
    fn join_ring(&mut self) -> Result<()> {
        let uid = self.config.uid;
        let bootstrap = self.config.bootstrap.clone();
        let mut attempted = false;
        for peer in bootstrap {
            if peer == uid {
                continue;
            }
            attempted = true;
            let sequence = self.next_sequence();
            match self.exchange(
                protocol::find_successor_request(uid, peer, sequence, 0, uid),
                Command::Overlay,
                qualifier::FIND_SUCCESSOR,
                sequence,
            ) {
                Ok((header, payload)) if header.status == ACCEPTED => {
                    let candidate = serializer::get_u64(&payload, 8).unwrap_or(uid);
                    if candidate != uid && candidate <= MAX_ID {
                        self.set_successor_local(candidate)?;
                        debug!(successor = candidate, "joined the ring");
                        return Ok(());
                    }
                }
                Ok(_) => {}
                Err(HubError::WorkerClosed) => return Err(HubError::WorkerClosed),
                Err(_) => {}
            }
        }
        if attempted {
            // Every bootstrap peer failed; back off.
            Err(HubError::StabilizationTimeout)
        } else {
            // No peers configured: a single-node ring is a valid state.
            Ok(())
        }
    }

    fn query_successor(&mut self) -> Result<u64> {
        let uid = self.config.uid;
        let sequence = self.next_sequence();
        let (header, payload) = self.exchange(
            protocol::get_successor_request(uid, uid, sequence),
            Command::Node,
            qualifier::GET_SUCCESSOR,
            sequence,
        )?;
        if header.status == ACCEPTED {
            serializer::get_u64(&payload, 0).ok_or(HubError::StabilizationTimeout)
        } else {
            Err(HubError::StabilizationTimeout)
        }
    }

    fn set_successor_local(&mut self, successor: u64) -> Result<()> {
        let uid = self.config.uid;
        let sequence = self.next_sequence();
        self.exchange(
            protocol::set_successor_request(uid, uid, sequence, successor),
            Command::Node,
            qualifier::SET_SUCCESSOR,
            sequence,
        )?;
        Ok(())
    }

    fn set_finger_local(&mut self, index: u32, id: u64) -> Result<()> {
        let uid = self.config.uid;
        let sequence = self.next_sequence();
        self.exchange(
            protocol::set_finger_request(uid, uid, sequence, index, id),
            Command::Node,
            qualifier::SET_FINGER,
            sequence,
        )?;
        Ok(())
    }

    /// Ask the hub to re-run its connection repair.
    fn destabilize(&mut self) -> Result<()> {
        let uid = self.config.uid;
        let sequence = self.next_sequence();
        self.exchange(
            protocol::ping_request(uid, uid, sequence),
            Command::Overlay,
            qualifier::PING,
            sequence,
        )?;
        Ok(())
    }

    fn next_sequence(&mut self) -> u16 {
        self.sequence = self.sequence.wrapping_add(1);
        self.sequence
    }

    /// Send one request and wait for its matching response.
    ///
    /// Responses with the wrong sequence, command or qualifier are stale
    /// leftovers and silently dropped. A rejected-null with our sequence is
    /// the hub telling us the request could not be delivered.
    fn exchange(
        &mut self,
        frame: Bytes,
        command: Command,
        qualifier_code: u8,
        sequence: u16,
    ) -> Result<(Header, Vec<u8>)> {
        self.tx.send(frame).map_err(|_| HubError::WorkerClosed)?;

        let deadline = Instant::now() + self.config.timeout;
        loop {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()).filter(|d| !d.is_zero())
            else {
                return Err(HubError::StabilizationTimeout);
            };
            match self.rx.recv_timeout(remaining) {
                Ok(ConnCmd::Send(data)) => {
                    let Some((header, payload)) = protocol::parse_frame(&data) else {
                        continue;
                    };
                    if header.sequence != sequence || header.status == REQUEST {
                        continue; // stale
                    }
                    if header.command == command as u8 && header.qualifier == qualifier_code {
                        return Ok((header, payload.to_vec()));
                    }
                    if header.command == Command::Null as u8
                        && header.qualifier == qualifier::NULL
                        && header.status == REJECTED
                    {
                        // Undeliverable; fail fast instead of waiting out
                        // the deadline.
                        return Err(HubError::StabilizationTimeout);
                    }
                }
                Ok(ConnCmd::Close) | Err(RecvTimeoutError::Disconnected) => {
                    return Err(HubError::WorkerClosed)
                }
                Err(RecvTimeoutError::Timeout) => return Err(HubError::StabilizationTimeout),
            }
        }
    }

    /// Sleep that wakes on channel teardown. `false` means the hub is gone.
    fn idle(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()).filter(|d| !d.is_zero())
            else {
                return true;
            };
            match self.rx.recv_timeout(remaining) {
                Ok(ConnCmd::Send(_)) => {} // late stale response
                Ok(ConnCmd::Close) | Err(RecvTimeoutError::Disconnected) => return false,
                Err(RecvTimeoutError::Timeout) => return true,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::wire::HEADER_SIZE;

    fn config() -> StabilizerConfig {
        StabilizerConfig {
            uid: 100,
            bootstrap: vec![],
            period: Duration::from_millis(10),
            timeout: Duration::from_millis(50),
            pause: Duration::from_millis(10),
        }
    }

    /// Scripted hub half: answers every request in order with the provided
    /// closures over (header, payload).
    fn respond(
        request: &Bytes,
        status: u8,
        payload: &[u8],
    ) -> Bytes {
        let (mut header, _) = protocol::parse_frame(request).unwrap();
        header.status = status;
        header.length = (HEADER_SIZE + payload.len()) as u16;
        protocol::build_frame(header, payload)
    }

    #[test]
    fn exchange_matches_and_drops_stale() {
        let (cmd_tx, cmd_rx) = flume::unbounded();
        let (out_tx, out_rx) = flume::unbounded();
        let mut worker = Stabilizer::new(config(), cmd_rx, out_tx);

        let responder = std::thread::spawn(move || {
            let request: Bytes = out_rx.recv().unwrap();
            // A stale frame first (wrong sequence), then the real response.
            let (mut stale_header, _) = protocol::parse_frame(&request).unwrap();
            stale_header.sequence = stale_header.sequence.wrapping_add(7);
            stale_header.status = ACCEPTED;
            let stale = protocol::build_frame(stale_header, &100u64.to_be_bytes());
            cmd_tx.send(ConnCmd::Send(stale)).unwrap();
            cmd_tx
                .send(ConnCmd::Send(respond(&request, ACCEPTED, &4242u64.to_be_bytes())))
                .unwrap();
        });

        let successor = worker.query_successor().unwrap();
        assert_eq!(successor, 4242);
        responder.join().unwrap();
    }

    #[test]
    fn exchange_times_out_without_response() {
        let (_cmd_tx, cmd_rx) = flume::unbounded();
        let (out_tx, _out_rx) = flume::unbounded();
        let mut worker = Stabilizer::new(config(), cmd_rx, out_tx);
        assert!(matches!(
            worker.query_successor(),
            Err(HubError::StabilizationTimeout)
        ));
    }

    #[test]
    fn channel_teardown_is_eof() {
        let (cmd_tx, cmd_rx) = flume::unbounded();
        let (out_tx, out_rx) = flume::unbounded();
        let mut worker = Stabilizer::new(config(), cmd_rx, out_tx);
        drop(cmd_tx);
        drop(out_rx);
        assert!(matches!(
            worker.query_successor(),
            Err(HubError::WorkerClosed)
        ));
        assert!(!worker.idle(Duration::from_millis(5)));
    }

    #[test]
    fn round_converges_against_scripted_successor() {
        // Two-node script: we are 100, the successor is 200 and already has
        // predecessor 150, which lies in (100, 200) and must be adopted.
        let (cmd_tx, cmd_rx) = flume::unbounded();
        let (out_tx, out_rx) = flume::unbounded();
        let mut worker = Stabilizer::new(config(), cmd_rx, out_tx);

        let responder = std::thread::spawn(move || {
            let mut successor = 200u64;
            loop {
                let Ok(request) = out_rx.recv_timeout(Duration::from_millis(200)) else {
                    return successor;
                };
                let (header, payload) = protocol::parse_frame(&request).unwrap();
                let reply = match (header.command, header.qualifier) {
                    (3, qualifier::GET_SUCCESSOR) => {
                        respond(&request, ACCEPTED, &successor.to_be_bytes())
                    }
                    (3, qualifier::GET_PREDECESSOR) => {
                        respond(&request, ACCEPTED, &150u64.to_be_bytes())
                    }
                    (3, qualifier::SET_SUCCESSOR) => {
                        successor = serializer::get_u64(payload, 0).unwrap();
                        respond(&request, ACCEPTED, &successor.to_be_bytes())
                    }
                    (3, qualifier::SET_FINGER) => respond(&request, ACCEPTED, payload),
                    (3, qualifier::NOTIFY) => respond(&request, ACCEPTED, &[]),
                    (4, qualifier::FIND_SUCCESSOR) => {
                        let mut out = [0u8; 16];
                        out[..8].copy_from_slice(&payload[..8]);
                        out[8..].copy_from_slice(&successor.to_be_bytes());
                        respond(&request, ACCEPTED, &out)
                    }
                    (4, qualifier::PING) => respond(&request, ACCEPTED, &[]),
                    _ => respond(&request, REJECTED, &[]),
                };
                cmd_tx.send(ConnCmd::Send(reply)).unwrap();
            }
        });

        worker.round().unwrap();
        drop(worker);
        let successor = responder.join().unwrap();
        // The scripted predecessor 150 became our successor.
        assert_eq!(successor, 150);
    }
}
