//! Event and command types wiring the hub to its connection pumps.
//!
//! The hub owns one inbound event channel; pumps, the listener, the timer,
//! the file watcher and the signal bridge all feed it. Each connection owns
//! one command channel the hub writes into.

use bytes::Bytes;
use flume::Sender;

/// Commands sent from the hub to a connection pump.
#[derive(Debug)]
pub enum ConnCmd {
    /// Transmit a serialized frame
    Send(Bytes),
    /// Close the socket
    Close,
}

/// File watch slots for hot reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum WatchSlot {
    Configuration = 0,
    HostsDatabase = 1,
    HostsFile = 2,
    PrivateKey = 3,
    PublicKey = 4,
    SslRoot = 5,
    SslCertificate = 6,
    SslKey = 7,
}

/// Number of watch slots.
pub const WATCH_SLOTS: usize = 8;

/// What happened to a watched file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEvent {
    /// Content or attributes changed
    Modified,
    /// A writer closed the file
    CloseWrite,
    /// The watch was invalidated; further events must be ignored
    Ignored,
}

/// Events feeding the hub's single dispatch loop.
#[derive(Debug)]
pub enum HubEvent {
    /// The listener accepted a socket and assigned an ephemeral identifier
    Accepted { id: u64, tx: Sender<ConnCmd> },
    /// An outgoing proxy connection is up and ready for its queue
    ProxyUp { id: u64, tx: Sender<ConnCmd> },
    /// An outgoing proxy connection could not be established
    ProxyFailed { id: u64 },
    /// Raw bytes arrived on a connection
    Received { id: u64, data: Bytes },
    /// A connection hit EOF or an IO error
    Closed { id: u64 },
    /// Periodic maintenance tick
    Tick,
    /// A watched file changed on disk
    File { slot: WatchSlot, event: FileEvent },
    /// Graceful shutdown (signal or operator request)
    Shutdown,
}
