//! Ports: the connection endpoints between processes.
//!
//! A `FilePort` carries information packets over bounded channels and can
//! fan in (a merger task drains all inbound channels into one local stream)
//! and fan out (a send writes to every outbound channel). A `ParamPort`
//! carries scalar string parameters over one channel shared between its two
//! endpoints.

use crate::config::DEFAULT_BUF_SIZE;
use crate::error::PortError;
use crate::ip::Ip;
use std::sync::Arc;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tracing::debug;
use uuid::Uuid;

/// Non-owning token identifying a port.
///
/// Packets carry one of these as a sub-stream back-reference; it never keeps
/// the port alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortId(Uuid);

impl PortId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

/// Bidirectional fan-in/fan-out rendezvous point between processes.
pub struct FilePort {
    id: PortId,
    capacity: usize,
    merged_tx: Option<Sender<Ip>>,
    merged_rx: Receiver<Ip>,
    in_chans: Vec<Receiver<Ip>>,
    out_chans: Vec<Sender<Ip>>,
    connected: bool,
}

impl FilePort {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUF_SIZE)
    }

    /// Port whose channels (including those created by `connect`) are
    /// bounded to `capacity`.
    pub fn with_capacity(capacity: usize) -> Self {
        let (merged_tx, merged_rx) = mpsc::channel(capacity);
        Self {
            id: PortId::new(),
            capacity,
            merged_tx: Some(merged_tx),
            merged_rx,
            in_chans: Vec::new(),
            out_chans: Vec::new(),
            connected: false,
        }
    }

    pub fn id(&self) -> PortId {
        self.id
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Wire this port to a remote one with two fresh channels, one in each
    /// direction. Which channel ends up used is decided by which process
    /// reads and which writes; connect time does not distinguish direction.
    pub fn connect(&mut self, remote: &mut FilePort) {
        let (in_tx, in_rx) = mpsc::channel(self.capacity);
        self.add_in_chan(in_rx);
        remote.add_out_chan(in_tx);

        let (out_tx, out_rx) = mpsc::channel(self.capacity);
        self.add_out_chan(out_tx);
        remote.add_in_chan(out_rx);

        self.connected = true;
        remote.connected = true;
    }

    /// Register an inbound channel directly, for processes that feed a port
    /// without a peer port.
    pub fn add_in_chan(&mut self, rx: Receiver<Ip>) {
        self.in_chans.push(rx);
    }

    /// Register an outbound channel directly.
    pub fn add_out_chan(&mut self, tx: Sender<Ip>) {
        self.out_chans.push(tx);
    }

    /// Send a packet to every subscriber, in subscription order.
    pub async fn send(&self, ip: Ip) -> Result<(), PortError> {
        for (i, tx) in self.out_chans.iter().enumerate() {
            debug!(subscriber = i, path = %ip.path(), "sending packet on out channel");
            tx.send(ip.clone())
                .await
                .map_err(|_| PortError::Disconnected(format!("out channel {i} receiver gone")))?;
        }
        Ok(())
    }

    /// Next packet from the merged input stream, or `None` once every
    /// inbound channel has closed and drained.
    pub async fn recv(&mut self) -> Option<Ip> {
        self.merged_rx.recv().await
    }

    /// Spawn the merger that drains all inbound channels into the merged
    /// stream. Must run once when the owning process starts; calling it
    /// again is a no-op.
    ///
    /// The merger round-robins over the inbound channels in registration
    /// order, prunes a channel when it closes and restarts the sweep, and
    /// closes the merged stream when the last inbound channel is gone.
    pub fn start_merger(&mut self) {
        let Some(merged) = self.merged_tx.take() else {
            return;
        };
        let mut inputs = std::mem::take(&mut self.in_chans);
        tokio::spawn(async move {
            'sweep: while !inputs.is_empty() {
                let mut idx = 0;
                while idx < inputs.len() {
                    match inputs[idx].recv().await {
                        Some(ip) => {
                            if merged.send(ip).await.is_err() {
                                // Port owner is gone; nothing left to feed.
                                return;
                            }
                            idx += 1;
                        }
                        None => {
                            inputs.remove(idx);
                            continue 'sweep;
                        }
                    }
                }
            }
            // Dropping `merged` closes the aggregate channel.
        });
    }

    /// Close every outbound channel. Call exactly once, when the owning
    /// process is done sending.
    pub fn close(&mut self) {
        debug!(channels = self.out_chans.len(), "closing out channels");
        self.out_chans.clear();
    }
}

impl Default for FilePort {
    fn default() -> Self {
        Self::new()
    }
}

/// The channel shared between two connected parameter ports. The sender
/// slot is shared so that either endpoint's `close` closes the channel for
/// every holder.
#[derive(Clone)]
struct ParamChannel {
    tx: Arc<std::sync::Mutex<Option<Sender<String>>>>,
    rx: Arc<tokio::sync::Mutex<Receiver<String>>>,
}

impl ParamChannel {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx: Arc::new(std::sync::Mutex::new(Some(tx))),
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        }
    }

    fn sender(&self) -> Option<Sender<String>> {
        self.tx.lock().expect("param channel lock poisoned").clone()
    }

    fn close(&self) {
        self.tx.lock().expect("param channel lock poisoned").take();
    }

    fn same_channel(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.tx, &other.tx)
    }
}

/// Scalar string-valued port.
pub struct ParamPort {
    capacity: usize,
    chan: Option<ParamChannel>,
    connected: bool,
}

impl ParamPort {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUF_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            chan: None,
            connected: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Share one channel between this port and `other`.
    ///
    /// If neither side has a channel yet, a new one is created and shared;
    /// if exactly one side has one, the other side adopts it; if both sides
    /// already have one the connect is ambiguous and fails.
    pub fn connect(&mut self, other: &mut ParamPort) -> Result<(), PortError> {
        match (&self.chan, &other.chan) {
            (Some(_), Some(_)) => return Err(PortError::AmbiguousParamConnect),
            (Some(chan), None) => {
                debug!("local param port has a channel, sharing it with the other");
                other.chan = Some(chan.clone());
            }
            (None, Some(chan)) => {
                debug!("other param port has a channel, adopting it locally");
                self.chan = Some(chan.clone());
            }
            (None, None) => {
                debug!("neither param port has a channel, creating one for both");
                let chan = ParamChannel::new(self.capacity);
                self.chan = Some(chan.clone());
                other.chan = Some(chan);
            }
        }
        self.connected = true;
        other.connected = true;
        Ok(())
    }

    /// Connect this port to a literal value sequence: a producer task sends
    /// each value in order, then closes the channel.
    pub fn connect_literals<I, S>(&mut self, values: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let chan = ParamChannel::new(self.capacity);
        self.chan = Some(chan.clone());
        self.connected = true;
        let values: Vec<String> = values.into_iter().map(Into::into).collect();
        tokio::spawn(async move {
            for value in values {
                let Some(tx) = chan.sender() else {
                    return;
                };
                if tx.send(value).await.is_err() {
                    return;
                }
            }
            chan.close();
        });
    }

    pub async fn send(&self, value: impl Into<String>) -> Result<(), PortError> {
        let Some(chan) = &self.chan else {
            return Err(PortError::Disconnected(
                "parameter port has no channel".to_string(),
            ));
        };
        let Some(tx) = chan.sender() else {
            return Err(PortError::Disconnected(
                "parameter channel already closed".to_string(),
            ));
        };
        tx.send(value.into())
            .await
            .map_err(|_| PortError::Disconnected("parameter receiver gone".to_string()))
    }

    /// Next parameter value, or `None` when the channel is closed and
    /// drained (an unconnected port reads as closed).
    pub async fn recv(&self) -> Option<String> {
        let chan = self.chan.as_ref()?;
        let mut rx = chan.rx.lock().await;
        rx.recv().await
    }

    /// Close the shared channel for every endpoint holding it.
    pub fn close(&mut self) {
        if let Some(chan) = &self.chan {
            chan.close();
        }
    }

    /// Whether this port and `other` hold the same underlying channel.
    pub fn shares_channel_with(&self, other: &ParamPort) -> bool {
        matches!(
            (&self.chan, &other.chan),
            (Some(a), Some(b)) if a.same_channel(b)
        )
    }
}

impl Default for ParamPort {
    fn default() -> Self {
        Self::new()
    }
}
