//! Coordinator control link.
//!
//! Workers report endpoint progress to the coordinator with two
//! acknowledgements: READY once the endpoint is published and FINISHED once
//! the stream is drained (or the endpoint is being torn down). The link is
//! also how a worker notices the coordinator went away: a dead link cancels
//! every wait it takes part in.
//!
//! Ack payloads are postcard-encoded so they can travel over any byte
//! transport; [`ack_channel`] is the in-process transport.

use std::fmt;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use facet::Facet;
use tokio::sync::mpsc;

use crate::error::EndpointError;

/// Kind of acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Facet)]
#[repr(u8)]
pub enum AckKind {
    /// The endpoint is published and can be retrieved from.
    Ready,
    /// The endpoint finished streaming (or is shutting down).
    Finished,
}

impl AckKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "ENDPOINT_READY",
            Self::Finished => "ENDPOINT_FINISHED",
        }
    }
}

impl fmt::Display for AckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Acknowledgement sent from a worker to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct EndpointAck {
    pub kind: AckKind,
    pub worker: u32,
    pub endpoint: String,
}

impl EndpointAck {
    pub fn encode(&self) -> Result<Vec<u8>, EndpointError> {
        facet_postcard::to_vec(self).map_err(|e| EndpointError::Coordinator(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EndpointError> {
        facet_postcard::from_slice(bytes).map_err(|e| EndpointError::Coordinator(e.to_string()))
    }
}

/// Worker-side handle on the coordinator connection.
pub trait CoordinatorLink: Send + Sync {
    /// Deliver an acknowledgement. Fails if the coordinator is gone.
    fn send_ack(&self, ack: EndpointAck) -> Result<(), EndpointError>;

    /// Whether the coordinator is still there.
    fn is_alive(&self) -> bool;
}

/// Cheap liveness check of an underlying connection.
pub trait ConnectionProbe: Send + Sync {
    fn is_connected(&self) -> bool;
}

/// Probes a connected socket without consuming data.
///
/// A zero-length peek means the peer closed; `EAGAIN` means the connection
/// is idle but alive.
#[derive(Debug)]
pub struct SocketProbe {
    fd: RawFd,
}

impl SocketProbe {
    /// The socket must stay open for as long as the probe is used.
    pub fn new(socket: &impl AsRawFd) -> Self {
        Self {
            fd: socket.as_raw_fd(),
        }
    }
}

impl ConnectionProbe for SocketProbe {
    fn is_connected(&self) -> bool {
        let mut byte = 0u8;
        // SAFETY: one-byte buffer on the stack; MSG_PEEK leaves the data in place.
        let n = unsafe {
            libc::recv(
                self.fd,
                (&mut byte as *mut u8).cast(),
                1,
                libc::MSG_PEEK | libc::MSG_DONTWAIT,
            )
        };
        if n > 0 {
            return true;
        }
        if n == 0 {
            return false;
        }
        let err = std::io::Error::last_os_error();
        matches!(
            err.kind(),
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
        )
    }
}

/// Create an in-process ack channel.
pub fn ack_channel() -> (AckCollector, ChannelLink) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        AckCollector {
            rx,
            buffered: Vec::new(),
        },
        ChannelLink {
            tx,
            worker: 0,
            probe: None,
        },
    )
}

/// Worker end of an [`ack_channel`].
#[derive(Clone)]
pub struct ChannelLink {
    tx: mpsc::UnboundedSender<EndpointAck>,
    worker: u32,
    probe: Option<Arc<dyn ConnectionProbe>>,
}

impl ChannelLink {
    /// Same channel, stamping acks with `worker`.
    pub fn for_worker(&self, worker: u32) -> Self {
        Self {
            worker,
            ..self.clone()
        }
    }

    /// Also require `probe` to report the connection as up.
    pub fn with_probe(mut self, probe: Arc<dyn ConnectionProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn worker(&self) -> u32 {
        self.worker
    }
}

impl CoordinatorLink for ChannelLink {
    fn send_ack(&self, mut ack: EndpointAck) -> Result<(), EndpointError> {
        ack.worker = self.worker;
        tracing::debug!(kind = %ack.kind, endpoint = %ack.endpoint, worker = ack.worker, "sending ack");
        self.tx
            .send(ack)
            .map_err(|_| EndpointError::Coordinator("coordinator is gone".into()))
    }

    fn is_alive(&self) -> bool {
        !self.tx.is_closed() && self.probe.as_ref().is_none_or(|p| p.is_connected())
    }
}

impl fmt::Debug for ChannelLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelLink")
            .field("worker", &self.worker)
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Coordinator end of an [`ack_channel`].
#[derive(Debug)]
pub struct AckCollector {
    rx: mpsc::UnboundedReceiver<EndpointAck>,
    /// Acks of the other kind that arrived while waiting.
    buffered: Vec<EndpointAck>,
}

impl AckCollector {
    /// Wait until `expected` READY acks arrived.
    pub async fn wait_ready(
        &mut self,
        expected: usize,
        timeout: Duration,
    ) -> Result<Vec<EndpointAck>, EndpointError> {
        self.wait_for(AckKind::Ready, expected, timeout).await
    }

    /// Wait until `expected` FINISHED acks arrived.
    pub async fn wait_finished(
        &mut self,
        expected: usize,
        timeout: Duration,
    ) -> Result<Vec<EndpointAck>, EndpointError> {
        self.wait_for(AckKind::Finished, expected, timeout).await
    }

    async fn wait_for(
        &mut self,
        kind: AckKind,
        expected: usize,
        timeout: Duration,
    ) -> Result<Vec<EndpointAck>, EndpointError> {
        let (mut matched, rest): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.buffered)
                .into_iter()
                .partition(|a| a.kind == kind);
        self.buffered = rest;

        let deadline = tokio::time::Instant::now() + timeout;
        while matched.len() < expected {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(ack)) if ack.kind == kind => matched.push(ack),
                Ok(Some(ack)) => self.buffered.push(ack),
                Ok(None) => {
                    return Err(EndpointError::Coordinator(format!(
                        "all workers hung up after {} of {} {} acks",
                        matched.len(),
                        expected,
                        kind
                    )));
                }
                Err(_) => {
                    tracing::warn!(%kind, got = matched.len(), expected, "timed out waiting for acks");
                    return Err(EndpointError::Timeout);
                }
            }
        }
        if matched.len() > expected {
            self.buffered.extend(matched.split_off(expected));
        }
        tracing::debug!(%kind, count = expected, "acks collected");
        Ok(matched)
    }

    /// Drain acks that already arrived without waiting.
    pub fn try_collect(&mut self) -> Vec<EndpointAck> {
        let mut acks = std::mem::take(&mut self.buffered);
        while let Ok(ack) = self.rx.try_recv() {
            acks.push(ack);
        }
        acks
    }
}
