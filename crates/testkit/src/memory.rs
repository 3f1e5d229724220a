//! In-process transport pair.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tickwire_net::{CloseReason, Transport, TransportError};
use tokio::sync::{mpsc, Mutex};

enum Packet {
    Frame(Vec<u8>),
    Close(CloseReason),
}

/// One end of an in-memory frame pipe.
pub struct MemoryTransport {
    label: String,
    tx: mpsc::UnboundedSender<Packet>,
    rx: Mutex<mpsc::UnboundedReceiver<Packet>>,
    closed: AtomicBool,
    max_frame: Option<usize>,
}

impl MemoryTransport {
    /// Connected `(server, client)` ends.
    pub fn pair() -> (Self, Self) {
        Self::build(None)
    }

    /// Connected ends whose `send` refuses frames over `max_frame` bytes.
    pub fn pair_with_limit(max_frame: usize) -> (Self, Self) {
        Self::build(Some(max_frame))
    }

    fn build(max_frame: Option<usize>) -> (Self, Self) {
        let (to_client, from_server) = mpsc::unbounded_channel();
        let (to_server, from_client) = mpsc::unbounded_channel();
        let server = Self {
            label: "memory-client".into(),
            tx: to_client,
            rx: Mutex::new(from_client),
            closed: AtomicBool::new(false),
            max_frame,
        };
        let client = Self {
            label: "memory-server".into(),
            tx: to_server,
            rx: Mutex::new(from_server),
            closed: AtomicBool::new(false),
            max_frame,
        };
        (server, client)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed { reason: None });
        }
        if let Some(max) = self.max_frame.filter(|max| frame.len() > *max) {
            return Err(TransportError::FrameTooLarge {
                len: frame.len(),
                max,
            });
        }
        self.tx
            .send(Packet::Frame(frame))
            .map_err(|_| TransportError::Closed { reason: None })
    }

    async fn receive(&self) -> Result<Vec<u8>, TransportError> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(Packet::Frame(frame)) => Ok(frame),
            Some(Packet::Close(reason)) => {
                self.closed.store(true, Ordering::Release);
                Err(TransportError::Closed {
                    reason: Some(reason),
                })
            }
            None => {
                self.closed.store(true, Ordering::Release);
                Err(TransportError::Closed { reason: None })
            }
        }
    }

    async fn close(&self, reason: &CloseReason) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.tx.send(Packet::Close(reason.clone()));
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn peer(&self) -> String {
        self.label.clone()
    }

    fn max_frame_len(&self) -> Option<usize> {
        self.max_frame
    }
}
