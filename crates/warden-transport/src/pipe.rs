//! In-process point-to-point transport.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::adapter::{FrameSink, FrameSource, InboundFrame};
use crate::errors::TransportError;

/// Sending half of a [`pipe`].
#[derive(Clone, Debug)]
pub struct PipeSink {
    tx: mpsc::UnboundedSender<String>,
}

/// Receiving half of a [`pipe`].
#[derive(Debug)]
pub struct PipeSource {
    rx: mpsc::UnboundedReceiver<String>,
}

impl FrameSink for PipeSink {
    fn send(&self, text: String) -> Result<(), TransportError> {
        self.tx.send(text).map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl FrameSource for PipeSource {
    async fn next_frame(&mut self) -> Option<InboundFrame> {
        self.rx.recv().await.map(InboundFrame::direct)
    }
}

/// One-directional in-process pipe. Wire two of them crosswise for a duplex
/// link (see [`duplex`]).
pub fn pipe() -> (PipeSink, PipeSource) {
    let (tx, rx) = mpsc::unbounded_channel();
    (PipeSink { tx }, PipeSource { rx })
}

/// Two connected endpoints: whatever one end sends, the other receives.
pub fn duplex() -> ((PipeSink, PipeSource), (PipeSink, PipeSource)) {
    let (a_tx, b_rx) = pipe();
    let (b_tx, a_rx) = pipe();
    ((a_tx, a_rx), (b_tx, b_rx))
}
