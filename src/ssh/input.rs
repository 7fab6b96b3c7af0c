//! Client-to-stdin queue for one channel.
//!
//! russh delivers the data of every channel on a connection through a single
//! handler loop, so the handler must never wait on one channel's process. The
//! queue therefore accepts input without blocking and instead counts the bytes
//! it holds. Once a channel has more than its budget waiting, the queue
//! refuses further input and fires its overflow token; the bridge watches that
//! token and aborts the channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::error::{Error, Result};

/// Create a queue that holds at most `limit` bytes waiting for the process.
pub fn input_queue(limit: usize) -> (InputSender, InputReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let pending = Arc::new(AtomicUsize::new(0));
    let overflow = CancellationToken::new();

    let sender = InputSender {
        tx,
        pending: Arc::clone(&pending),
        limit,
        overflow: overflow.clone(),
    };
    let receiver = InputReceiver {
        rx,
        pending,
        overflow,
    };
    (sender, receiver)
}

/// Handler side of the queue. Dropping every sender closes the child's stdin.
#[derive(Debug, Clone)]
pub struct InputSender {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    pending: Arc<AtomicUsize>,
    limit: usize,
    overflow: CancellationToken,
}

impl InputSender {
    /// Queue `data` for the process without waiting.
    ///
    /// # Errors
    ///
    /// * `Error::InputOverflow` - more than the budget would be waiting; the
    ///   overflow token has fired and the queue accepts nothing more
    /// * `Error::ChannelClosed` - the process side is gone
    pub fn push(&self, data: &[u8]) -> Result<()> {
        if self.overflow.is_cancelled() {
            return Err(Error::InputOverflow { limit: self.limit });
        }

        let pending = self.pending.fetch_add(data.len(), Ordering::SeqCst) + data.len();
        if pending > self.limit {
            self.overflow.cancel();
            return Err(Error::InputOverflow { limit: self.limit });
        }

        self.tx.send(data.to_vec()).map_err(|_| {
            self.pending.fetch_sub(data.len(), Ordering::SeqCst);
            Error::ChannelClosed
        })
    }

    /// Bytes queued but not yet taken by the process.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

/// Bridge side of the queue.
#[derive(Debug)]
pub struct InputReceiver {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    pending: Arc<AtomicUsize>,
    overflow: CancellationToken,
}

impl InputReceiver {
    /// Next chunk in arrival order, or `None` once every sender is dropped.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        let chunk = self.rx.recv().await?;
        self.pending.fetch_sub(chunk.len(), Ordering::SeqCst);
        Some(chunk)
    }

    /// Token that fires when the sender exceeded the budget.
    pub fn overflow_signal(&self) -> CancellationToken {
        self.overflow.clone()
    }
}
