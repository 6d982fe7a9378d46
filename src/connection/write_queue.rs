// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{io::ErrorKind, sync::Mutex};

use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::{Notify, watch},
};

use crate::error::ConnectionError;

/// Where the outbound buffer stands after a flush pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushEvent {
    /// Nothing was buffered.
    Idle,
    /// The buffer emptied; the drain boundary (if any) resolved.
    Drained,
    /// The buffer emptied and a close-after write was pending: shut the
    /// socket down and close the connection.
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrainState {
    Pending,
    Flushed,
    Disconnected,
}

enum DrainInner {
    Ready,
    Failed,
    Waiting(watch::Receiver<DrainState>),
}

/// Completion handle for the NEXT drain boundary of a [`WriteQueue`].
///
/// Every `write` issued while a boundary is outstanding observes the SAME
/// boundary; awaiting it blocks until the buffer next empties, which is the
/// body backpressure signal drivers rely on.
pub struct Drain(DrainInner);

impl Drain {
    pub(crate) fn ready() -> Self {
        Self(DrainInner::Ready)
    }

    pub(crate) fn failed() -> Self {
        Self(DrainInner::Failed)
    }

    /// Completed without waiting: nothing was buffered behind this handle.
    pub fn is_ready(&self) -> bool {
        matches!(self.0, DrainInner::Ready)
    }

    /// Resolves when the buffer empties; fails with
    /// [`ConnectionError::Disconnected`] when the peer is gone or the
    /// connection closed underneath the pending bytes.
    pub async fn wait(self) -> Result<(), ConnectionError> {
        let mut rx = match self.0 {
            DrainInner::Ready => return Ok(()),
            DrainInner::Failed => return Err(ConnectionError::Disconnected),
            DrainInner::Waiting(rx) => rx,
        };
        loop {
            match *rx.borrow_and_update() {
                DrainState::Flushed => return Ok(()),
                DrainState::Disconnected => return Err(ConnectionError::Disconnected),
                DrainState::Pending => {},
            }
            if rx.changed().await.is_err() {
                // Sender dropped without a final state: the queue died.
                return Err(ConnectionError::Disconnected);
            }
        }
    }
}

#[derive(Default)]
struct QueueInner {
    buf: BytesMut,
    drain: Option<watch::Sender<DrainState>>,
    close_after: bool,
    write_closed: bool,
    disconnected: bool,
}

/// Single-connection outbound buffer with one outstanding drain waiter.
///
/// Producers append through [`write`](Self::write) from any task; the
/// connection's I/O task is the only consumer and drives
/// [`flush`](Self::flush) whenever [`writable`](Self::writable) wakes it.
#[derive(Default)]
pub struct WriteQueue {
    inner: Mutex<QueueInner>,
    wake: Notify,
}

impl WriteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `bytes` and returns the current drain boundary.
    ///
    /// `close_after` marks the queue write-closed: later writes fail, and
    /// once this boundary resolves the connection shuts the socket down and
    /// closes. Writing to a write-closed or disconnected queue fails the
    /// returned handle immediately.
    pub fn write(&self, bytes: &[u8], close_after: bool) -> Drain {
        let rx = {
            let mut q = self.inner.lock().expect("write queue lock poisoned");
            if q.write_closed || q.disconnected {
                return Drain::failed();
            }
            q.buf.extend_from_slice(bytes);
            if close_after {
                q.write_closed = true;
                q.close_after = true;
            }
            if q.buf.is_empty() && q.drain.is_none() && !q.close_after {
                return Drain::ready();
            }
            match &q.drain {
                Some(tx) => tx.subscribe(),
                None => {
                    let (tx, rx) = watch::channel(DrainState::Pending);
                    q.drain = Some(tx);
                    rx
                },
            }
        };
        self.wake.notify_one();
        Drain(DrainInner::Waiting(rx))
    }

    /// The outstanding drain boundary, if one exists.
    pub fn pending_drain(&self) -> Option<Drain> {
        let q = self.inner.lock().expect("write queue lock poisoned");
        q.drain
            .as_ref()
            .map(|tx| Drain(DrainInner::Waiting(tx.subscribe())))
    }

    /// Bytes currently buffered. The flusher is runnable iff this is
    /// non-zero.
    pub fn pending_bytes(&self) -> usize {
        self.inner
            .lock()
            .expect("write queue lock poisoned")
            .buf
            .len()
    }

    pub fn is_write_closed(&self) -> bool {
        let q = self.inner.lock().expect("write queue lock poisoned");
        q.write_closed || q.disconnected
    }

    /// Wakes when a producer appended bytes.
    pub(crate) async fn writable(&self) {
        self.wake.notified().await;
    }

    /// Writes buffered bytes to `io` until the buffer is observed empty,
    /// then resolves the drain boundary. Any I/O failure (including a
    /// zero-byte write at EOF) marks the peer gone and fails the boundary.
    pub async fn flush<W>(&self, io: &mut W) -> Result<FlushEvent, ConnectionError>
    where W: AsyncWrite + Unpin {
        enum Step {
            Done(FlushEvent),
            Chunk(Bytes),
        }

        let mut wrote = false;
        loop {
            let step = {
                let mut q = self.inner.lock().expect("write queue lock poisoned");
                if q.disconnected {
                    return Err(ConnectionError::Disconnected);
                }
                if q.buf.is_empty() {
                    if let Some(tx) = q.drain.take() {
                        let _ = tx.send(DrainState::Flushed);
                    }
                    Step::Done(if q.close_after {
                        FlushEvent::Shutdown
                    } else if wrote {
                        FlushEvent::Drained
                    } else {
                        FlushEvent::Idle
                    })
                } else {
                    Step::Chunk(q.buf.split().freeze())
                }
            };

            match step {
                Step::Done(event) => return Ok(event),
                Step::Chunk(chunk) => match io.write_all(&chunk).await {
                    Ok(()) => wrote = true,
                    Err(err) => {
                        self.mark_disconnected();
                        return Err(match err.kind() {
                            ErrorKind::WriteZero => ConnectionError::Disconnected,
                            _ => ConnectionError::Io(err),
                        });
                    },
                },
            }
        }
    }

    /// Drops buffered bytes, fails the outstanding drain boundary, and
    /// rejects all future writes. Called on peer loss and on `close()`.
    pub(crate) fn mark_disconnected(&self) {
        let mut q = self.inner.lock().expect("write queue lock poisoned");
        q.disconnected = true;
        q.buf.clear();
        if let Some(tx) = q.drain.take() {
            let _ = tx.send(DrainState::Disconnected);
        }
    }
}

impl std::fmt::Debug for WriteQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let q = self.inner.lock().expect("write queue lock poisoned");
        f.debug_struct("WriteQueue")
            .field("pending_bytes", &q.buf.len())
            .field("drain_outstanding", &q.drain.is_some())
            .field("write_closed", &q.write_closed)
            .field("disconnected", &q.disconnected)
            .finish()
    }
}
