//! A connected client session.
//!
//! The session itself is just the cheap, thread-safe half: the character
//! id, an open flag, and the outgoing frame queue. The writer task that
//! drains the queue (enciphering and writing each frame) is spawned by the
//! server when the socket is accepted; rooms and maps never touch the
//! socket. Ordering is the queue order, so a shutdown still flushes every
//! frame queued before it.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::task::JoinHandle;
use tracing::debug;

use grove_protocol::EncryptContext;

pub enum WriteRequest {
    Frame(Bytes),
    /// Signals once every previously queued frame has hit the socket.
    Flush(tokio::sync::oneshot::Sender<()>),
    /// Terminates the writer after the queue ahead of it has drained.
    Close,
}

pub struct Session {
    id: AtomicU32,
    open: AtomicBool,
    outgoing: flume::Sender<WriteRequest>,
}

impl Session {
    /// Creates a session and the receiving end of its write queue.
    pub fn channel() -> (Arc<Self>, flume::Receiver<WriteRequest>) {
        let (tx, rx) = flume::unbounded();
        (
            Arc::new(Self {
                id: AtomicU32::new(0),
                open: AtomicBool::new(true),
                outgoing: tx,
            }),
            rx,
        )
    }

    /// The character id carried by the init packet. Zero until then.
    pub fn id(&self) -> u32 {
        self.id.load(Ordering::Relaxed)
    }

    pub fn set_id(&self, id: u32) {
        self.id.store(id, Ordering::Relaxed);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }

    /// Queues a packet payload. Writes after shutdown are silently dropped;
    /// the peer is already gone as far as the simulation is concerned.
    pub fn write(&self, packet: Bytes) {
        if self.is_open() {
            let _ = self.outgoing.send(WriteRequest::Frame(packet));
        }
    }

    /// Ends the session. Frames queued before this call still flush.
    pub fn shutdown(&self) {
        if self.open.swap(false, Ordering::Relaxed) {
            let _ = self.outgoing.send(WriteRequest::Close);
        }
    }

    /// Waits until everything queued so far has been written out. Used to
    /// drain the pipe before a cross-worker handoff.
    pub async fn flush(&self) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        if self.outgoing.send(WriteRequest::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

/// Drains a session's write queue into the socket, enciphering each frame.
pub fn spawn_writer(
    rx: flume::Receiver<WriteRequest>,
    mut enc: EncryptContext,
    mut socket: OwnedWriteHalf,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok(request) = rx.recv_async().await {
            match request {
                WriteRequest::Frame(payload) => {
                    let frame = enc.encrypt_frame(&payload);
                    if let Err(e) = socket.write_all(&frame).await {
                        debug!("error writing frame: {e}");
                        break;
                    }
                }
                WriteRequest::Flush(done) => {
                    let _ = socket.flush().await;
                    let _ = done.send(());
                }
                WriteRequest::Close => break,
            }
        }

        let _ = socket.shutdown().await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_after_shutdown_are_dropped() {
        let (session, rx) = Session::channel();
        session.write(Bytes::from_static(b"a"));
        session.shutdown();
        session.write(Bytes::from_static(b"b"));

        assert!(matches!(rx.try_recv(), Ok(WriteRequest::Frame(f)) if f[..] == *b"a"));
        assert!(matches!(rx.try_recv(), Ok(WriteRequest::Close)));
        assert!(rx.try_recv().is_err());
    }
}
