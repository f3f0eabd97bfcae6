//! The single live connection of a role.
//!
//! A ready [`Session`] owns a reader task that feeds bounded chunks through
//! the line codec and a writer task draining an outbound command queue into
//! a `FramedWrite`. Both tasks are aborted when the session is dropped.

use bytes::BytesMut;
use futures::SinkExt;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc;
use tokio_util::codec::FramedWrite;
use tracing::{debug, trace, warn};

use crate::codec::{self, LineCodec};
use crate::error::SyncError;
use crate::message::Command;
use crate::state::{FailureKind, FailureReason};
use crate::task::TaskGuard;

/// Bytes requested per socket read.
pub const READ_CHUNK_SIZE: usize = 512;

/// What a session reports back to the network context.
#[derive(Debug)]
pub(crate) enum SessionEvent {
    Inbound(Command),
    Closed(FailureReason),
}

/// Callback through which a session reports, tagged by the owner.
pub(crate) type SessionSink = Box<dyn Fn(SessionEvent) + Send + Sync + 'static>;

/// An established connection.
#[derive(Debug)]
pub(crate) struct Session {
    id: u64,
    peer_name: String,
    outbound: mpsc::UnboundedSender<Command>,
    _reader: TaskGuard,
    _writer: TaskGuard,
}

impl Session {
    /// Take ownership of `stream` and start the receive loop.
    pub(crate) fn start(id: u64, peer_name: String, stream: TcpStream, sink: SessionSink) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("session {id}: set_nodelay failed: {e}");
        }
        let (read_half, write_half) = stream.into_split();
        let (outbound, mut queue) = mpsc::unbounded_channel::<Command>();

        let writer = TaskGuard::spawn("session-writer", async move {
            let mut framed = FramedWrite::new(write_half, LineCodec::new());
            while let Some(command) = queue.recv().await {
                if let Err(e) = framed.send(command).await {
                    // The reader sees the broken socket and reports it.
                    debug!("session {id}: write failed: {e}");
                    break;
                }
            }
        });

        let reader = TaskGuard::spawn("session-reader", async move {
            let reason = receive_loop(id, read_half, &sink).await;
            sink(SessionEvent::Closed(reason));
        });

        Self {
            id,
            peer_name,
            outbound,
            _reader: reader,
            _writer: writer,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn peer_name(&self) -> &str {
        &self.peer_name
    }

    /// Queue `command` for the writer. Never blocks; drops silently once
    /// the writer has gone away.
    pub(crate) fn send(&self, command: Command) {
        if self.outbound.send(command).is_err() {
            trace!("session {}: writer gone, dropping {command}", self.id);
        }
    }
}

async fn receive_loop(id: u64, mut socket: OwnedReadHalf, sink: &SessionSink) -> FailureReason {
    let mut pending = BytesMut::with_capacity(READ_CHUNK_SIZE);
    let mut chunk = [0u8; READ_CHUNK_SIZE];
    loop {
        match socket.read(&mut chunk).await {
            Ok(0) => {
                debug!("session {id}: peer closed the connection");
                return FailureReason::new(FailureKind::Socket, "Connection closed by peer");
            }
            Ok(n) => {
                pending.extend_from_slice(&chunk[..n]);
                for command in codec::decode(&mut pending) {
                    trace!("session {id}: received {command}");
                    sink(SessionEvent::Inbound(command));
                }
            }
            Err(e) => {
                warn!("session {id}: read failed: {e}");
                return SyncError::Socket(e.to_string()).failure_reason();
            }
        }
    }
}
