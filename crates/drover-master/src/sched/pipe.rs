//! Per-connection state machine for one attached minion.
//!
//! A pipe owns the receive direction of one dispatch stream and pushes
//! every inbound frame into the scheduler's message channel as a
//! [`PipeMessage`]. The send direction encrypts outgoing call requests
//! under the minion's public key. A pipe never retries; resurrection is
//! the minion's responsibility.

use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use drover_core::crypto::{self, RsaPair, RsaPublicKey};
use drover_core::proto::{CallFrame, ConnectResponse, DispatchFrame, EventType, FrameCodec};
use drover_core::{CallRequest, CallResponse, Error, Result};

/// Framed dispatch stream as accepted by the server.
pub type DispatchFramed = Framed<TcpStream, FrameCodec>;
/// Write half of a split dispatch stream.
pub type FrameSink = SplitSink<DispatchFramed, Bytes>;
/// Read half of a split dispatch stream.
pub type FrameStream = SplitStream<DispatchFramed>;

/// What a pipe reports to the scheduler's event loop.
#[derive(Debug)]
pub(crate) struct PipeMessage {
    /// Call id, 0 for lifecycle messages.
    pub id: u64,
    /// Owning minion name.
    pub name: String,
    /// True when the pipe terminated and must be removed.
    pub done: bool,
    /// Receive-path failure, if any.
    pub err: Option<Error>,
    /// A decoded call response.
    pub call: Option<CallResponse>,
}

/// Master-side end of one live minion stream.
pub struct Pipe {
    name: String,
    ip: String,
    groups: Vec<String>,
    master_keys: Arc<RsaPair>,
    minion_key: RsaPublicKey,
    writer: Mutex<FrameSink>,
    mch: mpsc::Sender<PipeMessage>,
    stop_tx: watch::Sender<bool>,
}

impl Pipe {
    pub(crate) fn new(
        name: String,
        ip: String,
        groups: Vec<String>,
        master_keys: Arc<RsaPair>,
        minion_key: RsaPublicKey,
        sink: FrameSink,
        mch: mpsc::Sender<PipeMessage>,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            name,
            ip,
            groups,
            master_keys,
            minion_key,
            writer: Mutex::new(sink),
            mch,
            stop_tx,
        }
    }

    /// The owning minion name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The cached peer address.
    #[must_use]
    pub fn ip(&self) -> &str {
        &self.ip
    }

    /// The cached host groups.
    #[must_use]
    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    /// Encrypts and sends a call request to the minion.
    ///
    /// # Errors
    ///
    /// Returns `internal` on crypto failures and `unavailable` when the
    /// stream is gone.
    pub async fn send(&self, call: &CallRequest) -> Result<()> {
        let plain = call.to_msgpack()?;
        let data = crypto::encrypt(&self.minion_key, &plain)?;
        let frame = DispatchFrame::call(CallFrame {
            id: call.id,
            data,
            error: String::new(),
        });
        self.send_frame(frame).await
    }

    /// Sends the connect reply that completes the handshake.
    ///
    /// # Errors
    ///
    /// Returns `unavailable` when the stream is gone.
    pub async fn send_connect_reply(&self, reply: ConnectResponse) -> Result<()> {
        self.send_frame(DispatchFrame::connect_reply(reply)).await
    }

    async fn send_frame(&self, frame: DispatchFrame) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer
            .send(frame.encode_frame())
            .await
            .map_err(|e| Error::unavailable(format!("send to {}: {e}", self.name)))
    }

    /// Stops the receive loop without emitting a removal message. Used
    /// when the scheduler itself is tearing the pipe down.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Receive loop: runs until stream EOF, receive error, or an
    /// explicit [`stop`](Self::stop).
    ///
    /// Every terminating path except `stop` emits a final
    /// `{name, done: true}` message so the scheduler can drop the pipe
    /// and stamp the minion offline.
    pub async fn run(self: Arc<Self>, mut stream: FrameStream) {
        let mut stop_rx = self.stop_tx.subscribe();
        loop {
            tokio::select! {
                _ = stop_rx.changed() => {
                    debug!(minion = %self.name, "pipe stopped");
                    return;
                }
                frame = stream.next() => match frame {
                    None => {
                        self.emit_done(None).await;
                        return;
                    }
                    Some(Err(e)) => {
                        self.emit_done(Some(Error::unavailable(format!(
                            "receive from {}: {e}",
                            self.name
                        ))))
                        .await;
                        return;
                    }
                    Some(Ok(payload)) => self.handle_frame(&payload).await,
                },
            }
        }
    }

    async fn handle_frame(&self, payload: &[u8]) {
        let frame = match DispatchFrame::decode_frame(payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(minion = %self.name, error = %e, "undecodable frame");
                return;
            }
        };

        if frame.event_type() != EventType::Call {
            debug!(minion = %self.name, "unexpected connect frame mid-stream");
            return;
        }
        let Some(call) = frame.call else {
            return;
        };

        if !call.error.is_empty() {
            // Minion-side decode or policy refusal.
            self.emit(PipeMessage {
                id: call.id,
                name: self.name.clone(),
                done: false,
                err: Some(Error::internal(call.error)),
                call: None,
            })
            .await;
            return;
        }

        let message = match self
            .master_keys
            .decrypt(&call.data)
            .and_then(|plain| CallResponse::from_msgpack(&plain))
        {
            Ok(response) => PipeMessage {
                id: call.id,
                name: self.name.clone(),
                done: false,
                err: None,
                call: Some(response),
            },
            Err(e) => PipeMessage {
                id: call.id,
                name: self.name.clone(),
                done: false,
                err: Some(e),
                call: None,
            },
        };
        self.emit(message).await;
    }

    async fn emit_done(&self, err: Option<Error>) {
        self.emit(PipeMessage {
            id: 0,
            name: self.name.clone(),
            done: true,
            err,
            call: None,
        })
        .await;
    }

    async fn emit(&self, message: PipeMessage) {
        if self.mch.send(message).await.is_err() {
            debug!(minion = %self.name, "scheduler channel closed");
        }
    }
}
