//! Client for the master's operator socket.

use std::path::Path;

use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio_util::codec::Framed;

use drover_core::proto::{FrameCodec, OperatorRequest, OperatorResponse};
use drover_core::{Error, Result};

/// One connection to the operator socket.
pub struct OperatorClient {
    framed: Framed<UnixStream, FrameCodec>,
}

impl OperatorClient {
    /// Connects to the operator socket.
    ///
    /// # Errors
    ///
    /// Returns `unavailable` when the socket cannot be reached — the
    /// usual cause is a master that is not running.
    pub async fn connect(socket: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket).await.map_err(|e| {
            Error::unavailable(format!(
                "connect {}: {e} (is drover-master running?)",
                socket.display()
            ))
        })?;
        Ok(Self {
            framed: Framed::new(stream, FrameCodec::new()),
        })
    }

    /// Sends one request and awaits its response frame.
    ///
    /// A tag-0 error envelope is surfaced as the carried [`Error`], so
    /// callers only ever see the success variants.
    ///
    /// # Errors
    ///
    /// Returns the server-side error, or `unavailable` when the stream
    /// breaks mid-exchange.
    pub async fn request(&mut self, request: OperatorRequest) -> Result<OperatorResponse> {
        self.framed
            .send(request.encode())
            .await
            .map_err(|e| Error::unavailable(format!("send request: {e}")))?;

        let Some(frame) = self.framed.next().await else {
            return Err(Error::unavailable("master closed the operator socket"));
        };
        let frame = frame.map_err(|e| Error::unavailable(format!("read response: {e}")))?;
        match OperatorResponse::decode(&frame)? {
            OperatorResponse::Error(err) => Err(err.into()),
            response => Ok(response),
        }
    }
}
