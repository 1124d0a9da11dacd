//! TCP dispatch listener.
//!
//! One accept loop; each connection gets its own task that performs the
//! `Connect` handshake, attaches the stream through the scheduler, and
//! then drives the pipe's receive loop until the minion goes away.
//!
//! The handshake is mandatory and authenticated: the first frame must be
//! a `Connect` carrying the minion identity, its public key, and a
//! signature over the canonical identity bytes. A connection that cannot
//! prove possession of the presented key never reaches the trust store.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use drover_core::proto::{
    connect_proof_bytes, ConnectResponse, DispatchFrame, EventType, FrameCodec, MinionRecord,
};
use drover_core::{crypto, Error, Minion, Result};

use crate::keystore::Keystore;
use crate::sched::{AttachOutcome, DispatchFramed, Scheduler};

/// Runs the dispatch listener until `shutdown` flips.
///
/// # Errors
///
/// Returns `internal` when the listener itself fails; per-connection
/// failures are logged and do not stop the loop.
pub async fn run(
    listener: TcpListener,
    sched: Arc<Scheduler>,
    store: Arc<Keystore>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "dispatch listener running");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("dispatch listener stopped");
                return Ok(());
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let sched = Arc::clone(&sched);
                        let store = Arc::clone(&store);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, peer, sched, store).await {
                                debug!(%peer, error = %e, "dispatch connection ended");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "accept dispatch connection"),
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    sched: Arc<Scheduler>,
    store: Arc<Keystore>,
) -> Result<()> {
    let mut framed = Framed::new(stream, FrameCodec::new());

    let Some(first) = framed.next().await else {
        return Ok(()); // closed before the handshake
    };
    let payload = first.map_err(|e| Error::unavailable(format!("handshake read: {e}")))?;
    let frame = DispatchFrame::decode_frame(&payload)?;

    let connect = match (frame.event_type(), frame.connect) {
        (EventType::Connect, Some(connect)) => connect,
        _ => {
            return refuse(
                &mut framed,
                &Error::bad_request("first frame must be a connect request"),
            )
            .await;
        }
    };
    let Some(record) = connect.minion else {
        return refuse(&mut framed, &Error::bad_request("connect without identity")).await;
    };

    // Proof of possession for the presented key, before any trust-store
    // write happens for this name.
    let proof = connect_proof_bytes(&record, &connect.public_key);
    let verified = crypto::parse_public_pem(&connect.public_key)
        .and_then(|key| crypto::verify(&key, &proof, &connect.signature));
    if let Err(e) = verified {
        warn!(%peer, minion = %record.name, error = %e, "connect proof rejected");
        return refuse(&mut framed, &Error::unauthorized("connect proof rejected")).await;
    }

    let mut minion: Minion = record.into();
    if minion.ip.is_empty() {
        minion.ip = peer.ip().to_string();
    }

    match sched.add_stream(minion, &connect.public_key, framed) {
        AttachOutcome::Attached {
            pipe,
            stream,
            minion,
            ..
        } => {
            pipe.send_connect_reply(ConnectResponse {
                minion: Some(MinionRecord::from(&minion)),
                master_public_key: store.master_keys().public_pem().to_string(),
                error: String::new(),
                error_kind: String::new(),
            })
            .await?;
            pipe.run(stream).await;
            Ok(())
        }
        AttachOutcome::Refused { err, mut framed } => {
            warn!(%peer, error = %err, "attach refused");
            refuse(&mut framed, &err).await
        }
    }
}

async fn refuse(framed: &mut DispatchFramed, err: &Error) -> Result<()> {
    let reply = DispatchFrame::connect_reply(ConnectResponse {
        minion: None,
        master_public_key: String::new(),
        error: err.detail.clone(),
        error_kind: err.kind().as_str().to_string(),
    });
    framed
        .send(reply.encode_frame())
        .await
        .map_err(|e| Error::unavailable(format!("send refusal: {e}")))
}
