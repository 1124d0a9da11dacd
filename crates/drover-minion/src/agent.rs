//! The minion's connect/dispatch loop.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use drover_core::crypto::{self, RsaPair, RsaPublicKey};
use drover_core::proto::{
    connect_proof_bytes, CallFrame, ConnectRequest, DispatchFrame, EventType, FrameCodec,
    MinionRecord,
};
use drover_core::{
    CallRequest, CallResponse, Error, Minion, Result, ResultType, SelectionTarget,
};

use crate::config::MinionConfig;
use crate::runner;

const IDENTITY_FILE: &str = "identity.json";

/// Facts the minion refines incoming selections against.
struct Facts {
    name: String,
    ip: String,
    groups: Vec<String>,
    grains: HashMap<String, String>,
    pillars: HashMap<String, String>,
}

impl SelectionTarget for Facts {
    fn id(&self) -> &str {
        &self.name
    }
    fn ip(&self) -> &str {
        &self.ip
    }
    fn groups(&self) -> &[String] {
        &self.groups
    }
    fn grains(&self) -> &HashMap<String, String> {
        &self.grains
    }
    fn pillars(&self) -> &HashMap<String, String> {
        &self.pillars
    }
}

/// A minion agent: one identity, one key pair, one master.
pub struct Agent {
    cfg: MinionConfig,
    keys: RsaPair,
    identity: Minion,
    facts: Facts,
}

impl Agent {
    /// Builds the agent: loads or generates the key pair and assembles
    /// the identity record, reusing a previously persisted `uid`.
    ///
    /// # Errors
    ///
    /// Returns `bad-request` when no name can be derived and `internal`
    /// on key or filesystem failures.
    pub fn new(cfg: MinionConfig) -> Result<Self> {
        let keys = RsaPair::load_or_generate(&cfg.data_dir, "minion")?;

        let hostname = read_hostname();
        let name = if cfg.name.is_empty() {
            hostname.clone()
        } else {
            cfg.name.clone()
        };
        if name.is_empty() {
            return Err(Error::bad_request("minion name is empty and no hostname found"));
        }

        let persisted = load_identity(&cfg.data_dir);
        let identity = Minion {
            name: name.clone(),
            uid: persisted.map(|m| m.uid).unwrap_or_default(),
            hostname,
            ip: String::new(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            groups: cfg.groups.clone(),
            tags: cfg.grains.clone(),
            ..Minion::default()
        };

        let mut grains = identity.grains();
        grains.extend(cfg.grains.clone());
        let facts = Facts {
            name,
            ip: String::new(),
            groups: cfg.groups.clone(),
            grains,
            pillars: cfg.pillars.clone(),
        };

        Ok(Self {
            cfg,
            keys,
            identity,
            facts,
        })
    }

    /// The current identity record.
    #[must_use]
    pub const fn identity(&self) -> &Minion {
        &self.identity
    }

    /// Runs the agent until `shutdown` flips, reconnecting on failures:
    /// 100 ms before the first retry, then 10 s per accumulated attempt
    /// capped at one minute.
    ///
    /// # Errors
    ///
    /// Never returns an error from the loop itself; the `Result` is kept
    /// so callers can `?` it alongside setup failures.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut attempt: u32 = 0;
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            match self.session(&mut shutdown).await {
                Ok(()) => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                    info!(master = %self.cfg.master, "stream closed, reconnecting");
                    attempt = 0;
                }
                Err(e) => {
                    warn!(master = %self.cfg.master, error = %e, "session failed");
                }
            }

            attempt += 1;
            let delay = reconnect_delay(attempt);
            tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                () = sleep(delay) => {}
            }
        }
    }

    /// One connected session: handshake, then dispatch until EOF.
    async fn session(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        let stream = TcpStream::connect(&self.cfg.master)
            .await
            .map_err(|e| Error::unavailable(format!("connect {}: {e}", self.cfg.master)))?;
        let mut framed = Framed::new(stream, FrameCodec::new());

        let record = MinionRecord::from(&self.identity);
        let proof = connect_proof_bytes(&record, self.keys.public_pem());
        let connect = ConnectRequest {
            minion: Some(record),
            public_key: self.keys.public_pem().to_string(),
            signature: self.keys.sign(&proof),
        };
        framed
            .send(DispatchFrame::connect(connect).encode_frame())
            .await
            .map_err(|e| Error::unavailable(format!("send connect: {e}")))?;

        let Some(first) = framed.next().await else {
            return Err(Error::unavailable("master closed during handshake"));
        };
        let payload = first.map_err(|e| Error::unavailable(format!("handshake read: {e}")))?;
        let frame = DispatchFrame::decode_frame(&payload)?;
        let reply = frame
            .connect_reply
            .ok_or_else(|| Error::internal("handshake reply without connect response"))?;
        if !reply.error.is_empty() {
            return Err(Error::new(
                drover_core::ErrorKind::from_str_lossy(&reply.error_kind),
                reply.error,
            ));
        }

        // Adopt the canonical identity: the master issues the uid and
        // fills the address it observed.
        if let Some(canonical) = reply.minion {
            let canonical: Minion = canonical.into();
            self.facts.ip = canonical.ip.clone();
            self.identity.uid = canonical.uid.clone();
            self.identity.ip = canonical.ip.clone();
            self.identity.registry_timestamp = canonical.registry_timestamp;
            persist_identity(&self.cfg.data_dir, &self.identity)?;
        }
        let master_key = crypto::parse_public_pem(&reply.master_public_key)?;
        info!(master = %self.cfg.master, minion = %self.identity.name, "attached to master");

        loop {
            tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                frame = framed.next() => match frame {
                    None => return Ok(()),
                    Some(Err(e)) => {
                        return Err(Error::unavailable(format!("receive: {e}")));
                    }
                    Some(Ok(payload)) => {
                        if let Some(reply) = self.handle_frame(&payload, &master_key).await {
                            framed
                                .send(reply.encode_frame())
                                .await
                                .map_err(|e| Error::unavailable(format!("send reply: {e}")))?;
                        }
                    }
                },
            }
        }
    }

    /// Decrypts, refines, executes, and encrypts the reply for one
    /// inbound frame. `None` means nothing to send back.
    async fn handle_frame(
        &self,
        payload: &[u8],
        master_key: &RsaPublicKey,
    ) -> Option<DispatchFrame> {
        let frame = match DispatchFrame::decode_frame(payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "undecodable frame");
                return None;
            }
        };
        if frame.event_type() != EventType::Call {
            debug!("ignoring non-call frame");
            return None;
        }
        let call_frame = frame.call?;
        let id = call_frame.id;

        let call = match self
            .keys
            .decrypt(&call_frame.data)
            .and_then(|plain| CallRequest::from_msgpack(&plain))
        {
            Ok(call) => call,
            Err(e) => {
                // Decode refusal travels in the clear error field.
                return Some(DispatchFrame::call(CallFrame {
                    id,
                    data: Vec::new(),
                    error: e.to_string(),
                }));
            }
        };

        let response = if self.is_targeted(&call) {
            runner::run_command(&call).await
        } else {
            debug!(call = id, "refinement skipped this minion");
            CallResponse {
                id: call.id,
                result_type: ResultType::Skip,
                ..CallResponse::default()
            }
        };

        match response
            .to_msgpack()
            .and_then(|plain| crypto::encrypt(master_key, &plain))
        {
            Ok(data) => Some(DispatchFrame::call(CallFrame {
                id,
                data,
                error: String::new(),
            })),
            Err(e) => Some(DispatchFrame::call(CallFrame {
                id,
                data: Vec::new(),
                error: e.to_string(),
            })),
        }
    }

    /// Full-fact selection refinement. The master's coarse filter kept
    /// this pipe; grain/pillar terms are settled here.
    fn is_targeted(&self, call: &CallRequest) -> bool {
        if call.options.selections.is_empty() {
            return true;
        }
        let (matched, hit) = call.options.match_target(&self.facts, false);
        matched || !hit
    }
}

fn reconnect_delay(attempt: u32) -> Duration {
    if attempt <= 1 {
        Duration::from_millis(100)
    } else {
        Duration::from_secs(10)
            .saturating_mul(attempt - 1)
            .min(Duration::from_secs(60))
    }
}

fn read_hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|s| s.trim().to_string())
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_default()
}

fn load_identity(data_dir: &Path) -> Option<Minion> {
    let data = std::fs::read(data_dir.join(IDENTITY_FILE)).ok()?;
    serde_json::from_slice(&data).ok()
}

fn persist_identity(data_dir: &Path, identity: &Minion) -> Result<()> {
    let data = serde_json::to_vec_pretty(identity)?;
    std::fs::write(data_dir.join(IDENTITY_FILE), data)?;
    Ok(())
}
