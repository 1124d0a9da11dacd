//! Operator socket: the control plane `droverctl` talks to.
//!
//! A Unix socket (mode 0600) carrying `[tag][protobuf]` frames. Each
//! request is decoded, routed to its handler, and answered with either
//! the matching response tag or the tag-0 error envelope carrying the
//! error-kind taxonomy. The handlers are thin: key management goes
//! straight to the trust store, `call` goes through the scheduler.

use std::collections::HashSet;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use drover_core::proto::{
    AcceptMinionResponse, CallCommandRequest, CallCommandResponse, DeleteMinionResponse,
    FrameCodec, GetMinionResponse, ListMinionsResponse, MinionKeyMsg, OperatorRequest,
    OperatorResponse, PingResponse, PrintMinionResponse, RejectMinionResponse, ReportMsg,
};
use drover_core::{CallRequest, Error, MinionState, Result, SelectionOptions};

use crate::keystore::Keystore;
use crate::sched::Scheduler;

/// Operator-socket server: dispatcher plus accept loop.
pub struct OperatorServer {
    store: Arc<Keystore>,
    sched: Arc<Scheduler>,
    socket_path: PathBuf,
}

impl OperatorServer {
    /// Creates a server bound to nothing yet; [`run`](Self::run) binds.
    #[must_use]
    pub fn new(store: Arc<Keystore>, sched: Arc<Scheduler>, socket_path: PathBuf) -> Self {
        Self {
            store,
            sched,
            socket_path,
        }
    }

    /// Binds the socket and serves until `shutdown` flips.
    ///
    /// A stale socket file from an earlier run is removed before
    /// binding; the fresh one is chmod'ed to 0600.
    ///
    /// # Errors
    ///
    /// Returns `internal` when the socket cannot be bound.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let path = self.socket_path.clone();
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&path)
            .map_err(|e| Error::internal(format!("bind {}: {e}", path.display())))?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        info!(socket = %path.display(), "operator socket listening");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    let _ = std::fs::remove_file(&path);
                    info!("operator socket stopped");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let server = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream).await {
                                    debug!(error = %e, "operator connection ended");
                                }
                            });
                        }
                        Err(e) => error!(error = %e, "accept operator connection"),
                    }
                }
            }
        }
    }

    async fn handle_connection(&self, stream: UnixStream) -> Result<()> {
        let mut framed = Framed::new(stream, FrameCodec::new());
        while let Some(frame) = framed.next().await {
            let frame = frame.map_err(|e| Error::unavailable(format!("operator read: {e}")))?;
            let response = self.dispatch(&frame).await;
            framed
                .send(response.encode())
                .await
                .map_err(|e| Error::unavailable(format!("operator write: {e}")))?;
        }
        Ok(())
    }

    /// Decodes and routes one operator frame. Failures become the tag-0
    /// error envelope, never a dropped connection.
    pub async fn dispatch(&self, frame: &[u8]) -> OperatorResponse {
        let request = match OperatorRequest::decode(frame) {
            Ok(request) => request,
            Err(err) => return OperatorResponse::from_error(&err),
        };
        match self.handle(request).await {
            Ok(response) => response,
            Err(err) => OperatorResponse::from_error(&err),
        }
    }

    async fn handle(&self, request: OperatorRequest) -> Result<OperatorResponse> {
        match request {
            OperatorRequest::Ping(_) => Ok(OperatorResponse::Ping(PingResponse {})),

            OperatorRequest::ListMinions(req) => {
                let states: Vec<MinionState> = if req.states.is_empty() {
                    MinionState::ALL.to_vec()
                } else {
                    req.states
                        .iter()
                        .map(|s| s.parse())
                        .collect::<Result<_>>()?
                };

                let mut rsp = ListMinionsResponse::default();
                for state in states {
                    let names = self.store.list(state);
                    match state {
                        MinionState::Unaccepted => rsp.unaccepted = names,
                        MinionState::Accepted => rsp.accepted = names,
                        MinionState::AutoSign => rsp.auto_sign = names,
                        MinionState::Denied => rsp.denied = names,
                        MinionState::Rejected => rsp.rejected = names,
                    }
                }
                Ok(OperatorResponse::ListMinions(rsp))
            }

            OperatorRequest::GetMinion(req) => {
                let key = self.store.get(&req.name)?;
                Ok(OperatorResponse::GetMinion(GetMinionResponse {
                    key: Some(MinionKeyMsg::from(&key)),
                }))
            }

            OperatorRequest::AcceptMinion(req) => {
                let names = if req.all {
                    let mut names = self.store.list(MinionState::Unaccepted);
                    if req.include_rejected {
                        names.extend(self.store.list(MinionState::Rejected));
                    }
                    if req.include_denied {
                        names.extend(self.store.list(MinionState::Denied));
                    }
                    names
                } else {
                    req.names
                };
                let accepted = self.transition_each(&names, |name| {
                    self.store
                        .accept(name, req.include_rejected, req.include_denied)
                })?;
                Ok(OperatorResponse::AcceptMinion(AcceptMinionResponse {
                    accepted,
                }))
            }

            OperatorRequest::RejectMinion(req) => {
                let names = if req.all {
                    let mut names = self.store.list(MinionState::Unaccepted);
                    if req.include_accepted {
                        names.extend(self.store.list(MinionState::Accepted));
                        names.extend(self.store.list(MinionState::AutoSign));
                    }
                    if req.include_denied {
                        names.extend(self.store.list(MinionState::Denied));
                    }
                    names
                } else {
                    req.names
                };
                let rejected = self.transition_each(&names, |name| {
                    self.store
                        .reject(name, req.include_accepted, req.include_denied)
                })?;
                Ok(OperatorResponse::RejectMinion(RejectMinionResponse {
                    rejected,
                }))
            }

            OperatorRequest::DeleteMinion(req) => {
                let names = if req.all {
                    self.store.list_all()
                } else {
                    req.names
                };
                let deleted = self.transition_each(&names, |name| self.store.delete(name))?;
                Ok(OperatorResponse::DeleteMinion(DeleteMinionResponse {
                    deleted,
                }))
            }

            OperatorRequest::PrintMinion(req) => {
                let names = if req.all {
                    self.store.list_all()
                } else {
                    req.names
                };
                let mut keys = Vec::with_capacity(names.len());
                for name in &names {
                    match self.store.get(name) {
                        Ok(key) => keys.push(MinionKeyMsg::from(&key)),
                        Err(err) if names.len() == 1 => return Err(err),
                        Err(err) => warn!(minion = %name, error = %err, "print skipped"),
                    }
                }
                Ok(OperatorResponse::PrintMinion(PrintMinionResponse { keys }))
            }

            OperatorRequest::Call(req) => self.handle_operator_call(req).await,
        }
    }

    async fn handle_operator_call(&self, req: CallCommandRequest) -> Result<OperatorResponse> {
        if req.function.is_empty() {
            return Err(Error::bad_request("call without a function"));
        }
        let options = SelectionOptions::parse(&req.selection)?;
        let call = CallRequest {
            id: 0, // allocated at dispatch time
            function: req.function,
            args: req.args,
            timeout: req.timeout,
            options,
        };
        let outcome = self.sched.handle_call(call).await?;

        let (error, error_kind) = match &outcome.error {
            Some(err) => (err.detail.clone(), err.kind().as_str().to_string()),
            None => (String::new(), String::new()),
        };
        Ok(OperatorResponse::Call(CallCommandResponse {
            report: Some(ReportMsg::from(&outcome.report)),
            error,
            error_kind,
        }))
    }

    /// Applies a transition to each named minion, deduplicated.
    ///
    /// A single-name request propagates its failure; bulk requests log
    /// and skip so one stale name cannot abort the batch.
    fn transition_each<F>(&self, names: &[String], op: F) -> Result<Vec<String>>
    where
        F: Fn(&str) -> Result<()>,
    {
        let mut done = Vec::new();
        let mut seen = HashSet::new();
        for name in names {
            if !seen.insert(name.as_str()) {
                continue;
            }
            match op(name) {
                Ok(()) => done.push(name.clone()),
                Err(err) if names.len() == 1 => return Err(err),
                Err(err) => warn!(minion = %name, error = %err, "transition skipped"),
            }
        }
        Ok(done)
    }
}

/// Default operator socket path relative to a runtime directory.
#[must_use]
pub fn default_socket_path(runtime_dir: &Path) -> PathBuf {
    runtime_dir.join("operator.sock")
}
