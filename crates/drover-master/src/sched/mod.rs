//! The scheduler: live-pipe table, eligible-minion index, task table,
//! and the event loop that serializes every state transition.
//!
//! Exactly one [`SchedulerLoop`] task runs per master. It multiplexes
//! three sources: pipe messages (responses and disconnects), trust-store
//! events (accept/reject/delete), and shutdown. Transient caller tasks
//! invoke [`Scheduler::handle_call`] concurrently; each blocks only on
//! its own task's deadline, never on the event loop.

mod pipe;
mod task;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use drover_core::crypto;
use drover_core::idpool::IdPool;
use drover_core::{
    CallRequest, CallResponse, Error, Minion, MinionState, Report, ReportItem, Result,
    ResultType, SelectionOptions, SelectionTarget,
};

use crate::keystore::{Keystore, StoreEvent, SubscriberId};

pub use pipe::{DispatchFramed, FrameStream, Pipe};
use pipe::PipeMessage;
use task::{new_task, TaskHandle};

/// Inbound pipe-message channel depth. Senders back off when the event
/// loop falls this far behind.
const PIPE_CHANNEL_DEPTH: usize = 100;

/// Facts the selector engine sees for one eligible minion.
///
/// Synthesized from the pipe's cached fields and the stored identity;
/// pillar data is not held master-side, so pillar terms never "hit" here
/// and resolve during minion-side refinement.
#[derive(Debug, Clone, Default)]
pub struct NodeRecord {
    name: String,
    ip: String,
    groups: Vec<String>,
    grains: HashMap<String, String>,
    pillars: HashMap<String, String>,
}

impl NodeRecord {
    /// A record holding only the name, used when seeding from the trust
    /// store before the minion has attached.
    #[must_use]
    pub fn placeholder(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// A record synthesized from a full identity.
    #[must_use]
    pub fn from_minion(minion: &Minion) -> Self {
        Self {
            name: minion.name.clone(),
            ip: minion.ip.clone(),
            groups: minion.groups.clone(),
            grains: minion.grains(),
            pillars: HashMap::new(),
        }
    }
}

impl SelectionTarget for NodeRecord {
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

/// Result of one dispatched call.
#[derive(Debug)]
pub struct CallOutcome {
    /// The aggregated report, partially filled when the deadline fired.
    pub report: Report,
    /// The deadline (or shutdown) error, if the call did not complete.
    pub error: Option<Error>,
}

/// Outcome of [`Scheduler::add_stream`].
pub enum AttachOutcome {
    /// The stream was attached; the caller must complete the handshake
    /// and then drive [`Pipe::run`] with the read half.
    Attached {
        /// The inserted pipe.
        pipe: Arc<Pipe>,
        /// Read half for the receive loop.
        stream: FrameStream,
        /// Canonical identity after the trust-store upsert.
        minion: Minion,
        /// Trust state after the upsert.
        state: MinionState,
    },
    /// The stream was refused; the framed stream is handed back so the
    /// caller can deliver the refusal.
    Refused {
        /// Why the attach failed.
        err: Error,
        /// The untouched stream.
        framed: Box<DispatchFramed>,
    },
}

struct Selected {
    pipes: Vec<Arc<Pipe>>,
    report: Report,
    index: HashMap<String, usize>,
}

impl std::fmt::Debug for Selected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Selected")
            .field("pipes", &self.pipes.len())
            .field("report", &self.report)
            .field("index", &self.index)
            .finish()
    }
}

/// Master-side dispatch core.
pub struct Scheduler {
    pipes: DashMap<String, Arc<Pipe>>,
    minions: RwLock<HashMap<String, NodeRecord>>,
    tasks: std::sync::Mutex<HashMap<u64, TaskHandle>>,
    ids: IdPool,
    store: Arc<Keystore>,
    master_keys: Arc<drover_core::crypto::RsaPair>,
    mch_tx: mpsc::Sender<PipeMessage>,
    auto_sign: bool,
    auto_denied: bool,
    call_timeout_default: i64,
}

/// The single event-loop task; created together with its [`Scheduler`].
pub struct SchedulerLoop {
    sched: Arc<Scheduler>,
    mch: mpsc::Receiver<PipeMessage>,
    ech: mpsc::UnboundedReceiver<StoreEvent>,
    sub_id: SubscriberId,
}

impl Scheduler {
    /// Builds a scheduler over `store` with the first-contact policy and
    /// the deadline applied to calls that carry no timeout of their own.
    ///
    /// Seeds the eligible-minion index from the accepted and auto-signed
    /// buckets and subscribes to trust-store events.
    #[must_use]
    pub fn new(
        store: Arc<Keystore>,
        auto_sign: bool,
        auto_denied: bool,
        call_timeout_default: i64,
    ) -> (Arc<Self>, SchedulerLoop) {
        let mut minions = HashMap::new();
        for state in [MinionState::Accepted, MinionState::AutoSign] {
            for name in store.list(state) {
                minions.insert(name.clone(), NodeRecord::placeholder(name));
            }
        }

        let (mch_tx, mch_rx) = mpsc::channel(PIPE_CHANNEL_DEPTH);
        let (sub_id, ech) = store.subscribe();
        let master_keys = Arc::new(store.master_keys().clone());

        let sched = Arc::new(Self {
            pipes: DashMap::new(),
            minions: RwLock::new(minions),
            tasks: std::sync::Mutex::new(HashMap::new()),
            ids: IdPool::new(),
            store,
            master_keys,
            mch_tx,
            auto_sign,
            auto_denied,
            call_timeout_default,
        });
        let run = SchedulerLoop {
            sched: Arc::clone(&sched),
            mch: mch_rx,
            ech,
            sub_id,
        };
        (sched, run)
    }

    /// True when a pipe for `name` is live.
    #[must_use]
    pub fn is_attached(&self, name: &str) -> bool {
        self.pipes.contains_key(name)
    }

    /// Attaches an incoming dispatch stream for `minion`.
    ///
    /// Ordered steps: duplicate-name check, trust-store upsert under the
    /// configured policy, pipe construction, pipe-table insert, and —
    /// when the resulting state is dispatch-eligible — eligible-index
    /// refresh.
    pub fn add_stream(
        &self,
        mut minion: Minion,
        public_key_pem: &str,
        framed: DispatchFramed,
    ) -> AttachOutcome {
        use dashmap::mapref::entry::Entry;
        use futures::StreamExt;

        let name = minion.name.clone();
        if name.is_empty() {
            return AttachOutcome::Refused {
                err: Error::bad_request("minion name is empty"),
                framed: Box::new(framed),
            };
        }

        let minion_key = match crypto::parse_public_pem(public_key_pem) {
            Ok(key) => key,
            Err(err) => {
                return AttachOutcome::Refused {
                    err,
                    framed: Box::new(framed),
                }
            }
        };

        let (pipe, stream, state) = match self.pipes.entry(name.clone()) {
            Entry::Occupied(_) => {
                return AttachOutcome::Refused {
                    err: Error::conflict(format!("minion {name} already attached")),
                    framed: Box::new(framed),
                };
            }
            Entry::Vacant(slot) => {
                let state = match self.store.upsert(
                    &mut minion,
                    public_key_pem,
                    self.auto_sign,
                    self.auto_denied,
                ) {
                    Ok(state) => state,
                    Err(err) => {
                        return AttachOutcome::Refused {
                            err,
                            framed: Box::new(framed),
                        }
                    }
                };

                let (sink, stream) = framed.split();
                let pipe = Arc::new(Pipe::new(
                    name.clone(),
                    minion.ip.clone(),
                    minion.groups.clone(),
                    Arc::clone(&self.master_keys),
                    minion_key,
                    sink,
                    self.mch_tx.clone(),
                ));
                slot.insert(Arc::clone(&pipe));
                (pipe, stream, state)
            }
        };

        if state.is_eligible() {
            let mut minions = self.minions.write().unwrap_or_else(|e| e.into_inner());
            minions.insert(name.clone(), NodeRecord::from_minion(&minion));
        }

        info!(minion = %name, state = %state, ip = %minion.ip, "minion attached");
        AttachOutcome::Attached {
            pipe,
            stream,
            minion,
            state,
        }
    }

    /// Dispatches a call and aggregates the responses into a report.
    ///
    /// A fired deadline is reported in [`CallOutcome::error`] alongside
    /// the partially-filled report; pre-dispatch failures (invalid
    /// selection, no targets) are returned as `Err`.
    ///
    /// # Errors
    ///
    /// Returns `bad-request` for an invalid expression or a selection
    /// yielding neither a live pipe nor a reportable per-name failure.
    pub async fn handle_call(&self, mut call: CallRequest) -> Result<CallOutcome> {
        call.options.validate()?;
        let id = self.ids.acquire();
        let result = self.dispatch(&mut call, id).await;
        self.ids.release(id);
        result
    }

    async fn dispatch(&self, call: &mut CallRequest, id: u64) -> Result<CallOutcome> {
        call.id = id;
        // The configured default stands in for an unset timeout before
        // the request fans out, so minions see the same deadline.
        if call.timeout <= 0 {
            call.timeout = self.call_timeout_default;
        }
        let selected = self.select_pipes(&call.options)?;

        let (handle, executor) = new_task(selected.report, selected.index);
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, handle);

        for pipe in &selected.pipes {
            if let Err(e) = pipe.send(call).await {
                warn!(minion = %pipe.name(), call = id, error = %e, "send call");
            }
        }

        #[allow(clippy::cast_sign_loss)] // effective_timeout() is ≥ 1
        let deadline = Duration::from_secs(call.effective_timeout() as u64);
        let (report, outcome) = executor.execute(deadline).await;

        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);

        Ok(CallOutcome {
            report,
            error: outcome.err(),
        })
    }

    /// Resolves a selection into live pipes plus a report skeleton.
    ///
    /// Fast path for a single host-list term: `*` fans out to every
    /// eligible minion with a live pipe; explicit names produce error
    /// items explaining unknown/unaccepted/offline targets. The general
    /// path pre-filters the eligible index with the coarse (`simple`)
    /// matcher, keeping nodes whose facts did not carry a queried
    /// attribute so minion-side refinement can decide.
    fn select_pipes(&self, options: &SelectionOptions) -> Result<Selected> {
        let mut report = Report::default();
        let mut index = HashMap::new();
        let mut pipes: Vec<Arc<Pipe>> = Vec::new();
        let mut seen = HashSet::new();

        let mut slot = |report: &mut Report, index: &mut HashMap<String, usize>, name: &str| {
            index.insert(name.to_string(), report.items.len());
            report.items.push(ReportItem::pending(name));
        };

        let minions = self.minions.read().unwrap_or_else(|e| e.into_inner());

        if let Some(hosts) = options.single_host_list() {
            if hosts.iter().any(|h| h == "*") {
                for name in minions.keys() {
                    if let Some(pipe) = self.pipes.get(name) {
                        if seen.insert(name.clone()) {
                            slot(&mut report, &mut index, name);
                            pipes.push(Arc::clone(pipe.value()));
                        }
                    }
                }
            } else {
                for host in hosts {
                    if !seen.insert(host.clone()) {
                        continue;
                    }
                    if !minions.contains_key(host) {
                        let why = if self.store.read_minion(host).is_ok() {
                            format!("minion {host} is not accepted")
                        } else {
                            format!("unknown minion {host}")
                        };
                        report.items.push(ReportItem::failed(host, why));
                    } else if let Some(pipe) = self.pipes.get(host) {
                        slot(&mut report, &mut index, host);
                        pipes.push(Arc::clone(pipe.value()));
                    } else {
                        report
                            .items
                            .push(ReportItem::failed(host, format!("minion {host} is not online")));
                    }
                }
            }
        } else {
            for (name, node) in minions.iter() {
                let (matched, hit) = options.match_target(node, true);
                if !matched && hit {
                    continue;
                }
                if !seen.insert(name.clone()) {
                    continue;
                }
                if let Some(pipe) = self.pipes.get(name) {
                    slot(&mut report, &mut index, name);
                    pipes.push(Arc::clone(pipe.value()));
                } else {
                    debug!(minion = %name, "selection matched an offline minion");
                }
            }
        }
        drop(minions);

        if pipes.is_empty() && report.items.is_empty() {
            return Err(Error::bad_request("no available minions"));
        }

        #[allow(clippy::cast_possible_truncation)] // bounded by minion count
        {
            report.total = pipes.len() as u32;
        }
        Ok(Selected {
            pipes,
            report,
            index,
        })
    }

    fn on_pipe_message(&self, message: PipeMessage) {
        if message.done {
            if let Some(err) = &message.err {
                warn!(minion = %message.name, error = %err, "pipe terminated");
            }
            self.remove_pipe(&message.name);
            return;
        }

        let mut response = message.call.unwrap_or_else(|| CallResponse {
            id: message.id,
            ..CallResponse::default()
        });
        if let Some(err) = message.err {
            response.result_type = ResultType::Error;
            response.error = err.to_string();
        }

        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        match tasks.get(&message.id) {
            Some(task) => task.notify(&message.name, response),
            // Task already completed or was canceled.
            None => debug!(call = message.id, minion = %message.name, "response for finished call"),
        }
    }

    fn remove_pipe(&self, name: &str) {
        if self.pipes.remove(name).is_some() {
            info!(minion = %name, "minion detached");
        }
        match self.store.read_minion(name) {
            Ok(mut minion) => {
                minion.offline_timestamp = Utc::now().timestamp();
                if let Err(e) = self.store.update(&minion) {
                    warn!(minion = %name, error = %e, "stamp offline time");
                }
            }
            Err(e) => debug!(minion = %name, error = %e, "offline stamp skipped"),
        }
    }

    fn on_store_event(&self, event: StoreEvent) {
        if event.deleted {
            self.minions
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&event.name);
            return;
        }

        if event.state.is_eligible() {
            // Only a live pipe can supply the node facts; an offline
            // minion becomes eligible when it next attaches.
            let cached = self
                .pipes
                .get(&event.name)
                .map(|pipe| (pipe.ip().to_string(), pipe.groups().to_vec()));
            if let Some((ip, groups)) = cached {
                let node = match self.store.read_minion(&event.name) {
                    Ok(minion) => NodeRecord::from_minion(&minion),
                    Err(_) => NodeRecord {
                        name: event.name.clone(),
                        ip,
                        groups,
                        ..NodeRecord::default()
                    },
                };
                self.minions
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(event.name.clone(), node);
            }
        } else {
            // Rejected/denied: subsequent calls must refuse to target it
            // even while the pipe lingers.
            self.minions
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&event.name);
        }
    }
}

impl SchedulerLoop {
    /// Runs the event loop until `shutdown` flips.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("scheduler event loop running");
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    self.sched.store.unsubscribe(self.sub_id);
                    info!("scheduler event loop stopped");
                    return;
                }
                Some(message) = self.mch.recv() => self.sched.on_pipe_message(message),
                Some(event) = self.ech.recv() => self.sched.on_store_event(event),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str) -> NodeRecord {
        NodeRecord::from_minion(&Minion {
            name: name.to_string(),
            os: "linux".to_string(),
            ..Minion::default()
        })
    }

    fn test_scheduler() -> (Arc<Scheduler>, SchedulerLoop, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Keystore::open(dir.path().join("store")).unwrap());
        let (sched, run) = Scheduler::new(store, false, false, 10);
        (sched, run, dir)
    }

    #[tokio::test]
    async fn empty_selection_is_bad_request() {
        let (sched, _run, _dir) = test_scheduler();
        let call = CallRequest {
            function: "echo".to_string(),
            options: SelectionOptions::parse("*").unwrap(),
            ..CallRequest::default()
        };
        // No eligible minions and no explicit hosts: nothing to report.
        let err = sched.handle_call(call).await.unwrap_err();
        assert_eq!(err.kind(), drover_core::ErrorKind::BadRequest);
    }

    #[tokio::test]
    async fn explicit_unknown_host_yields_error_item() {
        let (sched, _run, _dir) = test_scheduler();
        let call = CallRequest {
            function: "echo".to_string(),
            options: SelectionOptions::parse("ghost").unwrap(),
            ..CallRequest::default()
        };
        let outcome = sched.handle_call(call).await.unwrap();
        assert!(outcome.error.is_none());
        assert_eq!(outcome.report.total, 0);
        assert_eq!(outcome.report.items.len(), 1);
        assert!(outcome.report.items[0].error.contains("unknown minion"));
    }

    #[tokio::test]
    async fn store_events_drive_the_eligible_index() {
        let (sched, _run, _dir) = test_scheduler();

        sched
            .minions
            .write()
            .unwrap()
            .insert("m1".to_string(), node("m1"));

        sched.on_store_event(StoreEvent {
            name: "m1".to_string(),
            state: MinionState::Rejected,
            deleted: false,
        });
        assert!(!sched.minions.read().unwrap().contains_key("m1"));

        sched
            .minions
            .write()
            .unwrap()
            .insert("m2".to_string(), node("m2"));
        sched.on_store_event(StoreEvent {
            name: "m2".to_string(),
            state: MinionState::Accepted,
            deleted: true,
        });
        assert!(!sched.minions.read().unwrap().contains_key("m2"));
    }

    #[tokio::test]
    async fn select_pipes_reports_offline_eligible_minion() {
        let (sched, _run, _dir) = test_scheduler();
        sched
            .minions
            .write()
            .unwrap()
            .insert("m1".to_string(), node("m1"));

        let selected = sched
            .select_pipes(&SelectionOptions::parse("m1").unwrap())
            .unwrap();
        assert!(selected.pipes.is_empty());
        assert_eq!(selected.report.items.len(), 1);
        assert!(selected.report.items[0].error.contains("not online"));
    }

    #[tokio::test]
    async fn general_path_filters_on_coarse_facts() {
        let (sched, _run, _dir) = test_scheduler();
        sched
            .minions
            .write()
            .unwrap()
            .insert("m1".to_string(), node("m1"));

        // Grain terms are skipped by the coarse filter; the node is kept
        // pending refinement, but with no live pipe nothing remains.
        let err = sched
            .select_pipes(&SelectionOptions::parse("G@os:plan9").unwrap())
            .unwrap_err();
        assert_eq!(err.kind(), drover_core::ErrorKind::BadRequest);
    }
}
