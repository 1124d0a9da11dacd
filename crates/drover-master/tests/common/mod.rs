//! Shared fixtures: an in-process master and minion drivers.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::codec::Framed;

use drover_core::crypto::{self, RsaPair, RsaPublicKey};
use drover_core::proto::{
    connect_proof_bytes, CallFrame, ConnectRequest, ConnectResponse, DispatchFrame, FrameCodec,
    MinionRecord,
};
use drover_core::{CallRequest, CallResponse, ResultType};
use drover_master::sched::Scheduler;
use drover_master::{server, Keystore};
use drover_minion::{Agent, MinionConfig};

/// An in-process master bound to an ephemeral port.
pub struct TestMaster {
    pub sched: Arc<Scheduler>,
    pub store: Arc<Keystore>,
    pub addr: SocketAddr,
    pub shutdown: watch::Sender<bool>,
    _dir: tempfile::TempDir,
}

pub async fn start_master(auto_sign: bool) -> TestMaster {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Keystore::open(dir.path().join("store")).unwrap());
    let (sched, sched_loop) = Scheduler::new(Arc::clone(&store), auto_sign, false, 10);

    let (shutdown, shutdown_rx) = watch::channel(false);
    tokio::spawn(sched_loop.run(shutdown_rx.clone()));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server::run(
        listener,
        Arc::clone(&sched),
        Arc::clone(&store),
        shutdown_rx,
    ));

    TestMaster {
        sched,
        store,
        addr,
        shutdown,
        _dir: dir,
    }
}

/// Spawns a real agent pointed at the master. Returns its shutdown
/// handle; dropping it does not stop the agent, send `true` to do that.
pub fn spawn_agent(name: &str, master: SocketAddr, data_root: &Path) -> watch::Sender<bool> {
    let cfg = MinionConfig {
        name: name.to_string(),
        master: master.to_string(),
        data_dir: data_root.join(name),
        ..MinionConfig::default()
    };
    let mut agent = Agent::new(cfg).unwrap();
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = agent.run(rx).await;
    });
    tx
}

/// Polls `cond` every 25 ms until it holds or `secs` elapse.
pub async fn wait_for<F: FnMut() -> bool>(mut cond: F, secs: u64) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(secs);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within {secs}s"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// A hand-driven minion speaking the raw dispatch protocol. Used where
/// the tests need behavior a well-behaved agent won't produce (silence,
/// duplicate names).
pub struct ScriptedMinion {
    pub name: String,
    keys: RsaPair,
    master_key: RsaPublicKey,
    framed: Framed<TcpStream, FrameCodec>,
}

/// Result of a scripted connect attempt.
pub enum ScriptedConnect {
    Attached(ScriptedMinion),
    Refused(ConnectResponse),
}

impl ScriptedMinion {
    /// Performs a full signed handshake under `name`.
    pub async fn connect(addr: SocketAddr, name: &str) -> ScriptedConnect {
        let keys = RsaPair::generate(2048).unwrap();
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut framed = Framed::new(stream, FrameCodec::new());

        let record = MinionRecord {
            name: name.to_string(),
            hostname: "scripted.test".to_string(),
            os: "linux".to_string(),
            arch: "x86_64".to_string(),
            ..MinionRecord::default()
        };
        let proof = connect_proof_bytes(&record, keys.public_pem());
        let connect = ConnectRequest {
            minion: Some(record),
            public_key: keys.public_pem().to_string(),
            signature: keys.sign(&proof),
        };
        framed
            .send(DispatchFrame::connect(connect).encode_frame())
            .await
            .unwrap();

        let payload = framed.next().await.unwrap().unwrap();
        let reply = DispatchFrame::decode_frame(&payload)
            .unwrap()
            .connect_reply
            .unwrap();
        if !reply.error.is_empty() {
            return ScriptedConnect::Refused(reply);
        }

        let master_key = crypto::parse_public_pem(&reply.master_public_key).unwrap();
        ScriptedConnect::Attached(Self {
            name: name.to_string(),
            keys,
            master_key,
            framed,
        })
    }

    /// Reads and decrypts the next call request.
    pub async fn next_call(&mut self) -> CallRequest {
        loop {
            let payload = self.framed.next().await.unwrap().unwrap();
            let frame = DispatchFrame::decode_frame(&payload).unwrap();
            if let Some(call) = frame.call {
                let plain = self.keys.decrypt(&call.data).unwrap();
                return CallRequest::from_msgpack(&plain).unwrap();
            }
        }
    }

    /// Replies `Ok` with `data` for call `id`.
    pub async fn reply_ok(&mut self, id: u64, data: &[u8]) {
        let response = CallResponse {
            id,
            result_type: ResultType::Ok,
            ret_code: 0,
            result: data.to_vec(),
            error: String::new(),
        };
        let plain = response.to_msgpack().unwrap();
        let encrypted = crypto::encrypt(&self.master_key, &plain).unwrap();
        self.framed
            .send(
                DispatchFrame::call(CallFrame {
                    id,
                    data: encrypted,
                    error: String::new(),
                })
                .encode_frame(),
            )
            .await
            .unwrap();
    }

    /// Consumes incoming frames forever without answering.
    pub async fn stay_silent(mut self) {
        while self.framed.next().await.is_some() {}
    }
}
