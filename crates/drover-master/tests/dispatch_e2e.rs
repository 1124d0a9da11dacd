//! End-to-end dispatch scenarios against an in-process master with real
//! minion agents and scripted protocol peers.

mod common;

use std::time::{Duration, Instant};

use drover_core::{CallRequest, SelectionOptions};

use common::{spawn_agent, start_master, wait_for, ScriptedConnect, ScriptedMinion};

fn call(selection: &str, function: &str, args: &[&str], timeout: i64) -> CallRequest {
    CallRequest {
        id: 0,
        function: function.to_string(),
        args: args.iter().map(|s| (*s).to_string()).collect(),
        timeout,
        options: SelectionOptions::parse(selection).unwrap(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn register_then_accept() {
    let master = start_master(false).await;
    let minion_root = tempfile::tempdir().unwrap();
    let _m1 = spawn_agent("m1", master.addr, minion_root.path());

    let sched = master.sched.clone();
    wait_for(|| sched.is_attached("m1"), 10).await;
    assert_eq!(
        master.store.list(drover_core::MinionState::Unaccepted),
        vec!["m1"]
    );

    // Unaccepted minion: the call reports a refusal item instead of
    // dispatching.
    let outcome = master
        .sched
        .handle_call(call("m1", "echo", &["hi"], 5))
        .await
        .unwrap();
    assert!(outcome.error.is_none());
    assert_eq!(outcome.report.total, 0);
    assert_eq!(outcome.report.items.len(), 1);
    assert_eq!(outcome.report.items[0].minion, "m1");
    assert!(!outcome.report.items[0].result);
    assert!(outcome.report.items[0].error.contains("not accepted"));

    master.store.accept("m1", false, false).unwrap();

    // The accept event flows through the scheduler loop; retry until the
    // eligible index catches up.
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let outcome = master
            .sched
            .handle_call(call("m1", "echo", &["hi"], 5))
            .await
            .unwrap();
        let item = &outcome.report.items[0];
        if item.result {
            assert_eq!(item.data, b"hi");
            assert_eq!(outcome.report.total, 1);
            break;
        }
        assert!(Instant::now() < deadline, "minion never became callable");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn wildcard_fan_out() {
    let master = start_master(true).await;
    let minion_root = tempfile::tempdir().unwrap();
    let _m1 = spawn_agent("m1", master.addr, minion_root.path());
    let _m2 = spawn_agent("m2", master.addr, minion_root.path());

    let sched = master.sched.clone();
    wait_for(|| sched.is_attached("m1") && sched.is_attached("m2"), 10).await;

    let outcome = master
        .sched
        .handle_call(call("*", "echo", &["hi"], 5))
        .await
        .unwrap();
    assert!(outcome.error.is_none());
    assert_eq!(outcome.report.total, 2);
    assert_eq!(outcome.report.items.len(), 2);
    for item in &outcome.report.items {
        assert!(item.result, "{}: {}", item.minion, item.error);
        assert!(item.data.ends_with(b"hi"));
    }
    let mut names: Vec<&str> = outcome
        .report
        .items
        .iter()
        .map(|i| i.minion.as_str())
        .collect();
    names.sort_unstable();
    assert_eq!(names, ["m1", "m2"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn partial_timeout_preserves_responsive_minion() {
    let master = start_master(true).await;
    let minion_root = tempfile::tempdir().unwrap();
    let _m1 = spawn_agent("m1", master.addr, minion_root.path());

    // m2 attaches but never answers calls.
    let ScriptedConnect::Attached(m2) = ScriptedMinion::connect(master.addr, "m2").await else {
        panic!("scripted attach refused");
    };
    tokio::spawn(m2.stay_silent());

    let sched = master.sched.clone();
    wait_for(|| sched.is_attached("m1") && sched.is_attached("m2"), 10).await;

    let started = Instant::now();
    let outcome = master
        .sched
        .handle_call(call("m1,m2", "echo", &["done"], 2))
        .await
        .unwrap();
    let elapsed = started.elapsed();

    let err = outcome.error.expect("deadline error expected");
    assert!(err.is_timeout());
    assert!(elapsed >= Duration::from_secs(2));
    assert!(elapsed < Duration::from_secs(8));

    assert_eq!(outcome.report.total, 2);
    let m1_item = outcome
        .report
        .items
        .iter()
        .find(|i| i.minion == "m1")
        .unwrap();
    assert!(m1_item.result);
    assert_eq!(m1_item.data, b"done");

    let m2_item = outcome
        .report
        .items
        .iter()
        .find(|i| i.minion == "m2")
        .unwrap();
    assert!(!m2_item.result);
    assert!(m2_item.data.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_attach_is_refused_and_first_pipe_survives() {
    let master = start_master(true).await;
    let minion_root = tempfile::tempdir().unwrap();
    let _m1 = spawn_agent("m1", master.addr, minion_root.path());

    let sched = master.sched.clone();
    wait_for(|| sched.is_attached("m1"), 10).await;

    match ScriptedMinion::connect(master.addr, "m1").await {
        ScriptedConnect::Refused(reply) => {
            assert_eq!(reply.error_kind, "conflict");
            assert!(reply.error.contains("already attached"));
        }
        ScriptedConnect::Attached(_) => panic!("duplicate attach must be refused"),
    }

    // The original pipe still serves calls.
    let outcome = master
        .sched
        .handle_call(call("m1", "echo", &["still here"], 5))
        .await
        .unwrap();
    assert!(outcome.report.items[0].result);
    assert_eq!(outcome.report.items[0].data, b"still here");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scripted_minion_round_trip() {
    // Drives the wire protocol end to end without the agent crate: the
    // encrypted request must decrypt to the dispatched call, and the
    // encrypted reply must land in the report slot.
    let master = start_master(true).await;

    let ScriptedConnect::Attached(mut m1) = ScriptedMinion::connect(master.addr, "m1").await
    else {
        panic!("attach refused");
    };
    let sched = master.sched.clone();
    wait_for(|| sched.is_attached("m1"), 10).await;

    let master_sched = master.sched.clone();
    let caller = tokio::spawn(async move {
        master_sched
            .handle_call(call("m1", "uname", &["-r"], 5))
            .await
            .unwrap()
    });

    let request = m1.next_call().await;
    assert_eq!(request.function, "uname");
    assert_eq!(request.args, vec!["-r"]);
    assert!(request.id > 0);
    m1.reply_ok(request.id, b"6.1.0-test").await;

    let outcome = caller.await.unwrap();
    assert!(outcome.error.is_none());
    assert_eq!(outcome.report.items.len(), 1);
    assert!(outcome.report.items[0].result);
    assert_eq!(outcome.report.items[0].data, b"6.1.0-test");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disconnect_marks_minion_offline() {
    let master = start_master(true).await;

    let ScriptedConnect::Attached(m1) = ScriptedMinion::connect(master.addr, "m1").await else {
        panic!("attach refused");
    };
    let sched = master.sched.clone();
    wait_for(|| sched.is_attached("m1"), 10).await;

    drop(m1); // closes the stream
    let sched = master.sched.clone();
    wait_for(|| !sched.is_attached("m1"), 10).await;

    // Calls now report the minion offline rather than dispatching.
    let outcome = master
        .sched
        .handle_call(call("m1", "echo", &["hi"], 2))
        .await
        .unwrap();
    assert!(!outcome.report.items[0].result);
    assert!(outcome.report.items[0].error.contains("not online"));

    let store = master.store.clone();
    wait_for(
        || {
            store
                .read_minion("m1")
                .map(|m| m.offline_timestamp > 0)
                .unwrap_or(false)
        },
        10,
    )
    .await;
}
