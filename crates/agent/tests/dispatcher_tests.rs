mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use vessel_agent::{Dispatcher, Outbound};
use vessel_domain::{
    ProtocolMessage, ReplyMessage, ReplyPayload, Route, StartWorkerRequest, StopWorkerRequest,
    Subjects, UpdateWorkerStatus, WorkerResponse, EXIT_CANCELLED, EXIT_FAILURE,
};
use vessel_domain::DEFAULT_NAMESPACE;

fn start(command: &str) -> StartWorkerRequest {
    StartWorkerRequest {
        command: command.to_string(),
        ..Default::default()
    }
}

fn stop_response(reply: Outbound) -> WorkerResponse {
    match reply.message {
        ProtocolMessage::ReplyMessage(ReplyMessage {
            payload: ReplyPayload::StopWorkerResponse(response),
            ..
        }) => response,
        other => panic!("expected a stop reply, got {other:?}"),
    }
}

async fn next_reply(outbound: &mut mpsc::Receiver<Outbound>) -> Outbound {
    tokio::time::timeout(Duration::from_secs(5), outbound.recv())
        .await
        .expect("no reply in time")
        .expect("outbound closed")
}

#[tokio::test]
async fn test_cancel_unknown_worker_is_not_found() {
    let subjects = Subjects::new(DEFAULT_NAMESPACE).unwrap();
    let bus = bus_with_agent_stream(&subjects).await;
    let runtime = Arc::new(ScriptedRuntime::default());
    let mut dispatcher = Dispatcher::new(
        worker_context(bus, runtime, subjects),
        CancellationToken::new(),
    );

    let err = dispatcher.cancel_job("never-existed").unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(dispatcher.live_workers(), 0);
}

#[tokio::test]
async fn test_cancel_removes_worker_immediately() {
    let subjects = Subjects::new(DEFAULT_NAMESPACE).unwrap();
    let bus = bus_with_agent_stream(&subjects).await;
    let runtime = Arc::new(ScriptedRuntime::default());
    let mut dispatcher = Dispatcher::new(
        worker_context(bus, runtime, subjects),
        CancellationToken::new(),
    );

    let id = dispatcher.create_job(None, start("inline://wait")).unwrap();
    assert!(dispatcher.is_running(&id));
    dispatcher.cancel_job(&id).unwrap();
    assert!(!dispatcher.is_running(&id));

    // a second cancel races with the worker's own cleanup
    assert!(dispatcher.cancel_job(&id).unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_shutdown_drains_every_worker() {
    let subjects = Subjects::new(DEFAULT_NAMESPACE).unwrap();
    let bus = bus_with_agent_stream(&subjects).await;
    let runtime = Arc::new(ScriptedRuntime::default());
    let cancel = CancellationToken::new();
    let mut dispatcher = Dispatcher::new(
        worker_context(bus.clone(), runtime.clone(), subjects.clone()),
        cancel.clone(),
    );

    for worker in ["w1", "w2", "w3"] {
        dispatcher
            .create_job(Some(worker.to_string()), start("inline://wait"))
            .unwrap();
    }
    assert_eq!(dispatcher.live_workers(), 3);

    let (_inbound_tx, inbound_rx) = mpsc::channel(1);
    let (outbound_tx, _outbound_rx) = mpsc::channel(1);
    cancel.cancel();
    dispatcher.run(inbound_rx, outbound_tx).await.unwrap();

    assert_eq!(dispatcher.stopped_workers(), 3);
    assert_eq!(dispatcher.live_workers(), 0);
    assert!(runtime.exits().iter().all(|code| *code == EXIT_CANCELLED));

    // the terminal status still goes out after cancellation
    let statuses = wait_for(&bus, subjects.agent_filter(Route::WorkerStatus, AGENT), 3).await;
    for message in statuses {
        assert_eq!(
            message.decode().unwrap(),
            ProtocolMessage::UpdateWorkerStatus(UpdateWorkerStatus {
                exit_code: EXIT_CANCELLED
            })
        );
    }
    assert!(dispatcher.create_job(None, start("inline://exit 0")).is_err());
}

#[tokio::test]
async fn test_finished_worker_leaves_registry() {
    let subjects = Subjects::new(DEFAULT_NAMESPACE).unwrap();
    let bus = bus_with_agent_stream(&subjects).await;
    let runtime = Arc::new(ScriptedRuntime::default());
    let cancel = CancellationToken::new();
    let mut dispatcher = Dispatcher::new(
        worker_context(bus.clone(), runtime.clone(), subjects.clone()),
        cancel.clone(),
    );
    dispatcher
        .create_job(Some("w1".to_string()), start("inline://exit 0"))
        .unwrap();

    let (inbound_tx, inbound_rx) = mpsc::channel(1);
    let (outbound_tx, mut outbound_rx) = mpsc::channel(1);
    let running = tokio::spawn(async move {
        dispatcher.run(inbound_rx, outbound_tx).await.unwrap();
        dispatcher
    });

    wait_for(&bus, subjects.status(AGENT, "w1").unwrap(), 1).await;
    // Stopped follows the status publish
    tokio::time::sleep(Duration::from_millis(200)).await;

    // the loop is still running, so only the Stopped event can have removed w1
    inbound_tx
        .send(inbound(
            subjects.stop(AGENT, "w1").unwrap(),
            StopWorkerRequest {}.into(),
        ))
        .await
        .unwrap();
    let response = stop_response(next_reply(&mut outbound_rx).await);
    let error = response.error.expect("w1 should be gone");
    assert!(error.contains("w1"), "{error}");

    cancel.cancel();
    let dispatcher = running.await.unwrap();
    assert_eq!(dispatcher.stopped_workers(), 1);
    assert_eq!(runtime.exits(), vec![0]);
}

#[tokio::test]
async fn test_reused_worker_id_survives_stale_stop_event() {
    let subjects = Subjects::new(DEFAULT_NAMESPACE).unwrap();
    let bus = bus_with_agent_stream(&subjects).await;
    let runtime = Arc::new(ScriptedRuntime::default());
    let cancel = CancellationToken::new();
    let mut dispatcher = Dispatcher::new(
        worker_context(bus.clone(), runtime.clone(), subjects.clone()),
        cancel.clone(),
    );

    let id = Some("w1".to_string());
    dispatcher.create_job(id.clone(), start("inline://wait")).unwrap();
    dispatcher.cancel_job("w1").unwrap();
    dispatcher.create_job(id, start("inline://wait")).unwrap();
    assert!(dispatcher.is_running("w1"));
    assert_eq!(dispatcher.live_workers(), 2);

    let (inbound_tx, inbound_rx) = mpsc::channel(1);
    let (outbound_tx, mut outbound_rx) = mpsc::channel(1);
    let running = tokio::spawn(async move {
        dispatcher.run(inbound_rx, outbound_tx).await.unwrap();
        dispatcher
    });

    // the first w1 reports its exit and then its Stopped event
    let status = subjects.status(AGENT, "w1").unwrap();
    wait_for(&bus, status.clone(), 1).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    inbound_tx
        .send(inbound(
            subjects.stop(AGENT, "w1").unwrap(),
            StopWorkerRequest {}.into(),
        ))
        .await
        .unwrap();
    assert_eq!(
        stop_response(next_reply(&mut outbound_rx).await),
        WorkerResponse::ok()
    );
    wait_for(&bus, status, 2).await;

    cancel.cancel();
    let dispatcher = running.await.unwrap();
    assert_eq!(dispatcher.stopped_workers(), 2);
    assert!(runtime.exits().iter().all(|code| *code == EXIT_CANCELLED));
}

#[tokio::test]
async fn test_panicking_runtime_still_reports_stopped() {
    let subjects = Subjects::new(DEFAULT_NAMESPACE).unwrap();
    let bus = bus_with_agent_stream(&subjects).await;
    let runtime = Arc::new(ScriptedRuntime::default());
    let cancel = CancellationToken::new();
    let mut dispatcher = Dispatcher::new(
        worker_context(bus.clone(), runtime, subjects.clone()),
        cancel.clone(),
    );
    dispatcher
        .create_job(Some("w1".to_string()), start("inline://panic"))
        .unwrap();

    let stopper = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        stopper.cancel();
    });

    let (_inbound_tx, inbound_rx) = mpsc::channel(1);
    let (outbound_tx, _outbound_rx) = mpsc::channel(1);
    tokio::time::timeout(Duration::from_secs(3), dispatcher.run(inbound_rx, outbound_tx))
        .await
        .expect("dispatcher hung on a panicked worker")
        .unwrap();

    assert_eq!(dispatcher.stopped_workers(), 1);
    assert_eq!(dispatcher.live_workers(), 0);
    let statuses = wait_for(&bus, subjects.status(AGENT, "w1").unwrap(), 1).await;
    assert_eq!(
        statuses[0].decode().unwrap(),
        ProtocolMessage::UpdateWorkerStatus(UpdateWorkerStatus {
            exit_code: EXIT_FAILURE
        })
    );
}
