//! Session bridge against an in-process fake kernel.

mod fake_kernel;

use std::time::Duration;

use fake_kernel::{kernel_message, Behavior, FakeKernel, FAILING_METHOD, KERNEL_SESSION, SILENT_METHOD};
use kernel_wire::{Channel, ExecutionState, IsCompleteStatus, KernelFamily, StreamName};
use kerneld::{
    ExecuteOptions, ExecutionMode, KernelSession, RuntimeMetadata, RuntimePayload, RuntimeState,
    SessionConfig, SessionEndReason, SessionError, SessionEvent, ShutdownReason,
};
use serde_json::json;
use tokio::sync::broadcast;

fn new_session(config: SessionConfig) -> KernelSession {
    KernelSession::new(
        RuntimeMetadata {
            session_id: "s1".into(),
            language: "python".into(),
            display_name: "Python 3".into(),
            ..Default::default()
        },
        KernelFamily::Python,
        config,
    )
}

async fn connected(behavior: Behavior, config: SessionConfig) -> (FakeKernel, KernelSession) {
    let kernel = FakeKernel::start(behavior).await;
    let session = new_session(config);
    session.connect(kernel.endpoint.clone()).await.unwrap();
    (kernel, session)
}

async fn next_event(events: &mut broadcast::Receiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("no session event within 5s")
        .expect("event stream closed")
}

/// Collect events until the kernel reports idle for `parent_id`.
async fn events_until_idle(
    events: &mut broadcast::Receiver<SessionEvent>,
    parent_id: &str,
) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    loop {
        let event = next_event(events).await;
        let done = matches!(
            &event,
            SessionEvent::Message(m)
                if m.parent_id == parent_id
                    && m.payload == RuntimePayload::State { state: ExecutionState::Idle }
        );
        seen.push(event);
        if done {
            return seen;
        }
    }
}

async fn wait_exited(session: &KernelSession) {
    let mut state = session.state_watch();
    tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| s.is_exited()))
        .await
        .expect("session never exited")
        .unwrap();
}

#[tokio::test]
async fn test_handshake_reaches_idle() {
    let kernel = FakeKernel::start(Behavior::default()).await;
    let session = new_session(SessionConfig::default());
    let mut events = session.subscribe();

    session.connect(kernel.endpoint.clone()).await.unwrap();

    let mut states = Vec::new();
    while states.last() != Some(&RuntimeState::Idle) {
        if let SessionEvent::State(state) = next_event(&mut events).await {
            states.push(state);
        }
    }
    assert_eq!(
        states,
        vec![RuntimeState::Starting, RuntimeState::Ready, RuntimeState::Idle]
    );
    assert_eq!(session.runtime_state(), RuntimeState::Idle);

    let metadata = session.metadata();
    assert_eq!(metadata.version.as_deref(), Some("3.12.1"));
    assert_eq!(metadata.implementation.as_deref(), Some("fakekernel"));

    let ui = session.list_clients(Some("erdos.ui"));
    assert_eq!(ui.len(), 1);
    assert_eq!(Some(ui[0].comm_id.clone()), session.ui_comm_id());
    assert_eq!(session.pending_count(), 0);
}

#[tokio::test]
async fn test_execute_emits_one_idle_transition() {
    let (mut kernel, session) = connected(Behavior::default(), SessionConfig::default()).await;
    let mut events = session.subscribe();

    let options = ExecuteOptions {
        batch_id: Some("batch-7".into()),
        ..Default::default()
    };
    session.execute("1+1", "e1", &options).unwrap();

    let (channel, request) = kernel.expect("execute_request").await;
    assert_eq!(channel, Channel::Shell);
    assert_eq!(request.msg_id(), "e1");
    assert_eq!(request.metadata["batch_id"], "batch-7");
    assert_eq!(request.content["store_history"], true);

    let seen = events_until_idle(&mut events, "e1").await;

    let idle = seen
        .iter()
        .filter(|e| **e == SessionEvent::State(RuntimeState::Idle))
        .count();
    let busy = seen
        .iter()
        .filter(|e| **e == SessionEvent::State(RuntimeState::Busy))
        .count();
    assert_eq!(idle, 1);
    assert_eq!(busy, 1);

    let errors = seen.iter().filter(|e| {
        matches!(e, SessionEvent::Message(m)
            if m.parent_id == "e1" && matches!(m.payload, RuntimePayload::Error { .. }))
    });
    assert_eq!(errors.count(), 0);

    assert!(seen.iter().any(|e| matches!(e,
        SessionEvent::Message(m) if m.payload == RuntimePayload::Stream {
            name: StreamName::Stdout,
            text: "ran 1+1\n".into(),
        })));
    assert!(seen.iter().any(|e| matches!(e,
        SessionEvent::Message(m) if matches!(m.payload, RuntimePayload::Result { .. }))));
    assert_eq!(session.runtime_state(), RuntimeState::Idle);
    assert!(!session.dynamic_state().busy);
}

#[tokio::test]
async fn test_execution_error_is_a_message() {
    let (mut kernel, session) = connected(Behavior::default(), SessionConfig::default()).await;
    let mut events = session.subscribe();

    let options = ExecuteOptions {
        mode: ExecutionMode::Silent,
        ..Default::default()
    };
    session.execute("raise", "e2", &options).unwrap();
    let (_, request) = kernel.expect("execute_request").await;
    assert_eq!(request.content["silent"], true);
    assert_eq!(request.content["store_history"], false);

    let seen = events_until_idle(&mut events, "e2").await;
    let error = seen.iter().find_map(|e| match e {
        SessionEvent::Message(m) if m.parent_id == "e2" => match &m.payload {
            RuntimePayload::Error { name, message, .. } => Some((name.clone(), message.clone())),
            _ => None,
        },
        _ => None,
    });
    assert_eq!(error, Some(("ValueError".into(), "boom".into())));
    assert_eq!(session.runtime_state(), RuntimeState::Idle);
}

#[tokio::test]
async fn test_call_method_timeout_clears_pending() {
    let config = SessionConfig {
        rpc_timeout: Duration::from_millis(200),
        ..Default::default()
    };
    let (_kernel, session) = connected(Behavior::default(), config).await;

    let err = session
        .call_method(SILENT_METHOD, vec![json!("/tmp")])
        .await
        .unwrap_err();
    assert!(
        matches!(err, SessionError::Timeout { ref operation } if operation == SILENT_METHOD),
        "unexpected error: {:?}",
        err
    );
    assert_eq!(session.pending_count(), 0);
}

#[tokio::test]
async fn test_late_duplicate_rpc_replies_are_dropped() {
    let config = SessionConfig {
        rpc_timeout: Duration::from_millis(200),
        ..Default::default()
    };
    let (mut kernel, session) = connected(Behavior::default(), config).await;

    assert!(session.call_method(SILENT_METHOD, vec![]).await.is_err());
    let (_, call) = kernel.expect("comm_msg").await;
    let id = call.content["data"]["id"].clone();
    let comm_id = call.content["comm_id"].clone();

    for _ in 0..2 {
        kernel.send_shell(&kernel_message(
            Some(&call),
            "comm_msg",
            json!({"comm_id": comm_id, "data": {"jsonrpc": "2.0", "id": id, "result": "late"}}),
        ));
    }

    // The session keeps working and the late replies resolve nothing
    session.set_working_directory("/tmp").await.unwrap();
    assert_eq!(session.pending_count(), 0);
    assert_eq!(session.runtime_state(), RuntimeState::Idle);
}

#[tokio::test]
async fn test_rpc_results_errors_and_events() {
    let (_kernel, session) = connected(Behavior::default(), SessionConfig::default()).await;

    let result = session
        .call_method("echo", vec![json!(1), json!("two")])
        .await
        .unwrap();
    assert_eq!(result, json!({"method": "echo", "params": [1, "two"]}));

    let err = session.call_method(FAILING_METHOD, vec![]).await.unwrap_err();
    assert!(matches!(err, SessionError::Rpc { code: -32601, .. }));

    session.set_working_directory("/work/project").await.unwrap();
    assert_eq!(
        session.dynamic_state().working_directory.as_deref(),
        Some("/work/project")
    );
}

#[tokio::test]
async fn test_is_complete_and_complete() {
    let (_kernel, session) = connected(Behavior::default(), SessionConfig::default()).await;

    assert_eq!(
        session.is_code_fragment_complete("x = 1").await.unwrap(),
        IsCompleteStatus::Complete
    );
    assert_eq!(
        session.is_code_fragment_complete("for i in x:").await.unwrap(),
        IsCompleteStatus::Incomplete
    );

    let reply = session.complete("pr", 2).await.unwrap();
    assert_eq!(reply.matches, vec!["print", "property"]);
    assert_eq!(reply.cursor_end, 2);
    assert_eq!(session.pending_count(), 0);
}

#[tokio::test]
async fn test_is_complete_timeout_clears_pending() {
    let behavior = Behavior {
        silent_is_complete: true,
        ..Default::default()
    };
    let config = SessionConfig {
        is_complete_timeout: Duration::from_millis(200),
        ..Default::default()
    };
    let (_kernel, session) = connected(behavior, config).await;

    let err = session.is_code_fragment_complete("x = 1").await.unwrap_err();
    assert!(
        matches!(err, SessionError::Timeout { ref operation } if operation == "is_complete"),
        "unexpected error: {:?}",
        err
    );
    assert_eq!(session.pending_count(), 0);
    assert!(session.runtime_state().is_running());
}

#[tokio::test]
async fn test_client_request_answered_by_parent_header() {
    let (_kernel, session) = connected(Behavior::default(), SessionConfig::default()).await;
    let comm_id = session.create_client("plots", json!({})).await.unwrap();

    let answer = session
        .send_client_request(&comm_id, json!({"ask": "size"}), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(answer, json!({"answer": "size"}));
    assert_eq!(session.pending_count(), 0);

    let err = session
        .send_client_request(&comm_id, json!({"quiet": true}), Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(
        matches!(err, SessionError::Timeout { ref operation } if operation == "comm_msg"),
        "unexpected error: {:?}",
        err
    );
    assert_eq!(session.pending_count(), 0);

    assert!(matches!(
        session
            .send_client_request("nope", json!({}), Duration::from_secs(1))
            .await,
        Err(SessionError::UnknownClient(_))
    ));
}

#[tokio::test]
async fn test_rpc_id_takes_precedence_over_parent_header() {
    let (mut kernel, session) = connected(Behavior::default(), SessionConfig::default()).await;
    let comm_id = session.create_client("plots", json!({})).await.unwrap();

    let call = tokio::spawn({
        let session = session.clone();
        async move { session.call_method(SILENT_METHOD, vec![]).await }
    });
    let (_, call_msg) = kernel.expect("comm_msg").await;
    let rpc_id = call_msg.content["data"]["id"].clone();

    let request = tokio::spawn({
        let session = session.clone();
        let comm_id = comm_id.clone();
        async move {
            session
                .send_client_request(&comm_id, json!({"quiet": true}), Duration::from_secs(5))
                .await
        }
    });
    let (_, request_msg) = kernel.expect("comm_msg").await;
    assert_eq!(request_msg.content["comm_id"], comm_id.as_str());

    // Parented on the client request, but carrying the call's JSON-RPC id
    kernel.send_shell(&kernel_message(
        Some(&request_msg),
        "comm_msg",
        json!({"comm_id": comm_id, "data": {"jsonrpc": "2.0", "id": rpc_id, "result": "rpc"}}),
    ));
    assert_eq!(call.await.unwrap().unwrap(), json!("rpc"));
    assert_eq!(session.pending_count(), 1);

    kernel.send_shell(&kernel_message(
        Some(&request_msg),
        "comm_msg",
        json!({"comm_id": comm_id, "data": {"done": true}}),
    ));
    assert_eq!(request.await.unwrap().unwrap(), json!({"done": true}));
    assert_eq!(session.pending_count(), 0);
}

#[tokio::test]
async fn test_interrupt_uses_control_channel() {
    let (mut kernel, session) = connected(Behavior::default(), SessionConfig::default()).await;
    session.interrupt().unwrap();
    let (channel, _) = kernel.expect("interrupt_request").await;
    assert_eq!(channel, Channel::Control);
}

#[tokio::test]
async fn test_interrupt_without_control_uses_shell() {
    let behavior = Behavior {
        control_channel: false,
        ..Default::default()
    };
    let (mut kernel, session) = connected(behavior, SessionConfig::default()).await;
    session.interrupt().unwrap();
    let (channel, _) = kernel.expect("interrupt_request").await;
    assert_eq!(channel, Channel::Shell);
}

#[tokio::test]
async fn test_interrupt_falls_back_when_control_closes() {
    let (mut kernel, session) = connected(Behavior::default(), SessionConfig::default()).await;
    kernel.hang_up_control();
    tokio::time::sleep(Duration::from_millis(200)).await;

    session.interrupt().unwrap();
    let (channel, _) = kernel.expect("interrupt_request").await;
    assert_eq!(channel, Channel::Shell);
    assert!(session.runtime_state().is_running());
}

#[tokio::test]
async fn test_input_reply_echoes_request_header() {
    let (mut kernel, session) = connected(Behavior::default(), SessionConfig::default()).await;
    let mut events = session.subscribe();

    session
        .execute("input()", "e3", &ExecuteOptions::default())
        .unwrap();

    let input_id = loop {
        if let SessionEvent::Message(m) = next_event(&mut events).await {
            if let RuntimePayload::Input { prompt, password } = &m.payload {
                assert_eq!(prompt, "value: ");
                assert!(!password);
                assert_eq!(m.parent_id, "e3");
                break m.id.clone();
            }
        }
    };

    session.reply_to_input(&input_id, "42").unwrap();
    let (channel, reply) = kernel.expect("input_reply").await;
    assert_eq!(channel, Channel::Shell);
    assert_eq!(reply.parent_msg_id(), Some(input_id.as_str()));
    assert_eq!(reply.header.session, KERNEL_SESSION);
    assert_eq!(reply.content["value"], "42");

    assert!(matches!(
        session.reply_to_input(&input_id, "again"),
        Err(SessionError::UnknownInputRequest(_))
    ));
}

#[tokio::test]
async fn test_client_comms() {
    let (mut kernel, session) = connected(Behavior::default(), SessionConfig::default()).await;

    let comm_id = session
        .create_client("plots", json!({"width": 400}))
        .await
        .unwrap();
    let (_, open) = kernel.expect("comm_open").await;
    // The first comm_open is the UI comm from the handshake
    let open = if open.content["target_name"] == "erdos.ui" {
        kernel.expect("comm_open").await.1
    } else {
        open
    };
    assert_eq!(open.content["comm_id"], comm_id.as_str());
    assert_eq!(open.content["data"]["width"], 400);

    let plots = session.list_clients(Some("plots"));
    assert_eq!(plots.len(), 1);
    assert_eq!(session.list_clients(None).len(), 2);

    session
        .send_client_message(&comm_id, json!({"render": true}))
        .unwrap();
    let (_, data) = kernel.expect("comm_msg").await;
    assert_eq!(data.content["data"]["render"], true);

    session.remove_client(&comm_id).unwrap();
    let (_, close) = kernel.expect("comm_close").await;
    assert_eq!(close.content["comm_id"], comm_id.as_str());
    assert!(session.list_clients(Some("plots")).is_empty());

    assert!(matches!(
        session.remove_client(&comm_id),
        Err(SessionError::UnknownClient(_))
    ));
    assert!(matches!(
        session.send_client_message("nope", json!({})),
        Err(SessionError::UnknownClient(_))
    ));
}

#[tokio::test]
async fn test_rejected_ui_comm_fails_start() {
    let behavior = Behavior {
        reject_comms: true,
        ..Default::default()
    };
    let kernel = FakeKernel::start(behavior).await;
    let session = new_session(SessionConfig::default());

    let err = session.connect(kernel.endpoint.clone()).await.unwrap_err();
    assert!(matches!(err, SessionError::Protocol(_)), "unexpected: {:?}", err);
    assert_eq!(session.runtime_state(), RuntimeState::Exited);
    assert_eq!(session.pending_count(), 0);
}

#[tokio::test]
async fn test_shutdown_rejects_pending_with_disposed() {
    let (mut kernel, session) = connected(Behavior::default(), SessionConfig::default()).await;
    let mut events = session.subscribe();

    let pending = tokio::spawn({
        let session = session.clone();
        async move { session.call_method(SILENT_METHOD, vec![]).await }
    });
    kernel.expect("comm_msg").await;

    session.shutdown(ShutdownReason::Shutdown).await.unwrap();
    let (channel, request) = kernel.expect("shutdown_request").await;
    assert_eq!(channel, Channel::Control);
    assert_eq!(request.content["restart"], false);

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, SessionError::Disposed), "unexpected: {:?}", err);
    assert_eq!(session.runtime_state(), RuntimeState::Exited);

    let mut ended = None;
    while ended.is_none() {
        if let SessionEvent::Ended(reason) = next_event(&mut events).await {
            ended = Some(reason);
        }
    }
    assert_eq!(ended, Some(SessionEndReason::Shutdown));

    assert!(matches!(
        session.execute("1", "e9", &ExecuteOptions::default()),
        Err(SessionError::NotStarted)
    ));
    // Idempotent
    session.shutdown(ShutdownReason::Shutdown).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_messages_after_exit_leave_no_state() {
    let behavior = Behavior {
        comms_after_shutdown: 2000,
        ..Default::default()
    };
    let (mut kernel, session) = connected(behavior, SessionConfig::default()).await;

    session.shutdown(ShutdownReason::Shutdown).await.unwrap();
    kernel.expect("shutdown_request").await;
    assert_eq!(session.runtime_state(), RuntimeState::Exited);

    // Let the dispatcher drain whatever was still queued
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(session.list_clients(Some("late")).is_empty());
    assert!(session.list_clients(None).is_empty());
    assert!(session.ui_comm_id().is_none());
    assert_eq!(session.pending_count(), 0);
    assert_eq!(session.runtime_state(), RuntimeState::Exited);
}

#[tokio::test]
async fn test_kernel_hang_up_exits_session() {
    let (mut kernel, session) = connected(Behavior::default(), SessionConfig::default()).await;
    let mut events = session.subscribe();

    let pending = tokio::spawn({
        let session = session.clone();
        async move { session.call_method(SILENT_METHOD, vec![]).await }
    });
    kernel.expect("comm_msg").await;

    kernel.hang_up();
    wait_exited(&session).await;

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, SessionError::ConnectionClosed), "unexpected: {:?}", err);

    let mut ended = None;
    while ended.is_none() {
        if let SessionEvent::Ended(reason) = next_event(&mut events).await {
            ended = Some(reason);
        }
    }
    assert_eq!(ended, Some(SessionEndReason::ConnectionClosed));
    assert!(session.list_clients(None).is_empty());
}

#[tokio::test]
async fn test_connect_refused_exits() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let session = new_session(SessionConfig::default());
    let err = session
        .connect(kerneld::KernelEndpoint::localhost(port, None))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Connect { .. }));
    assert_eq!(session.runtime_state(), RuntimeState::Exited);
}
