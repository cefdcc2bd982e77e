//! A scripted in-process kernel speaking the JSON-over-WebSocket protocol.
//!
//! Listens on a shell port and, optionally, a control port. Every message it
//! receives is forwarded to the test; the common requests get canned answers.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use kernel_wire::{Channel, Header, WireMessage};
use kerneld::KernelEndpoint;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

pub const KERNEL_SESSION: &str = "fake-kernel-session";

/// RPC methods the fake kernel never answers.
pub const SILENT_METHOD: &str = "never_answered";
/// RPC method answered with a JSON-RPC error.
pub const FAILING_METHOD: &str = "fails";

#[derive(Debug, Clone, Copy)]
pub struct Behavior {
    pub control_channel: bool,
    /// Close every comm the frontend tries to open.
    pub reject_comms: bool,
    /// Leave `is_complete_request` unanswered.
    pub silent_is_complete: bool,
    /// Kernel-initiated `comm_open`s pushed on shell right after a
    /// `shutdown_reply`.
    pub comms_after_shutdown: usize,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            control_channel: true,
            reject_comms: false,
            silent_is_complete: false,
            comms_after_shutdown: 0,
        }
    }
}

type Writer = mpsc::UnboundedSender<WsMessage>;

#[derive(Default)]
struct Writers {
    shell: Option<Writer>,
    control: Option<Writer>,
}

pub struct FakeKernel {
    pub endpoint: KernelEndpoint,
    received: mpsc::UnboundedReceiver<(Channel, WireMessage)>,
    writers: Arc<Mutex<Writers>>,
}

impl FakeKernel {
    pub async fn start(behavior: Behavior) -> Self {
        let shell = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let control = if behavior.control_channel {
            Some(TcpListener::bind("127.0.0.1:0").await.unwrap())
        } else {
            None
        };
        Self::serve_on(behavior, shell, control)
    }

    /// Serve on fixed ports, e.g. ones a kernel process manager leased.
    /// Retries binding while the ports are still held elsewhere.
    pub async fn start_on(behavior: Behavior, shell_port: u16, control_port: Option<u16>) -> Self {
        let shell = bind_with_retry(shell_port).await;
        let control = match control_port {
            Some(port) => Some(bind_with_retry(port).await),
            None => None,
        };
        Self::serve_on(behavior, shell, control)
    }

    fn serve_on(behavior: Behavior, shell: TcpListener, control: Option<TcpListener>) -> Self {
        let shell_port = shell.local_addr().unwrap().port();
        let (received_tx, received) = mpsc::unbounded_channel();
        let writers = Arc::new(Mutex::new(Writers::default()));

        tokio::spawn(serve(
            shell,
            Channel::Shell,
            behavior,
            received_tx.clone(),
            writers.clone(),
        ));

        let control_port = control.map(|control| {
            let port = control.local_addr().unwrap().port();
            tokio::spawn(serve(
                control,
                Channel::Control,
                behavior,
                received_tx,
                writers.clone(),
            ));
            port
        });

        Self {
            endpoint: KernelEndpoint::localhost(shell_port, control_port),
            received,
            writers,
        }
    }

    /// Next message of `msg_type` the kernel received, skipping others.
    pub async fn expect(&mut self, msg_type: &str) -> (Channel, WireMessage) {
        let wait = async {
            loop {
                let (channel, msg) = self.received.recv().await.expect("fake kernel stopped");
                if msg.msg_type() == msg_type {
                    return (channel, msg);
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .unwrap_or_else(|_| panic!("kernel never received {}", msg_type))
    }

    /// Push a message to the client on the shell socket.
    pub fn send_shell(&self, msg: &WireMessage) {
        let writers = self.writers.lock().unwrap();
        let shell = writers.shell.as_ref().expect("shell not connected");
        shell.send(WsMessage::Text(msg.to_text().unwrap())).unwrap();
    }

    /// Close both sockets from the kernel side.
    pub fn hang_up(&self) {
        let writers = self.writers.lock().unwrap();
        for writer in [&writers.shell, &writers.control].into_iter().flatten() {
            let _ = writer.send(WsMessage::Close(None));
        }
    }

    /// Close only the control socket.
    pub fn hang_up_control(&self) {
        let writers = self.writers.lock().unwrap();
        if let Some(control) = &writers.control {
            let _ = control.send(WsMessage::Close(None));
        }
    }
}

/// A kernel → client message answering `parent`.
pub fn kernel_message(parent: Option<&WireMessage>, msg_type: &str, content: Value) -> WireMessage {
    WireMessage {
        header: Header::new(msg_type, KERNEL_SESSION),
        parent_header: parent.map(|p| p.header.clone()),
        metadata: json!({}),
        content,
        buffers: Vec::new(),
    }
}

async fn bind_with_retry(port: u16) -> TcpListener {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => return listener,
            Err(e) if tokio::time::Instant::now() >= deadline => {
                panic!("cannot bind fake kernel port {}: {}", port, e)
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }
}

fn status(parent: &WireMessage, state: &str) -> WireMessage {
    kernel_message(Some(parent), "status", json!({"execution_state": state}))
}

async fn serve(
    listener: TcpListener,
    channel: Channel,
    behavior: Behavior,
    received: mpsc::UnboundedSender<(Channel, WireMessage)>,
    writers: Arc<Mutex<Writers>>,
) {
    // Plain TCP probes (readiness polling) come and go before the client
    let ws = loop {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        if let Ok(ws) = accept_async(stream).await {
            break ws;
        }
    };
    drop(listener);
    let (mut sink, mut stream) = ws.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    {
        let mut writers = writers.lock().unwrap();
        match channel {
            Channel::Shell => writers.shell = Some(tx.clone()),
            Channel::Control => writers.control = Some(tx.clone()),
        }
    }
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let closing = matches!(frame, WsMessage::Close(_));
            if sink.send(frame).await.is_err() || closing {
                break;
            }
        }
    });

    let send = |msg: WireMessage| {
        let _ = tx.send(WsMessage::Text(msg.to_text().unwrap()));
    };

    while let Some(Ok(frame)) = stream.next().await {
        let text = match frame {
            WsMessage::Text(text) => text,
            WsMessage::Close(_) => break,
            _ => continue,
        };
        let msg = WireMessage::from_text(&text).unwrap();
        let _ = received.send((channel, msg.clone()));

        match msg.msg_type() {
            "kernel_info_request" => {
                send(status(&msg, "busy"));
                send(kernel_message(
                    Some(&msg),
                    "kernel_info_reply",
                    json!({
                        "status": "ok",
                        "protocol_version": "5.3",
                        "implementation": "fakekernel",
                        "implementation_version": "0.1",
                        "language_info": {"name": "python", "version": "3.12.1"},
                        "banner": "fake"
                    }),
                ));
                send(status(&msg, "idle"));
            }
            "comm_open" => {
                send(status(&msg, "busy"));
                if behavior.reject_comms {
                    let comm_id = msg.content["comm_id"].clone();
                    send(kernel_message(
                        Some(&msg),
                        "comm_close",
                        json!({"comm_id": comm_id, "data": {}}),
                    ));
                }
                send(status(&msg, "idle"));
            }
            "execute_request" => {
                let code = msg.content["code"].as_str().unwrap_or_default().to_string();
                send(status(&msg, "busy"));
                send(kernel_message(
                    Some(&msg),
                    "execute_input",
                    json!({"code": code, "execution_count": 1}),
                ));
                if code == "input()" {
                    send(kernel_message(
                        Some(&msg),
                        "input_request",
                        json!({"prompt": "value: ", "password": false}),
                    ));
                    // The rest happens when input_reply arrives
                    continue;
                }
                if code == "raise" {
                    send(kernel_message(
                        Some(&msg),
                        "error",
                        json!({"ename": "ValueError", "evalue": "boom", "traceback": ["line 1"]}),
                    ));
                } else {
                    send(kernel_message(
                        Some(&msg),
                        "stream",
                        json!({"name": "stdout", "text": format!("ran {}\n", code)}),
                    ));
                    send(kernel_message(
                        Some(&msg),
                        "execute_result",
                        json!({"data": {"text/plain": "2"}, "metadata": {}, "execution_count": 1}),
                    ));
                }
                send(kernel_message(
                    Some(&msg),
                    "execute_reply",
                    json!({"status": "ok", "execution_count": 1}),
                ));
                send(status(&msg, "idle"));
            }
            "input_reply" => {
                let value = msg.content["value"].as_str().unwrap_or_default().to_string();
                send(kernel_message(
                    Some(&msg),
                    "stream",
                    json!({"name": "stdout", "text": format!("got {}\n", value)}),
                ));
            }
            "is_complete_request" if behavior.silent_is_complete => {}
            "is_complete_request" => {
                let code = msg.content["code"].as_str().unwrap_or_default();
                let status = if code.trim_end().ends_with(':') {
                    "incomplete"
                } else {
                    "complete"
                };
                send(kernel_message(
                    Some(&msg),
                    "is_complete_reply",
                    json!({"status": status, "indent": "    "}),
                ));
            }
            "complete_request" => {
                let cursor = msg.content["cursor_pos"].as_u64().unwrap_or_default();
                send(kernel_message(
                    Some(&msg),
                    "complete_reply",
                    json!({
                        "status": "ok",
                        "matches": ["print", "property"],
                        "cursor_start": 0,
                        "cursor_end": cursor,
                        "metadata": {}
                    }),
                ));
            }
            "comm_msg" => {
                let comm_id = msg.content["comm_id"].clone();
                let data = &msg.content["data"];
                let id = data["id"].clone();
                if let Some(ask) = data.get("ask") {
                    send(kernel_message(
                        Some(&msg),
                        "comm_msg",
                        json!({"comm_id": comm_id, "data": {"answer": ask}}),
                    ));
                    continue;
                }
                let method = data["params"]["method"].as_str().unwrap_or_default();
                let params = data["params"]["params"].clone();
                match method {
                    "" | SILENT_METHOD => {}
                    FAILING_METHOD => send(kernel_message(
                        Some(&msg),
                        "comm_msg",
                        json!({
                            "comm_id": comm_id,
                            "data": {
                                "jsonrpc": "2.0",
                                "id": id,
                                "error": {"code": -32601, "message": "Method not found"}
                            }
                        }),
                    )),
                    "set_working_directory" => {
                        send(kernel_message(
                            None,
                            "comm_msg",
                            json!({
                                "comm_id": comm_id,
                                "data": {
                                    "jsonrpc": "2.0",
                                    "method": "working_directory",
                                    "params": {"directory": params[0]}
                                }
                            }),
                        ));
                        send(kernel_message(
                            Some(&msg),
                            "comm_msg",
                            json!({"comm_id": comm_id, "data": {"jsonrpc": "2.0", "id": id, "result": null}}),
                        ));
                    }
                    _ => send(kernel_message(
                        Some(&msg),
                        "comm_msg",
                        json!({
                            "comm_id": comm_id,
                            "data": {"jsonrpc": "2.0", "id": id, "result": {"method": method, "params": params}}
                        }),
                    )),
                }
            }
            "interrupt_request" => {
                send(kernel_message(
                    Some(&msg),
                    "interrupt_reply",
                    json!({"status": "ok"}),
                ));
            }
            "shutdown_request" => {
                let restart = msg.content["restart"].clone();
                send(kernel_message(
                    Some(&msg),
                    "shutdown_reply",
                    json!({"status": "ok", "restart": restart}),
                ));
                let shell = writers.lock().unwrap().shell.clone();
                if let Some(shell) = shell {
                    for i in 0..behavior.comms_after_shutdown {
                        let open = kernel_message(
                            None,
                            "comm_open",
                            json!({"comm_id": format!("late-{}", i), "target_name": "late", "data": {}}),
                        );
                        let _ = shell.send(WsMessage::Text(open.to_text().unwrap()));
                    }
                }
            }
            _ => {}
        }
    }
}
