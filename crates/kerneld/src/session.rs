//! A session: one kernel, its sockets, and everything correlated over them.
//!
//! A single dispatcher task per session consumes everything the transport
//! reads, in receipt order. It owns every state transition except the final
//! `Exited` of an explicit shutdown, resolves pending requests and keeps the
//! comm registry and dynamic state current. Public operations only enqueue
//! writes and, where they need an answer, await a one-shot with a deadline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use kernel_launch::{KernelExit, KernelLaunchSpec, KernelProcessHandle, KernelProcessManager};
use kernel_wire::{
    Channel, CommClose, CommMsg, CommOpen, CompleteReply, CompleteRequest, ExecuteRequest,
    ExecutionState, Header, InputReply, InterruptRequest, IsCompleteReply, IsCompleteRequest,
    IsCompleteStatus, KernelContent, KernelFamily, KernelInfoReply, KernelInfoRequest,
    OutgoingContent, Reply, ReplyStatus, ShutdownRequest, WireMessage,
};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use uuid::Uuid;

use crate::comm::{CommChannel, CommRegistry};
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::message::{RuntimeMessage, SessionEndReason, SessionEvent};
use crate::pending::PendingRequests;
use crate::rpc::{self, CommPayload, UiEvent};
use crate::state::{DynamicState, RuntimeMetadata, RuntimeState};
use crate::transport::{connect_channel, ChannelWriter, Inbound, KernelEndpoint};

const EVENT_CAPACITY: usize = 1024;

/// How code submitted with [`KernelSession::execute`] is treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Typed by the user; stored in history.
    #[default]
    Interactive,
    /// Run on the user's behalf; not stored in history.
    NonInteractive,
    Transient,
    /// No output is broadcast and nothing is recorded.
    Silent,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorBehavior {
    /// Abort queued executions after an error.
    #[default]
    Stop,
    Continue,
}

#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub mode: ExecutionMode,
    pub error_behavior: ErrorBehavior,
    pub batch_id: Option<String>,
    pub file_path: Option<String>,
}

impl ExecuteOptions {
    fn request(&self, code: &str) -> ExecuteRequest {
        let mut request = ExecuteRequest::new(code);
        match self.mode {
            ExecutionMode::Interactive => {}
            ExecutionMode::NonInteractive | ExecutionMode::Transient => {
                request.store_history = false;
            }
            ExecutionMode::Silent => {
                request.silent = true;
                request.store_history = false;
                request.allow_stdin = false;
            }
        }
        request.stop_on_error = self.error_behavior == ErrorBehavior::Stop;
        request
    }

    fn metadata(&self) -> Value {
        let mut metadata = Map::new();
        if let Some(batch_id) = &self.batch_id {
            metadata.insert("batch_id".into(), Value::String(batch_id.clone()));
        }
        if let Some(file_path) = &self.file_path {
            metadata.insert("file_path".into(), Value::String(file_path.clone()));
        }
        Value::Object(metadata)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Shutdown,
    Restart,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Inner {
    session_id: String,
    /// `header.session` on everything this side sends.
    client_session: String,
    family: KernelFamily,
    spec: Option<KernelLaunchSpec>,
    config: SessionConfig,
    metadata: StdMutex<RuntimeMetadata>,
    state: watch::Sender<RuntimeState>,
    events: broadcast::Sender<SessionEvent>,
    dynamic: StdMutex<DynamicState>,

    /// Requests answered by a `*_reply`, keyed by request msg_id.
    replies: PendingRequests<Reply>,
    /// JSON-RPC calls on the UI comm, keyed by the embedded id.
    rpc: PendingRequests<Value>,
    /// Client comm requests answered by a `comm_msg` whose parent is the
    /// request, keyed by request msg_id.
    comm_replies: PendingRequests<Value>,
    /// `comm_open`s waiting for the idle that follows them.
    idle: PendingRequests<()>,

    comms: StdMutex<CommRegistry>,
    ui_comm: StdMutex<Option<String>>,
    input_requests: StdMutex<HashMap<String, Header>>,

    shell: StdMutex<Option<ChannelWriter>>,
    control: StdMutex<Option<ChannelWriter>>,
    inbound: StdMutex<Option<mpsc::UnboundedSender<Inbound>>>,
    process: StdMutex<Option<KernelProcessHandle>>,
    disposing: AtomicBool,
}

/// Client side of one kernel session. Cheap to clone.
#[derive(Clone)]
pub struct KernelSession {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for KernelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelSession")
            .field("session_id", &self.inner.session_id)
            .field("state", &self.runtime_state())
            .finish()
    }
}

impl KernelSession {
    /// A session for a kernel that is (or will be) running elsewhere. Use
    /// [`KernelSession::connect`] to attach it.
    pub fn new(metadata: RuntimeMetadata, family: KernelFamily, config: SessionConfig) -> Self {
        Self::build(metadata, family, None, config)
    }

    /// A session that launches its own kernel with [`KernelSession::start`].
    pub fn for_spec(session_id: &str, spec: &KernelLaunchSpec, config: SessionConfig) -> Self {
        let metadata = RuntimeMetadata {
            session_id: session_id.to_string(),
            language: spec.language.clone(),
            display_name: spec.display_name.clone(),
            version: None,
            implementation: None,
        };
        Self::build(metadata, spec.family, Some(spec.clone()), config)
    }

    fn build(
        metadata: RuntimeMetadata,
        family: KernelFamily,
        spec: Option<KernelLaunchSpec>,
        config: SessionConfig,
    ) -> Self {
        let (state, _) = watch::channel(RuntimeState::Uninitialized);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                session_id: metadata.session_id.clone(),
                client_session: Uuid::new_v4().to_string(),
                family,
                spec,
                config,
                metadata: StdMutex::new(metadata),
                state,
                events,
                dynamic: StdMutex::new(DynamicState::default()),
                replies: PendingRequests::new("reply"),
                rpc: PendingRequests::new("rpc"),
                comm_replies: PendingRequests::new("comm"),
                idle: PendingRequests::new("idle"),
                comms: StdMutex::new(CommRegistry::new()),
                ui_comm: StdMutex::new(None),
                input_requests: StdMutex::new(HashMap::new()),
                shell: StdMutex::new(None),
                control: StdMutex::new(None),
                inbound: StdMutex::new(None),
                process: StdMutex::new(None),
                disposing: AtomicBool::new(false),
            }),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn metadata(&self) -> RuntimeMetadata {
        lock(&self.inner.metadata).clone()
    }

    pub fn launch_spec(&self) -> Option<&KernelLaunchSpec> {
        self.inner.spec.as_ref()
    }

    pub fn runtime_state(&self) -> RuntimeState {
        *self.inner.state.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<RuntimeState> {
        self.inner.state.subscribe()
    }

    pub fn dynamic_state(&self) -> DynamicState {
        lock(&self.inner.dynamic).clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn process(&self) -> Option<KernelProcessHandle> {
        lock(&self.inner.process).clone()
    }

    /// Id of the UI comm opened during startup.
    pub fn ui_comm_id(&self) -> Option<String> {
        lock(&self.inner.ui_comm).clone()
    }

    /// Requests currently awaiting an answer, across all correlation tables.
    pub fn pending_count(&self) -> usize {
        self.inner.replies.len()
            + self.inner.rpc.len()
            + self.inner.comm_replies.len()
            + self.inner.idle.len()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Launch the kernel through `manager` and run the startup handshake.
    pub async fn start(&self, manager: &KernelProcessManager) -> Result<(), SessionError> {
        let spec = self.inner.spec.clone().ok_or_else(|| {
            SessionError::Protocol("session has no launch spec".to_string())
        })?;
        self.begin_start()?;

        let handle = match manager.start_kernel(&self.inner.session_id, &spec).await {
            Ok(handle) => handle,
            Err(e) => {
                self.inner.finish(SessionEndReason::StartFailed {
                    message: e.to_string(),
                });
                return Err(e.into());
            }
        };

        let endpoint = KernelEndpoint::localhost(handle.shell_port(), handle.control_port());
        let exit_watch = handle.exit_watch();
        *lock(&self.inner.process) = Some(handle);

        self.establish(endpoint, Some(exit_watch)).await
    }

    /// Attach to a kernel that is already listening on `endpoint`.
    pub async fn connect(&self, endpoint: KernelEndpoint) -> Result<(), SessionError> {
        self.begin_start()?;
        self.establish(endpoint, None).await
    }

    fn begin_start(&self) -> Result<(), SessionError> {
        if self.inner.transition(RuntimeState::Starting) {
            Ok(())
        } else {
            Err(SessionError::Protocol(format!(
                "session {} cannot start from state {}",
                self.inner.session_id,
                self.runtime_state()
            )))
        }
    }

    async fn establish(
        &self,
        endpoint: KernelEndpoint,
        exit_watch: Option<watch::Receiver<Option<KernelExit>>>,
    ) -> Result<(), SessionError> {
        match self.handshake(&endpoint, exit_watch).await {
            Ok(()) => {
                info!(
                    "[session] Session {} ready on port {}",
                    self.inner.session_id, endpoint.shell_port
                );
                Ok(())
            }
            Err(e) => {
                warn!(
                    "[session] Session {} failed to start: {}",
                    self.inner.session_id, e
                );
                self.teardown(SessionEndReason::StartFailed {
                    message: e.to_string(),
                })
                .await;
                Err(e)
            }
        }
    }

    async fn handshake(
        &self,
        endpoint: &KernelEndpoint,
        exit_watch: Option<watch::Receiver<Option<KernelExit>>>,
    ) -> Result<(), SessionError> {
        let family = self.inner.family;
        let (tx, rx) = mpsc::unbounded_channel();

        let shell_url = endpoint
            .url(Channel::Shell)
            .ok_or_else(|| SessionError::Protocol("endpoint has no shell port".into()))?;
        let shell = connect_channel(&shell_url, Channel::Shell, family, tx.clone()).await?;
        *lock(&self.inner.shell) = Some(shell);

        if let Some(control_url) = endpoint.url(Channel::Control) {
            match connect_channel(&control_url, Channel::Control, family, tx.clone()).await {
                Ok(control) => *lock(&self.inner.control) = Some(control),
                Err(e) => warn!(
                    "[session] No control channel for {}, interrupts use shell: {}",
                    self.inner.session_id, e
                ),
            }
        }

        *lock(&self.inner.inbound) = Some(tx.clone());
        tokio::spawn(dispatch(self.inner.clone(), rx, exit_watch));

        let timeout = self.inner.config.handshake_timeout;
        match self
            .request(&KernelInfoRequest {}, Channel::Shell, timeout, "kernel_info")
            .await
        {
            Ok(reply) => self.record_kernel_info(&reply),
            Err(e @ (SessionError::ConnectionClosed | SessionError::Disposed)) => return Err(e),
            Err(e) => warn!(
                "[session] kernel_info_request failed for {}: {}",
                self.inner.session_id, e
            ),
        }

        let comm_id = Uuid::new_v4().to_string();
        let target = self.inner.config.ui_comm_target.clone();
        self.open_comm(&comm_id, &target, Value::Object(Map::new()))
            .await?;
        *lock(&self.inner.ui_comm) = Some(comm_id);

        let (ack_tx, ack_rx) = oneshot::channel();
        tx.send(Inbound::HandshakeComplete(ack_tx))
            .map_err(|_| SessionError::ConnectionClosed)?;
        ack_rx.await.map_err(|_| SessionError::ConnectionClosed)?;

        if self.runtime_state().is_running() {
            Ok(())
        } else {
            Err(SessionError::ConnectionClosed)
        }
    }

    fn record_kernel_info(&self, reply: &Reply) {
        match serde_json::from_value::<KernelInfoReply>(reply.content.clone()) {
            Ok(info) => {
                let mut metadata = lock(&self.inner.metadata);
                if !info.language_info.version.is_empty() {
                    metadata.version = Some(info.language_info.version);
                }
                if !info.implementation.is_empty() {
                    metadata.implementation = Some(info.implementation);
                }
            }
            Err(e) => debug!("[session] Unparseable kernel_info_reply: {}", e),
        }
    }

    /// Ask the kernel to shut down, then close the sockets and stop the
    /// process. Pending requests are rejected with `Disposed`. Safe to call
    /// more than once.
    pub async fn shutdown(&self, reason: ShutdownReason) -> Result<(), SessionError> {
        if self.runtime_state().is_exited() {
            return Ok(());
        }
        if self.inner.disposing.swap(true, Ordering::SeqCst) {
            // Someone else is already shutting down
            let mut state = self.state_watch();
            let _ = state.wait_for(|s| s.is_exited()).await;
            return Ok(());
        }

        info!(
            "[session] Shutting down {} ({:?})",
            self.inner.session_id, reason
        );

        if self.runtime_state().is_running() {
            let request = ShutdownRequest {
                restart: reason == ShutdownReason::Restart,
            };
            let timeout = self.inner.config.shutdown_timeout;
            if let Err(e) = self
                .request(&request, Channel::Control, timeout, "shutdown")
                .await
            {
                debug!(
                    "[session] No shutdown_reply from {}: {}",
                    self.inner.session_id, e
                );
            }
        }

        self.teardown(SessionEndReason::Shutdown).await;
        Ok(())
    }

    /// Close the sockets without asking the kernel to exit. A kernel this
    /// session launched is still stopped.
    pub async fn detach(&self) {
        if self.runtime_state().is_exited() || self.inner.disposing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.teardown(SessionEndReason::Shutdown).await;
    }

    /// Shut this session down and start a successor with the same id and
    /// launch spec. This session stays `Exited`.
    pub async fn restart(
        &self,
        manager: &KernelProcessManager,
    ) -> Result<KernelSession, SessionError> {
        let successor = self.successor()?;
        self.shutdown(ShutdownReason::Restart).await?;
        successor.start(manager).await?;
        Ok(successor)
    }

    /// A fresh, unstarted session with this session's id, spec and config.
    pub fn successor(&self) -> Result<KernelSession, SessionError> {
        let spec = self.inner.spec.as_ref().ok_or_else(|| {
            SessionError::Protocol("session was not launched from a spec".to_string())
        })?;
        Ok(Self::for_spec(
            &self.inner.session_id,
            spec,
            self.inner.config.clone(),
        ))
    }

    async fn teardown(&self, reason: SessionEndReason) {
        self.inner.close_writers();

        let process = lock(&self.inner.process).clone();
        if let Some(process) = process {
            process.terminate().await;
        }

        self.inner.finish(reason);

        let inbound = lock(&self.inner.inbound).take();
        if let Some(inbound) = inbound {
            let _ = inbound.send(Inbound::Stop);
        }
    }

    // ------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------

    fn ensure_running(&self) -> Result<(), SessionError> {
        if self.runtime_state().is_running() {
            Ok(())
        } else {
            Err(SessionError::NotStarted)
        }
    }

    fn send(&self, channel: Channel, msg: &WireMessage) -> Result<(), SessionError> {
        if channel == Channel::Control {
            let control = lock(&self.inner.control).clone();
            if let Some(control) = control {
                match control.send(msg) {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        warn!(
                            "[session] Control channel for {} failed ({}), using shell",
                            self.inner.session_id, e
                        );
                        *lock(&self.inner.control) = None;
                    }
                }
            }
        }

        let shell = lock(&self.inner.shell).clone();
        shell.ok_or(SessionError::ConnectionClosed)?.send(msg)
    }

    /// Send a request and await its `*_reply`.
    async fn request<C: OutgoingContent>(
        &self,
        content: &C,
        channel: Channel,
        timeout: Duration,
        operation: &str,
    ) -> Result<Reply, SessionError> {
        let msg = WireMessage::request(content, &self.inner.client_session)?;
        let pending = self.inner.replies.register(msg.msg_id())?;
        if let Err(e) = self.send(channel, &msg) {
            self.inner.replies.remove(msg.msg_id());
            return Err(e);
        }
        self.inner.replies.wait(pending, timeout, operation).await
    }

    async fn open_comm(
        &self,
        comm_id: &str,
        target_name: &str,
        data: Value,
    ) -> Result<(), SessionError> {
        let open = CommOpen {
            comm_id: comm_id.to_string(),
            target_name: target_name.to_string(),
            data,
            target_module: None,
        };
        let msg = WireMessage::request(&open, &self.inner.client_session)?;
        let pending = self.inner.idle.register(msg.msg_id())?;
        lock(&self.inner.comms).begin_open(comm_id, target_name, msg.msg_id());

        if let Err(e) = self.send(Channel::Shell, &msg) {
            self.inner.idle.remove(msg.msg_id());
            lock(&self.inner.comms).close(comm_id);
            return Err(e);
        }

        let timeout = self.inner.config.handshake_timeout;
        match self.inner.idle.wait(pending, timeout, "comm_open").await {
            Ok(()) => {
                lock(&self.inner.comms).confirm_open(comm_id);
                debug!("[session] Opened comm {} ({})", comm_id, target_name);
                Ok(())
            }
            Err(e) => {
                lock(&self.inner.comms).close(comm_id);
                Err(e)
            }
        }
    }

    /// Submit code. Returns as soon as the request is queued; output arrives
    /// as messages whose `parent_id` is `execution_id`.
    pub fn execute(
        &self,
        code: &str,
        execution_id: &str,
        options: &ExecuteOptions,
    ) -> Result<(), SessionError> {
        self.ensure_running()?;
        let msg = WireMessage::request(&options.request(code), &self.inner.client_session)?
            .with_msg_id(execution_id)
            .with_metadata(options.metadata());
        self.send(Channel::Shell, &msg)
    }

    pub async fn is_code_fragment_complete(
        &self,
        code: &str,
    ) -> Result<IsCompleteStatus, SessionError> {
        self.ensure_running()?;
        let request = IsCompleteRequest {
            code: code.to_string(),
        };
        let timeout = self.inner.config.is_complete_timeout;
        let reply = self
            .request(&request, Channel::Shell, timeout, "is_complete")
            .await?;
        let reply: IsCompleteReply = serde_json::from_value(reply.content)
            .map_err(|e| SessionError::Protocol(format!("bad is_complete_reply: {}", e)))?;
        Ok(reply.status)
    }

    pub async fn complete(&self, code: &str, cursor_pos: u64) -> Result<CompleteReply, SessionError> {
        self.ensure_running()?;
        let request = CompleteRequest {
            code: code.to_string(),
            cursor_pos,
        };
        let timeout = self.inner.config.complete_timeout;
        let reply = self
            .request(&request, Channel::Shell, timeout, "complete")
            .await?;
        serde_json::from_value(reply.content)
            .map_err(|e| SessionError::Protocol(format!("bad complete_reply: {}", e)))
    }

    /// Interrupt the running execution. Uses the control channel once it is
    /// established and falls back to shell if writing to it fails.
    pub fn interrupt(&self) -> Result<(), SessionError> {
        self.ensure_running()?;
        let msg = WireMessage::request(&InterruptRequest {}, &self.inner.client_session)?;
        self.send(InterruptRequest::CHANNEL, &msg)
    }

    /// Answer the `input_request` whose msg_id is `parent_id`.
    pub fn reply_to_input(&self, parent_id: &str, value: &str) -> Result<(), SessionError> {
        self.ensure_running()?;
        let request = lock(&self.inner.input_requests)
            .remove(parent_id)
            .ok_or_else(|| SessionError::UnknownInputRequest(parent_id.to_string()))?;
        let msg =
            WireMessage::request(&InputReply::new(value), &request.session)?.with_parent(request);
        self.send(Channel::Shell, &msg)
    }

    /// Open a comm to `target_name` and wait for the kernel to accept it.
    pub async fn create_client(
        &self,
        target_name: &str,
        params: Value,
    ) -> Result<String, SessionError> {
        self.ensure_running()?;
        let comm_id = Uuid::new_v4().to_string();
        self.open_comm(&comm_id, target_name, params).await?;
        Ok(comm_id)
    }

    pub fn list_clients(&self, target_name: Option<&str>) -> Vec<CommChannel> {
        lock(&self.inner.comms).list(target_name)
    }

    pub fn remove_client(&self, comm_id: &str) -> Result<(), SessionError> {
        self.ensure_running()?;
        if lock(&self.inner.comms).get(comm_id).is_none() {
            return Err(SessionError::UnknownClient(comm_id.to_string()));
        }
        let close = CommClose {
            comm_id: comm_id.to_string(),
            data: Value::Object(Map::new()),
        };
        let msg = WireMessage::request(&close, &self.inner.client_session)?;
        self.send(Channel::Shell, &msg)?;

        lock(&self.inner.comms).close(comm_id);
        let mut ui_comm = lock(&self.inner.ui_comm);
        if ui_comm.as_deref() == Some(comm_id) {
            *ui_comm = None;
        }
        Ok(())
    }

    pub fn send_client_message(&self, comm_id: &str, data: Value) -> Result<(), SessionError> {
        self.ensure_running()?;
        if !lock(&self.inner.comms).is_open(comm_id) {
            return Err(SessionError::UnknownClient(comm_id.to_string()));
        }
        let comm = CommMsg {
            comm_id: comm_id.to_string(),
            data,
        };
        let msg = WireMessage::request(&comm, &self.inner.client_session)?;
        self.send(Channel::Shell, &msg)
    }

    /// Send `data` to a client comm and wait for the kernel's `comm_msg`
    /// answering it.
    pub async fn send_client_request(
        &self,
        comm_id: &str,
        data: Value,
        timeout: Duration,
    ) -> Result<Value, SessionError> {
        self.ensure_running()?;
        if !lock(&self.inner.comms).is_open(comm_id) {
            return Err(SessionError::UnknownClient(comm_id.to_string()));
        }
        let comm = CommMsg {
            comm_id: comm_id.to_string(),
            data,
        };
        let msg = WireMessage::request(&comm, &self.inner.client_session)?;
        let pending = self.inner.comm_replies.register(msg.msg_id())?;
        if let Err(e) = self.send(Channel::Shell, &msg) {
            self.inner.comm_replies.remove(msg.msg_id());
            return Err(e);
        }
        self.inner.comm_replies.wait(pending, timeout, "comm_msg").await
    }

    /// Call a method on the kernel's UI service over JSON-RPC.
    pub async fn call_method(&self, method: &str, params: Vec<Value>) -> Result<Value, SessionError> {
        self.ensure_running()?;
        let comm_id = self.ui_comm_id().ok_or_else(|| {
            SessionError::UnknownClient(self.inner.config.ui_comm_target.clone())
        })?;

        let id = Uuid::new_v4().to_string();
        let pending = self.inner.rpc.register(&id)?;
        let comm = CommMsg {
            comm_id,
            data: rpc::call_method_request(&id, method, params),
        };
        let msg = WireMessage::request(&comm, &self.inner.client_session)?;
        if let Err(e) = self.send(Channel::Shell, &msg) {
            self.inner.rpc.remove(&id);
            return Err(e);
        }

        self.inner
            .rpc
            .wait(pending, self.inner.config.rpc_timeout, method)
            .await
    }

    pub async fn set_working_directory(&self, directory: &str) -> Result<(), SessionError> {
        self.call_method(
            "set_working_directory",
            vec![Value::String(directory.to_string())],
        )
        .await
        .map(|_| ())
    }
}

impl Inner {
    /// Apply `next` if it is a legal transition, broadcasting it. The
    /// broadcast happens under the state lock so subscribers see
    /// transitions in the order they were applied.
    fn transition(&self, next: RuntimeState) -> bool {
        self.state.send_if_modified(|current| {
            if !current.can_transition_to(next) {
                return false;
            }
            debug!(
                "[session] {} {} -> {}",
                self.session_id, current, next
            );
            *current = next;
            let _ = self.events.send(SessionEvent::State(next));
            true
        })
    }

    fn current_state(&self) -> RuntimeState {
        *self.state.borrow()
    }

    fn close_writers(&self) {
        let shell = lock(&self.shell).take();
        let control = lock(&self.control).take();
        for writer in [shell, control].into_iter().flatten() {
            writer.close();
        }
    }

    /// Move to `Exited`, reject everything pending and notify subscribers.
    /// Only the first call has any effect.
    fn finish(&self, reason: SessionEndReason) {
        let disposing = self.disposing.load(Ordering::SeqCst);
        let reason = if disposing {
            SessionEndReason::Shutdown
        } else {
            reason
        };

        self.close_writers();
        if !self.transition(RuntimeState::Exited) {
            return;
        }

        let rejection = move || {
            if disposing {
                SessionError::Disposed
            } else {
                SessionError::ConnectionClosed
            }
        };
        self.replies.close(rejection);
        self.rpc.close(rejection);
        self.comm_replies.close(rejection);
        self.idle.close(rejection);
        lock(&self.comms).clear();
        lock(&self.input_requests).clear();
        *lock(&self.ui_comm) = None;
        lock(&self.dynamic).busy = false;

        info!("[session] Session {} ended ({:?})", self.session_id, reason);
        let _ = self.events.send(SessionEvent::Ended(reason));
    }

    fn apply_status(&self, state: ExecutionState) {
        let next = match state {
            ExecutionState::Busy => RuntimeState::Busy,
            ExecutionState::Idle => RuntimeState::Idle,
            other => {
                debug!("[session] Ignoring kernel status {:?}", other);
                return;
            }
        };
        lock(&self.dynamic).busy = next == RuntimeState::Busy;
        self.transition(next);
    }

    fn apply_ui_event(&self, event: &UiEvent) {
        let mut dynamic = lock(&self.dynamic);
        match event {
            UiEvent::WorkingDirectory { directory } => {
                dynamic.working_directory = Some(directory.clone());
            }
            UiEvent::PromptState {
                input_prompt,
                continuation_prompt,
            } => {
                if !input_prompt.is_empty() {
                    dynamic.input_prompt = input_prompt.clone();
                }
                if !continuation_prompt.is_empty() {
                    dynamic.continuation_prompt = continuation_prompt.clone();
                }
            }
            UiEvent::ClearConsole | UiEvent::Other { .. } => {}
        }
    }

    /// Resolve a pending client request whose msg_id is `msg`'s parent.
    fn resolve_comm_reply(&self, msg: &WireMessage, data: &Value) -> bool {
        match msg.parent_msg_id() {
            Some(parent) if self.comm_replies.contains(parent) => {
                self.comm_replies.resolve(parent, Ok(data.clone()))
            }
            _ => false,
        }
    }

    fn handle_message(
        &self,
        channel: Channel,
        msg: WireMessage,
        starting_status: &mut Option<ExecutionState>,
    ) {
        if self.current_state().is_exited() {
            debug!(
                "[session] Dropping {} for exited session {}",
                msg.msg_type(),
                self.session_id
            );
            return;
        }

        let content = match msg.decode() {
            Ok(content) => content,
            Err(e) => {
                warn!("[session] Undecodable {} on {}: {}", msg.msg_type(), channel, e);
                return;
            }
        };

        match &content {
            KernelContent::Status(status) => {
                if status.execution_state == ExecutionState::Idle {
                    if let Some(parent) = msg.parent_msg_id() {
                        if self.idle.contains(parent) {
                            self.idle.resolve(parent, Ok(()));
                        }
                    }
                }

                let state = self.current_state();
                if state == RuntimeState::Starting {
                    if matches!(
                        status.execution_state,
                        ExecutionState::Busy | ExecutionState::Idle
                    ) {
                        *starting_status = Some(status.execution_state);
                    }
                } else if state.is_running() {
                    self.apply_status(status.execution_state);
                }
            }
            KernelContent::Reply(reply) => {
                if let Some(parent) = msg.parent_msg_id() {
                    let outcome = match &reply.status {
                        ReplyStatus::Ok => Ok(reply.clone()),
                        ReplyStatus::Error { ename, evalue } => Err(SessionError::KernelReported {
                            ename: ename.clone(),
                            evalue: evalue.clone(),
                        }),
                        ReplyStatus::Aborted => Err(SessionError::KernelReported {
                            ename: "Aborted".to_string(),
                            evalue: format!("{} was aborted", reply.msg_type),
                        }),
                    };
                    self.replies.resolve(parent, outcome);
                }
                return;
            }
            // `finish` may run concurrently; it marks the session exited
            // before clearing these tables, so the check under the lock
            // keeps them empty afterwards.
            KernelContent::InputRequest(_) => {
                let mut requests = lock(&self.input_requests);
                if !self.current_state().is_exited() {
                    requests.insert(msg.msg_id().to_string(), msg.header.clone());
                }
            }
            KernelContent::CommOpen(open) => {
                let mut comms = lock(&self.comms);
                if !self.current_state().is_exited() {
                    comms.insert_open(&open.comm_id, &open.target_name);
                }
            }
            KernelContent::CommMsg(comm) => match rpc::classify(&comm.data) {
                CommPayload::Response { id, outcome } => {
                    if self.rpc.contains(&id) {
                        let outcome = outcome.map_err(|e| SessionError::Rpc {
                            code: e.code,
                            message: e.message,
                        });
                        self.rpc.resolve(&id, outcome);
                    } else if !self.resolve_comm_reply(&msg, &comm.data) {
                        debug!("[session] Dropping rpc answer for unknown id {}", id);
                    }
                    return;
                }
                CommPayload::Event(event) => {
                    if self.resolve_comm_reply(&msg, &comm.data) {
                        return;
                    }
                    let is_ui = lock(&self.ui_comm).as_deref() == Some(comm.comm_id.as_str());
                    if is_ui {
                        self.apply_ui_event(&event);
                    }
                }
                CommPayload::Other => {
                    if self.resolve_comm_reply(&msg, &comm.data) {
                        return;
                    }
                }
            },
            KernelContent::CommClose(close) => {
                let closed = lock(&self.comms).close(&close.comm_id);
                if let Some((channel, Some(open_msg_id))) = closed {
                    self.idle.resolve(
                        &open_msg_id,
                        Err(SessionError::Protocol(format!(
                            "kernel closed comm {} (target {}) while it was opening",
                            channel.comm_id, channel.target_name
                        ))),
                    );
                }
                let mut ui_comm = lock(&self.ui_comm);
                if ui_comm.as_deref() == Some(close.comm_id.as_str()) {
                    *ui_comm = None;
                }
            }
            KernelContent::Unknown { msg_type, .. } => {
                debug!("[session] Ignoring unknown message type {}", msg_type);
            }
            _ => {}
        }

        if let Some(message) = RuntimeMessage::from_content(&msg, &content) {
            let _ = self.events.send(SessionEvent::Message(message));
        }
    }
}

async fn process_exit(watch: &mut Option<watch::Receiver<Option<KernelExit>>>) -> KernelExit {
    if let Some(rx) = watch {
        if let Ok(exit) = rx.wait_for(Option::is_some).await {
            return (*exit).unwrap_or_default();
        }
    }
    std::future::pending().await
}

async fn dispatch(
    inner: Arc<Inner>,
    mut rx: mpsc::UnboundedReceiver<Inbound>,
    mut exit_watch: Option<watch::Receiver<Option<KernelExit>>>,
) {
    // Last busy/idle seen before the handshake completed
    let mut starting_status: Option<ExecutionState> = None;

    let reason = loop {
        tokio::select! {
            item = rx.recv() => match item {
                Some(Inbound::Message(channel, msg)) => {
                    inner.handle_message(channel, msg, &mut starting_status);
                }
                Some(Inbound::HandshakeComplete(ack)) => {
                    if inner.transition(RuntimeState::Ready) {
                        if let Some(state) = starting_status.take() {
                            inner.apply_status(state);
                        }
                    }
                    let _ = ack.send(());
                }
                Some(Inbound::Closed(Channel::Control)) => {
                    warn!(
                        "[session] Control channel for {} closed, interrupts use shell",
                        inner.session_id
                    );
                    *lock(&inner.control) = None;
                }
                Some(Inbound::Closed(Channel::Shell)) => break SessionEndReason::ConnectionClosed,
                Some(Inbound::Stop) | None => return,
            },
            exit = process_exit(&mut exit_watch) => {
                break SessionEndReason::ProcessExited { code: exit.code };
            }
        }
    };

    inner.finish(reason);
}
