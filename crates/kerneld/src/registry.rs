//! Sessions owned by one daemon, keyed by session id.

use std::collections::HashMap;
use std::sync::Arc;

use kernel_launch::{KernelLaunchSpec, KernelProcessManager};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::session::{KernelSession, ShutdownReason};
use crate::state::RuntimeState;

/// One row of [`SessionRegistry::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub language: String,
    pub display_name: String,
    pub state: RuntimeState,
    pub shell_port: Option<u16>,
    pub pid: Option<u32>,
}

pub struct SessionRegistry {
    manager: Arc<KernelProcessManager>,
    config: SessionConfig,
    sessions: Mutex<HashMap<String, KernelSession>>,
}

impl SessionRegistry {
    pub fn new(manager: Arc<KernelProcessManager>, config: SessionConfig) -> Self {
        Self {
            manager,
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn manager(&self) -> &Arc<KernelProcessManager> {
        &self.manager
    }

    /// Launch a kernel for `session_id` and wait until it is ready.
    ///
    /// A previous session under the same id is replaced only once it has
    /// exited.
    pub async fn start_session(
        &self,
        session_id: &str,
        spec: &KernelLaunchSpec,
    ) -> Result<KernelSession, SessionError> {
        let session = {
            let mut sessions = self.sessions.lock().await;
            if let Some(existing) = sessions.get(session_id) {
                if !existing.runtime_state().is_exited() {
                    return Err(SessionError::Launch(
                        kernel_launch::LaunchError::AlreadyRunning(session_id.to_string()),
                    ));
                }
            }
            let session = KernelSession::for_spec(session_id, spec, self.config.clone());
            sessions.insert(session_id.to_string(), session.clone());
            session
        };

        info!(
            "[registry] Starting session {} ({})",
            session_id, spec.display_name
        );
        session.start(&self.manager).await?;
        Ok(session)
    }

    pub async fn get(&self, session_id: &str) -> Option<KernelSession> {
        self.sessions.lock().await.get(session_id).cloned()
    }

    pub async fn list(&self) -> Vec<SessionSummary> {
        let sessions: Vec<KernelSession> = self.sessions.lock().await.values().cloned().collect();
        let mut summaries: Vec<SessionSummary> = sessions
            .iter()
            .map(|session| {
                let metadata = session.metadata();
                let process = session.process();
                SessionSummary {
                    session_id: metadata.session_id,
                    language: metadata.language,
                    display_name: metadata.display_name,
                    state: session.runtime_state(),
                    shell_port: process.as_ref().map(|p| p.shell_port()),
                    pid: process.as_ref().and_then(|p| p.pid()),
                }
            })
            .collect();
        summaries.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        summaries
    }

    /// Replace the session with a freshly started successor.
    ///
    /// The map stays locked until the successor is in place, so a
    /// concurrent `start_session` for the same id sees either the old
    /// session or the successor.
    pub async fn restart(&self, session_id: &str) -> Result<KernelSession, SessionError> {
        let successor = {
            let mut sessions = self.sessions.lock().await;
            let current = sessions
                .get(session_id)
                .cloned()
                .ok_or_else(|| SessionError::UnknownSession(session_id.to_string()))?;
            let successor = current.successor()?;
            current.shutdown(ShutdownReason::Restart).await?;
            sessions.insert(session_id.to_string(), successor.clone());
            successor
        };

        info!("[registry] Restarting session {}", session_id);
        successor.start(&self.manager).await?;
        Ok(successor)
    }

    /// Shut a session down and forget it.
    pub async fn shutdown(&self, session_id: &str) -> Result<(), SessionError> {
        let session = self
            .sessions
            .lock()
            .await
            .remove(session_id)
            .ok_or_else(|| SessionError::UnknownSession(session_id.to_string()))?;
        session.shutdown(ShutdownReason::Shutdown).await
    }

    pub async fn shutdown_all(&self) {
        let sessions: Vec<KernelSession> = self
            .sessions
            .lock()
            .await
            .drain()
            .map(|(_, session)| session)
            .collect();
        if !sessions.is_empty() {
            info!("[registry] Shutting down {} session(s)", sessions.len());
        }
        let results = futures::future::join_all(
            sessions
                .iter()
                .map(|session| session.shutdown(ShutdownReason::Shutdown)),
        )
        .await;
        for (session, result) in sessions.iter().zip(results) {
            if let Err(e) = result {
                warn!(
                    "[registry] Shutdown of {} failed: {}",
                    session.session_id(),
                    e
                );
            }
        }
        self.manager.shutdown_all().await;
    }
}
