//! Client for the daemon's control socket.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use kernel_launch::{KernelInfo, KernelLaunchSpec};
use log::info;
use tokio::net::TcpStream;

use crate::connection::{self, MAX_RESPONSE_FRAME_SIZE};
use crate::endpoint::read_daemon_info;
use crate::protocol::{Request, Response};
use crate::transport::KernelEndpoint;

/// Error type for client operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Failed to connect to daemon: {0}")]
    ConnectionFailed(#[from] std::io::Error),

    #[error("No daemon endpoint in {0}")]
    NotRunning(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Daemon returned error: {0}")]
    DaemonError(String),

    #[error("Connection timeout")]
    Timeout,
}

fn unexpected(response: Response) -> ClientError {
    match response {
        Response::Error { message } => ClientError::DaemonError(message),
        other => ClientError::ProtocolError(format!("Unexpected response: {:?}", other)),
    }
}

/// Client for a running `kerneld`.
#[derive(Debug, Clone)]
pub struct KernelClient {
    addr: SocketAddr,
    connect_timeout: Duration,
}

impl KernelClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_timeout: Duration::from_secs(2),
        }
    }

    /// Find the daemon through its endpoint file.
    pub fn from_endpoint_file(path: &Path) -> Result<Self, ClientError> {
        let info = read_daemon_info(path)
            .ok_or_else(|| ClientError::NotRunning(path.display().to_string()))?;
        let addr = info
            .endpoint
            .parse()
            .map_err(|e| ClientError::ProtocolError(format!("bad endpoint {}: {}", info.endpoint, e)))?;
        Ok(Self::new(addr))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn is_daemon_running(&self) -> bool {
        self.ping().await.is_ok()
    }

    pub async fn ping(&self) -> Result<(), ClientError> {
        match self.send_request(Request::Ping).await? {
            Response::Pong => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn start_kernel(
        &self,
        session_id: &str,
        spec: KernelLaunchSpec,
    ) -> Result<KernelInfo, ClientError> {
        let request = Request::StartKernel {
            session_id: session_id.to_string(),
            spec,
        };
        match self.send_request(request).await? {
            Response::KernelStarted { kernel } => {
                info!(
                    "[kerneld-client] Kernel {} started for {} on port {}",
                    kernel.kernel_id, session_id, kernel.shell_port
                );
                Ok(kernel)
            }
            other => Err(unexpected(other)),
        }
    }

    /// Returns whether a kernel was running for `session_id`.
    pub async fn stop_kernel(&self, session_id: &str) -> Result<bool, ClientError> {
        let request = Request::StopKernel {
            session_id: session_id.to_string(),
        };
        match self.send_request(request).await? {
            Response::KernelStopped { existed } => Ok(existed),
            other => Err(unexpected(other)),
        }
    }

    pub async fn list_kernels(&self) -> Result<Vec<KernelInfo>, ClientError> {
        match self.send_request(Request::ListKernels).await? {
            Response::Kernels { kernels } => Ok(kernels),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_endpoint(&self, session_id: &str) -> Result<KernelEndpoint, ClientError> {
        let request = Request::GetEndpoint {
            session_id: session_id.to_string(),
        };
        match self.send_request(request).await? {
            Response::Endpoint { endpoint } => Ok(endpoint),
            other => Err(unexpected(other)),
        }
    }

    pub async fn shutdown(&self) -> Result<(), ClientError> {
        match self.send_request(Request::Shutdown).await? {
            Response::ShuttingDown => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn send_request(&self, request: Request) -> Result<Response, ClientError> {
        let mut stream =
            match tokio::time::timeout(self.connect_timeout, TcpStream::connect(self.addr)).await {
                Ok(Ok(s)) => s,
                Ok(Err(e)) => return Err(ClientError::ConnectionFailed(e)),
                Err(_) => return Err(ClientError::Timeout),
            };

        connection::send_json_frame(&mut stream, &request)
            .await
            .map_err(|e| ClientError::ProtocolError(format!("send: {}", e)))?;

        connection::recv_json_frame::<_, Response>(&mut stream, MAX_RESPONSE_FRAME_SIZE)
            .await
            .map_err(|e| ClientError::ProtocolError(format!("recv: {}", e)))?
            .ok_or_else(|| ClientError::ProtocolError("connection closed".to_string()))
    }
}
