//! The kernel daemon: owns a process manager and serves its control socket.
//!
//! Clients connect over TCP on localhost and exchange framed JSON requests
//! (see `protocol.rs`). A connection may carry any number of requests; each
//! gets exactly one response.

use std::net::SocketAddr;
use std::sync::Arc;

use kernel_launch::{KernelProcessManager, PortAllocator};
use log::{error, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::Notify;

use crate::config::DaemonConfig;
use crate::connection;
use crate::endpoint::EndpointFile;
use crate::protocol::{Request, Response};
use crate::transport::KernelEndpoint;

pub struct Daemon {
    config: DaemonConfig,
    manager: Arc<KernelProcessManager>,
    /// Wakes the accept loop on shutdown.
    shutdown_notify: Arc<Notify>,
}

impl Daemon {
    pub fn new(config: DaemonConfig) -> Arc<Self> {
        let ports = Arc::new(PortAllocator::new(config.port_range()));
        let manager = Arc::new(KernelProcessManager::new(config.process_config(), ports));
        Arc::new(Self {
            config,
            manager,
            shutdown_notify: Arc::new(Notify::new()),
        })
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<KernelProcessManager> {
        &self.manager
    }

    /// Ask the accept loop to stop. Kernels are stopped once it has.
    pub fn shutdown(&self) {
        self.shutdown_notify.notify_one();
    }

    pub async fn bind(&self) -> anyhow::Result<TcpListener> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        info!("[kerneld] Listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Bind, advertise the endpoint, and serve until shut down.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let listener = self.bind().await?;
        let addr = listener.local_addr()?;

        // Removed again when this guard drops at the end of run()
        let _endpoint_file = match EndpointFile::write(&self.config.endpoint_file, &addr.to_string())
        {
            Ok(file) => Some(file),
            Err(e) => {
                error!("[kerneld] Failed to write endpoint file: {}", e);
                None
            }
        };

        self.serve(listener).await
    }

    /// Accept connections on `listener` until shut down, then stop every
    /// kernel.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => {
                            let daemon = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = daemon.handle_connection(stream, peer).await {
                                    warn!("[kerneld] Connection error from {}: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("[kerneld] Accept error: {}", e);
                        }
                    }
                }
                _ = self.shutdown_notify.notified() => {
                    info!("[kerneld] Shutting down");
                    break;
                }
            }
        }

        self.manager.shutdown_all().await;
        Ok(())
    }

    async fn handle_connection<S>(self: Arc<Self>, mut stream: S, peer: SocketAddr) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let frame = match connection::recv_control_frame(&mut stream).await? {
                Some(frame) => frame,
                None => break,
            };

            let response = match serde_json::from_slice::<Request>(&frame) {
                Ok(request) => self.clone().handle_request(request).await,
                Err(e) => {
                    warn!("[kerneld] Invalid request from {}: {}", peer, e);
                    Response::Error {
                        message: format!("Invalid request: {}", e),
                    }
                }
            };

            connection::send_json_frame(&mut stream, &response).await?;
        }
        Ok(())
    }

    async fn handle_request(self: Arc<Self>, request: Request) -> Response {
        match request {
            Request::StartKernel { session_id, spec } => {
                match self.manager.start_kernel(&session_id, &spec).await {
                    Ok(handle) => Response::KernelStarted {
                        kernel: handle.info(),
                    },
                    Err(e) => {
                        warn!("[kerneld] Failed to start kernel for {}: {}", session_id, e);
                        Response::Error {
                            message: e.to_string(),
                        }
                    }
                }
            }

            Request::StopKernel { session_id } => Response::KernelStopped {
                existed: self.manager.stop_kernel(&session_id).await,
            },

            Request::ListKernels => Response::Kernels {
                kernels: self.manager.list_kernels(),
            },

            Request::GetEndpoint { session_id } => match self.manager.get(&session_id) {
                Some(handle) if handle.is_alive() => Response::Endpoint {
                    endpoint: KernelEndpoint::localhost(handle.shell_port(), handle.control_port()),
                },
                _ => Response::Error {
                    message: format!("no running kernel for session {}", session_id),
                },
            },

            Request::Ping => Response::Pong,

            Request::Shutdown => {
                self.shutdown();
                Response::ShuttingDown
            }
        }
    }
}
