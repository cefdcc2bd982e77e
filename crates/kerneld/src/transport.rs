//! WebSocket transport to a kernel.
//!
//! Each channel has one writer task owning the sink (fed through an mpsc
//! queue, so writes never interleave) and one reader task that decodes
//! frames and forwards them, in receipt order, to the session's dispatcher.
//! Content is normalized for the kernel family on the way out and on the
//! way in.

use futures::{SinkExt, StreamExt};
use kernel_wire::{normalize, Channel, Direction, KernelFamily, WireMessage};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::error::SessionError;

/// Where a kernel's sockets live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelEndpoint {
    pub host: String,
    pub shell_port: u16,
    pub control_port: Option<u16>,
}

impl KernelEndpoint {
    pub fn localhost(shell_port: u16, control_port: Option<u16>) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            shell_port,
            control_port,
        }
    }

    pub fn url(&self, channel: Channel) -> Option<String> {
        let port = match channel {
            Channel::Shell => Some(self.shell_port),
            Channel::Control => self.control_port,
        }?;
        Some(format!("ws://{}:{}", self.host, port))
    }
}

/// Items delivered to a session's dispatcher.
#[derive(Debug)]
pub enum Inbound {
    Message(Channel, WireMessage),
    Closed(Channel),
    /// Startup handshake finished; the dispatcher moves the session to
    /// `Ready` and acknowledges.
    HandshakeComplete(oneshot::Sender<()>),
    /// The session was torn down; the dispatcher exits without further work.
    Stop,
}

/// Sending half of one channel.
#[derive(Debug, Clone)]
pub struct ChannelWriter {
    channel: Channel,
    family: KernelFamily,
    tx: mpsc::UnboundedSender<WsMessage>,
}

impl ChannelWriter {
    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Queue `msg` for the writer task. Fails once the socket is gone.
    pub fn send(&self, msg: &WireMessage) -> Result<(), SessionError> {
        let mut outgoing = msg.clone();
        outgoing.content = normalize(self.family, Direction::Outgoing, &msg.content);
        let text = outgoing.to_text()?;
        debug!(
            "[session] -> {} {} ({})",
            self.channel,
            msg.msg_type(),
            msg.msg_id()
        );
        self.tx
            .send(WsMessage::Text(text))
            .map_err(|_| SessionError::ConnectionClosed)
    }

    /// Ask the writer task to send a close frame and stop.
    pub fn close(&self) {
        let _ = self.tx.send(WsMessage::Close(None));
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Connect one channel and spawn its reader and writer tasks.
pub async fn connect_channel(
    url: &str,
    channel: Channel,
    family: KernelFamily,
    inbound: mpsc::UnboundedSender<Inbound>,
) -> Result<ChannelWriter, SessionError> {
    let (stream, _) = connect_async(url)
        .await
        .map_err(|e| SessionError::Connect {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
    let (mut sink, mut stream) = stream.split();
    debug!("[session] Connected {} channel to {}", channel, url);

    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let closing = matches!(frame, WsMessage::Close(_));
            if let Err(e) = sink.send(frame).await {
                debug!("[session] {} writer stopped: {}", channel, e);
                break;
            }
            if closing {
                break;
            }
        }
    });

    tokio::spawn(async move {
        while let Some(next) = stream.next().await {
            let frame = match next {
                Ok(frame) => frame,
                Err(e) => {
                    debug!("[session] {} reader error: {}", channel, e);
                    break;
                }
            };
            let text = match frame {
                WsMessage::Text(text) => text,
                WsMessage::Binary(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(_) => {
                        warn!("[session] Dropping non-UTF-8 frame on {}", channel);
                        continue;
                    }
                },
                WsMessage::Close(_) => break,
                _ => continue,
            };

            let mut msg = match WireMessage::from_text(&text) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!("[session] Dropping malformed message on {}: {}", channel, e);
                    continue;
                }
            };
            msg.content = normalize(family, Direction::Incoming, &msg.content);

            if inbound.send(Inbound::Message(channel, msg)).is_err() {
                // Dispatcher is gone
                return;
            }
        }
        let _ = inbound.send(Inbound::Closed(channel));
    });

    Ok(ChannelWriter {
        channel,
        family,
        tx,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_urls() {
        let endpoint = KernelEndpoint::localhost(8100, Some(8101));
        assert_eq!(
            endpoint.url(Channel::Shell).as_deref(),
            Some("ws://127.0.0.1:8100")
        );
        assert_eq!(
            endpoint.url(Channel::Control).as_deref(),
            Some("ws://127.0.0.1:8101")
        );

        let shell_only = KernelEndpoint::localhost(8100, None);
        assert!(shell_only.url(Channel::Control).is_none());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nothing listens on
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = connect_channel(
            &format!("ws://127.0.0.1:{}", port),
            Channel::Shell,
            KernelFamily::Python,
            tx,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SessionError::Connect { .. }));
    }
}
