use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::codec::{read_frame, write_frame};
use crate::{Envelope, NetworkError, PeerMessage, PeerReply, Result};
use storage::NodeId;

/// Answers inbound peer requests. Failures are reported in-band as
/// [`PeerReply::Error`] so the connection stays usable.
#[async_trait]
pub trait PeerHandler: Send + Sync {
    async fn handle(&self, from: NodeId, message: PeerMessage) -> PeerReply;
}

pub struct PeerServer {
    node_id: NodeId,
    listener: TcpListener,
    handler: Arc<dyn PeerHandler>,
    max_frame_size: usize,
}

impl PeerServer {
    pub async fn bind(
        node_id: NodeId,
        addr: &str,
        handler: Arc<dyn PeerHandler>,
        max_frame_size: usize,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "Peer server listening");
        Ok(Self {
            node_id,
            listener,
            handler,
            max_frame_size,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "Failed to accept peer connection");
                            continue;
                        }
                    };
                    let handler = self.handler.clone();
                    let node_id = self.node_id.clone();
                    let max = self.max_frame_size;
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(stream, node_id, handler, max).await {
                            debug!(peer = %peer, error = %e, "Peer connection closed with error");
                        }
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Peer server stopping");
                        return Ok(());
                    }
                }
            }
        }
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    node_id: NodeId,
    handler: Arc<dyn PeerHandler>,
    max_frame_size: usize,
) -> Result<()> {
    stream.set_nodelay(true)?;
    loop {
        let request: Envelope<PeerMessage> = match read_frame(&mut stream, max_frame_size).await {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(()),
            Err(e @ NetworkError::FrameTooLarge { .. }) => {
                error!(error = %e, "Rejecting oversized peer frame");
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let Envelope {
            request_id,
            from,
            body,
        } = request;
        let reply = Envelope {
            request_id,
            from: node_id.clone(),
            body: handler.handle(from, body).await,
        };
        write_frame(&mut stream, &reply, max_frame_size).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Config, PeerTransport, TcpTransport};
    use bytes::Bytes;
    use std::time::Duration;
    use storage::{UpdateStamp, VersionedValue};

    struct Echo;

    #[async_trait]
    impl PeerHandler for Echo {
        async fn handle(&self, from: NodeId, message: PeerMessage) -> PeerReply {
            match message {
                PeerMessage::Ping => PeerReply::Pong { node: from },
                PeerMessage::WriteReplicate { value, .. } => PeerReply::Value(Some(value)),
                PeerMessage::ReadFetch { .. } => {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    PeerReply::Value(None)
                }
                _ => PeerReply::Ack { applied: false },
            }
        }
    }

    async fn start() -> (String, watch::Sender<bool>) {
        let server = PeerServer::bind(NodeId::from("srv"), "127.0.0.1:0", Arc::new(Echo), 1 << 20)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap().to_string();
        let (tx, rx) = watch::channel(false);
        tokio::spawn(server.run(rx));
        (addr, tx)
    }

    fn client(call_timeout: Duration) -> TcpTransport {
        let mut config = Config::new(NodeId::from("cli"), "127.0.0.1:0");
        config.call_timeout = call_timeout;
        TcpTransport::new(config)
    }

    #[tokio::test]
    async fn request_reply_over_tcp() {
        let (addr, _shutdown) = start().await;
        let transport = client(Duration::from_secs(2));

        let reply = transport.call(&addr, PeerMessage::Ping).await.unwrap();
        assert_eq!(reply, PeerReply::Pong { node: NodeId::from("cli") });

        // Second call reuses the pooled connection.
        let value = VersionedValue::data("v", UpdateStamp::new(1, NodeId::from("cli")));
        let reply = transport
            .call(
                &addr,
                PeerMessage::WriteReplicate {
                    key: Bytes::from_static(b"k"),
                    value: value.clone(),
                },
            )
            .await
            .unwrap();
        assert_eq!(reply, PeerReply::Value(Some(value)));
    }

    #[tokio::test]
    async fn slow_peer_times_out() {
        let (addr, _shutdown) = start().await;
        let transport = client(Duration::from_millis(50));
        let err = transport
            .call(&addr, PeerMessage::ReadFetch { key: Bytes::from_static(b"k") })
            .await
            .unwrap_err();
        assert!(err.is_timeout());

        // A fresh connection is used afterwards.
        assert!(transport.call(&addr, PeerMessage::Ping).await.is_ok());
    }

    #[tokio::test]
    async fn closed_port_fails_fast() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let transport = client(Duration::from_secs(1));
        assert!(transport.call(&addr, PeerMessage::Ping).await.is_err());
    }
}
