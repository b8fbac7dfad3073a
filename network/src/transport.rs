use async_trait::async_trait;
use std::collections::HashMap;
use std::io::ErrorKind;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};
use tracing::{debug, trace};

use crate::backoff::ExponentialBackoff;
use crate::codec::{read_frame, write_frame};
use crate::{Config, Envelope, NetworkError, PeerMessage, PeerReply, Result};

/// Sends one request to a peer and waits for its reply.
///
/// Implementations bound every call by their own deadline and report an
/// exceeded deadline as [`NetworkError::Timeout`].
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn call(&self, addr: &str, message: PeerMessage) -> Result<PeerReply>;
}

struct PeerBackoff {
    backoff: ExponentialBackoff,
    retry_at: Instant,
}

/// How far an exchange got before it failed.
enum Failure {
    /// Nothing of the reply arrived; the connection was already dead.
    BeforeReply(NetworkError),
    Other(NetworkError),
}

impl Failure {
    fn into_error(self) -> NetworkError {
        match self {
            Failure::BeforeReply(e) | Failure::Other(e) => e,
        }
    }
}

/// TCP transport keeping a small pool of idle connections per peer.
///
/// A connection goes back into the pool only after a complete
/// request/reply exchange; a call that fails or is cancelled drops its
/// connection so a half-read reply can never be mistaken for the next one.
/// A pooled connection the peer closed in the meantime (a restart, an idle
/// timeout) is retried once on a fresh connection. Failed connects put the
/// peer in exponential backoff, during which new connects fail fast.
pub struct TcpTransport {
    config: Config,
    idle: Mutex<HashMap<String, Vec<TcpStream>>>,
    backoff: Mutex<HashMap<String, PeerBackoff>>,
}

impl TcpTransport {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            idle: Mutex::new(HashMap::new()),
            backoff: Mutex::new(HashMap::new()),
        }
    }

    /// Returns a connection and whether it came from the pool.
    async fn checkout(&self, addr: &str) -> Result<(TcpStream, bool)> {
        if let Some(stream) = self.idle.lock().await.get_mut(addr).and_then(Vec::pop) {
            trace!(peer = %addr, "Reusing pooled connection");
            return Ok((stream, true));
        }
        Ok((self.connect(addr).await?, false))
    }

    async fn connect(&self, addr: &str) -> Result<TcpStream> {
        if let Some(peer) = self.backoff.lock().await.get(addr) {
            let now = Instant::now();
            if peer.retry_at > now {
                return Err(NetworkError::ConnectionFailed(format!(
                    "{}: backing off for {:?}",
                    addr,
                    peer.retry_at - now
                )));
            }
        }

        let connected = match timeout(self.config.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(NetworkError::ConnectionFailed(format!("{}: {}", addr, e))),
            Err(_) => Err(NetworkError::Timeout(format!("connect to {}", addr))),
        };

        match connected {
            Ok(stream) => {
                self.backoff.lock().await.remove(addr);
                stream.set_nodelay(true)?;
                debug!(peer = %addr, "Opened peer connection");
                Ok(stream)
            }
            Err(e) => {
                self.back_off(addr).await;
                Err(e)
            }
        }
    }

    async fn back_off(&self, addr: &str) {
        let mut peers = self.backoff.lock().await;
        let peer = peers.entry(addr.to_string()).or_insert_with(|| PeerBackoff {
            backoff: self.config.reconnect_backoff.clone(),
            retry_at: Instant::now(),
        });
        let delay = peer.backoff.next_delay(&mut rand::thread_rng());
        peer.retry_at = Instant::now() + delay;
        debug!(peer = %addr, ?delay, "Backing off reconnects");
    }

    async fn checkin(&self, addr: &str, stream: TcpStream) {
        let mut idle = self.idle.lock().await;
        let pooled = idle.entry(addr.to_string()).or_default();
        if pooled.len() < self.config.max_idle_per_peer {
            pooled.push(stream);
        }
    }

    async fn exchange(&self, addr: &str, message: PeerMessage) -> Result<PeerReply> {
        let (stream, pooled) = self.checkout(addr).await?;
        match self.round_trip(addr, stream, message.clone()).await {
            Ok(reply) => Ok(reply),
            Err(Failure::BeforeReply(e)) if pooled => {
                debug!(peer = %addr, error = %e, "Pooled connection is stale, retrying on a fresh one");
                self.forget(addr).await;
                let stream = self.connect(addr).await?;
                self.round_trip(addr, stream, message).await.map_err(Failure::into_error)
            }
            Err(failure) => Err(failure.into_error()),
        }
    }

    async fn round_trip(
        &self,
        addr: &str,
        mut stream: TcpStream,
        message: PeerMessage,
    ) -> std::result::Result<PeerReply, Failure> {
        let request = Envelope::new(self.config.node_id.clone(), message);
        let max = self.config.max_frame_size;

        write_frame(&mut stream, &request, max).await.map_err(|e| match e {
            NetworkError::Io(_) => Failure::BeforeReply(e),
            e => Failure::Other(e),
        })?;

        let reply: Envelope<PeerReply> = match read_frame(&mut stream, max).await {
            Ok(Some(reply)) => reply,
            Ok(None) => {
                return Err(Failure::BeforeReply(NetworkError::ConnectionFailed(format!(
                    "{} closed the connection",
                    addr
                ))))
            }
            Err(NetworkError::Io(e))
                if matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe
                ) =>
            {
                return Err(Failure::BeforeReply(NetworkError::Io(e)))
            }
            Err(e) => return Err(Failure::Other(e)),
        };

        if reply.request_id != request.request_id {
            return Err(Failure::Other(NetworkError::Protocol(format!(
                "reply {} does not match request {}",
                reply.request_id, request.request_id
            ))));
        }

        self.checkin(addr, stream).await;
        Ok(reply.body)
    }

    /// Drops every pooled connection to `addr`.
    pub async fn forget(&self, addr: &str) {
        self.idle.lock().await.remove(addr);
    }
}

#[async_trait]
impl PeerTransport for TcpTransport {
    async fn call(&self, addr: &str, message: PeerMessage) -> Result<PeerReply> {
        let kind = message.kind();
        match timeout(self.config.call_timeout, self.exchange(addr, message)).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => {
                debug!(peer = %addr, kind, error = %e, "Peer call failed");
                self.forget(addr).await;
                Err(e)
            }
            Err(_) => Err(NetworkError::Timeout(format!("{} to {}", kind, addr))),
        }
    }
}
