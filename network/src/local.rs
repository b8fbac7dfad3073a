use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::trace;

use crate::{NetworkError, PeerHandler, PeerMessage, PeerReply, PeerTransport, Result};
use storage::NodeId;

#[derive(Default)]
struct Fabric {
    handlers: HashMap<String, Arc<dyn PeerHandler>>,
    isolated: HashSet<String>,
    /// Unordered pairs of addresses that cannot reach each other.
    cut: HashSet<(String, String)>,
    latency: HashMap<String, Duration>,
}

impl Fabric {
    fn reachable(&self, from: &str, to: &str) -> bool {
        !self.isolated.contains(from) && !self.isolated.contains(to) && !self.cut.contains(&pair(from, to))
    }
}

fn pair(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

/// In-process network of peer handlers addressed by string.
///
/// Nodes can be isolated, pairs of nodes cut apart, and individual nodes
/// slowed down, which makes partial failure reproducible in tests.
#[derive(Default)]
pub struct LocalNetwork {
    fabric: RwLock<Fabric>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn read(&self) -> RwLockReadGuard<'_, Fabric> {
        self.fabric.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Fabric> {
        self.fabric.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, addr: impl Into<String>, handler: Arc<dyn PeerHandler>) {
        self.write().handlers.insert(addr.into(), handler);
    }

    pub fn unregister(&self, addr: &str) {
        self.write().handlers.remove(addr);
    }

    /// Transport that sends as `node_id` from `addr`.
    pub fn transport(
        self: &Arc<Self>,
        node_id: NodeId,
        addr: impl Into<String>,
        call_timeout: Duration,
    ) -> LocalTransport {
        LocalTransport {
            network: self.clone(),
            node_id,
            addr: addr.into(),
            call_timeout,
        }
    }

    /// Cuts `addr` off from every other node.
    pub fn isolate(&self, addr: &str) {
        self.write().isolated.insert(addr.to_string());
    }

    pub fn reconnect(&self, addr: &str) {
        self.write().isolated.remove(addr);
    }

    pub fn partition(&self, a: &str, b: &str) {
        self.write().cut.insert(pair(a, b));
    }

    pub fn heal(&self) {
        let mut fabric = self.write();
        fabric.isolated.clear();
        fabric.cut.clear();
        fabric.latency.clear();
    }

    /// Delays every call delivered to `addr`.
    pub fn slow_down(&self, addr: &str, delay: Duration) {
        self.write().latency.insert(addr.to_string(), delay);
    }

    fn route(&self, from: &str, to: &str) -> Result<(Arc<dyn PeerHandler>, Option<Duration>)> {
        let fabric = self.read();
        if !fabric.reachable(from, to) {
            return Err(NetworkError::Unreachable(to.to_string()));
        }
        let handler = fabric
            .handlers
            .get(to)
            .cloned()
            .ok_or_else(|| NetworkError::ConnectionFailed(format!("no node listening on {}", to)))?;
        Ok((handler, fabric.latency.get(to).copied()))
    }
}

pub struct LocalTransport {
    network: Arc<LocalNetwork>,
    node_id: NodeId,
    addr: String,
    call_timeout: Duration,
}

#[async_trait]
impl PeerTransport for LocalTransport {
    async fn call(&self, addr: &str, message: PeerMessage) -> Result<PeerReply> {
        let (handler, delay) = self.network.route(&self.addr, addr)?;
        trace!(from = %self.addr, to = %addr, kind = message.kind(), "Local peer call");

        let from = self.node_id.clone();
        let delivery = async move {
            if let Some(delay) = delay {
                sleep(delay).await;
            }
            handler.handle(from, message).await
        };
        timeout(self.call_timeout, delivery)
            .await
            .map_err(|_| NetworkError::Timeout(format!("call to {}", addr)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    #[async_trait]
    impl PeerHandler for Named {
        async fn handle(&self, _from: NodeId, _message: PeerMessage) -> PeerReply {
            PeerReply::Pong {
                node: NodeId::from(self.0),
            }
        }
    }

    fn network() -> Arc<LocalNetwork> {
        let net = LocalNetwork::new();
        net.register("a", Arc::new(Named("a")));
        net.register("b", Arc::new(Named("b")));
        net.register("c", Arc::new(Named("c")));
        net
    }

    #[tokio::test]
    async fn delivers_to_registered_handler() {
        let net = network();
        let t = net.transport(NodeId::from("a"), "a", Duration::from_secs(1));
        let reply = t.call("b", PeerMessage::Ping).await.unwrap();
        assert_eq!(reply, PeerReply::Pong { node: NodeId::from("b") });
        assert!(t.call("zz", PeerMessage::Ping).await.is_err());
    }

    #[tokio::test]
    async fn isolation_and_partitions_block_calls() {
        let net = network();
        let from_a = net.transport(NodeId::from("a"), "a", Duration::from_secs(1));
        let from_c = net.transport(NodeId::from("c"), "c", Duration::from_secs(1));

        net.isolate("b");
        assert!(matches!(
            from_a.call("b", PeerMessage::Ping).await,
            Err(NetworkError::Unreachable(_))
        ));
        net.reconnect("b");
        assert!(from_a.call("b", PeerMessage::Ping).await.is_ok());

        net.partition("a", "c");
        assert!(from_a.call("c", PeerMessage::Ping).await.is_err());
        assert!(from_c.call("a", PeerMessage::Ping).await.is_err());
        assert!(from_c.call("b", PeerMessage::Ping).await.is_ok());

        net.heal();
        assert!(from_a.call("c", PeerMessage::Ping).await.is_ok());
    }

    #[tokio::test]
    async fn slow_node_times_out() {
        let net = network();
        net.slow_down("b", Duration::from_millis(200));
        let t = net.transport(NodeId::from("a"), "a", Duration::from_millis(20));
        let err = t.call("b", PeerMessage::Ping).await.unwrap_err();
        assert!(err.is_timeout());
    }
}
