use crate::config::Config;
use crate::error::{ParavonError, Result};
use crate::peer::PeerRouter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use membership::{Membership, MembershipChannels, MembershipEvent};
use network::{GossipClient, PeerHandler, PeerServer, PeerTransport, TcpTransport};
use replication::{ClusterContext, Coordinator, Liveness};
use storage::StorageEngine;
use topology::{vnode_tokens, MembershipDelta, NodeEntry, RingView, Topology};

/// One Paravon node: the replication engine, membership, and the servers
/// exposing them.
pub struct Node {
    config: Config,
    ctx: Arc<ClusterContext>,
    coordinator: Coordinator,
    membership: Arc<Membership>,
    router: Arc<PeerRouter>,
    channels: Option<MembershipChannels>,
}

impl Node {
    /// Builds a node on file-backed storage and the TCP peer transport.
    pub async fn new(config: Config) -> Result<Self> {
        info!(node = %config.node_id, peer = %config.peer_addr(), "Initializing Paravon node");

        let storage = Arc::new(StorageEngine::open(&config.storage_path).await?);
        let transport = Arc::new(TcpTransport::new(config.clone().into()));
        Self::assemble(config, storage, transport).await
    }

    /// Wires the node's components over the given storage and transport.
    pub async fn assemble(
        config: Config,
        storage: Arc<StorageEngine>,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<Self> {
        config.validate()?;
        let node_id = config.node_id();
        storage.bind_identity(&node_id).await?;

        let mut local = NodeEntry::new(
            node_id.clone(),
            config.peer_addr(),
            config.api_addr(),
            vnode_tokens(&node_id, config.vnodes),
        )?;
        if let Some(cert) = &config.tls.certfile {
            local = local.with_tls_identity(cert.display().to_string());
        }

        let topology = Arc::new(Topology::new(RingView::from_members([local.clone()])));
        let gossip = Arc::new(GossipClient::new(transport.clone()));
        let (membership, channels) = Membership::new(config.clone().into(), local, gossip)?;

        let liveness: Arc<dyn Liveness> = membership.clone();
        let ctx = Arc::new(
            ClusterContext::new(
                node_id,
                storage,
                topology,
                transport,
                liveness,
                config.clone().into(),
            )
            .await?,
        );
        let router = Arc::new(PeerRouter::new(membership.clone(), ctx.replica().clone()));

        Ok(Self {
            config,
            coordinator: Coordinator::new(ctx.clone()),
            ctx,
            membership,
            router,
            channels: Some(channels),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn context(&self) -> &Arc<ClusterContext> {
        &self.ctx
    }

    pub fn membership(&self) -> &Arc<Membership> {
        &self.membership
    }

    /// Handler for inbound peer messages addressed to this node.
    pub fn peer_handler(&self) -> Arc<dyn PeerHandler> {
        self.router.clone()
    }

    /// Spawns gossip, ring rebuild, hint draining and tombstone
    /// reclamation. They stop when `shutdown` flips to true.
    pub fn spawn_background(&mut self, shutdown: watch::Receiver<bool>) -> Result<Vec<JoinHandle<Result<()>>>> {
        let channels = self
            .channels
            .take()
            .ok_or_else(|| ParavonError::Task("background tasks already started".to_string()))?;

        let gossip = {
            let membership = self.membership.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { Ok::<_, ParavonError>(membership.run(shutdown).await?) })
        };

        let rebuild = tokio::spawn(rebuild_ring(
            self.ctx.topology().clone(),
            channels.deltas,
            shutdown.clone(),
        ));

        let drain = tokio::spawn(drain_hints(
            self.ctx.clone(),
            channels.events,
            self.config.hint_sweep_interval(),
            shutdown.clone(),
        ));

        let reclaim = tokio::spawn(reclaim_tombstones(
            self.ctx.clone(),
            self.config.tombstone_interval(),
            shutdown,
        ));

        Ok(vec![gossip, rebuild, drain, reclaim])
    }

    pub async fn start(mut self) -> Result<()> {
        info!("Starting Paravon node services");
        let (shutdown_tx, shutdown) = watch::channel(false);

        let peer_server = PeerServer::bind(
            self.config.node_id(),
            &self.config.peer_addr(),
            self.peer_handler(),
            self.config.max_frame_size,
        )
        .await?;
        let peer_task = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { Ok::<_, ParavonError>(peer_server.run(shutdown).await?) })
        };

        let api_task = {
            let state = Arc::new(api::AppState {
                coordinator: self.coordinator.clone(),
                membership: self.membership.clone(),
                replication_factor: self.config.replication_factor,
            });
            let server = api::Server::new(self.config.clone().into(), state);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { Ok::<_, ParavonError>(server.start(shutdown).await?) })
        };

        let mut background = self.spawn_background(shutdown)?;
        let mut finished = None;
        let outcome = {
            let background_task = futures::future::select_all(background.iter_mut());
            tokio::select! {
                result = peer_task => task_ended("Peer server", result),
                result = api_task => task_ended("API server", result),
                (result, index, _) = background_task => {
                    finished = Some(index);
                    task_ended(BACKGROUND_TASKS[index], result)
                }
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => info!("Shutdown requested"),
                        Err(e) => warn!(error = %e, "Failed to listen for shutdown signal"),
                    }
                    Ok(())
                }
            }
        };
        if let Some(index) = finished {
            background.remove(index);
        }

        self.membership.leave().await;
        if shutdown_tx.send(true).is_err() {
            debug!("All tasks already stopped");
        }
        for task in background {
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                warn!("Background task did not stop in time");
            }
        }
        info!("Paravon node stopped");
        outcome
    }
}

const BACKGROUND_TASKS: [&str; 4] = ["Gossip", "Ring rebuild", "Hint drain", "Tombstone reclamation"];

fn task_ended(name: &str, result: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match result {
        Ok(Ok(())) => {
            warn!(task = name, "Task stopped");
            Err(ParavonError::Task(format!("{} stopped", name)))
        }
        Ok(Err(e)) => {
            error!(task = name, error = %e, "Task failed");
            Err(e)
        }
        Err(e) => {
            error!(task = name, error = %e, "Task panicked");
            Err(ParavonError::Task(format!("{} panicked: {}", name, e)))
        }
    }
}

/// Applies membership deltas to the ring, one rebuild per batch.
async fn rebuild_ring(
    topology: Arc<Topology>,
    mut deltas: mpsc::Receiver<Vec<MembershipDelta>>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        tokio::select! {
            batch = deltas.recv() => match batch {
                Some(batch) => {
                    topology.apply(batch);
                }
                None => break,
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    Ok(())
}

/// Drains a target's hints as soon as membership sees it come back, plus a
/// periodic sweep for targets whose recovery went unnoticed.
async fn drain_hints(
    ctx: Arc<ClusterContext>,
    mut events: mpsc::Receiver<MembershipEvent>,
    sweep_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut sweep = tokio::time::interval(sweep_interval);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut sweeping: Option<JoinHandle<()>> = None;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(MembershipEvent::Recovered(target)) | Some(MembershipEvent::Joined(target)) => {
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        ctx.drain_hints(&target).await;
                    });
                }
                Some(other) => debug!(event = ?other, "Membership event"),
                None => break,
            },
            _ = sweep.tick() => {
                // A sweep can wait on slow replicas for a full request
                // timeout each; events keep flowing meanwhile.
                if sweeping.as_ref().map_or(false, |task| !task.is_finished()) {
                    trace!("Previous hint sweep still running");
                } else {
                    let ctx = ctx.clone();
                    sweeping = Some(tokio::spawn(async move {
                        let replayed = ctx.drain_pending().await;
                        if replayed > 0 {
                            debug!(replayed, "Hint sweep finished");
                        }
                    }));
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    if let Some(task) = sweeping {
        task.abort();
    }
    Ok(())
}

async fn reclaim_tombstones(
    ctx: Arc<ClusterContext>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; nothing is old enough yet.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = ctx.reclaim_tombstones().await {
                    warn!(error = %e, "Tombstone reclamation failed");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    Ok(())
}
