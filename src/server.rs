//! Node assembly and lifecycle

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bulk::BulkDelete;
use crate::cluster::{
    ClusterManager, ClusterStore, ConfigStore, LoadReporter, MemConfigStore, NodeId, Onboarding,
    SledConfigStore,
};
use crate::common::{NodeConfig, Result};
use crate::connection::{ConnectionRegistry, MessageHandler};
use crate::dispatch::Dispatcher;
use crate::protocol::Query;
use crate::storage::{DataManager, MemDataManager, MemSystemCatalog, SystemCatalog};
use crate::txn::{MasterStore, ProcessorStore, TransactionCoordinator};

/// External collaborators a node is built on.
pub struct Collaborators {
    pub data: Arc<dyn DataManager>,
    pub catalog: Arc<dyn SystemCatalog>,
    /// Overrides the store derived from `data_dir`.
    pub config_store: Option<Arc<dyn ConfigStore>>,
    pub load: Option<Arc<dyn LoadReporter>>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            data: Arc::new(MemDataManager::new()),
            catalog: Arc::new(MemSystemCatalog::new()),
            config_store: None,
            load: None,
        }
    }
}

/// A running node: listener, dispatcher and the services built on them.
pub struct ClusterNode {
    local_addr: SocketAddr,
    cluster: Arc<ClusterStore>,
    registry: Arc<ConnectionRegistry>,
    processors: Arc<ProcessorStore>,
    masters: Arc<MasterStore>,
    data: Arc<dyn DataManager>,
    manager: ClusterManager,
    transactions: TransactionCoordinator,
    bulk: BulkDelete,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ClusterNode {
    pub async fn start(config: NodeConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let Collaborators {
            data,
            catalog,
            config_store,
            load,
        } = collaborators;

        let config_store = config_store.unwrap_or_else(|| open_config_store(&config));
        let mut cluster = ClusterStore::open(config_store);
        if let Some(load) = load {
            cluster = cluster.with_load_reporter(load);
        }
        let cluster = Arc::new(cluster);

        let (registry, loopback_rx) =
            ConnectionRegistry::new(Arc::clone(&cluster), config.handshake_timeout());

        let listener = TcpListener::bind(config.cluster_addr).await?;
        let local_addr = listener.local_addr()?;
        let advertise = config
            .advertise_addr
            .clone()
            .unwrap_or_else(|| default_advertise(local_addr));
        registry.set_advertise_addr(advertise.clone());

        let onboarding = Arc::new(Onboarding::new(
            Arc::clone(&cluster),
            Arc::clone(&registry),
            Arc::clone(&data),
            catalog,
            config.phase_timeout(),
            config.sync_timeout(),
        ));
        let processors = Arc::new(ProcessorStore::new());
        let masters = Arc::new(MasterStore::new());
        let workers = config.workers();

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&cluster),
            Arc::clone(&registry),
            Arc::clone(&onboarding),
            Arc::clone(&processors),
            Arc::clone(&masters),
            Arc::clone(&data),
            workers,
        ));
        let handler: Arc<dyn MessageHandler> = dispatcher.clone();
        registry.bind_handler(Arc::downgrade(&handler));

        let (shutdown, shutdown_rx) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(accept_loop(
                listener,
                Arc::clone(&registry),
                shutdown_rx.clone(),
            )),
            tokio::spawn(loopback_loop(
                loopback_rx,
                dispatcher,
                cluster.self_id().clone(),
                shutdown_rx,
            )),
        ];

        info!("Node {} listening on {}", cluster.self_id(), local_addr);
        info!("  Advertised as: {}", advertise);
        info!("  Workers: {}", workers);

        Ok(Self {
            local_addr,
            manager: ClusterManager::new(
                Arc::clone(&cluster),
                Arc::clone(&registry),
                onboarding,
            ),
            transactions: TransactionCoordinator::new(
                Arc::clone(&cluster),
                Arc::clone(&registry),
                Arc::clone(&masters),
                config.commit_timeout(),
            ),
            bulk: BulkDelete::new(Arc::clone(&data), workers),
            cluster,
            registry,
            processors,
            masters,
            data,
            shutdown,
            tasks,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address peers dial to reach this node.
    pub fn advertised_addr(&self) -> String {
        self.registry
            .self_member()
            .address
            .unwrap_or_else(|| self.local_addr.to_string())
    }

    pub fn self_id(&self) -> &NodeId {
        self.cluster.self_id()
    }

    pub fn cluster(&self) -> &Arc<ClusterStore> {
        &self.cluster
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn manager(&self) -> &ClusterManager {
        &self.manager
    }

    pub fn transactions(&self) -> &TransactionCoordinator {
        &self.transactions
    }

    pub fn bulk(&self) -> &BulkDelete {
        &self.bulk
    }

    pub fn data(&self) -> &Arc<dyn DataManager> {
        &self.data
    }

    /// Soft-committed processors awaiting COMMIT or ROLLBACK.
    pub fn pending_processors(&self) -> usize {
        self.processors.len()
    }

    /// Requests this node is coordinating.
    pub fn pending_masters(&self) -> usize {
        self.masters.len()
    }

    /// Stop accepting, close every connection and wait for background tasks.
    pub async fn shutdown(self) {
        info!("Shutting down node {}", self.cluster.self_id());
        let _ = self.shutdown.send(true);
        self.registry.disconnect_all().await;
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
    }
}

fn open_config_store(config: &NodeConfig) -> Arc<dyn ConfigStore> {
    let Some(dir) = &config.data_dir else {
        return Arc::new(MemConfigStore::new());
    };
    match SledConfigStore::open(dir.join("node-config")) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            warn!(
                "Cannot open node config under {}, node state will not persist: {}",
                dir.display(),
                e
            );
            Arc::new(MemConfigStore::new())
        }
    }
}

fn default_advertise(local: SocketAddr) -> String {
    if local.ip().is_unspecified() {
        SocketAddr::from(([127, 0, 0, 1], local.port())).to_string()
    } else {
        local.to_string()
    }
}

async fn accept_loop(
    listener: TcpListener,
    registry: Arc<ConnectionRegistry>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("set_nodelay on {} failed: {}", peer, e);
                    }
                    let registry = Arc::clone(&registry);
                    tokio::spawn(async move {
                        if let Err(e) = registry.accept_inbound(stream).await {
                            debug!("Inbound connection from {} rejected: {}", peer, e);
                        }
                    });
                }
                Err(e) => warn!("Accept failed: {}", e),
            },
        }
    }
    debug!("Accept loop stopped");
}

async fn loopback_loop(
    mut rx: mpsc::UnboundedReceiver<Query>,
    dispatcher: Arc<Dispatcher>,
    self_id: NodeId,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            next = rx.recv() => match next {
                Some(query) => dispatcher.dispatch(self_id.clone(), query).await,
                None => break,
            },
        }
    }
    debug!("Loopback loop stopped");
}
