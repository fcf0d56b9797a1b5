//! [`ChordNode`]: the node orchestrator that ties all components together.
//!
//! A `ChordNode` owns the routing table, the key directory and the
//! aggregation tree state, each behind its own lock, plus the transport it
//! reaches peers through. It exposes the client operations (`put`, `get`,
//! `lookup`), ring membership (`join`, `leave`) and the background tasks
//! that serve requests and run maintenance.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use chord_net::{TcpTransport, Transport};
use chord_ring::RingTable;
use chord_store::BlockDevice;
use chord_types::{AggregateStats, NodeId, NodeRef};
use tokio::net::TcpListener;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ChordNodeConfig;
use crate::directory::KeyDirectory;
use crate::error::ChordError;
use crate::router::Lookup;
use crate::tree::AggregationTree;

/// A node's answer to a status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStatus {
    /// The answering node.
    pub node: NodeRef,
    /// Its predecessor.
    pub predecessor: Option<NodeRef>,
    /// Its successor.
    pub successor: NodeRef,
    /// Aggregated stats of its tree subtree.
    pub stats: AggregateStats,
}

/// A member of a Chord ring.
pub struct ChordNode {
    local: NodeRef,
    config: ChordNodeConfig,
    transport: Arc<dyn Transport>,
    ring: RwLock<RingTable>,
    directory: RwLock<KeyDirectory>,
    tree: RwLock<AggregationTree>,
    /// Set while a replica sync round runs.
    sync_in_flight: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    /// Server and maintenance tasks, aborted on shutdown.
    tasks: Mutex<Vec<JoinHandle<()>>>,
    me: Weak<ChordNode>,
}

impl ChordNode {
    /// Create a node that is alone on its own ring.
    pub fn new(
        local: NodeRef,
        config: ChordNodeConfig,
        transport: Arc<dyn Transport>,
        device: Arc<dyn BlockDevice>,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        let child_timeout = config.child_timeout();
        Arc::new_cyclic(|me| Self {
            local,
            config,
            transport,
            ring: RwLock::new(RingTable::new(local)),
            directory: RwLock::new(KeyDirectory::new(device)),
            tree: RwLock::new(AggregationTree::new(child_timeout)),
            sync_in_flight: AtomicBool::new(false),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            me: me.clone(),
        })
    }

    /// Bind a TCP listener on `listen_addr` and start a networked node:
    /// its id is the hash of the bound address unless `id` overrides it.
    pub async fn bind(
        listen_addr: SocketAddr,
        id: Option<NodeId>,
        config: ChordNodeConfig,
        device: Arc<dyn BlockDevice>,
    ) -> Result<Arc<Self>, ChordError> {
        let listener = TcpListener::bind(listen_addr)
            .await
            .map_err(|e| ChordError::Net(e.into()))?;
        let addr = listener
            .local_addr()
            .map_err(|e| ChordError::Net(e.into()))?;
        let local = match id {
            Some(id) => NodeRef::new(id, addr),
            None => NodeRef::from_addr(addr),
        };
        let transport = Arc::new(TcpTransport::new(config.request_timeout));
        let node = Self::new(local, config, transport, device);
        node.serve(listener);
        Ok(node)
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// This node.
    pub fn local(&self) -> NodeRef {
        self.local
    }

    /// Engine configuration.
    pub fn config(&self) -> &ChordNodeConfig {
        &self.config
    }

    /// Routing table.
    pub fn ring(&self) -> &RwLock<RingTable> {
        &self.ring
    }

    /// Key directory.
    pub fn directory(&self) -> &RwLock<KeyDirectory> {
        &self.directory
    }

    /// Aggregation tree state.
    pub fn tree(&self) -> &RwLock<AggregationTree> {
        &self.tree
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub(crate) fn sync_in_flight(&self) -> &AtomicBool {
        &self.sync_in_flight
    }

    pub(crate) fn upgrade(&self) -> Option<Arc<ChordNode>> {
        self.me.upgrade()
    }

    /// Current successor.
    pub async fn successor(&self) -> NodeRef {
        self.ring.read().await.successor()
    }

    /// Current predecessor.
    pub async fn predecessor(&self) -> Option<NodeRef> {
        self.ring.read().await.predecessor()
    }

    /// Current successor list.
    pub async fn successor_list(&self) -> Vec<NodeRef> {
        self.ring.read().await.successor_list()
    }

    /// This node's own view, as returned to a status query.
    pub async fn status(&self) -> NodeStatus {
        let (predecessor, successor) = {
            let ring = self.ring.read().await;
            (ring.predecessor(), ring.successor())
        };
        NodeStatus {
            node: self.local,
            predecessor,
            successor,
            stats: self.stats().await,
        }
    }

    // ------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------

    /// Join the ring known to `bootstrap`, or start a fresh one.
    ///
    /// The successor is looked up through the contact, then notified so it
    /// can adopt this node as predecessor right away.
    pub async fn join(&self, bootstrap: Option<SocketAddr>) -> Result<(), ChordError> {
        let Some(contact) = bootstrap else {
            info!(local = %self.local, "created new ring");
            return Ok(());
        };

        let succ = self.find_successor(contact, self.local.id).await?;
        if succ.id == self.local.id && succ != self.local {
            return Err(ChordError::IdTaken {
                id: self.local.id,
                holder: succ.addr,
            });
        }

        self.ring.write().await.update_successor(succ);
        info!(local = %self.local, successor = %succ, %contact, "joined ring");

        if let Err(e) = self.notify(succ, self.local).await {
            warn!(successor = %succ, "initial notify failed: {e}");
        }
        self.refresh_successor_list().await;
        self.fix_all_fingers().await;
        Ok(())
    }

    /// Leave the ring gracefully.
    ///
    /// Owned keys are handed to the successor, then both neighbours are
    /// told to splice this node out. The node shuts down afterwards.
    pub async fn leave(&self) -> Result<(), ChordError> {
        let (pred, succ, successors) = {
            let ring = self.ring.read().await;
            (ring.predecessor(), ring.successor(), ring.successor_list())
        };

        if succ != self.local {
            let owned = self.directory.read().await.owned_keys(self.local.id);
            for key in owned {
                let value = self.directory.read().await.get(key.id).await?;
                if let Some(data) = value
                    && let Err(e) = self.push(succ, key.id, succ.id, &data).await
                {
                    warn!(key_id = %key.id, successor = %succ, "handing over key failed: {e}");
                }
            }

            let mut neighbours = vec![succ];
            if let Some(pred) = pred
                && pred != succ
                && pred != self.local
            {
                neighbours.push(pred);
            }
            for neighbour in neighbours {
                if let Err(e) = self.exit(neighbour, pred, successors.clone()).await {
                    warn!(%neighbour, "exit announcement failed: {e}");
                }
            }
        }

        info!(local = %self.local, "left ring");
        self.shutdown();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Client operations
    // ------------------------------------------------------------------

    /// Owner of `id`: finger lookup first, successor walk if that fails.
    pub async fn lookup(&self, id: NodeId) -> Result<NodeRef, ChordError> {
        match self.find_successor(self.local.addr, id).await {
            Ok(node) => Ok(node),
            Err(e @ ChordError::LookupExhausted { .. }) => {
                debug!(%id, "{e}, falling back to linear lookup");
                self.find_successor_linear(self.local.addr, id).await
            }
            Err(e) if e.is_unreachable() => {
                debug!(%id, "{e}, falling back to linear lookup");
                self.find_successor_linear(self.local.addr, id).await
            }
            Err(e) => Err(e),
        }
    }

    /// Store `data` under `key`. Returns the node that stored it.
    pub async fn put(&self, key: &[u8], data: &[u8]) -> Result<NodeRef, ChordError> {
        let id = NodeId::from_data(key);
        let (owner, ()) = self
            .follow_redirects(id, |node| self.put_at(node, id, data))
            .await?;
        debug!(%id, %owner, size = data.len(), "put");
        Ok(owner)
    }

    /// Read the value stored under `key`.
    pub async fn get(&self, key: &[u8]) -> Result<Bytes, ChordError> {
        let id = NodeId::from_data(key);
        let (_, value) = self
            .follow_redirects(id, |node| self.get_at(node, id))
            .await?;
        Ok(value)
    }

    /// The owner of `key` followed by the nodes replicating it.
    pub async fn replicas(&self, key: &[u8]) -> Result<Vec<NodeRef>, ChordError> {
        let id = NodeId::from_data(key);
        let owner = self.lookup(id).await?;
        self.get_successor_list_id(owner, id).await
    }

    /// Start at this node and follow storage redirects toward the owner of
    /// `id`. When the chain breaks or runs too long, resolve the owner with
    /// [`lookup`](Self::lookup) and ask it directly.
    async fn follow_redirects<T, F, Fut>(&self, id: NodeId, op: F) -> Result<(NodeRef, T), ChordError>
    where
        F: Fn(NodeRef) -> Fut,
        Fut: Future<Output = Result<Lookup<T>, ChordError>>,
    {
        let mut target = self.local;
        for _ in 0..self.config.max_lookup_hops {
            match op(target).await {
                Ok(Lookup::Found(value)) => return Ok((target, value)),
                Ok(Lookup::Redirect(next)) if next == target => break,
                Ok(Lookup::Redirect(next)) => {
                    debug!(%id, from = %target, to = %next, "redirected");
                    target = next;
                }
                Err(e) if e.is_unreachable() => {
                    debug!(%id, node = %target, "redirect chain broken: {e}");
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        let owner = self.lookup(id).await?;
        match op(owner).await? {
            Lookup::Found(value) => Ok((owner, value)),
            Lookup::Redirect(_) => Err(ChordError::LookupExhausted {
                id,
                hops: self.config.max_lookup_hops,
            }),
        }
    }

    // ------------------------------------------------------------------
    // Background tasks
    // ------------------------------------------------------------------

    /// Answer requests arriving on `listener` until shutdown.
    pub fn serve(self: &Arc<Self>, listener: TcpListener) {
        let node = Arc::downgrade(self);
        let handle = tokio::spawn(TcpTransport::serve(listener, move |msg| {
            let node = node.clone();
            async move {
                match node.upgrade() {
                    Some(node) => node.handle_message(msg).await,
                    None => None,
                }
            }
        }));
        self.track(handle);
    }

    /// Start the maintenance loop: stabilization, replica sync and tree
    /// refresh, each on its own interval.
    pub fn start(self: &Arc<Self>) {
        let node = self.clone();
        let handle = tokio::spawn(async move { node.run_maintenance().await });
        self.track(handle);
    }

    async fn run_maintenance(self: Arc<Self>) {
        info!(local = %self.local, "maintenance started");

        let mut stabilize = tokio::time::interval(self.config.stabilize_interval);
        let mut sync = tokio::time::interval(self.config.sync_interval);
        let mut tree = tokio::time::interval(self.config.tree_interval);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                _ = stabilize.tick() => {
                    self.stabilize().await;
                }
                _ = sync.tick() => {
                    // Detached so a slow round never delays stabilization.
                    let node = self.clone();
                    tokio::spawn(async move {
                        node.sync_tick().await;
                    });
                }
                _ = tree.tick() => {
                    self.tree_tick().await;
                }
                _ = shutdown_rx.changed() => {
                    info!(local = %self.local, "maintenance shutting down");
                    break;
                }
            }
        }
    }

    fn track(&self, handle: JoinHandle<()>) {
        match self.tasks.lock() {
            Ok(mut tasks) => tasks.push(handle),
            Err(poisoned) => poisoned.into_inner().push(handle),
        }
    }

    /// Stop serving and stop maintenance. The node answers nothing afterwards.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for task in tasks {
            task.abort();
        }
        debug!(local = %self.local, "node stopped");
    }
}
