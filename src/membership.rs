//! Membership delegate (spec §4.3): the seam between the substrate and the
//! rest of this crate. Holds the advertised metadata, the bounded inbound
//! message queue the dispatcher drains, the `name -> node` index, and the
//! two hook lists reacting to join/update/leave.

use crate::substrate::MemberInfo;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Depth of the inbound message queue (spec §4.3: "bounded depth 64").
pub const INBOUND_QUEUE_DEPTH: usize = 64;

/// Observer of join/update/leave events. Implementors only need synchronous
/// logic (e.g. a ring table mutation); [`MembershipDelegate`] decides whether
/// to run a given hook inline or fire-and-forget on a background task.
pub trait MembershipHook: Send + Sync {
    fn on_join(&self, node: &MemberInfo);
    fn on_update(&self, node: &MemberInfo);
    fn on_leave(&self, node: &MemberInfo);
}

pub struct MembershipDelegate {
    /// Bytes advertised through the substrate's `node_meta(limit)` callback.
    metadata: RwLock<Vec<u8>>,
    inbound_tx: mpsc::Sender<Bytes>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    nodes: RwLock<BTreeMap<String, MemberInfo>>,
    sync_hooks: RwLock<Vec<Arc<dyn MembershipHook>>>,
    async_hooks: RwLock<Vec<Arc<dyn MembershipHook>>>,
}

impl MembershipDelegate {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        Self {
            metadata: RwLock::new(Vec::new()),
            inbound_tx: tx,
            inbound_rx: tokio::sync::Mutex::new(rx),
            nodes: RwLock::new(BTreeMap::new()),
            sync_hooks: RwLock::new(Vec::new()),
            async_hooks: RwLock::new(Vec::new()),
        }
    }

    pub fn set_metadata(&self, bytes: Vec<u8>) {
        *self.metadata.write().unwrap() = bytes;
    }

    /// `node_meta(limit)` substrate callback.
    pub fn node_meta(&self, limit: usize) -> Vec<u8> {
        let metadata = self.metadata.read().unwrap();
        if metadata.len() > limit {
            Vec::new()
        } else {
            metadata.clone()
        }
    }

    pub fn add_sync_hook(&self, hook: Arc<dyn MembershipHook>) {
        self.sync_hooks.write().unwrap().push(hook);
    }

    pub fn add_async_hook(&self, hook: Arc<dyn MembershipHook>) {
        self.async_hooks.write().unwrap().push(hook);
    }

    /// `notify_msg(bytes)`: non-blocking enqueue, drop on a full queue.
    pub fn notify_msg(&self, bytes: Bytes) {
        if self.inbound_tx.try_send(bytes).is_err() {
            warn!("inbound queue full, dropping message");
        }
    }

    /// Blocking enqueue used for loopback sends (`SendSelf`, spec §4.6).
    /// Must never be called while holding the ring writer lock (spec §5).
    pub async fn send_self(&self, bytes: Bytes) {
        let _ = self.inbound_tx.send(bytes).await;
    }

    /// Receive the next queued message; used by the dispatcher consumer loop.
    pub async fn recv(&self) -> Option<Bytes> {
        self.inbound_rx.lock().await.recv().await
    }

    pub fn notify_join(&self, node: MemberInfo) {
        self.nodes.write().unwrap().insert(node.name.clone(), node.clone());
        debug!(node = %node.name, "membership join");
        self.dispatch(&node, MembershipHook::on_join);
    }

    pub fn notify_update(&self, node: MemberInfo) {
        debug!(node = %node.name, "membership update");
        self.dispatch(&node, MembershipHook::on_update);
    }

    pub fn notify_leave(&self, node: MemberInfo) {
        debug!(node = %node.name, "membership leave");
        self.dispatch(&node, MembershipHook::on_leave);
        self.nodes.write().unwrap().remove(&node.name);
    }

    fn dispatch(&self, node: &MemberInfo, f: fn(&dyn MembershipHook, &MemberInfo)) {
        for hook in self.async_hooks.read().unwrap().iter() {
            let hook = hook.clone();
            let node = node.clone();
            tokio::spawn(async move { f(&*hook, &node) });
        }
        for hook in self.sync_hooks.read().unwrap().iter() {
            f(&**hook, node);
        }
    }

    /// `get_broadcasts(overhead, limit)`: no transmit-limited queue is wired
    /// up in this core; always empty (spec §4.3).
    pub fn get_broadcasts(&self, _overhead: usize, _limit: usize) -> Vec<Vec<u8>> {
        Vec::new()
    }

    /// `local_state`/`merge_remote_state`: this system carries no push/pull
    /// anti-entropy state; state lives on disk, not in gossip (spec §4.3).
    pub fn local_state(&self, _join: bool) -> Vec<u8> {
        Vec::new()
    }

    pub fn merge_remote_state(&self, _buf: &[u8], _join: bool) {}

    /// Look up a node by name in the membership index (used by the
    /// dispatcher's `Lookup` and by the router's liveness checks).
    pub fn lookup(&self, name: &str) -> Option<MemberInfo> {
        self.nodes.read().unwrap().get(name).cloned()
    }

    pub fn is_alive(&self, name: &str) -> bool {
        self.nodes.read().unwrap().contains_key(name)
    }
}

impl Default for MembershipDelegate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn member(name: &str) -> MemberInfo {
        MemberInfo {
            name: name.to_string(),
            metadata: Vec::new(),
            address: "127.0.0.1:9000".parse::<SocketAddr>().unwrap(),
        }
    }

    struct CountingHook(Arc<AtomicUsize>);
    impl MembershipHook for CountingHook {
        fn on_join(&self, _node: &MemberInfo) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
        fn on_update(&self, _node: &MemberInfo) {}
        fn on_leave(&self, _node: &MemberInfo) {
            self.0.fetch_add(100, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        let deleg = MembershipDelegate::new();
        for i in 0..INBOUND_QUEUE_DEPTH {
            deleg.notify_msg(Bytes::from(vec![i as u8]));
        }
        // Queue is full now; this one must be dropped, not block.
        deleg.notify_msg(Bytes::from_static(b"overflow"));
        for _ in 0..INBOUND_QUEUE_DEPTH {
            assert!(deleg.recv().await.is_some());
        }
    }

    #[tokio::test]
    async fn leave_removes_from_index_after_hooks_run() {
        let deleg = MembershipDelegate::new();
        let counter = Arc::new(AtomicUsize::new(0));
        deleg.add_sync_hook(Arc::new(CountingHook(counter.clone())));
        deleg.notify_join(member("a"));
        assert!(deleg.is_alive("a"));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        deleg.notify_leave(member("a"));
        assert_eq!(counter.load(Ordering::SeqCst), 101);
        assert!(!deleg.is_alive("a"));
    }

    #[test]
    fn node_meta_respects_limit() {
        let deleg = MembershipDelegate::new();
        deleg.set_metadata(vec![1, 2, 3, 4]);
        assert_eq!(deleg.node_meta(10), vec![1, 2, 3, 4]);
        assert!(deleg.node_meta(2).is_empty());
    }
}
