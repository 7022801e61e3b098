//! The gossip/membership substrate contract (spec §1, §6).
//!
//! This crate never implements a production gossip engine — join/leave
//! detection, anti-entropy and failure suspicion live entirely outside it.
//! What lives here is the narrow contract this crate needs: a way to send
//! bytes to a named node, and a feed of membership events. [`LoopbackSubstrate`]
//! is an in-process double used by the test suite and by the demo binary; a
//! real deployment wires [`Substrate`] to an actual gossip library instead.

use crate::error::MeshError;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Primitives the core calls on the substrate (spec §6).
pub trait Substrate: Send + Sync {
    /// Best-effort, likely-unreliable delivery (datagram).
    fn send_best_effort(&self, node: &str, bytes: Bytes) -> Result<(), MeshError>;
    /// Reliable, ordered delivery (stream).
    fn send_reliable(&self, node: &str, bytes: Bytes) -> Result<(), MeshError>;
}

/// A membership event the substrate delivers to [`crate::membership::MembershipDelegate`].
#[derive(Debug, Clone)]
pub enum MembershipEvent {
    Join(MemberInfo),
    Update(MemberInfo),
    Leave(MemberInfo),
}

#[derive(Debug, Clone)]
pub struct MemberInfo {
    pub name: String,
    pub metadata: Vec<u8>,
    pub address: std::net::SocketAddr,
}

/// In-process substrate double: every registered node has an inbound mpsc
/// channel; sends look the target up in a shared table and push onto its
/// channel. No actual network I/O, no reliability distinction — good enough
/// to drive multi-node integration tests without sockets.
#[derive(Default)]
pub struct LoopbackSubstrate {
    inboxes: Mutex<HashMap<String, mpsc::Sender<Bytes>>>,
}

impl LoopbackSubstrate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node's inbound channel so other nodes can reach it.
    pub fn register(&self, name: impl Into<String>, sender: mpsc::Sender<Bytes>) {
        self.inboxes.lock().unwrap().insert(name.into(), sender);
    }

    pub fn unregister(&self, name: &str) {
        self.inboxes.lock().unwrap().remove(name);
    }

    fn deliver(&self, node: &str, bytes: Bytes) -> Result<(), MeshError> {
        let inboxes = self.inboxes.lock().unwrap();
        match inboxes.get(node) {
            Some(tx) => {
                // Non-blocking: a full peer inbox drops the datagram, same
                // policy as the real substrate's best-effort send.
                let _ = tx.try_send(bytes);
                Ok(())
            }
            None => Err(MeshError::DeadTargetNode),
        }
    }
}

impl Substrate for LoopbackSubstrate {
    fn send_best_effort(&self, node: &str, bytes: Bytes) -> Result<(), MeshError> {
        self.deliver(node, bytes)
    }

    fn send_reliable(&self, node: &str, bytes: Bytes) -> Result<(), MeshError> {
        self.deliver(node, bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_to_registered_node() {
        let sub = LoopbackSubstrate::new();
        let (tx, mut rx) = mpsc::channel(8);
        sub.register("b", tx);
        sub.send_best_effort("b", Bytes::from_static(b"hi")).unwrap();
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"hi"));
    }

    #[test]
    fn unknown_node_is_dead_target() {
        let sub = LoopbackSubstrate::new();
        let err = sub.send_best_effort("ghost", Bytes::new()).unwrap_err();
        assert!(matches!(err, MeshError::DeadTargetNode));
    }
}
