//! Hash ring subscriber and router (spec §4.5), grounded on
//! `xhashring.Subscriber` plus the original's `mlst2.go` forward-handler
//! pattern (`forwardFinger`/`forwardPrecise`: decode an id, look it up,
//! continue on self or forward otherwise, return whether to continue).
//!
//! The subscriber depends on a small `RouterHost` trait rather than holding
//! a literal back-reference to the dispatcher, so there is no reference
//! cycle between the two (design note §9, "cyclic hook registration").

use crate::hash::RingHash;
use crate::membership::MembershipHook;
use crate::meta::{NodeMeta, HRF_MEMBER, MT_HASH_RING_FLAGS};
use crate::ring::table::{Entry, Table};
use crate::substrate::MemberInfo;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, warn};

/// Header for the hash-ring forwarding packet (spec §6).
pub const MH_HR_ROUTE: u64 = 0x20000;

/// Bit in `HrRoute`'s `flags` field selecting the last live replica instead
/// of the first (spec §4.5).
pub const RTF_LAST: i64 = 1;

#[derive(Debug, Clone, Copy)]
pub struct RouteFlags(pub i64);

impl RouteFlags {
    pub fn wants_last(self) -> bool {
        self.0 & RTF_LAST != 0
    }
}

/// Transport-selection strategy a send goes through (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStrategy {
    BestFit,
    Fast,
    Datagram,
    Reliable,
    Stable,
    NoDatagram,
}

/// What the subscriber/router needs from the dispatcher: sending a packet
/// and looking a node up in the membership index. Implemented by
/// [`crate::dispatch::Dispatcher`].
pub trait RouterHost: Send + Sync {
    fn local_name(&self) -> &str;
    fn is_alive(&self, name: &str) -> bool;
    fn send_to(&self, strategy: SendStrategy, node: &str, bytes: Bytes);
}

/// Subscribes to membership events and maintains the ring table; also
/// implements the `HrRoute` forwarding handler.
pub struct Subscriber {
    pub table: Arc<Table>,
    /// Replication factor. The replica window for an id is the `num`
    /// consecutive ring entries starting at `Next(id)`.
    pub num: usize,
}

impl Subscriber {
    pub fn new(table: Arc<Table>, num: usize) -> Self {
        assert!(num >= 1, "replication factor must be >= 1");
        Self { table, num }
    }

    /// The replica window starting at `head`: `head`, `Step(head)`, ... of
    /// size `num`. Bounded to `num` steps without checking for wraparound
    /// back to `head` (design note §9's second open question: "implementations
    /// should document and preserve this bounded-walk behavior" — on rings
    /// smaller than `num` this harmlessly revisits entries).
    fn replica_window(&self, head: &Arc<Entry>) -> Vec<Arc<Entry>> {
        let mut window = Vec::with_capacity(self.num);
        let mut cur = head.clone();
        window.push(cur.clone());
        for _ in 1..self.num {
            match self.table.step(&cur) {
                Some(next) => {
                    window.push(next.clone());
                    cur = next;
                }
                None => break,
            }
        }
        window
    }

    fn check_self(&self, window: &[Arc<Entry>], local_name: &str) -> bool {
        window.iter().any(|e| e.name == local_name)
    }

    fn find_first_live(&self, window: &[Arc<Entry>], host: &dyn RouterHost) -> Option<String> {
        window.iter().find(|e| host.is_alive(&e.name)).map(|e| e.name.clone())
    }

    fn find_last_live(&self, window: &[Arc<Entry>], host: &dyn RouterHost) -> Option<String> {
        window.iter().rev().find(|e| host.is_alive(&e.name)).map(|e| e.name.clone())
    }

    /// Handle an inbound `MH_HrRoute` packet. `id` is the routing position
    /// (spec §4.5: ring ids are raw hash digests, carried as msgpack bin —
    /// see DESIGN.md for why this departs from the wire table's `string`
    /// notation). Returns whether the dispatcher should continue decoding
    /// the next header on the same buffer (spec §4.6 "handler chaining").
    pub fn handle_route(
        &self,
        host: &dyn RouterHost,
        flags: RouteFlags,
        id: RingHash,
        reader: &mut crate::codec::MessageReader,
    ) -> bool {
        let head = match self.table.next(&id) {
            Some(v) => v,
            None => return false, // empty ring: drop.
        };

        let window = self.replica_window(&head);

        if self.check_self(&window, host.local_name()) {
            debug!(id = %id, "hr_route: packet is for this node, continuing dispatch");
            return true;
        }

        let target = if flags.wants_last() {
            self.find_last_live(&window, host)
        } else {
            self.find_first_live(&window, host)
        };

        let target = match target {
            Some(t) => t,
            None => {
                warn!(id = %id, "hr_route: no live replica in window, dropping");
                return false;
            }
        };

        let mut out = crate::codec::MessageWriter::new();
        out.write_u64(MH_HR_ROUTE);
        out.write_int(flags.0);
        out.write_bytes(&id.0);
        reader.write_remaining_to(&mut out);
        host.send_to(SendStrategy::BestFit, &target, out.into_bytes());
        false
    }

    /// Registers the `MH_HrRoute` handler on `dispatcher` and subscribes
    /// this router to membership events (spec §4.6's "attach plugins" step).
    pub fn attach(self: &Arc<Self>, dispatcher: &Arc<crate::dispatch::Dispatcher>) {
        let sub = self.clone();
        dispatcher.register(
            MH_HR_ROUTE,
            std::sync::Arc::new(move |node: Arc<crate::dispatch::Dispatcher>, reader: &mut crate::codec::MessageReader| {
                let flags = match reader.decode_int() {
                    Ok(v) => RouteFlags(v),
                    Err(_) => return false,
                };
                let id_bytes = match reader.decode_bytes() {
                    Ok(v) => v,
                    Err(_) => return false,
                };
                if id_bytes.len() != 16 {
                    warn!("hr_route: id is not a 16-byte ring hash, dropping");
                    return false;
                }
                let mut arr = [0u8; 16];
                arr.copy_from_slice(&id_bytes);
                sub.handle_route(&*node, flags, RingHash(arr), reader)
            }),
        );
        dispatcher.deleg.add_async_hook(self.clone());
    }
}

impl MembershipHook for Subscriber {
    fn on_join(&self, node: &MemberInfo) {
        let meta = NodeMeta::decode(&node.metadata);
        if meta.has_flags(MT_HASH_RING_FLAGS, HRF_MEMBER) {
            self.table.join(&node.name);
        } else {
            self.table.invalidate(&node.name);
        }
    }

    fn on_update(&self, node: &MemberInfo) {
        let meta = NodeMeta::decode(&node.metadata);
        if meta.has_flags(MT_HASH_RING_FLAGS, HRF_MEMBER) {
            self.table.validate(&node.name);
        } else {
            self.table.invalidate(&node.name);
        }
    }

    fn on_leave(&self, node: &MemberInfo) {
        // The node may return, so it is marked dead rather than invalidated
        // outright (spec §4.5: "except on leave events... the node may return").
        self.table.leave(&node.name);
    }
}
