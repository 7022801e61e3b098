//! Wrap node / dispatcher (spec §4.6), grounded on the original's
//! `mlst2.WrapNode`: a handler table keyed by message header, a consumer
//! task draining the membership delegate's inbound queue, and transport
//! selection on send.

use crate::membership::MembershipDelegate;
use crate::meta::NodeMeta;
use crate::ring::subscriber::{RouterHost, SendStrategy};
use crate::substrate::Substrate;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// Datagram/reliable-transport size threshold (spec §4.6, §6): a
/// conservative MTU minus gossip/framing overhead.
pub const DATAGRAM_THRESHOLD: usize = 912;

pub type Handler = Arc<dyn Fn(Arc<Dispatcher>, &mut crate::codec::MessageReader) -> bool + Send + Sync>;

pub struct Dispatcher {
    local_name: String,
    meta: RwLock<NodeMeta>,
    pub deleg: Arc<MembershipDelegate>,
    handlers: RwLock<HashMap<u64, Handler>>,
    substrate: Arc<dyn Substrate>,
}

impl Dispatcher {
    /// `initialize`: allocate the dispatcher and its membership delegate.
    pub fn new(local_name: impl Into<String>, substrate: Arc<dyn Substrate>) -> Arc<Self> {
        Arc::new(Self {
            local_name: local_name.into(),
            meta: RwLock::new(NodeMeta::new()),
            deleg: Arc::new(MembershipDelegate::new()),
            handlers: RwLock::new(HashMap::new()),
            substrate,
        })
    }

    pub fn local_name_str(&self) -> &str {
        &self.local_name
    }

    pub fn set_meta(&self, meta: NodeMeta) {
        *self.meta.write().unwrap() = meta;
    }

    pub fn register(&self, header: u64, handler: Handler) {
        self.handlers.write().unwrap().insert(header, handler);
    }

    /// `pre_start`: serialize meta into the delegate's advertised metadata,
    /// called once before the substrate is created.
    pub fn pre_start(&self, advertise_limit: usize) {
        let bytes = self.meta.read().unwrap().encode_within(advertise_limit);
        self.deleg.set_metadata(bytes);
    }

    /// `post_start`: spawn the consumer task. Returns its `JoinHandle`.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.run().await })
    }

    async fn run(self: Arc<Self>) {
        while let Some(bytes) = self.deleg.recv().await {
            self.consume(bytes);
        }
    }

    /// Drains every framed header off one inbound buffer, per spec §4.6:
    /// decode a header, look up its handler, invoke it; `true` chains to the
    /// next header on the same buffer, `false` or a lookup/decode failure
    /// ends the loop.
    fn consume(self: &Arc<Self>, bytes: Bytes) {
        let mut reader = crate::codec::MessageReader::new(bytes);
        loop {
            let header = match reader.decode_u64() {
                Ok(h) => h,
                Err(_) => return,
            };
            let handler = self.handlers.read().unwrap().get(&header).cloned();
            let handler = match handler {
                Some(h) => h,
                None => {
                    debug!(header, "no handler registered, dropping");
                    return;
                }
            };
            if !handler(self.clone(), &mut reader) {
                return;
            }
        }
    }

    /// `SendSelf`: blocking enqueue into the local inbound queue (loopback).
    /// Must not be called while holding the ring writer lock (spec §5).
    pub async fn send_self(&self, bytes: Bytes) {
        self.deleg.send_self(bytes).await;
    }

    pub fn send(&self, strategy: SendStrategy, node: &str, bytes: Bytes) {
        let use_datagram = match strategy {
            SendStrategy::BestFit | SendStrategy::Fast => bytes.len() <= DATAGRAM_THRESHOLD,
            SendStrategy::Datagram => true,
            SendStrategy::Reliable | SendStrategy::Stable | SendStrategy::NoDatagram => false,
        };
        let result = if use_datagram {
            self.substrate.send_best_effort(node, bytes)
        } else {
            self.substrate.send_reliable(node, bytes)
        };
        if let Err(e) = result {
            warn!(node, error = %e, "send failed, discarding (best effort)");
        }
    }

    pub fn lookup(&self, name: &str) -> Option<crate::substrate::MemberInfo> {
        self.deleg.lookup(name)
    }
}

impl RouterHost for Dispatcher {
    fn local_name(&self) -> &str {
        &self.local_name
    }

    fn is_alive(&self, name: &str) -> bool {
        self.deleg.is_alive(name)
    }

    fn send_to(&self, strategy: SendStrategy, node: &str, bytes: Bytes) {
        self.send(strategy, node, bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::LoopbackSubstrate;

    #[test]
    fn transport_threshold_is_respected() {
        // 912 bytes -> datagram, 913 -> reliable (spec §8 property 7). We
        // can't observe which substrate method fired without a spy; assert
        // the threshold constant directly matches the documented boundary.
        assert_eq!(DATAGRAM_THRESHOLD, 912);
    }

    #[tokio::test]
    async fn unknown_header_ends_dispatch_without_panicking() {
        let sub = Arc::new(LoopbackSubstrate::new());
        let node = Dispatcher::new("n1", sub);
        let mut w = crate::codec::MessageWriter::new();
        w.write_u64(0xdead_beef);
        node.consume(w.into_bytes());
    }

    #[tokio::test]
    async fn chaining_handler_decodes_next_header_on_same_buffer() {
        let sub = Arc::new(LoopbackSubstrate::new());
        let node = Dispatcher::new("n1", sub);
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        node.register(
            1,
            Arc::new(move |_d, _r| {
                seen2.lock().unwrap().push(1u64);
                true
            }),
        );
        let seen3 = seen.clone();
        node.register(
            2,
            Arc::new(move |_d, _r| {
                seen3.lock().unwrap().push(2u64);
                false
            }),
        );
        let mut w = crate::codec::MessageWriter::new();
        w.write_u64(1);
        w.write_u64(2);
        node.consume(w.into_bytes());
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }
}
