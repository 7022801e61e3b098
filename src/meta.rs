//! Node metadata: a `feature_id -> flags` map advertised through the
//! membership substrate (spec §3 "NodeMeta", §4.2).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Core-recognized feature id for hash-ring participation flags.
pub const MT_HASH_RING_FLAGS: u32 = 0x20000;

/// Node participates in routing (attaches a [`crate::ring::subscriber::Subscriber`]).
pub const HRF_SUBSCRIBER: u32 = 1;
/// Node owns ring slots (has called `BecomeMember`).
pub const HRF_MEMBER: u32 = 1 << 1;

/// `feature_id -> flags` map, encoded with the same msgpack codec as message
/// payloads (see `SPEC_FULL.md` "Supplemented from original_source/": the
/// original used XDR only for this one structure; this crate uses one wire
/// format everywhere).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeMeta(BTreeMap<u32, u32>);

impl NodeMeta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, feature: u32, flags: u32) {
        self.0.insert(feature, flags);
    }

    pub fn has(&self, feature: u32) -> bool {
        self.0.contains_key(&feature)
    }

    pub fn has_flags(&self, feature: u32, mask: u32) -> bool {
        self.0.get(&feature).map(|v| v & mask != 0).unwrap_or(false)
    }

    /// Encode the map, respecting the substrate's advertised-metadata size
    /// limit. If the encoding doesn't fit, advertise nothing (spec §4.2).
    pub fn encode_within(&self, limit: usize) -> Vec<u8> {
        match rmp_serde::to_vec(&self.0) {
            Ok(bytes) if bytes.len() <= limit => bytes,
            _ => Vec::new(),
        }
    }

    pub fn decode(bytes: &[u8]) -> Self {
        rmp_serde::from_slice(bytes).map(Self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn has_flags_requires_mask_overlap() {
        let mut m = NodeMeta::new();
        m.set(MT_HASH_RING_FLAGS, HRF_SUBSCRIBER);
        assert!(m.has(MT_HASH_RING_FLAGS));
        assert!(m.has_flags(MT_HASH_RING_FLAGS, HRF_SUBSCRIBER));
        assert!(!m.has_flags(MT_HASH_RING_FLAGS, HRF_MEMBER));
        assert!(!m.has(0xdead));
    }

    #[test]
    fn encode_within_limit_falls_back_to_empty() {
        let mut m = NodeMeta::new();
        m.set(MT_HASH_RING_FLAGS, HRF_SUBSCRIBER | HRF_MEMBER);
        let encoded = m.encode_within(1024);
        assert!(!encoded.is_empty());
        let too_small = m.encode_within(0);
        assert!(too_small.is_empty());
    }

    #[test]
    fn roundtrip_through_decode() {
        let mut m = NodeMeta::new();
        m.set(MT_HASH_RING_FLAGS, HRF_MEMBER);
        let encoded = m.encode_within(4096);
        let decoded = NodeMeta::decode(&encoded);
        assert_eq!(m, decoded);
    }
}
