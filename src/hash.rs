//! Ring hashing. Default is a fixed 16-byte MD5 digest of the node name
//! (spec §3: "a fixed cryptographic hash producing a fixed-length byte
//! string (default: 16-byte MD5)").

use md5::{Digest, Md5};
use std::fmt;

/// A node's position on the hash ring. Byte-lexicographic `Ord` gives the
/// ring its circular ordering (wraps: "next of max" is "min").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RingHash(pub [u8; 16]);

impl fmt::Display for RingHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// A pluggable hash function, matching the `Table.HashFunc` field of the
/// original (`func(string) string`, default MD5). Boxed so the ring table can
/// carry a non-default function without becoming generic.
pub type HashFn = std::sync::Arc<dyn Fn(&str) -> RingHash + Send + Sync>;

pub fn md5_hash(name: &str) -> RingHash {
    let mut hasher = Md5::new();
    hasher.update(name.as_bytes());
    let digest = hasher.finalize();
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest);
    RingHash(out)
}

pub fn default_hash_fn() -> HashFn {
    std::sync::Arc::new(md5_hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn md5_is_deterministic() {
        assert_eq!(md5_hash("node-a"), md5_hash("node-a"));
        assert_ne!(md5_hash("node-a"), md5_hash("node-b"));
    }

    #[test]
    fn known_digest() {
        // md5("") == d41d8cd98f00b204e9800998ecf8427e
        let h = md5_hash("");
        assert_eq!(h.to_string(), "d41d8cd98f00b204e9800998ecf8427e");
    }
}
