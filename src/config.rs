//! Node configuration & CLI (spec §4.10, §6), mirroring montana's `main.rs`
//! flat `clap::Parser` `Args` struct.

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(name = "meshkv-node", version, about = "meshkv: gossip-clustered, sharded key/value store node")]
pub struct Args {
    /// Stable node name advertised on the ring.
    #[arg(long)]
    pub name: String,

    /// Local bind address (substrate listen address).
    #[arg(long, default_value = "0.0.0.0")]
    pub bind_addr: String,

    /// Local bind port.
    #[arg(long, default_value_t = 7946)]
    pub bind_port: u16,

    /// Address advertised to peers, if different from `bind_addr`.
    #[arg(long)]
    pub advertise_addr: Option<String>,

    /// Port advertised to peers, if different from `bind_port`.
    #[arg(long)]
    pub advertise_port: Option<u16>,

    /// Data directory for the embedded sled database.
    #[arg(long, default_value = "./data")]
    pub data_dir: PathBuf,

    /// Number of local data shards.
    #[arg(long, default_value_t = 4)]
    pub shards: usize,

    /// Replication factor (ring replica window size, spec §4.5 "Num").
    #[arg(long, default_value_t = 2)]
    pub replicas: usize,

    /// Seconds a node stays routable after leaving, before Cleanup evicts it.
    #[arg(long, default_value_t = 48 * 3600)]
    pub node_death_secs: u64,

    /// Preshared-key passphrase, hashed to MD5 for the substrate (spec §6).
    #[arg(long)]
    pub preshared_key: Option<String>,

    /// Reproduce the source's Put-success-reuses-GetResponse wire quirk
    /// (spec §9 open question); turn off only when isolated from legacy peers.
    #[arg(long, default_value_t = true)]
    pub legacy_put_response_bug: bool,

    /// Per-shard free-space budget in bytes.
    #[arg(long, default_value_t = 1u64 << 30)]
    pub shard_budget_bytes: u64,

    /// Log filter, passed straight to `tracing_subscriber::EnvFilter`.
    #[arg(long, default_value = "info")]
    pub log_filter: String,
}

impl Args {
    pub fn preshared_key_hash(&self) -> Option<crate::hash::RingHash> {
        self.preshared_key.as_deref().map(crate::hash::md5_hash)
    }

    pub fn advertise(&self) -> (String, u16) {
        (
            self.advertise_addr.clone().unwrap_or_else(|| self.bind_addr.clone()),
            self.advertise_port.unwrap_or(self.bind_port),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advertise_falls_back_to_bind() {
        let args = Args::parse_from(["meshkv-node", "--name", "n1"]);
        assert_eq!(args.advertise(), ("0.0.0.0".to_string(), 7946));
    }

    #[test]
    fn preshared_key_hash_is_none_without_passphrase() {
        let args = Args::parse_from(["meshkv-node", "--name", "n1"]);
        assert!(args.preshared_key_hash().is_none());
    }
}
