//! Demo node binary: wires the core crate's components together over the
//! in-process [`meshkv::LoopbackSubstrate`] double, since no production
//! gossip engine ships with this crate (spec §1's external-collaborator
//! boundary). A real deployment swaps the substrate wiring for an actual
//! gossip library and otherwise reuses every piece below unchanged.

use clap::Parser;
use meshkv::{
    Args, Dispatcher, Freespace, LoopbackSubstrate, MemberInfo, NodeMeta, Shard, StorageHandler,
    Subscriber, Table,
};
use meshkv::storage::shard::{SledFreespace, SledShard};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("meshkv={}", args.log_filter).parse()?),
        )
        .init();

    if let Some(psk) = args.preshared_key_hash() {
        info!(psk = %psk, "preshared key configured");
    }

    std::fs::create_dir_all(&args.data_dir)?;
    let db = sled::open(&args.data_dir)?;

    let mut data: Vec<Option<Arc<dyn Shard>>> = Vec::with_capacity(args.shards);
    let mut freespace: Vec<Option<Arc<dyn Freespace>>> = Vec::with_capacity(args.shards);
    for i in 0..args.shards {
        let tree = db.open_tree(format!("data_{i}"))?;
        data.push(Some(Arc::new(SledShard::new(tree))));
        freespace.push(Some(Arc::new(SledFreespace::new(db.clone(), args.shard_budget_bytes)) as Arc<dyn Freespace>));
    }
    let redirects_tree = db.open_tree("redirects")?;
    let redirects: Option<Arc<dyn Shard>> = Some(Arc::new(SledShard::new(redirects_tree)));

    let substrate = Arc::new(LoopbackSubstrate::new());
    let node = Dispatcher::new(args.name.clone(), substrate.clone());

    let (advertise_addr, advertise_port) = args.advertise();
    let address = format!("{advertise_addr}:{advertise_port}").parse()?;
    let (tx, mut rx) = tokio::sync::mpsc::channel(64);
    substrate.register(args.name.clone(), tx);
    let deleg = node.deleg.clone();
    tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            deleg.notify_msg(bytes);
        }
    });

    let table = Arc::new(Table::with_config(meshkv::hash::default_hash_fn(), std::time::Duration::from_secs(args.node_death_secs)));
    let subscriber = Arc::new(Subscriber::new(table.clone(), args.replicas));
    subscriber.attach(&node);

    let mut meta = NodeMeta::new();
    meta.set(meshkv::meta::MT_HASH_RING_FLAGS, meshkv::meta::HRF_SUBSCRIBER | meshkv::meta::HRF_MEMBER);
    node.set_meta(meta);
    node.pre_start(1400);

    let store = StorageHandler::new(data, redirects, freespace, args.legacy_put_response_bug);
    store.attach(&node);

    node.start();

    // Self-join: a solo node is its own sole replica until gossip delivers
    // other members' join events (which this binary, lacking a real
    // substrate, never receives). Feeds both the membership index and,
    // through the subscriber's async hook, the ring table.
    node.deleg.notify_join(MemberInfo {
        name: args.name.clone(),
        metadata: node.deleg.node_meta(1400),
        address,
    });

    info!(node = %args.name, shards = args.shards, replicas = args.replicas, "meshkv node started");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}
