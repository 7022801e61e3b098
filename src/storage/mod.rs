pub mod handler;
pub mod shard;

pub use handler::StorageHandler;
pub use shard::{Freespace, Shard, StoredEntry, UserMeta};
