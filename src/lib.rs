pub mod codec;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod hash;
pub mod membership;
pub mod meta;
pub mod ring;
pub mod storage;
pub mod substrate;

pub use codec::{MessageReader, MessageWriter};
pub use config::Args;
pub use dispatch::Dispatcher;
pub use error::{DecodeError, MeshError};
pub use hash::{default_hash_fn, md5_hash, HashFn, RingHash};
pub use membership::{MembershipDelegate, MembershipHook};
pub use meta::NodeMeta;
pub use ring::{Entry, RouteFlags, Subscriber, Table, MH_HR_ROUTE};
pub use storage::{Freespace, Shard, StorageHandler, StoredEntry, UserMeta};
pub use substrate::{LoopbackSubstrate, MemberInfo, MembershipEvent, Substrate};
