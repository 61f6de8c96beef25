//! Public interface to the shardkv library, linked by the coordinator,
//! server, and client executables.
//!
//! The system is a replicated, sharded in-memory key-value store: a single
//! coordinator owns placement and failure recovery, each server holds the
//! primary copy of its own shard plus the secondary copy of its
//! predecessor's, and PUTs replicate synchronously from primary to
//! secondary before the client sees success.

#[macro_use]
mod utils;

mod client;
mod coord;
mod protocol;
mod server;
mod store;

pub use client::{locate, one_shot_op, KvClient};
pub use coord::{ClusterConfig, CoordConfig, Coordinator, ServerEntry};
pub use protocol::{
    key_from_bytes, key_owner, key_to_hex, primary_of, secondary_of, Key,
    LocateResponse, OpReply, OpRequest, OpStatus, ServerId, KEY_SIZE,
    MAX_MSG_LEN, MAX_VALUE_SIZE,
};
pub use server::{KvServerNode, ServerConfig};
pub use store::KvTable;
pub use utils::ShardKvError;
