//! Shared protocol definitions: shard placement and typed wire messages.

mod placement;
mod wire;

pub use placement::{
    key_from_bytes, key_owner, key_to_hex, primary_of, secondary_of, Key,
    ServerId, KEY_SIZE,
};
pub use wire::{
    CtrlAck, CtrlCmd, CtrlCmdKind, CtrlStatus, LocateRequest, LocateResponse,
    OpReply, OpRequest, OpStatus, ServerMsg, MAX_MSG_LEN, MAX_VALUE_SIZE,
};
