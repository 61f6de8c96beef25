//! Typed wire messages exchanged between clients, servers, and the
//! coordinator.
//!
//! Clients open one connection per operation (closed after the reply);
//! control links and peer links are long-lived. All connections carry the
//! framed encoding implemented in `utils::safetcp`.

use serde::{Deserialize, Serialize};

use crate::protocol::{Key, ServerId};

/// Ceiling on any single wire frame, in bytes.
pub const MAX_MSG_LEN: usize = 16 * 1024;

// Allowance for the length prefix and message envelope overhead.
const MSG_HDR_ALLOWANCE: usize = 64;

/// Largest value accepted in a PUT.
pub const MAX_VALUE_SIZE: usize = MAX_MSG_LEN - MSG_HDR_ALLOWANCE;

/// Operation request, from a client or forwarded/streamed by a peer server.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum OpRequest {
    /// Liveness probe; on peer links doubles as the end-of-stream sentinel
    /// that closes a recovery streaming connection.
    Noop,

    /// Read the value stored for a key.
    Get { key: Key },

    /// Insert or replace the value stored for a key.
    Put { key: Key, value: Vec<u8> },
}

/// Operation status codes.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum OpStatus {
    Success,
    KeyNotFound,
    OutOfSpace,
    ServerFailure,
}

/// Reply to an operation request.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct OpReply {
    /// Operation outcome.
    pub status: OpStatus,

    /// Stored value, for successful GETs.
    pub value: Option<Vec<u8>>,
}

impl OpReply {
    /// Reply carrying a bare status and no value.
    pub fn status(status: OpStatus) -> Self {
        OpReply {
            status,
            value: None,
        }
    }

    /// Successful reply carrying a value.
    pub fn with_value(value: Vec<u8>) -> Self {
        OpReply {
            status: OpStatus::Success,
            value: Some(value),
        }
    }
}

/// Client request to the coordinator asking who serves a key.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct LocateRequest {
    pub key: Key,
}

/// Coordinator's answer to a locate request: where to send the operation.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct LocateResponse {
    pub host: String,
    pub port: u16,
}

/// Control command coordinator -> server.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum CtrlCmd {
    /// Connect to the named peer as the secondary replica backing this
    /// server's primary set.
    SetSecondary { host: String, port: u16 },

    /// The receiver is the surviving secondary of a failed shard: stream
    /// your secondary set to the named replacement, which publishes it as
    /// its rebuilt primary set, and act as interim primary meanwhile.
    UpdatePrimary { host: String, port: u16 },

    /// The receiver is the surviving primary whose replica lived on the
    /// failed shard: stream your primary set to the named replacement,
    /// which becomes your new secondary.
    UpdateSecondary { host: String, port: u16 },

    /// Flush in-flight writes for the recovered shard and yield authority
    /// back to the replacement.
    SwitchPrimary,

    /// Terminate gracefully.
    Shutdown,
}

/// Discriminant of a `CtrlCmd`, used to route acknowledgements.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum CtrlCmdKind {
    SetSecondary,
    UpdatePrimary,
    UpdateSecondary,
    SwitchPrimary,
    Shutdown,
}

impl CtrlCmd {
    /// The command's discriminant.
    pub fn kind(&self) -> CtrlCmdKind {
        match self {
            CtrlCmd::SetSecondary { .. } => CtrlCmdKind::SetSecondary,
            CtrlCmd::UpdatePrimary { .. } => CtrlCmdKind::UpdatePrimary,
            CtrlCmd::UpdateSecondary { .. } => CtrlCmdKind::UpdateSecondary,
            CtrlCmd::SwitchPrimary => CtrlCmdKind::SwitchPrimary,
            CtrlCmd::Shutdown => CtrlCmdKind::Shutdown,
        }
    }
}

/// Control command acknowledgement statuses.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum CtrlStatus {
    Success,
    Failure,
}

/// Control command acknowledgement server -> coordinator, sent on the same
/// connection the command arrived on.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct CtrlAck {
    pub status: CtrlStatus,
}

/// Control message server -> coordinator on the server's long-lived
/// outbound link.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum ServerMsg {
    /// First frame on the link: announce identity.
    Join { sid: ServerId },

    /// Periodic liveness beacon.
    Heartbeat { sid: ServerId },

    /// Secondary-set stream to the replacement completed.
    UpdatedPrimary { sid: ServerId },

    /// Secondary-set stream to the replacement failed.
    UpdatePrimaryFailed { sid: ServerId },

    /// Primary-set stream to the replacement completed.
    UpdatedSecondary { sid: ServerId },

    /// Primary-set stream to the replacement failed.
    UpdateSecondaryFailed { sid: ServerId },
}

#[cfg(test)]
mod wire_tests {
    use super::*;
    use crate::protocol::key_from_bytes;
    use rmp_serde::{decode::from_slice, encode::to_vec};

    #[test]
    fn op_request_codec() {
        let req = OpRequest::Put {
            key: key_from_bytes(b"apple"),
            value: b"red".to_vec(),
        };
        let bytes = to_vec(&req).unwrap();
        let back: OpRequest = from_slice(&bytes).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn ctrl_cmd_codec_and_kind() {
        let cmd = CtrlCmd::UpdatePrimary {
            host: "localhost".into(),
            port: 47001,
        };
        let bytes = to_vec(&cmd).unwrap();
        let back: CtrlCmd = from_slice(&bytes).unwrap();
        assert_eq!(back.kind(), CtrlCmdKind::UpdatePrimary);
        assert_eq!(CtrlCmd::SwitchPrimary.kind(), CtrlCmdKind::SwitchPrimary);
    }

    #[test]
    fn value_ceiling_fits_frame() {
        // a maximum-size value must still encode under the frame ceiling
        let req = OpRequest::Put {
            key: key_from_bytes(b"big"),
            value: vec![0xab; MAX_VALUE_SIZE],
        };
        let bytes = to_vec(&req).unwrap();
        assert!(bytes.len() <= MAX_MSG_LEN);
    }
}
