//! Client-facing API: one-shot operation connections.
//!
//! Every client connection carries exactly one `OpRequest` and one `OpReply`
//! and is then closed. Servant tasks execute against the shared engine state
//! directly, so client traffic never blocks the node's control loop and a
//! primary switch can always preempt it.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::node::{RecoveryState, SharedState};
use super::peers::PeerStub;
use crate::protocol::{
    key_owner, key_to_hex, primary_of, Key, OpReply, OpRequest, OpStatus,
    MAX_VALUE_SIZE,
};
use crate::store::KvTable;
use crate::utils::{recv_frame, send_frame, ShardKvError};

/// Which replica set an operation addresses, if any.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum OpTarget {
    /// Key owned by this shard; primary set is authoritative.
    OwnShard,

    /// Key owned by the predecessor shard while this server is its acting
    /// primary; the secondary set is treated as the live primary.
    InterimShard,

    /// Not ours to serve.
    Reject,
}

/// The client-facing API module.
pub(crate) struct ClientApi {
    /// Client acceptor task join handle.
    _acceptor_handle: JoinHandle<()>,
}

impl ClientApi {
    /// Spawns the client acceptor task on a bound listener.
    pub(crate) fn new_and_setup(
        shared: Arc<SharedState>,
        listener: TcpListener,
    ) -> Self {
        let acceptor_handle =
            tokio::spawn(Self::acceptor_task(shared, listener));
        ClientApi {
            _acceptor_handle: acceptor_handle,
        }
    }

    /// Client acceptor task: one servant per one-shot connection.
    async fn acceptor_task(shared: Arc<SharedState>, listener: TcpListener) {
        pf_debug!(shared.id; "client acceptor task spawned");

        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    tokio::spawn(Self::servant_task(shared.clone(), stream));
                }
                Err(e) => {
                    pf_warn!(shared.id; "error accepting client connection: {}", e);
                }
            }
        }
    }

    /// Per-connection servant: one request, one reply, close.
    async fn servant_task(shared: Arc<SharedState>, mut stream: TcpStream) {
        let req = match recv_frame::<OpRequest, _>(&mut stream).await {
            Ok(req) => req,
            Err(e) => {
                pf_debug!(shared.id; "error reading client request: {}", e);
                return;
            }
        };

        let reply = handle_client_op(&shared, req).await;
        if let Err(e) = send_frame(&mut stream, &reply).await {
            pf_debug!(shared.id; "error replying to client: {}", e);
        }
    }
}

/// Classifies a write target for a key under the current recovery role.
fn classify_put(shared: &SharedState, key: &Key) -> OpTarget {
    let owner = key_owner(key, shared.population);
    if owner == shared.id {
        return OpTarget::OwnShard;
    }
    if owner == primary_of(shared.id, shared.population) {
        let role = shared.role.read().unwrap();
        // writes for the predecessor shard are ours only while acting as its
        // interim primary, and never once the switch has begun
        if role.acting_primary && role.state != RecoveryState::SwitchingPrimary
        {
            return OpTarget::InterimShard;
        }
    }
    OpTarget::Reject
}

/// Executes one client operation against the shared engine state.
pub(crate) async fn handle_client_op(
    shared: &Arc<SharedState>,
    req: OpRequest,
) -> OpReply {
    match req {
        OpRequest::Noop => OpReply::status(OpStatus::Success),

        OpRequest::Get { key } => {
            let owner = key_owner(&key, shared.population);
            if owner == shared.id {
                match shared.primary.get(&key) {
                    Some(value) => OpReply::with_value(value.to_vec()),
                    None => OpReply::status(OpStatus::KeyNotFound),
                }
            } else if owner == primary_of(shared.id, shared.population) {
                // reads may be served from the replica copy; while acting
                // as interim primary this copy is the live primary. The
                // switch window refuses the shard entirely.
                let switching = {
                    let role = shared.role.read().unwrap();
                    role.state == RecoveryState::SwitchingPrimary
                };
                if switching {
                    return OpReply::status(OpStatus::ServerFailure);
                }
                match shared.secondary.get(&key) {
                    Some(value) => OpReply::with_value(value.to_vec()),
                    None => OpReply::status(OpStatus::KeyNotFound),
                }
            } else {
                pf_debug!(shared.id; "GET for foreign key {} (owner {})",
                                     key_to_hex(&key), owner);
                OpReply::status(OpStatus::ServerFailure)
            }
        }

        OpRequest::Put { key, value } => {
            if value.len() > MAX_VALUE_SIZE {
                pf_warn!(shared.id; "oversize PUT of {} bytes rejected",
                                    value.len());
                return OpReply::status(OpStatus::ServerFailure);
            }

            // count ourselves in-flight before reading the role, so the
            // switch drain cannot miss a write admitted concurrently
            shared.put_inflight.fetch_add(1, Ordering::SeqCst);
            let reply = match classify_put(shared, &key) {
                OpTarget::OwnShard => {
                    put_forward(
                        shared,
                        &shared.primary,
                        &shared.secondary_stub,
                        &key,
                        Bytes::from(value),
                    )
                    .await
                }
                OpTarget::InterimShard => {
                    put_forward(
                        shared,
                        &shared.secondary,
                        &shared.replacement_stub,
                        &key,
                        Bytes::from(value),
                    )
                    .await
                }
                OpTarget::Reject => {
                    pf_debug!(shared.id; "PUT for foreign key {} rejected",
                                         key_to_hex(&key));
                    OpReply::status(OpStatus::ServerFailure)
                }
            };
            if shared.put_inflight.fetch_sub(1, Ordering::SeqCst) == 1 {
                shared.put_drained.notify_waiters();
            }
            reply
        }
    }
}

/// The replicated write path: insert locally, then forward the same PUT to
/// the replica partner while still holding the key's lock, so that writes to
/// a single key are totally ordered across both copies. A failed forward
/// rolls the local insert back and fails the write; SUCCESS to the client
/// means both replicas hold the new value.
async fn put_forward(
    shared: &SharedState,
    table: &KvTable,
    stub_slot: &Mutex<Option<PeerStub>>,
    key: &Key,
    value: Bytes,
) -> OpReply {
    let _guard = table.lock_key(key).await;

    let old = match table.put(key, value.clone()) {
        Ok(old) => old,
        Err(_) => return OpReply::status(OpStatus::OutOfSpace),
    };

    let forwarded = {
        let mut stub_slot = stub_slot.lock().await;
        match stub_slot.as_mut() {
            Some(stub) => {
                let result = stub
                    .roundtrip(&OpRequest::Put {
                        key: *key,
                        value: value.to_vec(),
                    })
                    .await;
                if result.is_err() {
                    // connection is broken; discard the stub so a stale
                    // socket is never reused
                    *stub_slot = None;
                }
                result
            }
            None => {
                Err(ShardKvError::msg("no replica partner connected"))
            }
        }
    };

    match forwarded {
        Ok(reply) if reply.status == OpStatus::Success => {
            OpReply::status(OpStatus::Success)
        }
        other => {
            // partner did not take the write: undo the local insert so the
            // two copies never diverge on a failed write
            match old {
                Some(old_value) => {
                    let _ = table.put(key, old_value);
                }
                None => {
                    table.remove(key);
                }
            }
            match other {
                Ok(reply) => {
                    pf_warn!(shared.id; "forwarded PUT {} refused: {:?}",
                                        key_to_hex(key), reply.status);
                }
                Err(e) => {
                    pf_warn!(shared.id; "forwarded PUT {} failed: {}",
                                        key_to_hex(key), e);
                }
            }
            OpReply::status(OpStatus::ServerFailure)
        }
    }
}
