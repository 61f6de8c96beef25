//! Server-to-server communication: the peer listener, the outbound peer
//! stub, and recovery key-set streaming.
//!
//! Peer connections carry `OpRequest` frames only. A `Put` is routed into
//! the receiver's primary or secondary table by key ownership; a `Noop` is
//! the end-of-stream sentinel that closes the connection. The same handler
//! therefore serves normal replication forwards, both recovery streams, and
//! live forwards to a replacement.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use super::node::SharedState;
use crate::protocol::{
    key_owner, key_to_hex, primary_of, Key, OpReply, OpRequest, OpStatus,
    ServerId,
};
use crate::store::KvTable;
use crate::utils::{
    recv_frame, send_frame, tcp_connect_with_retry, ShardKvError,
};

/// Outbound request/response stub over a single peer connection. Shared
/// users wrap it in a mutex; the stub itself is strictly sequential.
pub(crate) struct PeerStub {
    conn: TcpStream,
}

impl PeerStub {
    /// Connects to a peer's server-facing port.
    pub(crate) async fn connect(
        addr: SocketAddr,
        retries: u8,
    ) -> Result<Self, ShardKvError> {
        let conn = tcp_connect_with_retry(addr, retries).await?;
        Ok(PeerStub { conn })
    }

    /// Sends one operation and waits for its reply.
    pub(crate) async fn roundtrip(
        &mut self,
        req: &OpRequest,
    ) -> Result<OpReply, ShardKvError> {
        send_frame(&mut self.conn, req).await?;
        recv_frame(&mut self.conn).await
    }

    /// Sends one operation without expecting a reply (the end-of-stream
    /// `Noop` sentinel).
    pub(crate) async fn send_only(
        &mut self,
        req: &OpRequest,
    ) -> Result<(), ShardKvError> {
        send_frame(&mut self.conn, req).await
    }
}

/// The peer-facing listener module.
pub(crate) struct PeerApi {
    /// Peer acceptor task join handle.
    _acceptor_handle: JoinHandle<()>,
}

impl PeerApi {
    /// Binds the peer listener and spawns the acceptor task.
    pub(crate) fn new_and_setup(
        shared: Arc<SharedState>,
        listener: TcpListener,
    ) -> Self {
        let acceptor_handle =
            tokio::spawn(Self::acceptor_task(shared, listener));
        PeerApi {
            _acceptor_handle: acceptor_handle,
        }
    }

    /// Peer acceptor task: one servant task per inbound peer connection.
    async fn acceptor_task(shared: Arc<SharedState>, listener: TcpListener) {
        pf_debug!(shared.id; "peer acceptor task spawned");

        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    pf_debug!(shared.id; "peer connected from '{}'", addr);
                    tokio::spawn(Self::servant_task(shared.clone(), stream));
                }
                Err(e) => {
                    pf_warn!(shared.id; "error accepting peer connection: {}", e);
                }
            }
        }
    }

    /// Per-connection servant: applies peer operations until the connection
    /// closes or the end-of-stream sentinel arrives.
    async fn servant_task(shared: Arc<SharedState>, mut stream: TcpStream) {
        loop {
            let req = match recv_frame::<OpRequest, _>(&mut stream).await {
                Ok(req) => req,
                Err(_e) => break, // peer closed or sent garbage
            };

            match req {
                OpRequest::Noop => {
                    // end-of-stream sentinel closes this connection
                    pf_debug!(shared.id; "peer stream completed, closing");
                    break;
                }

                OpRequest::Put { key, value } => {
                    let reply = apply_peer_put(&shared, &key, value).await;
                    if let Err(e) = send_frame(&mut stream, &reply).await {
                        pf_warn!(shared.id; "error replying to peer: {}", e);
                        break;
                    }
                }

                OpRequest::Get { .. } => {
                    // peers never read from each other
                    pf_warn!(shared.id; "unexpected GET on peer connection");
                    let reply = OpReply::status(OpStatus::ServerFailure);
                    if send_frame(&mut stream, &reply).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

/// Applies a peer-originated PUT into the table selected by key ownership:
/// our primary set if we own the key (recovery stream or live forward into a
/// replacement), our secondary set if our predecessor owns it (normal
/// replication forward or the surviving primary's rebuild stream).
async fn apply_peer_put(
    shared: &SharedState,
    key: &Key,
    value: Vec<u8>,
) -> OpReply {
    let owner = key_owner(key, shared.population);
    let table: &KvTable = if owner == shared.id {
        &shared.primary
    } else if owner == primary_of(shared.id, shared.population) {
        &shared.secondary
    } else {
        pf_warn!(shared.id; "peer PUT for foreign key {} (owner {})",
                            key_to_hex(key), owner);
        return OpReply::status(OpStatus::ServerFailure);
    };

    let _guard = table.lock_key(key).await;
    match table.put(key, Bytes::from(value)) {
        Ok(_) => OpReply::status(OpStatus::Success),
        Err(_) => OpReply::status(OpStatus::OutOfSpace),
    }
}

/// Streams every entry of `table` to the replacement at `target`, one PUT
/// per entry under the entry's key lock, then sends the end-of-stream
/// sentinel. Live writes interleave freely; last-write-wins overwrite at the
/// destination makes stream and live traffic converge.
pub(crate) async fn stream_table(
    me: ServerId,
    table: &KvTable,
    target: SocketAddr,
) -> Result<(), ShardKvError> {
    let mut stub = PeerStub::connect(target, 10).await?;
    let keys = table.snapshot_keys();
    pf_info!(me; "streaming {} entries to '{}'", keys.len(), target);

    for key in keys {
        let _guard = table.lock_key(&key).await;
        if let Some(value) = table.get(&key) {
            let reply = stub
                .roundtrip(&OpRequest::Put {
                    key,
                    value: value.to_vec(),
                })
                .await?;
            if reply.status != OpStatus::Success {
                return Err(ShardKvError(format!(
                    "stream entry {} refused: {:?}",
                    key_to_hex(&key),
                    reply.status
                )));
            }
        }
    }

    stub.send_only(&OpRequest::Noop).await?;
    pf_info!(me; "stream to '{}' completed", target);
    Ok(())
}
