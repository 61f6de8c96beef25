//! Client-side stubs: locate a key's server through the coordinator, then
//! issue one operation per connection against that server.

use std::net::SocketAddr;

use tokio::time::{self, Duration};

use crate::protocol::{
    Key, LocateRequest, LocateResponse, OpReply, OpRequest, OpStatus,
};
use crate::utils::{
    recv_frame, resolve_addr, send_frame, tcp_connect_with_retry, ShardKvError,
};

/// Asks the coordinator which server currently serves `key`. The
/// coordinator silently drops requests for a quiesced shard, which surfaces
/// here as an error; callers retry.
pub async fn locate(
    coord_addr: SocketAddr,
    key: &Key,
) -> Result<LocateResponse, ShardKvError> {
    let mut conn = tcp_connect_with_retry(coord_addr, 0).await?;
    send_frame(&mut conn, &LocateRequest { key: *key }).await?;
    recv_frame(&mut conn).await
}

/// Issues a single operation over a fresh connection; the connection is
/// closed after the reply.
pub async fn one_shot_op(
    addr: SocketAddr,
    req: &OpRequest,
) -> Result<OpReply, ShardKvError> {
    let mut conn = tcp_connect_with_retry(addr, 0).await?;
    send_frame(&mut conn, req).await?;
    recv_frame(&mut conn).await
}

/// Convenience client: locate-then-operate with bounded retries. Retries
/// cover the transient windows of normal recovery: dropped locates while a
/// shard is quiesced, connection refusals around a crash, and the brief gap
/// before the surviving secondary starts acting as interim primary.
pub struct KvClient {
    /// Address of the coordinator's client-facing port.
    coord_addr: SocketAddr,

    /// How many times to retry an operation before giving up.
    retries: u8,
}

impl KvClient {
    /// Creates a client handle talking to the given coordinator.
    pub fn new(coord_addr: SocketAddr) -> Self {
        KvClient {
            coord_addr,
            retries: 10,
        }
    }

    /// Overrides the retry budget.
    pub fn with_retries(mut self, retries: u8) -> Self {
        self.retries = retries;
        self
    }

    /// GET of a key routed through the coordinator.
    pub async fn get(&self, key: &Key) -> Result<OpReply, ShardKvError> {
        self.do_op(key, OpRequest::Get { key: *key }).await
    }

    /// PUT of a key/value pair routed through the coordinator.
    pub async fn put(
        &self,
        key: &Key,
        value: Vec<u8>,
    ) -> Result<OpReply, ShardKvError> {
        self.do_op(key, OpRequest::Put { key: *key, value }).await
    }

    /// NOOP against the server that owns `key`.
    pub async fn noop(&self, key: &Key) -> Result<OpReply, ShardKvError> {
        self.do_op(key, OpRequest::Noop).await
    }

    /// Locate-then-operate with retries.
    async fn do_op(
        &self,
        key: &Key,
        req: OpRequest,
    ) -> Result<OpReply, ShardKvError> {
        let mut last_reply: Option<OpReply> = None;
        let mut last_err = ShardKvError::msg("operation not attempted");

        for _attempt in 0..=self.retries {
            match self.try_op(key, &req).await {
                Ok(reply) => {
                    if reply.status != OpStatus::ServerFailure {
                        return Ok(reply);
                    }
                    // SERVER_FAILURE may be a transient misroute during
                    // recovery; re-locate and try again
                    last_reply = Some(reply);
                }
                Err(e) => {
                    last_err = e;
                }
            }
            time::sleep(Duration::from_millis(100)).await;
        }

        match last_reply {
            Some(reply) => Ok(reply),
            None => Err(last_err),
        }
    }

    /// One locate + operation attempt.
    async fn try_op(
        &self,
        key: &Key,
        req: &OpRequest,
    ) -> Result<OpReply, ShardKvError> {
        let loc = locate(self.coord_addr, key).await?;
        let addr = resolve_addr(&loc.host, loc.port).await?;
        one_shot_op(addr, req).await
    }
}
