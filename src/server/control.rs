//! Server's outbound control link to the coordinator.
//!
//! The link is established once at startup, announces this server's identity
//! with a `Join` frame, and afterwards carries heartbeats and recovery
//! progress messages. The coordinator never writes on this connection; its
//! commands arrive on the separate inbound control listener owned by the
//! node's main loop.

use std::net::SocketAddr;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::protocol::{ServerId, ServerMsg};
use crate::utils::{send_frame, tcp_connect_with_retry, ShardKvError};

/// Outbound control link to the coordinator.
pub(crate) struct CoordLink {
    /// My server ID.
    me: ServerId,

    /// Sender side of the send channel.
    tx_send: mpsc::UnboundedSender<ServerMsg>,

    /// Control messenger task join handle.
    _messenger_handle: JoinHandle<()>,
}

impl CoordLink {
    /// Connects to the coordinator, announces identity, and spawns the
    /// messenger task that owns the connection's write side.
    pub(crate) async fn new_and_setup(
        me: ServerId,
        coord_addr: SocketAddr,
    ) -> Result<Self, ShardKvError> {
        pf_debug!(me; "connecting to coordinator '{}'...", coord_addr);
        let mut stream = tcp_connect_with_retry(coord_addr, 10).await?;
        send_frame(&mut stream, &ServerMsg::Join { sid: me }).await?;
        pf_debug!(me; "joined coordinator '{}'", coord_addr);

        let (tx_send, rx_send) = mpsc::unbounded_channel();
        let messenger_handle =
            tokio::spawn(Self::messenger_task(me, stream, rx_send));

        Ok(CoordLink {
            me,
            tx_send,
            _messenger_handle: messenger_handle,
        })
    }

    /// Sends a control message to the coordinator.
    pub(crate) fn send_msg(&self, msg: ServerMsg) -> Result<(), ShardKvError> {
        if self.tx_send.send(msg).is_err() {
            return logged_err!(self.me; "control send channel closed");
        }
        Ok(())
    }

    /// A clonable sender handle for background tasks (heartbeat ticker,
    /// recovery streamers).
    pub(crate) fn sender(&self) -> mpsc::UnboundedSender<ServerMsg> {
        self.tx_send.clone()
    }

    /// Messenger task: single writer of the outbound connection.
    async fn messenger_task(
        me: ServerId,
        mut conn: TcpStream,
        mut rx_send: mpsc::UnboundedReceiver<ServerMsg>,
    ) {
        pf_debug!(me; "control messenger task spawned");

        while let Some(msg) = rx_send.recv().await {
            if let Err(e) = send_frame(&mut conn, &msg).await {
                // coordinator lost; keep serving whatever we were serving
                pf_warn!(me; "coordinator link lost: {}", e);
                break;
            }
        }

        pf_debug!(me; "control messenger task exited");
    }
}

// Unit tests are done together with `coord::ctrl`.
