//! Coordinator's server-facing control hub.
//!
//! Two kinds of links exist per server, mirroring the two directions of the
//! control plane: an inbound link the server opens at startup (carrying its
//! `Join`, heartbeats, and recovery progress), and an outbound command link
//! the coordinator opens to the server's control port (carrying commands and
//! their acknowledgements). Everything funnels into one typed event channel
//! consumed by the coordinator's main loop.

use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::protocol::{
    CtrlAck, CtrlCmd, CtrlCmdKind, CtrlStatus, ServerId, ServerMsg,
};
use crate::utils::{
    recv_frame, send_frame, tcp_bind_with_retry, tcp_connect_with_retry,
    ShardKvError,
};

/// Control-plane event delivered to the coordinator's main loop.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum CtrlEvent {
    /// Message from a server's inbound link.
    Msg { sid: ServerId, msg: ServerMsg },

    /// Acknowledgement of a command sent on a server's outbound link.
    Ack {
        sid: ServerId,
        cmd: CtrlCmdKind,
        status: CtrlStatus,
    },
}

/// The server-facing control hub.
pub(crate) struct ServerCtrlHub {
    /// Receiver side of the merged event channel.
    rx_event: mpsc::UnboundedReceiver<CtrlEvent>,

    /// Sender template handed to servant and command link tasks.
    tx_event: mpsc::UnboundedSender<CtrlEvent>,

    /// Map from server ID -> sender side of its command channel.
    cmd_txs: HashMap<ServerId, mpsc::UnboundedSender<CtrlCmd>>,

    /// Server acceptor task join handle.
    _acceptor_handle: JoinHandle<()>,
}

impl ServerCtrlHub {
    /// Creates the control hub: binds the server-facing listener and spawns
    /// the acceptor task.
    pub(crate) async fn new_and_setup(
        srv_addr: SocketAddr,
    ) -> Result<Self, ShardKvError> {
        let (tx_event, rx_event) = mpsc::unbounded_channel();

        let listener = tcp_bind_with_retry(srv_addr, 10).await?;
        let acceptor_handle =
            tokio::spawn(Self::acceptor_task(listener, tx_event.clone()));

        Ok(ServerCtrlHub {
            rx_event,
            tx_event,
            cmd_txs: HashMap::new(),
            _acceptor_handle: acceptor_handle,
        })
    }

    /// Waits for the next control-plane event.
    pub(crate) async fn recv_event(&mut self) -> Result<CtrlEvent, ShardKvError> {
        match self.rx_event.recv().await {
            Some(event) => Ok(event),
            None => logged_err!("m"; "event channel has been closed"),
        }
    }

    /// Picks up an already-pending event without waiting.
    pub(crate) fn try_recv_event(&mut self) -> Option<CtrlEvent> {
        self.rx_event.try_recv().ok()
    }

    /// Opens (or replaces) the outbound command link to a server. An old
    /// link task for the same ID winds down once its channel is dropped.
    pub(crate) async fn open_cmd_link(
        &mut self,
        sid: ServerId,
        ctrl_addr: SocketAddr,
    ) -> Result<(), ShardKvError> {
        pf_debug!("m"; "opening command link to server {} '{}'...",
                       sid, ctrl_addr);
        let conn = tcp_connect_with_retry(ctrl_addr, 10).await?;

        let (tx_cmd, rx_cmd) = mpsc::unbounded_channel();
        tokio::spawn(Self::cmd_link_task(
            sid,
            conn,
            rx_cmd,
            self.tx_event.clone(),
        ));
        self.cmd_txs.insert(sid, tx_cmd);

        pf_debug!("m"; "command link to server {} opened", sid);
        Ok(())
    }

    /// Sends a control command to the specified server.
    pub(crate) fn send_cmd(
        &mut self,
        cmd: CtrlCmd,
        sid: ServerId,
    ) -> Result<(), ShardKvError> {
        match self.cmd_txs.get(&sid) {
            Some(tx_cmd) => {
                tx_cmd.send(cmd).map_err(ShardKvError::msg)?;
                Ok(())
            }
            None => {
                logged_err!("m"; "no command link to server {}", sid)
            }
        }
    }

    /// Server acceptor task: spawns an inbound servant per connection.
    async fn acceptor_task(
        listener: TcpListener,
        tx_event: mpsc::UnboundedSender<CtrlEvent>,
    ) {
        pf_debug!("m"; "server acceptor task spawned");

        let local_addr = listener.local_addr().unwrap();
        pf_info!("m"; "accepting servers on '{}'", local_addr);

        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    tokio::spawn(Self::servant_task(
                        stream,
                        addr,
                        tx_event.clone(),
                    ));
                }
                Err(e) => {
                    pf_warn!("m"; "error accepting server connection: {}", e);
                }
            }
        }
    }

    /// Inbound servant: the first frame must announce the server's
    /// identity, everything after is forwarded to the event channel.
    async fn servant_task(
        mut stream: TcpStream,
        addr: SocketAddr,
        tx_event: mpsc::UnboundedSender<CtrlEvent>,
    ) {
        let sid = match recv_frame::<ServerMsg, _>(&mut stream).await {
            Ok(ServerMsg::Join { sid }) => sid,
            Ok(msg) => {
                pf_error!("m"; "first frame from '{}' is {:?}, not Join",
                               addr, msg);
                return;
            }
            Err(e) => {
                pf_error!("m"; "error reading join from '{}': {}", addr, e);
                return;
            }
        };
        pf_debug!("m"; "server {} joined from '{}'", sid, addr);
        if tx_event
            .send(CtrlEvent::Msg {
                sid,
                msg: ServerMsg::Join { sid },
            })
            .is_err()
        {
            return;
        }

        loop {
            match recv_frame::<ServerMsg, _>(&mut stream).await {
                Ok(msg) => {
                    if tx_event.send(CtrlEvent::Msg { sid, msg }).is_err() {
                        break;
                    }
                }
                Err(_e) => {
                    // server went away; the failure detector deals with it
                    pf_debug!("m"; "control link from server {} closed", sid);
                    break;
                }
            }
        }
    }

    /// Outbound command link task: strictly sequential send/ack pairs; a
    /// broken link surfaces as a Failure ack for the in-flight command.
    async fn cmd_link_task(
        sid: ServerId,
        mut conn: TcpStream,
        mut rx_cmd: mpsc::UnboundedReceiver<CtrlCmd>,
        tx_event: mpsc::UnboundedSender<CtrlEvent>,
    ) {
        pf_debug!("m"; "command link task for {} spawned", sid);

        while let Some(cmd) = rx_cmd.recv().await {
            let kind = cmd.kind();
            // a transport error is reported as a Failure ack and ends this
            // task; an application-level Failure ack keeps the link alive
            let (status, broken) = match send_frame(&mut conn, &cmd).await {
                Ok(()) => match recv_frame::<CtrlAck, _>(&mut conn).await {
                    Ok(ack) => (ack.status, false),
                    Err(e) => {
                        pf_warn!("m"; "error reading {:?} ack from {}: {}",
                                      kind, sid, e);
                        (CtrlStatus::Failure, true)
                    }
                },
                Err(e) => {
                    pf_warn!("m"; "error sending {:?} to {}: {}",
                                  kind, sid, e);
                    (CtrlStatus::Failure, true)
                }
            };

            if tx_event
                .send(CtrlEvent::Ack {
                    sid,
                    cmd: kind,
                    status,
                })
                .is_err()
                || broken
            {
                break;
            }
        }

        pf_debug!("m"; "command link task for {} exited", sid);
    }
}

#[cfg(test)]
mod ctrl_tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Barrier;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn inbound_join_and_messages() -> Result<(), ShardKvError> {
        let barrier = Arc::new(Barrier::new(2));
        let barrier2 = barrier.clone();
        tokio::spawn(async move {
            // server side
            barrier2.wait().await;
            let mut conn =
                tcp_connect_with_retry("127.0.0.1:31800".parse()?, 10).await?;
            send_frame(&mut conn, &ServerMsg::Join { sid: 1 }).await?;
            send_frame(&mut conn, &ServerMsg::Heartbeat { sid: 1 }).await?;
            send_frame(&mut conn, &ServerMsg::UpdatedPrimary { sid: 1 })
                .await?;
            Ok::<(), ShardKvError>(())
        });
        // coordinator side
        let mut hub =
            ServerCtrlHub::new_and_setup("127.0.0.1:31800".parse()?).await?;
        barrier.wait().await;
        assert_eq!(
            hub.recv_event().await?,
            CtrlEvent::Msg {
                sid: 1,
                msg: ServerMsg::Join { sid: 1 }
            }
        );
        assert_eq!(
            hub.recv_event().await?,
            CtrlEvent::Msg {
                sid: 1,
                msg: ServerMsg::Heartbeat { sid: 1 }
            }
        );
        assert_eq!(
            hub.recv_event().await?,
            CtrlEvent::Msg {
                sid: 1,
                msg: ServerMsg::UpdatedPrimary { sid: 1 }
            }
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn outbound_cmd_and_ack() -> Result<(), ShardKvError> {
        let server_listener =
            tcp_bind_with_retry("127.0.0.1:31801".parse()?, 10).await?;
        tokio::spawn(async move {
            // server side: accept the command link, ack two commands
            let (mut conn, _) = server_listener.accept().await?;
            for _ in 0..2 {
                let cmd: CtrlCmd = recv_frame(&mut conn).await?;
                let status = match cmd {
                    CtrlCmd::SetSecondary { .. } => CtrlStatus::Success,
                    _ => CtrlStatus::Failure,
                };
                send_frame(&mut conn, &CtrlAck { status }).await?;
            }
            Ok::<(), ShardKvError>(())
        });
        // coordinator side
        let mut hub =
            ServerCtrlHub::new_and_setup("127.0.0.1:31802".parse()?).await?;
        hub.open_cmd_link(0, "127.0.0.1:31801".parse()?).await?;
        hub.send_cmd(
            CtrlCmd::SetSecondary {
                host: "localhost".into(),
                port: 7001,
            },
            0,
        )?;
        assert_eq!(
            hub.recv_event().await?,
            CtrlEvent::Ack {
                sid: 0,
                cmd: CtrlCmdKind::SetSecondary,
                status: CtrlStatus::Success
            }
        );
        hub.send_cmd(CtrlCmd::SwitchPrimary, 0)?;
        assert_eq!(
            hub.recv_event().await?,
            CtrlEvent::Ack {
                sid: 0,
                cmd: CtrlCmdKind::SwitchPrimary,
                status: CtrlStatus::Failure
            }
        );
        Ok(())
    }
}
