//! The key-value server node engine.
//!
//! Owns all per-server state, runs the control event loop, and drives the
//! server side of the recovery protocol. Client and peer traffic is handled
//! by servant tasks over the shared state so that a coordinator command
//! (notably SWITCH_PRIMARY) is never stuck behind client I/O.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use bytes::BytesMut;
use serde::Deserialize;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, MissedTickBehavior};

use super::control::CoordLink;
use super::external::ClientApi;
use super::peers::{stream_table, PeerApi, PeerStub};
use crate::protocol::{
    primary_of, secondary_of, CtrlAck, CtrlCmd, CtrlStatus, ServerId,
    ServerMsg,
};
use crate::store::KvTable;
use crate::utils::{
    resolve_addr, safe_tcp_read, safe_tcp_write, tcp_bind_with_retry,
    ShardKvError,
};

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Heartbeat sending interval in millisecs.
    pub heartbeat_interval_ms: u64,

    /// Per-table memory budget in bytes; 0 means unbounded.
    pub max_table_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            heartbeat_interval_ms: 1000,
            max_table_bytes: 0,
        }
    }
}

/// Server-side recovery states.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum RecoveryState {
    /// Serving as primary for own shard, secondary for the predecessor.
    Normal,

    /// Acting as the surviving secondary: streaming the secondary set to
    /// the failed shard's replacement.
    StreamingPrimary,

    /// Acting as the surviving primary: streaming the primary set to the
    /// replacement that holds our new secondary copy.
    StreamingSecondary,

    /// Quiescing before yielding the interim primary role.
    SwitchingPrimary,
}

/// Current recovery role of the server.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RoleState {
    /// Recovery state machine position.
    pub state: RecoveryState,

    /// True while serving the predecessor shard in place of its failed
    /// primary; spans from UPDATE_PRIMARY until the switch completes.
    pub acting_primary: bool,
}

/// State shared between the node's control loop and its servant tasks.
pub(crate) struct SharedState {
    /// My server ID.
    pub id: ServerId,

    /// Total number of servers in the cluster.
    pub population: u8,

    /// Primary key set: keys this shard owns.
    pub primary: KvTable,

    /// Secondary key set: replica of the predecessor shard.
    pub secondary: KvTable,

    /// Current recovery role; reads are brief and never span an await.
    pub role: RwLock<RoleState>,

    /// Forwarding stub to the secondary replica of our primary set.
    pub secondary_stub: Mutex<Option<PeerStub>>,

    /// Forwarding stub to the replacement while acting as interim primary.
    pub replacement_stub: Mutex<Option<PeerStub>>,

    /// Number of client PUTs currently in flight; the switch drains this
    /// to zero before yielding.
    pub put_inflight: AtomicUsize,

    /// Notified whenever `put_inflight` drops to zero.
    pub put_drained: Notify,
}

/// The key-value server node engine.
pub struct KvServerNode {
    /// My server ID.
    id: ServerId,

    /// State shared with servant tasks.
    shared: Arc<SharedState>,

    /// Listener for the coordinator's inbound command connection.
    ctrl_listener: TcpListener,

    /// Outbound control link to the coordinator.
    coord_link: CoordLink,

    /// Client-facing API module.
    _client_api: ClientApi,

    /// Peer-facing API module.
    _peer_api: PeerApi,

    /// Heartbeat ticker task join handle.
    _heartbeat_handle: JoinHandle<()>,
}

impl KvServerNode {
    /// Creates a new server node: binds all three listeners, joins the
    /// coordinator, and spawns the heartbeat ticker and acceptor tasks.
    pub async fn new_and_setup(
        id: ServerId,
        population: u8,
        client_addr: SocketAddr,
        peer_addr: SocketAddr,
        ctrl_addr: SocketAddr,
        coord_addr: SocketAddr,
        config_str: Option<&str>,
    ) -> Result<Self, ShardKvError> {
        if population < 3 {
            return logged_err!(id; "invalid population {}", population);
        }
        if id >= population {
            return logged_err!(id; "server ID {} >= population {}",
                                   id, population);
        }

        let config = parsed_config!(config_str => ServerConfig;
                                    heartbeat_interval_ms, max_table_bytes)?;
        if config.heartbeat_interval_ms < 10 {
            return logged_err!(
                id;
                "invalid config.heartbeat_interval_ms '{}'",
                config.heartbeat_interval_ms
            );
        }

        let shared = Arc::new(SharedState {
            id,
            population,
            primary: KvTable::new(config.max_table_bytes),
            secondary: KvTable::new(config.max_table_bytes),
            role: RwLock::new(RoleState {
                state: RecoveryState::Normal,
                acting_primary: false,
            }),
            secondary_stub: Mutex::new(None),
            replacement_stub: Mutex::new(None),
            put_inflight: AtomicUsize::new(0),
            put_drained: Notify::new(),
        });

        // bind listeners before joining so the coordinator can reach us the
        // moment it learns about us
        let client_listener = tcp_bind_with_retry(client_addr, 10).await?;
        let peer_listener = tcp_bind_with_retry(peer_addr, 10).await?;
        let ctrl_listener = tcp_bind_with_retry(ctrl_addr, 10).await?;

        let peer_api = PeerApi::new_and_setup(shared.clone(), peer_listener);

        let coord_link = CoordLink::new_and_setup(id, coord_addr).await?;

        let heartbeat_handle = tokio::spawn(Self::heartbeat_ticker_task(
            id,
            coord_link.sender(),
            Duration::from_millis(config.heartbeat_interval_ms),
        ));

        let client_api =
            ClientApi::new_and_setup(shared.clone(), client_listener);

        pf_info!(id; "server node initialized: population {}, \
                      primary of shard {}, secondary of shard {}",
                     population, id, primary_of(id, population));

        Ok(KvServerNode {
            id,
            shared,
            ctrl_listener,
            coord_link,
            _client_api: client_api,
            _peer_api: peer_api,
            _heartbeat_handle: heartbeat_handle,
        })
    }

    /// Heartbeat ticker task: beacons liveness to the coordinator once per
    /// interval, independently of all request traffic.
    async fn heartbeat_ticker_task(
        me: ServerId,
        tx_send: mpsc::UnboundedSender<ServerMsg>,
        interval: Duration,
    ) {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if tx_send.send(ServerMsg::Heartbeat { sid: me }).is_err() {
                pf_debug!(me; "heartbeat channel closed, ticker exiting");
                break;
            }
        }
    }

    /// Main event loop: accepts the coordinator's command connection and
    /// serves control commands until shutdown or termination signal.
    pub async fn run(
        &mut self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), ShardKvError> {
        loop {
            let (stream, addr) = tokio::select! {
                accepted = self.ctrl_listener.accept() => {
                    match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            pf_warn!(self.id; "error accepting coordinator \
                                               connection: {}", e);
                            continue;
                        }
                    }
                },

                _ = rx_term.changed() => {
                    pf_warn!(self.id; "server caught termination signal");
                    return Ok(());
                }
            };
            pf_debug!(self.id; "coordinator connected from '{}'", addr);

            let (mut conn_read, conn_write) = stream.into_split();
            let mut read_buf = BytesMut::new();
            let mut write_buf = BytesMut::new();
            let mut write_buf_cursor = 0;

            loop {
                tokio::select! {
                    cmd = safe_tcp_read::<CtrlCmd, _>(&mut read_buf,
                                                      &mut conn_read) => {
                        let cmd = match cmd {
                            Ok(cmd) => cmd,
                            Err(_e) => {
                                // coordinator link lost; keep serving and
                                // wait for it to reconnect
                                pf_warn!(self.id; "coordinator command link \
                                                   closed");
                                break;
                            }
                        };

                        let shutdown = matches!(cmd, CtrlCmd::Shutdown);
                        let ack = self.handle_ctrl_cmd(cmd).await;
                        if let Err(e) = Self::write_ack(
                            &mut write_buf,
                            &mut write_buf_cursor,
                            &conn_write,
                            &ack,
                        )
                        .await
                        {
                            pf_error!(self.id; "error sending ctrl ack: {}",
                                               e);
                            break;
                        }
                        if shutdown {
                            pf_warn!(self.id; "server got shutdown command");
                            return Ok(());
                        }
                    },

                    _ = rx_term.changed() => {
                        pf_warn!(self.id; "server caught termination signal");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Synthesized handler of coordinator control commands.
    async fn handle_ctrl_cmd(&self, cmd: CtrlCmd) -> CtrlAck {
        let status = match cmd {
            CtrlCmd::SetSecondary { host, port } => {
                self.handle_set_secondary(&host, port).await
            }
            CtrlCmd::UpdatePrimary { host, port } => {
                self.handle_update_primary(&host, port).await
            }
            CtrlCmd::UpdateSecondary { host, port } => {
                self.handle_update_secondary(&host, port).await
            }
            CtrlCmd::SwitchPrimary => self.handle_switch_primary().await,
            CtrlCmd::Shutdown => CtrlStatus::Success,
        };
        CtrlAck { status }
    }

    /// Handler of SET_SECONDARY: (re)connect the forwarding stub for our
    /// own primary set's replica partner.
    async fn handle_set_secondary(&self, host: &str, port: u16) -> CtrlStatus {
        match self.connect_stub(host, port).await {
            Ok((stub, _)) => {
                *self.shared.secondary_stub.lock().await = Some(stub);
                pf_info!(self.id; "secondary replica set to '{}:{}'",
                                  host, port);
                CtrlStatus::Success
            }
            Err(e) => {
                pf_error!(self.id; "error connecting to secondary \
                                    '{}:{}': {}", host, port, e);
                CtrlStatus::Failure
            }
        }
    }

    /// Handler of UPDATE_PRIMARY: this server is the surviving secondary of
    /// the failed shard. Become its acting primary, connect a live-forward
    /// stub to the replacement, and stream the secondary set over.
    async fn handle_update_primary(&self, host: &str, port: u16) -> CtrlStatus {
        {
            let mut role = self.shared.role.write().unwrap();
            if role.state != RecoveryState::Normal {
                pf_error!(self.id; "UPDATE_PRIMARY in state {:?} refused",
                                   role.state);
                return CtrlStatus::Failure;
            }
            role.state = RecoveryState::StreamingPrimary;
            role.acting_primary = true;
        }

        let target = match self.connect_stub(host, port).await {
            Ok((stub, addr)) => {
                *self.shared.replacement_stub.lock().await = Some(stub);
                addr
            }
            Err(e) => {
                self.rollback_streaming(false).await;
                pf_error!(self.id; "error connecting to replacement \
                                    '{}:{}': {}", host, port, e);
                return CtrlStatus::Failure;
            }
        };
        pf_info!(self.id; "acting primary for shard {}, streaming its \
                           key set to '{}'",
                          primary_of(self.id, self.shared.population), target);

        // stream in the background; live client writes for the failed shard
        // are admitted meanwhile and forwarded through the replacement stub
        let shared = self.shared.clone();
        let tx_ctrl = self.coord_link.sender();
        let me = self.id;
        tokio::spawn(async move {
            let result = stream_table(me, &shared.secondary, target).await;
            let msg = match result {
                Ok(()) => {
                    let mut role = shared.role.write().unwrap();
                    role.state = RecoveryState::Normal;
                    ServerMsg::UpdatedPrimary { sid: me }
                }
                Err(e) => {
                    pf_error!(me; "secondary-set stream failed: {}", e);
                    {
                        let mut role = shared.role.write().unwrap();
                        role.state = RecoveryState::Normal;
                        role.acting_primary = false;
                    }
                    *shared.replacement_stub.lock().await = None;
                    ServerMsg::UpdatePrimaryFailed { sid: me }
                }
            };
            if tx_ctrl.send(msg).is_err() {
                pf_error!(me; "error reporting stream result");
            }
        });

        CtrlStatus::Success
    }

    /// Handler of UPDATE_SECONDARY: this server is the surviving primary
    /// whose replica lived on the failed shard. Repoint the forwarding stub
    /// at the replacement and stream the primary set over.
    async fn handle_update_secondary(
        &self,
        host: &str,
        port: u16,
    ) -> CtrlStatus {
        {
            let mut role = self.shared.role.write().unwrap();
            if role.state != RecoveryState::Normal {
                pf_error!(self.id; "UPDATE_SECONDARY in state {:?} refused",
                                   role.state);
                return CtrlStatus::Failure;
            }
            role.state = RecoveryState::StreamingSecondary;
        }

        let target = match self.connect_stub(host, port).await {
            Ok((stub, addr)) => {
                // live writes to our own shard replicate to the replacement
                // from this point on, converging with the stream below
                *self.shared.secondary_stub.lock().await = Some(stub);
                addr
            }
            Err(e) => {
                self.rollback_streaming(true).await;
                pf_error!(self.id; "error connecting to replacement \
                                    '{}:{}': {}", host, port, e);
                return CtrlStatus::Failure;
            }
        };
        pf_info!(self.id; "streaming primary key set to new secondary '{}'",
                          target);

        let shared = self.shared.clone();
        let tx_ctrl = self.coord_link.sender();
        let me = self.id;
        tokio::spawn(async move {
            let result = stream_table(me, &shared.primary, target).await;
            {
                let mut role = shared.role.write().unwrap();
                role.state = RecoveryState::Normal;
            }
            let msg = match result {
                Ok(()) => ServerMsg::UpdatedSecondary { sid: me },
                Err(e) => {
                    pf_error!(me; "primary-set stream failed: {}", e);
                    ServerMsg::UpdateSecondaryFailed { sid: me }
                }
            };
            if tx_ctrl.send(msg).is_err() {
                pf_error!(me; "error reporting stream result");
            }
        });

        CtrlStatus::Success
    }

    /// Handler of SWITCH_PRIMARY: refuse new writes for the recovered
    /// shard, drain in-flight ones into the replacement, then yield the
    /// interim primary role. The ack is what releases the coordinator to
    /// finish the switch.
    async fn handle_switch_primary(&self) -> CtrlStatus {
        {
            let mut role = self.shared.role.write().unwrap();
            if !role.acting_primary {
                pf_error!(self.id; "SWITCH_PRIMARY while not acting primary");
                return CtrlStatus::Failure;
            }
            if role.state != RecoveryState::Normal {
                pf_error!(self.id; "SWITCH_PRIMARY in state {:?} refused",
                                   role.state);
                return CtrlStatus::Failure;
            }
            role.state = RecoveryState::SwitchingPrimary;
        }
        pf_info!(self.id; "switching primary: draining in-flight writes");

        // wait until every admitted write has completed its forward
        loop {
            let notified = self.shared.put_drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.shared.put_inflight.load(Ordering::SeqCst) == 0 {
                break;
            }
            notified.await;
        }

        {
            let mut role = self.shared.role.write().unwrap();
            role.state = RecoveryState::Normal;
            role.acting_primary = false;
        }
        // the replacement owns the shard again; the shard's data stays in
        // our secondary set, which is exactly the normal role
        *self.shared.replacement_stub.lock().await = None;

        pf_info!(self.id; "yielded primary role for shard {}",
                          primary_of(self.id, self.shared.population));
        CtrlStatus::Success
    }

    /// Writes a command acknowledgement, retrying on a full socket buffer.
    async fn write_ack(
        write_buf: &mut BytesMut,
        write_buf_cursor: &mut usize,
        conn_write: &OwnedWriteHalf,
        ack: &CtrlAck,
    ) -> Result<(), ShardKvError> {
        let mut sent =
            safe_tcp_write(write_buf, write_buf_cursor, conn_write, Some(ack))?;
        while !sent {
            conn_write.writable().await?;
            sent = safe_tcp_write::<CtrlAck, _>(
                write_buf,
                write_buf_cursor,
                conn_write,
                None,
            )?;
        }
        Ok(())
    }

    /// Undoes a streaming-state entry after a failed setup step.
    async fn rollback_streaming(&self, was_secondary: bool) {
        {
            let mut role = self.shared.role.write().unwrap();
            role.state = RecoveryState::Normal;
            if !was_secondary {
                role.acting_primary = false;
            }
        }
        if !was_secondary {
            *self.shared.replacement_stub.lock().await = None;
        }
    }

    /// Resolves and connects a peer stub.
    async fn connect_stub(
        &self,
        host: &str,
        port: u16,
    ) -> Result<(PeerStub, SocketAddr), ShardKvError> {
        let addr = resolve_addr(host, port).await?;
        pf_debug!(self.id; "connecting peer stub to '{}'...", addr);
        let stub = PeerStub::connect(addr, 10).await?;
        Ok((stub, addr))
    }

    /// My server ID.
    pub fn id(&self) -> ServerId {
        self.id
    }

    /// The ID of the shard whose secondary copy this server keeps.
    pub fn predecessor(&self) -> ServerId {
        primary_of(self.id, self.shared.population)
    }

    /// The ID of the shard keeping the secondary copy of this server's
    /// primary set.
    pub fn successor(&self) -> ServerId {
        secondary_of(self.id, self.shared.population)
    }
}
