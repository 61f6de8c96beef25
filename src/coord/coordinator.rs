//! The cluster coordinator engine.
//!
//! Single point of authority for the cluster: spawns servers, answers client
//! locate requests from its in-memory server table, detects crashed servers
//! through heartbeat timeouts, and drives the recovery protocol that
//! rebuilds a replacement's two key sets from the surviving replicas before
//! atomically switching ownership back.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Instant;

use serde::Deserialize;
use tokio::process::Child;
use tokio::sync::watch;
use tokio::time::{self, Duration, MissedTickBehavior};

use super::config::{ClusterConfig, ServerEntry};
use super::ctrl::{CtrlEvent, ServerCtrlHub};
use super::locator::LocateService;
use super::spawner::{reap_with_grace, ServerSpawner};
use crate::protocol::{
    key_owner, primary_of, secondary_of, CtrlCmd, CtrlCmdKind, CtrlStatus,
    Key, LocateResponse, ServerId, ServerMsg,
};
use crate::utils::{resolve_addr, ShardKvError};

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct CoordConfig {
    /// Failure detector tick interval in millisecs.
    pub tick_interval_ms: u64,

    /// Whether the coordinator launches server processes itself. Disable to
    /// run against externally started servers (testing, manual clusters);
    /// recovery then waits for a replacement to join on its own.
    pub spawn_servers: bool,

    /// Path of the server executable to spawn.
    pub server_bin: String,

    /// Working directory on remote (`user@host`) machines.
    pub remote_dir: String,

    /// Host name spawned servers use to reach back to the coordinator.
    pub advertise_host: String,

    /// Grace period for server processes to exit at shutdown, in millisecs.
    pub shutdown_grace_ms: u64,
}

impl Default for CoordConfig {
    fn default() -> Self {
        CoordConfig {
            tick_interval_ms: 1000,
            spawn_servers: true,
            server_bin: "./shardkv_server".into(),
            remote_dir: "shardkv/".into(),
            advertise_host: "localhost".into(),
            shutdown_grace_ms: 3000,
        }
    }
}

/// Logical serving status of a server slot.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum ServerStatus {
    /// Serving normally; locate requests may route here.
    Online,

    /// Declared crashed; its keyspace is served by the surviving secondary.
    Failed,

    /// A replacement process occupies the slot but is not serving yet.
    Recovering,
}

/// Per-shard recovery progress, driven by control-plane events.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum Recovery {
    /// No recovery in progress.
    Idle,

    /// Waiting for the replacement process to join the control plane.
    AwaitJoin,

    /// Waiting for the two surviving replicas to finish streaming the
    /// replacement's key sets.
    AwaitRebuild {
        primary_done: bool,
        secondary_done: bool,
    },

    /// SWITCH_PRIMARY sent to the surviving secondary; waiting for it to
    /// drain and yield.
    AwaitSwitchAck,

    /// SET_SECONDARY sent to the replacement; waiting for its forwarding
    /// link before going back online.
    AwaitLinkAck,
}

/// Coordinator's view of one server slot. Neighbor relationships are never
/// stored; they are always recomputed from the placement functions.
struct ServerSlot {
    /// Host and ports from the cluster configuration.
    entry: ServerEntry,

    /// Logical serving status.
    status: ServerStatus,

    /// Timestamp of the last heartbeat received.
    last_heartbeat: Option<Instant>,

    /// True while the shard's switch is in progress; locate requests that
    /// route here are dropped until the swap is finalized.
    quiesced: bool,

    /// Recovery progress for this slot.
    recovery: Recovery,

    /// Child process handle when spawned by us.
    child: Option<Child>,
}

/// The cluster coordinator engine.
pub struct Coordinator {
    /// Total number of servers in the cluster.
    population: u8,

    /// Heartbeat silence threshold before a server is declared failed.
    detector_timeout: Duration,

    /// Configuration parameters struct.
    config: CoordConfig,

    /// Per-server slots, indexed by server ID.
    slots: Vec<ServerSlot>,

    /// Server-facing control hub.
    hub: ServerCtrlHub,

    /// Client-facing locate service.
    locator: LocateService,

    /// Server process spawner, if spawning is enabled.
    spawner: Option<ServerSpawner>,
}

impl Coordinator {
    /// Creates the coordinator, spawns and initializes the whole cluster,
    /// and opens the client-facing locate service. Returns only when every
    /// server is online or with an error that should fail startup.
    pub async fn new_and_setup(
        srv_addr: SocketAddr,
        cli_addr: SocketAddr,
        cluster: ClusterConfig,
        detector_timeout: Duration,
        config_str: Option<&str>,
    ) -> Result<Self, ShardKvError> {
        let config = parsed_config!(config_str => CoordConfig;
                                    tick_interval_ms, spawn_servers,
                                    server_bin, remote_dir, advertise_host,
                                    shutdown_grace_ms)?;
        if config.tick_interval_ms < 10 {
            return logged_err!(
                "m";
                "invalid config.tick_interval_ms '{}'",
                config.tick_interval_ms
            );
        }
        if detector_timeout < Duration::from_millis(10) {
            return logged_err!("m"; "invalid detector timeout {:?}",
                                    detector_timeout);
        }

        let population = cluster.population();
        let hub = ServerCtrlHub::new_and_setup(srv_addr).await?;
        let locator = LocateService::new_and_setup(cli_addr).await?;

        let spawner = if config.spawn_servers {
            Some(ServerSpawner::new(
                config.advertise_host.clone(),
                srv_addr.port(),
                population,
                config.server_bin.clone(),
                config.remote_dir.clone(),
            ))
        } else {
            None
        };

        let slots = cluster
            .servers
            .into_iter()
            .map(|entry| ServerSlot {
                entry,
                status: ServerStatus::Recovering,
                last_heartbeat: None,
                quiesced: false,
                recovery: Recovery::Idle,
                child: None,
            })
            .collect();

        let mut coordinator = Coordinator {
            population,
            detector_timeout,
            config,
            slots,
            hub,
            locator,
            spawner,
        };
        coordinator.startup().await?;
        Ok(coordinator)
    }

    /// Startup sequencing: spawn every server, wait for all of them to
    /// join, open command links, and point each at its secondary replica.
    async fn startup(&mut self) -> Result<(), ShardKvError> {
        if self.spawner.is_some() {
            for sid in 0..self.population {
                let entry = self.slots[sid as usize].entry.clone();
                let child =
                    self.spawner.as_ref().unwrap().spawn(sid, &entry)?;
                self.slots[sid as usize].child = Some(child);
            }
        }

        // wait until every server has joined, opening its command link as
        // it does
        let mut joined: HashSet<ServerId> = HashSet::new();
        while joined.len() < self.population as usize {
            match self.hub.recv_event().await? {
                CtrlEvent::Msg {
                    sid,
                    msg: ServerMsg::Join { .. },
                } => {
                    if sid >= self.population {
                        return logged_err!("m"; "join from invalid server \
                                                 ID {}", sid);
                    }
                    if !joined.insert(sid) {
                        return logged_err!("m"; "duplicate join from \
                                                 server {}", sid);
                    }
                    let ctrl_addr = self.ctrl_addr_of(sid).await?;
                    self.hub.open_cmd_link(sid, ctrl_addr).await?;
                    self.slots[sid as usize].last_heartbeat =
                        Some(Instant::now());
                }
                CtrlEvent::Msg {
                    sid,
                    msg: ServerMsg::Heartbeat { .. },
                } => {
                    self.handle_heartbeat(sid);
                }
                event => {
                    pf_warn!("m"; "unexpected event during startup: {:?}",
                                  event);
                }
            }
        }

        // let each server know the location of its secondary replica
        for sid in 0..self.population {
            let (host, port) =
                self.peer_target(secondary_of(sid, self.population));
            self.hub.send_cmd(CtrlCmd::SetSecondary { host, port }, sid)?;
        }
        let mut acked: HashSet<ServerId> = HashSet::new();
        while acked.len() < self.population as usize {
            match self.hub.recv_event().await? {
                CtrlEvent::Ack {
                    sid,
                    cmd: CtrlCmdKind::SetSecondary,
                    status,
                } => {
                    if status != CtrlStatus::Success {
                        return logged_err!("m"; "server {} failed \
                                                 SET_SECONDARY", sid);
                    }
                    acked.insert(sid);
                }
                CtrlEvent::Msg {
                    sid,
                    msg: ServerMsg::Heartbeat { .. },
                } => {
                    self.handle_heartbeat(sid);
                }
                event => {
                    pf_warn!("m"; "unexpected event during startup: {:?}",
                                  event);
                }
            }
        }

        for slot in self.slots.iter_mut() {
            slot.status = ServerStatus::Online;
        }
        pf_info!("m"; "coordinator initialized: population {}",
                      self.population);
        Ok(())
    }

    /// Main event loop of the coordinator. Returns upon a termination
    /// signal after gracefully shutting the cluster down.
    pub async fn run(
        &mut self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), ShardKvError> {
        let mut ticker = time::interval(Duration::from_millis(
            self.config.tick_interval_ms,
        ));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                // control-plane event from a server link
                event = self.hub.recv_event() => {
                    match event {
                        Ok(event) => {
                            if let Err(e) = self.handle_event(event).await {
                                pf_error!("m"; "error handling event: {}", e);
                            }
                        }
                        Err(e) => {
                            pf_error!("m"; "error receiving event: {}", e);
                        }
                    }
                },

                // client locate request
                req = self.locator.recv_req() => {
                    match req {
                        Ok((key, tx_resp)) => {
                            // servant may already be gone; that is fine
                            let _ = tx_resp.send(self.route_key(&key));
                        }
                        Err(e) => {
                            pf_error!("m"; "error receiving locate req: {}",
                                           e);
                        }
                    }
                },

                // failure detector tick
                _ = ticker.tick() => {
                    // absorb already-pending events first so queued
                    // heartbeats are never read as silence
                    while let Some(event) = self.hub.try_recv_event() {
                        if let Err(e) = self.handle_event(event).await {
                            pf_error!("m"; "error handling event: {}", e);
                        }
                    }
                    self.check_heartbeats();
                },

                // receiving termination signal
                _ = rx_term.changed() => {
                    pf_warn!("m"; "coordinator caught termination signal");
                    self.shutdown().await;
                    return Ok(());
                }
            }
        }
    }

    /// Synthesized handler of control-plane events.
    async fn handle_event(
        &mut self,
        event: CtrlEvent,
    ) -> Result<(), ShardKvError> {
        match event {
            CtrlEvent::Msg { sid, msg } => {
                if sid >= self.population {
                    return logged_err!("m"; "message from unknown server \
                                             ID {}", sid);
                }
                self.handle_server_msg(sid, msg).await
            }
            CtrlEvent::Ack { sid, cmd, status } => {
                if sid >= self.population {
                    return logged_err!("m"; "ack from unknown server ID {}",
                                            sid);
                }
                self.handle_cmd_ack(sid, cmd, status)
            }
        }
    }

    /// Synthesized handler of server-initiated control messages.
    async fn handle_server_msg(
        &mut self,
        sid: ServerId,
        msg: ServerMsg,
    ) -> Result<(), ShardKvError> {
        match msg {
            ServerMsg::Join { .. } => self.handle_rejoin(sid).await,

            ServerMsg::Heartbeat { .. } => {
                self.handle_heartbeat(sid);
                Ok(())
            }

            ServerMsg::UpdatedPrimary { .. } => {
                let shard = primary_of(sid, self.population);
                self.handle_rebuild_done(shard, sid, true)
            }

            ServerMsg::UpdatePrimaryFailed { .. } => {
                let shard = primary_of(sid, self.population);
                self.abort_recovery(
                    shard,
                    "surviving secondary failed to rebuild the primary set",
                );
                Ok(())
            }

            ServerMsg::UpdatedSecondary { .. } => {
                let shard = secondary_of(sid, self.population);
                self.handle_rebuild_done(shard, sid, false)
            }

            ServerMsg::UpdateSecondaryFailed { .. } => {
                let shard = secondary_of(sid, self.population);
                self.abort_recovery(
                    shard,
                    "surviving primary failed to rebuild the secondary set",
                );
                Ok(())
            }
        }
    }

    /// Handler of heartbeat beacons.
    fn handle_heartbeat(&mut self, sid: ServerId) {
        let slot = &mut self.slots[sid as usize];
        // crash-stop model: a declared-failed process never comes back
        if slot.status != ServerStatus::Failed {
            slot.last_heartbeat = Some(Instant::now());
            pf_trace!("m"; "heartbeat from server {}", sid);
        }
    }

    /// Handler of a replacement server joining its failed slot.
    async fn handle_rejoin(
        &mut self,
        sid: ServerId,
    ) -> Result<(), ShardKvError> {
        if self.slots[sid as usize].recovery != Recovery::AwaitJoin {
            pf_warn!("m"; "unexpected join from server {}", sid);
            return Ok(());
        }
        pf_info!("m"; "replacement for server {} joined", sid);

        let ctrl_addr = self.ctrl_addr_of(sid).await?;
        if let Err(e) = self.hub.open_cmd_link(sid, ctrl_addr).await {
            self.abort_recovery(sid, "cannot reach the replacement");
            return Err(e);
        }
        {
            let slot = &mut self.slots[sid as usize];
            slot.status = ServerStatus::Recovering;
            slot.last_heartbeat = Some(Instant::now());
            slot.recovery = Recovery::AwaitRebuild {
                primary_done: false,
                secondary_done: false,
            };
        }

        let (host, port) = self.peer_target(sid);

        // the surviving secondary streams the failed shard's primary set
        // back into the replacement and acts as interim primary meanwhile
        let b = secondary_of(sid, self.population);
        self.hub.send_cmd(
            CtrlCmd::UpdatePrimary {
                host: host.clone(),
                port,
            },
            b,
        )?;

        // the surviving primary streams its primary set over to repopulate
        // the replacement's secondary set
        let c = primary_of(sid, self.population);
        self.hub
            .send_cmd(CtrlCmd::UpdateSecondary { host, port }, c)?;

        Ok(())
    }

    /// Handler of an UPDATED_PRIMARY / UPDATED_SECONDARY completion for the
    /// recovering shard; order of the two is unspecified.
    fn handle_rebuild_done(
        &mut self,
        shard: ServerId,
        from: ServerId,
        was_primary: bool,
    ) -> Result<(), ShardKvError> {
        let recorded = match &mut self.slots[shard as usize].recovery {
            Recovery::AwaitRebuild {
                primary_done,
                secondary_done,
            } => {
                if was_primary {
                    *primary_done = true;
                } else {
                    *secondary_done = true;
                }
                true
            }
            _ => false,
        };
        if !recorded {
            pf_warn!("m"; "stray rebuild completion from server {}", from);
            return Ok(());
        }

        pf_info!("m"; "server {} rebuilt the {} set of server {}",
                      from,
                      if was_primary { "primary" } else { "secondary" },
                      shard);
        self.maybe_begin_switch(shard)
    }

    /// Once both key sets are rebuilt, quiesce the shard and tell the
    /// interim primary to flush and yield.
    fn maybe_begin_switch(
        &mut self,
        shard: ServerId,
    ) -> Result<(), ShardKvError> {
        if self.slots[shard as usize].recovery
            != (Recovery::AwaitRebuild {
                primary_done: true,
                secondary_done: true,
            })
        {
            return Ok(());
        }

        let b = secondary_of(shard, self.population);
        // halt routing for the affected keyspace until the swap is final
        self.slots[shard as usize].quiesced = true;
        self.slots[b as usize].quiesced = true;
        self.slots[shard as usize].recovery = Recovery::AwaitSwitchAck;

        pf_info!("m"; "both key sets of server {} rebuilt, switching \
                       primary", shard);
        self.hub.send_cmd(CtrlCmd::SwitchPrimary, b)
    }

    /// Synthesized handler of command acknowledgements.
    fn handle_cmd_ack(
        &mut self,
        sid: ServerId,
        cmd: CtrlCmdKind,
        status: CtrlStatus,
    ) -> Result<(), ShardKvError> {
        match cmd {
            CtrlCmdKind::UpdatePrimary => {
                if status != CtrlStatus::Success {
                    let shard = primary_of(sid, self.population);
                    self.abort_recovery(shard, "UPDATE_PRIMARY refused");
                }
                Ok(())
            }

            CtrlCmdKind::UpdateSecondary => {
                if status != CtrlStatus::Success {
                    let shard = secondary_of(sid, self.population);
                    self.abort_recovery(shard, "UPDATE_SECONDARY refused");
                }
                Ok(())
            }

            CtrlCmdKind::SwitchPrimary => {
                let shard = primary_of(sid, self.population);
                if self.slots[shard as usize].recovery
                    != Recovery::AwaitSwitchAck
                {
                    pf_warn!("m"; "stray SWITCH_PRIMARY ack from {}", sid);
                    return Ok(());
                }
                if status != CtrlStatus::Success {
                    self.abort_recovery(shard, "SWITCH_PRIMARY failed");
                    return Ok(());
                }
                // the interim primary has yielded; point the replacement at
                // its secondary replica to complete the ring
                let (host, port) = self.peer_target(sid);
                self.slots[shard as usize].recovery = Recovery::AwaitLinkAck;
                self.hub
                    .send_cmd(CtrlCmd::SetSecondary { host, port }, shard)
            }

            CtrlCmdKind::SetSecondary => {
                if self.slots[sid as usize].recovery != Recovery::AwaitLinkAck
                {
                    // startup-time acks are consumed in `startup()`
                    pf_warn!("m"; "stray SET_SECONDARY ack from {}", sid);
                    return Ok(());
                }
                if status != CtrlStatus::Success {
                    self.abort_recovery(sid, "replacement failed \
                                              SET_SECONDARY");
                    return Ok(());
                }
                self.finish_recovery(sid);
                Ok(())
            }

            CtrlCmdKind::Shutdown => Ok(()),
        }
    }

    /// Failure detector scan, once per tick.
    fn check_heartbeats(&mut self) {
        let mut failed: Vec<ServerId> = vec![];
        for (idx, slot) in self.slots.iter().enumerate() {
            if slot.status == ServerStatus::Online {
                if let Some(last) = slot.last_heartbeat {
                    if last.elapsed() > self.detector_timeout {
                        failed.push(idx as ServerId);
                    }
                }
            }
        }
        for sid in failed {
            self.begin_recovery(sid);
        }
    }

    /// Declares a server failed and spawns its replacement. Clients asking
    /// for the failed keyspace are redirected to the surviving secondary by
    /// `route_key` from this point on.
    fn begin_recovery(&mut self, sid: ServerId) {
        pf_warn!("m"; "server {} heartbeat check failed, starting recovery",
                      sid);
        {
            let slot = &mut self.slots[sid as usize];
            slot.status = ServerStatus::Failed;
            slot.last_heartbeat = None;
            slot.quiesced = false;
            slot.recovery = Recovery::AwaitJoin;
            slot.child = None; // dropping the old handle reaps any stray
        }

        let entry = self.slots[sid as usize].entry.clone();
        let spawned = self.spawner.as_ref().map(|sp| sp.spawn(sid, &entry));
        match spawned {
            Some(Ok(child)) => {
                let slot = &mut self.slots[sid as usize];
                slot.child = Some(child);
                slot.status = ServerStatus::Recovering;
            }
            Some(Err(e)) => {
                // slot stays failed; an externally started replacement may
                // still join later
                pf_error!("m"; "error spawning replacement for {}: {}",
                               sid, e);
            }
            None => {} // spawning disabled; wait for an external join
        }
    }

    /// Recovery completed; the shard is served by its replacement again.
    fn finish_recovery(&mut self, shard: ServerId) {
        let b = secondary_of(shard, self.population);
        {
            let slot = &mut self.slots[shard as usize];
            slot.status = ServerStatus::Online;
            slot.recovery = Recovery::Idle;
            slot.quiesced = false;
        }
        self.slots[b as usize].quiesced = false;
        pf_info!("m"; "recovery of server {} complete, back online", shard);
    }

    /// Aborts a shard's recovery: the surviving secondary keeps serving the
    /// keyspace indefinitely and the slot stays failed.
    fn abort_recovery(&mut self, shard: ServerId, reason: &str) {
        pf_error!("m"; "recovery of server {} aborted: {}", shard, reason);
        let b = secondary_of(shard, self.population);
        {
            let slot = &mut self.slots[shard as usize];
            slot.status = ServerStatus::Failed;
            slot.recovery = Recovery::Idle;
            slot.quiesced = false;
            slot.last_heartbeat = None;
        }
        self.slots[b as usize].quiesced = false;
    }

    /// Routing decision for a locate request.
    fn route_key(&self, key: &Key) -> Option<LocateResponse> {
        route(&self.slots, self.population, key)
    }

    /// Graceful shutdown: SHUTDOWN to every reachable server, then reap
    /// spawned children within the grace period.
    async fn shutdown(&mut self) {
        pf_info!("m"; "shutting down the cluster");

        let mut pending: HashSet<ServerId> = HashSet::new();
        for sid in 0..self.population {
            if self.hub.send_cmd(CtrlCmd::Shutdown, sid).is_ok() {
                pending.insert(sid);
            }
        }

        // wait briefly for shutdown acks so the commands actually flush
        let grace = Duration::from_millis(self.config.shutdown_grace_ms);
        let deadline = time::sleep(grace);
        tokio::pin!(deadline);
        while !pending.is_empty() {
            tokio::select! {
                event = self.hub.recv_event() => {
                    match event {
                        Ok(CtrlEvent::Ack {
                            sid,
                            cmd: CtrlCmdKind::Shutdown,
                            ..
                        }) => {
                            pending.remove(&sid);
                        }
                        Ok(_) => {}
                        Err(_) => break,
                    }
                },
                _ = &mut deadline => {
                    pf_warn!("m"; "servers {:?} did not ack shutdown",
                                  pending);
                    break;
                }
            }
        }

        for (idx, slot) in self.slots.iter_mut().enumerate() {
            if let Some(child) = slot.child.as_mut() {
                reap_with_grace(idx as ServerId, child, grace).await;
            }
        }
        pf_info!("m"; "cluster shut down");
    }

    /// Resolved control-port address of a server slot.
    async fn ctrl_addr_of(
        &self,
        sid: ServerId,
    ) -> Result<SocketAddr, ShardKvError> {
        let entry = &self.slots[sid as usize].entry;
        resolve_addr(entry.bare_host(), entry.ctrl_port).await
    }

    /// A server slot's peer address as `(host, port)` for control commands.
    fn peer_target(&self, sid: ServerId) -> (String, u16) {
        let entry = &self.slots[sid as usize].entry;
        (entry.bare_host().to_string(), entry.peer_port)
    }
}

/// Pure routing rule: the owner if online, else its surviving secondary;
/// nothing while the routed target is quiesced or not serving.
fn route(
    slots: &[ServerSlot],
    population: u8,
    key: &Key,
) -> Option<LocateResponse> {
    let owner = key_owner(key, population);
    let target = if slots[owner as usize].status == ServerStatus::Online {
        owner
    } else {
        secondary_of(owner, population)
    };

    let slot = &slots[target as usize];
    if slot.quiesced || slot.status != ServerStatus::Online {
        return None;
    }
    Some(LocateResponse {
        host: slot.entry.bare_host().to_string(),
        port: slot.entry.client_port,
    })
}
