//! Spawning and reaping of key-value server processes.
//!
//! Local servers (`localhost` rows) exec the server binary directly; remote
//! rows (`user@host`) run it through ssh from a fixed working directory.
//! Replacement servers during recovery go through exactly the same path.

use tokio::process::{Child, Command};
use tokio::time::{self, Duration};

use super::config::ServerEntry;
use crate::protocol::ServerId;
use crate::utils::ShardKvError;

/// Server process spawner.
pub(crate) struct ServerSpawner {
    /// Host name servers use to reach the coordinator.
    coord_host: String,

    /// The coordinator's server-facing port.
    coord_port: u16,

    /// Total number of servers in the cluster.
    population: u8,

    /// Path of the server executable.
    server_bin: String,

    /// Working directory on remote hosts.
    remote_dir: String,
}

impl ServerSpawner {
    /// Creates a new spawner.
    pub(crate) fn new(
        coord_host: String,
        coord_port: u16,
        population: u8,
        server_bin: String,
        remote_dir: String,
    ) -> Self {
        ServerSpawner {
            coord_host,
            coord_port,
            population,
            server_bin,
            remote_dir,
        }
    }

    /// Spawns the server process for slot `sid`, locally or over ssh.
    pub(crate) fn spawn(
        &self,
        sid: ServerId,
        entry: &ServerEntry,
    ) -> Result<Child, ShardKvError> {
        let mut cmd = if entry.is_remote() {
            // remote server: let ssh's remote shell do the cd && exec
            let mut cmd = Command::new("ssh");
            cmd.arg(&entry.host)
                .arg("cd")
                .arg(&self.remote_dir)
                .arg("&&")
                .arg(&self.server_bin);
            cmd
        } else {
            Command::new(&self.server_bin)
        };

        cmd.arg("--coord-host")
            .arg(&self.coord_host)
            .arg("--coord-port")
            .arg(self.coord_port.to_string())
            .arg("--client-port")
            .arg(entry.client_port.to_string())
            .arg("--peer-port")
            .arg(entry.peer_port.to_string())
            .arg("--ctrl-port")
            .arg(entry.ctrl_port.to_string())
            .arg("--id")
            .arg(sid.to_string())
            .arg("--population")
            .arg(self.population.to_string())
            .arg("--log-file")
            .arg(format!("server_{}.log", sid));

        // a dropped handle must never leave an orphan server running
        cmd.kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| {
            ShardKvError(format!(
                "error spawning server {} ('{}'): {}",
                sid, self.server_bin, e
            ))
        })?;
        pf_info!("m"; "spawned server {} on '{}'", sid, entry.host);
        Ok(child)
    }
}

/// Waits for a child to exit within the grace period; kills it otherwise.
pub(crate) async fn reap_with_grace(
    sid: ServerId,
    child: &mut Child,
    grace: Duration,
) {
    match time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            pf_debug!("m"; "server {} exited with {}", sid, status);
        }
        Ok(Err(e)) => {
            pf_warn!("m"; "error waiting for server {}: {}", sid, e);
        }
        Err(_) => {
            pf_warn!("m"; "server {} did not exit in time, killing", sid);
            let _ = child.kill().await;
        }
    }
}
