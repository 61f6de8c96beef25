//! Cluster configuration file parsing.
//!
//! The file names every server in the cluster. First line: the number of
//! servers N (at least 3, so that the replica ring never cross-replicates a
//! pair). Then N lines of `<host> <client-port> <peer-port> <ctrl-port>`,
//! where host is either `localhost` or `user@host` (the latter makes the
//! coordinator launch that server over ssh).

use std::fs;
use std::path::Path;

use crate::utils::ShardKvError;

/// One server's row in the cluster configuration.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ServerEntry {
    /// `localhost` or `user@host`.
    pub host: String,

    /// Port for client operations.
    pub client_port: u16,

    /// Port for peer connections.
    pub peer_port: u16,

    /// Port for the coordinator's command connection.
    pub ctrl_port: u16,
}

impl ServerEntry {
    /// Host portion without any `user@` prefix; what peers and clients
    /// actually connect to.
    pub fn bare_host(&self) -> &str {
        match self.host.split_once('@') {
            Some((_user, host)) => host,
            None => &self.host,
        }
    }

    /// Whether this server is launched through a remote shell.
    pub fn is_remote(&self) -> bool {
        self.host.contains('@')
    }
}

/// Parsed cluster configuration.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ClusterConfig {
    /// Per-server entries, indexed by server ID.
    pub servers: Vec<ServerEntry>,
}

impl ClusterConfig {
    /// Reads and parses the configuration file at `path`.
    pub fn from_file(path: &Path) -> Result<Self, ShardKvError> {
        let text = fs::read_to_string(path).map_err(|e| {
            ShardKvError(format!("cannot read config file: {}", e))
        })?;
        Self::parse(&text)
    }

    /// Parses configuration file contents.
    pub fn parse(text: &str) -> Result<Self, ShardKvError> {
        let mut lines = text.lines();

        let num_servers: usize = lines
            .next()
            .ok_or_else(|| ShardKvError::msg("config file is empty"))?
            .trim()
            .parse()
            .map_err(|e| {
                ShardKvError(format!("invalid number of servers: {}", e))
            })?;
        if num_servers < 3 {
            return Err(ShardKvError(format!(
                "invalid number of servers: {} (need at least 3 to avoid \
                 cross-replication)",
                num_servers
            )));
        }
        if num_servers > u8::MAX as usize {
            return Err(ShardKvError(format!(
                "invalid number of servers: {} (at most {})",
                num_servers,
                u8::MAX
            )));
        }

        let mut servers = Vec::with_capacity(num_servers);
        for idx in 0..num_servers {
            let line = lines.next().ok_or_else(|| {
                ShardKvError(format!(
                    "config file ends early at server {}",
                    idx
                ))
            })?;
            servers.push(Self::parse_entry(idx, line)?);
        }

        Ok(ClusterConfig { servers })
    }

    // Parses one `<host> <client-port> <peer-port> <ctrl-port>` row.
    fn parse_entry(idx: usize, line: &str) -> Result<ServerEntry, ShardKvError> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 4 {
            return Err(ShardKvError(format!(
                "server {} row has {} fields, expected 4",
                idx,
                fields.len()
            )));
        }

        let host = fields[0].to_string();
        if host != "localhost" && !host.contains('@') {
            return Err(ShardKvError(format!(
                "server {} host '{}' must be 'localhost' or 'user@host'",
                idx, host
            )));
        }

        let mut ports = [0u16; 3];
        for (slot, field) in ports.iter_mut().zip(&fields[1..]) {
            *slot = field.parse().map_err(|e| {
                ShardKvError(format!("server {} port '{}': {}", idx, field, e))
            })?;
            if *slot == 0 {
                return Err(ShardKvError(format!(
                    "server {} has a zero port number",
                    idx
                )));
            }
        }

        Ok(ServerEntry {
            host,
            client_port: ports[0],
            peer_port: ports[1],
            ctrl_port: ports[2],
        })
    }

    /// Number of servers as the wire-level population type.
    pub fn population(&self) -> u8 {
        self.servers.len() as u8
    }
}

#[cfg(test)]
mod config_tests {
    use super::*;

    #[test]
    fn parse_valid() -> Result<(), ShardKvError> {
        let config = ClusterConfig::parse(
            "3\n\
             localhost 5000 5001 5002\n\
             localhost 5010 5011 5012\n\
             ops@kv2.cluster 5020 5021 5022\n",
        )?;
        assert_eq!(config.population(), 3);
        assert_eq!(config.servers[0].client_port, 5000);
        assert!(!config.servers[0].is_remote());
        assert!(config.servers[2].is_remote());
        assert_eq!(config.servers[2].bare_host(), "kv2.cluster");
        Ok(())
    }

    #[test]
    fn reject_two_servers() {
        let result = ClusterConfig::parse(
            "2\n\
             localhost 5000 5001 5002\n\
             localhost 5010 5011 5012\n",
        );
        assert!(result.is_err());
    }

    #[test]
    fn reject_bad_count() {
        assert!(ClusterConfig::parse("three\n").is_err());
        assert!(ClusterConfig::parse("").is_err());
    }

    #[test]
    fn reject_truncated_file() {
        let result = ClusterConfig::parse(
            "3\n\
             localhost 5000 5001 5002\n\
             localhost 5010 5011 5012\n",
        );
        assert!(result.is_err());
    }

    #[test]
    fn reject_zero_port() {
        let result = ClusterConfig::parse(
            "3\n\
             localhost 5000 0 5002\n\
             localhost 5010 5011 5012\n\
             localhost 5020 5021 5022\n",
        );
        assert!(result.is_err());
    }

    #[test]
    fn reject_missing_fields() {
        let result = ClusterConfig::parse(
            "3\n\
             localhost 5000 5001\n\
             localhost 5010 5011 5012\n\
             localhost 5020 5021 5022\n",
        );
        assert!(result.is_err());
    }

    #[test]
    fn reject_bad_hostname() {
        let result = ClusterConfig::parse(
            "3\n\
             kv0.cluster 5000 5001 5002\n\
             localhost 5010 5011 5012\n\
             localhost 5020 5021 5022\n",
        );
        assert!(result.is_err());
    }
}
