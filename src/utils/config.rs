//! Engine tunables: TOML-string overrides on top of `Default` values.

/// Builds a configuration struct of type `$cfg` from its `Default`, then
/// overlays whichever of the listed fields appear in the optional TOML
/// string. Names outside the list are rejected up front, so a typo in a
/// `--conf` argument fails loudly instead of being silently ignored.
/// `ShardKvError` must be in scope at the call site.
///
/// ```
/// # use shardkv::{parsed_config, ShardKvError};
/// #[derive(Debug, Default)]
/// struct Knobs {
///     retries: u64,
///     label: String,
/// }
/// let knobs =
///     parsed_config!(Some("retries = 3") => Knobs; retries, label).unwrap();
/// assert_eq!(knobs.retries, 3);
/// assert_eq!(knobs.label, "");
/// ```
#[macro_export]
macro_rules! parsed_config {
    ($toml_str:expr => $cfg:ty; $($field:ident),+ $(,)?) => {{
        // early returns want a function boundary around the macro body
        let parse = || -> Result<$cfg, ShardKvError> {
            let mut cfg = <$cfg>::default();
            let text: Option<&str> = $toml_str;
            let Some(text) = text else {
                return Ok(cfg);
            };
            let table = text.parse::<toml::Table>()?;

            // reject unknown names before touching any field
            for key in table.keys() {
                if ![$(stringify!($field)),+].contains(&key.as_str()) {
                    return Err(ShardKvError(format!(
                        "unknown config field '{}'",
                        key
                    )));
                }
            }

            $(
                if let Some(value) = table.get(stringify!($field)) {
                    cfg.$field = value.clone().try_into()?;
                }
            )+

            Ok(cfg)
        };
        parse()
    }};
}

#[cfg(test)]
mod config_tests {
    use crate::coord::CoordConfig;
    use crate::server::ServerConfig;
    use crate::utils::ShardKvError;

    #[test]
    fn server_defaults_when_absent() -> Result<(), ShardKvError> {
        let config = parsed_config!(None => ServerConfig;
                                    heartbeat_interval_ms, max_table_bytes)?;
        assert_eq!(config.heartbeat_interval_ms, 1000);
        assert_eq!(config.max_table_bytes, 0);
        Ok(())
    }

    #[test]
    fn server_partial_override() -> Result<(), ShardKvError> {
        let config_str = Some("heartbeat_interval_ms = 250");
        let config = parsed_config!(config_str => ServerConfig;
                                    heartbeat_interval_ms, max_table_bytes)?;
        assert_eq!(config.heartbeat_interval_ms, 250);
        assert_eq!(config.max_table_bytes, 0);
        Ok(())
    }

    #[test]
    fn coord_overrides_mix_with_defaults() -> Result<(), ShardKvError> {
        let config_str = Some(
            "spawn_servers = false\n\
             tick_interval_ms = 50\n\
             server_bin = 'target/debug/shardkv_server'",
        );
        let config = parsed_config!(config_str => CoordConfig;
                                    tick_interval_ms, spawn_servers,
                                    server_bin, remote_dir, advertise_host,
                                    shutdown_grace_ms)?;
        assert!(!config.spawn_servers);
        assert_eq!(config.tick_interval_ms, 50);
        assert_eq!(config.server_bin, "target/debug/shardkv_server");
        // untouched fields keep their defaults
        assert_eq!(config.advertise_host, "localhost");
        assert_eq!(config.shutdown_grace_ms, 3000);
        Ok(())
    }

    #[test]
    fn unknown_field_rejected() {
        let config_str = Some("heart_beat_ms = 10");
        assert!(parsed_config!(config_str => ServerConfig;
                               heartbeat_interval_ms, max_table_bytes)
            .is_err());
    }

    #[test]
    fn wrong_value_type_rejected() {
        let config_str = Some("max_table_bytes = 'plenty'");
        assert!(parsed_config!(config_str => ServerConfig;
                               heartbeat_interval_ms, max_table_bytes)
            .is_err());
    }

    #[test]
    fn malformed_toml_rejected() {
        let config_str = Some("tick_interval_ms = = 5");
        assert!(parsed_config!(config_str => CoordConfig;
                               tick_interval_ms, spawn_servers, server_bin,
                               remote_dir, advertise_host, shutdown_grace_ms)
            .is_err());
    }
}
