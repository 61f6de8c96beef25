//! Prefix-tagged logging macros.
//!
//! Every log line in the system names who is speaking: a server ID, `"m"`
//! for the coordinator, `"c"` for a client. The prefix comes first and is
//! separated from the format string by a semicolon:
//!
//! ```text
//! pf_warn!(me; "lost link to peer {}", peer);
//! ```
//!
//! `logged_err!` logs at error level and evaluates to an `Err` carrying the
//! same rendered message, for paths that both report and bail out.

/// Log a TRACE-level message under the given prefix.
#[macro_export]
macro_rules! pf_trace {
    ($who:expr; $fmt:literal $(, $arg:expr)* $(,)?) => {
        log::trace!(concat!("[{}] ", $fmt), $who $(, $arg)*)
    };
}

/// Log a DEBUG-level message under the given prefix.
#[macro_export]
macro_rules! pf_debug {
    ($who:expr; $fmt:literal $(, $arg:expr)* $(,)?) => {
        log::debug!(concat!("[{}] ", $fmt), $who $(, $arg)*)
    };
}

/// Log an INFO-level message under the given prefix.
#[macro_export]
macro_rules! pf_info {
    ($who:expr; $fmt:literal $(, $arg:expr)* $(,)?) => {
        log::info!(concat!("[{}] ", $fmt), $who $(, $arg)*)
    };
}

/// Log a WARN-level message under the given prefix.
#[macro_export]
macro_rules! pf_warn {
    ($who:expr; $fmt:literal $(, $arg:expr)* $(,)?) => {
        log::warn!(concat!("[{}] ", $fmt), $who $(, $arg)*)
    };
}

/// Log an ERROR-level message under the given prefix.
#[macro_export]
macro_rules! pf_error {
    ($who:expr; $fmt:literal $(, $arg:expr)* $(,)?) => {
        log::error!(concat!("[{}] ", $fmt), $who $(, $arg)*)
    };
}

/// Log at ERROR level and produce an `Err(ShardKvError)` holding the same
/// message, prefix included. `ShardKvError` must be in scope at the call
/// site.
#[macro_export]
macro_rules! logged_err {
    ($who:expr; $fmt:literal $(, $arg:expr)* $(,)?) => {{
        pf_error!($who; $fmt $(, $arg)*);
        Err(ShardKvError(format!(
            concat!("[{}] ", $fmt),
            $who $(, $arg)*
        )))
    }};
}

#[cfg(test)]
mod print_tests {
    use crate::utils::ShardKvError;

    #[test]
    fn logged_err_no_args() {
        assert_eq!(
            logged_err!(3; "stream refused"),
            Err::<(), ShardKvError>(ShardKvError("[3] stream refused".into()))
        );
        assert_eq!(
            logged_err!("m"; "stream refused"),
            Err::<(), ShardKvError>(ShardKvError(
                "[m] stream refused".into()
            ))
        );
    }

    #[test]
    fn logged_err_with_args() {
        assert_eq!(
            logged_err!(0; "server {} failed {}", 2, "SET_SECONDARY"),
            Err::<(), ShardKvError>(ShardKvError(
                "[0] server 2 failed SET_SECONDARY".into()
            ))
        );
    }

    #[test]
    fn logged_err_trailing_comma() {
        assert_eq!(
            logged_err!("c"; "retry {} of {}", 1, 5,),
            Err::<(), ShardKvError>(ShardKvError("[c] retry 1 of 5".into()))
        );
    }
}
