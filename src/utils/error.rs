//! Customized unified error type.

use std::fmt;
use std::io;
use std::net;
use std::num;

/// Customized error type for shardkv.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ShardKvError(pub String);

impl ShardKvError {
    /// Constructs an error out of anything that can render itself as a
    /// string, e.g. a channel send error whose payload type we do not care
    /// to name.
    pub fn msg(m: impl ToString) -> Self {
        ShardKvError(m.to_string())
    }
}

impl fmt::Display for ShardKvError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

impl std::error::Error for ShardKvError {}

// Helper macro for saving boiler-plate `impl From<T>`s for transparent
// conversion from various common error types to `ShardKvError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for ShardKvError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                ShardKvError(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(net::AddrParseError);
impl_from_error!(num::ParseIntError);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(ctrlc::Error);
impl_from_error!(tokio::sync::oneshot::error::RecvError);
impl_from_error!(tokio::sync::watch::error::SendError<bool>);
impl_from_error!(tokio::time::error::Elapsed);

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = ShardKvError("what happened here?".into());
        assert_eq!(format!("{}", e), String::from("what happened here?"));
    }

    #[test]
    fn from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "oh no!");
        let e = ShardKvError::from(io_error);
        assert!(e.0.contains("oh no!"));
    }

    #[test]
    fn from_msg() {
        let e = ShardKvError::msg(42);
        assert_eq!(e, ShardKvError("42".into()));
    }
}
