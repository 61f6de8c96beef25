//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod error;
mod safetcp;

pub use error::ShardKvError;

pub(crate) use safetcp::{
    recv_frame, resolve_addr, safe_tcp_read, safe_tcp_write, send_frame,
    tcp_bind_with_retry, tcp_connect_with_retry,
};
