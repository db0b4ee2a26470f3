//! The dns module implements the DNS wire protocol and a TCP transport for it

pub mod buffer;
pub mod client;
pub mod context;
pub mod hosts;
pub mod name;
pub mod netutil;
pub mod pool;
pub mod protocol;
pub mod record;
pub mod server;
pub mod tcp;
