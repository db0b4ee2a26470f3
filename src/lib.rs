//! DNS wire codec and TCP transport.
//!
//! The `dns` module holds everything: lazy decoding of names and record
//! sections over a shared message buffer, the message envelope, and the
//! framed TCP client and server.

pub mod dns;
