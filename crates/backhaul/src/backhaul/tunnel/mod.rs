//! Reverse tunnel: a broker exposes a TCP port on behalf of a client behind NAT.
//!
//! One control connection per client carries newline-delimited records
//! (`<tag>|<json>\n`, see [`protocol`]). Every public connection accepted by the
//! broker gets its own [`pipeline::Pipeline`] with an ephemeral rendezvous
//! listener; the client is told its address via `wire-to` and dials it back
//! with a [`wire::Wire`] bridged to the local target.

pub mod channel;
pub mod client;
pub mod lifecycle;
pub mod pipeline;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod server;
pub mod wire;
