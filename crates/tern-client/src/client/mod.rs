// Engine modules: state machine, I/O loops, registries, keepalive.
pub mod connection;
pub mod ping;
pub mod reader;
pub mod requests;
pub mod subscriptions;
pub mod writer;
