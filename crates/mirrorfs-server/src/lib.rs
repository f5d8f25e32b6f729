//! mirrorfs server library
//!
//! Exports a directory tree read-only over Cap'n Proto RPC. The binary is a
//! thin wrapper; tests drive [`serve`] directly on an ephemeral port.

pub mod constants;
pub mod rpc;
pub mod server;

// Generated Cap'n Proto code
pub mod mirrorfs_capnp {
    include!(concat!(env!("OUT_DIR"), "/mirrorfs_capnp.rs"));
}

pub use rpc::MirrorFsImpl;
pub use server::{serve, serve_connection};
