//! Generated `tonic`/`prost` types for the gateway's control-plane RPC surface and the
//! outbound remote-handler contract (spec §4.8, §4.5).

pub mod v1 {
    tonic::include_proto!("gateway.v1");
}

pub use v1::*;
