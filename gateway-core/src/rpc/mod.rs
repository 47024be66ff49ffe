//! Control-plane gRPC services and the outbound remote-handler caller (spec §4.8).
//!
//! Grounded on `original_source/service/proto/impl/{bind,conn,group,message,slb,
//! remotehandler}.go` — each service here is a thin tonic wrapper around the same
//! `Gateway` handle the transport engines hold.

pub mod bind;
pub mod conn;
pub mod group;
pub mod message;
pub mod remote;
pub mod slb;

use crate::codec::DataFormat;
use crate::conn::ConnContext;

/// Picks `pb_bytes` or `json_bytes` to match `ctx`'s selected codec (`Group::BroadcastGroup`,
/// `Message::SendMessage` carry both pre-serialized, spec §4.8); `None` if no codec has been
/// selected yet (the connection hasn't sent its first post-handshake packet).
fn pick_payload<'a>(ctx: &ConnContext, pb_bytes: &'a [u8], json_bytes: &'a [u8]) -> Option<&'a [u8]> {
    let codec_guard = ctx.codec.lock().unwrap();
    let codec = codec_guard.as_ref()?;
    Some(match codec.package.format() {
        DataFormat::Proto => pb_bytes,
        DataFormat::Json => json_bytes,
    })
}
