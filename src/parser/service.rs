//! Length prefixed plist frames used by lockdownd and the services it starts
//!
//! A frame is a 4 byte big endian length followed by that many bytes of plist,
//! binary or XML. Both encodings are accepted when reading.

use pack1::U32BE;
use serde::Serialize;
use tokio::io::AsyncReadExt;

use crate::{
    AsyncReading,
    codec::{self, PlistFormat},
    error::{Error, Result},
};

/// Upper bound for a single frame, larger lengths are treated as corruption
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct FrameHeader {
    len: U32BE,
}

unsafe impl bytemuck::Zeroable for FrameHeader {}
unsafe impl bytemuck::Pod for FrameHeader {}

/// Encodes `value` as a root document with its length prefix
pub fn encode_frame<T: Serialize + ?Sized>(value: &T, format: PlistFormat) -> Result<Vec<u8>> {
    let body = codec::write_document(value, format)?;
    let header = FrameHeader {
        len: U32BE::new(
            u32::try_from(body.len())
                .map_err(|_| Error::codec("frame does not fit a u32 length"))?,
        ),
    };

    let mut frame = Vec::with_capacity(size_of::<FrameHeader>() + body.len());
    frame.extend_from_slice(bytemuck::bytes_of(&header));
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Reads one frame body, without decoding it
pub async fn read_frame_bytes(reader: &mut impl AsyncReading) -> Result<Vec<u8>> {
    let mut header_buf = [0u8; size_of::<FrameHeader>()];
    reader.read_exact(&mut header_buf).await?;

    let len = bytemuck::from_bytes::<FrameHeader>(&header_buf).len.get();
    if len > MAX_FRAME_LEN {
        return Err(Error::codec(format!(
            "frame length {len} exceeds the {MAX_FRAME_LEN} byte limit"
        )));
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(body)
}
