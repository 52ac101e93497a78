use super::{WireDecode, WireEncode};
use crate::error::{Error, Result};
use bytes::{BufMut, Bytes};

/// Sync octets opening every frame: protocol version 3, reserved zero.
pub const TPKT_SYNC: [u8; 2] = [0x03, 0x00];
/// Envelope size in bytes.
pub const TPKT_HEADER_LEN: usize = 4;
/// Shortest legal frame: the envelope plus a minimal COTP TPDU.
pub const MIN_FRAME_LEN: usize = 7;

/// RFC 1006 envelope around each TPDU on the TCP stream.
///
/// The length field spans the whole frame, these four octets included; a
/// receiver accumulates bytes until that many are available and keeps the
/// tail for the next frame.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Tpkt {
    pub length: u16,
}

impl Tpkt {
    /// Stamp the envelope for a frame of `total_len` bytes overall.
    pub fn encode_header_to<B: BufMut>(total_len: usize, dst: &mut B) {
        dst.put_slice(&TPKT_SYNC);
        dst.put_u16(total_len as u16);
    }
}

impl WireEncode for Tpkt {
    type Error = Error;
    type Context = ();

    fn encoded_len(&self, _ctx: &Self::Context) -> usize {
        TPKT_HEADER_LEN
    }

    fn encode_to<B: BufMut>(&self, dst: &mut B, _ctx: &Self::Context) -> Result<()> {
        Tpkt::encode_header_to(self.length as usize, dst);
        Ok(())
    }
}

impl WireDecode for Tpkt {
    type Error = Error;
    type Context = ();

    fn parse<'a>(
        input: &'a [u8],
        _parent: &Bytes,
        _ctx: &Self::Context,
    ) -> Result<(&'a [u8], Self)> {
        let Some(header) = input.get(..TPKT_HEADER_LEN) else {
            return Err(Error::InsufficientData {
                needed: TPKT_HEADER_LEN,
                available: input.len(),
            });
        };
        if header[..2] != TPKT_SYNC {
            return Err(Error::InvalidFrame);
        }
        let length = u16::from_be_bytes([header[2], header[3]]) as usize;
        if length < MIN_FRAME_LEN || length > input.len() {
            return Err(Error::InvalidFrame);
        }
        Ok((
            &input[length..],
            Tpkt {
                length: length as u16,
            },
        ))
    }
}
