use crate::error::Error;
use crate::frame::{
    tpkt::{Tpkt, MIN_FRAME_LEN, TPKT_HEADER_LEN, TPKT_SYNC},
    Cotp, WireDecode, WireEncode,
};
use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// One framed unit on the wire: a COTP TPDU plus its user payload (one S7
/// PDU for Data TPDUs, empty otherwise).
#[derive(Debug, Clone)]
pub struct IsoFrame {
    pub cotp: Cotp,
    pub payload: Bytes,
}

impl IsoFrame {
    pub fn control(cotp: Cotp) -> Self {
        Self {
            cotp,
            payload: Bytes::new(),
        }
    }

    /// Wrap one S7 PDU into a COTP Data TPDU.
    pub fn data(payload: Bytes) -> Self {
        Self {
            cotp: Cotp::data(),
            payload,
        }
    }
}

/// TPKT + COTP framing codec. Decoding waits for whole frames and retains
/// the tail, so concatenated frames split at any byte boundary decode to the
/// same sequence of payloads.
#[derive(Debug, Default, Clone)]
pub struct IsoCodec;

impl Decoder for IsoCodec {
    type Item = IsoFrame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < TPKT_HEADER_LEN {
            return Ok(None);
        }
        if src[..2] != TPKT_SYNC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "TPKT sync mismatch",
            ));
        }
        let length = u16::from_be_bytes([src[2], src[3]]) as usize;
        if length < MIN_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "TPKT length below minimum frame",
            ));
        }
        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }

        let frame = src.split_to(length).freeze();
        let (rest, cotp) = Cotp::parse(&frame[TPKT_HEADER_LEN..], &frame, &())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("cotp: {e}")))?;
        let payload = if rest.is_empty() {
            Bytes::new()
        } else {
            Bytes::slice_ref(&frame, rest)
        };
        Ok(Some(IsoFrame { cotp, payload }))
    }
}

impl Encoder<IsoFrame> for IsoCodec {
    type Error = io::Error;

    fn encode(&mut self, item: IsoFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let cotp_len = item.cotp.encoded_len(&());
        let total_len = TPKT_HEADER_LEN + cotp_len + item.payload.len();
        dst.reserve(total_len);
        Tpkt::encode_header_to(total_len, dst);
        item.cotp
            .encode_to(dst, &())
            .map_err(|e: Error| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        if !item.payload.is_empty() {
            dst.put_slice(&item.payload);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_frame(payload: &[u8]) -> BytesMut {
        let mut codec = IsoCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(
                IsoFrame::data(Bytes::copy_from_slice(payload)),
                &mut buf,
            )
            .unwrap();
        buf
    }

    #[test]
    fn split_anywhere_decoding_is_idempotent() {
        let a = encode_frame(&[0x32, 0x01, 0, 0, 0, 1, 0, 0, 0, 0]);
        let b = encode_frame(&[0x32, 0x03, 0, 0, 0, 2, 0, 0, 0, 0, 0, 0]);
        let mut joined = BytesMut::new();
        joined.extend_from_slice(&a);
        joined.extend_from_slice(&b);

        for split_at in 0..=joined.len() {
            let mut codec = IsoCodec;
            let mut buf = BytesMut::new();
            let mut frames = Vec::new();
            for chunk in [&joined[..split_at], &joined[split_at..]] {
                buf.extend_from_slice(chunk);
                while let Some(frame) = codec.decode(&mut buf).unwrap() {
                    frames.push(frame);
                }
            }
            assert_eq!(frames.len(), 2, "split at {split_at}");
            assert_eq!(frames[0].payload[..], a[7..], "split at {split_at}");
            assert_eq!(frames[1].payload[..], b[7..], "split at {split_at}");
        }
    }

    #[test]
    fn rejects_bad_sync_bytes() {
        let mut codec = IsoCodec;
        let mut buf = BytesMut::from(&[0x04u8, 0x00, 0x00, 0x09][..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn rejects_short_total_length() {
        let mut codec = IsoCodec;
        let mut buf = BytesMut::from(&[0x03u8, 0x00, 0x00, 0x05, 0x00][..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn waits_for_whole_frame() {
        let frame = encode_frame(&[1, 2, 3, 4]);
        let mut codec = IsoCodec;
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&frame[..5]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&frame[5..]);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&decoded.payload[..], &[1, 2, 3, 4]);
    }
}
