use super::{types::PduType, WireDecode, WireEncode};
use crate::error::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};

pub const PROTOCOL_ID: u8 = 0x32;

/// Job header length (no error bytes)
pub const JOB_HEADER_LEN: usize = 10;
/// Ack/AckData header length (two trailing error bytes)
pub const ACK_HEADER_LEN: usize = 12;

/// S7 header: 10 bytes, 12 for Ack/AckData which append error class/code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct S7Header {
    pub pdu_type: PduType,
    pub redundancy_id: u16,
    pub pdu_ref: u16,
    pub param_len: u16,
    pub data_len: u16,
    /// `(class, code)` on Ack/AckData, absent otherwise
    pub error: Option<(u8, u8)>,
}

impl S7Header {
    pub fn job(pdu_ref: u16, param_len: u16, data_len: u16) -> Self {
        Self {
            pdu_type: PduType::Job,
            redundancy_id: 0,
            pdu_ref,
            param_len,
            data_len,
            error: None,
        }
    }

    pub fn user_data(pdu_ref: u16, param_len: u16, data_len: u16) -> Self {
        Self {
            pdu_type: PduType::UserData,
            redundancy_id: 0,
            pdu_ref,
            param_len,
            data_len,
            error: None,
        }
    }

    pub fn ack_data(pdu_ref: u16, param_len: u16, data_len: u16) -> Self {
        Self {
            pdu_type: PduType::AckData,
            redundancy_id: 0,
            pdu_ref,
            param_len,
            data_len,
            error: Some((0, 0)),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        match self.pdu_type {
            PduType::Ack | PduType::AckData => ACK_HEADER_LEN,
            _ => JOB_HEADER_LEN,
        }
    }

    pub fn parse(input: &[u8]) -> Result<(S7Header, &[u8])> {
        if input.len() < JOB_HEADER_LEN {
            return Err(Error::InsufficientData {
                needed: JOB_HEADER_LEN,
                available: input.len(),
            });
        }
        if input[0] != PROTOCOL_ID {
            return Err(Error::InvalidFrame);
        }
        let pdu_type = PduType::try_from(input[1]).map_err(|_| Error::InvalidFrame)?;
        let redundancy_id = u16::from_be_bytes([input[2], input[3]]);
        let pdu_ref = u16::from_be_bytes([input[4], input[5]]);
        let param_len = u16::from_be_bytes([input[6], input[7]]);
        let data_len = u16::from_be_bytes([input[8], input[9]]);

        let mut rest = &input[JOB_HEADER_LEN..];
        let error = match pdu_type {
            PduType::Ack | PduType::AckData => {
                if rest.len() < 2 {
                    return Err(Error::InsufficientData {
                        needed: 2,
                        available: rest.len(),
                    });
                }
                let pair = (rest[0], rest[1]);
                rest = &rest[2..];
                Some(pair)
            }
            _ => None,
        };
        Ok((
            S7Header {
                pdu_type,
                redundancy_id,
                pdu_ref,
                param_len,
                data_len,
                error,
            },
            rest,
        ))
    }

    pub fn encode_to<B: BufMut>(&self, dst: &mut B) {
        dst.put_u8(PROTOCOL_ID);
        dst.put_u8(self.pdu_type as u8);
        dst.put_u16(self.redundancy_id);
        dst.put_u16(self.pdu_ref);
        dst.put_u16(self.param_len);
        dst.put_u16(self.data_len);
        if matches!(self.pdu_type, PduType::Ack | PduType::AckData) {
            let (class, code) = self.error.unwrap_or((0, 0));
            dst.put_u8(class);
            dst.put_u8(code);
        }
    }
}

/// One whole S7 PDU: header plus zero-copy parameter and data slices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S7Pdu {
    pub header: S7Header,
    pub param: Bytes,
    pub data: Bytes,
}

impl S7Pdu {
    /// Assemble an outbound PDU; lengths in the header are derived.
    pub fn assemble(mut header: S7Header, param: Bytes, data: Bytes) -> Self {
        header.param_len = param.len() as u16;
        header.data_len = data.len() as u16;
        S7Pdu {
            header,
            param,
            data,
        }
    }

    /// Raise header-level Ack errors as `ProtocolError`.
    pub fn validate_response(&self) -> Result<()> {
        if let Some((class, code)) = self.header.error {
            if class != 0 || code != 0 {
                return Err(Error::ProtocolError { class, code });
            }
        }
        Ok(())
    }

    /// First parameter byte (the S7 function code), if any.
    #[inline]
    pub fn function_byte(&self) -> Option<u8> {
        self.param.first().copied()
    }

    /// Materialize into owned bytes ready for a COTP Data TPDU.
    pub fn into_bytes(self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len(&()));
        self.header.encode_to(&mut buf);
        buf.put_slice(&self.param);
        buf.put_slice(&self.data);
        buf.freeze()
    }
}

impl WireEncode for S7Pdu {
    type Error = Error;
    type Context = ();

    fn encoded_len(&self, _ctx: &Self::Context) -> usize {
        self.header.len() + self.param.len() + self.data.len()
    }

    fn encode_to<B: BufMut>(&self, dst: &mut B, _ctx: &Self::Context) -> Result<()> {
        self.header.encode_to(dst);
        dst.put_slice(&self.param);
        dst.put_slice(&self.data);
        Ok(())
    }
}

impl WireDecode for S7Pdu {
    type Error = Error;
    type Context = ();

    fn parse<'a>(
        input: &'a [u8],
        parent: &Bytes,
        _ctx: &Self::Context,
    ) -> Result<(&'a [u8], Self)> {
        let (header, rest) = S7Header::parse(input)?;
        let need = header.param_len as usize + header.data_len as usize;
        if rest.len() < need {
            return Err(Error::InsufficientData {
                needed: need,
                available: rest.len(),
            });
        }
        let (param_bytes, tail) = rest.split_at(header.param_len as usize);
        let (data_bytes, remain) = tail.split_at(header.data_len as usize);
        Ok((
            remain,
            S7Pdu {
                header,
                param: Bytes::slice_ref(parent, param_bytes),
                data: Bytes::slice_ref(parent, data_bytes),
            },
        ))
    }
}
