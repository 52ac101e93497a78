use super::{
    header::{S7Header, S7Pdu},
    types::Function,
};
use crate::error::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use nom::number::complete::{be_u16, u8 as nom_u8};

/// COMM-SETUP parameters negotiated during the PLC handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommSetup {
    /// Maximum jobs this side may have outstanding toward the peer
    pub max_am_q_calling: u16,
    /// Maximum jobs the peer may have outstanding toward this side
    pub max_am_q_called: u16,
    pub pdu_size: u16,
}

impl CommSetup {
    pub const PARAM_LEN: usize = 8;

    pub fn encode_param(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::PARAM_LEN);
        buf.put_u8(Function::CommSetup as u8);
        buf.put_u8(0x00);
        buf.put_u16(self.max_am_q_calling);
        buf.put_u16(self.max_am_q_called);
        buf.put_u16(self.pdu_size);
        buf.freeze()
    }

    /// Parse the parameter block of a CommSetup Job or AckData.
    pub fn parse_param(input: &[u8]) -> Result<CommSetup> {
        let (i, func) =
            nom_u8::<_, nom::error::Error<&[u8]>>(input).map_err(|_| Error::InvalidFrame)?;
        if Function::try_from(func) != Ok(Function::CommSetup) {
            return Err(Error::UnexpectedPdu);
        }
        let (i, _reserved) =
            nom_u8::<_, nom::error::Error<&[u8]>>(i).map_err(|_| Error::InvalidFrame)?;
        let (i, max_am_q_calling) =
            be_u16::<_, nom::error::Error<&[u8]>>(i).map_err(|_| Error::InvalidFrame)?;
        let (i, max_am_q_called) =
            be_u16::<_, nom::error::Error<&[u8]>>(i).map_err(|_| Error::InvalidFrame)?;
        let (_i, pdu_size) =
            be_u16::<_, nom::error::Error<&[u8]>>(i).map_err(|_| Error::InvalidFrame)?;
        Ok(CommSetup {
            max_am_q_calling,
            max_am_q_called,
            pdu_size,
        })
    }

    /// Job PDU this client sends to request the session parameters.
    pub fn build_job(&self, pdu_ref: u16) -> Bytes {
        S7Pdu::assemble(S7Header::job(pdu_ref, 0, 0), self.encode_param(), Bytes::new())
            .into_bytes()
    }

    /// AckData PDU answering a peer-initiated setup job.
    pub fn build_ack(&self, pdu_ref: u16) -> Bytes {
        S7Pdu::assemble(
            S7Header::ack_data(pdu_ref, 0, 0),
            self.encode_param(),
            Bytes::new(),
        )
        .into_bytes()
    }
}
