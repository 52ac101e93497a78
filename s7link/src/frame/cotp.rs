use super::{types::ConnectionType, WireDecode, WireEncode};
use crate::error::{Error, Result};
use bytes::{BufMut, Bytes};

/// Source TSAP used by this client (any non-zero value is accepted by S7).
pub const LOCAL_TSAP: u16 = 0x0100;

/// Derive the remote TSAP from the connection profile and CPU location.
#[inline]
pub fn remote_tsap(connection_type: ConnectionType, rack: u8, slot: u8) -> u16 {
    ((connection_type as u16) << 8) | (rack as u16 * 0x20 + slot as u16)
}

/// Map a desired PDU size to the COTP TPDU-size parameter code (2^n bytes).
pub fn tpdu_size_code(pdu_size: u16) -> u8 {
    match pdu_size {
        0..=128 => 0x07,
        129..=256 => 0x08,
        257..=512 => 0x09,
        513..=1024 => 0x0A,
        1025..=2048 => 0x0B,
        2049..=4096 => 0x0C,
        _ => 0x0D,
    }
}

/// COTP TPDU type octets
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CotpType {
    /// Connection Request
    Cr = 0xE0,
    /// Connection Confirm
    Cc = 0xD0,
    /// Disconnect Request
    Dr = 0x80,
    /// Disconnect Confirm
    Dc = 0xC0,
    /// Data
    D = 0xF0,
}

impl TryFrom<u8> for CotpType {
    type Error = ();
    fn try_from(v: u8) -> std::result::Result<Self, Self::Error> {
        match v {
            0xE0 => Ok(CotpType::Cr),
            0xD0 => Ok(CotpType::Cc),
            0x80 => Ok(CotpType::Dr),
            0xC0 => Ok(CotpType::Dc),
            0xF0 => Ok(CotpType::D),
            _ => Err(()),
        }
    }
}

/// CR/CC fixed part plus the three TLV parameters S7 cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CotpConnectParams {
    pub dst_ref: u16,
    pub src_ref: u16,
    /// Class + option octet; S7 endpoints expect 0x00.
    pub class_option: u8,
    /// TPDU size parameter code (2^n bytes)
    pub tpdu_size: u8,
    pub src_tsap: u16,
    pub dst_tsap: u16,
}

impl Default for CotpConnectParams {
    fn default() -> Self {
        Self {
            dst_ref: 0x0000,
            src_ref: 0x0001,
            class_option: 0x00,
            tpdu_size: 0x0A,
            src_tsap: LOCAL_TSAP,
            dst_tsap: LOCAL_TSAP,
        }
    }
}

impl CotpConnectParams {
    fn parse_body(body: &[u8]) -> Result<Self> {
        if body.len() < 5 {
            return Err(Error::InvalidFrame);
        }
        let dst_ref = u16::from_be_bytes([body[0], body[1]]);
        let src_ref = u16::from_be_bytes([body[2], body[3]]);
        let class_option = body[4];

        let mut tpdu_size = 0x0Au8;
        let mut src_tsap = 0u16;
        let mut dst_tsap = 0u16;

        // TLV walk; codes other than size/TSAPs are skipped by their length.
        let mut rest = &body[5..];
        while rest.len() >= 2 {
            let code = rest[0];
            let len = rest[1] as usize;
            if rest.len() < 2 + len {
                return Err(Error::InvalidFrame);
            }
            let value = &rest[2..2 + len];
            match code {
                0xC0 if len == 1 => tpdu_size = value[0],
                0xC1 if len == 2 => src_tsap = u16::from_be_bytes([value[0], value[1]]),
                0xC2 if len == 2 => dst_tsap = u16::from_be_bytes([value[0], value[1]]),
                _ => {}
            }
            rest = &rest[2 + len..];
        }

        Ok(Self {
            dst_ref,
            src_ref,
            class_option,
            tpdu_size,
            src_tsap,
            dst_tsap,
        })
    }

    fn encode_body<B: BufMut>(&self, dst: &mut B) {
        dst.put_u16(self.dst_ref);
        dst.put_u16(self.src_ref);
        dst.put_u8(self.class_option);
        write_tlv(dst, 0xC0, &[self.tpdu_size]);
        write_tlv(dst, 0xC1, &self.src_tsap.to_be_bytes());
        write_tlv(dst, 0xC2, &self.dst_tsap.to_be_bytes());
    }

    #[inline]
    fn body_len(&self) -> usize {
        2 + 2 + 1 + 3 + 4 + 4
    }
}

/// DR/DC fixed part. `reason` is meaningful on DR only (128 = normal).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CotpDisconnectParams {
    pub dst_ref: u16,
    pub src_ref: u16,
    pub reason: u8,
}

impl Default for CotpDisconnectParams {
    fn default() -> Self {
        Self {
            dst_ref: 0x0000,
            src_ref: 0x0001,
            reason: 0x80,
        }
    }
}

/// Data TPDU: end-of-transmission flag plus TPDU number (always 0 here).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CotpDataParams {
    pub eot: bool,
    pub tpdu_nr: u8,
}

impl Default for CotpDataParams {
    fn default() -> Self {
        Self {
            eot: true,
            tpdu_nr: 0,
        }
    }
}

/// COTP TPDU subset sufficient for ISO-on-TCP + S7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cotp {
    Cr(CotpConnectParams),
    Cc(CotpConnectParams),
    Dr(CotpDisconnectParams),
    Dc(CotpDisconnectParams),
    D(CotpDataParams),
}

impl Cotp {
    /// Build the CR this client sends to open an association.
    pub fn connect_request(
        pdu_size: u16,
        connection_type: ConnectionType,
        rack: u8,
        slot: u8,
    ) -> Self {
        Cotp::Cr(CotpConnectParams {
            tpdu_size: tpdu_size_code(pdu_size),
            src_tsap: LOCAL_TSAP,
            dst_tsap: remote_tsap(connection_type, rack, slot),
            ..Default::default()
        })
    }

    /// Data TPDU header carrying one whole S7 PDU.
    pub fn data() -> Self {
        Cotp::D(CotpDataParams::default())
    }
}

impl WireEncode for Cotp {
    type Error = Error;
    type Context = ();

    fn encoded_len(&self, _ctx: &Self::Context) -> usize {
        // LI byte + type byte + body
        match self {
            Cotp::Cr(p) | Cotp::Cc(p) => 2 + p.body_len(),
            Cotp::Dr(_) | Cotp::Dc(_) => 2 + 5,
            Cotp::D(_) => 3,
        }
    }

    fn encode_to<B: BufMut>(&self, dst: &mut B, ctx: &Self::Context) -> Result<()> {
        let li = (self.encoded_len(ctx) - 1) as u8;
        dst.put_u8(li);
        match self {
            Cotp::Cr(p) => {
                dst.put_u8(CotpType::Cr as u8);
                p.encode_body(dst);
            }
            Cotp::Cc(p) => {
                dst.put_u8(CotpType::Cc as u8);
                p.encode_body(dst);
            }
            Cotp::Dr(p) => {
                dst.put_u8(CotpType::Dr as u8);
                dst.put_u16(p.dst_ref);
                dst.put_u16(p.src_ref);
                dst.put_u8(p.reason);
            }
            Cotp::Dc(p) => {
                dst.put_u8(CotpType::Dc as u8);
                dst.put_u16(p.dst_ref);
                dst.put_u16(p.src_ref);
                dst.put_u8(0);
            }
            Cotp::D(p) => {
                dst.put_u8(CotpType::D as u8);
                let eot = if p.eot { 0x80 } else { 0x00 };
                dst.put_u8(eot | (p.tpdu_nr & 0x7F));
            }
        }
        Ok(())
    }
}

impl WireDecode for Cotp {
    type Error = Error;
    type Context = ();

    /// Parse one COTP TPDU. Consumes exactly the bytes indicated by the LI
    /// field plus the LI byte itself; for Data TPDUs the user payload is the
    /// remainder and stays in `rest`.
    fn parse<'a>(
        input: &'a [u8],
        _parent: &Bytes,
        _ctx: &Self::Context,
    ) -> Result<(&'a [u8], Self)> {
        if input.len() < 2 {
            return Err(Error::InsufficientData {
                needed: 2,
                available: input.len(),
            });
        }
        let li = input[0] as usize;
        let total = 1 + li;
        if li < 1 || total > input.len() {
            return Err(Error::InvalidFrame);
        }
        let tpdu_type = CotpType::try_from(input[1]).map_err(|_| Error::InvalidFrame)?;
        let body = &input[2..total];
        let rest = &input[total..];

        let cotp = match tpdu_type {
            CotpType::Cr => Cotp::Cr(CotpConnectParams::parse_body(body)?),
            CotpType::Cc => Cotp::Cc(CotpConnectParams::parse_body(body)?),
            CotpType::Dr | CotpType::Dc => {
                if body.len() < 5 {
                    return Err(Error::InvalidFrame);
                }
                let params = CotpDisconnectParams {
                    dst_ref: u16::from_be_bytes([body[0], body[1]]),
                    src_ref: u16::from_be_bytes([body[2], body[3]]),
                    reason: body[4],
                };
                if matches!(tpdu_type, CotpType::Dr) {
                    Cotp::Dr(params)
                } else {
                    Cotp::Dc(params)
                }
            }
            CotpType::D => {
                if body.is_empty() {
                    return Err(Error::InvalidFrame);
                }
                Cotp::D(CotpDataParams {
                    eot: body[0] & 0x80 != 0,
                    tpdu_nr: body[0] & 0x7F,
                })
            }
        };
        Ok((rest, cotp))
    }
}

#[inline]
fn write_tlv<B: BufMut>(dst: &mut B, code: u8, bytes: &[u8]) {
    dst.put_u8(code);
    dst.put_u8(bytes.len() as u8);
    dst.put_slice(bytes);
}
