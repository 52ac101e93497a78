use super::{
    header::{S7Header, S7Pdu},
    types::{DataTransport, Function, PlcArea, ReturnCode, VarType},
};
use crate::error::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use nom::number::complete::{be_u16, u8 as nom_u8};

/// Variable-specification constants
const SPEC_TYPE_VAR: u8 = 0x12;
const SPEC_LEN_ANY: u8 = 0x0A;
const SYNTAX_ID_ANY: u8 = 0x10;

/// Encoded length of one address item in a read/write parameter block.
pub const ADDRESS_ITEM_LEN: usize = 12;
/// Header bytes preceding each data item payload.
pub const DATA_ITEM_HEADER_LEN: usize = 4;

/// One logical read request: `count` elements of `var_type` at `offset`.
///
/// For `VarType::Bit` the offset is a bit offset (`byte * 8 + bit`);
/// Timer/Counter areas address element indices; all other combinations use a
/// byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadItem {
    pub area: PlcArea,
    pub offset: u32,
    pub var_type: VarType,
    pub count: u16,
}

impl ReadItem {
    /// Bytes this item occupies in a response payload.
    #[inline]
    pub fn wire_len(&self) -> usize {
        match self.area {
            PlcArea::Timer | PlcArea::Counter => self.count as usize * 2,
            _ => self.var_type.wire_len(self.count),
        }
    }

    fn transport_code(&self) -> u8 {
        match self.area {
            // Timer/Counter items travel with the area code as transport size
            PlcArea::Timer | PlcArea::Counter => self.area.wire_code(),
            _ => match self.var_type {
                VarType::String => VarType::Byte.transport_code(),
                other => other.transport_code(),
            },
        }
    }

    /// Count field of the address item; strings read their 2-byte header too.
    fn wire_count(&self) -> u16 {
        match (self.area, self.var_type) {
            (PlcArea::Timer | PlcArea::Counter, _) => self.count,
            (_, VarType::String) => self.count + 2,
            _ => self.count,
        }
    }

    /// Address field: bit offsets stay as-is, byte offsets scale by 8.
    fn wire_address(&self) -> u32 {
        match (self.area, self.var_type) {
            (PlcArea::Timer | PlcArea::Counter, _) => self.offset,
            (_, VarType::Bit) => self.offset,
            _ => self.offset * 8,
        }
    }

    pub fn encode_to<B: BufMut>(&self, dst: &mut B) {
        dst.put_u8(SPEC_TYPE_VAR);
        dst.put_u8(SPEC_LEN_ANY);
        dst.put_u8(SYNTAX_ID_ANY);
        dst.put_u8(self.transport_code());
        dst.put_u16(self.wire_count());
        dst.put_u16(self.area.db_number());
        dst.put_u8(self.area.wire_code());
        let addr = self.wire_address();
        dst.put_u8(((addr >> 16) & 0xFF) as u8);
        dst.put_u8(((addr >> 8) & 0xFF) as u8);
        dst.put_u8((addr & 0xFF) as u8);
    }

    /// Decode one address item (used by the responding side and tests).
    pub fn parse(input: &[u8]) -> Result<(&[u8], ReadItem)> {
        if input.len() < ADDRESS_ITEM_LEN {
            return Err(Error::InsufficientData {
                needed: ADDRESS_ITEM_LEN,
                available: input.len(),
            });
        }
        if input[0] != SPEC_TYPE_VAR || input[2] != SYNTAX_ID_ANY {
            return Err(Error::InvalidFrame);
        }
        let transport = input[3];
        let count = u16::from_be_bytes([input[4], input[5]]);
        let db_number = u16::from_be_bytes([input[6], input[7]]);
        let area = PlcArea::from_wire(input[8], db_number).ok_or(Error::Decode {
            context: "unknown area code in address item",
        })?;
        let addr = u32::from_be_bytes([0, input[9], input[10], input[11]]);
        let (var_type, offset) = match (area, transport) {
            (PlcArea::Timer | PlcArea::Counter, _) => (VarType::Word, addr),
            (_, 0x01) => (VarType::Bit, addr),
            (_, 0x03) => (VarType::Char, addr / 8),
            (_, 0x04) => (VarType::Word, addr / 8),
            (_, 0x05) => (VarType::Int16, addr / 8),
            (_, 0x06) => (VarType::DWord, addr / 8),
            (_, 0x07) => (VarType::Int32, addr / 8),
            (_, 0x08) => (VarType::Float32, addr / 8),
            _ => (VarType::Byte, addr / 8),
        };
        Ok((
            &input[ADDRESS_ITEM_LEN..],
            ReadItem {
                area,
                offset,
                var_type,
                count,
            },
        ))
    }
}

/// One logical write request: the addressed slice plus its payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteItem {
    pub item: ReadItem,
    pub data: Bytes,
}

impl WriteItem {
    pub fn new(item: ReadItem, data: Bytes) -> Self {
        Self { item, data }
    }

    fn data_transport(&self) -> DataTransport {
        match self.item.var_type {
            VarType::Bit => DataTransport::Bit,
            _ => DataTransport::ByteWordDWord,
        }
    }
}

/// Build a ReadVar Job PDU from address items.
pub fn build_read_job(pdu_ref: u16, items: &[ReadItem]) -> Bytes {
    let mut param = BytesMut::with_capacity(2 + items.len() * ADDRESS_ITEM_LEN);
    param.put_u8(Function::Read as u8);
    param.put_u8(items.len() as u8);
    for item in items {
        item.encode_to(&mut param);
    }
    S7Pdu::assemble(S7Header::job(pdu_ref, 0, 0), param.freeze(), Bytes::new()).into_bytes()
}

/// Build a WriteVar Job PDU. An odd-length payload is followed by one pad
/// byte unless it is the last payload in the PDU.
pub fn build_write_job(pdu_ref: u16, items: &[WriteItem]) -> Bytes {
    let mut param = BytesMut::with_capacity(2 + items.len() * ADDRESS_ITEM_LEN);
    param.put_u8(Function::Write as u8);
    param.put_u8(items.len() as u8);
    let mut data = BytesMut::new();
    for (idx, wi) in items.iter().enumerate() {
        wi.item.encode_to(&mut param);
        let transport = wi.data_transport();
        data.put_u8(0x00);
        data.put_u8(transport as u8);
        data.put_u16(transport.len_field(wi.data.len()));
        data.put_slice(&wi.data);
        if wi.data.len() % 2 == 1 && idx + 1 != items.len() {
            data.put_u8(0x00);
        }
    }
    S7Pdu::assemble(S7Header::job(pdu_ref, 0, 0), param.freeze(), data.freeze()).into_bytes()
}

/// Build a ReadVar AckData PDU (responding side / tests).
pub fn build_read_ack(pdu_ref: u16, items: &[(ReturnCode, &[u8])]) -> Bytes {
    let mut param = BytesMut::with_capacity(2);
    param.put_u8(Function::Read as u8);
    param.put_u8(items.len() as u8);
    let mut data = BytesMut::new();
    for (idx, (rc, payload)) in items.iter().enumerate() {
        data.put_u8(u8::from(*rc));
        if rc.is_success() {
            data.put_u8(DataTransport::ByteWordDWord as u8);
            data.put_u16(DataTransport::ByteWordDWord.len_field(payload.len()));
            data.put_slice(payload);
        } else {
            data.put_u8(DataTransport::Null as u8);
            data.put_u16(0);
        }
        if payload.len() % 2 == 1 && idx + 1 != items.len() {
            data.put_u8(0x00);
        }
    }
    S7Pdu::assemble(
        S7Header::ack_data(pdu_ref, 0, 0),
        param.freeze(),
        data.freeze(),
    )
    .into_bytes()
}

/// Build a WriteVar AckData PDU (responding side / tests).
pub fn build_write_ack(pdu_ref: u16, codes: &[ReturnCode]) -> Bytes {
    let mut param = BytesMut::with_capacity(2);
    param.put_u8(Function::Write as u8);
    param.put_u8(codes.len() as u8);
    let mut data = BytesMut::with_capacity(codes.len());
    for rc in codes {
        data.put_u8(u8::from(*rc));
    }
    S7Pdu::assemble(
        S7Header::ack_data(pdu_ref, 0, 0),
        param.freeze(),
        data.freeze(),
    )
    .into_bytes()
}

/// Zero-copy view of one data item inside an Ack payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataItemRef<'a> {
    pub return_code: ReturnCode,
    pub transport: DataTransport,
    pub data: &'a [u8],
}

/// Walk the data items of a ReadVar response, skipping inter-item padding.
#[derive(Debug, Clone, Copy)]
pub struct DataItemIter<'a> {
    remaining: &'a [u8],
    left: u8,
}

impl<'a> DataItemIter<'a> {
    pub fn new(item_count: u8, raw: &'a [u8]) -> Self {
        Self {
            remaining: raw,
            left: item_count,
        }
    }
}

impl<'a> Iterator for DataItemIter<'a> {
    type Item = Result<DataItemRef<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.left == 0 {
            return None;
        }
        let left_before = self.left;
        match parse_data_item(self.remaining) {
            Ok((mut rest, item)) => {
                // pad byte between items when the payload length is odd
                if left_before > 1 && item.data.len() % 2 == 1 {
                    if rest.is_empty() {
                        self.left = 0;
                        return Some(Err(Error::InvalidFrame));
                    }
                    rest = &rest[1..];
                }
                self.remaining = rest;
                self.left -= 1;
                Some(Ok(item))
            }
            Err(e) => {
                self.left = 0;
                Some(Err(e))
            }
        }
    }
}

pub(crate) fn parse_data_item(input: &[u8]) -> Result<(&[u8], DataItemRef<'_>)> {
    let (i, rc) = nom_u8::<_, nom::error::Error<&[u8]>>(input).map_err(|_| Error::InvalidFrame)?;
    let return_code = ReturnCode::from(rc);
    let (i, ts) = nom_u8::<_, nom::error::Error<&[u8]>>(i).map_err(|_| Error::InvalidFrame)?;
    let transport = DataTransport::try_from(ts).map_err(|_| Error::Decode {
        context: "unknown data transport code",
    })?;
    let (i, len_field) = be_u16::<_, nom::error::Error<&[u8]>>(i).map_err(|_| Error::InvalidFrame)?;
    let data_len = transport.len_in_bytes(len_field);
    if i.len() < data_len {
        return Err(Error::InsufficientData {
            needed: data_len,
            available: i.len(),
        });
    }
    let (data, rest) = i.split_at(data_len);
    Ok((
        rest,
        DataItemRef {
            return_code,
            transport,
            data,
        },
    ))
}

/// Walk the one-byte return codes of a WriteVar response.
#[derive(Debug, Clone, Copy)]
pub struct StatusItemIter<'a> {
    remaining: &'a [u8],
    left: u8,
}

impl<'a> StatusItemIter<'a> {
    pub fn new(item_count: u8, raw: &'a [u8]) -> Self {
        Self {
            remaining: raw,
            left: item_count,
        }
    }
}

impl Iterator for StatusItemIter<'_> {
    type Item = Result<ReturnCode>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.left == 0 {
            return None;
        }
        let Some((&rc, rest)) = self.remaining.split_first() else {
            self.left = 0;
            return Some(Err(Error::InvalidFrame));
        };
        self.remaining = rest;
        self.left -= 1;
        Some(Ok(ReturnCode::from(rc)))
    }
}
