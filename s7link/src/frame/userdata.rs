use super::{
    header::{S7Header, S7Pdu},
    item::{parse_data_item, DataItemRef},
    types::{
        decode_block_timestamp, decode_datetime8, latin1_bytes_to_string, DataTransport, Function,
        FunctionGroup, ReturnCode, UserDataMethod,
    },
};
use crate::error::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use chrono::NaiveDateTime;

const PARAM_ITEM_TYPE: u8 = 0x12;
const METHOD_REQUEST: u8 = 0x11;
const METHOD_RESPONSE: u8 = 0x12;

/// Subfunctions of `FunctionGroup::BlockFunctions`
pub mod block_subfunction {
    pub const LIST_BLOCKS: u8 = 0x01;
    pub const LIST_BLOCKS_OF_TYPE: u8 = 0x02;
    pub const BLOCK_INFO: u8 = 0x03;
}

/// Subfunctions of `FunctionGroup::CpuFunctions`
pub mod cpu_subfunction {
    pub const READ_SZL: u8 = 0x01;
    pub const MESSAGE_SERVICE: u8 = 0x02;
    pub const ALARM_ACK_IND: u8 = 0x0C;
    pub const ALARM_SQ_IND: u8 = 0x11;
    pub const ALARM_S_IND: u8 = 0x12;
    pub const ALARM_QUERY: u8 = 0x13;
}

/// Subfunctions of `FunctionGroup::TimeFunctions`
pub mod time_subfunction {
    pub const READ_CLOCK: u8 = 0x01;
    pub const SET_CLOCK: u8 = 0x04;
}

/// Continuation/response extension of a user-data parameter item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserDataParamTail {
    pub data_unit_ref: u8,
    /// True when this is the final fragment of a paged response.
    pub last_data_unit: bool,
    pub error_code: u16,
}

/// One user-data parameter item (method / group / subfunction / sequence).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserDataParamItem {
    pub method: u8,
    pub kind: UserDataMethod,
    pub group: FunctionGroup,
    pub subfunction: u8,
    pub sequence: u8,
    pub tail: Option<UserDataParamTail>,
}

impl UserDataParamItem {
    pub fn request(group: FunctionGroup, subfunction: u8) -> Self {
        Self {
            method: METHOD_REQUEST,
            kind: UserDataMethod::Request,
            group,
            subfunction,
            sequence: 0,
            tail: None,
        }
    }

    pub fn continuation(group: FunctionGroup, subfunction: u8, sequence: u8) -> Self {
        Self {
            method: METHOD_RESPONSE,
            kind: UserDataMethod::Request,
            group,
            subfunction,
            sequence,
            tail: Some(UserDataParamTail {
                data_unit_ref: sequence,
                last_data_unit: true,
                error_code: 0,
            }),
        }
    }

    pub fn response(
        group: FunctionGroup,
        subfunction: u8,
        sequence: u8,
        last_data_unit: bool,
    ) -> Self {
        Self {
            method: METHOD_RESPONSE,
            kind: UserDataMethod::Response,
            group,
            subfunction,
            sequence,
            tail: Some(UserDataParamTail {
                data_unit_ref: sequence,
                last_data_unit,
                error_code: 0,
            }),
        }
    }

    pub fn encode_param(&self) -> Bytes {
        let item_len: u8 = if self.tail.is_some() { 8 } else { 4 };
        let mut buf = BytesMut::with_capacity(4 + item_len as usize);
        buf.put_u8(Function::CpuService as u8);
        buf.put_u8(0x01); // one parameter item
        buf.put_u8(PARAM_ITEM_TYPE);
        buf.put_u8(item_len);
        buf.put_u8(self.method);
        buf.put_u8(((self.kind as u8) << 4) | (self.group as u8));
        buf.put_u8(self.subfunction);
        buf.put_u8(self.sequence);
        if let Some(tail) = self.tail {
            buf.put_u8(tail.data_unit_ref);
            buf.put_u8(if tail.last_data_unit { 0x00 } else { 0x01 });
            buf.put_u16(tail.error_code);
        }
        buf.freeze()
    }

    /// Parse the parameter block of a UserData PDU.
    pub fn parse_param(input: &[u8]) -> Result<UserDataParamItem> {
        if input.len() < 8 {
            return Err(Error::InsufficientData {
                needed: 8,
                available: input.len(),
            });
        }
        if Function::try_from(input[0]) != Ok(Function::CpuService) {
            return Err(Error::UnexpectedPdu);
        }
        // input[1] is the item count; a single item is all S7 ever sends here
        if input[2] != PARAM_ITEM_TYPE {
            return Err(Error::InvalidFrame);
        }
        let item_len = input[3] as usize;
        if input.len() < 4 + item_len || item_len < 4 {
            return Err(Error::InvalidFrame);
        }
        let body = &input[4..4 + item_len];
        let method = body[0];
        let kind = UserDataMethod::try_from(body[1] >> 4).map_err(|_| Error::Decode {
            context: "unknown user-data method nibble",
        })?;
        let group = FunctionGroup::try_from(body[1] & 0x0F).map_err(|_| Error::Decode {
            context: "unknown user-data function group",
        })?;
        let subfunction = body[2];
        let sequence = body[3];
        let tail = if item_len >= 8 {
            Some(UserDataParamTail {
                data_unit_ref: body[4],
                last_data_unit: body[5] == 0x00,
                error_code: u16::from_be_bytes([body[6], body[7]]),
            })
        } else {
            None
        };
        Ok(UserDataParamItem {
            method,
            kind,
            group,
            subfunction,
            sequence,
            tail,
        })
    }
}

/// Assemble a full UserData PDU from a parameter item and payload bytes.
pub fn build_userdata(pdu_ref: u16, param: UserDataParamItem, payload: &[u8]) -> Bytes {
    let mut data = BytesMut::with_capacity(DATA_HEADER_LEN + payload.len());
    if payload.is_empty() {
        // empty request payloads travel as "object does not exist"
        data.put_u8(u8::from(ReturnCode::ObjectDoesNotExist));
        data.put_u8(DataTransport::Null as u8);
        data.put_u16(0);
    } else {
        data.put_u8(u8::from(ReturnCode::Success));
        data.put_u8(DataTransport::OctetString as u8);
        data.put_u16(payload.len() as u16);
        data.put_slice(payload);
    }
    S7Pdu::assemble(
        S7Header::user_data(pdu_ref, 0, 0),
        param.encode_param(),
        data.freeze(),
    )
    .into_bytes()
}

const DATA_HEADER_LEN: usize = 4;

/// Parse a UserData PDU into its parameter item and first payload item.
pub fn parse_userdata(pdu: &S7Pdu) -> Result<(UserDataParamItem, DataItemRef<'_>)> {
    let param = UserDataParamItem::parse_param(&pdu.param)?;
    let (_, payload) = parse_data_item(&pdu.data)?;
    Ok((param, payload))
}

// ===== Block info =====

/// PLC block kinds addressable by block-info queries.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    Ob = 0x38,
    Db = 0x41,
    Sdb = 0x42,
    Fc = 0x43,
    Sfc = 0x44,
    Fb = 0x45,
    Sfb = 0x46,
}

impl TryFrom<u8> for BlockType {
    type Error = ();
    fn try_from(v: u8) -> std::result::Result<Self, Self::Error> {
        match v {
            0x38 => Ok(BlockType::Ob),
            0x41 => Ok(BlockType::Db),
            0x42 => Ok(BlockType::Sdb),
            0x43 => Ok(BlockType::Fc),
            0x44 => Ok(BlockType::Sfc),
            0x45 => Ok(BlockType::Fb),
            0x46 => Ok(BlockType::Sfb),
            _ => Err(()),
        }
    }
}

/// Metadata returned for a single PLC block.
#[derive(Debug, Clone, PartialEq)]
pub struct PlcBlockInfo {
    pub block_type: BlockType,
    pub block_number: u16,
    pub language: u8,
    pub flags: u8,
    pub load_size: u32,
    pub code_size: u16,
    pub local_data_size: u16,
    pub author: String,
    pub family: String,
    pub name: String,
    pub version: u8,
    pub checksum: u16,
    pub code_timestamp: Option<NaiveDateTime>,
    pub interface_timestamp: Option<NaiveDateTime>,
}

/// Request payload: `0x30`, the block-type octet, five ASCII digits, `'A'`.
pub fn encode_block_info_request(block_type: BlockType, block_number: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u8(0x30);
    buf.put_u8(block_type as u8);
    let digits = format!("{block_number:05}");
    buf.put_slice(digits.as_bytes());
    buf.put_u8(b'A');
    buf.freeze()
}

const BLOCK_INFO_LEN: usize = 63;

impl PlcBlockInfo {
    pub fn parse(data: &[u8]) -> Result<PlcBlockInfo> {
        if data.len() < BLOCK_INFO_LEN {
            return Err(Error::InsufficientData {
                needed: BLOCK_INFO_LEN,
                available: data.len(),
            });
        }
        if u16::from_be_bytes([data[0], data[1]]) != 0x0100 {
            return Err(Error::Decode {
                context: "block info header constant",
            });
        }
        let block_type = BlockType::try_from(data[4]).map_err(|_| Error::Decode {
            context: "unknown block type",
        })?;
        Ok(PlcBlockInfo {
            flags: data[2],
            language: data[3],
            block_type,
            block_number: u16::from_be_bytes([data[5], data[6]]),
            load_size: u32::from_be_bytes([data[7], data[8], data[9], data[10]]),
            // data[11..15] is the security word, not surfaced
            code_timestamp: decode_block_timestamp(&data[15..21]),
            interface_timestamp: decode_block_timestamp(&data[21..27]),
            // data[27..31] are the SSB/ADD lengths, not surfaced
            local_data_size: u16::from_be_bytes([data[31], data[32]]),
            code_size: u16::from_be_bytes([data[33], data[34]]),
            author: latin1_bytes_to_string(&data[35..43]).trim_end().to_string(),
            family: latin1_bytes_to_string(&data[43..51]).trim_end().to_string(),
            name: latin1_bytes_to_string(&data[51..59]).trim_end().to_string(),
            version: data[59],
            checksum: u16::from_be_bytes([data[61], data[62]]),
        })
    }

    /// Encode a block-info response payload (responding side and tests).
    pub fn encode(&self) -> Bytes {
        fn put_padded<B: BufMut>(dst: &mut B, s: &str) {
            let mut raw = [b' '; 8];
            for (i, b) in s.bytes().take(8).enumerate() {
                raw[i] = b;
            }
            dst.put_slice(&raw);
        }
        let mut buf = BytesMut::with_capacity(BLOCK_INFO_LEN);
        buf.put_u16(0x0100);
        buf.put_u8(self.flags);
        buf.put_u8(self.language);
        buf.put_u8(self.block_type as u8);
        buf.put_u16(self.block_number);
        buf.put_u32(self.load_size);
        buf.put_u32(0); // security
        buf.put_slice(&encode_block_timestamp(self.code_timestamp));
        buf.put_slice(&encode_block_timestamp(self.interface_timestamp));
        buf.put_u16(0); // ssb length
        buf.put_u16(0); // add length
        buf.put_u16(self.local_data_size);
        buf.put_u16(self.code_size);
        put_padded(&mut buf, &self.author);
        put_padded(&mut buf, &self.family);
        put_padded(&mut buf, &self.name);
        buf.put_u8(self.version);
        buf.put_u8(0);
        buf.put_u16(self.checksum);
        buf.freeze()
    }
}

fn encode_block_timestamp(ts: Option<NaiveDateTime>) -> [u8; 6] {
    use chrono::NaiveDate;
    let base = NaiveDate::from_ymd_opt(1984, 1, 1).and_then(|d| d.and_hms_opt(0, 0, 0));
    let (Some(ts), Some(base)) = (ts, base) else {
        return [0; 6];
    };
    let delta = ts - base;
    let days = delta.num_days().clamp(0, u16::MAX as i64) as u16;
    let millis = (delta - chrono::Duration::days(delta.num_days()))
        .num_milliseconds()
        .clamp(0, u32::MAX as i64) as u32;
    let mut out = [0u8; 6];
    out[..4].copy_from_slice(&millis.to_be_bytes());
    out[4..].copy_from_slice(&days.to_be_bytes());
    out
}

// ===== Pending alarms =====

/// One pending or indicated alarm entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlcAlarm {
    pub event_id: u32,
    pub event_state: u8,
    pub ack_state_going: u8,
    pub ack_state_coming: u8,
    /// Associated values as raw bytes
    pub extra: Bytes,
}

const ALARM_ENTRY_HEADER_LEN: usize = 9;

/// Parse concatenated alarm entries from a query-response payload.
///
/// Entry layout: total length octet, alarm type octet, event id (u32),
/// event state, going/coming ack state, then associated values.
pub fn parse_pending_alarms(mut data: &[u8]) -> Result<Vec<PlcAlarm>> {
    let mut alarms = Vec::new();
    while !data.is_empty() {
        let entry_len = data[0] as usize;
        if entry_len < ALARM_ENTRY_HEADER_LEN || entry_len > data.len() {
            return Err(Error::Decode {
                context: "alarm entry length",
            });
        }
        let entry = &data[..entry_len];
        alarms.push(PlcAlarm {
            event_id: u32::from_be_bytes([entry[2], entry[3], entry[4], entry[5]]),
            event_state: entry[6],
            ack_state_going: entry[7],
            ack_state_coming: entry[8],
            extra: Bytes::copy_from_slice(&entry[ALARM_ENTRY_HEADER_LEN..]),
        });
        data = &data[entry_len..];
    }
    Ok(alarms)
}

/// Encode one alarm entry (responding side and tests).
pub fn encode_alarm_entry(alarm: &PlcAlarm) -> Bytes {
    let mut buf = BytesMut::with_capacity(ALARM_ENTRY_HEADER_LEN + alarm.extra.len());
    buf.put_u8((ALARM_ENTRY_HEADER_LEN + alarm.extra.len()) as u8);
    buf.put_u8(0x04); // ALARM_S type
    buf.put_u32(alarm.event_id);
    buf.put_u8(alarm.event_state);
    buf.put_u8(alarm.ack_state_going);
    buf.put_u8(alarm.ack_state_coming);
    buf.put_slice(&alarm.extra);
    buf.freeze()
}

/// Unsolicited alarm indication delivered through the subscription slot.
#[derive(Debug, Clone)]
pub struct AlarmNotification {
    pub subfunction: u8,
    pub sequence: u8,
    /// Raw indication payload; entries decode with `parse_pending_alarms`
    /// when the subfunction is an ALARM_S/ALARM_SQ indication.
    pub data: Bytes,
}

/// Subscription payload: mode octet, reserved, eight-character station name.
pub fn encode_alarm_subscription(enable: bool) -> Bytes {
    let mut buf = BytesMut::with_capacity(10);
    buf.put_u8(if enable { 0x01 } else { 0x00 });
    buf.put_u8(0x00);
    buf.put_slice(b"HmiRtm  ");
    buf.freeze()
}

// ===== Clock =====

/// Decode a clock-response payload: two leading octets (reserved + century)
/// followed by an 8-byte BCD DATE_AND_TIME.
pub fn decode_clock(data: &[u8]) -> Result<NaiveDateTime> {
    if data.len() < 10 {
        return Err(Error::InsufficientData {
            needed: 10,
            available: data.len(),
        });
    }
    decode_datetime8(&data[2..10]).ok_or(Error::Decode {
        context: "clock BCD timestamp",
    })
}

/// Encode a clock payload (responding side and tests).
pub fn encode_clock(dt: &NaiveDateTime) -> Bytes {
    let mut buf = BytesMut::with_capacity(10);
    buf.put_u8(0x00);
    buf.put_u8(0x20);
    buf.put_slice(&super::types::encode_datetime8(dt));
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::WireDecode;
    use chrono::NaiveDate;

    #[test]
    fn param_item_round_trip_short_and_long() {
        let req = UserDataParamItem::request(FunctionGroup::TimeFunctions, 0x01);
        let parsed = UserDataParamItem::parse_param(&req.encode_param()).unwrap();
        assert_eq!(parsed, req);
        assert!(parsed.tail.is_none());

        let resp = UserDataParamItem::response(FunctionGroup::CpuFunctions, 0x13, 3, false);
        let parsed = UserDataParamItem::parse_param(&resp.encode_param()).unwrap();
        assert_eq!(parsed.sequence, 3);
        assert_eq!(parsed.tail.map(|t| t.last_data_unit), Some(false));
    }

    #[test]
    fn userdata_pdu_round_trip() {
        let raw = build_userdata(
            0x0042,
            UserDataParamItem::request(FunctionGroup::BlockFunctions, block_subfunction::BLOCK_INFO),
            &encode_block_info_request(BlockType::Db, 100),
        );
        let (_, pdu) = S7Pdu::parse(&raw, &raw, &()).unwrap();
        let (param, payload) = parse_userdata(&pdu).unwrap();
        assert_eq!(param.group, FunctionGroup::BlockFunctions);
        assert_eq!(param.subfunction, block_subfunction::BLOCK_INFO);
        assert_eq!(payload.data, &b"0A00100A"[..]);
    }

    #[test]
    fn empty_request_payload_is_marked_absent() {
        let raw = build_userdata(
            1,
            UserDataParamItem::request(FunctionGroup::TimeFunctions, time_subfunction::READ_CLOCK),
            &[],
        );
        let (_, pdu) = S7Pdu::parse(&raw, &raw, &()).unwrap();
        let (_, payload) = parse_userdata(&pdu).unwrap();
        assert_eq!(payload.return_code, ReturnCode::ObjectDoesNotExist);
        assert!(payload.data.is_empty());
    }

    #[test]
    fn block_info_round_trip() {
        let info = PlcBlockInfo {
            block_type: BlockType::Db,
            block_number: 100,
            language: 5,
            flags: 0x01,
            load_size: 1024,
            code_size: 256,
            local_data_size: 0,
            author: "s7link".to_string(),
            family: "tests".to_string(),
            name: "DB_100".to_string(),
            version: 0x21,
            checksum: 0xBEEF,
            code_timestamp: NaiveDate::from_ymd_opt(2019, 6, 1)
                .unwrap()
                .and_hms_opt(10, 30, 0),
            interface_timestamp: None,
        };
        let parsed = PlcBlockInfo::parse(&info.encode()).unwrap();
        assert_eq!(parsed.block_number, 100);
        assert_eq!(parsed.author, "s7link");
        assert_eq!(parsed.code_size, 256);
        assert_eq!(parsed.code_timestamp, info.code_timestamp);
        assert_eq!(parsed.interface_timestamp, None);
    }

    #[test]
    fn pending_alarm_entries_round_trip() {
        let alarms = vec![
            PlcAlarm {
                event_id: 0x0001_0002,
                event_state: 1,
                ack_state_going: 0,
                ack_state_coming: 1,
                extra: Bytes::from_static(&[0xDE, 0xAD]),
            },
            PlcAlarm {
                event_id: 7,
                event_state: 0,
                ack_state_going: 0,
                ack_state_coming: 0,
                extra: Bytes::new(),
            },
        ];
        let mut data = BytesMut::new();
        for a in &alarms {
            data.put_slice(&encode_alarm_entry(a));
        }
        let parsed = parse_pending_alarms(&data).unwrap();
        assert_eq!(parsed, alarms);
    }

    #[test]
    fn truncated_alarm_entry_is_rejected() {
        let mut data = BytesMut::new();
        data.put_slice(&encode_alarm_entry(&PlcAlarm {
            event_id: 1,
            event_state: 0,
            ack_state_going: 0,
            ack_state_coming: 0,
            extra: Bytes::new(),
        }));
        data.put_u8(0x40); // claims 64 bytes, nothing follows
        assert!(parse_pending_alarms(&data).is_err());
    }

    #[test]
    fn clock_round_trip() {
        let dt = NaiveDate::from_ymd_opt(2023, 11, 5)
            .unwrap()
            .and_hms_milli_opt(8, 15, 42, 0)
            .unwrap();
        assert_eq!(decode_clock(&encode_clock(&dt)).unwrap(), dt);
    }
}
