use chrono::{NaiveDate, NaiveDateTime};
use serde_repr::{Deserialize_repr, Serialize_repr};

/// S7 memory class addressed by a request item.
///
/// The wire code is distinct from the text grammar; `DataBlock` carries the
/// block number that the address item encodes in its own field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlcArea {
    /// Process inputs (I/E)
    InputByte,
    /// Flag memory / Merker (M)
    FlagByte,
    /// Process outputs (Q/A)
    OutputByte,
    /// Timers (T)
    Timer,
    /// Counters (C/Z)
    Counter,
    /// Data block storage (DBn)
    DataBlock(u16),
}

impl PlcArea {
    #[inline]
    pub fn wire_code(self) -> u8 {
        match self {
            PlcArea::InputByte => 0x81,
            PlcArea::OutputByte => 0x82,
            PlcArea::FlagByte => 0x83,
            PlcArea::DataBlock(_) => 0x84,
            PlcArea::Counter => 0x1C,
            PlcArea::Timer => 0x1D,
        }
    }

    /// Data block number carried in the address item; 0 for non-DB areas.
    #[inline]
    pub fn db_number(self) -> u16 {
        match self {
            PlcArea::DataBlock(n) => n,
            _ => 0,
        }
    }

    pub fn from_wire(code: u8, db_number: u16) -> Option<Self> {
        match code {
            0x81 => Some(PlcArea::InputByte),
            0x82 => Some(PlcArea::OutputByte),
            0x83 => Some(PlcArea::FlagByte),
            0x84 => Some(PlcArea::DataBlock(db_number)),
            0x1C => Some(PlcArea::Counter),
            0x1D => Some(PlcArea::Timer),
            _ => None,
        }
    }
}

/// Variable type selected by the tag grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VarType {
    Bit,
    Byte,
    Char,
    Word,
    DWord,
    Int16,
    Int32,
    Float32,
    String,
}

impl VarType {
    /// Transport size code used in address items. Timer/Counter areas
    /// override this with their own area code.
    #[inline]
    pub fn transport_code(self) -> u8 {
        match self {
            VarType::Bit => 0x01,
            VarType::Byte | VarType::String => 0x02,
            VarType::Char => 0x03,
            VarType::Word => 0x04,
            VarType::Int16 => 0x05,
            VarType::DWord => 0x06,
            VarType::Int32 => 0x07,
            VarType::Float32 => 0x08,
        }
    }

    /// Size in bytes of one element. Bits occupy one byte on the wire.
    #[inline]
    pub fn element_len(self) -> usize {
        match self {
            VarType::Bit | VarType::Byte | VarType::Char | VarType::String => 1,
            VarType::Word | VarType::Int16 => 2,
            VarType::DWord | VarType::Int32 | VarType::Float32 => 4,
        }
    }

    /// Total wire length in bytes for `count` elements. Strings carry a
    /// two-byte max/actual header in front of the payload.
    #[inline]
    pub fn wire_len(self, count: u16) -> usize {
        match self {
            VarType::String => count as usize + 2,
            _ => count as usize * self.element_len(),
        }
    }
}

/// S7 PDU kinds
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PduType {
    Job = 0x01,
    Ack = 0x02,
    AckData = 0x03,
    UserData = 0x07,
}

impl TryFrom<u8> for PduType {
    type Error = ();
    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0x01 => Ok(PduType::Job),
            0x02 => Ok(PduType::Ack),
            0x03 => Ok(PduType::AckData),
            0x07 => Ok(PduType::UserData),
            _ => Err(()),
        }
    }
}

/// S7 function codes carried as the first parameter byte
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    /// UserData parameter head
    CpuService = 0x00,
    Read = 0x04,
    Write = 0x05,
    StartUpload = 0x1D,
    Upload = 0x1E,
    EndUpload = 0x1F,
    CommSetup = 0xF0,
}

impl TryFrom<u8> for Function {
    type Error = ();
    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0x00 => Ok(Function::CpuService),
            0x04 => Ok(Function::Read),
            0x05 => Ok(Function::Write),
            0x1D => Ok(Function::StartUpload),
            0x1E => Ok(Function::Upload),
            0x1F => Ok(Function::EndUpload),
            0xF0 => Ok(Function::CommSetup),
            _ => Err(()),
        }
    }
}

/// Per-item return code in Ack payloads. 0xFF denotes success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnCode {
    Reserved,
    Success,
    HardwareFault,
    AccessDenied,
    AddressOutOfRange,
    DataTypeNotSupported,
    DataTypeInconsistent,
    ObjectDoesNotExist,
    ObjectNotAvailable,
    Unknown(u8),
}

impl From<u8> for ReturnCode {
    fn from(v: u8) -> Self {
        match v {
            0x00 => ReturnCode::Reserved,
            0xFF => ReturnCode::Success,
            0x01 => ReturnCode::HardwareFault,
            0x03 => ReturnCode::AccessDenied,
            0x05 => ReturnCode::AddressOutOfRange,
            0x06 => ReturnCode::DataTypeNotSupported,
            0x07 => ReturnCode::DataTypeInconsistent,
            0x0A => ReturnCode::ObjectDoesNotExist,
            0x0B => ReturnCode::ObjectNotAvailable,
            other => ReturnCode::Unknown(other),
        }
    }
}

impl From<ReturnCode> for u8 {
    fn from(value: ReturnCode) -> Self {
        match value {
            ReturnCode::Reserved => 0x00,
            ReturnCode::Success => 0xFF,
            ReturnCode::HardwareFault => 0x01,
            ReturnCode::AccessDenied => 0x03,
            ReturnCode::AddressOutOfRange => 0x05,
            ReturnCode::DataTypeNotSupported => 0x06,
            ReturnCode::DataTypeInconsistent => 0x07,
            ReturnCode::ObjectDoesNotExist => 0x0A,
            ReturnCode::ObjectNotAvailable => 0x0B,
            ReturnCode::Unknown(v) => v,
        }
    }
}

impl ReturnCode {
    #[inline]
    pub fn is_success(self) -> bool {
        matches!(self, ReturnCode::Success)
    }
}

/// Transport discriminator of data items (distinct from address-item codes).
/// Governs whether the item's length field counts bits or bytes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataTransport {
    Null = 0x00,
    Bit = 0x03,
    ByteWordDWord = 0x04,
    Integer = 0x05,
    DInteger = 0x06,
    Real = 0x07,
    OctetString = 0x09,
}

impl TryFrom<u8> for DataTransport {
    type Error = ();
    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0x00 => Ok(DataTransport::Null),
            0x03 => Ok(DataTransport::Bit),
            0x04 => Ok(DataTransport::ByteWordDWord),
            0x05 => Ok(DataTransport::Integer),
            0x06 => Ok(DataTransport::DInteger),
            0x07 => Ok(DataTransport::Real),
            0x09 => Ok(DataTransport::OctetString),
            _ => Err(()),
        }
    }
}

impl DataTransport {
    /// Convert the raw length field into a byte count.
    #[inline]
    pub fn len_in_bytes(self, len_field: u16) -> usize {
        match self {
            // length declared in bits
            DataTransport::Null | DataTransport::ByteWordDWord | DataTransport::Integer => {
                (len_field as usize) / 8
            }
            // length declared in bytes
            DataTransport::Bit
            | DataTransport::DInteger
            | DataTransport::Real
            | DataTransport::OctetString => len_field as usize,
        }
    }

    /// Encode a byte count into the raw length field.
    #[inline]
    pub fn len_field(self, bytes: usize) -> u16 {
        match self {
            DataTransport::Null | DataTransport::ByteWordDWord | DataTransport::Integer => {
                (bytes * 8) as u16
            }
            _ => bytes as u16,
        }
    }
}

/// UserData function group (low nibble of the type/group byte)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionGroup {
    ModeTransition = 0x00,
    ProgrammerCommands = 0x01,
    CyclicServices = 0x02,
    BlockFunctions = 0x03,
    CpuFunctions = 0x04,
    SecurityFunctions = 0x05,
    TimeFunctions = 0x07,
}

impl TryFrom<u8> for FunctionGroup {
    type Error = ();
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(FunctionGroup::ModeTransition),
            0x01 => Ok(FunctionGroup::ProgrammerCommands),
            0x02 => Ok(FunctionGroup::CyclicServices),
            0x03 => Ok(FunctionGroup::BlockFunctions),
            0x04 => Ok(FunctionGroup::CpuFunctions),
            0x05 => Ok(FunctionGroup::SecurityFunctions),
            0x07 => Ok(FunctionGroup::TimeFunctions),
            _ => Err(()),
        }
    }
}

/// UserData method discriminator (high nibble of the type/group byte)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserDataMethod {
    /// Unsolicited indication pushed by the PLC
    Push = 0x00,
    Request = 0x04,
    Response = 0x08,
}

impl TryFrom<u8> for UserDataMethod {
    type Error = ();
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(UserDataMethod::Push),
            0x04 => Ok(UserDataMethod::Request),
            0x08 => Ok(UserDataMethod::Response),
            _ => Err(()),
        }
    }
}

/// COTP connection profile; selects the remote TSAP role octet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum ConnectionType {
    /// Programming-device association (default)
    Pg = 0x01,
    /// Operator-panel association
    Op = 0x02,
    /// Generic data-transfer association
    Basic = 0x03,
}

impl Default for ConnectionType {
    fn default() -> Self {
        ConnectionType::Pg
    }
}

// ===== BCD / timestamp helpers =====

/// Convert one BCD-encoded byte to decimal 0..=99
#[inline]
pub(crate) fn bcd_to_dec(b: u8) -> u8 {
    ((b >> 4) & 0x0F) * 10 + (b & 0x0F)
}

/// Decode 8-byte S7 DATE_AND_TIME (BCD) into `NaiveDateTime`
pub(crate) fn decode_datetime8(bytes: &[u8]) -> Option<NaiveDateTime> {
    if bytes.len() < 8 {
        return None;
    }
    let yy = bcd_to_dec(bytes[0]) as i32;
    let year = if yy < 90 { 2000 + yy } else { 1900 + yy };
    let month = bcd_to_dec(bytes[1]) as u32;
    let day = bcd_to_dec(bytes[2]) as u32;
    let hour = bcd_to_dec(bytes[3]) as u32;
    let minute = bcd_to_dec(bytes[4]) as u32;
    let second = bcd_to_dec(bytes[5]) as u32;
    let ms_low = bcd_to_dec(bytes[6]) as u32;
    let hundreds = ((bytes[7] >> 4) & 0x0F) as u32;
    let millis = hundreds * 100 + ms_low;
    let date = NaiveDate::from_ymd_opt(year, month, day)?;
    date.and_hms_milli_opt(hour, minute, second, millis)
}

/// Encode a `NaiveDateTime` as 8-byte S7 DATE_AND_TIME (BCD), day-of-week 0.
pub(crate) fn encode_datetime8(dt: &NaiveDateTime) -> [u8; 8] {
    use chrono::{Datelike, Timelike};
    #[inline]
    fn dec_to_bcd(v: u8) -> u8 {
        ((v / 10) << 4) | (v % 10)
    }
    let yy = (dt.year() % 100) as u8;
    let millis = dt.and_utc().timestamp_subsec_millis();
    [
        dec_to_bcd(yy),
        dec_to_bcd(dt.month() as u8),
        dec_to_bcd(dt.day() as u8),
        dec_to_bcd(dt.hour() as u8),
        dec_to_bcd(dt.minute() as u8),
        dec_to_bcd(dt.second() as u8),
        dec_to_bcd((millis % 100) as u8),
        ((millis / 100) as u8) << 4,
    ]
}

/// Decode a 6-byte block timestamp (milliseconds u32 + days u16 since
/// 1984-01-01) into `NaiveDateTime`.
pub(crate) fn decode_block_timestamp(bytes: &[u8]) -> Option<NaiveDateTime> {
    if bytes.len() < 6 {
        return None;
    }
    let millis = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let days = u16::from_be_bytes([bytes[4], bytes[5]]);
    if millis == 0 && days == 0 {
        return None;
    }
    let base = NaiveDate::from_ymd_opt(1984, 1, 1)?;
    let date = base.checked_add_signed(chrono::Duration::days(days as i64))?;
    let time = chrono::NaiveTime::from_num_seconds_from_midnight_opt(
        millis / 1000,
        (millis % 1000) * 1_000_000,
    )?;
    Some(NaiveDateTime::new(date, time))
}

/// Convert Latin-1 bytes to a `String` by widening each byte.
pub(crate) fn latin1_bytes_to_string(input: &[u8]) -> String {
    input.iter().map(|&b| b as char).collect()
}
