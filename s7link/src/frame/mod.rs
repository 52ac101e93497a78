pub mod comm;
pub mod cotp;
pub mod header;
pub mod item;
pub mod tpkt;
pub mod types;
pub mod userdata;

use bytes::{BufMut, Bytes};

/// Unified wire encoding trait across layers
pub trait WireEncode {
    type Error: std::fmt::Debug + Send + Sync + 'static;
    type Context;

    fn encoded_len(&self, ctx: &Self::Context) -> usize;
    fn encode_to<B: BufMut>(&self, dst: &mut B, ctx: &Self::Context) -> Result<(), Self::Error>;
}

/// Unified zero-copy wire decoding trait across layers
pub trait WireDecode: Sized {
    type Error: std::fmt::Debug + Send + Sync + 'static;
    type Context;

    /// Parse from `input`, returning the remaining slice and the parsed value.
    /// `parent` is used to permit zero-copy `Bytes::slice_ref` construction.
    fn parse<'a>(
        input: &'a [u8],
        parent: &Bytes,
        ctx: &Self::Context,
    ) -> Result<(&'a [u8], Self), Self::Error>;
}

pub use comm::CommSetup;
pub use cotp::{remote_tsap, Cotp, CotpConnectParams, CotpDataParams, CotpDisconnectParams};
pub use header::{S7Header, S7Pdu};
pub use item::{
    build_read_job, build_write_job, DataItemIter, DataItemRef, ReadItem, StatusItemIter,
    WriteItem,
};
pub use tpkt::Tpkt;
pub use types::{
    ConnectionType, DataTransport, Function, FunctionGroup, PduType, PlcArea, ReturnCode,
    UserDataMethod, VarType,
};
pub use userdata::{
    AlarmNotification, BlockType, PlcAlarm, PlcBlockInfo, UserDataParamItem, UserDataParamTail,
};
