/*!
Asynchronous Siemens S7 client over ISO-on-TCP (RFC 1006).

The crate speaks the S7 protocol to PLCs of the S7-300/400/1200/1500
families: batched reads and writes addressed by a compact textual tag
notation, block metadata queries, pending-alarm queries and subscriptions,
and the PLC wall clock. Requests are multiplexed over one connection and
correlated by PDU reference; the job credit granted by the PLC in the
COMM-SETUP handshake bounds how many may be outstanding at once.

# Example

```no_run
use s7link::{ConnectOptions, S7Client};

# async fn demo() -> Result<(), s7link::Error> {
let client = S7Client::connect(ConnectOptions::for_host("192.168.0.10")).await?;

// three logical reads, packed into as few request PDUs as fit
let values = client.read(&["DB1.0,w,4", "DB1.64,r,2", "M10.2,x"]).await?;
for value in &values {
    println!("{:?} -> {:02X?}", value.return_code, &value.data[..]);
}

client.disconnect().await;
# Ok(())
# }
```
*/

pub mod client;
pub mod codec;
pub mod error;
pub mod frame;
pub mod planner;
pub mod refid;
pub mod session;
pub mod tag;

pub use client::S7Client;
pub use error::{Error, Result};
pub use frame::{
    AlarmNotification, BlockType, ConnectionType, PlcAlarm, PlcArea, PlcBlockInfo, ReadItem,
    ReturnCode, VarType, WriteItem,
};
pub use planner::ReadResult;
pub use session::{ConnectOptions, ConnectionState, Session, SessionEvent};
pub use tag::{parse_tag, TagAddress};
