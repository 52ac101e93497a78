//! High-level client: text tags in, values out.

use crate::error::{Error, Result};
use crate::frame::{
    userdata::BlockType, AlarmNotification, PlcAlarm, PlcBlockInfo, ReadItem, ReturnCode,
    WriteItem,
};
use crate::planner::ReadResult;
use crate::session::{self, ConnectOptions, ConnectionState, Session, SessionEvent};
use crate::tag::{parse_tag, TagAddress};
use bytes::Bytes;
use chrono::NaiveDateTime;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;

/// One PLC connection with tag-level read/write operations.
///
/// ```no_run
/// use s7link::{ConnectOptions, S7Client};
///
/// # async fn demo() -> Result<(), s7link::Error> {
/// let client = S7Client::connect(ConnectOptions::for_host("192.168.0.10")).await?;
/// let values = client.read(&["DB1.0,w,4", "M10.2,x"]).await?;
/// println!("{:?}", values[0].data);
/// client.disconnect().await;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct S7Client {
    session: Arc<Session>,
    driver_task: tokio::task::JoinHandle<()>,
    registered: Mutex<HashMap<String, TagAddress>>,
}

impl S7Client {
    /// Dial, handshake and negotiate session parameters.
    pub async fn connect(options: ConnectOptions) -> Result<Self> {
        let open_deadline = options.open_timeout();
        let (session, driver) = session::create(options);
        let driver_task = driver.spawn();
        let opened = timeout(open_deadline, session.wait_opened())
            .await
            .map_err(|_| Error::Timeout { pdu_ref: None })?;
        if !opened {
            driver_task.abort();
            return Err(Error::NotConnected);
        }
        Ok(Self {
            session,
            driver_task,
            registered: Mutex::new(HashMap::new()),
        })
    }

    /// Access the underlying session (events, raw item operations).
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn state(&self) -> ConnectionState {
        self.session.current_state()
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<SessionEvent> {
        self.session.subscribe_events()
    }

    async fn resolve(&self, tag: &str) -> Result<TagAddress> {
        if let Some(address) = self.registered.lock().await.get(tag) {
            return Ok(*address);
        }
        parse_tag(tag)
    }

    /// Read a batch of tags; results come back in input order.
    pub async fn read(&self, tags: &[&str]) -> Result<Vec<ReadResult>> {
        let mut items = Vec::with_capacity(tags.len());
        for tag in tags {
            items.push(self.resolve(tag).await?.to_read_item());
        }
        self.session.read_items(&items).await
    }

    /// Read pre-parsed items.
    pub async fn read_items(&self, items: &[ReadItem]) -> Result<Vec<ReadResult>> {
        self.session.read_items(items).await
    }

    /// Write a batch of `(tag, data)` pairs; returns one code per pair.
    pub async fn write(&self, writes: &[(&str, Bytes)]) -> Result<Vec<ReturnCode>> {
        let mut items = Vec::with_capacity(writes.len());
        for (tag, data) in writes {
            let address = self.resolve(tag).await?;
            let expected = address.to_read_item().wire_len();
            if data.len() != expected {
                return Err(Error::InvalidConfiguration("write data length"));
            }
            items.push(WriteItem::new(address.to_read_item(), data.clone()));
        }
        self.session.write_items(&items).await
    }

    /// Write pre-parsed items.
    pub async fn write_items(&self, items: &[WriteItem]) -> Result<Vec<ReturnCode>> {
        self.session.write_items(items).await
    }

    /// Cache tag parses. Registration is client-side bookkeeping only; the
    /// protocol has no wire registration.
    pub async fn register(&self, tags: &[&str]) -> Result<()> {
        let mut parsed = Vec::with_capacity(tags.len());
        for tag in tags {
            parsed.push((tag.to_string(), parse_tag(tag)?));
        }
        let mut registered = self.registered.lock().await;
        registered.extend(parsed);
        Ok(())
    }

    /// Drop cached parses.
    pub async fn unregister(&self, tags: &[&str]) {
        let mut registered = self.registered.lock().await;
        for tag in tags {
            registered.remove(*tag);
        }
    }

    pub async fn read_block_info(
        &self,
        block_type: BlockType,
        block_number: u16,
    ) -> Result<PlcBlockInfo> {
        self.session.read_block_info(block_type, block_number).await
    }

    pub async fn read_pending_alarms(&self) -> Result<Vec<PlcAlarm>> {
        self.session.read_pending_alarms().await
    }

    pub async fn subscribe_alarms(&self) -> Result<mpsc::UnboundedReceiver<AlarmNotification>> {
        self.session.subscribe_alarms().await
    }

    pub async fn unsubscribe_alarms(&self) -> Result<()> {
        self.session.unsubscribe_alarms().await
    }

    pub async fn read_clock(&self) -> Result<NaiveDateTime> {
        self.session.read_clock().await
    }

    /// Close the connection and stop the driver.
    pub async fn disconnect(self) {
        self.session.close().await;
        self.driver_task.abort();
    }
}
