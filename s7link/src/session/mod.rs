//! Connection driver and request dispatcher.
//!
//! One driver task per connection owns the framed transport, the session
//! context and the in-flight tables. User calls hand encoded PDUs through a
//! request channel and await a oneshot completion; responses are matched
//! strictly by PDU reference. Back-pressure comes from a semaphore sized to
//! the job credit granted in the COMM-SETUP handshake.

mod handshake;
mod state;

pub use state::{ConnectOptions, ConnectionState, SessionContext, SessionEvent};

use crate::codec::{IsoCodec, IsoFrame};
use crate::error::{Error, Result};
use crate::frame::{
    userdata::{
        build_userdata, cpu_subfunction, decode_clock, encode_alarm_subscription,
        encode_block_info_request, parse_pending_alarms, parse_userdata, block_subfunction,
        time_subfunction, BlockType,
    },
    AlarmNotification, CommSetup, Cotp, DataItemIter, Function, FunctionGroup, PduType, PlcAlarm,
    PlcBlockInfo, ReadItem, ReturnCode, S7Pdu, StatusItemIter, UserDataParamItem, WireDecode,
    WriteItem,
};
use crate::planner::{plan_read, plan_write, ReadResult};
use crate::refid::PduRefGenerator;
use arc_swap::ArcSwapOption;
use bytes::{Bytes, BytesMut};
use chrono::NaiveDateTime;
use futures::future::try_join_all;
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::{broadcast, mpsc, oneshot, watch, OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep, timeout, Instant};
use tokio_util::{codec::Framed, sync::CancellationToken};
use tracing::{debug, trace, warn};

/// Which in-flight table a request belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobClass {
    Read,
    Write,
    BlockInfo,
    Alarm,
}

/// Request handed from an API call to the driver task.
#[derive(Debug)]
struct SessionRequest {
    class: JobClass,
    pdu_ref: u16,
    payload: Bytes,
    timeout: Duration,
    response_tx: oneshot::Sender<Result<S7Pdu>>,
    permit: OwnedSemaphorePermit,
}

/// Entry stored per in-flight request. Dropping it releases the job credit.
#[derive(Debug)]
struct PendingCall {
    tx: oneshot::Sender<Result<S7Pdu>>,
    _permit: OwnedSemaphorePermit,
}

/// Caller-side guard for one registered call. When the caller stops waiting
/// (its future is dropped mid-await), the guard tells the driver to remove
/// the table entry right away, releasing the held credit instead of letting
/// it sit until the natural timeout.
#[derive(Debug)]
struct CancelGuard {
    tx: Option<Arc<mpsc::UnboundedSender<(JobClass, u16)>>>,
    class: JobClass,
    pdu_ref: u16,
    armed: bool,
}

impl CancelGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Some(tx) = &self.tx {
                let _ = tx.send((self.class, self.pdu_ref));
            }
        }
    }
}

/// The four in-flight tables, keyed by PDU reference.
#[derive(Debug, Default)]
struct InflightTables {
    read: HashMap<u16, PendingCall>,
    write: HashMap<u16, PendingCall>,
    block_info: HashMap<u16, PendingCall>,
    alarm: HashMap<u16, PendingCall>,
}

impl InflightTables {
    fn table_mut(&mut self, class: JobClass) -> &mut HashMap<u16, PendingCall> {
        match class {
            JobClass::Read => &mut self.read,
            JobClass::Write => &mut self.write,
            JobClass::BlockInfo => &mut self.block_info,
            JobClass::Alarm => &mut self.alarm,
        }
    }

    /// Remove by reference across all tables; used for error acks that
    /// arrive without a parameter block to classify by.
    fn resolve_any(&mut self, pdu_ref: u16) -> Option<PendingCall> {
        for table in [
            &mut self.read,
            &mut self.write,
            &mut self.block_info,
            &mut self.alarm,
        ] {
            if let Some(call) = table.remove(&pdu_ref) {
                return Some(call);
            }
        }
        None
    }

    fn drain(&mut self) -> Vec<PendingCall> {
        let mut all = Vec::new();
        for table in [
            &mut self.read,
            &mut self.write,
            &mut self.block_info,
            &mut self.alarm,
        ] {
            all.extend(table.drain().map(|(_, call)| call));
        }
        all
    }

    fn is_empty(&self) -> bool {
        self.read.is_empty()
            && self.write.is_empty()
            && self.block_info.is_empty()
            && self.alarm.is_empty()
    }
}

/// Shared handle for issuing requests against one PLC connection.
#[derive(Debug)]
pub struct Session {
    options: Arc<ConnectOptions>,
    request_tx: ArcSwapOption<mpsc::Sender<SessionRequest>>,
    cancel: CancellationToken,
    events_tx: broadcast::Sender<SessionEvent>,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    semaphore: ArcSwapOption<Semaphore>,
    context: ArcSwapOption<SessionContext>,
    refgen: PduRefGenerator,
    alarm_slot: ArcSwapOption<mpsc::UnboundedSender<AlarmNotification>>,
    cancel_call_tx: ArcSwapOption<mpsc::UnboundedSender<(JobClass, u16)>>,
}

/// Create a session handle plus the driver that owns its transport.
pub fn create(options: ConnectOptions) -> (Arc<Session>, SessionDriver) {
    let options = Arc::new(options);
    let (events_tx, _) = broadcast::channel(256);
    let (state_tx, state_rx) = watch::channel(ConnectionState::Closed);
    let session = Arc::new(Session {
        options: Arc::clone(&options),
        request_tx: ArcSwapOption::from(None),
        cancel: CancellationToken::new(),
        events_tx,
        state_tx,
        state_rx,
        semaphore: ArcSwapOption::from(None),
        context: ArcSwapOption::from(None),
        refgen: PduRefGenerator::new(),
        alarm_slot: ArcSwapOption::from(None),
        cancel_call_tx: ArcSwapOption::from(None),
    });
    let driver = SessionDriver {
        session: Arc::clone(&session),
        options,
    };
    (session, driver)
}

impl Session {
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    #[inline]
    pub fn current_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    #[inline]
    pub fn is_opened(&self) -> bool {
        matches!(self.current_state(), ConnectionState::Opened)
    }

    /// Negotiated parameters, once `Opened`.
    pub fn context(&self) -> Option<SessionContext> {
        self.context.load_full().map(|ctx| *ctx)
    }

    /// Wait until the driver reaches `Opened`. Returns false when the
    /// connection attempt collapses back to `Closed` instead.
    pub async fn wait_opened(&self) -> bool {
        let mut rx = self.state_rx.clone();
        if matches!(*rx.borrow_and_update(), ConnectionState::Opened) {
            return true;
        }
        loop {
            if rx.changed().await.is_err() {
                return false;
            }
            match *rx.borrow_and_update() {
                ConnectionState::Opened => return true,
                ConnectionState::Closed => return false,
                _ => {}
            }
        }
    }

    /// Unconditional cancellation of all in-flight work, then a short grace
    /// delay so a subsequent re-open starts from a quiet transport.
    pub async fn close(&self) {
        self.cancel.cancel();
        if let Some(semaphore) = self.semaphore.load_full() {
            semaphore.close();
        }
        let mut rx = self.state_rx.clone();
        let _ = rx
            .wait_for(|s| matches!(*s, ConnectionState::Closed))
            .await;
        sleep(Duration::from_millis(1)).await;
    }

    async fn send_request(&self, class: JobClass, pdu_ref: u16, payload: Bytes) -> Result<S7Pdu> {
        if !self.is_opened() {
            return Err(Error::NotConnected);
        }
        let semaphore = self.semaphore.load_full().ok_or(Error::NotConnected)?;
        let permit = semaphore
            .acquire_owned()
            .await
            .map_err(|_| Error::NotConnected)?;

        let (tx, rx) = oneshot::channel();
        let request = SessionRequest {
            class,
            pdu_ref,
            payload,
            timeout: self.options.receive_timeout(),
            response_tx: tx,
            permit,
        };
        let sender = self.request_tx.load_full().ok_or(Error::NotConnected)?;
        sender
            .send(request)
            .await
            .map_err(|_| Error::NotConnected)?;

        // the guard fires if this future is dropped before the response
        // lands, removing the registered entry and freeing its credit
        let mut guard = CancelGuard {
            tx: self.cancel_call_tx.load_full(),
            class,
            pdu_ref,
            armed: true,
        };
        let result = match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::NotConnected),
        };
        guard.disarm();
        result
    }

    /// Read a batch of logical items; results return in input order.
    pub async fn read_items(&self, items: &[ReadItem]) -> Result<Vec<ReadResult>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let context = self.context().ok_or(Error::NotConnected)?;
        let plan = plan_read(context.plan_limits(), items)?;

        let calls = plan.packages.iter().map(|package| {
            let pdu_ref = self.refgen.next();
            let payload = crate::frame::build_read_job(pdu_ref, &package.items());
            async move {
                let pdu = self.send_request(JobClass::Read, pdu_ref, payload).await?;
                pdu.validate_response()?;
                decode_read_ack(&pdu, package.parts.len())
            }
        });
        // a failing package fails the whole logical read; no partial results
        let responses = try_join_all(calls).await?;
        plan.merge(&responses)
    }

    /// Write a batch of logical items; returns one code per item.
    pub async fn write_items(&self, items: &[WriteItem]) -> Result<Vec<ReturnCode>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let context = self.context().ok_or(Error::NotConnected)?;
        let plan = plan_write(context.plan_limits(), items)?;

        let calls = plan.packages.iter().map(|package| {
            let pdu_ref = self.refgen.next();
            let payload = crate::frame::build_write_job(pdu_ref, &package.items());
            async move {
                let pdu = self.send_request(JobClass::Write, pdu_ref, payload).await?;
                pdu.validate_response()?;
                decode_write_ack(&pdu, package.parts.len())
            }
        });
        let responses = try_join_all(calls).await?;
        plan.merge(&responses)
    }

    /// Query metadata of one PLC block.
    pub async fn read_block_info(
        &self,
        block_type: BlockType,
        block_number: u16,
    ) -> Result<PlcBlockInfo> {
        let pdu_ref = self.refgen.next();
        let raw = build_userdata(
            pdu_ref,
            UserDataParamItem::request(
                FunctionGroup::BlockFunctions,
                block_subfunction::BLOCK_INFO,
            ),
            &encode_block_info_request(block_type, block_number),
        );
        let pdu = self.send_request(JobClass::BlockInfo, pdu_ref, raw).await?;
        let (_, payload) = parse_userdata(&pdu)?;
        if !payload.return_code.is_success() {
            return Err(Error::ProtocolContent {
                return_code: payload.return_code,
                item_index: 0,
            });
        }
        PlcBlockInfo::parse(payload.data)
    }

    /// Fetch the pending alarm list, following continuation pages until the
    /// peer flags the last data unit.
    pub async fn read_pending_alarms(&self) -> Result<Vec<PlcAlarm>> {
        let mut alarms = Vec::new();
        let mut sequence: Option<u8> = None;
        for _page in 0..=u8::MAX as usize {
            let pdu_ref = self.refgen.next();
            let param = match sequence {
                None => UserDataParamItem::request(
                    FunctionGroup::CpuFunctions,
                    cpu_subfunction::ALARM_QUERY,
                ),
                Some(seq) => UserDataParamItem::continuation(
                    FunctionGroup::CpuFunctions,
                    cpu_subfunction::ALARM_QUERY,
                    seq,
                ),
            };
            let raw = build_userdata(pdu_ref, param, &[]);
            let pdu = self.send_request(JobClass::Alarm, pdu_ref, raw).await?;
            let (param, payload) = parse_userdata(&pdu)?;
            if payload.return_code.is_success() {
                alarms.extend(parse_pending_alarms(payload.data)?);
            }
            match param.tail {
                Some(tail) if !tail.last_data_unit => sequence = Some(param.sequence),
                _ => return Ok(alarms),
            }
        }
        Err(Error::Decode {
            context: "pending alarm paging did not terminate",
        })
    }

    /// Enable alarm indications and install the subscription slot. The
    /// returned receiver yields every indication pushed by the PLC.
    pub async fn subscribe_alarms(&self) -> Result<mpsc::UnboundedReceiver<AlarmNotification>> {
        // install the slot first so no indication slips past between the
        // acknowledgement and the installation
        let (tx, rx) = mpsc::unbounded_channel();
        self.alarm_slot.store(Some(Arc::new(tx)));

        let pdu_ref = self.refgen.next();
        let raw = build_userdata(
            pdu_ref,
            UserDataParamItem::request(
                FunctionGroup::CpuFunctions,
                cpu_subfunction::MESSAGE_SERVICE,
            ),
            &encode_alarm_subscription(true),
        );
        let outcome = async {
            let pdu = self.send_request(JobClass::Alarm, pdu_ref, raw).await?;
            let (_, payload) = parse_userdata(&pdu)?;
            if !payload.return_code.is_success() {
                return Err(Error::ProtocolContent {
                    return_code: payload.return_code,
                    item_index: 0,
                });
            }
            Ok(())
        }
        .await;
        if let Err(e) = outcome {
            self.alarm_slot.store(None);
            return Err(e);
        }
        Ok(rx)
    }

    /// Disable alarm indications and clear the subscription slot.
    pub async fn unsubscribe_alarms(&self) -> Result<()> {
        self.alarm_slot.store(None);
        let pdu_ref = self.refgen.next();
        let raw = build_userdata(
            pdu_ref,
            UserDataParamItem::request(
                FunctionGroup::CpuFunctions,
                cpu_subfunction::MESSAGE_SERVICE,
            ),
            &encode_alarm_subscription(false),
        );
        let pdu = self.send_request(JobClass::Alarm, pdu_ref, raw).await?;
        let (_, payload) = parse_userdata(&pdu)?;
        if !payload.return_code.is_success() {
            return Err(Error::ProtocolContent {
                return_code: payload.return_code,
                item_index: 0,
            });
        }
        Ok(())
    }

    /// Read the PLC wall clock.
    pub async fn read_clock(&self) -> Result<NaiveDateTime> {
        let pdu_ref = self.refgen.next();
        let raw = build_userdata(
            pdu_ref,
            UserDataParamItem::request(FunctionGroup::TimeFunctions, time_subfunction::READ_CLOCK),
            &[],
        );
        let pdu = self.send_request(JobClass::BlockInfo, pdu_ref, raw).await?;
        let (_, payload) = parse_userdata(&pdu)?;
        if !payload.return_code.is_success() {
            return Err(Error::ProtocolContent {
                return_code: payload.return_code,
                item_index: 0,
            });
        }
        decode_clock(payload.data)
    }
}

fn decode_read_ack(pdu: &S7Pdu, expected: usize) -> Result<Vec<(ReturnCode, Bytes)>> {
    if pdu.function_byte() != Some(Function::Read as u8) {
        return Err(Error::UnexpectedPdu);
    }
    let count = *pdu.param.get(1).ok_or(Error::InvalidFrame)?;
    if count as usize != expected {
        return Err(Error::InvalidFrame);
    }
    DataItemIter::new(count, &pdu.data)
        .map(|item| {
            let item = item?;
            Ok((item.return_code, Bytes::copy_from_slice(item.data)))
        })
        .collect()
}

fn decode_write_ack(pdu: &S7Pdu, expected: usize) -> Result<Vec<ReturnCode>> {
    if pdu.function_byte() != Some(Function::Write as u8) {
        return Err(Error::UnexpectedPdu);
    }
    let count = *pdu.param.get(1).ok_or(Error::InvalidFrame)?;
    if count as usize != expected {
        return Err(Error::InvalidFrame);
    }
    StatusItemIter::new(count, &pdu.data).collect()
}

/// Route a response PDU to its in-flight table.
fn classify_response(pdu: &S7Pdu) -> Option<JobClass> {
    match pdu.header.pdu_type {
        PduType::Ack | PduType::AckData => match pdu.function_byte() {
            Some(f) if f == Function::Read as u8 => Some(JobClass::Read),
            Some(f) if f == Function::Write as u8 => Some(JobClass::Write),
            _ => None,
        },
        PduType::UserData => match UserDataParamItem::parse_param(&pdu.param) {
            Ok(param) => match param.group {
                FunctionGroup::CpuFunctions => Some(JobClass::Alarm),
                _ => Some(JobClass::BlockInfo),
            },
            Err(_) => None,
        },
        PduType::Job => None,
    }
}

/// Owns the transport for one session; runs until cancelled.
#[derive(Debug)]
pub struct SessionDriver {
    session: Arc<Session>,
    options: Arc<ConnectOptions>,
}

impl SessionDriver {
    /// Dial and drive the connection; with `reconnect` set the transport is
    /// re-dialled after a drop until the session is closed.
    pub async fn run(self) {
        loop {
            publish_state(&self.session, ConnectionState::PendingOpenRfc1006);
            let dialled = timeout(
                self.options.open_timeout(),
                TcpStream::connect((self.options.address.as_str(), self.options.port)),
            )
            .await;
            match dialled {
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(self.options.tcp_nodelay);
                    drive_connection(&self.session, stream, &self.options).await;
                }
                _ => {
                    let _ = self.session.events_tx.send(SessionEvent::TransportError);
                    publish_state(&self.session, ConnectionState::Closed);
                }
            }
            if self.session.cancel.is_cancelled() || !self.options.reconnect {
                break;
            }
            select! {
                _ = self.session.cancel.cancelled() => break,
                _ = sleep(Duration::from_millis(500)) => {}
            }
        }
        publish_state(&self.session, ConnectionState::Closed);
    }

    /// Drive the connection over an already-connected stream (tests, custom
    /// transports). No reconnect.
    pub async fn run_with_stream<S>(self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        publish_state(&self.session, ConnectionState::PendingOpenRfc1006);
        drive_connection(&self.session, stream, &self.options).await;
    }

    /// Run on a background task.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

fn publish_state(session: &Session, state: ConnectionState) {
    if *session.state_rx.borrow() != state {
        let _ = session.state_tx.send(state);
        let _ = session.events_tx.send(SessionEvent::StateChanged(state));
    }
}

/// Handshake plus dispatch loop; publishes `Closed` on every exit path.
async fn drive_connection<S>(session: &Arc<Session>, stream: S, options: &Arc<ConnectOptions>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, IsoCodec);

    if let Err(e) = handshake::open_transport(&mut framed, options).await {
        debug!(error = %e, "transport association failed");
        let _ = session.events_tx.send(SessionEvent::TransportError);
        publish_state(session, ConnectionState::Closed);
        return;
    }
    publish_state(session, ConnectionState::TransportOpened);

    publish_state(session, ConnectionState::PendingOpenPlc);
    let context = match handshake::negotiate(&mut framed, options, session.refgen.next()).await {
        Ok(ctx) => ctx,
        Err(e) => {
            debug!(error = %e, "session negotiation failed");
            let _ = session.events_tx.send(SessionEvent::TransportError);
            publish_state(session, ConnectionState::Closed);
            return;
        }
    };

    session.context.store(Some(Arc::new(context)));
    session
        .semaphore
        .store(Some(Arc::new(Semaphore::new(context.max_am_q_calling as usize))));

    let (request_tx, mut request_rx) = mpsc::channel(options.send_queue_capacity);
    session.request_tx.store(Some(Arc::new(request_tx)));
    let (cancel_call_tx, mut cancel_call_rx) = mpsc::unbounded_channel();
    session.cancel_call_tx.store(Some(Arc::new(cancel_call_tx)));

    publish_state(session, ConnectionState::Opened);

    let (mut sink, mut stream) = framed.split();
    let mut tables = InflightTables::default();
    let mut deadlines = BTreeMap::<Instant, Vec<(JobClass, u16)>>::new();
    let mut reassembly: Option<BytesMut> = None;
    // reusable sleep, reset to the nearest deadline each turn
    let far_future = Duration::from_secs(3600);
    let mut deadline_sleep = Box::pin(sleep(far_future));

    loop {
        match deadlines.keys().next() {
            Some(next) => deadline_sleep.as_mut().reset(*next),
            None => deadline_sleep.as_mut().reset(Instant::now() + far_future),
        }
        select! {
            _ = session.cancel.cancelled() => break,
            request = request_rx.recv() => {
                match request {
                    Some(request) => {
                        dispatch_request(request, &mut sink, &mut tables, &mut deadlines).await;
                    }
                    None => break,
                }
            }
            frame = stream.next() => {
                match frame {
                    Some(Ok(frame)) => {
                        let keep_going = handle_frame(
                            session,
                            frame,
                            &mut sink,
                            &mut tables,
                            &mut reassembly,
                        )
                        .await;
                        if !keep_going {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        debug!(error = %e, "receive failed");
                        let _ = session.events_tx.send(SessionEvent::TransportError);
                        break;
                    }
                    None => {
                        let _ = session.events_tx.send(SessionEvent::TransportError);
                        break;
                    }
                }
            }
            cancelled = cancel_call_rx.recv() => {
                if let Some((class, pdu_ref)) = cancelled {
                    // dropping the entry releases its permit; a late response
                    // for this reference now finds nothing and is warned away
                    if tables.table_mut(class).remove(&pdu_ref).is_some() {
                        debug!(pdu_ref, ?class, "caller cancelled; entry removed, credit released");
                    }
                }
            }
            _ = &mut deadline_sleep => {
                expire_deadlines(&mut tables, &mut deadlines);
            }
        }
    }

    // teardown: every pending completion resolves with the sentinel error
    for call in tables.drain() {
        let _ = call.tx.send(Err(Error::NotConnected));
    }
    debug_assert!(tables.is_empty());
    if session.alarm_slot.load_full().is_some() {
        // best-effort: tell the peer to stop pushing indications
        let pdu_ref = session.refgen.next();
        let raw = build_userdata(
            pdu_ref,
            UserDataParamItem::request(
                FunctionGroup::CpuFunctions,
                cpu_subfunction::MESSAGE_SERVICE,
            ),
            &encode_alarm_subscription(false),
        );
        let _ = sink.send(IsoFrame::data(raw)).await;
        session.alarm_slot.store(None);
    }
    session.request_tx.store(None);
    session.cancel_call_tx.store(None);
    if let Some(semaphore) = session.semaphore.load_full() {
        semaphore.close();
    }
    session.semaphore.store(None);
    publish_state(session, ConnectionState::Closed);
}

async fn dispatch_request<S>(
    request: SessionRequest,
    sink: &mut SplitSink<Framed<S, IsoCodec>, IsoFrame>,
    tables: &mut InflightTables,
    deadlines: &mut BTreeMap<Instant, Vec<(JobClass, u16)>>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if request.payload.len() < 10 {
        let _ = request.response_tx.send(Err(Error::InvalidFrame));
        return;
    }
    if request.response_tx.is_closed() {
        // caller went away before the call was ever registered; dropping the
        // request here drops its permit with it
        trace!(pdu_ref = request.pdu_ref, "caller gone before registration");
        return;
    }
    let SessionRequest {
        class,
        pdu_ref,
        payload,
        timeout,
        response_tx,
        permit,
    } = request;

    tables.table_mut(class).insert(
        pdu_ref,
        PendingCall {
            tx: response_tx,
            _permit: permit,
        },
    );
    deadlines
        .entry(Instant::now() + timeout)
        .or_default()
        .push((class, pdu_ref));
    trace!(pdu_ref, ?class, "request registered");

    if let Err(e) = sink.send(IsoFrame::data(payload)).await {
        debug!(pdu_ref, error = %e, "send failed");
        if let Some(call) = tables.table_mut(class).remove(&pdu_ref) {
            let _ = call.tx.send(Err(Error::NotConnected));
        }
    }
}

/// Returns false when the connection must be torn down.
async fn handle_frame<S>(
    session: &Arc<Session>,
    frame: IsoFrame,
    sink: &mut SplitSink<Framed<S, IsoCodec>, IsoFrame>,
    tables: &mut InflightTables,
    reassembly: &mut Option<BytesMut>,
) -> bool
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match frame.cotp {
        Cotp::D(params) => {
            if !params.eot {
                reassembly
                    .get_or_insert_with(BytesMut::new)
                    .extend_from_slice(&frame.payload);
                return true;
            }
            let whole = match reassembly.take() {
                Some(mut buf) => {
                    buf.extend_from_slice(&frame.payload);
                    buf.freeze()
                }
                None => frame.payload,
            };
            match S7Pdu::parse(&whole, &whole, &()) {
                Ok((_, pdu)) => handle_pdu(session, pdu, sink, tables).await,
                Err(_) => {
                    let _ = session.events_tx.send(SessionEvent::ReassemblyDrop);
                }
            }
            true
        }
        Cotp::Dr(_) => {
            debug!("peer requested disconnect");
            false
        }
        other => {
            trace!(?other, "ignoring non-data TPDU");
            true
        }
    }
}

async fn handle_pdu<S>(
    session: &Arc<Session>,
    pdu: S7Pdu,
    sink: &mut SplitSink<Framed<S, IsoCodec>, IsoFrame>,
    tables: &mut InflightTables,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // peer-initiated COMM-SETUP: acknowledge, adopt, re-open
    if pdu.header.pdu_type == PduType::Job
        && pdu.function_byte() == Some(Function::CommSetup as u8)
    {
        if let Ok(setup) = CommSetup::parse_param(&pdu.param) {
            let granted = CommSetup {
                max_am_q_calling: setup.max_am_q_calling,
                max_am_q_called: setup.max_am_q_called,
                pdu_size: setup.pdu_size,
            };
            let _ = sink
                .send(IsoFrame::data(granted.build_ack(pdu.header.pdu_ref)))
                .await;
            let timeout = session
                .context()
                .map(|c| c.timeout)
                .unwrap_or_else(|| session.options.receive_timeout());
            session.context.store(Some(Arc::new(SessionContext {
                timeout,
                pdu_size: setup.pdu_size,
                max_am_q_calling: setup.max_am_q_calling,
                max_am_q_called: setup.max_am_q_called,
            })));
            session.semaphore.store(Some(Arc::new(Semaphore::new(
                setup.max_am_q_calling as usize,
            ))));
            let _ = session.events_tx.send(SessionEvent::Renegotiated);
            publish_state(session, ConnectionState::Opened);
        }
        return;
    }

    // reference zero is reserved for unsolicited indications
    if pdu.header.pdu_ref == 0 && pdu.header.pdu_type == PduType::UserData {
        match parse_userdata(&pdu) {
            Ok((param, payload)) => {
                let notification = AlarmNotification {
                    subfunction: param.subfunction,
                    sequence: param.sequence,
                    data: Bytes::copy_from_slice(payload.data),
                };
                let delivered = session
                    .alarm_slot
                    .load_full()
                    .map(|tx| tx.send(notification).is_ok())
                    .unwrap_or(false);
                if !delivered {
                    let _ = session.events_tx.send(SessionEvent::IndicationDropped);
                }
            }
            Err(_) => {
                let _ = session.events_tx.send(SessionEvent::ReassemblyDrop);
            }
        }
        return;
    }

    let call = match classify_response(&pdu) {
        Some(class) => tables.table_mut(class).remove(&pdu.header.pdu_ref),
        // error acks can arrive without a parameter block; match by reference
        None if pdu.param.is_empty()
            && matches!(pdu.header.pdu_type, PduType::Ack | PduType::AckData) =>
        {
            tables.resolve_any(pdu.header.pdu_ref)
        }
        // unknown functions resolve nothing
        None => {
            trace!(
                pdu_ref = pdu.header.pdu_ref,
                "ignoring PDU with unknown function"
            );
            return;
        }
    };
    match call {
        Some(call) => {
            if call.tx.send(Ok(pdu)).is_err() {
                warn!("caller cancelled; dropping late response");
            }
        }
        None => {
            warn!(
                pdu_ref = pdu.header.pdu_ref,
                "dropping response with no pending call"
            );
        }
    }
}

fn expire_deadlines(
    tables: &mut InflightTables,
    deadlines: &mut BTreeMap<Instant, Vec<(JobClass, u16)>>,
) {
    let now = Instant::now();
    let expired: Vec<Instant> = deadlines
        .keys()
        .take_while(|deadline| **deadline <= now)
        .copied()
        .collect();
    for key in expired {
        if let Some(entries) = deadlines.remove(&key) {
            for (class, pdu_ref) in entries {
                if let Some(call) = tables.table_mut(class).remove(&pdu_ref) {
                    warn!(pdu_ref, ?class, "request timed out");
                    let _ = call.tx.send(Err(Error::Timeout {
                        pdu_ref: Some(pdu_ref),
                    }));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{
        item::{build_read_ack, build_write_ack},
        userdata::{encode_alarm_entry, encode_clock},
        CotpConnectParams, PlcArea, VarType,
    };
    use tokio::io::{duplex, DuplexStream};

    fn test_options() -> ConnectOptions {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_target(false)
            .without_time()
            .try_init();
        ConnectOptions {
            receive_timeout_ms: 2_000,
            ..ConnectOptions::default()
        }
    }

    /// Accept the COTP + COMM-SETUP handshake on the peer side.
    async fn accept_handshake(
        framed: &mut Framed<DuplexStream, IsoCodec>,
        pdu_size: u16,
        max_jobs: u16,
    ) {
        let frame = framed.next().await.unwrap().unwrap();
        assert!(matches!(frame.cotp, Cotp::Cr(_)));
        framed
            .send(IsoFrame::control(Cotp::Cc(CotpConnectParams::default())))
            .await
            .unwrap();

        let frame = framed.next().await.unwrap().unwrap();
        let (_, pdu) = S7Pdu::parse(&frame.payload, &frame.payload, &()).unwrap();
        let request = CommSetup::parse_param(&pdu.param).unwrap();
        let granted = CommSetup {
            max_am_q_calling: max_jobs.min(request.max_am_q_calling),
            max_am_q_called: max_jobs.min(request.max_am_q_called),
            pdu_size: pdu_size.min(request.pdu_size),
        };
        framed
            .send(IsoFrame::data(granted.build_ack(pdu.header.pdu_ref)))
            .await
            .unwrap();
    }

    /// Receive one S7 job PDU from the client.
    async fn recv_pdu(framed: &mut Framed<DuplexStream, IsoCodec>) -> S7Pdu {
        let frame = framed.next().await.unwrap().unwrap();
        let (_, pdu) = S7Pdu::parse(&frame.payload, &frame.payload, &()).unwrap();
        pdu
    }

    fn spawn_session(
        options: ConnectOptions,
    ) -> (Arc<Session>, Framed<DuplexStream, IsoCodec>) {
        let (client_io, server_io) = duplex(64 * 1024);
        let (session, driver) = create(options);
        tokio::spawn(driver.run_with_stream(client_io));
        (session, Framed::new(server_io, IsoCodec))
    }

    fn db_read(db: u16, offset: u32, count: u16) -> ReadItem {
        ReadItem {
            area: PlcArea::DataBlock(db),
            offset,
            var_type: VarType::Byte,
            count,
        }
    }

    #[tokio::test]
    async fn open_negotiates_and_close_disposes() {
        let (session, mut plc) = spawn_session(test_options());
        let mut events = session.subscribe_events();

        let server = tokio::spawn(async move {
            accept_handshake(&mut plc, 480, 4).await;
            plc
        });
        assert!(session.wait_opened().await);
        let _plc = server.await.unwrap();

        let context = session.context().unwrap();
        assert_eq!(context.pdu_size, 480);
        assert_eq!(context.max_am_q_calling, 4);
        assert_eq!(context.read_item_max_length(), 462);
        assert_eq!(
            session.semaphore.load_full().unwrap().available_permits(),
            4
        );

        // the lifecycle walked forward through every intermediate state
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::StateChanged(state) = event {
                seen.push(state);
            }
        }
        assert_eq!(
            seen,
            vec![
                ConnectionState::PendingOpenRfc1006,
                ConnectionState::TransportOpened,
                ConnectionState::PendingOpenPlc,
                ConnectionState::Opened,
            ]
        );

        session.close().await;
        assert_eq!(session.current_state(), ConnectionState::Closed);
        assert!(session.semaphore.load_full().is_none());
    }

    #[tokio::test]
    async fn responses_resolve_by_reference_in_any_order() {
        let (session, mut plc) = spawn_session(test_options());

        let server = tokio::spawn(async move {
            accept_handshake(&mut plc, 960, 8).await;

            // collect both read jobs before answering either
            let first = recv_pdu(&mut plc).await;
            let second = recv_pdu(&mut plc).await;

            // answer with the db number of the addressed block, reversed order
            for pdu in [second, first] {
                let (_, item) = ReadItem::parse(&pdu.param[2..]).unwrap();
                let fill = item.area.db_number() as u8;
                let data = vec![fill; item.count as usize];
                plc.send(IsoFrame::data(build_read_ack(
                    pdu.header.pdu_ref,
                    &[(ReturnCode::Success, &data[..])],
                )))
                .await
                .unwrap();
            }
        });

        assert!(session.wait_opened().await);
        let items_a = [db_read(1, 0, 4)];
        let items_b = [db_read(2, 0, 4)];
        let (a, b) = tokio::join!(
            session.read_items(&items_a),
            session.read_items(&items_b),
        );
        server.await.unwrap();

        assert_eq!(&a.unwrap()[0].data[..], &[1, 1, 1, 1]);
        assert_eq!(&b.unwrap()[0].data[..], &[2, 2, 2, 2]);
    }

    #[tokio::test]
    async fn close_resolves_every_pending_call() {
        let (session, mut plc) = spawn_session(test_options());

        let server = tokio::spawn(async move {
            accept_handshake(&mut plc, 960, 8).await;
            // swallow the job, never answer
            let _ = recv_pdu(&mut plc).await;
            plc
        });
        assert!(session.wait_opened().await);
        let _plc = server.await.unwrap();

        let reader = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.read_items(&[db_read(1, 0, 4)]).await })
        };
        // give the read a chance to register before closing
        sleep(Duration::from_millis(50)).await;
        session.close().await;

        let result = reader.await.unwrap();
        assert!(matches!(result, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn unanswered_requests_time_out() {
        let options = ConnectOptions {
            receive_timeout_ms: 100,
            ..ConnectOptions::default()
        };
        let (session, mut plc) = spawn_session(options);

        tokio::spawn(async move {
            accept_handshake(&mut plc, 960, 8).await;
            let _ = recv_pdu(&mut plc).await;
            // hold the transport open without answering
            sleep(Duration::from_secs(5)).await;
            drop(plc);
        });
        assert!(session.wait_opened().await);

        let result = session.read_items(&[db_read(1, 0, 4)]).await;
        assert!(matches!(result, Err(Error::Timeout { pdu_ref: Some(_) })));
    }

    #[tokio::test]
    async fn cancelled_calls_release_their_credit_immediately() {
        // receive_timeout is 2s here; the abandoned call must give its
        // credit back long before that
        let (session, mut plc) = spawn_session(test_options());

        let server = tokio::spawn(async move {
            accept_handshake(&mut plc, 960, 1).await;
            // swallow the job the caller abandons, answer the next one
            let _ = recv_pdu(&mut plc).await;
            let pdu = recv_pdu(&mut plc).await;
            plc.send(IsoFrame::data(build_read_ack(
                pdu.header.pdu_ref,
                &[(ReturnCode::Success, &[9u8; 4][..])],
            )))
            .await
            .unwrap();
            plc
        });
        assert!(session.wait_opened().await);

        // the single granted credit is held by a call whose caller gives up
        let abandoned = timeout(
            Duration::from_millis(100),
            session.read_items(&[db_read(1, 0, 4)]),
        )
        .await;
        assert!(abandoned.is_err());

        let answered = timeout(
            Duration::from_millis(500),
            session.read_items(&[db_read(2, 0, 4)]),
        )
        .await
        .expect("credit was not released when the caller cancelled")
        .unwrap();
        assert_eq!(&answered[0].data[..], &[9, 9, 9, 9]);
        let _plc = server.await.unwrap();
    }

    #[tokio::test]
    async fn job_credit_bounds_outstanding_requests() {
        let (session, mut plc) = spawn_session(test_options());

        let server = tokio::spawn(async move {
            accept_handshake(&mut plc, 960, 2).await;

            // with two credits granted, exactly two jobs may arrive before
            // any answer is produced
            let first = recv_pdu(&mut plc).await;
            let second = recv_pdu(&mut plc).await;
            let third_early = timeout(Duration::from_millis(150), recv_pdu(&mut plc)).await;
            assert!(third_early.is_err(), "third job sent without a free credit");

            for pdu in [first, second] {
                plc.send(IsoFrame::data(build_read_ack(
                    pdu.header.pdu_ref,
                    &[(ReturnCode::Success, &[0u8; 4])],
                )))
                .await
                .unwrap();
            }
            // the released credits admit the remaining jobs
            for _ in 0..2 {
                let pdu = recv_pdu(&mut plc).await;
                plc.send(IsoFrame::data(build_read_ack(
                    pdu.header.pdu_ref,
                    &[(ReturnCode::Success, &[0u8; 4])],
                )))
                .await
                .unwrap();
            }
        });

        assert!(session.wait_opened().await);
        let reads = (0..4u32).map(|i| {
            let session = Arc::clone(&session);
            async move {
                let items = [db_read(1, i * 8, 4)];
                session.read_items(&items).await
            }
        });
        let results = futures::future::join_all(reads).await;
        server.await.unwrap();
        for result in results {
            assert!(result.is_ok());
        }
    }

    #[tokio::test]
    async fn peer_setup_job_is_acknowledged_and_adopted() {
        let (session, mut plc) = spawn_session(test_options());

        let server = tokio::spawn(async move {
            accept_handshake(&mut plc, 960, 8).await;

            // peer renegotiates mid-session
            let setup = CommSetup {
                max_am_q_calling: 3,
                max_am_q_called: 3,
                pdu_size: 480,
            };
            plc.send(IsoFrame::data(setup.build_job(0x00AA)))
                .await
                .unwrap();
            let ack = recv_pdu(&mut plc).await;
            assert_eq!(ack.header.pdu_type, PduType::AckData);
            assert_eq!(ack.header.pdu_ref, 0x00AA);
            assert_eq!(CommSetup::parse_param(&ack.param).unwrap(), setup);
        });

        assert!(session.wait_opened().await);
        server.await.unwrap();

        // wait for the renegotiated parameters to land
        for _ in 0..100 {
            if session.context().map(|c| c.pdu_size) == Some(480) {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        let context = session.context().unwrap();
        assert_eq!(context.pdu_size, 480);
        assert_eq!(context.max_am_q_calling, 3);
        assert_eq!(
            session.semaphore.load_full().unwrap().available_permits(),
            3
        );
    }

    #[tokio::test]
    async fn alarm_indications_fan_out_through_the_subscription() {
        let (session, mut plc) = spawn_session(test_options());

        let server = tokio::spawn(async move {
            accept_handshake(&mut plc, 960, 8).await;

            // subscription request
            let pdu = recv_pdu(&mut plc).await;
            let (param, payload) = parse_userdata(&pdu).unwrap();
            assert_eq!(param.subfunction, cpu_subfunction::MESSAGE_SERVICE);
            assert_eq!(payload.data[0], 0x01);
            plc.send(IsoFrame::data(build_userdata(
                pdu.header.pdu_ref,
                UserDataParamItem::response(
                    FunctionGroup::CpuFunctions,
                    cpu_subfunction::MESSAGE_SERVICE,
                    0,
                    true,
                ),
                &[0x00, 0x01],
            )))
            .await
            .unwrap();

            // unsolicited indication with reference zero
            let entry = encode_alarm_entry(&PlcAlarm {
                event_id: 0xCAFE,
                event_state: 1,
                ack_state_going: 0,
                ack_state_coming: 0,
                extra: Bytes::new(),
            });
            plc.send(IsoFrame::data(build_userdata(
                0,
                UserDataParamItem::response(
                    FunctionGroup::CpuFunctions,
                    cpu_subfunction::ALARM_S_IND,
                    0,
                    true,
                ),
                &entry,
            )))
            .await
            .unwrap();
            plc
        });

        assert!(session.wait_opened().await);
        let mut alarms = session.subscribe_alarms().await.unwrap();
        let _plc = server.await.unwrap();

        let notification = alarms.recv().await.unwrap();
        assert_eq!(notification.subfunction, cpu_subfunction::ALARM_S_IND);
        let entries = parse_pending_alarms(&notification.data).unwrap();
        assert_eq!(entries[0].event_id, 0xCAFE);
    }

    #[tokio::test]
    async fn pending_alarms_follow_continuation_pages() {
        let (session, mut plc) = spawn_session(test_options());

        let server = tokio::spawn(async move {
            accept_handshake(&mut plc, 960, 8).await;

            // first page: more to come
            let pdu = recv_pdu(&mut plc).await;
            let (param, _) = parse_userdata(&pdu).unwrap();
            assert_eq!(param.subfunction, cpu_subfunction::ALARM_QUERY);
            let entry = encode_alarm_entry(&PlcAlarm {
                event_id: 1,
                event_state: 1,
                ack_state_going: 0,
                ack_state_coming: 0,
                extra: Bytes::new(),
            });
            plc.send(IsoFrame::data(build_userdata(
                pdu.header.pdu_ref,
                UserDataParamItem::response(
                    FunctionGroup::CpuFunctions,
                    cpu_subfunction::ALARM_QUERY,
                    7,
                    false,
                ),
                &entry,
            )))
            .await
            .unwrap();

            // continuation must echo the sequence number
            let pdu = recv_pdu(&mut plc).await;
            let (param, _) = parse_userdata(&pdu).unwrap();
            assert_eq!(param.sequence, 7);
            let entry = encode_alarm_entry(&PlcAlarm {
                event_id: 2,
                event_state: 0,
                ack_state_going: 0,
                ack_state_coming: 0,
                extra: Bytes::new(),
            });
            plc.send(IsoFrame::data(build_userdata(
                pdu.header.pdu_ref,
                UserDataParamItem::response(
                    FunctionGroup::CpuFunctions,
                    cpu_subfunction::ALARM_QUERY,
                    7,
                    true,
                ),
                &entry,
            )))
            .await
            .unwrap();
        });

        assert!(session.wait_opened().await);
        let alarms = session.read_pending_alarms().await.unwrap();
        server.await.unwrap();

        assert_eq!(alarms.len(), 2);
        assert_eq!(alarms[0].event_id, 1);
        assert_eq!(alarms[1].event_id, 2);
    }

    #[tokio::test]
    async fn system_queries_decode_block_info_and_clock() {
        use chrono::NaiveDate;
        let (session, mut plc) = spawn_session(test_options());

        let stamp = NaiveDate::from_ymd_opt(2022, 2, 2)
            .unwrap()
            .and_hms_opt(2, 2, 2)
            .unwrap();
        let server = tokio::spawn(async move {
            accept_handshake(&mut plc, 960, 8).await;

            let pdu = recv_pdu(&mut plc).await;
            let (param, payload) = parse_userdata(&pdu).unwrap();
            assert_eq!(param.group, FunctionGroup::BlockFunctions);
            assert_eq!(payload.data, &b"0A00042A"[..]);
            let info = PlcBlockInfo {
                block_type: BlockType::Db,
                block_number: 42,
                language: 5,
                flags: 0,
                load_size: 512,
                code_size: 128,
                local_data_size: 0,
                author: "plcsim".to_string(),
                family: String::new(),
                name: "DB_42".to_string(),
                version: 1,
                checksum: 0x1234,
                code_timestamp: None,
                interface_timestamp: None,
            };
            plc.send(IsoFrame::data(build_userdata(
                pdu.header.pdu_ref,
                UserDataParamItem::response(
                    FunctionGroup::BlockFunctions,
                    block_subfunction::BLOCK_INFO,
                    0,
                    true,
                ),
                &info.encode(),
            )))
            .await
            .unwrap();

            let pdu = recv_pdu(&mut plc).await;
            let (param, _) = parse_userdata(&pdu).unwrap();
            assert_eq!(param.group, FunctionGroup::TimeFunctions);
            plc.send(IsoFrame::data(build_userdata(
                pdu.header.pdu_ref,
                UserDataParamItem::response(
                    FunctionGroup::TimeFunctions,
                    time_subfunction::READ_CLOCK,
                    0,
                    true,
                ),
                &encode_clock(&stamp),
            )))
            .await
            .unwrap();
        });

        assert!(session.wait_opened().await);
        let info = session.read_block_info(BlockType::Db, 42).await.unwrap();
        assert_eq!(info.block_number, 42);
        assert_eq!(info.author, "plcsim");
        let clock = session.read_clock().await.unwrap();
        server.await.unwrap();
        assert_eq!(clock, stamp);
    }

    #[tokio::test]
    async fn split_read_round_trips_through_the_wire() {
        let (session, mut plc) = spawn_session(test_options());

        let server = tokio::spawn(async move {
            accept_handshake(&mut plc, 480, 8).await;

            // serve byte reads from a virtual 2000-byte data block where
            // every byte equals its offset modulo 251
            for _ in 0..2 {
                let pdu = recv_pdu(&mut plc).await;
                let (_, item) = ReadItem::parse(&pdu.param[2..]).unwrap();
                let data: Vec<u8> = (0..item.count as u32)
                    .map(|i| ((item.offset + i) % 251) as u8)
                    .collect();
                plc.send(IsoFrame::data(build_read_ack(
                    pdu.header.pdu_ref,
                    &[(ReturnCode::Success, &data[..])],
                )))
                .await
                .unwrap();
            }
        });

        assert!(session.wait_opened().await);
        let results = session.read_items(&[db_read(1, 0, 900)]).await.unwrap();
        server.await.unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].data.len(), 900);
        for (i, b) in results[0].data.iter().enumerate() {
            assert_eq!(*b, (i % 251) as u8);
        }
    }

    #[tokio::test]
    async fn writes_return_per_item_codes() {
        let (session, mut plc) = spawn_session(test_options());

        let server = tokio::spawn(async move {
            accept_handshake(&mut plc, 960, 8).await;
            let pdu = recv_pdu(&mut plc).await;
            let count = pdu.param[1];
            assert_eq!(count, 2);
            plc.send(IsoFrame::data(build_write_ack(
                pdu.header.pdu_ref,
                &[ReturnCode::Success, ReturnCode::AccessDenied],
            )))
            .await
            .unwrap();
        });

        assert!(session.wait_opened().await);
        let items = vec![
            WriteItem::new(db_read(1, 0, 2), Bytes::from_static(&[1, 2])),
            WriteItem::new(db_read(1, 10, 2), Bytes::from_static(&[3, 4])),
        ];
        let codes = session.write_items(&items).await.unwrap();
        server.await.unwrap();
        assert_eq!(codes, vec![ReturnCode::Success, ReturnCode::AccessDenied]);
    }
}
