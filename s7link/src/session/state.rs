use crate::frame::ConnectionType;
use crate::planner::PlanLimits;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Connection lifecycle. Transitions only move forward or back to `Closed`;
/// user operations are admitted in `Opened` only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    /// TCP is up, COTP connection request sent, confirm outstanding
    PendingOpenRfc1006,
    /// COTP association confirmed
    TransportOpened,
    /// COMM-SETUP job sent, acknowledgement outstanding
    PendingOpenPlc,
    Opened,
}

/// Observability events broadcast by the session driver.
#[derive(Debug, Clone, Copy)]
pub enum SessionEvent {
    StateChanged(ConnectionState),
    /// Transport level error (connect/reset/IO)
    TransportError,
    /// An alarm indication arrived with no subscription installed
    IndicationDropped,
    /// A transport fragment sequence could not be reassembled into a PDU
    ReassemblyDrop,
    /// The peer renegotiated session parameters via its own COMM-SETUP job
    Renegotiated,
}

/// Connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectOptions {
    /// Target host (IPv4 or hostname); port defaults to 102
    pub address: String,
    pub port: u16,
    pub connection_type: ConnectionType,
    pub rack: u8,
    pub slot: u8,
    /// Desired maximum PDU size; the peer may shrink it
    pub pdu_size: u16,
    /// Requested MaxAmQ calling/called
    pub max_parallel_jobs: u16,
    /// Per-call timeout in milliseconds
    pub receive_timeout_ms: u64,
    /// Re-dial the transport when the connection drops
    pub reconnect: bool,
    #[serde(default = "default_true")]
    pub tcp_nodelay: bool,
    #[serde(default = "default_queue")]
    pub send_queue_capacity: usize,
}

fn default_true() -> bool {
    true
}

fn default_queue() -> usize {
    64
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 102,
            connection_type: ConnectionType::Pg,
            rack: 0,
            slot: 2,
            pdu_size: 960,
            max_parallel_jobs: 10,
            receive_timeout_ms: 5_000,
            reconnect: false,
            tcp_nodelay: true,
            send_queue_capacity: 64,
        }
    }
}

impl ConnectOptions {
    pub fn for_host(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }

    #[inline]
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    /// Deadline for the whole open sequence.
    #[inline]
    pub fn open_timeout(&self) -> Duration {
        self.receive_timeout() * 10
    }
}

/// Session parameters populated by the COMM-SETUP handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionContext {
    pub timeout: Duration,
    pub pdu_size: u16,
    pub max_am_q_calling: u16,
    pub max_am_q_called: u16,
}

impl SessionContext {
    #[inline]
    pub fn read_item_max_length(&self) -> usize {
        (self.pdu_size as usize).saturating_sub(18)
    }

    #[inline]
    pub fn write_item_max_length(&self) -> usize {
        (self.pdu_size as usize).saturating_sub(28)
    }

    #[inline]
    pub fn plan_limits(&self) -> PlanLimits {
        PlanLimits::new(self.pdu_size)
    }
}
