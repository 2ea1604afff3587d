//! Contracts between an SRP channel and the layers around it.
//!
//! Downward, a channel drives a [`ChannelTransport`]: one reliable connection with its
//! completion queues, opened by a [`TransportFactory`] for a given path. The transport reports
//! everything asynchronous (connection replies, completions, disconnects) through the
//! [`TransportEvents`] sink handed to [`ChannelTransport::connect`].
//!
//! Upward, a channel reports to a [`ScsiSink`].

use std::sync::Arc;

use super::iu::{Segment, TaskFunction};
use super::{ScsiCompletion, TargetId};
use crate::error::{RejectReason, WcStatus};
use crate::sa::PathRecord;
use crate::Result;

/// Capabilities of the local channel adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaAttributes {
    /// Largest number of outstanding RDMA reads the adapter can respond to.
    pub max_responder_resources: u8,
    /// Largest number of outstanding RDMA reads the adapter can initiate.
    pub max_initiator_depth: u8,
    /// Largest work queue the adapter supports.
    pub max_queue_depth: u32,
}

/// Parameters of a connection-establishment request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Service id the target listens on.
    pub service_id: u64,
    /// Path to the target.
    pub path: PathRecord,
    /// Responder resources offered.
    pub responder_resources: u8,
    /// Initiator depth requested.
    pub initiator_depth: u8,
    /// Local response timeout exponent.
    pub local_resp_timeout: u8,
    /// Remote response timeout exponent.
    pub remote_resp_timeout: u8,
    /// Connection retry count.
    pub retry_count: u8,
    /// Encoded `SRP_LOGIN_REQ` carried as private data.
    pub private_data: Vec<u8>,
}

/// A registered, remapped memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FmrRegion {
    /// Single virtual range covering every mapped segment.
    pub segment: Segment,
}

/// Something asynchronous that happened on a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The target accepted the connection; carries the `SRP_LOGIN_RSP`.
    ConnectReply {
        /// Private data of the reply.
        private_data: Vec<u8>,
    },
    /// The connection was refused.
    ConnectReject {
        /// Connection-manager reject reason.
        reason: RejectReason,
        /// Private data of the reject; an `SRP_LOGIN_REJ` for consumer rejects.
        private_data: Vec<u8>,
    },
    /// A receive work request completed.
    Recv {
        /// Id the receive was posted with.
        wr_id: u64,
        /// Completion status.
        status: WcStatus,
        /// Received bytes.
        data: Vec<u8>,
    },
    /// A send work request completed.
    Send {
        /// Id the send was posted with.
        wr_id: u64,
        /// Completion status.
        status: WcStatus,
    },
    /// The remote side disconnected.
    Disconnected,
}

/// Sink for [`TransportEvent`]s.
///
/// Implementations must not block.
pub trait TransportEvents: Send + Sync {
    /// Handle one event.
    fn deliver(&self, event: TransportEvent);
}

/// One reliable connection and its queues.
pub trait ChannelTransport: Send + Sync {
    /// Query the local adapter.
    fn query_ca(&self) -> Result<CaAttributes>;

    /// Send a connection request. The reply or reject arrives through `events`, as does every
    /// later event of the connection.
    fn connect(&self, request: ConnectRequest, events: Arc<dyn TransportEvents>) -> Result<()>;

    /// Tell the target more time is needed before the connection can be used.
    fn delay_ack(&self) -> Result<()>;

    /// Complete connection establishment.
    fn ready_to_use(&self) -> Result<()>;

    /// Request completion notifications.
    fn arm_cq(&self) -> Result<()>;

    /// Post a receive buffer of `len` bytes.
    fn post_recv(&self, wr_id: u64, len: u32) -> Result<()>;

    /// Post an IU for sending.
    fn post_send(&self, wr_id: u64, iu: Vec<u8>) -> Result<()>;

    /// Remap `segments` into one virtual range.
    fn map_fmr(&self, segments: &[Segment]) -> Result<FmrRegion>;

    /// Release a mapping made by [`ChannelTransport::map_fmr`].
    fn unmap_fmr(&self, region: FmrRegion);

    /// Tear the connection down. Outstanding work requests complete with a flush status.
    fn disconnect(&self) -> Result<()>;
}

/// Opens transports.
pub trait TransportFactory: Send + Sync {
    /// Open a transport for a connection over `path`.
    fn open(&self, path: &PathRecord) -> Result<Arc<dyn ChannelTransport>>;
}

/// Outcome of a task management request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
    /// Target the request went to.
    pub target: TargetId,
    /// Logical unit.
    pub lun: u64,
    /// Function performed.
    pub function: TaskFunction,
    /// Tag of the task acted on.
    pub task_tag: u64,
    /// Response code from the target, or `None` if the request failed locally.
    pub response: Option<u8>,
}

/// The SCSI layer above a channel.
///
/// Calls may arrive on transport or worker threads and must not block.
pub trait ScsiSink: Send + Sync {
    /// A request finished.
    fn complete(&self, target: TargetId, completion: ScsiCompletion);

    /// Hold (`true`) or resume (`false`) new work for `target`.
    fn set_busy(&self, target: TargetId, busy: bool);

    /// A task management request finished.
    fn task_management(&self, report: TaskReport) {
        let _ = report;
    }

    /// The target raised an asynchronous event.
    fn async_event(&self, target: TargetId, lun: u64, sense: &[u8]) {
        let _ = (target, lun, sense);
    }

    /// Recovery gave up on `target`.
    fn unreachable(&self, target: TargetId) {
        let _ = target;
    }
}
