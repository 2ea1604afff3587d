//! SRP initiator: flow-controlled channels, sessions, and recovery.
//!
//! A [`Connection`] is one credit-flow-controlled command/response channel to a target,
//! owned by a [`Session`]. The [`RecoveryManager`] supervises one session per target id,
//! replacing failed channels behind a stable [`TargetId`].
//!
//! ```text
//! RecoveryManager ── Hba node
//!                      ├── Session (target 0) ── Connection ── ChannelTransport
//!                      └── Session (target 1) ── Connection ── ChannelTransport
//! ```

pub mod connection;
pub mod descriptor;
pub mod fmr;
pub mod iu;
#[cfg(test)]
pub(crate) mod mock;
pub mod quirks;
pub mod recovery;
pub mod session;
pub mod transport;

pub use connection::{Connection, ConnectionSnapshot, ConnectionState, DescriptorFormat, Negotiated};
pub use iu::{Segment, TaskFunction};
pub use recovery::{PathSource, RecoveryManager, SaPathSource, StaticPaths, TargetPhase, TargetSnapshot};
pub use session::Session;
pub use transport::{
    CaAttributes, ChannelTransport, ConnectRequest, FmrRegion, ScsiSink, TaskReport,
    TransportEvent, TransportEvents, TransportFactory,
};

use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::sa::Gid;
use crate::Error;

/// Stable identifier of a target, as seen by the SCSI layer.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetId(pub u32);

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Addressing and identity of an SRP target port.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetDescriptor {
    /// Identifier extension of the target port.
    pub id_ext: u64,
    /// GUID of the target's I/O controller.
    pub ioc_guid: u64,
    /// Service id the target listens on.
    pub service_id: u64,
    /// GID of the target port.
    pub dgid: Gid,
    /// Vendor id reported by the I/O controller.
    pub vendor_id: u32,
    /// Subsystem device id reported by the I/O controller.
    pub subsystem_id: u32,
    /// Local port the initiator connects from.
    pub port_guid: u64,
    /// Identifier extension of the initiator port.
    pub initiator_ext: u64,
}

impl TargetDescriptor {
    /// Initiator port identifier: extension followed by the local port GUID.
    pub fn initiator_port_id(&self) -> [u8; 16] {
        port_id(self.initiator_ext, self.port_guid)
    }

    /// Target port identifier: extension followed by the I/O controller GUID.
    pub fn target_port_id(&self) -> [u8; 16] {
        port_id(self.id_ext, self.ioc_guid)
    }
}

fn port_id(hi: u64, lo: u64) -> [u8; 16] {
    let mut id = [0u8; 16];
    id[..8].copy_from_slice(&hi.to_be_bytes());
    id[8..].copy_from_slice(&lo.to_be_bytes());
    id
}

/// Which way a command moves data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataDirection {
    /// No data phase.
    #[default]
    None,
    /// Target to initiator.
    Read,
    /// Initiator to target.
    Write,
}

/// A SCSI command handed down by the SCSI layer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScsiRequest {
    /// Caller-chosen identifier, echoed in the completion and used by abort.
    pub id: u64,
    /// Logical unit.
    pub lun: u64,
    /// Command descriptor block.
    pub cdb: Vec<u8>,
    /// Data direction.
    pub direction: DataDirection,
    /// Data buffer, one entry per discontiguous region.
    pub segments: Vec<Segment>,
    /// SCSI task attribute.
    pub task_attr: u8,
}

/// How a command finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestStatus {
    /// The target returned GOOD status.
    Success,
    /// The target returned another SCSI status; see [`ScsiCompletion::scsi_status`].
    ScsiError,
    /// Aborted by [`Connection::abort`].
    Aborted,
    /// Completed by a LUN or device reset.
    Reset,
    /// The channel failed or closed before the target answered.
    Failed(Error),
}

/// Completion of a [`ScsiRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScsiCompletion {
    /// Identifier of the request.
    pub id: u64,
    /// Outcome.
    pub status: RequestStatus,
    /// SCSI status byte, when the target answered.
    pub scsi_status: u8,
    /// Sense data, when the target supplied it.
    pub sense: Vec<u8>,
    /// Residual of the data phase: positive for underflow, negative for overflow.
    pub residual: i64,
}

impl ScsiCompletion {
    /// A completion that never reached the target.
    pub fn local(id: u64, status: RequestStatus) -> ScsiCompletion {
        ScsiCompletion {
            id,
            status,
            scsi_status: 0,
            sense: Vec::new(),
            residual: 0,
        }
    }
}
