//! Error and status types shared by every layer of the crate.

use thiserror::Error;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Errors returned by access-layer and SRP operations.
///
/// Synchronous precondition failures (`InvalidState`, `InsufficientMemory`, ...) are returned
/// directly by the operation that detected them. Transport failures are only ever delivered
/// through completion callbacks; they show up here as [`Error::Transport`] or
/// [`Error::Rejected`] when a completion is converted into a `Result`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The object is not in a state that permits this operation.
    #[error("object is not in a valid state for this operation")]
    InvalidState,
    /// A buffer or pool allocation failed.
    #[error("insufficient memory")]
    InsufficientMemory,
    /// A bounded hardware or pool resource is exhausted.
    #[error("insufficient resources")]
    InsufficientResources,
    /// No live per-port service instance exists for the given port GUID.
    #[error("no service instance for port guid {0:#018x}")]
    InvalidGuid(u64),
    /// A caller-supplied argument is malformed.
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
    /// The referenced request, descriptor, or target does not exist.
    #[error("not found")]
    NotFound,
    /// The operation did not complete within its time budget.
    #[error("operation timed out")]
    Timeout,
    /// The operation was cancelled before it completed.
    #[error("operation was cancelled")]
    Cancelled,
    /// The remote side rejected the request.
    #[error("remote rejected the request: {0:?}")]
    Rejected(RejectReason),
    /// A work request completed with an error status.
    #[error("transport completion failed: {0:?}")]
    Transport(WcStatus),
    /// The channel is not in the `Connected` state.
    #[error("channel is not connected")]
    NotConnected,
    /// The device is temporarily unable to accept work; the caller should hold and retry.
    #[error("device busy")]
    Busy,
    /// A MAD response carried a non-zero status.
    #[error("MAD response status {0:#06x}")]
    MadStatus(u16),
    /// A received information unit could not be decoded.
    #[error("malformed information unit: {0}")]
    Protocol(&'static str),
}

/// Result type for access-layer operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Completion status of a transport work request.
///
/// Named after the `IBV_WC_*` completion codes; only the distinctions the core acts on are kept.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WcStatus {
    /// The work request completed successfully.
    Success,
    /// The work request was flushed because the queue pair entered the error state.
    WrFlushErr,
    /// The remote side did not answer within the retry budget.
    RetryExceeded,
    /// The remote side reported an access or operation error.
    RemoteError,
    /// The work request was cancelled before it completed.
    Canceled,
    /// The response did not arrive in time.
    Timeout,
    /// Any other local or remote failure, with the vendor code.
    General(u32),
}

impl WcStatus {
    /// Returns `true` for [`WcStatus::Success`].
    pub fn is_success(self) -> bool {
        self == WcStatus::Success
    }

    /// Convert a completion status into a `Result`.
    pub fn into_result(self) -> Result<()> {
        match self {
            WcStatus::Success => Ok(()),
            WcStatus::Canceled => Err(Error::Cancelled),
            WcStatus::Timeout => Err(Error::Timeout),
            other => Err(Error::Transport(other)),
        }
    }
}

/// Why a remote side refused a connection or registration.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    /// The target does not support the requested data buffer descriptor formats.
    UnsupportedDescriptorFormat,
    /// The target lacks the channel resources to accept another login.
    InsufficientResources,
    /// The requested maximum initiator-to-target IU length is too large.
    IuTooLarge,
    /// The target refused the initiator port identifier.
    UnableToAssociate,
    /// The consumer-defined reject at the connection manager level.
    Consumer,
    /// No target answered at the given service id.
    InvalidServiceId,
    /// Reject code not interpreted by this crate.
    Other(u32),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wc_status_maps_to_errors() {
        assert_eq!(WcStatus::Success.into_result(), Ok(()));
        assert_eq!(WcStatus::Canceled.into_result(), Err(Error::Cancelled));
        assert_eq!(WcStatus::Timeout.into_result(), Err(Error::Timeout));
        assert_eq!(
            WcStatus::WrFlushErr.into_result(),
            Err(Error::Transport(WcStatus::WrFlushErr))
        );
    }

    #[test]
    fn display_includes_guid() {
        let e = Error::InvalidGuid(0x0002_c903_0000_1234);
        assert_eq!(e.to_string(), "no service instance for port guid 0x0002c90300001234");
    }
}
