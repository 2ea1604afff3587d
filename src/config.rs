//! Tunables for the object manager, the MAD layer, and SRP channels.
//!
//! Every struct implements `Default` with the values the driver ships with. Tests shorten the
//! timeouts; nothing else in the crate assumes particular values.

use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::srp::quirks::Quirk;

/// Aggregate configuration handed to the top-level constructors.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Object lifecycle tunables.
    pub obj: ObjConfig,
    /// MAD/SA request tunables.
    pub mad: MadConfig,
    /// SRP channel and recovery tunables.
    pub srp: SrpConfig,
}

/// Tunables for [`ObjManager`](crate::obj::ObjManager).
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone)]
pub struct ObjConfig {
    /// Time a synchronous destroy waits for a node without descendants.
    pub base_timeout: Duration,
    /// Additional wait granted per descendant destroyed along with the node.
    pub per_descendant_timeout: Duration,
    /// Upper bound on the computed wait, however deep the subtree.
    pub max_timeout: Duration,
    /// Number of slices the wait is split into; the live-object dump happens before the last.
    pub wait_slices: u32,
    /// Number of threads in the deferred-work pool.
    pub worker_threads: usize,
}

impl Default for ObjConfig {
    fn default() -> Self {
        ObjConfig {
            base_timeout: Duration::from_secs(10),
            per_descendant_timeout: Duration::from_millis(10),
            max_timeout: Duration::from_secs(600),
            wait_slices: 4,
            worker_threads: 2,
        }
    }
}

/// Tunables for the MAD pool and SA requests.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone)]
pub struct MadConfig {
    /// Number of MAD buffers available for outstanding requests on one service instance.
    pub pool_size: usize,
    /// Response timeout handed to the transport with each request.
    pub timeout: Duration,
    /// Retries handed to the transport with each request.
    pub retries: u32,
}

impl Default for MadConfig {
    fn default() -> Self {
        MadConfig {
            pool_size: 256,
            timeout: Duration::from_millis(250),
            retries: 3,
        }
    }
}

/// Tunables for SRP channels and the recovery manager.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone)]
pub struct SrpConfig {
    /// Largest request limit accepted from a login response.
    pub max_queue_depth: u32,
    /// Credits held back; nothing is posted while `request_limit <= request_threshold`.
    pub request_threshold: u32,
    /// Largest IU this initiator asks to receive, and the cap used for S/G sizing.
    pub max_iu_size: u32,
    /// Retry count placed in the connection request.
    pub cm_retry_count: u8,
    /// How long a blocking login waits for the reply or reject.
    pub login_timeout: Duration,
    /// Connection attempts made by one recovery pass.
    pub reconnect_attempts: u32,
    /// Pause between failed connection attempts.
    pub reconnect_backoff: Duration,
    /// Number of FMR entries available to one channel; zero disables remapping.
    pub fmr_pool_size: usize,
    /// Vendor compatibility quirks applied to login responses.
    pub quirks: Vec<Quirk>,
}

impl Default for SrpConfig {
    fn default() -> Self {
        SrpConfig {
            max_queue_depth: 1000,
            request_threshold: 2,
            max_iu_size: 4096,
            cm_retry_count: 6,
            login_timeout: Duration::from_secs(10),
            reconnect_attempts: 3,
            reconnect_backoff: Duration::from_secs(1),
            fmr_pool_size: 64,
            quirks: crate::srp::quirks::default_quirks(),
        }
    }
}
