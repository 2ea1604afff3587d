//! An InfiniBand access layer and SRP initiator core.
//!
//! The crate models the parts of an InfiniBand host stack that sit between the verbs provider and
//! its consumers:
//!
//!  - [`obj`]: the reference-counted object graph every resource lives in. Teardown is a single
//!    idempotent `destroy` that cascades to children, waits (bounded) for outstanding references,
//!    and finalizes each node exactly once.
//!  - [`mad`] and [`sa`]: management datagrams and subnet-administration requests. Requests are
//!    correlated to responses by transaction id; cancellation and completion may race, and the
//!    caller's callback still runs exactly once.
//!  - [`srp`]: an SRP initiator. A [`Connection`](srp::Connection) logs in to a target and carries
//!    SCSI commands under the target's credit-based flow control; a
//!    [`RecoveryManager`](srp::RecoveryManager) replaces failed sessions behind stable target ids.
//!  - [`sim`]: in-process stand-ins for an SRP target and a subnet administrator, so the whole stack
//!    can be exercised without hardware.
//!
//! The hardware-facing ends are traits: [`MadTransport`](mad::MadTransport) for MAD send/receive,
//! and [`ChannelTransport`](srp::ChannelTransport) / [`TransportFactory`](srp::TransportFactory)
//! for reliable connections. Upward, completions go to a [`ScsiSink`](srp::ScsiSink).
//!
//! # Threading
//!
//! Every type is `Send` and `Sync`. Transport callbacks never block; the only blocking calls are
//! synchronous destroys, blocking logins, and the `*_blocking` SA helpers. Deferred teardown and
//! SA callbacks run on the [`ObjManager`](obj::ObjManager)'s worker pool, and session recovery
//! runs on a dedicated worker thread.
//!
//! # Logging
//!
//! Diagnostics are emitted through [`tracing`]; install a subscriber to see them.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ibal::config::Config;
//! use ibal::obj::ObjManager;
//! use ibal::sim::SimTarget;
//! use ibal::srp::{RecoveryManager, ScsiCompletion, ScsiSink, StaticPaths, TargetId};
//!
//! struct Log;
//! impl ScsiSink for Log {
//!     fn complete(&self, target: TargetId, completion: ScsiCompletion) {
//!         println!("{target}: {completion:?}");
//!     }
//!     fn set_busy(&self, _target: TargetId, _busy: bool) {}
//! }
//!
//! # fn main() -> ibal::Result<()> {
//! let config = Config::default();
//! let manager = ObjManager::new(config.obj.clone());
//! let target = SimTarget::new()?;
//! let recovery = RecoveryManager::new(
//!     &manager,
//!     Arc::new(target),
//!     Arc::new(StaticPaths::new(Vec::new())),
//!     Arc::new(Log),
//!     config.srp.clone(),
//! )?;
//! recovery.shutdown();
//! manager.shutdown();
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod error;
pub mod event;
pub mod mad;
pub mod obj;
pub mod sa;
pub mod sim;
pub mod srp;

pub use error::{Error, Result};
