//! Management datagrams: pooled transport buffers, header layout, and the transport contract.
//!
//! A MAD is a fixed 256-byte block. Requests are stamped with a transaction id, handed to a
//! [`MadTransport`] together with a one-shot [`MadDone`], and the transport later reports the
//! outcome through that `MadDone` exactly once, returning the send buffer with it.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::WcStatus;
use crate::{Error, Result};

/// Size of every management datagram.
pub const MAD_BLOCK_SIZE: usize = 256;
/// Size of the common MAD header.
pub const MAD_HEADER_SIZE: usize = 24;
/// Size of the SA class header that follows the common header.
pub const SA_HEADER_SIZE: usize = 20;
/// Offset of SA attribute data within a MAD.
pub const SA_DATA_OFFSET: usize = MAD_HEADER_SIZE + SA_HEADER_SIZE;
/// Bytes of SA attribute data a single MAD can carry.
pub const SA_DATA_SIZE: usize = MAD_BLOCK_SIZE - SA_DATA_OFFSET;

/// Management class of subnet administration.
pub const MGMT_CLASS_SUBN_ADM: u8 = 0x03;
/// SA class version.
pub const SA_CLASS_VERSION: u8 = 2;

/// A MAD transaction identifier.
///
/// Identifiers are allocated per service instance, so they are only unique among the requests
/// outstanding on one port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tid(pub u64);

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// MAD methods used by SA requests and their responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MadMethod {
    /// Read a single record.
    Get,
    /// Create or update a record.
    Set,
    /// Read every matching record.
    GetTable,
    /// Remove a record.
    Delete,
    /// Response to [`MadMethod::Get`] or [`MadMethod::Set`].
    GetResp,
    /// Response to [`MadMethod::GetTable`].
    GetTableResp,
    /// Response to [`MadMethod::Delete`].
    DeleteResp,
}

impl MadMethod {
    /// Wire value of the method.
    pub fn code(self) -> u8 {
        match self {
            MadMethod::Get => 0x01,
            MadMethod::Set => 0x02,
            MadMethod::GetTable => 0x12,
            MadMethod::Delete => 0x15,
            MadMethod::GetResp => 0x81,
            MadMethod::GetTableResp => 0x92,
            MadMethod::DeleteResp => 0x95,
        }
    }

    /// Parse a wire value.
    pub fn from_code(code: u8) -> Option<MadMethod> {
        Some(match code {
            0x01 => MadMethod::Get,
            0x02 => MadMethod::Set,
            0x12 => MadMethod::GetTable,
            0x15 => MadMethod::Delete,
            0x81 => MadMethod::GetResp,
            0x92 => MadMethod::GetTableResp,
            0x95 => MadMethod::DeleteResp,
            _ => return None,
        })
    }

    /// The method a responder answers this request method with.
    pub fn response(self) -> MadMethod {
        match self {
            MadMethod::Get | MadMethod::Set => MadMethod::GetResp,
            MadMethod::GetTable => MadMethod::GetTableResp,
            MadMethod::Delete => MadMethod::DeleteResp,
            resp => resp,
        }
    }
}

/// Decoded common MAD header plus the SA class header fields this crate uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaMadHeader {
    /// Request or response method.
    pub method: MadMethod,
    /// MAD status; zero on success.
    pub status: u16,
    /// Transaction id.
    pub tid: Tid,
    /// Attribute being queried or set.
    pub attr_id: u16,
    /// Attribute modifier.
    pub attr_mod: u32,
    /// Record stride in 8-byte units, for table responses.
    pub attr_offset: u16,
    /// Which attribute fields are significant.
    pub component_mask: u64,
}

impl SaMadHeader {
    /// Write the header into the first [`SA_DATA_OFFSET`] bytes of `buf`.
    pub fn encode(&self, buf: &mut [u8]) {
        buf[..SA_DATA_OFFSET].fill(0);
        buf[0] = 1; // base version
        buf[1] = MGMT_CLASS_SUBN_ADM;
        buf[2] = SA_CLASS_VERSION;
        buf[3] = self.method.code();
        buf[4..6].copy_from_slice(&self.status.to_be_bytes());
        buf[8..16].copy_from_slice(&self.tid.0.to_be_bytes());
        buf[16..18].copy_from_slice(&self.attr_id.to_be_bytes());
        buf[20..24].copy_from_slice(&self.attr_mod.to_be_bytes());
        // SA header: sm_key (8), attr_offset (2), reserved (2), component mask (8)
        buf[32..34].copy_from_slice(&self.attr_offset.to_be_bytes());
        buf[36..44].copy_from_slice(&self.component_mask.to_be_bytes());
    }

    /// Parse the header from a MAD.
    ///
    /// # Errors
    ///
    ///  - `Protocol`: the buffer is short, of another class, or carries an unknown method.
    pub fn decode(buf: &[u8]) -> Result<SaMadHeader> {
        if buf.len() < SA_DATA_OFFSET {
            return Err(Error::Protocol("short MAD"));
        }
        if buf[1] != MGMT_CLASS_SUBN_ADM {
            return Err(Error::Protocol("not a subnet administration MAD"));
        }
        let method = MadMethod::from_code(buf[3]).ok_or(Error::Protocol("unknown MAD method"))?;
        Ok(SaMadHeader {
            method,
            status: u16::from_be_bytes([buf[4], buf[5]]),
            tid: Tid(read_u64(buf, 8)),
            attr_id: u16::from_be_bytes([buf[16], buf[17]]),
            attr_mod: read_u32(buf, 20),
            attr_offset: u16::from_be_bytes([buf[32], buf[33]]),
            component_mask: read_u64(buf, 36),
        })
    }
}

/// Big-endian `u64` at `at`. Callers check the length first.
pub(crate) fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[at..at + 8]);
    u64::from_be_bytes(b)
}

/// Big-endian `u32` at `at`.
pub(crate) fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[at..at + 4]);
    u32::from_be_bytes(b)
}

struct PoolInner {
    free: Mutex<Vec<Box<[u8; MAD_BLOCK_SIZE]>>>,
    capacity: usize,
}

/// A bounded pool of MAD buffers.
#[derive(Clone)]
pub struct MadPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for MadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MadPool")
            .field("capacity", &self.inner.capacity)
            .field("available", &self.available())
            .finish()
    }
}

impl MadPool {
    /// Pre-allocate `capacity` buffers.
    pub fn new(capacity: usize) -> MadPool {
        let free = (0..capacity)
            .map(|_| Box::new([0u8; MAD_BLOCK_SIZE]))
            .collect();
        MadPool {
            inner: Arc::new(PoolInner {
                free: Mutex::new(free),
                capacity,
            }),
        }
    }

    /// Take a zeroed buffer from the pool.
    ///
    /// # Errors
    ///
    ///  - `InsufficientMemory`: every buffer is in flight.
    pub fn get(&self) -> Result<MadBuffer> {
        let mut data = self
            .inner
            .free
            .lock()
            .pop()
            .ok_or(Error::InsufficientMemory)?;
        data.fill(0);
        Ok(MadBuffer {
            data: Some(data),
            pool: Arc::downgrade(&self.inner),
        })
    }

    /// Number of buffers currently in the pool.
    pub fn available(&self) -> usize {
        self.inner.free.lock().len()
    }

    /// Total number of buffers owned by the pool.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}

/// A MAD buffer on loan from a [`MadPool`]; returned to the pool on drop.
pub struct MadBuffer {
    data: Option<Box<[u8; MAD_BLOCK_SIZE]>>,
    pool: Weak<PoolInner>,
}

impl fmt::Debug for MadBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MadBuffer").finish_non_exhaustive()
    }
}

impl MadBuffer {
    /// The full 256-byte block.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data.as_ref().expect("buffer present until drop")[..]
    }

    /// The full 256-byte block, mutably.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data.as_mut().expect("buffer present until drop")[..]
    }
}

impl Drop for MadBuffer {
    fn drop(&mut self) {
        if let (Some(data), Some(pool)) = (self.data.take(), self.pool.upgrade()) {
            pool.free.lock().push(data);
        }
    }
}

/// A request handed to a [`MadTransport`].
#[derive(Debug)]
pub struct MadSend {
    /// Port the request leaves from.
    pub port_guid: u64,
    /// Transaction id stamped into the buffer.
    pub tid: Tid,
    /// The encoded MAD.
    pub buffer: MadBuffer,
    /// Response timeout per attempt.
    pub timeout: Duration,
    /// Retries before reporting [`WcStatus::Timeout`].
    pub retries: u32,
}

/// Outcome of one MAD request, reported by the transport.
#[derive(Debug)]
pub struct MadCompletion {
    /// Transaction id of the request.
    pub tid: Tid,
    /// Transport status.
    pub status: WcStatus,
    /// The send buffer, returned to its owner.
    pub send_buffer: MadBuffer,
    /// The response MAD, if one arrived.
    pub response: Option<Vec<u8>>,
}

/// The single completion path of one posted MAD.
///
/// Consuming it with [`MadDone::complete`] is the only way a request's outcome is reported.
pub struct MadDone {
    tid: Tid,
    f: Box<dyn FnOnce(MadCompletion) + Send>,
}

impl fmt::Debug for MadDone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MadDone").field("tid", &self.tid).finish()
    }
}

impl MadDone {
    pub(crate) fn new(tid: Tid, f: impl FnOnce(MadCompletion) + Send + 'static) -> MadDone {
        MadDone { tid, f: Box::new(f) }
    }

    /// Transaction id this completion belongs to.
    pub fn tid(&self) -> Tid {
        self.tid
    }

    /// Report the outcome of the request.
    pub fn complete(self, status: WcStatus, send_buffer: MadBuffer, response: Option<Vec<u8>>) {
        (self.f)(MadCompletion {
            tid: self.tid,
            status,
            send_buffer,
            response,
        })
    }
}

/// Contract of the MAD transport (send agent) underneath the SA layer.
pub trait MadTransport: Send + Sync {
    /// Submit `send`. The transport must eventually call `done.complete` exactly once, with
    /// [`WcStatus::Canceled`] if the request was cancelled. If `post` returns an error, `done`
    /// must not have been and must never be completed.
    fn post(&self, send: MadSend, done: MadDone) -> Result<()>;

    /// Ask the transport to short-circuit the request with `tid`. Completion is still reported
    /// through its `MadDone`; if the request already completed this is a no-op.
    fn cancel(&self, port_guid: u64, tid: Tid);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn header_encode_decode() {
        let hdr = SaMadHeader {
            method: MadMethod::GetTable,
            status: 0,
            tid: Tid(0x1234_5678_9abc),
            attr_id: 0x35,
            attr_mod: 0,
            attr_offset: 8,
            component_mask: (1 << 2) | (1 << 3),
        };
        let mut buf = [0u8; MAD_BLOCK_SIZE];
        hdr.encode(&mut buf);
        assert_eq!(buf[1], MGMT_CLASS_SUBN_ADM);
        assert_eq!(SaMadHeader::decode(&buf).unwrap(), hdr);
        assert!(SaMadHeader::decode(&buf[..10]).is_err());
    }

    #[test]
    fn pool_exhaustion_and_return() {
        let pool = MadPool::new(2);
        let a = pool.get().unwrap();
        let _b = pool.get().unwrap();
        assert_eq!(pool.get().unwrap_err(), Error::InsufficientMemory);
        drop(a);
        assert_eq!(pool.available(), 1);
        let mut c = pool.get().unwrap();
        assert!(c.as_bytes().iter().all(|b| *b == 0));
        c.as_bytes_mut()[0] = 0xff;
    }

    #[test]
    fn response_methods() {
        assert_eq!(MadMethod::GetTable.response(), MadMethod::GetTableResp);
        assert_eq!(MadMethod::Delete.response().code(), 0x95);
        assert_eq!(MadMethod::from_code(0x81), Some(MadMethod::GetResp));
        assert_eq!(MadMethod::from_code(0x7f), None);
    }
}
