//! Send and receive descriptor bookkeeping.
//!
//! A [`SendDescriptor`] is in exactly one place at a time: the pending queue of its channel, the
//! sent set, or nowhere (completed). Moving it out of either container is a single call on the
//! container, made under that container's lock by the channel.

use std::collections::{HashMap, VecDeque};

use super::fmr::{FmrHandle, FmrPool};
use super::iu::{DataBuffer, TaskFunction};
use super::{DataDirection, ScsiRequest};
use crate::{Error, Result};

/// Work-request id bit marking a receive.
pub const RECV_WR_FLAG: u64 = 1 << 63;
/// Work-request id bit marking an initiator response or logout, which consumes no credit.
pub const CONTROL_WR_FLAG: u64 = 1 << 62;

/// What a descriptor carries.
#[derive(Debug)]
pub enum Work {
    /// A SCSI command.
    Command(ScsiRequest),
    /// A task management request.
    Task {
        /// Function requested.
        function: TaskFunction,
        /// Tag of the task acted on.
        task_tag: u64,
    },
}

/// One flow-controlled request of a channel.
#[derive(Debug)]
pub struct SendDescriptor {
    tag: u64,
    lun: u64,
    work: Work,
    iu: Option<Vec<u8>>,
    fmr: Option<FmrHandle>,
}

impl SendDescriptor {
    /// A descriptor for `work` with its encoded IU.
    pub fn new(tag: u64, lun: u64, work: Work, iu: Vec<u8>, fmr: Option<FmrHandle>) -> Self {
        SendDescriptor {
            tag,
            lun,
            work,
            iu: Some(iu),
            fmr,
        }
    }

    /// Tag of the IU.
    pub fn tag(&self) -> u64 {
        self.tag
    }

    /// Logical unit addressed.
    pub fn lun(&self) -> u64 {
        self.lun
    }

    /// Caller identifier of the SCSI request, for commands.
    pub fn request_id(&self) -> Option<u64> {
        match &self.work {
            Work::Command(r) => Some(r.id),
            Work::Task { .. } => None,
        }
    }

    /// Take the encoded IU for posting; `None` once posted.
    pub fn take_iu(&mut self) -> Option<Vec<u8>> {
        self.iu.take()
    }

    /// Release the remap entry, if any, and hand back the work.
    pub fn into_work(mut self) -> Work {
        if let Some(fmr) = self.fmr.take() {
            fmr.release();
        }
        self.work
    }
}

/// FIFO of descriptors waiting for credit.
#[derive(Debug, Default)]
pub struct PendingQueue {
    queue: VecDeque<SendDescriptor>,
}

impl PendingQueue {
    /// Number of queued descriptors.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Returns `true` if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Queue at the tail.
    pub fn push_back(&mut self, desc: SendDescriptor) {
        self.queue.push_back(desc);
    }

    /// Take the head.
    pub fn pop_front(&mut self) -> Option<SendDescriptor> {
        self.queue.pop_front()
    }

    /// Remove the command with caller identifier `id`.
    pub fn remove_request(&mut self, id: u64) -> Option<SendDescriptor> {
        let at = self.queue.iter().position(|d| d.request_id() == Some(id))?;
        self.queue.remove(at)
    }

    /// Remove every descriptor addressed to `lun`, keeping the order of the rest.
    pub fn take_lun(&mut self, lun: u64) -> Vec<SendDescriptor> {
        let (taken, kept): (Vec<_>, Vec<_>) = self.queue.drain(..).partition(|d| d.lun == lun);
        self.queue = kept.into();
        taken
    }

    /// Remove everything.
    pub fn drain(&mut self) -> Vec<SendDescriptor> {
        self.queue.drain(..).collect()
    }

    /// Tags in queue order.
    pub fn tags(&self) -> Vec<u64> {
        self.queue.iter().map(|d| d.tag).collect()
    }
}

/// Descriptors posted to the transport and awaiting their response, by tag.
#[derive(Debug, Default)]
pub struct SentSet {
    by_tag: HashMap<u64, SendDescriptor>,
}

impl SentSet {
    /// Number of descriptors awaiting a response.
    pub fn len(&self) -> usize {
        self.by_tag.len()
    }

    /// Returns `true` if nothing is outstanding.
    pub fn is_empty(&self) -> bool {
        self.by_tag.is_empty()
    }

    /// Insert a posted descriptor.
    pub fn insert(&mut self, desc: SendDescriptor) {
        let prev = self.by_tag.insert(desc.tag, desc);
        debug_assert!(prev.is_none(), "tag reused while outstanding");
    }

    /// Find and remove by tag. A second call for the same tag returns `None`.
    pub fn take(&mut self, tag: u64) -> Option<SendDescriptor> {
        self.by_tag.remove(&tag)
    }

    /// Returns `true` if `tag` is outstanding.
    pub fn contains(&self, tag: u64) -> bool {
        self.by_tag.contains_key(&tag)
    }

    /// Find and remove the command with caller identifier `id`.
    pub fn take_request(&mut self, id: u64) -> Option<SendDescriptor> {
        let tag = self
            .by_tag
            .values()
            .find(|d| d.request_id() == Some(id))
            .map(|d| d.tag)?;
        self.by_tag.remove(&tag)
    }

    /// Remove every descriptor addressed to `lun`.
    pub fn take_lun(&mut self, lun: u64) -> Vec<SendDescriptor> {
        let tags: Vec<_> = self
            .by_tag
            .values()
            .filter(|d| d.lun == lun)
            .map(|d| d.tag)
            .collect();
        let mut taken: Vec<_> = tags.into_iter().filter_map(|t| self.by_tag.remove(&t)).collect();
        taken.sort_by_key(|d| d.tag);
        taken
    }

    /// Remove everything, in tag order.
    pub fn drain(&mut self) -> Vec<SendDescriptor> {
        let mut all: Vec<_> = self.by_tag.drain().map(|(_, d)| d).collect();
        all.sort_by_key(|d| d.tag);
        all
    }
}

/// Receive slots of a channel, one per credit granted at login.
///
/// A slot's work-request id encodes the slot index, so completions map back without a lookup.
#[derive(Debug)]
pub struct RecvPool {
    posted: Vec<bool>,
    buf_len: u32,
}

impl RecvPool {
    /// `count` slots of `buf_len` bytes each.
    pub fn new(count: usize, buf_len: u32) -> RecvPool {
        RecvPool {
            posted: vec![false; count],
            buf_len,
        }
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.posted.len()
    }

    /// Returns `true` if the pool has no slots.
    pub fn is_empty(&self) -> bool {
        self.posted.is_empty()
    }

    /// Size of each receive buffer.
    pub fn buf_len(&self) -> u32 {
        self.buf_len
    }

    /// Work-request id of `slot`.
    pub fn wr_id(slot: usize) -> u64 {
        RECV_WR_FLAG | slot as u64
    }

    /// Slot encoded in a receive work-request id.
    pub fn slot_of(wr_id: u64) -> Option<usize> {
        if wr_id & RECV_WR_FLAG != 0 {
            Some((wr_id & !RECV_WR_FLAG) as usize)
        } else {
            None
        }
    }

    /// Record that `slot` has been posted.
    pub fn mark_posted(&mut self, slot: usize) {
        if let Some(p) = self.posted.get_mut(slot) {
            *p = true;
        }
    }

    /// Record the completion of `slot`; `false` if it was not posted.
    pub fn mark_completed(&mut self, slot: usize) -> bool {
        match self.posted.get_mut(slot) {
            Some(p) if *p => {
                *p = false;
                true
            }
            _ => false,
        }
    }

    /// Number of slots currently posted.
    pub fn posted(&self) -> usize {
        self.posted.iter().filter(|p| **p).count()
    }
}

/// Describe the data buffer of `request` for a channel.
///
/// Single regions use a direct descriptor. Multiple regions need a target that accepts indirect
/// descriptors: they are remapped through `fmr` when an entry is free, and otherwise go out as an
/// indirect table if it fits.
///
/// # Errors
///
///  - `InsufficientResources`: the regions cannot be described with what the channel has.
pub fn describe(
    request: &ScsiRequest,
    indirect: bool,
    max_sg: usize,
    fmr: Option<&FmrPool>,
) -> Result<(DataBuffer, Option<FmrHandle>)> {
    let (buffer, handle) = match request.segments.as_slice() {
        [] => (DataBuffer::None, None),
        [one] => (DataBuffer::Direct(*one), None),
        _ if !indirect => return Err(Error::InsufficientResources),
        many => match fmr.map(|pool| pool.map(many)) {
            Some(Ok(handle)) => (DataBuffer::Direct(handle.segment()), Some(handle)),
            Some(Err(Error::InsufficientResources)) | None => {
                if many.len() <= max_sg {
                    (DataBuffer::Indirect(many.to_vec()), None)
                } else {
                    return Err(Error::InsufficientResources);
                }
            }
            Some(Err(e)) => return Err(e),
        },
    };
    if request.direction == DataDirection::None && buffer != DataBuffer::None {
        return Err(Error::InvalidParameter("data buffer without a data direction"));
    }
    Ok((buffer, handle))
}

/// Split a described buffer into its out and in halves.
pub fn by_direction(direction: DataDirection, buffer: DataBuffer) -> (DataBuffer, DataBuffer) {
    match direction {
        DataDirection::Write => (buffer, DataBuffer::None),
        DataDirection::Read => (DataBuffer::None, buffer),
        DataDirection::None => (DataBuffer::None, DataBuffer::None),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::srp::mock::MockTransport;
    use crate::srp::Segment;
    use std::sync::Arc;

    fn segment(addr: u64, len: u32) -> Segment {
        Segment { addr, key: 0, len }
    }

    fn command(id: u64, tag: u64, lun: u64) -> SendDescriptor {
        SendDescriptor::new(
            tag,
            lun,
            Work::Command(ScsiRequest {
                id,
                lun,
                ..ScsiRequest::default()
            }),
            vec![0; 48],
            None,
        )
    }

    #[test]
    fn sent_set_take_is_single_shot() {
        let mut sent = SentSet::default();
        sent.insert(command(1, 10, 0));
        sent.insert(command(2, 11, 0));
        assert!(sent.take(10).is_some());
        assert!(sent.take(10).is_none());
        assert_eq!(sent.take_request(2).map(|d| d.tag()), Some(11));
        assert!(sent.is_empty());
    }

    #[test]
    fn pending_lun_removal_keeps_order() {
        let mut pending = PendingQueue::default();
        for (tag, lun) in [(1, 0), (2, 1), (3, 0), (4, 1), (5, 0)] {
            pending.push_back(command(tag, tag, lun));
        }
        let taken = pending.take_lun(1);
        assert_eq!(taken.iter().map(|d| d.tag()).collect::<Vec<_>>(), vec![2, 4]);
        assert_eq!(pending.tags(), vec![1, 3, 5]);
        assert_eq!(pending.remove_request(3).map(|d| d.tag()), Some(3));
        assert_eq!(pending.tags(), vec![1, 5]);
    }

    #[test]
    fn recv_wr_ids_encode_slot() {
        let mut pool = RecvPool::new(4, 4096);
        let wr = RecvPool::wr_id(3);
        assert_eq!(RecvPool::slot_of(wr), Some(3));
        assert_eq!(RecvPool::slot_of(3), None);
        pool.mark_posted(3);
        assert_eq!(pool.posted(), 1);
        assert!(pool.mark_completed(3));
        assert!(!pool.mark_completed(3));
    }

    #[test]
    fn fmr_exhaustion_falls_back_to_indirect() {
        let transport = Arc::new(MockTransport::default());
        let pool = FmrPool::new(transport.clone(), 1);
        let req = ScsiRequest {
            direction: DataDirection::Read,
            segments: vec![segment(0x1000, 512), segment(0x8000, 512)],
            ..ScsiRequest::default()
        };

        let (buf, handle) = describe(&req, true, 8, Some(&pool)).unwrap();
        assert!(matches!(buf, DataBuffer::Direct(s) if s.len == 1024));
        assert!(handle.is_some());
        assert_eq!(pool.available(), 0);

        let (buf, none) = describe(&req, true, 8, Some(&pool)).unwrap();
        assert!(matches!(buf, DataBuffer::Indirect(ref v) if v.len() == 2));
        assert!(none.is_none());

        assert_eq!(
            describe(&req, true, 1, Some(&pool)).unwrap_err(),
            Error::InsufficientResources
        );

        drop(handle);
        assert_eq!(pool.available(), 1);
        assert_eq!(transport.unmapped(), 1);
    }

    #[test]
    fn direct_only_channel_refuses_scattered_buffers() {
        let transport = Arc::new(MockTransport::default());
        let pool = FmrPool::new(transport.clone(), 4);
        let req = ScsiRequest {
            direction: DataDirection::Write,
            segments: vec![segment(0x1000, 512), segment(0x8000, 512)],
            ..ScsiRequest::default()
        };
        assert_eq!(
            describe(&req, false, 0, Some(&pool)).unwrap_err(),
            Error::InsufficientResources
        );
        assert_eq!(pool.available(), 4);

        let single = ScsiRequest {
            segments: vec![segment(0x1000, 512)],
            ..req
        };
        let (buf, handle) = describe(&single, false, 0, Some(&pool)).unwrap();
        assert_eq!(buf, DataBuffer::Direct(segment(0x1000, 512)));
        assert!(handle.is_none());
    }

    #[test]
    fn fmr_released_exactly_once() {
        let transport = Arc::new(MockTransport::default());
        let pool = FmrPool::new(transport.clone(), 2);
        let desc = SendDescriptor::new(
            1,
            0,
            Work::Task {
                function: TaskFunction::AbortTask,
                task_tag: 0,
            },
            vec![],
            Some(pool.map(&[segment(0, 8), segment(64, 8)]).unwrap()),
        );
        let _work = desc.into_work();
        assert_eq!(transport.unmapped(), 1);
        assert_eq!(pool.available(), 2);
    }
}
