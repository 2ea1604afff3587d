//! A recording transport that delivers events only when a test asks it to.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::descriptor::CONTROL_WR_FLAG;
use super::iu::{Iu, LoginReject, LoginResponse, Response, Segment, BUF_FORMAT_DIRECT, BUF_FORMAT_INDIRECT};
use super::transport::{
    CaAttributes, ChannelTransport, ConnectRequest, FmrRegion, ScsiSink, TaskReport,
    TransportEvent, TransportEvents, TransportFactory,
};
use crate::sa::PathRecord;
use super::{ScsiCompletion, TargetId};
use crate::error::{RejectReason, WcStatus};
use crate::{Error, Result};

#[derive(Default)]
pub(crate) struct MockTransport {
    pub connects: Mutex<Vec<ConnectRequest>>,
    events: Mutex<Option<Arc<dyn TransportEvents>>>,
    pub recvs: Mutex<Vec<u64>>,
    pub sends: Mutex<Vec<(u64, Vec<u8>)>>,
    pub fail_sends: AtomicBool,
    pub ready: AtomicBool,
    pub disconnects: AtomicUsize,
    mapped: AtomicUsize,
    unmapped: AtomicUsize,
}

impl MockTransport {
    pub fn deliver(&self, event: TransportEvent) {
        let events = self.events.lock().clone().expect("connect not called");
        events.deliver(event);
    }

    pub fn unmapped(&self) -> usize {
        self.unmapped.load(Ordering::SeqCst)
    }

    pub fn accept(&self, limit: u32, formats: u16) {
        let tag = self.last_login().tag;
        let iu = Iu::LoginResponse(LoginResponse {
            tag,
            req_lim_delta: limit,
            max_it_iu_len: 4096,
            max_ti_iu_len: 4096,
            buf_formats: formats,
            flags: 0,
        });
        self.deliver(TransportEvent::ConnectReply {
            private_data: iu.encode().unwrap(),
        });
    }

    pub fn accept_both(&self, limit: u32) {
        self.accept(limit, BUF_FORMAT_DIRECT | BUF_FORMAT_INDIRECT);
    }

    pub fn reject(&self, reason: RejectReason) {
        let tag = self.last_login().tag;
        let iu = Iu::LoginReject(LoginReject::new(tag, reason, BUF_FORMAT_DIRECT));
        self.deliver(TransportEvent::ConnectReject {
            reason: RejectReason::Consumer,
            private_data: iu.encode().unwrap(),
        });
    }

    pub fn last_login(&self) -> super::iu::LoginRequest {
        let connects = self.connects.lock();
        let req = connects.last().expect("no connect request");
        match Iu::decode(&req.private_data).unwrap() {
            Iu::LoginRequest(r) => r,
            other => panic!("unexpected private data {other:?}"),
        }
    }

    /// IUs posted for sending, excluding control IUs.
    pub fn posted_tags(&self) -> Vec<u64> {
        self.sends
            .lock()
            .iter()
            .filter(|(wr, _)| wr & CONTROL_WR_FLAG == 0)
            .map(|(wr, _)| *wr)
            .collect()
    }

    pub fn sent_ius(&self) -> Vec<Iu> {
        self.sends
            .lock()
            .iter()
            .map(|(_, b)| Iu::decode(b).unwrap())
            .collect()
    }

    /// Deliver an IU into the next posted receive buffer.
    pub fn receive(&self, iu: Iu) {
        let wr_id = {
            let mut recvs = self.recvs.lock();
            assert!(!recvs.is_empty(), "no receive posted");
            recvs.remove(0)
        };
        self.deliver(TransportEvent::Recv {
            wr_id,
            status: WcStatus::Success,
            data: iu.encode().unwrap(),
        });
    }

    pub fn respond(&self, tag: u64, delta: i32) {
        self.receive(Iu::Response(Response {
            tag,
            req_lim_delta: delta,
            ..Response::default()
        }));
    }
}

impl ChannelTransport for MockTransport {
    fn query_ca(&self) -> Result<CaAttributes> {
        Ok(CaAttributes {
            max_responder_resources: 4,
            max_initiator_depth: 4,
            max_queue_depth: 1024,
        })
    }

    fn connect(&self, request: ConnectRequest, events: Arc<dyn TransportEvents>) -> Result<()> {
        *self.events.lock() = Some(events);
        self.connects.lock().push(request);
        Ok(())
    }

    fn delay_ack(&self) -> Result<()> {
        Ok(())
    }

    fn ready_to_use(&self) -> Result<()> {
        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn arm_cq(&self) -> Result<()> {
        Ok(())
    }

    fn post_recv(&self, wr_id: u64, _len: u32) -> Result<()> {
        self.recvs.lock().push(wr_id);
        Ok(())
    }

    fn post_send(&self, wr_id: u64, iu: Vec<u8>) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(Error::Transport(WcStatus::WrFlushErr));
        }
        self.sends.lock().push((wr_id, iu));
        Ok(())
    }

    fn map_fmr(&self, segments: &[Segment]) -> Result<FmrRegion> {
        self.mapped.fetch_add(1, Ordering::SeqCst);
        Ok(FmrRegion {
            segment: Segment {
                addr: 0x10_0000,
                key: 0xf00d,
                len: segments.iter().map(|s| s.len).sum(),
            },
        })
    }

    fn unmap_fmr(&self, _region: FmrRegion) {
        self.unmapped.fetch_add(1, Ordering::SeqCst);
    }

    fn disconnect(&self) -> Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct RecordingSink {
    pub completions: Mutex<Vec<(TargetId, ScsiCompletion)>>,
    pub busy: Mutex<Vec<(TargetId, bool)>>,
    pub tasks: Mutex<Vec<TaskReport>>,
    pub events: Mutex<Vec<(TargetId, u64, Vec<u8>)>>,
    pub unreachable: Mutex<Vec<TargetId>>,
}

impl RecordingSink {
    pub fn completed_ids(&self) -> Vec<u64> {
        self.completions.lock().iter().map(|(_, c)| c.id).collect()
    }
}

impl ScsiSink for RecordingSink {
    fn complete(&self, target: TargetId, completion: ScsiCompletion) {
        self.completions.lock().push((target, completion));
    }

    fn set_busy(&self, target: TargetId, busy: bool) {
        self.busy.lock().push((target, busy));
    }

    fn task_management(&self, report: TaskReport) {
        self.tasks.lock().push(report);
    }

    fn async_event(&self, target: TargetId, lun: u64, sense: &[u8]) {
        self.events.lock().push((target, lun, sense.to_vec()));
    }

    fn unreachable(&self, target: TargetId) {
        self.unreachable.lock().push(target);
    }
}

/// Hands out a fresh [`MockTransport`] per open.
#[derive(Default)]
pub(crate) struct MockFactory {
    opened: Mutex<Vec<Arc<MockTransport>>>,
    pub refuse: AtomicBool,
}

impl MockFactory {
    pub fn opened(&self) -> Vec<Arc<MockTransport>> {
        self.opened.lock().clone()
    }

    /// Wait for the `n`th transport (zero-based) to send its login request.
    pub fn wait_login(&self, n: usize) -> Arc<MockTransport> {
        for _ in 0..5000 {
            if let Some(t) = self.opened.lock().get(n) {
                if !t.connects.lock().is_empty() {
                    return t.clone();
                }
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        panic!("transport {n} never sent a login");
    }
}

impl TransportFactory for MockFactory {
    fn open(&self, _path: &PathRecord) -> Result<Arc<dyn ChannelTransport>> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(Error::Transport(WcStatus::RetryExceeded));
        }
        let transport = Arc::new(MockTransport::default());
        self.opened.lock().push(transport.clone());
        Ok(transport)
    }
}
