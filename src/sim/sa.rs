//! A subnet administrator answering path and service record requests.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::Dispatcher;
use crate::error::WcStatus;
use crate::mad::{MadDone, MadMethod, MadSend, MadTransport, SaMadHeader, Tid, MAD_BLOCK_SIZE, SA_DATA_OFFSET};
use crate::sa::{path_mask, service_mask, PathRecord, ServiceRecord, ATTR_PATH_RECORD, ATTR_SERVICE_RECORD};
use crate::Result;

/// SA status: no records matched.
pub const STATUS_NO_RECORDS: u16 = 0x0300;
/// MAD status: unsupported method/attribute combination.
pub const STATUS_UNSUPPORTED: u16 = 0x000c;

#[derive(Default)]
struct State {
    paths: Vec<PathRecord>,
    services: Vec<ServiceRecord>,
    held: HashMap<(u64, Tid), (MadSend, MadDone)>,
}

/// An in-process SA.
///
/// Requests are answered from the dispatcher thread, or kept while holding is switched on so
/// tests can exercise timeouts and cancellation.
#[derive(Clone)]
pub struct SimSa {
    state: Arc<Mutex<State>>,
    hold: Arc<AtomicBool>,
    dispatcher: Arc<Dispatcher>,
}

impl fmt::Debug for SimSa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SimSa")
            .field("paths", &state.paths.len())
            .field("services", &state.services.len())
            .field("held", &state.held.len())
            .finish()
    }
}

impl SimSa {
    /// An SA that knows `paths`.
    ///
    /// # Errors
    ///
    ///  - `InsufficientResources`: the dispatcher thread could not be started.
    pub fn new(paths: Vec<PathRecord>) -> Result<SimSa> {
        Ok(SimSa {
            state: Arc::new(Mutex::new(State {
                paths,
                ..State::default()
            })),
            hold: Arc::new(AtomicBool::new(false)),
            dispatcher: Dispatcher::new("sim-sa")?,
        })
    }

    /// Replace the path table.
    pub fn set_paths(&self, paths: Vec<PathRecord>) {
        self.state.lock().paths = paths;
    }

    /// Currently registered services.
    pub fn services(&self) -> Vec<ServiceRecord> {
        self.state.lock().services.clone()
    }

    /// Keep requests unanswered (`true`) or answer them (`false`).
    pub fn set_hold(&self, hold: bool) {
        self.hold.store(hold, Ordering::SeqCst);
    }

    /// Number of requests currently held.
    pub fn held(&self) -> usize {
        self.state.lock().held.len()
    }

    /// Answer every held request.
    pub fn release_held(&self) -> usize {
        let held: Vec<_> = self.state.lock().held.drain().map(|(_, v)| v).collect();
        let count = held.len();
        for (send, done) in held {
            self.answer(send, done);
        }
        count
    }

    /// Wait until every answer produced so far has been delivered.
    pub fn flush(&self, timeout: Duration) -> bool {
        self.dispatcher.flush(timeout)
    }

    fn answer(&self, send: MadSend, done: MadDone) {
        let state = self.state.clone();
        self.dispatcher.run(move || {
            let response = respond(&mut state.lock(), send.buffer.as_bytes());
            done.complete(WcStatus::Success, send.buffer, Some(response));
        });
    }
}

fn respond(state: &mut State, request: &[u8]) -> Vec<u8> {
    let hdr = match SaMadHeader::decode(request) {
        Ok(hdr) => hdr,
        Err(_) => return reply(None, STATUS_UNSUPPORTED, 0, Vec::new()),
    };
    let data = &request[SA_DATA_OFFSET..];
    trace!(tid = %hdr.tid, attr_id = hdr.attr_id, method = ?hdr.method, "sim SA request");
    match (hdr.attr_id, hdr.method) {
        (ATTR_PATH_RECORD, MadMethod::Get | MadMethod::GetTable) => {
            let Ok(query) = PathRecord::decode(data) else {
                return reply(Some(&hdr), STATUS_UNSUPPORTED, 0, Vec::new());
            };
            let matches: Vec<PathRecord> = state
                .paths
                .iter()
                .filter(|p| hdr.component_mask & path_mask::DGID == 0 || p.dgid == query.dgid)
                .filter(|p| hdr.component_mask & path_mask::SGID == 0 || p.sgid == query.sgid)
                .filter(|p| hdr.component_mask & path_mask::PKEY == 0 || p.pkey == query.pkey)
                .copied()
                .collect();
            if matches.is_empty() {
                return reply(Some(&hdr), STATUS_NO_RECORDS, 0, Vec::new());
            }
            let mut out = vec![0u8; matches.len() * PathRecord::SIZE];
            for (rec, chunk) in matches.iter().zip(out.chunks_mut(PathRecord::SIZE)) {
                rec.encode(chunk);
            }
            reply(Some(&hdr), 0, PathRecord::SIZE, out)
        }
        (ATTR_SERVICE_RECORD, MadMethod::Set) => {
            let Ok(rec) = ServiceRecord::decode(data) else {
                return reply(Some(&hdr), STATUS_UNSUPPORTED, 0, Vec::new());
            };
            state
                .services
                .retain(|s| !(s.id == rec.id && s.gid == rec.gid));
            debug!(service_id = rec.id, name = %rec.name, "sim SA registered service");
            let body = encode_service(&rec);
            state.services.push(rec);
            reply(Some(&hdr), 0, 0, body)
        }
        (ATTR_SERVICE_RECORD, MadMethod::Delete) => {
            let Ok(rec) = ServiceRecord::decode(data) else {
                return reply(Some(&hdr), STATUS_UNSUPPORTED, 0, Vec::new());
            };
            let before = state.services.len();
            state
                .services
                .retain(|s| !(s.id == rec.id && s.gid == rec.gid));
            if state.services.len() == before {
                reply(Some(&hdr), STATUS_NO_RECORDS, 0, Vec::new())
            } else {
                debug!(service_id = rec.id, "sim SA deregistered service");
                reply(Some(&hdr), 0, 0, encode_service(&rec))
            }
        }
        (ATTR_SERVICE_RECORD, MadMethod::Get | MadMethod::GetTable) => {
            let Ok(query) = ServiceRecord::decode(data) else {
                return reply(Some(&hdr), STATUS_UNSUPPORTED, 0, Vec::new());
            };
            let matches: Vec<&ServiceRecord> = state
                .services
                .iter()
                .filter(|s| hdr.component_mask & service_mask::ID == 0 || s.id == query.id)
                .filter(|s| hdr.component_mask & service_mask::NAME == 0 || s.name == query.name)
                .collect();
            if matches.is_empty() {
                return reply(Some(&hdr), STATUS_NO_RECORDS, 0, Vec::new());
            }
            let body = matches.iter().flat_map(|s| encode_service(s)).collect();
            reply(Some(&hdr), 0, ServiceRecord::SIZE, body)
        }
        _ => reply(Some(&hdr), STATUS_UNSUPPORTED, 0, Vec::new()),
    }
}

fn encode_service(rec: &ServiceRecord) -> Vec<u8> {
    let mut out = vec![0u8; ServiceRecord::SIZE];
    // records in the table were decoded from valid requests
    if rec.encode(&mut out).is_err() {
        out.clear();
    }
    out
}

fn reply(request: Option<&SaMadHeader>, status: u16, stride: usize, data: Vec<u8>) -> Vec<u8> {
    let mut mad = vec![0u8; (SA_DATA_OFFSET + data.len()).max(MAD_BLOCK_SIZE)];
    let (method, tid, attr_id, attr_mod) = match request {
        Some(h) => (h.method.response(), h.tid, h.attr_id, h.attr_mod),
        None => (MadMethod::GetResp, Tid(0), 0, 0),
    };
    SaMadHeader {
        method,
        status,
        tid,
        attr_id,
        attr_mod,
        attr_offset: (stride / 8) as u16,
        component_mask: 0,
    }
    .encode(&mut mad);
    mad[SA_DATA_OFFSET..SA_DATA_OFFSET + data.len()].copy_from_slice(&data);
    mad
}

impl MadTransport for SimSa {
    fn post(&self, send: MadSend, done: MadDone) -> Result<()> {
        if self.hold.load(Ordering::SeqCst) {
            trace!(tid = %send.tid, "sim SA holding request");
            self.state
                .lock()
                .held
                .insert((send.port_guid, send.tid), (send, done));
            return Ok(());
        }
        self.answer(send, done);
        Ok(())
    }

    fn cancel(&self, port_guid: u64, tid: Tid) {
        let held = self.state.lock().held.remove(&(port_guid, tid));
        if let Some((send, done)) = held {
            debug!(tid = %tid, "sim SA cancelled request");
            self.dispatcher
                .run(move || done.complete(WcStatus::Canceled, send.buffer, None));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{MadConfig, ObjConfig};
    use crate::obj::ObjManager;
    use crate::sa::{gid_from_guid, PathQuery, SaClient};
    use crate::Error;

    const PORT: u64 = 0x0002_c903_0000_0001;
    const WAIT: Duration = Duration::from_secs(2);

    fn path(dguid: u64, dlid: u16) -> PathRecord {
        PathRecord {
            sgid: gid_from_guid(0xfe80_0000_0000_0000, PORT),
            dgid: gid_from_guid(0xfe80_0000_0000_0000, dguid),
            slid: 1,
            dlid,
            pkt_life: 12,
            ..PathRecord::default()
        }
    }

    fn client(sa: &SimSa) -> (ObjManager, SaClient) {
        let mgr = ObjManager::new(ObjConfig::default());
        let client = SaClient::new(&mgr, MadConfig::default()).unwrap();
        client.add_port(PORT, Arc::new(sa.clone())).unwrap();
        (mgr, client)
    }

    fn query(dguid: u64) -> PathQuery {
        PathQuery {
            port_guid: PORT,
            sgid: gid_from_guid(0xfe80_0000_0000_0000, PORT),
            dgid: gid_from_guid(0xfe80_0000_0000_0000, dguid),
            pkey: None,
            max_paths: 4,
        }
    }

    #[test]
    fn path_query_returns_matching_records() {
        let sa = SimSa::new(vec![path(0x10, 5), path(0x20, 6), path(0x10, 7)]).unwrap();
        let (_mgr, client) = client(&sa);
        let ctx = client.create_context().unwrap();
        let paths = ctx.query_paths_blocking(&query(0x10), WAIT).unwrap();
        assert_eq!(paths.iter().map(|p| p.dlid).collect::<Vec<_>>(), vec![5, 7]);
        assert_eq!(
            ctx.query_paths_blocking(&query(0x30), WAIT),
            Err(Error::MadStatus(STATUS_NO_RECORDS))
        );
    }

    #[test]
    fn service_registration_lives_until_drop() {
        let sa = SimSa::new(Vec::new()).unwrap();
        let (_mgr, client) = client(&sa);
        let ctx = client.create_context().unwrap();
        let record = ServiceRecord {
            id: 0x0002_c903_0000_1000,
            gid: gid_from_guid(0xfe80_0000_0000_0000, PORT),
            pkey: 0xffff,
            lease: u32::MAX,
            key: [0; 16],
            name: "SRP.T10:0002c90300001000".into(),
            data: [0; 16],
        };
        let reg = ctx.register_service_blocking(PORT, record.clone(), WAIT).unwrap();
        assert_eq!(sa.services(), vec![record]);
        drop(reg);
        assert!(sa.flush(WAIT));
        assert!(sa.services().is_empty());
    }

    #[test]
    fn held_request_is_cancelled_on_timeout() {
        let sa = SimSa::new(vec![path(0x10, 5)]).unwrap();
        sa.set_hold(true);
        let (_mgr, client) = client(&sa);
        let ctx = client.create_context().unwrap();
        let err = ctx
            .query_paths_blocking(&query(0x10), Duration::from_millis(20))
            .unwrap_err();
        assert_eq!(err, Error::Timeout);
        assert_eq!(sa.held(), 0);
        assert!(sa.flush(WAIT));
        client.close();
    }

    #[test]
    fn released_requests_are_answered() {
        let sa = SimSa::new(vec![path(0x10, 5)]).unwrap();
        sa.set_hold(true);
        let (_mgr, client) = client(&sa);
        let ctx = client.create_context().unwrap();
        let (tx, rx) = crossbeam_channel::bounded(1);
        ctx.query_paths(&query(0x10), move |r| {
            let _ = tx.send(r);
        })
        .unwrap();
        assert_eq!(sa.held(), 1);
        assert_eq!(sa.release_held(), 1);
        let paths = rx.recv_timeout(WAIT).unwrap().unwrap();
        assert_eq!(paths[0].dlid, 5);
    }
}
