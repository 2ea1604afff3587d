use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ibal::config::{Config, ObjConfig, SrpConfig};
use ibal::obj::{DestroyMode, DestroyStatus, ObjHooks, ObjManager, ObjState, ObjType};
use ibal::sa::{gid_from_guid, PathQuery, SaClient};
use ibal::sim::{ResponseMode, SimSa, SimTarget};
use ibal::srp::{RecoveryManager, RequestStatus, SaPathSource, StaticPaths, TargetId, TargetPhase};

const WAIT: Duration = Duration::from_secs(5);

#[test]
fn object_tree_tears_down_leaves_first() {
    helper::init_tracing();
    let mgr = ObjManager::new(ObjConfig::default());
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let node = |ty: ObjType, name: &'static str| {
        let log = order.clone();
        let obj = mgr.construct(ty);
        obj.init(
            DestroyMode::Async,
            ObjHooks::new().free(move |_| log.lock().push(name)),
        )
        .expect("init");
        obj.deref();
        obj
    };

    let ca = node(ObjType::Ca, "ca");
    let service = node(ObjType::SaService, "service");
    let ctx = node(ObjType::RequestContext, "ctx");
    ca.attach(&service).expect("attach service");
    service.attach(&ctx).expect("attach ctx");

    let calls = Arc::new(AtomicU32::new(0));
    let c = calls.clone();
    assert_eq!(
        ca.destroy(Some(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }))),
        DestroyStatus::Pending
    );
    assert!(ca.wait_destroyed(WAIT));
    mgr.wait_idle();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(*order.lock(), vec!["ctx", "service", "ca"]);
    for obj in [&ca, &service, &ctx] {
        assert_eq!(obj.state(), ObjState::Destroyed);
    }
    assert_eq!(mgr.live_count(), 0);
    assert_eq!(mgr.shutdown(), 0);
}

#[test]
fn sim_target_serves_and_recovers_under_same_id() {
    helper::init_tracing();
    let mgr = ObjManager::new(ObjConfig::default());
    let target = SimTarget::new().expect("sim target");
    let sink = Arc::new(helper::Recorder::default());
    let recovery = RecoveryManager::new(
        &mgr,
        Arc::new(target.clone()),
        Arc::new(StaticPaths::new(vec![helper::path(1), helper::path(2)])),
        sink.clone(),
        helper::srp_config(),
    )
    .expect("recovery manager");

    let t = TargetId(7);
    recovery.add_target(t, helper::descriptor()).expect("add target");
    assert!(recovery.wait_phase(t, TargetPhase::Ready, WAIT));

    for id in 0..8 {
        recovery.submit(t, helper::read(id)).expect("submit");
    }
    assert!(target.flush(WAIT));
    assert!(sink.wait_completions(8, WAIT));
    assert!(sink
        .completions()
        .iter()
        .all(|(target, c)| *target == t && c.status == RequestStatus::Success));

    // requests in flight when the link breaks fail back to the caller
    target.set_response_mode(ResponseMode::Hold);
    for id in 100..104 {
        recovery.submit(t, helper::read(id)).expect("submit held");
    }
    assert!(target.flush(WAIT));
    let first = target.latest().expect("first transport");
    assert_eq!(first.held().len(), 4);
    target.set_response_mode(ResponseMode::default());
    first.break_link();

    assert!(helper::wait_until(WAIT, || target.transports().len() == 2));
    assert!(recovery.wait_phase(t, TargetPhase::Ready, WAIT));
    assert!(sink.wait_completions(12, WAIT));
    let failed: Vec<u64> = sink
        .completions()
        .iter()
        .filter(|(_, c)| matches!(c.status, RequestStatus::Failed(_)))
        .map(|(_, c)| c.id)
        .collect();
    assert_eq!(failed.len(), 4);
    assert!(failed.iter().all(|id| (100..104).contains(id)));

    recovery.submit(t, helper::read(200)).expect("submit after recovery");
    assert!(target.flush(WAIT));
    assert!(sink.wait_completions(13, WAIT));
    let snapshot = recovery.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].generation, 2);
    assert_eq!(snapshot[0].phase, TargetPhase::Ready);
    assert_eq!(
        target.latest().expect("second transport").path().dlid,
        2
    );

    assert!(sink.busy().contains(&(t, true)));
    assert!(helper::wait_until(WAIT, || sink.busy().last() == Some(&(t, false))));

    recovery.shutdown();
    mgr.shutdown();
}

#[test]
fn send_error_triggers_recovery() {
    helper::init_tracing();
    let mgr = ObjManager::new(ObjConfig::default());
    let target = SimTarget::new().expect("sim target");
    let sink = Arc::new(helper::Recorder::default());
    let recovery = RecoveryManager::new(
        &mgr,
        Arc::new(target.clone()),
        Arc::new(StaticPaths::new(vec![helper::path(1)])),
        sink.clone(),
        helper::srp_config(),
    )
    .expect("recovery manager");
    let t = TargetId(1);
    recovery.add_target(t, helper::descriptor()).expect("add target");
    assert!(recovery.wait_phase(t, TargetPhase::Ready, WAIT));
    let before = recovery.session(t).expect("session");

    target.latest().expect("transport").fail_next_send();
    recovery.submit(t, helper::read(1)).expect("submit");
    assert!(helper::wait_until(WAIT, || target.transports().len() == 2));
    assert!(recovery.wait_phase(t, TargetPhase::Ready, WAIT));

    let after = recovery.session(t).expect("replacement session");
    assert_ne!(before.obj().id(), after.obj().id());
    assert_eq!(before.obj().state(), ObjState::Destroyed);
    assert!(sink.wait_completions(1, WAIT));
    assert!(matches!(
        sink.completions()[0].1.status,
        RequestStatus::Failed(_)
    ));

    recovery.shutdown();
    mgr.shutdown();
}

#[test]
fn paths_from_subnet_administrator_drive_login() {
    helper::init_tracing();
    let mgr = ObjManager::new(ObjConfig::default());
    let sa = SimSa::new(vec![helper::path(9), helper::path(10)]).expect("sim sa");
    let client = SaClient::new(&mgr, Config::default().mad).expect("sa client");
    client
        .add_port(helper::PORT, Arc::new(sa.clone()))
        .expect("add port");
    assert_eq!(client.ports(), vec![helper::PORT]);

    let ctx = client.create_context().expect("context");
    let query = PathQuery {
        port_guid: helper::PORT,
        sgid: helper::sgid(),
        dgid: helper::descriptor().dgid,
        pkey: None,
        max_paths: 4,
    };
    let paths = ctx.query_paths_blocking(&query, WAIT).expect("paths");
    assert_eq!(paths.iter().map(|p| p.dlid).collect::<Vec<_>>(), vec![9, 10]);

    let target = SimTarget::new().expect("sim target");
    let sink = Arc::new(helper::Recorder::default());
    let recovery = RecoveryManager::new(
        &mgr,
        Arc::new(target.clone()),
        Arc::new(SaPathSource::new(
            client.create_context().expect("context"),
            helper::sgid(),
            WAIT,
        )),
        sink.clone(),
        helper::srp_config(),
    )
    .expect("recovery manager");
    let t = TargetId(3);
    recovery.add_target(t, helper::descriptor()).expect("add target");
    assert!(recovery.wait_phase(t, TargetPhase::Ready, WAIT));
    assert_eq!(target.latest().expect("transport").path().dlid, 9);
    assert_eq!(recovery.snapshot()[0].paths.len(), 2);

    recovery.shutdown();
    assert_eq!(ctx.destroy(), DestroyStatus::Pending);
    client.close();
    mgr.shutdown();
}

#[cfg(feature = "serde")]
#[test]
fn diagnostics_survive_serialization() {
    helper::init_tracing();
    let mgr = ObjManager::new(ObjConfig::default());
    let target = SimTarget::new().expect("sim target");
    let recovery = RecoveryManager::new(
        &mgr,
        Arc::new(target),
        Arc::new(StaticPaths::new(vec![helper::path(1)])),
        Arc::new(helper::Recorder::default()),
        helper::srp_config(),
    )
    .expect("recovery manager");
    let t = TargetId(2);
    recovery.add_target(t, helper::descriptor()).expect("add target");
    assert!(recovery.wait_phase(t, TargetPhase::Ready, WAIT));

    let targets = recovery.snapshot();
    assert!(targets[0].connection.is_some());
    let encoded = bincode::serialize(&targets).expect("encode targets");
    let decoded: Vec<ibal::srp::TargetSnapshot> =
        bincode::deserialize(&encoded).expect("decode targets");
    assert_eq!(decoded, targets);

    let objects = mgr.snapshot();
    assert!(!objects.is_empty());
    let encoded = bincode::serialize(&objects).expect("encode objects");
    let decoded: Vec<ibal::obj::ObjSnapshot> =
        bincode::deserialize(&encoded).expect("decode objects");
    assert_eq!(decoded, objects);

    let config = Config::default();
    let encoded = bincode::serialize(&config).expect("encode config");
    let decoded: Config = bincode::deserialize(&encoded).expect("decode config");
    assert_eq!(decoded.srp.reconnect_attempts, config.srp.reconnect_attempts);
    assert_eq!(decoded.obj.base_timeout, config.obj.base_timeout);

    recovery.shutdown();
    mgr.shutdown();
}

mod helper {
    use super::*;
    use ibal::sa::{Gid, PathRecord};
    use ibal::srp::{
        DataDirection, ScsiCompletion, ScsiRequest, ScsiSink, Segment, TargetDescriptor,
    };
    use parking_lot::Mutex;
    use std::sync::Once;
    use std::time::Instant;

    pub const PORT: u64 = 0x0002_c903_0000_0001;
    const SUBNET: u64 = 0xfe80_0000_0000_0000;
    const TARGET_GUID: u64 = 0x0002_c903_0000_0100;

    pub fn init_tracing() {
        static INIT: Once = Once::new();
        INIT.call_once(|| {
            tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .init();
        });
    }

    pub fn sgid() -> Gid {
        gid_from_guid(SUBNET, PORT)
    }

    pub fn descriptor() -> TargetDescriptor {
        TargetDescriptor {
            id_ext: 1,
            ioc_guid: TARGET_GUID,
            service_id: TARGET_GUID,
            dgid: gid_from_guid(SUBNET, TARGET_GUID),
            vendor_id: 0,
            subsystem_id: 0,
            port_guid: PORT,
            initiator_ext: 0,
        }
    }

    pub fn path(dlid: u16) -> PathRecord {
        PathRecord {
            sgid: sgid(),
            dgid: gid_from_guid(SUBNET, TARGET_GUID),
            slid: 1,
            dlid,
            pkt_life: 12,
            ..PathRecord::default()
        }
    }

    pub fn srp_config() -> SrpConfig {
        SrpConfig {
            login_timeout: WAIT,
            reconnect_attempts: 3,
            reconnect_backoff: Duration::from_millis(1),
            ..SrpConfig::default()
        }
    }

    pub fn read(id: u64) -> ScsiRequest {
        ScsiRequest {
            id,
            lun: 0,
            cdb: vec![0x28, 0, 0, 0, 0, 0, 0, 0, 1, 0],
            direction: DataDirection::Read,
            segments: vec![Segment {
                addr: 0x10_0000 + id * 0x1000,
                key: 0x42,
                len: 512,
            }],
            task_attr: 0,
        }
    }

    pub fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        done()
    }

    /// Records everything the SCSI layer would see.
    #[derive(Default)]
    pub struct Recorder {
        completions: Mutex<Vec<(TargetId, ScsiCompletion)>>,
        busy: Mutex<Vec<(TargetId, bool)>>,
    }

    impl Recorder {
        pub fn completions(&self) -> Vec<(TargetId, ScsiCompletion)> {
            self.completions.lock().clone()
        }

        pub fn busy(&self) -> Vec<(TargetId, bool)> {
            self.busy.lock().clone()
        }

        pub fn wait_completions(&self, n: usize, timeout: Duration) -> bool {
            wait_until(timeout, || self.completions.lock().len() >= n)
        }
    }

    impl ScsiSink for Recorder {
        fn complete(&self, target: TargetId, completion: ScsiCompletion) {
            self.completions.lock().push((target, completion));
        }

        fn set_busy(&self, target: TargetId, busy: bool) {
            self.busy.lock().push((target, busy));
        }
    }
}
