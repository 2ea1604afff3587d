//! An SRP session: the lifecycle node that owns one channel to one target.

use std::sync::Arc;

use tracing::debug;

use super::connection::{Connection, FailureHandler, Negotiated};
use super::transport::{ScsiSink, TransportFactory};
use super::{TargetDescriptor, TargetId};
use crate::config::SrpConfig;
use crate::obj::{AlObj, DestroyMode, DestroyStatus, ObjHooks, ObjType};
use crate::sa::PathRecord;
use crate::Result;

/// A session bound to one target.
///
/// The session node is destroyed synchronously: [`Session::destroy`] returns once the channel
/// below it has drained every outstanding request and been finalized.
#[derive(Debug, Clone)]
pub struct Session {
    obj: AlObj,
    target: TargetId,
    connection: Arc<Connection>,
}

impl Session {
    /// Open a transport over `path` and create a session and its channel below `parent`.
    ///
    /// The channel is not logged in yet.
    ///
    /// # Errors
    ///
    ///  - `InvalidState`: `parent` is not initialized.
    ///  - Whatever `factory` failed to open the transport with.
    pub fn open(
        parent: &AlObj,
        target: TargetId,
        descriptor: TargetDescriptor,
        path: PathRecord,
        factory: &dyn TransportFactory,
        sink: Arc<dyn ScsiSink>,
        config: SrpConfig,
    ) -> Result<Session> {
        let obj = parent.manager().construct(ObjType::Session);
        obj.init(
            DestroyMode::Sync,
            ObjHooks::new().cleanup(move |o| debug!(obj_id = %o.id(), target_id = %target, "session finalized")),
        )?;
        if let Err(e) = parent.attach(&obj) {
            obj.deref();
            obj.destroy(None);
            return Err(e);
        }

        let connection = factory.open(&path).and_then(|transport| {
            Connection::new(&obj, target, descriptor, path, transport, sink, config)
        });
        let connection = match connection {
            Ok(c) => c,
            Err(e) => {
                obj.deref();
                obj.destroy(None);
                return Err(e);
            }
        };
        obj.deref();
        debug!(obj_id = %obj.id(), target_id = %target, "session opened");
        Ok(Session {
            obj,
            target,
            connection,
        })
    }

    /// Target served.
    pub fn target(&self) -> TargetId {
        self.target
    }

    /// The session's channel.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Lifecycle node of the session.
    pub fn obj(&self) -> &AlObj {
        &self.obj
    }

    /// Log the channel in and wait for the outcome. See [`Connection::login`].
    pub fn login(&self) -> Result<Negotiated> {
        self.connection.login()
    }

    /// Install the channel's failure handler. See [`Connection::set_failure_handler`].
    pub fn set_failure_handler(&self, handler: FailureHandler) {
        self.connection.set_failure_handler(handler);
    }

    /// Tear the session down, draining its channel.
    pub fn destroy(&self) -> DestroyStatus {
        self.obj.destroy(None)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::ObjConfig;
    use crate::obj::{ObjManager, ObjState};
    use crate::srp::mock::{MockFactory, RecordingSink};
    use crate::srp::ConnectionState;
    use crate::Error;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn hba(mgr: &ObjManager) -> AlObj {
        let hba = mgr.construct(ObjType::Hba);
        hba.init(DestroyMode::Sync, ObjHooks::new()).unwrap();
        hba.deref();
        hba
    }

    fn descriptor() -> TargetDescriptor {
        TargetDescriptor {
            id_ext: 1,
            ioc_guid: 2,
            service_id: 3,
            dgid: [0; 16],
            vendor_id: 0,
            subsystem_id: 0,
            port_guid: 4,
            initiator_ext: 0,
        }
    }

    #[test]
    fn destroy_finalizes_session_and_channel() {
        let mgr = ObjManager::new(ObjConfig {
            base_timeout: Duration::from_millis(500),
            ..ObjConfig::default()
        });
        let hba = hba(&mgr);
        let factory = MockFactory::default();
        let session = Session::open(
            &hba,
            TargetId(1),
            descriptor(),
            PathRecord::default(),
            &factory,
            Arc::new(RecordingSink::default()),
            SrpConfig::default(),
        )
        .unwrap();
        assert_eq!(hba.children().len(), 1);
        assert_eq!(session.obj().children().len(), 1);
        assert_eq!(session.connection().state(), ConnectionState::NotConnected);

        assert_eq!(session.destroy(), DestroyStatus::Completed);
        assert_eq!(session.obj().state(), ObjState::Destroyed);
        assert_eq!(session.connection().obj().state(), ObjState::Destroyed);
        assert!(hba.children().is_empty());
        // never connected, so nothing to disconnect
        assert_eq!(factory.opened()[0].disconnects.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failed_open_leaves_nothing_behind() {
        let mgr = ObjManager::new(ObjConfig::default());
        let hba = hba(&mgr);
        let factory = MockFactory::default();
        factory.refuse.store(true, Ordering::SeqCst);
        let err = Session::open(
            &hba,
            TargetId(1),
            descriptor(),
            PathRecord::default(),
            &factory,
            Arc::new(RecordingSink::default()),
            SrpConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert!(hba.children().is_empty());
    }
}
