//! Subnet-administration requests and their asynchronous correlation.
//!
//! An [`SaClient`] owns one service instance per bound port. Requests are issued through a
//! [`RequestContext`], which tracks every request it has outstanding by `(port, transaction id)`
//! and matches the transport's completions back to the caller's callback.
//!
//! Completion is the only dispatch point: [`RequestContext::cancel`] merely asks the transport to
//! short-circuit the request, and the callback still arrives through the transport's completion
//! (with [`Error::Cancelled`]). Whatever races, the entry is removed under the context lock
//! before its callback is queued, so every callback runs exactly once, on the worker pool.
//!
//! Destroying a context cancels everything it still has outstanding. Each outstanding request
//! holds a reference on the context, so the context is only finalized after every completion
//! has been delivered.

mod records;

pub use records::{
    gid_from_guid, path_mask, service_mask, Gid, PathQuery, PathRecord, ServiceRecord,
    ATTR_PATH_RECORD, ATTR_SERVICE_RECORD,
};

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::MadConfig;
use crate::error::WcStatus;
use crate::event::OneShot;
use crate::mad::{
    MadCompletion, MadDone, MadMethod, MadPool, MadSend, MadTransport, SaMadHeader, Tid,
    SA_DATA_OFFSET, SA_DATA_SIZE,
};
use crate::obj::{AlObj, DestroyMode, DestroyStatus, ObjHooks, ObjManager, ObjState, ObjType};
use crate::{Error, Result};

/// A request to the subnet administrator.
#[derive(Debug, Clone)]
pub struct SaRequest {
    /// Port the request is sent from.
    pub port_guid: u64,
    /// Request method.
    pub method: MadMethod,
    /// Attribute id, e.g. [`ATTR_PATH_RECORD`].
    pub attr_id: u16,
    /// Attribute modifier.
    pub attr_mod: u32,
    /// Which fields of `payload` are significant.
    pub component_mask: u64,
    /// Encoded attribute; at most [`SA_DATA_SIZE`] bytes.
    pub payload: Vec<u8>,
    /// Per-attempt response timeout; the client default when `None`.
    pub timeout: Option<Duration>,
    /// Retry count; the client default when `None`.
    pub retries: Option<u32>,
}

impl SaRequest {
    /// A request with default timeout and retries.
    pub fn new(port_guid: u64, method: MadMethod, attr_id: u16) -> SaRequest {
        SaRequest {
            port_guid,
            method,
            attr_id,
            attr_mod: 0,
            component_mask: 0,
            payload: Vec::new(),
            timeout: None,
            retries: None,
        }
    }
}

/// The outcome of an [`SaRequest`], delivered to its callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaResponse {
    /// Transaction id the request was sent with.
    pub tid: Tid,
    /// Transport status, or the MAD status of the response.
    pub status: Result<()>,
    /// Attribute data of the response, if one arrived.
    pub payload: Option<Vec<u8>>,
    /// Record stride in bytes for table responses; zero when not given.
    pub record_stride: usize,
}

impl SaResponse {
    /// Split a table response into records of `size` bytes.
    ///
    /// The stride advertised by the responder is honored when present.
    pub fn records(&self, size: usize) -> impl Iterator<Item = &[u8]> + '_ {
        let stride = if self.record_stride >= size {
            self.record_stride
        } else {
            size
        };
        let payload = self.payload.as_deref().unwrap_or(&[]);
        payload
            .chunks(stride)
            .filter(move |c| c.len() >= size)
            .map(move |c| &c[..size])
    }
}

/// Identifies one outstanding request of a [`RequestContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestHandle {
    port_guid: u64,
    tid: Tid,
}

impl RequestHandle {
    /// Transaction id of the request.
    pub fn tid(&self) -> Tid {
        self.tid
    }
}

type Callback = Box<dyn FnOnce(SaResponse) + Send>;

struct PortService {
    port_guid: u64,
    obj: AlObj,
    transport: Arc<dyn MadTransport>,
    pool: MadPool,
    next_tid: AtomicU64,
}

impl PortService {
    fn next_tid(&self) -> Tid {
        Tid(self.next_tid.fetch_add(1, Ordering::Relaxed))
    }
}

struct ClientInner {
    obj: AlObj,
    config: MadConfig,
    services: Mutex<HashMap<u64, Arc<PortService>>>,
}

/// The SA client: per-port service instances plus the contexts issuing requests through them.
#[derive(Clone)]
pub struct SaClient {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for SaClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaClient")
            .field("obj", &self.inner.obj)
            .field("ports", &self.inner.services.lock().len())
            .finish()
    }
}

impl SaClient {
    /// Create a client registered with `manager`.
    pub fn new(manager: &ObjManager, config: MadConfig) -> Result<SaClient> {
        let obj = manager.construct(ObjType::Al);
        let inner = Arc::new(ClientInner {
            obj: obj.clone(),
            config,
            services: Mutex::new(HashMap::new()),
        });
        let weak = Arc::downgrade(&inner);
        obj.init(
            DestroyMode::Sync,
            ObjHooks::new().cleanup(move |_| {
                if let Some(inner) = weak.upgrade() {
                    inner.services.lock().clear();
                }
            }),
        )?;
        obj.deref();
        Ok(SaClient { inner })
    }

    /// The lifecycle node of the client.
    pub fn obj(&self) -> &AlObj {
        &self.inner.obj
    }

    /// Bind a service instance for `port_guid`, sending through `transport`.
    ///
    /// # Errors
    ///
    ///  - `InvalidParameter`: the port is already bound.
    ///  - `InvalidState`: the client is being destroyed.
    pub fn add_port(&self, port_guid: u64, transport: Arc<dyn MadTransport>) -> Result<()> {
        let mut services = self.inner.services.lock();
        if services.contains_key(&port_guid) {
            return Err(Error::InvalidParameter("port already bound"));
        }

        let obj = self.inner.obj.manager().construct(ObjType::SaService);
        obj.init(
            DestroyMode::Async,
            ObjHooks::new().cleanup(move |o| {
                tracing::debug!(obj_id = %o.id(), port_guid = format_args!("{port_guid:#x}"), "SA service released");
            }),
        )?;
        if let Err(e) = self.inner.obj.attach(&obj) {
            obj.destroy(None);
            obj.deref();
            return Err(e);
        }
        obj.deref();

        services.insert(
            port_guid,
            Arc::new(PortService {
                port_guid,
                obj,
                transport,
                pool: MadPool::new(self.inner.config.pool_size),
                next_tid: AtomicU64::new(1),
            }),
        );
        tracing::debug!(port_guid = format_args!("{port_guid:#x}"), "SA service bound");
        Ok(())
    }

    /// Tear down the service instance of `port_guid`.
    ///
    /// Requests already outstanding on the port keep the instance alive until they complete;
    /// new requests fail with `InvalidGuid`.
    pub fn remove_port(&self, port_guid: u64) -> Result<()> {
        let svc = self
            .inner
            .services
            .lock()
            .remove(&port_guid)
            .ok_or(Error::InvalidGuid(port_guid))?;
        svc.obj.destroy(None);
        Ok(())
    }

    /// Ports with a live service instance.
    pub fn ports(&self) -> Vec<u64> {
        self.inner.services.lock().keys().copied().collect()
    }

    fn service(&self, port_guid: u64) -> Result<Arc<PortService>> {
        let svc = self
            .inner
            .services
            .lock()
            .get(&port_guid)
            .cloned()
            .ok_or(Error::InvalidGuid(port_guid))?;
        if svc.obj.state() != ObjState::Initialized {
            return Err(Error::InvalidGuid(port_guid));
        }
        Ok(svc)
    }

    /// Number of MAD buffers currently free on `port_guid`.
    pub fn available_buffers(&self, port_guid: u64) -> Result<usize> {
        Ok(self.service(port_guid)?.pool.available())
    }

    /// Create a context to issue requests from.
    ///
    /// # Errors
    ///
    ///  - `InvalidState`: the client is being destroyed.
    pub fn create_context(&self) -> Result<RequestContext> {
        let obj = self.inner.obj.manager().construct(ObjType::RequestContext);
        let ctx = Arc::new(CtxInner {
            obj: obj.clone(),
            client: Arc::downgrade(&self.inner),
            requests: Mutex::new(Requests::default()),
        });
        let weak = Arc::downgrade(&ctx);
        obj.init(
            DestroyMode::Async,
            ObjHooks::new().destroying(move |_| {
                if let Some(ctx) = weak.upgrade() {
                    ctx.cancel_all();
                }
            }),
        )?;
        if let Err(e) = self.inner.obj.attach(&obj) {
            obj.destroy(None);
            obj.deref();
            return Err(e);
        }
        obj.deref();
        Ok(RequestContext { inner: ctx })
    }

    /// Destroy the client, its service instances and every context created from it.
    pub fn close(&self) -> DestroyStatus {
        self.inner.obj.destroy(None)
    }
}

struct Outstanding {
    callback: Callback,
    service: Arc<PortService>,
}

#[derive(Default)]
struct Requests {
    /// Set by the teardown sweep; no request may be added afterwards.
    closing: bool,
    table: HashMap<RequestHandle, Outstanding>,
}

struct CtxInner {
    obj: AlObj,
    client: Weak<ClientInner>,
    requests: Mutex<Requests>,
}

impl CtxInner {
    fn cancel_all(&self) {
        let targets: Vec<_> = {
            let mut requests = self.requests.lock();
            requests.closing = true;
            requests
                .table
                .iter()
                .map(|(key, out)| (*key, out.service.transport.clone()))
                .collect()
        };
        if !targets.is_empty() {
            tracing::debug!(
                obj_id = %self.obj.id(),
                outstanding = targets.len(),
                "cancelling outstanding SA requests"
            );
        }
        for (key, transport) in targets {
            transport.cancel(key.port_guid, key.tid);
        }
    }

    fn on_completion(self: Arc<Self>, port_guid: u64, done: MadCompletion) {
        let key = RequestHandle {
            port_guid,
            tid: done.tid,
        };
        let Some(out) = self.requests.lock().table.remove(&key) else {
            tracing::trace!(tid = %done.tid, "completion for a request no longer outstanding");
            return;
        };

        let mut response = SaResponse {
            tid: done.tid,
            status: done.status.into_result(),
            payload: None,
            record_stride: 0,
        };
        if let (WcStatus::Success, Some(mad)) = (done.status, done.response.as_deref()) {
            match SaMadHeader::decode(mad) {
                Ok(hdr) if hdr.status != 0 => response.status = Err(Error::MadStatus(hdr.status)),
                Ok(hdr) => {
                    response.payload = Some(mad[SA_DATA_OFFSET..].to_vec());
                    response.record_stride = usize::from(hdr.attr_offset) * 8;
                }
                Err(e) => response.status = Err(e),
            }
        }

        let send_buffer = done.send_buffer;
        let manager = self.obj.manager().clone();
        manager.queue(move || {
            (out.callback)(response);
            drop(send_buffer);
            out.service.obj.deref();
            self.obj.deref();
        });
    }
}

/// A context owning outstanding SA requests.
///
/// Cloning the context yields another handle to the same request list.
#[derive(Clone)]
pub struct RequestContext {
    inner: Arc<CtxInner>,
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("obj", &self.inner.obj)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

impl RequestContext {
    /// The lifecycle node of the context.
    pub fn obj(&self) -> &AlObj {
        &self.inner.obj
    }

    /// Number of requests not yet dispatched to their callbacks.
    pub fn outstanding(&self) -> usize {
        self.inner.requests.lock().table.len()
    }

    /// Send `request`; `callback` runs exactly once with the outcome, on the worker pool.
    ///
    /// # Errors
    ///
    ///  - `InvalidState`: the context is being destroyed.
    ///  - `InvalidGuid`: no live service instance is bound to the request's port.
    ///  - `InsufficientMemory`: the port's MAD pool is exhausted.
    ///  - `InvalidParameter`: the payload does not fit in one MAD.
    ///  - Whatever the transport refused the post with.
    ///
    /// On error the callback is never invoked.
    pub fn send(
        &self,
        request: SaRequest,
        callback: impl FnOnce(SaResponse) + Send + 'static,
    ) -> Result<RequestHandle> {
        if self.inner.obj.state() != ObjState::Initialized {
            return Err(Error::InvalidState);
        }
        if request.payload.len() > SA_DATA_SIZE {
            return Err(Error::InvalidParameter("SA payload larger than one MAD"));
        }
        let client = self.inner.client.upgrade().ok_or(Error::InvalidState)?;
        let client = SaClient { inner: client };
        let svc = client.service(request.port_guid)?;

        let mut buffer = svc.pool.get()?;
        let tid = svc.next_tid();
        let buf = buffer.as_bytes_mut();
        SaMadHeader {
            method: request.method,
            status: 0,
            tid,
            attr_id: request.attr_id,
            attr_mod: request.attr_mod,
            attr_offset: 0,
            component_mask: request.component_mask,
        }
        .encode(buf);
        buf[SA_DATA_OFFSET..SA_DATA_OFFSET + request.payload.len()]
            .copy_from_slice(&request.payload);

        let key = RequestHandle {
            port_guid: svc.port_guid,
            tid,
        };
        // both references are released by the dispatched callback
        if !svc.obj.try_ref() {
            return Err(Error::InvalidGuid(svc.port_guid));
        }
        {
            let mut requests = self.inner.requests.lock();
            if requests.closing || !self.inner.obj.try_ref() {
                drop(requests);
                svc.obj.deref();
                return Err(Error::InvalidState);
            }
            requests.table.insert(
                key,
                Outstanding {
                    callback: Box::new(callback),
                    service: svc.clone(),
                },
            );
        }

        let ctx = self.inner.clone();
        let port_guid = svc.port_guid;
        let done = MadDone::new(tid, move |c| ctx.on_completion(port_guid, c));
        let send = MadSend {
            port_guid,
            tid,
            buffer,
            timeout: request.timeout.unwrap_or(client.inner.config.timeout),
            retries: request.retries.unwrap_or(client.inner.config.retries),
        };
        if let Err(e) = svc.transport.post(send, done) {
            if self.inner.requests.lock().table.remove(&key).is_some() {
                svc.obj.deref();
                self.inner.obj.deref();
            }
            tracing::warn!(tid = %tid, error = %e, "SA request post failed");
            return Err(e);
        }
        tracing::trace!(tid = %tid, attr_id = request.attr_id, method = ?request.method, "SA request posted");
        Ok(key)
    }

    /// Ask the transport to cancel `handle`.
    ///
    /// The callback still runs, through the transport's completion, unless the request had
    /// already completed. Returns `false` if the request is no longer outstanding.
    pub fn cancel(&self, handle: RequestHandle) -> bool {
        let transport = match self.inner.requests.lock().table.get(&handle) {
            Some(out) => out.service.transport.clone(),
            None => return false,
        };
        transport.cancel(handle.port_guid, handle.tid);
        true
    }

    /// Send `request` and block until its outcome arrives or `timeout` elapses.
    ///
    /// Must not be called from a worker-pool thread.
    ///
    /// # Errors
    ///
    /// Everything [`RequestContext::send`] returns; `Timeout` if no completion arrived in time,
    /// in which case the request has been cancelled.
    pub fn query_blocking(&self, request: SaRequest, timeout: Duration) -> Result<SaResponse> {
        let slot = Arc::new(OneShot::new());
        let s = slot.clone();
        let handle = self.send(request, move |resp| {
            s.set(resp);
        })?;
        match slot.wait_timeout(timeout) {
            Some(resp) => Ok(resp),
            None => {
                self.cancel(handle);
                Err(Error::Timeout)
            }
        }
    }

    /// Begin teardown: cancels every outstanding request.
    ///
    /// The context is finalized once the last completion has been delivered.
    pub fn destroy(&self) -> DestroyStatus {
        self.inner.obj.destroy(None)
    }
}
