//! Path and service records, and the queries built on them.

use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::{RequestContext, RequestHandle, SaRequest, SaResponse};
use crate::event::OneShot;
use crate::mad::{read_u32, read_u64, MadMethod};
use crate::{Error, Result};

/// SA attribute id of `ServiceRecord`.
pub const ATTR_SERVICE_RECORD: u16 = 0x0031;
/// SA attribute id of `PathRecord`.
pub const ATTR_PATH_RECORD: u16 = 0x0035;

/// A 128-bit global identifier.
pub type Gid = [u8; 16];

/// Build a GID from a subnet prefix and a port GUID.
pub fn gid_from_guid(subnet_prefix: u64, guid: u64) -> Gid {
    let mut gid = [0u8; 16];
    gid[..8].copy_from_slice(&subnet_prefix.to_be_bytes());
    gid[8..].copy_from_slice(&guid.to_be_bytes());
    gid
}

/// Component-mask bits of `PathRecord`.
pub mod path_mask {
    /// Destination GID.
    pub const DGID: u64 = 1 << 2;
    /// Source GID.
    pub const SGID: u64 = 1 << 3;
    /// Destination LID.
    pub const DLID: u64 = 1 << 4;
    /// Source LID.
    pub const SLID: u64 = 1 << 5;
    /// Reversible paths only.
    pub const REVERSIBLE: u64 = 1 << 11;
    /// Maximum number of paths to return.
    pub const NUMB_PATH: u64 = 1 << 12;
    /// Partition key.
    pub const PKEY: u64 = 1 << 13;
}

/// Component-mask bits of `ServiceRecord`.
pub mod service_mask {
    /// Service id.
    pub const ID: u64 = 1 << 0;
    /// Service GID.
    pub const GID: u64 = 1 << 1;
    /// Partition key.
    pub const PKEY: u64 = 1 << 2;
    /// Lease.
    pub const LEASE: u64 = 1 << 4;
    /// Service key.
    pub const KEY: u64 = 1 << 5;
    /// Service name.
    pub const NAME: u64 = 1 << 6;
}

/// A path between two ports, as returned by the subnet administrator.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PathRecord {
    /// Destination GID.
    pub dgid: Gid,
    /// Source GID.
    pub sgid: Gid,
    /// Destination LID.
    pub dlid: u16,
    /// Source LID.
    pub slid: u16,
    /// Raw-traffic bit, flow label and hop limit.
    pub hop_flow_raw: u32,
    /// Traffic class.
    pub tclass: u8,
    /// Reversible bit and path count.
    pub num_path: u8,
    /// Partition key.
    pub pkey: u16,
    /// Service level.
    pub sl: u8,
    /// MTU selector and code.
    pub mtu: u8,
    /// Rate selector and code.
    pub rate: u8,
    /// Packet-lifetime selector and exponent.
    pub pkt_life: u8,
    /// Preference among multiple paths.
    pub preference: u8,
}

impl PathRecord {
    /// Encoded size of a path record.
    pub const SIZE: usize = 64;

    /// Encode into `buf`, which must hold at least [`PathRecord::SIZE`] bytes.
    pub fn encode(&self, buf: &mut [u8]) {
        let b = &mut buf[..Self::SIZE];
        b.fill(0);
        b[8..24].copy_from_slice(&self.dgid);
        b[24..40].copy_from_slice(&self.sgid);
        b[40..42].copy_from_slice(&self.dlid.to_be_bytes());
        b[42..44].copy_from_slice(&self.slid.to_be_bytes());
        b[44..48].copy_from_slice(&self.hop_flow_raw.to_be_bytes());
        b[48] = self.tclass;
        b[49] = self.num_path;
        b[50..52].copy_from_slice(&self.pkey.to_be_bytes());
        b[53] = self.sl & 0x0f;
        b[54] = self.mtu;
        b[55] = self.rate;
        b[56] = self.pkt_life;
        b[57] = self.preference;
    }

    /// Decode from `buf`.
    ///
    /// # Errors
    ///
    ///  - `Protocol`: `buf` is shorter than a record.
    pub fn decode(buf: &[u8]) -> Result<PathRecord> {
        if buf.len() < Self::SIZE {
            return Err(Error::Protocol("short path record"));
        }
        let mut dgid = [0u8; 16];
        let mut sgid = [0u8; 16];
        dgid.copy_from_slice(&buf[8..24]);
        sgid.copy_from_slice(&buf[24..40]);
        Ok(PathRecord {
            dgid,
            sgid,
            dlid: u16::from_be_bytes([buf[40], buf[41]]),
            slid: u16::from_be_bytes([buf[42], buf[43]]),
            hop_flow_raw: read_u32(buf, 44),
            tclass: buf[48],
            num_path: buf[49],
            pkey: u16::from_be_bytes([buf[50], buf[51]]),
            sl: buf[53] & 0x0f,
            mtu: buf[54],
            rate: buf[55],
            pkt_life: buf[56],
            preference: buf[57],
        })
    }

    /// Packet-lifetime exponent, without the selector bits.
    pub fn packet_lifetime(&self) -> u8 {
        self.pkt_life & 0x3f
    }

    /// Round-trip timeout exponent for connection requests on this path.
    ///
    /// Used for both the local and the remote response-timeout fields.
    pub fn round_trip_timeout(&self) -> u8 {
        (self.packet_lifetime() + 1).min(0x1f)
    }
}

/// A service registration record.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServiceRecord {
    /// Service id.
    pub id: u64,
    /// GID of the port providing the service.
    pub gid: Gid,
    /// Partition key.
    pub pkey: u16,
    /// Lease in seconds; `u32::MAX` for indefinite.
    pub lease: u32,
    /// Service key.
    pub key: [u8; 16],
    /// Service name, at most 64 bytes.
    pub name: String,
    /// Opaque service data.
    pub data: [u8; 16],
}

impl ServiceRecord {
    /// Encoded size of a service record.
    pub const SIZE: usize = 176;
    const NAME_LEN: usize = 64;

    /// Encode into `buf`, which must hold at least [`ServiceRecord::SIZE`] bytes.
    ///
    /// # Errors
    ///
    ///  - `InvalidParameter`: the name is longer than 64 bytes.
    pub fn encode(&self, buf: &mut [u8]) -> Result<()> {
        if self.name.len() > Self::NAME_LEN {
            return Err(Error::InvalidParameter("service name longer than 64 bytes"));
        }
        let b = &mut buf[..Self::SIZE];
        b.fill(0);
        b[0..8].copy_from_slice(&self.id.to_be_bytes());
        b[8..24].copy_from_slice(&self.gid);
        b[24..26].copy_from_slice(&self.pkey.to_be_bytes());
        b[28..32].copy_from_slice(&self.lease.to_be_bytes());
        b[32..48].copy_from_slice(&self.key);
        b[48..48 + self.name.len()].copy_from_slice(self.name.as_bytes());
        b[112..128].copy_from_slice(&self.data);
        Ok(())
    }

    /// Decode from `buf`.
    ///
    /// # Errors
    ///
    ///  - `Protocol`: `buf` is shorter than a record or the name is not UTF-8.
    pub fn decode(buf: &[u8]) -> Result<ServiceRecord> {
        if buf.len() < Self::SIZE {
            return Err(Error::Protocol("short service record"));
        }
        let name = &buf[48..48 + Self::NAME_LEN];
        let end = name.iter().position(|b| *b == 0).unwrap_or(Self::NAME_LEN);
        let name = std::str::from_utf8(&name[..end])
            .map_err(|_| Error::Protocol("service name is not UTF-8"))?
            .to_owned();
        let mut rec = ServiceRecord {
            id: read_u64(buf, 0),
            pkey: u16::from_be_bytes([buf[24], buf[25]]),
            lease: read_u32(buf, 28),
            name,
            ..ServiceRecord::default()
        };
        rec.gid.copy_from_slice(&buf[8..24]);
        rec.key.copy_from_slice(&buf[32..48]);
        rec.data.copy_from_slice(&buf[112..128]);
        Ok(rec)
    }
}

/// Parameters of a path-record query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathQuery {
    /// Port the query is sent from.
    pub port_guid: u64,
    /// Source GID.
    pub sgid: Gid,
    /// Destination GID.
    pub dgid: Gid,
    /// Partition key to restrict the query to.
    pub pkey: Option<u16>,
    /// Maximum number of paths to return.
    pub max_paths: u8,
}

impl PathQuery {
    /// Build the `GetTable` request for this query.
    pub fn to_request(&self) -> SaRequest {
        let rec = PathRecord {
            dgid: self.dgid,
            sgid: self.sgid,
            pkey: self.pkey.unwrap_or(0),
            // reversible, path count
            num_path: 0x80 | (self.max_paths.max(1) & 0x7f),
            ..PathRecord::default()
        };
        let mut payload = vec![0u8; PathRecord::SIZE];
        rec.encode(&mut payload);
        let mut mask =
            path_mask::DGID | path_mask::SGID | path_mask::REVERSIBLE | path_mask::NUMB_PATH;
        if self.pkey.is_some() {
            mask |= path_mask::PKEY;
        }
        SaRequest {
            component_mask: mask,
            payload,
            ..SaRequest::new(self.port_guid, MadMethod::GetTable, ATTR_PATH_RECORD)
        }
    }
}

fn decode_paths(resp: &SaResponse) -> Result<Vec<PathRecord>> {
    resp.status.clone()?;
    resp.records(PathRecord::SIZE)
        .map(PathRecord::decode)
        .filter(|r| !matches!(r, Ok(p) if p.dlid == 0 && p.dgid == [0; 16]))
        .collect()
}

impl RequestContext {
    /// Query the paths matching `query`; `callback` receives the decoded records.
    ///
    /// # Errors
    ///
    /// See [`RequestContext::send`].
    pub fn query_paths(
        &self,
        query: &PathQuery,
        callback: impl FnOnce(Result<Vec<PathRecord>>) + Send + 'static,
    ) -> Result<RequestHandle> {
        self.send(query.to_request(), move |resp| callback(decode_paths(&resp)))
    }

    /// Blocking form of [`RequestContext::query_paths`].
    pub fn query_paths_blocking(
        &self,
        query: &PathQuery,
        timeout: Duration,
    ) -> Result<Vec<PathRecord>> {
        let resp = self.query_blocking(query.to_request(), timeout)?;
        decode_paths(&resp)
    }

    /// Register `record` with the subnet administrator through `port_guid`.
    pub fn register_service(
        &self,
        port_guid: u64,
        record: &ServiceRecord,
        callback: impl FnOnce(Result<()>) + Send + 'static,
    ) -> Result<RequestHandle> {
        self.send(
            service_request(port_guid, MadMethod::Set, record)?,
            move |resp| callback(resp.status),
        )
    }

    /// Remove a registration made with [`RequestContext::register_service`].
    pub fn deregister_service(
        &self,
        port_guid: u64,
        record: &ServiceRecord,
        callback: impl FnOnce(Result<()>) + Send + 'static,
    ) -> Result<RequestHandle> {
        self.send(
            service_request(port_guid, MadMethod::Delete, record)?,
            move |resp| callback(resp.status),
        )
    }

    /// Register `record` and block until the subnet administrator answers.
    ///
    /// The returned [`ServiceRegistration`] deregisters the record when dropped.
    pub fn register_service_blocking(
        &self,
        port_guid: u64,
        record: ServiceRecord,
        timeout: Duration,
    ) -> Result<ServiceRegistration> {
        let slot = Arc::new(OneShot::new());
        let s = slot.clone();
        let handle = self.register_service(port_guid, &record, move |r| {
            s.set(r);
        })?;
        match slot.wait_timeout(timeout) {
            Some(r) => r?,
            None => {
                self.cancel(handle);
                return Err(Error::Timeout);
            }
        }
        tracing::info!(service_id = format_args!("{:#x}", record.id), name = %record.name, "service registered");
        Ok(ServiceRegistration {
            ctx: self.clone(),
            port_guid,
            record: Some(record),
        })
    }
}

fn service_request(port_guid: u64, method: MadMethod, record: &ServiceRecord) -> Result<SaRequest> {
    let mut payload = vec![0u8; ServiceRecord::SIZE];
    record.encode(&mut payload)?;
    Ok(SaRequest {
        component_mask: service_mask::ID
            | service_mask::GID
            | service_mask::PKEY
            | service_mask::NAME,
        payload,
        ..SaRequest::new(port_guid, method, ATTR_SERVICE_RECORD)
    })
}

/// A live service registration; deregistered on drop.
#[derive(Debug)]
pub struct ServiceRegistration {
    ctx: RequestContext,
    port_guid: u64,
    record: Option<ServiceRecord>,
}

impl ServiceRegistration {
    /// The registered record.
    pub fn record(&self) -> Option<&ServiceRecord> {
        self.record.as_ref()
    }

    /// Deregister now, reporting the outcome to `callback`.
    pub fn deregister(
        mut self,
        callback: impl FnOnce(Result<()>) + Send + 'static,
    ) -> Result<()> {
        match self.record.take() {
            Some(record) => self
                .ctx
                .deregister_service(self.port_guid, &record, callback)
                .map(|_| ()),
            None => Ok(()),
        }
    }
}

impl Drop for ServiceRegistration {
    fn drop(&mut self) {
        if let Some(record) = self.record.take() {
            if let Err(e) = self.ctx.deregister_service(self.port_guid, &record, |_| {}) {
                tracing::warn!(error = %e, name = %record.name, "service deregistration not sent");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn path_record_layout() {
        let rec = PathRecord {
            dgid: gid_from_guid(0xfe80_0000_0000_0000, 0x0002_c903_0000_0001),
            sgid: gid_from_guid(0xfe80_0000_0000_0000, 0x0002_c903_0000_0002),
            dlid: 7,
            slid: 9,
            pkey: 0xffff,
            sl: 3,
            mtu: 0x84,
            pkt_life: 0x92,
            ..PathRecord::default()
        };
        let mut buf = [0u8; PathRecord::SIZE];
        rec.encode(&mut buf);
        assert_eq!(&buf[40..42], &[0, 7]);
        assert_eq!(buf[8], 0xfe);
        assert_eq!(PathRecord::decode(&buf).unwrap(), rec);
        assert_eq!(rec.packet_lifetime(), 0x12);
        assert_eq!(rec.round_trip_timeout(), 0x13);
    }

    #[test]
    fn round_trip_timeout_saturates() {
        let rec = PathRecord {
            pkt_life: 0x3f,
            ..PathRecord::default()
        };
        assert_eq!(rec.round_trip_timeout(), 0x1f);
    }

    #[test]
    fn service_record_name_limits() {
        let mut rec = ServiceRecord {
            id: 0x0002_c903_0000_0100,
            name: "SRP.T10:0002C90300000100".into(),
            lease: u32::MAX,
            ..ServiceRecord::default()
        };
        let mut buf = [0u8; ServiceRecord::SIZE];
        rec.encode(&mut buf).unwrap();
        assert_eq!(ServiceRecord::decode(&buf).unwrap(), rec);

        rec.name = "x".repeat(65);
        assert!(rec.encode(&mut buf).is_err());
    }

    #[test]
    fn path_query_mask() {
        let q = PathQuery {
            port_guid: 1,
            sgid: [1; 16],
            dgid: [2; 16],
            pkey: Some(0x8001),
            max_paths: 4,
        };
        let req = q.to_request();
        assert_eq!(req.method, MadMethod::GetTable);
        assert_eq!(req.attr_id, ATTR_PATH_RECORD);
        assert_ne!(req.component_mask & path_mask::PKEY, 0);
        let decoded = PathRecord::decode(&req.payload).unwrap();
        assert_eq!(decoded.num_path, 0x84);
        assert_eq!(decoded.pkey, 0x8001);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn path_record_encode_decode_serde() {
        let rec = PathRecord {
            dlid: 3,
            dgid: [9; 16],
            ..PathRecord::default()
        };
        let encoded = bincode::serialize(&rec).unwrap();
        assert_eq!(bincode::deserialize::<PathRecord>(&encoded).unwrap(), rec);
    }
}
