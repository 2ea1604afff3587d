//! SRP information units.
//!
//! All multi-byte fields are big-endian. Only the fields the channel acts on are modelled; the
//! reserved bytes are written as zero and ignored on decode.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::RejectReason;
use crate::{Error, Result};

/// Information unit opcodes.
pub mod opcode {
    /// Initiator login request.
    pub const LOGIN_REQ: u8 = 0x00;
    /// Task management request.
    pub const TSK_MGMT: u8 = 0x01;
    /// SCSI command.
    pub const CMD: u8 = 0x02;
    /// Initiator logout.
    pub const I_LOGOUT: u8 = 0x03;
    /// Login response.
    pub const LOGIN_RSP: u8 = 0xc0;
    /// Command or task management response.
    pub const RSP: u8 = 0xc1;
    /// Login reject.
    pub const LOGIN_REJ: u8 = 0xc2;
    /// Target logout.
    pub const T_LOGOUT: u8 = 0x80;
    /// Target credit request.
    pub const CRED_REQ: u8 = 0x81;
    /// Target asynchronous event request.
    pub const AER_REQ: u8 = 0x82;
    /// Initiator credit response.
    pub const CRED_RSP: u8 = 0x41;
    /// Initiator asynchronous event response.
    pub const AER_RSP: u8 = 0x42;
}

/// Largest IU this initiator ever builds or accepts.
pub const IU_MAX: usize = 4096;
/// Size of the fixed part of an `SRP_CMD`.
pub const CMD_HEADER_SIZE: usize = 48;
/// Size of the indirect descriptor-table header.
pub const TABLE_HEADER_SIZE: usize = 20;
/// Size of one direct data descriptor.
pub const DESCRIPTOR_SIZE: usize = 16;

/// Login buffer-format bit: single direct descriptor.
pub const BUF_FORMAT_DIRECT: u16 = 1 << 1;
/// Login buffer-format bit: indirect descriptor table.
pub const BUF_FORMAT_INDIRECT: u16 = 1 << 2;

/// `SRP_RSP` flag: response data present.
pub const RSP_FLAG_RSPVALID: u8 = 1 << 0;
/// `SRP_RSP` flag: sense data present.
pub const RSP_FLAG_SNSVALID: u8 = 1 << 1;
/// `SRP_RSP` flag: data-out overflow.
pub const RSP_FLAG_DOOVER: u8 = 1 << 2;
/// `SRP_RSP` flag: data-out underflow.
pub const RSP_FLAG_DOUNDER: u8 = 1 << 3;
/// `SRP_RSP` flag: data-in overflow.
pub const RSP_FLAG_DIOVER: u8 = 1 << 4;
/// `SRP_RSP` flag: data-in underflow.
pub const RSP_FLAG_DIUNDER: u8 = 1 << 5;

const REJ_UNABLE_TO_ESTABLISH: u32 = 0x0001_0000;
const REJ_INSUFFICIENT_RESOURCES: u32 = 0x0001_0001;
const REJ_IU_TOO_LARGE: u32 = 0x0001_0002;
const REJ_UNABLE_TO_ASSOCIATE: u32 = 0x0001_0003;
const REJ_UNSUPPORTED_FORMAT: u32 = 0x0001_0004;

/// One contiguous, registered memory region.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Segment {
    /// Virtual address.
    pub addr: u64,
    /// Remote access key.
    pub key: u32,
    /// Length in bytes.
    pub len: u32,
}

impl Segment {
    fn encode(&self, b: &mut [u8]) {
        b[0..8].copy_from_slice(&self.addr.to_be_bytes());
        b[8..12].copy_from_slice(&self.key.to_be_bytes());
        b[12..16].copy_from_slice(&self.len.to_be_bytes());
    }

    fn decode(b: &[u8]) -> Segment {
        Segment {
            addr: be64(&b[0..8]),
            key: be32(&b[8..12]),
            len: be32(&b[12..16]),
        }
    }
}

/// How a command describes one direction of its data.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DataBuffer {
    /// No data in this direction.
    #[default]
    None,
    /// A single inline descriptor.
    Direct(Segment),
    /// A descriptor table carried inline in the IU.
    Indirect(Vec<Segment>),
}

impl DataBuffer {
    fn format(&self) -> u8 {
        match self {
            DataBuffer::None => 0,
            DataBuffer::Direct(_) => 1,
            DataBuffer::Indirect(_) => 2,
        }
    }

    fn count(&self) -> u8 {
        match self {
            DataBuffer::None => 0,
            DataBuffer::Direct(_) => 1,
            DataBuffer::Indirect(d) => d.len() as u8,
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            DataBuffer::None => 0,
            DataBuffer::Direct(_) => DESCRIPTOR_SIZE,
            DataBuffer::Indirect(d) => TABLE_HEADER_SIZE + d.len() * DESCRIPTOR_SIZE,
        }
    }

    /// Total bytes described.
    pub fn total_len(&self) -> u64 {
        match self {
            DataBuffer::None => 0,
            DataBuffer::Direct(s) => s.len.into(),
            DataBuffer::Indirect(d) => d.iter().map(|s| u64::from(s.len)).sum(),
        }
    }

    fn encode(&self, b: &mut Vec<u8>) {
        match self {
            DataBuffer::None => {}
            DataBuffer::Direct(s) => {
                let at = b.len();
                b.resize(at + DESCRIPTOR_SIZE, 0);
                s.encode(&mut b[at..]);
            }
            DataBuffer::Indirect(d) => {
                let at = b.len();
                b.resize(at + self.encoded_len(), 0);
                let table = Segment {
                    addr: 0,
                    key: 0,
                    len: (d.len() * DESCRIPTOR_SIZE) as u32,
                };
                table.encode(&mut b[at..]);
                b[at + 16..at + 20].copy_from_slice(&(self.total_len() as u32).to_be_bytes());
                for (i, s) in d.iter().enumerate() {
                    let o = at + TABLE_HEADER_SIZE + i * DESCRIPTOR_SIZE;
                    s.encode(&mut b[o..]);
                }
            }
        }
    }

    fn decode(format: u8, count: u8, b: &[u8]) -> Result<(DataBuffer, usize)> {
        match format {
            0 => Ok((DataBuffer::None, 0)),
            1 => {
                need(b, DESCRIPTOR_SIZE)?;
                Ok((DataBuffer::Direct(Segment::decode(b)), DESCRIPTOR_SIZE))
            }
            2 => {
                let len = TABLE_HEADER_SIZE + usize::from(count) * DESCRIPTOR_SIZE;
                need(b, len)?;
                let d = (0..usize::from(count))
                    .map(|i| Segment::decode(&b[TABLE_HEADER_SIZE + i * DESCRIPTOR_SIZE..]))
                    .collect();
                Ok((DataBuffer::Indirect(d), len))
            }
            _ => Err(Error::Protocol("unknown data descriptor format")),
        }
    }
}

/// Task management functions.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskFunction {
    /// Abort one task, named by its tag.
    AbortTask,
    /// Abort every task of the LUN.
    AbortTaskSet,
    /// Clear the task set of the LUN.
    ClearTaskSet,
    /// Reset the LUN.
    LunReset,
    /// Clear an auto contingent allegiance condition.
    ClearAca,
}

impl TaskFunction {
    fn code(self) -> u8 {
        match self {
            TaskFunction::AbortTask => 0x01,
            TaskFunction::AbortTaskSet => 0x02,
            TaskFunction::ClearTaskSet => 0x04,
            TaskFunction::LunReset => 0x08,
            TaskFunction::ClearAca => 0x40,
        }
    }

    fn from_code(code: u8) -> Result<TaskFunction> {
        Ok(match code {
            0x01 => TaskFunction::AbortTask,
            0x02 => TaskFunction::AbortTaskSet,
            0x04 => TaskFunction::ClearTaskSet,
            0x08 => TaskFunction::LunReset,
            0x40 => TaskFunction::ClearAca,
            _ => return Err(Error::Protocol("unknown task management function")),
        })
    }
}

/// `SRP_LOGIN_REQ`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginRequest {
    /// Tag echoed in the response.
    pub tag: u64,
    /// Largest initiator-to-target IU the initiator will send.
    pub max_it_iu_len: u32,
    /// Offered buffer formats, `BUF_FORMAT_*` bits.
    pub buf_formats: u16,
    /// Multi-channel action flags.
    pub flags: u8,
    /// Initiator port identifier.
    pub initiator_port_id: [u8; 16],
    /// Target port identifier.
    pub target_port_id: [u8; 16],
}

/// `SRP_LOGIN_RSP`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginResponse {
    /// Tag of the login request.
    pub tag: u64,
    /// Initial request limit granted.
    pub req_lim_delta: u32,
    /// Largest initiator-to-target IU the target accepts.
    pub max_it_iu_len: u32,
    /// Largest target-to-initiator IU the target will send.
    pub max_ti_iu_len: u32,
    /// Buffer formats the target supports.
    pub buf_formats: u16,
    /// Response flags.
    pub flags: u8,
}

/// `SRP_LOGIN_REJ`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginReject {
    /// Tag of the login request.
    pub tag: u64,
    /// Raw reason code.
    pub reason: u32,
    /// Buffer formats the target supports.
    pub buf_formats: u16,
}

impl LoginReject {
    /// Build a reject for `reason`.
    pub fn new(tag: u64, reason: RejectReason, buf_formats: u16) -> LoginReject {
        let reason = match reason {
            RejectReason::UnsupportedDescriptorFormat => REJ_UNSUPPORTED_FORMAT,
            RejectReason::InsufficientResources => REJ_INSUFFICIENT_RESOURCES,
            RejectReason::IuTooLarge => REJ_IU_TOO_LARGE,
            RejectReason::UnableToAssociate => REJ_UNABLE_TO_ASSOCIATE,
            RejectReason::Other(code) => code,
            RejectReason::Consumer | RejectReason::InvalidServiceId => REJ_UNABLE_TO_ESTABLISH,
        };
        LoginReject {
            tag,
            reason,
            buf_formats,
        }
    }

    /// The interpreted reason.
    pub fn reason(&self) -> RejectReason {
        match self.reason {
            REJ_UNSUPPORTED_FORMAT => RejectReason::UnsupportedDescriptorFormat,
            REJ_INSUFFICIENT_RESOURCES => RejectReason::InsufficientResources,
            REJ_IU_TOO_LARGE => RejectReason::IuTooLarge,
            REJ_UNABLE_TO_ASSOCIATE => RejectReason::UnableToAssociate,
            other => RejectReason::Other(other),
        }
    }
}

/// `SRP_CMD`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Tag echoed in the response.
    pub tag: u64,
    /// Logical unit.
    pub lun: u64,
    /// SCSI task attribute.
    pub task_attr: u8,
    /// Command descriptor block, at most 16 bytes.
    pub cdb: Vec<u8>,
    /// Data sent to the target.
    pub data_out: DataBuffer,
    /// Data received from the target.
    pub data_in: DataBuffer,
}

/// `SRP_TSK_MGMT`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskManagement {
    /// Tag of this request.
    pub tag: u64,
    /// Logical unit.
    pub lun: u64,
    /// Function to perform.
    pub function: TaskFunction,
    /// Tag of the task to act on, for [`TaskFunction::AbortTask`].
    pub task_tag: u64,
}

/// `SRP_RSP`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Response {
    /// Tag of the command or task management request.
    pub tag: u64,
    /// Credits returned to the initiator.
    pub req_lim_delta: i32,
    /// `RSP_FLAG_*` bits.
    pub flags: u8,
    /// SCSI status.
    pub status: u8,
    /// Data-out residual count.
    pub data_out_residual: u32,
    /// Data-in residual count.
    pub data_in_residual: u32,
    /// Response data, for task management.
    pub response_data: Vec<u8>,
    /// Sense data.
    pub sense: Vec<u8>,
}

impl Response {
    /// Signed data-in residual: positive for underflow, negative for overflow.
    pub fn data_in_residual(&self) -> i64 {
        residual(self.flags, RSP_FLAG_DIUNDER, RSP_FLAG_DIOVER, self.data_in_residual)
    }

    /// Signed data-out residual: positive for underflow, negative for overflow.
    pub fn data_out_residual(&self) -> i64 {
        residual(self.flags, RSP_FLAG_DOUNDER, RSP_FLAG_DOOVER, self.data_out_residual)
    }

    /// Task management response code, if response data is present.
    pub fn response_code(&self) -> Option<u8> {
        if self.flags & RSP_FLAG_RSPVALID != 0 {
            self.response_data.get(3).copied()
        } else {
            None
        }
    }
}

fn residual(flags: u8, under: u8, over: u8, count: u32) -> i64 {
    if flags & under != 0 {
        i64::from(count)
    } else if flags & over != 0 {
        -i64::from(count)
    } else {
        0
    }
}

/// An SRP information unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Iu {
    /// `SRP_LOGIN_REQ`
    LoginRequest(LoginRequest),
    /// `SRP_LOGIN_RSP`
    LoginResponse(LoginResponse),
    /// `SRP_LOGIN_REJ`
    LoginReject(LoginReject),
    /// `SRP_CMD`
    Command(Command),
    /// `SRP_TSK_MGMT`
    TaskManagement(TaskManagement),
    /// `SRP_RSP`
    Response(Response),
    /// `SRP_I_LOGOUT`
    InitiatorLogout {
        /// Tag.
        tag: u64,
    },
    /// `SRP_T_LOGOUT`
    TargetLogout {
        /// Tag.
        tag: u64,
        /// Reason code.
        reason: u32,
    },
    /// `SRP_CRED_REQ`
    CreditRequest {
        /// Tag.
        tag: u64,
        /// Credits granted.
        req_lim_delta: i32,
    },
    /// `SRP_CRED_RSP`
    CreditResponse {
        /// Tag of the request.
        tag: u64,
    },
    /// `SRP_AER_REQ`
    AerRequest {
        /// Tag.
        tag: u64,
        /// Credits granted.
        req_lim_delta: i32,
        /// Logical unit the event concerns.
        lun: u64,
        /// Sense data describing the event.
        sense: Vec<u8>,
    },
    /// `SRP_AER_RSP`
    AerResponse {
        /// Tag of the request.
        tag: u64,
    },
}

fn be64(b: &[u8]) -> u64 {
    let mut a = [0u8; 8];
    a.copy_from_slice(&b[..8]);
    u64::from_be_bytes(a)
}

fn be32(b: &[u8]) -> u32 {
    let mut a = [0u8; 4];
    a.copy_from_slice(&b[..4]);
    u32::from_be_bytes(a)
}

fn need(b: &[u8], len: usize) -> Result<()> {
    if b.len() < len {
        Err(Error::Protocol("truncated information unit"))
    } else {
        Ok(())
    }
}

fn header(op: u8, tag: u64, len: usize) -> Vec<u8> {
    let mut b = vec![0u8; len];
    b[0] = op;
    b[8..16].copy_from_slice(&tag.to_be_bytes());
    b
}

impl Iu {
    /// Opcode of this IU.
    pub fn opcode(&self) -> u8 {
        match self {
            Iu::LoginRequest(_) => opcode::LOGIN_REQ,
            Iu::LoginResponse(_) => opcode::LOGIN_RSP,
            Iu::LoginReject(_) => opcode::LOGIN_REJ,
            Iu::Command(_) => opcode::CMD,
            Iu::TaskManagement(_) => opcode::TSK_MGMT,
            Iu::Response(_) => opcode::RSP,
            Iu::InitiatorLogout { .. } => opcode::I_LOGOUT,
            Iu::TargetLogout { .. } => opcode::T_LOGOUT,
            Iu::CreditRequest { .. } => opcode::CRED_REQ,
            Iu::CreditResponse { .. } => opcode::CRED_RSP,
            Iu::AerRequest { .. } => opcode::AER_REQ,
            Iu::AerResponse { .. } => opcode::AER_RSP,
        }
    }

    /// Tag carried by this IU.
    pub fn tag(&self) -> u64 {
        match self {
            Iu::LoginRequest(r) => r.tag,
            Iu::LoginResponse(r) => r.tag,
            Iu::LoginReject(r) => r.tag,
            Iu::Command(c) => c.tag,
            Iu::TaskManagement(t) => t.tag,
            Iu::Response(r) => r.tag,
            Iu::InitiatorLogout { tag }
            | Iu::TargetLogout { tag, .. }
            | Iu::CreditRequest { tag, .. }
            | Iu::CreditResponse { tag }
            | Iu::AerRequest { tag, .. }
            | Iu::AerResponse { tag } => *tag,
        }
    }

    /// Encode into a freshly allocated buffer.
    ///
    /// # Errors
    ///
    ///  - `InvalidParameter`: a CDB longer than 16 bytes, too many descriptors, or an IU that
    ///    would exceed [`IU_MAX`].
    pub fn encode(&self) -> Result<Vec<u8>> {
        let b = match self {
            Iu::LoginRequest(r) => {
                let mut b = header(opcode::LOGIN_REQ, r.tag, 64);
                b[16..20].copy_from_slice(&r.max_it_iu_len.to_be_bytes());
                b[24..26].copy_from_slice(&r.buf_formats.to_be_bytes());
                b[26] = r.flags;
                b[32..48].copy_from_slice(&r.initiator_port_id);
                b[48..64].copy_from_slice(&r.target_port_id);
                b
            }
            Iu::LoginResponse(r) => {
                let mut b = header(opcode::LOGIN_RSP, r.tag, 52);
                b[4..8].copy_from_slice(&r.req_lim_delta.to_be_bytes());
                b[16..20].copy_from_slice(&r.max_it_iu_len.to_be_bytes());
                b[20..24].copy_from_slice(&r.max_ti_iu_len.to_be_bytes());
                b[24..26].copy_from_slice(&r.buf_formats.to_be_bytes());
                b[26] = r.flags;
                b
            }
            Iu::LoginReject(r) => {
                let mut b = header(opcode::LOGIN_REJ, r.tag, 32);
                b[4..8].copy_from_slice(&r.reason.to_be_bytes());
                b[24..26].copy_from_slice(&r.buf_formats.to_be_bytes());
                b
            }
            Iu::Command(c) => {
                if c.cdb.len() > 16 {
                    return Err(Error::InvalidParameter("CDB longer than 16 bytes"));
                }
                for d in [&c.data_out, &c.data_in] {
                    if let DataBuffer::Indirect(v) = d {
                        if v.len() > usize::from(u8::MAX) {
                            return Err(Error::InvalidParameter("too many data descriptors"));
                        }
                    }
                }
                let mut b = header(opcode::CMD, c.tag, CMD_HEADER_SIZE);
                b[5] = (c.data_out.format() << 4) | c.data_in.format();
                b[6] = c.data_out.count();
                b[7] = c.data_in.count();
                b[20..28].copy_from_slice(&c.lun.to_be_bytes());
                b[29] = c.task_attr;
                b[32..32 + c.cdb.len()].copy_from_slice(&c.cdb);
                c.data_out.encode(&mut b);
                c.data_in.encode(&mut b);
                b
            }
            Iu::TaskManagement(t) => {
                let mut b = header(opcode::TSK_MGMT, t.tag, 48);
                b[20..28].copy_from_slice(&t.lun.to_be_bytes());
                b[30] = t.function.code();
                b[32..40].copy_from_slice(&t.task_tag.to_be_bytes());
                b
            }
            Iu::Response(r) => {
                let mut b = header(opcode::RSP, r.tag, 36);
                b[4..8].copy_from_slice(&r.req_lim_delta.to_be_bytes());
                b[18] = r.flags;
                b[19] = r.status;
                b[20..24].copy_from_slice(&r.data_out_residual.to_be_bytes());
                b[24..28].copy_from_slice(&r.data_in_residual.to_be_bytes());
                b[28..32].copy_from_slice(&(r.sense.len() as u32).to_be_bytes());
                b[32..36].copy_from_slice(&(r.response_data.len() as u32).to_be_bytes());
                b.extend_from_slice(&r.response_data);
                b.extend_from_slice(&r.sense);
                b
            }
            Iu::InitiatorLogout { tag } => header(opcode::I_LOGOUT, *tag, 16),
            Iu::TargetLogout { tag, reason } => {
                let mut b = header(opcode::T_LOGOUT, *tag, 16);
                b[4..8].copy_from_slice(&reason.to_be_bytes());
                b
            }
            Iu::CreditRequest { tag, req_lim_delta } => {
                let mut b = header(opcode::CRED_REQ, *tag, 16);
                b[4..8].copy_from_slice(&req_lim_delta.to_be_bytes());
                b
            }
            Iu::CreditResponse { tag } => header(opcode::CRED_RSP, *tag, 16),
            Iu::AerRequest {
                tag,
                req_lim_delta,
                lun,
                sense,
            } => {
                let mut b = header(opcode::AER_REQ, *tag, 36);
                b[4..8].copy_from_slice(&req_lim_delta.to_be_bytes());
                b[20..28].copy_from_slice(&lun.to_be_bytes());
                b[28..32].copy_from_slice(&(sense.len() as u32).to_be_bytes());
                b.extend_from_slice(sense);
                b
            }
            Iu::AerResponse { tag } => header(opcode::AER_RSP, *tag, 16),
        };
        if b.len() > IU_MAX {
            return Err(Error::InvalidParameter("information unit larger than IU_MAX"));
        }
        Ok(b)
    }

    /// Decode an IU.
    ///
    /// # Errors
    ///
    ///  - `Protocol`: unknown opcode, truncated IU, or inconsistent lengths.
    pub fn decode(b: &[u8]) -> Result<Iu> {
        need(b, 16)?;
        let tag = be64(&b[8..16]);
        let delta = || be32(&b[4..8]) as i32;
        Ok(match b[0] {
            opcode::LOGIN_REQ => {
                need(b, 64)?;
                let mut initiator_port_id = [0u8; 16];
                let mut target_port_id = [0u8; 16];
                initiator_port_id.copy_from_slice(&b[32..48]);
                target_port_id.copy_from_slice(&b[48..64]);
                Iu::LoginRequest(LoginRequest {
                    tag,
                    max_it_iu_len: be32(&b[16..20]),
                    buf_formats: u16::from_be_bytes([b[24], b[25]]),
                    flags: b[26],
                    initiator_port_id,
                    target_port_id,
                })
            }
            opcode::LOGIN_RSP => {
                need(b, 52)?;
                Iu::LoginResponse(LoginResponse {
                    tag,
                    req_lim_delta: be32(&b[4..8]),
                    max_it_iu_len: be32(&b[16..20]),
                    max_ti_iu_len: be32(&b[20..24]),
                    buf_formats: u16::from_be_bytes([b[24], b[25]]),
                    flags: b[26],
                })
            }
            opcode::LOGIN_REJ => {
                need(b, 32)?;
                Iu::LoginReject(LoginReject {
                    tag,
                    reason: be32(&b[4..8]),
                    buf_formats: u16::from_be_bytes([b[24], b[25]]),
                })
            }
            opcode::CMD => {
                need(b, CMD_HEADER_SIZE)?;
                let (data_out, used) = DataBuffer::decode(b[5] >> 4, b[6], &b[CMD_HEADER_SIZE..])?;
                let (data_in, _) =
                    DataBuffer::decode(b[5] & 0x0f, b[7], &b[CMD_HEADER_SIZE + used..])?;
                let cdb = b[32..48].to_vec();
                Iu::Command(Command {
                    tag,
                    lun: be64(&b[20..28]),
                    task_attr: b[29],
                    cdb,
                    data_out,
                    data_in,
                })
            }
            opcode::TSK_MGMT => {
                need(b, 48)?;
                Iu::TaskManagement(TaskManagement {
                    tag,
                    lun: be64(&b[20..28]),
                    function: TaskFunction::from_code(b[30])?,
                    task_tag: be64(&b[32..40]),
                })
            }
            opcode::RSP => {
                need(b, 36)?;
                let sense_len = be32(&b[28..32]) as usize;
                let resp_len = be32(&b[32..36]) as usize;
                let end = 36usize
                    .checked_add(resp_len)
                    .and_then(|v| v.checked_add(sense_len))
                    .ok_or(Error::Protocol("response lengths overflow"))?;
                need(b, end)?;
                Iu::Response(Response {
                    tag,
                    req_lim_delta: delta(),
                    flags: b[18],
                    status: b[19],
                    data_out_residual: be32(&b[20..24]),
                    data_in_residual: be32(&b[24..28]),
                    response_data: b[36..36 + resp_len].to_vec(),
                    sense: b[36 + resp_len..end].to_vec(),
                })
            }
            opcode::I_LOGOUT => Iu::InitiatorLogout { tag },
            opcode::T_LOGOUT => Iu::TargetLogout {
                tag,
                reason: be32(&b[4..8]),
            },
            opcode::CRED_REQ => Iu::CreditRequest {
                tag,
                req_lim_delta: delta(),
            },
            opcode::CRED_RSP => Iu::CreditResponse { tag },
            opcode::AER_REQ => {
                need(b, 36)?;
                let sense_len = be32(&b[28..32]) as usize;
                need(b, 36 + sense_len)?;
                Iu::AerRequest {
                    tag,
                    req_lim_delta: delta(),
                    lun: be64(&b[20..28]),
                    sense: b[36..36 + sense_len].to_vec(),
                }
            }
            opcode::AER_RSP => Iu::AerResponse { tag },
            _ => return Err(Error::Protocol("unknown opcode")),
        })
    }
}

/// Maximum scatter/gather entries a command can carry.
///
/// With indirect descriptors this is limited by the negotiated initiator-to-target IU size; with
/// direct descriptors it is one if a single descriptor fits and zero otherwise.
pub fn max_sg_entries(indirect: bool, max_it_iu_len: u32) -> usize {
    let size = (max_it_iu_len as usize).min(IU_MAX);
    if indirect {
        size.saturating_sub(CMD_HEADER_SIZE + TABLE_HEADER_SIZE) / DESCRIPTOR_SIZE
    } else if size >= CMD_HEADER_SIZE + DESCRIPTOR_SIZE {
        1
    } else {
        0
    }
}
