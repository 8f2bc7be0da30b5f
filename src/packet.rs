// src/packet.rs
// RPL control messages (RFC 6550 §6): base objects, packet framing and
// protocol constants.

use std::fmt;
use std::io::Cursor;
use std::net::Ipv6Addr;

use byteorder::{BigEndian, ReadBytesExt};

use crate::error::{Result, RplError};
use crate::option::{DodagConfiguration, RplOption, read_addr};

/// UDP port and multicast group every RPL node listens on.
pub const RPL_PORT: u16 = 521;
pub const ALL_RPL_NODES: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0x001a);

pub const ICMPV6_RPL_TYPE: u8 = 155;
pub const CODE_DIS: u8 = 0x00;
pub const CODE_DIO: u8 = 0x01;
pub const CODE_DAO: u8 = 0x02;
pub const CODE_DAO_ACK: u8 = 0x03;

pub const INFINITE_RANK: u16 = 0xffff;
pub const DEFAULT_RPL_INSTANCE: u8 = 0;

pub const DEFAULT_DIO_INTERVAL_MIN: u8 = 3;
pub const DEFAULT_DIO_INTERVAL_DOUBLINGS: u8 = 16;
pub const DEFAULT_DIO_REDUNDANCY_CONSTANT: u8 = 10;
pub const DEFAULT_PATH_CONTROL_SIZE: u8 = 0;
pub const DEFAULT_MIN_HOP_RANK_INCREASE: u16 = 256;
pub const DEFAULT_DEFAULT_LIFETIME: u8 = 30;
pub const DEFAULT_LIFETIME_UNIT: u16 = 60;

const HEADER_LEN: usize = 4;
const DIS_LEN: usize = 6;
const DIO_LEN: usize = 28;
const DAO_LEN: usize = 24;
const DAO_ACK_LEN: usize = 24;

/// Mode of Operation carried in the DIO (3 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeOfOperation {
    NoDownwardRoutes,
    NonStoring,
    StoringWithoutMulticast,
    StoringWithMulticast,
    Unknown(u8),
}

impl ModeOfOperation {
    pub fn is_storing(self) -> bool {
        matches!(
            self,
            ModeOfOperation::StoringWithoutMulticast | ModeOfOperation::StoringWithMulticast
        )
    }
}

impl From<u8> for ModeOfOperation {
    fn from(value: u8) -> Self {
        match value {
            0 => ModeOfOperation::NoDownwardRoutes,
            1 => ModeOfOperation::NonStoring,
            2 => ModeOfOperation::StoringWithoutMulticast,
            3 => ModeOfOperation::StoringWithMulticast,
            other => ModeOfOperation::Unknown(other),
        }
    }
}

impl From<ModeOfOperation> for u8 {
    fn from(value: ModeOfOperation) -> Self {
        match value {
            ModeOfOperation::NoDownwardRoutes => 0,
            ModeOfOperation::NonStoring => 1,
            ModeOfOperation::StoringWithoutMulticast => 2,
            ModeOfOperation::StoringWithMulticast => 3,
            ModeOfOperation::Unknown(other) => other & 0b111,
        }
    }
}

/// DODAG Information Solicitation base object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Dis {
    pub flags: u8,
}

/// DODAG Information Object base object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dio {
    pub instance_id: u8,
    pub version: u8,
    pub rank: u16,
    pub grounded: bool,
    pub mode_of_operation: ModeOfOperation,
    pub preference: u8,
    pub dtsn: u8,
    pub flags: u8,
    pub dodag_id: Ipv6Addr,
}

/// Destination Advertisement Object base object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dao {
    pub ack_requested: bool,
    pub dodag_id_present: bool,
    pub sequence: u8,
    pub instance_id: u8,
    pub dodag_id: Ipv6Addr,
}

/// DAO acknowledgment base object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaoAck {
    pub dodag_id_present: bool,
    pub status: u8,
    pub sequence: u8,
    pub instance_id: u8,
    pub dodag_id: Ipv6Addr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    Dis(Dis),
    Dio(Dio),
    Dao(Dao),
    DaoAck(DaoAck),
}

impl Message {
    pub fn code(&self) -> u8 {
        match self {
            Message::Dis(_) => CODE_DIS,
            Message::Dio(_) => CODE_DIO,
            Message::Dao(_) => CODE_DAO,
            Message::DaoAck(_) => CODE_DAO_ACK,
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Dis(_) => write!(f, "DIS"),
            Message::Dio(dio) => write!(
                f,
                "DIO instance={} version={} rank={} dtsn={} dodag={}",
                dio.instance_id, dio.version, dio.rank, dio.dtsn, dio.dodag_id
            ),
            Message::Dao(dao) => write!(
                f,
                "DAO seq={} instance={} k={} dodag={}",
                dao.sequence, dao.instance_id, dao.ack_requested, dao.dodag_id
            ),
            Message::DaoAck(ack) => write!(
                f,
                "DAO-ACK seq={} status={} instance={} dodag={}",
                ack.sequence, ack.status, ack.instance_id, ack.dodag_id
            ),
        }
    }
}

/// An RPL control packet: one base object followed by options.
///
/// The checksum is owned by the transport; it is written as zero and kept
/// as-is on decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub message: Message,
    pub options: Vec<RplOption>,
    pub checksum: u16,
}

fn truncated(what: &'static str, expected: usize, got: usize) -> RplError {
    RplError::Truncated {
        what,
        expected,
        got,
    }
}

impl Packet {
    pub fn new(message: Message) -> Self {
        Packet {
            message,
            options: Vec::new(),
            checksum: 0,
        }
    }

    pub fn with_options(message: Message, options: Vec<RplOption>) -> Self {
        Packet {
            message,
            options,
            checksum: 0,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(DIO_LEN + 16);
        buf.push(ICMPV6_RPL_TYPE);
        buf.push(self.message.code());
        buf.extend_from_slice(&self.checksum.to_be_bytes());

        match &self.message {
            Message::Dis(dis) => {
                buf.push(dis.flags);
                buf.push(0);
            }
            Message::Dio(dio) => {
                buf.push(dio.instance_id);
                buf.push(dio.version);
                buf.extend_from_slice(&dio.rank.to_be_bytes());
                let mut g_mop_prf = (u8::from(dio.mode_of_operation) & 0b111) << 3;
                g_mop_prf |= dio.preference & 0b111;
                if dio.grounded {
                    g_mop_prf |= 0x80;
                }
                buf.push(g_mop_prf);
                buf.push(dio.dtsn);
                buf.push(dio.flags);
                buf.push(0);
                buf.extend_from_slice(&dio.dodag_id.octets());
            }
            Message::Dao(dao) => {
                let mut flags = 0u8;
                if dao.ack_requested {
                    flags |= 0x80;
                }
                if dao.dodag_id_present {
                    flags |= 0x40;
                }
                buf.push(flags);
                buf.push(0);
                buf.push(dao.sequence);
                buf.push(dao.instance_id);
                buf.extend_from_slice(&dao.dodag_id.octets());
            }
            Message::DaoAck(ack) => {
                buf.push(if ack.dodag_id_present { 0x80 } else { 0 });
                buf.push(ack.status);
                buf.push(ack.sequence);
                buf.push(ack.instance_id);
                buf.extend_from_slice(&ack.dodag_id.octets());
            }
        }

        for option in &self.options {
            buf.extend(option.to_bytes());
        }
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(truncated("message header", HEADER_LEN, buf.len()));
        }
        if buf[0] != ICMPV6_RPL_TYPE {
            return Err(RplError::NotRpl(buf[0]));
        }
        let code = buf[1];
        let body_len = match code {
            CODE_DIS => DIS_LEN,
            CODE_DIO => DIO_LEN,
            CODE_DAO => DAO_LEN,
            CODE_DAO_ACK => DAO_ACK_LEN,
            other => return Err(RplError::UnknownCode(other)),
        };
        let what = match code {
            CODE_DIS => "DIS",
            CODE_DIO => "DIO",
            CODE_DAO => "DAO",
            _ => "DAO-ACK",
        };
        if buf.len() < body_len {
            return Err(truncated(what, body_len, buf.len()));
        }

        let mut cur = Cursor::new(&buf[..body_len]);
        cur.set_position(2);
        let short = |_| truncated(what, body_len, buf.len());
        let checksum = cur.read_u16::<BigEndian>().map_err(short)?;

        let message = match code {
            CODE_DIS => {
                let flags = cur.read_u8().map_err(short)?;
                Message::Dis(Dis { flags })
            }
            CODE_DIO => {
                let instance_id = cur.read_u8().map_err(short)?;
                let version = cur.read_u8().map_err(short)?;
                let rank = cur.read_u16::<BigEndian>().map_err(short)?;
                let g_mop_prf = cur.read_u8().map_err(short)?;
                let dtsn = cur.read_u8().map_err(short)?;
                let flags = cur.read_u8().map_err(short)?;
                cur.read_u8().map_err(short)?; // reserved
                let dodag_id = read_addr(&mut cur).map_err(short)?;
                Message::Dio(Dio {
                    instance_id,
                    version,
                    rank,
                    grounded: g_mop_prf & 0x80 != 0,
                    mode_of_operation: ModeOfOperation::from((g_mop_prf >> 3) & 0b111),
                    preference: g_mop_prf & 0b111,
                    dtsn,
                    flags,
                    dodag_id,
                })
            }
            CODE_DAO => {
                let flags = cur.read_u8().map_err(short)?;
                cur.read_u8().map_err(short)?; // reserved
                let sequence = cur.read_u8().map_err(short)?;
                let instance_id = cur.read_u8().map_err(short)?;
                let dodag_id = read_addr(&mut cur).map_err(short)?;
                Message::Dao(Dao {
                    ack_requested: flags & 0x80 != 0,
                    dodag_id_present: flags & 0x40 != 0,
                    sequence,
                    instance_id,
                    dodag_id,
                })
            }
            _ => {
                let flags = cur.read_u8().map_err(short)?;
                let status = cur.read_u8().map_err(short)?;
                let sequence = cur.read_u8().map_err(short)?;
                let instance_id = cur.read_u8().map_err(short)?;
                let dodag_id = read_addr(&mut cur).map_err(short)?;
                Message::DaoAck(DaoAck {
                    dodag_id_present: flags & 0x80 != 0,
                    status,
                    sequence,
                    instance_id,
                    dodag_id,
                })
            }
        };

        let options = RplOption::parse_all(&buf[body_len..])?;
        Ok(Packet {
            message,
            options,
            checksum,
        })
    }

    /// The DODAG Configuration option, if present.
    pub fn dodag_configuration(&self) -> Option<&DodagConfiguration> {
        self.options.iter().find_map(|o| match o {
            RplOption::DodagConfiguration(conf) => Some(conf),
            _ => None,
        })
    }

    /// Sender rank advertised in the RPL hop-by-hop option, if present.
    pub fn sender_rank(&self) -> Option<u16> {
        self.options.iter().find_map(|o| match o {
            RplOption::HopByHop { sender_rank, .. } => Some(*sender_rank),
            _ => None,
        })
    }

    /// Replace (or append) the hop-by-hop option.
    pub fn set_sender_rank(&mut self, instance_id: u8, sender_rank: u16, down: bool) {
        self.options
            .retain(|o| !matches!(o, RplOption::HopByHop { .. }));
        self.options.push(RplOption::HopByHop {
            down,
            rank_error: false,
            forwarding_error: false,
            instance_id,
            sender_rank,
        });
    }

    //=== Convenience builders ===

    /// DIS carrying a Solicited Information option with no predicates set.
    pub fn build_dis() -> Self {
        Packet::with_options(
            Message::Dis(Dis::default()),
            vec![RplOption::SolicitedInformation {
                instance_id: 0,
                version_predicate: false,
                instance_predicate: false,
                dodag_id_predicate: false,
                dodag_id: Ipv6Addr::UNSPECIFIED,
                version: 0,
            }],
        )
    }

    pub fn build_dio(dio: Dio, conf: DodagConfiguration) -> Self {
        Packet::with_options(Message::Dio(dio), vec![RplOption::DodagConfiguration(conf)])
    }

    pub fn build_dao_ack(ack: DaoAck, sender_rank: u16) -> Self {
        let mut pkt = Packet::new(Message::DaoAck(ack));
        pkt.set_sender_rank(ack.instance_id, sender_rank, true);
        pkt
    }
}
