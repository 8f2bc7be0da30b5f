// src/option.rs
//! RPL control message options (RFC 6550 §6.7, RFC 6553).
//!
//! Options follow the base object of a DIS/DIO/DAO/DAO-ACK as a flat TLV
//! sequence: `type(1) | length(1) | body(length)`. Pad1 is the only option
//! without a length byte.
//!
//! Every known option has a fixed body length; a mismatch is reported as
//! [`RplError::MalformedOption`]. Unknown types are kept verbatim so that
//! forwarded messages are not silently altered.

use std::io::{self, Cursor, Read};
use std::net::Ipv6Addr;

use byteorder::{BigEndian, ReadBytesExt};

use crate::error::{Result, RplError};
use crate::packet::{
    DEFAULT_DEFAULT_LIFETIME, DEFAULT_DIO_INTERVAL_DOUBLINGS, DEFAULT_DIO_INTERVAL_MIN,
    DEFAULT_DIO_REDUNDANCY_CONSTANT, DEFAULT_LIFETIME_UNIT, DEFAULT_MIN_HOP_RANK_INCREASE,
    DEFAULT_PATH_CONTROL_SIZE,
};

pub const OPT_PAD1: u8 = 0x00;
pub const OPT_PADN: u8 = 0x01;
pub const OPT_ROUTE_INFORMATION: u8 = 0x03;
pub const OPT_DODAG_CONFIGURATION: u8 = 0x04;
pub const OPT_TARGET: u8 = 0x05;
pub const OPT_TRANSIT_INFORMATION: u8 = 0x06;
pub const OPT_SOLICITED_INFORMATION: u8 = 0x07;
pub const OPT_HOP_BY_HOP: u8 = 0x63;

const ROUTE_INFORMATION_LEN: usize = 24;
const DODAG_CONFIGURATION_LEN: usize = 14;
const TARGET_LEN: usize = 18;
const TRANSIT_INFORMATION_LEN: usize = 20;
const SOLICITED_INFORMATION_LEN: usize = 19;
const HOP_BY_HOP_LEN: usize = 4;

/// Contents of the DODAG Configuration option (type 4).
///
/// The DIO interval fields are exponents: the minimum interval is
/// `2^dio_interval_min` ms and the maximum is that value doubled
/// `dio_interval_doublings` times.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct DodagConfiguration {
    pub authentication: bool,
    pub path_control_size: u8,
    pub dio_interval_doublings: u8,
    pub dio_interval_min: u8,
    pub dio_redundancy_constant: u8,
    pub max_rank_increase: u16,
    pub min_hop_rank_increase: u16,
    pub objective_code_point: u16,
    pub default_lifetime: u8,
    pub lifetime_unit: u16,
}

impl Default for DodagConfiguration {
    fn default() -> Self {
        DodagConfiguration {
            authentication: false,
            path_control_size: DEFAULT_PATH_CONTROL_SIZE,
            dio_interval_doublings: DEFAULT_DIO_INTERVAL_DOUBLINGS,
            dio_interval_min: DEFAULT_DIO_INTERVAL_MIN,
            dio_redundancy_constant: DEFAULT_DIO_REDUNDANCY_CONSTANT,
            max_rank_increase: 0,
            min_hop_rank_increase: DEFAULT_MIN_HOP_RANK_INCREASE,
            objective_code_point: 0,
            default_lifetime: DEFAULT_DEFAULT_LIFETIME,
            lifetime_unit: DEFAULT_LIFETIME_UNIT,
        }
    }
}

/// One option TLV.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum RplOption {
    /// Pad1 (Type = 0): single padding byte.
    Pad1,
    /// PadN (Type = 1): `n` zero bytes of padding.
    PadN { n: u8 },
    /// Route Information (Type = 3): [PrefixLen, Resvd, Prf, Resvd, Lifetime(4), Prefix(16)]
    RouteInformation {
        prefix_length: u8,
        preference: u8,
        lifetime: u32,
        prefix: Ipv6Addr,
    },
    /// DODAG Configuration (Type = 4).
    DodagConfiguration(DodagConfiguration),
    /// RPL Target (Type = 5): [PrefixLen, Flags, Prefix(16)]
    Target {
        prefix_length: u8,
        flags: u8,
        prefix: Ipv6Addr,
    },
    /// Transit Information (Type = 6): [E|Flags, PathCtl, PathSeq, PathLifetime, Parent(16)]
    TransitInformation {
        external: bool,
        path_control: u8,
        path_sequence: u8,
        path_lifetime: u8,
        parent: Ipv6Addr,
    },
    /// Solicited Information (Type = 7): [InstanceId, V|I|D, DODAGID(16), Version]
    SolicitedInformation {
        instance_id: u8,
        version_predicate: bool,
        instance_predicate: bool,
        dodag_id_predicate: bool,
        dodag_id: Ipv6Addr,
        version: u8,
    },
    /// RPL Option (Type = 0x63): [O|R|F, InstanceId, SenderRank(2)]
    ///
    /// Carries the sender's rank so the receiver can detect loops.
    HopByHop {
        down: bool,
        rank_error: bool,
        forwarding_error: bool,
        instance_id: u8,
        sender_rank: u16,
    },
    /// Any other option type: raw type byte + body.
    Unknown { option_type: u8, data: Vec<u8> },
}

fn malformed(option_type: u8) -> impl Fn(io::Error) -> RplError {
    move |e| RplError::MalformedOption {
        option_type,
        reason: e.to_string(),
    }
}

fn expect_len(option_type: u8, length: usize, expected: usize) -> Result<()> {
    if length != expected {
        return Err(RplError::MalformedOption {
            option_type,
            reason: format!("length {length}, expected {expected}"),
        });
    }
    Ok(())
}

pub(crate) fn read_addr(cur: &mut Cursor<&[u8]>) -> io::Result<Ipv6Addr> {
    let mut octets = [0u8; 16];
    cur.read_exact(&mut octets)?;
    Ok(Ipv6Addr::from(octets))
}

impl RplOption {
    /// Parse every option in `buf`. Any malformed option fails the whole list.
    pub fn parse_all(buf: &[u8]) -> Result<Vec<RplOption>> {
        let mut out = Vec::new();
        let mut cur = Cursor::new(buf);
        while (cur.position() as usize) < buf.len() {
            out.push(RplOption::parse(&mut cur)?);
        }
        Ok(out)
    }

    /// Parse a single option at the cursor position, advancing the cursor.
    pub fn parse(cur: &mut Cursor<&[u8]>) -> Result<RplOption> {
        let buf: &[u8] = *cur.get_ref();
        let start = cur.position() as usize;
        let option_type = cur.read_u8().map_err(|_| RplError::Truncated {
            what: "option header",
            expected: 1,
            got: 0,
        })?;
        if option_type == OPT_PAD1 {
            return Ok(RplOption::Pad1);
        }
        let length = cur.read_u8().map_err(|_| RplError::Truncated {
            what: "option header",
            expected: 2,
            got: buf.len() - start,
        })? as usize;

        let pos = cur.position() as usize;
        if pos + length > buf.len() {
            return Err(RplError::MalformedOption {
                option_type,
                reason: format!("length {length} exceeds remaining {} bytes", buf.len() - pos),
            });
        }
        let body = &buf[pos..pos + length];
        cur.set_position((pos + length) as u64);

        let err = malformed(option_type);
        let mut p = Cursor::new(body);
        let option = match option_type {
            OPT_PADN => RplOption::PadN { n: length as u8 },
            OPT_ROUTE_INFORMATION => {
                expect_len(option_type, length, ROUTE_INFORMATION_LEN)?;
                let prefix_length = p.read_u8().map_err(&err)?;
                p.read_u8().map_err(&err)?;
                let preference = p.read_u8().map_err(&err)?;
                p.read_u8().map_err(&err)?;
                let lifetime = p.read_u32::<BigEndian>().map_err(&err)?;
                let prefix = read_addr(&mut p).map_err(&err)?;
                RplOption::RouteInformation {
                    prefix_length,
                    preference,
                    lifetime,
                    prefix,
                }
            }
            OPT_DODAG_CONFIGURATION => {
                expect_len(option_type, length, DODAG_CONFIGURATION_LEN)?;
                let flags = p.read_u8().map_err(&err)?;
                let dio_interval_doublings = p.read_u8().map_err(&err)?;
                let dio_interval_min = p.read_u8().map_err(&err)?;
                let dio_redundancy_constant = p.read_u8().map_err(&err)?;
                let max_rank_increase = p.read_u16::<BigEndian>().map_err(&err)?;
                let min_hop_rank_increase = p.read_u16::<BigEndian>().map_err(&err)?;
                let objective_code_point = p.read_u16::<BigEndian>().map_err(&err)?;
                p.read_u8().map_err(&err)?; // reserved
                let default_lifetime = p.read_u8().map_err(&err)?;
                let lifetime_unit = p.read_u16::<BigEndian>().map_err(&err)?;
                RplOption::DodagConfiguration(DodagConfiguration {
                    authentication: flags & 0b1000 != 0,
                    path_control_size: flags & 0b111,
                    dio_interval_doublings,
                    dio_interval_min,
                    dio_redundancy_constant,
                    max_rank_increase,
                    min_hop_rank_increase,
                    objective_code_point,
                    default_lifetime,
                    lifetime_unit,
                })
            }
            OPT_TARGET => {
                expect_len(option_type, length, TARGET_LEN)?;
                let prefix_length = p.read_u8().map_err(&err)?;
                let flags = p.read_u8().map_err(&err)?;
                let prefix = read_addr(&mut p).map_err(&err)?;
                RplOption::Target {
                    prefix_length,
                    flags,
                    prefix,
                }
            }
            OPT_TRANSIT_INFORMATION => {
                expect_len(option_type, length, TRANSIT_INFORMATION_LEN)?;
                let flags = p.read_u8().map_err(&err)?;
                let path_control = p.read_u8().map_err(&err)?;
                let path_sequence = p.read_u8().map_err(&err)?;
                let path_lifetime = p.read_u8().map_err(&err)?;
                let parent = read_addr(&mut p).map_err(&err)?;
                RplOption::TransitInformation {
                    external: flags & 0x80 != 0,
                    path_control,
                    path_sequence,
                    path_lifetime,
                    parent,
                }
            }
            OPT_SOLICITED_INFORMATION => {
                expect_len(option_type, length, SOLICITED_INFORMATION_LEN)?;
                let instance_id = p.read_u8().map_err(&err)?;
                let flags = p.read_u8().map_err(&err)?;
                let dodag_id = read_addr(&mut p).map_err(&err)?;
                let version = p.read_u8().map_err(&err)?;
                RplOption::SolicitedInformation {
                    instance_id,
                    version_predicate: flags & 0x80 != 0,
                    instance_predicate: flags & 0x40 != 0,
                    dodag_id_predicate: flags & 0x20 != 0,
                    dodag_id,
                    version,
                }
            }
            OPT_HOP_BY_HOP => {
                expect_len(option_type, length, HOP_BY_HOP_LEN)?;
                let flags = p.read_u8().map_err(&err)?;
                let instance_id = p.read_u8().map_err(&err)?;
                let sender_rank = p.read_u16::<BigEndian>().map_err(&err)?;
                RplOption::HopByHop {
                    down: flags & 0x80 != 0,
                    rank_error: flags & 0x40 != 0,
                    forwarding_error: flags & 0x20 != 0,
                    instance_id,
                    sender_rank,
                }
            }
            other => RplOption::Unknown {
                option_type: other,
                data: body.to_vec(),
            },
        };
        Ok(option)
    }

    /// Wire type byte of this option.
    pub fn option_type(&self) -> u8 {
        match self {
            RplOption::Pad1 => OPT_PAD1,
            RplOption::PadN { .. } => OPT_PADN,
            RplOption::RouteInformation { .. } => OPT_ROUTE_INFORMATION,
            RplOption::DodagConfiguration(_) => OPT_DODAG_CONFIGURATION,
            RplOption::Target { .. } => OPT_TARGET,
            RplOption::TransitInformation { .. } => OPT_TRANSIT_INFORMATION,
            RplOption::SolicitedInformation { .. } => OPT_SOLICITED_INFORMATION,
            RplOption::HopByHop { .. } => OPT_HOP_BY_HOP,
            RplOption::Unknown { option_type, .. } => *option_type,
        }
    }

    /// Encode into wire format: type, length, body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.push(self.option_type());
        match self {
            RplOption::Pad1 => {}
            RplOption::PadN { n } => {
                buf.push(*n);
                buf.resize(buf.len() + usize::from(*n), 0);
            }
            RplOption::RouteInformation {
                prefix_length,
                preference,
                lifetime,
                prefix,
            } => {
                buf.push(ROUTE_INFORMATION_LEN as u8);
                buf.push(*prefix_length);
                buf.push(0);
                buf.push(*preference);
                buf.push(0);
                buf.extend_from_slice(&lifetime.to_be_bytes());
                buf.extend_from_slice(&prefix.octets());
            }
            RplOption::DodagConfiguration(conf) => {
                buf.push(DODAG_CONFIGURATION_LEN as u8);
                let mut flags = conf.path_control_size & 0b111;
                if conf.authentication {
                    flags |= 0b1000;
                }
                buf.push(flags);
                buf.push(conf.dio_interval_doublings);
                buf.push(conf.dio_interval_min);
                buf.push(conf.dio_redundancy_constant);
                buf.extend_from_slice(&conf.max_rank_increase.to_be_bytes());
                buf.extend_from_slice(&conf.min_hop_rank_increase.to_be_bytes());
                buf.extend_from_slice(&conf.objective_code_point.to_be_bytes());
                buf.push(0);
                buf.push(conf.default_lifetime);
                buf.extend_from_slice(&conf.lifetime_unit.to_be_bytes());
            }
            RplOption::Target {
                prefix_length,
                flags,
                prefix,
            } => {
                buf.push(TARGET_LEN as u8);
                buf.push(*prefix_length);
                buf.push(*flags);
                buf.extend_from_slice(&prefix.octets());
            }
            RplOption::TransitInformation {
                external,
                path_control,
                path_sequence,
                path_lifetime,
                parent,
            } => {
                buf.push(TRANSIT_INFORMATION_LEN as u8);
                buf.push(if *external { 0x80 } else { 0 });
                buf.push(*path_control);
                buf.push(*path_sequence);
                buf.push(*path_lifetime);
                buf.extend_from_slice(&parent.octets());
            }
            RplOption::SolicitedInformation {
                instance_id,
                version_predicate,
                instance_predicate,
                dodag_id_predicate,
                dodag_id,
                version,
            } => {
                buf.push(SOLICITED_INFORMATION_LEN as u8);
                buf.push(*instance_id);
                let mut flags = 0u8;
                if *version_predicate {
                    flags |= 0x80;
                }
                if *instance_predicate {
                    flags |= 0x40;
                }
                if *dodag_id_predicate {
                    flags |= 0x20;
                }
                buf.push(flags);
                buf.extend_from_slice(&dodag_id.octets());
                buf.push(*version);
            }
            RplOption::HopByHop {
                down,
                rank_error,
                forwarding_error,
                instance_id,
                sender_rank,
            } => {
                buf.push(HOP_BY_HOP_LEN as u8);
                let mut flags = 0u8;
                if *down {
                    flags |= 0x80;
                }
                if *rank_error {
                    flags |= 0x40;
                }
                if *forwarding_error {
                    flags |= 0x20;
                }
                buf.push(flags);
                buf.push(*instance_id);
                buf.extend_from_slice(&sender_rank.to_be_bytes());
            }
            RplOption::Unknown { data, .. } => {
                buf.push(data.len() as u8);
                buf.extend_from_slice(data);
            }
        }
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_one(bytes: &[u8]) -> RplOption {
        let mut cur = Cursor::new(bytes);
        RplOption::parse(&mut cur).unwrap()
    }

    #[test]
    fn padding_to_bytes() {
        assert_eq!(RplOption::Pad1.to_bytes(), vec![0]);
        assert_eq!(RplOption::PadN { n: 3 }.to_bytes(), vec![1, 3, 0, 0, 0]);
    }

    #[test]
    fn dodag_configuration_layout() {
        let conf = DodagConfiguration::default();
        let bytes = RplOption::DodagConfiguration(conf).to_bytes();

        assert_eq!(bytes.len(), 16);
        assert_eq!(bytes[0], OPT_DODAG_CONFIGURATION);
        assert_eq!(bytes[1], 14);
        assert_eq!(&bytes[3..6], &[16, 3, 10]);
        assert_eq!(&bytes[8..10], &256u16.to_be_bytes());
        assert_eq!(parse_one(&bytes), RplOption::DodagConfiguration(conf));
    }

    #[test]
    fn authentication_and_pcs_share_flags_byte() {
        let conf = DodagConfiguration {
            authentication: true,
            path_control_size: 5,
            ..Default::default()
        };
        let bytes = RplOption::DodagConfiguration(conf).to_bytes();
        assert_eq!(bytes[2], 0b1101);
        assert_eq!(parse_one(&bytes), RplOption::DodagConfiguration(conf));
    }

    #[test]
    fn solicited_information_layout() {
        let original = RplOption::SolicitedInformation {
            instance_id: 0,
            version_predicate: true,
            instance_predicate: false,
            dodag_id_predicate: true,
            dodag_id: "2002:1::".parse().unwrap(),
            version: 4,
        };
        let bytes = original.to_bytes();
        assert_eq!(bytes.len(), 21);
        assert_eq!(bytes[1], 19);
        assert_eq!(bytes[3], 0xa0);
        assert_eq!(bytes[20], 4);
        assert_eq!(parse_one(&bytes), original);
    }

    #[test]
    fn target_and_transit_roundtrip() {
        let target = RplOption::Target {
            prefix_length: 64,
            flags: 0,
            prefix: "2001:1::3".parse().unwrap(),
        };
        let transit = RplOption::TransitInformation {
            external: true,
            path_control: 0x20,
            path_sequence: 7,
            path_lifetime: 30,
            parent: "fe80::2".parse().unwrap(),
        };
        let target_bytes = target.to_bytes();
        let transit_bytes = transit.to_bytes();
        assert_eq!(target_bytes.len(), 20);
        assert_eq!(transit_bytes.len(), 22);
        assert_eq!(transit_bytes[2], 0x80);
        assert_eq!(parse_one(&target_bytes), target);
        assert_eq!(parse_one(&transit_bytes), transit);

        let no_path = RplOption::TransitInformation {
            external: false,
            path_control: 0,
            path_sequence: 255,
            path_lifetime: 0,
            parent: "fe80::9".parse().unwrap(),
        };
        assert_eq!(parse_one(&no_path.to_bytes()), no_path);
    }

    #[test]
    fn route_information_roundtrip() {
        let original = RplOption::RouteInformation {
            prefix_length: 48,
            preference: 0x08,
            lifetime: 0xffff_ffff,
            prefix: "2001:db8:1::".parse().unwrap(),
        };
        let bytes = original.to_bytes();
        assert_eq!(bytes.len(), 26);
        assert_eq!(parse_one(&bytes), original);
    }

    #[test]
    fn hop_by_hop_roundtrip() {
        let original = RplOption::HopByHop {
            down: true,
            rank_error: false,
            forwarding_error: true,
            instance_id: 30,
            sender_rank: 769,
        };
        let bytes = original.to_bytes();
        assert_eq!(bytes, vec![0x63, 4, 0xa0, 30, 0x03, 0x01]);
        assert_eq!(parse_one(&bytes), original);
    }

    #[test]
    fn parse_all_keeps_order_and_unknowns() {
        let mut buf = Vec::new();
        buf.extend(RplOption::Pad1.to_bytes());
        buf.extend([0x42, 2, 0xde, 0xad]);
        buf.extend(RplOption::PadN { n: 1 }.to_bytes());

        let parsed = RplOption::parse_all(&buf).unwrap();
        assert_eq!(
            parsed,
            vec![
                RplOption::Pad1,
                RplOption::Unknown {
                    option_type: 0x42,
                    data: vec![0xde, 0xad]
                },
                RplOption::PadN { n: 1 },
            ]
        );
    }

    #[test]
    fn wrong_length_is_malformed() {
        let bytes = [OPT_TARGET, 2, 64, 0];
        let err = RplOption::parse_all(&bytes).unwrap_err();
        assert!(matches!(
            err,
            RplError::MalformedOption {
                option_type: OPT_TARGET,
                ..
            }
        ));
    }

    #[test]
    fn length_past_end_is_malformed() {
        let bytes = [OPT_TRANSIT_INFORMATION, 20, 0, 0];
        assert!(RplOption::parse_all(&bytes).is_err());
    }
}
