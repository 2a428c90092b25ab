//! ctnetlink message construction and parsing
//!
//! Only the pieces needed to dump the conntrack table are covered: the dump
//! request, and the original/reply tuples of each returned entry.
//!
//! ```text
//! nlmsghdr (16) | nfgenmsg (4) | nlattr...
//! nlattr = len u16 | type u16 | payload, padded to 4 bytes
//! ```
//!
//! Header fields are host byte order; addresses and ports inside the tuple
//! attributes are network byte order.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;

pub const NLMSG_HDR_LEN: usize = 16;
pub const NFGENMSG_LEN: usize = 4;
const NLA_HDR_LEN: usize = 4;

pub const NLMSG_ERROR: u16 = 2;
pub const NLMSG_DONE: u16 = 3;

pub const NLM_F_REQUEST: u16 = 0x001;
pub const NLM_F_DUMP: u16 = 0x300;

const NFNL_SUBSYS_CTNETLINK: u16 = 1;
const IPCTNL_MSG_CT_NEW: u16 = 0;
const IPCTNL_MSG_CT_GET: u16 = 1;
const NFNETLINK_V0: u8 = 0;

const NLA_F_NESTED: u16 = 1 << 15;
const NLA_F_NET_BYTEORDER: u16 = 1 << 14;
const NLA_TYPE_MASK: u16 = !(NLA_F_NESTED | NLA_F_NET_BYTEORDER);

pub const CTA_TUPLE_ORIG: u16 = 1;
pub const CTA_TUPLE_REPLY: u16 = 2;
pub const CTA_TUPLE_IP: u16 = 1;
pub const CTA_TUPLE_PROTO: u16 = 2;
pub const CTA_IP_V4_SRC: u16 = 1;
pub const CTA_IP_V4_DST: u16 = 2;
pub const CTA_IP_V6_SRC: u16 = 3;
pub const CTA_IP_V6_DST: u16 = 4;
pub const CTA_PROTO_NUM: u16 = 1;
pub const CTA_PROTO_SRC_PORT: u16 = 2;
pub const CTA_PROTO_DST_PORT: u16 = 3;

pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

/// Conntrack errors
#[derive(Error, Debug)]
pub enum ConntrackError {
    #[error("Netlink socket error: {0}")]
    Socket(#[from] std::io::Error),

    #[error("Malformed netlink message: {0}")]
    Malformed(String),

    #[error("Kernel returned error {0}")]
    Kernel(i32),

    #[error("Conntrack is not supported on this platform")]
    Unsupported,
}

pub type ConntrackResult<T> = Result<T, ConntrackError>;

/// One direction of a conntrack entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tuple {
    pub proto: u8,
    pub src: IpAddr,
    pub dst: IpAddr,
    pub sport: u16,
    pub dport: u16,
}

impl Tuple {
    /// The same flow seen from the other end
    pub fn reversed(&self) -> Self {
        Self {
            proto: self.proto,
            src: self.dst,
            dst: self.src,
            sport: self.dport,
            dport: self.sport,
        }
    }
}

/// A conntrack table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConntrackEntry {
    pub orig: Tuple,
    pub reply: Tuple,
}

impl ConntrackEntry {
    /// Address or port translation happened if the reply is not the mirror
    /// image of the original
    pub fn is_nat(&self) -> bool {
        self.reply != self.orig.reversed()
    }
}

/// A parsed netlink message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// End of a multi-part dump
    Done,
    /// `NLMSG_ERROR`; zero is an acknowledgement
    Error(i32),
    /// A TCP or UDP conntrack entry
    Conntrack(ConntrackEntry),
    /// Anything else, including entries for other protocols
    Skipped,
}

fn nlmsg_align(len: usize) -> usize {
    (len + 3) & !3
}

fn read_u16(data: &[u8], offset: usize) -> Option<u16> {
    data.get(offset..offset + 2)
        .map(|b| u16::from_ne_bytes([b[0], b[1]]))
}

fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    data.get(offset..offset + 4)
        .map(|b| u32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
}

/// Conntrack dump request for all address families
pub fn build_dump_request(seq: u32) -> Vec<u8> {
    let len = NLMSG_HDR_LEN + NFGENMSG_LEN;
    let mut buf = Vec::with_capacity(len);

    buf.extend_from_slice(&(len as u32).to_ne_bytes());
    buf.extend_from_slice(&((NFNL_SUBSYS_CTNETLINK << 8) | IPCTNL_MSG_CT_GET).to_ne_bytes());
    buf.extend_from_slice(&(NLM_F_REQUEST | NLM_F_DUMP).to_ne_bytes());
    buf.extend_from_slice(&seq.to_ne_bytes());
    buf.extend_from_slice(&0u32.to_ne_bytes());

    // nfgenmsg: AF_UNSPEC, version, res_id
    buf.push(0);
    buf.push(NFNETLINK_V0);
    buf.extend_from_slice(&0u16.to_be_bytes());

    buf
}

/// Split a buffer into its netlink messages
pub fn parse_messages(data: &[u8]) -> ConntrackResult<Vec<Message>> {
    let mut messages = Vec::new();
    let mut offset = 0;

    while offset + NLMSG_HDR_LEN <= data.len() {
        let msg_len = read_u32(data, offset).unwrap_or(0) as usize;
        let msg_type = read_u16(data, offset + 4).unwrap_or(0);

        if msg_len < NLMSG_HDR_LEN {
            return Err(ConntrackError::Malformed(format!(
                "message length {} below header size",
                msg_len
            )));
        }
        if offset + msg_len > data.len() {
            return Err(ConntrackError::Malformed(format!(
                "message length {} exceeds buffer (offset={}, buffer={})",
                msg_len,
                offset,
                data.len()
            )));
        }

        let body = &data[offset + NLMSG_HDR_LEN..offset + msg_len];

        match msg_type {
            NLMSG_DONE => {
                messages.push(Message::Done);
                break;
            }
            NLMSG_ERROR => {
                let errno = read_u32(body, 0)
                    .map(|v| v as i32)
                    .ok_or_else(|| ConntrackError::Malformed("short error message".into()))?;
                messages.push(Message::Error(errno));
                if errno != 0 {
                    break;
                }
            }
            t if t == (NFNL_SUBSYS_CTNETLINK << 8) | IPCTNL_MSG_CT_NEW => {
                messages.push(parse_conntrack(body)?);
            }
            _ => messages.push(Message::Skipped),
        }

        offset += nlmsg_align(msg_len);
    }

    Ok(messages)
}

/// Attributes at one nesting level, with the flag bits masked off the type
pub fn parse_attributes(data: &[u8]) -> ConntrackResult<Vec<(u16, &[u8])>> {
    let mut attrs = Vec::new();
    let mut offset = 0;

    while offset + NLA_HDR_LEN <= data.len() {
        let attr_len = read_u16(data, offset).unwrap_or(0) as usize;
        let attr_type = read_u16(data, offset + 2).unwrap_or(0) & NLA_TYPE_MASK;

        if attr_len < NLA_HDR_LEN {
            break;
        }
        if offset + attr_len > data.len() {
            return Err(ConntrackError::Malformed(format!(
                "attribute length {} exceeds buffer (offset={}, buffer={})",
                attr_len,
                offset,
                data.len()
            )));
        }

        attrs.push((attr_type, &data[offset + NLA_HDR_LEN..offset + attr_len]));
        offset += nlmsg_align(attr_len);
    }

    Ok(attrs)
}

fn find<'a>(attrs: &[(u16, &'a [u8])], wanted: u16) -> Option<&'a [u8]> {
    attrs.iter().find(|(t, _)| *t == wanted).map(|(_, p)| *p)
}

fn parse_conntrack(body: &[u8]) -> ConntrackResult<Message> {
    if body.len() < NFGENMSG_LEN {
        return Err(ConntrackError::Malformed("short nfgenmsg".into()));
    }
    let attrs = parse_attributes(&body[NFGENMSG_LEN..])?;

    let (Some(orig), Some(reply)) = (
        find(&attrs, CTA_TUPLE_ORIG),
        find(&attrs, CTA_TUPLE_REPLY),
    ) else {
        return Ok(Message::Skipped);
    };

    match (parse_tuple(orig)?, parse_tuple(reply)?) {
        (Some(orig), Some(reply)) => Ok(Message::Conntrack(ConntrackEntry { orig, reply })),
        _ => Ok(Message::Skipped),
    }
}

/// `None` for tuples that are not TCP or UDP over IPv4/IPv6
fn parse_tuple(data: &[u8]) -> ConntrackResult<Option<Tuple>> {
    let attrs = parse_attributes(data)?;
    let (Some(ip), Some(proto)) = (find(&attrs, CTA_TUPLE_IP), find(&attrs, CTA_TUPLE_PROTO))
    else {
        return Ok(None);
    };

    let ip_attrs = parse_attributes(ip)?;
    let addrs = match (
        find(&ip_attrs, CTA_IP_V4_SRC),
        find(&ip_attrs, CTA_IP_V4_DST),
        find(&ip_attrs, CTA_IP_V6_SRC),
        find(&ip_attrs, CTA_IP_V6_DST),
    ) {
        (Some(src), Some(dst), _, _) => v4(src).zip(v4(dst)),
        (_, _, Some(src), Some(dst)) => v6(src).zip(v6(dst)),
        _ => None,
    };
    let Some((src, dst)) = addrs else {
        return Ok(None);
    };

    let proto_attrs = parse_attributes(proto)?;
    let Some(&num) = find(&proto_attrs, CTA_PROTO_NUM).and_then(|p| p.first()) else {
        return Ok(None);
    };
    if num != IPPROTO_TCP && num != IPPROTO_UDP {
        return Ok(None);
    }
    let (Some(sport), Some(dport)) = (
        find(&proto_attrs, CTA_PROTO_SRC_PORT).and_then(port),
        find(&proto_attrs, CTA_PROTO_DST_PORT).and_then(port),
    ) else {
        return Ok(None);
    };

    Ok(Some(Tuple {
        proto: num,
        src,
        dst,
        sport,
        dport,
    }))
}

fn v4(payload: &[u8]) -> Option<IpAddr> {
    let octets: [u8; 4] = payload.get(..4)?.try_into().ok()?;
    Some(IpAddr::V4(Ipv4Addr::from(octets)))
}

fn v6(payload: &[u8]) -> Option<IpAddr> {
    let octets: [u8; 16] = payload.get(..16)?.try_into().ok()?;
    Some(IpAddr::V6(Ipv6Addr::from(octets)))
}

fn port(payload: &[u8]) -> Option<u16> {
    let bytes: [u8; 2] = payload.get(..2)?.try_into().ok()?;
    Some(u16::from_be_bytes(bytes))
}
