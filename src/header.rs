//! VLESS request header codec
//!
//! The first chunk a client sends carries the request header followed directly
//! by the first slice of application payload:
//!
//! ```text
//! +-----+------+------+---------+-----+------+------+----------+---------+
//! | VER | UUID | OLEN | OPTIONS | CMD | PORT | ATYP | ADDRESS  | PAYLOAD |
//! +-----+------+------+---------+-----+------+------+----------+---------+
//! |  1  |  16  |  1   |  OLEN   |  1  |  2   |  1   | Variable |  rest   |
//! +-----+------+------+---------+-----+------+------+----------+---------+
//! ```
//!
//! The server answers with a two byte prefix `[VER, 0x00]` in front of the first
//! payload it sends back.

use crate::identity::{UserId, IDENTITY_LEN};
use bytes::{BufMut, BytesMut};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Shortest chunk that can hold a request header
pub const MIN_HEADER_LEN: usize = 24;

/// The only port UDP requests may target
pub const DNS_PORT: u16 = 53;

const CMD_TCP: u8 = 0x01;
const CMD_UDP: u8 = 0x02;
const CMD_MUX: u8 = 0x03;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x02;
const ATYP_IPV6: u8 = 0x03;

/// Offset of the options length byte
const OPT_LEN_INDEX: usize = 1 + IDENTITY_LEN;

/// Request commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Tcp = 0x01,
    Udp = 0x02,
}

/// Destination address types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressType {
    Ipv4 = 0x01,
    Domain = 0x02,
    Ipv6 = 0x03,
}

/// Header validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeaderError {
    #[error("invalid data: header is {0} bytes, need at least 24")]
    TooShort(usize),

    #[error("invalid user")]
    InvalidUser,

    #[error("header truncated while reading {0}")]
    Truncated(&'static str),

    #[error("command {0} is not support, command 01-tcp,02-udp,03-mux")]
    UnsupportedCommand(u8),

    #[error("invalid addressType is {0}")]
    UnsupportedAddressType(u8),

    #[error("addressValue is empty, addressType is {0}")]
    EmptyAddress(u8),

    #[error("UDP proxy only enable for DNS which is port 53, got port {0}")]
    UdpPortNotAllowed(u16),

    #[error("domain address is {0} bytes, at most 255 can be encoded")]
    AddressTooLong(usize),
}

impl HeaderError {
    /// Deliberate capability restrictions, as opposed to malformed input
    pub fn is_policy_rejection(&self) -> bool {
        matches!(
            self,
            HeaderError::UdpPortNotAllowed(_) | HeaderError::UnsupportedCommand(CMD_MUX)
        )
    }
}

/// Where a session's traffic goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub host: String,
    pub port: u16,
    pub is_udp: bool,
}

impl Destination {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: canonical_host(host.into()),
            port,
            is_udp: false,
        }
    }

    pub fn udp(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: canonical_host(host.into()),
            port,
            is_udp: true,
        }
    }

    /// UDP to port 53, relayed through DNS-over-HTTPS
    pub fn is_dns(&self) -> bool {
        self.is_udp && self.port == DNS_PORT
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A decoded request header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    pub version: u8,
    pub command: Command,
    pub address_type: AddressType,
    pub destination: Destination,
    /// First byte after the address field; everything from here on is payload
    pub payload_offset: usize,
}

impl RequestHeader {
    /// The two byte prefix sent in front of the first response payload
    pub fn response_prefix(&self) -> [u8; 2] {
        [self.version, 0]
    }
}

/// Decode the wire structure without applying any capability policy
pub fn decode(chunk: &[u8], user: &UserId) -> Result<RequestHeader, HeaderError> {
    if chunk.len() < MIN_HEADER_LEN {
        return Err(HeaderError::TooShort(chunk.len()));
    }

    let version = chunk[0];
    if !user.matches(&chunk[1..OPT_LEN_INDEX]) {
        return Err(HeaderError::InvalidUser);
    }

    let opt_len = chunk[OPT_LEN_INDEX] as usize;
    let cmd_index = OPT_LEN_INDEX + 1 + opt_len;
    let command = match byte_at(chunk, cmd_index, "command")? {
        CMD_TCP => Command::Tcp,
        CMD_UDP => Command::Udp,
        other => return Err(HeaderError::UnsupportedCommand(other)),
    };

    let port_index = cmd_index + 1;
    let port_bytes = take(chunk, port_index, 2, "port")?;
    let port = u16::from_be_bytes([port_bytes[0], port_bytes[1]]);

    let atyp_index = port_index + 2;
    let atyp = byte_at(chunk, atyp_index, "address type")?;
    let mut value_index = atyp_index + 1;

    let (address_type, host, value_len) = match atyp {
        ATYP_IPV4 => {
            let raw = take(chunk, value_index, 4, "IPv4 address")?;
            let ip = Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]);
            (AddressType::Ipv4, ip.to_string(), 4)
        }
        ATYP_DOMAIN => {
            let len = byte_at(chunk, value_index, "domain length")? as usize;
            value_index += 1;
            let raw = take(chunk, value_index, len, "domain")?;
            (
                AddressType::Domain,
                String::from_utf8_lossy(raw).into_owned(),
                len,
            )
        }
        ATYP_IPV6 => {
            let raw = take(chunk, value_index, 16, "IPv6 address")?;
            (AddressType::Ipv6, format_ipv6_groups(raw), 16)
        }
        other => return Err(HeaderError::UnsupportedAddressType(other)),
    };

    if host.is_empty() {
        return Err(HeaderError::EmptyAddress(atyp));
    }

    Ok(RequestHeader {
        version,
        command,
        address_type,
        destination: Destination {
            host,
            port,
            is_udp: command == Command::Udp,
        },
        payload_offset: value_index + value_len,
    })
}

/// Decode and apply the UDP-is-DNS-only policy
pub fn parse(chunk: &[u8], user: &UserId) -> Result<RequestHeader, HeaderError> {
    let header = decode(chunk, user)?;
    if header.destination.is_udp && header.destination.port != DNS_PORT {
        return Err(HeaderError::UdpPortNotAllowed(header.destination.port));
    }
    Ok(header)
}

/// Encode a request header (client side) followed by `payload`
pub fn encode(
    version: u8,
    user: &UserId,
    destination: &Destination,
    payload: &[u8],
) -> Result<BytesMut, HeaderError> {
    let mut buf = BytesMut::with_capacity(MIN_HEADER_LEN + destination.host.len() + payload.len());
    buf.put_u8(version);
    buf.put_slice(user.as_bytes());
    buf.put_u8(0); // no options
    buf.put_u8(if destination.is_udp { CMD_UDP } else { CMD_TCP });
    buf.put_u16(destination.port);

    if let Ok(ip) = destination.host.parse::<Ipv4Addr>() {
        buf.put_u8(ATYP_IPV4);
        buf.put_slice(&ip.octets());
    } else if let Ok(ip) = destination.host.parse::<Ipv6Addr>() {
        buf.put_u8(ATYP_IPV6);
        buf.put_slice(&ip.octets());
    } else {
        let len = destination.host.len();
        if len > u8::MAX as usize {
            return Err(HeaderError::AddressTooLong(len));
        }
        buf.put_u8(ATYP_DOMAIN);
        buf.put_u8(len as u8);
        buf.put_slice(destination.host.as_bytes());
    }

    buf.put_slice(payload);
    Ok(buf)
}

/// IPv6 text in any form becomes the eight-group form the decoder renders
fn canonical_host(host: String) -> String {
    match host.parse::<Ipv6Addr>() {
        Ok(ip) => format_ipv6_groups(&ip.octets()),
        Err(_) => host,
    }
}

/// Eight colon-separated lower-case hex groups, no zero compression
fn format_ipv6_groups(raw: &[u8]) -> String {
    raw.chunks_exact(2)
        .map(|g| format!("{:x}", u16::from_be_bytes([g[0], g[1]])))
        .collect::<Vec<_>>()
        .join(":")
}

fn byte_at(chunk: &[u8], index: usize, field: &'static str) -> Result<u8, HeaderError> {
    chunk.get(index).copied().ok_or(HeaderError::Truncated(field))
}

fn take<'a>(
    chunk: &'a [u8],
    start: usize,
    len: usize,
    field: &'static str,
) -> Result<&'a [u8], HeaderError> {
    chunk
        .get(start..start + len)
        .ok_or(HeaderError::Truncated(field))
}
