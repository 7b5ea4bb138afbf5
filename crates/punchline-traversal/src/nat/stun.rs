//! STUN binding codec and client (RFC 3489 / RFC 5389 / RFC 5780).
//!
//! Only the Binding method is implemented. Requests may carry
//! CHANGE-REQUEST so servers with two addresses answer from their
//! alternate IP and/or port, which is what NAT behaviour classification
//! relies on. Responses are decoded for both the classic attributes
//! (MAPPED-ADDRESS, SOURCE-ADDRESS, CHANGED-ADDRESS) and their modern
//! equivalents (XOR-MAPPED-ADDRESS, RESPONSE-ORIGIN, OTHER-ADDRESS).
//!
//! The client runs one background receiver per socket and correlates
//! responses by transaction id, so many probes can share a socket.

use crate::error::{Result, TraversalError};
use crate::nat::types::StunProbeResult;
use crate::reliable::{PendingTable, ReliableConfig, TABLE_LIMIT, retransmit};
use crate::transport::{PipeRef, UdpPipe};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// STUN magic cookie (0x2112A442)
pub const MAGIC_COOKIE: u32 = 0x2112_A442;

/// STUN message header size (20 bytes)
pub const HEADER_SIZE: usize = 20;

/// Well-known STUN port
pub const STUN_PORT: u16 = 3478;

const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_CHANGE_REQUEST: u16 = 0x0003;
const ATTR_SOURCE_ADDRESS: u16 = 0x0004;
const ATTR_CHANGED_ADDRESS: u16 = 0x0005;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const ATTR_SOFTWARE: u16 = 0x8022;
const ATTR_RESPONSE_ORIGIN: u16 = 0x802B;
const ATTR_OTHER_ADDRESS: u16 = 0x802C;

const CHANGE_IP_FLAG: u32 = 0x04;
const CHANGE_PORT_FLAG: u32 = 0x02;

/// STUN message class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StunMessageClass {
    /// Request message
    Request,
    /// Success response
    SuccessResponse,
    /// Error response
    ErrorResponse,
    /// Indication (no response expected)
    Indication,
}

impl StunMessageClass {
    fn bits(self) -> u16 {
        match self {
            Self::Request => 0b00,
            Self::Indication => 0b01,
            Self::SuccessResponse => 0b10,
            Self::ErrorResponse => 0b11,
        }
    }
}

/// Binding is the only method spoken here.
const METHOD_BINDING: u16 = 0x0001;

/// Interleave method and class bits (RFC 5389 section 6).
///
/// ```text
///  0                 1
///  2  3  4 5 6 7 8 9 0 1 2 3 4 5
/// +--+--+-+-+-+-+-+-+-+-+-+-+-+-+
/// |M |M |M|M|M|C|M|M|M|C|M|M|M|M|
/// |11|10|9|8|7|1|6|5|4|0|3|2|1|0|
/// +--+--+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
fn encode_type(method: u16, class: StunMessageClass) -> u16 {
    let c = class.bits();
    (method & 0x0F)
        | ((c & 0x01) << 4)
        | ((method & 0x70) << 1)
        | ((c & 0x02) << 7)
        | ((method & 0xF80) << 2)
}

fn decode_type(msg_type: u16) -> std::result::Result<StunMessageClass, StunError> {
    let class = match ((msg_type >> 4) & 0x01) | (((msg_type >> 8) & 0x01) << 1) {
        0b00 => StunMessageClass::Request,
        0b01 => StunMessageClass::Indication,
        0b10 => StunMessageClass::SuccessResponse,
        _ => StunMessageClass::ErrorResponse,
    };
    let method = (msg_type & 0x0F) | ((msg_type >> 1) & 0x70) | ((msg_type >> 2) & 0xF80);
    if method != METHOD_BINDING {
        return Err(StunError::InvalidMessageType);
    }
    Ok(class)
}

/// CHANGE-REQUEST flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeRequest {
    /// Ask the server to reply from its alternate IP
    pub change_ip: bool,
    /// Ask the server to reply from its alternate port
    pub change_port: bool,
}

impl ChangeRequest {
    /// No change: reply from the address the request hit.
    pub const NONE: Self = Self {
        change_ip: false,
        change_port: false,
    };
    /// Reply from alternate IP and port.
    pub const IP_AND_PORT: Self = Self {
        change_ip: true,
        change_port: true,
    };
    /// Reply from alternate port only.
    pub const PORT: Self = Self {
        change_ip: false,
        change_port: true,
    };

    fn flags(self) -> u32 {
        let mut flags = 0;
        if self.change_ip {
            flags |= CHANGE_IP_FLAG;
        }
        if self.change_port {
            flags |= CHANGE_PORT_FLAG;
        }
        flags
    }

    fn from_flags(flags: u32) -> Self {
        Self {
            change_ip: flags & CHANGE_IP_FLAG != 0,
            change_port: flags & CHANGE_PORT_FLAG != 0,
        }
    }
}

/// STUN attributes understood by the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StunAttribute {
    /// MAPPED-ADDRESS (0x0001)
    MappedAddress(SocketAddr),
    /// CHANGE-REQUEST (0x0003)
    ChangeRequest(ChangeRequest),
    /// SOURCE-ADDRESS (0x0004)
    SourceAddress(SocketAddr),
    /// CHANGED-ADDRESS (0x0005)
    ChangedAddress(SocketAddr),
    /// XOR-MAPPED-ADDRESS (0x0020)
    XorMappedAddress(SocketAddr),
    /// SOFTWARE (0x8022)
    Software(String),
    /// RESPONSE-ORIGIN (0x802B)
    ResponseOrigin(SocketAddr),
    /// OTHER-ADDRESS (0x802C)
    OtherAddress(SocketAddr),
    /// Anything else, kept raw
    Unknown(u16, Vec<u8>),
}

impl StunAttribute {
    fn attr_type(&self) -> u16 {
        match self {
            Self::MappedAddress(_) => ATTR_MAPPED_ADDRESS,
            Self::ChangeRequest(_) => ATTR_CHANGE_REQUEST,
            Self::SourceAddress(_) => ATTR_SOURCE_ADDRESS,
            Self::ChangedAddress(_) => ATTR_CHANGED_ADDRESS,
            Self::XorMappedAddress(_) => ATTR_XOR_MAPPED_ADDRESS,
            Self::Software(_) => ATTR_SOFTWARE,
            Self::ResponseOrigin(_) => ATTR_RESPONSE_ORIGIN,
            Self::OtherAddress(_) => ATTR_OTHER_ADDRESS,
            Self::Unknown(t, _) => *t,
        }
    }

    fn encode(&self, transaction_id: &[u8; 12]) -> Vec<u8> {
        let value = self.encode_value(transaction_id);
        let mut bytes = Vec::with_capacity(4 + value.len() + 3);
        bytes.extend_from_slice(&self.attr_type().to_be_bytes());
        bytes.extend_from_slice(&(value.len() as u16).to_be_bytes());
        bytes.extend_from_slice(&value);
        let padding = (4 - (value.len() % 4)) % 4;
        bytes.extend(std::iter::repeat_n(0, padding));
        bytes
    }

    fn encode_value(&self, transaction_id: &[u8; 12]) -> Vec<u8> {
        match self {
            Self::MappedAddress(a)
            | Self::SourceAddress(a)
            | Self::ChangedAddress(a)
            | Self::ResponseOrigin(a)
            | Self::OtherAddress(a) => encode_address(*a, None),
            Self::XorMappedAddress(a) => encode_address(*a, Some(transaction_id)),
            Self::ChangeRequest(c) => c.flags().to_be_bytes().to_vec(),
            Self::Software(s) => s.as_bytes().to_vec(),
            Self::Unknown(_, data) => data.clone(),
        }
    }

    fn decode(
        attr_type: u16,
        value: &[u8],
        transaction_id: &[u8; 12],
    ) -> std::result::Result<Self, StunError> {
        Ok(match attr_type {
            ATTR_MAPPED_ADDRESS => Self::MappedAddress(decode_address(value, None)?),
            ATTR_SOURCE_ADDRESS => Self::SourceAddress(decode_address(value, None)?),
            ATTR_CHANGED_ADDRESS => Self::ChangedAddress(decode_address(value, None)?),
            ATTR_RESPONSE_ORIGIN => Self::ResponseOrigin(decode_address(value, None)?),
            ATTR_OTHER_ADDRESS => Self::OtherAddress(decode_address(value, None)?),
            ATTR_XOR_MAPPED_ADDRESS => {
                Self::XorMappedAddress(decode_address(value, Some(transaction_id))?)
            }
            ATTR_CHANGE_REQUEST => {
                let raw: [u8; 4] = value.try_into().map_err(|_| StunError::InvalidAttribute)?;
                Self::ChangeRequest(ChangeRequest::from_flags(u32::from_be_bytes(raw)))
            }
            ATTR_SOFTWARE => Self::Software(String::from_utf8_lossy(value).to_string()),
            _ => Self::Unknown(attr_type, value.to_vec()),
        })
    }
}

/// Address attribute value. XOR-ed with the cookie (and transaction id
/// for IPv6) when `xor` carries the transaction id.
fn encode_address(addr: SocketAddr, xor: Option<&[u8; 12]>) -> Vec<u8> {
    let mut key = MAGIC_COOKIE.to_be_bytes().to_vec();
    if let Some(tid) = xor {
        key.extend_from_slice(tid);
    }
    let port_mask = if xor.is_some() {
        (MAGIC_COOKIE >> 16) as u16
    } else {
        0
    };

    let mut value = vec![0, if addr.is_ipv4() { 0x01 } else { 0x02 }];
    value.extend_from_slice(&(addr.port() ^ port_mask).to_be_bytes());
    let octets: Vec<u8> = match addr.ip() {
        IpAddr::V4(ip) => ip.octets().to_vec(),
        IpAddr::V6(ip) => ip.octets().to_vec(),
    };
    for (i, b) in octets.iter().enumerate() {
        value.push(if xor.is_some() { b ^ key[i] } else { *b });
    }
    value
}

fn decode_address(
    value: &[u8],
    xor: Option<&[u8; 12]>,
) -> std::result::Result<SocketAddr, StunError> {
    if value.len() < 4 {
        return Err(StunError::InvalidAttribute);
    }
    let mut key = MAGIC_COOKIE.to_be_bytes().to_vec();
    if let Some(tid) = xor {
        key.extend_from_slice(tid);
    }
    let unmask = |i: usize, b: u8| if xor.is_some() { b ^ key[i] } else { b };

    let mut port = u16::from_be_bytes([value[2], value[3]]);
    if xor.is_some() {
        port ^= (MAGIC_COOKIE >> 16) as u16;
    }

    let ip = match value[1] {
        0x01 => {
            if value.len() < 8 {
                return Err(StunError::InvalidAttribute);
            }
            let mut o = [0u8; 4];
            for i in 0..4 {
                o[i] = unmask(i, value[4 + i]);
            }
            IpAddr::V4(Ipv4Addr::from(o))
        }
        0x02 => {
            if value.len() < 20 {
                return Err(StunError::InvalidAttribute);
            }
            let mut o = [0u8; 16];
            for i in 0..16 {
                o[i] = unmask(i, value[4 + i]);
            }
            IpAddr::V6(Ipv6Addr::from(o))
        }
        _ => return Err(StunError::InvalidAttribute),
    };
    Ok(SocketAddr::new(ip, port))
}

/// STUN message
#[derive(Debug, Clone)]
pub struct StunMessage {
    /// Message class
    pub message_class: StunMessageClass,
    /// Transaction ID (96 bits)
    pub transaction_id: [u8; 12],
    /// Message attributes
    pub attributes: Vec<StunAttribute>,
}

impl StunMessage {
    /// New Binding request with a random transaction id.
    #[must_use]
    pub fn binding_request() -> Self {
        Self {
            message_class: StunMessageClass::Request,
            transaction_id: rand::random(),
            attributes: Vec::new(),
        }
    }

    /// Binding request carrying CHANGE-REQUEST (omitted when no flag is set).
    #[must_use]
    pub fn binding_request_with(change: ChangeRequest) -> Self {
        let mut msg = Self::binding_request();
        if change != ChangeRequest::NONE {
            msg.add_attribute(StunAttribute::ChangeRequest(change));
        }
        msg
    }

    /// Success response to `request` (used by test servers).
    #[must_use]
    pub fn binding_response(request: &Self) -> Self {
        Self {
            message_class: StunMessageClass::SuccessResponse,
            transaction_id: request.transaction_id,
            attributes: Vec::new(),
        }
    }

    /// Add an attribute to the message
    pub fn add_attribute(&mut self, attr: StunAttribute) {
        self.attributes.push(attr);
    }

    /// Encode message to bytes
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE + 32);
        bytes.extend_from_slice(&encode_type(METHOD_BINDING, self.message_class).to_be_bytes());
        bytes.extend_from_slice(&[0u8; 2]);
        bytes.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        bytes.extend_from_slice(&self.transaction_id);

        for attr in &self.attributes {
            bytes.extend_from_slice(&attr.encode(&self.transaction_id));
        }

        let msg_length = (bytes.len() - HEADER_SIZE) as u16;
        bytes[2..4].copy_from_slice(&msg_length.to_be_bytes());
        bytes
    }

    /// Decode message from bytes. Malformed attributes are skipped.
    ///
    /// # Errors
    ///
    /// Returns `StunError` for a short header, wrong cookie or non-Binding method.
    pub fn decode(bytes: &[u8]) -> std::result::Result<Self, StunError> {
        if bytes.len() < HEADER_SIZE {
            return Err(StunError::MessageTooShort);
        }

        let msg_type = u16::from_be_bytes([bytes[0], bytes[1]]);
        let msg_length = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        let cookie = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if cookie != MAGIC_COOKIE {
            return Err(StunError::InvalidMagicCookie);
        }

        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&bytes[8..20]);
        let message_class = decode_type(msg_type)?;

        let end = bytes.len().min(HEADER_SIZE + msg_length);
        let mut attributes = Vec::new();
        let mut offset = HEADER_SIZE;
        while offset + 4 <= end {
            let attr_type = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]);
            let attr_len = u16::from_be_bytes([bytes[offset + 2], bytes[offset + 3]]) as usize;
            offset += 4;
            if offset + attr_len > end {
                break;
            }
            match StunAttribute::decode(attr_type, &bytes[offset..offset + attr_len], &transaction_id)
            {
                Ok(attr) => attributes.push(attr),
                Err(e) => trace!("Skipping STUN attribute {:#06x}: {}", attr_type, e),
            }
            offset += attr_len + (4 - (attr_len % 4)) % 4;
        }

        Ok(Self {
            message_class,
            transaction_id,
            attributes,
        })
    }

    /// Mapped address, preferring XOR-MAPPED-ADDRESS.
    #[must_use]
    pub fn mapped_address(&self) -> Option<SocketAddr> {
        let xor = self.attributes.iter().find_map(|a| match a {
            StunAttribute::XorMappedAddress(addr) => Some(*addr),
            _ => None,
        });
        xor.or_else(|| {
            self.attributes.iter().find_map(|a| match a {
                StunAttribute::MappedAddress(addr) => Some(*addr),
                _ => None,
            })
        })
    }

    /// Server's alternate address (CHANGED-ADDRESS or OTHER-ADDRESS).
    #[must_use]
    pub fn changed_address(&self) -> Option<SocketAddr> {
        self.attributes.iter().find_map(|a| match a {
            StunAttribute::ChangedAddress(addr) | StunAttribute::OtherAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    /// Address the response was sent from, as claimed by the server.
    #[must_use]
    pub fn source_address(&self) -> Option<SocketAddr> {
        self.attributes.iter().find_map(|a| match a {
            StunAttribute::SourceAddress(addr) | StunAttribute::ResponseOrigin(addr) => Some(*addr),
            _ => None,
        })
    }

    /// CHANGE-REQUEST flags, if present.
    #[must_use]
    pub fn change_request(&self) -> ChangeRequest {
        self.attributes
            .iter()
            .find_map(|a| match a {
                StunAttribute::ChangeRequest(c) => Some(*c),
                _ => None,
            })
            .unwrap_or_default()
    }
}

/// Decoded Binding success response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StunResponse {
    /// Our address as seen by the server
    pub mapped: SocketAddr,
    /// Address the response actually came from
    pub from: SocketAddr,
    /// Server's alternate address
    pub changed: Option<SocketAddr>,
}

type StunReply = (StunMessage, SocketAddr);

/// STUN client sharing one socket between concurrent requests.
pub struct StunClient {
    pipe: PipeRef,
    pending: Arc<PendingTable<[u8; 12], StunReply>>,
    config: ReliableConfig,
    receiver: tokio::task::AbortHandle,
}

impl StunClient {
    /// Client over an already bound datagram pipe.
    #[must_use]
    pub fn new(pipe: PipeRef, config: ReliableConfig) -> Self {
        let pending = Arc::new(PendingTable::new(TABLE_LIMIT));
        let receiver = Self::spawn_receiver(pipe.clone(), pending.clone());
        Self {
            pipe,
            pending,
            config,
            receiver,
        }
    }

    /// Bind a fresh UDP socket on `local`.
    ///
    /// # Errors
    ///
    /// `Bind` if the socket cannot be bound.
    pub fn bind(local: SocketAddr, config: ReliableConfig) -> Result<Self> {
        Ok(Self::new(Arc::new(UdpPipe::bind(local)?), config))
    }

    /// Local socket address
    ///
    /// # Errors
    ///
    /// Propagates the pipe's error.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.pipe.local_addr()
    }

    fn spawn_receiver(
        pipe: PipeRef,
        pending: Arc<PendingTable<[u8; 12], StunReply>>,
    ) -> tokio::task::AbortHandle {
        tokio::spawn(async move {
            while !pipe.is_closed() {
                let (data, from) = match pipe.recv(Duration::from_millis(250)).await {
                    Ok(Some(received)) => received,
                    Ok(None) => continue,
                    Err(e) => {
                        debug!("STUN receiver stopping: {}", e);
                        break;
                    }
                };
                match StunMessage::decode(&data) {
                    Ok(msg) => {
                        let tid = msg.transaction_id;
                        if !pending.complete(&tid, (msg, from)).await {
                            trace!("Unsolicited STUN message from {}", from);
                        }
                    }
                    Err(e) => trace!("Bad STUN message from {}: {}", from, e),
                }
            }
        })
        .abort_handle()
    }

    /// Send a Binding request to `server` and wait for the response.
    ///
    /// # Errors
    ///
    /// `Timeout` after all retransmissions, `Protocol` for an error
    /// response or one without a mapped address.
    pub async fn request(&self, server: SocketAddr, change: ChangeRequest) -> Result<StunResponse> {
        let request = StunMessage::binding_request_with(change);
        let bytes = request.encode();

        let (reply, from) = retransmit(&self.pending, request.transaction_id, &self.config, || {
            let pipe = self.pipe.clone();
            let bytes = bytes.clone();
            async move {
                pipe.send(&bytes, Some(server)).await?;
                Ok(())
            }
        })
        .await?;

        if reply.message_class != StunMessageClass::SuccessResponse {
            return Err(StunError::ErrorResponse.into());
        }
        let mapped = reply.mapped_address().ok_or(StunError::MissingAttribute)?;
        Ok(StunResponse {
            mapped,
            from,
            changed: reply.changed_address(),
        })
    }

    /// Plain Binding request packaged as a probe result.
    ///
    /// # Errors
    ///
    /// Same as [`StunClient::request`].
    pub async fn get_mapping(&self, server: SocketAddr) -> Result<StunProbeResult> {
        let response = self.request(server, ChangeRequest::NONE).await?;
        Ok(StunProbeResult {
            wan_ip: response.mapped.ip(),
            mapped_port: response.mapped.port(),
            source_server: server,
            local: self.local_addr()?,
            changed: response.changed,
        })
    }

    /// Stop the receiver and close the socket.
    ///
    /// # Errors
    ///
    /// Propagates the pipe's close error.
    pub async fn close(&self) -> Result<()> {
        self.receiver.abort();
        self.pipe.close().await
    }
}

impl Drop for StunClient {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}

/// STUN error types
#[derive(Debug)]
pub enum StunError {
    /// I/O error
    Io(std::io::Error),
    /// Query timeout
    Timeout,
    /// Invalid message format
    MessageTooShort,
    /// Invalid magic cookie
    InvalidMagicCookie,
    /// Invalid message type
    InvalidMessageType,
    /// Invalid attribute
    InvalidAttribute,
    /// Error response received
    ErrorResponse,
    /// Missing required attribute
    MissingAttribute,
}

impl std::fmt::Display for StunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Timeout => write!(f, "STUN query timeout"),
            Self::MessageTooShort => write!(f, "STUN message too short"),
            Self::InvalidMagicCookie => write!(f, "Invalid STUN magic cookie"),
            Self::InvalidMessageType => write!(f, "Invalid STUN message type"),
            Self::InvalidAttribute => write!(f, "Invalid STUN attribute"),
            Self::ErrorResponse => write!(f, "STUN error response"),
            Self::MissingAttribute => write!(f, "Missing required STUN attribute"),
        }
    }
}

impl std::error::Error for StunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StunError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nat::test_server::TestStunServer;
    use crate::transport::Pipe;

    #[test]
    fn test_message_type_encoding() {
        assert_eq!(encode_type(METHOD_BINDING, StunMessageClass::Request), 0x0001);
        assert_eq!(
            encode_type(METHOD_BINDING, StunMessageClass::SuccessResponse),
            0x0101
        );
        assert_eq!(
            encode_type(METHOD_BINDING, StunMessageClass::ErrorResponse),
            0x0111
        );
        assert_eq!(
            decode_type(0x0101).unwrap(),
            StunMessageClass::SuccessResponse
        );
        assert!(decode_type(0x0003).is_err());
    }

    #[test]
    fn test_request_with_change_flags() {
        let msg = StunMessage::binding_request_with(ChangeRequest::IP_AND_PORT);
        let bytes = msg.encode();
        // header + CHANGE-REQUEST (4 + 4)
        assert_eq!(bytes.len(), HEADER_SIZE + 8);
        assert_eq!(&bytes[HEADER_SIZE + 4..], &[0, 0, 0, 0x06]);

        let decoded = StunMessage::decode(&bytes).unwrap();
        assert_eq!(decoded.transaction_id, msg.transaction_id);
        assert_eq!(decoded.change_request(), ChangeRequest::IP_AND_PORT);

        let plain = StunMessage::binding_request_with(ChangeRequest::NONE);
        assert_eq!(plain.encode().len(), HEADER_SIZE);
    }

    #[test]
    fn test_response_address_attributes() {
        let request = StunMessage::binding_request();
        let mut resp = StunMessage::binding_response(&request);
        let mapped: SocketAddr = "203.0.113.7:40001".parse().unwrap();
        let changed: SocketAddr = "198.51.100.2:3479".parse().unwrap();
        let source: SocketAddr = "198.51.100.1:3478".parse().unwrap();
        resp.add_attribute(StunAttribute::MappedAddress(mapped));
        resp.add_attribute(StunAttribute::SourceAddress(source));
        resp.add_attribute(StunAttribute::ChangedAddress(changed));
        resp.add_attribute(StunAttribute::Software("test".into()));

        let decoded = StunMessage::decode(&resp.encode()).unwrap();
        assert_eq!(decoded.message_class, StunMessageClass::SuccessResponse);
        assert_eq!(decoded.mapped_address(), Some(mapped));
        assert_eq!(decoded.source_address(), Some(source));
        assert_eq!(decoded.changed_address(), Some(changed));
    }

    #[test]
    fn test_xor_mapped_preferred_and_ipv6() {
        let request = StunMessage::binding_request();
        let mut resp = StunMessage::binding_response(&request);
        let plain: SocketAddr = "10.0.0.1:1000".parse().unwrap();
        let xor: SocketAddr = "[2001:db8::1]:32853".parse().unwrap();
        resp.add_attribute(StunAttribute::MappedAddress(plain));
        resp.add_attribute(StunAttribute::XorMappedAddress(xor));

        let bytes = resp.encode();
        let decoded = StunMessage::decode(&bytes).unwrap();
        assert_eq!(decoded.mapped_address(), Some(xor));
    }

    #[test]
    fn test_other_address_alias() {
        let request = StunMessage::binding_request();
        let mut resp = StunMessage::binding_response(&request);
        let other: SocketAddr = "192.0.2.9:3479".parse().unwrap();
        resp.add_attribute(StunAttribute::OtherAddress(other));
        resp.add_attribute(StunAttribute::ResponseOrigin(other));
        let decoded = StunMessage::decode(&resp.encode()).unwrap();
        assert_eq!(decoded.changed_address(), Some(other));
        assert_eq!(decoded.source_address(), Some(other));
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(
            StunMessage::decode(&[0u8; 10]),
            Err(StunError::MessageTooShort)
        ));
        let mut bytes = StunMessage::binding_request().encode();
        bytes[4] = 0;
        assert!(matches!(
            StunMessage::decode(&bytes),
            Err(StunError::InvalidMagicCookie)
        ));
    }

    #[test]
    fn test_truncated_attribute_is_skipped() {
        let request = StunMessage::binding_request();
        let mut resp = StunMessage::binding_response(&request);
        resp.add_attribute(StunAttribute::Unknown(ATTR_MAPPED_ADDRESS, vec![0, 1]));
        let decoded = StunMessage::decode(&resp.encode()).unwrap();
        assert!(decoded.mapped_address().is_none());
    }

    #[tokio::test]
    async fn test_client_gets_mapping() {
        let server = TestStunServer::spawn("127.0.0.1".parse().unwrap(), None)
            .await
            .unwrap();
        let client = StunClient::bind(
            "127.0.0.1:0".parse().unwrap(),
            ReliableConfig::new().with_window(Duration::from_millis(200)),
        )
        .unwrap();

        let probe = client.get_mapping(server.primary()).await.unwrap();
        assert_eq!(probe.local, client.local_addr().unwrap());
        assert_eq!(probe.wan_ip, probe.local.ip());
        assert_eq!(probe.mapped_port, probe.local.port());
        assert_eq!(probe.source_server, server.primary());
    }

    #[tokio::test]
    async fn test_client_times_out() {
        let silent = UdpPipe::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let dead = silent.local_addr().unwrap();
        let client = StunClient::bind(
            "127.0.0.1:0".parse().unwrap(),
            ReliableConfig::new()
                .with_tries(2)
                .with_window(Duration::from_millis(30)),
        )
        .unwrap();
        assert!(matches!(
            client.request(dead, ChangeRequest::NONE).await,
            Err(TraversalError::Timeout(_))
        ));
    }

    #[test]
    fn test_stun_error_display() {
        assert_eq!(StunError::Timeout.to_string(), "STUN query timeout");
        let io = StunError::from(std::io::Error::other("boom"));
        assert!(std::error::Error::source(&io).is_some());
    }
}
