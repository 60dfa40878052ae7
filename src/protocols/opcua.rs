//! OPC UA TCP binary client, limited to what identification and minimal
//! sampling need.
//!
//! Covers Hello/Acknowledge, a SecurityPolicy None secure channel,
//! GetEndpoints, an anonymous session and attribute Read. Messages are
//! unsigned and unencrypted.

use crate::protocols::ProtocolError;
use chrono::{TimeZone, Utc};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

pub const SECURITY_POLICY_NONE: &str = "http://opcfoundation.org/UA/SecurityPolicy#None";

const OPEN_SECURE_CHANNEL_REQUEST: u32 = 446;
const OPEN_SECURE_CHANNEL_RESPONSE: u32 = 449;
const CLOSE_SECURE_CHANNEL_REQUEST: u32 = 452;
const GET_ENDPOINTS_REQUEST: u32 = 428;
const GET_ENDPOINTS_RESPONSE: u32 = 431;
const CREATE_SESSION_REQUEST: u32 = 461;
const CREATE_SESSION_RESPONSE: u32 = 464;
const ACTIVATE_SESSION_REQUEST: u32 = 467;
const ACTIVATE_SESSION_RESPONSE: u32 = 470;
const CLOSE_SESSION_REQUEST: u32 = 473;
const READ_REQUEST: u32 = 631;
const READ_RESPONSE: u32 = 634;
const ANONYMOUS_IDENTITY_TOKEN: u32 = 321;
const SERVICE_FAULT: u32 = 397;

/// Server_ServerStatus_BuildInfo children, in the order they are read.
const BUILD_INFO_NODES: [u32; 5] = [2262, 2263, 2261, 2264, 2265];

const ATTRIBUTE_VALUE: u32 = 13;
const BUFFER_SIZE: u32 = 65_535;
/// Upper bound on a single chunk accepted from a server.
const MAX_CHUNK: usize = 1 << 20;
const MAX_ARRAY: i32 = 4_096;
/// 100ns ticks between 1601-01-01 and the Unix epoch.
const EPOCH_OFFSET_TICKS: i64 = 116_444_736_000_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeId {
    Numeric { ns: u16, id: u32 },
    String { ns: u16, id: String },
    Guid { ns: u16, id: [u8; 16] },
    Opaque { ns: u16, id: Vec<u8> },
}

impl NodeId {
    pub fn numeric(ns: u16, id: u32) -> Self {
        NodeId::Numeric { ns, id }
    }

    pub fn null() -> Self {
        NodeId::Numeric { ns: 0, id: 0 }
    }

    fn ns0_id(&self) -> Option<u32> {
        match self {
            NodeId::Numeric { ns: 0, id } => Some(*id),
            _ => None,
        }
    }
}

/// Parses the standard string form: `i=2258`, `ns=2;i=10`, `ns=2;s=Execution`.
impl FromStr for NodeId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ProtocolError::Malformed(format!("invalid NodeId '{}'", s));
        let (ns, rest) = match s.strip_prefix("ns=") {
            Some(tail) => {
                let (ns, rest) = tail.split_once(';').ok_or_else(bad)?;
                (ns.parse::<u16>().map_err(|_| bad())?, rest)
            }
            None => (0, s),
        };
        if let Some(id) = rest.strip_prefix("i=") {
            return Ok(NodeId::Numeric { ns, id: id.parse().map_err(|_| bad())? });
        }
        if let Some(id) = rest.strip_prefix("s=") {
            return Ok(NodeId::String { ns, id: id.to_string() });
        }
        Err(bad())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeId::Numeric { ns: 0, id } => write!(f, "i={}", id),
            NodeId::Numeric { ns, id } => write!(f, "ns={};i={}", ns, id),
            NodeId::String { ns, id } => write!(f, "ns={};s={}", ns, id),
            NodeId::Guid { ns, id } => write!(f, "ns={};g={}", ns, hex::encode(id)),
            NodeId::Opaque { ns, id } => write!(f, "ns={};b={}", ns, hex::encode(id)),
        }
    }
}

/// Transport limits returned by the server in its Acknowledge message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acknowledge {
    pub protocol_version: u32,
    pub receive_buffer_size: u32,
    pub send_buffer_size: u32,
    pub max_message_size: u32,
    pub max_chunk_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplicationDescription {
    pub application_uri: Option<String>,
    pub product_uri: Option<String>,
    pub application_name: Option<String>,
    pub application_type: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointDescription {
    pub endpoint_url: Option<String>,
    pub server: ApplicationDescription,
    pub security_mode: u32,
    pub security_policy_uri: Option<String>,
    /// Policy id of the anonymous user token, when the endpoint offers one.
    pub anonymous_policy_id: Option<String>,
    pub security_level: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildInfo {
    pub product_uri: Option<String>,
    pub manufacturer_name: Option<String>,
    pub product_name: Option<String>,
    pub software_version: Option<String>,
    pub build_number: Option<String>,
}

/// Outcome of a discovery handshake. Everything past the Acknowledge is
/// best effort: `endpoints` / `build_info` stay empty when a later step
/// fails, and the first such failure is kept in `error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryResult {
    pub ack: Acknowledge,
    pub endpoints: Vec<EndpointDescription>,
    pub build_info: Option<BuildInfo>,
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn i32(&mut self, v: i32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn i64(&mut self, v: i64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn f64(&mut self, v: f64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn bytes(&mut self, v: Option<&[u8]>) -> &mut Self {
        match v {
            Some(b) => {
                self.i32(b.len() as i32);
                self.buf.extend_from_slice(b);
            }
            None => {
                self.i32(-1);
            }
        }
        self
    }

    fn string(&mut self, v: Option<&str>) -> &mut Self {
        self.bytes(v.map(str::as_bytes))
    }

    fn node_id(&mut self, node: &NodeId) -> &mut Self {
        match node {
            NodeId::Numeric { ns: 0, id } if *id <= 0xFF => {
                self.u8(0x00).u8(*id as u8);
            }
            NodeId::Numeric { ns, id } if *ns <= 0xFF && *id <= 0xFFFF => {
                self.u8(0x01).u8(*ns as u8).u16(*id as u16);
            }
            NodeId::Numeric { ns, id } => {
                self.u8(0x02).u16(*ns).u32(*id);
            }
            NodeId::String { ns, id } => {
                self.u8(0x03).u16(*ns).string(Some(id));
            }
            NodeId::Guid { ns, id } => {
                self.u8(0x04).u16(*ns);
                self.buf.extend_from_slice(id);
            }
            NodeId::Opaque { ns, id } => {
                self.u8(0x05).u16(*ns).bytes(Some(id));
            }
        }
        self
    }

    fn type_id(&mut self, id: u32) -> &mut Self {
        self.node_id(&NodeId::numeric(0, id))
    }

    fn request_header(&mut self, auth: &NodeId, handle: u32, timeout_ms: u32) -> &mut Self {
        self.node_id(auth);
        self.i64(now_ticks());
        self.u32(handle);
        self.u32(0); // return diagnostics
        self.string(None); // audit entry id
        self.u32(timeout_ms);
        // empty additional header extension object
        self.u8(0x00).u8(0x00).u8(0x00)
    }
}

fn now_ticks() -> i64 {
    Utc::now().timestamp_micros().saturating_mul(10).saturating_add(EPOCH_OFFSET_TICKS)
}

fn ticks_to_rfc3339(ticks: i64) -> Option<String> {
    let micros = (ticks - EPOCH_OFFSET_TICKS) / 10;
    Utc.timestamp_micros(micros).single().map(|t| t.to_rfc3339())
}

fn frame(message_type: &[u8; 3], body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + body.len());
    out.extend_from_slice(message_type);
    out.push(b'F');
    out.extend_from_slice(&((8 + body.len()) as u32).to_le_bytes());
    out.extend_from_slice(body);
    out
}

pub fn encode_hello(endpoint_url: &str) -> Vec<u8> {
    let mut e = Encoder::default();
    e.u32(0).u32(BUFFER_SIZE).u32(BUFFER_SIZE).u32(0).u32(0).string(Some(endpoint_url));
    frame(b"HEL", &e.buf)
}

pub fn encode_open_secure_channel(request_id: u32, timeout_ms: u32) -> Vec<u8> {
    let mut e = Encoder::default();
    e.u32(0); // secure channel id, assigned by the server
    e.string(Some(SECURITY_POLICY_NONE)).bytes(None).bytes(None);
    e.u32(request_id).u32(request_id);
    e.type_id(OPEN_SECURE_CHANNEL_REQUEST);
    e.request_header(&NodeId::null(), request_id, timeout_ms);
    e.u32(0); // client protocol version
    e.u32(0); // request type: issue
    e.u32(1); // message security mode: none
    e.bytes(Some(&[])); // client nonce
    e.u32(3_600_000); // requested lifetime
    frame(b"OPN", &e.buf)
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

fn truncated() -> ProtocolError {
    ProtocolError::Malformed("truncated OPC UA message".into())
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        let end = self.pos.checked_add(n).ok_or_else(truncated)?;
        let slice = self.buf.get(self.pos..end).ok_or_else(truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, ProtocolError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub fn u32(&mut self) -> Result<u32, ProtocolError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub fn i32(&mut self) -> Result<i32, ProtocolError> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    pub fn i64(&mut self) -> Result<i64, ProtocolError> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    pub fn u64(&mut self) -> Result<u64, ProtocolError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    pub fn f32(&mut self) -> Result<f32, ProtocolError> {
        Ok(f32::from_le_bytes(self.array()?))
    }

    pub fn f64(&mut self) -> Result<f64, ProtocolError> {
        Ok(f64::from_le_bytes(self.array()?))
    }

    pub fn byte_string(&mut self) -> Result<Option<Vec<u8>>, ProtocolError> {
        let len = self.i32()?;
        if len < 0 {
            return Ok(None);
        }
        Ok(Some(self.take(len as usize)?.to_vec()))
    }

    pub fn string(&mut self) -> Result<Option<String>, ProtocolError> {
        Ok(self.byte_string()?.map(|b| String::from_utf8_lossy(&b).into_owned()))
    }

    fn array_len(&mut self) -> Result<usize, ProtocolError> {
        let n = self.i32()?;
        if n > MAX_ARRAY {
            return Err(ProtocolError::Malformed(format!("array length {} too large", n)));
        }
        Ok(n.max(0) as usize)
    }

    pub fn node_id(&mut self) -> Result<NodeId, ProtocolError> {
        let mask = self.u8()?;
        let node = match mask & 0x3F {
            0x00 => NodeId::Numeric { ns: 0, id: self.u8()? as u32 },
            0x01 => {
                let ns = self.u8()? as u16;
                NodeId::Numeric { ns, id: self.u16()? as u32 }
            }
            0x02 => {
                let ns = self.u16()?;
                NodeId::Numeric { ns, id: self.u32()? }
            }
            0x03 => {
                let ns = self.u16()?;
                NodeId::String { ns, id: self.string()?.unwrap_or_default() }
            }
            0x04 => {
                let ns = self.u16()?;
                NodeId::Guid { ns, id: self.array()? }
            }
            0x05 => {
                let ns = self.u16()?;
                NodeId::Opaque { ns, id: self.byte_string()?.unwrap_or_default() }
            }
            other => return Err(ProtocolError::Malformed(format!("NodeId encoding {:#x}", other))),
        };
        if mask & 0x80 != 0 {
            self.string()?; // namespace uri
        }
        if mask & 0x40 != 0 {
            self.u32()?; // server index
        }
        Ok(node)
    }

    fn skip_extension_object(&mut self) -> Result<(), ProtocolError> {
        self.node_id()?;
        match self.u8()? {
            0x00 => {}
            0x01 | 0x02 => {
                self.byte_string()?;
            }
            other => return Err(ProtocolError::Malformed(format!("ExtensionObject encoding {:#x}", other))),
        }
        Ok(())
    }

    fn skip_diagnostic_info(&mut self, depth: u8) -> Result<(), ProtocolError> {
        if depth > 4 {
            return Err(ProtocolError::Malformed("DiagnosticInfo nested too deeply".into()));
        }
        let mask = self.u8()?;
        for bit in [0x01u8, 0x02, 0x04, 0x08] {
            if mask & bit != 0 {
                self.i32()?;
            }
        }
        if mask & 0x10 != 0 {
            self.string()?;
        }
        if mask & 0x20 != 0 {
            self.u32()?;
        }
        if mask & 0x40 != 0 {
            self.skip_diagnostic_info(depth + 1)?;
        }
        Ok(())
    }

    pub fn localized_text(&mut self) -> Result<Option<String>, ProtocolError> {
        let mask = self.u8()?;
        if mask & 0x01 != 0 {
            self.string()?;
        }
        if mask & 0x02 != 0 {
            return self.string();
        }
        Ok(None)
    }

    /// Read a ResponseHeader and fail on a Bad service result.
    fn response_header(&mut self) -> Result<(), ProtocolError> {
        self.i64()?; // timestamp
        self.u32()?; // request handle
        let service_result = self.u32()?;
        self.skip_diagnostic_info(0)?;
        let strings = self.array_len()?;
        for _ in 0..strings {
            self.string()?;
        }
        self.skip_extension_object()?;
        if service_result & 0x8000_0000 != 0 {
            return Err(ProtocolError::Remote(format!("service result {:#010x}", service_result)));
        }
        Ok(())
    }

    fn application_description(&mut self) -> Result<ApplicationDescription, ProtocolError> {
        let application_uri = self.string()?;
        let product_uri = self.string()?;
        let application_name = self.localized_text()?;
        let application_type = self.u32()?;
        self.string()?; // gateway server uri
        self.string()?; // discovery profile uri
        let urls = self.array_len()?;
        for _ in 0..urls {
            self.string()?;
        }
        Ok(ApplicationDescription { application_uri, product_uri, application_name, application_type })
    }

    fn endpoint_description(&mut self) -> Result<EndpointDescription, ProtocolError> {
        let endpoint_url = self.string()?;
        let server = self.application_description()?;
        self.byte_string()?; // server certificate
        let security_mode = self.u32()?;
        let security_policy_uri = self.string()?;
        let mut anonymous_policy_id = None;
        let tokens = self.array_len()?;
        for _ in 0..tokens {
            let policy_id = self.string()?;
            let token_type = self.u32()?;
            self.string()?; // issued token type
            self.string()?; // issuer endpoint url
            self.string()?; // security policy uri
            if token_type == 0 && anonymous_policy_id.is_none() {
                anonymous_policy_id = policy_id;
            }
        }
        self.string()?; // transport profile uri
        let security_level = self.u8()?;
        Ok(EndpointDescription {
            endpoint_url,
            server,
            security_mode,
            security_policy_uri,
            anonymous_policy_id,
            security_level,
        })
    }

    fn scalar(&mut self, type_id: u8) -> Result<Value, ProtocolError> {
        Ok(match type_id {
            0 => Value::Null,
            1 => Value::Bool(self.u8()? != 0),
            2 => Value::from(self.u8()? as i8),
            3 => Value::from(self.u8()?),
            4 => Value::from(self.u16()? as i16),
            5 => Value::from(self.u16()?),
            6 => Value::from(self.i32()?),
            7 => Value::from(self.u32()?),
            8 => Value::from(self.i64()?),
            9 => Value::from(self.u64()?),
            10 => Value::from(self.f32()? as f64),
            11 => Value::from(self.f64()?),
            12 => self.string()?.map(Value::String).unwrap_or(Value::Null),
            13 => ticks_to_rfc3339(self.i64()?).map(Value::String).unwrap_or(Value::Null),
            14 => Value::String(hex::encode(self.array::<16>()?)),
            15 => {
                self.byte_string()?;
                Value::Null
            }
            17 => Value::String(self.node_id()?.to_string()),
            19 => Value::from(self.u32()?),
            20 => {
                self.u16()?;
                self.string()?.map(Value::String).unwrap_or(Value::Null)
            }
            21 => self.localized_text()?.map(Value::String).unwrap_or(Value::Null),
            other => return Err(ProtocolError::Malformed(format!("unsupported Variant type {}", other))),
        })
    }

    pub fn variant(&mut self) -> Result<Value, ProtocolError> {
        let mask = self.u8()?;
        let type_id = mask & 0x3F;
        if mask & 0x80 == 0 {
            return self.scalar(type_id);
        }
        let n = self.array_len()?;
        let mut items = Vec::with_capacity(n);
        for _ in 0..n {
            items.push(self.scalar(type_id)?);
        }
        if mask & 0x40 != 0 {
            let dims = self.array_len()?;
            for _ in 0..dims {
                self.i32()?;
            }
        }
        Ok(Value::Array(items))
    }

    /// A DataValue's value, or `None` when absent or carrying a Bad status.
    pub fn data_value(&mut self) -> Result<Option<Value>, ProtocolError> {
        let mask = self.u8()?;
        let value = if mask & 0x01 != 0 { Some(self.variant()?) } else { None };
        let status = if mask & 0x02 != 0 { self.u32()? } else { 0 };
        if mask & 0x04 != 0 {
            self.i64()?;
        }
        if mask & 0x10 != 0 {
            self.u16()?;
        }
        if mask & 0x08 != 0 {
            self.i64()?;
        }
        if mask & 0x20 != 0 {
            self.u16()?;
        }
        Ok(if status & 0x8000_0000 != 0 { None } else { value })
    }
}

pub fn decode_acknowledge(body: &[u8]) -> Result<Acknowledge, ProtocolError> {
    let mut d = Decoder::new(body);
    Ok(Acknowledge {
        protocol_version: d.u32()?,
        receive_buffer_size: d.u32()?,
        send_buffer_size: d.u32()?,
        max_message_size: d.u32()?,
        max_chunk_count: d.u32()?,
    })
}

pub fn decode_error(body: &[u8]) -> ProtocolError {
    let mut d = Decoder::new(body);
    match (d.u32(), d.string()) {
        (Ok(code), Ok(reason)) => ProtocolError::Remote(format!(
            "server error {:#010x}: {}",
            code,
            reason.unwrap_or_default()
        )),
        _ => truncated(),
    }
}

/// Identifiers of an open secure channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecureChannel {
    pub channel_id: u32,
    pub token_id: u32,
}

/// Decode an OPN response body (after the 8-byte message header).
pub fn decode_open_secure_channel(body: &[u8]) -> Result<SecureChannel, ProtocolError> {
    let mut d = Decoder::new(body);
    d.u32()?; // secure channel id in the header
    d.string()?; // security policy uri
    d.byte_string()?; // sender certificate
    d.byte_string()?; // receiver thumbprint
    d.u32()?; // sequence number
    d.u32()?; // request id
    expect_type(&mut d, OPEN_SECURE_CHANNEL_RESPONSE)?;
    d.response_header()?;
    d.u32()?; // server protocol version
    let channel_id = d.u32()?;
    let token_id = d.u32()?;
    d.i64()?; // created at
    d.u32()?; // revised lifetime
    d.byte_string()?; // server nonce
    Ok(SecureChannel { channel_id, token_id })
}

/// Decode a reassembled GetEndpoints response service body (starting at the
/// type NodeId).
pub fn decode_get_endpoints(body: &[u8]) -> Result<Vec<EndpointDescription>, ProtocolError> {
    let mut d = Decoder::new(body);
    expect_type(&mut d, GET_ENDPOINTS_RESPONSE)?;
    d.response_header()?;
    let n = d.array_len()?;
    let mut endpoints = Vec::with_capacity(n);
    for _ in 0..n {
        endpoints.push(d.endpoint_description()?);
    }
    Ok(endpoints)
}

pub fn decode_read(body: &[u8]) -> Result<Vec<Option<Value>>, ProtocolError> {
    let mut d = Decoder::new(body);
    expect_type(&mut d, READ_RESPONSE)?;
    d.response_header()?;
    let n = d.array_len()?;
    let mut values = Vec::with_capacity(n);
    for _ in 0..n {
        values.push(d.data_value()?);
    }
    Ok(values)
}

fn expect_type(d: &mut Decoder<'_>, expected: u32) -> Result<(), ProtocolError> {
    let type_id = d.node_id()?;
    match type_id.ns0_id() {
        Some(id) if id == expected => Ok(()),
        Some(SERVICE_FAULT) => {
            d.response_header()?;
            Err(ProtocolError::Remote("service fault".into()))
        }
        _ => Err(ProtocolError::Malformed(format!("unexpected response type {}", type_id))),
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

async fn read_chunk(stream: &mut TcpStream) -> Result<([u8; 3], u8, Vec<u8>), ProtocolError> {
    let mut header = [0u8; 8];
    stream.read_exact(&mut header).await?;
    let size = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
    if !(8..=MAX_CHUNK).contains(&size) {
        return Err(ProtocolError::Malformed(format!("chunk size {}", size)));
    }
    let mut body = vec![0u8; size - 8];
    stream.read_exact(&mut body).await?;
    Ok(([header[0], header[1], header[2]], header[3], body))
}

/// Read one complete MSG response, stripping the per-chunk security and
/// sequence headers and concatenating the bodies.
async fn read_message(stream: &mut TcpStream) -> Result<Vec<u8>, ProtocolError> {
    let mut out = Vec::new();
    loop {
        let (kind, chunk, body) = read_chunk(stream).await?;
        match &kind {
            b"MSG" => {}
            b"ERR" => return Err(decode_error(&body)),
            other => {
                return Err(ProtocolError::Malformed(format!(
                    "unexpected message type {}",
                    String::from_utf8_lossy(other)
                )))
            }
        }
        // channel id, token id, sequence number, request id
        let payload = body.get(16..).ok_or_else(truncated)?;
        match chunk {
            b'F' => {
                out.extend_from_slice(payload);
                return Ok(out);
            }
            b'C' => {
                if out.len() + payload.len() > MAX_CHUNK * 4 {
                    return Err(ProtocolError::Malformed("message too large".into()));
                }
                out.extend_from_slice(payload);
            }
            b'A' => return Err(ProtocolError::Remote("message aborted by server".into())),
            other => return Err(ProtocolError::Malformed(format!("chunk type {}", other))),
        }
    }
}

/// One connection with an open SecurityPolicy None channel.
pub struct OpcuaClient {
    stream: TcpStream,
    channel: SecureChannel,
    endpoint_url: String,
    sequence: u32,
    request_id: u32,
    auth_token: NodeId,
    timeout_ms: u32,
    pub ack: Acknowledge,
}

impl OpcuaClient {
    /// Connect, exchange Hello/Acknowledge and open the secure channel.
    ///
    /// A transport failure is an error; a channel failure after the
    /// Acknowledge is returned alongside the ack so callers can still use it
    /// as evidence.
    pub async fn connect(addr: &str, endpoint_url: &str, timeout: Duration) -> Result<Result<Self, (Acknowledge, ProtocolError)>, ProtocolError> {
        let timeout_ms = timeout.as_millis().min(u32::MAX as u128) as u32;
        let mut stream = TcpStream::connect(addr).await?;

        stream.write_all(&encode_hello(endpoint_url)).await?;
        let (kind, _, body) = read_chunk(&mut stream).await?;
        let ack = match &kind {
            b"ACK" => decode_acknowledge(&body)?,
            b"ERR" => return Err(decode_error(&body)),
            _ => return Err(ProtocolError::Malformed("expected ACK".into())),
        };

        let opened = async {
            stream.write_all(&encode_open_secure_channel(1, timeout_ms)).await?;
            let (kind, _, body) = read_chunk(&mut stream).await?;
            match &kind {
                b"OPN" => decode_open_secure_channel(&body),
                b"ERR" => Err(decode_error(&body)),
                _ => Err(ProtocolError::Malformed("expected OPN".into())),
            }
        }
        .await;

        Ok(match opened {
            Ok(channel) => Ok(Self {
                stream,
                channel,
                endpoint_url: endpoint_url.to_string(),
                sequence: 1,
                request_id: 1,
                auth_token: NodeId::null(),
                timeout_ms,
                ack,
            }),
            Err(e) => Err((ack, e)),
        })
    }

    fn begin(&mut self, type_id: u32) -> Encoder {
        self.sequence = self.sequence.wrapping_add(1);
        self.request_id = self.request_id.wrapping_add(1);
        let mut e = Encoder::default();
        e.u32(self.channel.channel_id).u32(self.channel.token_id).u32(self.sequence).u32(self.request_id);
        e.type_id(type_id);
        let auth = self.auth_token.clone();
        e.request_header(&auth, self.request_id, self.timeout_ms);
        e
    }

    async fn call(&mut self, e: Encoder) -> Result<Vec<u8>, ProtocolError> {
        self.stream.write_all(&frame(b"MSG", &e.buf)).await?;
        read_message(&mut self.stream).await
    }

    pub async fn get_endpoints(&mut self) -> Result<Vec<EndpointDescription>, ProtocolError> {
        let mut e = self.begin(GET_ENDPOINTS_REQUEST);
        e.string(Some(&self.endpoint_url.clone()));
        e.i32(0); // locale ids
        e.i32(0); // profile uris
        decode_get_endpoints(&self.call(e).await?)
    }

    /// Create and activate an anonymous session.
    pub async fn open_session(&mut self, anonymous_policy_id: &str) -> Result<(), ProtocolError> {
        let url = self.endpoint_url.clone();
        let mut e = self.begin(CREATE_SESSION_REQUEST);
        // client ApplicationDescription
        e.string(Some("urn:edge-gateway:client")).string(None);
        e.u8(0x02).string(Some("edge-gateway"));
        e.u32(1); // client
        e.string(None).string(None).i32(-1);
        e.string(None); // server uri
        e.string(Some(&url));
        e.string(Some("edge-gateway-probe"));
        e.bytes(None).bytes(None); // nonce, certificate
        e.f64(30_000.0);
        e.u32(0);
        let body = self.call(e).await?;

        let mut d = Decoder::new(&body);
        expect_type(&mut d, CREATE_SESSION_RESPONSE)?;
        d.response_header()?;
        d.node_id()?; // session id
        self.auth_token = d.node_id()?;

        let mut e = self.begin(ACTIVATE_SESSION_REQUEST);
        e.string(None).bytes(None); // client signature
        e.i32(0); // software certificates
        e.i32(0); // locale ids
        let mut token = Encoder::default();
        token.string(Some(anonymous_policy_id));
        e.type_id(ANONYMOUS_IDENTITY_TOKEN).u8(0x01).bytes(Some(&token.buf));
        e.string(None).bytes(None); // user token signature
        let body = self.call(e).await?;

        let mut d = Decoder::new(&body);
        expect_type(&mut d, ACTIVATE_SESSION_RESPONSE)?;
        d.response_header()
    }

    /// Read the Value attribute of each node. Entries are `None` when the
    /// server reports a Bad status for that node.
    pub async fn read_values(&mut self, nodes: &[NodeId]) -> Result<Vec<Option<Value>>, ProtocolError> {
        let mut e = self.begin(READ_REQUEST);
        e.f64(0.0); // max age
        e.u32(3); // timestamps to return: neither
        e.i32(nodes.len() as i32);
        for node in nodes {
            e.node_id(node).u32(ATTRIBUTE_VALUE).string(None).u16(0).string(None);
        }
        let values = decode_read(&self.call(e).await?)?;
        if values.len() != nodes.len() {
            return Err(ProtocolError::Malformed(format!(
                "read returned {} values for {} nodes",
                values.len(),
                nodes.len()
            )));
        }
        Ok(values)
    }

    pub async fn read_build_info(&mut self) -> Result<BuildInfo, ProtocolError> {
        let nodes: Vec<NodeId> = BUILD_INFO_NODES.iter().map(|id| NodeId::numeric(0, *id)).collect();
        let mut values = self.read_values(&nodes).await?.into_iter().map(|v| match v {
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s),
            _ => None,
        });
        Ok(BuildInfo {
            product_uri: values.next().flatten(),
            manufacturer_name: values.next().flatten(),
            product_name: values.next().flatten(),
            software_version: values.next().flatten(),
            build_number: values.next().flatten(),
        })
    }

    /// Close the session (if any) and the secure channel. Best effort.
    pub async fn close(mut self) {
        if self.auth_token != NodeId::null() {
            let mut e = self.begin(CLOSE_SESSION_REQUEST);
            e.u8(1); // delete subscriptions
            let _ = self.stream.write_all(&frame(b"MSG", &e.buf)).await;
            let _ = read_message(&mut self.stream).await;
        }
        self.sequence = self.sequence.wrapping_add(1);
        self.request_id = self.request_id.wrapping_add(1);
        let mut e = Encoder::default();
        e.u32(self.channel.channel_id).u32(self.channel.token_id).u32(self.sequence).u32(self.request_id);
        e.type_id(CLOSE_SECURE_CHANNEL_REQUEST);
        e.request_header(&self.auth_token, self.request_id, 0);
        let _ = self.stream.write_all(&frame(b"CLO", &e.buf)).await;
    }
}

/// Anonymous policy id to use: the first unsecured endpoint offering one.
pub fn pick_anonymous_policy(endpoints: &[EndpointDescription]) -> String {
    endpoints
        .iter()
        .filter(|ep| ep.security_policy_uri.as_deref() == Some(SECURITY_POLICY_NONE))
        .find_map(|ep| ep.anonymous_policy_id.clone())
        .unwrap_or_else(|| "anonymous".to_string())
}

/// Connect to `addr` and run the identification handshake under `timeout`:
/// GetEndpoints, then an anonymous session reading BuildInfo.
///
/// Fails only when the transport handshake fails.
pub async fn discover_endpoints(addr: &str, endpoint_url: &str, timeout: Duration) -> Result<DiscoveryResult, ProtocolError> {
    let run = async {
        let mut client = match OpcuaClient::connect(addr, endpoint_url, timeout).await? {
            Ok(client) => client,
            Err((ack, e)) => {
                return Ok(DiscoveryResult { ack, endpoints: Vec::new(), build_info: None, error: Some(e.to_string()) })
            }
        };
        let ack = client.ack;

        let endpoints = match client.get_endpoints().await {
            Ok(endpoints) => endpoints,
            Err(e) => {
                client.close().await;
                return Ok(DiscoveryResult { ack, endpoints: Vec::new(), build_info: None, error: Some(e.to_string()) });
            }
        };

        let policy = pick_anonymous_policy(&endpoints);
        let session = async {
            client.open_session(&policy).await?;
            client.read_build_info().await
        }
        .await;
        client.close().await;

        let (build_info, error) = match session {
            Ok(info) => (Some(info), None),
            Err(e) => (None, Some(e.to_string())),
        };
        Ok::<DiscoveryResult, ProtocolError>(DiscoveryResult { ack, endpoints, build_info, error })
    };
    tokio::time::timeout(timeout, run).await.map_err(|_| ProtocolError::Timeout)?
}
