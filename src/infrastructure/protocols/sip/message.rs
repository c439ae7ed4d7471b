//! SIP message types and parsing

use bytes::Bytes;
use rsip::prelude::{HeadersExt, UntypedHeader};
use rsip::{Header, Headers, Method, Request, Response, Uri};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SipError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Transport error: {0}")]
    TransportError(String),
}

impl From<rsip::Error> for SipError {
    fn from(err: rsip::Error) -> Self {
        SipError::ParseError(err.to_string())
    }
}

/// SIP method types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Cancel,
    Bye,
    Options,
    Info,
    Update,
    Prack,
    Subscribe,
    Notify,
    Refer,
    Message,
    Publish,
}

impl SipMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Bye => "BYE",
            SipMethod::Options => "OPTIONS",
            SipMethod::Info => "INFO",
            SipMethod::Update => "UPDATE",
            SipMethod::Prack => "PRACK",
            SipMethod::Subscribe => "SUBSCRIBE",
            SipMethod::Notify => "NOTIFY",
            SipMethod::Refer => "REFER",
            SipMethod::Message => "MESSAGE",
            SipMethod::Publish => "PUBLISH",
        }
    }

    pub fn from_rsip(method: &Method) -> Option<Self> {
        match method {
            Method::Register => Some(SipMethod::Register),
            Method::Invite => Some(SipMethod::Invite),
            Method::Ack => Some(SipMethod::Ack),
            Method::Cancel => Some(SipMethod::Cancel),
            Method::Bye => Some(SipMethod::Bye),
            Method::Options => Some(SipMethod::Options),
            Method::Info => Some(SipMethod::Info),
            Method::Update => Some(SipMethod::Update),
            Method::PRack => Some(SipMethod::Prack),
            Method::Subscribe => Some(SipMethod::Subscribe),
            Method::Notify => Some(SipMethod::Notify),
            Method::Refer => Some(SipMethod::Refer),
            Method::Message => Some(SipMethod::Message),
            Method::Publish => Some(SipMethod::Publish),
        }
    }

    pub fn to_rsip(&self) -> Method {
        match self {
            SipMethod::Register => Method::Register,
            SipMethod::Invite => Method::Invite,
            SipMethod::Ack => Method::Ack,
            SipMethod::Cancel => Method::Cancel,
            SipMethod::Bye => Method::Bye,
            SipMethod::Options => Method::Options,
            SipMethod::Info => Method::Info,
            SipMethod::Update => Method::Update,
            SipMethod::Prack => Method::PRack,
            SipMethod::Subscribe => Method::Subscribe,
            SipMethod::Notify => Method::Notify,
            SipMethod::Refer => Method::Refer,
            SipMethod::Message => Method::Message,
            SipMethod::Publish => Method::Publish,
        }
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// SIP Request wrapper
#[derive(Debug, Clone)]
pub struct SipRequest {
    pub inner: Request,
}

impl SipRequest {
    pub fn new(inner: Request) -> Self {
        Self { inner }
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let request = rsip::Request::try_from(data)?;
        Ok(Self::new(request))
    }

    pub fn method(&self) -> Option<SipMethod> {
        SipMethod::from_rsip(&self.inner.method)
    }

    pub fn uri(&self) -> &Uri {
        &self.inner.uri
    }

    pub fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.inner.body
    }

    pub fn call_id(&self) -> Option<String> {
        self.inner
            .call_id_header()
            .ok()
            .map(|header| header.value().to_string())
    }

    pub fn cseq(&self) -> Option<u32> {
        self.inner
            .cseq_header()
            .ok()
            .and_then(|header| header.seq().ok())
    }

    /// Value of an arbitrary header by name, case-insensitively.
    ///
    /// Extension headers may surface as typed or untyped variants depending
    /// on how they were parsed, so this scans the rendered form instead of
    /// matching variants.
    pub fn header_value(&self, name: &str) -> Option<String> {
        let rendered = self.inner.headers.to_string();
        for line in rendered.lines() {
            if let Some((header, value)) = line.split_once(':') {
                if header.trim().eq_ignore_ascii_case(name) {
                    return Some(value.trim().to_string());
                }
            }
        }
        None
    }

    pub fn refer_to(&self) -> Option<String> {
        self.header_value("Refer-To")
    }

    pub fn refer_sub(&self) -> Option<String> {
        self.header_value("Refer-Sub")
    }

    pub fn referred_by(&self) -> Option<String> {
        self.header_value("Referred-By")
    }

    /// Append an extension header.
    pub fn push_header(&mut self, name: &str, value: &str) {
        self.inner
            .headers
            .push(Header::Other(name.to_string(), value.to_string()).into());
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.inner.to_string())
    }
}

/// SIP Response wrapper
#[derive(Debug, Clone)]
pub struct SipResponse {
    pub inner: Response,
}

impl SipResponse {
    pub fn new(inner: Response) -> Self {
        Self { inner }
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let response = rsip::Response::try_from(data)?;
        Ok(Self::new(response))
    }

    pub fn status_code(&self) -> u16 {
        self.inner.status_code.clone().into()
    }

    pub fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    /// Value of an arbitrary header by name, case-insensitively.
    pub fn header_value(&self, name: &str) -> Option<String> {
        let rendered = self.inner.headers.to_string();
        for line in rendered.lines() {
            if let Some((header, value)) = line.split_once(':') {
                if header.trim().eq_ignore_ascii_case(name) {
                    return Some(value.trim().to_string());
                }
            }
        }
        None
    }

    pub fn body(&self) -> &[u8] {
        &self.inner.body
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.inner.to_string())
    }
}

/// Reference to an existing dialog carried in a Replaces directive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplacesRef {
    pub call_id: String,
    pub to_tag: String,
    pub from_tag: String,
}

/// Target parsed out of a Refer-To header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferTarget {
    pub user: String,
    pub host: String,
    pub replaces: Option<ReplacesRef>,
}

/// Parse a Refer-To header value into its target URI parts and any
/// embedded Replaces directive.
pub fn parse_refer_target(value: &str) -> Result<ReferTarget, SipError> {
    // Strip any display name by taking the URI inside angle brackets
    let uri = match (value.find('<'), value.find('>')) {
        (Some(start), Some(end)) if start < end => &value[start + 1..end],
        (None, None) => value.trim(),
        _ => return Err(SipError::ParseError(format!("Unbalanced brackets in '{}'", value))),
    };

    let rest = uri
        .strip_prefix("sip:")
        .or_else(|| uri.strip_prefix("sips:"))
        .ok_or_else(|| SipError::ParseError(format!("Not a SIP URI: '{}'", uri)))?;

    // Split off embedded headers before reading user and host
    let (core, headers) = match rest.split_once('?') {
        Some((core, headers)) => (core, Some(headers)),
        None => (rest, None),
    };

    let (user, host_part) = core
        .split_once('@')
        .ok_or_else(|| SipError::ParseError(format!("No user part in '{}'", uri)))?;
    if user.is_empty() {
        return Err(SipError::ParseError(format!("Empty user part in '{}'", uri)));
    }
    let host = host_part
        .split(|c| c == ';' || c == '>')
        .next()
        .unwrap_or(host_part)
        .to_string();

    // Replaces may appear as an embedded header or as a URI parameter
    let mut replaces = None;
    if let Some(headers) = headers {
        for header in headers.split('&') {
            if let Some((name, value)) = header.split_once('=') {
                if name.eq_ignore_ascii_case("Replaces") {
                    replaces = Some(parse_replaces(&percent_decode(value))?);
                }
            }
        }
    }
    if replaces.is_none() {
        for param in host_part.split(';').skip(1) {
            if let Some((name, value)) = param.split_once('=') {
                if name.eq_ignore_ascii_case("replaces") {
                    replaces = Some(parse_replaces(&percent_decode(value))?);
                }
            }
        }
    }

    Ok(ReferTarget {
        user: percent_decode(user),
        host,
        replaces,
    })
}

/// Parse a Replaces value of the form `call-id;to-tag=x;from-tag=y`.
pub fn parse_replaces(value: &str) -> Result<ReplacesRef, SipError> {
    let mut parts = value.split(';');
    let call_id = parts
        .next()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| SipError::ParseError("Replaces without Call-ID".to_string()))?;

    let mut to_tag = None;
    let mut from_tag = None;
    for part in parts {
        if let Some((name, tag)) = part.split_once('=') {
            match name.trim().to_ascii_lowercase().as_str() {
                "to-tag" => to_tag = Some(tag.trim().to_string()),
                "from-tag" => from_tag = Some(tag.trim().to_string()),
                _ => {}
            }
        }
    }

    match (to_tag, from_tag) {
        (Some(to_tag), Some(from_tag)) => Ok(ReplacesRef {
            call_id: call_id.to_string(),
            to_tag,
            from_tag,
        }),
        _ => Err(SipError::ParseError(format!(
            "Replaces '{}' is missing a tag parameter",
            value
        ))),
    }
}

/// Decode %XX escapes, leaving malformed escapes untouched.
pub fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(byte) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
