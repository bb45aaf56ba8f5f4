//! Low-level LDAP Protocol Functions
//!
//! BER primitives plus the LDAP v3 message codec (RFC 4511 Section 4). Requests
//! are decoded into [`crate::models::LdapMessage`]; responses are encoded straight
//! to bytes ready for the transport.
//!
//! # BER Encoding
//! - Tags are single octets; multi-octet tag numbers are not used by LDAP
//! - Lengths are definite: short form (< 128) or long form with up to 4 length octets
//! - INTEGER and ENUMERATED values use the minimal two's complement form
//!
//! # Decode errors
//! A frame whose BER structure cannot be trusted is [`DecodeError::Malformed`] and
//! ends the connection. A well-formed message asking for something this server
//! rejects is [`DecodeError::Unsupported`] and gets an ordinary result code.

use thiserror::Error;
use tracing::debug;

use crate::filter::{Assertion, Filter, SubstringsAssertion};
use crate::models::{
    AddRequest, BindAuthentication, BindRequest, CompareRequest, Control, DerefAliases, Entry,
    ExtendedRequest, LdapMessage, Modification, ModifyDnRequest, ModifyOperation, ModifyRequest,
    Request, Scope, SearchRequest,
};
use crate::result::ResultCode;

/// Universal and LDAP application tags
pub mod tag {
    pub const BOOLEAN: u8 = 0x01;
    pub const INTEGER: u8 = 0x02;
    pub const OCTET_STRING: u8 = 0x04;
    pub const ENUMERATED: u8 = 0x0a;
    pub const SEQUENCE: u8 = 0x30;
    pub const SET: u8 = 0x31;

    pub const BIND_REQUEST: u8 = 0x60;
    pub const BIND_RESPONSE: u8 = 0x61;
    pub const UNBIND_REQUEST: u8 = 0x42;
    pub const SEARCH_REQUEST: u8 = 0x63;
    pub const SEARCH_RESULT_ENTRY: u8 = 0x64;
    pub const SEARCH_RESULT_DONE: u8 = 0x65;
    pub const MODIFY_REQUEST: u8 = 0x66;
    pub const MODIFY_RESPONSE: u8 = 0x67;
    pub const ADD_REQUEST: u8 = 0x68;
    pub const ADD_RESPONSE: u8 = 0x69;
    pub const DEL_REQUEST: u8 = 0x4a;
    pub const DEL_RESPONSE: u8 = 0x6b;
    pub const MODIFY_DN_REQUEST: u8 = 0x6c;
    pub const MODIFY_DN_RESPONSE: u8 = 0x6d;
    pub const COMPARE_REQUEST: u8 = 0x6e;
    pub const COMPARE_RESPONSE: u8 = 0x6f;
    pub const ABANDON_REQUEST: u8 = 0x50;
    pub const EXTENDED_REQUEST: u8 = 0x77;
    pub const EXTENDED_RESPONSE: u8 = 0x78;

    pub const CONTROLS: u8 = 0xa0;

    pub const FILTER_AND: u8 = 0xa0;
    pub const FILTER_OR: u8 = 0xa1;
    pub const FILTER_NOT: u8 = 0xa2;
    pub const FILTER_EQUALITY: u8 = 0xa3;
    pub const FILTER_SUBSTRINGS: u8 = 0xa4;
    pub const FILTER_GE: u8 = 0xa5;
    pub const FILTER_LE: u8 = 0xa6;
    pub const FILTER_PRESENT: u8 = 0x87;
    pub const FILTER_APPROX: u8 = 0xa8;
    pub const FILTER_EXTENSIBLE: u8 = 0xa9;
}

/// Notice of Disconnection unsolicited notification (RFC 4511 Section 4.4.1)
pub const NOTICE_OF_DISCONNECTION_OID: &str = "1.3.6.1.4.1.1466.20036";

/// Deepest filter nesting accepted from a client
pub const MAX_FILTER_DEPTH: usize = 64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BerError {
    #[error("Truncated BER element")]
    Truncated,

    #[error("Indefinite length encoding is not allowed")]
    IndefiniteLength,

    #[error("Length field of {0} octets is too large")]
    LengthTooLarge(usize),

    #[error("Multi-octet tags are not supported")]
    MultiOctetTag,

    #[error("Expected tag 0x{expected:02x}, found 0x{found:02x}")]
    UnexpectedTag { expected: u8, found: u8 },

    #[error("Invalid INTEGER encoding")]
    InvalidInteger,

    #[error("Invalid BOOLEAN encoding")]
    InvalidBoolean,

    #[error("LDAPString is not valid UTF-8")]
    InvalidUtf8,

    #[error("Trailing bytes after element")]
    TrailingData,
}

/// Response envelope matching a request, used to reject it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseOp {
    Bind,
    SearchDone,
    Modify,
    Add,
    Delete,
    ModifyDn,
    Compare,
    Extended,
}

impl ResponseOp {
    pub fn tag(self) -> u8 {
        match self {
            ResponseOp::Bind => tag::BIND_RESPONSE,
            ResponseOp::SearchDone => tag::SEARCH_RESULT_DONE,
            ResponseOp::Modify => tag::MODIFY_RESPONSE,
            ResponseOp::Add => tag::ADD_RESPONSE,
            ResponseOp::Delete => tag::DEL_RESPONSE,
            ResponseOp::ModifyDn => tag::MODIFY_DN_RESPONSE,
            ResponseOp::Compare => tag::COMPARE_RESPONSE,
            ResponseOp::Extended => tag::EXTENDED_RESPONSE,
        }
    }

    /// The response a request gets, `None` for unbind and abandon
    pub fn for_request(request: &Request) -> Option<Self> {
        match request {
            Request::Bind(_) => Some(ResponseOp::Bind),
            Request::Search(_) => Some(ResponseOp::SearchDone),
            Request::Modify(_) => Some(ResponseOp::Modify),
            Request::Add(_) => Some(ResponseOp::Add),
            Request::Delete(_) => Some(ResponseOp::Delete),
            Request::ModifyDn(_) => Some(ResponseOp::ModifyDn),
            Request::Compare(_) => Some(ResponseOp::Compare),
            Request::Extended(_) => Some(ResponseOp::Extended),
            Request::Unbind | Request::Abandon(_) => None,
        }
    }

    fn for_request_tag(request_tag: u8) -> Option<Self> {
        match request_tag {
            tag::BIND_REQUEST => Some(ResponseOp::Bind),
            tag::SEARCH_REQUEST => Some(ResponseOp::SearchDone),
            tag::MODIFY_REQUEST => Some(ResponseOp::Modify),
            tag::ADD_REQUEST => Some(ResponseOp::Add),
            tag::DEL_REQUEST => Some(ResponseOp::Delete),
            tag::MODIFY_DN_REQUEST => Some(ResponseOp::ModifyDn),
            tag::COMPARE_REQUEST => Some(ResponseOp::Compare),
            tag::EXTENDED_REQUEST => Some(ResponseOp::Extended),
            _ => None,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The byte stream can no longer be trusted; the connection must close
    #[error("Malformed LDAP message: {0}")]
    Malformed(String),

    /// A sound message that is answered with `code` instead of being dispatched
    #[error("Rejected message {message_id}: {reason}")]
    Unsupported {
        message_id: u32,
        response: ResponseOp,
        code: ResultCode,
        reason: String,
    },
}

impl From<BerError> for DecodeError {
    fn from(err: BerError) -> Self {
        DecodeError::Malformed(err.to_string())
    }
}

/// Failure while decoding one protocolOp, before the message id is attached
enum OpError {
    Ber(BerError),
    Rejected(ResultCode, String),
}

impl From<BerError> for OpError {
    fn from(err: BerError) -> Self {
        OpError::Ber(err)
    }
}

fn reject<T>(code: ResultCode, reason: impl Into<String>) -> std::result::Result<T, OpError> {
    Err(OpError::Rejected(code, reason.into()))
}

/// A decoded tag/value pair borrowed from the input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tlv<'a> {
    pub tag: u8,
    pub value: &'a [u8],
}

/// Sequential reader over the contents of a constructed BER element
#[derive(Debug, Clone)]
pub struct BerReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BerReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn peek_tag(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    pub fn read_tlv(&mut self) -> std::result::Result<Tlv<'a>, BerError> {
        let rest = &self.data[self.pos..];
        let (&tag, after) = rest.split_first().ok_or(BerError::Truncated)?;
        if tag & 0x1f == 0x1f {
            return Err(BerError::MultiOctetTag);
        }
        let (len, consumed) = parse_ber_length(after)?.ok_or(BerError::Truncated)?;
        let start = 1 + consumed;
        let end = start.checked_add(len).ok_or(BerError::Truncated)?;
        if end > rest.len() {
            return Err(BerError::Truncated);
        }
        self.pos += end;
        Ok(Tlv {
            tag,
            value: &rest[start..end],
        })
    }

    /// Reads the next element, which must carry `expected`
    pub fn expect(&mut self, expected: u8) -> std::result::Result<&'a [u8], BerError> {
        let tlv = self.read_tlv()?;
        if tlv.tag != expected {
            return Err(BerError::UnexpectedTag {
                expected,
                found: tlv.tag,
            });
        }
        Ok(tlv.value)
    }

    /// Reads the next element only if it carries `expected`
    pub fn optional(&mut self, expected: u8) -> std::result::Result<Option<&'a [u8]>, BerError> {
        if self.peek_tag() == Some(expected) {
            self.expect(expected).map(Some)
        } else {
            Ok(None)
        }
    }

    pub fn read_integer(&mut self, expected: u8) -> std::result::Result<i64, BerError> {
        decode_integer(self.expect(expected)?)
    }

    pub fn read_boolean(&mut self) -> std::result::Result<bool, BerError> {
        let value = self.expect(tag::BOOLEAN)?;
        match value {
            [b] => Ok(*b != 0),
            _ => Err(BerError::InvalidBoolean),
        }
    }

    pub fn read_string(&mut self, expected: u8) -> std::result::Result<String, BerError> {
        decode_string(self.expect(expected)?)
    }

    pub fn finish(&self) -> std::result::Result<(), BerError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(BerError::TrailingData)
        }
    }
}

/// Parses a BER length field
///
/// Returns `Ok(None)` when `input` does not yet hold the whole field, otherwise
/// the value length and the number of octets the field occupies.
pub fn parse_ber_length(input: &[u8]) -> std::result::Result<Option<(usize, usize)>, BerError> {
    let Some(&first) = input.first() else {
        return Ok(None);
    };
    if first < 0x80 {
        return Ok(Some((first as usize, 1)));
    }
    if first == 0x80 {
        return Err(BerError::IndefiniteLength);
    }
    let octets = (first & 0x7f) as usize;
    if octets > 4 {
        return Err(BerError::LengthTooLarge(octets));
    }
    if input.len() < 1 + octets {
        return Ok(None);
    }
    let len = input[1..=octets]
        .iter()
        .fold(0usize, |acc, &b| (acc << 8) | b as usize);
    Ok(Some((len, 1 + octets)))
}

/// Size of the first complete LDAPMessage in `buf`
///
/// `Ok(None)` means more bytes are needed. A message announcing more than
/// `max_size` bytes is malformed before any of its body is buffered.
pub fn frame_length(buf: &[u8], max_size: usize) -> std::result::Result<Option<usize>, DecodeError> {
    let Some(&first) = buf.first() else {
        return Ok(None);
    };
    if first != tag::SEQUENCE {
        return Err(DecodeError::Malformed(format!(
            "Expected LDAPMessage SEQUENCE, found tag 0x{:02x}",
            first
        )));
    }
    let Some((len, consumed)) = parse_ber_length(&buf[1..])? else {
        return Ok(None);
    };
    let total = 1 + consumed + len;
    if total > max_size {
        return Err(DecodeError::Malformed(format!(
            "Message of {} bytes exceeds the {} byte limit",
            total, max_size
        )));
    }
    if buf.len() < total {
        return Ok(None);
    }
    Ok(Some(total))
}

fn decode_integer(bytes: &[u8]) -> std::result::Result<i64, BerError> {
    if bytes.is_empty() || bytes.len() > 8 {
        return Err(BerError::InvalidInteger);
    }
    let init: i64 = if bytes[0] & 0x80 != 0 { -1 } else { 0 };
    Ok(bytes.iter().fold(init, |acc, &b| (acc << 8) | b as i64))
}

fn decode_string(bytes: &[u8]) -> std::result::Result<String, BerError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| BerError::InvalidUtf8)
}

/// Decodes one complete LDAPMessage frame
pub fn decode_message(frame: &[u8]) -> std::result::Result<LdapMessage, DecodeError> {
    let mut outer = BerReader::new(frame);
    let body = outer.expect(tag::SEQUENCE)?;
    outer.finish()?;

    let mut reader = BerReader::new(body);
    let id = reader.read_integer(tag::INTEGER)?;
    let message_id = u32::try_from(id)
        .ok()
        .filter(|id| *id <= i32::MAX as u32)
        .ok_or_else(|| DecodeError::Malformed(format!("Message ID {} out of range", id)))?;

    let op = reader.read_tlv()?;
    let controls = match reader.optional(tag::CONTROLS)? {
        Some(value) => decode_controls(value)?,
        None => Vec::new(),
    };
    reader.finish()?;

    let request = match decode_request(op) {
        Ok(request) => request,
        // the envelope is sound, only the operation is refused
        Err(OpError::Ber(BerError::InvalidUtf8)) => {
            return Err(DecodeError::Unsupported {
                message_id,
                response: ResponseOp::for_request_tag(op.tag).unwrap_or(ResponseOp::Extended),
                code: ResultCode::ProtocolError,
                reason: BerError::InvalidUtf8.to_string(),
            });
        }
        Err(OpError::Ber(err)) => return Err(err.into()),
        Err(OpError::Rejected(code, reason)) => {
            // unknown application tags are answered with an ExtendedResponse
            let response =
                ResponseOp::for_request_tag(op.tag).unwrap_or(ResponseOp::Extended);
            return Err(DecodeError::Unsupported {
                message_id,
                response,
                code,
                reason,
            });
        }
    };

    if let Some(response) = ResponseOp::for_request(&request) {
        if let Some(control) = controls.iter().find(|c| c.critical) {
            return Err(DecodeError::Unsupported {
                message_id,
                response,
                code: ResultCode::UnavailableCriticalExtension,
                reason: format!("Critical control {} is not supported", control.oid),
            });
        }
    }

    debug!(
        "Decoded {} request: message_id={}, controls={}",
        request.name(),
        message_id,
        controls.len()
    );

    Ok(LdapMessage {
        message_id,
        op: request,
        controls,
    })
}

fn decode_controls(value: &[u8]) -> std::result::Result<Vec<Control>, BerError> {
    let mut reader = BerReader::new(value);
    let mut controls = Vec::new();
    while !reader.is_empty() {
        let mut control = BerReader::new(reader.expect(tag::SEQUENCE)?);
        let oid = control.read_string(tag::OCTET_STRING)?;
        let critical = if control.peek_tag() == Some(tag::BOOLEAN) {
            control.read_boolean()?
        } else {
            false
        };
        let value = control.optional(tag::OCTET_STRING)?.map(<[u8]>::to_vec);
        control.finish()?;
        controls.push(Control {
            oid,
            critical,
            value,
        });
    }
    Ok(controls)
}

fn decode_request(op: Tlv<'_>) -> std::result::Result<Request, OpError> {
    match op.tag {
        tag::BIND_REQUEST => decode_bind(op.value),
        tag::UNBIND_REQUEST => Ok(Request::Unbind),
        tag::SEARCH_REQUEST => decode_search(op.value),
        tag::MODIFY_REQUEST => decode_modify(op.value),
        tag::ADD_REQUEST => decode_add(op.value),
        tag::DEL_REQUEST => Ok(Request::Delete(decode_string(op.value)?)),
        tag::MODIFY_DN_REQUEST => decode_modify_dn(op.value),
        tag::COMPARE_REQUEST => decode_compare(op.value),
        tag::ABANDON_REQUEST => {
            let id = decode_integer(op.value)?;
            let id = u32::try_from(id)
                .or_else(|_| reject(ResultCode::ProtocolError, "Invalid abandon message ID"))?;
            Ok(Request::Abandon(id))
        }
        tag::EXTENDED_REQUEST => decode_extended(op.value),
        other => reject(
            ResultCode::ProtocolError,
            format!("Unsupported operation tag 0x{:02x}", other),
        ),
    }
}

fn decode_bind(value: &[u8]) -> std::result::Result<Request, OpError> {
    let mut reader = BerReader::new(value);
    let version = reader.read_integer(tag::INTEGER)?;
    let version = u8::try_from(version)
        .or_else(|_| reject(ResultCode::ProtocolError, "Invalid LDAP version"))?;
    let name = reader.read_string(tag::OCTET_STRING)?;
    let auth = reader.read_tlv()?;
    let authentication = match auth.tag {
        0x80 => BindAuthentication::Simple(auth.value.to_vec()),
        0xa3 => {
            let mut sasl = BerReader::new(auth.value);
            let mechanism = sasl.read_string(tag::OCTET_STRING)?;
            let credentials = sasl.optional(tag::OCTET_STRING)?.map(<[u8]>::to_vec);
            sasl.finish()?;
            BindAuthentication::Sasl {
                mechanism,
                credentials,
            }
        }
        other => {
            return reject(
                ResultCode::AuthMethodNotSupported,
                format!("Unsupported authentication choice 0x{:02x}", other),
            )
        }
    };
    reader.finish()?;
    Ok(Request::Bind(BindRequest {
        version,
        name,
        authentication,
    }))
}

fn decode_search(value: &[u8]) -> std::result::Result<Request, OpError> {
    let mut reader = BerReader::new(value);
    let base = reader.read_string(tag::OCTET_STRING)?;
    let scope = reader.read_integer(tag::ENUMERATED)?;
    let scope = match Scope::from_code(scope) {
        Some(scope) => scope,
        None => return reject(ResultCode::ProtocolError, format!("Invalid scope {}", scope)),
    };
    let deref = reader.read_integer(tag::ENUMERATED)?;
    let deref = match DerefAliases::from_code(deref) {
        Some(deref) => deref,
        None => {
            return reject(
                ResultCode::ProtocolError,
                format!("Invalid derefAliases {}", deref),
            )
        }
    };
    let size_limit = decode_limit(reader.read_integer(tag::INTEGER)?, "sizeLimit")?;
    let time_limit = decode_limit(reader.read_integer(tag::INTEGER)?, "timeLimit")?;
    let types_only = reader.read_boolean()?;
    let filter = decode_filter(reader.read_tlv()?, 0)?;

    let mut attributes = Vec::new();
    let mut list = BerReader::new(reader.expect(tag::SEQUENCE)?);
    while !list.is_empty() {
        attributes.push(list.read_string(tag::OCTET_STRING)?);
    }
    reader.finish()?;

    Ok(Request::Search(SearchRequest {
        base,
        scope,
        deref,
        size_limit,
        time_limit,
        types_only,
        filter,
        attributes,
    }))
}

fn decode_limit(value: i64, name: &str) -> std::result::Result<u32, OpError> {
    match u32::try_from(value) {
        Ok(limit) if limit <= i32::MAX as u32 => Ok(limit),
        _ => reject(ResultCode::ProtocolError, format!("Invalid {} {}", name, value)),
    }
}

fn decode_filter(tlv: Tlv<'_>, depth: usize) -> std::result::Result<Filter, OpError> {
    if depth >= MAX_FILTER_DEPTH {
        return reject(ResultCode::ProtocolError, "Filter nesting too deep");
    }
    match tlv.tag {
        tag::FILTER_AND | tag::FILTER_OR => {
            let mut reader = BerReader::new(tlv.value);
            let mut children = Vec::new();
            while !reader.is_empty() {
                children.push(decode_filter(reader.read_tlv()?, depth + 1)?);
            }
            Ok(if tlv.tag == tag::FILTER_AND {
                Filter::And(children)
            } else {
                Filter::Or(children)
            })
        }
        tag::FILTER_NOT => {
            let mut reader = BerReader::new(tlv.value);
            let child = decode_filter(reader.read_tlv()?, depth + 1)?;
            if !reader.is_empty() {
                return reject(ResultCode::ProtocolError, "NOT filter takes one child");
            }
            Ok(Filter::not(child))
        }
        tag::FILTER_EQUALITY | tag::FILTER_APPROX => {
            Ok(Filter::Equality(decode_assertion(tlv.value)?))
        }
        tag::FILTER_GE => Ok(Filter::GreaterOrEqual(decode_assertion(tlv.value)?)),
        tag::FILTER_LE => Ok(Filter::LessOrEqual(decode_assertion(tlv.value)?)),
        tag::FILTER_SUBSTRINGS => decode_substrings(tlv.value),
        tag::FILTER_PRESENT => Ok(Filter::Present(decode_string(tlv.value)?)),
        tag::FILTER_EXTENSIBLE => decode_extensible(tlv.value),
        other => Ok(Filter::Unknown(format!("0x{:02x}", other))),
    }
}

fn decode_assertion(value: &[u8]) -> std::result::Result<Assertion, OpError> {
    let mut reader = BerReader::new(value);
    let attribute = reader.read_string(tag::OCTET_STRING)?;
    let value = reader.read_string(tag::OCTET_STRING)?;
    reader.finish()?;
    Ok(Assertion::new(attribute, value))
}

fn decode_substrings(value: &[u8]) -> std::result::Result<Filter, OpError> {
    let mut reader = BerReader::new(value);
    let mut assertion = SubstringsAssertion::new(reader.read_string(tag::OCTET_STRING)?);
    let mut segments = BerReader::new(reader.expect(tag::SEQUENCE)?);
    reader.finish()?;

    let mut count = 0;
    while !segments.is_empty() {
        let segment = segments.read_tlv()?;
        let text = decode_string(segment.value)?;
        match segment.tag {
            0x80 if count == 0 => assertion.initial = Some(text),
            0x81 if assertion.final_.is_none() => assertion.any.push(text),
            0x82 if assertion.final_.is_none() => assertion.final_ = Some(text),
            other => {
                return reject(
                    ResultCode::ProtocolError,
                    format!("Substring choice 0x{:02x} out of order", other),
                )
            }
        }
        count += 1;
    }
    if count == 0 {
        return reject(ResultCode::ProtocolError, "Empty substrings filter");
    }
    Ok(Filter::Substrings(assertion))
}

/// extensibleMatch: the rule and attribute are both optional (RFC 4511 Section 4.5.1.7.7)
fn decode_extensible(value: &[u8]) -> std::result::Result<Filter, OpError> {
    let mut reader = BerReader::new(value);
    let rule = reader.optional(0x81)?.map(decode_string).transpose()?;
    let attribute = reader.optional(0x82)?.map(decode_string).transpose()?;
    let assertion_value = decode_string(reader.expect(0x83)?)?;
    if let Some(dn_attributes) = reader.optional(0x84)? {
        if dn_attributes.len() != 1 {
            return Err(BerError::InvalidBoolean.into());
        }
    }
    reader.finish()?;

    match attribute {
        Some(attribute) => Ok(Filter::Equality(Assertion {
            attribute,
            rule,
            value: assertion_value,
        })),
        None if rule.is_some() => Ok(Filter::Undefined),
        None => reject(
            ResultCode::ProtocolError,
            "extensibleMatch needs a matching rule or an attribute",
        ),
    }
}

fn decode_attribute_values(value: &[u8]) -> std::result::Result<(String, Vec<String>), BerError> {
    let mut reader = BerReader::new(value);
    let attribute = reader.read_string(tag::OCTET_STRING)?;
    let mut set = BerReader::new(reader.expect(tag::SET)?);
    reader.finish()?;
    let mut values = Vec::new();
    while !set.is_empty() {
        values.push(set.read_string(tag::OCTET_STRING)?);
    }
    Ok((attribute, values))
}

fn decode_modify(value: &[u8]) -> std::result::Result<Request, OpError> {
    let mut reader = BerReader::new(value);
    let dn = reader.read_string(tag::OCTET_STRING)?;
    let mut list = BerReader::new(reader.expect(tag::SEQUENCE)?);
    reader.finish()?;

    let mut changes = Vec::new();
    while !list.is_empty() {
        let mut change = BerReader::new(list.expect(tag::SEQUENCE)?);
        let operation = match change.read_integer(tag::ENUMERATED)? {
            0 => ModifyOperation::Add,
            1 => ModifyOperation::Delete,
            2 => ModifyOperation::Replace,
            other => {
                return reject(
                    ResultCode::ProtocolError,
                    format!("Invalid modify operation {}", other),
                )
            }
        };
        let (attribute, values) = decode_attribute_values(change.expect(tag::SEQUENCE)?)?;
        change.finish()?;
        changes.push(Modification {
            operation,
            attribute,
            values,
        });
    }
    Ok(Request::Modify(ModifyRequest { dn, changes }))
}

fn decode_add(value: &[u8]) -> std::result::Result<Request, OpError> {
    let mut reader = BerReader::new(value);
    let mut entry = Entry::new(reader.read_string(tag::OCTET_STRING)?);
    let mut list = BerReader::new(reader.expect(tag::SEQUENCE)?);
    reader.finish()?;

    while !list.is_empty() {
        let (attribute, values) = decode_attribute_values(list.expect(tag::SEQUENCE)?)?;
        entry.attributes.entry(attribute).or_default().extend(values);
    }
    Ok(Request::Add(AddRequest { entry }))
}

fn decode_modify_dn(value: &[u8]) -> std::result::Result<Request, OpError> {
    let mut reader = BerReader::new(value);
    let dn = reader.read_string(tag::OCTET_STRING)?;
    let new_rdn = reader.read_string(tag::OCTET_STRING)?;
    let delete_old_rdn = reader.read_boolean()?;
    let new_superior = reader.optional(0x80)?.map(decode_string).transpose()?;
    reader.finish()?;
    Ok(Request::ModifyDn(ModifyDnRequest {
        dn,
        new_rdn,
        delete_old_rdn,
        new_superior,
    }))
}

fn decode_compare(value: &[u8]) -> std::result::Result<Request, OpError> {
    let mut reader = BerReader::new(value);
    let dn = reader.read_string(tag::OCTET_STRING)?;
    let assertion = decode_assertion(reader.expect(tag::SEQUENCE)?)?;
    reader.finish()?;
    Ok(Request::Compare(CompareRequest {
        dn,
        attribute: assertion.attribute,
        value: assertion.value,
    }))
}

fn decode_extended(value: &[u8]) -> std::result::Result<Request, OpError> {
    let mut reader = BerReader::new(value);
    let name = reader.read_string(0x80)?;
    let value = reader.optional(0x81)?.map(<[u8]>::to_vec);
    reader.finish()?;
    Ok(Request::Extended(ExtendedRequest { name, value }))
}

/// Encodes length in BER format
///
/// # BER Length Encoding Rules
/// - Short form (0-127): Single byte with the length value
/// - Long form (128+): First byte = 0x80 + number of length bytes, followed by length bytes
///
/// # Examples
/// ```
/// use ldap_server_rs::ldap_lib::encode_ber_length;
///
/// assert_eq!(encode_ber_length(10), vec![0x0a]);        // Short form
/// assert_eq!(encode_ber_length(200), vec![0x81, 0xc8]); // Long form (1 byte)
/// assert_eq!(encode_ber_length(300), vec![0x82, 0x01, 0x2c]); // Long form (2 bytes)
/// ```
pub fn encode_ber_length(len: usize) -> Vec<u8> {
    if len < 128 {
        vec![len as u8]
    } else if len < 0x100 {
        vec![0x81, len as u8]
    } else if len < 0x1_0000 {
        vec![0x82, (len >> 8) as u8, len as u8]
    } else if len < 0x100_0000 {
        vec![0x83, (len >> 16) as u8, (len >> 8) as u8, len as u8]
    } else {
        vec![
            0x84,
            (len >> 24) as u8,
            (len >> 16) as u8,
            (len >> 8) as u8,
            len as u8,
        ]
    }
}

pub fn encode_tlv(tag: u8, value: &[u8]) -> Vec<u8> {
    let length = encode_ber_length(value.len());
    let mut out = Vec::with_capacity(1 + length.len() + value.len());
    out.push(tag);
    out.extend_from_slice(&length);
    out.extend_from_slice(value);
    out
}

/// Encodes an INTEGER or ENUMERATED in minimal two's complement form
pub fn encode_integer(tag: u8, value: i64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < bytes.len() - 1 {
        let redundant = (bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
            || (bytes[start] == 0xff && bytes[start + 1] & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    encode_tlv(tag, &bytes[start..])
}

pub fn encode_octet_string(value: &[u8]) -> Vec<u8> {
    encode_tlv(tag::OCTET_STRING, value)
}

pub fn encode_boolean(value: bool) -> Vec<u8> {
    encode_tlv(tag::BOOLEAN, &[if value { 0xff } else { 0x00 }])
}

/// Wraps a protocolOp into an LDAPMessage envelope
pub fn encode_message(message_id: u32, protocol_op: &[u8]) -> Vec<u8> {
    let mut body = encode_integer(tag::INTEGER, message_id as i64);
    body.extend_from_slice(protocol_op);
    encode_tlv(tag::SEQUENCE, &body)
}

fn encode_result_components(code: ResultCode, matched_dn: &str, diagnostic: &str) -> Vec<u8> {
    let mut body = encode_integer(tag::ENUMERATED, code.code() as i64);
    body.extend_from_slice(&encode_octet_string(matched_dn.as_bytes()));
    body.extend_from_slice(&encode_octet_string(diagnostic.as_bytes()));
    body
}

/// Creates an LDAPResult-shaped response (RFC 4511 Section 4.1.9)
///
/// # Structure
/// ```text
/// LDAPResult ::= SEQUENCE {
///     resultCode         ENUMERATED,
///     matchedDN          LDAPDN,
///     diagnosticMessage  LDAPString,
///     referral           [3] Referral OPTIONAL }
/// ```
pub fn encode_ldap_result(
    message_id: u32,
    op: ResponseOp,
    code: ResultCode,
    matched_dn: &str,
    diagnostic: &str,
) -> Vec<u8> {
    let body = encode_result_components(code, matched_dn, diagnostic);
    let response = encode_message(message_id, &encode_tlv(op.tag(), &body));

    debug!(
        "Created {:?} response: message_id={}, result_code={}, size={} bytes",
        op,
        message_id,
        code.code(),
        response.len()
    );

    response
}

/// Creates an ExtendedResponse (RFC 4511 Section 4.12)
///
/// # Structure
/// ```text
/// ExtendedResponse ::= [APPLICATION 24] SEQUENCE {
///     COMPONENTS OF LDAPResult,
///     responseName     [10] LDAPOID OPTIONAL,
///     responseValue    [11] OCTET STRING OPTIONAL }
/// ```
pub fn encode_extended_response(
    message_id: u32,
    code: ResultCode,
    diagnostic: &str,
    name: Option<&str>,
    value: Option<&[u8]>,
) -> Vec<u8> {
    let mut body = encode_result_components(code, "", diagnostic);
    if let Some(name) = name {
        body.extend_from_slice(&encode_tlv(0x8a, name.as_bytes()));
    }
    if let Some(value) = value {
        body.extend_from_slice(&encode_tlv(0x8b, value));
    }
    let response = encode_message(message_id, &encode_tlv(tag::EXTENDED_RESPONSE, &body));

    debug!(
        "Created extended response: message_id={}, result_code={}, name={:?}, size={} bytes",
        message_id,
        code.code(),
        name,
        response.len()
    );

    response
}

/// Unsolicited notification sent right before the server drops a connection
pub fn encode_notice_of_disconnection(code: ResultCode, diagnostic: &str) -> Vec<u8> {
    encode_extended_response(0, code, diagnostic, Some(NOTICE_OF_DISCONNECTION_OID), None)
}

fn encode_partial_attribute(attr_type: &str, values: &[String], types_only: bool) -> Vec<u8> {
    let mut content = encode_octet_string(attr_type.as_bytes());

    let mut set_content = Vec::new();
    if !types_only {
        for value in values {
            set_content.extend_from_slice(&encode_octet_string(value.as_bytes()));
        }
    }
    content.extend_from_slice(&encode_tlv(tag::SET, &set_content));

    encode_tlv(tag::SEQUENCE, &content)
}

/// Creates a SearchResultEntry (RFC 4511 Section 4.5.2)
///
/// # Structure
/// ```text
/// SearchResultEntry ::= [APPLICATION 4] SEQUENCE {
///     objectName      LDAPDN,
///     attributes      PartialAttributeList
/// }
/// ```
///
/// With `types_only` every attribute is sent with an empty value set.
pub fn encode_search_entry(message_id: u32, entry: &Entry, types_only: bool) -> Vec<u8> {
    let mut attributes = Vec::new();
    for (name, values) in &entry.attributes {
        attributes.extend_from_slice(&encode_partial_attribute(name, values, types_only));
    }

    let mut content = encode_octet_string(entry.dn.as_bytes());
    content.extend_from_slice(&encode_tlv(tag::SEQUENCE, &attributes));

    let response = encode_message(message_id, &encode_tlv(tag::SEARCH_RESULT_ENTRY, &content));

    debug!(
        "Created search entry response: message_id={}, dn={}, attributes={}, size={} bytes",
        message_id,
        entry.dn,
        entry.attributes.len(),
        response.len()
    );

    response
}
