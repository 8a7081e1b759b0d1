// LDAP protocol handling with BER encoding/decoding
// Decodes the requests the gateway understands (BIND, SEARCH, ABANDON, UNBIND)
// and encodes the responses it sends back.

use crate::filter::{CompoundKind, FilterOperator, LdapFilter, SimpleFilter, SubstringMode};
use anyhow::{bail, Context, Result};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::io::{Cursor, Read};

// Application tags
pub const LDAP_TAG_BIND_REQUEST: u8 = 0x60;
pub const LDAP_TAG_BIND_RESPONSE: u8 = 0x61;
pub const LDAP_TAG_UNBIND_REQUEST: u8 = 0x42;
pub const LDAP_TAG_SEARCH_REQUEST: u8 = 0x63;
pub const LDAP_TAG_SEARCH_RESULT_ENTRY: u8 = 0x64;
pub const LDAP_TAG_SEARCH_RESULT_DONE: u8 = 0x65;
pub const LDAP_TAG_ABANDON_REQUEST: u8 = 0x50;

// Universal tags
const BER_TAG_BOOLEAN: u8 = 0x01;
const BER_TAG_INTEGER: u8 = 0x02;
const BER_TAG_OCTET_STRING: u8 = 0x04;
const BER_TAG_ENUMERATED: u8 = 0x0A;
const BER_TAG_SEQUENCE: u8 = 0x30;
const BER_TAG_SET: u8 = 0x31;

// Context tags inside BIND
const TAG_AUTH_SIMPLE: u8 = 0x80;
const TAG_AUTH_SASL: u8 = 0xA3;
pub const TAG_SERVER_SASL_CREDENTIALS: u8 = 0x87;

// Filter choices
pub const FILTER_AND: u8 = 0xA0;
pub const FILTER_OR: u8 = 0xA1;
pub const FILTER_NOT: u8 = 0xA2;
pub const FILTER_EQUALITY: u8 = 0xA3;
pub const FILTER_SUBSTRINGS: u8 = 0xA4;
pub const FILTER_GREATER_OR_EQUAL: u8 = 0xA5;
pub const FILTER_LESS_OR_EQUAL: u8 = 0xA6;
pub const FILTER_PRESENT: u8 = 0x87;
pub const FILTER_APPROX: u8 = 0xA8;
pub const FILTER_EXTENSIBLE: u8 = 0xA9;

const SUBSTRING_INITIAL: u8 = 0x80;
const SUBSTRING_ANY: u8 = 0x81;
const SUBSTRING_FINAL: u8 = 0x82;

// Result codes
pub const LDAP_SUCCESS: i32 = 0;
pub const LDAP_PROTOCOL_ERROR: i32 = 2;
pub const LDAP_TIME_LIMIT_EXCEEDED: i32 = 3;
pub const LDAP_SIZE_LIMIT_EXCEEDED: i32 = 4;
pub const LDAP_AUTH_METHOD_NOT_SUPPORTED: i32 = 7;
pub const LDAP_SASL_BIND_IN_PROGRESS: i32 = 14;
pub const LDAP_INVALID_CREDENTIALS: i32 = 49;
pub const LDAP_OTHER: i32 = 80;

/// Upper bound for a single framed request. Address book clients send tiny
/// messages; anything larger is treated as garbage.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

const MAX_FILTER_DEPTH: usize = 32;

/// Negotiated protocol version. Decides how strings travel on the wire:
/// LDAPv3 uses UTF-8, LDAPv2 uses ISO-8859-1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LdapVersion {
    V2,
    #[default]
    V3,
}

impl LdapVersion {
    pub fn from_wire(version: i32) -> Self {
        if version == 2 {
            LdapVersion::V2
        } else {
            LdapVersion::V3
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            LdapVersion::V2 => 2,
            LdapVersion::V3 => 3,
        }
    }

    /// Characters outside Latin-1 are replaced by `?` in LDAPv2.
    pub fn encode_string(self, s: &str) -> Cow<'_, [u8]> {
        match self {
            LdapVersion::V3 => Cow::Borrowed(s.as_bytes()),
            LdapVersion::V2 => Cow::Owned(
                s.chars()
                    .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
                    .collect(),
            ),
        }
    }

    pub fn decode_string(self, bytes: &[u8]) -> Result<String> {
        match self {
            LdapVersion::V3 => {
                String::from_utf8(bytes.to_vec()).context("Invalid UTF-8 in LDAP string")
            }
            LdapVersion::V2 => Ok(bytes.iter().map(|&b| char::from(b)).collect()),
        }
    }
}

/// Value of one attribute in a search result entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
    Single(String),
    Multiple(Vec<String>),
}

impl AttributeValue {
    pub fn values(&self) -> &[String] {
        match self {
            AttributeValue::Single(value) => std::slice::from_ref(value),
            AttributeValue::Multiple(values) => values,
        }
    }

    pub fn first(&self) -> Option<&str> {
        self.values().first().map(String::as_str)
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::Single(value)
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::Single(value.to_string())
    }
}

impl From<Vec<String>> for AttributeValue {
    fn from(values: Vec<String>) -> Self {
        AttributeValue::Multiple(values)
    }
}

/// Attributes of one entry, keyed by LDAP attribute name.
pub type EntryAttributes = BTreeMap<String, AttributeValue>;

// LDAP Message structure
#[derive(Debug, Clone)]
pub struct LdapMessage {
    pub message_id: i32,
    pub protocol_op: ProtocolOp,
}

#[derive(Debug, Clone)]
pub enum ProtocolOp {
    BindRequest(BindRequest),
    SearchRequest(SearchRequest),
    AbandonRequest(i32),
    UnbindRequest,
    /// Any other application tag; answered with a generic error.
    Unsupported(u8),
}

#[derive(Debug, Clone)]
pub struct BindRequest {
    pub version: i32,
    pub name: String,
    pub authentication: BindAuthentication,
}

#[derive(Debug, Clone)]
pub enum BindAuthentication {
    Simple(String),
    Sasl {
        mechanism: String,
        credentials: Option<Vec<u8>>,
    },
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub base_object: String,
    pub scope: SearchScope,
    pub deref_aliases: i32,
    pub size_limit: i32,
    pub time_limit: i32,
    pub types_only: bool,
    pub filter: LdapFilter,
    /// Requested attribute names, lowercased.
    pub attributes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    BaseObject = 0,
    SingleLevel = 1,
    WholeSubtree = 2,
}

impl TryFrom<u8> for SearchScope {
    type Error = anyhow::Error;
    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(SearchScope::BaseObject),
            1 => Ok(SearchScope::SingleLevel),
            2 => Ok(SearchScope::WholeSubtree),
            _ => bail!("Invalid search scope: {}", value),
        }
    }
}

// BER parsing utilities
pub(crate) struct BerReader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> BerReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(data),
        }
    }

    fn read_tag(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.cursor
            .read_exact(&mut buf)
            .context("BER truncated: missing tag")?;
        Ok(buf[0])
    }

    fn read_length(&mut self) -> Result<usize> {
        let mut buf = [0u8; 1];
        self.cursor
            .read_exact(&mut buf)
            .context("BER truncated: missing length")?;
        let first_byte = buf[0];

        let length = if (first_byte & 0x80) == 0 {
            first_byte as usize
        } else {
            let length_bytes = (first_byte & 0x7F) as usize;
            if length_bytes == 0 {
                bail!("Indefinite length not supported");
            }
            if length_bytes > 4 {
                bail!("Length too large: {} bytes", length_bytes);
            }
            let mut length = 0usize;
            for _ in 0..length_bytes {
                self.cursor
                    .read_exact(&mut buf)
                    .context("BER truncated in long-form length")?;
                length = (length << 8) | buf[0] as usize;
            }
            length
        };
        if self.remaining() < length {
            bail!(
                "BER truncated: element needs {} bytes, {} remaining",
                length,
                self.remaining()
            );
        }
        Ok(length)
    }

    fn expect_tag(&mut self, expected: u8) -> Result<()> {
        let tag = self.read_tag()?;
        if tag != expected {
            bail!("Expected tag 0x{:02X}, got 0x{:02X}", expected, tag);
        }
        Ok(())
    }

    fn read_integer_body(&mut self, length: usize) -> Result<i32> {
        if length == 0 || length > 4 {
            bail!("Invalid integer length: {} bytes", length);
        }
        let bytes = self.read_raw_bytes(length)?;
        // sign-extend from the first octet
        let mut value: i32 = if bytes[0] & 0x80 != 0 { -1 } else { 0 };
        for byte in bytes {
            value = (value << 8) | byte as i32;
        }
        Ok(value)
    }

    fn read_integer(&mut self) -> Result<i32> {
        self.expect_tag(BER_TAG_INTEGER)?;
        let length = self.read_length()?;
        self.read_integer_body(length)
    }

    fn read_enumerated(&mut self) -> Result<i32> {
        self.expect_tag(BER_TAG_ENUMERATED)?;
        let length = self.read_length()?;
        self.read_integer_body(length)
    }

    fn read_boolean(&mut self) -> Result<bool> {
        self.expect_tag(BER_TAG_BOOLEAN)?;
        let length = self.read_length()?;
        if length != 1 {
            bail!("Invalid boolean length: {}", length);
        }
        Ok(self.read_raw_bytes(1)?[0] != 0)
    }

    fn read_octet_string(&mut self) -> Result<Vec<u8>> {
        self.expect_tag(BER_TAG_OCTET_STRING)?;
        let length = self.read_length()?;
        self.read_raw_bytes(length)
    }

    fn read_string(&mut self, version: LdapVersion) -> Result<String> {
        let bytes = self.read_octet_string()?;
        version.decode_string(&bytes)
    }

    /// Reads the header of a constructed element and returns the position
    /// right after its contents.
    fn read_constructed(&mut self, expected: u8) -> Result<usize> {
        self.expect_tag(expected)?;
        let length = self.read_length()?;
        Ok(self.position() + length)
    }

    fn position(&self) -> usize {
        self.cursor.position() as usize
    }

    fn remaining(&self) -> usize {
        let len = self.cursor.get_ref().len();
        len.saturating_sub(self.position())
    }

    fn read_raw_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        if self.remaining() < n {
            bail!(
                "BER truncated: need {} bytes, {} remaining",
                n,
                self.remaining()
            );
        }
        let mut buf = vec![0u8; n];
        self.cursor.read_exact(&mut buf)?;
        Ok(buf)
    }
}

// BER encoding utilities
#[derive(Debug, Default)]
pub struct BerWriter {
    buffer: Vec<u8>,
}

impl BerWriter {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    pub fn write_tag(&mut self, tag: u8) {
        self.buffer.push(tag);
    }

    fn write_length(&mut self, length: usize) {
        if length < 128 {
            self.buffer.push(length as u8);
        } else {
            let octets = length_octets(length);
            self.buffer.push(0x80 | octets.len() as u8);
            self.buffer.extend_from_slice(&octets);
        }
    }

    pub fn write_integer(&mut self, value: i32) {
        self.write_integer_with_tag(BER_TAG_INTEGER, value);
    }

    pub fn write_enumerated(&mut self, value: i32) {
        self.write_integer_with_tag(BER_TAG_ENUMERATED, value);
    }

    fn write_integer_with_tag(&mut self, tag: u8, value: i32) {
        let bytes = value.to_be_bytes();
        // Drop leading octets that only repeat the sign bit.
        let mut start = 0;
        while start < bytes.len() - 1 {
            let next_high_bit = bytes[start + 1] & 0x80;
            match bytes[start] {
                0x00 if next_high_bit == 0 => start += 1,
                0xFF if next_high_bit != 0 => start += 1,
                _ => break,
            }
        }
        self.write_tag(tag);
        self.write_length(bytes.len() - start);
        self.buffer.extend_from_slice(&bytes[start..]);
    }

    pub fn write_octet_string_with_tag(&mut self, tag: u8, data: &[u8]) {
        self.write_tag(tag);
        self.write_length(data.len());
        self.buffer.extend_from_slice(data);
    }

    /// Writes an LDAPString as OCTET STRING in the charset of `version`.
    pub fn write_ldap_string(&mut self, s: &str, version: LdapVersion) {
        let encoded = version.encode_string(s);
        self.write_octet_string_with_tag(BER_TAG_OCTET_STRING, &encoded);
    }

    pub fn write_boolean(&mut self, value: bool) {
        self.write_tag(BER_TAG_BOOLEAN);
        self.write_length(1);
        self.buffer.push(if value { 0xFF } else { 0x00 });
    }

    /// Opens a constructed element: writes the tag and a one-byte length
    /// placeholder. Returns the placeholder position for `end_sequence`.
    pub fn start_constructed(&mut self, tag: u8) -> usize {
        self.write_tag(tag);
        let pos = self.buffer.len();
        self.buffer.push(0x00);
        pos
    }

    pub fn start_sequence(&mut self) -> usize {
        self.start_constructed(BER_TAG_SEQUENCE)
    }

    pub fn start_set(&mut self) -> usize {
        self.start_constructed(BER_TAG_SET)
    }

    /// Closes an element opened with `start_constructed`. Elements must be
    /// closed innermost first.
    pub fn end_sequence(&mut self, length_pos: usize) {
        let content_len = self.buffer.len() - (length_pos + 1);
        if content_len < 128 {
            self.buffer[length_pos] = content_len as u8;
        } else {
            let octets = length_octets(content_len);
            self.buffer[length_pos] = 0x80 | octets.len() as u8;
            let content = self.buffer.split_off(length_pos + 1);
            self.buffer.extend_from_slice(&octets);
            self.buffer.extend_from_slice(&content);
        }
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buffer
    }
}

fn length_octets(length: usize) -> Vec<u8> {
    let bytes = (length as u64).to_be_bytes();
    let first = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len() - 1);
    bytes[first..].to_vec()
}

/// Returns the total size of the first complete LDAP message in `buffer`,
/// or `None` if more bytes are needed.
pub fn frame_length(buffer: &[u8]) -> Result<Option<usize>> {
    if buffer.len() < 2 {
        return Ok(None);
    }
    if buffer[0] != BER_TAG_SEQUENCE {
        bail!("Expected LDAP message SEQUENCE (0x30), got 0x{:02X}", buffer[0]);
    }
    let first = buffer[1];
    let (header_len, content_len) = if first & 0x80 == 0 {
        (2, first as usize)
    } else {
        let n = (first & 0x7F) as usize;
        if n == 0 || n > 4 {
            bail!("Unsupported LDAP message length encoding: 0x{:02X}", first);
        }
        if buffer.len() < 2 + n {
            return Ok(None);
        }
        let len = buffer[2..2 + n]
            .iter()
            .fold(0usize, |acc, &b| (acc << 8) | b as usize);
        (2 + n, len)
    };
    let total = header_len + content_len;
    if total > MAX_MESSAGE_SIZE {
        bail!("LDAP message too large: {} bytes", total);
    }
    if buffer.len() < total {
        return Ok(None);
    }
    Ok(Some(total))
}

/// Reads message id and operation tag without decoding the operation.
pub fn parse_ldap_message_header(data: &[u8]) -> Result<(i32, u8)> {
    let mut reader = BerReader::new(data);
    reader.read_constructed(BER_TAG_SEQUENCE)?;
    let message_id = reader.read_integer()?;
    let tag = reader.read_tag()?;
    Ok((message_id, tag))
}

/// Decodes one complete LDAP message. Strings in SEARCH requests are decoded
/// in the charset of the connection's negotiated `version`; BIND carries its
/// own version. Trailing controls are ignored.
pub fn parse_ldap_message(data: &[u8], version: LdapVersion) -> Result<LdapMessage> {
    let mut reader = BerReader::new(data);
    reader
        .read_constructed(BER_TAG_SEQUENCE)
        .context("Failed to read LDAP message envelope")?;
    let message_id = reader.read_integer().context("Failed to read message id")?;
    let tag = reader.read_tag()?;

    let protocol_op = match tag {
        LDAP_TAG_BIND_REQUEST => ProtocolOp::BindRequest(parse_bind_request(&mut reader)?),
        LDAP_TAG_SEARCH_REQUEST => {
            ProtocolOp::SearchRequest(parse_search_request(&mut reader, version)?)
        }
        LDAP_TAG_ABANDON_REQUEST => {
            let length = reader.read_length()?;
            ProtocolOp::AbandonRequest(reader.read_integer_body(length)?)
        }
        LDAP_TAG_UNBIND_REQUEST => ProtocolOp::UnbindRequest,
        other => ProtocolOp::Unsupported(other),
    };

    Ok(LdapMessage {
        message_id,
        protocol_op,
    })
}

fn parse_bind_request(reader: &mut BerReader) -> Result<BindRequest> {
    reader.read_length()?;
    let version = reader.read_integer()?;
    let wire_version = LdapVersion::from_wire(version);
    let name = reader.read_string(wire_version)?;

    let authentication = match reader.read_tag()? {
        TAG_AUTH_SIMPLE => {
            let length = reader.read_length()?;
            let password = reader.read_raw_bytes(length)?;
            BindAuthentication::Simple(wire_version.decode_string(&password)?)
        }
        TAG_AUTH_SASL => {
            let length = reader.read_length()?;
            let end = reader.position() + length;
            let mechanism = reader.read_string(wire_version)?;
            let credentials = if reader.position() < end {
                Some(reader.read_octet_string()?)
            } else {
                None
            };
            BindAuthentication::Sasl {
                mechanism,
                credentials,
            }
        }
        other => bail!("Unsupported bind authentication choice: 0x{:02X}", other),
    };

    Ok(BindRequest {
        version,
        name,
        authentication,
    })
}

fn parse_search_request(reader: &mut BerReader, version: LdapVersion) -> Result<SearchRequest> {
    reader.read_length()?;
    let base_object = reader.read_string(version)?;
    let scope_value = reader.read_enumerated()?;
    let scope = u8::try_from(scope_value)
        .map_err(anyhow::Error::from)
        .and_then(SearchScope::try_from)
        .with_context(|| format!("Invalid search scope: {}", scope_value))?;
    let deref_aliases = reader.read_enumerated()?;
    let size_limit = reader.read_integer()?;
    let time_limit = reader.read_integer()?;
    let types_only = reader.read_boolean()?;
    let filter = parse_filter(reader, version, 0)?;

    let end = reader.read_constructed(BER_TAG_SEQUENCE)?;
    let mut attributes = Vec::new();
    while reader.position() < end {
        attributes.push(reader.read_string(version)?.to_lowercase());
    }

    Ok(SearchRequest {
        base_object,
        scope,
        deref_aliases,
        size_limit,
        time_limit,
        types_only,
        filter,
        attributes,
    })
}

fn parse_filter(reader: &mut BerReader, version: LdapVersion, depth: usize) -> Result<LdapFilter> {
    if depth > MAX_FILTER_DEPTH {
        bail!("Filter nesting deeper than {}", MAX_FILTER_DEPTH);
    }
    let tag = reader.read_tag()?;
    match tag {
        FILTER_AND | FILTER_OR | FILTER_NOT => {
            let length = reader.read_length()?;
            let end = reader.position() + length;
            let kind = match tag {
                FILTER_AND => CompoundKind::And,
                FILTER_OR => CompoundKind::Or,
                _ => CompoundKind::Not,
            };
            let mut children = Vec::new();
            while reader.position() < end {
                children.push(parse_filter(reader, version, depth + 1)?);
            }
            Ok(LdapFilter::Compound { kind, children })
        }
        FILTER_PRESENT => {
            let length = reader.read_length()?;
            let attribute = version.decode_string(&reader.read_raw_bytes(length)?)?;
            Ok(LdapFilter::Simple(SimpleFilter::new(
                attribute,
                FilterOperator::Present,
                "*",
            )))
        }
        FILTER_EQUALITY | FILTER_GREATER_OR_EQUAL | FILTER_LESS_OR_EQUAL | FILTER_APPROX => {
            reader.read_length()?;
            let attribute = reader.read_string(version)?;
            let value = reader.read_string(version)?;
            let operator = if tag == FILTER_EQUALITY {
                FilterOperator::Equality
            } else {
                FilterOperator::Unsupported(tag)
            };
            Ok(LdapFilter::Simple(SimpleFilter::new(attribute, operator, value)))
        }
        FILTER_SUBSTRINGS => {
            reader.read_length()?;
            let attribute = reader.read_string(version)?;
            let end = reader.read_constructed(BER_TAG_SEQUENCE)?;
            let mut mode = SubstringMode::Initial;
            let mut value = String::new();
            while reader.position() < end {
                mode = match reader.read_tag()? {
                    SUBSTRING_INITIAL => SubstringMode::Initial,
                    SUBSTRING_ANY => SubstringMode::Any,
                    SUBSTRING_FINAL => SubstringMode::Final,
                    other => bail!("Invalid substring component: 0x{:02X}", other),
                };
                let length = reader.read_length()?;
                let part = version.decode_string(&reader.read_raw_bytes(length)?)?;
                // Thunderbird sends multiple words as separate components
                if !value.is_empty() {
                    value.push(' ');
                }
                value.push_str(&part);
            }
            Ok(LdapFilter::Simple(SimpleFilter::new(
                attribute,
                FilterOperator::Substrings(mode),
                value,
            )))
        }
        other => {
            // extensible match and unknown choices are kept as unsupported terms
            let length = reader.read_length()?;
            reader.read_raw_bytes(length)?;
            Ok(LdapFilter::Simple(SimpleFilter::new(
                "",
                FilterOperator::Unsupported(other),
                "",
            )))
        }
    }
}

/// SearchResultEntry: DN followed by SEQUENCE OF { type, SET OF values }.
pub fn encode_search_result_entry(
    message_id: i32,
    dn: &str,
    attributes: &EntryAttributes,
    version: LdapVersion,
) -> Vec<u8> {
    let mut writer = BerWriter::new();
    let message = writer.start_sequence();
    writer.write_integer(message_id);
    let op = writer.start_constructed(LDAP_TAG_SEARCH_RESULT_ENTRY);
    writer.write_ldap_string(dn, version);

    let attribute_list = writer.start_sequence();
    for (name, value) in attributes {
        let attribute = writer.start_sequence();
        writer.write_ldap_string(name, version);
        let values = writer.start_set();
        for v in value.values() {
            writer.write_ldap_string(v, version);
        }
        writer.end_sequence(values);
        writer.end_sequence(attribute);
    }
    writer.end_sequence(attribute_list);

    writer.end_sequence(op);
    writer.end_sequence(message);
    writer.into_vec()
}

/// LDAPResult wrapped in the application tag `op_tag`.
pub fn encode_ldap_result(
    message_id: i32,
    op_tag: u8,
    result_code: i32,
    diagnostic_message: &str,
    version: LdapVersion,
) -> Vec<u8> {
    let mut writer = BerWriter::new();
    let message = writer.start_sequence();
    writer.write_integer(message_id);
    let op = writer.start_constructed(op_tag);
    write_result_components(&mut writer, result_code, diagnostic_message, version);
    writer.end_sequence(op);
    writer.end_sequence(message);
    writer.into_vec()
}

/// BindResponse, optionally carrying SASL server credentials.
pub fn encode_bind_response(
    message_id: i32,
    result_code: i32,
    server_credentials: Option<&[u8]>,
    version: LdapVersion,
) -> Vec<u8> {
    let mut writer = BerWriter::new();
    let message = writer.start_sequence();
    writer.write_integer(message_id);
    let op = writer.start_constructed(LDAP_TAG_BIND_RESPONSE);
    write_result_components(&mut writer, result_code, "", version);
    if let Some(credentials) = server_credentials {
        writer.write_octet_string_with_tag(TAG_SERVER_SASL_CREDENTIALS, credentials);
    }
    writer.end_sequence(op);
    writer.end_sequence(message);
    writer.into_vec()
}

fn write_result_components(
    writer: &mut BerWriter,
    result_code: i32,
    diagnostic_message: &str,
    version: LdapVersion,
) {
    writer.write_enumerated(result_code);
    // matchedDN
    writer.write_ldap_string("", version);
    writer.write_ldap_string(diagnostic_message, version);
}

/// A response message as a client would see it. Test helper.
#[cfg(test)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DecodedResponse {
    pub message_id: i32,
    pub tag: u8,
    pub dn: String,
    pub attributes: Vec<(String, Vec<String>)>,
    pub result_code: i32,
    pub message: String,
    pub credentials: Option<Vec<u8>>,
}

#[cfg(test)]
impl DecodedResponse {
    pub fn attribute(&self, name: &str) -> Option<&[String]> {
        self.attributes
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, values)| values.as_slice())
    }
}

/// Splits and decodes every LDAPv3 response in `data`.
#[cfg(test)]
pub(crate) fn decode_responses(mut data: &[u8]) -> Vec<DecodedResponse> {
    let mut responses = Vec::new();
    while !data.is_empty() {
        let len = frame_length(data)
            .expect("valid framing")
            .expect("complete message");
        responses.push(decode_response(&data[..len]).expect("valid response"));
        data = &data[len..];
    }
    responses
}

#[cfg(test)]
fn decode_response(data: &[u8]) -> Result<DecodedResponse> {
    let v3 = LdapVersion::V3;
    let mut reader = BerReader::new(data);
    reader.read_constructed(BER_TAG_SEQUENCE)?;
    let message_id = reader.read_integer()?;
    let tag = reader.read_tag()?;
    let length = reader.read_length()?;
    let end = reader.position() + length;

    let mut response = DecodedResponse {
        message_id,
        tag,
        dn: String::new(),
        attributes: Vec::new(),
        result_code: 0,
        message: String::new(),
        credentials: None,
    };
    if tag == LDAP_TAG_SEARCH_RESULT_ENTRY {
        response.dn = reader.read_string(v3)?;
        let attributes_end = reader.read_constructed(BER_TAG_SEQUENCE)?;
        while reader.position() < attributes_end {
            reader.read_constructed(BER_TAG_SEQUENCE)?;
            let name = reader.read_string(v3)?;
            let values_end = reader.read_constructed(BER_TAG_SET)?;
            let mut values = Vec::new();
            while reader.position() < values_end {
                values.push(reader.read_string(v3)?);
            }
            response.attributes.push((name, values));
        }
    } else {
        response.result_code = reader.read_enumerated()?;
        reader.read_string(v3)?;
        response.message = reader.read_string(v3)?;
        if reader.position() < end {
            reader.expect_tag(TAG_SERVER_SASL_CREDENTIALS)?;
            let length = reader.read_length()?;
            response.credentials = Some(reader.read_raw_bytes(length)?);
        }
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn search_request_bytes(message_id: i32, base: &str, write_filter: impl FnOnce(&mut BerWriter)) -> Vec<u8> {
        let v3 = LdapVersion::V3;
        let mut writer = BerWriter::new();
        let message = writer.start_sequence();
        writer.write_integer(message_id);
        let op = writer.start_constructed(LDAP_TAG_SEARCH_REQUEST);
        writer.write_ldap_string(base, v3);
        writer.write_enumerated(2);
        writer.write_enumerated(0);
        writer.write_integer(50);
        writer.write_integer(10);
        writer.write_boolean(false);
        write_filter(&mut writer);
        let attrs = writer.start_sequence();
        writer.write_ldap_string("cn", v3);
        writer.write_ldap_string("objectClass", v3);
        writer.end_sequence(attrs);
        writer.end_sequence(op);
        writer.end_sequence(message);
        writer.into_vec()
    }

    fn write_equality(writer: &mut BerWriter, attribute: &str, value: &str) {
        let item = writer.start_constructed(FILTER_EQUALITY);
        writer.write_ldap_string(attribute, LdapVersion::V3);
        writer.write_ldap_string(value, LdapVersion::V3);
        writer.end_sequence(item);
    }

    #[test]
    fn test_search_scope_try_from() {
        assert_eq!(SearchScope::try_from(0).unwrap(), SearchScope::BaseObject);
        assert_eq!(SearchScope::try_from(1).unwrap(), SearchScope::SingleLevel);
        assert_eq!(SearchScope::try_from(2).unwrap(), SearchScope::WholeSubtree);
        assert!(SearchScope::try_from(3).is_err());
        assert!(SearchScope::try_from(255).is_err());
    }

    #[test]
    fn test_ber_writer_integer_minimal() {
        let cases: [(i32, &[u8]); 7] = [
            (0, &[0x02, 0x01, 0x00]),
            (127, &[0x02, 0x01, 0x7F]),
            (128, &[0x02, 0x02, 0x00, 0x80]),
            (256, &[0x02, 0x02, 0x01, 0x00]),
            (-1, &[0x02, 0x01, 0xFF]),
            (-128, &[0x02, 0x01, 0x80]),
            (-129, &[0x02, 0x02, 0xFF, 0x7F]),
        ];
        for (value, expected) in cases {
            let mut writer = BerWriter::new();
            writer.write_integer(value);
            assert_eq!(writer.into_vec(), expected, "value {}", value);
        }
    }

    #[test]
    fn test_ber_writer_long_length() {
        let mut writer = BerWriter::new();
        let seq = writer.start_sequence();
        for _ in 0..50 {
            writer.write_ldap_string("test", LdapVersion::V3);
        }
        writer.end_sequence(seq);
        let result = writer.into_vec();
        // 50 * 6 = 300 bytes of content -> 0x82 0x01 0x2C
        assert_eq!(&result[..4], &[0x30, 0x82, 0x01, 0x2C]);
        assert_eq!(result.len(), 4 + 300);
    }

    #[test]
    fn test_ber_writer_nested_long_length() {
        let long_value = "x".repeat(200);
        let mut writer = BerWriter::new();
        let outer = writer.start_sequence();
        let inner = writer.start_set();
        writer.write_ldap_string(&long_value, LdapVersion::V3);
        writer.end_sequence(inner);
        writer.end_sequence(outer);
        let result = writer.into_vec();
        // inner: 31 81 CB | 04 81 C8 <200>; outer content = 3 + 203 = 206
        assert_eq!(&result[..3], &[0x30, 0x81, 206]);
        assert_eq!(&result[3..6], &[0x31, 0x81, 203]);
        assert_eq!(&result[6..9], &[0x04, 0x81, 200]);
        assert_eq!(result.len(), 3 + 206);
    }

    #[test]
    fn test_version_string_encoding() {
        assert_eq!(LdapVersion::V3.encode_string("é").as_ref(), "é".as_bytes());
        assert_eq!(LdapVersion::V2.encode_string("é").as_ref(), &[0xE9]);
        assert_eq!(LdapVersion::V2.encode_string("a€").as_ref(), b"a?");
        assert_eq!(LdapVersion::V2.decode_string(&[0x4A, 0xE9]).unwrap(), "Jé");
        assert!(LdapVersion::V3.decode_string(&[0xFF]).is_err());
    }

    #[test]
    fn test_encode_ldap_result() {
        let encoded = encode_ldap_result(1, LDAP_TAG_SEARCH_RESULT_DONE, LDAP_SUCCESS, "", LdapVersion::V3);
        assert_eq!(
            encoded,
            vec![0x30, 0x0C, 0x02, 0x01, 0x01, 0x65, 0x07, 0x0A, 0x01, 0x00, 0x04, 0x00, 0x04, 0x00]
        );
    }

    #[test]
    fn test_encode_ldap_result_with_message() {
        let encoded = encode_ldap_result(7, LDAP_TAG_SEARCH_RESULT_DONE, LDAP_OTHER, "boom", LdapVersion::V3);
        assert_eq!(
            encoded,
            vec![
                0x30, 0x10, 0x02, 0x01, 0x07, 0x65, 0x0B, 0x0A, 0x01, 0x50, 0x04, 0x00, 0x04, 0x04,
                b'b', b'o', b'o', b'm'
            ]
        );
    }

    #[test]
    fn test_encode_search_result_entry() {
        let mut attributes = EntryAttributes::new();
        attributes.insert("cn".to_string(), AttributeValue::from("A"));
        let encoded = encode_search_result_entry(2, "uid=a", &attributes, LdapVersion::V3);
        assert_eq!(
            encoded,
            vec![
                0x30, 0x19, 0x02, 0x01, 0x02, 0x64, 0x14, 0x04, 0x05, b'u', b'i', b'd', b'=', b'a',
                0x30, 0x0B, 0x30, 0x09, 0x04, 0x02, b'c', b'n', 0x31, 0x03, 0x04, 0x01, b'A'
            ]
        );
    }

    #[test]
    fn test_encode_search_result_entry_multi_value_order() {
        let mut attributes = EntryAttributes::new();
        attributes.insert(
            "objectClass".to_string(),
            AttributeValue::from(vec!["top".to_string(), "person".to_string()]),
        );
        let encoded = encode_search_result_entry(3, "", &attributes, LdapVersion::V3);
        let set_pos = encoded.iter().position(|&b| b == 0x31).unwrap();
        assert_eq!(
            &encoded[set_pos..],
            &[0x31, 0x0D, 0x04, 0x03, b't', b'o', b'p', 0x04, 0x06, b'p', b'e', b'r', b's', b'o', b'n']
        );
    }

    #[test]
    fn test_encode_bind_response() {
        assert_eq!(
            encode_bind_response(1, LDAP_SUCCESS, None, LdapVersion::V3),
            vec![0x30, 0x0C, 0x02, 0x01, 0x01, 0x61, 0x07, 0x0A, 0x01, 0x00, 0x04, 0x00, 0x04, 0x00]
        );
        assert_eq!(
            encode_bind_response(1, LDAP_SASL_BIND_IN_PROGRESS, Some(&[0xAA]), LdapVersion::V3),
            vec![
                0x30, 0x0F, 0x02, 0x01, 0x01, 0x61, 0x0A, 0x0A, 0x01, 0x0E, 0x04, 0x00, 0x04, 0x00,
                0x87, 0x01, 0xAA
            ]
        );
    }

    #[test]
    fn test_frame_length() {
        let message = encode_ldap_result(1, LDAP_TAG_SEARCH_RESULT_DONE, 0, "", LdapVersion::V3);
        assert_eq!(frame_length(&message[..1]).unwrap(), None);
        assert_eq!(frame_length(&message[..5]).unwrap(), None);
        assert_eq!(frame_length(&message).unwrap(), Some(message.len()));

        let mut two = message.clone();
        two.extend_from_slice(&message);
        assert_eq!(frame_length(&two).unwrap(), Some(message.len()));

        assert!(frame_length(&[0x04, 0x00]).is_err());
    }

    #[test]
    fn test_parse_simple_bind() {
        let mut writer = BerWriter::new();
        let message = writer.start_sequence();
        writer.write_integer(1);
        let op = writer.start_constructed(LDAP_TAG_BIND_REQUEST);
        writer.write_integer(3);
        writer.write_ldap_string("jsmith", LdapVersion::V3);
        writer.write_octet_string_with_tag(TAG_AUTH_SIMPLE, b"secret");
        writer.end_sequence(op);
        writer.end_sequence(message);

        let parsed = parse_ldap_message(&writer.into_vec(), LdapVersion::V3).unwrap();
        assert_eq!(parsed.message_id, 1);
        match parsed.protocol_op {
            ProtocolOp::BindRequest(bind) => {
                assert_eq!(bind.version, 3);
                assert_eq!(bind.name, "jsmith");
                assert!(matches!(bind.authentication, BindAuthentication::Simple(ref p) if p == "secret"));
            }
            other => panic!("unexpected op: {:?}", other),
        }
    }

    #[test]
    fn test_parse_sasl_bind() {
        let mut writer = BerWriter::new();
        let message = writer.start_sequence();
        writer.write_integer(4);
        let op = writer.start_constructed(LDAP_TAG_BIND_REQUEST);
        writer.write_integer(3);
        writer.write_ldap_string("", LdapVersion::V3);
        let sasl = writer.start_constructed(TAG_AUTH_SASL);
        writer.write_ldap_string("DIGEST-MD5", LdapVersion::V3);
        writer.end_sequence(sasl);
        writer.end_sequence(op);
        writer.end_sequence(message);

        let parsed = parse_ldap_message(&writer.into_vec(), LdapVersion::V3).unwrap();
        match parsed.protocol_op {
            ProtocolOp::BindRequest(bind) => match bind.authentication {
                BindAuthentication::Sasl { mechanism, credentials } => {
                    assert_eq!(mechanism, "DIGEST-MD5");
                    assert!(credentials.is_none());
                }
                other => panic!("unexpected auth: {:?}", other),
            },
            other => panic!("unexpected op: {:?}", other),
        }
    }

    #[test]
    fn test_parse_search_request() {
        let bytes = search_request_bytes(5, "ou=people", |writer| {
            let and = writer.start_constructed(FILTER_AND);
            writer.write_octet_string_with_tag(FILTER_PRESENT, b"objectClass");
            let or = writer.start_constructed(FILTER_OR);
            write_equality(writer, "sn", "Smith");
            let substrings = writer.start_constructed(FILTER_SUBSTRINGS);
            writer.write_ldap_string("cn", LdapVersion::V3);
            let parts = writer.start_sequence();
            writer.write_octet_string_with_tag(SUBSTRING_ANY, b"john");
            writer.write_octet_string_with_tag(SUBSTRING_FINAL, b"smith");
            writer.end_sequence(parts);
            writer.end_sequence(substrings);
            writer.end_sequence(or);
            writer.end_sequence(and);
        });

        let parsed = parse_ldap_message(&bytes, LdapVersion::V3).unwrap();
        assert_eq!(parsed.message_id, 5);
        let search = match parsed.protocol_op {
            ProtocolOp::SearchRequest(search) => search,
            other => panic!("unexpected op: {:?}", other),
        };
        assert_eq!(search.base_object, "ou=people");
        assert_eq!(search.scope, SearchScope::WholeSubtree);
        assert_eq!(search.size_limit, 50);
        assert_eq!(search.time_limit, 10);
        assert!(!search.types_only);
        assert_eq!(search.attributes, vec!["cn", "objectclass"]);
        assert_eq!(
            search.filter.to_string(),
            "(&(objectclass=*)(|(sn=Smith)(cn=*john smith)))"
        );
    }

    #[test]
    fn test_parse_search_request_not_and_unsupported() {
        let bytes = search_request_bytes(6, "", |writer| {
            let not = writer.start_constructed(FILTER_NOT);
            let ge = writer.start_constructed(FILTER_GREATER_OR_EQUAL);
            writer.write_ldap_string("uidNumber", LdapVersion::V3);
            writer.write_ldap_string("1000", LdapVersion::V3);
            writer.end_sequence(ge);
            writer.end_sequence(not);
        });
        let parsed = parse_ldap_message(&bytes, LdapVersion::V3).unwrap();
        let ProtocolOp::SearchRequest(search) = parsed.protocol_op else {
            panic!("expected search request");
        };
        match search.filter {
            LdapFilter::Compound { kind, children } => {
                assert_eq!(kind, CompoundKind::Not);
                assert_eq!(children.len(), 1);
                match &children[0] {
                    LdapFilter::Simple(simple) => {
                        assert_eq!(simple.attribute, "uidnumber");
                        assert_eq!(simple.operator, FilterOperator::Unsupported(FILTER_GREATER_OR_EQUAL));
                    }
                    other => panic!("unexpected child: {:?}", other),
                }
            }
            other => panic!("unexpected filter: {:?}", other),
        }
    }

    #[test]
    fn test_parse_abandon_and_unbind() {
        // Abandon(3) with message id 9
        let abandon = [0x30, 0x06, 0x02, 0x01, 0x09, 0x50, 0x01, 0x03];
        let parsed = parse_ldap_message(&abandon, LdapVersion::V3).unwrap();
        assert_eq!(parsed.message_id, 9);
        assert!(matches!(parsed.protocol_op, ProtocolOp::AbandonRequest(3)));

        let unbind = [0x30, 0x05, 0x02, 0x01, 0x0A, 0x42, 0x00];
        let parsed = parse_ldap_message(&unbind, LdapVersion::V3).unwrap();
        assert!(matches!(parsed.protocol_op, ProtocolOp::UnbindRequest));
    }

    #[test]
    fn test_parse_unsupported_operation() {
        // DelRequest (0x4A) for "cn=x"
        let del = [0x30, 0x09, 0x02, 0x01, 0x02, 0x4A, 0x04, b'c', b'n', b'=', b'x'];
        let parsed = parse_ldap_message(&del, LdapVersion::V3).unwrap();
        assert!(matches!(parsed.protocol_op, ProtocolOp::Unsupported(0x4A)));
        assert_eq!(parse_ldap_message_header(&del).unwrap(), (2, 0x4A));
    }

    #[test]
    fn test_parse_truncated_message() {
        let bytes = search_request_bytes(5, "ou=people", |writer| {
            write_equality(writer, "mail", "a@b.com");
        });
        assert!(parse_ldap_message(&bytes[..bytes.len() - 4], LdapVersion::V3).is_err());
    }
}
