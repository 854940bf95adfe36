// LDAP v3 message decode/encode over a BER (X.690) subset.
// Response framing is byte-compatible with what AD-oriented clients expect.

use anyhow::{bail, Context, Result};

// [APPLICATION n] protocol op tags as they appear on the wire.
pub const TAG_BIND_REQUEST: u8 = 0x60;
pub const TAG_BIND_RESPONSE: u8 = 0x61;
pub const TAG_UNBIND_REQUEST: u8 = 0x42;
pub const TAG_SEARCH_REQUEST: u8 = 0x63;
pub const TAG_SEARCH_RESULT_ENTRY: u8 = 0x64;
pub const TAG_SEARCH_RESULT_DONE: u8 = 0x65;
pub const TAG_DEL_REQUEST: u8 = 0x4A;
pub const TAG_DEL_RESPONSE: u8 = 0x6B;

const TAG_SEQUENCE: u8 = 0x30;
const TAG_SET: u8 = 0x31;

/// One LDAP message: `SEQUENCE { messageID, protocolOp }`.
///
/// The messageID is kept as the first raw content byte of the BER integer;
/// clients in scope never exceed one byte.
#[derive(Debug, Clone)]
pub struct LdapMessage {
    pub message_id: u8,
    pub protocol_op: ProtocolOp,
}

#[derive(Debug, Clone)]
pub enum ProtocolOp {
    BindRequest(BindRequest),
    BindResponse(LdapResult),
    UnbindRequest,
    SearchRequest(SearchRequest),
    SearchResultEntry(SearchResultEntry),
    SearchResultDone(LdapResult),
    DelRequest(DelRequest),
    DelResponse(LdapResult),
    /// Any other application tag. Kept so the session can log it and move on.
    Unsupported(u8),
}

impl ProtocolOp {
    /// Short name for log lines.
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolOp::BindRequest(_) => "bind request",
            ProtocolOp::BindResponse(_) => "bind response",
            ProtocolOp::UnbindRequest => "unbind request",
            ProtocolOp::SearchRequest(_) => "search request",
            ProtocolOp::SearchResultEntry(_) => "search result entry",
            ProtocolOp::SearchResultDone(_) => "search result done",
            ProtocolOp::DelRequest(_) => "delete request",
            ProtocolOp::DelResponse(_) => "delete response",
            ProtocolOp::Unsupported(_) => "unsupported",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BindRequest {
    pub version: u8,
    pub name: String,
    pub password: Vec<u8>,
}

/// Shared body of BindResponse, SearchResultDone and DelResponse:
/// `{ ENUMERATED resultCode, LDAPDN matchedDN, LDAPString diagnosticMessage }`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapResult {
    pub result_code: u8,
    pub matched_dn: String,
    pub diagnostic_message: String,
}

impl LdapResult {
    pub fn new(result_code: u8, diagnostic_message: &str) -> Self {
        Self {
            result_code,
            matched_dn: String::new(),
            diagnostic_message: diagnostic_message.to_string(),
        }
    }

    pub fn success() -> Self {
        Self::new(0, "")
    }
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub base_object: String,
    pub scope: u8,
    pub deref_aliases: u8,
    pub size_limit: i32,
    pub time_limit: i32,
    pub types_only: bool,
    pub filter: Filter,
    pub attributes: Vec<String>,
}

/// Search filter subset. Equality attribute and value are lowercased at parse
/// time; all matching downstream is case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// No filter supplied (or an empty value): accept everything.
    Absent,
    Equality { attribute: String, value: String },
    And(Vec<Filter>),
    Or(Vec<Filter>),
    /// A structure this subset does not interpret; evaluation degrades to
    /// pass-through.
    Unsupported(u8),
}

#[derive(Debug, Clone)]
pub struct SearchResultEntry {
    pub object_name: String,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone)]
pub struct Attribute {
    pub attr_type: String,
    pub attr_values: Vec<String>,
}

impl Attribute {
    pub fn new(attr_type: &str, attr_values: Vec<String>) -> Self {
        Self {
            attr_type: attr_type.to_string(),
            attr_values,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DelRequest {
    pub dn: String,
}

// --- BER reader ---

pub struct BerReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BerReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn read_tag(&mut self) -> Result<u8> {
        let byte = *self
            .data
            .get(self.pos)
            .context("BER truncated: missing tag byte")?;
        self.pos += 1;
        Ok(byte)
    }

    /// Definite length, short or long form. Long form is capped at 4 length
    /// bytes; the indefinite form is rejected.
    pub fn read_length(&mut self) -> Result<usize> {
        let first = self.read_tag().context("BER truncated: missing length")?;
        if first & 0x80 == 0 {
            return Ok(first as usize);
        }
        let count = (first & 0x7F) as usize;
        if count == 0 {
            bail!("Indefinite length not supported");
        }
        if count > 4 {
            bail!("Length too large: {} length bytes", count);
        }
        let bytes = self.read_slice(count)?;
        let mut length = 0usize;
        for &b in bytes {
            length = (length << 8) | b as usize;
        }
        Ok(length)
    }

    pub fn read_slice(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            bail!(
                "BER truncated: need {} bytes, {} remaining",
                n,
                self.remaining()
            );
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Raw content bytes of a universal INTEGER.
    pub fn read_integer_bytes(&mut self) -> Result<&'a [u8]> {
        let tag = self.read_tag()?;
        if tag & 0x1F != 0x02 {
            bail!("Expected INTEGER tag (0x02), got 0x{:02X}", tag);
        }
        let length = self.read_length()?;
        if length == 0 || length > 4 {
            bail!("Unsupported integer length: {} bytes", length);
        }
        self.read_slice(length)
    }

    pub fn read_integer(&mut self) -> Result<i32> {
        let bytes = self.read_integer_bytes()?;
        let mut value = if bytes[0] & 0x80 != 0 { -1i32 } else { 0 };
        for &b in bytes {
            value = (value << 8) | b as i32;
        }
        Ok(value)
    }

    pub fn read_enumerated(&mut self) -> Result<u8> {
        let tag = self.read_tag()?;
        if tag & 0x1F != 0x0A {
            bail!("Expected ENUMERATED tag (0x0A), got 0x{:02X}", tag);
        }
        let length = self.read_length()?;
        if length != 1 {
            bail!("Enumerated value must be 1 byte, got {}", length);
        }
        Ok(self.read_slice(1)?[0])
    }

    pub fn read_boolean(&mut self) -> Result<bool> {
        let tag = self.read_tag()?;
        if tag & 0x1F != 0x01 {
            bail!("Expected BOOLEAN tag (0x01), got 0x{:02X}", tag);
        }
        let length = self.read_length()?;
        if length != 1 {
            bail!("Boolean value must be 1 byte, got {}", length);
        }
        Ok(self.read_slice(1)?[0] != 0)
    }

    pub fn read_octet_string(&mut self) -> Result<&'a [u8]> {
        let tag = self.read_tag()?;
        if tag & 0x1F != 0x04 {
            bail!("Expected OCTET STRING tag (0x04), got 0x{:02X}", tag);
        }
        self.read_octet_string_value()
    }

    /// Length + content with the tag already consumed. Used where the choice
    /// tag varies between clients (e.g. the bind authentication element).
    pub fn read_octet_string_value(&mut self) -> Result<&'a [u8]> {
        let length = self.read_length()?;
        self.read_slice(length)
    }

    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_octet_string()?;
        String::from_utf8(bytes.to_vec()).context("Invalid UTF-8 string")
    }

    pub fn read_sequence(&mut self) -> Result<usize> {
        let tag = self.read_tag()?;
        if tag & 0x1F != 0x10 {
            bail!("Expected SEQUENCE tag (0x30), got 0x{:02X}", tag);
        }
        self.read_length()
    }
}

// --- BER writer ---

#[derive(Default)]
pub struct BerWriter {
    buf: Vec<u8>,
}

impl BerWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a constructed TLV: tag plus a one-byte length placeholder.
    /// Close with `end_constructed`, which back-patches the length.
    pub fn begin_constructed(&mut self, tag: u8) -> usize {
        self.buf.push(tag);
        self.buf.push(0);
        self.buf.len() - 1
    }

    pub fn end_constructed(&mut self, len_pos: usize) {
        let content_len = self.buf.len() - (len_pos + 1);
        if content_len < 128 {
            self.buf[len_pos] = content_len as u8;
            return;
        }
        let mut len_bytes = Vec::new();
        let mut len = content_len;
        while len > 0 {
            len_bytes.push((len & 0xFF) as u8);
            len >>= 8;
        }
        len_bytes.reverse();
        self.buf[len_pos] = 0x80 | len_bytes.len() as u8;
        for (i, b) in len_bytes.into_iter().enumerate() {
            self.buf.insert(len_pos + 1 + i, b);
        }
    }

    pub fn begin_sequence(&mut self) -> usize {
        self.begin_constructed(TAG_SEQUENCE)
    }

    pub fn begin_set(&mut self) -> usize {
        self.begin_constructed(TAG_SET)
    }

    fn write_length(&mut self, length: usize) {
        if length < 128 {
            self.buf.push(length as u8);
            return;
        }
        let mut len_bytes = Vec::new();
        let mut len = length;
        while len > 0 {
            len_bytes.push((len & 0xFF) as u8);
            len >>= 8;
        }
        len_bytes.reverse();
        self.buf.push(0x80 | len_bytes.len() as u8);
        self.buf.extend_from_slice(&len_bytes);
    }

    /// Minimal-length two's-complement INTEGER.
    pub fn write_integer(&mut self, value: i32) {
        let bytes = value.to_be_bytes();
        let mut start = 0;
        while start < 3 {
            let redundant = (bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
                || (bytes[start] == 0xFF && bytes[start + 1] & 0x80 != 0);
            if !redundant {
                break;
            }
            start += 1;
        }
        self.buf.push(0x02);
        self.write_length(4 - start);
        self.buf.extend_from_slice(&bytes[start..]);
    }

    pub fn write_enumerated(&mut self, value: u8) {
        self.buf.push(0x0A);
        self.write_length(1);
        self.buf.push(value);
    }

    pub fn write_boolean(&mut self, value: bool) {
        self.buf.push(0x01);
        self.write_length(1);
        self.buf.push(if value { 0xFF } else { 0x00 });
    }

    pub fn write_octet_string(&mut self, data: &[u8]) {
        self.write_primitive(0x04, data);
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_octet_string(s.as_bytes());
    }

    /// Primitive TLV with an arbitrary tag (context-specific choices,
    /// UnbindRequest, DelRequest).
    pub fn write_primitive(&mut self, tag: u8, content: &[u8]) {
        self.buf.push(tag);
        self.write_length(content.len());
        self.buf.extend_from_slice(content);
    }

    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

// --- decode ---

/// Parse one complete LDAP message frame.
pub fn parse_ldap_message(data: &[u8]) -> Result<LdapMessage> {
    let mut reader = BerReader::new(data);
    let _msg_len = reader.read_sequence()?;

    let id_bytes = reader.read_integer_bytes()?;
    let message_id = id_bytes[0];

    let tag = reader.read_tag()?;
    let op_len = reader.read_length()?;
    let content = reader.read_slice(op_len)?;

    let protocol_op = match tag {
        TAG_BIND_REQUEST => ProtocolOp::BindRequest(parse_bind_request(content)?),
        TAG_UNBIND_REQUEST => ProtocolOp::UnbindRequest,
        TAG_SEARCH_REQUEST => ProtocolOp::SearchRequest(parse_search_request(content)?),
        TAG_DEL_REQUEST => ProtocolOp::DelRequest(DelRequest {
            dn: String::from_utf8_lossy(content).to_string(),
        }),
        other => ProtocolOp::Unsupported(other),
    };

    if reader.remaining() > 0 {
        bail!(
            "Unexpected trailing element after protocol op ({} bytes)",
            reader.remaining()
        );
    }

    Ok(LdapMessage {
        message_id,
        protocol_op,
    })
}

/// `BindRequest ::= [APPLICATION 0] SEQUENCE { version, name, authentication }`.
/// The authentication choice is treated as a simple bind whatever its tag;
/// the password is its raw content (clients disagree on the tag here).
fn parse_bind_request(content: &[u8]) -> Result<BindRequest> {
    let mut reader = BerReader::new(content);
    let version_bytes = reader.read_integer_bytes()?;
    let version = version_bytes[0];
    let name = reader.read_string()?;
    let _auth_tag = reader.read_tag()?;
    let password = reader.read_octet_string_value()?.to_vec();
    if reader.remaining() > 0 {
        bail!("Bind request has unexpected trailing elements");
    }
    Ok(BindRequest {
        version,
        name,
        password,
    })
}

/// `SearchRequest ::= [APPLICATION 3] SEQUENCE { baseObject, scope,
/// derefAliases, sizeLimit, timeLimit, typesOnly, filter, attributes }`.
/// The six leading fields are required; filter and attributes may be absent.
fn parse_search_request(content: &[u8]) -> Result<SearchRequest> {
    let mut reader = BerReader::new(content);
    let base_object = reader.read_string()?;
    let scope = reader.read_enumerated()?;
    let deref_aliases = reader.read_enumerated()?;
    let size_limit = reader.read_integer()?;
    let time_limit = reader.read_integer()?;
    let types_only = reader.read_boolean()?;

    let filter = if reader.remaining() > 0 {
        parse_filter(&mut reader)?
    } else {
        Filter::Absent
    };

    let mut attributes = Vec::new();
    if reader.remaining() > 0 {
        let _tag = reader.read_tag()?;
        let len = reader.read_length()?;
        let mut attrs = BerReader::new(reader.read_slice(len)?);
        while attrs.remaining() > 0 {
            attributes.push(attrs.read_string()?);
        }
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

/// Filter CHOICE subset: and [0], or [1], equalityMatch [3]. Anything else
/// is carried as `Unsupported` so evaluation can degrade to pass-through
/// instead of rejecting the search.
fn parse_filter(reader: &mut BerReader) -> Result<Filter> {
    let tag = reader.read_tag()?;
    let len = reader.read_length()?;
    let content = reader.read_slice(len)?;
    Ok(parse_filter_content(tag, content))
}

fn parse_filter_content(tag: u8, content: &[u8]) -> Filter {
    match tag {
        0xA0 | 0xA1 => {
            let mut sub = BerReader::new(content);
            let mut children = Vec::new();
            while sub.remaining() > 0 {
                match parse_filter(&mut sub) {
                    Ok(child) => children.push(child),
                    Err(_) => return Filter::Unsupported(tag),
                }
            }
            if tag == 0xA0 {
                Filter::And(children)
            } else {
                Filter::Or(children)
            }
        }
        0xA3 => {
            let mut sub = BerReader::new(content);
            match (sub.read_string(), sub.read_string()) {
                (Ok(attribute), Ok(value)) => Filter::Equality {
                    attribute: attribute.to_lowercase(),
                    value: value.to_lowercase(),
                },
                _ => Filter::Unsupported(tag),
            }
        }
        _ if content.is_empty() => Filter::Absent,
        other => Filter::Unsupported(other),
    }
}

// --- encode ---

/// Encode a response message. Request ops are never encoded by the server.
pub fn encode_ldap_message(message: &LdapMessage) -> Result<Vec<u8>> {
    let mut writer = BerWriter::new();
    let msg = writer.begin_sequence();
    writer.write_integer(message.message_id as i32);

    match &message.protocol_op {
        ProtocolOp::BindResponse(result) => {
            encode_result(&mut writer, TAG_BIND_RESPONSE, result);
        }
        ProtocolOp::SearchResultDone(result) => {
            encode_result(&mut writer, TAG_SEARCH_RESULT_DONE, result);
        }
        ProtocolOp::DelResponse(result) => {
            encode_result(&mut writer, TAG_DEL_RESPONSE, result);
        }
        ProtocolOp::SearchResultEntry(entry) => {
            encode_search_result_entry(&mut writer, entry);
        }
        other => bail!("Cannot encode operation type: {}", other.name()),
    }

    writer.end_constructed(msg);
    Ok(writer.into_bytes())
}

fn encode_result(writer: &mut BerWriter, tag: u8, result: &LdapResult) {
    let op = writer.begin_constructed(tag);
    writer.write_enumerated(result.result_code);
    writer.write_string(&result.matched_dn);
    writer.write_string(&result.diagnostic_message);
    writer.end_constructed(op);
}

fn encode_search_result_entry(writer: &mut BerWriter, entry: &SearchResultEntry) {
    let op = writer.begin_constructed(TAG_SEARCH_RESULT_ENTRY);
    writer.write_string(&entry.object_name);
    let attrs = writer.begin_sequence();
    for attribute in &entry.attributes {
        let attr = writer.begin_sequence();
        writer.write_string(&attribute.attr_type);
        let values = writer.begin_set();
        for value in &attribute.attr_values {
            writer.write_string(value);
        }
        writer.end_constructed(values);
        writer.end_constructed(attr);
    }
    writer.end_constructed(attrs);
    writer.end_constructed(op);
}
