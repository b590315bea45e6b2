//! Message variants and their body layouts.
//!
//! Each variant owns its header plus the opcode-specific fields. Bodies are laid
//! out as follows (offsets start after the 16-byte header):
//!
//! ```text
//! OP_UPDATE        reserved:i32  ns:cstring  flags:i32  filter:doc  update:doc
//! OP_INSERT        flags:i32  ns:cstring  doc+
//! OP_QUERY         flags:i32  ns:cstring  skip:i32  n_return:i32  query:doc  [projection:doc]
//! OP_DELETE        reserved:i32  ns:cstring  flags:i32  filter:doc
//! OP_REPLY         flags:i32  cursor_id:i64  starting_from:i32  n_returned:i32  doc*
//! OP_COMMAND       db:cstring  name:cstring  args:doc  metadata:doc  doc*
//! OP_COMMAND_REPLY reply:doc  metadata:doc  doc*
//! OP_MSG           flags:u32  section+  [crc32c:u32]
//! ```

use crate::document::Document;
use crate::error::ProtocolError;
use crate::header::{MessageHeader, OpCode};
use crate::wire::{WireReader, WireWriter};
use bytes::{Bytes, BytesMut};

/// A decoded wire message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Query(QueryMessage),
    Insert(InsertMessage),
    Update(UpdateMessage),
    Delete(DeleteMessage),
    Reply(ReplyMessage),
    Command(CommandMessage),
    CommandReply(CommandReplyMessage),
    Msg(MsgMessage),
    /// Legacy get-more / kill-cursors, forwarded without interpretation.
    Opaque(OpaqueMessage),
}

impl Message {
    pub fn header(&self) -> &MessageHeader {
        match self {
            Message::Query(m) => &m.header,
            Message::Insert(m) => &m.header,
            Message::Update(m) => &m.header,
            Message::Delete(m) => &m.header,
            Message::Reply(m) => &m.header,
            Message::Command(m) => &m.header,
            Message::CommandReply(m) => &m.header,
            Message::Msg(m) => &m.header,
            Message::Opaque(m) => &m.header,
        }
    }

    pub fn header_mut(&mut self) -> &mut MessageHeader {
        match self {
            Message::Query(m) => &mut m.header,
            Message::Insert(m) => &mut m.header,
            Message::Update(m) => &mut m.header,
            Message::Delete(m) => &mut m.header,
            Message::Reply(m) => &mut m.header,
            Message::Command(m) => &mut m.header,
            Message::CommandReply(m) => &mut m.header,
            Message::Msg(m) => &mut m.header,
            Message::Opaque(m) => &mut m.header,
        }
    }

    pub fn op_code(&self) -> OpCode {
        self.header().op_code
    }

    /// Returns whether the peer that receives this message is expected to answer it.
    pub fn has_response(&self) -> bool {
        match self {
            Message::Query(_) | Message::Command(_) => true,
            Message::Msg(m) => !m.more_to_come(),
            Message::Opaque(m) => m.header.op_code == OpCode::GetMore,
            Message::Insert(_)
            | Message::Update(_)
            | Message::Delete(_)
            | Message::Reply(_)
            | Message::CommandReply(_) => false,
        }
    }

    /// Returns whether this is a legacy query asking the server to stream every batch.
    pub fn is_exhaust(&self) -> bool {
        matches!(self, Message::Query(q) if q.is_exhaust())
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let h = self.header();
        write!(
            f,
            "{} (id={}, to={}, size={})",
            h.op_code, h.request_id, h.response_to, h.size
        )?;
        match self {
            Message::Query(m) => write!(f, " ns={} flags={:#x}", m.namespace, m.flags),
            Message::Insert(m) => write!(f, " ns={} docs={}", m.namespace, m.documents.len()),
            Message::Update(m) => write!(f, " ns={}", m.namespace),
            Message::Delete(m) => write!(f, " ns={}", m.namespace),
            Message::Reply(m) => write!(
                f,
                " cursor={} returned={}",
                m.cursor_id, m.number_returned
            ),
            Message::Command(m) => write!(f, " db={} cmd={}", m.database, m.command_name),
            Message::CommandReply(m) => write!(f, " outputs={}", m.output_docs.len()),
            Message::Msg(m) => write!(f, " flags={:#x} sections={}", m.flags, m.sections.len()),
            Message::Opaque(m) => write!(f, " body={}B", m.body.len()),
        }
    }
}

// ---------------------------------------------------------------------------
// OP_QUERY
// ---------------------------------------------------------------------------

/// Legacy query (also carries commands against `<db>.$cmd`).
#[derive(Debug, Clone, PartialEq)]
pub struct QueryMessage {
    pub header: MessageHeader,
    pub flags: i32,
    pub namespace: String,
    pub skip: i32,
    pub n_return: i32,
    pub query: Document,
    pub projection: Option<Document>,
}

impl QueryMessage {
    pub const TAILABLE_CURSOR: i32 = 1 << 1;
    pub const SLAVE_OK: i32 = 1 << 2;
    pub const NO_CURSOR_TIMEOUT: i32 = 1 << 4;
    pub const AWAIT_DATA: i32 = 1 << 5;
    /// Stream all batches back over the same connection.
    pub const EXHAUST: i32 = 1 << 6;
    pub const PARTIAL: i32 = 1 << 7;

    pub fn new(
        request_id: i32,
        namespace: impl Into<String>,
        flags: i32,
        skip: i32,
        n_return: i32,
        query: Document,
        projection: Option<Document>,
    ) -> Self {
        Self {
            header: MessageHeader::new(request_id, 0, OpCode::Query),
            flags,
            namespace: namespace.into(),
            skip,
            n_return,
            query,
            projection,
        }
    }

    pub fn is_exhaust(&self) -> bool {
        self.flags & Self::EXHAUST != 0
    }

    pub(crate) fn decode(header: MessageHeader, body: &Bytes) -> Result<Self, ProtocolError> {
        let mut r = WireReader::new(body, OpCode::Query);
        let flags = r.read_i32("flags")?;
        let namespace = r.read_cstring("namespace")?;
        let skip = r.read_i32("skip")?;
        let n_return = r.read_i32("n_return")?;
        let query = r.read_document("query")?;
        let projection = if r.is_empty() {
            None
        } else {
            Some(r.read_document("projection")?)
        };
        Ok(Self {
            header,
            flags,
            namespace,
            skip,
            n_return,
            query,
            projection,
        })
    }

    pub(crate) fn encode(&mut self) -> Result<BytesMut, ProtocolError> {
        let projection_len = self.projection.as_ref().map_or(0, Document::len);
        let mut w =
            WireWriter::with_capacity(13 + self.namespace.len() + self.query.len() + projection_len);
        w.put_i32(self.flags);
        w.put_cstring("namespace", &self.namespace)?;
        w.put_i32(self.skip);
        w.put_i32(self.n_return);
        w.put_document(&self.query);
        if let Some(projection) = &self.projection {
            w.put_document(projection);
        }
        w.finish(&mut self.header)
    }
}

// ---------------------------------------------------------------------------
// OP_INSERT
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct InsertMessage {
    pub header: MessageHeader,
    pub flags: i32,
    pub namespace: String,
    pub documents: Vec<Document>,
}

impl InsertMessage {
    pub const CONTINUE_ON_ERROR: i32 = 1;

    pub fn new(request_id: i32, namespace: impl Into<String>, documents: Vec<Document>) -> Self {
        Self {
            header: MessageHeader::new(request_id, 0, OpCode::Insert),
            flags: 0,
            namespace: namespace.into(),
            documents,
        }
    }

    pub(crate) fn decode(header: MessageHeader, body: &Bytes) -> Result<Self, ProtocolError> {
        let mut r = WireReader::new(body, OpCode::Insert);
        let flags = r.read_i32("flags")?;
        let namespace = r.read_cstring("namespace")?;
        let documents = r.read_documents("documents")?;
        Ok(Self {
            header,
            flags,
            namespace,
            documents,
        })
    }

    pub(crate) fn encode(&mut self) -> Result<BytesMut, ProtocolError> {
        let docs_len: usize = self.documents.iter().map(Document::len).sum();
        let mut w = WireWriter::with_capacity(5 + self.namespace.len() + docs_len);
        w.put_i32(self.flags);
        w.put_cstring("namespace", &self.namespace)?;
        for doc in &self.documents {
            w.put_document(doc);
        }
        w.finish(&mut self.header)
    }
}

// ---------------------------------------------------------------------------
// OP_UPDATE
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateMessage {
    pub header: MessageHeader,
    /// As read off the wire; always written back as zero.
    pub reserved: i32,
    pub namespace: String,
    pub flags: i32,
    pub filter: Document,
    pub update: Document,
}

impl UpdateMessage {
    pub const UPSERT: i32 = 1;
    pub const MULTI_UPDATE: i32 = 1 << 1;

    pub fn new(
        request_id: i32,
        namespace: impl Into<String>,
        flags: i32,
        filter: Document,
        update: Document,
    ) -> Self {
        Self {
            header: MessageHeader::new(request_id, 0, OpCode::Update),
            reserved: 0,
            namespace: namespace.into(),
            flags,
            filter,
            update,
        }
    }

    pub(crate) fn decode(header: MessageHeader, body: &Bytes) -> Result<Self, ProtocolError> {
        let mut r = WireReader::new(body, OpCode::Update);
        let reserved = r.read_i32("reserved")?;
        let namespace = r.read_cstring("namespace")?;
        let flags = r.read_i32("flags")?;
        let filter = r.read_document("filter")?;
        let update = r.read_document("update")?;
        Ok(Self {
            header,
            reserved,
            namespace,
            flags,
            filter,
            update,
        })
    }

    pub(crate) fn encode(&mut self) -> Result<BytesMut, ProtocolError> {
        let mut w = WireWriter::with_capacity(
            9 + self.namespace.len() + self.filter.len() + self.update.len(),
        );
        w.put_i32(0);
        w.put_cstring("namespace", &self.namespace)?;
        w.put_i32(self.flags);
        w.put_document(&self.filter);
        w.put_document(&self.update);
        w.finish(&mut self.header)
    }
}

// ---------------------------------------------------------------------------
// OP_DELETE
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteMessage {
    pub header: MessageHeader,
    pub reserved: i32,
    pub namespace: String,
    pub flags: i32,
    pub filter: Document,
}

impl DeleteMessage {
    pub const SINGLE_REMOVE: i32 = 1;

    pub fn new(request_id: i32, namespace: impl Into<String>, flags: i32, filter: Document) -> Self {
        Self {
            header: MessageHeader::new(request_id, 0, OpCode::Delete),
            reserved: 0,
            namespace: namespace.into(),
            flags,
            filter,
        }
    }

    pub(crate) fn decode(header: MessageHeader, body: &Bytes) -> Result<Self, ProtocolError> {
        let mut r = WireReader::new(body, OpCode::Delete);
        let reserved = r.read_i32("reserved")?;
        let namespace = r.read_cstring("namespace")?;
        let flags = r.read_i32("flags")?;
        let filter = r.read_document("filter")?;
        Ok(Self {
            header,
            reserved,
            namespace,
            flags,
            filter,
        })
    }

    pub(crate) fn encode(&mut self) -> Result<BytesMut, ProtocolError> {
        let mut w = WireWriter::with_capacity(9 + self.namespace.len() + self.filter.len());
        w.put_i32(self.reserved);
        w.put_cstring("namespace", &self.namespace)?;
        w.put_i32(self.flags);
        w.put_document(&self.filter);
        w.finish(&mut self.header)
    }
}

// ---------------------------------------------------------------------------
// OP_REPLY
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct ReplyMessage {
    pub header: MessageHeader,
    pub flags: i32,
    pub cursor_id: i64,
    pub starting_from: i32,
    pub number_returned: i32,
    pub documents: Vec<Document>,
}

impl ReplyMessage {
    pub const CURSOR_NOT_FOUND: i32 = 1;
    pub const QUERY_FAILURE: i32 = 1 << 1;
    pub const AWAIT_CAPABLE: i32 = 1 << 3;

    pub fn new(request_id: i32, response_to: i32, documents: Vec<Document>) -> Self {
        Self {
            header: MessageHeader::new(request_id, response_to, OpCode::Reply),
            flags: 0,
            cursor_id: 0,
            starting_from: 0,
            number_returned: documents.len() as i32,
            documents,
        }
    }

    pub(crate) fn decode(header: MessageHeader, body: &Bytes) -> Result<Self, ProtocolError> {
        let mut r = WireReader::new(body, OpCode::Reply);
        let flags = r.read_i32("flags")?;
        let cursor_id = r.read_i64("cursor_id")?;
        let starting_from = r.read_i32("starting_from")?;
        let number_returned = r.read_i32("number_returned")?;
        let documents = r.read_documents("documents")?;
        Ok(Self {
            header,
            flags,
            cursor_id,
            starting_from,
            number_returned,
            documents,
        })
    }

    pub(crate) fn encode(&mut self) -> Result<BytesMut, ProtocolError> {
        let docs_len: usize = self.documents.iter().map(Document::len).sum();
        let mut w = WireWriter::with_capacity(20 + docs_len);
        w.put_i32(self.flags);
        w.put_i64(self.cursor_id);
        w.put_i32(self.starting_from);
        w.put_i32(self.number_returned);
        for doc in &self.documents {
            w.put_document(doc);
        }
        w.finish(&mut self.header)
    }
}

// ---------------------------------------------------------------------------
// OP_COMMAND
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct CommandMessage {
    pub header: MessageHeader,
    pub database: String,
    pub command_name: String,
    pub command_args: Document,
    pub metadata: Document,
    pub input_docs: Vec<Document>,
}

impl CommandMessage {
    pub(crate) fn decode(header: MessageHeader, body: &Bytes) -> Result<Self, ProtocolError> {
        let mut r = WireReader::new(body, OpCode::Command);
        let database = r.read_cstring("database")?;
        let command_name = r.read_cstring("command_name")?;
        let command_args = r.read_document("command_args")?;
        let metadata = r.read_document("metadata")?;
        let input_docs = r.read_documents("input_docs")?;
        Ok(Self {
            header,
            database,
            command_name,
            command_args,
            metadata,
            input_docs,
        })
    }

    pub(crate) fn encode(&mut self) -> Result<BytesMut, ProtocolError> {
        let docs_len: usize = self.input_docs.iter().map(Document::len).sum();
        let mut w = WireWriter::with_capacity(
            2 + self.database.len()
                + self.command_name.len()
                + self.command_args.len()
                + self.metadata.len()
                + docs_len,
        );
        w.put_cstring("database", &self.database)?;
        w.put_cstring("command_name", &self.command_name)?;
        w.put_document(&self.command_args);
        w.put_document(&self.metadata);
        for doc in &self.input_docs {
            w.put_document(doc);
        }
        w.finish(&mut self.header)
    }
}

// ---------------------------------------------------------------------------
// OP_COMMAND_REPLY
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct CommandReplyMessage {
    pub header: MessageHeader,
    pub reply: Document,
    pub metadata: Document,
    pub output_docs: Vec<Document>,
}

impl CommandReplyMessage {
    pub fn new(request_id: i32, response_to: i32, reply: Document) -> Self {
        Self {
            header: MessageHeader::new(request_id, response_to, OpCode::CommandReply),
            reply,
            metadata: Document::empty(),
            output_docs: Vec::new(),
        }
    }

    pub(crate) fn decode(header: MessageHeader, body: &Bytes) -> Result<Self, ProtocolError> {
        let mut r = WireReader::new(body, OpCode::CommandReply);
        let reply = r.read_document("reply")?;
        let metadata = r.read_document("metadata")?;
        let output_docs = r.read_documents("output_docs")?;
        Ok(Self {
            header,
            reply,
            metadata,
            output_docs,
        })
    }

    pub(crate) fn encode(&mut self) -> Result<BytesMut, ProtocolError> {
        let docs_len: usize = self.output_docs.iter().map(Document::len).sum();
        let mut w = WireWriter::with_capacity(self.reply.len() + self.metadata.len() + docs_len);
        w.put_document(&self.reply);
        w.put_document(&self.metadata);
        for doc in &self.output_docs {
            w.put_document(doc);
        }
        w.finish(&mut self.header)
    }
}

// ---------------------------------------------------------------------------
// OP_MSG
// ---------------------------------------------------------------------------

/// One OP_MSG section.
#[derive(Debug, Clone, PartialEq)]
pub enum Section {
    /// Kind 0: a single body document.
    Body(Document),
    /// Kind 1: a named document sequence.
    Sequence {
        identifier: String,
        documents: Vec<Document>,
    },
}

impl Section {
    const KIND_BODY: u8 = 0;
    const KIND_SEQUENCE: u8 = 1;
}

#[derive(Debug, Clone, PartialEq)]
pub struct MsgMessage {
    pub header: MessageHeader,
    pub flags: u32,
    pub sections: Vec<Section>,
}

impl MsgMessage {
    /// A CRC-32C of the whole message trails the sections.
    pub const CHECKSUM_PRESENT: u32 = 1;
    /// The sender will not wait for a reply; another message follows.
    pub const MORE_TO_COME: u32 = 1 << 1;
    pub const EXHAUST_ALLOWED: u32 = 1 << 16;

    pub fn new(request_id: i32, response_to: i32, body: Document) -> Self {
        Self {
            header: MessageHeader::new(request_id, response_to, OpCode::Msg),
            flags: 0,
            sections: vec![Section::Body(body)],
        }
    }

    pub fn checksum_present(&self) -> bool {
        self.flags & Self::CHECKSUM_PRESENT != 0
    }

    pub fn more_to_come(&self) -> bool {
        self.flags & Self::MORE_TO_COME != 0
    }

    /// The kind-0 body document, if any.
    pub fn body(&self) -> Option<&Document> {
        self.sections.iter().find_map(|s| match s {
            Section::Body(doc) => Some(doc),
            Section::Sequence { .. } => None,
        })
    }

    pub(crate) fn decode(header: MessageHeader, body: &Bytes) -> Result<Self, ProtocolError> {
        let mut r = WireReader::new(body, OpCode::Msg);
        let flags = r.read_u32("flag_bits")?;

        let sections_end = if flags & Self::CHECKSUM_PRESENT != 0 {
            if r.remaining() < 4 {
                return Err(ProtocolError::Truncated {
                    op_code: OpCode::Msg,
                    field: "checksum",
                    offset: r.offset(),
                    needed: 4,
                    available: r.remaining(),
                });
            }
            let checked_len = body.len() - 4;
            let expected = u32::from_le_bytes([
                body[checked_len],
                body[checked_len + 1],
                body[checked_len + 2],
                body[checked_len + 3],
            ]);
            let actual = checksum(&header, &body[..checked_len]);
            if actual != expected {
                return Err(ProtocolError::ChecksumMismatch { expected, actual });
            }
            checked_len
        } else {
            body.len()
        };

        let mut sections_reader = r.sub_reader("sections", sections_end - r.offset())?;
        let mut sections = Vec::new();
        while !sections_reader.is_empty() {
            let kind_offset = sections_reader.offset();
            match sections_reader.read_u8("section_kind")? {
                Section::KIND_BODY => {
                    sections.push(Section::Body(sections_reader.read_document("body")?));
                }
                Section::KIND_SEQUENCE => {
                    let size_offset = sections_reader.offset();
                    let size = sections_reader.read_i32("sequence_size")?;
                    if size < 4 {
                        return Err(ProtocolError::InvalidSectionSize {
                            size,
                            offset: size_offset,
                        });
                    }
                    let mut seq = sections_reader.sub_reader("sequence", size as usize - 4)?;
                    let identifier = seq.read_cstring("sequence_identifier")?;
                    let documents = seq.read_documents("sequence_documents")?;
                    sections.push(Section::Sequence {
                        identifier,
                        documents,
                    });
                }
                kind => {
                    return Err(ProtocolError::UnknownSectionKind {
                        kind,
                        offset: kind_offset,
                    })
                }
            }
        }
        if sections.is_empty() {
            return Err(ProtocolError::EmptyMsg);
        }

        Ok(Self {
            header,
            flags,
            sections,
        })
    }

    pub(crate) fn encode(&mut self) -> Result<BytesMut, ProtocolError> {
        if self.sections.is_empty() {
            return Err(ProtocolError::EmptyMsg);
        }
        let mut w = WireWriter::with_capacity(64);
        w.put_u32(self.flags);
        for section in &self.sections {
            match section {
                Section::Body(doc) => {
                    w.put_u8(Section::KIND_BODY);
                    w.put_document(doc);
                }
                Section::Sequence {
                    identifier,
                    documents,
                } => {
                    w.put_u8(Section::KIND_SEQUENCE);
                    let size_at = w.position();
                    w.put_i32(0);
                    w.put_cstring("sequence_identifier", identifier)?;
                    for doc in documents {
                        w.put_document(doc);
                    }
                    let size = (w.position() - size_at) as i32;
                    w.patch_i32(size_at, size);
                }
            }
        }

        if !self.checksum_present() {
            return w.finish(&mut self.header);
        }

        // The checksum covers the header, so size must be final before hashing.
        w.put_u32(0);
        let mut out = w.finish(&mut self.header)?;
        let checked_len = out.len() - 4;
        let crc = crc32c::crc32c(&out[..checked_len]);
        out[checked_len..].copy_from_slice(&crc.to_le_bytes());
        Ok(out)
    }
}

/// CRC-32C over the header (as it appeared on the wire) and the checked body bytes.
fn checksum(header: &MessageHeader, body: &[u8]) -> u32 {
    let mut raw = [0u8; crate::header::HEADER_SIZE];
    header.write_into(&mut raw);
    crc32c::crc32c_append(crc32c::crc32c(&raw), body)
}

// ---------------------------------------------------------------------------
// Opaque pass-through
// ---------------------------------------------------------------------------

/// OP_GET_MORE / OP_KILL_CURSORS with the body kept as raw bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct OpaqueMessage {
    pub header: MessageHeader,
    pub body: Bytes,
}

impl OpaqueMessage {
    pub(crate) fn decode(header: MessageHeader, body: &Bytes) -> Result<Self, ProtocolError> {
        let mut r = WireReader::new(body, header.op_code);
        Ok(Self {
            header,
            body: r.read_rest(),
        })
    }

    pub(crate) fn encode(&mut self) -> Result<BytesMut, ProtocolError> {
        let mut w = WireWriter::with_capacity(self.body.len());
        w.put_slice(&self.body);
        w.finish(&mut self.header)
    }
}
