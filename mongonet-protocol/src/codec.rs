//! Message-level encode/decode and stream framing.

use crate::error::ProtocolError;
use crate::header::{MessageHeader, OpCode, HEADER_SIZE};
use crate::message::*;
use crate::MAX_MESSAGE_SIZE;
use bytes::{Bytes, BytesMut};

impl Message {
    /// Decodes a message body for an already-parsed header.
    ///
    /// `body` holds exactly `header.size - 16` bytes.
    pub fn decode(header: MessageHeader, body: Bytes) -> Result<Self, ProtocolError> {
        let message = match header.op_code {
            OpCode::Query => Message::Query(QueryMessage::decode(header, &body)?),
            OpCode::Insert => Message::Insert(InsertMessage::decode(header, &body)?),
            OpCode::Update => Message::Update(UpdateMessage::decode(header, &body)?),
            OpCode::Delete => Message::Delete(DeleteMessage::decode(header, &body)?),
            OpCode::Reply => Message::Reply(ReplyMessage::decode(header, &body)?),
            OpCode::Command => Message::Command(CommandMessage::decode(header, &body)?),
            OpCode::CommandReply => {
                Message::CommandReply(CommandReplyMessage::decode(header, &body)?)
            }
            OpCode::Msg => Message::Msg(MsgMessage::decode(header, &body)?),
            OpCode::GetMore | OpCode::KillCursors => {
                Message::Opaque(OpaqueMessage::decode(header, &body)?)
            }
        };
        Ok(message)
    }

    /// Decodes one complete message, header included.
    pub fn from_bytes(mut bytes: Bytes) -> Result<Self, ProtocolError> {
        let header = match MessageHeader::peek(&bytes)? {
            Some(header) => header,
            None => {
                return Err(ProtocolError::MessageTooSmall {
                    size: bytes.len() as i32,
                })
            }
        };
        check_size(header.size)?;
        let size = header.size as usize;
        if bytes.len() < size {
            return Err(ProtocolError::Truncated {
                op_code: header.op_code,
                field: "body",
                offset: 0,
                needed: size - HEADER_SIZE,
                available: bytes.len() - HEADER_SIZE,
            });
        }
        bytes.truncate(size);
        let body = bytes.slice(HEADER_SIZE..);
        Self::decode(header, body)
    }

    /// Serializes the message.
    ///
    /// `header.size` is recomputed from the output length, so after this call it
    /// always equals the returned buffer's length.
    pub fn encode(&mut self) -> Result<BytesMut, ProtocolError> {
        match self {
            Message::Query(m) => m.encode(),
            Message::Insert(m) => m.encode(),
            Message::Update(m) => m.encode(),
            Message::Delete(m) => m.encode(),
            Message::Reply(m) => m.encode(),
            Message::Command(m) => m.encode(),
            Message::CommandReply(m) => m.encode(),
            Message::Msg(m) => m.encode(),
            Message::Opaque(m) => m.encode(),
        }
    }
}

fn check_size(size: i32) -> Result<(), ProtocolError> {
    if size < HEADER_SIZE as i32 {
        return Err(ProtocolError::MessageTooSmall { size });
    }
    if size as usize > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: size as usize,
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(())
}

/// Frames whole messages out of an arbitrary byte stream.
pub struct Decoder {
    buffer: BytesMut,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Mutable access to the buffer, for reading straight from a socket.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Attempts to decode the next message from the buffer.
    ///
    /// Returns `Ok(Some(message))` once a complete message is buffered,
    /// `Ok(None)` if more data is needed, or `Err` on framing/decoding errors.
    pub fn decode_message(&mut self) -> Result<Option<Message>, ProtocolError> {
        let header = match MessageHeader::peek(&self.buffer)? {
            Some(header) => header,
            None => return Ok(None),
        };
        check_size(header.size)?;

        let size = header.size as usize;
        if self.buffer.len() < size {
            self.buffer.reserve(size - self.buffer.len());
            return Ok(None);
        }

        let frame = self.buffer.split_to(size).freeze();
        let body = frame.slice(HEADER_SIZE..);
        Message::decode(header, body).map(Some)
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use bson::doc;
    use proptest::prelude::*;

    fn bson_doc(d: bson::Document) -> Document {
        Document::from_bson(&d).unwrap()
    }

    fn roundtrip(mut message: Message) -> Message {
        let encoded = message.encode().unwrap();
        assert_eq!(message.header().size as usize, encoded.len());
        let decoded = Message::from_bytes(encoded.freeze()).unwrap();
        assert_eq!(decoded, message);
        decoded
    }

    fn ismaster_query() -> Message {
        Message::Query(QueryMessage::new(
            11,
            "admin.$cmd",
            0,
            0,
            -1,
            bson_doc(doc! { "ismaster": 1 }),
            None,
        ))
    }

    #[test]
    fn test_query_roundtrip_with_and_without_projection() {
        let decoded = roundtrip(ismaster_query());
        match decoded {
            Message::Query(q) => {
                assert_eq!(q.namespace, "admin.$cmd");
                assert_eq!(q.n_return, -1);
                assert!(q.projection.is_none());
                assert_eq!(q.query.to_bson().unwrap(), doc! { "ismaster": 1 });
            }
            other => panic!("expected query, got {}", other),
        }

        let with_projection = Message::Query(QueryMessage::new(
            12,
            "test.users",
            QueryMessage::SLAVE_OK,
            5,
            10,
            bson_doc(doc! { "age": { "$gt": 21 } }),
            Some(bson_doc(doc! { "name": 1 })),
        ));
        roundtrip(with_projection);
    }

    #[test]
    fn test_query_exact_layout() {
        let mut message = ismaster_query();
        let encoded = message.encode().unwrap();
        let query_len = bson_doc(doc! { "ismaster": 1 }).len();
        // header + flags + "admin.$cmd\0" + skip + n_return + query
        assert_eq!(encoded.len(), 16 + 4 + 11 + 4 + 4 + query_len);
        assert_eq!(&encoded[12..16], &2004i32.to_le_bytes());
        assert_eq!(&encoded[20..31], b"admin.$cmd\0");
        assert_eq!(&encoded[35..39], &(-1i32).to_le_bytes());
    }

    #[test]
    fn test_insert_roundtrip() {
        let message = Message::Insert(InsertMessage::new(
            3,
            "test.things",
            vec![bson_doc(doc! { "a": 1 }), bson_doc(doc! { "b": "two" })],
        ));
        match roundtrip(message) {
            Message::Insert(m) => assert_eq!(m.documents.len(), 2),
            other => panic!("expected insert, got {}", other),
        }
    }

    #[test]
    fn test_update_writes_zero_reserved() {
        let mut update = UpdateMessage::new(
            4,
            "test.things",
            UpdateMessage::UPSERT,
            bson_doc(doc! { "_id": 1 }),
            bson_doc(doc! { "$set": { "x": 2 } }),
        );
        update.reserved = 77;
        let mut message = Message::Update(update);
        let encoded = message.encode().unwrap();
        assert_eq!(&encoded[16..20], &[0, 0, 0, 0]);

        match Message::from_bytes(encoded.freeze()).unwrap() {
            Message::Update(m) => {
                assert_eq!(m.reserved, 0);
                assert_eq!(m.flags, UpdateMessage::UPSERT);
                assert_eq!(m.update.to_bson().unwrap(), doc! { "$set": { "x": 2 } });
            }
            other => panic!("expected update, got {}", other),
        }
    }

    #[test]
    fn test_delete_roundtrip() {
        roundtrip(Message::Delete(DeleteMessage::new(
            5,
            "test.things",
            DeleteMessage::SINGLE_REMOVE,
            bson_doc(doc! { "_id": 9 }),
        )));
    }

    #[test]
    fn test_reply_roundtrip() {
        let mut reply = ReplyMessage::new(6, 5, vec![bson_doc(doc! { "ok": 1 })]);
        reply.cursor_id = 0x0102_0304_0506_0708;
        reply.starting_from = 3;
        match roundtrip(Message::Reply(reply)) {
            Message::Reply(m) => {
                assert_eq!(m.cursor_id, 0x0102_0304_0506_0708);
                assert_eq!(m.number_returned, 1);
                assert_eq!(m.header.response_to, 5);
            }
            other => panic!("expected reply, got {}", other),
        }
    }

    #[test]
    fn test_command_roundtrip() {
        let message = Message::Command(CommandMessage {
            header: MessageHeader::new(7, 0, OpCode::Command),
            database: "admin".to_string(),
            command_name: "isMaster".to_string(),
            command_args: bson_doc(doc! { "isMaster": 1 }),
            metadata: Document::empty(),
            input_docs: vec![bson_doc(doc! { "x": 1 })],
        });
        roundtrip(message);
    }

    #[test]
    fn test_command_reply_roundtrip() {
        let mut reply = CommandReplyMessage::new(8, 7, bson_doc(doc! { "ok": 1 }));
        reply.output_docs.push(bson_doc(doc! { "y": 2 }));
        roundtrip(Message::CommandReply(reply));
    }

    #[test]
    fn test_msg_roundtrip_with_sequence() {
        let message = Message::Msg(MsgMessage {
            header: MessageHeader::new(9, 0, OpCode::Msg),
            flags: 0,
            sections: vec![
                Section::Body(bson_doc(doc! { "insert": "things", "$db": "test" })),
                Section::Sequence {
                    identifier: "documents".to_string(),
                    documents: vec![bson_doc(doc! { "a": 1 }), bson_doc(doc! { "a": 2 })],
                },
            ],
        });
        match roundtrip(message) {
            Message::Msg(m) => {
                assert_eq!(m.sections.len(), 2);
                assert!(m.body().is_some());
            }
            other => panic!("expected msg, got {}", other),
        }
    }

    #[test]
    fn test_msg_checksum_is_computed_and_verified() {
        let mut msg = MsgMessage::new(10, 0, bson_doc(doc! { "ping": 1 }));
        msg.flags |= MsgMessage::CHECKSUM_PRESENT;
        let mut message = Message::Msg(msg);
        let mut encoded = message.encode().unwrap();
        let len = encoded.len();
        let expected = crc32c::crc32c(&encoded[..len - 4]);
        assert_eq!(&encoded[len - 4..], &expected.to_le_bytes());

        assert_eq!(Message::from_bytes(encoded.clone().freeze()).unwrap(), message);

        // Corrupt one byte of the body document.
        encoded[len - 6] ^= 0xFF;
        assert!(matches!(
            Message::from_bytes(encoded.freeze()),
            Err(ProtocolError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_msg_more_to_come_has_no_response() {
        let mut msg = MsgMessage::new(1, 0, Document::empty());
        assert!(Message::Msg(msg.clone()).has_response());
        msg.flags |= MsgMessage::MORE_TO_COME;
        assert!(!Message::Msg(msg).has_response());
    }

    #[test]
    fn test_msg_without_sections_is_rejected() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&20i32.to_le_bytes());
        raw.extend_from_slice(&1i32.to_le_bytes());
        raw.extend_from_slice(&0i32.to_le_bytes());
        raw.extend_from_slice(&2013i32.to_le_bytes());
        raw.extend_from_slice(&0u32.to_le_bytes());
        assert!(matches!(
            Message::from_bytes(Bytes::from(raw)),
            Err(ProtocolError::EmptyMsg)
        ));
    }

    #[test]
    fn test_msg_unknown_section_kind() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&26i32.to_le_bytes());
        raw.extend_from_slice(&1i32.to_le_bytes());
        raw.extend_from_slice(&0i32.to_le_bytes());
        raw.extend_from_slice(&2013i32.to_le_bytes());
        raw.extend_from_slice(&0u32.to_le_bytes());
        raw.push(7);
        raw.extend_from_slice(&[5, 0, 0, 0, 0]);
        assert!(matches!(
            Message::from_bytes(Bytes::from(raw)),
            Err(ProtocolError::UnknownSectionKind { kind: 7, offset: 4 })
        ));
    }

    #[test]
    fn test_opaque_get_more_passthrough() {
        let body = Bytes::from_static(b"\0\0\0\0test.c\0\x02\0\0\0\x05\0\0\0\0\0\0\0");
        let message = Message::Opaque(OpaqueMessage {
            header: MessageHeader::new(13, 0, OpCode::GetMore),
            body,
        });
        assert!(message.has_response());
        roundtrip(message);

        let kill = Message::Opaque(OpaqueMessage {
            header: MessageHeader::new(14, 0, OpCode::KillCursors),
            body: Bytes::from_static(&[0, 0, 0, 0, 0, 0, 0, 0]),
        });
        assert!(!kill.has_response());
    }

    #[test]
    fn test_has_response_table() {
        let empty = Document::empty;
        assert!(ismaster_query().has_response());
        assert!(!Message::Insert(InsertMessage::new(1, "a.b", vec![empty()])).has_response());
        assert!(!Message::Delete(DeleteMessage::new(1, "a.b", 0, empty())).has_response());
        assert!(!Message::Reply(ReplyMessage::new(1, 0, vec![])).has_response());
        assert!(!Message::CommandReply(CommandReplyMessage::new(1, 0, empty())).has_response());
    }

    #[test]
    fn test_decoder_partial_and_multiple() {
        let mut first = ismaster_query();
        let mut second = Message::Reply(ReplyMessage::new(2, 11, vec![Document::empty()]));
        let a = first.encode().unwrap();
        let b = second.encode().unwrap();

        let mut decoder = Decoder::new();
        decoder.extend(&a[..10]);
        assert!(decoder.decode_message().unwrap().is_none());
        decoder.extend(&a[10..]);
        decoder.extend(&b);

        assert_eq!(decoder.decode_message().unwrap().unwrap(), first);
        assert_eq!(decoder.decode_message().unwrap().unwrap(), second);
        assert!(decoder.decode_message().unwrap().is_none());
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decoder_rejects_bad_sizes() {
        let mut decoder = Decoder::new();
        let mut raw = Vec::new();
        raw.extend_from_slice(&8i32.to_le_bytes());
        raw.extend_from_slice(&[0u8; 8]);
        raw.extend_from_slice(&2004i32.to_le_bytes());
        decoder.extend(&raw);
        assert!(matches!(
            decoder.decode_message(),
            Err(ProtocolError::MessageTooSmall { size: 8 })
        ));

        let mut decoder = Decoder::new();
        let mut raw = Vec::new();
        raw.extend_from_slice(&(MAX_MESSAGE_SIZE as i32 + 1).to_le_bytes());
        raw.extend_from_slice(&[0u8; 8]);
        raw.extend_from_slice(&2004i32.to_le_bytes());
        decoder.extend(&raw);
        assert!(matches!(
            decoder.decode_message(),
            Err(ProtocolError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn test_decoder_unknown_opcode() {
        let mut decoder = Decoder::new();
        let mut raw = Vec::new();
        raw.extend_from_slice(&16i32.to_le_bytes());
        raw.extend_from_slice(&[0u8; 8]);
        raw.extend_from_slice(&2012i32.to_le_bytes());
        decoder.extend(&raw);
        assert!(matches!(
            decoder.decode_message(),
            Err(ProtocolError::UnknownOpCode(2012))
        ));
    }

    // ----- property tests -----

    fn arb_document() -> impl Strategy<Value = Document> {
        prop::collection::vec(("[a-z]{1,8}", any::<i32>()), 0..4).prop_map(|fields| {
            let mut d = bson::Document::new();
            for (k, v) in fields {
                d.insert(k, v);
            }
            Document::from_bson(&d).unwrap()
        })
    }

    fn arb_cstring() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9_.$]{0,24}"
    }

    fn arb_header(op_code: OpCode) -> impl Strategy<Value = MessageHeader> {
        (any::<i32>(), any::<i32>())
            .prop_map(move |(id, to)| MessageHeader::new(id, to, op_code))
    }

    fn arb_section() -> impl Strategy<Value = Section> {
        prop_oneof![
            arb_document().prop_map(Section::Body),
            (arb_cstring(), prop::collection::vec(arb_document(), 0..3)).prop_map(
                |(identifier, documents)| Section::Sequence {
                    identifier,
                    documents
                }
            ),
        ]
    }

    fn arb_message() -> impl Strategy<Value = Message> {
        prop_oneof![
            (
                arb_header(OpCode::Query),
                any::<i32>(),
                arb_cstring(),
                any::<i32>(),
                any::<i32>(),
                arb_document(),
                prop::option::of(arb_document())
            )
                .prop_map(|(header, flags, namespace, skip, n_return, query, projection)| {
                    Message::Query(QueryMessage {
                        header,
                        flags,
                        namespace,
                        skip,
                        n_return,
                        query,
                        projection,
                    })
                }),
            (
                arb_header(OpCode::Insert),
                any::<i32>(),
                arb_cstring(),
                prop::collection::vec(arb_document(), 1..4)
            )
                .prop_map(|(header, flags, namespace, documents)| {
                    Message::Insert(InsertMessage {
                        header,
                        flags,
                        namespace,
                        documents,
                    })
                }),
            (
                arb_header(OpCode::Update),
                arb_cstring(),
                any::<i32>(),
                arb_document(),
                arb_document()
            )
                .prop_map(|(header, namespace, flags, filter, update)| {
                    Message::Update(UpdateMessage {
                        header,
                        reserved: 0,
                        namespace,
                        flags,
                        filter,
                        update,
                    })
                }),
            (
                arb_header(OpCode::Delete),
                any::<i32>(),
                arb_cstring(),
                any::<i32>(),
                arb_document()
            )
                .prop_map(|(header, reserved, namespace, flags, filter)| {
                    Message::Delete(DeleteMessage {
                        header,
                        reserved,
                        namespace,
                        flags,
                        filter,
                    })
                }),
            (
                arb_header(OpCode::Reply),
                any::<i32>(),
                any::<i64>(),
                any::<i32>(),
                prop::collection::vec(arb_document(), 0..4)
            )
                .prop_map(|(header, flags, cursor_id, starting_from, documents)| {
                    Message::Reply(ReplyMessage {
                        header,
                        flags,
                        cursor_id,
                        starting_from,
                        number_returned: documents.len() as i32,
                        documents,
                    })
                }),
            (
                arb_header(OpCode::Command),
                arb_cstring(),
                arb_cstring(),
                arb_document(),
                arb_document(),
                prop::collection::vec(arb_document(), 0..3)
            )
                .prop_map(
                    |(header, database, command_name, command_args, metadata, input_docs)| {
                        Message::Command(CommandMessage {
                            header,
                            database,
                            command_name,
                            command_args,
                            metadata,
                            input_docs,
                        })
                    }
                ),
            (
                arb_header(OpCode::CommandReply),
                arb_document(),
                arb_document(),
                prop::collection::vec(arb_document(), 0..3)
            )
                .prop_map(|(header, reply, metadata, output_docs)| {
                    Message::CommandReply(CommandReplyMessage {
                        header,
                        reply,
                        metadata,
                        output_docs,
                    })
                }),
            (
                arb_header(OpCode::Msg),
                prop_oneof![
                    Just(0u32),
                    Just(MsgMessage::CHECKSUM_PRESENT),
                    Just(MsgMessage::EXHAUST_ALLOWED)
                ],
                prop::collection::vec(arb_section(), 1..4)
            )
                .prop_map(|(header, flags, sections)| {
                    Message::Msg(MsgMessage {
                        header,
                        flags,
                        sections,
                    })
                }),
        ]
    }

    proptest! {
        #[test]
        fn prop_encode_decode_roundtrip(mut message in arb_message()) {
            let encoded = message.encode().unwrap();
            prop_assert_eq!(message.header().size as usize, encoded.len());
            let decoded = Message::from_bytes(encoded.freeze()).unwrap();
            prop_assert_eq!(decoded, message);
        }

        #[test]
        fn prop_truncated_message_is_an_error(mut message in arb_message(), cut in 1usize..64) {
            let encoded = message.encode().unwrap().freeze();
            prop_assume!(cut <= encoded.len());
            let truncated = encoded.slice(..encoded.len() - cut);
            prop_assert!(Message::from_bytes(truncated).is_err());
        }

        #[test]
        fn prop_truncated_body_never_yields_original(
            mut message in arb_message(),
            cut in 1usize..64,
        ) {
            let encoded = message.encode().unwrap().freeze();
            let body = encoded.slice(HEADER_SIZE..);
            prop_assume!(cut <= body.len());
            let truncated = body.slice(..body.len() - cut);
            // Dropping whole trailing documents can still parse, but never to the same message.
            if let Ok(decoded) = Message::decode(*message.header(), truncated) {
                prop_assert_ne!(decoded, message);
            }
        }

        #[test]
        fn prop_decoder_waits_for_full_frame(mut message in arb_message(), split in 0usize..256) {
            let encoded = message.encode().unwrap();
            let split = split.min(encoded.len() - 1);
            let mut decoder = Decoder::new();
            decoder.extend(&encoded[..split]);
            prop_assert!(decoder.decode_message().unwrap().is_none());
            decoder.extend(&encoded[split..]);
            prop_assert_eq!(decoder.decode_message().unwrap(), Some(message));
        }
    }
}
