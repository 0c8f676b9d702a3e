//! Container driver and block decoders.
//!
//! The driver walks the tagged object stream of a fully buffered trace,
//! maintains the in-band type registry, and frames block payloads. Malformed
//! bytes inside a block abort that block only; the walk resumes at the next
//! outer tag and the failure is recorded as an error string on the result.

use std::io::Cursor;

use binrw::BinReaderExt;
use num_traits::FromPrimitive as _;

use super::{
    BlockFlags, BlockHeader, EventBlobHeader, EventSchema, FieldSchema, MetadataTypeCode,
    NettraceString, RegisteredType, TagDialect, TraceInfo, BlobFlags, TAG_BEGIN_PRIVATE_OBJECT,
    TAG_NULL_REFERENCE,
};
use crate::analysis::{Aggregates, ParseResult};
use crate::coreclr::{self, DecodedEvent};
use crate::error::ParseError;
use crate::helpers::{
    align_to_4, parse_varint_i64, parse_varint_u32, parse_varint_u64, peek_u8, read_utf16z,
};

const MAGIC: &[u8; 8] = b"Nettrace";
const SERIALIZATION_BANNER: &str = "!FastSerialization.1";

// Hard cap on object-walk iterations, so a pathological stream cannot spin
// the driver forever.
const OBJECT_BUDGET: u64 = 10_000_000;

/// Single-pass decoder for a buffered nettrace stream.
pub struct EventPipeParser<'a> {
    data: &'a [u8],
    reader: Cursor<&'a [u8]>,
    dialect: Option<TagDialect>,
    registry: Vec<RegisteredType>,
    agg: Aggregates,
}

impl<'a> EventPipeParser<'a> {
    /// Decodes `data` and aggregates it into the analytical model. Never
    /// fails: a fatal header problem yields an empty result carrying a
    /// single error entry, anything later is recovered per block.
    pub fn parse(data: &'a [u8]) -> ParseResult {
        let mut parser = EventPipeParser {
            data,
            reader: Cursor::new(data),
            dialect: None,
            registry: Vec::new(),
            agg: Aggregates::new(),
        };
        match parser.read_file_header() {
            Ok(()) => parser.walk_objects(),
            Err(err) => parser.agg.push_error(err.to_string()),
        }
        parser.agg.finish()
    }

    fn read_file_header(&mut self) -> Result<(), ParseError> {
        let magic: [u8; 8] = self.reader.read_le().map_err(|_| ParseError::InvalidMagic)?;
        if &magic != MAGIC {
            return Err(ParseError::InvalidMagic);
        }
        let banner: NettraceString = self
            .reader
            .read_le()
            .map_err(|_| ParseError::InvalidSerializationHeader("<truncated>".into()))?;
        let banner = banner.as_str();
        if !banner.starts_with(SERIALIZATION_BANNER) {
            return Err(ParseError::InvalidSerializationHeader(banner.into_owned()));
        }
        Ok(())
    }

    fn walk_objects(&mut self) {
        let mut remaining = OBJECT_BUDGET;
        loop {
            if remaining == 0 {
                self.agg
                    .push_error(format!("object budget of {OBJECT_BUDGET} exhausted"));
                return;
            }
            remaining -= 1;

            let Some(tag) = self.read_u8() else { return };
            if tag == TAG_NULL_REFERENCE || self.is_end_object(tag) {
                continue;
            }
            if tag != TAG_BEGIN_PRIVATE_OBJECT {
                self.agg.push_error(format!(
                    "unexpected tag {tag} at offset {}",
                    self.reader.position() - 1
                ));
                self.scan_to_next_tag();
                continue;
            }
            if let Err(err) = self.read_object() {
                self.agg.push_error(err.to_string());
                self.scan_to_next_tag();
            }
        }
    }

    /// Parses one object whose BeginPrivateObject tag was just consumed.
    fn read_object(&mut self) -> Result<(), ParseError> {
        let ty = self.read_type_reference()?;
        log::trace!(
            "object of type {:?} at offset {}",
            ty.name,
            self.reader.position()
        );
        if self.read_payload(&ty)? {
            self.expect_end_object()?;
        }
        Ok(())
    }

    /// Resolves the type of the current object, either from an in-band
    /// definition (appended to the registry) or from a varint
    /// back-reference into it.
    fn read_type_reference(&mut self) -> Result<RegisteredType, ParseError> {
        let next = self.peek_tag()?;
        if next == TAG_BEGIN_PRIVATE_OBJECT {
            self.skip_tag();
            let inner = self.peek_tag()?;
            let ty = if inner == TAG_NULL_REFERENCE {
                self.skip_tag();
                self.read_type_definition()?
            } else {
                self.read_type_back_reference()?
            };
            self.expect_end_object()?;
            Ok(ty)
        } else if next == TAG_NULL_REFERENCE {
            // Legacy form: the definition follows the object tag directly,
            // without a wrapping type object.
            self.skip_tag();
            self.read_type_definition()
        } else {
            self.read_type_back_reference()
        }
    }

    fn read_type_definition(&mut self) -> Result<RegisteredType, ParseError> {
        let version: u32 = self.reader.read_le()?;
        let min_reader_version: u32 = self.reader.read_le()?;
        let name: NettraceString = self.reader.read_le()?;
        let ty = RegisteredType {
            version,
            min_reader_version,
            name: name.as_str().into_owned(),
        };
        log::trace!("type {:?} registered as index {}", ty.name, self.registry.len());
        self.registry.push(ty.clone());
        Ok(ty)
    }

    fn read_type_back_reference(&mut self) -> Result<RegisteredType, ParseError> {
        let index = parse_varint_u32(&mut self.reader)?;
        self.registry
            .get(index as usize)
            .cloned()
            .ok_or(ParseError::UnknownTypeIndex(index))
    }

    /// Returns Ok(false) when the type was unknown and the driver already
    /// repositioned itself at the next tag.
    fn read_payload(&mut self, ty: &RegisteredType) -> Result<bool, ParseError> {
        match ty.name.as_str() {
            "Trace" => {
                let info: TraceInfo = self.reader.read_le()?;
                self.agg.set_trace(info);
                Ok(true)
            }
            "MetadataBlock" => {
                self.read_block("MetadataBlock", Self::decode_metadata_block)?;
                Ok(true)
            }
            "EventBlock" => {
                self.read_block("EventBlock", Self::decode_event_block)?;
                Ok(true)
            }
            "StackBlock" => {
                self.read_block("StackBlock", Self::decode_stack_block)?;
                Ok(true)
            }
            "SPBlock" => {
                self.read_block("SPBlock", Self::decode_sequence_point_block)?;
                Ok(true)
            }
            other => {
                self.agg
                    .push_error(format!("skipped object of unknown type {other:?}"));
                self.scan_to_next_tag();
                Ok(false)
            }
        }
    }

    /// Frames a block payload: 32-bit size, padding to the file's 4-byte
    /// grid, then `size` bytes of content handed to `decode`. A decode
    /// failure is recorded and the cursor still lands past the block.
    fn read_block(
        &mut self,
        kind: &'static str,
        decode: fn(&mut Self, &[u8]) -> Result<(), ParseError>,
    ) -> Result<(), ParseError> {
        let size: u32 = self.reader.read_le()?;
        align_to_4(&mut self.reader)?;
        let start = self.reader.position() as usize;
        let end = start.checked_add(size as usize).unwrap_or(usize::MAX);
        if start > self.data.len() || end > self.data.len() {
            return Err(ParseError::MalformedBlock {
                kind,
                reason: format!(
                    "declared size {size} exceeds the {} remaining bytes",
                    self.data.len().saturating_sub(start.min(self.data.len()))
                ),
            });
        }
        let data = self.data;
        if let Err(err) = decode(self, &data[start..end]) {
            log::warn!("{kind} aborted: {err}");
            self.agg.push_error(format!("{kind}: {err}"));
        }
        self.reader.set_position(end as u64);
        Ok(())
    }

    fn decode_metadata_block(&mut self, content: &[u8]) -> Result<(), ParseError> {
        let mut blobs = EventBlobIter::new(content)?;
        while let Some((header, payload)) = blobs.next_blob()? {
            // A malformed descriptor skips this pseudo-event only.
            match parse_metadata_descriptor(payload) {
                Ok(schema) => {
                    log::trace!(
                        "metadata {} -> {}:{}",
                        schema.metadata_id,
                        schema.provider_name,
                        schema.event_id
                    );
                    self.agg.record_schema(schema);
                }
                Err(err) => self.agg.push_error(format!(
                    "metadata descriptor (header id {}): {err}",
                    header.metadata_id
                )),
            }
        }
        Ok(())
    }

    fn decode_event_block(&mut self, content: &[u8]) -> Result<(), ParseError> {
        let mut blobs = EventBlobIter::new(content)?;
        while let Some((header, payload)) = blobs.next_blob()? {
            self.handle_event(&header, payload);
        }
        Ok(())
    }

    fn handle_event(&mut self, header: &EventBlobHeader, payload: &[u8]) {
        self.agg.count_event(header.metadata_id);
        let Some(kind) = self.agg.known_kind(header.metadata_id) else {
            return;
        };
        let pointer_size = self.agg.pointer_size();
        match coreclr::decode_event(kind, payload, pointer_size) {
            Ok(DecodedEvent::CoreClr(event)) => {
                self.agg
                    .record_coreclr(event, header.timestamp, header.stack_id)
            }
            Ok(DecodedEvent::CpuSample) => self.agg.record_cpu_sample(header.stack_id),
            Err(err) => self
                .agg
                .push_error(format!("metadata {}: {err}", header.metadata_id)),
        }
    }

    fn decode_stack_block(&mut self, content: &[u8]) -> Result<(), ParseError> {
        let mut cur = Cursor::new(content);
        let first_id: u32 = cur.read_le()?;
        let count: u32 = cur.read_le()?;
        let pointer_size = self.agg.pointer_size();
        if pointer_size != 4 && pointer_size != 8 {
            return Err(ParseError::MalformedBlock {
                kind: "StackBlock",
                reason: format!("unsupported pointer size {pointer_size}"),
            });
        }
        for n in 0..count {
            let stack_size: u32 = cur.read_le()?;
            if stack_size == 0 {
                // A zero-sized entry terminates the block.
                break;
            }
            if stack_size % pointer_size != 0 {
                return Err(ParseError::MalformedBlock {
                    kind: "StackBlock",
                    reason: format!(
                        "stack size {stack_size} is not a multiple of pointer size {pointer_size}"
                    ),
                });
            }
            let remaining = content.len() - cur.position() as usize;
            if stack_size as usize > remaining {
                return Err(ParseError::UnexpectedEnd);
            }
            let mut addresses = Vec::with_capacity((stack_size / pointer_size) as usize);
            for _ in 0..stack_size / pointer_size {
                let address = if pointer_size == 4 {
                    cur.read_le::<u32>()? as u64
                } else {
                    cur.read_le::<u64>()?
                };
                addresses.push(address);
            }
            self.agg.record_stack(first_id.wrapping_add(n), addresses);
        }
        Ok(())
    }

    fn decode_sequence_point_block(&mut self, content: &[u8]) -> Result<(), ParseError> {
        let mut cur = Cursor::new(content);
        let timestamp: u64 = cur.read_le()?;
        let thread_count: u32 = cur.read_le()?;
        for _ in 0..thread_count {
            let _thread_id: u64 = cur.read_le()?;
            let _sequence_number: u32 = cur.read_le()?;
        }
        // Sequence points flush writer-side buffers; nothing in the
        // analytical model depends on them.
        log::trace!("sequence point at {timestamp} covering {thread_count} threads");
        Ok(())
    }

    fn read_u8(&mut self) -> Option<u8> {
        let pos = self.reader.position() as usize;
        let byte = *self.data.get(pos)?;
        self.reader.set_position(pos as u64 + 1);
        Some(byte)
    }

    fn peek_tag(&mut self) -> Result<u8, ParseError> {
        Ok(peek_u8(&mut self.reader)?)
    }

    fn skip_tag(&mut self) {
        let pos = self.reader.position();
        self.reader.set_position(pos + 1);
    }

    fn is_end_object(&self, tag: u8) -> bool {
        match self.dialect {
            Some(dialect) => tag == dialect.end_object(),
            None => {
                tag == TagDialect::Legacy.end_object() || tag == TagDialect::Modern.end_object()
            }
        }
    }

    /// Consumes an EndObject tag. The first one seen locks the tag dialect
    /// for the remainder of the stream.
    fn expect_end_object(&mut self) -> Result<(), ParseError> {
        let tag = self.read_u8().ok_or(ParseError::UnexpectedEnd)?;
        match self.dialect {
            Some(dialect) if tag == dialect.end_object() => Ok(()),
            Some(dialect) => Err(ParseError::MalformedBlock {
                kind: "object stream",
                reason: format!(
                    "expected EndObject tag {}, found {tag}",
                    dialect.end_object()
                ),
            }),
            None => {
                let dialect = if tag == TagDialect::Legacy.end_object() {
                    TagDialect::Legacy
                } else if tag == TagDialect::Modern.end_object() {
                    TagDialect::Modern
                } else {
                    return Err(ParseError::MalformedBlock {
                        kind: "object stream",
                        reason: format!("expected EndObject, found tag {tag}"),
                    });
                };
                log::trace!("locked tag dialect {dialect:?}");
                self.dialect = Some(dialect);
                Ok(())
            }
        }
    }

    /// Resynchronization after a recoverable failure: advance to the next
    /// byte that can open or close an object.
    fn scan_to_next_tag(&mut self) {
        let mut pos = self.reader.position() as usize;
        while pos < self.data.len() {
            let byte = self.data[pos];
            if byte == TAG_BEGIN_PRIVATE_OBJECT || self.is_end_object(byte) {
                break;
            }
            pos += 1;
        }
        self.reader.set_position(pos as u64);
    }
}

fn read_block_header(content: &[u8]) -> Result<BlockHeader, ParseError> {
    let mut cur = Cursor::new(content);
    let size: u16 = cur.read_le()?;
    let flags: u16 = cur.read_le()?;
    if (size as usize) < 4 || size as usize > content.len() {
        return Err(ParseError::MalformedBlock {
            kind: "block header",
            reason: format!("header size {size} out of range"),
        });
    }
    let (min_timestamp, max_timestamp) = if size >= 20 {
        (cur.read_le()?, cur.read_le()?)
    } else {
        (0, 0)
    };
    Ok(BlockHeader {
        size,
        flags: BlockFlags::from_bits_retain(flags),
        min_timestamp,
        max_timestamp,
    })
}

/// Walks the event blobs of a MetadataBlock or EventBlock, yielding each
/// resolved header plus a payload sub-slice. Carry state lives here: it is
/// zero-initialized per block and updated after every blob.
struct EventBlobIter<'a> {
    content: &'a [u8],
    cur: Cursor<&'a [u8]>,
    compressed: bool,
    carry: EventBlobHeader,
}

impl<'a> EventBlobIter<'a> {
    fn new(content: &'a [u8]) -> Result<Self, ParseError> {
        let header = read_block_header(content)?;
        let mut cur = Cursor::new(content);
        cur.set_position(header.size as u64);
        Ok(EventBlobIter {
            content,
            cur,
            compressed: header.compressed(),
            carry: EventBlobHeader::default(),
        })
    }

    fn next_blob(&mut self) -> Result<Option<(EventBlobHeader, &'a [u8])>, ParseError> {
        if self.cur.position() as usize >= self.content.len() {
            return Ok(None);
        }
        let blob_start = self.cur.position();
        let header = if self.compressed {
            parse_compressed_header(&mut self.cur, &mut self.carry)?
        } else {
            let header: EventBlobHeader = self.cur.read_le()?;
            self.carry = header.clone();
            header
        };
        let content = self.content;
        let payload_start = self.cur.position() as usize;
        let payload_end = payload_start
            .checked_add(header.payload_size as usize)
            .filter(|&end| end <= content.len())
            .ok_or(ParseError::UnexpectedEnd)?;
        let payload = &content[payload_start..payload_end];
        self.cur.set_position(payload_end as u64);
        if !self.compressed {
            // Fixed-layout events are padded to a 4-byte boundary relative
            // to their own start.
            let consumed = self.cur.position() - blob_start;
            let pad = (4 - consumed % 4) % 4;
            self.cur.set_position(self.cur.position() + pad);
        }
        Ok(Some((header, payload)))
    }
}

/// Resolves a compressed blob header against the previous one. Fields whose
/// flag bit is clear reuse the carried value; the timestamp delta is always
/// present.
fn parse_compressed_header(
    reader: &mut Cursor<&[u8]>,
    prev: &mut EventBlobHeader,
) -> Result<EventBlobHeader, ParseError> {
    let flags = BlobFlags::from_bits_retain(reader.read_le()?);

    let mut header = EventBlobHeader::default();
    header.metadata_id = if flags.contains(BlobFlags::METADATA_ID) {
        parse_varint_u32(reader)?
    } else {
        prev.metadata_id
    };
    if flags.contains(BlobFlags::SEQUENCE_INFO) {
        let delta = parse_varint_u32(reader)?;
        header.sequence_number = prev.sequence_number.wrapping_add(delta).wrapping_add(1);
        header.capture_thread_id = parse_varint_i64(reader)? as u64;
        header.processor_number = parse_varint_u32(reader)?;
    } else {
        header.sequence_number = prev.sequence_number;
        header.capture_thread_id = prev.capture_thread_id;
        header.processor_number = prev.processor_number;
        if header.metadata_id != 0 {
            header.sequence_number = prev.sequence_number.wrapping_add(1);
        }
    }
    header.thread_id = if flags.contains(BlobFlags::THREAD_ID) {
        parse_varint_i64(reader)? as u64
    } else {
        prev.thread_id
    };
    header.stack_id = if flags.contains(BlobFlags::STACK_ID) {
        parse_varint_u32(reader)?
    } else {
        prev.stack_id
    };
    header.timestamp = prev.timestamp.wrapping_add(parse_varint_u64(reader)?);
    if flags.contains(BlobFlags::ACTIVITY_ID) {
        skip_bytes(reader, 16);
    } else {
        header.activity_id = prev.activity_id;
    }
    if flags.contains(BlobFlags::RELATED_ACTIVITY_ID) {
        skip_bytes(reader, 16);
    } else {
        header.related_activity_id = prev.related_activity_id;
    }
    header.is_sorted = flags.contains(BlobFlags::SORTED);
    header.payload_size = if flags.contains(BlobFlags::PAYLOAD_SIZE) {
        parse_varint_u32(reader)?
    } else {
        prev.payload_size
    };
    header.raw_metadata_id = header.metadata_id | if header.is_sorted { 1 << 31 } else { 0 };

    *prev = header.clone();
    Ok(header)
}

// Saturating skip; a skip past the end is caught by the next bounds check.
fn skip_bytes(reader: &mut Cursor<&[u8]>, count: u64) {
    let pos = reader.position();
    reader.set_position(pos.saturating_add(count));
}

/// Parses the event-schema descriptor carried as a metadata pseudo-event
/// payload. The descriptor's own metadata id is authoritative and overrides
/// the one in the blob header.
fn parse_metadata_descriptor(payload: &[u8]) -> Result<EventSchema, ParseError> {
    let mut cur = Cursor::new(payload);
    let metadata_id: u32 = cur.read_le()?;
    let provider_name = read_utf16z(&mut cur)?;
    let event_id: u32 = cur.read_le()?;
    let event_name = read_utf16z(&mut cur)?;
    let keywords: u64 = cur.read_le()?;
    let version: u32 = cur.read_le()?;
    let level: u32 = cur.read_le()?;
    let fields = parse_field_block(&mut cur)?;
    let mut schema = EventSchema {
        metadata_id,
        provider_name,
        event_id,
        event_name,
        keywords,
        version,
        level,
        opcode: None,
        fields,
    };

    // V2 metadata appends tagged sections after the V1 descriptor.
    while (cur.position() as usize) < payload.len() {
        match parse_metadata_tag(&mut cur) {
            Ok(MetadataTag::OpCode(opcode)) => schema.opcode = Some(opcode),
            Ok(MetadataTag::FieldsV2(fields)) => {
                if schema.fields.is_empty() {
                    schema.fields = fields;
                }
            }
            Err(err) => {
                log::trace!("stopping at malformed metadata tag: {err}");
                break;
            }
        }
    }
    Ok(schema)
}

fn parse_field_block(cur: &mut Cursor<&[u8]>) -> Result<Vec<FieldSchema>, ParseError> {
    let count: u32 = cur.read_le()?;
    let mut fields = Vec::new();
    for _ in 0..count {
        let code: u32 = cur.read_le()?;
        let type_code =
            MetadataTypeCode::from_u32(code).ok_or_else(|| ParseError::MalformedPayload {
                event: "metadata descriptor",
                reason: format!("unknown field type code {code}"),
            })?;
        if type_code == MetadataTypeCode::Array {
            let _element_type_code: u32 = cur.read_le()?;
        }
        let name = read_utf16z(cur)?;
        fields.push(FieldSchema { type_code, name });
    }
    Ok(fields)
}

enum MetadataTag {
    OpCode(u8),
    FieldsV2(Vec<FieldSchema>),
}

fn parse_metadata_tag(cur: &mut Cursor<&[u8]>) -> Result<MetadataTag, ParseError> {
    let _size: u32 = cur.read_le()?;
    let tag: u8 = cur.read_le()?;
    match tag {
        1 => Ok(MetadataTag::OpCode(cur.read_le()?)),
        2 => Ok(MetadataTag::FieldsV2(parse_field_block(cur)?)),
        other => Err(ParseError::MalformedPayload {
            event: "metadata descriptor",
            reason: format!("unknown metadata tag {other}"),
        }),
    }
}
