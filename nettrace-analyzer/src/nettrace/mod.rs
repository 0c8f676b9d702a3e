//! On-wire types for the nettrace ("FastSerialization") container.
//!
//! Format reference:
//! https://github.com/microsoft/perfview/blob/main/src/TraceEvent/EventPipe/EventPipeFormat.md

use std::borrow::Cow;

use binrw::BinRead;
use bitflags::bitflags;
use num_derive::FromPrimitive;

pub mod parser;
pub use parser::EventPipeParser;

/// 32-bit length-prefixed ASCII string, used by the container layer for the
/// serialization banner and for type names.
#[derive(BinRead)]
#[br(little)]
pub struct NettraceString {
    #[br(assert(length <= 0x1000, "string length {} out of range", length))]
    length: u32,

    #[br(count = length)]
    bytes: Vec<u8>,
}

impl NettraceString {
    pub fn as_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }
}

impl std::fmt::Debug for NettraceString {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "\"{}\"", self.as_str())
    }
}

/// Object-stream tag values shared by both historical numbering schemes.
pub const TAG_NULL_REFERENCE: u8 = 1;
pub const TAG_BEGIN_OBJECT: u8 = 4;
pub const TAG_BEGIN_PRIVATE_OBJECT: u8 = 5;

/// The container has used two numbering schemes for the remaining tags.
/// The parser probes the first object and locks one of these for the rest
/// of the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagDialect {
    /// 2 = EndObject, 6 = Blob.
    Legacy,
    /// 2 = ObjectReference, 6 = EndObject, 14 = Blob.
    Modern,
}

impl TagDialect {
    pub fn end_object(self) -> u8 {
        match self {
            TagDialect::Legacy => 2,
            TagDialect::Modern => 6,
        }
    }
}

/// An in-band type definition discovered while walking the object stream.
/// The registry is append-only; back-references are dense indices into it.
#[derive(Debug, Clone)]
pub struct RegisteredType {
    pub version: u32,
    pub min_reader_version: u32,
    pub name: String,
}

/// Broken-down wall-clock sync time, interpreted as UTC.
#[derive(BinRead, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[br(little)]
pub struct NettraceTime {
    pub year: u16,
    pub month: u16,
    pub day_of_week: u16,
    pub day: u16,
    pub hour: u16,
    pub minute: u16,
    pub second: u16,
    pub millisecond: u16,
}

/// Payload of the `Trace` object. Created once per trace; the pointer size
/// fixes the width of every stack-address read that follows.
#[derive(BinRead, Debug, Clone, Copy, PartialEq, Eq)]
#[br(little)]
pub struct TraceInfo {
    pub sync_time_utc: NettraceTime,
    pub sync_time_qpc: u64,
    pub qpc_frequency: u64,
    pub pointer_size: u32,
    pub process_id: u32,
    pub number_of_processors: u32,
    pub cpu_sampling_rate: u32,
}

bitflags! {
    /// Flag word of the common block prologue. Bit 0 selects the
    /// compressed per-event header encoding.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BlockFlags: u16 {
        const COMPRESSED_HEADERS = 1;
    }
}

/// Common prologue of `MetadataBlock` and `EventBlock` content. Header
/// sizes beyond what we understand are skipped for forward compatibility.
#[derive(Debug, Clone, Copy)]
pub struct BlockHeader {
    pub size: u16,
    pub flags: BlockFlags,
    pub min_timestamp: u64,
    pub max_timestamp: u64,
}

impl BlockHeader {
    pub fn compressed(&self) -> bool {
        self.flags.contains(BlockFlags::COMPRESSED_HEADERS)
    }
}

bitflags! {
    /// Leading flags byte of a compressed event blob header. Each set bit
    /// replaces one carried-over field; clear bits reuse the previous
    /// event's value.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BlobFlags: u8 {
        const METADATA_ID         = 0x01;
        const SEQUENCE_INFO       = 0x02;
        const THREAD_ID           = 0x04;
        const STACK_ID            = 0x08;
        const ACTIVITY_ID         = 0x10;
        const RELATED_ACTIVITY_ID = 0x20;
        const SORTED              = 0x40;
        const PAYLOAD_SIZE        = 0x80;
    }
}

/// Per-event header. The uncompressed form is this exact wire layout; the
/// compressed form is reconstructed field by field against the previous
/// header (see `parser::parse_compressed_header`). Within a block the
/// fully-resolved header of event N is the carry state for event N+1.
#[derive(BinRead, Debug, Default, Clone, PartialEq, Eq)]
#[br(little)]
pub struct EventBlobHeader {
    pub size: u32,
    pub raw_metadata_id: u32, // high bit is the "sorted" marker
    pub sequence_number: u32,
    pub thread_id: u64,
    pub capture_thread_id: u64,
    pub processor_number: u32,
    pub stack_id: u32,
    pub timestamp: u64,
    pub activity_id: [u8; 16],
    pub related_activity_id: [u8; 16],
    pub payload_size: u32,

    #[br(calc = raw_metadata_id & 0x7fff_ffff)]
    pub metadata_id: u32,
    #[br(calc = raw_metadata_id & 0x8000_0000 != 0)]
    pub is_sorted: bool,
}

/// Field type codes used by metadata descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum MetadataTypeCode {
    Empty = 0,
    Object = 1,
    DbNull = 2,
    Boolean = 3,
    Char = 4,
    SByte = 5,
    Byte = 6,
    Int16 = 7,
    UInt16 = 8,
    Int32 = 9,
    UInt32 = 10,
    Int64 = 11,
    UInt64 = 12,
    Single = 13,
    Double = 14,
    Decimal = 15,
    DateTime = 16,
    Guid = 17,
    String = 18,
    Array = 19,
}

/// One declared payload field of an event schema. Array fields carry a
/// subordinate element type code on the wire; it is consumed but not
/// retained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSchema {
    pub type_code: MetadataTypeCode,
    pub name: String,
}

/// A decoded metadata descriptor: names an event and declares its payload
/// layout. Events refer to it by `metadata_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSchema {
    pub metadata_id: u32,
    pub provider_name: String,
    pub event_id: u32,
    pub event_name: String,
    pub keywords: u64,
    pub version: u32,
    pub level: u32,
    pub opcode: Option<u8>,
    pub fields: Vec<FieldSchema>,
}
