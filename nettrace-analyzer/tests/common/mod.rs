#![allow(dead_code)]

//! Synthetic little-endian nettrace writer used by the integration tests.
//! Layouts mirror the on-wire types in `src/nettrace/mod.rs`.

/// Chainable byte-buffer builder.
pub struct Bytes(Vec<u8>);

impl Bytes {
    pub fn new() -> Self {
        Bytes(Vec::new())
    }

    pub fn u8(mut self, v: u8) -> Self {
        self.0.push(v);
        self
    }

    pub fn u16(mut self, v: u16) -> Self {
        self.0.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn u32(mut self, v: u32) -> Self {
        self.0.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn u64(mut self, v: u64) -> Self {
        self.0.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn varint(mut self, mut v: u64) -> Self {
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v != 0 {
                self.0.push(byte | 0x80);
            } else {
                self.0.push(byte);
                return self;
            }
        }
    }

    pub fn utf16z(mut self, s: &str) -> Self {
        for unit in s.encode_utf16() {
            self.0.extend_from_slice(&unit.to_le_bytes());
        }
        self.0.extend_from_slice(&[0, 0]);
        self
    }

    pub fn raw(mut self, bytes: &[u8]) -> Self {
        self.0.extend_from_slice(bytes);
        self
    }

    /// Pads with zeros to `align` relative to the start of this buffer.
    pub fn pad_to(mut self, align: usize) -> Self {
        while self.0.len() % align != 0 {
            self.0.push(0);
        }
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.0
    }
}

const TAG_NULL_REFERENCE: u8 = 1;
const TAG_BEGIN_PRIVATE_OBJECT: u8 = 5;

/// Emits a complete trace byte stream: magic, serialization banner, then
/// tagged objects. Repeated type names become registry back-references,
/// as a real writer produces.
pub struct TraceWriter {
    buf: Vec<u8>,
    end_tag: u8,
    types: Vec<String>,
}

impl TraceWriter {
    pub fn new() -> Self {
        Self::with_end_object_tag(6)
    }

    /// `end_tag` 6 writes the modern tag numbering, 2 the legacy one.
    pub fn with_end_object_tag(end_tag: u8) -> Self {
        let mut buf = b"Nettrace".to_vec();
        buf.extend_from_slice(&20u32.to_le_bytes());
        buf.extend_from_slice(b"!FastSerialization.1");
        TraceWriter {
            buf,
            end_tag,
            types: Vec::new(),
        }
    }

    pub fn raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn begin_object(&mut self, name: &str) {
        self.buf.push(TAG_BEGIN_PRIVATE_OBJECT);
        self.buf.push(TAG_BEGIN_PRIVATE_OBJECT);
        // Index 1 cannot be back-referenced: its varint byte collides with
        // the NullReference tag, which readers check first. Re-emit the
        // definition in that case (and mirror the reader's append-only
        // registry by registering it again).
        match self.types.iter().position(|t| t == name) {
            Some(index) if index != 1 => {
                self.raw(&Bytes::new().varint(index as u64).build());
            }
            _ => {
                self.buf.push(TAG_NULL_REFERENCE);
                self.raw(&4u32.to_le_bytes()); // version
                self.raw(&4u32.to_le_bytes()); // min reader version
                self.raw(&(name.len() as u32).to_le_bytes());
                self.raw(name.as_bytes());
                self.types.push(name.to_string());
            }
        }
        self.buf.push(self.end_tag); // closes the type object
    }

    pub fn end_object(&mut self) {
        self.buf.push(self.end_tag);
    }

    pub fn object(&mut self, name: &str, payload: &[u8]) {
        self.begin_object(name);
        self.raw(payload);
        self.end_object();
    }

    /// Block payload framing: 32-bit content size, zero padding to the
    /// file's 4-byte grid, then the content.
    pub fn block(&mut self, name: &str, content: &[u8]) {
        self.begin_object(name);
        self.raw(&(content.len() as u32).to_le_bytes());
        while self.buf.len() % 4 != 0 {
            self.buf.push(0);
        }
        self.raw(content);
        self.end_object();
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.buf.push(TAG_NULL_REFERENCE);
        self.buf
    }
}

pub fn trace_payload_with_pointer_size(pointer_size: u32) -> Vec<u8> {
    Bytes::new()
        .u16(2025) // year
        .u16(11) // month
        .u16(6) // day of week
        .u16(29) // day
        .u16(16)
        .u16(26)
        .u16(8)
        .u16(0) // milliseconds
        .u64(1_000_000) // sync time qpc
        .u64(10_000_000) // qpc frequency
        .u32(pointer_size)
        .u32(42) // process id
        .u32(8) // processor count
        .u32(1) // cpu sampling rate
        .build()
}

pub fn trace_payload() -> Vec<u8> {
    trace_payload_with_pointer_size(8)
}

/// Schema descriptor with no fields.
pub fn metadata_descriptor(id: u32, provider: &str, event_id: u32) -> Vec<u8> {
    Bytes::new()
        .u32(id)
        .utf16z(provider)
        .u32(event_id)
        .utf16z("")
        .u64(0) // keywords
        .u32(2) // version
        .u32(4) // level
        .u32(0) // field count
        .build()
}

/// MetadataBlock content: 20-byte block header (compressed headers), then
/// one compressed pseudo-event per descriptor.
pub fn metadata_block(descriptors: &[Vec<u8>]) -> Vec<u8> {
    let mut b = Bytes::new().u16(20).u16(1).u64(0).u64(0);
    for descriptor in descriptors {
        // flags 0x80: only the payload size is explicit; the always-present
        // timestamp delta precedes it.
        b = b
            .u8(0x80)
            .varint(1)
            .varint(descriptor.len() as u64)
            .raw(descriptor);
    }
    b.build()
}

/// EventBlock content with compressed headers; events are pre-encoded.
pub fn event_block(events: &[Vec<u8>]) -> Vec<u8> {
    let mut b = Bytes::new().u16(20).u16(1).u64(0).u64(0);
    for event in events {
        b = b.raw(event);
    }
    b.build()
}

/// EventBlock content in the fixed-layout (uncompressed) encoding.
pub fn event_block_uncompressed(events: &[Vec<u8>]) -> Vec<u8> {
    let mut b = Bytes::new().u16(20).u16(0).u64(0).u64(0);
    for event in events {
        b = b.raw(event);
    }
    b.build()
}

/// One compressed event carrying explicit metadata id, stack id, timestamp
/// delta and payload size (flag bits 0x01 | 0x08 | 0x80).
pub fn compressed_event(metadata_id: u32, stack_id: u32, ts_delta: u64, payload: &[u8]) -> Vec<u8> {
    Bytes::new()
        .u8(0x89)
        .varint(metadata_id as u64)
        .varint(stack_id as u64)
        .varint(ts_delta)
        .varint(payload.len() as u64)
        .raw(payload)
        .build()
}

/// One fixed-layout event, padded to a 4-byte boundary relative to its
/// own start.
pub fn uncompressed_event(metadata_id: u32, stack_id: u32, timestamp: u64, payload: &[u8]) -> Vec<u8> {
    Bytes::new()
        .u32(76 + payload.len() as u32) // event size
        .u32(metadata_id)
        .u32(1) // sequence number
        .u64(7) // thread id
        .u64(7) // capture thread id
        .u32(0) // processor number
        .u32(stack_id)
        .u64(timestamp)
        .raw(&[0; 16]) // activity id
        .raw(&[0; 16]) // related activity id
        .u32(payload.len() as u32)
        .raw(payload)
        .pad_to(4)
        .build()
}

/// StackBlock content with 64-bit addresses.
pub fn stack_block(first_id: u32, stacks: &[&[u64]]) -> Vec<u8> {
    let mut b = Bytes::new().u32(first_id).u32(stacks.len() as u32);
    for stack in stacks {
        b = b.u32((stack.len() * 8) as u32);
        for &address in *stack {
            b = b.u64(address);
        }
    }
    b.build()
}

/// GCAllocationTick payload, version 2 shape (64-bit amount + type id +
/// type name).
pub fn allocation_payload(amount: u32, amount64: u64, type_name: &str) -> Vec<u8> {
    Bytes::new()
        .u32(amount)
        .u32(0) // allocation kind
        .u16(0) // clr instance id
        .u64(amount64)
        .u64(0xdead_0000) // type id, skipped by the reader
        .utf16z(type_name)
        .build()
}

/// MethodLoadVerbose payload.
pub fn method_load_payload(
    method_id: u64,
    start_address: u64,
    size: u32,
    namespace: &str,
    name: &str,
) -> Vec<u8> {
    Bytes::new()
        .u64(method_id)
        .u64(1) // module id
        .u64(start_address)
        .u32(size)
        .u32(0x0600_0001) // method token
        .u32(0) // method flags
        .utf16z(namespace)
        .utf16z(name)
        .utf16z("instance void ()")
        .u16(0) // trailing clr instance id
        .build()
}

/// MethodJittingStarted payload.
pub fn jit_started_payload(method_id: u64, namespace: &str, name: &str) -> Vec<u8> {
    Bytes::new()
        .u64(method_id)
        .u64(1) // module id
        .u32(0x0600_0002) // method token
        .u32(64) // il size
        .utf16z(namespace)
        .utf16z(name)
        .utf16z("instance void ()")
        .build()
}
