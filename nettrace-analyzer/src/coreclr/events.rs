use std::io::{Cursor, Seek, SeekFrom};

use binrw::{BinRead, BinReaderExt, BinResult};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;

use crate::error::ParseError;
use crate::helpers::read_utf16z;

#[binrw::parser(reader)]
fn parse_null_wide_string_to_string() -> BinResult<String> {
    read_utf16z(reader)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum GcAllocationKind {
    Small = 0,
    Large = 1,
    Pinned = 2,
}

/// GC allocation tick. The event has four versions with additive fields,
/// so the payload is parsed defensively by remaining-bytes checks rather
/// than by version number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcAllocationTickEvent {
    pub allocation_amount: u32,
    pub allocation_kind_raw: u32,
    pub clr_instance_id: u16,
    pub allocation_amount64: Option<u64>,
    pub type_name: String,
}

impl GcAllocationTickEvent {
    pub fn kind(&self) -> Option<GcAllocationKind> {
        GcAllocationKind::from_u32(self.allocation_kind_raw)
    }

    /// Size to account for: the 64-bit amount overrides the 32-bit one
    /// when present.
    pub fn size(&self) -> u64 {
        self.allocation_amount64
            .unwrap_or(self.allocation_amount as u64)
    }

    pub fn parse(payload: &[u8], pointer_size: u32) -> Result<Self, ParseError> {
        let mut cur = Cursor::new(payload);
        let short = |what: &str| ParseError::MalformedPayload {
            event: "GCAllocationTick",
            reason: format!("payload too short for {what}"),
        };
        let allocation_amount: u32 = cur.read_le().map_err(|_| short("allocation amount"))?;
        let allocation_kind_raw: u32 = cur.read_le().map_err(|_| short("allocation kind"))?;
        let clr_instance_id: u16 = cur.read_le().map_err(|_| short("CLR instance id"))?;

        let remaining = |cur: &Cursor<&[u8]>| payload.len() as u64 - cur.position();

        let allocation_amount64 = if remaining(&cur) >= 8 {
            Some(cur.read_le().map_err(|_| short("64-bit amount"))?)
        } else {
            None
        };
        if remaining(&cur) >= pointer_size as u64 {
            // type id, a raw pointer we have no use for
            cur.seek(SeekFrom::Current(pointer_size as i64))
                .map_err(|_| short("type id"))?;
        }
        let mut type_name = if remaining(&cur) > 0 {
            read_utf16z(&mut cur).map_err(|_| short("type name"))?
        } else {
            String::new()
        };
        if type_name.is_empty() {
            type_name = "<unknown>".to_string();
        }

        Ok(GcAllocationTickEvent {
            allocation_amount,
            allocation_kind_raw,
            clr_instance_id,
            allocation_amount64,
            type_name,
        })
    }
}

/// MethodLoadVerbose / MethodDCEndVerbose payload. The trailing CLR
/// instance id (and the rejit id of newer versions) is ignored.
#[derive(BinRead, Debug, Clone, PartialEq, Eq)]
#[br(little)]
pub struct MethodLoadUnloadEvent {
    pub method_id: u64,
    pub module_id: u64,
    pub method_start_address: u64,
    pub method_size: u32,
    pub method_token: u32,
    pub method_flags: u32,
    #[br(parse_with = parse_null_wide_string_to_string)]
    pub method_namespace: String,
    #[br(parse_with = parse_null_wide_string_to_string)]
    pub method_name: String,
    #[br(parse_with = parse_null_wide_string_to_string)]
    pub method_signature: String,
}

impl MethodLoadUnloadEvent {
    pub fn parse(payload: &[u8]) -> Result<Self, ParseError> {
        Self::read_le(&mut Cursor::new(payload)).map_err(|err| ParseError::MalformedPayload {
            event: "MethodLoadVerbose",
            reason: err.to_string(),
        })
    }
}

/// MethodJittingStarted payload. Carries no code address or native size,
/// so it only contributes a name for methods never seen in a load event.
#[derive(BinRead, Debug, Clone, PartialEq, Eq)]
#[br(little)]
pub struct MethodJittingStartedEvent {
    pub method_id: u64,
    pub module_id: u64,
    pub method_token: u32,
    pub method_il_size: u32,
    #[br(parse_with = parse_null_wide_string_to_string)]
    pub method_namespace: String,
    #[br(parse_with = parse_null_wide_string_to_string)]
    pub method_name: String,
    #[br(parse_with = parse_null_wide_string_to_string)]
    pub method_signature: String,
}

impl MethodJittingStartedEvent {
    pub fn parse(payload: &[u8]) -> Result<Self, ParseError> {
        Self::read_le(&mut Cursor::new(payload)).map_err(|err| ParseError::MalformedPayload {
            event: "MethodJittingStarted",
            reason: err.to_string(),
        })
    }
}

pub enum CoreClrEvent {
    GcAllocationTick(GcAllocationTickEvent),
    MethodLoad(MethodLoadUnloadEvent),
    MethodDCEnd(MethodLoadUnloadEvent),
    MethodJittingStarted(MethodJittingStartedEvent),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utf16z(s: &str) -> Vec<u8> {
        let mut out = Vec::new();
        for unit in s.encode_utf16() {
            out.extend_from_slice(&unit.to_le_bytes());
        }
        out.extend_from_slice(&[0, 0]);
        out
    }

    #[test]
    fn allocation_tick_full_payload() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&64u32.to_le_bytes());
        payload.extend_from_slice(&0u32.to_le_bytes());
        payload.extend_from_slice(&0u16.to_le_bytes());
        payload.extend_from_slice(&128u64.to_le_bytes());
        payload.extend_from_slice(&0xdead_beefu64.to_le_bytes()); // type id
        payload.extend_from_slice(&utf16z("MyType"));

        let ev = GcAllocationTickEvent::parse(&payload, 8).unwrap();
        assert_eq!(ev.allocation_amount, 64);
        assert_eq!(ev.allocation_amount64, Some(128));
        assert_eq!(ev.size(), 128);
        assert_eq!(ev.type_name, "MyType");
        assert_eq!(ev.kind(), Some(GcAllocationKind::Small));
    }

    #[test]
    fn allocation_tick_v1_payload_has_no_wide_amount() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&96u32.to_le_bytes());
        payload.extend_from_slice(&1u32.to_le_bytes());
        payload.extend_from_slice(&7u16.to_le_bytes());

        let ev = GcAllocationTickEvent::parse(&payload, 8).unwrap();
        assert_eq!(ev.allocation_amount64, None);
        assert_eq!(ev.size(), 96);
        assert_eq!(ev.type_name, "<unknown>");
        assert_eq!(ev.kind(), Some(GcAllocationKind::Large));
    }

    #[test]
    fn allocation_tick_too_short_is_err() {
        let payload = 64u32.to_le_bytes();
        assert!(GcAllocationTickEvent::parse(&payload, 8).is_err());
    }

    #[test]
    fn method_load_verbose_roundtrip() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&0x10u64.to_le_bytes());
        payload.extend_from_slice(&0x20u64.to_le_bytes());
        payload.extend_from_slice(&0x1000u64.to_le_bytes());
        payload.extend_from_slice(&0x100u32.to_le_bytes());
        payload.extend_from_slice(&0x0600_0001u32.to_le_bytes());
        payload.extend_from_slice(&0u32.to_le_bytes());
        payload.extend_from_slice(&utf16z("NS"));
        payload.extend_from_slice(&utf16z("Foo"));
        payload.extend_from_slice(&utf16z("void ()"));
        payload.extend_from_slice(&0u16.to_le_bytes()); // trailing CLR instance id

        let ev = MethodLoadUnloadEvent::parse(&payload).unwrap();
        assert_eq!(ev.method_id, 0x10);
        assert_eq!(ev.method_start_address, 0x1000);
        assert_eq!(ev.method_size, 0x100);
        assert_eq!(ev.method_namespace, "NS");
        assert_eq!(ev.method_name, "Foo");
        assert_eq!(ev.method_signature, "void ()");
    }
}
