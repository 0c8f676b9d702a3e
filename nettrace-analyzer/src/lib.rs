//! Reader and analyzer for the .NET EventPipe trace format ("nettrace").
//!
//! A fully buffered trace goes in through [`parse`]; out comes a frozen
//! [`ParseResult`] with the trace header, event schemas, stacks, JIT method
//! ranges, per-type allocation aggregates, CPU method profiles, and CPU and
//! allocation flame-graph trees. Malformed sections are skipped and
//! reported in [`ParseResult::errors`] without aborting the parse.
//!
//! Format reference:
//! https://github.com/microsoft/perfview/blob/main/src/TraceEvent/EventPipe/EventPipeFormat.md

mod error;
mod helpers;

pub mod analysis;
pub mod coreclr;
pub mod nettrace;

pub use analysis::{
    AllocationEvent, AllocationInfo, AllocationSamples, FlameGraph, FlameNode, MethodProfile,
    MethodRecord, MethodTable, ParseResult, TypeCounts,
};
pub use error::ParseError;
pub use nettrace::{EventSchema, FieldSchema, TraceInfo};

/// Decodes a complete nettrace byte stream into the analytical model.
pub fn parse(bytes: &[u8]) -> ParseResult {
    nettrace::EventPipeParser::parse(bytes)
}
