use super::events::{
    CoreClrEvent, GcAllocationTickEvent, MethodJittingStartedEvent, MethodLoadUnloadEvent,
};
use crate::error::ParseError;
use crate::nettrace::EventSchema;

pub const DOTNET_RUNTIME_PROVIDER: &str = "Microsoft-Windows-DotNETRuntime";
pub const DOTNET_RUNTIME_RUNDOWN_PROVIDER: &str = "Microsoft-Windows-DotNETRuntimeRundown";
pub const SAMPLE_PROFILER_PROVIDER: &str = "Microsoft-DotNETCore-SampleProfiler";

pub const GC_ALLOCATION_TICK: u32 = 10;
pub const METHOD_LOAD_VERBOSE: u32 = 143;
pub const METHOD_JITTING_STARTED: u32 = 145;
pub const METHOD_DC_END_VERBOSE: u32 = 144;

/// The recognized (provider, event id) pairs. Classification happens once
/// per schema; the per-event hot path only switches on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnownEvent {
    GcAllocationTick,
    MethodLoadVerbose,
    MethodJittingStarted,
    MethodDcEndVerbose,
    SampleProfilerTick,
}

pub fn classify_event(schema: &EventSchema) -> Option<KnownEvent> {
    match schema.provider_name.as_str() {
        DOTNET_RUNTIME_PROVIDER => match schema.event_id {
            GC_ALLOCATION_TICK => Some(KnownEvent::GcAllocationTick),
            METHOD_LOAD_VERBOSE => Some(KnownEvent::MethodLoadVerbose),
            METHOD_JITTING_STARTED => Some(KnownEvent::MethodJittingStarted),
            _ => None,
        },
        DOTNET_RUNTIME_RUNDOWN_PROVIDER => match schema.event_id {
            // Same layout as MethodLoadVerbose.
            METHOD_DC_END_VERBOSE => Some(KnownEvent::MethodDcEndVerbose),
            _ => None,
        },
        // Every sample-profiler event is one CPU sample for its stack.
        SAMPLE_PROFILER_PROVIDER => Some(KnownEvent::SampleProfilerTick),
        _ => None,
    }
}

pub enum DecodedEvent {
    CoreClr(CoreClrEvent),
    CpuSample,
}

pub fn decode_event(
    kind: KnownEvent,
    payload: &[u8],
    pointer_size: u32,
) -> Result<DecodedEvent, ParseError> {
    match kind {
        KnownEvent::GcAllocationTick => GcAllocationTickEvent::parse(payload, pointer_size)
            .map(|ev| DecodedEvent::CoreClr(CoreClrEvent::GcAllocationTick(ev))),
        KnownEvent::MethodLoadVerbose => MethodLoadUnloadEvent::parse(payload)
            .map(|ev| DecodedEvent::CoreClr(CoreClrEvent::MethodLoad(ev))),
        KnownEvent::MethodDcEndVerbose => MethodLoadUnloadEvent::parse(payload)
            .map(|ev| DecodedEvent::CoreClr(CoreClrEvent::MethodDCEnd(ev))),
        KnownEvent::MethodJittingStarted => MethodJittingStartedEvent::parse(payload)
            .map(|ev| DecodedEvent::CoreClr(CoreClrEvent::MethodJittingStarted(ev))),
        KnownEvent::SampleProfilerTick => Ok(DecodedEvent::CpuSample),
    }
}
