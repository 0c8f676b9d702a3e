//! Aggregation over the decoded event stream and the post-pass that turns
//! the raw tables into profiles and flame graphs.

use std::collections::{BTreeSet, HashMap};

pub mod flame;
pub mod methods;

pub use flame::{FlameGraph, FlameNode};
pub use methods::{MethodRecord, MethodTable};

use crate::coreclr::{self, CoreClrEvent, GcAllocationTickEvent, KnownEvent};
use crate::nettrace::{EventSchema, TraceInfo};

/// A count/size pair, used for per-type breakdowns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TypeCounts {
    pub count: u64,
    pub size: u64,
}

/// One GC allocation tick, kept for drill-down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationEvent {
    pub type_name: String,
    pub size: u64,
    pub timestamp: u64,
    pub stack_id: u32,
    /// Raw stack addresses as hex strings, filled in by the post-pass when
    /// the stack id is known.
    pub stack: Option<Vec<String>>,
}

/// Per-type allocation aggregate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationInfo {
    pub type_name: String,
    pub count: u64,
    pub total_size: u64,
    pub events: Vec<AllocationEvent>,
}

/// Per-stack allocation aggregate with its per-type breakdown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationSamples {
    pub count: u64,
    pub total_size: u64,
    pub types: HashMap<String, TypeCounts>,
}

/// Inclusive/exclusive CPU profile of one method, keyed by full name.
/// Estimated times are `count × sampling interval`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MethodProfile {
    pub inclusive_count: u64,
    pub exclusive_count: u64,
    pub inclusive_time_ms: f64,
    pub exclusive_time_ms: f64,
}

/// The frozen analytical model of one trace. Tables hold whatever was
/// recovered; `errors` enumerates everything that had to be skipped.
#[derive(Debug, Default)]
pub struct ParseResult {
    pub trace: Option<TraceInfo>,
    /// Event schemas by metadata id.
    pub schemas: HashMap<u32, EventSchema>,
    /// Per-type allocation aggregates by type name.
    pub allocations: HashMap<String, AllocationInfo>,
    /// Stack address lists by stack id, top of stack first.
    pub stacks: HashMap<u32, Vec<u64>>,
    /// JIT-compiled methods by id, with an address interval index.
    pub methods: MethodTable,
    /// CPU profiles by method full name.
    pub method_profiles: HashMap<String, MethodProfile>,
    /// Per-stack allocation aggregates by stack id.
    pub allocation_samples: HashMap<u32, AllocationSamples>,
    /// Reverse index: type name to the stacks that allocated it.
    pub type_stacks: HashMap<String, HashMap<u32, TypeCounts>>,
    /// CPU sample counts by stack id.
    pub cpu_samples: HashMap<u32, u64>,
    /// Event counts keyed `"provider:eventId"`, or `"unknown:<metadataId>"`
    /// for events whose metadata never resolved.
    pub event_counts: HashMap<String, u64>,
    pub total_event_count: u64,
    pub allocation_event_count: u64,
    /// Provider names seen in metadata, sorted.
    pub providers: BTreeSet<String>,
    pub cpu_flame: FlameGraph,
    pub allocation_flame: FlameGraph,
    pub errors: Vec<String>,
}

/// Mutable counterpart of [`ParseResult`], owned by the parser for the
/// duration of the decode. `finish` runs the post-pass and freezes it.
#[derive(Default)]
pub(crate) struct Aggregates {
    trace: Option<TraceInfo>,
    schemas: HashMap<u32, EventSchema>,
    known: HashMap<u32, KnownEvent>,
    stacks: HashMap<u32, Vec<u64>>,
    methods: MethodTable,
    allocations: HashMap<String, AllocationInfo>,
    allocation_samples: HashMap<u32, AllocationSamples>,
    type_stacks: HashMap<String, HashMap<u32, TypeCounts>>,
    cpu_samples: HashMap<u32, u64>,
    events_by_metadata: HashMap<u32, u64>,
    providers: BTreeSet<String>,
    total_event_count: u64,
    allocation_event_count: u64,
    errors: Vec<String>,
}

impl Aggregates {
    pub(crate) fn new() -> Self {
        Aggregates::default()
    }

    pub(crate) fn set_trace(&mut self, info: TraceInfo) {
        if self.trace.is_some() {
            log::warn!("ignoring second Trace object");
            return;
        }
        self.trace = Some(info);
    }

    /// Width of stack-address reads. Stacks decoded before any Trace
    /// object assume 8-byte pointers.
    pub(crate) fn pointer_size(&self) -> u32 {
        self.trace.map(|t| t.pointer_size).unwrap_or(8)
    }

    pub(crate) fn record_schema(&mut self, schema: EventSchema) {
        match coreclr::classify_event(&schema) {
            Some(kind) => {
                self.known.insert(schema.metadata_id, kind);
            }
            None => {
                self.known.remove(&schema.metadata_id);
            }
        }
        self.providers.insert(schema.provider_name.clone());
        self.schemas.insert(schema.metadata_id, schema);
    }

    pub(crate) fn known_kind(&self, metadata_id: u32) -> Option<KnownEvent> {
        self.known.get(&metadata_id).copied()
    }

    pub(crate) fn record_stack(&mut self, stack_id: u32, addresses: Vec<u64>) {
        self.stacks.insert(stack_id, addresses);
    }

    pub(crate) fn count_event(&mut self, metadata_id: u32) {
        self.total_event_count += 1;
        *self.events_by_metadata.entry(metadata_id).or_default() += 1;
    }

    pub(crate) fn record_cpu_sample(&mut self, stack_id: u32) {
        *self.cpu_samples.entry(stack_id).or_default() += 1;
    }

    pub(crate) fn record_coreclr(&mut self, event: CoreClrEvent, timestamp: u64, stack_id: u32) {
        match event {
            CoreClrEvent::GcAllocationTick(ev) => self.record_allocation(ev, timestamp, stack_id),
            CoreClrEvent::MethodLoad(ev) | CoreClrEvent::MethodDCEnd(ev) => {
                self.methods.insert_load(MethodRecord {
                    method_id: ev.method_id,
                    module_id: ev.module_id,
                    start_address: ev.method_start_address,
                    size: ev.method_size,
                    token: ev.method_token,
                    flags: ev.method_flags,
                    namespace: ev.method_namespace,
                    name: ev.method_name,
                    signature: ev.method_signature,
                });
            }
            CoreClrEvent::MethodJittingStarted(ev) => {
                self.methods.insert_jit_started(MethodRecord {
                    method_id: ev.method_id,
                    module_id: ev.module_id,
                    start_address: 0,
                    size: 0,
                    token: ev.method_token,
                    flags: 0,
                    namespace: ev.method_namespace,
                    name: ev.method_name,
                    signature: ev.method_signature,
                });
            }
        }
    }

    fn record_allocation(&mut self, event: GcAllocationTickEvent, timestamp: u64, stack_id: u32) {
        self.allocation_event_count += 1;
        let size = event.size();
        let type_name = event.type_name;

        let info = self
            .allocations
            .entry(type_name.clone())
            .or_insert_with(|| AllocationInfo {
                type_name: type_name.clone(),
                ..Default::default()
            });
        info.count += 1;
        info.total_size += size;
        info.events.push(AllocationEvent {
            type_name: type_name.clone(),
            size,
            timestamp,
            stack_id,
            stack: None,
        });

        if stack_id > 0 {
            let samples = self.allocation_samples.entry(stack_id).or_default();
            samples.count += 1;
            samples.total_size += size;
            let per_type = samples.types.entry(type_name.clone()).or_default();
            per_type.count += 1;
            per_type.size += size;

            let reverse = self
                .type_stacks
                .entry(type_name)
                .or_default()
                .entry(stack_id)
                .or_default();
            reverse.count += 1;
            reverse.size += size;
        }
    }

    pub(crate) fn push_error(&mut self, message: String) {
        self.errors.push(message);
    }

    pub(crate) fn finish(mut self) -> ParseResult {
        self.methods.build_address_index();

        let mut event_counts: HashMap<String, u64> = HashMap::new();
        for (metadata_id, count) in &self.events_by_metadata {
            let key = match self.schemas.get(metadata_id) {
                Some(schema) => format!("{}:{}", schema.provider_name, schema.event_id),
                None => format!("unknown:{metadata_id}"),
            };
            *event_counts.entry(key).or_default() += count;
        }

        for info in self.allocations.values_mut() {
            for event in &mut info.events {
                if event.stack_id > 0 {
                    if let Some(addresses) = self.stacks.get(&event.stack_id) {
                        event.stack =
                            Some(addresses.iter().map(|a| format!("{a:#x}")).collect());
                    }
                }
            }
        }

        let method_profiles =
            compute_method_profiles(&self.cpu_samples, &self.stacks, &self.methods, self.trace);
        let cpu_flame = flame::build_cpu_flame(&self.stacks, &self.methods);
        let allocation_flame =
            flame::build_allocation_flame(&self.stacks, &self.allocation_samples, &self.methods);

        ParseResult {
            trace: self.trace,
            schemas: self.schemas,
            allocations: self.allocations,
            stacks: self.stacks,
            methods: self.methods,
            method_profiles,
            allocation_samples: self.allocation_samples,
            type_stacks: self.type_stacks,
            cpu_samples: self.cpu_samples,
            event_counts,
            total_event_count: self.total_event_count,
            allocation_event_count: self.allocation_event_count,
            providers: self.providers,
            cpu_flame,
            allocation_flame,
            errors: self.errors,
        }
    }
}

/// Exclusive credit goes to the top-of-stack frame only; inclusive credit
/// goes to each distinct method anywhere on the stack, at most once per
/// stack visit.
fn compute_method_profiles(
    cpu_samples: &HashMap<u32, u64>,
    stacks: &HashMap<u32, Vec<u64>>,
    methods: &MethodTable,
    trace: Option<TraceInfo>,
) -> HashMap<String, MethodProfile> {
    let interval_ms = trace
        .map(|t| t.cpu_sampling_rate)
        .filter(|&rate| rate > 0)
        .map(|rate| rate as f64)
        .unwrap_or(1.0);

    let mut profiles: HashMap<String, MethodProfile> = HashMap::new();
    for (stack_id, &count) in cpu_samples {
        let Some(addresses) = stacks.get(stack_id) else {
            continue;
        };
        let resolved: Vec<String> = addresses.iter().map(|&a| methods.resolve(a)).collect();
        let Some(top) = resolved.first() else {
            continue;
        };
        profiles.entry(top.clone()).or_default().exclusive_count += count;

        let distinct: BTreeSet<&String> = resolved.iter().collect();
        for name in distinct {
            profiles.entry(name.clone()).or_default().inclusive_count += count;
        }
    }
    for profile in profiles.values_mut() {
        profile.inclusive_time_ms = profile.inclusive_count as f64 * interval_ms;
        profile.exclusive_time_ms = profile.exclusive_count as f64 * interval_ms;
    }
    profiles
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_aggregates_by_type_and_stack() {
        let mut agg = Aggregates::new();
        agg.record_stack(1, vec![0x10, 0x20]);
        let event = |size: u64| GcAllocationTickEvent {
            allocation_amount: size as u32,
            allocation_kind_raw: 0,
            clr_instance_id: 0,
            allocation_amount64: Some(size),
            type_name: "MyType".to_string(),
        };
        agg.record_allocation(event(100), 10, 1);
        agg.record_allocation(event(28), 20, 1);

        let result = agg.finish();
        let info = &result.allocations["MyType"];
        assert_eq!(info.count, 2);
        assert_eq!(info.total_size, 128);
        assert_eq!(info.events.len(), 2);
        assert_eq!(
            info.total_size,
            info.events.iter().map(|e| e.size).sum::<u64>()
        );
        assert_eq!(
            info.events[0].stack.as_deref(),
            Some(&["0x10".to_string(), "0x20".to_string()][..])
        );

        let samples = &result.allocation_samples[&1];
        assert_eq!(samples.count, 2);
        assert_eq!(samples.total_size, 128);
        assert_eq!(samples.types["MyType"], TypeCounts { count: 2, size: 128 });
        assert_eq!(
            result.type_stacks["MyType"][&1],
            TypeCounts { count: 2, size: 128 }
        );
    }

    #[test]
    fn stackless_allocation_skips_stack_tables() {
        let mut agg = Aggregates::new();
        agg.record_allocation(
            GcAllocationTickEvent {
                allocation_amount: 64,
                allocation_kind_raw: 0,
                clr_instance_id: 0,
                allocation_amount64: None,
                type_name: "T".to_string(),
            },
            0,
            0,
        );
        let result = agg.finish();
        assert_eq!(result.allocations["T"].count, 1);
        assert!(result.allocation_samples.is_empty());
        assert!(result.type_stacks.is_empty());
    }

    #[test]
    fn profiles_split_inclusive_and_exclusive() {
        let mut agg = Aggregates::new();
        // 0x10 on top of 0x20; 0x20 alone. 3 samples on the first stack,
        // 1 on the second.
        agg.record_stack(1, vec![0x10, 0x20]);
        agg.record_stack(2, vec![0x20]);
        agg.record_cpu_sample(1);
        agg.record_cpu_sample(1);
        agg.record_cpu_sample(1);
        agg.record_cpu_sample(2);

        let result = agg.finish();
        let top = &result.method_profiles["0x10"];
        assert_eq!(top.inclusive_count, 3);
        assert_eq!(top.exclusive_count, 3);
        let caller = &result.method_profiles["0x20"];
        assert_eq!(caller.inclusive_count, 4);
        assert_eq!(caller.exclusive_count, 1);
        for profile in result.method_profiles.values() {
            assert!(profile.exclusive_count <= profile.inclusive_count);
        }
        // no trace object: 1 ms per sample
        assert_eq!(caller.inclusive_time_ms, 4.0);
    }

    #[test]
    fn recursive_stack_counts_method_once() {
        let mut agg = Aggregates::new();
        agg.record_stack(1, vec![0x10, 0x10, 0x10]);
        agg.record_cpu_sample(1);
        let result = agg.finish();
        assert_eq!(result.method_profiles["0x10"].inclusive_count, 1);
        assert_eq!(result.method_profiles["0x10"].exclusive_count, 1);
    }
}
