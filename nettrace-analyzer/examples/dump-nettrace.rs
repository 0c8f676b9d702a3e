use std::collections::BTreeMap;

fn main() {
    env_logger::init();

    let path = std::env::args()
        .nth(1)
        .expect("usage: dump-nettrace <trace.nettrace>");
    let bytes = std::fs::read(&path).expect("failed to read trace file");

    let result = nettrace_analyzer::parse(&bytes);

    if let Some(trace) = &result.trace {
        println!(
            "pid {} on {} processors, {}-bit pointers, sampling rate {}",
            trace.process_id,
            trace.number_of_processors,
            trace.pointer_size * 8,
            trace.cpu_sampling_rate
        );
    } else {
        println!("no Trace object found");
    }

    println!(
        "{} events total ({} allocation ticks), {} schemas from {} providers, {} stacks, {} methods",
        result.total_event_count,
        result.allocation_event_count,
        result.schemas.len(),
        result.providers.len(),
        result.stacks.len(),
        result.methods.len()
    );

    let mut hot: Vec<_> = result.method_profiles.iter().collect();
    hot.sort_by(|a, b| b.1.inclusive_count.cmp(&a.1.inclusive_count));
    if !hot.is_empty() {
        println!("\nhot methods (inclusive/exclusive samples):");
        for (name, profile) in hot.iter().take(10) {
            println!(
                "  {:>8} {:>8}  {}",
                profile.inclusive_count, profile.exclusive_count, name
            );
        }
    }

    // BTreeMap for a stable by-size listing
    let by_size: BTreeMap<(u64, &str), &nettrace_analyzer::AllocationInfo> = result
        .allocations
        .values()
        .map(|info| ((u64::MAX - info.total_size, info.type_name.as_str()), info))
        .collect();
    if !by_size.is_empty() {
        println!("\nallocations by size:");
        for info in by_size.values().take(10) {
            println!(
                "  {:>12} bytes in {:>6} events  {}",
                info.total_size, info.count, info.type_name
            );
        }
    }

    if !result.errors.is_empty() {
        println!("\n{} recovered errors:", result.errors.len());
        for error in &result.errors {
            println!("  {error}");
        }
    }
}
