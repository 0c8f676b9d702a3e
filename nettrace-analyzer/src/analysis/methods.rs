use std::collections::HashMap;

/// A JIT-compiled method advertised in-band by CLR load/rundown events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodRecord {
    pub method_id: u64,
    pub module_id: u64,
    pub start_address: u64,
    pub size: u32,
    pub token: u32,
    pub flags: u32,
    pub namespace: String,
    pub name: String,
    pub signature: String,
}

impl MethodRecord {
    pub fn full_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.namespace, self.name)
        }
    }

    fn end_address(&self) -> u64 {
        self.start_address.saturating_add(self.size as u64)
    }
}

/// Methods by id, plus a sorted interval index over their address ranges
/// for resolving instruction pointers. The index is rebuilt once after the
/// decode pass, before any lookups.
#[derive(Debug, Default)]
pub struct MethodTable {
    by_id: HashMap<u64, MethodRecord>,
    // (start, end, method id), sorted; populated by build_address_index
    intervals: Vec<(u64, u64, u64)>,
}

impl MethodTable {
    /// Insert from a load-verbose or DCEnd-verbose event. Later
    /// definitions for the same method id replace earlier ones.
    pub(crate) fn insert_load(&mut self, record: MethodRecord) {
        self.by_id.insert(record.method_id, record);
    }

    /// Insert from a jitting-started event, which carries strictly less
    /// information than a load event: only taken for unknown method ids.
    pub(crate) fn insert_jit_started(&mut self, record: MethodRecord) {
        self.by_id.entry(record.method_id).or_insert(record);
    }

    pub(crate) fn build_address_index(&mut self) {
        self.intervals = self
            .by_id
            .values()
            .filter(|m| m.size > 0)
            .map(|m| (m.start_address, m.end_address(), m.method_id))
            .collect();
        self.intervals.sort_unstable();
    }

    pub fn get(&self, method_id: u64) -> Option<&MethodRecord> {
        self.by_id.get(&method_id)
    }

    pub fn contains(&self, method_id: u64) -> bool {
        self.by_id.contains_key(&method_id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MethodRecord> {
        self.by_id.values()
    }

    /// Finds the method whose [start, end) range contains `address`.
    /// Intervals are expected not to overlap; where stale rundown entries
    /// do overlap, the earliest-starting containing interval wins. A
    /// non-containing entry may sit between two containing ones, so the
    /// whole start-sorted prefix is scanned; the first hit in start order
    /// is the earliest.
    pub fn find_by_address(&self, address: u64) -> Option<&MethodRecord> {
        let idx = self.intervals.partition_point(|&(start, _, _)| start <= address);
        self.intervals[..idx]
            .iter()
            .find(|&&(_, end, _)| address < end)
            .and_then(|&(_, _, method_id)| self.by_id.get(&method_id))
    }

    /// Resolves an address to a method full name, falling back to the
    /// hex-formatted address itself.
    pub fn resolve(&self, address: u64) -> String {
        match self.find_by_address(address) {
            Some(method) => method.full_name(),
            None => format!("{address:#x}"),
        }
    }
}
