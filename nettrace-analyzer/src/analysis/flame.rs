use std::collections::HashMap;

use super::methods::MethodTable;
use super::{AllocationSamples, TypeCounts};

/// One node of a flattened flame-graph tree. Nodes are emitted in
/// depth-first order, parents before children, with horizontal positions
/// in [0, 1]: children split their parent's range proportionally to their
/// own weights, heaviest first.
#[derive(Debug, Clone)]
pub struct FlameNode {
    pub name: String,
    pub depth: u32,
    pub parent: Option<usize>,
    pub weight: u64,
    pub start: f64,
    pub end: f64,
    /// Allocation variant only: bytes reaching this node.
    pub total_size: u64,
    /// Allocation variant only: contributing type names.
    pub types: HashMap<String, TypeCounts>,
}

#[derive(Debug, Clone, Default)]
pub struct FlameGraph {
    pub nodes: Vec<FlameNode>,
}

impl FlameGraph {
    pub fn root(&self) -> Option<&FlameNode> {
        self.nodes.first()
    }

    pub fn children_of(&self, parent: usize) -> impl Iterator<Item = (usize, &FlameNode)> {
        self.nodes
            .iter()
            .enumerate()
            .filter(move |(_, node)| node.parent == Some(parent))
    }
}

struct TreeNode {
    name: String,
    weight: u64,
    total_size: u64,
    types: HashMap<String, TypeCounts>,
    children: Vec<usize>,
}

/// Accumulates call-stack prefixes into a tree, then flattens it. The
/// root's weight is the sum of all inserted weights.
struct FlameBuilder {
    nodes: Vec<TreeNode>,
}

impl FlameBuilder {
    fn new() -> Self {
        FlameBuilder {
            nodes: vec![TreeNode {
                name: "root".to_string(),
                weight: 0,
                total_size: 0,
                types: HashMap::new(),
                children: Vec::new(),
            }],
        }
    }

    /// `frames` must already be ordered deepest caller first.
    fn add_stack(
        &mut self,
        frames: &[String],
        weight: u64,
        size: u64,
        types: Option<&HashMap<String, TypeCounts>>,
    ) {
        self.bump(0, weight, size, types);
        let mut current = 0;
        for frame in frames {
            let child = self.child_named(current, frame);
            self.bump(child, weight, size, types);
            current = child;
        }
    }

    fn child_named(&mut self, parent: usize, name: &str) -> usize {
        if let Some(&existing) = self.nodes[parent]
            .children
            .iter()
            .find(|&&c| self.nodes[c].name == name)
        {
            return existing;
        }
        let idx = self.nodes.len();
        self.nodes.push(TreeNode {
            name: name.to_string(),
            weight: 0,
            total_size: 0,
            types: HashMap::new(),
            children: Vec::new(),
        });
        self.nodes[parent].children.push(idx);
        idx
    }

    fn bump(
        &mut self,
        idx: usize,
        weight: u64,
        size: u64,
        types: Option<&HashMap<String, TypeCounts>>,
    ) {
        let node = &mut self.nodes[idx];
        node.weight += weight;
        node.total_size += size;
        if let Some(types) = types {
            for (name, counts) in types {
                let slot = node.types.entry(name.clone()).or_default();
                slot.count += counts.count;
                slot.size += counts.size;
            }
        }
    }

    fn finish(self) -> FlameGraph {
        if self.nodes[0].weight == 0 && self.nodes[0].children.is_empty() {
            return FlameGraph::default();
        }
        let mut out: Vec<FlameNode> = Vec::with_capacity(self.nodes.len());
        let mut pending = vec![(0usize, None::<usize>, 0u32, 0.0f64, 1.0f64)];
        while let Some((idx, parent, depth, start, end)) = pending.pop() {
            let node = &self.nodes[idx];
            let out_idx = out.len();
            out.push(FlameNode {
                name: node.name.clone(),
                depth,
                parent,
                weight: node.weight,
                start,
                end,
                total_size: node.total_size,
                types: node.types.clone(),
            });

            // Heaviest child first, names break ties for a stable layout.
            let mut children = node.children.clone();
            children.sort_by(|&a, &b| {
                self.nodes[b]
                    .weight
                    .cmp(&self.nodes[a].weight)
                    .then_with(|| self.nodes[a].name.cmp(&self.nodes[b].name))
            });

            let span = end - start;
            let denom = node.weight.max(1) as f64;
            let mut cursor = start;
            let mut batch = Vec::with_capacity(children.len());
            for child_idx in children {
                let width = span * (self.nodes[child_idx].weight as f64 / denom);
                batch.push((child_idx, Some(out_idx), depth + 1, cursor, cursor + width));
                cursor += width;
            }
            // Reverse before pushing so the leftmost child pops first.
            for entry in batch.into_iter().rev() {
                pending.push(entry);
            }
        }
        FlameGraph { nodes: out }
    }
}

/// CPU variant: every distinct stack contributes weight 1.
pub(crate) fn build_cpu_flame(stacks: &HashMap<u32, Vec<u64>>, methods: &MethodTable) -> FlameGraph {
    let mut ids: Vec<u32> = stacks.keys().copied().collect();
    ids.sort_unstable();

    let mut builder = FlameBuilder::new();
    for id in ids {
        let frames: Vec<String> = stacks[&id].iter().rev().map(|&a| methods.resolve(a)).collect();
        builder.add_stack(&frames, 1, 0, None);
    }
    builder.finish()
}

/// Allocation variant: weight is the per-stack allocation count, and each
/// node also accumulates bytes and the contributing types.
pub(crate) fn build_allocation_flame(
    stacks: &HashMap<u32, Vec<u64>>,
    samples: &HashMap<u32, AllocationSamples>,
    methods: &MethodTable,
) -> FlameGraph {
    let mut ids: Vec<u32> = samples.keys().copied().collect();
    ids.sort_unstable();

    let mut builder = FlameBuilder::new();
    for id in ids {
        let Some(addresses) = stacks.get(&id) else {
            continue;
        };
        let sample = &samples[&id];
        let frames: Vec<String> = addresses.iter().rev().map(|&a| methods.resolve(a)).collect();
        builder.add_stack(&frames, sample.count, sample.total_size, Some(&sample.types));
    }
    builder.finish()
}
