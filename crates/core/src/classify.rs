//! Fixed/movable partition of basic blocks.
//!
//! A block is position-fixed when external code may still branch to its
//! original offset: symbol entries, call targets, data-relocation targets,
//! and — when any indirect jump stays unresolved — every block in the module.
//! The remaining blocks start movable; a depth-first sweep over the block
//! graph then pins any block reached through a dispatch edge whose computed
//! target depends on the original layout.

use crate::block::{FixedReason, Mobility};
use crate::module::Module;
use crate::resolver::JumpKind;
use crate::result::Result;
use petgraph::graph::NodeIndex;
use petgraph::stable_graph::StableDiGraph;
use petgraph::visit::EdgeRef;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// How a control edge behaves under relocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EdgeKind {
    /// The engine can point the edge at the relocated destination
    /// (trampolines, displacement relocation or the jump-target zone).
    Retargetable,
    /// The destination address is computed from the original layout and the
    /// computation cannot be rewritten; the destination must not move.
    MustPreserve,
}

/// Randomization-coverage summary for one module.
///
/// Surfaces how far the conservative fallbacks collapsed the movable set; a
/// single unresolved jump silently pins everything otherwise.
#[derive(Debug, Clone, Serialize)]
pub struct CoverageReport {
    pub module: String,
    pub total_blocks: usize,
    pub fixed_blocks: usize,
    pub movable_blocks: usize,
    pub unknown_jumps: usize,
}

impl CoverageReport {
    /// Fraction of blocks free to move.
    pub fn movable_ratio(&self) -> f64 {
        if self.total_blocks == 0 {
            return 0.0;
        }
        self.movable_blocks as f64 / self.total_blocks as f64
    }
}

/// Partitions the module's blocks into disjoint fixed and movable sets.
pub(crate) fn classify(module: &mut Module) -> Result<CoverageReport> {
    let mut fixed: BTreeMap<u64, FixedReason> = BTreeMap::new();
    for &entry in module.blocks.keys() {
        if module.image.symbol_entries().contains(&entry) {
            fixed.insert(entry, FixedReason::SymbolEntry);
        } else if module.call_targets.contains(&entry) {
            fixed.insert(entry, FixedReason::CallTarget);
        } else if module.image.reloc_targets().contains(&entry) {
            fixed.insert(entry, FixedReason::RelocationTarget);
        }
    }

    let unknown_jumps = module
        .jumpins
        .values()
        .filter(|i| i.kind == JumpKind::Unknown)
        .count();

    if unknown_jumps > 0 {
        // An unresolved jump may land anywhere, so no block may move.
        warn!(
            module = module.image.name(),
            unknown_jumps,
            pinned = module.blocks.len(),
            "unresolved indirect jumps pin the whole module"
        );
        for &entry in module.blocks.keys() {
            fixed.entry(entry).or_insert(FixedReason::UnknownJumpLanding);
        }
    } else {
        sweep_dispatch_pins(module, &mut fixed);
    }

    let mut fixed_set = BTreeSet::new();
    let mut movable_set = BTreeSet::new();
    for (entry, block) in module.blocks.iter_mut() {
        match fixed.get(entry) {
            Some(&reason) => {
                block.mobility = Mobility::Fixed(reason);
                fixed_set.insert(*entry);
            }
            None => {
                block.mobility = Mobility::Movable;
                movable_set.insert(*entry);
            }
        }
    }
    module.fixed = fixed_set;
    module.movable = movable_set;

    let report = CoverageReport {
        module: module.image.name().to_string(),
        total_blocks: module.blocks.len(),
        fixed_blocks: module.fixed.len(),
        movable_blocks: module.movable.len(),
        unknown_jumps,
    };
    debug!(
        module = %report.module,
        fixed = report.fixed_blocks,
        movable = report.movable_blocks,
        ratio = report.movable_ratio(),
        "classified blocks"
    );
    Ok(report)
}

/// Depth-first sweep over the block graph starting from every fixed block,
/// pinning each block visited through a must-preserve edge. Iterative with an
/// explicit stack; the graph can be deep on large modules.
fn sweep_dispatch_pins(module: &Module, fixed: &mut BTreeMap<u64, FixedReason>) {
    let mut graph: StableDiGraph<u64, EdgeKind> = StableDiGraph::new();
    let mut node_of: BTreeMap<u64, NodeIndex> = BTreeMap::new();
    for &entry in module.blocks.keys() {
        node_of.insert(entry, graph.add_node(entry));
    }
    for (entry, block) in &module.blocks {
        let kind = block
            .instrs
            .last()
            .and_then(|last| module.jumpins.get(last))
            .filter(|info| matches!(info.kind, JumpKind::Memset | JumpKind::Convert))
            .map_or(EdgeKind::Retargetable, |_| EdgeKind::MustPreserve);
        for succ in &block.succs {
            let to_entry = if node_of.contains_key(succ) {
                *succ
            } else {
                // Prefix entries land one byte into a block.
                match module.block_covering(*succ) {
                    Some(b) => b.entry,
                    None => continue,
                }
            };
            graph.add_edge(node_of[entry], node_of[&to_entry], kind);
        }
    }

    let mut stack: Vec<NodeIndex> = fixed.keys().map(|e| node_of[e]).collect();
    let mut visited: BTreeSet<NodeIndex> = BTreeSet::new();
    while let Some(n) = stack.pop() {
        if !visited.insert(n) {
            continue;
        }
        for edge in graph.edges(n) {
            let head = edge.target();
            let entry = graph[head];
            if *edge.weight() == EdgeKind::MustPreserve {
                fixed.entry(entry).or_insert(FixedReason::PinnedByDispatch);
            }
            if !visited.contains(&head) {
                stack.push(head);
            }
        }
    }
}
