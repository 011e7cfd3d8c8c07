//! Natural loop detection.
//!
//! A loop is identified by a back edge `latch -> header` where the header
//! dominates the latch. Its body is every block that can reach a latch without
//! passing through the header.
//!
//! ```text
//!     [preheader]     <- Single entry predecessor
//!          |
//!          v
//!     [header] <------+  <- Single entry point, dominates all loop nodes
//!          |          |
//!          v          |
//!     [body ...]      |
//!          |          |
//!          v          |
//!     [latch] --------+  <- Back edge source(s)
//! ```
//!
//! The elimination pass needs every loop to have a preheader: the heap values
//! flowing into the loop are read from it when the header is visited.

use rustc_hash::FxHashMap;

use crate::{
    ir::BlockId,
    utils::{
        graph::{algorithms::DominatorTree, NodeId, Predecessors, Successors},
        BitSet,
    },
};

/// A natural loop.
#[derive(Debug, Clone)]
pub struct LoopInfo {
    /// The header block (single entry point, dominates all loop blocks).
    pub header: BlockId,

    /// All blocks of the loop, including the header and nested loops.
    pub body: BitSet,

    /// Back edge sources.
    pub latches: Vec<BlockId>,

    /// The single predecessor of the header outside the loop, if there is one.
    pub preheader: Option<BlockId>,

    /// Nesting depth (0 = outermost).
    pub depth: usize,

    /// Header of the enclosing loop.
    pub parent: Option<BlockId>,

    /// Headers of the directly nested loops.
    pub children: Vec<BlockId>,
}

impl LoopInfo {
    /// Creates a loop consisting of its header only.
    #[must_use]
    pub fn new(header: BlockId, block_count: usize) -> Self {
        let mut body = BitSet::new(block_count);
        body.insert(header.index());
        Self {
            header,
            body,
            latches: Vec::new(),
            preheader: None,
            depth: 0,
            parent: None,
            children: Vec::new(),
        }
    }

    /// Returns true if this loop contains the given block.
    #[must_use]
    pub fn contains(&self, block: BlockId) -> bool {
        self.body.contains(block.index())
    }

    /// Returns the number of blocks in the loop.
    #[must_use]
    pub fn size(&self) -> usize {
        self.body.count()
    }

    /// Returns true if a preheader exists.
    #[must_use]
    pub fn has_preheader(&self) -> bool {
        self.preheader.is_some()
    }
}

/// All loops of a method.
#[derive(Debug, Clone)]
pub struct LoopForest {
    loops: Vec<LoopInfo>,
    /// Innermost loop containing each block.
    block_to_loop: Vec<Option<usize>>,
}

impl LoopForest {
    /// Creates an empty loop forest.
    #[must_use]
    pub fn new(block_count: usize) -> Self {
        Self {
            loops: Vec::new(),
            block_to_loop: vec![None; block_count],
        }
    }

    /// Adds a loop, updating the innermost-loop mapping of its blocks.
    pub fn add_loop(&mut self, loop_info: LoopInfo) {
        let loop_idx = self.loops.len();
        for block in loop_info.body.iter() {
            match self.block_to_loop[block] {
                Some(existing) if self.loops[existing].depth >= loop_info.depth => {}
                _ => self.block_to_loop[block] = Some(loop_idx),
            }
        }
        self.loops.push(loop_info);
    }

    /// Returns all loops, ordered by header.
    #[must_use]
    pub fn loops(&self) -> &[LoopInfo] {
        &self.loops
    }

    /// Returns true if there are no loops.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    /// Returns the innermost loop containing the given block.
    #[must_use]
    pub fn innermost_loop(&self, block: BlockId) -> Option<&LoopInfo> {
        self.block_to_loop
            .get(block.index())
            .copied()
            .flatten()
            .map(|idx| &self.loops[idx])
    }

    /// Returns the loop with the given header.
    #[must_use]
    pub fn loop_for_header(&self, header: BlockId) -> Option<&LoopInfo> {
        self.loops.iter().find(|l| l.header == header)
    }

    /// Returns true if a block is in any loop.
    #[must_use]
    pub fn is_in_loop(&self, block: BlockId) -> bool {
        self.innermost_loop(block).is_some()
    }
}

/// Detects all natural loops using dominance-based back edge detection.
///
/// # Algorithm
///
/// 1. Finds back edges `n -> h` where `h` dominates `n`
/// 2. For each back edge, grows the loop body backwards from `n` up to `h`
/// 3. Computes preheaders
/// 4. Establishes nesting relationships
#[must_use]
pub fn detect_loops<G>(graph: &G, dominators: &DominatorTree) -> LoopForest
where
    G: Successors + Predecessors,
{
    let block_count = graph.node_count();
    let mut loops_by_header: FxHashMap<NodeId, LoopInfo> = FxHashMap::default();

    for node in graph.node_ids() {
        if !dominators.is_reachable(node) {
            continue;
        }
        for succ in graph.successors(node) {
            if dominators.dominates(succ, node) {
                let loop_info = loops_by_header
                    .entry(succ)
                    .or_insert_with(|| LoopInfo::new(BlockId::new(succ.index()), block_count));
                loop_info.latches.push(BlockId::new(node.index()));
                expand_loop_body(graph, loop_info, node);
            }
        }
    }

    let mut loops: Vec<LoopInfo> = loops_by_header.into_values().collect();
    for loop_info in &mut loops {
        compute_preheader(graph, loop_info);
    }
    loops.sort_by_key(|l| l.header.index());
    compute_nesting(&mut loops);

    // Outer loops first so that inner loops win the innermost mapping.
    let mut order: Vec<usize> = (0..loops.len()).collect();
    order.sort_by_key(|&i| loops[i].depth);
    let mut forest = LoopForest::new(block_count);
    let mut slots: Vec<Option<LoopInfo>> = loops.into_iter().map(Some).collect();
    let mut ordered = Vec::with_capacity(slots.len());
    for i in order {
        if let Some(loop_info) = slots[i].take() {
            ordered.push(loop_info);
        }
    }
    ordered.sort_by_key(|l| l.header.index());
    for loop_info in ordered {
        forest.add_loop(loop_info);
    }
    forest
}

fn expand_loop_body<G: Predecessors>(graph: &G, loop_info: &mut LoopInfo, latch: NodeId) {
    let mut worklist = vec![latch];
    while let Some(node) = worklist.pop() {
        if loop_info.body.insert(node.index()) {
            for pred in graph.predecessors(node) {
                if !loop_info.body.contains(pred.index()) {
                    worklist.push(pred);
                }
            }
        }
    }
}

fn compute_preheader<G: Predecessors>(graph: &G, loop_info: &mut LoopInfo) {
    let header = NodeId::new(loop_info.header.index());
    let outside: Vec<NodeId> = graph
        .predecessors(header)
        .filter(|p| !loop_info.body.contains(p.index()))
        .collect();
    loop_info.preheader = match outside.as_slice() {
        [single] => Some(BlockId::new(single.index())),
        _ => None,
    };
}

fn compute_nesting(loops: &mut [LoopInfo]) {
    let n = loops.len();
    for i in 0..n {
        let header = loops[i].header;
        // The parent is the smallest other loop containing this header.
        let parent = (0..n)
            .filter(|&j| j != i && loops[j].contains(header))
            .min_by_key(|&j| loops[j].size());
        loops[i].parent = parent.map(|j| loops[j].header);
    }
    for i in 0..n {
        if let Some(parent) = loops[i].parent {
            let child = loops[i].header;
            if let Some(p) = loops.iter_mut().find(|l| l.header == parent) {
                p.children.push(child);
            }
        }
    }
    for i in 0..n {
        let mut depth = 0;
        let mut current = loops[i].parent;
        while let Some(header) = current {
            depth += 1;
            current = loops
                .iter()
                .find(|l| l.header == header)
                .and_then(|l| l.parent);
        }
        loops[i].depth = depth;
    }
}
