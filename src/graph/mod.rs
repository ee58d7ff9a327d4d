//! Bipartite dependency graph: source blocks on one side, pending encoded
//! blocks on the other.
//!
//! # Ownership
//! Pending nodes are owned exclusively by `AdjacencyIndex` and addressed
//! by a `NodeId`; the per-source-block edge sets only hold those handles.
//! A node's payload is XOR-reduced in place while it waits.
//!
//! `ResolvedStore` holds its own immutable copy of every recovered
//! payload.  It never aliases a buffer that is still owned by a pending node.

use std::collections::{HashMap, HashSet};

/// Index of one original source block, in `[0, k)`.
pub type SourceBlockId = u32;

/// Handle to a pending node inside an `AdjacencyIndex`.
pub(crate) type NodeId = u64;

// ── EncodedBlock ─────────────────────────────────────────────────────────────

/// A received block that still depends on two or more unresolved source
/// blocks.  `payload` is the XOR of exactly those sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EncodedBlock {
    pub(crate) dependencies: HashSet<SourceBlockId>,
    pub(crate) payload:      Vec<u8>,
}

impl EncodedBlock {
    pub(crate) fn new(dependencies: HashSet<SourceBlockId>, payload: Vec<u8>) -> Self {
        Self { dependencies, payload }
    }

    /// Current degree (number of unresolved dependencies).
    #[inline]
    pub(crate) fn degree(&self) -> usize {
        self.dependencies.len()
    }

    /// The sole remaining dependency, if the degree is exactly one.
    pub(crate) fn sole_dependency(&self) -> Option<SourceBlockId> {
        if self.dependencies.len() == 1 {
            self.dependencies.iter().next().copied()
        } else {
            None
        }
    }
}

// ── AdjacencyIndex ───────────────────────────────────────────────────────────

/// Map from source block to the pending nodes that still depend on it.
#[derive(Debug, Default)]
pub(crate) struct AdjacencyIndex {
    edges:     HashMap<SourceBlockId, HashSet<NodeId>>,
    nodes:     HashMap<NodeId, EncodedBlock>,
    next_node: NodeId,
}

impl AdjacencyIndex {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Pending-node set for `id`, created empty on first access.
    pub(crate) fn get_or_create(&mut self, id: SourceBlockId) -> &mut HashSet<NodeId> {
        self.edges.entry(id).or_default()
    }

    /// Take ownership of `block` and register it under every dependency.
    pub(crate) fn insert(&mut self, block: EncodedBlock) -> NodeId {
        let node_id = self.next_node;
        self.next_node += 1;
        for &dep in &block.dependencies {
            self.get_or_create(dep).insert(node_id);
        }
        self.nodes.insert(node_id, block);
        node_id
    }

    /// Delete the entry for `id` and hand back the nodes it referenced.
    pub(crate) fn remove(&mut self, id: SourceBlockId) -> HashSet<NodeId> {
        self.edges.remove(&id).unwrap_or_default()
    }

    pub(crate) fn node(&self, node_id: NodeId) -> Option<&EncodedBlock> {
        self.nodes.get(&node_id)
    }

    pub(crate) fn node_mut(&mut self, node_id: NodeId) -> Option<&mut EncodedBlock> {
        self.nodes.get_mut(&node_id)
    }

    /// Remove a node from the index entirely, including its registration
    /// under each of its remaining dependencies.
    pub(crate) fn detach(&mut self, node_id: NodeId) -> Option<EncodedBlock> {
        let block = self.nodes.remove(&node_id)?;
        for dep in &block.dependencies {
            if let Some(set) = self.edges.get_mut(dep) {
                set.remove(&node_id);
                if set.is_empty() {
                    self.edges.remove(dep);
                }
            }
        }
        Some(block)
    }

    /// Number of live pending nodes.
    pub(crate) fn pending_count(&self) -> usize {
        self.nodes.len()
    }

    /// Handles registered under `id`, without materialising an entry.
    pub(crate) fn registered(&self, id: SourceBlockId) -> impl Iterator<Item = NodeId> + '_ {
        self.edges.get(&id).into_iter().flatten().copied()
    }
}

// ── ResolvedStore ────────────────────────────────────────────────────────────

/// Write-once map from source block to its recovered payload.
#[derive(Debug, Default)]
pub(crate) struct ResolvedStore {
    blocks: HashMap<SourceBlockId, Box<[u8]>>,
}

impl ResolvedStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Store a copy of `payload` under `id`.
    ///
    /// Returns `false` and leaves the existing entry untouched if `id` was
    /// already resolved.
    pub(crate) fn insert(&mut self, id: SourceBlockId, payload: &[u8]) -> bool {
        if self.blocks.contains_key(&id) {
            return false;
        }
        self.blocks.insert(id, payload.into());
        true
    }

    pub(crate) fn get(&self, id: SourceBlockId) -> Option<&[u8]> {
        self.blocks.get(&id).map(AsRef::as_ref)
    }

    pub(crate) fn contains(&self, id: SourceBlockId) -> bool {
        self.blocks.contains_key(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Snapshot of all entries in ascending id order.
    pub(crate) fn sorted(&self) -> Vec<(SourceBlockId, &[u8])> {
        let mut entries: Vec<(SourceBlockId, &[u8])> = self
            .blocks
            .iter()
            .map(|(&id, payload)| (id, payload.as_ref()))
            .collect();
        entries.sort_unstable_by_key(|(id, _)| *id);
        entries
    }
}
