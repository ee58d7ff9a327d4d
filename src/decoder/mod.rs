//! Peeling (belief-propagation) decoder for XOR-coded block streams.
//!
//! # Algorithm
//! Each received block carries the XOR of some subset of the `k` source
//! blocks.  [`PeelingDecoder::add_block`]:
//!
//! 1. Reduces the block against every source already resolved (XOR the
//!    known payload out, drop the id).
//! 2. If exactly one dependency is left, the payload *is* that source
//!    block.  Resolving it is propagated into every pending block that
//!    depends on it, which may leave further blocks with a single
//!    dependency.  That cascade runs on an explicit FIFO work-list, so
//!    elimination chains of any length use constant stack.
//! 3. If two or more dependencies are left, the block is parked in the
//!    pending index until enough of its sources resolve.
//! 4. If nothing is left, the block was redundant and is discarded.
//!
//! Decoding is complete once all `k` sources are resolved.
//!
//! # Errors
//! Malformed input is rejected before any state changes.  See
//! [`DecodeError`].
//!
//! # Concurrency
//! A decoder is a single-writer state machine.  Feed it from one thread;
//! concurrent producers must be serialised in front of it.

use std::collections::{HashSet, VecDeque};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, trace};

use crate::graph::{AdjacencyIndex, EncodedBlock, ResolvedStore, SourceBlockId};
use crate::xor::merge_in_place;

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("block has no dependencies")]
    EmptyDependencies,
    #[error("block has an empty payload")]
    EmptyPayload,
    #[error("payload length mismatch: expected {expected} bytes, got {got}")]
    PayloadLength { expected: usize, got: usize },
    #[error("source block id {id} out of range (k = {k})")]
    IdOutOfRange { id: SourceBlockId, k: u32 },
    #[error("source block id {id} listed more than once in one block")]
    DuplicateId { id: SourceBlockId },
    /// A pending block would lose its last dependency.  Never produced by
    /// well-formed input.
    #[error("malformed dependency graph while resolving source block {id}")]
    MalformedGraph { id: SourceBlockId },
    #[error("source block {id} is already resolved")]
    AlreadyResolved { id: SourceBlockId },
}

// ── Stats ────────────────────────────────────────────────────────────────────

/// Running counters, for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DecoderStats {
    /// Blocks that passed validation.
    pub blocks_accepted:     u64,
    /// Accepted blocks that reduced to nothing.
    pub blocks_redundant:    u64,
    /// Blocks parked as pending nodes.
    pub nodes_created:       u64,
    /// Source blocks resolved (directly or by cascade).
    pub resolutions:         u64,
}

// ── Decoder ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct PeelingDecoder {
    k:         u32,
    block_len: Option<usize>,
    resolved:  ResolvedStore,
    pending:   AdjacencyIndex,
    stats:     DecoderStats,
}

impl PeelingDecoder {
    /// Decoder for `k` source blocks.  The block length is taken from the
    /// first accepted block and enforced from then on.
    pub fn new(k: u32) -> Self {
        Self {
            k,
            block_len: None,
            resolved:  ResolvedStore::new(),
            pending:   AdjacencyIndex::new(),
            stats:     DecoderStats::default(),
        }
    }

    /// Decoder for `k` source blocks of exactly `block_len` bytes each.
    pub fn with_block_len(k: u32, block_len: usize) -> Self {
        Self { block_len: Some(block_len), ..Self::new(k) }
    }

    /// Feed one received block.
    ///
    /// `dependencies` lists the source blocks XOR-ed into `payload`.
    /// Returns `Ok(true)` once every source block is resolved; from then on
    /// every call returns `Ok(true)`.
    pub fn add_block(
        &mut self,
        dependencies: &[SourceBlockId],
        mut payload:  Vec<u8>,
    ) -> Result<bool, DecodeError> {
        self.validate(dependencies, &payload)?;
        if self.block_len.is_none() {
            self.block_len = Some(payload.len());
        }
        self.stats.blocks_accepted += 1;

        // Subtract everything already known.
        let mut remaining: HashSet<SourceBlockId> = HashSet::with_capacity(dependencies.len());
        for &id in dependencies {
            match self.resolved.get(id) {
                Some(known) => merge_in_place(&mut payload, known),
                None        => { remaining.insert(id); }
            }
        }

        match remaining.len() {
            0 => {
                self.stats.blocks_redundant += 1;
                debug!(degree = dependencies.len(), "redundant block discarded");
            }
            1 => {
                if let Some(id) = remaining.into_iter().next() {
                    self.cascade(id, payload)?;
                }
            }
            degree => {
                self.pending.insert(EncodedBlock::new(remaining, payload));
                self.stats.nodes_created += 1;
                debug!(degree, pending = self.pending.pending_count(), "block parked");
            }
        }

        Ok(self.is_complete())
    }

    /// Resolve `id` and drain every resolution it unlocks.
    fn cascade(&mut self, id: SourceBlockId, payload: Vec<u8>) -> Result<(), DecodeError> {
        let mut work: VecDeque<(SourceBlockId, Vec<u8>)> = VecDeque::new();
        work.push_back((id, payload));

        while let Some((id, payload)) = work.pop_front() {
            // Two pending blocks can collapse onto the same source in one
            // pass; the first one wins.
            if self.resolved.contains(id) {
                trace!(id, "duplicate resolution skipped");
                continue;
            }
            work.extend(self.resolve(id, &payload)?);
        }
        Ok(())
    }

    /// Record `id = payload` and eliminate `id` from every pending block.
    ///
    /// Returns the `(id, payload)` pairs of blocks that dropped to a single
    /// dependency.  Those blocks are removed from the index.
    fn resolve(
        &mut self,
        id:      SourceBlockId,
        payload: &[u8],
    ) -> Result<Vec<(SourceBlockId, Vec<u8>)>, DecodeError> {
        if self.resolved.contains(id) {
            return Err(DecodeError::AlreadyResolved { id });
        }
        let malformed = self.pending.registered(id).any(|node_id| {
            self.pending
                .node(node_id)
                .map_or(true, |node| node.degree() < 2 || !node.dependencies.contains(&id))
        });
        if malformed {
            return Err(DecodeError::MalformedGraph { id });
        }

        self.resolved.insert(id, payload);
        self.stats.resolutions += 1;
        trace!(id, resolved = self.resolved.len(), "source block resolved");
        if self.is_complete() {
            info!(k = self.k, blocks = self.stats.blocks_accepted, "decode complete");
        }

        let mut freed = Vec::new();
        for node_id in self.pending.remove(id) {
            let collapsed = match self.pending.node_mut(node_id) {
                Some(node) => {
                    merge_in_place(&mut node.payload, payload);
                    node.dependencies.remove(&id);
                    node.degree() == 1
                }
                None => false,
            };
            if !collapsed {
                continue;
            }
            if let Some(node) = self.pending.detach(node_id) {
                if let Some(next) = node.sole_dependency() {
                    freed.push((next, node.payload));
                }
            }
        }
        Ok(freed)
    }

    fn validate(&self, dependencies: &[SourceBlockId], payload: &[u8]) -> Result<(), DecodeError> {
        if dependencies.is_empty() {
            return Err(DecodeError::EmptyDependencies);
        }
        match self.block_len {
            Some(expected) if payload.len() != expected => {
                return Err(DecodeError::PayloadLength { expected, got: payload.len() });
            }
            None if payload.is_empty() => return Err(DecodeError::EmptyPayload),
            _ => {}
        }
        let mut seen = HashSet::with_capacity(dependencies.len());
        for &id in dependencies {
            if id >= self.k {
                return Err(DecodeError::IdOutOfRange { id, k: self.k });
            }
            if !seen.insert(id) {
                return Err(DecodeError::DuplicateId { id });
            }
        }
        Ok(())
    }

    // ── Output ──────────────────────────────────────────────────────────────

    /// Resolved payloads in ascending source-block order.
    ///
    /// Recomputed on every call from the current state; unresolved ids are
    /// simply absent.
    pub fn sequence(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.resolved.sorted().into_iter().map(|(_, payload)| payload)
    }

    /// Resolved source-block ids in ascending order.
    pub fn resolved_ids(&self) -> Vec<SourceBlockId> {
        self.resolved.sorted().into_iter().map(|(id, _)| id).collect()
    }

    // ── Introspection ───────────────────────────────────────────────────────

    pub fn k(&self) -> u32 { self.k }

    /// Fixed block length, once known.
    pub fn block_len(&self) -> Option<usize> { self.block_len }

    pub fn is_complete(&self) -> bool {
        self.resolved.len() >= self.k as usize
    }

    pub fn resolved_count(&self) -> usize { self.resolved.len() }

    /// Blocks still waiting on two or more unresolved sources.
    pub fn pending_count(&self) -> usize { self.pending.pending_count() }

    pub fn is_resolved(&self, id: SourceBlockId) -> bool {
        self.resolved.contains(id)
    }

    pub fn get(&self, id: SourceBlockId) -> Option<&[u8]> {
        self.resolved.get(id)
    }

    pub fn stats(&self) -> DecoderStats { self.stats }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xor::merge;

    fn be(v: u32) -> Vec<u8> {
        v.to_be_bytes().to_vec()
    }

    #[test]
    fn three_block_cascade() {
        let mut dec = PeelingDecoder::new(3);
        assert!(!dec.add_block(&[1, 2], be(0x0102_0304)).unwrap());
        assert!(!dec.add_block(&[0, 2], be(0x0506_0708)).unwrap());
        assert_eq!(dec.pending_count(), 2);
        assert!(dec.add_block(&[2], be(0x0A0B_0C0D)).unwrap());

        let out: Vec<Vec<u8>> = dec.sequence().map(<[u8]>::to_vec).collect();
        assert_eq!(out, vec![be(0x0F0D_0B05), be(0x0B09_0F09), be(0x0A0B_0C0D)]);
        assert_eq!(dec.pending_count(), 0);
        assert_eq!(dec.stats().resolutions, 3);
    }

    #[test]
    fn singleton_resolves_immediately() {
        let mut dec = PeelingDecoder::new(2);
        assert!(!dec.add_block(&[1], b"abcd".to_vec()).unwrap());
        assert_eq!(dec.get(1), Some(&b"abcd"[..]));
        assert_eq!(dec.resolved_count(), 1);
    }

    #[test]
    fn reduction_against_resolved_sources() {
        let mut dec = PeelingDecoder::new(2);
        let x = b"\x10\x20\x30\x40".to_vec();
        let y = b"\x01\x02\x03\x04".to_vec();
        dec.add_block(&[1], y.clone()).unwrap();
        // Block arrives after its partner is known: no pending node needed.
        assert!(dec.add_block(&[0, 1], x.clone()).unwrap());
        assert_eq!(dec.get(0), Some(merge(&x, &y, 4).as_slice()));
        assert_eq!(dec.stats().nodes_created, 0);
    }

    #[test]
    fn redundant_block_is_a_no_op() {
        let mut dec = PeelingDecoder::new(3);
        dec.add_block(&[0], b"aaaa".to_vec()).unwrap();
        dec.add_block(&[1], b"bbbb".to_vec()).unwrap();
        assert!(!dec.add_block(&[0, 1], b"zzzz".to_vec()).unwrap());
        assert!(!dec.add_block(&[0], b"yyyy".to_vec()).unwrap());
        assert_eq!(dec.get(0), Some(&b"aaaa"[..]));
        assert_eq!(dec.get(1), Some(&b"bbbb"[..]));
        assert_eq!(dec.stats().blocks_redundant, 2);
        assert_eq!(dec.resolved_count(), 2);
    }

    #[test]
    fn completion_is_sticky() {
        let mut dec = PeelingDecoder::new(1);
        assert!(dec.add_block(&[0], vec![1]).unwrap());
        assert!(dec.add_block(&[0], vec![2]).unwrap());
        assert_eq!(dec.get(0), Some(&[1u8][..]));
    }

    #[test]
    fn zero_sources_is_complete_from_the_start() {
        let dec = PeelingDecoder::new(0);
        assert!(dec.is_complete());
        assert_eq!(dec.sequence().count(), 0);
    }

    #[test]
    fn two_nodes_collapsing_onto_one_source() {
        let mut dec = PeelingDecoder::new(2);
        dec.add_block(&[0, 1], vec![0x0F]).unwrap();
        dec.add_block(&[0, 1], vec![0x0F]).unwrap();
        assert_eq!(dec.pending_count(), 2);
        assert!(dec.add_block(&[0], vec![0x03]).unwrap());
        assert_eq!(dec.get(1), Some(&[0x0Cu8][..]));
        assert_eq!(dec.pending_count(), 0);
    }

    #[test]
    fn long_chain_does_not_recurse() {
        let n: u32 = 100_000;
        let mut dec = PeelingDecoder::with_block_len(n, 4);
        for i in 0..n - 1 {
            assert!(!dec.add_block(&[i, i + 1], be(i ^ (i + 1))).unwrap());
        }
        assert!(dec.add_block(&[n - 1], be(n - 1)).unwrap());
        for (i, payload) in dec.sequence().enumerate() {
            assert_eq!(payload, be(i as u32).as_slice());
        }
    }

    #[test]
    fn partial_sequence_has_gaps() {
        let mut dec = PeelingDecoder::new(5);
        dec.add_block(&[3], vec![3]).unwrap();
        dec.add_block(&[1], vec![1]).unwrap();
        dec.add_block(&[2, 4], vec![6]).unwrap();
        let out: Vec<&[u8]> = dec.sequence().collect();
        assert_eq!(out, vec![&[1u8][..], &[3u8][..]]);
        assert_eq!(dec.resolved_ids(), vec![1, 3]);
    }

    #[test]
    fn invalid_input_is_rejected_without_mutation() {
        let mut dec = PeelingDecoder::with_block_len(4, 2);
        assert_eq!(dec.add_block(&[], vec![0, 0]), Err(DecodeError::EmptyDependencies));
        assert_eq!(
            dec.add_block(&[0], vec![0, 0, 0]),
            Err(DecodeError::PayloadLength { expected: 2, got: 3 }),
        );
        assert_eq!(
            dec.add_block(&[0, 4], vec![0, 0]),
            Err(DecodeError::IdOutOfRange { id: 4, k: 4 }),
        );
        assert_eq!(
            dec.add_block(&[1, 2, 1], vec![0, 0]),
            Err(DecodeError::DuplicateId { id: 1 }),
        );
        assert_eq!(dec.resolved_count(), 0);
        assert_eq!(dec.pending_count(), 0);
        assert_eq!(dec.stats(), DecoderStats::default());
    }

    #[test]
    fn block_len_adopted_from_first_block() {
        let mut dec = PeelingDecoder::new(3);
        assert_eq!(dec.add_block(&[0], Vec::new()), Err(DecodeError::EmptyPayload));
        dec.add_block(&[0, 1], vec![1, 2, 3]).unwrap();
        assert_eq!(dec.block_len(), Some(3));
        assert_eq!(
            dec.add_block(&[2], vec![1]),
            Err(DecodeError::PayloadLength { expected: 3, got: 1 }),
        );
    }

    #[test]
    fn malformed_graph_is_reported() {
        let mut dec = PeelingDecoder::new(3);
        // A degree-1 node can only exist through internal corruption.
        dec.pending.insert(EncodedBlock::new([2].into_iter().collect(), vec![9]));
        assert_eq!(
            dec.add_block(&[2], vec![1]),
            Err(DecodeError::MalformedGraph { id: 2 }),
        );
        assert!(!dec.is_resolved(2));
    }

    #[test]
    fn pending_nodes_keep_degree_two_and_unresolved_deps() {
        let mut dec = PeelingDecoder::new(6);
        for (deps, payload) in [
            (&[0, 1, 2][..], vec![1]),
            (&[1, 2][..], vec![2]),
            (&[3, 4][..], vec![3]),
            (&[4, 5, 0][..], vec![4]),
            (&[2][..], vec![5]),
        ] {
            dec.add_block(deps, payload).unwrap();
            for id in 0..6 {
                for node_id in dec.pending.registered(id) {
                    let node = dec.pending.node(node_id).unwrap();
                    assert!(node.degree() >= 2);
                    assert!(node.dependencies.iter().all(|d| !dec.is_resolved(*d)));
                }
            }
        }
        assert_eq!(dec.resolved_ids(), vec![0, 1, 2]);
        assert_eq!(dec.pending_count(), 2);
    }

    #[test]
    fn resolve_rejects_known_source() {
        let mut dec = PeelingDecoder::new(2);
        dec.add_block(&[0], vec![1]).unwrap();
        assert_eq!(dec.resolve(0, &[2]), Err(DecodeError::AlreadyResolved { id: 0 }));
    }
}
