/// Header Chain
///
/// Holds every header ever seen, organized as a DAG by parent hash, and
/// resolves the main branch by cumulative chainwork. Branch 0 is the main
/// branch. Main pointers (tip + height index) only move through the commit
/// methods so the index writer can acknowledge apply/undo first.
///
/// Tie-break: equal cumulative work keeps the first-seen branch. Given the
/// same block files this resolves identically across restarts.

use std::collections::HashMap;

use crate::chainwork::{add_work, work_from_bits};
use crate::error::ChainError;
use crate::parser::RawHeader;
use crate::types::{BlockLocation, TxHash, ZERO_HASH};

pub const MAIN_BRANCH: u32 = 0;

#[derive(Debug, Clone)]
pub struct HeaderEntry {
    pub raw: RawHeader,
    pub height: u32,
    pub branch_id: u32,
    pub cumulative_work: [u8; 32],
    pub location: Option<BlockLocation>,
}

/// What an inserted header did to the chain. `Reorg` and `Extended` are
/// proposals; the organizer commits them once the index writer is done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainUpdate {
    /// Header extends the committed tip.
    Extended { hash: TxHash, height: u32 },
    /// Header tops a branch with more work than the committed tip.
    /// `undo` is the committed main branch above the MRCA, top first;
    /// `apply` is the new branch above the MRCA, ascending.
    Reorg {
        mrca_height: u32,
        undo: Vec<TxHash>,
        apply: Vec<TxHash>,
    },
    /// Header lands on a branch with less or equal work.
    SideChain { hash: TxHash },
    /// Parent unknown; held until it shows up.
    Orphaned { hash: TxHash },
    Duplicate { hash: TxHash },
}

pub struct HeaderChain {
    entries: HashMap<TxHash, HeaderEntry>,
    /// Committed main branch, index = height.
    height_index: Vec<TxHash>,
    /// Headers waiting for their parent, keyed by the missing parent hash.
    orphans: HashMap<TxHash, Vec<(RawHeader, Option<BlockLocation>)>>,
    next_branch_id: u32,
}

impl HeaderChain {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            height_index: Vec::new(),
            orphans: HashMap::new(),
            next_branch_id: 1,
        }
    }

    pub fn get(&self, hash: &TxHash) -> Option<&HeaderEntry> {
        self.entries.get(hash)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn tip_hash(&self) -> Option<TxHash> {
        self.height_index.last().copied()
    }

    pub fn top_height(&self) -> Option<u32> {
        self.height_index.len().checked_sub(1).map(|h| h as u32)
    }

    pub fn main_hash_at(&self, height: u32) -> Option<TxHash> {
        self.height_index.get(height as usize).copied()
    }

    pub fn header_at(&self, height: u32) -> Option<&HeaderEntry> {
        self.main_hash_at(height).and_then(|h| self.entries.get(&h))
    }

    pub fn is_on_main(&self, hash: &TxHash) -> bool {
        self.entries
            .get(hash)
            .map(|e| self.main_hash_at(e.height) == Some(*hash))
            .unwrap_or(false)
    }

    pub fn location_of(&self, hash: &TxHash) -> Option<BlockLocation> {
        self.entries.get(hash).and_then(|e| e.location)
    }

    fn committed_tip_work(&self) -> [u8; 32] {
        self.tip_hash()
            .and_then(|h| self.entries.get(&h))
            .map(|e| e.cumulative_work)
            .unwrap_or([0u8; 32])
    }

    /// Ingest one header. Returns the updates it (and any orphans it
    /// released) produced, in insertion order.
    pub fn insert(
        &mut self,
        raw: RawHeader,
        location: Option<BlockLocation>,
    ) -> Vec<ChainUpdate> {
        let mut updates = Vec::new();
        let mut pending = vec![(raw, location)];
        while let Some((header, loc)) = pending.pop() {
            let hash = header.hash();
            let update = self.insert_one(header, loc);
            let released = !matches!(update, ChainUpdate::Orphaned { .. });
            updates.push(update);
            if released {
                if let Some(children) = self.orphans.remove(&hash) {
                    pending.extend(children);
                }
            }
        }
        updates
    }

    fn insert_one(&mut self, raw: RawHeader, location: Option<BlockLocation>) -> ChainUpdate {
        let hash = raw.hash();
        if let Some(existing) = self.entries.get_mut(&hash) {
            if existing.location.is_none() {
                existing.location = location;
            }
            return ChainUpdate::Duplicate { hash };
        }

        let prev = raw.prev_hash();
        let own_work = work_from_bits(raw.bits());

        // Genesis starts the main branch.
        if prev == ZERO_HASH && self.entries.is_empty() {
            self.entries.insert(
                hash,
                HeaderEntry {
                    raw,
                    height: 0,
                    branch_id: MAIN_BRANCH,
                    cumulative_work: own_work,
                    location,
                },
            );
            self.height_index.push(hash);
            return ChainUpdate::Extended { hash, height: 0 };
        }

        let Some(parent) = self.entries.get(&prev) else {
            self.orphans.entry(prev).or_default().push((raw, location));
            return ChainUpdate::Orphaned { hash };
        };

        let height = parent.height + 1;
        let parent_branch = parent.branch_id;
        let parent_on_main = self.is_on_main(&prev);
        let cumulative_work = add_work(&parent.cumulative_work, &own_work);

        let extends_tip = self.tip_hash() == Some(prev);
        let branch_id = if extends_tip {
            MAIN_BRANCH
        } else if parent_on_main {
            // New fork off the main branch.
            let id = self.next_branch_id;
            self.next_branch_id += 1;
            id
        } else {
            parent_branch
        };

        self.entries.insert(
            hash,
            HeaderEntry {
                raw,
                height,
                branch_id,
                cumulative_work,
                location,
            },
        );

        if extends_tip {
            return ChainUpdate::Extended { hash, height };
        }

        // Strictly more work steals the main branch; ties keep first-seen.
        if cumulative_work > self.committed_tip_work() {
            let (mrca_height, undo, apply) = self.resolve_reorg(hash);
            return ChainUpdate::Reorg {
                mrca_height,
                undo,
                apply,
            };
        }

        ChainUpdate::SideChain { hash }
    }

    /// Walk from `new_tip` back to the committed main branch.
    fn resolve_reorg(&self, new_tip: TxHash) -> (u32, Vec<TxHash>, Vec<TxHash>) {
        let mut apply = Vec::new();
        let mut cursor = new_tip;
        let mrca_height = loop {
            let entry = &self.entries[&cursor];
            if self.main_hash_at(entry.height) == Some(cursor) {
                break entry.height;
            }
            apply.push(cursor);
            cursor = entry.raw.prev_hash();
        };
        apply.reverse();

        let undo: Vec<TxHash> = self.height_index[(mrca_height as usize + 1)..]
            .iter()
            .rev()
            .copied()
            .collect();
        (mrca_height, undo, apply)
    }

    /// Commit an `Extended` proposal after the index writer stored the block.
    pub fn commit_extend(&mut self, hash: TxHash) -> Result<(), ChainError> {
        let entry = self
            .entries
            .get(&hash)
            .ok_or_else(|| ChainError::MissingParent(hex::encode(hash)))?;
        if entry.height as usize != self.height_index.len() {
            // Genesis commits during insert; re-commit is a no-op.
            if self.main_hash_at(entry.height) == Some(hash) {
                return Ok(());
            }
            return Err(ChainError::CommitFailed(format!(
                "extend at height {} against index of {}",
                entry.height,
                self.height_index.len()
            )));
        }
        self.height_index.push(hash);
        Ok(())
    }

    /// Flip main pointers after the index writer finished the apply/undo.
    pub fn commit_reorg(
        &mut self,
        mrca_height: u32,
        undo: &[TxHash],
        apply: &[TxHash],
    ) -> Result<(), ChainError> {
        // Orphaned side keeps its entries under a fresh branch id.
        let orphan_branch = self.next_branch_id;
        self.next_branch_id += 1;
        for hash in undo {
            if let Some(entry) = self.entries.get_mut(hash) {
                entry.branch_id = orphan_branch;
            }
        }

        self.height_index.truncate(mrca_height as usize + 1);
        for hash in apply {
            let entry = self
                .entries
                .get_mut(hash)
                .ok_or_else(|| ChainError::CommitFailed(format!("unknown header {}", hex::encode(hash))))?;
            entry.branch_id = MAIN_BRANCH;
            if entry.height as usize != self.height_index.len() {
                return Err(ChainError::CommitFailed(format!(
                    "apply height {} against index of {}",
                    entry.height,
                    self.height_index.len()
                )));
            }
            self.height_index.push(*hash);
        }
        Ok(())
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.values().map(|v| v.len()).sum()
    }
}

impl Default for HeaderChain {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Header with fixed bits over an arbitrary parent; nonce varies the hash.
    fn header(prev: TxHash, nonce: u32) -> RawHeader {
        let mut bytes = [0u8; 80];
        bytes[0..4].copy_from_slice(&2i32.to_le_bytes());
        bytes[4..36].copy_from_slice(&prev);
        bytes[72..76].copy_from_slice(&0x207fffffu32.to_le_bytes());
        bytes[76..80].copy_from_slice(&nonce.to_le_bytes());
        RawHeader { bytes }
    }

    fn extend_and_commit(chain: &mut HeaderChain, raw: RawHeader) -> TxHash {
        let updates = chain.insert(raw, None);
        match &updates[0] {
            ChainUpdate::Extended { hash, .. } => {
                chain.commit_extend(*hash).unwrap();
                *hash
            }
            other => panic!("expected extension, got {:?}", other),
        }
    }

    #[test]
    fn test_linear_growth() {
        let mut chain = HeaderChain::new();
        let g = extend_and_commit(&mut chain, header(ZERO_HASH, 0));
        let a = extend_and_commit(&mut chain, header(g, 1));
        let b = extend_and_commit(&mut chain, header(a, 2));

        assert_eq!(chain.top_height(), Some(2));
        assert_eq!(chain.tip_hash(), Some(b));
        assert!(chain.is_on_main(&a));
        assert_eq!(chain.header_at(1).unwrap().height, 1);
    }

    #[test]
    fn test_shorter_fork_stays_side_branch() {
        let mut chain = HeaderChain::new();
        let g = extend_and_commit(&mut chain, header(ZERO_HASH, 0));
        let a = extend_and_commit(&mut chain, header(g, 1));
        let _b = extend_and_commit(&mut chain, header(a, 2));

        // Fork off g at height 1: less total work than main's 3 blocks.
        let updates = chain.insert(header(g, 99), None);
        assert!(matches!(updates[0], ChainUpdate::SideChain { .. }));
        assert_eq!(chain.top_height(), Some(2));
    }

    #[test]
    fn test_longer_fork_reorgs() {
        let mut chain = HeaderChain::new();
        let g = extend_and_commit(&mut chain, header(ZERO_HASH, 0));
        let a = extend_and_commit(&mut chain, header(g, 1));
        let b = extend_and_commit(&mut chain, header(a, 2));

        // Alternate branch from a: heights 2, 3. At height 2 it's a tie
        // (side chain); height 3 exceeds main work.
        let alt2 = header(a, 50);
        let alt2_hash = alt2.hash();
        let updates = chain.insert(alt2, None);
        assert!(matches!(updates[0], ChainUpdate::SideChain { .. }));

        let alt3 = header(alt2_hash, 51);
        let alt3_hash = alt3.hash();
        let updates = chain.insert(alt3, None);
        match &updates[0] {
            ChainUpdate::Reorg {
                mrca_height,
                undo,
                apply,
            } => {
                assert_eq!(*mrca_height, 1);
                assert_eq!(undo, &vec![b]);
                assert_eq!(apply, &vec![alt2_hash, alt3_hash]);
                chain.commit_reorg(*mrca_height, undo, apply).unwrap();
            }
            other => panic!("expected reorg, got {:?}", other),
        }

        assert_eq!(chain.top_height(), Some(3));
        assert_eq!(chain.tip_hash(), Some(alt3_hash));
        assert!(!chain.is_on_main(&b));
        assert!(chain.is_on_main(&alt2_hash));
        // Orphaned block keeps its entry, off branch 0.
        assert_ne!(chain.get(&b).unwrap().branch_id, MAIN_BRANCH);
    }

    #[test]
    fn test_orphan_held_until_parent_arrives() {
        let mut chain = HeaderChain::new();
        let g_raw = header(ZERO_HASH, 0);
        let g_hash = g_raw.hash();
        let child = header(g_hash, 1);

        let updates = chain.insert(child, None);
        assert!(matches!(updates[0], ChainUpdate::Orphaned { .. }));
        assert_eq!(chain.orphan_count(), 1);

        let updates = chain.insert(g_raw, None);
        assert_eq!(updates.len(), 2);
        assert!(matches!(updates[0], ChainUpdate::Extended { height: 0, .. }));
        assert!(matches!(updates[1], ChainUpdate::Extended { height: 1, .. }));
        assert_eq!(chain.orphan_count(), 0);
    }

    #[test]
    fn test_duplicate_backfills_location() {
        let mut chain = HeaderChain::new();
        let g = header(ZERO_HASH, 0);
        chain.insert(g, None);
        let loc = BlockLocation {
            file_number: 0,
            offset: 8,
            size: 285,
        };
        let updates = chain.insert(g, Some(loc));
        assert!(matches!(updates[0], ChainUpdate::Duplicate { .. }));
        assert_eq!(chain.location_of(&g.hash()), Some(loc));
    }
}
