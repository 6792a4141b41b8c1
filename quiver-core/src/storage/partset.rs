//! Immutable snapshot of the live data sources

use crate::mempart::MemPart;
use crate::part::{PartHandle, PartMeta};
use crate::TimeRange;
use std::sync::Arc;

/// Frozen MemParts awaiting flush plus committed parts
///
/// Published through `ArcSwap`; every change builds a new set, so a reader
/// holding one keeps a consistent view.
#[derive(Default)]
pub struct PartSet {
    /// Frozen MemParts, oldest first
    pub memparts: Vec<Arc<MemPart>>,
    /// Committed parts, ascending by ID
    pub parts: Vec<Arc<PartHandle>>,
}

impl PartSet {
    pub fn new(parts: Vec<Arc<PartHandle>>) -> Self {
        Self {
            memparts: Vec::new(),
            parts,
        }
    }

    /// Copy with `mempart` appended
    pub fn with_mempart(&self, mempart: Arc<MemPart>) -> Self {
        let mut memparts = self.memparts.clone();
        memparts.push(mempart);
        Self {
            memparts,
            parts: self.parts.clone(),
        }
    }

    /// Copy with parts removed, one part added and one MemPart retired
    pub fn apply(&self, add: Option<&Arc<PartHandle>>, remove: &[u64], retire_mempart: Option<u64>) -> Self {
        let mut parts: Vec<Arc<PartHandle>> = self
            .parts
            .iter()
            .filter(|p| !remove.contains(&p.id()))
            .cloned()
            .collect();
        if let Some(part) = add {
            parts.push(part.clone());
            parts.sort_by_key(|p| p.id());
        }
        let memparts = self
            .memparts
            .iter()
            .filter(|m| Some(m.id()) != retire_mempart)
            .cloned()
            .collect();
        Self { memparts, parts }
    }

    pub fn get(&self, part_id: u64) -> Option<&Arc<PartHandle>> {
        self.parts.iter().find(|p| p.id() == part_id)
    }

    pub fn metas(&self) -> Vec<PartMeta> {
        self.parts.iter().map(|p| p.meta().clone()).collect()
    }

    /// Parts neither merging nor quarantined
    pub fn idle_parts(&self) -> Vec<Arc<PartHandle>> {
        self.parts
            .iter()
            .filter(|p| !p.is_in_merge() && !p.is_quarantined())
            .cloned()
            .collect()
    }

    /// Searchable parts overlapping `range`
    pub fn parts_overlapping(&self, range: &TimeRange) -> Vec<Arc<PartHandle>> {
        self.parts
            .iter()
            .filter(|p| !p.is_quarantined() && p.meta().overlaps(range))
            .cloned()
            .collect()
    }
}
