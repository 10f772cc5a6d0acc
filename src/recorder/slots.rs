//! Ring slot bookkeeping: `{dir}/{index}.{ext}` files and their finalize state.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct RingSlot {
    pub index: usize,
    pub path: PathBuf,
    pub finalized: bool,
    pub last_modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct SlotTable {
    slots: Vec<RingSlot>,
}

impl SlotTable {
    /// All slots empty.
    pub fn new(dir: &Path, extension: &str, count: usize) -> Self {
        let slots = (0..count)
            .map(|index| RingSlot {
                index,
                path: slot_path(dir, extension, index),
                finalized: false,
                last_modified: None,
            })
            .collect();
        Self { slots }
    }

    /// Slots whose file already exists are treated as finalized by a
    /// previous session.
    pub fn scan(dir: &Path, extension: &str, count: usize) -> std::io::Result<Self> {
        let mut table = Self::new(dir, extension, count);
        for slot in &mut table.slots {
            match std::fs::metadata(&slot.path) {
                Ok(meta) if meta.is_file() => {
                    slot.finalized = true;
                    slot.last_modified = meta.modified().ok().map(DateTime::<Utc>::from);
                    debug!(
                        slot = slot.index,
                        path = %slot.path.display(),
                        "found existing segment"
                    );
                }
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&RingSlot> {
        self.slots.get(index)
    }

    pub fn path(&self, index: usize) -> &Path {
        &self.slots[index % self.slots.len()].path
    }

    pub fn all(&self) -> &[RingSlot] {
        &self.slots
    }

    /// The slot is about to be rewritten.
    pub fn invalidate(&mut self, index: usize) {
        if let Some(slot) = self.slots.get_mut(index) {
            slot.finalized = false;
            slot.last_modified = None;
        }
    }

    pub fn mark_finalized(&mut self, index: usize, at: DateTime<Utc>) {
        if let Some(slot) = self.slots.get_mut(index) {
            slot.finalized = true;
            slot.last_modified = Some(at);
        }
    }

    /// Most recently modified finalized slot.
    pub fn most_recent(&self) -> Option<usize> {
        self.slots
            .iter()
            .filter(|s| s.finalized)
            .filter_map(|s| s.last_modified.map(|t| (t, s.index)))
            .max()
            .map(|(_, index)| index)
    }

    /// Up to `k` finalized slots, oldest first, walking the ring backwards
    /// from the slot just before `next_index`.
    pub fn latest_finalized(&self, next_index: usize, k: usize) -> Vec<RingSlot> {
        let n = self.slots.len();
        if n == 0 || k == 0 {
            return Vec::new();
        }
        let mut picked: Vec<RingSlot> = (1..=n)
            .map(|back| (next_index % n + n - back) % n)
            .map(|i| &self.slots[i])
            .filter(|s| s.finalized)
            .take(k)
            .cloned()
            .collect();
        picked.reverse();
        picked
    }
}

fn slot_path(dir: &Path, extension: &str, index: usize) -> PathBuf {
    dir.join(format!("{index}.{extension}"))
}
