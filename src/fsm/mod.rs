#![forbid(unsafe_code)]

//! Free-space map: per data page, a coarse bucket of its free bytes.
//!
//! The map file is a sequence of 4096-byte pages. Every leaf page (1..)
//! stores a complete binary max-tree over 2048 slots, one byte per node,
//! node `i` at byte `i`, slots at nodes `2048..4096`. Page 0 carries the
//! header and a second max-tree whose slots are the roots of the leaf pages,
//! so both update and search touch two trees of height 11 and 10.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::primitives::io::FileIo;
use crate::types::{Result, StorageError};

/// Size of one map page.
pub const MAP_PAGE_SIZE: usize = 4096;
/// Data pages tracked per leaf page.
pub const SLOTS_PER_LEAF: usize = 2048;
/// Leaf pages addressable from the header page.
pub const MAX_LEAF_PAGES: usize = 1024;
/// Number of distinct buckets.
pub const BUCKETS: usize = 256;

const FSM_MAGIC: [u8; 4] = *b"PNFS";
const FSM_FORMAT_VERSION: u16 = 1;
const TOP_TREE_OFFSET: usize = 64;

/// Sets slot `slot` of the tree at `base` and refreshes its ancestors.
fn tree_set(page: &mut [u8], base: usize, leaves: usize, slot: usize, value: u8) {
    let mut node = leaves + slot;
    page[base + node] = value;
    while node > 1 {
        node /= 2;
        page[base + node] = page[base + 2 * node].max(page[base + 2 * node + 1]);
    }
}

/// Leftmost slot whose value is at least `target`. The caller checks the root.
fn tree_descend(page: &[u8], base: usize, leaves: usize, target: u8) -> usize {
    let mut node = 1;
    while node < leaves {
        node = if page[base + 2 * node] >= target {
            2 * node
        } else {
            2 * node + 1
        };
    }
    node - leaves
}

fn tree_rebuild(page: &mut [u8], base: usize, leaves: usize) {
    for node in (1..leaves).rev() {
        page[base + node] = page[base + 2 * node].max(page[base + 2 * node + 1]);
    }
}

struct MapState {
    header: Vec<u8>,
    leaves: Vec<Vec<u8>>,
    tracked: u64,
    dirty: BTreeSet<usize>,
}

impl MapState {
    fn fresh() -> Self {
        Self {
            header: vec![0u8; MAP_PAGE_SIZE],
            leaves: Vec::new(),
            tracked: 0,
            dirty: BTreeSet::from([0]),
        }
    }

    fn encode_header(&mut self) {
        self.header[0..4].copy_from_slice(&FSM_MAGIC);
        self.header[4..6].copy_from_slice(&FSM_FORMAT_VERSION.to_be_bytes());
        self.header[8..16].copy_from_slice(&self.tracked.to_be_bytes());
        self.header[16..20].copy_from_slice(&(self.leaves.len() as u32).to_be_bytes());
    }

    fn root(&self) -> u8 {
        self.header[TOP_TREE_OFFSET + 1]
    }
}

/// Bucketed free-space index over the pages of one data file.
pub struct FreeSpaceMap {
    io: Arc<dyn FileIo>,
    interval: usize,
    state: RwLock<MapState>,
}

impl FreeSpaceMap {
    /// Creates an empty map, discarding whatever `io` held.
    pub fn create(io: Arc<dyn FileIo>, data_page_size: usize) -> Result<Self> {
        let map = Self::with_state(io, data_page_size, MapState::fresh())?;
        map.io.truncate(0)?;
        map.flush()?;
        Ok(map)
    }

    /// Loads a map written by [`FreeSpaceMap::flush`]; an empty file yields
    /// an empty map. Internal tree nodes are recomputed from the stored slots.
    pub fn open(io: Arc<dyn FileIo>, data_page_size: usize) -> Result<Self> {
        let data = io.read_all()?;
        if data.is_empty() {
            return Self::with_state(io, data_page_size, MapState::fresh());
        }
        if data.len() < MAP_PAGE_SIZE || data[0..4] != FSM_MAGIC {
            return Err(StorageError::Corruption("free-space map magic mismatch"));
        }
        if data[4..6] != FSM_FORMAT_VERSION.to_be_bytes() {
            return Err(StorageError::Corruption("free-space map format version mismatch"));
        }
        let stored_tracked = u64::from_be_bytes(data[8..16].try_into().unwrap());
        let leaf_pages = u32::from_be_bytes(data[16..20].try_into().unwrap()) as usize;
        if leaf_pages > MAX_LEAF_PAGES || data.len() < (1 + leaf_pages) * MAP_PAGE_SIZE {
            return Err(StorageError::Corruption("free-space map truncated"));
        }
        let mut header = data[..MAP_PAGE_SIZE].to_vec();
        header[TOP_TREE_OFFSET..TOP_TREE_OFFSET + 2 * MAX_LEAF_PAGES].fill(0);
        let mut leaves = Vec::with_capacity(leaf_pages);
        let mut tracked = stored_tracked;
        for leaf_no in 0..leaf_pages {
            let start = (1 + leaf_no) * MAP_PAGE_SIZE;
            let mut leaf = data[start..start + MAP_PAGE_SIZE].to_vec();
            tree_rebuild(&mut leaf, 0, SLOTS_PER_LEAF);
            if let Some(last) = leaf[SLOTS_PER_LEAF..].iter().rposition(|&b| b != 0) {
                tracked = tracked.max((leaf_no * SLOTS_PER_LEAF + last + 1) as u64);
            }
            tree_set(&mut header, TOP_TREE_OFFSET, MAX_LEAF_PAGES, leaf_no, leaf[1]);
            leaves.push(leaf);
        }
        if tracked != stored_tracked {
            warn!(stored_tracked, tracked, "fsm.open.tracked_mismatch");
        }
        debug!(leaf_pages, tracked, "fsm.open");
        Self::with_state(
            io,
            data_page_size,
            MapState {
                header,
                leaves,
                tracked,
                dirty: BTreeSet::new(),
            },
        )
    }

    fn with_state(io: Arc<dyn FileIo>, data_page_size: usize, state: MapState) -> Result<Self> {
        if data_page_size < BUCKETS {
            return Err(StorageError::Invalid("data page size too small for free-space map"));
        }
        Ok(Self {
            io,
            interval: data_page_size / BUCKETS,
            state: RwLock::new(state),
        })
    }

    /// Bytes represented by one bucket step.
    pub fn interval(&self) -> usize {
        self.interval
    }

    /// Normalized bucket for `free` bytes, rounded down.
    pub fn bucket_of(&self, free: usize) -> u8 {
        (free / self.interval).min(BUCKETS - 1) as u8
    }

    /// Records that data page `page_index` has `free` bytes available and
    /// returns the largest bucket held by any page afterwards.
    pub fn update_page_max_free_space(&self, page_index: u32, free: usize) -> Result<u8> {
        let leaf_no = page_index as usize / SLOTS_PER_LEAF;
        let slot = page_index as usize % SLOTS_PER_LEAF;
        if leaf_no >= MAX_LEAF_PAGES {
            return Err(StorageError::Invalid("page index beyond free-space map capacity"));
        }
        let bucket = self.bucket_of(free);
        let mut state = self.state.write();
        while state.leaves.len() <= leaf_no {
            let new_leaf = state.leaves.len();
            state.leaves.push(vec![0u8; MAP_PAGE_SIZE]);
            state.dirty.insert(1 + new_leaf);
        }
        let leaf = &mut state.leaves[leaf_no];
        tree_set(leaf, 0, SLOTS_PER_LEAF, slot, bucket);
        let leaf_root = leaf[1];
        tree_set(&mut state.header, TOP_TREE_OFFSET, MAX_LEAF_PAGES, leaf_no, leaf_root);
        state.tracked = state.tracked.max(u64::from(page_index) + 1);
        state.dirty.insert(0);
        state.dirty.insert(1 + leaf_no);
        Ok(state.root())
    }

    /// Lowest page index known to have more than `min_free` bytes free.
    pub fn find_page(&self, min_free: usize) -> Option<u32> {
        let target = min_free / self.interval + 1;
        if target >= BUCKETS {
            return None;
        }
        let target = target as u8;
        let state = self.state.read();
        if state.root() < target {
            return None;
        }
        let leaf_no = tree_descend(&state.header, TOP_TREE_OFFSET, MAX_LEAF_PAGES, target);
        let leaf = state.leaves.get(leaf_no)?;
        let slot = tree_descend(leaf, 0, SLOTS_PER_LEAF, target);
        u32::try_from(leaf_no * SLOTS_PER_LEAF + slot).ok()
    }

    /// Lower bound of the free bytes recorded for `page_index`; zero when
    /// the page is not tracked.
    pub fn page_free_space(&self, page_index: u32) -> usize {
        let leaf_no = page_index as usize / SLOTS_PER_LEAF;
        let slot = page_index as usize % SLOTS_PER_LEAF;
        let state = self.state.read();
        state
            .leaves
            .get(leaf_no)
            .map_or(0, |leaf| usize::from(leaf[SLOTS_PER_LEAF + slot]) * self.interval)
    }

    /// Largest bucket held by any page.
    pub fn max_free_bucket(&self) -> u8 {
        self.state.read().root()
    }

    /// One past the highest page index ever updated.
    pub fn tracked_pages(&self) -> u64 {
        self.state.read().tracked
    }

    /// Writes dirty map pages and syncs the file.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.state.write();
        if state.dirty.is_empty() {
            return Ok(());
        }
        state.encode_header();
        let dirty = std::mem::take(&mut state.dirty);
        // Leaves first so the header never counts a leaf that is missing on disk.
        for &page_no in dirty.iter().rev() {
            let bytes = if page_no == 0 {
                &state.header
            } else {
                &state.leaves[page_no - 1]
            };
            self.io.write_at((page_no * MAP_PAGE_SIZE) as u64, bytes)?;
        }
        self.io.sync_all()?;
        debug!(pages = dirty.len(), tracked = state.tracked, "fsm.flush");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::io::StdFileIo;
    use tempfile::tempdir;

    fn map_at(path: &std::path::Path) -> Result<FreeSpaceMap> {
        FreeSpaceMap::open(Arc::new(StdFileIo::open(path)?), 65536)
    }

    #[test]
    fn finds_pages_with_strictly_more_space() -> Result<()> {
        let dir = tempdir()?;
        let map = map_at(&dir.path().join("data_1.fsm"))?;
        map.update_page_max_free_space(3, 2048)?;
        map.update_page_max_free_space(4, 5029)?;
        let max = map.update_page_max_free_space(5, 10029)?;
        assert_eq!(max, map.bucket_of(10029));
        assert_eq!(map.find_page(2048), Some(4));
        assert_eq!(map.find_page(5080), Some(5));
        assert_eq!(map.find_page(20000), None);
        assert_eq!(map.find_page(100), Some(3));
        Ok(())
    }

    #[test]
    fn shrinking_a_page_moves_it_out_of_its_bucket() -> Result<()> {
        let dir = tempdir()?;
        let map = map_at(&dir.path().join("data_1.fsm"))?;
        map.update_page_max_free_space(7, 60000)?;
        map.update_page_max_free_space(9000, 30000)?;
        assert_eq!(map.find_page(40000), Some(7));
        let max = map.update_page_max_free_space(7, 0)?;
        assert_eq!(max, map.bucket_of(30000));
        assert_eq!(map.find_page(40000), None);
        assert_eq!(map.find_page(20000), Some(9000));
        assert_eq!(map.tracked_pages(), 9001);
        Ok(())
    }

    #[test]
    fn flush_and_reopen_keeps_buckets() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("data_1.fsm");
        {
            let map = map_at(&path)?;
            map.update_page_max_free_space(1, 1000)?;
            map.update_page_max_free_space(4100, 40000)?;
            map.flush()?;
        }
        let map = map_at(&path)?;
        assert_eq!(map.tracked_pages(), 4101);
        assert_eq!(map.page_free_space(1), 1000 / 256 * 256);
        assert_eq!(map.find_page(1000), Some(4100));
        assert_eq!(map.max_free_bucket(), map.bucket_of(40000));
        Ok(())
    }

    #[test]
    fn capacity_is_bounded() -> Result<()> {
        let dir = tempdir()?;
        let map = map_at(&dir.path().join("data_1.fsm"))?;
        let beyond = (MAX_LEAF_PAGES * SLOTS_PER_LEAF) as u32;
        assert!(matches!(
            map.update_page_max_free_space(beyond, 10),
            Err(StorageError::Invalid(_))
        ));
        map.update_page_max_free_space(beyond - 1, 65536)?;
        assert_eq!(map.find_page(65000), Some(beyond - 1));
        Ok(())
    }

    #[test]
    fn garbage_header_is_corruption() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("data_1.fsm");
        let io = StdFileIo::open(&path)?;
        io.write_at(0, &[0xAB; MAP_PAGE_SIZE])?;
        assert!(matches!(
            FreeSpaceMap::open(Arc::new(io), 65536),
            Err(StorageError::Corruption(_))
        ));
        Ok(())
    }
}
