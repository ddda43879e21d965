use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::*;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use crate::address::{DieId, Pbn, PlaneId, Ppn};
use crate::config::{BaseType, CoreId, Granularity, GeometryConfig};
use crate::error::{FtlError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockKind {
    Empty,
    Data,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlaneState {
    Idle,
    NeedBackgroundGc,
    NeedForegroundGc,
    Collecting,
}

/// Per-block bookkeeping. `valid_pages` always equals the popcount of the bitmap.
#[derive(Clone, Debug)]
pub struct BlockStateEntry {
    valid_pages: u32,
    pages: u32,
    pub kind: BlockKind,
    pub owner: Option<CoreId>,
    pub erase_count: u32,
    /// Next page to program.
    pub write_cursor: u32,
    /// Pages handed out but not yet mapped or abandoned.
    pub in_flight: u32,
    valid: Vec<u64>,
}

impl BlockStateEntry {
    pub fn new(pages: u32) -> Self {
        BlockStateEntry {
            valid_pages: 0,
            pages,
            kind: BlockKind::Empty,
            owner: None,
            erase_count: 0,
            write_cursor: 0,
            in_flight: 0,
            valid: vec![0; (pages as usize + 63) / 64],
        }
    }

    pub fn valid_pages(&self) -> u32 {
        self.valid_pages
    }

    pub fn invalid_pages(&self) -> u32 {
        self.write_cursor.saturating_sub(self.valid_pages)
    }

    pub fn full(&self) -> bool {
        self.write_cursor == self.pages
    }

    pub fn is_valid(&self, page: u32) -> bool {
        self.valid[page as usize / 64] & (1 << (page % 64)) != 0
    }

    /// Flip one page bit. Returns false when the bit already had that value.
    pub fn set_valid(&mut self, page: u32, valid: bool) -> bool {
        debug_assert!(page < self.pages, "page {} outside block of {}", page, self.pages);

        let word = &mut self.valid[page as usize / 64];
        let mask = 1u64 << (page % 64);
        if (*word & mask != 0) == valid {
            return false;
        }
        if valid {
            *word |= mask;
            self.valid_pages += 1;
        } else {
            *word &= !mask;
            self.valid_pages -= 1;
        }
        true
    }

    pub fn valid_page_indices(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.pages).filter(move |&page| self.is_valid(page))
    }

    pub fn popcount(&self) -> u32 {
        self.valid.iter().map(|w| w.count_ones()).sum()
    }

    fn reset(&mut self) {
        self.valid.iter_mut().for_each(|w| *w = 0);
        self.valid_pages = 0;
        self.write_cursor = 0;
        self.owner = None;
    }
}

/// On-disk form of one block entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockRecord {
    pub kind: BlockKind,
    pub erase_count: u32,
    pub write_cursor: u32,
    pub valid: Vec<u64>,
}

const NIL: u32 = u32::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListKind {
    Empty,
    Victim,
}

#[derive(Clone, Copy)]
struct Link {
    prev: u32,
    next: u32,
    member: Option<ListKind>,
}

#[derive(Clone, Copy)]
struct ListHead {
    head: u32,
    tail: u32,
    len: usize,
}

impl ListHead {
    const fn new() -> Self {
        ListHead { head: NIL, tail: NIL, len: 0 }
    }
}

/// Empty and victim lists of one plane, doubly linked through an arena indexed by block number.
pub struct BlockLists {
    links: Vec<Link>,
    empty: ListHead,
    victim: ListHead,
}

impl BlockLists {
    pub fn new(blocks: usize) -> Self {
        BlockLists {
            links: vec![Link { prev: NIL, next: NIL, member: None }; blocks],
            empty: ListHead::new(),
            victim: ListHead::new(),
        }
    }

    fn head_mut(&mut self, list: ListKind) -> &mut ListHead {
        match list {
            ListKind::Empty => &mut self.empty,
            ListKind::Victim => &mut self.victim,
        }
    }

    fn head(&self, list: ListKind) -> &ListHead {
        match list {
            ListKind::Empty => &self.empty,
            ListKind::Victim => &self.victim,
        }
    }

    pub fn len(&self, list: ListKind) -> usize {
        self.head(list).len
    }

    pub fn member(&self, block: u32) -> Option<ListKind> {
        self.links[block as usize].member
    }

    pub fn push_back(&mut self, list: ListKind, block: u32) {
        debug_assert!(self.links[block as usize].member.is_none(), "block {} already listed", block);

        let tail = self.head(list).tail;
        self.links[block as usize] = Link { prev: tail, next: NIL, member: Some(list) };
        if tail == NIL {
            self.head_mut(list).head = block;
        } else {
            self.links[tail as usize].next = block;
        }
        let head = self.head_mut(list);
        head.tail = block;
        head.len += 1;
    }

    pub fn pop_front(&mut self, list: ListKind) -> Option<u32> {
        let block = self.head(list).head;
        if block == NIL {
            return None;
        }
        self.remove(block);
        Some(block)
    }

    /// Unlink `block` from whichever list holds it. Returns the list it was on.
    pub fn remove(&mut self, block: u32) -> Option<ListKind> {
        let Link { prev, next, member } = self.links[block as usize];
        let list = member?;
        if prev == NIL {
            self.head_mut(list).head = next;
        } else {
            self.links[prev as usize].next = next;
        }
        if next == NIL {
            self.head_mut(list).tail = prev;
        } else {
            self.links[next as usize].prev = prev;
        }
        self.head_mut(list).len -= 1;
        self.links[block as usize] = Link { prev: NIL, next: NIL, member: None };
        Some(list)
    }

    pub fn iter(&self, list: ListKind) -> ListIter<'_> {
        ListIter { links: &self.links, cursor: self.head(list).head }
    }
}

pub struct ListIter<'a> {
    links: &'a [Link],
    cursor: u32,
}

impl<'a> Iterator for ListIter<'a> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.cursor == NIL {
            return None;
        }
        let block = self.cursor;
        self.cursor = self.links[block as usize].next;
        Some(block)
    }
}

struct PlaneInfo {
    blocks: Vec<Mutex<BlockStateEntry>>,
    lists: Mutex<BlockLists>,
    state: Mutex<PlaneState>,
    gc_lock: Mutex<()>,
}

struct DieInfo {
    empty: AtomicUsize,
    gc_lock: Mutex<()>,
}

/// Owns every block's state and the per-plane empty/victim pools.
///
/// Lock order: plane lists, then at most one block entry.
pub struct BlockManager {
    cfg: Arc<GeometryConfig>,
    planes: Vec<PlaneInfo>,
    dies: Vec<DieInfo>,
    empty: AtomicUsize,
    gc_lock: Mutex<()>,
    background: AtomicUsize,
    foreground: AtomicUsize,
}

impl BlockManager {
    /// Fresh device: every block empty and queued in block order.
    pub fn new(cfg: Arc<GeometryConfig>) -> Self {
        let pages = cfg.pages_per_block as u32;
        let mut planes = Vec::with_capacity(cfg.planes());
        for _ in 0..cfg.planes() {
            let mut lists = BlockLists::new(cfg.blocks_per_plane);
            for block in 0..cfg.blocks_per_plane as u32 {
                lists.push_back(ListKind::Empty, block);
            }
            planes.push(PlaneInfo {
                blocks: (0..cfg.blocks_per_plane).map(|_| Mutex::new(BlockStateEntry::new(pages))).collect(),
                lists: Mutex::new(lists),
                state: Mutex::new(PlaneState::Idle),
                gc_lock: Mutex::new(()),
            });
        }
        let per_die = cfg.blocks_in(Granularity::Die);
        let dies = (0..cfg.dies())
            .map(|_| DieInfo { empty: AtomicUsize::new(per_die), gc_lock: Mutex::new(()) })
            .collect();

        BlockManager {
            empty: AtomicUsize::new(cfg.blocks()),
            cfg,
            planes,
            dies,
            gc_lock: Mutex::new(()),
            background: AtomicUsize::new(0),
            foreground: AtomicUsize::new(0),
        }
    }

    /// Rebuild from persisted records and list orders. Blocks on neither list are open write targets.
    pub fn restore(
        cfg: Arc<GeometryConfig>,
        records: Vec<BlockRecord>,
        empty: Vec<Vec<u32>>,
        victim: Vec<Vec<u32>>,
    ) -> Result<Self> {
        if records.len() != cfg.blocks() || empty.len() != cfg.planes() || victim.len() != cfg.planes() {
            return Err(FtlError::InvalidConfig("persisted block table does not match geometry".into()));
        }
        let out = BlockManager::new(cfg.clone());
        let words = (cfg.pages_per_block + 63) / 64;
        for (index, record) in records.into_iter().enumerate() {
            if record.valid.len() != words || record.write_cursor as BaseType > cfg.pages_per_block {
                return Err(FtlError::InvalidConfig(format!("persisted block {} is malformed", index)));
            }
            let pbn = Pbn::from_linear(&cfg, index as u64)?;
            let mut entry = out.entry(pbn);
            entry.kind = record.kind;
            entry.erase_count = record.erase_count;
            entry.write_cursor = record.write_cursor;
            entry.valid = record.valid;
            entry.valid_pages = entry.popcount();
        }
        for (plane_id, (empty, victim)) in empty.into_iter().zip(victim).enumerate() {
            let mut lists = out.planes[plane_id].lists.lock();
            *lists = BlockLists::new(cfg.blocks_per_plane);
            for (list, blocks) in [(ListKind::Empty, empty), (ListKind::Victim, victim)] {
                for block in blocks {
                    if block as BaseType >= cfg.blocks_per_plane || lists.member(block).is_some() {
                        return Err(FtlError::InvalidConfig(format!("persisted list entry {} is malformed", block)));
                    }
                    lists.push_back(list, block);
                }
            }
        }
        out.recount();
        Ok(out)
    }

    fn recount(&self) {
        let mut total = 0;
        for die in 0..self.cfg.dies() {
            let n: usize = self.die_planes(die).map(|p| self.planes[p].lists.lock().len(ListKind::Empty)).sum();
            self.dies[die].empty.store(n, Ordering::SeqCst);
            total += n;
        }
        self.empty.store(total, Ordering::SeqCst);
    }

    pub fn config(&self) -> &GeometryConfig {
        &self.cfg
    }

    pub fn entry(&self, pbn: Pbn) -> MutexGuard<'_, BlockStateEntry> {
        self.planes[pbn.plane_id(&self.cfg)].blocks[pbn.block as usize].lock()
    }

    pub fn lists(&self, plane: PlaneId) -> MutexGuard<'_, BlockLists> {
        self.planes[plane].lists.lock()
    }

    pub fn die_planes(&self, die: DieId) -> Range<PlaneId> {
        die * self.cfg.planes_per_die..(die + 1) * self.cfg.planes_per_die
    }

    /// Planes sharing a scope of `granularity` with `plane`.
    pub fn scope_planes(&self, granularity: Granularity, plane: PlaneId) -> Range<PlaneId> {
        match granularity {
            Granularity::Plane => plane..plane + 1,
            Granularity::Die => self.die_planes(plane / self.cfg.planes_per_die),
            Granularity::Device => 0..self.cfg.planes(),
        }
    }

    pub fn empty_blocks(&self, granularity: Granularity, plane: PlaneId) -> usize {
        match granularity {
            Granularity::Plane => self.planes[plane].lists.lock().len(ListKind::Empty),
            Granularity::Die => self.dies[plane / self.cfg.planes_per_die].empty.load(Ordering::SeqCst),
            Granularity::Device => self.empty.load(Ordering::SeqCst),
        }
    }

    /// Planes to try for an empty block: `locator`'s scope first, widening one step at a time up to `widest`.
    pub fn search_order(&self, granularity: Granularity, locator: PlaneId, widest: Granularity) -> Vec<PlaneId> {
        let mut order: Vec<PlaneId> = Vec::with_capacity(self.cfg.planes());
        let mut scope = Some(granularity);
        while let Some(current) = scope {
            let range = self.scope_planes(current, locator);
            let len = range.len();
            // rotate so the search starts at the locator, not at the scope's first plane
            let offset = locator - range.start;
            for i in 0..len {
                let p = range.start + (offset + i) % len;
                if !order.contains(&p) {
                    order.push(p);
                }
            }
            if current == widest || !widest.covers(current) {
                break;
            }
            scope = current.wider();
        }
        order
    }

    /// Pop an empty block, starting at `locator` and widening up to `widest`.
    ///
    /// Planes under collection are skipped unless `allow_collecting`.
    pub fn pop_empty(
        &self,
        granularity: Granularity,
        locator: PlaneId,
        widest: Granularity,
        allow_collecting: bool,
    ) -> Option<Pbn> {
        for plane in self.search_order(granularity, locator, widest) {
            if !allow_collecting && self.plane_state(plane) == PlaneState::Collecting {
                continue;
            }
            let block = self.planes[plane].lists.lock().pop_front(ListKind::Empty);
            if let Some(block) = block {
                self.count_empty(plane, -1);
                let pbn = Pbn::in_plane(&self.cfg, plane, block);
                trace!("pop empty {} ({} left on plane)", pbn, self.empty_blocks(Granularity::Plane, plane));
                return Some(pbn);
            }
        }
        None
    }

    pub fn push_empty(&self, pbn: Pbn) -> Result<()> {
        pbn.check(&self.cfg)?;
        let plane = pbn.plane_id(&self.cfg);
        {
            let entry = self.entry(pbn);
            debug_assert_eq!(entry.kind, BlockKind::Empty, "pushing non-empty block {} to empty list", pbn);
            debug_assert_eq!(entry.valid_pages, 0);
        }
        self.planes[plane].lists.lock().push_back(ListKind::Empty, pbn.block);
        self.count_empty(plane, 1);
        Ok(())
    }

    pub fn push_victim(&self, pbn: Pbn) -> Result<()> {
        pbn.check(&self.cfg)?;
        self.planes[pbn.plane_id(&self.cfg)].lists.lock().push_back(ListKind::Victim, pbn.block);
        Ok(())
    }

    /// Take `pbn` off the victim list. False if it was not there.
    pub fn pop_victim(&self, pbn: Pbn) -> Result<bool> {
        pbn.check(&self.cfg)?;
        let mut lists = self.planes[pbn.plane_id(&self.cfg)].lists.lock();
        if lists.member(pbn.block) != Some(ListKind::Victim) {
            return Ok(false);
        }
        lists.remove(pbn.block);
        Ok(true)
    }

    fn count_empty(&self, plane: PlaneId, delta: isize) {
        let die = plane / self.cfg.planes_per_die;
        if delta >= 0 {
            self.dies[die].empty.fetch_add(delta as usize, Ordering::SeqCst);
            self.empty.fetch_add(delta as usize, Ordering::SeqCst);
        } else {
            self.dies[die].empty.fetch_sub(delta.unsigned_abs(), Ordering::SeqCst);
            self.empty.fetch_sub(delta.unsigned_abs(), Ordering::SeqCst);
        }
    }

    pub fn set_valid(&self, ppn: Ppn, valid: bool) -> Result<()> {
        ppn.check(&self.cfg)?;
        let changed = self.entry(ppn.pbn()).set_valid(ppn.page, valid);
        if !changed {
            warn!("page {} already {}", ppn, if valid { "valid" } else { "invalid" });
        }
        Ok(())
    }

    pub fn is_valid(&self, ppn: Ppn) -> Result<bool> {
        ppn.check(&self.cfg)?;
        Ok(self.entry(ppn.pbn()).is_valid(ppn.page))
    }

    /// Going to `Empty` wipes the bitmap and write cursor.
    pub fn set_block_type(&self, pbn: Pbn, kind: BlockKind) -> Result<()> {
        pbn.check(&self.cfg)?;
        let mut entry = self.entry(pbn);
        if kind == BlockKind::Empty {
            entry.reset();
        }
        entry.kind = kind;
        Ok(())
    }

    pub fn record_erase(&self, pbn: Pbn) -> Result<u32> {
        pbn.check(&self.cfg)?;
        let mut entry = self.entry(pbn);
        entry.erase_count += 1;
        Ok(entry.erase_count)
    }

    /// Greedy pick over the victim lists of `planes`: fewest valid pages wins, a dead block ends the scan.
    ///
    /// Blocks that are entirely valid are never worth collecting.
    pub fn select_victim(&self, planes: Range<PlaneId>) -> Option<Pbn> {
        let mut best: Option<(u32, Pbn)> = None;
        for plane in planes {
            let lists = self.planes[plane].lists.lock();
            for block in lists.iter(ListKind::Victim) {
                let entry = self.planes[plane].blocks[block as usize].lock();
                if entry.kind != BlockKind::Data || entry.in_flight > 0 {
                    continue;
                }
                let valid = entry.valid_pages;
                let pbn = Pbn::in_plane(&self.cfg, plane, block);
                if valid == 0 {
                    return Some(pbn);
                }
                if best.map_or(true, |(min, _)| valid < min) {
                    best = Some((valid, pbn));
                }
            }
        }
        match best {
            Some((valid, _)) if valid as BaseType >= self.cfg.pages_per_block => None,
            other => other.map(|(_, pbn)| pbn),
        }
    }

    pub fn plane_state(&self, plane: PlaneId) -> PlaneState {
        *self.planes[plane].state.lock()
    }

    /// Returns the previous state.
    pub fn set_plane_state(&self, plane: PlaneId, state: PlaneState) -> PlaneState {
        let mut current = self.planes[plane].state.lock();
        let old = std::mem::replace(&mut *current, state);
        if old != state {
            self.tally(old, -1);
            self.tally(state, 1);
            debug!("plane {} {:?} -> {:?}", plane, old, state);
        }
        old
    }

    /// Move to `state` unless the plane is being collected. Returns the state actually in effect.
    pub fn raise_plane_state(&self, plane: PlaneId, state: PlaneState) -> PlaneState {
        let mut current = self.planes[plane].state.lock();
        if *current == PlaneState::Collecting || *current == state {
            return *current;
        }
        let old = std::mem::replace(&mut *current, state);
        self.tally(old, -1);
        self.tally(state, 1);
        debug!("plane {} {:?} -> {:?}", plane, old, state);
        state
    }

    /// Mark the plane as under collection. `None` if somebody already is collecting it.
    pub fn begin_collect(&self, plane: PlaneId) -> Option<PlaneState> {
        let mut current = self.planes[plane].state.lock();
        if *current == PlaneState::Collecting {
            return None;
        }
        let old = std::mem::replace(&mut *current, PlaneState::Collecting);
        self.tally(old, -1);
        Some(old)
    }

    fn tally(&self, state: PlaneState, delta: isize) {
        let counter = match state {
            PlaneState::NeedBackgroundGc => &self.background,
            PlaneState::NeedForegroundGc => &self.foreground,
            _ => return,
        };
        if delta > 0 {
            counter.fetch_add(1, Ordering::SeqCst);
        } else {
            counter.fetch_sub(1, Ordering::SeqCst);
        }
    }

    pub fn planes_needing_foreground(&self) -> usize {
        self.foreground.load(Ordering::SeqCst)
    }

    pub fn planes_needing_background(&self) -> usize {
        self.background.load(Ordering::SeqCst)
    }

    pub fn try_lock_plane(&self, plane: PlaneId) -> Option<MutexGuard<'_, ()>> {
        self.planes[plane].gc_lock.try_lock()
    }

    pub fn try_lock_die(&self, die: DieId) -> Option<MutexGuard<'_, ()>> {
        self.dies[die].gc_lock.try_lock()
    }

    pub fn try_lock_device(&self) -> Option<MutexGuard<'_, ()>> {
        self.gc_lock.try_lock()
    }

    pub fn snapshot(&self) -> (Vec<BlockRecord>, Vec<Vec<u32>>, Vec<Vec<u32>>) {
        let mut records = Vec::with_capacity(self.cfg.blocks());
        let mut empty = Vec::with_capacity(self.cfg.planes());
        let mut victim = Vec::with_capacity(self.cfg.planes());
        for plane in &self.planes {
            let lists = plane.lists.lock();
            empty.push(lists.iter(ListKind::Empty).collect());
            victim.push(lists.iter(ListKind::Victim).collect());
            for entry in &plane.blocks {
                let entry = entry.lock();
                records.push(BlockRecord {
                    kind: entry.kind,
                    erase_count: entry.erase_count,
                    write_cursor: entry.write_cursor,
                    valid: entry.valid.clone(),
                });
            }
        }
        (records, empty, victim)
    }

    /// Cross-check counts, bitmaps and list membership. Only meaningful while the device is quiet.
    pub fn audit(&self) -> std::result::Result<(), String> {
        let mut total_empty = 0;
        for (plane_id, plane) in self.planes.iter().enumerate() {
            let lists = plane.lists.lock();
            total_empty += lists.len(ListKind::Empty);
            for (block, entry) in plane.blocks.iter().enumerate() {
                let entry = entry.lock();
                let pbn = Pbn::in_plane(&self.cfg, plane_id, block as u32);
                if entry.valid_pages != entry.popcount() {
                    return Err(format!("{}: count {} != popcount {}", pbn, entry.valid_pages, entry.popcount()));
                }
                if entry.valid_page_indices().any(|p| p >= entry.write_cursor) {
                    return Err(format!("{}: valid page beyond write cursor {}", pbn, entry.write_cursor));
                }
                match lists.member(block as u32) {
                    Some(ListKind::Empty) if entry.kind != BlockKind::Empty || entry.write_cursor != 0 => {
                        return Err(format!("{}: on empty list but {:?} with cursor {}", pbn, entry.kind, entry.write_cursor));
                    }
                    Some(ListKind::Victim) if entry.kind != BlockKind::Data => {
                        return Err(format!("{}: on victim list but {:?}", pbn, entry.kind));
                    }
                    _ => {}
                }
            }
        }
        if total_empty != self.empty.load(Ordering::SeqCst) {
            return Err(format!("device empty count {} != listed {}", self.empty.load(Ordering::SeqCst), total_empty));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn small() -> Arc<GeometryConfig> {
        Arc::new(GeometryConfig {
            channels: 1,
            dies_per_channel: 2,
            planes_per_die: 2,
            blocks_per_plane: 4,
            pages_per_block: 70,
            ..Default::default()
        })
    }

    #[test]
    fn arena_list_push_remove_keeps_order() {
        let mut lists = BlockLists::new(6);
        for b in [3, 1, 4, 0] {
            lists.push_back(ListKind::Victim, b);
        }
        assert_eq!(lists.remove(4), Some(ListKind::Victim));
        assert_eq!(lists.remove(4), None);
        assert_eq!(lists.iter(ListKind::Victim).collect::<Vec<_>>(), vec![3, 1, 0]);
        assert_eq!(lists.pop_front(ListKind::Victim), Some(3));
        lists.push_back(ListKind::Empty, 3);
        assert_eq!(lists.len(ListKind::Victim), 2);
        assert_eq!(lists.len(ListKind::Empty), 1);
        assert_eq!(lists.member(3), Some(ListKind::Empty));
        lists.remove(0);
        lists.remove(1);
        assert_eq!(lists.pop_front(ListKind::Victim), None);
    }

    #[test]
    fn bitmap_and_count_agree_across_word_boundary() {
        let mut entry = BlockStateEntry::new(70);
        entry.write_cursor = 70;
        for page in [0, 63, 64, 69] {
            assert!(entry.set_valid(page, true));
        }
        assert!(!entry.set_valid(64, true));
        assert_eq!(entry.valid_pages(), 4);
        assert!(entry.set_valid(63, false));
        assert_eq!(entry.valid_pages(), entry.popcount());
        assert_eq!(entry.valid_page_indices().collect::<Vec<_>>(), vec![0, 64, 69]);
        assert_eq!(entry.invalid_pages(), 67);
    }

    #[test]
    fn pop_empty_widens_only_up_to_limit() {
        let bm = BlockManager::new(small());
        // drain plane 0
        for _ in 0..4 {
            assert_eq!(bm.pop_empty(Granularity::Plane, 0, Granularity::Plane, false).unwrap().plane_id(bm.config()), 0);
        }
        assert_eq!(bm.pop_empty(Granularity::Plane, 0, Granularity::Plane, false), None);
        let pbn = bm.pop_empty(Granularity::Plane, 0, Granularity::Die, false).unwrap();
        assert_eq!(pbn.plane_id(bm.config()), 1);
        assert_eq!(bm.empty_blocks(Granularity::Die, 0), 3);
        assert_eq!(bm.empty_blocks(Granularity::Device, 0), 11);
        bm.audit().unwrap();
    }

    #[test]
    fn collecting_planes_are_skipped() {
        let bm = BlockManager::new(small());
        bm.set_plane_state(2, PlaneState::Collecting);
        let pbn = bm.pop_empty(Granularity::Plane, 2, Granularity::Device, false).unwrap();
        assert_eq!(pbn.plane_id(bm.config()), 3);
        let pbn = bm.pop_empty(Granularity::Plane, 2, Granularity::Plane, true).unwrap();
        assert_eq!(pbn.plane_id(bm.config()), 2);
    }

    #[test]
    fn greedy_victim_prefers_dead_block() {
        let bm = BlockManager::new(small());
        let mut victims = Vec::new();
        for valid in [5u32, 0, 2] {
            let pbn = bm.pop_empty(Granularity::Plane, 0, Granularity::Plane, false).unwrap();
            bm.set_block_type(pbn, BlockKind::Data).unwrap();
            {
                let mut entry = bm.entry(pbn);
                entry.write_cursor = 70;
                for page in 0..valid {
                    entry.set_valid(page, true);
                }
            }
            bm.push_victim(pbn).unwrap();
            victims.push(pbn);
        }
        assert_eq!(bm.select_victim(0..1), Some(victims[1]));
        assert!(bm.pop_victim(victims[1]).unwrap());
        assert!(!bm.pop_victim(victims[1]).unwrap());
        assert_eq!(bm.select_victim(0..1), Some(victims[2]));
        assert_eq!(bm.select_victim(1..2), None);
    }

    #[test]
    fn fully_valid_block_is_not_a_victim() {
        let bm = BlockManager::new(small());
        let pbn = bm.pop_empty(Granularity::Plane, 1, Granularity::Plane, false).unwrap();
        bm.set_block_type(pbn, BlockKind::Data).unwrap();
        {
            let mut entry = bm.entry(pbn);
            entry.write_cursor = 70;
            for page in 0..70 {
                entry.set_valid(page, true);
            }
        }
        bm.push_victim(pbn).unwrap();
        assert_eq!(bm.select_victim(1..2), None);
    }

    #[test]
    fn set_block_empty_clears_bitmap() {
        let bm = BlockManager::new(small());
        let pbn = bm.pop_empty(Granularity::Plane, 0, Granularity::Plane, false).unwrap();
        bm.set_block_type(pbn, BlockKind::Data).unwrap();
        bm.entry(pbn).write_cursor = 3;
        bm.set_valid(pbn.page(2), true).unwrap();
        bm.set_block_type(pbn, BlockKind::Empty).unwrap();
        assert_eq!(bm.record_erase(pbn).unwrap(), 1);
        let entry = bm.entry(pbn);
        assert_eq!(entry.valid_pages(), 0);
        assert_eq!(entry.write_cursor, 0);
        assert!(!entry.is_valid(2));
    }

    #[test]
    fn rejects_out_of_range_page() {
        let bm = BlockManager::new(small());
        let bad = Pbn::new(0, 0, 9).page(0);
        assert!(matches!(bm.set_valid(bad, true), Err(FtlError::InvalidAddress { what: "block", .. })));
    }

    #[test]
    fn plane_state_counters_track_transitions() {
        let bm = BlockManager::new(small());
        bm.set_plane_state(0, PlaneState::NeedBackgroundGc);
        bm.set_plane_state(1, PlaneState::NeedForegroundGc);
        assert_eq!(bm.planes_needing_background(), 1);
        assert_eq!(bm.planes_needing_foreground(), 1);
        assert_eq!(bm.set_plane_state(1, PlaneState::Collecting), PlaneState::NeedForegroundGc);
        assert_eq!(bm.raise_plane_state(1, PlaneState::NeedBackgroundGc), PlaneState::Collecting);
        assert_eq!(bm.planes_needing_foreground(), 0);
    }

    #[test]
    fn restore_round_trips_lists() {
        let cfg = small();
        let bm = BlockManager::new(cfg.clone());
        let a = bm.pop_empty(Granularity::Plane, 3, Granularity::Plane, false).unwrap();
        bm.set_block_type(a, BlockKind::Data).unwrap();
        bm.entry(a).write_cursor = 70;
        bm.set_valid(a.page(7), true).unwrap();
        bm.push_victim(a).unwrap();
        let (records, empty, victim) = bm.snapshot();
        let back = BlockManager::restore(cfg, records, empty, victim).unwrap();
        assert_eq!(back.entry(a).valid_pages(), 1);
        assert_eq!(back.select_victim(3..4), Some(a));
        assert_eq!(back.empty_blocks(Granularity::Device, 0), 15);
        back.audit().unwrap();
    }
}
