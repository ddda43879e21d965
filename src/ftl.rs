#[cfg(test)]
use std::{println as info, println as warn, println as error, println as trace, println as debug};
use std::sync::Arc;

use byte_unit::Byte;
use num_integer::Integer;
use parking_lot::{Mutex, RwLock};

#[cfg(not(test))]
use log::*;

use crate::address::{DieId, Pbn, PlaneId, Ppn};
use crate::block::{BlockKind, BlockManager, PlaneState};
use crate::config::*;
use crate::error::{FtlError, Result};

/// Marker for "nothing here" in the flat persisted tables.
pub const UNMAPPED: u64 = u64::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum L2PValue {
    Invalid,
    Valid(Ppn),
}

/// Round-robin allocation position of one core.
struct AllocCursor {
    die: DieId,
    plane: Vec<BaseType>,
}

/// Page-level address translator.
///
/// The forward table is partitioned by owning core (`lpn % cores`), the inverse table by plane.
/// Lock order: forward partition, then block entry, then inverse plane.
pub struct Ftl {
    cfg: Arc<GeometryConfig>,
    blocks: Arc<BlockManager>,

    l2p: Vec<RwLock<Vec<L2PValue>>>,
    p2l: Vec<Mutex<Vec<Option<Lpn>>>>,
    logical_size: Lpn,

    // write target of each plane, taken from the plane's empty list
    open_blocks: Vec<Mutex<Option<u32>>>,
    // one per worker core plus one for the collector
    cursors: Vec<Mutex<AllocCursor>>,
}

impl Ftl {
    pub fn new(cfg: Arc<GeometryConfig>, blocks: Arc<BlockManager>) -> Self {
        let logical_size = cfg.logical_pages();
        let cores = cfg.cores as Lpn;
        let l2p = (0..cores)
            .map(|core| RwLock::new(vec![L2PValue::Invalid; ((logical_size + cores - 1 - core) / cores) as usize]))
            .collect();
        let p2l = (0..cfg.planes()).map(|_| Mutex::new(vec![None; cfg.pages_per_plane()])).collect();
        let open_blocks = (0..cfg.planes()).map(|_| Mutex::new(None)).collect();
        let cursors = (0..=cfg.cores)
            .map(|core| Mutex::new(AllocCursor { die: core % cfg.dies(), plane: vec![0; cfg.dies()] }))
            .collect();

        let op_pages = cfg.pages() - logical_size;
        trace!("ALL_PAGES: {}", cfg.pages());
        trace!("op_pages: {}", op_pages);
        trace!(
            "Physical Capacity: {} bytes, {}",
            cfg.physical_bytes(),
            Byte::from(cfg.physical_bytes() as usize).get_appropriate_unit(true).to_string()
        );
        trace!(
            "User Capacity: {} bytes, {}",
            cfg.logical_bytes(),
            Byte::from(cfg.logical_bytes() as usize).get_appropriate_unit(true).to_string()
        );

        Ftl { cfg, blocks, l2p, p2l, logical_size, open_blocks, cursors }
    }

    /// Rebuild from flat tables: forward entries and inverse entries hold linear indices or `UNMAPPED`.
    pub fn restore(
        cfg: Arc<GeometryConfig>,
        blocks: Arc<BlockManager>,
        forward: Vec<u64>,
        inverse: Vec<Vec<u64>>,
        open_blocks: Vec<Option<u32>>,
    ) -> Result<Self> {
        let out = Ftl::new(cfg.clone(), blocks);
        if forward.len() as Lpn != out.logical_size || inverse.len() != cfg.planes() || open_blocks.len() != cfg.planes() {
            return Err(FtlError::InvalidConfig("persisted mapping does not match geometry".into()));
        }
        for (lpn, raw) in forward.into_iter().enumerate() {
            if raw != UNMAPPED {
                let ppn = Ppn::from_linear(&cfg, raw)?;
                let (local, core) = (lpn as Lpn).div_rem(&(cfg.cores as Lpn));
                out.l2p[core as usize].write()[local as usize] = L2PValue::Valid(ppn);
            }
        }
        for (plane, raw) in inverse.into_iter().enumerate() {
            if raw.len() != cfg.pages_per_plane() {
                return Err(FtlError::InvalidConfig(format!("persisted inverse table of plane {} is malformed", plane)));
            }
            *out.p2l[plane].lock() = raw.into_iter().map(|lpn| (lpn != UNMAPPED).then_some(lpn)).collect();
        }
        for (plane, block) in open_blocks.into_iter().enumerate() {
            if let Some(block) = block {
                Pbn::in_plane(&cfg, plane, block).check(&cfg)?;
            }
            *out.open_blocks[plane].lock() = block;
        }
        Ok(out)
    }

    pub fn get_max_lba(&self) -> Lpn {
        self.logical_size - 1
    }

    pub fn logical_size(&self) -> Lpn {
        self.logical_size
    }

    pub fn blocks(&self) -> &Arc<BlockManager> {
        &self.blocks
    }

    fn slot(&self, lpn: Lpn) -> Result<(usize, usize)> {
        if lpn >= self.logical_size {
            return Err(FtlError::InvalidAddress { what: "logical page", value: lpn });
        }
        let (local, core) = lpn.div_rem(&(self.cfg.cores as Lpn));
        Ok((core as usize, local as usize))
    }

    /// Core that owns `lpn`.
    pub fn owner(&self, lpn: Lpn) -> CoreId {
        (lpn % self.cfg.cores as Lpn) as CoreId
    }

    pub fn resolve(&self, lpn: Lpn) -> Result<L2PValue> {
        let (core, local) = self.slot(lpn)?;
        Ok(self.l2p[core].read()[local])
    }

    /// Run `f` on the mapping of `lpn` while nobody can remap it.
    pub fn with_resolved<R>(&self, lpn: Lpn, f: impl FnOnce(L2PValue) -> R) -> Result<R> {
        let (core, local) = self.slot(lpn)?;
        let table = self.l2p[core].read();
        Ok(f(table[local]))
    }

    pub fn inverse(&self, ppn: Ppn) -> Result<Option<Lpn>> {
        ppn.check(&self.cfg)?;
        Ok(self.p2l[ppn.plane_id(&self.cfg)].lock()[ppn.plane_offset(&self.cfg)])
    }

    /// Allocate one page for `core` anywhere in the given scope, rotating across dies and planes.
    pub fn allocate(&self, core: CoreId, granularity: Granularity) -> Result<Ppn> {
        let start = {
            let cursor = self.cursors[core.min(self.cfg.cores)].lock();
            cursor.die * self.cfg.planes_per_die + cursor.plane[cursor.die]
        };
        self.allocate_in(core, granularity, start, Granularity::Device, false)
    }

    /// Allocate near `locator`, widening from `granularity` up to `widest` when the narrower scope is exhausted.
    pub fn allocate_in(
        &self,
        core: CoreId,
        granularity: Granularity,
        locator: PlaneId,
        widest: Granularity,
        allow_collecting: bool,
    ) -> Result<Ppn> {
        for plane in self.blocks.search_order(granularity, locator, widest) {
            if let Some(ppn) = self.take_from_plane(plane, core, allow_collecting)? {
                let mut cursor = self.cursors[core.min(self.cfg.cores)].lock();
                let die = ppn.die();
                cursor.plane[die] = (ppn.plane as BaseType + 1) % self.cfg.planes_per_die;
                cursor.die = (die + 1) % self.cfg.dies();
                trace!("core {} allocated {}", core, ppn);
                return Ok(ppn);
            }
        }
        Err(FtlError::NoFreeSpace)
    }

    fn take_from_plane(&self, plane: PlaneId, core: CoreId, allow_collecting: bool) -> Result<Option<Ppn>> {
        if !allow_collecting && self.blocks.plane_state(plane) == PlaneState::Collecting {
            return Ok(None);
        }
        let mut open = self.open_blocks[plane].lock();
        loop {
            if let Some(block) = *open {
                let pbn = Pbn::in_plane(&self.cfg, plane, block);
                let mut entry = self.blocks.entry(pbn);
                let page = (!entry.full()).then(|| {
                    entry.write_cursor += 1;
                    entry.in_flight += 1;
                    entry.write_cursor - 1
                });
                let full = entry.full();
                drop(entry);

                if full {
                    *open = None;
                    self.blocks.push_victim(pbn)?;
                }
                if let Some(page) = page {
                    return Ok(Some(pbn.page(page)));
                }
            }

            match self.blocks.pop_empty(Granularity::Plane, plane, Granularity::Plane, allow_collecting) {
                Some(pbn) => {
                    self.blocks.set_block_type(pbn, BlockKind::Data)?;
                    self.blocks.entry(pbn).owner = Some(core);
                    *open = Some(pbn.block);
                }
                None => return Ok(None),
            }
        }
    }

    /// Point `lpn` at `new`, invalidating whatever it pointed at before. Returns the replaced page.
    pub fn remap(&self, lpn: Lpn, new: Ppn) -> Result<Option<Ppn>> {
        self.swap(lpn, new, None).map(|(_, old)| old)
    }

    /// Like `remap`, but only if `lpn` still lives at `expected`. On mismatch `new` is abandoned.
    pub fn remap_if(&self, lpn: Lpn, expected: Ppn, new: Ppn) -> Result<bool> {
        self.swap(lpn, new, Some(expected)).map(|(done, _)| done)
    }

    fn swap(&self, lpn: Lpn, new: Ppn, expected: Option<Ppn>) -> Result<(bool, Option<Ppn>)> {
        new.check(&self.cfg)?;
        let (core, local) = self.slot(lpn)?;
        let mut table = self.l2p[core].write();
        let old = match table[local] {
            L2PValue::Valid(ppn) => Some(ppn),
            L2PValue::Invalid => None,
        };
        if expected.is_some() && old != expected {
            drop(table);
            self.abandon(new);
            return Ok((false, old));
        }

        if let Some(old) = old {
            self.blocks.set_valid(old, false)?;
            self.p2l[old.plane_id(&self.cfg)].lock()[old.plane_offset(&self.cfg)] = None;
        }
        table[local] = L2PValue::Valid(new);
        {
            let mut entry = self.blocks.entry(new.pbn());
            entry.set_valid(new.page, true);
            entry.in_flight = entry.in_flight.saturating_sub(1);
        }
        self.p2l[new.plane_id(&self.cfg)].lock()[new.plane_offset(&self.cfg)] = Some(lpn);
        Ok((true, old))
    }

    /// Give up on an allocated page that will never be mapped.
    pub fn abandon(&self, ppn: Ppn) {
        let mut entry = self.blocks.entry(ppn.pbn());
        entry.in_flight = entry.in_flight.saturating_sub(1);
    }

    /// Drop the mapping of `lpn`. Returns the page that held it.
    pub fn unmap(&self, lpn: Lpn) -> Result<Option<Ppn>> {
        let (core, local) = self.slot(lpn)?;
        let mut table = self.l2p[core].write();
        let old = match std::mem::replace(&mut table[local], L2PValue::Invalid) {
            L2PValue::Valid(ppn) => ppn,
            L2PValue::Invalid => return Ok(None),
        };
        self.blocks.set_valid(old, false)?;
        self.p2l[old.plane_id(&self.cfg)].lock()[old.plane_offset(&self.cfg)] = None;
        Ok(Some(old))
    }

    /// Flat copies of both tables and the open blocks, for persistence.
    pub fn snapshot(&self) -> (Vec<u64>, Vec<Vec<u64>>, Vec<Option<u32>>) {
        let mut forward = vec![UNMAPPED; self.logical_size as usize];
        let cores = self.cfg.cores;
        for (core, part) in self.l2p.iter().enumerate() {
            for (local, value) in part.read().iter().enumerate() {
                if let L2PValue::Valid(ppn) = value {
                    forward[local * cores + core] = ppn.linear(&self.cfg);
                }
            }
        }
        let inverse = self
            .p2l
            .iter()
            .map(|plane| plane.lock().iter().map(|lpn| lpn.unwrap_or(UNMAPPED)).collect())
            .collect();
        let open = self.open_blocks.iter().map(|slot| *slot.lock()).collect();
        (forward, inverse, open)
    }

    /// Check forward and inverse agree and every mapped page is marked valid. Only meaningful while quiet.
    pub fn audit(&self) -> std::result::Result<(), String> {
        let mut seen = std::collections::HashSet::new();
        for lpn in 0..self.logical_size {
            let ppn = match self.resolve(lpn).map_err(|e| e.to_string())? {
                L2PValue::Valid(ppn) => ppn,
                L2PValue::Invalid => continue,
            };
            if !seen.insert(ppn) {
                return Err(format!("{} mapped twice", ppn));
            }
            if self.inverse(ppn).map_err(|e| e.to_string())? != Some(lpn) {
                return Err(format!("forward[{}] = {} but inverse disagrees", lpn, ppn));
            }
            if !self.blocks.is_valid(ppn).map_err(|e| e.to_string())? {
                return Err(format!("forward[{}] = {} is not marked valid", lpn, ppn));
            }
        }
        for (plane, table) in self.p2l.iter().enumerate() {
            for (offset, lpn) in table.lock().iter().enumerate() {
                let Some(lpn) = lpn else { continue };
                let ppn = Pbn::in_plane(&self.cfg, plane, (offset / self.cfg.pages_per_block) as u32)
                    .page((offset % self.cfg.pages_per_block) as u32);
                if !seen.contains(&ppn) {
                    return Err(format!("inverse[{}] = {} but forward disagrees", ppn, lpn));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::prelude::*;

    fn setup(cores: usize) -> Ftl {
        let cfg = Arc::new(GeometryConfig {
            channels: 2,
            dies_per_channel: 1,
            planes_per_die: 2,
            blocks_per_plane: 4,
            pages_per_block: 4,
            cores,
            op_percent: 25.0,
            ..Default::default()
        });
        let blocks = Arc::new(BlockManager::new(cfg.clone()));
        Ftl::new(cfg, blocks)
    }

    #[test]
    fn writes_one_block() {
        let fw = setup(1);
        for lpn in 0..4 {
            let ppn = fw.allocate(0, Granularity::Device).unwrap();
            assert_eq!(fw.remap(lpn, ppn).unwrap(), None);
        }
        assert_eq!(fw.blocks().empty_blocks(Granularity::Device, 0), 16 - 4);
        fw.audit().unwrap();
        fw.blocks().audit().unwrap();
    }

    #[test]
    fn allocation_rotates_across_dies() {
        let fw = setup(1);
        let dies: Vec<_> = (0..4).map(|_| fw.allocate(0, Granularity::Device).unwrap().die()).collect();
        assert_eq!(dies, vec![0, 1, 0, 1]);
    }

    #[test]
    fn remap_invalidates_previous_page() {
        let fw = setup(2);
        let first = fw.allocate(0, Granularity::Device).unwrap();
        fw.remap(6, first).unwrap();
        let second = fw.allocate(0, Granularity::Device).unwrap();
        assert_eq!(fw.remap(6, second).unwrap(), Some(first));

        assert_eq!(fw.resolve(6).unwrap(), L2PValue::Valid(second));
        assert_eq!(fw.inverse(first).unwrap(), None);
        assert_eq!(fw.inverse(second).unwrap(), Some(6));
        assert!(!fw.blocks().is_valid(first).unwrap());
        assert_eq!(fw.blocks().entry(first.pbn()).in_flight, 0);
        fw.audit().unwrap();
    }

    #[test]
    fn conditional_remap_loses_to_newer_write() {
        let fw = setup(1);
        let old = fw.allocate(0, Granularity::Device).unwrap();
        fw.remap(3, old).unwrap();
        let host = fw.allocate(0, Granularity::Device).unwrap();
        fw.remap(3, host).unwrap();

        let moved = fw.allocate(1, Granularity::Device).unwrap();
        assert!(!fw.remap_if(3, old, moved).unwrap());
        assert_eq!(fw.resolve(3).unwrap(), L2PValue::Valid(host));
        assert!(!fw.blocks().is_valid(moved).unwrap());
        assert_eq!(fw.blocks().entry(moved.pbn()).in_flight, 0);
    }

    #[test]
    fn out_of_range_lpn_is_refused() {
        let fw = setup(1);
        let ppn = fw.allocate(0, Granularity::Device).unwrap();
        assert!(matches!(fw.remap(fw.logical_size(), ppn), Err(FtlError::InvalidAddress { .. })));
        assert!(fw.resolve(fw.get_max_lba()).is_ok());
    }

    #[test]
    fn unmap_clears_both_tables() {
        let fw = setup(2);
        let ppn = fw.allocate(1, Granularity::Device).unwrap();
        fw.remap(9, ppn).unwrap();
        assert_eq!(fw.unmap(9).unwrap(), Some(ppn));
        assert_eq!(fw.unmap(9).unwrap(), None);
        assert_eq!(fw.resolve(9).unwrap(), L2PValue::Invalid);
        assert_eq!(fw.inverse(ppn).unwrap(), None);
        fw.audit().unwrap();
    }

    #[test]
    fn plane_scope_does_not_spill_over() {
        let fw = setup(1);
        for _ in 0..16 {
            assert_eq!(fw.allocate_in(0, Granularity::Plane, 3, Granularity::Plane, false).unwrap().plane_id(&fw.cfg), 3);
        }
        assert!(matches!(
            fw.allocate_in(0, Granularity::Plane, 3, Granularity::Plane, false),
            Err(FtlError::NoFreeSpace)
        ));
        let ppn = fw.allocate_in(0, Granularity::Plane, 3, Granularity::Die, false).unwrap();
        assert_eq!(ppn.plane_id(&fw.cfg), 2);
    }

    #[test]
    fn random_overwrites_keep_tables_consistent() {
        let fw = setup(2);
        let mut rng = SmallRng::seed_from_u64(7);
        // 32 physical pages, stay well below so no collection is needed
        for _ in 0..24 {
            let lpn = rng.gen_range(0..=fw.get_max_lba());
            let ppn = fw.allocate(fw.owner(lpn), Granularity::Device).unwrap();
            fw.remap(lpn, ppn).unwrap();
        }
        fw.audit().unwrap();
        fw.blocks().audit().unwrap();
    }

    #[test]
    fn restore_from_snapshot() {
        let fw = setup(2);
        for lpn in [0, 5, 11] {
            let ppn = fw.allocate(fw.owner(lpn), Granularity::Device).unwrap();
            fw.remap(lpn, ppn).unwrap();
        }
        let (forward, inverse, open) = fw.snapshot();
        let (records, empty, victim) = fw.blocks().snapshot();
        let blocks = Arc::new(BlockManager::restore(fw.cfg.clone(), records, empty, victim).unwrap());
        let back = Ftl::restore(fw.cfg.clone(), blocks, forward, inverse, open).unwrap();
        for lpn in [0, 5, 11] {
            assert_eq!(back.resolve(lpn).unwrap(), fw.resolve(lpn).unwrap());
        }
        back.audit().unwrap();
    }
}
