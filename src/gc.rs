use std::ops::Range;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::*;
use parking_lot::MutexGuard;

use crate::address::{Pbn, PlaneId, Ppn};
use crate::block::{BlockKind, BlockManager, PlaneState};
use crate::clock::Shutdown;
use crate::config::{BaseType, CoreId, Granularity, GeometryConfig};
use crate::error::{FtlError, Result};
use crate::flash::{FlashDevice, IoBatch};
use crate::ftl::Ftl;
use crate::stats::Stats;

/// Lock scope of one collection pass.
pub trait GcScope: Send + Sync {
    fn granularity(&self) -> Granularity;

    /// Never blocks; `None` means somebody else is collecting in this scope.
    fn try_lock<'a>(&self, blocks: &'a BlockManager, plane: PlaneId) -> Option<MutexGuard<'a, ()>>;

    fn planes(&self, blocks: &BlockManager, plane: PlaneId) -> Range<PlaneId> {
        blocks.scope_planes(self.granularity(), plane)
    }

    fn empty_blocks(&self, blocks: &BlockManager, plane: PlaneId) -> usize {
        blocks.empty_blocks(self.granularity(), plane)
    }
}

pub struct DeviceScope;
pub struct DieScope;
pub struct PlaneScope;

impl GcScope for DeviceScope {
    fn granularity(&self) -> Granularity {
        Granularity::Device
    }

    fn try_lock<'a>(&self, blocks: &'a BlockManager, _plane: PlaneId) -> Option<MutexGuard<'a, ()>> {
        blocks.try_lock_device()
    }
}

impl GcScope for DieScope {
    fn granularity(&self) -> Granularity {
        Granularity::Die
    }

    fn try_lock<'a>(&self, blocks: &'a BlockManager, plane: PlaneId) -> Option<MutexGuard<'a, ()>> {
        blocks.try_lock_die(plane / blocks.config().planes_per_die)
    }
}

impl GcScope for PlaneScope {
    fn granularity(&self) -> Granularity {
        Granularity::Plane
    }

    fn try_lock<'a>(&self, blocks: &'a BlockManager, plane: PlaneId) -> Option<MutexGuard<'a, ()>> {
        blocks.try_lock_plane(plane)
    }
}

pub fn scope_for(mode: Granularity) -> Box<dyn GcScope> {
    match mode {
        Granularity::Device => Box::new(DeviceScope),
        Granularity::Die => Box::new(DieScope),
        Granularity::Plane => Box::new(PlaneScope),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GcOutcome {
    Reclaimed(Pbn),
    NoVictim,
    /// Another thread holds the scope lock or is collecting the plane.
    Busy,
}

pub struct GarbageCollector {
    cfg: Arc<GeometryConfig>,
    blocks: Arc<BlockManager>,
    ftl: Arc<Ftl>,
    flash: Arc<FlashDevice>,
    stats: Arc<Stats>,
    scope: Box<dyn GcScope>,
    low_watermark: usize,
    high_watermark: usize,
    // allocation cursor and register owner id used by collections
    core: CoreId,
}

impl GarbageCollector {
    pub fn new(
        cfg: Arc<GeometryConfig>,
        blocks: Arc<BlockManager>,
        ftl: Arc<Ftl>,
        flash: Arc<FlashDevice>,
        stats: Arc<Stats>,
    ) -> Self {
        let (low_watermark, high_watermark) = cfg.watermark_blocks();
        debug!("gc {:?} scope, watermarks: low {} high {} empty blocks", cfg.gc_mode, low_watermark, high_watermark);
        GarbageCollector {
            scope: scope_for(cfg.gc_mode),
            core: cfg.cores,
            cfg,
            blocks,
            ftl,
            flash,
            stats,
            low_watermark,
            high_watermark,
        }
    }

    /// State a plane should be in given the empty blocks left in its scope.
    pub fn target_state(&self, plane: PlaneId) -> PlaneState {
        let empty = self.scope.empty_blocks(&self.blocks, plane);
        if empty <= self.high_watermark {
            PlaneState::NeedForegroundGc
        } else if empty <= self.low_watermark {
            PlaneState::NeedBackgroundGc
        } else {
            PlaneState::Idle
        }
    }

    /// Re-evaluate `plane` after an allocation.
    pub fn check_watermarks(&self, plane: PlaneId) -> PlaneState {
        self.blocks.raise_plane_state(plane, self.target_state(plane))
    }

    fn refresh(&self, plane: PlaneId) {
        for p in self.scope.planes(&self.blocks, plane) {
            self.check_watermarks(p);
        }
    }

    /// One collection pass on the scope of `plane`.
    pub fn collect(&self, plane: PlaneId) -> Result<GcOutcome> {
        let Some(_scope) = self.scope.try_lock(&self.blocks, plane) else {
            return Ok(GcOutcome::Busy);
        };
        let Some(prior) = self.blocks.begin_collect(plane) else {
            return Ok(GcOutcome::Busy);
        };

        match self.collect_locked(plane) {
            Ok(Some(victim)) => {
                self.blocks.set_plane_state(plane, PlaneState::Idle);
                self.refresh(plane);
                Ok(GcOutcome::Reclaimed(victim))
            }
            Ok(None) => {
                self.blocks.set_plane_state(plane, prior);
                Ok(GcOutcome::NoVictim)
            }
            Err(err) => {
                Stats::bump(&self.stats.gc_failures);
                self.blocks.set_plane_state(plane, prior);
                Err(err)
            }
        }
    }

    fn collect_locked(&self, plane: PlaneId) -> Result<Option<Pbn>> {
        let planes = self.scope.planes(&self.blocks, plane);
        let Some(victim) = self.blocks.select_victim(planes) else {
            debug!("plane {}: no victim worth collecting", plane);
            return Ok(None);
        };
        if !self.blocks.pop_victim(victim)? {
            return Ok(None);
        }

        let valid: Vec<u32> = {
            let mut entry = self.blocks.entry(victim);
            entry.owner = Some(self.core);
            entry.valid_page_indices().collect()
        };
        let expected = valid.len() as u32;
        debug!("collecting {} with {} valid pages", victim, expected);

        let mut copied = 0;
        for page in valid {
            match self.migrate(victim.page(page)) {
                Ok(true) => copied += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!("collection of {} stopped after {} pages: {}", victim, copied, err);
                    self.give_back(victim)?;
                    return Err(err);
                }
            }
        }

        let remaining = self.blocks.entry(victim).valid_pages();
        if remaining != 0 {
            error!("{} still has {} valid pages after moving {} of {}", victim, remaining, copied, expected);
            self.give_back(victim)?;
            return Err(FtlError::MergeInconsistency { victim, expected, remaining });
        }

        let batch = IoBatch::new();
        self.flash.block_erase(self.core, victim, &batch)?;
        self.flash.wait(&batch);
        self.blocks.set_block_type(victim, BlockKind::Empty)?;
        self.blocks.record_erase(victim)?;
        self.blocks.push_empty(victim)?;

        Stats::bump(&self.stats.gc_passes);
        Stats::add(&self.stats.gc_copied_pages, copied as u64);
        info!("reclaimed {} ({} pages moved)", victim, copied);
        Ok(Some(victim))
    }

    fn give_back(&self, victim: Pbn) -> Result<()> {
        self.blocks.entry(victim).owner = None;
        self.blocks.push_victim(victim)
    }

    /// Move one page out of the victim. False when the page went stale before it could be remapped.
    fn migrate(&self, src: Ppn) -> Result<bool> {
        let Some(lpn) = self.ftl.inverse(src)? else {
            return Ok(false);
        };
        let dst = self.ftl.allocate_in(
            self.core,
            Granularity::Plane,
            src.plane_id(&self.cfg),
            self.cfg.gc_mode,
            true,
        )?;
        self.check_watermarks(dst.plane_id(&self.cfg));

        if let Err(err) = self.copy(src, dst) {
            self.ftl.abandon(dst);
            return Err(err);
        }
        let moved = self.ftl.remap_if(lpn, src, dst)?;
        trace!("gc {} -> {} for lpn {}: {}", src, dst, lpn, if moved { "moved" } else { "stale" });
        Ok(moved)
    }

    fn copy(&self, src: Ppn, dst: Ppn) -> Result<()> {
        let batch = IoBatch::new();
        if self.cfg.copy_back && src.die() == dst.die() {
            self.flash.page_copy_back(self.core, src, dst, &batch)?;
            self.flash.wait(&batch);
            return Ok(());
        }
        let data = self.flash.page_read(self.core, src, &batch)?;
        self.flash.wait(&batch);
        let data = data.unwrap_or_else(|| vec![0; self.cfg.page_bytes()].into_boxed_slice());
        self.flash.page_write(self.core, dst, data, &batch)?;
        self.flash.wait(&batch);
        Ok(())
    }

    /// Service every plane flagged for foreground collection. Runs on the writer's thread.
    pub fn foreground(&self) -> Result<usize> {
        let mut reclaimed = 0;
        if self.blocks.planes_needing_foreground() == 0 {
            return Ok(0);
        }
        for plane in 0..self.cfg.planes() {
            let mut rounds: BaseType = 0;
            while self.blocks.plane_state(plane) == PlaneState::NeedForegroundGc && rounds < self.cfg.blocks_per_plane {
                rounds += 1;
                match self.collect(plane)? {
                    GcOutcome::Reclaimed(_) => reclaimed += 1,
                    GcOutcome::NoVictim => {
                        warn!("plane {} needs space but nothing can be reclaimed", plane);
                        break;
                    }
                    GcOutcome::Busy => thread::sleep(Duration::from_micros(50)),
                }
            }
        }
        Ok(reclaimed)
    }

    /// Last resort after an allocation failed: try every plane, emptiest scopes first.
    /// True if something was reclaimed or another collector is at work.
    pub fn reclaim_any(&self) -> Result<bool> {
        let mut planes: Vec<PlaneId> = (0..self.cfg.planes()).collect();
        planes.sort_by_key(|&p| self.scope.empty_blocks(&self.blocks, p));
        let mut busy = false;
        for plane in planes {
            match self.collect(plane)? {
                GcOutcome::Reclaimed(_) => return Ok(true),
                GcOutcome::Busy => busy = true,
                GcOutcome::NoVictim => {}
            }
        }
        Ok(busy)
    }

    /// One sweep over planes flagged for collection. True if anything was reclaimed.
    pub fn background_pass(&self) -> Result<bool> {
        if self.blocks.planes_needing_background() + self.blocks.planes_needing_foreground() == 0 {
            return Ok(false);
        }
        let mut reclaimed = false;
        for plane in 0..self.cfg.planes() {
            match self.blocks.plane_state(plane) {
                PlaneState::NeedBackgroundGc | PlaneState::NeedForegroundGc => {}
                _ => continue,
            }
            if let GcOutcome::Reclaimed(_) = self.collect(plane)? {
                reclaimed = true;
            }
        }
        Ok(reclaimed)
    }

    /// Background loop: back off while idle, speed up while reclaiming.
    pub fn run_background(&self, shutdown: &Shutdown) {
        let (min, max) = (self.cfg.gc_min_sleep, self.cfg.gc_max_sleep);
        let mut sleep = min;
        info!("background gc running");
        loop {
            sleep = match self.background_pass() {
                Ok(true) => (sleep / 2).max(min),
                Ok(false) => (sleep * 2).min(max),
                Err(err) => {
                    warn!("background gc pass failed: {}", err);
                    (sleep * 2).min(max)
                }
            };
            if shutdown.sleep(sleep) {
                break;
            }
        }
        info!("background gc stopped");
    }
}
