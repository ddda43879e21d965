use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::*;

use crate::address::Ppn;
use crate::block::{BlockManager, PlaneState};
use crate::clock::Clock;
use crate::config::{CoreId, Granularity, GeometryConfig, Lpn};
use crate::error::{FtlError, Result};
use crate::flash::{FlashDevice, IoBatch};
use crate::ftl::{Ftl, L2PValue};
use crate::gc::GarbageCollector;
use crate::persist;
use crate::stats::Stats;

/// Part of one logical page: `data` lands at sector `sector` of page `lpn`.
#[derive(Clone, Copy, Debug)]
pub struct PageWrite<'a> {
    pub lpn: Lpn,
    pub sector: usize,
    pub data: &'a [u8],
}

/// The drive below the request layer: translator, block pools, flash model and collector.
pub struct Ssd {
    cfg: Arc<GeometryConfig>,
    blocks: Arc<BlockManager>,
    ftl: Arc<Ftl>,
    flash: Arc<FlashDevice>,
    gc: Arc<GarbageCollector>,
    stats: Arc<Stats>,
}

impl Ssd {
    /// Validate `cfg` and bring the drive up, restoring metadata from `cfg.meta_dir` when a snapshot is there.
    pub fn open(cfg: GeometryConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        cfg.validate()?;
        let cfg = Arc::new(cfg);
        let restored = match cfg.meta_dir.as_deref() {
            Some(dir) => persist::load(dir, &cfg)?,
            None => None,
        };
        let (blocks, ftl) = match restored {
            Some((blocks, ftl)) => {
                info!("metadata restored from {}", cfg.meta_dir.as_deref().map(|d| d.display().to_string()).unwrap_or_default());
                (blocks, ftl)
            }
            None => {
                let blocks = Arc::new(BlockManager::new(cfg.clone()));
                let ftl = Ftl::new(cfg.clone(), blocks.clone());
                (blocks, ftl)
            }
        };
        let ftl = Arc::new(ftl);
        let stats = Arc::new(Stats::default());
        let flash = Arc::new(FlashDevice::new(cfg.clone(), clock, stats.clone()));
        let gc = Arc::new(GarbageCollector::new(cfg.clone(), blocks.clone(), ftl.clone(), flash.clone(), stats.clone()));

        info!(
            "{} channels x {} dies x {} planes x {} blocks x {} pages, {} logical pages",
            cfg.channels,
            cfg.dies_per_channel,
            cfg.planes_per_die,
            cfg.blocks_per_plane,
            cfg.pages_per_block,
            cfg.logical_pages()
        );
        Ok(Ssd { cfg, blocks, ftl, flash, gc, stats })
    }

    pub fn config(&self) -> &Arc<GeometryConfig> {
        &self.cfg
    }

    pub fn blocks(&self) -> &Arc<BlockManager> {
        &self.blocks
    }

    pub fn ftl(&self) -> &Arc<Ftl> {
        &self.ftl
    }

    pub fn flash(&self) -> &Arc<FlashDevice> {
        &self.flash
    }

    pub fn gc(&self) -> &Arc<GarbageCollector> {
        &self.gc
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    fn blank(&self) -> Box<[u8]> {
        vec![0; self.cfg.page_bytes()].into_boxed_slice()
    }

    /// Take a page for a host write, collecting first if the device has run dry.
    fn allocate(&self, core: CoreId) -> Result<Ppn> {
        let mut retries = 0;
        loop {
            match self.ftl.allocate(core, Granularity::Device) {
                Ok(ppn) => {
                    if self.gc.check_watermarks(ppn.plane_id(&self.cfg)) == PlaneState::NeedForegroundGc {
                        if let Err(err) = self.gc.foreground() {
                            warn!("core {}: foreground gc failed, retried next cycle: {}", core, err);
                        }
                    }
                    return Ok(ppn);
                }
                Err(FtlError::NoFreeSpace) if retries < self.cfg.planes() => {
                    retries += 1;
                    warn!("core {}: no free page, collecting before retry {}", core, retries);
                    if !self.gc.reclaim_any()? {
                        break;
                    }
                }
                Err(err) => return Err(err),
            }
        }
        error!("core {}: device full, nothing left to reclaim", core);
        Err(FtlError::NoFreeSpace)
    }

    fn check_write(&self, w: &PageWrite) -> Result<()> {
        let sector = self.cfg.sector_size;
        if w.lpn >= self.ftl.logical_size() {
            return Err(FtlError::InvalidAddress { what: "logical page", value: w.lpn });
        }
        if w.data.len() % sector != 0 || w.sector + w.data.len() / sector > self.cfg.sectors_per_page {
            return Err(FtlError::InvalidAddress { what: "page segment", value: w.lpn });
        }
        Ok(())
    }

    /// Program a batch of page segments for `core`. Segments of one page merge into a single program,
    /// partial pages are merged with what is already stored.
    pub fn write_pages(&self, core: CoreId, writes: &[PageWrite]) -> Result<()> {
        let mut order = Vec::new();
        let mut partial = Vec::new();
        let mut seen = HashSet::new();
        for w in writes {
            self.check_write(w)?;
            if seen.insert(w.lpn) {
                order.push(w.lpn);
                if w.data.len() < self.cfg.page_bytes() {
                    partial.push(w.lpn);
                }
            }
        }
        if order.is_empty() {
            return Ok(());
        }

        let bases = self.fetch(core, &partial)?;
        let mut images: HashMap<Lpn, Box<[u8]>> = partial
            .into_iter()
            .zip(bases)
            .map(|(lpn, base)| (lpn, base.unwrap_or_else(|| self.blank())))
            .collect();
        for w in writes {
            let image = images.entry(w.lpn).or_insert_with(|| self.blank());
            let start = w.sector * self.cfg.sector_size;
            image[start..start + w.data.len()].copy_from_slice(w.data);
        }

        let batch = IoBatch::new();
        let mut placed = Vec::with_capacity(order.len());
        let mut failure = None;
        for lpn in order {
            let ppn = match self.allocate(core) {
                Ok(ppn) => ppn,
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            };
            let data = images.remove(&lpn).unwrap_or_else(|| self.blank());
            if let Err(err) = self.flash.page_write(core, ppn, data, &batch) {
                self.ftl.abandon(ppn);
                failure = Some(err);
                break;
            }
            placed.push((lpn, ppn));
        }
        self.flash.wait(&batch);

        if let Some(err) = failure {
            for (_, ppn) in placed {
                self.ftl.abandon(ppn);
            }
            return Err(err);
        }
        let count = placed.len() as u64;
        for (lpn, ppn) in placed {
            self.ftl.remap(lpn, ppn)?;
        }
        Stats::add(&self.stats.host_write_pages, count);
        Ok(())
    }

    /// Read pages as the flash holds them. `None` for pages that were never written or were trimmed.
    fn fetch(&self, core: CoreId, lpns: &[Lpn]) -> Result<Vec<Option<Box<[u8]>>>> {
        if lpns.is_empty() {
            return Ok(Vec::new());
        }
        let batch = IoBatch::new();
        let mut pending = Vec::with_capacity(lpns.len());
        for &lpn in lpns {
            let data = self.ftl.with_resolved(lpn, |value| match value {
                L2PValue::Valid(ppn) => self.flash.page_read(core, ppn, &batch).map(|data| Some(data.unwrap_or_else(|| self.blank()))),
                L2PValue::Invalid => Ok(None),
            })??;
            pending.push(data);
        }
        self.flash.wait(&batch);
        Ok(pending)
    }

    pub fn read_pages(&self, core: CoreId, lpns: &[Lpn]) -> Result<Vec<Option<Box<[u8]>>>> {
        let pages = self.fetch(core, lpns)?;
        let trimmed = pages.iter().filter(|p| p.is_none()).count() as u64;
        Stats::add(&self.stats.host_read_pages, pages.len() as u64);
        Stats::add(&self.stats.trimmed_pages, trimmed);
        Ok(pages)
    }

    /// Drop the mappings of whole pages. Returns how many were mapped.
    pub fn discard(&self, lpns: &[Lpn]) -> Result<usize> {
        let mut dropped = 0;
        for &lpn in lpns {
            if let Some(ppn) = self.ftl.unmap(lpn)? {
                trace!("discard lpn {} at {}", lpn, ppn);
                dropped += 1;
            }
        }
        Stats::add(&self.stats.discarded_pages, dropped as u64);
        Ok(dropped)
    }

    /// Write metadata to `meta_dir`, if one is configured.
    pub fn save(&self) -> Result<()> {
        match self.cfg.meta_dir.as_deref() {
            Some(dir) => persist::save(dir, &self.cfg, &self.blocks, &self.ftl),
            None => Ok(()),
        }
    }

    pub fn audit(&self) -> std::result::Result<(), String> {
        self.blocks.audit()?;
        self.ftl.audit()
    }
}
