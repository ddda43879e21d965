use std::sync::atomic::{AtomicU64, Ordering};

use byte_unit::Byte;
use log::*;

use crate::config::Counter;

/// Running counters shared by every component.
#[derive(Default)]
pub struct Stats {
    pub host_read_pages: AtomicU64,
    pub host_write_pages: AtomicU64,
    pub trimmed_pages: AtomicU64,
    pub discarded_pages: AtomicU64,
    pub flash_reads: AtomicU64,
    pub flash_programs: AtomicU64,
    pub copy_backs: AtomicU64,
    pub erases: AtomicU64,
    pub gc_passes: AtomicU64,
    pub gc_copied_pages: AtomicU64,
    pub gc_failures: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub host_read_pages: Counter,
    pub host_write_pages: Counter,
    pub trimmed_pages: Counter,
    pub discarded_pages: Counter,
    pub flash_reads: Counter,
    pub flash_programs: Counter,
    pub copy_backs: Counter,
    pub erases: Counter,
    pub gc_passes: Counter,
    pub gc_copied_pages: Counter,
    pub gc_failures: Counter,
}

impl Stats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: Counter) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            host_read_pages: get(&self.host_read_pages),
            host_write_pages: get(&self.host_write_pages),
            trimmed_pages: get(&self.trimmed_pages),
            discarded_pages: get(&self.discarded_pages),
            flash_reads: get(&self.flash_reads),
            flash_programs: get(&self.flash_programs),
            copy_backs: get(&self.copy_backs),
            erases: get(&self.erases),
            gc_passes: get(&self.gc_passes),
            gc_copied_pages: get(&self.gc_copied_pages),
            gc_failures: get(&self.gc_failures),
        }
    }
}

impl StatsSnapshot {
    /// Pages programmed on flash per page written by the host.
    pub fn write_amplification(&self) -> f64 {
        if self.host_write_pages == 0 {
            return 0.;
        }
        (self.flash_programs + self.copy_backs) as f64 / self.host_write_pages as f64
    }

    pub fn log(&self, page_bytes: usize) {
        let bytes = |pages: Counter| Byte::from(pages as usize * page_bytes).get_appropriate_unit(true).to_string();
        info!("host reads: {} pages ({}), trimmed {}", self.host_read_pages, bytes(self.host_read_pages), self.trimmed_pages);
        info!("host writes: {} pages ({})", self.host_write_pages, bytes(self.host_write_pages));
        info!("discarded: {} pages", self.discarded_pages);
        info!(
            "flash: {} reads, {} programs, {} copy-backs, {} erases",
            self.flash_reads, self.flash_programs, self.copy_backs, self.erases
        );
        info!("gc: {} passes, {} pages moved, {} failed", self.gc_passes, self.gc_copied_pages, self.gc_failures);
        info!("write amplification: {:.3}", self.write_amplification());
    }
}
