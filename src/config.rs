use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FtlError, Result};

pub type BaseType = usize;

pub type Lpn = u64;
pub type Sector = u64;
pub type CoreId = BaseType;
pub type Counter = u64;
/// Simulated time in microseconds.
pub type Usec = u64;

pub const CHANNELS: BaseType = 2;
pub const DIES_PER_CHANNEL: BaseType = 2;
pub const PLANES_PER_DIE: BaseType = 2;
pub const BLOCKS_PER_PLANE: BaseType = 64;
pub const PAGES_PER_BLOCK: BaseType = 64;

pub const SECTOR_SIZE: BaseType = 512;
pub const SECTORS_PER_PAGE: BaseType = 8;

pub const OP_PERCENT: f64 = 7.0;

pub const CORES: BaseType = 2;
pub const WRITE_BUFFERS: BaseType = 4;
pub const WRITE_BUFFER_SECTORS: BaseType = 1024;
pub const READ_BUFFER_SECTORS: BaseType = 1024;
pub const DISCARD_BUFFER_RANGES: BaseType = 256;

pub const FLUSH_TIMEOUT_USEC: Usec = 300_000;

// fraction of blocks in use at which GC kicks in
pub const GC_LOW_WATERMARK: f64 = 0.80;
pub const GC_HIGH_WATERMARK: f64 = 0.95;

pub const GC_MIN_SLEEP_USEC: Usec = 1_000;
pub const GC_MAX_SLEEP_USEC: Usec = 256_000;

pub const CMD_SET_DELAY: Usec = 1;
pub const REG_WRITE_DELAY: Usec = 82;
pub const REG_READ_DELAY: Usec = 82;
pub const CELL_PROGRAM_DELAY: Usec = 900;
pub const CELL_READ_DELAY: Usec = 50;
pub const BLOCK_ERASE_DELAY: Usec = 2_000;

/// Scope at which free blocks are counted, GC locks are taken and pages are allocated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Granularity {
    Device,
    Die,
    Plane,
}

impl Granularity {
    /// Next wider scope, `None` for the whole device.
    pub fn wider(self) -> Option<Granularity> {
        match self {
            Granularity::Plane => Some(Granularity::Die),
            Granularity::Die => Some(Granularity::Device),
            Granularity::Device => None,
        }
    }

    /// True when `self` covers at least as much as `other`.
    pub fn covers(self, other: Granularity) -> bool {
        self.rank() >= other.rank()
    }

    fn rank(self) -> u8 {
        match self {
            Granularity::Plane => 0,
            Granularity::Die => 1,
            Granularity::Device => 2,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlashTiming {
    pub cmd_set: Usec,
    pub reg_write: Usec,
    pub reg_read: Usec,
    pub cell_program: Usec,
    pub cell_read: Usec,
    pub block_erase: Usec,
}

impl Default for FlashTiming {
    fn default() -> Self {
        FlashTiming {
            cmd_set: CMD_SET_DELAY,
            reg_write: REG_WRITE_DELAY,
            reg_read: REG_READ_DELAY,
            cell_program: CELL_PROGRAM_DELAY,
            cell_read: CELL_READ_DELAY,
            block_erase: BLOCK_ERASE_DELAY,
        }
    }
}

impl FlashTiming {
    /// Every phase takes one microsecond, handy for tests running on the wall clock.
    pub fn instant() -> Self {
        FlashTiming {
            cmd_set: 1,
            reg_write: 1,
            reg_read: 1,
            cell_program: 1,
            cell_read: 1,
            block_erase: 1,
        }
    }
}

/// Drive geometry and tunables. Built once at startup and shared read-only.
#[derive(Clone, Debug)]
pub struct GeometryConfig {
    pub channels: BaseType,
    pub dies_per_channel: BaseType,
    pub planes_per_die: BaseType,
    pub blocks_per_plane: BaseType,
    pub pages_per_block: BaseType,
    pub sector_size: BaseType,
    pub sectors_per_page: BaseType,
    pub op_percent: f64,

    pub timing: FlashTiming,
    pub page_cache_register: bool,
    pub copy_back: bool,

    pub gc_mode: Granularity,
    pub gc_low_watermark: f64,
    pub gc_high_watermark: f64,
    pub gc_min_sleep: Duration,
    pub gc_max_sleep: Duration,
    pub background_gc: bool,

    pub cores: BaseType,
    pub write_buffers: BaseType,
    pub write_buffer_sectors: BaseType,
    pub read_buffer_sectors: BaseType,
    pub discard_buffer_ranges: BaseType,
    pub flush_timeout: Duration,

    pub meta_dir: Option<PathBuf>,
}

impl Default for GeometryConfig {
    fn default() -> Self {
        GeometryConfig {
            channels: CHANNELS,
            dies_per_channel: DIES_PER_CHANNEL,
            planes_per_die: PLANES_PER_DIE,
            blocks_per_plane: BLOCKS_PER_PLANE,
            pages_per_block: PAGES_PER_BLOCK,
            sector_size: SECTOR_SIZE,
            sectors_per_page: SECTORS_PER_PAGE,
            op_percent: OP_PERCENT,
            timing: FlashTiming::default(),
            page_cache_register: false,
            copy_back: true,
            gc_mode: Granularity::Plane,
            gc_low_watermark: GC_LOW_WATERMARK,
            gc_high_watermark: GC_HIGH_WATERMARK,
            gc_min_sleep: Duration::from_micros(GC_MIN_SLEEP_USEC),
            gc_max_sleep: Duration::from_micros(GC_MAX_SLEEP_USEC),
            background_gc: true,
            cores: CORES,
            write_buffers: WRITE_BUFFERS,
            write_buffer_sectors: WRITE_BUFFER_SECTORS,
            read_buffer_sectors: READ_BUFFER_SECTORS,
            discard_buffer_ranges: DISCARD_BUFFER_RANGES,
            flush_timeout: Duration::from_micros(FLUSH_TIMEOUT_USEC),
            meta_dir: None,
        }
    }
}

impl GeometryConfig {
    pub fn validate(&self) -> Result<()> {
        let dims = [
            ("channels", self.channels),
            ("dies_per_channel", self.dies_per_channel),
            ("planes_per_die", self.planes_per_die),
            ("blocks_per_plane", self.blocks_per_plane),
            ("pages_per_block", self.pages_per_block),
            ("sector_size", self.sector_size),
            ("sectors_per_page", self.sectors_per_page),
            ("cores", self.cores),
            ("write_buffers", self.write_buffers),
            ("discard_buffer_ranges", self.discard_buffer_ranges),
        ];
        for (name, value) in dims {
            if value == 0 {
                return Err(FtlError::InvalidConfig(format!("{} must be non-zero", name)));
            }
        }
        if self.pages_per_block > u32::MAX as BaseType || self.blocks_per_plane > u32::MAX as BaseType {
            return Err(FtlError::InvalidConfig("block geometry exceeds 32-bit indices".into()));
        }
        for (name, ratio) in [("gc_low_watermark", self.gc_low_watermark), ("gc_high_watermark", self.gc_high_watermark)] {
            if !(0.0..1.0).contains(&ratio) {
                return Err(FtlError::InvalidConfig(format!("{} must be in [0, 1), got {}", name, ratio)));
            }
        }
        if self.gc_low_watermark > self.gc_high_watermark {
            return Err(FtlError::InvalidConfig("low watermark above high watermark".into()));
        }
        if self.gc_min_sleep.is_zero() || self.gc_min_sleep > self.gc_max_sleep {
            return Err(FtlError::InvalidConfig("bad background GC sleep bounds".into()));
        }
        if self.write_buffer_sectors < self.sectors_per_page || self.read_buffer_sectors < self.sectors_per_page {
            return Err(FtlError::InvalidConfig("buffers must hold at least one page".into()));
        }
        if !(0.0..100.0).contains(&self.op_percent) || self.logical_pages() == 0 {
            return Err(FtlError::InvalidConfig(format!("over-provisioning {}% leaves no logical space", self.op_percent)));
        }
        Ok(())
    }

    pub fn dies(&self) -> BaseType {
        self.channels * self.dies_per_channel
    }

    pub fn planes(&self) -> BaseType {
        self.dies() * self.planes_per_die
    }

    pub fn blocks(&self) -> BaseType {
        self.planes() * self.blocks_per_plane
    }

    pub fn pages(&self) -> u64 {
        self.blocks() as u64 * self.pages_per_block as u64
    }

    pub fn pages_per_plane(&self) -> BaseType {
        self.blocks_per_plane * self.pages_per_block
    }

    pub fn page_bytes(&self) -> BaseType {
        self.sector_size * self.sectors_per_page
    }

    pub fn logical_pages(&self) -> u64 {
        let op_pages = (self.pages() as f64 * (self.op_percent / 100.)).trunc() as u64;
        self.pages().saturating_sub(op_pages)
    }

    pub fn logical_sectors(&self) -> Sector {
        self.logical_pages() * self.sectors_per_page as Sector
    }

    pub fn physical_bytes(&self) -> u64 {
        self.pages() * self.page_bytes() as u64
    }

    pub fn logical_bytes(&self) -> u64 {
        self.logical_pages() * self.page_bytes() as u64
    }

    /// Number of blocks covered by one scope of the given granularity.
    pub fn blocks_in(&self, scope: Granularity) -> BaseType {
        match scope {
            Granularity::Plane => self.blocks_per_plane,
            Granularity::Die => self.blocks_per_plane * self.planes_per_die,
            Granularity::Device => self.blocks(),
        }
    }

    /// (low, high) empty-block thresholds for one GC scope.
    ///
    /// Small scopes round the high threshold down to 0: foreground GC then fires once the scope has
    /// handed out its last empty block, while the low threshold still starts background GC earlier.
    pub fn watermark_blocks(&self) -> (BaseType, BaseType) {
        let total = self.blocks_in(self.gc_mode) as f64;
        let low = (total * (1. - self.gc_low_watermark)).floor() as BaseType;
        let high = (total * (1. - self.gc_high_watermark)).floor() as BaseType;
        (low, high)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let cfg = GeometryConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.dies(), 4);
        assert_eq!(cfg.planes(), 8);
        assert!(cfg.logical_pages() < cfg.pages());
    }

    #[test]
    fn rejects_zero_dimension() {
        let cfg = GeometryConfig { planes_per_die: 0, ..Default::default() };
        assert!(matches!(cfg.validate(), Err(FtlError::InvalidConfig(_))));
    }

    #[test]
    fn rejects_inverted_watermarks() {
        let cfg = GeometryConfig { gc_low_watermark: 0.9, gc_high_watermark: 0.5, ..Default::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn watermarks_per_scope() {
        let cfg = GeometryConfig {
            blocks_per_plane: 4,
            gc_low_watermark: 0.5,
            gc_high_watermark: 0.75,
            gc_mode: Granularity::Plane,
            ..Default::default()
        };
        assert_eq!(cfg.watermark_blocks(), (2, 1));

        let cfg = GeometryConfig { gc_mode: Granularity::Device, ..cfg };
        // 2 channels * 2 dies * 2 planes * 4 blocks
        assert_eq!(cfg.watermark_blocks(), (16, 8));
    }

    #[test]
    fn small_scope_high_watermark_is_zero() {
        // 2 channels * 2 dies * 1 plane * 4 blocks, the sequential fill scenario
        let cfg = GeometryConfig {
            dies_per_channel: 2,
            planes_per_die: 1,
            blocks_per_plane: 4,
            gc_low_watermark: 0.6,
            gc_high_watermark: 0.8,
            ..Default::default()
        };
        cfg.validate().unwrap();
        assert_eq!(cfg.watermark_blocks(), (1, 0));

        let cfg = GeometryConfig { blocks_per_plane: 8, ..Default::default() };
        assert_eq!(cfg.watermark_blocks(), (1, 0));
    }

    #[test]
    fn granularity_widens_to_device() {
        assert_eq!(Granularity::Plane.wider(), Some(Granularity::Die));
        assert_eq!(Granularity::Die.wider(), Some(Granularity::Device));
        assert_eq!(Granularity::Device.wider(), None);
        assert!(Granularity::Die.covers(Granularity::Plane));
        assert!(!Granularity::Plane.covers(Granularity::Die));
    }
}
