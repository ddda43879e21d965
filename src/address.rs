use std::fmt;

use log::*;

use crate::config::{BaseType, GeometryConfig};
use crate::error::{FtlError, Result};

/// Global plane index, `flash * planes_per_die + plane`.
pub type PlaneId = BaseType;
/// Global die (flash) index.
pub type DieId = BaseType;

/// Physical block number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pbn {
    pub flash: u32,
    pub plane: u32,
    pub block: u32,
}

/// Physical page number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ppn {
    pub flash: u32,
    pub plane: u32,
    pub block: u32,
    pub page: u32,
}

impl Pbn {
    pub fn new(flash: u32, plane: u32, block: u32) -> Self {
        Pbn { flash, plane, block }
    }

    pub fn page(self, page: u32) -> Ppn {
        Ppn { flash: self.flash, plane: self.plane, block: self.block, page }
    }

    pub fn plane_id(self, cfg: &GeometryConfig) -> PlaneId {
        self.flash as BaseType * cfg.planes_per_die + self.plane as BaseType
    }

    pub fn die(self) -> DieId {
        self.flash as DieId
    }

    pub fn linear(self, cfg: &GeometryConfig) -> u64 {
        (self.plane_id(cfg) * cfg.blocks_per_plane) as u64 + self.block as u64
    }

    pub fn from_linear(cfg: &GeometryConfig, index: u64) -> Result<Self> {
        if index >= cfg.blocks() as u64 {
            return Err(FtlError::InvalidAddress { what: "block", value: index });
        }
        let block = index % cfg.blocks_per_plane as u64;
        let plane_id = index / cfg.blocks_per_plane as u64;
        Ok(Pbn::in_plane(cfg, plane_id as PlaneId, block as u32))
    }

    /// Block `block` of global plane `plane_id`.
    pub fn in_plane(cfg: &GeometryConfig, plane_id: PlaneId, block: u32) -> Self {
        Pbn {
            flash: (plane_id / cfg.planes_per_die) as u32,
            plane: (plane_id % cfg.planes_per_die) as u32,
            block,
        }
    }

    /// Refuses, and logs, a block outside the geometry.
    pub fn check(self, cfg: &GeometryConfig) -> Result<()> {
        self.bounds(cfg).map_err(|err| {
            error!("block {} refused: {}", self, err);
            err
        })
    }

    fn bounds(self, cfg: &GeometryConfig) -> Result<()> {
        if self.flash as BaseType >= cfg.dies() {
            return Err(FtlError::InvalidAddress { what: "flash", value: self.flash as u64 });
        }
        if self.plane as BaseType >= cfg.planes_per_die {
            return Err(FtlError::InvalidAddress { what: "plane", value: self.plane as u64 });
        }
        if self.block as BaseType >= cfg.blocks_per_plane {
            return Err(FtlError::InvalidAddress { what: "block", value: self.block as u64 });
        }
        Ok(())
    }
}

impl Ppn {
    pub fn pbn(self) -> Pbn {
        Pbn { flash: self.flash, plane: self.plane, block: self.block }
    }

    pub fn plane_id(self, cfg: &GeometryConfig) -> PlaneId {
        self.pbn().plane_id(cfg)
    }

    pub fn die(self) -> DieId {
        self.flash as DieId
    }

    /// Page offset inside its plane, the index of the inverse table.
    pub fn plane_offset(self, cfg: &GeometryConfig) -> BaseType {
        self.block as BaseType * cfg.pages_per_block + self.page as BaseType
    }

    pub fn linear(self, cfg: &GeometryConfig) -> u64 {
        self.pbn().linear(cfg) * cfg.pages_per_block as u64 + self.page as u64
    }

    pub fn from_linear(cfg: &GeometryConfig, index: u64) -> Result<Self> {
        if index >= cfg.pages() {
            return Err(FtlError::InvalidAddress { what: "page", value: index });
        }
        let page = (index % cfg.pages_per_block as u64) as u32;
        let pbn = Pbn::from_linear(cfg, index / cfg.pages_per_block as u64)?;
        Ok(pbn.page(page))
    }

    /// Refuses, and logs, a page outside the geometry.
    pub fn check(self, cfg: &GeometryConfig) -> Result<()> {
        let refused = match self.pbn().bounds(cfg) {
            Err(err) => err,
            Ok(()) if self.page as BaseType >= cfg.pages_per_block => {
                FtlError::InvalidAddress { what: "page", value: self.page as u64 }
            }
            Ok(()) => return Ok(()),
        };
        error!("page {} refused: {}", self, refused);
        Err(refused)
    }
}

/// Channel a die is wired to.
pub fn channel_of(cfg: &GeometryConfig, die: DieId) -> BaseType {
    die % cfg.channels
}

impl fmt::Display for Pbn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.flash, self.plane, self.block)
    }
}

impl fmt::Display for Ppn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}:{}", self.flash, self.plane, self.block, self.page)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn linear_index_covers_every_page_once() {
        let cfg = GeometryConfig { blocks_per_plane: 3, pages_per_block: 5, ..Default::default() };
        for index in 0..cfg.pages() {
            let ppn = Ppn::from_linear(&cfg, index).unwrap();
            ppn.check(&cfg).unwrap();
            assert_eq!(ppn.linear(&cfg), index);
        }
        assert!(Ppn::from_linear(&cfg, cfg.pages()).is_err());
    }

    #[test]
    fn rejects_out_of_range_parts() {
        let cfg = GeometryConfig::default();
        let bad = Ppn { flash: cfg.dies() as u32, plane: 0, block: 0, page: 0 };
        assert!(matches!(bad.check(&cfg), Err(FtlError::InvalidAddress { what: "flash", .. })));
        let bad = Ppn { flash: 0, plane: 0, block: 0, page: cfg.pages_per_block as u32 };
        assert!(matches!(bad.check(&cfg), Err(FtlError::InvalidAddress { what: "page", .. })));
    }

    #[test]
    fn plane_ids_are_flash_major() {
        let cfg = GeometryConfig::default();
        let pbn = Pbn::new(1, 1, 0);
        assert_eq!(pbn.plane_id(&cfg), cfg.planes_per_die + 1);
        assert_eq!(Pbn::in_plane(&cfg, pbn.plane_id(&cfg), 7), Pbn::new(1, 1, 7));
    }
}
