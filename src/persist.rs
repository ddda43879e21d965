use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use log::*;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::block::{BlockManager, BlockRecord};
use crate::config::{BaseType, GeometryConfig};
use crate::error::{FtlError, Result};
use crate::ftl::Ftl;

pub const GEOMETRY_FILE: &str = "geometry.bin";
pub const MAPPING_FILE: &str = "mapping_table.bin";
pub const INVERSE_FILE: &str = "inverse_mapping.bin";
pub const BLOCK_STATE_FILE: &str = "block_state_table.bin";
pub const EMPTY_LIST_FILE: &str = "empty_block_list.bin";
pub const VICTIM_LIST_FILE: &str = "victim_block_list.bin";
pub const OPEN_BLOCKS_FILE: &str = "open_blocks.bin";

/// Everything the tables' shape depends on. A snapshot only loads into the same shape.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct Fingerprint {
    channels: BaseType,
    dies_per_channel: BaseType,
    planes_per_die: BaseType,
    blocks_per_plane: BaseType,
    pages_per_block: BaseType,
    sector_size: BaseType,
    sectors_per_page: BaseType,
    logical_pages: u64,
}

impl Fingerprint {
    fn of(cfg: &GeometryConfig) -> Self {
        Fingerprint {
            channels: cfg.channels,
            dies_per_channel: cfg.dies_per_channel,
            planes_per_die: cfg.planes_per_die,
            blocks_per_plane: cfg.blocks_per_plane,
            pages_per_block: cfg.pages_per_block,
            sector_size: cfg.sector_size,
            sectors_per_page: cfg.sectors_per_page,
            logical_pages: cfg.logical_pages(),
        }
    }
}

fn store<T: Serialize>(dir: &Path, name: &str, value: &T) -> Result<()> {
    let mut out = BufWriter::new(File::create(dir.join(name))?);
    bincode::serialize_into(&mut out, value)?;
    out.flush()?;
    Ok(())
}

fn fetch<T: DeserializeOwned>(dir: &Path, name: &str) -> Result<T> {
    let input = BufReader::new(File::open(dir.join(name))?);
    Ok(bincode::deserialize_from(input)?)
}

/// Write the mapping tables, block table and block lists as flat arrays, one file each.
pub fn save(dir: &Path, cfg: &GeometryConfig, blocks: &BlockManager, ftl: &Ftl) -> Result<()> {
    fs::create_dir_all(dir)?;
    let (forward, inverse, open) = ftl.snapshot();
    let (records, empty, victim) = blocks.snapshot();

    store(dir, MAPPING_FILE, &forward)?;
    store(dir, INVERSE_FILE, &inverse)?;
    store(dir, BLOCK_STATE_FILE, &records)?;
    store(dir, EMPTY_LIST_FILE, &empty)?;
    store(dir, VICTIM_LIST_FILE, &victim)?;
    store(dir, OPEN_BLOCKS_FILE, &open)?;
    // written last: a directory without it holds no usable snapshot
    store(dir, GEOMETRY_FILE, &Fingerprint::of(cfg))?;
    info!("metadata saved to {}", dir.display());
    Ok(())
}

/// Load a snapshot from `dir`. `Ok(None)` when there is none yet.
pub fn load(dir: &Path, cfg: &Arc<GeometryConfig>) -> Result<Option<(Arc<BlockManager>, Ftl)>> {
    if !dir.join(GEOMETRY_FILE).exists() {
        debug!("no metadata in {}, starting blank", dir.display());
        return Ok(None);
    }
    let stored: Fingerprint = fetch(dir, GEOMETRY_FILE)?;
    if stored != Fingerprint::of(cfg) {
        error!("metadata in {} was written for {:?}", dir.display(), stored);
        return Err(FtlError::InvalidConfig(format!("metadata in {} belongs to another geometry", dir.display())));
    }

    let records: Vec<BlockRecord> = fetch(dir, BLOCK_STATE_FILE)?;
    let empty: Vec<Vec<u32>> = fetch(dir, EMPTY_LIST_FILE)?;
    let victim: Vec<Vec<u32>> = fetch(dir, VICTIM_LIST_FILE)?;
    let blocks = Arc::new(BlockManager::restore(cfg.clone(), records, empty, victim)?);

    let forward: Vec<u64> = fetch(dir, MAPPING_FILE)?;
    let inverse: Vec<Vec<u64>> = fetch(dir, INVERSE_FILE)?;
    let open: Vec<Option<u32>> = fetch(dir, OPEN_BLOCKS_FILE)?;
    let ftl = Ftl::restore(cfg.clone(), blocks.clone(), forward, inverse, open)?;
    Ok(Some((blocks, ftl)))
}
