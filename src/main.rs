#[macro_use]
extern crate log;
extern crate simplelog;

use std::path::PathBuf;
use std::sync::Arc;

use byte_unit::Byte;
use nand_ftl_sim::clock::WallClock;
use nand_ftl_sim::config::*;
use nand_ftl_sim::host::MemoryHost;
use nand_ftl_sim::{IoScheduler, Ssd};
use rand::prelude::*;
use simplelog::*;
use time::macros::format_description;

// sectors per request while preconditioning
const PRECONDITION_CHUNK: BaseType = 256;
const RANDOM_PASSES: usize = 2;

fn main() -> nand_ftl_sim::Result<()> {
    let log_cfg = ConfigBuilder::new()
        .set_time_format_custom(format_description!("[hour]:[minute]:[second].[subsecond]"))
        .build();

    if let Err(err) = SimpleLogger::init(LevelFilter::Info, log_cfg) {
        eprintln!("logger unavailable: {}", err);
    }

    let cfg = GeometryConfig { meta_dir: std::env::args().nth(1).map(PathBuf::from), ..Default::default() };
    let ssd = Arc::new(Ssd::open(cfg, Arc::new(WallClock::new()))?);
    let host = Arc::new(MemoryHost::new());
    let scheduler = IoScheduler::start(ssd.clone(), host.clone())?;

    let cfg = ssd.config().clone();
    let spp = cfg.sectors_per_page;
    let sectors = cfg.logical_sectors();
    info!(
        "User Capacity: {}",
        Byte::from(cfg.logical_bytes() as usize).get_appropriate_unit(true).to_string()
    );

    let chunk = host.insert(vec![0xa5; PRECONDITION_CHUNK * cfg.sector_size]);
    let mut start: Sector = 0;
    while start < sectors {
        let len = (sectors - start).min(PRECONDITION_CHUNK as Sector) as BaseType;
        scheduler.submit_write(start, len, chunk)?;
        start += len as Sector;
    }
    scheduler.submit_flush()?;
    info!("Drive preconditioned");

    let mut rng: SmallRng = SmallRng::seed_from_u64(7);
    let page = host.insert(vec![0x5a; cfg.page_bytes()]);
    let max_lba = ssd.ftl().get_max_lba();

    for c in 0..RANDOM_PASSES {
        for _ in 0..=max_lba {
            let lba = rng.gen_range(0..=max_lba);
            scheduler.submit_write(lba * spp as Sector, spp, page)?;
        }
        scheduler.submit_flush()?;
        info!("Capacity {} randomly written", c);
    }

    let probe = host.alloc(cfg.page_bytes());
    let read = scheduler.submit_read(0, spp, probe)?;
    read.wait();
    if let Some(reason) = read.failure() {
        error!("read back failed: {}", reason);
    }

    ssd.stats().snapshot().log(cfg.page_bytes());
    if let Err(err) = ssd.audit() {
        error!("tables inconsistent: {}", err);
    }
    scheduler.shutdown()
}
