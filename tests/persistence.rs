use std::sync::Arc;

use nand_ftl_sim::clock::WallClock;
use nand_ftl_sim::config::{FlashTiming, GeometryConfig, Sector};
use nand_ftl_sim::ftl::L2PValue;
use nand_ftl_sim::host::MemoryHost;
use nand_ftl_sim::persist::{GEOMETRY_FILE, MAPPING_FILE};
use nand_ftl_sim::{FtlError, IoScheduler, Ssd};
use tempfile::TempDir;

fn geometry(dir: &TempDir) -> GeometryConfig {
    GeometryConfig {
        channels: 2,
        dies_per_channel: 1,
        planes_per_die: 2,
        blocks_per_plane: 8,
        pages_per_block: 8,
        sector_size: 512,
        sectors_per_page: 2,
        op_percent: 25.0,
        timing: FlashTiming::instant(),
        cores: 2,
        write_buffer_sectors: 16,
        read_buffer_sectors: 16,
        meta_dir: Some(dir.path().to_path_buf()),
        ..Default::default()
    }
}

fn open(cfg: GeometryConfig) -> Arc<Ssd> {
    Arc::new(Ssd::open(cfg, Arc::new(WallClock::new())).unwrap())
}

fn write_all(io: &IoScheduler, host: &MemoryHost, pages: u64, byte: u8) {
    for lpn in 0..pages {
        let handle = host.insert(vec![byte; 1024]);
        io.submit_write(lpn * 2, 2, handle).unwrap().wait();
        host.free(handle);
    }
}

#[test]
fn shutdown_saves_and_open_restores() {
    let dir = TempDir::new().unwrap();
    let ssd = open(geometry(&dir));
    let host = Arc::new(MemoryHost::new());
    let io = IoScheduler::start(ssd.clone(), host.clone()).unwrap();
    write_all(&io, &host, 40, 1);
    write_all(&io, &host, 10, 2);
    io.submit_discard(vec![nand_ftl_sim::request::SectorRange::new(60, 4)]).unwrap().wait();
    io.shutdown().unwrap();

    assert!(dir.path().join(GEOMETRY_FILE).exists());
    assert!(dir.path().join(MAPPING_FILE).exists());
    let (forward, _, open_blocks) = ssd.ftl().snapshot();

    let restored = open(geometry(&dir));
    let (again, _, again_open) = restored.ftl().snapshot();
    assert_eq!(forward, again);
    assert_eq!(open_blocks, again_open);
    assert!(matches!(restored.ftl().resolve(5).unwrap(), L2PValue::Valid(_)));
    assert_eq!(restored.ftl().resolve(30).unwrap(), L2PValue::Invalid);
    assert_eq!(restored.ftl().resolve(45).unwrap(), L2PValue::Invalid);
    for plane in 0..ssd.config().planes() {
        assert_eq!(
            restored.blocks().empty_blocks(ssd.config().gc_mode, plane),
            ssd.blocks().empty_blocks(ssd.config().gc_mode, plane)
        );
    }
    restored.audit().unwrap();
}

#[test]
fn restored_drive_keeps_serving() {
    let dir = TempDir::new().unwrap();
    {
        let ssd = open(geometry(&dir));
        let host = Arc::new(MemoryHost::new());
        let io = IoScheduler::start(ssd, host.clone()).unwrap();
        write_all(&io, &host, 20, 3);
        io.shutdown().unwrap();
    }

    let ssd = open(geometry(&dir));
    let host = Arc::new(MemoryHost::new());
    let io = IoScheduler::start(ssd.clone(), host.clone()).unwrap();
    // overwrite far more than the drive holds to force collection of restored blocks
    for round in 0..6u8 {
        write_all(&io, &host, ssd.ftl().logical_size(), round);
    }
    io.submit_flush().unwrap();

    let handle = host.alloc(1024);
    io.submit_read(7 * 2 as Sector, 2, handle).unwrap().wait();
    assert_eq!(host.free(handle).unwrap(), vec![5u8; 1024]);
    io.shutdown().unwrap();
    assert!(ssd.stats().snapshot().gc_passes > 0);
    ssd.audit().unwrap();
}

#[test]
fn other_geometry_is_refused() {
    let dir = TempDir::new().unwrap();
    let ssd = open(geometry(&dir));
    ssd.save().unwrap();

    let other = GeometryConfig { blocks_per_plane: 16, ..geometry(&dir) };
    assert!(matches!(Ssd::open(other, Arc::new(WallClock::new())), Err(FtlError::InvalidConfig(_))));
}
