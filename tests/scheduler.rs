use std::sync::Arc;
use std::thread;
use std::time::Duration;

use nand_ftl_sim::clock::WallClock;
use nand_ftl_sim::config::{FlashTiming, GeometryConfig, Sector};
use nand_ftl_sim::host::MemoryHost;
use nand_ftl_sim::request::{HostRequest, IoKind, SectorRange};
use nand_ftl_sim::{FtlError, IoScheduler, Ssd};
use rand::prelude::*;

const SECTOR: usize = 512;
const SPP: usize = 4;

fn geometry() -> GeometryConfig {
    GeometryConfig {
        channels: 2,
        dies_per_channel: 1,
        planes_per_die: 2,
        blocks_per_plane: 16,
        pages_per_block: 16,
        sector_size: SECTOR,
        sectors_per_page: SPP,
        op_percent: 25.0,
        timing: FlashTiming::instant(),
        cores: 2,
        write_buffers: 4,
        write_buffer_sectors: 32,
        read_buffer_sectors: 16,
        flush_timeout: Duration::from_millis(20),
        ..Default::default()
    }
}

struct Rig {
    ssd: Arc<Ssd>,
    host: Arc<MemoryHost>,
    io: IoScheduler,
}

fn start(cfg: GeometryConfig) -> Rig {
    let ssd = Arc::new(Ssd::open(cfg, Arc::new(WallClock::new())).unwrap());
    let host = Arc::new(MemoryHost::new());
    let io = IoScheduler::start(ssd.clone(), host.clone()).unwrap();
    Rig { ssd, host, io }
}

impl Rig {
    fn write(&self, start: Sector, data: Vec<u8>) -> Arc<HostRequest> {
        let len = data.len() / SECTOR;
        let handle = self.host.insert(data);
        let req = self.io.submit_write(start, len, handle).unwrap();
        req.wait();
        self.host.free(handle);
        req
    }

    fn read(&self, start: Sector, sectors: usize) -> (Vec<u8>, Arc<HostRequest>) {
        let handle = self.host.alloc(sectors * SECTOR);
        let req = self.io.submit_read(start, sectors, handle).unwrap();
        req.wait();
        (self.host.free(handle).unwrap(), req)
    }
}

fn pattern(sectors: usize, seed: u8) -> Vec<u8> {
    (0..sectors * SECTOR).map(|i| seed.wrapping_add((i / SECTOR) as u8)).collect()
}

#[test]
fn unaligned_write_reads_back() {
    let rig = start(geometry());
    let data = pattern(13, 40);
    rig.write(6, data.clone());
    let (back, req) = rig.read(6, 13);
    assert_eq!(back, data);
    assert!(req.failure().is_none());

    rig.io.submit_flush().unwrap();
    let (back, _) = rig.read(6, 13);
    assert_eq!(back, data);

    // neighbours of a partial page stay zero
    let (edge, req) = rig.read(4, 2);
    assert!(edge.iter().all(|&b| b == 0));
    assert_eq!(req.trimmed(), 0);
    rig.io.shutdown().unwrap();
}

#[test]
fn reads_are_served_from_write_buffers() {
    let rig = start(GeometryConfig { flush_timeout: Duration::from_secs(30), ..geometry() });
    let data = pattern(SPP, 7);
    let req = rig.write(8, data.clone());
    assert!(req.is_completed());

    let (back, req) = rig.read(8, SPP);
    assert_eq!(back, data);
    assert_eq!(req.trimmed(), 0);
    assert_eq!(rig.ssd.stats().snapshot().flash_programs, 0);

    let ssd = rig.ssd.clone();
    rig.io.shutdown().unwrap();
    assert_eq!(ssd.stats().snapshot().host_write_pages, 1);
}

#[test]
fn flush_is_a_barrier() {
    let rig = start(GeometryConfig { flush_timeout: Duration::from_secs(30), ..geometry() });
    let mut earlier = Vec::new();
    for page in 0..40u64 {
        let handle = rig.host.insert(pattern(SPP, page as u8));
        earlier.push(rig.io.submit_write(page * SPP as Sector, SPP, handle).unwrap());
        if page % 8 == 0 {
            let target = rig.host.alloc(SPP * SECTOR);
            earlier.push(rig.io.submit_read(page * SPP as Sector, SPP, target).unwrap());
        }
    }
    let flush = rig.io.submit_flush().unwrap();
    assert!(flush.is_completed());
    assert!(flush.failure().is_none());
    assert!(earlier.iter().all(|req| req.is_completed()));

    // everything is on flash now
    let lpns: Vec<u64> = (0..40).collect();
    let pages = rig.ssd.read_pages(0, &lpns).unwrap();
    for (lpn, page) in pages.into_iter().enumerate() {
        assert_eq!(page.unwrap().to_vec(), pattern(SPP, lpn as u8), "lpn {}", lpn);
    }
    rig.io.shutdown().unwrap();
}

#[test]
fn discard_drops_whole_pages_only() {
    let rig = start(geometry());
    let data = pattern(16, 1);
    rig.write(0, data.clone());
    rig.io.submit_flush().unwrap();

    let discard = rig.io.submit_discard(vec![SectorRange::new(2, 12)]).unwrap();
    discard.wait();
    assert!(discard.failure().is_none());

    let (back, req) = rig.read(0, 16);
    assert_eq!(req.trimmed(), 2);
    assert_eq!(back[..4 * SECTOR], data[..4 * SECTOR]);
    assert!(back[4 * SECTOR..12 * SECTOR].iter().all(|&b| b == 0));
    assert_eq!(back[12 * SECTOR..], data[12 * SECTOR..]);
    rig.io.shutdown().unwrap();
}

#[test]
fn discard_after_buffered_write_wins() {
    let rig = start(GeometryConfig { flush_timeout: Duration::from_secs(30), ..geometry() });
    rig.write(0, pattern(SPP, 9));
    rig.io.submit_discard(vec![SectorRange::new(0, SPP)]).unwrap().wait();
    rig.io.submit_flush().unwrap();

    let (back, req) = rig.read(0, SPP);
    assert!(back.iter().all(|&b| b == 0));
    assert_eq!(req.trimmed(), 1);
    rig.io.shutdown().unwrap();
}

#[test]
fn write_larger_than_all_buffers() {
    let rig = start(GeometryConfig { write_buffers: 2, write_buffer_sectors: 8, ..geometry() });
    let data = pattern(64, 3);
    let req = rig.write(0, data.clone());
    assert!(req.is_completed());
    rig.io.submit_flush().unwrap();
    let (back, _) = rig.read(0, 64);
    assert_eq!(back, data);
    rig.io.shutdown().unwrap();
}

#[test]
fn raw_opcodes() {
    let rig = start(geometry());
    let handle = rig.host.insert(pattern(SPP, 5));
    let req = rig.io.submit_raw(IoKind::OP_WRITE, 0, SPP, handle).unwrap();
    req.wait();
    assert!(matches!(rig.io.submit_raw(0x42, 0, SPP, handle), Err(FtlError::QueueProtocolError(0x42))));

    let flush = rig.io.submit_raw(IoKind::OP_FLUSH, 0, 0, 0).unwrap();
    assert!(flush.is_completed());
    let completed = rig.host.completed();
    assert!(completed.contains(&req.seq()));
    assert!(completed.contains(&flush.seq()));
    rig.io.shutdown().unwrap();
}

#[test]
fn out_of_range_is_refused() {
    let rig = start(geometry());
    let end = rig.ssd.config().logical_sectors();
    assert!(matches!(rig.io.submit_read(end - 1, 2, 0), Err(FtlError::InvalidAddress { .. })));
    assert!(rig.io.submit_read(end - 1, 1, rig.host.alloc(SECTOR)).is_ok());

    // sector numbers that wrap around are refused, not accepted or panicking
    let handle = rig.host.alloc(4 * SECTOR);
    assert!(matches!(rig.io.submit_read(u64::MAX - 1, 4, handle), Err(FtlError::InvalidAddress { .. })));
    assert!(matches!(rig.io.submit_write(u64::MAX, 1, handle), Err(FtlError::InvalidAddress { .. })));
    assert!(matches!(
        rig.io.submit_discard(vec![SectorRange::new(0, 4), SectorRange::new(u64::MAX - 2, 8)]),
        Err(FtlError::InvalidAddress { .. })
    ));
    assert!(matches!(rig.io.submit_raw(IoKind::OP_READ, u64::MAX, 2, handle), Err(FtlError::InvalidAddress { .. })));
    rig.io.shutdown().unwrap();
}

#[test]
fn random_overwrites_with_background_gc() {
    let rig = start(GeometryConfig {
        blocks_per_plane: 8,
        pages_per_block: 8,
        gc_min_sleep: Duration::from_micros(200),
        gc_max_sleep: Duration::from_millis(5),
        ..geometry()
    });
    let pages = rig.ssd.ftl().logical_size();
    let mut rng = SmallRng::seed_from_u64(7);
    let mut expected = vec![None; pages as usize];
    for i in 0..1500u32 {
        let lpn = rng.gen_range(0..pages);
        let seed = (i % 251) as u8;
        rig.write(lpn * SPP as Sector, pattern(SPP, seed));
        expected[lpn as usize] = Some(seed);
    }
    rig.io.submit_flush().unwrap();

    for (lpn, seed) in expected.iter().enumerate() {
        let (back, req) = rig.read(lpn as Sector * SPP as Sector, SPP);
        match seed {
            Some(seed) => assert_eq!(back, pattern(SPP, *seed), "lpn {}", lpn),
            None => assert_eq!(req.trimmed(), 1),
        }
    }
    let ssd = rig.ssd.clone();
    rig.io.shutdown().unwrap();
    assert!(ssd.stats().snapshot().gc_passes > 0);
    ssd.audit().unwrap();
}

#[test]
fn concurrent_submitters() {
    let rig = Arc::new(start(geometry()));
    let workers: Vec<_> = (0..3u64)
        .map(|t| {
            let rig = rig.clone();
            thread::spawn(move || {
                let mut rng = SmallRng::seed_from_u64(t);
                // each thread owns pages t, t + 3, t + 6, ...
                let mut last = Vec::new();
                for _ in 0..60 {
                    let lpn = t + 3 * rng.gen_range(0..20u64);
                    let seed = rng.gen::<u8>();
                    rig.write(lpn * SPP as Sector, pattern(SPP, seed));
                    last.retain(|&(l, _)| l != lpn);
                    last.push((lpn, seed));
                }
                last
            })
        })
        .collect();
    let mut expected = Vec::new();
    for w in workers {
        expected.extend(w.join().unwrap());
    }
    rig.io.submit_flush().unwrap();
    for (lpn, seed) in expected {
        let (back, _) = rig.read(lpn * SPP as Sector, SPP);
        assert_eq!(back, pattern(SPP, seed), "lpn {}", lpn);
    }
}
