use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::*;
use parking_lot::{Condvar, Mutex};

use crate::buffer::{RingBuffer, Slot, WriteBuffer};
use crate::clock::Shutdown;
use crate::config::{BaseType, CoreId, GeometryConfig, Lpn, Sector};
use crate::error::{FtlError, Result};
use crate::request::{split_pages, BufferHandle, BufferRef, CoreSubRequest, HostRequest, IoKind, Segment, SectorRange};
use crate::ssd::{PageWrite, Ssd};

const INTAKE_IDLE_WAIT: Duration = Duration::from_millis(100);
const MIN_CORE_WAIT: Duration = Duration::from_micros(100);

/// What the scheduler needs from the host side: byte movement and a completion hook.
pub trait HostInterface: Send + Sync {
    fn copy_from_host(&self, handle: BufferHandle, offset: usize, out: &mut [u8]);

    fn copy_to_host(&self, handle: BufferHandle, offset: usize, data: &[u8]);

    fn request_completed(&self, _req: &HostRequest) {}
}

/// Arrival order, except that a read goes in right behind the last queued read.
#[derive(Default)]
pub struct EventQueue {
    entries: VecDeque<Arc<HostRequest>>,
    reads: usize,
}

impl EventQueue {
    pub fn push(&mut self, req: Arc<HostRequest>) {
        if req.kind() == IoKind::Read {
            self.entries.insert(self.reads, req);
            self.reads += 1;
        } else {
            self.entries.push_back(req);
        }
    }

    pub fn pop(&mut self) -> Option<Arc<HostRequest>> {
        let req = self.entries.pop_front()?;
        if req.kind() == IoKind::Read {
            self.reads -= 1;
        }
        Some(req)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct WriteSlot {
    buffer: Mutex<WriteBuffer>,
    freed: Condvar,
}

struct Staging {
    ring: Mutex<RingBuffer>,
    freed: Condvar,
}

impl Staging {
    fn new(capacity: BaseType) -> Self {
        Staging { ring: Mutex::new(RingBuffer::new(capacity)), freed: Condvar::new() }
    }

    fn reserve(&self, len: BaseType) -> Slot {
        let mut ring = self.ring.lock();
        let len = len.min(ring.capacity());
        loop {
            if let Some(slot) = ring.reserve(len) {
                return slot;
            }
            self.freed.wait(&mut ring);
        }
    }

    fn release(&self, slot: Slot) {
        self.ring.lock().release(slot);
        self.freed.notify_all();
    }
}

#[derive(Default)]
struct CoreQueues {
    reads: VecDeque<CoreSubRequest>,
    writes: VecDeque<CoreSubRequest>,
    discards: VecDeque<CoreSubRequest>,
    flush: Option<Arc<HostRequest>>,
    // programs that failed after their request had already completed
    lost_writes: Option<String>,
}

impl CoreQueues {
    fn is_idle(&self) -> bool {
        self.reads.is_empty() && self.writes.is_empty() && self.discards.is_empty() && self.flush.is_none()
    }
}

struct CoreSlot {
    queues: Mutex<CoreQueues>,
    ready: Condvar,
}

enum Work {
    Reads(Vec<CoreSubRequest>),
    Discards(Vec<CoreSubRequest>, Vec<CoreSubRequest>),
    Flush(Arc<HostRequest>, Vec<CoreSubRequest>, Option<String>),
    Writes(Vec<CoreSubRequest>),
}

struct Shared {
    cfg: Arc<GeometryConfig>,
    ssd: Arc<Ssd>,
    host: Arc<dyn HostInterface>,
    seq: AtomicU64,
    events: Mutex<EventQueue>,
    event_ready: Condvar,
    write_buffers: Vec<WriteSlot>,
    read_staging: Staging,
    discard_staging: Staging,
    cores: Vec<CoreSlot>,
    stop: Shutdown,
    gc_stop: Shutdown,
}

/// Multi-core request scheduler in front of an [`Ssd`].
///
/// One intake thread moves host requests from the event queue into per-core queues, copying write data
/// into round-robin write buffers. Each worker core serves reads, then discards, then a pending flush,
/// then buffered writes that are full or have waited past the flush timeout.
pub struct IoScheduler {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
}

impl IoScheduler {
    pub fn start(ssd: Arc<Ssd>, host: Arc<dyn HostInterface>) -> Result<Self> {
        let cfg = ssd.config().clone();
        let shared = Arc::new(Shared {
            write_buffers: (0..cfg.write_buffers)
                .map(|_| WriteSlot {
                    buffer: Mutex::new(WriteBuffer::new(cfg.write_buffer_sectors, cfg.sector_size)),
                    freed: Condvar::new(),
                })
                .collect(),
            read_staging: Staging::new(cfg.read_buffer_sectors),
            discard_staging: Staging::new(cfg.discard_buffer_ranges),
            cores: (0..cfg.cores)
                .map(|_| CoreSlot { queues: Mutex::new(CoreQueues::default()), ready: Condvar::new() })
                .collect(),
            seq: AtomicU64::new(0),
            events: Mutex::new(EventQueue::default()),
            event_ready: Condvar::new(),
            stop: Shutdown::default(),
            gc_stop: Shutdown::default(),
            cfg,
            ssd,
            host,
        });

        let mut scheduler = IoScheduler { shared: shared.clone(), threads: Vec::new() };
        let intake = shared.clone();
        scheduler.spawn("intake".into(), move || intake.intake())?;
        for core in 0..shared.cfg.cores {
            let worker = shared.clone();
            scheduler.spawn(format!("core-{}", core), move || worker.worker(core))?;
        }
        if shared.cfg.background_gc {
            let gc = shared.clone();
            scheduler.spawn("bg-gc".into(), move || gc.ssd.gc().run_background(&gc.gc_stop))?;
        }
        info!(
            "scheduler up: {} cores, {} write buffers of {} sectors",
            shared.cfg.cores, shared.cfg.write_buffers, shared.cfg.write_buffer_sectors
        );
        Ok(scheduler)
    }

    fn spawn(&mut self, name: String, f: impl FnOnce() + Send + 'static) -> Result<()> {
        let handle = thread::Builder::new().name(name).spawn(f)?;
        self.threads.push(handle);
        Ok(())
    }

    pub fn ssd(&self) -> &Arc<Ssd> {
        &self.shared.ssd
    }

    fn enqueue(&self, kind: IoKind, ranges: Vec<SectorRange>, handle: BufferHandle) -> Result<Arc<HostRequest>> {
        let limit = self.shared.cfg.logical_sectors();
        for range in &ranges {
            match range.checked_end() {
                Some(end) if end <= limit => {}
                _ => {
                    error!("{:?} of {} sectors at {} beyond {}", kind, range.len, range.start, limit);
                    return Err(FtlError::InvalidAddress { what: "sector", value: range.start });
                }
            }
        }
        let req = HostRequest::new(self.shared.seq.fetch_add(1, Ordering::SeqCst), kind, ranges, handle);
        trace!("enqueue #{} {:?}", req.seq(), kind);
        self.shared.events.lock().push(req.clone());
        self.shared.event_ready.notify_one();
        Ok(req)
    }

    pub fn submit_read(&self, start: Sector, len: BaseType, handle: BufferHandle) -> Result<Arc<HostRequest>> {
        self.enqueue(IoKind::Read, vec![SectorRange::new(start, len)], handle)
    }

    pub fn submit_write(&self, start: Sector, len: BaseType, handle: BufferHandle) -> Result<Arc<HostRequest>> {
        self.enqueue(IoKind::Write, vec![SectorRange::new(start, len)], handle)
    }

    pub fn submit_discard(&self, ranges: Vec<SectorRange>) -> Result<Arc<HostRequest>> {
        self.enqueue(IoKind::Discard, ranges, 0)
    }

    /// Returns once every request submitted before it has completed on every core.
    pub fn submit_flush(&self) -> Result<Arc<HostRequest>> {
        let req = self.enqueue(IoKind::Flush, Vec::new(), 0)?;
        req.wait();
        Ok(req)
    }

    /// Submit by opcode. Unknown opcodes are dropped.
    pub fn submit_raw(&self, opcode: u8, start: Sector, len: BaseType, handle: BufferHandle) -> Result<Arc<HostRequest>> {
        let kind = IoKind::from_opcode(opcode).map_err(|err| {
            error!("dropping request: {}", err);
            err
        })?;
        match kind {
            IoKind::Read => self.submit_read(start, len, handle),
            IoKind::Write => self.submit_write(start, len, handle),
            IoKind::Discard => self.submit_discard(vec![SectorRange::new(start, len)]),
            IoKind::Flush => self.submit_flush(),
        }
    }

    /// Flush everything, stop the threads and save metadata.
    pub fn shutdown(mut self) -> Result<()> {
        let flush = self.submit_flush()?;
        if let Some(reason) = flush.failure() {
            warn!("final flush incomplete: {}", reason);
        }
        self.stop();
        self.shared.ssd.save()?;
        info!("scheduler stopped");
        Ok(())
    }

    fn stop(&mut self) {
        if self.threads.is_empty() {
            return;
        }
        self.shared.stop.signal();
        self.shared.gc_stop.signal();
        drop(self.shared.events.lock());
        self.shared.event_ready.notify_all();
        for core in &self.shared.cores {
            drop(core.queues.lock());
            core.ready.notify_one();
        }
        for handle in self.threads.drain(..) {
            let name = handle.thread().name().unwrap_or("?").to_string();
            if handle.join().is_err() {
                error!("thread {} panicked", name);
            }
        }
    }
}

impl Drop for IoScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn segments(&self, req: &HostRequest) -> Vec<Segment> {
        let mut out = Vec::new();
        let mut base = 0;
        for range in req.ranges() {
            out.extend(split_pages(*range, self.cfg.sectors_per_page, self.cfg.cores).into_iter().map(|mut seg| {
                seg.host_offset += base;
                seg
            }));
            base += range.len;
        }
        out
    }

    fn push(&self, core: CoreId, f: impl FnOnce(&mut CoreQueues)) {
        let slot = &self.cores[core];
        f(&mut slot.queues.lock());
        slot.ready.notify_one();
    }

    fn wake_cores(&self) {
        for slot in &self.cores {
            drop(slot.queues.lock());
            slot.ready.notify_one();
        }
    }

    fn finish(&self, req: &HostRequest) {
        self.host.request_completed(req);
        if let Some(slot) = req.complete() {
            self.discard_staging.release(slot);
        }
        trace!("request #{} {:?} completed", req.seq(), req.kind());
    }

    fn child_done(&self, req: &HostRequest, trimmed: usize, failure: Option<&FtlError>) {
        if req.child_done(trimmed, failure) {
            self.finish(req);
        }
    }

    fn intake(&self) {
        let mut current = 0;
        loop {
            let req = {
                let mut events = self.events.lock();
                loop {
                    if let Some(req) = events.pop() {
                        break req;
                    }
                    if self.stop.is_set() {
                        debug!("intake stopping");
                        return;
                    }
                    self.event_ready.wait_for(&mut events, INTAKE_IDLE_WAIT);
                }
            };
            match req.kind() {
                IoKind::Read => self.dispatch_read(req),
                IoKind::Write => self.dispatch_write(req, &mut current),
                IoKind::Discard => self.dispatch_discard(req),
                IoKind::Flush => self.dispatch_flush(req),
            }
        }
    }

    fn dispatch_read(&self, req: Arc<HostRequest>) {
        let segments = self.segments(&req);
        if req.dispatch(segments.len()) {
            self.finish(&req);
            return;
        }
        for seg in segments {
            let sub = CoreSubRequest::new(req.clone(), seg);
            self.push(seg.core, |q| q.reads.push_back(sub));
        }
    }

    /// Writes complete as soon as their data sits in a write buffer.
    fn dispatch_write(&self, req: Arc<HostRequest>, current: &mut usize) {
        let ss = self.cfg.sector_size;
        for seg in self.segments(&req) {
            let mut bytes = vec![0; seg.count * ss];
            self.host.copy_from_host(req.handle(), seg.host_offset * ss, &mut bytes);
            let at = self.stage(&bytes, current);
            let sub = CoreSubRequest { parent: req.clone(), segment: seg, staged: Some(at) };
            self.push(seg.core, |q| q.writes.push_back(sub));
        }
        req.dispatch(0);
        self.finish(&req);
    }

    /// Copy one page segment into the current write buffer, moving on round-robin when it is full.
    fn stage(&self, bytes: &[u8], current: &mut usize) -> BufferRef {
        loop {
            let slot = &self.write_buffers[*current];
            let mut buf = slot.buffer.lock();
            if buf.is_full() {
                trace!("write buffer {} full, intake waiting", current);
                slot.freed.wait_for(&mut buf, self.cfg.flush_timeout);
                continue;
            }
            let appended = buf.append(bytes);
            if appended.is_none() {
                buf.seal();
            }
            let sealed = buf.is_full();
            drop(buf);

            let index = *current;
            if sealed {
                *current = (*current + 1) % self.write_buffers.len();
                self.wake_cores();
            }
            if let Some(offset) = appended {
                return BufferRef { buffer: index, offset };
            }
        }
    }

    fn dispatch_discard(&self, req: Arc<HostRequest>) {
        let slot = self.discard_staging.reserve(req.ranges().len());
        req.set_staging(slot);
        let segments = self.segments(&req);
        if req.dispatch(segments.len()) {
            self.finish(&req);
            return;
        }
        for seg in segments {
            let sub = CoreSubRequest::new(req.clone(), seg);
            self.push(seg.core, |q| q.discards.push_back(sub));
        }
    }

    /// Everything queued ahead of the flush has been dispatched by now; wait for every core to catch up.
    fn dispatch_flush(&self, req: Arc<HostRequest>) {
        debug!("flush #{} on {} cores", req.seq(), self.cores.len());
        req.dispatch(self.cores.len());
        for core in 0..self.cores.len() {
            self.push(core, |q| q.flush = Some(req.clone()));
        }
        req.wait();
    }

    fn worker(&self, core: CoreId) {
        let slot = &self.cores[core];
        debug!("core {} running", core);
        loop {
            let work = {
                let mut q = slot.queues.lock();
                loop {
                    if let Some(work) = self.next_work(&mut q) {
                        break work;
                    }
                    if self.stop.is_set() && q.is_idle() {
                        debug!("core {} stopping", core);
                        return;
                    }
                    let wait = self.next_deadline(&q);
                    slot.ready.wait_for(&mut q, wait);
                }
            };
            match work {
                Work::Reads(subs) => self.serve_reads(core, subs),
                Work::Discards(subs, earlier) => self.serve_discards(core, subs, earlier),
                Work::Flush(req, writes, lost) => self.serve_flush(core, req, writes, lost),
                Work::Writes(writes) => {
                    if let Err(err) = self.drain_writes(core, writes) {
                        self.note_lost(core, &err);
                    }
                }
            }
        }
    }

    fn buffer_due(&self, buffer: usize, now: Instant) -> bool {
        let buf = self.write_buffers[buffer].buffer.lock();
        buf.is_full() || now.duration_since(buf.idle_since()) >= self.cfg.flush_timeout
    }

    /// Fixed priority: reads, discards, flush, then due write buffers.
    fn next_work(&self, q: &mut CoreQueues) -> Option<Work> {
        if !q.reads.is_empty() {
            return Some(Work::Reads(q.reads.drain(..).collect()));
        }
        if let Some(last) = q.discards.back().map(|d| d.seq()) {
            // writes queued before the discard must land first or they would bring the data back
            let n = q.writes.iter().take_while(|w| w.seq() < last).count();
            let earlier = q.writes.drain(..n).collect();
            return Some(Work::Discards(q.discards.drain(..).collect(), earlier));
        }
        if let Some(req) = q.flush.take() {
            return Some(Work::Flush(req, q.writes.drain(..).collect(), q.lost_writes.take()));
        }
        // drain up to the newest write sitting in a due buffer, keeping per-page order
        let now = Instant::now();
        let mut due: HashMap<usize, bool> = HashMap::new();
        let last_due = q.writes.iter().rposition(|w| match w.staged {
            Some(at) => *due.entry(at.buffer).or_insert_with(|| self.buffer_due(at.buffer, now)),
            None => true,
        })?;
        Some(Work::Writes(q.writes.drain(..=last_due).collect()))
    }

    fn next_deadline(&self, q: &CoreQueues) -> Duration {
        let now = Instant::now();
        let mut wait = self.cfg.flush_timeout;
        for w in &q.writes {
            if let Some(at) = w.staged {
                let since = self.write_buffers[at.buffer].buffer.lock().idle_since();
                let left = self.cfg.flush_timeout.saturating_sub(now.duration_since(since));
                wait = wait.min(left);
            }
        }
        wait.max(MIN_CORE_WAIT)
    }

    /// Lay still-buffered writes for `lpn` over `page`, oldest first. True if any did.
    fn overlay(&self, core: CoreId, lpn: Lpn, page: &mut [u8]) -> bool {
        let ss = self.cfg.sector_size;
        let q = self.cores[core].queues.lock();
        let mut hit = false;
        for w in q.writes.iter().filter(|w| w.segment.lpn == lpn) {
            let Some(at) = w.staged else { continue };
            let buf = self.write_buffers[at.buffer].buffer.lock();
            let start = w.segment.sector * ss;
            page[start..start + w.segment.count * ss].copy_from_slice(buf.sectors(at.offset, w.segment.count));
            hit = true;
        }
        hit
    }

    fn serve_reads(&self, core: CoreId, subs: Vec<CoreSubRequest>) {
        let ss = self.cfg.sector_size;
        let lpns: Vec<Lpn> = subs.iter().map(|s| s.segment.lpn).collect();
        let pages = match self.ssd.read_pages(core, &lpns) {
            Ok(pages) => pages,
            Err(err) => {
                error!("core {}: read failed: {}", core, err);
                for sub in subs {
                    self.child_done(&sub.parent, 0, Some(&err));
                }
                return;
            }
        };
        for (sub, page) in subs.into_iter().zip(pages) {
            let seg = sub.segment;
            let slot = self.read_staging.reserve(seg.count);
            let mut trimmed = page.is_none();
            let mut data = page.unwrap_or_else(|| vec![0; self.cfg.page_bytes()].into_boxed_slice());
            if self.overlay(core, seg.lpn, &mut data) {
                trimmed = false;
            }
            let bytes = &data[seg.sector * ss..(seg.sector + seg.count) * ss];
            self.host.copy_to_host(sub.parent.handle(), seg.host_offset * ss, bytes);
            self.read_staging.release(slot);
            self.child_done(&sub.parent, trimmed as usize, None);
        }
    }

    /// Program buffered writes and hand their buffer space back.
    fn drain_writes(&self, core: CoreId, subs: Vec<CoreSubRequest>) -> Result<()> {
        if subs.is_empty() {
            return Ok(());
        }
        let copies: Vec<(Segment, Vec<u8>)> = subs
            .iter()
            .filter_map(|sub| {
                let at = sub.staged?;
                let buf = self.write_buffers[at.buffer].buffer.lock();
                Some((sub.segment, buf.sectors(at.offset, sub.segment.count).to_vec()))
            })
            .collect();
        let writes: Vec<PageWrite> = copies
            .iter()
            .map(|(seg, data)| PageWrite { lpn: seg.lpn, sector: seg.sector, data })
            .collect();
        trace!("core {} draining {} buffered segments", core, writes.len());
        let result = self.ssd.write_pages(core, &writes);

        for sub in &subs {
            let Some(at) = sub.staged else { continue };
            let slot = &self.write_buffers[at.buffer];
            if slot.buffer.lock().drain(sub.segment.count) {
                slot.freed.notify_all();
            }
        }
        if let Err(err) = &result {
            error!("core {}: lost {} buffered segments: {}", core, subs.len(), err);
        }
        result
    }

    /// Remembered until the next flush, which reports it.
    fn note_lost(&self, core: CoreId, err: &FtlError) {
        let mut q = self.cores[core].queues.lock();
        if q.lost_writes.is_none() {
            q.lost_writes = Some(err.to_string());
        }
    }

    fn serve_discards(&self, core: CoreId, subs: Vec<CoreSubRequest>, earlier: Vec<CoreSubRequest>) {
        if let Err(err) = self.drain_writes(core, earlier) {
            self.note_lost(core, &err);
        }
        let spp = self.cfg.sectors_per_page;
        let lpns: Vec<Lpn> = subs.iter().filter(|s| s.segment.full_page(spp)).map(|s| s.segment.lpn).collect();
        let result = self.ssd.discard(&lpns);
        if let Err(err) = &result {
            error!("core {}: discard failed: {}", core, err);
        }
        for sub in subs {
            self.child_done(&sub.parent, 0, result.as_ref().err());
        }
    }

    fn serve_flush(&self, core: CoreId, req: Arc<HostRequest>, writes: Vec<CoreSubRequest>, lost: Option<String>) {
        let result = self.drain_writes(core, writes);
        if let Some(reason) = lost {
            req.fail(reason);
        }
        trace!("core {} acknowledges flush #{}", core, req.seq());
        self.child_done(&req, 0, result.as_ref().err());
    }
}
