use std::sync::Arc;
use std::time::Duration;

use num_integer::Integer;
use parking_lot::{Condvar, Mutex};

use crate::buffer::Slot;
use crate::config::{BaseType, CoreId, Lpn, Sector};
use crate::error::{FtlError, Result};

/// Host-side buffer a request reads from or writes into.
pub type BufferHandle = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoKind {
    Read,
    Write,
    Discard,
    Flush,
}

impl IoKind {
    pub const OP_READ: u8 = 1;
    pub const OP_WRITE: u8 = 2;
    pub const OP_DISCARD: u8 = 3;
    pub const OP_FLUSH: u8 = 4;

    pub fn from_opcode(op: u8) -> Result<Self> {
        match op {
            Self::OP_READ => Ok(IoKind::Read),
            Self::OP_WRITE => Ok(IoKind::Write),
            Self::OP_DISCARD => Ok(IoKind::Discard),
            Self::OP_FLUSH => Ok(IoKind::Flush),
            _ => Err(FtlError::QueueProtocolError(op)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestState {
    Queued,
    WaitChild,
    Completed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SectorRange {
    pub start: Sector,
    pub len: BaseType,
}

impl SectorRange {
    pub fn new(start: Sector, len: BaseType) -> Self {
        SectorRange { start, len }
    }

    /// One past the last sector. `None` when that would not fit in a sector number.
    pub fn checked_end(&self) -> Option<Sector> {
        self.start.checked_add(self.len as Sector)
    }

    /// Only for ranges already bounds-checked with [`SectorRange::checked_end`].
    pub fn end(&self) -> Sector {
        self.start.saturating_add(self.len as Sector)
    }
}

struct Progress {
    state: RequestState,
    n_child: usize,
    n_completed: usize,
    n_trimmed: usize,
    failure: Option<String>,
    staging: Option<Slot>,
}

/// One host command from arrival to completion.
pub struct HostRequest {
    seq: u64,
    kind: IoKind,
    ranges: Vec<SectorRange>,
    handle: BufferHandle,
    progress: Mutex<Progress>,
    done: Condvar,
}

impl HostRequest {
    pub fn new(seq: u64, kind: IoKind, ranges: Vec<SectorRange>, handle: BufferHandle) -> Arc<Self> {
        Arc::new(HostRequest {
            seq,
            kind,
            ranges,
            handle,
            progress: Mutex::new(Progress {
                state: RequestState::Queued,
                n_child: 0,
                n_completed: 0,
                n_trimmed: 0,
                failure: None,
                staging: None,
            }),
            done: Condvar::new(),
        })
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn kind(&self) -> IoKind {
        self.kind
    }

    pub fn ranges(&self) -> &[SectorRange] {
        &self.ranges
    }

    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    pub fn sectors(&self) -> BaseType {
        self.ranges.iter().map(|r| r.len).sum()
    }

    pub fn state(&self) -> RequestState {
        self.progress.lock().state
    }

    pub fn is_completed(&self) -> bool {
        self.state() == RequestState::Completed
    }

    /// Pages that read back as never written.
    pub fn trimmed(&self) -> usize {
        self.progress.lock().n_trimmed
    }

    pub fn failure(&self) -> Option<String> {
        self.progress.lock().failure.clone()
    }

    pub(crate) fn set_staging(&self, slot: Slot) {
        self.progress.lock().staging = Some(slot);
    }

    /// Fan out into `n` children. Returns true if there is nothing to wait for.
    pub(crate) fn dispatch(&self, n: usize) -> bool {
        let mut p = self.progress.lock();
        p.n_child = n;
        p.state = RequestState::WaitChild;
        n == 0 || p.n_completed >= n
    }

    /// Account one finished child. Returns true for the call that completed the request.
    pub(crate) fn child_done(&self, trimmed: usize, failure: Option<&FtlError>) -> bool {
        let mut p = self.progress.lock();
        p.n_completed += 1;
        p.n_trimmed += trimmed;
        if let (Some(err), None) = (failure, &p.failure) {
            p.failure = Some(err.to_string());
        }
        p.state == RequestState::WaitChild && p.n_completed == p.n_child
    }

    pub(crate) fn fail(&self, reason: String) {
        let mut p = self.progress.lock();
        if p.failure.is_none() {
            p.failure = Some(reason);
        }
    }

    /// Mark completed and wake waiters. Hands back the staging slot to release.
    pub(crate) fn complete(&self) -> Option<Slot> {
        let mut p = self.progress.lock();
        p.state = RequestState::Completed;
        let slot = p.staging.take();
        self.done.notify_all();
        slot
    }

    pub fn wait(&self) {
        let mut p = self.progress.lock();
        while p.state != RequestState::Completed {
            self.done.wait(&mut p);
        }
    }

    /// False if still running after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut p = self.progress.lock();
        if p.state != RequestState::Completed {
            self.done.wait_for(&mut p, timeout);
        }
        p.state == RequestState::Completed
    }
}

/// Sectors of one logical page touched by a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Segment {
    pub lpn: Lpn,
    pub core: CoreId,
    /// first sector inside the page
    pub sector: BaseType,
    pub count: BaseType,
    /// sector offset inside the request's host buffer
    pub host_offset: BaseType,
}

impl Segment {
    pub fn full_page(&self, sectors_per_page: BaseType) -> bool {
        self.sector == 0 && self.count == sectors_per_page
    }
}

/// Split a sector range at page boundaries. Page `lpn` belongs to core `lpn % cores`.
pub fn split_pages(range: SectorRange, sectors_per_page: BaseType, cores: BaseType) -> Vec<Segment> {
    let mut out = Vec::new();
    let mut sector = range.start;
    let mut host_offset = 0;
    while sector < range.end() {
        let (lpn, in_page) = sector.div_rem(&(sectors_per_page as Sector));
        let count = (sectors_per_page - in_page as BaseType).min((range.end() - sector) as BaseType);
        out.push(Segment {
            lpn,
            core: (lpn % cores as Lpn) as CoreId,
            sector: in_page as BaseType,
            count,
            host_offset,
        });
        sector += count as Sector;
        host_offset += count;
    }
    out
}

/// Where a buffered write's sectors sit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferRef {
    pub buffer: usize,
    pub offset: BaseType,
}

/// A request's share of work on one core.
#[derive(Clone)]
pub struct CoreSubRequest {
    pub parent: Arc<HostRequest>,
    pub segment: Segment,
    /// set for writes once copied into a write buffer
    pub staged: Option<BufferRef>,
}

impl CoreSubRequest {
    pub fn new(parent: Arc<HostRequest>, segment: Segment) -> Self {
        CoreSubRequest { parent, segment, staged: None }
    }

    pub fn seq(&self) -> u64 {
        self.parent.seq()
    }
}
