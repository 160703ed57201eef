//! Linux kernel backend
//!
//! Thin wrappers over the raw `bpf(2)` and `perf_event_open(2)`
//! syscalls; no loader library involved. The uapi structs are declared
//! locally with `#[repr(C)]` and passed straight to `libc::syscall`,
//! and every kernel object is held as an `OwnedFd` so drop order is
//! teardown order.
//!
//! The reader maps one perf ring per online CPU, registers each ring's
//! fd into the perf event array, and multiplexes them with `poll(2)`.
//! A self-pipe is polled alongside the rings so `close()` can unblock
//! a pending read from any thread; the closed flag makes it
//! idempotent.

use std::collections::VecDeque;
use std::ffi::CString;
use std::fs;
use std::io;
use std::mem;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::sync::atomic::{fence, AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::resource::{setrlimit, Resource, RLIM_INFINITY};
use tracing::{debug, trace};

use crate::buffer::{EventBuffer, ReadError};
use crate::engine::{
    Attachment, EventMap, HookSpec, KernelBackend, LoadedProgram, ProgramKind, ProgramSpec,
    SetupError,
};

// bpf(2) commands.
const BPF_MAP_CREATE: libc::c_int = 0;
const BPF_MAP_UPDATE_ELEM: libc::c_int = 2;
const BPF_PROG_LOAD: libc::c_int = 5;
const BPF_RAW_TRACEPOINT_OPEN: libc::c_int = 17;

const BPF_MAP_TYPE_PERF_EVENT_ARRAY: u32 = 4;
const BPF_PROG_TYPE_KPROBE: u32 = 2;
const BPF_PROG_TYPE_RAW_TRACEPOINT: u32 = 17;
const BPF_ANY: u64 = 0;

// perf_event_open(2) constants.
const PERF_TYPE_SOFTWARE: u32 = 1;
const PERF_COUNT_SW_BPF_OUTPUT: u64 = 10;
const PERF_SAMPLE_RAW: u64 = 1 << 10;
const PERF_FLAG_FD_CLOEXEC: libc::c_ulong = 1 << 3;
const PERF_ATTR_FLAG_DISABLED: u64 = 1 << 0;

const PERF_EVENT_IOC_ENABLE: libc::c_ulong = 0x2400;
const PERF_EVENT_IOC_SET_BPF: libc::c_ulong = 0x4004_2408;

// perf ring record types.
const PERF_RECORD_LOST: u32 = 2;
const PERF_RECORD_SAMPLE: u32 = 9;

const VERIFIER_LOG_SIZE: usize = 64 * 1024;

/// perf_event_attr, subset of the uapi struct this backend fills in.
#[repr(C)]
#[derive(Debug, Default)]
#[allow(dead_code)]
struct PerfEventAttr {
    type_: u32,
    size: u32,
    config: u64,
    sample_period: u64,
    sample_type: u64,
    read_format: u64,
    flags: u64,
    wakeup_events: u32,
    bp_type: u32,
    config1: u64,
    config2: u64,
    branch_sample_type: u64,
    sample_regs_user: u64,
    sample_stack_user: u32,
    clockid: i32,
    sample_regs_intr: u64,
    aux_watermark: u32,
    sample_max_stack: u16,
    __reserved_2: u16,
    aux_sample_size: u32,
    __reserved_3: u32,
}

/// First page of a perf ring mapping (uapi perf_event_mmap_page).
/// Only the data_* fields are touched; the reserved block keeps the
/// offsets in line with the kernel's layout.
#[repr(C)]
#[allow(dead_code)]
struct PerfMmapPage {
    version: u32,
    compat_version: u32,
    lock: u32,
    index: u32,
    offset: i64,
    time_enabled: u64,
    time_running: u64,
    capabilities: u64,
    pmc_width: u16,
    time_shift: u16,
    time_mult: u32,
    time_offset: u64,
    time_zero: u64,
    size: u32,
    __reserved_1: u32,
    time_cycles: u64,
    time_mask: u64,
    __reserved: [u8; 116 * 8],
    data_head: u64,
    data_tail: u64,
    data_offset: u64,
    data_size: u64,
}

#[repr(C)]
#[allow(dead_code)]
struct PerfEventHeader {
    type_: u32,
    misc: u16,
    size: u16,
}

// bpf_attr variants, one struct per command.

#[repr(C)]
#[derive(Default)]
#[allow(dead_code)]
struct BpfMapCreateAttr {
    map_type: u32,
    key_size: u32,
    value_size: u32,
    max_entries: u32,
    map_flags: u32,
}

#[repr(C)]
#[derive(Default)]
#[allow(dead_code)]
struct BpfProgLoadAttr {
    prog_type: u32,
    insn_cnt: u32,
    insns: u64,
    license: u64,
    log_level: u32,
    log_size: u32,
    log_buf: u64,
    kern_version: u32,
    prog_flags: u32,
}

#[repr(C)]
#[derive(Default)]
#[allow(dead_code)]
struct BpfMapUpdateAttr {
    map_fd: u32,
    _pad: u32,
    key: u64,
    value: u64,
    flags: u64,
}

#[repr(C)]
#[derive(Default)]
#[allow(dead_code)]
struct BpfRawTracepointAttr {
    name: u64,
    prog_fd: u32,
    _pad: u32,
}

/// Issue one bpf(2) call; returns the new fd (or 0 for non-fd
/// commands).
fn sys_bpf<T>(cmd: libc::c_int, attr: &mut T) -> io::Result<RawFd> {
    // SAFETY: attr is a valid repr(C) bpf_attr prefix for cmd; the
    // kernel reads at most size bytes.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_bpf,
            cmd,
            attr as *mut T as *mut libc::c_void,
            mem::size_of::<T>() as u32,
        )
    };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as RawFd)
    }
}

fn online_cpus() -> usize {
    // SAFETY: plain sysconf query.
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n < 1 {
        1
    } else {
        n as usize
    }
}

fn page_size() -> usize {
    // SAFETY: plain sysconf query.
    let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if n < 1 {
        4096
    } else {
        n as usize
    }
}

/// Kernel backend speaking the raw syscall interface.
#[derive(Debug, Default)]
pub struct LinuxBackend;

impl LinuxBackend {
    pub fn new() -> Self {
        LinuxBackend
    }
}

struct PerfEventArray {
    fd: OwnedFd,
}

impl EventMap for PerfEventArray {
    fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

struct BpfProgram {
    fd: OwnedFd,
}

impl LoadedProgram for BpfProgram {
    fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Raw tracepoint link; closing the fd detaches.
struct RawTracepointLink {
    _fd: OwnedFd,
}

impl Attachment for RawTracepointLink {}

/// Kprobe link via the kprobe dynamic PMU; closing the perf fd
/// removes the probe.
struct KprobeLink {
    _fd: OwnedFd,
}

impl Attachment for KprobeLink {}

impl KernelBackend for LinuxBackend {
    fn relax_memlock(&self) -> Result<(), SetupError> {
        setrlimit(Resource::RLIMIT_MEMLOCK, RLIM_INFINITY, RLIM_INFINITY)
            .map_err(|e| SetupError::MemlockLimit(io::Error::from(e)))
    }

    fn create_event_map(&self) -> Result<Box<dyn EventMap>, SetupError> {
        let mut attr = BpfMapCreateAttr {
            map_type: BPF_MAP_TYPE_PERF_EVENT_ARRAY,
            key_size: 4,
            value_size: 4,
            max_entries: online_cpus() as u32,
            map_flags: 0,
        };
        let fd = sys_bpf(BPF_MAP_CREATE, &mut attr).map_err(SetupError::MapCreate)?;
        // SAFETY: fd was just returned by the kernel and is owned here.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Box::new(PerfEventArray { fd }))
    }

    fn load_program(&self, spec: &ProgramSpec) -> Result<Box<dyn LoadedProgram>, SetupError> {
        let prog_type = match spec.kind {
            ProgramKind::RawTracepoint => BPF_PROG_TYPE_RAW_TRACEPOINT,
            ProgramKind::Kprobe => BPF_PROG_TYPE_KPROBE,
        };
        let image = spec.program.to_bytes();
        let license = CString::new(spec.license.as_str())
            .map_err(|_| SetupError::Verification("license contains NUL".into()))?;

        let mut attr = BpfProgLoadAttr {
            prog_type,
            insn_cnt: spec.program.len() as u32,
            insns: image.as_ptr() as u64,
            license: license.as_ptr() as u64,
            ..Default::default()
        };

        match sys_bpf(BPF_PROG_LOAD, &mut attr) {
            // SAFETY: fresh fd owned here.
            Ok(fd) => Ok(Box::new(BpfProgram {
                fd: unsafe { OwnedFd::from_raw_fd(fd) },
            })),
            Err(first_err) => {
                // Retry with the verifier log enabled so a rejection
                // carries the actual diagnostic.
                let mut log = vec![0u8; VERIFIER_LOG_SIZE];
                attr.log_level = 1;
                attr.log_size = log.len() as u32;
                attr.log_buf = log.as_mut_ptr() as u64;
                match sys_bpf(BPF_PROG_LOAD, &mut attr) {
                    Ok(fd) => Ok(Box::new(BpfProgram {
                        // SAFETY: fresh fd owned here.
                        fd: unsafe { OwnedFd::from_raw_fd(fd) },
                    })),
                    Err(_) => {
                        let end = log.iter().position(|&b| b == 0).unwrap_or(log.len());
                        let text = String::from_utf8_lossy(&log[..end]).trim().to_owned();
                        if text.is_empty() {
                            Err(SetupError::ProgramLoad(first_err))
                        } else {
                            Err(SetupError::Verification(text))
                        }
                    }
                }
            }
        }
    }

    fn open_reader(
        &self,
        map: &dyn EventMap,
        pages: usize,
    ) -> Result<Arc<dyn EventBuffer>, SetupError> {
        let reader = PerfReader::open(map.fd(), pages).map_err(SetupError::ReaderOpen)?;
        Ok(Arc::new(reader))
    }

    fn attach(
        &self,
        program: &dyn LoadedProgram,
        hook: &HookSpec,
    ) -> Result<Box<dyn Attachment>, SetupError> {
        let attach_err = |source: io::Error| SetupError::Attach {
            hook: hook.name().to_owned(),
            source,
        };
        match hook {
            HookSpec::RawTracepoint { name } => {
                let name = CString::new(name.as_str())
                    .map_err(|_| attach_err(io::Error::other("hook name contains NUL")))?;
                let mut attr = BpfRawTracepointAttr {
                    name: name.as_ptr() as u64,
                    prog_fd: program.fd() as u32,
                    _pad: 0,
                };
                let fd = sys_bpf(BPF_RAW_TRACEPOINT_OPEN, &mut attr).map_err(attach_err)?;
                Ok(Box::new(RawTracepointLink {
                    // SAFETY: fresh fd owned here.
                    _fd: unsafe { OwnedFd::from_raw_fd(fd) },
                }))
            }
            HookSpec::Kprobe { symbol } => {
                let fd = attach_kprobe(program.fd(), symbol).map_err(attach_err)?;
                Ok(Box::new(KprobeLink { _fd: fd }))
            }
        }
    }
}

/// Attach via the kprobe dynamic PMU: perf_event_open with the PMU
/// type from sysfs and the symbol in config1, then bind the program.
fn attach_kprobe(prog_fd: RawFd, symbol: &str) -> io::Result<OwnedFd> {
    let pmu_type: u32 = fs::read_to_string("/sys/bus/event_source/devices/kprobe/type")?
        .trim()
        .parse()
        .map_err(|e| io::Error::other(format!("bad kprobe PMU type: {e}")))?;

    let symbol = CString::new(symbol).map_err(|_| io::Error::other("symbol contains NUL"))?;
    let mut attr = PerfEventAttr {
        type_: pmu_type,
        size: mem::size_of::<PerfEventAttr>() as u32,
        config1: symbol.as_ptr() as u64,
        ..Default::default()
    };

    // SAFETY: attr is valid for the duration of the call; symbol
    // outlives it.
    let fd = unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            &mut attr as *mut PerfEventAttr,
            -1i32, // all processes
            0i32,  // cpu 0; kprobes fire regardless of cpu
            -1i32, // no group
            PERF_FLAG_FD_CLOEXEC,
        )
    } as RawFd;
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fresh fd owned here.
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    // SAFETY: ioctls on a valid perf fd.
    unsafe {
        if libc::ioctl(fd.as_raw_fd(), PERF_EVENT_IOC_SET_BPF, prog_fd) < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::ioctl(fd.as_raw_fd(), PERF_EVENT_IOC_ENABLE, 0) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(fd)
}

/// One mmapped perf ring bound to a single CPU.
struct CpuRing {
    fd: OwnedFd,
    base: *mut u8,
    mmap_len: usize,
    data_size: usize,
    page_size: usize,
}

// The mapping is only touched while the reader's mutex is held.
unsafe impl Send for CpuRing {}

impl CpuRing {
    fn open(map_fd: RawFd, cpu: usize, pages: usize, page_size: usize) -> io::Result<CpuRing> {
        let mut attr = PerfEventAttr {
            type_: PERF_TYPE_SOFTWARE,
            size: mem::size_of::<PerfEventAttr>() as u32,
            config: PERF_COUNT_SW_BPF_OUTPUT,
            sample_type: PERF_SAMPLE_RAW,
            flags: PERF_ATTR_FLAG_DISABLED,
            wakeup_events: 1,
            ..Default::default()
        };

        // SAFETY: attr is a valid perf_event_attr.
        let fd = unsafe {
            libc::syscall(
                libc::SYS_perf_event_open,
                &mut attr as *mut PerfEventAttr,
                -1i32, // all processes
                cpu as i32,
                -1i32, // no group
                PERF_FLAG_FD_CLOEXEC,
            )
        } as RawFd;
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fresh fd owned here.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let mmap_len = (1 + pages) * page_size;
        // SAFETY: anonymous shared mapping of the perf fd; length is a
        // page multiple as the kernel requires.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mmap_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let ring = CpuRing {
            fd,
            base: base as *mut u8,
            mmap_len,
            data_size: pages * page_size,
            page_size,
        };

        // Route this CPU's records into our ring.
        let key = cpu as u32;
        let value = ring.fd.as_raw_fd() as u32;
        let mut update = BpfMapUpdateAttr {
            map_fd: map_fd as u32,
            _pad: 0,
            key: &key as *const u32 as u64,
            value: &value as *const u32 as u64,
            flags: BPF_ANY,
        };
        sys_bpf(BPF_MAP_UPDATE_ELEM, &mut update)?;

        // SAFETY: ioctl on a valid perf fd.
        let rc = unsafe { libc::ioctl(ring.fd.as_raw_fd(), PERF_EVENT_IOC_ENABLE, 0) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ring)
    }

    /// Drain every complete record currently in the ring.
    fn drain(&mut self, out: &mut VecDeque<Vec<u8>>) -> u64 {
        let page = self.base as *mut PerfMmapPage;
        let mut lost = 0u64;

        // SAFETY: page points at the mmapped control page; head/tail
        // are updated with volatile accesses paired with fences, the
        // kernel's publication protocol for the ring.
        unsafe {
            let head = ptr::read_volatile(ptr::addr_of!((*page).data_head));
            fence(Ordering::Acquire);
            let mut tail = ptr::read_volatile(ptr::addr_of!((*page).data_tail));

            while tail < head {
                let mut header_bytes = [0u8; mem::size_of::<PerfEventHeader>()];
                self.copy_out(tail, &mut header_bytes);
                let header: PerfEventHeader = mem::transmute(header_bytes);

                match header.type_ {
                    PERF_RECORD_SAMPLE => {
                        // header, u32 payload size, payload (8-aligned).
                        let mut size_bytes = [0u8; 4];
                        self.copy_out(tail + 8, &mut size_bytes);
                        let payload = u32::from_le_bytes(size_bytes) as usize;
                        let mut record = vec![0u8; payload];
                        self.copy_out(tail + 12, &mut record);
                        out.push_back(record);
                    }
                    PERF_RECORD_LOST => {
                        // u64 id, u64 lost count after the header.
                        let mut count_bytes = [0u8; 8];
                        self.copy_out(tail + 16, &mut count_bytes);
                        lost += u64::from_le_bytes(count_bytes);
                    }
                    other => {
                        trace!(record_type = other, "skipping unhandled perf record");
                    }
                }
                tail += u64::from(header.size);
            }

            fence(Ordering::Release);
            ptr::write_volatile(ptr::addr_of_mut!((*page).data_tail), tail);
        }
        lost
    }

    /// Copy `dst.len()` bytes starting at ring offset `offset`,
    /// handling wrap-around at the data-area boundary.
    unsafe fn copy_out(&self, offset: u64, dst: &mut [u8]) {
        let data = self.base.add(self.page_size);
        let mask = self.data_size - 1;
        for (i, byte) in dst.iter_mut().enumerate() {
            *byte = ptr::read(data.add((offset as usize + i) & mask));
        }
    }
}

impl Drop for CpuRing {
    fn drop(&mut self) {
        // SAFETY: base/mmap_len came from a successful mmap.
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.mmap_len);
        }
    }
}

struct ReaderInner {
    rings: Vec<CpuRing>,
    pending: VecDeque<Vec<u8>>,
    wake_rx: OwnedFd,
}

/// User-space read side of the perf event array.
pub struct PerfReader {
    inner: Mutex<ReaderInner>,
    closed: AtomicBool,
    wake_tx: OwnedFd,
}

impl std::fmt::Debug for PerfReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerfReader")
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl PerfReader {
    /// Open one ring per online CPU with `pages` data pages each.
    pub fn open(map_fd: RawFd, pages: usize) -> io::Result<PerfReader> {
        if pages == 0 || !pages.is_power_of_two() {
            return Err(io::Error::other("ring pages must be a power of two"));
        }

        let page_size = page_size();
        let cpus = online_cpus();
        let mut rings = Vec::with_capacity(cpus);
        for cpu in 0..cpus {
            rings.push(CpuRing::open(map_fd, cpu, pages, page_size)?);
        }
        debug!(cpus, pages, "perf rings mapped");

        let mut pipe_fds = [0 as libc::c_int; 2];
        // SAFETY: pipe2 fills the two fds on success.
        let rc = unsafe { libc::pipe2(pipe_fds.as_mut_ptr(), libc::O_CLOEXEC) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: both fds were just created and are owned here.
        let (wake_rx, wake_tx) = unsafe {
            (
                OwnedFd::from_raw_fd(pipe_fds[0]),
                OwnedFd::from_raw_fd(pipe_fds[1]),
            )
        };

        Ok(PerfReader {
            inner: Mutex::new(ReaderInner {
                rings,
                pending: VecDeque::new(),
                wake_rx,
            }),
            closed: AtomicBool::new(false),
            wake_tx,
        })
    }
}

impl EventBuffer for PerfReader {
    fn read(&self) -> Result<Vec<u8>, ReadError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| ReadError::Fault(io::Error::other("reader poisoned")))?;

        loop {
            if let Some(record) = inner.pending.pop_front() {
                return Ok(record);
            }
            if self.closed.load(Ordering::SeqCst) {
                return Err(ReadError::Closed);
            }

            let inner = &mut *inner;
            let mut fds: Vec<PollFd> = inner
                .rings
                .iter()
                .map(|ring| PollFd::new(ring.fd.as_fd(), PollFlags::POLLIN))
                .collect();
            fds.push(PollFd::new(inner.wake_rx.as_fd(), PollFlags::POLLIN));

            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(nix::errno::Errno::EINTR) => continue,
                Err(err) => return Err(ReadError::Fault(io::Error::from(err))),
            }
            drop(fds);

            let mut lost = 0u64;
            for ring in &mut inner.rings {
                lost += ring.drain(&mut inner.pending);
            }
            if lost > 0 {
                // Surfaced as a transient fault; the consumer logs it
                // and keeps reading. Drained records stay pending.
                return Err(ReadError::Fault(io::Error::other(format!(
                    "kernel dropped {lost} records"
                ))));
            }
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Wake a blocked poll; one byte is enough, the flag is
        // authoritative.
        // SAFETY: write to our own pipe fd.
        unsafe {
            libc::write(self.wake_tx.as_raw_fd(), b"x".as_ptr().cast(), 1);
        }
    }
}
