//! Kernel engine contract
//!
//! The in-kernel verifier/interpreter, the perf buffer plumbing and
//! hook attachment are external collaborators. This module pins their
//! contracts behind traits so the lifecycle manager and the tests
//! never need a live kernel; `linux.rs` provides the real backend.

use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;

use thiserror::Error;

use crate::asm::Program;
use crate::buffer::EventBuffer;

/// Program category declared to the engine at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramKind {
    RawTracepoint,
    Kprobe,
}

/// Where to bind the loaded program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookSpec {
    /// A named raw tracepoint hook category, e.g. `sys_enter`.
    RawTracepoint { name: String },
    /// A named kernel function for probe-style attachment.
    Kprobe { symbol: String },
}

impl HookSpec {
    pub fn kind(&self) -> ProgramKind {
        match self {
            HookSpec::RawTracepoint { .. } => ProgramKind::RawTracepoint,
            HookSpec::Kprobe { .. } => ProgramKind::Kprobe,
        }
    }

    /// Hook name as shown in diagnostics.
    pub fn name(&self) -> &str {
        match self {
            HookSpec::RawTracepoint { name } => name,
            HookSpec::Kprobe { symbol } => symbol,
        }
    }
}

/// Everything the engine needs to load a program.
#[derive(Debug, Clone)]
pub struct ProgramSpec {
    pub kind: ProgramKind,
    pub license: String,
    pub program: Program,
}

/// Resource acquisition failures. All fatal: startup aborts after
/// reverse-order cleanup of whatever was already acquired.
#[derive(Error, Debug)]
pub enum SetupError {
    #[error("failed to relax memlock limit: {0}")]
    MemlockLimit(#[source] io::Error),

    #[error("program assembly failed: {0}")]
    Assembly(#[from] crate::asm::AssemblyError),

    #[error("failed to create perf event array: {0}")]
    MapCreate(#[source] io::Error),

    #[error("kernel verifier rejected program: {0}")]
    Verification(String),

    #[error("failed to load program: {0}")]
    ProgramLoad(#[source] io::Error),

    #[error("failed to open event reader: {0}")]
    ReaderOpen(#[source] io::Error),

    #[error("failed to attach to hook {hook:?}: {source}")]
    Attach {
        hook: String,
        #[source]
        source: io::Error,
    },
}

/// Perf event array the kernel-side program writes into.
pub trait EventMap: Send {
    /// Map fd, referenced by the program's map-fd pseudo load.
    fn fd(&self) -> RawFd;
}

/// A program accepted by the verifier and resident in the kernel.
pub trait LoadedProgram: Send {
    fn fd(&self) -> RawFd;
}

/// Live binding between a loaded program and a hook point; dropping it
/// detaches. Detaching does not stop buffer reads already in flight.
pub trait Attachment: Send {}

/// The full set of kernel-side operations the agent consumes.
pub trait KernelBackend {
    /// Allow this process to lock the memory the engine's resources
    /// need.
    fn relax_memlock(&self) -> Result<(), SetupError>;

    fn create_event_map(&self) -> Result<Box<dyn EventMap>, SetupError>;

    fn load_program(&self, spec: &ProgramSpec) -> Result<Box<dyn LoadedProgram>, SetupError>;

    /// Open the user-space read side of `map` with `pages` ring pages
    /// per CPU (power of two).
    fn open_reader(
        &self,
        map: &dyn EventMap,
        pages: usize,
    ) -> Result<Arc<dyn EventBuffer>, SetupError>;

    fn attach(
        &self,
        program: &dyn LoadedProgram,
        hook: &HookSpec,
    ) -> Result<Box<dyn Attachment>, SetupError>;
}
