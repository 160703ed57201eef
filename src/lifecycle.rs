//! Resource lifecycle manager
//!
//! Acquisition order: memlock relaxation → perf event array → program
//! build + load → buffer reader → hook attachment. Release always
//! runs in strict reverse order: the reader must close before the
//! program that writes to it unloads, and the attachment must detach
//! before anything it depends on goes away. Any failure mid-acquire
//! releases everything already acquired, then surfaces the original
//! error; partially initialized state is never left live.

use std::sync::Arc;

use tracing::{debug, info};

use crate::buffer::EventBuffer;
use crate::engine::{
    Attachment, EventMap, HookSpec, KernelBackend, LoadedProgram, ProgramKind, ProgramSpec,
    SetupError,
};
use crate::probe;

/// Agent configuration; defaults reproduce the execve monitor on the
/// `sys_enter` raw tracepoint.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub hook: HookSpec,
    /// Syscall number the kernel-side program filters for.
    pub syscall_nr: i32,
    pub license: String,
    /// Ring pages per CPU; must be a power of two.
    pub pages: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            hook: HookSpec::RawTracepoint {
                name: "sys_enter".into(),
            },
            syscall_nr: 59, // execve on x86-64
            license: "GPL".into(),
            pages: 8,
        }
    }
}

/// Everything acquired by a successful [`acquire`], released in
/// reverse order by [`release`](ResourceSet::release) or drop.
pub struct ResourceSet {
    // Field order is reverse acquisition order so implicit drop also
    // tears down attachment-first.
    attachment: Option<Box<dyn Attachment>>,
    reader: Option<Arc<dyn EventBuffer>>,
    program: Option<Box<dyn LoadedProgram>>,
    map: Option<Box<dyn EventMap>>,
}

impl std::fmt::Debug for ResourceSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceSet")
            .field("attachment", &self.attachment.is_some())
            .field("reader", &self.reader.is_some())
            .field("program", &self.program.is_some())
            .field("map", &self.map.is_some())
            .finish()
    }
}

impl ResourceSet {
    /// Shared handle to the event reader.
    pub fn reader(&self) -> Arc<dyn EventBuffer> {
        Arc::clone(
            self.reader
                .as_ref()
                .expect("reader present until release"),
        )
    }

    /// Tear down in strict reverse acquisition order.
    pub fn release(&mut self) {
        if let Some(attachment) = self.attachment.take() {
            debug!("detaching hook");
            drop(attachment);
        }
        if let Some(reader) = self.reader.take() {
            debug!("closing event reader");
            reader.close();
            drop(reader);
        }
        if let Some(program) = self.program.take() {
            debug!("unloading program");
            drop(program);
        }
        if let Some(map) = self.map.take() {
            debug!("closing event map");
            drop(map);
        }
    }
}

impl Drop for ResourceSet {
    fn drop(&mut self) {
        self.release();
    }
}

/// Acquire all kernel-side resources in order, rolling back in
/// reverse on the first failure.
pub fn acquire(
    backend: &dyn KernelBackend,
    config: &AgentConfig,
) -> Result<ResourceSet, SetupError> {
    backend.relax_memlock()?;
    debug!("memlock limit relaxed");

    let map = backend.create_event_map()?;
    debug!(fd = map.fd(), "perf event array created");

    // The raw tracepoint context carries the syscall id to filter on;
    // a kprobe context does not, the probed symbol is the filter.
    let build = match config.hook.kind() {
        ProgramKind::RawTracepoint => probe::exec_monitor(map.fd(), config.syscall_nr),
        ProgramKind::Kprobe => probe::kprobe_monitor(map.fd()),
    };
    let spec = match build {
        Ok(program) => ProgramSpec {
            kind: config.hook.kind(),
            license: config.license.clone(),
            program,
        },
        Err(err) => {
            drop(map);
            return Err(err.into());
        }
    };

    let program = match backend.load_program(&spec) {
        Ok(program) => program,
        Err(err) => {
            drop(map);
            return Err(err);
        }
    };
    debug!(slots = spec.program.len(), "program loaded");

    let reader = match backend.open_reader(map.as_ref(), config.pages) {
        Ok(reader) => reader,
        Err(err) => {
            drop(program);
            drop(map);
            return Err(err);
        }
    };
    debug!("event reader opened");

    let attachment = match backend.attach(program.as_ref(), &config.hook) {
        Ok(attachment) => attachment,
        Err(err) => {
            reader.close();
            drop(reader);
            drop(program);
            drop(map);
            return Err(err);
        }
    };
    info!(hook = config.hook.name(), "attached, agent running");

    Ok(ResourceSet {
        attachment: Some(attachment),
        reader: Some(reader),
        program: Some(program),
        map: Some(map),
    })
}
