//! Lifecycle ordering tests against a scripted backend: acquisition
//! order, reverse-order release, and rollback on mid-acquire failure.

use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};

use centinela::buffer::{ChannelBuffer, EventBuffer, ReadError};
use centinela::consumer;
use centinela::engine::{
    Attachment, EventMap, HookSpec, KernelBackend, LoadedProgram, ProgramKind, ProgramSpec,
    SetupError,
};
use centinela::lifecycle::{self, AgentConfig};

type Journal = Arc<Mutex<Vec<String>>>;

struct ScriptedBackend {
    journal: Journal,
    fail_step: Option<&'static str>,
}

impl ScriptedBackend {
    fn new(fail_step: Option<&'static str>) -> Self {
        ScriptedBackend {
            journal: Arc::new(Mutex::new(Vec::new())),
            fail_step,
        }
    }

    fn entries(&self) -> Vec<String> {
        self.journal.lock().unwrap().clone()
    }

    fn record(&self, entry: &str) {
        self.journal.lock().unwrap().push(entry.to_owned());
    }

    fn injected(&self) -> std::io::Error {
        std::io::Error::other("injected failure")
    }
}

struct TrackedFd {
    name: &'static str,
    fd: RawFd,
    journal: Journal,
}

impl Drop for TrackedFd {
    fn drop(&mut self) {
        self.journal
            .lock()
            .unwrap()
            .push(format!("close {}", self.name));
    }
}

impl EventMap for TrackedFd {
    fn fd(&self) -> RawFd {
        self.fd
    }
}

impl LoadedProgram for TrackedFd {
    fn fd(&self) -> RawFd {
        self.fd
    }
}

impl Attachment for TrackedFd {}

struct TrackedReader {
    inner: ChannelBuffer,
    journal: Journal,
}

impl EventBuffer for TrackedReader {
    fn read(&self) -> Result<Vec<u8>, ReadError> {
        self.inner.read()
    }

    fn close(&self) {
        self.journal.lock().unwrap().push("close reader".to_owned());
        self.inner.close();
    }
}

impl KernelBackend for ScriptedBackend {
    fn relax_memlock(&self) -> Result<(), SetupError> {
        if self.fail_step == Some("memlock") {
            return Err(SetupError::MemlockLimit(self.injected()));
        }
        self.record("open memlock");
        Ok(())
    }

    fn create_event_map(&self) -> Result<Box<dyn EventMap>, SetupError> {
        if self.fail_step == Some("map") {
            return Err(SetupError::MapCreate(self.injected()));
        }
        self.record("open map");
        Ok(Box::new(TrackedFd {
            name: "map",
            fd: 10,
            journal: Arc::clone(&self.journal),
        }))
    }

    fn load_program(&self, spec: &ProgramSpec) -> Result<Box<dyn LoadedProgram>, SetupError> {
        // The lifecycle must have embedded the map fd it created.
        assert!(spec
            .program
            .insns()
            .iter()
            .any(|i| i.opcode == 0x18 && i.imm == 10));
        assert_eq!(spec.kind, ProgramKind::RawTracepoint);

        if self.fail_step == Some("program") {
            return Err(SetupError::Verification("R2 type mismatch".into()));
        }
        self.record("open program");
        Ok(Box::new(TrackedFd {
            name: "program",
            fd: 11,
            journal: Arc::clone(&self.journal),
        }))
    }

    fn open_reader(
        &self,
        map: &dyn EventMap,
        pages: usize,
    ) -> Result<Arc<dyn EventBuffer>, SetupError> {
        assert_eq!(map.fd(), 10);
        assert!(pages.is_power_of_two());

        if self.fail_step == Some("reader") {
            return Err(SetupError::ReaderOpen(self.injected()));
        }
        self.record("open reader");
        let (inner, _tx) = ChannelBuffer::new();
        Ok(Arc::new(TrackedReader {
            inner,
            journal: Arc::clone(&self.journal),
        }))
    }

    fn attach(
        &self,
        program: &dyn LoadedProgram,
        hook: &HookSpec,
    ) -> Result<Box<dyn Attachment>, SetupError> {
        assert_eq!(program.fd(), 11);

        if self.fail_step == Some("attach") {
            return Err(SetupError::Attach {
                hook: hook.name().to_owned(),
                source: self.injected(),
            });
        }
        self.record("open attachment");
        Ok(Box::new(TrackedFd {
            name: "attachment",
            fd: 12,
            journal: Arc::clone(&self.journal),
        }))
    }
}

#[test]
fn full_lifecycle_releases_in_reverse_order() {
    let backend = ScriptedBackend::new(None);
    let resources = lifecycle::acquire(&backend, &AgentConfig::default()).unwrap();
    drop(resources);

    assert_eq!(
        backend.entries(),
        vec![
            "open memlock",
            "open map",
            "open program",
            "open reader",
            "open attachment",
            "close attachment",
            "close reader",
            "close program",
            "close map",
        ]
    );
}

#[test]
fn reader_step_failure_releases_program_then_map() {
    let backend = ScriptedBackend::new(Some("reader"));
    let err = lifecycle::acquire(&backend, &AgentConfig::default()).unwrap_err();
    assert!(matches!(err, SetupError::ReaderOpen(_)));

    assert_eq!(
        backend.entries(),
        vec![
            "open memlock",
            "open map",
            "open program",
            "close program",
            "close map",
        ]
    );
}

#[test]
fn verification_rejection_surfaces_as_setup_failure() {
    let backend = ScriptedBackend::new(Some("program"));
    let err = lifecycle::acquire(&backend, &AgentConfig::default()).unwrap_err();
    match err {
        SetupError::Verification(log) => assert!(log.contains("R2")),
        other => panic!("expected Verification, got {other:?}"),
    }
    assert_eq!(backend.entries(), vec!["open memlock", "open map", "close map"]);
}

#[test]
fn closing_the_acquired_reader_ends_the_consumer_loop() {
    let backend = ScriptedBackend::new(None);
    let resources = lifecycle::acquire(&backend, &AgentConfig::default()).unwrap();

    let reader = resources.reader();
    let watcher = {
        let reader = Arc::clone(&reader);
        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(50));
            reader.close();
        })
    };

    let stats = consumer::run(reader.as_ref(), |_| {});
    watcher.join().unwrap();
    assert_eq!(stats.delivered, 0);
    assert_eq!(stats.read_faults, 0);
}
