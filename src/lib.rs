//! Centinela - Minimal eBPF kernel-event telemetry agent
//!
//! This library assembles a small monitoring program with a symbolic
//! instruction assembler, loads it at a kernel hook point (raw
//! tracepoint or kprobe), and streams fixed-layout event records from
//! kernel space to a blocking user-space consumption loop with
//! signal-driven shutdown.

pub mod asm;
pub mod buffer;
pub mod cli;
pub mod consumer;
pub mod engine;
pub mod event;
pub mod insn;
pub mod lifecycle;
#[cfg(target_os = "linux")]
pub mod linux;
pub mod probe;
