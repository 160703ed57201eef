//! CLI argument parsing for Centinela

use clap::{Parser, ValueEnum};

use crate::engine::HookSpec;
use crate::lifecycle::AgentConfig;

/// Which kind of kernel hook point to attach to
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum HookKind {
    /// Raw tracepoint hook category (default)
    RawTracepoint,
    /// Kernel function entry probe
    Kprobe,
}

#[derive(Parser, Debug)]
#[command(name = "centinela")]
#[command(version)]
#[command(about = "Minimal eBPF kernel-event telemetry agent", long_about = None)]
pub struct Cli {
    /// Hook kind to attach the monitor program to
    #[arg(long = "hook-kind", value_enum, default_value = "raw-tracepoint")]
    pub hook_kind: HookKind,

    /// Hook name: raw tracepoint category or kernel symbol for kprobes
    #[arg(long = "hook", value_name = "NAME")]
    pub hook: Option<String>,

    /// Syscall number the kernel-side filter matches (default: execve)
    #[arg(long = "syscall", value_name = "NR", default_value = "59")]
    pub syscall_nr: i32,

    /// Per-CPU ring pages (power of two)
    #[arg(long = "pages", value_name = "N", default_value = "8")]
    pub pages: usize,

    /// License string declared to the kernel at program load
    #[arg(long = "license", default_value = "GPL")]
    pub license: String,

    /// Enable verbose diagnostics on stderr
    #[arg(long)]
    pub debug: bool,
}

impl Cli {
    /// Agent configuration implied by the flags; with no flags given
    /// this is the execve monitor on the `sys_enter` raw tracepoint.
    pub fn agent_config(&self) -> AgentConfig {
        let hook = match self.hook_kind {
            HookKind::RawTracepoint => HookSpec::RawTracepoint {
                name: self.hook.clone().unwrap_or_else(|| "sys_enter".into()),
            },
            HookKind::Kprobe => HookSpec::Kprobe {
                symbol: self.hook.clone().unwrap_or_else(|| "sys_execve".into()),
            },
        };
        AgentConfig {
            hook,
            syscall_nr: self.syscall_nr,
            license: self.license.clone(),
            pages: self.pages,
        }
    }
}
