use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use centinela::buffer::EventBuffer;
use centinela::{cli::Cli, consumer, lifecycle, linux::LinuxBackend};
use clap::Parser;
use nix::sys::signal::{SigSet, Signal};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber for diagnostics on stderr
fn init_tracing(debug: bool) {
    let default_level = if debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(default_level.into()))
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: &Cli) -> Result<()> {
    // Block SIGINT/SIGTERM before any thread exists so only the
    // watcher ever observes them.
    let mut signals = SigSet::empty();
    signals.add(Signal::SIGINT);
    signals.add(Signal::SIGTERM);
    signals
        .thread_block()
        .context("failed to block shutdown signals")?;

    let backend = LinuxBackend::new();
    let mut resources = lifecycle::acquire(&backend, &cli.agent_config())?;
    let reader = resources.reader();

    // Cancellation watcher: one signal, one close. Closing the buffer
    // is the only cross-thread cancellation in the agent.
    let watcher_reader = Arc::clone(&reader);
    thread::spawn(move || match signals.wait() {
        Ok(signal) => {
            info!(signal = %signal, "received shutdown signal");
            watcher_reader.close();
        }
        Err(err) => {
            error!(error = %err, "signal wait failed, shutting down");
            watcher_reader.close();
        }
    });

    info!("waiting for events");
    let stats = consumer::run(reader.as_ref(), |event| {
        println!(
            "execve called by UID: {}, PID: {}, Comm: {}",
            event.uid,
            event.pid,
            event.comm()
        );
    });
    info!(delivered = stats.delivered, "shutting down");

    resources.release();
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    if let Err(err) = run(&cli) {
        error!(error = ?err, "setup failed");
        eprintln!("centinela: {err:#}");
        std::process::exit(1);
    }
}
