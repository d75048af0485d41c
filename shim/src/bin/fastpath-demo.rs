// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

#![deny(clippy::all, clippy::pedantic)]

//! A standalone process that installs a [`fastpath::Stack`] behind the POSIX shim and runs its
//! workers until interrupted.
//!
//! Grounded on `dataplane/src/main.rs`'s shape (tracing bring-up, a `ctrlc`-fed shutdown channel,
//! clap argument parsing, then a driver loop) generalized to this spec's own worker model: instead
//! of handing a packet pipeline to a DPDK/kernel driver, this spins up one OS thread per
//! [`fastpath::registry::Worker`] running [`fastpath::tick::tick`], installs the stack for the
//! shim's `#[no_mangle]` exports to find, and blocks until `Ctrl-C`.

use args::{CmdArgs, Parser};
use config::{Config, ConfigResult};
use fastpath::registry::Worker;
use fastpath_shim::install;
use test_utils::LoopbackEngine;
use tracing::{error, info};

const RPC_QUEUE_CAPACITY: usize = 256;

fn init_logging(filter: &str) {
    tracing_subscriber::fmt()
        .with_ansi(false)
        .with_target(true)
        .with_line_number(true)
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(
            |_| tracing_subscriber::EnvFilter::new(filter),
        ))
        .init();
}

/// Build the process [`Config`] from a `--config` file, if any, overridden field-by-field by
/// whatever the command line additionally specifies (`args/src/lib.rs`'s own doc comment: "a
/// value given here overrides whatever the `--config` file set for that field").
fn build_config(args: &CmdArgs) -> ConfigResult<Config> {
    let mut builder = match &args.config {
        Some(path) => {
            let base = Config::from_yaml_file(path)?;
            let mut b = Config::builder();
            b.stack_mode_rtc(base.stack_mode_rtc)
                .listen_shadow(base.listen_shadow)
                .tuple_filter(base.tuple_filter)
                .udp_enable(base.udp_enable)
                .tcp_reuse_ipport(base.tcp_reuse_ipport)
                .host_addr(base.host_addr)
                .worker_count(base.worker_count)
                .send_ring_capacity(base.send_ring_capacity)
                .recv_ring_capacity(base.recv_ring_capacity)
                .idle_ring_capacity(base.idle_ring_capacity)
                .segment_size(base.segment_size);
            b
        }
        None => Config::builder(),
    };
    if let Some(workers) = args.workers {
        builder.worker_count(workers);
    }
    if args.listen_shadow {
        builder.listen_shadow(true);
    }
    if args.tuple_filter {
        builder.tuple_filter(true);
    }
    if args.udp_disable {
        builder.udp_enable(false);
    }
    if args.tcp_reuse_ipport {
        builder.tcp_reuse_ipport(true);
    }
    if let Some(addr) = args.host_addr {
        builder.host_addr(Some(addr));
    }
    builder.build()
}

fn main() {
    let args = CmdArgs::parse();
    init_logging(&args.tracing);

    let config = build_config(&args).unwrap_or_else(|e| {
        error!(error = %e, "invalid configuration");
        std::process::exit(1);
    });
    info!(workers = config.worker_count, "starting fastpath demo");

    let workers: Vec<_> = (0..config.worker_count)
        .map(|id| std::sync::Arc::new(Worker::new(id, LoopbackEngine::new(), &config, RPC_QUEUE_CAPACITY)))
        .collect();
    let stack = fastpath::Stack::new(config, workers);
    stack.mark_ready();

    let (stop_tx, stop_rx) = std::sync::mpsc::channel();
    ctrlc::set_handler(move || stop_tx.send(()).expect("failed to send SIGINT notification"))
        .expect("failed to install SIGINT handler");

    let running = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(true));
    let ticker_handles: Vec<_> = stack
        .registry
        .workers()
        .iter()
        .cloned()
        .map(|worker| {
            let running = std::sync::Arc::clone(&running);
            std::thread::Builder::new()
                .name(format!("fastpath-worker-{}", worker.id))
                .spawn(move || {
                    while running.load(std::sync::atomic::Ordering::Acquire) {
                        fastpath::tick::tick(&worker);
                        std::thread::yield_now();
                    }
                })
                .expect("failed to spawn worker thread")
        })
        .collect();

    install(stack);
    info!("fastpath demo ready; POSIX calls in this process now route through the fast path");

    stop_rx.recv().expect("failed to receive shutdown signal");
    info!("shutting down fastpath demo");
    running.store(false, std::sync::atomic::Ordering::Release);
    for handle in ticker_handles {
        let _ = handle.join();
    }
}
