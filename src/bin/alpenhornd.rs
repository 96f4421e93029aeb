//! `alpenhornd` — the per-site Alpenhorn daemon (`spec.md` §1, §6).

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{App, Arg};

use alpenhorn::config;
use alpenhorn::daemon::DaemonContext;

/// Exit codes the daemon contract promises callers (`spec.md` §6).
mod exit {
    pub const OK: u8 = 0;
    pub const CONFIG_ERROR: u8 = 1;
    pub const INDEX_UNREACHABLE: u8 = 2;
    pub const EXTENSION_LOAD_FAILED: u8 = 3;
    pub const SCHEMA_MISMATCH: u8 = 4;
}

fn main() -> ExitCode {
    let matches = App::new("alpenhornd")
        .about("Per-site daemon for the Alpenhorn distributed data archive")
        .arg(
            Arg::with_name("config")
                .long("config")
                .short("c")
                .takes_value(true)
                .help("Path to the daemon's YAML configuration file"),
        )
        .arg(
            Arg::with_name("foreground")
                .long("foreground")
                .short("f")
                .help("Stay attached to the controlling terminal instead of detaching"),
        )
        .arg(
            Arg::with_name("check-config")
                .long("check-config")
                .help("Parse and validate the configuration, then exit"),
        )
        .get_matches();

    let config_path = match matches.value_of("config") {
        Some(p) => std::path::PathBuf::from(p),
        None => config::config_path(),
    };

    let cfg = match config::load(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("configuration error: {:#}", e);
            return ExitCode::from(exit::CONFIG_ERROR);
        }
    };

    config::init_logging(&cfg);

    if matches.is_present("check-config") {
        println!("configuration at {:?} is valid", config_path);
        return ExitCode::from(exit::OK);
    }

    if !matches.is_present("foreground") {
        log::info!("running in the foreground regardless of daemonization request; process supervision is expected to be external");
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start async runtime: {:#}", e);
            return ExitCode::from(exit::CONFIG_ERROR);
        }
    };

    match runtime.block_on(run(cfg, runtime.handle().clone())) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            log::error!("fatal error: {:#}", e);
            ExitCode::from(exit::INDEX_UNREACHABLE)
        }
    }
}

async fn run(cfg: alpenhorn::config::DaemonConfig, handle: tokio::runtime::Handle) -> Result<u8> {
    let update_interval = std::time::Duration::from_secs(cfg.update_interval_secs);
    let metrics_port = cfg.metrics_port;

    let ctx = match DaemonContext::new(cfg, handle.clone()).await {
        Ok(ctx) => Arc::new(ctx),
        Err(e) => {
            let is_schema_mismatch = e
                .chain()
                .any(|cause| matches!(
                    cause.downcast_ref::<alpenhorn::index::IndexError>(),
                    Some(alpenhorn::index::IndexError::VersionMismatch { .. })
                ));
            if is_schema_mismatch {
                log::error!("{:#}", e);
                return Ok(exit::SCHEMA_MISMATCH);
            }

            let is_index_unreachable = e.chain().any(|cause| cause.downcast_ref::<sqlx::Error>().is_some());
            if is_index_unreachable {
                log::error!("data index unreachable at startup: {:#}", e);
                return Ok(exit::INDEX_UNREACHABLE);
            }

            log::error!("startup failed: {:#}", e);
            return Ok(exit::EXTENSION_LOAD_FAILED);
        }
    };

    if let Some(port) = metrics_port {
        let metrics = ctx.metrics();
        tokio::spawn(async move {
            if let Err(e) = metrics.serve(port).await {
                log::error!("metrics endpoint stopped: {:#}", e);
            }
        });
    }

    let (discovered_tx, mut discovered_rx) = tokio::sync::mpsc::channel(1024);
    ctx.start_watches(discovered_tx).await.context("starting node watches")?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let watch_ctx = ctx.clone();
    tokio::spawn(async move {
        while let Some(discovered) = discovered_rx.recv().await {
            watch_ctx.submit_discovered_import(discovered);
        }
    });

    let loop_ctx = ctx.clone();
    let loop_handle = tokio::spawn(async move {
        loop_ctx.run(update_interval, shutdown_rx).await;
    });

    wait_for_signal().await;
    log::info!("received shutdown signal");
    let _ = shutdown_tx.send(true);
    let _ = loop_handle.await;

    match Arc::try_unwrap(ctx) {
        Ok(ctx) => ctx.shutdown(),
        Err(_) => log::warn!("daemon context still has outstanding references at shutdown; worker pool left running"),
    }

    Ok(exit::OK)
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut int = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

    tokio::select! {
        _ = term.recv() => {}
        _ = int.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
