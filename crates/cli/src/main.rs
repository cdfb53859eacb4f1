use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use spacesaver_core::config::Config;
use spacesaver_core::db::Catalog;
use spacesaver_core::probe::{FfprobeProber, Prober};
use spacesaver_core::stop::StopToken;
use spacesaver_core::worker::{Encoder, FfmpegEncoder, Worker, WorkerStatus};
use spacesaver_core::{recover, scan};

mod web;

fn main() {
    if let Err(err) = real_main() {
        eprintln!("error: {err}");
        std::process::exit(2);
    }
}

fn real_main() -> spacesaver_core::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Arc::new(Config::from_env()?);
    config.validate()?;
    std::fs::create_dir_all(&config.workdir)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        roots = ?config.media_dirs,
        workdir = %config.workdir.display(),
        "spacesaver starting"
    );

    let catalog = Arc::new(Catalog::open(&config.db_path())?);
    let prober: Arc<dyn Prober> = Arc::new(FfprobeProber::default());
    let encoder: Arc<dyn Encoder> = Arc::new(FfmpegEncoder::default());
    let status = Arc::new(WorkerStatus::default());
    let stop = StopToken::new();

    // Reconcile interrupted work before the scanner runs or the worker
    // may claim anything.
    recover::recover(&catalog, &config, prober.as_ref())?;

    let scanner_handle = {
        let catalog = Arc::clone(&catalog);
        let config = Arc::clone(&config);
        let prober = Arc::clone(&prober);
        let stop = stop.clone();
        std::thread::Builder::new()
            .name("scanner".into())
            .spawn(move || scan::run_scanner(catalog, config, prober, stop))?
    };

    let worker_handle = {
        let worker = Worker::new(
            Arc::clone(&catalog),
            Arc::clone(&config),
            Arc::clone(&prober),
            encoder,
            Arc::clone(&status),
            stop.clone(),
        );
        std::thread::Builder::new()
            .name("worker".into())
            .spawn(move || {
                if let Err(err) = worker.run() {
                    // Catalog failure or an invariant violation: a
                    // programming error, not a job failure.
                    tracing::error!(error = %err, "worker failed, aborting");
                    std::process::exit(1);
                }
            })?
    };

    let state = Arc::new(web::AppState {
        catalog: Arc::clone(&catalog),
        status,
    });
    run_http(config.port, state)?;

    tracing::info!("shutting down");
    stop.stop();
    catalog.notify_worker();
    if scanner_handle.join().is_err() {
        tracing::error!("scanner thread panicked");
    }
    if worker_handle.join().is_err() {
        tracing::error!("worker thread panicked");
    }
    tracing::info!("spacesaver stopped");
    Ok(())
}

/// Run the HTTP adapter on its own runtime; returns once a shutdown
/// signal arrives and in-flight requests have drained.
fn run_http(port: u16, state: Arc<web::AppState>) -> spacesaver_core::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(web::serve(port, state, shutdown_signal()))
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let ctrl_c = tokio::signal::ctrl_c();
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        Err(err) => {
            tracing::warn!(error = %err, "could not install SIGTERM handler");
            let _ = ctrl_c.await;
        }
    }
}
