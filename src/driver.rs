//! Run-mode drivers.
//!
//! Each driver decides *when* to call [`Pipeline::run_cycle`] and nothing
//! else. `run` fires once, `schedule` fires on a fixed interval, and `watch`
//! fires when the source tree changes. All of them stop when the pipeline's
//! shutdown flag is raised (see [`shutdown_signal`]).

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinSet;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};

use crate::discovery::TreeFingerprint;
use crate::pipeline::{CycleError, CycleSummary, Pipeline};

const HEARTBEAT: Duration = Duration::from_secs(3600);

/// One cycle. A coalesced trigger cannot happen here, so `None` maps to an empty summary.
pub async fn run_once(pipeline: &Pipeline) -> Result<CycleSummary, CycleError> {
    Ok(pipeline.run_cycle().await?.unwrap_or_default())
}

/// Cycle immediately, then every `every`, until shutdown.
pub async fn run_interval(pipeline: &Pipeline, every: Duration) -> Result<()> {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut heartbeat = interval_at(Instant::now() + HEARTBEAT, HEARTBEAT);
    let mut cycles = 0u64;
    let mut aborted = 0u64;

    tracing::info!(interval_secs = every.as_secs(), "scheduler started");
    loop {
        tokio::select! {
            biased;
            _ = pipeline.wait_for_shutdown() => break,
            _ = ticker.tick() => {
                cycles += 1;
                if let Err(e) = pipeline.run_cycle().await {
                    aborted += 1;
                    tracing::warn!(error = %e, "scheduled cycle aborted; retrying next interval");
                }
            }
            _ = heartbeat.tick() => {
                tracing::info!(cycles, aborted, "scheduler alive");
            }
        }
    }
    tracing::info!(cycles, aborted, "scheduler stopped");
    Ok(())
}

/// Cycle whenever the source tree fingerprint changes, plus every `fallback`.
///
/// Cycles are spawned, so a burst of changes produces overlapping triggers;
/// the pipeline's single-flight check coalesces them.
pub async fn run_watch(pipeline: Arc<Pipeline>, poll: Duration, fallback: Duration) -> Result<()> {
    let mut poller = interval(poll);
    poller.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut fallback_ticker = interval(fallback);
    fallback_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last: Option<TreeFingerprint> = None;
    let mut cycles = JoinSet::new();

    tracing::info!(
        root = %pipeline.discovery().root().display(),
        poll_ms = poll.as_millis() as u64,
        "watching source tree"
    );
    loop {
        let fire = tokio::select! {
            biased;
            _ = pipeline.wait_for_shutdown() => break,
            _ = fallback_ticker.tick() => true,
            _ = poller.tick() => {
                let discovery = pipeline.discovery().clone();
                match tokio::task::spawn_blocking(move || discovery.fingerprint()).await {
                    Ok(Ok(current)) => {
                        let changed = last.is_some_and(|prev| prev != current);
                        last = Some(current);
                        if changed {
                            tracing::debug!(files = current.files, "source tree changed");
                        }
                        changed
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(error = %e, "could not fingerprint source tree");
                        false
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "fingerprint task failed");
                        false
                    }
                }
            }
            Some(joined) = cycles.join_next(), if !cycles.is_empty() => {
                log_spawned_cycle(joined);
                false
            }
        };

        if fire {
            let p = Arc::clone(&pipeline);
            cycles.spawn(async move { p.run_cycle().await });
        }
    }

    while let Some(joined) = cycles.join_next().await {
        log_spawned_cycle(joined);
    }
    tracing::info!("watch stopped");
    Ok(())
}

fn log_spawned_cycle(
    joined: Result<Result<Option<CycleSummary>, CycleError>, tokio::task::JoinError>,
) {
    match joined {
        Ok(Ok(Some(_))) | Ok(Ok(None)) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "triggered cycle aborted"),
        Err(e) => tracing::error!(error = %e, "cycle task failed"),
    }
}

/// Raise the pipeline's shutdown flag on Ctrl-C or SIGTERM.
pub async fn shutdown_signal(pipeline: Arc<Pipeline>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "could not listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "could not listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received; finishing the batch in flight");
    pipeline.request_shutdown();
}
