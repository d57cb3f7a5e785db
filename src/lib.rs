// src/lib.rs
pub mod relay {
    use std::future::Future;
    use std::net::{IpAddr, SocketAddr};
    use std::time::Duration;

    use anyhow::Context;
    use tokio::task::{JoinError, JoinHandle};
    use tokio::time::{interval, interval_at, Instant, Interval};
    use tracing::{info, warn};

    use crate::config::RelayConfig;
    use crate::consumer::ConsumerState;
    use crate::destination::DestinationSpec;
    use crate::error::SwitchError;
    use crate::remux::TsRemuxEngine;
    use crate::report::Reporter;
    use crate::session::CaptureSession;

    pub struct Options {
        pub config: RelayConfig,
        pub remote: Option<IpAddr>,
        pub local: SocketAddr,
        pub destination: DestinationSpec,
        /// Switch to a numbered file every this many seconds
        pub rotate_secs: Option<u64>,
        pub refresh_secs: u64,
    }

    type PendingSwitch = Option<(String, JoinHandle<Result<(), SwitchError>>)>;

    /// Async entry-point; returns when stopped (Ctrl-C) or when the
    /// consumer ends on its own.
    pub async fn run(opts: Options) -> anyhow::Result<()> {
        run_until(opts, tokio::signal::ctrl_c()).await
    }

    /// Same as [`run`], stopping when `shutdown` resolves.
    pub async fn run_until<F>(opts: Options, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = std::io::Result<()>>,
    {
        let Options {
            config,
            remote,
            local,
            destination,
            rotate_secs,
            refresh_secs,
        } = opts;

        let spec = destination.clone();
        let mut session = tokio::task::spawn_blocking(move || {
            CaptureSession::start(&config, remote, local, &spec, Box::new(TsRemuxEngine::new()))
        })
        .await?
        .context("starting capture session")?;
        let consumer = session.consumer();

        let mut reports = interval(Duration::from_secs(refresh_secs.max(1)));
        let mut rotation = rotate_secs.filter(|&s| s > 0).map(|s| {
            let period = Duration::from_secs(s);
            interval_at(Instant::now() + period, period)
        });
        let mut rotated = 0u32;
        // rotation in flight
        let mut pending: PendingSwitch = None;

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                res = &mut shutdown => {
                    res.context("waiting for Ctrl-C")?;
                    info!("interrupted, stopping");
                    break;
                }
                _ = reports.tick() => {
                    println!("{}", Reporter::to_json(&session.status()));
                    if session.is_finished() {
                        break;
                    }
                }
                _ = next_tick(&mut rotation) => {
                    if let Some((label, _)) = &pending {
                        warn!(destination = %label, "previous rotation still pending, skipping");
                        continue;
                    }
                    rotated += 1;
                    let target = destination.rotated(rotated);
                    let handle = consumer.clone();
                    let label = target.to_string();
                    pending = Some((label, tokio::task::spawn_blocking(move || handle.switch_to(target))));
                }
                (label, outcome) = switch_done(&mut pending) => {
                    match outcome? {
                        Ok(()) => info!(destination = %label, "rotated"),
                        Err(e) => warn!(destination = %label, "rotation failed: {e}"),
                    }
                }
            }
        }

        let report = tokio::task::spawn_blocking(move || {
            session.stop();
            session.status()
        })
        .await?;
        if pending.is_some() {
            let (label, outcome) = switch_done(&mut pending).await;
            if let Err(e) = outcome? {
                info!(destination = %label, "rotation abandoned: {e}");
            }
        }
        println!("{}", Reporter::to_json(&report));

        if report.consumer.state == ConsumerState::Failed {
            anyhow::bail!(
                "capture failed: {}",
                report.consumer.failure.as_deref().unwrap_or("unknown cause")
            );
        }
        Ok(())
    }

    async fn next_tick(tick: &mut Option<Interval>) {
        match tick {
            Some(tick) => {
                tick.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }

    async fn switch_done(pending: &mut PendingSwitch) -> (String, Result<Result<(), SwitchError>, JoinError>) {
        let outcome = match pending {
            Some((_, task)) => task.await,
            None => return std::future::pending().await,
        };
        let label = pending.take().map(|(label, _)| label).unwrap_or_default();
        (label, outcome)
    }
}

pub mod buffer;
pub mod config;
pub mod constants;
pub mod consumer;
pub mod destination;
pub mod error;
pub mod logging;
pub mod muxer;
pub mod network;
pub mod parsers;
pub mod processor;
pub mod producer;
pub mod psi;
pub mod remux;
pub mod report;
pub mod rtp;
pub mod session;
pub mod types;
pub mod upload;
