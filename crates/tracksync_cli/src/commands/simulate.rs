//! Simulate command implementation.
//!
//! Drives job runs through an in-memory backend while a registry tracks
//! them over both poll and push, and prints every state change the views
//! would render.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};
use tracksync_core::{
    ChannelConfig, ChannelStatus, ClientFields, LocalState, MemoryBackend, Phase, PhaseClassifier,
    Policies, PollConfig, ResourceId, SessionStatus, SyncClient, SyncConfig, SyncError,
    SyncRegistry, SyncSignal, SyncStats, Version,
};

/// Payload of a simulated job run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Run {
    /// Status reported by the server.
    pub status: String,
    /// Progress percentage.
    pub progress: u8,
}

impl Run {
    fn new(status: &str, progress: u8) -> Self {
        Self {
            status: status.to_string(),
            progress,
        }
    }
}

/// Maps run statuses to phases. Unrecognized statuses are unknown.
pub struct RunStatusClassifier;

impl PhaseClassifier<Run> for RunStatusClassifier {
    fn classify(&self, run: &Run) -> Phase {
        match run.status.as_str() {
            "queued" | "processing" => Phase::Active,
            "complete" | "failed" | "cancelled" => Phase::Terminal,
            _ => Phase::Unknown,
        }
    }
}

/// Options for the simulate command.
#[derive(Debug, Clone)]
pub struct SimulateOptions {
    /// Number of runs tracked at once.
    pub runs: usize,
    /// Server-side updates per run, the last one completing it.
    pub steps: u32,
    /// Delay between updates in milliseconds.
    pub step_ms: u64,
    /// Active poll interval in milliseconds.
    pub poll_ms: u64,
    /// Channel reconnect backoff in milliseconds.
    pub backoff_ms: u64,
    /// Drop every Nth push event.
    pub drop_every: Option<u64>,
    /// Break every push channel after this step.
    pub break_channel_at: Option<u32>,
    /// Revoke access to every run from this step on.
    pub forbid_at: Option<u32>,
    /// Whether a push channel is opened.
    pub push: bool,
    /// Output format (text, json).
    pub format: String,
}

impl Default for SimulateOptions {
    fn default() -> Self {
        Self {
            runs: 1,
            steps: 5,
            step_ms: 1_000,
            poll_ms: 3_000,
            backoff_ms: 2_000,
            drop_every: None,
            break_channel_at: None,
            forbid_at: None,
            push: true,
            format: "text".to_string(),
        }
    }
}

/// Simulation errors.
#[derive(Debug, Error)]
pub enum SimulateError {
    /// A run could not be attached.
    #[error("failed to attach run: {0}")]
    Attach(#[from] SyncError),

    /// A live run ended on a different version than the server.
    #[error("{run} did not converge: local {local}, server {server}")]
    Diverged {
        /// The run.
        run: ResourceId,
        /// Version the view ended on.
        local: Version,
        /// Version the server holds.
        server: Version,
    },

    /// The async runtime could not be started.
    #[error("failed to start runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

/// Final state of one simulated run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// The run.
    pub run: ResourceId,
    /// Version the view ended on.
    pub version: Version,
    /// Version the server holds, if the run is still visible.
    pub server_version: Option<Version>,
    /// Phase the view ended in.
    pub phase: Phase,
    /// Session status.
    pub status: SessionStatus,
    /// Controller counters.
    pub stats: SyncStats,
}

#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum Line<'a> {
    Change {
        elapsed_ms: u64,
        run: &'a ResourceId,
        version: Version,
        status: &'a str,
        progress: u8,
    },
    Signal {
        elapsed_ms: u64,
        run: &'a ResourceId,
        signal: &'a SyncSignal,
    },
    Summary(&'a RunSummary),
}

impl fmt::Display for Line<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Line::Change {
                elapsed_ms,
                run,
                version,
                status,
                progress,
            } => write!(
                f,
                "[{elapsed_ms:>7}ms] {run} {version} {status} {progress}%"
            ),
            Line::Signal {
                elapsed_ms,
                run,
                signal,
            } => match signal {
                SyncSignal::ResourceGone { reason } => {
                    write!(f, "[{elapsed_ms:>7}ms] {run} gone: {reason}")
                }
                SyncSignal::PollingExhausted { attempts } => {
                    write!(f, "[{elapsed_ms:>7}ms] {run} polling stopped after {attempts} attempts")
                }
            },
            Line::Summary(summary) => write!(
                f,
                "{}: {} ({:?}, {:?}), applied {} poll / {} push, discarded {}",
                summary.run,
                summary.version,
                summary.phase,
                summary.status,
                summary.stats.poll_snapshots,
                summary.stats.push_snapshots,
                summary.stats.snapshots_discarded
            ),
        }
    }
}

struct Reporter {
    json: bool,
    started: Instant,
}

impl Reporter {
    fn new(format: &str) -> Self {
        Self {
            json: format == "json",
            started: Instant::now(),
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn change(&self, state: &LocalState<Run>) {
        self.emit(&Line::Change {
            elapsed_ms: self.elapsed_ms(),
            run: state.resource_id(),
            version: state.last_applied_version(),
            status: &state.payload().status,
            progress: state.payload().progress,
        });
    }

    fn signal(&self, run: &ResourceId, signal: &SyncSignal) {
        self.emit(&Line::Signal {
            elapsed_ms: self.elapsed_ms(),
            run,
            signal,
        });
    }

    fn emit(&self, line: &Line<'_>) {
        if !self.json {
            println!("{line}");
            return;
        }
        match serde_json::to_string(line) {
            Ok(json) => println!("{json}"),
            Err(e) => warn!(error = %e, "failed to encode output line"),
        }
    }
}

/// Runs the simulate command on a fresh single-threaded runtime.
pub fn run(options: &SimulateOptions) -> Result<Vec<RunSummary>, SimulateError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(simulate(options))
}

fn sync_config(options: &SimulateOptions) -> SyncConfig {
    let poll = Duration::from_millis(options.poll_ms);
    let channel = if options.push {
        ChannelConfig::new().with_reconnect_backoff(Duration::from_millis(options.backoff_ms))
    } else {
        ChannelConfig::disabled()
    };

    SyncConfig::new()
        .with_poll(
            PollConfig::new()
                .with_active_interval(poll)
                .with_unknown_interval(poll)
                .with_terminal_interval(poll * 10),
        )
        .with_channel(channel)
        .with_terminal_drain(Duration::from_millis(options.step_ms))
}

/// Runs the simulation on the current runtime.
pub async fn simulate(options: &SimulateOptions) -> Result<Vec<RunSummary>, SimulateError> {
    let backend = MemoryBackend::<Run>::new();
    backend.set_drop_every(options.drop_every);

    let client = SyncClient::new(backend.clone(), backend.clone(), sync_config(options));
    let registry = SyncRegistry::new(client);
    let reporter = Arc::new(Reporter::new(&options.format));

    let ids: Vec<ResourceId> = (0..options.runs)
        .map(|i| ResourceId::new(format!("run-{i}")))
        .collect();

    let mut tokens = Vec::new();
    for id in &ids {
        let initial = backend.insert(id.clone(), Run::new("queued", 0));
        let policies = Policies::new(RunStatusClassifier)
            .with_client_fields(ClientFields::new().with("origin", "simulate"));
        let handle = registry.attach(initial, policies)?;

        let changes = Arc::clone(&reporter);
        tokens.push(handle.on_change(move |state| changes.change(state)));
        let signals = Arc::clone(&reporter);
        let run = id.clone();
        tokens.push(handle.on_signal(move |signal| signals.signal(&run, signal)));
    }
    info!(runs = ids.len(), steps = options.steps, "simulation started");

    let step = Duration::from_millis(options.step_ms);
    for n in 1..=options.steps {
        tokio::time::sleep(step).await;

        let run = if n == options.steps {
            Run::new("complete", 100)
        } else {
            Run::new("processing", (n * 100 / options.steps) as u8)
        };

        for id in &ids {
            if options.forbid_at.is_some_and(|at| n >= at) {
                backend.forbid(id);
                continue;
            }
            backend.update(id, run.clone());
            if options.break_channel_at == Some(n) {
                backend.break_channels(id, ChannelStatus::Erroring);
            }
        }
    }

    // One missed push is always recovered by the next poll.
    tokio::time::sleep(Duration::from_millis(options.poll_ms * 2 + options.backoff_ms)).await;

    let mut summaries = Vec::with_capacity(ids.len());
    for id in &ids {
        let Some(handle) = registry.get(id) else {
            continue;
        };
        let current = handle.current();
        summaries.push(RunSummary {
            run: id.clone(),
            version: current.last_applied_version(),
            server_version: backend.snapshot(id).map(|s| s.version),
            phase: current.phase(),
            status: handle.status(),
            stats: handle.stats(),
        });
    }

    for mut token in tokens {
        token.unsubscribe();
    }
    registry.release_all();
    info!(runs = summaries.len(), "simulation finished");

    for summary in &summaries {
        reporter.emit(&Line::Summary(summary));
    }

    for summary in &summaries {
        if summary.status != SessionStatus::Live {
            continue;
        }
        if let Some(server) = summary.server_version {
            if server != summary.version {
                return Err(SimulateError::Diverged {
                    run: summary.run.clone(),
                    local: summary.version,
                    server,
                });
            }
        }
    }

    Ok(summaries)
}
