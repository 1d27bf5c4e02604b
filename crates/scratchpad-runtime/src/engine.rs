//! Run controller: the caller-facing side of the engine.
//!
//! The [`Engine`] owns one worker thread holding the QuickJS runtime. Runs
//! are submitted through a cloneable [`EngineHandle`] and serialized through
//! a single run slot: each run first closes every tracked listener, then
//! hands the source to the worker.
//!
//! # Example
//!
//! ```no_run
//! use scratchpad_runtime::{Engine, RunRequest};
//!
//! #[tokio::main]
//! async fn main() {
//!     let engine = Engine::builder().build().unwrap();
//!     let handle = engine.handle();
//!
//!     let (sink, mut logs) = tokio::sync::mpsc::unbounded_channel();
//!     let result = handle.run(RunRequest::javascript("console.log(1 + 1)"), sink).await;
//!     assert_eq!(result.output, "2");
//!     while let Ok(event) = logs.try_recv() {
//!         println!("{}", event.message);
//!     }
//! }
//! ```

use crate::config::EngineConfig;
use crate::console::LogSink;
use crate::error::{EngineError, EngineResult};
use crate::kill_port::{self, KillPortOutcome, PortLookup, SystemPortLookup};
use crate::modules::SourceCache;
use crate::tracker::{CleanupReport, ServerTracker};
use crate::transpiler::Language;
use crate::worker::{Job, RunJob, RunReport, WorkerSetup, run_worker};
use crossbeam_channel::{Sender, unbounded};
use scratchpad_pm::PackageRegistry;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Instant;
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, info, warn};

/// One source submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub source: String,
    pub language: Language,
}

impl RunRequest {
    pub fn new(source: impl Into<String>, language: Language) -> Self {
        Self {
            source: source.into(),
            language,
        }
    }

    pub fn javascript(source: impl Into<String>) -> Self {
        Self::new(source, Language::JavaScript)
    }

    pub fn typescript(source: impl Into<String>) -> Self {
        Self::new(source, Language::TypeScript)
    }
}

/// What a run reports back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub success: bool,
    /// Log lines captured before the result was assembled, newline-joined.
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl RunResult {
    fn failed(error: &EngineError, accepted: Instant) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.to_string()),
            duration_ms: u64::try_from(accepted.elapsed().as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Run counters. All atomic, readable at any time.
#[derive(Debug, Default)]
pub struct EngineStats {
    pub runs_started: AtomicU64,
    pub runs_succeeded: AtomicU64,
    pub runs_failed: AtomicU64,
    pub runs_timed_out: AtomicU64,
}

impl EngineStats {
    pub fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            runs_started: self.runs_started.load(Ordering::Relaxed),
            runs_succeeded: self.runs_succeeded.load(Ordering::Relaxed),
            runs_failed: self.runs_failed.load(Ordering::Relaxed),
            runs_timed_out: self.runs_timed_out.load(Ordering::Relaxed),
        }
    }

    fn record(&self, result: &RunResult, timed_out: bool) {
        if result.success {
            self.runs_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.runs_failed.fetch_add(1, Ordering::Relaxed);
        }
        if timed_out {
            self.runs_timed_out.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatsSnapshot {
    pub runs_started: u64,
    pub runs_succeeded: u64,
    pub runs_failed: u64,
    pub runs_timed_out: u64,
}

/// Builder for an [`Engine`].
#[derive(Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    registry: Option<PackageRegistry>,
    port_lookup: Option<Arc<dyn PortLookup>>,
    tokio_handle: Option<tokio::runtime::Handle>,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Package registry consulted by `require`.
    /// Default: the one described by the user's `npm-config.json`.
    pub fn registry(mut self, registry: PackageRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn port_lookup(mut self, lookup: Arc<dyn PortLookup>) -> Self {
        self.port_lookup = Some(lookup);
        self
    }

    /// Runtime that serves listeners and sockets.
    /// Default: the runtime `build` is called from.
    pub fn tokio_handle(mut self, handle: tokio::runtime::Handle) -> Self {
        self.tokio_handle = Some(handle);
        self
    }

    pub fn build(self) -> EngineResult<Engine> {
        let tokio_handle = match self.tokio_handle {
            Some(handle) => handle,
            None => tokio::runtime::Handle::try_current()
                .map_err(|e| EngineError::internal(format!("No Tokio runtime: {e}")))?,
        };
        let registry = self
            .registry
            .unwrap_or_else(PackageRegistry::from_default_config);
        let port_lookup = self
            .port_lookup
            .unwrap_or_else(|| Arc::new(SystemPortLookup));
        let host_process_name = self
            .config
            .host_process_name
            .clone()
            .unwrap_or_else(kill_port::current_process_name);

        let tracker = Arc::new(ServerTracker::new());
        let (job_tx, job_rx) = unbounded::<Job>();
        let (event_tx, event_rx) = unbounded();

        let setup = WorkerSetup {
            config: self.config,
            registry,
            tracker: tracker.clone(),
            sources: SourceCache::new(),
        };
        let worker_handle = tokio_handle.clone();
        let worker = std::thread::Builder::new()
            .name("scratchpad-worker".to_string())
            .spawn(move || run_worker(job_rx, event_tx, event_rx, setup, &worker_handle))
            .map_err(|e| EngineError::internal(format!("Failed to spawn worker: {e}")))?;

        info!(host_process = %host_process_name, "Engine started");
        Ok(Engine {
            handle: EngineHandle {
                inner: Arc::new(Inner {
                    jobs: job_tx,
                    tracker,
                    run_slot: Mutex::new(()),
                    stats: EngineStats::default(),
                    port_lookup,
                    host_process_name,
                    next_run: AtomicU64::new(1),
                    tokio_handle,
                }),
            },
            worker: Some(worker),
        })
    }
}

/// Owner of the worker thread.
///
/// Dropping it asks the worker to stop without waiting; use
/// [`Engine::shutdown`] to wait for it.
pub struct Engine {
    handle: EngineHandle,
    worker: Option<JoinHandle<()>>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    /// Close every listener, stop the worker and wait for it to exit.
    pub async fn shutdown(mut self) {
        self.handle.inner.tracker.close_all().await;
        let _ = self.handle.inner.jobs.send(Job::Shutdown);
        if let Some(worker) = self.worker.take() {
            tokio::task::spawn_blocking(move || {
                let _ = worker.join();
            })
            .await
            .ok();
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.worker.is_some() {
            let _ = self.handle.inner.jobs.send(Job::Shutdown);
        }
    }
}

struct Inner {
    jobs: Sender<Job>,
    tracker: Arc<ServerTracker>,
    run_slot: Mutex<()>,
    stats: EngineStats,
    port_lookup: Arc<dyn PortLookup>,
    host_process_name: String,
    next_run: AtomicU64,
    tokio_handle: tokio::runtime::Handle,
}

/// Thread-safe handle to the engine. Cheap to clone.
#[derive(Clone)]
pub struct EngineHandle {
    inner: Arc<Inner>,
}

impl EngineHandle {
    /// Execute one submission.
    ///
    /// Log lines are streamed to `sink` as they are produced. Runs queue
    /// behind each other; tracked listeners of earlier runs are closed
    /// before compiling starts. Never fails: every error ends up in the
    /// returned [`RunResult`].
    pub async fn run(&self, request: RunRequest, sink: LogSink) -> RunResult {
        let accepted = Instant::now();
        let _slot = self.inner.run_slot.lock().await;

        let run_id = self.inner.next_run.fetch_add(1, Ordering::Relaxed);
        self.inner.stats.runs_started.fetch_add(1, Ordering::Relaxed);

        let cleanup = self.inner.tracker.close_all().await;
        if cleanup != CleanupReport::default() {
            debug!(run_id, closed = cleanup.closed, failed = cleanup.failed, "Pre-run cleanup");
        }

        let (reply, response) = oneshot::channel();
        let job = Job::Run(RunJob {
            run_id,
            request,
            sink,
            accepted,
            reply,
        });

        let report = if self.inner.jobs.send(job).is_err() {
            None
        } else {
            response.await.ok()
        };
        let RunReport { result, timed_out } = report.unwrap_or_else(|| {
            warn!(run_id, "Worker is gone");
            RunReport {
                result: RunResult::failed(&EngineError::WorkerGone, accepted),
                timed_out: false,
            }
        });

        self.inner.stats.record(&result, timed_out);
        result
    }

    /// Close tracked listeners in the background. Does not interrupt a
    /// running script.
    pub fn stop(&self) {
        let tracker = self.inner.tracker.clone();
        self.inner.tokio_handle.spawn(async move {
            tracker.close_all().await;
        });
    }

    /// Close tracked listeners and report whether none are left.
    pub async fn clean(&self) -> bool {
        let report = self.inner.tracker.close_all().await;
        report.failed == 0 && self.inner.tracker.is_empty()
    }

    /// Terminate the owner of `port` if it is a copy of the host process.
    pub async fn kill_port(&self, port: u16) -> KillPortOutcome {
        kill_port::kill_port(
            self.inner.port_lookup.as_ref(),
            &self.inner.host_process_name,
            port,
        )
        .await
    }

    pub fn stats(&self) -> EngineStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Addresses guest listeners are bound to right now.
    pub fn listener_addresses(&self) -> Vec<SocketAddr> {
        self.inner.tracker.addresses()
    }

    pub fn has_listeners(&self) -> bool {
        !self.inner.tracker.is_empty()
    }
}
