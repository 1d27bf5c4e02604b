//! The engine's worker thread.
//!
//! QuickJS contexts are not `Send`, so every guest entry happens here. The
//! worker waits on two channels with crossbeam `Select`: run jobs from the
//! [`EngineHandle`](crate::EngineHandle), and host events (socket traffic,
//! HTTP requests, listener state) from the Tokio tasks that own the I/O.
//! Between events it fires due timers and drains the microtask queue of the
//! live session.

use crate::budget::ExecutionBudget;
use crate::config::EngineConfig;
use crate::console::{LogChannel, LogEmitter, LogSink};
use crate::engine::{RunRequest, RunResult};
use crate::error::{EngineError, EngineResult};
use crate::http::{HttpManager, RequestId};
use crate::modules::{ModuleGate, PackageLoader, SourceCache};
use crate::net::{NetEvent, NetManager};
use crate::session::{Completion, Session, SessionParts, Settlement};
use crate::tracker::{ListenerId, ServerTracker};
use crate::transpiler;
use crossbeam_channel::{Receiver, RecvTimeoutError, Select, Sender, TryRecvError};
use scratchpad_pm::PackageRegistry;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, error, info, info_span, trace, warn};

/// Longest the worker sleeps when nothing is scheduled.
const IDLE_WAIT: Duration = Duration::from_millis(250);

/// Something the I/O side needs the guest to handle.
#[derive(Debug)]
pub enum HostEvent {
    Net(NetEvent),
    HttpRequest {
        server_id: ListenerId,
        request_id: RequestId,
    },
}

pub(crate) struct RunJob {
    pub run_id: u64,
    pub request: RunRequest,
    pub sink: LogSink,
    pub accepted: Instant,
    pub reply: oneshot::Sender<RunReport>,
}

/// Job submitted to the worker
pub(crate) enum Job {
    Run(RunJob),
    Shutdown,
}

#[derive(Debug)]
pub(crate) struct RunReport {
    pub result: RunResult,
    pub timed_out: bool,
}

/// Everything the worker needs to build sessions.
pub(crate) struct WorkerSetup {
    pub config: EngineConfig,
    pub registry: PackageRegistry,
    pub tracker: Arc<ServerTracker>,
    pub sources: SourceCache,
}

enum Ready {
    Job,
    Event,
    Idle,
}

struct Worker {
    config: EngineConfig,
    tracker: Arc<ServerTracker>,
    events: Receiver<HostEvent>,
    net: Rc<NetManager>,
    http: Rc<HttpManager>,
    gate: Rc<ModuleGate>,
    loader: Rc<PackageLoader>,
    budget: Arc<ExecutionBudget>,
    session: Option<Session>,
    runtime: tokio::runtime::Handle,
}

/// Worker thread body. Returns when a `Shutdown` job arrives or every
/// handle is gone.
pub(crate) fn run_worker(
    jobs: Receiver<Job>,
    events_tx: Sender<HostEvent>,
    events: Receiver<HostEvent>,
    setup: WorkerSetup,
    tokio_handle: &tokio::runtime::Handle,
) {
    let thread_name = std::thread::current()
        .name()
        .unwrap_or("scratchpad-worker")
        .to_string();
    let _span = info_span!("worker", name = %thread_name).entered();
    // Listener and socket tasks are spawned from host functions on this thread.
    let _runtime = tokio_handle.enter();
    debug!("Worker starting");

    let WorkerSetup {
        config,
        registry,
        tracker,
        sources,
    } = setup;
    let loader = PackageLoader::new(
        registry.install_dir().to_path_buf(),
        config.bundled_modules_dir.clone(),
        sources,
    );
    let mut worker = Worker {
        net: Rc::new(NetManager::new(tracker.clone(), events_tx.clone())),
        http: Rc::new(HttpManager::new(tracker.clone(), events_tx)),
        gate: Rc::new(ModuleGate::new(registry)),
        loader: Rc::new(loader),
        budget: ExecutionBudget::new(),
        session: None,
        runtime: tokio_handle.clone(),
        tracker,
        events,
        config,
    };

    loop {
        let wait = worker.idle_wait();
        let ready = {
            let mut sel = Select::new();
            let job_idx = sel.recv(&jobs);
            let event_idx = sel.recv(&worker.events);
            match sel.ready_timeout(wait) {
                Ok(idx) if idx == job_idx => Ready::Job,
                Ok(idx) if idx == event_idx => Ready::Event,
                Ok(_) | Err(_) => Ready::Idle,
            }
        };

        match ready {
            Ready::Job => match jobs.try_recv() {
                Ok(Job::Run(job)) => worker.run(job),
                Ok(Job::Shutdown) | Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) => {}
            },
            Ready::Event => {
                if let Ok(event) = worker.events.try_recv() {
                    worker.dispatch(event);
                }
            }
            Ready::Idle => {}
        }

        worker.tick();
    }

    worker.session = None;
    worker.net.reset();
    worker.http.reset();
    debug!("Worker stopped");
}

impl Worker {
    fn idle_wait(&self) -> Duration {
        match &self.session {
            Some(session) if session.has_pending_jobs() => Duration::ZERO,
            Some(session) => session.next_timer_delay().map_or(IDLE_WAIT, |d| d.min(IDLE_WAIT)),
            None => IDLE_WAIT,
        }
    }

    /// Background work of the live session: due timers, then microtasks.
    fn tick(&self) {
        if let Some(session) = &self.session {
            session.fire_due_timers();
            if session.has_pending_jobs() {
                session.run_jobs();
            }
        }
    }

    fn dispatch(&self, event: HostEvent) {
        match (&self.session, event) {
            (Some(session), event) => dispatch_to(session, event),
            (None, HostEvent::HttpRequest { request_id, .. }) => {
                self.http
                    .respond(request_id, 503, Vec::new(), b"Service Unavailable".to_vec());
            }
            (None, HostEvent::Net(event)) => trace!(?event, "No session for net event"),
        }
    }

    fn run(&mut self, job: RunJob) {
        let RunJob {
            run_id,
            request,
            sink,
            accepted,
            reply,
        } = job;
        let _span = info_span!("run", run_id, language = ?request.language).entered();

        let emitter = LogEmitter::new(sink);
        let outcome = catch_unwind(AssertUnwindSafe(|| self.execute(&request, &emitter)))
            .unwrap_or_else(|panic| {
                let message = if let Some(s) = panic.downcast_ref::<&str>() {
                    format!("Worker panic: {s}")
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    format!("Worker panic: {s}")
                } else {
                    "Worker panic: unknown error".to_string()
                };
                error!("{}", message);
                Err(EngineError::internal(message))
            });

        let report = match outcome {
            Ok(()) => RunReport {
                result: RunResult {
                    success: true,
                    output: emitter.finish(),
                    error: None,
                    duration_ms: elapsed_ms(accepted),
                },
                timed_out: false,
            },
            Err(err) => {
                let text = err.to_string();
                emitter.stream(LogChannel::Stderr, text.clone());
                RunReport {
                    result: RunResult {
                        success: false,
                        output: emitter.finish(),
                        error: Some(text),
                        duration_ms: elapsed_ms(accepted),
                    },
                    timed_out: err.is_timeout(),
                }
            }
        };
        info!(
            success = report.result.success,
            duration_ms = report.result.duration_ms,
            "Run finished"
        );
        if reply.send(report).is_err() {
            debug!("Run caller went away before the result");
        }
    }

    fn execute(&mut self, request: &RunRequest, emitter: &LogEmitter) -> EngineResult<()> {
        // The previous context goes first: its timers and sockets die with it.
        self.session = None;
        self.net.reset();
        self.http.reset();
        let stale = self.events.try_iter().count();
        if stale > 0 {
            debug!(stale, "Dropped events of previous session");
        }
        // Listeners the old session opened after the caller's pre-run cleanup.
        if !self.tracker.is_empty() {
            let report = self.runtime.block_on(self.tracker.close_all());
            debug!(closed = report.closed, "Closed late listeners");
        }

        let script = transpiler::compile(&request.source, request.language)?;
        if script.wrapped {
            trace!("Top-level return, script wrapped");
        }

        let session = Session::new(
            &self.config,
            SessionParts {
                emitter: emitter.clone(),
                budget: self.budget.clone(),
                net: self.net.clone(),
                http: self.http.clone(),
                gate: self.gate.clone(),
                loader: self.loader.clone(),
            },
        )?;
        let completion = session.evaluate(&script);
        // Kept even on failure: listeners opened before a throw stay usable.
        self.session = Some(session);
        let Some(session) = self.session.as_ref() else {
            return Err(EngineError::internal("session vanished"));
        };

        match completion? {
            Completion::Done(Some(line)) => session.emitter().stdout(line),
            Completion::Done(None) => {}
            Completion::Pending => self.await_settlement(session),
        }
        Ok(())
    }

    /// Keep the session turning until the returned promise settles, nothing
    /// could settle it anymore, or the await budget runs out.
    fn await_settlement(&self, session: &Session) {
        let started = Instant::now();
        let deadline = started + self.config.await_timeout();
        loop {
            session.run_jobs();
            if let Some(settlement) = session.take_settlement() {
                match settlement {
                    Settlement::Fulfilled(Some(line)) => session.emitter().stdout(line),
                    Settlement::Fulfilled(None) => {}
                    Settlement::Rejected(reason) => session
                        .emitter()
                        .stderr(format!("[Error] Unhandled Rejection: {reason}")),
                }
                return;
            }

            let now = Instant::now();
            if now >= deadline || !self.has_pending_work(session) {
                warn!("Returned promise did not settle");
                session.emitter().stderr(format!(
                    "[Warn] Promise still pending after {}ms",
                    elapsed_ms(started)
                ));
                return;
            }

            let wait = session
                .next_timer_delay()
                .unwrap_or(IDLE_WAIT)
                .min(deadline - now);
            match self.events.recv_timeout(wait) {
                Ok(event) => dispatch_to(session, event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return,
            }
            session.fire_due_timers();
        }
    }

    fn has_pending_work(&self, session: &Session) -> bool {
        session.has_pending_jobs()
            || session.has_timers()
            || !self.events.is_empty()
            || self.net.open_sockets() > 0
            || self.http.pending_requests() > 0
            || !self.tracker.is_empty()
    }
}

fn dispatch_to(session: &Session, event: HostEvent) {
    match event {
        HostEvent::Net(event) => session.dispatch_net(&event),
        HostEvent::HttpRequest {
            server_id,
            request_id,
        } => session.dispatch_http(server_id, request_id),
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}
