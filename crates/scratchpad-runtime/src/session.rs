//! One guest execution context and everything bound into it.
//!
//! A session is created per run and kept alive on the worker after the run
//! reports, so timers, sockets and HTTP handlers it started keep working.
//! Every entry into guest code goes through the session, which arms the
//! execution budget around it.

use crate::budget::ExecutionBudget;
use crate::config::EngineConfig;
use crate::console::{LogEmitter, create_console};
use crate::error::{EngineError, EngineResult};
use crate::format::{format_caught, format_value, is_server_handle, is_thenable};
use crate::http::{HttpManager, RequestId};
use crate::modules::{self, ModuleGate, PackageLoader};
use crate::net::{NetEvent, NetManager};
use crate::process::create_process;
use crate::timers::{self, SharedTimers, TimerQueue};
use crate::tracker::ListenerId;
use crate::transpiler::CompiledScript;
use rquickjs::context::EvalOptions;
use rquickjs::function::IntoArgs;
use rquickjs::{CatchResultExt, Context, Ctx, Function, Object, Persistent, Runtime, Value};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

const BOOTSTRAP: &str = include_str!("js/bootstrap.js");

/// Line reported instead of the value when a run returns a listener.
pub const SERVER_STARTED: &str = "Server started.";

/// How a returned promise ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    /// Completion line for the resolved value, if it is not `undefined`.
    Fulfilled(Option<String>),
    /// Formatted rejection reason.
    Rejected(String),
}

/// Result of the synchronous phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// The script finished; the line to report, if any.
    Done(Option<String>),
    /// The script returned a thenable; see [`Session::take_settlement`].
    Pending,
}

/// Shared services a session binds into its context.
pub(crate) struct SessionParts {
    pub emitter: LogEmitter,
    pub budget: Arc<ExecutionBudget>,
    pub net: Rc<NetManager>,
    pub http: Rc<HttpManager>,
    pub gate: Rc<ModuleGate>,
    pub loader: Rc<PackageLoader>,
}

pub(crate) struct Session {
    /// Frozen object returned by the bootstrap with its dispatch functions.
    /// Held only here, never on the guest's global object.
    internal: Persistent<Object<'static>>,
    // Declared before `runtime` so the context is dropped first.
    context: Context,
    runtime: Runtime,
    timers: SharedTimers,
    settlement: Rc<RefCell<Option<Settlement>>>,
    emitter: LogEmitter,
    budget: Arc<ExecutionBudget>,
    timeout: Duration,
}

impl Session {
    pub(crate) fn new(config: &EngineConfig, parts: SessionParts) -> EngineResult<Self> {
        let runtime = Runtime::new()?;
        if let Some(limit) = config.memory_limit_bytes {
            runtime.set_memory_limit(limit);
        }
        if let Some(limit) = config.max_stack_bytes {
            runtime.set_max_stack_size(limit);
        }
        let budget = parts.budget.clone();
        runtime.set_interrupt_handler(Some(Box::new(move || budget.should_interrupt())));

        let context = Context::full(&runtime)?;
        let timers: SharedTimers = Rc::new(RefCell::new(TimerQueue::new()));
        let settlement = Rc::new(RefCell::new(None));

        let internal = context.with(|ctx| install(&ctx, &parts, &timers, &settlement))?;
        debug!("Session created");

        Ok(Self {
            internal,
            context,
            runtime,
            timers,
            settlement,
            emitter: parts.emitter,
            budget: parts.budget,
            timeout: config.timeout(),
        })
    }

    pub(crate) fn emitter(&self) -> &LogEmitter {
        &self.emitter
    }

    fn timeout_ms(&self) -> u64 {
        u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX)
    }

    /// Run the synchronous phase of a script.
    pub(crate) fn evaluate(&self, script: &CompiledScript) -> EngineResult<Completion> {
        let completion = self.context.with(|ctx| {
            self.budget.arm(self.timeout);
            let budget = &self.budget;
            let _disarm = scopeguard::guard((), |_| budget.disarm());

            let mut options = EvalOptions::default();
            options.strict = false;
            let value: Value = match ctx
                .eval_with_options(script.code.as_str(), options)
                .catch(&ctx)
            {
                Ok(value) => value,
                Err(_) if budget.tripped() => return Err(EngineError::Timeout(self.timeout_ms())),
                Err(err) => return Err(EngineError::Runtime(format_caught(&ctx, err))),
            };

            if is_thenable(&ctx, &value) {
                let settle: Function = self.internal(&ctx)?.get("settle")?;
                settle
                    .call::<_, ()>((value,))
                    .catch(&ctx)
                    .map_err(|e| EngineError::Runtime(format_caught(&ctx, e)))?;
                return Ok(Completion::Pending);
            }
            Ok(Completion::Done(completion_line(&ctx, &value)))
        })?;
        trace!(?completion, "Synchronous phase finished");
        Ok(completion)
    }

    /// Drain the microtask queue under one budget.
    pub(crate) fn run_jobs(&self) {
        self.budget.arm(self.timeout);
        loop {
            match self.runtime.execute_pending_job() {
                Ok(true) => continue,
                Ok(false) => break,
                Err(exception) => {
                    if self.budget.tripped() {
                        self.report_timeout();
                        break;
                    }
                    let message = exception.0.with(|ctx| {
                        let value = ctx.catch();
                        format_value(&ctx, &value)
                    });
                    self.emitter.stderr(format!("[Error] {message}"));
                }
            }
        }
        self.budget.disarm();
    }

    pub(crate) fn has_pending_jobs(&self) -> bool {
        self.runtime.is_job_pending()
    }

    /// Call `internal[method](...args)` as one guest entry.
    fn call_internal<A>(&self, method: &str, args: A)
    where
        A: for<'js> IntoArgs<'js>,
    {
        self.context.with(|ctx| {
            self.budget.arm(self.timeout);
            let result = self
                .internal(&ctx)
                .and_then(|internal| internal.get::<_, Function>(method))
                .and_then(|f| f.call::<_, ()>(args))
                .catch(&ctx);
            self.budget.disarm();
            if let Err(err) = result {
                if self.budget.tripped() {
                    self.report_timeout();
                } else {
                    let message = format_caught(&ctx, err);
                    self.emitter.stderr(format!("[Error] {message}"));
                }
            }
        });
        self.run_jobs();
    }

    fn report_timeout(&self) {
        self.emitter.stderr(format!(
            "[Error] Callback timed out after {}ms",
            self.timeout_ms()
        ));
    }

    /// Fire every timer that is due now. Returns how many fired.
    pub(crate) fn fire_due_timers(&self) -> usize {
        let now = Instant::now();
        let mut fired = 0;
        loop {
            let due = self.timers.borrow_mut().pop_due(now);
            let Some(id) = due else {
                break;
            };
            trace!(timer = id, "Timer fired");
            self.call_internal("fireTimer", (id,));
            fired += 1;
        }
        fired
    }

    pub(crate) fn dispatch_net(&self, event: &NetEvent) {
        match serde_json::to_string(event) {
            Ok(json) => self.call_internal("netDispatch", (json,)),
            Err(e) => debug!(error = %e, "Dropping unserializable net event"),
        }
    }

    pub(crate) fn dispatch_http(&self, server_id: ListenerId, request_id: RequestId) {
        self.call_internal("httpDispatch", (server_id, request_id));
    }

    pub(crate) fn next_timer_delay(&self) -> Option<Duration> {
        self.timers.borrow().next_delay()
    }

    pub(crate) fn has_timers(&self) -> bool {
        !self.timers.borrow().is_empty()
    }

    pub(crate) fn take_settlement(&self) -> Option<Settlement> {
        self.settlement.borrow_mut().take()
    }

    fn internal<'js>(&self, ctx: &Ctx<'js>) -> rquickjs::Result<Object<'js>> {
        self.internal.clone().restore(ctx)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let pending = self.timers.borrow().len();
        self.timers.borrow_mut().clear_all();
        if pending > 0 {
            debug!(pending, "Discarded timers of previous session");
        }
    }
}

/// `=> value`, the listener notice, or nothing for `undefined`.
fn completion_line<'js>(ctx: &Ctx<'js>, value: &Value<'js>) -> Option<String> {
    if value.is_undefined() {
        None
    } else if is_server_handle(ctx, value) {
        Some(SERVER_STARTED.to_string())
    } else {
        Some(format!("=> {}", format_value(ctx, value)))
    }
}

fn install<'js>(
    ctx: &Ctx<'js>,
    parts: &SessionParts,
    timers: &SharedTimers,
    settlement: &Rc<RefCell<Option<Settlement>>>,
) -> EngineResult<Persistent<Object<'static>>> {
    let host = Object::new(ctx.clone())?;

    crate::ops::register_all(ctx, &host)?;
    timers::register(ctx, &host, timers)?;
    modules::register(ctx, &host, parts.gate.clone(), parts.loader.clone())?;
    crate::ops::net::register(ctx, &host, parts.net.clone(), parts.http.clone())?;

    let slot = settlement.clone();
    host.set(
        "settle",
        Function::new(ctx.clone(), move |ctx: Ctx<'js>, ok: bool, value: Value<'js>| {
            let outcome = if ok {
                Settlement::Fulfilled(completion_line(&ctx, &value))
            } else {
                Settlement::Rejected(format_value(&ctx, &value))
            };
            *slot.borrow_mut() = Some(outcome);
        })?,
    )?;

    let emitter = parts.emitter.clone();
    host.set(
        "reportError",
        Function::new(ctx.clone(), move |ctx: Ctx<'js>, value: Value<'js>| {
            emitter.stderr(format!("[Error] {}", format_value(&ctx, &value)));
        })?,
    )?;

    host.set(
        "formatValue",
        Function::new(ctx.clone(), |ctx: Ctx<'js>, value: Value<'js>| {
            format_value(&ctx, &value)
        })?,
    )?;

    let console = create_console(ctx, &parts.emitter)?;
    let process = create_process(ctx, &host, &parts.emitter, Instant::now())?;

    let bootstrap: Function = ctx
        .eval(BOOTSTRAP)
        .catch(ctx)
        .map_err(|e| EngineError::internal(format!("bootstrap: {}", format_caught(ctx, e))))?;
    let internal: Object = bootstrap
        .call((host, console, process))
        .catch(ctx)
        .map_err(|e| EngineError::internal(format!("bootstrap: {}", format_caught(ctx, e))))?;
    Ok(Persistent::save(ctx, internal))
}
