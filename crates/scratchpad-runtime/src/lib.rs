//! scratchpad-runtime - in-process JavaScript/TypeScript scratchpad engine.
//!
//! Runs short user snippets inside an embedded QuickJS context that exposes
//! only an explicit capability list: a console, a restricted `process`, and a
//! fixed set of builtin modules plus whatever packages are installed in the
//! scratchpad's package directory.
//!
//! # Features
//!
//! - **TypeScript**: stripped with SWC before execution, syntax errors only
//! - **Streaming logs**: every console line is pushed to the caller as it happens
//! - **Tracked listeners**: every `net`/`http` server goes through one tracker,
//!   so the next run can always rebind the same port
//! - **Budgets**: wall-clock limit on the synchronous phase and on every later
//!   callback, bounded wait for a returned promise
//!
//! # Architecture
//!
//! ```text
//! EngineHandle::run ──► pre-run cleanup (ServerTracker::close_all)
//!        │
//!        ▼
//!  worker thread ──► Session (QuickJS runtime + context)
//!        ▲                 │ host functions
//!        │ HostEvent       ▼
//!  Tokio tasks ◄── NetManager / HttpManager ◄── ServerTracker
//! ```

pub mod config;
pub mod console;
pub mod engine;
pub mod error;
pub mod format;
pub mod http;
pub mod kill_port;
pub mod modules;
pub mod net;
pub mod ops;
pub mod timers;
pub mod tracker;
pub mod transpiler;

mod budget;
mod process;
mod session;
mod worker;

pub use worker::HostEvent;

pub use config::EngineConfig;
pub use console::{LogChannel, LogEmitter, LogEvent, LogSink};
pub use engine::{
    Engine, EngineBuilder, EngineHandle, EngineStats, EngineStatsSnapshot, RunRequest, RunResult,
};
pub use error::{EngineError, EngineResult};
pub use format::{MAX_ARRAY_ITEMS, MAX_OBJECT_CHARS, format_value};
pub use kill_port::{KillPortOutcome, PortLookup, PortOwner, SystemPortLookup};
pub use modules::{BUILTIN_MODULES, ModuleGate, ModuleKind};
pub use net::{NetError, NetEvent, NetResult};
pub use session::SERVER_STARTED;
pub use tracker::{CleanupReport, ListenerKind, ServerTracker};
pub use transpiler::{CompiledScript, Language, TranspileError, compile};
