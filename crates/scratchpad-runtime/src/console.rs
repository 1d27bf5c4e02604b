//! Console API and the log stream it feeds.
//!
//! Every console call is formatted on the worker and pushed to the caller's
//! [`LogSink`] immediately, so the caller sees lines in the order the guest
//! produced them. Lines produced before a run reports its result are also
//! collected into `RunResult::output`.

use crate::format::format_args;
use rquickjs::function::Rest;
use rquickjs::{Ctx, Function, Object, Value};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::rc::Rc;
use tokio::sync::mpsc;

/// Output channel of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogChannel {
    Stdout,
    Stderr,
}

/// One captured log line, as streamed to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    #[serde(rename = "type")]
    pub channel: LogChannel,
    pub message: String,
}

impl LogEvent {
    pub fn stdout(message: impl Into<String>) -> Self {
        Self {
            channel: LogChannel::Stdout,
            message: message.into(),
        }
    }

    pub fn stderr(message: impl Into<String>) -> Self {
        Self {
            channel: LogChannel::Stderr,
            message: message.into(),
        }
    }
}

/// Receiving end is owned by the caller of `EngineHandle::run`.
pub type LogSink = mpsc::UnboundedSender<LogEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleLevel {
    Log,
    Info,
    Debug,
    Warn,
    Error,
    Trace,
    Dir,
    Table,
}

impl ConsoleLevel {
    const ALL: [(&'static str, ConsoleLevel); 8] = [
        ("log", ConsoleLevel::Log),
        ("info", ConsoleLevel::Info),
        ("debug", ConsoleLevel::Debug),
        ("warn", ConsoleLevel::Warn),
        ("error", ConsoleLevel::Error),
        ("trace", ConsoleLevel::Trace),
        ("dir", ConsoleLevel::Dir),
        ("table", ConsoleLevel::Table),
    ];

    fn channel(self) -> LogChannel {
        match self {
            Self::Warn | Self::Error | Self::Trace => LogChannel::Stderr,
            _ => LogChannel::Stdout,
        }
    }

    fn prefix(self) -> Option<&'static str> {
        match self {
            Self::Warn => Some("[Warn]"),
            Self::Info => Some("[Info]"),
            _ => None,
        }
    }

    /// `dir` and `table` render only their first argument.
    fn single_argument(self) -> bool {
        matches!(self, Self::Dir | Self::Table)
    }
}

/// Single funnel for everything a run writes.
///
/// Cloned into every host function that produces output. The buffer is open
/// until the run's result is assembled; after that lines are streamed only.
#[derive(Clone)]
pub struct LogEmitter {
    sink: LogSink,
    buffer: Rc<RefCell<Option<Vec<String>>>>,
}

impl LogEmitter {
    pub fn new(sink: LogSink) -> Self {
        Self {
            sink,
            buffer: Rc::new(RefCell::new(Some(Vec::new()))),
        }
    }

    /// Stream a line and record it in the result buffer.
    pub fn emit(&self, channel: LogChannel, message: impl Into<String>) {
        let message = message.into();
        if let Some(lines) = self.buffer.borrow_mut().as_mut() {
            lines.push(message.clone());
        }
        self.stream(channel, message);
    }

    /// Stream a line without recording it.
    pub fn stream(&self, channel: LogChannel, message: impl Into<String>) {
        // A dropped receiver means nobody is listening anymore.
        let _ = self.sink.send(LogEvent {
            channel,
            message: message.into(),
        });
    }

    pub fn stdout(&self, message: impl Into<String>) {
        self.emit(LogChannel::Stdout, message);
    }

    pub fn stderr(&self, message: impl Into<String>) {
        self.emit(LogChannel::Stderr, message);
    }

    /// Close the buffer and return its lines joined by newlines.
    pub fn finish(&self) -> String {
        self.buffer
            .borrow_mut()
            .take()
            .map(|lines| lines.join("\n"))
            .unwrap_or_default()
    }

    pub fn is_open(&self) -> bool {
        self.buffer.borrow().is_some()
    }
}

/// Build the guest `console` object.
pub(crate) fn create_console<'js>(
    ctx: &Ctx<'js>,
    emitter: &LogEmitter,
) -> rquickjs::Result<Object<'js>> {
    let console = Object::new(ctx.clone())?;

    for (name, level) in ConsoleLevel::ALL {
        let emitter = emitter.clone();
        let method = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, args: Rest<Value<'js>>| -> rquickjs::Result<()> {
                let mut values = args.0;
                if level.single_argument() {
                    values.truncate(1);
                    if values.is_empty() {
                        values.push(Value::new_undefined(ctx.clone()));
                    }
                }
                let body = format_args(&ctx, &values);
                let message = match level.prefix() {
                    Some(prefix) if body.is_empty() => prefix.to_string(),
                    Some(prefix) => format!("{prefix} {body}"),
                    None => body,
                };
                emitter.emit(level.channel(), message);
                Ok(())
            },
        )?
        .with_name(name)?;
        console.set(name, method)?;
    }

    Ok(console)
}
