//! Integration tests for running scripts through the Engine

use async_trait::async_trait;
use parking_lot::Mutex;
use scratchpad_pm::PackageRegistry;
use scratchpad_runtime::{
    Engine, EngineConfig, LogChannel, LogEvent, PortLookup, PortOwner, RunRequest, RunResult,
};
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

#[derive(Default)]
struct FakeLookup {
    owners: Vec<PortOwner>,
    killed: Mutex<Vec<u32>>,
}

#[async_trait]
impl PortLookup for FakeLookup {
    async fn listeners_on(&self, _port: u16) -> io::Result<Vec<PortOwner>> {
        Ok(self.owners.clone())
    }

    async fn terminate(&self, pid: u32) -> Result<(), String> {
        self.killed.lock().push(pid);
        Ok(())
    }
}

fn packages(deps: &[&str]) -> TempDir {
    let dir = TempDir::new().unwrap();
    let deps = deps
        .iter()
        .map(|d| format!("\"{d}\": \"^1.0.0\""))
        .collect::<Vec<_>>()
        .join(", ");
    std::fs::write(
        dir.path().join("package.json"),
        format!(r#"{{ "dependencies": {{ {deps} }} }}"#),
    )
    .unwrap();
    dir
}

fn install(root: &Path, name: &str, body: &str) {
    let dir = root.join("node_modules").join(name);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("package.json"),
        format!(r#"{{ "name": "{name}", "version": "1.0.0", "main": "index.js" }}"#),
    )
    .unwrap();
    std::fs::write(dir.join("index.js"), body).unwrap();
}

fn engine_with(dir: &TempDir, config: EngineConfig, lookup: Arc<FakeLookup>) -> Engine {
    Engine::builder()
        .config(config.host_process_name("scratchpad"))
        .registry(PackageRegistry::with_dir(dir.path()))
        .port_lookup(lookup)
        .build()
        .unwrap()
}

fn engine(dir: &TempDir) -> Engine {
    let config = EngineConfig::new().timeout_ms(500).await_timeout_ms(500);
    engine_with(dir, config, Arc::new(FakeLookup::default()))
}

async fn run(engine: &Engine, source: &str) -> (RunResult, Vec<LogEvent>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let result = engine.handle().run(RunRequest::javascript(source), tx).await;
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    (result, events)
}

/// Run and hand back the live log receiver for lines streamed after the result.
async fn run_streaming(
    engine: &Engine,
    source: &str,
) -> (RunResult, mpsc::UnboundedReceiver<LogEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let result = engine.handle().run(RunRequest::javascript(source), tx).await;
    (result, rx)
}

/// Wait for a streamed line matching `pred`, failing after a few seconds.
async fn wait_for_line(
    rx: &mut mpsc::UnboundedReceiver<LogEvent>,
    pred: impl Fn(&LogEvent) -> bool,
) -> LogEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("log stream closed"),
            }
        }
    })
    .await
    .expect("no matching log line")
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

async fn http_get(port: u16) -> String {
    let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

#[tokio::test(flavor = "multi_thread")]
async fn test_logs_in_call_order() {
    let dir = packages(&[]);
    let engine = engine(&dir);

    let (result, events) = run(&engine, "console.log(1); console.log(2); console.log(3)").await;
    assert!(result.success, "{result:?}");
    assert_eq!(result.output, "1\n2\n3");
    assert_eq!(
        events,
        vec![LogEvent::stdout("1"), LogEvent::stdout("2"), LogEvent::stdout("3")]
    );

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_completion_value_line() {
    let dir = packages(&[]);
    let engine = engine(&dir);

    let (result, _) = run(&engine, "const x = { a: 1, b: [1, 2] }; x").await;
    assert!(result.success);
    assert!(result.output.starts_with("=> "), "{}", result.output);
    assert!(result.output.contains("\"a\": 1"), "{}", result.output);

    let (result, _) = run(&engine, "let y = 1").await;
    assert!(result.success);
    assert_eq!(result.output, "");

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_long_array_is_truncated() {
    let dir = packages(&[]);
    let engine = engine(&dir);

    let (result, _) = run(
        &engine,
        "console.log(Array.from({ length: 150 }, (_, i) => i))",
    )
    .await;
    assert!(result.success);
    assert!(result.output.ends_with("... (150 items)"), "{}", result.output);
    assert!(!result.output.contains("120"));

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cyclic_object_does_not_fail() {
    let dir = packages(&[]);
    let engine = engine(&dir);

    let (result, _) = run(&engine, "const a = { name: 'a' }; a.self = a; console.log(a)").await;
    assert!(result.success, "{result:?}");
    assert!(!result.output.is_empty());

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_uninstalled_module_lists_installed() {
    let dir = packages(&["dayjs"]);
    let engine = engine(&dir);

    let (result, events) = run(&engine, "require('left-pad')").await;
    assert!(!result.success);
    let error = result.error.unwrap();
    assert!(error.contains("left-pad"), "{error}");
    assert!(error.contains("Installed modules: dayjs"), "{error}");
    assert!(events.iter().any(|e| e.channel == LogChannel::Stderr));

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_builtin_modules_load() {
    let dir = packages(&[]);
    let engine = engine(&dir);

    let (result, _) = run(
        &engine,
        "const path = require('node:path'); console.log(path.join('a', 'b', '..', 'c'))",
    )
    .await;
    assert!(result.success, "{result:?}");
    assert_eq!(result.output, "a/c");

    let (result, _) = run(&engine, "require('child_process')").await;
    assert!(!result.success);

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sync_throw_fails_run() {
    let dir = packages(&[]);
    let engine = engine(&dir);

    let (result, events) = run(&engine, "console.log('before'); throw new Error('boom')").await;
    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("Error: boom"));
    assert!(result.output.starts_with("before"));
    assert_eq!(events.last(), Some(&LogEvent::stderr("Error: boom")));

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_returned_rejection_is_logged_not_failed() {
    let dir = packages(&[]);
    let engine = engine(&dir);

    let (result, _) = run(&engine, "return Promise.reject(new Error('x'))").await;
    assert!(result.success, "{result:?}");
    assert!(result.error.is_none());
    assert!(
        result.output.contains("Unhandled Rejection: Error: x"),
        "{}",
        result.output
    );

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_returned_promise_is_awaited() {
    let dir = packages(&[]);
    let engine = engine(&dir);

    let (result, _) = run(
        &engine,
        "return new Promise(resolve => setTimeout(() => resolve(42), 20))",
    )
    .await;
    assert!(result.success);
    assert_eq!(result.output, "=> 42");

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_infinite_loop_times_out() {
    let dir = packages(&[]);
    let config = EngineConfig::new().timeout_ms(200).await_timeout_ms(200);
    let engine = engine_with(&dir, config, Arc::new(FakeLookup::default()));

    let (result, _) = run(&engine, "while (true) {}").await;
    assert!(!result.success);
    assert_eq!(
        result.error.as_deref(),
        Some("Script execution timed out after 200ms")
    );
    assert_eq!(engine.handle().stats().runs_timed_out, 1);

    // The engine is still usable afterwards.
    let (result, _) = run(&engine, "1 + 1").await;
    assert_eq!(result.output, "=> 2");

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_typescript_compile_error() {
    let dir = packages(&[]);
    let engine = engine(&dir);

    let (tx, _rx) = mpsc::unbounded_channel();
    let result = engine
        .handle()
        .run(RunRequest::typescript("const x: number = ;"), tx)
        .await;
    assert!(!result.success);
    assert!(result.error.is_some());

    let (tx, _rx) = mpsc::unbounded_channel();
    let result = engine
        .handle()
        .run(
            RunRequest::typescript("interface P { x: number }\nconst p: P = { x: 3 };\np.x * 2"),
            tx,
        )
        .await;
    assert!(result.success, "{result:?}");
    assert_eq!(result.output, "=> 6");

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_clean_is_idempotent() {
    let dir = packages(&[]);
    let engine = engine(&dir);
    let handle = engine.handle();

    assert!(handle.clean().await);
    assert!(handle.clean().await);
    assert!(!handle.has_listeners());

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_listener_survives_run_and_port_is_reusable() {
    let dir = packages(&[]);
    let engine = engine(&dir);
    let port = free_port();

    let script = |body: &str| {
        format!(
            "require('http').createServer((req, res) => res.end('{body}')).listen({port})"
        )
    };

    let (result, _) = run(&engine, &script("first")).await;
    assert!(result.success, "{result:?}");
    assert_eq!(result.output, "Server started.");
    assert!(engine.handle().has_listeners());
    assert!(http_get(port).await.ends_with("first"));

    let (result, _) = run(&engine, &script("second")).await;
    assert!(result.success, "{result:?}");
    assert!(http_get(port).await.ends_with("second"));

    assert!(engine.handle().clean().await);
    assert!(!engine.handle().has_listeners());

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_kill_port_only_targets_host_process() {
    let dir = packages(&[]);
    let lookup = Arc::new(FakeLookup {
        owners: vec![
            PortOwner {
                pid: 900_001,
                name: "postgres".into(),
            },
            PortOwner {
                pid: 900_002,
                name: "scratchpad".into(),
            },
        ],
        ..Default::default()
    });
    let engine = engine_with(&dir, EngineConfig::new(), lookup.clone());

    let outcome = engine.handle().kill_port(5432).await;
    assert!(outcome.success);
    assert!(outcome.message.contains("skip postgres"), "{}", outcome.message);
    assert_eq!(*lookup.killed.lock(), vec![900_002]);

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_internal_bridge_is_not_a_global() {
    let dir = packages(&[]);
    let engine = engine(&dir);

    let (result, _) = run(
        &engine,
        "console.log(typeof __scratchpad_internal, \
         Object.getOwnPropertyNames(globalThis).filter(n => n.startsWith('__scratchpad_i')).length)",
    )
    .await;
    assert!(result.success, "{result:?}");
    assert_eq!(result.output, "undefined 0");

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_installed_package_default_export_is_unwrapped() {
    let dir = packages(&["greeter"]);
    install(
        dir.path(),
        "greeter",
        "module.exports = { default: function (name) { return 'hi ' + name } };",
    );
    let engine = engine(&dir);

    let (result, _) = run(&engine, "require('greeter')('bob')").await;
    assert!(result.success, "{result:?}");
    assert!(result.output.starts_with("=> "), "{}", result.output);
    assert!(result.output.contains("hi bob"), "{}", result.output);

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bundled_copy_is_preferred() {
    let dir = packages(&["greeter"]);
    install(dir.path(), "greeter", "module.exports = () => 'installed';");
    let bundled = TempDir::new().unwrap();
    install(bundled.path(), "greeter", "module.exports = () => 'bundled';");

    let config = EngineConfig::new()
        .timeout_ms(500)
        .await_timeout_ms(500)
        .bundled_modules_dir(bundled.path());
    let engine = engine_with(&dir, config, Arc::new(FakeLookup::default()));

    let (result, _) = run(&engine, "console.log(require('greeter')())").await;
    assert!(result.success, "{result:?}");
    assert_eq!(result.output, "bundled");

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_throwing_package_reports_load_failure() {
    let dir = packages(&["broken"]);
    install(dir.path(), "broken", "throw new Error('kaput');");
    let engine = engine(&dir);

    let (result, _) = run(&engine, "require('broken')").await;
    assert!(!result.success);
    let error = result.error.unwrap();
    assert!(error.contains("Module \"broken\" failed to load."), "{error}");
    assert!(error.contains("restart the application"), "{error}");
    assert!(error.contains("kaput"), "{error}");

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_closes_listeners() {
    let dir = packages(&[]);
    let engine = engine(&dir);
    let port = free_port();

    let (result, _) = run(
        &engine,
        &format!("require('net').createServer(() => {{}}).listen({port})"),
    )
    .await;
    assert!(result.success, "{result:?}");
    assert!(engine.handle().has_listeners());

    engine.handle().stop();
    tokio::time::timeout(Duration::from_secs(5), async {
        while engine.handle().has_listeners() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("listeners still open after stop");
    assert!(std::net::TcpListener::bind(("127.0.0.1", port)).is_ok());

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_background_callback_is_budgeted() {
    let dir = packages(&[]);
    let config = EngineConfig::new().timeout_ms(200).await_timeout_ms(200);
    let engine = engine_with(&dir, config, Arc::new(FakeLookup::default()));

    let (result, mut rx) = run_streaming(
        &engine,
        "setTimeout(() => { while (true) {} }, 10); console.log('armed')",
    )
    .await;
    assert!(result.success, "{result:?}");
    assert_eq!(result.output, "armed");

    let event = wait_for_line(&mut rx, |e| e.channel == LogChannel::Stderr).await;
    assert_eq!(event.message, "[Error] Callback timed out after 200ms");

    let (result, _) = run(&engine, "'still alive'").await;
    assert!(result.success);

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_late_logs_are_streamed_not_buffered() {
    let dir = packages(&[]);
    let engine = engine(&dir);

    let (result, mut rx) = run_streaming(
        &engine,
        "setTimeout(() => console.log('later'), 20); console.log('now')",
    )
    .await;
    assert!(result.success);
    assert_eq!(result.output, "now");

    let event = wait_for_line(&mut rx, |e| e.message == "later").await;
    assert_eq!(event, LogEvent::stdout("later"));

    engine.shutdown().await;
}
