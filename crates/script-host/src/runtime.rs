//! QuickJS runtime with sandbox limits

use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rquickjs::convert::Coerced;
use rquickjs::function::{Func, Opt, Rest};
use rquickjs::{Context, Runtime};

use midibridge_engine::ContentEngine;

use crate::{ScriptBridge, ScriptConfig, ScriptError, ScriptResult};

/// Thread-safe cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Runs scripts against a content engine
///
/// Execution happens on the calling thread, which must be the thread that
/// owns the engine.
pub struct ScriptHost {
    config: ScriptConfig,
    cancellation: CancellationToken,
}

impl ScriptHost {
    pub fn new(config: ScriptConfig) -> Self {
        Self {
            config,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &ScriptConfig {
        &self.config
    }

    /// Get the cancellation token for this host
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Cancel a running script
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Execute a script with host API bindings
    ///
    /// `pump` is called whenever the script yields (`time.sleep`,
    /// `midi.poll`) and once after the script finishes.
    pub fn execute(
        &self,
        source: &str,
        engine: &ContentEngine,
        pump: impl FnMut() + 'static,
    ) -> Result<ScriptResult, ScriptError> {
        let bridge = Rc::new(ScriptBridge::new(engine.clone(), pump));
        let result = execute_script(source, &self.config, &self.cancellation, bridge.clone());

        // Let the script's last sends through even if it failed
        bridge.pump();

        match &result {
            Ok(_) => tracing::info!(accesses = bridge.access_count(), "Script finished"),
            Err(e) => tracing::warn!(error = %e, "Script failed"),
        }
        result
    }
}

impl Default for ScriptHost {
    fn default() -> Self {
        Self::new(ScriptConfig::default())
    }
}

fn execute_script(
    source: &str,
    config: &ScriptConfig,
    cancellation: &CancellationToken,
    bridge: Rc<ScriptBridge>,
) -> Result<ScriptResult, ScriptError> {
    // Create runtime with memory limit
    let runtime = Runtime::new().map_err(|e| ScriptError::InitError(e.to_string()))?;
    runtime.set_memory_limit(config.memory_limit);

    // Set up interrupt handler for cancellation and timeout
    let start_time = Instant::now();
    let timeout_ms = config.timeout_ms;
    let cancel_flag = cancellation.cancelled.clone();

    runtime.set_interrupt_handler(Some(Box::new(move || {
        if cancel_flag.load(Ordering::SeqCst) {
            return true;
        }
        start_time.elapsed().as_millis() as u64 > timeout_ms
    })));

    let context = Context::full(&runtime).map_err(|e| ScriptError::InitError(e.to_string()))?;

    let mut return_value = None;

    context.with(|ctx| {
        let globals = ctx.globals();
        create_host_bindings(&ctx, &globals, bridge.clone(), config)?;

        match ctx.eval::<rquickjs::Value, _>(source) {
            Ok(val) => {
                if !val.is_undefined() && !val.is_null() {
                    if let Ok(s) = val.get::<String>() {
                        return_value = Some(s);
                    } else if let Ok(n) = val.get::<f64>() {
                        return_value = Some(n.to_string());
                    } else if let Ok(b) = val.get::<bool>() {
                        return_value = Some(b.to_string());
                    }
                }
                Ok(())
            }
            Err(e) => {
                if cancellation.is_cancelled() {
                    Err(ScriptError::Cancelled)
                } else if start_time.elapsed().as_millis() as u64 > timeout_ms {
                    Err(ScriptError::Timeout)
                } else {
                    Err(ScriptError::JsError(describe_error(&ctx, e)))
                }
            }
        }
    })?;

    Ok(ScriptResult {
        output: bridge.output(),
        return_value,
        accesses: bridge.access_count(),
    })
}

/// Prefer the thrown value's message over the generic exception error
fn describe_error(ctx: &rquickjs::Ctx<'_>, error: rquickjs::Error) -> String {
    if matches!(error, rquickjs::Error::Exception) {
        let thrown = ctx.catch();
        if let Some(message) = thrown.as_exception().and_then(|e| e.message()) {
            return message;
        }
        if let Ok(text) = thrown.get::<String>() {
            return text;
        }
    }
    error.to_string()
}

/// Create host API bindings in the JavaScript context
fn create_host_bindings<'js>(
    ctx: &rquickjs::Ctx<'js>,
    globals: &rquickjs::Object<'js>,
    bridge: Rc<ScriptBridge>,
    config: &ScriptConfig,
) -> Result<(), ScriptError> {
    // Create console object with log function
    let console = rquickjs::Object::new(ctx.clone())
        .map_err(|e| ScriptError::InitError(e.to_string()))?;

    let bridge_clone = bridge.clone();
    let log_fn = Func::from(move |args: Rest<Coerced<String>>| {
        let parts: Vec<String> = args.0.into_iter().map(|arg| arg.0).collect();
        bridge_clone.print(&parts.join(" "));
    });

    console.set("log", log_fn)
        .map_err(|e| ScriptError::InitError(e.to_string()))?;

    globals.set("console", console)
        .map_err(|e| ScriptError::InitError(e.to_string()))?;

    // Create time namespace
    let time = rquickjs::Object::new(ctx.clone())
        .map_err(|e| ScriptError::InitError(e.to_string()))?;

    let max_sleep = config.max_sleep_ms;
    let bridge_clone = bridge.clone();
    let sleep_fn = Func::from(move |ms: u64| {
        let duration = ms.min(max_sleep);
        if duration > 0 {
            std::thread::sleep(Duration::from_millis(duration));
        }
        bridge_clone.pump();
    });

    time.set("sleep", sleep_fn)
        .map_err(|e| ScriptError::InitError(e.to_string()))?;

    let bridge_clone = bridge.clone();
    let now_fn = Func::from(move || -> f64 { bridge_clone.engine().now() });

    time.set("now", now_fn)
        .map_err(|e| ScriptError::InitError(e.to_string()))?;

    globals.set("time", time)
        .map_err(|e| ScriptError::InitError(e.to_string()))?;

    // Create midi namespace
    let midi = rquickjs::Object::new(ctx.clone())
        .map_err(|e| ScriptError::InitError(e.to_string()))?;

    let bridge_clone = bridge.clone();
    let request_fn = Func::from(move |sysex: Opt<bool>| -> Option<f64> {
        bridge_clone
            .request_access(sysex.0.unwrap_or(false))
            .map(|id| id as f64)
    });

    midi.set("requestAccess", request_fn)
        .map_err(|e| ScriptError::InitError(e.to_string()))?;

    let bridge_clone = bridge.clone();
    let ports_fn = Func::from(move |access: u64, kind: String| -> Option<String> {
        bridge_clone.ports(access, &kind)
    });

    midi.set("ports", ports_fn)
        .map_err(|e| ScriptError::InitError(e.to_string()))?;

    let bridge_clone = bridge.clone();
    let send_fn = Func::from(move |access: u64, port_id: String, bytes: Vec<i32>| -> bool {
        bridge_clone.send(access, &port_id, &bytes)
    });

    midi.set("send", send_fn)
        .map_err(|e| ScriptError::InitError(e.to_string()))?;

    let bridge_clone = bridge;
    let poll_fn = Func::from(move |access: u64| -> Option<String> { bridge_clone.poll(access) });

    midi.set("poll", poll_fn)
        .map_err(|e| ScriptError::InitError(e.to_string()))?;

    globals.set("midi", midi)
        .map_err(|e| ScriptError::InitError(e.to_string()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    use midibridge_engine::{ContentEndpoint, InMemoryChannel, LocalBridge, PayloadReceiver};
    use midibridge_platform::{EndpointSpec, MemoryBackend};
    use midibridge_policy::Policy;
    use midibridge_protocol::{decode, ContentMessage, PortId};

    fn detached_engine() -> (ContentEngine, midibridge_engine::HostEndpoint) {
        let (host, content): (_, ContentEndpoint) = InMemoryChannel::new();
        (ContentEngine::new(content, Policy::default()), host)
    }

    #[test]
    fn test_simple_script() {
        let host = ScriptHost::default();
        let (engine, _host) = detached_engine();

        let result = host.execute("1 + 1", &engine, || {}).unwrap();
        assert_eq!(result.return_value, Some("2".to_string()));
        assert_eq!(result.accesses, 0);
    }

    #[test]
    fn test_console_log() {
        let host = ScriptHost::default();
        let (engine, endpoint) = detached_engine();

        let result = host
            .execute("console.log('hello', 'world', 42); 42", &engine, || {})
            .unwrap();
        assert_eq!(result.output, "hello world 42");
        assert_eq!(result.return_value, Some("42".to_string()));

        let msg: ContentMessage = decode(&endpoint.try_recv().unwrap().unwrap()).unwrap();
        assert_eq!(msg, ContentMessage::log("hello world 42"));
    }

    #[test]
    fn test_timeout() {
        let config = ScriptConfig {
            timeout_ms: 100,
            ..Default::default()
        };
        let host = ScriptHost::new(config);
        let (engine, _host) = detached_engine();

        let result = host.execute("while(true) {}", &engine, || {});
        assert!(matches!(result, Err(ScriptError::Timeout)));
    }

    #[test]
    fn test_cancellation() {
        let host = ScriptHost::default();
        let (engine, _host) = detached_engine();
        host.cancel();

        let result = host.execute("while(true) {}", &engine, || {});
        assert!(matches!(result, Err(ScriptError::Cancelled)));
    }

    #[test]
    fn test_cancellation_token() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_thrown_error_message() {
        let host = ScriptHost::default();
        let (engine, _host) = detached_engine();

        match host.execute("throw new Error('no synth')", &engine, || {}) {
            Err(ScriptError::JsError(message)) => assert!(message.contains("no synth")),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_sleep_pumps() {
        let host = ScriptHost::new(ScriptConfig {
            max_sleep_ms: 5,
            ..Default::default()
        });
        let (engine, _host) = detached_engine();
        let pumps = Rc::new(Cell::new(0));
        let counter = pumps.clone();

        let started = Instant::now();
        host.execute(
            "time.sleep(60000); time.sleep(0); time.now() >= 0",
            &engine,
            move || counter.set(counter.get() + 1),
        )
        .unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        // Two sleeps plus the final flush
        assert_eq!(pumps.get(), 3);
    }

    #[test]
    fn test_midi_script() {
        let backend = MemoryBackend::new();
        backend.plug(
            "Synth",
            vec![EndpointSpec::named("Synth Keys").with_id(1)],
            vec![EndpointSpec::named("Synth Sound").with_id(2)],
        );
        let local = Rc::new(LocalBridge::new(backend.clone(), Policy::default()));
        let pump = local.clone();
        let injected = Cell::new(false);

        let host = ScriptHost::default();
        let result = host
            .execute(
                r#"
                    const access = midi.requestAccess();
                    let events = JSON.parse(midi.poll(access));
                    const outputs = JSON.parse(midi.ports(access, "output"));
                    midi.send(access, outputs[0].id, [0x90, 60, 100]);
                    events = events.concat(JSON.parse(midi.poll(access)));
                    console.log("seen", events.length);
                    events.filter(e => e.type === "midimessage").length
                "#,
                local.engine(),
                move || {
                    pump.poll().unwrap();
                    if !injected.replace(true) {
                        pump.inject(&PortId::from("1"), vec![0xB0, 1, 64]);
                    }
                },
            )
            .unwrap();

        assert_eq!(result.accesses, 1);
        assert_eq!(result.output, "seen 3");
        assert_eq!(result.return_value, Some("1".to_string()));

        let sent = backend.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].unique_id, 2);
        assert_eq!(sent[0].data, vec![0x90, 60, 100]);
    }
}
