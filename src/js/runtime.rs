use anyhow::{Context as AnyhowContext, Result};
use rquickjs::{Context, Ctx, Error as JsError, Function, Runtime, Value};

use crate::config::BridgeConfig;

/// JavaScript runtime backed by QuickJS.
///
/// One engine owns one QuickJS runtime; every document gets its own context inside it.
/// Each context comes with a minimal `console` that forwards to Rust tracing.
pub struct QuickJsEngine {
    runtime: Runtime,
    max_jobs: usize,
}

impl QuickJsEngine {
    pub fn new(config: &BridgeConfig) -> Result<Self> {
        let runtime = Runtime::new().context("failed to create QuickJS runtime")?;
        if let Some(limit) = config.memory_limit_bytes {
            runtime.set_memory_limit(limit);
        }
        Ok(Self {
            runtime,
            max_jobs: config.max_jobs_per_pump.max(1),
        })
    }

    /// Create a fresh context with `console.log` wired up to `tracing`.
    pub fn new_context(&self) -> Result<Context> {
        let context = Context::full(&self.runtime).context("failed to create QuickJS context")?;
        init_console(&context)?;
        Ok(context)
    }

    /// Evaluate a script in `context` and deserialize the result into `V`.
    pub fn eval_in<V>(&self, context: &Context, source: &str, filename: &str) -> Result<V>
    where
        V: for<'js> rquickjs::FromJs<'js>,
    {
        let script = with_source_url(source, filename);
        let value = context.with(|ctx| match ctx.eval::<V, _>(script) {
            Ok(value) => Ok(value),
            Err(JsError::Exception) => Err(anyhow::anyhow!(capture_exception_message(&ctx))),
            Err(err) => Err(anyhow::Error::from(err)),
        })?;

        self.execute_pending_jobs()?;
        Ok(value)
    }

    #[cfg(test)]
    pub(crate) fn set_memory_limit(&self, bytes: usize) {
        self.runtime.set_memory_limit(bytes);
    }

    /// Execute pending promise jobs, up to the configured bound.
    ///
    /// Returns how many jobs ran.
    pub fn execute_pending_jobs(&self) -> Result<usize> {
        let mut job_count = 0;

        while self.runtime.is_job_pending() {
            match self.runtime.execute_pending_job() {
                Ok(true) => {
                    job_count += 1;
                    if job_count >= self.max_jobs {
                        tracing::warn!(
                            target: "quickjs",
                            "Stopped processing jobs after {} iterations (possible infinite loop)",
                            self.max_jobs
                        );
                        break;
                    }
                }
                Ok(false) => break,
                Err(job_exception) => {
                    // A throwing job must not take the rest of the queue down with it.
                    tracing::error!(
                        target: "quickjs",
                        "Job execution error: {:?}",
                        job_exception
                    );
                    break;
                }
            }
        }

        if job_count > 0 {
            tracing::debug!(target: "quickjs", "Executed {} pending jobs", job_count);
        }

        Ok(job_count)
    }
}

fn init_console(context: &Context) -> Result<()> {
    context
        .with(|ctx| {
            let global = ctx.globals();
            let log_fn = Function::new(ctx.clone(), log_from_js)?.with_name("__frontier_log")?;
            global.set("__frontier_log", log_fn)?;
            ctx.eval::<(), _>(CONSOLE_BOOTSTRAP.as_bytes())
        })
        .map_err(anyhow::Error::from)
}

fn with_source_url(source: &str, filename: &str) -> Vec<u8> {
    let mut script = String::with_capacity(source.len() + filename.len() + 32);
    script.push_str(source);
    if !source.ends_with('\n') {
        script.push('\n');
    }
    script.push_str("//# sourceURL=");
    script.push_str(filename);
    script.push('\n');
    script.into_bytes()
}

fn log_from_js(message: String) -> rquickjs::Result<()> {
    tracing::info!(target: "quickjs", message = %message);
    Ok(())
}

/// Take the pending exception off `ctx` and render it for logs and error payloads.
pub(crate) fn capture_exception_message(ctx: &Ctx<'_>) -> String {
    let exception: Value = ctx.catch();

    if let Some(obj) = exception.as_object() {
        if let Ok(message) = obj.get::<_, String>("message") {
            if let Ok(stack) = obj.get::<_, String>("stack") {
                if !stack.is_empty() {
                    return format!("Error: {}\nStack: {}", message, stack);
                }
            }
            return format!("Error: {}", message);
        }
    }

    if let Some(text) = exception.as_string().and_then(|s| s.to_string().ok()) {
        return text;
    }

    format!("{:?}", exception)
}

const CONSOLE_BOOTSTRAP: &str = r#"
(() => {
    const global = globalThis;
    const stringify = (value) => {
        try {
            if (typeof value === 'string') {
                return value;
            }
            if (value === undefined) {
                return 'undefined';
            }
            if (value === null) {
                return 'null';
            }
            if (typeof value === 'object') {
                return JSON.stringify(value);
            }
            return String(value);
        } catch (err) {
            return '[unprintable]';
        }
    };

    const logImpl = (...args) => {
        try {
            global.__frontier_log(args.map(stringify).join(' '));
        } catch (err) {
            // console must never throw
        }
    };

    if (typeof global.console !== 'object' || global.console === null) {
        global.console = {};
    }

    global.console.log = logImpl;
    global.console.error = logImpl;
    global.console.warn = logImpl;
    global.console.info = logImpl;
    global.console.debug = logImpl;
})();
"#;
