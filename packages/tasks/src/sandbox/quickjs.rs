// ABOUTME: QuickJS script engine with memory, stack and interrupt limits
// ABOUTME: Runs each script inside an async wrapper with an event loop over pending host operations

use std::rc::Rc;

use rquickjs::{CatchResultExt, CaughtError, Context, Function, Persistent, Runtime, Value};
use tracing::debug;

use super::bridge::Wake;
use super::{ExecutionContext, ScriptEngine, ScriptOutcome};
use crate::config::SandboxLimits;

const BOOTSTRAP: &str = include_str!("bootstrap.js");

/// Fresh QuickJS runtime per run, nothing shared between tasks
#[derive(Debug, Clone, Default)]
pub struct QuickJsEngine {
    limits: SandboxLimits,
}

impl QuickJsEngine {
    pub fn new(limits: SandboxLimits) -> Self {
        Self { limits }
    }

    fn run(&self, context: ExecutionContext) -> rquickjs::Result<ScriptOutcome> {
        let ExecutionContext {
            task_id,
            run_id,
            code,
            cancel,
            bridge,
        } = context;

        let runtime = Runtime::new()?;
        runtime.set_memory_limit(self.limits.memory_limit_bytes);
        runtime.set_max_stack_size(self.limits.max_stack_bytes);
        // Polled by QuickJS while executing, so loops that never yield still stop.
        let interrupt = cancel.clone();
        runtime.set_interrupt_handler(Some(Box::new(move || interrupt.is_cancelled())));

        let js = Context::full(&runtime)?;
        let bridge = Rc::new(bridge);

        debug!("Evaluating script for task {} (run {})", task_id, run_id);
        let evaluated = js.with(|ctx| -> rquickjs::Result<Result<Persistent<Function<'static>>, String>> {
            let hostcall_bridge = Rc::clone(&bridge);
            let hostcall = Function::new(ctx.clone(), move |request: String| {
                hostcall_bridge.handle(&request)
            })?;
            ctx.globals().set("__runbox_hostcall", hostcall)?;

            let complete = match ctx.eval::<Function, _>(BOOTSTRAP).catch(&ctx) {
                Ok(complete) => Persistent::save(&ctx, complete),
                Err(e) => {
                    return Ok(Err(format!(
                        "Sandbox bootstrap failed: {}",
                        describe_caught(e)
                    )))
                }
            };

            Ok(ctx
                .eval::<Value, _>(wrap_script(&code))
                .catch(&ctx)
                .map(|_| complete)
                .map_err(describe_caught))
        })?;

        let complete = match evaluated {
            Ok(complete) => complete,
            Err(_) if cancel.is_cancelled() => return Ok(ScriptOutcome::Interrupted),
            Err(message) => return Ok(ScriptOutcome::Failed(message)),
        };

        // Event loop: drain promise jobs, then wait for the next host operation.
        loop {
            if cancel.is_cancelled() {
                return Ok(ScriptOutcome::Interrupted);
            }
            match runtime.execute_pending_job() {
                Ok(true) => continue,
                Ok(false) => {}
                Err(job) => {
                    if cancel.is_cancelled() {
                        return Ok(ScriptOutcome::Interrupted);
                    }
                    let message = job.0.with(|ctx| {
                        describe_caught(CaughtError::from_error(&ctx, rquickjs::Error::Exception))
                    });
                    return Ok(ScriptOutcome::Failed(message));
                }
            }

            if bridge.has_failed() {
                break;
            }

            match bridge.wait_next() {
                Wake::Idle => break,
                Wake::Interrupted => return Ok(ScriptOutcome::Interrupted),
                Wake::Ready { id, reply } => {
                    let delivered = js.with(|ctx| -> rquickjs::Result<Result<(), String>> {
                        let complete = complete.clone().restore(&ctx)?;
                        Ok(complete
                            .call::<_, ()>((id as f64, reply))
                            .catch(&ctx)
                            .map_err(describe_caught))
                    })?;
                    // Only timer callbacks can throw here.
                    if let Err(message) = delivered {
                        if cancel.is_cancelled() {
                            return Ok(ScriptOutcome::Interrupted);
                        }
                        return Ok(ScriptOutcome::Failed(message));
                    }
                }
            }
        }

        if cancel.is_cancelled() {
            return Ok(ScriptOutcome::Interrupted);
        }

        let report = bridge.report();
        let outcome = match report.settled {
            Some(Ok(())) => ScriptOutcome::Completed(report.result),
            Some(Err(message)) => ScriptOutcome::Failed(message),
            None => ScriptOutcome::Failed(
                "Script ended with its top-level promise still pending".to_string(),
            ),
        };
        Ok(outcome)
    }
}

impl ScriptEngine for QuickJsEngine {
    fn execute(&self, context: ExecutionContext) -> ScriptOutcome {
        let cancel = context.cancel.clone();
        match self.run(context) {
            Ok(outcome) => outcome,
            Err(_) if cancel.is_cancelled() => ScriptOutcome::Interrupted,
            Err(e) => ScriptOutcome::Failed(format!("Sandbox engine error: {}", e)),
        }
    }
}

/// Wrap in an async function so top-level `await` works.
fn wrap_script(code: &str) -> String {
    format!(
        "globalThis.__runbox_settle((async () => {{\n{}\n}})());",
        code
    )
}

fn describe_caught(error: CaughtError<'_>) -> String {
    match error {
        CaughtError::Exception(exception) => {
            let name = exception.get::<_, Option<String>>("name").ok().flatten();
            format!(
                "Uncaught {}: {}",
                name.unwrap_or_else(|| "Error".to_string()),
                exception.message().unwrap_or_default()
            )
        }
        CaughtError::Value(value) => format!("Uncaught {:?}", value),
        CaughtError::Error(error) => error.to_string(),
    }
}
