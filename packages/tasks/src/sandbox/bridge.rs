// ABOUTME: Host functions reachable from inside a running script
// ABOUTME: JSON hostcall dispatch plus a table of in-flight, permission-gated, cancellable host operations

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::runtime::Runtime;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::SandboxLimits;
use crate::permissions::{Capability, PermissionBroker, PermissionCheck};

/// Failures raised into the script as named exceptions
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Task was cancelled")]
    Interrupted,

    #[error("Invalid arguments for {op}: {reason}")]
    InvalidArguments { op: String, reason: String },

    #[error("Unknown host operation: {0}")]
    UnknownOperation(String),

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unknown directory: {0}")]
    UnknownDirectory(String),
}

impl BridgeError {
    /// Exception name seen by the script
    pub fn name(&self) -> &'static str {
        match self {
            BridgeError::PermissionDenied(_) => "PermissionDenied",
            BridgeError::Interrupted => "Interrupted",
            BridgeError::InvalidArguments { .. } => "TypeError",
            BridgeError::UnknownOperation(_) => "TypeError",
            BridgeError::Io(_) => "IoError",
            BridgeError::Http(_) => "HttpError",
            BridgeError::UnknownDirectory(_) => "RangeError",
        }
    }
}

type BridgeResult<T> = std::result::Result<T, BridgeError>;

type OperationBody = Pin<Box<dyn Future<Output = BridgeResult<Value>>>>;

/// An in-flight operation; `None` means a timer was cleared before it fired.
type Operation = Pin<Box<dyn Future<Output = (u64, Option<BridgeResult<Value>>)>>>;

/// Directory names accepted by `getDir`
pub const KNOWN_DIRECTORIES: [&str; 9] = [
    "home",
    "temp",
    "config",
    "data",
    "cache",
    "desktop",
    "documents",
    "downloads",
    "app_data",
];

#[derive(Debug, Deserialize)]
struct HostCall {
    op: String,
    #[serde(default)]
    args: Vec<Value>,
}

#[derive(Debug, Default)]
struct RunState {
    result: Option<Value>,
    settled: Option<Result<(), String>>,
}

/// Values recorded by the script during a run
#[derive(Debug, Default, PartialEq)]
pub struct BridgeReport {
    pub result: Option<Value>,
    /// `None` while the top-level script has not finished
    pub settled: Option<Result<(), String>>,
}

/// Next step for the script's event loop
#[derive(Debug, PartialEq)]
pub enum Wake {
    /// Operation `id` finished; `reply` is the JSON encoded outcome
    Ready { id: u64, reply: String },
    /// Nothing left in flight
    Idle,
    /// The task was cancelled while waiting
    Interrupted,
}

/// Host side of one run's bridge
///
/// Asynchronous operations are queued by `start` and driven on a
/// current-thread runtime owned by the worker thread, only while the script
/// is waiting in `wait_next`. Every wait races the task's cancellation token.
pub struct HostBridge {
    task_id: String,
    app_name: String,
    cancel: CancellationToken,
    broker: PermissionBroker,
    http: reqwest::Client,
    state: RefCell<RunState>,
    next_id: Cell<u64>,
    operations: RefCell<FuturesUnordered<Operation>>,
    timers: RefCell<HashMap<u64, CancellationToken>>,
    // Dropped last so pending timers and requests are released first.
    runtime: Runtime,
}

impl HostBridge {
    pub fn new(
        task_id: &str,
        app_name: &str,
        cancel: CancellationToken,
        broker: PermissionBroker,
        limits: &SandboxLimits,
    ) -> BridgeResult<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let http = reqwest::Client::builder()
            .timeout(limits.http_timeout)
            .build()?;

        Ok(Self {
            task_id: task_id.to_string(),
            app_name: app_name.to_string(),
            cancel,
            broker,
            http,
            state: RefCell::new(RunState::default()),
            next_id: Cell::new(0),
            operations: RefCell::new(FuturesUnordered::new()),
            timers: RefCell::new(HashMap::new()),
            runtime,
        })
    }

    /// Handle one JSON encoded hostcall and return the JSON encoded reply.
    ///
    /// Replies are `{"ok": value}` or `{"error": {"name": ..., "message": ...}}`.
    pub fn handle(&self, request: &str) -> String {
        let reply = match serde_json::from_str::<HostCall>(request) {
            Ok(call) => {
                trace!("Hostcall {} from task {}", call.op, self.task_id);
                self.dispatch(&call.op, call.args)
            }
            Err(e) => Err(BridgeError::InvalidArguments {
                op: "hostcall".to_string(),
                reason: e.to_string(),
            }),
        };
        self.encode(reply)
    }

    /// Block until the next operation finishes, nothing is in flight, or
    /// the task is cancelled.
    pub fn wait_next(&self) -> Wake {
        let mut operations = self.operations.borrow_mut();
        loop {
            if operations.is_empty() {
                return Wake::Idle;
            }

            let cancel = self.cancel.clone();
            let finished = self.runtime.block_on(async {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    finished = operations.next() => Some(finished),
                }
            });

            match finished {
                None => return Wake::Interrupted,
                Some(None) => return Wake::Idle,
                Some(Some((id, None))) => trace!("Timer {} of task {} was cleared", id, self.task_id),
                Some(Some((id, Some(result)))) => {
                    self.timers.borrow_mut().remove(&id);
                    return Wake::Ready {
                        id,
                        reply: self.encode(result),
                    };
                }
            }
        }
    }

    /// Whether the top-level script already rejected
    pub fn has_failed(&self) -> bool {
        matches!(self.state.borrow().settled, Some(Err(_)))
    }

    /// What the script recorded so far
    pub fn report(&self) -> BridgeReport {
        let mut state = self.state.borrow_mut();
        BridgeReport {
            result: state.result.take(),
            settled: state.settled.take(),
        }
    }

    fn encode(&self, reply: BridgeResult<Value>) -> String {
        match reply {
            Ok(value) => json!({ "ok": value }).to_string(),
            Err(e) => {
                debug!("Hostcall for task {} failed: {}", self.task_id, e);
                json!({ "error": { "name": e.name(), "message": e.to_string() } }).to_string()
            }
        }
    }

    fn dispatch(&self, op: &str, args: Vec<Value>) -> BridgeResult<Value> {
        let mut args = Args::new(op, args);
        match op {
            "taskId" => Ok(Value::String(self.task_id.clone())),
            "returnValue" => {
                // Later calls overwrite earlier ones; no argument clears the result.
                self.state.borrow_mut().result = args.next_value();
                Ok(Value::Null)
            }
            "getDir" => {
                let name = args.string("name")?;
                let dir = self.resolve_dir(&name)?;
                Ok(Value::String(dir.to_string_lossy().into_owned()))
            }
            "log" => {
                let level = args.string("level")?;
                let message = args.string("message")?;
                self.log(&level, &message);
                Ok(Value::Null)
            }
            "start" => {
                let operation = args.string("operation")?;
                let id = self.start(args.renamed(&operation))?;
                Ok(json!(id))
            }
            "clearTimer" => {
                let id = args.u64("id")?;
                if let Some(timer) = self.timers.borrow_mut().remove(&id) {
                    timer.cancel();
                }
                Ok(Value::Null)
            }
            "env" => {
                let name = args.string("name")?;
                self.run_cancellable(self.permit(Capability::env(name.clone())))?;
                Ok(std::env::var(&name).map(Value::String).unwrap_or(Value::Null))
            }
            "settle" => {
                self.state.borrow_mut().settled = Some(Ok(()));
                Ok(Value::Null)
            }
            "fail" => {
                let message = args.string("message")?;
                self.state.borrow_mut().settled = Some(Err(message));
                Ok(Value::Null)
            }
            other => Err(BridgeError::UnknownOperation(other.to_string())),
        }
    }

    /// Queue an asynchronous operation and return its id.
    ///
    /// Arguments are validated here, so bad calls fail before anything runs.
    fn start(&self, mut args: Args<'_>) -> BridgeResult<u64> {
        if self.cancel.is_cancelled() {
            return Err(BridgeError::Interrupted);
        }
        let id = self.next_id.get() + 1;
        self.next_id.set(id);

        let op = args.op;
        let body: OperationBody = match op {
            "sleep" => {
                let deadline = deadline_after(args.u64("ms")?);
                Box::pin(async move {
                    tokio::time::sleep_until(deadline).await;
                    Ok::<_, BridgeError>(Value::Null)
                })
            }
            "timer" => {
                let deadline = deadline_after(args.u64("ms")?);
                let cleared = CancellationToken::new();
                self.timers.borrow_mut().insert(id, cleared.clone());
                self.operations.borrow_mut().push(Box::pin(async move {
                    tokio::select! {
                        _ = cleared.cancelled() => (id, None),
                        _ = tokio::time::sleep_until(deadline) => (id, Some(Ok(Value::Null))),
                    }
                }));
                return Ok(id);
            }
            "readTextFile" => {
                let path = absolute_path(&args.string("path")?)?;
                let permit = self.permit(Capability::read(path.to_string_lossy()));
                Box::pin(async move {
                    permit.await?;
                    let contents = tokio::fs::read_to_string(&path).await?;
                    Ok::<_, BridgeError>(Value::String(contents))
                })
            }
            "writeTextFile" => {
                let path = absolute_path(&args.string("path")?)?;
                let contents = args.string("contents")?;
                let permit = self.permit(Capability::write(path.to_string_lossy()));
                Box::pin(async move {
                    permit.await?;
                    tokio::fs::write(&path, contents).await?;
                    Ok::<_, BridgeError>(Value::Null)
                })
            }
            "fetchText" => {
                let url = args.string("url")?;
                let parsed = reqwest::Url::parse(&url).map_err(|e| args.invalid(e.to_string()))?;
                let host = parsed.host_str().unwrap_or_default().to_string();
                let permit = self.permit(Capability::net(host));
                let http = self.http.clone();
                Box::pin(async move {
                    permit.await?;
                    let response = http.get(parsed).send().await?.error_for_status()?;
                    Ok::<_, BridgeError>(Value::String(response.text().await?))
                })
            }
            other => return Err(BridgeError::UnknownOperation(other.to_string())),
        };

        self.operations
            .borrow_mut()
            .push(Box::pin(async move { (id, Some(body.await)) }));
        Ok(id)
    }

    /// Ask the broker; waits for a prompt only if nothing is remembered.
    fn permit(&self, capability: Capability) -> impl Future<Output = BridgeResult<()>> + 'static {
        let broker = self.broker.clone();
        let task_id = self.task_id.clone();
        let cancel = self.cancel.clone();
        async move {
            let description = capability.describe();
            match broker.check(&task_id, capability, &cancel).await {
                PermissionCheck::Granted => Ok(()),
                PermissionCheck::Denied => {
                    info!("Task {} was denied {}", task_id, description);
                    Err(BridgeError::PermissionDenied(description))
                }
                PermissionCheck::Cancelled => Err(BridgeError::Interrupted),
            }
        }
    }

    /// Run a synchronous host call's wait to completion on this thread.
    fn run_cancellable<T, F>(&self, operation: F) -> BridgeResult<T>
    where
        F: Future<Output = BridgeResult<T>>,
    {
        if self.cancel.is_cancelled() {
            return Err(BridgeError::Interrupted);
        }
        let cancel = self.cancel.clone();
        self.runtime.block_on(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(BridgeError::Interrupted),
                result = operation => result,
            }
        })
    }

    fn resolve_dir(&self, name: &str) -> BridgeResult<PathBuf> {
        let dir = match name {
            "home" => dirs::home_dir(),
            "temp" => Some(std::env::temp_dir()),
            "config" => dirs::config_dir(),
            "data" => dirs::data_dir(),
            "cache" => dirs::cache_dir(),
            "desktop" => dirs::desktop_dir(),
            "documents" => dirs::document_dir(),
            "downloads" => dirs::download_dir(),
            "app_data" => dirs::data_dir().map(|dir| dir.join(&self.app_name)),
            _ => None,
        };
        dir.ok_or_else(|| {
            BridgeError::UnknownDirectory(format!(
                "{} (expected one of: {})",
                name,
                KNOWN_DIRECTORIES.join(", ")
            ))
        })
    }

    fn log(&self, level: &str, message: &str) {
        let task_id = self.task_id.as_str();
        match level {
            "error" => error!(target: "runbox::script", task_id, "{}", message),
            "warn" => warn!(target: "runbox::script", task_id, "{}", message),
            "debug" => debug!(target: "runbox::script", task_id, "{}", message),
            _ => info!(target: "runbox::script", task_id, "{}", message),
        }
    }
}

fn deadline_after(ms: u64) -> Instant {
    Instant::now() + Duration::from_millis(ms)
}

fn absolute_path(path: &str) -> BridgeResult<PathBuf> {
    let path = PathBuf::from(path);
    if path.is_absolute() {
        Ok(path)
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

/// Positional hostcall arguments
struct Args<'a> {
    op: &'a str,
    values: std::vec::IntoIter<Value>,
}

impl<'a> Args<'a> {
    fn new(op: &'a str, values: Vec<Value>) -> Self {
        Self {
            op,
            values: values.into_iter(),
        }
    }

    /// The remaining arguments, reported under another operation name
    fn renamed<'b>(self, op: &'b str) -> Args<'b> {
        Args {
            op,
            values: self.values,
        }
    }

    fn next_value(&mut self) -> Option<Value> {
        self.values.next()
    }

    fn invalid(&self, reason: String) -> BridgeError {
        BridgeError::InvalidArguments {
            op: self.op.to_string(),
            reason,
        }
    }

    fn string(&mut self, name: &str) -> BridgeResult<String> {
        match self.next_value().unwrap_or(Value::Null) {
            Value::String(s) => Ok(s),
            other => Err(self.invalid(format!("{} must be a string, got {}", name, other))),
        }
    }

    fn u64(&mut self, name: &str) -> BridgeResult<u64> {
        let value = self.next_value().unwrap_or(Value::Null);
        value
            .as_u64()
            .or_else(|| value.as_f64().filter(|v| *v >= 0.0).map(|v| v as u64))
            .ok_or_else(|| self.invalid(format!("{} must be a non-negative number", name)))
    }
}
