//! Runspaces: reusable JavaScript execution contexts
//!
//! A Boa `Context` is neither `Send` nor `Sync` and its garbage collector is
//! thread-local, so each runspace lives on a dedicated OS thread for its
//! whole life. The pool only ever holds a [`RunspaceHandle`]: the runspace id
//! plus a channel of jobs for that thread. Work is shipped to the thread as a
//! closure and the result comes back over a oneshot channel, so the async
//! side never blocks a tokio worker on script execution.
//!
//! # Lifecycle
//!
//! - [`RunspaceHandle::spawn`] starts the thread, builds the context and
//!   installs bindings; it resolves once the runspace is ready or failed
//! - dropping the last handle closes the job channel and the thread exits
//!   after finishing its current job
//! - [`RunspaceHandle::retire`] parks a pool permit on the thread, so a
//!   runspace discarded mid-script keeps counting against the pool until
//!   its thread has actually exited
//! - a job that panics poisons the runspace; the pool discards it

use boa_engine::{Context, Script, Source};
use kestrun_common::model::ScriptResponseState;
use kestrun_common::{Diagnostic, KestrunError, Result};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use tokio::sync::{oneshot, OwnedSemaphorePermit};

use crate::resource_limits::ResourceLimits;
use crate::runtime::bindings;
use crate::shared_state::SharedStateStore;

type Job = Box<dyn FnOnce(&mut Runspace) + Send>;

static NEXT_PROGRAM_ID: AtomicU64 = AtomicU64::new(1);

/// A JavaScript handler body, syntax-checked once at registration.
///
/// The snippet is wrapped in a function so it may `return` early and so
/// its top-level declarations do not leak into later requests on the same
/// runspace.
#[derive(Debug, Clone)]
pub struct JsProgram {
    id: u64,
    source: Arc<str>,
}

impl JsProgram {
    /// Wraps and parses the snippet.
    ///
    /// # Errors
    ///
    /// Returns `ScriptCompilation` with the parser's message if the snippet
    /// is not valid JavaScript.
    pub fn compile(code: &str) -> Result<Self> {
        let source: Arc<str> = Arc::from(format!("(function () {{\n{}\n}})();", code));

        let mut ctx = Context::default();
        Script::parse(Source::from_bytes(source.as_ref()), None, &mut ctx).map_err(|e| {
            KestrunError::ScriptCompilation {
                language: "JavaScript".to_string(),
                diagnostics: vec![Diagnostic::error(e.to_string())],
            }
        })?;

        Ok(Self {
            id: NEXT_PROGRAM_ID.fetch_add(1, Ordering::Relaxed),
            source,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Everything a script sees for one request, as plain data.
#[derive(Debug, Clone)]
pub struct ScriptInput {
    pub request: Value,
    pub response: ScriptResponseState,
    pub context: Value,
}

/// What a script left behind.
#[derive(Debug, Clone)]
pub struct ScriptOutput {
    pub response: ScriptResponseState,
    pub call_next: bool,
    pub items: Map<String, Value>,
    pub errors: Vec<String>,
}

/// One JavaScript execution context. Lives on its own thread.
pub struct Runspace {
    id: u64,
    ctx: Context,
    programs: HashMap<u64, Script>,
    runs: u64,
    retired: Option<OwnedSemaphorePermit>,
}

impl Runspace {
    fn new(id: u64, shared: Arc<SharedStateStore>, limits: &ResourceLimits) -> Result<Self> {
        let mut ctx = Context::default();

        if let Some(iterations) = limits.max_loop_iterations {
            ctx.runtime_limits_mut().set_loop_iteration_limit(iterations);
        }
        if let Some(depth) = limits.max_call_depth {
            ctx.runtime_limits_mut().set_recursion_limit(depth);
        }

        bindings::install_bindings(&mut ctx, shared)?;

        Ok(Self {
            id,
            ctx,
            programs: HashMap::new(),
            runs: 0,
            retired: None,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of programs executed on this runspace so far.
    pub fn runs(&self) -> u64 {
        self.runs
    }

    /// Evaluates raw JavaScript in the runspace's global scope.
    pub fn eval(&mut self, code: &str) -> Result<Value> {
        let value = self
            .ctx
            .eval(Source::from_bytes(code))
            .map_err(|e| KestrunError::ScriptRuntime(e.to_string()))?;
        crate::runtime::conversions::js_value_to_json(&value, &mut self.ctx)
    }

    /// Runs a program with `Request`, `Response` and `Context` bound.
    ///
    /// The per-request globals are cleared afterwards on every path.
    ///
    /// # Errors
    ///
    /// Returns `ScriptRuntime` if the program throws or leaves an invalid
    /// response behind.
    pub fn execute(&mut self, program: &JsProgram, input: ScriptInput) -> Result<ScriptOutput> {
        let script = self.program(program)?;

        bindings::bind_request(&mut self.ctx, &input.request, &input.response, &input.context)?;
        self.runs += 1;

        let evaluated = script.evaluate(&mut self.ctx);
        let _ = self.ctx.run_jobs();
        let collected = bindings::collect_request(&mut self.ctx);

        if let Err(e) = bindings::clear_request(&mut self.ctx) {
            tracing::warn!(runspace = self.id, "Failed to clear request globals: {}", e);
        }

        evaluated.map_err(|e| KestrunError::ScriptRuntime(e.to_string()))?;
        let collected = collected?;

        Ok(ScriptOutput {
            response: collected.response.unwrap_or(input.response),
            call_next: collected.call_next,
            items: collected.items,
            errors: collected.errors,
        })
    }

    fn program(&mut self, program: &JsProgram) -> Result<Script> {
        if let Some(script) = self.programs.get(&program.id) {
            return Ok(script.clone());
        }

        let script = Script::parse(Source::from_bytes(program.source.as_ref()), None, &mut self.ctx)
            .map_err(|e| KestrunError::ScriptCompilation {
                language: "JavaScript".to_string(),
                diagnostics: vec![Diagnostic::error(e.to_string())],
            })?;
        self.programs.insert(program.id, script.clone());
        Ok(script)
    }
}

/// The pool's reference to a runspace thread.
pub(crate) struct RunspaceHandle {
    id: u64,
    jobs: mpsc::Sender<Job>,
    poisoned: Arc<AtomicBool>,
}

impl RunspaceHandle {
    /// Starts a runspace thread and waits until its context is ready.
    ///
    /// `live` counts running runspace threads; it is incremented here and
    /// decremented by the thread itself just before it exits.
    ///
    /// # Errors
    ///
    /// Returns `RunspaceCreation` if the thread cannot be spawned or the
    /// context fails to initialize.
    pub(crate) async fn spawn(
        id: u64,
        shared: Arc<SharedStateStore>,
        limits: ResourceLimits,
        live: Arc<AtomicUsize>,
    ) -> Result<Self> {
        let (jobs, receiver) = mpsc::channel::<Job>();
        let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();
        let poisoned = Arc::new(AtomicBool::new(false));
        let thread_poisoned = Arc::clone(&poisoned);
        let thread_live = Arc::clone(&live);

        live.fetch_add(1, Ordering::SeqCst);
        std::thread::Builder::new()
            .name(format!("kestrun-runspace-{}", id))
            .spawn(move || {
                let mut runspace = match Runspace::new(id, shared, &limits) {
                    Ok(runspace) => {
                        let _ = ready_tx.send(Ok(()));
                        runspace
                    }
                    Err(e) => {
                        thread_live.fetch_sub(1, Ordering::SeqCst);
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                tracing::debug!(runspace = id, "Runspace ready");
                while let Ok(job) = receiver.recv() {
                    if std::panic::catch_unwind(AssertUnwindSafe(|| job(&mut runspace))).is_err() {
                        tracing::error!(runspace = id, "Runspace job panicked, closing runspace");
                        thread_poisoned.store(true, Ordering::SeqCst);
                        break;
                    }
                }
                tracing::debug!(runspace = id, runs = runspace.runs(), "Runspace closed");

                // The permit goes back only after the context is gone.
                let retired = runspace.retired.take();
                drop(runspace);
                thread_live.fetch_sub(1, Ordering::SeqCst);
                drop(retired);
            })
            .map_err(|e| {
                live.fetch_sub(1, Ordering::SeqCst);
                KestrunError::RunspaceCreation(format!("Failed to spawn runspace thread: {}", e))
            })?;

        match ready_rx.await {
            Ok(Ok(())) => Ok(Self { id, jobs, poisoned }),
            Ok(Err(e)) => Err(KestrunError::RunspaceCreation(e.to_string())),
            Err(_) => Err(KestrunError::RunspaceCreation(format!(
                "Runspace {} exited during initialization",
                id
            ))),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// True once a job has panicked on this runspace.
    pub(crate) fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    /// Hands `permit` to the runspace thread. It is queued behind any job
    /// still executing and released when the thread exits, which happens
    /// once every handle is dropped. If the thread is already gone the
    /// permit is released immediately.
    pub(crate) fn retire(&self, permit: OwnedSemaphorePermit) {
        let job: Job = Box::new(move |runspace| runspace.retired = Some(permit));
        if self.jobs.send(job).is_err() {
            tracing::debug!(runspace = self.id, "Runspace already closed, releasing its permit");
        }
    }

    /// Runs `f` on the runspace thread and awaits its result.
    ///
    /// # Errors
    ///
    /// Returns `ScriptRuntime` if the runspace has closed or `f` panicked,
    /// otherwise whatever `f` returned.
    pub(crate) async fn run<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Runspace) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move |runspace| {
            let _ = tx.send(f(runspace));
        });

        self.jobs
            .send(job)
            .map_err(|_| KestrunError::ScriptRuntime(format!("Runspace {} is closed", self.id)))?;

        rx.await.map_err(|_| {
            KestrunError::ScriptRuntime(format!("Runspace {} failed while executing", self.id))
        })?
    }
}
