//! Rhai delegate
//!
//! Rhai handlers are compiled to an AST when the route is registered, against
//! the host API below plus any caller-supplied modules. Every delegate owns
//! its engine, so modules registered for one route are invisible to others.
//!
//! # Script API
//!
//! - `Request` - object map (`Method`, `Path`, `Query`, `Headers`, `Body`,
//!   `Form`, `RouteValues`, `RemoteAddr`)
//! - `Response` - `write_text`, `write_json`, `write_binary`, `redirect`,
//!   `set_status`, `set_header`, `set_content_type`,
//!   `set_content_disposition`, `status`
//! - `Context` - `trace_id`, `user`, `get_item`, `set_item`, `next()`
//! - `shared_get`, `shared_set`, `shared_increment`, `shared_remove`,
//!   `shared_has`
//! - `print` / `debug` go to the log
//!
//! The `http` module (`status_text`, `is_text_mime`) is imported by default.
//!
//! Rhai runs on a blocking thread. A watchdog installed through
//! `on_progress` aborts the script once the execution timeout passes or the
//! request is cancelled.

use ::rhai::serde::{from_dynamic, to_dynamic};
use ::rhai::{Blob, Dynamic, Engine, EvalAltResult, ImmutableString, Module, ParseError, Position, Scope, AST};
use futures_util::future::BoxFuture;
use kestrun_common::model::{mime, ContentDisposition, DispositionType, Redirect, ScriptBody, ScriptResponseState};
use kestrun_common::{Diagnostic, KestrunError, Result};
use serde_json::{Map, Value};
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::context::KestrunContext;
use crate::languages::{CompileOptions, Delegate, ScriptLanguage};
use crate::middleware::Next;
use crate::resource_limits::ResourceLimits;
use crate::runtime::RunspaceLease;
use crate::shared_state::SharedStateStore;

type RhaiResult<T> = std::result::Result<T, Box<EvalAltResult>>;

/// Modules imported into every Rhai handler.
pub const DEFAULT_IMPORTS: &[&str] = &["http"];

const TIMED_OUT: i64 = 1;
const CANCELLED: i64 = 2;

/// How often, in operations, the watchdog looks at the clock.
const WATCHDOG_INTERVAL: u64 = 512;

/// Extra wait on the blocking task beyond the execution timeout.
const WATCHDOG_GRACE: Duration = Duration::from_millis(250);

struct Watchdog {
    deadline: Instant,
    cancellation: CancellationToken,
}

thread_local! {
    static WATCHDOG: RefCell<Option<Watchdog>> = const { RefCell::new(None) };
}

/// Clears the thread's watchdog when the script finishes. Blocking threads
/// are reused, so a stale watchdog would abort an unrelated run.
struct WatchdogGuard;

impl Watchdog {
    fn arm(self) -> WatchdogGuard {
        WATCHDOG.with(|cell| *cell.borrow_mut() = Some(self));
        WatchdogGuard
    }
}

impl Drop for WatchdogGuard {
    fn drop(&mut self) {
        WATCHDOG.with(|cell| *cell.borrow_mut() = None);
    }
}

fn check_watchdog(operations: u64) -> Option<Dynamic> {
    if operations % WATCHDOG_INTERVAL != 0 {
        return None;
    }
    WATCHDOG.with(|cell| match cell.borrow().as_ref() {
        Some(w) if w.cancellation.is_cancelled() => Some(Dynamic::from_int(CANCELLED)),
        Some(w) if Instant::now() >= w.deadline => Some(Dynamic::from_int(TIMED_OUT)),
        _ => None,
    })
}

fn runtime_error(message: impl Into<String>) -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorRuntime(Dynamic::from(message.into()), Position::NONE))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The `Response` object.
#[derive(Clone)]
pub struct RhaiResponse(Arc<Mutex<ScriptResponseState>>);

impl RhaiResponse {
    fn new(state: ScriptResponseState) -> Self {
        Self(Arc::new(Mutex::new(state)))
    }

    fn state(&self) -> ScriptResponseState {
        lock(&self.0).clone()
    }

    fn write_text(&mut self, text: &str, content_type: &str) {
        let mut state = lock(&self.0);
        state.body = Some(ScriptBody::Text { text: text.to_string() });
        state.content_type = Some(content_type.to_string());
    }

    fn write_json(&mut self, value: &Dynamic) -> RhaiResult<()> {
        let json: Value = from_dynamic(value)?;
        self.write_text(&json.to_string(), mime::APPLICATION_JSON);
        Ok(())
    }

    fn write_binary(&mut self, bytes: Blob, content_type: &str) {
        let mut state = lock(&self.0);
        state.body = Some(ScriptBody::Binary { bytes });
        state.content_type = Some(content_type.to_string());
    }

    fn redirect(&mut self, url: &str, status: i64) -> RhaiResult<()> {
        let status = status_code(status)?;
        let mut state = lock(&self.0);
        state.redirect = Some(Redirect {
            url: url.to_string(),
            status,
        });
        state.body = None;
        Ok(())
    }

    fn set_status(&mut self, status: i64) -> RhaiResult<()> {
        lock(&self.0).status = status_code(status)?;
        Ok(())
    }

    fn set_header(&mut self, name: &str, value: &str) {
        lock(&self.0).headers.insert(name.to_ascii_lowercase(), value.to_string());
    }

    fn set_content_type(&mut self, content_type: &str) {
        lock(&self.0).content_type = Some(content_type.to_string());
    }

    fn set_content_disposition(&mut self, kind: &str, file_name: &str) -> RhaiResult<()> {
        let kind = match kind.to_ascii_lowercase().as_str() {
            "inline" => DispositionType::Inline,
            "attachment" => DispositionType::Attachment,
            "none" => DispositionType::None,
            other => return Err(runtime_error(format!("unknown content disposition '{}'", other))),
        };
        let file_name = (!file_name.is_empty()).then(|| file_name.to_string());
        lock(&self.0).content_disposition = Some(ContentDisposition::new(kind, file_name));
        Ok(())
    }

    fn status(&mut self) -> i64 {
        i64::from(lock(&self.0).status)
    }
}

fn status_code(status: i64) -> RhaiResult<u16> {
    u16::try_from(status)
        .ok()
        .filter(|s| (100..=999).contains(s))
        .ok_or_else(|| runtime_error(format!("invalid status code {}", status)))
}

/// The `Context` object.
#[derive(Clone)]
pub struct RhaiContext {
    trace_id: ImmutableString,
    user: Dynamic,
    items: Arc<Mutex<Map<String, Value>>>,
    call_next: Arc<AtomicBool>,
}

impl RhaiContext {
    fn new(ctx: &KestrunContext) -> RhaiResult<Self> {
        Ok(Self {
            trace_id: ctx.trace_id.as_str().into(),
            user: to_dynamic(ctx.user_value())?,
            items: Arc::new(Mutex::new(ctx.items.clone())),
            call_next: Arc::new(AtomicBool::new(false)),
        })
    }

    fn get_item(&mut self, key: &str) -> RhaiResult<Dynamic> {
        match lock(&self.items).get(key) {
            Some(value) => to_dynamic(value),
            None => Ok(Dynamic::UNIT),
        }
    }

    fn set_item(&mut self, key: &str, value: Dynamic) -> RhaiResult<()> {
        let value: Value = from_dynamic(&value)?;
        lock(&self.items).insert(key.to_string(), value);
        Ok(())
    }
}

fn register_response_api(engine: &mut Engine) {
    engine
        .register_type_with_name::<RhaiResponse>("Response")
        .register_fn("write_text", |r: &mut RhaiResponse, text: &str| r.write_text(text, mime::TEXT_PLAIN))
        .register_fn("write_text", RhaiResponse::write_text)
        .register_fn("write_json", |r: &mut RhaiResponse, value: Dynamic| r.write_json(&value))
        .register_fn("write_json", |r: &mut RhaiResponse, value: Dynamic, status: i64| {
            r.write_json(&value)?;
            r.set_status(status)
        })
        .register_fn("write_binary", |r: &mut RhaiResponse, bytes: Blob| {
            r.write_binary(bytes, mime::APPLICATION_OCTET_STREAM)
        })
        .register_fn("write_binary", RhaiResponse::write_binary)
        .register_fn("redirect", |r: &mut RhaiResponse, url: &str| r.redirect(url, 302))
        .register_fn("redirect", RhaiResponse::redirect)
        .register_fn("set_status", RhaiResponse::set_status)
        .register_fn("set_header", RhaiResponse::set_header)
        .register_fn("set_content_type", RhaiResponse::set_content_type)
        .register_fn("set_content_disposition", |r: &mut RhaiResponse, kind: &str| {
            r.set_content_disposition(kind, "")
        })
        .register_fn("set_content_disposition", RhaiResponse::set_content_disposition)
        .register_get("status", RhaiResponse::status);

    engine
        .register_type_with_name::<RhaiContext>("Context")
        .register_get("trace_id", |c: &mut RhaiContext| c.trace_id.clone())
        .register_get("user", |c: &mut RhaiContext| c.user.clone())
        .register_fn("get_item", RhaiContext::get_item)
        .register_fn("set_item", RhaiContext::set_item)
        .register_fn("next", |c: &mut RhaiContext| c.call_next.store(true, Ordering::SeqCst));
}

fn register_shared_state(engine: &mut Engine, shared: &Arc<SharedStateStore>) {
    let store = Arc::clone(shared);
    engine.register_fn("shared_get", move |name: &str| -> RhaiResult<Dynamic> {
        match store.try_get(name) {
            Some(value) => to_dynamic(value.to_json()),
            None => Ok(Dynamic::UNIT),
        }
    });

    let store = Arc::clone(shared);
    engine.register_fn("shared_set", move |name: &str, value: Dynamic| -> RhaiResult<bool> {
        let value: Value = from_dynamic(&value)?;
        store.set_json(name, value).map_err(|e| runtime_error(e.to_string()))
    });

    let store = Arc::clone(shared);
    engine.register_fn("shared_increment", move |name: &str, key: &str, delta: i64| -> RhaiResult<i64> {
        store.increment(name, Some(key), delta).map_err(|e| runtime_error(e.to_string()))
    });

    let store = Arc::clone(shared);
    engine.register_fn("shared_increment", move |name: &str, delta: i64| -> RhaiResult<i64> {
        store.increment(name, None, delta).map_err(|e| runtime_error(e.to_string()))
    });

    let store = Arc::clone(shared);
    engine.register_fn("shared_remove", move |name: &str| store.remove(name));

    let store = Arc::clone(shared);
    engine.register_fn("shared_has", move |name: &str| store.contains(name));
}

fn http_module() -> Module {
    let mut module = Module::new();
    module.set_native_fn("status_text", |code: i64| -> RhaiResult<String> {
        let reason = u16::try_from(code)
            .ok()
            .and_then(|c| hyper::StatusCode::from_u16(c).ok())
            .and_then(|s| s.canonical_reason())
            .unwrap_or("");
        Ok(reason.to_string())
    });
    module.set_native_fn("is_text_mime", |content_type: &str| -> RhaiResult<bool> {
        Ok(mime::is_text_based(content_type))
    });
    module
}

fn parse_diagnostic(err: &ParseError, origin: Option<&str>) -> Diagnostic {
    let message = match origin {
        Some(module) => format!("{} (in module '{}')", err.0, module),
        None => err.0.to_string(),
    };
    Diagnostic::error(message).at(err.1.line(), err.1.position())
}

fn eval_diagnostic(err: &EvalAltResult, module: &str) -> Diagnostic {
    let position = err.position();
    Diagnostic::error(format!("{} (in module '{}')", err, module)).at(position.line(), position.position())
}

/// Builds the engine for one handler and resolves its modules.
fn build_engine(options: &CompileOptions, limits: &ResourceLimits, shared: &Arc<SharedStateStore>) -> Result<Engine> {
    let mut engine = Engine::new();

    if let Some(operations) = limits.max_operations {
        engine.set_max_operations(operations);
    }
    if let Some(depth) = limits.max_call_depth {
        engine.set_max_call_levels(depth);
    }
    engine.on_progress(check_watchdog);
    engine.on_print(|text| tracing::info!(target: "kestrun::rhai", "{}", text));
    engine.on_debug(|text, _source, position| {
        tracing::debug!(target: "kestrun::rhai", line = position.line(), "{}", text);
    });

    register_response_api(&mut engine);
    register_shared_state(&mut engine, shared);

    let http: Arc<Module> = Arc::new(http_module());
    engine.register_static_module("http", Arc::clone(&http));

    let mut diagnostics = Vec::new();
    let mut references = std::collections::BTreeMap::new();
    for (name, source) in &options.references {
        let ast = match engine.compile(source) {
            Ok(ast) => ast,
            Err(e) => {
                diagnostics.push(parse_diagnostic(&e, Some(name)));
                continue;
            }
        };
        match Module::eval_ast_as_new(Scope::new(), &ast, &engine) {
            Ok(module) => {
                let module = Arc::new(module);
                engine.register_static_module(name.as_str(), Arc::clone(&module));
                references.insert(name.as_str(), module);
            }
            Err(e) => diagnostics.push(eval_diagnostic(&e, name)),
        }
    }

    let imports = DEFAULT_IMPORTS.iter().copied().chain(options.imports.iter().map(String::as_str));
    for import in imports {
        if import == "http" {
            engine.register_global_module(Arc::clone(&http));
        } else if let Some(module) = references.get(import) {
            engine.register_global_module(Arc::clone(module));
        } else if !options.references.contains_key(import) {
            diagnostics.push(Diagnostic::error(format!("unknown import '{}'", import)));
        }
    }

    if diagnostics.is_empty() {
        Ok(engine)
    } else {
        Err(KestrunError::ScriptCompilation {
            language: ScriptLanguage::Rhai.to_string(),
            diagnostics,
        })
    }
}

pub struct RhaiDelegate {
    engine: Arc<Engine>,
    ast: Arc<AST>,
    limits: ResourceLimits,
}

impl RhaiDelegate {
    /// Compiles `code` with its modules.
    ///
    /// # Errors
    ///
    /// `ScriptCompilation` carrying a diagnostic per failing module, unknown
    /// import or syntax error, each with a line and column where known.
    pub fn compile(
        code: &str,
        options: &CompileOptions,
        limits: ResourceLimits,
        shared: Arc<SharedStateStore>,
    ) -> Result<Self> {
        let engine = build_engine(options, &limits, &shared)?;
        let ast = engine.compile(code).map_err(|e| KestrunError::ScriptCompilation {
            language: ScriptLanguage::Rhai.to_string(),
            diagnostics: vec![parse_diagnostic(&e, None)],
        })?;

        tracing::debug!(
            imports = options.imports.len(),
            references = options.references.len(),
            "Compiled Rhai handler"
        );

        Ok(Self {
            engine: Arc::new(engine),
            ast: Arc::new(ast),
            limits,
        })
    }

    fn eval_error(&self, err: EvalAltResult) -> KestrunError {
        match err {
            EvalAltResult::ErrorTerminated(reason, _) if reason.as_int() == Ok(CANCELLED) => KestrunError::Cancelled,
            EvalAltResult::ErrorTerminated(..) => KestrunError::ExecutionTimeout(self.limits.execution_timeout_ms()),
            other => KestrunError::ScriptRuntime(other.to_string()),
        }
    }
}

impl Delegate for RhaiDelegate {
    fn language(&self) -> ScriptLanguage {
        ScriptLanguage::Rhai
    }

    fn invoke<'a>(
        &'a self,
        ctx: &'a mut KestrunContext,
        _runspace: Option<RunspaceLease>,
        next: Next,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let to_runtime = |e: Box<EvalAltResult>| KestrunError::ScriptRuntime(e.to_string());
            let request = to_dynamic(ctx.request.to_script_value()).map_err(to_runtime)?;
            let response = RhaiResponse::new(ctx.response.to_script_state());
            let context = RhaiContext::new(ctx).map_err(to_runtime)?;

            let timeout = self.limits.execution_timeout;
            let watchdog = Watchdog {
                deadline: Instant::now() + timeout,
                cancellation: ctx.cancellation.clone(),
            };
            let engine = Arc::clone(&self.engine);
            let ast = Arc::clone(&self.ast);
            let (script_response, script_context) = (response.clone(), context.clone());

            let task = tokio::task::spawn_blocking(move || {
                let _armed = watchdog.arm();
                let mut scope = Scope::new();
                scope.push_constant_dynamic("Request", request);
                scope.push("Response", script_response);
                scope.push("Context", script_context);
                engine.run_ast_with_scope(&mut scope, &ast)
            });

            match tokio::time::timeout(timeout + WATCHDOG_GRACE, task).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => return Err(self.eval_error(*e)),
                Ok(Err(e)) => return Err(KestrunError::ScriptRuntime(format!("Rhai handler aborted: {}", e))),
                Err(_) => return Err(KestrunError::ExecutionTimeout(self.limits.execution_timeout_ms())),
            }

            ctx.response.apply_script_state(response.state());
            ctx.items = lock(&context.items).clone();

            if context.call_next.load(Ordering::SeqCst) {
                next.run(ctx).await?;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::languages::NativeDelegate;
    use crate::middleware::ScriptExecutionMiddleware;
    use crate::runtime::{PoolConfig, RunspacePool};
    use bytes::Bytes;
    use kestrun_common::model::{HeaderMap, ResponseBody};
    use kestrun_common::RequestModel;
    use serde_json::json;

    async fn middleware() -> ScriptExecutionMiddleware {
        let pool = RunspacePool::new(
            PoolConfig::new(0, 1),
            ResourceLimits::default(),
            Arc::new(SharedStateStore::new()),
        )
        .await
        .unwrap();
        ScriptExecutionMiddleware::new(pool)
    }

    fn compile(code: &str) -> RhaiDelegate {
        RhaiDelegate::compile(
            code,
            &CompileOptions::new(),
            ResourceLimits::default(),
            Arc::new(SharedStateStore::new()),
        )
        .unwrap()
    }

    fn context(query: Option<&str>, shared: Arc<SharedStateStore>) -> KestrunContext {
        let request = RequestModel::from_parts("GET", "/", query, HeaderMap::new(), Bytes::new());
        KestrunContext::new(request, shared)
    }

    async fn run(delegate: &RhaiDelegate, ctx: &mut KestrunContext) -> Result<()> {
        let mw = middleware().await;
        delegate.invoke(ctx, None, Next::terminal(mw)).await
    }

    fn text(ctx: &KestrunContext) -> &str {
        match ctx.response.body() {
            ResponseBody::Text(text) => text,
            other => panic!("expected text body, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_json_response() {
        let delegate = compile(r#"Response.write_json(#{ Body: "Hello " + Request.Query.name });"#);
        let mut ctx = context(Some("name=Rhai"), Arc::new(SharedStateStore::new()));

        run(&delegate, &mut ctx).await.unwrap();

        assert_eq!(ctx.response.content_type(), Some("application/json"));
        let body: Value = serde_json::from_str(text(&ctx)).unwrap();
        assert_eq!(body, json!({"Body": "Hello Rhai"}));
    }

    #[tokio::test]
    async fn test_response_methods() {
        let delegate = compile(
            r#"
            Response.set_header("X-Kind", "rhai");
            Response.set_content_disposition("attachment", "report 1.csv");
            Response.write_text("a,b", "text/csv");
            Response.set_status(201);
            "#,
        );
        let mut ctx = context(None, Arc::new(SharedStateStore::new()));

        run(&delegate, &mut ctx).await.unwrap();

        assert_eq!(ctx.response.status(), 201);
        assert_eq!(ctx.response.content_type(), Some("text/csv"));
        assert_eq!(ctx.response.headers().get("x-kind"), Some("rhai"));
        assert_eq!(
            ctx.response.content_disposition().header_value().as_deref(),
            Some("attachment; filename=\"report%201.csv\"")
        );
    }

    #[tokio::test]
    async fn test_redirect_defaults_to_302() {
        let delegate = compile(r#"Response.redirect("/elsewhere");"#);
        let mut ctx = context(None, Arc::new(SharedStateStore::new()));

        run(&delegate, &mut ctx).await.unwrap();
        assert_eq!(ctx.response.effective_status(), 302);
        assert_eq!(ctx.response.redirect().map(|r| r.url.as_str()), Some("/elsewhere"));
    }

    #[test]
    fn test_compile_error_has_location() {
        let err = RhaiDelegate::compile(
            "let x = 1;\nlet y = ;",
            &CompileOptions::new(),
            ResourceLimits::default(),
            Arc::new(SharedStateStore::new()),
        )
        .err()
        .unwrap();

        let diagnostics = err.diagnostics();
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].line, Some(2));
        assert!(diagnostics[0].column.is_some());
    }

    #[tokio::test]
    async fn test_references_and_imports() {
        let options = CompileOptions::new()
            .with_reference("greet", r#"fn hello(name) { "Hello " + name }"#)
            .with_import("greet");
        let delegate = RhaiDelegate::compile(
            r#"Response.write_text(greet::hello("A") + " / " + hello("B") + " / " + status_text(404));"#,
            &options,
            ResourceLimits::default(),
            Arc::new(SharedStateStore::new()),
        )
        .unwrap();

        let mut ctx = context(None, Arc::new(SharedStateStore::new()));
        run(&delegate, &mut ctx).await.unwrap();
        assert_eq!(text(&ctx), "Hello A / Hello B / Not Found");
    }

    #[test]
    fn test_bad_reference_and_unknown_import_are_reported() {
        let options = CompileOptions::new()
            .with_reference("broken", "fn oops( {")
            .with_import("missing");
        let err = RhaiDelegate::compile(
            "1",
            &options,
            ResourceLimits::default(),
            Arc::new(SharedStateStore::new()),
        )
        .err()
        .unwrap();

        let messages: Vec<_> = err.diagnostics().iter().map(|d| d.message.clone()).collect();
        assert_eq!(messages.len(), 2);
        assert!(messages[0].contains("broken"));
        assert!(messages[1].contains("unknown import 'missing'"));
    }

    #[tokio::test]
    async fn test_shared_state_increment() {
        let shared = Arc::new(SharedStateStore::new());
        shared.set_json("Visits", json!({"Count": 0})).unwrap();
        let delegate = RhaiDelegate::compile(
            r#"let n = shared_increment("Visits", "Count", 1); Response.write_text(n.to_string());"#,
            &CompileOptions::new(),
            ResourceLimits::default(),
            Arc::clone(&shared),
        )
        .unwrap();

        for expected in 1..=3 {
            let mut ctx = context(None, Arc::clone(&shared));
            run(&delegate, &mut ctx).await.unwrap();
            assert_eq!(text(&ctx), expected.to_string());
        }
    }

    #[tokio::test]
    async fn test_shared_set_rejects_primitives() {
        let delegate = compile(r#"shared_set("count", 5);"#);
        let mut ctx = context(None, Arc::new(SharedStateStore::new()));

        let err = run(&delegate, &mut ctx).await.unwrap_err();
        assert!(matches!(err, KestrunError::ScriptRuntime(_)));
    }

    #[tokio::test]
    async fn test_thrown_error_is_runtime_error() {
        let delegate = compile(r#"throw "nope";"#);
        let mut ctx = context(None, Arc::new(SharedStateStore::new()));

        let err = run(&delegate, &mut ctx).await.unwrap_err();
        assert!(matches!(err, KestrunError::ScriptRuntime(ref m) if m.contains("nope")));
    }

    #[tokio::test]
    async fn test_operation_limit() {
        let delegate = RhaiDelegate::compile(
            "loop {}",
            &CompileOptions::new(),
            ResourceLimits::default().with_max_operations(10_000),
            Arc::new(SharedStateStore::new()),
        )
        .unwrap();
        let mut ctx = context(None, Arc::new(SharedStateStore::new()));

        let err = run(&delegate, &mut ctx).await.unwrap_err();
        assert!(matches!(err, KestrunError::ScriptRuntime(_)));
    }

    #[tokio::test]
    async fn test_runaway_script_times_out() {
        let delegate = RhaiDelegate::compile(
            "loop {}",
            &CompileOptions::new(),
            ResourceLimits::default().with_execution_timeout(Duration::from_millis(50)),
            Arc::new(SharedStateStore::new()),
        )
        .unwrap();
        let mut ctx = context(None, Arc::new(SharedStateStore::new()));

        let err = run(&delegate, &mut ctx).await.unwrap_err();
        assert!(matches!(err, KestrunError::ExecutionTimeout(50)));
    }

    #[tokio::test]
    async fn test_cancellation_stops_script() {
        let delegate = compile("loop {}");
        let mut ctx = context(None, Arc::new(SharedStateStore::new()));
        ctx.cancellation.cancel();

        let err = run(&delegate, &mut ctx).await.unwrap_err();
        assert!(matches!(err, KestrunError::Cancelled));
    }

    #[tokio::test]
    async fn test_next_and_items() {
        let mw = middleware().await;
        let first: Arc<dyn Delegate> = Arc::new(compile(
            r#"Context.set_item("who", Context.user.IsAuthenticated); Context.next();"#,
        ));
        let second: Arc<dyn Delegate> = Arc::new(NativeDelegate::new(|ctx, _next| {
            Box::pin(async move {
                let who = ctx.items.get("who").cloned().unwrap_or(Value::Null);
                ctx.response.write_text(format!("authenticated: {}", who), None);
                Ok(())
            })
        }));

        let mut ctx = context(None, Arc::new(SharedStateStore::new()));
        mw.run(&mut ctx, Arc::from(vec![first, second])).await.unwrap();
        assert_eq!(text(&ctx), "authenticated: false");
    }
}
