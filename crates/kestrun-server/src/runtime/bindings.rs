//! JavaScript bindings for Kestrun
//!
//! This module installs everything a runspace exposes to scripts. It is the
//! single place where native Rust functions enter the JavaScript VM.
//!
//! # JavaScript API
//!
//! Per request (bound by [`bind_request`], cleared by [`clear_request`]):
//!
//! - `Request` - deep-frozen request snapshot (`Method`, `Path`, `Query`,
//!   `Headers`, `Body`, `Form`, `RouteValues`, `RemoteAddr`)
//! - `Response` - `writeText`, `writeJson`, `writeBinary`, `redirect`,
//!   `setHeader`, `setStatus`, `setContentType`, `setContentDisposition`
//! - `Context` - `TraceIdentifier`, `User`, `Items`, `next()`
//! - `writeError(message)` - appends to the error stream
//!
//! For the runspace lifetime:
//!
//! - `SharedState.get/set/increment/remove/has/keys`
//! - `Log.debug/info/warn/error`
//! - `sleep(ms)` - blocks this runspace only
//!
//! # Safety
//!
//! `SharedState` natives capture an `Arc<SharedStateStore>`. The store holds
//! no garbage-collected values, so the closures need no tracing.

use boa_engine::{
    js_string, native_function::NativeFunction, object::ObjectInitializer, property::Attribute,
    value::JsValue, Context, JsError, JsNativeError, JsResult, Source,
};
use kestrun_common::model::ScriptResponseState;
use kestrun_common::{KestrunError, Result};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::runtime::conversions::{js_value_to_json, json_to_js_value};
use crate::shared_state::SharedStateStore;

/// Longest a script may block its runspace in a single `sleep` call.
const MAX_SLEEP: Duration = Duration::from_secs(60);

const PRELUDE: &str = r#"
(function (global) {
    function deepFreeze(value) {
        if (value !== null && typeof value === 'object' && !Object.isFrozen(value)) {
            Object.freeze(value);
            Object.getOwnPropertyNames(value).forEach(function (name) {
                deepFreeze(value[name]);
            });
        }
        return value;
    }

    function hidden(target, name, value) {
        Object.defineProperty(target, name, { value: value, writable: true, enumerable: false });
    }

    function KestrunResponse(state) {
        hidden(this, '__state', state);
    }

    KestrunResponse.prototype.writeText = function (text, contentType) {
        this.__state.body = { kind: 'text', text: String(text) };
        this.__state.content_type = contentType ? String(contentType) : 'text/plain';
    };

    KestrunResponse.prototype.writeJson = function (value, statusCode) {
        this.__state.body = { kind: 'text', text: JSON.stringify(value === undefined ? null : value) };
        this.__state.content_type = 'application/json';
        if (statusCode !== undefined) {
            this.__state.status = statusCode | 0;
        }
    };

    KestrunResponse.prototype.writeBinary = function (bytes, contentType) {
        if (bytes instanceof ArrayBuffer) {
            bytes = new Uint8Array(bytes);
        }
        if (bytes === null || typeof bytes !== 'object' || typeof bytes.length !== 'number') {
            throw new TypeError('writeBinary expects an array of bytes, use writeText for strings');
        }
        var data = Array.from(bytes, function (b) {
            if (typeof b !== 'number' || b !== Math.floor(b) || b < 0 || b > 255) {
                throw new TypeError('writeBinary expects byte values 0-255, got ' + String(b));
            }
            return b;
        });
        this.__state.body = { kind: 'binary', bytes: data };
        this.__state.content_type = contentType ? String(contentType) : 'application/octet-stream';
    };

    KestrunResponse.prototype.redirect = function (url, statusCode, message) {
        this.__state.redirect = { url: String(url), status: statusCode ? statusCode | 0 : 302 };
        if (message !== undefined) {
            this.writeText(message);
        } else {
            this.__state.body = null;
        }
    };

    KestrunResponse.prototype.setHeader = function (name, value) {
        this.__state.headers[String(name).toLowerCase()] = String(value);
    };

    KestrunResponse.prototype.setStatus = function (statusCode) {
        this.__state.status = statusCode | 0;
    };

    KestrunResponse.prototype.setContentType = function (contentType) {
        this.__state.content_type = String(contentType);
    };

    KestrunResponse.prototype.setContentDisposition = function (kind, fileName) {
        this.__state.content_disposition = {
            kind: String(kind).toLowerCase(),
            file_name: fileName === undefined || fileName === null ? null : String(fileName)
        };
    };

    Object.defineProperty(KestrunResponse.prototype, 'StatusCode', {
        get: function () { return this.__state.status; }
    });

    function KestrunContext(data) {
        this.TraceIdentifier = data.TraceIdentifier;
        this.User = deepFreeze(data.User);
        this.Items = data.Items;
        hidden(this, '__callNext', false);
    }

    KestrunContext.prototype.next = function () {
        this.__callNext = true;
    };

    var errors = [];

    global.writeError = function (message) {
        errors.push(String(message));
    };

    global.__kestrunBind = function (request, response, context) {
        errors = [];
        global.Request = deepFreeze(request);
        global.Response = new KestrunResponse(response);
        global.Context = new KestrunContext(context);
    };

    global.__kestrunCollect = function () {
        return {
            response: global.Response ? global.Response.__state : null,
            callNext: global.Context ? global.Context.__callNext : false,
            items: global.Context ? global.Context.Items : {},
            errors: errors
        };
    };

    global.__kestrunClear = function () {
        errors = [];
        global.Request = undefined;
        global.Response = undefined;
        global.Context = undefined;
    };
})(globalThis);
"#;

/// State a script run left behind.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CollectedState {
    pub response: Option<ScriptResponseState>,
    #[serde(default)]
    pub call_next: bool,
    #[serde(default)]
    pub items: Map<String, Value>,
    #[serde(default)]
    pub errors: Vec<String>,
}

fn js_err(e: JsError) -> KestrunError {
    KestrunError::RunspaceCreation(e.to_string())
}

fn to_js_error(e: KestrunError) -> JsError {
    JsNativeError::error().with_message(e.to_string()).into()
}

fn string_arg(args: &[JsValue], index: usize, what: &str) -> JsResult<String> {
    args.get(index)
        .and_then(|v| v.as_string())
        .map(|s| s.to_std_string_escaped())
        .ok_or_else(|| {
            JsNativeError::typ()
                .with_message(format!("{} must be a string", what))
                .into()
        })
}

fn message_arg(args: &[JsValue], ctx: &mut Context) -> JsResult<String> {
    match args.first() {
        Some(value) => Ok(value.to_string(ctx)?.to_std_string_escaped()),
        None => Ok(String::new()),
    }
}

/// Install all Kestrun bindings into a fresh Boa context.
///
/// # Errors
///
/// Returns `RunspaceCreation` if the prelude fails to evaluate or a global
/// cannot be registered.
pub(crate) fn install_bindings(ctx: &mut Context, shared: Arc<SharedStateStore>) -> Result<()> {
    ctx.eval(Source::from_bytes(PRELUDE)).map_err(js_err)?;

    install_shared_state(ctx, shared)?;
    install_log(ctx)?;

    ctx.register_global_builtin_callable(
        js_string!("sleep"),
        1,
        NativeFunction::from_fn_ptr(|_this, args, _ctx| {
            let millis = args.first().and_then(|v| v.as_number()).unwrap_or(0.0).max(0.0);
            let duration = Duration::from_millis(millis as u64).min(MAX_SLEEP);
            std::thread::sleep(duration);
            Ok(JsValue::undefined())
        }),
    )
    .map_err(js_err)?;

    Ok(())
}

fn install_shared_state(ctx: &mut Context, shared: Arc<SharedStateStore>) -> Result<()> {
    let store = Arc::clone(&shared);
    // SAFETY: the closure captures only an Arc to plain Rust data, no GC values.
    let get = unsafe {
        NativeFunction::from_closure(move |_this, args, ctx| {
            let name = string_arg(args, 0, "name")?;
            match store.try_get(&name) {
                Some(value) => json_to_js_value(&value.to_json(), ctx).map_err(to_js_error),
                None => Ok(JsValue::undefined()),
            }
        })
    };

    let store = Arc::clone(&shared);
    // SAFETY: as above.
    let set = unsafe {
        NativeFunction::from_closure(move |_this, args, ctx| {
            let name = string_arg(args, 0, "name")?;
            let value = match args.get(1) {
                Some(value) => js_value_to_json(value, ctx).map_err(to_js_error)?,
                None => Value::Null,
            };
            let defined = store.set_json(&name, value).map_err(to_js_error)?;
            Ok(JsValue::new(defined))
        })
    };

    let store = Arc::clone(&shared);
    // SAFETY: as above.
    let increment = unsafe {
        NativeFunction::from_closure(move |_this, args, _ctx| {
            let name = string_arg(args, 0, "name")?;
            let key = args.get(1).and_then(|v| v.as_string()).map(|s| s.to_std_string_escaped());
            let delta = args.get(2).and_then(|v| v.as_number()).unwrap_or(1.0) as i64;
            let updated = store.increment(&name, key.as_deref(), delta).map_err(to_js_error)?;
            Ok(JsValue::new(updated as f64))
        })
    };

    let store = Arc::clone(&shared);
    // SAFETY: as above.
    let remove = unsafe {
        NativeFunction::from_closure(move |_this, args, _ctx| {
            let name = string_arg(args, 0, "name")?;
            Ok(JsValue::new(store.remove(&name)))
        })
    };

    let store = Arc::clone(&shared);
    // SAFETY: as above.
    let has = unsafe {
        NativeFunction::from_closure(move |_this, args, _ctx| {
            let name = string_arg(args, 0, "name")?;
            Ok(JsValue::new(store.contains(&name)))
        })
    };

    let store = shared;
    // SAFETY: as above.
    let keys = unsafe {
        NativeFunction::from_closure(move |_this, _args, ctx| {
            let names: Vec<Value> = store.key_snapshot().into_iter().map(Value::String).collect();
            json_to_js_value(&Value::Array(names), ctx).map_err(to_js_error)
        })
    };

    let object = ObjectInitializer::new(ctx)
        .function(get, js_string!("get"), 1)
        .function(set, js_string!("set"), 2)
        .function(increment, js_string!("increment"), 3)
        .function(remove, js_string!("remove"), 1)
        .function(has, js_string!("has"), 1)
        .function(keys, js_string!("keys"), 0)
        .build();

    ctx.register_global_property(js_string!("SharedState"), object, Attribute::all())
        .map_err(js_err)
}

fn install_log(ctx: &mut Context) -> Result<()> {
    let object = ObjectInitializer::new(ctx)
        .function(
            NativeFunction::from_fn_ptr(|_this, args, ctx| {
                let message = message_arg(args, ctx)?;
                tracing::debug!(target: "kestrun::script", "{}", message);
                Ok(JsValue::undefined())
            }),
            js_string!("debug"),
            1,
        )
        .function(
            NativeFunction::from_fn_ptr(|_this, args, ctx| {
                let message = message_arg(args, ctx)?;
                tracing::info!(target: "kestrun::script", "{}", message);
                Ok(JsValue::undefined())
            }),
            js_string!("info"),
            1,
        )
        .function(
            NativeFunction::from_fn_ptr(|_this, args, ctx| {
                let message = message_arg(args, ctx)?;
                tracing::warn!(target: "kestrun::script", "{}", message);
                Ok(JsValue::undefined())
            }),
            js_string!("warn"),
            1,
        )
        .function(
            NativeFunction::from_fn_ptr(|_this, args, ctx| {
                let message = message_arg(args, ctx)?;
                tracing::error!(target: "kestrun::script", "{}", message);
                Ok(JsValue::undefined())
            }),
            js_string!("error"),
            1,
        )
        .build();

    ctx.register_global_property(js_string!("Log"), object, Attribute::all())
        .map_err(js_err)
}

fn call_global(ctx: &mut Context, name: &str, args: &[JsValue]) -> Result<JsValue> {
    let function = ctx
        .global_object()
        .get(js_string!(name), ctx)
        .map_err(|e| KestrunError::ScriptRuntime(e.to_string()))?;
    let function = function
        .as_callable()
        .ok_or_else(|| KestrunError::ScriptRuntime(format!("'{}' is not callable", name)))?;
    function
        .call(&JsValue::undefined(), args, ctx)
        .map_err(|e| KestrunError::ScriptRuntime(e.to_string()))
}

/// Binds `Request`, `Response` and `Context` for one invocation.
pub(crate) fn bind_request(
    ctx: &mut Context,
    request: &Value,
    response: &ScriptResponseState,
    context: &Value,
) -> Result<()> {
    let request = json_to_js_value(request, ctx)?;
    let response = json_to_js_value(&serde_json::to_value(response)?, ctx)?;
    let context = json_to_js_value(context, ctx)?;
    call_global(ctx, "__kestrunBind", &[request, response, context])?;
    Ok(())
}

/// Reads back the response state, continuation flag, items and errors.
pub(crate) fn collect_request(ctx: &mut Context) -> Result<CollectedState> {
    let state = call_global(ctx, "__kestrunCollect", &[])?;
    let state = js_value_to_json(&state, ctx)?;
    serde_json::from_value(state)
        .map_err(|e| KestrunError::ScriptRuntime(format!("Script left an invalid response: {}", e)))
}

/// Removes the per-request globals so nothing leaks into the next request.
pub(crate) fn clear_request(ctx: &mut Context) -> Result<()> {
    call_global(ctx, "__kestrunClear", &[])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrun_common::model::ScriptBody;
    use serde_json::json;

    fn context_with_bindings() -> (Context, Arc<SharedStateStore>) {
        let mut ctx = Context::default();
        let shared = Arc::new(SharedStateStore::new());
        install_bindings(&mut ctx, Arc::clone(&shared)).unwrap();
        (ctx, shared)
    }

    fn eval_json(ctx: &mut Context, code: &str) -> Value {
        let value = ctx.eval(Source::from_bytes(code)).unwrap();
        js_value_to_json(&value, ctx).unwrap()
    }

    #[test]
    fn test_globals_installed() {
        let (mut ctx, _) = context_with_bindings();
        assert_eq!(eval_json(&mut ctx, "typeof SharedState.get"), json!("function"));
        assert_eq!(eval_json(&mut ctx, "typeof Log.info"), json!("function"));
        assert_eq!(eval_json(&mut ctx, "typeof sleep"), json!("function"));
        assert_eq!(eval_json(&mut ctx, "typeof Request"), json!("undefined"));
    }

    #[test]
    fn test_shared_state_from_script() {
        let (mut ctx, shared) = context_with_bindings();
        eval_json(&mut ctx, "SharedState.set('Visits', { Count: 0 })");
        eval_json(&mut ctx, "SharedState.increment('visits', 'Count')");
        eval_json(&mut ctx, "SharedState.increment('VISITS', 'Count', 4)");

        assert_eq!(shared.try_get("Visits").unwrap().to_json(), json!({"Count": 5}));
        assert_eq!(eval_json(&mut ctx, "SharedState.get('visits').Count"), json!(5));
        assert_eq!(eval_json(&mut ctx, "SharedState.has('Visits')"), json!(true));
        assert_eq!(eval_json(&mut ctx, "SharedState.keys()"), json!(["Visits"]));
        assert_eq!(eval_json(&mut ctx, "SharedState.get('nothing') === undefined"), json!(true));
    }

    #[test]
    fn test_shared_state_validation_throws() {
        let (mut ctx, _) = context_with_bindings();
        assert!(ctx.eval(Source::from_bytes("SharedState.set('num', 123)")).is_err());
        assert!(ctx.eval(Source::from_bytes("SharedState.set('bad-name', {})")).is_err());
        assert_eq!(
            eval_json(&mut ctx, "try { SharedState.set('1bad', {}); 'no' } catch (e) { 'caught' }"),
            json!("caught")
        );
    }

    #[test]
    fn test_write_binary_accepts_only_bytes() {
        let (mut ctx, _) = context_with_bindings();
        let context = json!({"TraceIdentifier": "t-2", "User": {"IsAuthenticated": false}, "Items": {}});
        bind_request(&mut ctx, &json!({"Method": "GET"}), &ScriptResponseState::default(), &context).unwrap();

        for bad in ["'abc'", "42", "null", "[1, 256]", "[1.5]", "['a']"] {
            let code = format!(
                "try {{ Response.writeBinary({}); 'accepted' }} catch (e) {{ e instanceof TypeError ? 'rejected' : 'other' }}",
                bad
            );
            assert_eq!(eval_json(&mut ctx, &code), json!("rejected"), "input {}", bad);
        }

        eval_json(&mut ctx, "Response.writeBinary(new Uint8Array([104, 105]).buffer)");
        let response = collect_request(&mut ctx).unwrap().response.unwrap();
        assert_eq!(response.body, Some(ScriptBody::Binary { bytes: vec![104, 105] }));
    }

    #[test]
    fn test_bind_and_collect() {
        let (mut ctx, _) = context_with_bindings();
        let request = json!({"Method": "GET", "Path": "/x", "Query": {"a": "1"}});
        let context = json!({"TraceIdentifier": "t-1", "User": {"IsAuthenticated": false}, "Items": {}});
        bind_request(&mut ctx, &request, &ScriptResponseState::default(), &context).unwrap();

        ctx.eval(Source::from_bytes(
            "Response.writeJson({ path: Request.Path, q: Request.Query.a }); \
             Response.setHeader('X-Trace', Context.TraceIdentifier); \
             Context.Items.seen = true; \
             Context.next(); \
             writeError('careful');",
        ))
        .unwrap();

        let state = collect_request(&mut ctx).unwrap();
        let response = state.response.unwrap();
        assert_eq!(response.content_type.as_deref(), Some("application/json"));
        assert_eq!(response.headers.get("x-trace").map(String::as_str), Some("t-1"));
        assert!(state.call_next);
        assert_eq!(state.items["seen"], json!(true));
        assert_eq!(state.errors, vec!["careful".to_string()]);

        clear_request(&mut ctx).unwrap();
        assert_eq!(eval_json(&mut ctx, "typeof Response"), json!("undefined"));
    }

    #[test]
    fn test_request_is_frozen() {
        let (mut ctx, _) = context_with_bindings();
        let request = json!({"Method": "GET", "Headers": {"accept": "*/*"}});
        let context = json!({"TraceIdentifier": "t", "User": {}, "Items": {}});
        bind_request(&mut ctx, &request, &ScriptResponseState::default(), &context).unwrap();

        eval_json(&mut ctx, "Request.Method = 'POST'; Request.Headers.accept = 'x';");
        assert_eq!(eval_json(&mut ctx, "Request.Method"), json!("GET"));
        assert_eq!(eval_json(&mut ctx, "Request.Headers.accept"), json!("*/*"));
    }
}
