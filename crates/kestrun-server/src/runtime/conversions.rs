//! JSON <-> JavaScript Value Conversions
//!
//! Bidirectional conversion between `serde_json::Value` and Boa's `JsValue`.
//! Request, response state and shared-state values all cross the runspace
//! boundary as JSON, so these run on every script invocation.
//!
//! # Type Mapping
//!
//! | JSON Type | JavaScript Type |
//! |-----------|-----------------|
//! | null | null |
//! | boolean | Boolean |
//! | number | Number |
//! | string | String |
//! | array | Array |
//! | object | Object |
//!
//! # Limitations
//!
//! - Symbol keys in JavaScript objects are skipped
//! - JavaScript `undefined`, symbols and functions become JSON null
//! - Non-finite numbers (NaN, Infinity) are rejected

use boa_engine::{
    js_string,
    object::{builtins::JsArray, JsObject},
    property::PropertyKey,
    value::JsValue,
    Context,
};
use kestrun_common::{KestrunError, Result};
use serde_json::Value as JsonValue;

/// Convert serde_json::Value to Boa JsValue.
///
/// # Errors
///
/// Returns `ScriptRuntime` if an array element or object property cannot
/// be created.
pub fn json_to_js_value(json: &JsonValue, ctx: &mut Context) -> Result<JsValue> {
    match json {
        JsonValue::Null => Ok(JsValue::null()),
        JsonValue::Bool(b) => Ok(JsValue::new(*b)),
        JsonValue::Number(n) => Ok(match n.as_i64().and_then(|i| i32::try_from(i).ok()) {
            Some(i) => JsValue::new(i),
            None => JsValue::new(n.as_f64().unwrap_or(f64::NAN)),
        }),
        JsonValue::String(s) => Ok(JsValue::new(js_string!(s.as_str()))),
        JsonValue::Array(arr) => {
            let js_array = JsArray::new(ctx);
            for (i, v) in arr.iter().enumerate() {
                let js_value = json_to_js_value(v, ctx)?;
                js_array.push(js_value, ctx).map_err(|e| {
                    KestrunError::ScriptRuntime(format!("Failed to push array element {}: {}", i, e))
                })?;
            }
            Ok(js_array.into())
        }
        JsonValue::Object(obj) => {
            let js_obj = JsObject::with_object_proto(ctx.intrinsics());
            for (key, value) in obj {
                let js_value = json_to_js_value(value, ctx)?;
                js_obj
                    .create_data_property_or_throw(js_string!(key.as_str()), js_value, ctx)
                    .map_err(|e| {
                        KestrunError::ScriptRuntime(format!("Failed to set property '{}': {}", key, e))
                    })?;
            }
            Ok(js_obj.into())
        }
    }
}

/// Convert Boa JsValue to serde_json::Value.
///
/// # Conversion Rules
///
/// - `undefined` and `null` → JSON `null`
/// - `Number` → JSON integer when integral and in range, float otherwise
/// - `Array` → JSON `array` (recursively)
/// - `Object` → JSON `object` (symbol keys skipped, functions become null)
///
/// # Errors
///
/// Returns `ScriptRuntime` if property access fails or a number is not finite.
pub fn js_value_to_json(value: &JsValue, ctx: &mut Context) -> Result<JsonValue> {
    if value.is_undefined() || value.is_null() {
        return Ok(JsonValue::Null);
    }

    if let Some(b) = value.as_boolean() {
        return Ok(JsonValue::Bool(b));
    }

    if let Some(n) = value.as_number() {
        if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
            return Ok(JsonValue::from(n as i64));
        }
        return serde_json::Number::from_f64(n)
            .map(JsonValue::Number)
            .ok_or_else(|| KestrunError::ScriptRuntime(format!("Cannot represent {} as JSON", n)));
    }

    if let Some(s) = value.as_string() {
        return Ok(JsonValue::String(s.to_std_string_escaped()));
    }

    if let Some(obj) = value.as_object() {
        if obj.is_callable() {
            return Ok(JsonValue::Null);
        }

        if obj.is_array() {
            let array = JsArray::from_object(obj.clone())
                .map_err(|e| KestrunError::ScriptRuntime(format!("Object is not a valid array: {}", e)))?;

            let length = array
                .length(ctx)
                .map_err(|e| KestrunError::ScriptRuntime(format!("Failed to get array length: {}", e)))?;
            let length = u32::try_from(length)
                .map_err(|_| KestrunError::ScriptRuntime("Array length overflow".into()))?;

            let mut result = Vec::with_capacity(length as usize);
            for i in 0..length {
                let elem = array.get(PropertyKey::from(i), ctx).map_err(|e| {
                    KestrunError::ScriptRuntime(format!("Failed to get array element {}: {}", i, e))
                })?;
                result.push(js_value_to_json(&elem, ctx)?);
            }
            return Ok(JsonValue::Array(result));
        }

        let keys = obj
            .own_property_keys(ctx)
            .map_err(|e| KestrunError::ScriptRuntime(format!("Failed to get object keys: {}", e)))?;

        let mut result = serde_json::Map::new();
        for key in keys {
            let key_str = match &key {
                PropertyKey::String(s) => s.to_std_string_escaped(),
                PropertyKey::Index(i) => i.get().to_string(),
                PropertyKey::Symbol(_) => continue,
            };

            let prop_value = obj.get(key.clone(), ctx).map_err(|e| {
                KestrunError::ScriptRuntime(format!("Failed to get property '{}': {}", key_str, e))
            })?;
            result.insert(key_str, js_value_to_json(&prop_value, ctx)?);
        }

        return Ok(JsonValue::Object(result));
    }

    Ok(JsonValue::Null)
}
