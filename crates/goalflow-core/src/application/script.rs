//! In-process script evaluation
//!
//! Scripts run against the step's inputs as a JSON object. JEXL evaluates
//! an expression with the inputs as context; JMESPath queries the inputs
//! object. Lua runs a chunk with each input bound to a global and takes
//! the chunk's return value. Step scripts must produce an object whose keys
//! become outputs.

use crate::domain::step::{ScriptConfig, ScriptLanguage};
use crate::{Args, CoreError};
use mlua::{Lua, LuaOptions, LuaSerdeExt, SerializeOptions, StdLib};
use serde_json::Value;

/// Heap ceiling for one Lua evaluation
const LUA_MEMORY_LIMIT: usize = 16 * 1024 * 1024;

/// Globals removed from the Lua sandbox
const LUA_EXCLUDED_GLOBALS: [&str; 4] = ["require", "dofile", "loadfile", "load"];

/// Evaluate `config` against `input`, returning the raw result
pub fn evaluate(config: &ScriptConfig, input: &Value) -> Result<Value, CoreError> {
    match config.language()? {
        ScriptLanguage::Jexl => {
            let evaluator = jexl_eval::Evaluator::new();
            evaluator
                .eval_in_context(&config.script, input)
                .map_err(|e| CoreError::Script(format!("jexl evaluation failed: {}", e)))
        }
        ScriptLanguage::Jmespath => {
            let expression = jmespath::compile(&config.script).map_err(|e| {
                CoreError::Script(format!(
                    "failed to compile jmespath expression {}: {}",
                    config.script, e
                ))
            })?;
            let result = expression
                .search(input)
                .map_err(|e| CoreError::Script(format!("jmespath evaluation failed: {}", e)))?;
            Ok(serde_json::to_value(&*result)?)
        }
        ScriptLanguage::Lua => evaluate_lua(&config.script, input)
            .map_err(|e| CoreError::Script(format!("lua evaluation failed: {}", e))),
    }
}

/// Fresh sandboxed state per call: no io, os, debug or package libraries
fn evaluate_lua(script: &str, input: &Value) -> mlua::Result<Value> {
    let lua = Lua::new_with(
        StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::UTF8,
        LuaOptions::default(),
    )?;
    lua.set_memory_limit(LUA_MEMORY_LIMIT)?;

    let globals = lua.globals();
    for name in LUA_EXCLUDED_GLOBALS {
        globals.set(name, mlua::Value::Nil)?;
    }
    // JSON null arrives as nil so `x == nil` works in scripts
    let options = SerializeOptions::new()
        .serialize_none_to_null(false)
        .serialize_unit_to_null(false);
    if let Value::Object(fields) = input {
        for (name, value) in fields {
            globals.set(name.as_str(), lua.to_value_with(value, options)?)?;
        }
    }

    let result: mlua::Value = lua.load(script).set_name("script").eval()?;
    lua.from_value(result)
}

/// Run a step script; the result object becomes the step's outputs
pub fn run_script(config: &ScriptConfig, inputs: &Args) -> Result<Args, CoreError> {
    let context = args_to_value(inputs);
    match evaluate(config, &context)? {
        Value::Object(map) => Ok(map.into_iter().collect()),
        Value::Null => Ok(Args::new()),
        other => Err(CoreError::Script(format!(
            "script must return an object, got {}",
            type_name(&other)
        ))),
    }
}

/// Evaluate a predicate on the step's inputs
pub fn evaluate_predicate(config: &ScriptConfig, inputs: &Args) -> Result<bool, CoreError> {
    let context = args_to_value(inputs);
    evaluate(config, &context).map(|v| is_truthy(&v))
}

/// Truthiness of a script result: null, false, zero, empty strings and
/// empty collections are false
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(true, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

pub fn args_to_value(args: &Args) -> Value {
    Value::Object(args.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(value: Value) -> Args {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_jexl_script_outputs() {
        let config = ScriptConfig::new("jexl", "{doubled: value * 2, label: name}");
        let outputs = run_script(&config, &args(json!({"value": 21, "name": "x"}))).unwrap();
        assert_eq!(outputs["doubled"].as_f64(), Some(42.0));
        assert_eq!(outputs["label"], json!("x"));
    }

    #[test]
    fn test_jmespath_script_outputs() {
        let config = ScriptConfig::new("jmespath", "{name: user.name, first: tags[0]}");
        let outputs =
            run_script(&config, &args(json!({"user": {"name": "ada"}, "tags": ["a", "b"]}))).unwrap();
        assert_eq!(outputs["name"], json!("ada"));
        assert_eq!(outputs["first"], json!("a"));
    }

    #[test]
    fn test_non_object_result_rejected() {
        let config = ScriptConfig::new("jexl", "value + 1");
        let err = run_script(&config, &args(json!({"value": 1}))).unwrap_err();
        assert!(matches!(err, CoreError::Script(_)));
    }

    #[test]
    fn test_compile_error() {
        let config = ScriptConfig::new("jmespath", "[[[");
        assert!(matches!(
            run_script(&config, &Args::new()),
            Err(CoreError::Script(_))
        ));
    }

    #[test]
    fn test_lua_script_outputs() {
        let config = ScriptConfig::new("lua", "return {result = a + b, label = string.upper(name)}");
        let outputs = run_script(&config, &args(json!({"a": 5, "b": 10, "name": "x"}))).unwrap();
        assert_eq!(outputs["result"], json!(15));
        assert_eq!(outputs["label"], json!("X"));
    }

    #[test]
    fn test_lua_reads_nested_inputs() {
        let config = ScriptConfig::new("lua", "return {first = tags[1], city = user.address.city}");
        let inputs = args(json!({"tags": ["a", "b"], "user": {"address": {"city": "Oslo"}}}));
        let outputs = run_script(&config, &inputs).unwrap();
        assert_eq!(outputs["first"], json!("a"));
        assert_eq!(outputs["city"], json!("Oslo"));
    }

    #[test]
    fn test_lua_sandbox_hides_os_and_io() {
        for script in ["return {t = os.time()}", "return {f = io.open('x')}", "return {m = require('x')}"] {
            let err = run_script(&ScriptConfig::new("lua", script), &Args::new()).unwrap_err();
            assert!(matches!(err, CoreError::Script(_)), "{} should fail", script);
        }
    }

    #[test]
    fn test_lua_syntax_error() {
        let err = run_script(&ScriptConfig::new("lua", "return {result ="), &Args::new()).unwrap_err();
        assert!(matches!(err, CoreError::Script(ref msg) if msg.starts_with("lua evaluation failed")));
    }

    #[test]
    fn test_predicates() {
        let inputs = args(json!({"amount": 150, "region": "eu"}));
        assert!(evaluate_predicate(&ScriptConfig::new("jexl", "amount > 100"), &inputs).unwrap());
        assert!(!evaluate_predicate(&ScriptConfig::new("jexl", "region == 'us'"), &inputs).unwrap());
        assert!(evaluate_predicate(&ScriptConfig::new("jmespath", "region"), &inputs).unwrap());
        assert!(!evaluate_predicate(&ScriptConfig::new("jmespath", "missing"), &inputs).unwrap());
        assert!(evaluate_predicate(&ScriptConfig::new("lua", "return amount > 100 and region == 'eu'"), &inputs).unwrap());
        assert!(!evaluate_predicate(&ScriptConfig::new("lua", "return missing ~= nil"), &inputs).unwrap());
    }

    #[test]
    fn test_truthiness() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!([])));
        assert!(is_truthy(&json!(1.5)));
        assert!(is_truthy(&json!({"a": 1})));
    }
}
