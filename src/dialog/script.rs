use converse_sdk::{Event, WellKnownFlag};
use handlebars::Handlebars;
use rhai::{Dynamic, Engine, Scope};
use serde_json::{Map, Value, json};
use strum::IntoEnumIterator;

const MAX_OPERATIONS: u64 = 100_000;

/// Evaluates flow content: rhai for conditions and scripts, handlebars for
/// `say` text.
///
/// Every evaluation sees three variables:
/// - `event`: the triggering event as a map (`event.payload.text`, ...)
/// - `context`: the session context
/// - `flags`: every well known flag as a bool, plus `flags.custom`
pub struct ScriptHost {
    engine: Engine,
    templates: Handlebars<'static>,
}

impl ScriptHost {
    pub fn new() -> Self {
        let mut engine = Engine::new();
        engine.set_max_operations(MAX_OPERATIONS);
        engine.set_max_expr_depths(64, 32);

        let mut templates = Handlebars::new();
        templates.register_escape_fn(handlebars::no_escape);

        Self { engine, templates }
    }

    pub fn check_condition(&self, expr: &str) -> Result<(), String> {
        self.engine
            .compile_expression(expr)
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    pub fn check_script(&self, code: &str) -> Result<(), String> {
        self.engine.compile(code).map(|_| ()).map_err(|e| e.to_string())
    }

    pub fn condition(&self, expr: &str, event: &Event, context: &Map<String, Value>) -> Result<bool, String> {
        let mut scope = scope(event, context)?;
        let result = self
            .engine
            .eval_expression_with_scope::<Dynamic>(&mut scope, expr)
            .map_err(|e| format!("condition `{expr}`: {e}"))?;
        result
            .as_bool()
            .map_err(|kind| format!("condition `{expr}` returned {kind}, expected bool"))
    }

    /// Runs `code` and keeps whatever it left in `context`.
    pub fn run(&self, code: &str, event: &Event, context: &mut Map<String, Value>) -> Result<(), String> {
        let mut scope = scope(event, context)?;
        self.engine
            .run_with_scope(&mut scope, code)
            .map_err(|e| format!("script: {e}"))?;

        let updated = scope
            .get_value::<Dynamic>("context")
            .ok_or_else(|| "script removed `context`".to_string())?;
        match rhai::serde::from_dynamic::<Value>(&updated).map_err(|e| e.to_string())? {
            Value::Object(map) => {
                *context = map;
                Ok(())
            }
            other => Err(format!("script replaced `context` with {other}")),
        }
    }

    pub fn render(&self, text: &str, event: &Event, context: &Map<String, Value>) -> Result<String, String> {
        self.templates
            .render_template(text, &json!({ "context": context, "event": event }))
            .map_err(|e| format!("template `{text}`: {e}"))
    }
}

impl Default for ScriptHost {
    fn default() -> Self {
        Self::new()
    }
}

fn scope(event: &Event, context: &Map<String, Value>) -> Result<Scope<'static>, String> {
    let mut flags = Map::new();
    for flag in WellKnownFlag::iter() {
        flags.insert(flag.to_string(), Value::Bool(event.flags.has(flag)));
    }
    flags.insert("custom".into(), json!(event.flags.custom));

    let mut scope = Scope::new();
    scope.push_dynamic("event", rhai::serde::to_dynamic(event).map_err(|e| e.to_string())?);
    scope.push_dynamic("context", rhai::serde::to_dynamic(context).map_err(|e| e.to_string())?);
    scope.push_dynamic("flags", rhai::serde::to_dynamic(&flags).map_err(|e| e.to_string())?);
    Ok(scope)
}
