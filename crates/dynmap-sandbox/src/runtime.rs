//! Boa execution of a single Smart Function invocation.

use std::sync::Arc;
use std::time::Instant;

use boa_engine::{Context, Source};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::host_api::{self, DeviceLookup, LookupGuard};

/// Everything a script run needs, already serialized to JSON.
pub(crate) struct ScriptRun {
    pub source: String,
    pub input: Value,
    pub config: Value,
    pub state: Map<String, Value>,
    pub loop_iteration_limit: u64,
    pub recursion_limit: usize,
    pub deadline: Option<Instant>,
    pub lookup: Arc<dyn DeviceLookup>,
}

/// A line written through `console`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub level: String,
    pub message: String,
}

/// What the wrapper hands back after a run.
#[derive(Debug, Deserialize)]
pub(crate) struct RawOutcome {
    #[serde(default)]
    pub actions: Vec<Value>,
    #[serde(default)]
    pub state: Map<String, Value>,
    #[serde(default)]
    pub logs: Vec<LogLine>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug)]
pub(crate) enum RunError {
    /// Loop iteration limit or deadline exceeded.
    LimitExceeded,
    /// Syntax error, uncaught engine error or malformed wrapper output.
    Engine(String),
}

const PRELUDE: &str = r#"
  const __logs = [];
  const __warnings = [];
  const __fmt = (args) => args
    .map((a) => (typeof a === 'string' ? a : JSON.stringify(a)))
    .join(' ');
  const __log = (level) => (...args) => { __logs.push({ level: level, message: __fmt(args) }); };
  const console = {
    log: __log('info'),
    info: __log('info'),
    debug: __log('debug'),
    warn: __log('warn'),
    error: __log('error'),
  };
  const __parse = (text) => (text === null || text === undefined ? null : JSON.parse(text));

  const __payload = __input.payload;
  if (__payload !== null && typeof __payload === 'object') {
    Object.defineProperty(__payload, 'get', {
      value: function (key) { return this[key]; },
      enumerable: false,
    });
  }

  const msg = {
    payload: __payload,
    topic: __input.topic,
    clientId: __input.clientId,
    messageId: __input.messageId,
    transportFields: __input.transportFields,
    getPayload: function () { return __payload; },
    getTopic: function () { return __input.topic; },
    getClientId: function () { return __input.clientId; },
    getTopicLevels: function () { return __input.topicLevels.slice(); },
  };

  const context = {
    getState: function (key, defaultValue) {
      return Object.prototype.hasOwnProperty.call(__state, key) ? __state[key] : defaultValue;
    },
    setState: function (key, value) { __state[key] = value; },
    getStateAll: function () { return Object.assign({}, __state); },
    getConfig: function () { return __config; },
    getClientId: function () { return __input.clientId; },
    getManagedObjectByDeviceId: function (id) {
      return __parse(__host_managed_object(String(id)));
    },
    getManagedObject: function (ref) {
      if (ref === null || typeof ref !== 'object') { return null; }
      return __parse(__host_by_external_id(String(ref.externalId), String(ref.type)));
    },
    getParent: function (id) { return __parse(__host_parent(String(id))); },
    addWarning: function (text) { __warnings.push(String(text)); },
  };
"#;

const EPILOGUE: &str = r#"
    if (typeof onMessage !== 'function') {
      throw new Error('onMessage(msg, context) is not defined');
    }
    let __result = onMessage(msg, context);
    if (__result === null || __result === undefined) { __result = []; }
    if (!Array.isArray(__result)) { __result = [__result]; }
    return JSON.stringify({ actions: __result, state: __state, logs: __logs, warnings: __warnings });
  } catch (e) {
    const __message = e instanceof Error ? e.name + ': ' + e.message : String(e);
    return JSON.stringify({ error: __message, logs: __logs, warnings: __warnings });
  }
})()
"#;

/// Build the script evaluated in a fresh context: inputs are injected as
/// JSON literals, the user source runs inside a function scope that only
/// sees `msg`, `context` and `console`.
pub(crate) fn wrap(source: &str, input: &Value, config: &Value, state: &Map<String, Value>) -> String {
    let state = Value::Object(state.clone());
    format!(
        "(function () {{\n  const __input = {input};\n  const __config = {config};\n  let __state = {state};\n{PRELUDE}\n  try {{\n{source}\n{EPILOGUE}"
    )
}

/// Evaluate one invocation on the current thread.
pub(crate) fn run(script: ScriptRun) -> Result<RawOutcome, RunError> {
    let _guard = LookupGuard::bind(script.lookup.clone(), script.deadline);

    let mut context = Context::default();
    let limits = context.runtime_limits_mut();
    limits.set_loop_iteration_limit(script.loop_iteration_limit);
    limits.set_recursion_limit(script.recursion_limit);
    host_api::register(&mut context).map_err(|e| RunError::Engine(e.to_string()))?;

    let wrapped = wrap(&script.source, &script.input, &script.config, &script.state);
    let value = context
        .eval(Source::from_bytes(wrapped.as_bytes()))
        .map_err(|e| classify(e.to_string()))?;
    if host_api::deadline_passed() {
        return Err(RunError::LimitExceeded);
    }

    let text = value
        .as_string()
        .map(|s| s.to_std_string_escaped())
        .ok_or_else(|| RunError::Engine("wrapper did not return a string".to_string()))?;

    let outcome: RawOutcome = serde_json::from_str(&text)
        .map_err(|e| RunError::Engine(format!("invalid script output: {}", e)))?;
    if outcome.error.as_deref().is_some_and(is_limit_message) {
        return Err(RunError::LimitExceeded);
    }
    Ok(outcome)
}

fn is_limit_message(message: &str) -> bool {
    message.to_ascii_lowercase().contains("iteration limit")
}

fn classify(message: String) -> RunError {
    if is_limit_message(&message) {
        RunError::LimitExceeded
    } else {
        RunError::Engine(message)
    }
}
