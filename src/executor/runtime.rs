use crate::connection::ConnectorContext;
use crate::wire::{ErrorMessage, QUERY_COMPLETE, QUERY_EMPTY, QUERY_PARTIAL};

use rhai::serde::{from_dynamic, to_dynamic};
use rhai::{Dynamic, Engine, EvalAltResult, Map as RhaiMap, Scope, AST};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Names injected into every script scope; excluded from auto-returned
/// results.
const FRAMEWORK_NAMES: [&str; 4] = [
    "__file__",
    "__name__",
    "connector_connection",
    "connector_context",
];

/// A call a running script made back into the connector. Emitted through a
/// channel and applied in order by the owning query task.
#[derive(Debug)]
pub(crate) enum RuntimeCall {
    SendResponse { code: i64, body: Option<Value> },
    SendError(ErrorMessage),
    SendNotification(Value),
    SetResult { name: String, value: Value },
    DeclareUnhealthy,
}

/// Why an evaluation failed, pre-classified for the error taxonomy.
#[derive(Debug)]
pub(crate) enum ExecFailure {
    /// A module could not be resolved or failed inside its own load.
    Import { kind: &'static str, diagnostic: String },
    /// Resource exhaustion; the connector declares itself unhealthy.
    Exhausted { kind: &'static str, diagnostic: String },
    Other { kind: &'static str, diagnostic: String },
}

/// The connection surface bound into a script's scope as
/// `connector_connection`.
#[derive(Clone)]
pub struct ScriptConnection {
    calls: mpsc::UnboundedSender<RuntimeCall>,
}

impl ScriptConnection {
    fn emit(&mut self, call: RuntimeCall) {
        // The receiver outlives the evaluation; a send can only fail when
        // the query task is being torn down, and then nobody is listening.
        let _ = self.calls.send(call);
    }

    fn send_query_response(
        &mut self,
        code: i64,
        body: Dynamic,
    ) -> Result<(), Box<EvalAltResult>> {
        if !matches!(code, QUERY_PARTIAL | QUERY_COMPLETE | QUERY_EMPTY) {
            return Err(format!("send_query_response: invalid code: {code}").into());
        }
        let body = if body.is_unit() {
            if code != QUERY_EMPTY {
                return Err("send_query_response: non-empty responses require a body".into());
            }
            None
        } else {
            Some(dynamic_to_value(&body)?)
        };
        self.emit(RuntimeCall::SendResponse { code, body });
        Ok(())
    }

    fn send_query_error(&mut self, error: RhaiMap) -> Result<(), Box<EvalAltResult>> {
        let value = dynamic_to_value(&Dynamic::from_map(error))?;
        let error: ErrorMessage = serde_json::from_value(value)
            .map_err(|e| format!("send_query_error: incomplete error message: {e}"))?;
        if error.code.is_empty() || error.template.is_empty() {
            return Err("send_query_error: messageCode and messageTemplate are required".into());
        }
        self.emit(RuntimeCall::SendError(error));
        Ok(())
    }

    fn send_notification(&mut self, body: Dynamic) -> Result<(), Box<EvalAltResult>> {
        let body = dynamic_to_value(&body)?;
        self.emit(RuntimeCall::SendNotification(body));
        Ok(())
    }

    fn set_result(&mut self, name: &str, value: Dynamic) {
        // Mirrors the auto-return rules: values that cannot be serialized
        // are dropped, not surfaced as errors.
        match from_dynamic::<Value>(&value) {
            Ok(value) => self.emit(RuntimeCall::SetResult {
                name: name.to_string(),
                value,
            }),
            Err(_) => debug!(name, "could not encode result value; skipping it"),
        }
    }

    fn declare_unhealthy(&mut self) {
        self.emit(RuntimeCall::DeclareUnhealthy);
    }
}

fn dynamic_to_value(value: &Dynamic) -> Result<Value, Box<EvalAltResult>> {
    from_dynamic::<Value>(value).map_err(|e| format!("value cannot be serialized: {e}").into())
}

/// Builds an engine with the connector surface registered.
pub(crate) fn build_engine() -> Engine {
    let mut engine = Engine::new();
    engine
        .register_type_with_name::<ScriptConnection>("ConnectorConnection")
        .register_fn("send_query_response", ScriptConnection::send_query_response)
        .register_fn("send_query_error", ScriptConnection::send_query_error)
        .register_fn("send_notification", ScriptConnection::send_notification)
        .register_fn("set_result", ScriptConnection::set_result)
        .register_fn("declare_unhealthy", ScriptConnection::declare_unhealthy);
    engine
}

/// Evaluates a compiled artifact in a fresh scope. Blocking; run it under
/// `spawn_blocking`.
///
/// On success returns the script's own top-level variables, already
/// converted to JSON with unserializable values dropped. Calls the script
/// made through `connector_connection` were streamed out on `calls`.
pub(crate) fn execute(
    artifact: &Arc<AST>,
    pseudo_path: &str,
    ctx: &ConnectorContext,
    presets: &Map<String, Value>,
    calls: mpsc::UnboundedSender<RuntimeCall>,
) -> Result<Vec<(String, Value)>, ExecFailure> {
    let engine = build_engine();
    let mut scope = Scope::new();
    scope.push("__file__", pseudo_path.to_string());
    scope.push("__name__", "__main__".to_string());
    scope.push("connector_context", context_map(ctx));
    scope.push("connector_connection", ScriptConnection { calls });

    for (name, value) in presets {
        match to_dynamic(value) {
            Ok(dynamic) => {
                scope.push_dynamic(name.clone(), dynamic);
            }
            Err(e) => debug!(name = %name, "could not seed preset value: {e}"),
        }
    }

    engine
        .run_ast_with_scope(&mut scope, artifact)
        .map_err(classify_failure)?;

    let mut values = Vec::new();
    for (name, _, value) in scope.iter() {
        if FRAMEWORK_NAMES.contains(&name) {
            continue;
        }
        match from_dynamic::<Value>(&value) {
            Ok(value) => values.push((name.to_string(), value)),
            Err(_) => debug!(name, "could not encode variable to JSON; skipping it"),
        }
    }
    Ok(values)
}

fn context_map(ctx: &ConnectorContext) -> RhaiMap {
    let mut map = RhaiMap::new();
    map.insert("source_name".into(), ctx.source_name.clone().into());
    if let Some(address) = &ctx.response_address {
        map.insert("response_address".into(), address.clone().into());
    }
    map
}

fn classify_failure(err: Box<EvalAltResult>) -> ExecFailure {
    let diagnostic = err.to_string();
    match *err {
        EvalAltResult::ErrorModuleNotFound(..) => ExecFailure::Import {
            kind: "ModuleNotFound",
            diagnostic,
        },
        EvalAltResult::ErrorInModule(..) => ExecFailure::Import {
            kind: "ModuleError",
            diagnostic,
        },
        EvalAltResult::ErrorStackOverflow(..) => ExecFailure::Exhausted {
            kind: "StackOverflow",
            diagnostic,
        },
        EvalAltResult::ErrorDataTooLarge(..) => ExecFailure::Exhausted {
            kind: "DataTooLarge",
            diagnostic,
        },
        EvalAltResult::ErrorRuntime(..) => ExecFailure::Other {
            kind: "RuntimeError",
            diagnostic,
        },
        _ => ExecFailure::Other {
            kind: "EvalError",
            diagnostic,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_ctx() -> ConnectorContext {
        ConnectorContext {
            source_name: "S".to_string(),
            response_address: Some("addr-1".to_string()),
        }
    }

    fn compile(code: &str) -> Arc<AST> {
        Arc::new(build_engine().compile(code).expect("test script compiles"))
    }

    fn run(
        code: &str,
        presets: Map<String, Value>,
    ) -> (Result<Vec<(String, Value)>, ExecFailure>, Vec<RuntimeCall>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let result = execute(&compile(code), "test.rhai", &test_ctx(), &presets, tx);
        let mut calls = Vec::new();
        while let Ok(call) = rx.try_recv() {
            calls.push(call);
        }
        (result, calls)
    }

    #[test]
    fn top_level_variables_are_collected() {
        let (result, _) = run("let x = 41 + 1; let label = \"done\";", Map::new());
        let values = result.unwrap();
        assert!(values.contains(&("x".to_string(), json!(42))));
        assert!(values.contains(&("label".to_string(), json!("done"))));
    }

    #[test]
    fn framework_names_are_excluded() {
        let (result, _) = run("let y = 1;", Map::new());
        let values = result.unwrap();
        assert!(values.iter().all(|(name, _)| name != "__file__"
            && name != "__name__"
            && name != "connector_context"
            && name != "connector_connection"));
    }

    #[test]
    fn presets_seed_the_scope_and_are_returned() {
        let mut presets = Map::new();
        presets.insert("base".to_string(), json!(40));
        let (result, _) = run("let x = base + 2;", presets);
        let values = result.unwrap();
        assert!(values.contains(&("base".to_string(), json!(40))));
        assert!(values.contains(&("x".to_string(), json!(42))));
    }

    #[test]
    fn context_is_visible_to_the_script() {
        let (result, _) = run(
            "let who = connector_context.source_name; let addr = connector_context.response_address;",
            Map::new(),
        );
        let values = result.unwrap();
        assert!(values.contains(&("who".to_string(), json!("S"))));
        assert!(values.contains(&("addr".to_string(), json!("addr-1"))));
    }

    #[test]
    fn unserializable_values_are_dropped() {
        let (result, _) = run("let h = connector_connection; let x = 1;", Map::new());
        let values = result.unwrap();
        assert!(values.iter().all(|(name, _)| name != "h"));
        assert!(values.contains(&("x".to_string(), json!(1))));
    }

    #[test]
    fn script_can_stream_responses() {
        let (result, calls) = run(
            r#"
                connector_connection.send_query_response(100, #{ part: 1 });
                connector_connection.send_query_response(200, #{ part: 2 });
            "#,
            Map::new(),
        );
        result.unwrap();
        assert_eq!(calls.len(), 2);
        match &calls[0] {
            RuntimeCall::SendResponse { code: 100, body: Some(body) } => {
                assert_eq!(body["part"], 1);
            }
            other => panic!("unexpected call: {other:?}"),
        }
        match &calls[1] {
            RuntimeCall::SendResponse { code: 200, body: Some(body) } => {
                assert_eq!(body["part"], 2);
            }
            other => panic!("unexpected call: {other:?}"),
        }
    }

    #[test]
    fn script_error_frames_require_complete_messages() {
        let (result, calls) = run(
            r#"
                connector_connection.send_query_error(#{
                    messageCode: "my.code",
                    messageTemplate: "bad thing {0}",
                    parameters: [7]
                });
            "#,
            Map::new(),
        );
        result.unwrap();
        match &calls[0] {
            RuntimeCall::SendError(error) => {
                assert_eq!(error.code, "my.code");
                assert_eq!(error.parameters, vec![json!(7)]);
            }
            other => panic!("unexpected call: {other:?}"),
        }

        // Missing fields fail the evaluation itself.
        let (result, _) = run(
            "connector_connection.send_query_error(#{ messageCode: \"only.code\" });",
            Map::new(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn invalid_response_code_fails_the_script() {
        let (result, calls) = run(
            "connector_connection.send_query_response(301, #{ a: 1 });",
            Map::new(),
        );
        assert!(matches!(result, Err(ExecFailure::Other { .. })));
        assert!(calls.is_empty());
    }

    #[test]
    fn set_result_is_streamed() {
        let (result, calls) = run(
            "connector_connection.set_result(\"answer\", 42);",
            Map::new(),
        );
        result.unwrap();
        match &calls[0] {
            RuntimeCall::SetResult { name, value } => {
                assert_eq!(name, "answer");
                assert_eq!(value, &json!(42));
            }
            other => panic!("unexpected call: {other:?}"),
        }
    }

    #[test]
    fn notifications_and_health_calls_are_streamed() {
        let (result, calls) = run(
            r#"
                connector_connection.send_notification(#{ event: "tick" });
                connector_connection.declare_unhealthy();
            "#,
            Map::new(),
        );
        result.unwrap();
        assert!(matches!(&calls[0], RuntimeCall::SendNotification(body) if body["event"] == "tick"));
        assert!(matches!(&calls[1], RuntimeCall::DeclareUnhealthy));
    }

    #[test]
    fn runtime_failures_are_classified() {
        let (result, _) = run("let x = 1 / 0;", Map::new());
        assert!(result.is_err());
    }
}
