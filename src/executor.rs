mod options;
mod runtime;

pub use options::RequestOptions;
pub use runtime::ScriptConnection;

use crate::cache::{ArtifactOrigin, CacheEntry, CodeCache};
use crate::config::{http_url_from_ws, json_boolean_value};
use crate::connection::{
    CloseHandler, ConnectHandler, ConnectorContext, PublishHandler, QueryHandler, SourceConnection,
};
use crate::document::{DocumentClient, DocumentError, DOCUMENTS_RESOURCE};
use crate::wire::{ErrorMessage, QUERY_COMPLETE};
use runtime::{ExecFailure, RuntimeCall};

use rhai::AST;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, Mutex};
use tokio::task::{self, AbortHandle};
use tokio::time::{Duration, Instant};
use tracing::{debug, error, warn};
use uuid::Uuid;

// Source configuration sections, as negotiated with the server.
const EXEC_CONFIG_SECTION: &str = "pythonExecConfig";
const GENERAL_SECTION: &str = "general";
const CODE_CACHE_SIZE: &str = "codeCacheSize";
const RETURN_RUNTIME_INFO: &str = "returnRuntimeInformation";

const DEFAULT_CACHE_CAPACITY: usize = 128;

// Result and telemetry fields. These names are the server's vocabulary and
// are kept verbatim for compatibility.
const SCRIPT_RESULTS: &str = "pythonCallResults";
const CONNECTOR_INFO: &str = "connectorRuntimeInfo";
const NEW_CACHE_ENTRY: &str = "newCacheEntry";
const COMPILE_TIME: &str = "compileTime";
const EXECUTION_TIME: &str = "executionTime";
const TOTAL_TIME: &str = "totalTime";
const QUERY_TIME: &str = "query_time";
const CURRENT_CACHE_SIZE: &str = "currentCacheSize";
const CACHE_CAPACITY: &str = "cacheCapacity";

const ERROR_PREFIX: &str = "io.vantiq.pyexecsource";

/// Executes scripts on behalf of one source connection.
///
/// Registers itself as the connection's handlers; each inbound query is
/// validated, resolved against the compiled-artifact cache (or the remote
/// document store), and run concurrently with other in-flight queries.
pub struct ScriptExecConnector {
    connection: Arc<SourceConnection>,
    code_cache: CodeCache,
    is_open: AtomicBool,
    return_runtime_info: AtomicBool,
    /// Lazily constructed, then shared by every query of this source.
    document_client: Mutex<Option<Arc<DocumentClient>>>,
    /// In-flight user tasks; entries are removed on completion.
    user_tasks: StdMutex<HashMap<Uuid, AbortHandle>>,
}

enum Fetched {
    /// The cache held this script and the store's modification timestamp
    /// still matches.
    Cached { artifact: Arc<AST> },
    /// Fresh content downloaded from the store.
    Fresh { modified_at: Value, code: String },
}

impl ScriptExecConnector {
    pub fn new(connection: Arc<SourceConnection>) -> Arc<Self> {
        Arc::new(ScriptExecConnector {
            connection,
            code_cache: CodeCache::new(DEFAULT_CACHE_CAPACITY),
            is_open: AtomicBool::new(false),
            return_runtime_info: AtomicBool::new(false),
            document_client: Mutex::new(None),
            user_tasks: StdMutex::new(HashMap::new()),
        })
    }

    /// The connection this executor serves.
    pub fn connection(&self) -> &Arc<SourceConnection> {
        &self.connection
    }

    pub async fn cache_len(&self) -> usize {
        self.code_cache.len().await
    }

    pub async fn cache_capacity(&self) -> usize {
        self.code_cache.capacity().await
    }

    /// Registers this executor's handlers on the connection.
    pub fn establish_handlers(self: &Arc<Self>) {
        let on_close: CloseHandler = {
            let me = self.clone();
            Arc::new(move |ctx| {
                let me = me.clone();
                Box::pin(async move { me.handle_close(ctx).await })
            })
        };
        let on_connect: ConnectHandler = {
            let me = self.clone();
            Arc::new(move |ctx, config| {
                let me = me.clone();
                Box::pin(async move { me.handle_connect(ctx, config).await })
            })
        };
        let on_publish: PublishHandler = {
            let me = self.clone();
            Arc::new(move |ctx, msg| {
                let me = me.clone();
                Box::pin(async move { me.handle_publish(ctx, msg).await })
            })
        };
        let on_query: QueryHandler = {
            let me = self.clone();
            Arc::new(move |ctx, msg| {
                let me = me.clone();
                Box::pin(async move { me.handle_query(ctx, msg).await })
            })
        };
        self.connection.configure_handlers(
            Some(on_close),
            Some(on_connect),
            Some(on_publish),
            Some(on_query),
        );
    }

    async fn handle_close(&self, _ctx: ConnectorContext) {
        self.is_open.store(false, Ordering::SeqCst);
        *self.document_client.lock().await = None;
    }

    /// Applies the negotiated source configuration and opens the source.
    async fn handle_connect(&self, _ctx: ConnectorContext, config: Value) {
        let section = config.get("config").unwrap_or(&config);
        let general = section
            .get(EXEC_CONFIG_SECTION)
            .and_then(|exec| exec.get(GENERAL_SECTION));

        let capacity = general
            .and_then(|g| g.get(CODE_CACHE_SIZE))
            .and_then(Value::as_u64)
            .map(|size| size as usize)
            .unwrap_or(DEFAULT_CACHE_CAPACITY);
        let runtime_info = general
            .and_then(|g| g.get(RETURN_RUNTIME_INFO))
            .is_some_and(json_boolean_value);

        self.code_cache.reset(capacity).await;
        self.return_runtime_info.store(runtime_info, Ordering::SeqCst);
        self.is_open.store(true, Ordering::SeqCst);
        debug!(
            source = %self.connection.source(),
            capacity,
            runtime_info,
            "source configured"
        );
    }

    async fn handle_publish(&self, ctx: ConnectorContext, msg: Value) {
        warn!(
            source = %self.connection.source(),
            "unexpected call to publish handler -- context: {ctx:?}, message: {msg}"
        );
    }

    /// Validates a query and schedules its execution. The task runs
    /// concurrently with other queries; responses are correlated by reply
    /// address, not by completion order.
    async fn handle_query(self: &Arc<Self>, ctx: ConnectorContext, msg: Value) {
        if !self.is_open.load(Ordering::SeqCst) {
            error!(
                source = %self.connection.source(),
                "query received while source is not open"
            );
            let error = ErrorMessage::new(
                "io.vantiq.pyexec.query.not.open",
                "Connection to source {0} is currently closed.",
                vec![json!(self.connection.source())],
            );
            self.send_error(&ctx, error).await;
            return;
        }

        let opts = match RequestOptions::parse(self.connection.source(), &msg) {
            Ok(opts) => opts,
            Err(error) => {
                self.send_error(&ctx, error).await;
                return;
            }
        };

        if opts.replace {
            if let Some(name) = &opts.name {
                // Absent entries are considered removed.
                self.code_cache.remove(name).await;
            }
        }

        let task_id = Uuid::new_v4();
        let me = self.clone();
        let handle = task::spawn(async move {
            me.run_script(ctx, opts).await;
            me.delete_user_task(task_id);
        });

        let mut tasks = self.user_tasks.lock().expect("task lock poisoned");
        tasks.retain(|_, handle| !handle.is_finished());
        tasks.insert(task_id, handle.abort_handle());
    }

    fn delete_user_task(&self, task_id: Uuid) {
        let mut tasks = self.user_tasks.lock().expect("task lock poisoned");
        tasks.remove(&task_id);
    }

    async fn run_script(self: &Arc<Self>, ctx: ConnectorContext, opts: RequestOptions) {
        if let Err(error) = self.try_run(&ctx, &opts).await {
            self.send_error(&ctx, error).await;
        }
    }

    async fn send_error(&self, ctx: &ConnectorContext, error: ErrorMessage) {
        if let Err(e) = self.connection.send_query_error(ctx, &error).await {
            error!(
                source = %self.connection.source(),
                "could not deliver query error {}: {e}",
                error.code
            );
        }
    }

    /// Resolves, compiles, executes, and (unless the script handles its own
    /// return) emits the collected results. Any failure comes back as the
    /// error frame to send.
    async fn try_run(
        self: &Arc<Self>,
        ctx: &ConnectorContext,
        opts: &RequestOptions,
    ) -> Result<(), ErrorMessage> {
        let total_timer = Instant::now();
        let source = self.connection.source().to_string();

        let mut using_cached = false;
        let mut artifact: Option<Arc<AST>> = None;
        let mut code_text = opts.code.clone();
        let mut modified_at: Option<Value> = None;
        let pseudo_path: String;

        if let Some(script) = &opts.script {
            debug!(source = %source, script = %script, "executing script from document");
            match self.fetch_script(script).await? {
                Fetched::Cached { artifact: cached } => {
                    using_cached = true;
                    artifact = Some(cached);
                }
                Fetched::Fresh { modified_at: ts, code } => {
                    modified_at = Some(ts);
                    code_text = Some(code);
                }
            }
            pseudo_path = script.clone();
        } else if let Some(name) = &opts.name {
            if let Some(entry) = self.code_cache.get(name).await {
                match &code_text {
                    Some(code) => {
                        if entry.signature() == Some(content_signature(code).as_str()) {
                            artifact = Some(entry.artifact);
                            using_cached = true;
                        } else {
                            // The inline code changed for this name.
                            self.code_cache.remove(name).await;
                        }
                    }
                    None => {
                        artifact = Some(entry.artifact);
                        using_cached = true;
                    }
                }
            }
            pseudo_path = if name.ends_with(".rhai") {
                name.clone()
            } else {
                format!("{name}.rhai")
            };
        } else {
            pseudo_path = format!("code-for-source-{source}-{}", Uuid::new_v4());
        }

        if artifact.is_none() && code_text.is_none() {
            return Err(match &opts.name {
                Some(name) => ErrorMessage::new(
                    format!("{ERROR_PREFIX}.runpython.nocache"),
                    "No cached code was found for name: {0}.",
                    vec![json!(name)],
                ),
                None => ErrorMessage::new(
                    format!("{ERROR_PREFIX}.runpython.nocode"),
                    "No code was provided to execute.",
                    vec![],
                ),
            });
        }

        let mut compile_time = None;
        let artifact = match artifact {
            Some(artifact) => artifact,
            None => {
                let code = code_text.as_deref().unwrap_or_default();
                let compile_timer = Instant::now();
                let ast = runtime::build_engine()
                    .compile(code)
                    .map_err(|e| compile_error(&e, &pseudo_path))?;
                compile_time = Some(compile_timer.elapsed());
                debug!(
                    source = %source,
                    name = opts.name.as_deref().unwrap_or("unnamed"),
                    "using just-compiled code"
                );
                Arc::new(ast)
            }
        };

        let mut cached_new = false;
        if let (Some(name), true, Some(code)) =
            (&opts.name, opts.cache_code && !using_cached, &code_text)
        {
            cached_new = true;
            let origin = if opts.script.is_some() {
                ArtifactOrigin::ModifiedAt(modified_at.clone().unwrap_or(Value::Null))
            } else {
                ArtifactOrigin::Signature(content_signature(code))
            };
            debug!(source = %source, name = %name, "caching code");
            self.code_cache
                .put(
                    name.clone(),
                    CacheEntry {
                        origin,
                        artifact: artifact.clone(),
                    },
                )
                .await;
        }

        // Evaluation is CPU-bound and blocking; run it off the reactor and
        // drain the script's runtime calls concurrently, in emission order.
        let (calls_tx, mut calls_rx) = mpsc::unbounded_channel();
        let exec_timer = Instant::now();
        let eval = {
            let artifact = artifact.clone();
            let pseudo_path = pseudo_path.clone();
            let ctx = ctx.clone();
            let presets = opts.preset_values.clone();
            task::spawn_blocking(move || {
                runtime::execute(&artifact, &pseudo_path, &ctx, &presets, calls_tx)
            })
        };

        let mut set_results: Vec<(String, Value)> = Vec::new();
        let drain = async {
            while let Some(call) = calls_rx.recv().await {
                match call {
                    RuntimeCall::SendResponse { code, body } => {
                        if let Err(e) =
                            self.connection.send_query_response(ctx, code, body).await
                        {
                            error!(source = %source, "script response could not be sent: {e}");
                        }
                    }
                    RuntimeCall::SendError(error) => {
                        if let Err(e) = self.connection.send_query_error(ctx, &error).await {
                            error!(source = %source, "script error could not be sent: {e}");
                        }
                    }
                    RuntimeCall::SendNotification(body) => {
                        if let Err(e) = self.connection.send_notification(body).await {
                            error!(source = %source, "script notification could not be sent: {e}");
                        }
                    }
                    RuntimeCall::SetResult { name, value } => set_results.push((name, value)),
                    RuntimeCall::DeclareUnhealthy => self.connection.declare_unhealthy().await,
                }
            }
        };
        let (eval_result, ()) = tokio::join!(eval, drain);
        let execution_time = exec_timer.elapsed();

        let scope_values = match eval_result {
            Err(join_error) => {
                return Err(ErrorMessage::new(
                    format!("{ERROR_PREFIX}.runpython.exception"),
                    "Executing code in connector resulted in an exception: {0} :: {1}",
                    vec![json!("TaskFailure"), json!(join_error.to_string())],
                ));
            }
            Ok(Err(failure)) => return Err(self.execution_error(failure).await),
            Ok(Ok(values)) => values,
        };

        if !opts.code_handles_return {
            let mut results = Map::new();
            for (name, value) in scope_values {
                if opts.wants_result(&name) {
                    results.insert(name, value);
                }
            }
            // Explicit set_result calls win over scope collection.
            for (name, value) in set_results {
                if opts.wants_result(&name) {
                    results.insert(name, value);
                }
            }

            let mut payload = Map::new();
            payload.insert(SCRIPT_RESULTS.to_string(), Value::Object(results));
            if self.return_runtime_info.load(Ordering::SeqCst) {
                let info = self
                    .runtime_info(
                        opts,
                        using_cached,
                        cached_new,
                        compile_time,
                        execution_time,
                        total_timer.elapsed(),
                    )
                    .await;
                payload.insert(CONNECTOR_INFO.to_string(), info);
            }

            if let Err(e) = self
                .connection
                .send_query_response(ctx, QUERY_COMPLETE, Some(Value::Object(payload)))
                .await
            {
                error!(source = %source, "query result could not be sent: {e}");
            }
        }
        Ok(())
    }

    async fn execution_error(&self, failure: ExecFailure) -> ErrorMessage {
        let (code, kind, diagnostic) = match failure {
            ExecFailure::Import { kind, diagnostic } => {
                (format!("{ERROR_PREFIX}.execution.importerror"), kind, diagnostic)
            }
            ExecFailure::Exhausted { kind, diagnostic } => {
                // Resource exhaustion is the class of failure an
                // orchestrator should restart us for.
                self.connection.declare_unhealthy().await;
                (format!("{ERROR_PREFIX}.execution.exception"), kind, diagnostic)
            }
            ExecFailure::Other { kind, diagnostic } => {
                (format!("{ERROR_PREFIX}.execution.exception"), kind, diagnostic)
            }
        };
        ErrorMessage::new(
            code,
            "Executing code raised exception: {0} :: {1}",
            vec![json!(kind), json!(diagnostic)],
        )
    }

    async fn runtime_info(
        &self,
        opts: &RequestOptions,
        using_cached: bool,
        cached_new: bool,
        compile_time: Option<Duration>,
        execution_time: Duration,
        total_time: Duration,
    ) -> Value {
        let mut info = Map::new();
        info.insert("using_cached".to_string(), json!(using_cached));
        if let Some(name) = &opts.name {
            info.insert("name".to_string(), json!(name));
        }
        info.insert(NEW_CACHE_ENTRY.to_string(), json!(cached_new));
        if let Some(compile_time) = compile_time {
            info.insert(COMPILE_TIME.to_string(), json!(compile_time.as_secs_f64()));
        }
        info.insert(
            EXECUTION_TIME.to_string(),
            json!(execution_time.as_secs_f64()),
        );
        info.insert(TOTAL_TIME.to_string(), json!(total_time.as_secs_f64()));
        info.insert(QUERY_TIME.to_string(), json!(total_time.as_secs_f64()));
        info.insert(
            CURRENT_CACHE_SIZE.to_string(),
            json!(self.code_cache.len().await),
        );
        info.insert(
            CACHE_CAPACITY.to_string(),
            json!(self.code_cache.capacity().await),
        );
        Value::Object(info)
    }

    /// Obtains `(modification timestamp, script body)` for a stored
    /// document, reusing the cached artifact when the timestamp matches.
    async fn fetch_script(&self, script: &str) -> Result<Fetched, ErrorMessage> {
        let client = self.document_client().await?;

        let doc = client
            .select_one(DOCUMENTS_RESOURCE, script)
            .await
            .map_err(store_error_message)?;

        if doc.is_incomplete {
            return Err(ErrorMessage::new(
                format!("{ERROR_PREFIX}.docincomplete"),
                "Document {0} is incomplete and cannot be used.",
                vec![json!(script)],
            ));
        }
        if doc.content_size <= 0 {
            return Err(ErrorMessage::new(
                format!("{ERROR_PREFIX}.doclength"),
                "Document {0} has an invalid length.",
                vec![json!(script), json!(doc.content_size)],
            ));
        }

        let modified_at = doc.modified_at.or(doc.created_at).unwrap_or(Value::Null);
        let content_ref = doc.content.ok_or_else(|| doc_content_empty(script))?;

        if let Some(entry) = self.code_cache.get(script).await {
            if entry.modified_at() == Some(&modified_at) {
                return Ok(Fetched::Cached {
                    artifact: entry.artifact,
                });
            }
            // The document changed; the entry is stale.
            self.code_cache.remove(script).await;
        }

        let bytes = client
            .download(&content_ref)
            .await
            .map_err(store_error_message)?;
        if bytes.is_empty() {
            return Err(doc_content_empty(script));
        }
        let code = String::from_utf8(bytes).map_err(|e| {
            ErrorMessage::new(
                format!("{ERROR_PREFIX}.runpython.exception"),
                "Executing code in connector resulted in an exception: {0} :: {1}",
                vec![json!("Utf8Error"), json!(e.to_string())],
            )
        })?;
        Ok(Fetched::Fresh { modified_at, code })
    }

    /// Lazily constructs the document store client. Only one query builds
    /// it; the lock is held until the field is populated or the failure has
    /// been reported.
    async fn document_client(&self) -> Result<Arc<DocumentClient>, ErrorMessage> {
        let mut guard = self.document_client.lock().await;
        if let Some(client) = guard.as_ref() {
            return Ok(client.clone());
        }

        let config = self.connection.server_config();
        let base_url = http_url_from_ws(&config.target_server).map_err(|e| {
            ErrorMessage::new(
                format!("{ERROR_PREFIX}.vantiqconnectfail"),
                e.to_string(),
                vec![],
            )
        })?;
        let token = config.auth_token.clone().unwrap_or_default();
        let client = DocumentClient::new(&base_url, &token, config.disable_ssl_verification)
            .map_err(|e| {
                ErrorMessage::new(
                    format!("{ERROR_PREFIX}.vantiqconnectfail"),
                    e.to_string(),
                    vec![],
                )
            })?;

        let client = Arc::new(client);
        *guard = Some(client.clone());
        Ok(client)
    }
}

fn store_error_message(err: DocumentError) -> ErrorMessage {
    match err {
        DocumentError::Store(error) => error,
        DocumentError::Http(e) => ErrorMessage::new(
            format!("{ERROR_PREFIX}.vantiqconnectfail"),
            e.to_string(),
            vec![],
        ),
    }
}

fn doc_content_empty(script: &str) -> ErrorMessage {
    ErrorMessage::new(
        format!("{ERROR_PREFIX}.doccontent.empty"),
        "Document content for {0} was empty.",
        vec![json!(script)],
    )
}

/// SHA-256 signature of inline script text, used to invalidate cached
/// artifacts when the code changes under an unchanged name.
fn content_signature(code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(code.as_bytes());
    hex::encode(hasher.finalize())
}

fn compile_error(err: &rhai::ParseError, pseudo_path: &str) -> ErrorMessage {
    ErrorMessage::new(
        format!("{ERROR_PREFIX}.compile.syntaxerror"),
        "Compilation resulted in: {0} :: file {1}, line {2}, offset {3} -- {4}",
        vec![
            json!("SyntaxError"),
            json!(pseudo_path),
            json!(err.1.line()),
            json!(err.1.position()),
            json!(err.0.to_string()),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;

    fn test_connector() -> Arc<ScriptExecConnector> {
        let config = ServerConfig {
            target_server: "ws://localhost:9/api/v1/wsock/websocket".to_string(),
            auth_token: Some("T".to_string()),
            sources: vec!["S".to_string()],
            send_pings: false,
            fail_on_connection_error: false,
            tcp_probe_port: 0,
            fixed_reconnect_secret: None,
            disable_ssl_verification: false,
        };
        ScriptExecConnector::new(Arc::new(SourceConnection::new("S".to_string(), config)))
    }

    fn ctx() -> ConnectorContext {
        ConnectorContext {
            source_name: "S".to_string(),
            response_address: None,
        }
    }

    #[test]
    fn content_signature_is_deterministic() {
        let first = content_signature("let x = 1;");
        let second = content_signature("let x = 1;");
        assert_eq!(first, second);
        assert_ne!(first, content_signature("let x = 2;"));
    }

    #[test]
    fn compile_error_carries_position() {
        let err = runtime::build_engine()
            .compile("let x = ;")
            .expect_err("bad script must not compile");
        let error = compile_error(&err, "broken.rhai");
        assert_eq!(error.code, "io.vantiq.pyexecsource.compile.syntaxerror");
        assert_eq!(error.parameters[1], json!("broken.rhai"));
    }

    #[tokio::test]
    async fn connect_applies_source_configuration() {
        let connector = test_connector();
        connector
            .handle_connect(
                ctx(),
                json!({
                    "pythonExecConfig": {
                        "general": {
                            "codeCacheSize": 4,
                            "returnRuntimeInformation": "true",
                        }
                    }
                }),
            )
            .await;
        assert!(connector.is_open.load(Ordering::SeqCst));
        assert!(connector.return_runtime_info.load(Ordering::SeqCst));
        assert_eq!(connector.cache_capacity().await, 4);
    }

    #[tokio::test]
    async fn connect_unwraps_nested_config() {
        let connector = test_connector();
        connector
            .handle_connect(
                ctx(),
                json!({"config": {"pythonExecConfig": {"general": {"codeCacheSize": 2}}}}),
            )
            .await;
        assert_eq!(connector.cache_capacity().await, 2);
    }

    #[tokio::test]
    async fn connect_defaults_when_sections_absent() {
        let connector = test_connector();
        connector.handle_connect(ctx(), json!({})).await;
        assert_eq!(connector.cache_capacity().await, DEFAULT_CACHE_CAPACITY);
        assert!(!connector.return_runtime_info.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn close_marks_source_closed() {
        let connector = test_connector();
        connector.handle_connect(ctx(), json!({})).await;
        connector.handle_close(ctx()).await;
        assert!(!connector.is_open.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn runtime_info_reports_cache_state() {
        let connector = test_connector();
        connector.handle_connect(ctx(), json!({})).await;
        let opts = RequestOptions {
            name: Some("a".to_string()),
            ..Default::default()
        };
        let info = connector
            .runtime_info(
                &opts,
                true,
                false,
                None,
                Duration::from_millis(5),
                Duration::from_millis(9),
            )
            .await;
        assert_eq!(info["using_cached"], json!(true));
        assert_eq!(info["name"], json!("a"));
        assert_eq!(info[NEW_CACHE_ENTRY], json!(false));
        assert!(info.get(COMPILE_TIME).is_none());
        assert_eq!(info[CURRENT_CACHE_SIZE], json!(0));
        assert_eq!(info[CACHE_CAPACITY], json!(DEFAULT_CACHE_CAPACITY));
        assert!(info[TOTAL_TIME].as_f64().unwrap() > 0.0);
        assert_eq!(info[TOTAL_TIME], info[QUERY_TIME]);
    }
}
