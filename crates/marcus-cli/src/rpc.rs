//! JSON-RPC over stdio (§6.3): the agent-facing wire transport. Reads
//! newline-delimited JSON-RPC 2.0 requests from stdin, dispatches them to
//! the [`Coordinator`], and writes newline-delimited responses to stdout.

use std::sync::Arc;

use marcus_core::coordinator::Coordinator;
use marcus_core::error::CoreError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[derive(Debug, Deserialize)]
struct Request {
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
struct Response {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

#[derive(Debug, Serialize)]
struct RpcError {
    code: i32,
    message: String,
}

impl From<&CoreError> for RpcError {
    fn from(e: &CoreError) -> Self {
        Self { code: e.code(), message: e.to_string() }
    }
}

fn parse_error(id: Value, message: String) -> Response {
    Response { jsonrpc: "2.0", id, result: None, error: Some(RpcError { code: -32700, message }) }
}

fn method_not_found(id: Value, method: &str) -> Response {
    Response { jsonrpc: "2.0", id, result: None, error: Some(RpcError { code: -32601, message: format!("unknown method: {method}") }) }
}

fn invalid_params(id: Value, message: String) -> Response {
    Response { jsonrpc: "2.0", id, result: None, error: Some(RpcError { code: -32602, message }) }
}

/// Serve JSON-RPC requests over stdin/stdout until stdin closes.
pub async fn serve(coordinator: Arc<Coordinator>) -> anyhow::Result<()> {
    let stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(stdin).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = handle_line(&coordinator, &line).await;
        let mut serialized = serde_json::to_string(&response)?;
        serialized.push('\n');
        stdout.write_all(serialized.as_bytes()).await?;
        stdout.flush().await?;
    }
    Ok(())
}

async fn handle_line(coordinator: &Arc<Coordinator>, line: &str) -> Response {
    let request: Request = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => return parse_error(Value::Null, e.to_string()),
    };
    dispatch(coordinator, request).await
}

async fn dispatch(coordinator: &Arc<Coordinator>, request: Request) -> Response {
    let id = request.id.clone();
    match request.method.as_str() {
        "register_agent" => dispatch_register_agent(coordinator, id, request.params).await,
        "request_next_task" => dispatch_request_next_task(coordinator, id, request.params).await,
        "report_task_progress" => dispatch_report_task_progress(coordinator, id, request.params).await,
        "report_blocker" => dispatch_report_blocker(coordinator, id, request.params).await,
        "get_task_context" => dispatch_get_task_context(coordinator, id, request.params).await,
        "release_task" => dispatch_release_task(coordinator, id, request.params).await,
        "ping" => dispatch_ping(coordinator, id, request.params).await,
        other => method_not_found(id, other),
    }
}

fn ok(id: Value, result: impl Serialize) -> Response {
    Response { jsonrpc: "2.0", id, result: serde_json::to_value(result).ok(), error: None }
}

fn err(id: Value, e: CoreError) -> Response {
    Response { jsonrpc: "2.0", id, result: None, error: Some(RpcError::from(&e)) }
}

#[derive(Deserialize)]
struct RegisterAgentParams {
    agent_id: String,
    name: String,
    role: String,
    #[serde(default)]
    skills: Vec<String>,
}

async fn dispatch_register_agent(coordinator: &Arc<Coordinator>, id: Value, params: Value) -> Response {
    let p: RegisterAgentParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => return invalid_params(id, e.to_string()),
    };
    match coordinator.register_agent(&p.agent_id, &p.name, &p.role, p.skills).await {
        Ok(out) => ok(id, out),
        Err(e) => err(id, e),
    }
}

#[derive(Deserialize)]
struct AgentIdParams {
    agent_id: String,
}

async fn dispatch_request_next_task(coordinator: &Arc<Coordinator>, id: Value, params: Value) -> Response {
    let p: AgentIdParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => return invalid_params(id, e.to_string()),
    };
    match coordinator.request_next_task(&p.agent_id).await {
        Ok(out) => ok(id, out),
        Err(e) => err(id, e),
    }
}

#[derive(Deserialize)]
struct ReportTaskProgressParams {
    agent_id: String,
    task_id: String,
    status: String,
    #[serde(default)]
    progress: u8,
    message: Option<String>,
}

async fn dispatch_report_task_progress(coordinator: &Arc<Coordinator>, id: Value, params: Value) -> Response {
    let p: ReportTaskProgressParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => return invalid_params(id, e.to_string()),
    };
    match coordinator.report_task_progress(&p.agent_id, &p.task_id, &p.status, p.progress, p.message).await {
        Ok(out) => ok(id, out),
        Err(e) => err(id, e),
    }
}

#[derive(Deserialize)]
struct ReportBlockerParams {
    agent_id: String,
    task_id: String,
    description: String,
    severity: String,
}

async fn dispatch_report_blocker(coordinator: &Arc<Coordinator>, id: Value, params: Value) -> Response {
    let p: ReportBlockerParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => return invalid_params(id, e.to_string()),
    };
    match coordinator.report_blocker(&p.agent_id, &p.task_id, &p.description, &p.severity).await {
        Ok(out) => ok(id, out),
        Err(e) => err(id, e),
    }
}

#[derive(Deserialize)]
struct TaskIdParams {
    task_id: String,
}

async fn dispatch_get_task_context(coordinator: &Arc<Coordinator>, id: Value, params: Value) -> Response {
    let p: TaskIdParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => return invalid_params(id, e.to_string()),
    };
    match coordinator.get_task_context(&p.task_id).await {
        Ok(out) => ok(id, out),
        Err(e) => err(id, e),
    }
}

#[derive(Deserialize)]
struct ReleaseTaskParams {
    agent_id: String,
    task_id: String,
}

async fn dispatch_release_task(coordinator: &Arc<Coordinator>, id: Value, params: Value) -> Response {
    let p: ReleaseTaskParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => return invalid_params(id, e.to_string()),
    };
    match coordinator.release_task(&p.agent_id, &p.task_id).await {
        Ok(out) => ok(id, out),
        Err(e) => err(id, e),
    }
}

#[derive(Deserialize, Default)]
struct PingParams {
    #[serde(default = "default_level")]
    level: String,
}

fn default_level() -> String {
    "basic".to_string()
}

async fn dispatch_ping(coordinator: &Arc<Coordinator>, id: Value, params: Value) -> Response {
    let p: PingParams = if params.is_null() { PingParams::default() } else { serde_json::from_value(params).unwrap_or_default() };
    ok(id, coordinator.ping(&p.level).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use marcus_core::coordinator::CoordinatorConfig;
    use marcus_core::events::EventBus;
    use marcus_core::infer::{DependencyInferer, InferConfig};
    use marcus_core::lease::{LeaseConfig, LeaseManager};
    use marcus_db::cache::DependencyCache;
    use marcus_db::ledger::AssignmentLedger;
    use marcus_test_utils::FakeBoard;

    async fn coordinator() -> (Arc<Coordinator>, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let board = Arc::new(FakeBoard::new(vec![]));
        let ledger = Arc::new(AssignmentLedger::open(dir.path(), false));
        let events = Arc::new(EventBus::new(100));
        let lease_manager = LeaseManager::new(ledger.clone(), events.clone(), LeaseConfig::default());
        let cache = Arc::new(DependencyCache::open(dir.path(), false));
        let inferer = DependencyInferer::new(InferConfig::default(), None, cache);
        (Arc::new(Coordinator::new(board, None, ledger, lease_manager, events, inferer, CoordinatorConfig::default())), dir)
    }

    #[tokio::test]
    async fn register_agent_round_trips_over_rpc() {
        let (coordinator, _dir) = coordinator().await;
        let request = Request {
            id: Value::from(1),
            method: "register_agent".to_string(),
            params: serde_json::json!({"agent_id": "a1", "name": "Agent", "role": "engineer", "skills": []}),
        };
        let response = dispatch(&coordinator, request).await;
        assert!(response.error.is_none());
        assert_eq!(response.result.unwrap()["ok"], true);
    }

    #[tokio::test]
    async fn unknown_method_returns_method_not_found() {
        let (coordinator, _dir) = coordinator().await;
        let request = Request { id: Value::from(1), method: "bogus".to_string(), params: Value::Null };
        let response = dispatch(&coordinator, request).await;
        assert_eq!(response.error.unwrap().code, -32601);
    }

    #[tokio::test]
    async fn request_next_task_without_registration_maps_to_core_error_code() {
        let (coordinator, _dir) = coordinator().await;
        let request =
            Request { id: Value::from(2), method: "request_next_task".to_string(), params: serde_json::json!({"agent_id": "ghost"}) };
        let response = dispatch(&coordinator, request).await;
        assert_eq!(response.error.unwrap().code, CoreError::NotRegistered(String::new()).code());
    }

    #[tokio::test]
    async fn ping_defaults_to_basic_level() {
        let (coordinator, _dir) = coordinator().await;
        let request = Request { id: Value::from(3), method: "ping".to_string(), params: Value::Null };
        let response = dispatch(&coordinator, request).await;
        assert_eq!(response.result.unwrap()["level"], "basic");
    }

    #[tokio::test]
    async fn malformed_json_yields_parse_error() {
        let (coordinator, _dir) = coordinator().await;
        let response = handle_line(&coordinator, "not json").await;
        assert_eq!(response.error.unwrap().code, -32700);
    }
}
