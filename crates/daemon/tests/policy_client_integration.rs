use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use hubsync_common::assignment::DesiredAssignment;
use hubsync_daemon::authz::client::{CompileRequest, PolicyClient, PolicyEngine, PolicyError};
use hubsync_daemon::authz::predicate::Predicate;
use hubsync_daemon::authz::{Authorizer, PolicyAuthorizer};
use hubsync_daemon::db::status::StatusDb;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use url::Url;

async fn serve(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("listener should bind");
    let addr = listener.local_addr().expect("listener should have an address");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("policy engine stub should serve");
    });
    addr
}

fn client(addr: SocketAddr) -> PolicyClient {
    let base = Url::parse(&format!("http://{addr}")).expect("stub url should parse");
    PolicyClient::with_http_client(reqwest::Client::new(), &base).expect("client should build")
}

fn name_equals(name: &str) -> Value {
    json!({
        "terms": [
            {"type": "ref", "value": [{"type": "var", "value": "eq"}]},
            {"type": "ref", "value": [
                {"type": "var", "value": "input"},
                {"type": "string", "value": "cluster"},
                {"type": "string", "value": "metadata"},
                {"type": "string", "value": "name"}
            ]},
            {"type": "string", "value": name}
        ]
    })
}

/// Answers every compile request with `residual` and records request bodies.
fn compile_stub(residual: Value, seen: Arc<Mutex<Vec<Value>>>) -> Router {
    Router::new().route(
        "/v1/compile",
        post(move |Json(body): Json<Value>| {
            let residual = residual.clone();
            let seen = Arc::clone(&seen);
            async move {
                seen.lock().expect("seen lock should not be poisoned").push(body);
                Json(residual)
            }
        }),
    )
}

#[tokio::test]
async fn compile_posts_partial_evaluation_request() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let residual = json!({"result": {"queries": [[name_equals("c1")]]}});
    let addr = serve(compile_stub(residual, Arc::clone(&seen))).await;

    let response = client(addr)
        .compile(&CompileRequest::cluster_access("alice"))
        .await
        .expect("compile should succeed");

    assert_eq!(response.queries().len(), 1);
    let seen = seen.lock().expect("seen lock should not be poisoned").clone();
    assert_eq!(
        seen,
        vec![json!({
            "input": {"user": "alice"},
            "query": "data.rbac.clusters.allow == true",
            "unknowns": ["input.cluster"]
        })]
    );
}

#[tokio::test]
async fn non_ok_status_is_an_error() {
    let router = Router::new().route(
        "/v1/compile",
        post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "policy engine exploded") }),
    );
    let addr = serve(router).await;

    let error = client(addr)
        .compile(&CompileRequest::cluster_access("alice"))
        .await
        .expect_err("500 should fail");
    assert!(matches!(error, PolicyError::Status(500)));
}

#[tokio::test]
async fn malformed_body_is_a_decode_error() {
    let router = Router::new().route("/v1/compile", post(|| async { "not json" }));
    let addr = serve(router).await;

    let error = client(addr)
        .compile(&CompileRequest::cluster_access("alice"))
        .await
        .expect_err("garbage should fail");
    assert!(matches!(error, PolicyError::Decode(_)));
}

/// Status rows as (hub, payload), filtered in memory.
struct StatusRows(Vec<(&'static str, Value)>);

#[async_trait]
impl StatusDb for StatusRows {
    async fn accessible_managed_clusters(
        &self,
        filter: &Predicate,
    ) -> Result<DesiredAssignment, sqlx::Error> {
        Ok(self
            .0
            .iter()
            .filter(|(_, payload)| filter.matches(payload))
            .filter_map(|(hub, payload)| {
                let name = payload.pointer("/metadata/name")?.as_str()?;
                Some((hub.to_string(), name.to_owned()))
            })
            .collect())
    }
}

#[tokio::test]
async fn authorizer_denies_clusters_outside_the_residual() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let residual = json!({"result": {"queries": [[name_equals("c1")], [name_equals("c3")]]}});
    let addr = serve(compile_stub(residual, seen)).await;

    let status = StatusRows(vec![
        ("hubA", json!({"metadata": {"name": "c1"}})),
        ("hubA", json!({"metadata": {"name": "c2"}})),
        ("hubB", json!({"metadata": {"name": "c3"}})),
    ]);
    let authorizer = PolicyAuthorizer::new(client(addr), status);
    let requested = DesiredAssignment::new().with("hubA", ["c1", "c2"]).with("hubB", ["c3", "c4"]);

    let unauthorized =
        authorizer.unauthorized("alice", &[], &requested).await.expect("authorization runs");

    assert_eq!(unauthorized, DesiredAssignment::new().with("hubA", ["c2"]).with("hubB", ["c4"]));
}

#[tokio::test]
async fn unreachable_policy_engine_denies_everything() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("listener should bind");
    let addr = listener.local_addr().expect("listener should have an address");
    drop(listener);

    let status = StatusRows(vec![("hubA", json!({"metadata": {"name": "c1"}}))]);
    let authorizer = PolicyAuthorizer::new(client(addr), status);
    let requested = DesiredAssignment::new().with("hubA", ["c1"]);

    let unauthorized =
        authorizer.unauthorized("alice", &[], &requested).await.expect("authorization runs");
    assert_eq!(unauthorized, requested);
}
