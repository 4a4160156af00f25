mod test_harness;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use jobcoord::dashboard::{router, DashboardState};
use jobcoord::model::JobStatus;

use test_harness::{request_with_tags, shell_request, test_node};

fn app(root: &std::path::Path) -> (Router, std::sync::Arc<jobcoord::node::Node>) {
    let node = test_node(root, &[]);
    (router(DashboardState::new(node.clone())), node)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body.to_vec())
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: &impl serde::Serialize) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

fn json(body: &[u8]) -> Value {
    serde_json::from_slice(body).unwrap()
}

#[tokio::test]
async fn test_list_jobs_empty() {
    let root = tempfile::tempdir().unwrap();
    let (app, _node) = app(root.path());

    let (status, body) = send(&app, get("/api/jobs")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json(&body), Value::Array(Vec::new()));
}

#[tokio::test]
async fn test_submit_and_follow_job() {
    let root = tempfile::tempdir().unwrap();
    let (app, node) = app(root.path());
    let request = shell_request("echo via http")
        .with_requested_id("http-job")
        .with_archiving_disabled(true);

    let (status, body) = send(&app, post_json("/api/jobs", &request)).await;
    assert_eq!(status, StatusCode::CREATED);
    let body = json(&body);
    assert_eq!(body["success"], true);
    assert_eq!(body["job_id"], "http-job");

    let outcome = node.launcher().wait("http-job").await.unwrap();
    assert_eq!(outcome.status, JobStatus::Succeeded);

    let (status, body) = send(&app, get("/api/jobs/http-job")).await;
    assert_eq!(status, StatusCode::OK);
    let record = json(&body);
    assert_eq!(record["status"], "SUCCEEDED");
    assert_eq!(record["api_job"], true);

    let (_, body) = send(&app, get("/api/jobs")).await;
    let jobs = json(&body);
    assert_eq!(jobs.as_array().unwrap().len(), 1);
    assert_eq!(jobs[0]["id"], "http-job");
    assert_eq!(jobs[0]["name"], "test-job");
    assert_eq!(jobs[0]["user"], "tester");
}

#[tokio::test]
async fn test_submit_duplicate_id_conflicts() {
    let root = tempfile::tempdir().unwrap();
    let (app, node) = app(root.path());
    let request = shell_request("true")
        .with_requested_id("twice")
        .with_archiving_disabled(true);

    let (status, _) = send(&app, post_json("/api/jobs", &request)).await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, body) = send(&app, post_json("/api/jobs", &request)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json(&body)["success"], false);

    node.launcher().wait("twice").await;
}

#[tokio::test]
async fn test_submit_unresolvable_job() {
    let root = tempfile::tempdir().unwrap();
    let (app, _node) = app(root.path());
    let request = request_with_tags(&[&["gpu"]], &["shell"]);

    let (status, body) = send(&app, post_json("/api/jobs", &request)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    let body = json(&body);
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("gpu"));
}

#[tokio::test]
async fn test_resolve_dry_run() {
    let root = tempfile::tempdir().unwrap();
    let (app, node) = app(root.path());
    let request = shell_request("true").with_requested_id("preview");

    let (status, body) = send(&app, post_json("/api/jobs/resolve", &request)).await;
    assert_eq!(status, StatusCode::OK);
    let spec = json(&body);
    assert_eq!(spec["cluster"]["id"], "batch-1");
    assert_eq!(spec["command"]["id"], "sh");

    assert!(node
        .server()
        .coordinator()
        .store()
        .list_jobs()
        .await
        .is_empty());
}

#[tokio::test]
async fn test_unknown_job() {
    let root = tempfile::tempdir().unwrap();
    let (app, _node) = app(root.path());

    let (status, _) = send(&app, get("/api/jobs/missing")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let kill = Request::builder()
        .method("POST")
        .uri("/api/jobs/missing/kill")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, kill).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, get("/api/jobs/missing/manifest")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_kill_reserved_job() {
    let root = tempfile::tempdir().unwrap();
    let (app, node) = app(root.path());
    let job_id = node
        .server()
        .coordinator()
        .reserve_job_id(shell_request("true"), None, true)
        .await
        .unwrap();

    let kill = Request::builder()
        .method("POST")
        .uri(format!("/api/jobs/{}/kill", job_id))
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, kill).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json(&body)["outcome"], "killed_before_start");

    let kill = Request::builder()
        .method("POST")
        .uri(format!("/api/jobs/{}/kill", job_id))
        .body(Body::empty())
        .unwrap();
    let (_, body) = send(&app, kill).await;
    assert_eq!(json(&body)["outcome"], "already_finished");
}

#[tokio::test]
async fn test_file_of_job_without_agent_is_not_found() {
    let root = tempfile::tempdir().unwrap();
    let (app, _node) = app(root.path());

    let (status, _) = send(&app, get("/api/jobs/no-agent/files/stdout")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_malformed_and_multiple_ranges() {
    let root = tempfile::tempdir().unwrap();
    let (app, _node) = app(root.path());

    for range in ["lines=0-4", "bytes=0-1,4-5", "bytes=9-2"] {
        let request = Request::builder()
            .uri("/api/jobs/job/files/stdout")
            .header(header::RANGE, range)
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&app, request).await;
        assert_eq!(status, StatusCode::RANGE_NOT_SATISFIABLE, "range {}", range);
    }
}

#[tokio::test]
async fn test_path_escaping_job_directory() {
    let root = tempfile::tempdir().unwrap();
    let (app, _node) = app(root.path());

    let (status, _) = send(&app, get("/api/jobs/job/files/..%2F..%2Fetc%2Fpasswd")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
