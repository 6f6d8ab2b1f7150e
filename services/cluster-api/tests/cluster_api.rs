//! HTTP round trips against an in-process server backed by the in-memory
//! registry and a temporary artifact tree.

use std::sync::Arc;
use std::time::Duration;

use clustree_affinity::{ArtifactKey, ArtifactStore};
use clustree_cluster_api::{
    api,
    registry::{ClusterRegistry, IdentityDirectory, MemoryRegistry},
    service::ClusterService,
    solver::{RunnerConfig, SolverJobRunner},
    state::AppState,
};
use reqwest::{
    multipart::{Form, Part},
    Client, StatusCode,
};
use serde_json::Value;
use tempfile::TempDir;

const TEACHER: &str = "teacher@school.edu";
const STUDENT: &str = "ada@school.edu";
const OTHER_TEACHER: &str = "grace@school.edu";

struct TestApp {
    base_url: String,
    client: Client,
    store: Arc<ArtifactStore>,
    _tmp: TempDir,
}

impl TestApp {
    async fn spawn() -> Self {
        let tmp = TempDir::new().expect("tempdir");
        let scripts_dir = tmp.path().join("solvers");
        std::fs::create_dir_all(&scripts_dir).expect("scripts dir");
        #[cfg(unix)]
        write_solvers(&scripts_dir);

        let registry = Arc::new(MemoryRegistry::new());
        for email in [TEACHER, STUDENT, OTHER_TEACHER] {
            registry.add_user(email).await;
        }
        let identities: Arc<dyn IdentityDirectory> = registry.clone();

        let store = Arc::new(ArtifactStore::new(tmp.path().join("uploads")));
        let runner = Arc::new(SolverJobRunner::new(
            RunnerConfig {
                scripts_dir,
                timeout: Duration::from_secs(10),
            },
            store.clone(),
        ));
        let service = ClusterService::new(
            registry as Arc<dyn ClusterRegistry>,
            identities,
            store.clone(),
            runner,
        );
        let app = api::create_router(AppState::new(service, 1024 * 1024));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("server");
        });

        Self {
            base_url: format!("http://{addr}"),
            client: Client::new(),
            store,
            _tmp: tmp,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn get(&self, path: &str, as_user: &str) -> reqwest::RequestBuilder {
        self.client.get(self.url(path)).bearer_auth(format!("user:{as_user}"))
    }

    fn post(&self, path: &str, as_user: &str) -> reqwest::RequestBuilder {
        self.client.post(self.url(path)).bearer_auth(format!("user:{as_user}"))
    }

    fn delete(&self, path: &str, as_user: &str) -> reqwest::RequestBuilder {
        self.client.delete(self.url(path)).bearer_auth(format!("user:{as_user}"))
    }

    async fn create(&self, as_user: &str, name: &str, roster: &'static [u8]) -> reqwest::Response {
        let form = Form::new()
            .text("name", name.to_string())
            .text("groupSize", "3")
            .part("file", Part::bytes(roster).file_name("roster.csv"));
        self.post("/cluster/teacher/create", as_user)
            .multipart(form)
            .send()
            .await
            .expect("create request")
    }

    /// Create a cluster and return its id.
    async fn create_ok(&self, name: &str, roster: &'static [u8]) -> String {
        let resp = self.create(TEACHER, name, roster).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let body: Value = resp.json().await.expect("json");
        body["cluster"]["id"].as_str().expect("cluster id").to_string()
    }
}

#[cfg(unix)]
fn write_solvers(dir: &std::path::Path) {
    use std::os::unix::fs::PermissionsExt;

    for (name, body) in [
        (
            "greedy",
            "#!/bin/sh\necho \"solving $1\"\necho '{\"Groups\":{\"0\":[\"ada@school.edu\"]}}' > result.json\n",
        ),
        ("broken", "#!/bin/sh\necho 'cannot partition' >&2\nexit 2\n"),
    ] {
        let path = dir.join(name);
        std::fs::write(&path, body).expect("write solver");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("chmod solver");
    }
}

const CSV_ROSTER: &[u8] = b"name,email\nAda,ada@school.edu\nBob,bob@school.edu\nAda again,ada@school.edu\n";
const JSON_ROSTER: &[u8] = br#"["ada@school.edu", "linus@school.edu"]"#;

#[tokio::test]
async fn health_endpoints_respond() {
    let app = TestApp::spawn().await;

    let resp = app.client.get(app.url("/healthz")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app.client.get(app.url("/readyz")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn requests_without_known_identity_are_rejected() {
    let app = TestApp::spawn().await;

    let resp = app
        .client
        .get(app.url("/cluster/teacher/list"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "unauthenticated");

    let resp = app
        .get("/cluster/teacher/list", "nobody@school.edu")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "unknown_user");
}

#[tokio::test]
async fn create_writes_artifact_and_grants_known_students() {
    let app = TestApp::spawn().await;

    let resp = app.create(TEACHER, " maths ", CSV_ROSTER).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let body: Value = resp.json().await.unwrap();

    assert_eq!(body["cluster"]["name"], "maths");
    assert_eq!(body["cluster"]["groupSize"], 3);
    assert_eq!(body["cluster"]["clusterType"], "default");
    assert_eq!(body["artifact"], "created");
    assert_eq!(body["authorized"].as_array().unwrap().len(), 1);
    assert_eq!(body["unresolved"], serde_json::json!(["bob@school.edu"]));

    let key = ArtifactKey::new(TEACHER, "maths").unwrap();
    let artifact = app.store.read(&key).await.unwrap();
    assert_eq!(artifact.graph.node_count(), 2);
    assert_eq!(artifact.cli.group_size, 3);

    let resp = app.get("/cluster/teacher/list", TEACHER).send().await.unwrap();
    let list: Value = resp.json().await.unwrap();
    assert_eq!(list["total"], 1);
    assert_eq!(list["items"][0]["name"], "maths");

    let resp = app.get("/cluster/student/list", STUDENT).send().await.unwrap();
    let list: Value = resp.json().await.unwrap();
    assert_eq!(list["total"], 1);

    let resp = app.get("/cluster/student/list", OTHER_TEACHER).send().await.unwrap();
    let list: Value = resp.json().await.unwrap();
    assert_eq!(list["total"], 0);
}

#[tokio::test]
async fn create_rejects_bad_input() {
    let app = TestApp::spawn().await;

    let resp = app.create(TEACHER, "maths", b"{\"emails\": []}").await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        resp.headers()["content-type"],
        "application/problem+json"
    );
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "invalid_roster");

    let resp = app.create(TEACHER, "maths", b"email\n").await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "empty_roster");

    let resp = app.create(TEACHER, "../escape", JSON_ROSTER).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let form = Form::new().text("name", "maths");
    let resp = app
        .post("/cluster/teacher/create", TEACHER)
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "missing_roster");

    // Nothing was persisted by the failed attempts.
    let resp = app.get("/cluster/teacher/list", TEACHER).send().await.unwrap();
    let list: Value = resp.json().await.unwrap();
    assert_eq!(list["total"], 0);
    assert!(!app
        .store
        .exists(&ArtifactKey::new(TEACHER, "maths").unwrap())
        .await
        .unwrap());
}

#[tokio::test]
async fn duplicate_name_conflicts() {
    let app = TestApp::spawn().await;
    app.create_ok("maths", JSON_ROSTER).await;

    let resp = app.create(TEACHER, "maths", JSON_ROSTER).await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "cluster_exists");

    // Another teacher may reuse the name.
    let resp = app.create(OTHER_TEACHER, "maths", JSON_ROSTER).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn graph_reads_follow_access() {
    let app = TestApp::spawn().await;
    let id = app.create_ok("maths", JSON_ROSTER).await;

    let resp = app
        .get(&format!("/cluster/{id}/graph/raw"), STUDENT)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let graph: Value = resp.json().await.unwrap();
    assert_eq!(graph["CLI"]["groupSize"], 3);
    assert_eq!(graph["Graph"].as_object().unwrap().len(), 2);

    let resp = app
        .get(&format!("/cluster/{id}/graph/file"), TEACHER)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers()["content-disposition"],
        "attachment; filename=\"maths-graph.json\""
    );
    let bytes = resp.bytes().await.unwrap();
    let key = ArtifactKey::new(TEACHER, "maths").unwrap();
    assert_eq!(bytes.as_ref(), app.store.read_raw(&key).await.unwrap().as_slice());

    let resp = app
        .get(&format!("/cluster/{id}/graph/raw"), OTHER_TEACHER)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let resp = app
        .get("/cluster/not-an-id/graph/raw", TEACHER)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "invalid_cluster_id");

    let resp = app
        .get(&format!("/cluster/{id}/result"), TEACHER)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "result_missing");
}

#[tokio::test]
async fn delete_removes_cluster_grants_and_artifact() {
    let app = TestApp::spawn().await;
    let id = app.create_ok("maths", JSON_ROSTER).await;

    let resp = app
        .delete(&format!("/cluster/teacher/delete/{id}"), OTHER_TEACHER)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let resp = app
        .delete(&format!("/cluster/teacher/delete/{id}"), TEACHER)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["deleted"], true);

    let resp = app.get("/cluster/student/list", STUDENT).send().await.unwrap();
    let list: Value = resp.json().await.unwrap();
    assert_eq!(list["total"], 0);

    let resp = app
        .get(&format!("/cluster/{id}/graph/raw"), TEACHER)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "cluster_not_found");

    let key = ArtifactKey::new(TEACHER, "maths").unwrap();
    assert!(!app.store.exists(&key).await.unwrap());

    let resp = app
        .delete(&format!("/cluster/teacher/delete/{id}"), TEACHER)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn audit_reports_both_directions() {
    let app = TestApp::spawn().await;
    app.create_ok("maths", JSON_ROSTER).await;
    app.create_ok("physics", JSON_ROSTER).await;

    let physics = ArtifactKey::new(TEACHER, "physics").unwrap();
    assert!(app.store.remove(&physics).await.unwrap());
    let orphan = app.store.cluster_dir(&ArtifactKey::new(TEACHER, "orphan").unwrap());
    std::fs::create_dir_all(&orphan).unwrap();

    let resp = app.get("/cluster/teacher/audit", TEACHER).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    let states: Vec<(String, String)> = body["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| {
            (
                e["name"].as_str().unwrap().to_string(),
                e["state"].as_str().unwrap().to_string(),
            )
        })
        .collect();

    assert!(states.contains(&("maths".into(), "consistent".into())));
    assert!(states.contains(&("physics".into(), "artifact_missing".into())));
    assert!(states.contains(&("orphan".into(), "metadata_missing".into())));
}

#[cfg(unix)]
#[tokio::test]
async fn solver_run_and_result() {
    let app = TestApp::spawn().await;
    let id = app.create_ok("maths", JSON_ROSTER).await;

    let resp = app.client.get(app.url("/cluster/scripts")).send().await.unwrap();
    let scripts: Value = resp.json().await.unwrap();
    assert_eq!(scripts["items"], serde_json::json!(["broken", "greedy"]));

    let resp = app
        .post(&format!("/cluster/teacher/{id}/run/greedy"), TEACHER)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let run: Value = resp.json().await.unwrap();
    assert_eq!(run["status"], "succeeded");
    assert!(run["stdout"].as_str().unwrap().starts_with("solving "));

    let resp = app
        .get(&format!("/cluster/{id}/result"), STUDENT)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let result: Value = resp.json().await.unwrap();
    assert_eq!(result["Groups"]["0"][0], "ada@school.edu");

    let resp = app
        .get(&format!("/cluster/teacher/{id}/job"), TEACHER)
        .send()
        .await
        .unwrap();
    let status: Value = resp.json().await.unwrap();
    assert_eq!(status["state"], "succeeded");
    assert_eq!(status["script"], "greedy");
}

#[cfg(unix)]
#[tokio::test]
async fn solver_failure_carries_stderr() {
    let app = TestApp::spawn().await;
    let id = app.create_ok("maths", JSON_ROSTER).await;

    let resp = app
        .post(&format!("/cluster/teacher/{id}/run/broken"), TEACHER)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "solver_failed");
    assert_eq!(body["stderr"], "cannot partition\n");

    let resp = app
        .post(&format!("/cluster/teacher/{id}/run/missing"), TEACHER)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "script_not_found");

    // Students can read but not run.
    let resp = app
        .post(&format!("/cluster/teacher/{id}/run/greedy"), STUDENT)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}
