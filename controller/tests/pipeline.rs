use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, put},
    Json, Router,
};
use haproxy_canary_controller::{
    events::{Intake, CALLBACK_PATH},
    marathon,
    reload::{self, Reload},
    scheduler::{Cycle, Outcome},
    weights::ServerWeight,
    Health, MemoryStore, Pipeline, PipelineConfig, Scheduler, Trigger, Update, Weight,
    WeightStore,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::{
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

const TEMPLATE: &str = "\
{% for fe in frontends %}frontend {{ fe.name }}
  bind *:{{ fe.bind_port }}
{% for s in fe.servers %}  server {{ s.name }} {{ s.host }}:{{ s.port }} weight {{ weights[s.name] }}
{% endfor %}{% endfor %}";

const EXPECTED: &str = "\
frontend web-http-8080
  bind *:8080
  server web-h1-1-31000 h1:31000 weight 1
  server web-h2-1-31001 h2:31001 weight 1
  server web-h3-2-31002 h3:31002 weight 0
";

#[derive(Clone, Default)]
struct Sidecar {
    reloads: Arc<Mutex<usize>>,
    weights: Arc<Mutex<Vec<Vec<ServerWeight>>>>,
    reject_weights: Arc<AtomicBool>,
}

#[derive(Clone)]
struct FakeMarathon {
    apps: Arc<Mutex<Value>>,
    tasks: Arc<Mutex<Value>>,
}

async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
    format!("http://{addr}")
}

fn app(id: &str, version: &str) -> Value {
    json!({
        "id": id,
        "env": {
            "SRY_APP_ID": "/web",
            "SRY_APP_VSN": version,
            "BB_DM_ENDPOINTS": "pub:http:nil:8080",
        },
        "healthChecks": [{"protocol": "HTTP", "path": "/health", "portIndex": 0}],
        "ports": [10000],
    })
}

fn task(app_id: &str, id: &str, host: &str, port: u16) -> Value {
    json!({"appId": app_id, "id": id, "host": host, "ports": [port], "version": "2024-01-01"})
}

async fn fake_marathon() -> (FakeMarathon, String) {
    let marathon = FakeMarathon {
        apps: Arc::new(Mutex::new(json!({"apps": [app("/web-1", "1"), app("/web-2", "2")]}))),
        tasks: Arc::new(Mutex::new(json!({"tasks": [
            task("/web-1", "a", "h1", 31000),
            task("/web-1", "b", "h2", 31001),
            task("/web-2", "c", "h3", 31002),
        ]}))),
    };
    let router = Router::new()
        .route(
            "/v2/apps",
            get(|State(m): State<FakeMarathon>| async move { Json(m.apps.lock().clone()) }),
        )
        .route(
            "/v2/tasks",
            get(|State(m): State<FakeMarathon>| async move { Json(m.tasks.lock().clone()) }),
        )
        .with_state(marathon.clone());
    let url = serve(router).await;
    (marathon, url)
}

async fn fake_sidecar() -> (Sidecar, String) {
    let sidecar = Sidecar::default();
    let router = Router::new()
        .route(
            "/api/haproxy",
            put(|State(s): State<Sidecar>| async move {
                *s.reloads.lock() += 1;
                StatusCode::OK
            }),
        )
        .route(
            "/api/weight",
            put(
                |State(s): State<Sidecar>, Json(weights): Json<Vec<ServerWeight>>| async move {
                    if s.reject_weights.load(Ordering::SeqCst) {
                        return StatusCode::INTERNAL_SERVER_ERROR;
                    }
                    s.weights.lock().push(weights);
                    StatusCode::OK
                },
            ),
        )
        .with_state(sidecar.clone());
    let url = serve(router).await;
    (sidecar, url)
}

struct Fixture {
    _dir: tempfile::TempDir,
    config: PipelineConfig,
}

fn fixture(template: &str) -> Fixture {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();

    let dir = tempfile::tempdir().unwrap();
    let template_path = dir.path().join("haproxy_template.cfg");
    std::fs::write(&template_path, template).unwrap();
    let config = PipelineConfig {
        template_path,
        output_path: dir.path().join("haproxy.cfg"),
        ..Default::default()
    };
    Fixture { _dir: dir, config }
}

fn read(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap()
}

fn full() -> Update {
    Update::full(Trigger::Startup)
}

#[tokio::test]
async fn reloads_once_and_then_skips_unchanged_config() {
    let (_marathon, marathon_url) = fake_marathon().await;
    let (sidecar, sidecar_url) = fake_sidecar().await;
    let fx = fixture(TEMPLATE);

    let mut pipeline = Pipeline::new(
        fx.config.clone(),
        marathon::Client::new([marathon_url]),
        Arc::new(MemoryStore::default()),
        Arc::new(reload::Sidecar::new(sidecar_url)),
        Health::default(),
    );

    assert_eq!(pipeline.run(full()).await, Outcome::Reloaded);
    let first = read(&fx.config.output_path);
    assert_eq!(first, EXPECTED);
    assert_eq!(*sidecar.reloads.lock(), 1);

    assert_eq!(pipeline.run(full()).await, Outcome::Skipped);
    assert_eq!(read(&fx.config.output_path), first);
    assert_eq!(*sidecar.reloads.lock(), 1);
}

#[tokio::test]
async fn fails_over_to_next_marathon_endpoint() {
    let (_marathon, marathon_url) = fake_marathon().await;
    let (sidecar, sidecar_url) = fake_sidecar().await;
    let fx = fixture(TEMPLATE);

    let mut pipeline = Pipeline::new(
        fx.config.clone(),
        marathon::Client::new(["http://127.0.0.1:1".to_string(), marathon_url]),
        Arc::new(MemoryStore::default()),
        Arc::new(reload::Sidecar::new(sidecar_url)),
        Health::default(),
    );

    assert_eq!(pipeline.run(full()).await, Outcome::Reloaded);
    assert_eq!(read(&fx.config.output_path), EXPECTED);
    assert_eq!(*sidecar.reloads.lock(), 1);
}

#[tokio::test]
async fn unreachable_marathon_fails_without_writing() {
    let (sidecar, sidecar_url) = fake_sidecar().await;
    let fx = fixture(TEMPLATE);

    let mut pipeline = Pipeline::new(
        fx.config.clone(),
        marathon::Client::new(["http://127.0.0.1:1"]),
        Arc::new(MemoryStore::default()),
        Arc::new(reload::Sidecar::new(sidecar_url)),
        Health::default(),
    );

    assert_eq!(pipeline.run(full()).await, Outcome::Failed);
    assert!(!fx.config.output_path.exists());
    assert_eq!(*sidecar.reloads.lock(), 0);
}

#[tokio::test]
async fn template_errors_keep_last_good_config() {
    let (_marathon, marathon_url) = fake_marathon().await;
    let (sidecar, sidecar_url) = fake_sidecar().await;
    let fx = fixture(TEMPLATE);
    let health = Health::default();

    let mut pipeline = Pipeline::new(
        fx.config.clone(),
        marathon::Client::new([marathon_url]),
        Arc::new(MemoryStore::default()),
        Arc::new(reload::Sidecar::new(sidecar_url)),
        health.clone(),
    );
    assert_eq!(pipeline.run(full()).await, Outcome::Reloaded);
    assert!(health.is_valid());

    std::fs::write(&fx.config.template_path, "{{ frontends[0].nope }}").unwrap();
    assert_eq!(pipeline.run(full()).await, Outcome::Failed);
    assert!(!health.is_valid());
    assert_eq!(read(&fx.config.output_path), EXPECTED);

    std::fs::write(&fx.config.template_path, "{% for fe in frontends %}").unwrap();
    assert_eq!(pipeline.run(full()).await, Outcome::Failed);
    assert!(!health.is_valid());

    std::fs::write(&fx.config.template_path, TEMPLATE).unwrap();
    assert_eq!(pipeline.run(full()).await, Outcome::Skipped);
    assert!(health.is_valid());
    assert_eq!(*sidecar.reloads.lock(), 1);
}

#[tokio::test]
async fn reload_failure_keeps_written_config() {
    let (_marathon, marathon_url) = fake_marathon().await;
    let fx = fixture(TEMPLATE);

    let mut pipeline = Pipeline::new(
        fx.config.clone(),
        marathon::Client::new([marathon_url]),
        Arc::new(MemoryStore::default()),
        Arc::new(reload::Sidecar::new("http://127.0.0.1:1")),
        Health::default(),
    );

    assert_eq!(pipeline.run(full()).await, Outcome::Failed);
    assert_eq!(read(&fx.config.output_path), EXPECTED);
}

#[tokio::test]
async fn scaling_changes_trigger_reload() {
    let (marathon, marathon_url) = fake_marathon().await;
    let (sidecar, sidecar_url) = fake_sidecar().await;
    let fx = fixture(TEMPLATE);

    let mut pipeline = Pipeline::new(
        fx.config.clone(),
        marathon::Client::new([marathon_url]),
        Arc::new(MemoryStore::default()),
        Arc::new(reload::Sidecar::new(sidecar_url)),
        Health::default(),
    );
    assert_eq!(pipeline.run(full()).await, Outcome::Reloaded);

    marathon.tasks.lock()["tasks"]
        .as_array_mut()
        .unwrap()
        .push(task("/web-2", "d", "h4", 31003));
    assert_eq!(pipeline.run(full()).await, Outcome::Reloaded);
    assert!(read(&fx.config.output_path).contains("server web-h4-2-31003 h4:31003 weight 0"));
    assert_eq!(*sidecar.reloads.lock(), 2);
}

#[tokio::test]
async fn weight_updates_skip_reload() {
    let (_marathon, marathon_url) = fake_marathon().await;
    let (sidecar, sidecar_url) = fake_sidecar().await;
    let fx = fixture(TEMPLATE);
    let store = Arc::new(MemoryStore::default());

    let mut pipeline = Pipeline::new(
        fx.config.clone(),
        marathon::Client::new([marathon_url]),
        store.clone(),
        Arc::new(reload::Sidecar::new(sidecar_url)),
        Health::default(),
    );
    assert_eq!(pipeline.run(full()).await, Outcome::Reloaded);
    assert_eq!(pipeline.routing().len(), 1);

    store
        .upsert(Weight {
            id: "web".into(),
            versions: [("1".to_string(), 75), ("2".to_string(), 25)]
                .into_iter()
                .collect(),
        })
        .await
        .unwrap();
    assert_eq!(pipeline.run(Update::weights()).await, Outcome::Reweighted);

    let pushed = sidecar.weights.lock().clone();
    assert_eq!(pushed.len(), 1);
    assert_eq!(
        pushed[0]
            .iter()
            .map(|sw| (sw.server.as_str(), sw.weight))
            .collect::<Vec<_>>(),
        [
            ("web-h1-1-31000", 38),
            ("web-h2-1-31001", 37),
            ("web-h3-2-31002", 25)
        ]
    );
    assert!(pushed[0].iter().all(|sw| sw.backend == "web-http-8080"));

    // The weights are persisted for proxy restarts without another reload.
    let config = read(&fx.config.output_path);
    assert!(config.contains("server web-h1-1-31000 h1:31000 weight 38"));
    assert!(config.contains("server web-h3-2-31002 h3:31002 weight 25"));
    assert_eq!(*sidecar.reloads.lock(), 1);
}

#[tokio::test]
async fn rejected_weights_are_still_persisted() {
    let (_marathon, marathon_url) = fake_marathon().await;
    let (sidecar, sidecar_url) = fake_sidecar().await;
    let fx = fixture(TEMPLATE);
    let store = Arc::new(MemoryStore::default());

    let mut pipeline = Pipeline::new(
        fx.config.clone(),
        marathon::Client::new([marathon_url]),
        store.clone(),
        Arc::new(reload::Sidecar::new(sidecar_url)),
        Health::default(),
    );
    assert_eq!(pipeline.run(full()).await, Outcome::Reloaded);

    sidecar.reject_weights.store(true, Ordering::SeqCst);
    store
        .upsert(Weight {
            id: "web".into(),
            versions: [("1".to_string(), 42)].into_iter().collect(),
        })
        .await
        .unwrap();
    assert_eq!(pipeline.run(Update::weights()).await, Outcome::Reweighted);

    assert!(sidecar.weights.lock().is_empty());
    let config = read(&fx.config.output_path);
    assert!(config.contains("server web-h1-1-31000 h1:31000 weight 21"));
    assert!(config.contains("server web-h2-1-31001 h2:31001 weight 21"));
    assert!(config.contains("server web-h3-2-31002 h3:31002 weight 0"));
    assert_eq!(*sidecar.reloads.lock(), 1);
}

#[tokio::test]
async fn weight_update_without_routing_runs_full_cycle() {
    let (_marathon, marathon_url) = fake_marathon().await;
    let (sidecar, sidecar_url) = fake_sidecar().await;
    let fx = fixture(TEMPLATE);

    let mut pipeline = Pipeline::new(
        fx.config.clone(),
        marathon::Client::new([marathon_url]),
        Arc::new(MemoryStore::default()),
        Arc::new(reload::Sidecar::new(sidecar_url)),
        Health::default(),
    );
    assert!(pipeline.routing().is_empty());
    assert_eq!(pipeline.run(Update::weights()).await, Outcome::Reloaded);
    assert_eq!(*sidecar.reloads.lock(), 1);
    assert!(sidecar.weights.lock().is_empty());
}

#[tokio::test]
async fn command_strategy_validates_and_cleans_up() {
    let (_marathon, marathon_url) = fake_marathon().await;
    let mut fx = fixture(TEMPLATE);
    let dir = fx.config.output_path.parent().unwrap().to_path_buf();
    let reloaded = dir.join("reloaded");
    let cleaned = dir.join("cleaned");

    fx.config.validate_command = Some("grep -q web-http-8080 {{ path }}".into());
    fx.config.cleanup_command = Some(format!("touch {}", cleaned.display()));
    let reloader: Arc<dyn Reload> = Arc::new(reload::Command::new(
        format!("touch {}", reloaded.display()),
        true,
    ));

    let mut pipeline = Pipeline::new(
        fx.config.clone(),
        marathon::Client::new([marathon_url.clone()]),
        Arc::new(MemoryStore::default()),
        reloader.clone(),
        Health::default(),
    );
    assert_eq!(pipeline.run(full()).await, Outcome::Reloaded);
    assert!(reloaded.exists());
    assert!(cleaned.exists());

    // A command strategy cannot apply weights live, so weight updates reload.
    std::fs::remove_file(&reloaded).unwrap();
    let store = Arc::new(MemoryStore::new([Weight {
        id: "web".into(),
        versions: [("2".to_string(), 10)].into_iter().collect(),
    }]));
    let mut pipeline = Pipeline::new(
        fx.config.clone(),
        marathon::Client::new([marathon_url]),
        store,
        reloader,
        Health::default(),
    );
    assert_eq!(pipeline.run(full()).await, Outcome::Reloaded);
    std::fs::remove_file(&reloaded).unwrap();
    std::fs::write(&fx.config.output_path, "stale").unwrap();
    assert_eq!(pipeline.run(Update::weights()).await, Outcome::Reloaded);
    assert!(reloaded.exists());
}

#[tokio::test]
async fn failed_validation_aborts_write() {
    let (_marathon, marathon_url) = fake_marathon().await;
    let mut fx = fixture(TEMPLATE);
    let cleaned = fx.config.output_path.with_file_name("cleaned");
    fx.config.validate_command = Some("exit 1".into());
    fx.config.cleanup_command = Some(format!("touch {}", cleaned.display()));

    let mut pipeline = Pipeline::new(
        fx.config.clone(),
        marathon::Client::new([marathon_url]),
        Arc::new(MemoryStore::default()),
        Arc::new(reload::Command::new("true", true)),
        Health::default(),
    );
    assert_eq!(pipeline.run(full()).await, Outcome::Failed);
    assert!(!fx.config.output_path.exists());
    assert!(cleaned.exists());
}

#[tokio::test]
async fn marathon_callbacks_schedule_full_updates() {
    let scheduler = Scheduler::new();
    let intake = Intake::new(scheduler.clone(), marathon::Client::new(["http://127.0.0.1:1"]), None);
    let url = serve(intake.router()).await;
    let http = reqwest::Client::new();

    let rsp = http
        .post(format!("{url}{CALLBACK_PATH}"))
        .json(&json!({"eventType": "status_update_event", "timestamp": "2024-01-01T00:00:00Z"}))
        .send()
        .await
        .unwrap();
    assert!(rsp.status().is_success());
    assert!(scheduler.is_pending());

    let rsp = http.get(format!("{url}/api/health")).send().await.unwrap();
    assert!(rsp.status().is_success());
}

#[tokio::test]
async fn health_fails_when_subscription_cannot_be_registered() {
    let intake = Intake::new(
        Scheduler::new(),
        marathon::Client::new(["http://127.0.0.1:1"]),
        Some("http://controller/api/marathon/event_callback".into()),
    );
    let url = serve(intake.router()).await;

    let rsp = reqwest::get(format!("{url}/api/health")).await.unwrap();
    assert_eq!(rsp.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);
}
