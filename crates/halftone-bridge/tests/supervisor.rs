//! End-to-end tests against a shell-script stand-in for the image worker

#![cfg(unix)]

use halftone_bridge::dispatcher::DispatcherState;
use halftone_bridge::{
    Bridge, BridgeError, CommandTimeouts, DotShape, ExportFormat, PatternParams, Supervisor,
    SupervisorSettings, WorkerCommand, WorkerStatus,
};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

/// Stands in for the image worker. It keeps one uploaded image in memory
/// like the real one, and with `FAKE_NO_ID` set answers without echoing
/// the request id.
const FAKE_WORKER: &str = r#"
mode="$1"
if [ "$mode" = "never-ready" ]; then
  sleep 30
  exit 0
fi
if [ "$mode" = "slow-ready" ]; then
  sleep 0.3
fi
reply() {
  if [ -n "$FAKE_NO_ID" ]; then
    printf '%s}\n' "$1"
  else
    printf '%s,"id":%s}\n' "$1" "$id"
  fi
}
stored=""
echo '{"status":"ready"}'
while IFS= read -r line; do
  echo "$line" >> "$FAKE_LOG"
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  img=$(printf '%s' "$line" | sed -n 's/.*"image_b64":"\([^"]*\)".*/\1/p')
  case "$line" in
    *'"cmd":"ping"'*) reply '{"ok":true,"pong":true' ;;
    *'"cmd":"crash"'*) echo "dying" >&2; exit 3 ;;
    *'"cmd":"slow"'*) sleep 1; reply '{"ok":true,"late":true' ;;
    *'"cmd":"fail"'*) reply '{"ok":false,"error":"boom"' ;;
    *'"cmd":"garbage"'*) echo "Traceback (most recent call last):" ;;
    *'"cmd":"echo"'*) reply "{\"ok\":true,\"request\":$line" ;;
    *'"cmd":"upload"'*)
      stored="$img"
      if [ "$img" = "c2xvdw==" ]; then sleep 1; fi
      reply '{"ok":true,"dots":[{"x":1.5,"y":2.0,"r":3.0}],"dot_count":1,"image_width":10,"image_height":20,"canvas_width":800,"canvas_height":600' ;;
    *'"cmd":"regenerate"'*)
      if [ -n "$img" ]; then stored="$img"; fi
      if [ -z "$stored" ]; then
        reply '{"ok":false,"error":"No image in memory. Upload first."'
      else
        reply '{"ok":true,"dots":[],"dot_count":0,"image_width":10,"image_height":20'
      fi ;;
    *'"cmd":"export"'*) reply '{"ok":true,"format":"svg","data_b64":"PHN2Zz48L3N2Zz4="' ;;
    *) reply '{"ok":false,"error":"Unknown command"' ;;
  esac
done
"#;

struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("worker.sh"), FAKE_WORKER).unwrap();
        Self { dir }
    }

    fn log_path(&self) -> PathBuf {
        self.dir.path().join("requests.log")
    }

    fn command(&self, mode: &str) -> WorkerCommand {
        WorkerCommand::new("sh")
            .arg(self.dir.path().join("worker.sh").to_string_lossy().into_owned())
            .arg(mode)
            .env("FAKE_LOG", self.log_path().to_string_lossy().into_owned())
    }

    /// Worker whose responses carry no id, so correlation is positional
    fn command_without_ids(&self, mode: &str) -> WorkerCommand {
        self.command(mode).env("FAKE_NO_ID", "1")
    }

    fn requests(&self) -> Vec<Value> {
        read_lines(&self.log_path())
    }
}

fn read_lines(path: &Path) -> Vec<Value> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

fn settings(max_restarts: u32) -> SupervisorSettings {
    SupervisorSettings {
        ready_timeout: Duration::from_secs(10),
        max_restarts,
        backoff_initial: Duration::from_millis(20),
        backoff_max: Duration::from_millis(100),
    }
}

fn payload(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

const T: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_requests_before_ready_arrive_in_order() {
    let fixture = Fixture::new();
    let supervisor = Supervisor::new(settings(0));
    supervisor.start(fixture.command("slow-ready")).await.unwrap();

    let (a, b, c) = tokio::join!(
        supervisor.send("echo", payload(json!({"n": 1})), T),
        supervisor.send("echo", payload(json!({"n": 2})), T),
        supervisor.send("echo", payload(json!({"n": 3})), T),
    );
    assert_eq!(a.unwrap()["request"]["n"], 1);
    assert_eq!(b.unwrap()["request"]["n"], 2);
    assert_eq!(c.unwrap()["request"]["n"], 3);

    let order: Vec<Value> = fixture.requests().iter().map(|r| r["n"].clone()).collect();
    assert_eq!(order, vec![json!(1), json!(2), json!(3)]);

    supervisor.stop().await;
}

#[tokio::test]
async fn test_id_less_responses_correlate_in_order() {
    let fixture = Fixture::new();
    let supervisor = Supervisor::new(settings(0));
    supervisor.start(fixture.command_without_ids("slow-ready")).await.unwrap();

    let (a, b, c) = tokio::join!(
        supervisor.send("echo", payload(json!({"n": 1})), T),
        supervisor.send("echo", payload(json!({"n": 2})), T),
        supervisor.send("echo", payload(json!({"n": 3})), T),
    );
    let a = a.unwrap();
    assert!(a.get("id").is_none());
    assert_eq!(a["request"]["n"], 1);
    assert_eq!(b.unwrap()["request"]["n"], 2);
    assert_eq!(c.unwrap()["request"]["n"], 3);

    supervisor.stop().await;
}

#[tokio::test]
async fn test_worker_error_is_reported_verbatim() {
    let fixture = Fixture::new();
    let supervisor = Supervisor::new(settings(0));
    supervisor.start(fixture.command("normal")).await.unwrap();

    let result = supervisor.send("fail", Map::new(), T).await;
    assert_eq!(result, Err(BridgeError::Command("boom".to_string())));

    // the bridge stays usable
    let pong = supervisor.send("ping", Map::new(), T).await.unwrap();
    assert_eq!(pong["pong"], true);
    supervisor.stop().await;
}

#[tokio::test]
async fn test_garbage_line_fails_only_in_flight_request() {
    let fixture = Fixture::new();
    let supervisor = Supervisor::new(settings(0));
    supervisor.start(fixture.command("normal")).await.unwrap();

    let (garbage, ping) = tokio::join!(
        supervisor.send("garbage", Map::new(), T),
        supervisor.send("ping", Map::new(), T),
    );
    assert!(matches!(garbage, Err(BridgeError::ProtocolParse { .. })));
    assert!(ping.is_ok());
    supervisor.stop().await;
}

#[tokio::test]
async fn test_crash_rejects_in_flight_and_queued() {
    let fixture = Fixture::new();
    let supervisor = Supervisor::new(settings(0));
    supervisor.start(fixture.command("normal")).await.unwrap();
    supervisor.wait_ready().await.unwrap();

    let (crash, first, second) = tokio::join!(
        supervisor.send("crash", Map::new(), T),
        supervisor.send("ping", Map::new(), T),
        supervisor.send("ping", Map::new(), T),
    );
    for result in [crash, first, second] {
        assert!(matches!(result, Err(BridgeError::WorkerExited(_))), "{:?}", result);
    }

    let mut status = supervisor.status();
    let failed = status
        .wait_for(|s| matches!(s, WorkerStatus::Failed(_)))
        .await
        .map(|s| s.clone())
        .unwrap();
    assert!(matches!(failed, WorkerStatus::Failed(_)));
    assert_eq!(supervisor.dispatcher_state(), DispatcherState::Stopped);

    let late = supervisor.send("ping", Map::new(), T).await;
    assert!(matches!(late, Err(BridgeError::WorkerExited(_))));
}

#[tokio::test]
async fn test_crashed_worker_is_respawned() {
    let fixture = Fixture::new();
    let supervisor = Supervisor::new(settings(2));
    supervisor.start(fixture.command("normal")).await.unwrap();
    supervisor.wait_ready().await.unwrap();
    let before = supervisor.generation();

    let crash = supervisor.send("crash", Map::new(), T).await;
    assert!(matches!(crash, Err(BridgeError::WorkerExited(_))));

    // sent while restarting: buffered until the new worker is ready
    let pong = supervisor.send("ping", Map::new(), T).await.unwrap();
    assert_eq!(pong["pong"], true);
    assert_eq!(supervisor.generation(), before + 1);
    assert_eq!(supervisor.current_status(), WorkerStatus::Ready);

    supervisor.stop().await;
}

#[tokio::test]
async fn test_timeout_rejects_and_discards_late_response() {
    let fixture = Fixture::new();
    let supervisor = Supervisor::new(settings(0));
    supervisor.start(fixture.command("normal")).await.unwrap();
    supervisor.wait_ready().await.unwrap();

    let (slow, ping) = tokio::join!(
        supervisor.send("slow", Map::new(), Duration::from_millis(200)),
        supervisor.send("ping", Map::new(), T),
    );
    assert!(matches!(slow, Err(BridgeError::Timeout { ref command, .. }) if command == "slow"));
    let ping = ping.unwrap();
    assert_eq!(ping["pong"], true);
    assert!(ping.get("late").is_none());

    supervisor.stop().await;
}

#[tokio::test]
async fn test_id_less_late_response_is_discarded_after_timeout() {
    let fixture = Fixture::new();
    let supervisor = Supervisor::new(settings(0));
    supervisor.start(fixture.command_without_ids("normal")).await.unwrap();
    supervisor.wait_ready().await.unwrap();

    let (slow, ping) = tokio::join!(
        supervisor.send("slow", Map::new(), Duration::from_millis(200)),
        supervisor.send("ping", Map::new(), T),
    );
    assert!(matches!(slow, Err(BridgeError::Timeout { ref command, .. }) if command == "slow"));
    let ping = ping.unwrap();
    assert_eq!(ping["pong"], true);
    assert!(ping.get("late").is_none());

    // the positional match has caught up with the worker
    let again = supervisor.send("ping", Map::new(), T).await.unwrap();
    assert_eq!(again["pong"], true);
    supervisor.stop().await;
}

#[tokio::test]
async fn test_worker_that_never_becomes_ready_is_killed() {
    let fixture = Fixture::new();
    let supervisor = Supervisor::new(SupervisorSettings {
        ready_timeout: Duration::from_millis(300),
        ..settings(0)
    });
    supervisor.start(fixture.command("never-ready")).await.unwrap();

    let pending = supervisor.send("ping", Map::new(), T);
    let (ready, pending) = tokio::join!(supervisor.wait_ready(), pending);
    assert!(matches!(ready, Err(BridgeError::WorkerExited(ref reason)) if reason.contains("readiness")));
    assert!(matches!(pending, Err(BridgeError::WorkerExited(_))));
}

#[tokio::test]
async fn test_stop_does_not_restart() {
    let fixture = Fixture::new();
    let supervisor = Supervisor::new(settings(3));
    supervisor.start(fixture.command("normal")).await.unwrap();
    supervisor.wait_ready().await.unwrap();

    supervisor.stop().await;
    assert_eq!(supervisor.current_status(), WorkerStatus::Stopped);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(supervisor.current_status(), WorkerStatus::Stopped);

    let result = supervisor.send("ping", Map::new(), T).await;
    assert!(matches!(result, Err(BridgeError::WorkerExited(_))));
}

#[tokio::test]
async fn test_bridge_commands_round_trip_through_worker() {
    let fixture = Fixture::new();
    let bridge = Bridge::new(Supervisor::new(settings(1)), CommandTimeouts::default());
    bridge.start(fixture.command("normal")).await.unwrap();

    bridge.ping().await.unwrap();

    let ingested = bridge.ingest(b"\x89PNG fake", 800, 600).await.unwrap();
    assert_eq!(ingested.dot_count, 1);
    assert_eq!(ingested.dots[0].x, 1.5);
    assert_eq!((ingested.image_width, ingested.image_height), (10, 20));
    assert_eq!((ingested.canvas_width, ingested.canvas_height), (800, 600));

    let mut params = PatternParams::new();
    params.set("density", 2.0);
    let pattern = bridge.recompute(ingested.session, &params).await.unwrap();
    assert_eq!(pattern.dot_count, 0);

    let exported = bridge
        .export(&ingested.dots, ExportFormat::Svg, 800, 600, DotShape::Hexagon)
        .await
        .unwrap();
    assert_eq!(exported.format, ExportFormat::Svg);
    assert_eq!(exported.data, b"<svg></svg>".to_vec());

    let requests = fixture.requests();
    let upload = &requests[1];
    assert_eq!(upload["cmd"], "upload");
    assert_eq!(upload["session_id"], ingested.session.to_string());
    let regenerate = &requests[2];
    assert_eq!(regenerate["params"]["density"], 2.0);
    assert!(regenerate.get("image_b64").is_none());
    assert_eq!(requests[3]["dot_shape"], "hexagon");

    bridge.stop().await;
}

#[tokio::test]
async fn test_image_is_resent_after_respawn() {
    let fixture = Fixture::new();
    let bridge = Bridge::new(Supervisor::new(settings(1)), CommandTimeouts::default());
    bridge.start(fixture.command("normal")).await.unwrap();

    let ingested = bridge.ingest(b"image bytes", 400, 400).await.unwrap();
    let crash = bridge.supervisor().send("crash", Map::new(), T).await;
    assert!(crash.is_err());

    bridge.recompute(ingested.session, &PatternParams::new()).await.unwrap();

    let requests = fixture.requests();
    let regenerate = requests.last().unwrap();
    assert_eq!(regenerate["cmd"], "regenerate");
    assert_eq!(regenerate["image_b64"], "aW1hZ2UgYnl0ZXM=");

    bridge.stop().await;
}

#[tokio::test]
async fn test_timed_out_upload_makes_recompute_resend_image() {
    let fixture = Fixture::new();
    let timeouts = CommandTimeouts {
        ingest: Duration::from_millis(500),
        ..CommandTimeouts::default()
    };
    let bridge = Bridge::new(Supervisor::new(settings(0)), timeouts);
    bridge.start(fixture.command("normal")).await.unwrap();

    let first = bridge.ingest(b"image A", 800, 600).await.unwrap();
    // the worker still replaces its image with this one
    let slow = bridge.ingest(b"slow", 800, 600).await;
    assert!(matches!(slow, Err(BridgeError::Timeout { ref command, .. }) if command == "upload"));

    bridge.recompute(first.session, &PatternParams::new()).await.unwrap();
    let requests = fixture.requests();
    let regenerate = requests.last().unwrap();
    assert_eq!(regenerate["cmd"], "regenerate");
    assert_eq!(regenerate["image_b64"], "aW1hZ2UgQQ==");

    // now the worker holds the first image again
    bridge.recompute(first.session, &PatternParams::new()).await.unwrap();
    let requests = fixture.requests();
    assert!(requests.last().unwrap().get("image_b64").is_none());

    bridge.stop().await;
}

#[tokio::test]
async fn test_image_is_resent_after_stop_and_start() {
    let fixture = Fixture::new();
    let bridge = Bridge::new(Supervisor::new(settings(0)), CommandTimeouts::default());
    bridge.start(fixture.command("normal")).await.unwrap();
    let ingested = bridge.ingest(b"image A", 800, 600).await.unwrap();

    bridge.stop().await;
    bridge.start(fixture.command("normal")).await.unwrap();

    let pattern = bridge.recompute(ingested.session, &PatternParams::new()).await.unwrap();
    assert_eq!(pattern.dot_count, 0);
    let requests = fixture.requests();
    assert_eq!(requests.last().unwrap()["image_b64"], "aW1hZ2UgQQ==");

    bridge.stop().await;
}
