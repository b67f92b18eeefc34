use convostat_core::config::StoreConfig;
use convostat_core::{AnalyticsStore, Database};
use std::ffi::OsString;
use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};
use tempfile::TempDir;

struct CliTestEnv {
    _temp_dir: TempDir,
    home: PathBuf,
    xdg_data: PathBuf,
    xdg_config: PathBuf,
    xdg_state: PathBuf,
}

impl CliTestEnv {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let base = temp_dir.path().to_path_buf();
        let home = base.join("home");
        let xdg_data = base.join("xdg-data");
        let xdg_config = base.join("xdg-config");
        let xdg_state = base.join("xdg-state");

        fs::create_dir_all(&home).expect("failed to create HOME");
        fs::create_dir_all(&xdg_data).expect("failed to create XDG_DATA_HOME");
        fs::create_dir_all(&xdg_config).expect("failed to create XDG_CONFIG_HOME");
        fs::create_dir_all(&xdg_state).expect("failed to create XDG_STATE_HOME");

        Self {
            _temp_dir: temp_dir,
            home,
            xdg_data,
            xdg_config,
            xdg_state,
        }
    }

    fn db_path(&self) -> PathBuf {
        self.xdg_data.join("convostat/analytics.db")
    }

    fn write_events(&self, name: &str, lines: &[&str]) -> PathBuf {
        let path = self.home.join(name);
        fs::write(&path, lines.join("\n")).expect("failed to write events file");
        path
    }

    fn write_config(&self, content: &str) {
        let dir = self.xdg_config.join("convostat");
        fs::create_dir_all(&dir).expect("failed to create config dir");
        fs::write(dir.join("config.toml"), content).expect("failed to write config");
    }
}

const SCENARIO_EVENTS: &[&str] = &[
    r#"{"user_id":"alice","conversation_id":"c1","timestamp":"2025-03-03T10:00:00+00:00","role":"user","content_length":10,"category":"code","tags":["rust"]}"#,
    r#"{"user_id":"alice","conversation_id":"c1","timestamp":"2025-03-03T10:01:00+00:00","role":"assistant","content_length":20,"response_latency_seconds":2.0}"#,
    r#"{"user_id":"alice","conversation_id":"c1","timestamp":"2025-03-03T10:02:00+00:00","role":"user","content_length":30}"#,
    r#"{"user_id":"alice","conversation_id":"c1","timestamp":"2025-03-03T10:03:00+00:00","role":"assistant","content_length":10,"response_latency_seconds":1.0}"#,
    r#"{"user_id":"alice","conversation_id":"c1","timestamp":"2025-03-03T10:04:00+00:00","role":"assistant","conversation_duration_seconds":240.0,"message_count_delta":4}"#,
];

fn run_bin(env: &CliTestEnv, args: &[&str]) -> Output {
    let bin_path = PathBuf::from(assert_cmd::cargo::cargo_bin!("convostat"));

    Command::new(bin_path)
        .args(args)
        .env("HOME", &env.home)
        .env("XDG_DATA_HOME", &env.xdg_data)
        .env("XDG_CONFIG_HOME", &env.xdg_config)
        .env("XDG_STATE_HOME", &env.xdg_state)
        .output()
        .unwrap_or_else(|e| panic!("failed to execute convostat: {e}"))
}

fn assert_success(args: &[&str], output: &Output) {
    if output.status.success() {
        return;
    }

    let rendered_args = args
        .iter()
        .map(|arg| OsString::from(arg).to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    panic!(
        "convostat {rendered_args} failed\nstatus: {}\nstdout:\n{}\nstderr:\n{}",
        output.status, stdout, stderr
    );
}

fn json_output(output: &Output) -> serde_json::Value {
    serde_json::from_slice(&output.stdout).unwrap_or_else(|e| {
        panic!(
            "stdout is not JSON ({e}):\n{}",
            String::from_utf8_lossy(&output.stdout)
        )
    })
}

#[test]
fn ingest_populates_db_and_show_reports_scenario_values() {
    let env = CliTestEnv::new();
    let events = env.write_events("events.jsonl", SCENARIO_EVENTS);
    let events_arg = events.to_str().expect("non-utf8 temp path");

    let output = run_bin(&env, &["ingest", events_arg]);
    assert_success(&["ingest", events_arg], &output);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Ingest complete:"));
    assert!(
        stdout.contains("Events applied:  5"),
        "expected ingest summary in stdout, got:\n{stdout}"
    );

    let db_path = env.db_path();
    assert!(
        db_path.exists(),
        "database file should exist at {}",
        db_path.display()
    );
    let db = Database::open(&db_path, &StoreConfig::default()).expect("failed to open db");
    db.migrate().expect("failed to migrate db");
    let stored = db
        .require_aggregate("alice")
        .expect("aggregate should be stored");
    assert_eq!(stored.event_sequence_number, 5);
    drop(db);

    let args = ["show", "alice", "--format", "json"];
    let output = run_bin(&env, &args);
    assert_success(&args, &output);
    let agg = json_output(&output);
    assert_eq!(agg["messages"]["avg_user_length"], 20.0);
    assert_eq!(agg["messages"]["avg_assistant_length"], 15.0);
    assert_eq!(agg["time"]["avg_response_latency"], 1.5);
    assert_eq!(agg["conversations"]["total_conversations"], 1);
    assert_eq!(agg["conversations"]["avg_conversation_duration_minutes"], 4.0);

    let output = run_bin(&env, &["show", "alice"]);
    assert_success(&["show", "alice"], &output);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("User: alice"));
    assert!(stdout.contains("Top category:    code"));
    assert!(stdout.contains("Top tags:        rust"));
}

#[test]
fn ingest_reports_invalid_lines_and_continues() {
    let env = CliTestEnv::new();
    let events = env.write_events(
        "events.jsonl",
        &[
            SCENARIO_EVENTS[0],
            r#"{"user_id":"alice","conversation_id":"c1","timestamp":"2025-03-03T10:00:30+00:00","role":"user","content_length":-1}"#,
            "not json",
            SCENARIO_EVENTS[1],
        ],
    );
    let events_arg = events.to_str().expect("non-utf8 temp path");

    let args = ["ingest", events_arg, "--format", "json"];
    let output = run_bin(&env, &args);
    assert_success(&args, &output);
    let summary = json_output(&output);
    assert_eq!(summary["applied"], 2);
    assert_eq!(summary["rejected"], 2);

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("line 2: invalid event"));
    assert!(stderr.contains("line 3: malformed event"));
}

#[test]
fn recompute_and_reconcile_agree_with_streaming() {
    let env = CliTestEnv::new();
    let events = env.write_events("events.jsonl", SCENARIO_EVENTS);
    let events_arg = events.to_str().expect("non-utf8 temp path");
    assert_success(&["ingest", events_arg], &run_bin(&env, &["ingest", events_arg]));

    let show = json_output(&run_bin(&env, &["show", "alice", "--format", "json"]));

    let args = ["recompute", "alice", "--format", "json"];
    let output = run_bin(&env, &args);
    assert_success(&args, &output);
    let recomputed = json_output(&output);
    assert_eq!(recomputed["messages"], show["messages"]);
    assert_eq!(recomputed["event_sequence_number"], 5);

    // a window ending before the second message sees one event
    let args = [
        "recompute",
        "alice",
        "--until",
        "2025-03-03T10:00:30Z",
        "--format",
        "json",
    ];
    let output = run_bin(&env, &args);
    assert_success(&args, &output);
    assert_eq!(json_output(&output)["messages"]["total"], 1);

    let args = ["reconcile", "alice", "--format", "json"];
    let output = run_bin(&env, &args);
    assert_success(&args, &output);
    let reconciled = json_output(&output);
    assert_eq!(reconciled["event_sequence_number"], 5);
    assert_eq!(reconciled["categories"], show["categories"]);
}

#[test]
fn sweep_requires_horizon_and_deletes_idle_users() {
    let env = CliTestEnv::new();
    let events = env.write_events("events.jsonl", SCENARIO_EVENTS);
    let events_arg = events.to_str().expect("non-utf8 temp path");
    assert_success(&["ingest", events_arg], &run_bin(&env, &["ingest", events_arg]));

    let output = run_bin(&env, &["sweep"]);
    assert!(!output.status.success(), "sweep without horizon must fail");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("horizon_days"), "stderr was:\n{stderr}");

    // events are from 2025; a 30 day horizon makes alice stale
    env.write_config("[retention]\nhorizon_days = 30\n");
    let args = ["sweep", "--format", "json"];
    let output = run_bin(&env, &args);
    assert_success(&args, &output);
    let report = json_output(&output);
    assert_eq!(report["swept"], serde_json::json!(["alice"]));

    // sweeping again is a no-op
    let args = ["sweep", "--horizon-days", "30"];
    let output = run_bin(&env, &args);
    assert_success(&args, &output);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Users swept:     0"));
    assert!(stdout.contains("Users skipped:   0"));
}

#[test]
fn trends_counts_days_in_window() {
    let env = CliTestEnv::new();
    let events = env.write_events("events.jsonl", SCENARIO_EVENTS);
    let events_arg = events.to_str().expect("non-utf8 temp path");
    assert_success(&["ingest", events_arg], &run_bin(&env, &["ingest", events_arg]));

    // the fixture is far in the past, so a short window sees nothing
    let args = ["trends", "alice", "--days", "7", "--format", "json"];
    let output = run_bin(&env, &args);
    assert_success(&args, &output);
    let trends = json_output(&output);
    assert_eq!(trends["total_conversations"], 0);
    assert_eq!(trends["peak_day"], serde_json::Value::Null);

    let args = ["trends", "alice", "--days", "100000"];
    let output = run_bin(&env, &args);
    assert_success(&args, &output);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Conversations:   1"));
    assert!(stdout.contains("Peak day:        2025-03-03"));
    assert!(stdout.contains("Categories:"), "stdout was:\n{stdout}");
    assert!(stdout.contains("  code: 1"));

    let args = ["trends", "alice", "--days", "100000", "--format", "json"];
    let output = run_bin(&env, &args);
    assert_success(&args, &output);
    assert_eq!(json_output(&output)["category_trends"]["code"], 1);
}
