//! Dispatch Orchestrator Tests
//!
//! Drives the handler with a recording publisher and a scripted runner and
//! checks what lands on each publish route.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use rcd_common::TaskSupervisor;
use rcd_config::{DispatchConfig, ExchangeType, HandlerConfig, PublishRoute, PublishRoutes};
use rcd_dispatch::{
    CommandArg, CommandOutput, CommandRunner, DispatchError, DispatchHandler,
};
use rcd_queue::{MessageHandler, Publisher};

const ERROR_ROUTE: &str = "event.common";
const RECEIPT_ROUTE: &str = "event.notify";
const SETTINGS_ROUTE: &str = "settings_changed";
const STATUS_ROUTE: &str = "mon";

const STATUS_OUTPUT: &str = "AMProductVersion : 4.18.2103.7\nAntivirusEnabled : True\nAntivirusSignatureLastUpdated : 4/25/2021 3:42:11 PM\nAntivirusSignatureVersion : 1.335.1419.0\n";

/// Publisher that records (routing key, body) pairs
#[derive(Default)]
struct RecordingPublisher {
    published: Mutex<Vec<(String, Value)>>,
}

impl RecordingPublisher {
    fn published(&self) -> Vec<(String, Value)> {
        self.published.lock().clone()
    }

    fn on_route(&self, route: &str) -> Vec<Value> {
        self.published()
            .into_iter()
            .filter(|(r, _)| r == route)
            .map(|(_, body)| body)
            .collect()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, body: &Value, destination: &PublishRoute) {
        self.published
            .lock()
            .push((destination.routing_key().to_string(), body.clone()));
    }
}

#[derive(Clone)]
enum Reply {
    Output { stdout: &'static str, stderr: &'static str },
    Fail(&'static str),
}

/// Runner answering per host, recording every invocation
struct ScriptedRunner {
    replies: HashMap<&'static str, Reply>,
    default: Reply,
    delay: Duration,
    invocations: Mutex<Vec<(String, String, Vec<CommandArg>)>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl ScriptedRunner {
    fn new(default: Reply) -> Self {
        Self {
            replies: HashMap::new(),
            default,
            delay: Duration::ZERO,
            invocations: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
        }
    }

    fn reply(mut self, host: &'static str, reply: Reply) -> Self {
        self.replies.insert(host, reply);
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn invocations(&self) -> Vec<(String, String, Vec<CommandArg>)> {
        self.invocations.lock().clone()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn invoke(&self, host: &str, command: &str, args: &[CommandArg]) -> rcd_dispatch::Result<CommandOutput> {
        self.invocations
            .lock()
            .push((host.to_string(), command.to_string(), args.to_vec()));

        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.running.fetch_sub(1, Ordering::SeqCst);

        match self.replies.get(host).unwrap_or(&self.default) {
            Reply::Output { stdout, stderr } => Ok(CommandOutput {
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            }),
            Reply::Fail(reason) => Err(DispatchError::Runner(reason.to_string())),
        }
    }
}

fn publish_routes() -> PublishRoutes {
    let routes: Vec<PublishRoute> = [ERROR_ROUTE, RECEIPT_ROUTE, SETTINGS_ROUTE, STATUS_ROUTE]
        .iter()
        .map(|key| PublishRoute::new("events", ExchangeType::Topic, Some(key)))
        .collect();
    PublishRoutes::from_routes(&routes).unwrap()
}

struct Harness {
    publisher: Arc<RecordingPublisher>,
    runner: Arc<ScriptedRunner>,
    supervisor: Arc<TaskSupervisor>,
    handler: DispatchHandler,
}

fn harness(runner: ScriptedRunner, dispatch: DispatchConfig) -> Harness {
    let publisher = Arc::new(RecordingPublisher::default());
    let runner = Arc::new(runner);
    let supervisor = Arc::new(TaskSupervisor::new());
    let handler = DispatchHandler::new(
        publisher.clone(),
        runner.clone(),
        publish_routes(),
        supervisor.clone(),
        &HandlerConfig::default(),
        &dispatch,
    );
    Harness {
        publisher,
        runner,
        supervisor,
        handler,
    }
}

fn body(value: Value) -> Vec<u8> {
    serde_json::to_vec(&value).unwrap()
}

fn ok(stdout: &'static str) -> Reply {
    Reply::Output { stdout, stderr: "" }
}

#[tokio::test]
async fn test_status_job_for_two_hosts() {
    let h = harness(ScriptedRunner::new(ok(STATUS_OUTPUT)), DispatchConfig::default());

    h.handler
        .handle(body(json!({
            "hostnames": ["h1", "h2"],
            "task_id": 42,
            "event": "Get-MpComputerStatus",
            "preferences": {}
        })))
        .await;
    let report = h.supervisor.drain().await;
    assert_eq!(report.completed, 2);
    assert_eq!(report.failed, 0);

    let published = h.publisher.published();
    assert_eq!(published.len(), 3);
    assert_eq!(published[0], (RECEIPT_ROUTE.to_string(), json!({"task_id": 42})));

    let status = h.publisher.on_route(STATUS_ROUTE);
    assert_eq!(status.len(), 2);
    let mut hosts: Vec<&str> = status.iter().map(|m| m["host_ip"].as_str().unwrap()).collect();
    hosts.sort_unstable();
    assert_eq!(hosts, vec!["h1", "h2"]);
    for message in &status {
        assert_eq!(
            message["preferences"],
            json!([
                {"pref_name": "AntivirusSignatureLastUpdated", "pref_val": "4/25/2021 3:42:11 PM"},
                {"pref_name": "AntivirusSignatureVersion", "pref_val": "1.335.1419.0"},
                {"pref_name": "AntivirusEnabled", "pref_val": "True"}
            ])
        );
    }
    assert!(h.publisher.on_route(SETTINGS_ROUTE).is_empty());
    assert!(h.publisher.on_route(ERROR_ROUTE).is_empty());
}

#[tokio::test]
async fn test_preference_job_parses_hex_values() {
    let h = harness(
        ScriptedRunner::new(ok("ScanParameters : 1\nUILockdown : False\n")),
        DispatchConfig::default(),
    );

    h.handler
        .handle(body(json!({"hostnames": ["h1"], "task_id": 7, "event": "Get-MpPreference"})))
        .await;
    h.supervisor.drain().await;

    let settings = h.publisher.on_route(SETTINGS_ROUTE);
    assert_eq!(settings.len(), 1);
    assert_eq!(
        settings[0],
        json!({
            "host_ip": "h1",
            "preferences": [
                {"pref_name": "ScanParameters", "pref_val": "0x1"},
                {"pref_name": "UILockdown", "pref_val": "False"}
            ]
        })
    );
}

#[tokio::test]
async fn test_runner_failure_routes_error_and_marks_task_failed() {
    let runner = ScriptedRunner::new(ok(STATUS_OUTPUT)).reply("h1", Reply::Fail("ssh: connect to host h1 port 22: Connection refused"));
    let h = harness(runner, DispatchConfig::default());

    h.handler
        .handle(body(json!({"hostnames": ["h1", "h2"], "task_id": 5, "event": "Get-MpComputerStatus"})))
        .await;
    let report = h.supervisor.drain().await;
    assert_eq!(report.failed, 1);
    assert_eq!(report.completed, 1);

    let errors = h.publisher.on_route(ERROR_ROUTE);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["host_ip"], "h1");
    assert_eq!(errors[0]["category"], "__PowerShell error");
    assert!(errors[0]["message"]
        .as_str()
        .unwrap()
        .starts_with("Invoke PowerShell command error. "));

    let status = h.publisher.on_route(STATUS_ROUTE);
    assert_eq!(status.len(), 1);
    assert_eq!(status[0]["host_ip"], "h2");
}

#[tokio::test]
async fn test_unknown_event_publishes_nothing() {
    let h = harness(ScriptedRunner::new(ok(STATUS_OUTPUT)), DispatchConfig::default());

    h.handler
        .handle(body(json!({"hostnames": ["h1"], "task_id": 9, "event": "Get-MpThreat"})))
        .await;
    h.handler.handle(b"{not json".to_vec()).await;
    h.handler
        .handle(body(json!({"hostnames": [], "task_id": 9, "event": "Get-MpPreference"})))
        .await;
    let report = h.supervisor.drain().await;

    assert_eq!(report.total(), 0);
    assert!(h.publisher.published().is_empty());
    assert!(h.runner.invocations().is_empty());
}

#[tokio::test]
async fn test_stderr_is_routed_in_addition_to_results() {
    let runner = ScriptedRunner::new(Reply::Output {
        stdout: STATUS_OUTPUT,
        stderr: "WARNING: signature is outdated",
    })
    .reply("quiet", Reply::Output { stdout: STATUS_OUTPUT, stderr: "\n" });
    let h = harness(runner, DispatchConfig::default());

    h.handler
        .handle(body(json!({"hostnames": ["noisy", "quiet"], "task_id": 3, "event": "Get-MpComputerStatus"})))
        .await;
    h.supervisor.drain().await;

    assert_eq!(h.publisher.on_route(STATUS_ROUTE).len(), 2);
    let errors = h.publisher.on_route(ERROR_ROUTE);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["host_ip"], "noisy");
    assert_eq!(
        errors[0]["message"],
        "Invoke PowerShell command error. WARNING: signature is outdated"
    );
}

#[tokio::test]
async fn test_receipt_first_and_at_most_two_results_per_host() {
    let runner = ScriptedRunner::new(Reply::Output {
        stdout: "ScanParameters : 2\n",
        stderr: "partial failure",
    })
    .with_delay(Duration::from_millis(5));
    let h = harness(runner, DispatchConfig::default());
    let hosts: Vec<String> = (0..8).map(|i| format!("10.0.0.{}", i)).collect();

    h.handler
        .handle(body(json!({"hostnames": hosts, "task_id": 11, "event": "Get-MpPreference"})))
        .await;
    h.supervisor.drain().await;

    let published = h.publisher.published();
    assert_eq!(published[0].0, RECEIPT_ROUTE);
    assert_eq!(published.iter().filter(|(r, _)| r == RECEIPT_ROUTE).count(), 1);
    assert_eq!(published.len() - 1, 2 * hosts.len());
}

#[tokio::test]
async fn test_invalid_preferences_become_error_notifications() {
    let h = harness(ScriptedRunner::new(ok("")), DispatchConfig::default());

    h.handler
        .handle(body(json!({
            "hostnames": ["h1", "h2"],
            "task_id": 12,
            "event": "Set-MpPreference",
            "preferences": {"MAPSReporting": "Everything"}
        })))
        .await;
    let report = h.supervisor.drain().await;

    assert_eq!(report.failed, 2);
    assert!(h.runner.invocations().is_empty());
    assert_eq!(h.publisher.on_route(RECEIPT_ROUTE).len(), 1);
    let errors = h.publisher.on_route(ERROR_ROUTE);
    assert_eq!(errors.len(), 2);
    assert!(errors[0]["message"].as_str().unwrap().contains("MAPSReporting"));
}

#[tokio::test]
async fn test_set_preference_passes_rendered_args_in_order() {
    let h = harness(ScriptedRunner::new(ok("")), DispatchConfig::default());

    h.handler
        .handle(body(json!({
            "hostnames": ["h1", "h1"],
            "task_id": 13,
            "event": "Set-MpPreference",
            "preferences": {
                "ScanScheduleDay": "Friday",
                "DisableRealtimeMonitoring": false,
                "ExclusionPath": null,
                "SignatureScheduleTime": "06:15"
            }
        })))
        .await;
    h.supervisor.drain().await;

    // Hostnames are not deduplicated
    let invocations = h.runner.invocations();
    assert_eq!(invocations.len(), 2);
    let (host, command, args) = &invocations[0];
    assert_eq!(host, "h1");
    assert_eq!(command, "Set-MpPreference");
    let rendered: Vec<(&str, &str)> = args.iter().map(|a| (a.name, a.value.as_str())).collect();
    assert_eq!(
        rendered,
        vec![
            ("ScanScheduleDay", "Friday"),
            ("DisableRealtimeMonitoring", "$False"),
            ("SignatureScheduleTime", "06:15:00"),
        ]
    );

    // Commands without a result route publish only the receipt
    assert_eq!(h.publisher.published().len(), 1);
}

#[tokio::test]
async fn test_command_limit_bounds_concurrency() {
    let runner = ScriptedRunner::new(ok("")).with_delay(Duration::from_millis(20));
    let h = harness(runner, DispatchConfig { max_concurrent_commands: 2 });
    let hosts: Vec<String> = (0..6).map(|i| format!("h{}", i)).collect();

    h.handler
        .handle(body(json!({"hostnames": hosts, "task_id": 14, "event": "Start-MpScan"})))
        .await;
    let report = h.supervisor.drain().await;

    assert_eq!(report.completed, 6);
    assert_eq!(h.runner.invocations().len(), 6);
    assert!(h.runner.max_running.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn test_unbounded_fan_out_runs_hosts_concurrently() {
    let runner = ScriptedRunner::new(ok("")).with_delay(Duration::from_millis(50));
    let h = harness(runner, DispatchConfig::default());
    let hosts: Vec<String> = (0..6).map(|i| format!("h{}", i)).collect();

    h.handler
        .handle(body(json!({"hostnames": hosts, "task_id": 15, "event": "Update-MpSignature"})))
        .await;
    h.supervisor.drain().await;

    assert!(h.runner.max_running.load(Ordering::SeqCst) > 2);
}
