//! IPC surface tests: real Unix socket, full daemon behind it.

use std::path::PathBuf;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use codelink_core::pipeline::Processor;
use codelink_core::{CancellationToken, ModelProvider, Settings, SpiInterface};
use codelink_server::handler::install_commander;
use codelink_server::{
    ControlCodeHandler, InterceptorRegistry, IpcServer, IpcState, SimulatedFirmware,
};

struct TestDaemon {
    socket_path: PathBuf,
    shutdown: CancellationToken,
}

impl TestDaemon {
    fn start(name: &str) -> Self {
        let socket_path = std::env::temp_dir().join(format!(
            "codelink-test-{}-{name}.sock",
            std::process::id()
        ));
        let mut settings = Settings::default();
        settings.socket_path = socket_path.clone();

        let handler = ControlCodeHandler::new();
        let slot = handler.commander_slot();
        let interceptors = InterceptorRegistry::new();
        let (processor, queues) = Processor::new(
            settings.clone(),
            ModelProvider::new(),
            Box::new(interceptors.clone()),
            Box::new(handler),
        );
        let sim = SimulatedFirmware::new();
        let (interface, commander, _events) =
            SpiInterface::new(sim, processor.clone(), queues, settings.clone());
        install_commander(&slot, commander.clone());

        let shutdown = CancellationToken::new();
        tokio::spawn(interface.run(shutdown.clone()));

        let state = IpcState {
            processor,
            commander,
            interceptors,
        };
        let server = IpcServer::bind(&socket_path, state).expect("bind test socket");
        tokio::spawn(server.run(shutdown.clone()));

        Self {
            socket_path,
            shutdown,
        }
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        self.shutdown.cancel();
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

/// Line-oriented JSON client talking to the daemon socket.
struct Client {
    stream: BufReader<UnixStream>,
    line: String,
}

impl Client {
    async fn connect(daemon: &TestDaemon, mode: Value) -> Self {
        let stream = UnixStream::connect(&daemon.socket_path)
            .await
            .expect("connect to daemon");
        let mut client = Self {
            stream: BufReader::new(stream),
            line: String::new(),
        };

        let init = client.read_json().await;
        assert_eq!(init["version"], 1);

        client.send_json(&mode).await;
        let ack = client.read_json().await;
        assert_eq!(ack["success"], true, "{ack}");
        client
    }

    async fn read_line(&mut self) -> String {
        self.line.clear();
        let read = tokio::time::timeout(
            Duration::from_secs(5),
            self.stream.read_line(&mut self.line),
        )
        .await
        .expect("timed out reading from daemon")
        .expect("socket read failed");
        assert!(read > 0, "daemon closed the connection");
        self.line.trim_end().to_string()
    }

    async fn read_json(&mut self) -> Value {
        let line = self.read_line().await;
        serde_json::from_str(&line).expect("daemon sent invalid JSON")
    }

    async fn send_json(&mut self, value: &Value) {
        let mut encoded = serde_json::to_vec(value).expect("serialize");
        encoded.push(b'\n');
        self.stream
            .write_all(&encoded)
            .await
            .expect("socket write failed");
    }

    async fn send_raw(&mut self, text: &str) {
        self.stream
            .write_all(format!("{text}\n").as_bytes())
            .await
            .expect("socket write failed");
    }
}

#[tokio::test]
async fn command_mode_runs_a_simple_code() {
    let daemon = TestDaemon::start("command");
    let mut client = Client::connect(&daemon, json!({"mode": "command"})).await;

    client
        .send_json(&json!({"command": "simpleCode", "code": "G28", "channel": "Usb"}))
        .await;
    let response = client.read_json().await;
    assert_eq!(response["success"], true, "{response}");
    assert_eq!(response["result"], "ok");
}

#[tokio::test]
async fn command_mode_reports_malformed_requests() {
    let daemon = TestDaemon::start("malformed");
    let mut client = Client::connect(&daemon, json!({"mode": "command"})).await;

    client.send_json(&json!({"command": "makeCoffee"})).await;
    let response = client.read_json().await;
    assert_eq!(response["success"], false);
    assert!(response["error"].is_string());

    // The connection survives and keeps working.
    client
        .send_json(&json!({"command": "diagnostics"}))
        .await;
    let response = client.read_json().await;
    assert_eq!(response["success"], true, "{response}");
    let report = response["result"].as_str().expect("diagnostics text");
    assert!(report.contains("Full transfers per second"));
}

#[tokio::test]
async fn command_mode_fetches_the_machine_model() {
    let daemon = TestDaemon::start("model");
    let mut client = Client::connect(&daemon, json!({"mode": "command"})).await;

    client
        .send_json(&json!({"command": "getMachineModel", "module": 0}))
        .await;
    let response = client.read_json().await;
    assert_eq!(response["success"], true, "{response}");
    assert_eq!(response["result"]["status"], "idle");
}

#[tokio::test]
async fn code_stream_talks_plain_text() {
    let daemon = TestDaemon::start("stream");
    let mut client =
        Client::connect(&daemon, json!({"mode": "codeStream", "channel": "Usb"})).await;

    client.send_raw("G28").await;
    assert_eq!(client.read_line().await, "ok");

    client.send_raw("G1 X10 Y5").await;
    assert_eq!(client.read_line().await, "ok");
}

#[tokio::test]
async fn code_stream_error_still_ends_with_ok() {
    let daemon = TestDaemon::start("stream-error");
    let mut client =
        Client::connect(&daemon, json!({"mode": "codeStream", "channel": "Usb"})).await;

    client.send_raw("M117 \"unterminated").await;
    let line = client.read_line().await;
    assert!(line.starts_with("Error:"), "{line}");
    assert_eq!(client.read_line().await, "ok");

    // The stream keeps working after the bad line.
    client.send_raw("G28").await;
    assert_eq!(client.read_line().await, "ok");
}

#[tokio::test]
async fn interceptor_can_resolve_a_code() {
    let daemon = TestDaemon::start("intercept");
    let mut interceptor = Client::connect(
        &daemon,
        json!({"mode": "intercept", "interceptionMode": "pre"}),
    )
    .await;
    let mut commander = Client::connect(&daemon, json!({"mode": "command"})).await;

    commander
        .send_json(&json!({"command": "simpleCode", "code": "M291", "channel": "Usb"}))
        .await;

    let offered = interceptor.read_json().await;
    assert_eq!(offered["code"], "M291");
    interceptor
        .send_json(&json!({"command": "resolve", "type": "success", "content": "dialog shown"}))
        .await;
    let ack = interceptor.read_json().await;
    assert_eq!(ack["success"], true);

    let response = commander.read_json().await;
    assert_eq!(response["success"], true, "{response}");
    let reply = response["result"].as_str().expect("reply text");
    assert!(reply.contains("dialog shown"), "{reply}");
}

#[tokio::test]
async fn subscriber_receives_a_snapshot_first() {
    let daemon = TestDaemon::start("subscribe");
    let mut client = Client::connect(&daemon, json!({"mode": "subscribe"})).await;

    let push = client.read_json().await;
    assert_eq!(push["kind"], "model");
    assert!(push["model"]["status"].is_string());
    assert!(push["model"]["job"].is_object());
}
