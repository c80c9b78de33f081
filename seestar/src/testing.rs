//! In-process mock telescope for tests
//!
//! Speaks the JSON line protocol on 127.0.0.1, answers the signed-challenge
//! handshake and records every request. Tests can withhold replies, override
//! them per method, push unsolicited lines or drop the live connection.

use crate::protocol::methods;
use crate::reconnect::ReconnectConfig;
use crate::SeestarConfig;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use serde_json::{json, Value};
use sha1::{Digest, Sha1};
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub(crate) const CHALLENGE: &str = "f3a9c2d1e8b7a605";

/// One RSA key per test binary; generation is slow
pub(crate) fn test_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| {
        RsaPrivateKey::new(&mut rand::thread_rng(), 1024).expect("generate test key")
    })
}

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Client configuration pointed at a mock
pub(crate) fn test_config(mock: &MockTelescope) -> SeestarConfig {
    SeestarConfig {
        discovery_enabled: false,
        connection_timeout_secs: 2,
        command_timeout_secs: 5,
        cancel_settle_ms: 0,
        homing_settle_secs: 0,
        private_key_path: Some(mock.key_path().to_path_buf()),
        reconnect: ReconnectConfig {
            retry_delay_ms: 50,
            ..ReconnectConfig::default()
        },
        ..SeestarConfig::default()
    }
}

enum Control {
    Line(String),
    Drop,
}

#[derive(Default)]
struct MockState {
    requests: Vec<Value>,
    withheld: HashSet<String>,
    closing: HashSet<String>,
    overrides: HashMap<String, Value>,
    connections: usize,
    control: Option<mpsc::UnboundedSender<Control>>,
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) struct MockTelescope {
    port: u16,
    state: Arc<Mutex<MockState>>,
    key_file: tempfile::NamedTempFile,
    server: JoinHandle<()>,
}

impl MockTelescope {
    pub async fn start() -> Self {
        init_tracing();

        let mut key_file = tempfile::NamedTempFile::new().expect("key file");
        let pem = test_key()
            .to_pkcs8_pem(LineEnding::LF)
            .expect("encode test key");
        key_file.write_all(pem.as_bytes()).expect("write key file");

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock");
        let port = listener.local_addr().expect("mock address").port();
        let state = Arc::new(Mutex::new(MockState::default()));

        let accept_state = Arc::clone(&state);
        let server = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let (tx, rx) = mpsc::unbounded_channel();
                {
                    let mut state = lock(&accept_state);
                    state.connections += 1;
                    state.control = Some(tx);
                }
                tokio::spawn(serve(stream, Arc::clone(&accept_state), rx));
            }
        });

        Self {
            port,
            state,
            key_file,
            server,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn key_path(&self) -> &Path {
        self.key_file.path()
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.state).connections
    }

    pub fn requests(&self) -> Vec<Value> {
        lock(&self.state).requests.clone()
    }

    pub fn methods(&self) -> Vec<String> {
        self.requests()
            .iter()
            .filter_map(|r| r["method"].as_str().map(str::to_string))
            .collect()
    }

    /// Params of every request for `method`, oldest first
    pub fn params_for(&self, method: &str) -> Vec<Value> {
        self.requests()
            .into_iter()
            .filter(|r| r["method"] == method)
            .map(|r| r.get("params").cloned().unwrap_or(Value::Null))
            .collect()
    }

    pub fn last_params(&self, method: &str) -> Option<Value> {
        self.params_for(method).pop()
    }

    /// Record requests for `method` but never answer them
    pub fn withhold(&self, method: &str) {
        lock(&self.state).withheld.insert(method.to_string());
    }

    /// Close the connection whenever `method` arrives, without replying
    pub fn close_on(&self, method: &str) {
        lock(&self.state).closing.insert(method.to_string());
    }

    /// Replace the default reply body for `method`
    pub fn respond_with(&self, method: &str, body: Value) {
        lock(&self.state).overrides.insert(method.to_string(), body);
    }

    pub fn push(&self, message: Value) {
        self.push_raw(&message.to_string());
    }

    pub fn push_raw(&self, line: &str) {
        self.send_control(Control::Line(format!("{}\r\n", line)));
    }

    /// Close the live connection from the device side
    pub fn drop_connection(&self) {
        self.send_control(Control::Drop);
    }

    fn send_control(&self, control: Control) {
        if let Some(tx) = lock(&self.state).control.as_ref() {
            let _ = tx.send(control);
        }
    }

    /// Wait until `count` requests for `method` arrived and return their ids
    pub async fn wait_for_ids(&self, method: &str, count: usize) -> Vec<u64> {
        for _ in 0..500 {
            let ids: Vec<u64> = self
                .requests()
                .iter()
                .filter(|r| r["method"] == method)
                .filter_map(|r| r["id"].as_u64())
                .collect();
            if ids.len() >= count {
                return ids;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("mock never saw {count} {method} requests");
    }
}

impl Drop for MockTelescope {
    fn drop(&mut self) {
        self.server.abort();
        if let Some(tx) = lock(&self.state).control.take() {
            let _ = tx.send(Control::Drop);
        }
    }
}

async fn serve(
    stream: TcpStream,
    state: Arc<Mutex<MockState>>,
    mut control: mpsc::UnboundedReceiver<Control>,
) {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };
                let Ok(request) = serde_json::from_str::<Value>(line.trim()) else {
                    continue;
                };
                match reply_to(&state, request) {
                    Reply::Send(reply) => {
                        let out = format!("{}\r\n", reply);
                        if write.write_all(out.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                    Reply::Withhold => {}
                    Reply::Close => break,
                }
            }
            command = control.recv() => match command {
                Some(Control::Line(line)) => {
                    if write.write_all(line.as_bytes()).await.is_err() {
                        break;
                    }
                }
                Some(Control::Drop) | None => break,
            },
        }
    }
}

enum Reply {
    Send(Value),
    Withhold,
    Close,
}

fn reply_to(state: &Mutex<MockState>, request: Value) -> Reply {
    let method = request["method"].as_str().unwrap_or_default().to_string();
    let body = {
        let mut state = lock(state);
        state.requests.push(request.clone());
        if state.closing.contains(&method) {
            return Reply::Close;
        }
        if state.withheld.contains(&method) {
            return Reply::Withhold;
        }
        state.overrides.get(&method).cloned()
    };

    let mut body = body.unwrap_or_else(|| default_reply(&method, &request));
    if let Value::Object(map) = &mut body {
        map.insert("jsonrpc".to_string(), json!("2.0"));
        map.insert("method".to_string(), json!(method));
        map.insert("id".to_string(), request["id"].clone());
    }
    Reply::Send(body)
}

fn default_reply(method: &str, request: &Value) -> Value {
    match method {
        methods::GET_VERIFY_STR => json!({"code": 0, "result": {"str": CHALLENGE}}),
        methods::VERIFY_CLIENT => {
            if signature_valid(&request["params"]) {
                json!({"code": 0, "result": 0})
            } else {
                json!({"code": 1, "result": 1, "error": "signature mismatch"})
            }
        }
        methods::GET_DEVICE_STATE => json!({
            "code": 0,
            "result": {
                "device": {"name": "Seestar S50", "firmware_ver_string": "6.45"},
                "mount": {"close": false, "equ_mode": false}
            }
        }),
        _ => json!({"code": 0, "result": 0}),
    }
}

fn signature_valid(params: &Value) -> bool {
    let (Some(sign), Some(data)) = (params["sign"].as_str(), params["data"].as_str()) else {
        return false;
    };
    let Ok(raw) = STANDARD.decode(sign) else {
        return false;
    };
    let public = RsaPublicKey::from(test_key());
    data == CHALLENGE
        && public
            .verify(Pkcs1v15Sign::new::<Sha1>(), &Sha1::digest(data.as_bytes()), &raw)
            .is_ok()
}
