//! Mock MCP server used by the client integration tests.
//!
//! Speaks JSON-RPC 2.0, one value per line, over stdin/stdout. Tool
//! behaviors cover the interesting client paths: plain results, progress
//! notifications, server-side errors, sudden death, and silence.

use std::io::{self, BufRead, Write};
use std::thread::sleep;
use std::time::Duration;

use serde_json::{json, Value};

fn main() {
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }
        let message: Value = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(_) => continue,
        };
        let id = message.get("id").cloned().unwrap_or(Value::Null);

        match message.get("method").and_then(Value::as_str) {
            Some("initialize") => {
                respond(&id, json!({"serverInfo": {"name": "mock", "version": "0.1"}}));
            }
            Some("tools/list") => {
                respond(
                    &id,
                    json!({"tools": [
                        {"name": "echo"},
                        {"name": "slow_echo"},
                        {"name": "fail"},
                        {"name": "die"},
                        {"name": "die_once"},
                        {"name": "silent"},
                    ]}),
                );
            }
            Some("tools/call") => handle_tool_call(&id, &message),
            _ => respond_error(&id, -32601, "method not found"),
        }
    }
}

fn handle_tool_call(id: &Value, message: &Value) {
    let tool = message
        .pointer("/params/name")
        .and_then(Value::as_str)
        .unwrap_or("");
    let arguments = message
        .pointer("/params/arguments")
        .cloned()
        .unwrap_or_else(|| json!({}));

    match tool {
        "echo" => respond(id, json!({"echo": arguments})),
        "slow_echo" => {
            let delay_ms = arguments
                .get("delay_ms")
                .and_then(Value::as_u64)
                .unwrap_or(100);
            let heartbeat_ms = arguments.get("heartbeat_ms").and_then(Value::as_u64);

            let mut elapsed = 0;
            if let Some(interval) = heartbeat_ms {
                while elapsed + interval < delay_ms {
                    sleep(Duration::from_millis(interval));
                    elapsed += interval;
                    notify("$/progress", json!({"message": format!("{elapsed}ms elapsed")}));
                }
            }
            sleep(Duration::from_millis(delay_ms - elapsed));
            respond(id, json!({"echo": arguments, "slow": true}));
        }
        "fail" => respond_error(id, -32000, "mock tool failure"),
        "die" => std::process::exit(1),
        "die_once" => {
            // Dies on the first invocation per state file, succeeds after a
            // respawn. Exercises the reconnect-and-retry path.
            let state_file = std::env::var("MOCK_STATE_FILE").unwrap_or_default();
            if state_file.is_empty() || !std::path::Path::new(&state_file).exists() {
                if !state_file.is_empty() {
                    let _ = std::fs::write(&state_file, "died");
                }
                std::process::exit(1);
            }
            respond(id, json!({"ok": true, "attempt": 2}));
        }
        "silent" => {
            // Never answer; the client's timeouts must fire.
        }
        other => respond_error(id, -32601, &format!("unknown tool '{other}'")),
    }
}

fn respond(id: &Value, result: Value) {
    write_json(&json!({"jsonrpc": "2.0", "id": id, "result": result}));
}

fn respond_error(id: &Value, code: i64, message: &str) {
    write_json(&json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}}));
}

fn notify(method: &str, params: Value) {
    write_json(&json!({"jsonrpc": "2.0", "method": method, "params": params}));
}

fn write_json(value: &Value) {
    let mut stdout = io::stdout().lock();
    let _ = writeln!(stdout, "{value}");
    let _ = stdout.flush();
}
