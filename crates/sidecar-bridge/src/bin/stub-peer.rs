//! Scripted peer for the integration tests.
//!
//! Speaks the line protocol on stdin/stdout. The first argument selects how
//! the init handshake goes:
//!
//! - `echo` (default): acknowledge at once
//! - `slow-init`: acknowledge after 300ms
//! - `init-fail`: reject init with `"init_failed"`
//! - `silent-init`: never answer init
//! - `auth`: exercise every reverse request before acknowledging
//! - `bad-version`: answer init with protocol version 2
//!
//! Exits with status 3 when the host breaks the protocol: anything other than
//! `init` first, or any line arriving before the acknowledgment went out.

use std::io::{self, BufRead, Write};
use std::process::ExitCode;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{Value, json};

const PROTOCOL_VIOLATION: u8 = 3;
const SLOW_INIT: Duration = Duration::from_millis(300);

#[derive(Debug)]
enum Stop {
    Eof,
    Violation(String),
    Io(io::Error),
}

impl From<io::Error> for Stop {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

struct Peer {
    lines: mpsc::Receiver<(Instant, String)>,
    out: io::Stdout,
    acked_at: Option<Instant>,
    held: Option<String>,
}

impl Peer {
    fn spawn_reader() -> mpsc::Receiver<(Instant, String)> {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.send((Instant::now(), line)).is_err() {
                    break;
                }
            }
        });
        rx
    }

    fn write(&self, value: &Value) -> io::Result<()> {
        self.write_raw(&format!("{value}\n"))
    }

    fn write_raw(&self, text: &str) -> io::Result<()> {
        let mut out = self.out.lock();
        out.write_all(text.as_bytes())?;
        out.flush()
    }

    fn respond(&self, id: &str, result: Result<Value, Value>) -> io::Result<()> {
        match result {
            Ok(data) => self.write(&json!({"v": 1, "id": id, "ok": true, "data": data})),
            Err(error) => self.write(&json!({"v": 1, "id": id, "ok": false, "error": error})),
        }
    }

    /// Next message from the host, checked against the acknowledgment time.
    fn next_message(&self) -> Result<Value, Stop> {
        let (arrived, line) = self.lines.recv().map_err(|_| Stop::Eof)?;
        if self.acked_at.is_some_and(|acked| arrived < acked) {
            return Err(Stop::Violation(format!("line arrived before init ack: {line}")));
        }
        let value: Value = serde_json::from_str(&line)
            .map_err(|e| Stop::Violation(format!("host sent invalid JSON ({e}): {line}")))?;
        if value.get("v") != Some(&json!(1)) {
            return Err(Stop::Violation(format!("host line without v:1: {line}")));
        }
        Ok(value)
    }

    fn ack(&mut self, id: &str, result: Result<Value, Value>) -> io::Result<()> {
        self.respond(id, result)?;
        self.acked_at = Some(Instant::now());
        Ok(())
    }

    fn handshake(&mut self, scenario: &str) -> Result<(), Stop> {
        let init = self.next_message()?;
        if init.get("cmd").and_then(Value::as_str) != Some("init") {
            return Err(Stop::Violation(format!("first line was not init: {init}")));
        }
        let id = str_field(&init, "id");

        match scenario {
            "slow-init" => {
                thread::sleep(SLOW_INIT);
                self.ack(&id, Ok(json!({})))?;
            }
            "init-fail" => self.ack(&id, Err(json!("init_failed")))?,
            "silent-init" => {}
            "auth" => {
                let result = self.check_auth();
                self.ack(&id, result)?;
            }
            "bad-version" => {
                self.write(&json!({"v": 2, "id": id, "ok": true, "data": {}}))?;
                self.acked_at = Some(Instant::now());
            }
            _ => self.ack(&id, Ok(json!({"peer": "stub"})))?,
        }
        Ok(())
    }

    /// Run through the reverse requests; the init ack carries the verdict.
    fn check_auth(&self) -> Result<Value, Value> {
        let loaded = self.reverse("a1", "load_creds", &json!({}))?;
        let mut saved = false;
        if loaded.get("creds").is_none_or(Value::is_null) {
            let creds = json!({"noise": {"__b64": "AQID"}, "registration_id": 42});
            self.reverse("a2", "save_creds", &json!({"creds": creds}))?;
            saved = true;
        }

        self.reverse(
            "a3",
            "keys_set",
            &json!({"data": {"pre-key": {"1": {"__b64": "AAE="}, "2": {"__b64": "AAI="}}}}),
        )?;
        self.reverse("a4", "keys_set", &json!({"data": {"pre-key": {"2": null}}}))?;
        let keys = self.reverse("a5", "keys_get", &json!({"type": "pre-key", "ids": ["1", "2"]}))?;
        let expected = json!({"keys": {"1": {"__b64": "AAE="}}});
        if keys != expected {
            return Err(json!({"code": "auth_check_failed", "got": keys}));
        }

        match self.reverse("a6", "steal_creds", &json!({})) {
            Err(error) if error.get("code") == Some(&json!("unknown_request")) => {}
            other => return Err(json!({"code": "auth_check_failed", "unknown": format!("{other:?}")})),
        }
        Ok(json!({"saved_creds": saved}))
    }

    fn reverse(&self, id: &str, req: &str, args: &Value) -> Result<Value, Value> {
        let violation = |detail: String| json!({"code": "auth_check_failed", "detail": detail});
        self.write(&json!({"v": 1, "id": id, "req": req, "args": args}))
            .map_err(|e| violation(e.to_string()))?;
        let reply = self.next_message().map_err(|stop| violation(format!("{stop:?}")))?;
        if reply.get("id").and_then(Value::as_str) != Some(id) {
            return Err(violation(format!("reply to {req} has wrong id: {reply}")));
        }
        match reply.get("ok") {
            Some(Value::Bool(true)) => Ok(reply.get("data").cloned().unwrap_or(Value::Null)),
            Some(Value::Bool(false)) => Err(reply.get("error").cloned().unwrap_or(Value::Null)),
            _ => Err(violation(format!("reply to {req} has no ok flag: {reply}"))),
        }
    }

    fn serve(&mut self) -> Result<(), Stop> {
        loop {
            let request = self.next_message()?;
            let Some(cmd) = request.get("cmd").and_then(Value::as_str) else {
                continue;
            };
            let id = str_field(&request, "id");
            let args = request.get("args").cloned().unwrap_or(Value::Null);
            self.command(cmd, &id, args)?;
        }
    }

    fn command(&mut self, cmd: &str, id: &str, args: Value) -> Result<(), Stop> {
        match cmd {
            "echo" => self.respond(id, Ok(args))?,
            "fail" => self.respond(id, Err(args))?,
            "ignore" => {}
            "emit" => {
                let count = args.get("count").and_then(Value::as_u64).unwrap_or(1);
                let name = args.get("name").and_then(Value::as_str).unwrap_or("tick");
                for n in 0..count {
                    self.write(&json!({"v": 1, "event": name, "data": {"n": n}}))?;
                }
                self.respond(id, Ok(json!({"count": count})))?;
            }
            "hold" => match self.held.take() {
                None => self.held = Some(id.to_string()),
                Some(first) => {
                    self.respond(&first, Ok(json!({"held": first})))?;
                    self.write_raw("{this is not json\n")?;
                    self.respond(id, Ok(json!({"held": id})))?;
                }
            },
            "blob" => self.respond(
                id,
                Ok(json!({"echo": args, "fixed": {"__b64": "AAEC/w=="}})),
            )?,
            "bad_version" => {
                self.write(&json!({"v": 2, "id": id, "ok": true, "data": {}}))?;
            }
            "legacy_event" => {
                self.write(&json!({"event": "legacy", "data": {"n": 1}}))?;
                self.respond(id, Ok(json!({})))?;
            }
            "partial" => {
                let line = json!({"v": 1, "id": id, "ok": true, "data": {"partial": true}}).to_string();
                let (head, tail) = line.split_at(line.len() / 2);
                self.write_raw(head)?;
                thread::sleep(Duration::from_millis(50));
                self.write_raw(&format!("{tail}\n"))?;
            }
            "flood" => {
                let bytes = args.get("bytes").and_then(Value::as_u64).unwrap_or(1024);
                let len = usize::try_from(bytes).unwrap_or(usize::MAX);
                self.write_raw(&"x".repeat(len))?;
            }
            "exit" => {
                let code = args.get("code").and_then(Value::as_i64).unwrap_or(0);
                std::process::exit(i32::try_from(code).unwrap_or(1));
            }
            _ => self.respond(
                id,
                Err(json!({"code": "unknown_command", "message": format!("no command '{cmd}'")})),
            )?,
        }
        Ok(())
    }
}

fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn main() -> ExitCode {
    let scenario = std::env::args().nth(1).unwrap_or_else(|| "echo".to_string());
    let mut peer = Peer {
        lines: Peer::spawn_reader(),
        out: io::stdout(),
        acked_at: None,
        held: None,
    };

    let result = peer.handshake(&scenario).and_then(|()| match scenario.as_str() {
        "init-fail" | "silent-init" => loop {
            peer.lines.recv().map_err(|_| Stop::Eof)?;
        },
        _ => peer.serve(),
    });

    match result {
        Ok(()) | Err(Stop::Eof) => ExitCode::SUCCESS,
        Err(Stop::Violation(detail)) => {
            eprintln!("stub-peer: protocol violation: {detail}");
            ExitCode::from(PROTOCOL_VIOLATION)
        }
        Err(Stop::Io(e)) => {
            eprintln!("stub-peer: io error: {e}");
            ExitCode::FAILURE
        }
    }
}
