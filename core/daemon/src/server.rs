//! Control socket: newline-delimited JSON, one request per connection.

use hero_watch_core::alert::SilenceReport;
use hero_watch_core::{Lifecycle, ResidentProcess};
use hero_watch_protocol::{
    parse_foreground, parse_session_identifier, ErrorInfo, Method, Request, Response,
    ERROR_TOO_MANY_CONNECTIONS, MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};
use serde_json::{json, Value};
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

const READ_TIMEOUT_SECS: u64 = 2;
const READ_CHUNK_SIZE: usize = 4096;
pub const MAX_ACTIVE_CONNECTIONS: usize = 64;

/// Counts a connection while it is being served.
struct ConnectionSlot {
    active: Arc<AtomicUsize>,
}

impl ConnectionSlot {
    fn acquire(active: &Arc<AtomicUsize>) -> Option<Self> {
        let previous = active.fetch_add(1, Ordering::SeqCst);
        if previous >= MAX_ACTIVE_CONNECTIONS {
            active.fetch_sub(1, Ordering::SeqCst);
            return None;
        }
        Some(Self {
            active: Arc::clone(active),
        })
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

pub fn serve(listener: UnixListener, process: Arc<ResidentProcess>) {
    let active = Arc::new(AtomicUsize::new(0));
    for stream in listener.incoming() {
        match stream {
            Ok(mut stream) => {
                let Some(slot) = ConnectionSlot::acquire(&active) else {
                    warn!("Rejecting connection; too many active connections");
                    let response = Response::error(
                        None,
                        ERROR_TOO_MANY_CONNECTIONS,
                        "too many active connections",
                    );
                    let _ = write_response(&mut stream, response);
                    continue;
                };
                let process = Arc::clone(&process);
                let spawned = thread::Builder::new()
                    .name("control-connection".to_string())
                    .spawn(move || {
                        let _slot = slot;
                        handle_connection(stream, process);
                    });
                if let Err(err) = spawned {
                    warn!(error = %err, "Failed to spawn connection thread");
                }
            }
            Err(err) => {
                warn!(error = %err, "Failed to accept control connection");
            }
        }
    }
}

fn handle_connection(mut stream: UnixStream, process: Arc<ResidentProcess>) {
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read request");
            let response = Response::error_with_info(None, err);
            let _ = write_response(&mut stream, response);
            return;
        }
    };

    debug!(method = ?request.method, id = ?request.id, "Control request received");
    let response = handle_request(request, &process);
    let _ = write_response(&mut stream, response);
}

fn read_request(stream: &mut UnixStream) -> Result<Request, ErrorInfo> {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(READ_TIMEOUT_SECS)));

    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ErrorInfo::new(
                        "request_too_large",
                        "request exceeded maximum size",
                    ));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                return Err(ErrorInfo::new("read_timeout", "request timed out"));
            }
            Err(err) => {
                return Err(ErrorInfo::new(
                    "read_error",
                    format!("failed to read request: {}", err),
                ));
            }
        }
    }

    let request_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    if request_bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    serde_json::from_slice(request_bytes).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("request was not valid JSON: {}", err),
        )
    })
}

pub fn handle_request(request: Request, process: &ResidentProcess) -> Response {
    if request.protocol_version != PROTOCOL_VERSION {
        return Response::error(
            request.id,
            "protocol_mismatch",
            "unsupported protocol version",
        );
    }

    match request.method {
        Method::GetHealth => match serde_json::to_value(process.health()) {
            Ok(mut data) => {
                data["status"] = json!("ok");
                data["protocol_version"] = json!(PROTOCOL_VERSION);
                Response::ok(request.id, data)
            }
            Err(err) => Response::error(
                request.id,
                "serialization_error",
                format!("Failed to serialize health: {}", err),
            ),
        },
        Method::Start => {
            if process.lifecycle() == Lifecycle::Destroyed {
                return Response::error(
                    request.id,
                    "destroyed",
                    "resident process is shutting down",
                );
            }
            process.on_start();
            Response::ok(request.id, json!({ "lifecycle": process.lifecycle() }))
        }
        Method::SetSessionIdentifier => {
            let Some(params) = request.params else {
                return Response::error(request.id, "invalid_params", "driver_id is required");
            };
            let parsed = match parse_session_identifier(params) {
                Ok(parsed) => parsed,
                Err(err) => return Response::error_with_info(request.id, err),
            };
            process.set_session_identifier(&parsed.driver_id);
            Response::ok(request.id, json!({ "accepted": true }))
        }
        Method::Silence => silence_response(request.id, Some(process.silence())),
        Method::VolumeKey => silence_response(request.id, process.volume_key()),
        Method::SetForeground => {
            let Some(params) = request.params else {
                return Response::error(request.id, "invalid_params", "foreground is required");
            };
            let parsed = match parse_foreground(params) {
                Ok(parsed) => parsed,
                Err(err) => return Response::error_with_info(request.id, err),
            };
            process.set_foreground(parsed.foreground);
            Response::ok(request.id, json!({ "foreground": parsed.foreground }))
        }
        Method::TaskRemoved => {
            let report = process.on_task_removed();
            info!(
                fired = report.fired.succeeded(),
                reinstalled = report.reinstalled.succeeded(),
                "Task removed"
            );
            let mut failed = report.fired.failed();
            failed.extend(report.reinstalled.failed());
            Response::ok(
                request.id,
                json!({
                    "fired": report.fired.succeeded(),
                    "reinstalled": report.reinstalled.succeeded(),
                    "failed": failed,
                }),
            )
        }
    }
}

fn silence_response(id: Option<String>, report: Option<SilenceReport>) -> Response {
    let mut data = match report.as_ref().map(serde_json::to_value) {
        Some(Ok(value)) => value,
        Some(Err(err)) => {
            return Response::error(
                id,
                "serialization_error",
                format!("Failed to serialize silence report: {}", err),
            )
        }
        None => Value::Object(Default::default()),
    };
    data["consumed"] = json!(report.is_some());
    Response::ok(id, data)
}

fn write_response(stream: &mut UnixStream, response: Response) -> std::io::Result<()> {
    serde_json::to_writer(&mut *stream, &response)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}
