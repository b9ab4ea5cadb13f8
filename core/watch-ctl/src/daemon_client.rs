//! Client helper for sending control requests to the resident process.

use chrono::Utc;
use hero_watch_core::host::{request, send_request};
use hero_watch_protocol::{Method, Response};
use rand::RngCore;
use serde_json::Value;
use std::path::Path;
use std::time::Duration;

const RETRY_DELAY_MS: u64 = 50;

/// Sends one request and returns its data payload. A refused request becomes `Err`.
pub fn call(socket: &Path, method: Method, params: Option<Value>) -> Result<Value, String> {
    let response = send_with_retry(socket, method, params)?;
    into_data(response)
}

fn send_with_retry(
    socket: &Path,
    method: Method,
    params: Option<Value>,
) -> Result<Response, String> {
    let id = make_request_id();
    match send_request(socket, &request(method, Some(id.clone()), params.clone())) {
        Ok(response) => Ok(response),
        Err(err) => {
            tracing::warn!(error = %err, ?method, "Failed to reach daemon");
            std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS));
            send_request(socket, &request(method, Some(id), params)).map_err(|retry_err| {
                tracing::warn!(error = %retry_err, ?method, "Retry failed reaching daemon");
                retry_err
            })
        }
    }
}

fn into_data(response: Response) -> Result<Value, String> {
    if response.ok {
        return Ok(response.data.unwrap_or(Value::Null));
    }
    Err(match response.error {
        Some(error) => format!("{}: {}", error.code, error.message),
        None => "daemon refused the request".to_string(),
    })
}

fn make_request_id() -> String {
    let mut random = rand::thread_rng();
    let rand = random.next_u64();
    format!(
        "ctl-{}-{}-{:x}",
        Utc::now().timestamp_millis(),
        std::process::id(),
        rand
    )
}
