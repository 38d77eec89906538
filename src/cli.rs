//! # CLI Client Commands
//!
//! Thin client commands over the coordinator HTTP API: list and inspect
//! operations, request cancellation, trigger resume, and manage
//! checkpoints. Each prints the coordinator's JSON response; scripting
//! ergonomics beyond that are out of scope.

use anyhow::{bail, Context, Result};
use serde_json::Value;

fn api(coordinator_url: &str, path: &str) -> String {
    format!("{}/api/v1{}", coordinator_url.trim_end_matches('/'), path)
}

fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!("{}", value),
    }
}

fn get(url: &str) -> Result<Value> {
    let mut resp = ureq::get(url)
        .call()
        .with_context(|| format!("GET {} failed", url))?;
    resp.body_mut()
        .read_json()
        .context("response was not JSON")
}

fn send(method: &str, url: &str, body: Value) -> Result<Value> {
    let request = match method {
        "POST" => ureq::post(url).send_json(&body),
        "DELETE" => ureq::delete(url).call(),
        _ => bail!("unsupported method {}", method),
    };
    match request {
        Ok(mut resp) => resp.body_mut().read_json().context("response was not JSON"),
        Err(ureq::Error::StatusCode(code)) => {
            bail!("{} {} answered {}", method, url, code)
        }
        Err(e) => Err(e).with_context(|| format!("{} {} failed", method, url)),
    }
}

pub fn operations_list(
    coordinator_url: &str,
    status: Option<&str>,
    operation_type: Option<&str>,
    resumable: bool,
) -> Result<()> {
    let mut query = Vec::new();
    if let Some(status) = status {
        query.push(format!("status={}", status));
    }
    if let Some(operation_type) = operation_type {
        query.push(format!("operation_type={}", operation_type));
    }
    if resumable {
        query.push("resumable=true".to_string());
    }
    let suffix = if query.is_empty() {
        "/operations".to_string()
    } else {
        format!("/operations?{}", query.join("&"))
    };
    print_json(&get(&api(coordinator_url, &suffix))?);
    Ok(())
}

pub fn operations_get(coordinator_url: &str, id: &str) -> Result<()> {
    print_json(&get(&api(coordinator_url, &format!("/operations/{}", id)))?);
    Ok(())
}

pub fn operations_create(
    coordinator_url: &str,
    operation_type: &str,
    request_payload: Value,
) -> Result<()> {
    let body = serde_json::json!({
        "operation_type": operation_type,
        "request_payload": request_payload,
    });
    print_json(&send("POST", &api(coordinator_url, "/operations"), body)?);
    Ok(())
}

pub fn operations_cancel(coordinator_url: &str, id: &str) -> Result<()> {
    print_json(&send(
        "DELETE",
        &api(coordinator_url, &format!("/operations/{}", id)),
        Value::Null,
    )?);
    Ok(())
}

pub fn operations_resume(coordinator_url: &str, id: &str) -> Result<()> {
    print_json(&send(
        "POST",
        &api(coordinator_url, &format!("/operations/{}/resume", id)),
        serde_json::json!({}),
    )?);
    Ok(())
}

pub fn checkpoints_list(coordinator_url: &str, older_than_hours: Option<i64>) -> Result<()> {
    let suffix = match older_than_hours {
        Some(hours) => format!("/checkpoints?older_than_hours={}", hours),
        None => "/checkpoints".to_string(),
    };
    print_json(&get(&api(coordinator_url, &suffix))?);
    Ok(())
}

pub fn checkpoints_delete(coordinator_url: &str, id: &str) -> Result<()> {
    print_json(&send(
        "DELETE",
        &api(coordinator_url, &format!("/checkpoints/{}", id)),
        Value::Null,
    )?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_joins_paths_without_double_slashes() {
        assert_eq!(
            api("http://localhost:7100/", "/operations"),
            "http://localhost:7100/api/v1/operations"
        );
        assert_eq!(
            api("http://localhost:7100", "/operations/op_A"),
            "http://localhost:7100/api/v1/operations/op_A"
        );
    }
}
