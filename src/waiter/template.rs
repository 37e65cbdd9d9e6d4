//! Structure-preserving `${VAR}` expansion over webhook URLs and JSON
//! payloads, plus the well-known `BREAKPOINT_*` expansion variables.

use chrono::{DateTime, Utc};
use serde_json::Value;

/// Builds the `mapping` closure `os.Expand` is called with in the original:
/// the four `BREAKPOINT_*` pseudo-variables, falling through to the
/// process environment for anything else.
pub fn expand_fn(addr: &str, expiration: DateTime<Utc>) -> impl Fn(&str) -> String + '_ {
    let (host, port) = split_host_port(addr);

    move |key: &str| match key {
        "BREAKPOINT_ENDPOINT" => addr.to_string(),
        "BREAKPOINT_HOST" => host.clone(),
        "BREAKPOINT_PORT" => port.clone(),
        "BREAKPOINT_TIME_LEFT" => relative_time(expiration),
        "BREAKPOINT_EXPIRATION" => expiration.format("%b %e %H:%M:%S %Z").to_string(),
        other => std::env::var(other).unwrap_or_default(),
    }
}

fn split_host_port(addr: &str) -> (String, String) {
    match addr.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.to_string()),
        None => (addr.to_string(), String::new()),
    }
}

fn relative_time(target: DateTime<Utc>) -> String {
    let now = Utc::now();
    let delta = target - now;
    if delta.num_seconds() <= 0 {
        return "now".to_string();
    }
    humantime::format_duration(delta.to_std().unwrap_or_default()).to_string()
}

/// Shell-like `$NAME` / `${NAME}` expansion, the Rust stand-in for Go's
/// `os.Expand`.
pub fn expand_string(input: &str, mapping: &impl Fn(&str) -> String) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }

        match chars.peek() {
            Some('{') => {
                chars.next();
                let mut name = String::new();
                for c in chars.by_ref() {
                    if c == '}' {
                        break;
                    }
                    name.push(c);
                }
                out.push_str(&mapping(&name));
            }
            Some(c) if c.is_alphanumeric() || *c == '_' => {
                let mut name = String::new();
                while let Some(c) = chars.peek() {
                    if c.is_alphanumeric() || *c == '_' {
                        name.push(*c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push_str(&mapping(&name));
            }
            _ => out.push('$'),
        }
    }

    out
}

/// Recursively expands every string leaf of a JSON value, preserving object
/// and array structure - the Rust counterpart of `execTemplate`/
/// `execMapTemplate`.
pub fn expand_value(value: &Value, mapping: &impl Fn(&str) -> String) -> Value {
    match value {
        Value::String(s) => Value::String(expand_string(s, mapping)),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| expand_value(v, mapping)).collect())
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), expand_value(v, mapping)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn expand_preserves_structure() {
        let payload = json!({
            "blocks": [
                {
                    "type": "header",
                    "text": { "type": "plain_text", "text": "Workflow failed", "emoji": true }
                },
                {
                    "type": "section",
                    "text": {
                        "type": "mrkdwn",
                        "text": "*Repository:* <https://${GITHUB_REPOSITORY}/tree/${GITHUB_REF_NAME}|${GITHUB_REPOSITORY}> (${GITHUB_REF_NAME})"
                    }
                }
            ]
        });

        let mapping = |key: &str| match key {
            "GITHUB_REPOSITORY" => "arepo".to_string(),
            "GITHUB_REF_NAME" => "main".to_string(),
            _ => String::new(),
        };

        let got = expand_value(&payload, &mapping);

        let want = json!({
            "blocks": [
                {
                    "type": "header",
                    "text": { "type": "plain_text", "text": "Workflow failed", "emoji": true }
                },
                {
                    "type": "section",
                    "text": {
                        "type": "mrkdwn",
                        "text": "*Repository:* <https://arepo/tree/main|arepo> (main)"
                    }
                }
            ]
        });

        assert_eq!(got, want);
    }

    #[test]
    fn non_string_leaves_pass_through() {
        let mapping = |_: &str| String::new();
        assert_eq!(expand_value(&json!(true), &mapping), json!(true));
        assert_eq!(expand_value(&json!(42), &mapping), json!(42));
    }
}
