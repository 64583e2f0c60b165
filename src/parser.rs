//! Lenient decoding of decision-engine replies into actions.
//!
//! Models wrap JSON in prose or code fences, mix up key names and
//! occasionally emit an action the agent cannot perform. Parsing never
//! fails: anything unusable is dropped and reported as a warning.

use serde_json::{Map, Value};

use crate::types::{Action, ModelResponse};

pub fn parse(raw_text: &str) -> ModelResponse {
    let mut response = ModelResponse {
        raw_text: raw_text.to_string(),
        ..ModelResponse::default()
    };

    let Some(candidate) = extract_json(raw_text) else {
        response
            .warnings
            .push("response is not JSON: no object found".to_string());
        return response;
    };

    let root = match serde_json::from_str::<Value>(candidate) {
        Ok(Value::Object(map)) => map,
        Ok(_) => {
            response
                .warnings
                .push("response is not JSON: top level is not an object".to_string());
            return response;
        }
        Err(e) => {
            response
                .warnings
                .push(format!("response is not JSON: {e}"));
            return response;
        }
    };

    let items: Vec<Value> = match root.get("actions").or_else(|| root.get("action")) {
        Some(Value::Array(items)) => items.clone(),
        Some(item @ Value::Object(_)) => vec![item.clone()],
        Some(Value::Null) | None => Vec::new(),
        Some(other) => {
            response
                .warnings
                .push(format!("ignoring action list of unexpected shape: {other}"));
            Vec::new()
        }
    };

    for (index, item) in items.iter().enumerate() {
        match decode_action(item) {
            Ok(action) => response.actions.push(action),
            Err(reason) => response
                .warnings
                .push(format!("dropped action {}: {reason}", index + 1)),
        }
    }

    let has_complete_action = response.actions.iter().any(|a| matches!(a, Action::Complete));
    response.is_complete = completion_flag(&root) || has_complete_action;
    response
}

/// Fenced block contents if present, otherwise the outermost `{ ... }` span.
fn extract_json(text: &str) -> Option<&str> {
    let scope = fenced_block(text).unwrap_or(text);
    let start = scope.find('{')?;
    let end = scope.rfind('}')?;
    (end > start).then(|| &scope[start..=end])
}

fn fenced_block(text: &str) -> Option<&str> {
    let open = text.find("```")?;
    let after_ticks = &text[open + 3..];
    // Skip an optional language tag on the opening line.
    let body_start = match after_ticks.find('\n') {
        Some(newline) if !after_ticks[..newline].contains('{') => newline + 1,
        _ => 0,
    };
    let body = &after_ticks[body_start..];
    let close = body.find("```")?;
    Some(&body[..close])
}

fn completion_flag(root: &Map<String, Value>) -> bool {
    let flag = |key: &str| root.get(key).and_then(Value::as_bool).unwrap_or(false);
    let status = root
        .get("status")
        .and_then(Value::as_str)
        .is_some_and(|s| s.to_lowercase().contains("complete"));
    flag("complete") || flag("done") || status
}

fn normalize(kind: &str) -> String {
    kind.chars()
        .filter(|c| *c != '_' && *c != '-' && !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

fn decode_action(item: &Value) -> Result<Action, String> {
    let Value::Object(fields) = item else {
        return Err(format!("not an object: {item}"));
    };
    let kind = fields
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| "missing 'type'".to_string())?;

    match normalize(kind).as_str() {
        "navigate" | "goto" | "open" | "openurl" | "load" => {
            let url = string_field(fields, &["url", "href"])
                .ok_or_else(|| format!("{kind}: missing 'url'"))?;
            Ok(Action::Navigate { url })
        }
        "clickat" | "click" | "tap" => {
            let x = number_field(fields, &["x", "nx"]).ok_or_else(|| format!("{kind}: missing 'x'"))?;
            let y = number_field(fields, &["y", "ny"]).ok_or_else(|| format!("{kind}: missing 'y'"))?;
            Ok(Action::ClickAt { x, y })
        }
        "scroll" | "scrollby" => {
            let delta_y = number_field(fields, &["delta_y", "deltaY", "dy", "amount", "y"])
                .ok_or_else(|| format!("{kind}: missing 'delta_y'"))?;
            Ok(Action::Scroll { delta_y })
        }
        "type" | "typetext" | "input" | "entertext" => {
            let text = string_field(fields, &["text", "value"])
                .ok_or_else(|| format!("{kind}: missing 'text'"))?;
            Ok(Action::Type { text })
        }
        "wait" | "sleep" | "pause" => {
            let ms = number_field(fields, &["ms", "milliseconds", "duration_ms", "duration"])
                .filter(|ms| *ms >= 0.0)
                .ok_or_else(|| format!("{kind}: missing 'ms'"))?;
            Ok(Action::Wait { ms: ms.round() as u64 })
        }
        "complete" | "done" | "finish" | "finished" => Ok(Action::Complete),
        _ => Err(format!("unknown type '{kind}'")),
    }
}

fn string_field(fields: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| fields.get(*k).and_then(Value::as_str))
        .map(str::to_string)
}

/// Numbers, or strings holding numbers.
fn number_field(fields: &Map<String, Value>, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| match fields.get(*k)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    })
    .filter(|n| n.is_finite())
}
