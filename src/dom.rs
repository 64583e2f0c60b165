//! JavaScript run inside the page, plus helpers for reading its results.

use serde::Deserialize;

use crate::surface::Readiness;

/// Readiness probe for surfaces that only expose script evaluation.
/// Returns a JSON string so it survives by-reference evaluation.
pub const READINESS_JS: &str = r#"
(() => JSON.stringify({
  width: window.innerWidth || (document.documentElement ? document.documentElement.clientWidth : 0) || 0,
  height: window.innerHeight || (document.documentElement ? document.documentElement.clientHeight : 0) || 0,
  readyState: document.readyState || '',
  loading: document.readyState === 'loading',
  url: window.location.href
}))()
"#;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadinessProbe {
    width: f64,
    height: f64,
    ready_state: String,
    loading: bool,
    url: String,
}

/// Decode the result of [`READINESS_JS`].
pub fn parse_readiness(value: &serde_json::Value) -> Option<Readiness> {
    let probe: ReadinessProbe = match value {
        serde_json::Value::String(raw) => serde_json::from_str(raw).ok()?,
        other => serde_json::from_value(other.clone()).ok()?,
    };
    Some(Readiness {
        width: probe.width,
        height: probe.height,
        is_loading: probe.loading,
        ready_state: probe.ready_state,
        url: probe.url,
    })
}

/// Visible title and body text, capped at `max` characters.
pub fn visible_text_script(max: usize) -> String {
    format!(
        r#"
(() => {{
  const title = document.title || '';
  const body = document.body ? (document.body.innerText || '') : '';
  return (title + '\n' + body).slice(0, {max});
}})()
"#
    )
}

/// Click whatever element sits on top at a pixel point.
pub fn click_at_script(px: f64, py: f64) -> String {
    format!(
        r#"
(() => {{
  const el = document.elementFromPoint({px}, {py});
  if (!el) return 'no element';
  if (typeof el.focus === 'function') el.focus();
  el.click();
  return el.tagName.toLowerCase();
}})()
"#
    )
}

pub fn scroll_script(delta_y: f64) -> String {
    format!("(() => {{ window.scrollBy(0, {delta_y}); return window.scrollY; }})()")
}

/// Append `text` to the focused editable element and fire an `input` event.
///
/// The text is embedded as a JSON string literal, which is also a valid JS literal.
pub fn type_script(text: &str) -> String {
    let literal = serde_json::to_string(text).unwrap_or_else(|_| "\"\"".to_string());
    format!(
        r#"
(() => {{
  const el = document.activeElement;
  if (!el) return 'no focused element';
  const text = {literal};
  if (el.isContentEditable) {{
    el.textContent = (el.textContent || '') + text;
  }} else if ('value' in el) {{
    el.value = (el.value || '') + text;
  }} else {{
    return 'focused element is not editable';
  }}
  el.dispatchEvent(new Event('input', {{ bubbles: true }}));
  el.dispatchEvent(new Event('change', {{ bubbles: true }}));
  return 'typed into ' + el.tagName.toLowerCase();
}})()
"#
    )
}

/// Render a script result for the log.
pub fn describe_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

/// Truncate to at most `max` characters on a char boundary.
pub fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
