//! `{{ path }}` placeholder resolution.
//!
//! A path is a dotted lookup rooted at a variable: `input`, `lastOutput`, a
//! node id, or an output key. Numeric segments index into arrays. A string
//! that is exactly one placeholder resolves to the referenced value itself;
//! placeholders embedded in surrounding text are stringified.

use crate::error::TemplateError;
use regex::Regex;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::LazyLock;

/// Run variables, keyed by root name.
pub type Variables = BTreeMap<String, JsonValue>;

/// Variable holding the validated run input.
pub const INPUT_VAR: &str = "input";
/// Variable holding the most recent node output.
pub const LAST_OUTPUT_VAR: &str = "lastOutput";

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([^{}]*?)\s*\}\}").expect("placeholder regex"));

static WHOLE_PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\{\{\s*([^{}]*?)\s*\}\}$").expect("placeholder regex"));

static PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_\-]+(\.[A-Za-z0-9_\-]+)*$").expect("path regex")
});

/// Returns the paths referenced by `template`, in order of appearance.
#[must_use]
pub fn references(template: &str) -> Vec<String> {
    PLACEHOLDER
        .captures_iter(template)
        .map(|cap| cap[1].trim().to_string())
        .collect()
}

/// Returns the root variable name of a path.
#[must_use]
pub fn root_of(path: &str) -> &str {
    path.split('.').next().unwrap_or(path)
}

/// Checks that `path` is a well-formed dotted path.
///
/// # Errors
///
/// Returns [`TemplateError::MalformedPath`] otherwise.
pub fn check_path(path: &str) -> Result<(), TemplateError> {
    if PATH.is_match(path) {
        Ok(())
    } else {
        Err(TemplateError::MalformedPath {
            path: path.to_string(),
        })
    }
}

/// Looks up a dotted path.
///
/// # Errors
///
/// Returns an error if the path is malformed or leads nowhere.
pub fn resolve_path<'a>(path: &str, vars: &'a Variables) -> Result<&'a JsonValue, TemplateError> {
    check_path(path)?;
    let unresolved = || TemplateError::UnresolvedPath {
        path: path.to_string(),
    };

    let mut segments = path.split('.');
    let root = segments.next().ok_or_else(unresolved)?;
    let mut current = vars.get(root).ok_or_else(unresolved)?;
    for segment in segments {
        current = match current {
            JsonValue::Object(map) => map.get(segment),
            JsonValue::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        }
        .ok_or_else(unresolved)?;
    }
    Ok(current)
}

/// Renders a value for embedding in text: strings raw, everything else as
/// compact JSON.
#[must_use]
pub fn stringify(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Resolves placeholders in a single string.
///
/// # Errors
///
/// Returns an error for the first placeholder that does not resolve.
pub fn interpolate_str(template: &str, vars: &Variables) -> Result<JsonValue, TemplateError> {
    if let Some(cap) = WHOLE_PLACEHOLDER.captures(template) {
        return resolve_path(cap[1].trim(), vars).cloned();
    }
    render(template, vars).map(JsonValue::String)
}

/// Resolves placeholders in a string, always producing text.
///
/// # Errors
///
/// Returns an error for the first placeholder that does not resolve.
pub fn render(template: &str, vars: &Variables) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for cap in PLACEHOLDER.captures_iter(template) {
        let Some(whole) = cap.get(0) else { continue };
        out.push_str(&template[last..whole.start()]);
        out.push_str(&stringify(resolve_path(cap[1].trim(), vars)?));
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

/// Resolves placeholders in every string inside `value`. Object keys are
/// left alone.
///
/// # Errors
///
/// Returns an error for the first placeholder that does not resolve.
pub fn interpolate_value(value: &JsonValue, vars: &Variables) -> Result<JsonValue, TemplateError> {
    Ok(match value {
        JsonValue::String(s) => interpolate_str(s, vars)?,
        JsonValue::Array(items) => JsonValue::Array(
            items
                .iter()
                .map(|item| interpolate_value(item, vars))
                .collect::<Result<_, _>>()?,
        ),
        JsonValue::Object(map) => JsonValue::Object(
            map.iter()
                .map(|(k, v)| Ok((k.clone(), interpolate_value(v, vars)?)))
                .collect::<Result<_, TemplateError>>()?,
        ),
        other => other.clone(),
    })
}

/// Collects every path referenced anywhere inside `value`.
#[must_use]
pub fn value_references(value: &JsonValue) -> Vec<String> {
    let mut paths = Vec::new();
    collect_references(value, &mut paths);
    paths
}

fn collect_references(value: &JsonValue, paths: &mut Vec<String>) {
    match value {
        JsonValue::String(s) => paths.extend(references(s)),
        JsonValue::Array(items) => items.iter().for_each(|v| collect_references(v, paths)),
        JsonValue::Object(map) => map.values().for_each(|v| collect_references(v, paths)),
        _ => {}
    }
}
