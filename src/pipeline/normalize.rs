//! Response normalisation: model text → ordered candidate entries.
//!
//! Model output is untyped. Even with "return only JSON" in the prompt we
//! see fenced blocks, a bare object where a list was asked for, lists of
//! per-sub-batch lists, and the occasional sentence instead of JSON. Each
//! shape is resolved explicitly through [`ResponseShape`] rather than by
//! probing values ad hoc:
//!
//! 1. strip a ```` ``` ```` / ```` ```json ```` fence if present;
//! 2. an array of objects → one candidate per object;
//! 3. a single object → one candidate;
//! 4. an array containing arrays → flattened one level; anything that is
//!    still not an object is [`BatchError::UnexpectedShape`];
//! 5. invalid JSON → [`BatchError::MalformedResponse`] carrying the raw text.
//!
//! Errors are returned, never panicked: a bad response costs one batch its
//! candidates and nothing else.

use crate::error::BatchError;
use crate::model::CandidateEntry;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

type Object = Map<String, Value>;

/// The structural shape of a response, decided once up front.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseShape {
    /// `{...}`
    Object(Object),
    /// `[{...}, {...}]`, possibly empty.
    Objects(Vec<Object>),
    /// `[[{...}], {...}, ...]`: at least one element is itself a list.
    Nested(Vec<Value>),
    /// Valid JSON of any other kind (string, number, list of scalars...).
    Other(Value),
    /// Not JSON at all.
    Malformed { detail: String },
}

/// Parse the raw model text and classify its shape.
pub fn classify(raw: &str) -> ResponseShape {
    let body = strip_code_fence(raw);
    let value: Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(e) => {
            return ResponseShape::Malformed {
                detail: e.to_string(),
            }
        }
    };

    match value {
        Value::Object(map) => ResponseShape::Object(map),
        Value::Array(items) if items.iter().any(Value::is_array) => ResponseShape::Nested(items),
        Value::Array(items) if items.iter().all(Value::is_object) => ResponseShape::Objects(
            items
                .into_iter()
                .filter_map(|v| match v {
                    Value::Object(m) => Some(m),
                    _ => None,
                })
                .collect(),
        ),
        other => ResponseShape::Other(other),
    }
}

/// Turn raw model text into candidates, in response order.
pub fn normalize(raw: &str) -> Result<Vec<CandidateEntry>, BatchError> {
    let objects = match classify(raw) {
        ResponseShape::Object(map) => vec![map],
        ResponseShape::Objects(maps) => maps,
        ResponseShape::Nested(items) => flatten_one_level(items)?,
        ResponseShape::Other(value) => {
            return Err(BatchError::UnexpectedShape {
                detail: format!("expected an object or a list of objects, got {}", kind(&value)),
            })
        }
        ResponseShape::Malformed { detail } => {
            return Err(BatchError::MalformedResponse {
                detail,
                raw: raw.to_string(),
            })
        }
    };
    Ok(objects.iter().map(candidate_from_object).collect())
}

fn flatten_one_level(items: Vec<Value>) -> Result<Vec<Object>, BatchError> {
    let mut flat = Vec::new();
    for (i, item) in items.into_iter().enumerate() {
        match item {
            Value::Object(map) => flat.push(map),
            Value::Array(inner) => {
                for (j, value) in inner.into_iter().enumerate() {
                    match value {
                        Value::Object(map) => flat.push(map),
                        other => {
                            return Err(BatchError::UnexpectedShape {
                                detail: format!("element [{i}][{j}] is {}, not an object", kind(&other)),
                            })
                        }
                    }
                }
            }
            other => {
                return Err(BatchError::UnexpectedShape {
                    detail: format!("element [{i}] is {}, not an object or list", kind(&other)),
                })
            }
        }
    }
    Ok(flat)
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}

// ── Fence stripping ──────────────────────────────────────────────────────

static RE_WRAPPING_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```[A-Za-z0-9_-]*[ \t]*\r?\n?(.*?)\s*```$").unwrap());

static RE_EMBEDDED_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:json|JSON)?[ \t]*\r?\n(.*?)\s*```").unwrap());

/// Remove a code fence around (or inside) the response.
///
/// A fence wrapping the whole response wins; otherwise the first fenced
/// block inside surrounding prose is used; otherwise the trimmed text.
pub fn strip_code_fence(raw: &str) -> &str {
    let text = raw.trim();
    if let Some(caps) = RE_WRAPPING_FENCE.captures(text) {
        if let Some(body) = caps.get(1) {
            return body.as_str().trim();
        }
    }
    if let Some(caps) = RE_EMBEDDED_FENCE.captures(text) {
        if let Some(body) = caps.get(1) {
            return body.as_str().trim();
        }
    }
    text
}

// ── Field decoding ───────────────────────────────────────────────────────

const NAME_KEYS: &[&str] = &["name", "vessel", "navire"];
const FLAG_KEYS: &[&str] = &["flag", "pavillon"];
const PRODUCT_KEYS: &[&str] = &["produits", "products", "produit", "product"];
const VOLUME_KEYS: &[&str] = &["volume"];
const WEIGHT_KEYS: &[&str] = &["poids", "weight"];
const DATE_KEYS: &[&str] = &["date"];
const ID_KEYS: &[&str] = &["id"];
const PAGE_KEYS: &[&str] = &["page"];

/// Decode one response object. Unknown keys are ignored; values of the
/// wrong type become absent.
pub fn candidate_from_object(map: &Object) -> CandidateEntry {
    let get = |keys: &[&str]| -> Option<&Value> {
        keys.iter().find_map(|key| {
            map.iter()
                .find(|(k, v)| k.trim().eq_ignore_ascii_case(key) && !v.is_null())
                .map(|(_, v)| v)
        })
    };

    CandidateEntry {
        name: get(NAME_KEYS).and_then(as_text),
        flag: get(FLAG_KEYS).and_then(as_text),
        products: get(PRODUCT_KEYS).and_then(as_text),
        volume: get(VOLUME_KEYS).and_then(as_number),
        weight: get(WEIGHT_KEYS).and_then(as_number),
        date: get(DATE_KEYS).and_then(as_text),
        id: get(ID_KEYS).and_then(as_identity),
        page: get(PAGE_KEYS).and_then(as_page),
    }
}

fn as_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => items
            .iter()
            .filter_map(as_text)
            .collect::<Vec<_>>()
            .join(", "),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

static RE_LEADING_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(-?\d[\d \u{a0}\u{202f}.,']*)").unwrap());

/// Accept JSON numbers and numeric strings such as `"9 000 000 kg"`,
/// `"1,250.5"` or `"12,5"`.
fn as_number(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => parse_numeric_text(s)?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}

fn parse_numeric_text(s: &str) -> Option<f64> {
    let caps = RE_LEADING_NUMBER.captures(s)?;
    let digits: String = caps[1]
        .chars()
        .filter(|c| !matches!(c, ' ' | '\u{a0}' | '\u{202f}' | '\''))
        .collect();
    let digits = digits.trim_end_matches(['.', ',']);

    let normalised = match (digits.contains('.'), digits.matches(',').count()) {
        // "1,250.5": commas are thousands separators.
        (true, _) => digits.replace(',', ""),
        // "12,5": a single comma with at most two decimals is a decimal point.
        (false, 1) if digits.rsplit(',').next().is_some_and(|d| d.len() <= 2) => {
            digits.replace(',', ".")
        }
        (false, _) => digits.replace(',', ""),
    };
    normalised.parse().ok()
}

fn as_identity(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_page(value: &Value) -> Option<usize> {
    as_identity(value)
        .filter(|&p| p >= 1)
        .and_then(|p| usize::try_from(p).ok())
}
