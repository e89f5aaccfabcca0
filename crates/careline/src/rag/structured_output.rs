//! Layered JSON recovery for model output.
//!
//! Model replies are asked to be a single JSON object but arrive fenced,
//! truncated or wrapped in prose often enough that a plain `from_str` is not
//! sufficient. [`parse_layered`] tries, in order: a direct parse, extraction
//! of the first balanced `{...}`, structural repair of a truncated object,
//! and finally a caller-supplied keyword back-fill over the raw text. It
//! never panics and never errors; `None` means nothing usable was found.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseConfidence {
    Direct,
    Extracted,
    Repaired,
    KeywordBackfill,
    Fallback,
}

#[derive(Debug, Clone)]
pub struct ParsedJson {
    pub object: Map<String, Value>,
    pub confidence: ParseConfidence,
}

/// Parse `raw` into a JSON object. `defaults` fills keys missing after a
/// repair or back-fill; direct and extracted objects are returned as-is.
pub fn parse_layered<F>(raw: &str, defaults: &Map<String, Value>, backfill: F) -> Option<ParsedJson>
where
    F: Fn(&str) -> Option<Map<String, Value>>,
{
    let trimmed = raw.trim();

    if let Ok(Value::Object(object)) = serde_json::from_str::<Value>(trimmed) {
        return Some(ParsedJson {
            object,
            confidence: ParseConfidence::Direct,
        });
    }

    if let Some(start) = trimmed.find('{') {
        let tail = &trimmed[start..];
        if let Some(candidate) = extract_json_object(tail) {
            if let Ok(Value::Object(object)) = serde_json::from_str::<Value>(&candidate) {
                return Some(ParsedJson {
                    object,
                    confidence: ParseConfidence::Extracted,
                });
            }
        }

        if let Some(mut object) = repair_object(tail) {
            fill_defaults(&mut object, defaults);
            return Some(ParsedJson {
                object,
                confidence: ParseConfidence::Repaired,
            });
        }
    }

    backfill(trimmed).map(|mut object| {
        fill_defaults(&mut object, defaults);
        ParsedJson {
            object,
            confidence: ParseConfidence::KeywordBackfill,
        }
    })
}

/// Parse a JSON array, either bare or under `key` in an object.
pub fn parse_array(raw: &str, key: &str) -> Option<Vec<Value>> {
    let trimmed = strip_fences(raw.trim());
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Array(items)) => return Some(items),
        Ok(Value::Object(mut map)) => {
            if let Some(Value::Array(items)) = map.remove(key) {
                return Some(items);
            }
        }
        _ => {}
    }

    let parsed = parse_layered(trimmed, &Map::new(), |_| None);
    if let Some(Value::Array(items)) = parsed.and_then(|mut p| p.object.remove(key)) {
        return Some(items);
    }

    let start = trimmed.find('[')?;
    let end = trimmed.rfind(']')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str::<Value>(&trimmed[start..=end]) {
        Ok(Value::Array(items)) => Some(items),
        _ => None,
    }
}

fn strip_fences(text: &str) -> &str {
    text.trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

fn fill_defaults(object: &mut Map<String, Value>, defaults: &Map<String, Value>) {
    for (key, value) in defaults {
        object.entry(key.clone()).or_insert_with(|| value.clone());
    }
}

/// Extract a complete JSON object starting with "{"
fn extract_json_object(text: &str) -> Option<String> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, ch) in text.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(text[..i + ch.len_utf8()].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Close a truncated object. Drops the last incomplete member when simply
/// closing brackets is not enough.
fn repair_object(text: &str) -> Option<Map<String, Value>> {
    let mut candidate = text.trim_end().to_string();

    for _ in 0..8 {
        let closed = close_brackets(&candidate);
        if let Ok(Value::Object(object)) = serde_json::from_str::<Value>(&closed) {
            return Some(object);
        }
        let cut = last_top_level_separator(&candidate)?;
        candidate.truncate(cut);
    }
    None
}

/// Append whatever quotes and brackets are still open.
fn close_brackets(text: &str) -> String {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escape_next = false;

    for ch in text.chars() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => stack.push('}'),
            '[' if !in_string => stack.push(']'),
            '}' | ']' if !in_string => {
                stack.pop();
            }
            _ => {}
        }
    }

    let mut out = text.trim_end().to_string();
    if in_string {
        out.push('"');
    }
    while out.ends_with(',') || out.ends_with(':') {
        out.pop();
    }
    while let Some(closer) = stack.pop() {
        out.push(closer);
    }
    out
}

/// Byte offset of the last `,` outside strings, or `None`.
fn last_top_level_separator(text: &str) -> Option<usize> {
    let mut in_string = false;
    let mut escape_next = false;
    let mut last = None;
    for (i, ch) in text.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            ',' if !in_string => last = Some(i),
            _ => {}
        }
    }
    last
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn defaults() -> Map<String, Value> {
        match json!({"risk_level": "none", "intent": "chat", "need_rag": false}) {
            Value::Object(m) => m,
            _ => unreachable!(),
        }
    }

    fn no_backfill(_: &str) -> Option<Map<String, Value>> {
        None
    }

    #[test]
    fn direct_parse() {
        let parsed = parse_layered(r#" {"intent":"help"} "#, &defaults(), no_backfill).unwrap();
        assert_eq!(parsed.confidence, ParseConfidence::Direct);
        assert_eq!(parsed.object["intent"], "help");
        assert!(!parsed.object.contains_key("risk_level"));
    }

    #[test]
    fn fenced_output_is_extracted() {
        let raw = "好的，結果如下：\n```json\n{\"intent\":\"crisis\",\"note\":\"a}b\"}\n```\n以上";
        let parsed = parse_layered(raw, &defaults(), no_backfill).unwrap();
        assert_eq!(parsed.confidence, ParseConfidence::Extracted);
        assert_eq!(parsed.object["intent"], "crisis");
        assert_eq!(parsed.object["note"], "a}b");
    }

    #[test]
    fn truncated_output_is_repaired_with_defaults() {
        let raw = r#"{"risk_level":"high","search_keywords":["戒毒","治療"],"emotional_state":"絕"#;
        let parsed = parse_layered(raw, &defaults(), no_backfill).unwrap();
        assert_eq!(parsed.confidence, ParseConfidence::Repaired);
        assert_eq!(parsed.object["risk_level"], "high");
        assert_eq!(parsed.object["intent"], "chat");
        assert_eq!(parsed.object["search_keywords"], json!(["戒毒", "治療"]));
    }

    #[test]
    fn dangling_key_is_dropped() {
        let raw = r#"{"risk_level":"low","intent":"help","need_rag":"#;
        let parsed = parse_layered(raw, &defaults(), no_backfill).unwrap();
        assert_eq!(parsed.confidence, ParseConfidence::Repaired);
        assert_eq!(parsed.object["intent"], "help");
        assert_eq!(parsed.object["need_rag"], false);
    }

    #[test]
    fn prose_falls_back_to_backfill() {
        let raw = "This user seems to be in crisis, risk is high.";
        let parsed = parse_layered(raw, &defaults(), |text| {
            text.contains("crisis").then(|| {
                let mut m = Map::new();
                m.insert("intent".into(), json!("crisis"));
                m
            })
        })
        .unwrap();
        assert_eq!(parsed.confidence, ParseConfidence::KeywordBackfill);
        assert_eq!(parsed.object["intent"], "crisis");
        assert_eq!(parsed.object["risk_level"], "none");
    }

    #[test]
    fn garbage_yields_none() {
        assert!(parse_layered("¯\\_(ツ)_/¯", &defaults(), no_backfill).is_none());
    }

    #[test]
    fn arrays_bare_or_wrapped() {
        assert_eq!(parse_array(r#"[{"name":"a"}]"#, "contacts").unwrap().len(), 1);
        assert_eq!(
            parse_array(r#"```json
{"contacts":[{"name":"a"},{"name":"b"}]}
```"#, "contacts")
            .unwrap()
            .len(),
            2
        );
        assert_eq!(parse_array("結果：[1, 2, 3] 完成", "contacts").unwrap().len(), 3);
        assert!(parse_array("nothing here", "contacts").is_none());
    }
}
