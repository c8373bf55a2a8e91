//! Lenient decoding of the near-JSON blobs vendors embed in spec pages.
//!
//! Input is first handed to a JSON5 parser, which already accepts single
//! quotes, trailing commas and unquoted keys. If that fails the input is
//! treated as truncated: open strings and containers are closed, and when the
//! result still does not parse the tail is cut back to the previous separator
//! until something parses or nothing is left.

use serde::de::DeserializeOwned;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RepairError {
    #[error("empty input")]
    Empty,
    #[error("unrecoverable markup: {0}")]
    Unrecoverable(String),
}

/// Repairs `raw` and deserializes it into `T`.
pub fn repair_and_parse<T: DeserializeOwned>(raw: &str) -> Result<T, RepairError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(RepairError::Empty);
    }

    let first_error = match json5::from_str::<T>(raw) {
        Ok(value) => return Ok(value),
        Err(e) => e,
    };

    let mut candidate = raw;
    loop {
        if let Ok(value) = json5::from_str::<T>(&close_open_scopes(candidate)) {
            return Ok(value);
        }
        match last_cut_point(candidate) {
            Some(cut) => candidate = candidate[..cut].trim_end(),
            None => return Err(RepairError::Unrecoverable(first_error.to_string())),
        }
    }
}

/// Appends whatever is needed to terminate an unfinished string and every
/// unclosed object or array.
fn close_open_scopes(input: &str) -> String {
    let mut closers = Vec::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for c in input.chars() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => quote = Some(c),
            '{' => closers.push('}'),
            '[' => closers.push(']'),
            '}' | ']' => {
                if closers.last() == Some(&c) {
                    closers.pop();
                }
            }
            _ => {}
        }
    }

    let mut repaired = input.to_string();
    if let Some(q) = quote {
        if escaped {
            repaired.pop();
        }
        repaired.push(q);
    } else if repaired.trim_end().ends_with(':') {
        repaired.push_str("null");
    }
    while let Some(closer) = closers.pop() {
        repaired.push(closer);
    }
    repaired
}

/// Byte offset to truncate at so the last (incomplete) member is dropped: just
/// before the last separator, or just after the last opening bracket.
fn last_cut_point(input: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut cut = None;

    for (i, c) in input.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => quote = Some(c),
            ',' => cut = Some(i),
            '{' | '[' => cut = Some(i + 1),
            _ => {}
        }
    }

    cut.filter(|&cut| cut < input.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde::Deserialize;
    use serde_json::{Value, json};

    #[rstest]
    #[case::strict_json(r#"{"a": "1", "b": "x"}"#, json!({"a": "1", "b": "x"}))]
    #[case::single_quotes(r#"{'a': 'x'}"#, json!({"a": "x"}))]
    #[case::trailing_commas(r#"{"a": ["1", "2",], "b": "3",}"#, json!({"a": ["1", "2"], "b": "3"}))]
    #[case::unquoted_keys(r#"{a: 'x', b: {c: 'd'}}"#, json!({"a": "x", "b": {"c": "d"}}))]
    #[case::booleans_and_null(r#"{'a': true, 'b': null,}"#, json!({"a": true, "b": null}))]
    #[case::truncated_object(r#"{"a": "1", "b": {"c": "2""#, json!({"a": "1", "b": {"c": "2"}}))]
    #[case::truncated_in_string(r#"{'a': 'hel"#, json!({"a": "hel"}))]
    #[case::truncated_after_colon(r#"{"a": "1", "b":"#, json!({"a": "1", "b": null}))]
    #[case::truncated_in_key(r#"{"a": "1", "bcd"#, json!({"a": "1"}))]
    #[case::truncated_in_literal(r#"{"a": "1", "b": tr"#, json!({"a": "1"}))]
    #[case::truncated_array(r#"['x', 'y', ['z'"#, json!(["x", "y", ["z"]]))]
    #[case::escaped_quote_inside(r#"{'a': 'it\'s', 'b': "#, json!({"a": "it's", "b": null}))]
    #[case::brackets_inside_strings(r#"{"a": "{[", "b": "2""#, json!({"a": "{[", "b": "2"}))]
    #[case::surrounding_whitespace("  \n {\"a\": \"1\"}\n  ", json!({"a": "1"}))]
    fn test_repairs(#[case] raw: &str, #[case] expected: Value) {
        let value: Value = repair_and_parse(raw).unwrap();
        assert_eq!(value, expected);
    }

    #[rstest]
    #[case::empty("")]
    #[case::blank("   ")]
    #[case::plain_text("not json at all")]
    #[case::stray_closer("}")]
    fn test_unrecoverable(#[case] raw: &str) {
        assert!(repair_and_parse::<Value>(raw).is_err());
    }

    #[test]
    fn test_empty_is_reported_as_empty() {
        assert!(matches!(repair_and_parse::<Value>(" "), Err(RepairError::Empty)));
    }

    #[derive(Debug, Deserialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    struct Specs {
        #[serde(default)]
        default_tdp: Option<String>,
        #[serde(default)]
        num_of_cpu_cores: Option<String>,
    }

    #[test]
    fn test_typed_target_with_missing_tail() {
        let raw = "{'defaultTdp': '170W', 'numOfCpuCores': '16', 'extra': {'nested': [1,";
        let specs: Specs = repair_and_parse(raw).unwrap();
        assert_eq!(specs.default_tdp.as_deref(), Some("170W"));
        assert_eq!(specs.num_of_cpu_cores.as_deref(), Some("16"));
    }

    #[test]
    fn test_cut_point_skips_separators_in_strings() {
        assert_eq!(last_cut_point(r#"{"a": "x,y""#), Some(1));
        assert_eq!(last_cut_point(r#"{"a": "1", "b"#), Some(9));
        assert_eq!(last_cut_point("{"), None);
    }

    #[test]
    fn test_close_open_scopes() {
        assert_eq!(close_open_scopes(r#"{"a": ["b"#), r#"{"a": ["b"]}"#);
        assert_eq!(close_open_scopes("{'a':"), "{'a':null}");
    }
}
