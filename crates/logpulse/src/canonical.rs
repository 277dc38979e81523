// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Identifier and value canonicalization for the line protocol.
//!
//! Names (entities, tag keys, metric names) are bare tokens: whitespace runs are
//! collapsed to `_` and quote characters are removed. Values are quoted with
//! CSV-style escaping whenever they contain a character that would otherwise
//! split the token.

use std::borrow::Cow;
use std::fmt::Write;

/// Turns an arbitrary string into a bare protocol token.
///
/// # Examples
///
/// ```
/// use logpulse::canonical::sanitize_name;
///
/// assert_eq!(sanitize_name("my  host"), "my_host");
/// assert_eq!(sanitize_name("\"quoted\""), "quoted");
/// ```
pub fn sanitize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_space = false;
    for ch in name.trim().chars() {
        if ch.is_whitespace() {
            pending_space = true;
            continue;
        }
        if ch == '"' {
            continue;
        }
        if pending_space {
            out.push('_');
            pending_space = false;
        }
        out.push(ch);
    }
    out
}

fn needs_quotes(value: &str) -> bool {
    value.is_empty()
        || value
            .chars()
            .any(|ch| ch == ' ' || ch == '=' || ch == '\t' || ch == '"')
}

/// Quotes a value when it contains space, `=`, tab or a quote character.
/// Embedded quotes are doubled.
pub fn escape_value(value: &str) -> Cow<'_, str> {
    if !needs_quotes(value) {
        return Cow::Borrowed(value);
    }
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for ch in value.chars() {
        if ch == '"' {
            out.push('"');
        }
        out.push(ch);
    }
    out.push('"');
    Cow::Owned(out)
}

/// Folds multi-line text onto one line using a literal `\n`.
pub fn fold_newlines(text: &str) -> Cow<'_, str> {
    if !text.contains(|ch| ch == '\n' || ch == '\r') {
        return Cow::Borrowed(text);
    }
    Cow::Owned(
        text.replace("\r\n", "\\n")
            .replace('\n', "\\n")
            .replace('\r', "\\n"),
    )
}

/// Merges tag pairs whose keys only differ in case. Empty values are dropped,
/// a later value overrides an earlier one, and the first spelling and position
/// of the key are kept.
pub fn merge_tags<I, K, V>(tags: I) -> Vec<(String, String)>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut merged: Vec<(String, String)> = Vec::new();
    for (key, value) in tags {
        let key = sanitize_name(key.as_ref());
        let value = value.as_ref().trim();
        if key.is_empty() || value.is_empty() {
            continue;
        }
        match merged
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(&key))
        {
            Some((_, existing_value)) => *existing_value = value.to_string(),
            None => merged.push((key, value.to_string())),
        }
    }
    merged
}

/// Appends ` t:<key>=<value>` to `out`. Line breaks in the value are folded.
pub fn write_tag(out: &mut String, key: &str, value: &str) {
    // Writing into a String never fails.
    let _ = write!(
        out,
        " t:{}={}",
        sanitize_name(key),
        escape_value(&fold_newlines(value))
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_name_collapses_whitespace() {
        assert_eq!(sanitize_name("a b"), "a_b");
        assert_eq!(sanitize_name("a \t\n b"), "a_b");
        assert_eq!(sanitize_name("  padded  "), "padded");
        assert_eq!(sanitize_name("plain"), "plain");
    }

    #[test]
    fn test_sanitize_name_strips_quotes() {
        assert_eq!(sanitize_name("\"host\""), "host");
        assert_eq!(sanitize_name("we\"ird na\"me"), "weird_name");
    }

    #[test]
    fn test_escape_value_bare() {
        assert!(matches!(escape_value("eu"), Cow::Borrowed("eu")));
        assert_eq!(escape_value("a.b-c"), "a.b-c");
    }

    #[test]
    fn test_escape_value_quotes_separators() {
        assert_eq!(escape_value("two words"), "\"two words\"");
        assert_eq!(escape_value("k=v"), "\"k=v\"");
        assert_eq!(escape_value("tab\there"), "\"tab\there\"");
        assert_eq!(escape_value(""), "\"\"");
    }

    #[test]
    fn test_escape_value_doubles_quotes() {
        assert_eq!(escape_value("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(escape_value("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn test_fold_newlines() {
        assert_eq!(fold_newlines("one"), "one");
        assert_eq!(fold_newlines("one\ntwo"), "one\\ntwo");
        assert_eq!(fold_newlines("one\r\ntwo\rthree"), "one\\ntwo\\nthree");
    }

    #[test]
    fn test_merge_tags_case_insensitive() {
        let merged = merge_tags(vec![
            ("Region", "us"),
            ("env", "prod"),
            ("region", "eu"),
            ("empty", " "),
        ]);
        assert_eq!(
            merged,
            vec![
                ("Region".to_string(), "eu".to_string()),
                ("env".to_string(), "prod".to_string()),
            ]
        );
    }

    #[test]
    fn test_merge_tags_empty_override_is_ignored() {
        let merged = merge_tags(vec![("env", "prod"), ("ENV", "")]);
        assert_eq!(merged, vec![("env".to_string(), "prod".to_string())]);
    }

    #[test]
    fn test_write_tag() {
        let mut out = String::from("series");
        write_tag(&mut out, "my tag", "some value");
        assert_eq!(out, "series t:my_tag=\"some value\"");
    }

    #[test]
    fn test_write_tag_folds_line_breaks() {
        let mut out = String::from("series");
        write_tag(&mut out, "region", "eu\nseries e:forged");
        assert_eq!(out, "series t:region=\"eu\\nseries e:forged\"");
        assert!(!out.contains('\n'));
    }
}
