//! Structural JSON diff for state broadcasts.
//!
//! A patch is a list of operations addressed by JSON pointer. Objects diff
//! key by key, arrays index by index (extra elements are added or removed
//! at the tail), and strings of [`TEXT_DIFF_MIN_CHARS`] or more are sent as
//! character edits so token-by-token growth of a long message stays small.
//!
//! `apply_patch(prev, diff(prev, next))` yields `next`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use similar::{DiffTag, TextDiff};
use thiserror::Error;

/// Strings shorter than this are replaced whole.
pub const TEXT_DIFF_MIN_CHARS: usize = 60;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    Add { path: String, value: Value },
    Remove { path: String },
    Replace { path: String, value: Value },
    Text { path: String, edits: Vec<TextEdit> },
}

/// One edit of a text patch. Offsets count chars in the string as edited
/// so far.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextEdit {
    pub at: usize,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub delete: usize,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub insert: String,
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

pub type Patch = Vec<PatchOp>;

#[derive(Debug, Error, PartialEq)]
pub enum PatchError {
    #[error("patch path {0} does not exist")]
    MissingPath(String),

    #[error("patch path {0} is not a valid pointer")]
    InvalidPath(String),

    #[error("text patch at {0} does not target a string")]
    NotText(String),

    #[error("text edit at {path} is out of bounds")]
    EditOutOfBounds { path: String },
}

/// Operations that turn `prev` into `next`. Empty if they are equal.
pub fn diff(prev: &Value, next: &Value) -> Patch {
    let mut ops = Vec::new();
    diff_at(&mut String::new(), prev, next, &mut ops);
    ops
}

fn diff_at(path: &mut String, prev: &Value, next: &Value, ops: &mut Patch) {
    if prev == next {
        return;
    }

    match (prev, next) {
        (Value::Object(before), Value::Object(after)) => {
            for key in before.keys() {
                if !after.contains_key(key) {
                    ops.push(PatchOp::Remove {
                        path: child_path(path, key),
                    });
                }
            }
            for (key, value) in after {
                match before.get(key) {
                    Some(old) => {
                        let len = path.len();
                        push_token(path, key);
                        diff_at(path, old, value, ops);
                        path.truncate(len);
                    }
                    None => ops.push(PatchOp::Add {
                        path: child_path(path, key),
                        value: value.clone(),
                    }),
                }
            }
        }
        (Value::Array(before), Value::Array(after)) => {
            let common = before.len().min(after.len());
            for i in 0..common {
                let len = path.len();
                push_token(path, &i.to_string());
                diff_at(path, &before[i], &after[i], ops);
                path.truncate(len);
            }
            for i in (common..before.len()).rev() {
                ops.push(PatchOp::Remove {
                    path: child_path(path, &i.to_string()),
                });
            }
            for (i, value) in after.iter().enumerate().skip(common) {
                ops.push(PatchOp::Add {
                    path: child_path(path, &i.to_string()),
                    value: value.clone(),
                });
            }
        }
        (Value::String(before), Value::String(after))
            if before.chars().count() >= TEXT_DIFF_MIN_CHARS
                || after.chars().count() >= TEXT_DIFF_MIN_CHARS =>
        {
            ops.push(PatchOp::Text {
                path: path.clone(),
                edits: text_edits(before, after),
            });
        }
        _ => ops.push(PatchOp::Replace {
            path: path.clone(),
            value: next.clone(),
        }),
    }
}

fn text_edits(before: &str, after: &str) -> Vec<TextEdit> {
    let after_chars: Vec<char> = after.chars().collect();
    let text_diff = TextDiff::from_chars(before, after);

    text_diff
        .ops()
        .iter()
        .filter_map(|op| {
            let (tag, old, new) = op.as_tag_tuple();
            let insert = || after_chars[new.clone()].iter().collect::<String>();
            match tag {
                DiffTag::Equal => None,
                DiffTag::Delete => Some(TextEdit {
                    at: new.start,
                    delete: old.len(),
                    insert: String::new(),
                }),
                DiffTag::Insert => Some(TextEdit {
                    at: new.start,
                    delete: 0,
                    insert: insert(),
                }),
                DiffTag::Replace => Some(TextEdit {
                    at: new.start,
                    delete: old.len(),
                    insert: insert(),
                }),
            }
        })
        .collect()
}

fn escape(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

fn unescape(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

fn push_token(path: &mut String, token: &str) {
    path.push('/');
    path.push_str(&escape(token));
}

fn child_path(path: &str, token: &str) -> String {
    format!("{}/{}", path, escape(token))
}

fn split_pointer(path: &str) -> Result<Vec<String>, PatchError> {
    if path.is_empty() {
        return Ok(Vec::new());
    }
    let Some(rest) = path.strip_prefix('/') else {
        return Err(PatchError::InvalidPath(path.to_string()));
    };
    Ok(rest.split('/').map(unescape).collect())
}

fn parse_index(token: &str, path: &str) -> Result<usize, PatchError> {
    token
        .parse()
        .map_err(|_| PatchError::InvalidPath(path.to_string()))
}

/// Resolve the parent container of `path` and the final token.
fn parent_mut<'a>(target: &'a mut Value, path: &str) -> Result<(&'a mut Value, String), PatchError> {
    let mut tokens = split_pointer(path)?;
    let Some(last) = tokens.pop() else {
        return Err(PatchError::InvalidPath(path.to_string()));
    };
    let mut current = target;
    for token in &tokens {
        current = match current {
            Value::Object(map) => map.get_mut(token),
            Value::Array(items) => items.get_mut(parse_index(token, path)?),
            _ => None,
        }
        .ok_or_else(|| PatchError::MissingPath(path.to_string()))?;
    }
    Ok((current, last))
}

fn pointer_mut<'a>(target: &'a mut Value, path: &str) -> Result<&'a mut Value, PatchError> {
    if path.is_empty() {
        return Ok(target);
    }
    let (parent, last) = parent_mut(target, path)?;
    match parent {
        Value::Object(map) => map.get_mut(&last),
        Value::Array(items) => items.get_mut(parse_index(&last, path)?),
        _ => None,
    }
    .ok_or_else(|| PatchError::MissingPath(path.to_string()))
}

/// Apply `patch` to `target` in order.
pub fn apply_patch(target: &mut Value, patch: &[PatchOp]) -> Result<(), PatchError> {
    for op in patch {
        match op {
            PatchOp::Add { path, value } => {
                if path.is_empty() {
                    *target = value.clone();
                    continue;
                }
                let (parent, last) = parent_mut(target, path)?;
                match parent {
                    Value::Object(map) => {
                        map.insert(last, value.clone());
                    }
                    Value::Array(items) => {
                        let index = parse_index(&last, path)?;
                        if index > items.len() {
                            return Err(PatchError::MissingPath(path.clone()));
                        }
                        items.insert(index, value.clone());
                    }
                    _ => return Err(PatchError::MissingPath(path.clone())),
                }
            }
            PatchOp::Remove { path } => {
                let (parent, last) = parent_mut(target, path)?;
                let removed = match parent {
                    Value::Object(map) => map.remove(&last).is_some(),
                    Value::Array(items) => {
                        let index = parse_index(&last, path)?;
                        if index < items.len() {
                            items.remove(index);
                            true
                        } else {
                            false
                        }
                    }
                    _ => false,
                };
                if !removed {
                    return Err(PatchError::MissingPath(path.clone()));
                }
            }
            PatchOp::Replace { path, value } => {
                *pointer_mut(target, path)? = value.clone();
            }
            PatchOp::Text { path, edits } => {
                let Value::String(text) = pointer_mut(target, path)? else {
                    return Err(PatchError::NotText(path.clone()));
                };
                let mut chars: Vec<char> = text.chars().collect();
                for edit in edits {
                    let end = edit.at + edit.delete;
                    if end > chars.len() {
                        return Err(PatchError::EditOutOfBounds { path: path.clone() });
                    }
                    chars.splice(edit.at..end, edit.insert.chars());
                }
                *text = chars.into_iter().collect();
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn round_trip(prev: &Value, next: &Value) -> Value {
        let patch = diff(prev, next);
        let mut patched = prev.clone();
        apply_patch(&mut patched, &patch).unwrap();
        patched
    }

    #[test]
    fn test_equal_values_produce_empty_patch() {
        let value = json!({"a": [1, 2, {"b": null}]});
        assert!(diff(&value, &value).is_empty());
    }

    #[test]
    fn test_object_key_changes() {
        let prev = json!({"keep": 1, "drop": 2, "change": "x"});
        let next = json!({"keep": 1, "change": "y", "new": true});
        let patch = diff(&prev, &next);

        assert_eq!(
            patch,
            vec![
                PatchOp::Remove { path: "/drop".into() },
                PatchOp::Replace { path: "/change".into(), value: json!("y") },
                PatchOp::Add { path: "/new".into(), value: json!(true) },
            ]
        );
        assert_eq!(round_trip(&prev, &next), next);
    }

    #[test]
    fn test_array_growth_and_shrink() {
        let prev = json!([1, 2, 3, 4]);
        let next = json!([1, 5]);
        assert_eq!(round_trip(&prev, &next), next);
        assert_eq!(round_trip(&next, &prev), prev);
    }

    #[test]
    fn test_long_text_uses_edits() {
        let prev = json!({"assistantMessage": "a".repeat(80)});
        let next = json!({"assistantMessage": format!("{} and more", "a".repeat(80))});
        let patch = diff(&prev, &next);

        assert_eq!(
            patch,
            vec![PatchOp::Text {
                path: "/assistantMessage".into(),
                edits: vec![TextEdit { at: 80, delete: 0, insert: " and more".into() }],
            }]
        );
        assert_eq!(round_trip(&prev, &next), next);
    }

    #[test]
    fn test_short_text_is_replaced() {
        let prev = json!("hello");
        let next = json!("hello world");
        assert_eq!(
            diff(&prev, &next),
            vec![PatchOp::Replace { path: "".into(), value: next.clone() }]
        );
    }

    #[test]
    fn test_text_edits_count_chars_not_bytes() {
        let prev = Value::String(format!("{}ü", "é".repeat(70)));
        let next = Value::String(format!("{}🙂ü!", "é".repeat(70)));
        assert_eq!(round_trip(&prev, &next), next);
    }

    #[test]
    fn test_keys_with_slashes_are_escaped() {
        let prev = json!({"a/b": 1, "c~d": 1});
        let next = json!({"a/b": 2, "c~d": 3});
        let patch = diff(&prev, &next);
        assert!(matches!(&patch[0], PatchOp::Replace { path, .. } if path == "/a~1b"));
        assert_eq!(round_trip(&prev, &next), next);
    }

    #[test]
    fn test_serialized_shape() {
        let op = PatchOp::Text {
            path: "/x".into(),
            edits: vec![TextEdit { at: 3, delete: 0, insert: "hi".into() }],
        };
        assert_eq!(
            serde_json::to_value(&op).unwrap(),
            json!({"op": "text", "path": "/x", "edits": [{"at": 3, "insert": "hi"}]})
        );
    }

    #[test]
    fn test_apply_to_missing_path_fails() {
        let mut value = json!({});
        let result = apply_patch(&mut value, &[PatchOp::Remove { path: "/nope".into() }]);
        assert_eq!(result, Err(PatchError::MissingPath("/nope".into())));
    }

    fn arb_json() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|n| json!(n)),
            "[a-c ]{0,8}".prop_map(Value::String),
            "[a-c ]{55,90}".prop_map(Value::String),
        ];
        leaf.prop_recursive(4, 32, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
                prop::collection::btree_map("[a-d/~]{1,3}", inner, 0..6)
                    .prop_map(|map| Value::Object(map.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn test_patch_round_trip(prev in arb_json(), next in arb_json()) {
            prop_assert_eq!(round_trip(&prev, &next), next);
        }
    }
}
