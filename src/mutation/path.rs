//! A small JSONPath subset for structural mutation rules.
//!
//! Supported: `$.a.b`, `$['a']`, `$.items[0]`, `$.items[*]` and `$.*`. Filters,
//! slices and recursive descent are not.

use std::fmt;

use serde_json::{Map, Value};

use crate::error::{Result, RouterError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
    Wildcard,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonPath {
    raw: String,
    segments: Vec<Segment>,
}

impl JsonPath {
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = |why: &str| RouterError::config(format!("Invalid path '{raw}': {why}"));

        let rest = raw
            .trim()
            .strip_prefix('$')
            .ok_or_else(|| invalid("must start with '$'"))?;
        let chars: Vec<char> = rest.chars().collect();
        let mut segments = Vec::new();
        let mut i = 0;

        while i < chars.len() {
            match chars[i] {
                '.' => {
                    i += 1;
                    let start = i;
                    while i < chars.len() && chars[i] != '.' && chars[i] != '[' {
                        i += 1;
                    }
                    let key: String = chars[start..i].iter().collect();
                    match key.as_str() {
                        "" => return Err(invalid("empty key")),
                        "*" => segments.push(Segment::Wildcard),
                        _ => segments.push(Segment::Key(key)),
                    }
                }
                '[' => {
                    let close = chars[i..]
                        .iter()
                        .position(|c| *c == ']')
                        .map(|p| p + i)
                        .ok_or_else(|| invalid("unclosed '['"))?;
                    let inner: String = chars[i + 1..close].iter().collect();
                    let inner = inner.trim();
                    if inner == "*" {
                        segments.push(Segment::Wildcard);
                    } else if let Some(quoted) = inner
                        .strip_prefix('\'')
                        .and_then(|s| s.strip_suffix('\''))
                        .or_else(|| inner.strip_prefix('"').and_then(|s| s.strip_suffix('"')))
                    {
                        segments.push(Segment::Key(quoted.to_string()));
                    } else {
                        let index = inner
                            .parse::<usize>()
                            .map_err(|_| invalid("bracket must hold an index, '*' or a quoted key"))?;
                        segments.push(Segment::Index(index));
                    }
                    i = close + 1;
                }
                _ => return Err(invalid("expected '.' or '['")),
            }
        }

        if segments.is_empty() {
            return Err(invalid("must address something below the root"));
        }

        Ok(Self {
            raw: raw.trim().to_string(),
            segments,
        })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Remove every addressed element. Returns how many were removed.
    pub fn delete(&self, doc: &mut Value) -> usize {
        delete_at(doc, &self.segments)
    }

    /// Write `value` at every addressed location, creating missing objects on the way.
    /// Returns how many locations were written.
    pub fn insert(&self, doc: &mut Value, value: &Value) -> usize {
        insert_at(doc, &self.segments, value)
    }
}

impl fmt::Display for JsonPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn delete_at(node: &mut Value, segments: &[Segment]) -> usize {
    let Some((head, rest)) = segments.split_first() else {
        return 0;
    };

    if rest.is_empty() {
        return match (head, node) {
            (Segment::Key(key), Value::Object(map)) => usize::from(map.remove(key).is_some()),
            (Segment::Index(index), Value::Array(items)) if *index < items.len() => {
                items.remove(*index);
                1
            }
            (Segment::Wildcard, Value::Object(map)) => {
                let n = map.len();
                map.clear();
                n
            }
            (Segment::Wildcard, Value::Array(items)) => {
                let n = items.len();
                items.clear();
                n
            }
            _ => 0,
        };
    }

    match (head, node) {
        (Segment::Key(key), Value::Object(map)) => {
            map.get_mut(key).map_or(0, |child| delete_at(child, rest))
        }
        (Segment::Index(index), Value::Array(items)) => items
            .get_mut(*index)
            .map_or(0, |child| delete_at(child, rest)),
        (Segment::Wildcard, Value::Object(map)) => {
            map.values_mut().map(|child| delete_at(child, rest)).sum()
        }
        (Segment::Wildcard, Value::Array(items)) => {
            items.iter_mut().map(|child| delete_at(child, rest)).sum()
        }
        _ => 0,
    }
}

fn insert_at(node: &mut Value, segments: &[Segment], value: &Value) -> usize {
    let Some((head, rest)) = segments.split_first() else {
        return 0;
    };

    if node.is_null() && matches!(head, Segment::Key(_)) {
        *node = Value::Object(Map::new());
    }

    if rest.is_empty() {
        return match (head, node) {
            (Segment::Key(key), Value::Object(map)) => {
                map.insert(key.clone(), value.clone());
                1
            }
            (Segment::Index(index), Value::Array(items)) if *index < items.len() => {
                items[*index] = value.clone();
                1
            }
            (Segment::Index(index), Value::Array(items)) if *index == items.len() => {
                items.push(value.clone());
                1
            }
            (Segment::Wildcard, Value::Object(map)) => {
                map.values_mut().for_each(|v| *v = value.clone());
                map.len()
            }
            (Segment::Wildcard, Value::Array(items)) => {
                items.iter_mut().for_each(|v| *v = value.clone());
                items.len()
            }
            _ => 0,
        };
    }

    match (head, node) {
        (Segment::Key(key), Value::Object(map)) => {
            let child = map.entry(key.clone()).or_insert(Value::Null);
            insert_at(child, rest, value)
        }
        (Segment::Index(index), Value::Array(items)) => items
            .get_mut(*index)
            .map_or(0, |child| insert_at(child, rest, value)),
        (Segment::Wildcard, Value::Object(map)) => map
            .values_mut()
            .map(|child| insert_at(child, rest, value))
            .sum(),
        (Segment::Wildcard, Value::Array(items)) => items
            .iter_mut()
            .map(|child| insert_at(child, rest, value))
            .sum(),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_forms() {
        let path = JsonPath::parse("$.messages[0]['content'][*].text").unwrap();
        assert_eq!(
            path.segments(),
            &[
                Segment::Key("messages".to_string()),
                Segment::Index(0),
                Segment::Key("content".to_string()),
                Segment::Wildcard,
                Segment::Key("text".to_string()),
            ]
        );
        assert_eq!(path.to_string(), "$.messages[0]['content'][*].text");
    }

    #[test]
    fn test_parse_rejects_bad_paths() {
        for bad in ["metadata", "$", "$.", "$.a[", "$.a[x]", "$..a"] {
            assert!(
                matches!(JsonPath::parse(bad), Err(RouterError::Configuration { .. })),
                "{bad}"
            );
        }
    }

    #[test]
    fn test_delete_missing_is_noop() {
        let mut doc = json!({"a": 1});
        let path = JsonPath::parse("$.metadata.user").unwrap();
        assert_eq!(path.delete(&mut doc), 0);
        assert_eq!(doc, json!({"a": 1}));
    }

    #[test]
    fn test_delete_wildcard() {
        let mut doc = json!({"items": [{"x": 1, "y": 2}, {"x": 3}]});
        let path = JsonPath::parse("$.items[*].x").unwrap();
        assert_eq!(path.delete(&mut doc), 2);
        assert_eq!(doc, json!({"items": [{"y": 2}, {}]}));
    }

    #[test]
    fn test_insert_creates_intermediate_objects() {
        let mut doc = json!({"model": "m"});
        let path = JsonPath::parse("$.metadata.tags.source").unwrap();
        assert_eq!(path.insert(&mut doc, &json!("router")), 1);
        assert_eq!(doc["metadata"]["tags"]["source"], "router");
    }

    #[test]
    fn test_insert_does_not_clobber_scalars() {
        let mut doc = json!({"model": "m"});
        let path = JsonPath::parse("$.model.name").unwrap();
        assert_eq!(path.insert(&mut doc, &json!("x")), 0);
        assert_eq!(doc, json!({"model": "m"}));
    }
}
