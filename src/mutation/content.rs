//! Ordered content rules over canonical requests and responses.
//!
//! Pattern rules rewrite free-text fields only (message text, tool results), never
//! structural fields. Path rules operate on the JSON form of the canonical document
//! and the result must still be a valid document of the same type.

use std::borrow::Cow;

use regex::{Regex, RegexBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::path::JsonPath;
use crate::config::{MutationConfig, MutationKindConfig, MutationTarget};
use crate::error::{Result, RouterError};
use crate::translate::canonical::{CanonicalChunk, CanonicalRequest, CanonicalResponse, TextFields};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Request,
    Response,
}

impl MutationTarget {
    pub fn covers(self, stage: Stage) -> bool {
        matches!(
            (self, stage),
            (MutationTarget::Both, _)
                | (MutationTarget::Request, Stage::Request)
                | (MutationTarget::Response, Stage::Response)
        )
    }
}

#[derive(Debug, Clone)]
enum ContentOp {
    Replace { regex: Regex, replacement: String },
    Delete(JsonPath),
    Insert { path: JsonPath, value: Value },
}

#[derive(Debug, Clone)]
struct ContentRule {
    name: String,
    target: MutationTarget,
    op: ContentOp,
}

/// Compiled, enabled rules in declared order.
#[derive(Debug, Clone, Default)]
pub struct ContentPipeline {
    rules: Vec<ContentRule>,
}

impl ContentPipeline {
    /// Disabled rules are dropped here and never looked at again, so an invalid
    /// pattern in a disabled rule does not fail the load.
    pub fn compile(configs: &[MutationConfig]) -> Result<Self> {
        let mut rules = Vec::new();
        for config in configs.iter().filter(|c| c.enabled) {
            let op = match &config.kind {
                MutationKindConfig::RegexReplace {
                    pattern,
                    replacement,
                    case_insensitive,
                    multiline,
                    dot_all,
                } => ContentOp::Replace {
                    regex: RegexBuilder::new(pattern)
                        .case_insensitive(*case_insensitive)
                        .multi_line(*multiline)
                        .dot_matches_new_line(*dot_all)
                        .build()
                        .map_err(|err| {
                            RouterError::config(format!(
                                "Mutation '{}': invalid pattern: {err}",
                                config.name
                            ))
                        })?,
                    replacement: replacement.clone(),
                },
                MutationKindConfig::PathDelete { path } => {
                    ContentOp::Delete(parse_path(&config.name, path)?)
                }
                MutationKindConfig::PathInsert { path, value } => ContentOp::Insert {
                    path: parse_path(&config.name, path)?,
                    value: value.clone(),
                },
            };
            rules.push(ContentRule {
                name: config.name.clone(),
                target: config.target,
                op,
            });
        }
        Ok(Self { rules })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Runs before encoding for the backend. Deleting every message is rejected.
    pub fn apply_request(&self, req: CanonicalRequest) -> Result<CanonicalRequest> {
        let req = self.apply(req, Stage::Request, RouterError::invalid_request)?;
        if req.messages.is_empty() {
            return Err(RouterError::invalid_request(
                "Mutation rules removed every message from the request",
            ));
        }
        Ok(req)
    }

    /// Runs on a fully decoded unary response.
    pub fn apply_response(&self, resp: CanonicalResponse) -> Result<CanonicalResponse> {
        self.apply(resp, Stage::Response, RouterError::decode)
    }

    /// Chunk-local: only pattern rules run, path rules need a whole document.
    pub fn apply_chunk(&self, chunk: &mut CanonicalChunk) {
        for rule in self.rules_for(Stage::Response) {
            if let ContentOp::Replace { regex, replacement } = &rule.op {
                replace_text(chunk, regex, replacement);
            }
        }
    }

    fn rules_for(&self, stage: Stage) -> impl Iterator<Item = &ContentRule> {
        self.rules.iter().filter(move |r| r.target.covers(stage))
    }

    fn apply<T>(&self, mut doc: T, stage: Stage, invalid: fn(String) -> RouterError) -> Result<T>
    where
        T: Serialize + DeserializeOwned + TextFields,
    {
        for rule in self.rules_for(stage) {
            match &rule.op {
                ContentOp::Replace { regex, replacement } => {
                    let hits = replace_text(&mut doc, regex, replacement);
                    tracing::debug!(rule = %rule.name, ?stage, hits, "Applied replace rule");
                }
                ContentOp::Delete(path) => {
                    let mut value = serde_json::to_value(&doc)?;
                    let removed = path.delete(&mut value);
                    if removed > 0 {
                        doc = rebuild(value, &rule.name, invalid)?;
                    }
                    tracing::debug!(rule = %rule.name, ?stage, %path, removed, "Applied delete rule");
                }
                ContentOp::Insert { path, value: literal } => {
                    let mut value = serde_json::to_value(&doc)?;
                    let written = path.insert(&mut value, literal);
                    if written > 0 {
                        doc = rebuild(value, &rule.name, invalid)?;
                    }
                    tracing::debug!(rule = %rule.name, ?stage, %path, written, "Applied insert rule");
                }
            }
        }
        Ok(doc)
    }
}

fn parse_path(rule: &str, path: &str) -> Result<JsonPath> {
    JsonPath::parse(path).map_err(|err| RouterError::config(format!("Mutation '{rule}': {err}")))
}

fn rebuild<T: DeserializeOwned>(
    value: Value,
    rule: &str,
    invalid: fn(String) -> RouterError,
) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|err| invalid(format!("Mutation '{rule}' produced an invalid document: {err}")))
}

fn replace_text(doc: &mut dyn TextFields, regex: &Regex, replacement: &str) -> usize {
    let mut hits = 0;
    doc.for_each_text_mut(&mut |text| {
        let replaced = match regex.replace_all(text, replacement) {
            Cow::Owned(replaced) => replaced,
            Cow::Borrowed(_) => return,
        };
        *text = replaced;
        hits += 1;
    });
    hits
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::canonical::{ChunkDelta, ContentPart, Message, Role, Usage};
    use serde_json::json;

    fn rule(name: &str, enabled: bool, target: MutationTarget, kind: MutationKindConfig) -> MutationConfig {
        MutationConfig {
            name: name.to_string(),
            enabled,
            target,
            kind,
        }
    }

    fn replace(pattern: &str, replacement: &str) -> MutationKindConfig {
        MutationKindConfig::RegexReplace {
            pattern: pattern.to_string(),
            replacement: replacement.to_string(),
            case_insensitive: false,
            multiline: false,
            dot_all: false,
        }
    }

    fn request_with_metadata() -> CanonicalRequest {
        let mut req = CanonicalRequest::new("m", vec![Message::text(Role::User, "foo and foo")]);
        req.metadata = Some(json!({"user_id": "u"}));
        req
    }

    #[test]
    fn test_rules_apply_in_order_and_disabled_is_inert() {
        let pipeline = ContentPipeline::compile(&[
            rule("rename", true, MutationTarget::Both, replace("foo", "bar")),
            rule(
                "tag",
                false,
                MutationTarget::Both,
                MutationKindConfig::PathInsert {
                    path: "$.metadata.tag".to_string(),
                    value: json!("x"),
                },
            ),
            rule(
                "strip",
                true,
                MutationTarget::Both,
                MutationKindConfig::PathDelete {
                    path: "$.metadata".to_string(),
                },
            ),
        ])
        .unwrap();
        assert_eq!(pipeline.len(), 2);

        let out = pipeline.apply_request(request_with_metadata()).unwrap();
        assert_eq!(out.messages[0].joined_text(), "bar and bar");
        assert!(out.metadata.is_none());
    }

    #[test]
    fn test_order_matters() {
        // Replace after an insert sees the inserted text
        let pipeline = ContentPipeline::compile(&[
            rule(
                "append",
                true,
                MutationTarget::Request,
                MutationKindConfig::PathInsert {
                    path: "$.messages[1]".to_string(),
                    value: json!({"role": "user", "content": [{"type": "text", "text": "foo"}]}),
                },
            ),
            rule("rename", true, MutationTarget::Request, replace("foo", "bar")),
        ])
        .unwrap();
        let out = pipeline.apply_request(request_with_metadata()).unwrap();
        assert_eq!(out.messages.len(), 2);
        assert_eq!(out.messages[1].joined_text(), "bar");
    }

    #[test]
    fn test_capture_groups_and_flags() {
        let pipeline = ContentPipeline::compile(&[rule(
            "swap",
            true,
            MutationTarget::Request,
            MutationKindConfig::RegexReplace {
                pattern: r"(\w+)@EXAMPLE\.com".to_string(),
                replacement: "$1@redacted".to_string(),
                case_insensitive: true,
                multiline: false,
                dot_all: false,
            },
        )])
        .unwrap();
        let req = CanonicalRequest::new(
            "m",
            vec![Message::text(Role::User, "mail bob@example.com")],
        );
        let out = pipeline.apply_request(req).unwrap();
        assert_eq!(out.messages[0].joined_text(), "mail bob@redacted");
    }

    #[test]
    fn test_delete_without_match_is_noop() {
        let pipeline = ContentPipeline::compile(&[rule(
            "strip",
            true,
            MutationTarget::Request,
            MutationKindConfig::PathDelete {
                path: "$.tools[0]".to_string(),
            },
        )])
        .unwrap();
        let req = request_with_metadata();
        let out = pipeline.apply_request(req.clone()).unwrap();
        assert_eq!(out, req);
    }

    #[test]
    fn test_deleting_all_messages_is_rejected() {
        let pipeline = ContentPipeline::compile(&[rule(
            "nuke",
            true,
            MutationTarget::Request,
            MutationKindConfig::PathDelete {
                path: "$.messages[*]".to_string(),
            },
        )])
        .unwrap();
        let err = pipeline.apply_request(request_with_metadata()).unwrap_err();
        assert!(matches!(err, RouterError::InvalidRequest { .. }));
    }

    #[test]
    fn test_target_filters_stage() {
        let pipeline = ContentPipeline::compile(&[rule(
            "req-only",
            true,
            MutationTarget::Request,
            replace("secret", "***"),
        )])
        .unwrap();
        let resp = CanonicalResponse {
            id: "1".to_string(),
            model: "m".to_string(),
            role: Role::Assistant,
            content: vec![ContentPart::text("secret")],
            finish_reason: None,
            usage: Usage::default(),
        };
        let out = pipeline.apply_response(resp).unwrap();
        assert_eq!(out.text(), "secret");
    }

    #[test]
    fn test_chunk_only_sees_its_own_text() {
        let pipeline = ContentPipeline::compile(&[
            rule("rename", true, MutationTarget::Response, replace("foo", "bar")),
            rule(
                "strip",
                true,
                MutationTarget::Response,
                MutationKindConfig::PathDelete {
                    path: "$.delta".to_string(),
                },
            ),
        ])
        .unwrap();

        // A match split across chunks is not rewritten
        let mut a = CanonicalChunk::text(1, "fo");
        let mut b = CanonicalChunk::text(2, "o foo");
        pipeline.apply_chunk(&mut a);
        pipeline.apply_chunk(&mut b);
        assert_eq!(a.delta, Some(ChunkDelta::Text { text: "fo".to_string() }));
        assert_eq!(b.delta, Some(ChunkDelta::Text { text: "o bar".to_string() }));
    }

    #[test]
    fn test_invalid_rule_is_config_error() {
        let err = ContentPipeline::compile(&[rule(
            "bad",
            true,
            MutationTarget::Both,
            MutationKindConfig::PathDelete {
                path: "metadata".to_string(),
            },
        )])
        .unwrap_err();
        assert!(matches!(err, RouterError::Configuration { .. }));

        // Same rule disabled does not fail the load
        assert!(ContentPipeline::compile(&[rule(
            "bad",
            false,
            MutationTarget::Both,
            replace("(", "")
        )])
        .is_ok());
    }
}
