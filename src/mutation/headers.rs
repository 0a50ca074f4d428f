use regex::{Regex, RegexBuilder};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::config::HeaderRulesConfig;
use crate::error::{Result, RouterError};

#[derive(Debug, Clone, Default)]
pub struct HeaderRules {
    drop_all: bool,
    drop: Vec<HeaderName>,
    drop_patterns: Vec<Regex>,
    add: Vec<(HeaderName, HeaderValue)>,
    force: Vec<(HeaderName, HeaderValue)>,
}

fn header_name(name: &str) -> Result<HeaderName> {
    HeaderName::from_bytes(name.trim().as_bytes())
        .map_err(|err| RouterError::config(format!("Invalid header name {name:?}: {err}")))
}

fn header_pairs(pairs: &std::collections::BTreeMap<String, String>) -> Result<Vec<(HeaderName, HeaderValue)>> {
    pairs
        .iter()
        .map(|(name, value)| {
            let value = HeaderValue::from_str(value).map_err(|err| {
                RouterError::config(format!("Invalid value for header {name:?}: {err}"))
            })?;
            Ok((header_name(name)?, value))
        })
        .collect()
}

impl HeaderRules {
    pub fn compile(config: &HeaderRulesConfig) -> Result<Self> {
        let drop = config
            .drop
            .iter()
            .map(|n| header_name(n))
            .collect::<Result<Vec<_>>>()?;

        let drop_patterns = config
            .drop_patterns
            .iter()
            .map(|pattern| {
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|err| {
                        RouterError::config(format!("Invalid header pattern {pattern:?}: {err}"))
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            drop_all: config.drop_all,
            drop,
            drop_patterns,
            add: header_pairs(&config.add)?,
            force: header_pairs(&config.force)?,
        })
    }

    pub fn apply(&self, headers: HeaderMap) -> HeaderMap {
        let mut out = if self.drop_all {
            HeaderMap::new()
        } else {
            headers
        };

        let doomed: Vec<HeaderName> = out
            .keys()
            .filter(|name| {
                self.drop.contains(name)
                    || self.drop_patterns.iter().any(|re| re.is_match(name.as_str()))
            })
            .cloned()
            .collect();
        for name in &doomed {
            out.remove(name);
        }

        for (name, value) in &self.add {
            if !out.contains_key(name) {
                out.insert(name.clone(), value.clone());
            }
        }

        for (name, value) in &self.force {
            out.insert(name.clone(), value.clone());
        }

        if !doomed.is_empty() || self.drop_all {
            tracing::debug!(dropped = doomed.len(), drop_all = self.drop_all, "Applied header rules");
        }
        out
    }
}
