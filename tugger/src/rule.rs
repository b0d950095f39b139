//! A single policy rule
//!
//! A rule is a regular expression matched against the full image reference, an
//! optional replacement template using `$1`/`${name}` capture syntax, and an
//! optional condition that requires the resulting image to exist remotely.

use std::str::FromStr;

use regex::Regex;
use serde::Deserialize;

use crate::error::PolicyError;
use crate::registry::RegistryLookup;

/// When a matching rule counts as a hit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Condition {
    /// No condition given
    #[default]
    None,
    /// Explicitly unconditional, same as `None`
    Always,
    /// The candidate image must be present in its registry
    Exists,
}

impl FromStr for Condition {
    type Err = PolicyError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "" => Ok(Self::None),
            "Always" => Ok(Self::Always),
            "Exists" => Ok(Self::Exists),
            other => Err(PolicyError::InvalidCondition(other.to_string())),
        }
    }
}

/// A rule as written in the policy document
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuleSpec {
    pub pattern: String,
    #[serde(default)]
    pub replacement: Option<String>,
    #[serde(default)]
    pub condition: Option<String>,
}

/// Outcome of evaluating one rule against one image
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evaluation {
    /// The pattern did not match
    NoMatch,
    /// The rule applies; carries the (possibly rewritten) image
    Matched(String),
    /// The pattern matched but the candidate image is not in the registry
    TargetMissing(String),
}

/// A compiled rule
#[derive(Debug, Clone)]
pub struct Rule {
    pattern: Regex,
    replacement: String,
    condition: Condition,
}

impl Rule {
    /// Compiles a rule, failing on a bad expression or an unknown condition
    pub fn compile(
        pattern: &str,
        replacement: Option<&str>,
        condition: Option<&str>,
    ) -> Result<Self, PolicyError> {
        let compiled = Regex::new(pattern).map_err(|source| PolicyError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;

        Ok(Self {
            pattern: compiled,
            replacement: replacement.unwrap_or_default().to_string(),
            condition: condition.unwrap_or_default().parse()?,
        })
    }

    pub fn replacement(&self) -> &str {
        &self.replacement
    }

    pub fn condition(&self) -> Condition {
        self.condition
    }

    /// True for rules without a replacement, the only ones validation considers
    pub fn is_validating(&self) -> bool {
        self.replacement.is_empty()
    }

    pub fn is_match(&self, image: &str) -> bool {
        self.pattern.is_match(image)
    }

    /// Applies the replacement template, or returns the image untouched when
    /// the rule has none
    pub fn rewrite(&self, image: &str) -> String {
        if self.replacement.is_empty() {
            return image.to_string();
        }
        self.pattern
            .replace_all(image, self.replacement.as_str())
            .into_owned()
    }

    /// Evaluates the rule, consulting the registry only for `Exists` rules
    /// whose pattern matched
    pub async fn evaluate(&self, image: &str, registry: &dyn RegistryLookup) -> Evaluation {
        if !self.is_match(image) {
            return Evaluation::NoMatch;
        }

        let candidate = self.rewrite(image);
        if self.condition == Condition::Exists && !registry.exists(&candidate).await {
            return Evaluation::TargetMissing(candidate);
        }

        Evaluation::Matched(candidate)
    }
}

impl TryFrom<&RuleSpec> for Rule {
    type Error = PolicyError;

    fn try_from(spec: &RuleSpec) -> Result<Self, Self::Error> {
        Self::compile(
            &spec.pattern,
            spec.replacement.as_deref(),
            spec.condition.as_deref(),
        )
    }
}
