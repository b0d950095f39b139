//! Image policies
//!
//! A [`Policy`] is an ordered list of [`Rule`]s loaded once at startup. The first
//! rule that matches an image decides what happens to it. When no policy file is
//! configured the webhook falls back to [`LegacyPolicy`], which trusts a list of
//! registry hosts and prefixes everything else with a single target registry.

use std::path::Path;

use serde::Deserialize;
use tracing::{debug, info};

use crate::error::PolicyError;
use crate::registry::RegistryLookup;
use crate::rule::{Condition, Evaluation, Rule, RuleSpec};

/// The result of running one image through a policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// Image as submitted
    pub original: String,
    /// Image after the policy was applied
    pub image: String,
    /// Whether `image` differs from `original`
    pub changed: bool,
    /// Whether any rule accepted the image
    pub allowed: bool,
    /// Rewrite target an `Exists` rule wanted but could not find, reported only
    /// when no later rule matched
    pub missing_target: Option<String>,
}

impl Decision {
    fn unchanged(image: &str) -> Self {
        Self {
            original: image.to_string(),
            image: image.to_string(),
            changed: false,
            allowed: false,
            missing_target: None,
        }
    }

    fn accepted(original: &str, image: String) -> Self {
        Self {
            changed: image != original,
            original: original.to_string(),
            image,
            allowed: true,
            missing_target: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PolicyDocument {
    #[serde(default)]
    rules: Vec<RuleSpec>,
}

/// Ordered rule list, immutable once loaded
#[derive(Debug, Clone)]
pub struct Policy {
    rules: Vec<Rule>,
}

impl Policy {
    /// Builds a policy from already compiled rules
    pub fn new(rules: Vec<Rule>) -> Result<Self, PolicyError> {
        if rules.is_empty() {
            return Err(PolicyError::EmptyRules);
        }
        Ok(Self { rules })
    }

    /// Parses and compiles a YAML policy document
    ///
    /// ```yaml
    /// rules:
    /// - pattern: ^registry.local/.*
    /// - pattern: (.*)
    ///   replacement: registry.local/$1
    ///   condition: Exists
    /// ```
    pub fn from_yaml(document: &str) -> Result<Self, PolicyError> {
        let parsed: PolicyDocument = serde_yaml::from_str(document)?;
        let rules = parsed
            .rules
            .iter()
            .map(Rule::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        let policy = Self::new(rules)?;
        info!(rules = policy.rules.len(), "loaded policy");
        Ok(policy)
    }

    /// Reads and compiles a policy file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, PolicyError> {
        let path = path.as_ref();
        let document = std::fs::read_to_string(path).map_err(|source| PolicyError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&document)
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Rewrites an image with the first rule that matches
    ///
    /// An `Exists` rule whose candidate is absent is skipped as if it had not
    /// matched. Images that no rule matches come back unchanged and not allowed.
    pub async fn decide(&self, image: &str, registry: &dyn RegistryLookup) -> Decision {
        let mut missing_target = None;

        for rule in &self.rules {
            match rule.evaluate(image, registry).await {
                Evaluation::NoMatch => {}
                Evaluation::TargetMissing(candidate) => {
                    debug!(image = %image, candidate = %candidate, "rewrite target does not exist");
                    missing_target = Some(candidate);
                }
                Evaluation::Matched(candidate) => return Decision::accepted(image, candidate),
            }
        }

        Decision {
            missing_target,
            ..Decision::unchanged(image)
        }
    }

    /// Checks an image against the rules that have no replacement
    pub async fn admits(&self, image: &str, registry: &dyn RegistryLookup) -> bool {
        for rule in self.rules.iter().filter(|rule| rule.is_validating()) {
            if !rule.is_match(image) {
                continue;
            }
            if rule.condition() == Condition::Exists && !registry.exists(image).await {
                continue;
            }
            return true;
        }
        false
    }
}

/// Zero-configuration policy driven by the registry whitelist
///
/// Equivalent to a [`Policy`] with one validate-only rule per trusted host
/// (matched anywhere in the image reference) followed by a catch-all
/// `(.*)` → `<target>/$1`.
#[derive(Debug, Clone, Default)]
pub struct LegacyPolicy {
    trusted: Vec<String>,
    target: Option<String>,
}

impl LegacyPolicy {
    pub fn new(trusted: Vec<String>, target: Option<String>) -> Self {
        Self { trusted, target }
    }

    /// Whether the image contains one of the trusted registry strings
    ///
    /// Note the direction: the image must contain the whitelist entry. The
    /// namespace whitelist checks the opposite way round.
    pub fn is_trusted(&self, image: &str) -> bool {
        self.trusted
            .iter()
            .any(|registry| registry == image || image.contains(registry.as_str()))
    }

    pub fn decide(&self, image: &str) -> Decision {
        if self.is_trusted(image) {
            debug!(image = %image, "image is being pulled from private registry");
            return Decision::accepted(image, image.to_string());
        }

        debug!(image = %image, "image is not being pulled from private registry");
        match &self.target {
            Some(target) => Decision::accepted(image, format!("{target}/{image}")),
            None => Decision::unchanged(image),
        }
    }

    pub fn admits(&self, image: &str) -> bool {
        self.is_trusted(image)
    }

    /// The rule list this policy behaves like
    pub fn to_policy(&self) -> Result<Policy, PolicyError> {
        let mut rules = self
            .trusted
            .iter()
            .map(|registry| Rule::compile(&regex::escape(registry), None, None))
            .collect::<Result<Vec<_>, _>>()?;
        if let Some(target) = &self.target {
            rules.push(Rule::compile("(.*)", Some(&format!("{target}/$1")), None)?);
        }
        Policy::new(rules)
    }
}

/// The policy the pipeline evaluates: a loaded rule list or the legacy fallback
#[derive(Debug, Clone)]
pub enum ImagePolicy {
    Rules(Policy),
    Legacy(LegacyPolicy),
}

impl ImagePolicy {
    pub async fn decide(&self, image: &str, registry: &dyn RegistryLookup) -> Decision {
        match self {
            Self::Rules(policy) => policy.decide(image, registry).await,
            Self::Legacy(legacy) => legacy.decide(image),
        }
    }

    pub async fn admits(&self, image: &str, registry: &dyn RegistryLookup) -> bool {
        match self {
            Self::Rules(policy) => policy.admits(image, registry).await,
            Self::Legacy(legacy) => legacy.admits(image),
        }
    }
}

impl From<Policy> for ImagePolicy {
    fn from(policy: Policy) -> Self {
        Self::Rules(policy)
    }
}

impl From<LegacyPolicy> for ImagePolicy {
    fn from(legacy: LegacyPolicy) -> Self {
        Self::Legacy(legacy)
    }
}
