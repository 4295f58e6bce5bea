//! Validator pipeline
//!
//! An ordered list of independent [`ValidationRule`]s. Every rule runs against every
//! descriptor so failures are reported per rule; a descriptor failing any rule is
//! excluded from the load set without affecting its siblings.

use crate::descriptor::{PluginDescriptor, PluginState};
use crate::signature::{TrustedKeys, artifact_digest};
use crate::{PluginError, PluginResult};
use harbor_core::config::ValidationConfig;
use harbor_core::sanitize::sanitize_detail;
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

/// What a rule can see besides the descriptor under test
pub struct ValidationContext<'a> {
    /// Every descriptor in the batch, in discovery order
    pub batch: &'a [PluginDescriptor],
    /// Position of the descriptor under test within `batch`
    pub index: usize,
    /// Ids of plugins already running in the host
    pub resident: &'a HashSet<String>,
}

/// A single validation rule
pub trait ValidationRule: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns the reasons for failure, if any
    fn check(&self, descriptor: &PluginDescriptor, ctx: &ValidationContext<'_>) -> Vec<String>;
}

/// Failure of one rule for one descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleFailure {
    pub rule: &'static str,
    pub reasons: Vec<String>,
}

/// A descriptor excluded by the pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    pub plugin_id: String,
    pub manifest_path: Option<PathBuf>,
    pub failures: Vec<RuleFailure>,
}

impl Rejection {
    pub fn to_error(&self) -> PluginError {
        PluginError::ValidationFailure {
            plugin_id: self.plugin_id.clone(),
            reasons: self
                .failures
                .iter()
                .flat_map(|f| f.reasons.iter().map(move |r| format!("{}: {}", f.rule, r)))
                .collect(),
        }
    }
}

/// Outcome of validating a batch
#[derive(Debug, Clone, Default)]
pub struct ValidationOutcome {
    /// Admitted descriptors, advanced to `Validated`, in input order
    pub admitted: Vec<PluginDescriptor>,
    pub rejected: Vec<Rejection>,
}

/// Ordered list of validation rules
#[derive(Clone, Default)]
pub struct ValidatorPipeline {
    rules: Vec<Arc<dyn ValidationRule>>,
}

impl ValidatorPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in rules enabled by the configuration
    pub fn from_config(config: &ValidationConfig) -> Self {
        let mut pipeline = Self::new()
            .with_rule(UniqueIdRule)
            .with_rule(ArtifactExistsRule);

        if config.reject_unresolved_dependencies {
            pipeline = pipeline.with_rule(DependenciesResolvableRule);
        }
        pipeline = pipeline.with_rule(SemanticVersionRule);

        let (keys, invalid) = TrustedKeys::parse(&config.resolved_trusted_keys());
        for reason in invalid {
            warn!(reason = %reason, "Ignoring invalid trusted signing key");
        }
        if config.require_signatures || !keys.is_empty() {
            pipeline = pipeline.with_rule(SignatureRule {
                keys,
                required: config.require_signatures,
            });
        }

        if !config.allowed_paths.is_empty() || !config.allowed_publishers.is_empty() {
            pipeline = pipeline.with_rule(WhitelistRule {
                allowed_paths: config
                    .allowed_paths
                    .iter()
                    .map(|p| crate::descriptor::normalize_path(p))
                    .collect(),
                allowed_publishers: config.allowed_publishers.clone(),
            });
        }

        pipeline
    }

    pub fn with_rule(mut self, rule: impl ValidationRule + 'static) -> Self {
        self.rules.push(Arc::new(rule));
        self
    }

    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    /// Run every rule against every descriptor
    pub fn validate(
        &self,
        descriptors: Vec<PluginDescriptor>,
        resident: &HashSet<String>,
    ) -> ValidationOutcome {
        let failures: Vec<Vec<RuleFailure>> = descriptors
            .iter()
            .enumerate()
            .map(|(index, descriptor)| {
                let ctx = ValidationContext {
                    batch: &descriptors,
                    index,
                    resident,
                };
                self.rules
                    .iter()
                    .filter_map(|rule| {
                        let reasons: Vec<String> = rule
                            .check(descriptor, &ctx)
                            .iter()
                            .map(|r| sanitize_detail(r))
                            .collect();
                        (!reasons.is_empty()).then(|| RuleFailure {
                            rule: rule.name(),
                            reasons,
                        })
                    })
                    .collect()
            })
            .collect();

        let mut outcome = ValidationOutcome::default();
        for (mut descriptor, failures) in descriptors.into_iter().zip(failures) {
            if failures.is_empty() {
                descriptor.advance(PluginState::Validated);
                debug!(plugin_id = %descriptor.id, "Descriptor validated");
                outcome.admitted.push(descriptor);
            } else {
                for failure in &failures {
                    warn!(
                        plugin_id = %descriptor.id,
                        rule = failure.rule,
                        reasons = %failure.reasons.join("; "),
                        "Descriptor rejected"
                    );
                }
                outcome.rejected.push(Rejection {
                    plugin_id: descriptor.id,
                    manifest_path: descriptor.manifest_path,
                    failures,
                });
            }
        }
        outcome
    }

    /// Validate a single descriptor, failing with [`PluginError::ValidationFailure`]
    pub fn validate_one(
        &self,
        descriptor: PluginDescriptor,
        resident: &HashSet<String>,
    ) -> PluginResult<PluginDescriptor> {
        let mut outcome = self.validate(vec![descriptor], resident);
        match outcome.rejected.pop() {
            Some(rejection) => Err(rejection.to_error()),
            None => outcome
                .admitted
                .pop()
                .ok_or_else(|| PluginError::Io("validator dropped descriptor".to_string())),
        }
    }
}

impl std::fmt::Debug for ValidatorPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidatorPipeline")
            .field("rules", &self.rule_names())
            .finish()
    }
}

/// Later descriptors may not reuse an earlier id
pub struct UniqueIdRule;

impl ValidationRule for UniqueIdRule {
    fn name(&self) -> &'static str {
        "unique-id"
    }

    fn check(&self, descriptor: &PluginDescriptor, ctx: &ValidationContext<'_>) -> Vec<String> {
        let earlier = ctx.batch[..ctx.index]
            .iter()
            .find(|other| other.id == descriptor.id);
        match earlier {
            Some(_) => vec![format!("plugin id '{}' was already declared", descriptor.id)],
            None => Vec::new(),
        }
    }
}

pub struct ArtifactExistsRule;

impl ValidationRule for ArtifactExistsRule {
    fn name(&self) -> &'static str {
        "artifact-exists"
    }

    fn check(&self, descriptor: &PluginDescriptor, _ctx: &ValidationContext<'_>) -> Vec<String> {
        if descriptor.artifact.is_file() {
            Vec::new()
        } else {
            vec![format!(
                "artifact {} does not exist",
                descriptor.artifact.display()
            )]
        }
    }
}

/// Every required dependency is present in the batch or already running
pub struct DependenciesResolvableRule;

impl ValidationRule for DependenciesResolvableRule {
    fn name(&self) -> &'static str {
        "dependencies-resolvable"
    }

    fn check(&self, descriptor: &PluginDescriptor, ctx: &ValidationContext<'_>) -> Vec<String> {
        descriptor
            .required_dependencies()
            .filter(|dep| {
                !ctx.resident.contains(&dep.plugin_id)
                    && !ctx.batch.iter().any(|other| other.id == dep.plugin_id)
            })
            .map(|dep| format!("required dependency '{}' was not found", dep.plugin_id))
            .collect()
    }
}

pub struct SemanticVersionRule;

impl ValidationRule for SemanticVersionRule {
    fn name(&self) -> &'static str {
        "semantic-version"
    }

    fn check(&self, descriptor: &PluginDescriptor, _ctx: &ValidationContext<'_>) -> Vec<String> {
        let mut reasons = Vec::new();
        if let Err(e) = semver::Version::parse(&descriptor.version) {
            reasons.push(format!("version '{}' is not valid semver: {e}", descriptor.version));
        }
        for dep in &descriptor.dependencies {
            if let Some(req) = &dep.version_req {
                if let Err(e) = semver::VersionReq::parse(req) {
                    reasons.push(format!(
                        "dependency '{}' has invalid version requirement '{}': {e}",
                        dep.plugin_id, req
                    ));
                }
            }
        }
        reasons
    }
}

/// Artifact signature verification
pub struct SignatureRule {
    pub keys: TrustedKeys,
    /// Reject unsigned artifacts
    pub required: bool,
}

impl ValidationRule for SignatureRule {
    fn name(&self) -> &'static str {
        "signature"
    }

    fn check(&self, descriptor: &PluginDescriptor, _ctx: &ValidationContext<'_>) -> Vec<String> {
        let Some(signature) = &descriptor.signature else {
            return if self.required {
                vec!["artifact is not signed".to_string()]
            } else {
                Vec::new()
            };
        };

        let digest = match artifact_digest(&descriptor.artifact) {
            Ok(digest) => digest,
            Err(e) => return vec![format!("cannot hash artifact: {e}")],
        };

        match self.keys.verify_digest(&digest, signature) {
            Ok(()) => Vec::new(),
            Err(reason) => vec![reason],
        }
    }
}

/// Allowed artifact locations and publishers
pub struct WhitelistRule {
    pub allowed_paths: Vec<PathBuf>,
    pub allowed_publishers: Vec<String>,
}

impl ValidationRule for WhitelistRule {
    fn name(&self) -> &'static str {
        "whitelist"
    }

    fn check(&self, descriptor: &PluginDescriptor, _ctx: &ValidationContext<'_>) -> Vec<String> {
        let mut reasons = Vec::new();

        if !self.allowed_paths.is_empty()
            && !self
                .allowed_paths
                .iter()
                .any(|prefix| descriptor.artifact.starts_with(prefix))
        {
            reasons.push(format!(
                "artifact {} is outside the allowed locations",
                descriptor.artifact.display()
            ));
        }

        if !self.allowed_publishers.is_empty() {
            let allowed = descriptor
                .publisher
                .as_ref()
                .is_some_and(|p| self.allowed_publishers.contains(p));
            if !allowed {
                reasons.push(format!(
                    "publisher '{}' is not allowed",
                    descriptor.publisher.as_deref().unwrap_or("<none>")
                ));
            }
        }

        reasons
    }
}
