//! The policy engine deciding whether an admission request is allowed.
//!
//! A [`PolicyEngine`] is a fixed, ordered list of [`ValidationRule`]s. Every rule is
//! a pure function of the request: it sees read-only views of the candidate and
//! prior objects and answers with a [`Verdict`]. The engine denies when any rule
//! denies, and never lets a failing rule turn into an allow.
use std::{
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    admission::{AdmissionRequest, AdmissionResponse, Operation, UserInfo},
    gvk::GroupVersionKind,
    object::{DynamicObject, FieldPath},
    response::{Status, StatusCause, StatusDetails},
};

mod config;
pub use config::{PolicyConfig, PolicyConfigError, RangeConfig};

pub mod rules;

/// A rule could not assess the object it was given.
///
/// The display text becomes the denial reason, so it must be fit for end users.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuleError {
    /// The rule needs the candidate object but the request carries none.
    #[error("request does not contain an object")]
    MissingObject,

    /// A field exists but does not have the expected shape.
    #[error("field {field} must be {expected}")]
    InvalidField {
        /// Path of the offending field
        field: FieldPath,
        /// Human readable description of the accepted values
        expected: String,
    },

    /// Any other reason the rule could not decide.
    #[error("{0}")]
    Other(String),
}

/// A single rule's reason for rejecting a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denial {
    /// Name of the rule that denied
    pub rule: String,
    /// Message surfaced to the user
    pub reason: String,
    /// The field the denial is about, when there is one
    pub field: Option<FieldPath>,
}

impl Denial {
    /// Deny with a reason that is not tied to a field
    pub fn new(rule: &str, reason: impl Into<String>) -> Self {
        Self {
            rule: rule.to_string(),
            reason: reason.into(),
            field: None,
        }
    }

    /// Point the denial at a field
    #[must_use]
    pub fn on_field(mut self, field: FieldPath) -> Self {
        self.field = Some(field);
        self
    }
}

impl fmt::Display for Denial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

/// Outcome of one rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The rule has no objection
    Allow,
    /// The rule rejects the request
    Deny(Denial),
}

impl Verdict {
    /// Shorthand for `Verdict::Deny(Denial::new(rule, reason))`
    pub fn deny(rule: &str, reason: impl Into<String>) -> Self {
        Verdict::Deny(Denial::new(rule, reason))
    }

    /// Whether this verdict lets the request through
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allow)
    }
}

/// Read-only view of a request handed to each rule.
#[derive(Debug, Clone, Copy)]
pub struct RuleContext<'a> {
    /// The operation being performed
    pub operation: Operation,
    /// Type of the reviewed object
    pub kind: &'a GroupVersionKind,
    /// Namespace of the request, if any
    pub namespace: Option<&'a str>,
    /// The candidate object; absent on DELETE
    pub object: Option<&'a DynamicObject>,
    /// The prior object; present on UPDATE and DELETE
    pub old_object: Option<&'a DynamicObject>,
    /// The submitting user
    pub user_info: &'a UserInfo,
    /// Whether the operation will be persisted
    pub dry_run: bool,
}

impl<'a> RuleContext<'a> {
    /// Build the view over a decoded request
    pub fn new(req: &'a AdmissionRequest) -> Self {
        Self {
            operation: req.operation,
            kind: &req.kind,
            namespace: req.namespace.as_deref(),
            object: req.object.as_ref(),
            old_object: req.old_object.as_ref(),
            user_info: &req.user_info,
            dry_run: req.dry_run,
        }
    }

    /// The candidate object, for rules that cannot work without it
    pub fn object(&self) -> Result<&'a DynamicObject, RuleError> {
        self.object.ok_or(RuleError::MissingObject)
    }
}

/// A pluggable admission rule.
///
/// Implementations must be deterministic and free of side effects: the same
/// request may be reviewed several times, and many reviews run at once.
///
/// Rules run on a blocking thread and cannot be interrupted. A review that misses
/// its deadline is denied, but the rule keeps its thread and its evaluation slot
/// until it returns, so a rule that never returns permanently uses up one of the
/// webhook's limited concurrent evaluations.
pub trait ValidationRule: Send + Sync {
    /// Stable name used in logs and denial causes
    fn name(&self) -> &str;

    /// Whether the rule has anything to say about this operation
    fn applies_to(&self, _operation: Operation) -> bool {
        true
    }

    /// Whether the rule only inspects the candidate object.
    ///
    /// Such rules are skipped when the request has no candidate object, as on DELETE.
    fn needs_object(&self) -> bool {
        true
    }

    /// Decide on a request
    fn validate(&self, ctx: &RuleContext<'_>) -> Result<Verdict, RuleError>;
}

/// A [`ValidationRule`] backed by a closure, see [`rule_fn`].
pub struct FnRule<F> {
    name: String,
    check: F,
}

/// Wrap a function as a rule that applies to every operation carrying an object.
///
/// ```
/// use mcluster_core::policy::{rule_fn, PolicyEngine, Verdict};
///
/// let engine = PolicyEngine::new().with_rule(rule_fn("no-default-namespace", |ctx| {
///     Ok(match ctx.namespace {
///         Some("default") => Verdict::deny("no-default-namespace", "use a dedicated namespace"),
///         _ => Verdict::Allow,
///     })
/// }));
/// assert_eq!(engine.rule_names(), vec!["no-default-namespace"]);
/// ```
pub fn rule_fn<F>(name: &str, check: F) -> FnRule<F>
where
    F: Fn(&RuleContext<'_>) -> Result<Verdict, RuleError> + Send + Sync,
{
    FnRule {
        name: name.to_string(),
        check,
    }
}

impl<F> ValidationRule for FnRule<F>
where
    F: Fn(&RuleContext<'_>) -> Result<Verdict, RuleError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self, ctx: &RuleContext<'_>) -> Result<Verdict, RuleError> {
        (self.check)(ctx)
    }
}

/// How many rules run once one of them has denied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EvaluationMode {
    /// Stop at the first denial
    #[default]
    FailFast,
    /// Run every applicable rule and report every denial
    CollectAll,
}

/// The result of running an engine over one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Evaluation {
    /// Denials in rule order; empty when the request is allowed
    pub denials: Vec<Denial>,
    /// Number of rules that ran
    pub evaluated: usize,
    /// Number of rules skipped because they did not apply
    pub skipped: usize,
}

impl Evaluation {
    /// Whether no rule denied
    pub fn is_allowed(&self) -> bool {
        self.denials.is_empty()
    }

    /// The combined denial reason, if any
    pub fn reason(&self) -> Option<String> {
        if self.denials.is_empty() {
            return None;
        }
        Some(
            self.denials
                .iter()
                .map(|d| d.reason.as_str())
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    /// Turn the verdict into the response for `req`.
    ///
    /// Denials become `status.details.causes`, one per denying rule.
    pub fn into_response(self, req: &AdmissionRequest) -> AdmissionResponse {
        let res = AdmissionResponse::from(req);
        let Some(reason) = self.reason() else {
            return res;
        };
        let causes = self
            .denials
            .into_iter()
            .map(|d| StatusCause {
                reason: d.rule,
                message: d.reason,
                field: d.field.map(|f| f.to_string()).unwrap_or_default(),
            })
            .collect();
        let details = StatusDetails {
            name: req.name.clone(),
            group: req.kind.group.clone(),
            kind: req.kind.kind.clone(),
            causes,
        };
        res.with_status(Status::failure(&reason, "Forbidden").with_code(403).with_details(details))
            .deny(reason)
    }
}

/// An immutable, ordered set of rules.
///
/// Built once at startup and shared between concurrent reviews, usually behind an [`Arc`].
#[derive(Clone, Default)]
pub struct PolicyEngine {
    rules: Vec<Arc<dyn ValidationRule>>,
    mode: EvaluationMode,
}

impl fmt::Debug for PolicyEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyEngine")
            .field("rules", &self.rule_names())
            .field("mode", &self.mode)
            .finish()
    }
}

impl PolicyEngine {
    /// An engine without rules; it allows everything
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a rule; rules run in the order they were added
    #[must_use]
    pub fn with_rule(mut self, rule: impl ValidationRule + 'static) -> Self {
        self.rules.push(Arc::new(rule));
        self
    }

    /// Set the default evaluation mode
    #[must_use]
    pub fn with_mode(mut self, mode: EvaluationMode) -> Self {
        self.mode = mode;
        self
    }

    /// The default evaluation mode
    pub fn mode(&self) -> EvaluationMode {
        self.mode
    }

    /// Names of the registered rules, in evaluation order
    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    /// Evaluate a request in the engine's default mode
    pub fn evaluate(&self, req: &AdmissionRequest) -> Evaluation {
        self.evaluate_with(req, self.mode)
    }

    /// Evaluate a request in an explicit mode
    pub fn evaluate_with(&self, req: &AdmissionRequest, mode: EvaluationMode) -> Evaluation {
        let ctx = RuleContext::new(req);
        let mut evaluation = Evaluation::default();

        for rule in &self.rules {
            if !rule.applies_to(ctx.operation) || (rule.needs_object() && ctx.object.is_none()) {
                debug!(uid = %req.uid, rule = rule.name(), "rule skipped");
                evaluation.skipped += 1;
                continue;
            }
            evaluation.evaluated += 1;

            let Some(denial) = run_rule(rule.as_ref(), &ctx) else {
                continue;
            };
            debug!(uid = %req.uid, rule = rule.name(), reason = %denial.reason, "rule denied");
            evaluation.denials.push(denial);
            if mode == EvaluationMode::FailFast {
                break;
            }
        }
        evaluation
    }
}

/// Run one rule, folding errors and panics into denials.
fn run_rule(rule: &dyn ValidationRule, ctx: &RuleContext<'_>) -> Option<Denial> {
    match catch_unwind(AssertUnwindSafe(|| rule.validate(ctx))) {
        Ok(Ok(Verdict::Allow)) => None,
        Ok(Ok(Verdict::Deny(denial))) => Some(denial),
        Ok(Err(err)) => {
            let field = match &err {
                RuleError::InvalidField { field, .. } => Some(field.clone()),
                _ => None,
            };
            Some(Denial {
                rule: rule.name().to_string(),
                reason: format!("{} could not validate the object: {err}", rule.name()),
                field,
            })
        }
        Err(_) => {
            warn!(rule = rule.name(), "rule panicked during evaluation");
            Some(Denial::new(
                rule.name(),
                format!("{} failed unexpectedly while validating the object", rule.name()),
            ))
        }
    }
}
