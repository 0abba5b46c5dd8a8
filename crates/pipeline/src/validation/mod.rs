//! Rule-based design validation.
//!
//! [`DesignValidator`] runs an ordered list of [`ValidationRule`]s over a design
//! document. It is pure and deterministic: no LLM call, no I/O, and the same
//! input always yields the same [`ValidationReport`]. Every rule is driven by
//! [`ValidatorConfig`] data so vocabularies can be changed without touching
//! the rule logic.

mod rules;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::{ComplexityProfile, DepthLevel, IssueCode, Severity};

pub use rules::{DatabaseConsistencyRule, DisallowedTermsRule, RequiredSectionsRule, ScopeAlignmentRule};

// ---------------------------------------------------------------------------
// Issues and reports
// ---------------------------------------------------------------------------

/// One finding produced by a validation rule or the sanity review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// Stable identity used for de-duplication across iterations.
    pub code: IssueCode,
    /// Severity; only `error` makes a design invalid.
    pub severity: Severity,
    /// Human-readable description.
    pub message: String,
    /// Whether a corrector is expected to fix this without human input.
    pub auto_correctable: bool,
    /// Suggested fix.
    #[serde(default)]
    pub suggestion: Option<String>,
    /// Where in the design the finding applies (e.g. `"line 12"`).
    #[serde(default)]
    pub location: Option<String>,
}

impl ValidationIssue {
    /// Creates a non-correctable issue with no suggestion or location.
    pub fn new(code: IssueCode, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            code,
            severity,
            message: message.into(),
            auto_correctable: false,
            suggestion: None,
            location: None,
        }
    }

    /// Marks the issue as auto-correctable.
    #[must_use]
    pub fn correctable(mut self) -> Self {
        self.auto_correctable = true;
        self
    }

    /// Attaches a suggested fix.
    #[must_use]
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Attaches a location.
    #[must_use]
    pub fn at(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
}

/// Outcome of one check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    /// The check found nothing.
    Pass,
    /// The check produced at least one issue.
    Fail,
}

/// Result of one validation pass. Superseded, never mutated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// `true` iff no issue has [`Severity::Error`].
    pub is_valid: bool,
    /// Every check that ran, by name.
    pub checks: BTreeMap<String, CheckStatus>,
    /// Issues in rule order, de-duplicated by code.
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    /// Assembles a report, de-duplicating issues by code and deriving `is_valid`.
    pub fn from_parts(checks: BTreeMap<String, CheckStatus>, issues: Vec<ValidationIssue>) -> Self {
        let mut seen = BTreeSet::new();
        let issues: Vec<ValidationIssue> = issues
            .into_iter()
            .filter(|i| seen.insert(i.code.clone()))
            .collect();
        let is_valid = !issues.iter().any(|i| i.severity == Severity::Error);
        Self {
            is_valid,
            checks,
            issues,
        }
    }

    /// Codes of every issue in the report.
    pub fn codes(&self) -> BTreeSet<IssueCode> {
        self.issues.iter().map(|i| i.code.clone()).collect()
    }

    /// Issues a corrector may attempt.
    pub fn correctable_issues(&self) -> Vec<ValidationIssue> {
        self.issues
            .iter()
            .filter(|i| i.auto_correctable)
            .cloned()
            .collect()
    }

    /// Issues needing human attention.
    pub fn uncorrectable_issues(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| !i.auto_correctable)
    }

    /// Returns `true` when the correction loop should be entered.
    pub fn needs_correction(&self) -> bool {
        !self.is_valid && self.issues.iter().any(|i| i.auto_correctable)
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// A section the design must contain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionRequirement {
    /// Stable key used in the issue code.
    pub key: String,
    /// Heading fragments accepted for the section (case-insensitive).
    pub aliases: Vec<String>,
    /// Lowest depth level at which the section becomes mandatory.
    #[serde(default = "default_min_depth")]
    pub min_depth: DepthLevel,
}

fn default_min_depth() -> DepthLevel {
    DepthLevel::Minimal
}

/// A datastore name and its spellings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseName {
    /// Name reported in messages.
    pub canonical: String,
    /// Spellings matched in the design.
    pub patterns: Vec<String>,
}

/// Why a term is disallowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TermCategory {
    /// Deprecated dependency (`dependency.deprecated.*`, warning).
    Deprecated,
    /// Proprietary language or dialect (`language.vendor_specific.*`, error).
    VendorSpecific,
}

/// A term the design should not rely on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisallowedTerm {
    /// Term matched case-insensitively on word boundaries.
    pub term: String,
    /// Category deciding code prefix and severity.
    pub category: TermCategory,
    /// Suggested replacement.
    #[serde(default)]
    pub suggestion: Option<String>,
}

/// Acceptable document length, in words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WordRange {
    /// Fewer words is `scope.too_brief`.
    pub min: usize,
    /// More words is `scope.too_elaborate`.
    pub max: usize,
}

/// Word ranges per depth level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeRanges {
    /// Range for minimal projects.
    pub minimal: WordRange,
    /// Range for standard projects.
    pub standard: WordRange,
    /// Range for detailed projects.
    pub detailed: WordRange,
}

impl ScopeRanges {
    /// Returns the range for a depth level.
    pub fn for_depth(&self, depth: DepthLevel) -> WordRange {
        match depth {
            DepthLevel::Minimal => self.minimal,
            DepthLevel::Standard => self.standard,
            DepthLevel::Detailed => self.detailed,
        }
    }
}

/// Vocabulary and thresholds for the built-in rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Sections checked by `required_sections`.
    pub required_sections: Vec<SectionRequirement>,
    /// Datastores recognised by `database_consistency`.
    pub databases: Vec<DatabaseName>,
    /// Phrases marking a datastore as the primary one.
    pub primary_markers: Vec<String>,
    /// Phrases marking a datastore as a cache, replica or other non-primary role.
    pub secondary_markers: Vec<String>,
    /// Terms checked by `disallowed_terms`.
    pub disallowed_terms: Vec<DisallowedTerm>,
    /// Word ranges checked by `scope_alignment`.
    pub scope: ScopeRanges,
    /// Terms flagged as over-engineering in minimal-depth designs.
    pub overengineering_terms: Vec<String>,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        let section = |key: &str, aliases: &[&str], min_depth| SectionRequirement {
            key: key.to_string(),
            aliases: aliases.iter().map(|a| a.to_string()).collect(),
            min_depth,
        };
        let database = |canonical: &str, patterns: &[&str]| DatabaseName {
            canonical: canonical.to_string(),
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
        };
        let term = |term: &str, category, suggestion: &str| DisallowedTerm {
            term: term.to_string(),
            category,
            suggestion: Some(suggestion.to_string()),
        };
        Self {
            required_sections: vec![
                section("overview", &["overview", "introduction", "summary"], DepthLevel::Minimal),
                section(
                    "architecture",
                    &["architecture", "system design", "components"],
                    DepthLevel::Minimal,
                ),
                section(
                    "data_model",
                    &["data model", "database", "storage", "persistence", "schema"],
                    DepthLevel::Standard,
                ),
                section("testing", &["testing", "test strategy", "quality"], DepthLevel::Standard),
                section(
                    "deployment",
                    &["deployment", "operations", "infrastructure"],
                    DepthLevel::Detailed,
                ),
                section("security", &["security"], DepthLevel::Detailed),
            ],
            databases: vec![
                database("PostgreSQL", &["postgresql", "postgres"]),
                database("MySQL", &["mysql"]),
                database("MariaDB", &["mariadb"]),
                database("SQLite", &["sqlite"]),
                database("MongoDB", &["mongodb", "mongo"]),
                database("DynamoDB", &["dynamodb"]),
                database("Cassandra", &["cassandra"]),
                database("SQL Server", &["sql server", "mssql"]),
                database("Redis", &["redis"]),
            ],
            primary_markers: ["primary", "main database", "main datastore", "source of truth", "system of record"]
                .iter()
                .map(|m| m.to_string())
                .collect(),
            secondary_markers: ["secondary", "cache", "caches", "caching", "replica", "read replica", "backup"]
                .iter()
                .map(|m| m.to_string())
                .collect(),
            disallowed_terms: vec![
                term("python 2", TermCategory::Deprecated, "Use Python 3"),
                term("angularjs", TermCategory::Deprecated, "Use a maintained framework such as Angular"),
                term("moment.js", TermCategory::Deprecated, "Use date-fns or the Temporal API"),
                term("tslint", TermCategory::Deprecated, "Use ESLint"),
                term("node-sass", TermCategory::Deprecated, "Use the sass package (Dart Sass)"),
                term("request-promise", TermCategory::Deprecated, "Use the built-in fetch API"),
                term("pl/sql", TermCategory::VendorSpecific, "Keep business logic in application code or portable SQL"),
                term("t-sql", TermCategory::VendorSpecific, "Keep business logic in application code or portable SQL"),
                term("abap", TermCategory::VendorSpecific, "Use a general-purpose language"),
                term("vba", TermCategory::VendorSpecific, "Use a general-purpose language"),
            ],
            scope: ScopeRanges {
                minimal: WordRange { min: 60, max: 3_000 },
                standard: WordRange { min: 150, max: 8_000 },
                detailed: WordRange { min: 300, max: 20_000 },
            },
            overengineering_terms: [
                "kubernetes",
                "service mesh",
                "microservices",
                "event sourcing",
                "multi-region",
                "sharding",
                "kafka",
            ]
            .iter()
            .map(|t| t.to_string())
            .collect(),
        }
    }
}

/// A vocabulary entry could not be compiled into a matcher.
#[derive(Debug, Error)]
#[error("invalid validator term '{term}': {source}")]
pub struct ValidatorConfigError {
    /// Offending term.
    pub term: String,
    /// Underlying regex error.
    #[source]
    pub source: regex::Error,
}

// ---------------------------------------------------------------------------
// Rules and the validator
// ---------------------------------------------------------------------------

/// One deterministic check over a design document.
pub trait ValidationRule: Send + Sync {
    /// Name used as the key in [`ValidationReport::checks`].
    fn name(&self) -> &str;

    /// Returns `true` if this rule can produce `code`.
    fn owns(&self, code: &IssueCode) -> bool;

    /// Appends findings for `design` to `issues`.
    fn check(&self, design: &str, profile: &ComplexityProfile, issues: &mut Vec<ValidationIssue>);
}

/// Ordered collection of [`ValidationRule`]s.
pub struct DesignValidator {
    rules: Vec<Box<dyn ValidationRule>>,
}

impl std::fmt::Debug for DesignValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.rules.iter().map(|r| r.name()).collect();
        f.debug_struct("DesignValidator").field("rules", &names).finish()
    }
}

impl DesignValidator {
    /// Builds the four built-in rules from `config`.
    pub fn new(config: &ValidatorConfig) -> Result<Self, ValidatorConfigError> {
        Ok(Self {
            rules: vec![
                Box::new(RequiredSectionsRule::new(config.required_sections.clone())),
                Box::new(DatabaseConsistencyRule::new(
                    &config.databases,
                    &config.primary_markers,
                    &config.secondary_markers,
                )?),
                Box::new(DisallowedTermsRule::new(&config.disallowed_terms)?),
                Box::new(ScopeAlignmentRule::new(config.scope, &config.overengineering_terms)?),
            ],
        })
    }

    /// A validator with no rules; every design is valid.
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Appends a rule after the existing ones.
    #[must_use]
    pub fn with_rule(mut self, rule: impl ValidationRule + 'static) -> Self {
        self.rules.push(Box::new(rule));
        self
    }

    /// Validates `design` against the depth of `profile`.
    pub fn validate(&self, design: &str, profile: &ComplexityProfile) -> ValidationReport {
        let mut checks = BTreeMap::new();
        let mut issues = Vec::new();
        for rule in &self.rules {
            let before = issues.len();
            rule.check(design, profile, &mut issues);
            let status = if issues.len() == before {
                CheckStatus::Pass
            } else {
                CheckStatus::Fail
            };
            checks.insert(rule.name().to_string(), status);
        }
        let report = ValidationReport::from_parts(checks, issues);
        debug!(
            issues = report.issues.len(),
            is_valid = report.is_valid,
            "Design validated"
        );
        report
    }

    /// Returns `true` if some rule can produce `code`.
    ///
    /// Codes not detected by any rule (e.g. review findings) cannot be confirmed
    /// resolved by re-validation.
    pub fn detects(&self, code: &IssueCode) -> bool {
        self.rules.iter().any(|r| r.owns(code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Confidence;

    fn profile(depth: DepthLevel) -> ComplexityProfile {
        let score = match depth {
            DepthLevel::Minimal => 2.0,
            DepthLevel::Standard => 6.0,
            DepthLevel::Detailed => 15.0,
        };
        ComplexityProfile::from_score(score, Confidence::certain(), "test")
    }

    fn filler(words: usize) -> String {
        vec!["lorem"; words].join(" ")
    }

    fn valid_minimal_design() -> String {
        format!(
            "# Overview\n\nA small note-taking service. {}\n\n# Architecture\n\n\
             A single web process backed by PostgreSQL as the primary database.\n",
            filler(80)
        )
    }

    fn validator() -> DesignValidator {
        DesignValidator::new(&ValidatorConfig::default()).unwrap()
    }

    #[test]
    fn valid_design_has_no_issues() {
        let report = validator().validate(&valid_minimal_design(), &profile(DepthLevel::Minimal));
        assert!(report.is_valid, "{:?}", report.issues);
        assert!(report.issues.is_empty());
        assert_eq!(report.checks.len(), 4);
        assert!(report.checks.values().all(|s| *s == CheckStatus::Pass));
    }

    #[test]
    fn validation_is_deterministic() {
        let design = "# Overview\nUses python 2 and kubernetes.";
        let p = profile(DepthLevel::Minimal);
        assert_eq!(validator().validate(design, &p), validator().validate(design, &p));
    }

    #[test]
    fn two_primary_databases_are_flagged() {
        let design = format!(
            "{}\nMongoDB is the primary datastore for user profiles.\n",
            valid_minimal_design()
        );
        let report = validator().validate(&design, &profile(DepthLevel::Minimal));
        let issue = report
            .issues
            .iter()
            .find(|i| i.code.as_str() == "consistency.multiple_databases")
            .unwrap();
        assert!(issue.auto_correctable);
        assert_eq!(issue.severity, Severity::Error);
        assert!(!report.is_valid);
        assert!(report.needs_correction());
        assert_eq!(report.checks["database_consistency"], CheckStatus::Fail);
    }

    #[test]
    fn missing_sections_depend_on_depth() {
        let design = valid_minimal_design();
        let minimal = validator().validate(&design, &profile(DepthLevel::Minimal));
        assert!(minimal.issues.is_empty());

        let standard = validator().validate(&design, &profile(DepthLevel::Standard));
        let codes = standard.codes();
        assert!(codes.contains(&IssueCode::from_static("structure.missing_section.data_model")));
        assert!(codes.contains(&IssueCode::from_static("structure.missing_section.testing")));
        assert!(!codes.contains(&IssueCode::from_static("structure.missing_section.security")));
    }

    #[test]
    fn warnings_do_not_invalidate() {
        let design = format!("{}\nDates are formatted with Moment.js.\n", valid_minimal_design());
        let report = validator().validate(&design, &profile(DepthLevel::Minimal));
        assert!(report.is_valid);
        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.issues[0].code.as_str(), "dependency.deprecated.moment_js");
    }

    #[test]
    fn detects_reports_rule_ownership() {
        let v = validator();
        assert!(v.detects(&IssueCode::from_static("consistency.multiple_databases")));
        assert!(v.detects(&IssueCode::from_static("structure.missing_section.overview")));
        assert!(!v.detects(&IssueCode::from_static("review.hallucination.made_up_api")));
    }

    struct ForbidTodo;

    impl ValidationRule for ForbidTodo {
        fn name(&self) -> &str {
            "no_todo"
        }

        fn owns(&self, code: &IssueCode) -> bool {
            code.as_str() == "content.todo"
        }

        fn check(&self, design: &str, _: &ComplexityProfile, issues: &mut Vec<ValidationIssue>) {
            if design.contains("TODO") {
                issues.push(ValidationIssue::new(
                    IssueCode::from_static("content.todo"),
                    Severity::Error,
                    "design contains TODO markers",
                ));
            }
        }
    }

    #[test]
    fn custom_rules_extend_validator() {
        let v = validator().with_rule(ForbidTodo);
        let design = format!("{}\nTODO: decide caching.\n", valid_minimal_design());
        let report = v.validate(&design, &profile(DepthLevel::Minimal));
        assert!(!report.is_valid);
        assert_eq!(report.checks["no_todo"], CheckStatus::Fail);
    }

    #[test]
    fn report_deduplicates_codes() {
        let code = IssueCode::from_static("scope.too_brief");
        let issues = vec![
            ValidationIssue::new(code.clone(), Severity::Warning, "a"),
            ValidationIssue::new(code, Severity::Warning, "b"),
        ];
        let report = ValidationReport::from_parts(BTreeMap::new(), issues);
        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.issues[0].message, "a");
    }
}
