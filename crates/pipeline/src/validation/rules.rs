//! Built-in validation rules.

use regex::{Regex, RegexBuilder};

use super::{
    DatabaseName, DisallowedTerm, ScopeRanges, SectionRequirement, TermCategory, ValidationIssue,
    ValidationRule, ValidatorConfigError,
};
use crate::{ComplexityProfile, DepthLevel, IssueCode, Severity};

// ---------------------------------------------------------------------------
// Term matching
// ---------------------------------------------------------------------------

/// Case-insensitive matcher for a set of literal terms, honouring word
/// boundaries on both sides regardless of the characters the terms contain.
#[derive(Debug, Clone)]
struct TermMatcher {
    regex: Option<Regex>,
}

impl TermMatcher {
    fn new(terms: &[String]) -> Result<Self, ValidatorConfigError> {
        let mut sorted: Vec<&str> = terms
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .collect();
        if sorted.is_empty() {
            return Ok(Self { regex: None });
        }
        // Leftmost-first alternation: longer spellings must win over prefixes.
        sorted.sort_by_key(|t| std::cmp::Reverse(t.len()));
        let pattern = sorted
            .iter()
            .map(|t| regex::escape(t))
            .collect::<Vec<_>>()
            .join("|");
        let regex = RegexBuilder::new(&pattern)
            .case_insensitive(true)
            .build()
            .map_err(|source| ValidatorConfigError {
                term: sorted.join(", "),
                source,
            })?;
        Ok(Self { regex: Some(regex) })
    }

    /// Byte offsets and text of every whole-word match in `text`.
    fn matches<'t>(&self, text: &'t str) -> Vec<(usize, &'t str)> {
        let Some(regex) = &self.regex else {
            return Vec::new();
        };
        let bytes = text.as_bytes();
        regex
            .find_iter(text)
            .filter(|m| {
                let before_ok = m.start() == 0 || !is_word_byte(bytes[m.start() - 1]);
                let after_ok = m.end() == bytes.len() || !is_word_byte(bytes[m.end()]);
                before_ok && after_ok
            })
            .map(|m| (m.start(), m.as_str()))
            .collect()
    }

    fn is_match(&self, text: &str) -> bool {
        !self.matches(text).is_empty()
    }
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Splits a line into sentences at `.`, `;`, `!` or `?` followed by whitespace
/// or end of line. Dots inside names such as `moment.js` do not split.
fn sentences(line: &str) -> Vec<&str> {
    let bytes = line.as_bytes();
    let mut out = Vec::new();
    let mut start = 0;
    for (i, b) in bytes.iter().enumerate() {
        let terminator = matches!(b, b'.' | b';' | b'!' | b'?');
        let boundary = i + 1 == bytes.len() || bytes[i + 1].is_ascii_whitespace();
        if terminator && boundary {
            out.push(&line[start..=i]);
            start = i + 1;
        }
    }
    if start < line.len() {
        out.push(&line[start..]);
    }
    out
}

// ---------------------------------------------------------------------------
// required_sections
// ---------------------------------------------------------------------------

/// Checks that every section required at the profile's depth has a heading.
#[derive(Debug, Clone)]
pub struct RequiredSectionsRule {
    sections: Vec<SectionRequirement>,
}

impl RequiredSectionsRule {
    /// Creates the rule.
    pub fn new(sections: Vec<SectionRequirement>) -> Self {
        Self { sections }
    }
}

impl ValidationRule for RequiredSectionsRule {
    fn name(&self) -> &str {
        "required_sections"
    }

    fn owns(&self, code: &IssueCode) -> bool {
        code.has_prefix("structure.missing_section")
    }

    fn check(&self, design: &str, profile: &ComplexityProfile, issues: &mut Vec<ValidationIssue>) {
        let headings: Vec<String> = design
            .lines()
            .map(str::trim_start)
            .filter(|l| l.starts_with('#'))
            .map(|l| l.trim_start_matches('#').trim().to_lowercase())
            .collect();

        for section in &self.sections {
            if profile.depth_level < section.min_depth {
                continue;
            }
            let present = section.aliases.iter().any(|alias| {
                let alias = alias.to_lowercase();
                headings.iter().any(|h| h.contains(&alias))
            });
            if present {
                continue;
            }
            let title = section
                .aliases
                .first()
                .cloned()
                .unwrap_or_else(|| section.key.clone());
            issues.push(
                ValidationIssue::new(
                    IssueCode::qualified("structure.missing_section", &section.key),
                    Severity::Error,
                    format!("Design has no '{title}' section"),
                )
                .correctable()
                .with_suggestion(format!("Add a '## {title}' section")),
            );
        }
    }
}

// ---------------------------------------------------------------------------
// database_consistency
// ---------------------------------------------------------------------------

/// Flags designs declaring more than one primary datastore.
///
/// Within a sentence, each primary marker claims the nearest datastore
/// together with every datastore conjoined to it (`A and B`, `A, B`, `A/B`).
/// A datastore closer to a secondary marker (`cache`, `replica`, ...) than to
/// any primary marker is never claimed.
#[derive(Debug, Clone)]
pub struct DatabaseConsistencyRule {
    databases: Vec<(String, TermMatcher)>,
    markers: TermMatcher,
    secondary: TermMatcher,
}

/// One datastore name found in a sentence.
#[derive(Debug, Clone, Copy)]
struct Mention<'a> {
    start: usize,
    end: usize,
    name: &'a str,
}

/// True when `between` holds only list punctuation and conjunctions.
fn conjoined(between: &str) -> bool {
    between
        .split(|c: char| c.is_whitespace() || matches!(c, ',' | '/' | '&'))
        .filter(|word| !word.is_empty())
        .all(|word| word.eq_ignore_ascii_case("and") || word.eq_ignore_ascii_case("both"))
}

fn closest(points: &[usize], at: usize) -> Option<usize> {
    points.iter().map(|p| p.abs_diff(at)).min()
}

impl DatabaseConsistencyRule {
    /// Compiles the datastore names and the primary and secondary markers.
    pub fn new(
        databases: &[DatabaseName],
        primary_markers: &[String],
        secondary_markers: &[String],
    ) -> Result<Self, ValidatorConfigError> {
        let databases = databases
            .iter()
            .map(|d| Ok((d.canonical.clone(), TermMatcher::new(&d.patterns)?)))
            .collect::<Result<Vec<_>, ValidatorConfigError>>()?;
        Ok(Self {
            databases,
            markers: TermMatcher::new(primary_markers)?,
            secondary: TermMatcher::new(secondary_markers)?,
        })
    }

    /// Datastore mentions in `sentence`, in order of appearance.
    fn mentions<'a>(&'a self, sentence: &str) -> Vec<Mention<'a>> {
        let mut found: Vec<Mention<'a>> = self
            .databases
            .iter()
            .flat_map(|(name, matcher)| {
                matcher.matches(sentence).into_iter().map(move |(start, text)| Mention {
                    start,
                    end: start + text.len(),
                    name: name.as_str(),
                })
            })
            .collect();
        found.sort_by_key(|m| m.start);
        found
    }

    /// Datastores `sentence` declares primary, in order of first claim.
    fn primaries<'a>(&'a self, sentence: &str) -> Vec<&'a str> {
        let primary_at: Vec<usize> = self.markers.matches(sentence).into_iter().map(|(at, _)| at).collect();
        if primary_at.is_empty() {
            return Vec::new();
        }
        let secondary_at: Vec<usize> = self.secondary.matches(sentence).into_iter().map(|(at, _)| at).collect();
        let is_secondary = |m: &Mention<'_>| match (closest(&secondary_at, m.start), closest(&primary_at, m.start)) {
            (Some(secondary), Some(primary)) => secondary < primary,
            _ => false,
        };

        let mut runs: Vec<Vec<Mention<'a>>> = Vec::new();
        for mention in self.mentions(sentence) {
            match runs.last_mut() {
                Some(run)
                    if run
                        .last()
                        .and_then(|prev| sentence.get(prev.end..mention.start))
                        .is_some_and(conjoined) =>
                {
                    run.push(mention)
                }
                _ => runs.push(vec![mention]),
            }
        }

        let mut claimed: Vec<&'a str> = Vec::new();
        for marker in &primary_at {
            let nearest = runs
                .iter()
                .filter_map(|run| {
                    run.iter()
                        .filter(|m| !is_secondary(m))
                        .map(|m| m.start.abs_diff(*marker))
                        .min()
                        .map(|distance| (distance, run))
                })
                .min_by_key(|(distance, _)| *distance);
            let Some((_, run)) = nearest else {
                continue;
            };
            for mention in run.iter().filter(|m| !is_secondary(m)) {
                if !claimed.contains(&mention.name) {
                    claimed.push(mention.name);
                }
            }
        }
        claimed
    }
}

impl ValidationRule for DatabaseConsistencyRule {
    fn name(&self) -> &str {
        "database_consistency"
    }

    fn owns(&self, code: &IssueCode) -> bool {
        code.has_prefix("consistency.multiple_databases")
    }

    fn check(&self, design: &str, _profile: &ComplexityProfile, issues: &mut Vec<ValidationIssue>) {
        let mut primaries: Vec<(&str, usize)> = Vec::new();
        for (index, line) in design.lines().enumerate() {
            for sentence in sentences(line) {
                for name in self.primaries(sentence) {
                    if !primaries.iter().any(|(n, _)| *n == name) {
                        primaries.push((name, index + 1));
                    }
                }
            }
        }
        if primaries.len() < 2 {
            return;
        }

        let names: Vec<&str> = primaries.iter().map(|(n, _)| *n).collect();
        let lines: Vec<String> = primaries.iter().map(|(_, l)| l.to_string()).collect();
        issues.push(
            ValidationIssue::new(
                IssueCode::from_static("consistency.multiple_databases"),
                Severity::Error,
                format!(
                    "Multiple primary datastores declared for the same responsibility: {}",
                    names.join(", ")
                ),
            )
            .correctable()
            .with_suggestion(format!(
                "Keep {} as the single primary datastore and remove or demote the others",
                names[0]
            ))
            .at(format!("lines {}", lines.join(", "))),
        );
    }
}

// ---------------------------------------------------------------------------
// disallowed_terms
// ---------------------------------------------------------------------------

/// Flags deprecated dependencies and vendor-specific languages.
#[derive(Debug, Clone)]
pub struct DisallowedTermsRule {
    terms: Vec<(DisallowedTerm, TermMatcher)>,
}

impl DisallowedTermsRule {
    /// Compiles one matcher per term.
    pub fn new(terms: &[DisallowedTerm]) -> Result<Self, ValidatorConfigError> {
        let terms = terms
            .iter()
            .map(|t| Ok((t.clone(), TermMatcher::new(std::slice::from_ref(&t.term))?)))
            .collect::<Result<Vec<_>, ValidatorConfigError>>()?;
        Ok(Self { terms })
    }
}

impl ValidationRule for DisallowedTermsRule {
    fn name(&self) -> &str {
        "disallowed_terms"
    }

    fn owns(&self, code: &IssueCode) -> bool {
        code.has_prefix("dependency.deprecated") || code.has_prefix("language.vendor_specific")
    }

    fn check(&self, design: &str, _profile: &ComplexityProfile, issues: &mut Vec<ValidationIssue>) {
        for (term, matcher) in &self.terms {
            let Some(line) = design.lines().position(|l| matcher.is_match(l)) else {
                continue;
            };
            let (base, severity, message) = match term.category {
                TermCategory::Deprecated => (
                    "dependency.deprecated",
                    Severity::Warning,
                    format!("Design relies on deprecated dependency '{}'", term.term),
                ),
                TermCategory::VendorSpecific => (
                    "language.vendor_specific",
                    Severity::Error,
                    format!("Design uses vendor-specific language '{}'", term.term),
                ),
            };
            let mut issue = ValidationIssue::new(IssueCode::qualified(base, &term.term), severity, message)
                .correctable()
                .at(format!("line {}", line + 1));
            if let Some(suggestion) = &term.suggestion {
                issue = issue.with_suggestion(suggestion.clone());
            }
            issues.push(issue);
        }
    }
}

// ---------------------------------------------------------------------------
// scope_alignment
// ---------------------------------------------------------------------------

/// Compares document size and ambition with the declared depth level.
#[derive(Debug, Clone)]
pub struct ScopeAlignmentRule {
    ranges: ScopeRanges,
    overengineering: Vec<(String, TermMatcher)>,
}

impl ScopeAlignmentRule {
    /// Compiles the over-engineering vocabulary.
    pub fn new(ranges: ScopeRanges, overengineering: &[String]) -> Result<Self, ValidatorConfigError> {
        let overengineering = overengineering
            .iter()
            .map(|t| Ok((t.clone(), TermMatcher::new(std::slice::from_ref(t))?)))
            .collect::<Result<Vec<_>, ValidatorConfigError>>()?;
        Ok(Self {
            ranges,
            overengineering,
        })
    }
}

impl ValidationRule for ScopeAlignmentRule {
    fn name(&self) -> &str {
        "scope_alignment"
    }

    fn owns(&self, code: &IssueCode) -> bool {
        code.has_prefix("scope")
    }

    fn check(&self, design: &str, profile: &ComplexityProfile, issues: &mut Vec<ValidationIssue>) {
        let depth = profile.depth_level;
        let range = self.ranges.for_depth(depth);
        let words = design.split_whitespace().count();

        if words < range.min {
            issues.push(
                ValidationIssue::new(
                    IssueCode::from_static("scope.too_brief"),
                    Severity::Warning,
                    format!("Design has {words} words; a {depth} project needs at least {}", range.min),
                )
                .correctable()
                .with_suggestion("Expand the sections that lack concrete decisions"),
            );
        } else if words > range.max {
            issues.push(
                ValidationIssue::new(
                    IssueCode::from_static("scope.too_elaborate"),
                    Severity::Warning,
                    format!("Design has {words} words; a {depth} project needs at most {}", range.max),
                )
                .correctable()
                .with_suggestion("Remove detail that does not change implementation decisions"),
            );
        }

        if depth != DepthLevel::Minimal {
            return;
        }
        for (term, matcher) in &self.overengineering {
            let Some(line) = design.lines().position(|l| matcher.is_match(l)) else {
                continue;
            };
            issues.push(
                ValidationIssue::new(
                    IssueCode::qualified("scope.overengineered", term),
                    Severity::Warning,
                    format!("'{term}' is heavy for a minimal-complexity project"),
                )
                .correctable()
                .with_suggestion("Prefer the simplest option that meets the requirements")
                .at(format!("line {}", line + 1)),
            );
        }
    }
}
