//! Prompt assembly.
//!
//! Prompts are plain text sections; template rendering proper happens outside
//! the pipeline, keyed by the [`TemplateId`] sent with every request.

use std::fmt::Write;

use pipeline::{
    ComplexityProfile, CorrectionRequest, DepthLevel, KnownRisk, Stage, TemplateId,
    ValidationReport,
};

/// Template variant for `stage` at `depth`: `<stage>/<depth>`.
pub fn template_for(stage: Stage, depth: DepthLevel) -> TemplateId {
    TemplateId::variant(stage, depth)
}

fn profile_section(out: &mut String, profile: &ComplexityProfile) {
    let _ = writeln!(out, "## Complexity profile");
    let _ = writeln!(out, "- score: {:.1} / 20", profile.score);
    let _ = writeln!(out, "- depth: {}", profile.depth_level);
    let _ = writeln!(out, "- phases: {}", profile.estimated_phase_count);
    for (factor, severity) in &profile.complexity_factors {
        let _ = writeln!(out, "- factor {factor}: {severity}");
    }
    out.push('\n');
}

/// Asks for a JSON complexity profile.
pub fn complexity(interview: &str) -> String {
    format!(
        "Estimate the complexity of the project described below.\n\
         Reply with one JSON object with the fields score (0-20), estimated_phase_count (3-15), \
         depth_level (minimal|standard|detailed), confidence (0-1), rationale, \
         complexity_factors (object), follow_up_questions (array) and hidden_risks (array).\n\n\
         ## Interview\n{interview}\n"
    )
}

/// Asks for the design document.
pub fn design(interview: &str, profile: &ComplexityProfile) -> String {
    let mut out = String::from(
        "Write a design document in markdown for the project below. Use one `#` heading per section.\n\n",
    );
    profile_section(&mut out, profile);
    let _ = write!(out, "## Interview\n{interview}\n");
    out
}

/// Asks for a JSON sanity review of the design.
pub fn review(design: &str, report: &ValidationReport, profile: &ComplexityProfile) -> String {
    let mut out = String::from(
        "Review the design below for fabricated claims and unstated risks.\n\
         Reply with one JSON object with the fields confidence (0-1), overall_assessment \
         (sound|sound_with_concerns|problematic), hallucinations (array of {claim, reason}) \
         and risks (array of strings).\n\n",
    );
    profile_section(&mut out, profile);
    if !report.issues.is_empty() {
        let _ = writeln!(out, "## Known rule violations");
        for issue in &report.issues {
            let _ = writeln!(out, "- {}: {}", issue.code, issue.message);
        }
        out.push('\n');
    }
    let _ = write!(out, "## Design\n{design}\n");
    out
}

/// Asks for a corrected design that fixes only the listed issues.
pub fn correction(request: &CorrectionRequest<'_>) -> String {
    let mut out = format!(
        "Correction pass {}. Fix ONLY the issues listed below; change nothing else.\n\
         Reply with the full corrected design, then a fenced ```json block holding an array of \
         {{issue_code, action, before, after}} describing each edit.\n\n## Issues\n",
        request.iteration
    );
    for issue in request.issues {
        let _ = write!(out, "- {} ({}): {}", issue.code, issue.severity, issue.message);
        if let Some(suggestion) = &issue.suggestion {
            let _ = write!(out, " Suggestion: {suggestion}");
        }
        if let Some(location) = &issue.location {
            let _ = write!(out, " [{location}]");
        }
        out.push('\n');
    }
    out.push('\n');
    profile_section(&mut out, request.profile);
    let _ = write!(out, "## Design\n{}\n", request.design);
    out
}

/// Asks for the development plan.
pub fn devplan(interview: &str, profile: &ComplexityProfile, design: &str) -> String {
    let mut out = format!(
        "Write a development plan with exactly {} numbered phases (`## Phase N: title`).\n\n",
        profile.estimated_phase_count
    );
    profile_section(&mut out, profile);
    let _ = write!(out, "## Interview\n{interview}\n\n## Design\n{design}\n");
    out
}

/// Asks for the detailed document of one phase.
pub fn phase(profile: &ComplexityProfile, design: &str, devplan: &str, number: u32) -> String {
    let mut out = format!(
        "Expand phase {number} of {} from the development plan into step-by-step tasks \
         with acceptance criteria.\n\n",
        profile.estimated_phase_count
    );
    profile_section(&mut out, profile);
    let _ = write!(out, "## Design\n{design}\n\n## Development plan\n{devplan}\n");
    out
}

/// Asks for the handoff document.
pub fn handoff(
    profile: &ComplexityProfile,
    design: &str,
    devplan: &str,
    phase_count: usize,
    risks: &[KnownRisk],
) -> String {
    let mut out = format!(
        "Write a handoff document for the team taking over this project. \
         The plan has {phase_count} expanded phases.\n\n"
    );
    profile_section(&mut out, profile);
    if !risks.is_empty() {
        let _ = writeln!(out, "## Risks to mention");
        for risk in risks {
            let _ = writeln!(out, "- {}", risk.description);
        }
        out.push('\n');
    }
    let _ = write!(out, "## Design\n{design}\n\n## Development plan\n{devplan}\n");
    out
}

#[cfg(test)]
mod tests {
    use pipeline::{Confidence, IssueCode, Severity, ValidationIssue};

    use super::*;

    #[test]
    fn template_names_stage_and_depth() {
        assert_eq!(
            template_for(Stage::PhaseExpansion, DepthLevel::Detailed).as_str(),
            "phase_expansion/detailed"
        );
    }

    #[test]
    fn correction_prompt_lists_only_given_issues() {
        let profile = ComplexityProfile::from_score(5.0, Confidence::certain(), "r");
        let issues = vec![ValidationIssue::new(
            IssueCode::from_static("consistency.multiple_databases"),
            Severity::Error,
            "Two primary databases",
        )
        .correctable()
        .with_suggestion("Keep one")];
        let prompt = correction(&CorrectionRequest {
            design: "# Overview",
            issues: &issues,
            profile: &profile,
            iteration: 2,
        });
        assert!(prompt.starts_with("Correction pass 2."));
        assert!(prompt.contains("- consistency.multiple_databases (error): Two primary databases Suggestion: Keep one"));
    }
}
