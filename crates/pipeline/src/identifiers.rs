//! Newtype domain identifiers.
//!
//! Every domain concept that has an identity is represented as a distinct newtype
//! wrapping a primitive. This prevents accidentally interchanging, for example,
//! an [`IssueCode`] with a [`TemplateId`] even though both are strings under the
//! hood.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Macro for String-wrapped newtypes.
// Generates: struct, new() returning Option<Self>, as_str(), Display.
// ---------------------------------------------------------------------------
macro_rules! string_id {
    (
        $(#[$attr:meta])*
        $name:ident
    ) => {
        $(#[$attr])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            /// Creates a new identifier, returning `None` if the value is empty.
            pub fn new(value: impl Into<String>) -> Option<Self> {
                let v = value.into();
                if v.is_empty() { None } else { Some(Self(v)) }
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Identifiers: UUID-backed (internally generated)
// ---------------------------------------------------------------------------

/// Identifies a single pipeline run from interview through handoff.
///
/// Generated fresh for every new run and reused verbatim when the run is
/// resumed; propagated through spans and checkpoints so all activity for a run
/// can be correlated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunId(Uuid);

impl RunId {
    /// Generates a new random run identifier.
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a [`RunId`] from an existing UUID (e.g. deserialised from state).
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Parses a run identifier from its hyphenated string form.
    ///
    /// Returns `None` if `value` is not a valid UUID.
    pub fn parse(value: &str) -> Option<Self> {
        Uuid::parse_str(value.trim()).ok().map(Self)
    }

    /// Returns the underlying [`Uuid`].
    pub fn as_uuid(self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Identifiers: string-backed
// ---------------------------------------------------------------------------

string_id! {
    /// Stable code identifying a class of validation issue
    /// (e.g. `"consistency.multiple_databases"`).
    ///
    /// Codes are dot-separated `<category>.<name>[.<qualifier>]` strings and
    /// are the identity used to de-duplicate issues across correction
    /// iterations.
    IssueCode
}

impl IssueCode {
    /// Wraps a non-empty code literal.
    pub fn from_static(code: &'static str) -> Self {
        debug_assert!(!code.is_empty());
        Self(code.to_string())
    }

    /// Builds `<base>.<slug(qualifier)>`.
    pub fn qualified(base: &str, qualifier: &str) -> Self {
        Self(format!("{base}.{}", slug(qualifier)))
    }

    /// Returns `true` if this code equals `prefix` or starts with `prefix.`.
    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.0 == prefix
            || (self.0.len() > prefix.len()
                && self.0.starts_with(prefix)
                && self.0.as_bytes()[prefix.len()] == b'.')
    }
}

string_id! {
    /// Identifies the prompt template variant used for a request
    /// (e.g. `"design/detailed"`).
    ///
    /// Template rendering lives outside the core; the id is forwarded to
    /// clients so an external renderer can pick the matching template.
    TemplateId
}

impl TemplateId {
    /// `<stage>/<depth>`, the variant every LLM request is tagged with.
    pub fn variant(stage: crate::Stage, depth: crate::DepthLevel) -> Self {
        Self(format!("{}/{}", stage.as_str(), depth.as_str()))
    }
}

/// Produces a lowercase `snake_case` slug suitable for an issue-code qualifier.
///
/// Non-alphanumeric runs collapse into a single underscore; leading and
/// trailing underscores are trimmed. Returns `"unnamed"` for input with no
/// alphanumeric characters.
pub fn slug(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut pending_sep = false;
    for ch in value.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(ch.to_ascii_lowercase());
        } else {
            pending_sep = true;
        }
    }
    if out.is_empty() {
        "unnamed".to_string()
    } else {
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_round_trips_through_display() {
        let id = RunId::new_random();
        assert_eq!(RunId::parse(&id.to_string()), Some(id));
        assert_eq!(RunId::parse("not-a-uuid"), None);
    }

    #[test]
    fn issue_code_prefix_matches_on_segment_boundary() {
        let code = IssueCode::new("structure.missing_section.architecture").unwrap();
        assert!(code.has_prefix("structure.missing_section"));
        assert!(code.has_prefix("structure"));
        assert!(!code.has_prefix("structure.missing"));
        assert!(!code.has_prefix("scope"));
    }

    #[test]
    fn slug_collapses_punctuation() {
        assert_eq!(slug("moment.js"), "moment_js");
        assert_eq!(slug("  Python 2 "), "python_2");
        assert_eq!(slug("--"), "unnamed");
    }
}
