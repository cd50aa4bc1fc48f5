//! Prompt composition for the selection actions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Summarize,
    Explain,
    Simplify,
}

const PREFIXES: &[(ActionKind, &str, &str)] = &[
    (ActionKind::Summarize, "summarize", "Summarize this: "),
    (ActionKind::Explain, "explain", "Explain this: "),
    (ActionKind::Simplify, "simplify", "Simplify this: "),
];

impl ActionKind {
    pub fn prefix(&self) -> &'static str {
        PREFIXES
            .iter()
            .find(|(kind, _, _)| kind == self)
            .map_or("", |(_, _, prefix)| prefix)
    }

    pub fn name(&self) -> &'static str {
        PREFIXES
            .iter()
            .find(|(kind, _, _)| kind == self)
            .map_or("", |(_, name, _)| name)
    }

    /// Prompt text for running this action on a selection.
    pub fn apply(&self, selection: &str) -> String {
        format!("{}{}", self.prefix(), selection)
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown action: {0}")]
pub struct UnknownAction(String);

impl FromStr for ActionKind {
    type Err = UnknownAction;

    /// Accepts the menu ids (`summarize`) and the prefill message types
    /// (`prefillSummarize`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        let name = lower.strip_prefix("prefill").unwrap_or(&lower);
        PREFIXES
            .iter()
            .find(|(_, n, _)| *n == name)
            .map(|(kind, _, _)| *kind)
            .ok_or_else(|| UnknownAction(s.to_string()))
    }
}

/// Free-form question about a selection.
pub fn compose_with_selection(selection: &str, question: &str) -> String {
    if selection.trim().is_empty() {
        return question.to_string();
    }
    format!("Given the following text: \"{selection}\"\n\n{question}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes() {
        assert_eq!(ActionKind::Summarize.prefix(), "Summarize this: ");
        assert_eq!(ActionKind::Explain.prefix(), "Explain this: ");
        assert_eq!(ActionKind::Simplify.prefix(), "Simplify this: ");
    }

    #[test]
    fn apply_prepends_prefix() {
        assert_eq!(ActionKind::Explain.apply("entropy"), "Explain this: entropy");
    }

    #[test]
    fn parse_menu_ids_and_prefill_types() {
        assert_eq!("summarize".parse::<ActionKind>().unwrap(), ActionKind::Summarize);
        assert_eq!("prefillSummarize".parse::<ActionKind>().unwrap(), ActionKind::Summarize);
        assert_eq!("Simplify".parse::<ActionKind>().unwrap(), ActionKind::Simplify);
        assert!("translate".parse::<ActionKind>().is_err());
    }

    #[test]
    fn display_roundtrips_through_from_str() {
        for kind in [ActionKind::Summarize, ActionKind::Explain, ActionKind::Simplify] {
            assert_eq!(kind.to_string().parse::<ActionKind>().unwrap(), kind);
        }
    }

    #[test]
    fn compose_quotes_selection() {
        let p = compose_with_selection("The cat sat.", "Who sat?");
        assert_eq!(p, "Given the following text: \"The cat sat.\"\n\nWho sat?");
    }

    #[test]
    fn compose_without_selection_is_question() {
        assert_eq!(compose_with_selection("  ", "Why?"), "Why?");
    }
}
