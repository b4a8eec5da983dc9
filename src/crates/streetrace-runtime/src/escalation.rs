//! Escalation condition evaluation.
//!
//! Agents frequently wrap their sentinel answers in markdown (`**Done.**`),
//! so the `~` operator normalizes both sides before comparing: markdown
//! emphasis stripped, whitespace collapsed, uppercased, trailing punctuation
//! removed. The normalization set is part of the language contract.

use std::sync::OnceLock;

use regex::Regex;
use streetrace_compiler::workflow::EscalationSpec;
use streetrace_syntax::ast::EscalationOp;

fn whitespace_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("static regex"))
}

/// Normalize text for the `~` operator.
pub fn normalize(text: &str) -> String {
    let stripped = text.replace("**", "").replace("__", "").replace('*', "");
    let collapsed = whitespace_re().replace_all(&stripped, " ");
    collapsed
        .trim()
        .to_uppercase()
        .trim_end_matches(['.', ',', '!', '?', ':', ';'])
        .to_string()
}

/// Does `final_text` match the escalation condition?
pub fn matches(spec: &EscalationSpec, final_text: &str) -> bool {
    match spec.op {
        EscalationOp::Normalized => normalize(final_text) == normalize(&spec.value),
        EscalationOp::Eq => final_text == spec.value,
        EscalationOp::Ne => final_text != spec.value,
        EscalationOp::Contains => final_text.contains(&spec.value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(op: EscalationOp, value: &str) -> EscalationSpec {
        EscalationSpec {
            op,
            value: value.to_string(),
        }
    }

    #[test]
    fn test_normalize_strips_markdown_emphasis() {
        assert_eq!(normalize("**Done.**"), "DONE");
        assert_eq!(normalize("__done__"), "DONE");
        assert_eq!(normalize("*done*"), "DONE");
    }

    #[test]
    fn test_normalize_collapses_whitespace_and_case() {
        assert_eq!(normalize("  all \n  done  "), "ALL DONE");
        assert_eq!(normalize("Done!!"), "DONE");
        assert_eq!(normalize("done...?!"), "DONE");
    }

    #[test]
    fn test_normalized_match() {
        let s = spec(EscalationOp::Normalized, "DONE");
        assert!(matches(&s, "**Done.**"));
        assert!(matches(&s, "done"));
        assert!(matches(&s, " D O N E".replace(' ', "").as_str()));
        assert!(!matches(&s, "not done yet, but done-adjacent"));
    }

    #[test]
    fn test_exact_match_is_case_sensitive() {
        let s = spec(EscalationOp::Eq, "FATAL");
        assert!(matches(&s, "FATAL"));
        assert!(!matches(&s, "fatal"));
        assert!(!matches(&s, "FATAL "));
    }

    #[test]
    fn test_not_equal() {
        let s = spec(EscalationOp::Ne, "OK");
        assert!(matches(&s, "anything else"));
        assert!(!matches(&s, "OK"));
    }

    #[test]
    fn test_contains_is_case_sensitive_substring() {
        let s = spec(EscalationOp::Contains, "SKIP");
        assert!(matches(&s, "please SKIP_ME now"));
        assert!(!matches(&s, "please skip_me now"));
    }
}
