//! Property tests: the front end is a pure function of its input.

use proptest::prelude::*;
use streetrace_syntax::parser::parse;

proptest! {
    /// Lexing and parsing never panic, whatever bytes arrive.
    #[test]
    fn parse_never_panics(source in "\\PC{0,200}") {
        let _ = parse(&source);
    }

    /// Re-parsing identical input yields byte-identical AST nodes,
    /// positions included.
    #[test]
    fn parse_is_pure(name in "[a-z][a-z0-9_]{0,10}", value in "[a-zA-Z0-9 ]{0,20}") {
        let source = format!(
            "flow main:\n    ${name} = \"{value}\"\n    return ${name}\n"
        );
        let first = parse(&source);
        let second = parse(&source);
        match (first, second) {
            (Ok(a), Ok(b)) => {
                prop_assert_eq!(&a, &b);
                prop_assert_eq!(
                    serde_json::to_vec(&a).unwrap(),
                    serde_json::to_vec(&b).unwrap()
                );
            }
            (Err(a), Err(b)) => prop_assert_eq!(a, b),
            _ => prop_assert!(false, "parse results diverged"),
        }
    }
}

#[test]
fn spans_stay_inside_the_source() {
    let source = "\nmodel main = anthropic/claude-sonnet\n\nflow main:\n    $x = 1\n    return $x\n";
    let file = parse(source).expect("parse");
    let line_count = source.lines().count() as u32;
    for decl in &file.decls {
        let span = decl.span();
        assert!(span.line >= 1 && span.line <= line_count);
        assert!(span.end_line >= span.line && span.end_line <= line_count + 1);
        assert!(span.column >= 1);
    }
}
