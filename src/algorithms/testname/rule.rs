//! Compiler for test name clustering rules.
//!
//! A rule pairs a regular expression over test names with a LIKE template.
//! `${name}` in the template is replaced by the LIKE-escaped text of the
//! named capture group and `$$` emits a literal `$`; everything else is
//! copied through as LIKE syntax. All parsing happens in [`compile`], so
//! [`TestNameMatcher::evaluate`] only runs the regex and concatenates.


use regex::Regex;

use crate::config::TestNameClusteringRule;
use crate::error::{Error, Result};
use crate::rules::lang::{escape_like, validate_like_pattern};

/// Matches `${name}`, `$$` and a lone `$`.
fn substitution_regex() -> &'static Regex {
    static_regex!(r"\$\{(\w+?)\}|\$\$?")
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    /// Text emitted as-is; already valid LIKE syntax.
    Literal(String),
    /// Index of a capture group whose text is escaped and emitted.
    Capture(usize),
}

/// A compiled test name rule.
#[derive(Debug, Clone)]
pub struct TestNameMatcher {
    name: String,
    regex: Regex,
    segments: Vec<Segment>,
}

/// Compiles a test name clustering rule into a matcher.
pub fn compile(rule: &TestNameClusteringRule) -> Result<TestNameMatcher> {
    let regex = Regex::new(&rule.pattern)
        .map_err(|err| Error::syntax(format!("parsing pattern: {err}")))?;
    let segments = compile_template(&regex, &rule.like_template)?;
    Ok(TestNameMatcher {
        name: rule.name.clone(),
        regex,
        segments,
    })
}

fn compile_template(regex: &Regex, template: &str) -> Result<Vec<Segment>> {
    let mut segments = Vec::new();
    let mut last = 0;
    for m in substitution_regex().captures_iter(template) {
        let Some(whole) = m.get(0) else { continue };
        push_literal(&mut segments, &template[last..whole.start()], last)?;
        last = whole.end();

        match whole.as_str() {
            "$$" => push_text(&mut segments, "$"),
            "$" => {
                return Err(Error::syntax_at(
                    "invalid use of the $ operator in like_template ('$' should be '$$' or '${name}')",
                    whole.start(),
                ));
            }
            _ => {
                let name = m.get(1).map_or("", |g| g.as_str());
                let index = regex
                    .capture_names()
                    .position(|n| n == Some(name))
                    .ok_or_else(|| {
                        Error::syntax_at(
                            format!(
                                "like_template refers to non-existent capture group ${{{name}}}"
                            ),
                            whole.start(),
                        )
                    })?;
                segments.push(Segment::Capture(index));
            }
        }
    }
    push_literal(&mut segments, &template[last..], last)?;
    Ok(segments)
}

fn push_literal(segments: &mut Vec<Segment>, literal: &str, offset: usize) -> Result<()> {
    if literal.is_empty() {
        return Ok(());
    }
    validate_like_pattern(literal).map_err(|err| match err {
        Error::Syntax { message, position } => Error::syntax_at(
            format!("like_template: {message}"),
            offset + position.unwrap_or(0),
        ),
        other => other,
    })?;
    push_text(segments, literal);
    Ok(())
}

fn push_text(segments: &mut Vec<Segment>, text: &str) {
    if let Some(Segment::Literal(prev)) = segments.last_mut() {
        prev.push_str(text);
    } else {
        segments.push(Segment::Literal(text.to_string()));
    }
}

impl TestNameMatcher {
    /// Name of the rule this matcher was compiled from.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the LIKE expression identifying the test name cluster, or
    /// `None` if the rule does not match `test_name`.
    #[must_use]
    pub fn evaluate(&self, test_name: &str) -> Option<String> {
        let caps = self.regex.captures(test_name)?;
        let mut out = String::with_capacity(test_name.len() + 8);
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Capture(index) => {
                    if let Some(m) = caps.get(*index) {
                        out.push_str(&escape_like(m.as_str()));
                    }
                }
            }
        }
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::lang::LikePattern;
    use proptest::prelude::*;

    fn rule(pattern: &str, like_template: &str) -> TestNameClusteringRule {
        TestNameClusteringRule {
            name: "Test".to_string(),
            pattern: pattern.to_string(),
            like_template: like_template.to_string(),
        }
    }

    fn eval(pattern: &str, template: &str, input: &str) -> Option<String> {
        compile(&rule(pattern, template))
            .unwrap_or_else(|e| panic!("compile {template:?}: {e}"))
            .evaluate(input)
    }

    #[test]
    fn blink_style_rule() {
        let pattern = r"^ninja://:blink_web_tests/(virtual/[^/]+/)?(?P<testname>([^/]+/)+[^/]+\.[a-zA-Z]+).*$";
        let template = "ninja://:blink\\_web\\_tests/%${testname}%";
        assert_eq!(
            eval(pattern, template, "ninja://:blink_web_tests/virtual/abc/folder/test-name.html?param=2"),
            Some("ninja://:blink\\_web\\_tests/%folder/test-name.html%".to_string())
        );
        assert_eq!(eval(pattern, template, "ninja://:other_tests/folder/a.html"), None);
    }

    #[test]
    fn escapes_captured_wildcards() {
        assert_eq!(
            eval("^(?P<testname>.*)$", "${testname}_%", r"_\%"),
            Some(r"\_\\\%_%".to_string())
        );
    }

    #[test]
    fn dollar_escapes() {
        assert_eq!(
            eval("^(?P<a>.*)$", "$$${a}$$", "x"),
            Some("$x$".to_string())
        );
        assert_eq!(eval("^(?P<a>x)(?P<b>y)?$", "${a}-${b}", "x"), Some("x-".to_string()));
    }

    #[test]
    fn lone_dollar_is_rejected() {
        let err = compile(&rule("^(?P<a>.*)$", "abc$def")).unwrap_err();
        assert!(err.is_syntax());
        assert!(err.to_string().contains("$ operator"), "{err}");
        assert!(compile(&rule("^(?P<a>.*)$", "${a}$")).is_err());
        assert!(compile(&rule("^(?P<a>.*)$", "${}")).is_err());
    }

    #[test]
    fn unknown_capture_group_is_rejected() {
        let err = compile(&rule("^(?P<testname>.*)$", "${other}")).unwrap_err();
        assert!(err.to_string().contains("non-existent capture group"), "{err}");
    }

    #[test]
    fn invalid_literal_segments_are_rejected() {
        assert!(compile(&rule("^(?P<a>.*)$", "abc\\")).is_err());
        assert!(compile(&rule("^(?P<a>.*)$", "abc\\${a}")).is_err());
        assert!(compile(&rule("^(?P<a>.*)$", "\\x${a}")).is_err());
        assert!(compile(&rule("^(?P<a>.*)$", "\\%${a}\\_")).is_ok());
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        assert!(compile(&rule("^(?P<a>.*$", "${a}")).is_err());
    }

    proptest! {
        #[test]
        fn pattern_match_implies_like_match(name in "[ -~]{0,40}", prefix in "[a-z:/]{0,8}") {
            let input = format!("{prefix}{name}");
            let escaped_prefix = escape_like(&prefix);
            let like = eval(
                &format!("^{}(?P<rest>.*)$", regex::escape(&prefix)),
                &format!("{escaped_prefix}${{rest}}"),
                &input,
            ).expect("pattern matches by construction");
            let compiled = LikePattern::new(&like).expect("generated LIKE is valid");
            prop_assert!(compiled.matches(&input));
        }

        #[test]
        fn captured_text_never_acts_as_wildcard(name in "[a-c%_\\\\]{1,12}") {
            let like = eval("^(?P<t>.*)$", "${t}", &name).expect("matches everything");
            let compiled = LikePattern::new(&like).expect("generated LIKE is valid");
            prop_assert!(compiled.matches(&name));
            // Same length, different text: an unescaped % or _ would let this match.
            let other: String = name.chars().map(|c| if c == 'a' { 'b' } else { 'a' }).collect();
            prop_assert!(!compiled.matches(&other));
        }
    }
}
