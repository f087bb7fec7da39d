//! Template interpolation for dialogue strings and definitions
//!
//! Authored templates write substitution points as `${expr}`; the
//! compiler numbers them positionally. Rendering is two steps:
//! unescaped `${expr}` collapses to `{expr}`, then escaped `\${expr}`
//! becomes a literal `${expr}`. Positional `{i}` markers are finally
//! replaced with the rendered argument values. Braces not preceded by
//! `$` pass through untouched.

use regex::Regex;

use crate::value::Value;

/// Collapse `${…}` markers, honouring the `\$` escape.
pub fn transform(template: &str) -> String {
    // No lookbehind in the regex crate: capture the preceding character
    // (or start of string) and keep it in the replacement.
    let unescaped = Regex::new(r"(^|[^\\])\$\{([^{}]*)\}").expect("template regex must compile");
    let escaped = Regex::new(r"\\\$\{([^{}]*)\}").expect("template regex must compile");

    // A marker's closing brace can directly precede the next marker, so
    // replace_all (non-overlapping) is applied until fixpoint.
    let mut text = template.to_string();
    loop {
        let next = unescaped.replace_all(&text, "$1{$2}").into_owned();
        if next == text {
            break;
        }
        text = next;
    }
    escaped.replace_all(&text, "$${$1}").into_owned()
}

/// Substitute positional `{i}` markers with rendered values.
/// Markers without a matching argument are left verbatim.
pub fn substitute(template: &str, args: &[Value]) -> String {
    let positional = Regex::new(r"\{(\d+)\}").expect("positional regex must compile");
    positional
        .replace_all(template, |caps: &regex::Captures<'_>| {
            match caps[1].parse::<usize>().ok().and_then(|i| args.get(i)) {
                Some(value) => value.to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Full render: transform then substitute.
pub fn render(template: &str, args: &[Value]) -> String {
    substitute(&transform(template), args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_unchanged() {
        assert_eq!(transform("no markers here"), "no markers here");
        assert_eq!(render("no markers here", &[]), "no markers here");
    }

    #[test]
    fn test_marker_collapses() {
        assert_eq!(transform("hi ${0}!"), "hi {0}!");
        assert_eq!(transform("${0}${1}"), "{0}{1}");
    }

    #[test]
    fn test_escape_preserved() {
        assert_eq!(transform(r"costs \${0} dollars"), "costs ${0} dollars");
        assert_eq!(render(r"costs \${0}", &[Value::Int(5)]), "costs ${0}");
    }

    #[test]
    fn test_plain_braces_untouched() {
        assert_eq!(transform("a {token} b"), "a {token} b");
        assert_eq!(render("a {token} b", &[Value::Int(1)]), "a {token} b");
    }

    #[test]
    fn test_substitution() {
        let args = [Value::Double(3.5), Value::from("world")];
        assert_eq!(render("${0} says ${1}", &args), "3.5 says world");
    }

    #[test]
    fn test_missing_argument_left_verbatim() {
        assert_eq!(render("${0} and ${3}", &[Value::Int(1)]), "1 and {3}");
    }

    #[test]
    fn test_undefined_renders_empty() {
        assert_eq!(render("[${0}]", &[Value::Undefined]), "[]");
    }
}
