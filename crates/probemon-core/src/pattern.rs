//! Glob-like patterns for filtering stat and log events by name.
//!
//! Syntax:
//! - `.` separates path segments and matches literally
//! - `*` before the end matches any run of non-dot characters
//! - a final `*` matches the rest of the string
//! - `[...]` character classes pass through verbatim
//! - `{a,b,c}` matches any one alternative
//! - `/regex/flags` is used as a raw regular expression

use regex::Regex;
use thiserror::Error;

/// Errors produced while compiling a pattern.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PatternError {
    #[error("Invalid pattern '{pattern}': {reason}")]
    Invalid { pattern: String, reason: String },
}

/// A compiled pattern.
#[derive(Debug, Clone)]
pub struct PatternMatcher {
    source: String,
    regex: Regex,
}

impl PatternMatcher {
    /// Returns true if `name` matches the pattern.
    pub fn is_match(&self, name: &str) -> bool {
        self.regex.is_match(name)
    }

    /// Returns the pattern text this matcher was compiled from.
    pub fn source(&self) -> &str {
        &self.source
    }
}

/// Compiles `pattern` into a matcher.
///
/// # Errors
///
/// `PatternError::Invalid` for unbalanced brackets/braces or a raw regex
/// that fails to compile.
pub fn compile(pattern: &str) -> Result<PatternMatcher, PatternError> {
    let expression = match raw_regex(pattern) {
        Some(raw) => raw,
        None => translate(pattern)?,
    };

    let regex = Regex::new(&expression).map_err(|e| PatternError::Invalid {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })?;

    Ok(PatternMatcher {
        source: pattern.to_string(),
        regex,
    })
}

/// Recognizes `/body/flags` and returns an inline-flagged expression.
fn raw_regex(pattern: &str) -> Option<String> {
    let rest = pattern.strip_prefix('/')?;
    let end = rest.rfind('/')?;
    let body = rest.get(..end)?;
    let flags: String = rest
        .get(end + 1..)?
        .chars()
        .filter(|c| matches!(c, 'i' | 'm' | 's' | 'x'))
        .collect();

    if flags.is_empty() {
        Some(body.to_string())
    } else {
        Some(format!("(?{flags}){body}"))
    }
}

fn translate(pattern: &str) -> Result<String, PatternError> {
    let invalid = |reason: &str| PatternError::Invalid {
        pattern: pattern.to_string(),
        reason: reason.to_string(),
    };

    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::from("^");
    let mut in_alternation = false;
    let mut i = 0;

    while let Some(&c) = chars.get(i) {
        match c {
            '*' if i + 1 == chars.len() => out.push_str(".*"),
            '*' => out.push_str("[^.]*"),
            '[' => {
                let close = chars
                    .iter()
                    .skip(i + 1)
                    .position(|&c| c == ']')
                    .ok_or_else(|| invalid("unterminated character class"))?;
                let class: String = chars.iter().skip(i).take(close + 2).collect();
                out.push_str(&class);
                i += close + 1;
            }
            '{' if !in_alternation => {
                in_alternation = true;
                out.push_str("(?:");
            }
            ',' if in_alternation => out.push('|'),
            '}' if in_alternation => {
                in_alternation = false;
                out.push(')');
            }
            '{' | '}' => return Err(invalid("nested or unbalanced braces")),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
        i += 1;
    }

    if in_alternation {
        return Err(invalid("unterminated alternation"));
    }

    out.push('$');
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_segments() {
        let m = compile("router.connections").unwrap();
        assert!(m.is_match("router.connections"));
        assert!(!m.is_match("routerXconnections"));
        assert!(!m.is_match("router.connections.extra"));
    }

    #[test]
    fn test_inner_star_stays_in_segment() {
        let m = compile("*.connections").unwrap();
        assert!(m.is_match("router.connections"));
        assert!(!m.is_match("a.b.connections"));
    }

    #[test]
    fn test_final_star_matches_rest() {
        let m = compile("router.*").unwrap();
        assert!(m.is_match("router.connections"));
        assert!(m.is_match("router.a.b.c"));
        assert!(!m.is_match("server.x"));
    }

    #[test]
    fn test_alternation() {
        let m = compile("{router,server}.errors").unwrap();
        assert!(m.is_match("router.errors"));
        assert!(m.is_match("server.errors"));
        assert!(!m.is_match("probe.errors"));
    }

    #[test]
    fn test_character_class() {
        let m = compile("disk[0-9].used").unwrap();
        assert!(m.is_match("disk3.used"));
        assert!(!m.is_match("diskA.used"));
    }

    #[test]
    fn test_raw_regex_with_flags() {
        let m = compile("/^ROUTER\\./i").unwrap();
        assert!(m.is_match("router.anything"));
        assert!(!m.is_match("server.router."));
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(compile("disk[0-9.used").is_err());
        assert!(compile("{a,b.c").is_err());
        assert!(compile("/(unclosed/").is_err());
    }
}
