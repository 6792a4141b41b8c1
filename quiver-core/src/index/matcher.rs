//! Label matchers

use crate::{Labels, QuiverError, Result};
use regex::Regex;
use std::fmt;

/// Regexes that reduce to more literal alternatives than this are evaluated
/// as regexes instead of postings unions.
const MAX_LITERAL_ALTERNATIVES: usize = 20;

/// Matching operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchOp {
    /// `name="value"`
    Equal,
    /// `name!="value"`
    NotEqual,
    /// `name=~"regex"`
    Regex,
    /// `name!~"regex"`
    NotRegex,
}

impl fmt::Display for MatchOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            MatchOp::Equal => "=",
            MatchOp::NotEqual => "!=",
            MatchOp::Regex => "=~",
            MatchOp::NotRegex => "!~",
        };
        f.write_str(op)
    }
}

/// A compiled label matcher
///
/// A series without the label is treated as having the empty value, so
/// `name=""` selects series lacking `name` and `name!=""` requires it.
/// Regexes are anchored at both ends.
#[derive(Debug, Clone)]
pub struct Matcher {
    pub name: String,
    pub op: MatchOp,
    pub value: String,
    regex: Option<Regex>,
    /// Literal alternatives when the pattern is `lit1|lit2|...`
    literals: Option<Vec<String>>,
}

impl Matcher {
    /// Create a matcher, compiling regex patterns
    pub fn new(op: MatchOp, name: impl Into<String>, value: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let value = value.into();
        if name.is_empty() {
            return Err(QuiverError::InvalidMatcher("empty label name".into()));
        }

        let (regex, literals) = match op {
            MatchOp::Regex | MatchOp::NotRegex => {
                let regex = Regex::new(&format!("^(?:{})$", value)).map_err(|e| {
                    QuiverError::InvalidMatcher(format!("{}{}{:?}: {}", name, op, value, e))
                })?;
                (Some(regex), literal_alternatives(&value))
            }
            MatchOp::Equal | MatchOp::NotEqual => (None, None),
        };

        Ok(Self {
            name,
            op,
            value,
            regex,
            literals,
        })
    }

    pub fn equal(name: impl Into<String>, value: impl Into<String>) -> Result<Self> {
        Self::new(MatchOp::Equal, name, value)
    }

    pub fn not_equal(name: impl Into<String>, value: impl Into<String>) -> Result<Self> {
        Self::new(MatchOp::NotEqual, name, value)
    }

    pub fn regex(name: impl Into<String>, pattern: impl Into<String>) -> Result<Self> {
        Self::new(MatchOp::Regex, name, pattern)
    }

    pub fn not_regex(name: impl Into<String>, pattern: impl Into<String>) -> Result<Self> {
        Self::new(MatchOp::NotRegex, name, pattern)
    }

    /// Whether a label value (empty when the label is absent) matches
    pub fn matches_value(&self, value: &str) -> bool {
        match self.op {
            MatchOp::Equal => value == self.value,
            MatchOp::NotEqual => value != self.value,
            MatchOp::Regex => self.regex_matches(value),
            MatchOp::NotRegex => !self.regex_matches(value),
        }
    }

    /// Whether a series' labels satisfy this matcher
    pub fn matches(&self, labels: &Labels) -> bool {
        self.matches_value(labels.get(&self.name).unwrap_or(""))
    }

    /// A matcher that does not accept the empty value can only select
    /// series that carry the label, so it can seed a postings intersection.
    pub fn requires_label(&self) -> bool {
        !self.matches_value("")
    }

    /// Literal alternatives of a regex pattern, if it reduces to them
    pub fn literals(&self) -> Option<&[String]> {
        self.literals.as_deref()
    }

    fn regex_matches(&self, value: &str) -> bool {
        match (&self.literals, &self.regex) {
            (Some(literals), _) => literals.iter().any(|l| l == value),
            (None, Some(regex)) => regex.is_match(value),
            (None, None) => false,
        }
    }
}

impl PartialEq for Matcher {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.op == other.op && self.value == other.value
    }
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{:?}", self.name, self.op, self.value)
    }
}

/// Split `a|b|c` into literal alternatives
///
/// Returns `None` if any alternative contains regex syntax other than
/// escaped punctuation, or if there are too many alternatives.
fn literal_alternatives(pattern: &str) -> Option<Vec<String>> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut chars = pattern.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                let escaped = chars.next()?;
                if escaped.is_ascii_alphanumeric() {
                    // \d, \w, \b ... are classes or assertions
                    return None;
                }
                current.push(escaped);
            }
            '|' => out.push(std::mem::take(&mut current)),
            '.' | '+' | '*' | '?' | '(' | ')' | '[' | ']' | '{' | '}' | '^' | '$' => return None,
            c => current.push(c),
        }
        if out.len() > MAX_LITERAL_ALTERNATIVES {
            return None;
        }
    }
    out.push(current);

    if out.len() > MAX_LITERAL_ALTERNATIVES {
        return None;
    }
    out.sort_unstable();
    out.dedup();
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_alternatives() {
        assert_eq!(
            literal_alternatives("web|db|cache"),
            Some(vec!["cache".to_string(), "db".to_string(), "web".to_string()])
        );
        assert_eq!(literal_alternatives("a\\.b"), Some(vec!["a.b".to_string()]));
        assert_eq!(literal_alternatives("a|"), Some(vec!["".to_string(), "a".to_string()]));
        assert_eq!(literal_alternatives("web.*"), None);
        assert_eq!(literal_alternatives("\\d+"), None);
        assert_eq!(literal_alternatives("(a|b)"), None);

        let many = (0..30).map(|i| i.to_string()).collect::<Vec<_>>().join("|");
        assert_eq!(literal_alternatives(&many), None);
    }

    #[test]
    fn test_regex_is_anchored() {
        let m = Matcher::regex("host", "web").unwrap();
        assert!(m.matches_value("web"));
        assert!(!m.matches_value("web-1"));

        let m = Matcher::regex("host", "web-[0-9]+").unwrap();
        assert!(m.matches_value("web-12"));
        assert!(!m.matches_value("xweb-12"));
        assert!(m.literals().is_none());
    }

    #[test]
    fn test_empty_value_semantics() {
        let with_host = Labels::from_pairs([("__name__", "up"), ("host", "a")]);
        let without_host = Labels::from_pairs([("__name__", "up")]);

        let absent = Matcher::equal("host", "").unwrap();
        assert!(!absent.matches(&with_host));
        assert!(absent.matches(&without_host));
        assert!(!absent.requires_label());

        let present = Matcher::not_equal("host", "").unwrap();
        assert!(present.matches(&with_host));
        assert!(!present.matches(&without_host));
        assert!(present.requires_label());

        let optional = Matcher::regex("host", "a|").unwrap();
        assert!(optional.matches(&with_host));
        assert!(optional.matches(&without_host));
        assert!(!optional.requires_label());

        assert!(!Matcher::not_regex("host", ".*").unwrap().matches_value(""));
        assert!(Matcher::not_regex("host", "").unwrap().requires_label());
    }

    #[test]
    fn test_invalid_matchers() {
        assert!(matches!(
            Matcher::regex("host", "(unclosed"),
            Err(QuiverError::InvalidMatcher(_))
        ));
        assert!(matches!(
            Matcher::equal("", "x"),
            Err(QuiverError::InvalidMatcher(_))
        ));
    }
}
