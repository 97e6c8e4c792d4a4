//! Exception rules: operator-supplied URLs that must never be cached.

use regex::{Regex, RegexBuilder};
use tracing::warn;

use super::config::CacheConfig;

/// One exception line as entered by the operator.
#[derive(Debug, Clone)]
pub struct ExceptionRule {
    pattern: String,
    is_regex: bool,
    matcher: Matcher,
}

#[derive(Debug, Clone)]
enum Matcher {
    /// Case-insensitive equality, trailing slashes ignored.
    Exact { target: Target, value: String },
    /// `*` wildcards, anchored at both ends.
    Wildcard { target: Target, regex: Regex },
    /// Operator regex, unanchored, case-insensitive.
    Regex(Regex),
    /// Regex that failed to compile. Never matches.
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Path,
    Url,
}

/// The parts of a request an exception rule can see.
#[derive(Debug, Clone, Copy)]
pub struct RuleInput<'a> {
    pub scheme: &'a str,
    pub host: &'a str,
    pub path: &'a str,
}

impl ExceptionRule {
    pub fn new(pattern: &str, is_regex: bool) -> Self {
        let pattern = pattern.trim().to_string();
        let matcher = if is_regex {
            match RegexBuilder::new(&pattern).case_insensitive(true).build() {
                Ok(regex) => Matcher::Regex(regex),
                Err(err) => {
                    warn!(
                        target = "sitecache::cache::exceptions",
                        pattern = %pattern,
                        error = %err,
                        "Ignoring exception rule with invalid regex"
                    );
                    Matcher::Invalid
                }
            }
        } else {
            literal_matcher(&pattern)
        };
        Self {
            pattern,
            is_regex,
            matcher,
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn is_regex(&self) -> bool {
        self.is_regex
    }

    pub fn is_valid(&self) -> bool {
        !matches!(self.matcher, Matcher::Invalid)
    }

    pub fn matches(&self, input: &RuleInput<'_>) -> bool {
        match &self.matcher {
            Matcher::Exact { target, value } => {
                let candidate = candidate(*target, input);
                trim_slashes(&candidate).eq_ignore_ascii_case(value)
            }
            Matcher::Wildcard { target, regex } => regex.is_match(&candidate(*target, input)),
            Matcher::Regex(regex) => regex.is_match(input.path),
            Matcher::Invalid => false,
        }
    }
}

fn literal_matcher(pattern: &str) -> Matcher {
    let lowered = pattern.to_ascii_lowercase();
    let target = if lowered.starts_with("http://") || lowered.starts_with("https://") {
        Target::Url
    } else {
        Target::Path
    };

    if !pattern.contains('*') {
        return Matcher::Exact {
            target,
            value: trim_slashes(&lowered).to_string(),
        };
    }

    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    match RegexBuilder::new(&format!("^{body}$"))
        .case_insensitive(true)
        .build()
    {
        Ok(regex) => Matcher::Wildcard { target, regex },
        // Escaped literals joined by `.*` always compile; only a size limit
        // could trip this.
        Err(_) => Matcher::Invalid,
    }
}

fn candidate(target: Target, input: &RuleInput<'_>) -> String {
    match target {
        Target::Path => input.path.to_string(),
        Target::Url => format!("{}://{}{}", input.scheme, input.host, input.path),
    }
}

fn trim_slashes(value: &str) -> &str {
    let trimmed = value.trim_end_matches('/');
    if trimmed.is_empty() && value.starts_with('/') {
        "/"
    } else {
        trimmed
    }
}

/// The compiled rule set of one config snapshot.
#[derive(Debug, Clone, Default)]
pub struct ExceptionRules {
    rules: Vec<ExceptionRule>,
}

impl ExceptionRules {
    /// Rules only take effect in advanced mode.
    pub fn compile(config: &CacheConfig) -> Self {
        if !config.advanced_mode {
            return Self::default();
        }
        let is_regex = config.enable_url_exemption_regex;
        Self {
            rules: config
                .exception_lines()
                .map(|line| ExceptionRule::new(line, is_regex))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExceptionRule> {
        self.rules.iter()
    }

    pub fn first_match(&self, input: &RuleInput<'_>) -> Option<&ExceptionRule> {
        self.rules.iter().find(|rule| rule.matches(input))
    }
}
