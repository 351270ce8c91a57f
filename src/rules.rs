//! Header-based junk/spam detection rules.
//!
//! Rule DSL: `HEADER [/REGEX/] OPERATOR [VALUE]`, e.g.
//! `X-Spam-Flag == YES` or `X-Microsoft-Antispam /BCL:(\d+)/ >= 7`.

use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Gte,
    Gt,
    Lte,
    Lt,
    Eq,
    Ne,
    Prefix,
    Suffix,
    Contains,
    In,
    Exists,
}

impl Operator {
    fn as_str(self) -> &'static str {
        match self {
            Self::Gte => ">=",
            Self::Gt => ">",
            Self::Lte => "<=",
            Self::Lt => "<",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Prefix => "prefix",
            Self::Suffix => "suffix",
            Self::Contains => "contains",
            Self::In => "in",
            Self::Exists => "exists",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            ">=" => Self::Gte,
            ">" => Self::Gt,
            "<=" => Self::Lte,
            "<" => Self::Lt,
            "==" => Self::Eq,
            "!=" => Self::Ne,
            "prefix" => Self::Prefix,
            "suffix" => Self::Suffix,
            "contains" => Self::Contains,
            "in" => Self::In,
            "exists" => Self::Exists,
            _ => return None,
        })
    }

    const fn is_numeric(self) -> bool {
        matches!(self, Self::Gte | Self::Gt | Self::Lte | Self::Lt)
    }
}

#[derive(Debug, Clone)]
enum Value {
    Number(f64),
    Text(String),
    List(Vec<String>),
    None,
}

/// A parsed junk-detection rule.
#[derive(Debug, Clone)]
pub struct Rule {
    header: String,
    operator: Operator,
    value: Value,
    pattern: Option<Regex>,
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.header)?;
        if let Some(pattern) = &self.pattern {
            write!(f, " /{}/", pattern.as_str())?;
        }
        write!(f, " {}", self.operator.as_str())?;
        match &self.value {
            Value::Number(n) => write!(f, " {n}")?,
            Value::Text(s) => write!(f, " {s}")?,
            Value::List(items) => write!(f, " {}", items.join("|"))?,
            Value::None => {}
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum RuleParseError {
    #[error("empty or comment rule")]
    Empty,
    #[error("no tokens in rule: {0}")]
    NoTokens(String),
    #[error("unclosed regex pattern in: {0}")]
    UnclosedRegex(String),
    #[error("invalid regex pattern: {0}")]
    InvalidRegex(String),
    #[error("missing operator in rule: {0}")]
    MissingOperator(String),
    #[error("unknown operator '{0}' in rule: {1}")]
    UnknownOperator(String, String),
    #[error("missing value for 'in' operator: {0}")]
    MissingInValue(String),
    #[error("missing numeric value: {0}")]
    MissingNumericValue(String),
    #[error("invalid numeric value '{0}': {1}")]
    InvalidNumericValue(String, String),
    #[error("missing string value: {0}")]
    MissingStringValue(String),
}

impl Rule {
    /// Parse a single rule line. Returns `Err` for anything
    /// malformed; callers batching multiple rules should skip and log
    /// rather than abort (see [`parse_rules`]).
    pub fn parse(rule: &str) -> Result<Self, RuleParseError> {
        let rule = rule.trim();
        if rule.is_empty() || rule.starts_with('#') {
            return Err(RuleParseError::Empty);
        }

        let tokens = tokenize(rule)?;
        let mut tokens = tokens.into_iter();
        let header = tokens
            .next()
            .ok_or_else(|| RuleParseError::NoTokens(rule.to_string()))?;

        let mut tokens: Vec<String> = tokens.collect();

        let pattern = if tokens
            .first()
            .is_some_and(|t| t.starts_with('/') && t.ends_with('/') && t.len() >= 2)
        {
            let raw = tokens.remove(0);
            let inner = &raw[1..raw.len() - 1];
            Some(
                Regex::new(inner)
                    .map_err(|e| RuleParseError::InvalidRegex(e.to_string()))?,
            )
        } else {
            None
        };

        if tokens.is_empty() {
            return Err(RuleParseError::MissingOperator(rule.to_string()));
        }
        let op_str = tokens.remove(0).to_lowercase();
        let operator = Operator::parse(&op_str)
            .ok_or_else(|| RuleParseError::UnknownOperator(op_str.clone(), rule.to_string()))?;

        let value = match operator {
            Operator::Exists => Value::None,
            Operator::In => {
                if tokens.is_empty() {
                    return Err(RuleParseError::MissingInValue(rule.to_string()));
                }
                let joined = tokens.join(" ");
                Value::List(joined.split('|').map(|s| s.trim().to_string()).collect())
            }
            _ if operator.is_numeric() => {
                if tokens.is_empty() {
                    return Err(RuleParseError::MissingNumericValue(rule.to_string()));
                }
                let raw = &tokens[0];
                let n: f64 = raw
                    .parse()
                    .map_err(|_| RuleParseError::InvalidNumericValue(raw.clone(), rule.to_string()))?;
                Value::Number(n)
            }
            _ => {
                if tokens.is_empty() {
                    return Err(RuleParseError::MissingStringValue(rule.to_string()));
                }
                Value::Text(tokens.join(" "))
            }
        };

        Ok(Self {
            header,
            operator,
            value,
            pattern,
        })
    }

    /// Whether `headers` (case-insensitive names) match this rule.
    #[must_use]
    pub fn matches(&self, headers: &HashMap<String, String>) -> bool {
        let lookup = self.header.to_lowercase();
        let header_value = headers
            .iter()
            .find(|(k, _)| k.to_lowercase() == lookup)
            .map(|(_, v)| v.as_str());

        if self.operator == Operator::Exists {
            return header_value.is_some();
        }

        let Some(mut value) = header_value else {
            return false;
        };

        let extracted;
        if let Some(pattern) = &self.pattern {
            let Some(caps) = pattern.captures(value) else {
                return false;
            };
            extracted = caps
                .get(1)
                .or_else(|| caps.get(0))
                .map(|m| m.as_str().to_string())
                .unwrap_or_default();
            value = &extracted;
        }

        if self.operator.is_numeric() {
            let Ok(num) = value.parse::<f64>() else {
                return false;
            };
            let Value::Number(target) = self.value else {
                return false;
            };
            return match self.operator {
                Operator::Gte => num >= target,
                Operator::Gt => num > target,
                Operator::Lte => num <= target,
                Operator::Lt => num < target,
                _ => unreachable!(),
            };
        }

        match (self.operator, &self.value) {
            (Operator::Eq, Value::Text(v)) => value == v,
            (Operator::Ne, Value::Text(v)) => value != v,
            (Operator::Prefix, Value::Text(v)) => value.starts_with(v.as_str()),
            (Operator::Suffix, Value::Text(v)) => value.ends_with(v.as_str()),
            (Operator::Contains, Value::Text(v)) => value.contains(v.as_str()),
            (Operator::In, Value::List(items)) => items.iter().any(|item| item == value),
            _ => false,
        }
    }
}

fn tokenize(rule: &str) -> Result<Vec<String>, RuleParseError> {
    let chars: Vec<char> = rule.chars().collect();
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c == '/' {
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
            let Some(end_offset) = chars[i + 1..].iter().position(|&c| c == '/') else {
                return Err(RuleParseError::UnclosedRegex(rule.to_string()));
            };
            let end = i + 1 + end_offset;
            tokens.push(chars[i..=end].iter().collect());
            i = end + 1;
        } else if c.is_whitespace() {
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
            i += 1;
        } else {
            current.push(c);
            i += 1;
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    Ok(tokens)
}

/// Parse a batch of rule lines, skipping blanks/comments and logging
/// (not propagating) any that fail to parse.
#[must_use]
pub fn parse_rules(rule_strings: &[String]) -> Vec<Rule> {
    let mut rules = Vec::new();
    for rule_str in rule_strings {
        let trimmed = rule_str.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        match Rule::parse(trimmed) {
            Ok(rule) => rules.push(rule),
            Err(e) => warn!("discarding unparseable rule '{trimmed}': {e}"),
        }
    }
    rules
}

/// Check headers against a rule set; returns the first matching rule's
/// display form, or `None` if no rule matched.
#[must_use]
pub fn is_junk(headers: &HashMap<String, String>, rules: &[Rule]) -> Option<String> {
    rules
        .iter()
        .find(|rule| rule.matches(headers))
        .map(std::string::ToString::to_string)
}
