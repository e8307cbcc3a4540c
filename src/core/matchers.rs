//! Stateless text matchers used by the rule evaluator.
//!
//! Every matcher is compiled once when a rule set is loaded and is then
//! shared read-only between requests. Matching reports every hit, including
//! overlapping ones; deciding what a set of hits means is left to the
//! evaluator.

use std::fmt;
use std::sync::OnceLock;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while compiling a matcher
#[derive(Error, Debug)]
pub enum MatcherError {
    #[error("invalid pattern for field '{field}': {source}")]
    InvalidPattern {
        field: String,
        #[source]
        source: regex::Error,
    },
}

/// A single hit reported by a matcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Match {
    pub start: usize,
    pub end: usize,
    pub field_name: String,
}

/// Built-in PII field types the console offers as checkboxes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StandardPiiField {
    CreditCardNumber,
    SocialSecurityNumber,
    PhoneNumber,
    EmailAddress,
    IpAddress,
}

impl StandardPiiField {
    pub const ALL: [StandardPiiField; 5] = [
        StandardPiiField::CreditCardNumber,
        StandardPiiField::SocialSecurityNumber,
        StandardPiiField::PhoneNumber,
        StandardPiiField::EmailAddress,
        StandardPiiField::IpAddress,
    ];

    /// Display name, as used for the keys of the console's `piiTypes` map
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::CreditCardNumber => "Credit Card Number",
            Self::SocialSecurityNumber => "Social Security Number",
            Self::PhoneNumber => "Phone Number",
            Self::EmailAddress => "Email Address",
            Self::IpAddress => "IP Address",
        }
    }

    pub fn from_display_name(name: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|f| f.display_name().eq_ignore_ascii_case(name.trim()))
    }

    fn pattern(&self) -> &'static str {
        match self {
            Self::CreditCardNumber => r"\b\d(?:[ -]?\d){12,18}\b",
            Self::SocialSecurityNumber => r"\b\d{3}-\d{2}-\d{4}\b",
            Self::PhoneNumber => {
                r"(?:\+\d{1,3}[ .-]?)?(?:\(\d{3}\)|\b\d{3})[ .-]?\d{3}[ .-]?\d{4}\b"
            }
            Self::EmailAddress => r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b",
            Self::IpAddress => r"\b(?:(?:25[0-5]|2[0-4]\d|1?\d?\d)\.){3}(?:25[0-5]|2[0-4]\d|1?\d?\d)\b",
        }
    }

    /// Structural check applied after a regex hit to drop false positives
    fn validate(&self, candidate: &str) -> bool {
        match self {
            Self::CreditCardNumber => validate_credit_card(candidate),
            Self::SocialSecurityNumber => validate_ssn(candidate),
            _ => true,
        }
    }
}

impl fmt::Display for StandardPiiField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// One field a PII rule looks for: a built-in type or a named custom regex
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PiiFieldSpec {
    Standard { field: StandardPiiField },
    Custom { name: String, pattern: String },
}

impl PiiFieldSpec {
    pub fn name(&self) -> &str {
        match self {
            Self::Standard { field } => field.display_name(),
            Self::Custom { name, .. } => name,
        }
    }
}

struct CompiledField {
    name: String,
    regex: Regex,
    standard: Option<StandardPiiField>,
}

/// Compiled set of PII fields for one rule
pub struct PiiMatcher {
    fields: Vec<CompiledField>,
    specs: Vec<PiiFieldSpec>,
}

impl PiiMatcher {
    /// Compile every field. Custom patterns honour `case_insensitive`;
    /// built-in patterns are written to be case-agnostic already.
    pub fn compile(specs: Vec<PiiFieldSpec>, case_insensitive: bool) -> Result<Self, MatcherError> {
        let mut fields = Vec::with_capacity(specs.len());
        for spec in &specs {
            let compiled = match spec {
                PiiFieldSpec::Standard { field } => CompiledField {
                    name: field.display_name().to_string(),
                    regex: standard_regex(*field)?,
                    standard: Some(*field),
                },
                PiiFieldSpec::Custom { name, pattern } => CompiledField {
                    name: name.clone(),
                    regex: RegexBuilder::new(pattern)
                        .case_insensitive(case_insensitive)
                        .build()
                        .map_err(|source| MatcherError::InvalidPattern {
                            field: name.clone(),
                            source,
                        })?,
                    standard: None,
                },
            };
            fields.push(compiled);
        }
        Ok(Self { fields, specs })
    }

    pub fn specs(&self) -> &[PiiFieldSpec] {
        &self.specs
    }

    /// All hits of all fields, ordered by position then field order
    pub fn find_all(&self, text: &str) -> Vec<Match> {
        let mut matches = Vec::new();
        for field in &self.fields {
            for (start, end) in Overlapping::new(&field.regex, text) {
                if let Some(standard) = field.standard {
                    if !standard.validate(&text[start..end]) {
                        continue;
                    }
                }
                matches.push(Match {
                    start,
                    end,
                    field_name: field.name.clone(),
                });
            }
        }
        matches.sort_by(|a, b| (a.start, a.end).cmp(&(b.start, b.end)));
        matches
    }

    /// Distinct field names found in `text`, in configuration order
    ///
    /// Stops scanning a field at its first accepted hit.
    pub fn fields_found(&self, text: &str) -> Vec<String> {
        self.fields
            .iter()
            .filter(|field| match field.standard {
                None => field.regex.is_match(text),
                Some(standard) => Overlapping::new(&field.regex, text)
                    .any(|(start, end)| standard.validate(&text[start..end])),
            })
            .map(|field| field.name.clone())
            .collect()
    }
}

impl fmt::Debug for PiiMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PiiMatcher").field("specs", &self.specs).finish()
    }
}

fn standard_regex(field: StandardPiiField) -> Result<Regex, MatcherError> {
    Regex::new(field.pattern()).map_err(|source| MatcherError::InvalidPattern {
        field: field.display_name().to_string(),
        source,
    })
}

/// Every match of `regex`, restarting one character after each match start
/// so overlapping occurrences are reported too.
struct Overlapping<'r, 't> {
    regex: &'r Regex,
    text: &'t str,
    pos: usize,
    last: Option<(usize, usize)>,
}

impl<'r, 't> Overlapping<'r, 't> {
    fn new(regex: &'r Regex, text: &'t str) -> Self {
        Self { regex, text, pos: 0, last: None }
    }
}

impl Iterator for Overlapping<'_, '_> {
    type Item = (usize, usize);

    fn next(&mut self) -> Option<Self::Item> {
        while self.pos <= self.text.len() {
            let m = self.regex.find_at(self.text, self.pos)?;
            self.pos = match self.text[m.start()..].chars().next() {
                Some(c) => m.start() + c.len_utf8(),
                None => self.text.len() + 1,
            };
            let span = (m.start(), m.end());
            if span.0 != span.1 && self.last != Some(span) {
                self.last = Some(span);
                return Some(span);
            }
        }
        None
    }
}

/// Luhn check over the digits of a candidate card number
pub fn validate_credit_card(input: &str) -> bool {
    let digits: Option<Vec<u32>> = input
        .chars()
        .filter(|c| !matches!(c, ' ' | '-'))
        .map(|c| c.to_digit(10))
        .collect();
    let Some(digits) = digits else { return false };
    if digits.len() < 13 || digits.len() > 19 {
        return false;
    }
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 { doubled - 9 } else { doubled }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}

/// US SSN area/group/serial sanity: no 000, 666 or 9xx area, no zero group or serial
pub fn validate_ssn(input: &str) -> bool {
    let parts: Vec<&str> = input.split('-').collect();
    if parts.len() != 3 {
        return false;
    }
    let area = parts[0].parse::<u32>().unwrap_or(0);
    let group = parts[1].parse::<u32>().unwrap_or(0);
    let serial = parts[2].parse::<u32>().unwrap_or(0);
    area != 0 && area != 666 && area < 900 && group != 0 && serial != 0
}

/// A code-injection signature
pub struct CodeSignature {
    pub name: &'static str,
    pub family: &'static str,
    pub pattern: &'static str,
}

/// Fixed signature catalogue for script and SQL injection
pub static CODE_SIGNATURES: &[CodeSignature] = &[
    CodeSignature {
        name: "sql_union_select",
        family: "sql_injection",
        pattern: r"(?i)\bunion\b\s+(?:all\s+)?\bselect\b",
    },
    CodeSignature {
        name: "sql_statement",
        family: "sql_injection",
        pattern: r"(?i)\b(?:select\s+[\w*,\s]+\s+from|insert\s+into|delete\s+from|drop\s+table|update\s+\w+\s+set)\b",
    },
    CodeSignature {
        name: "sql_tautology",
        family: "sql_injection",
        pattern: r#"(?i)['"]\s*(?:or|and)\s+['"]?\w+['"]?\s*=\s*['"]?\w+"#,
    },
    CodeSignature {
        name: "sql_comment_terminator",
        family: "sql_injection",
        pattern: r"(?i)'\s*(?:--|#|/\*)",
    },
    CodeSignature {
        name: "sql_stored_procedure",
        family: "sql_injection",
        pattern: r"(?i)\b(?:xp_cmdshell|sp_executesql|exec\s+xp_)\b",
    },
    CodeSignature {
        name: "script_tag",
        family: "xss",
        pattern: r"(?i)<\s*script\b",
    },
    CodeSignature {
        name: "event_handler",
        family: "xss",
        pattern: r"(?i)\bon(?:error|load|click|mouseover|focus)\s*=",
    },
    CodeSignature {
        name: "javascript_uri",
        family: "xss",
        pattern: r"(?i)javascript\s*:",
    },
    CodeSignature {
        name: "iframe_tag",
        family: "xss",
        pattern: r"(?i)<\s*iframe\b",
    },
    CodeSignature {
        name: "shell_command_chain",
        family: "command_injection",
        pattern: r"(?:;|\|\||&&|\|)\s*(?:rm|cat|curl|wget|bash|sh|nc)\b",
    },
    CodeSignature {
        name: "shell_substitution",
        family: "command_injection",
        pattern: r"\$\([^)]*\)|`[^`]+`",
    },
];

/// Signature matcher for the CodeDetect rule; compiled once per process
pub struct CodeSignatureMatcher {
    compiled: Vec<(&'static CodeSignature, Regex)>,
}

impl CodeSignatureMatcher {
    pub fn shared() -> &'static CodeSignatureMatcher {
        static MATCHER: OnceLock<CodeSignatureMatcher> = OnceLock::new();
        MATCHER.get_or_init(|| CodeSignatureMatcher {
            compiled: CODE_SIGNATURES
                .iter()
                .filter_map(|sig| match Regex::new(sig.pattern) {
                    Ok(re) => Some((sig, re)),
                    Err(e) => {
                        log::error!("Dropping code signature {}: {}", sig.name, e);
                        None
                    }
                })
                .collect(),
        })
    }

    pub fn find_all(&self, text: &str) -> Vec<Match> {
        let mut matches = Vec::new();
        for (sig, regex) in &self.compiled {
            for (start, end) in Overlapping::new(regex, text) {
                matches.push(Match {
                    start,
                    end,
                    field_name: sig.name.to_string(),
                });
            }
        }
        matches.sort_by(|a, b| (a.start, a.end).cmp(&(b.start, b.end)));
        matches
    }

    /// Distinct signature names hit, in catalogue order
    pub fn signatures_found(&self, text: &str) -> Vec<String> {
        self.compiled
            .iter()
            .filter(|(_, regex)| regex.is_match(text))
            .map(|(sig, _)| sig.name.to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn standard(fields: &[StandardPiiField]) -> Vec<PiiFieldSpec> {
        fields
            .iter()
            .map(|f| PiiFieldSpec::Standard { field: *f })
            .collect()
    }

    #[test]
    fn test_credit_card_detected_and_luhn_checked() {
        let matcher = PiiMatcher::compile(standard(&[StandardPiiField::CreditCardNumber]), false).unwrap();

        let hits = matcher.find_all("Card: 4111111111111111");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].start, 6);
        assert_eq!(hits[0].end, 22);
        assert_eq!(hits[0].field_name, "Credit Card Number");

        assert!(matcher.find_all("Card: 4111111111111112").is_empty());
        assert_eq!(matcher.find_all("4111 1111 1111 1111").len(), 1);
    }

    #[test]
    fn test_ssn_validation() {
        let matcher = PiiMatcher::compile(standard(&[StandardPiiField::SocialSecurityNumber]), false).unwrap();
        assert_eq!(matcher.fields_found("ssn 123-45-6789"), vec!["Social Security Number"]);
        assert!(matcher.fields_found("ssn 000-45-6789").is_empty());
        assert!(matcher.fields_found("ssn 666-45-6789").is_empty());
    }

    #[test]
    fn test_email_phone_and_ip() {
        let matcher = PiiMatcher::compile(
            standard(&[
                StandardPiiField::PhoneNumber,
                StandardPiiField::EmailAddress,
                StandardPiiField::IpAddress,
            ]),
            false,
        )
        .unwrap();

        let found = matcher.fields_found("mail jane.doe@example.com or call (555) 123-4567 from 10.0.0.1");
        assert_eq!(found, vec!["Phone Number", "Email Address", "IP Address"]);
        assert!(matcher.fields_found("nothing to see here").is_empty());
    }

    #[test]
    fn test_custom_pattern_case_sensitivity() {
        let specs = vec![PiiFieldSpec::Custom {
            name: "Internal Project ID".to_string(),
            pattern: "PROJ-[A-Z0-9]{8}".to_string(),
        }];

        let sensitive = PiiMatcher::compile(specs.clone(), false).unwrap();
        assert_eq!(sensitive.find_all("see PROJ-AB12CD34").len(), 1);
        assert!(sensitive.find_all("see proj-ab12cd34").is_empty());

        let insensitive = PiiMatcher::compile(specs, true).unwrap();
        assert_eq!(insensitive.find_all("see proj-ab12cd34").len(), 1);
    }

    #[test]
    fn test_invalid_custom_pattern_is_rejected() {
        let specs = vec![PiiFieldSpec::Custom {
            name: "Broken".to_string(),
            pattern: "(unclosed".to_string(),
        }];
        let err = PiiMatcher::compile(specs, false).unwrap_err();
        assert!(err.to_string().contains("Broken"));
    }

    #[test]
    fn test_overlapping_matches_are_all_reported() {
        let specs = vec![PiiFieldSpec::Custom {
            name: "Triple".to_string(),
            pattern: "aaa".to_string(),
        }];
        let matcher = PiiMatcher::compile(specs, false).unwrap();
        let hits = matcher.find_all("aaaaa");
        let spans: Vec<(usize, usize)> = hits.iter().map(|m| (m.start, m.end)).collect();
        assert_eq!(spans, vec![(0, 3), (1, 4), (2, 5)]);
    }

    #[test]
    fn test_fields_found_is_linear_on_long_input() {
        let mut specs = standard(&[StandardPiiField::CreditCardNumber]);
        specs.push(PiiFieldSpec::Custom {
            name: "Long Number".to_string(),
            pattern: "[0-9]{6,}".to_string(),
        });
        let matcher = PiiMatcher::compile(specs, false).unwrap();
        let text = "7".repeat(200_000);

        let started = std::time::Instant::now();
        assert_eq!(matcher.fields_found(&text), vec!["Long Number"]);
        assert!(started.elapsed() < std::time::Duration::from_secs(5));

        let text = format!("{} card 4111111111111111", "x".repeat(200_000));
        assert_eq!(matcher.fields_found(&text), vec!["Credit Card Number", "Long Number"]);
    }

    #[test]
    fn test_matching_is_idempotent() {
        let matcher = PiiMatcher::compile(
            standard(&StandardPiiField::ALL),
            false,
        )
        .unwrap();
        let text = "4111111111111111, 123-45-6789, a@b.io, 192.168.1.1, +1 555 123 4567";
        assert_eq!(matcher.find_all(text), matcher.find_all(text));
    }

    #[test]
    fn test_standard_names_round_trip() {
        for field in StandardPiiField::ALL {
            assert_eq!(StandardPiiField::from_display_name(field.display_name()), Some(field));
        }
        assert_eq!(StandardPiiField::from_display_name("Shoe Size"), None);
    }

    #[test]
    fn test_code_signatures() {
        let matcher = CodeSignatureMatcher::shared();
        assert_eq!(
            matcher.signatures_found("1' OR '1'='1"),
            vec!["sql_tautology".to_string()]
        );
        assert!(matcher
            .signatures_found("<script>alert(1)</script>")
            .contains(&"script_tag".to_string()));
        assert!(matcher
            .signatures_found("x UNION SELECT password FROM users")
            .contains(&"sql_union_select".to_string()));
        assert!(matcher.signatures_found("Please summarise this article.").is_empty());
    }

    #[test]
    fn test_all_code_signatures_compile() {
        for sig in CODE_SIGNATURES {
            Regex::new(sig.pattern)
                .unwrap_or_else(|e| panic!("signature '{}' failed to compile: {e}", sig.name));
        }
    }
}
