use serde::{Deserialize, Serialize};

use crate::error::NormalizationError;
use crate::segment::{CarrierSegmentation, Segment};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountryRule {
    pub code: &'static str,
    pub nsn_min: usize,
    pub nsn_max: usize,
    // `None` means a leading `0` belongs to the national number.
    pub trunk_prefix: Option<char>,
}

const COUNTRY_RULES: &[CountryRule] = &[
    CountryRule { code: "1", nsn_min: 10, nsn_max: 10, trunk_prefix: Some('1') },
    CountryRule { code: "7", nsn_min: 10, nsn_max: 10, trunk_prefix: Some('8') },
    CountryRule { code: "33", nsn_min: 9, nsn_max: 9, trunk_prefix: Some('0') },
    CountryRule { code: "44", nsn_min: 9, nsn_max: 10, trunk_prefix: Some('0') },
    CountryRule { code: "49", nsn_min: 7, nsn_max: 11, trunk_prefix: Some('0') },
    CountryRule { code: "91", nsn_min: 10, nsn_max: 10, trunk_prefix: Some('0') },
    CountryRule { code: "221", nsn_min: 9, nsn_max: 9, trunk_prefix: None },
    CountryRule { code: "223", nsn_min: 8, nsn_max: 8, trunk_prefix: None },
    CountryRule { code: "225", nsn_min: 10, nsn_max: 10, trunk_prefix: None },
    CountryRule { code: "226", nsn_min: 8, nsn_max: 8, trunk_prefix: None },
    CountryRule { code: "228", nsn_min: 8, nsn_max: 8, trunk_prefix: None },
    CountryRule { code: "229", nsn_min: 10, nsn_max: 10, trunk_prefix: None },
    CountryRule { code: "233", nsn_min: 9, nsn_max: 9, trunk_prefix: Some('0') },
    CountryRule { code: "234", nsn_min: 10, nsn_max: 10, trunk_prefix: Some('0') },
    CountryRule { code: "237", nsn_min: 9, nsn_max: 9, trunk_prefix: None },
];

const E164_MAX_DIGITS: usize = 15;
const GENERIC_NSN_MIN: usize = 6;

pub fn country_rule(code: &str) -> CountryRule {
    COUNTRY_RULES
        .iter()
        .find(|rule| rule.code == code)
        .copied()
        .unwrap_or(CountryRule {
            code: "",
            nsn_min: GENERIC_NSN_MIN,
            nsn_max: E164_MAX_DIGITS.saturating_sub(code.len()),
            trunk_prefix: Some('0'),
        })
}

pub fn split_country_code(digits: &str) -> Option<(&str, &str)> {
    (1..=3)
        .rev()
        .filter(|len| digits.len() > *len)
        .find(|len| COUNTRY_RULES.iter().any(|rule| rule.code == &digits[..*len]))
        .map(|len| digits.split_at(len))
}

fn strip_separators(input: &str) -> String {
    input
        .chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, '(' | ')' | '.' | '-' | '/'))
        .collect()
}

fn check_length(nsn: &str, rule: &CountryRule) -> Result<(), NormalizationError> {
    let digits = nsn.len();
    if digits < rule.nsn_min {
        return Err(NormalizationError::TooShort {
            digits,
            min: rule.nsn_min,
        });
    }
    if digits > rule.nsn_max {
        return Err(NormalizationError::TooLong {
            digits,
            max: rule.nsn_max,
        });
    }
    Ok(())
}

fn fits(nsn: &str, rule: &CountryRule) -> bool {
    check_length(nsn, rule).is_ok()
}

fn validate_international(digits: &str, default_country_code: &str) -> Result<(), NormalizationError> {
    if let Some(nsn) = digits.strip_prefix(default_country_code) {
        return check_length(nsn, &country_rule(default_country_code));
    }
    if let Some((code, nsn)) = split_country_code(digits) {
        return check_length(nsn, &country_rule(code));
    }
    let generic = CountryRule {
        code: "",
        nsn_min: 8,
        nsn_max: E164_MAX_DIGITS,
        trunk_prefix: None,
    };
    check_length(digits, &generic)
}

pub fn normalize(input: &str, default_country_code: &str) -> Result<String, NormalizationError> {
    let cleaned = strip_separators(input);
    let (digits, international) = if let Some(rest) = cleaned.strip_prefix('+') {
        (rest, true)
    } else if let Some(rest) = cleaned.strip_prefix("00") {
        (rest, true)
    } else {
        (cleaned.as_str(), false)
    };

    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(NormalizationError::InvalidCharacters);
    }

    let rule = country_rule(default_country_code);
    if digits.is_empty() {
        return Err(NormalizationError::TooShort {
            digits: 0,
            min: rule.nsn_min,
        });
    }

    if international {
        validate_international(digits, default_country_code)?;
        return Ok(format!("+{}", digits));
    }

    // Country code typed without the plus.
    if let Some(nsn) = digits.strip_prefix(default_country_code) {
        if fits(nsn, &rule) {
            return Ok(format!("+{}", digits));
        }
    }

    let nsn = match rule.trunk_prefix {
        Some(trunk) => digits.strip_prefix(trunk).unwrap_or(digits),
        None => digits,
    };
    check_length(nsn, &rule)?;
    Ok(format!("+{}{}", default_country_code, nsn))
}

pub fn normalize_for_provider(input: &str, default_country_code: &str) -> Result<String, NormalizationError> {
    normalize(input, default_country_code).map(|e164| e164.trim_start_matches('+').to_string())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhoneNumber {
    pub raw: String,
    pub e164: String,
    pub segments: Vec<Segment>,
}

impl PhoneNumber {
    pub fn provider_digits(&self) -> &str {
        self.e164.trim_start_matches('+')
    }
}

#[derive(Debug, Clone)]
pub struct PhoneNormalizer {
    default_country_code: String,
}

impl PhoneNormalizer {
    pub fn new(default_country_code: impl Into<String>) -> Self {
        Self {
            default_country_code: default_country_code.into(),
        }
    }

    pub fn default_country_code(&self) -> &str {
        &self.default_country_code
    }

    pub fn normalize(&self, input: &str) -> Result<String, NormalizationError> {
        normalize(input, &self.default_country_code)
    }

    pub fn normalize_for_provider(&self, input: &str) -> Result<String, NormalizationError> {
        normalize_for_provider(input, &self.default_country_code)
    }

    pub fn parse(
        &self,
        raw: &str,
        segmenter: &dyn CarrierSegmentation,
    ) -> Result<PhoneNumber, NormalizationError> {
        let e164 = self.normalize(raw)?;
        let segments = segmenter.segment(&e164);
        Ok(PhoneNumber {
            raw: raw.to_string(),
            e164,
            segments,
        })
    }
}
