use regex::Regex;
use std::sync::LazyLock;

use super::Confidence;

pub const MIN_ADDRESS_LEN: usize = 32;
pub const MAX_ADDRESS_LEN: usize = 44;

static SIGNAL_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bCA\b").expect("valid regex"));

static SEPARATED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bCA(?:\s*[:=]\s*|\s+)([A-Za-z0-9]+)").expect("valid regex")
});

static BARE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([A-Za-z0-9]+)").expect("valid regex"));

/// Address extraction strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressPattern {
    /// `CA` followed by a colon, equals sign or whitespace, then the address.
    Separated,
    /// Any alphanumeric run of address length. Prone to false positives
    /// (URLs, snowflake ids glued to text), hence low confidence.
    Bare,
}

/// Extraction strategies in priority order. The first strategy that yields a
/// valid address wins.
pub const ADDRESS_PATTERNS: [AddressPattern; 2] = [AddressPattern::Separated, AddressPattern::Bare];

impl AddressPattern {
    pub fn name(self) -> &'static str {
        match self {
            AddressPattern::Separated => "ca_separated",
            AddressPattern::Bare => "bare_run",
        }
    }

    pub fn confidence(self) -> Confidence {
        match self {
            AddressPattern::Separated => Confidence::High,
            AddressPattern::Bare => Confidence::Low,
        }
    }

    fn regex(self) -> &'static Regex {
        match self {
            AddressPattern::Separated => &SEPARATED,
            AddressPattern::Bare => &BARE,
        }
    }

    /// Every maximal alphanumeric run this strategy locates, in text order,
    /// before validation.
    pub fn candidates(self, text: &str) -> impl Iterator<Item = &str> {
        self.regex()
            .captures_iter(text)
            .filter_map(|caps| caps.get(1))
            .map(|m| m.as_str())
    }

    /// The first candidate that passes [`is_valid_address`].
    pub fn first_valid(self, text: &str) -> Option<&str> {
        self.candidates(text).find(|c| is_valid_address(c))
    }
}

/// Whole-word, case-insensitive `CA`.
pub fn has_signal_word(text: &str) -> bool {
    SIGNAL_WORD.is_match(text)
}

/// 32 to 44 ASCII alphanumerics. No particular base encoding is enforced so
/// addresses from different chains all pass.
pub fn is_valid_address(candidate: &str) -> bool {
    (MIN_ADDRESS_LEN..=MAX_ADDRESS_LEN).contains(&candidate.len())
        && candidate.bytes().all(|b| b.is_ascii_alphanumeric())
}
