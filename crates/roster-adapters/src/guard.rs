//! Corruption guard for raw export text.
//!
//! A handful of stray control bytes is stripped; a response whose sample is
//! dominated by them is rejected outright and never repaired.

use std::borrow::Cow;

use serde::de::IgnoredAny;
use thiserror::Error;

const EXCERPT_CHARS: usize = 160;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GuardConfig {
    /// Number of leading characters inspected for corruption.
    pub sample_chars: usize,
    /// Largest tolerated share of invalid characters in the sample.
    pub max_invalid_ratio: f64,
    /// How far into the text the first `{` or `[` may appear.
    pub preamble_window: usize,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            sample_chars: 10_000,
            max_invalid_ratio: 0.01,
            preamble_window: 1_024,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CorruptionError {
    #[error(
        "response too corrupted to repair: {invalid} of {sampled} sampled characters invalid \
         (ratio {ratio:.4} > {threshold:.4}); excerpt: {excerpt:?}"
    )]
    TooCorrupted {
        ratio: f64,
        threshold: f64,
        invalid: usize,
        sampled: usize,
        excerpt: String,
    },
    #[error("no JSON start found in the first {window} characters; excerpt: {excerpt:?}")]
    NoJsonStart { window: usize, excerpt: String },
}

impl CorruptionError {
    pub fn excerpt(&self) -> &str {
        match self {
            CorruptionError::TooCorrupted { excerpt, .. }
            | CorruptionError::NoJsonStart { excerpt, .. } => excerpt,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CleanedText<'a> {
    pub text: Cow<'a, str>,
    /// Ratio measured on the sample; zero when the text parsed untouched.
    pub sample_ratio: f64,
    pub stripped_chars: usize,
    pub preamble_chars: usize,
}

impl CleanedText<'_> {
    pub fn was_modified(&self) -> bool {
        matches!(self.text, Cow::Owned(_))
    }
}

/// Characters counted against the corruption budget.
pub fn is_invalid_char(c: char) -> bool {
    c == '\0' || c == '\u{FFFD}' || (c.is_control() && !matches!(c, '\t' | '\n' | '\r'))
}

/// Characters removed when the text is repaired.
pub fn is_strippable_char(c: char) -> bool {
    matches!(
        c,
        '\0' | '\u{FFFD}'
            | '\u{01}'..='\u{08}'
            | '\u{0B}'
            | '\u{0C}'
            | '\u{0E}'..='\u{1F}'
            | '\u{7F}'
    )
}

/// Share of invalid characters among the first `sample_chars` characters.
pub fn sample_invalid_ratio(text: &str, sample_chars: usize) -> (usize, usize, f64) {
    let mut sampled = 0usize;
    let mut invalid = 0usize;
    for c in text.chars().take(sample_chars) {
        sampled += 1;
        if is_invalid_char(c) {
            invalid += 1;
        }
    }
    let ratio = if sampled == 0 {
        0.0
    } else {
        invalid as f64 / sampled as f64
    };
    (invalid, sampled, ratio)
}

pub fn clean_response<'a>(
    raw: &'a str,
    config: &GuardConfig,
) -> Result<CleanedText<'a>, CorruptionError> {
    if serde_json::from_str::<IgnoredAny>(raw).is_ok() {
        return Ok(CleanedText {
            text: Cow::Borrowed(raw),
            sample_ratio: 0.0,
            stripped_chars: 0,
            preamble_chars: 0,
        });
    }

    let (invalid, sampled, ratio) = sample_invalid_ratio(raw, config.sample_chars);
    if ratio > config.max_invalid_ratio {
        return Err(CorruptionError::TooCorrupted {
            ratio,
            threshold: config.max_invalid_ratio,
            invalid,
            sampled,
            excerpt: excerpt(raw),
        });
    }

    let mut stripped_chars = 0usize;
    let stripped: String = raw
        .chars()
        .filter(|c| {
            let strip = is_strippable_char(*c);
            stripped_chars += usize::from(strip);
            !strip
        })
        .collect();

    let start = stripped
        .char_indices()
        .take(config.preamble_window)
        .find(|(_, c)| matches!(c, '{' | '['))
        .map(|(idx, _)| idx)
        .ok_or_else(|| CorruptionError::NoJsonStart {
            window: config.preamble_window,
            excerpt: excerpt(&stripped),
        })?;
    let preamble_chars = stripped[..start].chars().count();
    let text = if start == 0 {
        stripped
    } else {
        stripped[start..].to_string()
    };

    Ok(CleanedText {
        text: Cow::Owned(text),
        sample_ratio: ratio,
        stripped_chars,
        preamble_chars,
    })
}

fn excerpt(text: &str) -> String {
    text.chars().take(EXCERPT_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records(n: usize) -> String {
        let body = (0..n)
            .map(|i| format!("{{\"membershipNumber\":\"{i}\",\"surname\":\"Member{i}\"}}"))
            .collect::<Vec<_>>()
            .join(",");
        format!("[{body}]")
    }

    #[test]
    fn valid_json_passes_through_untouched() {
        let raw = records(3);
        let cleaned = clean_response(&raw, &GuardConfig::default()).unwrap();
        assert!(!cleaned.was_modified());
        assert_eq!(cleaned.text, raw);
    }

    #[test]
    fn sparse_control_bytes_are_stripped() {
        let mut raw = records(200);
        raw.insert(40, '\0');
        raw.insert(80, '\u{FFFD}');
        raw.insert(120, '\u{1B}');
        let config = GuardConfig::default();
        let (_, _, ratio) = sample_invalid_ratio(&raw, config.sample_chars);
        assert!(ratio < 0.01);

        let cleaned = clean_response(&raw, &config).unwrap();
        assert_eq!(cleaned.stripped_chars, 3);
        assert_eq!(cleaned.text, records(200));
        assert!(serde_json::from_str::<serde_json::Value>(&cleaned.text).is_ok());
    }

    #[test]
    fn heavy_corruption_is_rejected_with_an_excerpt() {
        let raw: String = "[{\"a\":1}]"
            .chars()
            .flat_map(|c| [c, '\0', '\u{FFFD}'])
            .collect();
        let err = clean_response(&raw, &GuardConfig::default()).unwrap_err();
        match &err {
            CorruptionError::TooCorrupted { ratio, sampled, .. } => {
                assert!(*ratio > 0.5);
                assert_eq!(*sampled, raw.chars().count());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!err.excerpt().is_empty());
    }

    #[test]
    fn threshold_is_configurable() {
        let mut raw = records(5);
        raw.insert(5, '\u{07}');
        let strict = GuardConfig {
            max_invalid_ratio: 0.0,
            ..GuardConfig::default()
        };
        assert!(matches!(
            clean_response(&raw, &strict),
            Err(CorruptionError::TooCorrupted { .. })
        ));
        assert!(clean_response(&raw, &GuardConfig::default()).is_ok());
    }

    #[test]
    fn preamble_before_json_is_trimmed() {
        let raw = format!("Export generated 2026-03-01\n{}", records(1));
        let cleaned = clean_response(&raw, &GuardConfig::default()).unwrap();
        assert_eq!(cleaned.text, records(1));
        assert_eq!(cleaned.preamble_chars, "Export generated 2026-03-01\n".len());
    }

    #[test]
    fn missing_json_start_fails() {
        let raw = "<html><body>Service temporarily unavailable</body></html>";
        let err = clean_response(raw, &GuardConfig::default()).unwrap_err();
        assert!(matches!(err, CorruptionError::NoJsonStart { .. }));

        let far = format!("{}{}", "x".repeat(50), records(1));
        let narrow = GuardConfig {
            preamble_window: 10,
            ..GuardConfig::default()
        };
        assert!(clean_response(&far, &narrow).is_err());
    }

    #[test]
    fn tabs_and_newlines_are_not_corruption() {
        assert!(!is_invalid_char('\t'));
        assert!(!is_invalid_char('\n'));
        assert!(!is_invalid_char('\r'));
        assert!(is_invalid_char('\u{85}'));
        assert!(!is_strippable_char('\u{85}'));
    }
}
