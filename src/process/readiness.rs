//! Readiness detection on process output lines.

use crate::error::{RelayError, Result};
use regex::Regex;

/// Decides whether an output line shows the process is operational.
///
/// Returns a short description of what matched (the pattern, for regex
/// detection), or `None`.
pub trait ReadinessDetector: Send + Sync {
    fn detect(&self, line: &str) -> Option<String>;
}

impl<F> ReadinessDetector for F
where
    F: Fn(&str) -> Option<String> + Send + Sync,
{
    fn detect(&self, line: &str) -> Option<String> {
        self(line)
    }
}

/// Matches lines against an ordered list of regular expressions.
///
/// Patterns are anchored at the start of the line.
#[derive(Debug, Clone)]
pub struct RegexReadinessDetector {
    patterns: Vec<(String, Regex)>,
}

impl RegexReadinessDetector {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| {
                let source = p.as_ref();
                Regex::new(&format!("^(?:{})", source))
                    .map(|re| (source.to_string(), re))
                    .map_err(|e| RelayError::ConfigInvalidValue {
                        key: "ready_patterns".to_string(),
                        message: e.to_string(),
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

impl ReadinessDetector for RegexReadinessDetector {
    fn detect(&self, line: &str) -> Option<String> {
        self.patterns
            .iter()
            .find(|(_, re)| re.is_match(line))
            .map(|(source, _)| source.clone())
    }
}
