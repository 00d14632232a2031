//! Mission-name filters: an ordered list of case-sensitive glob patterns. An empty list
//! admits every mission.

use glob::{MatchOptions, Pattern, PatternError};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

#[derive(Clone, Debug, Default)]
pub struct MissionFilter {
    patterns: Vec<Pattern>,
}

impl MissionFilter {
    pub fn compile<S: AsRef<str>>(patterns: &[S]) -> Result<Self, PatternError> {
        let patterns = patterns
            .iter()
            .map(|p| Pattern::new(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn matches(&self, mission_name: &str) -> bool {
        self.patterns.is_empty()
            || self
                .patterns
                .iter()
                .any(|p| p.matches_with(mission_name, MATCH_OPTIONS))
    }
}

/// Validate a pattern list without keeping it
pub fn validate_patterns<S: AsRef<str>>(patterns: &[S]) -> Result<(), PatternError> {
    MissionFilter::compile(patterns).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_filter_matches_everything() {
        assert!(MissionFilter::allow_all().matches("anything"));
        assert!(MissionFilter::compile::<&str>(&[]).unwrap().matches("Training-Alpha"));
    }

    #[test]
    fn test_glob_selects_by_prefix() {
        let training = MissionFilter::compile(&["Training-*"]).unwrap();
        let operations = MissionFilter::compile(&["Operation-*"]).unwrap();
        assert!(training.matches("Training-Alpha"));
        assert!(!operations.matches("Training-Alpha"));
    }

    #[test]
    fn test_case_sensitive() {
        let filter = MissionFilter::compile(&["training-*"]).unwrap();
        assert!(!filter.matches("Training-Alpha"));
    }

    #[test]
    fn test_any_pattern_matches() {
        let filter = MissionFilter::compile(&["Operation-?", "Exercise-[AB]*", "Training-*"]).unwrap();
        assert!(filter.matches("Operation-1"));
        assert!(filter.matches("Exercise-Bravo"));
        assert!(!filter.matches("Exercise-Charlie"));
        assert!(filter.matches("Training-Alpha"));
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        assert!(validate_patterns(&["Training-[*"]).is_err());
    }
}
