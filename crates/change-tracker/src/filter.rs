use regex::Regex;

use crate::Result;

/// Include/exclude rules applied to repository paths before they are tracked.
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl PathFilter {
    pub fn new(include: Vec<Regex>, exclude: Vec<Regex>) -> Self {
        Self { include, exclude }
    }

    /// Compiles both pattern lists, failing on the first invalid one.
    pub fn from_patterns<S: AsRef<str>>(include: &[S], exclude: &[S]) -> Result<Self> {
        let compile = |patterns: &[S]| -> Result<Vec<Regex>> {
            patterns
                .iter()
                .map(|p| Regex::new(p.as_ref()).map_err(Into::into))
                .collect()
        };
        Ok(Self::new(compile(include)?, compile(exclude)?))
    }

    /// Exclude wins over include; with no include patterns everything else is allowed.
    pub fn is_path_allowed(&self, path: &str) -> bool {
        if let Some(pattern) = self.exclude.iter().find(|p| p.is_match(path)) {
            log::debug!("{path} is excluded by {pattern}");
            return false;
        }
        if self.include.is_empty() {
            return true;
        }
        let allowed = self.include.iter().any(|p| p.is_match(path));
        if !allowed {
            log::debug!("{path} does not match any include pattern");
        }
        allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_filter_allows_everything() {
        let filter = PathFilter::default();
        assert!(filter.is_path_allowed("anything.yaml"));
    }

    #[test]
    fn include_and_exclude() {
        let filter = PathFilter::from_patterns(&["^rules/"], &["\\.bak$"]).unwrap();
        assert!(filter.is_path_allowed("rules/a.yaml"));
        assert!(!filter.is_path_allowed("rules/a.yaml.bak"));
        assert!(!filter.is_path_allowed("docs/a.yaml"));
    }

    #[test]
    fn exclude_only() {
        let filter = PathFilter::from_patterns::<&str>(&[], &["^vendor/"]).unwrap();
        assert!(filter.is_path_allowed("rules/a.yaml"));
        assert!(!filter.is_path_allowed("vendor/a.yaml"));
    }

    #[test]
    fn invalid_pattern_is_an_error() {
        assert!(PathFilter::from_patterns(&["("], &[]).is_err());
    }
}
