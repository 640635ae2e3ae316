use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use change_tracker::PathFilter;
use review_platforms::{BitbucketConfig, GitHubConfig, GitLabConfig};

pub const GITLAB_TOKEN_ENV: &str = "GITLAB_AUTH_TOKEN";
pub const BITBUCKET_TOKEN_ENV: &str = "BITBUCKET_AUTH_TOKEN";
pub const GITHUB_TOKEN_ENV: &str = "GITHUB_AUTH_TOKEN";

const DEFAULT_GITLAB_URI: &str = "https://gitlab.com";
const DEFAULT_GITHUB_URI: &str = "https://api.github.com";

/// Contents of `linemark.toml`. Every section is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub ci: CiConfig,
    pub repository: RepositoryConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CiConfig {
    pub base_branch: String,
    pub max_commits: usize,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    /// Documentation site linked from comments.
    pub docs_url: String,
    /// Comment on every repeat of an issue instead of folding repeats into one note.
    pub show_duplicates: bool,
}

impl Default for CiConfig {
    fn default() -> Self {
        Self {
            base_branch: "main".to_string(),
            max_commits: 20,
            include: Vec::new(),
            exclude: Vec::new(),
            docs_url: env!("CARGO_PKG_REPOSITORY").to_string(),
            show_duplicates: false,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RepositoryConfig {
    pub gitlab: Option<GitLabSection>,
    pub github: Option<GitHubSection>,
    pub bitbucket: Option<BitbucketSection>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GitLabSection {
    #[serde(default = "default_gitlab_uri")]
    pub uri: String,
    pub project: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_comments")]
    pub max_comments: usize,
}

/// `owner` and `repo` fall back to `$GITHUB_REPOSITORY` when left out.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GitHubSection {
    #[serde(default = "default_github_uri")]
    pub uri: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub repo: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_comments")]
    pub max_comments: usize,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BitbucketSection {
    pub uri: String,
    pub project: String,
    pub repository: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_comments")]
    pub max_comments: usize,
}

fn default_gitlab_uri() -> String {
    DEFAULT_GITLAB_URI.to_string()
}

fn default_github_uri() -> String {
    DEFAULT_GITHUB_URI.to_string()
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_max_comments() -> usize {
    50
}

impl Config {
    /// Reads `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("no config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config = Self::parse(&text)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        log::info!("loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        self.path_filter()?;
        if let Some(gitlab) = &self.repository.gitlab {
            if gitlab.project == 0 {
                bail!("repository.gitlab.project must be set");
            }
            if gitlab.timeout_secs == 0 {
                bail!("repository.gitlab.timeout_secs must be greater than zero");
            }
        }
        if let Some(github) = &self.repository.github {
            if github.owner.is_empty() != github.repo.is_empty() {
                bail!("repository.github.owner and repository.github.repo must be set together");
            }
            if github.timeout_secs == 0 {
                bail!("repository.github.timeout_secs must be greater than zero");
            }
        }
        if let Some(bitbucket) = &self.repository.bitbucket {
            if bitbucket.project.is_empty() || bitbucket.repository.is_empty() {
                bail!("repository.bitbucket.project and repository must be set");
            }
            if bitbucket.timeout_secs == 0 {
                bail!("repository.bitbucket.timeout_secs must be greater than zero");
            }
        }
        Ok(())
    }

    pub fn path_filter(&self) -> Result<PathFilter> {
        PathFilter::from_patterns(&self.ci.include, &self.ci.exclude)
            .context("invalid ci.include or ci.exclude pattern")
    }

    /// Base branch: `flag`, then `$GITHUB_BASE_REF`, then the config file.
    pub fn base_branch(&self, flag: Option<&str>, env: impl Fn(&str) -> Option<String>) -> String {
        flag.map(str::to_string)
            .or_else(|| env("GITHUB_BASE_REF").filter(|b| !b.is_empty()))
            .unwrap_or_else(|| self.ci.base_branch.clone())
    }

    pub fn gitlab(
        &self,
        branch: &str,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Option<GitLabConfig>> {
        let Some(section) = &self.repository.gitlab else {
            return Ok(None);
        };
        Ok(Some(GitLabConfig {
            uri: section.uri.clone(),
            project: section.project,
            token: token(GITLAB_TOKEN_ENV, &env)?,
            timeout: Duration::from_secs(section.timeout_secs),
            max_comments: section.max_comments,
            branch: branch.to_string(),
        }))
    }

    pub fn bitbucket(
        &self,
        branch: &str,
        head_commit: &str,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Option<BitbucketConfig>> {
        let Some(section) = &self.repository.bitbucket else {
            return Ok(None);
        };
        Ok(Some(BitbucketConfig {
            uri: section.uri.clone(),
            project: section.project.clone(),
            repository: section.repository.clone(),
            token: token(BITBUCKET_TOKEN_ENV, &env)?,
            timeout: Duration::from_secs(section.timeout_secs),
            max_comments: section.max_comments,
            branch: branch.to_string(),
            head_commit: head_commit.to_string(),
            docs_url: self.ci.docs_url.clone(),
        }))
    }

    /// GitHub target. The pull request number comes from `$GITHUB_REF` when the
    /// run was triggered by a pull request, otherwise it is looked up by branch.
    pub fn github(
        &self,
        branch: &str,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Option<GitHubConfig>> {
        let Some(section) = &self.repository.github else {
            return Ok(None);
        };
        let (owner, repo) = if section.owner.is_empty() {
            let full = env("GITHUB_REPOSITORY").unwrap_or_default();
            match full.split_once('/') {
                Some((owner, repo)) if !owner.is_empty() && !repo.is_empty() => {
                    (owner.to_string(), repo.to_string())
                }
                _ => bail!(
                    "repository.github.owner and repo must be set when $GITHUB_REPOSITORY is not"
                ),
            }
        } else {
            (section.owner.clone(), section.repo.clone())
        };
        Ok(Some(GitHubConfig {
            uri: section.uri.clone(),
            owner,
            repo,
            token: token(GITHUB_TOKEN_ENV, &env)?,
            timeout: Duration::from_secs(section.timeout_secs),
            max_comments: section.max_comments,
            branch: branch.to_string(),
            pull_request: env("GITHUB_REF").as_deref().and_then(pull_request_number),
            docs_url: self.ci.docs_url.clone(),
        }))
    }
}

/// `refs/pull/<number>/merge` as set for pull request workflows.
fn pull_request_number(git_ref: &str) -> Option<u64> {
    git_ref
        .strip_prefix("refs/pull/")?
        .strip_suffix("/merge")?
        .parse()
        .ok()
}

fn token(name: &str, env: &impl Fn(&str) -> Option<String>) -> Result<String> {
    match env(name) {
        Some(token) if !token.is_empty() => Ok(token),
        _ => bail!("{name} environment variable is required"),
    }
}

pub fn process_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.ci.base_branch, "main");
        assert_eq!(config.ci.max_commits, 20);
        assert!(config.repository.gitlab.is_none());
        assert!(config.gitlab("feature", no_env).unwrap().is_none());
    }

    #[test]
    fn gitlab_section() {
        let config = Config::parse(
            r#"
            [ci]
            base_branch = "master"
            include = ["^rules/"]

            [repository.gitlab]
            project = 123
            max_comments = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.ci.include, vec!["^rules/".to_string()]);

        let env = |name: &str| (name == GITLAB_TOKEN_ENV).then(|| "secret".to_string());
        let gitlab = config.gitlab("feature", env).unwrap().unwrap();
        assert_eq!(gitlab.uri, DEFAULT_GITLAB_URI);
        assert_eq!(gitlab.project, 123);
        assert_eq!(gitlab.token, "secret");
        assert_eq!(gitlab.timeout, Duration::from_secs(60));
        assert_eq!(gitlab.max_comments, 5);
        assert_eq!(gitlab.branch, "feature");
    }

    #[test]
    fn missing_token_is_an_error() {
        let config = Config::parse("[repository.gitlab]\nproject = 1\n").unwrap();
        let err = config.gitlab("feature", no_env).unwrap_err();
        assert!(err.to_string().contains(GITLAB_TOKEN_ENV));
    }

    #[test]
    fn bitbucket_section() {
        let config = Config::parse(
            r#"
            [repository.bitbucket]
            uri = "https://bitbucket.example.com"
            project = "PROJ"
            repository = "rules"
            timeout_secs = 10
            "#,
        )
        .unwrap();
        let env = |name: &str| (name == BITBUCKET_TOKEN_ENV).then(|| "t".to_string());
        let bitbucket = config.bitbucket("feature", "abc", env).unwrap().unwrap();
        assert_eq!(bitbucket.project, "PROJ");
        assert_eq!(bitbucket.timeout, Duration::from_secs(10));
        assert_eq!(bitbucket.max_comments, 50);
        assert_eq!(bitbucket.head_commit, "abc");
        assert_eq!(bitbucket.docs_url, config.ci.docs_url);
    }

    #[test]
    fn github_section_from_actions_env() {
        let config = Config::parse("[repository.github]
max_comments = 3
").unwrap();
        let env = |name: &str| match name {
            GITHUB_TOKEN_ENV => Some("t".to_string()),
            "GITHUB_REPOSITORY" => Some("acme/rules".to_string()),
            "GITHUB_REF" => Some("refs/pull/42/merge".to_string()),
            _ => None,
        };
        let github = config.github("feature", env).unwrap().unwrap();
        assert_eq!(github.uri, DEFAULT_GITHUB_URI);
        assert_eq!((github.owner.as_str(), github.repo.as_str()), ("acme", "rules"));
        assert_eq!(github.pull_request, Some(42));
        assert_eq!(github.max_comments, 3);

        let explicit = Config::parse(
            "[repository.github]
uri = \"https://ghe.example.com/api/v3\"
owner = \"o\"
repo = \"r\"
",
        )
        .unwrap();
        let token_only = |name: &str| (name == GITHUB_TOKEN_ENV).then(|| "t".to_string());
        let github = explicit.github("feature", token_only).unwrap().unwrap();
        assert_eq!(github.owner, "o");
        assert_eq!(github.pull_request, None);

        assert!(config.github("feature", token_only).is_err());
        assert!(Config::parse("[repository.github]
owner = \"o\"
").is_err());
    }

    #[test]
    fn pull_request_refs() {
        assert_eq!(pull_request_number("refs/pull/7/merge"), Some(7));
        assert_eq!(pull_request_number("refs/heads/main"), None);
        assert_eq!(pull_request_number("refs/pull/x/merge"), None);
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(Config::parse("[ci]\ninclude = [\"(\"]\n").is_err());
        assert!(Config::parse("[repository.gitlab]\nproject = 1\ntimeout_secs = 0\n").is_err());
        assert!(Config::parse("[repository.gitlab]\nproject = 0\n").is_err());
        assert!(Config::parse("[ci]\nunknown = 1\n").is_err());
    }

    #[test]
    fn base_branch_precedence() {
        let config = Config::default();
        let github = |name: &str| (name == "GITHUB_BASE_REF").then(|| "develop".to_string());
        assert_eq!(config.base_branch(Some("release"), github), "release");
        assert_eq!(config.base_branch(None, github), "develop");
        assert_eq!(config.base_branch(None, no_env), "main");
    }
}
