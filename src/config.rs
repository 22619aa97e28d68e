//! Configuration loading for Vigil.
//!
//! Projects and tool settings are read from a TOML file:
//!
//! ```toml
//! [git]
//! path = "git"
//! args = ["-c", "http.lowSpeedTime=30"]
//!
//! [build]
//! timeout_secs = 3600
//! shell = "sh"
//!
//! [[projects]]
//! name = "App"
//! slug = "app"                              # derived from name when absent
//! repository = "https://example.com/app.git"  # "<url>@<branch>" also accepted
//! branch = "main"                           # default "master"
//! command = "make test"
//! url_pattern = "https://example.com/app/commit/%commit%"
//! ```
//!
//! Validation is eager: every problem in the file is reported at once.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;
use crate::model::{Project, slugify};

pub const DEFAULT_BRANCH: &str = "master";
pub const CONFIG_PATH_ENV: &str = "VIGIL_CONFIG_PATH";
pub const DATA_PATH_ENV: &str = "VIGIL_DATA_PATH";

/// Settings for the git binary used by the repository accessor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    #[serde(default = "default_git_path")]
    pub path: String,
    /// Extra global arguments passed before every git subcommand.
    #[serde(default)]
    pub args: Vec<String>,
}

fn default_git_path() -> String {
    "git".to_string()
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            path: default_git_path(),
            args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_shell")]
    pub shell: String,
}

fn default_timeout_secs() -> u64 {
    3600
}

fn default_shell() -> String {
    "sh".to_string()
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            shell: default_shell(),
        }
    }
}

impl BuildConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// A project definition as written in the file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub repository: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub url_pattern: Option<String>,
}

/// Raw file contents before validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub projects: Vec<ProjectConfig>,
}

/// Whether validation also runs the git binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitCheck {
    Skip,
    Require,
}

/// Validated configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub git: GitConfig,
    pub build: BuildConfig,
    pub projects: Vec<Project>,
}

impl Config {
    /// Read and validate the configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::load_with(path, GitCheck::Skip)
    }

    /// Like [`Config::load`], optionally also requiring a usable git binary.
    pub fn load_with(path: &Path, git_check: GitCheck) -> Result<Self, ConfigError> {
        if !path.is_file() {
            return Err(ConfigError::NotFound {
                path: path.to_path_buf(),
            });
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse_with(&content, git_check).map_err(|e| match e {
            ConfigError::Parse { message, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                message,
            },
            other => other,
        })
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Self::parse_with(content, GitCheck::Skip)
    }

    pub fn parse_with(content: &str, git_check: GitCheck) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::new(),
            message: e.to_string(),
        })?;
        file.validate(git_check)
    }
}

impl ConfigFile {
    /// Validate the whole file, collecting every violation.
    pub fn validate(self, git_check: GitCheck) -> Result<Config, ConfigError> {
        let mut violations = Vec::new();

        if self.git.path.trim().is_empty() {
            violations.push("git.path is empty".to_string());
        } else if git_check == GitCheck::Require
            && let Some(violation) = git_binary_violation(&self.git.path)
        {
            violations.push(violation);
        }
        if self.build.timeout_secs == 0 {
            violations.push("build.timeout_secs must be greater than zero".to_string());
        }
        if self.build.shell.trim().is_empty() {
            violations.push("build.shell is empty".to_string());
        }
        if self.projects.is_empty() {
            violations.push("no projects defined; add at least one [[projects]] entry".to_string());
        }

        let mut seen = HashSet::new();
        let mut projects = Vec::with_capacity(self.projects.len());
        for (idx, raw) in self.projects.into_iter().enumerate() {
            let label = if raw.name.trim().is_empty() {
                format!("project #{}", idx + 1)
            } else {
                format!("project #{} ({})", idx + 1, raw.name.trim())
            };
            let project = resolve_project(raw, &label, &mut violations);
            if !project.slug.is_empty() && !seen.insert(project.slug.clone()) {
                violations.push(format!("{}: duplicate slug '{}'", label, project.slug));
            }
            projects.push(project);
        }

        if !violations.is_empty() {
            return Err(ConfigError::Invalid { violations });
        }

        Ok(Config {
            git: self.git,
            build: self.build,
            projects,
        })
    }
}

fn resolve_project(raw: ProjectConfig, label: &str, violations: &mut Vec<String>) -> Project {
    let name = raw.name.trim().to_string();
    if name.is_empty() {
        violations.push(format!("{}: name is empty", label));
    }

    let slug = match raw.slug.as_deref().map(str::trim) {
        Some(slug) => slug.to_string(),
        None => slugify(&name),
    };
    if slug.is_empty() {
        violations.push(format!("{}: slug is empty", label));
    } else if !is_valid_slug(&slug) {
        violations.push(format!(
            "{}: slug '{}' may only contain lowercase letters, digits, '-' and '_'",
            label, slug
        ));
    }

    let (repository, shorthand_branch) = split_repository(raw.repository.trim());
    if repository.is_empty() {
        violations.push(format!("{}: repository is empty", label));
    }

    let branch = raw
        .branch
        .map(|b| b.trim().to_string())
        .or(shorthand_branch)
        .unwrap_or_else(|| DEFAULT_BRANCH.to_string());
    if branch.is_empty() {
        violations.push(format!("{}: branch is empty", label));
    }

    let command = raw.command.trim().to_string();
    if command.is_empty() {
        violations.push(format!("{}: command is empty", label));
    }

    Project {
        slug,
        name,
        repository,
        branch,
        command,
        url_pattern: raw.url_pattern.filter(|p| !p.trim().is_empty()),
    }
}

fn is_valid_slug(slug: &str) -> bool {
    slug.chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

/// Split `<repository>@<branch>`. An `@` that belongs to an scp-style or
/// credentialed URL (`git@host:repo`, `https://user@host/repo`) is left alone.
pub fn split_repository(repository: &str) -> (String, Option<String>) {
    if let Some((repo, branch)) = repository.rsplit_once('@')
        && !repo.is_empty()
        && !branch.is_empty()
        && !branch.contains([':', '/'])
    {
        return (repo.to_string(), Some(branch.to_string()));
    }
    (repository.to_string(), None)
}

/// Describe why the configured git binary cannot be executed, if it cannot.
fn git_binary_violation(git_path: &str) -> Option<String> {
    match std::process::Command::new(git_path).arg("--version").output() {
        Ok(out) if out.status.success() => None,
        Ok(out) => Some(format!(
            "the git binary cannot be used ({}): {}",
            git_path,
            String::from_utf8_lossy(&out.stderr).trim()
        )),
        Err(e) => Some(format!("the git binary cannot be found ({}): {}", git_path, e)),
    }
}

/// Where configuration and data live on disk.
#[derive(Debug, Clone)]
pub struct Paths {
    pub config_file: PathBuf,
    pub data_dir: PathBuf,
}

impl Paths {
    /// Resolve paths from explicit overrides, then environment, then `~/.vigil`.
    pub fn resolve(config: Option<PathBuf>, data_dir: Option<PathBuf>) -> Self {
        let base = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".vigil");
        let config_file = config
            .or_else(|| std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from))
            .unwrap_or_else(|| base.join("config.toml"));
        let data_dir = data_dir
            .or_else(|| std::env::var_os(DATA_PATH_ENV).map(PathBuf::from))
            .unwrap_or_else(|| base.join("data"));
        Self {
            config_file,
            data_dir,
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("vigil.db")
    }

    pub fn build_dir(&self) -> PathBuf {
        self.data_dir.join("build")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
        [git]
        path = "git"
        args = ["-c", "core.askPass=true"]

        [build]
        timeout_secs = 120

        [[projects]]
        name = "My App"
        repository = "https://example.com/app.git"
        branch = "main"
        command = "make test"
        url_pattern = "https://example.com/app/commit/%commit%"

        [[projects]]
        name = "Lib"
        slug = "lib"
        repository = "git@example.com:org/lib.git@develop"
        command = "cargo test"
    "#;

    fn invalid(content: &str) -> Vec<String> {
        match Config::parse(content) {
            Err(ConfigError::Invalid { violations }) => violations,
            other => panic!("Expected Invalid, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_valid_config() {
        let config = Config::parse(VALID).unwrap();
        assert_eq!(config.git.args, vec!["-c", "core.askPass=true"]);
        assert_eq!(config.build.timeout(), Duration::from_secs(120));
        assert_eq!(config.build.shell, "sh");
        assert_eq!(config.projects.len(), 2);

        let app = &config.projects[0];
        assert_eq!(app.slug, "my-app");
        assert_eq!(app.branch, "main");
        assert_eq!(
            app.commit_url("abc").as_deref(),
            Some("https://example.com/app/commit/abc")
        );

        let lib = &config.projects[1];
        assert_eq!(lib.repository, "git@example.com:org/lib.git");
        assert_eq!(lib.branch, "develop");
        assert!(lib.url_pattern.is_none());
    }

    #[test]
    fn test_defaults_apply() {
        let config = Config::parse(
            r#"
            [[projects]]
            name = "App"
            repository = "/srv/git/app"
            command = "true"
            "#,
        )
        .unwrap();
        assert_eq!(config.git.path, "git");
        assert_eq!(config.build.timeout_secs, 3600);
        assert_eq!(config.projects[0].branch, DEFAULT_BRANCH);
    }

    #[test]
    fn test_empty_project_list_is_invalid() {
        let violations = invalid("");
        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains("no projects"));
    }

    #[test]
    fn test_duplicate_slugs_are_rejected() {
        let violations = invalid(
            r#"
            [[projects]]
            name = "App"
            repository = "a"
            command = "true"

            [[projects]]
            name = "Other"
            slug = "app"
            repository = "b"
            command = "true"
            "#,
        );
        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains("duplicate slug 'app'"));
    }

    #[test]
    fn test_every_violation_is_reported() {
        let violations = invalid(
            r#"
            [build]
            timeout_secs = 0

            [[projects]]
            name = ""
            repository = ""
            command = ""

            [[projects]]
            name = "Ok"
            slug = "Bad Slug"
            repository = "x"
            command = "true"
            "#,
        );
        assert!(violations.iter().any(|v| v.contains("timeout_secs")));
        assert!(violations.iter().any(|v| v.contains("name is empty")));
        assert!(violations.iter().any(|v| v.contains("repository is empty")));
        assert!(violations.iter().any(|v| v.contains("command is empty")));
        assert!(violations.iter().any(|v| v.contains("'Bad Slug'")));
    }

    #[test]
    fn test_malformed_toml_is_parse_error() {
        let err = Config::parse("[[projects]\nname = ").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(&dir.path().join("config.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound { .. }));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, VALID).unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.projects.len(), 2);
    }

    #[test]
    fn test_split_repository() {
        assert_eq!(
            split_repository("https://example.com/app.git@feature"),
            ("https://example.com/app.git".to_string(), Some("feature".to_string()))
        );
        assert_eq!(
            split_repository("git@example.com:org/app.git"),
            ("git@example.com:org/app.git".to_string(), None)
        );
        assert_eq!(
            split_repository("https://user@example.com/app.git"),
            ("https://user@example.com/app.git".to_string(), None)
        );
        assert_eq!(split_repository("/srv/app"), ("/srv/app".to_string(), None));
    }

    #[test]
    fn test_missing_git_binary() {
        let violation = git_binary_violation("/nonexistent/bin/git-xyz").unwrap();
        assert!(violation.contains("cannot be found"));
    }

    #[test]
    fn test_git_binary_is_reported_with_other_violations() {
        let content = r#"
            [git]
            path = "/nonexistent/bin/git-xyz"

            [build]
            timeout_secs = 0

            [[projects]]
            name = "App"
            repository = "a"
            command = "true"
        "#;
        match Config::parse_with(content, GitCheck::Require) {
            Err(ConfigError::Invalid { violations }) => {
                assert!(violations.iter().any(|v| v.contains("timeout_secs")));
                assert!(violations.iter().any(|v| v.contains("git binary")));
            }
            other => panic!("Expected Invalid, got {:?}", other),
        }
        // Skipped unless asked for.
        let violations = invalid(content);
        assert_eq!(violations.len(), 1);
    }

    #[test]
    fn test_duplicate_slug_is_reported_alongside_project_violations() {
        let violations = invalid(
            r#"
            [[projects]]
            name = "App"
            repository = "a"
            command = "true"

            [[projects]]
            name = "App"
            repository = "b"
            command = ""
            "#,
        );
        assert!(violations.iter().any(|v| v.contains("command is empty")));
        assert!(violations.iter().any(|v| v.contains("duplicate slug 'app'")));
    }

    #[test]
    fn test_paths_prefer_explicit_overrides() {
        let paths = Paths::resolve(
            Some(PathBuf::from("/etc/vigil.toml")),
            Some(PathBuf::from("/var/lib/vigil")),
        );
        assert_eq!(paths.config_file, PathBuf::from("/etc/vigil.toml"));
        assert_eq!(paths.db_path(), PathBuf::from("/var/lib/vigil/vigil.db"));
        assert_eq!(paths.build_dir(), PathBuf::from("/var/lib/vigil/build"));
    }
}
