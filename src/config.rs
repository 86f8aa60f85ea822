use anyhow::{bail, Context, Result};
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use shellexpand;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure for repovault
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// Watched roots, one account binding per root
    #[serde(default)]
    pub accounts: Vec<AccountBinding>,

    /// Project detection rules
    #[serde(default)]
    pub detection: DetectionConfig,

    /// Git behavior settings
    #[serde(default)]
    pub git: GitConfig,

    /// Daemon configuration
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// One watched root bound to one hosting identity.
///
/// Every folder discovered under `root_path` is provisioned, authenticated,
/// and attributed using this binding and nothing else. The binding is
/// resolved once, when the folder is first routed, and travels with the
/// repository record from then on.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct AccountBinding {
    /// Directory whose immediate children are watched
    pub root_path: String,

    /// Hosting username this root belongs to
    pub account_id: String,

    /// Name of the environment variable holding the API token.
    /// The token itself never appears in config or state.
    #[serde(default)]
    pub credential_ref: Option<String>,

    /// SSH host alias embedded in remote URLs so the transport layer picks
    /// the matching key (e.g. "github.com-work")
    #[serde(default = "default_host_alias")]
    pub remote_host_alias: String,

    /// Commit author name (defaults to the account id)
    #[serde(default)]
    pub commit_name: Option<String>,

    /// Commit author email (defaults to the GitHub noreply address)
    #[serde(default)]
    pub commit_email: Option<String>,

    /// Visibility for newly created repositories
    #[serde(default)]
    pub visibility: Visibility,

    /// Create repositories under this organization instead of the user
    #[serde(default)]
    pub organization: Option<String>,

    /// What to do when local and remote history diverge
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,

    /// How remote repositories are provisioned for this binding
    #[serde(default)]
    pub provisioner: ProvisionerKind,
}

/// Repository visibility on the hosting side
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Private,
    Public,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Private => "private",
            Visibility::Public => "public",
        }
    }
}

/// Conflict handling policy when a pull cannot fast-forward
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Leave the repository as-is, report failure, retry next cycle
    #[default]
    Skip,
    /// Same as skip, but emit a notification event
    Notify,
    /// Force-push local history. Operator opt-in only.
    Force,
}

/// Remote provisioner implementation selection
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProvisionerKind {
    /// Shell out to the gh CLI
    #[default]
    Cli,
    /// Talk to the REST API directly
    Api,
}

impl AccountBinding {
    /// Commit identity used for every commit made under this binding
    pub fn commit_identity(&self) -> (String, String) {
        let name = self
            .commit_name
            .clone()
            .unwrap_or_else(|| self.account_id.clone());
        let email = self
            .commit_email
            .clone()
            .unwrap_or_else(|| format!("{}@users.noreply.github.com", self.account_id));
        (name, email)
    }

    /// Owner under which remote repositories are created
    pub fn remote_owner(&self) -> &str {
        self.organization.as_deref().unwrap_or(&self.account_id)
    }

    /// Deterministic SSH remote URL for a repository name.
    ///
    /// The host alias is the routing token: `~/.ssh/config` maps each alias
    /// to its own key, so embedding it here is what keeps pushes on the
    /// right identity.
    pub fn remote_url(&self, repo_name: &str) -> String {
        format!(
            "git@{}:{}/{}.git",
            self.remote_host_alias,
            self.remote_owner(),
            repo_name
        )
    }

    /// Expanded absolute root path
    pub fn root(&self) -> PathBuf {
        PathBuf::from(self.root_path.clone())
    }
}

/// Project detection rules
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DetectionConfig {
    /// Minimum total size before a folder counts as a project
    #[serde(default = "default_min_size")]
    pub min_size_bytes: u64,

    /// Manifest-style files whose presence marks a project
    #[serde(default = "default_indicators")]
    pub project_indicators: Vec<String>,

    /// Source file extensions that mark a project
    #[serde(default = "default_extensions")]
    pub code_extensions: Vec<String>,

    /// Folder names that are never projects (also written to .gitignore)
    #[serde(default = "default_ignore_patterns")]
    pub ignore_patterns: Vec<String>,
}

/// Git behavior settings
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GitConfig {
    /// Branch name used when initializing repositories
    #[serde(default = "default_branch")]
    pub default_branch: String,

    /// Commit message template, `{timestamp}` is substituted
    #[serde(default = "default_commit_message")]
    pub commit_message: String,

    /// Pull with rebase before pushing
    #[serde(default = "default_true")]
    pub pull_before_push: bool,

    /// Whether a diverged repository under skip/notify policy counts
    /// toward the error counter like a hard failure
    #[serde(default = "default_true")]
    pub count_diverged_as_error: bool,
}

/// Daemon configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DaemonConfig {
    /// Reconciliation interval, e.g. "30m", "2h", "1d"
    #[serde(default = "default_interval")]
    pub cycle_interval: String,

    /// Quiet period after a new folder appears before it is processed
    #[serde(default = "default_settle_delay")]
    pub settle_delay: String,

    /// Maximum repositories synced in parallel per cycle
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// State document location
    #[serde(default = "default_state_file")]
    pub state_file: String,

    /// PID file location
    #[serde(default = "default_pid_file")]
    pub pid_file: String,

    /// Log file location (background mode)
    #[serde(default = "default_log_file")]
    pub log_file: String,
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format ("compact" or "pretty")
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_host_alias() -> String {
    "github.com".to_string()
}
fn default_true() -> bool {
    true
}
fn default_min_size() -> u64 {
    1024
}
fn default_indicators() -> Vec<String> {
    [
        "package.json",
        "requirements.txt",
        "Cargo.toml",
        "go.mod",
        "pom.xml",
        "Gemfile",
        "composer.json",
        "setup.py",
        "pyproject.toml",
        "README.md",
        "Makefile",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}
fn default_extensions() -> Vec<String> {
    [
        ".py", ".js", ".ts", ".jsx", ".tsx", ".java", ".cpp", ".c", ".h", ".go", ".rs", ".php",
        ".rb", ".swift", ".kt", ".cs", ".scala", ".clj", ".hs", ".elm",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}
fn default_ignore_patterns() -> Vec<String> {
    [
        "node_modules",
        "venv",
        ".venv",
        "env",
        "__pycache__",
        ".cache",
        "dist",
        "build",
        "target",
        ".idea",
        ".vscode",
        "tmp",
        "temp",
        ".DS_Store",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}
fn default_branch() -> String {
    "main".to_string()
}
fn default_commit_message() -> String {
    "Auto-backup: {timestamp}".to_string()
}
fn default_interval() -> String {
    "24h".to_string()
}
fn default_settle_delay() -> String {
    "30s".to_string()
}
fn default_max_parallel() -> usize {
    4
}
fn default_state_file() -> String {
    data_file("state.json")
}
fn default_pid_file() -> String {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        format!("{}/repovault.pid", runtime_dir)
    } else {
        "/tmp/repovault.pid".to_string()
    }
}
fn default_log_file() -> String {
    data_file("daemon.log")
}
fn data_file(name: &str) -> String {
    if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
        format!("{}/repovault/{}", data_home, name)
    } else if let Ok(home) = std::env::var("HOME") {
        format!("{}/.local/share/repovault/{}", home, name)
    } else {
        format!("/tmp/repovault-{}", name)
    }
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "compact".to_string()
}

// Default implementations
impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            min_size_bytes: default_min_size(),
            project_indicators: default_indicators(),
            code_extensions: default_extensions(),
            ignore_patterns: default_ignore_patterns(),
        }
    }
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            default_branch: default_branch(),
            commit_message: default_commit_message(),
            pull_before_push: default_true(),
            count_diverged_as_error: default_true(),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            cycle_interval: default_interval(),
            settle_delay: default_settle_delay(),
            max_parallel: default_max_parallel(),
            state_file: default_state_file(),
            pid_file: default_pid_file(),
            log_file: default_log_file(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            accounts: Vec::new(),
            detection: DetectionConfig::default(),
            git: GitConfig::default(),
            daemon: DaemonConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Parse duration strings like "30s", "30m", "1h", "2d"
pub fn parse_duration(duration_str: &str) -> Result<Duration> {
    let duration_str = duration_str.trim().to_lowercase();

    let secs = if let Some(value) = duration_str.strip_suffix('s') {
        value.parse::<u64>().context("Invalid seconds value")?
    } else if let Some(value) = duration_str.strip_suffix('m') {
        value
            .parse::<u64>()
            .map(|v| v * 60)
            .context("Invalid minutes value")?
    } else if let Some(value) = duration_str.strip_suffix('h') {
        value
            .parse::<u64>()
            .map(|v| v * 3600)
            .context("Invalid hours value")?
    } else if let Some(value) = duration_str.strip_suffix('d') {
        value
            .parse::<u64>()
            .map(|v| v * 86400)
            .context("Invalid days value")?
    } else {
        duration_str
            .parse::<u64>()
            .context("Invalid duration format. Use format like '30s', '30m', '1h', '2d'")?
    };

    Ok(Duration::from_secs(secs))
}

impl Config {
    /// Load configuration from the default location or create a default config
    pub fn load_or_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load(&config_path)
        } else {
            let config = Self::default();

            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
            }

            config.save(&config_path)?;

            tracing::info!("Created default configuration at: {:?}", config_path);
            Ok(config)
        }
    }

    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        config.expand_paths()?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Get the default configuration file path (XDG compliant)
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to get user config directory")?;

        Ok(config_dir.join("repovault").join("config.yml"))
    }

    /// Expand environment variables and `~` in configured paths
    pub fn expand_paths(&mut self) -> Result<()> {
        for binding in &mut self.accounts {
            binding.root_path = shellexpand::full(&binding.root_path)
                .with_context(|| format!("Failed to expand root path for {}", binding.account_id))?
                .into_owned();
        }

        self.daemon.state_file = shellexpand::full(&self.daemon.state_file)
            .context("Failed to expand state_file path")?
            .into_owned();

        self.daemon.pid_file = shellexpand::full(&self.daemon.pid_file)
            .context("Failed to expand pid_file path")?
            .into_owned();

        self.daemon.log_file = shellexpand::full(&self.daemon.log_file)
            .context("Failed to expand log_file path")?
            .into_owned();

        Ok(())
    }

    /// Validate binding invariants before anything starts
    pub fn validate(&self) -> Result<()> {
        if self.accounts.is_empty() {
            bail!("No account bindings configured");
        }

        let mut roots = HashSet::new();
        for binding in &self.accounts {
            if binding.account_id.is_empty() {
                bail!("Binding for {} has no account_id", binding.root_path);
            }
            // Every root maps to exactly one binding
            if !roots.insert(binding.root_path.clone()) {
                bail!("Root {} is bound more than once", binding.root_path);
            }
        }

        Ok(())
    }

    /// Find the binding that owns a root path
    pub fn binding_for_root(&self, root: &Path) -> Option<&AccountBinding> {
        self.accounts.iter().find(|b| b.root() == root)
    }

    /// Find the binding whose root contains the given path
    pub fn binding_for_path(&self, path: &Path) -> Option<&AccountBinding> {
        self.accounts.iter().find(|b| path.starts_with(b.root()))
    }

    /// Reconciliation interval as a Duration
    pub fn cycle_interval(&self) -> Result<Duration> {
        parse_duration(&self.daemon.cycle_interval)
    }

    /// Watcher settle delay as a Duration
    pub fn settle_delay(&self) -> Result<Duration> {
        parse_duration(&self.daemon.settle_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_binding(root: &str, account: &str) -> AccountBinding {
        AccountBinding {
            root_path: root.to_string(),
            account_id: account.to_string(),
            credential_ref: None,
            remote_host_alias: default_host_alias(),
            commit_name: None,
            commit_email: None,
            visibility: Visibility::Private,
            organization: None,
            conflict_policy: ConflictPolicy::Skip,
            provisioner: ProvisionerKind::Cli,
        }
    }

    #[test]
    fn test_config_default_values() {
        let config = Config::default();

        assert!(config.accounts.is_empty());
        assert_eq!(config.detection.min_size_bytes, 1024);
        assert!(config
            .detection
            .project_indicators
            .contains(&"Cargo.toml".to_string()));
        assert_eq!(config.git.default_branch, "main");
        assert!(config.git.pull_before_push);
        assert_eq!(config.daemon.cycle_interval, "24h");
        assert_eq!(config.daemon.settle_delay, "30s");
        assert_eq!(config.daemon.max_parallel, 4);
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("30m").unwrap(), Duration::from_secs(1800));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86400));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn test_commit_identity_defaults() {
        let binding = test_binding("/tmp/r", "alice");
        let (name, email) = binding.commit_identity();
        assert_eq!(name, "alice");
        assert_eq!(email, "alice@users.noreply.github.com");

        let mut custom = test_binding("/tmp/r", "alice");
        custom.commit_name = Some("Alice W".to_string());
        custom.commit_email = Some("alice@example.com".to_string());
        let (name, email) = custom.commit_identity();
        assert_eq!(name, "Alice W");
        assert_eq!(email, "alice@example.com");
    }

    #[test]
    fn test_remote_url_embeds_host_alias() {
        let mut binding = test_binding("/tmp/r", "alice");
        binding.remote_host_alias = "github.com-personal".to_string();
        assert_eq!(
            binding.remote_url("proj"),
            "git@github.com-personal:alice/proj.git"
        );

        binding.organization = Some("acme".to_string());
        assert_eq!(
            binding.remote_url("proj"),
            "git@github.com-personal:acme/proj.git"
        );
    }

    #[test]
    fn test_validate_rejects_duplicate_roots() {
        let mut config = Config::default();
        config.accounts.push(test_binding("/tmp/r1", "alice"));
        config.accounts.push(test_binding("/tmp/r1", "bob"));
        assert!(config.validate().is_err());

        config.accounts[1].root_path = "/tmp/r2".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty() {
        let config = Config::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_binding_for_path() {
        let mut config = Config::default();
        config.accounts.push(test_binding("/tmp/r1", "alice"));
        config.accounts.push(test_binding("/tmp/r2", "bob"));

        let b = config
            .binding_for_path(Path::new("/tmp/r2/project"))
            .unwrap();
        assert_eq!(b.account_id, "bob");
        assert!(config.binding_for_path(Path::new("/opt/other")).is_none());
    }

    #[test]
    fn test_config_save_and_load() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_path = temp_dir.path().join("config.yml");

        let mut config = Config::default();
        config.accounts.push(test_binding("/custom/path", "alice"));
        config.accounts[0].credential_ref = Some("GITHUB_TOKEN_ALICE".to_string());
        config.daemon.cycle_interval = "1h".to_string();

        config.save(&config_path).expect("Failed to save config");
        let loaded = Config::load(&config_path).expect("Failed to load config");

        assert_eq!(loaded.accounts.len(), 1);
        assert_eq!(loaded.accounts[0].account_id, "alice");
        assert_eq!(
            loaded.accounts[0].credential_ref,
            Some("GITHUB_TOKEN_ALICE".to_string())
        );
        assert_eq!(loaded.daemon.cycle_interval, "1h");
    }

    #[test]
    fn test_config_load_nonexistent_file() {
        let result = Config::load(Path::new("/nonexistent/path/config.yml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml_content = r#"
accounts:
  - root_path: "/home/user/personal"
    account_id: "alice"
    credential_ref: "GITHUB_TOKEN_ALICE"
    remote_host_alias: "github.com-personal"
    conflict_policy: "notify"
    provisioner: "api"
  - root_path: "/home/user/work"
    account_id: "alice-acme"
    organization: "acme"
    visibility: "public"
detection:
  min_size_bytes: 2048
git:
  pull_before_push: false
daemon:
  cycle_interval: "2h"
  settle_delay: "45s"
  max_parallel: 8
logging:
  level: "debug"
"#;

        let config: Config = serde_yaml::from_str(yaml_content).expect("Failed to parse YAML");

        assert_eq!(config.accounts.len(), 2);
        assert_eq!(config.accounts[0].remote_host_alias, "github.com-personal");
        assert_eq!(config.accounts[0].conflict_policy, ConflictPolicy::Notify);
        assert_eq!(config.accounts[0].provisioner, ProvisionerKind::Api);
        assert_eq!(config.accounts[1].organization, Some("acme".to_string()));
        assert_eq!(config.accounts[1].visibility, Visibility::Public);
        // Unspecified fields fall back to defaults
        assert_eq!(config.accounts[1].remote_host_alias, "github.com");
        assert_eq!(config.accounts[1].provisioner, ProvisionerKind::Cli);
        assert_eq!(config.detection.min_size_bytes, 2048);
        assert!(!config.git.pull_before_push);
        assert_eq!(config.daemon.cycle_interval, "2h");
        assert_eq!(config.daemon.max_parallel, 8);
        assert_eq!(config.logging.level, "debug");
    }
}
