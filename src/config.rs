use std::path::PathBuf;

/// Hard ceiling on page size for `/messages` and `/messages-snapshot`.
pub const MAX_PAGE: usize = 200;

/// Usernames are cut to this many characters.
pub const MAX_USERNAME_CHARS: usize = 24;

#[derive(Clone, Debug)]
pub struct Config {
    pub bind_addr: String,
    pub port: u16,
    /// Empty means any world id is accepted.
    pub allowed_worlds: Vec<String>,
    pub max_message_len: usize,
    pub cooldown_ms: u64,
    pub default_limit: usize,
    pub max_messages: usize,
    pub write_token: Option<String>,
    pub data_dir: PathBuf,
    pub flush_debounce_ms: u64,
    pub limiter_sweep_secs: u64,
    pub github: GithubConfig,
}

#[derive(Clone, Debug, Default)]
pub struct GithubConfig {
    pub enabled: bool,
    pub token: Option<String>,
    /// `owner/name`
    pub repo: Option<String>,
    pub branch: String,
    pub path_prefix: String,
    pub api_base: String,
}

impl GithubConfig {
    /// Enabled and fully configured.
    pub fn is_active(&self) -> bool {
        self.enabled && self.token.is_some() && self.repo.is_some()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 8080,
            allowed_worlds: Vec::new(),
            max_message_len: 280,
            cooldown_ms: 1000,
            default_limit: 50,
            max_messages: 1000,
            write_token: None,
            data_dir: PathBuf::from("./data"),
            flush_debounce_ms: 250,
            limiter_sweep_secs: 300,
            github: GithubConfig {
                enabled: false,
                token: None,
                repo: None,
                branch: "main".to_string(),
                path_prefix: "data".to_string(),
                api_base: "https://api.github.com".to_string(),
            },
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let d = Self::default();
        let github_enabled = std::env::var("GITHUB_BACKUP")
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        Self {
            bind_addr: std::env::var("BIND_ADDR").unwrap_or(d.bind_addr),
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.port),
            allowed_worlds: std::env::var("ALLOWED_WORLDS")
                .map(|v| parse_list(&v))
                .unwrap_or_default(),
            max_message_len: std::env::var("MAX_MESSAGE_LEN")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.max_message_len),
            cooldown_ms: std::env::var("COOLDOWN_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.cooldown_ms),
            default_limit: std::env::var("DEFAULT_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.default_limit),
            max_messages: std::env::var("MAX_MESSAGES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.max_messages),
            write_token: std::env::var("WRITE_TOKEN").ok().filter(|v| !v.is_empty()),
            data_dir: std::env::var("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.data_dir),
            flush_debounce_ms: std::env::var("FLUSH_DEBOUNCE_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.flush_debounce_ms),
            limiter_sweep_secs: std::env::var("LIMITER_SWEEP_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.limiter_sweep_secs),
            github: GithubConfig {
                enabled: github_enabled,
                token: std::env::var("GITHUB_TOKEN").ok().filter(|v| !v.is_empty()),
                repo: std::env::var("GITHUB_REPO").ok().filter(|v| v.contains('/')),
                branch: std::env::var("GITHUB_BRANCH").unwrap_or(d.github.branch),
                path_prefix: std::env::var("GITHUB_PATH").unwrap_or(d.github.path_prefix),
                api_base: std::env::var("GITHUB_API").unwrap_or(d.github.api_base),
            },
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }

    pub fn world_allowed(&self, world_id: &str) -> bool {
        self.allowed_worlds.is_empty() || self.allowed_worlds.iter().any(|w| w == world_id)
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}
