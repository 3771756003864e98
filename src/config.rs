use crate::error::StartupError;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// The front-end dev server to launch
    pub dev_server: DevServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// HTTP port (default: 5000)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Externally reachable address of this server, handed to the dev server.
    /// Defaults to `http://<bind>:<port>`.
    pub public_url: Option<String>,

    /// Maximum idle connections to the dev server (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl ServerConfig {
    /// The address the dev server should use to reach this server
    pub fn host_address(&self) -> String {
        self.public_url
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", self.bind, self.port))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            public_url: None,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

/// Configuration for the dev server script
///
/// # Security Warning
///
/// `package_manager`, `script` and `args` are executed as given. Configuration
/// files must come from a trusted source.
#[derive(Debug, Deserialize, Clone)]
pub struct DevServerConfig {
    /// Directory containing the front-end project (the script's working directory)
    pub source_path: String,

    /// Name of the package script to run (e.g. "start", "dev")
    pub script: String,

    /// Extra arguments appended after `--port <N> --host localhost`
    #[serde(default)]
    pub args: Vec<String>,

    /// Additional environment variables for the script
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Package manager executable (default: npm)
    #[serde(default = "default_package_manager")]
    pub package_manager: String,

    /// Arguments placed before the script name (default: ["run"])
    #[serde(default = "default_run_command")]
    pub run_command: Vec<String>,

    /// Text the script prints on stdout once it is listening (default: DONE)
    #[serde(default = "default_readiness_marker")]
    pub readiness_marker: String,

    /// How long the script may take to print the readiness marker
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// How long a single request waits for the dev server to become ready
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Grace period between SIGTERM and SIGKILL on shutdown
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,
}

impl DevServerConfig {
    /// Create a config running `npm run <script>` in `source_path`
    pub fn new(source_path: &str, script: &str) -> Self {
        Self {
            source_path: source_path.to_string(),
            script: script.to_string(),
            args: Vec::new(),
            env: HashMap::new(),
            package_manager: default_package_manager(),
            run_command: default_run_command(),
            readiness_marker: default_readiness_marker(),
            startup_timeout_secs: default_startup_timeout(),
            request_timeout_secs: default_request_timeout(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_package_manager(mut self, program: &str, run_command: Vec<String>) -> Self {
        self.package_manager = program.to_string();
        self.run_command = run_command;
        self
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    /// The readiness marker as a literal, case-sensitive pattern
    pub fn readiness_pattern(&self) -> Regex {
        Regex::new(&regex::escape(&self.readiness_marker))
            .expect("escaped literal is a valid pattern")
    }

    /// Check the fields the script runner cannot do without
    pub fn validate(&self) -> Result<(), StartupError> {
        if self.source_path.trim().is_empty() {
            return Err(StartupError::InvalidConfiguration(
                "source_path cannot be empty".to_string(),
            ));
        }
        if self.script.trim().is_empty() {
            return Err(StartupError::InvalidConfiguration(
                "script cannot be empty".to_string(),
            ));
        }
        if self.package_manager.trim().is_empty() {
            return Err(StartupError::InvalidConfiguration(
                "package_manager cannot be empty".to_string(),
            ));
        }
        if self.readiness_marker.is_empty() {
            return Err(StartupError::InvalidConfiguration(
                "readiness_marker cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_listen_port() -> u16 {
    5000
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_package_manager() -> String {
    "npm".to_string()
}

fn default_run_command() -> Vec<String> {
    vec!["run".to_string()]
}

fn default_readiness_marker() -> String {
    "DONE".to_string()
}

fn default_startup_timeout() -> u64 {
    60
}

fn default_request_timeout() -> u64 {
    30
}

fn default_shutdown_grace_period() -> u64 {
    5
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("server.port cannot be 0");
        }
        self.dev_server.validate()?;
        if self.dev_server.request_timeout_secs == 0 {
            anyhow::bail!("dev_server.request_timeout_secs must be greater than 0");
        }
        if self.dev_server.startup_timeout_secs == 0 {
            anyhow::bail!("dev_server.startup_timeout_secs must be greater than 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 8080
bind = "0.0.0.0"
public_url = "https://dev.example.test"

[dev_server]
source_path = "ClientApp"
script = "dev"
args = ["--strictPort"]
package_manager = "pnpm"
readiness_marker = "ready in"
startup_timeout_secs = 120
request_timeout_secs = 45

[dev_server.env]
NODE_ENV = "development"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.host_address(), "https://dev.example.test");

        let dev = &config.dev_server;
        assert_eq!(dev.source_path, "ClientApp");
        assert_eq!(dev.script, "dev");
        assert_eq!(dev.args, vec!["--strictPort"]);
        assert_eq!(dev.package_manager, "pnpm");
        assert_eq!(dev.run_command, vec!["run"]);
        assert_eq!(dev.readiness_marker, "ready in");
        assert_eq!(dev.startup_timeout(), Duration::from_secs(120));
        assert_eq!(dev.request_timeout(), Duration::from_secs(45));
        assert_eq!(dev.env.get("NODE_ENV"), Some(&"development".to_string()));
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let toml = r#"
[dev_server]
source_path = "ClientApp"
script = "start"
"#;

        let config: Config = toml::from_str(toml).unwrap();

        assert_eq!(config.server.port, 5000);
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.host_address(), "http://127.0.0.1:5000");
        assert_eq!(config.server.pool_max_idle_per_host, 10);
        assert_eq!(config.server.pool_idle_timeout_secs, 90);

        let dev = &config.dev_server;
        assert!(dev.args.is_empty());
        assert!(dev.env.is_empty());
        assert_eq!(dev.package_manager, "npm");
        assert_eq!(dev.readiness_marker, "DONE");
        assert_eq!(dev.startup_timeout(), Duration::from_secs(60));
        assert_eq!(dev.request_timeout(), Duration::from_secs(30));
        assert_eq!(dev.shutdown_grace_period(), Duration::from_secs(5));
    }

    #[test]
    fn test_missing_dev_server_section_is_an_error() {
        let result: Result<Config, _> = toml::from_str("[server]\nport = 8080\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_empty_fields() {
        let err = DevServerConfig::new("", "start").validate().unwrap_err();
        assert!(err.to_string().contains("source_path"));

        let err = DevServerConfig::new("ClientApp", "  ").validate().unwrap_err();
        assert!(err.to_string().contains("script"));

        let mut config = DevServerConfig::new("ClientApp", "start");
        config.readiness_marker = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_timeouts() {
        let mut config = Config {
            server: ServerConfig::default(),
            dev_server: DevServerConfig::new("ClientApp", "start"),
        };
        config.validate().unwrap();

        config.dev_server.request_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_readiness_pattern_is_literal() {
        let mut config = DevServerConfig::new("ClientApp", "start");
        config.readiness_marker = "ready (1.2s)".to_string();
        let pattern = config.readiness_pattern();

        assert!(pattern.is_match("vite ready (1.2s) on port 5173"));
        assert!(!pattern.is_match("ready 1.2s"));
        assert!(!DevServerConfig::new("a", "b").readiness_pattern().is_match("done"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devgate.toml");
        std::fs::write(
            &path,
            "[dev_server]\nsource_path = \"web\"\nscript = \"start\"\n",
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.dev_server.source_path, "web");

        std::fs::write(&path, "[dev_server]\nsource_path = \"\"\nscript = \"start\"\n").unwrap();
        assert!(Config::load(&path).is_err());
    }
}
