use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Longest accepted token lifetime (10 years)
pub const MAX_TOKEN_TTL_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// DWare session service and client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Server host address
    #[arg(short = 'H', long, env = "SERVER_HOST", default_value = "0.0.0.0", global = true)]
    pub host: String,

    /// Server port
    #[arg(short, long, env = "SERVER_PORT", default_value = "5000", global = true)]
    pub port: u16,

    /// Secret used to sign access and refresh tokens
    #[arg(long, env = "JWT_SECRET", hide_env_values = true, global = true)]
    pub jwt_secret: Option<String>,

    /// Access token lifetime in seconds
    #[arg(long, env = "ACCESS_TOKEN_TTL", default_value = "3600", global = true)]
    pub access_ttl: u64,

    /// Refresh token lifetime in seconds
    #[arg(long, env = "REFRESH_TOKEN_TTL", default_value = "604800", global = true)]
    pub refresh_ttl: u64,

    /// Allowed browser origin (empty allows any)
    #[arg(long, env = "CORS_ORIGIN", default_value = "http://localhost:5173", global = true)]
    pub cors_origin: String,

    /// Base URL of the auth backend used by the client commands
    #[arg(long, env = "BACKEND_URL", default_value = "http://localhost:5000", global = true)]
    pub backend_url: String,

    /// Base URL of the automation platform
    #[arg(
        long,
        env = "AUTOMATOR_URL",
        default_value = "https://dwareautomator.mresult.com",
        global = true
    )]
    pub automator_url: String,

    /// Base URL of the token refresh service (defaults to the automator)
    #[arg(long, env = "REFRESH_URL", global = true)]
    pub refresh_url: Option<String>,

    /// Path to the local session database
    #[arg(short = 's', long, env = "SESSION_STORE", global = true)]
    pub store: Option<String>,

    /// HTTP connect timeout in seconds
    #[arg(long, env = "HTTP_CONNECT_TIMEOUT", default_value = "30", global = true)]
    pub http_connect_timeout: u64,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "60", global = true)]
    pub http_timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "LOG_FORMAT", default_value = "text", global = true)]
    pub log_format: String,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run the auth backend (default)
    Serve,
    /// Sign in and store the session locally
    Login {
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        password: Option<String>,
        /// Sign in against the automation platform as a client
        #[arg(long)]
        client: bool,
    },
    /// Show the current session
    Whoami {
        /// Re-fetch the profile from the backend
        #[arg(long)]
        fetch: bool,
    },
    /// Exchange the refresh token for a new access token
    Refresh,
    /// Clear every stored session
    Logout,
    /// Authorized GET against the automation platform
    Call {
        path: String,
        /// Use the client session instead of the developer one
        #[arg(long)]
        client: bool,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub command: Command,

    // Server settings
    pub server_host: String,
    pub server_port: u16,
    pub cors_origin: Option<String>,

    // Tokens
    pub jwt_secret: Option<String>,
    pub access_token_ttl: u64,
    pub refresh_token_ttl: u64,

    // Client endpoints
    pub backend_url: String,
    pub automator_url: String,
    pub refresh_url: String,

    // Local session store
    pub store_path: PathBuf,

    // HTTP client
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,

    // Logging
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Config {
    /// Load configuration from all sources with priority: CLI > ENV > defaults
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        Self::from_args(CliArgs::parse())
    }

    /// Build a config from already parsed arguments
    pub fn from_args(args: CliArgs) -> Result<Self> {
        let store_path = match args.store.filter(|s| !s.trim().is_empty()) {
            Some(path) => expand_tilde(&path),
            None => default_store_path().context("Could not determine a data directory; set SESSION_STORE")?,
        };

        let refresh_url = args
            .refresh_url
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| args.automator_url.clone());

        let cors_origin = Some(args.cors_origin.trim().to_string()).filter(|s| !s.is_empty());

        Ok(Config {
            command: args.command.unwrap_or(Command::Serve),
            server_host: args.host,
            server_port: args.port,
            cors_origin,
            jwt_secret: args.jwt_secret.filter(|s| !s.is_empty()),
            access_token_ttl: args.access_ttl,
            refresh_token_ttl: args.refresh_ttl,
            backend_url: args.backend_url,
            automator_url: args.automator_url,
            refresh_url,
            store_path,
            http_connect_timeout: args.http_connect_timeout,
            http_request_timeout: args.http_timeout,
            log_level: args.log_level,
            log_format: parse_log_format(&args.log_format),
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.command == Command::Serve {
            if self.jwt_secret.is_none() {
                anyhow::bail!("JWT_SECRET is required to serve (use --jwt-secret or set JWT_SECRET)");
            }
            for (name, ttl) in [
                ("ACCESS_TOKEN_TTL", self.access_token_ttl),
                ("REFRESH_TOKEN_TTL", self.refresh_token_ttl),
            ] {
                if ttl == 0 || ttl > MAX_TOKEN_TTL_SECS {
                    anyhow::bail!(
                        "{} must be between 1 and {} seconds, got {}",
                        name,
                        MAX_TOKEN_TTL_SECS,
                        ttl
                    );
                }
            }
        }

        for (name, url) in [
            ("BACKEND_URL", &self.backend_url),
            ("AUTOMATOR_URL", &self.automator_url),
            ("REFRESH_URL", &self.refresh_url),
        ] {
            reqwest::Url::parse(url).with_context(|| format!("{} is not a valid URL: {}", name, url))?;
        }

        Ok(())
    }
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

fn default_store_path() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("dware-session").join("session.sqlite3"))
}

/// Parse log format from string
fn parse_log_format(s: &str) -> LogFormat {
    match s.to_lowercase().as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    }
}
