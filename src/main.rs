use anyhow::{Context, Result};
use dialoguer::{Input, Password};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use dware_session::auth::{
    AuthEndpoints, AuthService, CredentialStore, GuardDecision, IdentityKind, SqliteStore,
    UserProfile,
};
use dware_session::config::{Command, Config, LogFormat};
use dware_session::http_client::AutomatorClient;
use dware_session::{middleware, routes};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (for log level)
    let config = Config::load()?;
    config.validate()?;

    init_logging(&config);

    match config.command.clone() {
        Command::Serve => serve(config).await,
        Command::Login {
            email,
            password,
            client,
        } => login(&config, email, password, client).await,
        Command::Whoami { fetch } => whoami(&config, fetch).await,
        Command::Refresh => refresh(&config).await,
        Command::Logout => {
            let auth = open_session(&config)?;
            auth.logout();
            println!("Logged out");
            Ok(())
        }
        Command::Call { path, client } => call(&config, &path, client).await,
    }
}

/// Initialize logging with the configured level and format
fn init_logging(config: &Config) {
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true);

    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Run the auth backend until Ctrl+C/SIGTERM
async fn serve(config: Config) -> Result<()> {
    tracing::info!("DWare session service starting...");

    let config = Arc::new(config);
    let state = routes::AppState::new(config.clone())?;

    let app = routes::build_router(state)
        .layer(middleware::cors_layer(config.cors_origin.as_deref()))
        .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.server_host, config.server_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    print_startup_banner(&config);
    tracing::info!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Build an auth service over the on-disk session store
fn open_session(config: &Config) -> Result<Arc<AuthService>> {
    let backend = SqliteStore::open(&config.store_path)?;
    let client =
        AuthService::build_client(config.http_connect_timeout, config.http_request_timeout)?;
    let endpoints = AuthEndpoints::new(&config.backend_url, &config.automator_url)
        .with_refresh_url(&config.refresh_url);

    tracing::debug!(store = %config.store_path.display(), "Opened session store");

    Ok(Arc::new(AuthService::new(
        client,
        endpoints,
        CredentialStore::new(Arc::new(backend)),
    )))
}

async fn login(
    config: &Config,
    email: Option<String>,
    password: Option<String>,
    client: bool,
) -> Result<()> {
    let email = match email {
        Some(email) => email,
        None => Input::new()
            .with_prompt("Email")
            .interact_text()
            .context("Failed to read email")?,
    };
    let password = match password {
        Some(password) => password,
        None => Password::new()
            .with_prompt("Password")
            .interact()
            .context("Failed to read password")?,
    };

    let auth = open_session(config)?;
    let user = if client {
        auth.client_login(&email, &password).await?
    } else {
        auth.login(&email, &password).await?
    };

    println!("Logged in as {}", user.display_name());
    print_profile(&user)
}

async fn whoami(config: &Config, fetch: bool) -> Result<()> {
    let auth = open_session(config)?;

    if fetch {
        auth.fetch_user_details().await?;
    }

    match auth.guard() {
        GuardDecision::Render => println!("Session: active ({:?})", auth.state()),
        GuardDecision::Redirect { to } => {
            println!("Session: none (redirect to {})", to);
            return Ok(());
        }
    }

    match auth.current_user() {
        Some(user) => print_profile(&user),
        None => {
            println!("No profile stored");
            Ok(())
        }
    }
}

async fn refresh(config: &Config) -> Result<()> {
    let auth = open_session(config)?;

    if auth.refresh_token().await {
        println!("Access token refreshed");
        Ok(())
    } else {
        anyhow::bail!("Token refresh failed; log in again")
    }
}

async fn call(config: &Config, path: &str, client: bool) -> Result<()> {
    let auth = open_session(config)?;
    let kind = if client {
        IdentityKind::Client
    } else {
        IdentityKind::Developer
    };

    let automator = AutomatorClient::for_automator(auth, kind);
    let body: serde_json::Value = automator.get_json(path).await?;

    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

fn print_profile(user: &UserProfile) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(user)?);
    Ok(())
}

/// Print startup banner
fn print_startup_banner(config: &Config) {
    println!();
    println!("  DWare session service");
    println!("  Version:     {}", env!("CARGO_PKG_VERSION"));
    println!(
        "  Server:      http://{}:{}",
        config.server_host, config.server_port
    );
    println!(
        "  CORS origin: {}",
        config.cors_origin.as_deref().unwrap_or("*")
    );
    println!("  Log Level:   {}", config.log_level);
    println!();
}

/// Handle graceful shutdown signal
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal, initiating graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown...");
        },
    }
}
