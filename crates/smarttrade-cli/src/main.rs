//! SmartTrade CLI - sign in to the SmartTrade gateway and make
//! authenticated requests from the terminal.
//!
//! Credentials are shared with any other `smarttrade` process using the same
//! storage backend; `smarttrade watch` reports sign-ins and sign-outs made
//! elsewhere.

use std::io::{self, BufRead, Write};

use anyhow::{bail, Context, Result};
use smarttrade_core::{ApiClient, ClientConfig, SessionSignal, StorageOrigin, TabSyncBroadcaster};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// ============================================================================
// Constants
// ============================================================================

/// Directory for a daily-rotated log file, in addition to stderr
const LOG_DIR_ENV: &str = "SMARTTRADE_LOG_DIR";

const LOG_FILE_NAME: &str = "smarttrade.log";

const USAGE: &str = "\
Usage: smarttrade <command> [args]

Commands:
  login [username]   Sign in (prompts for the password)
  logout             Sign out and clear stored credentials
  whoami             Show the signed-in user
  status             Show stored credential state
  get <endpoint>     GET an endpoint and print the JSON response
  sessions           List signed-in devices
  revoke <id>        Sign out one device
  logout-others      Sign out every other device
  watch              Report sign-ins and sign-outs made by other processes

Environment:
  SMARTTRADE_API_URL   Gateway address override
  SMARTTRADE_LOG_DIR   Also write logs to a daily file in this directory
  RUST_LOG             Log filter (default: warn)";

/// Initialize the tracing subscriber for logging.
/// The returned guard flushes the file writer and must be kept alive.
fn init_tracing() -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=smarttrade_core=debug)
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match std::env::var(LOG_DIR_ENV).ok().filter(|d| !d.is_empty()) {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_NAME);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_writer(writer).with_ansi(false)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let _log_guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        println!("{}", USAGE);
        return Ok(());
    };

    let mut config = ClientConfig::load()?;
    let origin = StorageOrigin::new(config.open_backend()?);
    let client = ApiClient::new(&config, origin.open_context(&config.credentials_key))?;
    info!(api = %client.base_url(), backend = client.store().backend_name(), "smarttrade starting");

    match command {
        "login" => login(&client, &mut config, args.get(1).cloned()).await,
        "logout" => {
            client.logout().await;
            println!("Signed out");
            Ok(())
        }
        "whoami" => whoami(&client).await,
        "status" => {
            status(&client);
            Ok(())
        }
        "get" => {
            let endpoint = args.get(1).context("Usage: smarttrade get <endpoint>")?;
            let body: serde_json::Value = client.get(endpoint).await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
            Ok(())
        }
        "sessions" => sessions(&client).await,
        "revoke" => {
            let id = args.get(1).context("Usage: smarttrade revoke <session-id>")?;
            let response = client.revoke_session(id).await?;
            println!("{}", non_empty(&response.message, "Session revoked"));
            Ok(())
        }
        "logout-others" => {
            let response = client.logout_all_other_devices().await?;
            println!("{}", non_empty(&response.message, "Other devices signed out"));
            Ok(())
        }
        "watch" => watch(&origin, &client, &config).await,
        "help" | "--help" | "-h" => {
            println!("{}", USAGE);
            Ok(())
        }
        other => bail!("Unknown command '{}'\n\n{}", other, USAGE),
    }
}

async fn login(client: &ApiClient, config: &mut ClientConfig, username: Option<String>) -> Result<()> {
    let username = match username.or_else(|| config.last_username.clone()) {
        Some(name) => name,
        None => prompt("Username: ")?,
    };
    if username.is_empty() {
        bail!("Username required");
    }

    let password = rpassword::prompt_password(format!("Password for {}: ", username))?;
    if password.is_empty() {
        bail!("Password required");
    }

    let response = client.login(&username, &password, true).await?;

    // Remember the username for next time
    config.last_username = Some(username);
    if let Err(e) = config.save() {
        tracing::warn!(error = %e, "Failed to save config");
    }

    println!("Signed in as {}", response.display_name());
    Ok(())
}

async fn whoami(client: &ApiClient) -> Result<()> {
    match client.current_user().await? {
        Some(user) => println!("{}", serde_json::to_string_pretty(&user)?),
        None => println!("Not signed in"),
    }
    Ok(())
}

fn status(client: &ApiClient) {
    let Some(credentials) = client.store().get() else {
        println!("Not signed in ({} storage)", client.store().backend_name());
        return;
    };

    println!("Signed in ({} storage)", client.store().backend_name());
    println!("  refresh token: {}", if credentials.can_refresh() { "present" } else { "absent" });
    match credentials.minutes_until_expiry() {
        Some(_) if credentials.is_expired() => println!("  access token:  expired"),
        Some(minutes) if credentials.needs_refresh() => {
            println!("  access token:  expires in {} min (will refresh on next use)", minutes)
        }
        Some(minutes) => println!("  access token:  expires in {} min", minutes),
        None => println!("  access token:  no known expiry"),
    }
}

async fn sessions(client: &ApiClient) -> Result<()> {
    let sessions = client.sessions().await?;
    if sessions.is_empty() {
        println!("No active sessions");
        return Ok(());
    }
    for session in sessions {
        let marker = if session.current { "*" } else { " " };
        let location = session.location.as_deref().unwrap_or("-");
        let last_active = session.last_active.as_deref().unwrap_or("-");
        println!(
            "{} {:<24} {:<36} {:<20} {}",
            marker,
            session.id,
            session.display_name(),
            location,
            last_active
        );
    }
    Ok(())
}

async fn watch(origin: &StorageOrigin, client: &ApiClient, config: &ClientConfig) -> Result<()> {
    let watcher = origin.spawn_external_watcher(&config.credentials_key, config.sync_poll_interval());
    let sync = TabSyncBroadcaster::new(client.store().clone());
    let subscription = sync.subscribe(|signal| match signal {
        SessionSignal::SignedIn => println!("signed in elsewhere"),
        SessionSignal::SignedOut => println!("signed out elsewhere"),
    });

    println!("Watching for session changes (Ctrl+C to stop)");
    tokio::signal::ctrl_c().await?;

    subscription.unsubscribe();
    watcher.abort();
    Ok(())
}

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

fn non_empty<'a>(message: &'a str, fallback: &'a str) -> &'a str {
    if message.trim().is_empty() {
        fallback
    } else {
        message
    }
}
