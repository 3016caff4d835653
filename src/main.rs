use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use evergreen_vault::auth::{AuthMethod, BrowserOpener, OidcSettings};
use evergreen_vault::config::default_config_path;
use evergreen_vault::duration::format_duration;
use evergreen_vault::{Config, SecretsManager};
use serde_json::{json, Value};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn parse_duration_arg(s: &str) -> Result<Duration, String> {
    evergreen_vault::duration::parse_duration(s).map_err(|e| e.to_string())
}

#[derive(Parser, Debug)]
#[command(name = "evergreen-vault")]
#[command(about = "Read Vault secrets and keep them fresh")]
struct Cli {
    /// Path to config file. When it does not exist, VAULT_* environment
    /// variables are used instead.
    #[arg(short, long, default_value_os_t = default_config_path())]
    config: PathBuf,

    /// Log in through the browser with OIDC instead of the configured method.
    #[arg(long, global = true)]
    oidc: bool,

    /// OIDC role to request (with --oidc).
    #[arg(long, global = true, value_name = "ROLE")]
    role: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a secret once.
    Get {
        path: String,

        /// Print only this field.
        #[arg(long)]
        key: Option<String>,
    },
    /// Print a secret periodically while it refreshes in the background.
    Watch {
        path: String,

        /// How often to print (e.g. "500ms", "10s", "1m").
        #[arg(long, default_value = "10s", value_parser = parse_duration_arg)]
        every: Duration,
    },
    /// Install a base64 service-account key as the Google default credentials.
    GoogleCredentials { path: String, key: String },
    /// Authenticate and describe the token.
    Status,
}

/// Prints the login URL for the user to open.
struct PrintBrowserOpener;

#[async_trait]
impl BrowserOpener for PrintBrowserOpener {
    async fn open(&self, auth_url: &str) -> evergreen_vault::Result<()> {
        eprintln!("Complete the login in your browser:\n\n    {auth_url}\n");
        Ok(())
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = if cli.config.exists() {
        Config::load(&cli.config)?
    } else if cli.oidc {
        Config::oidc_from_env(OidcSettings::default())?
    } else {
        Config::from_env().with_context(|| {
            format!(
                "No config file at {} and the environment does not describe one",
                cli.config.display()
            )
        })?
    };

    if cli.oidc {
        let mut settings = match config.auth {
            AuthMethod::Oidc(settings) => settings,
            _ => OidcSettings::default(),
        };
        if let Some(role) = &cli.role {
            settings.role = role.clone();
        }
        config.auth = AuthMethod::Oidc(settings);
    }

    Ok(config)
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_level(true)
                .json(),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let (manager, mut errors) = SecretsManager::builder(config)
        .browser_opener(Arc::new(PrintBrowserOpener))
        .build()
        .await
        .context("Failed to start secrets manager")?;

    match cli.command {
        Command::Get { path, key } => {
            let accessor = manager.get_secret(&path).await?;
            let data = accessor.get();
            match key {
                Some(key) => {
                    let value = data
                        .get(&key)
                        .with_context(|| format!("Key {key} not found in secret {path}"))?;
                    println!("{}", render(value));
                }
                None => println!("{}", serde_json::to_string_pretty(&data)?),
            }
        }
        Command::Watch { path, every } => {
            let accessor = manager.get_secret(&path).await?;
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let snapshot = accessor.snapshot();
                        let line = json!({
                            "path": snapshot.path,
                            "fetched_at": snapshot.fetched_at,
                            "lease": format_duration(snapshot.lease_duration),
                            "renewable": snapshot.renewable,
                            "data": snapshot.data,
                        });
                        println!("{line}");
                    }
                    Some(err) = errors.recv() => {
                        eprintln!("background error: {err}");
                    }
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }
        Command::GoogleCredentials { path, key } => {
            let file = manager.set_default_google_credentials(&path, &key).await?;
            println!("{}", file.display());
        }
        Command::Status => {
            let status = manager.token_status();
            let line = json!({
                "address": manager.address(),
                "method": status.method,
                "renewable": status.renewable,
                "lease": format_duration(status.lease_duration),
                "issued_at": status.issued_at,
            });
            println!("{}", serde_json::to_string_pretty(&line)?);
        }
    }

    manager.shutdown().await;
    Ok(())
}
