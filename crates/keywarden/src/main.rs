use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::Client;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

// ── CLI definition ───────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "keywarden", about = "Keywarden — license key backend", version)]
struct Cli {
    /// Keywarden server URL (default: http://localhost:8080 or $KEYWARDEN_SERVER)
    #[arg(long, env = "KEYWARDEN_SERVER", default_value = "http://localhost:8080")]
    server: String,

    /// Admin bearer token ($KEYWARDEN_TOKEN), obtained via `login`
    #[arg(long, env = "KEYWARDEN_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the Keywarden HTTP server
    Serve {
        /// Port to listen on (default: $KEYWARDEN_PORT or 8080)
        #[arg(long, env = "KEYWARDEN_PORT", default_value = "8080")]
        port: u16,
        /// Host to bind (default: $KEYWARDEN_HOST or 0.0.0.0)
        #[arg(long, env = "KEYWARDEN_HOST", default_value = "0.0.0.0")]
        host: String,
    },
    /// Log in and print an admin bearer token
    Login {
        username: String,
        password: String,
    },
    /// Issue a new license key
    Create {
        /// Key type: trial, month, year or lifetime
        #[arg(name = "TYPE")]
        key_type: String,
        /// Free-form note attached to the key
        #[arg(long)]
        note: Option<String>,
    },
    /// List all license keys
    List,
    /// Show one license key
    Get {
        key: String,
    },
    /// Lock a key (validation will report it inactive)
    Lock {
        key: String,
    },
    /// Unlock a previously locked key
    Unlock {
        key: String,
    },
    /// Delete a license key
    Delete {
        key: String,
    },
    /// Run a validation check against a key, as the product would
    Validate {
        key: String,
        /// Machine hash to report
        #[arg(long)]
        machine_hash: Option<String>,
    },
}

// ── Entry point ──────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("KEYWARDEN_LOG_LEVEL")
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port, host } => cmd_serve(host, port).await,

        Commands::Login { username, password } => {
            cmd_login(&cli.server, &username, &password).await
        }

        Commands::Create { key_type, note } => {
            let token = require_token(&cli.token)?;
            cmd_create(&cli.server, &token, &key_type, note.as_deref()).await
        }

        Commands::List => {
            let token = require_token(&cli.token)?;
            cmd_list(&cli.server, &token).await
        }

        Commands::Get { key } => {
            let token = require_token(&cli.token)?;
            cmd_get(&cli.server, &token, &key).await
        }

        Commands::Lock { key } => {
            let token = require_token(&cli.token)?;
            cmd_set_active(&cli.server, &token, &key, false).await
        }

        Commands::Unlock { key } => {
            let token = require_token(&cli.token)?;
            cmd_set_active(&cli.server, &token, &key, true).await
        }

        Commands::Delete { key } => {
            let token = require_token(&cli.token)?;
            cmd_delete(&cli.server, &token, &key).await
        }

        Commands::Validate { key, machine_hash } => {
            cmd_validate(&cli.server, &key, machine_hash.as_deref()).await
        }
    }
}

fn require_token(token: &Option<String>) -> Result<String> {
    token
        .clone()
        .context("admin token required — run `keywarden login` or set $KEYWARDEN_TOKEN")
}

// ── Command implementations ──────────────────────────────────────────────────

async fn cmd_serve(host: String, port: u16) -> Result<()> {
    let cfg = keywarden_server::ServerConfig {
        host,
        port,
        ..Default::default()
    };
    keywarden_server::run(cfg).await
}

async fn cmd_login(server: &str, username: &str, password: &str) -> Result<()> {
    let client = Client::new();
    let resp = client
        .post(format!("{}/auth/login", server.trim_end_matches('/')))
        .json(&serde_json::json!({"username": username, "password": password}))
        .send()
        .await
        .context("HTTP request failed")?;

    let status = resp.status();
    let json: Value = resp.json().await.context("parse response")?;
    if !status.is_success() {
        anyhow::bail!("{}", json["error"].as_str().unwrap_or("login failed"));
    }

    println!("{}", json["access_token"].as_str().unwrap_or(""));
    Ok(())
}

async fn cmd_create(server: &str, token: &str, key_type: &str, note: Option<&str>) -> Result<()> {
    let json = post_json(
        server,
        token,
        "/keys/create",
        serde_json::json!({"type": key_type, "note": note}),
    )
    .await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}

async fn cmd_list(server: &str, token: &str) -> Result<()> {
    let client = Client::new();
    let resp = client
        .get(format!("{}/keys/list", server.trim_end_matches('/')))
        .bearer_auth(token)
        .send()
        .await
        .context("HTTP request failed")?;
    let json = check(resp).await?;

    let empty = Vec::new();
    for key in json["keys"].as_array().unwrap_or(&empty) {
        let status = match (key["is_active"].as_bool(), key["expires_at"].as_i64()) {
            (Some(false), _) => "locked",
            _ => "active",
        };
        println!(
            "{}  {}  {}  {}",
            key["key_value"].as_str().unwrap_or("?"),
            key["key_type"].as_str().unwrap_or("?"),
            status,
            key["note"].as_str().unwrap_or(""),
        );
    }
    Ok(())
}

async fn cmd_get(server: &str, token: &str, key: &str) -> Result<()> {
    let client = Client::new();
    let resp = client
        .get(format!("{}/keys/{}", server.trim_end_matches('/'), key))
        .bearer_auth(token)
        .send()
        .await
        .context("HTTP request failed")?;
    let json = check(resp).await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}

async fn cmd_set_active(server: &str, token: &str, key: &str, active: bool) -> Result<()> {
    let client = Client::new();
    let resp = client
        .put(format!("{}/keys/{}", server.trim_end_matches('/'), key))
        .bearer_auth(token)
        .json(&serde_json::json!({"is_active": active}))
        .send()
        .await
        .context("HTTP request failed")?;
    check(resp).await?;
    println!("✓ {} {}", if active { "unlocked" } else { "locked" }, key);
    Ok(())
}

async fn cmd_delete(server: &str, token: &str, key: &str) -> Result<()> {
    let client = Client::new();
    let resp = client
        .delete(format!("{}/keys/{}", server.trim_end_matches('/'), key))
        .bearer_auth(token)
        .send()
        .await
        .context("HTTP request failed")?;

    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        anyhow::bail!("server returned {status}: {text}");
    }
    println!("✓ deleted {key}");
    Ok(())
}

async fn cmd_validate(server: &str, key: &str, machine_hash: Option<&str>) -> Result<()> {
    let client = Client::new();
    let resp = client
        .post(format!("{}/keys/validate", server.trim_end_matches('/')))
        .json(&serde_json::json!({
            "key_value": key,
            "machine_name": "keywarden-cli",
            "machine_hash": machine_hash,
        }))
        .send()
        .await
        .context("HTTP request failed")?;
    let json = check(resp).await?;

    if json["valid"].as_bool().unwrap_or(false) {
        println!("✓ valid");
    } else {
        println!("✗ invalid ({})", json["reason"].as_str().unwrap_or("unknown"));
    }
    Ok(())
}

// ── Helpers ──────────────────────────────────────────────────────────────────

async fn post_json(server: &str, token: &str, path: &str, body: Value) -> Result<Value> {
    let client = Client::new();
    let resp = client
        .post(format!("{}{}", server.trim_end_matches('/'), path))
        .bearer_auth(token)
        .json(&body)
        .send()
        .await
        .context("HTTP request failed")?;
    check(resp).await
}

async fn check(resp: reqwest::Response) -> Result<Value> {
    let status = resp.status();
    let json: Value = resp.json().await.context("parse response")?;
    if !status.is_success() {
        anyhow::bail!(
            "server returned {status}: {}",
            json["error"].as_str().unwrap_or("unknown error")
        );
    }
    Ok(json)
}
