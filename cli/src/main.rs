// roomcast — desktop driver for the Roomcast core
//
// Wires the broadcast transport, the inbound pipeline and the file-backed
// history together so the core can be exercised end-to-end from a terminal.

mod config;
mod history;

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::*;
use config::Config;
use history::FileStore;
use roomcast_core::store::{MessageStore, StoredMessage};
use roomcast_core::transport::broadcast::BroadcastCallback;
use roomcast_core::{
    content_key, crypto, prepare_outbound, BodyKind, BroadcastTransport, InboundPipeline,
    LocalIdentity,
};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "roomcast")]
#[command(about = "Roomcast — serverless local messaging", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Listen for broadcast messages and print them
    Listen,
    /// Broadcast a message to the local subnet
    Send {
        message: String,
        /// Encrypt for recipients holding this password
        #[arg(long)]
        encrypt_for: Option<String>,
        /// Intended recipient hint carried with the ciphertext
        #[arg(long)]
        to: Option<String>,
    },
    /// Show or set the display name
    Username { name: Option<String> },
    /// Manage the decryption password
    Password {
        #[command(subcommand)]
        action: PasswordAction,
    },
    /// View message history
    History {
        #[arg(short, long)]
        search: Option<String>,
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Delete all stored messages
    ClearHistory,
    /// Round-trip self-test of the crypto layer
    CryptoDemo,
}

#[derive(Subcommand)]
enum PasswordAction {
    /// Set the password used to decrypt inbound messages
    Set { password: String },
    /// Forget the password
    Clear,
    /// Generate a random password and store it
    Generate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = Config::load()?;

    match cli.command {
        Commands::Listen => listen(&config).await?,
        Commands::Send {
            message,
            encrypt_for,
            to,
        } => send(&config, &message, encrypt_for.as_deref(), to.as_deref()).await?,
        Commands::Username { name } => match name {
            Some(name) => {
                config.username = name;
                config.save()?;
                println!("{} username set to {}", "ok".green(), config.username.bold());
            }
            None => println!("{}", config.username),
        },
        Commands::Password { action } => {
            match action {
                PasswordAction::Set { password } => {
                    config.encryption_password = Some(password);
                    println!("{} password set", "ok".green());
                }
                PasswordAction::Clear => {
                    config.encryption_password = None;
                    println!("{} password cleared", "ok".green());
                }
                PasswordAction::Generate => {
                    let password = crypto::generate_password(12);
                    println!("{} generated password: {}", "ok".green(), password.bold());
                    config.encryption_password = Some(password);
                }
            }
            config.save()?;
        }
        Commands::History { search, limit } => show_history(search.as_deref(), limit)?,
        Commands::ClearHistory => {
            FileStore::open(Config::history_path()?)?.clear()?;
            println!("{} history cleared", "ok".green());
        }
        Commands::CryptoDemo => crypto_demo()?,
    }

    Ok(())
}

async fn listen(config: &Config) -> Result<()> {
    let transport = BroadcastTransport::with_port(config.port);
    let pipeline = Arc::new(InboundPipeline::new(LocalIdentity::new(
        &config.username,
        config.encryption_password.as_deref(),
    )));
    let store: Arc<dyn MessageStore> = Arc::new(FileStore::open(Config::history_path()?)?);

    let callback_pipeline = pipeline.clone();
    let callback_store = store.clone();
    let callback: BroadcastCallback = Arc::new(move |body, info| {
        let key = content_key(&[
            info.username.as_deref().unwrap_or(""),
            info.timestamp.as_deref().unwrap_or(""),
            body.as_str(),
        ]);
        let incoming = match callback_pipeline.process(&body, info.username.clone(), key) {
            Some(incoming) => incoming,
            None => return,
        };

        let sender = incoming
            .sender
            .clone()
            .unwrap_or_else(|| info.address.to_string());
        match incoming.kind {
            BodyKind::Plain => println!("{} {}", format!("{sender}:").cyan().bold(), incoming.body),
            BodyKind::Decrypted => {
                println!(
                    "{} {} {}",
                    format!("{sender}:").green().bold(),
                    incoming.body,
                    "(decrypted)".dimmed()
                )
            }
            BodyKind::Placeholder => {
                println!("{} {}", format!("{sender}:").yellow(), incoming.body.dimmed())
            }
        }

        let record = StoredMessage::received(
            &sender,
            &incoming.body,
            Some(info.address.to_string()),
        );
        if let Err(e) = callback_store.save(&record) {
            tracing::warn!("Failed to persist message: {}", e);
        }
    });

    transport.start_listening(callback).await?;
    println!(
        "Listening on port {} as {}",
        config.port.to_string().bold(),
        config.username.bold()
    );
    if let Some(ip) = transport.detected_ip() {
        println!("Own address {} (self-broadcasts are filtered)", ip.to_string().dimmed());
    }
    println!("Press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    transport.cleanup().await;
    println!("\n{} listener stopped", "ok".green());
    Ok(())
}

async fn send(
    config: &Config,
    message: &str,
    encrypt_for: Option<&str>,
    to: Option<&str>,
) -> Result<()> {
    let body = prepare_outbound(message, encrypt_for, to)?;
    let transport = BroadcastTransport::with_port(config.port);
    transport.send_broadcast(&body, &config.username).await?;

    let store = FileStore::open(Config::history_path()?)?;
    store.save(&StoredMessage::sent(message))?;

    if encrypt_for.is_some() {
        println!("{} encrypted broadcast sent", "ok".green());
    } else {
        println!("{} broadcast sent", "ok".green());
    }
    transport.cleanup().await;
    Ok(())
}

fn show_history(search: Option<&str>, limit: usize) -> Result<()> {
    let store = FileStore::open(Config::history_path()?)?;
    let messages = match search {
        Some(query) => store.search(query)?,
        None => store.list()?,
    };

    if messages.is_empty() {
        println!("{}", "no messages".dimmed());
        return Ok(());
    }

    let skip = messages.len().saturating_sub(limit);
    for message in messages.into_iter().skip(skip) {
        let when = chrono::DateTime::from_timestamp_millis(message.timestamp as i64)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "unknown time".to_string());
        let direction = if message.is_sent { "→" } else { "←" };
        println!(
            "{} {} {} {}",
            when.dimmed(),
            direction,
            format!("{}:", message.sender).bold(),
            message.message
        );
    }
    Ok(())
}

fn crypto_demo() -> Result<()> {
    let password = crypto::generate_password(12);
    println!("password:   {}", password);

    let payload = crypto::encrypt("the quick brown fox", &password, None)?;
    println!("ciphertext: {}", payload.encrypted);

    let plaintext = crypto::decrypt(&payload, &password)?;
    anyhow::ensure!(plaintext == "the quick brown fox", "roundtrip mismatch");
    println!("roundtrip:  {}", plaintext.green());

    match crypto::decrypt(&payload, "wrong-password") {
        Err(crypto::CryptoError::AuthenticationFailure) => {
            println!("wrong pw:   {}", "rejected before decryption".green());
            Ok(())
        }
        other => anyhow::bail!("expected authentication failure, got {:?}", other),
    }
}
