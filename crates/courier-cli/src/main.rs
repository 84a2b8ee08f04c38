//! courier: end-to-end encryption client
//!
//! Usage:
//!   courier [--config courier.toml] keys init|show|clear|rotate|backup|restore
//!   courier file encrypt|decrypt <in> <out> [--material B64]
//!   courier message encrypt --to <user> <text>
//!   courier message decrypt --from <user> <payload>
//!   courier upload <path> [--conversation ID]
//!   courier config show

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use secrecy::{ExposeSecret, SecretString};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use courier_core::config::CourierConfig;
use courier_core::{ConversationId, CourierError, Progress, UserId};
use courier_crypto::{
    open_file_from, seal_file_to, DecryptedMessage, FilePath, KeyBackup, KeyCache, KeyMaterial,
    KeyStore,
};
use courier_e2ee::{E2eeSession, HttpBackend, KeyDirectory, NoThumbnails, StreamingUploadCoordinator};
use courier_secrets::KeychainStore;

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "courier", version, about = "Courier end-to-end encryption client")]
struct Cli {
    /// Path to courier.toml configuration file
    #[arg(long, short = 'c', env = "COURIER_CONFIG", default_value = "courier.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides [logging] level
    #[arg(long, env = "COURIER_LOG")]
    log: Option<String>,

    /// Log format (json, text); overrides [logging] format
    #[arg(long, env = "COURIER_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum, PartialEq)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Device key management
    Keys {
        #[command(subcommand)]
        action: KeysAction,
    },

    /// Encrypt or decrypt a local file
    File {
        #[command(subcommand)]
        action: FileAction,
    },

    /// Encrypt or decrypt a chat message envelope (needs the backend)
    Message {
        #[command(subcommand)]
        action: MessageAction,
    },

    /// Encrypt and upload a file chunk by chunk
    ///
    /// With --conversation the file is encrypted under a one-time key wrapped
    /// for every member; otherwise only this device can read it.
    Upload {
        path: PathBuf,
        #[arg(long)]
        conversation: Option<String>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum KeysAction {
    /// Load or create the device key, and publish it when a user id is configured
    Init,
    /// Show the device key fingerprint
    Show,
    /// Delete the device key (logout)
    Clear {
        /// Confirm deletion; messages encrypted to this key become unreadable
        #[arg(long)]
        yes: bool,
    },
    /// Replace the device key with a fresh one
    Rotate {
        #[arg(long)]
        yes: bool,
    },
    /// Write a password-protected backup of the device key
    Backup { output: PathBuf },
    /// Restore the device key from a backup
    Restore { input: PathBuf },
}

#[derive(Subcommand, Debug)]
enum FileAction {
    Encrypt {
        input: PathBuf,
        output: PathBuf,
        /// Key material to encrypt under (default: this device's key)
        #[arg(long, env = "COURIER_MATERIAL", hide_env_values = true)]
        material: Option<String>,
    },
    Decrypt {
        input: PathBuf,
        output: PathBuf,
        /// Sender's key material (default: this device's key)
        #[arg(long, env = "COURIER_MATERIAL", hide_env_values = true)]
        material: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum MessageAction {
    /// Print the JSON envelope for a message
    Encrypt {
        /// Recipient user id (one-to-one)
        #[arg(long, conflicts_with = "conversation", required_unless_present = "conversation")]
        to: Option<String>,
        /// Conversation id (group)
        #[arg(long)]
        conversation: Option<String>,
        text: String,
    },
    /// Decrypt a JSON envelope sent by --from
    Decrypt {
        #[arg(long)]
        from: String,
        payload: String,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
}

type Session = E2eeSession<KeychainStore, HttpBackend>;

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, found) = load_config(&cli.config).await?;

    let level = cli.log.clone().unwrap_or_else(|| config.logging.level.clone());
    let format = cli.log_format.unwrap_or(if config.logging.format == "json" {
        LogFormat::Json
    } else {
        LogFormat::Text
    });
    init_logging(&level, format);
    if !found {
        warn!(
            "config file not found: {}  (using defaults)",
            cli.config.display()
        );
    }
    for warning in config.warnings() {
        warn!("{warning}");
    }
    debug!(version = env!("CARGO_PKG_VERSION"), config = %cli.config.display(), "courier starting");

    match cli.command {
        Commands::Keys { action } => match action {
            KeysAction::Init => cmd_keys_init(&config).await,
            KeysAction::Show => cmd_keys_show(&config).await,
            KeysAction::Clear { yes } => cmd_keys_clear(&config, yes).await,
            KeysAction::Rotate { yes } => cmd_keys_rotate(&config, yes).await,
            KeysAction::Backup { output } => cmd_keys_backup(&config, &output).await,
            KeysAction::Restore { input } => cmd_keys_restore(&config, &input).await,
        },
        Commands::File { action } => match action {
            FileAction::Encrypt {
                input,
                output,
                material,
            } => cmd_file_encrypt(&config, &input, &output, material).await,
            FileAction::Decrypt {
                input,
                output,
                material,
            } => cmd_file_decrypt(&config, &input, &output, material).await,
        },
        Commands::Message { action } => match action {
            MessageAction::Encrypt {
                to,
                conversation,
                text,
            } => cmd_message_encrypt(&config, to, conversation, &text).await,
            MessageAction::Decrypt { from, payload } => {
                cmd_message_decrypt(&config, &from, &payload).await
            }
        },
        Commands::Upload { path, conversation } => {
            cmd_upload(&config, &path, conversation.as_deref()).await
        }
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config, &cli.config),
    }
}

// ── Config loading ────────────────────────────────────────────────────────────

/// Returns the config and whether it came from a file.
async fn load_config(path: &Path) -> Result<(CourierConfig, bool)> {
    if !path.exists() {
        return Ok((CourierConfig::default(), false));
    }
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading config {}", path.display()))?;
    let config = CourierConfig::from_toml_str(&content)
        .with_context(|| format!("loading config {}", path.display()))?;
    Ok((config, true))
}

/// Logs go to stderr so command output on stdout stays pipeable.
fn init_logging(level: &str, format: LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

// ── Shared helpers ────────────────────────────────────────────────────────────

fn key_store(config: &CourierConfig) -> KeyStore<KeychainStore> {
    KeyStore::new(
        KeychainStore::new(config.keys.keychain_service.as_str()),
        config.keys.master_key_entry.as_str(),
        Arc::new(KeyCache::new()),
    )
}

async fn start_session(config: &CourierConfig) -> Result<Session> {
    let backend = HttpBackend::from_config(&config.backend)?;
    let store = KeychainStore::new(config.keys.keychain_service.as_str());
    E2eeSession::start(store, backend, config)
        .await
        .context("starting e2ee session (is backend.user_id set?)")
}

async fn resolve_material(config: &CourierConfig, explicit: Option<String>) -> Result<KeyMaterial> {
    match explicit {
        Some(m) => Ok(KeyMaterial::new(m)),
        None => key_store(config)
            .own_material()
            .await
            .context("no device key; run `courier keys init` or pass --material"),
    }
}

/// Password from `COURIER_BACKUP_PASSWORD`, or prompted on the terminal.
fn read_password(prompt: &str, confirm: bool) -> Result<SecretString> {
    if let Ok(pw) = std::env::var("COURIER_BACKUP_PASSWORD") {
        return Ok(SecretString::from(pw));
    }
    let pw = SecretString::from(rpassword::prompt_password(prompt).context("reading password")?);
    if pw.expose_secret().is_empty() {
        bail!("empty password");
    }
    if confirm {
        let again = rpassword::prompt_password("Repeat password: ").context("reading password")?;
        if again != pw.expose_secret() {
            bail!("passwords do not match");
        }
    }
    Ok(pw)
}

fn make_progress_bar(prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::with_template("{prefix:.bold} [{bar:40.cyan/blue}] {pos:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-"),
    );
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn progress_callback(pb: &ProgressBar) -> impl Fn(&Progress) + Send + Sync + 'static {
    let pb = pb.clone();
    move |p: &Progress| {
        pb.set_position(p.percent as u64);
        pb.set_message(p.phase.to_string());
    }
}

/// `<output>.part`, renamed into place once the operation completes.
fn partial_path(output: &Path) -> PathBuf {
    let mut name: OsString = output.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

// ── `courier keys` ────────────────────────────────────────────────────────────

async fn cmd_keys_init(config: &CourierConfig) -> Result<()> {
    let material = if config.backend.user_id.is_empty() {
        let material = key_store(config).initialize_keys().await?;
        warn!("backend.user_id not set; key material was not published");
        material
    } else {
        start_session(config).await?.keys().own_material().await?
    };
    println!("device key ready: {}", material.fingerprint());
    Ok(())
}

async fn cmd_keys_show(config: &CourierConfig) -> Result<()> {
    match key_store(config).own_material().await {
        Ok(material) => {
            println!("fingerprint: {}", material.fingerprint());
            println!(
                "stored in:   {} / {}",
                config.keys.keychain_service, config.keys.master_key_entry
            );
            Ok(())
        }
        Err(CourierError::KeyNotInitialized) => {
            println!("no device key (run `courier keys init`)");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn cmd_keys_clear(config: &CourierConfig, yes: bool) -> Result<()> {
    if !yes {
        bail!("refusing to delete the device key without --yes: messages encrypted to it become unreadable");
    }
    key_store(config).clear_keys().await?;
    println!("device key deleted");
    Ok(())
}

async fn cmd_keys_rotate(config: &CourierConfig, yes: bool) -> Result<()> {
    if !yes {
        bail!("refusing to rotate without --yes: earlier ciphertexts need the old key (back it up first)");
    }
    let material = if config.backend.user_id.is_empty() {
        let material = key_store(config).rotate_keys().await?;
        warn!("backend.user_id not set; new key material was not published");
        material
    } else {
        start_session(config).await?.rotate_keys().await?
    };
    println!("rotated device key: {}", material.fingerprint());
    Ok(())
}

async fn cmd_keys_backup(config: &CourierConfig, output: &Path) -> Result<()> {
    let password = read_password("Backup password: ", true)?;
    let backup = key_store(config)
        .create_key_backup(&password, config.keys.backup_pbkdf2_iterations)
        .await?;
    tokio::fs::write(output, backup.to_json()?)
        .await
        .with_context(|| format!("writing {}", output.display()))?;
    println!("backup written to {}", output.display());
    Ok(())
}

async fn cmd_keys_restore(config: &CourierConfig, input: &Path) -> Result<()> {
    let content = tokio::fs::read_to_string(input)
        .await
        .with_context(|| format!("reading {}", input.display()))?;
    let backup = KeyBackup::from_json(&content)?;
    let password = read_password("Backup password: ", false)?;
    let material = key_store(config).restore_from_backup(&backup, &password).await?;

    if !config.backend.user_id.is_empty() {
        let backend = HttpBackend::from_config(&config.backend)?;
        if let Err(e) = backend.publish_public_key(&material).await {
            warn!("publishing restored key material failed: {e}");
        }
    }
    println!("restored device key: {}", material.fingerprint());
    Ok(())
}

// ── `courier file` ────────────────────────────────────────────────────────────

async fn cmd_file_encrypt(
    config: &CourierConfig,
    input: &Path,
    output: &Path,
    material: Option<String>,
) -> Result<()> {
    let material = resolve_material(config, material).await?;
    let part = partial_path(output);
    let out = tokio::fs::File::create(&part)
        .await
        .with_context(|| format!("creating {}", part.display()))?;
    let mut writer = tokio::io::BufWriter::new(out);

    let pb = make_progress_bar("encrypt");
    let callback = progress_callback(&pb);
    let result = seal_file_to(
        input,
        &material,
        config.upload.small_file_threshold,
        &mut writer,
        Some(&callback),
        None,
    )
    .await;
    pb.finish_and_clear();
    drop(writer);

    let sealed = match result {
        Ok(sealed) => sealed,
        Err(e) => {
            let _ = tokio::fs::remove_file(&part).await;
            return Err(e).with_context(|| format!("encrypting {}", input.display()));
        }
    };
    tokio::fs::rename(&part, output)
        .await
        .with_context(|| format!("moving container to {}", output.display()))?;

    let path = match sealed.path() {
        FilePath::WholeBuffer => "whole",
        FilePath::Chunked => "chunked",
    };
    println!(
        "encrypted {} ({} bytes, {path}) -> {}",
        input.display(),
        sealed.original_size(),
        output.display()
    );
    Ok(())
}

async fn cmd_file_decrypt(
    config: &CourierConfig,
    input: &Path,
    output: &Path,
    material: Option<String>,
) -> Result<()> {
    let material = resolve_material(config, material).await?;
    let mut source = tokio::fs::File::open(input)
        .await
        .with_context(|| format!("opening {}", input.display()))?;

    let part = partial_path(output);
    let out = tokio::fs::File::create(&part)
        .await
        .with_context(|| format!("creating {}", part.display()))?;
    let mut writer = tokio::io::BufWriter::new(out);

    let pb = make_progress_bar("decrypt");
    let callback = progress_callback(&pb);
    let result = open_file_from(&mut source, &material, &mut writer, Some(&callback), None).await;
    pb.finish_and_clear();
    drop(writer);

    match result {
        Ok((file, written)) => {
            tokio::fs::rename(&part, output)
                .await
                .with_context(|| format!("moving decrypted file to {}", output.display()))?;
            println!("decrypted {} ({written} bytes) -> {}", file.file_name(), output.display());
            Ok(())
        }
        Err(e) => {
            // Nothing unverified is left behind.
            let _ = tokio::fs::remove_file(&part).await;
            Err(e).with_context(|| format!("decrypting {}", input.display()))
        }
    }
}

// ── `courier message` ─────────────────────────────────────────────────────────

async fn cmd_message_encrypt(
    config: &CourierConfig,
    to: Option<String>,
    conversation: Option<String>,
    text: &str,
) -> Result<()> {
    let session = start_session(config).await?;
    let envelope = match (to, conversation) {
        (Some(to), _) => session.messages().encrypt_message(&UserId::new(to), text).await?,
        (None, Some(conversation)) => {
            let group = session
                .messages()
                .encrypt_message_for_group(&ConversationId::new(conversation), text)
                .await?;
            for user in &group.skipped {
                eprintln!("warning: {user} has no published key and cannot read this message");
            }
            group.envelope
        }
        (None, None) => bail!("pass --to or --conversation"),
    };
    println!("{}", envelope.to_json()?);
    Ok(())
}

async fn cmd_message_decrypt(config: &CourierConfig, from: &str, payload: &str) -> Result<()> {
    let session = start_session(config).await?;
    match session
        .messages()
        .decrypt_message(&UserId::new(from), payload)
        .await
    {
        DecryptedMessage::Plaintext(text) => {
            println!("{text}");
            Ok(())
        }
        DecryptedMessage::Placeholder(reason) => bail!("{reason}"),
    }
}

// ── `courier upload` ──────────────────────────────────────────────────────────

async fn cmd_upload(config: &CourierConfig, path: &Path, conversation: Option<&str>) -> Result<()> {
    let session = start_session(config).await?;
    let backend = HttpBackend::from_config(&config.backend)?;
    let coordinator = StreamingUploadCoordinator::new(backend, NoThumbnails, &config.upload);

    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted; stopping after the current chunk");
                cancel.cancel();
            }
        })
    };

    let pb = make_progress_bar("upload");
    let callback = progress_callback(&pb);
    let result = match conversation {
        Some(id) => {
            session
                .share_file(
                    &coordinator,
                    path,
                    &ConversationId::new(id),
                    Some(&callback),
                    Some(&cancel),
                )
                .await
        }
        None => {
            session
                .upload_private_file(&coordinator, path, Some(&callback), Some(&cancel))
                .await
        }
    };
    watcher.abort();
    pb.finish_and_clear();

    let outcome = result.with_context(|| format!("uploading {}", path.display()))?;
    println!("uploaded {} as {}", path.display(), outcome.file_id);
    println!(
        "  {} chunks, {} bytes, master tag {}",
        outcome.manifest.total_chunks, outcome.manifest.original_size, outcome.manifest.master_auth_tag
    );
    Ok(())
}

// ── `courier config show` ─────────────────────────────────────────────────────

fn cmd_config_show(config: &CourierConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}
