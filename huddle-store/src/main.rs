use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use huddle_e2e::models::input::{ProvisionInput, ValidateExt};
use huddle_e2e::{
    telemetry, Channel, E2eClient, E2eConfig, GrantStore, IdentityDirectory, IdentityStatus,
    OutgoingFile, OutgoingMessage,
};
use huddle_store::{SqliteBackend, StoreError, DEFAULT_PAGE_SIZE};
use tracing::{error, info};

/// Huddle encrypted channels from the command line.
///
/// Each invocation is one session for `--user` against the database at
/// `HUDDLE_DB_PATH`.
#[derive(Debug, Parser)]
#[command(name = "huddle", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Publish this device's identity key (generating one if needed)
    Init {
        #[arg(long)]
        user: String,
    },
    /// Create a channel, encrypted unless --plain
    CreateChannel {
        #[arg(long)]
        user: String,
        #[arg(long)]
        channel: String,
        /// Comma-separated member ids (the creator is always a member)
        #[arg(long, value_delimiter = ',')]
        members: Vec<String>,
        #[arg(long)]
        plain: bool,
    },
    /// Give a member the channel key
    Grant {
        #[arg(long)]
        user: String,
        #[arg(long)]
        channel: String,
        #[arg(long)]
        member: String,
    },
    /// Delete a member's key grant (the key is not rotated)
    Revoke {
        #[arg(long)]
        user: String,
        #[arg(long)]
        channel: String,
        #[arg(long)]
        member: String,
    },
    /// Send a message
    Send {
        #[arg(long)]
        user: String,
        #[arg(long)]
        channel: String,
        #[arg(long, default_value = "")]
        text: String,
        /// Attachment reference as NAME=URL (repeatable)
        #[arg(long = "file", value_parser = parse_file)]
        files: Vec<OutgoingFile>,
    },
    /// Delete this device's private key (the published key stays on record)
    ForgetKey {
        #[arg(long)]
        user: String,
    },
    /// Print a channel's messages as this user sees them
    Read {
        #[arg(long)]
        user: String,
        #[arg(long)]
        channel: String,
        #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
        limit: usize,
    },
}

fn parse_file(value: &str) -> Result<OutgoingFile, String> {
    let (name, url) = value
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=URL, got '{value}'"))?;
    Ok(OutgoingFile {
        name: name.to_string(),
        url: url.to_string(),
        mime_type: "application/octet-stream".to_string(),
        size: 0,
    })
}

impl Commands {
    fn user(&self) -> &str {
        match self {
            Self::Init { user }
            | Self::ForgetKey { user }
            | Self::CreateChannel { user, .. }
            | Self::Grant { user, .. }
            | Self::Revoke { user, .. }
            | Self::Send { user, .. }
            | Self::Read { user, .. } => user,
        }
    }
}

async fn require_channel(backend: &SqliteBackend, channel_id: &str) -> Result<Channel, StoreError> {
    backend
        .get_channel(channel_id)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("channel {channel_id}")))
}

async fn run(command: Commands, config: &E2eConfig) -> Result<(), StoreError> {
    let backend = Arc::new(SqliteBackend::open(&config.db_path)?);
    let client = E2eClient::new(
        command.user(),
        config.open_vault(),
        Arc::clone(&backend) as Arc<dyn IdentityDirectory>,
        Arc::clone(&backend) as Arc<dyn GrantStore>,
    );

    if let Commands::ForgetKey { user } = &command {
        client.forget_device_key().await?;
        println!("deleted the private key for {user} on this device");
        return Ok(());
    }

    let status = client.ensure_identity_published().await;
    if !status.can_decrypt() {
        info!(user_id = %client.user_id(), ?status, "Encryption unavailable on this device");
    }

    match command {
        Commands::ForgetKey { .. } => {}
        Commands::Init { user } => {
            let verb = match status {
                IdentityStatus::Generated => "generated and published",
                IdentityStatus::Published => "published",
                IdentityStatus::Ready => "already published",
                IdentityStatus::NoLocalKey => "published elsewhere; this device has no matching private key",
                IdentityStatus::Unavailable => "unavailable",
            };
            println!("identity for {user}: {verb}");
            if let Some(key) = backend.get_public_key(&user).await? {
                println!("fingerprint: {}", key.fingerprint());
            }
        }
        Commands::CreateChannel {
            user,
            channel,
            members,
            plain,
        } => {
            ProvisionInput {
                channel_id: channel.clone(),
                members: members.clone(),
            }
            .validate_input()?;

            // Claim the id first so a second creator fails before provisioning.
            backend.create_channel(&Channel::new(&channel, !plain), &user).await?;
            let created = if plain {
                Channel::new(&channel, false)
            } else {
                let resolved = client.ensure_channel_provisioned(&channel, &members).await?;
                if !resolved.encryption_enabled {
                    backend.fall_back_to_plaintext(&channel).await?;
                }
                resolved
            };

            let mode = if created.encryption_enabled { "encrypted" } else { "plaintext" };
            println!("created channel {channel} ({mode})");
            if created.encryption_enabled {
                let grantees = backend.list_grantees(&channel).await?;
                println!("key grants: {}", grantees.join(", "));
            }
        }
        Commands::Grant { channel, member, .. } => {
            let target = require_channel(&backend, &channel).await?;
            if !target.encryption_enabled {
                return Err(StoreError::Conflict(format!("channel {channel} is not encrypted")));
            }
            client.grant_member(&channel, &member).await?;
            println!("granted {member} access to {channel}");
        }
        Commands::Revoke { channel, member, .. } => {
            require_channel(&backend, &channel).await?;
            client.revoke_member(&channel, &member).await?;
            println!("revoked {member}'s grant for {channel} (keys already unwrapped stay valid)");
        }
        Commands::Send {
            channel,
            text,
            files,
            ..
        } => {
            let target = require_channel(&backend, &channel).await?;
            let row = client
                .encrypt_outgoing(&target, OutgoingMessage { text, files })
                .await?;
            backend.insert_message(&row).await?;
            println!("{}", row.id);
        }
        Commands::Read { channel, limit, .. } => {
            require_channel(&backend, &channel).await?;
            let rows = backend.list_messages(&channel, limit, 0).await?;
            for message in client.decrypt_history(&rows).await {
                let at = chrono::DateTime::from_timestamp_millis(message.created_at)
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_default();
                println!("[{at}] {}: {}", message.sender_id, message.body.render());
                for file in &message.files {
                    let url = file.url.as_deref().unwrap_or("(encrypted)");
                    println!("    📎 {} {}", file.name, url);
                }
            }
        }
    }

    client.end_session();
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    telemetry::init();
    let cli = Cli::parse();

    let config = match E2eConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match run(cli.command, &config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
