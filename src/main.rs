use anyhow::Context;
use botdeck::{
    config::AppConfig,
    crypto::{self, KeySource, TokenCipher},
    db::{
        self, BotRepo, BotStatus, BotUpdate, CommandRepo, CredentialRepo, DbPool,
        NewAiIntegration, NewBot, NewCommand, NewTemplate, TemplateRepo,
    },
    runtime::{BotSupervisor, SerenityConnector},
};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "botdeck", version, about = "Manage Discord bots and their encrypted credentials")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a random 256-bit encryption key (64 hex characters)
    Keygen,
    /// Manage bots
    #[command(subcommand)]
    Bot(BotCommand),
    /// Manage slash commands
    #[command(subcommand)]
    Command(CommandCommand),
    /// Manage command templates
    #[command(subcommand)]
    Template(TemplateCommand),
    /// Audit or rotate the encryption key
    #[command(subcommand)]
    Keys(KeysCommand),
}

#[derive(Subcommand)]
enum BotCommand {
    /// Register a bot; the token is encrypted before it is stored
    Add {
        #[arg(long)]
        name: String,
        /// Discord application ID
        #[arg(long)]
        client_id: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        token: String,
    },
    /// List bots
    List,
    /// Show one bot
    Show { id: i64 },
    /// Update bot fields
    Update {
        id: i64,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        client_id: Option<String>,
        #[arg(long)]
        description: Option<String>,
        /// New plaintext token, or the stored envelope unchanged
        #[arg(long)]
        token: Option<String>,
    },
    /// Record a status reported by an external runtime
    Status { id: i64, status: BotStatus },
    /// Delete a bot and its commands
    Delete { id: i64 },
    /// Connect a bot to Discord until Ctrl-C
    Start { id: i64 },
}

#[derive(Subcommand)]
enum CommandCommand {
    /// Add a slash command to a bot
    Add(AddCommandArgs),
    /// List a bot's commands
    List {
        #[arg(long)]
        bot: i64,
    },
    /// Enable a command
    Enable { id: i64 },
    /// Disable a command
    Disable { id: i64 },
    /// Delete a command
    Delete { id: i64 },
}

#[derive(Args)]
struct AddCommandArgs {
    #[arg(long)]
    bot: i64,
    /// Copy name, description and response from a template
    #[arg(long, conflicts_with_all = ["description", "response"])]
    template: Option<i64>,
    #[arg(long, required_unless_present = "template")]
    name: Option<String>,
    #[arg(long, required_unless_present = "template")]
    description: Option<String>,
    #[arg(long, required_unless_present = "template")]
    response: Option<String>,
}

#[derive(Subcommand)]
enum TemplateCommand {
    /// Create a template
    Add(AddTemplateArgs),
    /// List templates
    List,
    /// Delete a template
    Delete { id: i64 },
}

#[derive(Args)]
struct AddTemplateArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    description: String,
    #[arg(long)]
    response: String,
    /// AI provider name, e.g. openai or anthropic
    #[arg(long)]
    ai_provider: Option<String>,
    #[arg(long, requires = "ai_provider")]
    ai_model: Option<String>,
    #[arg(long, requires = "ai_provider")]
    ai_endpoint: Option<String>,
    /// Encrypted before it is stored
    #[arg(long, requires = "ai_provider")]
    ai_api_key: Option<String>,
}

#[derive(Subcommand)]
enum KeysCommand {
    /// List credentials that do not decrypt under the configured key
    Audit,
    /// Re-encrypt all credentials from the configured key to a new secret
    Rotate {
        #[arg(long)]
        new_secret: String,
    },
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize logging first
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "botdeck=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Keygen => {
            println!("{}", crypto::generate_hex_key());
            Ok(())
        }
        Commands::Bot(cmd) => {
            let (pool, cipher) = open().await?;
            run_bot(cmd, &pool, cipher).await
        }
        Commands::Command(cmd) => {
            let (pool, _cipher) = open().await?;
            run_command(cmd, &pool).await
        }
        Commands::Template(cmd) => {
            let (pool, cipher) = open().await?;
            run_template(cmd, &pool, &cipher).await
        }
        Commands::Keys(cmd) => {
            let (pool, cipher) = open().await?;
            run_keys(cmd, &pool, &cipher).await
        }
    }
}

/// Load configuration, build the token cipher and open the database
async fn open() -> anyhow::Result<(DbPool, Arc<TokenCipher>)> {
    let config = AppConfig::load().context("Failed to load configuration")?;
    let cipher = Arc::new(
        TokenCipher::from_config(&config.encryption)
            .context("Failed to initialize token encryption")?,
    );
    if cipher.key_source() == KeySource::DevelopmentFallback {
        warn!("Bot tokens are protected by the development fallback key only");
    }

    let pool = db::connect(&config.database).await?;
    db::init_db(&pool).await?;

    Ok((pool, cipher))
}

async fn run_bot(cmd: BotCommand, pool: &DbPool, cipher: Arc<TokenCipher>) -> anyhow::Result<()> {
    match cmd {
        BotCommand::Add {
            name,
            client_id,
            description,
            token,
        } => {
            let bot = BotRepo::create(
                pool,
                &cipher,
                NewBot {
                    name,
                    client_id,
                    description,
                    token,
                },
            )
            .await?;
            print_json(&bot)
        }
        BotCommand::List => print_json(&BotRepo::list(pool).await?),
        BotCommand::Show { id } => print_json(&BotRepo::require(pool, id).await?),
        BotCommand::Update {
            id,
            name,
            client_id,
            description,
            token,
        } => {
            let update = BotUpdate {
                name,
                client_id,
                description,
                token,
            };
            if update.is_empty() {
                anyhow::bail!("nothing to update");
            }
            print_json(&BotRepo::update(pool, &cipher, id, update).await?)
        }
        BotCommand::Status { id, status } => {
            BotRepo::set_status(pool, id, status).await?;
            print_json(&BotRepo::require(pool, id).await?)
        }
        BotCommand::Delete { id } => {
            if !BotRepo::delete(pool, id).await? {
                anyhow::bail!("bot {} not found", id);
            }
            info!(bot_id = id, "Bot deleted");
            Ok(())
        }
        BotCommand::Start { id } => {
            let supervisor =
                BotSupervisor::new(pool.clone(), cipher, SerenityConnector::new(pool.clone()));
            supervisor.start(id).await?;

            tokio::signal::ctrl_c().await?;
            info!("Shutdown requested");
            supervisor.stop_all().await;
            Ok(())
        }
    }
}

async fn run_command(cmd: CommandCommand, pool: &DbPool) -> anyhow::Result<()> {
    match cmd {
        CommandCommand::Add(args) => {
            let command = match args.template {
                Some(template_id) => {
                    CommandRepo::create_from_template(pool, args.bot, template_id, args.name)
                        .await?
                }
                None => {
                    CommandRepo::create(
                        pool,
                        NewCommand {
                            bot_id: args.bot,
                            name: args.name.unwrap_or_default(),
                            description: args.description.unwrap_or_default(),
                            response: args.response.unwrap_or_default(),
                            template_id: None,
                        },
                    )
                    .await?
                }
            };
            print_json(&command)
        }
        CommandCommand::List { bot } => {
            BotRepo::require(pool, bot).await?;
            print_json(&CommandRepo::list_for_bot(pool, bot, false).await?)
        }
        CommandCommand::Enable { id } => Ok(CommandRepo::set_enabled(pool, id, true).await?),
        CommandCommand::Disable { id } => Ok(CommandRepo::set_enabled(pool, id, false).await?),
        CommandCommand::Delete { id } => {
            if !CommandRepo::delete(pool, id).await? {
                anyhow::bail!("command {} not found", id);
            }
            Ok(())
        }
    }
}

async fn run_template(
    cmd: TemplateCommand,
    pool: &DbPool,
    cipher: &TokenCipher,
) -> anyhow::Result<()> {
    match cmd {
        TemplateCommand::Add(args) => {
            let ai = args.ai_provider.map(|provider| NewAiIntegration {
                provider,
                model: args.ai_model,
                endpoint: args.ai_endpoint,
                api_key: args.ai_api_key,
            });
            let template = TemplateRepo::create(
                pool,
                cipher,
                NewTemplate {
                    name: args.name,
                    description: args.description,
                    response: args.response,
                    ai,
                },
            )
            .await?;
            print_json(&template)
        }
        TemplateCommand::List => print_json(&TemplateRepo::list(pool).await?),
        TemplateCommand::Delete { id } => {
            if !TemplateRepo::delete(pool, id).await? {
                anyhow::bail!("template {} not found", id);
            }
            Ok(())
        }
    }
}

async fn run_keys(cmd: KeysCommand, pool: &DbPool, cipher: &TokenCipher) -> anyhow::Result<()> {
    match cmd {
        KeysCommand::Audit => {
            let failures = CredentialRepo::audit(pool, cipher).await?;
            if failures.is_empty() {
                info!("All stored credentials decrypt under the configured key");
            }
            print_json(&failures)
        }
        KeysCommand::Rotate { new_secret } => {
            let new_cipher = TokenCipher::new(Some(new_secret.as_str()))?;
            let report = CredentialRepo::rotate(pool, cipher, &new_cipher).await?;
            print_json(&report)?;
            warn!("Update BOTDECK_ENCRYPTION__SECRET to the new secret before the next run");
            Ok(())
        }
    }
}
