use async_trait::async_trait;
use serenity::all::{
    ApplicationId, Client, Command as DiscordCommand, Context, CreateCommand,
    CreateInteractionResponse, CreateInteractionResponseMessage, EventHandler, GatewayIntents,
    Interaction, Ready, ShardManager,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use zeroize::Zeroizing;

use super::{BotSession, GatewayConnector};
use crate::db::{BotRepo, BotStatus, BotWithoutToken, Command, DbPool};
use crate::error::AppResult;

/// Registers a bot's commands and answers them with their stored responses
struct CommandResponder {
    bot_id: i64,
    commands: HashMap<String, Command>,
}

#[async_trait]
impl EventHandler for CommandResponder {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!(bot_id = self.bot_id, user = %ready.user.name, "Gateway ready");

        let definitions: Vec<CreateCommand> = self
            .commands
            .values()
            .map(|c| CreateCommand::new(&c.name).description(&c.description))
            .collect();

        match DiscordCommand::set_global_commands(&ctx.http, definitions).await {
            Ok(registered) => info!(
                bot_id = self.bot_id,
                count = registered.len(),
                "Registered slash commands globally"
            ),
            Err(e) => error!(bot_id = self.bot_id, error = %e, "Failed to register slash commands"),
        }
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        let Interaction::Command(invocation) = interaction else {
            return;
        };

        let Some(command) = self.commands.get(&invocation.data.name) else {
            warn!(bot_id = self.bot_id, name = %invocation.data.name, "Unknown command invoked");
            return;
        };

        let message = CreateInteractionResponseMessage::new().content(&command.response);
        if let Err(e) = invocation
            .create_response(&ctx.http, CreateInteractionResponse::Message(message))
            .await
        {
            warn!(bot_id = self.bot_id, name = %command.name, error = %e, "Failed to respond to command");
        }
    }
}

/// Live serenity client
struct SerenitySession {
    shard_manager: Arc<ShardManager>,
    task: JoinHandle<()>,
}

#[async_trait]
impl BotSession for SerenitySession {
    async fn shutdown(self: Box<Self>) {
        self.shard_manager.shutdown_all().await;
        if let Err(e) = self.task.await {
            warn!(error = %e, "Gateway task ended abnormally");
        }
    }
}

/// Connects bots to the Discord gateway with serenity
pub struct SerenityConnector {
    pool: DbPool,
}

impl SerenityConnector {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl GatewayConnector for SerenityConnector {
    async fn connect(
        &self,
        bot: &BotWithoutToken,
        token: Zeroizing<String>,
        commands: Vec<Command>,
    ) -> AppResult<Box<dyn BotSession>> {
        let handler = CommandResponder {
            bot_id: bot.id,
            commands: commands.into_iter().map(|c| (c.name.clone(), c)).collect(),
        };

        let mut builder = Client::builder(token.as_str(), GatewayIntents::GUILDS).event_handler(handler);
        if let Some(app_id) = bot.client_id.parse::<u64>().ok().filter(|id| *id != 0) {
            builder = builder.application_id(ApplicationId::new(app_id));
        }

        let mut client = builder.await?;
        drop(token);

        let shard_manager = client.shard_manager.clone();
        let pool = self.pool.clone();
        let bot_id = bot.id;

        let task = tokio::spawn(async move {
            if let Err(e) = client.start().await {
                error!(bot_id, error = %e, "Gateway connection failed");
                if let Err(e) = BotRepo::set_status(&pool, bot_id, BotStatus::Error).await {
                    error!(bot_id, error = %e, "Failed to record bot error status");
                }
            }
        });

        Ok(Box::new(SerenitySession {
            shard_manager,
            task,
        }))
    }
}
