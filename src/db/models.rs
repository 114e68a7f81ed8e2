use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;

use crate::error::AppError;

/// Maximum length of a Discord slash command name
pub const MAX_COMMAND_NAME_LEN: usize = 32;
/// Maximum length of a Discord slash command description
pub const MAX_COMMAND_DESCRIPTION_LEN: usize = 100;
/// Maximum length of a message response
pub const MAX_RESPONSE_LEN: usize = 2000;

/// Lifecycle status of a bot, driven by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum BotStatus {
    Online,
    Offline,
    Error,
    Starting,
    Stopping,
}

impl BotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Error => "error",
            Self::Starting => "starting",
            Self::Stopping => "stopping",
        }
    }

    /// Whether the runtime may start a bot in this state
    pub fn can_start(&self) -> bool {
        matches!(self, Self::Offline | Self::Error)
    }
}

impl std::fmt::Display for BotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for BotStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "online" => Ok(Self::Online),
            "offline" => Ok(Self::Offline),
            "error" => Ok(Self::Error),
            "starting" => Ok(Self::Starting),
            "stopping" => Ok(Self::Stopping),
            other => Err(AppError::validation(format!("unknown bot status '{}'", other))),
        }
    }
}

/// Bot record as stored, including the encrypted token.
///
/// Deliberately not `Serialize`: outward-facing reads use [`BotWithoutToken`].
#[derive(Clone, FromRow)]
pub struct Bot {
    pub id: i64,
    pub name: String,
    /// Discord application (client) ID
    pub client_id: String,
    pub description: Option<String>,
    /// Hex envelope, opaque outside `crypto`
    pub encrypted_token: String,
    pub status: BotStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl std::fmt::Debug for Bot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bot")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("client_id", &self.client_id)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Read model of a bot with the token column omitted
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct BotWithoutToken {
    pub id: i64,
    pub name: String,
    pub client_id: String,
    pub description: Option<String>,
    pub status: BotStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Bot> for BotWithoutToken {
    fn from(bot: Bot) -> Self {
        Self {
            id: bot.id,
            name: bot.name,
            client_id: bot.client_id,
            description: bot.description,
            status: bot.status,
            created_at: bot.created_at,
            updated_at: bot.updated_at,
        }
    }
}

/// New bot registration. `token` is plaintext and gets encrypted before insert.
#[derive(Clone)]
pub struct NewBot {
    pub name: String,
    pub client_id: String,
    pub description: Option<String>,
    pub token: String,
}

impl NewBot {
    pub fn validate(&self) -> Result<(), AppError> {
        validate_bot_name(&self.name)?;
        validate_client_id(&self.client_id)?;
        if self.token.trim().is_empty() {
            return Err(AppError::validation("bot token must not be empty"));
        }
        Ok(())
    }
}

impl std::fmt::Debug for NewBot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewBot")
            .field("name", &self.name)
            .field("client_id", &self.client_id)
            .field("description", &self.description)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Partial bot update; `None` leaves a field unchanged.
///
/// `token` may be a new plaintext token or a previously stored envelope
/// echoed back unchanged.
#[derive(Clone, Default)]
pub struct BotUpdate {
    pub name: Option<String>,
    pub client_id: Option<String>,
    pub description: Option<String>,
    pub token: Option<String>,
}

impl BotUpdate {
    pub fn validate(&self) -> Result<(), AppError> {
        if let Some(name) = &self.name {
            validate_bot_name(name)?;
        }
        if let Some(client_id) = &self.client_id {
            validate_client_id(client_id)?;
        }
        if matches!(&self.token, Some(t) if t.trim().is_empty()) {
            return Err(AppError::validation("bot token must not be empty"));
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.client_id.is_none()
            && self.description.is_none()
            && self.token.is_none()
    }
}

impl std::fmt::Debug for BotUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotUpdate")
            .field("name", &self.name)
            .field("client_id", &self.client_id)
            .field("description", &self.description)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Slash command registered for a bot
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Command {
    pub id: i64,
    pub bot_id: i64,
    pub name: String,
    pub description: String,
    /// Message sent when the command is invoked
    pub response: String,
    pub template_id: Option<i64>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// New slash command
#[derive(Debug, Clone)]
pub struct NewCommand {
    pub bot_id: i64,
    pub name: String,
    pub description: String,
    pub response: String,
    pub template_id: Option<i64>,
}

impl NewCommand {
    pub fn validate(&self) -> Result<(), AppError> {
        validate_command_name(&self.name)?;
        validate_command_description(&self.description)?;
        validate_response(&self.response)
    }
}

/// Slash command template, with the AI API key still encrypted.
///
/// Not `Serialize`; use [`TemplateWithoutKey`] for reads.
#[derive(Clone, FromRow)]
pub struct Template {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub response: String,
    pub ai_provider: Option<String>,
    pub ai_model: Option<String>,
    pub ai_endpoint: Option<String>,
    pub encrypted_api_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl std::fmt::Debug for Template {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Template")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("ai_provider", &self.ai_provider)
            .finish_non_exhaustive()
    }
}

/// AI API integration attached to a template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiIntegration {
    pub provider: String,
    pub model: Option<String>,
    pub endpoint: Option<String>,
    pub has_api_key: bool,
}

/// Read model of a template without the API key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateWithoutKey {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub response: String,
    pub ai: Option<AiIntegration>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Template> for TemplateWithoutKey {
    fn from(template: Template) -> Self {
        let has_api_key = template.encrypted_api_key.is_some();
        let ai = template.ai_provider.map(|provider| AiIntegration {
            provider,
            model: template.ai_model,
            endpoint: template.ai_endpoint,
            has_api_key,
        });

        Self {
            id: template.id,
            name: template.name,
            description: template.description,
            response: template.response,
            ai,
            created_at: template.created_at,
            updated_at: template.updated_at,
        }
    }
}

/// AI integration settings for a new template. `api_key` is plaintext.
#[derive(Clone)]
pub struct NewAiIntegration {
    pub provider: String,
    pub model: Option<String>,
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
}

impl std::fmt::Debug for NewAiIntegration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewAiIntegration")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("endpoint", &self.endpoint)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// New slash command template
#[derive(Debug, Clone)]
pub struct NewTemplate {
    pub name: String,
    pub description: String,
    pub response: String,
    pub ai: Option<NewAiIntegration>,
}

impl NewTemplate {
    pub fn validate(&self) -> Result<(), AppError> {
        validate_command_name(&self.name)?;
        validate_command_description(&self.description)?;
        validate_response(&self.response)?;
        if let Some(ai) = &self.ai {
            if ai.provider.trim().is_empty() {
                return Err(AppError::validation("AI provider must not be empty"));
            }
            if matches!(&ai.api_key, Some(k) if k.trim().is_empty()) {
                return Err(AppError::validation("AI API key must not be empty"));
            }
        }
        Ok(())
    }
}

fn validate_bot_name(name: &str) -> Result<(), AppError> {
    let len = name.trim().chars().count();
    if len == 0 || len > 100 {
        return Err(AppError::validation("bot name must be 1-100 characters"));
    }
    Ok(())
}

/// Discord application IDs are numeric snowflakes
fn validate_client_id(client_id: &str) -> Result<(), AppError> {
    if client_id.is_empty() || !client_id.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AppError::validation("client ID must be a numeric Discord application ID"));
    }
    Ok(())
}

/// Slash command names: 1-32 chars of lowercase letters, digits, `-` or `_`
pub fn validate_command_name(name: &str) -> Result<(), AppError> {
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');

    if name.is_empty() || name.len() > MAX_COMMAND_NAME_LEN || !valid_chars {
        return Err(AppError::validation(format!(
            "invalid command name '{}': use 1-{} lowercase letters, digits, '-' or '_'",
            name, MAX_COMMAND_NAME_LEN
        )));
    }
    Ok(())
}

fn validate_command_description(description: &str) -> Result<(), AppError> {
    let len = description.chars().count();
    if description.trim().is_empty() || len > MAX_COMMAND_DESCRIPTION_LEN {
        return Err(AppError::validation(format!(
            "command description must be 1-{} characters",
            MAX_COMMAND_DESCRIPTION_LEN
        )));
    }
    Ok(())
}

fn validate_response(response: &str) -> Result<(), AppError> {
    let len = response.chars().count();
    if response.trim().is_empty() || len > MAX_RESPONSE_LEN {
        return Err(AppError::validation(format!(
            "response must be 1-{} characters",
            MAX_RESPONSE_LEN
        )));
    }
    Ok(())
}
