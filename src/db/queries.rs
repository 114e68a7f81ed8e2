use crate::crypto::{looks_encrypted, TokenCipher};
use crate::db::models::*;
use crate::error::{AppError, AppResult};
use chrono::Utc;
use serde::Serialize;
use sqlx::{Pool, Sqlite, SqliteConnection};
use tracing::{info, warn};
use zeroize::Zeroizing;

pub type DbPool = Pool<Sqlite>;

/// Columns of `bots` that are safe to return to callers
const BOT_COLUMNS: &str =
    "id, name, client_id, description, status, created_at, updated_at";

/// Map a unique-constraint violation to a validation error
fn unique_violation(err: sqlx::Error, msg: &str) -> AppError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => AppError::validation(msg),
        _ => AppError::Database(err),
    }
}

/// Database operations for bots
pub struct BotRepo;

impl BotRepo {
    /// Register a bot, encrypting its token before it is written
    pub async fn create(
        pool: &DbPool,
        cipher: &TokenCipher,
        new_bot: NewBot,
    ) -> AppResult<BotWithoutToken> {
        new_bot.validate()?;

        let encrypted_token = cipher.encrypt(&new_bot.token)?;
        let now = Utc::now();

        let result = sqlx::query(
            r#"
            INSERT INTO bots (name, client_id, description, encrypted_token, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(new_bot.name.trim())
        .bind(&new_bot.client_id)
        .bind(&new_bot.description)
        .bind(&encrypted_token)
        .bind(BotStatus::Offline)
        .bind(now)
        .bind(now)
        .execute(pool)
        .await?;

        let id = result.last_insert_rowid();
        info!(bot_id = id, name = %new_bot.name, "Bot registered");

        Self::require(pool, id).await
    }

    /// Get a bot without its token
    pub async fn get(pool: &DbPool, id: i64) -> AppResult<Option<BotWithoutToken>> {
        let bot = sqlx::query_as::<_, BotWithoutToken>(&format!(
            "SELECT {} FROM bots WHERE id = ?",
            BOT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(pool)
        .await?;

        Ok(bot)
    }

    /// Get a bot without its token, failing if it doesn't exist
    pub async fn require(pool: &DbPool, id: i64) -> AppResult<BotWithoutToken> {
        Self::get(pool, id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("Bot {}", id)))
    }

    /// List all bots without tokens
    pub async fn list(pool: &DbPool) -> AppResult<Vec<BotWithoutToken>> {
        let bots = sqlx::query_as::<_, BotWithoutToken>(&format!(
            "SELECT {} FROM bots ORDER BY id",
            BOT_COLUMNS
        ))
        .fetch_all(pool)
        .await?;

        Ok(bots)
    }

    /// Apply a partial update.
    ///
    /// A supplied token is encrypted unless it already looks like an
    /// envelope, in which case it is stored verbatim.
    pub async fn update(
        pool: &DbPool,
        cipher: &TokenCipher,
        id: i64,
        update: BotUpdate,
    ) -> AppResult<BotWithoutToken> {
        update.validate()?;

        let encrypted_token = match &update.token {
            Some(token) => Some(cipher.seal(token)?),
            None => None,
        };

        let result = sqlx::query(
            r#"
            UPDATE bots SET
                name = COALESCE(?, name),
                client_id = COALESCE(?, client_id),
                description = COALESCE(?, description),
                encrypted_token = COALESCE(?, encrypted_token),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(update.name.as_deref().map(str::trim))
        .bind(&update.client_id)
        .bind(&update.description)
        .bind(&encrypted_token)
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::not_found(format!("Bot {}", id)));
        }

        info!(bot_id = id, token_changed = encrypted_token.is_some(), "Bot updated");
        Self::require(pool, id).await
    }

    /// Set lifecycle status. Never touches the token.
    pub async fn set_status(pool: &DbPool, id: i64, status: BotStatus) -> AppResult<()> {
        let result = sqlx::query("UPDATE bots SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status)
            .bind(Utc::now())
            .bind(id)
            .execute(pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::not_found(format!("Bot {}", id)));
        }
        Ok(())
    }

    /// Move a bot to `starting` only if it is currently `offline` or `error`.
    ///
    /// The check and the write are one statement, so of two racing callers
    /// exactly one gets `true`.
    pub async fn begin_start(pool: &DbPool, id: i64) -> AppResult<bool> {
        let result = sqlx::query(
            "UPDATE bots SET status = ?, updated_at = ? WHERE id = ? AND status IN (?, ?)",
        )
        .bind(BotStatus::Starting)
        .bind(Utc::now())
        .bind(id)
        .bind(BotStatus::Offline)
        .bind(BotStatus::Error)
        .execute(pool)
        .await?;

        if result.rows_affected() == 0 {
            Self::require(pool, id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    /// Delete a bot and its commands
    pub async fn delete(pool: &DbPool, id: i64) -> AppResult<bool> {
        let result = sqlx::query("DELETE FROM bots WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Decrypt a bot's token for establishing a gateway connection.
    ///
    /// This is the only read path that returns token material.
    pub async fn decrypted_token(
        pool: &DbPool,
        cipher: &TokenCipher,
        id: i64,
    ) -> AppResult<Zeroizing<String>> {
        let encrypted: Option<String> =
            sqlx::query_scalar("SELECT encrypted_token FROM bots WHERE id = ?")
                .bind(id)
                .fetch_optional(pool)
                .await?;

        let encrypted = encrypted.ok_or_else(|| AppError::not_found(format!("Bot {}", id)))?;
        let token = cipher.decrypt(&encrypted).map_err(|e| {
            warn!(bot_id = id, error = %e, "Stored bot token cannot be decrypted");
            e
        })?;

        Ok(Zeroizing::new(token))
    }
}

/// Database operations for slash commands
pub struct CommandRepo;

impl CommandRepo {
    /// Create a command for an existing bot
    pub async fn create(pool: &DbPool, new_command: NewCommand) -> AppResult<Command> {
        new_command.validate()?;
        BotRepo::require(pool, new_command.bot_id).await?;

        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO commands (bot_id, name, description, response, template_id, enabled, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, true, ?, ?)
            "#,
        )
        .bind(new_command.bot_id)
        .bind(&new_command.name)
        .bind(&new_command.description)
        .bind(&new_command.response)
        .bind(new_command.template_id)
        .bind(now)
        .bind(now)
        .execute(pool)
        .await
        .map_err(|e| {
            unique_violation(
                e,
                &format!("bot {} already has a /{} command", new_command.bot_id, new_command.name),
            )
        })?;

        Self::get(pool, result.last_insert_rowid())
            .await?
            .ok_or_else(|| AppError::internal("Failed to retrieve created command"))
    }

    /// Instantiate a template as a command on a bot
    pub async fn create_from_template(
        pool: &DbPool,
        bot_id: i64,
        template_id: i64,
        name: Option<String>,
    ) -> AppResult<Command> {
        let template = TemplateRepo::require(pool, template_id).await?;

        Self::create(
            pool,
            NewCommand {
                bot_id,
                name: name.unwrap_or(template.name),
                description: template.description,
                response: template.response,
                template_id: Some(template_id),
            },
        )
        .await
    }

    /// Get command by ID
    pub async fn get(pool: &DbPool, id: i64) -> AppResult<Option<Command>> {
        let command = sqlx::query_as::<_, Command>("SELECT * FROM commands WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await?;

        Ok(command)
    }

    /// Commands of a bot, optionally only the enabled ones
    pub async fn list_for_bot(
        pool: &DbPool,
        bot_id: i64,
        enabled_only: bool,
    ) -> AppResult<Vec<Command>> {
        let commands = sqlx::query_as::<_, Command>(
            "SELECT * FROM commands WHERE bot_id = ? AND (enabled OR NOT ?) ORDER BY name",
        )
        .bind(bot_id)
        .bind(enabled_only)
        .fetch_all(pool)
        .await?;

        Ok(commands)
    }

    /// Enable or disable a command
    pub async fn set_enabled(pool: &DbPool, id: i64, enabled: bool) -> AppResult<()> {
        let result = sqlx::query("UPDATE commands SET enabled = ?, updated_at = ? WHERE id = ?")
            .bind(enabled)
            .bind(Utc::now())
            .bind(id)
            .execute(pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::not_found(format!("Command {}", id)));
        }
        Ok(())
    }

    /// Delete command
    pub async fn delete(pool: &DbPool, id: i64) -> AppResult<bool> {
        let result = sqlx::query("DELETE FROM commands WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

/// Database operations for command templates
pub struct TemplateRepo;

impl TemplateRepo {
    /// Create a template, encrypting its AI API key if one is given
    pub async fn create(
        pool: &DbPool,
        cipher: &TokenCipher,
        new_template: NewTemplate,
    ) -> AppResult<TemplateWithoutKey> {
        new_template.validate()?;

        let ai = new_template.ai.as_ref();
        let encrypted_api_key = match ai.and_then(|a| a.api_key.as_deref()) {
            Some(key) => Some(cipher.seal(key)?),
            None => None,
        };

        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO templates (name, description, response, ai_provider, ai_model, ai_endpoint, encrypted_api_key, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&new_template.name)
        .bind(&new_template.description)
        .bind(&new_template.response)
        .bind(ai.map(|a| a.provider.as_str()))
        .bind(ai.and_then(|a| a.model.as_deref()))
        .bind(ai.and_then(|a| a.endpoint.as_deref()))
        .bind(&encrypted_api_key)
        .bind(now)
        .bind(now)
        .execute(pool)
        .await
        .map_err(|e| unique_violation(e, &format!("template '{}' already exists", new_template.name)))?;

        let id = result.last_insert_rowid();
        info!(template_id = id, name = %new_template.name, "Template created");

        Ok(Self::require(pool, id).await?.into())
    }

    async fn fetch(pool: &DbPool, id: i64) -> AppResult<Option<Template>> {
        let template = sqlx::query_as::<_, Template>("SELECT * FROM templates WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await?;

        Ok(template)
    }

    async fn require(pool: &DbPool, id: i64) -> AppResult<Template> {
        Self::fetch(pool, id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("Template {}", id)))
    }

    /// Get a template without its API key
    pub async fn get(pool: &DbPool, id: i64) -> AppResult<Option<TemplateWithoutKey>> {
        Ok(Self::fetch(pool, id).await?.map(Into::into))
    }

    /// List all templates without API keys
    pub async fn list(pool: &DbPool) -> AppResult<Vec<TemplateWithoutKey>> {
        let templates = sqlx::query_as::<_, Template>("SELECT * FROM templates ORDER BY name")
            .fetch_all(pool)
            .await?;

        Ok(templates.into_iter().map(Into::into).collect())
    }

    /// Delete template. Commands created from it keep their copy.
    pub async fn delete(pool: &DbPool, id: i64) -> AppResult<bool> {
        let result = sqlx::query("DELETE FROM templates WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Decrypt a template's AI API key for calling the provider
    pub async fn decrypted_api_key(
        pool: &DbPool,
        cipher: &TokenCipher,
        id: i64,
    ) -> AppResult<Option<Zeroizing<String>>> {
        let template = Self::require(pool, id).await?;

        match template.encrypted_api_key {
            Some(encrypted) => Ok(Some(Zeroizing::new(cipher.decrypt(&encrypted)?))),
            None => Ok(None),
        }
    }
}

/// Which kind of record holds a credential
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialOwner {
    Bot,
    Template,
}

/// A stored credential that does not decrypt under the current key
#[derive(Debug, Clone, Serialize)]
pub struct CredentialFailure {
    pub owner: CredentialOwner,
    pub id: i64,
    pub name: String,
    pub reason: String,
}

/// Outcome of re-keying all stored credentials
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RotationReport {
    /// Envelopes decrypted with the old key and sealed with the new one
    pub reencrypted: usize,
    /// Legacy plaintext values encrypted for the first time
    pub newly_encrypted: usize,
}

/// Key maintenance across every encrypted column
pub struct CredentialRepo;

impl CredentialRepo {
    async fn all_credentials(
        conn: &mut SqliteConnection,
    ) -> AppResult<Vec<(CredentialOwner, i64, String, String)>> {
        let bots: Vec<(i64, String, String)> =
            sqlx::query_as("SELECT id, name, encrypted_token FROM bots ORDER BY id")
                .fetch_all(&mut *conn)
                .await?;
        let templates: Vec<(i64, String, String)> = sqlx::query_as(
            "SELECT id, name, encrypted_api_key FROM templates WHERE encrypted_api_key IS NOT NULL ORDER BY id",
        )
        .fetch_all(&mut *conn)
        .await?;

        Ok(bots
            .into_iter()
            .map(|(id, name, value)| (CredentialOwner::Bot, id, name, value))
            .chain(
                templates
                    .into_iter()
                    .map(|(id, name, value)| (CredentialOwner::Template, id, name, value)),
            )
            .collect())
    }

    /// Report every credential that cannot be decrypted with `cipher`
    pub async fn audit(pool: &DbPool, cipher: &TokenCipher) -> AppResult<Vec<CredentialFailure>> {
        let mut failures = Vec::new();
        let mut conn = pool.acquire().await?;

        for (owner, id, name, value) in Self::all_credentials(&mut *conn).await? {
            let reason = if !looks_encrypted(&value) {
                Some("stored value is not an encrypted envelope".to_string())
            } else {
                cipher.decrypt(&value).err().map(|e| e.to_string())
            };

            if let Some(reason) = reason {
                warn!(?owner, id, %reason, "Credential failed audit");
                failures.push(CredentialFailure {
                    owner,
                    id,
                    name,
                    reason,
                });
            }
        }

        Ok(failures)
    }

    /// Re-encrypt every credential from `old` to `new` in one transaction.
    ///
    /// Values that are not envelopes are treated as legacy plaintext and
    /// encrypted. Any envelope that fails to decrypt aborts the rotation
    /// with nothing written. Credentials are read inside the same
    /// transaction as the writes.
    pub async fn rotate(
        pool: &DbPool,
        old: &TokenCipher,
        new: &TokenCipher,
    ) -> AppResult<RotationReport> {
        let mut tx = pool.begin().await?;
        let credentials = Self::all_credentials(&mut *tx).await?;
        let mut report = RotationReport::default();
        let now = Utc::now();

        for (owner, id, _name, value) in credentials {
            let sealed = if looks_encrypted(&value) {
                report.reencrypted += 1;
                old.reencrypt(&value, new)?
            } else {
                report.newly_encrypted += 1;
                new.encrypt(&value)?
            };

            let sql = match owner {
                CredentialOwner::Bot => {
                    "UPDATE bots SET encrypted_token = ?, updated_at = ? WHERE id = ?"
                }
                CredentialOwner::Template => {
                    "UPDATE templates SET encrypted_api_key = ?, updated_at = ? WHERE id = ?"
                }
            };

            sqlx::query(sql)
                .bind(&sealed)
                .bind(now)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        info!(
            reencrypted = report.reencrypted,
            newly_encrypted = report.newly_encrypted,
            "Credential rotation committed"
        );
        Ok(report)
    }
}
