//! Bot runtime: the only place decrypted tokens are used.
//!
//! The supervisor decrypts a bot's token at connect time, hands it to a
//! [`GatewayConnector`], and records status transitions
//! (`offline -> starting -> online`, `online -> stopping -> offline`, or
//! `error` on failure).

pub mod discord;

pub use discord::SerenityConnector;

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{error, info};
use zeroize::Zeroizing;

use crate::crypto::TokenCipher;
use crate::db::{BotRepo, BotStatus, BotWithoutToken, Command, CommandRepo, DbPool};
use crate::error::{AppError, AppResult};

/// A live gateway connection for one bot
#[async_trait]
pub trait BotSession: Send + Sync {
    /// Close the connection and wait for it to wind down
    async fn shutdown(self: Box<Self>);
}

/// Opens gateway connections
#[async_trait]
pub trait GatewayConnector: Send + Sync {
    /// Connect `bot` using its plaintext `token`, registering `commands`
    async fn connect(
        &self,
        bot: &BotWithoutToken,
        token: Zeroizing<String>,
        commands: Vec<Command>,
    ) -> AppResult<Box<dyn BotSession>>;
}

/// Starts and stops bots, keeping their stored status in sync
pub struct BotSupervisor<C> {
    pool: DbPool,
    cipher: Arc<TokenCipher>,
    connector: C,
    sessions: DashMap<i64, Box<dyn BotSession>>,
}

impl<C: GatewayConnector> BotSupervisor<C> {
    pub fn new(pool: DbPool, cipher: Arc<TokenCipher>, connector: C) -> Self {
        Self {
            pool,
            cipher,
            connector,
            sessions: DashMap::new(),
        }
    }

    /// Whether this supervisor holds a live session for the bot
    pub fn is_running(&self, bot_id: i64) -> bool {
        self.sessions.contains_key(&bot_id)
    }

    /// Start a bot that is `offline` or in `error`.
    ///
    /// The `starting` transition is claimed atomically in the database, so
    /// concurrent starts of one bot open at most one session.
    pub async fn start(&self, bot_id: i64) -> AppResult<()> {
        if self.is_running(bot_id) {
            return Err(AppError::AlreadyRunning(bot_id));
        }

        let bot = BotRepo::require(&self.pool, bot_id).await?;
        if !bot.status.can_start() || !BotRepo::begin_start(&self.pool, bot_id).await? {
            return Err(AppError::AlreadyRunning(bot_id));
        }
        info!(bot_id, name = %bot.name, "Starting bot");

        match self.launch(&bot).await {
            Ok(session) => {
                self.sessions.insert(bot_id, session);
                BotRepo::set_status(&self.pool, bot_id, BotStatus::Online).await?;
                info!(bot_id, "Bot online");
                Ok(())
            }
            Err(e) => {
                error!(bot_id, error = %e, "Bot failed to start");
                if let Err(status_err) =
                    BotRepo::set_status(&self.pool, bot_id, BotStatus::Error).await
                {
                    error!(bot_id, error = %status_err, "Failed to record error status");
                }
                Err(e)
            }
        }
    }

    async fn launch(&self, bot: &BotWithoutToken) -> AppResult<Box<dyn BotSession>> {
        let token = BotRepo::decrypted_token(&self.pool, &self.cipher, bot.id).await?;
        let commands = CommandRepo::list_for_bot(&self.pool, bot.id, true).await?;
        self.connector.connect(bot, token, commands).await
    }

    /// Stop a running bot.
    ///
    /// The session is always shut down once removed, even if recording the
    /// `stopping` status fails.
    pub async fn stop(&self, bot_id: i64) -> AppResult<()> {
        let (_, session) = self
            .sessions
            .remove(&bot_id)
            .ok_or(AppError::NotRunning(bot_id))?;

        let stopping = BotRepo::set_status(&self.pool, bot_id, BotStatus::Stopping).await;
        info!(bot_id, "Stopping bot");

        session.shutdown().await;
        stopping?;

        BotRepo::set_status(&self.pool, bot_id, BotStatus::Offline).await?;
        info!(bot_id, "Bot offline");
        Ok(())
    }

    /// Stop every running bot, logging failures
    pub async fn stop_all(&self) {
        let ids: Vec<i64> = self.sessions.iter().map(|entry| *entry.key()).collect();
        for bot_id in ids {
            if let Err(e) = self.stop(bot_id).await {
                error!(bot_id, error = %e, "Failed to stop bot");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{memory_pool, NewBot, NewCommand};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    const KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    #[derive(Default)]
    struct Recorded {
        tokens: Mutex<Vec<String>>,
        commands: Mutex<Vec<String>>,
        opened: AtomicUsize,
        shut_down: AtomicUsize,
    }

    struct MockSession(Arc<Recorded>);

    #[async_trait]
    impl BotSession for MockSession {
        async fn shutdown(self: Box<Self>) {
            self.0.shut_down.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct MockConnector {
        recorded: Arc<Recorded>,
        fail: bool,
        delay: Duration,
    }

    #[async_trait]
    impl GatewayConnector for MockConnector {
        async fn connect(
            &self,
            _bot: &BotWithoutToken,
            token: Zeroizing<String>,
            commands: Vec<Command>,
        ) -> AppResult<Box<dyn BotSession>> {
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(AppError::internal("gateway refused connection"));
            }
            self.recorded.tokens.lock().unwrap().push(token.to_string());
            self.recorded
                .commands
                .lock()
                .unwrap()
                .extend(commands.into_iter().map(|c| c.name));
            self.recorded.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MockSession(self.recorded.clone())))
        }
    }

    async fn setup(fail: bool) -> (BotSupervisor<MockConnector>, Arc<Recorded>, DbPool, i64) {
        setup_with_delay(fail, Duration::ZERO).await
    }

    async fn setup_with_delay(
        fail: bool,
        delay: Duration,
    ) -> (BotSupervisor<MockConnector>, Arc<Recorded>, DbPool, i64) {
        let pool = memory_pool().await.unwrap();
        let cipher = Arc::new(TokenCipher::new(Some(KEY)).unwrap());
        let bot = BotRepo::create(
            &pool,
            &cipher,
            NewBot {
                name: "Helper".to_string(),
                client_id: "123".to_string(),
                description: None,
                token: "abc123token".to_string(),
            },
        )
        .await
        .unwrap();

        for (name, enabled) in [("ping", true), ("hidden", false)] {
            let command = CommandRepo::create(
                &pool,
                NewCommand {
                    bot_id: bot.id,
                    name: name.to_string(),
                    description: "test".to_string(),
                    response: "ok".to_string(),
                    template_id: None,
                },
            )
            .await
            .unwrap();
            CommandRepo::set_enabled(&pool, command.id, enabled).await.unwrap();
        }

        let recorded = Arc::new(Recorded::default());
        let connector = MockConnector {
            recorded: recorded.clone(),
            fail,
            delay,
        };
        (
            BotSupervisor::new(pool.clone(), cipher, connector),
            recorded,
            pool,
            bot.id,
        )
    }

    async fn status(pool: &DbPool, id: i64) -> BotStatus {
        BotRepo::require(pool, id).await.unwrap().status
    }

    #[tokio::test]
    async fn test_start_passes_decrypted_token_and_enabled_commands() {
        let (supervisor, recorded, pool, id) = setup(false).await;

        supervisor.start(id).await.unwrap();

        assert!(supervisor.is_running(id));
        assert_eq!(status(&pool, id).await, BotStatus::Online);
        assert_eq!(*recorded.tokens.lock().unwrap(), vec!["abc123token".to_string()]);
        assert_eq!(*recorded.commands.lock().unwrap(), vec!["ping".to_string()]);
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let (supervisor, _recorded, _pool, id) = setup(false).await;

        supervisor.start(id).await.unwrap();
        let err = supervisor.start(id).await.unwrap_err();
        assert!(matches!(err, AppError::AlreadyRunning(_)));
    }

    #[tokio::test]
    async fn test_stop_shuts_session_down() {
        let (supervisor, recorded, pool, id) = setup(false).await;

        supervisor.start(id).await.unwrap();
        supervisor.stop(id).await.unwrap();

        assert!(!supervisor.is_running(id));
        assert_eq!(recorded.shut_down.load(Ordering::SeqCst), 1);
        assert_eq!(status(&pool, id).await, BotStatus::Offline);

        let err = supervisor.stop(id).await.unwrap_err();
        assert!(matches!(err, AppError::NotRunning(_)));
    }

    #[tokio::test]
    async fn test_connect_failure_marks_error_and_allows_retry() {
        let (supervisor, _recorded, pool, id) = setup(true).await;

        assert!(supervisor.start(id).await.is_err());
        assert_eq!(status(&pool, id).await, BotStatus::Error);
        assert!(!supervisor.is_running(id));

        // Error state is startable again
        assert!(supervisor.start(id).await.is_err());
    }

    #[tokio::test]
    async fn test_undecryptable_token_marks_error() {
        let (_supervisor, recorded, pool, id) = setup(false).await;
        let wrong_key = Arc::new(
            TokenCipher::new(Some(
                "ffeeddccbbaa99887766554433221100ffeeddccbbaa99887766554433221100",
            ))
            .unwrap(),
        );
        let supervisor = BotSupervisor::new(
            pool.clone(),
            wrong_key,
            MockConnector {
                recorded: recorded.clone(),
                fail: false,
                delay: Duration::ZERO,
            },
        );

        let err = supervisor.start(id).await.unwrap_err();
        assert!(err.is_unrecoverable_credential());
        assert_eq!(status(&pool, id).await, BotStatus::Error);
        assert!(recorded.tokens.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stop_all() {
        let (supervisor, _recorded, pool, id) = setup(false).await;
        supervisor.start(id).await.unwrap();

        supervisor.stop_all().await;

        assert!(!supervisor.is_running(id));
        assert_eq!(status(&pool, id).await, BotStatus::Offline);
    }

    #[tokio::test]
    async fn test_concurrent_starts_open_one_session() {
        let (supervisor, recorded, pool, id) =
            setup_with_delay(false, Duration::from_millis(100)).await;

        let (first, second) = tokio::join!(supervisor.start(id), supervisor.start(id));

        assert_ne!(first.is_ok(), second.is_ok());
        let rejected = first.err().or(second.err()).unwrap();
        assert!(matches!(rejected, AppError::AlreadyRunning(_)));
        assert_eq!(recorded.opened.load(Ordering::SeqCst), 1);

        supervisor.stop_all().await;
        assert_eq!(recorded.shut_down.load(Ordering::SeqCst), 1);
        assert_eq!(status(&pool, id).await, BotStatus::Offline);
    }

    #[tokio::test]
    async fn test_stop_shuts_down_even_when_status_write_fails() {
        let (supervisor, recorded, pool, id) = setup(false).await;
        supervisor.start(id).await.unwrap();

        // Row removed out from under the running bot
        BotRepo::delete(&pool, id).await.unwrap();

        let err = supervisor.stop(id).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        assert_eq!(recorded.shut_down.load(Ordering::SeqCst), 1);
        assert!(!supervisor.is_running(id));
    }

    /// Deletes the bot row, then refuses the connection
    struct VanishingConnector {
        pool: DbPool,
    }

    #[async_trait]
    impl GatewayConnector for VanishingConnector {
        async fn connect(
            &self,
            bot: &BotWithoutToken,
            _token: Zeroizing<String>,
            _commands: Vec<Command>,
        ) -> AppResult<Box<dyn BotSession>> {
            BotRepo::delete(&self.pool, bot.id).await?;
            Err(AppError::internal("gateway refused connection"))
        }
    }

    #[tokio::test]
    async fn test_start_failure_keeps_launch_error_when_status_write_fails() {
        let (_supervisor, _recorded, pool, id) = setup(false).await;
        let supervisor = BotSupervisor::new(
            pool.clone(),
            Arc::new(TokenCipher::new(Some(KEY)).unwrap()),
            VanishingConnector { pool: pool.clone() },
        );

        let err = supervisor.start(id).await.unwrap_err();
        assert!(matches!(err, AppError::Internal(_)));
    }
}
