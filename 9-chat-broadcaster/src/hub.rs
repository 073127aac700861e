use std::{sync::Arc, time::Duration};

use thiserror::Error;
use tracing::info;

use crate::{
    directory::{InsertUserError, UserDirectory},
    dispatcher::{BroadcastReport, Dispatcher},
    message::{ChatMessage, User},
    registry::{StreamId, StreamRegistry, Subscription},
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubError {
    #[error("user id must not be empty")]
    EmptyUserId,
    #[error("user id '{0}' has already joined")]
    AlreadyJoined(String),
    #[error("user id '{0}' is reserved")]
    Reserved(String),
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Upper bound on a single per-recipient delivery attempt.
    pub delivery_timeout: Duration,
    /// Messages buffered per stream before deliveries start timing out.
    pub stream_buffer: usize,
    /// How long a client may leave one pushed frame unread before its
    /// stream is dropped.
    pub write_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            delivery_timeout: Duration::from_millis(100),
            stream_buffer: 64,
            write_timeout: Duration::from_secs(1),
        }
    }
}

/// Session lifecycle for every connected user: join, stream, send, leave.
#[derive(Clone)]
pub struct ChatHub {
    directory: Arc<UserDirectory>,
    registry: Arc<StreamRegistry>,
    dispatcher: Dispatcher,
    write_timeout: Duration,
}

impl ChatHub {
    pub fn new(config: HubConfig) -> Self {
        let registry = Arc::new(StreamRegistry::new(config.stream_buffer));
        Self {
            directory: Arc::new(UserDirectory::new()),
            registry: Arc::clone(&registry),
            dispatcher: Dispatcher::new(registry, config.delivery_timeout),
            write_timeout: config.write_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<StreamRegistry> {
        &self.registry
    }

    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    /// Adds `user` to the directory and announces them. Returns the
    /// announcement text.
    pub async fn join(&self, user: User) -> Result<String, HubError> {
        if user.id.is_empty() {
            return Err(HubError::EmptyUserId);
        }
        if user.is_system() {
            return Err(HubError::Reserved(user.id));
        }

        let joined = format!("{} joined the chat", user.name);
        let user_id = user.id.clone();
        self.directory
            .insert(user)
            .await
            .map_err(|InsertUserError::DuplicateId| HubError::AlreadyJoined(user_id))?;

        info!("{joined}");
        self.dispatcher.broadcast(&ChatMessage::system(&joined)).await;
        Ok(joined)
    }

    /// Binds a fresh stream for `user`. The caller owns the stream's
    /// lifetime and must hand it back through [`close_stream`](Self::close_stream).
    pub async fn open_stream(&self, user: &User) -> Subscription {
        let subscription = self.registry.register(user.id.clone()).await;
        info!(user_id = %user.id, name = %user.name, stream_id = subscription.stream_id(), "stream opened");
        subscription
    }

    /// Cleans up after a stream whose transport went away. Only the user's
    /// current stream counts; a replaced or already disconnected stream is
    /// ignored.
    pub async fn close_stream(&self, user: &User, stream_id: StreamId) -> bool {
        if !self.registry.unregister_stream(&user.id, stream_id).await {
            return false;
        }
        info!(user_id = %user.id, stream_id, "stream closed");
        self.depart(user).await;
        true
    }

    pub async fn send_message(&self, message: ChatMessage) -> BroadcastReport {
        info!(from = %message.from.name, "received message: {}", message.body);
        self.dispatcher.broadcast(&message).await
    }

    pub async fn users(&self) -> Vec<User> {
        self.directory.snapshot().await
    }

    pub async fn disconnect(&self, user: &User) {
        self.registry.unregister(&user.id).await;
        self.depart(user).await;
    }

    /// Ends every open stream.
    pub async fn shutdown(&self) {
        self.dispatcher
            .broadcast(&ChatMessage::system("server shutting down"))
            .await;
        self.registry.clear().await;
    }

    async fn depart(&self, user: &User) {
        let Some(known) = self.directory.remove(&user.id).await else {
            return;
        };
        let left = format!("{} left the chat", known.name);
        info!("{left}");
        self.dispatcher.broadcast(&ChatMessage::system(left)).await;
    }
}
