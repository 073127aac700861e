use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use crate::message::{ChatMessage, UserId};

pub type StreamId = u64;

/// Sending half of one user's open stream.
#[derive(Clone, Debug)]
pub struct StreamHandle {
    id: StreamId,
    sender: mpsc::Sender<ChatMessage>,
}

impl StreamHandle {
    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn sender(&self) -> &mpsc::Sender<ChatMessage> {
        &self.sender
    }
}

/// Receiving half handed to whoever pumps the stream to the client.
#[derive(Debug)]
pub struct Subscription {
    stream_id: StreamId,
    receiver: mpsc::Receiver<ChatMessage>,
}

impl Subscription {
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Waits for the next message. `None` once the registry dropped this
    /// stream (unregistered or replaced).
    pub async fn recv(&mut self) -> Option<ChatMessage> {
        self.receiver.recv().await
    }
}

/// Maps each user id to its single live stream.
///
/// The lock is only held to mutate or copy the map; delivery happens on a
/// [`snapshot`](Self::snapshot) so slow peers never hold up registration.
pub struct StreamRegistry {
    streams: Mutex<HashMap<UserId, StreamHandle>>,
    capacity: usize,
    next_id: AtomicU64,
}

impl StreamRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
        }
    }

    /// Opens a stream for `user_id`. A previous stream for the same id is
    /// dropped, which closes it for its reader.
    pub async fn register(&self, user_id: UserId) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.capacity);
        let stream_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = StreamHandle {
            id: stream_id,
            sender,
        };

        let previous = self.streams.lock().await.insert(user_id.clone(), handle);
        if let Some(previous) = previous {
            debug!(%user_id, replaced = previous.id, stream_id, "replaced existing stream");
        }

        Subscription {
            stream_id,
            receiver,
        }
    }

    /// Removes whatever stream `user_id` has. Returns false if there was none.
    pub async fn unregister(&self, user_id: &str) -> bool {
        self.streams.lock().await.remove(user_id).is_some()
    }

    /// Removes the entry for `user_id` only while it still refers to
    /// `stream_id`.
    pub async fn unregister_stream(&self, user_id: &str, stream_id: StreamId) -> bool {
        let mut streams = self.streams.lock().await;
        match streams.get(user_id) {
            Some(handle) if handle.id == stream_id => {
                streams.remove(user_id);
                true
            }
            _ => false,
        }
    }

    pub async fn snapshot(&self) -> Vec<(UserId, StreamHandle)> {
        self.streams
            .lock()
            .await
            .iter()
            .map(|(user_id, handle)| (user_id.clone(), handle.clone()))
            .collect()
    }

    pub async fn contains(&self, user_id: &str) -> bool {
        self.streams.lock().await.contains_key(user_id)
    }

    pub async fn len(&self) -> usize {
        self.streams.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drops every stream, ending all readers.
    pub async fn clear(&self) {
        self.streams.lock().await.clear();
    }
}
