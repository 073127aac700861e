use std::{sync::Arc, time::Duration};

use futures::future::join_all;
use thiserror::Error;
use tokio::time;
use tracing::{debug, warn};

use crate::{
    message::{ChatMessage, UserId},
    registry::{StreamHandle, StreamRegistry},
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("stream closed")]
    Closed,
    #[error("stream did not accept the message within {0:?}")]
    TimedOut(Duration),
}

/// Per-recipient outcome of one broadcast.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: Vec<UserId>,
    pub evicted: Vec<UserId>,
    pub timed_out: Vec<UserId>,
}

/// Fans a message out to every registered stream.
///
/// Delivery is best effort per recipient. Closed streams are unregistered,
/// slow streams are skipped for this message and kept.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<StreamRegistry>,
    delivery_timeout: Duration,
}

impl Dispatcher {
    pub fn new(registry: Arc<StreamRegistry>, delivery_timeout: Duration) -> Self {
        Self {
            registry,
            delivery_timeout,
        }
    }

    pub async fn broadcast(&self, message: &ChatMessage) -> BroadcastReport {
        let targets = self.registry.snapshot().await;
        let attempts = targets.iter().map(|(user_id, handle)| async move {
            let outcome = deliver(handle, message.clone(), self.delivery_timeout).await;
            (user_id, handle.id(), outcome)
        });

        let mut report = BroadcastReport::default();
        for (user_id, stream_id, outcome) in join_all(attempts).await {
            match outcome {
                Ok(()) => report.delivered.push(user_id.clone()),
                Err(DeliveryError::Closed) => {
                    debug!(%user_id, stream_id, "stream closed; unregistering");
                    if self.registry.unregister_stream(user_id, stream_id).await {
                        report.evicted.push(user_id.clone());
                    }
                }
                Err(error @ DeliveryError::TimedOut(_)) => {
                    warn!(%user_id, %error, body = %message.body, "failed to deliver message");
                    report.timed_out.push(user_id.clone());
                }
            }
        }

        report
    }
}

async fn deliver(
    handle: &StreamHandle,
    message: ChatMessage,
    limit: Duration,
) -> Result<(), DeliveryError> {
    match time::timeout(limit, handle.sender().send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => Err(DeliveryError::Closed),
        Err(_) => Err(DeliveryError::TimedOut(limit)),
    }
}
