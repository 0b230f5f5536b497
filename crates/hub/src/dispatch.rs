use rumqttc::{AsyncClient, ClientError, QoS};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("publish rejected: {0}")]
    Client(#[from] ClientError),

    #[error("publish timed out after {0:?}")]
    Timeout(Duration),
}

/// Fire-and-forget publisher used by the scheduler.
pub trait Dispatcher: Send + Sync {
    fn publish(
        &self,
        topic: &str,
        message: &str,
    ) -> impl Future<Output = Result<(), DispatchError>> + Send;
}

/// Publishes through the hub's MQTT client at QoS 0, not retained.
#[derive(Clone)]
pub struct MqttDispatcher {
    client: AsyncClient,
    timeout: Duration,
}

impl MqttDispatcher {
    pub fn new(client: AsyncClient, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

impl Dispatcher for MqttDispatcher {
    async fn publish(&self, topic: &str, message: &str) -> Result<(), DispatchError> {
        // The request queue is bounded; when the event loop stalls the send
        // would wait forever without this timeout.
        tokio::time::timeout(
            self.timeout,
            self.client
                .publish(topic, QoS::AtMostOnce, false, message.as_bytes().to_vec()),
        )
        .await
        .map_err(|_| DispatchError::Timeout(self.timeout))??;
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
