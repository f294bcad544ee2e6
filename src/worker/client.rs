use tokio::sync::{mpsc, oneshot, watch};

use crate::formats::OfflineStatus;
use crate::worker::model::{ClearCacheAck, ControlMessage, Envelope};

/// Sending half of the worker's control channel.
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<Envelope>,
}

impl ControllerHandle {
    pub(crate) fn new(tx: mpsc::Sender<Envelope>) -> Self {
        Self { tx }
    }

    /// Posts `message` without waiting; a clear request returns its reply port.
    pub fn post_message(
        &self,
        message: ControlMessage,
    ) -> anyhow::Result<Option<oneshot::Receiver<ClearCacheAck>>> {
        let (reply, ack) = match message {
            ControlMessage::ClearCache => {
                let (tx, rx) = oneshot::channel();
                (Some(tx), Some(rx))
            }
            ControlMessage::CacheWarm => (None, None),
        };
        self.tx
            .try_send(Envelope { message, reply })
            .map_err(|err| anyhow::anyhow!("post {message:?}: {err}"))?;
        Ok(ack)
    }
}

/// What a page sees of the offline machinery.
#[derive(Debug, Clone)]
pub struct OfflineClient {
    controller: Option<ControllerHandle>,
    status: watch::Receiver<Option<OfflineStatus>>,
}

impl OfflineClient {
    pub fn new(
        controller: Option<ControllerHandle>,
        status: watch::Receiver<Option<OfflineStatus>>,
    ) -> Self {
        Self { controller, status }
    }

    pub fn has_controller(&self) -> bool {
        self.controller.is_some()
    }

    /// The latest status record, or `None` before the worker created one.
    pub fn status(&self) -> Option<OfflineStatus> {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<OfflineStatus>> {
        self.status.clone()
    }

    pub fn trigger_cache_warming(&self) {
        let Some(controller) = &self.controller else {
            tracing::debug!("no active worker; cache warming skipped");
            return;
        };
        if let Err(err) = controller.post_message(ControlMessage::CacheWarm) {
            tracing::warn!(err = format!("{err:#}"), "cache warming request dropped");
        }
    }

    /// Fire and forget; the acknowledgment is only logged.
    pub fn clear_offline_cache(&self) {
        let Some(ack) = self.post_clear() else {
            return;
        };
        tokio::spawn(async move {
            match ack.await {
                Ok(ack) => tracing::info!(success = ack.success, "offline cache cleared"),
                Err(_) => tracing::warn!("worker dropped the clear-cache reply"),
            }
        });
    }

    /// Like [`Self::clear_offline_cache`] but waits for the worker's answer.
    pub async fn clear_offline_cache_acknowledged(&self) -> Option<ClearCacheAck> {
        self.post_clear()?.await.ok()
    }

    fn post_clear(&self) -> Option<oneshot::Receiver<ClearCacheAck>> {
        let Some(controller) = &self.controller else {
            tracing::debug!("no active worker; clear request skipped");
            return None;
        };
        match controller.post_message(ControlMessage::ClearCache) {
            Ok(ack) => ack,
            Err(err) => {
                tracing::warn!(err = format!("{err:#}"), "clear request dropped");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::CacheState;

    #[tokio::test]
    async fn clear_request_carries_a_reply_port() -> anyhow::Result<()> {
        let (tx, mut rx) = mpsc::channel(4);
        let (_status_tx, status_rx) = watch::channel(None);
        let client = OfflineClient::new(Some(ControllerHandle::new(tx)), status_rx);

        client.trigger_cache_warming();
        let warm = rx.recv().await.expect("warm message");
        assert_eq!(warm.message, ControlMessage::CacheWarm);
        assert!(warm.reply.is_none());

        let waiting = tokio::spawn({
            let client = client.clone();
            async move { client.clear_offline_cache_acknowledged().await }
        });
        let clear = rx.recv().await.expect("clear message");
        assert_eq!(clear.message, ControlMessage::ClearCache);
        let reply = clear.reply.expect("reply port");
        let _ = reply.send(ClearCacheAck { success: true });

        assert_eq!(waiting.await?, Some(ClearCacheAck { success: true }));
        Ok(())
    }

    #[tokio::test]
    async fn status_follows_the_store() -> anyhow::Result<()> {
        let (status_tx, status_rx) = watch::channel(None);
        let client = OfflineClient::new(None, status_rx);
        assert_eq!(client.status(), None);

        let mut status = OfflineStatus::not_started("v1");
        status.state = CacheState::InProgress;
        status_tx.send_replace(Some(status));

        let mut rx = client.subscribe();
        rx.wait_for(|s| s.is_some()).await?;
        assert_eq!(client.status().map(|s| s.state), Some(CacheState::InProgress));
        Ok(())
    }

    #[tokio::test]
    async fn without_a_controller_requests_are_no_ops() {
        let (_status_tx, status_rx) = watch::channel(None);
        let client = OfflineClient::new(None, status_rx);
        client.trigger_cache_warming();
        client.clear_offline_cache();
        assert_eq!(client.clear_offline_cache_acknowledged().await, None);
    }
}
