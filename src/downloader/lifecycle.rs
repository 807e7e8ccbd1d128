//! Shutdown coordination.

use crate::error::Result;

use super::DownloadManager;

impl DownloadManager {
    /// Gracefully shut down the manager
    ///
    /// This method performs the shutdown sequence:
    /// 1. Stops accepting new downloads
    /// 2. Cancels queued and paused items immediately
    /// 3. Signals running transfers and waits until each has unwound and removed its file
    /// 4. Drains pending events to subscribers
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyShutDown`](crate::Error::AlreadyShutDown) on a second call
    /// - [`Error::ShutdownFromConsumer`](crate::Error::ShutdownFromConsumer) when called from
    ///   inside a task listener
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Initiating graceful shutdown");

        // 1-4. The group owns every task; its shutdown covers cancellation and draining
        self.group.shutdown().await?;

        // 5. Every Stopped event has been delivered, so the map should be empty
        let leftover = {
            let mut items = self.lock_items();
            let leftover = items.by_item.len();
            items.by_item.clear();
            items.by_task.clear();
            leftover
        };
        if leftover > 0 {
            tracing::warn!(leftover, "Dropped item mappings left after shutdown");
        }

        tracing::info!("Shutdown complete");
        Ok(())
    }

    /// Resolve once nothing is running or queued and all events have been broadcast
    pub async fn wait_idle(&self) {
        self.group.wait_idle().await;
    }
}
