use crate::client::Client;
use crate::socket::events::{EV_PING, PingPayload};
use log::{debug, trace};
use std::sync::Arc;
use std::time::Duration;

/// Liveness ping cadence while negotiation is pending.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(5);

impl Client {
    /// Starts the keep-alive task. A no-op when one is already running, so
    /// the re-entrant connection path never stacks a second one.
    pub(crate) async fn start_keep_alive(self: &Arc<Self>) {
        let mut guard = self.keepalive.lock().await;
        if guard.is_some() {
            return;
        }
        debug!(target: "Client/Keepalive", "Starting keep-alive");
        let client = self.clone();
        *guard = Some(tokio::spawn(async move { client.keepalive_loop().await }));
    }

    pub(crate) async fn stop_keep_alive(&self) {
        if let Some(handle) = self.keepalive.lock().await.take() {
            handle.abort();
            debug!(target: "Client/Keepalive", "Keep-alive stopped");
        }
    }

    /// Pings every [`KEEP_ALIVE_INTERVAL`], gated on channel-connected.
    /// Pings are skipped silently while disconnected, never queued. The task
    /// runs until aborted by entering `InCall` or `Ended`.
    async fn keepalive_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(KEEP_ALIVE_INTERVAL);
        // The first tick fires immediately; the cadence starts one interval in.
        ticker.tick().await;
        loop {
            ticker.tick().await;

            if !self.channel().is_connected() {
                trace!(target: "Client/Keepalive", "Not connected, skipping ping");
                continue;
            }
            let Some(ctx) = self.session_context().await else {
                continue;
            };
            let payload = PingPayload {
                connection_id: ctx.connection_id,
            };
            match serde_json::to_value(&payload) {
                Ok(data) => {
                    self.channel().emit(EV_PING, data).await;
                    debug!(target: "Client/Keepalive", "Ping sent");
                }
                Err(e) => trace!(target: "Client/Keepalive", "Failed to encode ping: {e}"),
            }
        }
    }
}
