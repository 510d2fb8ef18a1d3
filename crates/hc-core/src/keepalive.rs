//! Emits a `Ping` when the write side has been idle too long, and aborts the
//! connection when the read side has. Runs as its own task for the lifetime
//! of an active connection, the same `tokio::select!`-over-an-interval shape
//! the teacher uses for its per-connection heartbeat loop.

use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::HubConnectionOptions;
use crate::connection::ConnectionInner;

pub(crate) async fn run(inner: std::sync::Arc<ConnectionInner>, options: HubConnectionOptions, cancel: CancellationToken) {
    let resolution = (options.keep_alive_interval.min(options.client_timeout_interval) / 4)
        .max(Duration::from_millis(10));
    let mut ticker = tokio::time::interval(resolution);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        if inner.idle_read_time() >= options.client_timeout_interval {
            warn!(connection_id = %inner.connection_id, "read side idle past client timeout, aborting");
            inner.abort(crate::connection::CloseReason::TimedOut);
            return;
        }

        if inner.idle_write_time() >= options.keep_alive_interval {
            debug!(connection_id = %inner.connection_id, "emitting keep-alive ping");
            if inner.send_ping().await.is_err() {
                return;
            }
        }
    }
}
