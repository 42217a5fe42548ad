// ABOUTME: Keepalive task: periodic NOP pings and a silence-based dead-peer check
// ABOUTME: Adapted from the teacher's keepalive timing logic into a real background task

use super::Inner;
use std::sync::Arc;
use tokio::time::Instant;

pub async fn run(inner: Arc<Inner>) {
    let mut ping_tick = tokio::time::interval(inner.config.keepalive_interval);
    let mut timeout_tick = tokio::time::interval(inner.config.keepalive_timeout);
    // The first tick of an `interval` fires immediately; skip it so pings start one interval
    // out, matching the cadence the configuration describes.
    ping_tick.tick().await;
    timeout_tick.tick().await;

    loop {
        tokio::select! {
            _ = inner.wait_closed() => return,
            _ = ping_tick.tick() => on_ping_tick(&inner).await,
            _ = timeout_tick.tick() => {
                if on_timeout_tick(&inner) {
                    return;
                }
            }
        }
    }
}

async fn on_ping_tick(inner: &Inner) {
    // The submission deadline is the tick instant itself: an effectively-immediate cancel
    // window rather than a full interval out, so a ping that can't be shaped right away is
    // abandoned instead of queuing up behind a slow or stalled transport.
    if let Err(e) = inner.submit_nop(Instant::now()).await {
        tracing::debug!(error = %e, "keepalive: ping submission did not complete in time");
    }
    // Nudges a parked receiver in case a credit notification race left it waiting.
    inner.bucket().nudge();
}

/// Returns `true` if the session should be closed.
fn on_timeout_tick(inner: &Inner) -> bool {
    let had_data = inner.swap_data_ready_false();
    if !had_data && inner.bucket().is_positive() {
        tracing::warn!("keepalive: peer silent past timeout, closing session");
        inner.set_terminal(crate::error::TerminalState::Closed);
        inner.stream_table().mark_all_session_closed();
        return true;
    }
    false
}
