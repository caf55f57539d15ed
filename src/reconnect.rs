use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};

use crate::config::ReconnectType;
use crate::engine::EngineInner;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconnectStrategy {
    Soft,
    Full,
}

/// Delay before the given zero-based attempt. The first attempt runs
/// immediately; later ones back off quadratically up to five seconds.
pub(crate) fn reconnect_delay(attempt: u32) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let millis = 100 + u64::from(attempt) * u64::from(attempt) * 500;
    Duration::from_millis(millis.min(5_000))
}

/// Picks soft or full for one attempt. In the default mode only the very
/// first attempt resumes; any soft failure, a server-demanded rejoin, or a
/// later attempt falls through to full.
pub(crate) fn select_strategy(
    reconnect_type: ReconnectType,
    attempt: u32,
    soft_failed: bool,
    full_on_first: bool,
) -> ReconnectStrategy {
    match reconnect_type {
        ReconnectType::ForceSoftReconnect => ReconnectStrategy::Soft,
        ReconnectType::ForceFullReconnect => ReconnectStrategy::Full,
        ReconnectType::Default => {
            if attempt == 0 && !full_on_first && !soft_failed {
                ReconnectStrategy::Soft
            } else {
                ReconnectStrategy::Full
            }
        }
    }
}

/// Runs the retry loop after a disconnect. At most one controller is active
/// per engine; the engine parks the task handle and later triggers observe it.
pub(crate) struct ReconnectController {
    engine: Arc<EngineInner>,
}

impl ReconnectController {
    pub(crate) fn new(engine: Arc<EngineInner>) -> Self {
        Self { engine }
    }

    pub(crate) async fn run(self) {
        let config = self.engine.config.clone();
        let reconnect_type = self.engine.reconnect_type().await;
        let full_on_first = self
            .engine
            .full_reconnect_on_next
            .swap(false, Ordering::SeqCst);
        let started = Instant::now();
        let mut soft_failed = false;

        for attempt in 0..config.max_reconnect_retries {
            if self.engine.is_closed() {
                return;
            }
            sleep(reconnect_delay(attempt)).await;
            if self.engine.is_closed() {
                return;
            }
            if started.elapsed() >= config.max_reconnect_timeout {
                tracing::warn!("reconnect deadline exceeded");
                break;
            }

            let strategy = select_strategy(reconnect_type, attempt, soft_failed, full_on_first);
            tracing::info!("reconnect attempt {} ({:?})", attempt, strategy);

            let res = match strategy {
                ReconnectStrategy::Soft => self.engine.resume_session().await,
                ReconnectStrategy::Full => self.engine.rejoin_session().await,
            };

            match res {
                Ok(()) => {
                    self.engine
                        .finish_reconnect(strategy == ReconnectStrategy::Full)
                        .await;
                    return;
                }
                Err(err) => {
                    tracing::warn!("reconnect attempt {} failed: {}", attempt, err);
                    if strategy == ReconnectStrategy::Soft {
                        soft_failed = true;
                    }
                }
            }
        }

        tracing::error!("giving up reconnecting after {:?}", started.elapsed());
        self.engine.close_from_reconnect().await;
    }
}
