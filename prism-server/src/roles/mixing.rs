//! Mix strategies: how long a mix holds a message before forwarding.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use prism_types::message::PrismMessage;

use crate::config::ServerConfig;

/// A mixing discipline. `mix` suspends the caller for however long the
/// strategy holds the message; pooled strategies may instead return
/// messages through their own flush channel.
pub enum MixStrategy {
    /// No delay.
    Idempotent,
    /// Exponentially distributed delay with rate λ.
    Poisson {
        /// The rate parameter.
        lambda: f64,
    },
    /// Collect messages into a pool, flush a random permutation when the
    /// pool reaches its threshold.
    Pool {
        /// Flush threshold.
        threshold: usize,
        /// Buffered messages awaiting flush.
        pool: Mutex<VecDeque<PrismMessage>>,
        /// Sender used to emit messages when the pool flushes.
        flush: mpsc::UnboundedSender<PrismMessage>,
    },
}

impl MixStrategy {
    /// Build the configured strategy. Pool mixes return the receiving end
    /// of their flush channel.
    pub fn from_config(
        config: &Arc<ServerConfig>,
    ) -> (Self, Option<mpsc::UnboundedReceiver<PrismMessage>>) {
        match config.mix_strategy.to_ascii_lowercase().as_str() {
            "poisson" => (
                MixStrategy::Poisson {
                    lambda: config.mix_poisson_lambda.max(f64::MIN_POSITIVE),
                },
                None,
            ),
            "pool" => {
                let (flush, rx) = mpsc::unbounded_channel();
                (
                    MixStrategy::Pool {
                        threshold: config.mix_pool_threshold.max(1),
                        pool: Mutex::new(VecDeque::new()),
                        flush,
                    },
                    Some(rx),
                )
            }
            other => {
                if other != "idempotent" {
                    tracing::info!("unknown mix strategy {other:?}; using idempotent");
                }
                (MixStrategy::Idempotent, None)
            }
        }
    }

    /// Apply the mixing discipline to a message. Returns the message when
    /// the caller should forward it now; `None` when the strategy took
    /// ownership (pool) and will flush it later.
    pub async fn mix(&self, message: PrismMessage) -> Option<PrismMessage> {
        match self {
            MixStrategy::Idempotent => {
                tokio::task::yield_now().await;
                Some(message)
            }
            MixStrategy::Poisson { lambda } => {
                let delay = exponential_delay(*lambda);
                tracing::debug!("poisson mix holding message for {delay:?}");
                tokio::time::sleep(delay).await;
                Some(message)
            }
            MixStrategy::Pool {
                threshold,
                pool,
                flush,
            } => {
                let batch = {
                    let mut pool = pool.lock();
                    pool.push_back(message);
                    if pool.len() >= *threshold {
                        let mut drained: Vec<PrismMessage> = pool.drain(..).collect();
                        use rand::seq::SliceRandom as _;
                        drained.shuffle(&mut rand::thread_rng());
                        Some(drained)
                    } else {
                        None
                    }
                };
                if let Some(batch) = batch {
                    tracing::debug!("pool mix flushing {} messages", batch.len());
                    for message in batch {
                        let _ = flush.send(message);
                    }
                }
                None
            }
        }
    }
}

fn exponential_delay(lambda: f64) -> Duration {
    use rand::Rng as _;
    let u: f64 = rand::thread_rng().r#gen::<f64>().max(f64::MIN_POSITIVE);
    Duration::from_secs_f64((-u.ln() / lambda).min(60.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_types::message::MsgType;

    #[tokio::test]
    async fn idempotent_mix_returns_immediately() {
        let (mix, _) = MixStrategy::from_config(&Arc::new(ServerConfig::for_node("m")));
        let msg = PrismMessage::new(MsgType::SendToEmix);
        assert!(mix.mix(msg).await.is_some());
    }

    #[tokio::test]
    async fn pool_mix_flushes_at_threshold() {
        let mut config = ServerConfig::for_node("m");
        config.mix_strategy = "pool".into();
        config.mix_pool_threshold = 3;
        let (mix, rx) = MixStrategy::from_config(&Arc::new(config));
        let mut rx = rx.unwrap();

        for _ in 0..2 {
            assert!(mix.mix(PrismMessage::new(MsgType::SendToEmix)).await.is_none());
        }
        assert!(rx.try_recv().is_err());
        assert!(mix.mix(PrismMessage::new(MsgType::SendToEmix)).await.is_none());
        for _ in 0..3 {
            assert!(rx.try_recv().is_ok());
        }
    }
}
