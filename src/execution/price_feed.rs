use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, watch};

use crate::api::{PriceFeed, PriceStream};
use crate::config::FeedConfig;
use crate::engine::EngineCommand;
use crate::error::ExchangeError;
use crate::models::PriceEvent;

/// Counters reported when the supervisor stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedStats {
    pub subscriptions: u64,
    pub events_delivered: u64,
    pub reconnects: u64,
}

enum StreamEnd {
    Shutdown,
    EngineGone,
    Failed(ExchangeError),
    Stalled,
}

/// Keeps exactly one price subscription alive and forwards it to the engine
///
/// Any stream error, end of stream or stall is followed by a fixed
/// reconnect delay and a fresh subscription. The old stream is dropped
/// before the new one is opened.
pub struct FeedSupervisor {
    feed: Arc<dyn PriceFeed>,
    symbol: String,
    reconnect_delay: Duration,
    stall_timeout: Option<Duration>,
}

impl FeedSupervisor {
    pub fn new(feed: Arc<dyn PriceFeed>, symbol: impl Into<String>, config: &FeedConfig) -> Self {
        Self {
            feed,
            symbol: symbol.into(),
            reconnect_delay: config.reconnect_delay(),
            stall_timeout: (config.stall_timeout_secs > 0).then(|| config.stall_timeout()),
        }
    }

    /// Run until shutdown is signaled or the engine mailbox closes
    pub async fn run(
        self,
        sink: mpsc::Sender<EngineCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) -> FeedStats {
        let mut stats = FeedStats::default();

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.feed.subscribe(&self.symbol).await {
                Ok(stream) => {
                    stats.subscriptions += 1;
                    tracing::info!("📡 Subscribed to {} price stream", self.symbol);

                    match self.forward(stream, &sink, &mut shutdown, &mut stats).await {
                        StreamEnd::Shutdown => break,
                        StreamEnd::EngineGone => {
                            tracing::warn!("Engine mailbox closed, stopping price feed");
                            break;
                        }
                        StreamEnd::Failed(err) => {
                            tracing::warn!("⚠️  {} price stream failed: {}", self.symbol, err)
                        }
                        StreamEnd::Stalled => tracing::warn!(
                            "⚠️  No {} price for {:?}, treating connection as dead",
                            self.symbol,
                            self.stall_timeout.unwrap_or_default()
                        ),
                    }
                }
                Err(err) => {
                    tracing::error!("Failed to subscribe to {}: {}", self.symbol, err);
                }
            }

            stats.reconnects += 1;
            tracing::info!("Reconnecting in {:?}", self.reconnect_delay);
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }

        tracing::info!(
            subscriptions = stats.subscriptions,
            events = stats.events_delivered,
            "Price feed stopped"
        );
        stats
    }

    /// Pump one subscription; the stream is dropped on return
    async fn forward(
        &self,
        mut stream: PriceStream,
        sink: &mpsc::Sender<EngineCommand>,
        shutdown: &mut watch::Receiver<bool>,
        stats: &mut FeedStats,
    ) -> StreamEnd {
        loop {
            let next = tokio::select! {
                _ = shutdown.changed() => return StreamEnd::Shutdown,
                next = next_event(&mut stream, self.stall_timeout) => next,
            };

            match next {
                Some(Some(Ok(event))) => {
                    if sink.send(EngineCommand::Price(event)).await.is_err() {
                        return StreamEnd::EngineGone;
                    }
                    stats.events_delivered += 1;
                }
                Some(Some(Err(err))) => return StreamEnd::Failed(err),
                Some(None) => return StreamEnd::Failed(ExchangeError::Disconnected),
                None => return StreamEnd::Stalled,
            }
        }
    }
}

/// Next stream item, or None if the stall watchdog fired first
async fn next_event(
    stream: &mut PriceStream,
    stall_timeout: Option<Duration>,
) -> Option<Option<Result<PriceEvent, ExchangeError>>> {
    match stall_timeout {
        Some(limit) => tokio::time::timeout(limit, stream.next()).await.ok(),
        None => Some(stream.next().await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use futures::stream;
    use rust_decimal::Decimal;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// Each session replays its events, then either errors or goes silent
    struct ScriptedFeed {
        sessions: Mutex<VecDeque<(Vec<Decimal>, bool)>>,
        active: Arc<AtomicUsize>,
        max_active: Arc<AtomicUsize>,
        subscribe_calls: AtomicUsize,
    }

    struct ActiveGuard(Arc<AtomicUsize>);

    impl Drop for ActiveGuard {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl ScriptedFeed {
        fn new(sessions: Vec<(Vec<Decimal>, bool)>) -> Arc<Self> {
            Arc::new(Self {
                sessions: Mutex::new(sessions.into()),
                active: Arc::new(AtomicUsize::new(0)),
                max_active: Arc::new(AtomicUsize::new(0)),
                subscribe_calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl PriceFeed for ScriptedFeed {
        async fn subscribe(&self, _symbol: &str) -> Result<PriceStream, ExchangeError> {
            self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
            let Some((prices, then_error)) = self.sessions.lock().unwrap().pop_front() else {
                return Err(ExchangeError::Transport("connection refused".into()));
            };

            let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now_active, Ordering::SeqCst);
            let guard = ActiveGuard(self.active.clone());

            let events = stream::iter(
                prices
                    .into_iter()
                    .map(|price| Ok(PriceEvent::tick(price, Utc::now()))),
            );
            let tail: PriceStream = if then_error {
                stream::iter(vec![Err(ExchangeError::Disconnected)]).boxed()
            } else {
                stream::pending().boxed()
            };

            Ok(events
                .chain(tail)
                .map(move |item| {
                    let _held = &guard;
                    item
                })
                .boxed())
        }
    }

    fn supervisor(feed: Arc<ScriptedFeed>) -> FeedSupervisor {
        FeedSupervisor::new(feed, "BTCUSDT", &FeedConfig::default())
    }

    async fn next_price(rx: &mut mpsc::Receiver<EngineCommand>) -> Decimal {
        match rx.recv().await {
            Some(EngineCommand::Price(event)) => event.price,
            other => panic!("expected a price, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_stream_error() {
        let feed = ScriptedFeed::new(vec![
            (vec![Decimal::from(1), Decimal::from(2)], true),
            (vec![Decimal::from(3)], false),
        ]);
        let (tx, mut rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let started = Instant::now();
        let handle = tokio::spawn(supervisor(feed.clone()).run(tx, shutdown_rx));

        assert_eq!(next_price(&mut rx).await, Decimal::from(1));
        assert_eq!(next_price(&mut rx).await, Decimal::from(2));
        assert_eq!(next_price(&mut rx).await, Decimal::from(3));
        assert!(started.elapsed() >= Duration::from_secs(5));

        shutdown_tx.send(true).unwrap();
        let stats = handle.await.unwrap();

        assert_eq!(stats.subscriptions, 2);
        assert_eq!(stats.events_delivered, 3);
        assert_eq!(stats.reconnects, 1);
        assert_eq!(feed.max_active.load(Ordering::SeqCst), 1);
        assert_eq!(feed.active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_stream_is_replaced() {
        let feed = ScriptedFeed::new(vec![
            (vec![Decimal::from(10)], false),
            (vec![Decimal::from(11)], false),
        ]);
        let (tx, mut rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let started = Instant::now();
        let handle = tokio::spawn(supervisor(feed.clone()).run(tx, shutdown_rx));

        assert_eq!(next_price(&mut rx).await, Decimal::from(10));
        assert_eq!(next_price(&mut rx).await, Decimal::from(11));
        // Watchdog (30s) plus reconnect delay (5s)
        assert!(started.elapsed() >= Duration::from_secs(35));
        assert_eq!(feed.max_active.load(Ordering::SeqCst), 1);

        shutdown_tx.send(true).unwrap();
        let stats = handle.await.unwrap();
        assert_eq!(stats.subscriptions, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_reconnect_wait() {
        let feed = ScriptedFeed::new(vec![]);
        let (tx, _rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(supervisor(feed.clone()).run(tx, shutdown_rx));
        tokio::time::sleep(Duration::from_secs(12)).await;
        shutdown_tx.send(true).unwrap();

        let stats = handle.await.unwrap();
        assert_eq!(stats.subscriptions, 0);
        // Attempts at 0s, 5s and 10s
        assert_eq!(feed.subscribe_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_when_engine_is_gone() {
        let feed = ScriptedFeed::new(vec![(vec![Decimal::from(1)], false)]);
        let (tx, rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        drop(rx);

        let stats = supervisor(feed).run(tx, shutdown_rx).await;
        assert_eq!(stats.subscriptions, 1);
        assert_eq!(stats.events_delivered, 0);
    }
}
