//! Connection pool spreading topics over a bounded set of connections

use crate::auth::AuthProvider;
use crate::client::{Connection, ConnectionContext, Transport};
use crate::config::PoolConfig;
use crate::errors::{PoolError, Result};
use crate::metrics::PoolMetrics;
use crate::status::StatusSink;
use crate::topic::{Topic, TopicKey};

use futures_util::future::join_all;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Default)]
struct Placement {
    connections: Vec<Arc<Connection>>,
    /// Topics of retired connections not yet placed again
    recycled: Vec<Topic>,
}

struct PoolInner {
    ctx: ConnectionContext,
    running: AtomicBool,
    /// Exclusive section for every placement change
    placement: tokio::sync::Mutex<Placement>,
    /// Number of unfinished follow-up tasks
    outstanding: watch::Sender<usize>,
    /// Indices of evicted connections still shutting down
    retiring: Mutex<HashSet<usize>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Distributes topics over at most `max_connections` connections of
/// `topics_per_connection` topics each, and consolidates them when topics go
/// away. Cloning yields another handle to the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(
        config: PoolConfig,
        transport: Arc<dyn Transport>,
        auth: Arc<dyn AuthProvider>,
        status: Arc<dyn StatusSink>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                ctx: ConnectionContext {
                    config: Arc::new(config),
                    transport,
                    auth,
                    status,
                    metrics: Arc::new(PoolMetrics::new()),
                },
                running: AtomicBool::new(false),
                placement: tokio::sync::Mutex::new(Placement::default()),
                outstanding: watch::Sender::new(0),
                retiring: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.ctx.config
    }

    pub fn metrics(&self) -> Arc<PoolMetrics> {
        Arc::clone(&self.inner.ctx.metrics)
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Place topics on existing connections first, then on new ones.
    /// Duplicates and keys the pool already carries are skipped. Topics that
    /// fit stay placed even when the rest exceeds the pool's capacity.
    pub async fn add_topics<I>(&self, topics: I) -> Result<()>
    where
        I: IntoIterator<Item = Topic>,
    {
        self.inner.add_topics(topics.into_iter().collect()).await
    }

    /// Remove topics from every connection, then retire connections the
    /// remaining topics no longer need
    pub async fn remove_topics<I>(&self, keys: I)
    where
        I: IntoIterator<Item = TopicKey>,
    {
        self.inner.remove_topics(keys.into_iter().collect()).await
    }

    /// Start every connection and wait until all of them are connected
    pub async fn start(&self) {
        self.inner.running.store(true, Ordering::SeqCst);
        let connections = self.snapshot().await;
        info!("Starting pool with {} connection(s)", connections.len());
        join_all(connections.iter().map(|c| c.start())).await;
    }

    /// Stop every connection. With `clear_topics` the connections are
    /// discarded together with their topics.
    pub async fn stop(&self, clear_topics: bool) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.settle().await;

        let connections = {
            let mut placement = self.inner.placement.lock().await;
            if clear_topics {
                placement.recycled.clear();
                std::mem::take(&mut placement.connections)
            } else {
                placement.connections.clone()
            }
        };
        info!("Stopping pool with {} connection(s)", connections.len());
        join_all(connections.iter().map(|c| c.stop(clear_topics))).await;
        lock(&self.inner.retiring).clear();
    }

    /// Wait for outstanding consolidation work to finish. Dropping the
    /// returned future leaves that work running.
    pub async fn settle(&self) {
        let mut outstanding = self.inner.outstanding.subscribe();
        let _ = outstanding.wait_for(|n| *n == 0).await;
    }

    async fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.inner.placement.lock().await.connections.clone()
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.placement.lock().await.connections.len()
    }

    pub async fn topic_count(&self) -> usize {
        self.snapshot().await.iter().map(|c| c.topic_count()).sum()
    }

    /// Topic count of each connection, in index order
    pub async fn topics_per_connection(&self) -> Vec<usize> {
        self.snapshot().await.iter().map(|c| c.topic_count()).collect()
    }

    /// Keys carried by each connection, by index
    pub async fn assignments(&self) -> Vec<(usize, Vec<TopicKey>)> {
        self.snapshot()
            .await
            .iter()
            .map(|c| (c.index(), c.topic_keys()))
            .collect()
    }

    pub async fn connection(&self, index: usize) -> Option<Arc<Connection>> {
        self.snapshot()
            .await
            .into_iter()
            .find(|c| c.index() == index)
    }
}

impl PoolInner {
    /// Recycled topics are placed ahead of `topics`
    async fn add_topics(self: &Arc<Self>, topics: Vec<Topic>) -> Result<()> {
        let mut placement = self.placement.lock().await;
        let Placement {
            connections,
            recycled,
        } = &mut *placement;

        let mut seen = HashSet::new();
        let mut pending: Vec<Topic> = std::mem::take(recycled)
            .into_iter()
            .chain(topics)
            .filter(|topic| seen.insert(topic.key().clone()))
            .filter(|topic| !connections.iter().any(|c| c.has_topic(topic.key())))
            .collect();
        if pending.is_empty() {
            return Ok(());
        }
        debug!("Placing {} topic(s)", pending.len());

        for connection in connections.iter() {
            if pending.is_empty() {
                break;
            }
            let (_, remaining) = connection.add_topics(pending);
            pending = remaining;
        }

        let config = &self.ctx.config;
        while !pending.is_empty() && connections.len() < config.max_connections {
            let index = self.free_index(connections);
            let connection = Arc::new(Connection::new(index, self.ctx.clone()));
            let (_, remaining) = connection.add_topics(pending);
            pending = remaining;
            if self.running.load(Ordering::SeqCst) {
                connection.start_nowait().await;
            }
            info!("Connection {} added to the pool", index);
            connections.push(connection);
            connections.sort_by_key(|c| c.index());
        }

        if pending.is_empty() {
            return Ok(());
        }
        let err = PoolError::CapacityExceeded {
            unplaced: pending.len(),
            limit: config.max_topics(),
        };
        warn!("{}", err);
        Err(err)
    }

    /// Smallest index used neither by a live nor by a retiring connection
    fn free_index(&self, connections: &[Arc<Connection>]) -> usize {
        let retiring = lock(&self.retiring);
        let used: HashSet<usize> = connections
            .iter()
            .map(|c| c.index())
            .chain(retiring.iter().copied())
            .collect();
        (0..).find(|i| !used.contains(i)).unwrap_or(used.len())
    }

    async fn remove_topics(self: &Arc<Self>, keys: HashSet<TopicKey>) {
        if keys.is_empty() {
            return;
        }
        let mut placement = self.placement.lock().await;
        let Placement {
            connections,
            recycled,
        } = &mut *placement;

        recycled.retain(|topic| !keys.contains(topic.key()));
        for connection in connections.iter() {
            connection.remove_topics(&keys);
        }

        let carried: usize = connections.iter().map(|c| c.topic_count()).sum();
        let required = self.ctx.config.required_connections(carried + recycled.len());
        let mut retired = 0;

        while connections.len() > required {
            let Some(position) = connections
                .iter()
                .enumerate()
                .min_by_key(|(_, c)| (c.topic_count(), c.index()))
                .map(|(position, _)| position)
            else {
                break;
            };
            let connection = connections.remove(position);
            let index = connection.index();
            let drained = connection.drain_topics();
            retired += drained.len();
            recycled.extend(drained);
            lock(&self.retiring).insert(index);
            info!("Retiring connection {} ({} connection(s) needed)", index, required);

            let inner = Arc::clone(self);
            self.spawn_follow_up(async move {
                connection.stop(true).await;
                lock(&inner.retiring).remove(&index);
            });
        }

        if retired > 0 {
            debug!("Re-placing {} topic(s) from retired connections", retired);
            let inner = Arc::clone(self);
            self.spawn_follow_up(async move {
                if let Err(e) = inner.add_topics(Vec::new()).await {
                    error!("Failed to re-place topics: {}", e);
                }
            });
        }
    }

    /// Run `task` detached, counted until it finishes
    fn spawn_follow_up<F>(self: &Arc<Self>, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.outstanding.send_modify(|n| *n += 1);
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = tokio::spawn(task).await
                && e.is_panic()
            {
                error!("Pool follow-up task panicked: {}", e);
            }
            inner.outstanding.send_modify(|n| *n -= 1);
        });
    }
}
