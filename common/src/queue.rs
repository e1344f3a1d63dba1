use crate::errors::*;
use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Seconds a blocking pop waits on the server before it's reissued
const DEQUEUE_POLL_SECS: u64 = 5;

pub fn queue_name(group_id: u32) -> String {
    format!("buildfarm-group-{}", group_id)
}

/// FIFO of serialized job descriptors for one build group
#[async_trait]
pub trait TaskQueue: Send + Sync {
    fn name(&self) -> &str;

    async fn enqueue(&self, descriptor: &str) -> Result<()>;

    /// Wait until a descriptor is available and take it off the head of the queue
    async fn dequeue(&self) -> Result<String>;

    async fn length(&self) -> Result<usize>;

    /// Drop everything that is queued, returns the number of discarded descriptors
    async fn purge(&self) -> Result<usize>;
}

/// Hands out queue connections, one per consumer
#[async_trait]
pub trait QueueBackend: Send + Sync {
    async fn open(&self, group_id: u32) -> Result<Arc<dyn TaskQueue>>;
}

pub struct RedisBackend {
    client: redis::Client,
}

impl RedisBackend {
    pub fn new(url: &str) -> Result<RedisBackend> {
        let client = redis::Client::open(url)
            .with_context(|| anyhow!("Invalid task queue url: {:?}", url))?;
        Ok(RedisBackend { client })
    }
}

#[async_trait]
impl QueueBackend for RedisBackend {
    async fn open(&self, group_id: u32) -> Result<Arc<dyn TaskQueue>> {
        let name = queue_name(group_id);
        debug!("Connecting to task queue {:?}", name);
        // blocking pops stall every other command on a connection, so nothing is shared
        let conn = self.client.get_multiplexed_async_connection()
            .await
            .with_context(|| anyhow!("Could not connect to task queue {:?}, is redis running?", name))?;
        Ok(Arc::new(RedisQueue { name, conn }))
    }
}

pub struct RedisQueue {
    name: String,
    conn: redis::aio::MultiplexedConnection,
}

#[async_trait]
impl TaskQueue for RedisQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enqueue(&self, descriptor: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.rpush(&self.name, descriptor).await
            .with_context(|| anyhow!("Failed to push to task queue {:?}", self.name))?;
        Ok(())
    }

    async fn dequeue(&self) -> Result<String> {
        let mut conn = self.conn.clone();
        loop {
            let popped: Option<(String, String)> = redis::cmd("BLPOP")
                .arg(&self.name)
                .arg(DEQUEUE_POLL_SECS)
                .query_async(&mut conn)
                .await
                .with_context(|| anyhow!("Failed to pop from task queue {:?}", self.name))?;
            if let Some((_, descriptor)) = popped {
                return Ok(descriptor);
            }
            trace!("Nothing in task queue {:?} yet", self.name);
        }
    }

    async fn length(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        let len = conn.llen(&self.name).await?;
        Ok(len)
    }

    async fn purge(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        let len: usize = conn.llen(&self.name).await?;
        let _: () = conn.del(&self.name).await?;
        Ok(len)
    }
}

/// In-process queue, used for one-off builds and tests
pub struct MemoryQueue {
    name: String,
    items: Mutex<VecDeque<String>>,
    notify: Notify,
}

impl MemoryQueue {
    pub fn new<I: Into<String>>(name: I) -> MemoryQueue {
        MemoryQueue {
            name: name.into(),
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    fn items(&self) -> std::sync::MutexGuard<'_, VecDeque<String>> {
        self.items.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.items().iter().cloned().collect()
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enqueue(&self, descriptor: &str) -> Result<()> {
        self.items().push_back(descriptor.to_string());
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self) -> Result<String> {
        loop {
            let next = self.items().pop_front();
            if let Some(descriptor) = next {
                return Ok(descriptor);
            }
            self.notify.notified().await;
        }
    }

    async fn length(&self) -> Result<usize> {
        Ok(self.items().len())
    }

    async fn purge(&self) -> Result<usize> {
        let mut items = self.items();
        let len = items.len();
        items.clear();
        Ok(len)
    }
}
