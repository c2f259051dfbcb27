//! Per-user ordered task execution.
//!
//! A bounded pool of worker tasks, each draining a FIFO queue. Work for one
//! uid always lands on the same shard and runs to completion before the
//! next job on that shard starts, so events for a user execute in the order
//! they were enqueued without spawning a task per event. Cross-shard work
//! runs in parallel; no cross-uid ordering is promised.

use std::future::Future;
use std::hash::Hasher;
use std::pin::Pin;
use tokio::sync::mpsc;
use twox_hash::XxHash64;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

pub fn uid_hash(uid: &str) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(uid.as_bytes());
    hasher.finish()
}

pub struct ShardedWorkers {
    queues: Vec<mpsc::Sender<Job>>,
}

impl ShardedWorkers {
    /// Spawn `shards` worker tasks, each with a FIFO queue of
    /// `queue_capacity`. Must be called inside a tokio runtime.
    pub fn new(shards: usize, queue_capacity: usize) -> Self {
        let shards = shards.max(1);
        let queue_capacity = queue_capacity.max(1);
        let mut queues = Vec::with_capacity(shards);
        for shard in 0..shards {
            let (tx, mut rx) = mpsc::channel::<Job>(queue_capacity);
            tokio::spawn(async move {
                while let Some(job) = rx.recv().await {
                    job.await;
                }
                tracing::debug!(shard, "worker shard stopped");
            });
            queues.push(tx);
        }
        Self { queues }
    }

    pub fn shard_count(&self) -> usize {
        self.queues.len()
    }

    /// Enqueue work keyed by uid. Blocks when the shard queue is full;
    /// backpressure here is the bound on per-user fan-out.
    pub async fn dispatch_by_uid<F>(&self, uid: &str, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.dispatch(uid_hash(uid), job).await;
    }

    /// Enqueue work keyed by session id, used when a local session is in
    /// hand and ordering should follow the connection rather than the uid.
    pub async fn dispatch_by_session<F>(&self, session_id: i64, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.dispatch(session_id as u64, job).await;
    }

    async fn dispatch<F>(&self, key: u64, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let index = (key % self.queues.len() as u64) as usize;
        if self.queues[index].send(Box::pin(job)).await.is_err() {
            tracing::warn!(shard = index, "worker shard gone, job discarded");
        }
    }
}
