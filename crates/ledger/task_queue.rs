use bytes::{BufMut, Bytes};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use taskmesh_scale::{
    structs::{Decoder, Encoder},
    ScaleDecode, ScaleDecodeError, ScaleEncode,
};
use taskmesh_storage::KvStore;
use tracing::{debug, info};

use crate::error::QueueError;

/// A unit of off-chain compute work.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Task {
    pub ipfs_block_id: String,
    pub params: Bytes,
}

/// A partition of a task, claimed and processed by a single worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubTask {
    pub subtask_id: String,
    pub chunks_to_process: Vec<String>,
    pub owner_peer: String,
}

/// Time-bounded claim on a task; stale locks may be stolen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskLock {
    pub task_id: String,
    /// Milliseconds since the unix epoch.
    pub lock_timestamp: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskResult {
    pub subtask_results: Vec<Bytes>,
}

impl ScaleEncode for Task {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.ipfs_block_id)
            .encode_field(&self.params)
            .finish();
    }
}

impl ScaleDecode for Task {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), ScaleDecodeError> {
        let decoder = Decoder::new(buf);
        let (ipfs_block_id, decoder) = decoder.decode_field("ipfs_block_id")?;
        let (params, decoder) = decoder.decode_field("params")?;
        Ok((
            Self {
                ipfs_block_id,
                params,
            },
            decoder.finish(),
        ))
    }
}

impl ScaleEncode for SubTask {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.subtask_id)
            .encode_field(&self.chunks_to_process)
            .encode_field(&self.owner_peer)
            .finish();
    }
}

impl ScaleDecode for SubTask {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), ScaleDecodeError> {
        let decoder = Decoder::new(buf);
        let (subtask_id, decoder) = decoder.decode_field("subtask_id")?;
        let (chunks_to_process, decoder) = decoder.decode_field("chunks_to_process")?;
        let (owner_peer, decoder) = decoder.decode_field("owner_peer")?;
        Ok((
            Self {
                subtask_id,
                chunks_to_process,
                owner_peer,
            },
            decoder.finish(),
        ))
    }
}

impl ScaleEncode for TaskLock {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.task_id)
            .encode_field(&self.lock_timestamp)
            .finish();
    }
}

impl ScaleDecode for TaskLock {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), ScaleDecodeError> {
        let decoder = Decoder::new(buf);
        let (task_id, decoder) = decoder.decode_field("task_id")?;
        let (lock_timestamp, decoder) = decoder.decode_field("lock_timestamp")?;
        Ok((
            Self {
                task_id,
                lock_timestamp,
            },
            decoder.finish(),
        ))
    }
}

impl ScaleEncode for TaskResult {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.subtask_results)
            .finish();
    }
}

impl ScaleDecode for TaskResult {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), ScaleDecodeError> {
        let decoder = Decoder::new(buf);
        let (subtask_results, decoder) = decoder.decode_field("subtask_results")?;
        Ok((Self { subtask_results }, decoder.finish()))
    }
}

/// Distributed task queue over the replicated KV store.
///
/// At-most-one-worker is best effort: the lock write is last-writer-wins, so
/// a steal may race. The completion write is the arbiter: the first result
/// under `task_results/` is canonical and later completions are rejected.
pub struct ProcessingTaskQueue {
    db: Arc<dyn KvStore>,
    processing_timeout: Duration,
}

impl ProcessingTaskQueue {
    pub const DEFAULT_PROCESSING_TIMEOUT: Duration = Duration::from_secs(5 * 60);

    pub fn new(db: Arc<dyn KvStore>, processing_timeout: Duration) -> Self {
        Self {
            db,
            processing_timeout,
        }
    }

    pub fn enqueue_task(&self, task: &Task, subtasks: &[SubTask]) -> Result<(), QueueError> {
        let task_key = task_key(&task.ipfs_block_id);
        self.db.put(task_key.as_bytes(), &task.encode_to_vec())?;
        debug!(task = %task.ipfs_block_id, "task placed in the queue");
        for subtask in subtasks {
            let subtask_key = format!(
                "subtasks/TASK_{}/{}",
                task.ipfs_block_id, subtask.subtask_id
            );
            self.db
                .put(subtask_key.as_bytes(), &subtask.encode_to_vec())?;
        }
        Ok(())
    }

    pub fn get_subtasks(&self, task_id: &str) -> Result<Vec<SubTask>, QueueError> {
        let prefix = format!("subtasks/TASK_{task_id}");
        let mut subtasks = Vec::new();
        for (_, value) in self.db.query_prefix(prefix.as_bytes())? {
            subtasks.push(SubTask::decode(&value)?);
        }
        Ok(subtasks)
    }

    /// Claims the first claimable task: not completed, and either unlocked
    /// or holding a lock older than the processing timeout. Stealing an
    /// expired lock rewrites it with a fresh timestamp.
    pub fn grab_task(&self) -> Result<Option<(String, Task)>, QueueError> {
        let mut locked_tasks = Vec::new();
        for (key, value) in self.db.query_prefix(b"tasks/")? {
            let Ok(task_key) = String::from_utf8(key) else {
                continue;
            };
            if self.db.contains(result_key_of(&task_key).as_bytes())? {
                continue;
            }
            if self.db.contains(lock_key_of(&task_key).as_bytes())? {
                debug!(task = %task_key, "task previously locked");
                locked_tasks.push(task_key);
                continue;
            }
            let task = Task::decode(&value)?;
            self.lock_task(&task_key)?;
            info!(task = %task.ipfs_block_id, "task grabbed");
            return Ok(Some((task.ipfs_block_id.clone(), task)));
        }
        for task_key in locked_tasks {
            if let Some(task) = self.move_expired_task_lock(&task_key)? {
                info!(task = %task.ipfs_block_id, "expired lock stolen");
                return Ok(Some((task.ipfs_block_id.clone(), task)));
            }
        }
        Ok(None)
    }

    /// Publishes the result and releases the lock. The first writer wins:
    /// a completion against an already-recorded result is rejected.
    pub fn complete_task(&self, task_id: &str, result: &TaskResult) -> Result<(), QueueError> {
        let task_key = task_key(task_id);
        let result_key = result_key_of(&task_key);
        if self.db.contains(result_key.as_bytes())? {
            return Err(QueueError::AlreadyCompleted(task_id.to_string()));
        }
        self.db.put(result_key.as_bytes(), &result.encode_to_vec())?;
        self.db.remove(lock_key_of(&task_key).as_bytes())?;
        info!(task = %task_id, "task completed");
        Ok(())
    }

    pub fn is_task_completed(&self, task_id: &str) -> Result<bool, QueueError> {
        Ok(self
            .db
            .contains(result_key_of(&task_key(task_id)).as_bytes())?)
    }

    pub fn is_task_locked(&self, task_id: &str) -> Result<bool, QueueError> {
        Ok(self.db.contains(lock_key_of(&task_key(task_id)).as_bytes())?)
    }

    pub fn get_task_result(&self, task_id: &str) -> Result<Option<TaskResult>, QueueError> {
        match self.db.get(result_key_of(&task_key(task_id)).as_bytes())? {
            Some(raw) => Ok(Some(TaskResult::decode(&raw)?)),
            None => Ok(None),
        }
    }

    fn lock_task(&self, task_key: &str) -> Result<(), QueueError> {
        let lock = TaskLock {
            task_id: task_key.to_string(),
            lock_timestamp: now_millis()?,
        };
        self.db
            .put(lock_key_of(task_key).as_bytes(), &lock.encode_to_vec())?;
        Ok(())
    }

    fn move_expired_task_lock(&self, task_key: &str) -> Result<Option<Task>, QueueError> {
        let Some(raw_lock) = self.db.get(lock_key_of(task_key).as_bytes())? else {
            return Ok(None);
        };
        let lock = TaskLock::decode(&raw_lock)?;
        let expires_at = lock.lock_timestamp + self.processing_timeout.as_millis() as u64;
        if now_millis()? <= expires_at {
            return Ok(None);
        }
        let Some(raw_task) = self.db.get(task_key.as_bytes())? else {
            debug!(task = %task_key, "locked task vanished");
            return Ok(None);
        };
        let task = Task::decode(&raw_task)?;
        self.lock_task(task_key)?;
        Ok(Some(task))
    }
}

fn task_key(task_id: &str) -> String {
    format!("tasks/TASK_{task_id}")
}

fn lock_key_of(task_key: &str) -> String {
    format!("lock_{task_key}")
}

fn result_key_of(task_key: &str) -> String {
    format!("task_results/{task_key}")
}

fn now_millis() -> Result<u64, QueueError> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .map_err(|_| QueueError::ClockSkew)
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskmesh_storage::InMemoryKvStore;

    fn queue(timeout: Duration) -> ProcessingTaskQueue {
        ProcessingTaskQueue::new(Arc::new(InMemoryKvStore::new()), timeout)
    }

    fn task(id: &str) -> Task {
        Task {
            ipfs_block_id: id.to_string(),
            params: Bytes::from_static(b"params"),
        }
    }

    fn subtask(id: &str) -> SubTask {
        SubTask {
            subtask_id: id.to_string(),
            chunks_to_process: vec!["chunk0".into(), "chunk1".into()],
            owner_peer: "peer".into(),
        }
    }

    #[test]
    fn keys_follow_the_queue_layout() {
        assert_eq!(task_key("T"), "tasks/TASK_T");
        assert_eq!(lock_key_of("tasks/TASK_T"), "lock_tasks/TASK_T");
        assert_eq!(result_key_of("tasks/TASK_T"), "task_results/tasks/TASK_T");
    }

    #[test]
    fn enqueue_then_list_subtasks() {
        let queue = queue(Duration::from_secs(60));
        queue
            .enqueue_task(&task("T1"), &[subtask("s0"), subtask("s1")])
            .expect("enqueue");
        let subtasks = queue.get_subtasks("T1").expect("query");
        assert_eq!(subtasks.len(), 2);
        assert_eq!(subtasks[0].subtask_id, "s0");
        assert!(queue.get_subtasks("T2").expect("query").is_empty());
    }

    #[test]
    fn grab_locks_the_task_against_other_workers() {
        let queue = queue(Duration::from_secs(60));
        queue.enqueue_task(&task("T1"), &[]).expect("enqueue");

        let grabbed = queue.grab_task().expect("grab").expect("task available");
        assert_eq!(grabbed.0, "T1");
        assert!(queue.is_task_locked("T1").expect("query"));

        // a second worker finds nothing while the lock is fresh
        assert!(queue.grab_task().expect("grab").is_none());
    }

    #[test]
    fn expired_locks_are_stolen_with_a_fresh_timestamp() {
        let queue = queue(Duration::from_millis(5));
        queue.enqueue_task(&task("T1"), &[]).expect("enqueue");
        queue.grab_task().expect("grab").expect("task available");

        let stale = TaskLock::decode(
            &queue
                .db
                .get(b"lock_tasks/TASK_T1")
                .expect("get")
                .expect("lock present"),
        )
        .expect("decode");

        std::thread::sleep(Duration::from_millis(10));
        let stolen = queue.grab_task().expect("grab").expect("steal");
        assert_eq!(stolen.0, "T1");
        let fresh = TaskLock::decode(
            &queue
                .db
                .get(b"lock_tasks/TASK_T1")
                .expect("get")
                .expect("lock present"),
        )
        .expect("decode");
        assert!(fresh.lock_timestamp > stale.lock_timestamp);
    }

    #[test]
    fn completion_is_first_writer_wins() {
        let queue = queue(Duration::from_millis(5));
        queue.enqueue_task(&task("T1"), &[]).expect("enqueue");
        queue.grab_task().expect("grab").expect("task available");

        // the slow worker's lock expires and another worker takes over
        std::thread::sleep(Duration::from_millis(10));
        queue.grab_task().expect("grab").expect("steal");

        let fast = TaskResult {
            subtask_results: vec![Bytes::from_static(b"w2")],
        };
        queue.complete_task("T1", &fast).expect("complete");

        // the original worker comes back late; its result is refused
        let late = TaskResult {
            subtask_results: vec![Bytes::from_static(b"w1")],
        };
        assert!(matches!(
            queue.complete_task("T1", &late),
            Err(QueueError::AlreadyCompleted(_))
        ));
        assert_eq!(queue.get_task_result("T1").expect("get"), Some(fast));
        assert!(!queue.is_task_locked("T1").expect("query"));
    }

    #[test]
    fn completed_tasks_are_not_grabbed_again() {
        let queue = queue(Duration::from_secs(60));
        queue.enqueue_task(&task("T1"), &[]).expect("enqueue");
        queue.enqueue_task(&task("T2"), &[]).expect("enqueue");

        let first = queue.grab_task().expect("grab").expect("task available");
        queue
            .complete_task(&first.0, &TaskResult::default())
            .expect("complete");

        let second = queue.grab_task().expect("grab").expect("task available");
        assert_ne!(second.0, first.0);
        assert!(queue.is_task_completed(&first.0).expect("query"));
    }
}
