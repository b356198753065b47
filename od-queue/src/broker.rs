use crate::error::{QueueError, Result};
use crate::job::{DeliveryJob, JobId};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub pending: usize,
    pub leased: usize,
    pub dead: usize,
}

/// Durable at-least-once job broker.
///
/// `lease` hands a job to exactly one worker for a bounded time; a worker
/// that dies mid-job simply lets the lease lapse and the job becomes
/// available again. `ack` deletes, `nack` reschedules with a delay, and
/// `park` moves a job to the dead state for operator inspection.
#[async_trait]
pub trait QueueBroker: Send + Sync {
    async fn enqueue(&self, job: DeliveryJob) -> Result<()>;

    /// Lease up to `limit` available jobs for `lease_for`. Each returned
    /// job has its attempt counter already incremented.
    async fn lease(&self, limit: usize, lease_for: Duration) -> Result<Vec<DeliveryJob>>;

    async fn ack(&self, job_id: &JobId) -> Result<()>;

    async fn nack(&self, job_id: &JobId, retry_after: Duration) -> Result<()>;

    async fn park(&self, job_id: &JobId, detail: &str) -> Result<()>;

    async fn counts(&self) -> Result<QueueCounts>;
}

/// SQLite-backed broker. Same access pattern as the channel store: a
/// short-lived connection per call inside `spawn_blocking`, with leases
/// taken under `BEGIN IMMEDIATE` so two workers cannot claim the same job.
#[derive(Clone)]
pub struct SqliteBroker {
    path: PathBuf,
}

impl SqliteBroker {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let broker = Self {
            path: path.as_ref().to_path_buf(),
        };
        let path = broker.path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&path)?;
            ensure_schema(&conn)
        })
        .await??;
        Ok(broker)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn with_conn<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = open_connection(&path)?;
            work(&mut conn)
        })
        .await?
    }
}

fn open_connection(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| QueueError::Broker(format!("create broker dir: {e}")))?;
    }
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.pragma_update(None, "journal_mode", "wal")?;
    Ok(conn)
}

fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS delivery_jobs (
    id TEXT PRIMARY KEY,
    channel_id TEXT NOT NULL,
    payload TEXT NOT NULL,
    state TEXT NOT NULL DEFAULT 'pending',
    attempts INTEGER NOT NULL DEFAULT 0,
    available_at TEXT NOT NULL,
    leased_until TEXT,
    detail TEXT,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_delivery_jobs_ready
    ON delivery_jobs (state, available_at);
"#,
    )?;
    Ok(())
}

fn require_row(job_id: &JobId, changed: usize) -> Result<()> {
    if changed == 0 {
        return Err(QueueError::JobNotFound(job_id.to_string()));
    }
    Ok(())
}

#[async_trait]
impl QueueBroker for SqliteBroker {
    async fn enqueue(&self, job: DeliveryJob) -> Result<()> {
        let payload = serde_json::to_string(&job)?;
        self.with_conn(move |conn| {
            conn.execute(
                r#"
INSERT INTO delivery_jobs (id, channel_id, payload, state, attempts, available_at)
VALUES (?1, ?2, ?3, 'pending', ?4, ?5)
"#,
                params![
                    job.id.as_str(),
                    job.channel_id.as_str(),
                    payload,
                    job.attempts_made as i64,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn lease(&self, limit: usize, lease_for: Duration) -> Result<Vec<DeliveryJob>> {
        let lease_for = ChronoDuration::from_std(lease_for)
            .map_err(|e| QueueError::Broker(format!("lease duration out of range: {e}")))?;
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now = Utc::now();
            let now_raw = now.to_rfc3339();

            let candidates: Vec<(String, String, i64)> = {
                let mut stmt = tx.prepare(
                    r#"
SELECT id, payload, attempts FROM delivery_jobs
 WHERE state = 'pending'
   AND available_at <= ?1
   AND (leased_until IS NULL OR leased_until <= ?1)
 ORDER BY available_at
 LIMIT ?2
"#,
                )?;
                let rows = stmt.query_map(params![now_raw, limit as i64], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                out
            };

            let leased_until = (now + lease_for).to_rfc3339();
            let mut jobs = Vec::with_capacity(candidates.len());
            for (id, payload, attempts) in candidates {
                let mut job: DeliveryJob = serde_json::from_str(&payload)?;
                job.attempts_made = (attempts.max(0) as u32).saturating_add(1);
                tx.execute(
                    "UPDATE delivery_jobs SET attempts = ?2, leased_until = ?3 WHERE id = ?1",
                    params![id, job.attempts_made as i64, leased_until],
                )?;
                jobs.push(job);
            }
            tx.commit()?;
            Ok(jobs)
        })
        .await
    }

    async fn ack(&self, job_id: &JobId) -> Result<()> {
        let job_id = job_id.clone();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "DELETE FROM delivery_jobs WHERE id = ?1",
                params![job_id.as_str()],
            )?;
            require_row(&job_id, changed)
        })
        .await
    }

    async fn nack(&self, job_id: &JobId, retry_after: Duration) -> Result<()> {
        let job_id = job_id.clone();
        let retry_after = ChronoDuration::from_std(retry_after)
            .map_err(|e| QueueError::Broker(format!("retry delay out of range: {e}")))?;
        self.with_conn(move |conn| {
            let available_at = (Utc::now() + retry_after).to_rfc3339();
            let changed = conn.execute(
                r#"
UPDATE delivery_jobs
   SET leased_until = NULL,
       available_at = ?2
 WHERE id = ?1 AND state = 'pending'
"#,
                params![job_id.as_str(), available_at],
            )?;
            require_row(&job_id, changed)
        })
        .await
    }

    async fn park(&self, job_id: &JobId, detail: &str) -> Result<()> {
        let job_id = job_id.clone();
        let detail = detail.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                r#"
UPDATE delivery_jobs
   SET state = 'dead',
       leased_until = NULL,
       detail = ?2
 WHERE id = ?1
"#,
                params![job_id.as_str(), detail],
            )?;
            require_row(&job_id, changed)
        })
        .await
    }

    async fn counts(&self) -> Result<QueueCounts> {
        self.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            let leased: i64 = conn.query_row(
                "SELECT COUNT(*) FROM delivery_jobs
                  WHERE state = 'pending' AND leased_until IS NOT NULL AND leased_until > ?1",
                params![now],
                |row| row.get(0),
            )?;
            let pending: i64 = conn.query_row(
                "SELECT COUNT(*) FROM delivery_jobs
                  WHERE state = 'pending' AND (leased_until IS NULL OR leased_until <= ?1)",
                params![now],
                |row| row.get(0),
            )?;
            let dead: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM delivery_jobs WHERE state = 'dead'",
                    [],
                    |row| row.get(0),
                )
                .optional()?
                .unwrap_or(0);
            Ok(QueueCounts {
                pending: pending.max(0) as usize,
                leased: leased.max(0) as usize,
                dead: dead.max(0) as usize,
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::{QueueBroker, SqliteBroker};
    use crate::error::QueueError;
    use crate::job::{DeliveryJob, JobTarget};
    use od_channels::OutboundContent;
    use std::time::Duration;

    async fn temp_broker() -> SqliteBroker {
        let path = std::env::temp_dir()
            .join(format!("opendesk-broker-{}", uuid::Uuid::new_v4()))
            .join("queue.db");
        SqliteBroker::open(path).await.expect("open broker")
    }

    fn job(channel: &str) -> DeliveryJob {
        DeliveryJob::new(
            channel.into(),
            JobTarget::Ticket {
                ticket_id: "t-1".into(),
            },
            "contact-1",
            OutboundContent::Text {
                body: "hello".to_string(),
            },
        )
    }

    #[tokio::test]
    async fn leased_jobs_are_invisible_until_the_lease_lapses() {
        let broker = temp_broker().await;
        broker.enqueue(job("ch-1")).await.expect("enqueue");

        let leased = broker
            .lease(10, Duration::from_secs(60))
            .await
            .expect("lease");
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].attempts_made, 1);

        let again = broker
            .lease(10, Duration::from_secs(60))
            .await
            .expect("second lease");
        assert!(again.is_empty(), "a leased job must not be handed out twice");
    }

    #[tokio::test]
    async fn lapsed_lease_makes_the_job_available_again() {
        let broker = temp_broker().await;
        broker.enqueue(job("ch-1")).await.expect("enqueue");

        let first = broker
            .lease(10, Duration::from_millis(20))
            .await
            .expect("lease");
        assert_eq!(first.len(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = broker
            .lease(10, Duration::from_secs(60))
            .await
            .expect("re-lease");
        assert_eq!(second.len(), 1, "at-least-once: lapsed lease is retried");
        assert_eq!(second[0].attempts_made, 2);
    }

    #[tokio::test]
    async fn ack_deletes_and_nack_delays() {
        let broker = temp_broker().await;
        let first = job("ch-1");
        let second = job("ch-1");
        broker.enqueue(first.clone()).await.expect("enqueue first");
        broker.enqueue(second.clone()).await.expect("enqueue second");

        let leased = broker
            .lease(10, Duration::from_secs(60))
            .await
            .expect("lease");
        assert_eq!(leased.len(), 2);

        broker.ack(&first.id).await.expect("ack");
        broker
            .nack(&second.id, Duration::from_millis(40))
            .await
            .expect("nack");

        let immediately = broker
            .lease(10, Duration::from_secs(60))
            .await
            .expect("lease during delay");
        assert!(immediately.is_empty(), "nacked job must wait out its delay");

        tokio::time::sleep(Duration::from_millis(80)).await;
        let after_delay = broker
            .lease(10, Duration::from_secs(60))
            .await
            .expect("lease after delay");
        assert_eq!(after_delay.len(), 1);
        assert_eq!(after_delay[0].id, second.id);
    }

    #[tokio::test]
    async fn parked_jobs_leave_the_pending_pool() {
        let broker = temp_broker().await;
        let dead = job("ch-1");
        broker.enqueue(dead.clone()).await.expect("enqueue");
        broker
            .lease(10, Duration::from_secs(60))
            .await
            .expect("lease");
        broker.park(&dead.id, "attempts exhausted").await.expect("park");

        let counts = broker.counts().await.expect("counts");
        assert_eq!(counts.dead, 1);
        assert_eq!(counts.pending, 0);
        let leased = broker
            .lease(10, Duration::from_secs(60))
            .await
            .expect("lease");
        assert!(leased.is_empty(), "dead jobs are never leased");
    }

    #[tokio::test]
    async fn acking_an_unknown_job_is_not_found() {
        let broker = temp_broker().await;
        let result = broker.ack(&"ghost".into()).await;
        assert!(matches!(result, Err(QueueError::JobNotFound(_))));
    }

    #[tokio::test]
    async fn counts_separate_pending_and_leased() {
        let broker = temp_broker().await;
        broker.enqueue(job("ch-1")).await.expect("enqueue");
        broker.enqueue(job("ch-2")).await.expect("enqueue");

        broker
            .lease(1, Duration::from_secs(60))
            .await
            .expect("lease one");
        let counts = broker.counts().await.expect("counts");
        assert_eq!(counts.leased, 1);
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.dead, 0);
    }
}
