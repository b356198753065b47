use crate::error::{Result, SessionError};
use crate::status::{ChannelPatch, ChannelRecord, ChannelStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use od_channels::{CampaignId, ChannelId, ContactId, MessageId};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Delivery bookkeeping written when a campaign send completes. Committed
/// atomically with the merged acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CampaignDelivery {
    pub message_id: MessageId,
    pub random: String,
    pub ack: i64,
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CampaignContactRecord {
    pub campaign_id: CampaignId,
    pub contact_id: ContactId,
    pub message_id: Option<MessageId>,
    pub message_random: Option<String>,
    pub ack: i64,
    pub body: Option<String>,
    pub delivered_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Sent,
    Error,
}

impl DeliveryOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Error => "error",
        }
    }
}

/// Durable channel and campaign state. The registry holds process truth;
/// this holds what survives a restart.
#[async_trait]
pub trait ChannelStore: Send + Sync {
    async fn load_channel(&self, id: &ChannelId) -> Result<Option<ChannelRecord>>;

    async fn list_active_channels(&self) -> Result<Vec<ChannelRecord>>;

    async fn upsert_channel(&self, record: &ChannelRecord) -> Result<()>;

    /// Apply a partial update and return the record as persisted.
    async fn save_channel(&self, id: &ChannelId, patch: ChannelPatch) -> Result<ChannelRecord>;

    async fn load_campaign_contact(
        &self,
        campaign_id: &CampaignId,
        contact_id: &ContactId,
    ) -> Result<Option<CampaignContactRecord>>;

    /// Merge a delivery acknowledgment into the campaign contact row inside
    /// a write transaction. The stored ack becomes
    /// `max(existing, delivery.ack)`; message id, nonce, body, and timestamp
    /// commit together with it or not at all.
    async fn merge_campaign_ack(
        &self,
        campaign_id: &CampaignId,
        contact_id: &ContactId,
        delivery: CampaignDelivery,
    ) -> Result<CampaignContactRecord>;

    /// Write back the outcome of a delivery attempt.
    async fn record_delivery(
        &self,
        message_ref: &str,
        outcome: DeliveryOutcome,
        detail: Option<&str>,
    ) -> Result<()>;
}

/// SQLite-backed store. Every call opens a short-lived connection inside
/// `spawn_blocking`; write transactions use `BEGIN IMMEDIATE` so concurrent
/// ack merges for the same row serialize instead of interleaving.
#[derive(Clone)]
pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
        };
        let path = store.path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&path)?;
            ensure_schema(&conn)
        })
        .await??;
        Ok(store)
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
            .map_err(|e| SessionError::Store(format!("create store dir: {e}")))?;
    }
    let conn = Connection::open(path)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    conn.pragma_update(None, "journal_mode", "wal")?;
    Ok(conn)
}

fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS channels (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    status TEXT NOT NULL,
    qr_payload TEXT,
    session_blob TEXT,
    retries INTEGER NOT NULL DEFAULT 0,
    is_active INTEGER NOT NULL DEFAULT 1,
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS campaign_contacts (
    campaign_id TEXT NOT NULL,
    contact_id TEXT NOT NULL,
    message_id TEXT,
    message_random TEXT,
    ack INTEGER NOT NULL DEFAULT 0,
    body TEXT,
    delivered_at TEXT,
    PRIMARY KEY (campaign_id, contact_id)
);

CREATE TABLE IF NOT EXISTS deliveries (
    message_ref TEXT PRIMARY KEY,
    outcome TEXT NOT NULL,
    detail TEXT,
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);
"#,
    )?;
    Ok(())
}

fn channel_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChannelRecord> {
    let kind: String = row.get("kind")?;
    let status: String = row.get("status")?;
    Ok(ChannelRecord {
        id: ChannelId::new(row.get::<_, String>("id")?),
        tenant_id: row.get::<_, String>("tenant_id")?.into(),
        kind: kind.parse().unwrap_or(od_channels::ChannelKind::Whatsapp),
        status: ChannelStatus::from_str(&status).unwrap_or(ChannelStatus::Disconnected),
        qr_payload: row.get("qr_payload")?,
        session_blob: row.get("session_blob")?,
        retries: row.get::<_, i64>("retries")?.max(0) as u32,
        is_active: row.get::<_, i64>("is_active")? != 0,
    })
}

fn campaign_contact_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CampaignContactRecord> {
    let delivered_at: Option<String> = row.get("delivered_at")?;
    Ok(CampaignContactRecord {
        campaign_id: row.get::<_, String>("campaign_id")?.into(),
        contact_id: row.get::<_, String>("contact_id")?.into(),
        message_id: row
            .get::<_, Option<String>>("message_id")?
            .map(MessageId::new),
        message_random: row.get("message_random")?,
        ack: row.get("ack")?,
        body: row.get("body")?,
        delivered_at: delivered_at
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|parsed| parsed.with_timezone(&Utc)),
    })
}

#[async_trait]
impl ChannelStore for SqliteStore {
    async fn load_channel(&self, id: &ChannelId) -> Result<Option<ChannelRecord>> {
        let id = id.clone();
        self.with_conn(move |conn| {
            let record = conn
                .query_row(
                    "SELECT * FROM channels WHERE id = ?1",
                    params![id.as_str()],
                    channel_from_row,
                )
                .optional()?;
            Ok(record)
        })
        .await
    }

    async fn list_active_channels(&self) -> Result<Vec<ChannelRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM channels WHERE is_active = 1 ORDER BY id")?;
            let rows = stmt.query_map([], channel_from_row)?;
            let mut records = Vec::new();
            for row in rows {
                records.push(row?);
            }
            Ok(records)
        })
        .await
    }

    async fn upsert_channel(&self, record: &ChannelRecord) -> Result<()> {
        let record = record.clone();
        self.with_conn(move |conn| {
            conn.execute(
                r#"
INSERT INTO channels (id, tenant_id, kind, status, qr_payload, session_blob, retries, is_active, updated_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, CURRENT_TIMESTAMP)
ON CONFLICT(id) DO UPDATE
SET tenant_id = excluded.tenant_id,
    kind = excluded.kind,
    status = excluded.status,
    qr_payload = excluded.qr_payload,
    session_blob = excluded.session_blob,
    retries = excluded.retries,
    is_active = excluded.is_active,
    updated_at = CURRENT_TIMESTAMP
"#,
                params![
                    record.id.as_str(),
                    record.tenant_id.as_str(),
                    record.kind.as_str(),
                    record.status.as_str(),
                    record.qr_payload,
                    record.session_blob,
                    record.retries as i64,
                    record.is_active as i64,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn save_channel(&self, id: &ChannelId, patch: ChannelPatch) -> Result<ChannelRecord> {
        let id = id.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut record = tx
                .query_row(
                    "SELECT * FROM channels WHERE id = ?1",
                    params![id.as_str()],
                    channel_from_row,
                )
                .optional()?
                .ok_or_else(|| SessionError::ChannelNotFound(id.clone()))?;

            patch.apply(&mut record);
            tx.execute(
                r#"
UPDATE channels
   SET status = ?2,
       qr_payload = ?3,
       session_blob = ?4,
       retries = ?5,
       is_active = ?6,
       updated_at = CURRENT_TIMESTAMP
 WHERE id = ?1
"#,
                params![
                    record.id.as_str(),
                    record.status.as_str(),
                    record.qr_payload,
                    record.session_blob,
                    record.retries as i64,
                    record.is_active as i64,
                ],
            )?;
            tx.commit()?;
            Ok(record)
        })
        .await
    }

    async fn load_campaign_contact(
        &self,
        campaign_id: &CampaignId,
        contact_id: &ContactId,
    ) -> Result<Option<CampaignContactRecord>> {
        let campaign_id = campaign_id.clone();
        let contact_id = contact_id.clone();
        self.with_conn(move |conn| {
            let record = conn
                .query_row(
                    "SELECT * FROM campaign_contacts WHERE campaign_id = ?1 AND contact_id = ?2",
                    params![campaign_id.as_str(), contact_id.as_str()],
                    campaign_contact_from_row,
                )
                .optional()?;
            Ok(record)
        })
        .await
    }

    async fn merge_campaign_ack(
        &self,
        campaign_id: &CampaignId,
        contact_id: &ContactId,
        delivery: CampaignDelivery,
    ) -> Result<CampaignContactRecord> {
        let campaign_id = campaign_id.clone();
        let contact_id = contact_id.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let existing_ack: Option<i64> = tx
                .query_row(
                    "SELECT ack FROM campaign_contacts WHERE campaign_id = ?1 AND contact_id = ?2",
                    params![campaign_id.as_str(), contact_id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;

            // Commutative merge: a late, lower ack can never regress the row.
            let merged_ack = existing_ack.unwrap_or(0).max(delivery.ack);
            tx.execute(
                r#"
INSERT INTO campaign_contacts (campaign_id, contact_id, message_id, message_random, ack, body, delivered_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
ON CONFLICT(campaign_id, contact_id) DO UPDATE
SET message_id = excluded.message_id,
    message_random = excluded.message_random,
    ack = excluded.ack,
    body = excluded.body,
    delivered_at = excluded.delivered_at
"#,
                params![
                    campaign_id.as_str(),
                    contact_id.as_str(),
                    delivery.message_id.as_str(),
                    delivery.random,
                    merged_ack,
                    delivery.body,
                    delivery.timestamp.to_rfc3339(),
                ],
            )?;
            let record = tx.query_row(
                "SELECT * FROM campaign_contacts WHERE campaign_id = ?1 AND contact_id = ?2",
                params![campaign_id.as_str(), contact_id.as_str()],
                campaign_contact_from_row,
            )?;
            tx.commit()?;
            Ok(record)
        })
        .await
    }

    async fn record_delivery(
        &self,
        message_ref: &str,
        outcome: DeliveryOutcome,
        detail: Option<&str>,
    ) -> Result<()> {
        let message_ref = message_ref.to_string();
        let detail = detail.map(ToOwned::to_owned);
        self.with_conn(move |conn| {
            conn.execute(
                r#"
INSERT INTO deliveries (message_ref, outcome, detail, updated_at)
VALUES (?1, ?2, ?3, CURRENT_TIMESTAMP)
ON CONFLICT(message_ref) DO UPDATE
SET outcome = excluded.outcome,
    detail = excluded.detail,
    updated_at = CURRENT_TIMESTAMP
"#,
                params![message_ref, outcome.as_str(), detail],
            )?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::{
        CampaignDelivery, ChannelStore, DeliveryOutcome, SqliteStore,
    };
    use crate::error::SessionError;
    use crate::status::{ChannelPatch, ChannelRecord, ChannelStatus};
    use chrono::Utc;
    use od_channels::{CampaignId, ChannelKind, ContactId};
    use std::sync::Arc;

    async fn temp_store() -> SqliteStore {
        let path = std::env::temp_dir()
            .join(format!("opendesk-store-{}", uuid::Uuid::new_v4()))
            .join("desk.db");
        SqliteStore::open(path).await.expect("open sqlite store")
    }

    fn channel(id: &str) -> ChannelRecord {
        ChannelRecord {
            id: id.into(),
            tenant_id: "tenant-1".into(),
            kind: ChannelKind::Whatsapp,
            status: ChannelStatus::Disconnected,
            qr_payload: None,
            session_blob: None,
            retries: 0,
            is_active: true,
        }
    }

    fn delivery(ack: i64) -> CampaignDelivery {
        CampaignDelivery {
            message_id: format!("msg-{ack}").into(),
            random: format!("rand-{ack}"),
            ack,
            body: "campaign body".to_string(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn upsert_load_and_patch_round_trip() {
        let store = temp_store().await;
        store.upsert_channel(&channel("ch-1")).await.expect("upsert");

        let loaded = store
            .load_channel(&"ch-1".into())
            .await
            .expect("load")
            .expect("channel exists");
        assert_eq!(loaded, channel("ch-1"));

        let patched = store
            .save_channel(
                &"ch-1".into(),
                ChannelPatch::new()
                    .with_status(ChannelStatus::Qrcode)
                    .with_qr_payload("qr-data")
                    .with_retries(3),
            )
            .await
            .expect("patch");
        assert_eq!(patched.status, ChannelStatus::Qrcode);
        assert_eq!(patched.qr_payload.as_deref(), Some("qr-data"));
        assert_eq!(patched.retries, 3);

        let reloaded = store
            .load_channel(&"ch-1".into())
            .await
            .expect("reload")
            .expect("channel exists");
        assert_eq!(reloaded, patched, "save_channel returns what it persisted");
    }

    #[tokio::test]
    async fn save_channel_on_missing_row_is_not_found() {
        let store = temp_store().await;
        let result = store
            .save_channel(&"ghost".into(), ChannelPatch::new())
            .await;
        assert!(matches!(result, Err(SessionError::ChannelNotFound(_))));
    }

    #[tokio::test]
    async fn list_active_skips_inactive_channels() {
        let store = temp_store().await;
        store.upsert_channel(&channel("ch-1")).await.expect("upsert");
        let mut inactive = channel("ch-2");
        inactive.is_active = false;
        store.upsert_channel(&inactive).await.expect("upsert");

        let active = store.list_active_channels().await.expect("list");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id.as_str(), "ch-1");
    }

    #[tokio::test]
    async fn ack_merge_never_regresses() {
        let store = temp_store().await;
        let campaign = CampaignId::from("cmp-7");
        let contact = ContactId::from("ct-99");

        // Acks 1 then 0 arriving in reverse order: the row must stay at 1.
        let merged = store
            .merge_campaign_ack(&campaign, &contact, delivery(1))
            .await
            .expect("merge ack 1");
        assert_eq!(merged.ack, 1);

        let merged = store
            .merge_campaign_ack(&campaign, &contact, delivery(0))
            .await
            .expect("merge stale ack 0");
        assert_eq!(merged.ack, 1, "stale lower ack must not regress the row");

        let merged = store
            .merge_campaign_ack(&campaign, &contact, delivery(3))
            .await
            .expect("merge ack 3");
        assert_eq!(merged.ack, 3);
    }

    #[tokio::test]
    async fn ack_merge_is_max_over_any_interleaving() {
        let store = Arc::new(temp_store().await);
        let campaign = CampaignId::from("cmp-1");
        let contact = ContactId::from("ct-1");

        let mut tasks = Vec::new();
        for ack in [2_i64, 0, 3, 1, 2] {
            let store = store.clone();
            let campaign = campaign.clone();
            let contact = contact.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .merge_campaign_ack(&campaign, &contact, delivery(ack))
                    .await
            }));
        }
        for task in tasks {
            task.await.expect("join").expect("merge");
        }

        let record = store
            .load_campaign_contact(&campaign, &contact)
            .await
            .expect("load")
            .expect("row exists");
        assert_eq!(record.ack, 3, "final ack equals the max of all candidates");
        assert!(record.message_id.is_some());
        assert!(record.delivered_at.is_some());
    }

    #[tokio::test]
    async fn delivery_outcomes_upsert() {
        let store = temp_store().await;
        store
            .record_delivery("msg-1", DeliveryOutcome::Error, Some("boom"))
            .await
            .expect("record error");
        store
            .record_delivery("msg-1", DeliveryOutcome::Sent, None)
            .await
            .expect("record sent");
    }
}
