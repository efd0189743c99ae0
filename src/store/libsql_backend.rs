//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. A single connection is
//! reused for all operations; `libsql::Connection` is `Send + Sync` and
//! safe for concurrent async use.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::info;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::integrations::{Integration, IntegrationKind};
use crate::model::{
    Channel, Conversation, ConversationStatus, IntegrationBinding, Queue, TriageRule,
};
use crate::store::Database;
use crate::store::migrations;

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;
        info!(path = %path.display(), "Database opened");
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    // ── Provisioning helpers ────────────────────────────────────────
    //
    // The engine never creates topology; these stand in for the CRUD
    // layer of the outer application (and seed tests and the demo).

    pub async fn insert_conversation(
        &self,
        conversation: &Conversation,
    ) -> Result<(), DatabaseError> {
        self.write_conversation(conversation).await
    }

    pub async fn insert_channel(&self, channel: &Channel) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO channels
                 (id, tenant_id, name, default_integration_id, default_prompt_id,
                  greeting_message, max_bot_uses, bot_cooldown_minutes)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    channel.id.to_string(),
                    channel.tenant_id.to_string(),
                    channel.name.clone(),
                    channel.default_integration_id.map(|id| id.to_string()),
                    channel.default_prompt_id.map(|id| id.to_string()),
                    channel.greeting_message.clone(),
                    i64::from(channel.max_bot_uses),
                    i64::from(channel.bot_cooldown_minutes),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to insert channel: {e}")))?;
        Ok(())
    }

    pub async fn insert_queue(&self, queue: &Queue) -> Result<(), DatabaseError> {
        let schedule = serde_json::to_string(&queue.schedule)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let menu_options = serde_json::to_string(&queue.menu_options)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let media = queue
            .media
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        self.conn()
            .execute(
                "INSERT OR REPLACE INTO queues
                 (id, tenant_id, channel_id, name, position, integration_id, prompt_id,
                  greeting_message, out_of_hours_message, schedule, menu_options, media)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    queue.id.to_string(),
                    queue.tenant_id.to_string(),
                    queue.channel_id.to_string(),
                    queue.name.clone(),
                    i64::from(queue.position),
                    queue.integration_id.map(|id| id.to_string()),
                    queue.prompt_id.map(|id| id.to_string()),
                    queue.greeting_message.clone(),
                    queue.out_of_hours_message.clone(),
                    schedule,
                    menu_options,
                    media,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to insert queue: {e}")))?;
        Ok(())
    }

    pub async fn insert_integration(
        &self,
        integration: &Integration,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO integrations (id, tenant_id, name, kind, config)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    integration.id.to_string(),
                    integration.tenant_id.to_string(),
                    integration.name.clone(),
                    integration.kind.as_str(),
                    integration.config.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to insert integration: {e}")))?;
        Ok(())
    }

    pub async fn insert_rule(&self, rule: &TriageRule) -> Result<(), DatabaseError> {
        let tag_ids = serde_json::to_string(&rule.tag_ids)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO triage_rules
                 (id, tenant_id, channel_id, pattern, is_regex, priority, active,
                  assign_user_id, assign_queue_id, assign_channel_id, tag_ids, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    rule.id.to_string(),
                    rule.tenant_id.to_string(),
                    rule.channel_id.map(|id| id.to_string()),
                    rule.pattern.clone(),
                    rule.is_regex as i64,
                    i64::from(rule.priority),
                    rule.active as i64,
                    rule.assign_user_id.map(|id| id.to_string()),
                    rule.assign_queue_id.map(|id| id.to_string()),
                    rule.assign_channel_id.map(|id| id.to_string()),
                    tag_ids,
                    fmt_datetime(rule.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to insert rule: {e}")))?;
        Ok(())
    }

    pub async fn set_setting(
        &self,
        tenant_id: Uuid,
        key: &str,
        value: &str,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO settings (tenant_id, key, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT (tenant_id, key)
                 DO UPDATE SET value = ?3, updated_at = datetime('now')",
                params![tenant_id.to_string(), key, value],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to set setting: {e}")))?;
        Ok(())
    }

    async fn write_conversation(&self, conversation: &Conversation) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO conversations
                 (id, tenant_id, channel_id, contact_id, contact_address, status,
                  assigned_queue_id, assigned_user_id, is_group, integration_id,
                  integration_kind, prompt_id, in_bot_menu, bot_usage_count,
                  last_bot_activity_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                params![
                    conversation.id.to_string(),
                    conversation.tenant_id.to_string(),
                    conversation.channel_id.to_string(),
                    conversation.contact_id.to_string(),
                    conversation.contact_address.clone(),
                    conversation.status.as_str(),
                    conversation.assigned_queue_id.map(|id| id.to_string()),
                    conversation.assigned_user_id.map(|id| id.to_string()),
                    conversation.is_group as i64,
                    conversation
                        .integration
                        .map(|b| b.integration_id.to_string()),
                    conversation.integration.map(|b| b.kind.as_str()),
                    conversation.prompt_id.map(|id| id.to_string()),
                    conversation.in_bot_menu as i64,
                    i64::from(conversation.bot_usage_count),
                    conversation.last_bot_activity_at.map(fmt_datetime),
                    fmt_datetime(conversation.created_at),
                    fmt_datetime(Utc::now()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to write conversation: {e}")))?;
        Ok(())
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical datetime write format: fixed-width RFC 3339 UTC, so string
/// comparison in SQL agrees with chronological order.
fn fmt_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 datetime string from the DB.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("Bad uuid {s}: {e}")))
}

fn parse_optional_uuid(s: Option<String>) -> Result<Option<Uuid>, DatabaseError> {
    s.map(|s| parse_uuid(&s)).transpose()
}

fn row_to_conversation(row: &libsql::Row) -> Result<Conversation, DatabaseError> {
    let get_str = |i: i32| -> Result<String, DatabaseError> {
        row.get::<String>(i)
            .map_err(|e| DatabaseError::Query(format!("Bad conversation column {i}: {e}")))
    };
    let get_opt = |i: i32| -> Option<String> { row.get::<String>(i).ok() };
    let get_int = |i: i32| -> Result<i64, DatabaseError> {
        row.get::<i64>(i)
            .map_err(|e| DatabaseError::Query(format!("Bad conversation column {i}: {e}")))
    };

    let integration_id = parse_optional_uuid(get_opt(9))?;
    let integration_kind = get_opt(10).and_then(|s| IntegrationKind::parse(&s));
    let integration = match (integration_id, integration_kind) {
        (Some(integration_id), Some(kind)) => Some(IntegrationBinding {
            integration_id,
            kind,
        }),
        _ => None,
    };

    Ok(Conversation {
        id: parse_uuid(&get_str(0)?)?,
        tenant_id: parse_uuid(&get_str(1)?)?,
        channel_id: parse_uuid(&get_str(2)?)?,
        contact_id: parse_uuid(&get_str(3)?)?,
        contact_address: get_str(4)?,
        status: ConversationStatus::parse(&get_str(5)?),
        assigned_queue_id: parse_optional_uuid(get_opt(6))?,
        assigned_user_id: parse_optional_uuid(get_opt(7))?,
        is_group: get_int(8)? != 0,
        integration,
        prompt_id: parse_optional_uuid(get_opt(11))?,
        in_bot_menu: get_int(12)? != 0,
        bot_usage_count: get_int(13)?.max(0) as u32,
        last_bot_activity_at: get_opt(14).map(|s| parse_datetime(&s)),
        created_at: parse_datetime(&get_str(15)?),
        updated_at: parse_datetime(&get_str(16)?),
    })
}

const CONVERSATION_COLUMNS: &str = "id, tenant_id, channel_id, contact_id, contact_address, \
     status, assigned_queue_id, assigned_user_id, is_group, integration_id, integration_kind, \
     prompt_id, in_bot_menu, bot_usage_count, last_bot_activity_at, created_at, updated_at";

fn row_to_queue(row: &libsql::Row) -> Result<Queue, DatabaseError> {
    let get_str = |i: i32| -> Result<String, DatabaseError> {
        row.get::<String>(i)
            .map_err(|e| DatabaseError::Query(format!("Bad queue column {i}: {e}")))
    };
    let get_opt = |i: i32| -> Option<String> { row.get::<String>(i).ok() };
    let position: i64 = row
        .get(4)
        .map_err(|e| DatabaseError::Query(format!("Bad queue position: {e}")))?;

    let schedule = serde_json::from_str(&get_str(9)?)
        .map_err(|e| DatabaseError::Serialization(format!("Bad queue schedule: {e}")))?;
    let menu_options = serde_json::from_str(&get_str(10)?)
        .map_err(|e| DatabaseError::Serialization(format!("Bad queue menu options: {e}")))?;
    let media = get_opt(11)
        .map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| DatabaseError::Serialization(format!("Bad queue media: {e}")))?;

    Ok(Queue {
        id: parse_uuid(&get_str(0)?)?,
        tenant_id: parse_uuid(&get_str(1)?)?,
        channel_id: parse_uuid(&get_str(2)?)?,
        name: get_str(3)?,
        position: position.max(0) as u32,
        integration_id: parse_optional_uuid(get_opt(5))?,
        prompt_id: parse_optional_uuid(get_opt(6))?,
        greeting_message: get_opt(7),
        out_of_hours_message: get_opt(8),
        schedule,
        menu_options,
        media,
    })
}

const QUEUE_COLUMNS: &str = "id, tenant_id, channel_id, name, position, integration_id, \
     prompt_id, greeting_message, out_of_hours_message, schedule, menu_options, media";

fn row_to_rule(row: &libsql::Row) -> Result<TriageRule, DatabaseError> {
    let get_str = |i: i32| -> Result<String, DatabaseError> {
        row.get::<String>(i)
            .map_err(|e| DatabaseError::Query(format!("Bad rule column {i}: {e}")))
    };
    let get_opt = |i: i32| -> Option<String> { row.get::<String>(i).ok() };
    let get_int = |i: i32| -> Result<i64, DatabaseError> {
        row.get::<i64>(i)
            .map_err(|e| DatabaseError::Query(format!("Bad rule column {i}: {e}")))
    };

    let tag_ids = serde_json::from_str(&get_str(10)?)
        .map_err(|e| DatabaseError::Serialization(format!("Bad rule tag ids: {e}")))?;

    Ok(TriageRule {
        id: parse_uuid(&get_str(0)?)?,
        tenant_id: parse_uuid(&get_str(1)?)?,
        channel_id: parse_optional_uuid(get_opt(2))?,
        pattern: get_str(3)?,
        is_regex: get_int(4)? != 0,
        priority: get_int(5)? as i32,
        active: get_int(6)? != 0,
        assign_user_id: parse_optional_uuid(get_opt(7))?,
        assign_queue_id: parse_optional_uuid(get_opt(8))?,
        assign_channel_id: parse_optional_uuid(get_opt(9))?,
        tag_ids,
        created_at: parse_datetime(&get_str(11)?),
    })
}

const RULE_COLUMNS: &str = "id, tenant_id, channel_id, pattern, is_regex, priority, active, \
     assign_user_id, assign_queue_id, assign_channel_id, tag_ids, created_at";

#[async_trait]
impl Database for LibSqlBackend {
    async fn load_conversation(&self, id: Uuid) -> Result<Conversation, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to load conversation: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to read conversation: {e}")))?
        {
            Some(row) => row_to_conversation(&row),
            None => Err(DatabaseError::NotFound {
                entity: "conversation",
                id: id.to_string(),
            }),
        }
    }

    async fn save_conversation(&self, conversation: &Conversation) -> Result<(), DatabaseError> {
        self.write_conversation(conversation).await
    }

    async fn load_channel(&self, id: Uuid) -> Result<Channel, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, tenant_id, name, default_integration_id, default_prompt_id,
                        greeting_message, max_bot_uses, bot_cooldown_minutes
                 FROM channels WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to load channel: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to read channel: {e}")))?
            .ok_or(DatabaseError::NotFound {
                entity: "channel",
                id: id.to_string(),
            })?;

        let get_str = |i: i32| -> Result<String, DatabaseError> {
            row.get::<String>(i)
                .map_err(|e| DatabaseError::Query(format!("Bad channel column {i}: {e}")))
        };
        let get_opt = |i: i32| -> Option<String> { row.get::<String>(i).ok() };
        let get_int = |i: i32| -> Result<i64, DatabaseError> {
            row.get::<i64>(i)
                .map_err(|e| DatabaseError::Query(format!("Bad channel column {i}: {e}")))
        };

        Ok(Channel {
            id: parse_uuid(&get_str(0)?)?,
            tenant_id: parse_uuid(&get_str(1)?)?,
            name: get_str(2)?,
            default_integration_id: parse_optional_uuid(get_opt(3))?,
            default_prompt_id: parse_optional_uuid(get_opt(4))?,
            greeting_message: get_opt(5),
            max_bot_uses: get_int(6)?.max(0) as u32,
            bot_cooldown_minutes: get_int(7)?.max(0) as u32,
        })
    }

    async fn load_queues(&self, channel_id: Uuid) -> Result<Vec<Queue>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {QUEUE_COLUMNS} FROM queues WHERE channel_id = ?1 ORDER BY position"
                ),
                params![channel_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to load queues: {e}")))?;

        let mut queues = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to read queue: {e}")))?
        {
            queues.push(row_to_queue(&row)?);
        }
        Ok(queues)
    }

    async fn load_integration(&self, id: Uuid) -> Result<Integration, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, tenant_id, name, kind, config FROM integrations WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to load integration: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to read integration: {e}")))?
            .ok_or(DatabaseError::NotFound {
                entity: "integration",
                id: id.to_string(),
            })?;

        let id_str: String = row
            .get(0)
            .map_err(|e| DatabaseError::Query(format!("Bad integration id: {e}")))?;
        let tenant_str: String = row
            .get(1)
            .map_err(|e| DatabaseError::Query(format!("Bad integration tenant: {e}")))?;
        let name: String = row
            .get(2)
            .map_err(|e| DatabaseError::Query(format!("Bad integration name: {e}")))?;
        let kind_str: String = row
            .get(3)
            .map_err(|e| DatabaseError::Query(format!("Bad integration kind: {e}")))?;
        let config_str: String = row
            .get(4)
            .map_err(|e| DatabaseError::Query(format!("Bad integration config: {e}")))?;

        let kind = IntegrationKind::parse(&kind_str).ok_or_else(|| {
            DatabaseError::Serialization(format!("Unknown integration kind: {kind_str}"))
        })?;
        let config = serde_json::from_str(&config_str)
            .map_err(|e| DatabaseError::Serialization(format!("Bad integration config: {e}")))?;

        Ok(Integration {
            id: parse_uuid(&id_str)?,
            tenant_id: parse_uuid(&tenant_str)?,
            name,
            kind,
            config,
        })
    }

    async fn load_active_rules(
        &self,
        tenant_id: Uuid,
        channel_id: Uuid,
    ) -> Result<Vec<TriageRule>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {RULE_COLUMNS} FROM triage_rules
                     WHERE tenant_id = ?1 AND active = 1
                       AND (channel_id IS NULL OR channel_id = ?2)
                     ORDER BY priority DESC, created_at DESC"
                ),
                params![tenant_id.to_string(), channel_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to load rules: {e}")))?;

        let mut rules = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to read rule: {e}")))?
        {
            rules.push(row_to_rule(&row)?);
        }
        Ok(rules)
    }

    async fn count_pending_in_queue(
        &self,
        queue_id: Uuid,
        excluding: Uuid,
    ) -> Result<u64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM conversations
                 WHERE assigned_queue_id = ?1 AND status = 'pending'
                   AND assigned_user_id IS NULL AND id != ?2",
                params![queue_id.to_string(), excluding.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to count queue: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to read queue count: {e}")))?
            .ok_or_else(|| DatabaseError::Query("Empty count result".into()))?;
        let count: i64 = row
            .get(0)
            .map_err(|e| DatabaseError::Query(format!("Bad queue count: {e}")))?;
        Ok(count.max(0) as u64)
    }

    async fn find_recent_outbound_message(
        &self,
        conversation_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM outbound_messages
                 WHERE conversation_id = ?1 AND created_at >= ?2",
                params![conversation_id.to_string(), fmt_datetime(since)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to query outbound: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to read outbound count: {e}")))?
            .ok_or_else(|| DatabaseError::Query("Empty count result".into()))?;
        let count: i64 = row
            .get(0)
            .map_err(|e| DatabaseError::Query(format!("Bad outbound count: {e}")))?;
        Ok(count > 0)
    }

    async fn record_outbound_message(
        &self,
        conversation_id: Uuid,
        text: &str,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO outbound_messages (id, conversation_id, body, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    Uuid::new_v4().to_string(),
                    conversation_id.to_string(),
                    text,
                    fmt_datetime(Utc::now()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to record outbound: {e}")))?;
        Ok(())
    }

    async fn attach_tag(
        &self,
        conversation_id: Uuid,
        tag_id: Uuid,
    ) -> Result<bool, DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO conversation_tags (conversation_id, tag_id)
                 VALUES (?1, ?2)",
                params![conversation_id.to_string(), tag_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to attach tag: {e}")))?;
        Ok(affected > 0)
    }

    async fn list_attached_tags(&self, conversation_id: Uuid) -> Result<Vec<Uuid>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT tag_id FROM conversation_tags
                 WHERE conversation_id = ?1 ORDER BY created_at",
                params![conversation_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to list tags: {e}")))?;

        let mut tags = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to read tag: {e}")))?
        {
            let tag: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("Bad tag id: {e}")))?;
            tags.push(parse_uuid(&tag)?);
        }
        Ok(tags)
    }

    async fn get_or_create_setting(
        &self,
        tenant_id: Uuid,
        key: &str,
        default: &str,
    ) -> Result<String, DatabaseError> {
        // First read provisions the default; later reads keep whatever
        // the application wrote.
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO settings (tenant_id, key, value) VALUES (?1, ?2, ?3)",
                params![tenant_id.to_string(), key, default],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to provision setting: {e}")))?;

        let mut rows = self
            .conn()
            .query(
                "SELECT value FROM settings WHERE tenant_id = ?1 AND key = ?2",
                params![tenant_id.to_string(), key],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to read setting: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to read setting row: {e}")))?
            .ok_or_else(|| DatabaseError::Query("Setting vanished after provisioning".into()))?;
        row.get::<String>(0)
            .map_err(|e| DatabaseError::Query(format!("Bad setting value: {e}")))
    }
}
