//! Postgres-backed store. Claims rely on `FOR UPDATE SKIP LOCKED` so that
//! concurrent workers never observe the same row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::time::Duration;
use uuid::Uuid;

use super::{
    AuditStore, DeliveryLogStore, DirectoryStore, DlqStore, QueueStore, Store, StoreError,
    StoreResult,
};
use crate::models::{
    AccountType, AttemptRecord, AuditEntry, DeliveryLog, DeliveryLogId, DeliveryState, DlqEntry,
    DlqEntryId, DlqPayload, Group, GroupId, GroupStatus, MemberRole, Membership, Message,
    MessageId, MessageMetadata, MessageStatus, NewGroup, NewMessage, NewProvider, NewRoutingRule,
    NewUser, Provider, ProviderId, ProviderKind, QuotaStatus, RoutingRule, RuleConditions, RuleId,
    User, UserId, UserStatus, generate_api_key,
};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }
}

fn bad_column(column: &'static str) -> StoreError {
    StoreError::Internal(format!("unexpected value in column {column}"))
}

fn string_list(value: serde_json::Value) -> StoreResult<Vec<String>> {
    Ok(serde_json::from_value(value)?)
}

fn group_from_row(row: &PgRow) -> StoreResult<Group> {
    let status: String = row.try_get("status")?;
    Ok(Group {
        id: GroupId(row.try_get::<Uuid, _>("id")?),
        name: row.try_get("name")?,
        status: GroupStatus::parse(&status).ok_or_else(|| bad_column("status"))?,
        allow_any_sender: row.try_get("allow_any_sender")?,
        fallback_providers: string_list(row.try_get("fallback_providers")?)?,
        monthly_limit: row.try_get("monthly_limit")?,
        monthly_sent: row.try_get("monthly_sent")?,
        created_at: row.try_get("created_at")?,
    })
}

fn user_from_row(row: &PgRow) -> StoreResult<User> {
    let account_type: String = row.try_get("account_type")?;
    let status: String = row.try_get("status")?;
    Ok(User {
        id: UserId(row.try_get::<Uuid, _>("id")?),
        email: row.try_get("email")?,
        username: row.try_get("username")?,
        password_hash: row.try_get("password_hash")?,
        account_type: AccountType::parse(&account_type).ok_or_else(|| bad_column("account_type"))?,
        api_key: row.try_get("api_key")?,
        status: UserStatus::parse(&status).ok_or_else(|| bad_column("status"))?,
        allowed_domains: string_list(row.try_get("allowed_domains")?)?,
        created_at: row.try_get("created_at")?,
    })
}

fn membership_from_row(row: &PgRow) -> StoreResult<Membership> {
    let role: String = row.try_get("role")?;
    Ok(Membership {
        group_id: GroupId(row.try_get::<Uuid, _>("group_id")?),
        user_id: UserId(row.try_get::<Uuid, _>("user_id")?),
        role: MemberRole::parse(&role).ok_or_else(|| bad_column("role"))?,
        created_at: row.try_get("created_at")?,
    })
}

fn provider_from_row(row: &PgRow) -> StoreResult<Provider> {
    let kind: String = row.try_get("kind")?;
    Ok(Provider {
        id: ProviderId(row.try_get::<Uuid, _>("id")?),
        group_id: GroupId(row.try_get::<Uuid, _>("group_id")?),
        name: row.try_get("name")?,
        kind: ProviderKind::parse(&kind).ok_or_else(|| bad_column("kind"))?,
        api_key: row.try_get("api_key")?,
        smtp_config: row.try_get("smtp_config")?,
        enabled: row.try_get("enabled")?,
        created_at: row.try_get("created_at")?,
    })
}

fn rule_from_row(row: &PgRow) -> StoreResult<RoutingRule> {
    let conditions: serde_json::Value = row.try_get("conditions")?;
    let conditions: RuleConditions = serde_json::from_value(conditions)?;
    Ok(RoutingRule {
        id: RuleId(row.try_get::<Uuid, _>("id")?),
        group_id: GroupId(row.try_get::<Uuid, _>("group_id")?),
        priority: row.try_get("priority")?,
        conditions,
        provider_id: ProviderId(row.try_get::<Uuid, _>("provider_id")?),
        enabled: row.try_get("enabled")?,
        created_at: row.try_get("created_at")?,
    })
}

fn message_from_row(row: &PgRow) -> StoreResult<Message> {
    let status: String = row.try_get("status")?;
    let headers: serde_json::Value = row.try_get("headers")?;
    Ok(Message {
        id: MessageId(row.try_get::<Uuid, _>("id")?),
        group_id: GroupId(row.try_get::<Uuid, _>("group_id")?),
        envelope: crate::models::Envelope {
            sender: row.try_get("sender")?,
            recipients: string_list(row.try_get("recipients")?)?,
            subject: row.try_get("subject")?,
            headers: serde_json::from_value(headers)?,
            body: row.try_get("body")?,
        },
        status: MessageStatus::parse(&status).ok_or_else(|| bad_column("status"))?,
        retry_count: row.try_get("retry_count")?,
        next_attempt_at: row.try_get("next_attempt_at")?,
        created_at: row.try_get("created_at")?,
        processed_at: row.try_get("processed_at")?,
    })
}

fn log_from_row(row: &PgRow) -> StoreResult<DeliveryLog> {
    let status: String = row.try_get("status")?;
    Ok(DeliveryLog {
        id: DeliveryLogId(row.try_get::<Uuid, _>("id")?),
        message_id: MessageId(row.try_get::<Uuid, _>("message_id")?),
        provider_id: ProviderId(row.try_get::<Uuid, _>("provider_id")?),
        status: DeliveryState::parse(&status).ok_or_else(|| bad_column("status"))?,
        response_code: row.try_get("response_code")?,
        response_body: row.try_get("response_body")?,
        provider_message_id: row.try_get("provider_message_id")?,
        retry_count: row.try_get("retry_count")?,
        last_error: row.try_get("last_error")?,
        metadata: row.try_get("metadata")?,
        created_at: row.try_get("created_at")?,
    })
}

fn dlq_from_row(row: &PgRow) -> StoreResult<DlqEntry> {
    let payload: serde_json::Value = row.try_get("payload")?;
    let payload: DlqPayload = serde_json::from_value(payload)?;
    Ok(DlqEntry {
        id: DlqEntryId(row.try_get::<Uuid, _>("id")?),
        message_id: MessageId(row.try_get::<Uuid, _>("message_id")?),
        group_id: GroupId(row.try_get::<Uuid, _>("group_id")?),
        failure_reason: row.try_get("failure_reason")?,
        payload,
        enqueued_at: row.try_get("enqueued_at")?,
    })
}

#[async_trait]
impl DirectoryStore for PgStore {
    async fn create_group(&self, group: NewGroup) -> StoreResult<Group> {
        let row = sqlx::query(
            r#"
            INSERT INTO groups (id, name, allow_any_sender, fallback_providers, monthly_limit)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&group.name)
        .bind(group.allow_any_sender)
        .bind(serde_json::to_value(&group.fallback_providers)?)
        .bind(group.monthly_limit)
        .fetch_one(&self.pool)
        .await?;
        group_from_row(&row)
    }

    async fn group(&self, id: GroupId) -> StoreResult<Option<Group>> {
        sqlx::query("SELECT * FROM groups WHERE id = $1")
            .bind(*id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| group_from_row(&row))
            .transpose()
    }

    async fn group_by_name(&self, name: &str) -> StoreResult<Option<Group>> {
        sqlx::query("SELECT * FROM groups WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| group_from_row(&row))
            .transpose()
    }

    async fn list_groups(&self) -> StoreResult<Vec<Group>> {
        sqlx::query("SELECT * FROM groups ORDER BY name")
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(group_from_row)
            .collect()
    }

    async fn delete_group(&self, id: GroupId) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        let name: Option<String> = sqlx::query_scalar("SELECT name FROM groups WHERE id = $1")
            .bind(*id)
            .fetch_optional(&mut *tx)
            .await?;
        match name.as_deref() {
            None => return Err(StoreError::NotFound("group")),
            Some(crate::models::SYSTEM_GROUP) => return Err(StoreError::Conflict),
            Some(_) => {}
        }
        sqlx::query("UPDATE groups SET status = 'deleted' WHERE id = $1")
            .bind(*id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            UPDATE users SET status = 'suspended'
            WHERE account_type = 'smtp'
              AND id IN (SELECT user_id FROM memberships WHERE group_id = $1)
            "#,
        )
        .bind(*id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn try_consume_quota(&self, id: GroupId) -> StoreResult<QuotaStatus> {
        let updated = sqlx::query(
            "UPDATE groups SET monthly_sent = monthly_sent + 1 WHERE id = $1 AND monthly_sent < monthly_limit",
        )
        .bind(*id)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            Ok(QuotaStatus::Exceeded)
        } else {
            Ok(QuotaStatus::Within)
        }
    }

    async fn create_user(&self, user: NewUser) -> StoreResult<User> {
        let password_hash = user.password_hash();
        let api_key = matches!(user.account_type, AccountType::Smtp).then(generate_api_key);
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            r#"
            INSERT INTO users (id, email, username, password_hash, account_type, api_key, allowed_domains)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&user.email)
        .bind(&user.username)
        .bind(&password_hash)
        .bind(user.account_type.as_str())
        .bind(&api_key)
        .bind(serde_json::to_value(&user.allowed_domains)?)
        .fetch_one(&mut *tx)
        .await?;
        let created = user_from_row(&row)?;
        if let Some(group_id) = user.group_id {
            sqlx::query("INSERT INTO memberships (group_id, user_id, role) VALUES ($1, $2, 'member')")
                .bind(*group_id)
                .bind(*created.id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(created)
    }

    async fn user(&self, id: UserId) -> StoreResult<Option<User>> {
        sqlx::query("SELECT * FROM users WHERE id = $1")
            .bind(*id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| user_from_row(&row))
            .transpose()
    }

    async fn memberships_for_user(&self, user: UserId) -> StoreResult<Vec<Membership>> {
        sqlx::query("SELECT * FROM memberships WHERE user_id = $1 ORDER BY created_at")
            .bind(*user)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(membership_from_row)
            .collect()
    }

    async fn user_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        sqlx::query("SELECT * FROM users WHERE lower(email) = lower($1)")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| user_from_row(&row))
            .transpose()
    }

    async fn smtp_user_by_login(&self, login: &str) -> StoreResult<Option<(User, Group)>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM users
            WHERE account_type = 'smtp' AND (lower(email) = lower($1) OR username = $1)
            LIMIT 1
            "#,
        )
        .bind(login)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else { return Ok(None) };
        let user = user_from_row(&row)?;
        let group = sqlx::query(
            r#"
            SELECT g.* FROM groups g
                JOIN memberships m ON m.group_id = g.id
            WHERE m.user_id = $1
            LIMIT 1
            "#,
        )
        .bind(*user.id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(group.map(|row| group_from_row(&row).map(|g| (user, g))).transpose()?)
    }

    async fn add_member(&self, group: GroupId, user: UserId, role: MemberRole) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        // smtp accounts submit for exactly one tenant
        let already_bound: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT count(m.*) FROM users u
                LEFT JOIN memberships m ON m.user_id = u.id
            WHERE u.id = $1 AND u.account_type = 'smtp'
            GROUP BY u.id
            "#,
        )
        .bind(*user)
        .fetch_optional(&mut *tx)
        .await?;
        if already_bound.is_some_and(|count| count > 0) {
            return Err(StoreError::Conflict);
        }
        sqlx::query("INSERT INTO memberships (group_id, user_id, role) VALUES ($1, $2, $3)")
            .bind(*group)
            .bind(*user)
            .bind(role.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn members(&self, group: GroupId) -> StoreResult<Vec<Membership>> {
        sqlx::query("SELECT * FROM memberships WHERE group_id = $1 ORDER BY created_at")
            .bind(*group)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(membership_from_row)
            .collect()
    }

    async fn change_member_role(
        &self,
        group: GroupId,
        user: UserId,
        role: MemberRole,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        let current: Option<String> = sqlx::query_scalar(
            "SELECT role FROM memberships WHERE group_id = $1 AND user_id = $2 FOR UPDATE",
        )
        .bind(*group)
        .bind(*user)
        .fetch_optional(&mut *tx)
        .await?;
        let current = current.ok_or(StoreError::NotFound("membership"))?;
        if current == "owner" && role != MemberRole::Owner {
            let other_owners: i64 = sqlx::query_scalar(
                "SELECT count(*) FROM memberships WHERE group_id = $1 AND role = 'owner' AND user_id <> $2",
            )
            .bind(*group)
            .bind(*user)
            .fetch_one(&mut *tx)
            .await?;
            if other_owners == 0 {
                return Err(StoreError::LastOwner);
            }
        }
        sqlx::query("UPDATE memberships SET role = $3 WHERE group_id = $1 AND user_id = $2")
            .bind(*group)
            .bind(*user)
            .bind(role.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn remove_member(&self, group: GroupId, user: UserId) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        let current: Option<String> = sqlx::query_scalar(
            "SELECT role FROM memberships WHERE group_id = $1 AND user_id = $2 FOR UPDATE",
        )
        .bind(*group)
        .bind(*user)
        .fetch_optional(&mut *tx)
        .await?;
        let current = current.ok_or(StoreError::NotFound("membership"))?;
        if current == "owner" {
            let other_owners: i64 = sqlx::query_scalar(
                "SELECT count(*) FROM memberships WHERE group_id = $1 AND role = 'owner' AND user_id <> $2",
            )
            .bind(*group)
            .bind(*user)
            .fetch_one(&mut *tx)
            .await?;
            if other_owners == 0 {
                return Err(StoreError::LastOwner);
            }
        }
        sqlx::query("DELETE FROM memberships WHERE group_id = $1 AND user_id = $2")
            .bind(*group)
            .bind(*user)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn create_provider(
        &self,
        group: GroupId,
        provider: NewProvider,
    ) -> StoreResult<Provider> {
        let row = sqlx::query(
            r#"
            INSERT INTO providers (id, group_id, name, kind, api_key, smtp_config, enabled)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(*group)
        .bind(&provider.name)
        .bind(provider.kind.as_str())
        .bind(&provider.api_key)
        .bind(&provider.smtp_config)
        .bind(provider.enabled)
        .fetch_one(&self.pool)
        .await?;
        provider_from_row(&row)
    }

    async fn provider(&self, id: ProviderId) -> StoreResult<Option<Provider>> {
        sqlx::query("SELECT * FROM providers WHERE id = $1")
            .bind(*id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| provider_from_row(&row))
            .transpose()
    }

    async fn provider_by_name(&self, group: GroupId, name: &str) -> StoreResult<Option<Provider>> {
        sqlx::query("SELECT * FROM providers WHERE group_id = $1 AND name = $2")
            .bind(*group)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| provider_from_row(&row))
            .transpose()
    }

    async fn providers_for_group(&self, group: GroupId) -> StoreResult<Vec<Provider>> {
        sqlx::query("SELECT * FROM providers WHERE group_id = $1 ORDER BY created_at")
            .bind(*group)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(provider_from_row)
            .collect()
    }

    async fn update_provider(&self, provider: &Provider) -> StoreResult<()> {
        let updated = sqlx::query(
            r#"
            UPDATE providers
            SET name = $2, kind = $3, api_key = $4, smtp_config = $5, enabled = $6
            WHERE id = $1
            "#,
        )
        .bind(*provider.id)
        .bind(&provider.name)
        .bind(provider.kind.as_str())
        .bind(&provider.api_key)
        .bind(&provider.smtp_config)
        .bind(provider.enabled)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::NotFound("provider"));
        }
        Ok(())
    }

    async fn delete_provider(&self, group: GroupId, id: ProviderId) -> StoreResult<()> {
        let deleted = sqlx::query("DELETE FROM providers WHERE id = $1 AND group_id = $2")
            .bind(*id)
            .bind(*group)
            .execute(&self.pool)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(StoreError::NotFound("provider"));
        }
        Ok(())
    }

    async fn create_rule(&self, group: GroupId, rule: NewRoutingRule) -> StoreResult<RoutingRule> {
        let owner: Option<Uuid> =
            sqlx::query_scalar("SELECT group_id FROM providers WHERE id = $1")
                .bind(*rule.provider_id)
                .fetch_optional(&self.pool)
                .await?;
        if owner != Some(*group) {
            return Err(StoreError::ForeignKeyViolation);
        }
        let row = sqlx::query(
            r#"
            INSERT INTO routing_rules (id, group_id, priority, conditions, provider_id, enabled)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(*group)
        .bind(rule.priority)
        .bind(serde_json::to_value(&rule.conditions)?)
        .bind(*rule.provider_id)
        .bind(rule.enabled)
        .fetch_one(&self.pool)
        .await?;
        rule_from_row(&row)
    }

    async fn rule(&self, id: RuleId) -> StoreResult<Option<RoutingRule>> {
        sqlx::query("SELECT * FROM routing_rules WHERE id = $1")
            .bind(*id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| rule_from_row(&row))
            .transpose()
    }

    async fn rules_for_group(&self, group: GroupId) -> StoreResult<Vec<RoutingRule>> {
        sqlx::query(
            "SELECT * FROM routing_rules WHERE group_id = $1 ORDER BY priority, created_at",
        )
        .bind(*group)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(rule_from_row)
        .collect()
    }

    async fn update_rule(&self, rule: &RoutingRule) -> StoreResult<()> {
        let owner: Option<Uuid> =
            sqlx::query_scalar("SELECT group_id FROM providers WHERE id = $1")
                .bind(*rule.provider_id)
                .fetch_optional(&self.pool)
                .await?;
        if owner != Some(*rule.group_id) {
            return Err(StoreError::ForeignKeyViolation);
        }
        let updated = sqlx::query(
            r#"
            UPDATE routing_rules
            SET priority = $2, conditions = $3, provider_id = $4, enabled = $5
            WHERE id = $1
            "#,
        )
        .bind(*rule.id)
        .bind(rule.priority)
        .bind(serde_json::to_value(&rule.conditions)?)
        .bind(*rule.provider_id)
        .bind(rule.enabled)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::NotFound("routing rule"));
        }
        Ok(())
    }

    async fn delete_rule(&self, group: GroupId, id: RuleId) -> StoreResult<()> {
        let deleted = sqlx::query("DELETE FROM routing_rules WHERE id = $1 AND group_id = $2")
            .bind(*id)
            .bind(*group)
            .execute(&self.pool)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(StoreError::NotFound("routing rule"));
        }
        Ok(())
    }
}

#[async_trait]
impl QueueStore for PgStore {
    async fn enqueue(&self, message: NewMessage) -> StoreResult<MessageId> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO messages
                (id, group_id, sender, recipients, subject, headers, body, status, next_attempt_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'queued', now())
            "#,
        )
        .bind(id)
        .bind(*message.group_id)
        .bind(&message.envelope.sender)
        .bind(serde_json::to_value(&message.envelope.recipients)?)
        .bind(&message.envelope.subject)
        .bind(serde_json::to_value(&message.envelope.headers)?)
        .bind(&message.envelope.body)
        .execute(&self.pool)
        .await?;
        Ok(MessageId(id))
    }

    async fn claim(&self, limit: usize, now: DateTime<Utc>) -> StoreResult<Vec<Message>> {
        let rows = sqlx::query(
            r#"
            WITH due AS (
                SELECT id FROM messages
                WHERE status = 'queued' AND next_attempt_at <= $1
                ORDER BY seq
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE messages m
            SET status = 'processing', claimed_at = $1
            FROM due
            WHERE m.id = due.id
            RETURNING m.*
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        let mut claimed: Vec<(i64, Message)> = rows
            .iter()
            .map(|row| Ok((row.try_get::<i64, _>("seq")?, message_from_row(row)?)))
            .collect::<StoreResult<_>>()?;
        claimed.sort_by_key(|(seq, _)| *seq);
        Ok(claimed.into_iter().map(|(_, m)| m).collect())
    }

    async fn mark_delivered(&self, id: MessageId, now: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query(
            "UPDATE messages SET status = 'delivered', processed_at = $2, claimed_at = NULL WHERE id = $1",
        )
        .bind(*id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: MessageId,
        next_attempt_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE messages
            SET status = 'queued', retry_count = retry_count + 1,
                next_attempt_at = $2, claimed_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(*id)
        .bind(next_attempt_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_dead(&self, id: MessageId, now: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query(
            "UPDATE messages SET status = 'dead', processed_at = $2, claimed_at = NULL WHERE id = $1",
        )
        .bind(*id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn message(&self, id: MessageId) -> StoreResult<Option<Message>> {
        sqlx::query("SELECT * FROM messages WHERE id = $1")
            .bind(*id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| message_from_row(&row))
            .transpose()
    }

    async fn list_messages(&self, group: GroupId) -> StoreResult<Vec<MessageMetadata>> {
        let rows = sqlx::query(
            r#"
            SELECT id, group_id, sender, recipients, subject, status, retry_count,
                   created_at, processed_at
            FROM messages
            WHERE group_id = $1
            ORDER BY created_at DESC
            LIMIT 200
            "#,
        )
        .bind(*group)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let status: String = row.try_get("status")?;
                Ok(MessageMetadata {
                    id: MessageId(row.try_get::<Uuid, _>("id")?),
                    group_id: GroupId(row.try_get::<Uuid, _>("group_id")?),
                    sender: row.try_get("sender")?,
                    recipients: string_list(row.try_get("recipients")?)?,
                    subject: row.try_get("subject")?,
                    status: MessageStatus::parse(&status).ok_or_else(|| bad_column("status"))?,
                    retry_count: row.try_get("retry_count")?,
                    created_at: row.try_get("created_at")?,
                    processed_at: row.try_get("processed_at")?,
                })
            })
            .collect()
    }

    async fn reclaim_stuck(&self, older_than: Duration, now: DateTime<Utc>) -> StoreResult<u64> {
        let cutoff = now - chrono::Duration::from_std(older_than).unwrap_or_default();
        let updated = sqlx::query(
            r#"
            UPDATE messages
            SET status = 'queued', retry_count = retry_count + 1,
                next_attempt_at = $2, claimed_at = NULL
            WHERE status = 'processing' AND claimed_at IS NOT NULL AND claimed_at <= $1
            "#,
        )
        .bind(cutoff)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected())
    }

    async fn queue_depth(&self) -> StoreResult<u64> {
        let depth: i64 = sqlx::query_scalar("SELECT count(*) FROM messages WHERE status = 'queued'")
            .fetch_one(&self.pool)
            .await?;
        Ok(depth as u64)
    }
}

#[async_trait]
impl DeliveryLogStore for PgStore {
    async fn append_delivery_log(
        &self,
        message: MessageId,
        attempt: AttemptRecord,
    ) -> StoreResult<DeliveryLogId> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO delivery_logs
                (id, message_id, provider_id, status, response_code, response_body,
                 provider_message_id, retry_count, last_error, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(id)
        .bind(*message)
        .bind(*attempt.provider_id)
        .bind(attempt.status.as_str())
        .bind(attempt.response_code)
        .bind(&attempt.response_body)
        .bind(&attempt.provider_message_id)
        .bind(attempt.retry_count)
        .bind(&attempt.last_error)
        .bind(&attempt.metadata)
        .execute(&self.pool)
        .await?;
        Ok(DeliveryLogId(id))
    }

    async fn logs_for_message(&self, message: MessageId) -> StoreResult<Vec<DeliveryLog>> {
        sqlx::query("SELECT * FROM delivery_logs WHERE message_id = $1 ORDER BY created_at")
            .bind(*message)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(log_from_row)
            .collect()
    }

    async fn log_by_provider_message_id(&self, pid: &str) -> StoreResult<Option<DeliveryLog>> {
        sqlx::query("SELECT * FROM delivery_logs WHERE provider_message_id = $1")
            .bind(pid)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| log_from_row(&row))
            .transpose()
    }

    async fn update_log_state(
        &self,
        id: DeliveryLogId,
        state: DeliveryState,
        last_error: Option<&str>,
    ) -> StoreResult<()> {
        let updated = sqlx::query(
            "UPDATE delivery_logs SET status = $2, last_error = coalesce($3, last_error) WHERE id = $1",
        )
        .bind(*id)
        .bind(state.as_str())
        .bind(last_error)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::NotFound("delivery log"));
        }
        Ok(())
    }
}

#[async_trait]
impl DlqStore for PgStore {
    async fn push_dlq(&self, entry: DlqEntry) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO dlq_entries (id, message_id, group_id, failure_reason, payload, enqueued_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(*entry.id)
        .bind(*entry.message_id)
        .bind(*entry.group_id)
        .bind(&entry.failure_reason)
        .bind(serde_json::to_value(&entry.payload)?)
        .bind(entry.enqueued_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn dlq_entry_for_message(
        &self,
        group: GroupId,
        message: MessageId,
    ) -> StoreResult<Option<DlqEntry>> {
        sqlx::query("SELECT * FROM dlq_entries WHERE group_id = $1 AND message_id = $2")
            .bind(*group)
            .bind(*message)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| dlq_from_row(&row))
            .transpose()
    }

    async fn list_dlq(&self, group: GroupId) -> StoreResult<Vec<DlqEntry>> {
        sqlx::query("SELECT * FROM dlq_entries WHERE group_id = $1 ORDER BY enqueued_at")
            .bind(*group)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(dlq_from_row)
            .collect()
    }

    async fn remove_dlq(&self, id: DlqEntryId) -> StoreResult<()> {
        let deleted = sqlx::query("DELETE FROM dlq_entries WHERE id = $1")
            .bind(*id)
            .execute(&self.pool)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(StoreError::NotFound("dlq entry"));
        }
        Ok(())
    }
}

#[async_trait]
impl AuditStore for PgStore {
    async fn append_audit(&self, entry: AuditEntry) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_log (group_id, actor, action, resource_type, resource_id, changes, ip, ts)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(entry.group_id.map(|g| *g))
        .bind(&entry.actor)
        .bind(&entry.action)
        .bind(entry.resource_type)
        .bind(&entry.resource_id)
        .bind(&entry.changes)
        .bind(entry.ip.map(|ip| ip.to_string()))
        .bind(entry.ts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
