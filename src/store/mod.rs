use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

use crate::models::{
    AttemptRecord, AuditEntry, DeliveryLog, DeliveryLogId, DeliveryState, DlqEntry, DlqEntryId,
    Group, GroupId, MemberRole, Membership, Message, MessageId, MessageMetadata, NewGroup,
    NewMessage, NewProvider, NewRoutingRule, NewUser, Provider, ProviderId, QuotaStatus,
    RoutingRule, RuleId, User, UserId,
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("conflict")]
    Conflict,
    #[error("a group must keep at least one owner")]
    LastOwner,
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("foreign key violation")]
    ForeignKeyViolation,
    #[error(transparent)]
    Database(sqlx::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("{0}")]
    Internal(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_unique_violation() {
                return StoreError::Conflict;
            }
            if db_err.is_foreign_key_violation() {
                return StoreError::ForeignKeyViolation;
            }
        }
        if matches!(err, sqlx::Error::RowNotFound) {
            return StoreError::NotFound("row");
        }
        StoreError::Database(err)
    }
}

/// Tenant directory: groups, users, memberships, providers and routing
/// rules.
#[async_trait]
pub trait DirectoryStore: Send + Sync {
    async fn create_group(&self, group: NewGroup) -> StoreResult<Group>;
    async fn group(&self, id: GroupId) -> StoreResult<Option<Group>>;
    async fn group_by_name(&self, name: &str) -> StoreResult<Option<Group>>;
    async fn list_groups(&self) -> StoreResult<Vec<Group>>;
    /// Soft delete: marks the group deleted and suspends its smtp accounts.
    /// The system group refuses with `Conflict`.
    async fn delete_group(&self, id: GroupId) -> StoreResult<()>;
    /// Send-time monthly gate. Increments `monthly_sent` iff under the
    /// limit.
    async fn try_consume_quota(&self, id: GroupId) -> StoreResult<QuotaStatus>;

    async fn create_user(&self, user: NewUser) -> StoreResult<User>;
    async fn user(&self, id: UserId) -> StoreResult<Option<User>>;
    async fn user_by_email(&self, email: &str) -> StoreResult<Option<User>>;
    async fn memberships_for_user(&self, user: UserId) -> StoreResult<Vec<Membership>>;
    /// SMTP AUTH lookup by username or email. Returns the account together
    /// with its one bound group.
    async fn smtp_user_by_login(&self, login: &str) -> StoreResult<Option<(User, Group)>>;

    async fn add_member(&self, group: GroupId, user: UserId, role: MemberRole) -> StoreResult<()>;
    async fn members(&self, group: GroupId) -> StoreResult<Vec<Membership>>;
    /// Refuses with `LastOwner` when the change would leave the group
    /// without an owner.
    async fn change_member_role(
        &self,
        group: GroupId,
        user: UserId,
        role: MemberRole,
    ) -> StoreResult<()>;
    /// Same `LastOwner` guard as `change_member_role`.
    async fn remove_member(&self, group: GroupId, user: UserId) -> StoreResult<()>;

    async fn create_provider(&self, group: GroupId, provider: NewProvider)
        -> StoreResult<Provider>;
    async fn provider(&self, id: ProviderId) -> StoreResult<Option<Provider>>;
    async fn provider_by_name(&self, group: GroupId, name: &str) -> StoreResult<Option<Provider>>;
    async fn providers_for_group(&self, group: GroupId) -> StoreResult<Vec<Provider>>;
    async fn update_provider(&self, provider: &Provider) -> StoreResult<()>;
    async fn delete_provider(&self, group: GroupId, id: ProviderId) -> StoreResult<()>;

    async fn create_rule(&self, group: GroupId, rule: NewRoutingRule) -> StoreResult<RoutingRule>;
    async fn rule(&self, id: RuleId) -> StoreResult<Option<RoutingRule>>;
    /// Enabled and disabled rules, ordered by priority ASC then creation
    /// time ASC.
    async fn rules_for_group(&self, group: GroupId) -> StoreResult<Vec<RoutingRule>>;
    async fn update_rule(&self, rule: &RoutingRule) -> StoreResult<()>;
    async fn delete_rule(&self, group: GroupId, id: RuleId) -> StoreResult<()>;
}

/// Durable FIFO-ish message queue with status indexing.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Atomic insert with status=queued, retry_count=0,
    /// next_attempt_at=now. Write-visible before the SMTP 250 goes out.
    async fn enqueue(&self, message: NewMessage) -> StoreResult<MessageId>;
    /// Claims up to `limit` due rows in FIFO order, atomically marking them
    /// processing. No two concurrent callers observe the same row.
    async fn claim(&self, limit: usize, now: DateTime<Utc>) -> StoreResult<Vec<Message>>;
    async fn mark_delivered(&self, id: MessageId, now: DateTime<Utc>) -> StoreResult<()>;
    /// Back to queued with retry_count+1 and the given next attempt.
    async fn mark_failed(
        &self,
        id: MessageId,
        next_attempt_at: DateTime<Utc>,
    ) -> StoreResult<()>;
    async fn mark_dead(&self, id: MessageId, now: DateTime<Utc>) -> StoreResult<()>;
    async fn message(&self, id: MessageId) -> StoreResult<Option<Message>>;
    async fn list_messages(&self, group: GroupId) -> StoreResult<Vec<MessageMetadata>>;
    /// Janitor: processing rows claimed longer than `older_than` ago go back
    /// to queued with retry_count+1. Returns the number reclaimed.
    async fn reclaim_stuck(&self, older_than: Duration, now: DateTime<Utc>) -> StoreResult<u64>;
    async fn queue_depth(&self) -> StoreResult<u64>;
}

#[async_trait]
pub trait DeliveryLogStore: Send + Sync {
    async fn append_delivery_log(
        &self,
        message: MessageId,
        attempt: AttemptRecord,
    ) -> StoreResult<DeliveryLogId>;
    async fn logs_for_message(&self, message: MessageId) -> StoreResult<Vec<DeliveryLog>>;
    async fn log_by_provider_message_id(&self, pid: &str) -> StoreResult<Option<DeliveryLog>>;
    async fn update_log_state(
        &self,
        id: DeliveryLogId,
        state: DeliveryState,
        last_error: Option<&str>,
    ) -> StoreResult<()>;
}

#[async_trait]
pub trait DlqStore: Send + Sync {
    async fn push_dlq(&self, entry: DlqEntry) -> StoreResult<()>;
    async fn dlq_entry_for_message(
        &self,
        group: GroupId,
        message: MessageId,
    ) -> StoreResult<Option<DlqEntry>>;
    async fn list_dlq(&self, group: GroupId) -> StoreResult<Vec<DlqEntry>>;
    async fn remove_dlq(&self, id: DlqEntryId) -> StoreResult<()>;
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append_audit(&self, entry: AuditEntry) -> StoreResult<()>;
}

#[async_trait]
pub trait Store:
    DirectoryStore + QueueStore + DeliveryLogStore + DlqStore + AuditStore + Send + Sync
{
    /// Liveness probe backing `/readyz`.
    async fn ping(&self) -> StoreResult<()>;
}
