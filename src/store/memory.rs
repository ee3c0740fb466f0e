//! Single-writer in-memory store. Backs the embedded test harness and
//! development mode; everything lives behind one mutex, which is never held
//! across an await.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use super::{
    AuditStore, DeliveryLogStore, DirectoryStore, DlqStore, QueueStore, Store, StoreError,
    StoreResult,
};
use crate::models::{
    AttemptRecord, AuditEntry, DeliveryLog, DeliveryLogId, DeliveryState, DlqEntry, DlqEntryId,
    Group, GroupId, GroupStatus, MemberRole, Membership, Message, MessageId, MessageMetadata,
    MessageStatus, NewGroup, NewMessage, NewProvider, NewRoutingRule, NewUser, Provider,
    ProviderId, QuotaStatus, RoutingRule, RuleId, User, UserId, UserStatus, generate_api_key,
};

#[derive(Default)]
struct Inner {
    groups: HashMap<GroupId, Group>,
    users: HashMap<UserId, User>,
    memberships: Vec<Membership>,
    providers: HashMap<ProviderId, Provider>,
    rules: HashMap<RuleId, RoutingRule>,
    messages: HashMap<MessageId, QueuedMessage>,
    logs: Vec<DeliveryLog>,
    dlq: HashMap<DlqEntryId, DlqEntry>,
    audits: Vec<AuditEntry>,
    next_seq: u64,
}

struct QueuedMessage {
    message: Message,
    seq: u64,
    claimed_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory store poisoned")
    }

    /// Test hook: the audit trail as emitted so far.
    pub fn audit_actions(&self) -> Vec<String> {
        self.lock().audits.iter().map(|a| a.action.clone()).collect()
    }
}

#[async_trait]
impl DirectoryStore for MemoryStore {
    async fn create_group(&self, group: NewGroup) -> StoreResult<Group> {
        let mut inner = self.lock();
        if inner.groups.values().any(|g| g.name == group.name) {
            return Err(StoreError::Conflict);
        }
        let group = Group {
            id: GroupId::random(),
            name: group.name,
            status: GroupStatus::Active,
            allow_any_sender: group.allow_any_sender,
            fallback_providers: group.fallback_providers,
            monthly_limit: group.monthly_limit,
            monthly_sent: 0,
            created_at: Utc::now(),
        };
        inner.groups.insert(group.id, group.clone());
        Ok(group)
    }

    async fn group(&self, id: GroupId) -> StoreResult<Option<Group>> {
        Ok(self.lock().groups.get(&id).cloned())
    }

    async fn group_by_name(&self, name: &str) -> StoreResult<Option<Group>> {
        Ok(self.lock().groups.values().find(|g| g.name == name).cloned())
    }

    async fn list_groups(&self) -> StoreResult<Vec<Group>> {
        let mut groups: Vec<_> = self.lock().groups.values().cloned().collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(groups)
    }

    async fn delete_group(&self, id: GroupId) -> StoreResult<()> {
        let mut inner = self.lock();
        let group = inner
            .groups
            .get_mut(&id)
            .ok_or(StoreError::NotFound("group"))?;
        if group.is_system() {
            return Err(StoreError::Conflict);
        }
        group.status = GroupStatus::Deleted;
        let members: Vec<UserId> = inner
            .memberships
            .iter()
            .filter(|m| m.group_id == id)
            .map(|m| m.user_id)
            .collect();
        for user_id in members {
            if let Some(user) = inner.users.get_mut(&user_id) {
                if user.account_type == crate::models::AccountType::Smtp {
                    user.status = UserStatus::Suspended;
                }
            }
        }
        Ok(())
    }

    async fn try_consume_quota(&self, id: GroupId) -> StoreResult<QuotaStatus> {
        let mut inner = self.lock();
        let group = inner
            .groups
            .get_mut(&id)
            .ok_or(StoreError::NotFound("group"))?;
        if group.monthly_sent >= group.monthly_limit {
            return Ok(QuotaStatus::Exceeded);
        }
        group.monthly_sent += 1;
        Ok(QuotaStatus::Within)
    }

    async fn create_user(&self, user: NewUser) -> StoreResult<User> {
        let password_hash = user.password_hash();
        let mut inner = self.lock();
        if inner
            .users
            .values()
            .any(|u| u.email.eq_ignore_ascii_case(&user.email))
        {
            return Err(StoreError::Conflict);
        }
        let api_key = matches!(user.account_type, crate::models::AccountType::Smtp)
            .then(generate_api_key);
        let created = User {
            id: UserId::random(),
            email: user.email,
            username: user.username,
            password_hash,
            account_type: user.account_type,
            api_key,
            status: UserStatus::Active,
            allowed_domains: user.allowed_domains,
            created_at: Utc::now(),
        };
        if let Some(group_id) = user.group_id {
            if !inner.groups.contains_key(&group_id) {
                return Err(StoreError::ForeignKeyViolation);
            }
            inner.memberships.push(Membership {
                group_id,
                user_id: created.id,
                role: MemberRole::Member,
                created_at: Utc::now(),
            });
        }
        inner.users.insert(created.id, created.clone());
        Ok(created)
    }

    async fn user(&self, id: UserId) -> StoreResult<Option<User>> {
        Ok(self.lock().users.get(&id).cloned())
    }

    async fn memberships_for_user(&self, user: UserId) -> StoreResult<Vec<Membership>> {
        Ok(self
            .lock()
            .memberships
            .iter()
            .filter(|m| m.user_id == user)
            .cloned()
            .collect())
    }

    async fn user_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        Ok(self
            .lock()
            .users
            .values()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn smtp_user_by_login(&self, login: &str) -> StoreResult<Option<(User, Group)>> {
        let inner = self.lock();
        let user = inner.users.values().find(|u| {
            u.account_type == crate::models::AccountType::Smtp
                && (u.email.eq_ignore_ascii_case(login)
                    || u.username.as_deref().is_some_and(|n| n == login))
        });
        let Some(user) = user else {
            return Ok(None);
        };
        let group = inner
            .memberships
            .iter()
            .find(|m| m.user_id == user.id)
            .and_then(|m| inner.groups.get(&m.group_id));
        Ok(group.map(|g| (user.clone(), g.clone())))
    }

    async fn add_member(&self, group: GroupId, user: UserId, role: MemberRole) -> StoreResult<()> {
        let mut inner = self.lock();
        let Some(account) = inner.users.get(&user) else {
            return Err(StoreError::ForeignKeyViolation);
        };
        if !inner.groups.contains_key(&group) {
            return Err(StoreError::ForeignKeyViolation);
        }
        let existing = inner
            .memberships
            .iter()
            .filter(|m| m.user_id == user)
            .count();
        if inner
            .memberships
            .iter()
            .any(|m| m.group_id == group && m.user_id == user)
        {
            return Err(StoreError::Conflict);
        }
        // smtp accounts submit for exactly one tenant
        if account.account_type == crate::models::AccountType::Smtp && existing > 0 {
            return Err(StoreError::Conflict);
        }
        inner.memberships.push(Membership {
            group_id: group,
            user_id: user,
            role,
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn members(&self, group: GroupId) -> StoreResult<Vec<Membership>> {
        Ok(self
            .lock()
            .memberships
            .iter()
            .filter(|m| m.group_id == group)
            .cloned()
            .collect())
    }

    async fn change_member_role(
        &self,
        group: GroupId,
        user: UserId,
        role: MemberRole,
    ) -> StoreResult<()> {
        let mut inner = self.lock();
        let other_owners = inner
            .memberships
            .iter()
            .filter(|m| m.group_id == group && m.role == MemberRole::Owner && m.user_id != user)
            .count();
        let membership = inner
            .memberships
            .iter_mut()
            .find(|m| m.group_id == group && m.user_id == user)
            .ok_or(StoreError::NotFound("membership"))?;
        if membership.role == MemberRole::Owner && role != MemberRole::Owner && other_owners == 0 {
            return Err(StoreError::LastOwner);
        }
        membership.role = role;
        Ok(())
    }

    async fn remove_member(&self, group: GroupId, user: UserId) -> StoreResult<()> {
        let mut inner = self.lock();
        let position = inner
            .memberships
            .iter()
            .position(|m| m.group_id == group && m.user_id == user)
            .ok_or(StoreError::NotFound("membership"))?;
        let is_owner = inner.memberships[position].role == MemberRole::Owner;
        let other_owners = inner
            .memberships
            .iter()
            .filter(|m| m.group_id == group && m.role == MemberRole::Owner && m.user_id != user)
            .count();
        if is_owner && other_owners == 0 {
            return Err(StoreError::LastOwner);
        }
        inner.memberships.remove(position);
        Ok(())
    }

    async fn create_provider(
        &self,
        group: GroupId,
        provider: NewProvider,
    ) -> StoreResult<Provider> {
        let mut inner = self.lock();
        if !inner.groups.contains_key(&group) {
            return Err(StoreError::ForeignKeyViolation);
        }
        if inner
            .providers
            .values()
            .any(|p| p.group_id == group && p.name == provider.name)
        {
            return Err(StoreError::Conflict);
        }
        let provider = Provider {
            id: ProviderId::random(),
            group_id: group,
            name: provider.name,
            kind: provider.kind,
            api_key: provider.api_key,
            smtp_config: provider.smtp_config,
            enabled: provider.enabled,
            created_at: Utc::now(),
        };
        inner.providers.insert(provider.id, provider.clone());
        Ok(provider)
    }

    async fn provider(&self, id: ProviderId) -> StoreResult<Option<Provider>> {
        Ok(self.lock().providers.get(&id).cloned())
    }

    async fn provider_by_name(&self, group: GroupId, name: &str) -> StoreResult<Option<Provider>> {
        Ok(self
            .lock()
            .providers
            .values()
            .find(|p| p.group_id == group && p.name == name)
            .cloned())
    }

    async fn providers_for_group(&self, group: GroupId) -> StoreResult<Vec<Provider>> {
        let mut providers: Vec<_> = self
            .lock()
            .providers
            .values()
            .filter(|p| p.group_id == group)
            .cloned()
            .collect();
        providers.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(providers)
    }

    async fn update_provider(&self, provider: &Provider) -> StoreResult<()> {
        let mut inner = self.lock();
        if inner
            .providers
            .values()
            .any(|p| p.group_id == provider.group_id && p.name == provider.name && p.id != provider.id)
        {
            return Err(StoreError::Conflict);
        }
        match inner.providers.get_mut(&provider.id) {
            Some(existing) => {
                *existing = provider.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound("provider")),
        }
    }

    async fn delete_provider(&self, group: GroupId, id: ProviderId) -> StoreResult<()> {
        let mut inner = self.lock();
        match inner.providers.get(&id) {
            Some(p) if p.group_id == group => {
                inner.providers.remove(&id);
                inner.rules.retain(|_, r| r.provider_id != id);
                Ok(())
            }
            _ => Err(StoreError::NotFound("provider")),
        }
    }

    async fn create_rule(&self, group: GroupId, rule: NewRoutingRule) -> StoreResult<RoutingRule> {
        let mut inner = self.lock();
        match inner.providers.get(&rule.provider_id) {
            Some(p) if p.group_id == group => {}
            _ => return Err(StoreError::ForeignKeyViolation),
        }
        let rule = RoutingRule {
            id: RuleId::random(),
            group_id: group,
            priority: rule.priority,
            conditions: rule.conditions,
            provider_id: rule.provider_id,
            enabled: rule.enabled,
            created_at: Utc::now(),
        };
        inner.rules.insert(rule.id, rule.clone());
        Ok(rule)
    }

    async fn rule(&self, id: RuleId) -> StoreResult<Option<RoutingRule>> {
        Ok(self.lock().rules.get(&id).cloned())
    }

    async fn rules_for_group(&self, group: GroupId) -> StoreResult<Vec<RoutingRule>> {
        let mut rules: Vec<_> = self
            .lock()
            .rules
            .values()
            .filter(|r| r.group_id == group)
            .cloned()
            .collect();
        rules.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(rules)
    }

    async fn update_rule(&self, rule: &RoutingRule) -> StoreResult<()> {
        let mut inner = self.lock();
        match inner.providers.get(&rule.provider_id) {
            Some(p) if p.group_id == rule.group_id => {}
            _ => return Err(StoreError::ForeignKeyViolation),
        }
        match inner.rules.get_mut(&rule.id) {
            Some(existing) => {
                *existing = rule.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound("routing rule")),
        }
    }

    async fn delete_rule(&self, group: GroupId, id: RuleId) -> StoreResult<()> {
        let mut inner = self.lock();
        match inner.rules.get(&id) {
            Some(r) if r.group_id == group => {
                inner.rules.remove(&id);
                Ok(())
            }
            _ => Err(StoreError::NotFound("routing rule")),
        }
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn enqueue(&self, message: NewMessage) -> StoreResult<MessageId> {
        let mut inner = self.lock();
        let now = Utc::now();
        let id = MessageId::random();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.messages.insert(
            id,
            QueuedMessage {
                message: Message {
                    id,
                    group_id: message.group_id,
                    envelope: message.envelope,
                    status: MessageStatus::Queued,
                    retry_count: 0,
                    next_attempt_at: now,
                    created_at: now,
                    processed_at: None,
                },
                seq,
                claimed_at: None,
            },
        );
        Ok(id)
    }

    async fn claim(&self, limit: usize, now: DateTime<Utc>) -> StoreResult<Vec<Message>> {
        let mut inner = self.lock();
        let mut due: Vec<(u64, MessageId)> = inner
            .messages
            .values()
            .filter(|q| q.message.status == MessageStatus::Queued && q.message.next_attempt_at <= now)
            .map(|q| (q.seq, q.message.id))
            .collect();
        due.sort_unstable();
        due.truncate(limit);
        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            let queued = inner.messages.get_mut(&id).expect("row just listed");
            queued.message.status = MessageStatus::Processing;
            queued.claimed_at = Some(now);
            claimed.push(queued.message.clone());
        }
        Ok(claimed)
    }

    async fn mark_delivered(&self, id: MessageId, now: DateTime<Utc>) -> StoreResult<()> {
        let mut inner = self.lock();
        let queued = inner
            .messages
            .get_mut(&id)
            .ok_or(StoreError::NotFound("message"))?;
        queued.message.status = MessageStatus::Delivered;
        queued.message.processed_at = Some(now);
        queued.claimed_at = None;
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: MessageId,
        next_attempt_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut inner = self.lock();
        let queued = inner
            .messages
            .get_mut(&id)
            .ok_or(StoreError::NotFound("message"))?;
        queued.message.status = MessageStatus::Queued;
        queued.message.retry_count += 1;
        queued.message.next_attempt_at = next_attempt_at;
        queued.claimed_at = None;
        Ok(())
    }

    async fn mark_dead(&self, id: MessageId, now: DateTime<Utc>) -> StoreResult<()> {
        let mut inner = self.lock();
        let queued = inner
            .messages
            .get_mut(&id)
            .ok_or(StoreError::NotFound("message"))?;
        queued.message.status = MessageStatus::Dead;
        queued.message.processed_at = Some(now);
        queued.claimed_at = None;
        Ok(())
    }

    async fn message(&self, id: MessageId) -> StoreResult<Option<Message>> {
        Ok(self.lock().messages.get(&id).map(|q| q.message.clone()))
    }

    async fn list_messages(&self, group: GroupId) -> StoreResult<Vec<MessageMetadata>> {
        let inner = self.lock();
        let mut rows: Vec<(u64, MessageMetadata)> = inner
            .messages
            .values()
            .filter(|q| q.message.group_id == group)
            .map(|q| (q.seq, MessageMetadata::from(&q.message)))
            .collect();
        rows.sort_by_key(|(seq, _)| std::cmp::Reverse(*seq));
        Ok(rows.into_iter().map(|(_, m)| m).collect())
    }

    async fn reclaim_stuck(&self, older_than: Duration, now: DateTime<Utc>) -> StoreResult<u64> {
        let cutoff = now - chrono::Duration::from_std(older_than).unwrap_or_default();
        let mut inner = self.lock();
        let mut reclaimed = 0;
        for queued in inner.messages.values_mut() {
            if queued.message.status == MessageStatus::Processing
                && queued.claimed_at.is_some_and(|at| at <= cutoff)
            {
                queued.message.status = MessageStatus::Queued;
                queued.message.retry_count += 1;
                queued.message.next_attempt_at = now;
                queued.claimed_at = None;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn queue_depth(&self) -> StoreResult<u64> {
        Ok(self
            .lock()
            .messages
            .values()
            .filter(|q| q.message.status == MessageStatus::Queued)
            .count() as u64)
    }
}

#[async_trait]
impl DeliveryLogStore for MemoryStore {
    async fn append_delivery_log(
        &self,
        message: MessageId,
        attempt: AttemptRecord,
    ) -> StoreResult<DeliveryLogId> {
        let mut inner = self.lock();
        if !inner.messages.contains_key(&message) {
            return Err(StoreError::ForeignKeyViolation);
        }
        if let Some(pid) = &attempt.provider_message_id {
            if inner
                .logs
                .iter()
                .any(|l| l.provider_message_id.as_deref() == Some(pid))
            {
                return Err(StoreError::Conflict);
            }
        }
        let id = DeliveryLogId::random();
        inner.logs.push(DeliveryLog {
            id,
            message_id: message,
            provider_id: attempt.provider_id,
            status: attempt.status,
            response_code: attempt.response_code,
            response_body: attempt.response_body,
            provider_message_id: attempt.provider_message_id,
            retry_count: attempt.retry_count,
            last_error: attempt.last_error,
            metadata: attempt.metadata,
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn logs_for_message(&self, message: MessageId) -> StoreResult<Vec<DeliveryLog>> {
        Ok(self
            .lock()
            .logs
            .iter()
            .filter(|l| l.message_id == message)
            .cloned()
            .collect())
    }

    async fn log_by_provider_message_id(&self, pid: &str) -> StoreResult<Option<DeliveryLog>> {
        Ok(self
            .lock()
            .logs
            .iter()
            .find(|l| l.provider_message_id.as_deref() == Some(pid))
            .cloned())
    }

    async fn update_log_state(
        &self,
        id: DeliveryLogId,
        state: DeliveryState,
        last_error: Option<&str>,
    ) -> StoreResult<()> {
        let mut inner = self.lock();
        let log = inner
            .logs
            .iter_mut()
            .find(|l| l.id == id)
            .ok_or(StoreError::NotFound("delivery log"))?;
        log.status = state;
        if let Some(err) = last_error {
            log.last_error = Some(err.to_string());
        }
        Ok(())
    }
}

#[async_trait]
impl DlqStore for MemoryStore {
    async fn push_dlq(&self, entry: DlqEntry) -> StoreResult<()> {
        let mut inner = self.lock();
        if inner
            .dlq
            .values()
            .any(|e| e.message_id == entry.message_id)
        {
            return Err(StoreError::Conflict);
        }
        inner.dlq.insert(entry.id, entry);
        Ok(())
    }

    async fn dlq_entry_for_message(
        &self,
        group: GroupId,
        message: MessageId,
    ) -> StoreResult<Option<DlqEntry>> {
        Ok(self
            .lock()
            .dlq
            .values()
            .find(|e| e.group_id == group && e.message_id == message)
            .cloned())
    }

    async fn list_dlq(&self, group: GroupId) -> StoreResult<Vec<DlqEntry>> {
        let mut entries: Vec<_> = self
            .lock()
            .dlq
            .values()
            .filter(|e| e.group_id == group)
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at));
        Ok(entries)
    }

    async fn remove_dlq(&self, id: DlqEntryId) -> StoreResult<()> {
        self.lock()
            .dlq
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound("dlq entry"))
    }
}

#[async_trait]
impl AuditStore for MemoryStore {
    async fn append_audit(&self, entry: AuditEntry) -> StoreResult<()> {
        self.lock().audits.push(entry);
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::BTreeMap;

    fn envelope(sender: &str) -> crate::models::Envelope {
        crate::models::Envelope {
            sender: sender.into(),
            recipients: vec!["bob@dest.com".into()],
            subject: "Hi".into(),
            headers: BTreeMap::from([("Subject".to_string(), "Hi".to_string())]),
            body: b"Subject: Hi\r\n\r\nhello".to_vec(),
        }
    }

    async fn group(store: &MemoryStore) -> Group {
        store
            .create_group(NewGroup {
                name: format!("tenant-{}", uuid::Uuid::new_v4()),
                monthly_limit: 100,
                allow_any_sender: true,
                fallback_providers: vec![],
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn enqueue_then_claim_round_trips_the_envelope() {
        let store = MemoryStore::new();
        let group = group(&store).await;
        let envelope = envelope("alice@example.com");
        let id = store
            .enqueue(NewMessage {
                group_id: group.id,
                envelope: envelope.clone(),
            })
            .await
            .unwrap();

        let claimed = store.claim(10, Utc::now()).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, id);
        assert_eq!(claimed[0].envelope, envelope);
        assert_eq!(claimed[0].status, MessageStatus::Processing);

        // a second claim sees nothing: the row is held
        assert!(store.claim(10, Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn claim_is_fifo_and_respects_next_attempt() {
        let store = MemoryStore::new();
        let group = group(&store).await;
        let first = store
            .enqueue(NewMessage {
                group_id: group.id,
                envelope: envelope("a@x.com"),
            })
            .await
            .unwrap();
        let second = store
            .enqueue(NewMessage {
                group_id: group.id,
                envelope: envelope("b@x.com"),
            })
            .await
            .unwrap();

        let claimed = store.claim(1, Utc::now()).await.unwrap();
        assert_eq!(claimed[0].id, first);

        // push the second into the future, it is no longer due
        store
            .mark_failed(second, Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert!(store.claim(10, Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reclaim_returns_stuck_rows_to_the_queue() {
        let store = MemoryStore::new();
        let group = group(&store).await;
        store
            .enqueue(NewMessage {
                group_id: group.id,
                envelope: envelope("a@x.com"),
            })
            .await
            .unwrap();
        let claimed_at = Utc::now();
        let claimed = store.claim(1, claimed_at).await.unwrap();
        assert_eq!(claimed.len(), 1);

        // not old enough yet
        let reclaimed = store
            .reclaim_stuck(Duration::from_secs(600), claimed_at + chrono::Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(reclaimed, 0);

        let reclaimed = store
            .reclaim_stuck(Duration::from_secs(600), claimed_at + chrono::Duration::minutes(11))
            .await
            .unwrap();
        assert_eq!(reclaimed, 1);
        let row = store.message(claimed[0].id).await.unwrap().unwrap();
        assert_eq!(row.status, MessageStatus::Queued);
        assert_eq!(row.retry_count, 1);
    }

    #[tokio::test]
    async fn provider_message_id_is_unique_across_logs() {
        let store = MemoryStore::new();
        let group = group(&store).await;
        let id = store
            .enqueue(NewMessage {
                group_id: group.id,
                envelope: envelope("a@x.com"),
            })
            .await
            .unwrap();
        let attempt = AttemptRecord {
            provider_id: ProviderId::random(),
            status: DeliveryState::Sent,
            response_code: Some(202),
            response_body: None,
            provider_message_id: Some("pid-1".into()),
            retry_count: 0,
            last_error: None,
            metadata: serde_json::Value::Null,
        };
        store.append_delivery_log(id, attempt.clone()).await.unwrap();
        assert!(matches!(
            store.append_delivery_log(id, attempt).await,
            Err(StoreError::Conflict)
        ));
    }

    #[tokio::test]
    async fn last_owner_is_protected() {
        let store = MemoryStore::new();
        let group = group(&store).await;
        let owner = store
            .create_user(NewUser {
                email: "owner@acme.test".into(),
                username: None,
                password: "pw".into(),
                account_type: crate::models::AccountType::User,
                group_id: None,
                allowed_domains: vec![],
            })
            .await
            .unwrap();
        store
            .add_member(group.id, owner.id, MemberRole::Owner)
            .await
            .unwrap();

        assert!(matches!(
            store
                .change_member_role(group.id, owner.id, MemberRole::Member)
                .await,
            Err(StoreError::LastOwner)
        ));
        assert!(matches!(
            store.remove_member(group.id, owner.id).await,
            Err(StoreError::LastOwner)
        ));

        // a second owner unblocks both operations
        let second = store
            .create_user(NewUser {
                email: "second@acme.test".into(),
                username: None,
                password: "pw".into(),
                account_type: crate::models::AccountType::User,
                group_id: None,
                allowed_domains: vec![],
            })
            .await
            .unwrap();
        store
            .add_member(group.id, second.id, MemberRole::Owner)
            .await
            .unwrap();
        store
            .change_member_role(group.id, owner.id, MemberRole::Member)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn monthly_quota_gate() {
        let store = MemoryStore::new();
        let group = store
            .create_group(NewGroup {
                name: "tiny".into(),
                monthly_limit: 2,
                allow_any_sender: true,
                fallback_providers: vec![],
            })
            .await
            .unwrap();
        assert_eq!(
            store.try_consume_quota(group.id).await.unwrap(),
            QuotaStatus::Within
        );
        assert_eq!(
            store.try_consume_quota(group.id).await.unwrap(),
            QuotaStatus::Within
        );
        assert_eq!(
            store.try_consume_quota(group.id).await.unwrap(),
            QuotaStatus::Exceeded
        );
    }

    #[tokio::test]
    async fn system_group_cannot_be_deleted() {
        let store = MemoryStore::new();
        let system = store
            .create_group(NewGroup {
                name: crate::models::SYSTEM_GROUP.into(),
                monthly_limit: 100,
                allow_any_sender: false,
                fallback_providers: vec![],
            })
            .await
            .unwrap();
        assert!(matches!(
            store.delete_group(system.id).await,
            Err(StoreError::Conflict)
        ));
    }
}
