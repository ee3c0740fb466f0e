//! Tenant to provider resolution: first matching enabled rule whose
//! provider is enabled and healthy, then the group's fallback chain.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::models::{Envelope, Group, Provider};
use crate::store::{Store, StoreResult};

pub mod health;

pub use health::HealthChecker;

#[derive(Clone)]
pub struct RoutingEngine {
    store: Arc<dyn Store>,
    health: Arc<HealthChecker>,
}

impl RoutingEngine {
    pub fn new(store: Arc<dyn Store>, health: Arc<HealthChecker>) -> Self {
        Self { store, health }
    }

    /// Returns `None` when every candidate is unhealthy or disabled.
    pub async fn resolve(
        &self,
        group: &Group,
        envelope: &Envelope,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Provider>> {
        let rules = self.store.rules_for_group(group.id).await?;

        for rule in rules.iter().filter(|r| r.enabled) {
            if !rule.conditions.matches(envelope) {
                continue;
            }
            let Some(provider) = self.store.provider(rule.provider_id).await? else {
                continue;
            };
            if provider.enabled && self.health.is_healthy(provider.id, now) {
                trace!(rule = %rule.id, provider = %provider.name, "rule matched");
                return Ok(Some(provider));
            }
            debug!(
                rule = %rule.id,
                provider = %provider.name,
                "matched rule skipped, provider disabled or unhealthy"
            );
        }

        for name in &group.fallback_providers {
            let Some(provider) = self.store.provider_by_name(group.id, name).await? else {
                continue;
            };
            if provider.enabled && self.health.is_healthy(provider.id, now) {
                debug!(provider = %provider.name, "using fallback provider");
                return Ok(Some(provider));
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::HealthConfig;
    use crate::models::{
        GroupId, NewGroup, NewProvider, NewRoutingRule, ProviderId, ProviderKind, RuleConditions,
    };
    use crate::store::{DirectoryStore, MemoryStore};
    use std::collections::BTreeMap;

    fn envelope(sender: &str, recipient: &str) -> Envelope {
        Envelope {
            sender: sender.into(),
            recipients: vec![recipient.into()],
            subject: "s".into(),
            headers: BTreeMap::new(),
            body: b"body".to_vec(),
        }
    }

    async fn setup() -> (Arc<MemoryStore>, RoutingEngine, Group) {
        let store = Arc::new(MemoryStore::new());
        let health = Arc::new(HealthChecker::new(HealthConfig::default()));
        let engine = RoutingEngine::new(store.clone(), health);
        let group = store
            .create_group(NewGroup {
                name: "acme".into(),
                monthly_limit: 1000,
                allow_any_sender: true,
                fallback_providers: vec!["fallback".into()],
            })
            .await
            .unwrap();
        (store, engine, group)
    }

    async fn provider(store: &MemoryStore, group: GroupId, name: &str) -> ProviderId {
        store
            .create_provider(
                group,
                NewProvider {
                    name: name.into(),
                    kind: ProviderKind::Sendgrid,
                    api_key: Some("key".into()),
                    smtp_config: serde_json::json!({}),
                    enabled: true,
                },
            )
            .await
            .unwrap()
            .id
    }

    async fn rule(
        store: &MemoryStore,
        group: GroupId,
        priority: i32,
        conditions: RuleConditions,
        provider_id: ProviderId,
    ) {
        store
            .create_rule(
                group,
                NewRoutingRule {
                    priority,
                    conditions,
                    provider_id,
                    enabled: true,
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn picks_the_lowest_priority_matching_rule() {
        let (store, engine, group) = setup().await;
        let first = provider(&store, group.id, "first").await;
        let second = provider(&store, group.id, "second").await;
        rule(&store, group.id, 20, RuleConditions::default(), second).await;
        rule(&store, group.id, 10, RuleConditions::default(), first).await;

        let resolved = engine
            .resolve(&group, &envelope("a@x.com", "b@y.com"), Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolved.id, first);
    }

    #[tokio::test]
    async fn skips_rules_whose_conditions_do_not_match() {
        let (store, engine, group) = setup().await;
        let narrow = provider(&store, group.id, "narrow").await;
        let broad = provider(&store, group.id, "broad").await;
        rule(
            &store,
            group.id,
            1,
            RuleConditions {
                domain: Some("other.com".into()),
                ..Default::default()
            },
            narrow,
        )
        .await;
        rule(&store, group.id, 2, RuleConditions::default(), broad).await;

        let resolved = engine
            .resolve(&group, &envelope("a@x.com", "b@y.com"), Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolved.id, broad);
    }

    #[tokio::test]
    async fn unhealthy_rule_provider_falls_through_to_the_chain() {
        let (store, engine, group) = setup().await;
        let primary = provider(&store, group.id, "primary").await;
        let fallback = provider(&store, group.id, "fallback").await;
        rule(&store, group.id, 1, RuleConditions::default(), primary).await;

        let now = Utc::now();
        for _ in 0..HealthConfig::default().fail_threshold {
            engine.health.record_failure(primary, now);
        }

        let resolved = engine
            .resolve(&group, &envelope("a@x.com", "b@y.com"), now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolved.id, fallback);
    }

    #[tokio::test]
    async fn no_eligible_when_everything_is_out() {
        let (store, engine, group) = setup().await;
        let primary = provider(&store, group.id, "primary").await;
        rule(&store, group.id, 1, RuleConditions::default(), primary).await;

        let now = Utc::now();
        for _ in 0..HealthConfig::default().fail_threshold {
            engine.health.record_failure(primary, now);
        }

        // the fallback chain names a provider that does not exist
        let resolved = engine
            .resolve(&group, &envelope("a@x.com", "b@y.com"), now)
            .await
            .unwrap();
        assert!(resolved.is_none());
    }

    #[tokio::test]
    async fn disabled_providers_are_never_eligible() {
        let (store, engine, group) = setup().await;
        let id = provider(&store, group.id, "only").await;
        rule(&store, group.id, 1, RuleConditions::default(), id).await;
        let mut p = store.provider(id).await.unwrap().unwrap();
        p.enabled = false;
        store.update_provider(&p).await.unwrap();

        let resolved = engine
            .resolve(&group, &envelope("a@x.com", "b@y.com"), Utc::now())
            .await
            .unwrap();
        assert!(resolved.is_none());
    }
}
