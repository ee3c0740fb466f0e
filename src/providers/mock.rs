//! Scriptable ESP for the embedded test harness. Responses are consumed
//! front to back; an empty script answers with a generated acknowledgement
//! id.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::{DeliveryResult, EspClient, EspFactory, ProviderError, SendStatus};
use crate::models::{Envelope, Provider, ProviderId};

pub struct MockEsp {
    name: String,
    script: Mutex<VecDeque<Result<DeliveryResult, ProviderError>>>,
    sent: Mutex<Vec<Envelope>>,
    healthy: AtomicBool,
    counter: AtomicU64,
}

impl MockEsp {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            script: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            healthy: AtomicBool::new(true),
            counter: AtomicU64::new(0),
        })
    }

    pub fn success(pid: &str) -> DeliveryResult {
        DeliveryResult {
            provider_message_id: Some(pid.to_string()),
            status: SendStatus::Sent,
            timestamp: Utc::now(),
            metadata: json!({"response_code": 202}),
        }
    }

    pub fn push(&self, response: Result<DeliveryResult, ProviderError>) {
        self.script.lock().unwrap().push_back(response);
    }

    pub fn push_error(&self, error: ProviderError) {
        self.push(Err(error));
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Envelope> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl EspClient for MockEsp {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, envelope: &Envelope) -> Result<DeliveryResult, ProviderError> {
        let scripted = self.script.lock().unwrap().pop_front();
        let result = match scripted {
            Some(result) => result,
            None => {
                let n = self.counter.fetch_add(1, Ordering::SeqCst);
                Ok(Self::success(&format!("{}-{n}", self.name)))
            }
        };
        if result.is_ok() {
            self.sent.lock().unwrap().push(envelope.clone());
        }
        result
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ProviderError::transient("mock unhealthy"))
        }
    }
}

/// Factory handing out pre-registered mocks by provider id.
#[derive(Default)]
pub struct MockEspFactory {
    clients: Mutex<HashMap<ProviderId, Arc<MockEsp>>>,
}

impl MockEspFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: ProviderId, client: Arc<MockEsp>) {
        self.clients.lock().unwrap().insert(id, client);
    }
}

impl EspFactory for MockEspFactory {
    fn build(&self, provider: &Provider) -> Result<Arc<dyn EspClient>, ProviderError> {
        let mut clients = self.clients.lock().unwrap();
        let client = clients
            .entry(provider.id)
            .or_insert_with(|| MockEsp::new(&provider.name))
            .clone();
        Ok(client)
    }
}
