//! Shared fixtures for the engine's unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use uuid::Uuid;

use drip_channels::{DeliveryAdapter, DeliveryReceipt, DeliveryRequest};
use drip_core::config::{AppConfig, ComposerConfig};
use drip_core::event_bus::CaptureSink;
use drip_core::types::{Flow, FlowId, FlowMessage, FlowStatus, MessageDelay, SenderIdentity, Subscriber};
use drip_core::DeliveryError;
use drip_store::{
    MemoryAccounts, MemoryCatalog, MemoryEntrySource, MemoryLedger, MemoryRunLog,
    MemoryStatusStore, StatusStore,
};

use crate::engine::{EngineDeps, FlowEngine};

/// Delivery adapter that records requests and replays queued failures.
#[derive(Default)]
pub struct ScriptedAdapter {
    sent: Mutex<Vec<DeliveryRequest>>,
    failures: Mutex<VecDeque<DeliveryError>>,
    outage: Mutex<Option<Arc<MemoryStatusStore>>>,
}

impl ScriptedAdapter {
    pub fn fail_next(&self, err: DeliveryError) {
        self.failures.lock().unwrap().push_back(err);
    }

    /// Takes `store` offline as soon as the next delivery returns.
    pub fn take_offline_after_delivery(&self, store: Arc<MemoryStatusStore>) {
        *self.outage.lock().unwrap() = Some(store);
    }

    pub fn sent(&self) -> Vec<DeliveryRequest> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeliveryAdapter for ScriptedAdapter {
    async fn deliver(&self, request: &DeliveryRequest) -> Result<DeliveryReceipt, DeliveryError> {
        if let Some(store) = self.outage.lock().unwrap().take() {
            store.set_available(false);
        }
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.sent.lock().unwrap().push(request.clone());
        Ok(DeliveryReceipt {
            provider_message_id: format!("SM{}", Uuid::new_v4().simple()),
            segments: 1,
        })
    }
}

pub struct Harness {
    pub now: DateTime<Utc>,
    pub catalog: Arc<MemoryCatalog>,
    pub statuses: Arc<MemoryStatusStore>,
    pub run_log: Arc<MemoryRunLog>,
    pub entries: Arc<MemoryEntrySource>,
    pub ledger: Arc<MemoryLedger>,
    pub accounts: Arc<MemoryAccounts>,
    pub delivery: Arc<ScriptedAdapter>,
    pub events: Arc<CaptureSink>,
}

impl Harness {
    /// Catalog: `welcome` (two messages, the second two days out),
    /// `follow_up` and `ongoing` (one message each), and an inactive
    /// `retired` flow.
    pub fn new() -> Self {
        let catalog = MemoryCatalog::new();
        for (id, active) in [
            ("welcome", true),
            ("follow_up", true),
            ("ongoing", true),
            ("retired", false),
        ] {
            catalog.add_flow(Flow {
                id: FlowId::from(id),
                name: id.to_string(),
                active,
                sender: SenderIdentity::Primary,
            });
        }
        catalog.add_message(message("welcome", 1, "Hi {{name}}, you won!", MessageDelay::default(), true));
        catalog.add_message(message("welcome", 2, "Last call {{name}}", MessageDelay::new(2, 0), false));
        catalog.add_message(message("follow_up", 1, "Your coupon is waiting", MessageDelay::default(), true));
        catalog.add_message(message("ongoing", 1, "New talent this week", MessageDelay::default(), false));
        catalog.add_message(message("retired", 1, "Never sent", MessageDelay::default(), false));

        Self {
            now: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
            catalog: Arc::new(catalog),
            statuses: Arc::new(MemoryStatusStore::new()),
            run_log: Arc::new(MemoryRunLog::new()),
            entries: Arc::new(MemoryEntrySource::new()),
            ledger: Arc::new(MemoryLedger::new()),
            accounts: Arc::new(MemoryAccounts::new()),
            delivery: Arc::new(ScriptedAdapter::default()),
            events: Arc::new(CaptureSink::default()),
        }
    }

    pub fn config(&self) -> AppConfig {
        let mut config = AppConfig::default();
        config.enrollment.welcome_flow = FlowId::from("welcome");
        config.enrollment.follow_up_flow = FlowId::from("follow_up");
        config.enrollment.ongoing_flow = FlowId::from("ongoing");
        config.composer = ComposerConfig {
            link_base: "https://service".to_string(),
            ..ComposerConfig::default()
        };
        config
    }

    pub fn deps(&self) -> EngineDeps {
        EngineDeps {
            catalog: self.catalog.clone(),
            statuses: self.statuses.clone(),
            run_log: self.run_log.clone(),
            entries: self.entries.clone(),
            ledger: self.ledger.clone(),
            accounts: self.accounts.clone(),
            delivery: self.delivery.clone(),
        }
    }

    pub fn engine(&self) -> FlowEngine {
        self.engine_with(self.config())
    }

    pub fn engine_with(&self, config: AppConfig) -> FlowEngine {
        FlowEngine::new(&config, self.deps())
            .unwrap()
            .with_event_sink(self.events.clone())
    }

    pub async fn enroll(&self, phone: &str, flow: &str, at: DateTime<Utc>) -> Uuid {
        self.enroll_with_coupon(phone, flow, at, None).await
    }

    pub async fn enroll_with_coupon(
        &self,
        phone: &str,
        flow: &str,
        at: DateTime<Utc>,
        coupon: Option<&str>,
    ) -> Uuid {
        let status = FlowStatus::enroll(Subscriber::new(phone), FlowId::from(flow), at, at - Duration::minutes(1))
            .with_coupon(coupon.map(String::from));
        let id = status.id;
        self.statuses.insert_if_absent(status).await.unwrap();
        id
    }

    pub async fn status(&self, id: Uuid) -> FlowStatus {
        self.statuses.get(id).await.unwrap().unwrap()
    }
}

fn message(
    flow: &str,
    sequence: u32,
    template: &str,
    delay: MessageDelay,
    includes_coupon: bool,
) -> FlowMessage {
    FlowMessage {
        id: Uuid::new_v4(),
        flow_id: FlowId::from(flow),
        sequence,
        template: template.to_string(),
        delay,
        includes_coupon,
        includes_link: false,
        link_tag: None,
        active: true,
    }
}
