//! Twilio SMS provider. Accepted messages are kept in memory; the sender
//! number follows the requested identity.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use drip_core::config::SmsConfig;
use drip_core::types::SenderIdentity;
use drip_core::DeliveryError;

use crate::delivery::{DeliveryAdapter, DeliveryReceipt, DeliveryRequest};

/// GSM 03.38 basic character set (besides ASCII letters and digits).
const GSM_BASIC: &str = " !\"#$%&'()*+,-./:;<=>?@_\n\r£¥èéùìòÇØøÅåΔΦΓΛΩΠΨΣΘΞÆæßÉ¤¡¿ÄÖÑÜ§äöñüà";
/// GSM extension table characters (escape-prefixed but still 7-bit).
const GSM_EXTENSION: &str = "{}[]~\\^|€";

/// An SMS message accepted by the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsMessage {
    pub id: Uuid,
    pub to: String,
    pub from: String,
    pub body: String,
    pub provider_id: String,
    pub created_at: DateTime<Utc>,
    pub segments: u32,
}

/// Twilio SMS provider with an in-memory message store.
pub struct SmsProvider {
    config: SmsConfig,
    messages: DashMap<Uuid, SmsMessage>,
}

impl SmsProvider {
    /// Create a new SMS provider. Missing credentials are reported on the
    /// first delivery attempt, not here.
    pub fn new(config: SmsConfig) -> Self {
        tracing::info!(
            account_sid = %config.account_sid,
            from = %config.from_number,
            marketing = config.marketing_from_number.is_some(),
            "Twilio SMS provider initialized"
        );
        Self {
            config,
            messages: DashMap::new(),
        }
    }

    /// Number to send from for `sender`. Marketing falls back to the
    /// primary number when no dedicated one is configured.
    pub fn from_number(&self, sender: SenderIdentity) -> &str {
        match sender {
            SenderIdentity::Marketing => self
                .config
                .marketing_from_number
                .as_deref()
                .filter(|n| !n.is_empty())
                .unwrap_or(&self.config.from_number),
            SenderIdentity::Primary => &self.config.from_number,
        }
    }

    /// Retrieve a message by its internal ID.
    pub fn get_message(&self, id: Uuid) -> Option<SmsMessage> {
        self.messages.get(&id).map(|m| m.clone())
    }

    /// Messages sent to `to`, oldest first.
    pub fn messages_to(&self, to: &str) -> Vec<SmsMessage> {
        let mut messages: Vec<SmsMessage> = self
            .messages
            .iter()
            .filter(|m| m.to == to)
            .map(|m| m.value().clone())
            .collect();
        messages.sort_by_key(|m| m.created_at);
        messages
    }

    /// List messages, returning up to `limit` most recently created messages.
    pub fn list_messages(&self, limit: usize) -> Vec<SmsMessage> {
        let mut messages: Vec<SmsMessage> = self
            .messages
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        messages.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        messages.truncate(limit);
        messages
    }

    /// Calculate the number of SMS segments for a message body.
    /// GSM 7-bit encoding: 160 chars per segment.
    /// Unicode (UCS-2): 70 chars per segment.
    pub fn calculate_segments(body: &str) -> u32 {
        if body.is_empty() {
            return 1;
        }

        let is_gsm = body.chars().all(is_gsm_7bit);
        let char_count = body.chars().count() as u32;

        if is_gsm {
            // GSM: 160 chars for single segment, 153 for multi-segment (UDH overhead)
            if char_count <= 160 {
                1
            } else {
                char_count.div_ceil(153)
            }
        } else if char_count <= 70 {
            1
        } else {
            char_count.div_ceil(67)
        }
    }

    fn check_configured(&self) -> Result<(), DeliveryError> {
        let missing: Vec<&str> = [
            ("account_sid", &self.config.account_sid),
            ("auth_token", &self.config.auth_token),
            ("from_number", &self.config.from_number),
        ]
        .into_iter()
        .filter(|(_, v)| v.trim().is_empty())
        .map(|(k, _)| k)
        .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(DeliveryError::NotConfigured(format!(
                "missing sms.{}",
                missing.join(", sms.")
            )))
        }
    }
}

#[async_trait]
impl DeliveryAdapter for SmsProvider {
    async fn deliver(&self, request: &DeliveryRequest) -> Result<DeliveryReceipt, DeliveryError> {
        self.check_configured()?;

        if !is_e164(&request.to) {
            metrics::counter!("sms.messages_failed", "reason" => "destination").increment(1);
            return Err(DeliveryError::InvalidDestination(request.to.clone()));
        }
        if request.body.trim().is_empty() {
            metrics::counter!("sms.messages_failed", "reason" => "empty_body").increment(1);
            return Err(DeliveryError::Rejected {
                code: "21602".to_string(),
                message: "message body is required".to_string(),
            });
        }

        let id = Uuid::new_v4();
        let provider_id = format!("SM{}", Uuid::new_v4().simple());
        let segments = Self::calculate_segments(&request.body);
        let from = self.from_number(request.sender).to_string();

        let msg = SmsMessage {
            id,
            to: request.to.clone(),
            from,
            body: request.body.clone(),
            provider_id: provider_id.clone(),
            created_at: Utc::now(),
            segments,
        };

        tracing::info!(
            id = %id,
            to = %request.to,
            provider_id = %provider_id,
            segments = segments,
            "SMS message queued"
        );

        metrics::counter!("sms.messages_sent").increment(1);
        self.messages.insert(id, msg);

        Ok(DeliveryReceipt {
            provider_message_id: provider_id,
            segments,
        })
    }
}

/// `+` followed by 8 to 15 digits, the first non-zero.
fn is_e164(phone: &str) -> bool {
    let Some(digits) = phone.strip_prefix('+') else {
        return false;
    };
    (8..=15).contains(&digits.len())
        && digits.bytes().all(|b| b.is_ascii_digit())
        && !digits.starts_with('0')
}

/// Check whether a character is in the GSM 7-bit alphabet.
fn is_gsm_7bit(c: char) -> bool {
    c.is_ascii_alphanumeric() || GSM_BASIC.contains(c) || GSM_EXTENSION.contains(c)
}
