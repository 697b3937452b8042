//! Messaging gateway contract, WhatsApp delivery and the notification pass.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, info_span, warn};
use uuid::Uuid;

use vigia_core::{Alert, AlertKind, DeliveryStatus, Listing, NotificationLogEntry, Role, UserAccount};
use vigia_storage::{NotificationLog, StorageError};

pub const CRATE_NAME: &str = "vigia-notify";

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("delivery timed out")]
    Timeout,
    #[error("gateway rejected the message: http {status}: {detail}")]
    Rejected { status: u16, detail: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
}

#[async_trait]
pub trait MessageGateway: Send + Sync {
    async fn send_text(&self, phone_number: &str, body: &str) -> Result<(), GatewayError>;
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub api_url: String,
    pub access_token: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            access_token: String::new(),
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

/// WhatsApp Cloud API text delivery. Every call is bounded by the configured
/// timeout; a timeout surfaces as a failed delivery, never as a hung scan.
#[derive(Debug)]
pub struct WhatsAppGateway {
    client: reqwest::Client,
    api_url: String,
    access_token: String,
}

impl WhatsAppGateway {
    pub fn new(config: GatewayConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            api_url: config.api_url,
            access_token: config.access_token,
        })
    }
}

#[async_trait]
impl MessageGateway for WhatsAppGateway {
    async fn send_text(&self, phone_number: &str, body: &str) -> Result<(), GatewayError> {
        let span = info_span!("wa_send", to = phone_number);
        let _guard = span.enter();

        let result = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.access_token)
            .json(&serde_json::json!({
                "messaging_product": "whatsapp",
                "to": phone_number,
                "type": "text",
                "text": { "body": body },
            }))
            .send()
            .await;

        match result {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    return Ok(());
                }
                let detail = resp.text().await.unwrap_or_default();
                Err(GatewayError::Rejected {
                    status: status.as_u16(),
                    detail,
                })
            }
            Err(err) if err.is_timeout() => Err(GatewayError::Timeout),
            Err(err) => Err(GatewayError::Request(err)),
        }
    }
}

/// Stand-in gateway for runs without WhatsApp credentials: logs the message
/// and reports success.
#[derive(Debug, Default)]
pub struct DryRunGateway;

#[async_trait]
impl MessageGateway for DryRunGateway {
    async fn send_text(&self, phone_number: &str, body: &str) -> Result<(), GatewayError> {
        info!(to = phone_number, chars = body.len(), "dry-run delivery");
        Ok(())
    }
}

fn months_label(days: i64) -> String {
    let months = days / 30;
    if months == 1 {
        "1 mes".to_string()
    } else {
        format!("{months} meses")
    }
}

pub fn render_alert_title(listing_title: &str, kind: AlertKind, days: i64) -> String {
    match kind {
        AlertKind::NotRented30d => {
            format!("{listing_title} lleva {days} días sin rentarse")
        }
        AlertKind::NotSold60d => {
            format!("{listing_title} lleva {days} días sin venderse")
        }
    }
}

pub fn render_alert_description(listing_title: &str, kind: AlertKind, days: i64) -> String {
    let months = months_label(days);
    match kind {
        AlertKind::NotRented30d => format!(
            "La propiedad «{listing_title}» acumula {days} días ({months}) publicada sin \
             registrar una renta. Revisa el precio o la difusión de la publicación."
        ),
        AlertKind::NotSold60d => format!(
            "La propiedad «{listing_title}» acumula {days} días ({months}) publicada sin \
             registrar una venta. Revisa el precio o la difusión de la publicación."
        ),
    }
}

pub fn render_message(
    alert: &Alert,
    listing: &Listing,
    owner_name: &str,
    listing_base_url: &str,
) -> String {
    let role = listing.owner_role.unwrap_or(Role::Advisor).label_es();
    format!(
        "Alerta de propiedad inactiva\n\n\
         {title}\n\n\
         Propiedad: {listing_title}\n\
         Operación: {operation}\n\
         Días sin movimiento: {days} ({months})\n\
         Responsable: {owner_name} ({role})\n\n\
         {description}\n\n\
         Ver publicación: {base}/propiedades/{listing_id}",
        title = alert.title,
        listing_title = listing.title,
        operation = listing.operation_type.label_es(),
        days = alert.days_inactive,
        months = months_label(alert.days_inactive),
        description = alert.description,
        base = listing_base_url.trim_end_matches('/'),
        listing_id = listing.id,
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryDisposition {
    Sent,
    Failed,
    SkippedNoPhone,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeliveryRecord {
    pub recipient_id: Uuid,
    pub disposition: DeliveryDisposition,
    pub error: Option<String>,
}

/// Walks the resolved audience one recipient at a time. Each reachable
/// recipient gets exactly one log row, sent or failed; a failure never blocks
/// the recipients after it.
pub struct Notifier {
    gateway: Arc<dyn MessageGateway>,
    log: Arc<dyn NotificationLog>,
    listing_base_url: String,
}

impl Notifier {
    pub fn new(
        gateway: Arc<dyn MessageGateway>,
        log: Arc<dyn NotificationLog>,
        listing_base_url: String,
    ) -> Self {
        Self {
            gateway,
            log,
            listing_base_url,
        }
    }

    pub async fn notify_alert(
        &self,
        alert: &Alert,
        listing: &Listing,
        owner_name: &str,
        recipients: &[UserAccount],
    ) -> Result<Vec<DeliveryRecord>, StorageError> {
        let mut records = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            let Some(phone) = recipient.delivery_number() else {
                // Unreachable account: skipped without a log row.
                records.push(DeliveryRecord {
                    recipient_id: recipient.id,
                    disposition: DeliveryDisposition::SkippedNoPhone,
                    error: None,
                });
                continue;
            };

            let message = render_message(alert, listing, owner_name, &self.listing_base_url);
            let now = Utc::now();
            let (status, disposition, error_message, sent_at) =
                match self.gateway.send_text(phone, &message).await {
                    Ok(()) => (DeliveryStatus::Sent, DeliveryDisposition::Sent, None, Some(now)),
                    Err(err) => {
                        warn!(
                            alert_id = %alert.id,
                            recipient_id = %recipient.id,
                            error = %err,
                            "delivery failed"
                        );
                        (
                            DeliveryStatus::Failed,
                            DeliveryDisposition::Failed,
                            Some(err.to_string()),
                            None,
                        )
                    }
                };

            self.log
                .append(NotificationLogEntry {
                    id: Uuid::new_v4(),
                    alert_id: alert.id,
                    recipient_id: recipient.id,
                    recipient_role: recipient.role,
                    phone_number: phone.to_string(),
                    message,
                    status,
                    error_message: error_message.clone(),
                    sent_at,
                    created_at: now,
                })
                .await?;

            records.push(DeliveryRecord {
                recipient_id: recipient.id,
                disposition,
                error: error_message,
            });
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use std::collections::HashSet;
    use tokio::sync::Mutex;
    use vigia_core::{AlertState, ListingStatus, OperationType};
    use vigia_storage::MemoryStore;

    #[derive(Default)]
    struct RecordingGateway {
        sent: Mutex<Vec<(String, String)>>,
        fail_numbers: HashSet<String>,
    }

    #[async_trait]
    impl MessageGateway for RecordingGateway {
        async fn send_text(&self, phone_number: &str, body: &str) -> Result<(), GatewayError> {
            if self.fail_numbers.contains(phone_number) {
                return Err(GatewayError::Timeout);
            }
            self.sent
                .lock()
                .await
                .push((phone_number.to_string(), body.to_string()));
            Ok(())
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).single().unwrap()
    }

    fn fixture() -> (Alert, Listing) {
        let listing = Listing {
            id: Uuid::new_v4(),
            title: "Casa en Coyoacán".into(),
            operation_type: OperationType::Rental,
            status: ListingStatus::Available,
            owner_id: Uuid::new_v4(),
            owner_role: Some(Role::Advisor),
            created_at: now(),
            last_sale_at: None,
            last_rental_at: None,
        };
        let alert = Alert {
            id: Uuid::new_v4(),
            listing_id: listing.id,
            owner_id: listing.owner_id,
            kind: AlertKind::NotRented30d,
            title: render_alert_title(&listing.title, AlertKind::NotRented30d, 45),
            description: render_alert_description(&listing.title, AlertKind::NotRented30d, 45),
            days_inactive: 45,
            state: AlertState::Active,
            notified_at: None,
            created_at: now(),
            updated_at: now(),
            resolved_at: None,
            resolved_by_action: None,
        };
        (alert, listing)
    }

    fn recipient(phone: Option<&str>, whatsapp: Option<&str>) -> UserAccount {
        UserAccount {
            id: Uuid::new_v4(),
            name: "Ana".into(),
            role: Role::Admin,
            whatsapp: whatsapp.map(str::to_string),
            phone: phone.map(str::to_string),
            is_active: true,
        }
    }

    #[tokio::test]
    async fn missing_phone_is_a_silent_skip() {
        let gateway = Arc::new(RecordingGateway::default());
        let store = Arc::new(MemoryStore::new());
        let notifier = Notifier::new(
            gateway.clone(),
            store.clone(),
            "https://inmuebles.example".into(),
        );
        let (alert, listing) = fixture();

        let records = notifier
            .notify_alert(&alert, &listing, "Luis", &[recipient(None, None)])
            .await
            .unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].disposition, DeliveryDisposition::SkippedNoPhone);
        assert!(gateway.sent.lock().await.is_empty());
        assert!(store.entries_for_alert(alert.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn one_failure_does_not_block_the_rest() {
        let bad = recipient(Some("+5215550000001"), None);
        let good = recipient(None, Some("+5215550000002"));
        let gateway = Arc::new(RecordingGateway {
            fail_numbers: HashSet::from(["+5215550000001".to_string()]),
            ..Default::default()
        });
        let store = Arc::new(MemoryStore::new());
        let notifier = Notifier::new(
            gateway.clone(),
            store.clone(),
            "https://inmuebles.example".into(),
        );
        let (alert, listing) = fixture();

        let records = notifier
            .notify_alert(&alert, &listing, "Luis", &[bad.clone(), good.clone()])
            .await
            .unwrap();

        assert_eq!(records[0].disposition, DeliveryDisposition::Failed);
        assert_eq!(records[1].disposition, DeliveryDisposition::Sent);

        let entries = store.entries_for_alert(alert.id).await.unwrap();
        assert_eq!(entries.len(), 2);
        let failed = entries.iter().find(|e| e.recipient_id == bad.id).unwrap();
        assert_eq!(failed.status, DeliveryStatus::Failed);
        assert!(failed.error_message.is_some());
        assert!(failed.sent_at.is_none());
        let sent = entries.iter().find(|e| e.recipient_id == good.id).unwrap();
        assert_eq!(sent.status, DeliveryStatus::Sent);
        assert!(sent.sent_at.is_some());
    }

    #[tokio::test]
    async fn whatsapp_number_wins_over_phone() {
        let both = recipient(Some("+5215550000003"), Some("+5215550000004"));
        let gateway = Arc::new(RecordingGateway::default());
        let store = Arc::new(MemoryStore::new());
        let notifier = Notifier::new(
            gateway.clone(),
            store.clone(),
            "https://inmuebles.example".into(),
        );
        let (alert, listing) = fixture();

        notifier
            .notify_alert(&alert, &listing, "Luis", &[both])
            .await
            .unwrap();

        let sent = gateway.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "+5215550000004");
    }

    #[test]
    fn message_embeds_listing_link_and_duration() {
        let (alert, listing) = fixture();
        let message = render_message(&alert, &listing, "Luis", "https://inmuebles.example/");

        assert!(message.contains("Casa en Coyoacán"));
        assert!(message.contains("45"));
        assert!(message.contains("1 mes"));
        assert!(message.contains("renta"));
        assert!(message.contains("Luis (asesor)"));
        assert!(message.contains(&format!(
            "https://inmuebles.example/propiedades/{}",
            listing.id
        )));
    }
}
