//! Stale-listing scan pipeline: classification, upsert and fan-out.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

use vigia_core::{
    classify, resolve_recipients, Alert, AlertKind, AlertState, Listing, ListingStatus,
    ResolveAction,
};
use vigia_notify::{render_alert_description, render_alert_title, DeliveryDisposition, Notifier};
use vigia_storage::{
    AlertStore, AlertUpsert, ListingRepository, StorageError, UserDirectory,
};

pub const CRATE_NAME: &str = "vigia-scan";

#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub database_url: Option<String>,
    pub listing_base_url: String,
    pub reports_dir: PathBuf,
    pub scheduler_enabled: bool,
    pub scan_cron: String,
    pub wa_api_url: String,
    pub wa_token: Option<String>,
    pub http_timeout_secs: u64,
    pub user_agent: String,
}

impl ScanConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").ok(),
            listing_base_url: std::env::var("VIGIA_LISTING_BASE_URL")
                .unwrap_or_else(|_| "https://vigia.example".to_string()),
            reports_dir: std::env::var("VIGIA_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
            scheduler_enabled: std::env::var("VIGIA_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            scan_cron: std::env::var("SCAN_CRON").unwrap_or_else(|_| "0 7 * * *".to_string()),
            wa_api_url: std::env::var("VIGIA_WA_API_URL").unwrap_or_default(),
            wa_token: std::env::var("VIGIA_WA_TOKEN").ok(),
            http_timeout_secs: std::env::var("VIGIA_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            user_agent: std::env::var("VIGIA_USER_AGENT")
                .unwrap_or_else(|_| "vigia-bot/0.1".to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanAction {
    Created,
    Updated,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanResult {
    pub listing_id: Uuid,
    pub kind: Option<AlertKind>,
    pub action: ScanAction,
    pub notified: bool,
    /// Delivery attempts made for this alert; unreachable recipients are not
    /// counted.
    pub deliveries: usize,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub listings_scanned: usize,
    pub alerts_processed: usize,
    pub results: Vec<ScanResult>,
}

/// One pass over the available listings. Safe to re-run at any time: the
/// keyed upsert refreshes instead of duplicating, and an alert that was
/// already notified is never delivered again while it stays active.
pub struct AlertScanner {
    listings: Arc<dyn ListingRepository>,
    alerts: Arc<dyn AlertStore>,
    users: Arc<dyn UserDirectory>,
    notifier: Notifier,
    reports_dir: Option<PathBuf>,
}

impl AlertScanner {
    pub fn new(
        listings: Arc<dyn ListingRepository>,
        alerts: Arc<dyn AlertStore>,
        users: Arc<dyn UserDirectory>,
        notifier: Notifier,
    ) -> Self {
        Self {
            listings,
            alerts,
            users,
            notifier,
            reports_dir: None,
        }
    }

    pub fn with_reports_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.reports_dir = Some(dir.into());
        self
    }

    pub async fn run_once(&self) -> Result<ScanSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        let listings = self
            .listings
            .available_listings()
            .await
            .context("reading available listings")?;

        let mut results = Vec::new();
        let mut alerts_processed = 0usize;
        for listing in &listings {
            match self.process_listing(listing, started_at).await {
                Ok(Some(result)) => {
                    alerts_processed += 1;
                    results.push(result);
                }
                Ok(None) => {}
                Err(err @ StorageError::SchemaMissing(_)) => {
                    return Err(anyhow::Error::new(err).context("alert schema unavailable"));
                }
                Err(err) => {
                    // One bad row must not abort the whole batch.
                    warn!(listing_id = %listing.id, error = %err, "listing skipped after error");
                    results.push(ScanResult {
                        listing_id: listing.id,
                        kind: None,
                        action: ScanAction::Failed,
                        notified: false,
                        deliveries: 0,
                        reason: Some(err.to_string()),
                    });
                }
            }
        }

        let finished_at = Utc::now();
        let summary = ScanSummary {
            run_id,
            started_at,
            finished_at,
            listings_scanned: listings.len(),
            alerts_processed,
            results,
        };
        info!(
            run_id = %run_id,
            listings = summary.listings_scanned,
            alerts = summary.alerts_processed,
            "scan finished"
        );

        if let Some(dir) = &self.reports_dir {
            write_report(dir, &summary).await.context("writing scan report")?;
        }
        Ok(summary)
    }

    async fn process_listing(
        &self,
        listing: &Listing,
        now: DateTime<Utc>,
    ) -> Result<Option<ScanResult>, StorageError> {
        let Some(verdict) = classify(listing, now) else {
            return Ok(None);
        };

        let candidate = Alert {
            id: Uuid::new_v4(),
            listing_id: listing.id,
            owner_id: listing.owner_id,
            kind: verdict.kind,
            title: render_alert_title(&listing.title, verdict.kind, verdict.days_inactive),
            description: render_alert_description(
                &listing.title,
                verdict.kind,
                verdict.days_inactive,
            ),
            days_inactive: verdict.days_inactive,
            state: AlertState::Active,
            notified_at: None,
            created_at: now,
            updated_at: now,
            resolved_at: None,
            resolved_by_action: None,
        };

        let upsert = self.alerts.upsert_active(candidate).await?;
        let action = match &upsert {
            AlertUpsert::Created(_) => ScanAction::Created,
            AlertUpsert::Refreshed(_) => ScanAction::Updated,
        };
        let alert = upsert.alert().clone();

        if alert.notified_at.is_some() {
            return Ok(Some(ScanResult {
                listing_id: listing.id,
                kind: Some(alert.kind),
                action,
                notified: false,
                deliveries: 0,
                reason: Some("already_notified".to_string()),
            }));
        }

        let directory = self.users.active_accounts().await?;
        let recipients = resolve_recipients(listing.owner_id, listing.owner_role, &directory);
        let owner_name = match self.users.find_account(listing.owner_id).await? {
            Some(account) => account.name,
            None => "sin asignar".to_string(),
        };

        let deliveries = self
            .notifier
            .notify_alert(&alert, listing, &owner_name, &recipients)
            .await?;
        // Stamped even when individual deliveries failed: one notification
        // pass per active lifetime, attempts are not retried.
        self.alerts.mark_notified(alert.id, Utc::now()).await?;

        let attempted = deliveries
            .iter()
            .filter(|d| d.disposition != DeliveryDisposition::SkippedNoPhone)
            .count();
        Ok(Some(ScanResult {
            listing_id: listing.id,
            kind: Some(alert.kind),
            action,
            notified: true,
            deliveries: attempted,
            reason: None,
        }))
    }
}

/// Close an alert on behalf of a user action. The scanner never resolves
/// alerts; this is the only transition out of the active state.
pub async fn resolve_alert(
    alerts: &dyn AlertStore,
    listings: &dyn ListingRepository,
    alert_id: Uuid,
    listing_id: Uuid,
    action: ResolveAction,
) -> Result<Alert, StorageError> {
    let alert = alerts
        .find_alert(alert_id)
        .await?
        .ok_or(StorageError::AlertNotFound(alert_id))?;
    if alert.listing_id != listing_id {
        return Err(StorageError::ListingMismatch {
            alert_id,
            listing_id,
        });
    }

    let resolved = alerts.resolve(alert_id, action, Utc::now()).await?;
    match action {
        ResolveAction::Rented => {
            listings
                .set_listing_status(listing_id, ListingStatus::Rented)
                .await?;
        }
        ResolveAction::Sold => {
            listings
                .set_listing_status(listing_id, ListingStatus::Sold)
                .await?;
        }
        ResolveAction::Edited => {}
    }
    info!(alert_id = %alert_id, action = action.as_str(), "alert resolved");
    Ok(resolved)
}

async fn write_report(reports_dir: &Path, summary: &ScanSummary) -> Result<()> {
    let run_dir = reports_dir.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;
    let bytes = serde_json::to_vec_pretty(summary).context("serializing scan summary")?;
    fs::write(run_dir.join("scan_summary.json"), bytes)
        .await
        .context("writing scan_summary.json")?;
    Ok(())
}

pub async fn maybe_build_scheduler(
    scanner: Arc<AlertScanner>,
    config: &ScanConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.scan_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let scanner = scanner.clone();
        Box::pin(async move {
            match scanner.run_once().await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    alerts = summary.alerts_processed,
                    "scheduled scan finished"
                ),
                Err(err) => warn!(error = %err, "scheduled scan failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Duration;
    use std::collections::HashSet;
    use tokio::sync::Mutex;
    use vigia_core::{AlertKind, OperationType, Role, UserAccount};
    use vigia_notify::{GatewayError, MessageGateway};
    use vigia_storage::{MemoryStore, NotificationLog};

    #[derive(Default)]
    struct RecordingGateway {
        sent: Mutex<Vec<String>>,
        fail_numbers: HashSet<String>,
    }

    #[async_trait]
    impl MessageGateway for RecordingGateway {
        async fn send_text(&self, phone_number: &str, _body: &str) -> Result<(), GatewayError> {
            if self.fail_numbers.contains(phone_number) {
                return Err(GatewayError::Timeout);
            }
            self.sent.lock().await.push(phone_number.to_string());
            Ok(())
        }
    }

    fn listing(operation_type: OperationType, age_days: i64, owner_id: Uuid) -> Listing {
        Listing {
            id: Uuid::new_v4(),
            title: "Departamento Roma Norte".into(),
            operation_type,
            status: vigia_core::ListingStatus::Available,
            owner_id,
            owner_role: Some(Role::Advisor),
            created_at: Utc::now() - Duration::days(age_days),
            last_sale_at: None,
            last_rental_at: None,
        }
    }

    fn account(name: &str, role: Role, whatsapp: Option<&str>) -> UserAccount {
        UserAccount {
            id: Uuid::new_v4(),
            name: name.into(),
            role,
            whatsapp: whatsapp.map(str::to_string),
            phone: None,
            is_active: true,
        }
    }

    fn scanner_for(store: &Arc<MemoryStore>, gateway: &Arc<RecordingGateway>) -> AlertScanner {
        let notifier = Notifier::new(
            gateway.clone(),
            store.clone(),
            "https://inmuebles.example".into(),
        );
        AlertScanner::new(store.clone(), store.clone(), store.clone(), notifier)
    }

    #[tokio::test]
    async fn stale_rental_creates_alert_and_fans_out() {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(RecordingGateway::default());
        let owner = account("Luis", Role::Advisor, Some("+5215550000010"));
        let admin = account("Ana", Role::Admin, Some("+5215550000011"));
        let boss = account("Marta", Role::Management, Some("+5215550000012"));
        store.seed_account(owner.clone()).await;
        store.seed_account(admin).await;
        store.seed_account(boss).await;
        let l = listing(OperationType::Rental, 60, owner.id);
        store.seed_listing(l.clone()).await;

        let scanner = scanner_for(&store, &gateway);
        let summary = scanner.run_once().await.unwrap();

        assert_eq!(summary.listings_scanned, 1);
        assert_eq!(summary.alerts_processed, 1);
        let result = &summary.results[0];
        assert_eq!(result.action, ScanAction::Created);
        assert_eq!(result.kind, Some(AlertKind::NotRented30d));
        assert!(result.notified);
        assert_eq!(result.deliveries, 3);

        let alert = store
            .find_active(l.id, AlertKind::NotRented30d)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(alert.days_inactive, 60);
        assert!(alert.notified_at.is_some());
        assert_eq!(store.entries_for_alert(alert.id).await.unwrap().len(), 3);
        assert_eq!(gateway.sent.lock().await.len(), 3);
    }

    #[tokio::test]
    async fn rescan_refreshes_without_redelivering() {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(RecordingGateway::default());
        let owner = account("Luis", Role::Advisor, Some("+5215550000010"));
        store.seed_account(owner.clone()).await;
        let l = listing(OperationType::Rental, 60, owner.id);
        store.seed_listing(l.clone()).await;

        let scanner = scanner_for(&store, &gateway);
        let first = scanner.run_once().await.unwrap();
        assert_eq!(first.results[0].action, ScanAction::Created);

        let second = scanner.run_once().await.unwrap();
        assert_eq!(second.alerts_processed, 1);
        let result = &second.results[0];
        assert_eq!(result.action, ScanAction::Updated);
        assert!(!result.notified);
        assert_eq!(result.reason.as_deref(), Some("already_notified"));

        // Still exactly one active alert and one batch of log rows.
        let alert = store
            .find_active(l.id, AlertKind::NotRented30d)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(store.entries_for_alert(alert.id).await.unwrap().len(), 1);
        assert_eq!(gateway.sent.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn fresh_listings_are_left_alone() {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(RecordingGateway::default());
        let owner = account("Luis", Role::Advisor, Some("+5215550000010"));
        store.seed_account(owner.clone()).await;
        store
            .seed_listing(listing(OperationType::Rental, 20, owner.id))
            .await;

        let scanner = scanner_for(&store, &gateway);
        let summary = scanner.run_once().await.unwrap();

        assert_eq!(summary.listings_scanned, 1);
        assert_eq!(summary.alerts_processed, 0);
        assert!(summary.results.is_empty());
        assert!(gateway.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn unreachable_recipient_does_not_fail_the_scan() {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(RecordingGateway::default());
        let owner = account("Luis", Role::Advisor, Some("+5215550000010"));
        let unreachable = account("Ana", Role::Admin, None);
        store.seed_account(owner.clone()).await;
        store.seed_account(unreachable.clone()).await;
        let l = listing(OperationType::Rental, 45, owner.id);
        store.seed_listing(l.clone()).await;

        let scanner = scanner_for(&store, &gateway);
        let summary = scanner.run_once().await.unwrap();

        let result = &summary.results[0];
        assert!(result.notified);
        assert_eq!(result.deliveries, 1);

        let alert = store
            .find_active(l.id, AlertKind::NotRented30d)
            .await
            .unwrap()
            .unwrap();
        let entries = store.entries_for_alert(alert.id).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries.iter().all(|e| e.recipient_id != unreachable.id));
    }

    #[tokio::test]
    async fn gateway_failure_still_stamps_notified_at() {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(RecordingGateway {
            fail_numbers: HashSet::from(["+5215550000010".to_string()]),
            ..Default::default()
        });
        let owner = account("Luis", Role::Advisor, Some("+5215550000010"));
        store.seed_account(owner.clone()).await;
        let l = listing(OperationType::Sale, 75, owner.id);
        store.seed_listing(l.clone()).await;

        let scanner = scanner_for(&store, &gateway);
        let summary = scanner.run_once().await.unwrap();
        assert_eq!(summary.alerts_processed, 1);

        let alert = store
            .find_active(l.id, AlertKind::NotSold60d)
            .await
            .unwrap()
            .unwrap();
        assert!(alert.notified_at.is_some());
        let entries = store.entries_for_alert(alert.id).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, vigia_core::DeliveryStatus::Failed);
    }

    #[tokio::test]
    async fn resolving_closes_one_alert_and_updates_the_listing() {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(RecordingGateway::default());
        let owner = account("Luis", Role::Advisor, Some("+5215550000010"));
        store.seed_account(owner.clone()).await;
        let l = listing(OperationType::Both, 70, owner.id);
        store.seed_listing(l.clone()).await;

        let scanner = scanner_for(&store, &gateway);
        scanner.run_once().await.unwrap();
        let alert = store
            .find_active(l.id, AlertKind::NotSold60d)
            .await
            .unwrap()
            .unwrap();

        let resolved = resolve_alert(
            store.as_ref(),
            store.as_ref(),
            alert.id,
            l.id,
            ResolveAction::Sold,
        )
        .await
        .unwrap();
        assert_eq!(resolved.state, AlertState::Resolved);
        assert_eq!(resolved.resolved_by_action, Some(ResolveAction::Sold));

        let updated = store.find_listing(l.id).await.unwrap().unwrap();
        assert_eq!(updated.status, ListingStatus::Sold);

        let err = resolve_alert(
            store.as_ref(),
            store.as_ref(),
            alert.id,
            l.id,
            ResolveAction::Edited,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, StorageError::AlertNotActive(_)));
    }

    #[tokio::test]
    async fn resolving_with_the_wrong_listing_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(RecordingGateway::default());
        let owner = account("Luis", Role::Advisor, Some("+5215550000010"));
        store.seed_account(owner.clone()).await;
        let l = listing(OperationType::Rental, 45, owner.id);
        store.seed_listing(l.clone()).await;

        let scanner = scanner_for(&store, &gateway);
        scanner.run_once().await.unwrap();
        let alert = store
            .find_active(l.id, AlertKind::NotRented30d)
            .await
            .unwrap()
            .unwrap();

        let err = resolve_alert(
            store.as_ref(),
            store.as_ref(),
            alert.id,
            Uuid::new_v4(),
            ResolveAction::Edited,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, StorageError::ListingMismatch { .. }));
        assert!(store
            .find_active(l.id, AlertKind::NotRented30d)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn scan_writes_a_run_report() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(RecordingGateway::default());
        let owner = account("Luis", Role::Advisor, Some("+5215550000010"));
        store.seed_account(owner.clone()).await;
        store
            .seed_listing(listing(OperationType::Rental, 45, owner.id))
            .await;

        let notifier = Notifier::new(
            gateway.clone(),
            store.clone(),
            "https://inmuebles.example".into(),
        );
        let scanner = AlertScanner::new(store.clone(), store.clone(), store.clone(), notifier)
            .with_reports_dir(dir.path());
        let summary = scanner.run_once().await.unwrap();

        let report_path = dir
            .path()
            .join(summary.run_id.to_string())
            .join("scan_summary.json");
        let raw = std::fs::read_to_string(&report_path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["alerts_processed"], 1);
    }
}
