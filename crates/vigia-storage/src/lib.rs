//! Persistence contracts and stores for Vigia.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use vigia_core::{
    Alert, AlertKind, AlertState, DecisionError, DeliveryStatus, Listing, ListingStatus,
    NotificationLogEntry, OperationType, PermissionDecision, PermissionRequest, RequestStatus,
    RequestType, ResolveAction, Role, UserAccount,
};

pub const CRATE_NAME: &str = "vigia-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("alert schema missing or uninitialized: {0}")]
    SchemaMissing(String),
    #[error("alert {0} not found")]
    AlertNotFound(Uuid),
    #[error("alert {0} is not active")]
    AlertNotActive(Uuid),
    #[error("alert {alert_id} does not belong to listing {listing_id}")]
    ListingMismatch { alert_id: Uuid, listing_id: Uuid },
    #[error("listing {0} not found")]
    ListingNotFound(Uuid),
    #[error("permission request {0} not found")]
    RequestNotFound(Uuid),
    #[error(transparent)]
    Decision(#[from] DecisionError),
    #[error("malformed row: {0}")]
    MalformedRow(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Outcome of the keyed upsert on the active `(listing_id, kind)` slot.
#[derive(Debug, Clone)]
pub enum AlertUpsert {
    Created(Alert),
    Refreshed(Alert),
}

impl AlertUpsert {
    pub fn alert(&self) -> &Alert {
        match self {
            Self::Created(alert) | Self::Refreshed(alert) => alert,
        }
    }
}

#[async_trait]
pub trait ListingRepository: Send + Sync {
    async fn available_listings(&self) -> Result<Vec<Listing>, StorageError>;
    async fn find_listing(&self, id: Uuid) -> Result<Option<Listing>, StorageError>;
    async fn set_listing_status(&self, id: Uuid, status: ListingStatus)
        -> Result<(), StorageError>;
}

#[async_trait]
pub trait AlertStore: Send + Sync {
    async fn find_alert(&self, id: Uuid) -> Result<Option<Alert>, StorageError>;
    async fn find_active(
        &self,
        listing_id: Uuid,
        kind: AlertKind,
    ) -> Result<Option<Alert>, StorageError>;

    /// Insert the candidate, or refresh the existing active alert for the same
    /// `(listing_id, kind)` in place. Refreshing touches `days_inactive`,
    /// `title`, `description` and `updated_at` only; `notified_at` survives.
    async fn upsert_active(&self, candidate: Alert) -> Result<AlertUpsert, StorageError>;

    /// Stamp `notified_at` if and only if it is still unset.
    async fn mark_notified(&self, alert_id: Uuid, at: DateTime<Utc>)
        -> Result<(), StorageError>;

    async fn resolve(
        &self,
        alert_id: Uuid,
        action: ResolveAction,
        at: DateTime<Utc>,
    ) -> Result<Alert, StorageError>;

    /// Active alerts visible to the account: advisors see their own, admin and
    /// management see all.
    async fn alerts_for_user(&self, user_id: Uuid, role: Role)
        -> Result<Vec<Alert>, StorageError>;
}

#[async_trait]
pub trait NotificationLog: Send + Sync {
    async fn append(&self, entry: NotificationLogEntry) -> Result<(), StorageError>;
    async fn entries_for_alert(
        &self,
        alert_id: Uuid,
    ) -> Result<Vec<NotificationLogEntry>, StorageError>;
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_account(&self, id: Uuid) -> Result<Option<UserAccount>, StorageError>;
    async fn active_accounts(&self) -> Result<Vec<UserAccount>, StorageError>;
}

#[async_trait]
pub trait PermissionStore: Send + Sync {
    async fn create_request(
        &self,
        request: PermissionRequest,
    ) -> Result<PermissionRequest, StorageError>;
    async fn find_request(&self, id: Uuid) -> Result<Option<PermissionRequest>, StorageError>;
    async fn requests_by_status(
        &self,
        status: Option<RequestStatus>,
    ) -> Result<Vec<PermissionRequest>, StorageError>;
    async fn decide_request(
        &self,
        id: Uuid,
        reviewer_id: Uuid,
        decision: PermissionDecision,
        at: DateTime<Utc>,
    ) -> Result<PermissionRequest, StorageError>;
}

#[derive(Default)]
struct MemoryInner {
    listings: HashMap<Uuid, Listing>,
    alerts: HashMap<Uuid, Alert>,
    log: Vec<NotificationLogEntry>,
    accounts: HashMap<Uuid, UserAccount>,
    requests: HashMap<Uuid, PermissionRequest>,
}

/// Single-process store backing tests and DB-less runs. All five contracts
/// behind one lock; every operation is a short critical section.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed_listing(&self, listing: Listing) {
        self.inner.lock().await.listings.insert(listing.id, listing);
    }

    pub async fn seed_account(&self, account: UserAccount) {
        self.inner.lock().await.accounts.insert(account.id, account);
    }
}

#[async_trait]
impl ListingRepository for MemoryStore {
    async fn available_listings(&self) -> Result<Vec<Listing>, StorageError> {
        let inner = self.inner.lock().await;
        let mut listings: Vec<Listing> = inner
            .listings
            .values()
            .filter(|l| l.status == ListingStatus::Available)
            .cloned()
            .collect();
        listings.sort_by_key(|l| l.created_at);
        Ok(listings)
    }

    async fn find_listing(&self, id: Uuid) -> Result<Option<Listing>, StorageError> {
        Ok(self.inner.lock().await.listings.get(&id).cloned())
    }

    async fn set_listing_status(
        &self,
        id: Uuid,
        status: ListingStatus,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        match inner.listings.get_mut(&id) {
            Some(listing) => {
                listing.status = status;
                Ok(())
            }
            None => Err(StorageError::ListingNotFound(id)),
        }
    }
}

#[async_trait]
impl AlertStore for MemoryStore {
    async fn find_alert(&self, id: Uuid) -> Result<Option<Alert>, StorageError> {
        Ok(self.inner.lock().await.alerts.get(&id).cloned())
    }

    async fn find_active(
        &self,
        listing_id: Uuid,
        kind: AlertKind,
    ) -> Result<Option<Alert>, StorageError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .alerts
            .values()
            .find(|a| {
                a.state == AlertState::Active && a.listing_id == listing_id && a.kind == kind
            })
            .cloned())
    }

    async fn upsert_active(&self, candidate: Alert) -> Result<AlertUpsert, StorageError> {
        let mut inner = self.inner.lock().await;
        let existing = inner
            .alerts
            .values()
            .find(|a| {
                a.state == AlertState::Active
                    && a.listing_id == candidate.listing_id
                    && a.kind == candidate.kind
            })
            .map(|a| a.id);
        if let Some(id) = existing {
            if let Some(alert) = inner.alerts.get_mut(&id) {
                alert.days_inactive = candidate.days_inactive;
                alert.title = candidate.title;
                alert.description = candidate.description;
                alert.updated_at = candidate.updated_at;
                return Ok(AlertUpsert::Refreshed(alert.clone()));
            }
        }
        inner.alerts.insert(candidate.id, candidate.clone());
        Ok(AlertUpsert::Created(candidate))
    }

    async fn mark_notified(
        &self,
        alert_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        match inner.alerts.get_mut(&alert_id) {
            Some(alert) => {
                if alert.notified_at.is_none() {
                    alert.notified_at = Some(at);
                }
                Ok(())
            }
            None => Err(StorageError::AlertNotFound(alert_id)),
        }
    }

    async fn resolve(
        &self,
        alert_id: Uuid,
        action: ResolveAction,
        at: DateTime<Utc>,
    ) -> Result<Alert, StorageError> {
        let mut inner = self.inner.lock().await;
        match inner.alerts.get_mut(&alert_id) {
            Some(alert) => {
                alert
                    .resolve(action, at)
                    .map_err(|_| StorageError::AlertNotActive(alert_id))?;
                Ok(alert.clone())
            }
            None => Err(StorageError::AlertNotFound(alert_id)),
        }
    }

    async fn alerts_for_user(
        &self,
        user_id: Uuid,
        role: Role,
    ) -> Result<Vec<Alert>, StorageError> {
        let inner = self.inner.lock().await;
        let mut alerts: Vec<Alert> = inner
            .alerts
            .values()
            .filter(|a| a.state == AlertState::Active)
            .filter(|a| match role {
                Role::Advisor => a.owner_id == user_id,
                Role::Admin | Role::Management => true,
            })
            .cloned()
            .collect();
        alerts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(alerts)
    }
}

#[async_trait]
impl NotificationLog for MemoryStore {
    async fn append(&self, entry: NotificationLogEntry) -> Result<(), StorageError> {
        self.inner.lock().await.log.push(entry);
        Ok(())
    }

    async fn entries_for_alert(
        &self,
        alert_id: Uuid,
    ) -> Result<Vec<NotificationLogEntry>, StorageError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .log
            .iter()
            .filter(|e| e.alert_id == alert_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl UserDirectory for MemoryStore {
    async fn find_account(&self, id: Uuid) -> Result<Option<UserAccount>, StorageError> {
        Ok(self.inner.lock().await.accounts.get(&id).cloned())
    }

    async fn active_accounts(&self) -> Result<Vec<UserAccount>, StorageError> {
        let inner = self.inner.lock().await;
        let mut accounts: Vec<UserAccount> = inner
            .accounts
            .values()
            .filter(|a| a.is_active)
            .cloned()
            .collect();
        accounts.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(accounts)
    }
}

#[async_trait]
impl PermissionStore for MemoryStore {
    async fn create_request(
        &self,
        request: PermissionRequest,
    ) -> Result<PermissionRequest, StorageError> {
        self.inner
            .lock()
            .await
            .requests
            .insert(request.id, request.clone());
        Ok(request)
    }

    async fn find_request(&self, id: Uuid) -> Result<Option<PermissionRequest>, StorageError> {
        Ok(self.inner.lock().await.requests.get(&id).cloned())
    }

    async fn requests_by_status(
        &self,
        status: Option<RequestStatus>,
    ) -> Result<Vec<PermissionRequest>, StorageError> {
        let inner = self.inner.lock().await;
        let mut requests: Vec<PermissionRequest> = inner
            .requests
            .values()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .cloned()
            .collect();
        requests.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(requests)
    }

    async fn decide_request(
        &self,
        id: Uuid,
        reviewer_id: Uuid,
        decision: PermissionDecision,
        at: DateTime<Utc>,
    ) -> Result<PermissionRequest, StorageError> {
        let mut inner = self.inner.lock().await;
        match inner.requests.get_mut(&id) {
            Some(request) => {
                request.apply_decision(reviewer_id, decision, at)?;
                Ok(request.clone())
            }
            None => Err(StorageError::RequestNotFound(id)),
        }
    }
}

/// Postgres-backed store. Runtime queries only; the schema lives in
/// `migrations/` and the partial unique index on
/// `alerts (listing_id, kind) WHERE state = 'active'` makes concurrent scans
/// converge on one row instead of inserting duplicates.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// An undefined table is a deployment problem, not a query problem; surface it
/// as the configuration error the scan aborts on.
fn map_db_err(err: sqlx::Error) -> StorageError {
    if let sqlx::Error::Database(db) = &err {
        if db.code().as_deref() == Some("42P01") {
            return StorageError::SchemaMissing(db.message().to_string());
        }
    }
    StorageError::Database(err)
}

fn parse_field<T>(
    raw: &str,
    field: &'static str,
    parse: fn(&str) -> Option<T>,
) -> Result<T, StorageError> {
    parse(raw).ok_or_else(|| {
        StorageError::MalformedRow(format!("unrecognized {field} value: {raw}"))
    })
}

fn listing_from_row(row: &PgRow) -> Result<Listing, StorageError> {
    let operation_type: String = row.try_get("operation_type")?;
    let status: String = row.try_get("status")?;
    let owner_role: Option<String> = row.try_get("owner_role")?;
    Ok(Listing {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        operation_type: parse_field(&operation_type, "operation_type", OperationType::parse)?,
        status: parse_field(&status, "status", ListingStatus::parse)?,
        owner_id: row.try_get("owner_id")?,
        owner_role: owner_role.as_deref().and_then(Role::parse),
        created_at: row.try_get("created_at")?,
        last_sale_at: row.try_get("last_sale_at")?,
        last_rental_at: row.try_get("last_rental_at")?,
    })
}

fn alert_from_row(row: &PgRow) -> Result<Alert, StorageError> {
    let kind: String = row.try_get("kind")?;
    let state: String = row.try_get("state")?;
    let resolved_by_action: Option<String> = row.try_get("resolved_by_action")?;
    Ok(Alert {
        id: row.try_get("id")?,
        listing_id: row.try_get("listing_id")?,
        owner_id: row.try_get("owner_id")?,
        kind: parse_field(&kind, "kind", AlertKind::parse)?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        days_inactive: row.try_get("days_inactive")?,
        state: parse_field(&state, "state", AlertState::parse)?,
        notified_at: row.try_get("notified_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        resolved_at: row.try_get("resolved_at")?,
        resolved_by_action: match resolved_by_action {
            Some(raw) => Some(parse_field(&raw, "resolved_by_action", ResolveAction::parse)?),
            None => None,
        },
    })
}

fn account_from_row(row: &PgRow) -> Result<UserAccount, StorageError> {
    let id: Uuid = row.try_get("id")?;
    let role: String = row.try_get("role")?;
    // Unknown directory roles degrade to the broadest audience tier instead of
    // failing the whole scan.
    let role = Role::parse(&role).unwrap_or_else(|| {
        warn!(account_id = %id, role = %role, "unrecognized account role, treating as advisor");
        Role::Advisor
    });
    Ok(UserAccount {
        id,
        name: row.try_get("name")?,
        role,
        whatsapp: row.try_get("whatsapp")?,
        phone: row.try_get("phone")?,
        is_active: row.try_get("is_active")?,
    })
}

fn request_from_row(row: &PgRow) -> Result<PermissionRequest, StorageError> {
    let request_type: String = row.try_get("request_type")?;
    let status: String = row.try_get("status")?;
    Ok(PermissionRequest {
        id: row.try_get("id")?,
        listing_id: row.try_get("listing_id")?,
        requester_id: row.try_get("requester_id")?,
        request_type: parse_field(&request_type, "request_type", RequestType::parse)?,
        status: parse_field(&status, "status", RequestStatus::parse)?,
        justification: row.try_get("justification")?,
        reviewer_id: row.try_get("reviewer_id")?,
        review_date: row.try_get("review_date")?,
        admin_notes: row.try_get("admin_notes")?,
        rejection_reason: row.try_get("rejection_reason")?,
        created_at: row.try_get("created_at")?,
    })
}

fn log_entry_from_row(row: &PgRow) -> Result<NotificationLogEntry, StorageError> {
    let recipient_role: String = row.try_get("recipient_role")?;
    let status: String = row.try_get("status")?;
    Ok(NotificationLogEntry {
        id: row.try_get("id")?,
        alert_id: row.try_get("alert_id")?,
        recipient_id: row.try_get("recipient_id")?,
        recipient_role: parse_field(&recipient_role, "recipient_role", Role::parse)?,
        phone_number: row.try_get("phone_number")?,
        message: row.try_get("message")?,
        status: parse_field(&status, "status", DeliveryStatus::parse)?,
        error_message: row.try_get("error_message")?,
        sent_at: row.try_get("sent_at")?,
        created_at: row.try_get("created_at")?,
    })
}

const ALERT_COLUMNS: &str = "id, listing_id, owner_id, kind, title, description, days_inactive, \
                             state, notified_at, created_at, updated_at, resolved_at, \
                             resolved_by_action";

#[async_trait]
impl ListingRepository for PgStore {
    async fn available_listings(&self) -> Result<Vec<Listing>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT id, title, operation_type, status, owner_id, owner_role,
                   created_at, last_sale_at, last_rental_at
              FROM listings
             WHERE status = 'available'
             ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_err)?;
        rows.iter().map(listing_from_row).collect()
    }

    async fn find_listing(&self, id: Uuid) -> Result<Option<Listing>, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT id, title, operation_type, status, owner_id, owner_role,
                   created_at, last_sale_at, last_rental_at
              FROM listings
             WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_err)?;
        row.as_ref().map(listing_from_row).transpose()
    }

    async fn set_listing_status(
        &self,
        id: Uuid,
        status: ListingStatus,
    ) -> Result<(), StorageError> {
        let result = sqlx::query("UPDATE listings SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await
            .map_err(map_db_err)?;
        if result.rows_affected() == 0 {
            return Err(StorageError::ListingNotFound(id));
        }
        Ok(())
    }
}

#[async_trait]
impl AlertStore for PgStore {
    async fn find_alert(&self, id: Uuid) -> Result<Option<Alert>, StorageError> {
        let row = sqlx::query(&format!("SELECT {ALERT_COLUMNS} FROM alerts WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_err)?;
        row.as_ref().map(alert_from_row).transpose()
    }

    async fn find_active(
        &self,
        listing_id: Uuid,
        kind: AlertKind,
    ) -> Result<Option<Alert>, StorageError> {
        let row = sqlx::query(&format!(
            "SELECT {ALERT_COLUMNS} FROM alerts \
             WHERE listing_id = $1 AND kind = $2 AND state = 'active'"
        ))
        .bind(listing_id)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_err)?;
        row.as_ref().map(alert_from_row).transpose()
    }

    async fn upsert_active(&self, candidate: Alert) -> Result<AlertUpsert, StorageError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO alerts (id, listing_id, owner_id, kind, title, description,
                                days_inactive, state, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'active', $8, $8)
            ON CONFLICT (listing_id, kind) WHERE state = 'active'
            DO UPDATE SET days_inactive = EXCLUDED.days_inactive,
                          title = EXCLUDED.title,
                          description = EXCLUDED.description,
                          updated_at = EXCLUDED.updated_at
            RETURNING {ALERT_COLUMNS}, (xmax = 0) AS inserted
            "#
        ))
        .bind(candidate.id)
        .bind(candidate.listing_id)
        .bind(candidate.owner_id)
        .bind(candidate.kind.as_str())
        .bind(&candidate.title)
        .bind(&candidate.description)
        .bind(candidate.days_inactive)
        .bind(candidate.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(map_db_err)?;

        let inserted: bool = row.try_get("inserted")?;
        let alert = alert_from_row(&row)?;
        Ok(if inserted {
            AlertUpsert::Created(alert)
        } else {
            AlertUpsert::Refreshed(alert)
        })
    }

    async fn mark_notified(
        &self,
        alert_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let result =
            sqlx::query("UPDATE alerts SET notified_at = COALESCE(notified_at, $2) WHERE id = $1")
                .bind(alert_id)
                .bind(at)
                .execute(&self.pool)
                .await
                .map_err(map_db_err)?;
        if result.rows_affected() == 0 {
            return Err(StorageError::AlertNotFound(alert_id));
        }
        Ok(())
    }

    async fn resolve(
        &self,
        alert_id: Uuid,
        action: ResolveAction,
        at: DateTime<Utc>,
    ) -> Result<Alert, StorageError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE alerts
               SET state = 'resolved',
                   resolved_at = $2,
                   resolved_by_action = $3,
                   updated_at = $2
             WHERE id = $1
               AND state = 'active'
            RETURNING {ALERT_COLUMNS}
            "#
        ))
        .bind(alert_id)
        .bind(at)
        .bind(action.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_err)?;

        match row {
            Some(row) => alert_from_row(&row),
            None => match self.find_alert(alert_id).await? {
                Some(_) => Err(StorageError::AlertNotActive(alert_id)),
                None => Err(StorageError::AlertNotFound(alert_id)),
            },
        }
    }

    async fn alerts_for_user(
        &self,
        user_id: Uuid,
        role: Role,
    ) -> Result<Vec<Alert>, StorageError> {
        let rows = match role {
            Role::Advisor => {
                sqlx::query(&format!(
                    "SELECT {ALERT_COLUMNS} FROM alerts \
                     WHERE state = 'active' AND owner_id = $1 \
                     ORDER BY created_at DESC"
                ))
                .bind(user_id)
                .fetch_all(&self.pool)
                .await
            }
            Role::Admin | Role::Management => {
                sqlx::query(&format!(
                    "SELECT {ALERT_COLUMNS} FROM alerts \
                     WHERE state = 'active' \
                     ORDER BY created_at DESC"
                ))
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(map_db_err)?;
        rows.iter().map(alert_from_row).collect()
    }
}

#[async_trait]
impl NotificationLog for PgStore {
    async fn append(&self, entry: NotificationLogEntry) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO notification_log (id, alert_id, recipient_id, recipient_role,
                                          phone_number, message, status, error_message,
                                          sent_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(entry.id)
        .bind(entry.alert_id)
        .bind(entry.recipient_id)
        .bind(entry.recipient_role.as_str())
        .bind(&entry.phone_number)
        .bind(&entry.message)
        .bind(entry.status.as_str())
        .bind(&entry.error_message)
        .bind(entry.sent_at)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_db_err)?;
        Ok(())
    }

    async fn entries_for_alert(
        &self,
        alert_id: Uuid,
    ) -> Result<Vec<NotificationLogEntry>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT id, alert_id, recipient_id, recipient_role, phone_number, message,
                   status, error_message, sent_at, created_at
              FROM notification_log
             WHERE alert_id = $1
             ORDER BY created_at
            "#,
        )
        .bind(alert_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_err)?;
        rows.iter().map(log_entry_from_row).collect()
    }
}

#[async_trait]
impl UserDirectory for PgStore {
    async fn find_account(&self, id: Uuid) -> Result<Option<UserAccount>, StorageError> {
        let row = sqlx::query(
            "SELECT id, name, role, whatsapp, phone, is_active FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_err)?;
        row.as_ref().map(account_from_row).transpose()
    }

    async fn active_accounts(&self) -> Result<Vec<UserAccount>, StorageError> {
        let rows = sqlx::query(
            "SELECT id, name, role, whatsapp, phone, is_active FROM users \
             WHERE is_active ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_err)?;
        rows.iter().map(account_from_row).collect()
    }
}

#[async_trait]
impl PermissionStore for PgStore {
    async fn create_request(
        &self,
        request: PermissionRequest,
    ) -> Result<PermissionRequest, StorageError> {
        sqlx::query(
            r#"
            INSERT INTO permission_requests (id, listing_id, requester_id, request_type,
                                             status, justification, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(request.id)
        .bind(request.listing_id)
        .bind(request.requester_id)
        .bind(request.request_type.as_str())
        .bind(request.status.as_str())
        .bind(&request.justification)
        .bind(request.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_db_err)?;
        Ok(request)
    }

    async fn find_request(&self, id: Uuid) -> Result<Option<PermissionRequest>, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT id, listing_id, requester_id, request_type, status, justification,
                   reviewer_id, review_date, admin_notes, rejection_reason, created_at
              FROM permission_requests
             WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_err)?;
        row.as_ref().map(request_from_row).transpose()
    }

    async fn requests_by_status(
        &self,
        status: Option<RequestStatus>,
    ) -> Result<Vec<PermissionRequest>, StorageError> {
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    r#"
                    SELECT id, listing_id, requester_id, request_type, status, justification,
                           reviewer_id, review_date, admin_notes, rejection_reason, created_at
                      FROM permission_requests
                     WHERE status = $1
                     ORDER BY created_at DESC
                    "#,
                )
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT id, listing_id, requester_id, request_type, status, justification,
                           reviewer_id, review_date, admin_notes, rejection_reason, created_at
                      FROM permission_requests
                     ORDER BY created_at DESC
                    "#,
                )
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(map_db_err)?;
        rows.iter().map(request_from_row).collect()
    }

    async fn decide_request(
        &self,
        id: Uuid,
        reviewer_id: Uuid,
        decision: PermissionDecision,
        at: DateTime<Utc>,
    ) -> Result<PermissionRequest, StorageError> {
        let mut request = self
            .find_request(id)
            .await?
            .ok_or(StorageError::RequestNotFound(id))?;
        request.apply_decision(reviewer_id, decision, at)?;

        let result = sqlx::query(
            r#"
            UPDATE permission_requests
               SET status = $2,
                   reviewer_id = $3,
                   review_date = $4,
                   admin_notes = $5,
                   rejection_reason = $6
             WHERE id = $1
               AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(request.status.as_str())
        .bind(request.reviewer_id)
        .bind(request.review_date)
        .bind(&request.admin_notes)
        .bind(&request.rejection_reason)
        .execute(&self.pool)
        .await
        .map_err(map_db_err)?;

        // A concurrent reviewer may have won the race between read and write.
        if result.rows_affected() == 0 {
            return Err(StorageError::Decision(DecisionError::AlreadyDecided(id)));
        }
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).single().unwrap()
    }

    fn active_alert(listing_id: Uuid, kind: AlertKind) -> Alert {
        Alert {
            id: Uuid::new_v4(),
            listing_id,
            owner_id: Uuid::new_v4(),
            kind,
            title: "title".into(),
            description: "description".into(),
            days_inactive: 35,
            state: AlertState::Active,
            notified_at: None,
            created_at: now(),
            updated_at: now(),
            resolved_at: None,
            resolved_by_action: None,
        }
    }

    #[tokio::test]
    async fn upsert_refreshes_instead_of_duplicating() {
        let store = MemoryStore::new();
        let listing_id = Uuid::new_v4();

        let first = store
            .upsert_active(active_alert(listing_id, AlertKind::NotRented30d))
            .await
            .unwrap();
        assert!(matches!(first, AlertUpsert::Created(_)));

        let mut second = active_alert(listing_id, AlertKind::NotRented30d);
        second.days_inactive = 36;
        let second = store.upsert_active(second).await.unwrap();
        let AlertUpsert::Refreshed(refreshed) = second else {
            panic!("second upsert should refresh");
        };
        assert_eq!(refreshed.id, first.alert().id);
        assert_eq!(refreshed.days_inactive, 36);

        let active = store
            .find_active(listing_id, AlertKind::NotRented30d)
            .await
            .unwrap();
        assert!(active.is_some());
    }

    #[tokio::test]
    async fn refresh_preserves_notified_at() {
        let store = MemoryStore::new();
        let listing_id = Uuid::new_v4();

        let created = store
            .upsert_active(active_alert(listing_id, AlertKind::NotSold60d))
            .await
            .unwrap();
        store
            .mark_notified(created.alert().id, now())
            .await
            .unwrap();

        let refreshed = store
            .upsert_active(active_alert(listing_id, AlertKind::NotSold60d))
            .await
            .unwrap();
        assert_eq!(refreshed.alert().notified_at, Some(now()));
    }

    #[tokio::test]
    async fn resolving_leaves_sibling_kinds_active() {
        let store = MemoryStore::new();
        let listing_id = Uuid::new_v4();

        let rented = store
            .upsert_active(active_alert(listing_id, AlertKind::NotRented30d))
            .await
            .unwrap();
        let sold = store
            .upsert_active(active_alert(listing_id, AlertKind::NotSold60d))
            .await
            .unwrap();

        store
            .resolve(rented.alert().id, ResolveAction::Rented, now())
            .await
            .unwrap();

        assert!(store
            .find_active(listing_id, AlertKind::NotRented30d)
            .await
            .unwrap()
            .is_none());
        let still_active = store
            .find_active(listing_id, AlertKind::NotSold60d)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(still_active.id, sold.alert().id);

        let err = store
            .resolve(rented.alert().id, ResolveAction::Sold, now())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::AlertNotActive(_)));
    }

    #[tokio::test]
    async fn advisor_scope_excludes_other_owners() {
        let store = MemoryStore::new();
        let mine = active_alert(Uuid::new_v4(), AlertKind::NotRented30d);
        let owner = mine.owner_id;
        let other = active_alert(Uuid::new_v4(), AlertKind::NotRented30d);
        store.upsert_active(mine.clone()).await.unwrap();
        store.upsert_active(other).await.unwrap();

        let visible = store.alerts_for_user(owner, Role::Advisor).await.unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id, mine.id);

        let all = store
            .alerts_for_user(Uuid::new_v4(), Role::Management)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
    }
}
