//! Core domain model and staleness rules for Vigia.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "vigia-core";

/// Days an available rental listing may sit without a rental event before it
/// is flagged.
pub const RENTAL_STALE_DAYS: i64 = 30;

/// Days an available sale listing may sit without a sale event before it is
/// flagged.
pub const SALE_STALE_DAYS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Sale,
    Rental,
    Both,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sale => "sale",
            Self::Rental => "rental",
            Self::Both => "both",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sale" => Some(Self::Sale),
            "rental" => Some(Self::Rental),
            "both" => Some(Self::Both),
            _ => None,
        }
    }

    /// Customer-facing operation label used in outbound messages.
    pub fn label_es(&self) -> &'static str {
        match self {
            Self::Sale => "venta",
            Self::Rental => "renta",
            Self::Both => "venta o renta",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    Available,
    Rented,
    Sold,
    Disabled,
}

impl ListingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Rented => "rented",
            Self::Sold => "sold",
            Self::Disabled => "disabled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "available" => Some(Self::Available),
            "rented" => Some(Self::Rented),
            "sold" => Some(Self::Sold),
            "disabled" => Some(Self::Disabled),
            _ => None,
        }
    }
}

/// Three-tier account hierarchy: advisor < admin < management.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Advisor,
    Admin,
    Management,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Advisor => "advisor",
            Self::Admin => "admin",
            Self::Management => "management",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "advisor" => Some(Self::Advisor),
            "admin" => Some(Self::Admin),
            "management" => Some(Self::Management),
            _ => None,
        }
    }

    pub fn label_es(&self) -> &'static str {
        match self {
            Self::Advisor => "asesor",
            Self::Admin => "administrador",
            Self::Management => "direccion",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    NotRented30d,
    NotSold60d,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotRented30d => "not_rented_30d",
            Self::NotSold60d => "not_sold_60d",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "not_rented_30d" => Some(Self::NotRented30d),
            "not_sold_60d" => Some(Self::NotSold60d),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertState {
    Active,
    Resolved,
}

impl AlertState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Resolved => "resolved",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "resolved" => Some(Self::Resolved),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sent,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sent" => Some(Self::Sent),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// User action that closes an alert. `Edited` acknowledges the listing was
/// reworked without a status change; all three resolve the alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveAction {
    Rented,
    Sold,
    Edited,
}

impl ResolveAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rented => "rented",
            Self::Sold => "sold",
            Self::Edited => "edited",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "rented" => Some(Self::Rented),
            "sold" => Some(Self::Sold),
            "edited" => Some(Self::Edited),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    ReopenToAvailable,
    NewListing,
    Disable,
    Enable,
}

impl RequestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReopenToAvailable => "reopen_to_available",
            Self::NewListing => "new_listing",
            Self::Disable => "disable",
            Self::Enable => "enable",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "reopen_to_available" => Some(Self::ReopenToAvailable),
            "new_listing" => Some(Self::NewListing),
            "disable" => Some(Self::Disable),
            "enable" => Some(Self::Enable),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// Property record as the scanner sees it. Read-only here; listings are
/// mutated by the property-management side of the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: Uuid,
    pub title: String,
    pub operation_type: OperationType,
    pub status: ListingStatus,
    pub owner_id: Uuid,
    /// `None` when the directory carries a role string this service does not
    /// recognize; resolved with the broadest (advisor) audience.
    pub owner_role: Option<Role>,
    pub created_at: DateTime<Utc>,
    pub last_sale_at: Option<DateTime<Utc>>,
    pub last_rental_at: Option<DateTime<Utc>>,
}

/// One detected staleness condition on one listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub listing_id: Uuid,
    pub owner_id: Uuid,
    pub kind: AlertKind,
    pub title: String,
    pub description: String,
    pub days_inactive: i64,
    pub state: AlertState,
    /// Set once per active lifetime; a set value suppresses re-delivery.
    pub notified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by_action: Option<ResolveAction>,
}

impl Alert {
    /// Close the alert. The scanner never calls this; only a user action does.
    pub fn resolve(&mut self, action: ResolveAction, at: DateTime<Utc>) -> Result<(), ResolveError> {
        if self.state != AlertState::Active {
            return Err(ResolveError::NotActive(self.id));
        }
        self.state = AlertState::Resolved;
        self.resolved_at = Some(at);
        self.resolved_by_action = Some(action);
        self.updated_at = at;
        Ok(())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("alert {0} is not active")]
    NotActive(Uuid),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAccount {
    pub id: Uuid,
    pub name: String,
    pub role: Role,
    pub whatsapp: Option<String>,
    pub phone: Option<String>,
    pub is_active: bool,
}

impl UserAccount {
    /// Delivery number for this account, preferring the WhatsApp line.
    pub fn delivery_number(&self) -> Option<&str> {
        self.whatsapp.as_deref().or(self.phone.as_deref())
    }
}

/// One attempted delivery. Append-only; never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationLogEntry {
    pub id: Uuid,
    pub alert_id: Uuid,
    pub recipient_id: Uuid,
    pub recipient_role: Role,
    pub phone_number: String,
    pub message: String,
    pub status: DeliveryStatus,
    pub error_message: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Advisor-filed request gating a listing status change. Terminal states are
/// immutable; a new request must be filed instead of re-reviewing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub id: Uuid,
    pub listing_id: Uuid,
    pub requester_id: Uuid,
    pub request_type: RequestType,
    pub status: RequestStatus,
    pub justification: String,
    pub reviewer_id: Option<Uuid>,
    pub review_date: Option<DateTime<Utc>>,
    pub admin_notes: Option<String>,
    pub rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PermissionRequest {
    pub fn new(
        listing_id: Uuid,
        requester_id: Uuid,
        request_type: RequestType,
        justification: String,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            listing_id,
            requester_id,
            request_type,
            status: RequestStatus::Pending,
            justification,
            reviewer_id: None,
            review_date: None,
            admin_notes: None,
            rejection_reason: None,
            created_at: at,
        }
    }

    /// One-way transition out of `pending`. Rejections carry a reason.
    pub fn apply_decision(
        &mut self,
        reviewer_id: Uuid,
        decision: PermissionDecision,
        at: DateTime<Utc>,
    ) -> Result<(), DecisionError> {
        if self.status != RequestStatus::Pending {
            return Err(DecisionError::AlreadyDecided(self.id));
        }
        match decision {
            PermissionDecision::Approve { admin_notes } => {
                self.status = RequestStatus::Approved;
                self.admin_notes = admin_notes;
            }
            PermissionDecision::Reject { rejection_reason } => {
                if rejection_reason.trim().is_empty() {
                    return Err(DecisionError::EmptyRejectionReason);
                }
                self.status = RequestStatus::Rejected;
                self.rejection_reason = Some(rejection_reason);
            }
        }
        self.reviewer_id = Some(reviewer_id);
        self.review_date = Some(at);
        Ok(())
    }
}

/// Reviewer verdict on a pending request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PermissionDecision {
    Approve { admin_notes: Option<String> },
    Reject { rejection_reason: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecisionError {
    #[error("permission request {0} was already decided")]
    AlreadyDecided(Uuid),
    #[error("a rejection requires a non-empty reason")]
    EmptyRejectionReason,
}

/// Outcome of classifying one listing against the staleness thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaleVerdict {
    pub kind: AlertKind,
    pub days_inactive: i64,
}

/// Days since the listing's last relevant event.
///
/// Combined (`both`) listings always count from creation, even when a sale or
/// rental event is recorded.
pub fn days_inactive(listing: &Listing, now: DateTime<Utc>) -> i64 {
    let since = match listing.operation_type {
        OperationType::Sale => listing.last_sale_at.unwrap_or(listing.created_at),
        OperationType::Rental => listing.last_rental_at.unwrap_or(listing.created_at),
        OperationType::Both => listing.created_at,
    };
    now.signed_duration_since(since).num_days()
}

/// Classify a listing against the fixed thresholds. Returns `None` when the
/// listing is below every threshold; such listings are never touched.
///
/// For `both` listings the sale threshold wins when both are exceeded.
pub fn classify(listing: &Listing, now: DateTime<Utc>) -> Option<StaleVerdict> {
    let days = days_inactive(listing, now);
    let kind = match listing.operation_type {
        OperationType::Rental if days >= RENTAL_STALE_DAYS => AlertKind::NotRented30d,
        OperationType::Sale if days >= SALE_STALE_DAYS => AlertKind::NotSold60d,
        OperationType::Both if days >= SALE_STALE_DAYS => AlertKind::NotSold60d,
        OperationType::Both if days >= RENTAL_STALE_DAYS => AlertKind::NotRented30d,
        _ => return None,
    };
    Some(StaleVerdict {
        kind,
        days_inactive: days,
    })
}

/// Audience for an alert on a listing owned by `owner_id` with `owner_role`.
///
/// advisor -> owner + all admins + all management; admin -> owner + all
/// management; management -> owner only. An unrecognized role takes the
/// advisor rule. Inactive accounts are excluded and the result is de-duplicated
/// by account id. Phone presence is not filtered here; the notifier skips
/// unreachable recipients.
pub fn resolve_recipients(
    owner_id: Uuid,
    owner_role: Option<Role>,
    directory: &[UserAccount],
) -> Vec<UserAccount> {
    let escalation = owner_role.unwrap_or(Role::Advisor);
    let mut out: Vec<UserAccount> = Vec::new();
    let mut push = |account: &UserAccount| {
        if account.is_active && !out.iter().any(|a| a.id == account.id) {
            out.push(account.clone());
        }
    };

    for account in directory {
        if account.id == owner_id {
            push(account);
        }
    }
    for account in directory {
        let escalate = match escalation {
            Role::Advisor => matches!(account.role, Role::Admin | Role::Management),
            Role::Admin => account.role == Role::Management,
            Role::Management => false,
        };
        if escalate {
            push(account);
        }
    }
    out
}
