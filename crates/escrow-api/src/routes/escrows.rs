//! # Escrow Endpoints
//!
//! Escrow lifecycle, release conditions, fund requests and reviews, plus
//! the audit trail of each escrow. Every command requires a resolved
//! [`Actor`] and honours an optional `If-Match` escrow version; every
//! command response carries the escrow as committed.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use escrow_core::{ActorId, ConditionId, DocumentRef, EscrowId, FundRequestId};
use escrow_workflow::{
    AuditEntry, Condition, CreateEscrow, Decision, Escrow, FundRequest, NewFundRequest,
    Participant, Review,
};

use crate::auth::Actor;
use crate::error::AppError;
use crate::extractors::{extract_validated_json, ExpectedVersion, Validate};
use crate::state::AppState;

// ── Request DTOs ────────────────────────────────────────────────────────────

/// A custodian or stakeholder identity with display name.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ParticipantInput {
    pub user_id: String,
    pub name: String,
}

impl Validate for ParticipantInput {
    fn validate(&self) -> Result<(), String> {
        if self.user_id.trim().is_empty() {
            return Err("user_id must not be empty".to_string());
        }
        if self.name.trim().is_empty() {
            return Err("name must not be empty".to_string());
        }
        Ok(())
    }
}

impl ParticipantInput {
    fn into_participant(self) -> Result<Participant, AppError> {
        let user_id = ActorId::new(self.user_id.trim())?;
        Ok(Participant::new(user_id, &self.name)?)
    }
}

/// Request to create an escrow. The caller becomes its custodian.
#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateEscrowRequest {
    pub title: String,
    /// Display name of the custodian (the caller).
    pub custodian_name: String,
    /// ISO 4217 currency code.
    pub currency: String,
    #[serde(default)]
    pub stakeholders: Vec<ParticipantInput>,
}

impl Validate for CreateEscrowRequest {
    fn validate(&self) -> Result<(), String> {
        if self.title.trim().is_empty() {
            return Err("title must not be empty".to_string());
        }
        if self.custodian_name.trim().is_empty() {
            return Err("custodian_name must not be empty".to_string());
        }
        self.stakeholders.iter().try_for_each(Validate::validate)
    }
}

/// Request to fund a DRAFT escrow.
#[derive(Debug, Deserialize, ToSchema)]
pub struct FundEscrowRequest {
    /// Total deposit in minor currency units.
    pub total_amount: i64,
}

impl Validate for FundEscrowRequest {
    fn validate(&self) -> Result<(), String> {
        if self.total_amount <= 0 {
            return Err("total_amount must be greater than 0".to_string());
        }
        Ok(())
    }
}

fn default_required() -> bool {
    true
}

/// Request to attach a release condition.
#[derive(Debug, Deserialize, ToSchema)]
pub struct AddConditionRequest {
    pub description: String,
    /// Whether the condition gates releases. Defaults to true.
    #[serde(default = "default_required")]
    pub required: bool,
}

impl Validate for AddConditionRequest {
    fn validate(&self) -> Result<(), String> {
        if self.description.trim().is_empty() {
            return Err("description must not be empty".to_string());
        }
        Ok(())
    }
}

/// Request to mark a condition met.
#[derive(Debug, Deserialize, ToSchema)]
pub struct MarkConditionMetRequest {
    /// Reference to the supporting document.
    pub evidence_ref: String,
}

impl Validate for MarkConditionMetRequest {
    fn validate(&self) -> Result<(), String> {
        if self.evidence_ref.trim().is_empty() {
            return Err("evidence_ref must not be empty".to_string());
        }
        Ok(())
    }
}

/// Request to release part of the remaining balance.
#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateFundRequestRequest {
    /// Amount in minor currency units.
    pub amount: i64,
    pub reason: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub document_refs: Vec<String>,
}

impl Validate for CreateFundRequestRequest {
    fn validate(&self) -> Result<(), String> {
        if self.amount <= 0 {
            return Err("amount must be greater than 0".to_string());
        }
        if self.reason.trim().is_empty() {
            return Err("reason must not be empty".to_string());
        }
        Ok(())
    }
}

/// Reviewer decision as accepted on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionInput {
    Pending,
    Approved,
    Rejected,
}

impl From<DecisionInput> for Decision {
    fn from(d: DecisionInput) -> Self {
        match d {
            DecisionInput::Pending => Decision::Pending,
            DecisionInput::Approved => Decision::Approved,
            DecisionInput::Rejected => Decision::Rejected,
        }
    }
}

/// Request to submit a review.
#[derive(Debug, Deserialize, ToSchema)]
pub struct SubmitReviewRequest {
    pub decision: DecisionInput,
    pub comments: Option<String>,
}

impl Validate for SubmitReviewRequest {
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Request to cancel a fund request.
#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct CancelRequestRequest {
    pub reason: Option<String>,
}

impl Validate for CancelRequestRequest {
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Query parameters for the audit trail.
#[derive(Debug, Deserialize)]
pub struct AuditTrailParams {
    /// First sequence number to return (default 1).
    pub from_seq: Option<u64>,
}

// ── Response DTOs ───────────────────────────────────────────────────────────

/// Participant as returned by the API.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ParticipantResponse {
    pub user_id: String,
    pub name: String,
}

/// Release condition as returned by the API.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ConditionResponse {
    pub id: Uuid,
    pub description: String,
    pub required: bool,
    /// PENDING or MET.
    pub status: String,
    pub evidence_ref: Option<String>,
    pub met_by: Option<String>,
    pub met_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Review slot as returned by the API.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ReviewResponse {
    pub user_id: String,
    pub name: String,
    /// PENDING, APPROVED or REJECTED.
    pub decision: String,
    pub comments: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
}

/// Cancellation record as returned by the API.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CancellationResponse {
    /// WITHDRAWN or EXPIRED.
    pub cause: String,
    pub cancelled_by: String,
    pub reason: Option<String>,
}

/// Fund request as returned by the API.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct FundRequestResponse {
    pub id: Uuid,
    pub amount: i64,
    pub reason: String,
    pub description: String,
    pub document_refs: Vec<String>,
    pub requested_by: String,
    pub requested_at: DateTime<Utc>,
    /// CREATED, UNDER_REVIEW, APPROVED, REJECTED or CANCELLED.
    pub state: String,
    /// Frozen reviewer roster.
    pub reviewers: Vec<String>,
    pub reviews: Vec<ReviewResponse>,
    pub decided_at: Option<DateTime<Utc>>,
    pub cancellation: Option<CancellationResponse>,
}

/// Escrow as returned by the API.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct EscrowResponse {
    pub id: Uuid,
    pub title: String,
    pub custodian: ParticipantResponse,
    pub stakeholders: Vec<ParticipantResponse>,
    pub currency: String,
    pub total_amount: i64,
    pub released_amount: i64,
    pub remaining_amount: i64,
    /// DRAFT, FUNDED, REQUESTED, UNDER_REVIEW or CLOSED.
    pub state: String,
    /// Incremented once per committed command; send as `If-Match`.
    pub version: u64,
    pub conditions: Vec<ConditionResponse>,
    pub fund_requests: Vec<FundRequestResponse>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Response to `POST .../conditions`.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ConditionCreatedResponse {
    pub condition_id: Uuid,
    pub escrow: EscrowResponse,
}

/// Response to `POST .../requests`.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct FundRequestCreatedResponse {
    pub request_id: Uuid,
    pub escrow: EscrowResponse,
}

/// Response to review and re-evaluation commands.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RequestOutcomeResponse {
    /// Request state after the command.
    pub request_state: String,
    pub escrow: EscrowResponse,
}

/// One audit trail entry.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AuditEntryResponse {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    /// Transition payload, tagged by `type`.
    #[schema(value_type = Object)]
    pub kind: serde_json::Value,
    /// Snapshot digest before the transition.
    pub before: Option<String>,
    /// Snapshot digest after the transition.
    pub after: String,
    pub previous_digest: String,
    pub entry_digest: String,
}

/// Audit trail page.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AuditTrailResponse {
    pub escrow_id: Uuid,
    pub entries: Vec<AuditEntryResponse>,
}

/// Result of verifying an escrow's audit hash chain.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ChainVerificationResponse {
    pub escrow_id: Uuid,
    pub valid: bool,
    pub verified_entries: u64,
}

// ── Conversions ─────────────────────────────────────────────────────────────

fn participant_to_response(p: &Participant) -> ParticipantResponse {
    ParticipantResponse {
        user_id: p.user_id.to_string(),
        name: p.name.clone(),
    }
}

fn condition_to_response(c: &Condition) -> ConditionResponse {
    ConditionResponse {
        id: *c.id.as_uuid(),
        description: c.description.clone(),
        required: c.required,
        status: c.status.as_str().to_string(),
        evidence_ref: c.evidence_ref.as_ref().map(ToString::to_string),
        met_by: c.met_by.as_ref().map(ToString::to_string),
        met_at: c.met_at.map(|t| *t.as_datetime()),
        created_at: *c.created_at.as_datetime(),
    }
}

fn review_to_response(r: &Review) -> ReviewResponse {
    ReviewResponse {
        user_id: r.user_id.to_string(),
        name: r.name.clone(),
        decision: r.decision.as_str().to_string(),
        comments: r.comments.clone(),
        reviewed_at: r.reviewed_at.map(|t| *t.as_datetime()),
    }
}

fn request_to_response(r: &FundRequest) -> FundRequestResponse {
    FundRequestResponse {
        id: *r.id.as_uuid(),
        amount: r.amount.value(),
        reason: r.reason.clone(),
        description: r.description.clone(),
        document_refs: r.document_refs.iter().map(ToString::to_string).collect(),
        requested_by: r.requested_by.to_string(),
        requested_at: *r.requested_at.as_datetime(),
        state: r.state().as_str().to_string(),
        reviewers: r.roster().iter().map(|p| p.user_id.to_string()).collect(),
        reviews: r.reviews().iter().map(review_to_response).collect(),
        decided_at: r.decided_at.map(|t| *t.as_datetime()),
        cancellation: r.cancellation.as_ref().map(|c| CancellationResponse {
            cause: c.cause.as_str().to_string(),
            cancelled_by: c.cancelled_by.to_string(),
            reason: c.reason.clone(),
        }),
    }
}

/// Convert a committed escrow to its API representation.
pub fn escrow_to_response(e: &Escrow) -> EscrowResponse {
    let ledger = e.ledger();
    EscrowResponse {
        id: *e.id().as_uuid(),
        title: e.title().to_string(),
        custodian: participant_to_response(e.custodian()),
        stakeholders: e.stakeholders().iter().map(participant_to_response).collect(),
        currency: ledger.currency().to_string(),
        total_amount: ledger.total_amount().value(),
        released_amount: ledger.released_amount().value(),
        remaining_amount: ledger.remaining_amount().value(),
        state: e.state().as_str().to_string(),
        version: e.version(),
        conditions: e.conditions().iter().map(condition_to_response).collect(),
        fund_requests: e.fund_requests().iter().map(request_to_response).collect(),
        created_at: *e.created_at().as_datetime(),
        updated_at: *e.updated_at().as_datetime(),
    }
}

fn entry_to_response(entry: &AuditEntry) -> Result<AuditEntryResponse, AppError> {
    Ok(AuditEntryResponse {
        sequence: entry.sequence,
        timestamp: *entry.timestamp.as_datetime(),
        actor: entry.actor.to_string(),
        kind: serde_json::to_value(&entry.kind)
            .map_err(|e| AppError::Internal(format!("audit entry serialization failed: {e}")))?,
        before: entry.before.map(|d| d.to_string()),
        after: entry.after.to_string(),
        previous_digest: entry.previous_digest.to_string(),
        entry_digest: entry.entry_digest.to_string(),
    })
}

// ── Router ──────────────────────────────────────────────────────────────────

/// Build the escrow router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/escrows", post(create_escrow).get(list_escrows))
        .route("/v1/escrows/{id}", get(get_escrow))
        .route("/v1/escrows/{id}/fund", post(fund_escrow))
        .route("/v1/escrows/{id}/stakeholders", post(add_stakeholder))
        .route("/v1/escrows/{id}/stakeholders/{user_id}", delete(remove_stakeholder))
        .route("/v1/escrows/{id}/conditions", post(add_condition))
        .route("/v1/escrows/{id}/conditions/{condition_id}/met", post(mark_condition_met))
        .route("/v1/escrows/{id}/conditions/{condition_id}/pending", post(mark_condition_pending))
        .route("/v1/escrows/{id}/requests", post(create_fund_request))
        .route("/v1/escrows/{id}/requests/{request_id}/reviews", post(submit_review))
        .route("/v1/escrows/{id}/requests/{request_id}/reevaluate", post(reevaluate_request))
        .route("/v1/escrows/{id}/requests/{request_id}/cancel", post(cancel_request))
        .route("/v1/escrows/{id}/audit", get(get_audit_trail))
        .route("/v1/escrows/{id}/audit/verify", get(verify_audit_chain))
}

// ── Escrow handlers ─────────────────────────────────────────────────────────

/// POST /v1/escrows: Create an escrow in DRAFT.
#[utoipa::path(
    post,
    path = "/v1/escrows",
    request_body = CreateEscrowRequest,
    responses(
        (status = 201, description = "Escrow created", body = EscrowResponse),
        (status = 401, description = "No actor identity", body = crate::error::ErrorBody),
        (status = 422, description = "Validation error", body = crate::error::ErrorBody),
    ),
    tag = "escrows"
)]
pub(crate) async fn create_escrow(
    State(state): State<AppState>,
    Actor(actor): Actor,
    body: Result<Json<CreateEscrowRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<EscrowResponse>), AppError> {
    let req = extract_validated_json(body)?;
    let stakeholders = req
        .stakeholders
        .into_iter()
        .map(ParticipantInput::into_participant)
        .collect::<Result<Vec<_>, _>>()?;
    let escrow = state.service.create_escrow(
        &actor,
        CreateEscrow {
            title: req.title,
            custodian_name: req.custodian_name,
            currency: req.currency,
            stakeholders,
        },
    )?;
    Ok((StatusCode::CREATED, Json(escrow_to_response(&escrow))))
}

/// GET /v1/escrows: List escrows.
#[utoipa::path(
    get,
    path = "/v1/escrows",
    responses((status = 200, description = "All escrows", body = Vec<EscrowResponse>)),
    tag = "escrows"
)]
pub(crate) async fn list_escrows(State(state): State<AppState>) -> Json<Vec<EscrowResponse>> {
    Json(
        state
            .service
            .list_escrows()
            .iter()
            .map(|e| escrow_to_response(e))
            .collect(),
    )
}

/// GET /v1/escrows/{id}: Current committed state.
#[utoipa::path(
    get,
    path = "/v1/escrows/{id}",
    params(("id" = Uuid, Path, description = "Escrow ID")),
    responses(
        (status = 200, description = "Escrow found", body = EscrowResponse),
        (status = 404, description = "Not found", body = crate::error::ErrorBody),
    ),
    tag = "escrows"
)]
pub(crate) async fn get_escrow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<EscrowResponse>, AppError> {
    let escrow = state.service.get_escrow_state(EscrowId::from_uuid(id))?;
    Ok(Json(escrow_to_response(&escrow)))
}

/// POST /v1/escrows/{id}/fund: Deposit the escrow total.
#[utoipa::path(
    post,
    path = "/v1/escrows/{id}/fund",
    params(("id" = Uuid, Path, description = "Escrow ID")),
    request_body = FundEscrowRequest,
    responses(
        (status = 200, description = "Escrow funded", body = EscrowResponse),
        (status = 403, description = "Not the custodian", body = crate::error::ErrorBody),
        (status = 409, description = "Not in DRAFT", body = crate::error::ErrorBody),
    ),
    tag = "escrows"
)]
pub(crate) async fn fund_escrow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Actor(actor): Actor,
    ExpectedVersion(version): ExpectedVersion,
    body: Result<Json<FundEscrowRequest>, JsonRejection>,
) -> Result<Json<EscrowResponse>, AppError> {
    let req = extract_validated_json(body)?;
    let escrow = state
        .service
        .fund(EscrowId::from_uuid(id), &actor, req.total_amount, version)?;
    Ok(Json(escrow_to_response(&escrow)))
}

/// POST /v1/escrows/{id}/stakeholders: Add a stakeholder.
#[utoipa::path(
    post,
    path = "/v1/escrows/{id}/stakeholders",
    params(("id" = Uuid, Path, description = "Escrow ID")),
    request_body = ParticipantInput,
    responses(
        (status = 200, description = "Stakeholder added", body = EscrowResponse),
        (status = 403, description = "Not the custodian", body = crate::error::ErrorBody),
    ),
    tag = "escrows"
)]
pub(crate) async fn add_stakeholder(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Actor(actor): Actor,
    ExpectedVersion(version): ExpectedVersion,
    body: Result<Json<ParticipantInput>, JsonRejection>,
) -> Result<Json<EscrowResponse>, AppError> {
    let stakeholder = extract_validated_json(body)?.into_participant()?;
    let escrow = state
        .service
        .add_stakeholder(EscrowId::from_uuid(id), &actor, stakeholder, version)?;
    Ok(Json(escrow_to_response(&escrow)))
}

/// DELETE /v1/escrows/{id}/stakeholders/{user_id}: Remove a stakeholder.
#[utoipa::path(
    delete,
    path = "/v1/escrows/{id}/stakeholders/{user_id}",
    params(
        ("id" = Uuid, Path, description = "Escrow ID"),
        ("user_id" = String, Path, description = "Stakeholder user ID"),
    ),
    responses(
        (status = 200, description = "Stakeholder removed", body = EscrowResponse),
        (status = 403, description = "Not the custodian", body = crate::error::ErrorBody),
    ),
    tag = "escrows"
)]
pub(crate) async fn remove_stakeholder(
    State(state): State<AppState>,
    Path((id, user_id)): Path<(Uuid, String)>,
    Actor(actor): Actor,
    ExpectedVersion(version): ExpectedVersion,
) -> Result<Json<EscrowResponse>, AppError> {
    let user_id = ActorId::new(user_id)?;
    let escrow = state
        .service
        .remove_stakeholder(EscrowId::from_uuid(id), &actor, &user_id, version)?;
    Ok(Json(escrow_to_response(&escrow)))
}

// ── Condition handlers ──────────────────────────────────────────────────────

/// POST /v1/escrows/{id}/conditions: Attach a release condition.
#[utoipa::path(
    post,
    path = "/v1/escrows/{id}/conditions",
    params(("id" = Uuid, Path, description = "Escrow ID")),
    request_body = AddConditionRequest,
    responses(
        (status = 201, description = "Condition added", body = ConditionCreatedResponse),
        (status = 403, description = "Not the custodian", body = crate::error::ErrorBody),
    ),
    tag = "conditions"
)]
pub(crate) async fn add_condition(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Actor(actor): Actor,
    ExpectedVersion(version): ExpectedVersion,
    body: Result<Json<AddConditionRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ConditionCreatedResponse>), AppError> {
    let req = extract_validated_json(body)?;
    let (escrow, condition_id) = state.service.add_condition(
        EscrowId::from_uuid(id),
        &actor,
        &req.description,
        req.required,
        version,
    )?;
    Ok((
        StatusCode::CREATED,
        Json(ConditionCreatedResponse {
            condition_id: *condition_id.as_uuid(),
            escrow: escrow_to_response(&escrow),
        }),
    ))
}

/// POST /v1/escrows/{id}/conditions/{condition_id}/met: Mark a condition met.
#[utoipa::path(
    post,
    path = "/v1/escrows/{id}/conditions/{condition_id}/met",
    params(
        ("id" = Uuid, Path, description = "Escrow ID"),
        ("condition_id" = Uuid, Path, description = "Condition ID"),
    ),
    request_body = MarkConditionMetRequest,
    responses(
        (status = 200, description = "Condition met", body = EscrowResponse),
        (status = 404, description = "Not found", body = crate::error::ErrorBody),
    ),
    tag = "conditions"
)]
pub(crate) async fn mark_condition_met(
    State(state): State<AppState>,
    Path((id, condition_id)): Path<(Uuid, Uuid)>,
    Actor(actor): Actor,
    ExpectedVersion(version): ExpectedVersion,
    body: Result<Json<MarkConditionMetRequest>, JsonRejection>,
) -> Result<Json<EscrowResponse>, AppError> {
    let req = extract_validated_json(body)?;
    let evidence = DocumentRef::new(req.evidence_ref)?;
    let escrow = state.service.mark_condition_met(
        EscrowId::from_uuid(id),
        &actor,
        ConditionId::from_uuid(condition_id),
        evidence,
        version,
    )?;
    Ok(Json(escrow_to_response(&escrow)))
}

/// POST /v1/escrows/{id}/conditions/{condition_id}/pending: Revert a condition.
#[utoipa::path(
    post,
    path = "/v1/escrows/{id}/conditions/{condition_id}/pending",
    params(
        ("id" = Uuid, Path, description = "Escrow ID"),
        ("condition_id" = Uuid, Path, description = "Condition ID"),
    ),
    responses(
        (status = 200, description = "Condition pending", body = EscrowResponse),
        (status = 404, description = "Not found", body = crate::error::ErrorBody),
    ),
    tag = "conditions"
)]
pub(crate) async fn mark_condition_pending(
    State(state): State<AppState>,
    Path((id, condition_id)): Path<(Uuid, Uuid)>,
    Actor(actor): Actor,
    ExpectedVersion(version): ExpectedVersion,
) -> Result<Json<EscrowResponse>, AppError> {
    let escrow = state.service.mark_condition_pending(
        EscrowId::from_uuid(id),
        &actor,
        ConditionId::from_uuid(condition_id),
        version,
    )?;
    Ok(Json(escrow_to_response(&escrow)))
}

// ── Fund request handlers ───────────────────────────────────────────────────

/// POST /v1/escrows/{id}/requests: Raise a fund request.
#[utoipa::path(
    post,
    path = "/v1/escrows/{id}/requests",
    params(("id" = Uuid, Path, description = "Escrow ID")),
    request_body = CreateFundRequestRequest,
    responses(
        (status = 201, description = "Request created", body = FundRequestCreatedResponse),
        (status = 403, description = "Not a participant", body = crate::error::ErrorBody),
        (status = 409, description = "Request in progress or insufficient funds", body = crate::error::ErrorBody),
    ),
    tag = "requests"
)]
pub(crate) async fn create_fund_request(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Actor(actor): Actor,
    ExpectedVersion(version): ExpectedVersion,
    body: Result<Json<CreateFundRequestRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<FundRequestCreatedResponse>), AppError> {
    let req = extract_validated_json(body)?;
    let document_refs = req
        .document_refs
        .into_iter()
        .map(DocumentRef::new)
        .collect::<Result<Vec<_>, _>>()?;
    let (escrow, request_id) = state.service.create_fund_request(
        EscrowId::from_uuid(id),
        &actor,
        NewFundRequest {
            amount: req.amount,
            reason: req.reason,
            description: req.description,
            document_refs,
        },
        version,
    )?;
    Ok((
        StatusCode::CREATED,
        Json(FundRequestCreatedResponse {
            request_id: *request_id.as_uuid(),
            escrow: escrow_to_response(&escrow),
        }),
    ))
}

/// POST /v1/escrows/{id}/requests/{request_id}/reviews: Submit a review.
#[utoipa::path(
    post,
    path = "/v1/escrows/{id}/requests/{request_id}/reviews",
    params(
        ("id" = Uuid, Path, description = "Escrow ID"),
        ("request_id" = Uuid, Path, description = "Fund request ID"),
    ),
    request_body = SubmitReviewRequest,
    responses(
        (status = 200, description = "Review recorded", body = RequestOutcomeResponse),
        (status = 409, description = "Not a reviewer, already reviewed or finalized", body = crate::error::ErrorBody),
    ),
    tag = "requests"
)]
pub(crate) async fn submit_review(
    State(state): State<AppState>,
    Path((id, request_id)): Path<(Uuid, Uuid)>,
    Actor(actor): Actor,
    ExpectedVersion(version): ExpectedVersion,
    body: Result<Json<SubmitReviewRequest>, JsonRejection>,
) -> Result<Json<RequestOutcomeResponse>, AppError> {
    let req = extract_validated_json(body)?;
    let (escrow, request_state) = state.service.submit_review(
        EscrowId::from_uuid(id),
        FundRequestId::from_uuid(request_id),
        &actor,
        req.decision.into(),
        req.comments,
        version,
    )?;
    Ok(Json(RequestOutcomeResponse {
        request_state: request_state.as_str().to_string(),
        escrow: escrow_to_response(&escrow),
    }))
}

/// POST /v1/escrows/{id}/requests/{request_id}/reevaluate: Re-run aggregation.
#[utoipa::path(
    post,
    path = "/v1/escrows/{id}/requests/{request_id}/reevaluate",
    params(
        ("id" = Uuid, Path, description = "Escrow ID"),
        ("request_id" = Uuid, Path, description = "Fund request ID"),
    ),
    responses(
        (status = 200, description = "Request evaluated", body = RequestOutcomeResponse),
        (status = 403, description = "Not a reviewer or custodian", body = crate::error::ErrorBody),
    ),
    tag = "requests"
)]
pub(crate) async fn reevaluate_request(
    State(state): State<AppState>,
    Path((id, request_id)): Path<(Uuid, Uuid)>,
    Actor(actor): Actor,
    ExpectedVersion(version): ExpectedVersion,
) -> Result<Json<RequestOutcomeResponse>, AppError> {
    let (escrow, request_state) = state.service.reevaluate_request(
        EscrowId::from_uuid(id),
        FundRequestId::from_uuid(request_id),
        &actor,
        version,
    )?;
    Ok(Json(RequestOutcomeResponse {
        request_state: request_state.as_str().to_string(),
        escrow: escrow_to_response(&escrow),
    }))
}

/// POST /v1/escrows/{id}/requests/{request_id}/cancel: Cancel a request.
#[utoipa::path(
    post,
    path = "/v1/escrows/{id}/requests/{request_id}/cancel",
    params(
        ("id" = Uuid, Path, description = "Escrow ID"),
        ("request_id" = Uuid, Path, description = "Fund request ID"),
    ),
    request_body = CancelRequestRequest,
    responses(
        (status = 200, description = "Request cancelled", body = EscrowResponse),
        (status = 403, description = "Not the custodian", body = crate::error::ErrorBody),
        (status = 409, description = "Request already finalized", body = crate::error::ErrorBody),
    ),
    tag = "requests"
)]
pub(crate) async fn cancel_request(
    State(state): State<AppState>,
    Path((id, request_id)): Path<(Uuid, Uuid)>,
    Actor(actor): Actor,
    ExpectedVersion(version): ExpectedVersion,
    body: Result<Json<CancelRequestRequest>, JsonRejection>,
) -> Result<Json<EscrowResponse>, AppError> {
    let req = extract_validated_json(body)?;
    let escrow = state.service.cancel_request(
        EscrowId::from_uuid(id),
        FundRequestId::from_uuid(request_id),
        &actor,
        req.reason,
        version,
    )?;
    Ok(Json(escrow_to_response(&escrow)))
}

// ── Audit handlers ──────────────────────────────────────────────────────────

/// GET /v1/escrows/{id}/audit: Audit trail from `from_seq`.
#[utoipa::path(
    get,
    path = "/v1/escrows/{id}/audit",
    params(
        ("id" = Uuid, Path, description = "Escrow ID"),
        ("from_seq" = Option<u64>, Query, description = "First sequence number (default 1)"),
    ),
    responses(
        (status = 200, description = "Audit entries in sequence order", body = AuditTrailResponse),
        (status = 404, description = "Not found", body = crate::error::ErrorBody),
    ),
    tag = "audit"
)]
pub(crate) async fn get_audit_trail(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<AuditTrailParams>,
) -> Result<Json<AuditTrailResponse>, AppError> {
    let query = state
        .service
        .get_audit_trail(EscrowId::from_uuid(id), params.from_seq.unwrap_or(1))?;
    let entries = query
        .iter()
        .map(|e| entry_to_response(&e))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(AuditTrailResponse { escrow_id: id, entries }))
}

/// GET /v1/escrows/{id}/audit/verify: Verify the audit hash chain.
#[utoipa::path(
    get,
    path = "/v1/escrows/{id}/audit/verify",
    params(("id" = Uuid, Path, description = "Escrow ID")),
    responses(
        (status = 200, description = "Chain intact", body = ChainVerificationResponse),
        (status = 500, description = "Chain broken", body = crate::error::ErrorBody),
    ),
    tag = "audit"
)]
pub(crate) async fn verify_audit_chain(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ChainVerificationResponse>, AppError> {
    let verified_entries = state.service.verify_audit_chain(EscrowId::from_uuid(id))?;
    Ok(Json(ChainVerificationResponse {
        escrow_id: id,
        valid: true,
        verified_entries,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{auth_middleware, AuthConfig, ACTOR_HEADER};
    use axum::body::Body;
    use axum::http::Request;
    use axum::middleware::from_fn;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    // ── DTO validation ───────────────────────────────────────────

    #[test]
    fn create_escrow_request_validation() {
        let req = CreateEscrowRequest {
            title: "Deposit".into(),
            custodian_name: "Alice".into(),
            currency: "USD".into(),
            stakeholders: vec![ParticipantInput {
                user_id: "bob".into(),
                name: " ".into(),
            }],
        };
        assert!(req.validate().unwrap_err().contains("name"));
    }

    #[test]
    fn amounts_must_be_positive() {
        assert!(FundEscrowRequest { total_amount: 0 }.validate().is_err());
        let req = CreateFundRequestRequest {
            amount: -5,
            reason: "x".into(),
            description: String::new(),
            document_refs: vec![],
        };
        assert!(req.validate().unwrap_err().contains("amount"));
    }

    #[test]
    fn condition_required_defaults_to_true() {
        let req: AddConditionRequest = serde_json::from_str(r#"{"description":"Inspection"}"#).unwrap();
        assert!(req.required);
    }

    // ── Handlers ─────────────────────────────────────────────────

    fn test_app() -> Router<()> {
        router()
            .layer(from_fn(auth_middleware))
            .layer(axum::Extension(AuthConfig { token: None }))
            .with_state(AppState::new())
    }

    async fn send(
        app: &Router<()>,
        method: &str,
        uri: &str,
        actor: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(a) = actor {
            builder = builder.header(ACTOR_HEADER, a);
        }
        let req = match body {
            Some(b) => builder
                .header("content-type", "application/json")
                .body(Body::from(b.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
        };
        (status, value)
    }

    async fn funded_escrow(app: &Router<()>) -> String {
        let (status, body) = send(
            app,
            "POST",
            "/v1/escrows",
            Some("alice"),
            Some(serde_json::json!({
                "title": "Renovation",
                "custodian_name": "Alice",
                "currency": "USD",
                "stakeholders": [{"user_id": "bob", "name": "Bob"}]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["state"], "DRAFT");
        let id = body["id"].as_str().unwrap().to_string();
        let (status, body) = send(
            app,
            "POST",
            &format!("/v1/escrows/{id}/fund"),
            Some("alice"),
            Some(serde_json::json!({"total_amount": 100000})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "FUNDED");
        id
    }

    #[tokio::test]
    async fn create_without_actor_is_401() {
        let app = test_app();
        let (status, body) = send(
            &app,
            "POST",
            "/v1/escrows",
            None,
            Some(serde_json::json!({"title": "x", "custodian_name": "A", "currency": "USD"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn full_release_over_http() {
        let app = test_app();
        let id = funded_escrow(&app).await;

        let (status, body) = send(
            &app,
            "POST",
            &format!("/v1/escrows/{id}/requests"),
            Some("bob"),
            Some(serde_json::json!({"amount": 40000, "reason": "Contractor invoice"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["escrow"]["state"], "REQUESTED");
        let rid = body["request_id"].as_str().unwrap().to_string();
        assert_eq!(body["escrow"]["fund_requests"][0]["reviewers"], serde_json::json!(["alice", "bob"]));

        let review = |decision: &str| Some(serde_json::json!({ "decision": decision }));
        let uri = format!("/v1/escrows/{id}/requests/{rid}/reviews");
        let (status, body) = send(&app, "POST", &uri, Some("alice"), review("APPROVED")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["request_state"], "UNDER_REVIEW");

        let (status, body) = send(&app, "POST", &uri, Some("bob"), review("APPROVED")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["request_state"], "APPROVED");
        assert_eq!(body["escrow"]["released_amount"], 40000);
        assert_eq!(body["escrow"]["remaining_amount"], 60000);
        assert_eq!(body["escrow"]["state"], "FUNDED");

        let (status, body) = send(&app, "POST", &uri, Some("bob"), review("REJECTED")).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["details"]["reason"], "ALREADY_REVIEWED");

        let (status, body) = send(&app, "GET", &format!("/v1/escrows/{id}/audit?from_seq=1"), None, None).await;
        assert_eq!(status, StatusCode::OK);
        let entries = body["entries"].as_array().unwrap();
        assert_eq!(entries[0]["sequence"], 1);
        assert_eq!(entries[0]["kind"]["type"], "ESCROW_CREATED");

        let (status, body) = send(&app, "GET", &format!("/v1/escrows/{id}/audit/verify"), None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["valid"], true);
        assert_eq!(body["verified_entries"], entries.len());
    }

    #[tokio::test]
    async fn overdraw_is_409_insufficient_funds() {
        let app = test_app();
        let id = funded_escrow(&app).await;
        let (status, body) = send(
            &app,
            "POST",
            &format!("/v1/escrows/{id}/requests"),
            Some("bob"),
            Some(serde_json::json!({"amount": 100001, "reason": "Too much"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "INSUFFICIENT_FUNDS");
        let (_, escrow) = send(&app, "GET", &format!("/v1/escrows/{id}"), None, None).await;
        assert_eq!(escrow["version"], 2);
        assert_eq!(escrow["state"], "FUNDED");
    }

    #[tokio::test]
    async fn stranger_is_403_and_stale_version_is_409() {
        let app = test_app();
        let id = funded_escrow(&app).await;
        let (status, body) = send(
            &app,
            "POST",
            &format!("/v1/escrows/{id}/conditions"),
            Some("mallory"),
            Some(serde_json::json!({"description": "Inspection"})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"]["code"], "AUTHORIZATION_ERROR");

        let req = Request::builder()
            .method("POST")
            .uri(format!("/v1/escrows/{id}/conditions"))
            .header(ACTOR_HEADER, "alice")
            .header("if-match", "\"1\"")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"description":"Inspection"}"#))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn pending_decision_is_422() {
        let app = test_app();
        let id = funded_escrow(&app).await;
        let (_, body) = send(
            &app,
            "POST",
            &format!("/v1/escrows/{id}/requests"),
            Some("bob"),
            Some(serde_json::json!({"amount": 10, "reason": "Fees"})),
        )
        .await;
        let rid = body["request_id"].as_str().unwrap();
        let (status, body) = send(
            &app,
            "POST",
            &format!("/v1/escrows/{id}/requests/{rid}/reviews"),
            Some("bob"),
            Some(serde_json::json!({"decision": "PENDING"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn unknown_escrow_is_404_and_bad_json_is_400() {
        let app = test_app();
        let (status, _) = send(&app, "GET", &format!("/v1/escrows/{}", Uuid::new_v4()), None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let req = Request::builder()
            .method("POST")
            .uri("/v1/escrows")
            .header(ACTOR_HEADER, "alice")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn conditions_and_cancel_over_http() {
        let app = test_app();
        let id = funded_escrow(&app).await;
        let (status, body) = send(
            &app,
            "POST",
            &format!("/v1/escrows/{id}/conditions"),
            Some("alice"),
            Some(serde_json::json!({"description": "Inspection passed", "required": true})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let cid = body["condition_id"].as_str().unwrap().to_string();

        let (status, body) = send(
            &app,
            "POST",
            &format!("/v1/escrows/{id}/conditions/{cid}/met"),
            Some("alice"),
            Some(serde_json::json!({"evidence_ref": "doc://inspection/1"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["conditions"][0]["status"], "MET");

        let (status, body) = send(
            &app,
            "POST",
            &format!("/v1/escrows/{id}/conditions/{cid}/pending"),
            Some("alice"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["conditions"][0]["status"], "PENDING");

        let (_, body) = send(
            &app,
            "POST",
            &format!("/v1/escrows/{id}/requests"),
            Some("bob"),
            Some(serde_json::json!({"amount": 500, "reason": "Deposit"})),
        )
        .await;
        let rid = body["request_id"].as_str().unwrap().to_string();
        let cancel = format!("/v1/escrows/{id}/requests/{rid}/cancel");
        let (status, _) = send(&app, "POST", &cancel, Some("bob"), Some(serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, body) = send(
            &app,
            "POST",
            &cancel,
            Some("alice"),
            Some(serde_json::json!({"reason": "Duplicate"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "FUNDED");
        assert_eq!(body["fund_requests"][0]["state"], "CANCELLED");
        assert_eq!(body["fund_requests"][0]["cancellation"]["cause"], "WITHDRAWN");
    }

    #[tokio::test]
    async fn stakeholder_endpoints() {
        let app = test_app();
        let id = funded_escrow(&app).await;
        let (status, body) = send(
            &app,
            "POST",
            &format!("/v1/escrows/{id}/stakeholders"),
            Some("alice"),
            Some(serde_json::json!({"user_id": "carol", "name": "Carol"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stakeholders"].as_array().unwrap().len(), 2);

        let (status, body) = send(&app, "DELETE", &format!("/v1/escrows/{id}/stakeholders/carol"), Some("alice"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stakeholders"].as_array().unwrap().len(), 1);

        let (status, _) = send(&app, "GET", "/v1/escrows", None, None).await;
        assert_eq!(status, StatusCode::OK);
    }
}
