//! # OpenAPI Specification Assembly
//!
//! Assembles all utoipa-documented routes into a single OpenAPI 3.1 document
//! served at `/openapi.json`.

use axum::routing::get;
use axum::{Json, Router};
use utoipa::OpenApi;

use crate::state::AppState;

/// Assembled OpenAPI document for the entire API surface.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Escrow Fund-Release Authorization API",
        version = "0.1.0",
        description = "Escrow accounts, release conditions, fund requests with unanimous stakeholder review, and a hash-chained audit trail.",
        license(name = "BUSL-1.1")
    ),
    paths(
        // Escrows
        crate::routes::escrows::create_escrow,
        crate::routes::escrows::list_escrows,
        crate::routes::escrows::get_escrow,
        crate::routes::escrows::fund_escrow,
        crate::routes::escrows::add_stakeholder,
        crate::routes::escrows::remove_stakeholder,
        // Conditions
        crate::routes::escrows::add_condition,
        crate::routes::escrows::mark_condition_met,
        crate::routes::escrows::mark_condition_pending,
        // Requests
        crate::routes::escrows::create_fund_request,
        crate::routes::escrows::submit_review,
        crate::routes::escrows::reevaluate_request,
        crate::routes::escrows::cancel_request,
        // Audit
        crate::routes::escrows::get_audit_trail,
        crate::routes::escrows::verify_audit_chain,
    ),
    components(schemas(
        // Error types
        crate::error::ErrorBody,
        crate::error::ErrorDetail,
        // Request DTOs
        crate::routes::escrows::ParticipantInput,
        crate::routes::escrows::CreateEscrowRequest,
        crate::routes::escrows::FundEscrowRequest,
        crate::routes::escrows::AddConditionRequest,
        crate::routes::escrows::MarkConditionMetRequest,
        crate::routes::escrows::CreateFundRequestRequest,
        crate::routes::escrows::DecisionInput,
        crate::routes::escrows::SubmitReviewRequest,
        crate::routes::escrows::CancelRequestRequest,
        // Response DTOs
        crate::routes::escrows::ParticipantResponse,
        crate::routes::escrows::ConditionResponse,
        crate::routes::escrows::ReviewResponse,
        crate::routes::escrows::CancellationResponse,
        crate::routes::escrows::FundRequestResponse,
        crate::routes::escrows::EscrowResponse,
        crate::routes::escrows::ConditionCreatedResponse,
        crate::routes::escrows::FundRequestCreatedResponse,
        crate::routes::escrows::RequestOutcomeResponse,
        crate::routes::escrows::AuditEntryResponse,
        crate::routes::escrows::AuditTrailResponse,
        crate::routes::escrows::ChainVerificationResponse,
    )),
    tags(
        (name = "escrows", description = "Escrow lifecycle and stakeholders"),
        (name = "conditions", description = "Release conditions"),
        (name = "requests", description = "Fund requests and reviews"),
        (name = "audit", description = "Hash-chained audit trail"),
    )
)]
pub struct ApiDoc;

/// Build the OpenAPI router.
///
/// Serves the OpenAPI JSON document at `/openapi.json`.
pub fn router() -> Router<AppState> {
    Router::new().route("/openapi.json", get(openapi_json))
}

/// GET /openapi.json: Return the generated OpenAPI specification.
async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_lists_every_escrow_path() {
        let doc = ApiDoc::openapi();
        let paths: Vec<&str> = doc.paths.paths.keys().map(String::as_str).collect();
        for expected in [
            "/v1/escrows",
            "/v1/escrows/{id}",
            "/v1/escrows/{id}/fund",
            "/v1/escrows/{id}/requests/{request_id}/reviews",
            "/v1/escrows/{id}/audit",
            "/v1/escrows/{id}/audit/verify",
        ] {
            assert!(paths.contains(&expected), "missing path {expected}");
        }
    }

    #[test]
    fn document_serializes() {
        let json = serde_json::to_value(ApiDoc::openapi()).unwrap();
        assert!(json["components"]["schemas"]["EscrowResponse"].is_object());
    }
}
