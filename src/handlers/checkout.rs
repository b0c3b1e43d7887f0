use crate::{
    checkout::{CheckoutForm, CheckoutStarted},
    errors::ServiceError,
    fulfillment::{ConfirmationOutcome, ConfirmationRequest, ConfirmationTrigger},
    payments::PaymentStatus,
    ApiResponse, AppState,
};
use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};
use url::Url;
use uuid::Uuid;

pub fn checkout_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(start_checkout))
        .route("/submit", post(submit_checkout))
        .route("/return", get(checkout_return))
        .route("/confirm", post(client_confirm))
}

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub session_token: Option<String>,
    pub payment_intent_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReturnQuery {
    pub payment_intent: Option<String>,
    pub session: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ClientConfirmRequest {
    pub checkout_session: String,
    pub payment_intent_id: String,
}

/// Result of a confirmation as seen by the browser.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfirmationView {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub booking_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub booking_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_status: Option<PaymentStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
}

impl From<ConfirmationOutcome> for ConfirmationView {
    fn from(outcome: ConfirmationOutcome) -> Self {
        match outcome {
            ConfirmationOutcome::Done(ids) | ConfirmationOutcome::AlreadyDone(ids) => {
                ConfirmationView {
                    status: "confirmed".to_string(),
                    order_id: ids.order_id,
                    booking_id: ids.booking_id,
                    booking_number: ids.booking_number,
                    payment_status: Some(PaymentStatus::Succeeded),
                    reason: None,
                    session_token: None,
                }
            }
            ConfirmationOutcome::Rejected {
                status,
                reason,
                session_token,
            } => ConfirmationView {
                status: "rejected".to_string(),
                order_id: None,
                booking_id: None,
                booking_number: None,
                payment_status: Some(status),
                reason: Some(reason),
                session_token,
            },
        }
    }
}

fn outcome_status(outcome: &ConfirmationOutcome) -> StatusCode {
    match outcome {
        ConfirmationOutcome::Done(_) | ConfirmationOutcome::AlreadyDone(_) => StatusCode::OK,
        ConfirmationOutcome::Rejected {
            status: PaymentStatus::Pending | PaymentStatus::RequiresAction,
            ..
        } => StatusCode::ACCEPTED,
        ConfirmationOutcome::Rejected { .. } => StatusCode::PAYMENT_REQUIRED,
    }
}

fn confirmation_response(outcome: ConfirmationOutcome) -> Response {
    let status = outcome_status(&outcome);
    let view = ConfirmationView::from(outcome);
    (status, Json(ApiResponse::success(view))).into_response()
}

/// POST /api/v1/checkout
async fn start_checkout(
    State(state): State<AppState>,
    Json(form): Json<CheckoutForm>,
) -> Result<(StatusCode, Json<ApiResponse<CheckoutStarted>>), ServiceError> {
    let started = state.checkout.start(form).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(started))))
}

/// POST /api/v1/checkout/submit
async fn submit_checkout(
    State(state): State<AppState>,
    Json(body): Json<SubmitRequest>,
) -> Result<Response, ServiceError> {
    let outcome = state
        .confirmations
        .confirm(ConfirmationRequest {
            trigger: ConfirmationTrigger::Submit,
            session_token: body.session_token,
            payment_intent_id: body.payment_intent_id,
        })
        .await?;
    Ok(confirmation_response(outcome))
}

/// GET /api/v1/checkout/return
///
/// The hosted payment page sends the browser here. Always answers with a redirect.
async fn checkout_return(
    State(state): State<AppState>,
    Query(query): Query<ReturnQuery>,
) -> Result<Redirect, ServiceError> {
    let session = query.session.clone();
    let result = state
        .confirmations
        .confirm(ConfirmationRequest {
            trigger: ConfirmationTrigger::Redirect,
            session_token: query.session,
            payment_intent_id: query.payment_intent,
        })
        .await;

    let target = match result {
        Ok(ConfirmationOutcome::Done(ids)) | Ok(ConfirmationOutcome::AlreadyDone(ids)) => {
            let mut params = Vec::new();
            if let Some(number) = ids.booking_number {
                params.push(("booking", number));
            }
            if let Some(order_id) = ids.order_id {
                params.push(("order", order_id.to_string()));
            }
            with_query(&state.config.checkout_success_url, &params)?
        }
        Ok(ConfirmationOutcome::Rejected {
            reason,
            session_token,
            ..
        }) => retry_url(&state, reason, session_token.or(session))?,
        Err(e) => {
            if e.is_retryable() {
                warn!(error = %e, "Redirect confirmation failed; sending buyer back to checkout");
            } else {
                error!(error = %e, "Redirect confirmation failed");
            }
            retry_url(&state, e.response_message(), session)?
        }
    };
    Ok(Redirect::to(target.as_str()))
}

fn retry_url(state: &AppState, reason: String, session: Option<String>) -> Result<Url, ServiceError> {
    let mut params = vec![("reason", reason)];
    if let Some(session) = session {
        params.push(("session", session));
    }
    with_query(&state.config.checkout_retry_url, &params)
}

fn with_query(base: &str, params: &[(&str, String)]) -> Result<Url, ServiceError> {
    let mut url = Url::parse(base)
        .map_err(|e| ServiceError::InternalError(format!("invalid redirect url {}: {}", base, e)))?;
    if !params.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in params {
            pairs.append_pair(key, value);
        }
    }
    Ok(url)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// POST /api/v1/checkout/confirm
///
/// Called by the payment form after client-side confirmation. The bearer token is
/// the intent's client secret.
async fn client_confirm(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ClientConfirmRequest>,
) -> Result<Response, ServiceError> {
    let secret = bearer_token(&headers)
        .ok_or_else(|| ServiceError::Unauthorized("missing bearer token".to_string()))?;
    state
        .confirmations
        .authorize_client(&body.checkout_session, &body.payment_intent_id, secret)
        .await?;

    let outcome = state
        .confirmations
        .confirm(ConfirmationRequest {
            trigger: ConfirmationTrigger::ClientConfirm,
            session_token: Some(body.checkout_session),
            payment_intent_id: Some(body.payment_intent_id),
        })
        .await?;
    Ok(confirmation_response(outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fulfillment::FulfillmentIds;

    #[test]
    fn query_parameters_are_encoded() {
        let url = with_query(
            "https://camps.example.com/checkout",
            &[("reason", "Your card was declined.".to_string()), ("session", "cs_1".to_string())],
        )
        .unwrap();
        assert_eq!(
            url.as_str(),
            "https://camps.example.com/checkout?reason=Your+card+was+declined.&session=cs_1"
        );
    }

    #[test]
    fn bearer_token_requires_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer pi_1_secret_x".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("pi_1_secret_x"));

        headers.insert(header::AUTHORIZATION, "Basic abc".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn rejected_outcomes_map_to_statuses() {
        let pending = ConfirmationOutcome::Rejected {
            status: PaymentStatus::RequiresAction,
            reason: "x".into(),
            session_token: None,
        };
        assert_eq!(outcome_status(&pending), StatusCode::ACCEPTED);

        let failed = ConfirmationOutcome::Rejected {
            status: PaymentStatus::Failed,
            reason: "x".into(),
            session_token: None,
        };
        assert_eq!(outcome_status(&failed), StatusCode::PAYMENT_REQUIRED);

        let done = ConfirmationOutcome::AlreadyDone(FulfillmentIds::default());
        assert_eq!(outcome_status(&done), StatusCode::OK);
        assert_eq!(ConfirmationView::from(done).status, "confirmed");
    }
}
