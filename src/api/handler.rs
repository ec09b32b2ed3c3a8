//! Signed command endpoint
//!
//! The chat front-end posts each message with `X-Signature-256: sha256=<hex>`, an
//! HMAC-SHA256 of the raw body keyed with `COMMAND_SECRET`.

use axum::{body::Bytes, extract::State, http::HeaderMap, Json};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{error, info, warn};

use super::dto::{CommandReply, CommandRequest};
use crate::state::AppState;
use crate::utils::{AppError, BaseResponse};

pub const SIGNATURE_HEADER: &str = "X-Signature-256";

/// Verify the request signature using HMAC-SHA256
pub fn verify_signature(secret: &str, signature: &str, body: &[u8]) -> Result<(), AppError> {
    let signature = signature.strip_prefix("sha256=").ok_or_else(|| {
        warn!("Invalid signature format: missing sha256= prefix");
        AppError::unauthorized("Invalid signature format")
    })?;

    let signature = hex::decode(signature).map_err(|_| {
        warn!("Invalid signature format: not hex");
        AppError::unauthorized("Invalid signature format")
    })?;

    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).map_err(|e| {
        error!(error = %e, "HMAC initialization failed");
        AppError::internal_error("HMAC error")
    })?;

    mac.update(body);

    mac.verify_slice(&signature).map_err(|_| {
        warn!("Signature mismatch");
        AppError::unauthorized("Signature mismatch")
    })
}

/// Handle one chat command
///
/// Endpoint: POST /api/commands
pub async fn handle_command(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<BaseResponse<CommandReply>>, AppError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            warn!("Missing {} header", SIGNATURE_HEADER);
            AppError::unauthorized("Missing signature header")
        })?;

    verify_signature(&state.command_secret, signature, &body)?;

    let request: CommandRequest = serde_json::from_slice(&body).map_err(|e| {
        warn!(error = %e, "Failed to parse command request");
        AppError::bad_request(format!("Invalid payload: {}", e))
    })?;

    let reply = state.commands.handle(&request.caller_id, &request.text).await?;
    info!(caller = %request.caller_id, "Command handled");

    Ok(Json(BaseResponse::success(CommandReply { reply })))
}
