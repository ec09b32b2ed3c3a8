use serde::Serialize;

use super::AppError;

const SUCCESS_CODE: &str = "COMMON200";

/// Envelope of every command API reply
///
/// ```json
/// { "isSuccess": true, "code": "COMMON200", "message": "OK", "result": { "reply": "..." } }
/// ```
///
/// Failures carry the error's code and message with `result: null`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BaseResponse<T: Serialize> {
    pub is_success: bool,
    pub code: &'static str,
    pub message: String,
    pub result: Option<T>,
}

impl<T: Serialize> BaseResponse<T> {
    pub fn success(result: T) -> Self {
        Self {
            is_success: true,
            code: SUCCESS_CODE,
            message: "OK".to_string(),
            result: Some(result),
        }
    }
}

impl BaseResponse<()> {
    pub fn failure(error: &AppError) -> Self {
        Self {
            is_success: false,
            code: error.error_code(),
            message: error.to_string(),
            result: None,
        }
    }
}
