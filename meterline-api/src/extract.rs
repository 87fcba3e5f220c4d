//! JSON body extraction that reports malformed requests through the
//! same `{error, code, details}` envelope as every other handler error
//! (§6.2/§7), rather than axum's bare default rejection response.

use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Request};
use meterline_core::errors::{MeteringError, ValidationError};

use crate::error::ApiError;
use crate::state::AppState;

/// Drop-in replacement for `axum::Json` as a request extractor; converts
/// a `JsonRejection` (missing body, invalid UTF-8, bad JSON syntax, a
/// field of the wrong type) into `INVALID_REQUEST` instead of axum's
/// plain-text default.
pub struct Json<T>(pub T);

#[axum::async_trait]
impl<T> FromRequest<AppState> for Json<T>
where
    T: serde::de::DeserializeOwned,
    axum::Json<T>: FromRequest<AppState, Rejection = JsonRejection>,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &AppState) -> Result<Self, Self::Rejection> {
        match axum::Json::<T>::from_request(req, state).await {
            Ok(axum::Json(value)) => Ok(Json(value)),
            Err(rejection) => Err(MeteringError::Validation(ValidationError::Field {
                field: "body".into(),
                message: rejection.body_text(),
            })
            .into()),
        }
    }
}
