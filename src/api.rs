use axum::{
    Json, Router, middleware,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use crate::guard::RecoveryLayer;
use crate::request::{self, BodyLimit};

#[derive(Debug, Deserialize)]
pub struct DivideRequest {
    pub a: i64,
    pub b: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DivideResponse {
    pub quotient: i64,
}

async fn healthz() -> &'static str {
    "ok"
}

/// Divides `a` by `b`. Panics on a zero divisor, which the recovery layer
/// answers with a 500.
#[axum::debug_handler]
async fn divide(Json(req): Json<DivideRequest>) -> Json<DivideResponse> {
    if req.b == 0 {
        panic!("division by zero");
    }
    Json(DivideResponse {
        quotient: req.a / req.b,
    })
}

/// Routes behind the recovery boundary. The body is buffered before the
/// guard runs so a fault report can include it.
pub fn router(recovery: RecoveryLayer, body_limit: usize) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/divide", post(divide))
        .layer(recovery)
        .layer(middleware::from_fn_with_state(
            BodyLimit(body_limit),
            request::buffer_body,
        ))
}
