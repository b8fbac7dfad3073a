use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use replication::{ConsistencyLevel, WriteReceipt};
use serde::Deserialize;
use std::sync::Arc;

use crate::{ApiError, ApiResult, AppState, WriteResponse};

pub const COUNTER_HEADER: &str = "x-paravon-counter";
pub const ORIGIN_HEADER: &str = "x-paravon-origin";

#[derive(Debug, Default, Deserialize)]
pub struct ConsistencyQuery {
    consistency: Option<String>,
}

impl ConsistencyQuery {
    fn level(&self) -> ApiResult<ConsistencyLevel> {
        match &self.consistency {
            Some(raw) => raw.parse().map_err(|_| {
                ApiError::InvalidRequest(format!("unknown consistency level '{}'", raw))
            }),
            None => Ok(ConsistencyLevel::Default),
        }
    }
}

pub async fn get_key(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Query(query): Query<ConsistencyQuery>,
) -> ApiResult<Response> {
    let level = query.level()?;
    let value = state
        .coordinator
        .get(key.as_bytes(), level)
        .await?
        .ok_or_else(|| ApiError::NotFound(key.clone()))?;

    let mut headers = HeaderMap::new();
    headers.insert(COUNTER_HEADER, HeaderValue::from(value.stamp.counter));
    if let Ok(origin) = HeaderValue::from_str(value.stamp.origin.as_str()) {
        headers.insert(ORIGIN_HEADER, origin);
    }
    let body = value.bytes().cloned().unwrap_or_default();
    Ok((StatusCode::OK, headers, body).into_response())
}

pub async fn put_key(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Query(query): Query<ConsistencyQuery>,
    body: Bytes,
) -> ApiResult<Json<WriteResponse>> {
    let level = query.level()?;
    let receipt = state
        .coordinator
        .put(Bytes::from(key.clone()), body, level)
        .await?;
    Ok(Json(write_response(key, receipt)))
}

pub async fn delete_key(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Query(query): Query<ConsistencyQuery>,
) -> ApiResult<Json<WriteResponse>> {
    let level = query.level()?;
    let receipt = state
        .coordinator
        .delete(Bytes::from(key.clone()), level)
        .await?;
    Ok(Json(write_response(key, receipt)))
}

fn write_response(key: String, receipt: WriteReceipt) -> WriteResponse {
    WriteResponse {
        key,
        counter: receipt.stamp.counter,
        origin: receipt.stamp.origin.to_string(),
        acks: receipt.acks,
        required: receipt.required,
        hinted: receipt.hinted,
    }
}

pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

pub async fn not_found() -> ApiError {
    ApiError::NotFound("no such route".to_string())
}
