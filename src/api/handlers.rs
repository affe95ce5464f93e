use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use std::sync::Arc;

use crate::db::{ChainStatus, CursorStatus, TransferQuery};
use crate::indexer::{ControlError, StartFrom};
use crate::rpc::rate_limiter;

use super::types::*;
use super::AppState;

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

fn api_error(status: StatusCode, msg: impl Into<String>) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            error: msg.into(),
        }),
    )
}

fn internal(e: eyre::Report) -> (StatusCode, Json<ErrorResponse>) {
    api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e))
}

fn control_error(e: ControlError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &e {
        ControlError::UnknownChain(_) => StatusCode::NOT_FOUND,
        ControlError::AlreadyRunning(_)
        | ControlError::Starting(_)
        | ControlError::NotRunning(_) => StatusCode::CONFLICT,
        ControlError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    api_error(status, e.to_string())
}

// ============================================================
// Health
// ============================================================

pub async fn health(State(state): State<Arc<AppState>>) -> ApiResult<HealthResponse> {
    let statuses = state.store.list_statuses().await.map_err(internal)?;
    let degraded = statuses.iter().any(|s| s.status == CursorStatus::Error);

    Ok(Json(HealthResponse {
        status: if degraded { "degraded" } else { "ok" }.to_string(),
        chains: statuses
            .into_iter()
            .map(|s| ChainHealth {
                chain_id: s.chain_id,
                status: s.status.as_str().to_string(),
                last_indexed_block: s.last_indexed_block,
            })
            .collect(),
        endpoints: rate_limiter::snapshot_all()
            .into_iter()
            .map(|(url, stats)| EndpointHealth { url, stats })
            .collect(),
    }))
}

// ============================================================
// Chains
// ============================================================

pub async fn list_chains(State(state): State<Arc<AppState>>) -> ApiResult<ChainsResponse> {
    state
        .store
        .list_statuses()
        .await
        .map(|chains| Json(ChainsResponse { chains }))
        .map_err(internal)
}

pub async fn chain_status(
    State(state): State<Arc<AppState>>,
    Path(chain_id): Path<i64>,
) -> ApiResult<ChainStatus> {
    match state.store.chain_status(chain_id).await.map_err(internal)? {
        Some(status) => Ok(Json(status)),
        None => Err(api_error(
            StatusCode::NOT_FOUND,
            format!("No cursor for chain {}", chain_id),
        )),
    }
}

pub async fn start_chain(
    State(state): State<Arc<AppState>>,
    Path(chain_id): Path<i64>,
    Json(body): Json<StartRequest>,
) -> ApiResult<ControlResponse> {
    let from = match body.from_block {
        None => StartFrom::Configured,
        Some(FromBlock::Number(n)) => StartFrom::Block(n),
        Some(FromBlock::Tag(tag)) if tag == "latest" => StartFrom::Latest,
        Some(FromBlock::Tag(tag)) => {
            return Err(api_error(
                StatusCode::BAD_REQUEST,
                format!("Invalid from_block: {}", tag),
            ))
        }
    };

    state
        .controller
        .start(chain_id, from)
        .await
        .map_err(control_error)?;

    Ok(Json(ControlResponse {
        chain_id,
        status: CursorStatus::Running.as_str().to_string(),
    }))
}

pub async fn stop_chain(
    State(state): State<Arc<AppState>>,
    Path(chain_id): Path<i64>,
) -> ApiResult<ControlResponse> {
    state
        .controller
        .stop(chain_id)
        .await
        .map_err(control_error)?;

    Ok(Json(ControlResponse {
        chain_id,
        status: CursorStatus::Stopped.as_str().to_string(),
    }))
}

// ============================================================
// Transfers
// ============================================================

pub async fn list_transfers(
    State(state): State<Arc<AppState>>,
    Query(params): Query<TransferParams>,
) -> ApiResult<TransfersResponse> {
    let limit = params.limit.unwrap_or(100).clamp(1, 1000);
    let offset = params.offset.unwrap_or(0).max(0);

    let query = TransferQuery {
        chain_id: params.chain_id,
        from_block: params.from_block,
        to_block: params.to_block,
        address: params.address,
        limit,
        offset,
    };

    let transfers = state.store.list_transfers(&query).await.map_err(internal)?;
    Ok(Json(TransfersResponse {
        transfers,
        limit,
        offset,
    }))
}
