use axum::{
    extract::{Query, State},
    Json,
};
use membership::MemberInfo;
use replication::HintStats;
use serde::Deserialize;
use std::sync::Arc;
use topology::{PartitionOwner, Partitioner};

use crate::{ApiError, ApiResult, AppState, RingNode, RingResponse, StatusResponse};

pub async fn status(State(state): State<Arc<AppState>>) -> ApiResult<Json<StatusResponse>> {
    let ctx = state.coordinator.context();
    let view = ctx.topology().snapshot();
    let stats = ctx
        .storage()
        .stats()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let pending_hints = ctx.handoff().stats().iter().map(|s| s.queued).sum();

    Ok(Json(StatusResponse {
        node_id: ctx.local().to_string(),
        ring_epoch: view.epoch,
        members: view.members.len(),
        vnodes: view.ring.len(),
        clock: ctx.clock().current().await,
        live_keys: stats.live_keys,
        tombstones: stats.tombstones,
        value_bytes: stats.value_bytes,
        pending_hints,
    }))
}

pub async fn membership(State(state): State<Arc<AppState>>) -> Json<Vec<MemberInfo>> {
    Json(state.membership.members().await)
}

pub async fn ring(State(state): State<Arc<AppState>>) -> Json<RingResponse> {
    let view = state.coordinator.context().topology().snapshot();
    let ownership = view.ring.ownership();
    let nodes = view
        .members
        .values()
        .map(|entry| RingNode {
            id: entry.id.to_string(),
            peer_addr: entry.peer_addr.clone(),
            api_addr: entry.api_addr.clone(),
            vnodes: view.ring.iter().filter(|vnode| vnode.node == entry.id).count(),
            ownership: ownership.get(&entry.id).copied().unwrap_or(0.0),
        })
        .collect();

    Json(RingResponse {
        epoch: view.epoch,
        vnodes: view.ring.len(),
        replication_factor: state.replication_factor,
        nodes,
    })
}

#[derive(Debug, Deserialize)]
pub struct PartitionQuery {
    shift: Option<u8>,
}

/// Replica set of every logical partition, `2^shift` of them (default 8).
pub async fn partitions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PartitionQuery>,
) -> ApiResult<Json<Vec<PartitionOwner>>> {
    let partitioner = Partitioner::new(query.shift.unwrap_or(8).min(16))
        .map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
    let view = state.coordinator.context().topology().snapshot();
    Ok(Json(partitioner.owners(&view.ring, state.replication_factor)))
}

pub async fn hints(State(state): State<Arc<AppState>>) -> Json<Vec<HintStats>> {
    Json(state.coordinator.context().handoff().stats())
}
