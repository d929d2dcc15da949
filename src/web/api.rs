use super::AppState;
use crate::channels::OutgoingMessage;
use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/sessions", get(list_sessions))
        .route("/sessions/{id}/messages", get(get_session_messages))
        .route("/queue", get(queue_status))
        .route("/budget", get(budget_status))
        .route("/audit", get(audit_log))
        .route("/approvals", get(list_approvals))
        .route("/approvals/{id}/approve", post(approve_held))
        .route("/approvals/{id}/reject", post(reject_held))
        .route("/confirmations", get(list_confirmations))
        .route("/confirmations/{id}/execute", post(execute_confirmation))
        .route("/confirmations/{id}/cancel", post(cancel_confirmation))
}

#[derive(Serialize)]
struct SessionInfo {
    id: i64,
    channel: String,
    channel_key: String,
    agent: Option<String>,
    message_count: i64,
    cost_usd: f64,
    updated_at: u64,
}

async fn list_sessions(State(state): State<AppState>) -> Result<Json<Vec<SessionInfo>>, AppError> {
    let sessions = state.ctx.db.session_list_active(100).await?;
    let result = sessions
        .into_iter()
        .map(|s| SessionInfo {
            id: s.id,
            channel: s.channel,
            channel_key: s.channel_key,
            agent: s.agent,
            message_count: s.message_count,
            cost_usd: s.cost_usd,
            updated_at: s.updated_at,
        })
        .collect();
    Ok(Json(result))
}

#[derive(Deserialize)]
struct MessagesQuery {
    limit: Option<usize>,
}

async fn get_session_messages(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(q): Query<MessagesQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let messages = state.ctx.db.session_messages(id, q.limit.unwrap_or(50)).await?;
    Ok(Json(serde_json::to_value(
        messages
            .iter()
            .map(|m| {
                serde_json::json!({
                    "id": m.id,
                    "role": m.role,
                    "content": m.content,
                    "cost_usd": m.cost_usd,
                    "model": m.model,
                    "timestamp": m.timestamp,
                })
            })
            .collect::<Vec<_>>(),
    )?))
}

#[derive(Serialize)]
struct QueueStatus {
    pending: usize,
    failed: usize,
}

async fn queue_status(State(state): State<AppState>) -> Result<Json<QueueStatus>, AppError> {
    let todo = state.ctx.db.board_tasks_todo_assigned().await?;
    let failed = state.ctx.db.board_tasks_failed().await?;
    Ok(Json(QueueStatus { pending: todo.len(), failed: failed.len() }))
}

#[derive(Serialize)]
struct BudgetStatus {
    spent_today_usd: f64,
    spent_week_usd: f64,
    spent_month_usd: f64,
    daily_cap_usd: Option<f64>,
    weekly_cap_usd: Option<f64>,
    monthly_cap_usd: Option<f64>,
}

async fn budget_status(State(state): State<AppState>) -> Result<Json<BudgetStatus>, AppError> {
    let ((today, week, month), (daily_cap, weekly_cap, monthly_cap)) = state.ctx.budget.spend_snapshot().await?;
    Ok(Json(BudgetStatus {
        spent_today_usd: today,
        spent_week_usd: week,
        spent_month_usd: month,
        daily_cap_usd: daily_cap,
        weekly_cap_usd: weekly_cap,
        monthly_cap_usd: monthly_cap,
    }))
}

#[derive(Deserialize)]
struct AuditQuery {
    limit: Option<usize>,
}

#[derive(Serialize)]
struct AuditEntryResponse {
    id: i64,
    action: String,
    source: String,
    detail: Option<String>,
    timestamp: u64,
}

async fn audit_log(State(state): State<AppState>, Query(q): Query<AuditQuery>) -> Result<Json<Vec<AuditEntryResponse>>, AppError> {
    let limit = q.limit.unwrap_or(50);
    let entries = state.ctx.db.audit_query(limit).await?;
    let result = entries
        .into_iter()
        .map(|e| AuditEntryResponse {
            id: e.id.unwrap_or(0),
            action: e.action,
            source: e.source,
            detail: e.detail,
            timestamp: e.timestamp,
        })
        .collect();
    Ok(Json(result))
}

#[derive(Serialize)]
struct HeldResultResponse {
    id: String,
    agent: String,
    channel: String,
    session_id: String,
    output: String,
}

async fn list_approvals(State(state): State<AppState>) -> Json<Vec<HeldResultResponse>> {
    let ids = state.ctx.list_held();
    let held = state.ctx.held_results.lock().unwrap();
    let result = ids
        .into_iter()
        .filter_map(|id| {
            held.get(&id).map(|h| HeldResultResponse {
                id: id.clone(),
                agent: h.agent.clone(),
                channel: h.channel.clone(),
                session_id: h.session_id.clone(),
                output: h.output.clone(),
            })
        })
        .collect();
    Json(result)
}

async fn approve_held(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<serde_json::Value>, AppError> {
    let Some(held) = state.ctx.approve_held(&id) else {
        return Ok(Json(serde_json::json!({"approved": false})));
    };
    if let Some(adapter) = state.adapters.get(&held.channel) {
        adapter
            .send(OutgoingMessage {
                channel: held.channel.clone(),
                session_id: held.session_id.clone(),
                content: held.output.clone(),
                reply_to: None,
            })
            .await?;
    }
    Ok(Json(serde_json::json!({"approved": true})))
}

async fn reject_held(State(state): State<AppState>, Path(id): Path<String>) -> Json<serde_json::Value> {
    let rejected = state.ctx.reject_held(&id);
    Json(serde_json::json!({"rejected": rejected}))
}

#[derive(Serialize)]
struct PendingDispatchResponse {
    id: String,
    channel: String,
    session_id: String,
}

async fn list_confirmations(State(state): State<AppState>) -> Json<Vec<PendingDispatchResponse>> {
    let ids = state.ctx.list_pending_dispatch();
    let pending = state.ctx.pending_dispatch.lock().unwrap();
    let result = ids
        .into_iter()
        .filter_map(|id| {
            pending.get(&id).map(|p| PendingDispatchResponse {
                id: id.clone(),
                channel: p.channel.clone(),
                session_id: p.session_id.clone(),
            })
        })
        .collect();
    Json(result)
}

async fn execute_confirmation(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<serde_json::Value>, AppError> {
    let Some(pending) = state.ctx.take_pending_dispatch(&id) else {
        return Ok(Json(serde_json::json!({"executed": false})));
    };
    state.ctx.budget.take_pending(&id);
    let result = state.ctx.runner.run(pending.task).await?;
    if let Some(adapter) = state.adapters.get(&pending.channel) {
        adapter
            .send(OutgoingMessage {
                channel: pending.channel.clone(),
                session_id: pending.session_id.clone(),
                content: result.output.clone(),
                reply_to: None,
            })
            .await?;
    }
    Ok(Json(serde_json::json!({"executed": true})))
}

async fn cancel_confirmation(State(state): State<AppState>, Path(id): Path<String>) -> Json<serde_json::Value> {
    let cancelled = state.ctx.take_pending_dispatch(&id).is_some();
    state.ctx.budget.take_pending(&id);
    Json(serde_json::json!({"cancelled": cancelled}))
}

/// Unified error type for API handlers.
struct AppError(anyhow::Error);

impl axum::response::IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        (axum::http::StatusCode::INTERNAL_SERVER_ERROR, self.0.to_string()).into_response()
    }
}

impl<E: Into<anyhow::Error>> From<E> for AppError {
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
