//! # 网关 HTTP 服务器
//!
//! Axum 路由与请求入口：认证、模型解析、调度转发，
//! 以及 /metrics 与 /healthz 两个运维端点。

use super::dispatch::{dispatch, error_response};
use crate::app::AppContext;
use crate::error::{GatewayError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::metrics;
use crate::provider::InboundRequest;
use crate::{ldebug, linfo, lwarn};
use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

/// 池大小指标的刷新周期
const POOL_GAUGE_INTERVAL: Duration = Duration::from_secs(30);

/// 密钥池整体重载周期，让恢复的密钥回到在用池
const POOL_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

/// 网关应用状态
#[derive(Clone)]
pub struct AppState {
    context: Arc<AppContext>,
}

impl AppState {
    #[must_use]
    pub const fn new(context: Arc<AppContext>) -> Self {
        Self { context }
    }
}

impl Deref for AppState {
    type Target = AppContext;

    fn deref(&self) -> &Self::Target {
        &self.context
    }
}

/// 构建网关路由
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_endpoint))
        .route("/v1/{provider}/chat/completions", post(chat_completions))
        .route("/v1beta/models/{model_action}", post(gemini_generate))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// 启动网关服务
pub async fn serve(context: Arc<AppContext>, addr: SocketAddr) -> Result<()> {
    let router = create_router(AppState::new(context.clone()));

    // 周期性导出各池的密钥数量与数据库口径的状态汇总
    let gauge_context = context.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(POOL_GAUGE_INTERVAL);
        loop {
            ticker.tick().await;
            for (pool, size) in gauge_context.cache.pool_sizes().await {
                metrics::set_pool_size(&pool.provider, &pool.model, size);
            }
            match gauge_context.repo.status_summary().await {
                Ok(summary) => {
                    for item in summary {
                        metrics::set_key_status_count(
                            &item.provider,
                            &item.model,
                            &item.status,
                            item.count,
                        );
                    }
                }
                Err(e) => {
                    lwarn!(
                        "system",
                        LogStage::Db,
                        LogComponent::Metrics,
                        "status_summary_failed",
                        "Failed to refresh key status metrics",
                        error = %e
                    );
                }
            }
        }
    });

    // 周期性重载密钥池，惩罚到期的密钥重新参与调度
    let refresh_context = context.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(POOL_REFRESH_INTERVAL);
        loop {
            ticker.tick().await;
            refresh_context.cache.refresh_all().await;
        }
    });

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| GatewayError::network_with_source("网关监听端口绑定失败", e))?;

    linfo!(
        "system",
        LogStage::Startup,
        LogComponent::Gateway,
        "gateway_listening",
        "Gateway service listening",
        addr = %addr
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| GatewayError::internal_with_source("网关服务异常退出", e))?;

    linfo!(
        "system",
        LogStage::Shutdown,
        LogComponent::Gateway,
        "gateway_stopped",
        "Gateway service stopped"
    );
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// OpenAI 兼容入口：模型名在请求体里
async fn chat_completions(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = Uuid::new_v4().to_string();

    if let Err(response) = authenticate(&state, &request_id, &headers) {
        return response;
    }

    let Some(provider_cfg) = state.provider(&provider) else {
        return error_response(StatusCode::NOT_FOUND, "unknown_provider");
    };
    let Some(adapter) = state.adapter(&provider) else {
        return error_response(StatusCode::NOT_FOUND, "unknown_provider");
    };

    // 上游路径：剥掉网关自身的 /v1/{provider} 前缀
    let upstream_path = "/v1/chat/completions".to_string();
    let model = match adapter.parse_model(&upstream_path, &body) {
        Ok(model) => model,
        Err(e) => return bad_request(&request_id, &provider, &e),
    };
    if !provider_cfg.allows_model(&model) {
        return error_response(StatusCode::BAD_REQUEST, "model_not_permitted");
    }

    ldebug!(
        &request_id,
        LogStage::RequestStart,
        LogComponent::Gateway,
        "request_accepted",
        "Inbound chat completion request",
        provider = %provider,
        model = %model
    );

    let inbound = InboundRequest {
        method: "POST".to_string(),
        path: upstream_path,
        query,
        headers,
        body,
    };
    dispatch(&state, &request_id, &provider, &model, inbound).await
}

/// Gemini 兼容入口：模型名在 URL 路径里
///
/// 路径不携带服务商名，按「启用中且允许该模型的 Gemini 形态服务商」
/// 解析，名称排序保证选择稳定。
async fn gemini_generate(
    State(state): State<AppState>,
    Path(model_action): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = Uuid::new_v4().to_string();

    if let Err(response) = authenticate(&state, &request_id, &headers) {
        return response;
    }

    let path = format!("/v1beta/models/{model_action}");
    let Some(model) = model_action.split(':').next().filter(|m| !m.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "missing_model");
    };

    let mut candidates: Vec<&String> = state
        .enabled_providers()
        .filter(|(_, p)| p.kind == crate::config::ProviderKind::Gemini && p.allows_model(model))
        .map(|(name, _)| name)
        .collect();
    candidates.sort();
    let Some(provider) = candidates.first().map(|s| (*s).clone()) else {
        return error_response(StatusCode::BAD_REQUEST, "model_not_permitted");
    };

    ldebug!(
        &request_id,
        LogStage::RequestStart,
        LogComponent::Gateway,
        "request_accepted",
        "Inbound Gemini generate request",
        provider = %provider,
        model = %model
    );

    let inbound = InboundRequest {
        method: "POST".to_string(),
        path,
        query,
        headers,
        body,
    };
    dispatch(&state, &request_id, &provider, model, inbound).await
}

/// Prometheus 指标端点
async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => error_response(StatusCode::NOT_FOUND, "metrics_disabled"),
    }
}

/// 健康检查：数据库可达即为健康
async fn healthz(State(state): State<AppState>) -> Response {
    if state.repo.check_connection().await {
        (StatusCode::OK, "ok").into_response()
    } else {
        error_response(StatusCode::SERVICE_UNAVAILABLE, "database_unreachable")
    }
}

/// 校验静态共享令牌
///
/// 支持 `Authorization: Bearer <token>` 与 `x-goog-api-key: <token>` 两种携带方式。
fn authenticate(
    state: &AppState,
    request_id: &str,
    headers: &HeaderMap,
) -> std::result::Result<(), Response> {
    let token = extract_token(headers);
    match token {
        Some(token) if token == state.config.gateway.auth_token => Ok(()),
        Some(_) => {
            ldebug!(
                request_id,
                LogStage::Authentication,
                LogComponent::Gateway,
                "invalid_token",
                "Rejected request with invalid token"
            );
            Err(error_response(StatusCode::UNAUTHORIZED, "invalid_token"))
        }
        None => Err(error_response(StatusCode::UNAUTHORIZED, "missing_token")),
    }
}

/// 从请求头提取令牌：Bearer 优先，其次 x-goog-api-key
fn extract_token(headers: &HeaderMap) -> Option<&str> {
    if let Some(auth) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = auth.strip_prefix("Bearer ").or_else(|| auth.strip_prefix("bearer ")) {
            return Some(token);
        }
    }
    headers.get("x-goog-api-key").and_then(|v| v.to_str().ok())
}

/// 非法入站请求：不触碰上游，直接 400
fn bad_request(request_id: &str, provider: &str, err: &GatewayError) -> Response {
    ldebug!(
        request_id,
        LogStage::RequestStart,
        LogComponent::Gateway,
        "bad_request",
        "Rejected malformed inbound request",
        provider = provider,
        error = %err
    );
    let message = match err {
        GatewayError::Business { message } => message.clone(),
        other => other.to_string(),
    };
    let body = serde_json::json!({ "error": message }).to_string();
    (StatusCode::BAD_REQUEST, [(header::CONTENT_TYPE, "application/json")], body).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_token_priority() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            header::HeaderValue::from_static("Bearer abc"),
        );
        headers.insert("x-goog-api-key", header::HeaderValue::from_static("xyz"));
        assert_eq!(extract_token(&headers), Some("abc"));

        headers.remove(header::AUTHORIZATION);
        assert_eq!(extract_token(&headers), Some("xyz"));

        headers.clear();
        assert_eq!(extract_token(&headers), None);

        headers.insert(
            header::AUTHORIZATION,
            header::HeaderValue::from_static("Basic abc"),
        );
        assert_eq!(extract_token(&headers), None);
    }
}
