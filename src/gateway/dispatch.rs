//! # 调度引擎
//!
//! 端到端处理单个入站请求：取键、转发、失败分类、换键重试。
//! 首个响应字节送达客户端后请求即已提交，不再重试。

use super::debug_log;
use crate::app::AppContext;
use crate::classify::classify;
use crate::key_pool::CachedKey;
use crate::logging::{LogComponent, LogStage};
use crate::metrics;
use crate::provider::{HOP_BY_HOP_HEADERS, InboundRequest, ProviderAdapter, read_capped_body};
use crate::types::{CheckResult, ErrorReason};
use crate::{ldebug, lerror, linfo, lwarn};
use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashSet;
use std::time::{Duration, Instant};

/// Retry-After 的最大允许等待
const RETRY_AFTER_CAP: Duration = Duration::from_secs(5);

/// 失败分类到重试决策的映射
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// 惩罚当前密钥并换键重试
    RetryMarkBad,
    /// 客户端问题：原样回传上游响应，不惩罚密钥
    SurfaceNoPenalty,
    /// 未知错误：软惩罚密钥，但按客户端问题处理，不再重试
    SurfaceSoftBad,
}

/// 由错误原因决定重试与惩罚行为
#[must_use]
pub const fn retry_action(reason: ErrorReason) -> RetryAction {
    match reason {
        ErrorReason::BadRequest => RetryAction::SurfaceNoPenalty,
        ErrorReason::Unknown => RetryAction::SurfaceSoftBad,
        _ => RetryAction::RetryMarkBad,
    }
}

/// 上一次失败的上游响应快照，耗尽重试后原样回传
struct LastFailure {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

/// 端到端调度一个入站请求
pub async fn dispatch(
    ctx: &AppContext,
    request_id: &str,
    provider_name: &str,
    model: &str,
    inbound: InboundRequest,
) -> Response {
    let started = Instant::now();

    let Some(provider_cfg) = ctx.provider(provider_name) else {
        return error_response(StatusCode::NOT_FOUND, "unknown_provider");
    };
    let Some(adapter) = ctx.adapter(provider_name) else {
        return error_response(StatusCode::NOT_FOUND, "unknown_provider");
    };
    let rules = ctx.rules_for(provider_name).clone();

    let client = match ctx.clients.client_for_provider(provider_name).await {
        Ok(client) => client,
        Err(e) => {
            lerror!(
                request_id,
                LogStage::Internal,
                LogComponent::Dispatch,
                "client_unavailable",
                "Failed to obtain upstream client",
                provider = provider_name,
                error = %e
            );
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error");
        }
    };

    let debug_mode = provider_cfg.effective_debug_mode(ctx.config.gateway.debug_mode);
    let streaming = provider_cfg.effective_streaming_mode(ctx.config.gateway.streaming_mode)
        == crate::config::StreamingMode::Auto
        && !debug_mode.is_enabled()
        && wants_stream(&inbound);

    let max_attempts = provider_cfg.gateway_policy.retry.max_attempts.max(1);
    let mut tried: HashSet<String> = HashSet::new();
    let mut last_failure: Option<LastFailure> = None;
    let mut attempts_made: u32 = 0;

    while attempts_made < max_attempts {
        let Some(key) = ctx.cache.acquire(provider_name, model, &tried).await else {
            // 池空是唯一由网关自身产生的 503
            lwarn!(
                request_id,
                LogStage::Scheduling,
                LogComponent::Dispatch,
                "pool_empty",
                "No healthy keys available",
                provider = provider_name,
                model = model,
                attempts = attempts_made
            );
            metrics::record_gateway_request(provider_name, 503);
            return no_healthy_keys_response();
        };
        attempts_made += 1;

        ldebug!(
            request_id,
            LogStage::UpstreamRequest,
            LogComponent::Dispatch,
            "attempt",
            "Forwarding request upstream",
            provider = provider_name,
            model = model,
            attempt = attempts_made,
            streaming = streaming
        );

        match adapter
            .execute_request(&client, &key.key_value, &inbound, streaming)
            .await
        {
            Ok(response) if response.status().is_success() => {
                return forward_success(
                    request_id,
                    provider_name,
                    model,
                    &inbound,
                    response,
                    streaming,
                    debug_mode,
                    started,
                )
                .await;
            }
            Ok(response) => {
                let status = response.status();
                let headers = response.headers().clone();
                let body = read_capped_body(response).await;
                let reason = classify(status.as_u16(), &body, &rules);

                lwarn!(
                    request_id,
                    LogStage::ResponseFailure,
                    LogComponent::Dispatch,
                    "upstream_failure",
                    "Upstream returned a failure before first byte was committed",
                    provider = provider_name,
                    model = model,
                    status = status.as_u16(),
                    reason = reason.as_str(),
                    attempt = attempts_made,
                    error_payload = %ProviderAdapter::extract_error(&body)
                );
                debug_log::log_exchange(
                    debug_mode,
                    request_id,
                    provider_name,
                    &inbound,
                    status.as_u16(),
                    &headers,
                    &body,
                );

                match retry_action(reason) {
                    RetryAction::SurfaceNoPenalty => {
                        metrics::record_gateway_request(provider_name, status.as_u16());
                        metrics::record_gateway_latency(
                            provider_name,
                            started.elapsed().as_secs_f64(),
                        );
                        return surface_upstream(status, &headers, body, None);
                    }
                    RetryAction::SurfaceSoftBad => {
                        mark_bad(ctx, request_id, provider_name, model, &key, reason).await;
                        metrics::record_gateway_request(provider_name, status.as_u16());
                        return surface_upstream(status, &headers, body, None);
                    }
                    RetryAction::RetryMarkBad => {
                        mark_bad(ctx, request_id, provider_name, model, &key, reason).await;
                        tried.insert(key.key_hash.clone());
                        let delay = if reason.is_retryable() {
                            retry_after_delay(&headers)
                        } else {
                            None
                        };
                        last_failure = Some(LastFailure {
                            status,
                            headers,
                            body,
                        });
                        if attempts_made < max_attempts
                            && let Some(delay) = delay
                        {
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }
            Err(check) => {
                let reason = check.reason_or_unknown();
                lwarn!(
                    request_id,
                    LogStage::ResponseFailure,
                    LogComponent::Dispatch,
                    "transport_failure",
                    "Upstream request failed before any response",
                    provider = provider_name,
                    model = model,
                    reason = reason.as_str(),
                    detail = %check.message,
                    attempt = attempts_made
                );
                mark_bad(ctx, request_id, provider_name, model, &key, reason).await;
                tried.insert(key.key_hash.clone());
                last_failure = Some(synthesize_transport_failure(&check));
            }
        }
    }

    // 重试耗尽：原样回传最后一次上游失败
    let failure = last_failure.unwrap_or(LastFailure {
        status: StatusCode::SERVICE_UNAVAILABLE,
        headers: HeaderMap::new(),
        body: Bytes::from_static(br#"{"error":"no_healthy_keys"}"#),
    });
    metrics::record_gateway_request(provider_name, failure.status.as_u16());
    metrics::record_gateway_latency(provider_name, started.elapsed().as_secs_f64());
    linfo!(
        request_id,
        LogStage::ResponseFailure,
        LogComponent::Dispatch,
        "retries_exhausted",
        "All retry attempts exhausted, surfacing last upstream response",
        provider = provider_name,
        model = model,
        attempts = attempts_made,
        status = failure.status.as_u16()
    );
    surface_upstream(
        failure.status,
        &failure.headers,
        failure.body,
        Some(attempts_made),
    )
}

/// 成功响应：流式透传或整体缓冲后回传
#[allow(clippy::too_many_arguments)]
async fn forward_success(
    request_id: &str,
    provider_name: &str,
    model: &str,
    inbound: &InboundRequest,
    response: reqwest::Response,
    streaming: bool,
    debug_mode: crate::config::DebugMode,
    started: Instant,
) -> Response {
    let status = response.status();
    let filtered = filter_response_headers(response.headers());
    metrics::record_gateway_request(provider_name, status.as_u16());
    metrics::record_gateway_latency(provider_name, started.elapsed().as_secs_f64());

    if streaming {
        let monitor = StreamLog {
            request_id: request_id.to_string(),
            provider: provider_name.to_string(),
            model: model.to_string(),
            status: status.as_u16(),
            started,
        };
        let stream = response.bytes_stream().inspect(move |_| {
            // 守卫随流体一起存活，流结束或客户端断开时输出访问日志
            let _ = &monitor;
        });
        return build_response(status, filtered, Body::from_stream(stream));
    }

    let body = match response.bytes().await {
        Ok(body) => body,
        Err(e) => {
            lerror!(
                request_id,
                LogStage::ResponseFailure,
                LogComponent::Dispatch,
                "buffer_failed",
                "Failed to buffer committed upstream response",
                provider = provider_name,
                error = %e
            );
            Bytes::new()
        }
    };
    debug_log::log_exchange(
        debug_mode,
        request_id,
        provider_name,
        inbound,
        status.as_u16(),
        &filtered,
        &body,
    );
    linfo!(
        request_id,
        LogStage::Response,
        LogComponent::Dispatch,
        "request_completed",
        "Request completed with buffered response",
        provider = provider_name,
        model = model,
        status = status.as_u16(),
        duration_ms = started.elapsed().as_millis() as u64
    );
    build_response(status, filtered, Body::from(body))
}

/// 把密钥标记为不可用，持久化失败只记日志，不影响请求路径
async fn mark_bad(
    ctx: &AppContext,
    request_id: &str,
    provider_name: &str,
    model: &str,
    key: &CachedKey,
    reason: ErrorReason,
) {
    if let Err(e) = ctx
        .cache
        .mark_bad(provider_name, model, key, reason)
        .await
    {
        lerror!(
            request_id,
            LogStage::Cache,
            LogComponent::Dispatch,
            "mark_bad_failed",
            "Failed to persist key penalty",
            provider = provider_name,
            reason = reason.as_str(),
            error = %e
        );
    }
}

/// 传输层失败没有上游响应，合成一个可回传的快照
fn synthesize_transport_failure(check: &CheckResult) -> LastFailure {
    let (status, reason) = match check.reason_or_unknown() {
        ErrorReason::Timeout => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
        _ => (StatusCode::BAD_GATEWAY, "network_error"),
    };
    LastFailure {
        status,
        headers: HeaderMap::new(),
        body: Bytes::from(format!(r#"{{"error":"{reason}"}}"#)),
    }
}

/// 客户端是否以 SSE 方式消费响应
fn wants_stream(inbound: &InboundRequest) -> bool {
    if inbound.path.contains(":streamGenerateContent") {
        return true;
    }
    if let Some(query) = &inbound.query
        && query.split('&').any(|pair| pair == "alt=sse")
    {
        return true;
    }
    if inbound
        .headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("text/event-stream"))
    {
        return true;
    }
    serde_json::from_slice::<serde_json::Value>(&inbound.body)
        .ok()
        .and_then(|v| v.get("stream").and_then(serde_json::Value::as_bool))
        .unwrap_or(false)
}

/// 解析 Retry-After 秒数，最高等待 5 秒
fn retry_after_delay(headers: &HeaderMap) -> Option<Duration> {
    let seconds: u64 = headers
        .get(header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()?;
    Some(RETRY_AFTER_CAP.min(Duration::from_secs(seconds)))
}

/// 过滤回传给客户端的响应头（逐跳头部不透传）
fn filter_response_headers(headers: &HeaderMap) -> HeaderMap {
    let mut filtered = HeaderMap::new();
    for (name, value) in headers {
        if HOP_BY_HOP_HEADERS.contains(&name.as_str().to_ascii_lowercase().as_str()) {
            continue;
        }
        filtered.insert(name.clone(), value.clone());
    }
    filtered
}

/// 原样回传上游响应；耗尽重试时附带 X-Gateway-Retries 头
fn surface_upstream(
    status: StatusCode,
    headers: &HeaderMap,
    body: Bytes,
    retries: Option<u32>,
) -> Response {
    let mut filtered = filter_response_headers(headers);
    if let Some(retries) = retries
        && let Ok(value) = HeaderValue::from_str(&retries.to_string())
    {
        filtered.insert("x-gateway-retries", value);
    }
    build_response(status, filtered, Body::from(body))
}

/// 池空时的网关自产 503
fn no_healthy_keys_response() -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(header::RETRY_AFTER, HeaderValue::from_static("30"));
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    build_response(
        StatusCode::SERVICE_UNAVAILABLE,
        headers,
        Body::from(r#"{"error":"no_healthy_keys"}"#),
    )
}

/// 网关自产错误响应
pub(super) fn error_response(status: StatusCode, error: &str) -> Response {
    let body = serde_json::json!({ "error": error }).to_string();
    let mut response = (status, body).into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

fn build_response(status: StatusCode, headers: HeaderMap, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// 流式响应守卫：流体释放时输出访问日志
struct StreamLog {
    request_id: String,
    provider: String,
    model: String,
    status: u16,
    started: Instant,
}

impl Drop for StreamLog {
    fn drop(&mut self) {
        linfo!(
            &self.request_id,
            LogStage::Response,
            LogComponent::Dispatch,
            "stream_closed",
            "Streamed response finished",
            provider = %self.provider,
            model = %self.model,
            status = self.status,
            duration_ms = self.started.elapsed().as_millis() as u64
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_action_mapping() {
        for reason in [
            ErrorReason::InvalidKey,
            ErrorReason::NoAccess,
            ErrorReason::NoQuota,
            ErrorReason::NoModel,
            ErrorReason::RateLimited,
            ErrorReason::ServerError,
            ErrorReason::Overloaded,
            ErrorReason::ServiceUnavailable,
            ErrorReason::Timeout,
            ErrorReason::NetworkError,
        ] {
            assert_eq!(retry_action(reason), RetryAction::RetryMarkBad);
        }
        assert_eq!(
            retry_action(ErrorReason::BadRequest),
            RetryAction::SurfaceNoPenalty
        );
        assert_eq!(
            retry_action(ErrorReason::Unknown),
            RetryAction::SurfaceSoftBad
        );
    }

    #[test]
    fn test_retry_after_is_capped() {
        let mut headers = HeaderMap::new();
        headers.insert(header::RETRY_AFTER, HeaderValue::from_static("2"));
        assert_eq!(retry_after_delay(&headers), Some(Duration::from_secs(2)));

        headers.insert(header::RETRY_AFTER, HeaderValue::from_static("3600"));
        assert_eq!(retry_after_delay(&headers), Some(Duration::from_secs(5)));

        headers.insert(header::RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct"));
        assert_eq!(retry_after_delay(&headers), None);
    }

    #[test]
    fn test_wants_stream_signals() {
        let base = InboundRequest {
            method: "POST".to_string(),
            path: "/v1/chat/completions".to_string(),
            query: None,
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"{}"),
        };
        assert!(!wants_stream(&base));

        let body_flag = InboundRequest {
            body: Bytes::from_static(br#"{"stream":true}"#),
            ..base.clone()
        };
        assert!(wants_stream(&body_flag));

        let mut accept = base.clone();
        accept
            .headers
            .insert(header::ACCEPT, HeaderValue::from_static("text/event-stream"));
        assert!(wants_stream(&accept));

        let gemini = InboundRequest {
            path: "/v1beta/models/g:streamGenerateContent".to_string(),
            ..base.clone()
        };
        assert!(wants_stream(&gemini));

        let sse_query = InboundRequest {
            query: Some("alt=sse".to_string()),
            ..base
        };
        assert!(wants_stream(&sse_query));
    }

    #[test]
    fn test_no_healthy_keys_response_shape() {
        let response = no_healthy_keys_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            "30"
        );
    }

    #[test]
    fn test_surface_attaches_retry_header_only_when_exhausted() {
        let headers = HeaderMap::new();
        let surfaced = surface_upstream(
            StatusCode::TOO_MANY_REQUESTS,
            &headers,
            Bytes::from_static(b"{}"),
            Some(3),
        );
        assert_eq!(
            surfaced.headers().get("x-gateway-retries").unwrap(),
            "3"
        );

        let verbatim = surface_upstream(
            StatusCode::BAD_REQUEST,
            &headers,
            Bytes::from_static(b"{}"),
            None,
        );
        assert!(verbatim.headers().get("x-gateway-retries").is_none());
    }

    #[test]
    fn test_transport_failure_synthesis() {
        let timeout = CheckResult::fail(ErrorReason::Timeout, None, "deadline", 60_000);
        let failure = synthesize_transport_failure(&timeout);
        assert_eq!(failure.status, StatusCode::GATEWAY_TIMEOUT);

        let network = CheckResult::fail(ErrorReason::NetworkError, None, "refused", 3);
        assert_eq!(
            synthesize_transport_failure(&network).status,
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_response_header_filtering() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::TRANSFER_ENCODING,
            HeaderValue::from_static("chunked"),
        );
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
        let filtered = filter_response_headers(&headers);
        assert!(filtered.get(header::TRANSFER_ENCODING).is_none());
        assert_eq!(
            filtered.get(header::CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );
    }
}
