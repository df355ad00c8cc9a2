//! # 调试日志
//!
//! 仅在请求路径、响应已缓冲之后输出。响应体截断到 10 KiB，
//! 带显式截断标记；内容按配置原样输出，不做脱敏。

use crate::config::DebugMode;
use crate::logging::{LogComponent, LogStage};
use crate::provider::InboundRequest;
use crate::linfo;
use reqwest::header::HeaderMap;

/// 调试日志中响应体的最大输出长度
pub const MAX_DEBUG_BODY_SIZE: usize = 10 * 1024;

/// 把字节体裁剪成调试输出文本
fn render_body(body: &[u8]) -> String {
    if body.len() > MAX_DEBUG_BODY_SIZE {
        let mut text = String::from_utf8_lossy(&body[..MAX_DEBUG_BODY_SIZE]).into_owned();
        text.push_str("... (truncated)");
        text
    } else {
        String::from_utf8_lossy(body).into_owned()
    }
}

fn render_headers(headers: &HeaderMap) -> String {
    let pairs: Vec<String> = headers
        .iter()
        .map(|(name, value)| {
            format!("{}: {}", name, String::from_utf8_lossy(value.as_bytes()))
        })
        .collect();
    pairs.join(", ")
}

/// 输出一次请求/响应交换的调试信息
pub fn log_exchange(
    mode: DebugMode,
    request_id: &str,
    provider: &str,
    inbound: &InboundRequest,
    response_status: u16,
    response_headers: &HeaderMap,
    response_body: &[u8],
) {
    if !mode.is_enabled() {
        return;
    }

    linfo!(
        request_id,
        LogStage::Response,
        LogComponent::Dispatch,
        "debug_exchange",
        "Upstream exchange captured",
        provider = provider,
        method = %inbound.method,
        path = %inbound.path,
        request_headers = %render_headers(&inbound.headers),
        response_status = response_status,
        response_headers = %render_headers(response_headers)
    );

    if mode == DebugMode::FullBody {
        linfo!(
            request_id,
            LogStage::Response,
            LogComponent::Dispatch,
            "debug_bodies",
            "Upstream exchange bodies",
            provider = provider,
            request_body = %render_body(&inbound.body),
            response_body = %render_body(response_body)
        );
    }
}
