//! # 服务商适配器模块
//!
//! 以封闭的能力集合适配不同上游 API 形态：构造探测请求、
//! 转发网关请求（换钥、清洗头部、可选出站代理）、提取错误载荷。
//! 新增服务商形态等于新增一个枚举变体。

mod gemini;
mod openai;

pub use gemini::GeminiAdapter;
pub use openai::OpenAiLikeAdapter;

use crate::classify::{MAX_ERROR_BODY_BYTES, RuleSet, classify};
use crate::config::{ProviderConfig, ProviderKind};
use crate::error::Result;
use crate::types::{CheckResult, ErrorReason};
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, RequestBuilder, Response};
use std::time::{Duration, Instant};

/// 逐跳头部，不允许向上游透传
///
/// Content-Length 必须移除：流式响应会改用 chunked 编码。
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "content-length",
    "content-encoding",
    "host",
];

/// 网关认证相关头部，转发前一律剥离并由适配器重写
const AUTH_HEADERS: &[&str] = &["authorization", "x-goog-api-key", "x-api-key"];

/// 非流式请求的总超时
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// 入站请求经解析后的转发要素
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// 服务商适配器（封闭能力集）
pub enum ProviderAdapter {
    OpenaiLike(OpenAiLikeAdapter),
    Gemini(GeminiAdapter),
}

impl ProviderAdapter {
    #[must_use]
    pub fn new(name: &str, config: &ProviderConfig) -> Self {
        match config.kind {
            ProviderKind::OpenaiLike => {
                Self::OpenaiLike(OpenAiLikeAdapter::new(name, &config.base_url))
            }
            ProviderKind::Gemini => Self::Gemini(GeminiAdapter::new(name, &config.base_url)),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::OpenaiLike(a) => a.name(),
            Self::Gemini(a) => a.name(),
        }
    }

    /// 构造最小成本的探测请求，同时验证认证与模型访问权
    #[must_use]
    pub fn build_probe_request(&self, client: &Client, key: &str, model: &str) -> RequestBuilder {
        match self {
            Self::OpenaiLike(a) => a.build_probe_request(client, key, model),
            Self::Gemini(a) => a.build_probe_request(client, key, model),
        }
        .timeout(REQUEST_TIMEOUT)
    }

    /// 从入站请求中解析目标模型
    pub fn parse_model(&self, path: &str, body: &[u8]) -> Result<String> {
        match self {
            Self::OpenaiLike(a) => a.parse_model(body),
            Self::Gemini(a) => a.parse_model(path),
        }
    }

    /// 转发请求到上游：重写认证、剥离逐跳头部
    ///
    /// 传输层失败（连接、超时）不会产生 HTTP 响应，折叠为失败的
    /// [`CheckResult`] 返回，绝不向外抛异常。
    pub async fn execute_request(
        &self,
        client: &Client,
        key: &str,
        inbound: &InboundRequest,
        streaming: bool,
    ) -> std::result::Result<Response, CheckResult> {
        let started = Instant::now();
        let mut builder = match self {
            Self::OpenaiLike(a) => a.build_upstream_request(client, key, inbound),
            Self::Gemini(a) => a.build_upstream_request(client, key, inbound),
        };
        builder = builder.headers(forwardable_headers(&inbound.headers));
        if !streaming {
            builder = builder.timeout(REQUEST_TIMEOUT);
        }

        builder
            .body(inbound.body.clone())
            .send()
            .await
            .map_err(|e| transport_failure(&e, started))
    }

    /// 执行一次探测并归一化结果
    ///
    /// 2xx 即成功（HTTP 200 带错误体的场景由 status_code=200 的规则
    /// 显式改判）；非 2xx 响应体在 256 KiB 上限内缓冲后交给分类器。
    pub async fn probe(
        &self,
        client: &Client,
        rules: &RuleSet,
        key: &str,
        model: &str,
    ) -> CheckResult {
        let started = Instant::now();
        let response = match self.build_probe_request(client, key, model).send().await {
            Ok(response) => response,
            Err(e) => return transport_failure(&e, started),
        };

        let status = response.status().as_u16();
        let body = read_capped_body(response).await;
        let latency_ms = elapsed_ms(started);

        if (200..300).contains(&status) {
            match rules.apply(status, &body) {
                Some(reason) => CheckResult::fail(
                    reason,
                    Some(status),
                    String::from_utf8_lossy(&body).into_owned(),
                    latency_ms,
                ),
                None => CheckResult::success(status, latency_ms),
            }
        } else {
            let reason = classify(status, &body, rules);
            CheckResult::fail(
                reason,
                Some(status),
                String::from_utf8_lossy(&body).into_owned(),
                latency_ms,
            )
        }
    }

    /// 把上游错误响应体提取为统一的 JSON 载荷
    ///
    /// 非 JSON 内容合成 `{"raw": text}`。
    #[must_use]
    pub fn extract_error(body: &[u8]) -> serde_json::Value {
        let trimmed: Vec<u8> = body
            .iter()
            .skip_while(|b| b.is_ascii_whitespace())
            .copied()
            .collect();
        if trimmed.first() == Some(&b'{') || trimmed.first() == Some(&b'[') {
            if let Ok(value) = serde_json::from_slice(&trimmed) {
                return value;
            }
        }
        serde_json::json!({ "raw": String::from_utf8_lossy(body) })
    }
}

/// 传输层错误折叠为 CheckResult，区分超时与其它网络故障
fn transport_failure(err: &reqwest::Error, started: Instant) -> CheckResult {
    let reason = if err.is_timeout() {
        ErrorReason::Timeout
    } else {
        ErrorReason::NetworkError
    };
    CheckResult::fail(reason, None, err.to_string(), elapsed_ms(started))
}

/// 在 256 KiB 上限内读取响应体，超出即截断
pub async fn read_capped_body(response: Response) -> Bytes {
    use futures::StreamExt;

    let mut stream = response.bytes_stream();
    let mut buf = Vec::new();
    while let Some(chunk) = stream.next().await {
        let Ok(chunk) = chunk else { break };
        let remaining = MAX_ERROR_BODY_BYTES.saturating_sub(buf.len());
        if remaining == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..chunk.len().min(remaining)]);
    }
    Bytes::from(buf)
}

/// 过滤可透传的入站头部：剥离逐跳头部与网关认证头部
fn forwardable_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in inbound {
        let lower = name.as_str().to_ascii_lowercase();
        if HOP_BY_HOP_HEADERS.contains(&lower.as_str()) || AUTH_HEADERS.contains(&lower.as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            headers.insert(name, value);
        }
    }
    headers
}

/// 解析入站方法字符串，非法值回退到 POST
pub(crate) fn parse_method(method: &str) -> Method {
    Method::from_bytes(method.to_ascii_uppercase().as_bytes()).unwrap_or(Method::POST)
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayPolicy;

    fn provider(kind: ProviderKind) -> ProviderConfig {
        ProviderConfig {
            enabled: true,
            kind,
            base_url: "https://api.example.com".to_string(),
            models: vec!["m1".to_string()],
            shared_key_status: false,
            proxy_url: None,
            gateway_policy: GatewayPolicy::default(),
            health_policy: None,
        }
    }

    #[test]
    fn test_adapter_dispatches_by_kind() {
        let openai = ProviderAdapter::new("foo", &provider(ProviderKind::OpenaiLike));
        assert!(matches!(openai, ProviderAdapter::OpenaiLike(_)));
        let gemini = ProviderAdapter::new("bar", &provider(ProviderKind::Gemini));
        assert!(matches!(gemini, ProviderAdapter::Gemini(_)));
    }

    #[test]
    fn test_forwardable_headers_strips_hop_by_hop_and_auth() {
        let mut inbound = HeaderMap::new();
        inbound.insert("authorization", HeaderValue::from_static("Bearer client"));
        inbound.insert("x-goog-api-key", HeaderValue::from_static("client-key"));
        inbound.insert("connection", HeaderValue::from_static("keep-alive"));
        inbound.insert("content-length", HeaderValue::from_static("42"));
        inbound.insert("content-type", HeaderValue::from_static("application/json"));
        inbound.insert("x-custom", HeaderValue::from_static("yes"));

        let filtered = forwardable_headers(&inbound);
        assert!(filtered.get("authorization").is_none());
        assert!(filtered.get("x-goog-api-key").is_none());
        assert!(filtered.get("connection").is_none());
        assert!(filtered.get("content-length").is_none());
        assert_eq!(filtered.get("content-type").unwrap(), "application/json");
        assert_eq!(filtered.get("x-custom").unwrap(), "yes");
    }

    #[test]
    fn test_extract_error_json_and_raw() {
        let json = ProviderAdapter::extract_error(br#"{"error":{"type":"Arrearage"}}"#);
        assert_eq!(json["error"]["type"], "Arrearage");

        let raw = ProviderAdapter::extract_error(b"upstream exploded");
        assert_eq!(raw["raw"], "upstream exploded");

        // 前导空白不影响 JSON 识别
        let padded = ProviderAdapter::extract_error(b"  {\"a\":1}");
        assert_eq!(padded["a"], 1);
    }

    #[test]
    fn test_parse_method_fallback() {
        assert_eq!(parse_method("GET"), Method::GET);
        assert_eq!(parse_method("post"), Method::POST);
        assert_eq!(parse_method("\n"), Method::POST);
    }
}
