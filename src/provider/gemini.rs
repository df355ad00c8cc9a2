//! # Gemini 适配器
//!
//! Google Generative Language API 形态：模型名在 URL 路径里，
//! 认证使用 x-goog-api-key 头或 key 查询参数。

use super::{InboundRequest, parse_method};
use crate::error::Result;
use crate::business_error;
use regex::Regex;
use reqwest::{Client, RequestBuilder};
use serde_json::json;
use std::sync::LazyLock;

/// 从 Gemini 风格路径中提取模型名
/// 形如 /v1beta/models/gemini-2.5-pro:generateContent
static MODEL_FROM_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/models/([^:/]+)").expect("模型路径正则不合法"));

/// Gemini 服务商适配器
pub struct GeminiAdapter {
    name: String,
    base_url: String,
}

impl GeminiAdapter {
    #[must_use]
    pub fn new(name: &str, base_url: &str) -> Self {
        Self {
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 最小成本探测：单 token 的 generateContent 请求
    #[must_use]
    pub fn build_probe_request(&self, client: &Client, key: &str, model: &str) -> RequestBuilder {
        let payload = json!({
            "contents": [{"parts": [{"text": "ping"}]}],
            "generationConfig": {"maxOutputTokens": 1},
        });
        client
            .post(format!(
                "{}/v1beta/models/{model}:generateContent?key={key}",
                self.base_url
            ))
            .json(&payload)
    }

    /// 从 URL 路径解析模型名，请求体在此形态下无关
    pub fn parse_model(&self, path: &str) -> Result<String> {
        MODEL_FROM_PATH
            .captures(path)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| business_error!("无法从路径中解析模型名: {}", path))
    }

    /// 换钥并构造上游请求
    ///
    /// 入站 query 中的 key 参数被丢弃，凭证统一走 x-goog-api-key 头。
    #[must_use]
    pub fn build_upstream_request(
        &self,
        client: &Client,
        key: &str,
        inbound: &InboundRequest,
    ) -> RequestBuilder {
        let mut url = format!("{}{}", self.base_url, inbound.path);
        if let Some(query) = &inbound.query {
            let sanitized: Vec<&str> = query
                .split('&')
                .filter(|pair| !pair.starts_with("key=") && !pair.is_empty())
                .collect();
            if !sanitized.is_empty() {
                url.push('?');
                url.push_str(&sanitized.join("&"));
            }
        }
        client
            .request(parse_method(&inbound.method), url)
            .header("x-goog-api-key", key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_model_from_path() {
        let adapter = GeminiAdapter::new("gem", "https://generativelanguage.googleapis.com");
        assert_eq!(
            adapter
                .parse_model("/v1beta/models/gemini-2.5-pro:generateContent")
                .unwrap(),
            "gemini-2.5-pro"
        );
        assert_eq!(
            adapter
                .parse_model("/v1beta/models/gemini-2.5-flash:streamGenerateContent")
                .unwrap(),
            "gemini-2.5-flash"
        );
        assert!(adapter.parse_model("/v1beta/foo").is_err());
    }

    #[test]
    fn test_probe_request_shape() {
        let adapter = GeminiAdapter::new("gem", "https://generativelanguage.googleapis.com/");
        let client = Client::new();
        let request = adapter
            .build_probe_request(&client, "AIza-test", "gemini-2.5-flash")
            .build()
            .unwrap();
        assert_eq!(
            request.url().as_str(),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-flash:generateContent?key=AIza-test"
        );
        let body = request.body().unwrap().as_bytes().unwrap();
        let value: serde_json::Value = serde_json::from_slice(body).unwrap();
        assert_eq!(value["generationConfig"]["maxOutputTokens"], 1);
    }

    #[test]
    fn test_upstream_request_drops_inbound_key_param() {
        let adapter = GeminiAdapter::new("gem", "https://generativelanguage.googleapis.com");
        let client = Client::new();
        let inbound = InboundRequest {
            method: "POST".to_string(),
            path: "/v1beta/models/gemini-2.5-pro:generateContent".to_string(),
            query: Some("key=client-secret&alt=sse".to_string()),
            headers: reqwest::header::HeaderMap::new(),
            body: bytes::Bytes::from_static(b"{}"),
        };
        let request = adapter
            .build_upstream_request(&client, "pool-key", &inbound)
            .build()
            .unwrap();
        assert_eq!(
            request.url().as_str(),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-pro:generateContent?alt=sse"
        );
        assert_eq!(request.headers().get("x-goog-api-key").unwrap(), "pool-key");
    }
}
