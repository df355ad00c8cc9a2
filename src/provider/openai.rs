//! # OpenAI 兼容适配器
//!
//! 覆盖 OpenAI / DeepSeek / Qwen(DashScope 兼容模式) 等使用
//! Bearer 认证与 chat/completions 形态的服务商。

use super::{InboundRequest, parse_method};
use crate::error::Result;
use crate::business_error;
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, RequestBuilder};
use serde_json::json;

/// OpenAI 兼容服务商适配器
pub struct OpenAiLikeAdapter {
    name: String,
    base_url: String,
}

impl OpenAiLikeAdapter {
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

    /// 最小成本探测：1 个 token 的补全请求，足以验证认证与模型权限
    #[must_use]
    pub fn build_probe_request(&self, client: &Client, key: &str, model: &str) -> RequestBuilder {
        let payload = json!({
            "model": model,
            "messages": [{"role": "user", "content": "ping"}],
            "max_tokens": 1,
            "stream": false,
        });
        client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .header(AUTHORIZATION, format!("Bearer {key}"))
            .json(&payload)
    }

    /// 从请求体 JSON 中解析模型名
    pub fn parse_model(&self, body: &[u8]) -> Result<String> {
        let value: serde_json::Value = serde_json::from_slice(body)
            .map_err(|_| business_error!("请求体不是合法的 JSON"))?;
        value
            .get("model")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .ok_or_else(|| business_error!("请求体缺少 'model' 字段"))
    }

    /// 换钥并构造上游请求
    #[must_use]
    pub fn build_upstream_request(
        &self,
        client: &Client,
        key: &str,
        inbound: &InboundRequest,
    ) -> RequestBuilder {
        let mut url = format!("{}{}", self.base_url, inbound.path);
        if let Some(query) = &inbound.query {
            url.push('?');
            url.push_str(query);
        }
        client
            .request(parse_method(&inbound.method), url)
            .header(AUTHORIZATION, format!("Bearer {key}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_model_from_body() {
        let adapter = OpenAiLikeAdapter::new("foo", "https://api.example.com/");
        let body = br#"{"model":"gpt-4o","messages":[]}"#;
        assert_eq!(adapter.parse_model(body).unwrap(), "gpt-4o");
    }

    #[test]
    fn test_parse_model_missing_field() {
        let adapter = OpenAiLikeAdapter::new("foo", "https://api.example.com");
        assert!(adapter.parse_model(br#"{"messages":[]}"#).is_err());
        assert!(adapter.parse_model(b"not json").is_err());
    }

    #[test]
    fn test_probe_request_shape() {
        let adapter = OpenAiLikeAdapter::new("foo", "https://api.example.com");
        let client = Client::new();
        let request = adapter
            .build_probe_request(&client, "sk-test", "gpt-4o")
            .build()
            .unwrap();
        assert_eq!(request.method(), reqwest::Method::POST);
        assert_eq!(
            request.url().as_str(),
            "https://api.example.com/v1/chat/completions"
        );
        assert_eq!(
            request.headers().get(AUTHORIZATION).unwrap(),
            "Bearer sk-test"
        );
        let body = request.body().unwrap().as_bytes().unwrap();
        let value: serde_json::Value = serde_json::from_slice(body).unwrap();
        assert_eq!(value["model"], "gpt-4o");
        assert_eq!(value["max_tokens"], 1);
        assert_eq!(value["stream"], false);
    }

    #[test]
    fn test_upstream_request_rewrites_auth() {
        let adapter = OpenAiLikeAdapter::new("foo", "https://api.example.com");
        let client = Client::new();
        let inbound = InboundRequest {
            method: "POST".to_string(),
            path: "/v1/chat/completions".to_string(),
            query: None,
            headers: reqwest::header::HeaderMap::new(),
            body: bytes::Bytes::from_static(b"{}"),
        };
        let request = adapter
            .build_upstream_request(&client, "sk-pool", &inbound)
            .build()
            .unwrap();
        assert_eq!(
            request.url().as_str(),
            "https://api.example.com/v1/chat/completions"
        );
        assert_eq!(
            request.headers().get(AUTHORIZATION).unwrap(),
            "Bearer sk-pool"
        );
    }
}
