//! # 上游 HTTP 客户端工厂
//!
//! 为每个出站代理端点维护一个共享的 reqwest 客户端，
//! 直连共用 `__none__` 客户端。复用连接池，避免按请求建连。

use crate::config::{AppConfig, ProviderConfig};
use crate::error::{GatewayError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::linfo;
use reqwest::{Client, Proxy};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// 连接建立超时
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// 流式响应的字节间隔超时（非总超时）
const READ_TIMEOUT: Duration = Duration::from_secs(60);
/// 单主机空闲连接上限
const MAX_IDLE_PER_HOST: usize = 100;

/// 直连客户端的缓存键
const DIRECT_KEY: &str = "__none__";

/// 上游客户端工厂
pub struct HttpClientFactory {
    providers: Arc<HashMap<String, ProviderConfig>>,
    clients: RwLock<HashMap<String, Client>>,
}

impl HttpClientFactory {
    #[must_use]
    pub fn new(config: &AppConfig) -> Self {
        Self {
            providers: Arc::new(config.providers.clone()),
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// 获取某个服务商对应的客户端，同一代理端点共享实例
    pub async fn client_for_provider(&self, provider: &str) -> Result<Client> {
        let cache_key = self
            .providers
            .get(provider)
            .and_then(|p| p.proxy_url.clone())
            .unwrap_or_else(|| DIRECT_KEY.to_string());

        {
            let clients = self.clients.read().await;
            if let Some(client) = clients.get(&cache_key) {
                return Ok(client.clone());
            }
        }

        let mut clients = self.clients.write().await;
        // 双重检查：等待写锁期间可能已有并发创建
        if let Some(client) = clients.get(&cache_key) {
            return Ok(client.clone());
        }

        let client = Self::build_client(&cache_key)?;
        clients.insert(cache_key.clone(), client.clone());

        linfo!(
            "system",
            LogStage::Startup,
            LogComponent::Upstream,
            "client_created",
            "Created shared upstream HTTP client",
            cache_key = %cache_key
        );
        Ok(client)
    }

    fn build_client(cache_key: &str) -> Result<Client> {
        let mut builder = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .pool_max_idle_per_host(MAX_IDLE_PER_HOST);

        if cache_key != DIRECT_KEY {
            let proxy = Proxy::all(cache_key)
                .map_err(|e| GatewayError::config_with_source("出站代理地址不合法", e))?;
            builder = builder.proxy(proxy);
        }

        builder
            .build()
            .map_err(|e| GatewayError::internal_with_source("构建上游 HTTP 客户端失败", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GatewayPolicy, ProviderKind};

    fn config_with_proxy(proxy_url: Option<&str>) -> AppConfig {
        let mut config = AppConfig::default();
        config.providers.insert(
            "foo".to_string(),
            ProviderConfig {
                enabled: true,
                kind: ProviderKind::OpenaiLike,
                base_url: "https://api.example.com".to_string(),
                models: vec!["m".to_string()],
                shared_key_status: false,
                proxy_url: proxy_url.map(str::to_string),
                gateway_policy: GatewayPolicy::default(),
                health_policy: None,
            },
        );
        config
    }

    #[tokio::test]
    async fn test_direct_clients_are_shared() {
        let factory = HttpClientFactory::new(&config_with_proxy(None));
        let _a = factory.client_for_provider("foo").await.unwrap();
        let _b = factory.client_for_provider("unknown").await.unwrap();
        // 两个直连客户端共享同一个缓存键
        assert_eq!(factory.clients.read().await.len(), 1);
    }

    #[tokio::test]
    async fn test_proxy_client_uses_distinct_key() {
        let factory = HttpClientFactory::new(&config_with_proxy(Some("socks5://127.0.0.1:1080")));
        let _ = factory.client_for_provider("foo").await.unwrap();
        let _ = factory.client_for_provider("unknown").await.unwrap();
        assert_eq!(factory.clients.read().await.len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_proxy_is_config_error() {
        let factory = HttpClientFactory::new(&config_with_proxy(Some("::::bad::::")));
        let err = factory.client_for_provider("foo").await.unwrap_err();
        assert!(err.is_config());
    }
}
