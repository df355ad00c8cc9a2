//! # 应用上下文
//!
//! 启动时一次性装配的进程级上下文：配置、已编译规则集、
//! 服务商适配器、仓储、密钥池与上游客户端工厂。
//! 网关与探测服务各自持有同一个 Arc，没有全局可变状态。

use crate::classify::RuleSet;
use crate::config::{AppConfig, ProviderConfig};
use crate::error::Result;
use crate::key_pool::KeyCache;
use crate::logging::{LogComponent, LogStage};
use crate::provider::ProviderAdapter;
use crate::repository::KeyRepository;
use crate::upstream::HttpClientFactory;
use crate::linfo;
use metrics_exporter_prometheus::PrometheusHandle;
use sea_orm::DatabaseConnection;
use std::collections::HashMap;
use std::sync::Arc;

/// 进程级应用上下文
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub db: Arc<DatabaseConnection>,
    pub repo: Arc<KeyRepository>,
    pub cache: Arc<KeyCache>,
    pub clients: Arc<HttpClientFactory>,
    adapters: HashMap<String, Arc<ProviderAdapter>>,
    rules: HashMap<String, Arc<RuleSet>>,
    empty_rules: Arc<RuleSet>,
    pub metrics: Option<PrometheusHandle>,
}

impl AppContext {
    /// 装配上下文
    ///
    /// 规则集在这里统一编译，任何编译失败都会阻止启动。
    pub fn build(
        config: AppConfig,
        db: Arc<DatabaseConnection>,
        metrics: Option<PrometheusHandle>,
    ) -> Result<Arc<Self>> {
        let mut adapters = HashMap::new();
        let mut rules = HashMap::new();

        for (name, provider) in &config.providers {
            if !provider.enabled {
                continue;
            }
            adapters.insert(
                name.clone(),
                Arc::new(ProviderAdapter::new(name, provider)),
            );
            let parsing = &provider.gateway_policy.error_parsing;
            rules.insert(
                name.clone(),
                Arc::new(RuleSet::compile(parsing.enabled, &parsing.rules)?),
            );
        }

        let repo = Arc::new(KeyRepository::new(db.clone()));
        let cache = Arc::new(KeyCache::new(repo.clone(), &config));
        let clients = Arc::new(HttpClientFactory::new(&config));

        linfo!(
            "system",
            LogStage::Startup,
            LogComponent::Main,
            "context_built",
            "Application context assembled",
            providers = adapters.len()
        );

        Ok(Arc::new(Self {
            config: Arc::new(config),
            db,
            repo,
            cache,
            clients,
            adapters,
            rules,
            empty_rules: Arc::new(RuleSet::empty()),
            metrics,
        }))
    }

    /// 启用中的服务商配置
    #[must_use]
    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.config
            .providers
            .get(name)
            .filter(|p| p.enabled)
    }

    /// 服务商适配器
    #[must_use]
    pub fn adapter(&self, name: &str) -> Option<&Arc<ProviderAdapter>> {
        self.adapters.get(name)
    }

    /// 服务商的已编译规则集，没有配置时返回空集
    #[must_use]
    pub fn rules_for(&self, name: &str) -> &Arc<RuleSet> {
        self.rules.get(name).unwrap_or(&self.empty_rules)
    }

    /// 遍历启用中的服务商名称
    pub fn enabled_providers(&self) -> impl Iterator<Item = (&String, &ProviderConfig)> {
        self.config
            .providers
            .iter()
            .filter(|(_, p)| p.enabled)
    }
}
