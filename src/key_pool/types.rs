//! # 密钥池类型定义

use std::fmt;

/// 池标识：(服务商, 解析后的模型名)
///
/// 共享状态服务商的模型名是 `__ALL_MODELS__` 哨兵，
/// 同一服务商的所有模型都落到同一个池。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolId {
    pub provider: String,
    pub model: String,
}

impl PoolId {
    #[must_use]
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider, self.model)
    }
}

/// 池中缓存的密钥条目
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedKey {
    pub key_hash: String,
    pub key_value: String,
}
