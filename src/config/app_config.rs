//! # 应用配置结构定义
//!
//! 所有配置在启动时一次性加载并校验，运行期间不可变。

use crate::types::{ALL_MODELS_MARKER, ErrorReason, KeyStatus};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;

/// 应用主配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub gateway: GatewayConfig,
    pub worker: WorkerConfig,
    pub database: DatabaseConfig,
    pub providers: HashMap<String, ProviderConfig>,
}

/// 网关全局配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// 监听地址
    pub listen: String,
    /// 客户端访问网关使用的静态令牌
    pub auth_token: String,
    /// 全局流式模式，可被单个服务商覆盖
    pub streaming_mode: StreamingMode,
    /// 全局调试模式，可被单个服务商覆盖
    pub debug_mode: DebugMode,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8100".to_string(),
            auth_token: String::new(),
            streaming_mode: StreamingMode::Auto,
            debug_mode: DebugMode::Disabled,
        }
    }
}

/// 后台探测服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// 每个服务商的探测周期（秒）
    pub interval_sec: u64,
    /// 单个服务商同时在途的探测数量上限
    pub concurrency: usize,
    /// 验证循环的最大尝试次数
    pub verification_attempts: u32,
    /// 验证循环两次探测之间的等待时间（秒）
    pub verification_delay_sec: u64,
    /// 默认健康策略，服务商可覆盖
    pub health_policy: HealthPolicyConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            interval_sec: 60,
            concurrency: 8,
            verification_attempts: 3,
            verification_delay_sec: 65,
            health_policy: HealthPolicyConfig::default(),
        }
    }
}

/// 健康惩罚策略
///
/// 每种错误原因对应一个时间惩罚，惩罚期内密钥不参与调度。
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthPolicyConfig {
    pub on_invalid_key_days: i64,
    pub on_no_access_days: i64,
    pub on_no_quota_hr: i64,
    pub on_rate_limit_hr: i64,
    pub on_server_error_min: i64,
    pub on_overload_min: i64,
    pub on_other_error_hr: i64,
}

impl Default for HealthPolicyConfig {
    fn default() -> Self {
        Self {
            on_invalid_key_days: 10,
            on_no_access_days: 10,
            on_no_quota_hr: 4,
            on_rate_limit_hr: 1,
            on_server_error_min: 30,
            on_overload_min: 60,
            on_other_error_hr: 1,
        }
    }
}

impl HealthPolicyConfig {
    /// 计算某个错误原因对应的惩罚时长
    #[must_use]
    pub fn penalty_for(&self, reason: ErrorReason) -> Duration {
        match reason {
            ErrorReason::InvalidKey => Duration::days(self.on_invalid_key_days),
            ErrorReason::NoAccess => Duration::days(self.on_no_access_days),
            ErrorReason::NoQuota => Duration::hours(self.on_no_quota_hr),
            ErrorReason::RateLimited => Duration::hours(self.on_rate_limit_hr),
            ErrorReason::ServerError | ErrorReason::Timeout | ErrorReason::NetworkError => {
                Duration::minutes(self.on_server_error_min)
            }
            ErrorReason::Overloaded | ErrorReason::ServiceUnavailable => {
                Duration::minutes(self.on_overload_min)
            }
            ErrorReason::NoModel | ErrorReason::BadRequest | ErrorReason::Unknown => {
                Duration::hours(self.on_other_error_hr)
            }
        }
    }

    /// 惩罚落库时使用的状态：致命原因记为 invalid，其余记为 penalized
    #[must_use]
    pub const fn status_for(reason: ErrorReason) -> KeyStatus {
        if reason.is_fatal() {
            KeyStatus::Invalid
        } else {
            KeyStatus::Penalized
        }
    }
}

/// 数据库连接配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub name: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: env::var("DB_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: env::var("DB_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(5432),
            user: env::var("DB_USER").unwrap_or_else(|_| "postgres".to_string()),
            password: env::var("DB_PASSWORD").unwrap_or_default(),
            name: env::var("DB_NAME").unwrap_or_else(|_| "llm_gateway".to_string()),
        }
    }
}

impl DatabaseConfig {
    /// 构造数据库连接URL
    #[must_use]
    pub fn url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.name
        )
    }
}

/// 服务商类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenaiLike,
    Gemini,
}

impl ProviderKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::OpenaiLike => "openai_like",
            Self::Gemini => "gemini",
        }
    }
}

/// 流式模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamingMode {
    Auto,
    Disabled,
}

/// 调试模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebugMode {
    Disabled,
    HeadersOnly,
    FullBody,
}

impl DebugMode {
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        !matches!(self, Self::Disabled)
    }
}

/// 单个服务商实例配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub kind: ProviderKind,
    pub base_url: String,
    #[serde(default)]
    pub models: Vec<String>,
    /// 密钥有效性是否为账号级（所有模型共享一条状态记录）
    #[serde(default)]
    pub shared_key_status: bool,
    /// 出站代理地址，例如 socks5://host:port
    #[serde(default)]
    pub proxy_url: Option<String>,
    #[serde(default)]
    pub gateway_policy: GatewayPolicy,
    /// 覆盖全局健康策略
    #[serde(default)]
    pub health_policy: Option<HealthPolicyConfig>,
}

impl ProviderConfig {
    /// 解析后的模型名：共享状态服务商折叠到哨兵池
    #[must_use]
    pub fn resolve_model<'a>(&self, model: &'a str) -> &'a str {
        if self.shared_key_status {
            ALL_MODELS_MARKER
        } else {
            model
        }
    }

    /// 探测使用的代表模型
    #[must_use]
    pub fn probe_model(&self) -> Option<&str> {
        self.models.first().map(String::as_str)
    }

    /// 模型是否在本实例的允许列表内
    #[must_use]
    pub fn allows_model(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model)
    }

    /// 生效的流式模式
    #[must_use]
    pub fn effective_streaming_mode(&self, global: StreamingMode) -> StreamingMode {
        self.gateway_policy.streaming_mode.unwrap_or(global)
    }

    /// 生效的调试模式
    #[must_use]
    pub fn effective_debug_mode(&self, global: DebugMode) -> DebugMode {
        self.gateway_policy.debug_mode.unwrap_or(global)
    }

    /// 生效的健康策略
    #[must_use]
    pub fn effective_health_policy(&self, global: &HealthPolicyConfig) -> HealthPolicyConfig {
        self.health_policy.unwrap_or(*global)
    }
}

/// 服务商级网关策略
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayPolicy {
    pub streaming_mode: Option<StreamingMode>,
    pub debug_mode: Option<DebugMode>,
    pub retry: RetryPolicy,
    pub error_parsing: ErrorParsingConfig,
    /// 熔断配置（仅保留字段，不参与调度）
    pub circuit_breaker: Option<serde_yaml::Value>,
}

/// 重试策略
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

/// 错误解析规则配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorParsingConfig {
    pub enabled: bool,
    pub rules: Vec<ErrorParsingRule>,
}

/// 单条错误解析规则
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorParsingRule {
    pub status_code: u16,
    /// 点分路径，例如 error.type；空路径表示匹配整个响应体文本
    #[serde(default)]
    pub error_path: String,
    /// 区分大小写的部分匹配正则
    pub match_pattern: String,
    pub map_to: ErrorReason,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub description: Option<String>,
}

const fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_penalty_table_defaults() {
        let policy = HealthPolicyConfig::default();
        assert_eq!(
            policy.penalty_for(ErrorReason::InvalidKey),
            Duration::days(10)
        );
        assert_eq!(policy.penalty_for(ErrorReason::NoQuota), Duration::hours(4));
        assert_eq!(
            policy.penalty_for(ErrorReason::RateLimited),
            Duration::hours(1)
        );
        assert_eq!(
            policy.penalty_for(ErrorReason::ServerError),
            Duration::minutes(30)
        );
        assert_eq!(
            policy.penalty_for(ErrorReason::Timeout),
            Duration::minutes(30)
        );
        assert_eq!(
            policy.penalty_for(ErrorReason::Overloaded),
            Duration::minutes(60)
        );
        assert_eq!(
            policy.penalty_for(ErrorReason::Unknown),
            Duration::hours(1)
        );
    }

    #[test]
    fn test_status_for_reason() {
        assert_eq!(
            HealthPolicyConfig::status_for(ErrorReason::InvalidKey),
            KeyStatus::Invalid
        );
        assert_eq!(
            HealthPolicyConfig::status_for(ErrorReason::NoQuota),
            KeyStatus::Invalid
        );
        assert_eq!(
            HealthPolicyConfig::status_for(ErrorReason::RateLimited),
            KeyStatus::Penalized
        );
        assert_eq!(
            HealthPolicyConfig::status_for(ErrorReason::Unknown),
            KeyStatus::Penalized
        );
    }

    #[test]
    fn test_shared_key_model_resolution() {
        let provider = ProviderConfig {
            enabled: true,
            kind: ProviderKind::OpenaiLike,
            base_url: "https://api.example.com".to_string(),
            models: vec!["qwen-max".to_string(), "qwen-plus".to_string()],
            shared_key_status: true,
            proxy_url: None,
            gateway_policy: GatewayPolicy::default(),
            health_policy: None,
        };
        assert_eq!(provider.resolve_model("qwen-max"), ALL_MODELS_MARKER);
        assert_eq!(provider.probe_model(), Some("qwen-max"));

        let direct = ProviderConfig {
            shared_key_status: false,
            ..provider
        };
        assert_eq!(direct.resolve_model("qwen-max"), "qwen-max");
    }

    #[test]
    fn test_effective_modes_fall_back_to_global() {
        let mut provider = ProviderConfig {
            enabled: true,
            kind: ProviderKind::Gemini,
            base_url: "https://generativelanguage.googleapis.com".to_string(),
            models: vec!["gemini-2.5-flash".to_string()],
            shared_key_status: false,
            proxy_url: None,
            gateway_policy: GatewayPolicy::default(),
            health_policy: None,
        };
        assert_eq!(
            provider.effective_streaming_mode(StreamingMode::Auto),
            StreamingMode::Auto
        );
        provider.gateway_policy.debug_mode = Some(DebugMode::FullBody);
        assert_eq!(
            provider.effective_debug_mode(DebugMode::Disabled),
            DebugMode::FullBody
        );
    }
}
