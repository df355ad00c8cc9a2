//! # 配置校验器
//!
//! 对加载完成的配置做业务一致性检查。所有错误先累积，
//! 最后合并成一份报告返回，避免用户反复试错。

use super::app_config::AppConfig;
use crate::error::Result;
use crate::logging::{LogComponent, LogStage};
use crate::{config_error, lwarn};

/// 配置校验器
#[derive(Default)]
pub struct ConfigValidator {
    errors: Vec<String>,
}

impl ConfigValidator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// 校验整份配置，失败时返回包含全部问题的配置错误
    pub fn validate(mut self, config: &AppConfig) -> Result<()> {
        self.validate_gateway(config);
        self.validate_worker(config);
        self.validate_providers(config);

        if self.errors.is_empty() {
            return Ok(());
        }

        let report = self.errors.join("\n- ");
        Err(config_error!(
            "配置校验发现 {} 个问题:\n- {}",
            self.errors.len(),
            report
        ))
    }

    fn add_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    fn validate_gateway(&mut self, config: &AppConfig) {
        if config.gateway.auth_token.is_empty() {
            self.add_error("'gateway.auth_token' 必须设置，网关拒绝无令牌访问");
        }
        if config.gateway.listen.parse::<std::net::SocketAddr>().is_err() {
            self.add_error(format!(
                "'gateway.listen' 不是合法的监听地址: '{}'",
                config.gateway.listen
            ));
        }
    }

    fn validate_worker(&mut self, config: &AppConfig) {
        let worker = &config.worker;
        if worker.interval_sec == 0 {
            self.add_error("'worker.interval_sec' 必须为正整数");
        }
        if worker.concurrency == 0 {
            self.add_error("'worker.concurrency' 必须为正整数");
        }
        if worker.verification_attempts == 0 {
            self.add_error("'worker.verification_attempts' 必须为正整数");
        }
    }

    fn validate_providers(&mut self, config: &AppConfig) {
        if config.providers.is_empty() {
            lwarn!(
                "system",
                LogStage::Configuration,
                LogComponent::Config,
                "no_providers",
                "No providers are defined in the configuration"
            );
            return;
        }

        for (name, provider) in &config.providers {
            if !provider.enabled {
                continue;
            }

            if provider.base_url.is_empty() {
                self.add_error(format!("服务商 '{name}': 'base_url' 必须设置"));
            }
            if provider.models.is_empty() {
                self.add_error(format!("服务商 '{name}': 'models' 不能为空"));
            }

            if let Some(proxy_url) = &provider.proxy_url
                && !(proxy_url.starts_with("http://")
                    || proxy_url.starts_with("https://")
                    || proxy_url.starts_with("socks5://"))
            {
                self.add_error(format!(
                    "服务商 '{name}': 不支持的代理地址 '{proxy_url}'，仅支持 http/https/socks5"
                ));
            }

            self.validate_rules(name, provider);
        }
    }

    /// 规则在启动期编译一次，任何不合法的正则都会阻止启动
    fn validate_rules(&mut self, name: &str, provider: &super::app_config::ProviderConfig) {
        let parsing = &provider.gateway_policy.error_parsing;
        if !parsing.enabled && !parsing.rules.is_empty() {
            lwarn!(
                "system",
                LogStage::Configuration,
                LogComponent::Config,
                "rules_disabled",
                "Error parsing rules are present but disabled",
                provider = name
            );
        }

        for (idx, rule) in parsing.rules.iter().enumerate() {
            if !(100..=599).contains(&rule.status_code) {
                self.add_error(format!(
                    "服务商 '{name}': 规则 #{idx} 的 status_code {} 不是合法的 HTTP 状态码",
                    rule.status_code
                ));
            }
            if let Err(e) = regex::Regex::new(&rule.match_pattern) {
                self.add_error(format!(
                    "服务商 '{name}': 规则 #{idx} 的 match_pattern 无法编译: {e}"
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::app_config::{
        ErrorParsingRule, GatewayPolicy, ProviderConfig, ProviderKind,
    };
    use crate::types::ErrorReason;

    fn base_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.gateway.auth_token = "token".to_string();
        config.providers.insert(
            "foo".to_string(),
            ProviderConfig {
                enabled: true,
                kind: ProviderKind::OpenaiLike,
                base_url: "https://api.example.com".to_string(),
                models: vec!["gpt-4".to_string()],
                shared_key_status: false,
                proxy_url: None,
                gateway_policy: GatewayPolicy::default(),
                health_policy: None,
            },
        );
        config
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(ConfigValidator::new().validate(&base_config()).is_ok());
    }

    #[test]
    fn test_errors_are_accumulated() {
        let mut config = base_config();
        config.gateway.auth_token = String::new();
        config.worker.interval_sec = 0;
        let provider = config.providers.get_mut("foo").unwrap();
        provider.models.clear();
        provider.base_url.clear();

        let err = ConfigValidator::new().validate(&config).unwrap_err();
        let report = err.to_string();
        assert!(report.contains("4 个问题"));
        assert!(report.contains("auth_token"));
        assert!(report.contains("interval_sec"));
        assert!(report.contains("models"));
        assert!(report.contains("base_url"));
    }

    #[test]
    fn test_bad_rule_regex_blocks_startup() {
        let mut config = base_config();
        let provider = config.providers.get_mut("foo").unwrap();
        provider.gateway_policy.error_parsing.enabled = true;
        provider.gateway_policy.error_parsing.rules.push(ErrorParsingRule {
            status_code: 400,
            error_path: "error.type".to_string(),
            match_pattern: "([unclosed".to_string(),
            map_to: ErrorReason::InvalidKey,
            priority: 10,
            description: None,
        });

        let err = ConfigValidator::new().validate(&config).unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("match_pattern"));
    }

    #[test]
    fn test_disabled_provider_is_skipped() {
        let mut config = base_config();
        config.providers.get_mut("foo").unwrap().enabled = false;
        config.providers.get_mut("foo").unwrap().models.clear();
        assert!(ConfigValidator::new().validate(&config).is_ok());
    }

    #[test]
    fn test_bad_rule_status_code() {
        let mut config = base_config();
        let provider = config.providers.get_mut("foo").unwrap();
        provider.gateway_policy.error_parsing.rules.push(ErrorParsingRule {
            status_code: 42,
            error_path: String::new(),
            match_pattern: "x".to_string(),
            map_to: ErrorReason::Unknown,
            priority: 0,
            description: None,
        });
        let err = ConfigValidator::new().validate(&config).unwrap_err();
        assert!(err.to_string().contains("status_code"));
    }
}
