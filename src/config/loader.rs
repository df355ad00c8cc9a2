//! # 配置加载器
//!
//! 读取 providers.yaml，递归解析 `${VAR}` 环境变量占位符，
//! 反序列化为类型安全的配置对象后交给校验器。

use super::app_config::AppConfig;
use super::validator::ConfigValidator;
use crate::error::{GatewayError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::{config_error, linfo};
use regex::Regex;
use serde_yaml::Value;
use std::env;
use std::path::Path;
use std::sync::LazyLock;

/// 环境变量占位符格式：${VAR_NAME}
static ENV_VAR_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\$\{(?P<name>[A-Z0-9_]+)\}$").expect("环境变量占位符正则不合法"));

/// 加载并校验配置文件
pub fn load_config(path: impl AsRef<Path>) -> Result<AppConfig> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(config_error!("配置文件不存在: {}", path.display()));
    }

    let raw = std::fs::read_to_string(path)
        .map_err(|e| GatewayError::config_with_source("读取配置文件失败", e))?;

    let value: Value = serde_yaml::from_str(&raw)
        .map_err(|e| GatewayError::config_with_source("配置文件不是合法的 YAML", e))?;

    let resolved = resolve_env_vars(value)?;

    let config: AppConfig = serde_yaml::from_value(resolved)
        .map_err(|e| GatewayError::config_with_source("配置结构解析失败，请检查字段类型", e))?;

    ConfigValidator::new().validate(&config)?;

    linfo!(
        "system",
        LogStage::Configuration,
        LogComponent::Config,
        "config_loaded",
        "Configuration loaded and validated",
        path = %path.display(),
        providers = config.providers.len()
    );

    Ok(config)
}

/// 递归替换配置树中的 `${VAR}` 占位符
///
/// 占位符指向的环境变量必须存在，缺失视为配置错误。
fn resolve_env_vars(value: Value) -> Result<Value> {
    match value {
        Value::String(s) => {
            if let Some(caps) = ENV_VAR_PATTERN.captures(&s) {
                let name = &caps["name"];
                let resolved = env::var(name).map_err(|_| {
                    config_error!("环境变量 '{}' 未设置，但配置中引用了它", name)
                })?;
                Ok(Value::String(resolved))
            } else {
                Ok(Value::String(s))
            }
        }
        Value::Sequence(seq) => Ok(Value::Sequence(
            seq.into_iter()
                .map(resolve_env_vars)
                .collect::<Result<Vec<_>>>()?,
        )),
        Value::Mapping(map) => {
            let mut out = serde_yaml::Mapping::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k, resolve_env_vars(v)?);
            }
            Ok(Value::Mapping(out))
        }
        other => Ok(other),
    }
}

/// 生成配置脚手架
///
/// `config create <type>:<name>` 使用，输出一份带注释的 providers.yaml 模板。
#[must_use]
pub fn scaffold_config(kind: &str, name: &str) -> String {
    let provider_block = match kind {
        "gemini" => format!(
            r#"  {name}:
    kind: gemini
    base_url: "https://generativelanguage.googleapis.com"
    models:
      - gemini-2.5-flash
      - gemini-2.5-pro
    shared_key_status: false
"#
        ),
        _ => format!(
            r#"  {name}:
    kind: openai_like
    base_url: "https://api.openai.com"
    models:
      - gpt-4o-mini
    shared_key_status: false
    gateway_policy:
      error_parsing:
        enabled: true
        rules:
          - status_code: 400
            error_path: "error.code"
            match_pattern: "insufficient_quota"
            map_to: no_quota
            priority: 5
"#
        ),
    };

    format!(
        r#"# llm-gateway 配置文件
gateway:
  listen: "0.0.0.0:8100"
  auth_token: "${{GATEWAY_AUTH_TOKEN}}"
  streaming_mode: auto
  debug_mode: disabled

worker:
  interval_sec: 60
  concurrency: 8
  verification_attempts: 3
  verification_delay_sec: 65
  health_policy:
    on_invalid_key_days: 10
    on_no_access_days: 10
    on_no_quota_hr: 4
    on_rate_limit_hr: 1
    on_server_error_min: 30
    on_overload_min: 60
    on_other_error_hr: 1

database:
  host: "${{DB_HOST}}"
  port: 5432
  user: "${{DB_USER}}"
  password: "${{DB_PASSWORD}}"
  name: "${{DB_NAME}}"

providers:
{provider_block}"#
    )
}
