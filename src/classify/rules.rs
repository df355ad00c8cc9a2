//! # 错误解析规则引擎
//!
//! 规则在配置加载时编译一次；请求路径上只做只读匹配。

use crate::config::ErrorParsingRule;
use crate::error::Result;
use crate::types::ErrorReason;
use crate::config_error;
use regex::Regex;
use serde_json::Value;

/// 参与分类的响应体上限，超出部分在匹配前被截断
pub const MAX_ERROR_BODY_BYTES: usize = 256 * 1024;

/// 编译后的单条规则
#[derive(Debug)]
struct CompiledRule {
    status_code: u16,
    /// 点分路径拆段；空向量表示匹配整个响应体文本
    path: Vec<String>,
    pattern: Regex,
    map_to: ErrorReason,
}

/// 某个服务商的全部已编译规则
#[derive(Debug)]
pub struct RuleSet {
    enabled: bool,
    /// 按优先级降序，同优先级保持声明顺序
    rules: Vec<CompiledRule>,
}

impl RuleSet {
    /// 空规则集（未配置 error_parsing 的服务商）
    #[must_use]
    pub fn empty() -> Self {
        Self {
            enabled: false,
            rules: Vec::new(),
        }
    }

    /// 编译配置中的规则，正则不合法视为配置错误
    pub fn compile(enabled: bool, rules: &[ErrorParsingRule]) -> Result<Self> {
        let mut indexed: Vec<(usize, &ErrorParsingRule)> = rules.iter().enumerate().collect();
        // 稳定排序保证同优先级规则按声明顺序求值
        indexed.sort_by_key(|(idx, rule)| (-i64::from(rule.priority), *idx));

        let mut compiled = Vec::with_capacity(indexed.len());
        for (idx, rule) in indexed {
            let pattern = Regex::new(&rule.match_pattern).map_err(|e| {
                config_error!("错误解析规则 #{idx} 的正则 '{}' 编译失败: {e}", rule.match_pattern)
            })?;
            let path: Vec<String> = if rule.error_path.is_empty() {
                Vec::new()
            } else {
                rule.error_path.split('.').map(str::to_string).collect()
            };
            compiled.push(CompiledRule {
                status_code: rule.status_code,
                path,
                pattern,
                map_to: rule.map_to,
            });
        }

        Ok(Self {
            enabled,
            rules: compiled,
        })
    }

    /// 按优先级求值所有状态码匹配的规则，返回第一个命中的映射
    #[must_use]
    pub fn apply(&self, status: u16, body: &[u8]) -> Option<ErrorReason> {
        if !self.enabled {
            return None;
        }

        let candidates: Vec<&CompiledRule> = self
            .rules
            .iter()
            .filter(|rule| rule.status_code == status)
            .collect();
        if candidates.is_empty() {
            return None;
        }

        // 只有候选规则存在时才解析 JSON；截断导致的解析失败降级为纯文本匹配
        let parsed: Option<Value> = if looks_like_json(body) {
            serde_json::from_slice(body).ok()
        } else {
            None
        };
        let raw_text = String::from_utf8_lossy(body);

        for rule in candidates {
            let matched = if rule.path.is_empty() {
                rule.pattern.is_match(&raw_text)
            } else {
                match parsed.as_ref().and_then(|v| lookup_path(v, &rule.path)) {
                    Some(value) => rule.pattern.is_match(&value_to_text(value)),
                    None => false,
                }
            };
            if matched {
                return Some(rule.map_to);
            }
        }
        None
    }
}

/// 响应体是否像 JSON（与 Content-Type 无关的快速判断）
fn looks_like_json(body: &[u8]) -> bool {
    body.iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|b| *b == b'{' || *b == b'[')
}

/// 点分路径查找：只穿透对象，路径途中遇到数组或标量即视为缺失
fn lookup_path<'a>(value: &'a Value, path: &[String]) -> Option<&'a Value> {
    let mut current = value;
    for segment in path {
        current = current.as_object()?.get(segment)?;
    }
    if current.is_null() {
        return None;
    }
    Some(current)
}

/// 将 JSON 值转成参与正则匹配的文本形式
fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_ruleset_never_matches() {
        assert_eq!(RuleSet::empty().apply(400, b"{}"), None);
    }

    #[test]
    fn test_lookup_path_null_is_missing() {
        let value: Value = serde_json::from_str(r#"{"error":{"code":null}}"#).unwrap();
        assert!(lookup_path(&value, &["error".to_string(), "code".to_string()]).is_none());
    }

    #[test]
    fn test_value_to_text_for_non_strings() {
        let value: Value = serde_json::from_str(r#"{"code":429}"#).unwrap();
        let code = lookup_path(&value, &["code".to_string()]).unwrap();
        assert_eq!(value_to_text(code), "429");
    }

    #[test]
    fn test_partial_regex_match() {
        let rules = RuleSet::compile(
            true,
            &[ErrorParsingRule {
                status_code: 400,
                error_path: "message".to_string(),
                match_pattern: "quota".to_string(),
                map_to: ErrorReason::NoQuota,
                priority: 0,
                description: None,
            }],
        )
        .unwrap();
        // 部分匹配即可命中，大小写敏感
        assert_eq!(
            rules.apply(400, br#"{"message":"your quota is gone"}"#),
            Some(ErrorReason::NoQuota)
        );
        assert_eq!(rules.apply(400, br#"{"message":"your QUOTA is gone"}"#), None);
    }

    #[test]
    fn test_bad_regex_is_config_error() {
        let err = RuleSet::compile(
            true,
            &[ErrorParsingRule {
                status_code: 400,
                error_path: String::new(),
                match_pattern: "([".to_string(),
                map_to: ErrorReason::Unknown,
                priority: 0,
                description: None,
            }],
        )
        .unwrap_err();
        assert!(err.is_config());
    }
}
