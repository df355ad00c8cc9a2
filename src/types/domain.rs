//! # 核心领域类型
//!
//! 错误原因、密钥状态与检查结果是整个系统内错误语义的唯一载体，
//! 网关调度与后台探测共用这里的定义。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 共享密钥优化使用的虚拟模型哨兵
///
/// 当服务商声明 `shared_key_status` 时，密钥有效性是账号级的，
/// 数据库与内存池里只保留一条以该哨兵为模型名的记录。
pub const ALL_MODELS_MARKER: &str = "__ALL_MODELS__";

/// 标准化错误原因（封闭集合）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorReason {
    InvalidKey,
    NoAccess,
    NoQuota,
    NoModel,
    RateLimited,
    ServerError,
    Overloaded,
    ServiceUnavailable,
    Timeout,
    NetworkError,
    BadRequest,
    Unknown,
}

impl ErrorReason {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidKey => "invalid_key",
            Self::NoAccess => "no_access",
            Self::NoQuota => "no_quota",
            Self::NoModel => "no_model",
            Self::RateLimited => "rate_limited",
            Self::ServerError => "server_error",
            Self::Overloaded => "overloaded",
            Self::ServiceUnavailable => "service_unavailable",
            Self::Timeout => "timeout",
            Self::NetworkError => "network_error",
            Self::BadRequest => "bad_request",
            Self::Unknown => "unknown",
        }
    }

    /// 是否为瞬时错误，值得在验证循环中再次尝试
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited
                | Self::ServerError
                | Self::Timeout
                | Self::NetworkError
                | Self::Overloaded
                | Self::ServiceUnavailable
        )
    }

    /// 是否意味着密钥本身已不可用（快速失败，不进入验证循环）
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidKey | Self::NoAccess | Self::NoQuota | Self::NoModel
        )
    }

    /// 是否为客户端侧问题（密钥无责，不做惩罚）
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(self, Self::BadRequest)
    }

    /// HTTP 状态码的默认映射，仅在没有规则命中时使用
    #[must_use]
    pub const fn from_status(status: u16) -> Self {
        match status {
            400 => Self::BadRequest,
            401 => Self::InvalidKey,
            402 => Self::NoQuota,
            403 => Self::NoAccess,
            404 => Self::NoModel,
            429 => Self::RateLimited,
            500 => Self::ServerError,
            502 => Self::NetworkError,
            503 => Self::Overloaded,
            504 => Self::Timeout,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "invalid_key" => Ok(Self::InvalidKey),
            "no_access" => Ok(Self::NoAccess),
            "no_quota" => Ok(Self::NoQuota),
            "no_model" => Ok(Self::NoModel),
            "rate_limited" => Ok(Self::RateLimited),
            "server_error" => Ok(Self::ServerError),
            "overloaded" => Ok(Self::Overloaded),
            "service_unavailable" => Ok(Self::ServiceUnavailable),
            "timeout" => Ok(Self::Timeout),
            "network_error" => Ok(Self::NetworkError),
            "bad_request" => Ok(Self::BadRequest),
            "unknown" => Ok(Self::Unknown),
            other => Err(format!("未知的错误原因: {other}")),
        }
    }
}

/// 密钥在存储中的健康状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    /// 尚未被探测过（新同步的密钥）
    Unchecked,
    Valid,
    Invalid,
    Penalized,
}

impl KeyStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Unchecked => "unchecked",
            Self::Valid => "valid",
            Self::Invalid => "invalid",
            Self::Penalized => "penalized",
        }
    }
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unchecked" => Ok(Self::Unchecked),
            "valid" => Ok(Self::Valid),
            "invalid" => Ok(Self::Invalid),
            "penalized" => Ok(Self::Penalized),
            other => Err(format!("未知的密钥状态: {other}")),
        }
    }
}

/// 每次探测或转发尝试的标准化结果
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub ok: bool,
    pub status_code: Option<u16>,
    pub reason: Option<ErrorReason>,
    pub message: String,
    pub latency_ms: u64,
}

impl CheckResult {
    /// 构造成功结果
    #[must_use]
    pub fn success(status_code: u16, latency_ms: u64) -> Self {
        Self {
            ok: true,
            status_code: Some(status_code),
            reason: None,
            message: String::new(),
            latency_ms,
        }
    }

    /// 构造失败结果
    #[must_use]
    pub fn fail(
        reason: ErrorReason,
        status_code: Option<u16>,
        message: impl Into<String>,
        latency_ms: u64,
    ) -> Self {
        Self {
            ok: false,
            status_code,
            reason: Some(reason),
            message: message.into(),
            latency_ms,
        }
    }

    /// 失败原因；成功结果统一视为 `Unknown`
    #[must_use]
    pub fn reason_or_unknown(&self) -> ErrorReason {
        self.reason.unwrap_or(ErrorReason::Unknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_roundtrip() {
        for reason in [
            ErrorReason::InvalidKey,
            ErrorReason::NoAccess,
            ErrorReason::NoQuota,
            ErrorReason::NoModel,
            ErrorReason::RateLimited,
            ErrorReason::ServerError,
            ErrorReason::Overloaded,
            ErrorReason::ServiceUnavailable,
            ErrorReason::Timeout,
            ErrorReason::NetworkError,
            ErrorReason::BadRequest,
            ErrorReason::Unknown,
        ] {
            assert_eq!(reason.as_str().parse::<ErrorReason>().unwrap(), reason);
        }
    }

    #[test]
    fn test_reason_categories_are_disjoint() {
        for reason in [
            ErrorReason::InvalidKey,
            ErrorReason::NoAccess,
            ErrorReason::NoQuota,
            ErrorReason::NoModel,
        ] {
            assert!(reason.is_fatal());
            assert!(!reason.is_retryable());
            assert!(!reason.is_client_error());
        }
        for reason in [
            ErrorReason::RateLimited,
            ErrorReason::ServerError,
            ErrorReason::Timeout,
            ErrorReason::NetworkError,
            ErrorReason::Overloaded,
            ErrorReason::ServiceUnavailable,
        ] {
            assert!(reason.is_retryable());
            assert!(!reason.is_fatal());
        }
        assert!(ErrorReason::BadRequest.is_client_error());
        assert!(!ErrorReason::Unknown.is_retryable());
        assert!(!ErrorReason::Unknown.is_fatal());
    }

    #[test]
    fn test_default_status_map() {
        assert_eq!(ErrorReason::from_status(400), ErrorReason::BadRequest);
        assert_eq!(ErrorReason::from_status(401), ErrorReason::InvalidKey);
        assert_eq!(ErrorReason::from_status(402), ErrorReason::NoQuota);
        assert_eq!(ErrorReason::from_status(403), ErrorReason::NoAccess);
        assert_eq!(ErrorReason::from_status(404), ErrorReason::NoModel);
        assert_eq!(ErrorReason::from_status(429), ErrorReason::RateLimited);
        assert_eq!(ErrorReason::from_status(500), ErrorReason::ServerError);
        assert_eq!(ErrorReason::from_status(502), ErrorReason::NetworkError);
        assert_eq!(ErrorReason::from_status(503), ErrorReason::Overloaded);
        assert_eq!(ErrorReason::from_status(504), ErrorReason::Timeout);
        assert_eq!(ErrorReason::from_status(418), ErrorReason::Unknown);
    }

    #[test]
    fn test_key_status_roundtrip() {
        for status in [
            KeyStatus::Unchecked,
            KeyStatus::Valid,
            KeyStatus::Invalid,
            KeyStatus::Penalized,
        ] {
            assert_eq!(status.as_str().parse::<KeyStatus>().unwrap(), status);
        }
    }
}
