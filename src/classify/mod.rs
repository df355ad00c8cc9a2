//! # 错误分类模块
//!
//! 把上游任意形态的 HTTP/JSON 错误响应归一化为 [`ErrorReason`]。
//! 规则命中优先，默认状态码映射兜底。

mod rules;

pub use rules::{MAX_ERROR_BODY_BYTES, RuleSet};

use crate::types::ErrorReason;

/// 对一次非 2xx 响应做归一化分类
///
/// 响应体超过 256 KiB 时只取前缀参与匹配，截断后的前缀仍会进入规则引擎。
#[must_use]
pub fn classify(status: u16, body: &[u8], rules: &RuleSet) -> ErrorReason {
    let capped = &body[..body.len().min(MAX_ERROR_BODY_BYTES)];
    if let Some(reason) = rules.apply(status, capped) {
        return reason;
    }
    ErrorReason::from_status(status)
}
