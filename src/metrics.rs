//! # 指标模块
//!
//! 基于全局 recorder 的 Prometheus 指标导出。
//! recorder 在进程启动时安装一次，`/metrics` 路由渲染句柄内容。

use crate::error::{GatewayError, Result};
use crate::types::ALL_MODELS_MARKER;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// 安装全局指标 recorder 并声明指标
pub fn install_recorder() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| GatewayError::internal_with_source("安装 Prometheus recorder 失败", e))?;

    describe_counter!(
        "gateway_requests_total",
        "Total gateway requests by provider and final status"
    );
    describe_histogram!(
        "gateway_latency_seconds",
        "Gateway request latency in seconds by provider"
    );
    describe_gauge!(
        "gateway_key_pool_size",
        "Number of keys currently cached per provider and model pool"
    );
    describe_gauge!(
        "gateway_keys_total",
        "Total number of keys by provider, model and persisted status"
    );
    describe_counter!(
        "worker_probe_total",
        "Total worker probes by provider and outcome reason"
    );

    Ok(handle)
}

/// 记录一次网关请求的最终状态
pub fn record_gateway_request(provider: &str, status: u16) {
    counter!(
        "gateway_requests_total",
        "provider" => provider.to_string(),
        "status" => status.to_string(),
    )
    .increment(1);
}

/// 记录网关请求耗时
pub fn record_gateway_latency(provider: &str, seconds: f64) {
    histogram!(
        "gateway_latency_seconds",
        "provider" => provider.to_string(),
    )
    .record(seconds);
}

/// 更新密钥池大小
///
/// 共享池的哨兵模型名导出为 shared，便于看板阅读。
pub fn set_pool_size(provider: &str, model: &str, size: usize) {
    let model = if model == ALL_MODELS_MARKER {
        "shared"
    } else {
        model
    };
    #[allow(clippy::cast_precision_loss)]
    gauge!(
        "gateway_key_pool_size",
        "provider" => provider.to_string(),
        "model" => model.to_string(),
    )
    .set(size as f64);
}

/// 更新按持久化状态聚合的密钥总数（数据库口径）
pub fn set_key_status_count(provider: &str, model: &str, status: &str, count: u64) {
    let model = if model == ALL_MODELS_MARKER {
        "shared"
    } else {
        model
    };
    #[allow(clippy::cast_precision_loss)]
    gauge!(
        "gateway_keys_total",
        "provider" => provider.to_string(),
        "model" => model.to_string(),
        "status" => status.to_string(),
    )
    .set(count as f64);
}

/// 记录一次探测结果
pub fn record_probe(provider: &str, reason: &str) {
    counter!(
        "worker_probe_total",
        "provider" => provider.to_string(),
        "reason" => reason.to_string(),
    )
    .increment(1);
}
