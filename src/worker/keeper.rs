//! # 密钥探测引擎
//!
//! 每个启用的服务商一个独立调度任务，按周期轮询该服务商的
//! 所有密钥：成功回写 valid，瞬时失败进入验证循环，致命失败
//! 快速惩罚。单个密钥的任何异常都不会影响调度器或其它密钥。

use crate::app::AppContext;
use crate::config::HealthPolicyConfig;
use crate::logging::{LogComponent, LogStage};
use crate::metrics;
use crate::types::{CheckResult, ErrorReason, KeyStatus};
use crate::{ldebug, lerror, linfo, lwarn};
use chrono::Utc;
use entity::provider_keys;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// 启动探测服务，阻塞直到收到退出信号
pub async fn run_worker(ctx: Arc<AppContext>) {
    let mut schedulers = Vec::new();
    for (name, _) in ctx.enabled_providers() {
        let ctx = ctx.clone();
        let provider = name.clone();
        schedulers.push(tokio::spawn(async move {
            provider_scheduler(ctx, provider).await;
        }));
    }

    linfo!(
        "system",
        LogStage::Startup,
        LogComponent::Keeper,
        "worker_started",
        "Background key probe worker started",
        schedulers = schedulers.len()
    );

    let _ = tokio::signal::ctrl_c().await;

    linfo!(
        "system",
        LogStage::Shutdown,
        LogComponent::Keeper,
        "worker_stopping",
        "Background worker shutting down"
    );
    for scheduler in schedulers {
        scheduler.abort();
    }
}

/// 单个服务商的调度循环
async fn provider_scheduler(ctx: Arc<AppContext>, provider: String) {
    let mut ticker =
        tokio::time::interval(Duration::from_secs(ctx.config.worker.interval_sec.max(1)));
    loop {
        ticker.tick().await;
        // 周期内的任何错误都不能终止调度器
        if let Err(e) = run_cycle(&ctx, &provider).await {
            lerror!(
                "system",
                LogStage::BackgroundTask,
                LogComponent::Keeper,
                "cycle_failed",
                "Probe cycle failed",
                provider = %provider,
                error = %e
            );
        }
    }
}

/// 执行一个服务商的完整探测周期
///
/// 共享状态服务商只探测一个代表模型，状态写到哨兵行；
/// 其余服务商按配置的每个模型独立探测。
pub async fn run_cycle(ctx: &Arc<AppContext>, provider_name: &str) -> crate::error::Result<()> {
    let Some(provider) = ctx.provider(provider_name) else {
        return Ok(());
    };

    let pools: Vec<(String, String)> = if provider.shared_key_status {
        let Some(probe_model) = provider.probe_model() else {
            return Ok(());
        };
        vec![(
            crate::types::ALL_MODELS_MARKER.to_string(),
            probe_model.to_string(),
        )]
    } else {
        provider
            .models
            .iter()
            .map(|m| (m.clone(), m.clone()))
            .collect()
    };

    let semaphore = Arc::new(Semaphore::new(ctx.config.worker.concurrency.max(1)));
    let mut probes: JoinSet<()> = JoinSet::new();
    let now = Utc::now();
    let mut due = 0usize;
    let mut skipped = 0usize;

    for (resolved_model, probe_model) in pools {
        let rows = ctx.repo.list_all(provider_name, &resolved_model).await?;
        for row in rows {
            // 惩罚期内的密钥到期之前不再探测
            if row.penalty_until.is_some_and(|until| until > now) {
                skipped += 1;
                continue;
            }
            due += 1;

            let ctx = ctx.clone();
            let provider_name = provider_name.to_string();
            let resolved_model = resolved_model.clone();
            let probe_model = probe_model.clone();
            let semaphore = semaphore.clone();
            probes.spawn(async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return;
                };
                probe_one(&ctx, &provider_name, &resolved_model, &probe_model, row).await;
            });
        }
    }

    ldebug!(
        "system",
        LogStage::Scheduling,
        LogComponent::Keeper,
        "cycle_scheduled",
        "Probe cycle scheduled",
        provider = provider_name,
        due = due,
        skipped = skipped
    );

    while let Some(joined) = probes.join_next().await {
        if let Err(e) = joined {
            lerror!(
                "system",
                LogStage::BackgroundTask,
                LogComponent::Keeper,
                "probe_task_failed",
                "Probe task aborted unexpectedly",
                provider = provider_name,
                error = %e
            );
        }
    }
    Ok(())
}

/// 探测单个密钥并落库
///
/// 所有内部异常折叠为 UNKNOWN，绝不向上抛。
async fn probe_one(
    ctx: &AppContext,
    provider_name: &str,
    resolved_model: &str,
    probe_model: &str,
    row: provider_keys::Model,
) {
    let result = check_key(ctx, provider_name, probe_model, &row.key_value).await;
    let outcome = if result.ok {
        "valid"
    } else {
        result.reason_or_unknown().as_str()
    };
    metrics::record_probe(provider_name, outcome);

    let final_result = if result.ok {
        result
    } else {
        let reason = result.reason_or_unknown();
        if reason.is_retryable() {
            verification_loop(ctx, provider_name, resolved_model, probe_model, &row, result).await
        } else {
            // 致命与未知错误都快速失败，不进入验证循环
            result
        }
    };

    apply_result(ctx, provider_name, resolved_model, &row, &final_result).await;
}

/// 对瞬时失败执行验证循环
///
/// 任何一次成功立即返回成功；全部失败返回最后一次的结果。
async fn verification_loop(
    ctx: &AppContext,
    provider_name: &str,
    resolved_model: &str,
    probe_model: &str,
    row: &provider_keys::Model,
    first_failure: CheckResult,
) -> CheckResult {
    let attempts = ctx.config.worker.verification_attempts;
    let delay = Duration::from_secs(ctx.config.worker.verification_delay_sec);
    let mut last = first_failure;

    for attempt in 1..=attempts {
        tokio::time::sleep(delay).await;

        let result = check_key(ctx, provider_name, probe_model, &row.key_value).await;
        linfo!(
            "system",
            LogStage::HealthCheck,
            LogComponent::Keeper,
            "verification_attempt",
            "Verification probe finished",
            provider = provider_name,
            model = resolved_model,
            attempt = attempt,
            max_attempts = attempts,
            ok = result.ok,
            reason = ?result.reason.map(|r| r.as_str())
        );
        if result.ok {
            return result;
        }

        // 记录探测活动但不改写状态，状态由最终结果决定
        if let Err(e) = ctx
            .repo
            .touch_checked(provider_name, &row.key_hash, resolved_model, Utc::now())
            .await
        {
            lwarn!(
                "system",
                LogStage::Db,
                LogComponent::Keeper,
                "touch_failed",
                "Failed to record verification probe timestamp",
                provider = provider_name,
                error = %e
            );
        }

        // 验证过程中转为致命错误时不再继续等待
        if result.reason_or_unknown().is_fatal() {
            return result;
        }
        last = result;
    }
    last
}

/// 把最终探测结果写回存储
async fn apply_result(
    ctx: &AppContext,
    provider_name: &str,
    resolved_model: &str,
    row: &provider_keys::Model,
    result: &CheckResult,
) {
    let (status, reason, penalty_until) = if result.ok {
        // 只有探测引擎能把密钥转回 valid；成功必须清空惩罚
        (KeyStatus::Valid, None, None)
    } else {
        let reason = result.reason_or_unknown();
        let policy = ctx
            .provider(provider_name)
            .map_or(ctx.config.worker.health_policy, |p| {
                p.effective_health_policy(&ctx.config.worker.health_policy)
            });
        (
            HealthPolicyConfig::status_for(reason),
            Some(reason),
            Some(Utc::now() + policy.penalty_for(reason)),
        )
    };

    if let Err(e) = ctx
        .repo
        .update_key_status(
            provider_name,
            &row.key_hash,
            resolved_model,
            &row.key_value,
            status,
            reason,
            penalty_until,
        )
        .await
    {
        lerror!(
            "system",
            LogStage::Db,
            LogComponent::Keeper,
            "status_update_failed",
            "Failed to persist probe result",
            provider = provider_name,
            model = resolved_model,
            error = %e
        );
        return;
    }

    linfo!(
        "system",
        LogStage::HealthCheck,
        LogComponent::Keeper,
        "key_checked",
        "Key probe finished and persisted",
        provider = provider_name,
        model = resolved_model,
        status = status.as_str(),
        reason = ?reason.map(|r| r.as_str()),
        latency_ms = result.latency_ms
    );
}

/// 发起一次探测请求
///
/// 客户端构建失败等探测层异常折叠为 UNKNOWN。
async fn check_key(
    ctx: &AppContext,
    provider_name: &str,
    probe_model: &str,
    key_value: &str,
) -> CheckResult {
    let Some(adapter) = ctx.adapter(provider_name) else {
        return CheckResult::fail(ErrorReason::Unknown, None, "服务商未配置", 0);
    };
    let client = match ctx.clients.client_for_provider(provider_name).await {
        Ok(client) => client,
        Err(e) => {
            return CheckResult::fail(ErrorReason::Unknown, None, e.to_string(), 0);
        }
    };
    let rules = ctx.rules_for(provider_name);
    adapter.probe(&client, rules, key_value, probe_model).await
}
