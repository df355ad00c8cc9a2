//! # 密钥仓储
//!
//! provider_keys 表的数据访问层。调度引擎与探测引擎都只通过这里
//! 读写密钥健康状态，单键更新按主键定位，互不冲突。

use crate::error::Result;
use crate::logging::{LogComponent, LogStage};
use crate::types::{ErrorReason, KeyStatus};
use crate::{ldebug, lwarn};
use chrono::{DateTime, Utc};
use entity::provider_keys;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set,
};
use std::collections::HashMap;
use std::sync::Arc;

/// 按 provider/model/status 聚合的密钥数量，用于指标导出
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSummaryItem {
    pub provider: String,
    pub model: String,
    pub status: String,
    pub count: u64,
}

/// 密钥仓储
pub struct KeyRepository {
    db: Arc<DatabaseConnection>,
}

impl KeyRepository {
    #[must_use]
    pub const fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// 数据库连接引用（供健康检查使用）
    #[must_use]
    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    /// 列出当前可调度的密钥
    ///
    /// 口径：status 不为 invalid，且惩罚已过期或不存在。
    /// 过了 penalty_until 的 penalized 密钥在逻辑上已恢复可用，
    /// 物理状态等下一次探测再改写。
    pub async fn list_eligible(
        &self,
        provider: &str,
        resolved_model: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<provider_keys::Model>> {
        let rows = provider_keys::Entity::find()
            .filter(provider_keys::Column::Provider.eq(provider))
            .filter(provider_keys::Column::Model.eq(resolved_model))
            .filter(provider_keys::Column::Status.ne(KeyStatus::Invalid.as_str()))
            .filter(
                Condition::any()
                    .add(provider_keys::Column::PenaltyUntil.is_null())
                    .add(provider_keys::Column::PenaltyUntil.lte(now)),
            )
            .order_by_asc(provider_keys::Column::KeyHash)
            .all(self.db.as_ref())
            .await?;

        ldebug!(
            "system",
            LogStage::Db,
            LogComponent::Database,
            "list_eligible",
            "Loaded eligible keys",
            provider = provider,
            model = resolved_model,
            count = rows.len()
        );
        Ok(rows)
    }

    /// 列出某个池的全部密钥（探测调度使用，包含惩罚中的行）
    pub async fn list_all(
        &self,
        provider: &str,
        resolved_model: &str,
    ) -> Result<Vec<provider_keys::Model>> {
        Ok(provider_keys::Entity::find()
            .filter(provider_keys::Column::Provider.eq(provider))
            .filter(provider_keys::Column::Model.eq(resolved_model))
            .order_by_asc(provider_keys::Column::KeyHash)
            .all(self.db.as_ref())
            .await?)
    }

    /// 写入一次健康状态变更（upsert，last-write-wins）
    #[allow(clippy::too_many_arguments)]
    pub async fn update_key_status(
        &self,
        provider: &str,
        key_hash: &str,
        resolved_model: &str,
        key_value: &str,
        status: KeyStatus,
        reason: Option<ErrorReason>,
        penalty_until: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let now = Utc::now();
        let existing = provider_keys::Entity::find_by_id((
            provider.to_string(),
            key_hash.to_string(),
            resolved_model.to_string(),
        ))
        .one(self.db.as_ref())
        .await?;

        match existing {
            Some(model) => {
                let mut active: provider_keys::ActiveModel = model.into();
                active.status = Set(status.as_str().to_string());
                active.reason = Set(reason.map(|r| r.as_str().to_string()));
                active.penalty_until = Set(penalty_until);
                active.last_checked_at = Set(Some(now));
                active.update(self.db.as_ref()).await?;
            }
            None => {
                // 行可能还没同步进来，落一条完整记录保证状态不丢
                let active = provider_keys::ActiveModel {
                    provider: Set(provider.to_string()),
                    key_hash: Set(key_hash.to_string()),
                    model: Set(resolved_model.to_string()),
                    key_value: Set(key_value.to_string()),
                    status: Set(status.as_str().to_string()),
                    reason: Set(reason.map(|r| r.as_str().to_string())),
                    penalty_until: Set(penalty_until),
                    last_checked_at: Set(Some(now)),
                };
                active.insert(self.db.as_ref()).await?;
            }
        }

        ldebug!(
            "system",
            LogStage::Db,
            LogComponent::Database,
            "update_key_status",
            "Key status persisted",
            provider = provider,
            model = resolved_model,
            status = status.as_str(),
            reason = ?reason.map(|r| r.as_str()),
            penalty_until = ?penalty_until
        );
        Ok(())
    }

    /// 只刷新检查时间戳，不改变状态
    pub async fn touch_checked(
        &self,
        provider: &str,
        key_hash: &str,
        resolved_model: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let existing = provider_keys::Entity::find_by_id((
            provider.to_string(),
            key_hash.to_string(),
            resolved_model.to_string(),
        ))
        .one(self.db.as_ref())
        .await?;

        if let Some(model) = existing {
            let mut active: provider_keys::ActiveModel = model.into();
            active.last_checked_at = Set(Some(now));
            active.update(self.db.as_ref()).await?;
        } else {
            lwarn!(
                "system",
                LogStage::Db,
                LogComponent::Database,
                "touch_missing_key",
                "Tried to touch a key that no longer exists",
                provider = provider,
                model = resolved_model
            );
        }
        Ok(())
    }

    /// 数据库是否可达（/healthz 使用）
    pub async fn check_connection(&self) -> bool {
        self.db.ping().await.is_ok()
    }

    /// 全量状态汇总，供密钥池指标导出
    pub async fn status_summary(&self) -> Result<Vec<StatusSummaryItem>> {
        let rows = provider_keys::Entity::find().all(self.db.as_ref()).await?;

        let mut counts: HashMap<(String, String, String), u64> = HashMap::new();
        for row in rows {
            *counts
                .entry((row.provider, row.model, row.status))
                .or_insert(0) += 1;
        }

        let mut summary: Vec<StatusSummaryItem> = counts
            .into_iter()
            .map(|((provider, model, status), count)| StatusSummaryItem {
                provider,
                model,
                status,
                count,
            })
            .collect();
        summary.sort_by(|a, b| {
            (&a.provider, &a.model, &a.status).cmp(&(&b.provider, &b.model, &b.status))
        });
        Ok(summary)
    }
}
