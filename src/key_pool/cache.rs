//! # 密钥池缓存
//!
//! 每个 (provider, resolved_model) 维护一个轮转队列。
//! 读取走外层读锁加池级互斥锁，互不相关的池之间不会互相阻塞；
//! 池为空时按需从仓储惰性加载。

use super::types::{CachedKey, PoolId};
use crate::config::{AppConfig, HealthPolicyConfig, ProviderConfig};
use crate::error::Result;
use crate::logging::{LogComponent, LogStage};
use crate::repository::KeyRepository;
use crate::types::ErrorReason;
use crate::{ldebug, linfo, lwarn};
use chrono::Utc;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

type Pool = Arc<Mutex<VecDeque<CachedKey>>>;

/// 进程级密钥池缓存
pub struct KeyCache {
    pools: RwLock<HashMap<PoolId, Pool>>,
    repo: Arc<KeyRepository>,
    providers: Arc<HashMap<String, ProviderConfig>>,
    default_health_policy: HealthPolicyConfig,
}

impl KeyCache {
    #[must_use]
    pub fn new(repo: Arc<KeyRepository>, config: &AppConfig) -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            repo,
            providers: Arc::new(config.providers.clone()),
            default_health_policy: config.worker.health_policy,
        }
    }

    /// 解析池标识（共享状态服务商折叠到哨兵池）
    #[must_use]
    pub fn resolve_pool(&self, provider: &str, model: &str) -> PoolId {
        let resolved = self
            .providers
            .get(provider)
            .map_or(model, |p| p.resolve_model(model));
        PoolId::new(provider, resolved)
    }

    /// 取出一个可用密钥并轮转到队尾
    ///
    /// `exclude` 是本次请求已经尝试过的 key_hash 集合；
    /// 完整轮转一圈仍无可用密钥时返回 None。
    pub async fn acquire(
        &self,
        provider: &str,
        model: &str,
        exclude: &HashSet<String>,
    ) -> Option<CachedKey> {
        let pool_id = self.resolve_pool(provider, model);
        let pool = self.get_or_load_pool(&pool_id).await?;

        let mut queue = pool.lock().await;
        for _ in 0..queue.len() {
            let key = queue.pop_front()?;
            queue.push_back(key.clone());
            if !exclude.contains(&key.key_hash) {
                return Some(key);
            }
        }
        None
    }

    /// 把一个密钥标记为不可用
    ///
    /// 从池中摘除（幂等），按健康策略计算惩罚并落库。
    pub async fn mark_bad(
        &self,
        provider: &str,
        model: &str,
        key: &CachedKey,
        reason: ErrorReason,
    ) -> Result<()> {
        let pool_id = self.resolve_pool(provider, model);
        self.remove_from_pool(&pool_id, &key.key_hash).await;

        let policy = self
            .providers
            .get(provider)
            .map_or(self.default_health_policy, |p| {
                p.effective_health_policy(&self.default_health_policy)
            });

        let penalty_until = Utc::now() + policy.penalty_for(reason);
        let status = HealthPolicyConfig::status_for(reason);

        self.repo
            .update_key_status(
                provider,
                &key.key_hash,
                &pool_id.model,
                &key.key_value,
                status,
                Some(reason),
                Some(penalty_until),
            )
            .await?;

        linfo!(
            "system",
            LogStage::Cache,
            LogComponent::KeyCache,
            "key_marked_bad",
            "Key removed from pool and penalized",
            pool = %pool_id,
            reason = reason.as_str(),
            status = status.as_str(),
            penalty_until = %penalty_until
        );
        Ok(())
    }

    /// 丢弃池条目，下次 acquire 时重新从仓储加载
    pub async fn refresh(&self, provider: &str, model: &str) {
        let pool_id = self.resolve_pool(provider, model);
        let mut pools = self.pools.write().await;
        if pools.remove(&pool_id).is_some() {
            ldebug!(
                "system",
                LogStage::Cache,
                LogComponent::KeyCache,
                "pool_refreshed",
                "Pool entry dropped, will lazily reload",
                pool = %pool_id
            );
        }
    }

    /// 丢弃全部池条目，强制下一次 acquire 重新加载
    ///
    /// 周期性调用，让探测引擎恢复的密钥能回到在用的池里。
    pub async fn refresh_all(&self) {
        self.pools.write().await.clear();
    }

    /// 当前各池的密钥数量（指标导出用）
    pub async fn pool_sizes(&self) -> Vec<(PoolId, usize)> {
        let pools = self.pools.read().await;
        let mut sizes = Vec::with_capacity(pools.len());
        for (id, pool) in pools.iter() {
            sizes.push((id.clone(), pool.lock().await.len()));
        }
        sizes
    }

    /// 获取池，必要时从仓储惰性加载
    async fn get_or_load_pool(&self, pool_id: &PoolId) -> Option<Pool> {
        {
            let pools = self.pools.read().await;
            if let Some(pool) = pools.get(pool_id) {
                if !pool.lock().await.is_empty() {
                    return Some(pool.clone());
                }
            }
        }
        self.load_pool(pool_id).await
    }

    /// 从仓储重建池内容
    async fn load_pool(&self, pool_id: &PoolId) -> Option<Pool> {
        let rows = match self
            .repo
            .list_eligible(&pool_id.provider, &pool_id.model, Utc::now())
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                lwarn!(
                    "system",
                    LogStage::Cache,
                    LogComponent::KeyCache,
                    "pool_load_failed",
                    "Failed to load keys from repository",
                    pool = %pool_id,
                    error = %e
                );
                return None;
            }
        };

        if rows.is_empty() {
            return None;
        }

        let queue: VecDeque<CachedKey> = rows
            .into_iter()
            .map(|row| CachedKey {
                key_hash: row.key_hash,
                key_value: row.key_value,
            })
            .collect();

        linfo!(
            "system",
            LogStage::Cache,
            LogComponent::KeyCache,
            "pool_loaded",
            "Key pool loaded from repository",
            pool = %pool_id,
            size = queue.len()
        );

        let mut pools = self.pools.write().await;
        let pool = pools
            .entry(pool_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(VecDeque::new())));
        {
            let mut guard = pool.lock().await;
            if guard.is_empty() {
                *guard = queue;
            }
        }
        Some(pool.clone())
    }

    /// 从单个池中摘除密钥（密钥不存在时为空操作）
    async fn remove_from_pool(&self, pool_id: &PoolId, key_hash: &str) {
        let pool = {
            let pools = self.pools.read().await;
            pools.get(pool_id).cloned()
        };
        let Some(pool) = pool else { return };

        let mut queue = pool.lock().await;
        let before = queue.len();
        queue.retain(|k| k.key_hash != key_hash);
        if queue.len() < before {
            ldebug!(
                "system",
                LogStage::Cache,
                LogComponent::KeyCache,
                "key_removed",
                "Key removed from live pool",
                pool = %pool_id,
                before = before,
                after = queue.len()
            );
        }
    }
}
