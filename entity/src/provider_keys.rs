//! # 服务商密钥实体定义
//!
//! provider_keys 表的 Sea-ORM 实体模型。
//! 一行代表一个 (provider, key_hash, model) 组合的健康状态；
//! 共享状态的服务商只写 `__ALL_MODELS__` 哨兵行。

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// 服务商密钥实体
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "provider_keys")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub provider: String,
    #[sea_orm(primary_key, auto_increment = false)]
    pub key_hash: String,
    #[sea_orm(primary_key, auto_increment = false)]
    pub model: String,
    /// 转发请求时使用的原始凭证
    pub key_value: String,
    /// unchecked | valid | invalid | penalized
    pub status: String,
    /// 最近一次观测到的错误原因
    pub reason: Option<String>,
    /// 惩罚截止时间，为空表示当前可用
    pub penalty_until: Option<DateTimeUtc>,
    pub last_checked_at: Option<DateTimeUtc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
