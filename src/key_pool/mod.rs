//! # 密钥池模块
//!
//! 进程内的可用密钥缓存，是"当前可调度"这一判断的唯一权威来源。

mod cache;
mod types;

pub use cache::KeyCache;
pub use types::{CachedKey, PoolId};
