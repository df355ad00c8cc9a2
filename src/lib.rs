//! # llm-gateway
//!
//! 多服务商 LLM API 网关：把大量可能不稳定的上游凭证汇成密钥池，
//! 对外暴露统一的 HTTP 入口。核心能力：
//! - 网关调度引擎：按请求取键、流式转发、失败分类与换键重试
//! - 后台探测引擎：周期验证密钥、验证循环、时间惩罚状态机
//! - 规则化错误分类：把任意上游错误形态归一为封闭的错误原因集合

pub mod app;
pub mod classify;
pub mod config;
pub mod database;
pub mod error;
pub mod gateway;
pub mod key_pool;
pub mod logging;
pub mod metrics;
pub mod provider;
pub mod repository;
pub mod types;
pub mod upstream;
pub mod worker;

pub use error::{GatewayError, Result};
