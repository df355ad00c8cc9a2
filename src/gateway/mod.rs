//! # 网关模块
//!
//! 面向客户端的 HTTP 服务与按请求的调度引擎。

mod debug_log;
mod dispatch;
mod server;

pub use dispatch::{RetryAction, retry_action};
pub use server::{AppState, create_router, serve};
