//! # 后台探测模块
//!
//! 持续验证密钥健康度的常驻服务。

mod keeper;

pub use keeper::{run_cycle, run_worker};
