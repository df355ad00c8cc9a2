//! # 应用装配模块

mod context;

pub use context::AppContext;
