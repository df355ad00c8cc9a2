//! # 核心领域类型模块

mod domain;

pub use domain::*;
