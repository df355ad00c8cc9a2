//! # 错误处理模块
//!
//! 统一的错误类型定义和处理

mod macros;
mod types;

pub use types::*;

/// 应用结果类型
pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_contains_message() {
        let err = GatewayError::config("缺少 providers 配置");
        assert!(err.to_string().contains("缺少 providers 配置"));
        assert!(err.is_config());
    }

    #[test]
    fn test_db_error_folds_into_database_variant() {
        let err: GatewayError = sea_orm::DbErr::Custom("boom".to_string()).into();
        assert!(matches!(err, GatewayError::Database { .. }));
        assert!(!err.is_config());
    }

    #[test]
    fn test_with_source_keeps_chain() {
        let io_err = std::io::Error::other("连接被拒绝");
        let err = GatewayError::network_with_source("连接上游失败", io_err);
        match err {
            GatewayError::Network { message, source } => {
                assert_eq!(message, "连接上游失败");
                assert!(source.is_some());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_config_macro_formats_message() {
        let err = crate::config_error!("缺少字段: {}", "models");
        assert!(err.to_string().contains("models"));
        assert!(err.is_config());
    }
}
