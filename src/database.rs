//! # 数据库模块
//!
//! 数据库连接和迁移管理

use crate::logging::{LogComponent, LogStage};
use crate::{ldebug, lerror, linfo};
use migration::MigratorTrait;
use sea_orm::{Database, DatabaseConnection, DbErr};
use std::path::Path;

/// 初始化数据库连接
///
/// 对 SQLite 连接串额外保证目录与文件存在（开发与测试场景）。
pub async fn init_database(database_url: &str) -> Result<DatabaseConnection, DbErr> {
    if let Some(db_path) = database_url
        .strip_prefix("sqlite://")
        .filter(|p| !p.starts_with(':') && !p.contains("mode=memory"))
    {
        let db_file_path = Path::new(db_path);
        if let Some(parent_dir) = db_file_path.parent()
            && !parent_dir.exists()
        {
            std::fs::create_dir_all(parent_dir).map_err(|e| {
                DbErr::Custom(format!("无法创建数据库目录 {}: {e}", parent_dir.display()))
            })?;
            ldebug!(
                "system",
                LogStage::Startup,
                LogComponent::Database,
                "dir_created",
                "Created database directory",
                path = %parent_dir.display()
            );
        }
        if !db_file_path.exists() {
            std::fs::File::create(db_file_path).map_err(|e| {
                DbErr::Custom(format!("无法创建数据库文件 {}: {e}", db_file_path.display()))
            })?;
        }
    }

    let db = Database::connect(database_url).await?;

    linfo!(
        "system",
        LogStage::Startup,
        LogComponent::Database,
        "db_connected",
        "Database connection established"
    );
    Ok(db)
}

/// 运行数据库迁移
pub async fn run_migrations(db: &DatabaseConnection) -> Result<(), DbErr> {
    match migration::Migrator::up(db, None).await {
        Ok(()) => {
            linfo!(
                "system",
                LogStage::Startup,
                LogComponent::Database,
                "migrations_done",
                "Database migrations applied"
            );
            Ok(())
        }
        Err(e) => {
            lerror!(
                "system",
                LogStage::Startup,
                LogComponent::Database,
                "migrations_failed",
                "Database migration failed",
                error = %e
            );
            Err(e)
        }
    }
}
