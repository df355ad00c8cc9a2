use sea_orm_migration::prelude::*;
use std::env;

#[tokio::main]
async fn main() {
    // 如果没有设置 DATABASE_URL 环境变量，则默认使用本地 SQLite 数据库
    if env::var("DATABASE_URL").is_err() {
        unsafe {
            env::set_var("DATABASE_URL", "sqlite://data/llm_gateway.db");
        }
    }
    cli::run_cli(migration::Migrator).await;
}
