//! # llm-gateway 入口
//!
//! 子命令：
//! - `gateway`  启动 API 网关
//! - `worker`   启动后台密钥探测服务
//! - `config create <type>:<name>`  生成配置脚手架
//!
//! 退出码：0 正常，2 配置错误，1 运行期致命错误。

use clap::{Parser, Subcommand};
use llm_gateway::app::AppContext;
use llm_gateway::config::{AppConfig, load_config, scaffold_config};
use llm_gateway::error::{GatewayError, Result};
use llm_gateway::logging::{LogComponent, LogStage, init_logging};
use llm_gateway::{config_error, database, ensure_config, gateway, lerror, linfo, metrics, worker};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "llm-gateway", version, about = "LLM API gateway with pooled provider keys")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 启动 API 网关服务
    Gateway {
        /// 配置文件路径
        #[arg(long, default_value = "config/providers.yaml")]
        config: PathBuf,
        /// 监听地址，覆盖配置文件
        #[arg(long)]
        host: Option<String>,
        /// 监听端口，覆盖配置文件
        #[arg(long)]
        port: Option<u16>,
        /// 运行时工作线程数
        #[arg(long, default_value_t = 4)]
        workers: usize,
    },
    /// 启动后台密钥探测服务
    Worker {
        /// 配置文件路径
        #[arg(long, default_value = "config/providers.yaml")]
        config: PathBuf,
    },
    /// 配置文件管理
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// 生成配置脚手架，格式: <type>:<name>，如 openai_like:qwen
    Create { spec: String },
}

fn main() {
    init_logging();

    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(()) => 0,
        Err(e) => {
            lerror!(
                "system",
                LogStage::Shutdown,
                LogComponent::Main,
                "fatal",
                "Process exiting on error",
                error = %e
            );
            eprintln!("error: {e}");
            if e.is_config() { 2 } else { 1 }
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Gateway {
            config,
            host,
            port,
            workers,
        } => {
            let app_config = load_config(&config)?;
            let addr = resolve_listen_addr(&app_config, host.as_deref(), port)?;
            build_runtime(workers)?.block_on(gateway_main(app_config, addr))
        }
        Commands::Worker { config } => {
            let app_config = load_config(&config)?;
            build_runtime(2)?.block_on(worker_main(app_config))
        }
        Commands::Config { action } => match action {
            ConfigAction::Create { spec } => config_create(&spec),
        },
    }
}

fn build_runtime(workers: usize) -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers.max(1))
        .enable_all()
        .build()
        .map_err(|e| GatewayError::internal_with_source("构建异步运行时失败", e))
}

/// 监听地址解析：CLI 参数优先于配置文件
fn resolve_listen_addr(
    config: &AppConfig,
    host: Option<&str>,
    port: Option<u16>,
) -> Result<SocketAddr> {
    let base: SocketAddr = config
        .gateway
        .listen
        .parse()
        .map_err(|_| config_error!("'gateway.listen' 不是合法地址: {}", config.gateway.listen))?;

    let ip = match host {
        Some(host) => host
            .parse()
            .map_err(|_| config_error!("--host 不是合法地址: {}", host))?,
        None => base.ip(),
    };
    Ok(SocketAddr::new(ip, port.unwrap_or_else(|| base.port())))
}

async fn gateway_main(config: AppConfig, addr: SocketAddr) -> Result<()> {
    let metrics_handle = metrics::install_recorder()?;
    let db = database::init_database(&config.database.url())
        .await
        .map_err(|e| GatewayError::database_with_source("数据库连接失败", e))?;
    database::run_migrations(&db)
        .await
        .map_err(|e| GatewayError::database_with_source("数据库迁移失败", e))?;

    let ctx = AppContext::build(config, Arc::new(db), Some(metrics_handle))?;
    gateway::serve(ctx, addr).await
}

async fn worker_main(config: AppConfig) -> Result<()> {
    let db = database::init_database(&config.database.url())
        .await
        .map_err(|e| GatewayError::database_with_source("数据库连接失败", e))?;
    database::run_migrations(&db)
        .await
        .map_err(|e| GatewayError::database_with_source("数据库迁移失败", e))?;

    let ctx = AppContext::build(config, Arc::new(db), None)?;
    worker::run_worker(ctx).await;
    Ok(())
}

/// 生成配置脚手架文件
fn config_create(spec: &str) -> Result<()> {
    let Some((kind, name)) = spec.split_once(':') else {
        return Err(config_error!(
            "配置脚手架格式应为 <type>:<name>，例如 openai_like:qwen"
        ));
    };
    ensure_config!(
        matches!(kind, "openai_like" | "gemini"),
        "未知的服务商类型: {}，可选 openai_like / gemini",
        kind
    );
    ensure_config!(!name.is_empty(), "服务商名称不能为空");

    let path = PathBuf::from("config/providers.yaml");
    if path.exists() {
        return Err(config_error!("{} 已存在，拒绝覆盖", path.display()));
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| GatewayError::config_with_source("创建配置目录失败", e))?;
    }
    std::fs::write(&path, scaffold_config(kind, name))
        .map_err(|e| GatewayError::config_with_source("写入配置文件失败", e))?;

    linfo!(
        "system",
        LogStage::Configuration,
        LogComponent::Main,
        "config_created",
        "Configuration scaffold written",
        path = %path.display(),
        kind = kind,
        name = name
    );
    println!("已生成配置: {}", path.display());
    Ok(())
}
