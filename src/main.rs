//! 注册表服务主入口

use calycompta_registry::{
    auth::JwtService,
    config::{AppConfig, StoreBackend},
    db,
    middleware::AppState,
    repository::{MemoryRegistryStore, PgRegistryStore, RegistryStore},
    routes,
    services::{
        default_sources, BuiltinCatalogSource, CatalogSource, FileCatalogSource, ModuleCatalog,
        RegistryHub, SettingValidators,
    },
    telemetry,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Serve,
    PublishCatalog,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ===== CLI 参数处理 =====
    let args: Vec<String> = std::env::args().collect();

    let mode = match args.get(1).map(String::as_str) {
        None => Mode::Serve,
        Some("--version") => {
            println!("calycompta-registry {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Some("--help") => {
            print_help();
            return Ok(());
        }
        Some("--publish-catalog") => Mode::PublishCatalog,
        Some(other) => {
            eprintln!("未知参数: {}", other);
            print_help();
            std::process::exit(1);
        }
    };

    // 加载 .env 文件（开发环境）
    // 生产环境应该直接设置环境变量
    if let Ok(env) = std::env::var("REGISTRY_ENV") {
        dotenv::from_filename(format!(".env.{}", env)).ok();
    } else {
        dotenv::from_filename(".env.local").ok();
        dotenv::dotenv().ok();
    }

    // 1. 加载配置
    let config = AppConfig::from_env().map_err(|e| {
        eprintln!("Configuration error: {}", e);
        anyhow::anyhow!("Failed to load configuration: {}", e)
    })?;

    // 2. 初始化日志与指标
    telemetry::init_telemetry(&config);
    telemetry::init_metrics();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Registry starting...");

    // 3. 文档存储
    let store = open_store(&config).await?;

    if mode == Mode::PublishCatalog {
        return publish_catalog(&config, store.as_ref()).await;
    }

    // 4. 注册表
    let sources = default_sources(store.clone(), config.registry.catalog_file.clone());
    let hub = Arc::new(RegistryHub::new(store, sources, SettingValidators::with_builtins()).await);

    for club_id in &config.registry.preload_clubs {
        let registry = hub.registry(club_id).await;
        if registry.is_degraded().await {
            tracing::warn!(club_id = %club_id, "Club registry preloaded in degraded mode");
        } else {
            tracing::info!(club_id = %club_id, "Club registry preloaded");
        }
    }

    // 5. 应用状态与路由
    let jwt_service = Arc::new(JwtService::from_config(&config)?);
    let app_state = Arc::new(AppState::new(config.clone(), hub, jwt_service));
    let app = routes::create_router(app_state);

    // 6. 启动服务器
    let addr = &config.server.addr;
    let listener = TcpListener::bind(addr).await?;

    tracing::info!(addr = %addr, "Server listening");

    // 7. 优雅关闭
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(config.server.graceful_shutdown_timeout_secs))
        .await?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn open_store(config: &AppConfig) -> anyhow::Result<Arc<dyn RegistryStore>> {
    match config.registry.store {
        StoreBackend::Postgres => {
            let pool = db::create_pool(&config.database).await?;
            db::run_migrations(&pool).await?;
            tracing::info!("Database initialized");
            Ok(Arc::new(PgRegistryStore::new(pool)))
        }
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory store, data is lost on restart");
            Ok(Arc::new(MemoryRegistryStore::new()))
        }
    }
}

/// 把目录文件（未配置时用内置目录）发布到存储
async fn publish_catalog(config: &AppConfig, store: &dyn RegistryStore) -> anyhow::Result<()> {
    let mut sources: Vec<Arc<dyn CatalogSource>> = Vec::new();
    if let Some(path) = &config.registry.catalog_file {
        sources.push(Arc::new(FileCatalogSource::new(path.clone())));
    } else {
        sources.push(Arc::new(BuiltinCatalogSource));
    }

    let catalog = ModuleCatalog::load(&sources).await?;
    catalog.publish(store).await?;

    println!(
        "Published {} modules ({}) from {}",
        catalog.len(),
        catalog.version(),
        catalog.source()
    );
    Ok(())
}

/// 优雅关闭信号处理
async fn shutdown_signal(timeout_secs: u64) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Ctrl+C received, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Terminate signal received, starting graceful shutdown");
        },
    }

    // 给进行中的请求留出时间
    tokio::spawn(async move {
        tokio::time::sleep(tokio::time::Duration::from_secs(timeout_secs)).await;
        tracing::warn!("Graceful shutdown timeout reached, forcing exit");
        std::process::exit(1);
    });
}

/// 打印帮助信息
fn print_help() {
    println!("calycompta-registry {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("用法: calycompta-registry [选项]");
    println!();
    println!("选项:");
    println!("  --version           打印版本信息并退出");
    println!("  --help              打印此帮助信息并退出");
    println!("  --publish-catalog   把模块目录发布到存储后退出");
    println!();
    println!("环境变量:");
    println!("  所有配置通过 REGISTRY_ 前缀的环境变量完成");
    println!("  可用选项请参考 .env.example");
}
