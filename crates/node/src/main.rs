//! replog-node - storage node daemon
//!
//! Serves one local log store over the storage protocol.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

use replog::ClusterConfig;
use replog::network::TcpServer;
use replog::node::{StorageNode, StorageNodeOptions};
use replog::permission::AllowAll;
use replog::storage::{LocalLogStore, LocalLogStoreOptions, StoreHealth};
use replog::types::NodeId;

/// 存储节点配置
#[derive(Parser, Debug)]
#[command(name = "replog-node")]
#[command(about = "Storage node of a replicated shared log")]
struct Args {
    /// 节点 ID
    #[arg(short, long, default_value = "node1")]
    node_id: String,

    /// 存储协议监听地址
    #[arg(short, long, default_value = "127.0.0.1:7001")]
    listen_addr: String,

    /// 数据存储目录
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// Shard worker 数量
    #[arg(short, long, default_value = "4")]
    shards: usize,

    /// 每次写入后是否 fsync
    #[arg(long, default_value_t = true)]
    sync_on_write: bool,

    /// 日志级别
    #[arg(long, default_value = "info")]
    log_level: String,

    /// 集群配置文件（JSON）；指定时校验本节点属于存储集
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // 初始化日志
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let node_id = NodeId::new(args.node_id.clone());
    info!("Starting storage node: {}", node_id);
    info!("Listening on: {}", args.listen_addr);
    info!("Data directory: {:?}", args.data_dir);

    if let Some(path) = &args.config {
        let config = ClusterConfig::load(path)?;
        match config.find(&node_id) {
            Some(descriptor) => info!("Failure domain: {:?}", descriptor.domain),
            None => warn!("{} is not in the storage set of {:?}", node_id, path),
        }
    }

    std::fs::create_dir_all(&args.data_dir)?;
    let store = LocalLogStore::open(LocalLogStoreOptions {
        sync_on_write: args.sync_on_write,
        ..LocalLogStoreOptions::with_dir(args.data_dir.clone())
    });
    // 降级状态下仍然启动，写入返回失败直到存储恢复
    if let StoreHealth::Degraded(reason) = store.health() {
        error!("Local log store is degraded: {}", reason);
    }

    let node = StorageNode::start(
        node_id,
        store,
        Arc::new(AllowAll),
        StorageNodeOptions {
            shards: args.shards,
            ..Default::default()
        },
    );

    let server = TcpServer::bind(&args.listen_addr, node).await?;
    let shutdown = server.shutdown_handle();
    info!("Storage node is ready on {}", server.local_addr()?);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received ctrl-c, shutting down");
            shutdown.notify_one();
        }
    });

    server.serve().await;
    Ok(())
}
