use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use heron_mqtt::{broker::Broker, config::Config, Hook, Login};
use log::info;

#[derive(Parser, Debug)]
#[clap(about = "standalone mqtt broker")]
struct Args {
    /// 配置文件路径
    #[clap(short, long, default_value = "./standalone.toml")]
    config: String,
}

/// 把客户端上下线记到日志里
struct LogHook;

#[async_trait]
impl Hook for LogHook {
    async fn authenticate(&self, _login: Option<Login>) -> bool {
        true
    }

    async fn connected(&self, client_id: &str) {
        info!("client {} connected", client_id);
    }

    async fn disconnect(&self, client_id: &str) {
        info!("client {} disconnected", client_id);
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    flexi_logger::Logger::try_with_str("debug")
        .unwrap()
        .start()
        .unwrap();

    // 获取配置
    let cfg = Config::from_path(&args.config).await.unwrap();

    // 启动 broker
    Broker::new(cfg)
        .start_with_hook(Arc::new(LogHook))
        .await
        .unwrap()
}
