use std::sync::Arc;

use log::{debug, error, info};
use tokio::{
    net::TcpListener,
    select,
    sync::{mpsc, Notify},
};

use crate::{
    config::Config,
    error::Error,
    network::ClientEventLoop,
    protocol::{Incoming, Router},
    Hook, HookNoop,
};

/// 代表一个 mqtt broker 节点
pub struct Broker {
    cfg: Config,
    shutdown: Notify,
}

impl Broker {
    pub fn new(cfg: Config) -> Self {
        Self {
            cfg,
            shutdown: Notify::new(),
        }
    }

    /// 通知 accept 循环退出，已建立的连接按各自的路径收尾
    pub fn stop(&self) {
        self.shutdown.notify_one();
    }

    pub async fn start(&self) -> Result<(), Error> {
        self.start_with_hook(Arc::new(HookNoop)).await
    }

    pub async fn start_with_hook<H: Hook>(&self, hook: Arc<H>) -> Result<(), Error> {
        // router 后台任务，所有协议状态在这一个任务里串行变更
        let (router_tx, router_rx) = mpsc::channel(1000);
        let router_hook = hook.clone();
        let session_cfg = self.cfg.session.clone();
        tokio::spawn(async move {
            debug!("start router loop");
            Router::new(session_cfg, router_hook, router_rx).start().await;
            debug!("router loop exit");
        });

        // 开启客户端连接监听
        let listener = TcpListener::bind(&self.cfg.broker.client_addr).await?;
        info!("listening on {}", self.cfg.broker.client_addr);

        let mut next_conn_id: u64 = 0;
        loop {
            let (stream, addr) = select! {
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!("accept tcp stream err: {}", e);
                        continue;
                    }
                },
                _ = self.shutdown.notified() => {
                    info!("broker stopped");
                    return Ok(());
                }
            };
            info!("new stream coming in: {}", addr);

            next_conn_id += 1;
            let conn_id = next_conn_id;

            // 事件循环
            let client_router_tx = router_tx.clone();
            let client_hook = hook.clone();
            tokio::spawn(async move {
                match ClientEventLoop::new(stream, conn_id, client_router_tx.clone(), client_hook)
                    .await
                {
                    Ok(event_loop) => {
                        let client_id = event_loop.client_id.clone();
                        if let Err(e) = event_loop.start().await {
                            error!("eventloop on client {0} exit error: {1:#}", client_id, e);
                            // 异常退出按非正常断开上报，由 router 决定遗嘱与会话去留
                            if let Err(e) = client_router_tx
                                .send(Incoming::Disconnect { client_id, conn_id })
                                .await
                            {
                                error!("send disconnect to router channel error {:#}", e);
                            }
                        }
                    }
                    Err(e) => {
                        error!("eventloop read first connect packet err: {:#}", e)
                    }
                }
            });
        }
    }
}
