//! 网络层
//! 本层只关心网络读写，不包含任何协议状态

use std::sync::Arc;

pub(crate) use self::packet::v4;

use tokio::{
    net::TcpStream,
    select,
    sync::mpsc::{self, error::SendError, Receiver, Sender},
    time,
};

use crate::{
    protocol::{ConnectionId, Incoming, Outgoing},
    Hook,
};

use self::{
    conn::ClientConnection,
    packet::Protocol,
    v4::{ConnAck, ConnectReturnCode},
};

pub(crate) mod conn;
pub(crate) mod packet;
pub(crate) mod topic;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Unexpected router message")]
    UnexpectedRouterMessage,
    #[error("Router channel closed")]
    RouterChannelClosed,
    #[error("Connection error: {0}")]
    Connection(#[from] conn::Error),
    #[error("First connect fail: {0:?}")]
    FirstConnectFailed(ConnectReturnCode),
    #[error("Send message to router error: {0}")]
    SendIncoming(#[from] SendError<Incoming>),
}

/// 一个客户端连接的事件循环
pub(crate) struct ClientEventLoop {
    pub(crate) client_id: String,
    conn: ClientConnection,
    router_tx: Sender<Incoming>,
    conn_rx: Receiver<Outgoing>,
    /// 读超时时间，为协商 keepalive 的 1.5 倍；None 表示不检查
    keepalive: Option<time::Duration>,
}

impl ClientEventLoop {
    /// 处理第一个 connect 报文：校验协议版本、认证、交给 router 仲裁，
    /// 并把 router 的 connack 写回客户端
    pub(crate) async fn new<H: Hook>(
        stream: TcpStream,
        conn_id: ConnectionId,
        router_tx: Sender<Incoming>,
        hook: Arc<H>,
    ) -> Result<Self, Error> {
        let mut conn = ClientConnection::new(stream);

        // conn_tx 由 router/session 持有，用于给当前这个 connection 发送消息
        let (conn_tx, mut conn_rx) = mpsc::channel(1000);

        // 第一个报文，必须是 connect 报文
        let connect = match conn.read_connect().await {
            Ok(connect) => connect,
            Err(conn::Error::Packet(packet::Error::InvalidProtocolLevel(_))) => {
                // If a server sends a CONNACK packet containing a non-zero
                // return code it MUST set Session Present to 0 [MQTT-3.2.2-4].
                let code = ConnectReturnCode::UnacceptableProtocolVersion;
                conn.write_connack(ConnAck::new(code, false)).await?;
                return Err(Error::FirstConnectFailed(code));
            }
            Err(e) => return Err(e.into()),
        };
        if connect.protocol != Protocol::V4 {
            let code = ConnectReturnCode::UnacceptableProtocolVersion;
            conn.write_connack(ConnAck::new(code, false)).await?;
            return Err(Error::FirstConnectFailed(code));
        }

        // 调用回调，认证
        if !hook.authenticate(connect.login.clone()).await {
            let code = ConnectReturnCode::NotAuthorized;
            conn.write_connack(ConnAck::new(code, false)).await?;
            return Err(Error::FirstConnectFailed(code));
        }

        // 发送给 router 仲裁（client id 冲突、会话复用）
        router_tx
            .send(Incoming::Connect {
                connect,
                conn_id,
                conn_tx,
            })
            .await?;

        // 获取 router 处理结果
        // 复用持久会话时，生效的 keepalive 与 client id 以 router 为准
        let (ack, client_id, keep_alive) = match conn_rx.recv().await {
            Some(Outgoing::ConnAck {
                ack,
                client_id,
                keep_alive,
            }) => (ack, client_id, keep_alive),
            Some(_) => return Err(Error::UnexpectedRouterMessage),
            None => return Err(Error::RouterChannelClosed),
        };
        let code = ack.code;
        // 发送给客户端
        conn.write_connack(ack).await?;

        match code {
            // router 处理成功，开启循环
            ConnectReturnCode::Accepted => {
                // 调用回调，连接
                hook.connected(&client_id).await;

                let keepalive = match keep_alive {
                    0 => None,
                    secs => {
                        let keep_alive = time::Duration::from_secs(secs as u64);
                        // 协议给的超时余量
                        Some(keep_alive + keep_alive.mul_f32(0.5))
                    }
                };
                Ok(Self {
                    client_id,
                    conn,
                    router_tx,
                    conn_rx,
                    keepalive,
                })
            }
            // 返回失败结果，退出循环
            code => Err(Error::FirstConnectFailed(code)),
        }
    }

    /// 开启事件循环
    /// * connect 报文已在 new 方法中处理过
    /// * 从 conn socket 网络层获取 packet 数据，发送给 router
    /// * 接收 router 的回复，写入 conn socket 网络层
    /// * 收到 router 的 Disconnect 时正常退出
    pub(crate) async fn start(mut self) -> Result<(), Error> {
        loop {
            select! {
                // 从网络层读数据，每轮循环重新计时
                reads = self.conn.read_more(self.keepalive) => {
                    match reads {
                        Ok(packets) => {
                            // 只收到 pingreq 时没有要上抛的数据
                            if packets.is_empty() {
                                continue;
                            }
                            self.router_tx.send(Incoming::Data{
                                client_id: self.client_id.clone(),
                                packets
                            }).await?;
                        },
                        Err(e) => return Err(Error::Connection(e)),
                    }
                }
                // 从 router 读回复
                recv = self.conn_rx.recv() => {
                    match recv {
                        Some(Outgoing::Data(packet)) => self.conn.write_packet(packet).await?,
                        Some(Outgoing::Disconnect) => return Ok(()),
                        Some(_) => return Err(Error::UnexpectedRouterMessage),
                        None => return Err(Error::RouterChannelClosed),
                    }
                }
            }
        }
    }
}
