//! 协议层
//! 处理协议相关的逻辑，依赖于底层的网络层进行网络读写
//!
//! 所有会话、订阅、保留消息的状态都由 router 单任务持有，
//! 各连接通过 channel 把请求串行送进来，避免并发修改

use tokio::sync::mpsc::Sender;

use crate::network::v4::{ConnAck, Connect, Packet};

pub(crate) use router::Router;

mod router;
mod session;
mod topic_tree;

/// 连接序号，进程内单调递增
/// 用于区分同一个 client id 前后两次连接，防止旧连接的断开事件误伤新会话
pub(crate) type ConnectionId = u64;

/// 发送给 router 的消息
#[derive(Debug)]
pub enum Incoming {
    Connect {
        connect: Connect,
        conn_id: ConnectionId,
        conn_tx: Sender<Outgoing>,
    },
    Data {
        client_id: String,
        packets: Vec<Packet>,
    },
    /// 连接异常断开（keepalive 超时、网络错误、协议错误）
    Disconnect {
        client_id: String,
        conn_id: ConnectionId,
    },
}

/// router 发送给客户端连接的回复
#[derive(Debug)]
pub enum Outgoing {
    ConnAck {
        ack: ConnAck,
        /// broker 实际登记的 client id（匿名连接由 broker 分配）
        client_id: String,
        /// 实际生效的 keepalive 秒数（复用持久会话时沿用原值）
        keep_alive: u16,
    },
    Data(Packet),
    /// 通知事件循环退出
    Disconnect,
}
