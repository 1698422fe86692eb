//! 一个 mqtt 3.1.1 服务端库，用户可以使用此库构建自己的 mqtt broker
//!
//! 核心分为三层：
//! * network：网络层，负责报文编解码与 tcp 读写
//! * protocol：协议层，router 单任务串行处理所有会话与订阅状态
//! * broker：入口，监听客户端连接

use async_trait::async_trait;

pub use network::v4::Login;

pub mod broker;
pub mod config;
pub mod error;
mod network;
mod protocol;

/// mqtt事件发生时的回调，由用户实现
#[async_trait]
pub trait Hook: Send + Sync + 'static {
    /// 客户端认证
    async fn authenticate(&self, login: Option<Login>) -> bool;
    /// 客户端上线
    async fn connected(&self, client_id: &str);
    /// 客户端连接断开
    async fn disconnect(&self, client_id: &str);
}

/// 默认回调，全部放行
pub struct HookNoop;

#[async_trait]
impl Hook for HookNoop {
    async fn authenticate(&self, _login: Option<Login>) -> bool {
        true
    }
    async fn connected(&self, _client_id: &str) {}
    async fn disconnect(&self, _client_id: &str) {}
}
