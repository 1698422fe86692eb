use std::collections::HashMap;

use bytes::Bytes;
use log::debug;
use rand::Rng;
use tokio::sync::mpsc::{error::SendError, Sender};

use crate::network::{
    packet::QoS,
    v4::{LastWill, Login, Packet, PubComp, PubRec, PubRel, Publish},
};

use super::{ConnectionId, Outgoing};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to send outgoing message: {0}")]
    SendOutgoing(#[from] SendError<Outgoing>),
    #[error("Session conn tx not found")]
    SessionConnTxNotFound,
    #[error("Fail to allocate packet id")]
    FailToAllocatePacketId,
    #[error("Packet id does not exist: {0}")]
    PacketIdDoesNotExist(u16),
}

/// 订阅的确认状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SubscriptionState {
    /// 已记录，suback 还没有发出
    Pending,
    Acknowledged,
}

/// 会话持有的一条订阅，和主题树上的记录保持一致
#[derive(Debug, Clone, Copy)]
pub(crate) struct Subscription {
    pub qos: QoS,
    pub state: SubscriptionState,
}

/// 等待确认的报文（QoS >= 1），重连后原样重发
#[derive(Debug, Clone)]
pub(crate) enum Pending {
    /// 已发出的 publish，等待 puback（QoS1）或 pubrec（QoS2）
    Publish(Publish),
    /// 已发出的 pubrel，等待 pubcomp
    PubRel(PubRel),
    /// 入站 QoS2 publish 已回复 pubrec，等待对方的 pubrel
    PubRec(PubRec),
}

/// 代表服务端的一次会话
/// 会话的生命周期不小于一次客户端连接：clean_session 为假时，
/// 订阅与未确认的消息在断开后保留，等待同一 client id 重连
pub(crate) struct Session {
    /// 客户端 id
    pub client_id: String,
    /// clean session（不持久化），immutable
    clean_session: bool,
    /// 协商的 keepalive 秒数
    keep_alive: u16,
    /// 遗嘱消息，正常断开时作废
    will: Option<LastWill>,
    /// 登录凭证
    user: Option<Login>,
    /// 订阅记录，key = topic filter
    subscriptions: HashMap<String, Subscription>,
    /// 未走完确认流程的报文，key = packet id
    in_flight: HashMap<u16, Pending>,
    /// 当前连接的序号，断开事件带着序号来防止旧连接误伤
    conn_id: ConnectionId,
    /// 发送给客户端的消息通道，dormant 会话为 None
    conn_tx: Option<Sender<Outgoing>>,
}

impl Session {
    pub(crate) fn new(
        client_id: &str,
        clean_session: bool,
        keep_alive: u16,
        will: Option<LastWill>,
        user: Option<Login>,
        conn_id: ConnectionId,
        conn_tx: Sender<Outgoing>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            clean_session,
            keep_alive,
            will,
            user,
            subscriptions: HashMap::new(),
            in_flight: HashMap::new(),
            conn_id,
            conn_tx: Some(conn_tx),
        }
    }

    /// 持久会话复用：订阅、未确认消息、遗嘱、keepalive、凭证均沿用
    pub(crate) fn into_resumed(self, conn_id: ConnectionId, conn_tx: Sender<Outgoing>) -> Self {
        Self {
            conn_id,
            conn_tx: Some(conn_tx),
            ..self
        }
    }

    pub(crate) fn connected(&self) -> bool {
        self.conn_tx.is_some()
    }

    pub(crate) fn conn_id(&self) -> ConnectionId {
        self.conn_id
    }

    pub(crate) fn clean_session(&self) -> bool {
        self.clean_session
    }

    pub(crate) fn keep_alive(&self) -> u16 {
        self.keep_alive
    }

    pub(crate) fn user(&self) -> Option<&Login> {
        self.user.as_ref()
    }

    pub(crate) fn set_will(&mut self, will: Option<LastWill>) {
        self.will = will;
    }

    /// 正常断开时遗嘱作废
    pub(crate) fn clear_will(&mut self) {
        self.will = None;
    }

    pub(crate) fn take_will(&mut self) -> Option<LastWill> {
        self.will.take()
    }

    /// 断开连接，会话转入 dormant
    pub(crate) fn take_conn(&mut self) -> Option<Sender<Outgoing>> {
        self.conn_tx.take()
    }

    /// 记录一条订阅，返回被覆盖的旧记录
    pub(crate) fn insert_subscription(&mut self, filter: String, qos: QoS) -> Option<Subscription> {
        self.subscriptions.insert(
            filter,
            Subscription {
                qos,
                state: SubscriptionState::Pending,
            },
        )
    }

    /// suback 已入队，pending 状态的订阅全部转为已确认
    pub(crate) fn ack_subscriptions(&mut self) {
        for sub in self.subscriptions.values_mut() {
            if sub.state == SubscriptionState::Pending {
                sub.state = SubscriptionState::Acknowledged;
            }
        }
    }

    pub(crate) fn remove_subscription(&mut self, filter: &str) -> bool {
        self.subscriptions.remove(filter).is_some()
    }

    /// 清理会话时用于同步主题树
    pub(crate) fn subscription_filters(&self) -> Vec<String> {
        self.subscriptions.keys().cloned().collect()
    }

    /// 给客户端发送消息
    pub(crate) async fn send_packet(&self, packet: Packet) -> Result<(), Error> {
        match &self.conn_tx {
            Some(sender) => Ok(sender.send(Outgoing::Data(packet)).await?),
            None => Err(Error::SessionConnTxNotFound),
        }
    }

    /// 随机分配一个未占用的 packet id，最多尝试 5 次
    fn next_packet_id(&mut self) -> Result<u16, Error> {
        let mut rng = rand::thread_rng();
        for _ in 0..5 {
            let id = rng.gen_range(1..=u16::MAX);
            if !self.in_flight.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(Error::FailToAllocatePacketId)
    }

    /// 向该会话投递一条消息
    ///
    /// 实际投递的 QoS 取发布方与订阅方两者的低者：
    /// * qos0：直接发送，不跟踪
    /// * qos1/qos2：分配 packet id 并记录，收到对应确认后删除
    ///
    /// dormant 会话收不到 qos0 消息；qos1/qos2 先记录，重连后补投
    pub(crate) async fn deliver(
        &mut self,
        topic: &str,
        payload: Bytes,
        publisher_qos: QoS,
        requested_qos: QoS,
        retain: bool,
    ) -> Result<(), Error> {
        let qos = publisher_qos.downgrade(requested_qos);
        let packet_id = match qos {
            QoS::AtMostOnce => 0,
            _ => self.next_packet_id()?,
        };

        let publish = Publish {
            dup: false,
            qos,
            retain,
            topic: topic.into(),
            packet_id,
            payload,
        };
        if qos != QoS::AtMostOnce {
            self.in_flight
                .insert(packet_id, Pending::Publish(publish.clone()));
        }
        if self.conn_tx.is_some() {
            self.send_packet(Packet::Publish(publish)).await?;
        }

        Ok(())
    }

    /// puback/pubcomp：确认流程走完，删除记录
    pub(crate) fn acknowledge(&mut self, packet_id: u16) -> Result<(), Error> {
        match self.in_flight.remove(&packet_id) {
            Some(_) => Ok(()),
            None => Err(Error::PacketIdDoesNotExist(packet_id)),
        }
    }

    /// 发送方收到 pubrec：publish 记录转为 pubrel，并发出 pubrel
    pub(crate) async fn publish_receive(&mut self, pubrec: PubRec) -> Result<(), Error> {
        if !matches!(
            self.in_flight.get(&pubrec.packet_id),
            Some(Pending::Publish(_))
        ) {
            return Err(Error::PacketIdDoesNotExist(pubrec.packet_id));
        }

        let pubrel = PubRel {
            packet_id: pubrec.packet_id,
        };
        self.in_flight
            .insert(pubrec.packet_id, Pending::PubRel(pubrel.clone()));
        self.send_packet(Packet::PubRel(pubrel)).await
    }

    /// 接收方收到 pubrel：删除入站记录
    /// pubcomp 丢失后对方会重发 pubrel，所以无论记录是否存在都要回复
    pub(crate) async fn publish_release(&mut self, pubrel: PubRel) -> Result<(), Error> {
        match self.in_flight.get(&pubrel.packet_id) {
            Some(Pending::PubRec(_)) => {
                self.in_flight.remove(&pubrel.packet_id);
            }
            _ => debug!(
                "{} pubrel for unknown packet id {}",
                self.client_id, pubrel.packet_id
            ),
        }
        self.send_packet(Packet::PubComp(PubComp {
            packet_id: pubrel.packet_id,
        }))
        .await
    }

    /// 入站 QoS2 publish：记录 packet id；同一 id 重复投递返回 false
    pub(crate) fn note_received(&mut self, packet_id: u16) -> bool {
        match self.in_flight.get(&packet_id) {
            Some(Pending::PubRec(_)) => false,
            _ => {
                self.in_flight
                    .insert(packet_id, Pending::PubRec(PubRec { packet_id }));
                true
            }
        }
    }

    /// 重连后重发所有未确认的报文，publish 需标记 dup
    pub(crate) async fn redeliver(&mut self) -> Result<(), Error> {
        let pending: Vec<Pending> = self.in_flight.values().cloned().collect();
        for entry in pending {
            let packet = match entry {
                Pending::Publish(mut publish) => {
                    publish.dup = true;
                    Packet::Publish(publish)
                }
                Pending::PubRel(pubrel) => Packet::PubRel(pubrel),
                Pending::PubRec(pubrec) => Packet::PubRec(pubrec),
            };
            self.send_packet(packet).await?;
        }
        Ok(())
    }
}
