use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time,
};

use bytes::Bytes;
use log::{debug, error, info, warn};
use tokio::sync::mpsc::{error::SendError, Receiver, Sender};

use crate::{
    config,
    network::{
        packet::QoS,
        v4::{
            ConnAck, Connect, ConnectReturnCode, LastWill, Packet, PubAck, PubComp, PubRec,
            PubRel, Publish, SubAck, Subscribe, SubscribeReasonCode, UnsubAck, Unsubscribe,
        },
    },
    Hook,
};

use super::{
    session::{self, Session},
    topic_tree::{self, TopicTree},
    ConnectionId, Incoming, Outgoing,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to send outgoing message: {0}")]
    SendOutgoing(#[from] SendError<Outgoing>),
    #[error("Unexpected packet")]
    UnexpectedPacket,
    #[error("Session not found")]
    SessionNotFound,
    #[error("Empty topic filters")]
    EmptyFilters,
    #[error("Packet id should be zero")]
    PacketIdShouldBeZero,
    #[error("Packet id should not be zero")]
    PacketIdShouldNotBeZero,
    #[error("session error: {0}")]
    Session(#[from] session::Error),
    #[error("topic tree error: {0}")]
    TopicTree(#[from] topic_tree::Error),
}

/// 处理 mqtt 协议层运行时相关逻辑
/// 接收消息，处理，发送到对应的会话
///
/// 所有会话与主题树的状态都由这一个任务串行修改，
/// 单个会话的协议错误只断开它自己，不把错误抛出循环
pub(crate) struct Router<H: Hook> {
    session_cfg: config::Session,
    /// 各个客户端连接发送过来需要处理的数据
    router_rx: Receiver<Incoming>,
    /// 管理客户端会话信息，key = client_id
    /// 持久会话断开后仍留在这里（dormant），等待同一 id 重连
    sessions: HashMap<String, Session>,
    /// 已经断开的持久会话 (client_id, 断开时间)
    /// 配置了过期时间时，新连接进来会顺带清理队首过期的会话
    ineffective_sessions: VecDeque<(String, time::Instant)>,
    /// 主题树：订阅关系与保留消息
    topic_tree: TopicTree,
    /// 分配给匿名客户端的序号
    anonymous_seq: usize,
    /// 钩子函数
    hook: Arc<H>,
}

impl<H: Hook> Router<H> {
    pub(crate) fn new(
        session_cfg: config::Session,
        hook: Arc<H>,
        router_rx: Receiver<Incoming>,
    ) -> Self {
        Self {
            session_cfg,
            router_rx,
            sessions: HashMap::new(),
            ineffective_sessions: VecDeque::new(),
            topic_tree: TopicTree::new(),
            anonymous_seq: 0,
            hook,
        }
    }

    /// 开始 router 逻辑处理循环，channel 全部关闭后退出
    pub(crate) async fn start(mut self) {
        while let Some(incoming) = self.router_rx.recv().await {
            self.handle_incoming(incoming).await;
        }
    }

    /// 分发处理
    async fn handle_incoming(&mut self, incoming: Incoming) {
        match incoming {
            Incoming::Connect {
                connect,
                conn_id,
                conn_tx,
            } => {
                if let Err(e) = self.handle_connect(connect, conn_id, conn_tx).await {
                    error!("handle connect error: {}", e);
                }
            }
            Incoming::Data { client_id, packets } => {
                for packet in packets {
                    if let Err(e) = self.handle_packet(&client_id, packet).await {
                        // 协议错误按异常断开处理，遗嘱照常投递
                        error!("client {} protocol error: {}", client_id, e);
                        self.disconnect_session(&client_id, false).await;
                        break;
                    }
                }
            }
            Incoming::Disconnect { client_id, conn_id } => {
                self.handle_conn_disconnect(&client_id, conn_id).await
            }
        }
    }

    async fn handle_packet(&mut self, client_id: &str, packet: Packet) -> Result<(), Error> {
        match packet {
            Packet::Publish(publish) => self.handle_publish(client_id, publish).await,
            Packet::PubAck(puback) => self.handle_publish_ack(client_id, puback),
            Packet::PubRec(pubrec) => self.handle_publish_receive(client_id, pubrec).await,
            Packet::PubRel(pubrel) => self.handle_publish_release(client_id, pubrel).await,
            Packet::PubComp(pubcomp) => self.handle_publish_complete(client_id, pubcomp),
            Packet::Subscribe(subscribe) => self.handle_subscribe(client_id, subscribe).await,
            Packet::Unsubscribe(unsubscribe) => {
                self.handle_unsubscribe(client_id, unsubscribe).await
            }
            Packet::Disconnect => self.handle_client_disconnect(client_id).await,
            _ => Err(Error::UnexpectedPacket),
        }
    }

    /// 处理客户端连接
    ///
    /// * 同名会话在线：拒绝新的连接请求，旧连接不受影响
    /// * clean_session 为假且存在 dormant 会话：复用（session present）
    /// * 空 client id：只允许 clean session，由 broker 代为分配
    async fn handle_connect(
        &mut self,
        connect: Connect,
        conn_id: ConnectionId,
        conn_tx: Sender<Outgoing>,
    ) -> Result<(), Error> {
        let Connect {
            keep_alive,
            client_id,
            clean_session,
            last_will,
            login,
            ..
        } = connect;

        let connected = self
            .sessions
            .get(&client_id)
            .map(|s| s.connected())
            .unwrap_or(false);
        if connected {
            info!("reject connect: client id {} is in use", client_id);
            return Ok(conn_tx
                .send(Outgoing::ConnAck {
                    ack: ConnAck::new(ConnectReturnCode::IdentifierRejected, false),
                    client_id,
                    keep_alive,
                })
                .await?);
        }

        let client_id = if client_id.is_empty() {
            if !clean_session {
                return Ok(conn_tx
                    .send(Outgoing::ConnAck {
                        ack: ConnAck::new(ConnectReturnCode::IdentifierRejected, false),
                        client_id,
                        keep_alive,
                    })
                    .await?);
            }
            self.assign_client_id()
        } else {
            client_id
        };

        // 拿出之前存储的 dormant 会话
        let mut session_present = false;
        let dormant = match self.sessions.remove(&client_id) {
            Some(dormant) if !clean_session => {
                session_present = true;
                Some(dormant)
            }
            Some(dormant) => {
                // clean session 丢弃旧状态，包括主题树里的订阅
                self.purge_subscriptions(&dormant);
                None
            }
            None => None,
        };
        // 从待清理队列中移除当前会话
        self.ineffective_sessions.retain(|(c, _)| c != &client_id);

        let session = match dormant {
            Some(dormant) => {
                let mut session = dormant.into_resumed(conn_id, conn_tx.clone());
                // connect 报文自带的遗嘱优先于沿用的
                if last_will.is_some() {
                    session.set_will(last_will);
                }
                session
            }
            None => Session::new(
                &client_id,
                clean_session,
                keep_alive,
                last_will,
                login,
                conn_id,
                conn_tx.clone(),
            ),
        };

        // 发送 ack 消息，复用会话时 keepalive 沿用原值
        conn_tx
            .send(Outgoing::ConnAck {
                ack: ConnAck::new(ConnectReturnCode::Accepted, session_present),
                client_id: client_id.clone(),
                keep_alive: session.keep_alive(),
            })
            .await?;

        debug!(
            "session registered: client_id={} clean_session={} present={} user={:?}",
            client_id,
            clean_session,
            session_present,
            session.user().map(|u| u.username.as_str())
        );
        self.sessions.insert(client_id.clone(), session);

        // connack 之后、处理新流量之前，重发未确认的报文
        if let Some(session) = self.sessions.get_mut(&client_id) {
            if let Err(e) = session.redeliver().await {
                warn!("redelivery to {} failed: {}", client_id, e);
            }
        }

        // 顺带清理一波过期的 dormant 会话
        self.sweep_expired_sessions();
        Ok(())
    }

    /// 为匿名客户端生成一个 id
    fn assign_client_id(&mut self) -> String {
        self.anonymous_seq += 1;
        format!("anon-{}", self.anonymous_seq)
    }

    /// 处理 publish
    ///
    /// QoS0：双方都不保存状态
    /// QoS1：接收即分发，回复 puback
    /// QoS2：记录 packet id 去重，回复 pubrec，等 pubrel 后结束
    async fn handle_publish(&mut self, client_id: &str, publish: Publish) -> Result<(), Error> {
        match publish.qos {
            QoS::AtMostOnce if publish.packet_id != 0 => return Err(Error::PacketIdShouldBeZero),
            QoS::AtLeastOnce | QoS::ExactlyOnce if publish.packet_id == 0 => {
                return Err(Error::PacketIdShouldNotBeZero)
            }
            _ => {}
        }

        // 保留消息，空负载表示清除
        if publish.retain {
            self.topic_tree
                .apply_retain(&publish.topic, publish.qos, publish.payload.clone())?;
        }

        match publish.qos {
            QoS::AtMostOnce => {
                self.publish_to_subscribers(&publish.topic, &publish.payload, publish.qos, false)
                    .await;
            }
            QoS::AtLeastOnce => {
                self.publish_to_subscribers(&publish.topic, &publish.payload, publish.qos, false)
                    .await;
                let session = self
                    .sessions
                    .get_mut(client_id)
                    .ok_or(Error::SessionNotFound)?;
                session
                    .send_packet(Packet::PubAck(PubAck {
                        packet_id: publish.packet_id,
                    }))
                    .await?;
            }
            QoS::ExactlyOnce => {
                let session = self
                    .sessions
                    .get_mut(client_id)
                    .ok_or(Error::SessionNotFound)?;
                let fresh = session.note_received(publish.packet_id);
                session
                    .send_packet(Packet::PubRec(PubRec {
                        packet_id: publish.packet_id,
                    }))
                    .await?;
                // 同一 packet id 的重发不再二次分发
                if fresh {
                    self.publish_to_subscribers(
                        &publish.topic,
                        &publish.payload,
                        publish.qos,
                        false,
                    )
                    .await;
                }
            }
        }

        Ok(())
    }

    /// 给主题节点上的所有订阅者发送消息
    /// 单个订阅者的投递失败不影响其它订阅者，也不影响发布方
    async fn publish_to_subscribers(
        &mut self,
        topic: &str,
        payload: &Bytes,
        publisher_qos: QoS,
        retain: bool,
    ) {
        let nodes = match self.topic_tree.resolve(topic, true) {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!("publish topic {} invalid: {}", topic, e);
                return;
            }
        };
        let Some(&node) = nodes.first() else { return };

        let subscribers: Vec<(String, QoS)> = self
            .topic_tree
            .node(node)
            .subscribers()
            .iter()
            .map(|(id, &qos)| (id.clone(), qos))
            .collect();

        for (subscriber_id, requested_qos) in subscribers {
            let Some(session) = self.sessions.get_mut(&subscriber_id) else {
                continue;
            };
            if let Err(e) = session
                .deliver(topic, payload.clone(), publisher_qos, requested_qos, retain)
                .await
            {
                warn!("deliver to {} failed: {}", subscriber_id, e);
            }
        }
    }

    /// 处理 puback
    fn handle_publish_ack(&mut self, client_id: &str, puback: PubAck) -> Result<(), Error> {
        if let Some(session) = self.sessions.get_mut(client_id) {
            if puback.packet_id > 0 {
                if let Err(e) = session.acknowledge(puback.packet_id) {
                    // 重复确认是 at-least-once 语义下的预期情况
                    debug!("{} puback: {}", client_id, e);
                }
            }
        }
        Ok(())
    }

    /// 处理 pubrec
    async fn handle_publish_receive(
        &mut self,
        client_id: &str,
        pubrec: PubRec,
    ) -> Result<(), Error> {
        if pubrec.packet_id == 0 {
            return Err(Error::PacketIdShouldNotBeZero);
        }
        if let Some(session) = self.sessions.get_mut(client_id) {
            match session.publish_receive(pubrec).await {
                Err(session::Error::PacketIdDoesNotExist(id)) => {
                    debug!("{} pubrec for unknown packet id {}", client_id, id)
                }
                other => other?,
            }
        }
        Ok(())
    }

    /// 处理 pubrel
    async fn handle_publish_release(
        &mut self,
        client_id: &str,
        pubrel: PubRel,
    ) -> Result<(), Error> {
        if pubrel.packet_id == 0 {
            return Err(Error::PacketIdShouldNotBeZero);
        }
        if let Some(session) = self.sessions.get_mut(client_id) {
            session.publish_release(pubrel).await?;
        }
        Ok(())
    }

    /// 处理 pubcomp
    fn handle_publish_complete(&mut self, client_id: &str, pubcomp: PubComp) -> Result<(), Error> {
        if let Some(session) = self.sessions.get_mut(client_id) {
            if let Err(e) = session.acknowledge(pubcomp.packet_id) {
                debug!("{} pubcomp: {}", client_id, e);
            }
        }
        Ok(())
    }

    /// 处理订阅请求
    /// 通配符位置错误的 filter 回复失败码，连接保持；
    /// 匹配节点上如有保留消息，在 suback 之前投递给新订阅者
    async fn handle_subscribe(
        &mut self,
        client_id: &str,
        subscribe: Subscribe,
    ) -> Result<(), Error> {
        let Subscribe { packet_id, filters } = subscribe;
        if packet_id == 0 {
            return Err(Error::PacketIdShouldNotBeZero);
        }
        if filters.is_empty() {
            return Err(Error::EmptyFilters);
        }
        if !self.sessions.contains_key(client_id) {
            return Err(Error::SessionNotFound);
        }

        let mut return_codes = Vec::with_capacity(filters.len());
        // (topic, 保留消息, 订阅请求的 qos)
        let mut retained = Vec::new();
        for filter in filters {
            match self
                .topic_tree
                .apply_subscriber(client_id, &filter.path, filter.qos)
            {
                Ok(nodes) => {
                    for &node in &nodes {
                        let node = self.topic_tree.node(node);
                        if let Some(r) = node.retained() {
                            retained.push((node.full_path().to_string(), r.clone(), filter.qos));
                        }
                    }
                    if let Some(session) = self.sessions.get_mut(client_id) {
                        if let Some(prev) =
                            session.insert_subscription(filter.path.clone(), filter.qos)
                        {
                            debug!(
                                "{} resubscribe {}: qos {:?} -> {:?}",
                                client_id, filter.path, prev.qos, filter.qos
                            );
                        }
                    }
                    return_codes.push(SubscribeReasonCode::Success(filter.qos));
                }
                Err(e) => {
                    warn!("{} subscribe {} rejected: {}", client_id, filter.path, e);
                    return_codes.push(SubscribeReasonCode::Failure);
                }
            }
        }

        let session = self
            .sessions
            .get_mut(client_id)
            .ok_or(Error::SessionNotFound)?;
        for (topic, r, requested_qos) in retained {
            if let Err(e) = session
                .deliver(&topic, r.payload, r.qos, requested_qos, true)
                .await
            {
                warn!("retained delivery to {} failed: {}", client_id, e);
            }
        }
        session
            .send_packet(Packet::SubAck(SubAck {
                packet_id,
                return_codes,
            }))
            .await?;
        session.ack_subscriptions();
        Ok(())
    }

    /// 处理取消订阅
    /// 未订阅过的 filter 记日志后忽略
    async fn handle_unsubscribe(
        &mut self,
        client_id: &str,
        unsubscribe: Unsubscribe,
    ) -> Result<(), Error> {
        let Unsubscribe { packet_id, filters } = unsubscribe;
        if packet_id == 0 {
            return Err(Error::PacketIdShouldNotBeZero);
        }
        if filters.is_empty() {
            return Err(Error::EmptyFilters);
        }
        if !self.sessions.contains_key(client_id) {
            return Err(Error::SessionNotFound);
        }

        for filter in &filters {
            if let Err(e) = self.topic_tree.delete_subscriber(client_id, filter) {
                warn!("{} unsubscribe {} failed: {}", client_id, filter, e);
            }
        }
        let session = self
            .sessions
            .get_mut(client_id)
            .ok_or(Error::SessionNotFound)?;
        for filter in &filters {
            if !session.remove_subscription(filter) {
                debug!("{} unsubscribe unknown filter {}", client_id, filter);
            }
        }
        session
            .send_packet(Packet::UnsubAck(UnsubAck { packet_id }))
            .await?;
        Ok(())
    }

    /// 客户端主动断开：遗嘱作废，不投递
    async fn handle_client_disconnect(&mut self, client_id: &str) -> Result<(), Error> {
        if let Some(session) = self.sessions.get_mut(client_id) {
            session.clear_will();
        }
        self.disconnect_session(client_id, true).await;
        Ok(())
    }

    /// 连接异常断开（keepalive 超时、网络错误）
    /// conn_id 不符说明是旧连接迟到的报告，忽略
    async fn handle_conn_disconnect(&mut self, client_id: &str, conn_id: ConnectionId) {
        let stale = self
            .sessions
            .get(client_id)
            .map(|s| !s.connected() || s.conn_id() != conn_id)
            .unwrap_or(true);
        if stale {
            return;
        }
        self.disconnect_session(client_id, false).await;
    }

    /// 唯一的断开路径，超时、网络错误、协议错误、主动断开都走这里
    /// 对已断开的会话重复调用无事发生
    async fn disconnect_session(&mut self, client_id: &str, graceful: bool) {
        let Some(session) = self.sessions.get_mut(client_id) else {
            return;
        };
        if !session.connected() {
            return;
        }
        let clean_session = session.clean_session();

        if let Some(conn_tx) = session.take_conn() {
            // 通知事件循环退出；连接已死时失败可忽略
            let _ = conn_tx.try_send(Outgoing::Disconnect);
        }

        // 异常断开投递遗嘱，主动断开时遗嘱已作废
        if !graceful {
            let will = self
                .sessions
                .get_mut(client_id)
                .and_then(|s| s.take_will());
            if let Some(will) = will {
                self.deliver_will(&will).await;
            }
        }

        self.hook.disconnect(client_id).await;

        if clean_session {
            if let Some(session) = self.sessions.remove(client_id) {
                self.purge_subscriptions(&session);
            }
            debug!("clean session removed: {}", client_id);
        } else {
            self.ineffective_sessions
                .push_back((client_id.to_string(), time::Instant::now()));
            debug!("session dormant: {}", client_id);
        }
    }

    /// 投递遗嘱：retain 标志为真时先存为保留消息，再分发给遗嘱主题的订阅者
    async fn deliver_will(&mut self, will: &LastWill) {
        if will.retain {
            if let Err(e) = self
                .topic_tree
                .apply_retain(&will.topic, will.qos, will.message.clone())
            {
                warn!("retain will on {} failed: {}", will.topic, e);
            }
        }
        self.publish_to_subscribers(&will.topic, &will.message, will.qos, will.retain)
            .await;
    }

    /// 会话移除时同步清理主题树上的订阅
    fn purge_subscriptions(&mut self, session: &Session) {
        for filter in session.subscription_filters() {
            if let Err(e) = self.topic_tree.delete_subscriber(&session.client_id, &filter) {
                warn!("drop subscription {} failed: {}", filter, e);
            }
        }
    }

    /// 惰性清理过期的 dormant 会话，只在配置了过期时间时生效
    fn sweep_expired_sessions(&mut self) {
        let Some(expire) = self.session_cfg.expire_interval else {
            return;
        };
        let expire = time::Duration::from_secs(expire);
        let now = time::Instant::now();

        while let Some((client_id, dropped_at)) = self.ineffective_sessions.pop_front() {
            // 没到超时时间，退出
            if now.duration_since(dropped_at) < expire {
                self.ineffective_sessions.push_front((client_id, dropped_at));
                break;
            }
            // 已重连的会话不在队列里，这里移除的必然是 dormant
            if let Some(session) = self.sessions.remove(&client_id) {
                self.purge_subscriptions(&session);
                debug!("expired session removed: {}", client_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use tokio::sync::mpsc::{self, Receiver};

    use super::*;
    use crate::{
        network::{packet::Protocol, v4::SubscribeFilter},
        HookNoop,
    };

    fn test_router() -> Router<HookNoop> {
        let (_router_tx, router_rx) = mpsc::channel(8);
        Router::new(config::Session::default(), Arc::new(HookNoop), router_rx)
    }

    fn connect_packet(client_id: &str, clean_session: bool, last_will: Option<LastWill>) -> Connect {
        Connect {
            protocol: Protocol::V4,
            keep_alive: 30,
            client_id: client_id.into(),
            clean_session,
            last_will,
            login: None,
        }
    }

    /// 完成一次 connect 握手，断言成功并返回连接的接收端与 session_present
    async fn connect(
        router: &mut Router<HookNoop>,
        client_id: &str,
        clean_session: bool,
        will: Option<LastWill>,
        conn_id: ConnectionId,
    ) -> (Receiver<Outgoing>, bool) {
        let (conn_tx, mut conn_rx) = mpsc::channel(64);
        router
            .handle_incoming(Incoming::Connect {
                connect: connect_packet(client_id, clean_session, will),
                conn_id,
                conn_tx,
            })
            .await;

        match conn_rx.try_recv().unwrap() {
            Outgoing::ConnAck { ack, .. } => {
                assert_eq!(ack.code, ConnectReturnCode::Accepted);
                (conn_rx, ack.session_present)
            }
            other => panic!("unexpected outgoing: {:?}", other),
        }
    }

    async fn send_packets(router: &mut Router<HookNoop>, client_id: &str, packets: Vec<Packet>) {
        router
            .handle_incoming(Incoming::Data {
                client_id: client_id.into(),
                packets,
            })
            .await;
    }

    async fn subscribe(
        router: &mut Router<HookNoop>,
        client_id: &str,
        packet_id: u16,
        filters: &[(&str, QoS)],
    ) {
        let filters = filters
            .iter()
            .map(|&(path, qos)| SubscribeFilter {
                path: path.into(),
                qos,
            })
            .collect();
        send_packets(
            router,
            client_id,
            vec![Packet::Subscribe(Subscribe { packet_id, filters })],
        )
        .await;
    }

    fn publish_packet(topic: &str, qos: QoS, packet_id: u16, payload: &'static [u8], retain: bool) -> Publish {
        Publish {
            dup: false,
            qos,
            retain,
            topic: topic.into(),
            packet_id,
            payload: Bytes::from_static(payload),
        }
    }

    fn recv_data(conn_rx: &mut Receiver<Outgoing>) -> Packet {
        match conn_rx.try_recv().unwrap() {
            Outgoing::Data(packet) => packet,
            other => panic!("unexpected outgoing: {:?}", other),
        }
    }

    fn recv_publish(conn_rx: &mut Receiver<Outgoing>) -> Publish {
        match recv_data(conn_rx) {
            Packet::Publish(publish) => publish,
            p => panic!("unexpected packet: {:?}", p),
        }
    }

    #[tokio::test]
    async fn fan_out_downgrades_qos() {
        let mut router = test_router();
        let (mut sub_rx, _) = connect(&mut router, "sub", true, None, 1).await;
        subscribe(&mut router, "sub", 1, &[("t", QoS::AtLeastOnce)]).await;
        assert_matches!(recv_data(&mut sub_rx), Packet::SubAck(_));

        let (mut pub_rx, _) = connect(&mut router, "pub", true, None, 2).await;
        send_packets(
            &mut router,
            "pub",
            vec![Packet::Publish(publish_packet("t", QoS::ExactlyOnce, 7, b"x", false))],
        )
        .await;

        // 发布端收到 pubrec
        assert_matches!(
            recv_data(&mut pub_rx),
            Packet::PubRec(PubRec { packet_id: 7 })
        );
        // 订阅端收到降级后的 publish
        let publish = recv_publish(&mut sub_rx);
        assert_eq!(publish.qos, QoS::AtLeastOnce);
        assert_eq!(publish.payload, Bytes::from_static(b"x"));
        assert!(!publish.retain);
    }

    #[tokio::test]
    async fn persistent_session_redelivers_in_flight() {
        let mut router = test_router();
        let (mut sub_rx, present) = connect(&mut router, "sub", false, None, 1).await;
        assert!(!present);
        subscribe(&mut router, "sub", 1, &[("t", QoS::AtLeastOnce)]).await;
        assert_matches!(recv_data(&mut sub_rx), Packet::SubAck(_));

        let (mut pub_rx, _) = connect(&mut router, "pub", true, None, 2).await;
        send_packets(
            &mut router,
            "pub",
            vec![Packet::Publish(publish_packet("t", QoS::AtLeastOnce, 9, b"x", false))],
        )
        .await;
        let first = recv_publish(&mut sub_rx);
        assert!(!first.dup);
        assert_matches!(recv_data(&mut pub_rx), Packet::PubAck(_));

        // 不回 puback，直接异常断线
        router
            .handle_incoming(Incoming::Disconnect {
                client_id: "sub".into(),
                conn_id: 1,
            })
            .await;

        // 重连：session present，恰好一条 dup 重发，packet id 不变
        let (mut sub_rx, present) = connect(&mut router, "sub", false, None, 3).await;
        assert!(present);
        let redelivered = recv_publish(&mut sub_rx);
        assert!(redelivered.dup);
        assert_eq!(redelivered.packet_id, first.packet_id);
        assert!(sub_rx.try_recv().is_err());

        // 订阅也一并恢复，新消息正常投递
        send_packets(
            &mut router,
            "pub",
            vec![Packet::Publish(publish_packet("t", QoS::AtMostOnce, 0, b"y", false))],
        )
        .await;
        let publish = recv_publish(&mut sub_rx);
        assert_eq!(publish.payload, Bytes::from_static(b"y"));
    }

    #[tokio::test]
    async fn clean_session_discards_state() {
        let mut router = test_router();
        let (mut sub_rx, _) = connect(&mut router, "sub", false, None, 1).await;
        subscribe(&mut router, "sub", 1, &[("t", QoS::AtLeastOnce)]).await;
        assert_matches!(recv_data(&mut sub_rx), Packet::SubAck(_));

        let (_pub_rx, _) = connect(&mut router, "pub", true, None, 2).await;
        send_packets(
            &mut router,
            "pub",
            vec![Packet::Publish(publish_packet("t", QoS::AtLeastOnce, 9, b"x", false))],
        )
        .await;
        let _ = recv_publish(&mut sub_rx);

        router
            .handle_incoming(Incoming::Disconnect {
                client_id: "sub".into(),
                conn_id: 1,
            })
            .await;

        // clean session 重连：什么都不剩
        let (mut sub_rx, present) = connect(&mut router, "sub", true, None, 3).await;
        assert!(!present);
        assert!(sub_rx.try_recv().is_err());

        // 订阅也被丢弃
        send_packets(
            &mut router,
            "pub",
            vec![Packet::Publish(publish_packet("t", QoS::AtMostOnce, 0, b"y", false))],
        )
        .await;
        assert!(sub_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn will_delivered_on_ungraceful_loss() {
        let mut router = test_router();
        let (mut watcher_rx, _) = connect(&mut router, "watcher", true, None, 1).await;
        subscribe(&mut router, "watcher", 1, &[("w", QoS::AtMostOnce)]).await;
        assert_matches!(recv_data(&mut watcher_rx), Packet::SubAck(_));

        let will = LastWill {
            topic: "w".into(),
            message: Bytes::from_static(b"gone"),
            qos: QoS::AtMostOnce,
            retain: false,
        };
        let (_doomed_rx, _) = connect(&mut router, "doomed", true, Some(will), 2).await;
        router
            .handle_incoming(Incoming::Disconnect {
                client_id: "doomed".into(),
                conn_id: 2,
            })
            .await;

        let publish = recv_publish(&mut watcher_rx);
        assert_eq!(publish.topic, "w");
        assert_eq!(publish.payload, Bytes::from_static(b"gone"));
        assert!(watcher_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn will_not_delivered_on_graceful_disconnect() {
        let mut router = test_router();
        let (mut watcher_rx, _) = connect(&mut router, "watcher", true, None, 1).await;
        subscribe(&mut router, "watcher", 1, &[("w", QoS::AtMostOnce)]).await;
        assert_matches!(recv_data(&mut watcher_rx), Packet::SubAck(_));

        let will = LastWill {
            topic: "w".into(),
            message: Bytes::from_static(b"gone"),
            qos: QoS::AtMostOnce,
            retain: false,
        };
        let (mut doomed_rx, _) = connect(&mut router, "doomed", true, Some(will), 2).await;

        // 先 disconnect 报文，再连接关闭事件
        send_packets(&mut router, "doomed", vec![Packet::Disconnect]).await;
        assert_matches!(doomed_rx.try_recv().unwrap(), Outgoing::Disconnect);
        router
            .handle_incoming(Incoming::Disconnect {
                client_id: "doomed".into(),
                conn_id: 2,
            })
            .await;

        assert!(watcher_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn retained_delivered_on_subscribe() {
        let mut router = test_router();
        let (mut pub_rx, _) = connect(&mut router, "pub", true, None, 1).await;
        // qos1 retain publish，此时无人订阅
        send_packets(
            &mut router,
            "pub",
            vec![Packet::Publish(publish_packet("t", QoS::AtLeastOnce, 5, b"x", true))],
        )
        .await;
        assert_matches!(recv_data(&mut pub_rx), Packet::PubAck(_));

        // qos2 订阅：保留消息以 min(1, 2) = 1 投递，retain 置位，先于 suback
        let (mut sub_rx, _) = connect(&mut router, "sub", true, None, 2).await;
        subscribe(&mut router, "sub", 1, &[("t", QoS::ExactlyOnce)]).await;

        let publish = recv_publish(&mut sub_rx);
        assert!(publish.retain);
        assert_eq!(publish.qos, QoS::AtLeastOnce);
        assert_eq!(publish.payload, Bytes::from_static(b"x"));
        assert_matches!(recv_data(&mut sub_rx), Packet::SubAck(_));
    }

    #[tokio::test]
    async fn duplicate_client_id_rejected() {
        let mut router = test_router();
        let (mut first_rx, _) = connect(&mut router, "dup", true, None, 1).await;

        let (conn_tx, mut second_rx) = mpsc::channel(64);
        router
            .handle_incoming(Incoming::Connect {
                connect: connect_packet("dup", true, None),
                conn_id: 2,
                conn_tx,
            })
            .await;
        match second_rx.try_recv().unwrap() {
            Outgoing::ConnAck { ack, .. } => {
                assert_eq!(ack.code, ConnectReturnCode::IdentifierRejected);
                assert!(!ack.session_present);
            }
            other => panic!("unexpected outgoing: {:?}", other),
        }

        // 旧连接不受影响
        subscribe(&mut router, "dup", 1, &[("t", QoS::AtMostOnce)]).await;
        assert_matches!(recv_data(&mut first_rx), Packet::SubAck(_));
        send_packets(
            &mut router,
            "dup",
            vec![Packet::Publish(publish_packet("t", QoS::AtMostOnce, 0, b"x", false))],
        )
        .await;
        let publish = recv_publish(&mut first_rx);
        assert_eq!(publish.payload, Bytes::from_static(b"x"));
    }

    #[tokio::test]
    async fn empty_client_id_policy() {
        let mut router = test_router();

        // clean session：broker 代为分配 id
        let (conn_tx, mut conn_rx) = mpsc::channel(64);
        router
            .handle_incoming(Incoming::Connect {
                connect: connect_packet("", true, None),
                conn_id: 1,
                conn_tx,
            })
            .await;
        match conn_rx.try_recv().unwrap() {
            Outgoing::ConnAck { ack, client_id, .. } => {
                assert_eq!(ack.code, ConnectReturnCode::Accepted);
                assert!(!client_id.is_empty());
            }
            other => panic!("unexpected outgoing: {:?}", other),
        }

        // 非 clean session：拒绝
        let (conn_tx, mut conn_rx) = mpsc::channel(64);
        router
            .handle_incoming(Incoming::Connect {
                connect: connect_packet("", false, None),
                conn_id: 2,
                conn_tx,
            })
            .await;
        match conn_rx.try_recv().unwrap() {
            Outgoing::ConnAck { ack, .. } => {
                assert_eq!(ack.code, ConnectReturnCode::IdentifierRejected);
            }
            other => panic!("unexpected outgoing: {:?}", other),
        }
    }

    #[tokio::test]
    async fn resumed_session_adopts_keep_alive() {
        let mut router = test_router();
        let (_conn_rx, _) = connect(&mut router, "c", false, None, 1).await;
        router
            .handle_incoming(Incoming::Disconnect {
                client_id: "c".into(),
                conn_id: 1,
            })
            .await;

        // 重连时带了不同的 keepalive，生效的仍是 dormant 会话的值
        let (conn_tx, mut conn_rx) = mpsc::channel(64);
        let mut connect = connect_packet("c", false, None);
        connect.keep_alive = 60;
        router
            .handle_incoming(Incoming::Connect {
                connect,
                conn_id: 2,
                conn_tx,
            })
            .await;
        match conn_rx.try_recv().unwrap() {
            Outgoing::ConnAck {
                ack, keep_alive, ..
            } => {
                assert!(ack.session_present);
                assert_eq!(keep_alive, 30);
            }
            other => panic!("unexpected outgoing: {:?}", other),
        }
    }

    #[tokio::test]
    async fn protocol_violation_disconnects_offender_with_will() {
        let mut router = test_router();
        let (mut watcher_rx, _) = connect(&mut router, "watcher", true, None, 1).await;
        subscribe(&mut router, "watcher", 1, &[("w", QoS::AtMostOnce)]).await;
        assert_matches!(recv_data(&mut watcher_rx), Packet::SubAck(_));

        let will = LastWill {
            topic: "w".into(),
            message: Bytes::from_static(b"gone"),
            qos: QoS::AtMostOnce,
            retain: false,
        };
        let (mut bad_rx, _) = connect(&mut router, "bad", true, Some(will), 2).await;

        // qos0 的 publish 不允许携带 packet id
        send_packets(
            &mut router,
            "bad",
            vec![Packet::Publish(publish_packet("t", QoS::AtMostOnce, 3, b"x", false))],
        )
        .await;

        assert_matches!(bad_rx.try_recv().unwrap(), Outgoing::Disconnect);
        let publish = recv_publish(&mut watcher_rx);
        assert_eq!(publish.topic, "w");
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let mut router = test_router();
        let (mut sub_rx, _) = connect(&mut router, "sub", true, None, 1).await;
        subscribe(&mut router, "sub", 1, &[("t", QoS::AtMostOnce)]).await;
        assert_matches!(recv_data(&mut sub_rx), Packet::SubAck(_));

        let (_pub_rx, _) = connect(&mut router, "pub", true, None, 2).await;
        send_packets(
            &mut router,
            "pub",
            vec![Packet::Publish(publish_packet("t", QoS::AtMostOnce, 0, b"x", false))],
        )
        .await;
        let _ = recv_publish(&mut sub_rx);

        send_packets(
            &mut router,
            "sub",
            vec![Packet::Unsubscribe(Unsubscribe {
                packet_id: 2,
                filters: vec!["t".into()],
            })],
        )
        .await;
        assert_matches!(recv_data(&mut sub_rx), Packet::UnsubAck(_));

        send_packets(
            &mut router,
            "pub",
            vec![Packet::Publish(publish_packet("t", QoS::AtMostOnce, 0, b"y", false))],
        )
        .await;
        assert!(sub_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn invalid_filter_gets_failure_code_and_connection_survives() {
        let mut router = test_router();
        let (mut sub_rx, _) = connect(&mut router, "sub", true, None, 1).await;
        subscribe(
            &mut router,
            "sub",
            1,
            &[("a/b#", QoS::AtMostOnce), ("t", QoS::AtLeastOnce)],
        )
        .await;

        match recv_data(&mut sub_rx) {
            Packet::SubAck(suback) => {
                assert_eq!(
                    suback.return_codes,
                    vec![
                        SubscribeReasonCode::Failure,
                        SubscribeReasonCode::Success(QoS::AtLeastOnce)
                    ]
                );
            }
            p => panic!("unexpected packet: {:?}", p),
        }

        // 连接没有被断开，有效的那条订阅工作正常
        let (_pub_rx, _) = connect(&mut router, "pub", true, None, 2).await;
        send_packets(
            &mut router,
            "pub",
            vec![Packet::Publish(publish_packet("t", QoS::AtMostOnce, 0, b"x", false))],
        )
        .await;
        let publish = recv_publish(&mut sub_rx);
        assert_eq!(publish.payload, Bytes::from_static(b"x"));
    }

    #[tokio::test]
    async fn retained_will_stored_for_later_subscribers() {
        let mut router = test_router();
        let will = LastWill {
            topic: "w".into(),
            message: Bytes::from_static(b"gone"),
            qos: QoS::AtLeastOnce,
            retain: true,
        };
        let (_doomed_rx, _) = connect(&mut router, "doomed", true, Some(will), 1).await;
        router
            .handle_incoming(Incoming::Disconnect {
                client_id: "doomed".into(),
                conn_id: 1,
            })
            .await;

        // 遗嘱已存为保留消息，之后的订阅者也能收到
        let (mut late_rx, _) = connect(&mut router, "late", true, None, 2).await;
        subscribe(&mut router, "late", 1, &[("w", QoS::ExactlyOnce)]).await;
        let publish = recv_publish(&mut late_rx);
        assert!(publish.retain);
        assert_eq!(publish.qos, QoS::AtLeastOnce);
        assert_eq!(publish.payload, Bytes::from_static(b"gone"));
    }
}
