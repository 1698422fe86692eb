use bytes::{Buf, Bytes};

use crate::network::packet::{self, Error, QoS};

#[derive(Debug)]
pub struct Subscribe {
    /// 包 id
    pub packet_id: u16,
    /// 订阅的主题过滤器
    pub filters: Vec<SubscribeFilter>,
}

impl Subscribe {
    /// 通配符的位置校验不在这里做：位置错误的 filter 需要以
    /// suback 失败码回应，而不是断开连接
    pub fn read(mut stream: Bytes) -> Result<Self, Error> {
        let packet_id = packet::read_u16(&mut stream)?;

        let mut filters = Vec::new();
        while stream.has_remaining() {
            let path = packet::read_string(&mut stream)?;
            let options = packet::read_u8(&mut stream)?;
            let qos = QoS::try_from(options & 0b0000_0011)?;

            filters.push(SubscribeFilter { path, qos })
        }

        Ok(Self { packet_id, filters })
    }
}

#[derive(Debug)]
pub struct SubscribeFilter {
    pub path: String,
    pub qos: QoS,
}
