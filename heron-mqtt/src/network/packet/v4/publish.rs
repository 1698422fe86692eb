use bytes::{BufMut, Bytes, BytesMut};

use crate::network::{
    packet::{self, Error, FixedHeader, QoS},
    topic,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    /// 是否为重新投递的消息
    pub dup: bool,
    /// 服务质量
    pub qos: QoS,
    /// 消息保留
    pub retain: bool,
    /// 主题
    pub topic: String,
    /// 包 id，QoS0 固定为 0
    pub packet_id: u16,
    /// 消息负载
    pub payload: Bytes,
}

impl Publish {
    pub fn read(fixed_header: FixedHeader, mut stream: Bytes) -> Result<Self, Error> {
        let byte1 = fixed_header.byte1;
        let qos = QoS::try_from((byte1 & 0b0110) >> 1)?;
        let dup = (byte1 & 0b1000) != 0;
        let retain = (byte1 & 0b0001) != 0;

        let topic = packet::read_string(&mut stream)?;
        // publish 的主题不允许通配符
        if !topic::valid_publish_topic(&topic) {
            return Err(Error::InvalidPublishTopic);
        }

        let packet_id = match qos {
            QoS::AtMostOnce => 0,
            _ => packet::read_u16(&mut stream)?,
        };

        Ok(Publish {
            dup,
            qos,
            retain,
            topic,
            packet_id,
            payload: stream,
        })
    }

    fn len(&self) -> usize {
        let mut len = 2 + self.topic.len() + self.payload.len();
        if self.qos != QoS::AtMostOnce {
            // packet id
            len += 2;
        }
        len
    }

    pub fn write(&self, stream: &mut BytesMut) -> Result<(), Error> {
        let mut byte1 = 0x30 | ((self.qos as u8) << 1);
        if self.dup {
            byte1 |= 0b1000;
        }
        if self.retain {
            byte1 |= 0b0001;
        }
        stream.put_u8(byte1);
        packet::write_remaining_length(stream, self.len())?;
        packet::write_string(stream, &self.topic);
        if self.qos != QoS::AtMostOnce {
            stream.put_u16(self.packet_id);
        }
        stream.extend_from_slice(&self.payload);
        Ok(())
    }
}
