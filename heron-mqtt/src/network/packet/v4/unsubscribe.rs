use bytes::{Buf, Bytes};

use crate::network::packet::{self, Error};

#[derive(Debug)]
pub struct Unsubscribe {
    /// 包 id
    pub packet_id: u16,
    /// 取消订阅的主题
    pub filters: Vec<String>,
}

impl Unsubscribe {
    pub fn read(mut stream: Bytes) -> Result<Self, Error> {
        let packet_id = packet::read_u16(&mut stream)?;
        let mut filters = Vec::with_capacity(1);

        while stream.has_remaining() {
            filters.push(packet::read_string(&mut stream)?);
        }

        Ok(Self { packet_id, filters })
    }
}
