use bytes::BytesMut;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time,
};

use crate::network::packet::{
    self,
    v4::{ConnAck, Connect, Packet},
    PacketType,
};

use super::Error;

/// 设备与服务器之间的连接
/// 单纯的 tcp 读写管理，以 packet 为单位读写
pub(crate) struct ClientConnection {
    /// tcp 连接
    stream: TcpStream,
    /// 读缓冲区
    /// 使用缓冲区而非按照字节从 socket 读取数据
    read: BytesMut,
    /// 写缓冲区
    /// 先写入缓冲区再刷入 socket 而非按字节向 socket 写入数据
    write: BytesMut,
}

impl ClientConnection {
    pub(crate) fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            read: BytesMut::new(),
            write: BytesMut::new(),
        }
    }

    /// 读取一个完整 packet，数据不足时继续等待 socket
    async fn read_packet(&mut self) -> Result<Packet, Error> {
        loop {
            let required = match Packet::read(&mut self.read) {
                Ok(packet) => return Ok(packet),
                Err(packet::Error::InsufficientBytes(n)) => n,
                Err(e) => return Err(Error::Packet(e)),
            };

            self.read_bytes(required).await?;
        }
    }

    pub(crate) async fn read_connect(&mut self) -> Result<Connect, Error> {
        let packet = self.read_packet().await?;

        match packet {
            Packet::Connect(connect) => Ok(connect),
            _ => Err(Error::FirstPacketNotConnect),
        }
    }

    pub(crate) async fn write_connack(&mut self, connack: ConnAck) -> Result<(), Error> {
        connack.write(&mut self.write)?;
        self.flush().await
    }

    pub(crate) async fn write_packet(&mut self, packet: Packet) -> Result<(), Error> {
        packet.write(&mut self.write)?;
        self.flush().await
    }

    /// 在 keepalive 期限内等到至少一个完整报文，并把缓冲区内
    /// 已经完整的报文一并取出；超时直接返回错误
    ///
    /// pingreq 在本层直接回复，不上抛
    pub(crate) async fn read_more(
        &mut self,
        keepalive: Option<time::Duration>,
    ) -> Result<Vec<Packet>, Error> {
        let first = match keepalive {
            Some(limit) => time::timeout(limit, self.read_packet()).await??,
            None => self.read_packet().await?,
        };

        let mut packets = Vec::new();
        self.collect(first, &mut packets).await?;
        loop {
            match Packet::read(&mut self.read) {
                Ok(packet) => self.collect(packet, &mut packets).await?,
                Err(packet::Error::InsufficientBytes(_)) => return Ok(packets),
                Err(e) => return Err(Error::Packet(e)),
            }
        }
    }

    async fn collect(&mut self, packet: Packet, packets: &mut Vec<Packet>) -> Result<(), Error> {
        match packet.packet_type() {
            PacketType::PingReq => self.write_packet(Packet::PingResp).await,
            _ => {
                packets.push(packet);
                Ok(())
            }
        }
    }

    /// 等待从 socket 读出至少所需长度的数据，放入缓冲区
    async fn read_bytes(&mut self, required: usize) -> Result<(), Error> {
        let mut total_read = 0;
        loop {
            let read = self.stream.read_buf(&mut self.read).await?;
            if 0 == read {
                return Err(Error::ConnectionAborted);
            }

            total_read += read;
            if total_read >= required {
                return Ok(());
            }
        }
    }

    /// 协议层处理完一个或多个请求后，主动调用此方法
    async fn flush(&mut self) -> Result<(), Error> {
        if self.write.is_empty() {
            return Ok(());
        }

        self.stream.write_all(&self.write).await?;
        self.write.clear();
        Ok(())
    }
}
