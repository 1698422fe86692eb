use bytes::{BufMut, BytesMut};

use crate::network::packet::{self, Error};

/// 连接返回码
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectReturnCode {
    /// 成功
    Accepted = 0,
    /// 服务器不支持客户端请求的协议版本
    UnacceptableProtocolVersion,
    /// 客户端 id 不合法或已被占用
    IdentifierRejected,
    /// 服务器不可用
    ServerUnavailable,
    /// 错误的用户名或密码
    BadUserNamePassword,
    /// 未授权
    NotAuthorized,
}

#[derive(Debug)]
pub struct ConnAck {
    /// broker 上是否已存在该客户端的持久会话
    pub session_present: bool,
    /// 连接返回码
    pub code: ConnectReturnCode,
}

impl ConnAck {
    pub fn new(code: ConnectReturnCode, session_present: bool) -> Self {
        ConnAck {
            session_present,
            code,
        }
    }

    /// 报文长度
    fn len(&self) -> usize {
        // session present + code
        1 + 1
    }

    pub fn write(&self, stream: &mut BytesMut) -> Result<(), Error> {
        stream.put_u8(0x20);
        packet::write_remaining_length(stream, self.len())?;
        stream.put_u8(self.session_present as u8);
        stream.put_u8(self.code as u8);

        Ok(())
    }
}
