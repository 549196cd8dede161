//! FLAP 帧编解码
//! 只实现本连接用到的帧和 SNAC 命令，其余 SNAC 以原始字节形式向上传递

use bytes::{Buf, BufMut, Bytes, BytesMut};

pub use login::LoginFlap;
pub use snac::{Snac, SnacCommand};

pub mod login;
pub mod snac;
pub mod tlv;

/// 每个 FLAP 帧的起始字节
const FLAP_MARKER: u8 = 0x2a;
/// 帧头长度：marker(1) + channel(1) + seq(2) + len(2)
const FLAP_HEADER_LEN: usize = 6;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid flap marker: {0:#04x}")]
    InvalidMarker(u8),
    #[error("At least {0} more bytes required")]
    InsufficientBytes(usize),
    #[error("Malformed packet")]
    MalformedPacket,
    #[error("Malformed string")]
    MalformedString,
    #[error("Payload too large")]
    PayloadTooLarge,
}

/// FLAP 通道
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// 登录/握手
    Login,
    /// 承载 SNAC
    Snac,
    /// 帧级错误
    Error,
    /// 断开连接
    Disconnect,
    /// 心跳
    KeepAlive,
    Other(u8),
}

impl From<u8> for Channel {
    fn from(value: u8) -> Self {
        match value {
            1 => Channel::Login,
            2 => Channel::Snac,
            3 => Channel::Error,
            4 => Channel::Disconnect,
            5 => Channel::KeepAlive,
            other => Channel::Other(other),
        }
    }
}

impl From<Channel> for u8 {
    fn from(channel: Channel) -> Self {
        match channel {
            Channel::Login => 1,
            Channel::Snac => 2,
            Channel::Error => 3,
            Channel::Disconnect => 4,
            Channel::KeepAlive => 5,
            Channel::Other(other) => other,
        }
    }
}

/// 一个完整的 FLAP 帧，创建后不可变
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlapPacket {
    pub channel: Channel,
    /// 帧序号，由发送方按连接递增
    pub seq: u16,
    pub payload: Bytes,
}

impl FlapPacket {
    pub fn new(channel: Channel, seq: u16, payload: Bytes) -> Self {
        Self {
            channel,
            seq,
            payload,
        }
    }

    /// 从缓冲区读取一个完整的帧
    /// 数据不足时返回 InsufficientBytes，缓冲区保持不变
    pub fn read(stream: &mut BytesMut) -> Result<Self, Error> {
        let stream_len = stream.len();
        if stream_len < FLAP_HEADER_LEN {
            return Err(Error::InsufficientBytes(FLAP_HEADER_LEN - stream_len));
        }
        if stream[0] != FLAP_MARKER {
            return Err(Error::InvalidMarker(stream[0]));
        }

        let payload_len = u16::from_be_bytes([stream[4], stream[5]]) as usize;
        let packet_len = FLAP_HEADER_LEN + payload_len;
        if stream_len < packet_len {
            return Err(Error::InsufficientBytes(packet_len - stream_len));
        }

        // split_to 方法会更新 stream
        let mut packet = stream.split_to(packet_len).freeze();
        packet.advance(1);
        let channel = Channel::from(packet.get_u8());
        let seq = packet.get_u16();
        packet.advance(2);

        Ok(FlapPacket {
            channel,
            seq,
            payload: packet,
        })
    }

    pub fn write(&self, stream: &mut BytesMut) -> Result<(), Error> {
        if self.payload.len() > u16::MAX as usize {
            return Err(Error::PayloadTooLarge);
        }

        stream.reserve(FLAP_HEADER_LEN + self.payload.len());
        stream.put_u8(FLAP_MARKER);
        stream.put_u8(self.channel.into());
        stream.put_u16(self.seq);
        stream.put_u16(self.payload.len() as u16);
        stream.extend_from_slice(&self.payload);
        Ok(())
    }
}

fn read_u8(stream: &mut Bytes) -> Result<u8, Error> {
    if stream.is_empty() {
        return Err(Error::MalformedPacket);
    }
    Ok(stream.get_u8())
}

fn read_u16(stream: &mut Bytes) -> Result<u16, Error> {
    if stream.len() < 2 {
        return Err(Error::MalformedPacket);
    }
    Ok(stream.get_u16())
}

fn read_u32(stream: &mut Bytes) -> Result<u32, Error> {
    if stream.len() < 4 {
        return Err(Error::MalformedPacket);
    }
    Ok(stream.get_u32())
}

/// 读取定长字节
fn read_bytes(stream: &mut Bytes, len: usize) -> Result<Bytes, Error> {
    if len > stream.len() {
        return Err(Error::MalformedPacket);
    }
    Ok(stream.split_to(len))
}

fn read_array<const N: usize>(stream: &mut Bytes) -> Result<[u8; N], Error> {
    let bytes = read_bytes(stream, N)?;
    let mut array = [0; N];
    array.copy_from_slice(&bytes);
    Ok(array)
}

/// 屏幕名：1 字节长度 + ASCII
fn read_screen_name(stream: &mut Bytes) -> Result<String, Error> {
    let len = read_u8(stream)? as usize;
    let bytes = read_bytes(stream, len)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| Error::MalformedString)
}

fn write_screen_name(stream: &mut BytesMut, screen_name: &str) {
    let bytes = screen_name.as_bytes();
    let len = bytes.len().min(u8::MAX as usize);
    stream.put_u8(len as u8);
    stream.extend_from_slice(&bytes[..len]);
}
