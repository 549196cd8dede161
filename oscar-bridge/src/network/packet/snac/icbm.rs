//! 0x0004 消息 family
//! 通道 1 是普通即时消息，通道 2 是 rendezvous

use bytes::{BufMut, Bytes, BytesMut};

use crate::network::packet::{
    read_array, read_bytes, read_screen_name, read_u16, read_u8,
    tlv::{Tlv, TlvChain},
    write_screen_name, Error,
};

use super::buddy::UserInfo;

pub const SEND_ICBM: u16 = 0x0006;
pub const RECV_ICBM: u16 = 0x0007;

const CHANNEL_IM: u16 = 0x0001;
const CHANNEL_RV: u16 = 0x0002;

const TLV_MESSAGE: u16 = 0x0002;
const TLV_ACK_REQUEST: u16 = 0x0003;
const TLV_RENDEZVOUS: u16 = 0x0005;

/// 消息块中的片段类型
const FRAGMENT_CAPABILITIES: u8 = 0x05;
const FRAGMENT_TEXT: u8 = 0x01;

pub const CHARSET_ASCII: u16 = 0x0000;
pub const CHARSET_UCS2: u16 = 0x0002;
pub const CHARSET_LATIN1: u16 = 0x0003;

/// 每条消息的 8 字节 cookie
pub type IcbmCookie = [u8; 8];

/// 即时消息正文
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstantMessage {
    pub charset: u16,
    pub charsubset: u16,
    pub data: Bytes,
}

impl InstantMessage {
    pub fn utf8(text: &str) -> Self {
        Self {
            charset: CHARSET_ASCII,
            charsubset: 0,
            data: Bytes::copy_from_slice(text.as_bytes()),
        }
    }

    /// 按字符集解码，非法字符替换为 U+FFFD
    pub fn text(&self) -> String {
        match self.charset {
            CHARSET_UCS2 => {
                let units = self
                    .data
                    .chunks_exact(2)
                    .map(|pair| u16::from_be_bytes([pair[0], pair[1]]));
                char::decode_utf16(units)
                    .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
                    .collect()
            }
            CHARSET_LATIN1 => self.data.iter().map(|&b| b as char).collect(),
            // 老客户端声明 ASCII，实际发送的多是 UTF-8
            _ => String::from_utf8_lossy(&self.data).into_owned(),
        }
    }

    fn read(mut stream: Bytes) -> Result<Self, Error> {
        while !stream.is_empty() {
            let id = read_u8(&mut stream)?;
            let _version = read_u8(&mut stream)?;
            let len = read_u16(&mut stream)? as usize;
            let mut fragment = read_bytes(&mut stream, len)?;
            if id == FRAGMENT_TEXT {
                let charset = read_u16(&mut fragment)?;
                let charsubset = read_u16(&mut fragment)?;
                return Ok(InstantMessage {
                    charset,
                    charsubset,
                    data: fragment,
                });
            }
        }
        Err(Error::MalformedPacket)
    }

    fn write(&self, stream: &mut BytesMut) {
        // 能力片段：只声明文本
        stream.put_u8(FRAGMENT_CAPABILITIES);
        stream.put_u8(0x01);
        stream.put_u16(1);
        stream.put_u8(0x01);

        stream.put_u8(FRAGMENT_TEXT);
        stream.put_u8(0x01);
        stream.put_u16((self.data.len() + 4) as u16);
        stream.put_u16(self.charset);
        stream.put_u16(self.charsubset);
        stream.extend_from_slice(&self.data);
    }
}

/// rendezvous 数据块
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RvData {
    /// 0 请求, 1 取消, 2 接受
    pub status: u16,
    pub cookie: IcbmCookie,
    /// 能力 GUID
    pub capability: [u8; 16],
    /// 子协议自己的 tlv，对本连接不透明
    pub payload: Bytes,
}

impl RvData {
    pub const STATUS_REQUEST: u16 = 0;
    pub const STATUS_CANCEL: u16 = 1;
    pub const STATUS_ACCEPT: u16 = 2;

    fn read(mut stream: Bytes) -> Result<Self, Error> {
        let status = read_u16(&mut stream)?;
        let cookie = read_array(&mut stream)?;
        let capability = read_array(&mut stream)?;
        Ok(RvData {
            status,
            cookie,
            capability,
            payload: stream,
        })
    }

    fn to_bytes(&self) -> Bytes {
        let mut stream = BytesMut::with_capacity(26 + self.payload.len());
        stream.put_u16(self.status);
        stream.extend_from_slice(&self.cookie);
        stream.extend_from_slice(&self.capability);
        stream.extend_from_slice(&self.payload);
        stream.freeze()
    }
}

/// 收到的通道 1 即时消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecvImIcbm {
    pub cookie: IcbmCookie,
    pub sender: UserInfo,
    pub message: InstantMessage,
}

impl RecvImIcbm {
    pub(crate) fn write(&self, stream: &mut BytesMut) {
        stream.extend_from_slice(&self.cookie);
        stream.put_u16(CHANNEL_IM);
        self.sender.write(stream);
        let mut message = BytesMut::new();
        self.message.write(&mut message);
        Tlv::new(TLV_MESSAGE, message.freeze()).write(stream);
    }
}

/// 收到的通道 2 rendezvous 消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecvRvIcbm {
    pub cookie: IcbmCookie,
    pub sender: UserInfo,
    pub rv: RvData,
}

impl RecvRvIcbm {
    pub(crate) fn write(&self, stream: &mut BytesMut) {
        stream.extend_from_slice(&self.cookie);
        stream.put_u16(CHANNEL_RV);
        self.sender.write(stream);
        Tlv::new(TLV_RENDEZVOUS, self.rv.to_bytes()).write(stream);
    }
}

/// 按通道区分的收到的 icbm
pub(crate) enum RecvIcbm {
    Im(RecvImIcbm),
    Rv(RecvRvIcbm),
    Other(u16),
}

impl RecvIcbm {
    pub(crate) fn read(mut stream: Bytes) -> Result<Self, Error> {
        let cookie = read_array(&mut stream)?;
        let channel = read_u16(&mut stream)?;
        if channel != CHANNEL_IM && channel != CHANNEL_RV {
            return Ok(RecvIcbm::Other(channel));
        }
        let sender = UserInfo::read(&mut stream)?;
        let tlvs = TlvChain::read_all(&mut stream)?;

        if channel == CHANNEL_IM {
            let data = tlvs.get(TLV_MESSAGE).ok_or(Error::MalformedPacket)?;
            Ok(RecvIcbm::Im(RecvImIcbm {
                cookie,
                sender,
                message: InstantMessage::read(data.value.clone())?,
            }))
        } else {
            let data = tlvs.get(TLV_RENDEZVOUS).ok_or(Error::MalformedPacket)?;
            Ok(RecvIcbm::Rv(RecvRvIcbm {
                cookie,
                sender,
                rv: RvData::read(data.value.clone())?,
            }))
        }
    }
}

/// 在 rendezvous 会话上发送的通道 2 消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRvIcbm {
    pub cookie: IcbmCookie,
    pub screen_name: String,
    pub rv: RvData,
}

impl SendRvIcbm {
    /// 非通道 2 的发送消息不在本连接处理范围内，返回 None
    pub(crate) fn read(mut stream: Bytes) -> Result<Option<Self>, Error> {
        let cookie = read_array(&mut stream)?;
        if read_u16(&mut stream)? != CHANNEL_RV {
            return Ok(None);
        }
        let screen_name = read_screen_name(&mut stream)?;
        let tlvs = TlvChain::read_all(&mut stream)?;
        let data = tlvs.get(TLV_RENDEZVOUS).ok_or(Error::MalformedPacket)?;
        Ok(Some(SendRvIcbm {
            cookie,
            screen_name,
            rv: RvData::read(data.value.clone())?,
        }))
    }

    pub(crate) fn write(&self, stream: &mut BytesMut) {
        stream.extend_from_slice(&self.cookie);
        stream.put_u16(CHANNEL_RV);
        write_screen_name(stream, &self.screen_name);
        Tlv::new(TLV_RENDEZVOUS, self.rv.to_bytes()).write(stream);
        Tlv::new(TLV_ACK_REQUEST, Bytes::new()).write(stream);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recv_im_parsing_works() {
        let im = RecvImIcbm {
            cookie: [1, 2, 3, 4, 5, 6, 7, 8],
            sender: UserInfo::new("carol"),
            message: InstantMessage::utf8("<b>hey</b>"),
        };
        let mut stream = BytesMut::new();
        im.write(&mut stream);

        match RecvIcbm::read(stream.freeze()).unwrap() {
            RecvIcbm::Im(parsed) => {
                assert_eq!(parsed, im);
                assert_eq!(parsed.message.text(), "<b>hey</b>");
            }
            _ => panic!("expected channel 1 message"),
        }
    }

    #[test]
    fn ucs2_and_latin1_text() {
        let ucs2 = InstantMessage {
            charset: CHARSET_UCS2,
            charsubset: 0,
            data: Bytes::from_static(&[0x00, b'h', 0x00, 0xe9]),
        };
        assert_eq!(ucs2.text(), "hé");

        let latin1 = InstantMessage {
            charset: CHARSET_LATIN1,
            charsubset: 0,
            data: Bytes::from_static(&[0xe7, b'a']),
        };
        assert_eq!(latin1.text(), "ça");
    }

    #[test]
    fn unknown_channel_is_skipped() {
        let mut stream = BytesMut::new();
        stream.extend_from_slice(&[0; 8]);
        stream.put_u16(0x0004);
        assert!(matches!(
            RecvIcbm::read(stream.freeze()).unwrap(),
            RecvIcbm::Other(4)
        ));
    }

    #[test]
    fn send_rv_reads_back() {
        let send = SendRvIcbm {
            cookie: [9; 8],
            screen_name: "dave".into(),
            rv: RvData {
                status: RvData::STATUS_ACCEPT,
                cookie: [9; 8],
                capability: [0x09; 16],
                payload: Bytes::from_static(&[0x00, 0x0a, 0x00, 0x02, 0x00, 0x01]),
            },
        };
        let mut stream = BytesMut::new();
        send.write(&mut stream);
        assert_eq!(SendRvIcbm::read(stream.freeze()).unwrap(), Some(send));
    }
}
