//! 0x0003 好友 family

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::network::packet::{
    read_bytes, read_screen_name, read_u16, read_u8,
    tlv::{Tlv, TlvChain},
    write_screen_name, Error,
};

pub const BUDDY_STATUS: u16 = 0x000b;
pub const BUDDY_OFFLINE: u16 = 0x000c;

/// 用户类别标志
const TLV_USER_CLASS: u16 = 0x0001;
/// 扩展信息块列表
const TLV_EXTRA_INFO: u16 = 0x001d;
/// 用户类别中的离开标志位
const USER_CLASS_AWAY: u32 = 0x0020;

/// 扩展信息块
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtraInfoBlock {
    pub kind: u16,
    pub flags: u8,
    pub data: Bytes,
}

impl ExtraInfoBlock {
    /// 文字状态
    pub const TYPE_AVAIL_MESSAGE: u16 = 0x0002;

    /// 构造一个文字状态块：2 字节长度 + 文本
    pub fn avail_message(text: &[u8]) -> Self {
        let mut data = BytesMut::with_capacity(text.len() + 2);
        data.put_u16(text.len() as u16);
        data.extend_from_slice(text);
        Self {
            kind: Self::TYPE_AVAIL_MESSAGE,
            flags: 0,
            data: data.freeze(),
        }
    }

    /// 解出文字状态
    /// 长度前缀超出数据时按实际数据截断
    pub fn avail_text(&self) -> Result<String, Error> {
        let mut data = self.data.clone();
        let len = read_u16(&mut data)? as usize;
        let text = data.split_to(len.min(data.len()));
        String::from_utf8(text.to_vec()).map_err(|_| Error::MalformedString)
    }

    fn read_all(mut stream: Bytes) -> Result<Vec<Self>, Error> {
        let mut blocks = Vec::new();
        while !stream.is_empty() {
            let kind = read_u16(&mut stream)?;
            let flags = read_u8(&mut stream)?;
            let len = read_u8(&mut stream)? as usize;
            let data = read_bytes(&mut stream, len)?;
            blocks.push(ExtraInfoBlock { kind, flags, data });
        }
        Ok(blocks)
    }

    fn write(&self, stream: &mut BytesMut) {
        let len = self.data.len().min(u8::MAX as usize);
        stream.put_u16(self.kind);
        stream.put_u8(self.flags);
        stream.put_u8(len as u8);
        stream.extend_from_slice(&self.data[..len]);
    }
}

/// 用户信息块
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserInfo {
    /// 屏幕名，保持服务端给出的大小写和空格
    pub screen_name: String,
    /// 警告等级，单位 0.1%
    pub warning_level: u16,
    pub user_class: Option<u32>,
    pub extra_info: Vec<ExtraInfoBlock>,
}

impl UserInfo {
    pub fn new(screen_name: &str) -> Self {
        Self {
            screen_name: screen_name.into(),
            ..Default::default()
        }
    }

    /// 是否处于离开状态
    pub fn away(&self) -> bool {
        self.user_class
            .map(|class| class & USER_CLASS_AWAY != 0)
            .unwrap_or(false)
    }

    pub fn set_away(&mut self, away: bool) {
        let class = self.user_class.unwrap_or(0);
        self.user_class = Some(if away {
            class | USER_CLASS_AWAY
        } else {
            class & !USER_CLASS_AWAY
        });
    }

    pub(crate) fn read(stream: &mut Bytes) -> Result<Self, Error> {
        let screen_name = read_screen_name(stream)?;
        let warning_level = read_u16(stream)?;
        let tlv_count = read_u16(stream)? as usize;
        let tlvs = TlvChain::read_count(stream, tlv_count)?;

        let user_class = match tlvs.get(TLV_USER_CLASS) {
            Some(tlv) if tlv.value.len() >= 4 => Some(tlv.value.clone().get_u32()),
            Some(tlv) if tlv.value.len() >= 2 => Some(tlv.value.clone().get_u16() as u32),
            _ => None,
        };
        let extra_info = match tlvs.get(TLV_EXTRA_INFO) {
            Some(tlv) => ExtraInfoBlock::read_all(tlv.value.clone())?,
            None => Vec::new(),
        };

        Ok(UserInfo {
            screen_name,
            warning_level,
            user_class,
            extra_info,
        })
    }

    pub(crate) fn write(&self, stream: &mut BytesMut) {
        write_screen_name(stream, &self.screen_name);
        stream.put_u16(self.warning_level);

        let mut tlvs = TlvChain::default();
        if let Some(class) = self.user_class {
            let mut value = BytesMut::with_capacity(4);
            // 能放进两个字节时按两个字节写
            match u16::try_from(class) {
                Ok(class) => value.put_u16(class),
                Err(_) => value.put_u32(class),
            }
            tlvs.push(Tlv::new(TLV_USER_CLASS, value.freeze()));
        }
        if !self.extra_info.is_empty() {
            let mut value = BytesMut::new();
            for block in &self.extra_info {
                block.write(&mut value);
            }
            tlvs.push(Tlv::new(TLV_EXTRA_INFO, value.freeze()));
        }
        stream.put_u16(tlvs.len() as u16);
        tlvs.write(stream);
    }
}

/// 好友上线或状态变化
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuddyStatus {
    pub info: UserInfo,
}

impl BuddyStatus {
    pub(crate) fn read(mut stream: Bytes) -> Result<Self, Error> {
        Ok(BuddyStatus {
            info: UserInfo::read(&mut stream)?,
        })
    }

    pub(crate) fn write(&self, stream: &mut BytesMut) {
        self.info.write(stream)
    }
}

/// 好友下线
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuddyOffline {
    pub info: UserInfo,
}

impl BuddyOffline {
    pub fn new(screen_name: &str) -> Self {
        Self {
            info: UserInfo::new(screen_name),
        }
    }

    pub fn screen_name(&self) -> &str {
        &self.info.screen_name
    }

    pub(crate) fn read(mut stream: Bytes) -> Result<Self, Error> {
        Ok(BuddyOffline {
            info: UserInfo::read(&mut stream)?,
        })
    }

    pub(crate) fn write(&self, stream: &mut BytesMut) {
        self.info.write(stream)
    }
}
