//! 0x0001 连接管理 family

use bytes::{BufMut, Bytes, BytesMut};

use crate::network::packet::{read_u16, read_u32, read_u8, Error};

use super::buddy::UserInfo;

pub const CLIENT_READY: u16 = 0x0002;
pub const SERVER_READY: u16 = 0x0003;
pub const RATE_INFO_REQUEST: u16 = 0x0006;
pub const RATE_INFO: u16 = 0x0007;
pub const RATE_ACK: u16 = 0x0008;
pub const RATE_CHANGE: u16 = 0x000a;
pub const WARNING: u16 = 0x0010;
pub const CLIENT_VERSIONS: u16 = 0x0017;

/// 客户端标识，随 ClientReady 一起发送
const TOOL_ID: u16 = 0x0110;
const TOOL_VERSION: u16 = 0x0629;

/// 单个 family 的版本信息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FamilyVersion {
    pub family: u16,
    pub version: u16,
    pub tool_id: u16,
    pub tool_version: u16,
}

impl FamilyVersion {
    /// 客户端对每个 family 默认声明的版本
    pub fn default_for(family: u16) -> Self {
        let version = match family {
            0x0001 | 0x0013 => 4,
            _ => 1,
        };
        Self {
            family,
            version,
            tool_id: TOOL_ID,
            tool_version: TOOL_VERSION,
        }
    }
}

/// 服务端准备就绪，携带服务端在这条连接上支持的 family 列表
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerReady {
    pub families: Vec<u16>,
}

impl ServerReady {
    pub(crate) fn read(mut stream: Bytes) -> Result<Self, Error> {
        let mut families = Vec::with_capacity(stream.len() / 2);
        while !stream.is_empty() {
            families.push(read_u16(&mut stream)?);
        }
        Ok(ServerReady { families })
    }

    pub(crate) fn write(&self, stream: &mut BytesMut) {
        for family in &self.families {
            stream.put_u16(*family);
        }
    }
}

/// 客户端声明的 family 版本
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientVersions {
    pub families: Vec<FamilyVersion>,
}

impl ClientVersions {
    pub(crate) fn read(mut stream: Bytes) -> Result<Self, Error> {
        let mut families = Vec::new();
        while !stream.is_empty() {
            let family = read_u16(&mut stream)?;
            let version = read_u16(&mut stream)?;
            families.push(FamilyVersion {
                family,
                version,
                tool_id: TOOL_ID,
                tool_version: TOOL_VERSION,
            });
        }
        Ok(ClientVersions { families })
    }

    pub(crate) fn write(&self, stream: &mut BytesMut) {
        for info in &self.families {
            stream.put_u16(info.family);
            stream.put_u16(info.version);
        }
    }
}

/// 客户端就绪，服务端收到后开始正常服务
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientReady {
    pub families: Vec<FamilyVersion>,
}

impl ClientReady {
    pub(crate) fn read(mut stream: Bytes) -> Result<Self, Error> {
        let mut families = Vec::new();
        while !stream.is_empty() {
            families.push(FamilyVersion {
                family: read_u16(&mut stream)?,
                version: read_u16(&mut stream)?,
                tool_id: read_u16(&mut stream)?,
                tool_version: read_u16(&mut stream)?,
            });
        }
        Ok(ClientReady { families })
    }

    pub(crate) fn write(&self, stream: &mut BytesMut) {
        for info in &self.families {
            stream.put_u16(info.family);
            stream.put_u16(info.version);
            stream.put_u16(info.tool_id);
            stream.put_u16(info.tool_version);
        }
    }
}

/// 限速类别参数
/// 所有 level 和平均值的单位都是毫秒
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateClassInfo {
    pub class_id: u16,
    pub window_size: u32,
    pub clear_level: u32,
    pub alert_level: u32,
    pub limit_level: u32,
    pub disconnect_level: u32,
    pub current_avg: u32,
    pub max_avg: u32,
    /// 距离本类别上一次发送过去的时间
    pub last_ms: u32,
    /// 属于此类别的命令 (family, subtype)
    pub commands: Vec<(u16, u16)>,
}

impl RateClassInfo {
    fn read(stream: &mut Bytes) -> Result<Self, Error> {
        let info = RateClassInfo {
            class_id: read_u16(stream)?,
            window_size: read_u32(stream)?,
            clear_level: read_u32(stream)?,
            alert_level: read_u32(stream)?,
            limit_level: read_u32(stream)?,
            disconnect_level: read_u32(stream)?,
            current_avg: read_u32(stream)?,
            max_avg: read_u32(stream)?,
            last_ms: read_u32(stream)?,
            commands: Vec::new(),
        };
        // 当前状态，由本地计算，不使用服务端的值
        read_u8(stream)?;
        Ok(info)
    }

    fn write(&self, stream: &mut BytesMut) {
        stream.put_u16(self.class_id);
        stream.put_u32(self.window_size);
        stream.put_u32(self.clear_level);
        stream.put_u32(self.alert_level);
        stream.put_u32(self.limit_level);
        stream.put_u32(self.disconnect_level);
        stream.put_u32(self.current_avg);
        stream.put_u32(self.max_avg);
        stream.put_u32(self.last_ms);
        stream.put_u8(0);
    }
}

/// 服务端下发的限速参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateInfo {
    pub classes: Vec<RateClassInfo>,
}

impl RateInfo {
    pub(crate) fn read(mut stream: Bytes) -> Result<Self, Error> {
        let count = read_u16(&mut stream)? as usize;
        let mut classes = Vec::with_capacity(count);
        for _ in 0..count {
            classes.push(RateClassInfo::read(&mut stream)?);
        }

        // 每个类别包含的命令，部分服务端不发送
        while !stream.is_empty() {
            let class_id = read_u16(&mut stream)?;
            let member_count = read_u16(&mut stream)? as usize;
            let mut members = Vec::with_capacity(member_count);
            for _ in 0..member_count {
                let family = read_u16(&mut stream)?;
                let subtype = read_u16(&mut stream)?;
                members.push((family, subtype));
            }
            match classes.iter_mut().find(|c| c.class_id == class_id) {
                Some(class) => class.commands.extend(members),
                None => return Err(Error::MalformedPacket),
            }
        }

        Ok(RateInfo { classes })
    }

    pub(crate) fn write(&self, stream: &mut BytesMut) {
        stream.put_u16(self.classes.len() as u16);
        for class in &self.classes {
            class.write(stream);
        }
        for class in &self.classes {
            stream.put_u16(class.class_id);
            stream.put_u16(class.commands.len() as u16);
            for (family, subtype) in &class.commands {
                stream.put_u16(*family);
                stream.put_u16(*subtype);
            }
        }
    }
}

/// 确认收到的限速类别
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateAck {
    pub classes: Vec<u16>,
}

impl RateAck {
    pub(crate) fn read(mut stream: Bytes) -> Result<Self, Error> {
        let mut classes = Vec::with_capacity(stream.len() / 2);
        while !stream.is_empty() {
            classes.push(read_u16(&mut stream)?);
        }
        Ok(RateAck { classes })
    }

    pub(crate) fn write(&self, stream: &mut BytesMut) {
        for class in &self.classes {
            stream.put_u16(*class);
        }
    }
}

/// 服务端通知某个限速类别的状态变化
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateChange {
    /// 1 参数变化, 2 警告, 3 已限速, 4 解除限速
    pub code: u16,
    pub class: RateClassInfo,
}

impl RateChange {
    pub(crate) fn read(mut stream: Bytes) -> Result<Self, Error> {
        let code = read_u16(&mut stream)?;
        let class = RateClassInfo::read(&mut stream)?;
        Ok(RateChange { code, class })
    }

    pub(crate) fn write(&self, stream: &mut BytesMut) {
        stream.put_u16(self.code);
        self.class.write(stream);
    }
}

/// 被其他用户警告
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarningNotification {
    /// 新的警告等级，单位 0.1%
    pub new_level: u16,
    /// 匿名警告时为 None
    pub warner: Option<UserInfo>,
}

impl WarningNotification {
    pub(crate) fn read(mut stream: Bytes) -> Result<Self, Error> {
        let new_level = read_u16(&mut stream)?;
        let warner = if stream.is_empty() {
            None
        } else {
            Some(UserInfo::read(&mut stream)?)
        };
        Ok(WarningNotification { new_level, warner })
    }

    pub(crate) fn write(&self, stream: &mut BytesMut) {
        stream.put_u16(self.new_level);
        if let Some(warner) = &self.warner {
            warner.write(stream);
        }
    }
}
