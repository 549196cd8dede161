//! SNAC 命令
//! 原始命令 SnacCommand 只解析 10 字节的命令头，Snac 是本连接自己要处理的命令

use bytes::{BufMut, Bytes, BytesMut};

pub use buddy::*;
pub use conn::*;
pub use icbm::*;

use super::{read_bytes, read_u16, read_u32, Error};

pub mod buddy;
pub mod conn;
pub mod icbm;

/// SNAC 命令头长度
const SNAC_HEADER_LEN: usize = 10;
/// 一个 FLAP 帧能装下的最大命令体
pub const MAX_BODY_LEN: usize = u16::MAX as usize - SNAC_HEADER_LEN;
/// flags 中此位表示命令体前面有一段需要跳过的附加数据
const FLAG_EXTRA_DATA: u16 = 0x8000;

/// 本连接用到的 SNAC family
pub mod family {
    pub const CONN: u16 = 0x0001;
    pub const BUDDY: u16 = 0x0003;
    pub const ICBM: u16 = 0x0004;
}

/// 原始 SNAC 命令，创建后不可变
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnacCommand {
    pub family: u16,
    pub subtype: u16,
    pub flags: u16,
    /// 同一条连接上，每个发出的请求唯一
    pub request_id: u32,
    pub body: Bytes,
}

impl SnacCommand {
    pub fn new(family: u16, subtype: u16, body: Bytes) -> Self {
        Self {
            family,
            subtype,
            flags: 0,
            request_id: 0,
            body,
        }
    }

    /// 复制一份带请求 id 的命令
    pub fn with_request_id(&self, request_id: u32) -> Self {
        Self {
            request_id,
            ..self.clone()
        }
    }

    /// (family, subtype)
    #[inline]
    pub fn key(&self) -> (u16, u16) {
        (self.family, self.subtype)
    }

    /// 从通道 2 的帧负载中解析
    pub fn read(mut stream: Bytes) -> Result<Self, Error> {
        if stream.len() < SNAC_HEADER_LEN {
            return Err(Error::MalformedPacket);
        }
        let family = read_u16(&mut stream)?;
        let subtype = read_u16(&mut stream)?;
        let flags = read_u16(&mut stream)?;
        let request_id = read_u32(&mut stream)?;
        if flags & FLAG_EXTRA_DATA != 0 {
            let extra_len = read_u16(&mut stream)? as usize;
            read_bytes(&mut stream, extra_len)?;
        }

        Ok(SnacCommand {
            family,
            subtype,
            flags,
            request_id,
            body: stream,
        })
    }

    pub fn write(&self, stream: &mut BytesMut) {
        stream.reserve(SNAC_HEADER_LEN + self.body.len());
        stream.put_u16(self.family);
        stream.put_u16(self.subtype);
        // 附加数据不会被重新编码
        stream.put_u16(self.flags & !FLAG_EXTRA_DATA);
        stream.put_u32(self.request_id);
        stream.extend_from_slice(&self.body);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut stream = BytesMut::new();
        self.write(&mut stream);
        stream.freeze()
    }
}

/// 本连接能理解的 SNAC 命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Snac {
    ClientReady(ClientReady),
    ServerReady(ServerReady),
    RateInfoRequest,
    RateInfo(RateInfo),
    RateAck(RateAck),
    RateChange(RateChange),
    Warning(WarningNotification),
    ClientVersions(ClientVersions),
    BuddyStatus(BuddyStatus),
    BuddyOffline(BuddyOffline),
    SendRv(SendRvIcbm),
    RecvIm(RecvImIcbm),
    RecvRv(RecvRvIcbm),
}

impl Snac {
    /// 解析原始命令，不认识的 (family, subtype) 返回 None
    pub fn decode(command: &SnacCommand) -> Result<Option<Self>, Error> {
        let stream = command.body.clone();
        let snac = match command.key() {
            (family::CONN, conn::CLIENT_READY) => Snac::ClientReady(ClientReady::read(stream)?),
            (family::CONN, conn::SERVER_READY) => Snac::ServerReady(ServerReady::read(stream)?),
            (family::CONN, conn::RATE_INFO_REQUEST) => Snac::RateInfoRequest,
            (family::CONN, conn::RATE_INFO) => Snac::RateInfo(RateInfo::read(stream)?),
            (family::CONN, conn::RATE_ACK) => Snac::RateAck(RateAck::read(stream)?),
            (family::CONN, conn::RATE_CHANGE) => Snac::RateChange(RateChange::read(stream)?),
            (family::CONN, conn::WARNING) => Snac::Warning(WarningNotification::read(stream)?),
            (family::CONN, conn::CLIENT_VERSIONS) => {
                Snac::ClientVersions(ClientVersions::read(stream)?)
            }
            (family::BUDDY, buddy::BUDDY_STATUS) => Snac::BuddyStatus(BuddyStatus::read(stream)?),
            (family::BUDDY, buddy::BUDDY_OFFLINE) => {
                Snac::BuddyOffline(BuddyOffline::read(stream)?)
            }
            (family::ICBM, icbm::SEND_ICBM) => match SendRvIcbm::read(stream)? {
                Some(send) => Snac::SendRv(send),
                None => return Ok(None),
            },
            (family::ICBM, icbm::RECV_ICBM) => match icbm::RecvIcbm::read(stream)? {
                icbm::RecvIcbm::Im(im) => Snac::RecvIm(im),
                icbm::RecvIcbm::Rv(rv) => Snac::RecvRv(rv),
                icbm::RecvIcbm::Other(_) => return Ok(None),
            },
            _ => return Ok(None),
        };

        Ok(Some(snac))
    }

    pub fn encode(&self) -> SnacCommand {
        let mut stream = BytesMut::new();
        match self {
            Snac::ClientReady(cmd) => cmd.write(&mut stream),
            Snac::ServerReady(cmd) => cmd.write(&mut stream),
            Snac::RateInfoRequest => {}
            Snac::RateInfo(cmd) => cmd.write(&mut stream),
            Snac::RateAck(cmd) => cmd.write(&mut stream),
            Snac::RateChange(cmd) => cmd.write(&mut stream),
            Snac::Warning(cmd) => cmd.write(&mut stream),
            Snac::ClientVersions(cmd) => cmd.write(&mut stream),
            Snac::BuddyStatus(cmd) => cmd.write(&mut stream),
            Snac::BuddyOffline(cmd) => cmd.write(&mut stream),
            Snac::SendRv(cmd) => cmd.write(&mut stream),
            Snac::RecvIm(cmd) => cmd.write(&mut stream),
            Snac::RecvRv(cmd) => cmd.write(&mut stream),
        }
        let (family, subtype) = self.key();
        SnacCommand::new(family, subtype, stream.freeze())
    }

    #[inline]
    pub fn key(&self) -> (u16, u16) {
        match self {
            Snac::ClientReady(_) => (family::CONN, conn::CLIENT_READY),
            Snac::ServerReady(_) => (family::CONN, conn::SERVER_READY),
            Snac::RateInfoRequest => (family::CONN, conn::RATE_INFO_REQUEST),
            Snac::RateInfo(_) => (family::CONN, conn::RATE_INFO),
            Snac::RateAck(_) => (family::CONN, conn::RATE_ACK),
            Snac::RateChange(_) => (family::CONN, conn::RATE_CHANGE),
            Snac::Warning(_) => (family::CONN, conn::WARNING),
            Snac::ClientVersions(_) => (family::CONN, conn::CLIENT_VERSIONS),
            Snac::BuddyStatus(_) => (family::BUDDY, buddy::BUDDY_STATUS),
            Snac::BuddyOffline(_) => (family::BUDDY, buddy::BUDDY_OFFLINE),
            Snac::SendRv(_) => (family::ICBM, icbm::SEND_ICBM),
            Snac::RecvIm(_) | Snac::RecvRv(_) => (family::ICBM, icbm::RECV_ICBM),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snac_header_parsing_works() {
        let payload = Bytes::from_static(&[
            0x00, 0x01, 0x00, 0x03, // family, subtype
            0x00, 0x00, // flags
            0x00, 0x00, 0x00, 0x2a, // request id
            0x00, 0x01, 0x00, 0x04, // families
        ]);
        let command = SnacCommand::read(payload).unwrap();
        assert_eq!(command.key(), (family::CONN, conn::SERVER_READY));
        assert_eq!(command.request_id, 42);

        let snac = Snac::decode(&command).unwrap().unwrap();
        assert_eq!(
            snac,
            Snac::ServerReady(ServerReady {
                families: vec![0x0001, 0x0004]
            })
        );
    }

    #[test]
    fn extra_data_is_skipped() {
        let payload = Bytes::from_static(&[
            0x00, 0x01, 0x00, 0x08, // family, subtype
            0x80, 0x00, // flags with extra data
            0x00, 0x00, 0x00, 0x01, // request id
            0x00, 0x02, 0xff, 0xff, // extra data
            0x00, 0x01, // body
        ]);
        let command = SnacCommand::read(payload).unwrap();
        assert_eq!(&command.body[..], &[0x00, 0x01]);
    }

    #[test]
    fn unknown_snac_is_not_decoded() {
        let command = SnacCommand::new(0x0013, 0x0006, Bytes::new());
        assert!(Snac::decode(&command).unwrap().is_none());
    }

    #[test]
    fn short_header_is_malformed() {
        let payload = Bytes::from_static(&[0x00, 0x01, 0x00]);
        assert!(matches!(
            SnacCommand::read(payload),
            Err(Error::MalformedPacket)
        ));
    }
}
