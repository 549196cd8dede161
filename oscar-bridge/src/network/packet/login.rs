use bytes::{BufMut, Bytes, BytesMut};

use super::{
    read_u32,
    tlv::{Tlv, TlvChain},
    Error,
};

/// FLAP 协议版本，固定为 1
pub const FLAP_VERSION: u32 = 1;
/// 登录 cookie 所在的 tlv
const TLV_COOKIE: u16 = 0x0006;

/// 通道 1 上的登录帧
/// 服务端连接建立后先发一个只带版本号的登录帧，客户端回复版本号 + cookie
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginFlap {
    pub version: u32,
    pub cookie: Option<Bytes>,
}

impl LoginFlap {
    pub fn with_cookie(cookie: Bytes) -> Self {
        Self {
            version: FLAP_VERSION,
            cookie: Some(cookie),
        }
    }

    pub fn read(mut stream: Bytes) -> Result<Self, Error> {
        let version = read_u32(&mut stream)?;
        let tlvs = TlvChain::read_all(&mut stream)?;
        Ok(LoginFlap {
            version,
            cookie: tlvs.get(TLV_COOKIE).map(|tlv| tlv.value.clone()),
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut stream = BytesMut::new();
        stream.put_u32(self.version);
        if let Some(cookie) = &self.cookie {
            Tlv::new(TLV_COOKIE, cookie.clone()).write(&mut stream);
        }
        stream.freeze()
    }
}
