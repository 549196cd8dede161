use bytes::{BufMut, Bytes, BytesMut};

use super::{read_bytes, read_u16, Error};

/// type-length-value 块
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tlv {
    pub tag: u16,
    pub value: Bytes,
}

impl Tlv {
    pub fn new(tag: u16, value: impl Into<Bytes>) -> Self {
        Self {
            tag,
            value: value.into(),
        }
    }

    pub fn read(stream: &mut Bytes) -> Result<Self, Error> {
        let tag = read_u16(stream)?;
        let len = read_u16(stream)? as usize;
        let value = read_bytes(stream, len)?;
        Ok(Tlv { tag, value })
    }

    pub fn write(&self, stream: &mut BytesMut) {
        stream.put_u16(self.tag);
        stream.put_u16(self.value.len() as u16);
        stream.extend_from_slice(&self.value);
    }
}

/// 顺序保存的 tlv 列表，同一个 tag 可能出现多次，查找时取第一个
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlvChain(Vec<Tlv>);

impl TlvChain {
    /// 读取指定个数的 tlv
    pub fn read_count(stream: &mut Bytes, count: usize) -> Result<Self, Error> {
        let mut tlvs = Vec::with_capacity(count);
        for _ in 0..count {
            tlvs.push(Tlv::read(stream)?);
        }
        Ok(TlvChain(tlvs))
    }

    /// 读取直到 stream 耗尽
    pub fn read_all(stream: &mut Bytes) -> Result<Self, Error> {
        let mut tlvs = Vec::new();
        while !stream.is_empty() {
            tlvs.push(Tlv::read(stream)?);
        }
        Ok(TlvChain(tlvs))
    }

    pub fn get(&self, tag: u16) -> Option<&Tlv> {
        self.0.iter().find(|tlv| tlv.tag == tag)
    }

    pub fn push(&mut self, tlv: Tlv) {
        self.0.push(tlv)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn write(&self, stream: &mut BytesMut) {
        for tlv in &self.0 {
            tlv.write(stream);
        }
    }
}
