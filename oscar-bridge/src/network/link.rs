use bytes::BytesMut;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::Instant,
};

use super::{
    packet::{self, FlapPacket},
    Error,
};

/// 与 OSCAR 服务器之间的连接
/// 单纯的 tcp 读写管理，以 FLAP 帧为单位读写
pub(crate) struct FlapLink {
    /// tcp 连接
    stream: TcpStream,
    /// 读缓冲区
    /// 使用缓冲区而非按照字节从 socket 读取数据
    read: BytesMut,
    /// 写缓冲区
    /// 先写入缓冲区再刷入 socket 而非按字节向 socket 写入数据
    write: BytesMut,
    /// 上一次写入 socket 的时间，用于心跳
    last_write: Instant,
}

impl FlapLink {
    pub(crate) fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            read: BytesMut::with_capacity(4096),
            write: BytesMut::new(),
            last_write: Instant::now(),
        }
    }

    /// 读取一个帧
    /// 被取消时已读到的数据保留在缓冲区中
    pub(crate) async fn read_packet(&mut self) -> Result<FlapPacket, Error> {
        loop {
            let required = match FlapPacket::read(&mut self.read) {
                Ok(packet) => return Ok(packet),
                Err(packet::Error::InsufficientBytes(n)) => n,
                Err(e) => return Err(Error::Packet(e)),
            };

            // 数据不足，读取更多数据
            self.read_bytes(required).await?;
        }
    }

    /// 等待从 socket 读出至少所需长度的数据，放入缓冲区
    async fn read_bytes(&mut self, required: usize) -> Result<(), Error> {
        let mut total_read = 0;
        loop {
            let read = self.stream.read_buf(&mut self.read).await?;
            if 0 == read {
                // 帧之间断开是正常关闭，帧中间断开视为重置
                return if self.read.is_empty() {
                    Err(Error::ConnectionAborted)
                } else {
                    Err(Error::ConnectionReset)
                };
            }

            total_read += read;
            if total_read >= required {
                return Ok(());
            }
        }
    }

    /// 写入缓冲区，调用 flush 后才会写入 socket
    pub(crate) fn write_packet(&mut self, packet: &FlapPacket) -> Result<(), Error> {
        packet.write(&mut self.write)?;
        Ok(())
    }

    pub(crate) async fn flush(&mut self) -> Result<(), Error> {
        if self.write.is_empty() {
            return Ok(());
        }

        self.stream.write_all(&self.write).await?;
        self.write.clear();
        self.last_write = Instant::now();
        Ok(())
    }

    pub(crate) fn last_write(&self) -> Instant {
        self.last_write
    }

    pub(crate) async fn shutdown(&mut self) -> Result<(), Error> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::net::TcpListener;

    use super::*;
    use crate::network::packet::Channel;

    async fn pair() -> (FlapLink, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (FlapLink::new(client), server)
    }

    #[tokio::test]
    async fn frames_split_across_writes() {
        let (mut link, mut server) = pair().await;

        let mut bytes = BytesMut::new();
        FlapPacket::new(Channel::Login, 1, Bytes::from_static(&[0, 0, 0, 1]))
            .write(&mut bytes)
            .unwrap();
        FlapPacket::new(Channel::KeepAlive, 2, Bytes::new())
            .write(&mut bytes)
            .unwrap();
        server.write_all(&bytes[..3]).await.unwrap();
        server.flush().await.unwrap();
        let writer = tokio::spawn(async move {
            server.write_all(&bytes[3..]).await.unwrap();
            server
        });

        let first = link.read_packet().await.unwrap();
        assert_eq!(first.channel, Channel::Login);
        assert_eq!(&first.payload[..], &[0, 0, 0, 1]);
        let second = link.read_packet().await.unwrap();
        assert_eq!(second.channel, Channel::KeepAlive);
        assert_eq!(second.seq, 2);

        drop(writer.await.unwrap());
        assert!(matches!(
            link.read_packet().await,
            Err(Error::ConnectionAborted)
        ));
    }

    #[tokio::test]
    async fn writes_are_buffered_until_flush() {
        let (mut link, mut server) = pair().await;
        let before = link.last_write();
        link.write_packet(&FlapPacket::new(Channel::Snac, 7, Bytes::from_static(b"abc")))
            .unwrap();
        link.flush().await.unwrap();
        assert!(link.last_write() >= before);

        let mut buf = [0u8; 9];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0x2a, 0x02, 0x00, 0x07, 0x00, 0x03, b'a', b'b', b'c']);
    }

    #[tokio::test]
    async fn bad_marker_is_fatal() {
        let (mut link, mut server) = pair().await;
        server.write_all(&[0x00; 6]).await.unwrap();
        assert!(matches!(
            link.read_packet().await,
            Err(Error::Packet(packet::Error::InvalidMarker(0)))
        ));
    }
}
