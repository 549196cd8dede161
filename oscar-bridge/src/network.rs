//! 网络层
//! 本层只关心网络读写，不包含任何协议相关逻辑

use std::time::Duration;

pub(crate) use link::FlapLink;

use log::{debug, info, warn};
use tokio::{
    io, select,
    sync::mpsc::Receiver,
    time::{self, Instant},
};

use crate::{
    protocol::{Command, Connection, RequestError},
    SessionSupervisor, XmppEgress,
};

pub(crate) mod link;
pub mod packet;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Packet error: {0}")]
    Packet(#[from] packet::Error),
    #[error("I/O: {0}")]
    IO(#[from] io::Error),
    #[error("Connection closed by peer")]
    ConnectionAborted,
    #[error("Connection reset by peer")]
    ConnectionReset,
}

/// 一条连接的事件循环，独占 socket 和协议层状态
pub(crate) struct EventLoop<S, E> {
    link: FlapLink,
    connection: Connection<S, E>,
    /// ConnectionHandle 发来的指令
    commands: Receiver<Command>,
    keepalive: Duration,
}

impl<S, E> EventLoop<S, E>
where
    S: SessionSupervisor,
    E: XmppEgress,
{
    pub(crate) fn new(
        link: FlapLink,
        connection: Connection<S, E>,
        commands: Receiver<Command>,
        keepalive: Duration,
    ) -> Self {
        Self {
            link,
            connection,
            commands,
            keepalive,
        }
    }

    /// 开启事件循环，连接关闭后返回
    /// 网络错误会让所有等待中的请求以 TransportClosed 失败
    pub(crate) async fn start(mut self) -> Result<(), Error> {
        self.connection.transport_established();
        let result = self.run().await;
        match &result {
            Ok(()) => {
                // 把断开帧写出去
                if let Err(e) = self.flush().await {
                    debug!("flush before shutdown error: {}", e);
                }
            }
            Err(e) => {
                warn!("oscar connection lost: {}", e);
                self.connection.close(RequestError::TransportClosed);
            }
        }
        if let Err(e) = self.link.shutdown().await {
            debug!("shutdown link error: {}", e);
        }
        self.connection.finish();
        info!("oscar connection closed");
        result
    }

    async fn run(&mut self) -> Result<(), Error> {
        loop {
            self.flush().await?;
            if self.connection.is_closing() {
                return Ok(());
            }

            let keepalive_at = self.link.last_write() + self.keepalive;
            let wakeup = match self.connection.next_wakeup() {
                Some(at) => at.min(keepalive_at),
                None => keepalive_at,
            };

            select! {
                // 从网络层读数据
                read = self.link.read_packet() => {
                    let packet = read?;
                    self.connection.handle_flap(packet, Instant::now()).await;
                }
                // 从 handle 读指令
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        info!("all connection handles dropped");
                        self.connection.disconnect();
                    }
                },
                // 请求超时、限速队列放行和心跳
                _ = time::sleep_until(wakeup) => {
                    let now = Instant::now();
                    self.connection.poll_timers(now);
                    if now >= self.link.last_write() + self.keepalive {
                        self.connection.keepalive();
                    }
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        let now = Instant::now();
        match command {
            Command::Request {
                command,
                listener,
                reply,
            } => {
                let route = self.connection.request(command, listener, now).await;
                let _ = reply.send(route);
            }
            Command::DispatchRequest { request, reply } => {
                let route = self.connection.dispatch_request(request).await;
                let _ = reply.send(route);
            }
            Command::Cancel { request_id, reply } => {
                let _ = reply.send(self.connection.cancel(request_id));
            }
            Command::ClientReady { reply } => {
                let _ = reply.send(self.connection.client_ready());
            }
            Command::State { reply } => {
                let state = (
                    self.connection.phase(),
                    self.connection.client_ready_sent(),
                );
                let _ = reply.send(state);
            }
            Command::RegisterHandler {
                family,
                subtype,
                handler,
            } => self.connection.register_handler(family, subtype, handler),
            Command::GetAndSendStatus { screen_name } => {
                self.connection.get_and_send_status(&screen_name).await
            }
            Command::GetAndSendAllStatuses { jid } => {
                self.connection.get_and_send_all_statuses(&jid).await
            }
            Command::OnNewRvSession { listener } => self.connection.on_new_rv_session(listener),
            Command::SendRv {
                session,
                status,
                payload,
                reply,
            } => {
                let route = self.connection.send_rv(&session, status, payload, now);
                let _ = reply.send(route);
            }
            Command::Disconnect => self.connection.disconnect(),
        }
    }

    /// 写出协议层产生的所有帧
    async fn flush(&mut self) -> Result<(), Error> {
        while let Some(packet) = self.connection.pop_outbound() {
            // 单个帧写不出去不影响连接
            if let Err(e) = self.link.write_packet(&packet) {
                warn!("drop flap frame on channel {:?}: {}", packet.channel, e);
            }
        }
        self.link.flush().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use tokio::{
        net::{TcpListener, TcpStream},
        sync::mpsc,
    };

    use super::*;
    use crate::{
        network::packet::{Channel, FlapPacket},
        protocol::{AuthCookie, DefaultRvCommandFactory, Settings},
        xmpp::transport_mapper,
        EgressLog, StandaloneSupervisor,
    };

    const KEEPALIVE: Duration = Duration::from_secs(60);

    async fn start_loop() -> (FlapLink, mpsc::Sender<Command>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (server, _) = listener.accept().await.unwrap();

        let settings = Settings::new(
            AuthCookie::new(Bytes::from_static(b"cookie")),
            transport_mapper("oscar.gw"),
        );
        let connection = Connection::new(
            settings,
            Arc::new(StandaloneSupervisor::new("user@xmpp".parse().unwrap())),
            Arc::new(EgressLog),
            Box::new(DefaultRvCommandFactory),
            Instant::now(),
        );
        let (tx, rx) = mpsc::channel(16);
        let event_loop = EventLoop::new(FlapLink::new(client), connection, rx, KEEPALIVE);
        tokio::spawn(event_loop.start());
        (FlapLink::new(server), tx)
    }

    #[tokio::test(start_paused = true)]
    async fn idle_link_sends_keepalive() {
        let start = Instant::now();
        let (mut server, _commands) = start_loop().await;

        let frame = server.read_packet().await.unwrap();
        assert_eq!(frame.channel, Channel::KeepAlive);
        assert!(frame.payload.is_empty());
        assert!(Instant::now() >= start + KEEPALIVE);

        // 下一次心跳从上一次写出开始计时
        let first = Instant::now();
        let frame = server.read_packet().await.unwrap();
        assert_eq!(frame.channel, Channel::KeepAlive);
        assert!(Instant::now() >= first + KEEPALIVE);
    }

    #[tokio::test(start_paused = true)]
    async fn writes_postpone_keepalive() {
        let start = Instant::now();
        let (mut server, _commands) = start_loop().await;

        // 30 秒后服务器发来登录提示，客户端回复 cookie
        time::sleep(Duration::from_secs(30)).await;
        server
            .write_packet(&FlapPacket::new(
                Channel::Login,
                0,
                Bytes::from_static(&[0, 0, 0, 1]),
            ))
            .unwrap();
        server.flush().await.unwrap();
        let login = server.read_packet().await.unwrap();
        assert_eq!(login.channel, Channel::Login);
        let replied = Instant::now();
        assert!(replied < start + KEEPALIVE);

        let frame = server.read_packet().await.unwrap();
        assert_eq!(frame.channel, Channel::KeepAlive);
        assert!(Instant::now() >= replied + KEEPALIVE);
    }
}
