use std::sync::Arc;

use bytes::Bytes;
use log::info;
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::Instant,
};

use crate::{
    config::{Config, Endpoint},
    error::Error,
    network::{self, EventLoop, FlapLink},
    packet::SnacCommand,
    protocol::{
        AuthCookie, Command, Connection, DefaultRvCommandFactory, NewRvSessionListener, Phase,
        RequestId, Route, RvCommandFactory, RvSessionKey, SnacHandler, SnacListener, SnacRequest,
    },
    xmpp::Jid,
    SessionSupervisor, XmppEgress,
};

/// 每条连接的指令队列长度
const COMMAND_CHANNEL_SIZE: usize = 1000;

/// 按配置建立到 OSCAR 服务器的连接
pub struct Bridge {
    cfg: Config,
}

impl Bridge {
    pub fn new(cfg: Config) -> Self {
        Self { cfg }
    }

    pub async fn connect<S, E>(
        &self,
        cookie: AuthCookie,
        supervisor: Arc<S>,
        egress: Arc<E>,
    ) -> Result<(ConnectionHandle, JoinHandle<Result<(), Error>>), Error>
    where
        S: SessionSupervisor,
        E: XmppEgress,
    {
        self.connect_with_factory(cookie, supervisor, egress, Box::new(DefaultRvCommandFactory))
            .await
    }

    /// 连接成功后在后台协程中运行事件循环
    /// 事件循环在连接关闭后结束，网络错误通过 JoinHandle 返回
    pub async fn connect_with_factory<S, E>(
        &self,
        cookie: AuthCookie,
        supervisor: Arc<S>,
        egress: Arc<E>,
        factory: Box<dyn RvCommandFactory>,
    ) -> Result<(ConnectionHandle, JoinHandle<Result<(), Error>>), Error>
    where
        S: SessionSupervisor,
        E: XmppEgress,
    {
        self.cfg.validate()?;
        let stream = match self.cfg.endpoint()? {
            Endpoint::Addr(addr) => TcpStream::connect(addr).await,
            Endpoint::Host(host, port) => TcpStream::connect((host.as_str(), port)).await,
        }
        .map_err(network::Error::IO)?;
        if let Ok(addr) = stream.peer_addr() {
            info!("connected to oscar server {}", addr);
        }

        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let settings = self.cfg.settings(cookie);
        let connection = Connection::new(settings, supervisor, egress, factory, Instant::now());
        let event_loop = EventLoop::new(
            FlapLink::new(stream),
            connection,
            rx,
            self.cfg.keepalive_interval(),
        );
        let handle = tokio::spawn(async move { event_loop.start().await.map_err(Error::from) });

        Ok((ConnectionHandle { tx }, handle))
    }
}

/// 给连接事件循环发送指令
/// 事件循环退出后所有方法返回 ConnectionGone
#[derive(Clone)]
pub struct ConnectionHandle {
    tx: mpsc::Sender<Command>,
}

impl ConnectionHandle {
    async fn send(&self, command: Command) -> Result<(), Error> {
        self.tx
            .send(command)
            .await
            .map_err(|_| Error::ConnectionGone)
    }

    async fn call<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, Error> {
        let (reply, rx) = oneshot::channel();
        self.send(command(reply)).await?;
        rx.await.map_err(|_| Error::ConnectionGone)
    }

    /// 发送请求，本连接不支持的 family 交给会话层
    /// 响应或失败通过 listener 通知
    pub async fn request(
        &self,
        command: SnacCommand,
        listener: Option<SnacListener>,
    ) -> Result<Route, Error> {
        let route = self
            .call(|reply| Command::Request {
                command,
                listener,
                reply,
            })
            .await?;
        Ok(route?)
    }

    /// 跳过本连接，直接交给会话层
    pub async fn dispatch_request(&self, request: SnacRequest) -> Result<Route, Error> {
        let route = self
            .call(|reply| Command::DispatchRequest { request, reply })
            .await?;
        Ok(route?)
    }

    /// 请求已完成时返回 false
    pub async fn cancel(&self, request_id: RequestId) -> Result<bool, Error> {
        self.call(|reply| Command::Cancel { request_id, reply })
            .await
    }

    /// 只有第一次调用会发出 ClientReady
    pub async fn client_ready(&self) -> Result<bool, Error> {
        self.call(|reply| Command::ClientReady { reply }).await
    }

    /// 连接当前所处阶段
    pub async fn phase(&self) -> Result<Phase, Error> {
        let (phase, _) = self.call(|reply| Command::State { reply }).await?;
        Ok(phase)
    }

    pub async fn client_ready_sent(&self) -> Result<bool, Error> {
        let (_, sent) = self.call(|reply| Command::State { reply }).await?;
        Ok(sent)
    }

    /// subtype 为 None 时处理整个 family
    pub async fn register_handler(
        &self,
        family: u16,
        subtype: Option<u16>,
        handler: SnacHandler,
    ) -> Result<(), Error> {
        self.send(Command::RegisterHandler {
            family,
            subtype,
            handler,
        })
        .await
    }

    pub async fn get_and_send_status(&self, screen_name: &str) -> Result<(), Error> {
        self.send(Command::GetAndSendStatus {
            screen_name: screen_name.to_string(),
        })
        .await
    }

    pub async fn get_and_send_all_statuses(&self, jid: Jid) -> Result<(), Error> {
        self.send(Command::GetAndSendAllStatuses { jid }).await
    }

    pub async fn on_new_rv_session(&self, listener: NewRvSessionListener) -> Result<(), Error> {
        self.send(Command::OnNewRvSession { listener }).await
    }

    pub async fn send_rv(
        &self,
        session: RvSessionKey,
        status: u16,
        payload: Bytes,
    ) -> Result<Route, Error> {
        let route = self
            .call(|reply| Command::SendRv {
                session,
                status,
                payload,
                reply,
            })
            .await?;
        Ok(route?)
    }

    pub async fn disconnect(&self) -> Result<(), Error> {
        self.send(Command::Disconnect).await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::{net::TcpListener, sync::mpsc::UnboundedSender, time::timeout};

    use super::*;
    use crate::{
        error::EgressError,
        network::packet::{
            snac::{BuddyStatus, RateClassInfo, RateInfo, ServerReady, UserInfo},
            Channel, FlapPacket, LoginFlap, Snac,
        },
        protocol::RequestError,
        xmpp::Stanza,
        StandaloneSupervisor,
    };

    struct ChannelEgress(UnboundedSender<Stanza>);

    #[async_trait]
    impl XmppEgress for ChannelEgress {
        async fn send(&self, stanza: Stanza) -> Result<(), EgressError> {
            self.0
                .send(stanza)
                .map_err(|e| EgressError::Rejected(e.to_string()))
        }
    }

    fn config(addr: std::net::SocketAddr) -> Config {
        Config::parse(&format!(
            r#"
            [server]
            addr = "{}"

            [transport]
            domain = "oscar.gw"
            "#,
            addr
        ))
        .unwrap()
    }

    async fn write(link: &mut FlapLink, channel: Channel, payload: Bytes) {
        link.write_packet(&FlapPacket::new(channel, 0, payload))
            .unwrap();
        link.flush().await.unwrap();
    }

    async fn write_snac(link: &mut FlapLink, snac: Snac) {
        write(link, Channel::Snac, snac.encode().to_bytes()).await;
    }

    async fn read_snac(link: &mut FlapLink) -> SnacCommand {
        let packet = timeout(Duration::from_secs(5), link.read_packet())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(packet.channel, Channel::Snac);
        SnacCommand::read(packet.payload).unwrap()
    }

    #[tokio::test]
    async fn loopback_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let bridge = Bridge::new(config(listener.local_addr().unwrap()));

        let (stanza_tx, mut stanza_rx) = mpsc::unbounded_channel();
        let supervisor = Arc::new(StandaloneSupervisor::new(
            "user@xmpp/desktop".parse().unwrap(),
        ));
        let (handle, task) = bridge
            .connect(
                AuthCookie::new(Bytes::from_static(b"cookie")),
                supervisor,
                Arc::new(ChannelEgress(stanza_tx)),
            )
            .await
            .unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        let mut server = FlapLink::new(stream);

        // 登录
        write(&mut server, Channel::Login, Bytes::from_static(&[0, 0, 0, 1])).await;
        let login = server.read_packet().await.unwrap();
        assert_eq!(login.channel, Channel::Login);
        let login = LoginFlap::read(login.payload).unwrap();
        assert_eq!(login.cookie.as_deref(), Some(&b"cookie"[..]));

        // 协商
        write_snac(
            &mut server,
            Snac::ServerReady(ServerReady {
                families: vec![0x01, 0x02, 0x03, 0x04],
            }),
        )
        .await;
        assert_eq!(read_snac(&mut server).await.key(), (0x0001, 0x0017));
        assert_eq!(read_snac(&mut server).await.key(), (0x0001, 0x0006));
        write_snac(
            &mut server,
            Snac::RateInfo(RateInfo {
                classes: vec![RateClassInfo {
                    class_id: 1,
                    window_size: 80,
                    clear_level: 2900,
                    alert_level: 2000,
                    limit_level: 1500,
                    disconnect_level: 800,
                    current_avg: 5000,
                    max_avg: 6000,
                    last_ms: 0,
                    commands: vec![(0x0004, 0x0006)],
                }],
            }),
        )
        .await;
        assert_eq!(read_snac(&mut server).await.key(), (0x0001, 0x0008));
        assert_eq!(read_snac(&mut server).await.key(), (0x0001, 0x0002));
        assert!(!handle.client_ready().await.unwrap());
        assert_eq!(handle.phase().await.unwrap(), Phase::Ready);
        assert!(handle.client_ready_sent().await.unwrap());

        // 好友状态
        write_snac(
            &mut server,
            Snac::BuddyStatus(BuddyStatus {
                info: UserInfo::new("alice"),
            }),
        )
        .await;
        let stanza = timeout(Duration::from_secs(5), stanza_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            stanza.to_string(),
            r#"<presence to="user@xmpp" from="alice@oscar.gw"/>"#
        );

        // 请求和响应
        let (result_tx, result_rx) = oneshot::channel();
        let route = handle
            .request(
                SnacCommand::new(0x0002, 0x0005, Bytes::from_static(b"alice")),
                Some(Box::new(move |result| {
                    let _ = result_tx.send(result);
                })),
            )
            .await
            .unwrap();
        let request = read_snac(&mut server).await;
        assert_eq!(route, Route::Sent(request.request_id));
        let reply = SnacCommand::new(0x0002, 0x0006, Bytes::new()).with_request_id(request.request_id);
        write(&mut server, Channel::Snac, reply.to_bytes()).await;
        assert_eq!(result_rx.await.unwrap(), Ok(reply));

        // 没有其他连接支持的 family
        let unsupported = handle
            .request(SnacCommand::new(0x000f, 0x0002, Bytes::new()), None)
            .await;
        assert!(matches!(
            unsupported,
            Err(Error::Request(RequestError::UnsupportedFamily))
        ));

        // 断开
        handle.disconnect().await.unwrap();
        let bye = server.read_packet().await.unwrap();
        assert_eq!(bye.channel, Channel::Disconnect);
        timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(matches!(
            handle.client_ready().await,
            Err(Error::ConnectionGone)
        ));
    }

    #[tokio::test]
    async fn transport_loss_fails_pending_requests() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let bridge = Bridge::new(config(listener.local_addr().unwrap()));
        let (stanza_tx, _stanza_rx) = mpsc::unbounded_channel();
        let (handle, task) = bridge
            .connect(
                AuthCookie::new(Bytes::from_static(b"cookie")),
                Arc::new(StandaloneSupervisor::new("user@xmpp".parse().unwrap())),
                Arc::new(ChannelEgress(stanza_tx)),
            )
            .await
            .unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        let mut server = FlapLink::new(stream);
        write_snac(
            &mut server,
            Snac::ServerReady(ServerReady {
                families: vec![0x01, 0x02],
            }),
        )
        .await;
        read_snac(&mut server).await;
        read_snac(&mut server).await;

        let (result_tx, result_rx) = oneshot::channel();
        handle
            .request(
                SnacCommand::new(0x0002, 0x0005, Bytes::new()),
                Some(Box::new(move |result| {
                    let _ = result_tx.send(result);
                })),
            )
            .await
            .unwrap();
        read_snac(&mut server).await;
        drop(server);

        assert_eq!(result_rx.await.unwrap(), Err(RequestError::TransportClosed));
        let exit = timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(matches!(exit, Err(Error::Network(_))));
    }
}
