//! 一条 OSCAR 连接的状态机
//! 不做网络读写：收到的帧通过 handle_flap 传入，要写出的帧放在 outbox 中由网络层取走

use std::{collections::VecDeque, fmt, sync::Arc, time::Duration};

use bytes::Bytes;
use log::{debug, info, trace, warn};
use tokio::time::Instant;

use crate::{
    network::packet::{
        snac::{
            BuddyOffline, BuddyStatus, ClientReady, ClientVersions, RateAck, RateChange, RateInfo,
            ServerReady, WarningNotification, MAX_BODY_LEN,
        },
        Channel, FlapPacket, LoginFlap, Snac, SnacCommand,
    },
    xmpp::{IdToJid, Jid, Stanza},
    SessionSupervisor, XmppEgress,
};

use super::{
    capability::{CapabilityRegistry, SnacFamilySet},
    dispatcher::{Pending, SnacDispatcher},
    presence::PresenceBridge,
    rate::{Admission, RateGovernor},
    rendezvous::{NewRvSessionListener, RendezvousRouter, RvCommandFactory, RvSessionKey},
    AuthCookie, RequestError, RequestId, Route, SnacHandler, SnacListener, SnacRequest,
};

/// 默认请求超时
pub const DEFAULT_REQUEST_DEADLINE: Duration = Duration::from_secs(30);
/// 默认每个 rate class 最多排队的命令数
pub const DEFAULT_HIGH_WATER_MARK: usize = 64;

/// 连接生命周期
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Connecting,
    Authenticating,
    AwaitingServerReady,
    Negotiating,
    Ready,
    Closing,
    Closed,
}

/// 单条连接的参数
#[derive(Clone)]
pub struct Settings {
    pub cookie: AuthCookie,
    pub request_deadline: Duration,
    pub high_water_mark: usize,
    pub id_to_jid: IdToJid,
}

impl Settings {
    pub fn new(cookie: AuthCookie, id_to_jid: IdToJid) -> Self {
        Self {
            cookie,
            request_deadline: DEFAULT_REQUEST_DEADLINE,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            id_to_jid,
        }
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("cookie", &self.cookie)
            .field("request_deadline", &self.request_deadline)
            .field("high_water_mark", &self.high_water_mark)
            .finish()
    }
}

pub(crate) struct Connection<S, E> {
    cookie: AuthCookie,
    request_deadline: Duration,
    phase: Phase,
    /// 登录帧只发送一次
    login_sent: bool,
    /// 下一个要写出的帧序号
    seq: u16,
    outbox: VecDeque<FlapPacket>,
    dispatcher: SnacDispatcher,
    rate: RateGovernor,
    capabilities: CapabilityRegistry,
    presence: PresenceBridge,
    rendezvous: RendezvousRouter,
    supervisor: Arc<S>,
    egress: Arc<E>,
}

impl<S, E> Connection<S, E>
where
    S: SessionSupervisor,
    E: XmppEgress,
{
    pub(crate) fn new(
        settings: Settings,
        supervisor: Arc<S>,
        egress: Arc<E>,
        factory: Box<dyn RvCommandFactory>,
        now: Instant,
    ) -> Self {
        Self {
            cookie: settings.cookie,
            request_deadline: settings.request_deadline,
            phase: Phase::Connecting,
            login_sent: false,
            seq: 0,
            outbox: VecDeque::new(),
            dispatcher: SnacDispatcher::new(),
            rate: RateGovernor::new(settings.high_water_mark, now),
            capabilities: CapabilityRegistry::default(),
            presence: PresenceBridge::new(settings.id_to_jid),
            rendezvous: RendezvousRouter::new(factory),
            supervisor,
            egress,
        }
    }

    pub(crate) fn phase(&self) -> Phase {
        self.phase
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.phase >= Phase::Closing
    }

    pub(crate) fn client_ready_sent(&self) -> bool {
        self.capabilities.client_ready_sent()
    }

    /// tcp 连接已建立，等待服务器的登录提示
    pub(crate) fn transport_established(&mut self) {
        if self.phase == Phase::Connecting {
            self.phase = Phase::Authenticating;
        }
    }

    /// 取出下一个要写出的帧
    pub(crate) fn pop_outbound(&mut self) -> Option<FlapPacket> {
        self.outbox.pop_front()
    }

    fn push(&mut self, channel: Channel, payload: Bytes) {
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        self.outbox.push_back(FlapPacket::new(channel, seq, payload));
    }

    fn write_snac(&mut self, command: &SnacCommand) {
        trace!(
            "write snac {:04x}/{:04x} request id {}",
            command.family,
            command.subtype,
            command.request_id
        );
        self.push(Channel::Snac, command.to_bytes());
    }

    /// 连接协商用的命令，不经过限速和关联表
    fn write_negotiation(&mut self, snac: Snac) {
        let id = self.dispatcher.next_id();
        let command = snac.encode().with_request_id(id);
        self.write_snac(&command);
    }

    /// 处理一个收到的帧
    pub(crate) async fn handle_flap(&mut self, packet: FlapPacket, now: Instant) {
        if self.is_closing() {
            return;
        }
        match packet.channel {
            Channel::Login => self.handle_login(packet.payload),
            Channel::Snac => {
                if self.phase <= Phase::Authenticating {
                    debug!("cookie accepted, awaiting server ready");
                    self.phase = Phase::AwaitingServerReady;
                }
                match SnacCommand::read(packet.payload) {
                    Ok(command) => self.handle_snac(command, now).await,
                    Err(e) => warn!("drop undecodable snac frame: {}", e),
                }
            }
            Channel::Disconnect => {
                info!("server closed the connection");
                self.close(RequestError::ConnectionClosed);
            }
            Channel::KeepAlive => trace!("keepalive from server"),
            channel => debug!("ignore flap frame on channel {:?}", channel),
        }
    }

    fn handle_login(&mut self, payload: Bytes) {
        if let Err(e) = LoginFlap::read(payload) {
            warn!("malformed login prompt: {}", e);
        }
        if self.login_sent {
            debug!("ignore repeated login prompt");
            return;
        }
        self.login_sent = true;
        self.phase = Phase::Authenticating;
        let login = LoginFlap::with_cookie(self.cookie.as_bytes().clone());
        self.push(Channel::Login, login.to_bytes());
    }

    async fn handle_snac(&mut self, command: SnacCommand, now: Instant) {
        let request_id = command.request_id;
        if let Some(pending) = self.dispatcher.take(request_id) {
            self.rendezvous
                .deliver_response(request_id, Ok(command.clone()));
            pending.complete(Ok(command));
            return;
        }

        let snac = match Snac::decode(&command) {
            Ok(snac) => snac,
            Err(e) => {
                warn!(
                    "drop snac {:04x}/{:04x}: {}",
                    command.family, command.subtype, e
                );
                return;
            }
        };
        match snac {
            Some(Snac::ServerReady(ready)) => self.on_server_ready(ready).await,
            Some(Snac::RateInfo(info)) => self.on_rate_info(info, now),
            Some(Snac::RateChange(change)) => self.on_rate_change(change, now),
            Some(Snac::Warning(warning)) => on_warning(warning),
            Some(Snac::BuddyStatus(status)) => self.on_buddy_status(status).await,
            Some(Snac::BuddyOffline(offline)) => self.on_buddy_offline(offline).await,
            Some(Snac::RecvIm(im)) => {
                let to = self.supervisor.jid_with_highest_priority();
                let stanza = self.presence.message(&im, to);
                self.emit(stanza).await;
            }
            Some(Snac::RecvRv(rv)) => self.rendezvous.handle_inbound(rv),
            _ => self.delegate_inbound(command).await,
        }
    }

    /// 不由本连接处理的命令交给注册的处理函数或会话层
    async fn delegate_inbound(&mut self, command: SnacCommand) {
        if self.dispatcher.is_abandoned(command.request_id) {
            debug!(
                "discard late reply {:04x}/{:04x} for request {}",
                command.family, command.subtype, command.request_id
            );
            return;
        }
        if let Some(command) = self.dispatcher.route(command) {
            self.supervisor.unhandled_snac(command).await;
        }
    }

    async fn on_server_ready(&mut self, ready: ServerReady) {
        let families = SnacFamilySet::new(ready.families);
        if !self.capabilities.set_families(families.clone()) {
            debug!("ignore repeated server ready");
            return;
        }
        info!("server ready, families {:04x?}", families.iter().collect::<Vec<_>>());
        self.phase = Phase::Negotiating;
        let versions = ClientVersions {
            families: self.capabilities.family_infos(),
        };
        self.write_negotiation(Snac::ClientVersions(versions));
        self.write_negotiation(Snac::RateInfoRequest);
        self.supervisor.register_snac_families(&families).await;
    }

    fn on_rate_info(&mut self, info: RateInfo, now: Instant) {
        let classes = info
            .classes
            .iter()
            .map(|class| class.class_id)
            .collect::<Vec<_>>();
        debug!("install rate classes {:?}", classes);
        self.rate.install(&info.classes, now);
        self.write_negotiation(Snac::RateAck(RateAck { classes }));
        if self.phase < Phase::Ready {
            self.phase = Phase::Ready;
        }
        self.client_ready();
        self.release(now);
    }

    fn on_rate_change(&mut self, change: RateChange, now: Instant) {
        self.rate.update(&change.class, now);
        self.release(now);
    }

    async fn on_buddy_status(&mut self, status: BuddyStatus) {
        let to = self.supervisor.jid();
        let stanza = self.presence.update(&status.info, &to);
        self.emit(stanza).await;
    }

    async fn on_buddy_offline(&mut self, offline: BuddyOffline) {
        let to = self.supervisor.jid();
        let stanza = self.presence.remove(offline.screen_name(), &to);
        self.emit(stanza).await;
    }

    /// xmpp 一侧的错误只记录，不影响 OSCAR 连接
    async fn emit(&mut self, stanza: Stanza) {
        let to = stanza.to().clone();
        if let Err(e) = self.egress.send(stanza).await {
            warn!("send stanza to {} error: {}", to, e);
        }
    }

    /// 发送请求
    /// 本连接不支持该 family 或尚未收到 ServerReady 时交给会话层
    /// 失败时回调和返回值都会收到错误
    pub(crate) async fn request(
        &mut self,
        command: SnacCommand,
        listener: Option<SnacListener>,
        now: Instant,
    ) -> Result<Route, RequestError> {
        let request = SnacRequest::new(command, listener);
        if self.is_closing() {
            request.fail(RequestError::ConnectionClosed);
            return Err(RequestError::ConnectionClosed);
        }
        if !self.capabilities.routes_locally(request.command.family) {
            return self.delegate(request).await;
        }
        self.submit(request, now)
    }

    /// 强制交给会话层
    pub(crate) async fn dispatch_request(
        &mut self,
        request: SnacRequest,
    ) -> Result<Route, RequestError> {
        self.delegate(request).await
    }

    async fn delegate(&mut self, request: SnacRequest) -> Result<Route, RequestError> {
        debug!(
            "delegate snac {:04x}/{:04x} to session",
            request.command.family, request.command.subtype
        );
        match self.supervisor.handle_request(request).await {
            Ok(()) => Ok(Route::Delegated),
            Err(request) => {
                request.fail(RequestError::UnsupportedFamily);
                Err(RequestError::UnsupportedFamily)
            }
        }
    }

    fn submit(&mut self, request: SnacRequest, now: Instant) -> Result<Route, RequestError> {
        if request.command.body.len() > MAX_BODY_LEN {
            warn!(
                "reject snac {:04x}/{:04x} with {} bytes body",
                request.command.family,
                request.command.subtype,
                request.command.body.len()
            );
            request.fail(RequestError::PayloadTooLarge);
            return Err(RequestError::PayloadTooLarge);
        }
        let SnacRequest { command, listener } = request;
        let id = self
            .dispatcher
            .allocate(listener, now + self.request_deadline);
        match self.rate.submit(id, command.with_request_id(id), now) {
            Ok(Admission::Send(command)) => {
                self.write_snac(&command);
                Ok(Route::Sent(id))
            }
            Ok(Admission::Queued) => Ok(Route::Queued(id)),
            Err(e) => {
                if let Some(pending) = self.dispatcher.forget(id) {
                    pending.complete(Err(e));
                }
                Err(e)
            }
        }
    }

    /// 只有第一次调用会发出 ClientReady
    /// 收到 ServerReady 之前不知道 family，什么也不做
    pub(crate) fn client_ready(&mut self) -> bool {
        if self.phase < Phase::Negotiating
            || self.is_closing()
            || !self.capabilities.latch_client_ready()
        {
            return false;
        }
        info!("client ready");
        let ready = ClientReady {
            families: self.capabilities.family_infos(),
        };
        self.write_negotiation(Snac::ClientReady(ready));
        true
    }

    pub(crate) fn cancel(&mut self, request_id: RequestId) -> bool {
        match self.dispatcher.cancel(request_id) {
            Some(pending) => {
                self.rate.remove(request_id);
                self.fail(request_id, pending, RequestError::Cancelled);
                true
            }
            None => false,
        }
    }

    fn fail(&mut self, request_id: RequestId, pending: Pending, error: RequestError) {
        self.rendezvous.deliver_response(request_id, Err(error));
        pending.complete(Err(error));
    }

    pub(crate) fn register_handler(&mut self, family: u16, subtype: Option<u16>, handler: SnacHandler) {
        self.dispatcher.register_handler(family, subtype, handler);
    }

    /// 处理到期的请求和可以放行的排队命令
    pub(crate) fn poll_timers(&mut self, now: Instant) {
        for (request_id, pending) in self.dispatcher.expire(now) {
            debug!("request {} timeout", request_id);
            self.rate.remove(request_id);
            self.fail(request_id, pending, RequestError::Timeout);
        }
        self.release(now);
    }

    fn release(&mut self, now: Instant) {
        for (request_id, command) in self.rate.release(now) {
            if self.dispatcher.is_pending(request_id) {
                self.write_snac(&command);
            }
        }
    }

    /// 下一次需要调用 poll_timers 的时刻
    pub(crate) fn next_wakeup(&self) -> Option<Instant> {
        match (self.dispatcher.next_deadline(), self.rate.next_release()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub(crate) async fn get_and_send_status(&mut self, screen_name: &str) {
        let to = self.supervisor.jid();
        let stanza = self.presence.status(screen_name, &to);
        self.emit(stanza).await;
    }

    /// 对缓存的快照逐个发送，期间不修改缓存
    pub(crate) async fn get_and_send_all_statuses(&mut self, to: &Jid) {
        for stanza in self.presence.all_statuses(to) {
            self.emit(stanza).await;
        }
    }

    pub(crate) fn on_new_rv_session(&mut self, listener: NewRvSessionListener) {
        self.rendezvous.on_new_session(listener);
    }

    /// 在 rendezvous 会话上发送，和普通请求共用限速和关联表
    pub(crate) fn send_rv(
        &mut self,
        session: &RvSessionKey,
        status: u16,
        payload: Bytes,
        now: Instant,
    ) -> Result<Route, RequestError> {
        if self.is_closing() {
            return Err(RequestError::ConnectionClosed);
        }
        let command = self.rendezvous.prepare_send(session, status, payload)?;
        if !self.capabilities.routes_locally(command.family) {
            return Err(RequestError::UnsupportedFamily);
        }
        let route = self.submit(SnacRequest::new(command, None), now)?;
        self.rendezvous.sent(session, status, route.request_id());
        Ok(route)
    }

    /// 本端主动断开，发送通道 4 的空帧
    pub(crate) fn disconnect(&mut self) {
        if self.is_closing() {
            return;
        }
        info!("disconnect from server");
        self.push(Channel::Disconnect, Bytes::new());
        self.close(RequestError::ConnectionClosed);
    }

    /// 连接空闲时的心跳
    pub(crate) fn keepalive(&mut self) {
        if !self.is_closing() {
            self.push(Channel::KeepAlive, Bytes::new());
        }
    }

    /// 进入 Closing，所有等待中的请求以 reason 失败
    pub(crate) fn close(&mut self, reason: RequestError) {
        if self.is_closing() {
            return;
        }
        self.phase = Phase::Closing;
        self.rate.clear();
        for (request_id, pending) in self.dispatcher.drain() {
            self.fail(request_id, pending, reason);
        }
        self.rendezvous.close_all();
    }

    /// 网络连接已关闭
    pub(crate) fn finish(&mut self) {
        self.close(RequestError::ConnectionClosed);
        self.outbox.clear();
        self.phase = Phase::Closed;
    }
}

fn on_warning(warning: WarningNotification) {
    match warning.warner {
        Some(warner) => warn!(
            "warned by {}, new warning level {}",
            warner.screen_name, warning.new_level
        ),
        None => warn!(
            "warned anonymously, new warning level {}",
            warning.new_level
        ),
    }
}
