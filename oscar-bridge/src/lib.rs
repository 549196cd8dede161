//! OSCAR 与 xmpp 之间的网关连接库
//! 一个 Bridge 连接管理一条到 OSCAR 服务器的 tcp 连接，把好友状态和消息转换为 xmpp 节

use async_trait::async_trait;
use log::{debug, info};

pub use bridge::{Bridge, ConnectionHandle};
pub use config::Config;
pub use error::{EgressError, Error};
pub use network::packet;
pub use protocol::{
    AuthCookie, BuddyRecord, Capability, DefaultRvCommandFactory, NewRvSessionListener, Phase,
    RecvRvEvent, RequestError, RequestId, Route, RvCommand, RvCommandFactory, RvEvent, RvSession,
    RvSessionKey, RvSessionListener, RvSnacResponseEvent, Settings, SnacFamilySet, SnacHandler,
    SnacListener, SnacRequest,
};
use packet::SnacCommand;
use xmpp::{Jid, Stanza};

pub mod bridge;
pub mod config;
pub mod error;
mod html;
mod network;
mod protocol;
pub mod xmpp;

/// 网关向 xmpp 一侧发送节，由用户实现
#[async_trait]
pub trait XmppEgress: Send + Sync + 'static {
    async fn send(&self, stanza: Stanza) -> Result<(), EgressError>;
}

/// 拥有连接的会话，由用户实现
/// 一个会话可能同时持有多条连接，不同连接支持的 family 不同
#[async_trait]
pub trait SessionSupervisor: Send + Sync + 'static {
    /// 会话所属用户的 bare jid
    fn jid(&self) -> Jid;

    /// 用户当前优先级最高的 full jid
    fn jid_with_highest_priority(&self) -> Jid;

    /// 本连接不能发送的请求
    /// 会话找不到其他连接时原样返回请求
    async fn handle_request(&self, request: SnacRequest) -> Result<(), SnacRequest>;

    /// 连接收到 ServerReady 后调用
    async fn register_snac_families(&self, _families: &SnacFamilySet) {}

    /// 没有被连接处理的推送命令
    async fn unhandled_snac(&self, command: SnacCommand) {
        debug!(
            "unhandled snac {:04x}/{:04x}",
            command.family, command.subtype
        );
    }
}

/// 只有一条连接的会话
pub struct StandaloneSupervisor {
    jid: Jid,
}

impl StandaloneSupervisor {
    /// jid 为用户的 full jid
    pub fn new(jid: Jid) -> Self {
        Self { jid }
    }
}

#[async_trait]
impl SessionSupervisor for StandaloneSupervisor {
    fn jid(&self) -> Jid {
        self.jid.to_bare()
    }

    fn jid_with_highest_priority(&self) -> Jid {
        self.jid.clone()
    }

    async fn handle_request(&self, request: SnacRequest) -> Result<(), SnacRequest> {
        Err(request)
    }

    async fn register_snac_families(&self, families: &SnacFamilySet) {
        info!("{} families available on this connection", families.len());
    }
}

/// 只打印日志的出口
pub struct EgressLog;

#[async_trait]
impl XmppEgress for EgressLog {
    async fn send(&self, stanza: Stanza) -> Result<(), EgressError> {
        info!("{}", stanza.to_xml()?);
        Ok(())
    }
}
