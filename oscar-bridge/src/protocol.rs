//! 协议层
//! 处理 OSCAR 协议相关的逻辑，不做任何网络读写
//! 网络层把读到的帧交给 Connection，再把 Connection 产生的帧写出去

use std::fmt;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::{network::packet::SnacCommand, xmpp::Jid};

pub use capability::SnacFamilySet;
pub(crate) use connection::Connection;
pub use connection::{Phase, Settings, DEFAULT_HIGH_WATER_MARK, DEFAULT_REQUEST_DEADLINE};
pub use presence::BuddyRecord;
pub use rendezvous::{
    Capability, DefaultRvCommandFactory, NewRvSessionListener, RecvRvEvent, RvCommand,
    RvCommandFactory, RvEvent, RvSession, RvSessionKey, RvSessionListener, RvSnacResponseEvent,
};

mod capability;
mod connection;
mod dispatcher;
mod presence;
mod rate;
mod rendezvous;

/// 一条连接内的 SNAC 请求 id
pub type RequestId = u32;

/// 请求结果回调，收到响应或请求失败时调用一次
pub type SnacListener = Box<dyn FnOnce(Result<SnacCommand, RequestError>) + Send>;

/// 未被本连接处理的主动推送命令的回调
pub type SnacHandler = Box<dyn FnMut(&SnacCommand) + Send>;

/// 请求失败原因，通过 SnacListener 或同步返回值交给调用方
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("Transport closed")]
    TransportClosed,
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Request timeout")]
    Timeout,
    #[error("Request cancelled")]
    Cancelled,
    #[error("Rate class queue is full")]
    RateBackpressure,
    #[error("No connection supports this snac family")]
    UnsupportedFamily,
    #[error("Rendezvous session not found")]
    SessionNotFound,
    #[error("Snac body does not fit in one flap frame")]
    PayloadTooLarge,
}

/// 登录服务器分配的 cookie，不透明
#[derive(Clone, PartialEq, Eq)]
pub struct AuthCookie(Bytes);

impl AuthCookie {
    pub fn new(cookie: impl Into<Bytes>) -> Self {
        Self(cookie.into())
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.0
    }
}

impl fmt::Debug for AuthCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthCookie({} bytes)", self.0.len())
    }
}

/// 一个 SNAC 请求以及它的结果回调
pub struct SnacRequest {
    pub command: SnacCommand,
    pub listener: Option<SnacListener>,
}

impl SnacRequest {
    pub fn new(command: SnacCommand, listener: Option<SnacListener>) -> Self {
        Self { command, listener }
    }

    /// 以失败结束这个请求
    pub fn fail(self, error: RequestError) {
        if let Some(listener) = self.listener {
            listener(Err(error))
        }
    }
}

impl fmt::Debug for SnacRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnacRequest")
            .field("command", &self.command)
            .field("listener", &self.listener.is_some())
            .finish()
    }
}

/// 请求的去向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// 已写入本连接
    Sent(RequestId),
    /// 在限速队列中等待
    Queued(RequestId),
    /// 交给了会话层
    Delegated,
}

impl Route {
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Route::Sent(id) | Route::Queued(id) => Some(*id),
            Route::Delegated => None,
        }
    }
}

/// ConnectionHandle 发给连接事件循环的指令
pub(crate) enum Command {
    Request {
        command: SnacCommand,
        listener: Option<SnacListener>,
        reply: oneshot::Sender<Result<Route, RequestError>>,
    },
    /// 强制交给会话层路由
    DispatchRequest {
        request: SnacRequest,
        reply: oneshot::Sender<Result<Route, RequestError>>,
    },
    Cancel {
        request_id: RequestId,
        reply: oneshot::Sender<bool>,
    },
    ClientReady {
        reply: oneshot::Sender<bool>,
    },
    /// 连接阶段以及 ClientReady 是否已发送
    State {
        reply: oneshot::Sender<(Phase, bool)>,
    },
    RegisterHandler {
        family: u16,
        subtype: Option<u16>,
        handler: SnacHandler,
    },
    GetAndSendStatus {
        screen_name: String,
    },
    GetAndSendAllStatuses {
        jid: Jid,
    },
    OnNewRvSession {
        listener: NewRvSessionListener,
    },
    SendRv {
        session: RvSessionKey,
        status: u16,
        payload: Bytes,
        reply: oneshot::Sender<Result<Route, RequestError>>,
    },
    Disconnect,
}
