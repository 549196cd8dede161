//! rendezvous 会话
//! 通道 2 的 icbm 按 (cookie, 对方, 能力) 归入会话，负载对本连接不透明

use std::collections::HashMap;

use bytes::Bytes;
use log::{debug, info};

use crate::network::packet::{
    snac::{IcbmCookie, RecvRvIcbm, RvData, SendRvIcbm, UserInfo},
    Snac, SnacCommand,
};

use super::{presence::normalize, RequestError, RequestId};

/// 常见的能力 GUID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Chat,
    DirectIm,
    FileTransfer,
    GetFile,
    BuddyIcon,
    SendBuddyList,
    Unknown([u8; 16]),
}

const fn guid(prefix: [u8; 4]) -> [u8; 16] {
    [
        prefix[0], prefix[1], prefix[2], prefix[3], 0x4c, 0x7f, 0x11, 0xd1, 0x82, 0x22, 0x44, 0x45,
        0x53, 0x54, 0x00, 0x00,
    ]
}

const CHAT: [u8; 16] = [
    0x74, 0x8f, 0x24, 0x20, 0x62, 0x87, 0x11, 0xd1, 0x82, 0x22, 0x44, 0x45, 0x53, 0x54, 0x00, 0x00,
];
const DIRECT_IM: [u8; 16] = guid([0x09, 0x46, 0x13, 0x45]);
const FILE_TRANSFER: [u8; 16] = guid([0x09, 0x46, 0x13, 0x43]);
const GET_FILE: [u8; 16] = guid([0x09, 0x46, 0x13, 0x48]);
const BUDDY_ICON: [u8; 16] = guid([0x09, 0x46, 0x13, 0x46]);
const SEND_BUDDY_LIST: [u8; 16] = guid([0x09, 0x46, 0x13, 0x4b]);

impl Capability {
    pub fn from_guid(guid: [u8; 16]) -> Self {
        match guid {
            CHAT => Capability::Chat,
            DIRECT_IM => Capability::DirectIm,
            FILE_TRANSFER => Capability::FileTransfer,
            GET_FILE => Capability::GetFile,
            BUDDY_ICON => Capability::BuddyIcon,
            SEND_BUDDY_LIST => Capability::SendBuddyList,
            other => Capability::Unknown(other),
        }
    }

    pub fn guid(&self) -> [u8; 16] {
        match self {
            Capability::Chat => CHAT,
            Capability::DirectIm => DIRECT_IM,
            Capability::FileTransfer => FILE_TRANSFER,
            Capability::GetFile => GET_FILE,
            Capability::BuddyIcon => BUDDY_ICON,
            Capability::SendBuddyList => SEND_BUDDY_LIST,
            Capability::Unknown(guid) => *guid,
        }
    }
}

/// 会话标识，屏幕名已规范化
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RvSessionKey {
    pub cookie: IcbmCookie,
    pub peer: String,
    pub capability: Capability,
}

impl RvSessionKey {
    pub fn new(cookie: IcbmCookie, peer: &str, capability: Capability) -> Self {
        Self {
            cookie,
            peer: normalize(peer),
            capability,
        }
    }
}

/// 由 RvCommandFactory 解出的子协议命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RvCommand {
    pub capability: Capability,
    pub status: u16,
    pub data: Bytes,
}

/// 把 rendezvous 负载交给上层的子协议实现
pub trait RvCommandFactory: Send {
    /// 不认识的负载返回 None
    fn create(&self, rv: &RvData) -> Option<RvCommand>;
}

/// 识别常见能力，其余作为 Unknown 携带
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultRvCommandFactory;

impl RvCommandFactory for DefaultRvCommandFactory {
    fn create(&self, rv: &RvData) -> Option<RvCommand> {
        Some(RvCommand {
            capability: Capability::from_guid(rv.capability),
            status: rv.status,
            data: rv.payload.clone(),
        })
    }
}

/// 对方发来的 rendezvous
#[derive(Debug, Clone)]
pub struct RecvRvEvent {
    pub session: RvSessionKey,
    pub sender: UserInfo,
    pub rv: RvData,
    pub command: Option<RvCommand>,
}

/// 本端在会话上发出的请求的结果
#[derive(Debug, Clone)]
pub struct RvSnacResponseEvent {
    pub session: RvSessionKey,
    pub request_id: RequestId,
    pub result: Result<SnacCommand, RequestError>,
}

#[derive(Debug)]
pub enum RvEvent<'a> {
    Recv(&'a RecvRvEvent),
    SnacResponse(&'a RvSnacResponseEvent),
}

pub type RvSessionListener = Box<dyn FnMut(&RvEvent<'_>) + Send>;

/// 新会话建立时调用，通常在这里给会话注册 RvSessionListener
pub type NewRvSessionListener = Box<dyn FnMut(&mut RvSession) + Send>;

pub struct RvSession {
    key: RvSessionKey,
    /// 按收到时的原样保存
    peer: String,
    listeners: Vec<RvSessionListener>,
}

impl RvSession {
    fn new(key: RvSessionKey, peer: &str) -> Self {
        Self {
            key,
            peer: peer.to_string(),
            listeners: Vec::new(),
        }
    }

    pub fn key(&self) -> &RvSessionKey {
        &self.key
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn capability(&self) -> Capability {
        self.key.capability
    }

    pub fn add_listener(&mut self, listener: RvSessionListener) {
        self.listeners.push(listener);
    }

    fn notify(&mut self, event: RvEvent<'_>) {
        for listener in self.listeners.iter_mut() {
            listener(&event);
        }
    }
}

pub(crate) struct RendezvousRouter {
    sessions: HashMap<RvSessionKey, RvSession>,
    new_session_listeners: Vec<NewRvSessionListener>,
    /// 在途请求属于哪个会话
    requests: HashMap<RequestId, RvSessionKey>,
    factory: Box<dyn RvCommandFactory>,
}

impl RendezvousRouter {
    pub(crate) fn new(factory: Box<dyn RvCommandFactory>) -> Self {
        Self {
            sessions: HashMap::new(),
            new_session_listeners: Vec::new(),
            requests: HashMap::new(),
            factory,
        }
    }

    pub(crate) fn on_new_session(&mut self, listener: NewRvSessionListener) {
        self.new_session_listeners.push(listener);
    }

    fn open(&mut self, key: RvSessionKey, peer: &str) -> &mut RvSession {
        let listeners = &mut self.new_session_listeners;
        self.sessions.entry(key).or_insert_with_key(|key| {
            info!(
                "new rendezvous session with {} for {:?}",
                peer, key.capability
            );
            let mut session = RvSession::new(key.clone(), peer);
            for listener in listeners.iter_mut() {
                listener(&mut session);
            }
            session
        })
    }

    /// 对方发来的 rendezvous，取消状态会在通知后关闭会话
    pub(crate) fn handle_inbound(&mut self, icbm: RecvRvIcbm) {
        let key = RvSessionKey::new(
            icbm.rv.cookie,
            &icbm.sender.screen_name,
            Capability::from_guid(icbm.rv.capability),
        );
        let cancelled = icbm.rv.status == RvData::STATUS_CANCEL;
        let event = RecvRvEvent {
            session: key.clone(),
            command: self.factory.create(&icbm.rv),
            sender: icbm.sender,
            rv: icbm.rv,
        };

        let peer = event.sender.screen_name.clone();
        self.open(key.clone(), &peer).notify(RvEvent::Recv(&event));
        if cancelled {
            debug!("rendezvous session with {} cancelled by peer", peer);
            self.close(&key);
        }
    }

    /// 构造会话上要发送的命令，不修改会话表
    /// 请求状态允许会话还不存在，其他状态要求会话已存在
    pub(crate) fn prepare_send(
        &self,
        key: &RvSessionKey,
        status: u16,
        payload: Bytes,
    ) -> Result<SnacCommand, RequestError> {
        let peer = match self.sessions.get(key) {
            Some(session) => session.peer.clone(),
            None if status == RvData::STATUS_REQUEST => key.peer.clone(),
            None => return Err(RequestError::SessionNotFound),
        };
        let icbm = SendRvIcbm {
            cookie: key.cookie,
            screen_name: peer,
            rv: RvData {
                status,
                cookie: key.cookie,
                capability: key.capability.guid(),
                payload,
            },
        };
        Ok(Snac::SendRv(icbm).encode())
    }

    /// 命令已交给连接发送
    /// 请求状态在需要时新建会话，取消状态关闭会话
    pub(crate) fn sent(&mut self, key: &RvSessionKey, status: u16, request_id: Option<RequestId>) {
        if status == RvData::STATUS_CANCEL {
            if self.close(key) {
                debug!("rendezvous session with {} cancelled locally", key.peer);
            }
            return;
        }
        self.open(key.clone(), &key.peer);
        if let Some(request_id) = request_id {
            self.requests.insert(request_id, key.clone());
        }
    }

    /// 把请求结果交给会话，不是 rendezvous 请求时返回 false
    pub(crate) fn deliver_response(
        &mut self,
        request_id: RequestId,
        result: Result<SnacCommand, RequestError>,
    ) -> bool {
        let key = match self.requests.remove(&request_id) {
            Some(key) => key,
            None => return false,
        };
        let event = RvSnacResponseEvent {
            session: key.clone(),
            request_id,
            result,
        };
        match self.sessions.get_mut(&key) {
            Some(session) => session.notify(RvEvent::SnacResponse(&event)),
            None => debug!("rendezvous response {} for a closed session", request_id),
        }
        true
    }

    pub(crate) fn close(&mut self, key: &RvSessionKey) -> bool {
        self.sessions.remove(key).is_some()
    }

    #[cfg(test)]
    pub(crate) fn session(&self, key: &RvSessionKey) -> Option<&RvSession> {
        self.sessions.get(key)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.sessions.len()
    }

    /// 连接关闭
    pub(crate) fn close_all(&mut self) {
        self.sessions.clear();
        self.requests.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    fn recv(status: u16) -> RecvRvIcbm {
        RecvRvIcbm {
            cookie: [7; 8],
            sender: UserInfo::new("Dave"),
            rv: RvData {
                status,
                cookie: [7; 8],
                capability: FILE_TRANSFER,
                payload: Bytes::from_static(b"opaque"),
            },
        }
    }

    /// 每个新会话注册一个记录事件的监听器
    fn recording_router() -> (RendezvousRouter, Arc<Mutex<Vec<String>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut router = RendezvousRouter::new(Box::new(DefaultRvCommandFactory));
        let sink = events.clone();
        router.on_new_session(Box::new(move |session: &mut RvSession| {
            sink.lock().unwrap().push(format!("new {}", session.peer()));
            let sink = sink.clone();
            session.add_listener(Box::new(move |event: &RvEvent<'_>| {
                let line = match event {
                    RvEvent::Recv(recv) => format!("recv {}", recv.rv.status),
                    RvEvent::SnacResponse(resp) => {
                        format!("response {} {}", resp.request_id, resp.result.is_ok())
                    }
                };
                sink.lock().unwrap().push(line);
            }));
        }));
        (router, events)
    }

    #[test]
    fn capability_guids() {
        assert_eq!(Capability::from_guid(FILE_TRANSFER), Capability::FileTransfer);
        assert_eq!(Capability::from_guid(CHAT), Capability::Chat);
        assert_eq!(Capability::DirectIm.guid(), DIRECT_IM);
        let other = [0xaa; 16];
        assert_eq!(Capability::from_guid(other), Capability::Unknown(other));
    }

    #[test]
    fn inbound_opens_session_and_cancel_closes_it() {
        let (mut router, events) = recording_router();
        router.handle_inbound(recv(RvData::STATUS_REQUEST));
        router.handle_inbound(recv(RvData::STATUS_ACCEPT));
        assert_eq!(router.len(), 1);

        let key = RvSessionKey::new([7; 8], "dave", Capability::FileTransfer);
        assert_eq!(router.session(&key).unwrap().peer(), "Dave");

        router.handle_inbound(recv(RvData::STATUS_CANCEL));
        assert_eq!(router.len(), 0);
        assert_eq!(
            *events.lock().unwrap(),
            vec!["new Dave", "recv 0", "recv 2", "recv 1"]
        );
    }

    #[test]
    fn responses_reach_the_session() {
        let (mut router, events) = recording_router();
        router.handle_inbound(recv(RvData::STATUS_REQUEST));
        let key = RvSessionKey::new([7; 8], "Dave", Capability::FileTransfer);

        let command = router
            .prepare_send(&key, RvData::STATUS_ACCEPT, Bytes::new())
            .unwrap();
        assert_eq!(command.key(), (0x0004, 0x0006));
        match Snac::decode(&command).unwrap() {
            Some(Snac::SendRv(send)) => {
                assert_eq!(send.screen_name, "Dave");
                assert_eq!(send.rv.status, RvData::STATUS_ACCEPT);
                assert_eq!(send.rv.capability, FILE_TRANSFER);
            }
            other => panic!("unexpected snac {:?}", other),
        }

        router.sent(&key, RvData::STATUS_ACCEPT, Some(9));
        assert!(router.deliver_response(9, Err(RequestError::Timeout)));
        assert!(!router.deliver_response(9, Err(RequestError::Timeout)));
        assert_eq!(events.lock().unwrap().last().unwrap(), "response 9 false");
    }

    #[test]
    fn send_on_missing_session() {
        let (mut router, events) = recording_router();
        let key = RvSessionKey::new([1; 8], "erin", Capability::DirectIm);
        assert_eq!(
            router.prepare_send(&key, RvData::STATUS_ACCEPT, Bytes::new()),
            Err(RequestError::SessionNotFound)
        );
        assert!(router
            .prepare_send(&key, RvData::STATUS_REQUEST, Bytes::new())
            .is_ok());
        assert_eq!(router.len(), 0);

        router.sent(&key, RvData::STATUS_REQUEST, Some(4));
        assert_eq!(router.len(), 1);
        assert_eq!(*events.lock().unwrap(), vec!["new erin"]);
    }

    #[test]
    fn local_cancel_closes_session() {
        let (mut router, events) = recording_router();
        router.handle_inbound(recv(RvData::STATUS_REQUEST));
        let key = RvSessionKey::new([7; 8], "Dave", Capability::FileTransfer);

        assert!(router
            .prepare_send(&key, RvData::STATUS_CANCEL, Bytes::new())
            .is_ok());
        router.sent(&key, RvData::STATUS_CANCEL, Some(5));
        assert_eq!(router.len(), 0);
        assert!(!router.deliver_response(5, Ok(SnacCommand::new(4, 0x000c, Bytes::new()))));
        assert_eq!(
            router.prepare_send(&key, RvData::STATUS_ACCEPT, Bytes::new()),
            Err(RequestError::SessionNotFound)
        );
        assert_eq!(*events.lock().unwrap(), vec!["new Dave", "recv 0"]);
    }
}
