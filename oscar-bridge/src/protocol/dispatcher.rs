use std::collections::{HashMap, VecDeque};

use log::debug;
use tokio::time::Instant;

use crate::network::packet::SnacCommand;

use super::{RequestError, RequestId, SnacHandler, SnacListener};

/// 记住最近放弃的请求 id，用于丢弃迟到的响应
const ABANDONED_CAPACITY: usize = 256;

/// 等待响应的请求
pub(crate) struct Pending {
    listener: Option<SnacListener>,
    deadline: Instant,
}

impl Pending {
    /// 调用回调，没有回调的请求直接丢弃
    pub(crate) fn complete(self, result: Result<SnacCommand, RequestError>) {
        if let Some(listener) = self.listener {
            listener(result)
        }
    }
}

/// 请求 id 分配，响应关联，主动推送命令的路由
pub(crate) struct SnacDispatcher {
    /// 上一次分配的 id
    last_id: RequestId,
    /// 关联表 key = request id
    pending: HashMap<RequestId, Pending>,
    /// 超时或取消的请求 id，按放弃顺序排列
    abandoned: VecDeque<RequestId>,
    /// key = (family, subtype)，subtype 为 None 时匹配整个 family
    handlers: HashMap<(u16, Option<u16>), SnacHandler>,
}

impl SnacDispatcher {
    pub(crate) fn new() -> Self {
        Self::starting_at(0)
    }

    fn starting_at(last_id: RequestId) -> Self {
        Self {
            last_id,
            pending: HashMap::new(),
            abandoned: VecDeque::new(),
            handlers: HashMap::new(),
        }
    }

    /// 下一个请求 id，不登记
    /// id 单调递增，跳过 0 以及回绕后仍在等待响应的 id
    pub(crate) fn next_id(&mut self) -> RequestId {
        loop {
            self.last_id = self.last_id.wrapping_add(1);
            if self.last_id != 0 && !self.pending.contains_key(&self.last_id) {
                return self.last_id;
            }
        }
    }

    /// 分配一个新的请求 id 并登记回调
    pub(crate) fn allocate(&mut self, listener: Option<SnacListener>, deadline: Instant) -> RequestId {
        let id = self.next_id();
        self.pending.insert(id, Pending { listener, deadline });
        id
    }

    /// 收到响应，移出关联表
    pub(crate) fn take(&mut self, request_id: RequestId) -> Option<Pending> {
        self.pending.remove(&request_id)
    }

    /// 移出关联表且不记为放弃，用于没能提交的请求
    pub(crate) fn forget(&mut self, request_id: RequestId) -> Option<Pending> {
        self.pending.remove(&request_id)
    }

    pub(crate) fn cancel(&mut self, request_id: RequestId) -> Option<Pending> {
        let pending = self.pending.remove(&request_id)?;
        self.abandon(request_id);
        Some(pending)
    }

    /// 是否是已超时或已取消请求的迟到响应
    pub(crate) fn is_abandoned(&self, request_id: RequestId) -> bool {
        self.abandoned.contains(&request_id)
    }

    fn abandon(&mut self, request_id: RequestId) {
        if self.abandoned.len() == ABANDONED_CAPACITY {
            self.abandoned.pop_front();
        }
        self.abandoned.push_back(request_id);
    }

    /// 移出所有到期的请求
    pub(crate) fn expire(&mut self, now: Instant) -> Vec<(RequestId, Pending)> {
        let mut expired = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();
        expired.sort_unstable();

        let mut result = Vec::with_capacity(expired.len());
        for id in expired {
            if let Some(pending) = self.pending.remove(&id) {
                self.abandon(id);
                result.push((id, pending));
            }
        }
        result
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|pending| pending.deadline).min()
    }

    /// 连接关闭，取出所有等待中的请求
    pub(crate) fn drain(&mut self) -> Vec<(RequestId, Pending)> {
        let mut drained = self.pending.drain().collect::<Vec<_>>();
        drained.sort_unstable_by_key(|(id, _)| *id);
        drained
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn is_pending(&self, request_id: RequestId) -> bool {
        self.pending.contains_key(&request_id)
    }

    pub(crate) fn register_handler(&mut self, family: u16, subtype: Option<u16>, handler: SnacHandler) {
        self.handlers.insert((family, subtype), handler);
    }

    /// 交给注册的处理函数，没有处理函数时原样返回
    pub(crate) fn route(&mut self, command: SnacCommand) -> Option<SnacCommand> {
        let exact = (command.family, Some(command.subtype));
        let key = if self.handlers.contains_key(&exact) {
            exact
        } else {
            (command.family, None)
        };
        let handler = match self.handlers.get_mut(&key) {
            Some(handler) => handler,
            None => return Some(command),
        };
        debug!(
            "route snac {:04x}/{:04x} to registered handler",
            command.family, command.subtype
        );
        handler(&command);
        None
    }
}
