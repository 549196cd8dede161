//! 好友状态缓存
//! 缓存中有记录等价于好友在线，OSCAR 事件在这里转换为 xmpp 节

use std::collections::HashMap;

use log::debug;

use crate::{
    html::strip_html,
    network::packet::snac::{ExtraInfoBlock, RecvImIcbm, UserInfo},
    xmpp::{IdToJid, Jid, Message, Presence, Show, Stanza},
};

/// 屏幕名比较时忽略 ASCII 大小写和空格
pub(crate) fn normalize(screen_name: &str) -> String {
    screen_name
        .chars()
        .filter(|c| *c != ' ')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// 一个在线好友
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuddyRecord {
    /// 按收到时的原样保存
    pub screen_name: String,
    pub away: bool,
    pub status_text: Option<String>,
    pub extra_blocks: Vec<ExtraInfoBlock>,
}

impl BuddyRecord {
    fn from_info(info: &UserInfo) -> Self {
        Self {
            screen_name: info.screen_name.clone(),
            away: info.away(),
            status_text: status_text(&info.extra_info),
            extra_blocks: info.extra_info.clone(),
        }
    }
}

/// 第一个能解码为非空 utf-8 的文字状态
fn status_text(blocks: &[ExtraInfoBlock]) -> Option<String> {
    blocks
        .iter()
        .filter(|block| block.kind == ExtraInfoBlock::TYPE_AVAIL_MESSAGE)
        .find_map(|block| match block.avail_text() {
            Ok(text) if !text.is_empty() => Some(text),
            Ok(_) => None,
            Err(e) => {
                debug!("skip undecodable status message block: {}", e);
                None
            }
        })
}

pub(crate) struct PresenceBridge {
    /// key = 规范化后的屏幕名
    buddies: HashMap<String, BuddyRecord>,
    id_to_jid: IdToJid,
}

impl PresenceBridge {
    pub(crate) fn new(id_to_jid: IdToJid) -> Self {
        Self {
            buddies: HashMap::new(),
            id_to_jid,
        }
    }

    fn presence(&self, record: &BuddyRecord, to: &Jid) -> Stanza {
        let mut presence = Presence::available(to.clone(), (self.id_to_jid)(&record.screen_name));
        if record.away {
            presence.show = Some(Show::Away);
        }
        presence.status = record.status_text.clone();
        Stanza::Presence(presence)
    }

    fn unavailable(&self, screen_name: &str, to: &Jid) -> Stanza {
        Stanza::Presence(Presence::unavailable(
            to.clone(),
            (self.id_to_jid)(screen_name),
        ))
    }

    /// 好友上线或状态变化
    pub(crate) fn update(&mut self, info: &UserInfo, to: &Jid) -> Stanza {
        let record = BuddyRecord::from_info(info);
        let stanza = self.presence(&record, to);
        self.buddies.insert(normalize(&record.screen_name), record);
        stanza
    }

    /// 好友下线
    pub(crate) fn remove(&mut self, screen_name: &str, to: &Jid) -> Stanza {
        let screen_name = match self.buddies.remove(&normalize(screen_name)) {
            Some(record) => record.screen_name,
            None => screen_name.to_string(),
        };
        self.unavailable(&screen_name, to)
    }

    /// 缓存中没有时返回 unavailable
    pub(crate) fn status(&self, screen_name: &str, to: &Jid) -> Stanza {
        match self.buddies.get(&normalize(screen_name)) {
            Some(record) => self.presence(record, to),
            None => self.unavailable(screen_name, to),
        }
    }

    pub(crate) fn all_statuses(&self, to: &Jid) -> Vec<Stanza> {
        self.buddies
            .values()
            .map(|record| self.presence(record, to))
            .collect()
    }

    /// 即时消息转换为 chat 消息
    pub(crate) fn message(&self, im: &RecvImIcbm, to: Jid) -> Stanza {
        let body = strip_html(&im.message.text());
        Stanza::Message(Message::chat(
            to,
            (self.id_to_jid)(&im.sender.screen_name),
            body,
        ))
    }

    #[cfg(test)]
    pub(crate) fn buddy(&self, screen_name: &str) -> Option<&BuddyRecord> {
        self.buddies.get(&normalize(screen_name))
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.buddies.len()
    }
}
