//! 网关向 xmpp 一侧发出的节
//! 只包含 presence 和 message 两种，路由由 XmppEgress 的实现负责

use std::{fmt, io, str::FromStr, sync::Arc};

use quick_xml::{
    events::{BytesEnd, BytesStart, BytesText, Event},
    Writer,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid jid: {0}")]
    InvalidJid(String),
    #[error("Xml write error: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("I/O: {0}")]
    IO(#[from] io::Error),
    #[error("Xml output is not utf-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// xmpp 地址 node@domain/resource
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Jid {
    node: Option<String>,
    domain: String,
    resource: Option<String>,
}

impl Jid {
    pub fn new(node: Option<&str>, domain: &str, resource: Option<&str>) -> Self {
        Self {
            node: node.map(Into::into),
            domain: domain.into(),
            resource: resource.map(Into::into),
        }
    }

    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    /// 去掉资源部分
    pub fn to_bare(&self) -> Jid {
        Jid {
            node: self.node.clone(),
            domain: self.domain.clone(),
            resource: None,
        }
    }
}

impl FromStr for Jid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (bare, resource) = match s.split_once('/') {
            Some((bare, resource)) => (bare, Some(resource)),
            None => (s, None),
        };
        let (node, domain) = match bare.split_once('@') {
            Some((node, domain)) => (Some(node), domain),
            None => (None, bare),
        };

        let empty = |part: Option<&str>| matches!(part, Some(p) if p.is_empty());
        if domain.is_empty() || empty(node) || empty(resource) {
            return Err(Error::InvalidJid(s.into()));
        }
        Ok(Jid::new(node, domain, resource))
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(node) = &self.node {
            write!(f, "{}@", node)?;
        }
        f.write_str(&self.domain)?;
        if let Some(resource) = &self.resource {
            write!(f, "/{}", resource)?;
        }
        Ok(())
    }
}

/// 把 OSCAR 屏幕名转换为网关域下的 jid
pub type IdToJid = Arc<dyn Fn(&str) -> Jid + Send + Sync>;

/// 默认的转换方式：去掉空格，转小写，'@' 替换为 '%'
pub fn transport_mapper(domain: &str) -> IdToJid {
    let domain = domain.to_string();
    Arc::new(move |screen_name: &str| {
        let node = screen_name
            .chars()
            .filter(|c| !c.is_whitespace())
            .map(|c| if c == '@' { '%' } else { c.to_ascii_lowercase() })
            .collect::<String>();
        Jid::new(Some(&node), &domain, None)
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceType {
    Available,
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Show {
    Away,
    Chat,
    Dnd,
    Xa,
}

impl Show {
    fn as_str(&self) -> &'static str {
        match self {
            Show::Away => "away",
            Show::Chat => "chat",
            Show::Dnd => "dnd",
            Show::Xa => "xa",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Presence {
    pub to: Jid,
    pub from: Jid,
    pub presence_type: PresenceType,
    pub show: Option<Show>,
    pub status: Option<String>,
}

impl Presence {
    pub fn available(to: Jid, from: Jid) -> Self {
        Self {
            to,
            from,
            presence_type: PresenceType::Available,
            show: None,
            status: None,
        }
    }

    pub fn unavailable(to: Jid, from: Jid) -> Self {
        Self {
            presence_type: PresenceType::Unavailable,
            ..Self::available(to, from)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Chat,
    Normal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub to: Jid,
    pub from: Jid,
    pub message_type: MessageType,
    pub body: String,
}

impl Message {
    pub fn chat(to: Jid, from: Jid, body: String) -> Self {
        Self {
            to,
            from,
            message_type: MessageType::Chat,
            body,
        }
    }
}

/// 交给 XmppEgress 的节
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stanza {
    Presence(Presence),
    Message(Message),
}

impl Stanza {
    pub fn to(&self) -> &Jid {
        match self {
            Stanza::Presence(p) => &p.to,
            Stanza::Message(m) => &m.to,
        }
    }

    pub fn to_xml(&self) -> Result<String, Error> {
        let mut writer = Writer::new(Vec::new());
        match self {
            Stanza::Presence(presence) => {
                let mut children = Vec::new();
                if let Some(show) = presence.show {
                    children.push(("show", show.as_str()));
                }
                if let Some(status) = &presence.status {
                    children.push(("status", status.as_str()));
                }
                let kind = match presence.presence_type {
                    PresenceType::Available => None,
                    PresenceType::Unavailable => Some("unavailable"),
                };
                write_element(
                    &mut writer,
                    "presence",
                    kind,
                    &presence.to,
                    &presence.from,
                    &children,
                )?;
            }
            Stanza::Message(message) => {
                let kind = match message.message_type {
                    MessageType::Chat => "chat",
                    MessageType::Normal => "normal",
                };
                write_element(
                    &mut writer,
                    "message",
                    Some(kind),
                    &message.to,
                    &message.from,
                    &[("body", message.body.as_str())],
                )?;
            }
        }
        Ok(String::from_utf8(writer.into_inner())?)
    }
}

impl fmt::Display for Stanza {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let xml = self.to_xml().map_err(|_| fmt::Error)?;
        f.write_str(&xml)
    }
}

/// 写出一个带 type/to/from 属性和若干文本子元素的节
fn write_element(
    writer: &mut Writer<Vec<u8>>,
    name: &str,
    kind: Option<&str>,
    to: &Jid,
    from: &Jid,
    children: &[(&str, &str)],
) -> Result<(), Error> {
    let to = to.to_string();
    let from = from.to_string();
    let mut start = BytesStart::new(name);
    if let Some(kind) = kind {
        start.push_attribute(("type", kind));
    }
    start.push_attribute(("to", to.as_str()));
    start.push_attribute(("from", from.as_str()));

    if children.is_empty() {
        writer.write_event(Event::Empty(start))?;
        return Ok(());
    }

    writer.write_event(Event::Start(start))?;
    for (child, text) in children {
        writer.write_event(Event::Start(BytesStart::new(*child)))?;
        writer.write_event(Event::Text(BytesText::new(text)))?;
        writer.write_event(Event::End(BytesEnd::new(*child)))?;
    }
    writer.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jid(s: &str) -> Jid {
        s.parse().unwrap()
    }

    #[test]
    fn jid_parsing_works() {
        let full = jid("user@xmpp/desktop");
        assert_eq!(full.node(), Some("user"));
        assert_eq!(full.domain(), "xmpp");
        assert_eq!(full.resource(), Some("desktop"));
        assert_eq!(full.to_bare().to_string(), "user@xmpp");
        assert_eq!(jid("oscar.gw").to_string(), "oscar.gw");

        assert!("@xmpp".parse::<Jid>().is_err());
        assert!("user@".parse::<Jid>().is_err());
        assert!("user@xmpp/".parse::<Jid>().is_err());
    }

    #[test]
    fn screen_name_mapping() {
        let mapper = transport_mapper("oscar.gw");
        assert_eq!(mapper("alice").to_string(), "alice@oscar.gw");
        assert_eq!(mapper("Bob Smith").to_string(), "bobsmith@oscar.gw");
        assert_eq!(mapper("me@mac.com").to_string(), "me%mac.com@oscar.gw");
    }

    #[test]
    fn presence_xml() {
        let mut presence = Presence::available(jid("user@xmpp"), jid("alice@oscar.gw"));
        presence.status = Some("hi".into());
        assert_eq!(
            Stanza::Presence(presence).to_xml().unwrap(),
            r#"<presence to="user@xmpp" from="alice@oscar.gw"><status>hi</status></presence>"#
        );

        let offline = Presence::unavailable(jid("user@xmpp"), jid("alice@oscar.gw"));
        assert_eq!(
            Stanza::Presence(offline).to_string(),
            r#"<presence type="unavailable" to="user@xmpp" from="alice@oscar.gw"/>"#
        );
    }

    #[test]
    fn message_xml_is_escaped() {
        let message = Message::chat(
            jid("user@xmpp/desktop"),
            jid("carol@oscar.gw"),
            "a < b & c".into(),
        );
        assert_eq!(
            Stanza::Message(message).to_xml().unwrap(),
            r#"<message type="chat" to="user@xmpp/desktop" from="carol@oscar.gw"><body>a &lt; b &amp; c</body></message>"#
        );
    }
}
