use crate::{config, network, protocol::RequestError, xmpp};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Network error: {0}")]
    Network(#[from] network::Error),
    #[error("Config error: {0}")]
    Config(#[from] config::Error),
    #[error("Request error: {0}")]
    Request(#[from] RequestError),
    #[error("Connection task has exited")]
    ConnectionGone,
}

/// XmppEgress 发送失败，只记录日志
#[derive(Debug, thiserror::Error)]
pub enum EgressError {
    #[error("Stanza rejected: {0}")]
    Rejected(String),
    #[error("Xmpp error: {0}")]
    Xmpp(#[from] xmpp::Error),
}
