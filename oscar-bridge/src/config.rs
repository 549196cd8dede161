use std::{net::SocketAddr, time::Duration};

use tokio::{fs, io};

use crate::{
    protocol::{AuthCookie, Settings, DEFAULT_HIGH_WATER_MARK, DEFAULT_REQUEST_DEADLINE},
    xmpp::transport_mapper,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O: {0}")]
    IO(#[from] io::Error),
    #[error("Toml error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Neither server.addr nor server.host is set")]
    MissingServer,
    #[error("connection.keepalive_interval must be at least 1 second")]
    ZeroKeepalive,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    pub server: Server,
    #[serde(default)]
    pub connection: Connection,
    pub transport: Transport,
}

/// OSCAR 服务器地址，addr 优先于 host/port
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Server {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub addr: Option<SocketAddr>,
}

/// 时间单位都是秒
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Connection {
    #[serde(default = "default_request_deadline")]
    pub request_deadline: u64,
    #[serde(default = "default_high_water_mark")]
    pub high_water_mark: usize,
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval: u64,
}

impl Default for Connection {
    fn default() -> Self {
        Self {
            request_deadline: default_request_deadline(),
            high_water_mark: default_high_water_mark(),
            keepalive_interval: default_keepalive_interval(),
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Transport {
    /// 好友 jid 所在的域
    pub domain: String,
}

fn default_port() -> u16 {
    5190
}

fn default_request_deadline() -> u64 {
    DEFAULT_REQUEST_DEADLINE.as_secs()
}

fn default_high_water_mark() -> usize {
    DEFAULT_HIGH_WATER_MARK
}

fn default_keepalive_interval() -> u64 {
    60
}

/// 连接目标
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Host(String, u16),
    Addr(SocketAddr),
}

impl Config {
    pub async fn from_path(path: &str) -> Result<Self, Error> {
        let s = fs::read_to_string(path).await?;
        Self::parse(&s)
    }

    pub fn parse(s: &str) -> Result<Self, Error> {
        let cfg = toml::from_str::<Config>(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// 修改配置后需要重新检查
    pub fn validate(&self) -> Result<(), Error> {
        if self.connection.keepalive_interval == 0 {
            return Err(Error::ZeroKeepalive);
        }
        Ok(())
    }

    pub fn endpoint(&self) -> Result<Endpoint, Error> {
        match (&self.server.addr, &self.server.host) {
            (Some(addr), _) => Ok(Endpoint::Addr(*addr)),
            (None, Some(host)) => Ok(Endpoint::Host(host.clone(), self.server.port)),
            (None, None) => Err(Error::MissingServer),
        }
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.connection.keepalive_interval)
    }

    /// 登录服务器分配的 cookie 每次连接都不同，不放在配置文件中
    pub fn settings(&self, cookie: AuthCookie) -> Settings {
        let mut settings = Settings::new(cookie, transport_mapper(&self.transport.domain));
        settings.request_deadline = Duration::from_secs(self.connection.request_deadline);
        settings.high_water_mark = self.connection.high_water_mark;
        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_applied() {
        let cfg = Config::parse(
            r#"
            [server]
            host = "bos.oscar.example"

            [transport]
            domain = "oscar.gw"
            "#,
        )
        .unwrap();
        assert_eq!(
            cfg.endpoint().unwrap(),
            Endpoint::Host("bos.oscar.example".into(), 5190)
        );
        assert_eq!(cfg.keepalive_interval(), Duration::from_secs(60));

        let settings = cfg.settings(AuthCookie::new(vec![1, 2, 3]));
        assert_eq!(settings.request_deadline, Duration::from_secs(30));
        assert_eq!(settings.high_water_mark, DEFAULT_HIGH_WATER_MARK);
        assert_eq!((settings.id_to_jid)("Some One").to_string(), "someone@oscar.gw");
    }

    #[test]
    fn resolved_address_wins() {
        let cfg = Config::parse(
            r#"
            [server]
            host = "bos.oscar.example"
            addr = "127.0.0.1:5191"

            [connection]
            request_deadline = 5
            high_water_mark = 8

            [transport]
            domain = "oscar.gw"
            "#,
        )
        .unwrap();
        assert_eq!(
            cfg.endpoint().unwrap(),
            Endpoint::Addr("127.0.0.1:5191".parse().unwrap())
        );
        assert_eq!(cfg.connection.high_water_mark, 8);
        assert_eq!(cfg.connection.keepalive_interval, 60);
    }

    #[test]
    fn missing_server() {
        let cfg = Config::parse(
            r#"
            [server]
            [transport]
            domain = "oscar.gw"
            "#,
        )
        .unwrap();
        assert!(matches!(cfg.endpoint(), Err(Error::MissingServer)));
        assert!(Config::parse("[server]").is_err());
    }

    #[test]
    fn zero_keepalive_is_rejected() {
        let result = Config::parse(
            r#"
            [server]
            host = "bos.oscar.example"

            [connection]
            keepalive_interval = 0

            [transport]
            domain = "oscar.gw"
            "#,
        );
        assert!(matches!(result, Err(Error::ZeroKeepalive)));
    }
}
