use std::net::SocketAddr;

use clap::Parser;
use flexi_logger::{FlexiLoggerError, Logger, LoggerHandle};

/// 单连接网关
#[derive(Debug, Parser)]
#[clap(name = "standalone", version)]
pub struct Args {
    /// 配置文件路径
    #[clap(short, long, default_value = "./standalone.toml")]
    pub config: String,
    /// 登录服务器分配的 cookie，十六进制
    #[clap(long)]
    pub cookie: String,
    /// 用户的 full jid
    #[clap(long)]
    pub owner: String,
}

/// OSCAR_BRIDGE_ 开头的环境变量，优先于配置文件
#[derive(Debug, Default, serde::Deserialize)]
pub struct EnvOverrides {
    pub server_addr: Option<SocketAddr>,
    pub keepalive_interval: Option<u64>,
    pub log: Option<String>,
}

impl EnvOverrides {
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("OSCAR_BRIDGE_").from_env::<EnvOverrides>()
    }

    pub fn apply(&self, cfg: &mut oscar_bridge::Config) {
        if let Some(addr) = self.server_addr {
            cfg.server.addr = Some(addr);
        }
        if let Some(interval) = self.keepalive_interval {
            cfg.connection.keepalive_interval = interval;
        }
    }
}

/// 返回的 handle 需要一直持有
pub fn init_logger(filter: Option<&str>) -> Result<LoggerHandle, FlexiLoggerError> {
    Logger::try_with_env_or_str(filter.unwrap_or("info"))?
        .format(flexi_logger::detailed_format)
        .start()
}
