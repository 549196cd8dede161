use std::{error::Error, sync::Arc};

use clap::Parser;
use demos::{init_logger, Args, EnvOverrides};
use log::{error, info};
use oscar_bridge::{xmpp::Jid, AuthCookie, Bridge, Config, EgressLog, StandaloneSupervisor};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let env = EnvOverrides::from_env()?;
    let _logger = init_logger(env.log.as_deref())?;

    // 获取配置
    let mut cfg = Config::from_path(&args.config).await?;
    env.apply(&mut cfg);
    cfg.validate()?;
    let cookie = AuthCookie::new(hex::decode(&args.cookie)?);
    let owner: Jid = args.owner.parse()?;

    // 启动连接
    let bridge = Bridge::new(cfg);
    let (handle, mut task) = bridge
        .connect(
            cookie,
            Arc::new(StandaloneSupervisor::new(owner)),
            Arc::new(EgressLog),
        )
        .await?;

    tokio::select! {
        exit = &mut task => report(exit?),
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
            handle.disconnect().await?;
            report(task.await?);
        }
    }
    Ok(())
}

fn report(exit: Result<(), oscar_bridge::Error>) {
    match exit {
        Ok(()) => info!("connection finished"),
        Err(e) => error!("connection failed: {}", e),
    }
}
