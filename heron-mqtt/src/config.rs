use tokio::fs;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, serde::Deserialize)]
pub struct Config {
    pub broker: Broker,
    #[serde(default)]
    pub session: Session,
}

#[derive(Debug, serde::Deserialize)]
pub struct Broker {
    /// 客户端监听地址
    pub client_addr: String,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct Session {
    /// dormant 会话的过期秒数，不配置则一直保留
    #[serde(default)]
    pub expire_interval: Option<u64>,
}

impl Config {
    pub async fn from_path(path: &str) -> Result<Self, Error> {
        let s = fs::read_to_string(path).await?;
        Ok(toml::from_str::<Config>(&s)?)
    }
}
