use envconfig::Envconfig;

use clickstream_common::config::{EnvMsDuration, NonEmptyString};
use clickstream_common::kafka::KafkaConfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    #[envconfig(default = "1000")]
    pub flush_interval_ms: EnvMsDuration,

    #[envconfig(default = "100")]
    pub debounce_ms: EnvMsDuration,

    #[envconfig(default = "https://example.com/blog/clickstream")]
    pub page_url: NonEmptyString,

    /// Identity of the simulated reader. A random one is picked when unset.
    pub identity_id: Option<NonEmptyString>,

    #[envconfig(default = "900")]
    pub client_height: u32,

    #[envconfig(default = "4000")]
    pub page_height: u32,

    /// Time between two simulated scroll positions.
    #[envconfig(default = "40")]
    pub scroll_tick_ms: EnvMsDuration,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
