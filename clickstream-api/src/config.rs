use envconfig::Envconfig;

#[derive(Envconfig)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3300")]
    pub port: u16,

    /// Largest accepted invocation body, in bytes.
    #[envconfig(default = "6291456")]
    pub max_body_size: usize,

    /// Maximum number of invocations served at the same time.
    #[envconfig(default = "64")]
    pub concurrency_limit: usize,
}

impl Config {
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
