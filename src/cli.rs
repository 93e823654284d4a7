use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "nanoclaw",
    version,
    about = "NanoClaw - L2 regional gateway agent"
)]
pub struct Args {
    /// HTTP server host
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,
    /// HTTP server port
    #[arg(long, default_value_t = 8000)]
    pub port: u16,
}

impl Args {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
