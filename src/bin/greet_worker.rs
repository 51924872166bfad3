//! Demo actor answering `greet(name)` with `Hello, {name}!`.
//!
//! ```bash
//! greet_worker --object storage --delay-ms 500
//! ```

use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use clickgreet::config::Config;
use clickgreet::logger::setup_logger;
use clickgreet::worker::{SharedObject, WorkerBuilder};
use serde_json::Value;

#[derive(Parser, Debug)]
#[command(name = "greet_worker", version, about = "Serve a demo greet actor over the broker")]
struct Cli {
    /// Object name to register
    #[arg(long, default_value = "storage")]
    object: String,

    /// Wait this long before answering each call
    #[arg(long, default_value_t = 0)]
    delay_ms: u64,
}

struct Storage {
    delay: Duration,
}

#[async_trait]
impl SharedObject for Storage {
    async fn call(&self, method: &str, args: &Value) -> Result<Value, String> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match (method, args.as_str()) {
            ("greet", Some(name)) => Ok(Value::from(format!("Hello, {name}!"))),
            ("greet", None) => Err(format!("Invalid args: expected a string, got {args}")),
            _ => Err(format!("Unknown method: {method}")),
        }
    }
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    setup_logger();
    let cli = Cli::parse();
    let config = Config::load().map_err(std::io::Error::other)?;

    log::info!("Serving '{}' ...", cli.object);
    WorkerBuilder::new()
        .with_config(config.broker)
        .add(
            &cli.object,
            Storage {
                delay: Duration::from_millis(cli.delay_ms),
            },
        )
        .spawn()
        .await
}
