//! Simulated page: every line on stdin is typed into the name input and the
//! button is clicked. Clicks do not wait for each other.
//!
//! ```bash
//! printf 'Ada\nGrace\n' | greet_page
//! ```

use clap::Parser;
use clickgreet::client::ClientHandle;
use clickgreet::config::Config;
use clickgreet::greeter::RemoteGreeter;
use clickgreet::handler::ClickHandler;
use clickgreet::logger::setup_logger;
use clickgreet::page::{Document, Page};
use clickgreet::Result;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(name = "greet_page", version, about = "Click-to-greet against a remote actor")]
struct Cli {
    /// Id of the name input
    #[arg(long)]
    input_id: Option<String>,

    /// Id of the button
    #[arg(long)]
    trigger_id: Option<String>,

    /// Id of the element showing the greeting
    #[arg(long)]
    output_id: Option<String>,

    /// Remote object exposing the greet method
    #[arg(long, env = "GREET_ACTOR")]
    actor: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logger();
    let cli = Cli::parse();

    let mut config = Config::load()?;
    if let Some(id) = cli.input_id {
        config.page.input_id = id;
    }
    if let Some(id) = cli.trigger_id {
        config.page.trigger_id = id;
    }
    if let Some(id) = cli.output_id {
        config.page.output_id = id;
    }
    if let Some(actor) = cli.actor {
        config.page.actor = actor;
    }

    let client = ClientHandle::connect(&config.broker).await?;
    client.wait_for_object(&config.page.actor).await?;

    let page = Page::spawn(Document::standard(&config.page));
    ClickHandler::new(RemoteGreeter::from_config(client, &config.page), &config.page)
        .register(&page)
        .await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        page.set_value(&config.page.input_id, line).await?;
        page.click(&config.page.trigger_id).await?;
    }

    page.settle().await;

    let doc = page.snapshot().await?;
    println!("{}", doc.inner_text(&config.page.output_id).unwrap_or_default());

    // Each failure was already logged by the page loop.
    if !page.take_unhandled().await?.is_empty() {
        std::process::exit(1);
    }
    Ok(())
}
