//! ChatFleet Chat - interactive terminal client
//!
//! Resolves a worker for the chosen model through the controller and
//! streams replies to the terminal.

use anyhow::Result;
use chatfleet_client::{display_error, ChatParams, ChatSession, ControllerClient};
use chatfleet_common::config::ObservabilityConfig;
use chatfleet_common::logging;
use clap::Parser;
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

#[derive(Parser)]
#[command(name = "chatfleet-chat")]
#[command(about = "Chat with a model served by a ChatFleet cluster", long_about = None)]
struct Cli {
    /// Controller base URL
    #[arg(long, default_value = "http://localhost:21001")]
    controller_address: String,

    /// Model to chat with; the first listed model when omitted
    #[arg(short, long)]
    model: Option<String>,

    #[arg(long, default_value_t = 0.7)]
    temperature: f32,

    #[arg(long, default_value_t = 1.0)]
    top_p: f32,

    #[arg(long, default_value_t = 512)]
    max_new_tokens: u32,

    /// Log level for client diagnostics
    #[arg(long, default_value = "warn")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(
        "chatfleet_client",
        &ObservabilityConfig {
            log_level: cli.log_level.clone(),
            ..Default::default()
        },
    );

    let controller = ControllerClient::new(&cli.controller_address)?;
    controller.refresh_all_workers().await?;
    let models = controller.list_models().await?;
    info!("Models available: {:?}", models);

    let model = match cli.model.or_else(|| models.first().cloned()) {
        Some(model) => model,
        None => anyhow::bail!("no models registered at {}", cli.controller_address),
    };

    let params = ChatParams {
        temperature: cli.temperature,
        top_p: cli.top_p,
        max_new_tokens: cli.max_new_tokens,
    };
    let mut session = ChatSession::new(controller, model, params);
    println!("Chatting with {}. Type !!reset to start over, !!exit to quit.", session.model());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = std::io::stdout();
    loop {
        print!("USER: ");
        stdout.flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let message = line.trim();
        match message {
            "" => continue,
            "!!exit" => break,
            "!!reset" => {
                session.reset();
                println!("(conversation reset)");
                continue;
            }
            _ => {}
        }

        print!("ASSISTANT: ");
        stdout.flush()?;
        if let Err(e) = session.send(message, &mut stdout).await {
            println!();
            println!("{}", display_error(&e));
        }
    }

    Ok(())
}
