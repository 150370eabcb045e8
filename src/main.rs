//! CLI for mqdispatch
//!
//! Subcommands:
//! - `demo`: push messages through a coordinator in-process and print the
//!   acknowledgment records it emits
//! - `config`: print the effective configuration

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use mqdispatch::config::{Settings, load_config};
use mqdispatch::utils::logging;
use mqdispatch::{
    AcknowledgmentRecord, CoordinatorError, DeliveryCoordinator, Dequeue, Disposition,
    InboundMessage, PoisonCause, Timeout,
};
use tokio::sync::mpsc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "mqdispatch")]
enum Command {
    /// Run a producer thread and a consumer against one coordinator
    Demo {
        /// Number of messages the receive path delivers
        #[arg(long, default_value_t = 10)]
        messages: u32,
        /// Fail every Nth processing attempt (0 never fails)
        #[arg(long, default_value_t = 3)]
        fail_every: u32,
    },
    /// Print the effective configuration as JSON
    Config,
}

#[tokio::main]
async fn main() {
    let cmd = Command::parse();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return;
        }
    };
    logging::init(&settings.logging.level);

    match cmd {
        Command::Demo {
            messages,
            fail_every,
        } => {
            if let Err(e) = run_demo(settings, messages, fail_every).await {
                error!("Demo failed: {}", e);
            }
        }
        Command::Config => match serde_json::to_string_pretty(&settings) {
            Ok(json) => println!("{json}"),
            Err(e) => error!("Failed to render configuration: {}", e),
        },
    }
}

async fn run_demo(
    settings: Settings,
    messages: u32,
    fail_every: u32,
) -> Result<(), Box<dyn std::error::Error>> {
    let (tx, mut rx) = mpsc::unbounded_channel::<AcknowledgmentRecord>();
    let coordinator = Arc::new(DeliveryCoordinator::from_settings(&settings, tx));
    coordinator.start();
    info!(consumer = %coordinator.consumer_id(), messages, "demo started");

    let printer = tokio::spawn(async move {
        while let Some(record) = rx.recv().await {
            match serde_json::to_string(&record) {
                Ok(json) => println!("{json}"),
                Err(e) => error!("Failed to serialize record: {}", e),
            }
        }
    });

    let receive_path = {
        let coordinator = coordinator.clone();
        tokio::task::spawn_blocking(move || {
            for n in 0..messages {
                coordinator.deliver(
                    InboundMessage::new(format!("msg-{n}"), format!("payload {n}")),
                    None,
                );
            }
        })
    };

    let mut application = {
        let coordinator = coordinator.clone();
        tokio::task::spawn_blocking(move || consume(&coordinator, messages, fail_every))
    };

    tokio::select! {
        settled = &mut application => {
            let settled = settled??;
            info!(settled, "all messages settled");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Closing consumer.");
            coordinator.close();
            let _ = application.await;
        }
    }

    receive_path.await?;
    coordinator.close();
    drop(coordinator);
    printer.await?;
    Ok(())
}

/// Application side: receive, "process", acknowledge or fail.
fn consume(
    coordinator: &DeliveryCoordinator<mpsc::UnboundedSender<AcknowledgmentRecord>>,
    messages: u32,
    fail_every: u32,
) -> Result<u32, CoordinatorError> {
    let mut settled = 0;
    let mut attempts = 0u32;

    while settled < messages {
        let entry = match coordinator.receive(Timeout::After(Duration::from_secs(1))) {
            Dequeue::Delivered(entry) => entry,
            Dequeue::Empty | Dequeue::TimedOut => continue,
            Dequeue::Cancelled | Dequeue::Closed => break,
        };
        attempts += 1;

        if fail_every > 0 && attempts % fail_every == 0 {
            let cause = PoisonCause::listener_failure(format!("simulated failure on attempt {attempts}"));
            if let Disposition::Poisoned = coordinator.fail(&entry.message_id, cause)? {
                settled += 1;
            }
        } else {
            coordinator.acknowledge(&[entry.message_id])?;
            settled += 1;
        }
    }

    Ok(settled)
}
