#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{debug, info};
use tunnel_me_out_client::{
    ClientConfig, ControllerHost, ControllerSettings, HttpTunnelApi, TunnelController,
    TunnelStatus, WatcherEvent, WsPaymentFeed,
};

mod terminal;

pub use terminal::{SystemClipboard, TerminalNotifier, render_status};

#[derive(Parser)]
#[command(name = "tunnel-me-out")]
#[command(about = "Request, pay for, and check Lightning-paid reverse SSH tunnels")]
pub struct TunnelCli {
    /// Backend base URL (overrides TUNNEL_ME_OUT_BASE_URL)
    #[arg(long, global = true)]
    pub base_url: Option<String>,
    /// Admin API key sent as X-Api-Key (overrides TUNNEL_ME_OUT_API_KEY)
    #[arg(long, global = true)]
    pub api_key: Option<String>,
    /// Payment websocket base (overrides TUNNEL_ME_OUT_WS_BASE)
    #[arg(long, global = true)]
    pub ws_base: Option<String>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Show the current tunnel
    Status,
    /// Request a tunnel and wait for its invoice to be paid
    Request {
        /// Number of days to pay for
        #[arg(long, default_value_t = 1)]
        days: u32,
        /// Copy the payment request to the clipboard
        #[arg(long)]
        copy: bool,
        /// Print the invoice and exit without waiting for payment
        #[arg(long)]
        no_wait: bool,
    },
    /// Follow the current tunnel: wait for payment, then ping periodically
    Watch,
    /// Check whether the tunnel endpoint is reachable
    Ping,
    /// Ask the backend to re-establish the tunnel
    Reconnect,
    /// Copy the pending payment request to the clipboard
    CopyInvoice,
    /// Copy the connection command to the clipboard
    CopyCommand,
}

pub async fn run(cli: TunnelCli) -> anyhow::Result<()> {
    let config = resolve_config(&cli)?;
    debug!(
        "backend {} push {} confirm mode {}",
        config.base_url,
        config.ws_base,
        config.confirm_mode.as_str()
    );
    let ping_interval = config.ping_interval;
    let mut controller = build_controller(&config)?;

    match cli.command {
        Commands::Status => {
            controller.load().await;
            print_status(&controller);
        }
        Commands::Request {
            days,
            copy,
            no_wait,
        } => {
            anyhow::ensure!(days > 0, "--days must be greater than zero");
            controller.request(days).await;
            print_status(&controller);
            if copy {
                controller.copy_invoice();
            }
            if !no_wait && controller.has_live_subscription() {
                wait_for_payment(&mut controller).await;
                print_status(&controller);
            }
        }
        Commands::Watch => {
            controller.load().await;
            print_status(&controller);
            watch(&mut controller, ping_interval).await;
        }
        Commands::Ping => {
            controller.check_reachability().await;
            println!("{}", controller.state().reachability.as_str());
        }
        Commands::Reconnect => {
            controller.reconnect().await;
            print_status(&controller);
        }
        Commands::CopyInvoice => {
            controller.load().await;
            anyhow::ensure!(
                controller.state().invoice_dialog.show,
                "no pending invoice to copy"
            );
            controller.copy_invoice();
        }
        Commands::CopyCommand => {
            controller.refresh().await;
            let has_command = controller
                .tunnel()
                .and_then(|tunnel| tunnel.ssh_command.as_deref())
                .is_some_and(|command| !command.trim().is_empty());
            anyhow::ensure!(has_command, "no connection command available yet");
            controller.copy_ssh_command();
        }
    }

    controller.teardown().await;
    Ok(())
}

fn resolve_config(cli: &TunnelCli) -> anyhow::Result<ClientConfig> {
    let mut config = ClientConfig::from_env().context("invalid tunnel client configuration")?;
    if let Some(base_url) = cli.base_url.as_deref() {
        config = config.with_base_url(base_url)?;
    }
    if let Some(ws_base) = cli.ws_base.as_deref() {
        config = config.with_ws_base(ws_base)?;
    }
    if let Some(api_key) = cli.api_key.as_deref() {
        config.api_key = Some(api_key.to_string());
    }
    Ok(config)
}

fn build_controller(config: &ClientConfig) -> anyhow::Result<TunnelController> {
    let api = HttpTunnelApi::new(config.api_config()).context("failed to build tunnel api")?;
    let host = ControllerHost {
        api: Arc::new(api),
        feed: Arc::new(WsPaymentFeed),
        notifier: Arc::new(TerminalNotifier),
        clipboard: Arc::new(SystemClipboard),
    };
    Ok(TunnelController::new(host, ControllerSettings::from(config)))
}

fn print_status(controller: &TunnelController) {
    for line in render_status(controller.state(), Utc::now()) {
        println!("{line}");
    }
}

/// Apply watcher events until the subscription ends or the user interrupts.
async fn wait_for_payment(controller: &mut TunnelController) {
    eprintln!("waiting for payment (ctrl-c to stop)...");
    while controller.has_live_subscription() {
        tokio::select! {
            event = controller.next_event() => {
                let Some(event) = event else { break };
                let settled = matches!(event, WatcherEvent::Paid { .. });
                controller.handle_event(event).await;
                if settled {
                    info!("payment settled");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                eprintln!("stopped waiting; the invoice stays payable");
                break;
            }
        }
    }
}

async fn watch(controller: &mut TunnelController, ping_interval: std::time::Duration) {
    let mut ticker = tokio::time::interval(ping_interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            event = controller.next_event() => {
                let Some(event) = event else { break };
                let settled = matches!(event, WatcherEvent::Paid { .. });
                controller.handle_event(event).await;
                if settled {
                    print_status(controller);
                }
            }
            _ = ticker.tick() => {
                let active = controller
                    .tunnel()
                    .is_some_and(|tunnel| tunnel.effective_status(Utc::now()) == TunnelStatus::Active);
                if active {
                    let before = controller.state().reachability;
                    controller.check_reachability().await;
                    let after = controller.state().reachability;
                    if before != after {
                        println!("reachability: {}", after.as_str());
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
}
