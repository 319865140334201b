/*!
 * nlbar
 * Wireless-aware status line generator speaking the i3bar protocol
 */

use std::rc::Rc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::info;

mod event_loop;
mod nl80211;
mod timer;
mod widgets;

use event_loop::EventLoop;
use nl80211::Nl80211;
use timer::TimerManager;
use widgets::clock::ClockWidget;
use widgets::wireless::WirelessWidget;

#[derive(Parser)]
#[command(name = "nlbar")]
#[command(about = "Wireless-aware status line generator for i3bar compatible bars")]
struct Cli {
    /// Wireless interface to report on
    #[arg(short, long, default_value = "wlan0")]
    interface: String,

    /// Seconds between periodic wireless refreshes
    #[arg(short, long, default_value_t = 10)]
    refresh: u64,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // stdout carries the protocol stream, diagnostics go to stderr
    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("nlbar={}", log_level))
        .with_writer(std::io::stderr)
        .init();

    info!("starting status stream for {}", cli.interface);

    let mut event_loop = EventLoop::new()?;
    let mut timers = TimerManager::new();

    let wireless_client = Nl80211::new(&mut event_loop)?;
    let wireless = WirelessWidget::new(cli.interface, wireless_client.clone());
    wireless_client.add_listener(wireless.clone());
    timers.register_listener(
        &mut event_loop,
        Duration::from_secs(cli.refresh),
        wireless.clone(),
    )?;
    event_loop.register_widget(wireless.clone());
    wireless.refresh();

    let clock = Rc::new(ClockWidget::new()?);
    event_loop.register_source(clock.clone(), clock.raw_fd())?;

    event_loop.run()
}
