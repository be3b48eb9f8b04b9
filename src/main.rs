mod api;
mod config;
mod format;
mod keybindings;
mod model;
mod reconciler;
mod stream;
mod ui;
mod view;

use anyhow::{Context, Result};
use clap::Parser;
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyModifiers},
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use ratatui::{Terminal, backend::CrosstermBackend};
use std::io;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::api::ControlClient;
use crate::config::{Config, Transport};
use crate::stream::{StreamEvent, StreamMessage};
use crate::ui::AppState;
use crate::view::SortColumn;

/// clashtop - live connection table for Clash-compatible proxy daemons
#[derive(Parser, Debug)]
#[command(name = "clashtop")]
#[command(version)]
#[command(about = "Live connection monitor for Clash-compatible proxy daemons", long_about = None)]
struct Args {
    /// Controller hostname (overrides the saved config)
    #[arg(long, value_name = "HOST")]
    host: Option<String>,

    /// Controller port (overrides the saved config)
    #[arg(long, value_name = "PORT")]
    port: Option<u16>,

    /// Controller secret (overrides the saved config)
    #[arg(long, value_name = "SECRET")]
    secret: Option<String>,

    /// Read the connection feed over a websocket instead of HTTP streaming
    #[arg(long)]
    websocket: bool,

    /// Keep closed connections in the table
    #[arg(long)]
    keep_closed: bool,

    /// Don't save preferences on exit
    #[arg(long)]
    no_save: bool,
}

/// Fold CLI overrides into the loaded config
fn apply_args(config: &mut Config, args: &Args) {
    if let Some(host) = &args.host {
        config.controller.hostname = host.clone();
    }
    if let Some(port) = args.port {
        config.controller.port = port;
    }
    if let Some(secret) = &args.secret {
        config.controller.secret = secret.clone();
    }
    if args.websocket {
        config.transport = Transport::Websocket;
    }
    if args.keep_closed {
        config.keep_closed = true;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if std::env::var("RUST_LOG").is_ok() {
        pretty_env_logger::formatted_builder()
            .parse_default_env()
            .init();
    }

    let mut config = Config::load().unwrap_or_else(|e| {
        log::warn!("Failed to load config, using defaults: {:#}", e);
        Config::default()
    });
    apply_args(&mut config, &args);

    let controller_label = format!(
        "{}:{}",
        config.controller.hostname, config.controller.port
    );
    let client = ControlClient::new(config.controller.clone())?;

    // Open the feed before taking over the terminal so failures print normally
    let mut feed = client
        .open_snapshot_stream(config.transport)
        .await
        .context(format!("Failed to open connection feed at {}", controller_label))?;

    let (tx, mut rx) = mpsc::unbounded_channel::<StreamMessage>();
    let subscriptions = [StreamEvent::Data, StreamEvent::Closed].map(|event| {
        let tx = tx.clone();
        feed.subscribe(event, move |message| {
            let _ = tx.send(message.clone());
        })
    });
    drop(tx);
    feed.start();

    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = AppState::new(config.keep_closed, controller_label);

    let res = run_app(&mut terminal, &mut app, &client, &mut rx).await;

    // Release the feed before anything else so no snapshot arrives late
    for subscription in subscriptions {
        feed.unsubscribe(subscription);
    }
    feed.destroy();

    if !args.no_save {
        config.keep_closed = app.store.keep_closed();
        if let Err(e) = config.save() {
            log::warn!("Failed to save config: {}", e);
        }
    }

    // Restore terminal
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;

    if let Err(err) = res {
        log::error!("Error: {:?}", err);
    }

    Ok(())
}

async fn run_app<B: ratatui::backend::Backend>(
    terminal: &mut Terminal<B>,
    app: &mut AppState,
    client: &ControlClient,
    feed: &mut mpsc::UnboundedReceiver<StreamMessage>,
) -> Result<()> {
    loop {
        terminal.draw(|f| ui::draw_ui(f, app))?;

        // Handle input with timeout
        if event::poll(Duration::from_millis(100))? {
            if let Event::Key(key) = event::read()? {
                // ALWAYS check Ctrl+C first - force quit regardless of dialog state
                if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
                    return Ok(());
                }

                // If help is shown, any key closes it
                if app.show_help {
                    app.show_help = false;
                    continue;
                }

                if app.show_close_all_dialog {
                    match key.code {
                        KeyCode::Enter | KeyCode::Char('y') => {
                            app.show_close_all_dialog = false;
                            // The next snapshot reflects whatever the daemon actually closed
                            match client.close_all_connections().await {
                                Ok(_) => {
                                    app.status_message =
                                        "Requested close of all connections".to_string();
                                }
                                Err(e) => {
                                    log::warn!("Failed to close connections: {:#}", e);
                                    app.status_message =
                                        format!("Failed to close connections: {}", e);
                                }
                            }
                        }
                        KeyCode::Esc | KeyCode::Char('n') | KeyCode::Char('q') => {
                            app.show_close_all_dialog = false;
                        }
                        _ => {}
                    }
                    continue;
                }

                match key.code {
                    KeyCode::Char('q') | KeyCode::Esc => {
                        return Ok(());
                    }
                    KeyCode::Char('h') | KeyCode::Char('?') => {
                        app.show_help = true;
                    }
                    KeyCode::Down | KeyCode::Char('j') => {
                        app.select_next();
                    }
                    KeyCode::Up | KeyCode::Char('k') => {
                        app.select_previous();
                    }
                    KeyCode::Char('s') => {
                        app.cycle_sort_column();
                    }
                    KeyCode::Char('S') => {
                        app.toggle_sort_direction();
                    }
                    KeyCode::Char(c @ '1'..='9') => {
                        let index = c as usize - '1' as usize;
                        if let Some(column) = SortColumn::ALL.get(index) {
                            app.select_sort_column(*column);
                        }
                    }
                    KeyCode::Char('d') => {
                        app.cycle_device_filter();
                    }
                    KeyCode::Char('c') => {
                        app.toggle_keep_closed();
                    }
                    KeyCode::Char('x') => {
                        if let Some(row) = app.get_selected_connection() {
                            let id = row.id.clone();
                            let host = row.host.clone();
                            match client.close_connection(&id).await {
                                Ok(_) => {
                                    app.status_message = format!("Requested close of {}", host);
                                }
                                Err(e) => {
                                    log::warn!("Failed to close connection {}: {:#}", id, e);
                                    app.status_message =
                                        format!("Failed to close connection: {}", e);
                                }
                            }
                        } else {
                            app.status_message = "No connection selected".to_string();
                        }
                    }
                    KeyCode::Char('X') => {
                        app.show_close_all_dialog = true;
                    }
                    _ => {}
                }
            }
        }

        // Reconcile pending snapshots strictly in arrival order
        while let Ok(message) = feed.try_recv() {
            app.apply_message(message);
        }
    }
}
