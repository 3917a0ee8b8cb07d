use std::sync::Arc;

use anyhow::Context;
use crossterm::terminal;
use tokio::io::AsyncReadExt;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::broadcast::error::RecvError;
use tracing::info;

use libdeck::{
    DeckConfig, DisplaySurface, Geometry, HttpConsoleApi, ManagerHandle, MemorySurface,
    PendingExecutionIndex, SessionRegistry, StateStore, SurfaceFactory, TerminalEvent,
    TerminalStatus, WsDialer,
};

use crate::input::{SizeTracker, Utf8Decoder};
use crate::stdout::{self, Focus};

/// Ctrl+\ detaches, leaving the session running for the next `deck shell`.
const DETACH_BYTE: u8 = 0x1c;

fn open_store(config: &DeckConfig) -> anyhow::Result<StateStore> {
    StateStore::open(&config.state_dir)
        .with_context(|| format!("failed to open state in {}", config.state_dir.display()))
}

fn spawn_manager(
    config: &DeckConfig,
    store: StateStore,
    surfaces: Arc<dyn SurfaceFactory>,
) -> anyhow::Result<ManagerHandle> {
    let api = HttpConsoleApi::new(config.server_base()?)?;
    let manager = libdeck::manager::spawn(
        config.manager_settings()?,
        Arc::new(WsDialer),
        Arc::new(api),
        SessionRegistry::new(store),
        surfaces,
    )?;
    Ok(manager)
}

/// Attach stdin/stdout to the newest live terminal, creating one if needed.
pub async fn shell(config: &DeckConfig, cwd: Option<String>) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let (cols, rows) = terminal::size().unwrap_or((80, 24));
    let geometry = Geometry { rows, cols };
    let focus = Focus::default();
    let manager = spawn_manager(config, store, stdout::factory(focus.clone(), geometry))?;
    let mut events = manager.subscribe();

    let report = manager.restore_all().await?;
    info!(
        restored = report.restored,
        failed = report.failed,
        timed_out = report.timed_out,
        "restored terminals"
    );

    let live = manager.list().await?.into_iter().rev().find(|t| {
        matches!(
            t.status,
            TerminalStatus::Ready | TerminalStatus::Connecting | TerminalStatus::Reconnecting
        )
    });
    let target = match live {
        Some(terminal) => terminal,
        None => manager
            .create(cwd.as_deref())
            .await?
            .context("terminal manager refused to open a session")?,
    };
    focus.set(&target.handle_id);

    terminal::enable_raw_mode()?;
    let _raw_guard = RawModeGuard;
    print!("\r\n[attached to {} - Ctrl+\\ to detach]\r\n", target.label);

    let mut window_changes = signal(SignalKind::window_change())?;
    let mut sizes = SizeTracker::new(geometry);
    let mut decoder = Utf8Decoder::default();
    let mut stdin = tokio::io::stdin();
    let mut buf = [0u8; 4096];
    loop {
        tokio::select! {
            read = stdin.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    break;
                }
                let chunk = &buf[..n];
                let detach = chunk.iter().position(|b| *b == DETACH_BYTE);
                let text = decoder.push(&chunk[..detach.unwrap_or(n)]);
                if !text.is_empty() {
                    manager.input(&target.handle_id, text).await?;
                }
                if detach.is_some() {
                    print!("\r\n[detached; session kept]\r\n");
                    break;
                }
            }
            Some(()) = window_changes.recv() => {
                if let Ok((cols, rows)) = terminal::size()
                    && let Some(next) = sizes.observe(cols, rows)
                {
                    manager.resize(&target.handle_id, next.rows, next.cols).await?;
                }
            }
            event = events.recv() => match event {
                Ok(TerminalEvent::Exited { handle_id, code }) if handle_id == target.handle_id => {
                    print!("\r\n[session exited with code {code:?}]\r\n");
                    break;
                }
                Ok(TerminalEvent::Exhausted { handle_id }) if handle_id == target.handle_id => {
                    print!("\r\n[connection lost; run `deck shell` again to retry]\r\n");
                    break;
                }
                Ok(TerminalEvent::Disconnected { handle_id }) if handle_id == target.handle_id => {
                    print!("\r\n[server closed the session]\r\n");
                    break;
                }
                Ok(TerminalEvent::Reconnecting { handle_id, attempt, .. }) if handle_id == target.handle_id => {
                    print!("\r\n[reconnecting, attempt {attempt}]\r\n");
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    }

    Ok(())
}

struct RawModeGuard;

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

/// Print the session registry.
pub fn sessions(config: &DeckConfig) -> anyhow::Result<()> {
    let registry = SessionRegistry::new(open_store(config)?);
    let entries = registry.get_all()?;
    if entries.is_empty() {
        println!("no remembered sessions");
        return Ok(());
    }
    for entry in entries {
        println!("{}\t{}\t{}", entry.handle_id, entry.session_id, entry.label);
    }
    Ok(())
}

/// Restore every remembered terminal, then close them all remotely.
pub async fn close_all(config: &DeckConfig) -> anyhow::Result<()> {
    let surfaces: Arc<dyn SurfaceFactory> =
        Arc::new(|_: &str, _: &str| -> Box<dyn DisplaySurface> { Box::new(MemorySurface::new()) });
    let manager = spawn_manager(config, open_store(config)?, surfaces)?;
    manager.restore_all().await?;
    let closed = manager.cleanup_all().await?;
    println!("closed {closed} session(s)");
    Ok(())
}

/// Stream execution notifications until Ctrl+C.
pub async fn watch(config: &DeckConfig) -> anyhow::Result<()> {
    let index = PendingExecutionIndex::new(open_store(config)?);
    let api = HttpConsoleApi::new(config.server_base()?)?;
    let (bus, mut notifications) = libdeck::executions::spawn(
        config.bus_settings()?,
        Arc::new(WsDialer),
        Arc::new(api),
        index,
    )?;
    info!(client_id = %bus.client_id(), "watching executions");

    loop {
        tokio::select! {
            notification = notifications.recv() => match notification {
                Ok(n) => println!("{}", n.message),
                Err(RecvError::Lagged(skipped)) => eprintln!("missed {skipped} notification(s)"),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                bus.shutdown().await?;
                break;
            }
        }
    }
    Ok(())
}

/// Drop one registry entry locally.
pub fn forget(config: &DeckConfig, handle: &str) -> anyhow::Result<()> {
    let registry = SessionRegistry::new(open_store(config)?);
    if registry.remove(handle)? {
        println!("forgot {handle}");
        Ok(())
    } else {
        anyhow::bail!("no remembered session with handle {handle}")
    }
}
