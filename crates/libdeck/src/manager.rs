use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use reqwest::Url;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use deck_protocol::{
    ClientMessage, Frame, HandleId, HostMessage, Inbound, SessionId, decode_inbound,
    encode_control,
};

use crate::api::ConsoleApi;
use crate::config::join_path;
use crate::error::{DeckError, DeckResult};
use crate::reconnect::{CloseDecision, ReconnectPolicy, ReconnectState};
use crate::registry::SessionRegistry;
use crate::surface::{DisplaySurface, Geometry, SurfaceFactory};
use crate::transport::{ChannelEvent, ChannelId, ChannelNotice, Dialer, TransportChannel};

const COMMAND_BUFFER: usize = 64;
const STATUS_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub ws_base: Url,
    pub max_attempts: u32,
    pub retry_delay: Duration,
    /// Upper bound on how long restoration may hold back `create`.
    pub restore_grace: Duration,
    /// How long `close`/`cleanup_all` wait for remote close requests.
    pub close_timeout: Duration,
}

impl ManagerSettings {
    pub fn new(ws_base: Url) -> Self {
        Self {
            ws_base,
            max_attempts: 3,
            retry_delay: Duration::from_secs(2),
            restore_grace: Duration::from_secs(1),
            close_timeout: Duration::from_secs(3),
        }
    }

    fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::Fixed {
            delay: self.retry_delay,
            max_attempts: self.max_attempts,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalStatus {
    Connecting,
    Ready,
    Reconnecting,
    /// The shell exited; output stays on the surface until the tab closes.
    Exited,
    /// The host closed the channel normally.
    Disconnected,
    /// Reconnection gave up; needs manual action.
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalSummary {
    pub handle_id: HandleId,
    pub label: String,
    pub server_session_id: Option<SessionId>,
    pub status: TerminalStatus,
}

/// Outcome of one restoration pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub restored: usize,
    pub failed: usize,
    /// Still unsettled when the grace window ran out.
    pub timed_out: usize,
}

/// Status updates for whoever renders the tabs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalEvent {
    RestoreStarted { entries: usize },
    RestoreFinished(RestoreReport),
    Created { handle_id: HandleId, label: String },
    Connecting { handle_id: HandleId, attempt: u32 },
    Ready {
        handle_id: HandleId,
        session_id: SessionId,
        is_reconnect: bool,
    },
    Reconnecting {
        handle_id: HandleId,
        attempt: u32,
        delay: Duration,
    },
    Exhausted { handle_id: HandleId },
    Exited { handle_id: HandleId, code: Option<i32> },
    Disconnected { handle_id: HandleId },
    Error { handle_id: HandleId, message: String },
    Closed { handle_id: HandleId },
}

/// Cloneable front end to the manager task.
#[derive(Clone)]
pub struct ManagerHandle {
    commands: mpsc::Sender<Command>,
    status: broadcast::Sender<TerminalEvent>,
    close_timeout: Duration,
}

/// Remote close still in flight after local teardown.
struct Closing {
    remote: Option<JoinHandle<()>>,
}

enum Command {
    RestoreAll {
        reply: oneshot::Sender<RestoreReport>,
    },
    Create {
        cwd: Option<String>,
        reply: oneshot::Sender<Option<TerminalSummary>>,
    },
    Close {
        handle_id: HandleId,
        reply: oneshot::Sender<Option<Closing>>,
    },
    CleanupAll {
        reply: oneshot::Sender<Vec<Closing>>,
    },
    List {
        reply: oneshot::Sender<Vec<TerminalSummary>>,
    },
    Input {
        handle_id: HandleId,
        data: String,
        reply: oneshot::Sender<DeckResult<bool>>,
    },
    Resize {
        handle_id: HandleId,
        geometry: Geometry,
        reply: oneshot::Sender<DeckResult<bool>>,
    },
}

/// Start the manager task. It runs until every [`ManagerHandle`] is dropped,
/// then detaches from its sessions without closing them remotely.
pub fn spawn(
    settings: ManagerSettings,
    dialer: Arc<dyn Dialer>,
    api: Arc<dyn ConsoleApi>,
    registry: SessionRegistry,
    surfaces: Arc<dyn SurfaceFactory>,
) -> DeckResult<ManagerHandle> {
    let endpoint = join_path(&settings.ws_base, &["ws", "terminal"])?;
    let (commands, command_rx) = mpsc::channel(COMMAND_BUFFER);
    let (status, _) = broadcast::channel(STATUS_BUFFER);
    let (channel_tx, channel_rx) = mpsc::unbounded_channel();
    let (timer_tx, timer_rx) = mpsc::unbounded_channel();

    let handle = ManagerHandle {
        commands,
        status: status.clone(),
        close_timeout: settings.close_timeout,
    };
    let manager = Manager {
        policy: settings.policy(),
        settings,
        endpoint,
        dialer,
        api,
        registry,
        surfaces,
        handles: HashMap::new(),
        order: Vec::new(),
        gate: Gate::NotStarted,
        last_report: RestoreReport::default(),
        next_channel: 0,
        next_token: 0,
        sequence: 0,
        channel_tx,
        timer_tx,
        status,
    };
    tokio::spawn(manager.run(command_rx, channel_rx, timer_rx));
    Ok(handle)
}

impl ManagerHandle {
    async fn request<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> Command) -> DeckResult<R> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| DeckError::Stopped("terminal manager"))?;
        rx.await.map_err(|_| DeckError::Stopped("terminal manager"))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TerminalEvent> {
        self.status.subscribe()
    }

    /// Resume every session in the registry. Resolves once each entry has
    /// either become ready, failed its first attempt, or outlived the grace
    /// window. Later calls return the first pass's report.
    pub async fn restore_all(&self) -> DeckResult<RestoreReport> {
        self.request(|reply| Command::RestoreAll { reply }).await
    }

    /// Open a fresh terminal. Returns `None` while restoration has not
    /// finished.
    pub async fn create(&self, cwd: Option<&str>) -> DeckResult<Option<TerminalSummary>> {
        let cwd = cwd.map(str::to_string);
        self.request(|reply| Command::Create { cwd, reply }).await
    }

    /// Close one terminal. Returns `false` for an unknown handle.
    pub async fn close(&self, handle_id: &str) -> DeckResult<bool> {
        let handle_id = handle_id.to_string();
        let closing = self
            .request(|reply| Command::Close { handle_id, reply })
            .await?;
        let Some(closing) = closing else {
            return Ok(false);
        };
        if let Some(remote) = closing.remote
            && tokio::time::timeout(self.close_timeout, remote).await.is_err()
        {
            warn!("remote close did not finish in time");
        }
        Ok(true)
    }

    /// Close every live terminal and wait (bounded) for all remote close
    /// requests. Returns how many terminals were closed.
    pub async fn cleanup_all(&self) -> DeckResult<usize> {
        let closings = self.request(|reply| Command::CleanupAll { reply }).await?;
        let count = closings.len();
        let remotes: Vec<_> = closings.into_iter().filter_map(|c| c.remote).collect();
        if tokio::time::timeout(self.close_timeout, join_all(remotes))
            .await
            .is_err()
        {
            warn!(count, "remote close requests did not all finish in time");
        }
        Ok(count)
    }

    pub async fn list(&self) -> DeckResult<Vec<TerminalSummary>> {
        self.request(|reply| Command::List { reply }).await
    }

    /// Send keystrokes. `Ok(false)` means the channel was not open and the
    /// input was dropped.
    pub async fn input(&self, handle_id: &str, data: impl Into<String>) -> DeckResult<bool> {
        let handle_id = handle_id.to_string();
        let data = data.into();
        self.request(|reply| Command::Input {
            handle_id,
            data,
            reply,
        })
        .await?
    }

    pub async fn resize(&self, handle_id: &str, rows: u16, cols: u16) -> DeckResult<bool> {
        let handle_id = handle_id.to_string();
        let geometry = Geometry { rows, cols };
        self.request(|reply| Command::Resize {
            handle_id,
            geometry,
            reply,
        })
        .await?
    }
}

enum Gate {
    NotStarted,
    Restoring {
        pending: HashSet<HandleId>,
        report: RestoreReport,
        waiters: Vec<oneshot::Sender<RestoreReport>>,
        deadline: Instant,
    },
    Ready,
}

enum Settle {
    Restored,
    Failed,
}

struct ReconnectTimer {
    token: u64,
    task: JoinHandle<()>,
}

struct TimerFired {
    handle_id: HandleId,
    token: u64,
}

/// One terminal tab.
struct TerminalHandle {
    label: String,
    surface: Box<dyn DisplaySurface>,
    /// Replaced wholesale on every reconnect.
    channel: Option<TransportChannel>,
    server_session_id: Option<SessionId>,
    /// Session to ask for when (re)connecting before a ready handshake.
    resume_target: Option<SessionId>,
    project_path: Option<String>,
    reconnect: ReconnectState,
    timer: Option<ReconnectTimer>,
    status: TerminalStatus,
    geometry: Geometry,
}

impl TerminalHandle {
    fn summary(&self, handle_id: &str) -> TerminalSummary {
        TerminalSummary {
            handle_id: handle_id.to_string(),
            label: self.label.clone(),
            server_session_id: self.server_session_id.clone(),
            status: self.status,
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.task.abort();
        }
    }
}

struct Manager {
    settings: ManagerSettings,
    policy: ReconnectPolicy,
    endpoint: Url,
    dialer: Arc<dyn Dialer>,
    api: Arc<dyn ConsoleApi>,
    registry: SessionRegistry,
    surfaces: Arc<dyn SurfaceFactory>,
    handles: HashMap<HandleId, TerminalHandle>,
    /// Live handle ids in creation order.
    order: Vec<HandleId>,
    gate: Gate,
    last_report: RestoreReport,
    next_channel: ChannelId,
    next_token: u64,
    sequence: u32,
    channel_tx: mpsc::UnboundedSender<ChannelNotice<HandleId>>,
    timer_tx: mpsc::UnboundedSender<TimerFired>,
    status: broadcast::Sender<TerminalEvent>,
}

fn publish(status: &broadcast::Sender<TerminalEvent>, event: TerminalEvent) {
    // No subscribers is fine.
    let _ = status.send(event);
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Manager {
    async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<Command>,
        mut channel_rx: mpsc::UnboundedReceiver<ChannelNotice<HandleId>>,
        mut timer_rx: mpsc::UnboundedReceiver<TimerFired>,
    ) {
        loop {
            let deadline = match &self.gate {
                Gate::Restoring { deadline, .. } => Some(*deadline),
                _ => None,
            };
            tokio::select! {
                cmd = command_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                Some(notice) = channel_rx.recv() => self.on_channel_event(notice),
                Some(fired) = timer_rx.recv() => self.on_timer(fired),
                _ = wait_until(deadline) => {
                    warn!("restore grace window elapsed");
                    self.finish_restore();
                }
            }
        }
        self.detach_all();
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::RestoreAll { reply } => self.restore_all(reply),
            Command::Create { cwd, reply } => {
                let _ = reply.send(self.create(cwd));
            }
            Command::Close { handle_id, reply } => {
                let _ = reply.send(self.close(&handle_id));
            }
            Command::CleanupAll { reply } => {
                let ids = self.order.clone();
                let closings: Vec<Closing> = ids.iter().filter_map(|id| self.close(id)).collect();
                info!(count = ids.len(), "closed all terminals");
                let _ = reply.send(closings);
            }
            Command::List { reply } => {
                let list = self
                    .order
                    .iter()
                    .filter_map(|id| self.handles.get(id).map(|h| h.summary(id)))
                    .collect();
                let _ = reply.send(list);
            }
            Command::Input {
                handle_id,
                data,
                reply,
            } => {
                let _ = reply.send(self.input(&handle_id, data));
            }
            Command::Resize {
                handle_id,
                geometry,
                reply,
            } => {
                let _ = reply.send(self.resize(&handle_id, geometry));
            }
        }
    }

    // --- restoration -----------------------------------------------------

    fn restore_all(&mut self, reply: oneshot::Sender<RestoreReport>) {
        match &mut self.gate {
            Gate::Ready => {
                let _ = reply.send(self.last_report);
                return;
            }
            Gate::Restoring { waiters, .. } => {
                waiters.push(reply);
                return;
            }
            Gate::NotStarted => {}
        }

        let entries = match self.registry.get_all() {
            Ok(entries) => entries,
            Err(e) => {
                error!(error = %e, "cannot read session registry; starting empty");
                Vec::new()
            }
        };

        let mut claimed: HashSet<SessionId> = HashSet::new();
        let mut pending = HashSet::new();
        for entry in entries {
            if !claimed.insert(entry.session_id.clone()) {
                warn!(
                    handle_id = %entry.handle_id,
                    session_id = %entry.session_id,
                    "session already claimed by another handle; dropping entry"
                );
                if let Err(e) = self.registry.remove(&entry.handle_id) {
                    warn!(handle_id = %entry.handle_id, error = %e, "failed to drop duplicate entry");
                }
                continue;
            }
            self.insert_handle(
                entry.handle_id.clone(),
                entry.label,
                Some(entry.session_id),
                None,
            );
            pending.insert(entry.handle_id.clone());
            self.connect(&entry.handle_id);
        }

        info!(entries = pending.len(), "restoring terminal sessions");
        publish(
            &self.status,
            TerminalEvent::RestoreStarted {
                entries: pending.len(),
            },
        );
        self.gate = Gate::Restoring {
            pending,
            report: RestoreReport::default(),
            waiters: vec![reply],
            deadline: Instant::now() + self.settings.restore_grace,
        };
        if matches!(&self.gate, Gate::Restoring { pending, .. } if pending.is_empty()) {
            self.finish_restore();
        }
    }

    fn settle(&mut self, handle_id: &str, outcome: Settle) {
        let Gate::Restoring {
            pending, report, ..
        } = &mut self.gate
        else {
            return;
        };
        if !pending.remove(handle_id) {
            return;
        }
        match outcome {
            Settle::Restored => report.restored += 1,
            Settle::Failed => report.failed += 1,
        }
        if pending.is_empty() {
            self.finish_restore();
        }
    }

    fn finish_restore(&mut self) {
        let (pending, mut report, waiters) = match std::mem::replace(&mut self.gate, Gate::Ready) {
            Gate::Restoring {
                pending,
                report,
                waiters,
                ..
            } => (pending, report, waiters),
            other => {
                self.gate = other;
                return;
            }
        };
        report.timed_out = pending.len();
        info!(
            restored = report.restored,
            failed = report.failed,
            timed_out = report.timed_out,
            "restoration finished"
        );
        self.last_report = report;
        for waiter in waiters {
            let _ = waiter.send(report);
        }
        publish(&self.status, TerminalEvent::RestoreFinished(report));
    }

    // --- lifecycle ---------------------------------------------------------

    fn create(&mut self, cwd: Option<String>) -> Option<TerminalSummary> {
        if !matches!(self.gate, Gate::Ready) {
            debug!("create refused until restoration completes");
            return None;
        }
        self.sequence += 1;
        let handle_id = uuid::Uuid::new_v4().to_string();
        let label = cwd
            .as_deref()
            .and_then(|dir| Path::new(dir).file_name())
            .and_then(|name| name.to_str())
            .map(str::to_string)
            .unwrap_or_else(|| format!("Terminal {}", self.sequence));

        self.insert_handle(handle_id.clone(), label, None, cwd);
        self.connect(&handle_id);
        self.handles.get(&handle_id).map(|h| h.summary(&handle_id))
    }

    fn insert_handle(
        &mut self,
        handle_id: HandleId,
        label: String,
        resume_target: Option<SessionId>,
        project_path: Option<String>,
    ) {
        let surface = self.surfaces.create(&handle_id, &label);
        let geometry = surface.geometry();
        publish(
            &self.status,
            TerminalEvent::Created {
                handle_id: handle_id.clone(),
                label: label.clone(),
            },
        );
        self.handles.insert(
            handle_id.clone(),
            TerminalHandle {
                label,
                surface,
                channel: None,
                server_session_id: None,
                resume_target,
                project_path,
                reconnect: ReconnectState::new(self.policy),
                timer: None,
                status: TerminalStatus::Connecting,
                geometry,
            },
        );
        self.order.push(handle_id);
    }

    /// Open a brand-new channel for `handle_id`, discarding any previous one.
    fn connect(&mut self, handle_id: &str) {
        let channel_id = self.next_channel;
        self.next_channel += 1;
        let Some(handle) = self.handles.get_mut(handle_id) else {
            return;
        };

        let mut url = self.endpoint.clone();
        match (&handle.resume_target, &handle.project_path) {
            (Some(session_id), _) => {
                url.query_pairs_mut().append_pair("session_id", session_id);
            }
            (None, Some(dir)) => {
                url.query_pairs_mut().append_pair("project_path", dir);
            }
            (None, None) => {}
        }

        let channel = TransportChannel::open(
            channel_id,
            Arc::clone(&self.dialer),
            url.to_string(),
            handle_id.to_string(),
            self.channel_tx.clone(),
        );
        if let Some(old) = handle.channel.replace(channel) {
            old.close();
        }
        handle.reconnect.on_connecting();
        let attempt = handle.reconnect.attempts();
        debug!(handle_id = %handle_id, channel = channel_id, attempt, "connecting terminal");
        publish(
            &self.status,
            TerminalEvent::Connecting {
                handle_id: handle_id.to_string(),
                attempt,
            },
        );
    }

    /// Local teardown; the remote close request is started first and
    /// returned so callers can wait on it.
    fn close(&mut self, handle_id: &str) -> Option<Closing> {
        let mut handle = self.handles.remove(handle_id)?;
        self.order.retain(|id| id != handle_id);

        handle.cancel_timer();
        handle.reconnect.cancel();

        let remote_session = match handle.status {
            TerminalStatus::Exited => None,
            _ => handle
                .server_session_id
                .clone()
                .or_else(|| handle.resume_target.clone()),
        };
        let remote = remote_session.map(|session_id| {
            let api = Arc::clone(&self.api);
            tokio::spawn(async move {
                if let Err(e) = api.close_session(&session_id).await {
                    warn!(session_id = %session_id, error = %e, "remote close failed");
                }
            })
        });

        if let Some(channel) = handle.channel.take() {
            channel.close();
        }
        handle.surface.dispose();
        if let Err(e) = self.registry.remove(handle_id) {
            warn!(handle_id = %handle_id, error = %e, "failed to remove registry entry");
        }
        self.settle(handle_id, Settle::Failed);

        info!(handle_id = %handle_id, label = %handle.label, "terminal closed");
        publish(
            &self.status,
            TerminalEvent::Closed {
                handle_id: handle_id.to_string(),
            },
        );
        Some(Closing { remote })
    }

    /// Drop every channel without touching the remote sessions or the
    /// registry, so the next process can resume them.
    fn detach_all(&mut self) {
        for (handle_id, mut handle) in self.handles.drain() {
            handle.cancel_timer();
            handle.reconnect.cancel();
            if let Some(channel) = handle.channel.take() {
                channel.close();
            }
            handle.surface.dispose();
            debug!(handle_id = %handle_id, "detached terminal");
        }
        self.order.clear();
    }

    fn input(&mut self, handle_id: &str, data: String) -> DeckResult<bool> {
        let handle = self
            .handles
            .get(handle_id)
            .ok_or_else(|| DeckError::UnknownHandle(handle_id.to_string()))?;
        Ok(send_control(handle, &ClientMessage::Input { data }))
    }

    fn resize(&mut self, handle_id: &str, geometry: Geometry) -> DeckResult<bool> {
        let handle = self
            .handles
            .get_mut(handle_id)
            .ok_or_else(|| DeckError::UnknownHandle(handle_id.to_string()))?;
        handle.geometry = geometry;
        handle.surface.resize(geometry);
        Ok(send_control(
            handle,
            &ClientMessage::Resize {
                rows: geometry.rows,
                cols: geometry.cols,
            },
        ))
    }

    // --- channel events ----------------------------------------------------

    fn on_channel_event(&mut self, notice: ChannelNotice<HandleId>) {
        let ChannelNotice {
            tag: handle_id,
            channel,
            event,
        } = notice;
        let current = self
            .handles
            .get(&handle_id)
            .and_then(|h| h.channel.as_ref())
            .map(TransportChannel::id);
        if current != Some(channel) {
            debug!(handle_id = %handle_id, channel, ?event, "ignoring event from stale channel");
            return;
        }

        match event {
            ChannelEvent::Opened => self.on_opened(&handle_id),
            ChannelEvent::Message(frame) => self.on_message(&handle_id, frame),
            ChannelEvent::Error(message) => {
                warn!(handle_id = %handle_id, error = %message, "terminal channel error");
            }
            ChannelEvent::Closed { code, clean } => self.on_closed(&handle_id, code, clean),
        }
    }

    fn on_opened(&mut self, handle_id: &str) {
        let Some(handle) = self.handles.get_mut(handle_id) else {
            return;
        };
        handle.reconnect.on_opened();
        let geometry = handle.geometry;
        send_control(
            handle,
            &ClientMessage::Resize {
                rows: geometry.rows,
                cols: geometry.cols,
            },
        );
    }

    fn on_message(&mut self, handle_id: &str, frame: Frame) {
        match decode_inbound(frame) {
            Ok(Inbound::Raw(bytes)) => {
                if let Some(handle) = self.handles.get_mut(handle_id) {
                    handle.surface.write(&bytes);
                }
            }
            Ok(Inbound::Control(HostMessage::Ready {
                is_reconnect,
                session_id,
                buffered_output,
            })) => self.on_ready(handle_id, is_reconnect, session_id, buffered_output),
            Ok(Inbound::Control(HostMessage::Exit { code, output })) => {
                self.on_exit(handle_id, code, output)
            }
            Ok(Inbound::Control(HostMessage::Error { message })) => {
                warn!(handle_id = %handle_id, error = %message, "process host reported an error");
                publish(
                    &self.status,
                    TerminalEvent::Error {
                        handle_id: handle_id.to_string(),
                        message,
                    },
                );
            }
            Err(e) => {
                warn!(handle_id = %handle_id, error = %e, "dropping malformed control envelope");
            }
        }
    }

    fn on_ready(
        &mut self,
        handle_id: &str,
        is_reconnect: bool,
        session_id: SessionId,
        buffered_output: Option<String>,
    ) {
        let Some(handle) = self.handles.get_mut(handle_id) else {
            return;
        };
        if is_reconnect {
            if let Some(output) = buffered_output {
                handle.surface.write(output.as_bytes());
            }
        } else if let Some(previous) = &handle.resume_target
            && previous != &session_id
        {
            info!(
                handle_id = %handle_id,
                previous = %previous,
                session_id = %session_id,
                "host started a fresh session in place of the old one"
            );
        }

        handle.server_session_id = Some(session_id.clone());
        handle.resume_target = Some(session_id.clone());
        handle.status = TerminalStatus::Ready;
        if let Err(e) = self.registry.put(handle_id, &session_id, &handle.label) {
            warn!(handle_id = %handle_id, error = %e, "failed to persist session");
        }
        info!(handle_id = %handle_id, session_id = %session_id, is_reconnect, "terminal ready");
        publish(
            &self.status,
            TerminalEvent::Ready {
                handle_id: handle_id.to_string(),
                session_id,
                is_reconnect,
            },
        );
        self.settle(handle_id, Settle::Restored);
    }

    fn on_exit(&mut self, handle_id: &str, code: Option<i32>, output: Option<String>) {
        let Some(handle) = self.handles.get_mut(handle_id) else {
            return;
        };
        if let Some(output) = output {
            handle.surface.write(output.as_bytes());
        }
        handle.status = TerminalStatus::Exited;
        handle.reconnect.cancel();
        handle.cancel_timer();
        if let Err(e) = self.registry.remove(handle_id) {
            warn!(handle_id = %handle_id, error = %e, "failed to remove registry entry");
        }
        info!(handle_id = %handle_id, ?code, "shell exited");
        publish(
            &self.status,
            TerminalEvent::Exited {
                handle_id: handle_id.to_string(),
                code,
            },
        );
        self.settle(handle_id, Settle::Failed);
    }

    fn on_closed(&mut self, handle_id: &str, code: Option<u16>, clean: bool) {
        let Some(handle) = self.handles.get_mut(handle_id) else {
            return;
        };
        handle.channel = None;
        if handle.status == TerminalStatus::Exited {
            return;
        }

        match handle.reconnect.on_closed(code, clean) {
            CloseDecision::Retry { attempt, delay } => {
                handle.status = TerminalStatus::Reconnecting;
                let token = self.next_token;
                self.next_token += 1;
                let timer_tx = self.timer_tx.clone();
                let fired = TimerFired {
                    handle_id: handle_id.to_string(),
                    token,
                };
                let task = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = timer_tx.send(fired);
                });
                handle.cancel_timer();
                handle.timer = Some(ReconnectTimer { token, task });
                info!(
                    handle_id = %handle_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    ?code,
                    "terminal channel closed; reconnecting"
                );
                publish(
                    &self.status,
                    TerminalEvent::Reconnecting {
                        handle_id: handle_id.to_string(),
                        attempt,
                        delay,
                    },
                );
            }
            CloseDecision::Stop => {
                handle.status = TerminalStatus::Disconnected;
                if let Err(e) = self.registry.remove(handle_id) {
                    warn!(handle_id = %handle_id, error = %e, "failed to remove registry entry");
                }
                info!(handle_id = %handle_id, "terminal channel closed normally");
                publish(
                    &self.status,
                    TerminalEvent::Disconnected {
                        handle_id: handle_id.to_string(),
                    },
                );
            }
            CloseDecision::Exhausted { attempts } => {
                handle.status = TerminalStatus::Exhausted;
                if let Err(e) = self.registry.remove(handle_id) {
                    warn!(handle_id = %handle_id, error = %e, "failed to remove registry entry");
                }
                error!(handle_id = %handle_id, attempts, "giving up on terminal reconnection");
                publish(
                    &self.status,
                    TerminalEvent::Exhausted {
                        handle_id: handle_id.to_string(),
                    },
                );
            }
        }
        self.settle(handle_id, Settle::Failed);
    }

    fn on_timer(&mut self, fired: TimerFired) {
        let Some(handle) = self.handles.get_mut(&fired.handle_id) else {
            debug!(handle_id = %fired.handle_id, "reconnect timer fired for a closed terminal");
            return;
        };
        match &handle.timer {
            Some(timer) if timer.token == fired.token => {
                handle.timer = None;
            }
            _ => {
                debug!(handle_id = %fired.handle_id, "ignoring superseded reconnect timer");
                return;
            }
        }
        if handle.reconnect.is_finished() {
            return;
        }
        self.connect(&fired.handle_id);
    }
}

fn send_control(handle: &TerminalHandle, msg: &ClientMessage) -> bool {
    let Some(channel) = handle.channel.as_ref() else {
        debug!("no channel to send on");
        return false;
    };
    match encode_control(msg) {
        Ok(frame) => channel.send(frame),
        Err(e) => {
            warn!(error = %e, "failed to encode control message");
            false
        }
    }
}
