use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use reqwest::Url;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use deck_protocol::{BusEvent, ExecutionRecord, ExecutionStatus, ExecutionUpdate, Frame};

use crate::api::ConsoleApi;
use crate::config::join_path;
use crate::error::{DeckError, DeckResult};
use crate::reconnect::{CloseDecision, ReconnectPolicy, ReconnectState};
use crate::registry::PendingExecutionIndex;
use crate::transport::{ChannelEvent, ChannelId, ChannelNotice, Dialer, TransportChannel};

const COMMAND_BUFFER: usize = 32;
const NOTIFICATION_BUFFER: usize = 128;

#[derive(Debug, Clone)]
pub struct BusSettings {
    pub ws_base: Url,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Bound on each startup lookup of a pending execution.
    pub lookup_timeout: Duration,
}

impl BusSettings {
    pub fn new(ws_base: Url) -> Self {
        Self {
            ws_base,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            lookup_timeout: Duration::from_secs(5),
        }
    }
}

/// Raised once per transition into a terminal status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub execution_id: String,
    pub kind: String,
    pub status: ExecutionStatus,
    pub message: String,
}

/// In-memory view of every execution seen this run, mirrored into the
/// pending index while an execution is still in flight.
pub struct ExecutionTable {
    records: HashMap<String, ExecutionRecord>,
    index: PendingExecutionIndex,
}

impl ExecutionTable {
    pub fn new(index: PendingExecutionIndex) -> Self {
        Self {
            records: HashMap::new(),
            index,
        }
    }

    /// Merge `update` and report whether it moved the execution into a
    /// terminal status. Status is compared before and after the merge, so a
    /// repeated terminal update never notifies twice.
    pub fn apply(&mut self, update: ExecutionUpdate) -> Option<Notification> {
        let previous = self.records.get(&update.id).map(|r| r.status);
        let record = match self.records.entry(update.id.clone()) {
            Entry::Occupied(entry) => {
                let record = entry.into_mut();
                record.merge(update);
                record
            }
            Entry::Vacant(entry) => entry.insert(ExecutionRecord::from_update(update)),
        };

        if let Some(key) = &record.correlation_key {
            let result = if record.status.is_terminal() {
                self.index.remove(key).map(|_| ())
            } else {
                self.index.put(key, &record.id)
            };
            if let Err(e) = result {
                warn!(execution_id = %record.id, error = %e, "failed to update pending index");
            }
        }

        if previous == Some(record.status) || !record.status.is_terminal() {
            return None;
        }
        let kind = if record.kind.is_empty() {
            "execution"
        } else {
            record.kind.as_str()
        };
        Some(Notification {
            execution_id: record.id.clone(),
            kind: record.kind.clone(),
            status: record.status,
            message: format!("{kind} {} {}", record.id, record.status.as_str()),
        })
    }

    pub fn get(&self, id: &str) -> Option<&ExecutionRecord> {
        self.records.get(id)
    }

    /// Snapshot ordered by id.
    pub fn records(&self) -> Vec<ExecutionRecord> {
        let mut records: Vec<_> = self.records.values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }
}

/// Front end to the execution bus task.
#[derive(Clone)]
pub struct ExecutionBusHandle {
    client_id: String,
    commands: mpsc::Sender<BusCommand>,
    notifications: broadcast::Sender<Notification>,
}

enum BusCommand {
    Records {
        reply: oneshot::Sender<Vec<ExecutionRecord>>,
    },
    Get {
        id: String,
        reply: oneshot::Sender<Option<ExecutionRecord>>,
    },
    Track {
        update: ExecutionUpdate,
        reply: oneshot::Sender<Option<Notification>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Start the bus: seed the table from the pending index, then subscribe to
/// live updates. The returned receiver is subscribed before any work starts,
/// so it also sees notifications raised while seeding.
pub fn spawn(
    settings: BusSettings,
    dialer: Arc<dyn Dialer>,
    api: Arc<dyn ConsoleApi>,
    index: PendingExecutionIndex,
) -> DeckResult<(ExecutionBusHandle, broadcast::Receiver<Notification>)> {
    let client_id = uuid::Uuid::new_v4().to_string();
    let mut endpoint = join_path(&settings.ws_base, &["ws", "executions"])?;
    endpoint
        .query_pairs_mut()
        .append_pair("client_id", &client_id);

    let (commands, command_rx) = mpsc::channel(COMMAND_BUFFER);
    let (notifications, first_rx) = broadcast::channel(NOTIFICATION_BUFFER);
    let (channel_tx, channel_rx) = mpsc::unbounded_channel();

    let bus = ExecutionBus {
        reconnect: ReconnectState::new(ReconnectPolicy::Exponential {
            base: settings.base_delay,
            max_delay: settings.max_delay,
        }),
        settings,
        endpoint,
        dialer,
        api,
        table: ExecutionTable::new(index.clone()),
        index,
        channel: None,
        next_channel: 0,
        retry_at: None,
        channel_tx,
        notifications: notifications.clone(),
    };
    tokio::spawn(bus.run(command_rx, channel_rx));

    Ok((
        ExecutionBusHandle {
            client_id,
            commands,
            notifications,
        },
        first_rx,
    ))
}

impl ExecutionBusHandle {
    async fn request<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> BusCommand,
    ) -> DeckResult<R> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| DeckError::Stopped("execution bus"))?;
        rx.await.map_err(|_| DeckError::Stopped("execution bus"))
    }

    /// Random id this bus subscribed under.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    pub async fn records(&self) -> DeckResult<Vec<ExecutionRecord>> {
        self.request(|reply| BusCommand::Records { reply }).await
    }

    pub async fn get(&self, id: &str) -> DeckResult<Option<ExecutionRecord>> {
        let id = id.to_string();
        self.request(|reply| BusCommand::Get { id, reply }).await
    }

    /// Merge an update known locally, e.g. the response to starting a job,
    /// exactly as if it had arrived on the channel.
    pub async fn track(&self, update: ExecutionUpdate) -> DeckResult<Option<Notification>> {
        self.request(|reply| BusCommand::Track { update, reply })
            .await
    }

    pub async fn shutdown(&self) -> DeckResult<()> {
        self.request(|reply| BusCommand::Shutdown { reply }).await
    }
}

struct ExecutionBus {
    settings: BusSettings,
    endpoint: Url,
    dialer: Arc<dyn Dialer>,
    api: Arc<dyn ConsoleApi>,
    table: ExecutionTable,
    index: PendingExecutionIndex,
    channel: Option<TransportChannel>,
    next_channel: ChannelId,
    reconnect: ReconnectState,
    retry_at: Option<Instant>,
    channel_tx: mpsc::UnboundedSender<ChannelNotice<()>>,
    notifications: broadcast::Sender<Notification>,
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl ExecutionBus {
    async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<BusCommand>,
        mut channel_rx: mpsc::UnboundedReceiver<ChannelNotice<()>>,
    ) {
        self.restore_pending().await;
        self.connect();

        loop {
            tokio::select! {
                cmd = command_rx.recv() => match cmd {
                    Some(BusCommand::Shutdown { reply }) => {
                        self.stop();
                        let _ = reply.send(());
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        self.stop();
                        break;
                    }
                },
                Some(notice) = channel_rx.recv() => self.on_channel_event(notice),
                _ = wait_until(self.retry_at) => {
                    self.retry_at = None;
                    self.connect();
                }
            }
        }
        info!("execution bus stopped");
    }

    fn handle_command(&mut self, cmd: BusCommand) {
        match cmd {
            BusCommand::Records { reply } => {
                let _ = reply.send(self.table.records());
            }
            BusCommand::Get { id, reply } => {
                let _ = reply.send(self.table.get(&id).cloned());
            }
            BusCommand::Track { update, reply } => {
                let _ = reply.send(self.apply(update));
            }
            BusCommand::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    /// Re-fetch everything that was in flight when the last run ended.
    async fn restore_pending(&mut self) {
        let entries = match self.index.get_all() {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "cannot read pending execution index");
                return;
            }
        };
        if entries.is_empty() {
            return;
        }
        info!(count = entries.len(), "re-fetching pending executions");

        let lookup_timeout = self.settings.lookup_timeout;
        let lookups = entries.into_iter().map(|(key, execution_id)| {
            let api = Arc::clone(&self.api);
            async move {
                let result = tokio::time::timeout(lookup_timeout, api.fetch_execution(&key)).await;
                (key, execution_id, result)
            }
        });

        for (key, execution_id, result) in join_all(lookups).await {
            match result {
                Ok(Ok(Some(record))) => {
                    let mut update = ExecutionUpdate::from(record);
                    update.correlation_key.get_or_insert(key);
                    self.apply(update);
                }
                Ok(Ok(None)) => {
                    info!(correlation_key = %key, execution_id = %execution_id, "execution no longer known; forgetting it");
                    if let Err(e) = self.index.remove(&key) {
                        warn!(correlation_key = %key, error = %e, "failed to drop pending entry");
                    }
                }
                Ok(Err(e)) => {
                    warn!(correlation_key = %key, error = %e, "execution lookup failed; keeping entry");
                }
                Err(_) => {
                    warn!(correlation_key = %key, timeout_ms = lookup_timeout.as_millis() as u64, "execution lookup timed out; keeping entry");
                }
            }
        }
    }

    fn apply(&mut self, update: ExecutionUpdate) -> Option<Notification> {
        let notification = self.table.apply(update)?;
        info!(
            execution_id = %notification.execution_id,
            status = notification.status.as_str(),
            "execution finished"
        );
        let _ = self.notifications.send(notification.clone());
        Some(notification)
    }

    fn connect(&mut self) {
        let channel_id = self.next_channel;
        self.next_channel += 1;
        self.reconnect.on_connecting();
        debug!(channel = channel_id, attempt = self.reconnect.attempts(), "connecting execution channel");
        let channel = TransportChannel::open(
            channel_id,
            Arc::clone(&self.dialer),
            self.endpoint.to_string(),
            (),
            self.channel_tx.clone(),
        );
        if let Some(old) = self.channel.replace(channel) {
            old.close();
        }
    }

    fn stop(&mut self) {
        self.reconnect.cancel();
        self.retry_at = None;
        if let Some(channel) = self.channel.take() {
            channel.close();
        }
    }

    fn on_channel_event(&mut self, notice: ChannelNotice<()>) {
        if self.channel.as_ref().map(TransportChannel::id) != Some(notice.channel) {
            debug!(channel = notice.channel, "ignoring event from stale execution channel");
            return;
        }
        match notice.event {
            ChannelEvent::Opened => {
                self.reconnect.on_opened();
                info!("execution channel open");
            }
            ChannelEvent::Message(frame) => self.on_frame(frame),
            ChannelEvent::Error(message) => {
                warn!(error = %message, "execution channel error");
            }
            ChannelEvent::Closed { code, clean } => {
                self.channel = None;
                match self.reconnect.on_closed(code, clean) {
                    CloseDecision::Retry { attempt, delay } => {
                        info!(attempt, delay_ms = delay.as_millis() as u64, ?code, "execution channel closed; reconnecting");
                        self.retry_at = Some(Instant::now() + delay);
                    }
                    CloseDecision::Stop | CloseDecision::Exhausted { .. } => {
                        info!(?code, "execution channel closed by server");
                    }
                }
            }
        }
    }

    fn on_frame(&mut self, frame: Frame) {
        let parsed = match &frame {
            Frame::Text(text) => serde_json::from_str::<BusEvent>(text),
            Frame::Binary(data) => serde_json::from_slice::<BusEvent>(data),
        };
        match parsed {
            Ok(BusEvent::ExecutionUpdate { execution }) => {
                self.apply(execution);
            }
            Ok(BusEvent::Other) => debug!("ignoring unrelated bus event"),
            Err(e) => warn!(error = %e, "dropping malformed execution event"),
        }
    }
}
