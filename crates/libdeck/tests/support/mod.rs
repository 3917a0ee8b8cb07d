#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use reqwest::Url;
use tokio::sync::broadcast;

use deck_protocol::ExecutionRecord;
use libdeck::memory::{MemoryDialer, MemoryHost};
use libdeck::{
    ConsoleApi, DeckError, DeckResult, DisplaySurface, ManagerHandle, ManagerSettings,
    MemorySurface, SessionRegistry, StateStore, SurfaceFactory, TerminalEvent,
};

pub fn ws_base() -> Url {
    Url::parse("ws://deck.test/").unwrap()
}

/// Lookup result scripted per correlation key.
#[derive(Clone)]
pub enum Lookup {
    Found(ExecutionRecord),
    Missing,
    Fails,
    Hangs,
}

/// Records every close request; lookups answer from a script.
#[derive(Clone, Default)]
pub struct RecordingApi {
    closed: Arc<Mutex<Vec<String>>>,
    failing: Arc<Mutex<HashSet<String>>>,
    lookups: Arc<Mutex<HashMap<String, Lookup>>>,
}

impl RecordingApi {
    pub fn closed(&self) -> Vec<String> {
        let mut closed = self.closed.lock().unwrap().clone();
        closed.sort();
        closed
    }

    pub fn fail_close_for(&self, session_id: &str) {
        self.failing.lock().unwrap().insert(session_id.to_string());
    }

    pub fn script_lookup(&self, key: &str, lookup: Lookup) {
        self.lookups.lock().unwrap().insert(key.to_string(), lookup);
    }
}

impl ConsoleApi for RecordingApi {
    fn close_session(&self, session_id: &str) -> BoxFuture<'static, DeckResult<()>> {
        let closed = Arc::clone(&self.closed);
        let fails = self.failing.lock().unwrap().contains(session_id);
        let session_id = session_id.to_string();
        async move {
            closed.lock().unwrap().push(session_id.clone());
            if fails {
                Err(DeckError::Api(format!("close {session_id} rejected")))
            } else {
                Ok(())
            }
        }
        .boxed()
    }

    fn fetch_execution(
        &self,
        correlation_key: &str,
    ) -> BoxFuture<'static, DeckResult<Option<ExecutionRecord>>> {
        let lookup = self.lookups.lock().unwrap().get(correlation_key).cloned();
        async move {
            match lookup {
                Some(Lookup::Found(record)) => Ok(Some(record)),
                Some(Lookup::Missing) => Ok(None),
                Some(Lookup::Hangs) => std::future::pending().await,
                Some(Lookup::Fails) | None => {
                    Err(DeckError::Connection("backend unavailable".to_string()))
                }
            }
        }
        .boxed()
    }
}

/// Memory surfaces keyed by handle id, filled in as the manager creates them.
#[derive(Clone, Default)]
pub struct Surfaces(Arc<Mutex<HashMap<String, MemorySurface>>>);

impl Surfaces {
    pub fn get(&self, handle_id: &str) -> MemorySurface {
        self.0.lock().unwrap().get(handle_id).cloned().unwrap()
    }

    pub fn factory(&self) -> Arc<dyn SurfaceFactory> {
        let surfaces = self.clone();
        Arc::new(move |handle_id: &str, _label: &str| -> Box<dyn DisplaySurface> {
            let surface = MemorySurface::new();
            surfaces
                .0
                .lock()
                .unwrap()
                .insert(handle_id.to_string(), surface.clone());
            Box::new(surface)
        })
    }
}

pub struct TerminalHarness {
    pub manager: ManagerHandle,
    pub events: broadcast::Receiver<TerminalEvent>,
    pub host: MemoryHost,
    pub dialer: MemoryDialer,
    pub api: RecordingApi,
    pub surfaces: Surfaces,
    pub registry: SessionRegistry,
}

pub fn in_memory_registry() -> SessionRegistry {
    SessionRegistry::new(StateStore::open_in_memory().unwrap())
}

pub fn terminal_harness(registry: SessionRegistry) -> TerminalHarness {
    let (dialer, host) = MemoryDialer::new();
    let api = RecordingApi::default();
    let surfaces = Surfaces::default();
    let manager = libdeck::manager::spawn(
        ManagerSettings::new(ws_base()),
        Arc::new(dialer.clone()),
        Arc::new(api.clone()),
        registry.clone(),
        surfaces.factory(),
    )
    .unwrap();
    let events = manager.subscribe();
    TerminalHarness {
        manager,
        events,
        host,
        dialer,
        api,
        surfaces,
        registry,
    }
}

/// Next event matching `pred`, skipping the rest.
pub async fn wait_for<T, F>(rx: &mut broadcast::Receiver<T>, pred: F) -> T
where
    T: Clone + std::fmt::Debug,
    F: Fn(&T) -> bool,
{
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(e) => panic!("event stream ended: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}
