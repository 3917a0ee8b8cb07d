use std::sync::{Arc, Mutex};

/// Terminal size in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub rows: u16,
    pub cols: u16,
}

impl Default for Geometry {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

/// Where a terminal's output is rendered. Emulation is the surface's job;
/// the manager only pushes bytes and geometry through it.
pub trait DisplaySurface: Send {
    fn write(&mut self, bytes: &[u8]);

    fn geometry(&self) -> Geometry;

    fn resize(&mut self, _geometry: Geometry) {}

    /// Release whatever the surface holds. Called once, when its handle closes.
    fn dispose(&mut self) {}
}

/// Builds a surface for a new handle from its id and label.
pub trait SurfaceFactory: Send + Sync + 'static {
    fn create(&self, handle_id: &str, label: &str) -> Box<dyn DisplaySurface>;
}

impl<F> SurfaceFactory for F
where
    F: Fn(&str, &str) -> Box<dyn DisplaySurface> + Send + Sync + 'static,
{
    fn create(&self, handle_id: &str, label: &str) -> Box<dyn DisplaySurface> {
        self(handle_id, label)
    }
}

/// Collects output in memory; clones share the buffer.
#[derive(Clone, Default)]
pub struct MemorySurface {
    buffer: Arc<Mutex<Vec<u8>>>,
    geometry: Arc<Mutex<Geometry>>,
    disposed: Arc<Mutex<bool>>,
}

impl MemorySurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        self.buffer
            .lock()
            .map(|buf| String::from_utf8_lossy(&buf).into_owned())
            .unwrap_or_default()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.lock().map(|d| *d).unwrap_or(false)
    }
}

impl DisplaySurface for MemorySurface {
    fn write(&mut self, bytes: &[u8]) {
        if let Ok(mut buf) = self.buffer.lock() {
            buf.extend_from_slice(bytes);
        }
    }

    fn geometry(&self) -> Geometry {
        self.geometry.lock().map(|g| *g).unwrap_or_default()
    }

    fn resize(&mut self, geometry: Geometry) {
        if let Ok(mut g) = self.geometry.lock() {
            *g = geometry;
        }
    }

    fn dispose(&mut self) {
        if let Ok(mut d) = self.disposed.lock() {
            *d = true;
        }
    }
}
