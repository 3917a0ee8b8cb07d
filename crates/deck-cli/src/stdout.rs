use std::io::Write;
use std::sync::{Arc, Mutex};

use libdeck::{DisplaySurface, Geometry, SurfaceFactory};

/// Which handle currently owns stdout.
#[derive(Clone, Default)]
pub struct Focus(Arc<Mutex<Option<String>>>);

impl Focus {
    pub fn set(&self, handle_id: &str) {
        if let Ok(mut focus) = self.0.lock() {
            *focus = Some(handle_id.to_string());
        }
    }

    fn is(&self, handle_id: &str) -> bool {
        self.0
            .lock()
            .map(|focus| focus.as_deref() == Some(handle_id))
            .unwrap_or(false)
    }
}

/// Writes a terminal's output straight to stdout while it has focus;
/// background terminals are discarded.
pub struct StdoutSurface {
    handle_id: String,
    focus: Focus,
    geometry: Geometry,
}

impl DisplaySurface for StdoutSurface {
    fn write(&mut self, bytes: &[u8]) {
        if !self.focus.is(&self.handle_id) {
            return;
        }
        let mut stdout = std::io::stdout();
        let _ = stdout.write_all(bytes);
        let _ = stdout.flush();
    }

    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn resize(&mut self, geometry: Geometry) {
        self.geometry = geometry;
    }
}

pub fn factory(focus: Focus, geometry: Geometry) -> Arc<dyn SurfaceFactory> {
    Arc::new(move |handle_id: &str, _label: &str| -> Box<dyn DisplaySurface> {
        Box::new(StdoutSurface {
            handle_id: handle_id.to_string(),
            focus: focus.clone(),
            geometry,
        })
    })
}
