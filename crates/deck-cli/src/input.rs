use libdeck::Geometry;

/// Turns raw stdin reads into text without splitting a multibyte character
/// across two input messages.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    /// Decode everything complete so far. An unfinished sequence at the end
    /// is held back for the next call; bytes that can never form UTF-8 become
    /// U+FFFD.
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut text = String::new();
        let mut rest: &[u8] = &self.pending;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    text.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        let held = rest.to_vec();
        self.pending = held;
        text
    }
}

/// Remembers the last geometry sent so repeated window-change signals with
/// an unchanged size do not produce resize messages.
#[derive(Debug)]
pub struct SizeTracker {
    last: Geometry,
}

impl SizeTracker {
    pub fn new(initial: Geometry) -> Self {
        Self { last: initial }
    }

    pub fn observe(&mut self, cols: u16, rows: u16) -> Option<Geometry> {
        let next = Geometry { rows, cols };
        if next == self.last || rows == 0 || cols == 0 {
            return None;
        }
        self.last = next;
        Some(next)
    }
}
