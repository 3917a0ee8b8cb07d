use std::path::PathBuf;

/// Returns the config directory path for deck.
pub fn config_dir() -> PathBuf {
    if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(config_dir).join("deck")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config").join("deck")
    } else {
        PathBuf::from("/tmp/deck")
    }
}

/// Returns the config file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Returns the directory holding the durable session registry.
///
/// Priority: `$DECK_STATE_DIR`, then `$XDG_STATE_HOME/deck`, then
/// `~/.local/state/deck`.
pub fn default_state_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("DECK_STATE_DIR") {
        PathBuf::from(dir)
    } else if let Ok(state_home) = std::env::var("XDG_STATE_HOME") {
        PathBuf::from(state_home).join("deck")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".local").join("state").join("deck")
    } else {
        PathBuf::from("/tmp/deck-state")
    }
}
