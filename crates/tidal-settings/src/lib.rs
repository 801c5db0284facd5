//! # tidal-settings
//!
//! Configuration for the tidal event server, loaded from three layers
//! (lowest to highest priority):
//!
//! 1. **Compiled defaults** : [`TidalSettings::default()`]
//! 2. **Settings file** : `~/.tidal/settings.json`, deep-merged over defaults
//! 3. **Environment** : `TIDAL_*` overrides

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_overrides, deep_merge, load_settings, load_settings_from_path, load_settings_with,
    settings_path,
};
pub use types::{ClusterSettings, LoggingSettings, ServerSettings, TidalSettings};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn re_exports_work() {
        let settings = TidalSettings::default();
        assert!(settings.validate().is_ok());
        let _path = settings_path();
    }
}
