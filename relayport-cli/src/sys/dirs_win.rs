extern crate dirs_sys;

use std::path::PathBuf;

use super::APP_DIR;

/// `%APPDATA%`.
pub fn config_dir() -> Option<PathBuf> {
    dirs_sys::known_folder_roaming_app_data()
}

pub fn app_config_dir() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join(APP_DIR))
}
