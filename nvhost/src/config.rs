// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::path::PathBuf;
use std::str::FromStr;

use ini::{Ini, Properties};
use log::{debug, info, warn};
use nvhost_common::settings::{ChipGeneration, Host1xSettings, IntrMode};

/// Locate `nvhost/nvhost.ini` in the user's config directory.
pub fn find_config_path() -> Option<PathBuf> {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        let path = PathBuf::from(&xdg).join("nvhost").join("nvhost.ini");
        if path.exists() {
            return Some(path);
        }
    }

    if let Ok(home) = std::env::var("HOME") {
        let path = PathBuf::from(&home).join(".config").join("nvhost").join("nvhost.ini");
        if path.exists() {
            return Some(path);
        }
    }

    None
}

/// Load settings from an INI file, falling back to defaults.
pub fn load_config(path: Option<&PathBuf>) -> Host1xSettings {
    let config_path = match path {
        Some(p) => {
            if !p.exists() {
                warn!("Config file not found: {}", p.display());
                return Host1xSettings::default();
            }
            p.clone()
        }
        None => match find_config_path() {
            Some(p) => p,
            None => {
                info!("No config found, using defaults");
                return Host1xSettings::default();
            }
        },
    };

    info!("Loading config from: {}", config_path.display());
    match Ini::load_from_file(&config_path) {
        Ok(conf) => settings_from_ini(&conf),
        Err(e) => {
            warn!("Failed to parse config: {}", e);
            Host1xSettings::default()
        }
    }
}

/// Parse `key` into `slot`, keeping the current value if it is unparsable.
fn set<T: FromStr>(section: &Properties, key: &str, slot: &mut T) {
    if let Some(raw) = section.get(key) {
        match raw.trim().parse() {
            Ok(v) => *slot = v,
            Err(_) => warn!("Ignoring invalid {} = \"{}\"", key, raw),
        }
    }
}

fn parse_bool(raw: &str) -> bool {
    matches!(raw.trim(), "1" | "true")
}

pub fn settings_from_ini(conf: &Ini) -> Host1xSettings {
    let mut settings = Host1xSettings::default();

    // [Host1x]
    if let Some(section) = conf.section(Some("Host1x")) {
        if let Some(chip) = section.get("chip") {
            settings.chip = ChipGeneration::from_str_or_default(chip);
            debug!("Chip: {:?}", settings.chip);
        }
        set(section, "push_buffer_slots", &mut settings.push_buffer_slots);
        if !settings.push_buffer_slots.is_power_of_two() || settings.push_buffer_slots < 16 {
            warn!("push_buffer_slots must be a power of two >= 16, using the default");
            settings.push_buffer_slots = Host1xSettings::default().push_buffer_slots;
        }
        set(section, "cdma_timeout_ms", &mut settings.cdma_timeout_ms);
        set(section, "submit_wait_ms", &mut settings.submit_wait_ms);
        if let Some(mode) = section.get("intr_mode") {
            settings.intr_mode = IntrMode::from_str_or_default(mode);
            debug!("Interrupt mode: {:?}", settings.intr_mode);
        }
        set(section, "poll_period_ms", &mut settings.poll_period_ms);
        set(section, "max_waiters", &mut settings.max_waiters);
        set(section, "syncpt_check_period_ms", &mut settings.syncpt_check_period_ms);
        set(section, "max_stuck_checks", &mut settings.max_stuck_checks);
    }

    // [Debug]
    if let Some(section) = conf.section(Some("Debug")) {
        if let Some(dump) = section.get("debug_dump") {
            settings.debug_dump = parse_bool(dump);
        }
    }

    settings
}
