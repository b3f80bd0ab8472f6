use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::map::pulse::PulseParams;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub port: u16,
    #[serde(default)]
    pub auto_open_browser: bool,
    pub map_style: String,
    #[serde(default)]
    pub access_token: Option<String>,
    pub frame_interval_ms: u64,
    pub pulse_frames_per_cycle: f64,
    pub pulse_max_radius: f64,
    pub pulse_initial_radius: f64,
    pub pulse_initial_opacity: f64,
    pub arrival_tolerance: f64,
    pub settle_delay_ms: u64,
    pub fly_speed: f64,
    pub fly_curve: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            auto_open_browser: false,
            map_style: DEFAULT_MAP_STYLE.to_string(),
            access_token: None,
            frame_interval_ms: FRAME_INTERVAL_MS,
            pulse_frames_per_cycle: PULSE_FRAMES_PER_CYCLE,
            pulse_max_radius: PULSE_MAX_RADIUS,
            pulse_initial_radius: PULSE_INITIAL_RADIUS,
            pulse_initial_opacity: PULSE_INITIAL_OPACITY,
            arrival_tolerance: ARRIVAL_TOLERANCE,
            settle_delay_ms: SETTLE_DELAY_MS,
            fly_speed: FLY_SPEED,
            fly_curve: FLY_CURVE,
        }
    }
}

fn parse_into<T: std::str::FromStr>(map: &HashMap<String, String>, key: &str, slot: &mut T) {
    if let Some(raw) = map.get(key) {
        if let Ok(value) = raw.trim_matches('"').parse::<T>() {
            *slot = value;
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        let mut settings = Settings::default();
        if !config_path.exists() {
            return Ok(settings);
        }

        let file = File::open(config_path).context("Failed to open config file")?;
        let reader = BufReader::new(file);
        let mut config_map = HashMap::new();

        for line in reader.lines() {
            let line = line.context("Failed to read line from config")?;
            if line.starts_with('#') || line.trim().is_empty() {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                config_map.insert(key.trim().to_string(), value.trim().to_string());
            }
        }

        parse_into(&config_map, "port", &mut settings.port);
        parse_into(&config_map, "auto_open_browser", &mut settings.auto_open_browser);
        parse_into(&config_map, "map_style", &mut settings.map_style);
        if let Some(token) = config_map.get("access_token") {
            let token = token.trim_matches('"');
            if !token.is_empty() {
                settings.access_token = Some(token.to_string());
            }
        }
        parse_into(&config_map, "frame_interval_ms", &mut settings.frame_interval_ms);
        parse_into(&config_map, "pulse_frames_per_cycle", &mut settings.pulse_frames_per_cycle);
        parse_into(&config_map, "pulse_max_radius", &mut settings.pulse_max_radius);
        parse_into(&config_map, "pulse_initial_radius", &mut settings.pulse_initial_radius);
        parse_into(&config_map, "pulse_initial_opacity", &mut settings.pulse_initial_opacity);
        parse_into(&config_map, "arrival_tolerance", &mut settings.arrival_tolerance);
        parse_into(&config_map, "settle_delay_ms", &mut settings.settle_delay_ms);
        parse_into(&config_map, "fly_speed", &mut settings.fly_speed);
        parse_into(&config_map, "fly_curve", &mut settings.fly_curve);

        // A zero frame budget would never fade the pulse
        if settings.pulse_frames_per_cycle <= 0.0 {
            settings.pulse_frames_per_cycle = PULSE_FRAMES_PER_CYCLE;
        }
        if settings.frame_interval_ms == 0 {
            settings.frame_interval_ms = FRAME_INTERVAL_MS;
        }

        Ok(settings)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).context("Creating config directory")?;
        }

        let mut content = String::new();
        content.push_str("# TowerMap Configuration File\n");
        content.push_str(&format!("port = {}\n", self.port));
        content.push_str(&format!("auto_open_browser = {}\n", self.auto_open_browser));
        content.push_str(&format!("map_style = \"{}\"\n", self.map_style));
        if let Some(ref token) = self.access_token {
            content.push_str(&format!("access_token = \"{}\"\n", token));
        }
        content.push_str(&format!("frame_interval_ms = {}\n", self.frame_interval_ms));
        content.push_str(&format!("pulse_frames_per_cycle = {}\n", self.pulse_frames_per_cycle));
        content.push_str(&format!("pulse_max_radius = {}\n", self.pulse_max_radius));
        content.push_str(&format!("pulse_initial_radius = {}\n", self.pulse_initial_radius));
        content.push_str(&format!("pulse_initial_opacity = {}\n", self.pulse_initial_opacity));
        content.push_str(&format!("arrival_tolerance = {}\n", self.arrival_tolerance));
        content.push_str(&format!("settle_delay_ms = {}\n", self.settle_delay_ms));
        content.push_str(&format!("fly_speed = {}\n", self.fly_speed));
        content.push_str(&format!("fly_curve = {}\n", self.fly_curve));

        std::fs::write(config_path, content).context("Failed to write to config file")?;
        Ok(())
    }

    pub fn pulse_params(&self) -> PulseParams {
        PulseParams {
            frames_per_cycle: self.pulse_frames_per_cycle,
            max_radius: self.pulse_max_radius,
            initial_radius: self.pulse_initial_radius,
            initial_opacity: self.pulse_initial_opacity,
        }
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn config_path() -> PathBuf {
        let mut path = std::env::current_exe()
            .unwrap_or_default()
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();

        if path.ends_with("target/debug") || path.ends_with("target/release") {
            path.pop();
            path.pop();
        }
        path.push("towermap.ini");
        path
    }
}
