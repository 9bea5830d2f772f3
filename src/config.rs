use anyhow::Result;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;
use std::net::SocketAddr;

use crate::domain::ChargeMode;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub controller: ControllerConfig,
    pub site: SiteConfig,
    pub loadpoints: Vec<LoadpointConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub enable_cors: bool,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    /// Control cycle period.
    pub interval_secs: u64,
    /// Timeout for a single device read or write.
    pub io_timeout_ms: u64,
    /// Consecutive transient failures before a loadpoint faults.
    pub fail_threshold: u32,
    /// PV enable/disable guard interval.
    pub pv_debounce_secs: u64,
    /// Minimum dwell between phase transitions.
    pub phase_dwell_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    pub title: String,
    /// Reserved grid headroom in watts; negative allows grid import.
    #[serde(default)]
    pub residual_power_w: f64,
    #[serde(default = "default_voltage")]
    pub voltage_v: f64,
    pub grid_meter: Option<MeterConfig>,
    pub pv_meter: Option<MeterConfig>,
    pub battery_meter: Option<MeterConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MeterConfig {
    pub kind: DeviceKind,
    /// Initial reading for simulated meters.
    #[serde(default)]
    pub power_w: f64,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Sim,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChargerConfig {
    pub kind: DeviceKind,
    #[serde(default = "default_device_min_current")]
    pub min_current_a: f64,
    #[serde(default = "default_device_max_current")]
    pub max_current_a: f64,
    #[serde(default = "default_phases")]
    pub phases: u8,
    #[serde(default)]
    pub phase_switching: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VehicleConfig {
    pub kind: DeviceKind,
    pub title: String,
    pub capacity_kwh: f64,
    #[serde(default = "default_soc")]
    pub soc_percent: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoadpointConfig {
    pub name: String,
    pub charger: ChargerConfig,
    pub charge_meter: Option<MeterConfig>,
    pub vehicle: Option<VehicleConfig>,
    #[serde(default = "default_mode")]
    pub mode: ChargeMode,
    #[serde(default = "default_device_min_current")]
    pub min_current_a: f64,
    #[serde(default = "default_loadpoint_max_current")]
    pub max_current_a: f64,
    #[serde(default = "default_phases")]
    pub phases: u8,
    pub min_soc: Option<u8>,
    pub target_soc: Option<u8>,
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_voltage() -> f64 {
    230.0
}

fn default_device_min_current() -> f64 {
    6.0
}

fn default_device_max_current() -> f64 {
    32.0
}

fn default_loadpoint_max_current() -> f64 {
    16.0
}

fn default_phases() -> u8 {
    3
}

fn default_soc() -> f64 {
    50.0
}

fn default_mode() -> ChargeMode {
    ChargeMode::Pv
}

impl Config {
    pub fn load() -> Result<Self> {
        let figment = Figment::new()
            .merge(Toml::file("config/default.toml"))
            .merge(Env::prefixed("OCC__").split("__"));
        Ok(figment.extract()?)
    }
}
