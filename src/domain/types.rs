use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Device-level errors shared by all capability interfaces.
///
/// `NotSupported` is permanent: the capability is absent and the caller must
/// cache that outcome instead of retrying. Everything else is transient and
/// feeds the per-operation failure counters.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeviceError {
    #[error("operation not supported by device")]
    NotSupported,
    #[error("device operation timed out")]
    Timeout,
    #[error("communication error: {0}")]
    Communication(String),
    #[error("invalid value: {0}")]
    InvalidValue(String),
}

impl DeviceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DeviceError::Timeout | DeviceError::Communication(_))
    }
}

pub type DeviceResult<T> = Result<T, DeviceError>;

/// Outcome of a single capability read within one cycle.
///
/// The controller branches on this tag instead of inspecting device types:
/// `Unsupported` is cached as a missing capability, `Failed` counts toward
/// fault escalation while the last known value is reused.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reading<T> {
    Value(T),
    Failed,
    Unsupported,
}

impl<T> Reading<T> {
    pub fn from_result(res: DeviceResult<T>) -> Self {
        match res {
            Ok(v) => Reading::Value(v),
            Err(DeviceError::NotSupported) => Reading::Unsupported,
            Err(_) => Reading::Failed,
        }
    }

    pub fn value(self) -> Option<T> {
        match self {
            Reading::Value(v) => Some(v),
            Reading::Failed | Reading::Unsupported => None,
        }
    }
}

/// Charging policy of a loadpoint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChargeMode {
    Off,
    Now,
    #[serde(rename = "minpv")]
    MinPv,
    Pv,
}

impl fmt::Display for ChargeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChargeMode::Off => "off",
            ChargeMode::Now => "now",
            ChargeMode::MinPv => "minpv",
            ChargeMode::Pv => "pv",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for ChargeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(ChargeMode::Off),
            "now" => Ok(ChargeMode::Now),
            "minpv" => Ok(ChargeMode::MinPv),
            "pv" => Ok(ChargeMode::Pv),
            _ => Err(format!("invalid charge mode: {s}")),
        }
    }
}

/// IEC 61851-1 connector state as reported by the charger.
///
/// A = unplugged, B = connected, C = charging, D = charging with ventilation,
/// E/F = error.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConnectorStatus {
    A,
    B,
    C,
    D,
    E,
    F,
}

impl ConnectorStatus {
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            ConnectorStatus::B | ConnectorStatus::C | ConnectorStatus::D
        )
    }

    pub fn is_charging(self) -> bool {
        matches!(self, ConnectorStatus::C | ConnectorStatus::D)
    }

    pub fn is_fault(self) -> bool {
        matches!(self, ConnectorStatus::E | ConnectorStatus::F)
    }
}

impl fmt::Display for ConnectorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectorStatus::A => "A",
            ConnectorStatus::B => "B",
            ConnectorStatus::C => "C",
            ConnectorStatus::D => "D",
            ConnectorStatus::E => "E",
            ConnectorStatus::F => "F",
        };
        f.write_str(s)
    }
}

/// Controller-side state of a loadpoint, derived from connector status and
/// device health each cycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LoadpointState {
    Disconnected,
    Connected,
    Charging,
    Suspended,
    Fault,
}

/// External override of the mode policy. `Auto` clears any active override.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RemoteDemand {
    #[serde(rename = "auto")]
    Auto,
    #[serde(rename = "start")]
    ForceStart,
    #[serde(rename = "soft")]
    SoftStop,
    #[serde(rename = "hard")]
    HardStop,
}

impl std::str::FromStr for RemoteDemand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" | "" => Ok(RemoteDemand::Auto),
            "start" => Ok(RemoteDemand::ForceStart),
            "soft" => Ok(RemoteDemand::SoftStop),
            "hard" => Ok(RemoteDemand::HardStop),
            _ => Err(format!("invalid remote demand: {s}")),
        }
    }
}

/// An active remote override and the relay that set it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteOverride {
    pub source: String,
    pub demand: RemoteDemand,
}

/// Per-cycle command issued to the charger.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Command {
    pub enable: bool,
    pub current_a: f64,
    pub phases: u8,
}

impl Command {
    pub fn disabled(phases: u8) -> Self {
        Self {
            enable: false,
            current_a: 0.0,
            phases,
        }
    }
}

/// Power a loadpoint asks the allocator for, split into the guaranteed share
/// (mode policy plus planner floor) and the opportunistic cap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChargePointDemand {
    pub requested_w: f64,
    pub max_w: f64,
}

impl ChargePointDemand {
    pub fn none() -> Self {
        Self {
            requested_w: 0.0,
            max_w: 0.0,
        }
    }
}

/// Consecutive-failure counter for one device operation.
///
/// Resets on success; trips once the configured number of consecutive
/// transient failures is reached.
#[derive(Debug, Clone)]
pub struct FaultCounter {
    threshold: u32,
    consecutive: u32,
}

impl FaultCounter {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive: 0,
        }
    }

    pub fn record_ok(&mut self) {
        self.consecutive = 0;
    }

    /// Records a transient failure and returns whether the counter tripped.
    pub fn record_err(&mut self) -> bool {
        self.consecutive = self.consecutive.saturating_add(1);
        self.tripped()
    }

    pub fn tripped(&self) -> bool {
        self.consecutive >= self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn charge_mode_round_trip() {
        for (s, m) in [
            ("off", ChargeMode::Off),
            ("now", ChargeMode::Now),
            ("minpv", ChargeMode::MinPv),
            ("pv", ChargeMode::Pv),
        ] {
            assert_eq!(s.parse::<ChargeMode>().unwrap(), m);
            assert_eq!(m.to_string(), s);
        }
        assert!("fast".parse::<ChargeMode>().is_err());
    }

    #[test]
    fn connector_status_classification() {
        assert!(!ConnectorStatus::A.is_connected());
        assert!(ConnectorStatus::B.is_connected());
        assert!(ConnectorStatus::C.is_charging());
        assert!(ConnectorStatus::D.is_charging());
        assert!(ConnectorStatus::E.is_fault());
        assert!(ConnectorStatus::F.is_fault());
    }

    #[test]
    fn reading_tags_device_errors() {
        assert_eq!(Reading::from_result(Ok(1.0)), Reading::Value(1.0));
        assert_eq!(
            Reading::<f64>::from_result(Err(DeviceError::NotSupported)),
            Reading::Unsupported
        );
        assert_eq!(
            Reading::<f64>::from_result(Err(DeviceError::Timeout)),
            Reading::Failed
        );
    }

    #[test]
    fn fault_counter_trips_and_resets() {
        let mut c = FaultCounter::new(3);
        assert!(!c.record_err());
        assert!(!c.record_err());
        assert!(c.record_err());
        assert!(c.tripped());
        c.record_ok();
        assert!(!c.tripped());
    }
}
