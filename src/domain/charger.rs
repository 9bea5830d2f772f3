use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::types::{ConnectorStatus, DeviceError, DeviceResult};

/// Charger capability interface.
///
/// `status`, `enabled`, `enable` and `set_current` are mandatory; the
/// remaining capabilities default to `NotSupported` so drivers only implement
/// what the hardware offers. The controller caches `NotSupported` outcomes
/// and never retries them.
#[async_trait]
pub trait Charger: Send + Sync {
    async fn status(&self) -> DeviceResult<ConnectorStatus>;

    async fn enabled(&self) -> DeviceResult<bool>;

    async fn enable(&self, on: bool) -> DeviceResult<()>;

    /// Sets the maximum current the vehicle may draw, in amps.
    async fn set_current(&self, amps: f64) -> DeviceResult<()>;

    /// Switches the number of active phases (1 or 3).
    async fn set_phases(&self, phases: u8) -> DeviceResult<()> {
        let _ = phases;
        Err(DeviceError::NotSupported)
    }

    /// Instantaneous charge power in watts, if the charger has a meter.
    async fn charge_power(&self) -> DeviceResult<f64> {
        Err(DeviceError::NotSupported)
    }

    /// Per-phase currents in amps.
    async fn currents(&self) -> DeviceResult<(f64, f64, f64)> {
        Err(DeviceError::NotSupported)
    }

    /// Cumulative delivered energy in kWh.
    async fn total_energy(&self) -> DeviceResult<f64> {
        Err(DeviceError::NotSupported)
    }

    fn capabilities(&self) -> ChargerCapabilities;
}

#[derive(Debug, Clone)]
pub struct ChargerCapabilities {
    pub min_current_a: f64,
    pub max_current_a: f64,
    pub phases: u8,
    pub phase_switching: bool,
}

impl Default for ChargerCapabilities {
    fn default() -> Self {
        Self {
            min_current_a: 6.0,
            max_current_a: 32.0,
            phases: 3,
            phase_switching: false,
        }
    }
}

#[derive(Debug, Clone)]
struct SimChargerState {
    status: ConnectorStatus,
    enabled: bool,
    current_a: f64,
    phases: u8,
    energy_kwh: f64,
    failing: bool,
}

/// Simulated charger for development and testing.
///
/// Tracks enable/current/phase commands and synthesizes connector status,
/// power and energy from them. `set_failing` makes every device operation
/// return a communication error, which the controller must absorb.
#[derive(Debug)]
pub struct SimulatedCharger {
    state: Arc<RwLock<SimChargerState>>,
    caps: ChargerCapabilities,
    voltage_v: f64,
}

impl SimulatedCharger {
    pub fn new(caps: ChargerCapabilities, voltage_v: f64) -> Self {
        let state = SimChargerState {
            status: ConnectorStatus::A,
            enabled: false,
            current_a: 0.0,
            phases: caps.phases,
            energy_kwh: 0.0,
            failing: false,
        };
        Self {
            state: Arc::new(RwLock::new(state)),
            caps,
            voltage_v,
        }
    }

    pub async fn simulate_connect(&self) {
        let mut st = self.state.write().await;
        if st.status == ConnectorStatus::A {
            st.status = ConnectorStatus::B;
        }
    }

    pub async fn simulate_disconnect(&self) {
        let mut st = self.state.write().await;
        st.status = ConnectorStatus::A;
        st.current_a = 0.0;
    }

    pub async fn simulate_fault(&self) {
        self.state.write().await.status = ConnectorStatus::E;
    }

    pub async fn set_failing(&self, failing: bool) {
        self.state.write().await.failing = failing;
    }

    /// Advances the simulation: a connected, enabled charger with a viable
    /// current draws power and accrues energy.
    pub async fn step(&self, seconds: f64) {
        let mut st = self.state.write().await;
        if st.status.is_fault() || st.status == ConnectorStatus::A {
            return;
        }
        st.status = if st.enabled && st.current_a > 0.0 {
            ConnectorStatus::C
        } else {
            ConnectorStatus::B
        };
        if st.status == ConnectorStatus::C {
            let power_w = st.current_a * self.voltage_v * f64::from(st.phases);
            st.energy_kwh += power_w / 1000.0 * (seconds / 3600.0);
        }
    }

    async fn guard(&self) -> DeviceResult<()> {
        if self.state.read().await.failing {
            Err(DeviceError::Communication("simulated outage".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Charger for SimulatedCharger {
    async fn status(&self) -> DeviceResult<ConnectorStatus> {
        self.guard().await?;
        Ok(self.state.read().await.status)
    }

    async fn enabled(&self) -> DeviceResult<bool> {
        self.guard().await?;
        Ok(self.state.read().await.enabled)
    }

    async fn enable(&self, on: bool) -> DeviceResult<()> {
        self.guard().await?;
        let mut st = self.state.write().await;
        st.enabled = on;
        if !on {
            st.current_a = 0.0;
            if st.status.is_charging() {
                st.status = ConnectorStatus::B;
            }
        }
        Ok(())
    }

    async fn set_current(&self, amps: f64) -> DeviceResult<()> {
        self.guard().await?;
        if amps < 0.0 || amps > self.caps.max_current_a {
            return Err(DeviceError::InvalidValue(format!(
                "{amps}A outside 0..{}A",
                self.caps.max_current_a
            )));
        }
        self.state.write().await.current_a = amps;
        Ok(())
    }

    async fn set_phases(&self, phases: u8) -> DeviceResult<()> {
        self.guard().await?;
        if !self.caps.phase_switching {
            return Err(DeviceError::NotSupported);
        }
        if phases != 1 && phases != 3 {
            return Err(DeviceError::InvalidValue(format!("{phases} phases")));
        }
        self.state.write().await.phases = phases;
        Ok(())
    }

    async fn charge_power(&self) -> DeviceResult<f64> {
        self.guard().await?;
        let st = self.state.read().await;
        if st.status.is_charging() {
            Ok(st.current_a * self.voltage_v * f64::from(st.phases))
        } else {
            Ok(0.0)
        }
    }

    async fn currents(&self) -> DeviceResult<(f64, f64, f64)> {
        self.guard().await?;
        let st = self.state.read().await;
        if !st.status.is_charging() {
            return Ok((0.0, 0.0, 0.0));
        }
        match st.phases {
            1 => Ok((st.current_a, 0.0, 0.0)),
            _ => Ok((st.current_a, st.current_a, st.current_a)),
        }
    }

    async fn total_energy(&self) -> DeviceResult<f64> {
        self.guard().await?;
        Ok(self.state.read().await.energy_kwh)
    }

    fn capabilities(&self) -> ChargerCapabilities {
        self.caps.clone()
    }
}
