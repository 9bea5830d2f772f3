use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::types::{DeviceError, DeviceResult};

/// Power measurement capability for grid, PV and battery sources.
///
/// Sign convention: grid import and battery discharge are positive, grid
/// export and battery charging are negative. PV production is positive.
#[async_trait]
pub trait Meter: Send + Sync {
    async fn current_power(&self) -> DeviceResult<f64>;

    /// Cumulative energy in kWh, where the meter supports it.
    async fn total_energy(&self) -> DeviceResult<f64> {
        Err(DeviceError::NotSupported)
    }
}

#[derive(Debug)]
struct SimMeterState {
    power_w: f64,
    energy_kwh: f64,
    failing: bool,
}

/// Simulated meter with an externally settable reading.
#[derive(Debug)]
pub struct SimulatedMeter {
    state: Arc<RwLock<SimMeterState>>,
}

impl SimulatedMeter {
    pub fn new(power_w: f64) -> Self {
        Self {
            state: Arc::new(RwLock::new(SimMeterState {
                power_w,
                energy_kwh: 0.0,
                failing: false,
            })),
        }
    }

    pub async fn set_power(&self, power_w: f64) {
        self.state.write().await.power_w = power_w;
    }

    pub async fn set_failing(&self, failing: bool) {
        self.state.write().await.failing = failing;
    }

    pub async fn step(&self, seconds: f64) {
        let mut st = self.state.write().await;
        st.energy_kwh += st.power_w.max(0.0) / 1000.0 * (seconds / 3600.0);
    }
}

#[async_trait]
impl Meter for SimulatedMeter {
    async fn current_power(&self) -> DeviceResult<f64> {
        let st = self.state.read().await;
        if st.failing {
            return Err(DeviceError::Communication("simulated outage".into()));
        }
        Ok(st.power_w)
    }

    async fn total_energy(&self) -> DeviceResult<f64> {
        let st = self.state.read().await;
        if st.failing {
            return Err(DeviceError::Communication("simulated outage".into()));
        }
        Ok(st.energy_kwh)
    }
}
