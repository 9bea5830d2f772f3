use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::types::{DeviceError, DeviceResult};

/// Vehicle telematics capability: state of charge and battery capacity.
///
/// Association with a loadpoint is optional; a loadpoint without a vehicle
/// simply has no SoC-based planning.
#[async_trait]
pub trait Vehicle: Send + Sync {
    fn title(&self) -> &str;

    /// Usable battery capacity in kWh.
    fn capacity_kwh(&self) -> f64;

    /// State of charge in percent.
    async fn soc(&self) -> DeviceResult<f64>;
}

/// Simulated vehicle with a settable state of charge.
#[derive(Debug)]
pub struct SimulatedVehicle {
    title: String,
    capacity_kwh: f64,
    state: Arc<RwLock<SimVehicleState>>,
}

#[derive(Debug)]
struct SimVehicleState {
    soc_percent: f64,
    failing: bool,
}

impl SimulatedVehicle {
    pub fn new(title: impl Into<String>, capacity_kwh: f64, soc_percent: f64) -> Self {
        Self {
            title: title.into(),
            capacity_kwh,
            state: Arc::new(RwLock::new(SimVehicleState {
                soc_percent,
                failing: false,
            })),
        }
    }

    pub async fn set_soc(&self, soc_percent: f64) {
        self.state.write().await.soc_percent = soc_percent.clamp(0.0, 100.0);
    }

    pub async fn set_failing(&self, failing: bool) {
        self.state.write().await.failing = failing;
    }

    /// Applies charged energy to the simulated battery.
    pub async fn absorb_energy(&self, kwh: f64) {
        let mut st = self.state.write().await;
        if self.capacity_kwh > 0.0 {
            st.soc_percent = (st.soc_percent + kwh / self.capacity_kwh * 100.0).min(100.0);
        }
    }
}

#[async_trait]
impl Vehicle for SimulatedVehicle {
    fn title(&self) -> &str {
        &self.title
    }

    fn capacity_kwh(&self) -> f64 {
        self.capacity_kwh
    }

    async fn soc(&self) -> DeviceResult<f64> {
        let st = self.state.read().await;
        if st.failing {
            return Err(DeviceError::Communication("simulated outage".into()));
        }
        Ok(st.soc_percent)
    }
}
