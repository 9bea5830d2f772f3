use anyhow::Result;
use std::sync::Arc;

use crate::config::{ChargerConfig, DeviceKind, MeterConfig, VehicleConfig};
use crate::domain::{Charger, ChargerCapabilities, Meter, Vehicle};

/// Constructs device instances from configuration.
///
/// Simulated devices are only available with the `sim` feature so a
/// production build cannot silently run against synthetic hardware.
pub struct DeviceFactory {
    voltage_v: f64,
}

impl DeviceFactory {
    pub fn new(voltage_v: f64) -> Self {
        Self { voltage_v }
    }

    pub fn charger(&self, cfg: &ChargerConfig) -> Result<Arc<dyn Charger>> {
        match cfg.kind {
            #[cfg(feature = "sim")]
            DeviceKind::Sim => {
                let caps = ChargerCapabilities {
                    min_current_a: cfg.min_current_a,
                    max_current_a: cfg.max_current_a,
                    phases: cfg.phases,
                    phase_switching: cfg.phase_switching,
                };
                Ok(Arc::new(crate::domain::SimulatedCharger::new(
                    caps,
                    self.voltage_v,
                )))
            }
            #[cfg(not(feature = "sim"))]
            DeviceKind::Sim => {
                anyhow::bail!("simulated charger requested but 'sim' feature is disabled")
            }
        }
    }

    pub fn meter(&self, cfg: &MeterConfig) -> Result<Arc<dyn Meter>> {
        match cfg.kind {
            #[cfg(feature = "sim")]
            DeviceKind::Sim => Ok(Arc::new(crate::domain::SimulatedMeter::new(cfg.power_w))),
            #[cfg(not(feature = "sim"))]
            DeviceKind::Sim => {
                anyhow::bail!("simulated meter requested but 'sim' feature is disabled")
            }
        }
    }

    pub fn vehicle(&self, cfg: &VehicleConfig) -> Result<Arc<dyn Vehicle>> {
        match cfg.kind {
            #[cfg(feature = "sim")]
            DeviceKind::Sim => Ok(Arc::new(crate::domain::SimulatedVehicle::new(
                cfg.title.clone(),
                cfg.capacity_kwh,
                cfg.soc_percent,
            ))),
            #[cfg(not(feature = "sim"))]
            DeviceKind::Sim => {
                anyhow::bail!("simulated vehicle requested but 'sim' feature is disabled")
            }
        }
    }
}

#[cfg(all(test, feature = "sim"))]
mod tests {
    use super::*;
    use crate::domain::ConnectorStatus;

    #[tokio::test]
    async fn factory_creates_simulated_charger() {
        let factory = DeviceFactory::new(230.0);
        let charger = factory
            .charger(&ChargerConfig {
                kind: DeviceKind::Sim,
                min_current_a: 6.0,
                max_current_a: 32.0,
                phases: 3,
                phase_switching: false,
            })
            .unwrap();

        assert_eq!(charger.status().await.unwrap(), ConnectorStatus::A);
        assert_eq!(charger.capabilities().max_current_a, 32.0);
    }

    #[tokio::test]
    async fn factory_creates_simulated_meter() {
        let factory = DeviceFactory::new(230.0);
        let meter = factory
            .meter(&MeterConfig {
                kind: DeviceKind::Sim,
                power_w: 4200.0,
            })
            .unwrap();

        assert_eq!(meter.current_power().await.unwrap(), 4200.0);
    }

    #[tokio::test]
    async fn factory_creates_simulated_vehicle() {
        let factory = DeviceFactory::new(230.0);
        let vehicle = factory
            .vehicle(&VehicleConfig {
                kind: DeviceKind::Sim,
                title: "test".into(),
                capacity_kwh: 60.0,
                soc_percent: 40.0,
            })
            .unwrap();

        assert_eq!(vehicle.capacity_kwh(), 60.0);
        assert_eq!(vehicle.soc().await.unwrap(), 40.0);
    }
}
