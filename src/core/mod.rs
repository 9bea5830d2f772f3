pub mod loadpoint;
pub mod planner;
pub mod site;

use anyhow::{ensure, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::hardware::DeviceFactory;

pub use loadpoint::{
    Loadpoint, LoadpointParams, LoadpointStatus, Observation, SettingError, Settings,
};
pub use site::{allocate, surplus_w, Site, SiteMeasurements, SiteParams, SiteStatus};

#[derive(Clone)]
pub struct AppState {
    pub cfg: Config,
    pub site: Arc<Site>,
}

impl AppState {
    pub fn new(cfg: Config) -> Result<Self> {
        let factory = DeviceFactory::new(cfg.site.voltage_v);

        let grid_meter = cfg
            .site
            .grid_meter
            .as_ref()
            .map(|m| factory.meter(m))
            .transpose()
            .context("grid meter")?;
        let pv_meter = cfg
            .site
            .pv_meter
            .as_ref()
            .map(|m| factory.meter(m))
            .transpose()
            .context("pv meter")?;
        let battery_meter = cfg
            .site
            .battery_meter
            .as_ref()
            .map(|m| factory.meter(m))
            .transpose()
            .context("battery meter")?;

        let mut loadpoints = Vec::with_capacity(cfg.loadpoints.len());
        for lp_cfg in &cfg.loadpoints {
            ensure!(
                lp_cfg.min_current_a > 0.0 && lp_cfg.min_current_a <= lp_cfg.max_current_a,
                "loadpoint {}: invalid current bounds {}..{}A",
                lp_cfg.name,
                lp_cfg.min_current_a,
                lp_cfg.max_current_a
            );
            ensure!(
                lp_cfg.phases == 1 || lp_cfg.phases == 3,
                "loadpoint {}: phases must be 1 or 3",
                lp_cfg.name
            );

            let charger = factory
                .charger(&lp_cfg.charger)
                .with_context(|| format!("loadpoint {}: charger", lp_cfg.name))?;
            let charge_meter = lp_cfg
                .charge_meter
                .as_ref()
                .map(|m| factory.meter(m))
                .transpose()
                .with_context(|| format!("loadpoint {}: charge meter", lp_cfg.name))?;
            let vehicle = lp_cfg
                .vehicle
                .as_ref()
                .map(|v| factory.vehicle(v))
                .transpose()
                .with_context(|| format!("loadpoint {}: vehicle", lp_cfg.name))?;

            let params = LoadpointParams {
                name: lp_cfg.name.clone(),
                voltage_v: cfg.site.voltage_v,
                pv_debounce: Duration::from_secs(cfg.controller.pv_debounce_secs),
                phase_dwell: Duration::from_secs(cfg.controller.phase_dwell_secs),
                fail_threshold: cfg.controller.fail_threshold,
            };
            let settings = Settings {
                mode: lp_cfg.mode,
                min_current_a: lp_cfg.min_current_a,
                max_current_a: lp_cfg.max_current_a,
                phases: lp_cfg.phases,
                target_soc: lp_cfg.target_soc,
                target_time: None,
                min_soc: lp_cfg.min_soc,
                remote: None,
            };

            loadpoints.push(Arc::new(Loadpoint::new(
                params,
                settings,
                charger,
                charge_meter,
                vehicle,
            )));
        }
        ensure!(!loadpoints.is_empty(), "at least one loadpoint is required");

        let site = Arc::new(Site::new(
            SiteParams {
                title: cfg.site.title.clone(),
                residual_power_w: cfg.site.residual_power_w,
                io_timeout: Duration::from_millis(cfg.controller.io_timeout_ms),
            },
            grid_meter,
            pv_meter,
            battery_meter,
            loadpoints,
        ));

        Ok(Self { cfg, site })
    }
}

/// Spawns the site control loop. The returned token stops it.
pub fn spawn_controller_tasks(state: &AppState) -> CancellationToken {
    let cancel = CancellationToken::new();
    let site = state.site.clone();
    let interval = Duration::from_secs(state.cfg.controller.interval_secs);
    let token = cancel.clone();
    tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "starting site control loop");
        site.run(interval, token).await;
    });
    cancel
}
