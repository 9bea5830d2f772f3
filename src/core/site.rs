use anyhow::Result;
use chrono::Utc;
use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::loadpoint::{Loadpoint, LoadpointStatus, Observation};
use crate::domain::{ChargePointDemand, Meter};

/// Fixed site parameters from configuration.
#[derive(Debug, Clone)]
pub struct SiteParams {
    pub title: String,
    /// Reserved grid headroom in watts. Positive keeps a margin against
    /// import, negative allows that much grid import for charging.
    pub residual_power_w: f64,
    pub io_timeout: Duration,
}

/// Instantaneous site power snapshot. Grid import and battery discharge are
/// positive; any field may be unavailable if its meter is absent or the read
/// failed this cycle.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SiteMeasurements {
    pub grid_power_w: Option<f64>,
    pub pv_power_w: Option<f64>,
    pub battery_power_w: Option<f64>,
    pub charge_power_w: f64,
}

/// Published site state, refreshed every cycle.
#[derive(Debug, Clone, Serialize)]
pub struct SiteStatus {
    pub title: String,
    pub measurements: SiteMeasurements,
    pub surplus_w: f64,
    pub loadpoints: Vec<LoadpointStatus>,
}

/// Power available for charging after site consumption and grid policy.
///
/// With a grid meter the baseline eliminates algebraically:
/// `surplus = charge power − grid import − residual`. Without one, PV and
/// battery discharge stand in for the budget directly.
pub fn surplus_w(m: &SiteMeasurements, residual_power_w: f64) -> f64 {
    match m.grid_power_w {
        Some(grid) => m.charge_power_w - grid - residual_power_w,
        None => {
            m.pv_power_w.unwrap_or(0.0) + m.battery_power_w.unwrap_or(0.0).max(0.0)
                - residual_power_w
        }
    }
}

/// Distributes surplus across charge points in configuration order.
///
/// First pass grants each point its requested share, first come first
/// served; a second pass offers leftover surplus to points still under
/// their maximum. Starvation of later entries under persistent shortage is
/// accepted policy. Budgets are non-negative and never exceed the surplus.
pub fn allocate(surplus_w: f64, demands: &[ChargePointDemand]) -> Vec<f64> {
    let mut budgets = vec![0.0; demands.len()];
    let mut remaining = surplus_w.max(0.0);

    for (budget, demand) in budgets.iter_mut().zip(demands) {
        let grant = demand
            .requested_w
            .max(0.0)
            .min(demand.max_w.max(0.0))
            .min(remaining);
        *budget = grant;
        remaining -= grant;
    }

    for (budget, demand) in budgets.iter_mut().zip(demands) {
        if remaining <= 0.0 {
            break;
        }
        let headroom = (demand.max_w.max(0.0) - *budget).max(0.0);
        let grant = headroom.min(remaining);
        *budget += grant;
        remaining -= grant;
    }

    budgets
}

/// The power allocator: aggregates site measurements and drives all
/// loadpoints through the per-cycle sequence read → plan → allocate →
/// command → publish.
pub struct Site {
    params: SiteParams,
    grid_meter: Option<Arc<dyn Meter>>,
    pv_meter: Option<Arc<dyn Meter>>,
    battery_meter: Option<Arc<dyn Meter>>,
    loadpoints: Vec<Arc<Loadpoint>>,
    status: RwLock<SiteStatus>,
}

impl Site {
    pub fn new(
        params: SiteParams,
        grid_meter: Option<Arc<dyn Meter>>,
        pv_meter: Option<Arc<dyn Meter>>,
        battery_meter: Option<Arc<dyn Meter>>,
        loadpoints: Vec<Arc<Loadpoint>>,
    ) -> Self {
        let status = SiteStatus {
            title: params.title.clone(),
            measurements: SiteMeasurements::default(),
            surplus_w: 0.0,
            loadpoints: loadpoints.iter().map(|lp| lp.status_snapshot()).collect(),
        };
        Self {
            params,
            grid_meter,
            pv_meter,
            battery_meter,
            loadpoints,
            status: RwLock::new(status),
        }
    }

    pub fn loadpoints(&self) -> &[Arc<Loadpoint>] {
        &self.loadpoints
    }

    pub fn loadpoint(&self, index: usize) -> Option<&Arc<Loadpoint>> {
        self.loadpoints.get(index)
    }

    pub fn loadpoint_by_name(&self, name: &str) -> Option<&Arc<Loadpoint>> {
        self.loadpoints.iter().find(|lp| lp.name() == name)
    }

    pub fn status_snapshot(&self) -> SiteStatus {
        self.status.read().clone()
    }

    /// Fixed-period control loop until cancelled.
    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("site control loop stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.cycle().await {
                warn!(error = %e, "control cycle failed");
            }
        }
    }

    /// One control cycle. Device errors degrade the affected loadpoint, they
    /// never abort the cycle for the others.
    pub async fn cycle(&self) -> Result<()> {
        let wall = Utc::now();
        let now = Instant::now();
        let io_timeout = self.params.io_timeout;

        let (grid, pv, battery) = tokio::join!(
            read_site_meter(self.grid_meter.as_ref(), io_timeout, "grid"),
            read_site_meter(self.pv_meter.as_ref(), io_timeout, "pv"),
            read_site_meter(self.battery_meter.as_ref(), io_timeout, "battery"),
        );

        // allocation barrier: every loadpoint reports its demand for this
        // cycle, bounded by the soft deadline; a straggler is treated as
        // idle rather than blocking the site
        let soft_deadline = io_timeout * 6;
        let observations: Vec<Observation> = join_all(self.loadpoints.iter().map(|lp| async move {
            match tokio::time::timeout(soft_deadline, lp.observe(io_timeout, wall)).await {
                Ok(obs) => obs,
                Err(_) => {
                    warn!(name = lp.name(), "loadpoint missed the cycle deadline");
                    Observation::idle()
                }
            }
        }))
        .await;

        let measurements = SiteMeasurements {
            grid_power_w: grid,
            pv_power_w: pv,
            battery_power_w: battery,
            charge_power_w: observations.iter().map(|o| o.charge_power_w).sum(),
        };

        let surplus = surplus_w(&measurements, self.params.residual_power_w);
        let demands: Vec<ChargePointDemand> = observations.iter().map(|o| o.demand).collect();
        let budgets = allocate(surplus, &demands);

        debug!(
            surplus_w = surplus,
            charge_power_w = measurements.charge_power_w,
            ?budgets,
            "allocation"
        );

        join_all(
            self.loadpoints
                .iter()
                .zip(&budgets)
                .map(|(lp, budget)| lp.apply(*budget, now)),
        )
        .await;

        let status = SiteStatus {
            title: self.params.title.clone(),
            measurements,
            surplus_w: surplus,
            loadpoints: self.loadpoints.iter().map(|lp| lp.status_snapshot()).collect(),
        };
        *self.status.write() = status;

        Ok(())
    }
}

async fn read_site_meter(
    meter: Option<&Arc<dyn Meter>>,
    io_timeout: Duration,
    name: &str,
) -> Option<f64> {
    let meter = meter?;
    match tokio::time::timeout(io_timeout, meter.current_power()).await {
        Ok(Ok(power)) => Some(power),
        Ok(Err(e)) => {
            warn!(meter = name, error = %e, "meter read failed");
            None
        }
        Err(_) => {
            warn!(meter = name, "meter read timed out");
            None
        }
    }
}
