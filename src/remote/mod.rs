//! Remote relay contract.
//!
//! A relay mirrors the control surface to a remote operator as a flat,
//! enumerated request/response exchange. The wire transport is out of scope;
//! this module is the adapter that maps the enumerated calls onto the
//! strongly-typed loadpoint API and returns textual errors the relay must
//! surface to its own client without retrying.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::Site;
use crate::domain::{ChargeMode, RemoteDemand};

/// Enumerated control-surface operation carried by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiCall {
    Name,
    HasChargeMeter,
    GetStatus,
    GetMode,
    SetMode,
    GetTargetSoc,
    SetTargetSoc,
    GetMinSoc,
    SetMinSoc,
    GetPhases,
    SetPhases,
    SetTargetCharge,
    GetChargePower,
    GetMinCurrent,
    SetMinCurrent,
    GetMaxCurrent,
    SetMaxCurrent,
    GetMinPower,
    GetMaxPower,
    GetRemainingDuration,
    GetRemainingEnergy,
    RemoteControl,
}

/// Single polymorphic value slot, mirroring the relay's wire payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Payload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub string_val: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub int_val: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub float_val: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bool_val: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_val: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u64>,
}

impl Payload {
    fn string(v: impl Into<String>) -> Self {
        Self {
            string_val: Some(v.into()),
            ..Default::default()
        }
    }

    fn int(v: i64) -> Self {
        Self {
            int_val: Some(v),
            ..Default::default()
        }
    }

    fn float(v: f64) -> Self {
        Self {
            float_val: Some(v),
            ..Default::default()
        }
    }

    fn bool(v: bool) -> Self {
        Self {
            bool_val: Some(v),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EdgeRequest {
    pub id: i64,
    /// 1-based loadpoint index; 0 addresses no loadpoint.
    #[serde(default)]
    pub loadpoint: usize,
    pub api: ApiCall,
    #[serde(default)]
    pub payload: Payload,
}

#[derive(Debug, Clone, Serialize)]
pub struct EdgeResponse {
    pub id: i64,
    pub payload: Payload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Executes one relay request against the site. Never panics and never
/// retries; all failures come back as textual errors on the response.
pub fn dispatch(site: &Site, source: &str, req: &EdgeRequest) -> EdgeResponse {
    match dispatch_inner(site, source, req) {
        Ok(payload) => EdgeResponse {
            id: req.id,
            payload,
            error: None,
        },
        Err(e) => EdgeResponse {
            id: req.id,
            payload: Payload::default(),
            error: Some(e),
        },
    }
}

fn dispatch_inner(site: &Site, source: &str, req: &EdgeRequest) -> Result<Payload, String> {
    let lp = req
        .loadpoint
        .checked_sub(1)
        .and_then(|i| site.loadpoint(i))
        .ok_or_else(|| format!("unknown loadpoint {}", req.loadpoint))?;

    let p = &req.payload;
    let payload = match req.api {
        ApiCall::Name => Payload::string(lp.name()),
        ApiCall::HasChargeMeter => Payload::bool(lp.has_charge_meter()),
        ApiCall::GetStatus => Payload::string(lp.connector_status().to_string()),
        ApiCall::GetMode => Payload::string(lp.mode().to_string()),
        ApiCall::SetMode => {
            let mode: ChargeMode = required_str(p)?.parse()?;
            lp.set_mode(mode);
            Payload::default()
        }
        ApiCall::GetTargetSoc => Payload::int(lp.target_soc().map_or(0, i64::from)),
        ApiCall::SetTargetSoc => {
            lp.set_target_soc(required_soc(p)?).map_err(stringify)?;
            Payload::default()
        }
        ApiCall::GetMinSoc => Payload::int(lp.min_soc().map_or(0, i64::from)),
        ApiCall::SetMinSoc => {
            lp.set_min_soc(required_soc(p)?).map_err(stringify)?;
            Payload::default()
        }
        ApiCall::GetPhases => Payload::int(i64::from(lp.phases())),
        ApiCall::SetPhases => {
            let phases = u8::try_from(required_int(p)?)
                .map_err(|_| "phases out of range".to_owned())?;
            lp.set_phases(phases).map_err(stringify)?;
            Payload::default()
        }
        ApiCall::SetTargetCharge => {
            let time = p.time_val.ok_or("missing time value")?;
            lp.set_target_charge(time, required_soc(p)?)
                .map_err(stringify)?;
            Payload::default()
        }
        ApiCall::GetChargePower => Payload::float(lp.charge_power_w()),
        ApiCall::GetMinCurrent => Payload::float(lp.min_current_a()),
        ApiCall::SetMinCurrent => {
            lp.set_min_current_a(required_float(p)?).map_err(stringify)?;
            Payload::default()
        }
        ApiCall::GetMaxCurrent => Payload::float(lp.max_current_a()),
        ApiCall::SetMaxCurrent => {
            lp.set_max_current_a(required_float(p)?).map_err(stringify)?;
            Payload::default()
        }
        ApiCall::GetMinPower => Payload::float(lp.min_power_w()),
        ApiCall::GetMaxPower => Payload::float(lp.max_power_w()),
        ApiCall::GetRemainingDuration => Payload {
            duration_secs: lp.remaining_duration().map(|d| d.as_secs()),
            ..Default::default()
        },
        ApiCall::GetRemainingEnergy => {
            Payload::float(lp.remaining_energy_kwh().unwrap_or(0.0))
        }
        ApiCall::RemoteControl => {
            let demand: RemoteDemand = required_str(p)?.parse()?;
            lp.remote_control(source, demand);
            Payload::default()
        }
    };
    Ok(payload)
}

fn required_str(p: &Payload) -> Result<&str, String> {
    p.string_val
        .as_deref()
        .ok_or_else(|| "missing string value".to_owned())
}

fn required_int(p: &Payload) -> Result<i64, String> {
    p.int_val.ok_or_else(|| "missing integer value".to_owned())
}

fn required_float(p: &Payload) -> Result<f64, String> {
    p.float_val.ok_or_else(|| "missing float value".to_owned())
}

fn required_soc(p: &Payload) -> Result<u8, String> {
    u8::try_from(required_int(p)?).map_err(|_| "soc out of range".to_owned())
}

fn stringify(e: impl std::fmt::Display) -> String {
    e.to_string()
}
