#![allow(
    clippy::cast_sign_loss,
    clippy::cast_possible_truncation,
    clippy::missing_errors_doc
)]

use std::path::Path;
use std::time::Duration;

use toml;

use crate::cavity::{CavitySetup, PlateStack, StepCalibration};
use crate::client::BrokerClient;
use crate::logger::NaSettings;
use crate::motor::WaitPlan;
use crate::motors::CavityMotors;
use crate::util::{tomlget, tomlget_opt, tomlget_or};

const DEFAULT_AUTHS_FILE: &str = "/etc/rabbitmq-secret/authentications.json";

/// One scan campaign: how many increments, how far each, and how the logged
/// traces are annotated.
#[derive(Debug, Clone)]
pub struct ScanPlan {
    pub steps: u32,
    pub increment_in: f64,
    pub settle: Duration,
    pub autoscale: bool,
    pub predict_mode_n: u32,
    pub notes: String,
}

pub async fn client_from_config(cfg: &toml::Value) -> Result<BrokerClient, String> {
    let broker = tomlget!(cfg, "general", "broker_endpoint", as_str);
    let auths_file = tomlget_or!(cfg, "general", "auths_file", as_str, DEFAULT_AUTHS_FILE);
    let reply_timeout = tomlget_or!(cfg, "general", "reply_timeout_secs", as_float, f64, 10.0);
    BrokerClient::connect(
        broker,
        Path::new(auths_file),
        Duration::from_secs_f64(reply_timeout),
    )
    .await
    .map_err(|e| format!("error [{}] in connecting to broker", e))
}

#[must_use]
pub fn calibration_from_config(cfg: &toml::Value) -> StepCalibration {
    StepCalibration {
        holder_thickness_in: tomlget_or!(
            cfg,
            "calibration",
            "holder_thickness_in",
            as_float,
            f64,
            0.25
        ),
        lip_thickness_in: tomlget_or!(cfg, "calibration", "lip_thickness_in", as_float, f64, 0.05),
        pitch_in: tomlget_or!(cfg, "calibration", "pitch_in", as_float, f64, 0.05),
        steps_per_rotation: tomlget_or!(
            cfg,
            "calibration",
            "steps_per_rotation",
            as_float,
            f64,
            20_000.0
        ),
    }
}

/// Builds the motor set from the `motors:active` name list. Unknown names
/// are skipped with a warning rather than failing the whole config.
pub fn motors_from_config(cfg: &toml::Value) -> Result<CavityMotors, String> {
    let names = cfg
        .get("motors")
        .ok_or_else(|| "failed to get section motors".to_string())?
        .get("active")
        .ok_or_else(|| "failed to get key motors:active".to_string())?
        .as_array()
        .ok_or_else(|| "failed to convert motors:active to array".to_string())?
        .iter()
        .map(|val| {
            val.as_str()
                .ok_or_else(|| "motors:active entries must be strings".to_string())
        })
        .collect::<Result<Vec<&str>, String>>()?;
    Ok(CavityMotors::from_names(
        &names,
        calibration_from_config(cfg),
    ))
}

#[must_use]
pub fn wait_plan_from_config(cfg: &toml::Value) -> WaitPlan {
    let poll = tomlget_or!(cfg, "motors", "poll_interval_secs", as_float, f64, 1.0);
    let timeout = tomlget_opt!(cfg, "motors", "wait_timeout_secs", as_float, f64);
    WaitPlan {
        poll_interval: Duration::from_secs_f64(poll),
        timeout: timeout.map(Duration::from_secs_f64),
    }
}

pub fn cavity_from_config(cfg: &toml::Value) -> Result<CavitySetup, String> {
    let stack = PlateStack {
        num_plates: tomlget!(cfg, "cavity", "num_plates", as_integer, u32),
        plate_thickness_in: tomlget!(cfg, "cavity", "plate_thickness_in", as_float, f64),
        initial_separation_in: tomlget!(
            cfg,
            "cavity",
            "initial_plate_separation_in",
            as_float,
            f64
        ),
    };
    Ok(CavitySetup {
        stack,
        initial_length_in: tomlget!(cfg, "cavity", "initial_length_in", as_float, f64),
        mirror_radius_cm: tomlget_or!(cfg, "cavity", "mirror_radius_cm", as_float, f64, 33.0),
        eps_r: tomlget_or!(cfg, "cavity", "relative_permittivity", as_float, f64, 1.0),
    })
}

#[must_use]
pub fn na_from_config(cfg: &toml::Value) -> NaSettings {
    NaSettings {
        start_freq_hz: tomlget_or!(cfg, "network_analyzer", "start_freq_hz", as_float, f64, 15e9),
        stop_freq_hz: tomlget_or!(cfg, "network_analyzer", "stop_freq_hz", as_float, f64, 18e9),
        power_dbm: tomlget_or!(cfg, "network_analyzer", "power_dbm", as_float, f64, -5.0),
        averages: tomlget_or!(cfg, "network_analyzer", "averages", as_integer, i64, 0),
        average_enable: tomlget_or!(cfg, "network_analyzer", "average_enable", as_bool, true),
        sweep_points: tomlget_or!(cfg, "network_analyzer", "sweep_points", as_integer, i64, 2000),
    }
}

pub fn scan_from_config(cfg: &toml::Value) -> Result<ScanPlan, String> {
    Ok(ScanPlan {
        steps: tomlget!(cfg, "scan", "steps", as_integer, u32),
        increment_in: tomlget!(cfg, "scan", "increment_in", as_float, f64),
        settle: Duration::from_secs_f64(tomlget_or!(
            cfg,
            "scan",
            "settle_secs",
            as_float,
            f64,
            30.0
        )),
        autoscale: tomlget_or!(cfg, "scan", "autoscale", as_bool, false),
        predict_mode_n: tomlget_or!(cfg, "scan", "predict_mode_n", as_integer, u32, 0),
        notes: tomlget_or!(cfg, "scan", "notes", as_str, "").to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> toml::Value {
        text.parse::<toml::Value>()
            .expect("test config should parse")
    }

    #[test]
    fn cavity_section_reads_required_and_default_keys() {
        let cfg = parse(
            "[cavity]\n\
             num_plates = 4\n\
             plate_thickness_in = 0.125\n\
             initial_plate_separation_in = 2.56\n\
             initial_length_in = 12.8\n",
        );
        let setup = cavity_from_config(&cfg).expect("section is complete");
        assert_eq!(setup.stack.num_plates, 4);
        assert!((setup.stack.initial_separation_in - 2.56).abs() < 1e-12);
        assert!((setup.mirror_radius_cm - 33.0).abs() < 1e-12);
        assert!((setup.eps_r - 1.0).abs() < 1e-12);
    }

    #[test]
    fn missing_required_key_is_an_error() {
        let cfg = parse("[cavity]\nnum_plates = 4\n");
        assert!(cavity_from_config(&cfg).is_err());
    }

    #[test]
    fn wait_plan_timeout_is_optional() {
        let with = parse("[motors]\npoll_interval_secs = 0.5\nwait_timeout_secs = 600.0\n");
        let without = parse("[motors]\npoll_interval_secs = 0.5\n");
        assert_eq!(
            wait_plan_from_config(&with).timeout,
            Some(Duration::from_secs(600))
        );
        assert_eq!(wait_plan_from_config(&without).timeout, None);
        assert_eq!(
            wait_plan_from_config(&without).poll_interval,
            Duration::from_millis(500)
        );
    }

    #[test]
    fn motor_names_build_the_set() {
        let cfg = parse("[motors]\nactive = [\"curved_mirror\", \"top_dielectric_plate\"]\n");
        let motors = motors_from_config(&cfg).expect("names are valid");
        assert_eq!(motors.motors().len(), 2);
    }

    #[test]
    fn non_string_motor_name_is_an_error() {
        let cfg = parse("[motors]\nactive = [17]\n");
        assert!(motors_from_config(&cfg).is_err());
    }

    #[test]
    fn scan_plan_fills_defaults() {
        let cfg = parse("[scan]\nsteps = 50\nincrement_in = -0.04\n");
        let plan = scan_from_config(&cfg).expect("required keys present");
        assert_eq!(plan.steps, 50);
        assert!((plan.increment_in + 0.04).abs() < 1e-12);
        assert_eq!(plan.settle, Duration::from_secs(30));
        assert!(!plan.autoscale);
        assert_eq!(plan.predict_mode_n, 0);
        assert!(plan.notes.is_empty());
    }

    #[test]
    fn analyzer_section_is_entirely_optional() {
        let cfg = parse("[network_analyzer]\npower_dbm = -10.0\n");
        let na = na_from_config(&cfg);
        assert!((na.power_dbm + 10.0).abs() < 1e-12);
        assert!((na.start_freq_hz - 15e9).abs() < 1.0);
        assert!(na.average_enable);
        assert_eq!(na.sweep_points, 2000);
    }
}
