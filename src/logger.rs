#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::unused_self)]

use std::fmt;
use std::time::Duration;

use chrono::Local;
use serde_json::json;

use crate::client::{ClientError, CommandClient};
use crate::fitting::{
    interp_at, iq_magnitude, iq_phase_unwrapped, iq_power, linspace, FitError, FitOutcome,
    LineShape, SpectrumFitter,
};

// the pair of traces archived together at the end of every sweep
const S21_TRACE: &str = "na_s21_iq_data";
const S11_TRACE2: &str = "na_s11_iq_data_trace2";
// single-trace variant used by the standalone helpers
const S11_TRACE: &str = "na_s11_iq_data";

/// Network analyzer sweep settings pushed out before a mode map run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NaSettings {
    pub start_freq_hz: f64,
    pub stop_freq_hz: f64,
    pub power_dbm: f64,
    pub averages: i64,
    pub average_enable: bool,
    pub sweep_points: i64,
}

impl Default for NaSettings {
    fn default() -> Self {
        NaSettings {
            start_freq_hz: 15e9,
            stop_freq_hz: 18e9,
            power_dbm: -5.0,
            averages: 0,
            average_enable: true,
            sweep_points: 2000,
        }
    }
}

#[derive(Debug)]
pub enum LoggerError {
    Client(ClientError), // broker exchange failed
    Fit(FitError),       // fitting service could not fit the trace
    BadTrace { endpoint: String, len: usize }, // trace too short or odd-length
}

impl fmt::Display for LoggerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoggerError::Client(e) => write!(f, "{}", e),
            LoggerError::Fit(e) => write!(f, "{}", e),
            LoggerError::BadTrace { endpoint, len } => {
                write!(f, "unusable IQ trace from [{}] (length {})", endpoint, len)
            }
        }
    }
}

impl From<ClientError> for LoggerError {
    fn from(e: ClientError) -> Self {
        Self::Client(e)
    }
}

impl From<FitError> for LoggerError {
    fn from(e: FitError) -> Self {
        Self::Fit(e)
    }
}

/// Fit results from one transmission/reflection switch pass.
#[derive(Debug, Clone, Copy)]
pub struct SwitchFitReport {
    pub transmission: FitOutcome,
    pub reflection: FitOutcome,
    pub coupling: f64,
}

/// Issues the logging sequences the archiving side listens for. Owns only
/// the entity name lists; every exchange goes through the client passed in.
pub struct DataLogger {
    na_entities: Vec<&'static str>,
    motor_step_entities: Vec<&'static str>,
}

impl Default for DataLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl DataLogger {
    #[must_use]
    pub fn new() -> Self {
        DataLogger {
            na_entities: vec![
                "na_start_freq",
                "na_stop_freq",
                "na_power",
                "na_averages",
                "na_average_enable",
            ],
            motor_step_entities: vec![
                "curved_mirror_steps",
                "bottom_dielectric_plate_steps",
                "top_dielectric_plate_steps",
            ],
        }
    }

    #[must_use]
    pub fn na_entities(&self) -> &[&'static str] {
        &self.na_entities
    }

    pub async fn set_start_freq<C: CommandClient + ?Sized>(
        &self,
        client: &mut C,
        start_freq_hz: f64,
    ) -> Result<(), LoggerError> {
        client.set("na_start_freq", json!(start_freq_hz)).await?;
        Ok(())
    }

    pub async fn set_stop_freq<C: CommandClient + ?Sized>(
        &self,
        client: &mut C,
        stop_freq_hz: f64,
    ) -> Result<(), LoggerError> {
        client.set("na_stop_freq", json!(stop_freq_hz)).await?;
        Ok(())
    }

    /// Pushes the full sweep configuration out to the analyzer and arms the
    /// two archived traces.
    pub async fn initialize_na_settings_for_modemap<C: CommandClient + ?Sized>(
        &self,
        client: &mut C,
        settings: &NaSettings,
    ) -> Result<(), LoggerError> {
        client
            .set("na_start_freq", json!(settings.start_freq_hz))
            .await?;
        client
            .set("na_stop_freq", json!(settings.stop_freq_hz))
            .await?;
        client.set("na_power", json!(settings.power_dbm)).await?;
        client
            .set("na_average_enable", json!(u8::from(settings.average_enable)))
            .await?;
        if settings.average_enable {
            client.set("na_averages", json!(settings.averages)).await?;
        }
        client
            .set("na_sweep_points", json!(settings.sweep_points))
            .await?;
        // set up traces
        client.cmd(S21_TRACE, "scheduled_log").await?;
        client.cmd(S11_TRACE2, "scheduled_log").await?;
        Ok(())
    }

    /// Records the current step count of every cavity motor.
    pub async fn log_motor_steps<C: CommandClient + ?Sized>(
        &self,
        client: &mut C,
    ) -> Result<(), LoggerError> {
        for entity in &self.motor_step_entities {
            client.cmd(entity, "scheduled_log").await?;
        }
        Ok(())
    }

    /// Marks a measurement, snapshots the analyzer settings, and logs both
    /// traces after the averaging window. The measurement marker is left
    /// set; `log_vna_data` is the bracketed variant.
    pub async fn log_s21s11<C: CommandClient + ?Sized>(
        &self,
        client: &mut C,
        start_freq_hz: f64,
        stop_freq_hz: f64,
        settle: Duration,
    ) -> Result<(), LoggerError> {
        self.set_start_freq(client, start_freq_hz).await?;
        self.set_stop_freq(client, stop_freq_hz).await?;
        client
            .set("na_measurement_status", json!("start_measurement"))
            .await?;
        for entity in &self.na_entities {
            client.cmd(entity, "scheduled_log").await?;
        }
        // wait for the analyzer to finish several sweeps for averaging
        async_std::task::sleep(settle).await;
        client.cmd(S21_TRACE, "scheduled_log").await?;
        client.cmd(S11_TRACE2, "scheduled_log").await?;
        Ok(())
    }

    /// One bracketed trace log: marks the measurement, snapshots settings,
    /// waits out averaging, archives both traces, and clears the marker.
    pub async fn log_vna_data<C: CommandClient + ?Sized>(
        &self,
        client: &mut C,
        start_freq_hz: f64,
        stop_freq_hz: f64,
        settle: Duration,
        notes: &str,
        autoscale: bool,
    ) -> Result<(), LoggerError> {
        self.set_start_freq(client, start_freq_hz).await?;
        self.set_stop_freq(client, stop_freq_hz).await?;
        println!(
            "[{}] setting na_measurement_status to start_measurement",
            Local::now()
        );
        client
            .set("na_measurement_status", json!("start_measurement"))
            .await?;
        client
            .set("na_measurement_status_explanation", json!(notes))
            .await?;
        println!("[{}] logging list of endpoints", Local::now());
        client.cmd("modemap_snapshot_no_iq", "log_entities").await?;
        // wait for the analyzer to finish several sweeps for averaging
        async_std::task::sleep(settle).await;
        if autoscale {
            client.set("na_commands", json!("autoscale")).await?;
        }
        client.cmd(S21_TRACE, "scheduled_log").await?;
        client.cmd(S11_TRACE2, "scheduled_log").await?;
        println!(
            "[{}] setting na_measurement_status to stop_measurement",
            Local::now()
        );
        client
            .set("na_measurement_status", json!("stop_measurement"))
            .await?;
        Ok(())
    }

    /// One transmission/reflection switch pass: archives the switched S21
    /// trace in each switch state and, when a fitter is supplied, fits both
    /// traces and works out the antenna coupling from the reflection line.
    #[allow(clippy::too_many_arguments)]
    #[allow(clippy::too_many_lines)]
    pub async fn log_transmission_reflection_switches<C: CommandClient + ?Sized>(
        &self,
        client: &mut C,
        start_freq_hz: f64,
        stop_freq_hz: f64,
        settle: Duration,
        notes: &str,
        autoscale: bool,
        fitter: Option<&dyn SpectrumFitter>,
    ) -> Result<Option<SwitchFitReport>, LoggerError> {
        self.set_start_freq(client, start_freq_hz).await?;
        self.set_stop_freq(client, stop_freq_hz).await?;
        println!(
            "[{}] setting na_measurement_status to start_measurement",
            Local::now()
        );
        client
            .set("na_measurement_status", json!("start_measurement"))
            .await?;
        client
            .set("na_measurement_status_explanation", json!(notes))
            .await?;
        println!("[{}] logging list of endpoints", Local::now());
        client.cmd("modemap_snapshot_no_iq", "log_entities").await?;

        // transmission side of the switch
        client.set("switch_ps_channel_output", json!(0)).await?;
        async_std::task::sleep(settle).await;
        if autoscale {
            client.set("na_commands", json!("autoscale")).await?;
        }
        client
            .cmd("s21_iq_transmission_data", "scheduled_log")
            .await?;
        let mut transmission_fit = None;
        if let Some(fitter) = fitter {
            let iq = self.fetch_iq(client, "s21_iq_transmission_data").await?;
            let power = iq_power(&iq);
            let freq = linspace(start_freq_hz, stop_freq_hz, power.len());
            let outcome = fitter.lorentzian_fit(&power, &freq, LineShape::Transmission)?;
            println!(
                "[{}] transmission lorentzian fit {:?} (errors {:?})",
                Local::now(),
                outcome.params,
                outcome.errors()
            );
            transmission_fit = Some(outcome);
        }

        // reflection side of the switch
        client.set("switch_ps_channel_output", json!(1)).await?;
        async_std::task::sleep(settle).await;
        if autoscale {
            client.set("na_commands", json!("autoscale")).await?;
        }
        client
            .cmd("s21_iq_reflection_data", "scheduled_log")
            .await?;
        let mut reflection_result = None;
        if let Some(fitter) = fitter {
            let iq = self.fetch_iq(client, "s21_iq_reflection_data").await?;
            let power = iq_power(&iq);
            let magnitude = iq_magnitude(&iq);
            let phase = iq_phase_unwrapped(&iq);
            let freq = linspace(start_freq_hz, stop_freq_hz, power.len());
            let outcome = fitter.lorentzian_fit(&power, &freq, LineShape::Reflection)?;
            println!(
                "[{}] reflection lorentzian fit {:?} (errors {:?})",
                Local::now(),
                outcome.params,
                outcome.errors()
            );
            let q = outcome.quality_factor();
            let (_res_magnitude, res_phase) = fitter.deconvolve_line(&freq, &magnitude, &phase, q);
            let f0 = outcome.center_freq();
            // reflection coefficient at resonance, from the fitted curve
            // rather than the raw trace
            let mag_f0 =
                (fitter.model_power(f0, &outcome.params, LineShape::Reflection) / q).sqrt();
            let phase_f0 = interp_at(&freq, &res_phase, f0);
            let beta = fitter.coupling(mag_f0, phase_f0);
            println!("[{}] antenna coupling {}", Local::now(), beta);
            reflection_result = Some((outcome, beta));
        }

        println!(
            "[{}] setting na_measurement_status to stop_measurement",
            Local::now()
        );
        client
            .set("na_measurement_status", json!("stop_measurement"))
            .await?;

        match (transmission_fit, reflection_result) {
            (Some(transmission), Some((reflection, coupling))) => Ok(Some(SwitchFitReport {
                transmission,
                reflection,
                coupling,
            })),
            _ => Ok(None),
        }
    }

    /// Marks the start of a mode map run.
    pub async fn start_modemap<C: CommandClient + ?Sized>(
        &self,
        client: &mut C,
        notes: &str,
    ) -> Result<(), LoggerError> {
        client
            .set("modemap_measurement_status", json!("start_measurement"))
            .await?;
        client
            .set("modemap_measurement_status_explanation", json!(notes))
            .await?;
        Ok(())
    }

    pub async fn stop_modemap<C: CommandClient + ?Sized>(
        &self,
        client: &mut C,
    ) -> Result<(), LoggerError> {
        client
            .set("modemap_measurement_status", json!("stop_measurement"))
            .await?;
        Ok(())
    }

    /// Primes the S21 trace endpoint, waits out the averaging window, then
    /// archives it.
    pub async fn log_s21<C: CommandClient + ?Sized>(
        &self,
        client: &mut C,
        settle: Duration,
    ) -> Result<(), LoggerError> {
        client.get(S21_TRACE).await?;
        async_std::task::sleep(settle).await;
        client.cmd(S21_TRACE, "scheduled_log").await?;
        Ok(())
    }

    /// Primes the S11 trace endpoint, waits out the averaging window, then
    /// archives it.
    pub async fn log_s11<C: CommandClient + ?Sized>(
        &self,
        client: &mut C,
        settle: Duration,
    ) -> Result<(), LoggerError> {
        client.get(S11_TRACE).await?;
        async_std::task::sleep(settle).await;
        client.cmd(S11_TRACE, "scheduled_log").await?;
        Ok(())
    }

    /// Pulls a calibrated IQ trace and checks it holds at least one complete
    /// I/Q pair.
    async fn fetch_iq<C: CommandClient + ?Sized>(
        &self,
        client: &mut C,
        endpoint: &str,
    ) -> Result<Vec<f64>, LoggerError> {
        let reply = client.get(endpoint).await?;
        let iq = reply.require_cal_f64s(endpoint)?;
        if iq.len() < 2 || iq.len() % 2 != 0 {
            return Err(LoggerError::BadTrace {
                endpoint: endpoint.to_string(),
                len: iq.len(),
            });
        }
        Ok(iq)
    }
}
