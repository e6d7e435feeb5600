#![warn(clippy::pedantic)]
#![warn(clippy::all)]

use std::fmt;
use std::fs::read_to_string;
use std::path::Path;

use async_std::task;
use chrono::Local;

use orpheus_daq::cavity::{flmn, CavitySetup, CM_PER_IN};
use orpheus_daq::client::BrokerClient;
use orpheus_daq::configs::{self, ScanPlan};
use orpheus_daq::logger::{DataLogger, LoggerError, NaSettings};
use orpheus_daq::motor::{CancelToken, MotorError, WaitPlan};
use orpheus_daq::motors::CavityMotors;
use orpheus_daq::util::find_file;

enum ScanError {
    Motor(MotorError),
    Logger(LoggerError),
}

impl From<MotorError> for ScanError {
    fn from(e: MotorError) -> Self {
        Self::Motor(e)
    }
}
impl From<LoggerError> for ScanError {
    fn from(e: LoggerError) -> Self {
        Self::Logger(e)
    }
}

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanError::Motor(e) => write!(f, "{}", e),
            ScanError::Logger(e) => write!(f, "{}", e),
        }
    }
}

fn main() {
    let cfg_path = find_file(Path::new("config.toml")).expect("Failed to find config file!");
    println!("Reading config file {}", cfg_path.display());

    let cfg_text = read_to_string(&cfg_path).expect("Failed to open config file!");
    let cfg = toml::from_str(&cfg_text).expect("Failed to parse config file");

    task::block_on(async {
        let mut client = configs::client_from_config(&cfg)
            .await
            .expect("Failed to connect to the instrument broker");
        let motors =
            configs::motors_from_config(&cfg).expect("Failed to construct motor set from config file");
        let cavity =
            configs::cavity_from_config(&cfg).expect("Failed to read cavity geometry from config file");
        let wait_plan = configs::wait_plan_from_config(&cfg);
        let na = configs::na_from_config(&cfg);
        let scan = configs::scan_from_config(&cfg).expect("Failed to read scan plan from config file");
        let logger = DataLogger::new();
        let cancel = CancelToken::new();

        if let Err(e) = run_scan(
            &mut client,
            &motors,
            &logger,
            &cavity,
            &wait_plan,
            &na,
            &scan,
            &cancel,
        )
        .await
        {
            eprintln!("[{}] scan aborted: [{}]", Local::now(), e);
            if motors.stop_all(&mut client).await.is_err() {
                eprintln!("[{}] could not confirm motors stopped", Local::now());
            }
            std::process::exit(1);
        }
    });
}

#[allow(clippy::too_many_arguments)]
async fn run_scan(
    client: &mut BrokerClient,
    motors: &CavityMotors,
    logger: &DataLogger,
    cavity: &CavitySetup,
    wait_plan: &WaitPlan,
    na: &NaSettings,
    scan: &ScanPlan,
    cancel: &CancelToken,
) -> Result<(), ScanError> {
    logger.initialize_na_settings_for_modemap(client, na).await?;
    motors.wait_for_motors(client, wait_plan, cancel).await?;
    logger.start_modemap(client, &scan.notes).await?;

    let mut state = cavity.initial_state();
    println!(
        "[{}] starting scan: {} steps of {} in from length {} in",
        Local::now(),
        scan.steps,
        scan.increment_in,
        state.cavity_length_in
    );
    for step in 0..scan.steps {
        state = motors
            .move_by_increment(client, &cavity.stack, &state, scan.increment_in)
            .await?;
        motors.wait_for_motors(client, wait_plan, cancel).await?;
        logger.log_motor_steps(client).await?;
        logger
            .log_vna_data(
                client,
                na.start_freq_hz,
                na.stop_freq_hz,
                scan.settle,
                &scan.notes,
                scan.autoscale,
            )
            .await?;
        match flmn(
            0,
            0,
            scan.predict_mode_n,
            state.cavity_length_in * CM_PER_IN,
            cavity.eps_r,
            cavity.mirror_radius_cm,
        ) {
            Ok(f) => println!(
                "[{}] predicted TEM00-{} mode at {:.4} GHz for length {:.3} in",
                Local::now(),
                scan.predict_mode_n,
                f / 1e9,
                state.cavity_length_in
            ),
            Err(e) => eprintln!("[{}] mode prediction unavailable: [{}]", Local::now(), e),
        }
        println!(
            "[{}] completed step {} of {}",
            Local::now(),
            step + 1,
            scan.steps
        );
    }
    logger.stop_modemap(client).await?;
    Ok(())
}
