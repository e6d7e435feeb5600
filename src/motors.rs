#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

use chrono::Local;

use crate::cavity::{plate_separation, CavityState, PlateStack, StepCalibration};
use crate::client::CommandClient;
use crate::motor::{CancelToken, Motor, MotorError, Role, WaitPlan};

/// The set of motors that reshape the cavity together. Holds one handle per
/// configured role plus the shared step calibration.
pub struct CavityMotors {
    motors: Vec<Motor>,
    calibration: StepCalibration,
}

impl CavityMotors {
    #[must_use]
    pub fn new(roles: &[Role], calibration: StepCalibration) -> Self {
        CavityMotors {
            motors: roles.iter().map(|&role| Motor::new(role)).collect(),
            calibration,
        }
    }

    /// Builds the set from configured role names. Names that do not match a
    /// known role are skipped, as is the standalone coupling test drive:
    /// only the three cavity roles belong to the coordinated set.
    #[must_use]
    pub fn from_names(names: &[&str], calibration: StepCalibration) -> Self {
        let motors = names
            .iter()
            .filter_map(|name| match name.parse::<Role>() {
                Ok(Role::ResonatorCoupling) => {
                    eprintln!(
                        "[{}] motor [{}] is not a coordinated cavity motor; skipping",
                        Local::now(),
                        name
                    );
                    None
                }
                Ok(role) => Some(Motor::new(role)),
                Err(()) => {
                    eprintln!(
                        "[{}] unrecognized motor name [{}] in config; skipping",
                        Local::now(),
                        name
                    );
                    None
                }
            })
            .collect();
        CavityMotors { motors, calibration }
    }

    #[inline]
    #[must_use]
    pub fn motors(&self) -> &[Motor] {
        &self.motors
    }

    #[inline]
    #[must_use]
    pub fn calibration(&self) -> StepCalibration {
        self.calibration
    }

    #[must_use]
    pub fn has_role(&self, role: Role) -> bool {
        self.motors.iter().any(|m| m.role() == role)
    }

    /// Current status string of every motor in the set.
    ///
    /// # Errors
    /// Propagates the first failed status query.
    pub async fn statuses<C: CommandClient + ?Sized>(
        &self,
        client: &mut C,
    ) -> Result<Vec<(Role, String)>, MotorError> {
        let mut out = Vec::with_capacity(self.motors.len());
        for motor in &self.motors {
            out.push((motor.role(), motor.status(client).await?));
        }
        Ok(out)
    }

    /// Waits for every motor in turn to report ready. On cancellation every
    /// motor gets the stop command before the error is returned.
    ///
    /// # Errors
    /// Whatever the individual waits report.
    pub async fn wait_for_motors<C: CommandClient + ?Sized>(
        &self,
        client: &mut C,
        plan: &WaitPlan,
        cancel: &CancelToken,
    ) -> Result<(), MotorError> {
        for motor in &self.motors {
            match motor.wait_until_ready(client, plan, cancel).await {
                Ok(()) => {}
                Err(MotorError::Cancelled { role }) => {
                    // the cancelled motor already got its stop; halt the rest
                    if self.stop_all(client).await.is_err() {
                        eprintln!(
                            "[{}] could not confirm all motors stopped after cancellation",
                            Local::now()
                        );
                    }
                    return Err(MotorError::Cancelled { role });
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Sends every motor back to its calibrated zero.
    ///
    /// # Errors
    /// Propagates the first failed command.
    pub async fn move_to_zero_all<C: CommandClient + ?Sized>(
        &self,
        client: &mut C,
    ) -> Result<(), MotorError> {
        for motor in &self.motors {
            motor.move_to_zero(client).await?;
        }
        Ok(())
    }

    /// Sends the stop command to every motor, attempting all of them even if
    /// some fail.
    ///
    /// # Errors
    /// The first failure, after every motor has been attempted.
    pub async fn stop_all<C: CommandClient + ?Sized>(
        &self,
        client: &mut C,
    ) -> Result<(), MotorError> {
        let mut first_failure = None;
        for motor in &self.motors {
            if let Err(e) = motor.stop_and_kill(client).await {
                eprintln!(
                    "[{}] failed to stop {} motor [{}]",
                    Local::now(),
                    motor.role(),
                    e
                );
                if first_failure.is_none() {
                    first_failure = Some(e);
                }
            }
        }
        match first_failure {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Lengthens (or shortens) the cavity by `increment_in` while keeping the
    /// dielectric plates evenly spaced. The curved mirror travels the full
    /// increment; each plate travels from the separation recorded in `state`
    /// to the new even spacing. Returns the geometry after the move, which
    /// the caller threads into the next call.
    ///
    /// Motors absent from the set are skipped, so a reduced setup moves only
    /// what it has.
    ///
    /// # Errors
    /// Propagates the first failed move command.
    pub async fn move_by_increment<C: CommandClient + ?Sized>(
        &self,
        client: &mut C,
        stack: &PlateStack,
        state: &CavityState,
        increment_in: f64,
    ) -> Result<CavityState, MotorError> {
        let new_length = state.cavity_length_in + increment_in;
        let new_separation = plate_separation(new_length, stack.num_plates);
        for motor in &self.motors {
            let steps = match motor.role() {
                Role::CurvedMirror => self.calibration.mirror_steps(increment_in),
                Role::BottomDielectricPlate => {
                    // the bottom plate rides the mirror, so it sees the full
                    // increment minus the change in spacing
                    let travel = (state.plate_separation_in + increment_in) - new_separation;
                    self.calibration.plate_steps(travel, stack.plate_thickness_in)
                }
                Role::TopDielectricPlate => {
                    let travel = new_separation - state.plate_separation_in;
                    self.calibration.plate_steps(travel, stack.plate_thickness_in)
                }
                // not part of the coordinated cavity move
                Role::ResonatorCoupling => continue,
            };
            motor.move_steps(client, steps).await?;
        }
        Ok(CavityState {
            cavity_length_in: new_length,
            plate_separation_in: new_separation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::{Call, ScriptedClient};
    use async_std::task::block_on;
    use serde_json::json;
    use std::time::Duration;

    fn cavity_set() -> CavityMotors {
        CavityMotors::new(
            &[
                Role::CurvedMirror,
                Role::BottomDielectricPlate,
                Role::TopDielectricPlate,
            ],
            StepCalibration::default(),
        )
    }

    #[test]
    fn from_names_skips_unknown_names() {
        let motors = CavityMotors::from_names(
            &["curved_mirror", "flux_capacitor"],
            StepCalibration::default(),
        );
        assert_eq!(motors.motors().len(), 1);
        assert!(motors.has_role(Role::CurvedMirror));
    }

    #[test]
    fn coupling_test_drive_stays_out_of_the_set() {
        block_on(async {
            let mut client = ScriptedClient::new();
            let motors =
                CavityMotors::from_names(&["resonator_coupling"], StepCalibration::default());
            assert!(motors.motors().is_empty());
            assert!(!motors.has_role(Role::ResonatorCoupling));

            // set-wide operations leave the test drive alone
            motors.stop_all(&mut client).await.expect("nothing to stop");
            motors
                .move_to_zero_all(&mut client)
                .await
                .expect("nothing to zero");
            let statuses = motors.statuses(&mut client).await.expect("no motors");
            assert!(statuses.is_empty());
            assert!(client.calls.is_empty());
        });
    }

    #[test]
    fn incremental_move_spaces_the_plates_evenly() {
        block_on(async {
            let mut client = ScriptedClient::new();
            let motors = cavity_set();
            let stack = PlateStack {
                num_plates: 2,
                plate_thickness_in: 0.1,
                initial_separation_in: 3.5,
            };
            let state = CavityState {
                cavity_length_in: 10.0,
                plate_separation_in: 3.5,
            };
            let after = motors
                .move_by_increment(&mut client, &stack, &state, 1.0)
                .await
                .expect("scripted moves");

            assert!((after.cavity_length_in - 11.0).abs() < 1e-12);
            assert!((after.plate_separation_in - 11.0 / 3.0).abs() < 1e-12);

            // recompute the plate travels from the returned separation
            let calib = motors.calibration();
            let bottom = calib.plate_steps((3.5 + 1.0) - after.plate_separation_in, 0.1);
            let top = calib.plate_steps(after.plate_separation_in - 3.5, 0.1);
            assert_eq!(calib.mirror_steps(1.0), 400_000);
            assert_eq!(bottom, 323_333);
            assert_eq!(top, 56_667);
            assert_eq!(
                client.calls,
                vec![
                    Call::Set("curved_mirror_move_steps".to_string(), json!(400_000)),
                    Call::Set(
                        "bottom_dielectric_plate_move_steps".to_string(),
                        json!(323_333)
                    ),
                    Call::Set("top_dielectric_plate_move_steps".to_string(), json!(56_667)),
                ]
            );
        });
    }

    #[test]
    fn successive_increments_thread_the_state() {
        block_on(async {
            let mut client = ScriptedClient::new();
            let motors = CavityMotors::new(&[Role::CurvedMirror], StepCalibration::default());
            let stack = PlateStack {
                num_plates: 2,
                plate_thickness_in: 0.1,
                initial_separation_in: 10.0 / 3.0,
            };
            let mut state = CavityState {
                cavity_length_in: 10.0,
                plate_separation_in: 10.0 / 3.0,
            };
            for increment in [0.5, 0.25, -0.75] {
                state = motors
                    .move_by_increment(&mut client, &stack, &state, increment)
                    .await
                    .expect("scripted moves");
            }
            assert!((state.cavity_length_in - 10.0).abs() < 1e-9);
            assert!((state.plate_separation_in - 10.0 / 3.0).abs() < 1e-9);
            let steps: Vec<i32> = client
                .calls
                .iter()
                .map(|call| match call {
                    Call::Set(_, value) => {
                        i32::try_from(value.as_i64().expect("step counts are integers"))
                            .expect("step counts fit an i32")
                    }
                    other => panic!("unexpected call {:?}", other),
                })
                .collect();
            assert_eq!(steps, vec![200_000, 100_000, -300_000]);
        });
    }

    #[test]
    fn absent_roles_receive_no_commands() {
        block_on(async {
            let mut client = ScriptedClient::new();
            let motors = CavityMotors::from_names(
                &["resonator_coupling", "curved_mirror"],
                StepCalibration::default(),
            );
            assert_eq!(motors.motors().len(), 1);
            let stack = PlateStack {
                num_plates: 4,
                plate_thickness_in: 0.125,
                initial_separation_in: 2.56,
            };
            let state = CavityState {
                cavity_length_in: 12.8,
                plate_separation_in: 2.56,
            };
            motors
                .move_by_increment(&mut client, &stack, &state, -0.04)
                .await
                .expect("scripted moves");
            assert_eq!(client.calls.len(), 1);
            assert_eq!(client.calls[0].endpoint(), "curved_mirror_move_steps");
        });
    }

    #[test]
    fn cancellation_stops_the_whole_set() {
        block_on(async {
            let mut client = ScriptedClient::new();
            let motors = CavityMotors::new(
                &[Role::CurvedMirror, Role::TopDielectricPlate],
                StepCalibration::default(),
            );
            let cancel = CancelToken::new();
            cancel.cancel();
            let plan = WaitPlan {
                poll_interval: Duration::from_millis(1),
                timeout: None,
            };
            let err = motors.wait_for_motors(&mut client, &plan, &cancel).await;
            assert!(matches!(err, Err(MotorError::Cancelled { .. })));
            let stops: Vec<&str> = client
                .calls
                .iter()
                .filter_map(|call| match call {
                    Call::Set(endpoint, value) if value == &json!("stop_and_kill") => {
                        Some(endpoint.as_str())
                    }
                    _ => None,
                })
                .collect();
            assert!(stops.contains(&"curved_mirror_status_command"));
            assert!(stops.contains(&"top_dielectric_plate_status_command"));
        });
    }

    #[test]
    fn readiness_runs_through_every_motor() {
        block_on(async {
            let mut client = ScriptedClient::new();
            for role in ["curved_mirror", "bottom_dielectric_plate", "top_dielectric_plate"] {
                client.stage_raw_repeat(
                    &format!("{}_motor_request_status", role),
                    json!("R"),
                );
            }
            let motors = cavity_set();
            let plan = WaitPlan {
                poll_interval: Duration::from_millis(1),
                timeout: Some(Duration::from_millis(50)),
            };
            motors
                .wait_for_motors(&mut client, &plan, &CancelToken::new())
                .await
                .expect("all motors scripted ready");
            assert_eq!(client.calls.len(), 3);
        });
    }
}
