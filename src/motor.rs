#![warn(clippy::pedantic)]
#![allow(clippy::result_unit_err)]
#![allow(clippy::module_name_repetitions)]

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Local;
use serde_json::json;

use crate::client::{ClientError, CommandClient};

/// Status string a motor controller reports once it is stationary and
/// accepting commands.
pub const READY: &str = "R";

/// Which physical drive a motor handle addresses. The role fixes the base
/// name of every endpoint the handle touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    CurvedMirror,
    BottomDielectricPlate,
    TopDielectricPlate,
    // bench-test drive; not part of the coordinated cavity set
    ResonatorCoupling,
}

impl Role {
    #[must_use]
    pub fn endpoint_base(self) -> &'static str {
        match self {
            Role::CurvedMirror => "curved_mirror",
            Role::BottomDielectricPlate => "bottom_dielectric_plate",
            Role::TopDielectricPlate => "top_dielectric_plate",
            Role::ResonatorCoupling => "resonator_coupling",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.endpoint_base())
    }
}

impl FromStr for Role {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "curved_mirror" => Ok(Role::CurvedMirror),
            "bottom_dielectric_plate" => Ok(Role::BottomDielectricPlate),
            "top_dielectric_plate" => Ok(Role::TopDielectricPlate),
            "resonator_coupling" => Ok(Role::ResonatorCoupling),
            _ => Err(()),
        }
    }
}

/// What a motor's controller is willing to do. Everything is enabled by
/// default; a restricted handle refuses the rest with `NotSupported`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub query_status: bool,
    pub move_to_zero: bool,
    pub move_steps: bool,
    pub stop: bool,
}

impl Capabilities {
    #[must_use]
    pub fn all() -> Self {
        Capabilities {
            query_status: true,
            move_to_zero: true,
            move_steps: true,
            stop: true,
        }
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::all()
    }
}

#[derive(Debug)]
pub enum MotorError {
    Client(ClientError), // broker exchange failed
    PollTimeout { role: Role, waited: Duration }, // not ready before the deadline
    Cancelled { role: Role }, // wait aborted from outside; stop was sent
    NotSupported { role: Role, operation: &'static str },
}

impl fmt::Display for MotorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MotorError::Client(e) => write!(f, "{}", e),
            MotorError::PollTimeout { role, waited } => write!(
                f,
                "{} motor not ready after {:.1} s",
                role,
                waited.as_secs_f64()
            ),
            MotorError::Cancelled { role } => {
                write!(f, "wait for {} motor cancelled; stop was sent", role)
            }
            MotorError::NotSupported { role, operation } => {
                write!(f, "{} motor does not support {}", role, operation)
            }
        }
    }
}

impl From<ClientError> for MotorError {
    fn from(e: ClientError) -> Self {
        Self::Client(e)
    }
}

/// How to poll for readiness: cadence plus an optional deadline. With no
/// deadline the wait runs until the device reports ready.
#[derive(Debug, Clone, Copy)]
pub struct WaitPlan {
    pub poll_interval: Duration,
    pub timeout: Option<Duration>,
}

impl Default for WaitPlan {
    fn default() -> Self {
        WaitPlan {
            poll_interval: Duration::from_secs(1),
            timeout: None,
        }
    }
}

/// Shared flag for aborting a readiness wait from another task.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Handle on one stepper drive. Carries no motion state of its own; position
/// and readiness live in the remote controller.
#[derive(Debug, Clone, Copy)]
pub struct Motor {
    role: Role,
    caps: Capabilities,
}

impl Motor {
    #[must_use]
    pub fn new(role: Role) -> Self {
        Motor {
            role,
            caps: Capabilities::default(),
        }
    }

    #[must_use]
    pub fn with_capabilities(role: Role, caps: Capabilities) -> Self {
        Motor { role, caps }
    }

    #[inline]
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    fn endpoint(&self, suffix: &str) -> String {
        format!("{}_{}", self.role.endpoint_base(), suffix)
    }

    fn permitted(&self, allowed: bool, operation: &'static str) -> Result<(), MotorError> {
        if allowed {
            Ok(())
        } else {
            Err(MotorError::NotSupported {
                role: self.role,
                operation,
            })
        }
    }

    /// The controller's status string; [`READY`] means idle and accepting
    /// commands.
    ///
    /// # Errors
    /// Propagates broker failures and replies without a status string.
    pub async fn status<C: CommandClient + ?Sized>(
        &self,
        client: &mut C,
    ) -> Result<String, MotorError> {
        self.permitted(self.caps.query_status, "status queries")?;
        let endpoint = self.endpoint("motor_request_status");
        let reply = client.get(&endpoint).await?;
        Ok(reply.require_raw_str(&endpoint)?.to_string())
    }

    /// Drives to the calibrated zero position.
    ///
    /// # Errors
    /// Propagates broker failures; fails if zeroing is not supported.
    pub async fn move_to_zero<C: CommandClient + ?Sized>(
        &self,
        client: &mut C,
    ) -> Result<(), MotorError> {
        self.permitted(self.caps.move_to_zero, "zeroing")?;
        client.set(&self.endpoint("move_to_position"), json!(0)).await?;
        Ok(())
    }

    /// Moves by a signed number of steps; sign is direction.
    ///
    /// # Errors
    /// Propagates broker failures; fails if step moves are not supported.
    pub async fn move_steps<C: CommandClient + ?Sized>(
        &self,
        client: &mut C,
        steps: i32,
    ) -> Result<(), MotorError> {
        self.permitted(self.caps.move_steps, "step moves")?;
        println!(
            "[{}] moving {} motor by {} steps",
            Local::now(),
            self.role,
            steps
        );
        client.set(&self.endpoint("move_steps"), json!(steps)).await?;
        Ok(())
    }

    /// Tells the controller to halt as soon as possible.
    ///
    /// # Errors
    /// Propagates broker failures; fails if stopping is not supported.
    pub async fn stop_and_kill<C: CommandClient + ?Sized>(
        &self,
        client: &mut C,
    ) -> Result<(), MotorError> {
        self.permitted(self.caps.stop, "stopping")?;
        client
            .set(&self.endpoint("status_command"), json!("stop_and_kill"))
            .await?;
        Ok(())
    }

    /// Polls the status endpoint until the controller reports [`READY`].
    /// A ready reply always wins over a simultaneous deadline. On
    /// cancellation the stop command is sent before returning.
    ///
    /// # Errors
    /// `PollTimeout` past the plan's deadline, `Cancelled` if the token
    /// fires, otherwise propagated broker failures.
    pub async fn wait_until_ready<C: CommandClient + ?Sized>(
        &self,
        client: &mut C,
        plan: &WaitPlan,
        cancel: &CancelToken,
    ) -> Result<(), MotorError> {
        let started = Instant::now();
        loop {
            if cancel.is_cancelled() {
                self.stop_and_kill(client).await?;
                return Err(MotorError::Cancelled { role: self.role });
            }
            let status = self.status(client).await?;
            if status == READY {
                return Ok(());
            }
            println!(
                "[{}] {} motor status [{}]",
                Local::now(),
                self.role,
                status
            );
            if let Some(limit) = plan.timeout {
                if started.elapsed() >= limit {
                    return Err(MotorError::PollTimeout {
                        role: self.role,
                        waited: started.elapsed(),
                    });
                }
            }
            async_std::task::sleep(plan.poll_interval).await;
        }
    }
}
