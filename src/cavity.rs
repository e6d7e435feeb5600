#![warn(clippy::pedantic)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]

use std::f64::consts::PI;
use std::fmt;

pub const SPEED_OF_LIGHT_M_PER_S: f64 = 299_792_458.0;
pub const CM_PER_IN: f64 = 2.54;

/// Constants of the lead-screw drives, convertible between physical travel
/// and stepper counts. All lengths in inches.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepCalibration {
    pub holder_thickness_in: f64,
    pub lip_thickness_in: f64,
    pub pitch_in: f64,
    pub steps_per_rotation: f64,
}

impl Default for StepCalibration {
    fn default() -> Self {
        StepCalibration {
            holder_thickness_in: 0.25,
            lip_thickness_in: 0.05,
            pitch_in: 0.05,
            steps_per_rotation: 20_000.0,
        }
    }
}

impl StepCalibration {
    /// Steps to move an alumina plate holder so the *plate* travels
    /// `distance_in`. The holder rides on a lip, so the plate center sits
    /// offset from the holder center; that gap is folded into the travel
    /// before converting through the screw pitch.
    #[must_use]
    pub fn plate_steps(&self, distance_in: f64, plate_thickness_in: f64) -> i32 {
        let holder_center = self.holder_thickness_in / 2.0;
        let plate_center = self.lip_thickness_in + plate_thickness_in / 2.0;
        let actual_distance = distance_in + (plate_center - holder_center);
        (self.steps_per_rotation * actual_distance / self.pitch_in).round() as i32
    }

    /// Steps to move the curved mirror by `distance_in`. The mirror mount
    /// has no lip correction.
    #[must_use]
    pub fn mirror_steps(&self, distance_in: f64) -> i32 {
        (self.steps_per_rotation * distance_in / self.pitch_in).round() as i32
    }
}

/// Separation between evenly spaced dielectric plates for a cavity of the
/// given total length.
#[must_use]
pub fn plate_separation(cavity_length_in: f64, num_plates: u32) -> f64 {
    cavity_length_in / f64::from(num_plates + 1)
}

/// The dielectric plate arrangement, fixed for the duration of a scan.
#[derive(Debug, Clone, Copy)]
pub struct PlateStack {
    pub num_plates: u32,
    pub plate_thickness_in: f64,
    pub initial_separation_in: f64,
}

/// Cavity geometry after a move; threaded through successive coordinated
/// moves by the caller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CavityState {
    pub cavity_length_in: f64,
    pub plate_separation_in: f64,
}

/// Everything fixed about the cavity for one run.
#[derive(Debug, Clone, Copy)]
pub struct CavitySetup {
    pub stack: PlateStack,
    pub initial_length_in: f64,
    pub mirror_radius_cm: f64,
    pub eps_r: f64,
}

impl CavitySetup {
    #[must_use]
    pub fn initial_state(&self) -> CavityState {
        CavityState {
            cavity_length_in: self.initial_length_in,
            plate_separation_in: self.stack.initial_separation_in,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GeometryError {
    NonPositiveLength(f64),       // cavity length must be > 0
    NonPositiveRadius(f64),       // mirror radius must be > 0
    NonPositivePermittivity(f64), // relative permittivity must be > 0
    UnstableGeometry { length_cm: f64, r0_cm: f64 }, // longer than the mirror radius
}

impl fmt::Display for GeometryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GeometryError::NonPositiveLength(l) => {
                write!(f, "cavity length {} cm is not positive", l)
            }
            GeometryError::NonPositiveRadius(r) => {
                write!(f, "mirror radius {} cm is not positive", r)
            }
            GeometryError::NonPositivePermittivity(e) => {
                write!(f, "relative permittivity {} is not positive", e)
            }
            GeometryError::UnstableGeometry { length_cm, r0_cm } => write!(
                f,
                "cavity length {} cm exceeds the mirror radius {} cm",
                length_cm, r0_cm
            ),
        }
    }
}

/// Resonant frequency in Hz of the `TEM_lmn` mode of the cavity: one flat
/// and one curved mirror of radius `r0_cm`, filled with a medium of relative
/// permittivity `eps_r`. Input lengths in cm.
///
/// # Errors
/// Lengths and permittivity must be positive and the cavity no longer than
/// the mirror radius; anything else is outside the mode formula's domain.
pub fn flmn(
    l: u32,
    m: u32,
    n: u32,
    length_cm: f64,
    eps_r: f64,
    r0_cm: f64,
) -> Result<f64, GeometryError> {
    if length_cm <= 0.0 {
        return Err(GeometryError::NonPositiveLength(length_cm));
    }
    if r0_cm <= 0.0 {
        return Err(GeometryError::NonPositiveRadius(r0_cm));
    }
    if eps_r <= 0.0 {
        return Err(GeometryError::NonPositivePermittivity(eps_r));
    }
    if length_cm > r0_cm {
        return Err(GeometryError::UnstableGeometry { length_cm, r0_cm });
    }
    let length_m = length_cm / 100.0;
    let r0_m = r0_cm / 100.0;
    let v = SPEED_OF_LIGHT_M_PER_S / eps_r.sqrt();

    let arccos_term = (1.0 - 2.0 * length_m / r0_m).acos();
    let n_term = (f64::from(n) + 1.0) * v / 2.0 / length_m;
    let lm_term = (1.0 + f64::from(l) + f64::from(m)) * v / (4.0 * length_m * PI);
    Ok(n_term + lm_term * arccos_term)
}
