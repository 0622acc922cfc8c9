//! Host label detection.
//!
//! Labels are produced by a static, ordered list of detectors. A detector
//! that fails is logged and skipped; the rest still run.

use tracing::{debug, error};

use crate::error::HostError;
use crate::inventory::BOARD_PREFIX;
use crate::transport::{RunOptions, Transport};
use crate::update::lsb_release_value;

/// Root of the IIO device tree searched for light sensors.
const LIGHTSENSOR_SEARCH_DIR: &str = "/sys/bus/iio/devices";

/// sysfs attributes exposed by supported light sensors.
const LIGHTSENSOR_FILES: [&str; 5] = [
    "in_illuminance0_input",
    "in_illuminance_input",
    "in_illuminance0_raw",
    "in_illuminance_raw",
    "illuminance0_input",
];

/// What a detector can see of the host.
pub struct LabelContext<'a> {
    /// Session to the host.
    pub transport: &'a dyn Transport,
    /// Whether a servo is attached.
    pub has_servo: bool,
    /// Label of the attached Chameleon board, if any.
    pub chameleon: Option<&'a str>,
    /// Whether the host is behind an RPM outlet.
    pub has_rpm: bool,
}

type DetectFn = fn(&LabelContext<'_>) -> Result<Vec<String>, HostError>;

/// One label detector.
#[derive(Clone, Copy)]
pub struct LabelDetector {
    /// Detector name, used in logs.
    pub name: &'static str,
    detect: DetectFn,
}

impl std::fmt::Debug for LabelDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LabelDetector")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl LabelDetector {
    /// Runs the detector.
    pub fn detect(&self, ctx: &LabelContext<'_>) -> Result<Vec<String>, HostError> {
        (self.detect)(ctx)
    }
}

/// Every detector, in the order labels are reported.
pub static LABEL_DETECTORS: &[LabelDetector] = &[
    LabelDetector {
        name: "board",
        detect: detect_board,
    },
    LabelDetector {
        name: "platform",
        detect: detect_platform,
    },
    LabelDetector {
        name: "servo",
        detect: detect_servo,
    },
    LabelDetector {
        name: "chameleon",
        detect: detect_chameleon,
    },
    LabelDetector {
        name: "rpm",
        detect: detect_rpm,
    },
    LabelDetector {
        name: "lightsensor",
        detect: detect_lightsensor,
    },
];

/// Runs `detectors` in order and collects their labels.
pub fn detect_labels(detectors: &[LabelDetector], ctx: &LabelContext<'_>) -> Vec<String> {
    let mut labels = Vec::new();
    for detector in detectors {
        match detector.detect(ctx) {
            Ok(found) => {
                debug!(detector = detector.name, labels = ?found, "label detector finished");
                labels.extend(found);
            },
            Err(e) => {
                error!(
                    hostname = %ctx.transport.hostname(),
                    detector = detector.name,
                    error = %e,
                    "label detector failed, ignoring it"
                );
            },
        }
    }
    labels
}

/// Board name from `CHROMEOS_RELEASE_BOARD`.
///
/// Development boards report `{board}-signed-{keyset}`; only the board is
/// kept, except that the `x86-` family prefix is part of the name.
#[must_use]
pub fn board_from_release(release_board: &str) -> String {
    let keep = if release_board.contains("x86") { 2 } else { 1 };
    release_board
        .split('-')
        .take(keep)
        .collect::<Vec<_>>()
        .join("-")
}

/// Platform name from a firmware id such as `Google_Link.2695.1.133`.
#[must_use]
pub fn platform_from_fwid(fwid: &str) -> String {
    let platform = fwid.split('.').next().unwrap_or(fwid).to_lowercase();
    platform.replace("google_", "")
}

fn detect_board(ctx: &LabelContext<'_>) -> Result<Vec<String>, HostError> {
    let lsb_release = ctx.transport.run("cat /etc/lsb-release")?.stdout;
    let board = lsb_release_value(&lsb_release, "CHROMEOS_RELEASE_BOARD")
        .ok_or_else(|| HostError::verification("CHROMEOS_RELEASE_BOARD missing from lsb-release"))?;
    Ok(vec![format!("{BOARD_PREFIX}{}", board_from_release(board))])
}

fn detect_platform(ctx: &LabelContext<'_>) -> Result<Vec<String>, HostError> {
    let fwid = ctx.transport.run("crossystem fwid")?;
    Ok(vec![format!("platform:{}", platform_from_fwid(fwid.stdout_trimmed()))])
}

fn detect_servo(ctx: &LabelContext<'_>) -> Result<Vec<String>, HostError> {
    Ok(if ctx.has_servo {
        vec!["servo".to_string()]
    } else {
        Vec::new()
    })
}

fn detect_chameleon(ctx: &LabelContext<'_>) -> Result<Vec<String>, HostError> {
    Ok(ctx.chameleon.map_or_else(Vec::new, |label| {
        vec!["chameleon".to_string(), format!("chameleon:{label}")]
    }))
}

fn detect_rpm(ctx: &LabelContext<'_>) -> Result<Vec<String>, HostError> {
    Ok(if ctx.has_rpm {
        vec!["rpm".to_string()]
    } else {
        Vec::new()
    })
}

fn detect_lightsensor(ctx: &LabelContext<'_>) -> Result<Vec<String>, HostError> {
    // Symlink loops under sysfs make find noisy but harmless.
    let search = format!(
        "find -L {LIGHTSENSOR_SEARCH_DIR} -maxdepth 4 2>/dev/null | egrep '{}'",
        LIGHTSENSOR_FILES.join("|")
    );
    let result = ctx
        .transport
        .run_with(&search, &RunOptions::new().ignore_status())?;
    Ok(if result.success() {
        vec!["lightsensor".to_string()]
    } else {
        Vec::new()
    })
}
