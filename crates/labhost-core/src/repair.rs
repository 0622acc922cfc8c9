//! Repair escalation.
//!
//! Repair walks a fixed list of actions from least to most intrusive. Each
//! action either does not apply to the host, fails, or runs; after an action
//! runs, the host's health check decides whether the repair is done. The
//! first action whose health check passes ends the walk. When every action
//! is exhausted the recorded outcomes become a
//! [`HostError::RepairTotalFailure`].

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::clock::Clock;
use crate::error::{HostError, RepairFailure};
use crate::metrics::{RepairMetrics, UNKNOWN_BOARD};

/// A repair action, in escalation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepairAction {
    /// Reboot over ssh.
    Reboot,
    /// Power the host off and on through its servo.
    ServoPower,
    /// Power cycle the host's RPM outlet.
    RpmPowercycle,
    /// Install the stable image with the update engine.
    Install,
    /// Powerwash, then install the stable image.
    InstallWithPowerwash,
    /// Install the stable test image from the servo USB key.
    ServoReinstall,
}

impl RepairAction {
    /// Every action, least intrusive first.
    pub const ESCALATION: [Self; 6] = [
        Self::Reboot,
        Self::ServoPower,
        Self::RpmPowercycle,
        Self::Install,
        Self::InstallWithPowerwash,
        Self::ServoReinstall,
    ];

    /// Stable name used in logs and failure reports.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Reboot => "reboot",
            Self::ServoPower => "servo_power",
            Self::RpmPowercycle => "rpm_powercycle",
            Self::Install => "install",
            Self::InstallWithPowerwash => "install_with_powerwash",
            Self::ServoReinstall => "servo_reinstall",
        }
    }
}

impl fmt::Display for RepairAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A host that repair can act on.
pub trait Repairable {
    /// Host being repaired.
    fn hostname(&self) -> &str;

    /// Runs one repair action. [`HostError::NotApplicable`] means the action
    /// does not apply and nothing was done.
    fn run_repair_action(&mut self, action: RepairAction) -> Result<(), HostError>;

    /// Health check run after each action.
    fn check_device(&mut self) -> Result<(), HostError>;

    /// Board label reported with repair metrics.
    fn board(&self) -> Option<String> {
        None
    }
}

/// How a repair action ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    /// The action ran and the health check passed.
    Succeeded,
    /// The action did not apply to the host.
    NotApplicable,
    /// The action or the health check after it failed.
    Failed,
}

/// One action's result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairOutcome {
    /// The action.
    pub action: RepairAction,
    /// How it ended.
    pub kind: OutcomeKind,
    /// Error message, for actions that did not succeed.
    pub message: Option<String>,
    /// Time spent on the action and its health check.
    pub elapsed: Duration,
}

/// Outcomes of one repair, in the order the actions ran.
#[derive(Debug, Clone)]
pub struct RepairReport {
    /// Host that was repaired.
    pub hostname: String,
    /// Wall-clock start of the repair.
    pub started_at: DateTime<Utc>,
    /// One entry per action attempted.
    pub outcomes: Vec<RepairOutcome>,
}

impl RepairReport {
    fn new(hostname: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            started_at: Utc::now(),
            outcomes: Vec::new(),
        }
    }

    /// The action that repaired the host, if any.
    #[must_use]
    pub fn succeeded_action(&self) -> Option<RepairAction> {
        self.outcomes
            .iter()
            .find(|o| o.kind == OutcomeKind::Succeeded)
            .map(|o| o.action)
    }

    /// Actions in the order they ran.
    pub fn actions(&self) -> impl Iterator<Item = RepairAction> + '_ {
        self.outcomes.iter().map(|o| o.action)
    }

    fn into_total_failure(self) -> HostError {
        let failures = self
            .outcomes
            .into_iter()
            .map(|o| RepairFailure {
                action: o.action.name().to_string(),
                not_applicable: o.kind == OutcomeKind::NotApplicable,
                message: o.message.unwrap_or_default(),
            })
            .collect();
        HostError::RepairTotalFailure {
            hostname: self.hostname,
            failures,
        }
    }
}

/// Runs repair actions in escalation order.
pub struct RepairController<'a> {
    actions: &'a [RepairAction],
    clock: &'a dyn Clock,
    metrics: Option<&'a RepairMetrics>,
}

impl fmt::Debug for RepairController<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepairController")
            .field("actions", &self.actions)
            .finish_non_exhaustive()
    }
}

impl<'a> RepairController<'a> {
    /// A controller for the standard escalation.
    #[must_use]
    pub fn new(clock: &'a dyn Clock) -> Self {
        Self::with_actions(&RepairAction::ESCALATION, clock)
    }

    /// A controller for a custom action list.
    #[must_use]
    pub const fn with_actions(actions: &'a [RepairAction], clock: &'a dyn Clock) -> Self {
        Self {
            actions,
            clock,
            metrics: None,
        }
    }

    /// Counts every action's outcome in `metrics`.
    #[must_use]
    pub const fn with_metrics(mut self, metrics: &'a RepairMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Repairs `host`.
    ///
    /// Returns the report once an action's health check passes, or
    /// [`HostError::RepairTotalFailure`] listing every action's error.
    pub fn run(&self, host: &mut dyn Repairable) -> Result<RepairReport, HostError> {
        let mut report = RepairReport::new(host.hostname());
        let board = match self.metrics {
            Some(_) => host.board().unwrap_or_else(|| UNKNOWN_BOARD.to_string()),
            None => String::new(),
        };
        let record = |action: RepairAction, kind: OutcomeKind| {
            if let Some(metrics) = self.metrics {
                metrics.action_completed(action, kind, &board);
            }
        };

        for &action in self.actions {
            let start = self.clock.now();
            let result = host
                .run_repair_action(action)
                .and_then(|()| host.check_device());
            let elapsed = self.clock.since(start);

            match result {
                Ok(()) => {
                    info!(hostname = %report.hostname, action = action.name(), elapsed_secs = elapsed.as_secs(), "repair succeeded");
                    record(action, OutcomeKind::Succeeded);
                    report.outcomes.push(RepairOutcome {
                        action,
                        kind: OutcomeKind::Succeeded,
                        message: None,
                        elapsed,
                    });
                    return Ok(report);
                },
                Err(e) if e.is_not_applicable() => {
                    warn!(hostname = %report.hostname, action = action.name(), error = %e, "repair action not applicable");
                    record(action, OutcomeKind::NotApplicable);
                    report.outcomes.push(RepairOutcome {
                        action,
                        kind: OutcomeKind::NotApplicable,
                        message: Some(e.to_string()),
                        elapsed,
                    });
                },
                Err(e) => {
                    warn!(hostname = %report.hostname, action = action.name(), error = %e, "failed to repair device");
                    record(action, OutcomeKind::Failed);
                    report.outcomes.push(RepairOutcome {
                        action,
                        kind: OutcomeKind::Failed,
                        message: Some(e.to_string()),
                        elapsed,
                    });
                },
            }
        }

        if let Some(metrics) = self.metrics {
            metrics.full_repair_failed(&board);
        }
        Err(report.into_total_failure())
    }
}
