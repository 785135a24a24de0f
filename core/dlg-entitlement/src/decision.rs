//! Access decisions and their pure evaluation.

use crate::entitlement::{
    AccessMode, ActiveDevice, EntitlementState, LicenseState, TrialPhase, TrialState,
};
use crate::error::TransportError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Why access was denied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum DenialReason {
    /// Human verification must be completed first.
    CaptchaRequired,
    /// Human verification was rejected.
    CaptchaFailed,
    /// The service is in maintenance mode.
    Maintenance,
    /// The account is banned.
    Banned {
        reason: Option<String>,
        banned_at: Option<String>,
    },
    /// Too many devices are already active on the account.
    DeviceLimitExceeded {
        active_count: u32,
        max_allowed: u32,
        /// Devices holding the slots, when the server lists them.
        #[serde(skip_serializing_if = "Vec::is_empty")]
        devices: Vec<ActiveDevice>,
    },
    /// Neither a license nor an active trial.
    NoLicenseOrTrial {
        /// This device may still start a trial.
        trial_eligible: bool,
    },
    /// Wrong email/password or the account no longer exists.
    InvalidCredentials,
    /// Anything the client could not classify.
    Unknown {
        /// The unrecognized `code`/`reason` the server sent.
        server_code: Option<String>,
        message: Option<String>,
    },
}

impl DenialReason {
    /// Stable machine-readable code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::CaptchaRequired => "captcha_required",
            Self::CaptchaFailed => "captcha_failed",
            Self::Maintenance => "maintenance",
            Self::Banned { .. } => "banned",
            Self::DeviceLimitExceeded { .. } => "device_limit_exceeded",
            Self::NoLicenseOrTrial { .. } => "no_license_or_trial",
            Self::InvalidCredentials => "invalid_credentials",
            Self::Unknown { .. } => "unknown",
        }
    }
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Banned {
                reason: Some(reason),
                ..
            } => write!(f, "banned: {reason}"),
            Self::DeviceLimitExceeded {
                active_count,
                max_allowed,
                ..
            } => write!(f, "device limit reached ({active_count}/{max_allowed})"),
            Self::NoLicenseOrTrial {
                trial_eligible: true,
            } => f.write_str("no license, trial available"),
            Self::Unknown {
                message: Some(message),
                ..
            } => write!(f, "unknown: {message}"),
            other => f.write_str(other.code()),
        }
    }
}

/// The reconciled outcome of an entitlement check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AccessDecision {
    /// The application may proceed.
    Granted {
        mode: AccessMode,
        plan_name: Option<String>,
        expires_at: Option<String>,
        days_remaining: Option<i64>,
    },
    /// The remote authority (or local state) says no.
    Denied {
        reason: DenialReason,
        message: Option<String>,
    },
    /// No answer could be obtained; try again.
    TransportFailed { error: TransportError },
    /// No trustworthy saved session to resume.
    NoSession,
}

impl AccessDecision {
    /// A denial without a server message.
    #[must_use]
    pub fn denied(reason: DenialReason) -> Self {
        Self::Denied {
            reason,
            message: None,
        }
    }

    /// Returns true if access was granted.
    #[must_use]
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted { .. })
    }

    /// The access mode this decision grants.
    #[must_use]
    pub fn mode(&self) -> AccessMode {
        match self {
            Self::Granted { mode, .. } => *mode,
            _ => AccessMode::None,
        }
    }

    /// The denial reason, if denied.
    #[must_use]
    pub fn denial_reason(&self) -> Option<&DenialReason> {
        match self {
            Self::Denied { reason, .. } => Some(reason),
            _ => None,
        }
    }
}

impl From<TransportError> for AccessDecision {
    fn from(error: TransportError) -> Self {
        Self::TransportFailed { error }
    }
}

fn license_grant(license: &LicenseState, now: DateTime<Utc>) -> AccessDecision {
    AccessDecision::Granted {
        mode: AccessMode::License,
        plan_name: Some(license.plan_name.clone()),
        expires_at: license.expires_at.clone(),
        days_remaining: license.days_remaining_at(now),
    }
}

fn trial_grant(trial: &TrialState, now: DateTime<Utc>) -> AccessDecision {
    AccessDecision::Granted {
        mode: AccessMode::Trial,
        plan_name: Some("Trial".to_string()),
        expires_at: trial.expires_at.clone(),
        days_remaining: trial.days_remaining_at(now),
    }
}

/// Grant built from the current state, if it confers access at `now`.
pub(crate) fn granted_from(state: &EntitlementState, now: DateTime<Utc>) -> Option<AccessDecision> {
    if let Some(license) = state.license.as_ref().filter(|l| l.is_valid_at(now)) {
        return Some(license_grant(license, now));
    }
    state
        .trial
        .as_ref()
        .filter(|t| t.is_active_at(now))
        .map(|trial| trial_grant(trial, now))
}

/// Describes a grant the remote authority just issued.
///
/// The server is authoritative here, so local expiry is not re-checked.
pub(crate) fn adopted_grant(state: &EntitlementState, now: DateTime<Utc>) -> AccessDecision {
    if let Some(license) = &state.license {
        return license_grant(license, now);
    }
    if let Some(trial) = state.trial.as_ref().filter(|t| t.active) {
        return trial_grant(trial, now);
    }
    AccessDecision::denied(DenialReason::NoLicenseOrTrial {
        trial_eligible: false,
    })
}

/// Evaluates the current state at `now`.
///
/// Order: ban, valid license, active trial, trial eligibility, no access.
/// A ban overrides any license or trial.
#[must_use]
pub fn evaluate(state: &EntitlementState, now: DateTime<Utc>) -> AccessDecision {
    if let Some(ban) = &state.ban {
        return AccessDecision::denied(DenialReason::Banned {
            reason: ban.reason.clone(),
            banned_at: ban.banned_at.clone(),
        });
    }

    if let Some(granted) = granted_from(state, now) {
        return granted;
    }

    let trial_eligible = state
        .trial
        .as_ref()
        .is_some_and(|t| t.phase() == TrialPhase::Eligible);
    AccessDecision::denied(DenialReason::NoLicenseOrTrial { trial_eligible })
}
