//! In-memory entitlement state: who is logged in and what they may use.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

const SECS_PER_DAY: i64 = 24 * 60 * 60;

/// Parses a server timestamp.
///
/// Accepts RFC 3339, naive date-times (assumed UTC) and plain dates
/// (midnight UTC).
#[must_use]
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// Whole days from `now` until `expiry`, never negative.
fn days_until(expiry: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    ((expiry - now).num_seconds() / SECS_PER_DAY).max(0)
}

/// The authenticated user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAccount {
    /// Remote user identifier.
    pub id: String,
    /// Login email.
    pub email: String,
    /// Display name, may be empty.
    #[serde(default)]
    pub name: String,
    /// Avatar (an emoji or URL), may be empty.
    #[serde(default)]
    pub avatar: String,
}

impl UserAccount {
    /// Name to show in the UI: the display name, else the email.
    #[must_use]
    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.email
        } else {
            &self.name
        }
    }
}

/// A device holding one of the account's slots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveDevice {
    pub device_id: String,
    pub device_name: Option<String>,
    /// Last activity timestamp as sent by the server.
    pub last_activity: Option<String>,
}

/// License granted by the remote authority.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseState {
    /// Plan name as shown to the user.
    pub plan_name: String,
    /// Expiration timestamp as sent by the server.
    pub expires_at: Option<String>,
    /// True when the license row itself is a trial plan.
    pub is_trial: bool,
    /// Days remaining as computed by the server.
    pub days_remaining: Option<i64>,
    /// Device allowance of the plan.
    pub max_devices: Option<u32>,
    /// Feature flags of the plan.
    #[serde(default)]
    pub features: Vec<String>,
}

impl LicenseState {
    /// Parsed expiration time.
    #[must_use]
    pub fn expires_at_utc(&self) -> Option<DateTime<Utc>> {
        self.expires_at.as_deref().and_then(parse_timestamp)
    }

    /// Returns true if the license has not expired at `now`.
    ///
    /// An unknown expiry counts as valid: the server only returns licenses
    /// it considers active.
    #[must_use]
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at_utc().is_none_or(|exp| exp > now)
    }

    /// Days remaining at `now`, preferring the local clock over the server value.
    #[must_use]
    pub fn days_remaining_at(&self, now: DateTime<Utc>) -> Option<i64> {
        self.expires_at_utc()
            .map(|exp| days_until(exp, now))
            .or(self.days_remaining)
    }
}

/// The trial lifecycle of this device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrialPhase {
    /// Never used a trial; may start one.
    Eligible,
    /// Trial running.
    Active,
    /// Trial used up.
    Expired,
}

/// Trial record of this device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialState {
    /// Trial currently running.
    pub active: bool,
    /// Expiration timestamp as sent by the server.
    pub expires_at: Option<String>,
    /// This device may start a trial.
    pub eligible: bool,
    /// This device already consumed its trial.
    pub already_used: bool,
    /// Trial length offered or granted, in hours.
    pub duration_hours: Option<u32>,
}

impl TrialState {
    /// A device that never used its trial.
    #[must_use]
    pub fn eligible(duration_hours: Option<u32>) -> Self {
        Self {
            active: false,
            expires_at: None,
            eligible: true,
            already_used: false,
            duration_hours,
        }
    }

    /// A running trial.
    #[must_use]
    pub fn active(expires_at: Option<String>) -> Self {
        Self {
            active: true,
            expires_at,
            eligible: false,
            already_used: true,
            duration_hours: None,
        }
    }

    /// A consumed trial.
    #[must_use]
    pub fn expired(expires_at: Option<String>) -> Self {
        Self {
            active: false,
            expires_at,
            eligible: false,
            already_used: true,
            duration_hours: None,
        }
    }

    /// The single phase this record is in.
    #[must_use]
    pub fn phase(&self) -> TrialPhase {
        if self.active {
            TrialPhase::Active
        } else if self.eligible && !self.already_used {
            TrialPhase::Eligible
        } else {
            TrialPhase::Expired
        }
    }

    /// Parsed expiration time.
    #[must_use]
    pub fn expires_at_utc(&self) -> Option<DateTime<Utc>> {
        self.expires_at.as_deref().and_then(parse_timestamp)
    }

    /// Returns true if the trial is running and not past its expiry at `now`.
    #[must_use]
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.active && self.expires_at_utc().is_none_or(|exp| exp > now)
    }

    /// Days remaining at `now`, if the expiry is known.
    #[must_use]
    pub fn days_remaining_at(&self, now: DateTime<Utc>) -> Option<i64> {
        self.expires_at_utc().map(|exp| days_until(exp, now))
    }
}

/// Ban reported by the remote authority.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanState {
    /// Reason given by the operator.
    pub reason: Option<String>,
    /// When the ban was issued.
    pub banned_at: Option<String>,
}

/// How the user is allowed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    /// Paid license.
    License,
    /// Time-limited trial.
    Trial,
    /// No access.
    None,
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::License => "license",
            Self::Trial => "trial",
            Self::None => "none",
        })
    }
}

/// Everything the engine knows about the current user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntitlementState {
    pub user: Option<UserAccount>,
    pub license: Option<LicenseState>,
    pub trial: Option<TrialState>,
    pub ban: Option<BanState>,
}

impl EntitlementState {
    /// License if present, else Trial if the trial is active, else None.
    #[must_use]
    pub fn access_type(&self) -> AccessMode {
        if self.license.is_some() {
            AccessMode::License
        } else if self.trial.as_ref().is_some_and(|t| t.active) {
            AccessMode::Trial
        } else {
            AccessMode::None
        }
    }

    /// Plan label: the license plan, "Trial" for an active trial.
    #[must_use]
    pub fn plan_name(&self) -> Option<&str> {
        match self.access_type() {
            AccessMode::License => self.license.as_ref().map(|l| l.plan_name.as_str()),
            AccessMode::Trial => Some("Trial"),
            AccessMode::None => None,
        }
    }

    /// Forgets everything.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
