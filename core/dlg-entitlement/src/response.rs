//! Normalization of remote responses.
//!
//! The backend has shipped several response shapes for the same actions
//! (`code` vs `reason`, camelCase vs snake_case counters, nested vs flat
//! license and trial objects). Everything in this module maps those shapes
//! onto one canonical set of types; nothing outside it reads raw JSON.
//!
//! Access is granted only when both `success` and `access` are the literal
//! JSON `true`. Any other value, including a missing or null field, is a
//! denial, unless the server failed without saying why: an HTTP error
//! status with no recognizable code is reported as a transport failure.

use crate::decision::DenialReason;
use crate::entitlement::{
    ActiveDevice, BanState, LicenseState, TrialPhase, TrialState, UserAccount,
};
use crate::error::{EntitlementError, EntitlementResult, TransportError};
use crate::gateway::RemoteResponse;
use serde::Serialize;
use serde_json::{Map, Value};

const ACTIVE_DEVICES: &[&str] = &["active_devices", "activeDevices"];
const MAX_DEVICES: &[&str] = &["max_devices", "maxDevices"];
const TRIAL_ELIGIBLE: &[&str] = &["trial_eligible", "can_use_trial", "canUseTrial"];
const SHOULD_CLEAR: &[&str] = &["should_clear_session", "shouldClearSession"];
const MESSAGE: &[&str] = &["error", "message"];

/// Outcome of a login or session verification response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthVerdict {
    Granted(Grant),
    Denied(Denial),
    /// The server failed without an authoritative answer.
    Unavailable(TransportError),
}

/// Entitlements handed out with a successful authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub user: UserAccount,
    pub license: Option<LicenseState>,
    pub trial: Option<TrialState>,
    /// The server asked for the saved session to be dropped anyway.
    pub should_clear_session: bool,
}

/// A classified refusal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denial {
    pub reason: DenialReason,
    pub message: Option<String>,
    /// Explicit session eviction instruction, if the server sent one.
    pub should_clear_session: Option<bool>,
    /// User echoed back by the server (e.g. authenticated but unlicensed).
    pub user: Option<UserAccount>,
    /// Trial information carried by the refusal.
    pub trial: Option<TrialState>,
}

impl Denial {
    /// Ban details, if this is a ban.
    #[must_use]
    pub fn ban(&self) -> Option<BanState> {
        match &self.reason {
            DenialReason::Banned { reason, banned_at } => Some(BanState {
                reason: reason.clone(),
                banned_at: banned_at.clone(),
            }),
            _ => None,
        }
    }
}

/// Human-verification settings published by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CaptchaSettings {
    pub enabled: bool,
    pub site_key: String,
}

/// Read-only view over a JSON object that knows the key aliases.
#[derive(Clone, Copy)]
struct Fields<'a>(&'a Map<String, Value>);

impl<'a> Fields<'a> {
    fn first(&self, keys: &[&str]) -> Option<&'a Value> {
        keys.iter()
            .filter_map(|k| self.0.get(*k))
            .find(|v| !v.is_null())
    }

    fn str(&self, keys: &[&str]) -> Option<&'a str> {
        keys.iter()
            .filter_map(|k| self.0.get(*k).and_then(Value::as_str))
            .map(str::trim)
            .find(|s| !s.is_empty())
    }

    fn string(&self, keys: &[&str]) -> Option<String> {
        self.str(keys).map(String::from)
    }

    /// Literal JSON booleans only; `"true"` or `1` do not count.
    fn flag(&self, keys: &[&str]) -> Option<bool> {
        self.first(keys).and_then(Value::as_bool)
    }

    fn is_true(&self, key: &str) -> bool {
        self.0.get(key) == Some(&Value::Bool(true))
    }

    fn int(&self, keys: &[&str]) -> Option<i64> {
        self.first(keys).and_then(|v| match v {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
    }

    fn count(&self, keys: &[&str]) -> Option<u32> {
        self.int(keys).and_then(|n| u32::try_from(n).ok())
    }

    fn object(&self, keys: &[&str]) -> Option<Fields<'a>> {
        self.first(keys).and_then(Value::as_object).map(Fields)
    }

    fn objects(&self, key: &str) -> impl Iterator<Item = Fields<'a>> {
        self.0
            .get(key)
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_object)
            .map(Fields)
    }

    fn strings(&self, key: &str) -> Vec<String> {
        self.0
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn id(&self, key: &str) -> Option<String> {
        match self.0.get(key)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Denial kinds, before their payload is extracted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    CaptchaRequired,
    CaptchaFailed,
    Maintenance,
    Banned,
    DeviceLimit,
    NoLicense,
    InvalidCredentials,
}

impl Kind {
    /// Known `code`/`reason` keywords across backend versions.
    fn from_keyword(keyword: &str) -> Option<Self> {
        Some(match keyword.trim().to_ascii_lowercase().as_str() {
            "recaptcha_required" | "captcha_required" => Self::CaptchaRequired,
            "recaptcha_failed" | "captcha_failed" => Self::CaptchaFailed,
            "maintenance" => Self::Maintenance,
            "banned" => Self::Banned,
            "device_limit" | "device_limit_exceeded" => Self::DeviceLimit,
            "no_license" | "expired" | "no_access" => Self::NoLicense,
            "invalid_credentials" | "user_not_found" => Self::InvalidCredentials,
            _ => return None,
        })
    }

    /// Local mapping when the server sent no recognizable code.
    fn infer(fields: Fields<'_>, status: Option<u16>) -> Option<Self> {
        if fields.str(&["ban_reason", "banned_at"]).is_some() {
            return Some(Self::Banned);
        }
        let failed = !fields.is_true("success");
        if failed
            && fields.count(ACTIVE_DEVICES).is_some()
            && fields.count(MAX_DEVICES).is_some()
        {
            return Some(Self::DeviceLimit);
        }
        match status {
            Some(401) => Some(Self::InvalidCredentials),
            Some(503) => Some(Self::Maintenance),
            _ => None,
        }
    }
}

fn recognize(f: Fields<'_>, status: Option<u16>) -> Option<Kind> {
    f.str(&["code"])
        .and_then(Kind::from_keyword)
        .or_else(|| f.str(&["reason"]).and_then(Kind::from_keyword))
        .or_else(|| Kind::infer(f, status))
}

/// Classifies a refusal into exactly one [`DenialReason`].
///
/// Uses `code` first, then `reason`, then the local mapping table
/// (ban fields, device counters, HTTP status).
#[must_use]
pub fn classify(body: &Map<String, Value>, status: Option<u16>) -> DenialReason {
    let f = Fields(body);
    let code = f.str(&["code"]);
    let reason = f.str(&["reason"]);
    let kind = recognize(f, status);

    match kind {
        Some(Kind::CaptchaRequired) => DenialReason::CaptchaRequired,
        Some(Kind::CaptchaFailed) => DenialReason::CaptchaFailed,
        Some(Kind::Maintenance) => DenialReason::Maintenance,
        Some(Kind::InvalidCredentials) => DenialReason::InvalidCredentials,
        Some(Kind::Banned) => {
            // The legacy shape puts the free-text ban reason in `reason`.
            let free_text = reason.filter(|r| Kind::from_keyword(r).is_none());
            DenialReason::Banned {
                reason: f.string(&["ban_reason"]).or(free_text.map(String::from)),
                banned_at: f.string(&["banned_at"]),
            }
        }
        Some(Kind::DeviceLimit) => DenialReason::DeviceLimitExceeded {
            active_count: f.count(ACTIVE_DEVICES).unwrap_or(0),
            max_allowed: f.count(MAX_DEVICES).unwrap_or(0),
            devices: f.objects("devices").filter_map(active_device_from).collect(),
        },
        Some(Kind::NoLicense) => DenialReason::NoLicenseOrTrial {
            trial_eligible: f.flag(TRIAL_ELIGIBLE).unwrap_or(false)
                || trial_from(f).is_some_and(|t| t.phase() == TrialPhase::Eligible),
        },
        None => DenialReason::Unknown {
            server_code: code.or(reason).map(String::from),
            message: f.string(MESSAGE),
        },
    }
}

/// Returns the transport error for an HTTP error response that carries no
/// recognizable denial: a crashed handler, a rejected API key, an unknown
/// action.
///
/// The HTTP status alone is not authoritative; `code`, `reason`, ban fields
/// or device counters must say what was refused.
#[must_use]
pub fn server_failure(resp: &RemoteResponse) -> Option<TransportError> {
    let status = resp.status.filter(|s| *s >= 400)?;
    let f = Fields(&resp.body);
    if recognize(f, None).is_some() {
        return None;
    }
    let message = f.string(MESSAGE).unwrap_or_else(|| "no details".to_string());
    Some(if status >= 500 {
        TransportError::Other(format!("server error {status}: {message}"))
    } else {
        TransportError::Protocol(format!("request refused with status {status}: {message}"))
    })
}

/// Normalizes a `full_login_check` or `verify_session` response.
#[must_use]
pub fn normalize_auth(resp: &RemoteResponse) -> AuthVerdict {
    let f = Fields(&resp.body);
    let should_clear = f.flag(SHOULD_CLEAR);

    if f.is_true("success") && f.is_true("access") {
        if let Some(grant) = grant_from(f, should_clear == Some(true)) {
            return AuthVerdict::Granted(grant);
        }
        return AuthVerdict::Denied(Denial {
            reason: DenialReason::Unknown {
                server_code: None,
                message: Some("access granted without user or entitlement".to_string()),
            },
            message: None,
            should_clear_session: should_clear,
            user: None,
            trial: None,
        });
    }

    if let Some(error) = server_failure(resp) {
        return AuthVerdict::Unavailable(error);
    }

    AuthVerdict::Denied(Denial {
        reason: classify(&resp.body, resp.status),
        message: f.string(MESSAGE),
        should_clear_session: should_clear,
        user: user_from(f),
        trial: trial_from(f),
    })
}

/// Normalizes a `check_license` response. `Ok(None)` means "no license".
///
/// # Errors
///
/// Returns [`EntitlementError::Rejected`] if the server refused the request.
pub fn normalize_license(resp: &RemoteResponse) -> EntitlementResult<Option<LicenseState>> {
    let f = Fields(&resp.body);
    if !f.is_true("success") {
        return Err(rejected(f));
    }
    if f.flag(&["hasLicense", "has_license", "valid"]) == Some(false) {
        return Ok(None);
    }
    Ok(license_from(f, false))
}

/// Normalizes a `check_trial` response.
///
/// # Errors
///
/// Returns [`EntitlementError::Rejected`] if the server refused the request
/// or sent no trial information.
pub fn normalize_trial(resp: &RemoteResponse) -> EntitlementResult<TrialState> {
    let f = Fields(&resp.body);
    if !f.is_true("success") {
        // Trials switched off server-side come back as a failed eligibility check.
        if f.flag(&["eligible"]) == Some(false) {
            return Ok(TrialState::expired(None));
        }
        return Err(rejected(f));
    }
    trial_from(f).ok_or_else(|| EntitlementError::Rejected {
        code: None,
        message: "response carried no trial information".to_string(),
    })
}

/// Normalizes a `register_trial` response into the started trial.
///
/// # Errors
///
/// Returns [`EntitlementError::Rejected`] if the trial was refused
/// (e.g. `TRIAL_ALREADY_USED`).
pub fn normalize_trial_registration(resp: &RemoteResponse) -> EntitlementResult<TrialState> {
    let f = Fields(&resp.body);
    if !f.is_true("success") {
        return Err(rejected(f));
    }
    if let Some(t) = f.object(&["trial"]) {
        let mut trial = trial_from_object(t);
        if trial.phase() != TrialPhase::Active {
            trial = TrialState {
                duration_hours: trial.duration_hours,
                ..TrialState::active(trial.expires_at)
            };
        }
        return Ok(trial);
    }
    Ok(TrialState {
        duration_hours: duration_hours(f),
        ..TrialState::active(f.string(&["trial_expires_at", "expires_at"]))
    })
}

/// Normalizes a simple `login` response into the authenticated user.
///
/// # Errors
///
/// Returns [`EntitlementError::Rejected`] if the credentials were refused.
pub fn normalize_credentials(resp: &RemoteResponse) -> EntitlementResult<UserAccount> {
    let f = Fields(&resp.body);
    if !f.is_true("success") {
        let reason = classify(&resp.body, resp.status);
        return Err(EntitlementError::Rejected {
            code: Some(reason.code().to_string()),
            message: f.string(MESSAGE).unwrap_or_else(|| reason.to_string()),
        });
    }
    user_from(f).ok_or_else(|| EntitlementError::Rejected {
        code: None,
        message: "response carried no user".to_string(),
    })
}

/// Normalizes a `get_recaptcha_settings` response.
///
/// # Errors
///
/// Returns [`EntitlementError::Rejected`] if the server refused the request.
pub fn normalize_captcha_settings(resp: &RemoteResponse) -> EntitlementResult<CaptchaSettings> {
    let f = Fields(&resp.body);
    if !f.is_true("success") {
        return Err(rejected(f));
    }
    Ok(CaptchaSettings {
        enabled: f.is_true("enabled"),
        site_key: f.string(&["site_key"]).unwrap_or_default(),
    })
}

fn rejected(f: Fields<'_>) -> EntitlementError {
    EntitlementError::Rejected {
        code: f.string(&["code", "reason"]),
        message: f
            .string(MESSAGE)
            .unwrap_or_else(|| "request rejected".to_string()),
    }
}

fn grant_from(f: Fields<'_>, should_clear_session: bool) -> Option<Grant> {
    let user = user_from(f)?;
    let license = license_from(f, true);
    let trial = if f.is_true("is_trial") && f.object(&["license"]).is_none() {
        Some(TrialState::active(f.string(&["expires_at", "trial_expires_at"])))
    } else {
        trial_from(f)
    };

    let entitled = license.is_some() || trial.as_ref().is_some_and(|t| t.active);
    if !entitled {
        return None;
    }

    Some(Grant {
        user,
        license,
        trial,
        should_clear_session,
    })
}

fn active_device_from(d: Fields<'_>) -> Option<ActiveDevice> {
    Some(ActiveDevice {
        device_id: d.id("device_id")?,
        device_name: d.string(&["device_name"]),
        last_activity: d.string(&["last_activity", "last_activity_at"]),
    })
}

fn user_from(f: Fields<'_>) -> Option<UserAccount> {
    let u = f.object(&["user"])?;
    let id = u.id("id")?;
    let email = u.string(&["email"])?;
    Some(UserAccount {
        id,
        email,
        name: u.string(&["name"]).unwrap_or_default(),
        avatar: u.string(&["avatar"]).unwrap_or_default(),
    })
}

/// Reads a license from either the nested or the flat shape.
///
/// With `trial_as_trial_state`, a flat `is_trial: true` grant is left to
/// [`trial_from`] instead of being reported as a license.
fn license_from(f: Fields<'_>, trial_as_trial_state: bool) -> Option<LicenseState> {
    if let Some(l) = f.object(&["license"]) {
        let plan_name = l.string(&["plan_name", "plan"]).unwrap_or_default();
        let is_trial = l
            .flag(&["is_trial"])
            .unwrap_or_else(|| plan_name.eq_ignore_ascii_case("trial"));
        return Some(LicenseState {
            expires_at: l.string(&["expires_at", "end_date"]),
            is_trial,
            days_remaining: l.int(&["days_remaining"]),
            max_devices: f.count(MAX_DEVICES).or_else(|| l.count(MAX_DEVICES)),
            features: f.strings("features"),
            plan_name,
        });
    }

    let is_trial = f.is_true("is_trial");
    if is_trial && trial_as_trial_state {
        return None;
    }
    let plan_name = f.string(&["plan_name"])?;
    Some(LicenseState {
        plan_name,
        expires_at: f.string(&["expires_at", "end_date"]),
        is_trial,
        days_remaining: f.int(&["days_remaining"]),
        max_devices: f.count(MAX_DEVICES),
        features: f.strings("features"),
    })
}

fn duration_hours(f: Fields<'_>) -> Option<u32> {
    f.count(&["duration_hours"]).or_else(|| {
        f.count(&["duration_days", "trial_days"])
            .map(|d| d.saturating_mul(24))
    })
}

fn trial_from_object(t: Fields<'_>) -> TrialState {
    let expires_at = t.string(&["expires_at", "trial_expires_at", "expired_at"]);
    let duration_hours = duration_hours(t);
    if t.is_true("active") {
        TrialState {
            duration_hours,
            ..TrialState::active(expires_at)
        }
    } else if t.is_true("eligible") && !t.is_true("already_used") && !t.is_true("exists") {
        TrialState::eligible(duration_hours)
    } else {
        TrialState {
            duration_hours,
            ..TrialState::expired(expires_at)
        }
    }
}

/// Reads trial information from either the nested or the flat shape.
fn trial_from(f: Fields<'_>) -> Option<TrialState> {
    if let Some(t) = f.object(&["trial"]) {
        return Some(trial_from_object(t));
    }

    let eligible = f.flag(TRIAL_ELIGIBLE).or_else(|| f.flag(&["eligible"]));
    let already_used = f.flag(&["already_used"]);
    match (eligible, already_used) {
        (None, None) => None,
        (Some(true), Some(false) | None) => Some(TrialState::eligible(duration_hours(f))),
        _ => Some(TrialState::expired(f.string(&["trial_expires_at"]))),
    }
}
