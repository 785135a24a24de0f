//! The entitlement state machine.
//!
//! A [`Reconciler`] owns the in-memory user, license, trial and ban state
//! and the [`SessionStore`]. It sends requests through a [`RemoteGateway`],
//! normalizes the answers and turns them into [`AccessDecision`]s.
//!
//! Rules that hold for every operation:
//! - the complete verdict is computed before any state changes, and state is
//!   replaced in one assignment;
//! - transport failures never change state and never touch the store;
//! - session file I/O failures are logged and otherwise ignored, so the
//!   decision of this run stands even if it cannot be remembered.

use crate::activity::{ActivityEvent, ActivityNotifier, ActivityObserver, Operation};
use crate::config::ClientConfig;
use crate::decision::{self, AccessDecision, DenialReason};
use crate::device::{DeviceFingerprint, DeviceInfo};
use crate::entitlement::{
    AccessMode, BanState, EntitlementState, LicenseState, TrialState, UserAccount,
};
use crate::error::{EntitlementError, EntitlementResult};
use crate::gateway::{RemoteGateway, actions};
use crate::response::{self, AuthVerdict, CaptchaSettings, Denial, Grant, normalize_auth};
use crate::session::{SessionDraft, SessionStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of [`Reconciler::logout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LogoutOutcome {
    /// Nobody was logged in; nothing was sent.
    AlreadyLoggedOut,
    /// Local state was cleared. `remote_notified` is false if the server
    /// could not be told.
    LoggedOut { remote_notified: bool },
}

/// Orchestrates login, session verification and entitlement refreshes.
///
/// One instance per process, owned by the composition root. Operations take
/// `&mut self`, so callers serialize them.
#[derive(Debug)]
pub struct Reconciler<G> {
    gateway: G,
    store: SessionStore,
    fingerprint: DeviceFingerprint,
    device: DeviceInfo,
    state: EntitlementState,
    activity: ActivityNotifier,
}

impl<G: RemoteGateway> Reconciler<G> {
    /// Creates a reconciler for the current device.
    pub fn new(gateway: G, store: SessionStore) -> Self {
        let fingerprint = DeviceFingerprint::current().clone();
        let device = DeviceInfo::collect(&fingerprint);
        Self::with_device(gateway, store, fingerprint, device)
    }

    /// Creates a reconciler with the session store described by `config`.
    pub fn from_config(gateway: G, config: &ClientConfig) -> Self {
        let store = SessionStore::open(config.session_path(), config.session_secret.clone());
        Self::new(gateway, store)
    }

    /// Creates a reconciler for an explicit device identity.
    pub fn with_device(
        gateway: G,
        store: SessionStore,
        fingerprint: DeviceFingerprint,
        device: DeviceInfo,
    ) -> Self {
        if !fingerprint.is_stable() {
            warn!("device fingerprint is not stable, saved sessions will not survive a restart");
        }
        Self {
            gateway,
            store,
            fingerprint,
            device,
            state: EntitlementState::default(),
            activity: ActivityNotifier::default(),
        }
    }

    /// Registers an observer for loading notifications.
    pub fn add_observer(&mut self, observer: impl ActivityObserver + 'static) {
        self.activity.subscribe(Arc::new(observer));
    }

    /// Logs in with the combined check: credentials, maintenance, ban,
    /// license, trial and device limit in one request.
    pub fn login(&mut self, email: &str, password: &str, captcha_token: Option<&str>) -> AccessDecision {
        self.tracked(Operation::Login, |this| {
            this.login_inner(email, password, captcha_token)
        })
    }

    /// Silently resumes the saved session.
    ///
    /// Returns [`AccessDecision::NoSession`] without any network call when
    /// there is no saved session or it fails the integrity check; in the
    /// latter case the record is deleted.
    pub fn verify_session(&mut self) -> AccessDecision {
        self.tracked(Operation::VerifySession, Self::verify_session_inner)
    }

    /// Logs out locally and tells the server, if anyone is logged in.
    ///
    /// Local state and the saved session are always cleared, even if the
    /// server cannot be reached.
    pub fn logout(&mut self) -> LogoutOutcome {
        self.tracked(Operation::Logout, Self::logout_inner)
    }

    /// Refreshes the license of the logged-in user. Trial state is untouched.
    ///
    /// # Errors
    ///
    /// Returns [`EntitlementError::NotAuthenticated`] if nobody is logged in,
    /// a transport error, or a rejection.
    pub fn check_license(&mut self) -> EntitlementResult<Option<LicenseState>> {
        self.tracked(Operation::CheckLicense, |this| {
            let user_id = this.require_user()?;
            let mut payload = Map::new();
            payload.insert("user_id".into(), Value::String(user_id));

            let resp = this.gateway.call(actions::CHECK_LICENSE, payload)?;
            let license = response::normalize_license(&resp)?;
            debug!(has_license = license.is_some(), "license refreshed");
            this.state.license.clone_from(&license);
            Ok(license)
        })
    }

    /// Refreshes the trial record of this device. License state is untouched.
    ///
    /// # Errors
    ///
    /// Returns a transport error or a rejection.
    pub fn check_trial(&mut self) -> EntitlementResult<TrialState> {
        self.tracked(Operation::CheckTrial, |this| {
            let mut payload = Map::new();
            payload.insert(
                "device_fingerprint".into(),
                Value::String(this.fingerprint.id().to_string()),
            );

            let resp = this.gateway.call(actions::CHECK_TRIAL, payload)?;
            let trial = response::normalize_trial(&resp)?;
            debug!(phase = ?trial.phase(), "trial refreshed");
            this.state.trial = Some(trial.clone());
            Ok(trial)
        })
    }

    /// Starts the trial of this device for the logged-in user.
    ///
    /// # Errors
    ///
    /// Returns [`EntitlementError::NotAuthenticated`] if nobody is logged in,
    /// a transport error, or a rejection such as `TRIAL_ALREADY_USED`.
    pub fn register_trial(&mut self) -> EntitlementResult<TrialState> {
        self.tracked(Operation::RegisterTrial, |this| {
            let user_id = this.require_user()?;
            let mut payload = Map::new();
            payload.insert("user_id".into(), Value::String(user_id));
            this.device.extend_payload(&mut payload);

            let resp = this.gateway.call(actions::REGISTER_TRIAL, payload)?;
            let trial = response::normalize_trial_registration(&resp)?;
            info!(expires_at = ?trial.expires_at, "trial started");
            this.state.trial = Some(trial.clone());
            Ok(trial)
        })
    }

    /// Fetches the human-verification settings for the login form.
    ///
    /// # Errors
    ///
    /// Returns a transport error or a rejection.
    pub fn captcha_settings(&mut self) -> EntitlementResult<CaptchaSettings> {
        self.tracked(Operation::CaptchaSettings, |this| {
            let resp = this.gateway.call(actions::GET_RECAPTCHA_SETTINGS, Map::new())?;
            response::normalize_captcha_settings(&resp)
        })
    }

    /// Checks credentials only. Nothing is adopted or persisted.
    ///
    /// # Errors
    ///
    /// Returns a transport error or a rejection of the credentials.
    pub fn check_credentials(&mut self, email: &str, password: &str) -> EntitlementResult<UserAccount> {
        self.tracked(Operation::CheckCredentials, |this| {
            let mut payload = Map::new();
            payload.insert("email".into(), Value::String(email.trim().to_string()));
            payload.insert("password".into(), Value::String(password.to_string()));
            this.device.extend_payload(&mut payload);

            let resp = this.gateway.call(actions::LOGIN, payload)?;
            response::normalize_credentials(&resp)
        })
    }

    /// How the user is allowed in right now.
    #[must_use]
    pub fn access_type(&self) -> AccessMode {
        self.state.access_type()
    }

    /// Evaluates the current state: ban, license, trial, trial eligibility.
    #[must_use]
    pub fn validate_access(&self) -> AccessDecision {
        self.validate_access_at(Utc::now())
    }

    /// [`validate_access`](Self::validate_access) at a fixed time.
    #[must_use]
    pub fn validate_access_at(&self, now: DateTime<Utc>) -> AccessDecision {
        decision::evaluate(&self.state, now)
    }

    #[must_use]
    pub fn state(&self) -> &EntitlementState {
        &self.state
    }

    #[must_use]
    pub fn user(&self) -> Option<&UserAccount> {
        self.state.user.as_ref()
    }

    #[must_use]
    pub fn license(&self) -> Option<&LicenseState> {
        self.state.license.as_ref()
    }

    #[must_use]
    pub fn trial(&self) -> Option<&TrialState> {
        self.state.trial.as_ref()
    }

    #[must_use]
    pub fn ban(&self) -> Option<&BanState> {
        self.state.ban.as_ref()
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.state.user.is_some()
    }

    /// License plan, "Trial" for an active trial, else `None`.
    #[must_use]
    pub fn plan_name(&self) -> Option<&str> {
        self.state.plan_name()
    }

    /// Display name, else email, of the logged-in user.
    #[must_use]
    pub fn display_name(&self) -> Option<&str> {
        self.state.user.as_ref().map(UserAccount::display_name)
    }

    #[must_use]
    pub fn fingerprint(&self) -> &DeviceFingerprint {
        &self.fingerprint
    }

    #[must_use]
    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    #[must_use]
    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    #[must_use]
    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    fn tracked<T>(&mut self, op: Operation, f: impl FnOnce(&mut Self) -> T) -> T {
        self.activity.emit(ActivityEvent::Started(op));
        let out = f(self);
        self.activity.emit(ActivityEvent::Finished(op));
        out
    }

    fn login_inner(&mut self, email: &str, password: &str, captcha_token: Option<&str>) -> AccessDecision {
        let mut payload = Map::new();
        payload.insert("email".into(), Value::String(email.trim().to_string()));
        payload.insert("password".into(), Value::String(password.to_string()));
        if let Some(token) = captcha_token.filter(|t| !t.is_empty()) {
            payload.insert("recaptcha_token".into(), Value::String(token.to_string()));
        }
        self.device.extend_payload(&mut payload);

        let resp = match self.gateway.call(actions::FULL_LOGIN_CHECK, payload) {
            Ok(resp) => resp,
            Err(e) => {
                warn!(error = %e, "login request failed");
                return e.into();
            }
        };

        match normalize_auth(&resp) {
            AuthVerdict::Granted(grant) => {
                let decision = self.adopt(grant);
                self.persist();
                decision
            }
            AuthVerdict::Denied(denial) => self.reject(denial),
            AuthVerdict::Unavailable(e) => {
                warn!(error = %e, "login failed on the server");
                e.into()
            }
        }
    }

    fn verify_session_inner(&mut self) -> AccessDecision {
        let Some(user_id) = self.store.session().map(|s| s.user_id.clone()) else {
            debug!("no saved session");
            return AccessDecision::NoSession;
        };

        if !self.store.verify_integrity(self.fingerprint.id()) {
            warn!(user_id = %user_id, "saved session failed integrity check, discarding it");
            self.state.clear();
            self.clear_store();
            return AccessDecision::NoSession;
        }

        let mut payload = Map::new();
        payload.insert("user_id".into(), Value::String(user_id));
        self.device.extend_payload(&mut payload);

        let resp = match self.gateway.call(actions::VERIFY_SESSION, payload) {
            Ok(resp) => resp,
            Err(e) => {
                warn!(error = %e, "session verification failed, keeping saved session");
                return e.into();
            }
        };

        match normalize_auth(&resp) {
            AuthVerdict::Granted(grant) => {
                let evict = grant.should_clear_session;
                let decision = self.adopt(grant);
                if evict {
                    info!("server asked to drop the saved session");
                    self.clear_store();
                } else {
                    self.persist();
                }
                decision
            }
            AuthVerdict::Denied(denial) => {
                let evict = denial.should_clear_session.unwrap_or(true);
                let decision = self.reject(denial);
                if evict {
                    self.clear_store();
                }
                decision
            }
            AuthVerdict::Unavailable(e) => {
                warn!(error = %e, "session verification failed on the server, keeping saved session");
                e.into()
            }
        }
    }

    fn logout_inner(&mut self) -> LogoutOutcome {
        let user_id = self
            .state
            .user
            .as_ref()
            .map(|u| u.id.clone())
            .or_else(|| self.store.session().map(|s| s.user_id.clone()));

        let Some(user_id) = user_id else {
            debug!("logout without a user");
            self.state.clear();
            self.clear_store();
            return LogoutOutcome::AlreadyLoggedOut;
        };

        let mut payload = Map::new();
        payload.insert("user_id".into(), Value::String(user_id.clone()));
        payload.insert(
            "device_id".into(),
            Value::String(self.fingerprint.id().to_string()),
        );
        payload.insert(
            "device_fingerprint".into(),
            Value::String(self.fingerprint.id().to_string()),
        );

        let remote_notified = match self.gateway.call(actions::LOGOUT, payload) {
            Ok(resp) => {
                let acknowledged = resp.body.get("success") == Some(&Value::Bool(true));
                if !acknowledged {
                    warn!("server did not acknowledge logout");
                }
                acknowledged
            }
            Err(e) => {
                warn!(error = %e, "could not notify server of logout");
                false
            }
        };

        self.state.clear();
        self.clear_store();
        info!(user_id = %user_id, "logged out");
        LogoutOutcome::LoggedOut { remote_notified }
    }

    /// Replaces the whole state with what the server granted.
    fn adopt(&mut self, grant: Grant) -> AccessDecision {
        let next = EntitlementState {
            user: Some(grant.user),
            license: grant.license,
            trial: grant.trial,
            ban: None,
        };
        let decision = decision::adopted_grant(&next, Utc::now());
        if let Some(user) = &next.user {
            info!(user_id = %user.id, mode = %next.access_type(), "access granted");
        }
        self.state = next;
        decision
    }

    /// Replaces the whole state after a refusal.
    ///
    /// Only a no-license refusal keeps the echoed user, so a trial can still
    /// be started.
    fn reject(&mut self, denial: Denial) -> AccessDecision {
        let ban = denial.ban();
        let keep_user = matches!(denial.reason, DenialReason::NoLicenseOrTrial { .. });
        let next = EntitlementState {
            user: denial.user.filter(|_| keep_user),
            license: None,
            trial: denial.trial,
            ban,
        };
        info!(reason = denial.reason.code(), "access denied");
        self.state = next;
        AccessDecision::Denied {
            reason: denial.reason,
            message: denial.message,
        }
    }

    fn require_user(&self) -> EntitlementResult<String> {
        self.state
            .user
            .as_ref()
            .map(|u| u.id.clone())
            .ok_or(EntitlementError::NotAuthenticated)
    }

    /// Saves the current state as the session record.
    fn persist(&mut self) {
        let Some(user) = &self.state.user else {
            return;
        };
        let (expires_at, is_trial) = match self.state.access_type() {
            AccessMode::License => self
                .state
                .license
                .as_ref()
                .map(|l| (l.expires_at.clone(), l.is_trial))
                .unwrap_or_default(),
            AccessMode::Trial => (
                self.state.trial.as_ref().and_then(|t| t.expires_at.clone()),
                true,
            ),
            AccessMode::None => (None, false),
        };

        let draft = SessionDraft {
            user_id: user.id.clone(),
            email: user.email.clone(),
            name: user.name.clone(),
            avatar: user.avatar.clone(),
            device_fingerprint: self.fingerprint.id().to_string(),
            plan_name: self.state.plan_name().unwrap_or_default().to_string(),
            expires_at: expires_at.unwrap_or_default(),
            is_trial,
        };
        if let Err(e) = self.store.save(draft) {
            warn!(error = %e, "could not save session, it will not survive a restart");
        }
    }

    fn clear_store(&mut self) {
        if let Err(e) = self.store.clear() {
            warn!(error = %e, "could not delete saved session");
        }
    }
}
