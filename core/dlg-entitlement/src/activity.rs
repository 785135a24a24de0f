//! Loading notifications for the embedding UI.
//!
//! Purely observational: events say which operation started or finished
//! and carry no business data.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Entitlement operations that talk to the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Login,
    CheckCredentials,
    VerifySession,
    Logout,
    CheckLicense,
    CheckTrial,
    RegisterTrial,
    CaptchaSettings,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Login => "login",
            Self::CheckCredentials => "check_credentials",
            Self::VerifySession => "verify_session",
            Self::Logout => "logout",
            Self::CheckLicense => "check_license",
            Self::CheckTrial => "check_trial",
            Self::RegisterTrial => "register_trial",
            Self::CaptchaSettings => "captcha_settings",
        })
    }
}

/// Start/finish of a long-running operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "operation", rename_all = "snake_case")]
pub enum ActivityEvent {
    Started(Operation),
    Finished(Operation),
}

/// Receives activity events.
pub trait ActivityObserver: Send + Sync {
    fn on_activity(&self, event: ActivityEvent);
}

impl<F> ActivityObserver for F
where
    F: Fn(ActivityEvent) + Send + Sync,
{
    fn on_activity(&self, event: ActivityEvent) {
        self(event);
    }
}

/// Fan-out to registered observers.
#[derive(Clone, Default)]
pub(crate) struct ActivityNotifier {
    observers: Vec<Arc<dyn ActivityObserver>>,
}

impl ActivityNotifier {
    pub(crate) fn subscribe(&mut self, observer: Arc<dyn ActivityObserver>) {
        self.observers.push(observer);
    }

    pub(crate) fn emit(&self, event: ActivityEvent) {
        for observer in &self.observers {
            observer.on_activity(event);
        }
    }
}

impl fmt::Debug for ActivityNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityNotifier")
            .field("observers", &self.observers.len())
            .finish()
    }
}
