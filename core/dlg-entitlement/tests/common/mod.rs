//! Shared test helpers for entitlement tests.

#![allow(dead_code)]

use dlg_entitlement::{
    DeviceFingerprint, DeviceInfo, DeviceInfoBuilder, Reconciler, RemoteGateway, RemoteResponse,
    SessionStore, TransportError,
};
use serde_json::{Map, Value, json};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::path::PathBuf;
use tempfile::TempDir;

pub const SECRET: &str = "test-secret";
pub const FINGERPRINT: &str = "fp-test-device";

/// One recorded gateway call.
#[derive(Debug, Clone)]
pub struct Call {
    pub action: String,
    pub payload: Map<String, Value>,
}

/// In-memory gateway that replays queued results and records every call.
///
/// An empty queue answers with a timeout.
#[derive(Debug, Default)]
pub struct ScriptedGateway {
    replies: RefCell<VecDeque<Result<RemoteResponse, TransportError>>>,
    calls: RefCell<Vec<Call>>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a JSON body.
    pub fn reply(self, body: Value) -> Self {
        self.replies
            .borrow_mut()
            .push_back(Ok(RemoteResponse::from_value(body)));
        self
    }

    /// Queues a JSON body with an HTTP status.
    pub fn reply_with_status(self, status: u16, body: Value) -> Self {
        self.replies
            .borrow_mut()
            .push_back(Ok(RemoteResponse::from_value(body).with_status(status)));
        self
    }

    /// Queues a transport failure.
    pub fn fail(self, error: TransportError) -> Self {
        self.replies.borrow_mut().push_back(Err(error));
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.borrow().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.borrow().len()
    }

    pub fn actions(&self) -> Vec<String> {
        self.calls.borrow().iter().map(|c| c.action.clone()).collect()
    }
}

impl RemoteGateway for ScriptedGateway {
    fn call(
        &self,
        action: &str,
        payload: Map<String, Value>,
    ) -> Result<RemoteResponse, TransportError> {
        self.calls.borrow_mut().push(Call {
            action: action.to_string(),
            payload,
        });
        self.replies
            .borrow_mut()
            .pop_front()
            .unwrap_or(Err(TransportError::Timeout))
    }
}

pub fn fingerprint() -> DeviceFingerprint {
    DeviceFingerprint::from_id(FINGERPRINT)
}

pub fn device_info() -> DeviceInfo {
    DeviceInfoBuilder::new(&fingerprint())
        .device_name(Some("test-host".into()))
        .device_os(Some("linux 6.1".into()))
        .machine_id(Some("test-host".into()))
        .ip_address(Some("10.0.0.2".into()))
        .build()
}

pub fn session_path(dir: &TempDir) -> PathBuf {
    dir.path().join("session.json")
}

pub fn open_store(dir: &TempDir) -> SessionStore {
    SessionStore::open(session_path(dir), SECRET)
}

/// A reconciler on the test device with its session file in `dir`.
pub fn reconciler(dir: &TempDir, gateway: ScriptedGateway) -> Reconciler<ScriptedGateway> {
    Reconciler::with_device(gateway, open_store(dir), fingerprint(), device_info())
}

/// Current-shape grant for a paid plan.
pub fn license_grant() -> Value {
    json!({
        "success": true,
        "access": true,
        "user": {"id": "u1", "email": "a@b.com", "name": "Ana", "avatar": "🙂"},
        "plan_name": "Pro",
        "expires_at": "2030-01-01",
        "is_trial": false,
        "max_devices": 2,
        "features": ["auto_bet"]
    })
}

/// Current-shape grant for a running trial.
pub fn trial_grant() -> Value {
    json!({
        "success": true,
        "access": true,
        "user": {"id": "u1", "email": "a@b.com"},
        "plan_name": "Trial",
        "expires_at": "2030-01-01T12:00:00Z",
        "is_trial": true
    })
}
