//! Entitlement engine for DLG Connect.
//!
//! This crate decides whether the desktop client may run:
//! - Login and silent session resumption against the remote authority
//! - License and trial refreshes, trial registration
//! - Hardware fingerprinting for device binding
//! - A signed local session record for restarts
//!
//! # Design Principles
//!
//! - **Remote authority**: maintenance, bans, licenses, trials and device
//!   limits are decided by the server; the client only interprets answers
//! - **Fail closed**: access needs `success` and `access` to both be `true`
//! - **One normalization boundary**: raw JSON is read only in [`response`]
//! - **Transport is not denial**: a failed call never evicts a saved session
//!
//! # Session Record
//!
//! The record is bound to the device fingerprint and carries
//! `sha256(user_id:email:device_fingerprint:secret)`; it is replaced
//! atomically on every successful login or verification.

pub mod activity;
pub mod config;
pub mod decision;
pub mod device;
pub mod entitlement;
pub mod error;
pub mod gateway;
pub mod reconciler;
pub mod response;
pub mod session;

pub use activity::{ActivityEvent, ActivityObserver, Operation};
pub use config::ClientConfig;
pub use decision::{AccessDecision, DenialReason, evaluate};
pub use device::{DeviceFingerprint, DeviceInfo, DeviceInfoBuilder, HostAttributes};
pub use entitlement::{
    AccessMode, ActiveDevice, BanState, EntitlementState, LicenseState, TrialPhase, TrialState,
    UserAccount,
};
pub use error::{EntitlementError, EntitlementResult, TransportError};
pub use gateway::{RemoteGateway, RemoteResponse};
pub use reconciler::{LogoutOutcome, Reconciler};
pub use response::{AuthVerdict, CaptchaSettings};
pub use session::{PersistedSession, SessionDraft, SessionStore};

#[cfg(feature = "online")]
pub use gateway::HttpGateway;
