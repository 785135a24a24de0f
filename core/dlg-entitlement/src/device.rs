//! Device fingerprinting for session and trial binding.
//!
//! The fingerprint is a stable hash of host attributes that survives reboots
//! but changes when the machine is replaced or reinstalled. It binds the
//! persisted session and the per-device trial record to one machine.
//!
//! Reading host attributes never fails as a whole: every attribute is read
//! independently and a missing one degrades to a fallback value.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::env;
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::OnceLock;
use tracing::{debug, warn};

/// Placeholder sent for any device field that could not be resolved.
pub const UNKNOWN: &str = "unknown";

static CURRENT: OnceLock<DeviceFingerprint> = OnceLock::new();

/// Raw host attributes used to derive a fingerprint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostAttributes {
    /// Machine hostname.
    pub hostname: Option<String>,
    /// Platform machine identifier (`/etc/machine-id`, `IOPlatformUUID`, `MachineGuid`).
    pub machine_id: Option<String>,
    /// Processor identifier.
    pub processor: Option<String>,
    /// Operating system name.
    pub os_name: String,
    /// Operating system release.
    pub os_release: Option<String>,
}

impl HostAttributes {
    /// Reads the attributes of the current host.
    #[must_use]
    pub fn collect() -> Self {
        Self {
            hostname: get_hostname(),
            machine_id: get_machine_id(),
            processor: get_processor(),
            os_name: env::consts::OS.to_string(),
            os_release: get_os_release(),
        }
    }

    /// Human-readable OS string, e.g. `linux 6.8`.
    #[must_use]
    pub fn os_label(&self) -> String {
        format!(
            "{} {}",
            self.os_name,
            self.os_release.as_deref().unwrap_or(UNKNOWN)
        )
    }
}

/// A fingerprint that identifies this device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceFingerprint {
    /// Lowercase hex SHA-256 of the host attributes, or a random UUID.
    id: String,
    /// False when the id is the random fallback.
    stable: bool,
}

impl DeviceFingerprint {
    /// Returns the fingerprint of the current device, computed once per process.
    pub fn current() -> &'static Self {
        CURRENT.get_or_init(Self::generate)
    }

    /// Generates a fingerprint for the current device.
    ///
    /// Falls back to a random identifier when the host cannot be identified.
    /// The fallback is not stable across restarts.
    #[must_use]
    pub fn generate() -> Self {
        Self::derive(&HostAttributes::collect()).unwrap_or_else(|| {
            warn!("device attributes unavailable, using a random fingerprint");
            Self::random()
        })
    }

    /// Derives a fingerprint from host attributes.
    ///
    /// Returns `None` when neither the hostname nor the machine id is known,
    /// since the remaining attributes are shared by many machines.
    #[must_use]
    pub fn derive(attrs: &HostAttributes) -> Option<Self> {
        if attrs.hostname.is_none() && attrs.machine_id.is_none() {
            return None;
        }

        let combined = [
            attrs.hostname.as_deref().unwrap_or_default(),
            attrs.machine_id.as_deref().unwrap_or_default(),
            attrs.processor.as_deref().unwrap_or_default(),
            attrs.os_name.as_str(),
            attrs.os_release.as_deref().unwrap_or_default(),
        ]
        .join("|");

        let hash = Sha256::digest(combined.as_bytes());
        Some(Self {
            id: hex::encode(hash),
            stable: true,
        })
    }

    /// A random, unstable fingerprint.
    #[must_use]
    pub fn random() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            stable: false,
        }
    }

    /// Wraps a known fingerprint string, e.g. one read back from storage.
    #[must_use]
    pub fn from_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            stable: true,
        }
    }

    /// Returns the fingerprint ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns false if this is the random fallback.
    #[must_use]
    pub fn is_stable(&self) -> bool {
        self.stable
    }
}

impl fmt::Display for DeviceFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Information about the current device, sent along with auth requests.
///
/// Field names match the remote payload keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device fingerprint.
    pub device_fingerprint: String,
    /// Device name (hostname).
    pub device_name: String,
    /// Operating system name and release.
    pub device_os: String,
    /// Machine identifier as reported to the server.
    pub machine_id: String,
    /// Local IP address.
    pub ip_address: String,
}

impl DeviceInfo {
    /// Collects information about the current device.
    #[must_use]
    pub fn collect(fingerprint: &DeviceFingerprint) -> Self {
        let attrs = HostAttributes::collect();
        let ip = attrs.hostname.as_deref().and_then(resolve_ip);
        DeviceInfoBuilder::new(fingerprint)
            .device_name(attrs.hostname.clone())
            .device_os(Some(attrs.os_label()))
            .machine_id(attrs.hostname.clone())
            .ip_address(ip)
            .build()
    }

    /// Inserts the device fields into a request payload.
    pub fn extend_payload(&self, payload: &mut Map<String, Value>) {
        payload.insert(
            "device_fingerprint".into(),
            Value::String(self.device_fingerprint.clone()),
        );
        payload.insert(
            "device_id".into(),
            Value::String(self.device_fingerprint.clone()),
        );
        payload.insert("device_name".into(), Value::String(self.device_name.clone()));
        payload.insert("device_os".into(), Value::String(self.device_os.clone()));
        payload.insert("machine_id".into(), Value::String(self.machine_id.clone()));
        payload.insert("ip_address".into(), Value::String(self.ip_address.clone()));
    }
}

/// Assembles a [`DeviceInfo`] field by field; unset fields become [`UNKNOWN`].
#[derive(Debug, Clone)]
pub struct DeviceInfoBuilder {
    fingerprint: String,
    device_name: Option<String>,
    device_os: Option<String>,
    machine_id: Option<String>,
    ip_address: Option<String>,
}

impl DeviceInfoBuilder {
    /// Starts a builder for the given fingerprint.
    #[must_use]
    pub fn new(fingerprint: &DeviceFingerprint) -> Self {
        Self {
            fingerprint: fingerprint.id().to_string(),
            device_name: None,
            device_os: None,
            machine_id: None,
            ip_address: None,
        }
    }

    #[must_use]
    pub fn device_name(mut self, value: Option<String>) -> Self {
        self.device_name = value;
        self
    }

    #[must_use]
    pub fn device_os(mut self, value: Option<String>) -> Self {
        self.device_os = value;
        self
    }

    #[must_use]
    pub fn machine_id(mut self, value: Option<String>) -> Self {
        self.machine_id = value;
        self
    }

    #[must_use]
    pub fn ip_address(mut self, value: Option<String>) -> Self {
        self.ip_address = value;
        self
    }

    #[must_use]
    pub fn build(self) -> DeviceInfo {
        let or_unknown = |v: Option<String>| {
            v.filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| UNKNOWN.to_string())
        };
        DeviceInfo {
            device_fingerprint: self.fingerprint,
            device_name: or_unknown(self.device_name),
            device_os: or_unknown(self.device_os),
            machine_id: or_unknown(self.machine_id),
            ip_address: or_unknown(self.ip_address),
        }
    }
}

/// Resolves the hostname to a local address, preferring IPv4.
fn resolve_ip(hostname: &str) -> Option<String> {
    let addrs: Vec<SocketAddr> = match (hostname, 0).to_socket_addrs() {
        Ok(addrs) => addrs.collect(),
        Err(e) => {
            debug!("hostname lookup failed: {e}");
            return None;
        }
    };
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .map(|a| a.ip().to_string())
}

/// Gets the machine hostname.
fn get_hostname() -> Option<String> {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
}

/// Gets the OS release string.
fn get_os_release() -> Option<String> {
    #[cfg(target_os = "macos")]
    {
        std::process::Command::new("sw_vers")
            .arg("-productVersion")
            .output()
            .ok()
            .and_then(|o| String::from_utf8(o.stdout).ok())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    #[cfg(target_os = "windows")]
    {
        env::var("OS").ok()
    }

    #[cfg(target_os = "linux")]
    {
        std::fs::read_to_string("/proc/sys/kernel/osrelease")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows", target_os = "linux")))]
    {
        None
    }
}

/// Gets the processor identifier, falling back to the CPU architecture.
fn get_processor() -> Option<String> {
    #[cfg(target_os = "linux")]
    let model = std::fs::read_to_string("/proc/cpuinfo").ok().and_then(|content| {
        content
            .lines()
            .find(|l| l.starts_with("model name"))
            .and_then(|l| l.split(':').nth(1))
            .map(|s| s.trim().to_string())
    });

    #[cfg(target_os = "macos")]
    let model = std::process::Command::new("sysctl")
        .args(["-n", "machdep.cpu.brand_string"])
        .output()
        .ok()
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| s.trim().to_string());

    #[cfg(target_os = "windows")]
    let model = env::var("PROCESSOR_IDENTIFIER").ok();

    #[cfg(not(any(target_os = "macos", target_os = "windows", target_os = "linux")))]
    let model: Option<String> = None;

    model
        .filter(|s| !s.is_empty())
        .or_else(|| Some(env::consts::ARCH.to_string()))
}

/// Gets the machine ID (platform-specific unique identifier).
fn get_machine_id() -> Option<String> {
    #[cfg(target_os = "macos")]
    {
        std::process::Command::new("ioreg")
            .args(["-rd1", "-c", "IOPlatformExpertDevice"])
            .output()
            .ok()
            .and_then(|o| String::from_utf8(o.stdout).ok())
            .and_then(|output| {
                output
                    .lines()
                    .find(|l| l.contains("IOPlatformUUID"))
                    .and_then(|l| l.split('"').nth(3))
                    .map(String::from)
            })
    }

    #[cfg(target_os = "linux")]
    {
        std::fs::read_to_string("/etc/machine-id")
            .or_else(|_| std::fs::read_to_string("/var/lib/dbus/machine-id"))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    #[cfg(target_os = "windows")]
    {
        std::process::Command::new("reg")
            .args([
                "query",
                r"HKLM\SOFTWARE\Microsoft\Cryptography",
                "/v",
                "MachineGuid",
            ])
            .output()
            .ok()
            .and_then(|o| String::from_utf8(o.stdout).ok())
            .and_then(|output| {
                output
                    .lines()
                    .find(|l| l.contains("MachineGuid"))
                    .and_then(|l| l.split_whitespace().last())
                    .map(String::from)
            })
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows", target_os = "linux")))]
    {
        None
    }
}
