//! Device identifier derivation.
//!
//! spec.md §1 names "device-identity derivation from a hardware MAC" as an
//! external collaborator, specified only at its interface (spec.md §6):
//!
//! ```text
//! mmd-rv1-{last6 hex of MAC}-{port suffix}
//! ```
//!
//! This module implements exactly that format function plus a best-effort
//! local MAC lookup for environments that have no device-identity service
//! configured. A configured override ([`Config::device_id_override`]) always
//! wins, matching how the real deployment supplies an authoritative id.

use crate::config::Config;

/// Derive the port suffix used in the device id: the trailing run of ASCII
/// digits in the serial device path (`ttyUSB1` -> `"1"`). Empty if the path
/// has no trailing digits.
pub fn port_suffix(serial_path: &str) -> String {
    serial_path
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<String>()
        .chars()
        .rev()
        .collect()
}

/// Format a device id from a raw 6-byte MAC and a port suffix.
pub fn format_device_id(mac: [u8; 6], suffix: &str) -> String {
    let hex: String = mac[3..6].iter().map(|b| format!("{b:02x}")).collect();
    format!("mmd-rv1-{hex}-{suffix}")
}

/// Resolve the device id for this run: configured override, else derived
/// from the first non-loopback MAC this host reports plus the serial port's
/// suffix, else a fallback using an all-zero MAC (so the pipeline can still
/// run, e.g. under test, without a network interface present).
pub fn resolve_device_id(cfg: &Config, serial_path: &str) -> String {
    if let Some(id) = &cfg.device_id_override {
        return id.clone();
    }
    let mac = local_mac_address().unwrap_or([0u8; 6]);
    format_device_id(mac, &port_suffix(serial_path))
}

/// Best-effort local MAC lookup. On Linux, reads the first non-loopback
/// interface under `/sys/class/net`. Returns `None` on any other platform
/// or if no interface is found — callers treat that as "no hardware MAC
/// available" rather than an error, since device-identity provisioning is
/// out of scope for this core.
#[cfg(target_os = "linux")]
fn local_mac_address() -> Option<[u8; 6]> {
    let entries = std::fs::read_dir("/sys/class/net").ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name == "lo" {
            continue;
        }
        let addr_path = entry.path().join("address");
        if let Ok(raw) = std::fs::read_to_string(&addr_path) {
            if let Some(mac) = parse_mac(raw.trim()) {
                return Some(mac);
            }
        }
    }
    None
}

#[cfg(not(target_os = "linux"))]
fn local_mac_address() -> Option<[u8; 6]> {
    None
}

fn parse_mac(raw: &str) -> Option<[u8; 6]> {
    let mut bytes = [0u8; 6];
    let mut parts = raw.split(':');
    for byte in bytes.iter_mut() {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(bytes)
}
