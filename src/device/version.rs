use semver::Version;

use crate::serial::token::{is_busy_response, is_cart_response};

fn minimum_version(minimal: bool) -> Version {
    if minimal {
        Version::new(0, 0, 2)
    } else {
        Version::new(0, 6, 6)
    }
}

/// What a handshake response says about the firmware behind a port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionCheck {
    pub is_cart: bool,
    pub busy: bool,
    pub minimal: bool,
    pub version: Option<Version>,
    pub is_compatible: bool,
}

/// First `N.N.N` run in `text`.
fn find_version(text: &str) -> Option<Version> {
    let bytes = text.as_bytes();
    let mut start = 0;
    while start < bytes.len() {
        if !bytes[start].is_ascii_digit() {
            start += 1;
            continue;
        }
        let end = text[start..]
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .map(|offset| start + offset)
            .unwrap_or(text.len());
        let candidate = &text[start..end];
        let parts: Vec<&str> = candidate.split('.').take(3).collect();
        if parts.len() == 3 && parts.iter().all(|part| !part.is_empty()) {
            if let Ok(version) = Version::parse(&parts.join(".")) {
                return Some(version);
            }
        }
        start = end;
    }
    None
}

/// A busy cart is reported present, but its version is not trusted.
pub fn check_version(response: &str) -> VersionCheck {
    let busy = is_busy_response(response);
    let minimal = response.to_ascii_lowercase().contains("minimal");
    let version = if busy { None } else { find_version(response) };
    let minimum = minimum_version(minimal);
    let is_compatible = version.as_ref().map(|v| *v >= minimum).unwrap_or(false);

    VersionCheck {
        is_cart: is_cart_response(response),
        busy,
        minimal,
        version,
        is_compatible,
    }
}
