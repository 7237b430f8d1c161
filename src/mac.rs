//! MAC address handling.
//!
//! The daemon keys everything on the canonical 17-character upper-case
//! colon-separated form ("38:39:8F:82:18:7E"). BlueZ encodes the same
//! address into object paths as a `dev_38_39_8F_82_18_7E` segment.

/// Canonicalize a MAC address string.
///
/// Accepts upper or lower case hex with `:` or `-` separators and
/// returns the upper-case colon-separated form, or `None` if the input
/// is not a well-formed 48-bit address.
pub fn normalize(input: &str) -> Option<String> {
    let raw = input.trim();
    if raw.len() != 17 {
        return None;
    }

    let mut out = String::with_capacity(17);
    for (i, c) in raw.chars().enumerate() {
        if i % 3 == 2 {
            if c != ':' && c != '-' {
                return None;
            }
            out.push(':');
        } else {
            if !c.is_ascii_hexdigit() {
                return None;
            }
            out.push(c.to_ascii_uppercase());
        }
    }
    Some(out)
}

/// Extract the MAC address from a BlueZ object path.
///
/// Locates the `dev_` marker and converts the trailing underscore-separated
/// segment, so both device paths and their GATT children resolve to the
/// owning device:
///
/// `/org/bluez/hci0/dev_38_39_8F_82_18_7E/service0021/char0025`
/// → `38:39:8F:82:18:7E`
pub fn from_object_path(path: &str) -> Option<String> {
    let start = path.rfind("dev_")? + 4;
    let tail = &path[start..];
    let segment = tail.split('/').next()?;
    normalize(&segment.replace('_', ":"))
}

/// Render a MAC as the `dev_`-style path segment BlueZ uses.
pub fn to_path_segment(mac: &str) -> String {
    format!("dev_{}", mac.replace(':', "_"))
}
