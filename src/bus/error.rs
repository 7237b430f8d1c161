//! Bus call error taxonomy.
//!
//! Every remote failure is folded into a [`BusError`] carrying the
//! classified [`BusErrorKind`], the remote error name when one was
//! reported, and a human-readable message. The kind drives retry
//! policy in the lifecycle operations.

use thiserror::Error;

/// Classified failure modes of a bus method call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusErrorKind {
    /// The call did not return within its budget. Retry per policy.
    Timeout,
    /// The remote object already has this operation in flight.
    InProgress,
    /// The object path is no longer valid; the device is gone.
    UnknownObject,
    /// The adapter or device is not ready for the operation.
    NotReady,
    /// The operation was rejected by the stack's policy.
    NotAuthorized,
    /// Anything else; logged with the remote name and message.
    Generic,
}

/// A failed bus operation.
#[derive(Debug, Clone, Error)]
#[error("bus call failed ({kind:?}) [{}]: {message}", .name.as_deref().unwrap_or("local"))]
pub struct BusError {
    kind: BusErrorKind,
    name: Option<String>,
    message: String,
}

impl BusError {
    pub fn kind(&self) -> BusErrorKind {
        self.kind
    }

    /// The remote D-Bus error name, when the failure came from the peer.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == BusErrorKind::Timeout
    }

    /// A call that outlived its local deadline.
    pub fn timeout(context: &str) -> Self {
        Self {
            kind: BusErrorKind::Timeout,
            name: None,
            message: format!("{context}: no reply within budget"),
        }
    }

    /// A local failure with no remote error name.
    pub fn other(message: impl Into<String>) -> Self {
        Self {
            kind: BusErrorKind::Generic,
            name: None,
            message: message.into(),
        }
    }

    /// Classify a remote error name into a [`BusErrorKind`].
    ///
    /// Names come from two vocabularies: the daemon's own
    /// `org.freedesktop.DBus.Error.*` and BlueZ's `org.bluez.Error.*`.
    pub fn classify(name: &str) -> BusErrorKind {
        match name {
            "org.freedesktop.DBus.Error.NoReply"
            | "org.freedesktop.DBus.Error.Timeout"
            | "org.freedesktop.DBus.Error.TimedOut" => BusErrorKind::Timeout,
            "org.freedesktop.DBus.Error.UnknownObject"
            | "org.freedesktop.DBus.Error.UnknownMethod"
            | "org.bluez.Error.DoesNotExist" => BusErrorKind::UnknownObject,
            "org.bluez.Error.InProgress" => BusErrorKind::InProgress,
            "org.bluez.Error.NotReady" => BusErrorKind::NotReady,
            "org.bluez.Error.NotAuthorized"
            | "org.bluez.Error.AuthenticationRejected" => BusErrorKind::NotAuthorized,
            _ => BusErrorKind::Generic,
        }
    }
}

impl From<zbus::Error> for BusError {
    fn from(err: zbus::Error) -> Self {
        match &err {
            zbus::Error::MethodError(name, detail, _) => Self {
                kind: Self::classify(name.as_str()),
                name: Some(name.to_string()),
                message: detail.clone().unwrap_or_else(|| "method call failed".into()),
            },
            zbus::Error::FDO(fdo) => {
                let text = fdo.to_string();
                Self {
                    kind: Self::classify(&fdo_error_name(fdo)),
                    name: Some(fdo_error_name(fdo)),
                    message: text,
                }
            }
            other => Self {
                kind: BusErrorKind::Generic,
                name: None,
                message: other.to_string(),
            },
        }
    }
}

fn fdo_error_name(err: &zbus::fdo::Error) -> String {
    use zbus::fdo::Error as Fdo;
    let suffix = match err {
        Fdo::UnknownObject(_) => "UnknownObject",
        Fdo::UnknownMethod(_) => "UnknownMethod",
        Fdo::NoReply(_) => "NoReply",
        Fdo::Timeout(_) => "Timeout",
        Fdo::TimedOut(_) => "TimedOut",
        Fdo::AccessDenied(_) => "AccessDenied",
        Fdo::ServiceUnknown(_) => "ServiceUnknown",
        _ => "Failed",
    };
    format!("org.freedesktop.DBus.Error.{suffix}")
}
