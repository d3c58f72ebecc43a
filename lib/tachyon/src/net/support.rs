use std::fmt;
use std::io;

pub type NetResult<T> = Result<T, NetError>;

/// Highest code of the handshake failure range in the security domain.
pub const TLS_HANDSHAKE_CODE_MAX: i64 = -9800;
/// Lowest code of the handshake failure range in the security domain.
pub const TLS_HANDSHAKE_CODE_MIN: i64 = -9818;

/// Representative security domain codes attached to faults raised by the
/// TLS layer.
pub mod security_code {
    pub const PROTOCOL_FAILURE: i64 = -9800;
    pub const NEGOTIATION_FAILURE: i64 = -9801;
    pub const FATAL_ALERT: i64 = -9802;
    pub const CHAIN_INVALID: i64 = -9807;
    pub const UNKNOWN_ROOT: i64 = -9812;
    pub const CERT_EXPIRED: i64 = -9814;
}

/// Engine domain code for a stream pair that could not be created or
/// configured.
pub const SETUP_FAILED: i64 = 1;

#[derive(Debug, Eq, PartialEq)]
pub enum NetError {
    /// The operation could not make progress and should be retried on the
    /// next readiness event.
    Wait,
    Fatal(Fault),
}

/// Domain the originating transport error belongs to.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Domain {
    /// OS socket layer.
    Posix,
    /// TLS layer.
    Security,
    /// The engine itself.
    Engine,
}

/// Normalized transport error. The originating domain and numeric code are
/// retained so upstream consumers can inspect the untranslated failure.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Fault {
    pub domain: Domain,
    pub code: i64,
    pub message: String,
}

impl Fault {
    #[inline]
    pub fn posix(error: &io::Error) -> Fault {
        Fault {
            domain: Domain::Posix,
            code: error.raw_os_error().map(i64::from).unwrap_or(0),
            message: error.to_string(),
        }
    }

    #[inline]
    pub fn security(code: i64, message: impl Into<String>) -> Fault {
        Fault {
            domain: Domain::Security,
            code,
            message: message.into(),
        }
    }

    #[inline]
    pub fn setup(message: impl Into<String>) -> Fault {
        Fault {
            domain: Domain::Engine,
            code: SETUP_FAILED,
            message: message.into(),
        }
    }

    /// True when the fault sits in the TLS handshake failure range of the
    /// security domain. These faults are candidates for the security level
    /// fallback instead of delegate notification.
    #[inline]
    pub fn is_tls_handshake(&self) -> bool {
        self.domain == Domain::Security
            && self.code >= TLS_HANDSHAKE_CODE_MIN
            && self.code <= TLS_HANDSHAKE_CODE_MAX
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}({}): {}", self.domain, self.code, self.message)
    }
}

impl From<io::Error> for NetError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => NetError::Wait,
            _ => NetError::Fatal(Fault::posix(&io_error)),
        }
    }
}

impl From<Fault> for NetError {
    #[inline]
    fn from(fault: Fault) -> Self {
        NetError::Fatal(fault)
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(NetError::Wait) => false,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_would_block_maps_to_wait() {
        let error: NetError = io::Error::from(io::ErrorKind::WouldBlock).into();

        assert_eq!(error, NetError::Wait);
        assert!(!Err::<(), _>(error).has_failed());
    }

    #[test]
    fn test_io_error_maps_to_posix_fault() {
        let error: NetError = io::Error::from_raw_os_error(104).into();

        match error {
            NetError::Fatal(fault) => {
                assert_eq!(fault.domain, Domain::Posix);
                assert_eq!(fault.code, 104);
            }
            other => panic!("Unexpected mapping {:?}", other),
        }
    }

    #[test]
    fn test_tls_handshake_range() {
        assert!(Fault::security(security_code::CHAIN_INVALID, "chain").is_tls_handshake());
        assert!(Fault::security(TLS_HANDSHAKE_CODE_MIN, "floor").is_tls_handshake());
        assert!(Fault::security(TLS_HANDSHAKE_CODE_MAX, "ceiling").is_tls_handshake());
        assert!(!Fault::security(-9819, "below range").is_tls_handshake());
        assert!(!Fault::security(-9799, "above range").is_tls_handshake());
        assert!(!Fault::posix(&io::Error::from_raw_os_error(-9807_i32)).is_tls_handshake());
    }

    #[test]
    fn test_setup_fault() {
        let fault = Fault::setup("no origin");

        assert_eq!(fault.domain, Domain::Engine);
        assert_eq!(fault.code, SETUP_FAILED);
        assert!(!fault.is_tls_handshake());
    }
}
