//! Mapping from libusb errors to the shared error taxonomy

use common::Error;
use std::time::Duration;

/// Map a rusb error to [`common::Error`]
///
/// rusb reports timeouts without the elapsed time; `timeout` is the value the
/// transfer was submitted with.
pub fn map_rusb_error(err: rusb::Error, timeout: Duration) -> Error {
    match err {
        rusb::Error::NoDevice => Error::NoDevice,
        rusb::Error::NotFound => Error::NotFound(err.to_string()),
        rusb::Error::InvalidParam => Error::InvalidParameter(err.to_string()),
        rusb::Error::NoMem => Error::ResourceExhausted(err.to_string()),
        rusb::Error::Timeout => Error::Timeout(timeout),
        _ => Error::HardwareFailure(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_rusb_error() {
        let t = Duration::from_millis(250);
        assert!(matches!(map_rusb_error(rusb::Error::NoDevice, t), Error::NoDevice));
        assert!(matches!(
            map_rusb_error(rusb::Error::NotFound, t),
            Error::NotFound(_)
        ));
        assert!(matches!(
            map_rusb_error(rusb::Error::InvalidParam, t),
            Error::InvalidParameter(_)
        ));
        assert!(matches!(
            map_rusb_error(rusb::Error::NoMem, t),
            Error::ResourceExhausted(_)
        ));
        assert!(matches!(
            map_rusb_error(rusb::Error::Timeout, t),
            Error::Timeout(d) if d == t
        ));
        assert!(matches!(
            map_rusb_error(rusb::Error::Pipe, t),
            Error::HardwareFailure(_)
        ));
        assert!(matches!(
            map_rusb_error(rusb::Error::Busy, t),
            Error::HardwareFailure(_)
        ));
    }
}
