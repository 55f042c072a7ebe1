use crate::flash::FlashError;
use crate::session::DfuStatusCode;

/// Reasons a DFU session leaves the happy path.
///
/// The first three put the session in `dfuERROR` and stall the request. The
/// last two are never reported to the host, they end in a reboot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum DfuError {
    /// Request not allowed in the current state, or malformed.
    ProtocolViolation,
    /// `DFU_DNLOAD` would write past the end of the selected zone.
    RangeOverflow,
    /// Flash primitive failed while serving a request.
    Flash(FlashError),
    /// A flash window did not verify after `MAX_RETRY` attempts.
    VerifyRetryExhausted,
    /// USB reset in the middle of a session.
    BusReset,
}

impl From<FlashError> for DfuError {
    fn from(e: FlashError) -> Self {
        DfuError::Flash(e)
    }
}

impl From<DfuError> for DfuStatusCode {
    fn from(e: DfuError) -> Self {
        match e {
            DfuError::ProtocolViolation
            | DfuError::RangeOverflow
            | DfuError::Flash(_)
            | DfuError::VerifyRetryExhausted => DfuStatusCode::ErrUnknown,
            DfuError::BusReset => DfuStatusCode::ErrUsbr,
        }
    }
}
