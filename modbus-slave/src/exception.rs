use thiserror::Error;

/// Reason a slave refuses a request, sent back as a protocol exception response.
///
/// A handler reports success by returning `Ok(payload)`; any variant of this enum
/// replaces the payload with the single exception code byte.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Error)]
#[repr(u8)]
pub enum Exception {
    #[error("illegal function")]
    IllegalFunction = 0x01,
    #[error("illegal data address")]
    IllegalDataAddress = 0x02,
    #[error("illegal data value")]
    IllegalDataValue = 0x03,
    #[error("slave device failure")]
    SlaveDeviceFailure = 0x04,
    #[error("acknowledge")]
    Acknowledge = 0x05,
    #[error("slave device busy")]
    SlaveDeviceBusy = 0x06,
    #[error("negative acknowledge")]
    NegativeAcknowledge = 0x07,
    #[error("memory parity error")]
    MemoryParityError = 0x08,
    #[error("gateway path unavailable")]
    GatewayPathUnavailable = 0x0A,
    #[error("gateway target device failed to respond")]
    GatewayTargetDeviceFailedToRespond = 0x0B,
}

impl Exception {
    /// Exception code byte as it appears on the wire.
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Exception {
    type Error = u8;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        let exception = match code {
            0x01 => Exception::IllegalFunction,
            0x02 => Exception::IllegalDataAddress,
            0x03 => Exception::IllegalDataValue,
            0x04 => Exception::SlaveDeviceFailure,
            0x05 => Exception::Acknowledge,
            0x06 => Exception::SlaveDeviceBusy,
            0x07 => Exception::NegativeAcknowledge,
            0x08 => Exception::MemoryParityError,
            0x0A => Exception::GatewayPathUnavailable,
            0x0B => Exception::GatewayTargetDeviceFailedToRespond,
            other => return Err(other),
        };
        Ok(exception)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_round_trip() {
        for code in 0u8..=0x0F {
            match Exception::try_from(code) {
                Ok(exception) => assert_eq!(exception.code(), code),
                Err(rejected) => assert!(matches!(rejected, 0x00 | 0x09 | 0x0C..=0x0F)),
            }
        }
    }
}
