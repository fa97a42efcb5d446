use core::convert::TryFrom;

/// Numeric result codes reported to a host dispatch layer.
///
/// Codes 0 to 12 follow the flash writer's established error table, so
/// existing host tooling can keep interpreting them. Codes from 13 up
/// cover errors raised by this driver rather than by the device.
#[derive(Copy, Clone, Debug, PartialEq, Eq,
         num_enum::IntoPrimitive, num_enum::TryFromPrimitive)]
#[repr(u8)]
pub enum ResultCode {
    Ready = 0,
    NotSupported = 1,
    Timeout = 6,
    SequenceError = 7,
    EraseError = 8,
    BlockEraseError = 9,
    ProgramError = 10,
    LockError = 11,
    VoltageError = 12,
    Access = 13,
    InvalidAddress = 14,
    InvalidParams = 15,
    Readback = 16,
}

impl ResultCode {
    /// Parse a raw code, returning `None` if it is not recognised.
    pub fn from_raw(code: u8) -> Option<Self> {
        ResultCode::try_from(code).ok()
    }

    pub fn message(&self) -> &'static str {
        match self {
            ResultCode::Ready => "",
            ResultCode::NotSupported => "Target does not support requested operation.",
            ResultCode::Timeout => "Flash timeout error.",
            ResultCode::SequenceError => "The flash command sequence was incorrect.",
            ResultCode::EraseError => "The flash erase operation failed.",
            ResultCode::BlockEraseError => "The flash block erase operation failed.",
            ResultCode::ProgramError => "The flash programming operation failed.",
            ResultCode::LockError => "The flash operation ran into a lock error.",
            ResultCode::VoltageError => "The flash part ran into a voltage error.",
            ResultCode::Access => "Flash bus access failed.",
            ResultCode::InvalidAddress => "Address out of range for the flash device.",
            ResultCode::InvalidParams => "Invalid flash device parameters.",
            ResultCode::Readback => "Mismatch during flash readback verification.",
        }
    }
}

#[test]
fn test_result_code_values() {
    assert_eq!(u8::from(ResultCode::Ready), 0);
    assert_eq!(u8::from(ResultCode::SequenceError), 7);
    assert_eq!(u8::from(ResultCode::EraseError), 8);
    assert_eq!(u8::from(ResultCode::ProgramError), 10);
    assert_eq!(u8::from(ResultCode::LockError), 11);
    assert_eq!(ResultCode::from_raw(6), Some(ResultCode::Timeout));
    assert_eq!(ResultCode::from_raw(2), None);
    assert_eq!(ResultCode::from_raw(0xFF), None);
}
