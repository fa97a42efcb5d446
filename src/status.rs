use crate::params::BusLayout;
use crate::{Error, Result};

/// Native status register bits for a single part.
#[derive(Copy, Clone, Debug, num_enum::IntoPrimitive)]
#[repr(u8)]
pub enum StatusBit {
    /// SR7: write state machine ready.
    Ready = 0x80,
    /// SR6: erase suspended.
    EraseSuspend = 0x40,
    /// SR5: erase or clear-lock-bits error.
    EraseError = 0x20,
    /// SR4: program or set-lock-bit error.
    ProgramError = 0x10,
    /// SR3: programming voltage out of range.
    VoltageError = 0x08,
    /// SR2: program suspended.
    ProgramSuspend = 0x04,
    /// SR1: operation attempted on a locked block.
    LockbitError = 0x02,
}

/// Status bit masks replicated across every part on the bus.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StatusMasks {
    pub ready: u32,
    pub erase_suspend: u32,
    pub erase_error: u32,
    pub program_error: u32,
    pub voltage_error: u32,
    pub program_suspend: u32,
    pub lockbit_error: u32,
}

impl StatusMasks {
    pub fn new(layout: &BusLayout) -> Self {
        let masks = StatusMasks {
            ready: layout.form_mask(StatusBit::Ready.into()),
            erase_suspend: layout.form_mask(StatusBit::EraseSuspend.into()),
            erase_error: layout.form_mask(StatusBit::EraseError.into()),
            program_error: layout.form_mask(StatusBit::ProgramError.into()),
            voltage_error: layout.form_mask(StatusBit::VoltageError.into()),
            program_suspend: layout.form_mask(StatusBit::ProgramSuspend.into()),
            lockbit_error: layout.form_mask(StatusBit::LockbitError.into()),
        };
        log::trace!("Status masks for {:?}: {:X?}", layout, masks);
        masks
    }

    /// Classify a status word.
    ///
    /// Erase and program error together indicate an invalid command
    /// sequence, so that combination is checked before either bit alone.
    /// A voltage error (SR3) is reported as a program error, while a
    /// program suspend (SR2) after completion is reported as a voltage
    /// error. Erase suspend does not affect the result.
    pub fn decode(&self, status: StatusWord) -> DeviceStatus {
        if status.has(self.erase_error) {
            if status.has(self.program_error) {
                DeviceStatus::SequenceError
            } else {
                DeviceStatus::EraseError
            }
        } else if status.has(self.program_error) || status.has(self.voltage_error) {
            DeviceStatus::ProgramError
        } else if status.has(self.program_suspend) {
            DeviceStatus::VoltageError
        } else if status.has(self.lockbit_error) {
            DeviceStatus::LockError
        } else {
            DeviceStatus::Ready
        }
    }
}

/// Raw status register contents, as wide as the bus.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StatusWord(pub u32);

impl StatusWord {
    /// True if every bit of `mask` is set, i.e. every part reports the flag.
    pub fn has(&self, mask: u32) -> bool {
        self.0 & mask == mask
    }

    pub fn is_ready(&self, masks: &StatusMasks) -> bool {
        self.has(masks.ready)
    }

    pub fn erase_suspended(&self, masks: &StatusMasks) -> bool {
        self.has(masks.erase_suspend)
    }

    pub fn program_suspended(&self, masks: &StatusMasks) -> bool {
        self.has(masks.program_suspend)
    }
}

/// Outcome of an operation as reported by the status register.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeviceStatus {
    Ready,
    SequenceError,
    EraseError,
    ProgramError,
    VoltageError,
    LockError,
}

impl DeviceStatus {
    pub fn into_result(self) -> Result<()> {
        match self {
            DeviceStatus::Ready => Ok(()),
            DeviceStatus::SequenceError => Err(Error::SequenceError),
            DeviceStatus::EraseError => Err(Error::EraseError),
            DeviceStatus::ProgramError => Err(Error::ProgramError),
            DeviceStatus::VoltageError => Err(Error::VoltageError),
            DeviceStatus::LockError => Err(Error::LockError),
        }
    }
}

#[cfg(test)]
fn x16_masks() -> StatusMasks {
    StatusMasks::new(&BusLayout::new(crate::params::PartWidth::X16, 1))
}

#[test]
fn test_decode_single_bits() {
    let masks = x16_masks();
    assert_eq!(masks.decode(StatusWord(0x80)), DeviceStatus::Ready);
    assert_eq!(masks.decode(StatusWord(0xA0)), DeviceStatus::EraseError);
    assert_eq!(masks.decode(StatusWord(0x90)), DeviceStatus::ProgramError);
    assert_eq!(masks.decode(StatusWord(0x88)), DeviceStatus::ProgramError);
    assert_eq!(masks.decode(StatusWord(0x82)), DeviceStatus::LockError);
    assert_eq!(masks.decode(StatusWord(0xB0)), DeviceStatus::SequenceError);
}

#[test]
fn test_decode_program_suspend() {
    let masks = x16_masks();
    assert_eq!(masks.decode(StatusWord(0x84)), DeviceStatus::VoltageError);
    // Program suspend is checked before the lock bit.
    assert_eq!(masks.decode(StatusWord(0x86)), DeviceStatus::VoltageError);
    // Program and voltage errors take precedence over it.
    assert_eq!(masks.decode(StatusWord(0x8C)), DeviceStatus::ProgramError);
    assert_eq!(masks.decode(StatusWord(0x94)), DeviceStatus::ProgramError);
    // Erase suspend alone has no effect.
    assert_eq!(masks.decode(StatusWord(0xC0)), DeviceStatus::Ready);
    assert!(StatusWord(0x84).program_suspended(&masks));
    assert!(StatusWord(0xC0).erase_suspended(&masks));
}

#[test]
fn test_decode_sequence_iff_erase_and_program() {
    let masks = x16_masks();
    for word in 0..=0xFFu32 {
        let status = StatusWord(word);
        let both = status.has(masks.erase_error) && status.has(masks.program_error);
        assert_eq!(masks.decode(status) == DeviceStatus::SequenceError, both, "status {:02X}", word);
    }
}

#[test]
fn test_decode_erase_beats_lock() {
    let masks = x16_masks();
    assert_eq!(masks.decode(StatusWord(0xA2)), DeviceStatus::EraseError);
    assert_eq!(masks.decode(StatusWord(0x9A)), DeviceStatus::ProgramError);
}

#[test]
fn test_decode_interleaved_requires_all_parts() {
    let masks = StatusMasks::new(&BusLayout::new(crate::params::PartWidth::X8, 2));
    assert_eq!(masks.ready, 0x8080);
    // Only one of the two parts reports an erase error.
    assert_eq!(masks.decode(StatusWord(0x80A0)), DeviceStatus::Ready);
    assert_eq!(masks.decode(StatusWord(0xA0A0)), DeviceStatus::EraseError);
    assert!(!StatusWord(0x0080).is_ready(&masks));
    assert!(StatusWord(0x8080).is_ready(&masks));
}

#[test]
fn test_into_result() {
    assert!(DeviceStatus::Ready.into_result().is_ok());
    assert!(matches!(DeviceStatus::LockError.into_result(), Err(Error::LockError)));
    assert!(matches!(DeviceStatus::SequenceError.into_result(), Err(Error::SequenceError)));
    let err = DeviceStatus::VoltageError.into_result().unwrap_err();
    assert!(matches!(err, Error::VoltageError));
    assert_eq!(u8::from(err.code()), 12);
}
