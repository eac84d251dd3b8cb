//! Exit status reported at the end of an execution.

/// Two-valued execution outcome.
///
/// Failure kinds are not distinguished on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    Failure,
}

impl ExitStatus {
    /// Status byte carried in the first position of the frame.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::Failure => 1,
        }
    }

    /// The fixed 4-byte status frame (`[code, 0, 0, 0]`).
    #[must_use]
    pub const fn to_frame(self) -> [u8; 4] {
        [self.code(), 0, 0, 0]
    }

    /// Decode a status frame. Any non-zero first byte is a failure.
    #[must_use]
    pub fn from_frame(frame: &[u8]) -> Option<Self> {
        match frame {
            [0, 0, 0, 0] => Some(Self::Success),
            [_, 0, 0, 0] => Some(Self::Failure),
            _ => None,
        }
    }
}

impl<T, E> From<&Result<T, E>> for ExitStatus {
    fn from(result: &Result<T, E>) -> Self {
        if result.is_ok() {
            Self::Success
        } else {
            Self::Failure
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames() {
        assert_eq!(ExitStatus::Success.to_frame(), [0, 0, 0, 0]);
        assert_eq!(ExitStatus::Failure.to_frame(), [1, 0, 0, 0]);
    }

    #[test]
    fn test_from_result() {
        let ok: Result<(), String> = Ok(());
        let err: Result<(), String> = Err("boom".into());
        assert_eq!(ExitStatus::from(&ok), ExitStatus::Success);
        assert_eq!(ExitStatus::from(&err), ExitStatus::Failure);
    }

    #[test]
    fn test_from_frame_rejects_bad_padding() {
        assert_eq!(ExitStatus::from_frame(&[1, 0, 0, 0]), Some(ExitStatus::Failure));
        assert_eq!(ExitStatus::from_frame(&[0, 1, 0, 0]), None);
        assert_eq!(ExitStatus::from_frame(&[0, 0, 0]), None);
    }
}
