//! Channel kinds, request names and the exit-status encoding.

/// The only channel kind the agent serves.
pub const SESSION: &str = "session";

/// Channel request carrying an operation payload.
pub const EXEC: &str = "exec";

/// Channel request reporting the outcome of an `exec`.
pub const EXIT_STATUS: &str = "exit-status";

pub const SHELL: &str = "shell";

pub const SUBSYSTEM: &str = "subsystem";

/// Wire value of an `exit-status` request carrying `frame` as its payload.
///
/// The payload is a `uint32` on the wire, so the frame bytes are read big
/// endian to keep them byte-for-byte intact.
#[must_use]
pub const fn status_word(frame: [u8; 4]) -> u32 {
    u32::from_be_bytes(frame)
}

/// Payload bytes of a received `exit-status` value.
#[must_use]
pub const fn status_frame(word: u32) -> [u8; 4] {
    word.to_be_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_frame_bytes_survive_the_wire() {
        assert_eq!(status_word([0, 0, 0, 0]), 0);
        assert_eq!(status_word([1, 0, 0, 0]), 0x0100_0000);
        assert_eq!(status_frame(status_word([1, 0, 0, 0])), [1, 0, 0, 0]);
    }
}
