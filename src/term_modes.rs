//! Application of SSH pty-req terminal modes to a pseudo-terminal.
//!
//! The SSH library decodes the wire modelist (stopping at `TTY_OP_END` and
//! at reserved opcodes >= 160) into `(Pty, u32)` pairs; this module is the
//! opcode -> termios setter table. Opcodes the platform does not model are
//! skipped, never fatal.

use nix::sys::termios::{
    cfsetispeed, cfsetospeed, tcgetattr, tcsetattr, BaudRate, ControlFlags, InputFlags,
    LocalFlags, OutputFlags, SetArg, SpecialCharacterIndices, Termios,
};
use russh::Pty;
use std::os::fd::BorrowedFd;
use tracing::debug;

/// Read the terminal attributes of `fd`, apply every mode in `modes`, and
/// write the result back.
pub fn set_terminal_attributes(fd: BorrowedFd<'_>, modes: &[(Pty, u32)]) -> nix::Result<()> {
    let mut termios = tcgetattr(fd)?;
    for (opcode, value) in modes {
        apply_mode(&mut termios, *opcode, *value);
    }
    tcsetattr(fd, SetArg::TCSANOW, &termios)
}

/// Apply a single terminal mode to a termios struct.
pub fn apply_mode(termios: &mut Termios, opcode: Pty, value: u32) {
    match opcode {
        Pty::VINTR => set_cc(termios, SpecialCharacterIndices::VINTR, value),
        Pty::VQUIT => set_cc(termios, SpecialCharacterIndices::VQUIT, value),
        Pty::VERASE => set_cc(termios, SpecialCharacterIndices::VERASE, value),
        Pty::VKILL => set_cc(termios, SpecialCharacterIndices::VKILL, value),
        Pty::VEOF => set_cc(termios, SpecialCharacterIndices::VEOF, value),
        Pty::VEOL => set_cc(termios, SpecialCharacterIndices::VEOL, value),
        Pty::VEOL2 => set_cc(termios, SpecialCharacterIndices::VEOL2, value),
        Pty::VSTART => set_cc(termios, SpecialCharacterIndices::VSTART, value),
        Pty::VSTOP => set_cc(termios, SpecialCharacterIndices::VSTOP, value),
        Pty::VSUSP => set_cc(termios, SpecialCharacterIndices::VSUSP, value),
        Pty::VREPRINT => set_cc(termios, SpecialCharacterIndices::VREPRINT, value),
        Pty::VWERASE => set_cc(termios, SpecialCharacterIndices::VWERASE, value),
        Pty::VLNEXT => set_cc(termios, SpecialCharacterIndices::VLNEXT, value),
        Pty::VDISCARD => set_cc(termios, SpecialCharacterIndices::VDISCARD, value),

        Pty::IGNPAR => set_input(termios, InputFlags::IGNPAR, value),
        Pty::PARMRK => set_input(termios, InputFlags::PARMRK, value),
        Pty::INPCK => set_input(termios, InputFlags::INPCK, value),
        Pty::ISTRIP => set_input(termios, InputFlags::ISTRIP, value),
        Pty::INLCR => set_input(termios, InputFlags::INLCR, value),
        Pty::IGNCR => set_input(termios, InputFlags::IGNCR, value),
        Pty::ICRNL => set_input(termios, InputFlags::ICRNL, value),
        Pty::IXON => set_input(termios, InputFlags::IXON, value),
        Pty::IXANY => set_input(termios, InputFlags::IXANY, value),
        Pty::IXOFF => set_input(termios, InputFlags::IXOFF, value),
        Pty::IMAXBEL => set_input(termios, InputFlags::IMAXBEL, value),

        Pty::ISIG => set_local(termios, LocalFlags::ISIG, value),
        Pty::ICANON => set_local(termios, LocalFlags::ICANON, value),
        Pty::ECHO => set_local(termios, LocalFlags::ECHO, value),
        Pty::ECHOE => set_local(termios, LocalFlags::ECHOE, value),
        Pty::ECHOK => set_local(termios, LocalFlags::ECHOK, value),
        Pty::ECHONL => set_local(termios, LocalFlags::ECHONL, value),
        Pty::NOFLSH => set_local(termios, LocalFlags::NOFLSH, value),
        Pty::TOSTOP => set_local(termios, LocalFlags::TOSTOP, value),
        Pty::IEXTEN => set_local(termios, LocalFlags::IEXTEN, value),
        Pty::ECHOCTL => set_local(termios, LocalFlags::ECHOCTL, value),
        Pty::ECHOKE => set_local(termios, LocalFlags::ECHOKE, value),
        Pty::PENDIN => set_local(termios, LocalFlags::PENDIN, value),

        Pty::OPOST => set_output(termios, OutputFlags::OPOST, value),
        Pty::ONLCR => set_output(termios, OutputFlags::ONLCR, value),
        Pty::OCRNL => set_output(termios, OutputFlags::OCRNL, value),
        Pty::ONOCR => set_output(termios, OutputFlags::ONOCR, value),
        Pty::ONLRET => set_output(termios, OutputFlags::ONLRET, value),

        Pty::PARENB => set_control(termios, ControlFlags::PARENB, value),
        Pty::PARODD => set_control(termios, ControlFlags::PARODD, value),
        Pty::CS7 => set_char_size(termios, ControlFlags::CS7, value),
        Pty::CS8 => set_char_size(termios, ControlFlags::CS8, value),

        Pty::TTY_OP_ISPEED => {
            if let Some(speed) = baud_rate(value) {
                let _ = cfsetispeed(termios, speed);
            } else {
                debug!(value = value, "unsupported input speed, skipping");
            }
        }
        Pty::TTY_OP_OSPEED => {
            if let Some(speed) = baud_rate(value) {
                let _ = cfsetospeed(termios, speed);
            } else {
                debug!(value = value, "unsupported output speed, skipping");
            }
        }

        other => {
            debug!(opcode = ?other, value = value, "unsupported terminal mode, skipping");
        }
    }
}

fn set_cc(termios: &mut Termios, index: SpecialCharacterIndices, value: u32) {
    termios.control_chars[index as usize] = value as u8;
}

fn set_input(termios: &mut Termios, flag: InputFlags, value: u32) {
    termios.input_flags.set(flag, value != 0);
}

fn set_output(termios: &mut Termios, flag: OutputFlags, value: u32) {
    termios.output_flags.set(flag, value != 0);
}

fn set_local(termios: &mut Termios, flag: LocalFlags, value: u32) {
    termios.local_flags.set(flag, value != 0);
}

fn set_control(termios: &mut Termios, flag: ControlFlags, value: u32) {
    termios.control_flags.set(flag, value != 0);
}

fn set_char_size(termios: &mut Termios, size: ControlFlags, value: u32) {
    if value != 0 {
        termios.control_flags.remove(ControlFlags::CSIZE);
        termios.control_flags.insert(size);
    }
}

fn baud_rate(value: u32) -> Option<BaudRate> {
    match value {
        0 => Some(BaudRate::B0),
        50 => Some(BaudRate::B50),
        75 => Some(BaudRate::B75),
        110 => Some(BaudRate::B110),
        134 => Some(BaudRate::B134),
        150 => Some(BaudRate::B150),
        200 => Some(BaudRate::B200),
        300 => Some(BaudRate::B300),
        600 => Some(BaudRate::B600),
        1200 => Some(BaudRate::B1200),
        1800 => Some(BaudRate::B1800),
        2400 => Some(BaudRate::B2400),
        4800 => Some(BaudRate::B4800),
        9600 => Some(BaudRate::B9600),
        19200 => Some(BaudRate::B19200),
        38400 => Some(BaudRate::B38400),
        57600 => Some(BaudRate::B57600),
        115200 => Some(BaudRate::B115200),
        230400 => Some(BaudRate::B230400),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_termios() -> Termios {
        // SAFETY: an all-zero termios is a valid value for flag manipulation.
        let raw: nix::libc::termios = unsafe { std::mem::zeroed() };
        raw.into()
    }

    #[test]
    fn test_control_character_is_set() {
        let mut t = empty_termios();
        apply_mode(&mut t, Pty::VINTR, 0x03);
        assert_eq!(t.control_chars[SpecialCharacterIndices::VINTR as usize], 0x03);
    }

    #[test]
    fn test_local_flag_set_and_cleared() {
        let mut t = empty_termios();
        apply_mode(&mut t, Pty::ISIG, 1);
        assert!(t.local_flags.contains(LocalFlags::ISIG));
        apply_mode(&mut t, Pty::ISIG, 0);
        assert!(!t.local_flags.contains(LocalFlags::ISIG));
    }

    #[test]
    fn test_input_flag() {
        let mut t = empty_termios();
        apply_mode(&mut t, Pty::ICRNL, 1);
        assert!(t.input_flags.contains(InputFlags::ICRNL));
    }

    #[test]
    fn test_output_flag() {
        let mut t = empty_termios();
        apply_mode(&mut t, Pty::ONLCR, 1);
        assert!(t.output_flags.contains(OutputFlags::ONLCR));
    }

    #[test]
    fn test_char_size_replaces_previous_size() {
        let mut t = empty_termios();
        apply_mode(&mut t, Pty::CS7, 1);
        apply_mode(&mut t, Pty::CS8, 1);
        assert!(t.control_flags.contains(ControlFlags::CS8));
        assert_eq!(
            t.control_flags & ControlFlags::CSIZE,
            ControlFlags::CS8 & ControlFlags::CSIZE
        );
    }

    #[test]
    fn test_unsupported_opcode_is_skipped() {
        let mut t = empty_termios();
        let before = t.clone();
        // XCASE is obsolete and deliberately unmodeled.
        apply_mode(&mut t, Pty::XCASE, 1);
        assert_eq!(t.local_flags, before.local_flags);
        assert_eq!(t.input_flags, before.input_flags);
    }

    #[test]
    fn test_baud_rate_lookup() {
        assert_eq!(baud_rate(38400), Some(BaudRate::B38400));
        assert_eq!(baud_rate(115200), Some(BaudRate::B115200));
        assert_eq!(baud_rate(12345), None);
    }

    #[test]
    fn test_mode_list_application() {
        let mut t = empty_termios();
        let modes = [
            (Pty::VINTR, 0x03),
            (Pty::ECHO, 1),
            (Pty::ICANON, 1),
            (Pty::OPOST, 0),
        ];
        for (op, val) in modes {
            apply_mode(&mut t, op, val);
        }
        assert!(t.local_flags.contains(LocalFlags::ECHO | LocalFlags::ICANON));
        assert!(!t.output_flags.contains(OutputFlags::OPOST));
    }
}
