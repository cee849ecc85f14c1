//! Translation tables between SSH signal names and OS signals.
//!
//! SSH carries signal names without the `SIG` prefix (RFC 4254 §6.10).
//! The russh `Sig` enum covers the RFC set; `USR2` has no variant and
//! travels as a custom name.

use nix::sys::signal::Signal;
use russh::Sig;

/// Map an OS signal number (as reported by a child's wait status) to the
/// SSH signal name used in `exit-signal` messages.
pub fn ssh_signal_from_os(signal: i32) -> Option<Sig> {
    match Signal::try_from(signal).ok()? {
        Signal::SIGABRT => Some(Sig::ABRT),
        Signal::SIGALRM => Some(Sig::ALRM),
        Signal::SIGFPE => Some(Sig::FPE),
        Signal::SIGHUP => Some(Sig::HUP),
        Signal::SIGILL => Some(Sig::ILL),
        Signal::SIGINT => Some(Sig::INT),
        Signal::SIGKILL => Some(Sig::KILL),
        Signal::SIGPIPE => Some(Sig::PIPE),
        Signal::SIGQUIT => Some(Sig::QUIT),
        Signal::SIGSEGV => Some(Sig::SEGV),
        Signal::SIGTERM => Some(Sig::TERM),
        Signal::SIGUSR1 => Some(Sig::USR1),
        Signal::SIGUSR2 => Some(Sig::Custom("USR2".to_string())),
        _ => None,
    }
}

/// Map an SSH signal name from a `signal` channel request to the OS signal
/// delivered to the running child. Unmapped names are ignored by the caller.
pub fn os_signal_from_ssh(signal: &Sig) -> Option<Signal> {
    match signal {
        Sig::ABRT => Some(Signal::SIGABRT),
        Sig::ALRM => Some(Signal::SIGALRM),
        Sig::FPE => Some(Signal::SIGFPE),
        Sig::HUP => Some(Signal::SIGHUP),
        Sig::ILL => Some(Signal::SIGILL),
        Sig::INT => Some(Signal::SIGINT),
        Sig::KILL => Some(Signal::SIGKILL),
        Sig::PIPE => Some(Signal::SIGPIPE),
        Sig::QUIT => Some(Signal::SIGQUIT),
        Sig::SEGV => Some(Signal::SIGSEGV),
        Sig::TERM => Some(Signal::SIGTERM),
        Sig::USR1 => Some(Signal::SIGUSR1),
        Sig::Custom(name) if name == "USR2" => Some(Signal::SIGUSR2),
        _ => None,
    }
}
