//! SSH proxy and session daemon for containerized applications.
//!
//! Two binaries share this crate:
//!
//! - `ssh-proxy` terminates client connections, authenticates them against
//!   pluggable credential backends (shared-secret or Cloud Controller), and
//!   proxies every channel to the SSH daemon inside the resolved container.
//! - `sshd` is that in-container daemon: it serves `session` channels by
//!   running a shell or command (with optional PTY) and `direct-tcpip`
//!   channels by dialing the forwarding target.

pub mod authenticators;
pub mod error;
pub mod handlers;
pub mod helpers;
pub mod proxy;
pub mod registry;
pub mod server;
pub mod signals;
pub mod term_modes;
