//! The `session` channel state machine for locally served sessions.
//!
//! One handler exists per SSH connection; each `session` channel gets an
//! entry in the session table. Requests arrive serialized per connection,
//! mutate the table under its mutex, and drive a child process with or
//! without a pseudo-terminal. Exactly one exit message is sent per started
//! child, after `wait` returns and all output couplers have drained.

use crate::error::{SessionError, SessionResult};
use crate::handlers::direct_tcpip;
use crate::handlers::scp::{is_scp_command, ScpHandler};
use crate::signals::{os_signal_from_ssh, ssh_signal_from_os};
use crate::term_modes;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use russh::server::{Auth, Handle, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, Pty, Sig};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::ChildStdin;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Exit status reported when a child could not be launched or its fate is
/// unclassifiable.
const EXIT_STATUS_UNKNOWN: u32 = 255;

/// Stored `pty-req` parameters, applied when the command starts.
#[derive(Debug, Clone)]
pub struct PtyRequest {
    pub term: String,
    pub col_width: u32,
    pub row_height: u32,
    pub pix_width: u32,
    pub pix_height: u32,
    pub modes: Vec<(Pty, u32)>,
}

/// Per-channel session state, guarded by the handler's session mutex.
#[derive(Default)]
struct SessionState {
    env: HashMap<String, String>,
    pty_request: Option<PtyRequest>,
    pty_writer: Option<pty_process::OwnedWritePty>,
    stdin: Option<ChildStdin>,
    child_pid: Option<i32>,
    started: bool,
    complete: bool,
    copiers: Vec<JoinHandle<()>>,
}

type SessionTable = Arc<Mutex<HashMap<ChannelId, SessionState>>>;

/// Configuration shared by every connection served by the daemon.
pub struct SessionChannelConfig {
    /// Username the daemon accepts.
    pub allowed_user: String,
    /// Password the daemon accepts, compared in constant time.
    pub allowed_password: String,
    /// Environment seeded into every new session.
    pub default_env: HashMap<String, String>,
    /// Dial timeout for `direct-tcpip` targets.
    pub dial_timeout: Duration,
}

/// Per-connection handler serving `session` and `direct-tcpip` channels
/// locally.
pub struct SessionChannelHandler {
    config: Arc<SessionChannelConfig>,
    scp_handler: Arc<dyn ScpHandler>,
    shell_path: String,
    peer: Option<SocketAddr>,
    authenticated: bool,
    sessions: SessionTable,
}

impl SessionChannelHandler {
    pub fn new(
        config: Arc<SessionChannelConfig>,
        scp_handler: Arc<dyn ScpHandler>,
        peer: Option<SocketAddr>,
    ) -> Self {
        Self {
            config,
            scp_handler,
            shell_path: locate_shell(),
            peer,
            authenticated: false,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start the requested command (or an interactive shell) on a channel.
    /// Replies to the request before launching; launch failures produce an
    /// exit-status 255 and tear the session down.
    async fn run_command(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
        command: Option<String>,
    ) -> Result<(), russh::Error> {
        let handle = session.handle();
        let mut sessions = self.sessions.lock().await;
        let state = match sessions.get_mut(&channel) {
            Some(state) if !state.started => state,
            Some(_) => {
                warn!(channel = ?channel, error = %SessionError::CommandAlreadyStarted,
                    "rejecting start request");
                session.channel_failure(channel)?;
                return Ok(());
            }
            None => {
                session.channel_failure(channel)?;
                return Ok(());
            }
        };
        state.started = true;
        session.channel_success(channel)?;

        let spawned = if state.pty_request.is_some() {
            spawn_with_pty(state, &self.shell_path, command.as_deref(), handle.clone(), channel)
        } else {
            spawn_piped(state, &self.shell_path, command.as_deref(), handle.clone(), channel)
        };
        drop(sessions);

        let sessions = Arc::clone(&self.sessions);
        match spawned {
            Ok(mut child) => {
                tokio::spawn(async move {
                    let status = child.wait().await;
                    // Drain output before reporting the exit; the exit
                    // message is the last thing on the channel.
                    let copiers = {
                        let mut table = sessions.lock().await;
                        table
                            .get_mut(&channel)
                            .map(|s| std::mem::take(&mut s.copiers))
                            .unwrap_or_default()
                    };
                    for copier in copiers {
                        let _ = copier.await;
                    }
                    send_exit_message(&handle, channel, status).await;
                    destroy(&sessions, &handle, channel).await;
                });
            }
            Err(e) => {
                warn!(channel = ?channel, error = %e, "failed to start command");
                let _ = handle
                    .exit_status_request(channel, EXIT_STATUS_UNKNOWN)
                    .await;
                destroy(&sessions, &handle, channel).await;
            }
        }
        Ok(())
    }
}

impl Handler for SessionChannelHandler {
    type Error = russh::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        let user_ok = crate::authenticators::constant_time_compare(
            user.as_bytes(),
            self.config.allowed_user.as_bytes(),
        );
        let password_ok = crate::authenticators::constant_time_compare(
            password.as_bytes(),
            self.config.allowed_password.as_bytes(),
        );
        if user_ok && password_ok {
            self.authenticated = true;
            info!(peer = ?self.peer, user = %user, "session daemon login");
            Ok(Auth::Accept)
        } else {
            warn!(peer = ?self.peer, user = %user, method = "password", "authentication failed");
            Ok(Auth::reject())
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if !self.authenticated {
            return Ok(false);
        }
        debug!(channel = ?channel.id(), "session channel opened");
        let mut sessions = self.sessions.lock().await;
        sessions.insert(
            channel.id(),
            SessionState {
                env: self.config.default_env.clone(),
                ..SessionState::default()
            },
        );
        Ok(true)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if !self.authenticated {
            return Ok(false);
        }
        debug!(
            target = %format!("{host_to_connect}:{port_to_connect}"),
            origin = %format!("{originator_address}:{originator_port}"),
            "direct-tcpip open"
        );
        match direct_tcpip::dial(host_to_connect, port_to_connect, self.config.dial_timeout).await
        {
            Ok(stream) => {
                direct_tcpip::serve(channel, stream);
                Ok(true)
            }
            Err(e) => {
                warn!(
                    target = %format!("{host_to_connect}:{port_to_connect}"),
                    error = %e,
                    "direct-tcpip dial failed"
                );
                Ok(false)
            }
        }
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let mut sessions = self.sessions.lock().await;
        if let Some(state) = sessions.get_mut(&channel) {
            state
                .env
                .insert(variable_name.to_string(), variable_value.to_string());
            session.channel_success(channel)?;
        } else {
            session.channel_failure(channel)?;
        }
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let mut sessions = self.sessions.lock().await;
        if let Some(state) = sessions.get_mut(&channel) {
            state.env.insert("TERM".to_string(), term.to_string());
            state.pty_request = Some(PtyRequest {
                term: term.to_string(),
                col_width,
                row_height,
                pix_width,
                pix_height,
                modes: modes.to_vec(),
            });
            // A pty-req on a running session only affects the window size.
            if let Some(writer) = state.pty_writer.as_ref() {
                if let Err(e) =
                    writer.resize(pty_process::Size::new(row_height as u16, col_width as u16))
                {
                    warn!(channel = ?channel, error = %e, "pty resize failed");
                }
            }
            session.channel_success(channel)?;
        } else {
            session.channel_failure(channel)?;
        }
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let mut sessions = self.sessions.lock().await;
        if let Some(state) = sessions.get_mut(&channel) {
            if let Some(request) = state.pty_request.as_mut() {
                request.col_width = col_width;
                request.row_height = row_height;
                request.pix_width = pix_width;
                request.pix_height = pix_height;
            }
            if let Some(writer) = state.pty_writer.as_ref() {
                if let Err(e) =
                    writer.resize(pty_process::Size::new(row_height as u16, col_width as u16))
                {
                    warn!(channel = ?channel, error = %e, "window change failed");
                }
            }
            session.channel_success(channel)?;
        } else {
            session.channel_failure(channel)?;
        }
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).to_string();
        info!(channel = ?channel, command = %command, "exec request");

        if is_scp_command(&command) {
            let handle = session.handle();
            let accepted = {
                let mut sessions = self.sessions.lock().await;
                match sessions.get_mut(&channel) {
                    Some(state) if !state.started => {
                        state.started = true;
                        true
                    }
                    _ => false,
                }
            };
            if !accepted {
                session.channel_failure(channel)?;
                return Ok(());
            }
            session.channel_success(channel)?;

            let scp_handler = Arc::clone(&self.scp_handler);
            let sessions = Arc::clone(&self.sessions);
            tokio::spawn(async move {
                let status = scp_handler
                    .handle_scp_request(handle.clone(), channel, &command)
                    .await;
                let _ = handle.exit_status_request(channel, status).await;
                destroy(&sessions, &handle, channel).await;
            });
            return Ok(());
        }

        self.run_command(channel, session, Some(command)).await
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        info!(channel = ?channel, "shell request");
        self.run_command(channel, session, None).await
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(channel = ?channel, subsystem = %name, "subsystem not supported");
        session.channel_failure(channel)?;
        Ok(())
    }

    async fn signal(
        &mut self,
        channel: ChannelId,
        signal: Sig,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let sessions = self.sessions.lock().await;
        if let Some(state) = sessions.get(&channel) {
            if let Some(pid) = state.child_pid {
                match os_signal_from_ssh(&signal) {
                    Some(os_signal) => {
                        debug!(channel = ?channel, signal = ?os_signal, "relaying signal");
                        if let Err(e) = kill(Pid::from_raw(pid), os_signal) {
                            warn!(channel = ?channel, error = %e, "failed to signal child");
                        }
                    }
                    None => debug!(channel = ?channel, signal = ?signal, "unmapped signal ignored"),
                }
            }
        }
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let mut sessions = self.sessions.lock().await;
        if let Some(state) = sessions.get_mut(&channel) {
            if let Some(writer) = state.pty_writer.as_mut() {
                let _ = writer.write_all(data).await;
            } else if let Some(stdin) = state.stdin.as_mut() {
                let _ = stdin.write_all(data).await;
            } else {
                debug!(channel = ?channel, "data with no running command, dropping");
            }
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let mut sessions = self.sessions.lock().await;
        if let Some(state) = sessions.get_mut(&channel) {
            // Propagate the write-close to the child's stdin; a PTY stays
            // open until the session is destroyed.
            if let Some(stdin) = state.stdin.take() {
                drop(stdin);
            }
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(channel = ?channel, "channel closed by client");
        let sessions = Arc::clone(&self.sessions);
        let handle = session.handle();
        tokio::spawn(async move {
            destroy(&sessions, &handle, channel).await;
        });
        Ok(())
    }
}

/// Locate the shell used for `shell` and `exec` requests: the first
/// executable among `/bin/bash`, `/usr/local/bin/bash`, `/bin/sh`, `bash`,
/// `sh`, falling back to `/bin/sh`.
pub fn locate_shell() -> String {
    for candidate in ["/bin/bash", "/usr/local/bin/bash", "/bin/sh", "bash", "sh"] {
        if candidate.contains('/') {
            if is_executable(Path::new(candidate)) {
                return candidate.to_string();
            }
        } else if let Some(found) = search_path(candidate) {
            return found.to_string_lossy().into_owned();
        }
    }
    "/bin/sh".to_string()
}

fn search_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Build the child environment: fixed `PATH` and `LANG`, the session
/// environment minus `HOME`/`USER`, then `HOME`/`USER` from the host
/// process environment (host values always win).
fn build_environment(session_env: &HashMap<String, String>) -> Vec<(String, String)> {
    let mut env = vec![
        ("PATH".to_string(), "/bin:/usr/bin".to_string()),
        ("LANG".to_string(), "en_US.UTF8".to_string()),
    ];
    for (key, value) in session_env {
        if key != "HOME" && key != "USER" {
            env.push((key.clone(), value.clone()));
        }
    }
    env.push((
        "HOME".to_string(),
        std::env::var("HOME").unwrap_or_default(),
    ));
    env.push((
        "USER".to_string(),
        std::env::var("USER").unwrap_or_default(),
    ));
    env
}

fn shell_args(command: Option<&str>) -> Vec<String> {
    match command {
        Some(command) => vec!["-c".to_string(), command.to_string()],
        None => Vec::new(),
    }
}

/// Spawn the child on a fresh PTY pair and wire both directions.
fn spawn_with_pty(
    state: &mut SessionState,
    shell_path: &str,
    command: Option<&str>,
    handle: Handle,
    channel: ChannelId,
) -> SessionResult<tokio::process::Child> {
    let request = state
        .pty_request
        .as_ref()
        .ok_or_else(|| SessionError::PtySetupFailed("no pty request stored".to_string()))?;

    let pty = pty_process::Pty::new().map_err(|e| SessionError::PtySetupFailed(e.to_string()))?;
    let pts = pty
        .pts()
        .map_err(|e| SessionError::PtySetupFailed(e.to_string()))?;

    // SAFETY: the fd belongs to the pty we hold for the whole call.
    let fd = unsafe { BorrowedFd::borrow_raw(pty.as_raw_fd()) };
    if let Err(e) = term_modes::set_terminal_attributes(fd, &request.modes) {
        debug!(channel = ?channel, error = %e, "failed to apply terminal modes");
    }

    let mut cmd = pty_process::Command::new(shell_path);
    cmd.args(shell_args(command));
    cmd.env_clear();
    cmd.envs(build_environment(&state.env));
    let child = cmd
        .spawn(&pts)
        .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
    // The slave must not stay open on our side or the master never EOFs.
    drop(pts);

    if let Err(e) = pty.resize(pty_process::Size::new(
        request.row_height as u16,
        request.col_width as u16,
    )) {
        debug!(channel = ?channel, error = %e, "failed to set initial window size");
    }

    let (mut reader, writer) = pty.into_split();
    state.pty_writer = Some(writer);
    state.child_pid = child.id().map(|pid| pid as i32);

    // Master -> channel; the channel write side closes when the master EOFs.
    state.copiers.push(tokio::spawn(async move {
        let mut buffer = vec![0u8; 32 * 1024];
        loop {
            match reader.read(&mut buffer).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if handle
                        .data(channel, CryptoVec::from_slice(&buffer[..n]))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }
        let _ = handle.eof(channel).await;
    }));

    Ok(child)
}

/// Spawn the child with piped standard streams.
fn spawn_piped(
    state: &mut SessionState,
    shell_path: &str,
    command: Option<&str>,
    handle: Handle,
    channel: ChannelId,
) -> SessionResult<tokio::process::Child> {
    let mut cmd = tokio::process::Command::new(shell_path);
    cmd.args(shell_args(command));
    cmd.env_clear();
    cmd.envs(build_environment(&state.env));
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

    state.stdin = child.stdin.take();
    state.child_pid = child.id().map(|pid| pid as i32);

    if let Some(mut stdout) = child.stdout.take() {
        let handle = handle.clone();
        state.copiers.push(tokio::spawn(async move {
            let mut buffer = vec![0u8; 32 * 1024];
            loop {
                match stdout.read(&mut buffer).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if handle
                            .data(channel, CryptoVec::from_slice(&buffer[..n]))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
        }));
    }

    if let Some(mut stderr) = child.stderr.take() {
        state.copiers.push(tokio::spawn(async move {
            let mut buffer = vec![0u8; 32 * 1024];
            loop {
                match stderr.read(&mut buffer).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if handle
                            .extended_data(channel, 1, CryptoVec::from_slice(&buffer[..n]))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
        }));
    }

    Ok(child)
}

/// Report the child's fate: `exit-status` for a normal exit, `exit-signal`
/// for a signal death, status 255 for anything unclassifiable.
async fn send_exit_message(
    handle: &Handle,
    channel: ChannelId,
    status: std::io::Result<ExitStatus>,
) {
    match status {
        Ok(status) => {
            if let Some(code) = status.code() {
                if handle
                    .exit_status_request(channel, code as u32)
                    .await
                    .is_err()
                {
                    warn!(channel = ?channel, "failed to send exit status");
                }
            } else if let Some(signal) = status.signal() {
                match ssh_signal_from_os(signal) {
                    Some(ssh_signal) => {
                        if handle
                            .exit_signal_request(
                                channel,
                                ssh_signal,
                                status.core_dumped(),
                                String::new(),
                                String::new(),
                            )
                            .await
                            .is_err()
                        {
                            warn!(channel = ?channel, "failed to send exit signal");
                        }
                    }
                    None => {
                        let _ = handle
                            .exit_status_request(channel, EXIT_STATUS_UNKNOWN)
                            .await;
                    }
                }
            } else {
                let _ = handle
                    .exit_status_request(channel, EXIT_STATUS_UNKNOWN)
                    .await;
            }
        }
        Err(e) => {
            warn!(channel = ?channel, error = %e, "wait failed");
            let _ = handle
                .exit_status_request(channel, EXIT_STATUS_UNKNOWN)
                .await;
        }
    }
}

/// Tear a session down exactly once: join the remaining couplers, release
/// the PTY master and stdin, close the channel, and drop the table entry.
/// Safe to call from any task; later calls are no-ops.
async fn destroy(sessions: &SessionTable, handle: &Handle, channel: ChannelId) {
    let parts = {
        let mut table = sessions.lock().await;
        match table.get_mut(&channel) {
            Some(state) if !state.complete => {
                state.complete = true;
                Some((
                    std::mem::take(&mut state.copiers),
                    state.pty_writer.take(),
                    state.stdin.take(),
                ))
            }
            _ => None,
        }
    };

    let Some((copiers, pty_writer, stdin)) = parts else {
        return;
    };

    for copier in copiers {
        let _ = copier.await;
    }
    drop(pty_writer);
    drop(stdin);
    let _ = handle.eof(channel).await;
    let _ = handle.close(channel).await;

    sessions.lock().await.remove(&channel);
    debug!(channel = ?channel, "session destroyed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locate_shell_returns_absolute_path() {
        let shell = locate_shell();
        assert!(shell.starts_with('/'), "got {shell}");
        assert!(is_executable(Path::new(&shell)));
    }

    #[test]
    fn test_build_environment_fixed_entries() {
        let env = build_environment(&HashMap::new());
        assert!(env.contains(&("PATH".to_string(), "/bin:/usr/bin".to_string())));
        assert!(env.contains(&("LANG".to_string(), "en_US.UTF8".to_string())));
    }

    #[test]
    fn test_build_environment_host_home_and_user_win() {
        let mut session_env = HashMap::new();
        session_env.insert("HOME".to_string(), "/spoofed".to_string());
        session_env.insert("USER".to_string(), "mallory".to_string());
        session_env.insert("FOO".to_string(), "bar".to_string());

        let env = build_environment(&session_env);

        let host_home = std::env::var("HOME").unwrap_or_default();
        let host_user = std::env::var("USER").unwrap_or_default();
        assert!(env.contains(&("HOME".to_string(), host_home)));
        assert!(env.contains(&("USER".to_string(), host_user)));
        assert!(env.contains(&("FOO".to_string(), "bar".to_string())));
        assert!(!env.contains(&("HOME".to_string(), "/spoofed".to_string())));
        assert!(!env.contains(&("USER".to_string(), "mallory".to_string())));
    }

    #[test]
    fn test_shell_args() {
        assert_eq!(shell_args(Some("ls -la")), vec!["-c", "ls -la"]);
        assert!(shell_args(None).is_empty());
    }

    #[test]
    fn test_session_state_defaults() {
        let state = SessionState::default();
        assert!(!state.started);
        assert!(!state.complete);
        assert!(state.env.is_empty());
        assert!(state.pty_request.is_none());
    }
}
