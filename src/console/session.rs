//! Login and command protocol over the guest console
//!
//! The session drives the guest like a person at a serial terminal:
//!
//! ```text
//! AwaitingLogin ──user──► AwaitingPassword ──password──► AwaitingPrompt
//!                              │  (no password asked)          │
//!                              └──────────────────────────────►│
//!                                                    PS1 + stty -echo
//!                                                              ▼
//!                                                      CapturingOutput
//! ```
//!
//! Every wait is bounded. Output of a command is framed by a begin and an
//! end sentinel, each written so that the guest echoing the command line
//! back can never look like the sentinel itself.

use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::{ConsoleChannel, Marker};
use crate::{CommandOutput, Error, Result};

/// Private shell prompt installed after login
pub const SHELL_PROMPT: &str = "__qb_prompt__> ";

/// Shell line that installs [`SHELL_PROMPT`]; the quote split keeps the echoed
/// line from matching the prompt
const PROMPT_SETUP: &str = "PS1='__qb_prompt''__> '; PS2=''; stty -echo";

const BEGIN_SENTINEL: &str = "__qb_begin_";
const END_SENTINEL: &str = "__qb_end_";

/// Interval between newline nudges while waiting for a login prompt
const LOGIN_NUDGE_INTERVAL: Duration = Duration::from_secs(2);

/// Where the session is in the console protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the getty `login:` prompt
    AwaitingLogin,
    /// User name sent, waiting for a password prompt or a shell
    AwaitingPassword,
    /// Credentials sent, waiting for a shell prompt
    AwaitingPrompt,
    /// Logged in; commands can be run
    CapturingOutput,
}

/// Timeouts and credentials for a session
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Wait for the first login prompt after boot
    pub boot_timeout: Duration,
    /// Wait for each login step and for prompt resynchronisation
    pub login_timeout: Duration,
    /// Wait for a command to finish
    pub command_timeout: Duration,
    /// Passwords by user name; users without one answer with an empty line
    pub credentials: HashMap<String, String>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            boot_timeout: Duration::from_secs(120),
            login_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(60),
            credentials: HashMap::new(),
        }
    }
}

/// Stateful command executor over a [`ConsoleChannel`]
pub struct ConsoleSession {
    channel: ConsoleChannel,
    settings: SessionSettings,
    state: SessionState,
    /// User the shell currently belongs to
    user: Option<String>,
    /// Whether a login prompt has ever been reached
    booted: bool,
    /// Set after a protocol fault; the console position is unknown
    desync: Option<String>,
}

impl ConsoleSession {
    /// Create a session on a freshly attached console
    pub fn new(channel: ConsoleChannel, settings: SessionSettings) -> Self {
        Self {
            channel,
            settings,
            state: SessionState::AwaitingLogin,
            user: None,
            booted: false,
            desync: None,
        }
    }

    /// Current protocol state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// User the session is logged in as
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// Whether the underlying console has shown a kernel panic
    pub fn kernel_panicked(&self) -> bool {
        self.channel.kernel_panicked()
    }

    /// Run `command` as `user` and capture its output and exit status.
    ///
    /// A non-zero exit status is returned in the [`CommandOutput`], not as an
    /// error; only console protocol faults are errors here.
    pub async fn run(&mut self, user: &str, command: &str) -> Result<CommandOutput> {
        if let Some(ref reason) = self.desync {
            return Err(Error::ProtocolDesync(format!(
                "console unusable after earlier failure: {}",
                reason
            )));
        }
        if command.contains(['\n', '\r']) {
            return Err(Error::Config(
                "guest commands must be a single line".into(),
            ));
        }
        validate_user(user)?;

        let result = self.run_inner(user, command).await;

        match result {
            Err(Error::LoginRejected(_)) => {
                // The guest is back at its login prompt.
                self.user = None;
                self.state = SessionState::AwaitingLogin;
            }
            Err(ref e) if e.is_protocol() || matches!(e, Error::Io(_)) => {
                warn!(error = %e, "console session desynchronised");
                self.desync = Some(e.to_string());
                self.user = None;
                self.channel.discard_buffered();
            }
            _ => {}
        }
        result
    }

    async fn run_inner(&mut self, user: &str, command: &str) -> Result<CommandOutput> {
        if self.user.as_deref() != Some(user) {
            if let Some(previous) = self.user.take() {
                debug!(from = %previous, to = %user, "switching console user");
                self.channel.write_line("exit").await?;
                self.state = SessionState::AwaitingLogin;
            }
            self.login(user).await?;
        }
        self.capture(command).await
    }

    async fn login(&mut self, user: &str) -> Result<()> {
        self.state = SessionState::AwaitingLogin;
        // Set when the shell prompt already arrived in place of a password prompt.
        let mut prompt_seen = false;

        loop {
            match self.state {
                SessionState::AwaitingLogin => {
                    self.await_login_prompt().await?;
                    self.channel.write_line(user).await?;
                    self.state = SessionState::AwaitingPassword;
                }
                SessionState::AwaitingPassword => {
                    let (matched, _) = self
                        .channel
                        .read_until_any(
                            &[
                                Marker::Exact("assword:"),
                                Marker::Exact("Login incorrect"),
                                Marker::Trailing("# "),
                                Marker::Trailing("$ "),
                            ],
                            self.settings.login_timeout,
                        )
                        .await?;
                    match matched {
                        0 => {
                            let password = self
                                .settings
                                .credentials
                                .get(user)
                                .cloned()
                                .unwrap_or_default();
                            self.channel.write_line(&password).await?;
                        }
                        1 => return Err(Error::LoginRejected(user.to_string())),
                        _ => prompt_seen = true,
                    }
                    self.state = SessionState::AwaitingPrompt;
                }
                SessionState::AwaitingPrompt => {
                    if !prompt_seen {
                        let (matched, _) = self
                            .channel
                            .read_until_any(
                                &[
                                    Marker::Exact("Login incorrect"),
                                    Marker::Trailing("# "),
                                    Marker::Trailing("$ "),
                                ],
                                self.settings.login_timeout,
                            )
                            .await?;
                        if matched == 0 {
                            return Err(Error::LoginRejected(user.to_string()));
                        }
                    }

                    self.channel.write_line(PROMPT_SETUP).await?;
                    self.channel
                        .read_until(SHELL_PROMPT, self.settings.login_timeout)
                        .await?;

                    info!(user = %user, "logged in on guest console");
                    self.user = Some(user.to_string());
                    self.state = SessionState::CapturingOutput;
                    return Ok(());
                }
                SessionState::CapturingOutput => return Ok(()),
            }
        }
    }

    /// Wait for getty, nudging the console with empty lines so a prompt that
    /// scrolled past (or was interleaved with kernel messages) is reprinted.
    async fn await_login_prompt(&mut self) -> Result<()> {
        let budget = if self.booted {
            self.settings.login_timeout
        } else {
            self.settings.boot_timeout
        };
        let deadline = tokio::time::Instant::now() + budget;

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(Error::ProtocolTimeout("login prompt".into()));
            }
            let wait = remaining.min(LOGIN_NUDGE_INTERVAL);

            match self
                .channel
                .read_until_any(&[Marker::Trailing("login: ")], wait)
                .await
            {
                Ok(_) => {
                    self.booted = true;
                    return Ok(());
                }
                Err(Error::ProtocolTimeout(_)) => {
                    debug!("no login prompt yet, nudging console");
                    self.channel.write_line("").await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn capture(&mut self, command: &str) -> Result<CommandOutput> {
        let nonce = nonce()?;
        let begin = format!("{}{}", BEGIN_SENTINEL, nonce);
        let end = format!("{}{}:", END_SENTINEL, nonce);

        // Sentinels go on lines of their own so comments, trailing `&` and
        // the like in `command` cannot swallow them. `$?` survives the line
        // break.
        debug!(command = %command, "running guest command");
        self.channel
            .write_line(&format!("printf '%s%s\\n' {} {}", BEGIN_SENTINEL, nonce))
            .await?;
        self.channel.write_line(command).await?;
        self.channel
            .write_line(&format!(
                "printf '\\n%s%s:%d\\n' {} {} \"$?\"",
                END_SENTINEL, nonce
            ))
            .await?;

        self.channel
            .read_until(&begin, self.settings.login_timeout)
            .await?;
        self.channel
            .read_until("\n", self.settings.login_timeout)
            .await?;

        let framed = self
            .channel
            .read_until(&end, self.settings.command_timeout)
            .await?;
        let output = unframe(&framed);

        let status = self
            .channel
            .read_until("\n", self.settings.login_timeout)
            .await?;
        let exit_code: i32 = status.trim().parse().map_err(|_| {
            Error::ProtocolDesync(format!("unparseable exit status {:?}", status))
        })?;

        self.channel
            .read_until(SHELL_PROMPT, self.settings.login_timeout)
            .await?;

        debug!(exit_code, bytes = output.len(), "guest command finished");
        Ok(CommandOutput::new(output, exit_code))
    }
}

/// Strip what the shell adds around a command's output: the prompt printed
/// before reading the command line, the prompt before reading the end
/// sentinel line, and the newline the end sentinel starts with.
fn unframe(framed: &str) -> String {
    let text = framed.strip_prefix(SHELL_PROMPT).unwrap_or(framed);
    let text = text.strip_suffix('\n').unwrap_or(text);
    let text = text.strip_suffix(SHELL_PROMPT).unwrap_or(text);
    text.to_string()
}

/// Account names go to getty as one line; reject anything that is not a
/// single printable word.
fn validate_user(user: &str) -> Result<()> {
    if user.is_empty() || user.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(Error::Config(format!("invalid guest user name {:?}", user)));
    }
    Ok(())
}

/// Random hex token that ties sentinels to one command
fn nonce() -> Result<String> {
    let mut bytes = [0u8; 8];
    getrandom::fill(&mut bytes)
        .map_err(|e| std::io::Error::other(format!("failed to generate nonce: {}", e)))?;
    Ok(bytes.iter().map(|b| format!("{:02x}", b)).collect())
}
