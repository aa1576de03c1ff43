//! In-process stand-in for a guest serial console.
//!
//! Speaks just enough getty, login and shell to exercise the console
//! protocol: prompts, password checks, terminal echo, `PS1`/`stty -echo`,
//! `exit`, and sentinel-framed commands. Output uses `\r\n` line endings
//! like a real tty.

use std::collections::HashMap;

use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream, Lines};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::task::JoinHandle;

use qemu_box::console::ConsoleChannel;

pub const SHADOW: &str = "root::19000:0:99999:7:::\nuser:!:19000:0:99999:7:::\n";
pub const PASSWD: &str =
    "root:x:0:0:root:/root:/bin/bash\nuser:x:1000:1000:user:/home/user:/bin/sh\n";

type GuestLines = Lines<BufReader<ReadHalf<DuplexStream>>>;

/// Behaviour of the fake guest
#[derive(Debug, Clone, Default)]
pub struct FakeGuest {
    /// Echo shell input back until `stty -echo`
    pub echo: bool,
    /// Accounts that require a password
    pub passwords: HashMap<String, String>,
    /// Printed once before the first login prompt
    pub banner: String,
}

impl FakeGuest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn echo(mut self) -> Self {
        self.echo = true;
        self
    }

    pub fn password(mut self, user: &str, password: &str) -> Self {
        self.passwords.insert(user.to_string(), password.to_string());
        self
    }

    pub fn banner(mut self, banner: &str) -> Self {
        self.banner = banner.to_string();
        self
    }

    /// Start the guest and return the host end of its console
    pub fn attach(self) -> (ConsoleChannel, JoinHandle<()>) {
        let (host, guest) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(host);
        let handle = tokio::spawn(self.run(guest));
        (ConsoleChannel::new(reader, writer), handle)
    }

    async fn run(self, io: DuplexStream) {
        let (reader, mut writer) = tokio::io::split(io);
        let mut lines = BufReader::new(reader).lines();

        send(&mut writer, &self.banner).await;
        loop {
            send(&mut writer, "\nfakeguest login: ").await;
            let Some(user) = next_line(&mut lines).await else {
                return;
            };
            if user.is_empty() {
                continue;
            }
            send(&mut writer, &format!("{}\n", user)).await;

            if let Some(expected) = self.passwords.get(&user) {
                send(&mut writer, "Password: ").await;
                let Some(password) = next_line(&mut lines).await else {
                    return;
                };
                if password != *expected {
                    send(&mut writer, "\n\nLogin incorrect").await;
                    continue;
                }
                send(&mut writer, "\n").await;
            }

            if !self.shell(&user, &mut lines, &mut writer).await {
                return;
            }
        }
    }

    /// Returns false when the console should close.
    async fn shell(
        &self,
        user: &str,
        lines: &mut GuestLines,
        writer: &mut WriteHalf<DuplexStream>,
    ) -> bool {
        let mut echo = self.echo;
        let sigil = if user == "root" { '#' } else { '$' };
        let mut prompt = format!("{}@fakeguest:~{} ", user, sigil);
        // `$?` as the shell would expand it
        let mut status = "0".to_string();
        send(writer, &format!("Last login: never\n{}", prompt)).await;

        loop {
            let Some(line) = next_line(lines).await else {
                return false;
            };
            if echo {
                send(writer, &format!("{}\n", line)).await;
            }

            if line == "exit" {
                send(writer, "logout\n").await;
                return true;
            }

            if let Some(rest) = line.strip_prefix("PS1=") {
                prompt = rest.split(';').next().unwrap_or("").replace('\'', "");
                if line.contains("stty -echo") {
                    echo = false;
                }
                send(writer, &prompt).await;
                continue;
            }

            if let Some(nonce) = line.strip_prefix("printf '%s%s\\n' __qb_begin_ ") {
                send(writer, &format!("__qb_begin_{}\n{}", nonce, prompt)).await;
                continue;
            }

            if let Some(rest) = line.strip_prefix("printf '\\n%s%s:%d\\n' __qb_end_ ") {
                let nonce = rest.strip_suffix(" \"$?\"").unwrap_or(rest);
                send(writer, &format!("\n__qb_end_{}:{}\n{}", nonce, status, prompt)).await;
                continue;
            }

            match line.as_str() {
                "hang" => std::future::pending::<()>().await,
                "close" => return false,
                "garble" => status = "oops".to_string(),
                "" => {}
                command => {
                    let (output, code) = run_command(user, command);
                    send(writer, &output).await;
                    status = code.to_string();
                }
            }
            send(writer, &prompt).await;
        }
    }
}

fn run_command(user: &str, command: &str) -> (String, i32) {
    // Comments and backgrounding do not change what runs here.
    let command = command.split(" #").next().unwrap_or(command).trim_end();
    if let Some(job) = command.strip_suffix('&') {
        let _ = run_command(user, job.trim_end());
        return (String::new(), 0);
    }
    match command {
        "cat /etc/shadow" if user == "root" => (SHADOW.to_string(), 0),
        "cat /etc/shadow" => ("cat: /etc/shadow: Permission denied\n".to_string(), 1),
        "cat /etc/passwd" => (PASSWD.to_string(), 0),
        "whoami" => (format!("{}\n", user), 0),
        "true" => (String::new(), 0),
        "false" => (String::new(), 1),
        "printf done" => ("done".to_string(), 0),
        "sleep 0" => (String::new(), 0),
        _ => {
            if let Some(text) = command.strip_prefix("echo ") {
                (format!("{}\n", text), 0)
            } else {
                (format!("sh: {}: not found\n", command), 127)
            }
        }
    }
}

async fn next_line(lines: &mut GuestLines) -> Option<String> {
    match lines.next_line().await {
        Ok(Some(line)) => Some(line.trim_end_matches('\r').to_string()),
        _ => None,
    }
}

/// Write `text` with tty line endings
async fn send<W: AsyncWrite + Unpin>(writer: &mut W, text: &str) {
    if text.is_empty() {
        return;
    }
    let text = text.replace('\n', "\r\n");
    let _ = writer.write_all(text.as_bytes()).await;
    let _ = writer.flush().await;
}
