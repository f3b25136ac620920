// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! FTP upload channel.
//!
//! Each payload is stored as one binary file with a random 12-character name
//! over a passive-mode data connection. Only the handful of commands the
//! upload needs are spoken (`USER`, `PASS`, `TYPE I`, `CWD`, `PASV`, `STOR`,
//! `NOOP`, `QUIT`).

use async_trait::async_trait;
use reqwest::Url;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::RelayError;
use crate::transport::Transport;

const NAME: &str = "ftp";
const DEFAULT_PORT: u16 = 21;
const FILE_NAME_LEN: usize = 12;

#[derive(Debug)]
struct Reply {
    code: u16,
    text: String,
}

#[derive(Debug, Clone)]
struct FtpTarget {
    host: String,
    port: u16,
    user: String,
    password: String,
    directory: Option<String>,
}

impl FtpTarget {
    fn parse(raw: &str) -> Result<Self, RelayError> {
        let url = Url::parse(raw).map_err(|e| RelayError::init(NAME, format!("invalid url: {e}")))?;
        if url.scheme() != "ftp" {
            return Err(RelayError::init(
                NAME,
                format!("unsupported scheme '{}'", url.scheme()),
            ));
        }
        let host = url
            .host_str()
            .ok_or_else(|| RelayError::init(NAME, "url has no host"))?
            .to_string();
        let user = match url.username() {
            "" => "anonymous".to_string(),
            user => user.to_string(),
        };
        let directory = Some(url.path().trim_matches('/'))
            .filter(|path| !path.is_empty())
            .map(str::to_string);
        Ok(Self {
            host,
            port: url.port().unwrap_or(DEFAULT_PORT),
            user,
            password: url.password().unwrap_or("anonymous@").to_string(),
            directory,
        })
    }
}

/// Random alphanumeric upload name.
#[must_use]
pub fn random_file_name() -> String {
    std::iter::repeat_with(fastrand::alphanumeric)
        .take(FILE_NAME_LEN)
        .collect()
}

/// Extracts the data port from a `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)` reply.
fn parse_pasv_port(text: &str) -> Option<u16> {
    let start = text.find('(')?;
    let end = text[start..].find(')')? + start;
    let fields = text[start + 1..end]
        .split(',')
        .map(|f| f.trim().parse::<u8>().ok())
        .collect::<Option<Vec<_>>>()?;
    if fields.len() != 6 {
        return None;
    }
    Some(u16::from(fields[4]) << 8 | u16::from(fields[5]))
}

#[derive(Debug)]
pub struct FtpTransport {
    url: String,
    timeout: Duration,
    control: Option<BufReader<TcpStream>>,
}

impl FtpTransport {
    #[must_use]
    pub fn new(url: &str, timeout: Duration) -> Self {
        Self {
            url: url.to_string(),
            timeout,
            control: None,
        }
    }

    async fn read_reply(&mut self) -> Result<Reply, std::io::Error> {
        let Some(control) = self.control.as_mut() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "no control connection",
            ));
        };
        let mut line = String::new();
        if timeout(self.timeout, control.read_line(&mut line))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "reply timed out"))??
            == 0
        {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "control connection closed",
            ));
        }

        let code = line
            .get(..3)
            .and_then(|c| c.parse::<u16>().ok())
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, format!("bad reply: {line}"))
            })?;

        // Multi-line replies end with "<code> ".
        if line.as_bytes().get(3) == Some(&b'-') {
            let terminator = format!("{code} ");
            loop {
                let mut next = String::new();
                if control.read_line(&mut next).await? == 0 {
                    break;
                }
                if next.starts_with(&terminator) {
                    line = next;
                    break;
                }
            }
        }

        Ok(Reply {
            code,
            text: line.trim_end().to_string(),
        })
    }

    async fn command(&mut self, command: &str) -> Result<Reply, std::io::Error> {
        let Some(control) = self.control.as_mut() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "no control connection",
            ));
        };
        control
            .get_mut()
            .write_all(format!("{command}\r\n").as_bytes())
            .await?;
        self.read_reply().await
    }

    async fn expect(
        &mut self,
        command: &str,
        accepted: &[u16],
    ) -> Result<Reply, RelayError> {
        let verb = command.split(' ').next().unwrap_or(command);
        let reply = self
            .command(command)
            .await
            .map_err(|e| RelayError::send(NAME, format!("{verb}: {e}")))?;
        if accepted.contains(&reply.code) {
            Ok(reply)
        } else {
            Err(RelayError::send(NAME, format!("{verb} rejected: {}", reply.text)))
        }
    }

    async fn login(&mut self, target: &FtpTarget) -> Result<(), RelayError> {
        let greeting = self.read_reply().await.map_err(|e| RelayError::init(NAME, e))?;
        if greeting.code != 220 {
            return Err(RelayError::init(NAME, format!("greeting: {}", greeting.text)));
        }

        let user = self.expect(&format!("USER {}", target.user), &[230, 331]).await;
        let user = user.map_err(|e| RelayError::init(NAME, e))?;
        if user.code == 331 {
            self.expect(&format!("PASS {}", target.password), &[202, 230])
                .await
                .map_err(|e| RelayError::init(NAME, e))?;
        }
        self.expect("TYPE I", &[200])
            .await
            .map_err(|e| RelayError::init(NAME, e))?;
        if let Some(directory) = &target.directory {
            self.expect(&format!("CWD {directory}"), &[250])
                .await
                .map_err(|e| RelayError::init(NAME, e))?;
        }
        Ok(())
    }

    fn peer_ip(&self) -> Result<std::net::IpAddr, RelayError> {
        self.control
            .as_ref()
            .ok_or_else(|| RelayError::send(NAME, "channel not initialized"))?
            .get_ref()
            .peer_addr()
            .map(|addr| addr.ip())
            .map_err(|e| RelayError::send(NAME, e))
    }
}

#[async_trait]
impl Transport for FtpTransport {
    fn name(&self) -> &str {
        NAME
    }

    fn set_endpoint(&mut self, endpoint: &str) {
        // Only FTP URLs apply; HTTP collector URLs are for the HTTP channels.
        if endpoint.starts_with("ftp://") && endpoint != self.url {
            self.url = endpoint.to_string();
            self.control = None;
        }
    }

    fn is_initialized(&self) -> bool {
        self.control.is_some()
    }

    async fn initialize(&mut self) -> Result<(), RelayError> {
        self.control = None;
        let target = FtpTarget::parse(&self.url)?;

        let stream = timeout(
            self.timeout,
            TcpStream::connect((target.host.as_str(), target.port)),
        )
        .await
        .map_err(|_| RelayError::init(NAME, "connect timed out"))?
        .map_err(|e| RelayError::init(NAME, e))?;
        self.control = Some(BufReader::new(stream));

        if let Err(e) = self.login(&target).await {
            self.control = None;
            return Err(e);
        }
        debug!("ftp channel logged in to {}:{}", target.host, target.port);
        Ok(())
    }

    async fn send(&mut self, payload: &[u8]) -> Result<(), RelayError> {
        let ip = self.peer_ip()?;

        let pasv = self.expect("PASV", &[227]).await?;
        let port = parse_pasv_port(&pasv.text)
            .ok_or_else(|| RelayError::send(NAME, format!("bad PASV reply: {}", pasv.text)))?;
        let mut data = timeout(self.timeout, TcpStream::connect(SocketAddr::new(ip, port)))
            .await
            .map_err(|_| RelayError::send(NAME, "data connection timed out"))?
            .map_err(|e| RelayError::send(NAME, e))?;

        let file_name = random_file_name();
        self.expect(&format!("STOR {file_name}"), &[125, 150]).await?;

        let mut written = 0;
        while written < payload.len() {
            let n = timeout(self.timeout, data.write(&payload[written..]))
                .await
                .map_err(|_| RelayError::send(NAME, "upload timed out"))?
                .map_err(|e| RelayError::send(NAME, e))?;
            if n == 0 {
                break;
            }
            written += n;
        }
        data.shutdown().await.map_err(|e| RelayError::send(NAME, e))?;
        drop(data);

        if written != payload.len() {
            return Err(RelayError::send(
                NAME,
                format!("short upload: {written} of {} bytes", payload.len()),
            ));
        }

        let done = self.read_reply().await.map_err(|e| RelayError::send(NAME, e))?;
        if done.code != 226 && done.code != 250 {
            return Err(RelayError::send(NAME, format!("STOR failed: {}", done.text)));
        }
        debug!("ftp channel stored {written} bytes as {file_name}");
        Ok(())
    }

    async fn test_connection(&mut self) -> bool {
        if self.control.is_none() {
            return false;
        }
        self.expect("NOOP", &[200]).await.is_ok()
    }

    async fn receive(&mut self) -> Vec<u8> {
        Vec::new()
    }

    async fn cleanup(&mut self) {
        if self.control.is_some() {
            if let Err(e) = self.command("QUIT").await {
                warn!("ftp QUIT failed: {e}");
            }
        }
        self.control = None;
    }
}
