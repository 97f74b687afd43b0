use crate::response::{Response, ResponseBuilder, ResponseLine};
use crate::traits::{AsyncReadAndWrite, BoxedAsyncReadAndWrite};
use memchr::memchr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const MAX_LINE_LEN: usize = 4096;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("response is not UTF8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("Malformed response line: {0}")]
    MalformedResponseLine(String),
    #[error("Response line is too long")]
    ResponseTooLong,
    #[error("Not connected")]
    NotConnected,
    #[error("Error connecting to {target}: {error}")]
    Connect { target: String, error: String },
    #[error("Timed out waiting {duration:?} for response to {command:?}")]
    TimedOut {
        command: Option<String>,
        duration: Duration,
    },
    #[error("Error {error} reading response to {command:?}")]
    ReadError {
        command: Option<String>,
        error: String,
    },
    #[error("Error {error} writing {command:?}")]
    WriteError {
        command: Option<String>,
        error: String,
    },
    #[error("{command} rejected: {}", response.to_single_line())]
    Rejected { command: String, response: Response },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EsmtpCapability {
    pub name: String,
    pub param: Option<String>,
}

/// A deliberately small LMTP/SMTP client: connect, greet, relay the
/// envelope, stream a dot-stuffed payload, read replies. It exists to
/// serve the proxy fan-out; outbound niceties such as TLS, DANE and
/// pipelining are out of scope here.
#[derive(Debug)]
pub struct LmtpClient {
    socket: Option<BoxedAsyncReadAndWrite>,
    capabilities: Vec<EsmtpCapability>,
    read_buffer: Vec<u8>,
    timeout: Duration,
}

impl LmtpClient {
    pub async fn connect(
        host: &str,
        port: u16,
        timeout_duration: Duration,
    ) -> Result<Self, ClientError> {
        let target = format!("{host}:{port}");
        let stream = timeout(timeout_duration, TcpStream::connect((host, port)))
            .await
            .map_err(|_| ClientError::Connect {
                target: target.clone(),
                error: format!("connect timed out after {timeout_duration:?}"),
            })?
            .map_err(|err| ClientError::Connect {
                target: target.clone(),
                error: format!("{err:#}"),
            })?;
        stream.set_nodelay(true).ok();
        Ok(Self::with_stream(stream, timeout_duration))
    }

    pub fn with_stream<S: AsyncReadAndWrite + 'static>(stream: S, timeout: Duration) -> Self {
        Self {
            socket: Some(Box::new(stream)),
            capabilities: vec![],
            read_buffer: Vec::with_capacity(1024),
            timeout,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities
            .iter()
            .any(|cap| cap.name.eq_ignore_ascii_case(name))
    }

    async fn read_line(&mut self, command: Option<&str>) -> Result<String, ClientError> {
        loop {
            if let Some(idx) = memchr(b'\n', &self.read_buffer) {
                // Tolerate a bare LF terminator from sloppy peers
                let end = if idx > 0 && self.read_buffer[idx - 1] == b'\r' {
                    idx - 1
                } else {
                    idx
                };
                let line = String::from_utf8(self.read_buffer[0..end].to_vec());
                self.read_buffer.drain(0..idx + 1);
                return Ok(line?);
            }
            if self.read_buffer.len() > MAX_LINE_LEN {
                self.socket.take();
                return Err(ClientError::ResponseTooLong);
            }

            let mut data = [0u8; 1024];
            let socket = self.socket.as_mut().ok_or(ClientError::NotConnected)?;
            let size = match timeout(self.timeout, socket.read(&mut data)).await {
                Ok(Ok(size)) => size,
                Ok(Err(err)) => {
                    self.socket.take();
                    return Err(ClientError::ReadError {
                        command: command.map(str::to_string),
                        error: format!("{err:#}"),
                    });
                }
                Err(_) => {
                    self.socket.take();
                    return Err(ClientError::TimedOut {
                        command: command.map(str::to_string),
                        duration: self.timeout,
                    });
                }
            };
            if size == 0 {
                self.socket.take();
                return Err(ClientError::ReadError {
                    command: command.map(str::to_string),
                    error: "Connection closed by peer".to_string(),
                });
            }
            self.read_buffer.extend_from_slice(&data[0..size]);
        }
    }

    pub async fn read_response(&mut self, command: Option<&str>) -> Result<Response, ClientError> {
        let mut builder: Option<ResponseBuilder> = None;
        loop {
            let line = self.read_line(command).await?;
            let parsed = ResponseLine::parse(&line)
                .ok_or_else(|| ClientError::MalformedResponseLine(line.clone()))?;
            let is_final = parsed.is_final;
            let current = match builder.take() {
                None => ResponseBuilder::new(&parsed),
                Some(mut current) => {
                    current
                        .add_line(&parsed)
                        .map_err(ClientError::MalformedResponseLine)?;
                    current
                }
            };
            if is_final {
                return Ok(current.build(command.map(str::to_string)));
            }
            builder = Some(current);
        }
    }

    async fn write_line(&mut self, line: &str) -> Result<(), ClientError> {
        let socket = self.socket.as_mut().ok_or(ClientError::NotConnected)?;
        let data = format!("{line}\r\n");
        match timeout(self.timeout, async {
            socket.write_all(data.as_bytes()).await?;
            socket.flush().await
        })
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                self.socket.take();
                Err(ClientError::WriteError {
                    command: Some(line.to_string()),
                    error: format!("{err:#}"),
                })
            }
            Err(_) => {
                self.socket.take();
                Err(ClientError::TimedOut {
                    command: Some(line.to_string()),
                    duration: self.timeout,
                })
            }
        }
    }

    /// Send a command line and read its reply.
    pub async fn command(&mut self, line: &str) -> Result<Response, ClientError> {
        self.write_line(line).await?;
        self.read_response(Some(line)).await
    }

    /// Like [`Self::command`] but treats a non-2xx (or non-`expect`)
    /// reply as an error.
    pub async fn command_expecting(
        &mut self,
        line: &str,
        expect: u16,
    ) -> Result<Response, ClientError> {
        let response = self.command(line).await?;
        if response.code != expect {
            return Err(ClientError::Rejected {
                command: line.to_string(),
                response,
            });
        }
        Ok(response)
    }

    /// Read the server banner; expected once per connection.
    pub async fn read_greeting(&mut self) -> Result<Response, ClientError> {
        let response = self.read_response(Some("(greeting)")).await?;
        if response.code != 220 {
            return Err(ClientError::Rejected {
                command: "(greeting)".to_string(),
                response,
            });
        }
        Ok(response)
    }

    /// Greet the peer, recording the advertised capability set.
    pub async fn lhlo(&mut self, my_hostname: &str, lmtp: bool) -> Result<Response, ClientError> {
        let verb = if lmtp { "LHLO" } else { "EHLO" };
        let response = self
            .command_expecting(&format!("{verb} {my_hostname}"), 250)
            .await?;
        self.capabilities.clear();
        for line in response.content.lines().skip(1) {
            let mut fields = line.splitn(2, ' ');
            if let Some(name) = fields.next() {
                self.capabilities.push(EsmtpCapability {
                    name: name.to_string(),
                    param: fields.next().map(str::to_string),
                });
            }
        }
        Ok(response)
    }

    /// Stream a payload in dot-stuffed form and terminate it. The
    /// caller reads the per-recipient replies afterwards.
    pub async fn send_payload<R>(&mut self, mut reader: R) -> Result<(), ClientError>
    where
        R: tokio::io::AsyncRead + Unpin + Send,
    {
        let mut at_line_start = true;
        let mut last: [u8; 2] = [0, 0];
        let mut chunk = [0u8; 8192];
        loop {
            let size = match timeout(self.timeout, reader.read(&mut chunk)).await {
                Ok(Ok(size)) => size,
                Ok(Err(err)) => {
                    return Err(ClientError::ReadError {
                        command: Some("(payload)".to_string()),
                        error: format!("{err:#}"),
                    })
                }
                Err(_) => {
                    return Err(ClientError::TimedOut {
                        command: Some("(payload)".to_string()),
                        duration: self.timeout,
                    })
                }
            };
            if size == 0 {
                break;
            }
            let data = &chunk[..size];
            let stuffed = dot_stuff(data, &mut at_line_start);
            match data {
                [.., a, b] => last = [*a, *b],
                [a] => last = [last[1], *a],
                [] => {}
            }
            self.write_payload_chunk(&stuffed).await?;
        }
        let terminator: &[u8] = if last == [b'\r', b'\n'] {
            b".\r\n"
        } else {
            b"\r\n.\r\n"
        };
        self.write_payload_chunk(terminator).await?;
        let socket = self.socket.as_mut().ok_or(ClientError::NotConnected)?;
        socket.flush().await.map_err(|err| ClientError::WriteError {
            command: Some("(payload)".to_string()),
            error: format!("{err:#}"),
        })?;
        Ok(())
    }

    async fn write_payload_chunk(&mut self, data: &[u8]) -> Result<(), ClientError> {
        let socket = self.socket.as_mut().ok_or(ClientError::NotConnected)?;
        match timeout(self.timeout, socket.write_all(data)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                self.socket.take();
                Err(ClientError::WriteError {
                    command: Some("(payload)".to_string()),
                    error: format!("{err:#}"),
                })
            }
            Err(_) => {
                self.socket.take();
                Err(ClientError::TimedOut {
                    command: Some("(payload)".to_string()),
                    duration: self.timeout,
                })
            }
        }
    }

    /// Best-effort QUIT; errors are ignored since the conversation is
    /// already complete.
    pub async fn quit(&mut self) {
        if self.socket.is_some() {
            self.write_line("QUIT").await.ok();
            self.socket.take();
        }
    }
}

/// RFC 5321 section 4.5.2: escape a leading dot on every line.
/// `at_line_start` carries the line-boundary state across chunks.
fn dot_stuff(data: &[u8], at_line_start: &mut bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 16);
    let mut pos = 0;
    while pos < data.len() {
        if *at_line_start && data[pos] == b'.' {
            out.push(b'.');
        }
        match memchr(b'\n', &data[pos..]) {
            Some(nl) => {
                out.extend_from_slice(&data[pos..pos + nl + 1]);
                pos += nl + 1;
                *at_line_start = true;
            }
            None => {
                out.extend_from_slice(&data[pos..]);
                pos = data.len();
                *at_line_start = false;
            }
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dot_stuffing() {
        let mut at_line_start = true;
        assert_eq!(
            dot_stuff(b".leading\r\nplain\r\n..dots\r\n", &mut at_line_start),
            b"..leading\r\nplain\r\n...dots\r\n".to_vec()
        );
        assert!(at_line_start);

        // A dot at a chunk boundary line start must still be escaped
        let mut at_line_start = true;
        let mut out = dot_stuff(b"line\r\n", &mut at_line_start);
        out.extend(dot_stuff(b".rest\r\n", &mut at_line_start));
        assert_eq!(out, b"line\r\n..rest\r\n".to_vec());

        // A dot mid-line is left alone
        let mut at_line_start = false;
        assert_eq!(dot_stuff(b".mid", &mut at_line_start), b".mid".to_vec());
    }

    #[tokio::test]
    async fn greeting_and_lhlo() {
        let (client_side, mut server_side) = tokio::io::duplex(4096);
        let server = tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            server_side.write_all(b"220 mx.example.com ready\r\n").await.unwrap();
            let mut buf = [0u8; 128];
            let n = server_side.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"LHLO me.example.com\r\n");
            server_side
                .write_all(b"250-mx.example.com\r\n250-8BITMIME\r\n250 PIPELINING\r\n")
                .await
                .unwrap();
        });

        let mut client = LmtpClient::with_stream(client_side, Duration::from_secs(5));
        let greeting = client.read_greeting().await.unwrap();
        assert_eq!(greeting.code, 220);
        client.lhlo("me.example.com", true).await.unwrap();
        assert!(client.has_capability("8BITMIME"));
        assert!(client.has_capability("pipelining"));
        assert!(!client.has_capability("XCLIENT"));
        server.await.unwrap();
    }
}
