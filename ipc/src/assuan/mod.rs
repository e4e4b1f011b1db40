//! Assuan RPC support.

#![warn(missing_docs)]

use std::mem;
use std::path::Path;
use std::pin::Pin;
use std::task::{Poll, Context};

use futures::{Future, Stream, StreamExt};
use tokio::io::{BufReader, ReadHalf, WriteHalf};
use tokio::io::{AsyncRead, AsyncWriteExt, ReadBuf};

use crate::Error;
use crate::Result;

mod escape;
pub use self::escape::{Escaping, percent_escape, percent_unescape};
mod socket;
pub(crate) use self::socket::StdIpcStream;
use self::socket::IpcStream;
pub(crate) use self::socket::connect as connect_socket;

// Controls tracing.
const TRACE: bool = false;

/// Maximum line length of the reference implementation.
pub const MAX_LINE_LENGTH: usize = 1000;

/// A connection to an Assuan server.
///
/// Commands may be issued using [`Client::send`].  Note that the
/// command is sent lazily, i.e. it is only sent if you poll for the
/// responses.
///
/// `Client` implements [`Stream`] to return all server responses
/// until the first [`Response::Ok`], [`Response::Error`], or
/// [`Response::Inquire`].
///
/// [`Response::Ok`] and [`Response::Error`] indicate success and
/// failure.  [`Response::Inquire`] means that the server requires
/// more information to complete the request.  We never have any, so
/// the operation can only be canceled using [`Client::cancel()`].
///
/// For the common case of sending one command and waiting for its
/// outcome, use [`Client::transact`].
pub struct Client {
    r: BufReader<ReadHalf<IpcStream>>,
    buffer: Vec<u8>,
    done: bool,
    w: WriteState,
}
assert_send_and_sync!(Client);

enum WriteState {
    Ready(WriteHalf<IpcStream>),
    Sending(Pin<Box<dyn Future<Output = Result<WriteHalf<IpcStream>>>
                    + Send + Sync>>),
    Transitioning,
    Dead,
}

impl Client {
    /// Connects to the server.
    pub async fn connect<P>(path: P) -> Result<Client> where P: AsRef<Path> {
        Self::from_std(socket::connect(path)?).await
    }

    /// Completes the connection on an already connected socket.
    ///
    /// This consumes the server's greeting.
    pub(crate) async fn from_std(stream: StdIpcStream) -> Result<Client> {
        let connection = socket::into_async(stream)?;
        ConnectionFuture::new(connection).await
    }

    /// Lazily sends a command to the server.
    ///
    /// For the command to be actually executed, stream the responses
    /// using this objects [`Stream`] implementation.
    ///
    /// The response stream ends in either a [`Response::Ok`],
    /// [`Response::Error`], or [`Response::Inquire`].
    ///
    /// Note: `command` is passed as-is.  Arguments must be
    /// %-escaped, see [`Escaping`].  Commands longer than
    /// [`MAX_LINE_LENGTH`] are rejected.
    pub fn send<'a, C: 'a>(&'a mut self, command: C) -> Result<()>
        where C: AsRef<[u8]>
    {
        if let WriteState::Sending(_) = self.w {
            return Err(Error::ProtocolError(
                "Busy, poll responses first".into()).into());
        }
        if let WriteState::Dead = self.w {
            return Err(Error::ConnectionClosed(Vec::new()).into());
        }

        let command = command.as_ref();
        let command = command.strip_suffix(b"\n").unwrap_or(command);
        if command.len() > MAX_LINE_LENGTH {
            return Err(Error::ProtocolError(format!(
                "Line too long ({} bytes, at most {} are allowed)",
                command.len(), MAX_LINE_LENGTH)).into());
        }
        let mut c = command.to_vec();
        c.push(0x0a);

        self.w =
            match mem::replace(&mut self.w, WriteState::Transitioning)
        {
            WriteState::Ready(mut sink) => {
                WriteState::Sending(Box::pin(async move {
                    sink.write_all(&c).await?;
                    Ok(sink)
                }))
            },
            _ => unreachable!(),
        };

        Ok(())
    }

    /// Lazily cancels a pending operation.
    ///
    /// For the command to be actually executed, stream the responses
    /// using this objects [`Stream`] implementation.
    pub fn cancel(&mut self) -> Result<()> {
        self.send("CAN")
    }

    /// Sends a command and waits for its outcome.
    ///
    /// Returns the data sent by the server, if any.  Status and
    /// comment lines are ignored.  If the server rejects the command,
    /// [`Error::OperationFailed`] is returned.  Inquiries are
    /// canceled and reported as protocol errors.
    pub async fn transact<C>(&mut self, command: C) -> Result<Vec<u8>>
        where C: AsRef<[u8]>
    {
        tracer!(TRACE, "Client::transact");
        t!("> {}", String::from_utf8_lossy(command.as_ref()));

        self.send(command)?;
        let mut data = Vec::new();
        let mut outcome = None;
        let mut inquiry = None;
        while let Some(response) = self.next().await {
            let response = response?;
            t!("< {:?}", response);
            match response {
                Response::Ok { .. } =>
                    outcome = Some(Ok(())),
                Response::Error { code, message } =>
                    outcome = Some(Err(Error::OperationFailed { code, message })),
                Response::Data { partial } =>
                    data.extend_from_slice(&partial),
                Response::Status { .. } | Response::Comment { .. } =>
                    (), // Ignore.
                Response::Inquire { keyword, .. } =>
                    inquiry = Some(keyword),
            }
        }

        if let Some(keyword) = inquiry {
            // We have nothing to give.  The server answers the
            // cancellation with an error for the original command.
            self.cancel()?;
            while let Some(response) = self.next().await {
                let response = response?;
                t!("< {:?}", response);
            }
            return Err(Error::ProtocolError(format!(
                "Unexpected inquiry {:?}", keyword)).into());
        }

        match outcome {
            Some(Ok(())) => Ok(data),
            Some(Err(e)) => Err(e.into()),
            None => Err(Error::ConnectionClosed(Vec::new()).into()),
        }
    }
}

/// A future that will resolve to a `Client`.
struct ConnectionFuture(Option<Client>);

impl ConnectionFuture {
    fn new(c: IpcStream) -> Self {
        let (r, w) = tokio::io::split(c);
        let buffer = Vec::with_capacity(MAX_LINE_LENGTH);
        Self(Some(Client {
            r: BufReader::new(r), buffer, done: false,
            w: WriteState::Ready(w)
        }))
    }
}

impl Future for ConnectionFuture {
    type Output = Result<Client>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // Consume the initial message from the server.
        let client = match self.0.as_mut() {
            Some(client) => client,
            None => return Poll::Ready(Err(Error::HandshakeFailed(
                "Polled after completion".into()).into())),
        };
        let mut responses = client.by_ref().collect::<Vec<_>>();

        match Pin::new(&mut responses).poll(cx) {
            Poll::Ready(response) => {
                Poll::Ready(match response.into_iter().last() {
                    Some(Ok(Response::Ok { .. })) =>
                        self.0.take().ok_or_else(|| Error::HandshakeFailed(
                            "Polled after completion".into()).into()),
                    Some(Ok(Response::Error { code, message })) =>
                        Err(Error::HandshakeFailed(
                            format!("Error {}: {:?}", code, message)).into()),
                    Some(Err(e)) => Err(e),
                    l @ Some(_) =>
                        Err(Error::HandshakeFailed(
                            format!("Unexpected server response: {:?}", l)
                        ).into()),
                    None =>
                        Err(Error::HandshakeFailed(
                            "No data received from server".into()).into()),
                })
            },
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Stream for Client {
    type Item = Result<Response>;

    /// Attempt to pull out the next value of this stream, returning
    /// None if the stream is finished.
    ///
    /// Note: It _is_ safe to call this again after the stream
    /// finished, i.e. returned `Ready(None)`.
    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        // First, handle sending of the command.
        if let WriteState::Sending(_) = self.w {
            self.w = match mem::replace(&mut self.w, WriteState::Transitioning) {
                WriteState::Sending(mut f) => match f.as_mut().poll(cx) {
                    Poll::Ready(Ok(sink)) => WriteState::Ready(sink),
                    Poll::Pending => WriteState::Sending(f),
                    Poll::Ready(Err(e)) => {
                        self.w = WriteState::Dead;
                        return Poll::Ready(Some(Err(e)));
                    },
                },
                _ => unreachable!(),
            };
        }

        // Recheck if we are still sending the command.
        if let WriteState::Sending(_) = self.w {
            return Poll::Pending;
        }

        // Check if the previous response was one of ok, error, or
        // inquire.
        if self.done {
            // If so, we signal end of stream here.
            self.done = false;
            return Poll::Ready(None);
        }

        // Disjoint borrows through Pin are not possible, so unwrap it.
        let Self { buffer, done, r, .. } = Pin::into_inner(self);
        let mut reader = Pin::new(r);
        loop {
            // Try to yield a line from the buffer.
            if let Some(p) = buffer.iter().position(|&b| b == 0x0a) {
                let line: Vec<u8> = buffer.drain(..p+1).collect();
                let line = &line[..line.len() - 1];
                let line = line.strip_suffix(b"\r").unwrap_or(line);
                let r = Response::parse(line)?;
                // If this response is one of ok, error, or inquire,
                // we surrender control to the caller the next time
                // it asks for an item.
                *done = r.is_done();
                return Poll::Ready(Some(Ok(r)));
            }

            // No more linebreaks in the buffer.  We need to get more.
            let mut chunk = [0u8; MAX_LINE_LENGTH];
            let mut read_buf = ReadBuf::new(&mut chunk);
            match reader.as_mut().poll_read(cx, &mut read_buf)? {
                Poll::Ready(()) if read_buf.filled().is_empty() => {
                    // EOF.
                    if ! buffer.is_empty() {
                        // Incomplete server response.
                        return Poll::Ready(Some(Err(Error::ConnectionClosed(
                            mem::take(buffer)).into())));
                    }

                    // End of stream.
                    return Poll::Ready(None);
                },

                Poll::Ready(()) => {
                    buffer.extend_from_slice(read_buf.filled());
                    continue;
                },

                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Server response.
#[derive(Debug, PartialEq)]
pub enum Response {
    /// Operation successful.
    Ok {
        /// Optional human-readable message.
        message: Option<String>,
    },
    /// An error occurred.
    Error {
        /// Error code.
        ///
        /// This code is defined in `libgpg-error`.
        code: usize,
        /// Optional human-readable message.
        message: Option<String>,
    },
    /// Information about the ongoing operation.
    Status {
        /// Indicates what the status message is about.
        keyword: String,
        /// Human-readable message.
        message: String,
    },
    /// A comment for debugging purposes.
    Comment {
        /// Human-readable message.
        message: String,
    },
    /// Raw data returned to the client.
    Data {
        /// A chunk of raw data.
        ///
        /// Consecutive `Data` responses must be joined.
        partial: Vec<u8>,
    },
    /// Request for information from the client.
    Inquire {
        /// The subject of the inquiry.
        keyword: String,
        /// Optional parameters.
        parameters: Option<Vec<u8>>,
    },
}

/// Splits `line` at the first space.
fn split_word(line: &[u8]) -> (&[u8], Option<&[u8]>) {
    match line.iter().position(|&c| c == b' ') {
        Some(p) => (&line[..p], Some(&line[p + 1..])),
        None => (line, None),
    }
}

/// Turns an optional trailing text into a message.
fn message(rest: Option<&[u8]>) -> Option<String> {
    rest.map(|m| String::from_utf8_lossy(m).trim().to_string())
        .filter(|m| ! m.is_empty())
}

impl Response {
    /// Parses the given response.
    ///
    /// `line` must not include the line terminator.
    pub fn parse(line: &[u8]) -> Result<Response> {
        let malformed = || -> anyhow::Error {
            Error::ProtocolError(format!(
                "Malformed response: {:?}",
                String::from_utf8_lossy(line))).into()
        };

        if let Some(comment) = line.strip_prefix(b"#") {
            return Ok(Response::Comment {
                message: String::from_utf8_lossy(comment).trim().to_string(),
            });
        }

        let (verb, rest) = split_word(line);
        match verb {
            b"OK" => Ok(Response::Ok { message: message(rest) }),
            b"ERR" => {
                let (code, text) = split_word(rest.ok_or_else(malformed)?);
                let code = std::str::from_utf8(code).ok()
                    .and_then(|c| c.parse::<usize>().ok())
                    .ok_or_else(malformed)?;
                Ok(Response::Error { code, message: message(text) })
            },
            b"S" => {
                let (keyword, text) = split_word(rest.ok_or_else(malformed)?);
                if keyword.is_empty() {
                    return Err(malformed());
                }
                Ok(Response::Status {
                    keyword: String::from_utf8_lossy(keyword).into(),
                    message: message(text).unwrap_or_default(),
                })
            },
            b"D" => Ok(Response::Data {
                partial: percent_unescape(rest.unwrap_or(b""))?,
            }),
            b"INQUIRE" => {
                let (keyword, parameters) =
                    split_word(rest.ok_or_else(malformed)?);
                if keyword.is_empty() {
                    return Err(malformed());
                }
                Ok(Response::Inquire {
                    keyword: String::from_utf8_lossy(keyword).into(),
                    parameters: parameters.filter(|p| ! p.is_empty())
                        .map(|p| p.to_vec()),
                })
            },
            _ => Err(malformed()),
        }
    }

    /// Returns true if this message indicates success.
    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Ok { .. } )
    }

    /// Returns true if this message indicates an error.
    pub fn is_err(&self) -> bool {
        matches!(self, Response::Error { .. })
    }

    /// Returns true if this message is an inquiry.
    pub fn is_inquire(&self) -> bool {
        matches!(self, Response::Inquire { .. })
    }

    /// Returns true if this response concludes the server's response.
    pub fn is_done(&self) -> bool {
        // All server responses end in either OK or ERR.  The server
        // may also inquire more information, and we surrender control
        // to the caller to allow it to respond.
        self.is_ok() || self.is_err() || self.is_inquire()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basics() {
        assert_eq!(
            Response::parse(b"OK Pleased to meet you, process 7745")
                .unwrap(),
            Response::Ok {
                message: Some("Pleased to meet you, process 7745".into()),
            });
        assert_eq!(
            Response::parse(b"OK").unwrap(),
            Response::Ok { message: None });
        assert_eq!(
            Response::parse(b"ERR 67109139 Unknown IPC command <GPG Agent>")
                .unwrap(),
            Response::Error {
                code: 67109139,
                message :Some("Unknown IPC command <GPG Agent>".into()),
            });
        assert_eq!(
            Response::parse(b"ERR 100").unwrap(),
            Response::Error { code: 100, message: None });

        let status =
          b"S KEYINFO 151BCDB0C293927B7E36660BE47F28DA8729BD19 D - - - C - - -";
        assert_eq!(
            Response::parse(status).unwrap(),
            Response::Status {
                keyword: "KEYINFO".into(),
                message:
                    "151BCDB0C293927B7E36660BE47F28DA8729BD19 D - - - C - - -"
                    .into(),
            });

        assert_eq!(
            Response::parse(b"D 4711").unwrap(),
            Response::Data { partial: b"4711".to_vec() });
        assert_eq!(
            Response::parse(b"D (7:sig-val(3:rsa(1:s1:%25%0D)))")
                .unwrap(),
            Response::Data {
                partial: b"(7:sig-val(3:rsa(1:s1:%\x0d)))".to_vec(),
            });

        assert_eq!(
            Response::parse(b"INQUIRE CIPHERTEXT")
                .unwrap(),
            Response::Inquire {
                keyword: "CIPHERTEXT".into(),
                parameters: None,
            });
        assert_eq!(
            Response::parse(b"# Home: /home/alice/.gnupg").unwrap(),
            Response::Comment { message: "Home: /home/alice/.gnupg".into() });
    }

    #[test]
    fn malformed() {
        assert!(Response::parse(b"").is_err());
        assert!(Response::parse(b"HELLO").is_err());
        assert!(Response::parse(b"ERR").is_err());
        assert!(Response::parse(b"ERR x broken").is_err());
        assert!(Response::parse(b"S").is_err());
        assert!(Response::parse(b"D %4").is_err());
        assert!(Response::parse(b"INQUIRE").is_err());
    }

    #[test]
    fn done() {
        assert!(Response::parse(b"OK").unwrap().is_done());
        assert!(Response::parse(b"ERR 1").unwrap().is_done());
        assert!(Response::parse(b"INQUIRE PIN").unwrap().is_done());
        assert!(! Response::parse(b"S PROGRESS 1").unwrap().is_done());
        assert!(! Response::parse(b"D data").unwrap().is_done());
    }
}
