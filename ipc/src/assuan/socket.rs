//! Select functionality from [assuan-socket.c].
//!
//! [assuan-socket.c]: https://github.com/gpg/libassuan/blob/master/src/assuan-socket.c
//!
//! Connecting is done synchronously, so that the caller can retry
//! without a runtime.  The resulting stream is handed to Tokio
//! afterwards.

// Makes writing platform-specific code less verbose (less #[cfgs] everywhere)
#![allow(dead_code, unused_imports)]

use std::io::{Write, Read};
use std::path::Path;
use std::fs::File;

use anyhow::anyhow;

use crate::Result;

#[cfg(windows)]
pub(crate) type IpcStream = tokio::net::TcpStream;
#[cfg(unix)]
pub(crate) type IpcStream = tokio::net::UnixStream;

#[cfg(windows)]
pub(crate) type StdIpcStream = std::net::TcpStream;
#[cfg(unix)]
pub(crate) type StdIpcStream = std::os::unix::net::UnixStream;

/// Connects to a local socket.
///
/// Supports regular local domain sockets under Unix-like systems and
/// either Cygwin or libassuan's socket emulation on Windows.
pub(crate) fn connect(path: impl AsRef<Path>) -> Result<StdIpcStream> {
    #[cfg(unix)]
    {
        Ok(std::os::unix::net::UnixStream::connect(path)?)
    }
    #[cfg(windows)]
    {
        use std::net::{Ipv4Addr, TcpStream};

        let Rendezvous { port, uds_emulation, nonce } =
            read_port_and_nonce(path.as_ref())?;

        let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port))?;
        stream.set_nodelay(true)?;

        // Authorize ourselves with the nonce from the file.
        stream.write_all(&nonce)?;

        if let UdsEmulation::Cygwin = uds_emulation {
            cygwin_handshake(&mut stream)?;
        }
        Ok(stream)
    }
}

/// Hands a connected stream over to Tokio.
///
/// # Panic
///
/// This function panics if not called from within a Tokio runtime.
pub(crate) fn into_async(stream: StdIpcStream) -> Result<IpcStream> {
    stream.set_nonblocking(true)?;
    Ok(IpcStream::from_std(stream)?)
}

/// Exchanges credentials as expected by libassuan's Cygwin emulation.
fn cygwin_handshake<S: Read + Write>(stream: &mut S) -> Result<()> {
    // The server echoes the nonce, which is of no use to us.
    stream.read_exact(&mut [0u8; 16])?;

    // Our credentials: [pid | uid | gid], uid = gid = 0.
    let mut creds = [0u8; 12];
    creds[..4].copy_from_slice(&std::process::id().to_ne_bytes());
    // libassuan reads 8 bytes here, but the server only makes
    // progress once a complete `ucred` (three u32s) was written.
    stream.write_all(&creds)?;

    // The server's credentials.  We don't need them.
    stream.read_exact(&mut [0u8; 12])?;
    Ok(())
}

/// Socket connection data.
#[derive(Debug)]
struct Rendezvous {
    port: u16,
    uds_emulation: UdsEmulation,
    nonce: [u8; 16],
}

/// Unix domain socket emulation type (Windows only).
///
/// Until Windows 10 Update 1803, Windows did not support native UNIX
/// domain sockets.  libassuan emulates them using a TCP connection to
/// localhost and an authentication nonce stored in the socket file.
#[derive(Debug)]
enum UdsEmulation {
    /// Cygwin socket emulation.
    ///
    /// File format: `!<socket >%u %c %08x-%08x-%08x-%08x` (scanf style)
    /// %u: local TCP port
    /// %c: socket type ("s" for `SOCK_STREAM`, "d" for `SOCK_DGRAM`)
    /// %08x-%08x-%08x-%08x: authentication nonce
    Cygwin,
    /// Libassuan's custom socket emulation.
    ///
    /// File format: `<PORT>\n<NONCE>`
    /// PORT: textual local TCP port (e.g. "12345")
    /// NONCE: raw 16-byte authentication nonce
    Libassuan,
}

/// Reads socket connection info from a file emulating a Unix socket.
///
/// Inspired by `read_port_and nonce` from assuan-socket.c.
fn read_port_and_nonce(fname: &Path) -> Result<Rendezvous> {
    let mut file = File::open(fname)?;
    // Either a <= 54 byte long Cygwin description or ~5+1+16 bytes
    // in libassuan's own format.
    let mut contents = Vec::with_capacity(64);
    file.read_to_end(&mut contents)?;

    parse_rendezvous(&contents)
}

fn parse_rendezvous(contents: &[u8]) -> Result<Rendezvous> {
    match std::str::from_utf8(contents).ok()
        .and_then(|buf| buf.strip_prefix("!<socket >"))
    {
        Some(cygwin) => parse_cygwin(cygwin),
        None => parse_libassuan(contents),
    }
}

/// Parses `%u %c %08x-%08x-%08x-%08x`, optionally NUL terminated.
fn parse_cygwin(buf: &str) -> Result<Rendezvous> {
    let buf = buf.strip_suffix('\x00').unwrap_or(buf);
    let mut fields = buf.split_terminator(' ');
    let (port, nonce) = match (fields.next(), fields.next(), fields.next()) {
        (Some(port), Some("s"), Some(nonce)) => (port.parse()?, nonce),
        _ => return Err(anyhow!("Couldn't parse Cygwin socket: {}", buf)),
    };

    let dwords = nonce.split_terminator('-')
        .map(|dword| u32::from_str_radix(dword, 16))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| anyhow!("Couldn't parse Cygwin socket nonce: {}", nonce))?;
    if dwords.len() < 4 {
        return Err(anyhow!("Couldn't parse Cygwin socket nonce: {}", nonce));
    }

    let mut bytes = [0u8; 16];
    for (chunk, dword) in bytes.chunks_mut(4).zip(dwords) {
        chunk.copy_from_slice(&dword.to_ne_bytes());
    }
    Ok(Rendezvous { port, nonce: bytes, uds_emulation: UdsEmulation::Cygwin })
}

/// Parses `[<whitespace>?, port, .., '\n', <16 byte nonce>]`.
fn parse_libassuan(contents: &[u8]) -> Result<Rendezvous> {
    let pos = match contents.iter().position(|&x| x == b'\n') {
        Some(pos) if pos + 1 + 16 == contents.len() => pos,
        _ => return Err(anyhow!("Malformed socket description: {:?}",
                                contents)),
    };
    let port = std::str::from_utf8(&contents[..pos])?.trim().parse()?;
    let mut nonce = [0u8; 16];
    nonce.copy_from_slice(&contents[pos + 1..]);

    Ok(Rendezvous { port, nonce, uds_emulation: UdsEmulation::Libassuan })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendezvous_files() {
        assert!(parse_rendezvous(b"\t 12 \n1234567890123456").is_ok());
        assert!(parse_rendezvous(b"\t 12 \n123456789012345").is_err());
        assert!(parse_rendezvous(b"\t 12 \n12345678901234567").is_err());
        assert!(parse_rendezvous(b"no newline").is_err());

        assert!(matches!(
            parse_rendezvous(b"  12345\n\x00\x01\x02\x03\x04\x05\x06\x07\x08\x09\x0A\x0B\x0C\x0D\x0E\x0F"),
            Ok(Rendezvous {
                port: 12345,
                uds_emulation: UdsEmulation::Libassuan,
                nonce: [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15],
            })
        ));
        assert!(parse_rendezvous(
            b"  -152\n\x00\x01\x02\x03\x04\x05\x06\x07\x08\x09\x0A\x0B\x0C\x0D\x0E\x0F")
                .is_err());

        let expected_nonce = [
            0xDD, 0xCC, 0xBB, 0xAA,
            0xAA, 0xBB, 0xCC, 0xDD,
            0x67, 0x45, 0x23, 0x01,
            0xDE, 0xBC, 0x0A, 0x89,
        ];
        for description in &[
            &b"!<socket >12345 s AABBCCDD-DDCCBBAA-01234567-890ABCDE\x00"[..],
            &b"!<socket >12345 s AABBCCDD-DDCCBBAA-01234567-890ABCDE"[..],
        ] {
            let r = parse_rendezvous(description).unwrap();
            assert_eq!(r.port, 12345);
            assert!(matches!(r.uds_emulation, UdsEmulation::Cygwin));
            if cfg!(target_endian = "little") {
                assert_eq!(r.nonce, expected_nonce);
            }
        }

        assert!(parse_rendezvous(b"!<socket >12345 d AABBCCDD").is_err());
        assert!(parse_rendezvous(b"!<socket >12345 s AABBCCDD-XX").is_err());
    }

    #[test]
    fn cygwin_credentials() {
        struct Peer {
            input: std::io::Cursor<Vec<u8>>,
            output: Vec<u8>,
        }
        impl Read for Peer {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                self.input.read(buf)
            }
        }
        impl Write for Peer {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.output.write(buf)
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let mut peer = Peer {
            input: std::io::Cursor::new(vec![0; 16 + 12]),
            output: Vec::new(),
        };
        cygwin_handshake(&mut peer).unwrap();
        assert_eq!(peer.output.len(), 12);
        assert_eq!(&peer.output[..4], &std::process::id().to_ne_bytes());

        // The server hangs up before sending its credentials.
        let mut peer = Peer {
            input: std::io::Cursor::new(vec![0; 16]),
            output: Vec::new(),
        };
        assert!(cygwin_handshake(&mut peer).is_err());
    }
}
