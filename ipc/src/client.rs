//! One operation per user command.
//!
//! The shell integration hands us a command and the files the user
//! selected.  We turn that into a [`Request`], send it to the UI
//! server over a fresh [`Session`], and report failures using a
//! [`Notifier`].
//!
//! # Examples
//!
//! ```no_run
//! # use gpgex_ipc::{Client, Locator};
//! # fn main() -> gpgex_ipc::Result<()> {
//! let client = Client::new(Locator::global());
//! let worker = client.decrypt_verify(vec!["C:\\docs\\a.txt.gpg".into()])?;
//! // The request is processed in the background.
//! let ok = worker.join().unwrap_or(false);
//! # let _ = ok;
//! # Ok(()) }
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::assuan::Escaping;
use crate::ErrorKind;
use crate::Locator;
use crate::Result;
use crate::Session;

/// Title of user-visible notifications.
pub const PRODUCT: &str = "GpgEX";

/// Menu offset of the help entry.
pub const HELP_MENU_ID: u32 = 0;

/// Commands offered to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Decrypts and verifies files.
    DecryptVerify,
    /// Decrypts files.
    Decrypt,
    /// Verifies signatures.
    Verify,
    /// Encrypts and signs files.
    EncryptSign,
    /// Encrypts files.
    Encrypt,
    /// Signs files.
    Sign,
    /// Imports keys.
    Import,
    /// Creates checksum files.
    CreateChecksums,
    /// Verifies checksum files.
    VerifyChecksums,
}

const COMMANDS: [Command; 9] = [
    Command::DecryptVerify,
    Command::Decrypt,
    Command::Verify,
    Command::EncryptSign,
    Command::Encrypt,
    Command::Sign,
    Command::Import,
    Command::CreateChecksums,
    Command::VerifyChecksums,
];

impl Command {
    /// Returns all commands, in menu order.
    pub fn all() -> &'static [Command] {
        &COMMANDS
    }

    /// Returns the Assuan command triggering this operation.
    pub fn verb(&self) -> &'static str {
        use self::Command::*;
        match self {
            DecryptVerify => "DECRYPT_VERIFY_FILES",
            Decrypt => "DECRYPT_FILES",
            Verify => "VERIFY_FILES",
            EncryptSign => "ENCRYPT_SIGN_FILES",
            Encrypt => "ENCRYPT_FILES",
            Sign => "SIGN_FILES",
            Import => "IMPORT_FILES",
            CreateChecksums => "CHECKSUM_CREATE_FILES",
            VerifyChecksums => "CHECKSUM_VERIFY_FILES",
        }
    }

    /// Returns the command's name, e.g. `decrypt-verify`.
    pub fn name(&self) -> &'static str {
        use self::Command::*;
        match self {
            DecryptVerify => "decrypt-verify",
            Decrypt => "decrypt",
            Verify => "verify",
            EncryptSign => "encrypt-sign",
            Encrypt => "encrypt",
            Sign => "sign",
            Import => "import",
            CreateChecksums => "create-checksums",
            VerifyChecksums => "verify-checksums",
        }
    }

    /// Maps a context menu offset to a command.
    ///
    /// Offset [`HELP_MENU_ID`] is the help entry, which is not a
    /// command.
    pub fn from_menu_id(id: u32) -> Option<Command> {
        match id {
            1..=9 => Some(COMMANDS[id as usize - 1]),
            _ => None,
        }
    }

    /// Returns the context menu offset of this command.
    pub fn menu_id(&self) -> u32 {
        COMMANDS.iter().position(|c| c == self)
            .map(|p| p as u32 + 1)
            .unwrap_or(HELP_MENU_ID)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Command {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        COMMANDS.iter()
            .find(|c| c.name() == s)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Unknown command {:?}", s))
    }
}

/// The lines sent to the UI server for one command.
///
/// One `FILE` line per input file, in order, followed by the command
/// itself with `--nohup`, so that the server acknowledges the request
/// right away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    command: Command,
    lines: Vec<Vec<u8>>,
}

impl Request {
    /// Builds the request for `command` on `files`.
    pub fn new<P: AsRef<Path>>(command: Command, files: &[P],
                               escaping: Escaping)
                               -> Self
    {
        let mut lines = Vec::with_capacity(files.len() + 1);
        for file in files {
            let mut line = b"FILE ".to_vec();
            line.extend_from_slice(&escaping.escape(&path_bytes(file.as_ref())));
            lines.push(line);
        }
        lines.push(format!("{} --nohup", command.verb()).into_bytes());
        Request { command, lines }
    }

    /// Returns the command.
    pub fn command(&self) -> Command {
        self.command
    }

    /// Returns the lines to send, in order.
    pub fn lines(&self) -> &[Vec<u8>] {
        &self.lines
    }
}

#[cfg(unix)]
fn path_bytes(path: &Path) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    path.as_os_str().as_bytes().to_vec()
}

#[cfg(not(unix))]
fn path_bytes(path: &Path) -> Vec<u8> {
    path.to_string_lossy().into_owned().into_bytes()
}

/// Describes why a command failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    /// The command that failed.
    pub command: Command,
    /// What kind of error occurred.
    pub kind: ErrorKind,
    /// The low-level error message.
    pub message: String,
}

impl Failure {
    /// Describes `err`, which occurred while executing `command`.
    pub fn new(command: Command, err: &anyhow::Error) -> Self {
        Failure {
            command,
            kind: ErrorKind::of(err),
            message: format!("{:#}", err),
        }
    }

    /// Returns the title for user-visible notifications.
    pub fn title(&self) -> &'static str {
        PRODUCT
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.kind.is_unreachable() {
            write!(f, "Can not connect to or start the UI server:\r\n{}",
                   self.message)
        } else {
            write!(f, "The UI server reported an error:\r\n{}",
                   self.message)
        }
    }
}

/// Tells the user that a command failed.
pub trait Notifier: Send + Sync {
    /// Reports `failure`.
    ///
    /// This is called from the worker thread executing the command,
    /// and may block.
    fn notify(&self, failure: &Failure);
}

/// Reports failures to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, failure: &Failure) {
        log::error!("{}: {} failed: {}", failure.title(), failure.command,
                    failure);
    }
}

/// Issues commands to the UI server.
#[derive(Clone)]
pub struct Client {
    locator: Arc<Locator>,
    window: Option<u64>,
    notifier: Arc<dyn Notifier>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Client")
            .field("locator", &self.locator)
            .field("window", &self.window)
            .finish()
    }
}

impl Client {
    /// Returns a client using `locator` to find the UI server.
    ///
    /// Failures are logged.
    pub fn new(locator: Arc<Locator>) -> Self {
        Client {
            locator,
            window: None,
            notifier: Arc::new(LogNotifier),
        }
    }

    /// Sets the window the command was invoked from.
    pub fn window(mut self, window: Option<u64>) -> Self {
        self.window = window;
        self
    }

    /// Sets how failures are reported.
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Executes `command` on `files`, and waits until the UI server
    /// accepted it.
    ///
    /// The session is closed when this returns, whether it succeeds
    /// or not.  Failures are returned, not reported.
    pub fn call<P: AsRef<Path>>(&self, command: Command, files: &[P])
                                -> Result<()>
    {
        let request = Request::new(command, files,
                                   self.locator.context().escaping());
        log::debug!("{} on {} files", command, files.len());

        let mut session = Session::connect(&self.locator, self.window)?;
        let result = session.send_request(request.lines());
        session.close();
        result
    }

    /// Executes `command` on `files` in the background.
    ///
    /// Returns as soon as the worker thread has been started.  The
    /// worker reports failures using the notifier.  Joining it
    /// returns whether the command was accepted.
    pub fn dispatch(&self, command: Command, files: Vec<PathBuf>)
                    -> Result<JoinHandle<bool>>
    {
        let client = self.clone();
        let worker = thread::Builder::new()
            .name(format!("gpgex-{}", command))
            .spawn(move || match client.call(command, &files[..]) {
                Ok(()) => true,
                Err(e) => {
                    let failure = Failure::new(command, &e);
                    log::debug!("{} failed: {}", command, failure.message);
                    client.notifier.notify(&failure);
                    false
                },
            })?;
        Ok(worker)
    }

    /// Decrypts and verifies `files`.
    pub fn decrypt_verify(&self, files: Vec<PathBuf>)
                          -> Result<JoinHandle<bool>> {
        self.dispatch(Command::DecryptVerify, files)
    }

    /// Decrypts `files`.
    pub fn decrypt(&self, files: Vec<PathBuf>) -> Result<JoinHandle<bool>> {
        self.dispatch(Command::Decrypt, files)
    }

    /// Verifies `files`.
    pub fn verify(&self, files: Vec<PathBuf>) -> Result<JoinHandle<bool>> {
        self.dispatch(Command::Verify, files)
    }

    /// Encrypts and signs `files`.
    pub fn encrypt_sign(&self, files: Vec<PathBuf>)
                        -> Result<JoinHandle<bool>> {
        self.dispatch(Command::EncryptSign, files)
    }

    /// Encrypts `files`.
    pub fn encrypt(&self, files: Vec<PathBuf>) -> Result<JoinHandle<bool>> {
        self.dispatch(Command::Encrypt, files)
    }

    /// Signs `files`.
    pub fn sign(&self, files: Vec<PathBuf>) -> Result<JoinHandle<bool>> {
        self.dispatch(Command::Sign, files)
    }

    /// Imports keys from `files`.
    pub fn import(&self, files: Vec<PathBuf>) -> Result<JoinHandle<bool>> {
        self.dispatch(Command::Import, files)
    }

    /// Creates checksums for `files`.
    pub fn create_checksums(&self, files: Vec<PathBuf>)
                            -> Result<JoinHandle<bool>> {
        self.dispatch(Command::CreateChecksums, files)
    }

    /// Verifies the checksum files `files`.
    pub fn verify_checksums(&self, files: Vec<PathBuf>)
                            -> Result<JoinHandle<bool>> {
        self.dispatch(Command::VerifyChecksums, files)
    }
}
