use anyhow::{Context, Result};

use log::info;

use std::{
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use structopt::StructOpt;

use gpgex_ipc::{Client, Command, Locator, Session};
use gpgex_ipc::client::{Failure, Notifier};

mod logging;

#[derive(StructOpt)]
#[structopt(about = "Hands files to the GnuPG UI server (Kleopatra, GPA)")]
struct Cli {
    /// .env file containing GNUPGHOME, GPGEX_INSTALL_DIR,
    /// GPGEX_UI_SERVER, GPGEX_DEBUG_FILE
    #[structopt(long, parse(from_os_str))]
    env_file: Option<PathBuf>,
    /// GnuPG home directory (overrides GNUPGHOME)
    #[structopt(long, parse(from_os_str))]
    homedir: Option<PathBuf>,
    /// Gpg4win installation directory (overrides GPGEX_INSTALL_DIR)
    #[structopt(long, parse(from_os_str))]
    install_dir: Option<PathBuf>,
    /// Command line starting the UI server, relative to the
    /// installation directory; `$s` is replaced by the socket
    #[structopt(long)]
    ui_server: Option<String>,
    /// Appends debug logs to this file (overrides GPGEX_DEBUG_FILE)
    #[structopt(long, parse(from_os_str))]
    debug_file: Option<PathBuf>,
    /// Escapes colons in file names
    #[structopt(long)]
    escape_colons: bool,
    /// Parent window for the UI server's dialogs (decimal, or hex
    /// with 0x prefix)
    #[structopt(long, parse(try_from_str = parse_window_id))]
    window_id: Option<u64>,
    #[structopt(subcommand)]
    cmd: Subcommand,
}

#[derive(StructOpt)]
enum Subcommand {
    /// Decrypts and verifies the given files
    DecryptVerify(Files),
    /// Decrypts the given files
    Decrypt(Files),
    /// Verifies the given signatures
    Verify(Files),
    /// Encrypts and signs the given files
    EncryptSign(Files),
    /// Encrypts the given files
    Encrypt(Files),
    /// Signs the given files
    Sign(Files),
    /// Imports keys from the given files
    Import(Files),
    /// Creates checksums for the given files
    CreateChecksums(Files),
    /// Verifies the given checksum files
    VerifyChecksums(Files),
    /// Prints the UI server's socket
    Endpoint,
    /// Prints the command line used to start the UI server
    Locate,
    /// Prints the location of the manual
    HelpUrl {
        #[structopt(long, default_value = "en")]
        /// Language of the manual
        lang: String,
    },
    /// Sends raw Assuan commands to the UI server, and prints the
    /// data it returns
    Raw {
        /// Commands to send to the server
        #[structopt(required = true)]
        commands: Vec<String>,
    },
}

#[derive(StructOpt)]
struct Files {
    /// Files to operate on
    #[structopt(parse(from_os_str), required = true)]
    files: Vec<PathBuf>,
}

impl Subcommand {
    fn command(self) -> std::result::Result<(Command, Vec<PathBuf>), Self> {
        use self::Subcommand::*;
        Ok(match self {
            DecryptVerify(f) => (Command::DecryptVerify, f.files),
            Decrypt(f) => (Command::Decrypt, f.files),
            Verify(f) => (Command::Verify, f.files),
            EncryptSign(f) => (Command::EncryptSign, f.files),
            Encrypt(f) => (Command::Encrypt, f.files),
            Sign(f) => (Command::Sign, f.files),
            Import(f) => (Command::Import, f.files),
            CreateChecksums(f) => (Command::CreateChecksums, f.files),
            VerifyChecksums(f) => (Command::VerifyChecksums, f.files),
            other => return Err(other),
        })
    }
}

fn parse_window_id(s: &str) -> Result<u64> {
    let id = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    id.with_context(|| format!("Invalid window id {:?}", s))
}

/// Sets the variables in `file`.
///
/// Unlike `dotenv::from_filename`, an explicitly given file takes
/// precedence over the environment.
fn load_env_file(file: &Path) -> Result<()> {
    for item in dotenv::from_filename_iter(file)? {
        let (key, value) = item?;
        std::env::set_var(key, value);
    }
    Ok(())
}

/// Prints failures to stderr.
struct StderrNotifier;

impl Notifier for StderrNotifier {
    fn notify(&self, failure: &Failure) {
        eprintln!("{}: {}", failure.title(),
                  failure.to_string().replace("\r\n", "\n"));
    }
}

/// Shows failures in a message box.
#[cfg(windows)]
struct MessageBoxNotifier {
    window: Option<u64>,
}

#[cfg(windows)]
impl Notifier for MessageBoxNotifier {
    fn notify(&self, failure: &Failure) {
        use std::ffi::OsStr;
        use std::os::windows::ffi::OsStrExt;
        use winapi::shared::windef::HWND;
        use winapi::um::winuser::{MessageBoxW, MB_ICONINFORMATION};

        fn wide(s: &str) -> Vec<u16> {
            OsStr::new(s).encode_wide().chain(Some(0)).collect()
        }

        let text = wide(&failure.to_string());
        let title = wide(failure.title());
        let parent = self.window.unwrap_or(0) as usize as HWND;
        // Safety: Both strings are NUL terminated and outlive the call.
        unsafe {
            MessageBoxW(parent, text.as_ptr(), title.as_ptr(),
                        MB_ICONINFORMATION);
        }
    }
}

#[cfg(windows)]
fn notifier(window: Option<u64>) -> Arc<dyn Notifier> {
    if window.is_some() {
        Arc::new(MessageBoxNotifier { window })
    } else {
        Arc::new(StderrNotifier)
    }
}

#[cfg(not(windows))]
fn notifier(_window: Option<u64>) -> Arc<dyn Notifier> {
    Arc::new(StderrNotifier)
}

fn main() -> Result<()> {
    let cli = Cli::from_args();

    if let Some(file) = &cli.env_file {
        load_env_file(file)
            .with_context(|| format!("Loading {}", file.display()))?;
    }

    let mut config = gpgex_ipc::Context::configure()
        .escape_colons(cli.escape_colons);
    if let Some(homedir) = &cli.homedir {
        config = config.homedir(homedir);
    }
    if let Some(dir) = &cli.install_dir {
        config = config.install_dir(dir);
    }
    if let Some(cmdline) = cli.ui_server {
        config = config.ui_server(cmdline);
    }
    if let Some(file) = &cli.debug_file {
        config = config.debug_file(file);
    }
    let ctx = config.build();

    logging::init(ctx.debug_file())?;
    let locator = Arc::new(Locator::new(ctx));
    let window = cli.window_id;

    let cmd = match cli.cmd.command() {
        Ok((command, files)) => {
            info!("gpgex {} on {} files", command, files.len());
            let client = Client::new(locator)
                .window(window)
                .notifier(notifier(window));
            let worker = client.dispatch(command, files)
                .context("Starting the worker thread")?;
            let ok = worker.join()
                .map_err(|_| anyhow::anyhow!("The worker thread panicked"))?;
            if ! ok {
                std::process::exit(1);
            }
            return Ok(());
        },
        Err(cmd) => cmd,
    };

    match cmd {
        Subcommand::Endpoint => {
            let endpoint = locator.endpoint()
                .ok_or(gpgex_ipc::Error::InvalidEndpoint)?;
            println!("{}", endpoint.display());
        },
        Subcommand::Locate => {
            let launch = locator.require_launch()?;
            println!("{}", launch);
        },
        Subcommand::HelpUrl { lang } => {
            println!("{}", locator.help_url(&lang));
        },
        Subcommand::Raw { commands } => {
            let mut session = Session::connect(&locator, window)
                .context("Could not connect to the UI server")?;
            let stdout = std::io::stdout();
            let mut stdout = stdout.lock();
            for command in commands {
                eprintln!("> {}", command);
                let data = session.transact(&command)?;
                stdout.write_all(&data)?;
            }
            session.close();
        },
        _ => unreachable!("file commands are handled above"),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_ids() {
        assert_eq!(parse_window_id("1234").unwrap(), 1234);
        assert_eq!(parse_window_id("0x1234").unwrap(), 0x1234);
        assert_eq!(parse_window_id("0XfF").unwrap(), 0xff);
        assert!(parse_window_id("0x").is_err());
        assert!(parse_window_id("window").is_err());
    }

    #[test]
    fn subcommands() {
        let cli = Cli::from_iter(&["gpgex", "--window-id", "0x10",
                                   "sign", "a", "b"]);
        assert_eq!(cli.window_id, Some(16));
        match cli.cmd.command() {
            Ok((command, files)) => {
                assert_eq!(command, Command::Sign);
                assert_eq!(files, vec![PathBuf::from("a"),
                                       PathBuf::from("b")]);
            },
            Err(_) => panic!("expected a file command"),
        }

        let cli = Cli::from_iter(&["gpgex", "help-url"]);
        assert!(matches!(cli.cmd.command(),
                         Err(Subcommand::HelpUrl { ref lang }) if lang == "en"));

        assert!(Cli::from_iter_safe(&["gpgex", "decrypt"]).is_err());
    }
}
