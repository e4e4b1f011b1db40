//! Finds the UI server.
//!
//! There are two things to find: the rendezvous point the server
//! listens on, and the program to start if nobody listens there.
//! Both are derived from the [`Context`] and computed at most once
//! per [`Locator`].  Locating never touches the network and never
//! starts processes.
//!
//! # Examples
//!
//! ```
//! # use gpgex_ipc::{Context, Locator};
//! let ctx = Context::configure()
//!     .homedir("C:\\Users\\alice\\AppData\\Roaming\\gnupg")
//!     .build();
//! let locator = Locator::new(ctx);
//! assert_eq!(locator.endpoint().unwrap().to_str(),
//!            Some("C:\\Users\\alice\\AppData\\Roaming\\gnupg\\S.uiserver"));
//! ```

use std::env::consts::EXE_SUFFIX;
use std::fmt;
use std::path::{Path, PathBuf, MAIN_SEPARATOR};
use std::sync::Arc;

use once_cell::sync::{Lazy, OnceCell};

use crate::Context;
use crate::Error;
use crate::Result;
use crate::spawn;

// Controls tracing.
const TRACE: bool = false;

/// Name of the UI server's socket in the GnuPG home directory.
pub const SOCKET_NAME: &str = "S.uiserver";

/// Where help is found if the installation directory is unknown.
pub const HOMEPAGE: &str = "http://www.gpg4win.org/";

/// How to start the UI server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchDescriptor {
    /// The program to run.
    pub program: PathBuf,
    /// Its arguments.
    pub args: Vec<String>,
    /// The directory to start the program in, if any.
    pub working_dir: Option<PathBuf>,
}

impl LaunchDescriptor {
    /// Starts the UI server detached from the current process.
    pub fn spawn(&self) -> Result<()> {
        spawn::spawn_detached(&self.program, &self.args,
                              self.working_dir.as_deref())
    }
}

impl fmt::Display for LaunchDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&spawn::build_command_line(
            &self.program.to_string_lossy(), &self.args))
    }
}

/// A known UI server.
struct Candidate {
    /// Program name, relative to the installation directory, without
    /// extension.
    name: &'static [&'static str],
    /// Whether the socket has to be passed on the command line.
    wants_socket: bool,
}

/// Known UI servers, in order of preference.
const CANDIDATES: &[Candidate] = &[
    Candidate { name: &["bin", "kleopatra"], wants_socket: true },
    Candidate { name: &["bin", "launch-gpa"], wants_socket: false },
    Candidate { name: &["bin", "gpa"], wants_socket: false },
];

/// Finds the UI server's rendezvous point and how to start it.
///
/// Results are computed on first use and cached for the lifetime of
/// the `Locator`.
pub struct Locator {
    ctx: Context,
    endpoint: OnceCell<Option<PathBuf>>,
    launch: OnceCell<Option<LaunchDescriptor>>,
}
assert_send_and_sync!(Locator);

impl fmt::Debug for Locator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Locator")
            .field("ctx", &self.ctx)
            .field("endpoint", &self.endpoint.get())
            .field("launch", &self.launch.get())
            .finish()
    }
}

static GLOBAL: Lazy<Arc<Locator>> =
    Lazy::new(|| Arc::new(Locator::new(Context::new())));

impl Locator {
    /// Returns a locator for `ctx`.
    pub fn new(ctx: Context) -> Self {
        Locator {
            ctx,
            endpoint: OnceCell::new(),
            launch: OnceCell::new(),
        }
    }

    /// Returns the process-wide locator.
    ///
    /// It is configured from the process environment the first time
    /// it is used.
    pub fn global() -> Arc<Locator> {
        Arc::clone(&GLOBAL)
    }

    /// Returns the context.
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Returns the rendezvous point of the UI server.
    ///
    /// This is the file `S.uiserver` in the GnuPG home directory.
    /// Returns `None` if the home directory is unknown.
    pub fn endpoint(&self) -> Option<&Path> {
        self.endpoint.get_or_init(|| {
            let endpoint = self.ctx.homedir().and_then(endpoint_in);
            log::debug!("UI server endpoint: {:?}", endpoint);
            endpoint
        }).as_deref()
    }

    /// Returns how to start the UI server.
    ///
    /// If a `UI Server` command line is configured, it is used
    /// without further checks.  Otherwise, the known servers are
    /// looked up in the installation directory, and the first one
    /// that exists is used.  Returns `None` if the installation
    /// directory is unknown, or no server is found.
    pub fn launch(&self) -> Option<&LaunchDescriptor> {
        self.launch.get_or_init(|| match self.resolve_launch() {
            Ok(d) => {
                log::debug!("UI server: {}", d);
                Some(d)
            },
            Err(e) => {
                log::debug!("UI server: {}", e);
                None
            },
        }).as_ref()
    }

    /// Like [`Locator::launch`], but explains a failure.
    pub fn require_launch(&self) -> Result<&LaunchDescriptor> {
        if let Some(d) = self.launch() {
            return Ok(d);
        }
        Err(match self.resolve_launch() {
            Err(e) => e,
            // Should not happen, resolution is deterministic.
            Ok(_) => Error::ServerNotFound("unknown reason".into()).into(),
        })
    }

    fn resolve_launch(&self) -> Result<LaunchDescriptor> {
        tracer!(TRACE, "Locator::resolve_launch");
        let root = self.ctx.install_dir().ok_or_else(|| {
            Error::ServerNotFound(
                "the installation directory is unknown".into())
        })?;

        if let Some(cmdline) = self.ctx.ui_server() {
            return self.parse_override(root, cmdline);
        }

        for candidate in CANDIDATES {
            let mut program = root.to_path_buf();
            for (i, component) in candidate.name.iter().enumerate() {
                if i + 1 == candidate.name.len() {
                    program.push(format!("{}{}", component, EXE_SUFFIX));
                } else {
                    program.push(component);
                }
            }

            if ! program.is_file() {
                t!("{} does not exist", program.display());
                continue;
            }

            let mut args = Vec::new();
            if candidate.wants_socket {
                if let Some(endpoint) = self.endpoint() {
                    args.push("--uiserver-socket".into());
                    args.push(endpoint.to_string_lossy().into_owned());
                }
            }
            args.push("--daemon".into());

            return Ok(LaunchDescriptor {
                program,
                args,
                working_dir: Some(root.to_path_buf()),
            });
        }

        Err(Error::ServerNotFound(format!(
            "no UI server in {}", root.display())).into())
    }

    /// Interprets a `UI Server` command line.
    fn parse_override(&self, root: &Path, cmdline: &str)
                      -> Result<LaunchDescriptor>
    {
        let socket = self.endpoint()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        let cmdline = substitute(cmdline, &socket);

        let mut tokens = spawn::split_command_line(&cmdline)
            .map_err(|e| Error::ServerNotFound(e.to_string()))?
            .into_iter();
        let program = tokens.next().ok_or_else(|| {
            Error::ServerNotFound("the UI Server setting is empty".into())
        })?;

        Ok(LaunchDescriptor {
            program: root.join(program),
            args: tokens.collect(),
            working_dir: Some(root.to_path_buf()),
        })
    }

    /// Returns the URL of the manual in language `lang`.
    ///
    /// If the installation directory is unknown, the project's
    /// homepage is returned instead.
    pub fn help_url(&self, lang: &str) -> String {
        match self.ctx.install_dir() {
            None => HOMEPAGE.into(),
            Some(root) => {
                let root = root.to_string_lossy();
                let sep = if root.ends_with('\\') || root.ends_with('/') {
                    ""
                } else {
                    "\\"
                };
                format!("file:///{}{}share\\doc\\gpgex\\gpgex-{}.html",
                        root, sep, lang)
            },
        }
    }
}

/// Returns the socket's path in `homedir`.
///
/// Windows-style directories get a backslash regardless of the
/// platform we run on.
fn endpoint_in(homedir: &Path) -> Option<PathBuf> {
    let dir = homedir.to_string_lossy();
    if dir.is_empty() {
        return None;
    }

    let sep = if dir.contains('\\') { '\\' } else { MAIN_SEPARATOR };
    let mut endpoint = dir.into_owned();
    if ! endpoint.ends_with(sep) {
        endpoint.push(sep);
    }
    endpoint.push_str(SOCKET_NAME);
    Some(endpoint.into())
}

/// Replaces `$s` with the quoted socket name, and `$x` with `x`.
fn substitute(cmdline: &str, socket: &str) -> String {
    let mut result = String::with_capacity(cmdline.len() + socket.len());
    let mut chars = cmdline.chars();
    while let Some(c) = chars.next() {
        if c != '$' {
            result.push(c);
            continue;
        }
        match chars.next() {
            Some('s') => {
                result.push('"');
                result.push_str(socket);
                result.push('"');
            },
            Some(c) => result.push(c),
            None => break,
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::fs;

    use crate::Config;

    /// Returns a configuration not influenced by the environment.
    fn configure() -> Config {
        Context::configure_from(&BTreeMap::<String, String>::new())
    }

    fn touch(root: &Path, name: &[&str]) -> PathBuf {
        let mut p = root.to_path_buf();
        for (i, c) in name.iter().enumerate() {
            if i + 1 == name.len() {
                p.push(format!("{}{}", c, EXE_SUFFIX));
            } else {
                p.push(c);
            }
        }
        fs::create_dir_all(p.parent().unwrap()).unwrap();
        fs::write(&p, b"").unwrap();
        p
    }

    #[test]
    fn global_is_shared() {
        assert!(Arc::ptr_eq(&Locator::global(), &Locator::global()));
    }

    #[test]
    fn endpoint() {
        let l = Locator::new(configure()
            .homedir("C:\\Users\\alice\\AppData\\Roaming\\gnupg")
            .build());
        assert_eq!(l.endpoint(),
                   Some(Path::new(
                       "C:\\Users\\alice\\AppData\\Roaming\\gnupg\\S.uiserver")));

        assert_eq!(endpoint_in(Path::new("C:\\gnupg\\")),
                   Some(PathBuf::from("C:\\gnupg\\S.uiserver")));
        assert_eq!(endpoint_in(Path::new("/home/alice/.gnupg")),
                   Some(Path::new("/home/alice/.gnupg").join(SOCKET_NAME)));
        assert_eq!(endpoint_in(Path::new("")), None);
    }

    #[test]
    fn substitution() {
        assert_eq!(substitute("bin\\kleopatra.exe --uiserver-socket $s",
                              "C:\\x\\S.uiserver"),
                   "bin\\kleopatra.exe --uiserver-socket \"C:\\x\\S.uiserver\"");
        assert_eq!(substitute("a$$b$xc$", "s"), "a$bxc");
        assert_eq!(substitute("plain", "s"), "plain");
    }

    #[test]
    fn candidates() {
        let root = tempfile::tempdir().unwrap();
        let ctx = || configure()
            .homedir("/home/alice/.gnupg")
            .install_dir(root.path())
            .build();

        // Nothing installed.
        let l = Locator::new(ctx());
        assert!(l.launch().is_none());
        let e = l.require_launch().unwrap_err();
        assert_eq!(crate::ErrorKind::of(&e), crate::ErrorKind::Spawn);

        let gpa = touch(root.path(), &["bin", "gpa"]);
        let l = Locator::new(ctx());
        let d = l.launch().unwrap();
        assert_eq!(d.program, gpa);
        assert_eq!(d.args, vec!["--daemon"]);
        assert_eq!(d.working_dir.as_deref(), Some(root.path()));

        // The cache is not invalidated.
        let kleopatra = touch(root.path(), &["bin", "kleopatra"]);
        assert_eq!(l.launch().unwrap().program, gpa);

        let l = Locator::new(ctx());
        let d = l.launch().unwrap();
        assert_eq!(d.program, kleopatra);
        assert_eq!(d.args, vec![
            "--uiserver-socket".to_string(),
            Path::new("/home/alice/.gnupg").join(SOCKET_NAME)
                .to_string_lossy().into_owned(),
            "--daemon".to_string(),
        ]);
    }

    #[test]
    fn ui_server_override() {
        let root = tempfile::tempdir().unwrap();
        touch(root.path(), &["bin", "kleopatra"]);

        let l = Locator::new(configure()
            .homedir("C:\\Users\\bob\\gnupg")
            .install_dir(root.path())
            .ui_server("bin/my-server --socket $s --flag")
            .build());
        let d = l.launch().unwrap();
        assert_eq!(d.program, root.path().join("bin/my-server"));
        assert_eq!(d.args, vec!["--socket", "C:\\Users\\bob\\gnupg\\S.uiserver",
                                "--flag"]);

        let l = Locator::new(configure()
            .install_dir(root.path())
            .ui_server("   ")
            .build());
        assert!(l.launch().is_none());
    }

    #[test]
    fn no_install_dir() {
        let l = Locator::new(configure()
            .homedir("/home/alice/.gnupg")
            .ui_server("bin/gpa --daemon")
            .build());
        assert!(l.launch().is_none());
        assert!(l.require_launch().unwrap_err().to_string()
                .contains("installation directory"));
        assert_eq!(l.help_url("de"), HOMEPAGE);
    }

    #[test]
    fn help_url() {
        let l = Locator::new(configure()
            .install_dir("C:\\Program Files\\Gpg4win")
            .build());
        assert_eq!(l.help_url("en"),
                   "file:///C:\\Program Files\\Gpg4win\\share\\doc\\gpgex\\gpgex-en.html");

        let l = Locator::new(configure()
            .install_dir("C:\\Gpg4win\\")
            .build());
        assert_eq!(l.help_url("de"),
                   "file:///C:\\Gpg4win\\share\\doc\\gpgex\\gpgex-de.html");
    }
}
