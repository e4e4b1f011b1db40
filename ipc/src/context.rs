//! Contexts and configuration.
//!
//! The extension needs to know a few things about the system it is
//! running on: where GnuPG keeps its per-user state (the home
//! directory, which also holds the UI server's rendezvous point),
//! where Gpg4win is installed, and optionally which UI server to
//! start.  On Windows, these come from the registry.  We abstract
//! over that using the [`Lookup`] trait.
//!
//! # Examples
//!
//! A context with reasonable defaults can be created using
//! `Context::new`:
//!
//! ```no_run
//! # use gpgex_ipc::Context;
//! let c = Context::new();
//! ```
//!
//! A context can be configured using the builder pattern with
//! `Context::configure`:
//!
//! ```
//! # use gpgex_ipc::Context;
//! let c = Context::configure()
//!             .homedir("/home/alice/.gnupg")
//!             .install_dir("/opt/gpg4win")
//!             .build();
//! assert_eq!(c.install_dir().unwrap().to_str(), Some("/opt/gpg4win"));
//! ```

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

use crate::assuan::Escaping;
use crate::session::RetryPolicy;

/// Name of the value holding the installation directory.
pub const INSTALL_DIRECTORY: &str = "Install Directory";
/// Name of the value holding the UI server override.
pub const UI_SERVER: &str = "UI Server";
/// Name of the value holding the debug log file.
pub const DEBUG_FILE: &str = "GpgEX Debug File";
/// Name of the value holding the GnuPG home directory.
pub const HOME_DIR: &str = "HomeDir";

/// Name of the spawn lock.
///
/// This is shared by all instances of the extension on the machine.
pub const SPAWN_LOCK_NAME: &str = "GpgEX-uiserver-spawn.lock";

/// A registry-style key/value lookup service.
pub trait Lookup {
    /// Returns the value `name`, if set.
    fn get(&self, name: &str) -> Option<String>;
}

/// Looks up values in the process environment.
///
/// | Value               | Variable            |
/// |---------------------|---------------------|
/// | `Install Directory` | `GPGEX_INSTALL_DIR` |
/// | `UI Server`         | `GPGEX_UI_SERVER`   |
/// | `GpgEX Debug File`  | `GPGEX_DEBUG_FILE`  |
/// | `HomeDir`           | `GNUPGHOME`         |
#[derive(Debug, Default, Clone, Copy)]
pub struct Environment;

impl Environment {
    /// Returns the environment variable backing `name`.
    pub fn variable(name: &str) -> Option<&'static str> {
        match name {
            INSTALL_DIRECTORY => Some("GPGEX_INSTALL_DIR"),
            UI_SERVER => Some("GPGEX_UI_SERVER"),
            DEBUG_FILE => Some("GPGEX_DEBUG_FILE"),
            HOME_DIR => Some("GNUPGHOME"),
            _ => None,
        }
    }
}

impl Lookup for Environment {
    fn get(&self, name: &str) -> Option<String> {
        Self::variable(name)
            .and_then(|var| env::var(var).ok())
            .filter(|v| ! v.is_empty())
    }
}

impl Lookup for BTreeMap<String, String> {
    fn get(&self, name: &str) -> Option<String> {
        BTreeMap::get(self, name).cloned()
    }
}

/// Expands `%NAME%` references using the process environment.
///
/// Like `ExpandEnvironmentStrings`, references to unset variables
/// are left as is, and `%%` is not special.
pub fn expand_env(value: &str) -> String {
    expand_with(value, |name| env::var(name).ok())
}

fn expand_with<F>(value: &str, lookup: F) -> String
    where F: Fn(&str) -> Option<String>
{
    let mut expanded = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find('%') {
        expanded.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('%') {
            Some(end) if end > 0 => match lookup(&after[..end]) {
                Some(v) => {
                    expanded.push_str(&v);
                    rest = &after[end + 1..];
                },
                None => {
                    // Keep the first '%', the second one may start
                    // a reference.
                    expanded.push('%');
                    rest = after;
                },
            },
            _ => {
                expanded.push('%');
                rest = after;
            },
        }
    }
    expanded.push_str(rest);
    expanded
}

/// Returns the platform's default GnuPG home directory.
fn default_homedir() -> Option<PathBuf> {
    if cfg!(windows) {
        dirs::config_dir().map(|d| d.join("gnupg"))
    } else {
        dirs::home_dir().map(|d| d.join(".gnupg"))
    }
}

/// A `Context` for the client.
///
/// # Examples
///
/// ```
/// # use gpgex_ipc::Context;
/// let c = Context::configure()
///             .homedir("C:\\Users\\alice\\AppData\\Roaming\\gnupg")
///             .escape_colons(true)
///             .build();
/// assert!(c.escaping().escapes_colons());
/// ```
#[derive(Debug, Clone)]
pub struct Context {
    homedir: Option<PathBuf>,
    install_dir: Option<PathBuf>,
    ui_server: Option<String>,
    debug_file: Option<PathBuf>,
    escaping: Escaping,
    spawn_lock: PathBuf,
    retry: RetryPolicy,
}

impl Context {
    /// Creates a Context from the process environment.
    pub fn new() -> Self {
        Self::configure().build()
    }

    /// Creates a Context that can be configured.
    ///
    /// The configuration is seeded from the process environment, but
    /// can be modified.  A configuration has to be finalized using
    /// `.build()` in order to turn it into a Context.
    pub fn configure() -> Config {
        Self::configure_from(&Environment)
    }

    /// Creates a Context that can be configured, seeded from `lookup`.
    pub fn configure_from(lookup: &dyn Lookup) -> Config {
        let get = |name: &str| lookup.get(name).map(|v| expand_env(&v));
        Config {
            homedir: get(HOME_DIR).map(PathBuf::from),
            install_dir: get(INSTALL_DIRECTORY).map(PathBuf::from),
            ui_server: get(UI_SERVER),
            debug_file: get(DEBUG_FILE).map(PathBuf::from),
            escaping: Escaping::default(),
            spawn_lock: None,
            retry: RetryPolicy::default(),
        }
    }

    /// Returns the GnuPG home directory, if known.
    pub fn homedir(&self) -> Option<&Path> {
        self.homedir.as_deref()
    }

    /// Returns the installation directory, if known.
    pub fn install_dir(&self) -> Option<&Path> {
        self.install_dir.as_deref()
    }

    /// Returns the UI server override, if any.
    ///
    /// This is a command line relative to the installation directory.
    pub fn ui_server(&self) -> Option<&str> {
        self.ui_server.as_deref()
    }

    /// Returns the file to write debug logs to, if any.
    pub fn debug_file(&self) -> Option<&Path> {
        self.debug_file.as_deref()
    }

    /// Returns how file names are escaped.
    pub fn escaping(&self) -> Escaping {
        self.escaping
    }

    /// Returns the path of the spawn lock.
    pub fn spawn_lock(&self) -> &Path {
        &self.spawn_lock
    }

    /// Returns the retry policy.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// Represents a `Context` configuration.
///
/// A context can be configured using the builder pattern with
/// `Context::configure`.
#[derive(Debug, Clone)]
pub struct Config {
    homedir: Option<PathBuf>,
    install_dir: Option<PathBuf>,
    ui_server: Option<String>,
    debug_file: Option<PathBuf>,
    escaping: Escaping,
    spawn_lock: Option<PathBuf>,
    retry: RetryPolicy,
}

impl Config {
    /// Finalizes the configuration and returns a `Context`.
    ///
    /// If no home directory is configured, the platform's default is
    /// used.  If that cannot be determined either, the context has
    /// no home directory, and connecting to the UI server will fail.
    pub fn build(self) -> Context {
        Context {
            homedir: self.homedir.or_else(default_homedir),
            install_dir: self.install_dir,
            ui_server: self.ui_server,
            debug_file: self.debug_file,
            escaping: self.escaping,
            spawn_lock: self.spawn_lock.unwrap_or_else(
                || env::temp_dir().join(SPAWN_LOCK_NAME)),
            retry: self.retry,
        }
    }

    /// Sets the GnuPG home directory.
    pub fn homedir<P: AsRef<Path>>(mut self, homedir: P) -> Self {
        self.homedir = Some(homedir.as_ref().into());
        self
    }

    /// Sets the installation directory.
    pub fn install_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.install_dir = Some(dir.as_ref().into());
        self
    }

    /// Sets the UI server override.
    pub fn ui_server<S: Into<String>>(mut self, cmdline: S) -> Self {
        self.ui_server = Some(cmdline.into());
        self
    }

    /// Sets the debug log file.
    pub fn debug_file<P: AsRef<Path>>(mut self, file: P) -> Self {
        self.debug_file = Some(file.as_ref().into());
        self
    }

    /// Sets whether colons in file names are escaped.
    pub fn escape_colons(mut self, yes: bool) -> Self {
        self.escaping = self.escaping.escape_colons(yes);
        self
    }

    /// Sets the path of the spawn lock.
    ///
    /// All processes that may start the UI server must use the same
    /// lock.  This is mostly useful for tests.
    pub fn spawn_lock<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.spawn_lock = Some(path.as_ref().into());
        self
    }

    /// Sets the retry policy.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(values: &[(&str, &str)]) -> BTreeMap<String, String> {
        values.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn from_lookup() {
        let l = lookup(&[
            (INSTALL_DIRECTORY, "C:\\Program Files\\Gpg4win"),
            (UI_SERVER, "bin\\gpa.exe --daemon"),
            (HOME_DIR, "C:\\Users\\alice\\AppData\\Roaming\\gnupg"),
        ]);
        let c = Context::configure_from(&l).build();
        assert_eq!(c.install_dir(),
                   Some(Path::new("C:\\Program Files\\Gpg4win")));
        assert_eq!(c.ui_server(), Some("bin\\gpa.exe --daemon"));
        assert_eq!(c.homedir(),
                   Some(Path::new("C:\\Users\\alice\\AppData\\Roaming\\gnupg")));
        assert_eq!(c.debug_file(), None);
        assert!(! c.escaping().escapes_colons());
        assert!(c.spawn_lock().ends_with(SPAWN_LOCK_NAME));
    }

    #[test]
    fn builder_overrides() {
        let l = lookup(&[(INSTALL_DIRECTORY, "/opt/a")]);
        let c = Context::configure_from(&l)
            .install_dir("/opt/b")
            .homedir("/home/bob/.gnupg")
            .spawn_lock("/tmp/lock")
            .debug_file("/tmp/gpgex.log")
            .build();
        assert_eq!(c.install_dir(), Some(Path::new("/opt/b")));
        assert_eq!(c.homedir(), Some(Path::new("/home/bob/.gnupg")));
        assert_eq!(c.spawn_lock(), Path::new("/tmp/lock"));
        assert_eq!(c.debug_file(), Some(Path::new("/tmp/gpgex.log")));
    }

    #[test]
    fn expansion() {
        let env = |name: &str| match name {
            "APPDATA" => Some("C:\\Users\\alice\\AppData\\Roaming".to_string()),
            "EMPTY" => Some(String::new()),
            _ => None,
        };
        assert_eq!(expand_with("%APPDATA%\\gnupg", env),
                   "C:\\Users\\alice\\AppData\\Roaming\\gnupg");
        assert_eq!(expand_with("a%EMPTY%b", env), "ab");
        assert_eq!(expand_with("%UNSET%\\x", env), "%UNSET%\\x");
        assert_eq!(expand_with("100%", env), "100%");
        assert_eq!(expand_with("%%APPDATA%", env),
                   "%C:\\Users\\alice\\AppData\\Roaming");
        assert_eq!(expand_with("no references", env), "no references");
    }
}
