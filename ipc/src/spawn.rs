//! Starting processes.
//!
//! The UI server is started detached from us: its standard streams
//! are redirected to the null device, it runs in its own process
//! group, and we do not wait for it.  On Windows, it is in addition
//! detached from our console, if any.

use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};

use crate::Error;
use crate::Result;

/// Quotes a single command line token.
///
/// Tokens containing whitespace or quotes are wrapped in quotes, and
/// embedded quotes are doubled.  The empty token becomes `""`.
pub fn quote(token: &str) -> String {
    if ! token.is_empty()
        && ! token.chars().any(|c| c.is_whitespace() || c == '"')
    {
        return token.into();
    }

    let mut quoted = String::with_capacity(token.len() + 2);
    quoted.push('"');
    for c in token.chars() {
        if c == '"' {
            quoted.push('"');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

/// Builds a command line from a program and its arguments.
///
/// ```
/// # use gpgex_ipc::spawn::build_command_line;
/// assert_eq!(build_command_line("C:\\Program Files\\gpa.exe",
///                               &["--daemon", ""]),
///            "\"C:\\Program Files\\gpa.exe\" --daemon \"\"");
/// ```
pub fn build_command_line<S: AsRef<str>>(program: &str, args: &[S]) -> String {
    let mut cmdline = quote(program);
    for arg in args {
        cmdline.push(' ');
        cmdline.push_str(&quote(arg.as_ref()));
    }
    cmdline
}

/// Splits a command line into tokens.
///
/// This is the inverse of [`build_command_line`]: tokens are
/// separated by whitespace, a quoted token may contain whitespace,
/// and a doubled quote within quotes stands for a quote.
pub fn split_command_line(cmdline: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut chars = cmdline.chars().peekable();
    loop {
        while chars.peek().map(|c| c.is_whitespace()).unwrap_or(false) {
            chars.next();
        }
        if chars.peek().is_none() {
            return Ok(tokens);
        }

        let mut token = String::new();
        let mut quoted = false;
        while let Some(c) = chars.next() {
            match c {
                '"' if quoted && chars.peek() == Some(&'"') => {
                    chars.next();
                    token.push('"');
                },
                '"' => quoted = ! quoted,
                c if c.is_whitespace() && ! quoted => break,
                c => token.push(c),
            }
        }
        if quoted {
            return Err(Error::SpawnFailed(format!(
                "Unbalanced quotes in command line {:?}", cmdline)).into());
        }
        tokens.push(token);
    }
}

fn command<S: AsRef<str>>(program: &Path, args: &[S], cwd: Option<&Path>)
                          -> Command
{
    let mut cmd = Command::new(program);

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        for arg in args {
            cmd.raw_arg(quote(arg.as_ref()));
        }
    }
    #[cfg(not(windows))]
    {
        cmd.args(args.iter().map(|a| a.as_ref()));
    }

    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }
    cmd
}

/// Starts `program` detached from the current process.
///
/// Returns as soon as the process has been created.  If `cwd` is
/// given, the process is started in that directory.
pub fn spawn_detached<S: AsRef<str>>(program: &Path, args: &[S],
                                     cwd: Option<&Path>)
                                     -> Result<()>
{
    let cmdline = build_command_line(&program.to_string_lossy(), args);
    log::debug!("spawn_detached: {}", cmdline);

    let mut cmd = command(program, args, cwd);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        use winapi::um::winbase::{
            CREATE_DEFAULT_ERROR_MODE,
            CREATE_NEW_PROCESS_GROUP,
            DETACHED_PROCESS,
        };
        // The priority class is inherited by default.
        cmd.creation_flags(CREATE_DEFAULT_ERROR_MODE
                           | CREATE_NEW_PROCESS_GROUP
                           | DETACHED_PROCESS);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    match cmd.spawn() {
        // Dropping the child closes our handles to it.
        Ok(child) => {
            log::debug!("spawn_detached: started process {}", child.id());
            Ok(())
        },
        Err(e) => {
            log::debug!("spawn_detached: failed: {}", e);
            Err(Error::SpawnFailed(format!("{}: {}", cmdline, e)).into())
        },
    }
}

/// Runs `program` and returns what it wrote to stdout.
///
/// Stdin and stderr are redirected to the null device.  The output is
/// read until the program closes its stdout.
pub fn capture_output<S: AsRef<str>>(program: &Path, args: &[S])
                                     -> Result<Vec<u8>>
{
    let cmdline = build_command_line(&program.to_string_lossy(), args);
    log::debug!("capture_output: {}", cmdline);

    let mut child = command(program, args, None)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| Error::SpawnFailed(format!("{}: {}", cmdline, e)))?;

    let mut output = Vec::new();
    if let Some(mut stdout) = child.stdout.take() {
        stdout.read_to_end(&mut output)?;
    }
    let status = child.wait()?;
    log::debug!("capture_output: {} bytes, {}", output.len(), status);
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting() {
        assert_eq!(quote("plain"), "plain");
        assert_eq!(quote(""), "\"\"");
        assert_eq!(quote("two words"), "\"two words\"");
        assert_eq!(quote("tab\there"), "\"tab\there\"");
        assert_eq!(quote("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(quote("C:\\dir\\"), "C:\\dir\\");
    }

    #[test]
    fn command_lines() {
        assert_eq!(build_command_line::<&str>("gpa", &[]), "gpa");
        assert_eq!(
            build_command_line("C:\\Gpg4win\\bin\\kleopatra.exe",
                               &["--uiserver-socket",
                                 "C:\\Users\\Alice Smith\\gnupg\\S.uiserver",
                                 "--daemon"]),
            "C:\\Gpg4win\\bin\\kleopatra.exe --uiserver-socket \
             \"C:\\Users\\Alice Smith\\gnupg\\S.uiserver\" --daemon");
    }

    #[test]
    fn splitting() {
        assert_eq!(split_command_line("").unwrap(), Vec::<String>::new());
        assert_eq!(split_command_line("  bin\\gpa.exe   --daemon ").unwrap(),
                   vec!["bin\\gpa.exe", "--daemon"]);
        assert_eq!(split_command_line("a \"b c\" \"\" d\"e f\"").unwrap(),
                   vec!["a", "b c", "", "de f"]);
        assert_eq!(split_command_line("\"say \"\"hi\"\"\"").unwrap(),
                   vec!["say \"hi\""]);
        assert!(split_command_line("\"unbalanced").is_err());
    }

    quickcheck! {
        fn split_inverts_build(program: String, args: Vec<String>) -> bool {
            let cmdline = build_command_line(&program, &args);
            let mut expected = vec![program];
            expected.extend(args);
            split_command_line(&cmdline).unwrap() == expected
        }
    }

    #[cfg(unix)]
    #[test]
    fn spawning() {
        spawn_detached(Path::new("true"), &["ignored"], None).unwrap();

        let e = spawn_detached::<&str>(
            Path::new("/nonexistent/gpgex-test-server"), &[], None)
            .unwrap_err();
        assert_eq!(crate::ErrorKind::of(&e), crate::ErrorKind::Spawn);
    }

    #[cfg(unix)]
    #[test]
    fn capturing() {
        let out = capture_output(Path::new("echo"), &["hello", "world"])
            .unwrap();
        assert_eq!(out, b"hello world\n");

        assert!(capture_output::<&str>(
            Path::new("/nonexistent/gpgex-test-server"), &[]).is_err());
    }
}
