//! Per-function tracing on top of `log::trace!`.
//!
//! ```text
//! const TRACE: bool = false;
//!
//! fn connect(path: &Path) -> Result<()> {
//!     tracer!(TRACE, "connect");
//!     t!("({})", path.display());
//!     ...
//! }
//! ```
//!
//! `tracer!` defines a local `t!` macro that prefixes each message
//! with the function name.  Messages are only emitted if the
//! predicate holds, so tracing can be switched on per module.

macro_rules! trace {
    ( $TRACE:expr, $func:expr, $msg:expr ) => {
        if $TRACE {
            log::trace!("{}: {}", $func, $msg);
        }
    };
}

macro_rules! tracer {
    ( $TRACE:expr, $func:expr ) => {
        // A nested macro definition cannot contain `$(...)`, hence
        // one arm per arity.
        #[allow(unused_macros)]
        macro_rules! t {
            ( $fmt:expr ) =>
            { trace!($TRACE, $func, $fmt) };
            ( $fmt:expr, $a:expr ) =>
            { trace!($TRACE, $func, format!($fmt, $a)) };
            ( $fmt:expr, $a:expr, $b:expr ) =>
            { trace!($TRACE, $func, format!($fmt, $a, $b)) };
            ( $fmt:expr, $a:expr, $b:expr, $c:expr ) =>
            { trace!($TRACE, $func, format!($fmt, $a, $b, $c)) };
            ( $fmt:expr, $a:expr, $b:expr, $c:expr, $d:expr ) =>
            { trace!($TRACE, $func, format!($fmt, $a, $b, $c, $d)) };
            ( $fmt:expr, $a:expr, $b:expr, $c:expr, $d:expr, $e:expr ) =>
            { trace!($TRACE, $func, format!($fmt, $a, $b, $c, $d, $e)) };
        }
    };
}

#[cfg(test)]
mod tests {
    const TRACE: bool = true;

    #[test]
    fn arities() {
        tracer!(TRACE, "trace::tests::arities");
        let n = 1;
        t!("no arguments");
        t!("{}", n);
        t!("{} {}", n, n + 1);
        t!("{} {} {}", n, n + 1, n + 2);
        t!("{} {} {} {}", n, n + 1, n + 2, n + 3);
        t!("{} {} {} {} {}", n, n + 1, n + 2, n + 3, n + 4);
    }
}
