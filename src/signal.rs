//! The POSIX signal allow-list: names the interactive protocol accepts in a
//! `{type:"signal", signal}` message, and their `nix` equivalents.

use nix::sys::signal::Signal;
use once_cell::sync::Lazy;
use std::collections::HashMap;

static ALLOWED: Lazy<HashMap<&'static str, Signal>> = Lazy::new(|| {
    use Signal::*;
    [
        ("SIGABRT", SIGABRT),
        ("SIGALRM", SIGALRM),
        ("SIGBUS", SIGBUS),
        ("SIGCHLD", SIGCHLD),
        ("SIGCONT", SIGCONT),
        ("SIGFPE", SIGFPE),
        ("SIGHUP", SIGHUP),
        ("SIGILL", SIGILL),
        ("SIGINT", SIGINT),
        ("SIGKILL", SIGKILL),
        ("SIGPIPE", SIGPIPE),
        ("SIGQUIT", SIGQUIT),
        ("SIGSEGV", SIGSEGV),
        ("SIGSTOP", SIGSTOP),
        ("SIGTERM", SIGTERM),
        ("SIGTSTP", SIGTSTP),
        ("SIGTTIN", SIGTTIN),
        ("SIGTTOU", SIGTTOU),
        ("SIGUSR1", SIGUSR1),
        ("SIGUSR2", SIGUSR2),
        ("SIGWINCH", SIGWINCH),
    ]
    .into_iter()
    .collect()
});

/// Resolves a signal name against the allow-list. `None` means the caller
/// should reject the request (interactive protocol close code 4005).
pub fn resolve(name: &str) -> Option<Signal> {
    ALLOWED.get(name).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_signal_resolves() {
        assert_eq!(resolve("SIGTERM"), Some(Signal::SIGTERM));
    }

    #[test]
    fn unknown_signal_is_rejected() {
        assert_eq!(resolve("SIGDANCE"), None);
    }

    #[test]
    fn rejects_signal_number_not_name() {
        assert_eq!(resolve("9"), None);
    }
}
