//! Output sanitizer for proxied shell commands.
//!
//! Non-interactive bash inside a container prints job-control warnings on
//! every invocation. They are noise to the worker, so they are stripped before
//! stdout/stderr are merged into the single `output` string of an
//! `exec_response`.

/// Harmless diagnostics emitted by non-interactive bash in containers.
pub const TTY_NOISE: &[&str] = &[
    "bash: cannot set terminal process group (-1): Inappropriate ioctl for device",
    "bash: cannot set terminal process group (1): Inappropriate ioctl for device",
    "bash: no job control in this shell",
    "bash: initialize_job_control: no job control in background: Bad file descriptor",
];

/// Merged output plus the noise lines that were removed from it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sanitized {
    pub output: String,
    pub removed: Vec<&'static str>,
}

/// Strip known noise and merge stdout/stderr into one string.
pub fn sanitize(stdout: &str, stderr: &str) -> String {
    sanitize_detailed(stdout, stderr).output
}

/// Like [`sanitize`], also reporting which noise lines were seen.
///
/// Remaining stderr is appended under a `stderr:` marker, only when non-empty.
pub fn sanitize_detailed(stdout: &str, stderr: &str) -> Sanitized {
    let mut stdout = stdout.to_string();
    let mut stderr = stderr.to_string();
    let mut removed = Vec::new();

    for &noise in TTY_NOISE {
        let in_stdout = strip(&mut stdout, noise);
        let in_stderr = strip(&mut stderr, noise);
        if in_stdout || in_stderr {
            removed.push(noise);
        }
    }

    let stdout = stdout.trim();
    let stderr = stderr.trim();

    let output = match (stdout.is_empty(), stderr.is_empty()) {
        (_, true) => stdout.to_string(),
        (true, false) => format!("\nstderr: {stderr}"),
        (false, false) => format!("{stdout}\n\nstderr: {stderr}"),
    };

    Sanitized { output, removed }
}

/// Remove every occurrence of `noise` (with its line break, if any).
fn strip(text: &mut String, noise: &str) -> bool {
    if !text.contains(noise) {
        return false;
    }
    *text = text
        .replace(&format!("{noise}\r\n"), "")
        .replace(&format!("{noise}\n"), "")
        .replace(noise, "");
    true
}
