//! System prompt with the sandbox's starting directory and files.

use crate::sandbox::{Sandbox, SandboxError};

const FALLBACK_DIR: &str = "/app";
const LIST_COMMAND: &str = "ls -1 2>/dev/null | head -50";
const LISTED_FILES: usize = 10;

/// Render the prompt from an already-probed directory and listing.
pub fn render_system_prompt(current_dir: &str, files: &[String]) -> String {
    let total = files.len();
    let header = match total {
        0 => "Current directory is empty.".to_string(),
        1 => "Files in current directory (1 file):".to_string(),
        n if n <= LISTED_FILES => format!("Files in current directory ({n} files):"),
        n => format!("Files in current directory (showing first {LISTED_FILES} of {n}):"),
    };
    let listing = files
        .iter()
        .take(LISTED_FILES)
        .enumerate()
        .map(|(i, f)| format!("{}. {f}", i + 1))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "You are an autonomous agent executing tasks in a sandboxed environment. \
Follow these instructions carefully.

## WORKING DIRECTORY & ENVIRONMENT CONTEXT

Your current working directory is:
{current_dir}

{header}
{listing}

**IMPORTANT**: This directory information is provided for your convenience \
at the start of the task. You should:
- Use this information to understand the initial environment state
- Avoid redundantly calling `ls` or similar commands just to list the same directory
- Only use file listing commands if you need updated information \
(after creating/deleting files) or need to explore subdirectories
- Work in the /app directory unless explicitly instructed otherwise
"
    )
}

/// Probe the sandbox with `pwd` and `ls`, then render the prompt.
pub async fn format_system_prompt(sandbox: &dyn Sandbox) -> Result<String, SandboxError> {
    let pwd = sandbox.exec("pwd").await?;
    let current_dir = match pwd.stdout.trim() {
        "" => FALLBACK_DIR,
        dir => dir,
    };

    let ls = sandbox.exec(LIST_COMMAND).await?;
    let files: Vec<String> = ls
        .stdout
        .trim()
        .lines()
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();

    tracing::debug!(current_dir, files = files.len(), "Probed sandbox for system prompt");
    Ok(render_system_prompt(current_dir, &files))
}
