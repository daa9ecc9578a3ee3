use std::fs;

use anyhow::{Context, Result};
use docvl_core::TaskKind;

use crate::args::Args;

/// Custom prompt text or file when given, else the task instruction.
pub fn resolve_prompt(args: &Args, task: TaskKind) -> Result<String> {
    if let Some(path) = &args.prompt_file {
        return fs::read_to_string(path)
            .with_context(|| format!("failed to read prompt file {}", path.display()))
            .map(|s| s.trim_end().to_owned());
    }
    if let Some(prompt) = &args.prompt {
        return Ok(prompt.clone());
    }
    Ok(task.prompt().to_owned())
}
