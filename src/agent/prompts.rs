//! Prompt text: the protocol explanation, the warm-up exchange and the
//! small user turns the loop adds on its own.

use crate::llm::ChatMessage;
use crate::protocol::{BlockRegistry, WriteMode};
use crate::tools::ToolRegistry;
use crate::workspace::FileEntry;

/// Existing files listed in the first user turn
pub const MAX_LISTED_FILES: usize = 50;

const PREAMBLE: &str = "You are a coding agent working on a project through a text protocol. \
Everything you write is parsed while you write it, and each command runs as soon as it is complete.";

const RULES: &str = "Rules:
- Block markers and line commands must be written exactly as shown.
- Line commands start at the beginning of a line and end at the end of that line.
- Arguments are key=\"value\" pairs; single quotes also work.
- Read a file before patching it. Every SEARCH part must match the file exactly once.
- After @@READ, stop and wait: the file contents arrive in the next message.
- Finish with @@DONE once the project compiles, or give up with @@ABORT.";

/// System prompt describing the block tags and line commands on offer
pub fn system_prompt(blocks: &BlockRegistry, tools: &ToolRegistry) -> String {
    let mut out = String::from(PREAMBLE);

    out.push_str("\n\nBlock commands:\n");
    for name in blocks.names() {
        let Some(spec) = blocks.get(name) else {
            continue;
        };
        let shape = match &spec.mode {
            WriteMode::Direct => "complete file content".to_string(),
            WriteMode::Translate { tool, .. } => format!("input for {}", tool),
        };
        out.push_str(&format!(
            "<<<{}: path>>>\n...{}...\n{}\n  {}\n",
            spec.name,
            shape,
            spec.end_marker(),
            spec.description
        ));
    }

    out.push_str("\nLine commands:\n");
    for (usage, description) in tools.documentation() {
        if usage.starts_with("@@") {
            out.push_str(&format!("{}\n  {}\n", usage, description));
        }
    }

    out.push_str("\nPatch format inside a DIFF block (sections may repeat):\n");
    out.push_str("<<<<<<< SEARCH\nexact lines from the file\n=======\nreplacement lines\n>>>>>>> REPLACE\n\n");
    out.push_str(RULES);
    out
}

/// Fixed example exchange placed before the real task
pub fn warmup() -> Vec<ChatMessage> {
    vec![
        ChatMessage::user("Example task: create a greeting module and export it from the entry point."),
        ChatMessage::assistant(
            "I will add the module, then update the entry point.\n\
             <<<FILE: src/greet.ts>>>\n\
             export function greet(name: string): string {\n  return `Hello, ${name}!`;\n}\n\
             <<<END_FILE>>>\n\
             <<<DIFF: src/index.ts>>>\n\
             <<<<<<< SEARCH\n\
             export {};\n\
             =======\n\
             export { greet } from \"./greet\";\n\
             >>>>>>> REPLACE\n\
             <<<END_DIFF>>>\n\
             @@DONE summary=\"Added greet() and exported it\" title=\"Greeting module\"\n",
        ),
    ]
}

/// First real user turn. Existing files are listed so the model reads them
/// before patching.
pub fn task_message(task: &str, existing: &[FileEntry]) -> String {
    if existing.is_empty() {
        return format!("Task: {}", task);
    }

    let mut paths: Vec<&str> = existing.iter().map(|e| e.path.as_str()).collect();
    paths.sort_unstable();
    let mut listing = paths
        .iter()
        .take(MAX_LISTED_FILES)
        .map(|p| format!("  - {}", p))
        .collect::<Vec<_>>()
        .join("\n");
    if paths.len() > MAX_LISTED_FILES {
        listing.push_str(&format!("\n  ... and {} more", paths.len() - MAX_LISTED_FILES));
    }

    format!(
        "The project already contains {} file(s):\n{}\n\n\
         Read the files you need with @@READ before changing them, and prefer DIFF blocks for small edits.\n\n\
         Task: {}",
        paths.len(),
        listing,
        task
    )
}

/// Reminder after a response that did nothing
pub fn empty_nudge(count: u32, limit: u32) -> String {
    format!(
        "Your last response contained no commands ({}/{} empty responses allowed). \
         Use the protocol: write files with <<<FILE: path>>> blocks, finish with @@DONE summary=\"...\", \
         or stop with @@ABORT reason=\"...\".",
        count, limit
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CommandStreamParser;

    #[test]
    fn test_system_prompt_documents_protocol() {
        let prompt = system_prompt(&BlockRegistry::builtin(), &ToolRegistry::builtin());
        assert!(prompt.contains("<<<FILE: path>>>"));
        assert!(prompt.contains("<<<END_DIFF>>>"));
        assert!(prompt.contains("input for apply_diff"));
        assert!(prompt.contains("@@READ paths="));
        assert!(prompt.contains("@@DONE summary="));
        assert!(prompt.contains("@@ABORT reason="));
        // apply_diff is reached through its block, not a line command
        assert!(!prompt.contains("<<<DIFF: path>>> SEARCH/REPLACE sections"));
    }

    #[test]
    fn test_warmup_example_parses() {
        let blocks = BlockRegistry::builtin();
        let mut parser = CommandStreamParser::new(&blocks);
        let exchange = warmup();
        let mut commands = parser.feed(&exchange[1].content);
        commands.extend(parser.flush());
        let labels: Vec<String> = commands.iter().map(|c| c.label()).collect();
        assert_eq!(labels.len(), 3, "{:?}", labels);
    }

    #[test]
    fn test_task_message_lists_existing_files() {
        let entries: Vec<FileEntry> = (0..53)
            .map(|i| FileEntry {
                path: format!("src/f{:02}.ts", i),
                size: 1,
            })
            .collect();
        let text = task_message("add a button", &entries);
        assert!(text.starts_with("The project already contains 53 file(s):"));
        assert!(text.contains("  - src/f00.ts"));
        assert!(text.contains("  - src/f49.ts"));
        assert!(!text.contains("src/f50.ts"));
        assert!(text.contains("... and 3 more"));
        assert!(text.ends_with("Task: add a button"));

        assert_eq!(task_message("x", &[]), "Task: x");
    }

    #[test]
    fn test_empty_nudge() {
        let text = empty_nudge(2, 3);
        assert!(text.contains("(2/3 empty responses allowed)"));
        assert!(text.contains("@@DONE"));
    }
}
