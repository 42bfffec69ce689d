//! Block tag registry.
//!
//! Declares the multi-line tags the parser recognises. The registry is a
//! plain value built at startup and handed to the parser, so tests can use
//! a synthetic one.

use regex::Regex;
use std::collections::BTreeMap;

/// How a block's content reaches the workspace
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteMode {
    /// Content is written verbatim to the path argument
    Direct,
    /// Content is handed to a tool; the primary argument and content become
    /// two named arguments of that tool
    Translate {
        tool: String,
        path_arg: String,
        content_arg: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSpec {
    pub name: String,
    pub mode: WriteMode,
    pub description: String,
}

impl BlockSpec {
    pub fn direct(name: &str, description: &str) -> Self {
        Self {
            name: name.to_uppercase(),
            mode: WriteMode::Direct,
            description: description.to_string(),
        }
    }

    pub fn translated(
        name: &str,
        tool: &str,
        path_arg: &str,
        content_arg: &str,
        description: &str,
    ) -> Self {
        Self {
            name: name.to_uppercase(),
            mode: WriteMode::Translate {
                tool: tool.to_string(),
                path_arg: path_arg.to_string(),
                content_arg: content_arg.to_string(),
            },
            description: description.to_string(),
        }
    }

    /// `<<<END_NAME>>>`
    pub fn end_marker(&self) -> String {
        format!("<<<END_{}>>>", self.name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct BlockRegistry {
    specs: BTreeMap<String, BlockSpec>,
}

impl BlockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// FILE writes directly, DIFF becomes an `apply_diff` call
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(BlockSpec::direct(
            "FILE",
            "Write the full content of a file",
        ));
        registry.register(BlockSpec::translated(
            "DIFF",
            "apply_diff",
            "path",
            "diff",
            "Patch a file with SEARCH/REPLACE sections",
        ));
        registry
    }

    pub fn register(&mut self, spec: BlockSpec) {
        self.specs.insert(spec.name.clone(), spec);
    }

    pub fn get(&self, name: &str) -> Option<&BlockSpec> {
        self.specs.get(&name.to_uppercase())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.specs.keys().map(|k| k.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Pattern for a complete start marker: `<<<TAG: arg>>>`.
    /// Group 1 is the tag, group 2 the untrimmed argument.
    pub fn start_pattern(&self) -> Option<Regex> {
        if self.specs.is_empty() {
            return None;
        }
        // Longer names first so a name that prefixes another cannot shadow it
        let mut names: Vec<&str> = self.names().collect();
        names.sort_by_key(|n| std::cmp::Reverse(n.len()));
        let alternation = names
            .iter()
            .map(|n| regex::escape(n))
            .collect::<Vec<_>>()
            .join("|");
        Regex::new(&format!(r"<<<({}):[ \t]*([^>\n]+)>>>", alternation)).ok()
    }
}
