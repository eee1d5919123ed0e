use crate::domain::session::ProviderName;
use std::collections::BTreeMap;

const BUILTIN_PROVIDERS: &[(&str, &str)] = &[
    ("codex", "codex app-server"),
    ("claude", "claude"),
    ("gemini", "gemini"),
];

/// Provider name to default command line.
#[derive(Clone, Debug, Default)]
pub struct ProviderRegistry {
    commands: BTreeMap<ProviderName, String>,
}

impl ProviderRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        for (name, command) in BUILTIN_PROVIDERS {
            if let Ok(name) = ProviderName::new(name) {
                registry.register(name, *command);
            }
        }
        let shell = std::env::var("SHELL")
            .ok()
            .filter(|shell| !shell.trim().is_empty())
            .unwrap_or_else(|| "sh".to_string());
        if let Ok(name) = ProviderName::new("shell") {
            registry.register(name, shell);
        }
        registry
    }

    pub fn register(&mut self, name: ProviderName, command: impl Into<String>) {
        self.commands.insert(name, command.into());
    }

    /// Parses `NAME=COMMAND`.
    pub fn parse_override(spec: &str) -> Result<(ProviderName, String), String> {
        let (name, command) = spec
            .split_once('=')
            .ok_or_else(|| format!("expected NAME=COMMAND, got '{spec}'"))?;
        let name = ProviderName::new(name)?;
        let command = command.trim();
        if command.is_empty() {
            return Err(format!("provider '{name}' has an empty command"));
        }
        Ok((name, command.to_string()))
    }

    pub fn command_for(&self, name: &ProviderName) -> Option<&str> {
        self.commands.get(name).map(String::as_str)
    }

    pub fn names(&self) -> Vec<&str> {
        self.commands.keys().map(ProviderName::as_str).collect()
    }
}
