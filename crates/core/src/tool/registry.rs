use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::sync::Arc;

use parley_model::ModelTool;
use serde_json::Value;

use super::{AnyTool, BoxedToolFuture, Tool, ToolObject};

/// Errors of registering and looking up tools.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// A tool with the same name is already registered.
    #[error("tool `{0}` is already registered")]
    DuplicateTool(String),
    /// No tool with this name is registered.
    #[error("unknown tool: {0}")]
    UnknownTool(String),
}

/// A tool stored in a [`Registry`].
#[derive(Clone)]
pub struct RegisteredTool(Arc<dyn ToolObject>);

impl RegisteredTool {
    /// Returns the name of the tool.
    #[inline]
    pub fn name(&self) -> &str {
        self.0.name()
    }

    /// Returns the description of the tool.
    #[inline]
    pub fn description(&self) -> &str {
        self.0.description()
    }

    /// Returns the parameter schema of the tool.
    #[inline]
    pub fn parameter_schema(&self) -> &Value {
        self.0.parameter_schema()
    }

    /// Returns the definition presented to the model.
    #[inline]
    pub fn definition(&self) -> ModelTool {
        self.0.definition()
    }

    #[inline]
    pub(crate) fn execute(&self, arguments: Value) -> BoxedToolFuture {
        self.0.execute(arguments)
    }
}

impl Debug for RegisteredTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredTool")
            .field("name", &self.name())
            .finish_non_exhaustive()
    }
}

/// [`Registry`] builder.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    tools: Vec<RegisteredTool>,
    index: HashMap<String, usize>,
}

impl RegistryBuilder {
    /// Creates an empty builder.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tool.
    ///
    /// Fails if a tool with the same name is already registered.
    pub fn register<T: Tool>(mut self, tool: T) -> Result<Self, RegistryError> {
        let name = tool.name().to_owned();
        if self.index.contains_key(&name) {
            return Err(RegistryError::DuplicateTool(name));
        }
        trace!(tool = %name, "registering tool");
        self.index.insert(name, self.tools.len());
        self.tools.push(RegisteredTool(Arc::new(AnyTool(tool))));
        Ok(self)
    }

    /// Freezes the registry. No tools can be added afterwards.
    #[inline]
    pub fn build(self) -> Arc<Registry> {
        Arc::new(Registry {
            tools: self.tools,
            index: self.index,
        })
    }
}

/// An immutable set of tools, keyed by name.
#[derive(Debug, Default)]
pub struct Registry {
    tools: Vec<RegisteredTool>,
    index: HashMap<String, usize>,
}

impl Registry {
    /// Creates a builder.
    #[inline]
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Looks up a tool by name.
    pub fn lookup(&self, name: &str) -> Result<&RegisteredTool, RegistryError> {
        self.index
            .get(name)
            .map(|idx| &self.tools[*idx])
            .ok_or_else(|| RegistryError::UnknownTool(name.to_owned()))
    }

    /// Returns the definitions of all tools in registration order.
    pub fn definitions(&self) -> Vec<ModelTool> {
        self.tools.iter().map(RegisteredTool::definition).collect()
    }

    /// Returns the tool names in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.iter().map(RegisteredTool::name)
    }

    /// Returns the number of tools.
    #[inline]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Returns `true` if no tool is registered.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
