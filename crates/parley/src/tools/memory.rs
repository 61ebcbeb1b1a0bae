use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parley_core::tool::{Error as ToolError, Tool, ToolResult};
use schemars::{JsonSchema, schema_for};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::spawn_blocking;

type Memories = BTreeMap<String, String>;

/// Key that lists every memory when passed to `read_memory`.
const ALL_KEY: &str = "all";

/// A persistent key/value memory backed by one JSON file.
///
/// The file holds a flat object of strings. A missing file is an empty
/// memory, and so is a corrupted one, which gets replaced on the next
/// write.
#[derive(Debug)]
pub struct MemoryFile {
    path: PathBuf,
    // Serializes read-modify-write cycles of concurrent invocations. The
    // blocking task owns the guard, so it outlives an aborted invocation.
    lock: Arc<Mutex<()>>,
}

impl MemoryFile {
    /// Creates a memory stored at `path`. Nothing is read until a tool
    /// uses it.
    #[inline]
    pub fn new<P: Into<PathBuf>>(path: P) -> Arc<Self> {
        Arc::new(Self {
            path: path.into(),
            lock: Arc::new(Mutex::new(())),
        })
    }

    /// Returns the path of the backing file.
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn access<R, F>(&self, f: F) -> Result<R, ToolError>
    where
        R: Send + 'static,
        F: FnOnce(&mut Memories) -> (R, bool) + Send + 'static,
    {
        let guard = Arc::clone(&self.lock).lock_owned().await;
        let path = self.path.clone();
        spawn_blocking(move || {
            let _guard = guard;
            let mut memories = load(&path);
            let (result, dirty) = f(&mut memories);
            if dirty {
                save(&path, &memories).map_err(|err| {
                    error!("failed to save memory to {}: {err}", path.display());
                    ToolError::execution_error().with_reason("Failed to save memory")
                })?;
            }
            Ok(result)
        })
        .await
        .map_err(|_| ToolError::execution_error().with_reason("Failed to access memory"))?
    }
}

fn load(path: &Path) -> Memories {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == ErrorKind::NotFound => return Memories::new(),
        Err(err) => {
            warn!("failed to read memory file, starting fresh: {err}");
            return Memories::new();
        }
    };
    serde_json::from_str(&content).unwrap_or_else(|err| {
        warn!("memory file corrupted, starting fresh: {err}");
        Memories::new()
    })
}

fn save(path: &Path, memories: &Memories) -> io::Result<()> {
    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    let json = serde_json::to_string_pretty(memories)?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, json)?;
    fs::rename(tmp_path, path)
}

#[derive(Deserialize, JsonSchema)]
pub struct ReadMemoryParameters {
    #[schemars(
        description = "The key/name of the memory to read. Use 'all' to list all memories."
    )]
    key: String,
}

/// Reads a memory, or lists all of them.
pub struct ReadMemoryTool {
    memory: Arc<MemoryFile>,
    parameter_schema: Value,
}

impl ReadMemoryTool {
    /// Creates the tool on top of the given memory.
    #[inline]
    pub fn new(memory: Arc<MemoryFile>) -> Self {
        Self {
            memory,
            parameter_schema: schema_for!(ReadMemoryParameters).to_value(),
        }
    }
}

impl Tool for ReadMemoryTool {
    type Input = ReadMemoryParameters;

    fn name(&self) -> &str {
        "read_memory"
    }

    fn description(&self) -> &str {
        "Read a stored memory by key. Use this to recall information you've saved previously."
    }

    fn parameter_schema(&self) -> &Value {
        &self.parameter_schema
    }

    fn execute(
        &self,
        input: ReadMemoryParameters,
    ) -> impl Future<Output = ToolResult> + Send + 'static {
        let memory = Arc::clone(&self.memory);
        async move {
            memory
                .access(move |memories| (render(memories, &input.key), false))
                .await
        }
    }
}

fn render(memories: &Memories, key: &str) -> String {
    if key == ALL_KEY {
        if memories.is_empty() {
            return "No memories stored yet.".to_owned();
        }
        let mut listing = "Stored memories:".to_owned();
        for (key, value) in memories {
            // Writing into a `String` never fails.
            let _ = write!(listing, "\n- **{key}**: {value}");
        }
        return listing;
    }
    match memories.get(key) {
        Some(value) => format!("Memory '{key}': {value}"),
        None => format!("No memory found with key '{key}'."),
    }
}

#[derive(Deserialize, JsonSchema)]
pub struct WriteMemoryParameters {
    #[schemars(
        description = "A short, descriptive key/name for the memory (e.g., 'user_timezone', 'project_status')"
    )]
    key: String,
    #[schemars(description = "The information to remember")]
    value: String,
}

/// Saves or updates a memory.
pub struct WriteMemoryTool {
    memory: Arc<MemoryFile>,
    parameter_schema: Value,
}

impl WriteMemoryTool {
    /// Creates the tool on top of the given memory.
    #[inline]
    pub fn new(memory: Arc<MemoryFile>) -> Self {
        Self {
            memory,
            parameter_schema: schema_for!(WriteMemoryParameters).to_value(),
        }
    }
}

impl Tool for WriteMemoryTool {
    type Input = WriteMemoryParameters;

    fn name(&self) -> &str {
        "write_memory"
    }

    fn description(&self) -> &str {
        "Save or update a memory. Use this to remember important information for future \
         conversations, like user preferences, project details, or context."
    }

    fn parameter_schema(&self) -> &Value {
        &self.parameter_schema
    }

    fn execute(
        &self,
        input: WriteMemoryParameters,
    ) -> impl Future<Output = ToolResult> + Send + 'static {
        let memory = Arc::clone(&self.memory);
        async move {
            if input.key.trim().is_empty() {
                return Err(ToolError::invalid_input().with_reason("`key` must not be empty"));
            }
            memory
                .access(move |memories| {
                    let WriteMemoryParameters { key, value } = input;
                    let reply = if memories.contains_key(&key) {
                        format!("Updated memory '{key}'.")
                    } else {
                        format!("Saved new memory '{key}'.")
                    };
                    memories.insert(key, value);
                    (reply, true)
                })
                .await
        }
    }
}

#[derive(Deserialize, JsonSchema)]
pub struct DeleteMemoryParameters {
    #[schemars(description = "The key of the memory to delete")]
    key: String,
}

/// Deletes a memory.
pub struct DeleteMemoryTool {
    memory: Arc<MemoryFile>,
    parameter_schema: Value,
}

impl DeleteMemoryTool {
    /// Creates the tool on top of the given memory.
    #[inline]
    pub fn new(memory: Arc<MemoryFile>) -> Self {
        Self {
            memory,
            parameter_schema: schema_for!(DeleteMemoryParameters).to_value(),
        }
    }
}

impl Tool for DeleteMemoryTool {
    type Input = DeleteMemoryParameters;

    fn name(&self) -> &str {
        "delete_memory"
    }

    fn description(&self) -> &str {
        "Delete a stored memory by key."
    }

    fn parameter_schema(&self) -> &Value {
        &self.parameter_schema
    }

    fn execute(
        &self,
        input: DeleteMemoryParameters,
    ) -> impl Future<Output = ToolResult> + Send + 'static {
        let memory = Arc::clone(&self.memory);
        async move {
            memory
                .access(move |memories| match memories.remove(&input.key) {
                    Some(_) => (format!("Deleted memory '{}'.", input.key), true),
                    None => (format!("No memory found with key '{}'.", input.key), false),
                })
                .await
        }
    }
}
