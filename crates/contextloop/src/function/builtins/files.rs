use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::json;

use crate::error::Error;
use crate::function::{AgentFunction, FunctionOutput};
use crate::llm::types::FunctionDefinition;
use crate::workspace::Workspace;

use super::str_arg;

pub struct ReadFile {
    workspace: Arc<Workspace>,
}

impl ReadFile {
    pub fn new(workspace: Arc<Workspace>) -> Self {
        Self { workspace }
    }
}

impl AgentFunction for ReadFile {
    fn definition(&self) -> FunctionDefinition {
        FunctionDefinition {
            name: "read_file".into(),
            description: "Read a UTF-8 text file from the workspace.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Path relative to the workspace root"
                    }
                },
                "required": ["path"]
            }),
        }
    }

    fn execute(
        &self,
        args: serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<FunctionOutput, Error>> + Send + '_>> {
        Box::pin(async move {
            let path = str_arg(&args, "path")?;
            let content = self.workspace.read(path).await?;
            Ok(FunctionOutput::success(format!("Read {path}"), content))
        })
    }
}

pub struct WriteFile {
    workspace: Arc<Workspace>,
}

impl WriteFile {
    pub fn new(workspace: Arc<Workspace>) -> Self {
        Self { workspace }
    }
}

impl AgentFunction for WriteFile {
    fn definition(&self) -> FunctionDefinition {
        FunctionDefinition {
            name: "write_file".into(),
            description: "Write a text file in the workspace, replacing any existing \
                          content. Parent directories are created as needed."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Path relative to the workspace root"
                    },
                    "content": {
                        "type": "string",
                        "description": "Full file content"
                    }
                },
                "required": ["path", "content"]
            }),
        }
    }

    fn execute(
        &self,
        args: serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<FunctionOutput, Error>> + Send + '_>> {
        Box::pin(async move {
            let path = str_arg(&args, "path")?;
            let content = str_arg(&args, "content")?;
            let written = self.workspace.write(path, content).await?;
            Ok(FunctionOutput::success(
                format!("Wrote {path}"),
                format!("Wrote {written} bytes to {path}"),
            ))
        })
    }
}

pub struct ListDirectory {
    workspace: Arc<Workspace>,
}

impl ListDirectory {
    pub fn new(workspace: Arc<Workspace>) -> Self {
        Self { workspace }
    }
}

impl AgentFunction for ListDirectory {
    fn definition(&self) -> FunctionDefinition {
        FunctionDefinition {
            name: "list_directory".into(),
            description: "List a workspace directory. Subdirectories end with '/'.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Directory relative to the workspace root (default '.')"
                    }
                }
            }),
        }
    }

    fn execute(
        &self,
        args: serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<FunctionOutput, Error>> + Send + '_>> {
        Box::pin(async move {
            let path = args.get("path").and_then(|v| v.as_str()).unwrap_or(".");
            let names = self.workspace.list(path).await?;
            let content = if names.is_empty() {
                "(empty directory)".to_string()
            } else {
                names.join("\n")
            };
            Ok(FunctionOutput::success(format!("Listed {path}"), content))
        })
    }
}
