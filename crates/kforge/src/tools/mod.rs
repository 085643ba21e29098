//! External tool locations and typed adapters around them.

pub mod avbtool;
pub mod magiskboot;

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::config::ConfigDoc;
use crate::error::{Error, Result};

/// `[tools]`: program names or paths for every external collaborator.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub make: String,
    pub git: String,
    pub tar: String,
    pub zip: String,
    pub openssl: String,
    pub magiskboot: String,
    pub avbtool: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            make: "make".into(),
            git: "git".into(),
            tar: "tar".into(),
            zip: "zip".into(),
            openssl: "openssl".into(),
            magiskboot: "magiskboot".into(),
            avbtool: "avbtool".into(),
        }
    }
}

impl ToolsConfig {
    pub fn load(doc: &ConfigDoc) -> Result<Self> {
        doc.section("tools")
    }
}

/// Where to get a tool when it is missing.
pub fn remediation_hint(tool: &str) -> &'static str {
    let name = Path::new(tool)
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or(tool);
    match name {
        "magiskboot" => "download a magiskboot binary for your host and put it on PATH",
        "avbtool" | "avbtool.py" => {
            "install avbtool from AOSP external/avb (python3 required) and put it on PATH"
        }
        "openssl" => "install OpenSSL (e.g. `apt install openssl`)",
        "zip" => "install Info-ZIP (e.g. `apt install zip`)",
        "make" => "install GNU make (e.g. `apt install build-essential`)",
        "git" => "install git (e.g. `apt install git`)",
        "tar" => "install GNU tar",
        _ => "install it or set its path under [tools]",
    }
}

/// Resolve a configured tool to an executable path. Values containing a path
/// separator are taken literally; bare names are looked up on `PATH`.
pub fn locate(tool: &str) -> Result<PathBuf> {
    let tool = tool.trim();
    if tool.is_empty() {
        return Err(Error::config("empty tool name under [tools]"));
    }
    if tool.contains(std::path::MAIN_SEPARATOR) {
        let p = PathBuf::from(tool);
        return if p.is_file() {
            Ok(p)
        } else {
            Err(Error::missing_tool(format!(
                "required tool '{tool}' does not exist; {}",
                remediation_hint(tool)
            )))
        };
    }
    which::which(tool).map_err(|_| {
        Error::missing_tool(format!(
            "required tool '{tool}' not found on PATH; {}",
            remediation_hint(tool)
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn missing_tool_carries_hint() {
        let err = locate("magiskboot-definitely-not-installed").expect_err("missing");
        assert_eq!(err.kind(), ErrorKind::MissingTool);

        let err = locate("/nonexistent/dir/avbtool").expect_err("missing path");
        assert!(err.to_string().contains("external/avb"), "{err}");
    }

    #[test]
    fn finds_shell_on_path() {
        assert!(locate("sh").is_ok());
    }
}
