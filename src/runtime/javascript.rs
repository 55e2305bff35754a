//! JavaScript runtime definition

use super::{BuildTemplate, DevTemplate, RuntimeDefinition};

pub struct JavaScriptRuntime;

impl RuntimeDefinition for JavaScriptRuntime {
    fn language(&self) -> &'static str {
        "javascript"
    }

    fn extensions(&self) -> &[&'static str] {
        &["js", "mjs", "cjs"]
    }

    fn build_template(&self) -> BuildTemplate {
        BuildTemplate {
            build_image: "node:20".to_string(),
            runtime_image: "node:20-slim".to_string(),
            build_commands: vec![
                "if [ -f package.json ]; then npm install --omit=dev --ignore-scripts; fi"
                    .to_string(),
            ],
            artifacts: vec![".".to_string()],
            entry: vec!["node".to_string(), "{handler}".to_string()],
        }
    }

    fn dev_template(&self) -> DevTemplate {
        DevTemplate {
            base_image: "node:20-slim".to_string(),
            setup_commands: vec![],
            prepare_commands: vec![
                "if [ -f package.json ]; then npm install --ignore-scripts; fi".to_string(),
            ],
            entry: vec!["node".to_string(), "{handler}".to_string()],
        }
    }
}
