//! TypeScript runtime definition

use super::{BuildTemplate, DevTemplate, RuntimeDefinition};

pub struct TypeScriptRuntime;

impl RuntimeDefinition for TypeScriptRuntime {
    fn language(&self) -> &'static str {
        "typescript"
    }

    fn extensions(&self) -> &[&'static str] {
        &["ts", "mts", "cts"]
    }

    fn build_template(&self) -> BuildTemplate {
        BuildTemplate {
            build_image: "node:20".to_string(),
            runtime_image: "node:20-slim".to_string(),
            build_commands: vec![
                "if [ -f package.json ]; then npm install --ignore-scripts; fi".to_string(),
                "npx --yes esbuild {handler} --bundle --platform=node --outfile=dist/index.js"
                    .to_string(),
            ],
            artifacts: vec!["dist".to_string()],
            entry: vec!["node".to_string(), "dist/index.js".to_string()],
        }
    }

    fn dev_template(&self) -> DevTemplate {
        DevTemplate {
            base_image: "node:20-slim".to_string(),
            setup_commands: vec!["npm install -g tsx".to_string()],
            prepare_commands: vec![
                "if [ -f package.json ]; then npm install --ignore-scripts; fi".to_string(),
            ],
            entry: vec!["tsx".to_string(), "{handler}".to_string()],
        }
    }
}
