//! Python runtime definition

use super::{BuildTemplate, DevTemplate, RuntimeDefinition};

pub struct PythonRuntime;

impl RuntimeDefinition for PythonRuntime {
    fn language(&self) -> &'static str {
        "python"
    }

    fn extensions(&self) -> &[&'static str] {
        &["py"]
    }

    fn build_template(&self) -> BuildTemplate {
        BuildTemplate {
            build_image: "python:3.11-slim".to_string(),
            runtime_image: "python:3.11-slim".to_string(),
            build_commands: vec![
                "if [ -f requirements.txt ]; then pip install --no-cache-dir --target /app/.deps -r requirements.txt; fi"
                    .to_string(),
            ],
            artifacts: vec![".".to_string()],
            entry: vec![
                "env".to_string(),
                "PYTHONPATH=/app/.deps".to_string(),
                "python".to_string(),
                "{handler}".to_string(),
            ],
        }
    }

    fn dev_template(&self) -> DevTemplate {
        DevTemplate {
            base_image: "python:3.11-slim".to_string(),
            setup_commands: vec!["pip install --no-cache-dir --upgrade pip".to_string()],
            prepare_commands: vec![
                "if [ -f requirements.txt ]; then pip install --no-cache-dir -r requirements.txt; fi"
                    .to_string(),
            ],
            entry: vec!["python".to_string(), "{handler}".to_string()],
        }
    }
}
