//! Go runtime definition
//!
//! Go handlers are packages: the handler file is the package's `main.go` and the
//! whole directory is compiled.

use super::{BuildTemplate, DevTemplate, RuntimeDefinition};

pub struct GoRuntime;

impl RuntimeDefinition for GoRuntime {
    fn language(&self) -> &'static str {
        "go"
    }

    fn extensions(&self) -> &[&'static str] {
        &["go"]
    }

    fn build_template(&self) -> BuildTemplate {
        BuildTemplate {
            build_image: "golang:1.22-alpine".to_string(),
            runtime_image: "gcr.io/distroless/static-debian12".to_string(),
            build_commands: vec![
                "CGO_ENABLED=0 go build -o /app/bin/handler {handler_dir}".to_string(),
            ],
            artifacts: vec!["bin/handler".to_string()],
            entry: vec!["/app/bin/handler".to_string()],
        }
    }

    fn dev_template(&self) -> DevTemplate {
        DevTemplate {
            base_image: "golang:1.22-alpine".to_string(),
            setup_commands: vec!["apk add --no-cache git".to_string()],
            prepare_commands: vec!["go mod download".to_string()],
            entry: vec![
                "go".to_string(),
                "run".to_string(),
                "{handler_dir}".to_string(),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeProfile;
    use std::sync::Arc;

    #[test]
    fn test_go_builds_the_handler_package() {
        let profile = RuntimeProfile::new(Arc::new(GoRuntime));
        let dockerfile = profile.function_dockerfile("functions/orders/main.go", "gcp");
        assert!(dockerfile.contains("go build -o /app/bin/handler ./functions/orders"));
        assert!(dockerfile.contains("COPY --from=build /app/bin/handler /app/bin/handler"));
        assert_eq!(
            profile.entry_command("functions/orders/main.go"),
            vec!["/app/bin/handler".to_string()]
        );
    }
}
