//! Output formatting for discovery, build and configuration results
//!
//! JSON and YAML render the same serializable report; the human format is a
//! tree listing meant for a terminal.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::build::BuildReport;
use crate::config::NimbusConfig;
use crate::discovery::{DependencyGraph, DiscoveryOutcome, ResourceDetail};
use crate::engine::Image;

const RULE: &str = "\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}";

/// Output format enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// JSON format (machine-readable)
    Json,
    /// YAML format
    Yaml,
    /// Human-readable formatted text
    Human,
}

/// Serializable view of a discovery run
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryReport<'a> {
    pub project: &'a str,
    pub complete: bool,
    pub graph: &'a DependencyGraph,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub failures: BTreeMap<String, String>,
}

impl<'a> DiscoveryReport<'a> {
    pub fn new(project: &'a str, outcome: &'a DiscoveryOutcome) -> Self {
        Self {
            project,
            complete: outcome.is_complete(),
            graph: &outcome.graph,
            failures: outcome
                .failures
                .iter()
                .map(|(function, error)| (function.clone(), error.to_string()))
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
struct BuildSummary<'a> {
    images: BTreeMap<&'a str, &'a str>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    failures: BTreeMap<&'a str, String>,
}

impl<'a> From<&'a BuildReport> for BuildSummary<'a> {
    fn from(report: &'a BuildReport) -> Self {
        Self {
            images: report
                .images
                .iter()
                .map(|image| (image.component.as_str(), image.tag.as_str()))
                .collect(),
            failures: report
                .failures
                .iter()
                .map(|(component, error)| (component.as_str(), error.to_string()))
                .collect(),
        }
    }
}

pub struct OutputFormatter {
    format: OutputFormat,
}

impl OutputFormatter {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    pub fn format_discovery(&self, report: &DiscoveryReport<'_>) -> Result<String> {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(report)
                .context("Failed to serialize discovery result to JSON"),
            OutputFormat::Yaml => serde_yaml::to_string(report)
                .context("Failed to serialize discovery result to YAML"),
            OutputFormat::Human => Ok(self.format_discovery_human(report)),
        }
    }

    pub fn format_build(&self, report: &BuildReport) -> Result<String> {
        let summary = BuildSummary::from(report);
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&summary)
                .context("Failed to serialize build result to JSON"),
            OutputFormat::Yaml => serde_yaml::to_string(&summary)
                .context("Failed to serialize build result to YAML"),
            OutputFormat::Human => Ok(self.format_build_human(&summary)),
        }
    }

    pub fn format_images(&self, images: &[Image]) -> Result<String> {
        match self.format {
            OutputFormat::Json => {
                serde_json::to_string_pretty(images).context("Failed to serialize images to JSON")
            }
            OutputFormat::Yaml => {
                serde_yaml::to_string(images).context("Failed to serialize images to YAML")
            }
            OutputFormat::Human => Ok(self.format_images_human(images)),
        }
    }

    /// Formats configuration display
    pub fn format_config(&self, config: &NimbusConfig) -> Result<String> {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&config.to_display_map())
                .context("Failed to serialize config to JSON"),
            OutputFormat::Yaml => serde_yaml::to_string(&config.to_display_map())
                .context("Failed to serialize config to YAML"),
            OutputFormat::Human => Ok(config.to_string()),
        }
    }

    fn format_discovery_human(&self, report: &DiscoveryReport<'_>) -> String {
        let graph = report.graph;
        let mut output = String::new();

        if report.complete {
            output.push_str(&format!("\u{2713} Dependency Graph: {}\n", report.project));
        } else {
            output.push_str(&format!(
                "\u{26A0} Dependency Graph: {} (partial)\n",
                report.project
            ));
        }
        output.push_str(RULE);
        output.push_str("\n\n");

        output.push_str(&format!("Resources ({}):\n", graph.resource_count()));
        if graph.is_empty() {
            output.push_str("  (none)\n");
        }
        for resource in graph.resources() {
            output.push_str(&format!("  {} {}\n", resource.kind, resource.name));
            let mut lines = Vec::new();
            lines.push(format!(
                "declared by: {}",
                join(resource.claimed_by.iter().map(String::as_str))
            ));
            if !resource.access.is_empty() {
                lines.push(format!(
                    "access: {}",
                    resource
                        .access
                        .iter()
                        .map(|grant| grant.to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                ));
            }
            match &resource.detail {
                ResourceDetail::Plain => {}
                ResourceDetail::Policy { actions, resources } => {
                    lines.push(format!(
                        "actions: {}",
                        actions
                            .iter()
                            .map(|action| format!("{:?}", action))
                            .collect::<Vec<_>>()
                            .join(", ")
                    ));
                    lines.push(format!(
                        "on: {}",
                        resources
                            .iter()
                            .map(|key| key.to_string())
                            .collect::<Vec<_>>()
                            .join(", ")
                    ));
                }
                ResourceDetail::Api {
                    security_definitions,
                    security,
                    ..
                } => {
                    if !security_definitions.is_empty() {
                        lines.push(format!(
                            "security definitions: {}",
                            join(security_definitions.keys().map(String::as_str))
                        ));
                    }
                    for (name, scopes) in security {
                        lines.push(format!(
                            "security {}: [{}]",
                            name,
                            join(scopes.iter().map(String::as_str))
                        ));
                    }
                }
            }
            push_tree(&mut output, "    ", &lines);
        }
        output.push('\n');

        output.push_str(&format!("Functions ({}):\n", graph.functions().len()));
        for (function, triggers) in graph.functions() {
            output.push_str(&format!("  {}\n", function));
            let mut lines = Vec::new();
            for route in &triggers.routes {
                let methods = join(route.methods.iter().map(String::as_str));
                lines.push(format!("route {} {} [{}]", route.api, route.path, methods));
            }
            for schedule in &triggers.schedules {
                lines.push(format!("schedule {} \"{}\"", schedule.key, schedule.cron));
            }
            for topic in &triggers.subscriptions {
                lines.push(format!("subscription {}", topic));
            }
            if lines.is_empty() {
                lines.push("(no triggers)".to_string());
            }
            push_tree(&mut output, "    ", &lines);
        }

        if !graph.warnings().is_empty() {
            output.push_str("\nWarnings:\n");
            for warning in graph.warnings() {
                output.push_str(&format!("  \u{26A0} {}\n", warning));
            }
        }

        if !report.failures.is_empty() {
            output.push_str("\nFailures:\n");
            for (function, error) in &report.failures {
                output.push_str(&format!("  \u{2717} {}: {}\n", function, error));
            }
        }

        output
    }

    fn format_build_human(&self, summary: &BuildSummary<'_>) -> String {
        let mut output = String::new();
        output.push_str("Images:\n");
        if summary.images.is_empty() {
            output.push_str("  (none)\n");
        }
        for (component, tag) in &summary.images {
            output.push_str(&format!("  \u{2713} {:<24} {}\n", component, tag));
        }
        if !summary.failures.is_empty() {
            output.push_str("\nFailures:\n");
            for (component, error) in &summary.failures {
                output.push_str(&format!("  \u{2717} {}: {}\n", component, error));
            }
        }
        output
    }

    fn format_images_human(&self, images: &[Image]) -> String {
        if images.is_empty() {
            return "No images found\n".to_string();
        }

        let mut output = format!("{:<24} {:<48} {:>10}  {}\n", "COMPONENT", "TAG", "SIZE", "CREATED");
        for image in images {
            let tag = image.tags.first().map(String::as_str).unwrap_or("<none>");
            let created = image
                .created
                .map(|created| created.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "-".to_string());
            output.push_str(&format!(
                "{:<24} {:<48} {:>10}  {}\n",
                image.component,
                tag,
                human_size(image.size),
                created
            ));
        }
        output
    }
}

fn join<'a>(items: impl Iterator<Item = &'a str>) -> String {
    items.collect::<Vec<_>>().join(", ")
}

fn push_tree(output: &mut String, indent: &str, lines: &[String]) {
    for (i, line) in lines.iter().enumerate() {
        let connector = if i == lines.len() - 1 {
            "\u{2514}"
        } else {
            "\u{251C}"
        };
        output.push_str(&format!("{}{}\u{2500} {}\n", indent, connector, line));
    }
}

fn human_size(bytes: i64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = bytes.max(0) as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{}B", bytes.max(0))
    } else {
        format!("{:.1}{}", size, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::BuiltImage;
    use crate::discovery::{
        AccessMode, Action, ApiRoute, DiscoveryError, FunctionDependencies, PolicyDeclaration,
        ResourceKey, ResourceKind, ScheduleBinding,
    };
    use std::collections::BTreeSet;
    use std::time::Duration;

    fn create_outcome() -> DiscoveryOutcome {
        let mut orders = FunctionDependencies::new();
        orders.add_bucket("uploads");
        orders.add_api_handler(ApiRoute {
            api: "public".to_string(),
            path: "/orders".to_string(),
            methods: BTreeSet::from(["GET".to_string()]),
            security: None,
            security_disabled: false,
        });
        orders.add_policy(PolicyDeclaration::new(
            None,
            [Action::BucketFileGet],
            [ResourceKey::new(ResourceKind::Bucket, "uploads")],
        )
        .expect("valid policy"));

        let mut cleanup = FunctionDependencies::new();
        cleanup.add_schedule_handler(
            ScheduleBinding::from_rate("nightly", "1 day").expect("valid rate"),
        );

        let dependencies = BTreeMap::from([
            ("orders".to_string(), orders),
            ("cleanup".to_string(), cleanup),
        ]);
        let graph = DependencyGraph::build(
            dependencies
                .iter()
                .map(|(name, deps)| (name.as_str(), deps)),
        );

        DiscoveryOutcome {
            graph,
            dependencies,
            failures: BTreeMap::from([(
                "reports".to_string(),
                DiscoveryError::timeout("reports", Duration::from_secs(30)),
            )]),
        }
    }

    #[test]
    fn test_discovery_json_format() {
        let outcome = create_outcome();
        let report = DiscoveryReport::new("shop", &outcome);
        let output = OutputFormatter::new(OutputFormat::Json)
            .format_discovery(&report)
            .unwrap();

        let parsed: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(parsed["project"], "shop");
        assert_eq!(parsed["complete"], false);
        assert!(parsed["failures"]["reports"].is_string());
        assert!(output.contains("uploads"));
        assert!(output.contains("0 0 */1 * *"));
    }

    #[test]
    fn test_discovery_yaml_format() {
        let outcome = create_outcome();
        let report = DiscoveryReport::new("shop", &outcome);
        let output = OutputFormatter::new(OutputFormat::Yaml)
            .format_discovery(&report)
            .unwrap();

        let parsed: serde_yaml::Value = serde_yaml::from_str(&output).unwrap();
        assert_eq!(parsed["project"], serde_yaml::Value::from("shop"));
    }

    #[test]
    fn test_discovery_human_format() {
        let outcome = create_outcome();
        let report = DiscoveryReport::new("shop", &outcome);
        let output = OutputFormatter::new(OutputFormat::Human)
            .format_discovery(&report)
            .unwrap();

        assert!(output.contains("Dependency Graph: shop (partial)"));
        assert!(output.contains("bucket uploads"));
        assert!(output.contains(&format!("orders:{}", AccessMode::Read)));
        assert!(output.contains("route public /orders [GET]"));
        assert!(output.contains("schedule nightly"));
        assert!(output.contains("cleanup"));
        assert!(output.contains("Failures:"));
        assert!(output.contains("reports"));
    }

    #[test]
    fn test_build_formats() {
        let report = BuildReport {
            images: vec![BuiltImage {
                component: "orders".to_string(),
                tag: "shop-orders:0123456789ab".to_string(),
            }],
            failures: BTreeMap::new(),
        };

        let json = OutputFormatter::new(OutputFormat::Json)
            .format_build(&report)
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["images"]["orders"], "shop-orders:0123456789ab");
        assert!(parsed.get("failures").is_none());

        let human = OutputFormatter::new(OutputFormat::Human)
            .format_build(&report)
            .unwrap();
        assert!(human.contains("shop-orders:0123456789ab"));
    }

    #[test]
    fn test_images_human_empty() {
        let output = OutputFormatter::new(OutputFormat::Human)
            .format_images(&[])
            .unwrap();
        assert_eq!(output, "No images found\n");
    }

    #[test]
    fn test_config_formats() {
        let config = NimbusConfig::default();

        let json = OutputFormatter::new(OutputFormat::Json)
            .format_config(&config)
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["provider"], "aws");
        assert_eq!(parsed["session_timeout_secs"], "120");

        let human = OutputFormatter::new(OutputFormat::Human)
            .format_config(&config)
            .unwrap();
        assert!(human.contains("Nimbus Configuration:"));
    }

    #[test]
    fn test_human_size() {
        assert_eq!(human_size(512), "512B");
        assert_eq!(human_size(2048), "2.0KB");
        assert_eq!(human_size(5 * 1024 * 1024), "5.0MB");
    }
}
