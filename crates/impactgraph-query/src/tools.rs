//! Static tool descriptors offered alongside a context bundle.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

use crate::domains::Domain;

/// Tool schema handed to the consuming model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub domain: Domain,
    pub description: String,
    /// Selection weight in (0, 1]; acts as relevance when a bundle is trimmed.
    pub priority: f64,
    pub parameters: JsonValue,
}

impl ToolDescriptor {
    fn new(
        name: &str,
        domain: Domain,
        priority: f64,
        description: &str,
        parameters: JsonValue,
    ) -> Self {
        Self {
            name: name.to_string(),
            domain,
            description: description.to_string(),
            priority,
            parameters,
        }
    }

    /// Line the bundle is sized by.
    pub fn render(&self) -> String {
        format!("tool {} [{}]: {}", self.name, self.domain, self.description)
    }
}

fn entity_param(description: &str) -> JsonValue {
    json!({
        "type": "object",
        "properties": {
            "entity": { "type": "string", "description": description },
            "depth": {
                "type": "integer",
                "description": "Maximum traversal depth (1-10, defaults to 3)",
                "minimum": 1,
                "maximum": 10,
                "default": 3
            }
        },
        "required": ["entity"]
    })
}

fn text_param(description: &str) -> JsonValue {
    json!({
        "type": "object",
        "properties": {
            "query": { "type": "string", "description": description },
            "limit": {
                "type": "integer",
                "description": "Maximum number of results (defaults to 10)",
                "minimum": 1,
                "maximum": 100,
                "default": 10
            }
        },
        "required": ["query"]
    })
}

/// Collection of every tool the assembler may select.
pub struct ToolRegistry;

impl ToolRegistry {
    pub fn all() -> Vec<ToolDescriptor> {
        vec![
            ToolDescriptor::new(
                "get_transitive_dependencies",
                Domain::Code,
                0.9,
                "Follow dependency edges from an entity up to a depth and list everything it relies on.",
                entity_param("Canonical name or id of the entity to expand"),
            ),
            ToolDescriptor::new(
                "get_reverse_dependencies",
                Domain::Code,
                1.0,
                "List the dependents of an entity, i.e. what would be affected by changing it.",
                entity_param("Canonical name or id of the entity whose dependents are wanted"),
            ),
            ToolDescriptor::new(
                "trace_call_chain",
                Domain::Code,
                0.7,
                "Trace the chain of references leading from one entity to another.",
                json!({
                    "type": "object",
                    "properties": {
                        "from": { "type": "string", "description": "Starting entity" },
                        "to": { "type": "string", "description": "Target entity" }
                    },
                    "required": ["from", "to"]
                }),
            ),
            ToolDescriptor::new(
                "find_nodes_by_name",
                Domain::Code,
                0.8,
                "Resolve a name in any naming convention to the matching graph entities.",
                text_param("Name, alias or naming-convention variant to look up"),
            ),
            ToolDescriptor::new(
                "search_code_context",
                Domain::Code,
                0.6,
                "Search code entities whose names match the query terms.",
                text_param("Free-text search over code entity names"),
            ),
            ToolDescriptor::new(
                "lookup_config_key",
                Domain::Configuration,
                0.9,
                "Show where a configuration key is declared and which code and documents read it.",
                entity_param("Configuration key in any notation (dot path, env var, placeholder)"),
            ),
            ToolDescriptor::new(
                "list_config_overrides",
                Domain::Configuration,
                0.6,
                "List the artifacts that declare or override a configuration key.",
                entity_param("Configuration key in any notation"),
            ),
            ToolDescriptor::new(
                "search_documentation",
                Domain::Documentation,
                0.8,
                "Search documents and sections that mention the query terms.",
                text_param("Free-text search over documentation"),
            ),
            ToolDescriptor::new(
                "get_document_references",
                Domain::Documentation,
                0.6,
                "List the entities a document or section refers to.",
                entity_param("Document path or section name"),
            ),
            ToolDescriptor::new(
                "find_tests_for_entity",
                Domain::Testing,
                0.9,
                "List test cases and fixtures exercising an entity.",
                entity_param("Entity under test"),
            ),
            ToolDescriptor::new(
                "get_test_fixtures",
                Domain::Testing,
                0.5,
                "List fixtures shared by the tests of an entity.",
                entity_param("Entity or test case"),
            ),
            ToolDescriptor::new(
                "search_issues_by_text",
                Domain::Tracking,
                0.8,
                "Search issues whose title or body match the query terms.",
                text_param("Free-text search over issues"),
            ),
            ToolDescriptor::new(
                "find_open_issues_with_labels",
                Domain::Tracking,
                0.6,
                "List open issues carrying all of the given labels.",
                json!({
                    "type": "object",
                    "properties": {
                        "labels": {
                            "type": "array",
                            "items": { "type": "string" },
                            "description": "Labels every returned issue must carry"
                        }
                    },
                    "required": ["labels"]
                }),
            ),
            ToolDescriptor::new(
                "get_milestone_progress",
                Domain::Tracking,
                0.5,
                "Summarize open and closed issues of a milestone.",
                entity_param("Milestone name"),
            ),
            ToolDescriptor::new(
                "get_project_board",
                Domain::Tracking,
                0.4,
                "Show the columns and cards of a project board.",
                entity_param("Project name"),
            ),
        ]
    }

    pub fn get_by_name(name: &str) -> Option<ToolDescriptor> {
        Self::all().into_iter().find(|t| t.name == name)
    }

    pub fn tool_names() -> Vec<String> {
        Self::all().into_iter().map(|t| t.name).collect()
    }

    /// Tools of the given domains, ordered by domain, priority desc, name.
    pub fn select(domains: &BTreeSet<Domain>) -> Vec<ToolDescriptor> {
        let mut selected: Vec<ToolDescriptor> = Self::all()
            .into_iter()
            .filter(|t| domains.contains(&t.domain))
            .collect();
        selected.sort_by(|a, b| {
            a.domain
                .cmp(&b.domain)
                .then_with(|| b.priority.total_cmp(&a.priority))
                .then_with(|| a.name.cmp(&b.name))
        });
        selected
    }
}
