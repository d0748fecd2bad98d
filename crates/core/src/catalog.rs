//! Merged directory of tools, resources, resource templates and prompts.
//!
//! Each server contributes a [`ServerCatalog`] slice. Slices are merged in
//! connection order and the last server to advertise a key owns it. A
//! [`MergeReport`] lists the replacements across servers that were not
//! already in effect before the change. Removing or refreshing a slice
//! rebuilds the merged maps from the remaining slices, so a key shadowed by a
//! departed server reappears.

use crate::types::{
    PromptDescriptor, ResourceDescriptor, ResourceTemplateDescriptor, ServerId, ToolDescriptor,
};
use std::collections::{BTreeMap, HashMap};

/// A catalog item together with the server that routes it
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry<T> {
    pub server: ServerId,
    pub item: T,
}

/// Everything one server advertised
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerCatalog {
    pub tools: Vec<ToolDescriptor>,
    pub resources: Vec<ResourceDescriptor>,
    pub resource_templates: Vec<ResourceTemplateDescriptor>,
    pub prompts: Vec<PromptDescriptor>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogKind {
    Tool,
    Resource,
    ResourceTemplate,
    Prompt,
}

impl std::fmt::Display for CatalogKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Tool => "tool",
            Self::Resource => "resource",
            Self::ResourceTemplate => "resource template",
            Self::Prompt => "prompt",
        };
        f.write_str(s)
    }
}

/// A key that moved from one server to another during a merge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collision {
    pub kind: CatalogKind,
    pub key: String,
    pub previous: ServerId,
    pub winner: ServerId,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeReport {
    pub collisions: Vec<Collision>,
}

impl MergeReport {
    pub fn is_clean(&self) -> bool {
        self.collisions.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct Catalog {
    order: Vec<ServerId>,
    slices: HashMap<ServerId, ServerCatalog>,
    tools: BTreeMap<String, CatalogEntry<ToolDescriptor>>,
    resources: BTreeMap<String, CatalogEntry<ResourceDescriptor>>,
    resource_templates: BTreeMap<String, CatalogEntry<ResourceTemplateDescriptor>>,
    prompts: BTreeMap<String, CatalogEntry<PromptDescriptor>>,
    /// Replacements currently in effect
    collisions: Vec<Collision>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a server's slice. A server seen before keeps its position in the
    /// merge order and its slice is replaced.
    pub fn merge(&mut self, server: ServerId, slice: ServerCatalog) -> MergeReport {
        if self.slices.contains_key(&server) {
            self.slices.insert(server, slice);
            return self.rebuild();
        }

        let mut report = MergeReport::default();
        self.apply(&server, &slice, &mut report);
        self.order.push(server.clone());
        self.slices.insert(server, slice);
        self.collisions.extend(report.collisions.iter().cloned());
        report
    }

    /// Mutate one server's slice in place and rebuild.
    pub fn refresh<F>(&mut self, server: &ServerId, update: F) -> Option<MergeReport>
    where
        F: FnOnce(&mut ServerCatalog),
    {
        let slice = self.slices.get_mut(server)?;
        update(slice);
        Some(self.rebuild())
    }

    /// Drop a server's slice. Returns false if the server was unknown.
    pub fn remove(&mut self, server: &ServerId) -> bool {
        if self.slices.remove(server).is_none() {
            return false;
        }
        self.order.retain(|s| s != server);
        self.rebuild();
        true
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.slices.clear();
        self.tools.clear();
        self.resources.clear();
        self.resource_templates.clear();
        self.prompts.clear();
        self.collisions.clear();
    }

    /// Replacements in effect after the last change.
    pub fn collisions(&self) -> &[Collision] {
        &self.collisions
    }

    pub fn servers(&self) -> &[ServerId] {
        &self.order
    }

    pub fn slice(&self, server: &ServerId) -> Option<&ServerCatalog> {
        self.slices.get(server)
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn tool(&self, name: &str) -> Option<&CatalogEntry<ToolDescriptor>> {
        self.tools.get(name)
    }

    pub fn resource(&self, uri: &str) -> Option<&CatalogEntry<ResourceDescriptor>> {
        self.resources.get(uri)
    }

    pub fn prompt(&self, name: &str) -> Option<&CatalogEntry<PromptDescriptor>> {
        self.prompts.get(name)
    }

    /// Find the template whose pattern matches `uri`, preferring the most
    /// recently connected server when several match.
    pub fn resource_template_for(
        &self,
        uri: &str,
    ) -> Option<&CatalogEntry<ResourceTemplateDescriptor>> {
        self.resource_templates
            .values()
            .filter(|entry| uri_template_matches(&entry.item.uri_template, uri))
            .max_by_key(|entry| self.position(&entry.server))
    }

    /// Server that should serve `uri`: exact resource first, then template.
    pub fn resource_owner(&self, uri: &str) -> Option<&ServerId> {
        self.resource(uri)
            .map(|e| &e.server)
            .or_else(|| self.resource_template_for(uri).map(|e| &e.server))
    }

    pub fn tools(&self) -> impl Iterator<Item = &CatalogEntry<ToolDescriptor>> {
        self.tools.values()
    }

    pub fn resources(&self) -> impl Iterator<Item = &CatalogEntry<ResourceDescriptor>> {
        self.resources.values()
    }

    pub fn resource_templates(
        &self,
    ) -> impl Iterator<Item = &CatalogEntry<ResourceTemplateDescriptor>> {
        self.resource_templates.values()
    }

    pub fn prompts(&self) -> impl Iterator<Item = &CatalogEntry<PromptDescriptor>> {
        self.prompts.values()
    }

    fn position(&self, server: &ServerId) -> usize {
        self.order.iter().position(|s| s == server).unwrap_or(0)
    }

    /// Re-merge every slice. Only collisions that were not in effect before
    /// are reported.
    fn rebuild(&mut self) -> MergeReport {
        self.tools.clear();
        self.resources.clear();
        self.resource_templates.clear();
        self.prompts.clear();

        let mut current = MergeReport::default();
        let order = self.order.clone();
        for server in &order {
            if let Some(slice) = self.slices.get(server).cloned() {
                self.apply(server, &slice, &mut current);
            }
        }

        let previous = std::mem::replace(&mut self.collisions, current.collisions.clone());
        MergeReport {
            collisions: current
                .collisions
                .into_iter()
                .filter(|c| !previous.contains(c))
                .collect(),
        }
    }

    fn apply(&mut self, server: &ServerId, slice: &ServerCatalog, report: &mut MergeReport) {
        for tool in &slice.tools {
            insert(&mut self.tools, CatalogKind::Tool, &tool.name, server, tool, report);
        }
        for resource in &slice.resources {
            insert(
                &mut self.resources,
                CatalogKind::Resource,
                &resource.uri,
                server,
                resource,
                report,
            );
        }
        for template in &slice.resource_templates {
            insert(
                &mut self.resource_templates,
                CatalogKind::ResourceTemplate,
                &template.uri_template,
                server,
                template,
                report,
            );
        }
        for prompt in &slice.prompts {
            insert(&mut self.prompts, CatalogKind::Prompt, &prompt.name, server, prompt, report);
        }
    }
}

fn insert<T: Clone>(
    map: &mut BTreeMap<String, CatalogEntry<T>>,
    kind: CatalogKind,
    key: &str,
    server: &ServerId,
    item: &T,
    report: &mut MergeReport,
) {
    let entry = CatalogEntry {
        server: server.clone(),
        item: item.clone(),
    };
    if let Some(previous) = map.insert(key.to_string(), entry) {
        if previous.server != *server {
            report.collisions.push(Collision {
                kind,
                key: key.to_string(),
                previous: previous.server,
                winner: server.clone(),
            });
        }
    }
}

enum TemplatePart<'a> {
    Literal(&'a str),
    Variable { reserved: bool },
}

fn parse_template(template: &str) -> Option<Vec<TemplatePart<'_>>> {
    let mut parts = Vec::new();
    let mut rest = template;

    while !rest.is_empty() {
        match rest.find('{') {
            Some(0) => {
                let close = rest.find('}')?;
                let expr = &rest[1..close];
                let reserved = expr.starts_with('+') || expr.starts_with('#');
                parts.push(TemplatePart::Variable { reserved });
                rest = &rest[close + 1..];
            }
            Some(open) => {
                parts.push(TemplatePart::Literal(&rest[..open]));
                rest = &rest[open..];
            }
            None => {
                if rest.contains('}') {
                    return None;
                }
                parts.push(TemplatePart::Literal(rest));
                rest = "";
            }
        }
    }

    Some(parts)
}

fn match_parts(parts: &[TemplatePart<'_>], input: &str) -> bool {
    match parts.split_first() {
        None => input.is_empty(),
        Some((TemplatePart::Literal(lit), rest)) => input
            .strip_prefix(lit)
            .is_some_and(|remaining| match_parts(rest, remaining)),
        Some((TemplatePart::Variable { reserved }, rest)) => {
            for (i, c) in input.char_indices() {
                if !reserved && c == '/' {
                    break;
                }
                let end = i + c.len_utf8();
                if match_parts(rest, &input[end..]) {
                    return true;
                }
            }
            false
        }
    }
}

/// Match a concrete uri against a simple RFC 6570 template.
///
/// `{var}` matches one or more characters other than `/`; `{+var}` and
/// `{#var}` also match `/`.
pub fn uri_template_matches(template: &str, uri: &str) -> bool {
    parse_template(template).is_some_and(|parts| match_parts(&parts, uri))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(name: &str) -> ToolDescriptor {
        ToolDescriptor::new(name, json!({"type": "object"}))
    }

    fn slice_with_tools(names: &[&str]) -> ServerCatalog {
        ServerCatalog {
            tools: names.iter().map(|n| tool(n)).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_last_registered_wins() {
        let mut catalog = Catalog::new();
        let a = ServerId::new("a");
        let b = ServerId::new("b");

        assert!(catalog.merge(a.clone(), slice_with_tools(&["x", "only_a"])).is_clean());
        let report = catalog.merge(b.clone(), slice_with_tools(&["x"]));

        assert_eq!(catalog.tool("x").unwrap().server, b);
        assert_eq!(catalog.tool("only_a").unwrap().server, a);
        assert_eq!(
            report.collisions,
            vec![Collision {
                kind: CatalogKind::Tool,
                key: "x".into(),
                previous: a,
                winner: b,
            }]
        );
    }

    #[test]
    fn test_remove_restores_shadowed_entry() {
        let mut catalog = Catalog::new();
        let a = ServerId::new("a");
        let b = ServerId::new("b");
        catalog.merge(a.clone(), slice_with_tools(&["x"]));
        catalog.merge(b.clone(), slice_with_tools(&["x", "y"]));

        assert!(catalog.remove(&b));
        assert_eq!(catalog.tool("x").unwrap().server, a);
        assert!(catalog.tool("y").is_none());
        assert!(!catalog.remove(&b));
    }

    #[test]
    fn test_refresh_keeps_merge_position() {
        let mut catalog = Catalog::new();
        let a = ServerId::new("a");
        let b = ServerId::new("b");
        catalog.merge(a.clone(), slice_with_tools(&["x"]));
        catalog.merge(b.clone(), slice_with_tools(&["x"]));

        // a refreshing its list does not make it the latest server
        catalog
            .refresh(&a, |slice| slice.tools.push(tool("z")))
            .unwrap();
        assert_eq!(catalog.tool("x").unwrap().server, b);
        assert_eq!(catalog.tool("z").unwrap().server, a);
        assert_eq!(catalog.servers(), &[a, b]);
    }

    #[test]
    fn test_refresh_reports_only_new_collisions() {
        let mut catalog = Catalog::new();
        let a = ServerId::new("a");
        let b = ServerId::new("b");
        catalog.merge(a.clone(), slice_with_tools(&["x", "y"]));
        assert_eq!(catalog.merge(b.clone(), slice_with_tools(&["x"])).collisions.len(), 1);

        // the x collision is already known
        let report = catalog.refresh(&b, |slice| slice.tools.push(tool("z"))).unwrap();
        assert!(report.is_clean());

        let report = catalog.refresh(&b, |slice| slice.tools.push(tool("y"))).unwrap();
        assert_eq!(report.collisions.len(), 1);
        assert_eq!(report.collisions[0].key, "y");
        assert_eq!(catalog.collisions().len(), 2);

        catalog.remove(&b);
        assert!(catalog.collisions().is_empty());
    }

    #[test]
    fn test_refresh_unknown_server() {
        let mut catalog = Catalog::new();
        assert!(catalog.refresh(&ServerId::new("nope"), |_| {}).is_none());
    }

    #[test]
    fn test_resource_owner_falls_back_to_template() {
        let mut catalog = Catalog::new();
        let notes = ServerId::new("notes");
        catalog.merge(
            notes.clone(),
            ServerCatalog {
                resources: vec![ResourceDescriptor::new("notes://index", "index")],
                resource_templates: vec![ResourceTemplateDescriptor {
                    uri_template: "notes://{id}".into(),
                    name: "note".into(),
                    title: None,
                    description: None,
                    mime_type: None,
                }],
                ..Default::default()
            },
        );

        assert_eq!(catalog.resource_owner("notes://index"), Some(&notes));
        assert_eq!(catalog.resource_owner("notes://42"), Some(&notes));
        assert_eq!(catalog.resource_owner("notes://a/b"), None);
        assert_eq!(catalog.resource_owner("files://42"), None);
    }

    #[test]
    fn test_uri_template_matching() {
        assert!(uri_template_matches("users://{id}/profile", "users://7/profile"));
        assert!(!uri_template_matches("users://{id}/profile", "users:///profile"));
        assert!(uri_template_matches("file:///{+path}", "file:///a/b/c.txt"));
        assert!(!uri_template_matches("file:///{path}", "file:///a/b"));
        assert!(uri_template_matches("static://x", "static://x"));
        assert!(!uri_template_matches("broken://{id", "broken://1"));
    }
}
