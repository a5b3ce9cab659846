//! Name-spaced capability registry.
//!
//! Three catalogs (tools, resources, prompts) plus resource templates, all
//! keyed by public name and guarded by one mutex; a per-server inverse index
//! makes disconnect-time bulk removal cheap. Tools and prompts are published
//! as `{serverId}_{originalName}` (dots replaced by underscores); resource
//! URIs are globally unique already and pass through unchanged.

use std::collections::HashMap;

use mcpmux_protocol::{
    PromptDescriptor, ResourceDescriptor, ResourceTemplateDescriptor, ToolDescriptor,
};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::config::ServerId;

/// Which catalog a list-changed event concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListChanged {
    /// `notifications/tools/list_changed`
    Tools,
    /// `notifications/resources/list_changed`
    Resources,
    /// `notifications/prompts/list_changed`
    Prompts,
}

/// One registered capability.
#[derive(Debug, Clone)]
pub struct CapabilityRecord {
    /// Owning server.
    pub server_id: ServerId,
    /// Name (or URI) the upstream knows it by.
    pub original_name: String,
    /// Name the hub publishes it under.
    pub public_name: String,
    /// Raw descriptor with the name already rewritten to the public one.
    pub descriptor: Value,
}

#[derive(Debug, Default)]
struct PerServerIndex {
    tools: Vec<String>,
    resources: Vec<String>,
    templates: Vec<String>,
    prompts: Vec<String>,
}

#[derive(Debug, Default)]
struct Catalogs {
    tools: HashMap<String, CapabilityRecord>,
    resources: HashMap<String, CapabilityRecord>,
    templates: HashMap<String, CapabilityRecord>,
    prompts: HashMap<String, CapabilityRecord>,
    by_server: HashMap<ServerId, PerServerIndex>,
}

/// The registry. Mutations emit [`ListChanged`] events on the channel given
/// at construction; the hub forwards them to downstream sessions.
pub struct Registry {
    catalogs: Mutex<Catalogs>,
    events: mpsc::Sender<ListChanged>,
}

/// Build the public name for a tool or prompt.
pub fn public_name(server_id: &str, original: &str) -> String {
    format!(
        "{}_{}",
        server_id.replace('.', "_"),
        original.replace('.', "_")
    )
}

impl Registry {
    /// Registry wired to an event channel.
    pub fn new(events: mpsc::Sender<ListChanged>) -> Self {
        Self {
            catalogs: Mutex::new(Catalogs::default()),
            events,
        }
    }

    fn emit(&self, event: ListChanged) {
        if let Err(e) = self.events.try_send(event) {
            warn!(error = %e, "dropping list-changed event, channel saturated");
        }
    }

    /// Register a server's tools. Colliding public names are rejected
    /// one-by-one (first registration wins); the rest proceed. Returns the
    /// number of entries added.
    pub fn register_server_tools(&self, server_id: &str, tools: &[ToolDescriptor]) -> usize {
        let mut added = 0;
        {
            let mut catalogs = self.catalogs.lock();
            for tool in tools {
                let public = public_name(server_id, &tool.name);
                if catalogs.tools.contains_key(&public) {
                    error!(
                        server = %server_id,
                        tool = %tool.name,
                        public = %public,
                        "public tool name collision, entry rejected"
                    );
                    continue;
                }
                let mut descriptor =
                    serde_json::to_value(tool).unwrap_or(Value::Null);
                if let Some(object) = descriptor.as_object_mut() {
                    object.insert("name".to_string(), Value::String(public.clone()));
                }
                catalogs.tools.insert(
                    public.clone(),
                    CapabilityRecord {
                        server_id: server_id.to_string(),
                        original_name: tool.name.clone(),
                        public_name: public.clone(),
                        descriptor,
                    },
                );
                catalogs
                    .by_server
                    .entry(server_id.to_string())
                    .or_default()
                    .tools
                    .push(public);
                added += 1;
            }
        }
        if added > 0 {
            debug!(server = %server_id, count = added, "tools registered");
            self.emit(ListChanged::Tools);
        }
        added
    }

    /// Register a server's resources, keyed by their unchanged URI.
    pub fn register_server_resources(
        &self,
        server_id: &str,
        resources: &[ResourceDescriptor],
    ) -> usize {
        let mut added = 0;
        {
            let mut catalogs = self.catalogs.lock();
            for resource in resources {
                if catalogs.resources.contains_key(&resource.uri) {
                    error!(
                        server = %server_id,
                        uri = %resource.uri,
                        "resource URI collision, entry rejected"
                    );
                    continue;
                }
                let descriptor = serde_json::to_value(resource).unwrap_or(Value::Null);
                catalogs.resources.insert(
                    resource.uri.clone(),
                    CapabilityRecord {
                        server_id: server_id.to_string(),
                        original_name: resource.uri.clone(),
                        public_name: resource.uri.clone(),
                        descriptor,
                    },
                );
                catalogs
                    .by_server
                    .entry(server_id.to_string())
                    .or_default()
                    .resources
                    .push(resource.uri.clone());
                added += 1;
            }
        }
        if added > 0 {
            debug!(server = %server_id, count = added, "resources registered");
            self.emit(ListChanged::Resources);
        }
        added
    }

    /// Register a server's resource templates, keyed by URI template.
    pub fn register_server_templates(
        &self,
        server_id: &str,
        templates: &[ResourceTemplateDescriptor],
    ) -> usize {
        let mut added = 0;
        {
            let mut catalogs = self.catalogs.lock();
            for template in templates {
                if catalogs.templates.contains_key(&template.uri_template) {
                    error!(
                        server = %server_id,
                        template = %template.uri_template,
                        "resource template collision, entry rejected"
                    );
                    continue;
                }
                let descriptor = serde_json::to_value(template).unwrap_or(Value::Null);
                catalogs.templates.insert(
                    template.uri_template.clone(),
                    CapabilityRecord {
                        server_id: server_id.to_string(),
                        original_name: template.uri_template.clone(),
                        public_name: template.uri_template.clone(),
                        descriptor,
                    },
                );
                catalogs
                    .by_server
                    .entry(server_id.to_string())
                    .or_default()
                    .templates
                    .push(template.uri_template.clone());
                added += 1;
            }
        }
        if added > 0 {
            self.emit(ListChanged::Resources);
        }
        added
    }

    /// Register a server's prompts under their public names.
    pub fn register_server_prompts(
        &self,
        server_id: &str,
        prompts: &[PromptDescriptor],
    ) -> usize {
        let mut added = 0;
        {
            let mut catalogs = self.catalogs.lock();
            for prompt in prompts {
                let public = public_name(server_id, &prompt.name);
                if catalogs.prompts.contains_key(&public) {
                    error!(
                        server = %server_id,
                        prompt = %prompt.name,
                        public = %public,
                        "public prompt name collision, entry rejected"
                    );
                    continue;
                }
                let mut descriptor = serde_json::to_value(prompt).unwrap_or(Value::Null);
                if let Some(object) = descriptor.as_object_mut() {
                    object.insert("name".to_string(), Value::String(public.clone()));
                }
                catalogs.prompts.insert(
                    public.clone(),
                    CapabilityRecord {
                        server_id: server_id.to_string(),
                        original_name: prompt.name.clone(),
                        public_name: public.clone(),
                        descriptor,
                    },
                );
                catalogs
                    .by_server
                    .entry(server_id.to_string())
                    .or_default()
                    .prompts
                    .push(public);
                added += 1;
            }
        }
        if added > 0 {
            debug!(server = %server_id, count = added, "prompts registered");
            self.emit(ListChanged::Prompts);
        }
        added
    }

    /// Atomically remove everything a server registered. Called whenever a
    /// server leaves ACTIVE/IDLING.
    pub fn unregister_all(&self, server_id: &str) {
        let (tools, resources, prompts) = {
            let mut catalogs = self.catalogs.lock();
            let Some(index) = catalogs.by_server.remove(server_id) else {
                return;
            };
            for name in &index.tools {
                catalogs.tools.remove(name);
            }
            for uri in &index.resources {
                catalogs.resources.remove(uri);
            }
            for template in &index.templates {
                catalogs.templates.remove(template);
            }
            for name in &index.prompts {
                catalogs.prompts.remove(name);
            }
            (
                !index.tools.is_empty(),
                !index.resources.is_empty() || !index.templates.is_empty(),
                !index.prompts.is_empty(),
            )
        };
        debug!(server = %server_id, "capabilities unregistered");
        if tools {
            self.emit(ListChanged::Tools);
        }
        if resources {
            self.emit(ListChanged::Resources);
        }
        if prompts {
            self.emit(ListChanged::Prompts);
        }
    }

    /// Resolve a public tool name to `(server, original name)`.
    pub fn resolve_tool(&self, public: &str) -> Option<(ServerId, String)> {
        let catalogs = self.catalogs.lock();
        catalogs
            .tools
            .get(public)
            .map(|record| (record.server_id.clone(), record.original_name.clone()))
    }

    /// Resolve a resource URI to `(server, uri)`.
    pub fn resolve_resource(&self, uri: &str) -> Option<(ServerId, String)> {
        let catalogs = self.catalogs.lock();
        catalogs
            .resources
            .get(uri)
            .map(|record| (record.server_id.clone(), record.original_name.clone()))
    }

    /// Resolve a public prompt name to `(server, original name)`.
    pub fn resolve_prompt(&self, public: &str) -> Option<(ServerId, String)> {
        let catalogs = self.catalogs.lock();
        catalogs
            .prompts
            .get(public)
            .map(|record| (record.server_id.clone(), record.original_name.clone()))
    }

    /// All tool descriptors, public names in place.
    pub fn list_tools(&self) -> Vec<Value> {
        let catalogs = self.catalogs.lock();
        let mut items: Vec<_> = catalogs.tools.values().collect();
        items.sort_by(|a, b| a.public_name.cmp(&b.public_name));
        items.iter().map(|record| record.descriptor.clone()).collect()
    }

    /// All resource descriptors.
    pub fn list_resources(&self) -> Vec<Value> {
        let catalogs = self.catalogs.lock();
        let mut items: Vec<_> = catalogs.resources.values().collect();
        items.sort_by(|a, b| a.public_name.cmp(&b.public_name));
        items.iter().map(|record| record.descriptor.clone()).collect()
    }

    /// All resource template descriptors.
    pub fn list_resource_templates(&self) -> Vec<Value> {
        let catalogs = self.catalogs.lock();
        let mut items: Vec<_> = catalogs.templates.values().collect();
        items.sort_by(|a, b| a.public_name.cmp(&b.public_name));
        items.iter().map(|record| record.descriptor.clone()).collect()
    }

    /// All prompt descriptors, public names in place.
    pub fn list_prompts(&self) -> Vec<Value> {
        let catalogs = self.catalogs.lock();
        let mut items: Vec<_> = catalogs.prompts.values().collect();
        items.sort_by(|a, b| a.public_name.cmp(&b.public_name));
        items.iter().map(|record| record.descriptor.clone()).collect()
    }

    /// Catalog sizes `(tools, resources, prompts)`.
    pub fn counts(&self) -> (usize, usize, usize) {
        let catalogs = self.catalogs.lock();
        (
            catalogs.tools.len(),
            catalogs.resources.len(),
            catalogs.prompts.len(),
        )
    }
}
