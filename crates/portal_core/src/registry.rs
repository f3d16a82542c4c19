use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use crate::descriptor::PluginDescriptor;
use crate::error::PortalError;

/// Summary of one plugin for listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginInfo {
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: String,
    pub category: String,
    pub tags: Vec<String>,
    pub base_url: String,
    pub enabled: bool,
    pub requires_login: bool,
}

impl From<&PluginDescriptor> for PluginInfo {
    fn from(descriptor: &PluginDescriptor) -> Self {
        Self {
            id: descriptor.id.clone(),
            name: descriptor.display_name().to_string(),
            version: descriptor.version.clone(),
            description: descriptor.description.clone(),
            category: descriptor.category.clone(),
            tags: descriptor.tags.clone(),
            base_url: descriptor.base_url.clone(),
            enabled: descriptor.enabled,
            requires_login: descriptor.requires_login(),
        }
    }
}

/// Descriptors keyed by plugin id, ordered by id.
///
/// The enable flag is the only mutable part; reads hand out clones.
#[derive(Debug, Default)]
pub struct PluginRegistry {
    plugins: RwLock<BTreeMap<String, PluginDescriptor>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_descriptors(descriptors: impl IntoIterator<Item = PluginDescriptor>) -> Self {
        let registry = Self::new();
        for descriptor in descriptors {
            registry.insert(descriptor);
        }
        registry
    }

    /// Adds or replaces a descriptor. Returns the replaced one, if any.
    pub fn insert(&self, descriptor: PluginDescriptor) -> Option<PluginDescriptor> {
        self.plugins
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(descriptor.id.clone(), descriptor)
    }

    pub fn list(&self) -> Vec<PluginDescriptor> {
        self.plugins
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn get(&self, plugin_id: &str) -> Result<PluginDescriptor, PortalError> {
        self.plugins
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(plugin_id)
            .cloned()
            .ok_or_else(|| PortalError::UnknownPlugin {
                plugin_id: plugin_id.to_string(),
            })
    }

    pub fn info(&self, plugin_id: &str) -> Result<PluginInfo, PortalError> {
        self.get(plugin_id).map(|descriptor| PluginInfo::from(&descriptor))
    }

    pub fn enable(&self, plugin_id: &str) -> Result<(), PortalError> {
        self.set_enabled(plugin_id, true)
    }

    pub fn disable(&self, plugin_id: &str) -> Result<(), PortalError> {
        self.set_enabled(plugin_id, false)
    }

    /// Plugin summaries grouped by category; both levels sorted.
    pub fn by_category(&self) -> BTreeMap<String, Vec<PluginInfo>> {
        let mut grouped: BTreeMap<String, Vec<PluginInfo>> = BTreeMap::new();
        for descriptor in self
            .plugins
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
        {
            grouped
                .entry(descriptor.category.clone())
                .or_default()
                .push(PluginInfo::from(descriptor));
        }
        grouped
    }

    pub fn len(&self) -> usize {
        self.plugins
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn set_enabled(&self, plugin_id: &str, enabled: bool) -> Result<(), PortalError> {
        let mut plugins = self.plugins.write().unwrap_or_else(PoisonError::into_inner);
        let descriptor = plugins
            .get_mut(plugin_id)
            .ok_or_else(|| PortalError::UnknownPlugin {
                plugin_id: plugin_id.to_string(),
            })?;
        descriptor.enabled = enabled;
        Ok(())
    }
}
