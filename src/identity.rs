//! Identity service

use crate::domain::csi::{
    GetPluginCapabilitiesResponse, GetPluginInfoResponse, PluginCapability, ProbeResponse,
};
use std::collections::BTreeMap;

/// Name the plugin registers under
pub const PLUGIN_NAME: &str = "com.open-e.joviandss.csi";

/// Answers identity queries for both plugin halves
#[derive(Debug, Clone)]
pub struct IdentityService {
    serves_controller: bool,
}

impl IdentityService {
    pub fn new(serves_controller: bool) -> Self {
        Self { serves_controller }
    }

    pub fn get_plugin_info(&self) -> GetPluginInfoResponse {
        GetPluginInfoResponse {
            name: PLUGIN_NAME.to_string(),
            vendor_version: crate::VERSION.to_string(),
            manifest: BTreeMap::new(),
        }
    }

    pub fn get_plugin_capabilities(&self) -> GetPluginCapabilitiesResponse {
        let capabilities = if self.serves_controller {
            vec![PluginCapability::ControllerService]
        } else {
            Vec::new()
        };
        GetPluginCapabilitiesResponse { capabilities }
    }

    pub fn probe(&self) -> ProbeResponse {
        ProbeResponse { ready: true }
    }
}
