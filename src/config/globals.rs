// src/config/globals.rs
// Window-scoped values the server-rendered page hands to the runtime

use crate::app::AppSetup;
use serde::Deserialize;
use std::collections::HashMap;

/// Contract with the server-rendered page.
///
/// Every key carries the `portal` prefix. Read once when the client
/// services are built.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PortalGlobals {
    #[serde(rename = "portalApiPath", default)]
    pub api_path: String,
    #[serde(rename = "portalPageId", default)]
    pub page_id: String,
    #[serde(rename = "portalSiteId", default)]
    pub site_id: Option<String>,
    #[serde(rename = "portalDevMode", default)]
    pub dev_mode: bool,
    /// App setups rendered into the page, keyed by instance id
    #[serde(rename = "portalPreloadedAppSetup", default)]
    pub preloaded_app_setup: HashMap<String, AppSetup>,
    /// Extra client service key -> name of the global providing it
    #[serde(rename = "portalCustomClientServices", default)]
    pub custom_client_services: HashMap<String, String>,
    #[serde(rename = "portalAppWrapperTemplate", default)]
    pub app_wrapper_template: Option<String>,
    #[serde(rename = "portalAppErrorTemplate", default)]
    pub app_error_template: Option<String>,
    #[serde(rename = "portalCsrfToken", default)]
    pub csrf_token: Option<String>,
    #[serde(rename = "portalRemoteMessagingConnectUrl", default)]
    pub remote_messaging_connect_url: Option<String>,
    #[serde(rename = "portalRemoteMessagingPrivateUserTopic", default)]
    pub remote_messaging_private_user_topic: Option<String>,
    #[serde(rename = "portalLanguage", default)]
    pub language: Option<String>,
}

impl PortalGlobals {
    pub fn from_json(json: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_value(value: serde_json::Value) -> crate::Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// Absolute URL of an API path
    pub fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.api_path.trim_end_matches('/'), path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_globals() {
        let globals = PortalGlobals::from_value(json!({
            "portalApiPath": "http://localhost:5050/portal/web/___/api/",
            "portalPageId": "test-page",
            "portalDevMode": true,
            "portalPreloadedAppSetup": {
                "ABCD": {"pluginName": "Demo", "globalLaunchFunction": "startDemo"}
            },
            "portalCustomClientServices": {"demoService": "DemoService"},
            "portalRemoteMessagingPrivateUserTopic": "user/john",
            "unrelatedGlobal": 42
        }))
        .unwrap();

        assert_eq!(globals.page_id, "test-page");
        assert!(globals.dev_mode);
        assert_eq!(globals.preloaded_app_setup["ABCD"].plugin_name, "Demo");
        assert_eq!(
            globals.api_url("/portal-apps"),
            "http://localhost:5050/portal/web/___/api/portal-apps"
        );
        assert!(globals.csrf_token.is_none());
    }

    #[test]
    fn test_empty_globals() {
        let globals = PortalGlobals::from_json("{}").unwrap();
        assert!(!globals.dev_mode);
        assert!(globals.preloaded_app_setup.is_empty());
    }
}
