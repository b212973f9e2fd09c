// src/app/templates.rs
// App wrapper and error placeholder templates

use crate::host::dom::{HOST_MARKER, TITLE_MARKER};

/// Prefix of the wrapper element id; the app id is appended
pub const WRAPPER_ID_PREFIX: &str = "portal-app-";

/// CSS class the wrapper carries while the app is starting
pub const LOADING_CLASS: &str = "loading";
/// CSS class the wrapper carries after a failed load
pub const ERROR_CLASS: &str = "error";

pub fn wrapper_dom_id(app_id: &str) -> String {
    format!("{}{}", WRAPPER_ID_PREFIX, app_id)
}

/// Lower-case, dash-separated plugin name usable as a CSS class
pub fn safe_plugin_name(plugin_name: &str) -> String {
    plugin_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect()
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn default_wrapper_template() -> String {
    format!(
        r#"<div class="portal-app-wrapper portal-app-{{{{safePluginName}}}}">
    <div class="portal-app-header">
        <div class="portal-app-header-title" {title}>{{{{title}}}}</div>
    </div>
    <div class="portal-app-host" {host}>
        <div class="portal-app-loading"><span></span></div>
    </div>
</div>"#,
        title = TITLE_MARKER,
        host = HOST_MARKER
    )
}

const DEFAULT_ERROR_TEMPLATE: &str =
    r#"<div class="portal-app-loading-error"><span>{{errorMessage}}</span></div>"#;

/// Renders the wrapper and error HTML from the page's templates or defaults.
///
/// Placeholders: `{{appId}}`, `{{pluginName}}`, `{{safePluginName}}`,
/// `{{title}}` and, in the error template, `{{errorMessage}}`.
#[derive(Debug, Clone)]
pub struct Templates {
    wrapper: String,
    error: String,
}

impl Templates {
    pub fn new(wrapper: Option<&str>, error: Option<&str>) -> Self {
        Self {
            wrapper: wrapper.map(str::to_string).unwrap_or_else(default_wrapper_template),
            error: error.unwrap_or(DEFAULT_ERROR_TEMPLATE).to_string(),
        }
    }

    pub fn render_wrapper(&self, app_id: &str, plugin_name: &str, title: &str) -> String {
        self.wrapper
            .replace("{{appId}}", &escape_html(app_id))
            .replace("{{pluginName}}", &escape_html(plugin_name))
            .replace("{{safePluginName}}", &safe_plugin_name(plugin_name))
            .replace("{{title}}", &escape_html(title))
    }

    pub fn render_error(&self, app_id: &str, plugin_name: &str, title: &str, message: &str) -> String {
        self.error
            .replace("{{appId}}", &escape_html(app_id))
            .replace("{{pluginName}}", &escape_html(plugin_name))
            .replace("{{safePluginName}}", &safe_plugin_name(plugin_name))
            .replace("{{title}}", &escape_html(title))
            .replace("{{errorMessage}}", &escape_html(message))
    }
}

impl Default for Templates {
    fn default() -> Self {
        Self::new(None, None)
    }
}
