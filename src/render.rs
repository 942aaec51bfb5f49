//! App routing and the HTML shell served to authenticated clients

use crate::config::AppConfig;
use serde::Serialize;
use serde_json::Value;

/// Where a request path leads
#[derive(Debug, PartialEq)]
pub enum Route<'a> {
    /// Served by `app`; `scope` is the path below its basepath
    App { app: &'a AppConfig, scope: String },
    /// The path names a basepath without its trailing slash
    AddSlash(String),
    NotFound,
}

/// Route a path to the app with the longest matching basepath
pub fn route<'a>(apps: &'a [AppConfig], path: &str) -> Route<'a> {
    let matched = apps
        .iter()
        .filter(|app| path.starts_with(app.basepath.as_str()))
        .max_by_key(|app| app.basepath.len());

    if let Some(app) = matched {
        // A deeper app mounted at `path + "/"` wins over a shallower prefix match
        let wants_slash = apps.iter().any(|other| {
            other.basepath.len() > app.basepath.len() && other.basepath.strip_suffix('/') == Some(path)
        });
        if !wants_slash {
            return Route::App {
                app,
                scope: path[app.basepath.len()..].to_string(),
            };
        }
    }

    let with_slash = format!("{}/", path);
    if apps.iter().any(|app| app.basepath == with_slash) {
        return Route::AddSlash(with_slash);
    }
    Route::NotFound
}

/// Overlay `overlay` onto `base`; objects merge key by key, anything else replaces
pub fn merge_config(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            let mut merged = base.clone();
            for (key, value) in overlay {
                let next = match merged.get(key) {
                    Some(existing) => merge_config(existing, value),
                    None => value.clone(),
                };
                merged.insert(key.clone(), next);
            }
            Value::Object(merged)
        }
        (base, Value::Null) => base.clone(),
        (_, overlay) => overlay.clone(),
    }
}

/// Data handed to the client bundle
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellState<'a> {
    pub app: &'a str,
    pub basepath: &'a str,
    pub config: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logout_url: Option<&'a str>,
}

impl<'a> ShellState<'a> {
    pub fn new(app: &'a AppConfig, client: &Value, version: Option<&'a str>) -> Self {
        Self {
            app: &app.name,
            basepath: &app.basepath,
            config: merge_config(client, &app.config),
            version,
            user: None,
            logout_url: None,
        }
    }

    /// Attach the resolved session (builder pattern)
    pub fn with_user(mut self, user: Option<&'a str>, logout_url: Option<&'a str>) -> Self {
        self.user = user;
        self.logout_url = logout_url;
        self
    }
}

/// Render the HTML shell for an app
pub fn render_shell(title: &str, state: &ShellState<'_>) -> String {
    let payload = serde_json::to_string(state)
        .unwrap_or_else(|_| "{}".to_string())
        .replace('<', "\\u003c");

    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>{title}</title>\n\
         <base href=\"{base}\">\n</head>\n<body>\n<div id=\"root\"></div>\n\
         <script>window.__FRONTGATE__ = {payload};</script>\n</body>\n</html>\n",
        title = escape_html(title),
        base = escape_html(state.basepath),
        payload = payload,
    )
}

pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}
