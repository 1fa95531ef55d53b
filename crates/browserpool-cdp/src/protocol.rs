//! CDP protocol message and parameter types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// CDP request message.
#[derive(Debug, Serialize)]
pub struct CdpRequest {
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
}

/// CDP response or event message.
#[derive(Debug, Deserialize)]
pub struct CdpResponse {
    pub id: Option<u64>,
    pub result: Option<Value>,
    pub error: Option<CdpErrorResponse>,
    pub method: Option<String>,
    pub params: Option<Value>,
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
}

/// Error object inside a CDP response.
#[derive(Debug, Deserialize)]
pub struct CdpErrorResponse {
    pub code: i64,
    pub message: String,
    pub data: Option<String>,
}

/// Target info from `Target.getTargets`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfo {
    pub target_id: String,
    #[serde(rename = "type")]
    pub target_type: String,
    pub title: String,
    pub url: String,
    pub attached: Option<bool>,
    pub browser_context_id: Option<String>,
}

impl TargetInfo {
    /// True for ordinary page targets (not service workers, devtools, etc).
    pub fn is_page(&self) -> bool {
        self.target_type == "page"
    }
}

/// Page info from the `/json` discovery endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub id: String,
    #[serde(rename = "type")]
    pub page_type: String,
    pub title: String,
    pub url: String,
    pub web_socket_debugger_url: Option<String>,
}

/// Browser version info.
///
/// Note: Chrome returns PascalCase field names for this endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct BrowserVersion {
    #[serde(rename = "Browser")]
    pub browser: String,
    #[serde(rename = "Protocol-Version")]
    pub protocol_version: String,
    #[serde(rename = "User-Agent")]
    pub user_agent: String,
    #[serde(rename = "webSocketDebuggerUrl")]
    pub web_socket_debugger_url: String,
}

/// Cookie parameter for `Network.setCookies`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CookieParam {
    pub name: String,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secure: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_only: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub same_site: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_serialization() {
        let req = CdpRequest {
            id: 7,
            method: "Page.navigate".to_string(),
            params: Some(json!({"url": "https://example.com"})),
            session_id: Some("abc".to_string()),
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["id"], 7);
        assert_eq!(value["sessionId"], "abc");
        assert_eq!(value["params"]["url"], "https://example.com");
    }

    #[test]
    fn test_request_omits_empty_fields() {
        let req = CdpRequest {
            id: 1,
            method: "Target.getTargets".to_string(),
            params: None,
            session_id: None,
        };
        let text = serde_json::to_string(&req).unwrap();
        assert!(!text.contains("params"));
        assert!(!text.contains("sessionId"));
    }

    #[test]
    fn test_version_parse() {
        let raw = json!({
            "Browser": "Chrome/120.0.6099.109",
            "Protocol-Version": "1.3",
            "User-Agent": "Mozilla/5.0",
            "webSocketDebuggerUrl": "ws://localhost:9222/devtools/browser/xyz"
        });
        let version: BrowserVersion = serde_json::from_value(raw).unwrap();
        assert_eq!(version.protocol_version, "1.3");
        assert!(version.web_socket_debugger_url.starts_with("ws://"));
    }

    #[test]
    fn test_target_is_page() {
        let raw = json!({
            "targetId": "t1",
            "type": "page",
            "title": "Chat",
            "url": "https://example.com/chat"
        });
        let target: TargetInfo = serde_json::from_value(raw).unwrap();
        assert!(target.is_page());

        let raw = json!({
            "targetId": "t2",
            "type": "service_worker",
            "title": "",
            "url": ""
        });
        let target: TargetInfo = serde_json::from_value(raw).unwrap();
        assert!(!target.is_page());
    }

    #[test]
    fn test_cookie_param_camel_case() {
        let cookie = CookieParam {
            name: "sid".to_string(),
            value: "1".to_string(),
            http_only: Some(true),
            same_site: Some("None".to_string()),
            expires: Some(1_700_000_000.0),
            ..Default::default()
        };
        let value = serde_json::to_value(&cookie).unwrap();
        assert_eq!(value["httpOnly"], true);
        assert_eq!(value["sameSite"], "None");
        assert!(value.get("domain").is_none());
    }
}
