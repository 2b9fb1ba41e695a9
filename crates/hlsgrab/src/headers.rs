//! Header profile: the HTTP identity replayed on every request of a job.

use reqwest::RequestBuilder;
use reqwest::header::{
    ACCEPT, ACCEPT_LANGUAGE, COOKIE, HeaderMap, HeaderName, HeaderValue, ORIGIN, REFERER,
    USER_AGENT,
};
use tracing::warn;
use url::Url;

use crate::config::HeaderDefaults;
use crate::manifest::ManifestEntry;

static SEC_FETCH_SITE: HeaderName = HeaderName::from_static("sec-fetch-site");
static SEC_FETCH_MODE: HeaderName = HeaderName::from_static("sec-fetch-mode");
static SEC_FETCH_DEST: HeaderName = HeaderName::from_static("sec-fetch-dest");

/// Resolved request headers for one job.
///
/// Captured values win over defaults. A missing `referer` falls back to the
/// configured one, then to the directory URL of the media playlist. `origin`
/// and `cookie` have no default and are not sent when absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderProfile {
    pub user_agent: String,
    pub accept: String,
    pub accept_language: String,
    pub referer: Option<String>,
    pub origin: Option<String>,
    pub cookie: Option<String>,
    pub sec_fetch_site: String,
    pub sec_fetch_mode: String,
    pub sec_fetch_dest: String,
    headers: HeaderMap,
}

fn captured(value: Option<&String>) -> Option<String> {
    value.map(|v| v.trim()).filter(|v| !v.is_empty()).map(str::to_string)
}

/// `scheme://host[:port]/dir/` of a playlist URL, query and fragment dropped.
pub fn manifest_base_url(url: &str) -> Option<String> {
    let url = Url::parse(url.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.join("./").ok().map(String::from)
}

impl HeaderProfile {
    /// Build the profile for `entry`, or an all-default one for `None`.
    pub fn resolve(entry: Option<&ManifestEntry>, defaults: &HeaderDefaults) -> Self {
        let headers = entry.and_then(|e| e.headers.as_ref());
        let security = entry.and_then(|e| e.security_headers.as_ref());

        let mut profile = Self {
            user_agent: captured(headers.and_then(|h| h.user_agent.as_ref()))
                .unwrap_or_else(|| defaults.user_agent.clone()),
            accept: defaults.accept.clone(),
            accept_language: defaults.accept_language.clone(),
            referer: captured(headers.and_then(|h| h.referer.as_ref()))
                .or_else(|| captured(defaults.referer.as_ref()))
                .or_else(|| entry.and_then(|e| manifest_base_url(&e.url))),
            origin: captured(headers.and_then(|h| h.origin.as_ref())),
            cookie: captured(headers.and_then(|h| h.cookie.as_ref())),
            sec_fetch_site: captured(security.and_then(|s| s.sec_fetch_site.as_ref()))
                .unwrap_or_else(|| defaults.sec_fetch_site.clone()),
            sec_fetch_mode: captured(security.and_then(|s| s.sec_fetch_mode.as_ref()))
                .unwrap_or_else(|| defaults.sec_fetch_mode.clone()),
            sec_fetch_dest: captured(security.and_then(|s| s.sec_fetch_dest.as_ref()))
                .unwrap_or_else(|| defaults.sec_fetch_dest.clone()),
            headers: HeaderMap::new(),
        };
        profile.headers = profile.build_header_map();
        profile
    }

    fn build_header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::new();
        let fields: [(&HeaderName, Option<&str>); 9] = [
            (&USER_AGENT, Some(&self.user_agent)),
            (&ACCEPT, Some(&self.accept)),
            (&ACCEPT_LANGUAGE, Some(&self.accept_language)),
            (&REFERER, self.referer.as_deref()),
            (&ORIGIN, self.origin.as_deref()),
            (&COOKIE, self.cookie.as_deref()),
            (&SEC_FETCH_SITE, Some(&self.sec_fetch_site)),
            (&SEC_FETCH_MODE, Some(&self.sec_fetch_mode)),
            (&SEC_FETCH_DEST, Some(&self.sec_fetch_dest)),
        ];
        for (name, value) in fields {
            let Some(value) = value else { continue };
            match HeaderValue::from_str(value) {
                Ok(value) => {
                    map.insert(name.clone(), value);
                }
                Err(_) => warn!(header = %name, "Dropping header with invalid characters"),
            }
        }
        map
    }

    /// Headers as sent on the wire.
    pub fn header_map(&self) -> &HeaderMap {
        &self.headers
    }

    /// Attach the profile to an outgoing request.
    pub fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        request.headers(self.headers.clone())
    }
}

impl Default for HeaderProfile {
    fn default() -> Self {
        Self::resolve(None, &HeaderDefaults::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        DEFAULT_ACCEPT, DEFAULT_ACCEPT_LANGUAGE, DEFAULT_SEC_FETCH_DEST, DEFAULT_SEC_FETCH_MODE,
        DEFAULT_SEC_FETCH_SITE, DEFAULT_USER_AGENT,
    };
    use crate::manifest::{CapturedHeaders, SecurityHeaders};

    #[test]
    fn only_user_agent_captured() {
        let entry = ManifestEntry {
            url: "https://cdn.test/a.m3u8".to_string(),
            headers: Some(CapturedHeaders {
                user_agent: Some("Captured/2.0".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let profile = HeaderProfile::resolve(Some(&entry), &HeaderDefaults::default());

        assert_eq!(profile.user_agent, "Captured/2.0");
        assert_eq!(profile.accept, DEFAULT_ACCEPT);
        assert_eq!(profile.accept_language, DEFAULT_ACCEPT_LANGUAGE);
        assert_eq!(profile.referer.as_deref(), Some("https://cdn.test/"));
        assert_eq!(profile.origin, None);
        assert_eq!(profile.cookie, None);
        assert_eq!(profile.sec_fetch_site, DEFAULT_SEC_FETCH_SITE);
        assert_eq!(profile.sec_fetch_mode, DEFAULT_SEC_FETCH_MODE);
        assert_eq!(profile.sec_fetch_dest, DEFAULT_SEC_FETCH_DEST);
    }

    #[test]
    fn absent_entry_is_all_default() {
        let profile = HeaderProfile::resolve(None, &HeaderDefaults::default());
        assert_eq!(profile.user_agent, DEFAULT_USER_AGENT);
        assert_eq!(profile, HeaderProfile::default());

        let map = profile.header_map();
        assert_eq!(map.get("sec-fetch-mode").unwrap(), "cors");
        assert!(map.get(COOKIE).is_none());
        assert!(map.get(REFERER).is_none());
    }

    #[test]
    fn captured_identity_is_replayed() {
        let entry = ManifestEntry {
            url: "https://cdn.test/a.m3u8".to_string(),
            headers: Some(CapturedHeaders {
                user_agent: Some("UA".to_string()),
                referer: Some("https://site.test/watch".to_string()),
                origin: Some("https://site.test".to_string()),
                cookie: Some("sid=1; theme=dark".to_string()),
            }),
            security_headers: Some(SecurityHeaders {
                sec_fetch_site: Some("cross-site".to_string()),
                sec_fetch_mode: None,
                sec_fetch_dest: Some(String::new()),
            }),
            ..Default::default()
        };
        let profile = HeaderProfile::resolve(Some(&entry), &HeaderDefaults::default());
        let map = profile.header_map();

        assert_eq!(map.get(COOKIE).unwrap(), "sid=1; theme=dark");
        assert_eq!(map.get(ORIGIN).unwrap(), "https://site.test");
        assert_eq!(map.get("sec-fetch-site").unwrap(), "cross-site");
        assert_eq!(map.get("sec-fetch-mode").unwrap(), DEFAULT_SEC_FETCH_MODE);
        assert_eq!(map.get("sec-fetch-dest").unwrap(), DEFAULT_SEC_FETCH_DEST);
    }

    #[test]
    fn referer_falls_back_to_configured_then_playlist_directory() {
        let entry = ManifestEntry::from_url("https://cdn.test/live/abc/index.m3u8?token=1#t");
        let profile = HeaderProfile::resolve(Some(&entry), &HeaderDefaults::default());
        assert_eq!(profile.referer.as_deref(), Some("https://cdn.test/live/abc/"));
        assert_eq!(
            profile.header_map().get(REFERER).unwrap(),
            "https://cdn.test/live/abc/"
        );

        let defaults = HeaderDefaults {
            referer: Some("https://portal.test/".to_string()),
            ..HeaderDefaults::default()
        };
        let profile = HeaderProfile::resolve(Some(&entry), &defaults);
        assert_eq!(profile.referer.as_deref(), Some("https://portal.test/"));

        // a captured referer beats both
        let captured = ManifestEntry {
            headers: Some(CapturedHeaders {
                referer: Some("https://site.test/watch".to_string()),
                ..Default::default()
            }),
            ..entry
        };
        let profile = HeaderProfile::resolve(Some(&captured), &defaults);
        assert_eq!(profile.referer.as_deref(), Some("https://site.test/watch"));
    }

    #[test]
    fn base_url_of_root_and_port() {
        assert_eq!(
            manifest_base_url("http://127.0.0.1:8080/index.m3u8").as_deref(),
            Some("http://127.0.0.1:8080/")
        );
        assert_eq!(
            manifest_base_url("https://cdn.test/a/b/").as_deref(),
            Some("https://cdn.test/a/b/")
        );
        assert_eq!(manifest_base_url("not a url"), None);
        assert_eq!(manifest_base_url("ftp://cdn.test/a.m3u8"), None);
    }

    #[test]
    fn invalid_header_values_are_dropped() {
        let entry = ManifestEntry {
            url: "https://cdn.test/a.m3u8".to_string(),
            headers: Some(CapturedHeaders {
                cookie: Some("bad\nvalue".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let profile = HeaderProfile::resolve(Some(&entry), &HeaderDefaults::default());
        assert!(profile.header_map().get(COOKIE).is_none());
        assert!(profile.header_map().get(USER_AGENT).is_some());
    }
}
