//! Page session over plain HTTP: reqwest for transport, scraper for DOM queries.
//!
//! No JavaScript runs. Redirects are followed by hand so every hop's
//! `Set-Cookie` lands in the session's own cookie store, which is also what
//! gets exported as the session state. Domain, path and expiry rules come from
//! `cookie_store`.

use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

use cookie_store::CookieStore;
use futures_util::StreamExt;
use reqwest::header::{CONTENT_TYPE, COOKIE, LOCATION, SET_COOKIE, USER_AGENT};
use reqwest::{Method, StatusCode};
use scraper::{ElementRef, Html, Selector};
use serde_json::json;
use url::Url;

use portal_core::{ApiKeyMethod, AuthScenario, PluginDescriptor, RawNode, StateBlob};
use portal_logging::{portal_debug, portal_warn};

use crate::auth::API_KEY_STATE;
use crate::decode::decode_body;
use crate::dom::{collapse_whitespace, raw_node, visible_text};
use crate::page::{url_markers, FormField, PageError, PageSession, PageSessionFactory};

#[derive(Debug, Clone)]
pub struct HttpSessionSettings {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub redirect_limit: usize,
    pub max_bytes: u64,
    pub allowed_content_types: Vec<String>,
    pub user_agent: String,
}

impl Default for HttpSessionSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            redirect_limit: 5,
            max_bytes: 5 * 1024 * 1024,
            allowed_content_types: vec![
                "text/html".to_string(),
                "application/xhtml+xml".to_string(),
            ],
            user_agent: format!("portal-harvester/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// State blob key holding the exported cookie store.
const COOKIES_STATE: &str = "cookies";

/// Api key attached to every request sent to the plugin's own host.
#[derive(Clone)]
struct ApiKeyInjection {
    method: ApiKeyMethod,
    name: String,
    value: String,
    host: String,
}

impl ApiKeyInjection {
    fn from_state(descriptor: &PluginDescriptor, state: &StateBlob) -> Option<Self> {
        let AuthScenario::ApiKey { method, key_name } = &descriptor.auth else {
            return None;
        };
        let value = state.0.get(API_KEY_STATE)?.as_str()?.to_string();
        let host = Url::parse(&descriptor.base_url).ok()?.host_str()?.to_string();
        Some(Self {
            method: *method,
            name: key_name.clone(),
            value,
            host,
        })
    }

    fn applies_to(&self, url: &Url) -> bool {
        url.host_str() == Some(self.host.as_str())
    }
}

#[derive(Debug, Clone)]
struct LoadedPage {
    url: Url,
    html: String,
}

#[derive(Debug, Clone)]
struct PendingForm {
    action: Url,
    method: Method,
    fields: Vec<(String, String)>,
}

pub struct HttpPageSession {
    client: reqwest::Client,
    settings: HttpSessionSettings,
    cookies: CookieStore,
    api_key: Option<ApiKeyInjection>,
    page: Option<LoadedPage>,
    form: Option<PendingForm>,
    closed: bool,
}

impl HttpPageSession {
    pub fn new(settings: HttpSessionSettings) -> Result<Self, PageError> {
        let client = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout)
            .timeout(settings.request_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|err| PageError::Network(err.to_string()))?;
        Ok(Self {
            client,
            settings,
            cookies: CookieStore::default(),
            api_key: None,
            page: None,
            form: None,
            closed: false,
        })
    }

    /// Seeds the cookie store from a state exported by `storage_state`.
    pub fn restore(&mut self, state: &StateBlob) {
        let Some(exported) = state.0.get(COOKIES_STATE) else {
            return;
        };
        let Some(text) = exported.as_str() else {
            portal_warn!("ignoring session cookies that are not an exported cookie store");
            return;
        };
        match cookie_store::serde::json::load_all(text.as_bytes()) {
            Ok(store) => self.cookies = store,
            Err(err) => portal_warn!("ignoring malformed session cookies: {}", err),
        }
    }

    fn export_cookies(&self) -> Result<String, PageError> {
        let mut buf = Vec::new();
        cookie_store::serde::json::save_incl_expired_and_nonpersistent(&self.cookies, &mut buf)
            .map_err(|err| PageError::State(err.to_string()))?;
        String::from_utf8(buf).map_err(|err| PageError::State(err.to_string()))
    }

    fn ensure_open(&self) -> Result<(), PageError> {
        if self.closed {
            Err(PageError::Closed)
        } else {
            Ok(())
        }
    }

    fn loaded(&self) -> Result<&LoadedPage, PageError> {
        self.ensure_open()?;
        self.page.as_ref().ok_or(PageError::NoPage)
    }

    fn is_content_type_allowed(&self, content_type: &str) -> bool {
        let ct = content_type.split(';').next().unwrap_or(content_type).trim();
        self.settings
            .allowed_content_types
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(ct))
    }

    fn cookie_header(&self, url: &Url) -> Option<String> {
        let pairs: Vec<String> = self
            .cookies
            .get_request_values(url)
            .map(|(name, value)| format!("{name}={value}"))
            .collect();
        (!pairs.is_empty()).then(|| pairs.join("; "))
    }

    fn store_cookies(&mut self, url: &Url, headers: &reqwest::header::HeaderMap) {
        for header in headers.get_all(SET_COOKIE) {
            let Ok(raw) = header.to_str() else {
                continue;
            };
            if let Err(err) = self.cookies.parse(raw, url) {
                portal_debug!("rejected cookie from {}: {}", url, err);
            }
        }
    }

    /// `url` with the api key appended when it travels as a query parameter.
    fn request_target(&self, url: &Url) -> Url {
        let mut target = url.clone();
        if let Some(key) = self.api_key.as_ref().filter(|key| key.applies_to(url)) {
            if key.method == ApiKeyMethod::QueryParam
                && !url.query_pairs().any(|(name, _)| name == key.name.as_str())
            {
                target.query_pairs_mut().append_pair(&key.name, &key.value);
            }
        }
        target
    }

    async fn request(
        &mut self,
        method: Method,
        url: Url,
        form: Option<Vec<(String, String)>>,
    ) -> Result<(), PageError> {
        let mut method = method;
        let mut url = url;
        let mut body = None;
        if let Some(fields) = form {
            if method == Method::GET {
                url.query_pairs_mut().clear().extend_pairs(fields.iter());
            } else {
                body = Some(
                    url::form_urlencoded::Serializer::new(String::new())
                        .extend_pairs(fields.iter())
                        .finish(),
                );
            }
        }

        for _ in 0..=self.settings.redirect_limit {
            let mut builder = self
                .client
                .request(method.clone(), self.request_target(&url))
                .header(USER_AGENT, self.settings.user_agent.as_str());
            if let Some(cookie) = self.cookie_header(&url) {
                builder = builder.header(COOKIE, cookie);
            }
            if let Some(key) = self.api_key.as_ref().filter(|key| key.applies_to(&url)) {
                builder = match key.method {
                    ApiKeyMethod::Header => builder.header(key.name.as_str(), key.value.as_str()),
                    ApiKeyMethod::Bearer => builder.bearer_auth(&key.value),
                    ApiKeyMethod::QueryParam => builder,
                };
            }
            if let Some(body) = &body {
                builder = builder
                    .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(body.clone());
            }

            let response = builder.send().await.map_err(map_reqwest_error)?;
            self.store_cookies(&url, response.headers());
            let status = response.status();

            if status.is_redirection() {
                let location = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|value| value.to_str().ok())
                    .ok_or_else(|| PageError::InvalidUrl("redirect without location".into()))?;
                let next = url
                    .join(location)
                    .map_err(|err| PageError::InvalidUrl(err.to_string()))?;
                portal_debug!("redirect {} -> {}", url, next);
                if status == StatusCode::SEE_OTHER
                    || (method == Method::POST
                        && (status == StatusCode::MOVED_PERMANENTLY || status == StatusCode::FOUND))
                {
                    method = Method::GET;
                    body = None;
                }
                url = next;
                continue;
            }

            if !status.is_success() {
                return Err(PageError::HttpStatus(status.as_u16()));
            }

            if let Some(content_len) = response.content_length() {
                if content_len > self.settings.max_bytes {
                    return Err(PageError::TooLarge {
                        max_bytes: self.settings.max_bytes,
                        actual: Some(content_len),
                    });
                }
            }

            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map(|value| value.to_string());
            if let Some(ct) = content_type.as_deref() {
                if !self.is_content_type_allowed(ct) {
                    return Err(PageError::UnsupportedContentType(ct.to_string()));
                }
            }

            let mut bytes = Vec::new();
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(map_reqwest_error)?;
                let next_len = bytes.len() as u64 + chunk.len() as u64;
                if next_len > self.settings.max_bytes {
                    return Err(PageError::TooLarge {
                        max_bytes: self.settings.max_bytes,
                        actual: Some(next_len),
                    });
                }
                bytes.extend_from_slice(&chunk);
            }

            let (html, _) = decode_body(&bytes, content_type.as_deref());
            self.page = Some(LoadedPage { url, html });
            self.form = None;
            return Ok(());
        }

        Err(PageError::RedirectLimitExceeded)
    }
}

#[async_trait::async_trait]
impl PageSession for HttpPageSession {
    async fn navigate(&mut self, url: &str) -> Result<(), PageError> {
        self.ensure_open()?;
        let parsed = Url::parse(url).map_err(|err| PageError::InvalidUrl(err.to_string()))?;
        self.request(Method::GET, parsed, None).await
    }

    async fn fill_form(&mut self, fields: &[FormField]) -> Result<(), PageError> {
        let previous = self.form.take();
        let page = self.loaded()?;
        let pending = build_form(page, previous, fields)?;
        self.form = Some(pending);
        Ok(())
    }

    async fn submit(&mut self) -> Result<(), PageError> {
        self.ensure_open()?;
        let form = self
            .form
            .take()
            .ok_or_else(|| PageError::FormNotFound("nothing was filled".into()))?;
        self.request(form.method, form.action, Some(form.fields))
            .await
    }

    async fn extract_dom(&mut self, selectors: &[String]) -> Result<Vec<RawNode>, PageError> {
        let page = self.loaded()?;
        let document = Html::parse_document(&page.html);
        let mut seen = HashSet::new();
        let mut nodes = Vec::new();
        for raw in selectors {
            let selector = parse_selector(raw)?;
            for element in document.select(&selector) {
                if seen.insert(element.id()) {
                    nodes.push(raw_node(element));
                }
            }
        }
        Ok(nodes)
    }

    async fn page_text(&mut self, selector: &str) -> Result<String, PageError> {
        let page = self.loaded()?;
        let document = Html::parse_document(&page.html);
        let selector = parse_selector(selector)?;
        let parts: Vec<String> = document.select(&selector).map(visible_text).collect();
        Ok(collapse_whitespace(&parts.join(" ")))
    }

    fn current_url(&self) -> Option<String> {
        self.page.as_ref().map(|page| page.url.to_string())
    }

    fn current_url_markers(&self) -> BTreeSet<String> {
        self.page
            .as_ref()
            .map(|page| url_markers(page.url.as_str()))
            .unwrap_or_default()
    }

    async fn storage_state(&mut self) -> Result<StateBlob, PageError> {
        self.ensure_open()?;
        Ok(StateBlob(json!({ COOKIES_STATE: self.export_cookies()? })))
    }

    async fn close(&mut self) {
        self.closed = true;
        self.page = None;
        self.form = None;
    }
}

/// Opens `HttpPageSession`s with shared settings.
#[derive(Debug, Clone, Default)]
pub struct HttpSessionFactory {
    settings: HttpSessionSettings,
}

impl HttpSessionFactory {
    pub fn new(settings: HttpSessionSettings) -> Self {
        Self { settings }
    }
}

#[async_trait::async_trait]
impl PageSessionFactory for HttpSessionFactory {
    async fn open(
        &self,
        descriptor: &PluginDescriptor,
        state: Option<&StateBlob>,
    ) -> Result<Box<dyn PageSession>, PageError> {
        let mut session = HttpPageSession::new(self.settings.clone())?;
        if let Some(state) = state {
            session.restore(state);
            session.api_key = ApiKeyInjection::from_state(descriptor, state);
        }
        portal_debug!("opened http page session for {}", descriptor.id);
        Ok(Box::new(session))
    }
}

fn parse_selector(raw: &str) -> Result<Selector, PageError> {
    Selector::parse(raw).map_err(|_| PageError::InvalidSelector(raw.to_string()))
}

/// Collects the enclosing form's current values and applies `fields` on top.
///
/// Filling more fields of the same form keeps the earlier values.
fn build_form(
    page: &LoadedPage,
    previous: Option<PendingForm>,
    fields: &[FormField],
) -> Result<PendingForm, PageError> {
    let document = Html::parse_document(&page.html);
    let mut pending: Option<PendingForm> = None;

    for field in fields {
        let selector = parse_selector(&field.selector)?;
        let element = document
            .select(&selector)
            .next()
            .ok_or_else(|| PageError::ElementNotFound(field.selector.clone()))?;
        let name = element
            .value()
            .attr("name")
            .ok_or_else(|| PageError::ElementNotFound(format!("{} has no name", field.selector)))?
            .to_string();

        if pending.is_none() {
            let form = element
                .ancestors()
                .filter_map(ElementRef::wrap)
                .find(|ancestor| ancestor.value().name().eq_ignore_ascii_case("form"))
                .ok_or_else(|| PageError::FormNotFound(field.selector.clone()))?;
            let action = resolve_action(&page.url, form.value().attr("action"))?;
            let method = match form.value().attr("method") {
                Some(method) if method.eq_ignore_ascii_case("post") => Method::POST,
                _ => Method::GET,
            };
            let fields = match previous.as_ref() {
                Some(prev) if prev.action == action && prev.method == method => prev.fields.clone(),
                _ => current_values(form),
            };
            pending = Some(PendingForm {
                action,
                method,
                fields,
            });
        }

        if let Some(form) = pending.as_mut() {
            match form.fields.iter_mut().find(|(existing, _)| *existing == name) {
                Some(slot) => slot.1 = field.value.clone(),
                None => form.fields.push((name, field.value.clone())),
            }
        }
    }

    pending.ok_or_else(|| PageError::FormNotFound("no fields given".into()))
}

fn resolve_action(page_url: &Url, action: Option<&str>) -> Result<Url, PageError> {
    match action.map(str::trim).filter(|action| !action.is_empty()) {
        Some(action) => page_url
            .join(action)
            .map_err(|err| PageError::InvalidUrl(err.to_string())),
        None => Ok(page_url.clone()),
    }
}

/// Successful controls of a form as a browser would send them, hidden inputs included.
fn current_values(form: ElementRef<'_>) -> Vec<(String, String)> {
    let mut values = Vec::new();
    let Ok(controls) = Selector::parse("input, select, textarea") else {
        return values;
    };
    for control in form.select(&controls) {
        let element = control.value();
        let Some(name) = element.attr("name") else {
            continue;
        };
        if element.attr("disabled").is_some() {
            continue;
        }
        match element.name() {
            "input" => {
                let kind = element.attr("type").unwrap_or("text").to_ascii_lowercase();
                match kind.as_str() {
                    "submit" | "button" | "image" | "reset" | "file" => continue,
                    "checkbox" | "radio" if element.attr("checked").is_none() => continue,
                    "checkbox" | "radio" => values.push((
                        name.to_string(),
                        element.attr("value").unwrap_or("on").to_string(),
                    )),
                    _ => values.push((
                        name.to_string(),
                        element.attr("value").unwrap_or_default().to_string(),
                    )),
                }
            }
            "select" => {
                let Ok(options) = Selector::parse("option") else {
                    continue;
                };
                let chosen = control
                    .select(&options)
                    .find(|option| option.value().attr("selected").is_some())
                    .or_else(|| control.select(&options).next());
                if let Some(option) = chosen {
                    let value = option
                        .value()
                        .attr("value")
                        .map(str::to_string)
                        .unwrap_or_else(|| visible_text(option));
                    values.push((name.to_string(), value));
                }
            }
            _ => values.push((name.to_string(), control.text().collect::<String>())),
        }
    }
    values
}

fn map_reqwest_error(err: reqwest::Error) -> PageError {
    if err.is_timeout() {
        return PageError::Timeout(err.to_string());
    }
    if err.is_redirect() {
        return PageError::RedirectLimitExceeded;
    }
    PageError::Network(err.to_string())
}

#[cfg(test)]
mod tests {
    use reqwest::header::{HeaderMap, HeaderValue};

    use super::*;

    fn url(raw: &str) -> Url {
        Url::parse(raw).unwrap()
    }

    fn receive(session: &mut HttpPageSession, from: &str, set_cookies: &[&'static str]) {
        let mut headers = HeaderMap::new();
        for &raw in set_cookies {
            headers.append(SET_COOKIE, HeaderValue::from_static(raw));
        }
        session.store_cookies(&url(from), &headers);
    }

    fn cookie_names(session: &HttpPageSession, target: &str) -> Vec<String> {
        let mut names: Vec<String> = session
            .cookie_header(&url(target))
            .unwrap_or_default()
            .split("; ")
            .filter(|pair| !pair.is_empty())
            .map(str::to_string)
            .collect();
        names.sort();
        names
    }

    #[test]
    fn domain_cookie_reaches_sibling_hosts() {
        let mut session = HttpPageSession::new(HttpSessionSettings::default()).unwrap();
        receive(
            &mut session,
            "https://login.portal.example/session",
            &["sid=abc; Domain=portal.example; Path=/", "local=1; Path=/"],
        );

        assert_eq!(
            session.cookie_header(&url("https://www.portal.example/search?q=x")),
            Some("sid=abc".to_string())
        );
        assert_eq!(
            cookie_names(&session, "https://login.portal.example/"),
            vec!["local=1", "sid=abc"]
        );
        assert_eq!(session.cookie_header(&url("https://other.example/")), None);
    }

    #[test]
    fn path_scoped_cookie_stays_on_its_path() {
        let mut session = HttpPageSession::new(HttpSessionSettings::default()).unwrap();
        receive(
            &mut session,
            "https://portal.example/admin/login",
            &["admin=1; Path=/admin", "sid=abc; Path=/"],
        );

        assert_eq!(
            cookie_names(&session, "https://portal.example/admin/users"),
            vec!["admin=1", "sid=abc"]
        );
        assert_eq!(
            cookie_names(&session, "https://portal.example/search"),
            vec!["sid=abc"]
        );
    }

    #[test]
    fn expired_cookies_are_dropped() {
        let mut session = HttpPageSession::new(HttpSessionSettings::default()).unwrap();
        receive(
            &mut session,
            "https://portal.example/login",
            &["sid=abc; Path=/", "theme=dark; Path=/"],
        );
        receive(
            &mut session,
            "https://portal.example/logout",
            &[
                "sid=gone; Path=/; Expires=Thu, 01 Jan 1970 00:00:00 GMT",
                "theme=; Path=/; Max-Age=0",
            ],
        );

        assert_eq!(session.cookie_header(&url("https://portal.example/")), None);
    }

    #[tokio::test]
    async fn exported_cookies_restore_into_a_new_session() {
        let mut first = HttpPageSession::new(HttpSessionSettings::default()).unwrap();
        receive(
            &mut first,
            "https://portal.example/login",
            &["sid=abc; Path=/; HttpOnly", "remember=yes; Path=/; Max-Age=86400"],
        );
        let state = first.storage_state().await.unwrap();
        assert!(state.0[COOKIES_STATE].is_string());

        let mut second = HttpPageSession::new(HttpSessionSettings::default()).unwrap();
        second.restore(&state);
        assert_eq!(
            cookie_names(&second, "https://portal.example/search"),
            vec!["remember=yes", "sid=abc"]
        );

        let mut third = HttpPageSession::new(HttpSessionSettings::default()).unwrap();
        third.restore(&StateBlob(json!({ COOKIES_STATE: { "portal.example": { "sid": "abc" } } })));
        assert_eq!(third.cookie_header(&url("https://portal.example/")), None);
    }

    #[test]
    fn api_key_travels_only_to_the_plugin_host() {
        let mut session = HttpPageSession::new(HttpSessionSettings::default()).unwrap();
        session.api_key = Some(ApiKeyInjection {
            method: ApiKeyMethod::QueryParam,
            name: "token".into(),
            value: "k-1".into(),
            host: "api.portal.example".into(),
        });

        assert_eq!(
            session
                .request_target(&url("https://api.portal.example/search?q=x"))
                .as_str(),
            "https://api.portal.example/search?q=x&token=k-1"
        );
        assert_eq!(
            session
                .request_target(&url("https://api.portal.example/search?token=own"))
                .as_str(),
            "https://api.portal.example/search?token=own"
        );
        assert_eq!(
            session
                .request_target(&url("https://cdn.example/file.pdf"))
                .as_str(),
            "https://cdn.example/file.pdf"
        );
    }

    #[test]
    fn form_values_include_hidden_and_checked_controls() {
        let page = LoadedPage {
            url: Url::parse("https://portal.example/login").unwrap(),
            html: r#"<form action="/session" method="post">
                <input type="hidden" name="csrf" value="tok">
                <input name="user" value="">
                <input type="password" name="pass">
                <input type="checkbox" name="remember" checked>
                <input type="checkbox" name="newsletter">
                <select name="lang"><option value="en">EN</option><option value="de" selected>DE</option></select>
                <button type="submit">Go</button>
            </form>"#
                .into(),
        };
        let form = build_form(
            &page,
            None,
            &[
                FormField::new("input[name='user']", "alice"),
                FormField::new("input[name='pass']", "secret"),
            ],
        )
        .unwrap();

        assert_eq!(form.method, Method::POST);
        assert_eq!(form.action.as_str(), "https://portal.example/session");
        assert_eq!(
            form.fields,
            vec![
                ("csrf".to_string(), "tok".to_string()),
                ("user".to_string(), "alice".to_string()),
                ("pass".to_string(), "secret".to_string()),
                ("remember".to_string(), "on".to_string()),
                ("lang".to_string(), "de".to_string()),
            ]
        );
    }

    #[test]
    fn field_outside_a_form_is_reported() {
        let page = LoadedPage {
            url: Url::parse("https://portal.example/").unwrap(),
            html: r#"<input name="q">"#.into(),
        };
        let err = build_form(&page, None, &[FormField::new("input[name='q']", "x")]).unwrap_err();
        assert_eq!(err, PageError::FormNotFound("input[name='q']".into()));
    }
}
