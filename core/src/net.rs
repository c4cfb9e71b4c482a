use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, LOCATION, USER_AGENT};
use reqwest::redirect::Policy;

use crate::error::{CoreError, CoreResult};

const MAX_CACHED_CLIENTS: usize = 32;

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    pub headers: HashMap<String, String>,
    pub user_agent: String,
    /// Domain and the addresses it was validated against.
    pub pinned: Option<(String, Vec<SocketAddr>)>,
}

impl FetchRequest {
    pub fn new(url: String, user_agent: String) -> Self {
        Self {
            url,
            headers: HashMap::new(),
            user_agent,
            pinned: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status_code: u16,
    pub location: Option<String>,
    pub content_length: Option<u64>,
    pub body: Vec<u8>,
}

impl FetchResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self.status_code, 301 | 302 | 303 | 307 | 308)
    }
}

/// One GET, no redirect following. Redirects are surfaced to the caller so
/// every hop can be validated.
pub trait NetClient: Send + Sync {
    fn get(&self, req: &FetchRequest) -> CoreResult<FetchResponse>;
}

type ClientKey = (String, Vec<SocketAddr>);

pub struct ReqwestNetClient {
    timeout: Duration,
    client: Client,
    pinned_clients: Mutex<HashMap<ClientKey, Client>>,
}

impl ReqwestNetClient {
    pub fn new(user_agent: &str, timeout: Duration) -> CoreResult<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .redirect(Policy::none())
            .build()
            .map_err(|err| CoreError::Network(err.to_string()))?;
        Ok(Self {
            timeout,
            client,
            pinned_clients: Mutex::new(HashMap::new()),
        })
    }

    fn request_headers(&self, req: &FetchRequest) -> CoreResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&req.user_agent)
                .map_err(|err| CoreError::Network(err.to_string()))?,
        );
        for (key, value) in &req.headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|err| CoreError::Network(err.to_string()))?;
            let value = HeaderValue::from_str(value)
                .map_err(|err| CoreError::Network(err.to_string()))?;
            headers.insert(name, value);
        }
        Ok(headers)
    }

    fn pick_client(&self, req: &FetchRequest) -> CoreResult<Client> {
        let Some((domain, addrs)) = &req.pinned else {
            return Ok(self.client.clone());
        };
        let key = (domain.clone(), addrs.clone());
        let mut clients = self
            .pinned_clients
            .lock()
            .map_err(|_| CoreError::Network("client cache lock poisoned".to_string()))?;
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }
        if clients.len() >= MAX_CACHED_CLIENTS {
            clients.clear();
        }
        let client = Client::builder()
            .timeout(self.timeout)
            .redirect(Policy::none())
            .resolve_to_addrs(domain, addrs)
            .build()
            .map_err(|err| CoreError::Network(err.to_string()))?;
        clients.insert(key, client.clone());
        Ok(client)
    }
}

impl NetClient for ReqwestNetClient {
    fn get(&self, req: &FetchRequest) -> CoreResult<FetchResponse> {
        let client = self.pick_client(req)?;
        let resp = client
            .get(&req.url)
            .headers(self.request_headers(req)?)
            .send()
            .map_err(|err| CoreError::Network(err.to_string()))?;

        let status = resp.status();
        let headers = resp.headers();
        let location = headers
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string());
        let content_length = headers
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok());

        let body = if status.is_success() {
            resp.bytes()
                .map_err(|err| CoreError::Network(err.to_string()))?
                .to_vec()
        } else {
            Vec::new()
        };

        Ok(FetchResponse {
            status_code: status.as_u16(),
            location,
            content_length,
            body,
        })
    }
}
