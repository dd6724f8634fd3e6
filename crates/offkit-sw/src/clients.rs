//! Pages and workers the engine can control.

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use url::Url;

use crate::{Result, ServiceWorkerError};

/// Client type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientType {
    #[default]
    Window,
    Worker,
    SharedWorker,
    All,
}

/// A client (controlled page or worker).
#[derive(Debug, Clone)]
pub struct Client {
    pub id: String,
    pub url: Url,
    pub client_type: ClientType,
    pub focused: bool,
    /// Whether this engine controls the client's fetches.
    pub controlled: bool,
}

impl Client {
    /// Whether the client shows `url`, ignoring any fragment.
    pub fn shows(&self, url: &Url) -> bool {
        let mut ours = self.url.clone();
        ours.set_fragment(None);
        let mut theirs = url.clone();
        theirs.set_fragment(None);
        ours == theirs
    }
}

/// Options for [`Clients::match_all`].
#[derive(Debug, Clone, Default)]
pub struct ClientMatchOptions {
    pub include_uncontrolled: bool,
    pub client_type: ClientType,
}

/// Clients API.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<String, Client>,
    next_id: AtomicU64,
}

impl Clients {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_id(&self) -> String {
        format!("client-{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Register a page that is already open, not yet controlled.
    pub fn attach(&mut self, url: Url, client_type: ClientType) -> Client {
        let client = Client {
            id: self.allocate_id(),
            url,
            client_type,
            focused: false,
            controlled: false,
        };
        self.clients.insert(client.id.clone(), client.clone());
        client
    }

    /// Get a client by ID.
    pub fn get(&self, id: &str) -> Option<&Client> {
        self.clients.get(id)
    }

    /// Remove a client (page closed).
    pub fn remove(&mut self, id: &str) -> Option<Client> {
        self.clients.remove(id)
    }

    /// Clients matching `options`, ordered by ID.
    pub fn match_all(&self, options: &ClientMatchOptions) -> Vec<&Client> {
        let mut matched: Vec<&Client> = self
            .clients
            .values()
            .filter(|c| options.include_uncontrolled || c.controlled)
            .filter(|c| match options.client_type {
                ClientType::All => true,
                t => c.client_type == t,
            })
            .collect();
        matched.sort_by(|a, b| a.id.cmp(&b.id));
        matched
    }

    /// Open a new focused window, controlled from the start.
    pub fn open_window(&mut self, url: Url) -> Client {
        for client in self.clients.values_mut() {
            client.focused = false;
        }
        let client = Client {
            id: self.allocate_id(),
            url,
            client_type: ClientType::Window,
            focused: true,
            controlled: true,
        };
        self.clients.insert(client.id.clone(), client.clone());
        client
    }

    /// Focus a window client.
    pub fn focus(&mut self, id: &str) -> Result<Client> {
        let client_type = self
            .clients
            .get(id)
            .map(|c| c.client_type)
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("client {id}")))?;
        if client_type != ClientType::Window {
            return Err(ServiceWorkerError::StateError(
                "Can only focus window clients".to_string(),
            ));
        }

        for client in self.clients.values_mut() {
            client.focused = client.id == id;
        }
        self.clients
            .get(id)
            .cloned()
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("client {id}")))
    }

    /// Take control of every client. Returns the IDs that changed controller.
    pub fn claim(&mut self) -> Vec<String> {
        let mut claimed: Vec<String> = self
            .clients
            .values_mut()
            .filter(|c| !c.controlled)
            .map(|c| {
                c.controlled = true;
                c.id.clone()
            })
            .collect();
        claimed.sort();
        claimed
    }
}
