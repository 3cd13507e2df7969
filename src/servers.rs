//! Saved servers
//!
//! The app keeps the user's access keys as an ordered list of named entries
//! and persists it as JSON. Keys are stored as typed, never re-encoded, so an
//! `ssconf://` entry is fetched again on every connect.

use serde::{Deserialize, Serialize};

use crate::error::{OutlineError, Result};
use crate::parser::{decode_name, extract_server_host, split_fragment};
use crate::validator;

/// Fallback when a key carries neither a name nor a recognizable host
const UNNAMED_SERVER: &str = "Server";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEntry {
    pub name: String,
    pub uri: String,
}

impl ServerEntry {
    pub fn new(name: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uri: uri.into(),
        }
    }

    /// Entry named after the key's fragment, else its host.
    pub fn from_uri(uri: impl Into<String>) -> Self {
        let uri = uri.into().trim().to_string();
        let name = default_name(&uri);
        Self { name, uri }
    }

    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            UNNAMED_SERVER
        } else {
            &self.name
        }
    }
}

fn default_name(uri: &str) -> String {
    let (_, fragment) = split_fragment(uri);
    fragment
        .map(decode_name)
        .filter(|name| !name.trim().is_empty())
        .or_else(|| extract_server_host(uri))
        .unwrap_or_else(|| UNNAMED_SERVER.to_string())
}

/// Servers in the order they were added.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerList {
    entries: Vec<ServerEntry>,
}

impl ServerList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a validated key. Returns the index of the new entry.
    pub fn add(&mut self, entry: ServerEntry) -> Result<usize> {
        let result = validator::check(&entry.uri);
        if !result.valid {
            return Err(OutlineError::InvalidDescriptor(
                result.reason.unwrap_or_else(|| "invalid access key".into()),
            ));
        }
        log::info!("Adding server '{}'", entry.display_name());
        self.entries.push(entry);
        Ok(self.entries.len() - 1)
    }

    pub fn remove(&mut self, index: usize) -> Option<ServerEntry> {
        if index < self.entries.len() {
            Some(self.entries.remove(index))
        } else {
            None
        }
    }

    pub fn rename(&mut self, index: usize, name: impl Into<String>) -> bool {
        match self.entries.get_mut(index) {
            Some(entry) => {
                entry.name = name.into();
                true
            }
            None => false,
        }
    }

    pub fn find_by_uri(&self, uri: &str) -> Option<usize> {
        let uri = uri.trim();
        self.entries.iter().position(|entry| entry.uri == uri)
    }

    pub fn get(&self, index: usize) -> Option<&ServerEntry> {
        self.entries.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServerEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
