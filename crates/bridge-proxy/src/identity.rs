//! Identity encoding between bridge-local and shared homeserver namespaces.
//!
//! Every bridge behind the proxy shares one appservice registration, so user
//! IDs are qualified with the bridge they belong to:
//!
//! ```text
//! @{namespace-prefix}{bridgeType}_{bridgeId}__{localUsername}:{homeserverDomain}
//! @_bridge_manager__whatsapp_1__alice:matrix.localhost.me
//! ```
//!
//! This format is a compatibility contract with existing bridge software.
//! `bridgeType` and `bridgeId` never contain `_`, which keeps decoding
//! unambiguous even when `localUsername` does.
//!
//! Rewrites come in two explicit directions:
//!
//! - [`Direction::ToHomeserver`] strips the encoding from every encoded ID.
//! - [`Direction::ToBridge`] encodes plain IDs for exactly one bridge; IDs
//!   already encoded (for that or any other bridge) pass through.
//!
//! Strings that do not match a pattern are never touched: payloads
//! routinely carry IDs from unrelated servers.

use std::borrow::Cow;

use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::config::AppserviceSettings;
use crate::error::{ProxyError, ProxyResult};
use crate::model::BridgeInstance;

/// A string did not match the encoded identity pattern.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognized identity: {0}")]
pub struct UnrecognizedIdentity(pub String);

/// The parts of an encoded user ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DecodedIdentity {
    /// Bridge software type.
    pub bridge_type: String,
    /// Bridge id.
    pub bridge_id: String,
    /// Username as the bridge knows it.
    pub local_username: String,
    /// Homeserver domain.
    pub domain: String,
}

impl DecodedIdentity {
    /// The `(bridgeType, bridgeId, localUsername)` triple.
    pub fn parts(&self) -> (&str, &str, &str) {
        (&self.bridge_type, &self.bridge_id, &self.local_username)
    }

    /// The plain user ID this identity stands for.
    pub fn plain(&self) -> String {
        format!("@{}:{}", self.local_username, self.domain)
    }
}

/// Which way a rewrite goes.
#[derive(Debug, Clone, Copy)]
pub enum Direction<'a> {
    /// Strip the encoding from every encoded ID.
    ToHomeserver,
    /// Encode plain IDs on `domain` into `bridge`'s namespace.
    ToBridge {
        /// The bridge whose namespace applies on this leg.
        bridge: &'a BridgeInstance,
        /// The homeserver domain plain IDs must belong to.
        domain: &'a str,
    },
}

/// Pure encoder/decoder for bridge-qualified user IDs.
#[derive(Debug, Clone)]
pub struct IdentityCodec {
    prefix: String,
    sender_localpart: String,
    encoded: Regex,
    plain: Regex,
}

impl IdentityCodec {
    /// Build a codec for a namespace prefix such as `_bridge_manager__`.
    ///
    /// Plain IDs whose localpart starts with `sender_localpart` belong to the
    /// proxy itself and are never encoded.
    pub fn new(prefix: &str, sender_localpart: &str) -> ProxyResult<Self> {
        if prefix.is_empty() {
            return Err(ProxyError::configuration("namespace prefix must not be empty"));
        }
        let encoded = Regex::new(&format!(
            r"^@{}(?P<bridge_type>[^_:\s/]+)_(?P<bridge_id>[^_:\s/]+)__(?P<local>[^:\s]+):(?P<domain>[^\s/]+)$",
            regex::escape(prefix)
        ))
        .map_err(|e| ProxyError::configuration(format!("invalid namespace prefix: {e}")))?;
        let plain = Regex::new(r"^@(?P<local>[^:\s]+):(?P<domain>[^\s/]+)$")
            .map_err(|e| ProxyError::configuration(format!("invalid identity pattern: {e}")))?;

        Ok(Self {
            prefix: prefix.to_string(),
            sender_localpart: sender_localpart.to_string(),
            encoded,
            plain,
        })
    }

    /// Build a codec from the appservice settings.
    pub fn from_settings(settings: &AppserviceSettings) -> ProxyResult<Self> {
        Self::new(&settings.namespace_prefix, &settings.sender_localpart)
    }

    /// The namespace prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Encode a bridge-local username.
    pub fn encode(
        &self,
        bridge_type: &str,
        bridge_id: &str,
        local_username: &str,
        domain: &str,
    ) -> String {
        format!(
            "@{}{bridge_type}_{bridge_id}__{local_username}:{domain}",
            self.prefix
        )
    }

    /// Decode an encoded user ID.
    pub fn decode(&self, id: &str) -> Result<DecodedIdentity, UnrecognizedIdentity> {
        let caps = self
            .encoded
            .captures(id)
            .ok_or_else(|| UnrecognizedIdentity(id.to_string()))?;
        Ok(DecodedIdentity {
            bridge_type: caps["bridge_type"].to_string(),
            bridge_id: caps["bridge_id"].to_string(),
            local_username: caps["local"].to_string(),
            domain: caps["domain"].to_string(),
        })
    }

    /// Whether `id` is an encoded user ID.
    pub fn is_encoded(&self, id: &str) -> bool {
        self.encoded.is_match(id)
    }

    /// Rewrite a single user ID, or `None` when the direction leaves it alone.
    pub fn rewrite_id(&self, id: &str, direction: Direction<'_>) -> Option<String> {
        match direction {
            Direction::ToHomeserver => self.decode(id).ok().map(|decoded| decoded.plain()),
            Direction::ToBridge { bridge, domain } => {
                if self.is_encoded(id) {
                    return None;
                }
                let caps = self.plain.captures(id)?;
                let local = &caps["local"];
                if &caps["domain"] != domain || local.starts_with(&self.sender_localpart) {
                    return None;
                }
                Some(self.encode(&bridge.bridge_type, &bridge.bridge_id, local, domain))
            }
        }
    }

    /// Rewrite a bare localpart as if it were `@{local}:{domain}`.
    pub fn rewrite_localpart(
        &self,
        local: &str,
        domain: &str,
        direction: Direction<'_>,
    ) -> Option<String> {
        let rewritten = self.rewrite_id(&format!("@{local}:{domain}"), direction)?;
        rewritten
            .strip_prefix('@')?
            .strip_suffix(domain)?
            .strip_suffix(':')
            .map(str::to_string)
    }

    /// Rewrite every matching string value and object key in a JSON tree.
    ///
    /// Returns whether anything changed.
    pub fn rewrite_json(&self, value: &mut Value, direction: Direction<'_>) -> bool {
        match value {
            Value::String(s) => match self.rewrite_id(s, direction) {
                Some(rewritten) => {
                    *s = rewritten;
                    true
                }
                None => false,
            },
            Value::Array(items) => items
                .iter_mut()
                .fold(false, |changed, item| self.rewrite_json(item, direction) | changed),
            Value::Object(map) => {
                let mut changed = false;
                let entries = std::mem::take(map);
                let mut rewritten = Map::with_capacity(entries.len());
                for (key, mut item) in entries {
                    changed |= self.rewrite_json(&mut item, direction);
                    let key = match self.rewrite_id(&key, direction) {
                        Some(new_key) => {
                            changed = true;
                            new_key
                        }
                        None => key,
                    };
                    rewritten.insert(key, item);
                }
                *map = rewritten;
                changed
            }
            _ => false,
        }
    }

    /// Rewrite identities appearing as whole (percent-encoded) path segments.
    pub fn rewrite_path<'p>(&self, path: &'p str, direction: Direction<'_>) -> Cow<'p, str> {
        let mut changed = false;
        let segments: Vec<Cow<'p, str>> = path
            .split('/')
            .map(|segment| {
                let decoded = urlencoding::decode(segment).unwrap_or(Cow::Borrowed(segment));
                match self.rewrite_id(&decoded, direction) {
                    Some(rewritten) => {
                        changed = true;
                        Cow::Owned(urlencoding::encode(&rewritten).into_owned())
                    }
                    None => Cow::Borrowed(segment),
                }
            })
            .collect();

        if changed {
            Cow::Owned(segments.join("/"))
        } else {
            Cow::Borrowed(path)
        }
    }

    /// Rewrite the `user_id` query parameter used for appservice impersonation.
    pub fn rewrite_query(&self, query: &mut [(String, String)], direction: Direction<'_>) -> bool {
        let mut changed = false;
        for (key, value) in query.iter_mut() {
            if key == "user_id" {
                if let Some(rewritten) = self.rewrite_id(value, direction) {
                    *value = rewritten;
                    changed = true;
                }
            }
        }
        changed
    }

    /// Every encoded identity in a JSON tree, in document order.
    pub fn identities_in_json(&self, value: &Value) -> Vec<DecodedIdentity> {
        let mut found = Vec::new();
        self.collect_json(value, &mut found);
        found
    }

    /// Every encoded identity appearing as a path segment.
    pub fn identities_in_path(&self, path: &str) -> Vec<DecodedIdentity> {
        path.split('/')
            .filter_map(|segment| {
                let decoded = urlencoding::decode(segment).unwrap_or(Cow::Borrowed(segment));
                self.decode(&decoded).ok()
            })
            .collect()
    }

    fn collect_json(&self, value: &Value, found: &mut Vec<DecodedIdentity>) {
        match value {
            Value::String(s) => found.extend(self.decode(s).ok()),
            Value::Array(items) => items.iter().for_each(|item| self.collect_json(item, found)),
            Value::Object(map) => {
                for (key, item) in map {
                    found.extend(self.decode(key).ok());
                    self.collect_json(item, found);
                }
            }
            _ => {}
        }
    }
}
