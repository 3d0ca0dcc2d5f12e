use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JidError {
    #[error("JID has an empty host")]
    EmptyHost,
    #[error("JID has an empty user part")]
    EmptyUser,
    #[error("JID has an empty resource")]
    EmptyResource,
}

/// An XMPP address, `user@host/resource`.
///
/// User and host compare case-insensitively, the resource is compared
/// exactly. The stored text keeps its original case for display.
#[derive(Debug, Clone)]
pub struct Jid {
    user: Option<String>,
    host: String,
    resource: Option<String>,
}

impl Jid {
    pub fn new(
        user: Option<&str>,
        host: &str,
        resource: Option<&str>,
    ) -> Result<Self, JidError> {
        if host.is_empty() {
            return Err(JidError::EmptyHost);
        }
        if user.is_some_and(str::is_empty) {
            return Err(JidError::EmptyUser);
        }
        if resource.is_some_and(str::is_empty) {
            return Err(JidError::EmptyResource);
        }

        Ok(Self {
            user: user.map(str::to_string),
            host: host.to_string(),
            resource: resource.map(str::to_string),
        })
    }

    /// A host-only JID, e.g. the server's own address.
    pub fn domain(host: &str) -> Result<Self, JidError> {
        Self::new(None, host, None)
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    pub fn is_bare(&self) -> bool {
        self.resource.is_none()
    }

    pub fn bare(&self) -> Jid {
        Jid {
            user: self.user.clone(),
            host: self.host.clone(),
            resource: None,
        }
    }

    pub fn with_resource(&self, resource: &str) -> Result<Jid, JidError> {
        if resource.is_empty() {
            return Err(JidError::EmptyResource);
        }
        Ok(Jid {
            user: self.user.clone(),
            host: self.host.clone(),
            resource: Some(resource.to_string()),
        })
    }

    fn normalized_user(&self) -> Option<String> {
        self.user.as_deref().map(str::to_lowercase)
    }

    fn normalized_host(&self) -> String {
        self.host.to_lowercase()
    }
}

impl PartialEq for Jid {
    fn eq(&self, other: &Self) -> bool {
        self.normalized_host() == other.normalized_host()
            && self.normalized_user() == other.normalized_user()
            && self.resource == other.resource
    }
}

impl Eq for Jid {}

impl Hash for Jid {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.normalized_user().hash(state);
        self.normalized_host().hash(state);
        self.resource.hash(state);
    }
}

impl FromStr for Jid {
    type Err = JidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (address, resource) = match s.split_once('/') {
            Some((address, resource)) => (address, Some(resource)),
            None => (s, None),
        };
        let (user, host) = match address.split_once('@') {
            Some((user, host)) => (Some(user), host),
            None => (None, address),
        };

        Jid::new(user, host, resource)
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(user) = &self.user {
            write!(f, "{user}@")?;
        }
        f.write_str(&self.host)?;
        if let Some(resource) = &self.resource {
            write!(f, "/{resource}")?;
        }
        Ok(())
    }
}
