//! Observable attribute sets.
//!
//! An [`AttributeStore`] is the versioned key/value bag behind every probe,
//! remote proxy and monitor mirror. Writes compute the set of attributes that
//! actually changed and publish only that diff, in write order, to every
//! subscriber.

use std::collections::BTreeSet;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// Application-defined attributes of a probe.
pub type Attributes = serde_json::Map<String, Value>;

/// Reserved attribute holding the probe id.
pub const ID_ATTRIBUTE: &str = "id";

/// Capacity of the per-store change channel.
const CHANGE_BUFFER: usize = 256;

// ============================================================================
// Attribute Store
// ============================================================================

/// Shared, observable attribute bag.
///
/// Cheap to clone; all clones refer to the same attributes.
#[derive(Clone)]
pub struct AttributeStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    attributes: RwLock<Attributes>,
    changes: broadcast::Sender<Attributes>,
}

impl AttributeStore {
    /// Creates a store seeded with `initial` attributes.
    pub fn new(initial: Attributes) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self {
            inner: Arc::new(StoreInner {
                attributes: RwLock::new(initial),
                changes,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Attributes> {
        self.inner
            .attributes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Attributes> {
        self.inner
            .attributes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a single attribute value.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.read().get(key).cloned()
    }

    /// Returns a copy of all attributes.
    pub fn snapshot(&self) -> Attributes {
        self.read().clone()
    }

    /// Applies `changes` and publishes the attributes whose value differed.
    ///
    /// Returns the published diff; an empty diff publishes nothing.
    pub fn set(&self, changes: Attributes) -> Attributes {
        let mut attributes = self.write();
        let diff = apply(&mut attributes, changes);
        if !diff.is_empty() {
            // Sent under the write lock so subscribers see diffs in write order.
            let _ = self.inner.changes.send(diff.clone());
        }
        diff
    }

    /// Applies `changes` without publishing a change event.
    pub fn set_silent(&self, changes: Attributes) -> Attributes {
        let mut attributes = self.write();
        apply(&mut attributes, changes)
    }

    /// Subscribes to future change diffs.
    pub fn subscribe(&self) -> broadcast::Receiver<Attributes> {
        self.inner.changes.subscribe()
    }

    /// Subscribes and captures the current state atomically, so no diff is
    /// lost or double-counted between the snapshot and the first event.
    pub fn subscribe_with_snapshot(&self) -> (Attributes, broadcast::Receiver<Attributes>) {
        let attributes = self.read();
        let rx = self.inner.changes.subscribe();
        (attributes.clone(), rx)
    }

    /// Returns the number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.changes.receiver_count()
    }
}

impl std::fmt::Debug for AttributeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttributeStore")
            .field("attributes", &*self.read())
            .finish()
    }
}

fn apply(attributes: &mut Attributes, changes: Attributes) -> Attributes {
    let mut diff = Attributes::new();
    for (key, value) in changes {
        if attributes.get(&key) != Some(&value) {
            attributes.insert(key.clone(), value.clone());
            diff.insert(key, value);
        }
    }
    diff
}

/// Returns the attributes in `current` whose values differ from `baseline`.
pub fn changed_since(current: &Attributes, baseline: &Attributes) -> Attributes {
    current
        .iter()
        .filter(|(key, value)| baseline.get(*key) != Some(*value))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

// ============================================================================
// Writable Attributes
// ============================================================================

/// Attributes a monitor may push back to its probe.
///
/// Serialized as `"*"` or as a list of attribute names.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "WritableRepr", into = "WritableRepr")]
pub enum WritableAttributes {
    /// Every attribute except the reserved id
    All,
    /// An explicit allow-list (possibly empty)
    Only(BTreeSet<String>),
    /// Nothing is writable
    #[default]
    None,
}

impl WritableAttributes {
    /// Creates an allow-list from attribute names.
    pub fn only<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: BTreeSet<String> = names.into_iter().map(Into::into).collect();
        if names.is_empty() {
            Self::None
        } else {
            Self::Only(names)
        }
    }

    /// Returns true if a monitor may write `key`.
    pub fn allows(&self, key: &str) -> bool {
        if key == ID_ATTRIBUTE {
            return false;
        }
        match self {
            Self::All => true,
            Self::Only(names) => names.contains(key),
            Self::None => false,
        }
    }

    /// Returns true if nothing is writable.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::All => false,
            Self::Only(names) => names.is_empty(),
            Self::None => true,
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum WritableRepr {
    Star(String),
    List(Vec<String>),
}

impl TryFrom<WritableRepr> for WritableAttributes {
    type Error = String;

    fn try_from(repr: WritableRepr) -> Result<Self, Self::Error> {
        match repr {
            WritableRepr::Star(s) if s == "*" => Ok(Self::All),
            WritableRepr::Star(s) => Err(format!(
                "writableAttributes must be \"*\" or a list, got \"{s}\""
            )),
            WritableRepr::List(names) => Ok(Self::only(names)),
        }
    }
}

impl From<WritableAttributes> for WritableRepr {
    fn from(writable: WritableAttributes) -> Self {
        match writable {
            WritableAttributes::All => Self::Star("*".to_string()),
            WritableAttributes::Only(names) => Self::List(names.into_iter().collect()),
            WritableAttributes::None => Self::List(Vec::new()),
        }
    }
}
