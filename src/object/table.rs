use std::collections::HashMap;

use super::SharedObject;
use crate::protocol::ObjectId;

/// Bijection between local objects and their ids.
///
/// Ids are issued from a counter starting at 0 and never reused. Entries are
/// never removed, which also keeps every identity address pinned.
#[derive(Default)]
pub(crate) struct ObjectTable {
    by_identity: HashMap<usize, ObjectId>,
    by_id: HashMap<ObjectId, SharedObject>,
    next_id: u64,
}

impl ObjectTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Return the id of `object`, issuing one on first sight.
    ///
    /// Proxies are never interned; callers map them to their own reference.
    pub(crate) fn intern(&mut self, object: &SharedObject) -> ObjectId {
        let Some(identity) = object.identity() else {
            return self.insert(object.clone());
        };
        if let Some(id) = self.by_identity.get(&identity) {
            return *id;
        }
        let id = self.insert(object.clone());
        self.by_identity.insert(identity, id);
        id
    }

    fn insert(&mut self, object: SharedObject) -> ObjectId {
        let id = ObjectId::new(self.next_id);
        self.next_id += 1;
        self.by_id.insert(id, object);
        id
    }

    pub(crate) fn get(&self, id: ObjectId) -> Option<SharedObject> {
        self.by_id.get(&id).cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.by_id.len()
    }
}
