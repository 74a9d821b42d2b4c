//! Persistence callbacks (spec.md §4.1, §6, §9 "ephemeral state slots").
//!
//! When a home path is configured, state objects are read/written as
//! whole files named by [`StateObject::file_name`]. When no home path is
//! configured, they live in process-local in-memory slots — "a scoped
//! registry initialized at transport-init and torn down at transport-fini"
//! per spec.md §9, which here is simply the lifetime of a [`Store`] value
//! owned by the [`crate::host::Host`].

use std::fs;
use std::io;
use std::path::PathBuf;

use hashbrown::HashMap;

use crate::overlay::StateObject;

/// Backing store for the overlay's persistence callbacks.
pub enum Store {
    Files(PathBuf),
    Memory(HashMap<StateObject, Vec<u8>>),
}

impl Store {
    pub fn new(home: Option<PathBuf>) -> Store {
        match home {
            Some(dir) => Store::Files(dir),
            None => Store::Memory(HashMap::new()),
        }
    }

    /// `data = None` is a negative-length store, which deletes the object
    /// (spec.md §4.1: "Store with negative length ⇒ delete").
    pub fn put(&mut self, object: StateObject, data: Option<&[u8]>) -> io::Result<()> {
        match self {
            Store::Files(home) => {
                let path = home.join(object.file_name());
                match data {
                    Some(bytes) => fs::write(path, bytes),
                    None => match fs::remove_file(path) {
                        Ok(()) => Ok(()),
                        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                        Err(e) => Err(e),
                    },
                }
            }
            Store::Memory(slots) => {
                match data {
                    Some(bytes) => {
                        slots.insert(object, bytes.to_vec());
                    }
                    None => {
                        slots.remove(&object);
                    }
                }
                Ok(())
            }
        }
    }

    pub fn get(&self, object: StateObject) -> Option<Vec<u8>> {
        match self {
            Store::Files(home) => fs::read(home.join(object.file_name())).ok(),
            Store::Memory(slots) => slots.get(&object).cloned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_put_get_delete() {
        let mut store = Store::new(None);
        assert_eq!(store.get(StateObject::Planet), None);
        store.put(StateObject::Planet, Some(b"moonbase")).unwrap();
        assert_eq!(store.get(StateObject::Planet), Some(b"moonbase".to_vec()));
        store.put(StateObject::Planet, None).unwrap();
        assert_eq!(store.get(StateObject::Planet), None);
    }

    #[test]
    fn file_store_put_get_delete() {
        let dir = std::env::temp_dir().join(format!("zt-transport-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let mut store = Store::new(Some(dir.clone()));

        store
            .put(StateObject::IdentitySecret, Some(b"secretbytes"))
            .unwrap();
        assert_eq!(
            store.get(StateObject::IdentitySecret),
            Some(b"secretbytes".to_vec())
        );

        store.put(StateObject::IdentitySecret, None).unwrap();
        assert_eq!(store.get(StateObject::IdentitySecret), None);

        fs::remove_dir_all(&dir).ok();
    }
}
