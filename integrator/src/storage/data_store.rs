use crate::core::{CoreError, Result};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Run-scoped key/value data shared between steps.
///
/// Values are stored as JSON so any serde type can be put in and taken out.
#[derive(Debug, Default)]
pub struct DataStore {
    values: DashMap<String, Value>,
}

impl DataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value).map_err(CoreError::Serialization)?;
        self.values.insert(key.to_string(), value);
        Ok(())
    }

    /// Returns `Ok(None)` when the key was never set.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(value) = self.values.get(key).map(|v| v.value().clone()) else {
            return Ok(None);
        };
        serde_json::from_value(value)
            .map(Some)
            .map_err(CoreError::Deserialization)
    }

    pub fn delete(&self, key: &str) -> bool {
        self.values.remove(key).is_some()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Account {
        id: String,
        seats: u32,
    }

    #[test]
    fn test_set_get_delete() {
        let store = DataStore::new();
        let account = Account {
            id: "acct-1".into(),
            seats: 5,
        };

        store.set("account", &account).unwrap();
        assert_eq!(store.get::<Account>("account").unwrap(), Some(account));

        assert!(store.delete("account"));
        assert_eq!(store.get::<Account>("account").unwrap(), None);
        assert!(!store.delete("account"));
    }

    #[test]
    fn test_get_with_wrong_type_fails() {
        let store = DataStore::new();
        store.set("n", &42).unwrap();

        assert!(matches!(
            store.get::<Account>("n"),
            Err(CoreError::Deserialization(_))
        ));
    }
}
