use crate::error::StoreError;
use serde::{Deserialize, Serialize};
use std::{
    io,
    path::PathBuf,
    sync::Arc,
};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

const JOINED_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: i64,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub username: Option<String>,
    pub first_name: String,
    pub joined_date: String,
}

impl UserRecord {
    pub fn new(id: i64, username: Option<String>, first_name: impl Into<String>) -> Self {
        Self {
            id,
            username: username.filter(|u| !u.is_empty()),
            first_name: first_name.into(),
            joined_date: chrono::Local::now().format(JOINED_DATE_FORMAT).to_string(),
        }
    }
}

fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|v| !v.is_empty()))
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserList {
    #[serde(default)]
    pub users: Vec<UserRecord>,
}

/// JSON-backed list of users who sent `/start`.
///
/// Every read-modify-write goes through one async mutex, and writes replace
/// the file atomically, so concurrent `/start`s cannot lose records.
#[derive(Clone)]
pub struct UserStore {
    path: Arc<PathBuf>,
    write_lock: Arc<Mutex<()>>,
}

impl UserStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Arc::new(path.into()),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub async fn load(&self) -> Result<UserList, StoreError> {
        match tokio::fs::read(self.path.as_path()).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(UserList::default()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(UserList::default()),
            Err(err) => Err(err.into()),
        }
    }

    /// Adds the user unless their id is already present. Returns whether a
    /// record was written.
    #[instrument(skip(self, record), fields(user_id = record.id))]
    pub async fn track(&self, record: UserRecord) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut list = self.load().await?;
        if list.users.iter().any(|u| u.id == record.id) {
            debug!(event = "user_already_tracked");
            return Ok(false);
        }
        list.users.push(record);
        self.save(&list).await?;
        info!(event = "user_tracked", total_users = list.users.len());
        Ok(true)
    }

    async fn save(&self, list: &UserList) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let data = serde_json::to_vec_pretty(list)?;
        let mut tmp = self.path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, self.path.as_path()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, UserStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = UserStore::new(dir.path().join("user_data.json"));
        (dir, store)
    }

    fn data_file(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("user_data.json")
    }

    #[tokio::test]
    async fn missing_file_is_empty_list() {
        let (_dir, store) = store();
        assert!(store.load().await.unwrap().users.is_empty());
    }

    #[tokio::test]
    async fn tracking_twice_keeps_one_record() {
        let (_dir, store) = store();
        assert!(store
            .track(UserRecord::new(7, Some("alice".into()), "Alice"))
            .await
            .unwrap());
        assert!(!store
            .track(UserRecord::new(7, Some("renamed".into()), "Alice B"))
            .await
            .unwrap());
        let list = store.load().await.unwrap();
        assert_eq!(list.users.len(), 1);
        assert_eq!(list.users[0].username.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn concurrent_tracks_are_not_lost() {
        let (_dir, store) = store();
        let mut handles = Vec::new();
        for id in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.track(UserRecord::new(id, None, format!("user{id}"))).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(store.load().await.unwrap().users.len(), 20);
    }

    #[tokio::test]
    async fn reads_legacy_file_with_empty_username() {
        let (dir, store) = store();
        tokio::fs::write(
            data_file(&dir),
            r#"{"users": [{"id": 1, "username": "", "first_name": "A", "joined_date": "2024-01-01 10:00:00"}]}"#,
        )
        .await
        .unwrap();
        let list = store.load().await.unwrap();
        assert_eq!(list.users[0].username, None);
        assert_eq!(list.users[0].joined_date, "2024-01-01 10:00:00");
    }

    #[tokio::test]
    async fn corrupt_file_is_not_overwritten() {
        let (dir, store) = store();
        tokio::fs::write(data_file(&dir), "{not json").await.unwrap();
        let err = store.track(UserRecord::new(1, None, "A")).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)));
        assert_eq!(tokio::fs::read_to_string(data_file(&dir)).await.unwrap(), "{not json");
    }

    #[test]
    fn joined_date_uses_expected_layout() {
        let record = UserRecord::new(1, Some(String::new()), "A");
        assert_eq!(record.username, None);
        assert!(chrono::NaiveDateTime::parse_from_str(&record.joined_date, JOINED_DATE_FORMAT).is_ok());
    }
}
