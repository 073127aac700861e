//! Live membership list, kept in join order.

use tokio::sync::Mutex;

use crate::message::User;

#[derive(Default)]
pub struct UserDirectory {
    users: Mutex<Vec<User>>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum InsertUserError {
    DuplicateId,
}

impl UserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `user` unless a user with the same id is already present.
    pub async fn insert(&self, user: User) -> Result<(), InsertUserError> {
        let mut users = self.users.lock().await;
        if users.iter().any(|known| known.id == user.id) {
            return Err(InsertUserError::DuplicateId);
        }
        users.push(user);
        Ok(())
    }

    pub async fn remove(&self, user_id: &str) -> Option<User> {
        let mut users = self.users.lock().await;
        let index = users.iter().position(|user| user.id == user_id)?;
        Some(users.remove(index))
    }

    pub async fn snapshot(&self) -> Vec<User> {
        self.users.lock().await.clone()
    }
}
